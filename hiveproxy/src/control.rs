//! The control channel between the proxy halves.
//!
//! The first substream of the yamux session carries newline-delimited JSON
//! messages. The back-end issues `check-live` requests, the front-end answers
//! with `result`. A `cancel` aborts a probe that is still polling.

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader};

/// Transport setup failures of either proxy half.
#[derive(Debug, thiserror::Error)]
pub enum ProxyError {
    #[error("yamux transport: {0}")]
    Mux(#[from] tokio_yamux::error::Error),
    #[error("front-end closed before opening control stream")]
    NoControlStream,
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

#[derive(Debug, thiserror::Error)]
pub enum CheckLiveError {
    #[error("invalid probe address: {0}")]
    InvalidAddress(String),
    #[error("probe canceled")]
    Canceled,
    #[error("control channel closed")]
    ChannelClosed,
    #[error("{0}")]
    Remote(String),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "msg", rename_all = "kebab-case")]
pub(crate) enum ControlMsg {
    CheckLive { id: u64, addr: String },
    Cancel { id: u64 },
    Result { id: u64, ok: bool, error: Option<String> },
}

pub(crate) async fn write_msg<W>(w: &mut W, msg: &ControlMsg) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let mut line = serde_json::to_vec(msg)?;
    line.push(b'\n');
    w.write_all(&line).await?;
    w.flush().await
}

pub(crate) async fn read_msg<R>(r: &mut BufReader<R>) -> std::io::Result<Option<ControlMsg>>
where
    R: tokio::io::AsyncRead + Unpin,
{
    let mut line = String::new();
    let n = r.read_line(&mut line).await?;
    if n == 0 {
        return Ok(None);
    }
    let msg = serde_json::from_str(line.trim_end())?;
    Ok(Some(msg))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn control_roundtrip() {
        let (client, server) = tokio::io::duplex(1024);
        let (_, mut wr) = tokio::io::split(client);
        let (rd, _) = tokio::io::split(server);
        let mut rd = BufReader::new(rd);

        let sent = ControlMsg::CheckLive { id: 7, addr: "172.17.0.3:8545".into() };
        write_msg(&mut wr, &sent).await.unwrap();
        match read_msg(&mut rd).await.unwrap() {
            Some(ControlMsg::CheckLive { id, addr }) => {
                assert_eq!(id, 7);
                assert_eq!(addr, "172.17.0.3:8545");
            }
            other => panic!("unexpected message: {other:?}"),
        }
    }

    #[test]
    fn result_wire_format() {
        let msg = ControlMsg::Result { id: 1, ok: false, error: Some("canceled".into()) };
        let text = serde_json::to_string(&msg).unwrap();
        assert!(text.contains(r#""msg":"result""#), "got {text}");
    }
}

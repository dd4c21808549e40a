//! Proxy front-end: the half that runs inside the proxy container.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::StreamExt;
use tokio::io::{AsyncRead, AsyncWrite, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot};
use tokio_yamux::config::Config;
use tokio_yamux::session::Session;

use crate::control::{read_msg, write_msg, ControlMsg, ProxyError};
use crate::lock;

const DIAL_INTERVAL: Duration = Duration::from_millis(100);

/// Runs the proxy front-end over the given back-end connection.
///
/// HTTP is accepted on `listener`; every connection is relayed to the
/// back-end over its own substream. The function returns when the back-end
/// connection or the control channel closes.
pub async fn run_frontend<S>(conn: S, listener: TcpListener) -> Result<(), ProxyError>
where
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    let mut session = Session::new_client(conn, Config::default());
    let mut opener = session.control();

    // The session must be polled continuously to move bytes. The back-end
    // never opens substreams towards us, so inbound streams are dropped.
    let driver = tokio::spawn(async move {
        while let Some(next) = session.next().await {
            if let Err(err) = next {
                tracing::debug!(%err, "yamux session error");
                break;
            }
        }
    });

    // The first substream carries the control channel.
    let control = opener.open_stream().await?;
    let (control_rd, mut control_wr) = tokio::io::split(control);
    let mut control_rd = BufReader::new(control_rd);

    // Single writer task; probe tasks report through the channel.
    let (reply_tx, mut reply_rx) = mpsc::channel::<ControlMsg>(16);
    let writer = tokio::spawn(async move {
        while let Some(msg) = reply_rx.recv().await {
            if write_msg(&mut control_wr, &msg).await.is_err() {
                break;
            }
        }
    });

    // Relay loop for simulator HTTP traffic.
    let accept = tokio::spawn(async move {
        loop {
            let (sock, _) = match listener.accept().await {
                Ok(conn) => conn,
                Err(err) => {
                    tracing::warn!(%err, "accept failed");
                    break;
                }
            };
            let mut stream = match opener.open_stream().await {
                Ok(stream) => stream,
                Err(_) => break,
            };
            tokio::spawn(async move {
                let mut sock = sock;
                let _ = tokio::io::copy_bidirectional(&mut sock, &mut stream).await;
            });
        }
    });

    // Control loop: launch and cancel liveness probes.
    let probes: Arc<Mutex<HashMap<u64, oneshot::Sender<()>>>> = Default::default();
    while let Some(msg) = read_msg(&mut control_rd).await? {
        match msg {
            ControlMsg::CheckLive { id, addr } => {
                let (cancel_tx, cancel_rx) = oneshot::channel();
                lock(&probes).insert(id, cancel_tx);
                let reply_tx = reply_tx.clone();
                let probes = probes.clone();
                tokio::spawn(async move {
                    let reply = probe(&addr, cancel_rx).await;
                    lock(&probes).remove(&id);
                    let msg = match reply {
                        Ok(()) => ControlMsg::Result { id, ok: true, error: None },
                        Err(err) => ControlMsg::Result { id, ok: false, error: Some(err) },
                    };
                    let _ = reply_tx.send(msg).await;
                });
            }
            ControlMsg::Cancel { id } => {
                if let Some(cancel) = lock(&probes).remove(&id) {
                    let _ = cancel.send(());
                }
            }
            ControlMsg::Result { .. } => {
                tracing::warn!("unexpected result message on front-end");
            }
        }
    }

    accept.abort();
    writer.abort();
    driver.abort();
    Ok(())
}

/// Polls a TCP dial against `addr` every 100 ms until it succeeds or the
/// probe is canceled by the back-end.
async fn probe(addr: &str, mut cancel: oneshot::Receiver<()>) -> Result<(), String> {
    let addr: SocketAddr = addr
        .parse()
        .map_err(|_| format!("invalid probe address {addr:?}"))?;
    let mut ticker = tokio::time::interval(DIAL_INTERVAL);
    let mut last_msg = tokio::time::Instant::now();
    loop {
        tokio::select! {
            _ = &mut cancel => return Err("canceled".to_string()),
            _ = ticker.tick() => {
                if last_msg.elapsed() >= Duration::from_secs(1) {
                    tracing::info!(%addr, "checking address");
                    last_msg = tokio::time::Instant::now();
                }
                if let Ok(conn) = TcpStream::connect(addr).await {
                    drop(conn);
                    return Ok(());
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn probe_succeeds_once_port_opens() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (_cancel_tx, cancel_rx) = oneshot::channel();
        probe(&addr.to_string(), cancel_rx).await.unwrap();
    }

    #[tokio::test]
    async fn probe_cancel_reports_error() {
        // 203.0.113.0/24 is TEST-NET; nothing answers there.
        let (cancel_tx, cancel_rx) = oneshot::channel();
        let handle = tokio::spawn(async move { probe("203.0.113.1:1", cancel_rx).await });
        tokio::time::sleep(Duration::from_millis(50)).await;
        cancel_tx.send(()).unwrap();
        let res = handle.await.unwrap();
        assert_eq!(res, Err("canceled".to_string()));
    }

    #[tokio::test]
    async fn probe_rejects_bad_address() {
        let (_cancel_tx, cancel_rx) = oneshot::channel();
        let res = probe("not-an-address", cancel_rx).await;
        assert!(res.unwrap_err().contains("invalid probe address"));
    }
}

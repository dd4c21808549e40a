//! Proxy back-end: the orchestrator-side half.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::StreamExt;
use tokio::io::{AsyncRead, AsyncWrite, BufReader};
use tokio::sync::{mpsc, oneshot};
use tokio_yamux::config::Config;
use tokio_yamux::session::Session;
use tokio_yamux::stream::StreamHandle;

use crate::control::{read_msg, write_msg, CheckLiveError, ControlMsg, ProxyError};
use crate::lock;

/// Substreams opened by the front-end for simulator HTTP connections.
/// The orchestrator serves its API handler on each of them.
pub type IncomingStreams = mpsc::Receiver<StreamHandle>;

/// Handle to a running proxy back-end.
#[derive(Debug)]
pub struct Proxy {
    cmd_tx: mpsc::Sender<ControlMsg>,
    calls: Arc<Mutex<HashMap<u64, oneshot::Sender<Result<(), String>>>>>,
    call_id: AtomicU64,
}

impl Proxy {
    /// Starts the back-end over the given front-end connection, which is
    /// usually the attached stdio of the proxy container.
    ///
    /// The front-end opens the control substream first; every further
    /// substream is an HTTP connection and is handed out through the
    /// returned receiver.
    pub async fn run_backend<S>(conn: S) -> Result<(Proxy, IncomingStreams), ProxyError>
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let mut session = Session::new_server(conn, Config::default());
        let control = match session.next().await {
            Some(Ok(stream)) => stream,
            Some(Err(err)) => return Err(ProxyError::Io(err)),
            None => return Err(ProxyError::NoControlStream),
        };

        let (http_tx, http_rx) = mpsc::channel(16);
        tokio::spawn(async move {
            while let Some(next) = session.next().await {
                match next {
                    Ok(stream) => {
                        if http_tx.send(stream).await.is_err() {
                            break;
                        }
                    }
                    Err(err) => {
                        tracing::debug!(%err, "yamux session error");
                        break;
                    }
                }
            }
        });

        let (control_rd, mut control_wr) = tokio::io::split(control);
        let calls: Arc<Mutex<HashMap<u64, oneshot::Sender<Result<(), String>>>>> =
            Default::default();

        // Writer task: serializes all requests onto the control stream.
        let (cmd_tx, mut cmd_rx) = mpsc::channel::<ControlMsg>(16);
        tokio::spawn(async move {
            while let Some(msg) = cmd_rx.recv().await {
                if write_msg(&mut control_wr, &msg).await.is_err() {
                    break;
                }
            }
        });

        // Reader task: dispatches probe results to their waiters.
        let pending = calls.clone();
        tokio::spawn(async move {
            let mut rd = BufReader::new(control_rd);
            loop {
                match read_msg(&mut rd).await {
                    Ok(Some(ControlMsg::Result { id, ok, error })) => {
                        let waiter = lock(&pending).remove(&id);
                        if let Some(waiter) = waiter {
                            let result = if ok {
                                Ok(())
                            } else {
                                Err(error.unwrap_or_else(|| "probe failed".to_string()))
                            };
                            let _ = waiter.send(result);
                        }
                    }
                    Ok(Some(msg)) => {
                        tracing::warn!(?msg, "unexpected message on control stream")
                    }
                    Ok(None) | Err(_) => break,
                }
            }
            // Wake up anyone still waiting; the channel is gone.
            lock(&pending).clear();
        });

        let proxy = Proxy { cmd_tx, calls, call_id: AtomicU64::new(0) };
        Ok((proxy, http_rx))
    }

    /// Instructs the front-end to probe the given `ip:port` address from
    /// inside the docker network. Resolves once a TCP connection to the
    /// address succeeds. When `timeout` elapses first, the probe is canceled
    /// on the front-end and an error is returned.
    pub async fn check_live(&self, addr: String, timeout: Duration) -> Result<(), CheckLiveError> {
        let id = self.call_id.fetch_add(1, Ordering::Relaxed) + 1;
        let (tx, rx) = oneshot::channel();
        lock(&self.calls).insert(id, tx);
        self.cmd_tx
            .send(ControlMsg::CheckLive { id, addr })
            .await
            .map_err(|_| CheckLiveError::ChannelClosed)?;

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(Ok(()))) => Ok(()),
            Ok(Ok(Err(msg))) => Err(CheckLiveError::Remote(msg)),
            Ok(Err(_)) => Err(CheckLiveError::ChannelClosed),
            Err(_) => {
                lock(&self.calls).remove(&id);
                let _ = self.cmd_tx.send(ControlMsg::Cancel { id }).await;
                Err(CheckLiveError::Canceled)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    /// Connects a front-end and a back-end over an in-memory duplex pipe.
    async fn pair() -> (Proxy, IncomingStreams, std::net::SocketAddr) {
        let (back_io, front_io) = tokio::io::duplex(64 * 1024);
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let _ = crate::front::run_frontend(front_io, listener).await;
        });
        let (proxy, streams) = Proxy::run_backend(back_io).await.unwrap();
        (proxy, streams, addr)
    }

    #[tokio::test]
    async fn backend_requires_control_stream() {
        let (back_io, front_io) = tokio::io::duplex(1024);
        drop(front_io);
        Proxy::run_backend(back_io).await.unwrap_err();
    }

    #[tokio::test]
    async fn check_live_open_port() {
        let (proxy, _streams, _) = pair().await;
        let target = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let target_addr = target.local_addr().unwrap();
        proxy
            .check_live(target_addr.to_string(), Duration::from_secs(5))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn check_live_timeout_cancels() {
        let (proxy, _streams, _) = pair().await;
        let err = proxy
            .check_live("203.0.113.1:1".to_string(), Duration::from_millis(300))
            .await
            .unwrap_err();
        assert!(matches!(err, CheckLiveError::Canceled));
    }

    #[tokio::test]
    async fn relays_tcp_connections_as_substreams() {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        let (proxy, mut streams, front_addr) = pair().await;
        let mut client = tokio::net::TcpStream::connect(front_addr).await.unwrap();
        client.write_all(b"ping").await.unwrap();

        let mut stream = streams.recv().await.expect("no substream arrived");
        let mut buf = [0u8; 4];
        stream.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");

        stream.write_all(b"pong").await.unwrap();
        let mut buf = [0u8; 4];
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"pong");
        drop(proxy);
    }
}

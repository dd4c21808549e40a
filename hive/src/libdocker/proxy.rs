//! The simulation API server, reachable from the docker network.
//!
//! The API listener lives inside a helper container running the hiveproxy
//! front-end. Simulator HTTP connections arrive as yamux substreams over
//! the container's attached stdio, and each substream is served by the
//! axum router on the host side.

use std::net::{IpAddr, SocketAddr};

use async_trait::async_trait;
use bollard::container::{AttachContainerOptions, LogOutput};
use bollard::Docker;
use futures::StreamExt;
use hyper_util::rt::TokioIo;
use hyper_util::service::TowerToHyperService;
use tokio::task::JoinHandle;
use tokio_util::io::StreamReader;
use tracing::{debug, error, info};

use crate::libdocker::container::{DockerBackend, ProxySlot, PROXY_TAG};
use crate::libhive::backend::{labels, ApiServer, ContainerBackend, ContainerOptions};
use crate::libhive::errors::{HiveError, HiveResult};

pub(super) async fn serve_api(
    backend: &DockerBackend,
    handler: axum::Router,
) -> HiveResult<Box<dyn ApiServer>> {
    let opts = ContainerOptions {
        labels: [(labels::TYPE.to_string(), labels::TYPE_PROXY.to_string())].into(),
        ..Default::default()
    };
    let id = backend.create_container(PROXY_TAG, opts).await?;

    // Attach before start so no stdio frames are lost.
    let attach = backend
        .docker
        .attach_container(
            &id,
            Some(AttachContainerOptions::<String> {
                stdin: Some(true),
                stdout: Some(true),
                stderr: Some(true),
                stream: Some(true),
                ..Default::default()
            }),
        )
        .await?;
    if let Err(err) = backend.docker.start_container::<String>(&id, None).await {
        let _ = backend.delete_container(&id).await;
        return Err(err.into());
    }

    // Only stdout carries the multiplexed session. Front-end log output
    // arrives on stderr and is passed through to our own log.
    let stdout = attach.output.filter_map(|frame| async move {
        match frame {
            Ok(LogOutput::StdOut { message }) => Some(Ok(message)),
            Ok(LogOutput::StdErr { message }) => {
                debug!(target: "hiveproxy", "{}", String::from_utf8_lossy(&message).trim_end());
                None
            }
            Ok(_) => None,
            Err(err) => Some(Err(std::io::Error::other(err))),
        }
    });
    let conn = tokio::io::join(StreamReader::new(Box::pin(stdout)), attach.input);

    let (proxy, mut incoming) = hiveproxy::Proxy::run_backend(conn)
        .await
        .map_err(|err| HiveError::Other(format!("proxy handshake failed: {err}")))?;

    let inspect = backend.docker.inspect_container(&id, None).await?;
    let ip: IpAddr = inspect
        .network_settings
        .and_then(|settings| settings.ip_address)
        .and_then(|ip| ip.parse().ok())
        .ok_or_else(|| HiveError::Other("proxy container has no IP address".to_string()))?;
    let addr = SocketAddr::new(ip, hiveproxy::FRONTEND_PORT);
    info!(container = &id[..12], %addr, "API server is running");

    let serve_task = tokio::spawn(async move {
        while let Some(stream) = incoming.recv().await {
            let service = TowerToHyperService::new(handler.clone());
            tokio::spawn(async move {
                let result = hyper::server::conn::http1::Builder::new()
                    .serve_connection(TokioIo::new(stream), service)
                    .await;
                if let Err(err) = result {
                    debug!(%err, "API connection error");
                }
            });
        }
    });

    let slot = backend.proxy.clone();
    register(&slot, Some(std::sync::Arc::new(proxy)));
    Ok(Box::new(ProxyContainer {
        docker: backend.docker.clone(),
        container_id: id,
        addr,
        serve_task,
        slot,
    }))
}

fn register(slot: &ProxySlot, proxy: Option<std::sync::Arc<hiveproxy::Proxy>>) {
    match slot.lock() {
        Ok(mut guard) => *guard = proxy,
        Err(poisoned) => *poisoned.into_inner() = proxy,
    }
}

struct ProxyContainer {
    docker: Docker,
    container_id: String,
    addr: SocketAddr,
    serve_task: JoinHandle<()>,
    slot: ProxySlot,
}

#[async_trait]
impl ApiServer for ProxyContainer {
    fn addr(&self) -> SocketAddr {
        self.addr
    }

    async fn close(&self) -> HiveResult<()> {
        register(&self.slot, None);
        self.serve_task.abort();

        let opts = bollard::container::RemoveContainerOptions { force: true, ..Default::default() };
        match self.docker.remove_container(&self.container_id, Some(opts)).await {
            Ok(()) => {}
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 404, ..
            }) => {}
            Err(err) => {
                error!(container = &self.container_id[..12], %err, "can't remove proxy container");
                return Err(err.into());
            }
        }
        debug!(container = &self.container_id[..12], "API server stopped");
        Ok(())
    }
}

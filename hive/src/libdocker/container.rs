//! Container lifecycle operations against the docker engine.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bollard::container::{
    AttachContainerOptions, Config as ContainerConfig, CreateContainerOptions,
    ListContainersOptions, LogOutput, RemoveContainerOptions, UploadToContainerOptions,
    WaitContainerOptions,
};
use bollard::exec::{CreateExecOptions, StartExecResults};
use bollard::network::{
    ConnectNetworkOptions, CreateNetworkOptions, DisconnectNetworkOptions, InspectNetworkOptions,
    ListNetworksOptions,
};
use bollard::Docker;
use futures::StreamExt;
use tokio::io::AsyncWriteExt;
use tracing::{debug, error, info, warn};

use crate::libdocker::proxy;
use crate::libdocker::Config;
use crate::libhive::backend::{
    labels, ApiServer, Builder, ContainerBackend, ContainerInfo, ContainerOptions, ContainerWait,
    ExecInfo,
};
use crate::libhive::errors::{HiveError, HiveResult};

/// The image tag of the API proxy helper container.
pub const PROXY_TAG: &str = "hive/hiveproxy";

const DEFAULT_START_TIMEOUT: Duration = Duration::from_secs(60);

/// Shared registration slot for the running proxy back-end. The API server
/// handle clears it on close.
pub(super) type ProxySlot = Arc<Mutex<Option<Arc<hiveproxy::Proxy>>>>;

pub struct DockerBackend {
    pub(super) docker: Docker,
    pub(super) config: Arc<Config>,
    pub(super) proxy: ProxySlot,
}

impl DockerBackend {
    pub fn new(docker: Docker, config: Arc<Config>) -> Self {
        DockerBackend { docker, config, proxy: ProxySlot::default() }
    }

    fn proxy(&self) -> Option<Arc<hiveproxy::Proxy>> {
        match self.proxy.lock() {
            Ok(slot) => slot.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// Spawns the log pump and the wait task for a started container. The
    /// returned handle resolves only after the container has exited and its
    /// output stream is drained.
    async fn follow_container(
        &self,
        id: &str,
        opts: &ContainerOptions,
    ) -> HiveResult<ContainerWait> {
        let mut log_file = match &opts.log_file {
            Some(path) => {
                if let Some(parent) = path.parent() {
                    tokio::fs::create_dir_all(parent).await?;
                }
                Some(tokio::fs::File::create(path).await?)
            }
            None => None,
        };

        let attach = self
            .docker
            .attach_container(
                id,
                Some(AttachContainerOptions::<String> {
                    stdout: Some(true),
                    stderr: Some(true),
                    stream: Some(true),
                    ..Default::default()
                }),
            )
            .await?;

        let tee = self.config.print_container_output;
        let short_id = id[..12.min(id.len())].to_string();
        let pump = tokio::spawn(async move {
            let mut output = attach.output;
            while let Some(frame) = output.next().await {
                let data = match frame {
                    Ok(LogOutput::StdOut { message }) | Ok(LogOutput::StdErr { message }) => {
                        message
                    }
                    Ok(_) => continue,
                    Err(_) => break,
                };
                if let Some(file) = log_file.as_mut() {
                    if file.write_all(&data).await.is_err() {
                        log_file = None;
                    }
                }
                if tee {
                    eprint!("[{short_id}] {}", String::from_utf8_lossy(&data));
                }
            }
            if let Some(mut file) = log_file {
                let _ = file.flush().await;
            }
        });

        let docker = self.docker.clone();
        let cid = id.to_string();
        Ok(ContainerWait::new(async move {
            let mut wait = docker.wait_container(&cid, None::<WaitContainerOptions<String>>);
            match wait.next().await {
                Some(Ok(status)) => {
                    debug!(container = &cid[..12.min(cid.len())], code = status.status_code, "container exited")
                }
                Some(Err(err)) => debug!(container = &cid[..12.min(cid.len())], %err, "container wait failed"),
                None => {}
            }
            let _ = pump.await;
        }))
    }

    /// Probes `ip:port` from inside the container network, through the proxy
    /// when one is running and by dialing directly otherwise.
    async fn check_live(&self, ip: &str, port: u16, deadline: Duration) -> HiveResult<()> {
        if let Some(proxy) = self.proxy() {
            return proxy
                .check_live(format!("{ip}:{port}"), deadline)
                .await
                .map_err(|_| HiveError::CheckLive { port, timeout: deadline });
        }
        // No proxy in dev setups on a reachable bridge network.
        let addr = format!("{ip}:{port}");
        let dial = async {
            loop {
                if tokio::net::TcpStream::connect(&addr).await.is_ok() {
                    return;
                }
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
        };
        match tokio::time::timeout(deadline, dial).await {
            Ok(()) => Ok(()),
            Err(_) => Err(HiveError::CheckLive { port, timeout: deadline }),
        }
    }

    /// Finds containers of this or earlier hive runs by their instance
    /// labels and force-removes them. Returns the number of containers
    /// removed, or that would be removed in a dry run.
    pub async fn cleanup_containers(&self, opts: &CleanupOptions) -> HiveResult<usize> {
        let mut label_filters = vec![labels::INSTANCE.to_string()];
        if let Some(id) = &opts.instance_id {
            label_filters.push(format!("{}={id}", labels::INSTANCE));
        }
        if let Some(kind) = &opts.container_type {
            label_filters.push(format!("{}={kind}", labels::TYPE));
        }
        let list = self
            .docker
            .list_containers(Some(ListContainersOptions {
                all: true,
                filters: HashMap::from([("label".to_string(), label_filters)]),
                ..Default::default()
            }))
            .await?;

        let mut removed = 0;
        for container in list {
            let container_labels = container.labels.unwrap_or_default();
            if !old_enough(&container_labels, opts.older_than) {
                continue;
            }
            let Some(id) = container.id else { continue };
            let kind = container_labels
                .get(labels::TYPE)
                .map(String::as_str)
                .unwrap_or("unknown")
                .to_string();
            let short = id[..12.min(id.len())].to_string();
            if opts.dry_run {
                info!(container = %short, kind = %kind, "would remove container");
                removed += 1;
                continue;
            }
            let remove = RemoveContainerOptions { force: true, ..Default::default() };
            match self.docker.remove_container(&id, Some(remove)).await {
                Ok(()) => {
                    info!(container = %short, kind = %kind, "removed leftover container");
                    removed += 1;
                }
                Err(err) => error!(container = %short, %err, "can't remove leftover container"),
            }
        }
        Ok(removed)
    }
}

/// Filters for [`DockerBackend::cleanup_containers`].
#[derive(Debug, Default)]
pub struct CleanupOptions {
    /// Only containers of this hive instance. All instances when unset.
    pub instance_id: Option<String>,
    /// Only containers of this type (client, simulator, proxy).
    pub container_type: Option<String>,
    /// Only containers whose creation label is at least this old.
    pub older_than: Option<Duration>,
    /// Log what would be removed without removing anything.
    pub dry_run: bool,
}

/// With an age threshold set, only containers whose creation label parses
/// and is old enough qualify for removal.
fn old_enough(container_labels: &HashMap<String, String>, older_than: Option<Duration>) -> bool {
    let Some(min_age) = older_than else { return true };
    let Some(created) = container_labels.get(labels::CREATED) else { return false };
    match chrono::DateTime::parse_from_rfc3339(created) {
        Ok(ts) => {
            let age = chrono::Utc::now().signed_duration_since(ts);
            age.to_std().map(|age| age >= min_age).unwrap_or(false)
        }
        Err(_) => false,
    }
}

#[async_trait]
impl ContainerBackend for DockerBackend {
    async fn build(&self, builder: &dyn Builder) -> HiveResult<()> {
        builder.build_image(PROXY_TAG, hiveproxy::SOURCE).await
    }

    async fn serve_api(&self, handler: axum::Router) -> HiveResult<Box<dyn ApiServer>> {
        proxy::serve_api(self, handler).await
    }

    async fn create_container(&self, image: &str, opts: ContainerOptions) -> HiveResult<String> {
        let env: Vec<String> = opts.env.iter().map(|(k, v)| format!("{k}={v}")).collect();
        let config = ContainerConfig {
            image: Some(image.to_string()),
            env: Some(env),
            labels: Some(opts.labels.clone()),
            ..Default::default()
        };
        let create_opts = opts
            .name
            .as_ref()
            .map(|name| CreateContainerOptions { name: name.clone(), platform: None });
        let created = self.docker.create_container(create_opts, config).await?;
        debug!(image, container = &created.id[..12.min(created.id.len())], "created container");

        if !opts.files.is_empty() {
            if let Err(err) = self.upload_files(&created.id, &opts.files).await {
                let _ = self.delete_container(&created.id).await;
                return Err(err);
            }
        }
        Ok(created.id)
    }

    async fn start_container(
        &self,
        id: &str,
        opts: ContainerOptions,
    ) -> HiveResult<ContainerInfo> {
        let wait = self.follow_container(id, &opts).await?;
        self.docker.start_container::<String>(id, None).await?;

        let inspect = self.docker.inspect_container(id, None).await?;
        let settings = inspect.network_settings.unwrap_or_default();
        let ip = settings.ip_address.unwrap_or_default();
        let mac = settings.mac_address.unwrap_or_default();
        let info = ContainerInfo { id: id.to_string(), ip, mac, wait };

        if opts.check_live != 0 {
            let deadline = opts.start_timeout.unwrap_or(DEFAULT_START_TIMEOUT);
            let probe = self.check_live(&info.ip, opts.check_live, deadline);
            let exited = info.wait.clone();
            let result = tokio::select! {
                probe = probe => probe,
                () = exited.wait() => Err(HiveError::ContainerExited),
            };
            if let Err(err) = result {
                warn!(container = &id[..12.min(id.len())], %err, "container failed the liveness probe");
                let _ = self.delete_container(id).await;
                info.wait.wait().await;
                return Err(err);
            }
            debug!(container = &id[..12.min(id.len())], port = opts.check_live, "container is up");
        }
        Ok(info)
    }

    async fn delete_container(&self, id: &str) -> HiveResult<()> {
        let opts = RemoveContainerOptions { force: true, ..Default::default() };
        match self.docker.remove_container(id, Some(opts)).await {
            Ok(()) => Ok(()),
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 404, ..
            }) => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    async fn pause_container(&self, id: &str) -> HiveResult<()> {
        Ok(self.docker.pause_container(id).await?)
    }

    async fn unpause_container(&self, id: &str) -> HiveResult<()> {
        Ok(self.docker.unpause_container(id).await?)
    }

    async fn run_program(&self, id: &str, cmd: Vec<String>) -> HiveResult<ExecInfo> {
        let exec = self
            .docker
            .create_exec(
                id,
                CreateExecOptions {
                    cmd: Some(cmd),
                    attach_stdout: Some(true),
                    attach_stderr: Some(true),
                    ..Default::default()
                },
            )
            .await?;

        let mut stdout = Vec::new();
        let mut stderr = Vec::new();
        if let StartExecResults::Attached { mut output, .. } =
            self.docker.start_exec(&exec.id, None).await?
        {
            while let Some(frame) = output.next().await {
                match frame? {
                    LogOutput::StdOut { message } => stdout.extend_from_slice(&message),
                    LogOutput::StdErr { message } => stderr.extend_from_slice(&message),
                    _ => {}
                }
            }
        }

        let inspect = self.docker.inspect_exec(&exec.id).await?;
        Ok(ExecInfo {
            stdout: String::from_utf8_lossy(&stdout).into_owned(),
            stderr: String::from_utf8_lossy(&stderr).into_owned(),
            exit_code: inspect.exit_code.unwrap_or(0),
        })
    }

    async fn network_name_to_id(&self, name: &str) -> HiveResult<String> {
        let mut filters = HashMap::new();
        filters.insert("name".to_string(), vec![name.to_string()]);
        let networks =
            self.docker.list_networks(Some(ListNetworksOptions { filters })).await?;
        // The name filter matches substrings.
        networks
            .into_iter()
            .find(|net| net.name.as_deref() == Some(name))
            .and_then(|net| net.id)
            .ok_or(HiveError::NetworkNotFound)
    }

    async fn create_network(&self, name: &str) -> HiveResult<String> {
        let response = self
            .docker
            .create_network(CreateNetworkOptions {
                name: name.to_string(),
                check_duplicate: true,
                attachable: true,
                ..Default::default()
            })
            .await?;
        info!(network = name, "created docker network");
        response
            .id
            .ok_or_else(|| HiveError::Other(format!("network create returned no id for {name}")))
    }

    async fn remove_network(&self, id: &str) -> HiveResult<()> {
        let inspect = self
            .docker
            .inspect_network(id, Some(InspectNetworkOptions::<String> { verbose: true, ..Default::default() }))
            .await?;
        if let Some(containers) = inspect.containers {
            for container in containers.keys() {
                let opts = DisconnectNetworkOptions { container: container.clone(), force: true };
                if let Err(err) = self.docker.disconnect_network(id, opts).await {
                    error!(network = &id[..12.min(id.len())], container = &container[..12.min(container.len())],
                        %err, "can't disconnect container from network");
                }
            }
        }
        info!(network = &id[..12.min(id.len())], "removing docker network");
        Ok(self.docker.remove_network(id).await?)
    }

    async fn container_ip(&self, container_id: &str, network_id: &str) -> HiveResult<IpAddr> {
        let inspect = self.docker.inspect_container(container_id, None).await?;
        let networks = inspect
            .network_settings
            .and_then(|settings| settings.networks)
            .unwrap_or_default();
        let endpoint = networks
            .values()
            .find(|endpoint| endpoint.network_id.as_deref() == Some(network_id))
            .ok_or(HiveError::NetworkNotFound)?;
        endpoint
            .ip_address
            .as_deref()
            .and_then(|ip| ip.parse().ok())
            .ok_or_else(|| HiveError::Other("container has no IP on the network".to_string()))
    }

    async fn connect_container(&self, container_id: &str, network_id: &str) -> HiveResult<()> {
        let opts = ConnectNetworkOptions::<String> {
            container: container_id.to_string(),
            ..Default::default()
        };
        Ok(self.docker.connect_network(network_id, opts).await?)
    }

    async fn disconnect_container(&self, container_id: &str, network_id: &str) -> HiveResult<()> {
        let opts =
            DisconnectNetworkOptions { container: container_id.to_string(), force: false };
        Ok(self.docker.disconnect_network(network_id, opts).await?)
    }
}

impl DockerBackend {
    /// Packs the files into a tar archive and unpacks it at the container's
    /// filesystem root.
    async fn upload_files(
        &self,
        id: &str,
        files: &HashMap<String, Vec<u8>>,
    ) -> HiveResult<()> {
        let mut builder = tar::Builder::new(Vec::new());
        for (path, data) in files {
            let mut header = tar::Header::new_gnu();
            header.set_size(data.len() as u64);
            header.set_mode(0o644);
            header.set_cksum();
            // Entry names are relative to the extraction root.
            builder.append_data(&mut header, path.trim_start_matches('/'), data.as_slice())?;
        }
        let archive = builder.into_inner()?;
        let opts = UploadToContainerOptions { path: "/".to_string(), ..Default::default() };
        Ok(self.docker.upload_to_container(id, Some(opts), archive.into()).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn age_filter_requires_old_creation_label() {
        let hour = Duration::from_secs(3600);
        let recent = HashMap::from([(
            labels::CREATED.to_string(),
            chrono::Utc::now().to_rfc3339(),
        )]);
        let old = HashMap::from([(
            labels::CREATED.to_string(),
            (chrono::Utc::now() - chrono::Duration::hours(2)).to_rfc3339(),
        )]);
        let unlabeled = HashMap::new();
        let garbled =
            HashMap::from([(labels::CREATED.to_string(), "yesterday".to_string())]);

        // No threshold removes everything the label filter matched.
        assert!(old_enough(&recent, None));
        assert!(old_enough(&unlabeled, None));

        assert!(old_enough(&old, Some(hour)));
        assert!(!old_enough(&recent, Some(hour)));
        assert!(!old_enough(&unlabeled, Some(hour)));
        assert!(!old_enough(&garbled, Some(hour)));
    }
}

//! In-memory stand-ins for the container backend and builder. They record
//! every action and let tests override individual operations with hooks.

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;

use crate::libhive::backend::{
    ApiServer, Builder, ContainerBackend, ContainerInfo, ContainerOptions, ContainerWait,
    ExecInfo,
};
use crate::libhive::errors::{HiveError, HiveResult};
use crate::libhive::inventory::ClientDesignator;

type StartHook =
    Box<dyn Fn(&str, &ContainerOptions) -> HiveResult<ContainerInfo> + Send + Sync>;
type ExecHook = Box<dyn Fn(&str, &[String]) -> HiveResult<ExecInfo> + Send + Sync>;
type ReadFileHook = Box<dyn Fn(&str, &str) -> HiveResult<Vec<u8>> + Send + Sync>;

/// Overrides for individual [`FakeBackend`] operations.
#[derive(Default)]
pub struct BackendHooks {
    pub start_container: Option<StartHook>,
    pub run_program: Option<ExecHook>,
}

/// A [`ContainerBackend`] that runs nothing. Containers spring into
/// existence fully started and IPs are made up.
#[derive(Default)]
pub struct FakeBackend {
    pub hooks: BackendHooks,
    counter: AtomicU32,
    deleted: Mutex<Vec<String>>,
    paused: Mutex<Vec<String>>,
    created_networks: Mutex<HashMap<String, String>>,
    removed_networks: Mutex<Vec<String>>,
    connected: Mutex<Vec<String>>,
    disconnected: Mutex<Vec<String>>,
}

impl FakeBackend {
    fn next(&self) -> u32 {
        self.counter.fetch_add(1, Ordering::SeqCst)
    }

    pub fn deleted_containers(&self) -> Vec<String> {
        let mut v = lock(&self.deleted).clone();
        v.sort();
        v
    }

    pub fn paused_containers(&self) -> Vec<String> {
        lock(&self.paused).clone()
    }

    pub fn removed_networks(&self) -> Vec<String> {
        lock(&self.removed_networks).clone()
    }

    pub fn connected_containers(&self) -> Vec<String> {
        lock(&self.connected).clone()
    }

    pub fn disconnected_containers(&self) -> Vec<String> {
        lock(&self.disconnected).clone()
    }
}

#[async_trait]
impl ContainerBackend for FakeBackend {
    async fn build(&self, _builder: &dyn Builder) -> HiveResult<()> {
        Ok(())
    }

    async fn serve_api(&self, handler: axum::Router) -> HiveResult<Box<dyn ApiServer>> {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let task = tokio::spawn(async move {
            let _ = axum::serve(listener, handler).await;
        });
        Ok(Box::new(FakeApiServer { addr, task: Mutex::new(Some(task)) }))
    }

    async fn create_container(&self, _image: &str, _opts: ContainerOptions) -> HiveResult<String> {
        Ok(format!("fake-{}", self.next()))
    }

    async fn start_container(
        &self,
        id: &str,
        opts: ContainerOptions,
    ) -> HiveResult<ContainerInfo> {
        if let Some(hook) = &self.hooks.start_container {
            return hook(id, &opts);
        }
        let n = self.next();
        Ok(ContainerInfo {
            id: id.to_string(),
            ip: format!("192.0.2.{}", n % 250 + 1),
            mac: format!("02:00:00:00:00:{:02x}", n % 255),
            wait: ContainerWait::resolved(),
        })
    }

    async fn delete_container(&self, id: &str) -> HiveResult<()> {
        lock(&self.deleted).push(id.to_string());
        Ok(())
    }

    async fn pause_container(&self, id: &str) -> HiveResult<()> {
        lock(&self.paused).push(id.to_string());
        Ok(())
    }

    async fn unpause_container(&self, id: &str) -> HiveResult<()> {
        lock(&self.paused).retain(|p| p != id);
        Ok(())
    }

    async fn run_program(&self, id: &str, cmd: Vec<String>) -> HiveResult<ExecInfo> {
        if let Some(hook) = &self.hooks.run_program {
            return hook(id, &cmd);
        }
        Ok(ExecInfo { stdout: String::new(), stderr: String::new(), exit_code: 0 })
    }

    async fn network_name_to_id(&self, name: &str) -> HiveResult<String> {
        if name == "bridge" {
            return Ok("fakenet-bridge".to_string());
        }
        lock(&self.created_networks)
            .get(name)
            .cloned()
            .ok_or(HiveError::NetworkNotFound)
    }

    async fn create_network(&self, name: &str) -> HiveResult<String> {
        let id = format!("fakenet-{}", self.next());
        lock(&self.created_networks).insert(name.to_string(), id.clone());
        Ok(id)
    }

    async fn remove_network(&self, id: &str) -> HiveResult<()> {
        lock(&self.created_networks).retain(|_, v| v != id);
        lock(&self.removed_networks).push(id.to_string());
        Ok(())
    }

    async fn container_ip(&self, _container_id: &str, _network_id: &str) -> HiveResult<IpAddr> {
        Ok(IpAddr::from([192, 0, 2, 100]))
    }

    async fn connect_container(&self, container_id: &str, _network_id: &str) -> HiveResult<()> {
        lock(&self.connected).push(container_id.to_string());
        Ok(())
    }

    async fn disconnect_container(&self, container_id: &str, _network_id: &str) -> HiveResult<()> {
        lock(&self.disconnected).push(container_id.to_string());
        Ok(())
    }
}

struct FakeApiServer {
    addr: SocketAddr,
    task: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

#[async_trait]
impl ApiServer for FakeApiServer {
    fn addr(&self) -> SocketAddr {
        self.addr
    }

    async fn close(&self) -> HiveResult<()> {
        if let Some(task) = lock(&self.task).take() {
            task.abort();
        }
        Ok(())
    }
}

/// A [`Builder`] that builds nothing. Image names follow the real naming
/// convention so inventory-based code paths work unchanged.
#[derive(Default)]
pub struct FakeBuilder {
    pub read_file: Option<ReadFileHook>,
    built: Mutex<Vec<String>>,
    context_dir: Option<PathBuf>,
}

impl FakeBuilder {
    /// Makes `read_file` serve files from a directory instead of returning
    /// empty contents.
    pub fn with_context_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.context_dir = Some(dir.into());
        self
    }

    pub fn built_images(&self) -> Vec<String> {
        lock(&self.built).clone()
    }
}

#[async_trait]
impl Builder for FakeBuilder {
    async fn build_client_image(&self, client: &ClientDesignator) -> HiveResult<String> {
        let tag = format!("hive/clients/{}:latest", client.name());
        lock(&self.built).push(tag.clone());
        Ok(tag)
    }

    async fn build_simulator_image(&self, name: &str) -> HiveResult<String> {
        let tag = format!("hive/simulators/{name}:latest");
        lock(&self.built).push(tag.clone());
        Ok(tag)
    }

    async fn build_image(&self, tag: &str, _files: &[(&str, &[u8])]) -> HiveResult<()> {
        lock(&self.built).push(tag.to_string());
        Ok(())
    }

    async fn read_file(&self, image: &str, path: &str) -> HiveResult<Vec<u8>> {
        if let Some(hook) = &self.read_file {
            return hook(image, path);
        }
        if let Some(dir) = &self.context_dir {
            return Ok(std::fs::read(dir.join(path.trim_start_matches('/')))?);
        }
        Ok(Vec::new())
    }

    fn read_client_metadata(&self, _name: &str) -> HiveResult<crate::libhive::data::ClientMetadata> {
        Ok(crate::libhive::data::ClientMetadata::default())
    }
}

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    match m.lock() {
        Ok(g) => g,
        Err(poisoned) => poisoned.into_inner(),
    }
}

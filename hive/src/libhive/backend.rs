//! The contract between the orchestration plane and a container runtime.

use std::collections::HashMap;
use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;

use async_trait::async_trait;
use futures::future::{BoxFuture, Shared};
use futures::FutureExt;
use serde::{Deserialize, Serialize};

use crate::libhive::data::ClientMetadata;
use crate::libhive::errors::HiveResult;
use crate::libhive::inventory::ClientDesignator;

/// Container labels used to find and clean up containers belonging to a
/// hive instance.
pub mod labels {
    pub const INSTANCE: &str = "hive.instance";
    pub const VERSION: &str = "hive.version";
    pub const CREATED: &str = "hive.created";
    pub const TYPE: &str = "hive.type";
    pub const TEST_SUITE: &str = "hive.testsuite";
    pub const TEST_CASE: &str = "hive.testcase";
    pub const CLIENT_NAME: &str = "hive.client";

    pub const TYPE_CLIENT: &str = "client";
    pub const TYPE_SIMULATOR: &str = "simulator";
    pub const TYPE_PROXY: &str = "proxy";

    /// Base labels carried by every container this instance starts. The
    /// creation timestamp enables age-based cleanup of leftovers.
    pub fn base(instance_id: &str) -> std::collections::HashMap<String, String> {
        std::collections::HashMap::from([
            (INSTANCE.to_string(), instance_id.to_string()),
            (VERSION.to_string(), env!("CARGO_PKG_VERSION").to_string()),
            (CREATED.to_string(), chrono::Utc::now().to_rfc3339()),
        ])
    }
}

/// Launch parameters for containers.
#[derive(Clone, Default)]
pub struct ContainerOptions {
    pub env: HashMap<String, String>,
    /// Files placed into the container's filesystem before its main process
    /// starts. Keys are absolute destination paths.
    pub files: HashMap<String, Vec<u8>>,
    /// If set, container stdout and stderr are appended to this file until
    /// the container exits.
    pub log_file: Option<PathBuf>,
    /// TCP port that must accept a connection before the start call
    /// resolves. `0` disables the probe.
    pub check_live: u16,
    /// Deadline for the liveness probe. Defaults to 60 seconds.
    pub start_timeout: Option<std::time::Duration>,
    pub name: Option<String>,
    pub labels: HashMap<String, String>,
}

/// Returned by `start_container`.
#[derive(Clone)]
pub struct ContainerInfo {
    pub id: String,
    pub ip: String,
    pub mac: String,
    /// Resolves when the container has stopped and its log plumbing is
    /// closed. Must be retained for every started container to avoid
    /// leaking the log stream.
    pub wait: ContainerWait,
}

/// A cloneable handle that resolves once a container has terminated. The
/// completion of the underlying task is the single source of truth for
/// "container has exited".
#[derive(Clone)]
pub struct ContainerWait(Shared<BoxFuture<'static, ()>>);

impl ContainerWait {
    pub fn new<F>(fut: F) -> Self
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        ContainerWait(fut.boxed().shared())
    }

    /// A handle that is already resolved, for containers that never ran.
    pub fn resolved() -> Self {
        ContainerWait(futures::future::ready(()).boxed().shared())
    }

    pub async fn wait(&self) {
        self.0.clone().await
    }
}

impl fmt::Debug for ContainerWait {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("ContainerWait")
    }
}

/// Output of a program executed inside a container.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecInfo {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i64,
}

/// Handle for the simulation API server.
#[async_trait]
pub trait ApiServer: Send + Sync {
    /// The address on which containers in the default network reach the API.
    fn addr(&self) -> SocketAddr;
    /// Stops the server. Safe to call more than once.
    async fn close(&self) -> HiveResult<()>;
}

/// Captures the container engine interactions of the simulation API.
/// Implementations must be safe for concurrent use.
#[async_trait]
pub trait ContainerBackend: Send + Sync {
    /// Hook for building internal helper images (the proxy). Called before
    /// anything else in the simulation run.
    async fn build(&self, builder: &dyn Builder) -> HiveResult<()>;

    /// Starts the simulation API server, reachable from containers on the
    /// default network.
    async fn serve_api(&self, handler: axum::Router) -> HiveResult<Box<dyn ApiServer>>;

    async fn create_container(&self, image: &str, opts: ContainerOptions) -> HiveResult<String>;

    /// Starts a created container. When `opts.check_live` is nonzero, does
    /// not resolve until that TCP port accepts a connection from inside
    /// the container network, the container exits, or the deadline passes;
    /// in the two failure cases the container is deleted before returning.
    async fn start_container(&self, id: &str, opts: ContainerOptions)
        -> HiveResult<ContainerInfo>;

    /// Removes the container forcibly. Idempotent.
    async fn delete_container(&self, id: &str) -> HiveResult<()>;
    async fn pause_container(&self, id: &str) -> HiveResult<()>;
    async fn unpause_container(&self, id: &str) -> HiveResult<()>;

    /// Runs a command in the given container, returning outputs and exit code.
    async fn run_program(&self, id: &str, cmd: Vec<String>) -> HiveResult<ExecInfo>;

    async fn network_name_to_id(&self, name: &str) -> HiveResult<String>;
    async fn create_network(&self, name: &str) -> HiveResult<String>;
    /// Disconnects every attached container, then removes the network.
    async fn remove_network(&self, id: &str) -> HiveResult<()>;
    async fn container_ip(&self, container_id: &str, network_id: &str) -> HiveResult<IpAddr>;
    async fn connect_container(&self, container_id: &str, network_id: &str) -> HiveResult<()>;
    async fn disconnect_container(&self, container_id: &str, network_id: &str)
        -> HiveResult<()>;
}

/// Builds docker images of clients, simulators and helpers.
#[async_trait]
pub trait Builder: Send + Sync {
    /// Builds the client's image, passing branch/user/repo/dockerfile build
    /// arguments, and returns the image tag.
    async fn build_client_image(&self, client: &ClientDesignator) -> HiveResult<String>;

    /// Builds a simulator image and returns the image tag.
    async fn build_simulator_image(&self, name: &str) -> HiveResult<String>;

    /// Builds an image from an in-memory source tree.
    async fn build_image(&self, tag: &str, files: &[(&str, &[u8])]) -> HiveResult<()>;

    /// Returns the content of a file in the given image.
    async fn read_file(&self, image: &str, path: &str) -> HiveResult<Vec<u8>>;

    /// Reads the `hive.yaml` sidecar next to the client's Dockerfile.
    fn read_client_metadata(&self, name: &str) -> HiveResult<ClientMetadata>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn base_labels_carry_cleanup_metadata() {
        let base = labels::base("abc123");
        assert_eq!(base[labels::INSTANCE], "abc123");
        assert_eq!(base[labels::VERSION], env!("CARGO_PKG_VERSION"));
        let created = chrono::DateTime::parse_from_rfc3339(&base[labels::CREATED]).unwrap();
        assert!(chrono::Utc::now().signed_duration_since(created).num_seconds() < 60);
    }

    #[tokio::test]
    async fn wait_handle_resolves_for_all_clones() {
        let (tx, rx) = tokio::sync::oneshot::channel::<()>();
        let wait = ContainerWait::new(async move {
            let _ = rx.await;
        });
        let clone = wait.clone();
        tx.send(()).expect("receiver dropped");
        wait.wait().await;
        clone.wait().await;
    }
}

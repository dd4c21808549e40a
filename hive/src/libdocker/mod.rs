//! The docker implementation of the container backend and builder.

pub mod builder;
pub mod container;
mod proxy;

use std::sync::Arc;

use bollard::Docker;
use tracing::debug;

use crate::libhive::errors::{HiveError, HiveResult};
use crate::libhive::inventory::Inventory;

pub use builder::DockerBuilder;
pub use container::{CleanupOptions, DockerBackend};

/// Configuration of the docker backend.
#[derive(Default)]
pub struct Config {
    pub inventory: Inventory,

    /// Image builds whose tag matches the pattern bypass the docker cache.
    pub nocache_pattern: Option<regex::Regex>,

    /// Forces pulling of base images when building clients and simulators.
    pub pull_enabled: bool,

    /// Mirror container output onto the orchestrator's stdout, each line
    /// tagged with the container id.
    pub print_container_output: bool,

    /// Mirror docker build output onto stderr.
    pub print_build_output: bool,
}

/// Connects to the docker daemon at the given endpoint and returns the
/// builder and backend sharing the connection.
pub async fn connect(endpoint: &str, cfg: Config) -> HiveResult<(DockerBuilder, DockerBackend)> {
    let client = if endpoint.is_empty() {
        Docker::connect_with_local_defaults()
    } else if let Some(path) = endpoint.strip_prefix("unix://") {
        Docker::connect_with_unix(path, 600, bollard::API_DEFAULT_VERSION)
    } else {
        Docker::connect_with_http(endpoint, 600, bollard::API_DEFAULT_VERSION)
    }
    .map_err(|err| HiveError::Other(format!("can't connect to docker: {err}")))?;

    let version = client
        .version()
        .await
        .map_err(|err| HiveError::Other(format!("can't get docker version: {err}")))?;
    debug!(version = version.version.as_deref().unwrap_or("unknown"), "docker daemon online");

    let config = Arc::new(cfg);
    let builder = DockerBuilder::new(client.clone(), config.clone());
    let backend = DockerBackend::new(client, config);
    Ok((builder, backend))
}

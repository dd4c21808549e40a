//! Image builds through the docker engine API.

use std::collections::HashMap;
use std::io::Read;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use bollard::container::{DownloadFromContainerOptions, RemoveContainerOptions};
use bollard::image::BuildImageOptions;
use bollard::Docker;
use futures::StreamExt;
use tracing::{error, info};

use crate::libdocker::Config;
use crate::libhive::backend::Builder;
use crate::libhive::data::ClientMetadata;
use crate::libhive::errors::{HiveError, HiveResult};
use crate::libhive::inventory::ClientDesignator;

pub struct DockerBuilder {
    docker: Docker,
    config: Arc<Config>,
}

impl DockerBuilder {
    pub fn new(docker: Docker, config: Arc<Config>) -> Self {
        DockerBuilder { docker, config }
    }

    /// Streams the build job and collects its outcome. Build output is
    /// echoed to stderr when configured.
    async fn run_build(
        &self,
        opts: BuildImageOptions<String>,
        context: Vec<u8>,
    ) -> HiveResult<()> {
        let tag = opts.t.clone();
        let mut stream = self.docker.build_image(opts, None, Some(context.into()));
        while let Some(msg) = stream.next().await {
            let info = msg.map_err(|err| HiveError::Build {
                image: tag.clone(),
                reason: err.to_string(),
            })?;
            if let Some(output) = info.stream {
                if self.config.print_build_output {
                    eprint!("{output}");
                }
            }
            if let Some(reason) = info.error {
                error!(image = %tag, %reason, "image build failed");
                return Err(HiveError::Build { image: tag, reason });
            }
        }
        Ok(())
    }

    fn build_options(&self, tag: &str, dockerfile: String) -> BuildImageOptions<String> {
        let nocache = self
            .config
            .nocache_pattern
            .as_ref()
            .is_some_and(|re| re.is_match(tag));
        BuildImageOptions {
            t: tag.to_string(),
            dockerfile,
            nocache,
            pull: self.config.pull_enabled,
            rm: true,
            ..Default::default()
        }
    }

    async fn build_dir(
        &self,
        dir: &Path,
        dockerfile: String,
        tag: &str,
        buildargs: Vec<(String, String)>,
    ) -> HiveResult<()> {
        let mut opts = self.build_options(tag, dockerfile);
        opts.buildargs = buildargs.into_iter().collect();
        info!(image = tag, dir = %dir.display(), nocache = opts.nocache, pull = opts.pull,
            "building image");
        let context = tar_directory(dir)?;
        self.run_build(opts, context).await
    }
}

#[async_trait]
impl Builder for DockerBuilder {
    async fn build_client_image(&self, client: &ClientDesignator) -> HiveResult<String> {
        let dir = self.config.inventory.client_directory(client);
        let tag = format!("hive/clients/{}:latest", image_name(&client.name()));
        self.build_dir(&dir, client.dockerfile_name(), &tag, client.build_args()).await?;
        Ok(tag)
    }

    async fn build_simulator_image(&self, name: &str) -> HiveResult<String> {
        let dir = self.config.inventory.simulator_directory(name);
        let tag = format!("hive/simulators/{}:latest", image_name(name));
        self.build_dir(&dir, "Dockerfile".to_string(), &tag, Vec::new()).await?;
        Ok(tag)
    }

    async fn build_image(&self, tag: &str, files: &[(&str, &[u8])]) -> HiveResult<()> {
        let opts = self.build_options(tag, "Dockerfile".to_string());
        info!(image = tag, "building image from embedded source");
        let context = tar_files(files)?;
        self.run_build(opts, context).await
    }

    /// Creates a throwaway container for the image and downloads the file
    /// from it.
    async fn read_file(&self, image: &str, path: &str) -> HiveResult<Vec<u8>> {
        let created = self
            .docker
            .create_container::<String, String>(
                None,
                bollard::container::Config { image: Some(image.to_string()), ..Default::default() },
            )
            .await?;

        let result = self.download_file(&created.id, path).await;

        let remove = RemoveContainerOptions { force: true, ..Default::default() };
        if let Err(err) = self.docker.remove_container(&created.id, Some(remove)).await {
            error!(container = &created.id[..12], %err, "can't remove temporary container");
        }
        result
    }

    fn read_client_metadata(&self, name: &str) -> HiveResult<ClientMetadata> {
        let dir = self
            .config
            .inventory
            .client_directory(&ClientDesignator { client: name.to_string(), ..Default::default() });
        let path = dir.join("hive.yaml");
        let data = match std::fs::read(&path) {
            Ok(data) => data,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Ok(ClientMetadata::default());
            }
            Err(err) => {
                return Err(HiveError::Inventory(format!(
                    "failed to read hive metadata file in {}: {err}",
                    dir.display()
                )));
            }
        };
        serde_yaml::from_slice(&data).map_err(|err| {
            HiveError::Inventory(format!(
                "failed to decode hive metadata file in {}: {err}",
                dir.display()
            ))
        })
    }
}

impl DockerBuilder {
    async fn download_file(&self, container: &str, path: &str) -> HiveResult<Vec<u8>> {
        let opts = DownloadFromContainerOptions { path: path.to_string() };
        let mut stream = self.docker.download_from_container(container, Some(opts));
        let mut archive = Vec::new();
        while let Some(chunk) = stream.next().await {
            archive.extend_from_slice(&chunk?);
        }

        // The engine returns the file wrapped in a tar archive.
        let want = path.trim_start_matches('/');
        let mut reader = tar::Archive::new(archive.as_slice());
        for entry in reader.entries()? {
            let mut entry = entry?;
            if entry.path()?.to_string_lossy() == want {
                let mut content = Vec::new();
                entry.read_to_end(&mut content)?;
                return Ok(content);
            }
        }
        Err(HiveError::Other(format!("file {path} not found in image")))
    }
}

/// Image tags only permit a restricted character set, while client
/// designators contain `:` separators.
fn image_name(name: &str) -> String {
    name.to_lowercase()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || "_-.".contains(c) { c } else { '_' })
        .collect()
}

fn tar_directory(dir: &Path) -> HiveResult<Vec<u8>> {
    let mut builder = tar::Builder::new(Vec::new());
    builder.follow_symlinks(true);
    builder.append_dir_all(".", dir)?;
    Ok(builder.into_inner()?)
}

fn tar_files(files: &[(&str, &[u8])]) -> HiveResult<Vec<u8>> {
    let mut builder = tar::Builder::new(Vec::new());
    for (path, data) in files {
        let mut header = tar::Header::new_gnu();
        header.set_size(data.len() as u64);
        header.set_mode(0o644);
        header.set_cksum();
        builder.append_data(&mut header, path, *data)?;
    }
    Ok(builder.into_inner()?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn image_names_are_sanitized() {
        assert_eq!(image_name("go-ethereum"), "go-ethereum");
        assert_eq!(image_name("besu_u:hyperledger_main"), "besu_u_hyperledger_main");
        assert_eq!(image_name("devp2p/discv4"), "devp2p_discv4");
    }

    #[test]
    fn embedded_source_tar_roundtrips() {
        let files: &[(&str, &[u8])] = &[("Dockerfile", b"FROM scratch"), ("src/main.rs", b"fn main() {}")];
        let data = tar_files(files).unwrap();
        let mut archive = tar::Archive::new(data.as_slice());
        let names: Vec<String> = archive
            .entries()
            .unwrap()
            .map(|e| e.unwrap().path().unwrap().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec!["Dockerfile".to_string(), "src/main.rs".to_string()]);
    }
}

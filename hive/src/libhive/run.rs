//! The run loop: builds images, launches simulators and collects results.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::libhive::api;
use crate::libhive::backend::{labels, Builder, ContainerBackend, ContainerOptions};
use crate::libhive::data::{ClientDefinition, HiveInstance, SimEnv, SimResult};
use crate::libhive::errors::{HiveError, HiveResult};
use crate::libhive::inventory::{ClientDesignator, Inventory};
use crate::libhive::testmanager::TestManager;

/// Outcome of a single simulator run. The tally covers whatever suites
/// finished, even when the run was cut short.
#[derive(Debug)]
pub struct SimRun {
    pub result: SimResult,
    /// Set when the run ended on the duration limit or an interrupt rather
    /// than the simulator exiting on its own.
    pub end_reason: Option<HiveError>,
}

/// Executes simulation runs.
pub struct Runner {
    inv: Inventory,
    builder: Arc<dyn Builder>,
    backend: Arc<dyn ContainerBackend>,

    sim_images: HashMap<String, String>,
    client_defs: Vec<ClientDefinition>,
}

impl Runner {
    pub fn new(
        inv: Inventory,
        builder: Arc<dyn Builder>,
        backend: Arc<dyn ContainerBackend>,
    ) -> Self {
        Runner {
            inv,
            builder,
            backend,
            sim_images: HashMap::new(),
            client_defs: Vec::new(),
        }
    }

    /// Builds the backend helper images and all client and simulator images
    /// needed for the run.
    pub async fn build(
        &mut self,
        clients: &[ClientDesignator],
        simulators: &[String],
    ) -> HiveResult<()> {
        self.backend.build(self.builder.as_ref()).await?;
        self.build_clients(clients).await?;
        self.build_simulators(simulators).await
    }

    /// Builds client images. A client failing to build is skipped so the
    /// others can still run; only a fully failed build set aborts.
    async fn build_clients(&mut self, clients: &[ClientDesignator]) -> HiveResult<()> {
        if clients.is_empty() {
            return Err(HiveError::Other(
                "client list is empty, cannot simulate".to_string(),
            ));
        }
        info!("building {} clients...", clients.len());
        self.client_defs.clear();
        for client in clients {
            let image = match self.builder.build_client_image(client).await {
                Ok(image) => image,
                Err(err) => {
                    error!(client = %client.name(), %err, "client build failed");
                    continue;
                }
            };
            let version = match self.builder.read_file(&image, "/version.txt").await {
                Ok(data) => String::from_utf8_lossy(&data).trim().to_string(),
                Err(err) => {
                    warn!(client = %client.client, %image, %err, "can't read version info");
                    String::new()
                }
            };
            let meta = self.builder.read_client_metadata(&client.client)?;
            self.client_defs.push(ClientDefinition {
                name: client.name(),
                version,
                image,
                meta,
            });
        }
        if self.client_defs.is_empty() {
            return Err(HiveError::NoClientsBuilt);
        }
        Ok(())
    }

    async fn build_simulators(&mut self, simulators: &[String]) -> HiveResult<()> {
        info!("building {} simulators...", simulators.len());
        for sim in simulators {
            let image = self.builder.build_simulator_image(sim).await?;
            self.sim_images.insert(sim.clone(), image);
        }
        Ok(())
    }

    pub fn client_definitions(&self) -> &[ClientDefinition] {
        &self.client_defs
    }

    /// Runs one simulator to completion and returns the result tally.
    /// Backend failures are propagated after teardown; a run cut short by
    /// the duration limit or an interrupt still yields its tally, with the
    /// cause in [`SimRun::end_reason`].
    pub async fn run(
        &self,
        cancel: &CancellationToken,
        sim: &str,
        env: SimEnv,
    ) -> HiveResult<SimRun> {
        create_workspace(&env.log_dir)?;
        write_instance_info(&env.log_dir);
        self.run_sim(cancel, sim, env).await
    }

    async fn run_sim(
        &self,
        cancel: &CancellationToken,
        sim: &str,
        env: SimEnv,
    ) -> HiveResult<SimRun> {
        info!("running simulation: {sim}");
        let image = self
            .sim_images
            .get(sim)
            .ok_or_else(|| HiveError::Other(format!("simulator {sim:?} not built")))?;

        let manager = TestManager::new(env.clone(), self.backend.clone(), self.client_defs.clone());

        debug!("starting simulator API server");
        let server = self.backend.serve_api(api::router(manager.clone())).await?;

        let mut sim_cid = None;
        let result = self
            .drive_simulator(cancel, sim, image, &env, &manager, server.addr(), &mut sim_cid)
            .await;

        manager.terminate_with(matches!(result, Err(HiveError::SimTimeout))).await;
        if let Some(cid) = sim_cid {
            debug!("deleting simulator container");
            if let Err(err) = self.backend.delete_container(&cid).await {
                error!(%err, "can't delete simulator container");
            }
        }
        if let Err(err) = server.close().await {
            debug!(%err, "API server shutdown failed");
        }

        let end_reason = match result {
            Ok(()) => None,
            Err(err @ (HiveError::SimTimeout | HiveError::Interrupted)) => {
                info!(%err, "simulation ended early");
                Some(err)
            }
            Err(err) => return Err(err),
        };
        Ok(SimRun { result: tally(&manager), end_reason })
    }

    /// Creates and starts the simulator container, then waits for it to
    /// exit, the duration limit to fire, or cancellation. The created
    /// container's id is stored in `sim_cid` for teardown by the caller.
    #[allow(clippy::too_many_arguments)]
    async fn drive_simulator(
        &self,
        cancel: &CancellationToken,
        sim: &str,
        image: &str,
        env: &SimEnv,
        manager: &Arc<TestManager>,
        api_addr: SocketAddr,
        sim_cid: &mut Option<String>,
    ) -> Result<(), HiveError> {
        let mut sim_labels = labels::base(manager.instance_id());
        sim_labels.insert(labels::TYPE.into(), labels::TYPE_SIMULATOR.into());

        let mut opts = ContainerOptions {
            env: HashMap::from([
                ("HIVE_SIMULATOR".to_string(), format!("http://{api_addr}")),
                ("HIVE_PARALLELISM".to_string(), env.sim_parallelism.to_string()),
                ("HIVE_LOGLEVEL".to_string(), env.sim_log_level.to_string()),
                ("HIVE_TEST_PATTERN".to_string(), env.sim_test_pattern.clone()),
            ]),
            labels: sim_labels,
            name: Some(format!(
                "hive-{}-sim-{}-{:x}",
                manager.instance_id(),
                sim.replace(['/', ':'], "_"),
                rand::random::<u32>()
            )),
            ..Default::default()
        };
        let container_id = self.backend.create_container(image, opts.clone()).await?;
        *sim_cid = Some(container_id.clone());

        let log_basename =
            format!("{}-simulator-{}.log", chrono::Utc::now().timestamp(), container_id);
        opts.log_file = Some(env.log_dir.join(&log_basename));
        manager.set_simulator_container(&container_id, &log_basename);

        debug!("starting simulator container");
        let duration_limit = async {
            match env.sim_duration_limit {
                Some(limit) => tokio::time::sleep(limit).await,
                None => std::future::pending().await,
            }
        };
        let info = self.backend.start_container(&container_id, opts).await?;
        debug!(sim, container = &info.id[..info.id.len().min(8)], "started simulator");
        tokio::select! {
            _ = info.wait.wait() => Ok(()),
            _ = duration_limit => {
                info!(sim, "simulation timed out");
                Err(HiveError::SimTimeout)
            }
            _ = cancel.cancelled() => {
                info!(sim, "interrupted, shutting down");
                Err(HiveError::Interrupted)
            }
        }
    }

    /// Simulator development mode. No simulator container is launched; the
    /// API listens on a host endpoint for an out-of-band simulator process.
    /// The proxy still runs so client liveness checks work.
    pub async fn run_dev_mode(
        &self,
        cancel: &CancellationToken,
        env: SimEnv,
        endpoint: SocketAddr,
    ) -> HiveResult<()> {
        create_workspace(&env.log_dir)?;
        let manager = TestManager::new(env, self.backend.clone(), self.client_defs.clone());

        debug!("starting simulator API proxy");
        let proxy = self.backend.serve_api(api::router(manager.clone())).await?;

        debug!("starting local API server");
        let listener = tokio::net::TcpListener::bind(endpoint).await?;
        let addr = listener.local_addr()?;
        let local_cancel = cancel.clone();
        let router = api::router(manager.clone());
        let server = tokio::spawn(async move {
            let shutdown = async move { local_cancel.cancelled().await };
            let _ = axum::serve(listener, router).with_graceful_shutdown(shutdown).await;
        });

        println!(
            "---\nWelcome to hive --dev mode. Run with me:\n\nHIVE_SIMULATOR=http://{addr}\n---"
        );

        cancel.cancelled().await;
        let _ = server.await;
        manager.terminate().await;
        if let Err(err) = proxy.close().await {
            debug!(%err, "API proxy shutdown failed");
        }
        Ok(())
    }
}

fn tally(manager: &TestManager) -> SimResult {
    let mut result = SimResult::default();
    for suite in manager.results() {
        result.suites += 1;
        let mut suite_fail_counted = false;
        for case in suite.test_cases.values() {
            result.tests += 1;
            if !case.summary_result.pass {
                result.tests_failed += 1;
                if !suite_fail_counted {
                    result.suites_failed += 1;
                    suite_fail_counted = true;
                }
            }
        }
    }
    result
}

/// Ensures the output directory exists.
fn create_workspace(log_dir: &Path) -> HiveResult<()> {
    match std::fs::metadata(log_dir) {
        Ok(stat) if stat.is_dir() => Ok(()),
        Ok(_) => Err(HiveError::Other("log output directory is a file".to_string())),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            info!(folder = %log_dir.display(), "creating output directory");
            Ok(std::fs::create_dir_all(log_dir)?)
        }
        Err(err) => Err(err.into()),
    }
}

fn write_instance_info(log_dir: &Path) {
    let info = HiveInstance::current();
    match serde_json::to_vec(&info) {
        Ok(data) => {
            if let Err(err) = std::fs::write(log_dir.join("hive.json"), data) {
                warn!(%err, "can't write hive.json");
            }
        }
        Err(err) => warn!(%err, "can't encode hive.json"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::libhive::data::TestResult;
    use crate::libhive::fakes::{FakeBackend, FakeBuilder};
    use crate::libhive::testmanager::RunMetadata;

    fn runner_with_inventory() -> Runner {
        let mut inv = Inventory::default();
        inv.add_client("go-ethereum");
        inv.add_simulator("devp2p");
        Runner::new(inv, Arc::new(FakeBuilder::default()), Arc::new(FakeBackend::default()))
    }

    #[tokio::test]
    async fn build_requires_clients() {
        let mut runner = runner_with_inventory();
        assert!(runner.build(&[], &["devp2p".to_string()]).await.is_err());

        let clients = vec![ClientDesignator::parse("go-ethereum")];
        runner.build(&clients, &["devp2p".to_string()]).await.unwrap();
        assert_eq!(runner.client_definitions().len(), 1);
        assert_eq!(runner.client_definitions()[0].name, "go-ethereum");
    }

    #[tokio::test]
    async fn unbuilt_simulator_is_an_error() {
        let runner = runner_with_inventory();
        let cancel = CancellationToken::new();
        let env = SimEnv { log_dir: std::env::temp_dir(), ..Default::default() };
        assert!(runner.run(&cancel, "devp2p", env).await.is_err());
    }

    #[tokio::test]
    async fn run_writes_instance_info_and_tallies() {
        let dir = tempfile::tempdir().unwrap();
        let mut runner = runner_with_inventory();
        let clients = vec![ClientDesignator::parse("go-ethereum")];
        runner.build(&clients, &["devp2p".to_string()]).await.unwrap();

        let cancel = CancellationToken::new();
        let env = SimEnv { log_dir: dir.path().to_path_buf(), ..Default::default() };
        let run = runner.run(&cancel, "devp2p", env).await.unwrap();
        // The fake simulator container exits immediately without running
        // any tests.
        assert_eq!(run.result, SimResult::default());
        assert!(run.end_reason.is_none());
        assert!(dir.path().join("hive.json").is_file());
    }

    #[tokio::test]
    async fn simulator_start_failure_propagates() {
        let dir = tempfile::tempdir().unwrap();
        let mut inv = Inventory::default();
        inv.add_client("go-ethereum");
        inv.add_simulator("devp2p");
        let mut backend = FakeBackend::default();
        backend.hooks.start_container = Some(Box::new(|_, _| {
            Err(HiveError::Other("docker daemon unavailable".to_string()))
        }));
        let mut runner = Runner::new(inv, Arc::new(FakeBuilder::default()), Arc::new(backend));
        let clients = vec![ClientDesignator::parse("go-ethereum")];
        runner.build(&clients, &["devp2p".to_string()]).await.unwrap();

        let cancel = CancellationToken::new();
        let env = SimEnv { log_dir: dir.path().to_path_buf(), ..Default::default() };
        let err = runner.run(&cancel, "devp2p", env).await.unwrap_err();
        assert!(err.to_string().contains("docker daemon unavailable"));
    }

    #[tokio::test]
    async fn duration_limit_yields_tally_with_reason() {
        let dir = tempfile::tempdir().unwrap();
        let mut inv = Inventory::default();
        inv.add_client("go-ethereum");
        inv.add_simulator("devp2p");
        // The simulator container never exits on its own.
        let mut backend = FakeBackend::default();
        backend.hooks.start_container = Some(Box::new(|id, _| {
            Ok(crate::libhive::backend::ContainerInfo {
                id: id.to_string(),
                ip: "192.0.2.1".to_string(),
                mac: "02:00:00:00:00:01".to_string(),
                wait: crate::libhive::backend::ContainerWait::new(std::future::pending()),
            })
        }));
        let mut runner = Runner::new(inv, Arc::new(FakeBuilder::default()), Arc::new(backend));
        let clients = vec![ClientDesignator::parse("go-ethereum")];
        runner.build(&clients, &["devp2p".to_string()]).await.unwrap();

        let cancel = CancellationToken::new();
        let env = SimEnv {
            log_dir: dir.path().to_path_buf(),
            sim_duration_limit: Some(std::time::Duration::from_millis(20)),
            ..Default::default()
        };
        let run = runner.run(&cancel, "devp2p", env).await.unwrap();
        assert!(matches!(run.end_reason, Some(HiveError::SimTimeout)));
        assert_eq!(run.result, SimResult::default());
    }

    #[test]
    fn tally_counts_failed_suites_once() {
        let manager = TestManager::new(
            SimEnv { log_dir: std::env::temp_dir(), ..Default::default() },
            Arc::new(FakeBackend::default()),
            Vec::new(),
        );
        let rt = tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap();
        rt.block_on(async {
            let suite = manager.start_suite(RunMetadata::default());
            for pass in [false, false, true] {
                let test = manager.start_test(suite, RunMetadata::default()).unwrap();
                manager
                    .end_test(suite, test, TestResult { pass, ..Default::default() }, None)
                    .await
                    .unwrap();
            }
            manager.end_suite(suite).await.unwrap();
        });
        let result = tally(&manager);
        assert_eq!(result, SimResult { suites: 1, suites_failed: 1, tests: 3, tests_failed: 2 });
    }
}

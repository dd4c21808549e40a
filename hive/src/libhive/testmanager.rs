//! Tracks all in-flight suites, test cases, client containers and user
//! networks for one simulator run.
//!
//! Lock discipline: three independent mutexes guard suite state, test
//! state and network state. None is held across a backend call. The only
//! permitted nesting is suite state, then network state, inside
//! [`TestManager::end_suite`].

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::Utc;
use tracing::{error, info, warn};

use crate::libhive::backend::{ContainerBackend, ExecInfo};
use crate::libhive::data::{
    ClientDefinition, ClientInfo, SimEnv, SuiteId, TestCase, TestId, TestResult, TestSuite,
    write_suite_file,
};
use crate::libhive::errors::{HiveError, HiveResult};

/// Metadata accepted when starting a suite or test case.
#[derive(Debug, Clone, Default, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunMetadata {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub display_name: String,
    #[serde(default)]
    pub location: String,
    #[serde(default)]
    pub category: String,
}

#[derive(Default)]
struct SuiteState {
    counter: SuiteId,
    running: HashMap<SuiteId, TestSuite>,
    results: HashMap<SuiteId, TestSuite>,
}

struct RunningTest {
    suite: SuiteId,
    case: TestCase,
}

#[derive(Default)]
struct TestState {
    counter: TestId,
    running: HashMap<TestId, RunningTest>,
}

/// suite id -> simulator-facing network name -> engine network id.
#[derive(Default)]
struct NetworkState {
    networks: HashMap<SuiteId, HashMap<String, String>>,
}

pub struct TestManager {
    env: SimEnv,
    backend: Arc<dyn ContainerBackend>,
    clients: Vec<ClientDefinition>,
    instance_id: String,
    /// Simulator container id and log file basename, set by the run loop.
    sim_container: Mutex<(String, String)>,
    terminated: AtomicBool,

    suite_state: Mutex<SuiteState>,
    test_state: Mutex<TestState>,
    network_state: Mutex<NetworkState>,
}

impl TestManager {
    pub fn new(
        env: SimEnv,
        backend: Arc<dyn ContainerBackend>,
        clients: Vec<ClientDefinition>,
    ) -> Arc<Self> {
        Arc::new(TestManager {
            env,
            backend,
            clients,
            instance_id: format!("{:08x}", rand::random::<u32>()),
            sim_container: Mutex::new((String::new(), String::new())),
            terminated: AtomicBool::new(false),
            suite_state: Mutex::new(SuiteState::default()),
            test_state: Mutex::new(TestState::default()),
            network_state: Mutex::new(NetworkState::default()),
        })
    }

    pub fn env(&self) -> &SimEnv {
        &self.env
    }

    pub fn backend(&self) -> &Arc<dyn ContainerBackend> {
        &self.backend
    }

    /// Random identifier distinguishing this orchestrator instance's
    /// containers from those of concurrent instances.
    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    /// The client definitions available to simulators.
    pub fn client_definitions(&self) -> &[ClientDefinition] {
        &self.clients
    }

    pub fn client_definition(&self, name: &str) -> Option<&ClientDefinition> {
        self.clients.iter().find(|c| c.name == name)
    }

    /// Sets the container that `"simulation"` resolves to in network
    /// operations, and the simulator log name recorded on new suites.
    /// Called by the run loop once the simulator container exists.
    pub fn set_simulator_container(&self, id: &str, log_basename: &str) {
        *lock(&self.sim_container) = (id.to_string(), log_basename.to_string());
    }

    fn resolve_container(&self, id: &str) -> String {
        if id == "simulation" { lock(&self.sim_container).0.clone() } else { id.to_string() }
    }

    /// Snapshot copy of all ended suites.
    pub fn results(&self) -> Vec<TestSuite> {
        let state = lock(&self.suite_state);
        let mut out: Vec<TestSuite> = state.results.values().cloned().collect();
        out.sort_by_key(|s| s.id);
        out
    }

    pub fn is_suite_running(&self, suite: SuiteId) -> bool {
        lock(&self.suite_state).running.contains_key(&suite)
    }

    pub fn is_test_running(&self, suite: SuiteId, test: TestId) -> bool {
        lock(&self.test_state).running.get(&test).is_some_and(|rt| rt.suite == suite)
    }

    // ---- suite lifecycle ----

    pub fn start_suite(&self, meta: RunMetadata) -> SuiteId {
        let sim_log = lock(&self.sim_container).1.clone();
        let mut state = lock(&self.suite_state);
        let id = state.counter;
        state.counter += 1;
        state.running.insert(
            id,
            TestSuite {
                id,
                name: meta.name,
                description: meta.description,
                display_name: meta.display_name,
                location: meta.location,
                sim_log,
                ..Default::default()
            },
        );
        id
    }

    /// Ends a suite: writes its result file, stops its shared clients and
    /// removes its user networks.
    pub async fn end_suite(&self, id: SuiteId) -> HiveResult<()> {
        let (mut suite, networks) = {
            let mut suites = lock(&self.suite_state);
            let suite = suites.running.get(&id).ok_or(HiveError::NoSuchTestSuite)?;
            if !suite.running_tests.is_empty() {
                return Err(HiveError::SuiteStillRunning);
            }
            let suite = suites
                .running
                .remove(&id)
                .ok_or(HiveError::NoSuchTestSuite)?;
            // suite lock then network lock, the one permitted nesting.
            let networks = lock(&self.network_state).networks.remove(&id).unwrap_or_default();
            (suite, networks)
        };

        for (_, client) in suite.shared_clients.drain() {
            if let Err(err) = self.backend.delete_container(&client.id).await {
                error!(container = %client.id, %err, "can't stop shared client");
            }
        }
        for (name, net_id) in networks {
            if let Err(err) = self.backend.remove_network(&net_id).await {
                error!(network = %name, %err, "can't remove network");
            }
        }

        let write_result = write_suite_file(&suite, &self.env.log_dir);
        if let Err(err) = &write_result {
            error!(suite = id, %err, "can't write suite result file");
        }
        lock(&self.suite_state).results.insert(id, suite);
        write_result.map(|_| ())
    }

    /// Records the version string of a client type the first time it is
    /// used in the suite.
    pub fn record_client_version(&self, suite: SuiteId, name: &str, version: &str) {
        if let Some(s) = lock(&self.suite_state).running.get_mut(&suite) {
            s.client_versions.entry(name.to_string()).or_insert_with(|| version.to_string());
        }
    }

    // ---- test lifecycle ----

    pub fn start_test(&self, suite: SuiteId, meta: RunMetadata) -> HiveResult<TestId> {
        {
            let suites = lock(&self.suite_state);
            let s = suites.running.get(&suite).ok_or(HiveError::NoSuchTestSuite)?;
            if let Some(limit) = self.env.test_limit {
                if s.test_cases.len() + s.running_tests.len() >= limit {
                    return Err(HiveError::TestSuiteLimited);
                }
            }
        }
        let id = {
            let mut tests = lock(&self.test_state);
            let id = tests.counter;
            tests.counter += 1;
            tests.running.insert(
                id,
                RunningTest {
                    suite,
                    case: TestCase {
                        id,
                        name: meta.name,
                        description: meta.description,
                        display_name: meta.display_name,
                        category: meta.category,
                        start: Utc::now(),
                        ..Default::default()
                    },
                },
            );
            id
        };
        // The suite may have ended between the two critical sections.
        let mut suites = lock(&self.suite_state);
        match suites.running.get_mut(&suite) {
            Some(s) => {
                s.running_tests.insert(id);
                Ok(id)
            }
            None => {
                drop(suites);
                lock(&self.test_state).running.remove(&id);
                Err(HiveError::NoSuchTestSuite)
            }
        }
    }

    /// Ends a test case. The test is no longer observable as running once
    /// this returns, and its non-shared clients are stopped.
    pub async fn end_test(
        &self,
        suite: SuiteId,
        test: TestId,
        summary: TestResult,
        client_results: Option<std::collections::BTreeMap<String, TestResult>>,
    ) -> HiveResult<()> {
        let mut finished = {
            let mut tests = lock(&self.test_state);
            match tests.running.get(&test) {
                Some(rt) if rt.suite == suite => {}
                _ => return Err(HiveError::NoSuchTestCase),
            }
            match tests.running.remove(&test) {
                Some(rt) => rt.case,
                None => return Err(HiveError::NoSuchTestCase),
            }
        };
        finished.end = Some(Utc::now());
        finished.summary_result = summary;
        finished.client_results = client_results;

        // Stop clients owned by the test. Shared ones belong to the suite.
        let to_stop: Vec<String> = {
            let mut suites = lock(&self.suite_state);
            match suites.running.get_mut(&suite) {
                Some(s) => {
                    s.running_tests.remove(&test);
                    let owned = finished
                        .client_info
                        .keys()
                        .filter(|id| !s.shared_clients.contains_key(*id))
                        .cloned()
                        .collect();
                    s.test_cases.insert(test, finished);
                    owned
                }
                None => Vec::new(),
            }
        };
        for id in to_stop {
            if let Err(err) = self.backend.delete_container(&id).await {
                error!(container = %id, %err, "can't stop client");
            }
        }
        Ok(())
    }

    // ---- node tracking ----

    /// Associates a started client container with a running test.
    pub fn register_node(&self, test: TestId, container_id: &str, info: ClientInfo) -> HiveResult<()> {
        let mut tests = lock(&self.test_state);
        let rt = tests.running.get_mut(&test).ok_or(HiveError::NoSuchTestCase)?;
        rt.case.client_info.insert(container_id.to_string(), info);
        Ok(())
    }

    /// Registers a suite-owned client, reusable across the suite's tests.
    pub fn register_shared_node(&self, suite: SuiteId, info: ClientInfo) -> HiveResult<()> {
        let mut suites = lock(&self.suite_state);
        let s = suites.running.get_mut(&suite).ok_or(HiveError::NoSuchTestSuite)?;
        s.shared_clients.insert(info.id.clone(), info);
        Ok(())
    }

    /// Looks up a client by container id, consulting the test's own clients
    /// first and the suite's shared clients second.
    pub fn get_node_info(
        &self,
        suite: SuiteId,
        test: TestId,
        container_id: &str,
    ) -> HiveResult<ClientInfo> {
        {
            let tests = lock(&self.test_state);
            if let Some(rt) = tests.running.get(&test) {
                if rt.suite != suite {
                    return Err(HiveError::NoSuchTestCase);
                }
                if let Some(info) = rt.case.client_info.get(container_id) {
                    return Ok(info.clone());
                }
            } else {
                return Err(HiveError::NoSuchTestCase);
            }
        }
        let suites = lock(&self.suite_state);
        suites
            .running
            .get(&suite)
            .and_then(|s| s.shared_clients.get(container_id))
            .cloned()
            .ok_or(HiveError::NoSuchNode)
    }

    /// Stops a client container and forgets it. Used by the delete-node
    /// route; shared clients cannot be stopped this way.
    pub async fn stop_node(
        &self,
        suite: SuiteId,
        test: TestId,
        container_id: &str,
    ) -> HiveResult<()> {
        let owned = {
            let mut tests = lock(&self.test_state);
            let rt = tests.running.get_mut(&test).ok_or(HiveError::NoSuchTestCase)?;
            if rt.suite != suite {
                return Err(HiveError::NoSuchTestCase);
            }
            rt.case.client_info.contains_key(container_id)
        };
        if !owned {
            return Err(HiveError::NoSuchNode);
        }
        self.backend.delete_container(container_id).await
    }

    pub async fn pause_node(&self, suite: SuiteId, test: TestId, id: &str) -> HiveResult<()> {
        self.get_node_info(suite, test, id)?;
        self.backend.pause_container(id).await
    }

    pub async fn unpause_node(&self, suite: SuiteId, test: TestId, id: &str) -> HiveResult<()> {
        self.get_node_info(suite, test, id)?;
        self.backend.unpause_container(id).await
    }

    pub async fn exec_in_node(
        &self,
        suite: SuiteId,
        test: TestId,
        id: &str,
        cmd: Vec<String>,
    ) -> HiveResult<ExecInfo> {
        self.get_node_info(suite, test, id)?;
        self.backend.run_program(id, cmd).await
    }

    // ---- networks ----

    /// The engine-side name of a user network. Prefixed to avoid collisions
    /// between concurrent hive instances and suites.
    fn network_name(&self, suite: SuiteId, name: &str) -> String {
        format!("hive_{}_{}_{}", std::process::id(), suite, name)
    }

    pub async fn create_network(&self, suite: SuiteId, name: &str) -> HiveResult<String> {
        if !self.is_suite_running(suite) {
            return Err(HiveError::NoSuchTestSuite);
        }
        let id = self.backend.create_network(&self.network_name(suite, name)).await?;
        lock(&self.network_state)
            .networks
            .entry(suite)
            .or_default()
            .insert(name.to_string(), id.clone());
        Ok(id)
    }

    /// Resolves a simulator-facing network name to the engine network id.
    /// `"bridge"` resolves through the engine rather than the suite map.
    pub async fn network_id(&self, suite: SuiteId, name: &str) -> HiveResult<String> {
        if name == "bridge" {
            return self.backend.network_name_to_id("bridge").await;
        }
        lock(&self.network_state)
            .networks
            .get(&suite)
            .and_then(|m| m.get(name))
            .cloned()
            .ok_or(HiveError::NetworkNotFound)
    }

    pub async fn remove_network(&self, suite: SuiteId, name: &str) -> HiveResult<()> {
        let id = {
            let mut state = lock(&self.network_state);
            let nets = state.networks.get_mut(&suite).ok_or(HiveError::NetworkNotFound)?;
            nets.remove(name).ok_or(HiveError::NetworkNotFound)?
        };
        self.backend.remove_network(&id).await
    }

    pub async fn connect_container(
        &self,
        suite: SuiteId,
        network: &str,
        container: &str,
    ) -> HiveResult<()> {
        let net_id = self.network_id(suite, network).await?;
        let cid = self.resolve_container(container);
        self.backend.connect_container(&cid, &net_id).await
    }

    pub async fn disconnect_container(
        &self,
        suite: SuiteId,
        network: &str,
        container: &str,
    ) -> HiveResult<()> {
        let net_id = self.network_id(suite, network).await?;
        let cid = self.resolve_container(container);
        self.backend.disconnect_container(&cid, &net_id).await
    }

    pub async fn container_ip(
        &self,
        suite: SuiteId,
        network: &str,
        container: &str,
    ) -> HiveResult<IpAddr> {
        let net_id = self.network_id(suite, network).await?;
        let cid = self.resolve_container(container);
        self.backend.container_ip(&cid, &net_id).await
    }

    // ---- teardown ----

    /// Abortive teardown after the simulator exits or times out. Fails every
    /// still-running test, ends every still-running suite and prunes
    /// leftover networks. Calling it again is a no-op.
    pub async fn terminate(&self) {
        self.terminate_with(false).await
    }

    /// Like [`terminate`](Self::terminate), but marks the drained test
    /// results as timed out. Used when the simulation duration limit fires.
    pub async fn terminate_with(&self, timed_out: bool) {
        if self.terminated.swap(true, Ordering::SeqCst) {
            return;
        }
        let running: Vec<(SuiteId, TestId)> = {
            let tests = lock(&self.test_state);
            tests.running.iter().map(|(id, rt)| (rt.suite, *id)).collect()
        };
        if !running.is_empty() {
            warn!(count = running.len(), "failing still-running test cases");
        }
        for (suite, test) in running {
            let summary = TestResult {
                pass: false,
                timeout: timed_out,
                details: "terminated by host".to_string(),
            };
            if let Err(err) = self.end_test(suite, test, summary, None).await {
                error!(test, %err, "can't terminate test");
            }
        }

        let suites: Vec<SuiteId> = lock(&self.suite_state).running.keys().copied().collect();
        for id in suites {
            info!(suite = id, "force-ending test suite");
            if let Err(err) = self.end_suite(id).await {
                error!(suite = id, %err, "can't terminate suite");
            }
        }

        // Suites that never started are gone now, but networks created for
        // them may linger if end_suite failed.
        let leftover: Vec<String> = {
            let mut state = lock(&self.network_state);
            state
                .networks
                .drain()
                .flat_map(|(_, nets)| nets.into_values())
                .collect()
        };
        for id in leftover {
            if let Err(err) = self.backend.remove_network(&id).await {
                error!(network = %id, %err, "can't remove leftover network");
            }
        }
    }
}

impl std::fmt::Debug for TestManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TestManager").field("clients", &self.clients.len()).finish()
    }
}

/// All three state mutexes are only held for short, non-panicking critical
/// sections, so poisoning is not propagated.
fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    match m.lock() {
        Ok(g) => g,
        Err(poisoned) => poisoned.into_inner(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::libhive::fakes::FakeBackend;

    fn meta(name: &str) -> RunMetadata {
        RunMetadata { name: name.to_string(), ..Default::default() }
    }

    fn manager() -> (Arc<TestManager>, Arc<FakeBackend>) {
        let backend = Arc::new(FakeBackend::default());
        let env = SimEnv { log_dir: std::env::temp_dir(), ..Default::default() };
        let mgr = TestManager::new(env, backend.clone(), Vec::new());
        (mgr, backend)
    }

    #[tokio::test]
    async fn suite_with_running_test_cannot_end() {
        let (mgr, _) = manager();
        let suite = mgr.start_suite(meta("suite"));
        let test = mgr.start_test(suite, meta("case")).unwrap();
        assert!(matches!(mgr.end_suite(suite).await, Err(HiveError::SuiteStillRunning)));

        mgr.end_test(suite, test, TestResult { pass: true, ..Default::default() }, None)
            .await
            .unwrap();
        mgr.end_suite(suite).await.unwrap();
        let results = mgr.results();
        assert_eq!(results.len(), 1);
        assert!(results[0].test_cases[&test].summary_result.pass);
    }

    #[tokio::test]
    async fn double_end_test_reports_no_such_case() {
        let (mgr, _) = manager();
        let suite = mgr.start_suite(meta("suite"));
        let test = mgr.start_test(suite, meta("case")).unwrap();
        let summary = TestResult { pass: true, ..Default::default() };
        mgr.end_test(suite, test, summary.clone(), None).await.unwrap();
        assert!(matches!(
            mgr.end_test(suite, test, summary, None).await,
            Err(HiveError::NoSuchTestCase)
        ));
    }

    #[tokio::test]
    async fn test_limit_is_enforced() {
        let backend = Arc::new(FakeBackend::default());
        let env = SimEnv {
            log_dir: std::env::temp_dir(),
            test_limit: Some(1),
            ..Default::default()
        };
        let mgr = TestManager::new(env, backend, Vec::new());
        let suite = mgr.start_suite(meta("suite"));
        mgr.start_test(suite, meta("one")).unwrap();
        assert!(matches!(
            mgr.start_test(suite, meta("two")),
            Err(HiveError::TestSuiteLimited)
        ));
    }

    #[tokio::test]
    async fn end_test_stops_only_owned_clients() {
        let (mgr, backend) = manager();
        let suite = mgr.start_suite(meta("suite"));
        let test = mgr.start_test(suite, meta("case")).unwrap();

        let shared = ClientInfo { id: "shared-1".into(), name: "geth".into(), ..Default::default() };
        mgr.register_shared_node(suite, shared.clone()).unwrap();
        let owned = ClientInfo { id: "own-1".into(), name: "geth".into(), ..Default::default() };
        mgr.register_node(test, "own-1", owned).unwrap();
        mgr.register_node(test, "shared-1", shared).unwrap();

        mgr.end_test(suite, test, TestResult { pass: true, ..Default::default() }, None)
            .await
            .unwrap();
        assert_eq!(backend.deleted_containers(), vec!["own-1".to_string()]);

        mgr.end_suite(suite).await.unwrap();
        assert_eq!(
            backend.deleted_containers(),
            vec!["own-1".to_string(), "shared-1".to_string()]
        );
    }

    #[tokio::test]
    async fn terminate_fails_running_tests_and_is_idempotent() {
        let (mgr, _) = manager();
        let suite = mgr.start_suite(meta("suite"));
        let test = mgr.start_test(suite, meta("case")).unwrap();

        mgr.terminate().await;
        mgr.terminate().await;

        let results = mgr.results();
        assert_eq!(results.len(), 1);
        let case = &results[0].test_cases[&test];
        assert!(!case.summary_result.pass);
        assert_eq!(case.summary_result.details, "terminated by host");
    }

    #[tokio::test]
    async fn networks_are_scoped_to_the_suite() {
        let (mgr, backend) = manager();
        let suite = mgr.start_suite(meta("suite"));
        let id = mgr.create_network(suite, "peernet").await.unwrap();
        assert_eq!(mgr.network_id(suite, "peernet").await.unwrap(), id);
        assert!(matches!(
            mgr.network_id(suite, "missing").await,
            Err(HiveError::NetworkNotFound)
        ));

        mgr.end_suite(suite).await.unwrap();
        assert_eq!(backend.removed_networks(), vec![id]);
    }

    #[tokio::test]
    async fn simulation_resolves_to_simulator_container() {
        let (mgr, backend) = manager();
        mgr.set_simulator_container("sim-cid", "");
        let suite = mgr.start_suite(meta("suite"));
        mgr.create_network(suite, "net").await.unwrap();
        mgr.connect_container(suite, "net", "simulation").await.unwrap();
        assert_eq!(backend.connected_containers(), vec!["sim-cid".to_string()]);
    }
}

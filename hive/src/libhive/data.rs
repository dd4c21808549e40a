//! Records of suites, test cases and participating clients, and the
//! on-disk result schema consumed by hiveview.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::libhive::backend::ContainerWait;
use crate::libhive::errors::HiveResult;

/// Identifies a test suite context. Assigned monotonically per run.
pub type SuiteId = u32;

/// Identifies a test case context. Globally unique across suites in one run.
pub type TestId = u32;

/// The simulation parameters for one simulator run.
#[derive(Debug, Clone)]
pub struct SimEnv {
    pub log_dir: PathBuf,
    pub sim_log_level: u32,
    pub sim_parallelism: u32,
    pub sim_test_pattern: String,
    pub sim_duration_limit: Option<Duration>,
    pub print_container_output: bool,

    /// How long the simulation waits for a client to open its liveness port
    /// after launching the container.
    pub client_start_timeout: Duration,

    /// Caps the number of test cases per suite. `None` means unlimited.
    pub test_limit: Option<usize>,
}

impl Default for SimEnv {
    fn default() -> Self {
        SimEnv {
            log_dir: PathBuf::from("workspace/logs"),
            sim_log_level: 3,
            sim_parallelism: 1,
            sim_test_pattern: String::new(),
            sim_duration_limit: None,
            print_container_output: false,
            client_start_timeout: Duration::from_secs(60),
            test_limit: None,
        }
    }
}

/// A single run of a simulator: a collection of test cases.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TestSuite {
    pub id: SuiteId,
    pub name: String,
    pub description: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub display_name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub location: String,
    /// client name -> version, populated lazily by the first use of each
    /// client type during the suite.
    #[serde(default)]
    pub client_versions: BTreeMap<String, String>,
    pub test_cases: BTreeMap<TestId, TestCase>,
    /// The log file of the simulator producing this suite.
    #[serde(rename = "simLog")]
    pub sim_log: String,

    /// Clients started at suite level, reusable across test cases. They are
    /// stopped when the suite ends, not per test.
    #[serde(skip)]
    pub shared_clients: HashMap<String, ClientInfo>,
    /// Ids of test cases that have been started but not yet ended.
    #[serde(skip)]
    pub running_tests: HashSet<TestId>,
}

/// A single test case in a test suite.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TestCase {
    pub id: TestId,
    pub name: String,
    pub description: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub display_name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub category: String,
    pub start: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end: Option<DateTime<Utc>>,
    /// The result of the whole test case.
    pub summary_result: TestResult,
    /// Client-specific results, for test cases that identify a specific
    /// client as the failure reason.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_results: Option<BTreeMap<String, TestResult>>,
    /// Info about each client participating in the case.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub client_info: BTreeMap<String, ClientInfo>,
}

/// The payload submitted to the end-test endpoint.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TestResult {
    pub pass: bool,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub timeout: bool,
    #[serde(default)]
    pub details: String,
}

/// Describes a client that participated in a test case.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientInfo {
    pub id: String,
    pub ip: String,
    pub name: String,
    pub instantiated_at: DateTime<Utc>,
    /// Path of the client's log file, relative to the log directory.
    pub log_file: String,

    /// Resolves when the container has exited and its log file is closed.
    /// Excluded from the result database.
    #[serde(skip)]
    pub wait: Option<ContainerWait>,
}

/// Metadata describing a client in more detail, read from the `hive.yaml`
/// sidecar next to the client's Dockerfile.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientMetadata {
    pub roles: Vec<String>,
}

impl Default for ClientMetadata {
    fn default() -> Self {
        // Eth1 client by default.
        ClientMetadata { roles: vec!["eth1".to_string()] }
    }
}

/// A buildable client image known to the run. Served by `/clients`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientDefinition {
    pub name: String,
    pub version: String,
    #[serde(skip)]
    pub image: String,
    pub meta: ClientMetadata,
}

/// Version metadata of the orchestrator, recorded in `hive.json` and served
/// at `/hive`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HiveInstance {
    #[serde(default)]
    pub source_commit: String,
    #[serde(default)]
    pub source_date: String,
    #[serde(default)]
    pub build_date: String,
}

impl HiveInstance {
    pub fn current() -> Self {
        HiveInstance {
            source_commit: option_env!("HIVE_COMMIT").unwrap_or_default().to_string(),
            source_date: option_env!("HIVE_COMMIT_DATE").unwrap_or_default().to_string(),
            build_date: option_env!("HIVE_BUILD_DATE").unwrap_or_default().to_string(),
        }
    }
}

/// Run-level tally across all suites of one simulator run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SimResult {
    pub suites: u32,
    pub suites_failed: u32,
    pub tests: u32,
    pub tests_failed: u32,
}

impl SimResult {
    pub fn any_failed(&self) -> bool {
        self.tests_failed > 0
    }
}

/// Writes a finished suite to the log directory. The file name is ordered by
/// date, which makes cleanups easier.
pub fn write_suite_file(suite: &TestSuite, log_dir: &Path) -> HiveResult<PathBuf> {
    let name = format!("{}-{}.json", Utc::now().timestamp(), suite.id);
    let path = log_dir.join(name);
    let data = serde_json::to_vec(suite).map_err(std::io::Error::other)?;
    std::fs::write(&path, data)?;
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_suite() -> TestSuite {
        let mut suite = TestSuite {
            id: 1,
            name: "devp2p".to_string(),
            description: "p2p protocol tests".to_string(),
            sim_log: "1700000000-simulator-abcd.log".to_string(),
            ..Default::default()
        };
        suite.client_versions.insert("go-ethereum".to_string(), "1.13.8".to_string());
        let mut case = TestCase {
            id: 4,
            name: "ping".to_string(),
            start: Utc::now(),
            end: Some(Utc::now()),
            summary_result: TestResult { pass: true, ..Default::default() },
            ..Default::default()
        };
        case.client_info.insert(
            "abcd1234".to_string(),
            ClientInfo {
                id: "abcd1234".to_string(),
                ip: "172.17.0.3".to_string(),
                name: "go-ethereum".to_string(),
                instantiated_at: Utc::now(),
                log_file: "go-ethereum/client-abcd1234.log".to_string(),
                wait: None,
            },
        );
        suite.test_cases.insert(4, case);
        suite
    }

    #[test]
    fn suite_json_roundtrip() {
        let suite = sample_suite();
        let encoded = serde_json::to_string(&suite).unwrap();
        let decoded: TestSuite = serde_json::from_str(&encoded).unwrap();
        assert_eq!(decoded.id, suite.id);
        assert_eq!(decoded.test_cases.len(), 1);
        assert_eq!(decoded.client_versions["go-ethereum"], "1.13.8");
        assert!(decoded.test_cases[&4].summary_result.pass);
        // Encoding again gives the same document.
        assert_eq!(serde_json::to_string(&decoded).unwrap(), encoded);
    }

    #[test]
    fn wait_handle_not_serialized() {
        let suite = sample_suite();
        let encoded = serde_json::to_string(&suite).unwrap();
        assert!(!encoded.contains("wait"));
        assert!(encoded.contains("logFile"));
    }

    #[test]
    fn timeout_flag_omitted_when_unset() {
        let pass = TestResult { pass: true, ..Default::default() };
        assert!(!serde_json::to_string(&pass).unwrap().contains("timeout"));
        let timed_out =
            TestResult { pass: false, timeout: true, details: "deadline".to_string() };
        assert!(serde_json::to_string(&timed_out).unwrap().contains(r#""timeout":true"#));
    }

    #[test]
    fn suite_file_name_convention() {
        let dir = tempfile::tempdir().unwrap();
        let suite = sample_suite();
        let path = write_suite_file(&suite, dir.path()).unwrap();
        let name = path.file_name().unwrap().to_str().unwrap();
        assert!(name.ends_with("-1.json"), "unexpected file name {name}");
    }
}

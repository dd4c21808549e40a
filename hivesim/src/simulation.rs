use std::collections::{BTreeMap, HashMap};
use std::env;
use std::net::IpAddr;
use std::str::FromStr;

use crate::types::{
    ClientDefinition, EndTestRequest, ExecRequest, ExecResult, NodeResponse, StartNodeResponse,
    SuiteID, TestID, TestRequest, TestResult,
};
use crate::TestMatcher;

/// Wraps the simulation HTTP API provided by hive.
#[derive(Clone, Debug)]
pub struct Simulation {
    pub url: String,
    pub test_matcher: Option<TestMatcher>,
    client: reqwest::Client,
}

impl Default for Simulation {
    fn default() -> Self {
        Self::new()
    }
}

/// Parameters for launching a client container.
#[derive(Clone, Debug, Default)]
pub struct StartClientOptions {
    pub client_type: String,
    /// `HIVE_`-prefixed variables forwarded into the container.
    pub environment: HashMap<String, String>,
    /// Files placed into the container before start, keyed by their
    /// destination path.
    pub files: HashMap<String, Vec<u8>>,
    /// Registers the client on the suite instead of the test, keeping it
    /// alive across test cases.
    pub shared: bool,
}

impl Simulation {
    /// Looks up the hive host URI using the HIVE_SIMULATOR environment
    /// variable and connects to it. Panics if HIVE_SIMULATOR is not set.
    pub fn new() -> Self {
        let url = env::var("HIVE_SIMULATOR").expect("HIVE_SIMULATOR environment variable not set");
        if url.is_empty() {
            panic!("HIVE_SIMULATOR environment variable is empty")
        }
        let test_matcher = match env::var("HIVE_TEST_PATTERN") {
            Ok(pattern) if !pattern.is_empty() => Some(TestMatcher::new(&pattern)),
            _ => None,
        };
        Self { url, test_matcher, client: reqwest::Client::new() }
    }

    pub async fn start_suite(&self, name: String, description: String) -> SuiteID {
        let body = TestRequest { name, description, ..Default::default() };
        self.client
            .post(format!("{}/testsuite", self.url))
            .json(&body)
            .send()
            .await
            .expect("Failed to send start suite request")
            .json::<SuiteID>()
            .await
            .expect("Failed to decode start suite response")
    }

    pub async fn end_suite(&self, test_suite: SuiteID) {
        self.client
            .delete(format!("{}/testsuite/{}", self.url, test_suite))
            .send()
            .await
            .expect("Failed to send end suite request");
    }

    /// Starts a new test case, returning the test id as a context identifier.
    pub async fn start_test(
        &self,
        test_suite: SuiteID,
        name: String,
        description: String,
    ) -> TestID {
        let body = TestRequest { name, description, ..Default::default() };
        self.client
            .post(format!("{}/testsuite/{}/test", self.url, test_suite))
            .json(&body)
            .send()
            .await
            .expect("Failed to send start test request")
            .json::<TestID>()
            .await
            .expect("Failed to decode start test response")
    }

    /// Finishes the test case, recording the summary result. Clients started
    /// by the test are stopped by the host.
    pub async fn end_test(&self, test_suite: SuiteID, test: TestID, result: TestResult) {
        self.end_test_with_clients(test_suite, test, result, None).await
    }

    pub async fn end_test_with_clients(
        &self,
        test_suite: SuiteID,
        test: TestID,
        summary_result: TestResult,
        client_results: Option<BTreeMap<String, TestResult>>,
    ) {
        let body = EndTestRequest { summary_result, client_results };
        self.client
            .post(format!("{}/testsuite/{}/test/{}", self.url, test_suite, test))
            .json(&body)
            .send()
            .await
            .expect("Failed to send end test request");
    }

    /// Starts a new client container. Returns container id and IP.
    pub async fn start_client(
        &self,
        test_suite: SuiteID,
        test: TestID,
        options: StartClientOptions,
    ) -> (String, IpAddr) {
        let mut form = reqwest::multipart::Form::new().text("CLIENT", options.client_type);
        if options.shared {
            form = form.text("SHARED", "true");
        }
        for (key, value) in options.environment {
            form = form.text(key, value);
        }
        for (path, content) in options.files {
            let part = reqwest::multipart::Part::bytes(content).file_name("upload");
            form = form.part(path, part);
        }

        let resp = self
            .client
            .post(format!("{}/testsuite/{}/test/{}/node", self.url, test_suite, test))
            .multipart(form)
            .send()
            .await
            .expect("Failed to send start client request")
            .json::<StartNodeResponse>()
            .await
            .expect("Failed to decode start node response");

        let ip = IpAddr::from_str(&resp.ip).expect("Failed to decode IP address");
        (resp.id, ip)
    }

    /// Returns the node info of a running client, including its enode URL
    /// when the client exposes one.
    pub async fn client_info(
        &self,
        test_suite: SuiteID,
        test: TestID,
        node: &str,
    ) -> NodeResponse {
        self.client
            .get(format!("{}/testsuite/{}/test/{}/node/{}", self.url, test_suite, test, node))
            .send()
            .await
            .expect("Failed to send node info request")
            .json::<NodeResponse>()
            .await
            .expect("Failed to decode node info response")
    }

    pub async fn stop_client(&self, test_suite: SuiteID, test: TestID, node: &str) {
        self.client
            .delete(format!("{}/testsuite/{}/test/{}/node/{}", self.url, test_suite, test, node))
            .send()
            .await
            .expect("Failed to send stop client request");
    }

    pub async fn pause_client(&self, test_suite: SuiteID, test: TestID, node: &str) {
        self.client
            .post(format!(
                "{}/testsuite/{}/test/{}/node/{}/pause",
                self.url, test_suite, test, node
            ))
            .send()
            .await
            .expect("Failed to send pause client request");
    }

    pub async fn unpause_client(&self, test_suite: SuiteID, test: TestID, node: &str) {
        self.client
            .delete(format!(
                "{}/testsuite/{}/test/{}/node/{}/pause",
                self.url, test_suite, test, node
            ))
            .send()
            .await
            .expect("Failed to send unpause client request");
    }

    /// Runs a script from the client's `/hive-bin` directory inside the
    /// container.
    pub async fn exec(
        &self,
        test_suite: SuiteID,
        test: TestID,
        node: &str,
        command: Vec<String>,
    ) -> ExecResult {
        self.client
            .post(format!(
                "{}/testsuite/{}/test/{}/node/{}/exec",
                self.url, test_suite, test, node
            ))
            .json(&ExecRequest { command })
            .send()
            .await
            .expect("Failed to send exec request")
            .json::<ExecResult>()
            .await
            .expect("Failed to decode exec response")
    }

    /// Creates a docker network scoped to the suite.
    pub async fn create_network(&self, test_suite: SuiteID, network: &str) {
        self.client
            .post(format!("{}/testsuite/{}/network/{}", self.url, test_suite, network))
            .send()
            .await
            .expect("Failed to send create network request");
    }

    pub async fn remove_network(&self, test_suite: SuiteID, network: &str) {
        self.client
            .delete(format!("{}/testsuite/{}/network/{}", self.url, test_suite, network))
            .send()
            .await
            .expect("Failed to send remove network request");
    }

    /// Connects a container to a network. The container may be a client id
    /// or `"simulation"` for the simulator's own container.
    pub async fn connect_container(&self, test_suite: SuiteID, network: &str, container: &str) {
        self.client
            .post(format!(
                "{}/testsuite/{}/network/{}/{}",
                self.url, test_suite, network, container
            ))
            .send()
            .await
            .expect("Failed to send connect container request");
    }

    pub async fn disconnect_container(&self, test_suite: SuiteID, network: &str, container: &str) {
        self.client
            .delete(format!(
                "{}/testsuite/{}/network/{}/{}",
                self.url, test_suite, network, container
            ))
            .send()
            .await
            .expect("Failed to send disconnect container request");
    }

    /// Returns the IP of the container on the given network.
    pub async fn container_network_ip(
        &self,
        test_suite: SuiteID,
        network: &str,
        container: &str,
    ) -> IpAddr {
        self.client
            .get(format!(
                "{}/testsuite/{}/network/{}/{}",
                self.url, test_suite, network, container
            ))
            .send()
            .await
            .expect("Failed to send network IP request")
            .json::<IpAddr>()
            .await
            .expect("Failed to decode network IP response")
    }

    /// Returns all client types available to this simulator run. This
    /// depends on both the available client set and the command line filters.
    pub async fn client_types(&self) -> Vec<ClientDefinition> {
        self.client
            .get(format!("{}/clients", self.url))
            .send()
            .await
            .expect("Failed to send client types request")
            .json::<Vec<ClientDefinition>>()
            .await
            .expect("Failed to decode client types response")
    }
}

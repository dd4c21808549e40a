use std::time::Duration;

pub type HiveResult<T> = Result<T, HiveError>;

/// The error taxonomy of the orchestration plane. Lifecycle errors map to
/// 400-class API responses, backend errors to 500-class ones.
#[derive(Debug, thiserror::Error)]
pub enum HiveError {
    // Lifecycle errors.
    #[error("no such node")]
    NoSuchNode,
    #[error("no such test suite")]
    NoSuchTestSuite,
    #[error("no such test case")]
    NoSuchTestCase,
    #[error("test suite still has running tests")]
    SuiteStillRunning,
    #[error("testsuite test count is limited")]
    TestSuiteLimited,
    #[error("test case must be ended with a summary result")]
    NoSummaryResult,
    #[error("network not found")]
    NetworkNotFound,
    #[error("missing 'CLIENT' in node request")]
    MissingClient,
    #[error("unknown 'CLIENT' {0:?} in node request")]
    UnknownClient(String),
    #[error("invalid request: {0}")]
    BadRequest(String),

    // Build and inventory errors. These are fatal before any simulation runs.
    #[error("inventory: {0}")]
    Inventory(String),
    #[error("image build failed for {image}: {reason}")]
    Build { image: String, reason: String },
    #[error("all clients failed to build")]
    NoClientsBuilt,

    // Run termination causes. These end a simulation run with partial
    // results instead of an orchestration failure.
    #[error("simulation timed out")]
    SimTimeout,
    #[error("simulation interrupted")]
    Interrupted,

    // Container backend errors.
    #[error("terminated unexpectedly")]
    ContainerExited,
    #[error("no TCP connection to port {port} within {}s", timeout.as_secs())]
    CheckLive { port: u16, timeout: Duration },
    #[error("docker: {0}")]
    Docker(#[from] bollard::errors::Error),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("{0}")]
    Other(String),
}

impl HiveError {
    /// True for errors caused by a bad or out-of-order API request rather
    /// than an orchestration failure.
    pub fn is_lifecycle(&self) -> bool {
        matches!(
            self,
            HiveError::NoSuchNode
                | HiveError::NoSuchTestSuite
                | HiveError::NoSuchTestCase
                | HiveError::SuiteStillRunning
                | HiveError::TestSuiteLimited
                | HiveError::NoSummaryResult
                | HiveError::NetworkNotFound
                | HiveError::MissingClient
                | HiveError::UnknownClient(_)
                | HiveError::BadRequest(_)
        )
    }
}

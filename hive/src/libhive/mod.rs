//! The runtime orchestration plane: suite/test records, the test manager
//! state machine, the simulation API and the run loop.

pub mod api;
pub mod backend;
pub mod data;
pub mod enode;
pub mod errors;
pub mod fakes;
pub mod inventory;
pub mod run;
pub mod testmanager;

pub use backend::{
    Builder, ContainerBackend, ContainerInfo, ContainerOptions, ContainerWait, ExecInfo,
};
pub use data::{
    ClientDefinition, ClientInfo, ClientMetadata, HiveInstance, SimEnv, SimResult, SuiteId,
    TestCase, TestId, TestResult, TestSuite,
};
pub use errors::{HiveError, HiveResult};
pub use inventory::{ClientDesignator, Inventory};
pub use run::Runner;
pub use testmanager::TestManager;

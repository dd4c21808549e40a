#![warn(clippy::unwrap_used)]

//! SDK for writing hive simulators.
//!
//! A simulator connects back to the orchestrator through the URL in the
//! `HIVE_SIMULATOR` environment variable and drives test suites over the
//! simulation API. [`Simulation`] is the raw API binding; [`Suite`] and
//! the test spec types layer a runner on top of it.

mod simulation;
mod testapi;
mod testmatch;
pub mod types;
pub mod utils;

pub use simulation::{Simulation, StartClientOptions};
pub use testapi::{run_suite, Client, NClientTestSpec, Suite, Test, TestSpec};
pub use testmatch::TestMatcher;

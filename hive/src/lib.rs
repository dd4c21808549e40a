#![warn(clippy::unwrap_used)]

//! Hive is an end-to-end test orchestrator for Ethereum clients. It builds
//! docker images of clients and simulators, runs them together in isolated
//! networks, and records per-test logs and results.
//!
//! The `libhive` module holds the runtime orchestration plane (test manager,
//! simulation API, run loop); `libdocker` implements the container backend
//! contract against the docker engine.

pub mod libdocker;
pub mod libhive;

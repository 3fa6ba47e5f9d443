//! dut-worker - Worker selection for the DUT provisioning daemon
//!
//! Exactly one worker exists per process. Its variant is chosen from
//! configuration: the serial-attached TestBot is built here, the virtual
//! machine worker is supplied by the embedding application.

pub mod config;
pub mod worker;

pub use config::{ConfigError, DaemonConfig, WorkerTable};
pub use worker::{Collaborators, Worker, WorkerKind};

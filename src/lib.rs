//! agentbridge - file-exchange bridge daemon between coding agents and a chat service.
//!
//! The heavy lifting lives in `agentbridge-core` (data model, errors,
//! fingerprints) and `agentbridge-daemon` (the daemon and its components).
//! This crate adds the operator-facing status report used by the CLI.

pub mod status;

pub use agentbridge_core as core;
pub use agentbridge_daemon as daemon;

#![warn(missing_docs)]

//! poolsync replication engine: snapshot inventories, incremental base
//! resolution, send/receive pipes (local or over ssh) and execution tracking.

pub mod cli;
pub mod command;
pub mod config;
pub mod engine;
pub mod error;
pub mod inventory;
pub mod job;
pub mod locks;
pub mod naming;
pub mod notify;
pub mod pipe;
pub mod process;
pub mod registry;
pub mod remote;
pub mod resolver;
pub mod store;
pub mod tracker;

pub use config::EngineConfig;
pub use engine::{ReplicationEngine, ReplicationRequest, ReplicationResult};
pub use error::{ReplError, Result};

/// Wall clock in microseconds since the Unix epoch.
pub(crate) fn now_us() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_micros() as u64)
        .unwrap_or(0)
}

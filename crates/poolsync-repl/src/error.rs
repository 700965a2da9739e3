//! Error types for the replication engine.

use crate::naming::NameKind;
use std::fmt;
use thiserror::Error;

/// Stage of a transfer pipe that failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransferStage {
    /// The local sender exited non-zero.
    Send,
    /// The local receiver exited non-zero.
    Receive,
    /// The remote-shell client carrying the receiver exited non-zero.
    RemoteReceive,
    /// The configured transfer deadline expired.
    Timeout,
    /// Relaying bytes between the two processes failed.
    Pipe,
}

impl TransferStage {
    /// Stable lowercase name used in logs and execution records.
    pub fn as_str(&self) -> &'static str {
        match self {
            TransferStage::Send => "send",
            TransferStage::Receive => "receive",
            TransferStage::RemoteReceive => "remote_receive",
            TransferStage::Timeout => "timeout",
            TransferStage::Pipe => "pipe",
        }
    }
}

impl fmt::Display for TransferStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors that can occur in the replication engine.
#[derive(Debug, Error)]
pub enum ReplError {
    /// An identifier failed grammar validation.
    #[error("invalid {kind} name '{name}': {reason}")]
    InvalidName {
        /// Which grammar was applied.
        kind: NameKind,
        /// The rejected identifier, verbatim.
        name: String,
        /// Why it was rejected.
        reason: String,
    },

    /// A sender or receiver exited non-zero, or the pipe between them broke.
    #[error("{stage} failed: {message}")]
    Transfer {
        /// Which side of the pipe failed.
        stage: TransferStage,
        /// Captured diagnostic output of the failing side.
        message: String,
    },

    /// The listing driver reported that the dataset does not exist.
    #[error("dataset does not exist: {dataset}")]
    DatasetNotFound {
        /// The missing dataset.
        dataset: String,
    },

    /// Local snapshot enumeration failed.
    #[error("failed to list snapshots of {dataset}: {message}")]
    Inventory {
        /// Dataset being listed.
        dataset: String,
        /// Captured driver output.
        message: String,
    },

    /// The source dataset has no snapshot to send.
    #[error("no snapshots found for {dataset}")]
    NoSnapshots {
        /// The source dataset.
        dataset: String,
    },

    /// A push or pull was requested without a remote host.
    #[error("remote host required for {direction} replication")]
    MissingRemoteHost {
        /// The requested direction.
        direction: String,
    },

    /// A named SSH connection is not registered.
    #[error("unknown ssh connection: {name}")]
    UnknownConnection {
        /// The requested connection name.
        name: String,
    },

    /// Unknown replication job.
    #[error("replication job {job_id} not found")]
    JobNotFound {
        /// The unknown job identifier.
        job_id: String,
    },

    /// Unknown execution record.
    #[error("execution {execution_id} not found")]
    ExecutionNotFound {
        /// The unknown execution identifier.
        execution_id: u64,
    },

    /// The execution record already reached a terminal state.
    #[error("execution {execution_id} already finalized as {status}")]
    AlreadyFinalized {
        /// The execution identifier.
        execution_id: u64,
        /// The terminal status it holds.
        status: String,
    },

    /// A non-terminal status change that the state machine forbids.
    #[error("execution {execution_id}: cannot move from {from} to {to}")]
    InvalidTransition {
        /// The execution identifier.
        execution_id: u64,
        /// Current status.
        from: String,
        /// Requested status.
        to: String,
    },

    /// A driver program could not be started.
    #[error("failed to start {program}: {source}")]
    Spawn {
        /// The program that failed to start.
        program: String,
        /// Underlying OS error.
        #[source]
        source: std::io::Error,
    },

    /// A registry or record store failed.
    #[error("store error: {msg}")]
    Store {
        /// Error message describing the issue.
        msg: String,
    },

    /// JSON encoding or decoding failed.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl ReplError {
    /// Build a transfer error for the given stage.
    pub fn transfer(stage: TransferStage, message: impl Into<String>) -> Self {
        ReplError::Transfer {
            stage,
            message: message.into(),
        }
    }

    /// Returns the failing stage when this is a transfer error.
    pub fn transfer_stage(&self) -> Option<TransferStage> {
        match self {
            ReplError::Transfer { stage, .. } => Some(*stage),
            _ => None,
        }
    }
}

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, ReplError>;

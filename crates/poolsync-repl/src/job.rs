//! Replication job definitions.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

/// Direction of a replication.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReplicationType {
    /// Local source, receiver on a remote host.
    Push,
    /// Receiver reached through a remote shell, sender local.
    Pull,
    /// Both ends on this host.
    Local,
}

impl ReplicationType {
    /// Stable lowercase name.
    pub fn as_str(&self) -> &'static str {
        match self {
            ReplicationType::Push => "push",
            ReplicationType::Pull => "pull",
            ReplicationType::Local => "local",
        }
    }

    /// Whether the receiver runs behind a remote shell.
    pub fn is_remote(&self) -> bool {
        !matches!(self, ReplicationType::Local)
    }
}

impl fmt::Display for ReplicationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ReplicationType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "push" => Ok(ReplicationType::Push),
            "pull" => Ok(ReplicationType::Pull),
            "local" => Ok(ReplicationType::Local),
            other => Err(format!("unknown replication type: {other}")),
        }
    }
}

/// Stream compression requested from the sender.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CompressionMethod {
    /// Plain stream.
    None,
    /// LZ4 (the default).
    #[default]
    Lz4,
    /// Gzip.
    Gzip,
    /// Zstandard.
    Zstd,
}

impl CompressionMethod {
    /// Stable lowercase name.
    pub fn as_str(&self) -> &'static str {
        match self {
            CompressionMethod::None => "none",
            CompressionMethod::Lz4 => "lz4",
            CompressionMethod::Gzip => "gzip",
            CompressionMethod::Zstd => "zstd",
        }
    }

    /// Whether the sender should emit a compressed stream.
    pub fn is_enabled(&self) -> bool {
        !matches!(self, CompressionMethod::None)
    }
}

impl fmt::Display for CompressionMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CompressionMethod {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "none" => Ok(CompressionMethod::None),
            "lz4" => Ok(CompressionMethod::Lz4),
            "gzip" => Ok(CompressionMethod::Gzip),
            "zstd" => Ok(CompressionMethod::Zstd),
            other => Err(format!("unknown compression method: {other}")),
        }
    }
}

fn default_remote_port() -> u16 {
    22
}

/// Transport configuration for a job or an ad-hoc run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportOptions {
    /// Remote host, optionally as `user@host`.
    pub remote_host: Option<String>,
    /// Remote shell port.
    #[serde(default = "default_remote_port")]
    pub remote_port: u16,
    /// Private key handed to the remote shell client.
    pub ssh_key_path: Option<PathBuf>,
    /// Name of a registered SSH connection; takes precedence over `remote_host`.
    pub ssh_connection: Option<String>,
    /// Bandwidth limit passed through to the transfer programs (not enforced here).
    pub bandwidth_limit: Option<String>,
    /// Skip the parent dataset of a recursive replication.
    pub skip_parent: bool,
    /// Prefer bookmarks as incremental sources.
    pub use_bookmarks: bool,
    /// Explicit receive force; `None` probes the target and forces when it exists.
    pub force: Option<bool>,
}

impl Default for TransportOptions {
    fn default() -> Self {
        Self {
            remote_host: None,
            remote_port: default_remote_port(),
            ssh_key_path: None,
            ssh_connection: None,
            bandwidth_limit: None,
            skip_parent: false,
            use_bookmarks: false,
            force: None,
        }
    }
}

/// A persistent replication job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicationJob {
    /// Stable identifier (UUID v4).
    pub id: String,
    /// Human-readable name.
    pub name: String,
    /// Source dataset.
    pub source_dataset: String,
    /// Target dataset.
    pub target_dataset: String,
    /// Direction.
    pub replication_type: ReplicationType,
    /// Schedule expression; opaque to the engine.
    pub schedule: String,
    /// Whether the job is enabled.
    pub enabled: bool,
    /// Replicate child datasets.
    pub recursive: bool,
    /// Stream compression.
    pub compression: CompressionMethod,
    /// Transport options.
    pub options: TransportOptions,
    /// Creation time (microseconds since epoch).
    pub created_at_us: u64,
    /// Last update time (microseconds since epoch).
    pub updated_at_us: u64,
}

/// Operator input for creating a job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobSpec {
    /// Human-readable name.
    pub name: String,
    /// Source dataset.
    pub source_dataset: String,
    /// Target dataset.
    pub target_dataset: String,
    /// Direction.
    pub replication_type: ReplicationType,
    /// Schedule expression.
    pub schedule: String,
    /// Whether the job starts enabled.
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Replicate child datasets.
    #[serde(default)]
    pub recursive: bool,
    /// Stream compression.
    #[serde(default)]
    pub compression: CompressionMethod,
    /// Transport options.
    #[serde(default)]
    pub options: TransportOptions,
}

fn default_enabled() -> bool {
    true
}

impl JobSpec {
    /// Minimal spec with defaults for everything else.
    pub fn new(
        name: impl Into<String>,
        source_dataset: impl Into<String>,
        target_dataset: impl Into<String>,
        replication_type: ReplicationType,
    ) -> Self {
        Self {
            name: name.into(),
            source_dataset: source_dataset.into(),
            target_dataset: target_dataset.into(),
            replication_type,
            schedule: String::new(),
            enabled: true,
            recursive: false,
            compression: CompressionMethod::default(),
            options: TransportOptions::default(),
        }
    }

    /// Materialize a job with the given identity and timestamp.
    pub fn into_job(self, id: String, now_us: u64) -> ReplicationJob {
        ReplicationJob {
            id,
            name: self.name,
            source_dataset: self.source_dataset,
            target_dataset: self.target_dataset,
            replication_type: self.replication_type,
            schedule: self.schedule,
            enabled: self.enabled,
            recursive: self.recursive,
            compression: self.compression,
            options: self.options,
            created_at_us: now_us,
            updated_at_us: now_us,
        }
    }
}

/// Partial update of a job; `None` fields are left untouched.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct JobUpdate {
    /// New name.
    pub name: Option<String>,
    /// New source dataset.
    pub source_dataset: Option<String>,
    /// New target dataset.
    pub target_dataset: Option<String>,
    /// New direction.
    pub replication_type: Option<ReplicationType>,
    /// New schedule.
    pub schedule: Option<String>,
    /// New enabled flag.
    pub enabled: Option<bool>,
    /// New recursive flag.
    pub recursive: Option<bool>,
    /// New compression.
    pub compression: Option<CompressionMethod>,
    /// Replacement transport options.
    pub options: Option<TransportOptions>,
}

impl JobUpdate {
    /// Apply to `job`, refreshing its update timestamp. The id never changes.
    pub fn apply(self, job: &mut ReplicationJob, now_us: u64) {
        if let Some(v) = self.name {
            job.name = v;
        }
        if let Some(v) = self.source_dataset {
            job.source_dataset = v;
        }
        if let Some(v) = self.target_dataset {
            job.target_dataset = v;
        }
        if let Some(v) = self.replication_type {
            job.replication_type = v;
        }
        if let Some(v) = self.schedule {
            job.schedule = v;
        }
        if let Some(v) = self.enabled {
            job.enabled = v;
        }
        if let Some(v) = self.recursive {
            job.recursive = v;
        }
        if let Some(v) = self.compression {
            job.compression = v;
        }
        if let Some(v) = self.options {
            job.options = v;
        }
        job.updated_at_us = now_us;
    }
}

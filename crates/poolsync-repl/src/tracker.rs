//! Execution records and their state machine.
//!
//! Every replication attempt owns one [`ExecutionRecord`] that moves
//! `pending -> running -> {success, failure}`. The terminal transition
//! happens exactly once per execution id: [`ExecutionTracker::complete`]
//! checks and writes under one lock, and any later call observes
//! [`ReplError::AlreadyFinalized`]. Readers go through the store, which only
//! ever hands out whole committed records.

use crate::error::{ReplError, Result};
use crate::job::ReplicationType;
use crate::notify::{
    failure_subject, success_subject, JobFailureNotice, JobSuccessNotice, NotificationResult,
    NotificationStatus, Notifier,
};
use crate::store::{load_json, poisoned, update_json_locked};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Lifecycle state of one attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionStatus {
    /// Record created, nothing started.
    Pending,
    /// Transfer in progress.
    Running,
    /// Terminal: transfer completed.
    Success,
    /// Terminal: attempt failed.
    Failure,
}

impl ExecutionStatus {
    /// Lowercase name.
    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionStatus::Pending => "pending",
            ExecutionStatus::Running => "running",
            ExecutionStatus::Success => "success",
            ExecutionStatus::Failure => "failure",
        }
    }

    /// True for `success` and `failure`.
    pub fn is_terminal(&self) -> bool {
        matches!(self, ExecutionStatus::Success | ExecutionStatus::Failure)
    }
}

impl fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One replication attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionRecord {
    /// Execution identifier.
    pub id: u64,
    /// Parent job, `None` for ad-hoc runs.
    pub job_id: Option<String>,
    /// Job name, or a generated label for ad-hoc runs.
    pub job_name: String,
    /// Source as given at execution time.
    pub source: String,
    /// Target dataset.
    pub target: String,
    /// Direction of the attempt.
    pub replication_type: ReplicationType,
    /// Current state.
    pub status: ExecutionStatus,
    /// Start time, microseconds since epoch.
    pub started_at_us: u64,
    /// Completion time, set on the terminal transition.
    pub completed_at_us: Option<u64>,
    /// Wall time of the attempt in milliseconds.
    pub duration_ms: Option<u64>,
    /// Bytes relayed from sender to receiver.
    pub bytes_transferred: u64,
    /// Full snapshot reference that was sent.
    pub snapshot_name: Option<String>,
    /// Bare name of the incremental base, if any.
    pub base_snapshot: Option<String>,
    /// Captured driver output.
    pub log_output: String,
    /// Failure text.
    pub error_message: Option<String>,
}

/// Fields known when an attempt starts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewExecution {
    pub job_id: Option<String>,
    pub job_name: String,
    pub source: String,
    pub target: String,
    pub replication_type: ReplicationType,
}

/// Terminal facts recorded by [`ExecutionTracker::complete`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Completion {
    /// Must be `Success` or `Failure`.
    pub status: ExecutionStatus,
    pub bytes_transferred: u64,
    pub snapshot_name: Option<String>,
    pub base_snapshot: Option<String>,
    pub log_output: String,
    pub error_message: Option<String>,
}

impl Completion {
    /// Successful completion.
    pub fn success(
        bytes_transferred: u64,
        snapshot_name: String,
        base_snapshot: Option<String>,
        log_output: String,
    ) -> Self {
        Self {
            status: ExecutionStatus::Success,
            bytes_transferred,
            snapshot_name: Some(snapshot_name),
            base_snapshot,
            log_output,
            error_message: None,
        }
    }

    /// Failed completion carrying whatever was known when the attempt broke.
    ///
    /// The error text doubles as the log until driver output is attached.
    pub fn failure(
        error_message: impl Into<String>,
        snapshot_name: Option<String>,
        base_snapshot: Option<String>,
    ) -> Self {
        let error_message = error_message.into();
        Self {
            status: ExecutionStatus::Failure,
            bytes_transferred: 0,
            snapshot_name,
            base_snapshot,
            log_output: error_message.clone(),
            error_message: Some(error_message),
        }
    }

    /// Attach the bytes moved and the driver output captured before a failure.
    pub fn with_partial(mut self, bytes_transferred: u64, driver_output: &str) -> Self {
        self.bytes_transferred = bytes_transferred;
        let driver_output = driver_output.trim_end();
        if !driver_output.is_empty() {
            self.log_output = format!("{driver_output}\n{}", self.log_output);
        }
        self
    }
}

/// Which notification a log entry belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NotificationKind {
    /// Sent for a successful execution.
    Success,
    /// Sent for a failed execution.
    Failure,
}

/// Audit entry for a dispatched (or failed) notification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotificationLogEntry {
    pub execution_id: u64,
    pub kind: NotificationKind,
    pub recipients: Vec<String>,
    pub subject: String,
    pub body: String,
    pub status: NotificationStatus,
    pub error: Option<String>,
    pub logged_at_us: u64,
}

/// Persistence collaborator for execution records.
pub trait ExecutionStore: Send + Sync {
    /// Insert a `pending` record and return its id.
    fn create_execution_record(&self, new: NewExecution, started_at_us: u64) -> Result<u64>;
    /// Replace a record as a whole.
    fn update_execution_record(&self, record: &ExecutionRecord) -> Result<()>;
    /// Fetch one record.
    fn get_execution_record(&self, execution_id: u64) -> Result<ExecutionRecord>;
    /// Records newest first, optionally for one job.
    fn get_execution_history(
        &self,
        job_id: Option<&str>,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<ExecutionRecord>>;
    /// Records in `pending` or `running`.
    fn get_active_executions(&self) -> Result<Vec<ExecutionRecord>>;
    /// Append to the notification log.
    fn log_notification(&self, entry: NotificationLogEntry) -> Result<()>;
    /// Notification log entries of one execution.
    fn notifications_for(&self, execution_id: u64) -> Result<Vec<NotificationLogEntry>>;
}

#[derive(Debug, Default, Clone, Serialize, Deserialize)]
struct ExecutionLog {
    next_id: u64,
    records: Vec<ExecutionRecord>,
    notifications: Vec<NotificationLogEntry>,
}

impl ExecutionLog {
    fn create(&mut self, new: NewExecution, started_at_us: u64) -> u64 {
        self.next_id += 1;
        let id = self.next_id;
        self.records.push(ExecutionRecord {
            id,
            job_id: new.job_id,
            job_name: new.job_name,
            source: new.source,
            target: new.target,
            replication_type: new.replication_type,
            status: ExecutionStatus::Pending,
            started_at_us,
            completed_at_us: None,
            duration_ms: None,
            bytes_transferred: 0,
            snapshot_name: None,
            base_snapshot: None,
            log_output: String::new(),
            error_message: None,
        });
        id
    }

    fn get(&self, execution_id: u64) -> Result<ExecutionRecord> {
        self.records
            .iter()
            .find(|r| r.id == execution_id)
            .cloned()
            .ok_or(ReplError::ExecutionNotFound { execution_id })
    }

    fn replace(&mut self, record: &ExecutionRecord) -> Result<()> {
        let slot = self
            .records
            .iter_mut()
            .find(|r| r.id == record.id)
            .ok_or(ReplError::ExecutionNotFound {
                execution_id: record.id,
            })?;
        *slot = record.clone();
        Ok(())
    }

    fn history(&self, job_id: Option<&str>, limit: usize, offset: usize) -> Vec<ExecutionRecord> {
        let mut matching: Vec<&ExecutionRecord> = self
            .records
            .iter()
            .filter(|r| job_id.map_or(true, |id| r.job_id.as_deref() == Some(id)))
            .collect();
        matching.sort_by(|a, b| b.started_at_us.cmp(&a.started_at_us).then(b.id.cmp(&a.id)));
        matching.into_iter().skip(offset).take(limit).cloned().collect()
    }

    fn active(&self) -> Vec<ExecutionRecord> {
        self.records
            .iter()
            .filter(|r| !r.status.is_terminal())
            .cloned()
            .collect()
    }

    fn notifications_for(&self, execution_id: u64) -> Vec<NotificationLogEntry> {
        self.notifications
            .iter()
            .filter(|n| n.execution_id == execution_id)
            .cloned()
            .collect()
    }
}

/// Process-local execution store.
#[derive(Debug, Default)]
pub struct MemoryExecutionStore {
    log: RwLock<ExecutionLog>,
}

impl MemoryExecutionStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }
}

impl ExecutionStore for MemoryExecutionStore {
    fn create_execution_record(&self, new: NewExecution, started_at_us: u64) -> Result<u64> {
        Ok(self.log.write().map_err(poisoned)?.create(new, started_at_us))
    }

    fn update_execution_record(&self, record: &ExecutionRecord) -> Result<()> {
        self.log.write().map_err(poisoned)?.replace(record)
    }

    fn get_execution_record(&self, execution_id: u64) -> Result<ExecutionRecord> {
        self.log.read().map_err(poisoned)?.get(execution_id)
    }

    fn get_execution_history(
        &self,
        job_id: Option<&str>,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<ExecutionRecord>> {
        Ok(self.log.read().map_err(poisoned)?.history(job_id, limit, offset))
    }

    fn get_active_executions(&self) -> Result<Vec<ExecutionRecord>> {
        Ok(self.log.read().map_err(poisoned)?.active())
    }

    fn log_notification(&self, entry: NotificationLogEntry) -> Result<()> {
        self.log.write().map_err(poisoned)?.notifications.push(entry);
        Ok(())
    }

    fn notifications_for(&self, execution_id: u64) -> Result<Vec<NotificationLogEntry>> {
        Ok(self.log.read().map_err(poisoned)?.notifications_for(execution_id))
    }
}

/// Execution store persisted as one JSON document.
///
/// Every call re-reads the file and every mutation runs under the file lock,
/// so concurrent processes share one id sequence and never drop each
/// other's records.
#[derive(Debug)]
pub struct FileExecutionStore {
    path: PathBuf,
}

impl FileExecutionStore {
    /// Open (or lazily create) the store at `path`.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let log: ExecutionLog = load_json(&path)?;
        debug!(
            path = %path.display(),
            records = log.records.len(),
            next_id = log.next_id,
            "execution log loaded"
        );
        Ok(Self { path })
    }

    fn load(&self) -> Result<ExecutionLog> {
        load_json(&self.path)
    }

    fn mutate<T>(&self, f: impl FnOnce(&mut ExecutionLog) -> Result<T>) -> Result<T> {
        update_json_locked(&self.path, f)
    }
}

impl ExecutionStore for FileExecutionStore {
    fn create_execution_record(&self, new: NewExecution, started_at_us: u64) -> Result<u64> {
        self.mutate(|log| Ok(log.create(new, started_at_us)))
    }

    fn update_execution_record(&self, record: &ExecutionRecord) -> Result<()> {
        self.mutate(|log| log.replace(record))
    }

    fn get_execution_record(&self, execution_id: u64) -> Result<ExecutionRecord> {
        self.load()?.get(execution_id)
    }

    fn get_execution_history(
        &self,
        job_id: Option<&str>,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<ExecutionRecord>> {
        Ok(self.load()?.history(job_id, limit, offset))
    }

    fn get_active_executions(&self) -> Result<Vec<ExecutionRecord>> {
        Ok(self.load()?.active())
    }

    fn log_notification(&self, entry: NotificationLogEntry) -> Result<()> {
        self.mutate(|log| {
            log.notifications.push(entry);
            Ok(())
        })
    }

    fn notifications_for(&self, execution_id: u64) -> Result<Vec<NotificationLogEntry>> {
        Ok(self.load()?.notifications_for(execution_id))
    }
}

/// Drives execution records through their state machine.
pub struct ExecutionTracker {
    store: Arc<dyn ExecutionStore>,
    notifier: Arc<dyn Notifier>,
    transitions: Mutex<()>,
}

impl fmt::Debug for ExecutionTracker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecutionTracker").finish_non_exhaustive()
    }
}

impl ExecutionTracker {
    /// New tracker writing to `store` and announcing through `notifier`.
    pub fn new(store: Arc<dyn ExecutionStore>, notifier: Arc<dyn Notifier>) -> Self {
        Self {
            store,
            notifier,
            transitions: Mutex::new(()),
        }
    }

    /// Backing store, for read-side queries.
    pub fn store(&self) -> &Arc<dyn ExecutionStore> {
        &self.store
    }

    /// Open a `pending` record for a new attempt.
    pub async fn begin(&self, new: NewExecution) -> Result<u64> {
        let _guard = self.transitions.lock().await;
        let source = new.source.clone();
        let target = new.target.clone();
        let id = self.store.create_execution_record(new, crate::now_us())?;
        info!(execution_id = id, %source, %target, "execution started");
        Ok(id)
    }

    /// `pending -> running`. Any other starting state is rejected.
    pub async fn mark_running(&self, execution_id: u64) -> Result<()> {
        let _guard = self.transitions.lock().await;
        let mut record = self.store.get_execution_record(execution_id)?;
        if record.status != ExecutionStatus::Pending {
            return Err(ReplError::InvalidTransition {
                execution_id,
                from: record.status.to_string(),
                to: ExecutionStatus::Running.to_string(),
            });
        }
        record.status = ExecutionStatus::Running;
        self.store.update_execution_record(&record)?;
        debug!(execution_id, "execution running");
        Ok(())
    }

    /// The single terminal transition of `execution_id`.
    ///
    /// Returns the committed record. A second call fails with
    /// [`ReplError::AlreadyFinalized`] and leaves the first outcome intact.
    /// Notifications fire after the record is committed; their failures are
    /// logged and swallowed.
    pub async fn complete(&self, execution_id: u64, completion: Completion) -> Result<ExecutionRecord> {
        if !completion.status.is_terminal() {
            let current = self.store.get_execution_record(execution_id)?;
            return Err(ReplError::InvalidTransition {
                execution_id,
                from: current.status.to_string(),
                to: completion.status.to_string(),
            });
        }

        let record = {
            let _guard = self.transitions.lock().await;
            let mut record = self.store.get_execution_record(execution_id)?;
            if record.status.is_terminal() {
                return Err(ReplError::AlreadyFinalized {
                    execution_id,
                    status: record.status.to_string(),
                });
            }
            let completed_at = crate::now_us();
            record.status = completion.status;
            record.completed_at_us = Some(completed_at);
            record.duration_ms = Some(completed_at.saturating_sub(record.started_at_us) / 1000);
            record.bytes_transferred = completion.bytes_transferred;
            record.snapshot_name = completion.snapshot_name;
            record.base_snapshot = completion.base_snapshot;
            record.log_output = completion.log_output;
            record.error_message = completion.error_message;
            self.store.update_execution_record(&record)?;
            record
        };

        match record.status {
            ExecutionStatus::Success => info!(
                execution_id,
                bytes = record.bytes_transferred,
                duration_ms = record.duration_ms.unwrap_or_default(),
                "execution succeeded"
            ),
            _ => warn!(
                execution_id,
                error = record.error_message.as_deref().unwrap_or_default(),
                "execution failed"
            ),
        }

        self.notify(&record);
        Ok(record)
    }

    fn notify(&self, record: &ExecutionRecord) {
        let duration_ms = record.duration_ms.unwrap_or_default();
        let (kind, subject, body, result) = match record.status {
            ExecutionStatus::Success => {
                let notice = JobSuccessNotice {
                    job_name: record.job_name.clone(),
                    source: record.source.clone(),
                    target: record.target.clone(),
                    execution_id: record.id,
                    bytes_transferred: record.bytes_transferred,
                    duration_ms,
                };
                let body = format!(
                    "{} -> {}: {} bytes in {} ms",
                    notice.source, notice.target, notice.bytes_transferred, duration_ms
                );
                (
                    NotificationKind::Success,
                    success_subject(&notice.job_name),
                    body,
                    self.notifier.send_job_success_notification(&notice),
                )
            }
            _ => {
                let notice = JobFailureNotice {
                    job_name: record.job_name.clone(),
                    source: record.source.clone(),
                    target: record.target.clone(),
                    execution_id: record.id,
                    error_message: record.error_message.clone().unwrap_or_default(),
                    duration_ms,
                };
                let body = format!(
                    "{} -> {}: {}",
                    notice.source, notice.target, notice.error_message
                );
                (
                    NotificationKind::Failure,
                    failure_subject(&notice.job_name),
                    body,
                    self.notifier.send_job_failure_notification(&notice),
                )
            }
        };
        self.log_dispatch(record.id, kind, subject, body, result);
    }

    fn log_dispatch(
        &self,
        execution_id: u64,
        kind: NotificationKind,
        subject: String,
        body: String,
        result: NotificationResult,
    ) {
        if result.status == NotificationStatus::Skipped {
            return;
        }
        if let Some(error) = &result.error {
            warn!(execution_id, %error, "notification dispatch failed");
        }
        let entry = NotificationLogEntry {
            execution_id,
            kind,
            recipients: result.recipients,
            subject,
            body,
            status: result.status,
            error: result.error,
            logged_at_us: crate::now_us(),
        };
        if let Err(e) = self.store.log_notification(entry) {
            warn!(execution_id, error = %e, "could not record notification");
        }
    }
}

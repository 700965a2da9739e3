//! Operator notifications for finished executions.
//!
//! Notification is a side channel: a failed dispatch is recorded in the
//! notification log but never changes the outcome of the transfer.

use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::{info, warn};

/// Dispatch result of one notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NotificationStatus {
    /// Delivered to at least one recipient.
    Sent,
    /// Not attempted (e.g. notifications disabled).
    Skipped,
    /// Attempted and failed.
    Failed,
}

impl fmt::Display for NotificationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            NotificationStatus::Sent => "sent",
            NotificationStatus::Skipped => "skipped",
            NotificationStatus::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// What a notifier reports back.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotificationResult {
    /// Dispatch status.
    pub status: NotificationStatus,
    /// Who it went to.
    pub recipients: Vec<String>,
    /// Failure reason when `status` is `Failed`.
    pub error: Option<String>,
}

impl NotificationResult {
    /// A delivered notification.
    pub fn sent(recipients: Vec<String>) -> Self {
        Self {
            status: NotificationStatus::Sent,
            recipients,
            error: None,
        }
    }

    /// A notification that was not attempted.
    pub fn skipped() -> Self {
        Self {
            status: NotificationStatus::Skipped,
            recipients: Vec::new(),
            error: None,
        }
    }

    /// A failed dispatch.
    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            status: NotificationStatus::Failed,
            recipients: Vec::new(),
            error: Some(error.into()),
        }
    }
}

/// Facts about a successful execution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobSuccessNotice {
    pub job_name: String,
    pub source: String,
    pub target: String,
    pub execution_id: u64,
    pub bytes_transferred: u64,
    pub duration_ms: u64,
}

/// Facts about a failed execution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobFailureNotice {
    pub job_name: String,
    pub source: String,
    pub target: String,
    pub execution_id: u64,
    pub error_message: String,
    pub duration_ms: u64,
}

/// Notification collaborator.
pub trait Notifier: Send + Sync {
    /// Announce a successful execution.
    fn send_job_success_notification(&self, notice: &JobSuccessNotice) -> NotificationResult;
    /// Announce a failed execution.
    fn send_job_failure_notification(&self, notice: &JobFailureNotice) -> NotificationResult;
}

/// Subject line for a success notification.
pub fn success_subject(job_name: &str) -> String {
    format!("Replication Succeeded: {job_name}")
}

/// Subject line for a failure notification.
pub fn failure_subject(job_name: &str) -> String {
    format!("Replication Failed: {job_name}")
}

/// Notifier that never dispatches anything.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullNotifier;

impl Notifier for NullNotifier {
    fn send_job_success_notification(&self, _notice: &JobSuccessNotice) -> NotificationResult {
        NotificationResult::skipped()
    }

    fn send_job_failure_notification(&self, _notice: &JobFailureNotice) -> NotificationResult {
        NotificationResult::skipped()
    }
}

/// Notifier that writes notifications to the tracing log.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingNotifier;

impl Notifier for TracingNotifier {
    fn send_job_success_notification(&self, n: &JobSuccessNotice) -> NotificationResult {
        info!(
            execution_id = n.execution_id,
            job = %n.job_name,
            source = %n.source,
            target = %n.target,
            bytes = n.bytes_transferred,
            duration_ms = n.duration_ms,
            "{}",
            success_subject(&n.job_name)
        );
        NotificationResult::sent(vec!["log".to_string()])
    }

    fn send_job_failure_notification(&self, n: &JobFailureNotice) -> NotificationResult {
        warn!(
            execution_id = n.execution_id,
            job = %n.job_name,
            source = %n.source,
            target = %n.target,
            error = %n.error_message,
            duration_ms = n.duration_ms,
            "{}",
            failure_subject(&n.job_name)
        );
        NotificationResult::sent(vec!["log".to_string()])
    }
}

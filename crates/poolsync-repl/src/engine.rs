//! Replication orchestration.
//!
//! [`ReplicationEngine`] ties the pieces together. A run validates its names
//! and resolves the remote target before touching anything, then takes the
//! per-pair lock, opens an execution record, picks the snapshot, decides the
//! receive force, resolves the incremental base, builds both command lines
//! and pipes them. Whatever happens after the record is opened, it is
//! completed exactly once and the caller gets a [`ReplicationResult`] rather
//! than an error.

use crate::command::{decide_force, format_bytes, parse_estimate, TransferCommandBuilder};
use crate::config::EngineConfig;
use crate::error::{ReplError, Result, TransferStage};
use crate::inventory::SnapshotInventory;
use crate::job::{
    CompressionMethod, JobSpec, JobUpdate, ReplicationJob, ReplicationType, TransportOptions,
};
use crate::locks::TargetLocks;
use crate::naming::{self, NameKind};
use crate::notify::{Notifier, TracingNotifier};
use crate::pipe::PipeExecutor;
use crate::process::{run_capture, RunOutcome};
use crate::registry::{JobStore, MemoryJobStore};
use crate::remote::{self, ConnectionRegistry, ConnectionTest, RemoteTarget, Via};
use crate::resolver::{target_via, BaseResolver, SnapshotComparison};
use crate::tracker::{
    Completion, ExecutionRecord, ExecutionStatus, ExecutionStore, ExecutionTracker,
    MemoryExecutionStore, NewExecution, NotificationLogEntry,
};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Computes the next run time of a schedule expression.
///
/// The engine does not interpret schedules itself; hosts that do install one.
pub trait ScheduleEvaluator: Send + Sync {
    /// Next run strictly after `after_us`, or `None` if the expression never fires.
    fn next_run(&self, schedule: &str, after_us: u64) -> Option<u64>;
}

/// One replication attempt, ad hoc or built from a job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicationRequest {
    /// Source dataset, or `dataset@snapshot` to send that exact snapshot.
    pub source: String,
    /// Target dataset.
    pub target: String,
    /// Direction.
    pub replication_type: ReplicationType,
    /// Replicate child datasets.
    #[serde(default)]
    pub recursive: bool,
    /// Stream compression.
    #[serde(default)]
    pub compression: CompressionMethod,
    /// Resolve an incremental base; `false` always sends a full stream.
    #[serde(default = "default_incremental")]
    pub incremental: bool,
    /// Transport options.
    #[serde(default)]
    pub options: TransportOptions,
    /// Parent job, if any.
    #[serde(default)]
    pub job_id: Option<String>,
    /// Label stored on the execution record.
    #[serde(default)]
    pub job_name: Option<String>,
}

fn default_incremental() -> bool {
    true
}

impl ReplicationRequest {
    /// Incremental request with default compression and no job attached.
    pub fn new(
        source: impl Into<String>,
        target: impl Into<String>,
        replication_type: ReplicationType,
    ) -> Self {
        Self {
            source: source.into(),
            target: target.into(),
            replication_type,
            recursive: false,
            compression: CompressionMethod::default(),
            incremental: true,
            options: TransportOptions::default(),
            job_id: None,
            job_name: None,
        }
    }

    /// Request equivalent to running `job` now.
    pub fn from_job(job: &ReplicationJob) -> Self {
        Self {
            source: job.source_dataset.clone(),
            target: job.target_dataset.clone(),
            replication_type: job.replication_type,
            recursive: job.recursive,
            compression: job.compression,
            incremental: true,
            options: job.options.clone(),
            job_id: Some(job.id.clone()),
            job_name: Some(job.name.clone()),
        }
    }

    fn label(&self) -> String {
        self.job_name
            .clone()
            .unwrap_or_else(|| format!("{} -> {}", self.source, self.target))
    }
}

/// Caller-facing outcome of an attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicationResult {
    /// Execution record id.
    pub execution_id: u64,
    /// `success` or `failure`.
    pub status: ExecutionStatus,
    /// Full snapshot reference that was sent (or chosen before the failure).
    pub snapshot: Option<String>,
    /// Bare incremental base, if one was used.
    pub incremental_base: Option<String>,
    /// Bytes relayed.
    pub bytes_transferred: u64,
    /// Wall time.
    pub duration_ms: u64,
    /// Failure text.
    pub error: Option<String>,
    /// Captured driver output.
    pub log_output: String,
}

impl From<ExecutionRecord> for ReplicationResult {
    fn from(r: ExecutionRecord) -> Self {
        Self {
            execution_id: r.id,
            status: r.status,
            snapshot: r.snapshot_name,
            incremental_base: r.base_snapshot,
            bytes_transferred: r.bytes_transferred,
            duration_ms: r.duration_ms.unwrap_or_default(),
            error: r.error_message,
            log_output: r.log_output,
        }
    }
}

/// Status summary of a job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobStatus {
    pub job_id: String,
    pub name: String,
    pub enabled: bool,
    /// Start time of the newest execution.
    pub last_run: Option<u64>,
    /// Status of the newest execution.
    pub last_status: Option<ExecutionStatus>,
    /// From the installed [`ScheduleEvaluator`], if any.
    pub next_run: Option<u64>,
}

/// An execution record with its notification log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionDetail {
    #[serde(flatten)]
    pub record: ExecutionRecord,
    pub notifications: Vec<NotificationLogEntry>,
}

/// Dry-run size of the next send of a dataset.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferEstimate {
    /// Snapshot that would be sent.
    pub snapshot: String,
    /// Full reference of the incremental base, if any.
    pub incremental_base: Option<String>,
    /// Estimated stream size.
    pub estimated_bytes: u64,
    /// Human-readable size.
    pub estimated_size: String,
}

#[derive(Debug, Default)]
struct Progress {
    snapshot: Option<String>,
    base: Option<String>,
    bytes_transferred: u64,
    driver_output: String,
}

/// Orchestrates replication attempts and owns the job and execution registries.
pub struct ReplicationEngine {
    config: Arc<EngineConfig>,
    jobs: Arc<dyn JobStore>,
    tracker: ExecutionTracker,
    inventory: SnapshotInventory,
    resolver: BaseResolver,
    executor: PipeExecutor,
    connections: ConnectionRegistry,
    locks: TargetLocks,
    schedule: Option<Arc<dyn ScheduleEvaluator>>,
}

impl fmt::Debug for ReplicationEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReplicationEngine")
            .field("config", &self.config)
            .field("connections", &self.connections.names())
            .finish_non_exhaustive()
    }
}

impl ReplicationEngine {
    /// Build an engine over the given stores and notifier.
    ///
    /// Fails when a configured connection has an invalid host or login name.
    pub fn new(
        config: EngineConfig,
        jobs: Arc<dyn JobStore>,
        executions: Arc<dyn ExecutionStore>,
        notifier: Arc<dyn Notifier>,
    ) -> Result<Self> {
        let connections = ConnectionRegistry::from_config(&config)?;
        let config = Arc::new(config);
        let inventory = SnapshotInventory::new(Arc::clone(&config));
        Ok(Self {
            jobs,
            tracker: ExecutionTracker::new(executions, notifier),
            resolver: BaseResolver::new(inventory.clone()),
            inventory,
            executor: PipeExecutor::new(Arc::clone(&config)),
            connections,
            locks: TargetLocks::new(),
            schedule: None,
            config,
        })
    }

    /// Engine with process-local stores and log notifications.
    pub fn in_memory(config: EngineConfig) -> Result<Self> {
        Self::new(
            config,
            Arc::new(MemoryJobStore::new()),
            Arc::new(MemoryExecutionStore::new()),
            Arc::new(TracingNotifier),
        )
    }

    /// Install a schedule evaluator for `next_run`.
    pub fn with_schedule_evaluator(mut self, evaluator: Arc<dyn ScheduleEvaluator>) -> Self {
        self.schedule = Some(evaluator);
        self
    }

    /// Register or replace a named connection.
    pub fn register_connection(&mut self, name: &str, target: RemoteTarget) -> Result<()> {
        self.connections.register(name, target)
    }

    /// Engine configuration.
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Snapshot inventory used by the engine.
    pub fn inventory(&self) -> &SnapshotInventory {
        &self.inventory
    }

    fn validate_source(source: &str) -> Result<()> {
        if source.contains('@') {
            naming::validate(source, NameKind::FullSnapshot)
        } else {
            naming::validate(source, NameKind::Dataset)
        }
    }

    fn validate_pair(source: &str, target: &str) -> Result<()> {
        Self::validate_source(source)?;
        naming::validate(target, NameKind::Dataset)
    }

    fn remote_for(
        &self,
        direction: ReplicationType,
        options: &TransportOptions,
    ) -> Result<Option<RemoteTarget>> {
        if !direction.is_remote() {
            return Ok(None);
        }
        match self.connections.target_for(options)? {
            Some(target) => Ok(Some(target)),
            None => Err(ReplError::MissingRemoteHost {
                direction: direction.to_string(),
            }),
        }
    }

    /// All jobs, oldest first.
    pub fn list_jobs(&self) -> Result<Vec<ReplicationJob>> {
        self.jobs.list()
    }

    /// One job.
    pub fn get_job(&self, job_id: &str) -> Result<ReplicationJob> {
        self.jobs.get(job_id)
    }

    /// Validate and register a new job under a fresh id.
    pub fn create_job(&self, spec: JobSpec) -> Result<ReplicationJob> {
        Self::validate_pair(&spec.source_dataset, &spec.target_dataset)?;
        let job = spec.into_job(Uuid::new_v4().to_string(), crate::now_us());
        self.jobs.create(job.clone())?;
        info!(job_id = %job.id, name = %job.name, source = %job.source_dataset, target = %job.target_dataset, "replication job created");
        Ok(job)
    }

    /// Apply a partial update.
    pub fn update_job(&self, job_id: &str, update: JobUpdate) -> Result<ReplicationJob> {
        if let Some(source) = &update.source_dataset {
            Self::validate_source(source)?;
        }
        if let Some(target) = &update.target_dataset {
            naming::validate(target, NameKind::Dataset)?;
        }
        let job = self.jobs.update(job_id, update, crate::now_us())?;
        info!(job_id, "replication job updated");
        Ok(job)
    }

    /// Remove a job. Its execution history is kept.
    pub fn delete_job(&self, job_id: &str) -> Result<ReplicationJob> {
        let job = self.jobs.delete(job_id)?;
        info!(job_id, name = %job.name, "replication job deleted");
        Ok(job)
    }

    /// Set `enabled = true`.
    pub fn enable_job(&self, job_id: &str) -> Result<ReplicationJob> {
        self.update_job(
            job_id,
            JobUpdate {
                enabled: Some(true),
                ..JobUpdate::default()
            },
        )
    }

    /// Set `enabled = false`.
    pub fn disable_job(&self, job_id: &str) -> Result<ReplicationJob> {
        self.update_job(
            job_id,
            JobUpdate {
                enabled: Some(false),
                ..JobUpdate::default()
            },
        )
    }

    /// Run a stored job now. Disabled jobs can still be run by hand.
    pub async fn run_job(&self, job_id: &str) -> Result<ReplicationResult> {
        let job = self.jobs.get(job_id)?;
        if !job.enabled {
            debug!(job_id, "running disabled job on request");
        }
        self.execute_replication(ReplicationRequest::from_job(&job)).await
    }

    /// Perform one replication attempt.
    ///
    /// Invalid names and an unresolvable remote target fail with `Err` before
    /// any record is created. Everything after that ends in a completed
    /// execution record, reported through the returned result.
    pub async fn execute_replication(&self, req: ReplicationRequest) -> Result<ReplicationResult> {
        Self::validate_pair(&req.source, &req.target)?;
        let remote = self.remote_for(req.replication_type, &req.options)?;

        let source_dataset = naming::dataset_of(&req.source).to_string();
        let _pair = self.locks.acquire(&source_dataset, &req.target).await;

        let execution_id = self
            .tracker
            .begin(NewExecution {
                job_id: req.job_id.clone(),
                job_name: req.label(),
                source: req.source.clone(),
                target: req.target.clone(),
                replication_type: req.replication_type,
            })
            .await?;

        let mut progress = Progress::default();
        let outcome = match self.tracker.mark_running(execution_id).await {
            Ok(()) => self.attempt(&req, remote.as_ref(), &mut progress).await,
            Err(e) => Err(e),
        };

        let completion = match outcome {
            Ok(transfer) => Completion::success(
                transfer.bytes_transferred,
                progress.snapshot.unwrap_or_default(),
                progress.base,
                transfer.log_output,
            ),
            Err(e) => {
                warn!(execution_id, source = %req.source, target = %req.target, error = %e, "replication attempt failed");
                Completion::failure(e.to_string(), progress.snapshot, progress.base)
                    .with_partial(progress.bytes_transferred, &progress.driver_output)
            }
        };
        let record = self.tracker.complete(execution_id, completion).await?;
        Ok(record.into())
    }

    async fn attempt(
        &self,
        req: &ReplicationRequest,
        remote: Option<&RemoteTarget>,
        progress: &mut Progress,
    ) -> Result<crate::pipe::TransferOutcome> {
        let (dataset, snapshot) = if req.source.contains('@') {
            let (d, s) = naming::split_snapshot(&req.source)?;
            (d.to_string(), s.to_string())
        } else {
            let latest = self.inventory.latest_snapshot(&req.source, &Via::Local).await?;
            let (d, s) = naming::split_snapshot(&latest)?;
            (d.to_string(), s.to_string())
        };
        progress.snapshot = Some(format!("{dataset}@{snapshot}"));

        let via = target_via(req.replication_type, remote)?;
        let force = decide_force(
            req.options.force,
            self.inventory.dataset_exists(&req.target, &via),
        )
        .await;

        let base = if req.incremental {
            self.resolver
                .resolve_base(&req.source, &req.target, req.replication_type, remote)
                .await?
        } else {
            None
        };
        progress.base = base.clone();

        let builder = TransferCommandBuilder::new(&self.config);
        let send = builder.build_send(
            &dataset,
            &snapshot,
            base.as_deref(),
            req.recursive,
            req.compression,
        );
        let receive = builder.build_receive(&req.target, force, req.replication_type.is_remote());
        info!(
            source = %req.source,
            target = %req.target,
            snapshot = %snapshot,
            base = base.as_deref().unwrap_or("-"),
            force,
            "replicating"
        );
        match self
            .executor
            .transfer(&send, &receive, req.replication_type, remote)
            .await
        {
            Ok(outcome) => Ok(outcome),
            Err(failure) => {
                progress.bytes_transferred = failure.bytes_transferred;
                progress.driver_output = failure.log_output;
                Err(failure.error)
            }
        }
    }

    /// Summary of a job and its newest execution.
    pub fn get_replication_status(&self, job_id: &str) -> Result<JobStatus> {
        let job = self.jobs.get(job_id)?;
        let last = self
            .tracker
            .store()
            .get_execution_history(Some(job_id), 1, 0)?
            .into_iter()
            .next();
        let next_run = self
            .schedule
            .as_ref()
            .filter(|_| job.enabled && !job.schedule.is_empty())
            .and_then(|s| s.next_run(&job.schedule, crate::now_us()));
        Ok(JobStatus {
            job_id: job.id,
            name: job.name,
            enabled: job.enabled,
            last_run: last.as_ref().map(|r| r.started_at_us),
            last_status: last.map(|r| r.status),
            next_run,
        })
    }

    /// Execution records newest first, optionally for one job.
    pub fn get_replication_history(
        &self,
        job_id: Option<&str>,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<ExecutionRecord>> {
        self.tracker.store().get_execution_history(job_id, limit, offset)
    }

    /// One execution with its notification log.
    pub fn get_execution_detail(&self, execution_id: u64) -> Result<ExecutionDetail> {
        let store = self.tracker.store();
        Ok(ExecutionDetail {
            record: store.get_execution_record(execution_id)?,
            notifications: store.notifications_for(execution_id)?,
        })
    }

    /// Executions still pending or running.
    pub fn get_active_executions(&self) -> Result<Vec<ExecutionRecord>> {
        self.tracker.store().get_active_executions()
    }

    /// Probe a remote-shell target.
    pub async fn test_connection(&self, target: &RemoteTarget) -> ConnectionTest {
        remote::test_connection(&self.config, target).await
    }

    /// Probe a named connection.
    pub async fn test_named_connection(&self, name: &str) -> Result<ConnectionTest> {
        let target = self.connections.resolve(name)?;
        Ok(self.test_connection(&target).await)
    }

    /// Dry-run size of sending the newest snapshot of `source`, incrementally
    /// from the one before it when `incremental` is set.
    pub async fn estimate_transfer_size(
        &self,
        source: &str,
        incremental: bool,
    ) -> Result<TransferEstimate> {
        naming::validate(source, NameKind::Dataset)?;
        let own: Vec<String> = self
            .inventory
            .list_snapshots(source, &Via::Local)
            .await?
            .into_iter()
            .filter(|s| naming::dataset_of(s) == source)
            .collect();
        let Some(snapshot) = own.last().cloned() else {
            return Err(ReplError::NoSnapshots {
                dataset: source.to_string(),
            });
        };
        let base = if incremental && own.len() >= 2 {
            Some(own[own.len() - 2].clone())
        } else {
            None
        };

        let argv = TransferCommandBuilder::new(&self.config).build_estimate(&snapshot, base.as_deref());
        let out = match run_capture(&argv, None).await? {
            RunOutcome::Finished(out) => out,
            RunOutcome::TimedOut => {
                return Err(ReplError::transfer(TransferStage::Timeout, "size estimate timed out"))
            }
        };
        if !out.success() {
            return Err(ReplError::transfer(TransferStage::Send, out.stderr.trim()));
        }
        // Dry-run output goes to stdout or stderr depending on the driver version.
        let estimated_bytes = parse_estimate(&format!("{}\n{}", out.stdout, out.stderr));
        debug!(source, snapshot = %snapshot, estimated_bytes, "transfer size estimated");
        Ok(TransferEstimate {
            snapshot,
            incremental_base: base,
            estimated_size: format_bytes(estimated_bytes),
            estimated_bytes,
        })
    }

    /// Common, source-only and target-only snapshots of a pair.
    pub async fn compare_snapshots(
        &self,
        source: &str,
        target: &str,
        direction: ReplicationType,
        options: &TransportOptions,
    ) -> Result<SnapshotComparison> {
        Self::validate_pair(source, target)?;
        let remote = self.remote_for(direction, options)?;
        self.resolver
            .compare(source, target, direction, remote.as_ref())
            .await
    }
}

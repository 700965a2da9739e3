//! `poolsync` command line.

use crate::config::EngineConfig;
use crate::engine::{ReplicationEngine, ReplicationRequest};
use crate::job::{CompressionMethod, JobSpec, ReplicationType, TransportOptions};
use crate::notify::TracingNotifier;
use crate::registry::FileJobStore;
use crate::remote::{ConnectionRegistry, RemoteTarget, Via};
use crate::tracker::{ExecutionStatus, FileExecutionStore};
use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;

#[derive(Parser)]
#[command(name = "poolsync")]
#[command(about = "ZFS snapshot replication", long_about = None)]
pub struct Cli {
    /// Engine configuration (TOML or JSON).
    #[arg(short, long, env = "POOLSYNC_CONFIG", default_value = "/etc/poolsync/poolsync.toml")]
    pub config: PathBuf,

    #[command(subcommand)]
    pub command: Command,
}

/// Remote-shell selection shared by several commands.
#[derive(Args, Clone, Debug, Default)]
pub struct RemoteArgs {
    /// Remote host, optionally `user@host`.
    #[arg(long)]
    pub remote_host: Option<String>,
    #[arg(long, default_value = "22")]
    pub remote_port: u16,
    /// Private key for the remote shell.
    #[arg(long)]
    pub ssh_key: Option<PathBuf>,
    /// Named connection from the configuration; wins over --remote-host.
    #[arg(long)]
    pub connection: Option<String>,
}

impl RemoteArgs {
    fn options(&self) -> TransportOptions {
        TransportOptions {
            remote_host: self.remote_host.clone(),
            remote_port: self.remote_port,
            ssh_key_path: self.ssh_key.clone(),
            ssh_connection: self.connection.clone(),
            ..TransportOptions::default()
        }
    }
}

/// Options describing one transfer.
#[derive(Args, Clone, Debug)]
pub struct TransferArgs {
    /// push, pull or local.
    #[arg(short = 't', long = "type", default_value = "local")]
    pub replication_type: ReplicationType,
    #[arg(short, long)]
    pub recursive: bool,
    /// none, lz4, gzip or zstd.
    #[arg(long, default_value = "lz4")]
    pub compression: CompressionMethod,
    /// Always force the receive.
    #[arg(long, conflicts_with = "no_force")]
    pub force: bool,
    /// Never force the receive, even if the target exists.
    #[arg(long)]
    pub no_force: bool,
    #[command(flatten)]
    pub remote: RemoteArgs,
}

impl TransferArgs {
    fn options(&self) -> TransportOptions {
        let force = match (self.force, self.no_force) {
            (true, _) => Some(true),
            (_, true) => Some(false),
            _ => None,
        };
        TransportOptions {
            force,
            ..self.remote.options()
        }
    }
}

#[derive(Subcommand)]
pub enum Command {
    /// Replicate a dataset (or one snapshot) now.
    Run {
        source: String,
        target: String,
        /// Send a full stream even if a common snapshot exists.
        #[arg(long)]
        full: bool,
        #[command(flatten)]
        transfer: TransferArgs,
    },
    /// Manage replication jobs.
    Jobs {
        #[command(subcommand)]
        cmd: JobsCmd,
    },
    /// Execution history, newest first.
    History {
        #[arg(long)]
        job: Option<String>,
        #[arg(short, long, default_value = "20")]
        limit: usize,
        #[arg(long, default_value = "0")]
        offset: usize,
    },
    /// One execution with its notification log.
    Execution { execution_id: u64 },
    /// Executions still pending or running.
    Active,
    /// Snapshots of a dataset, locally or on a remote host.
    Snapshots {
        dataset: String,
        #[command(flatten)]
        remote: RemoteArgs,
    },
    /// Common and one-sided snapshots of a source/target pair.
    Compare {
        source: String,
        target: String,
        #[arg(short = 't', long = "type", default_value = "local")]
        replication_type: ReplicationType,
        #[command(flatten)]
        remote: RemoteArgs,
    },
    /// Dry-run size of the next send.
    Estimate {
        source: String,
        #[arg(long)]
        full: bool,
    },
    /// Check that the remote shell works.
    TestConnection {
        #[command(flatten)]
        remote: RemoteArgs,
    },
}

#[derive(Subcommand, Clone)]
pub enum JobsCmd {
    List,
    Show {
        job_id: String,
    },
    Create {
        name: String,
        source: String,
        target: String,
        #[arg(long, default_value = "")]
        schedule: String,
        /// Create the job disabled.
        #[arg(long)]
        disabled: bool,
        #[command(flatten)]
        transfer: TransferArgs,
    },
    Delete {
        job_id: String,
    },
    Enable {
        job_id: String,
    },
    Disable {
        job_id: String,
    },
    Run {
        job_id: String,
    },
    Status {
        job_id: String,
    },
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn load_config(path: &Path) -> Result<EngineConfig> {
    if path.exists() {
        EngineConfig::from_file(path).with_context(|| format!("loading {}", path.display()))
    } else {
        tracing::warn!("Config file not found, using defaults: {}", path.display());
        Ok(EngineConfig::default())
    }
}

fn open_engine(config: EngineConfig) -> Result<ReplicationEngine> {
    let jobs = FileJobStore::open(config.jobs_path())?;
    let executions = FileExecutionStore::open(config.executions_path())?;
    Ok(ReplicationEngine::new(
        config,
        Arc::new(jobs),
        Arc::new(executions),
        Arc::new(TracingNotifier),
    )?)
}

fn remote_target(config: &EngineConfig, remote: &RemoteArgs) -> Result<Option<RemoteTarget>> {
    Ok(ConnectionRegistry::from_config(config)?.target_for(&remote.options())?)
}

impl Cli {
    pub async fn run(self) -> Result<()> {
        let config = load_config(&self.config)?;
        match self.command {
            Command::Run {
                source,
                target,
                full,
                transfer,
            } => {
                let mut req = ReplicationRequest::new(source, target, transfer.replication_type);
                req.recursive = transfer.recursive;
                req.compression = transfer.compression;
                req.incremental = !full;
                req.options = transfer.options();
                let engine = open_engine(config)?;
                let result = engine.execute_replication(req).await?;
                print_json(&result)?;
                if result.status != ExecutionStatus::Success {
                    anyhow::bail!("replication failed (execution {})", result.execution_id);
                }
                Ok(())
            }
            Command::Jobs { cmd } => Self::jobs(open_engine(config)?, cmd).await,
            Command::History { job, limit, offset } => {
                let engine = open_engine(config)?;
                print_json(&engine.get_replication_history(job.as_deref(), limit, offset)?)
            }
            Command::Execution { execution_id } => {
                let engine = open_engine(config)?;
                print_json(&engine.get_execution_detail(execution_id)?)
            }
            Command::Active => {
                let engine = open_engine(config)?;
                print_json(&engine.get_active_executions()?)
            }
            Command::Snapshots { dataset, remote } => {
                let via = match remote_target(&config, &remote)? {
                    Some(target) => Via::Remote(target),
                    None => Via::Local,
                };
                let engine = open_engine(config)?;
                print_json(&engine.inventory().list_snapshots(&dataset, &via).await?)
            }
            Command::Compare {
                source,
                target,
                replication_type,
                remote,
            } => {
                let engine = open_engine(config)?;
                let cmp = engine
                    .compare_snapshots(&source, &target, replication_type, &remote.options())
                    .await?;
                print_json(&cmp)
            }
            Command::Estimate { source, full } => {
                let engine = open_engine(config)?;
                print_json(&engine.estimate_transfer_size(&source, !full).await?)
            }
            Command::TestConnection { remote } => {
                let Some(target) = remote_target(&config, &remote)? else {
                    anyhow::bail!("--remote-host or --connection is required");
                };
                let engine = open_engine(config)?;
                let probe = engine.test_connection(&target).await;
                print_json(&probe)?;
                if !probe.success {
                    anyhow::bail!("{}", probe.message);
                }
                Ok(())
            }
        }
    }

    async fn jobs(engine: ReplicationEngine, cmd: JobsCmd) -> Result<()> {
        match cmd {
            JobsCmd::List => print_json(&engine.list_jobs()?),
            JobsCmd::Show { job_id } => print_json(&engine.get_job(&job_id)?),
            JobsCmd::Create {
                name,
                source,
                target,
                schedule,
                disabled,
                transfer,
            } => {
                let mut spec = JobSpec::new(name, source, target, transfer.replication_type);
                spec.schedule = schedule;
                spec.enabled = !disabled;
                spec.recursive = transfer.recursive;
                spec.compression = transfer.compression;
                spec.options = transfer.options();
                print_json(&engine.create_job(spec)?)
            }
            JobsCmd::Delete { job_id } => print_json(&engine.delete_job(&job_id)?),
            JobsCmd::Enable { job_id } => print_json(&engine.enable_job(&job_id)?),
            JobsCmd::Disable { job_id } => print_json(&engine.disable_job(&job_id)?),
            JobsCmd::Run { job_id } => {
                let result = engine.run_job(&job_id).await?;
                print_json(&result)?;
                if result.status != ExecutionStatus::Success {
                    anyhow::bail!("replication failed (execution {})", result.execution_id);
                }
                Ok(())
            }
            JobsCmd::Status { job_id } => print_json(&engine.get_replication_status(&job_id)?),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_run_push() {
        let cli = Cli::try_parse_from([
            "poolsync",
            "run",
            "tank/data",
            "backup/data",
            "--type",
            "push",
            "--remote-host",
            "root@nas",
            "--no-force",
            "--full",
        ])
        .unwrap();
        let Command::Run {
            source,
            full,
            transfer,
            ..
        } = cli.command
        else {
            panic!("expected run");
        };
        assert_eq!(source, "tank/data");
        assert!(full);
        assert_eq!(transfer.replication_type, ReplicationType::Push);
        let opts = transfer.options();
        assert_eq!(opts.force, Some(false));
        assert_eq!(opts.remote_host.as_deref(), Some("root@nas"));
    }

    #[test]
    fn test_force_flags_conflict() {
        assert!(Cli::try_parse_from(["poolsync", "run", "a", "b", "--force", "--no-force"]).is_err());
    }

    #[test]
    fn test_parse_jobs_create() {
        let cli = Cli::try_parse_from([
            "poolsync",
            "jobs",
            "create",
            "nightly",
            "tank/data",
            "backup/data",
            "--compression",
            "zstd",
            "--disabled",
        ])
        .unwrap();
        assert!(matches!(
            cli.command,
            Command::Jobs {
                cmd: JobsCmd::Create { disabled: true, .. }
            }
        ));
    }

    #[test]
    fn test_missing_config_uses_defaults() {
        let config = load_config(Path::new("/nonexistent/poolsync.toml")).unwrap();
        assert_eq!(config.zfs_binary, "zfs");
    }
}

//! Snapshot enumeration, locally or over the remote shell.
//!
//! Local listings are authoritative: a driver failure is an error. Remote
//! listings are a best-effort probe: any failure (authentication, timeout,
//! non-zero exit) yields an empty inventory, which callers read as "nothing
//! to diff against".

use crate::config::EngineConfig;
use crate::error::{ReplError, Result};
use crate::naming::{self, NameKind};
use crate::process::{run_capture, RunOutcome};
use crate::remote::{RemoteTarget, SshCommand, Via};
use std::sync::Arc;
use tracing::{debug, warn};

/// Lists snapshots and probes dataset existence through the listing driver.
#[derive(Debug, Clone)]
pub struct SnapshotInventory {
    config: Arc<EngineConfig>,
}

impl SnapshotInventory {
    /// New inventory using the driver programs named in `config`.
    pub fn new(config: Arc<EngineConfig>) -> Self {
        Self { config }
    }

    fn list_args(dataset: &str) -> Vec<String> {
        ["list", "-t", "snapshot", "-H", "-o", "name", "-s", "creation", "-r", dataset]
            .iter()
            .map(|s| s.to_string())
            .collect()
    }

    /// Snapshot listing argv for `via`; remote argv includes the remote-shell client.
    pub fn list_argv(&self, dataset: &str, via: &Via) -> Result<Vec<String>> {
        match via {
            Via::Local => {
                let mut argv = self.config.local_driver();
                argv.extend(Self::list_args(dataset));
                Ok(argv)
            }
            Via::Remote(target) => {
                let mut remote = vec![self.config.remote_zfs_binary.clone()];
                remote.extend(Self::list_args(dataset));
                Ok(self.ssh(target)?.argv(&remote))
            }
        }
    }

    fn ssh<'a>(&'a self, target: &'a RemoteTarget) -> Result<SshCommand<'a>> {
        Ok(SshCommand::new(&self.config.ssh_binary, target)?
            .connect_timeout(self.config.ssh_connect_timeout_secs))
    }

    /// Snapshots of the `dataset` subtree, oldest first.
    pub async fn list_snapshots(&self, dataset: &str, via: &Via) -> Result<Vec<String>> {
        naming::validate(dataset, NameKind::Dataset)?;
        match via {
            Via::Local => self.list_local(dataset).await,
            Via::Remote(target) => Ok(self.list_remote(dataset, target).await),
        }
    }

    async fn list_local(&self, dataset: &str) -> Result<Vec<String>> {
        let argv = self.list_argv(dataset, &Via::Local)?;
        let out = match run_capture(&argv, None).await? {
            RunOutcome::Finished(out) => out,
            RunOutcome::TimedOut => {
                return Err(ReplError::Inventory {
                    dataset: dataset.to_string(),
                    message: "listing timed out".to_string(),
                })
            }
        };
        if out.success() {
            let snaps = out.lines();
            debug!(dataset, count = snaps.len(), "listed local snapshots");
            return Ok(snaps);
        }
        if out.stderr.contains("does not exist") {
            return Err(ReplError::DatasetNotFound {
                dataset: dataset.to_string(),
            });
        }
        Err(ReplError::Inventory {
            dataset: dataset.to_string(),
            message: out.stderr.trim().to_string(),
        })
    }

    async fn list_remote(&self, dataset: &str, target: &RemoteTarget) -> Vec<String> {
        let argv = match self.list_argv(dataset, &Via::Remote(target.clone())) {
            Ok(argv) => argv,
            Err(e) => {
                warn!(dataset, host = %target.host, error = %e, "remote snapshot listing refused");
                return Vec::new();
            }
        };
        match run_capture(&argv, Some(self.config.remote_list_timeout())).await {
            Ok(RunOutcome::Finished(out)) if out.success() => {
                let snaps = out.lines();
                debug!(dataset, host = %target.host, count = snaps.len(), "listed remote snapshots");
                snaps
            }
            Ok(RunOutcome::Finished(out)) => {
                warn!(dataset, host = %target.host, code = ?out.code, stderr = %out.stderr.trim(), "remote snapshot listing failed");
                Vec::new()
            }
            Ok(RunOutcome::TimedOut) => {
                warn!(dataset, host = %target.host, "remote snapshot listing timed out");
                Vec::new()
            }
            Err(e) => {
                warn!(dataset, host = %target.host, error = %e, "remote snapshot listing could not start");
                Vec::new()
            }
        }
    }

    /// Read-only existence probe. Any failure reads as "does not exist".
    pub async fn dataset_exists(&self, dataset: &str, via: &Via) -> bool {
        let mut driver_args: Vec<String> = vec!["list".into(), "-H".into(), "-o".into(), "name".into()];
        driver_args.push(dataset.to_string());
        let argv = match via {
            Via::Local => {
                let mut argv = self.config.local_driver();
                argv.extend(driver_args);
                argv
            }
            Via::Remote(target) => {
                let mut remote = vec![self.config.remote_zfs_binary.clone()];
                remote.extend(driver_args);
                match self.ssh(target) {
                    Ok(ssh) => ssh.argv(&remote),
                    Err(e) => {
                        debug!(dataset, error = %e, "existence probe refused");
                        return false;
                    }
                }
            }
        };
        let timeout = Some(self.config.probe_timeout());
        let exists = matches!(
            run_capture(&argv, timeout).await,
            Ok(RunOutcome::Finished(out)) if out.success()
        );
        debug!(dataset, exists, "dataset existence probe");
        exists
    }

    /// Newest snapshot belonging to `dataset` itself (children excluded).
    pub async fn latest_snapshot(&self, dataset: &str, via: &Via) -> Result<String> {
        let snaps = self.list_snapshots(dataset, via).await?;
        snaps
            .into_iter()
            .rev()
            .find(|s| naming::dataset_of(s) == dataset)
            .ok_or_else(|| ReplError::NoSnapshots {
                dataset: dataset.to_string(),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_local_argv_shape() {
        let config = EngineConfig {
            privilege_prefix: vec!["sudo".into()],
            ..EngineConfig::default()
        };
        let inv = SnapshotInventory::new(Arc::new(config));
        assert_eq!(
            inv.list_argv("tank/data", &Via::Local).unwrap(),
            vec![
                "sudo", "zfs", "list", "-t", "snapshot", "-H", "-o", "name", "-s", "creation",
                "-r", "tank/data"
            ]
        );
    }

    #[test]
    fn test_remote_argv_skips_privilege_prefix() {
        let config = EngineConfig {
            privilege_prefix: vec!["sudo".into()],
            ..EngineConfig::default()
        };
        let inv = SnapshotInventory::new(Arc::new(config));
        let argv = inv
            .list_argv("pool/dst", &Via::Remote(RemoteTarget::new("nas")))
            .unwrap();
        assert_eq!(argv[0], "ssh");
        assert!(argv.contains(&"ConnectTimeout=10".to_string()));
        let host_idx = argv.iter().position(|a| a == "nas").unwrap();
        assert_eq!(argv[host_idx + 1], "zfs");
        assert!(!argv.contains(&"sudo".to_string()));
    }

    #[tokio::test]
    async fn test_invalid_dataset_rejected_before_running() {
        let inv = SnapshotInventory::new(Arc::new(EngineConfig::default()));
        let err = inv.list_snapshots("bad name", &Via::Local).await.unwrap_err();
        assert!(matches!(err, ReplError::InvalidName { .. }));
    }
}

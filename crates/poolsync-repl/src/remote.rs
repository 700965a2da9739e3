//! Remote-shell transport: targets, argv construction and the named connection registry.

use crate::config::{EngineConfig, SshConnectionConfig};
use crate::error::{ReplError, Result};
use crate::job::TransportOptions;
use crate::naming::{self, NameKind};
use crate::process::{run_capture, RunOutcome};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use tracing::{info, warn};

/// A host reachable over the secure remote shell.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteTarget {
    /// Host name or address.
    pub host: String,
    /// Remote shell port.
    pub port: u16,
    /// Login name; `None` leaves it to the client.
    pub username: Option<String>,
    /// Private key path.
    pub key_path: Option<PathBuf>,
}

impl RemoteTarget {
    /// Target on the default port with no explicit identity.
    pub fn new(host: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            port: 22,
            username: None,
            key_path: None,
        }
    }

    /// `user@host`, or just `host`.
    pub fn destination(&self) -> String {
        match &self.username {
            Some(user) => format!("{}@{}", user, self.host),
            None => self.host.clone(),
        }
    }

    /// Check the host and login name before they reach a command line.
    pub fn validate(&self) -> Result<()> {
        naming::validate(&self.host, NameKind::Host)?;
        if let Some(user) = &self.username {
            naming::validate(user, NameKind::User)?;
        }
        Ok(())
    }

    /// Target described inline by transport options; `user@host` is split apart.
    ///
    /// `Ok(None)` when no host was given.
    pub fn from_options(opts: &TransportOptions) -> Result<Option<Self>> {
        let raw = match opts.remote_host.as_deref().map(str::trim) {
            Some(raw) if !raw.is_empty() => raw,
            _ => return Ok(None),
        };
        let (username, host) = match raw.split_once('@') {
            Some((user, host)) => (Some(user.to_string()), host.to_string()),
            None => (None, raw.to_string()),
        };
        let target = Self {
            host,
            port: opts.remote_port,
            username,
            key_path: opts.ssh_key_path.clone(),
        };
        target.validate()?;
        Ok(Some(target))
    }
}

impl TryFrom<&SshConnectionConfig> for RemoteTarget {
    type Error = ReplError;

    fn try_from(c: &SshConnectionConfig) -> Result<Self> {
        let target = Self {
            host: c.host.clone(),
            port: c.port,
            username: c.username.clone(),
            key_path: c.private_key_path.clone(),
        };
        target.validate()?;
        Ok(target)
    }
}

/// Where a driver command runs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Via {
    /// On this host.
    Local,
    /// Behind the remote shell.
    Remote(RemoteTarget),
}

/// Builds remote-shell client argv in non-interactive batch mode.
#[derive(Debug, Clone)]
pub struct SshCommand<'a> {
    binary: &'a str,
    target: &'a RemoteTarget,
    connect_timeout_secs: Option<u64>,
}

impl<'a> SshCommand<'a> {
    /// New builder for `target` using the given client binary.
    ///
    /// Fails when the target's host or login name is not a valid identifier.
    pub fn new(binary: &'a str, target: &'a RemoteTarget) -> Result<Self> {
        target.validate()?;
        Ok(Self {
            binary,
            target,
            connect_timeout_secs: None,
        })
    }

    /// Bound the connection phase.
    pub fn connect_timeout(mut self, secs: u64) -> Self {
        self.connect_timeout_secs = Some(secs);
        self
    }

    /// Full argv running `remote_argv` on the target.
    pub fn argv(&self, remote_argv: &[String]) -> Vec<String> {
        let mut argv = vec![self.binary.to_string()];
        if let Some(key) = &self.target.key_path {
            argv.push("-i".into());
            argv.push(key.display().to_string());
        }
        argv.push("-p".into());
        argv.push(self.target.port.to_string());
        for opt in [
            "BatchMode=yes",
            "StrictHostKeyChecking=no",
            "UserKnownHostsFile=/dev/null",
        ] {
            argv.push("-o".into());
            argv.push(opt.into());
        }
        if let Some(secs) = self.connect_timeout_secs {
            argv.push("-o".into());
            argv.push(format!("ConnectTimeout={secs}"));
        }
        argv.push(self.target.destination());
        argv.extend(remote_argv.iter().cloned());
        argv
    }
}

/// Registry of operator-defined SSH connections, keyed by name.
#[derive(Debug, Clone, Default)]
pub struct ConnectionRegistry {
    connections: HashMap<String, RemoteTarget>,
}

impl ConnectionRegistry {
    /// Build from the configured connection list.
    pub fn from_config(config: &EngineConfig) -> Result<Self> {
        let mut registry = Self::default();
        for c in &config.connections {
            registry.register(&c.name, RemoteTarget::try_from(c)?)?;
        }
        Ok(registry)
    }

    /// Add or replace a named target.
    pub fn register(&mut self, name: &str, target: RemoteTarget) -> Result<()> {
        target.validate()?;
        self.connections.insert(name.to_string(), target);
        Ok(())
    }

    /// Resolve a name into its target.
    pub fn resolve(&self, name: &str) -> Result<RemoteTarget> {
        self.connections
            .get(name)
            .cloned()
            .ok_or_else(|| ReplError::UnknownConnection {
                name: name.to_string(),
            })
    }

    /// Registered names, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.connections.keys().cloned().collect();
        names.sort();
        names
    }

    /// Resolve the remote target for a run: a named connection wins over an inline host.
    pub fn target_for(&self, opts: &TransportOptions) -> Result<Option<RemoteTarget>> {
        if let Some(name) = &opts.ssh_connection {
            return self.resolve(name).map(Some);
        }
        RemoteTarget::from_options(opts)
    }
}

/// Result of a connection probe.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionTest {
    /// Whether the remote shell ran the probe command.
    pub success: bool,
    /// Operator-facing summary.
    pub message: String,
    /// Probe output (stdout on success, stderr on failure).
    pub output: String,
}

/// Run `echo "Connection successful"` on `target`. Never fails; problems are reported in the result.
pub async fn test_connection(config: &EngineConfig, target: &RemoteTarget) -> ConnectionTest {
    let argv = match SshCommand::new(&config.ssh_binary, target) {
        Ok(ssh) => ssh
            .connect_timeout(config.ssh_connect_timeout_secs)
            .argv(&["echo".to_string(), "\"Connection successful\"".to_string()]),
        Err(e) => {
            warn!(host = %target.host, error = %e, "connection test refused");
            return ConnectionTest {
                success: false,
                message: format!("Error: {e}"),
                output: String::new(),
            };
        }
    };

    match run_capture(&argv, Some(config.probe_timeout())).await {
        Ok(RunOutcome::Finished(out)) if out.success() => {
            info!(host = %target.host, port = target.port, "connection test succeeded");
            ConnectionTest {
                success: true,
                message: "Connection successful".to_string(),
                output: out.stdout.trim().to_string(),
            }
        }
        Ok(RunOutcome::Finished(out)) => {
            warn!(host = %target.host, code = ?out.code, "connection test failed");
            ConnectionTest {
                success: false,
                message: format!("Connection failed: {}", out.stderr.trim()),
                output: out.stderr,
            }
        }
        Ok(RunOutcome::TimedOut) => {
            warn!(host = %target.host, "connection test timed out");
            ConnectionTest {
                success: false,
                message: "Connection timed out".to_string(),
                output: String::new(),
            }
        }
        Err(e) => ConnectionTest {
            success: false,
            message: format!("Error: {e}"),
            output: String::new(),
        },
    }
}

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// A named SSH target, as registered by an operator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SshConnectionConfig {
    pub name: String,
    pub host: String,
    #[serde(default = "default_ssh_port")]
    pub port: u16,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub private_key_path: Option<PathBuf>,
}

fn default_ssh_port() -> u16 {
    22
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub zfs_binary: String,
    pub remote_zfs_binary: String,
    pub ssh_binary: String,
    /// Prepended to local driver invocations only (e.g. `["sudo", "-n"]`).
    pub privilege_prefix: Vec<String>,
    pub ssh_connect_timeout_secs: u64,
    pub remote_list_timeout_secs: u64,
    pub probe_timeout_secs: u64,
    /// `None` leaves transfers unbounded.
    pub transfer_timeout_secs: Option<u64>,
    pub state_dir: PathBuf,
    pub connections: Vec<SshConnectionConfig>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            zfs_binary: String::from("zfs"),
            remote_zfs_binary: String::from("zfs"),
            ssh_binary: String::from("ssh"),
            privilege_prefix: Vec::new(),
            ssh_connect_timeout_secs: 10,
            remote_list_timeout_secs: 30,
            probe_timeout_secs: 10,
            transfer_timeout_secs: None,
            state_dir: PathBuf::from("/var/lib/poolsync"),
            connections: Vec::new(),
        }
    }
}

impl EngineConfig {
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or_default();

        match ext.to_lowercase().as_str() {
            "toml" => {
                let config: EngineConfig = toml::from_str(&contents)?;
                Ok(config)
            }
            "json" => {
                let config: EngineConfig = serde_json::from_str(&contents)?;
                Ok(config)
            }
            _ => anyhow::bail!("Unsupported config file extension: {}", ext),
        }
    }

    pub fn remote_list_timeout(&self) -> Duration {
        Duration::from_secs(self.remote_list_timeout_secs)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_secs(self.probe_timeout_secs)
    }

    pub fn transfer_timeout(&self) -> Option<Duration> {
        self.transfer_timeout_secs.map(Duration::from_secs)
    }

    pub fn jobs_path(&self) -> PathBuf {
        self.state_dir.join("jobs.json")
    }

    pub fn executions_path(&self) -> PathBuf {
        self.state_dir.join("executions.json")
    }

    /// Local driver argv head: privilege prefix followed by the driver binary.
    pub fn local_driver(&self) -> Vec<String> {
        let mut argv = self.privilege_prefix.clone();
        argv.push(self.zfs_binary.clone());
        argv
    }
}

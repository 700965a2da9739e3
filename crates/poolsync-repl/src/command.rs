//! Sender and receiver command lines.

use crate::config::EngineConfig;
use crate::job::CompressionMethod;
use std::future::Future;

/// Builds driver argv for both ends of a transfer.
#[derive(Debug, Clone, Copy)]
pub struct TransferCommandBuilder<'a> {
    config: &'a EngineConfig,
}

impl<'a> TransferCommandBuilder<'a> {
    /// New builder using the driver programs in `config`.
    pub fn new(config: &'a EngineConfig) -> Self {
        Self { config }
    }

    /// `send [-R] [-c -w] [-i <dataset>@<base>] <dataset>@<snapshot>`.
    ///
    /// `snapshot` and `base` are bare names.
    pub fn build_send(
        &self,
        dataset: &str,
        snapshot: &str,
        incremental_base: Option<&str>,
        recursive: bool,
        compression: CompressionMethod,
    ) -> Vec<String> {
        let mut argv = self.config.local_driver();
        argv.push("send".into());
        if recursive {
            argv.push("-R".into());
        }
        if compression.is_enabled() {
            argv.push("-c".into());
            argv.push("-w".into());
        }
        if let Some(base) = incremental_base {
            argv.push("-i".into());
            argv.push(format!("{dataset}@{base}"));
        }
        argv.push(format!("{dataset}@{snapshot}"));
        argv
    }

    /// `receive [-F] <target>`. Remote receivers use the remote driver name
    /// and never carry the local privilege prefix.
    pub fn build_receive(&self, target: &str, force: bool, remote: bool) -> Vec<String> {
        let mut argv = if remote {
            vec![self.config.remote_zfs_binary.clone()]
        } else {
            self.config.local_driver()
        };
        argv.push("receive".into());
        if force {
            argv.push("-F".into());
        }
        argv.push(target.to_string());
        argv
    }

    /// Dry-run send that reports the stream size: `send -nvP [-i <base>] <snapshot>`.
    /// Both arguments are full snapshot references.
    pub fn build_estimate(&self, snapshot: &str, base: Option<&str>) -> Vec<String> {
        let mut argv = self.config.local_driver();
        argv.push("send".into());
        argv.push("-nvP".into());
        if let Some(base) = base {
            argv.push("-i".into());
            argv.push(base.to_string());
        }
        argv.push(snapshot.to_string());
        argv
    }
}

/// Receive-side force decision. An explicit value always wins; otherwise the
/// existence probe runs and a populated target is forced.
pub async fn decide_force<F>(explicit: Option<bool>, target_exists: F) -> bool
where
    F: Future<Output = bool>,
{
    match explicit {
        Some(force) => force,
        None => target_exists.await,
    }
}

/// Stream size from dry-run output: the last `size <bytes>` line, 0 if none.
pub fn parse_estimate(output: &str) -> u64 {
    output
        .lines()
        .filter_map(|line| {
            let mut parts = line.split_whitespace();
            match (parts.next(), parts.next()) {
                (Some("size"), Some(n)) => n.replace(',', "").parse::<u64>().ok(),
                _ => None,
            }
        })
        .last()
        .unwrap_or(0)
}

/// Human-readable size with two decimals, 1024 base.
pub fn format_bytes(bytes: u64) -> String {
    let mut value = bytes as f64;
    for unit in ["B", "KB", "MB", "GB", "TB"] {
        if value < 1024.0 {
            return format!("{value:.2} {unit}");
        }
        value /= 1024.0;
    }
    format!("{value:.2} PB")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn builder_config() -> EngineConfig {
        EngineConfig::default()
    }

    mod send {
        use super::*;

        #[test]
        fn test_full_send_plain() {
            let config = builder_config();
            let b = TransferCommandBuilder::new(&config);
            assert_eq!(
                b.build_send("tank/data", "s5", None, false, CompressionMethod::None),
                vec!["zfs", "send", "tank/data@s5"]
            );
        }

        #[test]
        fn test_incremental_recursive_compressed() {
            let config = builder_config();
            let b = TransferCommandBuilder::new(&config);
            assert_eq!(
                b.build_send("tank/data", "s3", Some("s2"), true, CompressionMethod::Zstd),
                vec!["zfs", "send", "-R", "-c", "-w", "-i", "tank/data@s2", "tank/data@s3"]
            );
        }

        #[test]
        fn test_every_compression_but_none_adds_flags() {
            let config = builder_config();
            let b = TransferCommandBuilder::new(&config);
            for c in [CompressionMethod::Lz4, CompressionMethod::Gzip, CompressionMethod::Zstd] {
                let argv = b.build_send("d", "s", None, false, c);
                assert!(argv.contains(&"-c".to_string()) && argv.contains(&"-w".to_string()));
            }
        }
    }

    mod receive {
        use super::*;

        #[test]
        fn test_receive_force_flag() {
            let config = builder_config();
            let b = TransferCommandBuilder::new(&config);
            assert_eq!(b.build_receive("backup/data", true, false), vec!["zfs", "receive", "-F", "backup/data"]);
            assert_eq!(b.build_receive("backup/data", false, false), vec!["zfs", "receive", "backup/data"]);
        }

        #[test]
        fn test_remote_receive_has_no_prefix() {
            let config = EngineConfig {
                privilege_prefix: vec!["sudo".into()],
                remote_zfs_binary: "/usr/sbin/zfs".into(),
                ..EngineConfig::default()
            };
            let b = TransferCommandBuilder::new(&config);
            assert_eq!(b.build_receive("p/d", false, true), vec!["/usr/sbin/zfs", "receive", "p/d"]);
            assert_eq!(b.build_receive("p/d", false, false)[0], "sudo");
        }

        #[tokio::test]
        async fn test_force_auto_detected_when_target_exists() {
            assert!(decide_force(None, async { true }).await);
            assert!(!decide_force(None, async { false }).await);
        }

        #[tokio::test]
        async fn test_explicit_force_overrides_probe() {
            assert!(!decide_force(Some(false), async { true }).await);
            assert!(decide_force(Some(true), async { false }).await);
        }

        #[tokio::test]
        async fn test_explicit_force_skips_probe() {
            let probed = std::sync::atomic::AtomicBool::new(false);
            let probe = async {
                probed.store(true, std::sync::atomic::Ordering::SeqCst);
                true
            };
            decide_force(Some(false), probe).await;
            assert!(!probed.load(std::sync::atomic::Ordering::SeqCst));
        }
    }

    mod estimate {
        use super::*;

        #[test]
        fn test_estimate_argv() {
            let config = builder_config();
            let b = TransferCommandBuilder::new(&config);
            assert_eq!(
                b.build_estimate("d@s2", Some("d@s1")),
                vec!["zfs", "send", "-nvP", "-i", "d@s1", "d@s2"]
            );
        }

        #[test]
        fn test_parse_estimate() {
            let out = "incremental\td@s1\td@s2\t4096\nsize\t123456\n";
            assert_eq!(parse_estimate(out), 123456);
            assert_eq!(parse_estimate("total estimated size is 1.2G"), 0);
            assert_eq!(parse_estimate(""), 0);
        }

        #[test]
        fn test_format_bytes() {
            assert_eq!(format_bytes(0), "0.00 B");
            assert_eq!(format_bytes(1536), "1.50 KB");
            assert_eq!(format_bytes(5 * 1024 * 1024 * 1024), "5.00 GB");
            assert_eq!(format_bytes(u64::MAX), "16384.00 PB");
        }
    }
}

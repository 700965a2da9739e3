//! Fake `zfs` and `ssh` drivers for end-to-end engine tests.
//!
//! Both are shell scripts written into a temporary directory. Dataset state
//! lives in plain files next to them: `<dataset with / as _>.snaps` holds one
//! snapshot per line, oldest first. Marker files switch on failure modes.

#![cfg(unix)]
#![allow(dead_code)]

use poolsync_repl::{EngineConfig, ReplicationEngine};
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use tempfile::TempDir;

const FAKE_ZFS: &str = r#"
echo "$*" >> "$STATE/calls.log"
key() { printf '%s' "$1" | tr '/' '_'; }
for last; do :; done
k=$(key "$last")
case "$1" in
  list)
    if [ -e "$STATE/$k.snaps" ]; then
      if [ "$2" = "-t" ]; then cat "$STATE/$k.snaps"; else echo "$last"; fi
      exit 0
    fi
    echo "cannot open '$last': dataset does not exist" >&2
    exit 1
    ;;
  send)
    if [ -f "$STATE/send.fail" ]; then cat "$STATE/send.fail" >&2; exit 1; fi
    if [ -f "$STATE/send.hang" ]; then exec sleep 30; fi
    if [ "$2" = "-nvP" ]; then
      printf 'full\t%s\t1048576\nsize\t1048576\n' "$last"
      exit 0
    fi
    printf 'STREAM:%s\n' "$*"
    ;;
  receive)
    if [ -f "$STATE/receive.fail" ]; then
      cat >/dev/null
      cat "$STATE/receive.fail" >&2
      exit 1
    fi
    cat > "$STATE/received.stream"
    snap=$(sed -n 's/.*@\([^ ]*\)$/\1/p' "$STATE/received.stream" | tail -n 1)
    echo "$last@$snap" >> "$STATE/$k.snaps"
    ;;
  *)
    echo "unsupported: $*" >&2
    exit 2
    ;;
esac
"#;

const FAKE_SSH: &str = r#"
echo "$*" >> "$STATE/ssh.log"
while [ $# -gt 0 ]; do
  case "$1" in
    -i|-p|-o) shift 2 ;;
    *) break ;;
  esac
done
shift
if [ -f "$STATE/ssh.fail" ]; then echo "Permission denied (publickey)." >&2; exit 255; fi
case "$1" in
  *.sh) exec /bin/sh "$@" ;;
  *) exec "$@" ;;
esac
"#;

/// A temporary pool of fake datasets.
pub struct FakePool {
    dir: TempDir,
}

impl FakePool {
    pub fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let state = dir.path().display().to_string();
        let header = format!("#!/bin/sh\nSTATE='{state}'\n");
        fs::write(dir.path().join("zfs.sh"), format!("{header}{FAKE_ZFS}")).unwrap();
        let ssh = dir.path().join("ssh");
        fs::write(&ssh, format!("{header}{FAKE_SSH}")).unwrap();
        fs::set_permissions(&ssh, fs::Permissions::from_mode(0o755)).unwrap();
        Self { dir }
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    fn key(dataset: &str) -> String {
        dataset.replace('/', "_")
    }

    fn snaps_file(&self, dataset: &str) -> PathBuf {
        self.path().join(format!("{}.snaps", Self::key(dataset)))
    }

    /// Create `dataset` with the given bare snapshot names.
    pub fn add_dataset(&self, dataset: &str, snapshots: &[&str]) {
        let entries: Vec<String> = snapshots.iter().map(|s| format!("{dataset}@{s}")).collect();
        let refs: Vec<&str> = entries.iter().map(String::as_str).collect();
        self.write_listing(dataset, &refs);
    }

    /// Raw listing for `dataset`, full snapshot references in order.
    pub fn write_listing(&self, dataset: &str, entries: &[&str]) {
        let mut body = entries.join("\n");
        if !body.is_empty() {
            body.push('\n');
        }
        fs::write(self.snaps_file(dataset), body).unwrap();
    }

    /// Append a new snapshot to an existing dataset.
    pub fn snapshot(&self, dataset: &str, name: &str) {
        let mut entries = self.snapshots(dataset);
        entries.push(format!("{dataset}@{name}"));
        let refs: Vec<&str> = entries.iter().map(String::as_str).collect();
        self.write_listing(dataset, &refs);
    }

    pub fn snapshots(&self, dataset: &str) -> Vec<String> {
        fs::read_to_string(self.snaps_file(dataset))
            .unwrap_or_default()
            .lines()
            .filter(|l| !l.is_empty())
            .map(str::to_string)
            .collect()
    }

    pub fn fail_receive(&self, stderr: &str) {
        fs::write(self.path().join("receive.fail"), stderr).unwrap();
    }

    pub fn fail_send(&self, stderr: &str) {
        fs::write(self.path().join("send.fail"), stderr).unwrap();
    }

    pub fn hang_send(&self) {
        fs::write(self.path().join("send.hang"), "").unwrap();
    }

    pub fn fail_ssh(&self) {
        fs::write(self.path().join("ssh.fail"), "").unwrap();
    }

    fn log(&self, name: &str) -> Vec<String> {
        fs::read_to_string(self.path().join(name))
            .unwrap_or_default()
            .lines()
            .map(str::to_string)
            .collect()
    }

    /// Every fake zfs invocation, arguments joined by spaces.
    pub fn calls(&self) -> Vec<String> {
        self.log("calls.log")
    }

    pub fn calls_starting(&self, verb: &str) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter(|c| c.starts_with(verb))
            .collect()
    }

    pub fn ssh_calls(&self) -> Vec<String> {
        self.log("ssh.log")
    }

    pub fn config(&self) -> EngineConfig {
        let zfs = self.path().join("zfs.sh").display().to_string();
        EngineConfig {
            privilege_prefix: vec!["/bin/sh".to_string()],
            zfs_binary: zfs.clone(),
            remote_zfs_binary: zfs,
            ssh_binary: self.path().join("ssh").display().to_string(),
            state_dir: self.path().join("state"),
            ..EngineConfig::default()
        }
    }

    pub fn engine(&self) -> ReplicationEngine {
        ReplicationEngine::in_memory(self.config()).unwrap()
    }
}

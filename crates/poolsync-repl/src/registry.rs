//! Replication job registry.
//!
//! The engine talks to jobs only through [`JobStore`]. [`MemoryJobStore`]
//! keeps them in process; [`FileJobStore`] keeps them in a JSON file that is
//! re-read on every call and replaced atomically under a file lock, so
//! definitions survive restarts and several processes can share them.

use crate::error::{ReplError, Result};
use crate::job::{JobUpdate, ReplicationJob};
use crate::store::{load_json, poisoned, update_json_locked};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::RwLock;
use tracing::debug;

/// Repository interface for replication jobs.
pub trait JobStore: Send + Sync {
    /// Fetch one job.
    fn get(&self, job_id: &str) -> Result<ReplicationJob>;
    /// All jobs, ordered by creation time.
    fn list(&self) -> Result<Vec<ReplicationJob>>;
    /// Insert a new job.
    fn create(&self, job: ReplicationJob) -> Result<()>;
    /// Apply a partial update and return the updated job.
    fn update(&self, job_id: &str, update: JobUpdate, now_us: u64) -> Result<ReplicationJob>;
    /// Remove a job.
    fn delete(&self, job_id: &str) -> Result<ReplicationJob>;
}

fn not_found(job_id: &str) -> ReplError {
    ReplError::JobNotFound {
        job_id: job_id.to_string(),
    }
}

fn sorted(jobs: &BTreeMap<String, ReplicationJob>) -> Vec<ReplicationJob> {
    let mut all: Vec<ReplicationJob> = jobs.values().cloned().collect();
    all.sort_by(|a, b| a.created_at_us.cmp(&b.created_at_us).then(a.id.cmp(&b.id)));
    all
}

/// Process-local job registry.
#[derive(Debug, Default)]
pub struct MemoryJobStore {
    jobs: RwLock<BTreeMap<String, ReplicationJob>>,
}

impl MemoryJobStore {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }
}

impl JobStore for MemoryJobStore {
    fn get(&self, job_id: &str) -> Result<ReplicationJob> {
        let jobs = self.jobs.read().map_err(poisoned)?;
        jobs.get(job_id).cloned().ok_or_else(|| not_found(job_id))
    }

    fn list(&self) -> Result<Vec<ReplicationJob>> {
        let jobs = self.jobs.read().map_err(poisoned)?;
        Ok(sorted(&jobs))
    }

    fn create(&self, job: ReplicationJob) -> Result<()> {
        let mut jobs = self.jobs.write().map_err(poisoned)?;
        jobs.insert(job.id.clone(), job);
        Ok(())
    }

    fn update(&self, job_id: &str, update: JobUpdate, now_us: u64) -> Result<ReplicationJob> {
        let mut jobs = self.jobs.write().map_err(poisoned)?;
        let job = jobs.get_mut(job_id).ok_or_else(|| not_found(job_id))?;
        update.apply(job, now_us);
        Ok(job.clone())
    }

    fn delete(&self, job_id: &str) -> Result<ReplicationJob> {
        let mut jobs = self.jobs.write().map_err(poisoned)?;
        jobs.remove(job_id).ok_or_else(|| not_found(job_id))
    }
}

/// Job registry persisted as one JSON document.
#[derive(Debug)]
pub struct FileJobStore {
    path: PathBuf,
}

type JobMap = BTreeMap<String, ReplicationJob>;

impl FileJobStore {
    /// Open (or lazily create) the registry at `path`.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let jobs: JobMap = load_json(&path)?;
        debug!(path = %path.display(), jobs = jobs.len(), "job registry loaded");
        Ok(Self { path })
    }

    /// Location of the backing file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn load(&self) -> Result<JobMap> {
        load_json(&self.path)
    }

    fn mutate<T>(&self, f: impl FnOnce(&mut JobMap) -> Result<T>) -> Result<T> {
        update_json_locked(&self.path, f)
    }
}

impl JobStore for FileJobStore {
    fn get(&self, job_id: &str) -> Result<ReplicationJob> {
        self.load()?.remove(job_id).ok_or_else(|| not_found(job_id))
    }

    fn list(&self) -> Result<Vec<ReplicationJob>> {
        Ok(sorted(&self.load()?))
    }

    fn create(&self, job: ReplicationJob) -> Result<()> {
        self.mutate(|jobs| {
            jobs.insert(job.id.clone(), job);
            Ok(())
        })
    }

    fn update(&self, job_id: &str, update: JobUpdate, now_us: u64) -> Result<ReplicationJob> {
        self.mutate(|jobs| {
            let job = jobs.get_mut(job_id).ok_or_else(|| not_found(job_id))?;
            update.apply(job, now_us);
            Ok(job.clone())
        })
    }

    fn delete(&self, job_id: &str) -> Result<ReplicationJob> {
        self.mutate(|jobs| jobs.remove(job_id).ok_or_else(|| not_found(job_id)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::{JobSpec, ReplicationType};

    fn job(id: &str, at: u64) -> ReplicationJob {
        JobSpec::new(format!("job-{id}"), "tank/data", "backup/data", ReplicationType::Local)
            .into_job(id.to_string(), at)
    }

    fn exercise(store: &dyn JobStore) {
        store.create(job("b", 2)).unwrap();
        store.create(job("a", 1)).unwrap();

        let ids: Vec<String> = store.list().unwrap().into_iter().map(|j| j.id).collect();
        assert_eq!(ids, vec!["a", "b"]);

        let updated = store
            .update(
                "a",
                JobUpdate {
                    enabled: Some(false),
                    ..JobUpdate::default()
                },
                5,
            )
            .unwrap();
        assert!(!updated.enabled);
        assert_eq!(store.get("a").unwrap().updated_at_us, 5);

        store.delete("b").unwrap();
        assert!(matches!(store.get("b"), Err(ReplError::JobNotFound { .. })));
        assert!(matches!(
            store.update("b", JobUpdate::default(), 6),
            Err(ReplError::JobNotFound { .. })
        ));
        assert!(matches!(store.delete("b"), Err(ReplError::JobNotFound { .. })));
    }

    #[test]
    fn test_memory_store_crud() {
        exercise(&MemoryJobStore::new());
    }

    #[test]
    fn test_file_store_crud() {
        let dir = tempfile::tempdir().unwrap();
        exercise(&FileJobStore::open(dir.path().join("jobs.json")).unwrap());
    }

    #[test]
    fn test_file_store_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("jobs.json");
        {
            let store = FileJobStore::open(&path).unwrap();
            store.create(job("keep", 1)).unwrap();
        }
        let reopened = FileJobStore::open(&path).unwrap();
        assert_eq!(reopened.get("keep").unwrap().name, "job-keep");
        assert_eq!(reopened.path(), path.as_path());
    }

    #[test]
    fn test_two_handles_share_one_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("jobs.json");
        let first = FileJobStore::open(&path).unwrap();
        let second = FileJobStore::open(&path).unwrap();

        first.create(job("a", 1)).unwrap();
        second.create(job("b", 2)).unwrap();
        first
            .update(
                "a",
                JobUpdate {
                    enabled: Some(false),
                    ..JobUpdate::default()
                },
                3,
            )
            .unwrap();

        let ids: Vec<String> = FileJobStore::open(&path)
            .unwrap()
            .list()
            .unwrap()
            .into_iter()
            .map(|j| j.id)
            .collect();
        assert_eq!(ids, vec!["a", "b"]);
        assert_eq!(second.get("a").unwrap().updated_at_us, 3);
    }

    #[test]
    fn test_failed_update_leaves_file_untouched() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("jobs.json");
        let store = FileJobStore::open(&path).unwrap();
        store.create(job("a", 1)).unwrap();
        let before = std::fs::read(&path).unwrap();
        assert!(store.delete("missing").is_err());
        assert_eq!(std::fs::read(&path).unwrap(), before);
    }
}

//! Per-(source, target) mutual exclusion.

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex, MutexGuard as StdMutexGuard};
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::debug;

type PairKey = (String, String);

/// Advisory in-process locks keyed by (source dataset, target dataset).
///
/// Attempts on distinct pairs never block each other. A pair's entry lives
/// only while some attempt holds or waits for it.
#[derive(Debug, Default)]
pub struct TargetLocks {
    locks: StdMutex<HashMap<PairKey, Arc<Mutex<()>>>>,
}

/// Held for the duration of one attempt.
#[derive(Debug)]
pub struct PairGuard<'a> {
    table: &'a TargetLocks,
    key: PairKey,
    slot: Arc<Mutex<()>>,
    _guard: OwnedMutexGuard<()>,
}

impl TargetLocks {
    /// Empty lock table.
    pub fn new() -> Self {
        Self::default()
    }

    fn table(&self) -> StdMutexGuard<'_, HashMap<PairKey, Arc<Mutex<()>>>> {
        match self.locks.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Wait for and take the lock on `(source, target)`.
    pub async fn acquire(&self, source: &str, target: &str) -> PairGuard<'_> {
        let key = (source.to_string(), target.to_string());
        let slot = Arc::clone(self.table().entry(key.clone()).or_default());
        if slot.try_lock().is_err() {
            debug!(source, target, "waiting for in-flight replication on the same pair");
        }
        let guard = Arc::clone(&slot).lock_owned().await;
        PairGuard {
            table: self,
            key,
            slot,
            _guard: guard,
        }
    }

    /// True while some attempt holds `(source, target)`.
    pub fn is_locked(&self, source: &str, target: &str) -> bool {
        let key = (source.to_string(), target.to_string());
        self.table()
            .get(&key)
            .is_some_and(|slot| slot.try_lock().is_err())
    }

    /// Number of pairs currently held or waited on.
    pub fn tracked_pairs(&self) -> usize {
        self.table().len()
    }
}

impl Drop for PairGuard<'_> {
    fn drop(&mut self) {
        let mut locks = self.table.table();
        // The table, this guard's lock and `slot` are the only references
        // when nobody else is waiting.
        let idle = locks
            .get(&self.key)
            .is_some_and(|s| Arc::ptr_eq(s, &self.slot) && Arc::strong_count(s) == 3);
        if idle {
            locks.remove(&self.key);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_same_pair_serialized() {
        let locks = Arc::new(TargetLocks::new());
        let guard = locks.acquire("tank/a", "backup/a").await;
        assert!(locks.is_locked("tank/a", "backup/a"));

        let waiter = {
            let locks = Arc::clone(&locks);
            tokio::spawn(async move {
                let _g = locks.acquire("tank/a", "backup/a").await;
            })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!waiter.is_finished());

        drop(guard);
        tokio::time::timeout(Duration::from_secs(5), waiter)
            .await
            .unwrap()
            .unwrap();
        assert!(!locks.is_locked("tank/a", "backup/a"));
        assert_eq!(locks.tracked_pairs(), 0);
    }

    #[tokio::test]
    async fn test_released_pairs_are_forgotten() {
        let locks = TargetLocks::new();
        for i in 0..20 {
            let _g = locks.acquire("tank/a", &format!("backup/{i}")).await;
            assert_eq!(locks.tracked_pairs(), 1);
        }
        assert_eq!(locks.tracked_pairs(), 0);
        assert!(!locks.is_locked("tank/a", "backup/0"));
        assert_eq!(locks.tracked_pairs(), 0);
    }

    #[tokio::test]
    async fn test_slot_kept_while_someone_waits() {
        let locks = Arc::new(TargetLocks::new());
        let first = locks.acquire("tank/a", "backup/a").await;
        let waiter = {
            let locks = Arc::clone(&locks);
            tokio::spawn(async move {
                let _g = locks.acquire("tank/a", "backup/a").await;
                tokio::time::sleep(Duration::from_millis(20)).await;
            })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        drop(first);
        assert_eq!(locks.tracked_pairs(), 1);

        tokio::time::timeout(Duration::from_secs(5), waiter)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(locks.tracked_pairs(), 0);
    }

    #[tokio::test]
    async fn test_distinct_pairs_independent() {
        let locks = TargetLocks::new();
        let _a = locks.acquire("tank/a", "backup/a").await;
        let _b = tokio::time::timeout(Duration::from_secs(1), locks.acquire("tank/a", "backup/b"))
            .await
            .unwrap();
        assert!(locks.is_locked("tank/a", "backup/b"));
    }
}

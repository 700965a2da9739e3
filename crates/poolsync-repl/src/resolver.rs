//! Incremental base resolution.
//!
//! The base is the most recent snapshot present on both sides. The target
//! inventory is reduced to a set of bare names and the source dataset's own
//! snapshots are scanned newest-first for the first member of that set.
//! Scanning the source list guarantees the base is one the source still holds.
//! Snapshots of child datasets in a recursive listing are never candidates,
//! since the send references the base on the parent dataset.

use crate::error::{ReplError, Result};
use crate::inventory::SnapshotInventory;
use crate::job::ReplicationType;
use crate::naming;
use crate::remote::{RemoteTarget, Via};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashSet};
use tracing::{debug, info};

fn bare_names(inventory: &[String]) -> HashSet<&str> {
    inventory.iter().filter_map(|s| naming::bare_name(s)).collect()
}

/// Most recent snapshot of `dataset` whose bare name also appears in `target`.
///
/// `source` must be in ascending creation order and may include child
/// datasets; only entries of `dataset` itself are considered. With `upto`,
/// candidates are limited to that snapshot and the ones created before it,
/// and a `upto` missing from the source yields `None`. Returns `None` when
/// nothing qualifies, including when either inventory is empty.
pub fn most_recent_common(
    dataset: &str,
    source: &[String],
    target: &[String],
    upto: Option<&str>,
) -> Option<String> {
    let target_names = bare_names(target);
    if target_names.is_empty() {
        return None;
    }
    let own: Vec<&str> = source
        .iter()
        .filter(|s| naming::dataset_of(s) == dataset)
        .filter_map(|s| naming::bare_name(s))
        .collect();
    let end = match upto {
        Some(snap) => own.iter().position(|n| *n == snap)? + 1,
        None => own.len(),
    };
    own[..end]
        .iter()
        .rev()
        .find(|name| target_names.contains(*name))
        .map(|name| name.to_string())
}

/// Side-by-side view of two inventories by bare snapshot name.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotComparison {
    /// Names on both sides, sorted.
    pub common: Vec<String>,
    /// Names only on the source, sorted.
    pub source_only: Vec<String>,
    /// Names only on the target, sorted.
    pub target_only: Vec<String>,
}

impl SnapshotComparison {
    /// Compare two inventories.
    pub fn between(source: &[String], target: &[String]) -> Self {
        let s: BTreeSet<&str> = source.iter().filter_map(|x| naming::bare_name(x)).collect();
        let t: BTreeSet<&str> = target.iter().filter_map(|x| naming::bare_name(x)).collect();
        Self {
            common: s.intersection(&t).map(|x| x.to_string()).collect(),
            source_only: s.difference(&t).map(|x| x.to_string()).collect(),
            target_only: t.difference(&s).map(|x| x.to_string()).collect(),
        }
    }
}

/// Where the target side of a replication lives.
pub fn target_via(direction: ReplicationType, remote: Option<&RemoteTarget>) -> Result<Via> {
    match (direction, remote) {
        (ReplicationType::Local, _) => Ok(Via::Local),
        (_, Some(target)) => Ok(Via::Remote(target.clone())),
        (_, None) => Err(ReplError::MissingRemoteHost {
            direction: direction.to_string(),
        }),
    }
}

/// Resolves incremental bases from live inventories.
#[derive(Debug, Clone)]
pub struct BaseResolver {
    inventory: SnapshotInventory,
}

impl BaseResolver {
    /// New resolver over `inventory`.
    pub fn new(inventory: SnapshotInventory) -> Self {
        Self { inventory }
    }

    async fn inventories(
        &self,
        source: &str,
        target: &str,
        direction: ReplicationType,
        remote: Option<&RemoteTarget>,
    ) -> Result<(Vec<String>, Vec<String>)> {
        let source_dataset = naming::dataset_of(source);
        let via = target_via(direction, remote)?;
        let source_snaps = self.inventory.list_snapshots(source_dataset, &Via::Local).await?;
        let target_snaps = match self.inventory.list_snapshots(target, &via).await {
            Ok(snaps) => snaps,
            // A target that does not exist yet simply has nothing in common.
            Err(ReplError::DatasetNotFound { .. }) => Vec::new(),
            Err(e) => return Err(e),
        };
        Ok((source_snaps, target_snaps))
    }

    /// Bare name of the incremental base, or `None` when a full send is required.
    pub async fn resolve_base(
        &self,
        source: &str,
        target: &str,
        direction: ReplicationType,
        remote: Option<&RemoteTarget>,
    ) -> Result<Option<String>> {
        let (source_snaps, target_snaps) =
            self.inventories(source, target, direction, remote).await?;
        let dataset = naming::dataset_of(source);
        let upto = naming::bare_name(source);
        let base = most_recent_common(dataset, &source_snaps, &target_snaps, upto);
        match &base {
            Some(name) => info!(source, target, base = %name, "incremental base resolved"),
            None => debug!(
                source,
                target,
                source_count = source_snaps.len(),
                target_count = target_snaps.len(),
                "no common snapshot; full send required"
            ),
        }
        Ok(base)
    }

    /// Common, source-only and target-only snapshot names.
    pub async fn compare(
        &self,
        source: &str,
        target: &str,
        direction: ReplicationType,
        remote: Option<&RemoteTarget>,
    ) -> Result<SnapshotComparison> {
        let (source_snaps, target_snaps) =
            self.inventories(source, target, direction, remote).await?;
        Ok(SnapshotComparison::between(&source_snaps, &target_snaps))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn inv(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    mod common_base {
        use super::*;

        #[test]
        fn test_most_recent_common_from_source_end() {
            let source = inv(&["d@s1", "d@s2", "d@s3"]);
            let target = inv(&["t@s1", "t@s2"]);
            assert_eq!(most_recent_common("d", &source, &target, None), Some("s2".to_string()));
        }

        #[test]
        fn test_no_common_when_target_empty() {
            assert_eq!(most_recent_common("d", &inv(&["d@s5"]), &[], None), None);
        }

        #[test]
        fn test_no_common_when_source_empty() {
            assert_eq!(most_recent_common("d", &[], &inv(&["t@s1"]), None), None);
        }

        #[test]
        fn test_disjoint_inventories() {
            assert_eq!(most_recent_common("d", &inv(&["d@a"]), &inv(&["t@b"]), None), None);
        }

        #[test]
        fn test_single_common_entry_is_valid_base() {
            let source = inv(&["d@only"]);
            let target = inv(&["t@only"]);
            assert_eq!(most_recent_common("d", &source, &target, None), Some("only".to_string()));
        }

        #[test]
        fn test_source_order_wins_over_target_order() {
            // Target lists s1 last; the source's newest common entry is s3.
            let source = inv(&["d@s1", "d@s2", "d@s3", "d@s4"]);
            let target = inv(&["t@s3", "t@s2", "t@s1"]);
            assert_eq!(most_recent_common("d", &source, &target, None), Some("s3".to_string()));
        }

        #[test]
        fn test_entries_without_at_ignored() {
            let source = inv(&["d", "d@s1"]);
            let target = inv(&["t", "t@s1"]);
            assert_eq!(most_recent_common("d", &source, &target, None), Some("s1".to_string()));
        }

        #[test]
        fn test_child_only_snapshot_never_base() {
            let source = inv(&["d@s1", "d/c@s1", "d/c@c2", "d@s3"]);
            let target = inv(&["t@s1", "t/c@s1", "t/c@c2"]);
            assert_eq!(most_recent_common("d", &source, &target, None), Some("s1".to_string()));
        }

        #[test]
        fn test_child_entries_alone_have_no_base() {
            let source = inv(&["d@s2", "d/c@s1"]);
            let target = inv(&["t@s1"]);
            assert_eq!(most_recent_common("d", &source, &target, None), None);
        }

        #[test]
        fn test_base_not_newer_than_requested_snapshot() {
            let source = inv(&["d@s1", "d@s2", "d@s3"]);
            let target = inv(&["t@s1", "t@s3"]);
            assert_eq!(
                most_recent_common("d", &source, &target, Some("s2")),
                Some("s1".to_string())
            );
            assert_eq!(most_recent_common("d", &source, &target, Some("s1")), Some("s1".to_string()));
        }

        #[test]
        fn test_only_newer_common_means_full_send() {
            let source = inv(&["d@s1", "d@s2"]);
            let target = inv(&["t@s2"]);
            assert_eq!(most_recent_common("d", &source, &target, Some("s1")), None);
        }

        #[test]
        fn test_requested_snapshot_missing_from_source() {
            let source = inv(&["d@s1"]);
            let target = inv(&["t@s1"]);
            assert_eq!(most_recent_common("d", &source, &target, Some("gone")), None);
        }

        #[test]
        fn test_idempotent() {
            let source = inv(&["d@s1", "d@s2"]);
            let target = inv(&["t@s1", "t@s2"]);
            let first = most_recent_common("d", &source, &target, None);
            assert_eq!(first, most_recent_common("d", &source, &target, None));
        }
    }

    #[test]
    fn test_comparison_sets() {
        let cmp = SnapshotComparison::between(&inv(&["d@b", "d@a", "d@c"]), &inv(&["t@c", "t@d", "t@a"]));
        assert_eq!(cmp.common, vec!["a", "c"]);
        assert_eq!(cmp.source_only, vec!["b"]);
        assert_eq!(cmp.target_only, vec!["d"]);
    }

    #[test]
    fn test_target_via() {
        assert_eq!(target_via(ReplicationType::Local, None).unwrap(), Via::Local);
        let remote = RemoteTarget::new("h");
        assert_eq!(
            target_via(ReplicationType::Push, Some(&remote)).unwrap(),
            Via::Remote(remote.clone())
        );
        assert!(matches!(
            target_via(ReplicationType::Pull, None),
            Err(ReplError::MissingRemoteHost { .. })
        ));
    }
}

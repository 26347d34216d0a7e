//! By-owner splitting of operation inputs.
//!
//! Pure functions over an ownership snapshot: they decide which owner gets
//! which subset of a partition set, key set, or entry map, and collect the
//! subset whose partitions currently have no owner. No blocking, no
//! mutation of shared state; the retry and wait logic lives elsewhere.

use crate::ownership::{Assignments, OwnershipView};
use crate::partition::PartitionSet;
use crate::types::{Key, NodeId, PartitionId, Value};
use std::collections::HashMap;

/// Split a partition set by current primary owner.
///
/// Returns the per-owner subsets and, separately, the orphaned subset
/// (partitions with no current owner), or `None` when nothing is orphaned.
pub fn split_partitions_by_owner(
    partitions: &PartitionSet,
    snapshot: &Assignments,
) -> (HashMap<NodeId, PartitionSet>, Option<PartitionSet>) {
    let count = partitions.universe();
    let mut by_owner: HashMap<NodeId, PartitionSet> = HashMap::new();
    let mut orphaned: Option<PartitionSet> = None;

    for partition in partitions.iter() {
        match snapshot.primary(partition) {
            Some(owner) => {
                by_owner
                    .entry(owner)
                    .or_insert_with(|| PartitionSet::new(count))
                    .insert(partition);
            }
            None => {
                orphaned
                    .get_or_insert_with(|| PartitionSet::new(count))
                    .insert(partition);
            }
        }
    }

    (by_owner, orphaned)
}

/// Split a key set by the current primary owner of each key's partition.
pub fn split_keys_by_owner<I>(
    keys: I,
    view: &dyn OwnershipView,
    snapshot: &Assignments,
) -> (HashMap<NodeId, Vec<Key>>, Option<Vec<Key>>)
where
    I: IntoIterator<Item = Key>,
{
    let mut by_owner: HashMap<NodeId, Vec<Key>> = HashMap::new();
    let mut orphaned: Option<Vec<Key>> = None;

    for key in keys {
        match snapshot.primary(view.partition_of(&key)) {
            Some(owner) => by_owner.entry(owner).or_default().push(key),
            None => orphaned.get_or_insert_with(Vec::new).push(key),
        }
    }

    (by_owner, orphaned)
}

/// Group entries by the partition of their key.
pub fn split_entries_by_partition<I>(
    entries: I,
    view: &dyn OwnershipView,
) -> HashMap<PartitionId, Vec<(Key, Value)>>
where
    I: IntoIterator<Item = (Key, Value)>,
{
    let mut by_partition: HashMap<PartitionId, Vec<(Key, Value)>> = HashMap::new();
    for (key, value) in entries {
        by_partition
            .entry(view.partition_of(&key))
            .or_default()
            .push((key, value));
    }
    by_partition
}

/// The set of partitions covering the given keys.
pub fn partitions_of_keys<'a, I>(keys: I, view: &dyn OwnershipView) -> PartitionSet
where
    I: IntoIterator<Item = &'a Key>,
{
    let mut parts = PartitionSet::new(view.partition_count());
    for key in keys {
        parts.insert(view.partition_of(key));
    }
    parts
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::contention::ContentionSlots;
    use crate::ownership::OwnershipDirectory;
    use bytes::Bytes;
    use std::sync::Arc;

    fn snapshot(primaries: Vec<Option<NodeId>>) -> Assignments {
        Assignments::new(1, primaries)
    }

    #[test]
    fn test_split_partitions_no_orphans() {
        let snap = snapshot(vec![Some(1), Some(1), Some(2), Some(2)]);
        let all = PartitionSet::full(4);
        let (by_owner, orphaned) = split_partitions_by_owner(&all, &snap);

        assert!(orphaned.is_none());
        assert_eq!(by_owner.len(), 2);
        assert_eq!(by_owner[&1].iter().collect::<Vec<_>>(), vec![0, 1]);
        assert_eq!(by_owner[&2].iter().collect::<Vec<_>>(), vec![2, 3]);
    }

    #[test]
    fn test_split_partitions_collects_orphans() {
        let snap = snapshot(vec![Some(1), None, Some(2), None]);
        let all = PartitionSet::full(4);
        let (by_owner, orphaned) = split_partitions_by_owner(&all, &snap);

        assert_eq!(by_owner.len(), 2);
        let orphaned = orphaned.unwrap();
        assert_eq!(orphaned.iter().collect::<Vec<_>>(), vec![1, 3]);
    }

    #[test]
    fn test_split_keys_by_owner() {
        let slots = Arc::new(ContentionSlots::new(4));
        let dir = OwnershipDirectory::new(4, slots);
        dir.publish(vec![Some(1), Some(1), Some(2), None]);
        let snap = dir.assignments();

        let keys: Vec<Key> = (0..64u32)
            .map(|i| Bytes::from(format!("key-{i}")))
            .collect();
        let (by_owner, orphaned) = split_keys_by_owner(keys.clone(), &dir, &snap);

        let assigned: usize = by_owner.values().map(Vec::len).sum();
        let orphan_count = orphaned.as_ref().map_or(0, Vec::len);
        assert_eq!(assigned + orphan_count, keys.len());

        // every key landed with the owner of its partition
        for (owner, subset) in &by_owner {
            for key in subset {
                assert_eq!(snap.primary(dir.partition_of(key)), Some(*owner));
            }
        }
        for key in orphaned.iter().flatten() {
            assert_eq!(snap.primary(dir.partition_of(key)), None);
        }
    }

    #[test]
    fn test_partitions_of_keys() {
        let slots = Arc::new(ContentionSlots::new(8));
        let dir = OwnershipDirectory::new(8, slots);
        let keys = vec![Bytes::from_static(b"a"), Bytes::from_static(b"b")];
        let parts = partitions_of_keys(keys.iter(), &dir);
        assert!(!parts.is_empty());
        assert!(parts.len() <= 2);
        for key in &keys {
            assert!(parts.contains(dir.partition_of(key)));
        }
    }
}

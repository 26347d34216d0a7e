//! Partition-ownership views.
//!
//! The ownership directory is an external collaborator: it knows which node
//! currently owns each partition, which nodes are storage-capable and alive,
//! and whether the initial partition assignment has completed. The
//! coordination layer reads it only through snapshots, since ownership can
//! change at any point mid-operation.

use crate::contention::ContentionSlots;
use crate::partition::PartitionSet;
use crate::types::{NodeId, PartitionId};
use parking_lot::RwLock;
use std::hash::Hasher;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::debug;
use twox_hash::XxHash64;

/// An immutable snapshot of the partition→primary mapping.
///
/// Snapshots carry an epoch that increases with every published change;
/// comparing epochs detects "ownership changed between my split and now"
/// without comparing the full table.
#[derive(Debug, Clone)]
pub struct Assignments {
    epoch: u64,
    primaries: Vec<Option<NodeId>>,
}

impl Assignments {
    /// Build a snapshot from a primary table.
    pub fn new(epoch: u64, primaries: Vec<Option<NodeId>>) -> Self {
        Self { epoch, primaries }
    }

    /// The snapshot's epoch.
    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    /// Number of partitions in the universe.
    pub fn partition_count(&self) -> u32 {
        self.primaries.len() as u32
    }

    /// The primary owner of a partition, or `None` if it is orphaned.
    pub fn primary(&self, partition: PartitionId) -> Option<NodeId> {
        self.primaries.get(partition as usize).copied().flatten()
    }

    /// All partitions whose primary is the given node.
    pub fn partitions_of(&self, owner: NodeId) -> PartitionSet {
        let mut parts = PartitionSet::new(self.partition_count());
        for (i, primary) in self.primaries.iter().enumerate() {
            if *primary == Some(owner) {
                parts.insert(i as u32);
            }
        }
        parts
    }

    /// Distinct owners present in the snapshot.
    pub fn owners(&self) -> Vec<NodeId> {
        let mut owners: Vec<NodeId> = self.primaries.iter().flatten().copied().collect();
        owners.sort_unstable();
        owners.dedup();
        owners
    }
}

/// Read-only view of cluster partition ownership.
pub trait OwnershipView: Send + Sync {
    /// Size of the partition universe.
    fn partition_count(&self) -> u32;

    /// The partition a key belongs to. Deterministic for the life of the
    /// service.
    fn partition_of(&self, key: &[u8]) -> PartitionId;

    /// Snapshot of the current partition→primary mapping.
    fn assignments(&self) -> Arc<Assignments>;

    /// Storage-capable members currently alive.
    fn alive_owners(&self) -> Vec<NodeId>;

    /// Whether the initial partition assignment has completed. Until it
    /// has, orphaned partitions mean "not yet assigned" rather than
    /// "mid-transfer".
    fn is_assignment_complete(&self) -> bool;
}

/// Reference `OwnershipView` implementation.
///
/// Publishes immutable snapshots under a write lock and wakes waiters on the
/// per-partition contention slots whenever a partition's primary changes.
pub struct OwnershipDirectory {
    partition_count: u32,
    hash_seed: u64,
    current: RwLock<Arc<Assignments>>,
    alive: RwLock<Vec<NodeId>>,
    assignment_complete: AtomicBool,
    slots: Arc<ContentionSlots>,
}

impl OwnershipDirectory {
    /// Create a directory with every partition initially orphaned.
    pub fn new(partition_count: u32, slots: Arc<ContentionSlots>) -> Self {
        Self {
            partition_count,
            hash_seed: 0x5AFE_CAFE_DEAD_BEEF,
            current: RwLock::new(Arc::new(Assignments::new(
                0,
                vec![None; partition_count as usize],
            ))),
            alive: RwLock::new(Vec::new()),
            assignment_complete: AtomicBool::new(false),
            slots,
        }
    }

    /// The contention slots this directory signals.
    pub fn slots(&self) -> Arc<ContentionSlots> {
        self.slots.clone()
    }

    /// Publish a new primary table; wakes every caller blocked on a
    /// partition whose primary changed.
    pub fn publish(&self, primaries: Vec<Option<NodeId>>) {
        assert_eq!(primaries.len(), self.partition_count as usize);

        let mut changed = PartitionSet::new(self.partition_count);
        {
            let mut current = self.current.write();
            for (i, (old, new)) in current.primaries.iter().zip(&primaries).enumerate() {
                if old != new {
                    changed.insert(i as u32);
                }
            }
            let epoch = current.epoch() + 1;
            *current = Arc::new(Assignments::new(epoch, primaries));
        }

        if !changed.is_empty() {
            debug!(partitions = %changed, "ownership change published");
            self.slots.clear(&changed);
        }
    }

    /// Update the primary of a single partition.
    pub fn set_primary(&self, partition: PartitionId, owner: Option<NodeId>) {
        let mut primaries = self.current.read().primaries.clone();
        primaries[partition as usize] = owner;
        self.publish(primaries);
    }

    /// Replace the set of alive storage members.
    pub fn set_alive(&self, members: Vec<NodeId>) {
        *self.alive.write() = members;
    }

    /// Mark the initial assignment as complete.
    pub fn set_assignment_complete(&self, complete: bool) {
        self.assignment_complete.store(complete, Ordering::Release);
    }
}

impl OwnershipView for OwnershipDirectory {
    fn partition_count(&self) -> u32 {
        self.partition_count
    }

    fn partition_of(&self, key: &[u8]) -> PartitionId {
        let mut hasher = XxHash64::with_seed(self.hash_seed);
        hasher.write(key);
        (hasher.finish() % self.partition_count as u64) as PartitionId
    }

    fn assignments(&self) -> Arc<Assignments> {
        self.current.read().clone()
    }

    fn alive_owners(&self) -> Vec<NodeId> {
        self.alive.read().clone()
    }

    fn is_assignment_complete(&self) -> bool {
        self.assignment_complete.load(Ordering::Acquire)
    }
}

impl std::fmt::Debug for OwnershipDirectory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OwnershipDirectory")
            .field("partition_count", &self.partition_count)
            .field("epoch", &self.current.read().epoch())
            .finish()
    }
}

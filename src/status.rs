//! Per-attempt request status tracking.
//!
//! One status value exists per logical operation, owned by the calling task
//! for the duration of the call including all retries. It records which
//! subset of the work is assigned to which owner, which subset is currently
//! orphaned, and what was last waited on (to detect "nothing changed"
//! loops). Four flavors, one per request shape.

use crate::partition::PartitionSet;
use crate::types::{Key, NodeId, PartitionId, Value};
use std::collections::HashMap;

/// Status of a single-key request attempt.
#[derive(Debug)]
pub struct KeyStatus {
    /// The key's partition; fixed for the life of the call.
    pub partition: PartitionId,
    /// The owner resolved for the current attempt.
    pub owner: Option<NodeId>,
    /// Set once the call has waited on redistribution at least once.
    pub in_transition: bool,
}

impl KeyStatus {
    pub fn new(partition: PartitionId) -> Self {
        Self {
            partition,
            owner: None,
            in_transition: false,
        }
    }

    pub fn mark_in_transition(&mut self) {
        self.in_transition = true;
    }
}

/// Status of a key-set request attempt.
#[derive(Debug, Default)]
pub struct KeySetStatus {
    /// Keys assigned per owner, computed fresh each attempt.
    pub keys_by_owner: HashMap<NodeId, Vec<Key>>,
    /// Keys an owner rejected on the previous attempt.
    pub rejected_keys: Vec<Key>,
    /// Keys whose partition currently has no owner.
    pub orphaned_keys: Option<Vec<Key>>,
    /// Partitions of the orphaned keys.
    pub orphaned_partitions: Option<PartitionSet>,
    /// Partitions last waited on.
    pub in_transition: Option<PartitionSet>,
}

impl KeySetStatus {
    /// True when nothing could be assigned and nothing is orphaned: there
    /// is no target left to send to.
    pub fn is_target_missing(&self) -> bool {
        self.keys_by_owner.is_empty() && self.orphaned_keys.is_none()
    }

    pub fn mark_in_transition(&mut self, partitions: PartitionSet) {
        self.in_transition = Some(partitions);
    }
}

/// Status of an entry-map request attempt (put_all).
#[derive(Debug, Default)]
pub struct EntryStatus {
    /// Entries grouped by partition; regrouping is unnecessary on retry
    /// since rejections come back per partition.
    pub entries_by_partition: HashMap<PartitionId, Vec<(Key, Value)>>,
    /// Entries whose partition currently has no owner.
    pub orphaned_entries: Option<HashMap<PartitionId, Vec<(Key, Value)>>>,
    /// Partitions of the orphaned entries.
    pub orphaned_partitions: Option<PartitionSet>,
    /// Partitions last waited on.
    pub in_transition: Option<PartitionSet>,
}

impl EntryStatus {
    pub fn mark_in_transition(&mut self, partitions: Option<PartitionSet>) {
        self.in_transition = partitions;
    }
}

/// Status of a partition-set request attempt.
#[derive(Debug, Default)]
pub struct PartialStatus {
    /// Partitions assigned per owner, computed fresh each attempt.
    pub partitions_by_owner: HashMap<NodeId, PartitionSet>,
    /// Partitions an owner rejected on the previous attempt.
    pub rejected_partitions: Option<PartitionSet>,
    /// Partitions with no current owner.
    pub orphaned_partitions: Option<PartitionSet>,
    /// Partitions last waited on.
    pub in_transition: Option<PartitionSet>,
}

impl PartialStatus {
    /// True when no owner could be resolved for any requested partition.
    pub fn is_target_missing(&self) -> bool {
        self.partitions_by_owner.is_empty() && self.orphaned_partitions.is_none()
    }

    pub fn mark_in_transition(&mut self, partitions: PartitionSet) {
        self.in_transition = Some(partitions);
    }
}

//! Fixed-size partition sets.
//!
//! A `PartitionSet` is a bitset over the partition universe
//! `[0, partition_count)`. It is the unit of bookkeeping for every
//! partition-shaped operation: request masks, rejection sets, orphan sets.

use crate::types::PartitionId;
use serde::{Deserialize, Serialize};
use std::fmt;

/// A set of partition indexes backed by a fixed-width bitset.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartitionSet {
    /// Size of the partition universe.
    count: u32,
    /// One bit per partition.
    bits: Vec<u64>,
}

impl PartitionSet {
    /// Create an empty set over a universe of `count` partitions.
    pub fn new(count: u32) -> Self {
        Self {
            count,
            bits: vec![0; Self::words(count)],
        }
    }

    /// Create a set containing every partition of the universe.
    pub fn full(count: u32) -> Self {
        let mut set = Self::new(count);
        for word in set.bits.iter_mut() {
            *word = u64::MAX;
        }
        set.trim();
        set
    }

    fn words(count: u32) -> usize {
        ((count as usize) + 63) / 64
    }

    /// Clear any bits beyond the universe.
    fn trim(&mut self) {
        let tail = self.count as usize % 64;
        if tail != 0 {
            if let Some(last) = self.bits.last_mut() {
                *last &= (1u64 << tail) - 1;
            }
        }
    }

    /// Size of the partition universe this set ranges over.
    pub fn universe(&self) -> u32 {
        self.count
    }

    /// Add a partition. Returns true if it was not already present.
    pub fn insert(&mut self, partition: PartitionId) -> bool {
        debug_assert!(partition < self.count);
        let (w, b) = (partition as usize / 64, partition as usize % 64);
        let present = self.bits[w] & (1 << b) != 0;
        self.bits[w] |= 1 << b;
        !present
    }

    /// Remove a partition. Returns true if it was present.
    pub fn remove(&mut self, partition: PartitionId) -> bool {
        debug_assert!(partition < self.count);
        let (w, b) = (partition as usize / 64, partition as usize % 64);
        let present = self.bits[w] & (1 << b) != 0;
        self.bits[w] &= !(1 << b);
        present
    }

    /// Whether the set contains the given partition.
    pub fn contains(&self, partition: PartitionId) -> bool {
        if partition >= self.count {
            return false;
        }
        let (w, b) = (partition as usize / 64, partition as usize % 64);
        self.bits[w] & (1 << b) != 0
    }

    /// Add every partition of `other` to this set.
    pub fn union(&mut self, other: &PartitionSet) {
        debug_assert_eq!(self.count, other.count);
        for (w, o) in self.bits.iter_mut().zip(&other.bits) {
            *w |= o;
        }
    }

    /// Keep only partitions also present in `other`.
    pub fn retain(&mut self, other: &PartitionSet) {
        debug_assert_eq!(self.count, other.count);
        for (w, o) in self.bits.iter_mut().zip(&other.bits) {
            *w &= o;
        }
    }

    /// Remove every partition of `other` from this set.
    pub fn remove_all(&mut self, other: &PartitionSet) {
        debug_assert_eq!(self.count, other.count);
        for (w, o) in self.bits.iter_mut().zip(&other.bits) {
            *w &= !o;
        }
    }

    /// Whether this set shares at least one partition with `other`.
    pub fn intersects(&self, other: &PartitionSet) -> bool {
        self.bits.iter().zip(&other.bits).any(|(w, o)| w & o != 0)
    }

    /// Whether the set is empty.
    pub fn is_empty(&self) -> bool {
        self.bits.iter().all(|w| *w == 0)
    }

    /// Number of partitions in the set.
    pub fn len(&self) -> usize {
        self.bits.iter().map(|w| w.count_ones() as usize).sum()
    }

    /// Remove every partition from the set.
    pub fn clear(&mut self) {
        for w in self.bits.iter_mut() {
            *w = 0;
        }
    }

    /// The lowest partition in the set, if any.
    pub fn first(&self) -> Option<PartitionId> {
        self.iter().next()
    }

    /// Iterate the partitions in ascending order.
    pub fn iter(&self) -> impl Iterator<Item = PartitionId> + '_ {
        self.bits.iter().enumerate().flat_map(move |(wi, word)| {
            let mut w = *word;
            std::iter::from_fn(move || {
                if w == 0 {
                    None
                } else {
                    let b = w.trailing_zeros();
                    w &= w - 1;
                    Some(wi as u32 * 64 + b)
                }
            })
        })
    }

    /// Build a set from an iterator of partitions.
    pub fn from_iter(count: u32, parts: impl IntoIterator<Item = PartitionId>) -> Self {
        let mut set = Self::new(count);
        for p in parts {
            set.insert(p);
        }
        set
    }
}

impl fmt::Debug for PartitionSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PartitionSet{:?}", self.iter().collect::<Vec<_>>())
    }
}

impl fmt::Display for PartitionSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self.iter().map(|p| p.to_string()).collect();
        write!(f, "{{{}}}", parts.join(", "))
    }
}

//! Per-partition redistribution contention tracking.
//!
//! One `Contention` slot exists per partition for the life of the service.
//! When an owner rejects a request because the partition is mid-transfer,
//! the coordinator arms the slot and blocks on it; the ownership directory
//! clears the slot (and wakes waiters) when it publishes a new primary for
//! that partition. The wait protocol lets a single "trickle" waiter per
//! partition re-probe the server if no notification arrives, so a stalled
//! transfer does not turn into a retry storm across every blocked caller.

use crate::error::{Error, Result};
use crate::partition::PartitionSet;
use crate::types::{Deadline, NodeId, PartitionId};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tracing::trace;

#[derive(Debug, Default)]
struct ContentionState {
    /// True while a rejection for this partition is outstanding and no
    /// ownership update has arrived yet.
    contended: bool,
    /// Waiters currently blocked on this slot, in arrival order. The head
    /// is the designated trickle waiter.
    waiters: Vec<u64>,
}

/// Contention record for one partition.
#[derive(Debug, Default)]
pub struct Contention {
    state: Mutex<ContentionState>,
    notify: Notify,
}

impl Contention {
    /// Whether the slot has been cleared (or never armed).
    fn is_cleared(&self) -> bool {
        !self.state.lock().contended
    }

    /// Add a waiter if not already enlisted.
    fn enlist(&self, waiter: u64) {
        let mut state = self.state.lock();
        if !state.waiters.contains(&waiter) {
            state.waiters.push(waiter);
        }
    }

    /// Remove a waiter.
    fn delist(&self, waiter: u64) {
        self.state.lock().waiters.retain(|w| *w != waiter);
    }

    /// Whether the waiter is at the head of the waiter list.
    fn is_head(&self, waiter: u64) -> bool {
        self.state.lock().waiters.first() == Some(&waiter)
    }
}

/// Removes the waiter from the slot on every exit path.
struct WaiterGuard<'a> {
    slot: &'a Contention,
    waiter: u64,
}

impl Drop for WaiterGuard<'_> {
    fn drop(&mut self) {
        self.slot.delist(self.waiter);
    }
}

/// The per-partition contention slot array, shared by every client task and
/// the ownership-update notifier. No lock spans more than one partition.
pub struct ContentionSlots {
    slots: Vec<Arc<Contention>>,
    next_waiter: AtomicU64,
}

impl ContentionSlots {
    /// Allocate one slot per partition.
    pub fn new(partition_count: u32) -> Self {
        Self {
            slots: (0..partition_count)
                .map(|_| Arc::new(Contention::default()))
                .collect(),
            next_waiter: AtomicU64::new(1),
        }
    }

    /// Size of the partition universe.
    pub fn partition_count(&self) -> u32 {
        self.slots.len() as u32
    }

    fn slot(&self, partition: PartitionId) -> &Arc<Contention> {
        &self.slots[partition as usize]
    }

    /// Arm the slots for partitions whose owner just rejected a request.
    pub fn arm(&self, partitions: impl IntoIterator<Item = PartitionId>) {
        for p in partitions {
            self.slot(p).state.lock().contended = true;
        }
    }

    /// Clear the slots for partitions whose ownership just changed, waking
    /// every waiter. Called by the ownership-update notification path.
    pub fn clear(&self, partitions: &PartitionSet) {
        for p in partitions.iter() {
            let slot = self.slot(p);
            slot.state.lock().contended = false;
            slot.notify.notify_waiters();
        }
    }

    /// Whether the slot for a partition has been cleared.
    pub fn is_cleared(&self, partition: PartitionId) -> bool {
        self.slot(partition).is_cleared()
    }

    /// Block until ownership resolves for enough of the rejected partitions,
    /// the trickle policy allows a re-probe, or the deadline elapses.
    ///
    /// `rejected` maps each rejected partition to the owner that rejected
    /// the previous attempt (`None` when the partition was found orphaned);
    /// `primary_of` reads the current primary fresh on every check.
    ///
    /// Resolution rules, evaluated per cycle:
    /// - a cleared slot, or a current primary differing from the hinted
    ///   previous owner, counts the partition as resolved without waiting;
    /// - once at least half of the rejected partitions have resolved, the
    ///   caller retries immediately rather than accumulating more delay;
    /// - otherwise the caller parks on each unresolved slot in bounded
    ///   ticks; if a tick elapses unsignaled and this waiter heads the
    ///   slot's waiter list, it becomes the trickle waiter and retries
    ///   alone.
    pub async fn wait_for_redistribution(
        &self,
        mut rejected: HashMap<PartitionId, Option<NodeId>>,
        primary_of: &(dyn Fn(PartitionId) -> Option<NodeId> + Sync),
        tick: Duration,
        deadline: Deadline,
    ) -> Result<()> {
        let total = rejected.len();
        if total == 0 {
            return Ok(());
        }

        let waiter = self.next_waiter.fetch_add(1, Ordering::Relaxed);
        let mut cleared = 0usize;
        let mut changed = 0usize;

        loop {
            let mut pending: Vec<(PartitionId, Arc<Contention>)> = Vec::new();

            rejected.retain(|&partition, previous| {
                let slot = self.slot(partition);
                if slot.is_cleared() {
                    cleared += 1;
                    return false;
                }
                // the owner may have moved since the failed attempt even
                // though no clear was observed yet
                let current = primary_of(partition);
                if current.is_some() && current != *previous {
                    changed += 1;
                    return false;
                }
                pending.push((partition, slot.clone()));
                true
            });

            // at least half of the partitions have been cleared or updated;
            // no need to wait any longer
            if 2 * (cleared + changed) >= total {
                trace!(cleared, changed, total, "redistribution wait resolved");
                return Ok(());
            }

            for (partition, slot) in pending {
                slot.enlist(waiter);
                let _guard = WaiterGuard {
                    slot: &slot,
                    waiter,
                };

                if slot.is_cleared() {
                    // re-evaluate whether the request should proceed or
                    // wait for more partitions to clear
                    break;
                }

                let notified = slot.notify.notified();
                let _ = tokio::time::timeout(deadline.clamp(tick), notified).await;

                if deadline.expired() {
                    return Err(Error::timeout());
                }

                if slot.is_cleared() {
                    break;
                }

                // nothing came for a full tick; force a single request back
                // to the server, one waiter per partition
                if slot.is_head(waiter) {
                    trace!(partition, "trickle waiter re-probing");
                    return Ok(());
                }
            }
        }
    }
}

impl std::fmt::Debug for ContentionSlots {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContentionSlots")
            .field("partition_count", &self.partition_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    const TICK: Duration = Duration::from_millis(20);

    fn no_owner(_: PartitionId) -> Option<NodeId> {
        None
    }

    #[tokio::test]
    async fn test_cleared_slots_resolve_immediately() {
        let slots = ContentionSlots::new(4);
        // never armed: everything counts as cleared
        let rejected: HashMap<_, _> = [(0, Some(1)), (1, Some(1))].into();
        slots
            .wait_for_redistribution(rejected, &no_owner, TICK, Deadline::Never)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_owner_change_counts_as_resolved() {
        let slots = ContentionSlots::new(4);
        slots.arm([0, 1]);
        // both partitions now report a different primary than the hint
        let rejected: HashMap<_, _> = [(0, Some(1)), (1, Some(1))].into();
        slots
            .wait_for_redistribution(rejected, &|_| Some(2), TICK, Deadline::Never)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_half_resolved_heuristic() {
        let slots = ContentionSlots::new(4);
        slots.arm([0, 1]);
        slots.clear(&PartitionSet::from_iter(4, [0]));
        // one of two resolved: 2*1 >= 2 -> return without waiting
        let started = Instant::now();
        let rejected: HashMap<_, _> = [(0, Some(1)), (1, Some(1))].into();
        slots
            .wait_for_redistribution(rejected, &no_owner, TICK, Deadline::Never)
            .await
            .unwrap();
        assert!(started.elapsed() < TICK);
    }

    #[tokio::test]
    async fn test_wakes_on_clear() {
        let slots = Arc::new(ContentionSlots::new(4));
        slots.arm([2]);

        let waiter = {
            let slots = slots.clone();
            tokio::spawn(async move {
                let rejected: HashMap<_, _> = [(2, Some(7))].into();
                slots
                    .wait_for_redistribution(rejected, &|_| Some(7), TICK, Deadline::Never)
                    .await
            })
        };

        tokio::time::sleep(Duration::from_millis(5)).await;
        slots.clear(&PartitionSet::from_iter(4, [2]));
        waiter.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_trickle_waiter_released_after_tick() {
        let slots = ContentionSlots::new(4);
        slots.arm([3]);
        let started = Instant::now();
        let rejected: HashMap<_, _> = [(3, Some(7))].into();
        // sole waiter becomes the trickle waiter after one tick
        slots
            .wait_for_redistribution(rejected, &|_| Some(7), TICK, Deadline::Never)
            .await
            .unwrap();
        assert!(started.elapsed() >= TICK);
        // waiter list must be empty again
        assert!(slots.slot(3).state.lock().waiters.is_empty());
    }

    #[tokio::test]
    async fn test_deadline_times_out() {
        let slots = ContentionSlots::new(4);
        slots.arm([1]);
        let rejected: HashMap<_, _> = [(1, Some(7))].into();
        let deadline = Deadline::after(Some(Duration::from_millis(5)));
        let err = slots
            .wait_for_redistribution(rejected, &|_| Some(7), Duration::from_millis(50), deadline)
            .await
            .unwrap_err();
        assert!(err.is_timeout());
        assert!(slots.slot(1).state.lock().waiters.is_empty());
    }
}

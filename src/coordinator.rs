//! The per-call retry driver.
//!
//! Every operation flavor runs the same loop: resolve targets against an
//! ownership snapshot, dispatch one sub-request per distinct owner, fold
//! rejected work back into the next iteration, and wait on the contention
//! slots whenever a partition has no owner or an owner rejected the
//! previous attempt. Transient ownership conditions are fully absorbed
//! here; callers only ever see terminal outcomes.

use crate::config::GridConfig;
use crate::contention::ContentionSlots;
use crate::error::{Error, PartialResult, Result};
use crate::message::{KeyOp, KeyResponse, KeySetOp, PartialOp, Request, RequestBody, Response};
use crate::ownership::{Assignments, OwnershipView};
use crate::partition::PartitionSet;
use crate::split;
use crate::status::{EntryStatus, KeySetStatus, KeyStatus, PartialStatus};
use crate::transport::{PollOutcome, Transport};
use crate::types::{CacheId, Deadline, Key, NodeId, PartitionId, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::debug;

/// Chooses a read target for a partition, allowing eventually-consistent
/// reads against members other than the primary.
pub type ReadLocator = Arc<dyn Fn(PartitionId, &Assignments) -> Option<NodeId> + Send + Sync>;

/// Lifecycle flags shared between the facade and the coordinator.
///
/// `active` drops when this cache reference is released or the cache is
/// destroyed; `running` drops when the whole cache service terminates.
#[derive(Debug)]
pub struct Lifecycle {
    active: AtomicBool,
    running: AtomicBool,
}

impl Lifecycle {
    pub fn new() -> Self {
        Self {
            active: AtomicBool::new(true),
            running: AtomicBool::new(true),
        }
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire) && self.is_running()
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    pub fn release(&self) {
        self.active.store(false, Ordering::Release);
    }

    pub fn stop(&self) {
        self.running.store(false, Ordering::Release);
    }
}

impl Default for Lifecycle {
    fn default() -> Self {
        Self::new()
    }
}

/// The retry driver for one logical cache.
pub struct Coordinator {
    cache_id: CacheId,
    config: GridConfig,
    view: Arc<dyn OwnershipView>,
    transport: Arc<dyn Transport>,
    slots: Arc<ContentionSlots>,
    lifecycle: Arc<Lifecycle>,
    read_locator: Option<ReadLocator>,
}

impl Coordinator {
    pub fn new(
        cache_id: CacheId,
        config: GridConfig,
        view: Arc<dyn OwnershipView>,
        transport: Arc<dyn Transport>,
        slots: Arc<ContentionSlots>,
        lifecycle: Arc<Lifecycle>,
    ) -> Self {
        Self {
            cache_id,
            config,
            view,
            transport,
            slots,
            lifecycle,
            read_locator: None,
        }
    }

    /// Install a custom read-target chooser for get operations.
    pub fn set_read_locator(&mut self, locator: Option<ReadLocator>) {
        self.read_locator = locator;
    }

    pub fn lifecycle(&self) -> &Arc<Lifecycle> {
        &self.lifecycle
    }

    pub fn view(&self) -> &Arc<dyn OwnershipView> {
        &self.view
    }

    pub fn config(&self) -> &GridConfig {
        &self.config
    }

    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    /// A deadline from the configured request timeout.
    pub fn deadline(&self) -> Deadline {
        Deadline::after(self.config.request_timeout)
    }

    /// Fail-fast check run by every operation before doing any work.
    pub fn check_active(&self) -> Result<()> {
        if self.lifecycle.is_active() {
            Ok(())
        } else if self.lifecycle.is_running() {
            Err(Error::CacheDestroyed)
        } else {
            Err(Error::ServiceStopped)
        }
    }

    /// The error for a storage-bound call that found no storage: reported
    /// as service termination, a missing cache reference, or the absence
    /// of storage members, in that order of specificity.
    fn on_missing_storage(&self) -> Error {
        if !self.lifecycle.is_running() {
            Error::ServiceStopped
        } else if self.view.alive_owners().is_empty() {
            Error::NoStorage
        } else if !self.lifecycle.is_active() {
            Error::CacheDestroyed
        } else {
            Error::Internal("the storage is not available to complete the request".into())
        }
    }

    fn key_request(&self, op: KeyOp, key: Key) -> Request {
        Request {
            cache_id: self.cache_id,
            body: RequestBody::Key { op, key },
        }
    }

    pub(crate) fn partial_request(&self, op: PartialOp, partitions: PartitionSet) -> Request {
        Request {
            cache_id: self.cache_id,
            body: RequestBody::Partial { op, partitions },
        }
    }

    fn current_primary(&self) -> impl Fn(PartitionId) -> Option<NodeId> + Sync + '_ {
        move |p| self.view.assignments().primary(p)
    }

    /// Attach the responses gathered so far to a timeout raised while
    /// waiting on redistribution, so the caller can still merge them.
    fn attach_partial(error: Error, parts: Vec<(NodeId, Response)>) -> Error {
        match error {
            Error::Timeout { partial: None } if !parts.is_empty() => Error::Timeout {
                partial: Some(PartialResult::Raw(parts)),
            },
            e => e,
        }
    }

    // ---- single-key operations ------------------------------------------

    /// Resolve the owner for a key's partition, waiting through
    /// redistribution when a previous attempt was rejected or no owner is
    /// currently known.
    async fn ensure_key_target(
        &self,
        partition: PartitionId,
        mut status: Option<KeyStatus>,
        read_allowed: bool,
        deadline: Deadline,
    ) -> Result<(KeyStatus, NodeId)> {
        loop {
            let mut current = match status.take() {
                None => KeyStatus::new(partition),
                Some(mut s) => {
                    self.wait_key_redistribution(&mut s, deadline).await?;
                    if !self.lifecycle.is_active() {
                        return Err(self.on_missing_storage());
                    }
                    s
                }
            };

            let snapshot = self.view.assignments();
            let target = match (&self.read_locator, read_allowed) {
                (Some(locator), true) => locator(partition, &snapshot),
                _ => snapshot.primary(partition),
            };

            if let Some(owner) = target {
                current.owner = Some(owner);
                return Ok((current, owner));
            }

            if self.view.alive_owners().is_empty() {
                return Err(self.on_missing_storage());
            }

            status = Some(current);
        }
    }

    async fn wait_key_redistribution(
        &self,
        status: &mut KeyStatus,
        deadline: Deadline,
    ) -> Result<()> {
        let mut rejected = HashMap::new();
        rejected.insert(status.partition, status.owner);
        status.mark_in_transition();

        self.slots.arm([status.partition]);
        self.slots
            .wait_for_redistribution(
                rejected,
                &self.current_primary(),
                self.config.redistribution_tick,
                deadline,
            )
            .await
    }

    /// Run a single-key request to completion: resolve, dispatch, and
    /// re-resolve for as long as the owner keeps rejecting.
    pub async fn send_key_request(
        &self,
        op: KeyOp,
        key: Key,
        read_allowed: bool,
        deadline: Deadline,
    ) -> Result<KeyResponse> {
        self.check_active()?;
        let partition = self.view.partition_of(&key);
        let mut status: Option<KeyStatus> = None;

        loop {
            let (s, owner) = self
                .ensure_key_target(partition, status.take(), read_allowed, deadline)
                .await?;

            let request = self.key_request(op.clone(), key.clone());
            let response = match self.transport.poll(owner, request, deadline).await {
                Ok(r) => r,
                Err(e) => return Err(self.recover_key_failure(e, &key, &op, deadline).await),
            };

            match response {
                Response::Key(r) if r.rejected => {
                    // the owner vacated the partition mid-request; remember
                    // it so the wait can tell real progress from none
                    self.slots.arm([partition]);
                    status = Some(s);
                }
                Response::Key(r) => {
                    if let Some(failure) = r.failure {
                        return Err(Error::Remote(failure));
                    }
                    return Ok(r);
                }
                other => {
                    return Err(Error::Internal(format!(
                        "unexpected response to key request: {other:?}"
                    )))
                }
            }
        }
    }

    /// Lock-style requests cannot know whether the lease was granted when
    /// the poll fails mid-flight, so a best-effort unlock is issued before
    /// the original failure propagates.
    async fn recover_key_failure(
        &self,
        error: Error,
        key: &Key,
        op: &KeyOp,
        deadline: Deadline,
    ) -> Error {
        if let KeyOp::Lock { holder, .. } = op {
            let unlock = KeyOp::Unlock { holder: *holder };
            let _ = Box::pin(self.send_key_request(unlock, key.clone(), false, deadline)).await;
        }
        error
    }

    // ---- key-set operations ---------------------------------------------

    /// Map each rejected key to the owner that held it on the previous
    /// attempt (or `None` for keys that were orphaned all along).
    fn collect_rejected_partitions(
        &self,
        rejected_keys: &[Key],
        keys_by_owner: &HashMap<NodeId, Vec<Key>>,
    ) -> HashMap<PartitionId, Option<NodeId>> {
        let mut rejected: HashMap<PartitionId, Option<NodeId>> = HashMap::new();

        for key in rejected_keys {
            let partition = self.view.partition_of(key);
            let previous = keys_by_owner
                .iter()
                .find(|(_, keys)| keys.contains(key))
                .map(|(owner, _)| *owner);
            rejected.insert(partition, previous);
        }

        rejected
    }

    /// Wait on the partitions the previous attempt actually failed on:
    /// keys an owner rejected (with that owner as the hint) plus the
    /// orphaned partitions. Partitions of keys that still have a live,
    /// unrejecting owner are left out, so their slots stay clear.
    async fn wait_keyset_redistribution(
        &self,
        status: &mut KeySetStatus,
        deadline: Deadline,
    ) -> Result<()> {
        let mut rejected =
            self.collect_rejected_partitions(&status.rejected_keys, &status.keys_by_owner);
        if let Some(orphaned) = &status.orphaned_partitions {
            for partition in orphaned.iter() {
                rejected.entry(partition).or_insert(None);
            }
            // rejected partitions were armed when the rejection came back;
            // only orphans need arming here
            self.slots.arm(orphaned.iter());
        }

        status.mark_in_transition(PartitionSet::from_iter(
            self.view.partition_count(),
            rejected.keys().copied(),
        ));

        self.slots
            .wait_for_redistribution(
                rejected,
                &self.current_primary(),
                self.config.redistribution_tick,
                deadline,
            )
            .await?;

        status.rejected_keys.clear();
        status.orphaned_keys = None;
        status.orphaned_partitions = None;
        Ok(())
    }

    /// Split the remaining keys by owner, waiting through redistribution
    /// until at least part of the work has a live target.
    async fn ensure_keyset_target(
        &self,
        keys: &[Key],
        mut status: Option<KeySetStatus>,
        deadline: Deadline,
    ) -> Result<KeySetStatus> {
        loop {
            let mut current = match status.take() {
                None => KeySetStatus::default(),
                Some(mut s) => {
                    self.wait_keyset_redistribution(&mut s, deadline).await?;
                    if !self.lifecycle.is_active() {
                        return Err(self.on_missing_storage());
                    }
                    s
                }
            };

            let snapshot = self.view.assignments();
            let (by_owner, orphaned) =
                split::split_keys_by_owner(keys.iter().cloned(), self.view.as_ref(), &snapshot);

            current.keys_by_owner = by_owner;
            current.orphaned_keys = orphaned;

            if current.orphaned_keys.is_none() && !current.keys_by_owner.is_empty() {
                // common case
                current.orphaned_partitions = None;
                return Ok(current);
            }

            current.orphaned_partitions = Some(split::partitions_of_keys(
                current.orphaned_keys.iter().flatten(),
                self.view.as_ref(),
            ));

            if self.view.is_assignment_complete() {
                if self.view.assignments().epoch() == snapshot.epoch() {
                    // orphans exist but the assignment has completed;
                    // proceed with the partial request
                    if !current.keys_by_owner.is_empty() {
                        return Ok(current);
                    }
                } else {
                    // ownership moved while splitting; the snapshot is
                    // stale, force an immediate re-check without waiting
                    status = None;
                    continue;
                }
            }

            if keys.is_empty() {
                return Err(Error::ConcurrentModification);
            }

            if self.view.alive_owners().is_empty() {
                return Err(self.on_missing_storage());
            }

            status = Some(current);
        }
    }

    /// Order the per-owner dispatch set so that a self-targeted sub-request
    /// goes last, keeping local fast-path processing from observing shared
    /// inputs before the remote sends are serialized.
    fn order_self_last(&self, mut requests: Vec<(NodeId, Request)>) -> Vec<(NodeId, Request)> {
        let local = self.transport.local_node();
        if let Some(pos) = requests.iter().position(|(node, _)| *node == local) {
            let last = requests.len() - 1;
            requests.swap(pos, last);
        }
        requests
    }

    /// Dispatch a key-set request to every owner of the keys, retrying
    /// rejected and orphaned keys until none remain or the deadline
    /// elapses. Returns the accumulated per-owner responses.
    pub async fn send_keyset_request(
        &self,
        op: KeySetOp,
        keys: Vec<Key>,
        deadline: Deadline,
    ) -> Result<Vec<(NodeId, Response)>> {
        self.check_active()?;

        let total = keys.len();
        let mut parts: Vec<(NodeId, Response)> = Vec::new();
        let mut resend = keys;
        let mut status: Option<KeySetStatus> = None;

        loop {
            let s = match self
                .ensure_keyset_target(&resend, status.take(), deadline)
                .await
            {
                Ok(s) => s,
                Err(e) => return Err(Self::attach_partial(e, parts)),
            };
            if s.is_target_missing() {
                return Ok(parts);
            }

            let requests: Vec<(NodeId, Request)> = s
                .keys_by_owner
                .iter()
                .map(|(owner, subset)| {
                    (
                        *owner,
                        Request {
                            cache_id: self.cache_id,
                            body: RequestBody::KeySet {
                                op: op.clone(),
                                keys: subset.clone(),
                            },
                        },
                    )
                })
                .collect();
            let requests = self.order_self_last(requests);

            let outcome = match self.transport.poll_all(requests, deadline).await {
                Ok(outcome) => outcome,
                Err(e) => return Err(Self::attach_partial(e, parts)),
            };
            let responses = match outcome {
                PollOutcome::Complete(responses) => responses,
                PollOutcome::TimedOut(responses) => {
                    parts.extend(responses);
                    return Err(Error::Timeout {
                        partial: Some(PartialResult::Raw(parts)),
                    });
                }
            };

            // fold rejected and orphaned keys into the next round
            let mut s = s;
            let mut next: Vec<Key> = s.orphaned_keys.clone().unwrap_or_default();
            s.rejected_keys.clear();
            for (node, response) in responses {
                let rejected = response.rejected_keys();
                if !rejected.is_empty() {
                    self.slots.arm(
                        split::partitions_of_keys(rejected.iter(), self.view.as_ref()).iter(),
                    );
                    s.rejected_keys.extend(rejected.iter().cloned());
                }
                parts.push((node, response));
            }
            next.extend(s.rejected_keys.iter().cloned());

            if next.is_empty() {
                return Ok(parts);
            }

            self.report_repeat("key-set request", next.len(), total, None);
            resend = next;
            status = Some(s);
        }
    }

    /// Split-and-post without retry, for fire-and-forget cleanup requests.
    pub fn post_keyset_request(&self, op: KeySetOp, keys: Vec<Key>) {
        let snapshot = self.view.assignments();
        let (by_owner, _) =
            split::split_keys_by_owner(keys.into_iter(), self.view.as_ref(), &snapshot);

        for (owner, subset) in by_owner {
            self.transport.post(
                owner,
                Request {
                    cache_id: self.cache_id,
                    body: RequestBody::KeySet {
                        op: op.clone(),
                        keys: subset,
                    },
                },
            );
        }
    }

    // ---- entry-map operations -------------------------------------------

    /// Dispatch entry insertions to the owners of their partitions,
    /// retrying rejected partitions until every entry has landed.
    pub async fn send_entry_request(
        &self,
        entries: Vec<(Key, Value)>,
        ttl_ms: Option<u64>,
        deadline: Deadline,
    ) -> Result<Vec<(NodeId, Response)>> {
        self.check_active()?;

        let mut remaining = split::split_entries_by_partition(entries, self.view.as_ref());
        let total = remaining.values().map(Vec::len).sum::<usize>();
        let mut parts: Vec<(NodeId, Response)> = Vec::new();
        let mut status = EntryStatus::default();
        let mut waited = false;

        while !remaining.is_empty() {
            if waited && !self.lifecycle.is_active() {
                return Err(self.on_missing_storage());
            }

            let snapshot = self.view.assignments();
            let universe = self.view.partition_count();
            let part_set = PartitionSet::from_iter(universe, remaining.keys().copied());
            let (by_owner, orphaned) = split::split_partitions_by_owner(&part_set, &snapshot);

            status.orphaned_partitions = orphaned.clone();

            if let Some(orphaned) = &orphaned {
                let complete = self.view.is_assignment_complete();
                let unchanged = self.view.assignments().epoch() == snapshot.epoch();
                let proceed_partial = complete && unchanged && !by_owner.is_empty();

                if !proceed_partial {
                    if complete && !unchanged {
                        // stale snapshot, re-split immediately
                        continue;
                    }
                    if self.view.alive_owners().is_empty() {
                        return Err(self.on_missing_storage());
                    }

                    status.mark_in_transition(Some(orphaned.clone()));
                    let rejected: HashMap<PartitionId, Option<NodeId>> =
                        orphaned.iter().map(|p| (p, None)).collect();
                    self.slots.arm(orphaned.iter());
                    if let Err(e) = self
                        .slots
                        .wait_for_redistribution(
                            rejected,
                            &self.current_primary(),
                            self.config.redistribution_tick,
                            deadline,
                        )
                        .await
                    {
                        return Err(Self::attach_partial(e, parts));
                    }
                    status.orphaned_entries = None;
                    status.orphaned_partitions = None;
                    waited = true;
                    continue;
                }

                status.orphaned_entries = Some(
                    orphaned
                        .iter()
                        .filter_map(|p| remaining.get(&p).map(|v| (p, v.clone())))
                        .collect(),
                );
            }

            // build one request per owner from that owner's partitions
            let requests: Vec<(NodeId, Request)> = by_owner
                .iter()
                .map(|(owner, owned)| {
                    let entries: Vec<(Key, Value)> = owned
                        .iter()
                        .flat_map(|p| remaining.get(&p).into_iter().flatten().cloned())
                        .collect();
                    (
                        *owner,
                        Request {
                            cache_id: self.cache_id,
                            body: RequestBody::Entries { entries, ttl_ms },
                        },
                    )
                })
                .collect();
            let requests = self.order_self_last(requests);

            let outcome = match self.transport.poll_all(requests, deadline).await {
                Ok(outcome) => outcome,
                Err(e) => return Err(Self::attach_partial(e, parts)),
            };
            let responses = match outcome {
                PollOutcome::Complete(responses) => responses,
                PollOutcome::TimedOut(responses) => {
                    parts.extend(responses);
                    return Err(Error::Timeout {
                        partial: Some(PartialResult::Raw(parts)),
                    });
                }
            };

            // keep only entries of partitions that were rejected (or were
            // orphaned and never dispatched)
            let mut keep = PartitionSet::new(universe);
            if let Some(orphaned) = &status.orphaned_partitions {
                keep.union(orphaned);
            }
            for (node, response) in responses {
                if let Some(rejected) = response.rejected_partitions() {
                    keep.union(rejected);
                    self.slots.arm(rejected.iter());
                }
                parts.push((node, response));
            }
            remaining.retain(|partition, _| keep.contains(*partition));

            if !remaining.is_empty() {
                let repeat: usize = remaining.values().map(Vec::len).sum();
                self.report_repeat("entry request", repeat, total, Some(&keep));
                status.entries_by_partition = remaining.clone();
                waited = false;
            }
        }

        Ok(parts)
    }

    // ---- partition-set operations ---------------------------------------

    /// Wait on the partitions the previous attempt actually failed on:
    /// rejected ones hinted with the owner that held them, orphaned ones
    /// hinted with the current primary. Partitions with a live,
    /// unrejecting owner are left out of the wait entirely.
    async fn wait_partition_redistribution(
        &self,
        status: &mut PartialStatus,
        deadline: Deadline,
    ) -> Result<()> {
        let mut rejected: HashMap<PartitionId, Option<NodeId>> = HashMap::new();
        if let Some(parts) = &status.rejected_partitions {
            for (owner, owned) in &status.partitions_by_owner {
                if owned.intersects(parts) {
                    for partition in owned.iter() {
                        if parts.contains(partition) {
                            rejected.insert(partition, Some(*owner));
                        }
                    }
                }
            }
            for partition in parts.iter() {
                rejected.entry(partition).or_insert(None);
            }
        }
        if let Some(orphaned) = &status.orphaned_partitions {
            let snapshot = self.view.assignments();
            for partition in orphaned.iter() {
                rejected
                    .entry(partition)
                    .or_insert_with(|| snapshot.primary(partition));
            }
            // rejected partitions were armed when the response came back;
            // only orphans need arming here
            self.slots.arm(orphaned.iter());
        }

        status.mark_in_transition(PartitionSet::from_iter(
            self.view.partition_count(),
            rejected.keys().copied(),
        ));

        self.slots
            .wait_for_redistribution(
                rejected,
                &self.current_primary(),
                self.config.redistribution_tick,
                deadline,
            )
            .await?;

        status.rejected_partitions = None;
        status.orphaned_partitions = None;
        Ok(())
    }

    /// Split the remaining partitions by owner, waiting through
    /// redistribution until at least part of the set has a live owner.
    pub(crate) async fn ensure_partition_target(
        &self,
        partitions: &PartitionSet,
        mut status: Option<PartialStatus>,
        deadline: Deadline,
    ) -> Result<PartialStatus> {
        loop {
            let mut current = match status.take() {
                None => PartialStatus::default(),
                Some(mut s) => {
                    self.wait_partition_redistribution(&mut s, deadline).await?;
                    if !self.lifecycle.is_active() {
                        return Err(self.on_missing_storage());
                    }
                    s
                }
            };

            let snapshot = self.view.assignments();
            let (by_owner, orphaned) = split::split_partitions_by_owner(partitions, &snapshot);

            current.partitions_by_owner = by_owner;

            match orphaned {
                None => {
                    // common case
                    current.orphaned_partitions = None;
                    return Ok(current);
                }
                Some(orphaned) => {
                    current.orphaned_partitions = Some(orphaned);

                    if self.view.is_assignment_complete() {
                        if self.view.assignments().epoch() == snapshot.epoch() {
                            if !current.partitions_by_owner.is_empty() {
                                return Ok(current);
                            }
                        } else {
                            status = None;
                            continue;
                        }
                    }

                    if self.view.alive_owners().is_empty() {
                        return Err(self.on_missing_storage());
                    }
                }
            }

            status = Some(current);
        }
    }

    /// Dispatch a partitioned request to every owner of the partitions,
    /// retrying the portions that were rejected or orphaned until every
    /// partition has been processed or the deadline elapses.
    pub async fn send_partitioned_request(
        &self,
        op: PartialOp,
        partitions: PartitionSet,
        internal: bool,
        deadline: Deadline,
    ) -> Result<Vec<(NodeId, Response)>> {
        self.check_active()?;

        let mut parts: Vec<(NodeId, Response)> = Vec::new();
        if partitions.is_empty() {
            return Ok(parts);
        }

        let mut remaining = partitions;
        let mut status: Option<PartialStatus> = None;

        loop {
            let s = match self
                .ensure_partition_target(&remaining, status.take(), deadline)
                .await
            {
                Ok(s) => s,
                Err(e) => return Err(Self::attach_partial(e, parts)),
            };
            if s.is_target_missing() {
                return Ok(parts);
            }

            let requests: Vec<(NodeId, Request)> = s
                .partitions_by_owner
                .iter()
                .map(|(owner, owned)| {
                    (
                        *owner,
                        Request {
                            cache_id: self.cache_id,
                            body: RequestBody::Partial {
                                op: op.clone(),
                                partitions: owned.clone(),
                            },
                        },
                    )
                })
                .collect();
            let requests = self.order_self_last(requests);

            let outcome = match self.transport.poll_all(requests, deadline).await {
                Ok(outcome) => outcome,
                Err(e) => return Err(Self::attach_partial(e, parts)),
            };
            let responses = match outcome {
                PollOutcome::Complete(responses) => responses,
                PollOutcome::TimedOut(responses) => {
                    parts.extend(responses);
                    return Err(Error::Timeout {
                        partial: Some(PartialResult::Raw(parts)),
                    });
                }
            };

            // remove every processed partition; rejected and orphaned ones
            // stay for the next round
            let mut s = s;
            let mut rejected_now = PartitionSet::new(remaining.universe());
            for (node, response) in responses {
                if let Some(sent) = s.partitions_by_owner.get(&node) {
                    let mut processed = sent.clone();
                    if let Some(rejected) = response.rejected_partitions() {
                        processed.remove_all(rejected);
                        self.slots.arm(rejected.iter());
                        rejected_now.union(rejected);
                    }
                    remaining.remove_all(&processed);
                }
                parts.push((node, response));
            }

            if remaining.is_empty() {
                return Ok(parts);
            }

            s.rejected_partitions = if rejected_now.is_empty() {
                None
            } else {
                Some(rejected_now)
            };
            if !internal {
                self.report_repeat("partitioned request", 0, 0, Some(&remaining));
            }
            status = Some(s);
        }
    }

    fn report_repeat(
        &self,
        what: &str,
        items: usize,
        total: usize,
        partitions: Option<&PartitionSet>,
    ) {
        match partitions {
            Some(parts) => debug!(
                request = what,
                items, total, partitions = %parts, "repeating request due to redistribution"
            ),
            None => debug!(
                request = what,
                items, total, "repeating request due to redistribution"
            ),
        }
    }
}

impl std::fmt::Debug for Coordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Coordinator")
            .field("cache_id", &self.cache_id)
            .field("partition_count", &self.view.partition_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lifecycle_flags() {
        let life = Lifecycle::new();
        assert!(life.is_active());
        life.release();
        assert!(!life.is_active());
        assert!(life.is_running());

        let life = Lifecycle::new();
        life.stop();
        assert!(!life.is_active());
        assert!(!life.is_running());
    }

    #[test]
    fn test_attach_partial_only_on_bare_timeout() {
        let parts = vec![(1u64, Response::Key(KeyResponse::default()))];

        let e = Coordinator::attach_partial(Error::timeout(), parts.clone());
        assert!(matches!(
            e,
            Error::Timeout {
                partial: Some(PartialResult::Raw(_))
            }
        ));

        let e = Coordinator::attach_partial(Error::NoStorage, parts.clone());
        assert!(matches!(e, Error::NoStorage));

        let e = Coordinator::attach_partial(Error::timeout(), Vec::new());
        assert!(matches!(e, Error::Timeout { partial: None }));
    }
}


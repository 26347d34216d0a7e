//! Limited-query paging strategies.
//!
//! Two strategies serve page-limited queries. The sequential pager
//! delivers exact, ordered pages by visiting one owner at a time and
//! carrying a resumable cursor between calls. The distributed pager
//! trades exactness for parallelism: it over-asks every owner by a
//! margin, merges, and leaves the final sort and truncation to the
//! caller. A third primitive, [`PagedQueryEngine::key_set_page`], pulls
//! the keys of one owner's partitions per call and powers the lazy
//! key/entry iteration views.

use crate::coordinator::Coordinator;
use crate::error::{Error, Result};
use crate::merge;
use crate::message::{FilterSpec, LimitSpec, PartialOp, QueryItem, QueryResponse, Response};
use crate::partition::PartitionSet;
use crate::types::{Deadline, Key, NodeId};
use parking_lot::Mutex;
use rand::Rng;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::debug;

/// Resumable position of a sequential limited query.
///
/// Carried by the caller between page calls. As long as ownership stays
/// stable, successive pages reproduce one logical ordering with no
/// duplicates and no omissions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryCursor {
    /// Owners not yet exhausted, in visiting order. The owner currently
    /// being read sits at the head.
    pub remaining_members: Vec<NodeId>,
    /// Matches to skip on the head owner before the next page starts.
    pub skip_member: i64,
    /// Matches skipped across all owners, including `skip_member`.
    pub skip_global: i64,
}

/// A page-limited query request.
///
/// `ordered` selects the strategy: ordered queries must return exactly
/// page `page` in order and run sequentially; unordered ones run the
/// distributed overshoot strategy.
#[derive(Debug, Clone)]
pub struct LimitFilter {
    pub page_size: usize,
    pub page: usize,
    pub ordered: bool,
    /// Owners queried in parallel per distributed round; 0 until estimated.
    batch_size: usize,
    cursor_seed: u64,
    cookie: Option<QueryCursor>,
}

impl LimitFilter {
    pub fn new(page_size: usize, ordered: bool) -> Self {
        Self {
            page_size,
            page: 0,
            ordered,
            batch_size: 0,
            // randomized per filter so concurrent clients do not all hit
            // the same owner for page zero
            cursor_seed: rand::thread_rng().gen(),
            cookie: None,
        }
    }

    pub fn with_page(mut self, page: usize) -> Self {
        self.page = page;
        self
    }

    /// Advance to the next page, keeping the cursor.
    pub fn next_page(&mut self) {
        self.page += 1;
    }

    /// Position of the sequential scan; `None` after a page call means the
    /// scan has visited every owner.
    pub fn cursor(&self) -> Option<&QueryCursor> {
        self.cookie.as_ref()
    }
}

/// Scratch budget reserved around distributed batch estimation.
#[derive(Debug)]
pub struct ScratchPool {
    available: Mutex<u64>,
}

impl ScratchPool {
    pub fn new(capacity: u64) -> Self {
        Self {
            available: Mutex::new(capacity),
        }
    }

    /// Take the whole remaining budget; returns 0 when another query
    /// holds it.
    pub fn reserve(&self) -> u64 {
        std::mem::take(&mut *self.available.lock())
    }

    pub fn release(&self, amount: u64) {
        *self.available.lock() += amount;
    }
}

/// Paged query driver built on the coordinator's partitioned dispatch.
pub struct PagedQueryEngine {
    coordinator: Arc<Coordinator>,
    scratch: ScratchPool,
}

impl PagedQueryEngine {
    pub fn new(coordinator: Arc<Coordinator>) -> Self {
        let scratch = ScratchPool::new(coordinator.config().query_scratch_bytes);
        Self {
            coordinator,
            scratch,
        }
    }

    fn query_op(filter: &Option<FilterSpec>, limit: LimitSpec, entries: bool) -> PartialOp {
        if entries {
            PartialOp::QueryEntries {
                filter: filter.clone(),
                limit: Some(limit),
            }
        } else {
            PartialOp::QueryKeys {
                filter: filter.clone(),
                limit: Some(limit),
            }
        }
    }

    fn query_response(response: Response) -> Result<QueryResponse> {
        match response {
            Response::Query(q) => {
                if let Some(failure) = q.failure {
                    Err(Error::Remote(failure))
                } else {
                    Ok(q)
                }
            }
            other => Err(Error::Internal(format!(
                "unexpected response to query request: {other:?}"
            ))),
        }
    }

    /// Owners in a fixed order rotated by the filter's seed.
    fn shuffled_owners(&self, seed: u64) -> Vec<NodeId> {
        let mut members = self.coordinator.view().alive_owners();
        if !members.is_empty() {
            let offset = (seed % members.len() as u64) as usize;
            members.rotate_left(offset);
        }
        members
    }

    /// Exact sequential paging: visits owners one at a time (widening to a
    /// few in parallel when their average yield is small compared to the
    /// page), skipping `cursor` positions, and returns exactly the
    /// requested page while ownership holds still. A mid-page
    /// redistribution abandons determinism: the partial page is returned
    /// and the cursor resets.
    pub async fn limit_query_sequential(
        &self,
        filter_spec: &Option<FilterSpec>,
        filter: &mut LimitFilter,
        partitions: &mut PartitionSet,
        entries: bool,
        deadline: Deadline,
    ) -> Result<Vec<QueryItem>> {
        let page_size = filter.page_size;
        let page_skip = (page_size * filter.page) as i64;

        let (mut members, mut skip_member, mut skip_global) = match filter.cookie.take() {
            Some(c) => (c.remaining_members, c.skip_member, c.skip_global),
            None => (Vec::new(), -1, -1),
        };

        // total entries already consumed from owners before the current one
        let behind = skip_global - skip_member;
        let mut skip_actual = page_skip;
        let mut adjustment = 0i64;
        if skip_global == page_skip {
            // the cursor already points at the requested page
            adjustment = behind;
        } else if skip_global != -1 && page_skip - behind >= 0 {
            // a forward page, or a backward one still within the current
            // owner's range
            skip_member += page_skip - skip_global;
            skip_global = page_skip;
            adjustment = behind;
        } else {
            // fresh scan (or a backward page outside the range)
            members = self.shuffled_owners(filter.cursor_seed);
            skip_member = page_skip;
            skip_global = page_skip;
        }

        let mut result: Vec<QueryItem> = Vec::new();
        let mut part_size = page_size;
        let mut estimate_avail = 0i64;
        let mut samples = 0u32;

        while !members.is_empty() {
            // degree of parallelism from the running average of per-owner
            // availability; stay sequential while skipping or while one
            // owner can fill the page alone
            let mut parallelism = 1usize;
            if estimate_avail > 0 && (estimate_avail as usize) < part_size && skip_member == 0 {
                parallelism = part_size / estimate_avail as usize + 1;
            }

            let query_members: Vec<NodeId> = members
                .iter()
                .take(parallelism.min(members.len()))
                .copied()
                .collect();

            let snapshot = self.coordinator.view().assignments();
            let mut part_member = PartitionSet::new(snapshot.partition_count());
            for member in &query_members {
                part_member.union(&snapshot.partitions_of(*member));
            }
            part_member.retain(partitions);

            if part_member.is_empty() {
                members.drain(..query_members.len());
                continue;
            }

            let limit = LimitSpec {
                size: part_size as u32,
                skip: skip_member.max(0) as u32,
            };
            let op = Self::query_op(filter_spec, limit, entries);
            let responses = self
                .coordinator
                .send_partitioned_request(op, part_member, true, deadline)
                .await?;

            let mut part_actual = 0i64;
            let mut part_avail = 0i64;
            let mut merged_parts: Vec<(NodeId, Response)> = Vec::new();
            let mut redistributed = responses.len() != query_members.len();

            for (node, response) in responses {
                let q = Self::query_response(response)?;
                if !query_members.contains(&node) {
                    redistributed = true;
                }
                members.retain(|m| *m != node);

                let member_avail = q.available as i64;
                let member_actual = q.items.len() as i64;
                part_avail += member_avail;
                part_actual += member_actual;
                merged_parts.push((node, Response::Query(q)));

                if part_actual >= part_size as i64 {
                    // page filled; the head owner resumes the next page
                    members.insert(0, node);
                    skip_member += member_actual - (part_actual - part_size as i64);
                    break;
                }

                samples += 1;
                let ratio = 1.0 / f64::from(samples);
                estimate_avail = (member_avail as f64 * ratio
                    + estimate_avail as f64 * (1.0 - ratio))
                    .round() as i64;
            }

            if part_actual > 0 {
                let page_part = merge::merge_query_responses(&merged_parts, 0, part_size)?;
                let merged = page_part.len() as i64;
                result.extend(page_part);
                skip_global += merged;

                if redistributed {
                    // data moved mid-page; no deterministic continuation
                    // exists, return what merged and reset the scan
                    debug!(page = filter.page, "redistribution during sequential page, resetting cursor");
                    members.clear();
                    break;
                }

                if part_actual < part_size as i64 {
                    part_size -= merged as usize;
                    skip_actual = 0;
                    skip_member = 0;
                } else {
                    break;
                }
            } else {
                // nothing but skipped entries on these owners
                skip_actual -= adjustment + part_avail;
                skip_member = skip_actual;
                adjustment = 0;
            }
        }

        filter.cookie = if members.is_empty() {
            None
        } else {
            Some(QueryCursor {
                remaining_members: members,
                skip_member,
                skip_global,
            })
        };
        Ok(result)
    }

    /// Partitions owned by the first `count` owners of the split.
    fn first_batch_partitions(
        by_owner: &HashMap<NodeId, PartitionSet>,
        count: usize,
        universe: u32,
    ) -> PartitionSet {
        let mut parts = PartitionSet::new(universe);
        for owned in by_owner.values().take(count.max(1)) {
            parts.union(owned);
        }
        parts
    }

    /// Estimate how many owners to query per round from the size of one
    /// observed page against the reserved scratch budget.
    fn estimate_batch_size(&self, response: &QueryResponse, filter: &mut LimitFilter, scratch: u64) {
        let page_bytes = response.payload_bytes;
        let members = self.coordinator.view().alive_owners().len() as u64;

        filter.batch_size = if page_bytes == 0 {
            1
        } else {
            members.min(((scratch + page_bytes) / page_bytes).max(1)) as usize
        };
    }

    /// Best-effort parallel paging: over-asks every owner in the batch by
    /// a configured margin over the ideal even split, re-asks
    /// under-delivering owners with the full page size, and returns the
    /// merged overshoot for the caller to sort and truncate. The queried
    /// partitions are removed from `partitions`.
    pub async fn limit_query_distributed(
        &self,
        filter_spec: &Option<FilterSpec>,
        filter: &mut LimitFilter,
        partitions: &mut PartitionSet,
        entries: bool,
        deadline: Deadline,
    ) -> Result<Vec<QueryItem>> {
        let page_size = filter.page_size;
        let snapshot = self.coordinator.view().assignments();
        let (by_owner, _) = crate::split::split_partitions_by_owner(partitions, &snapshot);
        if by_owner.is_empty() {
            return Ok(Vec::new());
        }

        let batch = filter.batch_size;
        let mut parts =
            Self::first_batch_partitions(&by_owner, batch.max(1), snapshot.partition_count());
        let parts_query = parts.clone();

        // assume near-even distribution and over-ask each owner by the
        // configured margin over the ideal split
        let overshoot = self.coordinator.config().query_overshoot_percent as usize;
        let owners = by_owner.len();
        let per_owner = (page_size.div_ceil(owners) * (100 + overshoot) / 100).max(1);
        let limit = LimitSpec {
            size: per_owner as u32,
            skip: 0,
        };

        let mut responses = self
            .coordinator
            .send_partitioned_request(Self::query_op(filter_spec, limit, entries), parts.clone(), true, deadline)
            .await?;

        let mut actual = 0u64;
        let mut avail = 0u64;
        for (_, response) in &responses {
            if let Response::Query(q) = response {
                if let Some(failure) = &q.failure {
                    return Err(Error::Remote(failure.clone()));
                }
                actual += q.items.len() as u64;
                avail += q.available;
            }
        }

        if (actual as usize) < page_size && avail > actual {
            // the split was uneven; re-ask the owners that still hold more,
            // playing it safe with the full page size
            for (node, response) in &responses {
                if let Response::Query(q) = response {
                    if q.items.len() as u64 == q.available {
                        parts.remove_all(&snapshot.partitions_of(*node));
                    }
                }
            }

            if !parts.is_empty() {
                let limit = LimitSpec {
                    size: page_size as u32,
                    skip: 0,
                };
                let more = self
                    .coordinator
                    .send_partitioned_request(
                        Self::query_op(filter_spec, limit, entries),
                        parts,
                        true,
                        deadline,
                    )
                    .await?;
                responses.extend(more);
            }
        }

        partitions.remove_all(&parts_query);

        if !partitions.is_empty() && batch == 0 {
            let scratch = self.scratch.reserve();
            if let Some((_, Response::Query(first))) = responses.first() {
                self.estimate_batch_size(first, filter, scratch);
            }
            self.scratch.release(scratch);
        }

        // the re-issue asks for the full page from the start, so an owner's
        // first-round items come back again; merge as a set keyed by item key
        let merged = merge::merge_query_responses(&responses, 0, 0)?;
        let mut seen: HashSet<Key> = HashSet::with_capacity(merged.len());
        Ok(merged
            .into_iter()
            .filter(|item| seen.insert(item.key().clone()))
            .collect())
    }

    /// Fetch the keys of one owner's share of `partitions`, removing the
    /// served partitions from the set. Prefers the local owner, otherwise
    /// picks a random one so concurrent iterators fan out.
    pub async fn key_set_page(
        &self,
        partitions: &mut PartitionSet,
        deadline: Deadline,
    ) -> Result<Vec<Key>> {
        self.coordinator.check_active()?;
        if partitions.is_empty() {
            return Ok(Vec::new());
        }

        let status = self
            .coordinator
            .ensure_partition_target(partitions, None, deadline)
            .await?;
        if status.is_target_missing() {
            partitions.clear();
            return Ok(Vec::new());
        }

        let local = self.coordinator.transport().local_node();
        let (member, owned) = match status.partitions_by_owner.get_key_value(&local) {
            Some((member, owned)) => (*member, owned.clone()),
            None => {
                let owners: Vec<&NodeId> = status.partitions_by_owner.keys().collect();
                let pick = *owners[rand::thread_rng().gen_range(0..owners.len())];
                (pick, status.partitions_by_owner[&pick].clone())
            }
        };

        let request = self
            .coordinator
            .partial_request(PartialOp::KeyIterator, owned.clone());
        let response = self
            .coordinator
            .transport()
            .poll(member, request, deadline)
            .await?;
        let q = Self::query_response(response)?;

        let mut served = owned;
        if let Some(rejected) = &q.rejected_partitions {
            served.remove_all(rejected);
        }
        partitions.remove_all(&served);

        Ok(q.items.into_iter().map(|item| item.key().clone()).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cursor_lifecycle() {
        let mut filter = LimitFilter::new(10, true);
        assert!(filter.cursor().is_none());

        filter.cookie = Some(QueryCursor {
            remaining_members: vec![3, 1],
            skip_member: 4,
            skip_global: 24,
        });
        filter.next_page();
        assert_eq!(filter.page, 1);
        assert_eq!(filter.cursor().map(|c| c.skip_global), Some(24));

        filter.cookie = None;
        assert!(filter.cursor().is_none());
    }

    #[test]
    fn test_scratch_pool_reserve_release() {
        let pool = ScratchPool::new(1024);
        let held = pool.reserve();
        assert_eq!(held, 1024);
        assert_eq!(pool.reserve(), 0);
        pool.release(held);
        assert_eq!(pool.reserve(), 1024);
    }

    #[tokio::test]
    async fn test_distributed_reissue_returns_distinct_items() {
        use crate::config::GridConfig;
        use crate::coordinator::Lifecycle;
        use crate::testing::MockCluster;
        use crate::types::Deadline;
        use bytes::Bytes;

        let cluster = MockCluster::new(16, &[1, 2]);

        // every key on one owner, so the batched even split under-delivers
        // and the full-page re-issue goes back to that owner
        let mut seeded: HashSet<Key> = HashSet::new();
        let mut i = 0;
        while seeded.len() < 20 {
            let k = Key::from(format!("skew-{i}"));
            if cluster.owner_of(&k) == Some(2) {
                cluster.seed([(k.clone(), Bytes::from_static(b"v"))]);
                seeded.insert(k);
            }
            i += 1;
        }

        let coordinator = Arc::new(Coordinator::new(
            1,
            GridConfig::new(16),
            cluster.directory.clone(),
            cluster.transport.clone(),
            cluster.slots.clone(),
            Arc::new(Lifecycle::new()),
        ));
        let engine = PagedQueryEngine::new(coordinator);

        let mut filter = LimitFilter::new(10, false);
        filter.batch_size = 2;
        let mut partitions = PartitionSet::full(16);

        let items = engine
            .limit_query_distributed(&None, &mut filter, &mut partitions, false, Deadline::Never)
            .await
            .unwrap();

        let unique: HashSet<Key> = items.iter().map(|i| i.key().clone()).collect();
        assert_eq!(items.len(), unique.len());
        assert!(items.len() >= 10);
        assert!(unique.is_subset(&seeded));
        assert!(partitions.is_empty());
    }

    #[test]
    fn test_first_batch_partitions() {
        let mut by_owner = HashMap::new();
        by_owner.insert(1u64, PartitionSet::from_iter(8, [0, 1]));
        by_owner.insert(2u64, PartitionSet::from_iter(8, [2, 3]));

        let one = PagedQueryEngine::first_batch_partitions(&by_owner, 1, 8);
        assert_eq!(one.len(), 2);

        let all = PagedQueryEngine::first_batch_partitions(&by_owner, 2, 8);
        assert_eq!(all.len(), 4);
    }
}

//! The public cache facade.
//!
//! `GridCache` exposes map-style operations over the partitioned store
//! and owns the per-reference collaborators: the request coordinator,
//! the paged query engine, and the listener registry. Keys and values
//! are opaque byte blobs; interpretation belongs to the caller and to
//! the storage side of the wire.

use crate::config::GridConfig;
use crate::contention::ContentionSlots;
use crate::coordinator::{Coordinator, Lifecycle, ReadLocator};
use crate::error::Result;
use crate::listener::{ListenerRegistry, MapListener};
use crate::merge::{self, ResponseShape};
use crate::message::{AgentSpec, FilterSpec, KeyOp, KeySetOp, PartialOp, QueryItem, Scalar};
use crate::ownership::OwnershipView;
use crate::paging::{LimitFilter, PagedQueryEngine};
use crate::partition::PartitionSet;
use crate::transport::Transport;
use crate::types::{CacheId, Deadline, Key, Value};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

/// A client-side reference to one logical partitioned cache.
pub struct GridCache {
    name: String,
    coordinator: Arc<Coordinator>,
    engine: PagedQueryEngine,
    listeners: Arc<ListenerRegistry>,
}

impl GridCache {
    pub fn new(
        name: impl Into<String>,
        cache_id: CacheId,
        config: GridConfig,
        view: Arc<dyn OwnershipView>,
        transport: Arc<dyn Transport>,
        slots: Arc<ContentionSlots>,
    ) -> Self {
        Self::with_read_locator(name, cache_id, config, view, transport, slots, None)
    }

    /// Like [`GridCache::new`], with an optional chooser that routes reads
    /// for a partition to a member other than the primary.
    pub fn with_read_locator(
        name: impl Into<String>,
        cache_id: CacheId,
        config: GridConfig,
        view: Arc<dyn OwnershipView>,
        transport: Arc<dyn Transport>,
        slots: Arc<ContentionSlots>,
        read_locator: Option<ReadLocator>,
    ) -> Self {
        let lifecycle = Arc::new(Lifecycle::new());
        let mut coordinator = Coordinator::new(cache_id, config, view, transport, slots, lifecycle);
        coordinator.set_read_locator(read_locator);
        let coordinator = Arc::new(coordinator);
        Self {
            name: name.into(),
            engine: PagedQueryEngine::new(coordinator.clone()),
            coordinator,
            listeners: Arc::new(ListenerRegistry::new()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn listeners(&self) -> &Arc<ListenerRegistry> {
        &self.listeners
    }

    pub fn is_active(&self) -> bool {
        self.coordinator.lifecycle().is_active()
    }

    /// Drop this reference; subsequent operations fail with
    /// [`Error::CacheDestroyed`].
    pub fn release(&self) {
        debug!(cache = %self.name, "releasing cache reference");
        self.coordinator.lifecycle().release();
    }

    /// Destroy the cache cluster-wide: clear the contents, then drop the
    /// reference.
    pub async fn destroy(&self) -> Result<()> {
        debug!(cache = %self.name, "destroying cache");
        let result = self.clear().await;
        self.coordinator.lifecycle().release();
        result
    }

    fn deadline(&self) -> Deadline {
        self.coordinator.deadline()
    }

    fn all_partitions(&self) -> PartitionSet {
        PartitionSet::full(self.coordinator.view().partition_count())
    }

    // ---- single-key operations ------------------------------------------

    pub async fn get(&self, key: Key) -> Result<Option<Value>> {
        let r = self
            .coordinator
            .send_key_request(KeyOp::Get, key, true, self.deadline())
            .await?;
        Ok(r.value)
    }

    /// Insert or replace; returns the previous value.
    pub async fn put(&self, key: Key, value: Value) -> Result<Option<Value>> {
        self.put_internal(key, value, None).await
    }

    /// Insert or replace with a time-to-live; returns the previous value.
    pub async fn put_with_ttl(&self, key: Key, value: Value, ttl_ms: u64) -> Result<Option<Value>> {
        self.put_internal(key, value, Some(ttl_ms)).await
    }

    async fn put_internal(
        &self,
        key: Key,
        value: Value,
        ttl_ms: Option<u64>,
    ) -> Result<Option<Value>> {
        let op = KeyOp::Put {
            value,
            ttl_ms,
            return_old: true,
        };
        let r = self
            .coordinator
            .send_key_request(op, key, false, self.deadline())
            .await?;
        Ok(r.value)
    }

    /// Remove; returns the removed value.
    pub async fn remove(&self, key: Key) -> Result<Option<Value>> {
        let r = self
            .coordinator
            .send_key_request(KeyOp::Remove { return_old: true }, key, false, self.deadline())
            .await?;
        Ok(r.value)
    }

    pub async fn contains_key(&self, key: Key) -> Result<bool> {
        let r = self
            .coordinator
            .send_key_request(KeyOp::ContainsKey, key, true, self.deadline())
            .await?;
        Ok(r.flag.unwrap_or(false))
    }

    /// Run an agent against one entry at its owner; returns the agent's
    /// result blob.
    pub async fn invoke(&self, key: Key, agent: AgentSpec) -> Result<Option<Value>> {
        let r = self
            .coordinator
            .send_key_request(KeyOp::Invoke { agent }, key, false, self.deadline())
            .await?;
        Ok(r.value)
    }

    /// Acquire a lease on a key. `wait_millis`: 0 returns immediately,
    /// -1 keeps trying until the deadline. An unlock is issued
    /// best-effort when the outcome of the request is unknown.
    pub async fn lock(&self, key: Key, wait_millis: i64) -> Result<bool> {
        let op = KeyOp::Lock {
            holder: self.coordinator.transport().local_node(),
            lease_millis: self.coordinator.config().lease_millis,
            wait_millis,
        };
        let r = self
            .coordinator
            .send_key_request(op, key, false, self.deadline())
            .await?;
        Ok(r.flag.unwrap_or(false))
    }

    pub async fn unlock(&self, key: Key) -> Result<bool> {
        let op = KeyOp::Unlock {
            holder: self.coordinator.transport().local_node(),
        };
        let r = self
            .coordinator
            .send_key_request(op, key, false, self.deadline())
            .await?;
        Ok(r.flag.unwrap_or(false))
    }

    // ---- key-set operations ---------------------------------------------

    /// Fetch the present entries for a set of keys. Absent keys are
    /// simply omitted from the result.
    pub async fn get_all(&self, keys: Vec<Key>) -> Result<HashMap<Key, Value>> {
        if keys.is_empty() {
            return Ok(HashMap::new());
        }
        let parts = self
            .coordinator
            .send_keyset_request(KeySetOp::GetAll, keys, self.deadline())
            .await
            .map_err(|e| merge::remerge_timeout(e, ResponseShape::Map))?;
        merge::merge_map_responses(&parts)
    }

    /// Insert or replace a batch of entries.
    pub async fn put_all(&self, entries: Vec<(Key, Value)>) -> Result<()> {
        self.put_all_with_ttl(entries, None).await
    }

    pub async fn put_all_with_ttl(
        &self,
        entries: Vec<(Key, Value)>,
        ttl_ms: Option<u64>,
    ) -> Result<()> {
        if entries.is_empty() {
            return Ok(());
        }
        let parts = self
            .coordinator
            .send_entry_request(entries, ttl_ms, self.deadline())
            .await
            .map_err(|e| merge::remerge_timeout(e, ResponseShape::Void))?;
        merge::merge_map_responses(&parts)?;
        Ok(())
    }

    pub async fn remove_all(&self, keys: Vec<Key>) -> Result<()> {
        if keys.is_empty() {
            return Ok(());
        }
        let parts = self
            .coordinator
            .send_keyset_request(KeySetOp::RemoveAll, keys, self.deadline())
            .await
            .map_err(|e| merge::remerge_timeout(e, ResponseShape::Void))?;
        merge::merge_scalar_responses(&parts)?;
        Ok(())
    }

    pub async fn contains_all(&self, keys: Vec<Key>) -> Result<bool> {
        if keys.is_empty() {
            return Ok(true);
        }
        let parts = self
            .coordinator
            .send_keyset_request(KeySetOp::ContainsAll, keys, self.deadline())
            .await
            .map_err(|e| merge::remerge_timeout(e, ResponseShape::Void))?;
        let scalars = merge::merge_scalar_responses(&parts)?;
        Ok(scalars.iter().all(|s| matches!(s, Scalar::Flag(true))))
    }

    /// Run an agent against each of the keys; returns per-key results.
    pub async fn invoke_all_keys(
        &self,
        keys: Vec<Key>,
        agent: AgentSpec,
    ) -> Result<HashMap<Key, Value>> {
        if keys.is_empty() {
            return Ok(HashMap::new());
        }
        let op = KeySetOp::InvokeAll { agent };
        let parts = self
            .coordinator
            .send_keyset_request(op, keys, self.deadline())
            .await
            .map_err(|e| merge::remerge_timeout(e, ResponseShape::Map))?;
        merge::merge_map_responses(&parts)
    }

    /// Aggregate over a set of keys; returns the per-owner partial blobs
    /// for the caller's aggregator to combine.
    pub async fn aggregate_keys(&self, keys: Vec<Key>, agent: AgentSpec) -> Result<Vec<Value>> {
        if keys.is_empty() {
            return Ok(Vec::new());
        }
        let op = KeySetOp::AggregateKeys { agent };
        let parts = self
            .coordinator
            .send_keyset_request(op, keys, self.deadline())
            .await
            .map_err(|e| merge::remerge_timeout(e, ResponseShape::Scalars))?;
        Ok(scalar_blobs(merge::merge_scalar_responses(&parts)?))
    }

    // ---- filter and partition-set operations ----------------------------

    /// Run an agent against every entry matching a filter.
    pub async fn invoke_all_filter(
        &self,
        filter: Option<FilterSpec>,
        agent: AgentSpec,
    ) -> Result<HashMap<Key, Value>> {
        let op = PartialOp::InvokeFilter { filter, agent };
        let parts = self
            .coordinator
            .send_partitioned_request(op, self.all_partitions(), false, self.deadline())
            .await
            .map_err(|e| merge::remerge_timeout(e, ResponseShape::Map))?;
        merge::merge_map_responses(&parts)
    }

    /// Aggregate over every entry matching a filter; returns the
    /// per-owner partial blobs.
    pub async fn aggregate_filter(
        &self,
        filter: Option<FilterSpec>,
        agent: AgentSpec,
    ) -> Result<Vec<Value>> {
        let op = PartialOp::AggregateFilter { filter, agent };
        let parts = self
            .coordinator
            .send_partitioned_request(op, self.all_partitions(), false, self.deadline())
            .await
            .map_err(|e| merge::remerge_timeout(e, ResponseShape::Scalars))?;
        Ok(scalar_blobs(merge::merge_scalar_responses(&parts)?))
    }

    /// Keys matching a filter. With a limit, the page routed through the
    /// strategy the filter's ordering demands.
    pub async fn query_keys(
        &self,
        filter: Option<FilterSpec>,
        limit: Option<&mut LimitFilter>,
    ) -> Result<Vec<Key>> {
        let items = self.query(filter, limit, false).await?;
        Ok(items.into_iter().map(|i| i.key().clone()).collect())
    }

    /// Entries matching a filter, optionally limited.
    pub async fn query_entries(
        &self,
        filter: Option<FilterSpec>,
        limit: Option<&mut LimitFilter>,
    ) -> Result<Vec<(Key, Value)>> {
        let items = self.query(filter, limit, true).await?;
        Ok(items
            .into_iter()
            .filter_map(|i| match i {
                QueryItem::Entry(k, v) => Some((k, v)),
                QueryItem::Key(_) => None,
            })
            .collect())
    }

    async fn query(
        &self,
        filter: Option<FilterSpec>,
        limit: Option<&mut LimitFilter>,
        entries: bool,
    ) -> Result<Vec<QueryItem>> {
        let mut partitions = self.all_partitions();
        let deadline = self.deadline();

        match limit {
            Some(limit) if limit.ordered => {
                self.engine
                    .limit_query_sequential(&filter, limit, &mut partitions, entries, deadline)
                    .await
                    .map_err(|e| merge::remerge_timeout(e, ResponseShape::Void))
            }
            Some(limit) => {
                // each round covers one batch of owners; keep going until
                // every partition has been asked
                let mut items = Vec::new();
                while !partitions.is_empty() {
                    let before = partitions.len();
                    let round = self
                        .engine
                        .limit_query_distributed(&filter, limit, &mut partitions, entries, deadline)
                        .await
                        .map_err(|e| merge::remerge_timeout(e, ResponseShape::Void))?;
                    items.extend(round);
                    if partitions.len() == before {
                        // every remaining partition is orphaned
                        break;
                    }
                }
                Ok(items)
            }
            None => {
                let op = if entries {
                    PartialOp::QueryEntries {
                        filter,
                        limit: None,
                    }
                } else {
                    PartialOp::QueryKeys {
                        filter,
                        limit: None,
                    }
                };
                let parts = self
                    .coordinator
                    .send_partitioned_request(op, partitions, false, deadline)
                    .await
                    .map_err(|e| merge::remerge_timeout(e, ResponseShape::Items))?;
                merge::merge_query_responses(&parts, 0, 0)
            }
        }
    }

    /// Total number of entries across all partitions.
    pub async fn size(&self) -> Result<u64> {
        let parts = self
            .coordinator
            .send_partitioned_request(PartialOp::Size, self.all_partitions(), false, self.deadline())
            .await
            .map_err(|e| merge::remerge_timeout(e, ResponseShape::Scalars))?;
        let scalars = merge::merge_scalar_responses(&parts)?;
        Ok(scalars
            .iter()
            .map(|s| match s {
                Scalar::Count(n) => *n,
                _ => 0,
            })
            .sum())
    }

    pub async fn is_empty(&self) -> Result<bool> {
        Ok(self.size().await? == 0)
    }

    pub async fn contains_value(&self, value: Value) -> Result<bool> {
        let op = PartialOp::ContainsValue { value };
        let parts = self
            .coordinator
            .send_partitioned_request(op, self.all_partitions(), false, self.deadline())
            .await
            .map_err(|e| merge::remerge_timeout(e, ResponseShape::Void))?;
        let scalars = merge::merge_scalar_responses(&parts)?;
        Ok(scalars.iter().any(|s| matches!(s, Scalar::Flag(true))))
    }

    /// Remove every entry, firing listeners at the owners.
    pub async fn clear(&self) -> Result<()> {
        self.partitioned_void(PartialOp::Clear).await
    }

    /// Remove every entry without firing listeners; cheaper than `clear`.
    pub async fn truncate(&self) -> Result<()> {
        self.partitioned_void(PartialOp::Truncate).await
    }

    async fn partitioned_void(&self, op: PartialOp) -> Result<()> {
        let parts = self
            .coordinator
            .send_partitioned_request(op, self.all_partitions(), false, self.deadline())
            .await
            .map_err(|e| merge::remerge_timeout(e, ResponseShape::Void))?;
        merge::merge_scalar_responses(&parts)?;
        Ok(())
    }

    // ---- listeners ------------------------------------------------------

    /// Register a listener for changes to one key.
    pub async fn add_key_listener(
        &self,
        key: Key,
        listener: Arc<dyn MapListener>,
        lite: bool,
    ) -> Result<()> {
        let op = KeySetOp::AddListener {
            filter_id: None,
            lite,
        };
        self.listeners.add_key_listener(key.clone(), listener);
        let sent = self
            .coordinator
            .send_keyset_request(op, vec![key.clone()], self.deadline())
            .await;
        if let Err(e) = sent {
            self.listeners.remove_key_listeners(&key);
            return Err(e);
        }
        Ok(())
    }

    /// Deregister the listeners for one key. The remote removal is
    /// posted, not awaited.
    pub fn remove_key_listener(&self, key: Key) {
        if self.listeners.remove_key_listeners(&key) {
            self.coordinator
                .post_keyset_request(KeySetOp::RemoveListener { filter_id: None }, vec![key]);
        }
    }

    /// Register a listener for changes matching a filter; returns the
    /// filter id used for deregistration.
    pub async fn add_filter_listener(
        &self,
        filter: Option<FilterSpec>,
        listener: Arc<dyn MapListener>,
        lite: bool,
    ) -> Result<u64> {
        let filter_id = self.listeners.register_filter(filter.clone());
        self.listeners.add_filter_listener(filter_id, listener);

        let op = PartialOp::AddFilterListener {
            filter_id,
            filter,
            lite,
        };
        let sent = self
            .coordinator
            .send_partitioned_request(op, self.all_partitions(), false, self.deadline())
            .await;
        if let Err(e) = sent {
            self.listeners.remove_filter_listeners(filter_id);
            return Err(e);
        }
        Ok(filter_id)
    }

    pub async fn remove_filter_listener(&self, filter_id: u64) -> Result<()> {
        if !self.listeners.remove_filter_listeners(filter_id) {
            return Ok(());
        }
        let op = PartialOp::RemoveFilterListener { filter_id };
        self.coordinator
            .send_partitioned_request(op, self.all_partitions(), false, self.deadline())
            .await?;
        Ok(())
    }

    // ---- lazy iteration views -------------------------------------------

    /// Lazy key pager over the whole cache, one owner's share per page.
    pub fn keys(&self) -> KeyPager<'_> {
        KeyPager {
            cache: self,
            remaining: self.all_partitions(),
        }
    }

    /// Lazy entry pager; each key page is resolved to values with a
    /// follow-up batched get.
    pub fn entries(&self) -> EntryPager<'_> {
        EntryPager {
            keys: self.keys(),
        }
    }

    /// Lazy value pager.
    pub fn values(&self) -> EntryPager<'_> {
        self.entries()
    }

    pub(crate) fn coordinator(&self) -> &Arc<Coordinator> {
        &self.coordinator
    }
}

impl std::fmt::Debug for GridCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GridCache")
            .field("name", &self.name)
            .field("active", &self.is_active())
            .finish()
    }
}

fn scalar_blobs(scalars: Vec<Scalar>) -> Vec<Value> {
    scalars
        .into_iter()
        .filter_map(|s| match s {
            Scalar::Blob(v) => Some(v),
            _ => None,
        })
        .collect()
}

/// Pages keys one owner at a time; `next_page` returns `None` once every
/// partition has been served.
pub struct KeyPager<'a> {
    cache: &'a GridCache,
    remaining: PartitionSet,
}

impl KeyPager<'_> {
    pub async fn next_page(&mut self) -> Result<Option<Vec<Key>>> {
        if self.remaining.is_empty() {
            return Ok(None);
        }
        let keys = self
            .cache
            .engine
            .key_set_page(&mut self.remaining, self.cache.deadline())
            .await?;
        Ok(Some(keys))
    }
}

/// Pages entries by resolving each key page with a batched get.
pub struct EntryPager<'a> {
    keys: KeyPager<'a>,
}

impl EntryPager<'_> {
    pub async fn next_page(&mut self) -> Result<Option<Vec<(Key, Value)>>> {
        loop {
            let Some(keys) = self.keys.next_page().await? else {
                return Ok(None);
            };
            if keys.is_empty() {
                continue;
            }
            let mut map = self.keys.cache.get_all(keys.clone()).await?;
            let entries: Vec<(Key, Value)> = keys
                .into_iter()
                .filter_map(|k| map.remove(&k).map(|v| (k, v)))
                .collect();
            return Ok(Some(entries));
        }
    }
}

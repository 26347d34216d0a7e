//! In-memory cluster harness.
//!
//! `MockCluster` wires an `OwnershipDirectory` to a `MockTransport` whose
//! per-node stores behave like partition owners: a request for a
//! partition the node does not currently own comes back rejected, and
//! scripted rejections and poll failures simulate redistribution and
//! member loss.

use crate::cache::GridCache;
use crate::config::GridConfig;
use crate::contention::ContentionSlots;
use crate::error::{Error, Result};
use crate::message::{
    KeyOp, KeyResponse, KeySetOp, MapResponse, PartialOp, QueryItem, QueryResponse, Request,
    RequestBody, Response, Scalar, ScalarResponse,
};
use crate::ownership::{OwnershipDirectory, OwnershipView};
use crate::partition::PartitionSet;
use crate::transport::{PollOutcome, Transport};
use crate::types::{Deadline, Key, NodeId, PartitionId, Value};
use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;

/// Byte-store transport that serves requests from per-node maps.
pub struct MockTransport {
    local: NodeId,
    directory: Arc<OwnershipDirectory>,
    stores: DashMap<NodeId, DashMap<Key, Value>>,
    locks: DashMap<Key, NodeId>,
    reject_once: Mutex<HashMap<NodeId, PartitionSet>>,
    reject_always: Mutex<HashMap<NodeId, PartitionSet>>,
    fail_polls: Mutex<HashMap<NodeId, u32>>,
    poll_log: Mutex<Vec<(NodeId, Request)>>,
    posted: Mutex<Vec<(NodeId, Request)>>,
}

impl MockTransport {
    pub fn new(local: NodeId, directory: Arc<OwnershipDirectory>, nodes: &[NodeId]) -> Self {
        let stores = DashMap::new();
        for node in nodes {
            stores.insert(*node, DashMap::new());
        }
        Self {
            local,
            directory,
            stores,
            locks: DashMap::new(),
            reject_once: Mutex::new(HashMap::new()),
            reject_always: Mutex::new(HashMap::new()),
            fail_polls: Mutex::new(HashMap::new()),
            poll_log: Mutex::new(Vec::new()),
            posted: Mutex::new(Vec::new()),
        }
    }

    /// Make the node reject the given partitions on its next request that
    /// touches them.
    pub fn reject_once(&self, node: NodeId, partitions: PartitionSet) {
        let mut reject = self.reject_once.lock();
        match reject.get_mut(&node) {
            Some(existing) => existing.union(&partitions),
            None => {
                reject.insert(node, partitions);
            }
        }
    }

    /// Make the node reject the given partitions on every request until
    /// they move away from it.
    pub fn reject_always(&self, node: NodeId, partitions: PartitionSet) {
        self.reject_always.lock().insert(node, partitions);
    }

    /// Make the next `count` polls to the node fail as interrupted.
    pub fn fail_polls(&self, node: NodeId, count: u32) {
        self.fail_polls.lock().insert(node, count);
    }

    /// Nodes polled so far, in order.
    pub fn polled_nodes(&self) -> Vec<NodeId> {
        self.poll_log.lock().iter().map(|(n, _)| *n).collect()
    }

    pub fn polled_requests(&self) -> Vec<(NodeId, Request)> {
        self.poll_log.lock().clone()
    }

    pub fn posted_requests(&self) -> Vec<(NodeId, Request)> {
        self.posted.lock().clone()
    }

    pub fn store_len(&self, node: NodeId) -> usize {
        self.stores.get(&node).map(|s| s.len()).unwrap_or(0)
    }

    pub fn store_get(&self, node: NodeId, key: &Key) -> Option<Value> {
        self.stores.get(&node)?.get(key).map(|v| v.clone())
    }

    pub fn store_insert(&self, node: NodeId, key: Key, value: Value) {
        if let Some(store) = self.stores.get(&node) {
            store.insert(key, value);
        }
    }

    pub fn lock_holder(&self, key: &Key) -> Option<NodeId> {
        self.locks.get(key).map(|h| *h)
    }

    fn partition_of(&self, key: &Key) -> PartitionId {
        self.directory.partition_of(key)
    }

    /// Partitions of `touched` the node must reject: anything scripted
    /// plus anything it does not currently own.
    fn rejected_for(&self, node: NodeId, touched: &PartitionSet) -> PartitionSet {
        let mut rejected = PartitionSet::new(touched.universe());

        let mut scripted = self.reject_once.lock();
        if let Some(parts) = scripted.get_mut(&node) {
            for p in touched.iter() {
                if parts.contains(p) {
                    rejected.insert(p);
                    parts.remove(p);
                }
            }
        }

        if let Some(parts) = self.reject_always.lock().get(&node) {
            for p in touched.iter() {
                if parts.contains(p) {
                    rejected.insert(p);
                }
            }
        }

        let snapshot = self.directory.assignments();
        for p in touched.iter() {
            if snapshot.primary(p) != Some(node) {
                rejected.insert(p);
            }
        }
        rejected
    }

    fn serve_key(&self, node: NodeId, op: KeyOp, key: Key) -> Response {
        let partition = self.partition_of(&key);
        let touched = PartitionSet::from_iter(self.directory.partition_count(), [partition]);
        if !self.rejected_for(node, &touched).is_empty() {
            return Response::Key(KeyResponse {
                rejected: true,
                ..KeyResponse::default()
            });
        }

        let store = match self.stores.get(&node) {
            Some(store) => store,
            None => {
                return Response::Key(KeyResponse {
                    failure: Some("unknown member".into()),
                    ..KeyResponse::default()
                })
            }
        };

        let mut response = KeyResponse::default();
        match op {
            KeyOp::Get => response.value = store.get(&key).map(|v| v.clone()),
            KeyOp::Put {
                value, return_old, ..
            } => {
                let old = store.insert(key, value);
                if return_old {
                    response.value = old;
                }
            }
            KeyOp::Remove { return_old } => {
                let old = store.remove(&key).map(|(_, v)| v);
                if return_old {
                    response.value = old;
                }
            }
            KeyOp::ContainsKey => response.flag = Some(store.contains_key(&key)),
            KeyOp::Invoke { .. } => response.value = store.get(&key).map(|v| v.clone()),
            KeyOp::Lock { holder, .. } => {
                let granted = match self.locks.get(&key) {
                    Some(current) => *current == holder,
                    None => {
                        self.locks.insert(key, holder);
                        true
                    }
                };
                response.flag = Some(granted);
            }
            KeyOp::Unlock { holder } => {
                let released = match self.locks.get(&key).map(|h| *h) {
                    Some(current) if current == holder => {
                        self.locks.remove(&key);
                        true
                    }
                    Some(_) => false,
                    None => true,
                };
                response.flag = Some(released);
            }
        }
        Response::Key(response)
    }

    fn serve_keyset(&self, node: NodeId, op: KeySetOp, keys: Vec<Key>) -> Response {
        let universe = self.directory.partition_count();
        let touched = PartitionSet::from_iter(universe, keys.iter().map(|k| self.partition_of(k)));
        let rejected_parts = self.rejected_for(node, &touched);

        let (served, rejected_keys): (Vec<Key>, Vec<Key>) = keys
            .into_iter()
            .partition(|k| !rejected_parts.contains(self.partition_of(k)));

        let store = self.stores.get(&node);
        let store = match store {
            Some(store) => store,
            None => {
                return Response::Map(MapResponse {
                    failure: Some("unknown member".into()),
                    ..MapResponse::default()
                })
            }
        };

        match op {
            KeySetOp::GetAll => Response::Map(MapResponse {
                entries: served
                    .iter()
                    .filter_map(|k| store.get(k).map(|v| (k.clone(), Some(v.clone()))))
                    .collect(),
                rejected_keys,
                ..MapResponse::default()
            }),
            KeySetOp::InvokeAll { .. } => Response::Map(MapResponse {
                entries: served
                    .iter()
                    .map(|k| (k.clone(), store.get(k).map(|v| v.clone())))
                    .collect(),
                rejected_keys,
                ..MapResponse::default()
            }),
            KeySetOp::RemoveAll => {
                let mut changed = false;
                for k in &served {
                    changed |= store.remove(k).is_some();
                }
                Response::Scalar(ScalarResponse {
                    results: vec![Scalar::Flag(changed)],
                    rejected_keys,
                    ..ScalarResponse::default()
                })
            }
            KeySetOp::ContainsAll => Response::Scalar(ScalarResponse {
                results: vec![Scalar::Flag(served.iter().all(|k| store.contains_key(k)))],
                rejected_keys,
                ..ScalarResponse::default()
            }),
            KeySetOp::AggregateKeys { .. } => {
                let count = served.iter().filter(|k| store.contains_key(*k)).count() as u64;
                Response::Scalar(ScalarResponse {
                    results: vec![Scalar::Blob(Value::from(count.to_le_bytes().to_vec()))],
                    rejected_keys,
                    ..ScalarResponse::default()
                })
            }
            KeySetOp::AddListener { .. } | KeySetOp::RemoveListener { .. } => {
                Response::Map(MapResponse {
                    rejected_keys,
                    ..MapResponse::default()
                })
            }
        }
    }

    fn serve_entries(
        &self,
        node: NodeId,
        entries: Vec<(Key, Value)>,
        touched: PartitionSet,
    ) -> Response {
        let rejected_parts = self.rejected_for(node, &touched);

        let store = match self.stores.get(&node) {
            Some(store) => store,
            None => {
                return Response::Map(MapResponse {
                    failure: Some("unknown member".into()),
                    ..MapResponse::default()
                })
            }
        };

        for (key, value) in entries {
            if !rejected_parts.contains(self.partition_of(&key)) {
                store.insert(key, value);
            }
        }

        Response::Map(MapResponse {
            rejected_partitions: if rejected_parts.is_empty() {
                None
            } else {
                Some(rejected_parts)
            },
            ..MapResponse::default()
        })
    }

    fn serve_partial(&self, node: NodeId, op: PartialOp, partitions: PartitionSet) -> Response {
        let rejected_parts = self.rejected_for(node, &partitions);
        let mut served = partitions;
        served.remove_all(&rejected_parts);
        let rejected = if rejected_parts.is_empty() {
            None
        } else {
            Some(rejected_parts)
        };

        let store = match self.stores.get(&node) {
            Some(store) => store,
            None => {
                return Response::Scalar(ScalarResponse {
                    failure: Some("unknown member".into()),
                    ..ScalarResponse::default()
                })
            }
        };

        // keys of the served partitions, sorted for deterministic paging
        let mut keys: Vec<Key> = store
            .iter()
            .map(|e| e.key().clone())
            .filter(|k| served.contains(self.partition_of(k)))
            .collect();
        keys.sort();

        let wants_entries = matches!(op, PartialOp::QueryEntries { .. });
        match op {
            PartialOp::Size => Response::Scalar(ScalarResponse {
                results: vec![Scalar::Count(keys.len() as u64)],
                rejected_partitions: rejected,
                ..ScalarResponse::default()
            }),
            PartialOp::Clear | PartialOp::Truncate => {
                for k in &keys {
                    store.remove(k);
                }
                Response::Scalar(ScalarResponse {
                    rejected_partitions: rejected,
                    ..ScalarResponse::default()
                })
            }
            PartialOp::ContainsValue { value } => Response::Scalar(ScalarResponse {
                results: vec![Scalar::Flag(
                    keys.iter().any(|k| store.get(k).map(|v| v.clone()) == Some(value.clone())),
                )],
                rejected_partitions: rejected,
                ..ScalarResponse::default()
            }),
            PartialOp::QueryKeys { limit, .. } | PartialOp::QueryEntries { limit, .. } => {
                let available = keys.len() as u64;
                let (skip, size) = match limit {
                    Some(l) => (l.skip as usize, l.size as usize),
                    None => (0, usize::MAX),
                };
                let page: Vec<QueryItem> = keys
                    .into_iter()
                    .skip(skip)
                    .take(size)
                    .map(|k| {
                        if wants_entries {
                            let v = store.get(&k).map(|v| v.clone()).unwrap_or_default();
                            QueryItem::Entry(k, v)
                        } else {
                            QueryItem::Key(k)
                        }
                    })
                    .collect();
                let payload_bytes = page.iter().map(|i| i.key().len() as u64).sum();
                Response::Query(QueryResponse {
                    items: page,
                    available,
                    payload_bytes,
                    rejected_partitions: rejected,
                    failure: None,
                })
            }
            PartialOp::KeyIterator => {
                let available = keys.len() as u64;
                let payload_bytes = keys.iter().map(|k| k.len() as u64).sum();
                Response::Query(QueryResponse {
                    items: keys.into_iter().map(QueryItem::Key).collect(),
                    available,
                    payload_bytes,
                    rejected_partitions: rejected,
                    failure: None,
                })
            }
            PartialOp::InvokeFilter { .. } => Response::Map(MapResponse {
                entries: keys
                    .iter()
                    .map(|k| (k.clone(), store.get(k).map(|v| v.clone())))
                    .collect(),
                rejected_partitions: rejected,
                ..MapResponse::default()
            }),
            PartialOp::AggregateFilter { .. } => Response::Scalar(ScalarResponse {
                results: vec![Scalar::Blob(Value::from(
                    (keys.len() as u64).to_le_bytes().to_vec(),
                ))],
                rejected_partitions: rejected,
                ..ScalarResponse::default()
            }),
            PartialOp::AddFilterListener { .. } | PartialOp::RemoveFilterListener { .. } => {
                Response::Scalar(ScalarResponse {
                    rejected_partitions: rejected,
                    ..ScalarResponse::default()
                })
            }
        }
    }

    fn serve(&self, node: NodeId, request: Request) -> Response {
        match request.body {
            RequestBody::Key { op, key } => self.serve_key(node, op, key),
            RequestBody::KeySet { op, keys } => self.serve_keyset(node, op, keys),
            RequestBody::Entries { entries, .. } => {
                let touched = PartitionSet::from_iter(
                    self.directory.partition_count(),
                    entries.iter().map(|(k, _)| self.partition_of(k)),
                );
                self.serve_entries(node, entries, touched)
            }
            RequestBody::Partial { op, partitions } => self.serve_partial(node, op, partitions),
        }
    }

    fn take_failure(&self, node: NodeId) -> bool {
        let mut failures = self.fail_polls.lock();
        match failures.get_mut(&node) {
            Some(0) | None => false,
            Some(count) => {
                *count -= 1;
                true
            }
        }
    }
}

#[async_trait]
impl Transport for MockTransport {
    fn local_node(&self) -> NodeId {
        self.local
    }

    async fn poll(&self, target: NodeId, request: Request, deadline: Deadline) -> Result<Response> {
        if deadline.expired() {
            return Err(Error::timeout());
        }
        if self.take_failure(target) {
            return Err(Error::Interrupted);
        }
        self.poll_log.lock().push((target, request.clone()));
        Ok(self.serve(target, request))
    }

    async fn poll_all(
        &self,
        requests: Vec<(NodeId, Request)>,
        deadline: Deadline,
    ) -> Result<PollOutcome> {
        let mut responses = Vec::with_capacity(requests.len());
        for (target, request) in requests {
            if deadline.expired() {
                return Ok(PollOutcome::TimedOut(responses));
            }
            if self.take_failure(target) {
                return Err(Error::Interrupted);
            }
            self.poll_log.lock().push((target, request.clone()));
            responses.push((target, self.serve(target, request)));
        }
        Ok(PollOutcome::Complete(responses))
    }

    fn post(&self, target: NodeId, request: Request) {
        self.posted.lock().push((target, request));
    }
}

/// A directory, transport, and contention slots wired together.
pub struct MockCluster {
    pub nodes: Vec<NodeId>,
    pub slots: Arc<ContentionSlots>,
    pub directory: Arc<OwnershipDirectory>,
    pub transport: Arc<MockTransport>,
}

impl MockCluster {
    /// Round-robin every partition across the nodes, with the first node
    /// as the local member.
    pub fn new(partition_count: u32, nodes: &[NodeId]) -> Self {
        let slots = Arc::new(ContentionSlots::new(partition_count));
        let directory = Arc::new(OwnershipDirectory::new(partition_count, slots.clone()));

        let primaries = (0..partition_count)
            .map(|p| Some(nodes[p as usize % nodes.len()]))
            .collect();
        directory.publish(primaries);
        directory.set_alive(nodes.to_vec());
        directory.set_assignment_complete(true);

        let transport = Arc::new(MockTransport::new(nodes[0], directory.clone(), nodes));
        Self {
            nodes: nodes.to_vec(),
            slots,
            directory,
            transport,
        }
    }

    pub fn cache_with_config(&self, name: &str, config: GridConfig) -> GridCache {
        GridCache::new(
            name,
            1,
            config,
            self.directory.clone(),
            self.transport.clone(),
            self.slots.clone(),
        )
    }

    pub fn cache(&self, name: &str) -> GridCache {
        let config = GridConfig::new(self.directory.partition_count())
            .with_redistribution_tick(std::time::Duration::from_millis(20));
        self.cache_with_config(name, config)
    }

    /// Current owner of a key.
    pub fn owner_of(&self, key: &Key) -> Option<NodeId> {
        let p = self.directory.partition_of(key);
        self.directory.assignments().primary(p)
    }

    /// Move a partition to a new owner: migrate its entries between the
    /// backing stores, then publish the ownership change.
    pub fn move_partition(&self, partition: PartitionId, to: NodeId) {
        for node in &self.nodes {
            if *node == to {
                continue;
            }
            if let Some(store) = self.transport.stores.get(node) {
                let moved: Vec<Key> = store
                    .iter()
                    .map(|e| e.key().clone())
                    .filter(|k| self.directory.partition_of(k) == partition)
                    .collect();
                for key in moved {
                    if let Some((key, value)) = store.remove(&key) {
                        self.transport.store_insert(to, key, value);
                    }
                }
            }
        }
        self.directory.set_primary(partition, Some(to));
    }

    /// Seed entries directly into their owners' stores.
    pub fn seed(&self, entries: impl IntoIterator<Item = (Key, Value)>) {
        for (key, value) in entries {
            if let Some(owner) = self.owner_of(&key) {
                self.transport.store_insert(owner, key, value);
            }
        }
    }
}

//! Map event listeners and the per-cache filter registry.
//!
//! The registry assigns unique ids to remote filters and tracks which
//! listeners observe which keys or filters. It is read from request
//! paths and mutated from both request paths and the asynchronous event
//! dispatch, so all maps are internally synchronized. Delivery beyond
//! the hand-off in [`ListenerRegistry::dispatch`] is the transport's
//! concern.

use crate::message::FilterSpec;
use crate::types::{Key, Value};
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::warn;

/// Kind of change a map event describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    Inserted,
    Updated,
    Deleted,
}

/// A change observed at a partition owner and routed to listeners.
#[derive(Debug, Clone)]
pub struct MapEvent {
    pub kind: EventKind,
    pub key: Key,
    pub old_value: Option<Value>,
    pub new_value: Option<Value>,
    /// Filter ids at the owner that matched this event, empty for
    /// key-registered listeners.
    pub filter_ids: Vec<u64>,
}

/// Observer of cache changes.
pub trait MapListener: Send + Sync {
    fn on_event(&self, event: &MapEvent);

    /// Lite listeners receive events without old/new values attached.
    fn is_lite(&self) -> bool {
        false
    }
}

type ListenerRef = Arc<dyn MapListener>;

/// Per-cache listener and filter bookkeeping.
pub struct ListenerRegistry {
    next_filter_id: AtomicU64,
    /// filter id -> the filter it was registered under
    filters: DashMap<u64, Option<FilterSpec>>,
    by_key: DashMap<Key, Vec<ListenerRef>>,
    by_filter: DashMap<u64, Vec<ListenerRef>>,
}

impl ListenerRegistry {
    pub fn new() -> Self {
        Self {
            next_filter_id: AtomicU64::new(1),
            filters: DashMap::new(),
            by_key: DashMap::new(),
            by_filter: DashMap::new(),
        }
    }

    /// Assign a unique id to a filter registration. Ids are never reused
    /// for the life of the cache reference.
    pub fn register_filter(&self, filter: Option<FilterSpec>) -> u64 {
        let id = self.next_filter_id.fetch_add(1, Ordering::Relaxed);
        self.filters.insert(id, filter);
        id
    }

    pub fn filter_of(&self, filter_id: u64) -> Option<Option<FilterSpec>> {
        self.filters.get(&filter_id).map(|f| f.clone())
    }

    pub fn add_key_listener(&self, key: Key, listener: Arc<dyn MapListener>) {
        self.by_key.entry(key).or_default().push(listener);
    }

    /// Remove all listeners for a key; returns whether any were present.
    pub fn remove_key_listeners(&self, key: &Key) -> bool {
        self.by_key.remove(key).is_some()
    }

    pub fn add_filter_listener(&self, filter_id: u64, listener: Arc<dyn MapListener>) {
        self.by_filter.entry(filter_id).or_default().push(listener);
    }

    /// Remove the listeners registered under a filter id and forget the
    /// filter; returns whether the id was known.
    pub fn remove_filter_listeners(&self, filter_id: u64) -> bool {
        self.filters.remove(&filter_id);
        self.by_filter.remove(&filter_id).is_some()
    }

    pub fn is_empty(&self) -> bool {
        self.by_key.is_empty() && self.by_filter.is_empty()
    }

    /// Keys that currently have listeners.
    pub fn listened_keys(&self) -> Vec<Key> {
        self.by_key.iter().map(|e| e.key().clone()).collect()
    }

    /// Filter ids that currently have listeners.
    pub fn listened_filters(&self) -> Vec<u64> {
        self.by_filter.iter().map(|e| *e.key()).collect()
    }

    /// Hand a decoded remote event to every listener it targets.
    pub fn dispatch(&self, event: &MapEvent) {
        if let Some(listeners) = self.by_key.get(&event.key) {
            for listener in listeners.iter() {
                listener.on_event(event);
            }
        }

        for filter_id in &event.filter_ids {
            match self.by_filter.get(filter_id) {
                Some(listeners) => {
                    for listener in listeners.iter() {
                        listener.on_event(event);
                    }
                }
                None => {
                    // deregistration raced the owner's event stream
                    warn!(filter_id, "event for unknown filter id dropped");
                }
            }
        }
    }
}

impl Default for ListenerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for ListenerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ListenerRegistry")
            .field("keys", &self.by_key.len())
            .field("filters", &self.by_filter.len())
            .finish()
    }
}

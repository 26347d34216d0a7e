//! Client-side coordination layer for a partitioned key-value cache.
//!
//! Data is split across a fixed number of logical partitions, each owned
//! by exactly one primary node at a time; ownership moves as nodes join,
//! leave, and storage rebalances. This crate turns logical map
//! operations into per-owner sub-requests against that moving topology:
//! - **Ownership resolution** against immutable assignment snapshots
//! - **Per-owner splitting** of keys, entries, and partition sets
//! - **Concurrent dispatch** with merge of partial responses
//! - **Transparent retry** of the portions rejected because of ownership
//!   changes, with a per-partition backoff that avoids retry storms
//! - **Paged queries** with exact sequential or best-effort distributed
//!   strategies
//!
//! The messaging transport and the ownership directory are external
//! collaborators behind the [`transport::Transport`] and
//! [`ownership::OwnershipView`] traits; keys and values are opaque byte
//! blobs.
//!
//! # Example
//!
//! ```rust,ignore
//! use gridmap::{GridCache, GridConfig};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> gridmap::Result<()> {
//!     let config = GridConfig::default();
//!     let slots = Arc::new(gridmap::ContentionSlots::new(config.partition_count));
//!     let directory = Arc::new(gridmap::OwnershipDirectory::new(
//!         config.partition_count,
//!         slots.clone(),
//!     ));
//!     // transport: your RPC layer implementing gridmap::Transport
//!     # let transport: Arc<dyn gridmap::Transport> = unimplemented!();
//!
//!     let cache = GridCache::new("prices", 1, config, directory, transport, slots);
//!     cache.put("EUR".into(), "1.07".into()).await?;
//!     let value = cache.get("EUR".into()).await?;
//!     Ok(())
//! }
//! ```
//!
//! # Consistency model
//!
//! A caller never observes a partial or mixed result unless the request
//! deadline elapses, in which case the timeout error carries whatever
//! merged cleanly. Reads may be routed to non-primary members only when
//! an explicit read locator is installed.

pub mod cache;
pub mod config;
pub mod contention;
pub mod coordinator;
pub mod error;
pub mod listener;
pub mod merge;
pub mod message;
pub mod ownership;
pub mod paging;
pub mod partition;
pub mod split;
pub mod status;
pub mod transport;
pub mod types;

pub mod testing;

// Re-export main types for convenience
pub use cache::{EntryPager, GridCache, KeyPager};
pub use config::GridConfig;
pub use contention::ContentionSlots;
pub use coordinator::{Coordinator, Lifecycle, ReadLocator};
pub use error::{Error, PartialResult, Result};
pub use types::{CacheId, Deadline, Key, NodeId, PartitionId, Value};

// Re-export collaborator traits and ownership types
pub use ownership::{Assignments, OwnershipDirectory, OwnershipView};
pub use transport::{PollOutcome, Transport};

// Re-export message and paging surface
pub use listener::{EventKind, ListenerRegistry, MapEvent, MapListener};
pub use message::{AgentSpec, FilterSpec, LimitSpec, QueryItem, Request, Response};
pub use paging::{LimitFilter, PagedQueryEngine, QueryCursor};
pub use partition::PartitionSet;

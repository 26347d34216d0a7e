//! Request and response payloads exchanged with partition owners.
//!
//! The original wire protocol has one message type per operation; here a
//! small set of tagged variants covers the four request shapes (by key, by
//! key set, by entry map, by partition set), parameterized by operation
//! kind. Keys, values, filters and agents are opaque blobs; how the storage
//! engine interprets them is out of scope.

use crate::partition::PartitionSet;
use crate::types::{CacheId, Key, NodeId, Value};
use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// An opaque, serialized filter evaluated by the storage engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilterSpec(pub Bytes);

/// An opaque, serialized entry processor or aggregator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentSpec(pub Bytes);

/// Page bounds accompanying a limited query sub-request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LimitSpec {
    /// Maximum number of items the owner should return.
    pub size: u32,
    /// Number of leading matches the owner should skip.
    pub skip: u32,
}

/// Single-key operation kinds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum KeyOp {
    Get,
    Put {
        value: Value,
        ttl_ms: Option<u64>,
        return_old: bool,
    },
    Remove {
        return_old: bool,
    },
    ContainsKey,
    Invoke {
        agent: AgentSpec,
    },
    Lock {
        holder: NodeId,
        lease_millis: u64,
        wait_millis: i64,
    },
    Unlock {
        holder: NodeId,
    },
}

/// Key-set operation kinds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum KeySetOp {
    GetAll,
    RemoveAll,
    ContainsAll,
    InvokeAll { agent: AgentSpec },
    AggregateKeys { agent: AgentSpec },
    AddListener { filter_id: Option<u64>, lite: bool },
    RemoveListener { filter_id: Option<u64> },
}

/// Partition-set operation kinds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum PartialOp {
    Clear,
    Truncate,
    Size,
    ContainsValue {
        value: Value,
    },
    QueryKeys {
        filter: Option<FilterSpec>,
        limit: Option<LimitSpec>,
    },
    QueryEntries {
        filter: Option<FilterSpec>,
        limit: Option<LimitSpec>,
    },
    InvokeFilter {
        filter: Option<FilterSpec>,
        agent: AgentSpec,
    },
    AggregateFilter {
        filter: Option<FilterSpec>,
        agent: AgentSpec,
    },
    AddFilterListener {
        filter_id: u64,
        filter: Option<FilterSpec>,
        lite: bool,
    },
    RemoveFilterListener {
        filter_id: u64,
    },
    KeyIterator,
}

/// A request addressed to one partition owner.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Request {
    /// The logical cache the request is for.
    pub cache_id: CacheId,
    pub body: RequestBody,
}

/// The four request shapes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RequestBody {
    /// Operation on a single key.
    Key { op: KeyOp, key: Key },
    /// Operation on the subset of keys owned by the target.
    KeySet { op: KeySetOp, keys: Vec<Key> },
    /// Entry insertion for the subset of entries owned by the target.
    Entries {
        entries: Vec<(Key, Value)>,
        ttl_ms: Option<u64>,
    },
    /// Operation on the subset of partitions owned by the target.
    Partial {
        op: PartialOp,
        partitions: PartitionSet,
    },
}

impl Request {
    /// Serialize the request to bytes.
    pub fn to_bytes(&self) -> Result<Vec<u8>, bincode::Error> {
        bincode::serialize(self)
    }

    /// Deserialize a request from bytes.
    pub fn from_bytes(data: &[u8]) -> Result<Self, bincode::Error> {
        bincode::deserialize(data)
    }
}

/// A scalar partial result from one owner.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Scalar {
    /// An entry or match count.
    Count(u64),
    /// A boolean outcome (contains_value, remove_all changed-anything).
    Flag(bool),
    /// An opaque aggregation partial.
    Blob(Value),
}

/// One item of a query result set.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum QueryItem {
    Key(Key),
    Entry(Key, Value),
}

impl QueryItem {
    /// The key of this item.
    pub fn key(&self) -> &Key {
        match self {
            QueryItem::Key(k) => k,
            QueryItem::Entry(k, _) => k,
        }
    }
}

/// Response to a single-key request.
///
/// `rejected` is the owner-rejection indicator: the target no longer owns
/// the key's partition and the request must be re-resolved and re-sent.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyResponse {
    pub rejected: bool,
    pub failure: Option<String>,
    pub value: Option<Value>,
    pub flag: Option<bool>,
}

/// Response to a key-set or entries request carrying map-shaped results.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MapResponse {
    /// Result entries; a `None` value means "entry absent" and is never
    /// inserted into the merged map.
    pub entries: Vec<(Key, Option<Value>)>,
    /// Keys the owner no longer holds; folded into the next retry round.
    pub rejected_keys: Vec<Key>,
    /// Partitions the owner no longer holds (entries requests).
    pub rejected_partitions: Option<PartitionSet>,
    /// Keys that failed remote execution; reported, never retried.
    pub failed_keys: Vec<Key>,
    pub failure: Option<String>,
}

/// Response to a key-set or partition request carrying scalar results.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScalarResponse {
    pub results: Vec<Scalar>,
    pub rejected_keys: Vec<Key>,
    /// Partitions the owner did not process; retried by the caller.
    pub rejected_partitions: Option<PartitionSet>,
    pub failure: Option<String>,
}

/// Response to a query or key-iterator request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryResponse {
    pub items: Vec<QueryItem>,
    /// Total matches available at the owner, including those not returned
    /// because of a page limit.
    pub available: u64,
    /// Serialized size of the returned page, used for batch estimation.
    pub payload_bytes: u64,
    /// Partitions the owner did not process; retried by the caller.
    pub rejected_partitions: Option<PartitionSet>,
    pub failure: Option<String>,
}

impl Default for QueryResponse {
    fn default() -> Self {
        Self {
            items: Vec::new(),
            available: 0,
            payload_bytes: 0,
            rejected_partitions: None,
            failure: None,
        }
    }
}

/// A response from one owner, shaped per the request it answers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Response {
    Key(KeyResponse),
    Map(MapResponse),
    Scalar(ScalarResponse),
    Query(QueryResponse),
}

impl Response {
    /// Keys rejected by the responding owner, if any.
    pub fn rejected_keys(&self) -> &[Key] {
        match self {
            Response::Map(r) => &r.rejected_keys,
            Response::Scalar(r) => &r.rejected_keys,
            _ => &[],
        }
    }

    /// Partitions rejected by the responding owner, if any.
    pub fn rejected_partitions(&self) -> Option<&PartitionSet> {
        match self {
            Response::Map(r) => r.rejected_partitions.as_ref(),
            Response::Scalar(r) => r.rejected_partitions.as_ref(),
            Response::Query(r) => r.rejected_partitions.as_ref(),
            Response::Key(_) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_roundtrip() {
        let req = Request {
            cache_id: 7,
            body: RequestBody::KeySet {
                op: KeySetOp::GetAll,
                keys: vec![Bytes::from_static(b"k1"), Bytes::from_static(b"k2")],
            },
        };
        let bytes = req.to_bytes().unwrap();
        assert_eq!(Request::from_bytes(&bytes).unwrap(), req);
    }

    #[test]
    fn test_query_item_key() {
        let k = Bytes::from_static(b"a");
        assert_eq!(QueryItem::Key(k.clone()).key(), &k);
        assert_eq!(
            QueryItem::Entry(k.clone(), Bytes::from_static(b"v")).key(),
            &k
        );
    }

    #[test]
    fn test_rejection_accessors() {
        let resp = Response::Map(MapResponse {
            rejected_keys: vec![Bytes::from_static(b"k")],
            ..Default::default()
        });
        assert_eq!(resp.rejected_keys().len(), 1);
        assert!(resp.rejected_partitions().is_none());

        let resp = Response::Scalar(ScalarResponse {
            rejected_partitions: Some(PartitionSet::from_iter(8, [2, 3])),
            ..Default::default()
        });
        assert_eq!(resp.rejected_partitions().unwrap().len(), 2);
    }
}

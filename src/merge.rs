//! Merging of per-owner partial responses into one logical result.

use crate::error::{Error, PartialResult, Result};
use crate::message::{QueryItem, Response, Scalar};
use crate::types::{Key, NodeId, Value};
use std::collections::HashMap;
use tracing::warn;

/// The logical result shape of an operation, used to re-merge the raw
/// partials attached to a timeout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseShape {
    /// No partial result can be expressed (void or single-scalar ops).
    Void,
    Scalars,
    Map,
    Items,
}

fn remote(failure: &str) -> Error {
    warn!(failure, "received a remote exception");
    Error::Remote(failure.to_string())
}

/// Merge scalar partial responses into a list of values.
///
/// A partial carrying a failure short-circuits the merge.
pub fn merge_scalar_responses(parts: &[(NodeId, Response)]) -> Result<Vec<Scalar>> {
    let mut results = Vec::with_capacity(parts.len());
    for (_, response) in parts {
        match response {
            Response::Scalar(r) => {
                if let Some(failure) = &r.failure {
                    return Err(remote(failure));
                }
                results.extend(r.results.iter().cloned());
            }
            Response::Key(r) => {
                if let Some(failure) = &r.failure {
                    return Err(remote(failure));
                }
                if let Some(value) = &r.value {
                    results.push(Scalar::Blob(value.clone()));
                }
            }
            other => {
                return Err(Error::Internal(format!(
                    "unexpected response in scalar merge: {other:?}"
                )))
            }
        }
    }
    Ok(results)
}

/// Merge map-shaped partial responses into a single map.
///
/// A `None` value means the entry is absent and is never inserted. A
/// partial failure records the failed keys; the merge completes, and the
/// failure is surfaced with those keys attached while successes collected
/// before the failing partial are preserved.
pub fn merge_map_responses(parts: &[(NodeId, Response)]) -> Result<HashMap<Key, Value>> {
    let mut merged: HashMap<Key, Value> = HashMap::new();
    let mut failed_keys: Vec<Key> = Vec::new();
    let mut failure: Option<String> = None;

    for (_, response) in parts {
        match response {
            Response::Map(r) => {
                if let Some(f) = &r.failure {
                    failure = Some(f.clone());
                    failed_keys.extend(r.failed_keys.iter().cloned());
                }
                if failure.is_some() {
                    // once any owner failed, only failed keys are collected
                    continue;
                }
                for (key, value) in &r.entries {
                    if let Some(value) = value {
                        merged.insert(key.clone(), value.clone());
                    }
                }
            }
            Response::Query(r) => {
                if let Some(f) = &r.failure {
                    return Err(remote(f));
                }
                for item in &r.items {
                    if let QueryItem::Entry(key, value) = item {
                        merged.insert(key.clone(), value.clone());
                    }
                }
            }
            other => {
                return Err(Error::Internal(format!(
                    "unexpected response in map merge: {other:?}"
                )))
            }
        }
    }

    match failure {
        Some(message) => Err(Error::Incomplete {
            message,
            failed_keys,
        }),
        None => Ok(merged),
    }
}

/// Merge query partial responses into at most `limit` items after skipping
/// `skip`, preserving per-owner order. `limit == 0` means unbounded. A
/// failing partial is thrown immediately; queries accumulate no partial
/// result.
pub fn merge_query_responses(
    parts: &[(NodeId, Response)],
    skip: usize,
    limit: usize,
) -> Result<Vec<QueryItem>> {
    let mut skip = skip;
    let mut merged = Vec::new();

    'all: for (_, response) in parts {
        let r = match response {
            Response::Query(r) => r,
            other => {
                return Err(Error::Internal(format!(
                    "unexpected response in query merge: {other:?}"
                )))
            }
        };
        if let Some(failure) = &r.failure {
            return Err(remote(failure));
        }

        if skip >= r.items.len() {
            skip -= r.items.len();
            continue;
        }
        for item in &r.items[skip..] {
            merged.push(item.clone());
            if limit > 0 && merged.len() == limit {
                break 'all;
            }
        }
        skip = 0;
    }

    Ok(merged)
}

/// Re-merge the raw per-owner partials attached to a timeout into the
/// operation's logical shape, so callers that inspect the timeout see a
/// merged value rather than raw fragments.
pub fn remerge_timeout(error: Error, shape: ResponseShape) -> Error {
    let parts = match &error {
        Error::Timeout {
            partial: Some(PartialResult::Raw(parts)),
        } => parts.clone(),
        _ => return error,
    };

    let partial = match shape {
        ResponseShape::Void => None,
        ResponseShape::Scalars => merge_scalar_responses(&parts).ok().map(PartialResult::Scalars),
        ResponseShape::Map => merge_map_responses(&parts).ok().map(PartialResult::Map),
        ResponseShape::Items => merge_query_responses(&parts, 0, 0)
            .ok()
            .map(PartialResult::Items),
    };

    Error::Timeout { partial }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{MapResponse, QueryResponse, ScalarResponse};
    use bytes::Bytes;

    fn key(s: &str) -> Key {
        Bytes::copy_from_slice(s.as_bytes())
    }

    fn map_part(entries: Vec<(Key, Option<Value>)>) -> Response {
        Response::Map(MapResponse {
            entries,
            ..Default::default()
        })
    }

    #[test]
    fn test_merge_map_combines_owners() {
        let parts = vec![
            (1, map_part(vec![(key("k1"), Some(key("v1")))])),
            (2, map_part(vec![(key("k2"), Some(key("v2")))])),
        ];
        let merged = merge_map_responses(&parts).unwrap();
        assert_eq!(merged.len(), 2);
        assert_eq!(merged[&key("k1")], key("v1"));
        assert_eq!(merged[&key("k2")], key("v2"));
    }

    #[test]
    fn test_merge_map_excludes_absent_entries() {
        let parts = vec![(
            1,
            map_part(vec![(key("k1"), Some(key("v1"))), (key("k2"), None)]),
        )];
        let merged = merge_map_responses(&parts).unwrap();
        assert_eq!(merged.len(), 1);
        assert!(!merged.contains_key(&key("k2")));
    }

    #[test]
    fn test_merge_map_partial_failure_carries_failed_keys() {
        let parts = vec![
            (1, map_part(vec![(key("k1"), Some(key("v1")))])),
            (
                2,
                Response::Map(MapResponse {
                    failed_keys: vec![key("k2"), key("k3")],
                    failure: Some("processor failed".into()),
                    ..Default::default()
                }),
            ),
        ];
        match merge_map_responses(&parts).unwrap_err() {
            Error::Incomplete {
                message,
                failed_keys,
            } => {
                assert_eq!(message, "processor failed");
                assert_eq!(failed_keys, vec![key("k2"), key("k3")]);
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_merge_scalar_failure_short_circuits() {
        let parts = vec![(
            1,
            Response::Scalar(ScalarResponse {
                failure: Some("boom".into()),
                ..Default::default()
            }),
        )];
        assert!(matches!(
            merge_scalar_responses(&parts).unwrap_err(),
            Error::Remote(_)
        ));
    }

    #[test]
    fn test_merge_query_skip_limit() {
        let q = |items: Vec<QueryItem>| {
            Response::Query(QueryResponse {
                items,
                ..Default::default()
            })
        };
        let parts = vec![
            (1, q(vec![QueryItem::Key(key("a")), QueryItem::Key(key("b"))])),
            (2, q(vec![QueryItem::Key(key("c")), QueryItem::Key(key("d"))])),
        ];

        let all = merge_query_responses(&parts, 0, 0).unwrap();
        assert_eq!(all.len(), 4);

        let page = merge_query_responses(&parts, 1, 2).unwrap();
        assert_eq!(
            page,
            vec![QueryItem::Key(key("b")), QueryItem::Key(key("c"))]
        );
    }

    #[test]
    fn test_remerge_timeout_to_map_shape() {
        let parts = vec![
            (1, map_part(vec![(key("k1"), Some(key("v1")))])),
            (2, map_part(vec![(key("k2"), Some(key("v2")))])),
        ];
        let err = Error::Timeout {
            partial: Some(PartialResult::Raw(parts)),
        };
        match remerge_timeout(err, ResponseShape::Map) {
            Error::Timeout {
                partial: Some(PartialResult::Map(map)),
            } => assert_eq!(map.len(), 2),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn test_remerge_timeout_void_drops_partial() {
        let err = Error::Timeout {
            partial: Some(PartialResult::Raw(vec![])),
        };
        match remerge_timeout(err, ResponseShape::Void) {
            Error::Timeout { partial: None } => {}
            other => panic!("unexpected: {other:?}"),
        }
    }
}

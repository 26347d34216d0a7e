//! Error types for the coordination layer.

use crate::message::{QueryItem, Scalar};
use crate::types::{Key, NodeId, Value};
use std::collections::HashMap;
use thiserror::Error;

/// Result type alias for coordination-layer operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Best-effort partial result attached to a timeout.
///
/// Sub-responses that completed before the deadline elapsed are merged into
/// the logical shape of the operation, so callers that choose to inspect a
/// timeout see a merged value rather than raw per-owner fragments.
#[derive(Debug, Clone)]
pub enum PartialResult {
    /// Raw per-owner responses, not yet merged into an operation shape.
    Raw(Vec<(NodeId, crate::message::Response)>),
    /// Merged scalar results (size, aggregation, ...).
    Scalars(Vec<Scalar>),
    /// Merged map results (get_all, invoke_all, ...).
    Map(HashMap<Key, Value>),
    /// Merged query results (key or entry items).
    Items(Vec<QueryItem>),
}

/// Main error type for the coordination layer.
///
/// Transient ownership conditions (a partition mid-transfer, an owner that
/// rejected a request) are absorbed internally by the retry loop and never
/// surface as errors; every variant here is a terminal outcome for the call.
#[derive(Error, Debug)]
pub enum Error {
    /// No storage-enabled members exist to serve the request.
    #[error("no storage-enabled nodes exist for the cache service")]
    NoStorage,

    /// The cache reference was concurrently released or destroyed.
    #[error("the cache reference has been released")]
    CacheDestroyed,

    /// The cache service itself has been terminated.
    #[error("the cache service has been terminated")]
    ServiceStopped,

    /// Deadline exceeded while resolving targets or awaiting responses.
    /// Carries a best-effort merged partial result where the operation
    /// shape supports one.
    #[error("request timed out")]
    Timeout { partial: Option<PartialResult> },

    /// The owner executed the request but the operation itself failed
    /// (e.g. a user-supplied processor threw). Not retried.
    #[error("remote execution failed: {0}")]
    Remote(String),

    /// A batch operation partially failed on the remote side; carries the
    /// keys that failed. Successes are not re-attempted.
    #[error("partial batch failure: {message}")]
    Incomplete {
        message: String,
        failed_keys: Vec<Key>,
    },

    /// The calling task was interrupted while awaiting a response.
    #[error("operation interrupted")]
    Interrupted,

    /// The request's input collection was concurrently emptied.
    #[error("input was concurrently modified")]
    ConcurrentModification,

    /// Configuration errors.
    #[error("config error: {0}")]
    Config(String),

    /// Generic internal error (broken transport contract and the like).
    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Timeout with no partial result.
    pub fn timeout() -> Self {
        Error::Timeout { partial: None }
    }

    /// Whether this error is a timeout.
    pub fn is_timeout(&self) -> bool {
        matches!(self, Error::Timeout { .. })
    }

    /// The attached partial result, if any.
    pub fn partial_result(&self) -> Option<&PartialResult> {
        match self {
            Error::Timeout { partial } => partial.as_ref(),
            _ => None,
        }
    }
}

impl From<bincode::Error> for Error {
    fn from(e: bincode::Error) -> Self {
        Error::Internal(format!("serialization error: {e}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timeout_partial_accessor() {
        let e = Error::timeout();
        assert!(e.is_timeout());
        assert!(e.partial_result().is_none());

        let e = Error::Timeout {
            partial: Some(PartialResult::Scalars(vec![])),
        };
        assert!(e.partial_result().is_some());
    }

    #[test]
    fn test_error_display() {
        assert_eq!(
            Error::NoStorage.to_string(),
            "no storage-enabled nodes exist for the cache service"
        );
        assert_eq!(
            Error::Remote("boom".into()).to_string(),
            "remote execution failed: boom"
        );
    }
}

//! Core types used throughout the coordination layer.

use bytes::Bytes;
use std::time::{Duration, Instant};

/// Node identifier in the cluster.
pub type NodeId = u64;

/// Logical partition index, in `[0, partition_count)`.
pub type PartitionId = u32;

/// Identifier of a logical cache within the service.
pub type CacheId = u64;

/// Opaque, immutable key blob. Maps to exactly one partition.
pub type Key = Bytes;

/// Opaque, immutable value blob.
pub type Value = Bytes;

/// Absolute deadline for one logical operation, covering all its retries.
///
/// An infinite deadline is an explicit variant, never a zero sentinel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Deadline {
    /// The operation must complete before this instant.
    At(Instant),
    /// No deadline; the operation may block indefinitely.
    Never,
}

impl Deadline {
    /// Create a deadline the given duration from now, or `Never` if `None`.
    pub fn after(timeout: Option<Duration>) -> Self {
        match timeout {
            Some(t) => Deadline::At(Instant::now() + t),
            None => Deadline::Never,
        }
    }

    /// Time remaining until the deadline, or `None` for an infinite deadline.
    pub fn remaining(&self) -> Option<Duration> {
        match self {
            Deadline::At(at) => Some(at.saturating_duration_since(Instant::now())),
            Deadline::Never => None,
        }
    }

    /// Whether the deadline has already elapsed.
    pub fn expired(&self) -> bool {
        match self {
            Deadline::At(at) => Instant::now() >= *at,
            Deadline::Never => false,
        }
    }

    /// Clamp a wait interval against the remaining time.
    pub fn clamp(&self, interval: Duration) -> Duration {
        match self.remaining() {
            Some(rem) => interval.min(rem),
            None => interval,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_deadline_never() {
        let d = Deadline::after(None);
        assert_eq!(d, Deadline::Never);
        assert!(!d.expired());
        assert_eq!(d.remaining(), None);
        assert_eq!(
            d.clamp(Duration::from_millis(200)),
            Duration::from_millis(200)
        );
    }

    #[test]
    fn test_deadline_elapsed() {
        let d = Deadline::after(Some(Duration::ZERO));
        assert!(d.expired());
        assert_eq!(d.remaining(), Some(Duration::ZERO));
    }

    #[test]
    fn test_deadline_clamp() {
        let d = Deadline::after(Some(Duration::from_millis(50)));
        assert!(d.clamp(Duration::from_millis(200)) <= Duration::from_millis(50));
    }
}

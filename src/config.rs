//! Configuration for the coordination layer.

use std::time::Duration;

/// Configuration for a partitioned cache client.
#[derive(Debug, Clone)]
pub struct GridConfig {
    /// Total number of logical partitions. Fixed for the life of the service.
    pub partition_count: u32,

    /// Default request timeout, `None` for no deadline.
    pub request_timeout: Option<Duration>,

    /// Bounded wait interval used while a partition is mid-transfer; a
    /// blocked caller re-checks the contention state every tick.
    pub redistribution_tick: Duration,

    /// Overshoot applied by the distributed limited-query strategy: each
    /// owner is asked for this percentage more than the ideal even split.
    pub query_overshoot_percent: u32,

    /// Scratch-memory budget for parallel limited-query batches, in bytes.
    pub query_scratch_bytes: u64,

    /// Standard lease duration granted by `lock`.
    pub lease_millis: u64,
}

impl Default for GridConfig {
    fn default() -> Self {
        Self {
            partition_count: 257,
            request_timeout: Some(Duration::from_secs(30)),
            redistribution_tick: Duration::from_millis(200),
            query_overshoot_percent: 25,
            query_scratch_bytes: 4 * 1024 * 1024,
            lease_millis: 20_000,
        }
    }
}

impl GridConfig {
    /// Create a configuration with the given partition count.
    pub fn new(partition_count: u32) -> Self {
        Self {
            partition_count,
            ..Default::default()
        }
    }

    /// Set the default request timeout. `None` means no deadline.
    pub fn with_request_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Set the redistribution wait tick.
    pub fn with_redistribution_tick(mut self, tick: Duration) -> Self {
        self.redistribution_tick = tick;
        self
    }

    /// Set the distributed-query overshoot percentage.
    pub fn with_query_overshoot_percent(mut self, percent: u32) -> Self {
        self.query_overshoot_percent = percent;
        self
    }

    /// Set the limited-query scratch budget.
    pub fn with_query_scratch_bytes(mut self, bytes: u64) -> Self {
        self.query_scratch_bytes = bytes;
        self
    }

    /// Set the standard lock lease duration in milliseconds.
    pub fn with_lease_millis(mut self, millis: u64) -> Self {
        self.lease_millis = millis;
        self
    }

    /// Validate the configuration.
    pub fn validate(&self) -> crate::error::Result<()> {
        if self.partition_count == 0 {
            return Err(crate::error::Error::Config(
                "partition_count must be positive".into(),
            ));
        }
        if self.redistribution_tick.is_zero() {
            return Err(crate::error::Error::Config(
                "redistribution_tick must be positive".into(),
            ));
        }
        Ok(())
    }
}

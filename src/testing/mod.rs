//! Test harness for the coordination layer.
//!
//! [`MockCluster`] stands in for the out-of-scope collaborators: an
//! ownership directory a test can republish at will and an in-memory
//! transport whose per-node stores reject requests for partitions they
//! do not own. Rejections and poll failures can also be scripted to
//! drive the redistribution and recovery paths deterministically.

mod coordination_tests;
mod mock;
mod paging_tests;

pub use mock::{MockCluster, MockTransport};

/// Install a log subscriber for a test run; honors `RUST_LOG`.
#[cfg(test)]
pub(crate) fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

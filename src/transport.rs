//! Messaging abstraction between the coordination layer and partition
//! owners.
//!
//! The transport is an external collaborator: it delivers opaque requests
//! to member-addressed targets and returns their responses, bounded by the
//! caller's deadline. Rejection indicators ride inside the response
//! payloads; the transport itself knows nothing about partitions.

use crate::error::Result;
use crate::message::{Request, Response};
use crate::types::{Deadline, NodeId};
use async_trait::async_trait;

/// Outcome of a multi-target parallel poll.
#[derive(Debug)]
pub enum PollOutcome {
    /// Every sub-request received a response.
    Complete(Vec<(NodeId, Response)>),
    /// The deadline elapsed first; carries the responses that did arrive.
    TimedOut(Vec<(NodeId, Response)>),
}

/// Request/response messaging with per-request deadline.
#[async_trait]
pub trait Transport: Send + Sync {
    /// The local member's identity, used to order self-targeted
    /// sub-requests last within a concurrent dispatch set.
    fn local_node(&self) -> NodeId;

    /// Send one request and await its response.
    async fn poll(&self, target: NodeId, request: Request, deadline: Deadline) -> Result<Response>;

    /// Send every request concurrently and await all responses. Requests
    /// are dispatched in slice order; a deadline expiry yields the
    /// responses collected so far instead of an error so the caller can
    /// attach them as a partial result.
    async fn poll_all(
        &self,
        requests: Vec<(NodeId, Request)>,
        deadline: Deadline,
    ) -> Result<PollOutcome>;

    /// Fire-and-forget send.
    fn post(&self, target: NodeId, request: Request);
}

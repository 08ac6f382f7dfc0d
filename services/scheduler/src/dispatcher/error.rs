//! Errors surfaced synchronously at enqueue time.

use sked_id::ObjectKey;
use thiserror::Error;

use crate::api_calls::CallKind;

/// A call the dispatcher refused to accept.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum EnqueueError {
    /// The dispatcher is closing or closed.
    #[error("dispatcher is closed")]
    Closed,

    /// No capacity and the caller asked not to wait.
    #[error("dispatch queue full ({capacity} calls outstanding)")]
    QueueFull { capacity: usize },

    /// The relevance table refuses the call behind what is already queued.
    #[error("{incoming} for {key} rejected behind queued {queued}")]
    Rejected {
        key: ObjectKey,
        queued: CallKind,
        incoming: CallKind,
    },

    /// The producer's context was cancelled while waiting for capacity.
    #[error("enqueue cancelled")]
    Cancelled,
}

impl EnqueueError {
    pub fn is_closed(&self) -> bool {
        matches!(self, Self::Closed)
    }

    pub fn is_rejected(&self) -> bool {
        matches!(self, Self::Rejected { .. })
    }
}

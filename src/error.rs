//! Error and outcome types for the overflow queue.

use crate::packet::PacketId;
use std::fmt;
use thiserror::Error;

/// Failures of the queue itself. Per-packet drops are reported through [`Admission`].
#[derive(Debug, Error)]
pub enum QueueError {
    #[error("invalid overflow queue configuration: {0}")]
    InvalidConfig(String),

    #[error("overflow queue coordinator already started")]
    AlreadyStarted,

    #[error("overflow queue has been stopped")]
    Stopped,

    #[error("failed to spawn overflow queue coordinator: {0}")]
    Spawn(#[from] std::io::Error),
}

/// Why a packet was refused at admission.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DropReason {
    /// The queue already held its configured number of entries.
    CapacityExceeded,
    /// The queue was shutting down or already stopped.
    Stopped,
}

impl fmt::Display for DropReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            DropReason::CapacityExceeded => "overflow queue is full",
            DropReason::Stopped => "overflow queue is stopped",
        };
        write!(f, "{label}")
    }
}

/// Outcome of [`OverflowQueue::admit`](crate::OverflowQueue::admit).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[must_use]
pub enum Admission {
    Queued,
    Dropped { id: PacketId, reason: DropReason },
}

impl Admission {
    pub fn is_queued(&self) -> bool {
        matches!(self, Admission::Queued)
    }

    pub fn drop_reason(&self) -> Option<DropReason> {
        match self {
            Admission::Queued => None,
            Admission::Dropped { reason, .. } => Some(*reason),
        }
    }
}

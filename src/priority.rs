//! Priority Index over queued forwarding packets.
//!
//! Entries are keyed by a deadline-derived instant and kept in a binary heap whose head is the
//! entry with the earliest key. The index is a plain data structure; callers serialize access.

use crate::packet::{ForwardingPacket, MilliSatoshi};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::fmt;
use std::str::FromStr;
use std::time::Instant;

/// How admitted packets are keyed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SchedulingMode {
    /// Earliest deadline first; packets without a deadline use their admission time.
    #[default]
    Deadline,
    /// Every packet is keyed by its admission time, ignoring any deadline.
    Fifo,
}

impl SchedulingMode {
    pub const ALL: [SchedulingMode; 2] = [SchedulingMode::Deadline, SchedulingMode::Fifo];

    /// Priority key for `packet` admitted at `admitted_at`.
    pub fn key_for(self, packet: &ForwardingPacket, admitted_at: Instant) -> Instant {
        match self {
            SchedulingMode::Deadline => packet.deadline.unwrap_or(admitted_at),
            SchedulingMode::Fifo => admitted_at,
        }
    }
}

impl fmt::Display for SchedulingMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            SchedulingMode::Deadline => "deadline",
            SchedulingMode::Fifo => "fifo",
        };
        write!(f, "{label}")
    }
}

impl FromStr for SchedulingMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "deadline" | "edf" => Ok(SchedulingMode::Deadline),
            "fifo" | "immediate" => Ok(SchedulingMode::Fifo),
            other => Err(format!("unknown scheduling mode `{other}`")),
        }
    }
}

/// A resident packet paired with the key it is ordered by.
#[derive(Debug)]
pub struct QueueEntry {
    pub key: Instant,
    pub packet: ForwardingPacket,
}

impl Ord for QueueEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        // BinaryHeap is a max-heap: reverse so the earliest key sits on top.
        other.key.cmp(&self.key)
    }
}

impl PartialOrd for QueueEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for QueueEntry {
    fn eq(&self, other: &Self) -> bool {
        self.key == other.key
    }
}

impl Eq for QueueEntry {}

/// Earliest-key-first index. Ties between equal keys are popped in no particular order.
#[derive(Debug, Default)]
pub struct PriorityIndex {
    heap: BinaryHeap<QueueEntry>,
}

impl PriorityIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        PriorityIndex {
            heap: BinaryHeap::with_capacity(capacity),
        }
    }

    pub fn push(&mut self, key: Instant, packet: ForwardingPacket) {
        self.heap.push(QueueEntry { key, packet });
    }

    /// Remove and return the head entry.
    pub fn pop(&mut self) -> Option<QueueEntry> {
        self.heap.pop()
    }

    /// Key of the head entry, without removing it.
    pub fn head_key(&self) -> Option<Instant> {
        self.heap.peek().map(|entry| entry.key)
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }

    /// Smallest amount among resident entries, found by a full scan.
    pub fn min_amount(&self) -> Option<MilliSatoshi> {
        self.heap.iter().map(|entry| entry.packet.amount).min()
    }

    /// Sum of resident amounts, found by a full scan.
    pub fn total_amount(&self) -> MilliSatoshi {
        self.heap.iter().map(|entry| entry.packet.amount).sum()
    }
}

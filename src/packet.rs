//! Forwarding packet representation handed to the overflow queue.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::{Add, AddAssign, Sub, SubAssign};
use std::time::{Duration, Instant};

/// Amount in thousandths of a satoshi.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MilliSatoshi(pub u64);

impl MilliSatoshi {
    pub const ZERO: MilliSatoshi = MilliSatoshi(0);

    /// Convert a whole-satoshi amount.
    pub const fn from_satoshis(sat: u64) -> Self {
        MilliSatoshi(sat * 1000)
    }

    pub const fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for MilliSatoshi {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} mSAT", self.0)
    }
}

impl Add for MilliSatoshi {
    type Output = MilliSatoshi;

    fn add(self, rhs: Self) -> Self::Output {
        MilliSatoshi(self.0.saturating_add(rhs.0))
    }
}

impl AddAssign for MilliSatoshi {
    fn add_assign(&mut self, rhs: Self) {
        *self = *self + rhs;
    }
}

impl Sub for MilliSatoshi {
    type Output = MilliSatoshi;

    fn sub(self, rhs: Self) -> Self::Output {
        MilliSatoshi(self.0.saturating_sub(rhs.0))
    }
}

impl SubAssign for MilliSatoshi {
    fn sub_assign(&mut self, rhs: Self) {
        *self = *self - rhs;
    }
}

impl std::iter::Sum for MilliSatoshi {
    fn sum<I: Iterator<Item = Self>>(iter: I) -> Self {
        iter.fold(MilliSatoshi::ZERO, |acc, amt| acc + amt)
    }
}

/// Identifier of the incoming HTLC a packet forwards. Only used for diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PacketId(pub u64);

impl fmt::Display for PacketId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "htlc#{}", self.0)
    }
}

/// An HTLC-forwarding request that could not be placed on the commitment.
///
/// `deadline` is the last instant the request is still useful downstream. Requests without
/// one are treated as immediate and keyed by their admission time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForwardingPacket {
    pub id: PacketId,
    pub amount: MilliSatoshi,
    pub deadline: Option<Instant>,
}

impl ForwardingPacket {
    /// Packet with no deadline.
    pub fn new(id: u64, amount: MilliSatoshi) -> Self {
        ForwardingPacket {
            id: PacketId(id),
            amount,
            deadline: None,
        }
    }

    /// Packet with an explicit absolute deadline.
    pub fn with_deadline(id: u64, amount: MilliSatoshi, deadline: Instant) -> Self {
        ForwardingPacket {
            id: PacketId(id),
            amount,
            deadline: Some(deadline),
        }
    }

    /// Packet whose deadline derives from when the underlying HTLC was crafted plus the
    /// timeout it was granted.
    pub fn crafted(id: u64, amount: MilliSatoshi, crafted_at: Instant, timeout: Duration) -> Self {
        ForwardingPacket {
            id: PacketId(id),
            amount,
            deadline: crafted_at.checked_add(timeout),
        }
    }
}

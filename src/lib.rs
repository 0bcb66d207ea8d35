pub mod config;
pub mod error;
pub mod logging;
pub mod metrics;
pub mod packet;
pub mod priority;
pub mod queue;

// Re-export for easier testing
pub use config::{DebugLog, OverflowQueueConfig};
pub use error::{Admission, DropReason, QueueError};
pub use metrics::{QueueSnapshot, StatsSampler};
pub use packet::{ForwardingPacket, MilliSatoshi, PacketId};
pub use priority::SchedulingMode;
pub use queue::OverflowQueue;

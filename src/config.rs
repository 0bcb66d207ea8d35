//! Construction-time configuration for an overflow queue.
//!
//! Every knob is fixed once the queue is built; nothing here is read from process-wide state.

use crate::error::QueueError;
use crate::priority::SchedulingMode;
use std::path::PathBuf;
use std::time::Duration;

/// Entry capacity is this multiple of the link's maximum in-flight HTLC count.
pub const QUEUE_LENGTH_SCALE: usize = 8;

/// Interval at which `stop` re-signals the coordinator until it reports completion.
pub const DEFAULT_SHUTDOWN_POLL: Duration = Duration::from_millis(100);

/// Destination for per-operation debug events.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum DebugLog {
    #[default]
    Off,
    /// Append debug events to this file.
    Path(PathBuf),
}

impl DebugLog {
    pub fn is_enabled(&self) -> bool {
        !matches!(self, DebugLog::Off)
    }
}

/// Overflow queue parameters.
#[derive(Debug, Clone)]
pub struct OverflowQueueConfig {
    /// Bound of the free-slot token channel. Should not exceed the commitment's slot budget.
    pub free_slots: usize,
    /// Maximum number of resident entries. Should exceed `free_slots`.
    pub capacity: usize,
    pub scheduling_mode: SchedulingMode,
    pub debug_log: DebugLog,
    /// Run tag attached to log spans and snapshots for telemetry correlation.
    pub experiment: Option<String>,
    /// Link identifier used in diagnostics.
    pub label: String,
    pub shutdown_poll: Duration,
}

impl OverflowQueueConfig {
    pub fn new(free_slots: usize, capacity: usize) -> Self {
        Self {
            free_slots,
            capacity,
            scheduling_mode: SchedulingMode::default(),
            debug_log: DebugLog::default(),
            experiment: None,
            label: String::from("link"),
            shutdown_poll: DEFAULT_SHUTDOWN_POLL,
        }
    }

    /// Link start-up defaults: one token per commitment slot and a buffer
    /// [`QUEUE_LENGTH_SCALE`] times deeper.
    ///
    /// # Arguments
    /// * `max_htlcs` - Maximum number of HTLCs the commitment may carry at once
    ///
    /// # Example
    /// ```
    /// use htlc_overflow_queue::config::{OverflowQueueConfig, QUEUE_LENGTH_SCALE};
    ///
    /// let config = OverflowQueueConfig::for_link(30);
    /// assert_eq!(config.free_slots, 30);
    /// assert_eq!(config.capacity, 30 * QUEUE_LENGTH_SCALE);
    /// ```
    pub fn for_link(max_htlcs: usize) -> Self {
        Self::new(max_htlcs, max_htlcs.saturating_mul(QUEUE_LENGTH_SCALE))
    }

    pub fn with_scheduling_mode(mut self, mode: SchedulingMode) -> Self {
        self.scheduling_mode = mode;
        self
    }

    pub fn with_debug_log(mut self, debug_log: DebugLog) -> Self {
        self.debug_log = debug_log;
        self
    }

    pub fn with_experiment(mut self, experiment: impl Into<String>) -> Self {
        self.experiment = Some(experiment.into());
        self
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = label.into();
        self
    }

    pub fn with_shutdown_poll(mut self, interval: Duration) -> Self {
        self.shutdown_poll = interval;
        self
    }

    /// Reject configurations the queue cannot run with.
    pub fn validate(&self) -> Result<(), QueueError> {
        if self.free_slots == 0 {
            return Err(QueueError::InvalidConfig(
                "free slot capacity must be positive".into(),
            ));
        }
        if self.capacity == 0 {
            return Err(QueueError::InvalidConfig(
                "entry capacity must be positive".into(),
            ));
        }
        if self.shutdown_poll.is_zero() {
            return Err(QueueError::InvalidConfig(
                "shutdown poll interval must be non-zero".into(),
            ));
        }
        Ok(())
    }
}

impl Default for OverflowQueueConfig {
    fn default() -> Self {
        // 483 is the protocol maximum of HTLCs per commitment side.
        Self::for_link(483)
    }
}

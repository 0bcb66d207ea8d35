//! Queue statistics for the congestion-control policy.
//!
//! [`QueueSnapshot`] bundles the four lock-free accessors of an [`OverflowQueue`] into one
//! serializable value. [`StatsSampler`] polls a queue on its own thread at a fixed cadence and
//! hands snapshots to whoever prices the link, so the policy never touches the queue's lock.

use crate::error::QueueError;
use crate::packet::MilliSatoshi;
use crate::queue::OverflowQueue;
use crossbeam_channel::{bounded, select, Receiver, Sender};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::debug;

/// Default sampling cadence.
pub const DEFAULT_STATS_INTERVAL: Duration = Duration::from_millis(1000);

/// Snapshots buffered before the sampler starts dropping them.
const SNAPSHOT_BUFFER: usize = 64;

/// Point-in-time view of an overflow queue.
///
/// Fields are read one at a time without a common lock, so a snapshot taken during a
/// concurrent admission may mix values from just before and just after it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueSnapshot {
    pub link: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub experiment: Option<String>,
    pub length: usize,
    pub capacity: usize,
    pub free_slot_capacity: usize,
    pub total_amount: MilliSatoshi,
    /// `None` while the queue is empty.
    pub min_amount: Option<MilliSatoshi>,
    /// Microseconds from the sample instant to the head deadline; negative once it has passed.
    pub closest_deadline_us: i64,
    #[serde(skip, default = "Instant::now")]
    pub closest_deadline: Instant,
    pub stopped: bool,
}

impl QueueSnapshot {
    pub(crate) fn capture(
        queue: &OverflowQueue,
        link: String,
        experiment: Option<String>,
    ) -> Self {
        let now = Instant::now();
        let closest_deadline = queue.closest_deadline();
        Self {
            link,
            experiment,
            length: queue.len(),
            capacity: queue.capacity(),
            free_slot_capacity: queue.free_slot_capacity(),
            total_amount: queue.total_amount(),
            min_amount: queue.min_amount(),
            closest_deadline_us: signed_micros(now, closest_deadline),
            closest_deadline,
            stopped: queue.is_stopped(),
        }
    }

    /// Share of the entry capacity in use, in `[0, 1]`.
    pub fn occupancy(&self) -> f64 {
        if self.capacity == 0 {
            return 0.0;
        }
        self.length as f64 / self.capacity as f64
    }
}

fn signed_micros(from: Instant, to: Instant) -> i64 {
    if to >= from {
        i64::try_from((to - from).as_micros()).unwrap_or(i64::MAX)
    } else {
        -i64::try_from((from - to).as_micros()).unwrap_or(i64::MAX)
    }
}

/// Background poller that samples a queue at a fixed interval.
pub struct StatsSampler {
    snapshots: Receiver<QueueSnapshot>,
    stop_tx: Option<Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

impl StatsSampler {
    /// Start sampling `queue` every `interval`.
    ///
    /// The first snapshot is taken one interval after spawning. Snapshots queue up in a bounded
    /// channel; once it is full, new samples are discarded until the reader catches up.
    ///
    /// # Arguments
    /// * `queue` - Queue to observe (shared with the link that feeds it)
    /// * `interval` - Polling cadence chosen by the congestion-control policy
    ///
    /// # Returns
    /// A running sampler, or [`QueueError::Spawn`] if its thread could not be created
    pub fn spawn(queue: Arc<OverflowQueue>, interval: Duration) -> Result<Self, QueueError> {
        let (snapshots_tx, snapshots) = bounded(SNAPSHOT_BUFFER);
        let (stop_tx, stop_rx) = bounded::<()>(0);

        let handle = thread::Builder::new()
            .name("overflow-stats".to_string())
            .spawn(move || sample_loop(queue, interval, snapshots_tx, stop_rx))?;

        Ok(Self {
            snapshots,
            stop_tx: Some(stop_tx),
            handle: Some(handle),
        })
    }

    /// Receiving end of the snapshot stream.
    pub fn receiver(&self) -> Receiver<QueueSnapshot> {
        self.snapshots.clone()
    }

    /// Stop the poller and wait for its thread.
    pub fn stop(&mut self) {
        drop(self.stop_tx.take());
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for StatsSampler {
    fn drop(&mut self) {
        self.stop();
    }
}

fn sample_loop(
    queue: Arc<OverflowQueue>,
    interval: Duration,
    snapshots: Sender<QueueSnapshot>,
    stop: Receiver<()>,
) {
    loop {
        select! {
            recv(stop) -> _ => break,
            default(interval) => {
                // A slow reader loses samples rather than stalling the poller.
                if snapshots.try_send(queue.snapshot()).is_err() {
                    debug!("stats snapshot dropped");
                }
            }
        }
    }
}

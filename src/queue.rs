//! Overflow queue for HTLC forwards that do not fit on the commitment.
//!
//! Producers call [`OverflowQueue::admit`] to buffer a packet and [`OverflowQueue::signal_free_slot`]
//! whenever a commitment slot frees up. A single coordinator thread drains the buffer:
//!
//! 1. Idle: wait on the condition variable while the index is empty
//! 2. Armed: wait for a free-slot token
//! 3. Popping: remove the earliest-deadline entry under the lock
//! 4. Delivering: rendezvous send on the outgoing channel
//! 5. Accounting: update counters and the low-water mark once delivery is confirmed
//!
//! Every wait races against the quit signal. `stop` closes that signal and keeps poking the
//! condition variable until the coordinator reports it has exited.
//!
//! The index and its counters share one mutex. The counters are mirrored in atomics that are
//! only written inside that critical section, so the statistics accessors never take the lock.

use crate::config::OverflowQueueConfig;
use crate::error::{Admission, DropReason, QueueError};
use crate::metrics::QueueSnapshot;
use crate::packet::{ForwardingPacket, MilliSatoshi, PacketId};
use crate::priority::{PriorityIndex, SchedulingMode};
use crossbeam_channel::{bounded, select, Receiver, Sender, TryRecvError};
use parking_lot::{Condvar, Mutex};
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Low-water mark value while no entry is resident.
const UNKNOWN_AMOUNT: u64 = u64::MAX;
/// Head-key value while no entry is resident.
const NO_HEAD: i64 = i64::MIN;

/// State shared between the queue handle and its coordinator.
struct Shared {
    index: Mutex<PriorityIndex>,
    /// Signalled after every successful admission.
    nonempty: Condvar,
    /// Pending packets, including one popped but not yet confirmed delivered.
    len: AtomicUsize,
    total_amount: AtomicU64,
    min_amount: AtomicU64,
    /// Head key as signed nanoseconds from `epoch`.
    head_offset: AtomicI64,
    epoch: Instant,
    /// Set by the coordinator on exit.
    done: AtomicBool,
    capacity: usize,
    mode: SchedulingMode,
    debug: bool,
    label: String,
    experiment: Option<String>,
}

impl Shared {
    fn publish_head(&self, index: &PriorityIndex) {
        let offset = match index.head_key() {
            Some(key) => encode_offset(self.epoch, key),
            None => NO_HEAD,
        };
        self.head_offset.store(offset, Ordering::Release);
    }

    fn publish_min(&self, min: Option<MilliSatoshi>) {
        let raw = min.map_or(UNKNOWN_AMOUNT, MilliSatoshi::as_u64);
        self.min_amount.store(raw, Ordering::Release);
    }
}

/// Bounded, deadline-ordered buffer between the switch and a channel link.
pub struct OverflowQueue {
    shared: Arc<Shared>,
    free_slots: usize,
    shutdown_poll: Duration,
    slots_tx: Sender<()>,
    slots_rx: Receiver<()>,
    /// Handed to the coordinator on start; dropping it disconnects consumers.
    outgoing_tx: Mutex<Option<Sender<ForwardingPacket>>>,
    outgoing_rx: Receiver<ForwardingPacket>,
    /// Nothing is ever sent; taking and dropping the sender is the shutdown signal.
    quit_tx: Mutex<Option<Sender<()>>>,
    quit_rx: Receiver<()>,
    started: AtomicBool,
}

impl OverflowQueue {
    /// Build a queue. The coordinator does not run until [`start`](Self::start).
    pub fn new(config: OverflowQueueConfig) -> Result<Self, QueueError> {
        config.validate()?;
        if config.capacity <= config.free_slots {
            warn!(
                link = %config.label,
                capacity = config.capacity,
                free_slots = config.free_slots,
                "entry capacity does not exceed the free slot bound; the overflow buffer adds little"
            );
        }

        let (slots_tx, slots_rx) = bounded(config.free_slots);
        let (outgoing_tx, outgoing_rx) = bounded(0);
        let (quit_tx, quit_rx) = bounded(0);

        let shared = Shared {
            index: Mutex::new(PriorityIndex::with_capacity(config.capacity)),
            nonempty: Condvar::new(),
            len: AtomicUsize::new(0),
            total_amount: AtomicU64::new(0),
            min_amount: AtomicU64::new(UNKNOWN_AMOUNT),
            head_offset: AtomicI64::new(NO_HEAD),
            epoch: Instant::now(),
            done: AtomicBool::new(false),
            capacity: config.capacity,
            mode: config.scheduling_mode,
            debug: config.debug_log.is_enabled(),
            label: config.label,
            experiment: config.experiment,
        };

        Ok(Self {
            shared: Arc::new(shared),
            free_slots: config.free_slots,
            shutdown_poll: config.shutdown_poll,
            slots_tx,
            slots_rx,
            outgoing_tx: Mutex::new(Some(outgoing_tx)),
            outgoing_rx,
            quit_tx: Mutex::new(Some(quit_tx)),
            quit_rx,
            started: AtomicBool::new(false),
        })
    }

    /// Launch the coordinator thread.
    pub fn start(&self) -> Result<(), QueueError> {
        let quit = self.quit_tx.lock();
        if quit.is_none() {
            return Err(QueueError::Stopped);
        }
        if self.started.swap(true, Ordering::AcqRel) {
            return Err(QueueError::AlreadyStarted);
        }
        let Some(outgoing) = self.outgoing_tx.lock().take() else {
            return Err(QueueError::Stopped);
        };

        let coordinator = Coordinator {
            shared: self.shared.clone(),
            slots: self.slots_rx.clone(),
            outgoing,
            quit: self.quit_rx.clone(),
        };
        let spawned = thread::Builder::new()
            .name(format!("overflow-{}", self.shared.label))
            .spawn(move || coordinator.run());
        if let Err(err) = spawned {
            self.started.store(false, Ordering::Release);
            return Err(err.into());
        }
        drop(quit);

        info!(
            link = %self.shared.label,
            capacity = self.shared.capacity,
            free_slots = self.free_slots,
            mode = %self.shared.mode,
            "overflow queue started"
        );
        Ok(())
    }

    /// Shut the coordinator down and wait until it has exited.
    ///
    /// Packets still resident are abandoned. Calling this more than once is harmless.
    pub fn stop(&self) {
        let closed = self.quit_tx.lock().take();
        let first = closed.is_some();
        drop(closed);
        // Never started: release consumers blocked on the delivery stream.
        drop(self.outgoing_tx.lock().take());

        if self.started.load(Ordering::Acquire) {
            while !self.shared.done.load(Ordering::Acquire) {
                self.shared.nonempty.notify_all();
                thread::sleep(self.shutdown_poll);
            }
        }

        if first {
            info!(
                link = %self.shared.label,
                abandoned = self.len(),
                "overflow queue stopped"
            );
        }
    }

    /// Buffer `packet` until a slot frees up.
    ///
    /// A full or stopped queue drops the packet; it is never retried here.
    pub fn admit(&self, packet: ForwardingPacket) -> Admission {
        let id = packet.id;
        let amount = packet.amount;

        let mut index = self.shared.index.lock();
        if self.is_stopped() {
            drop(index);
            warn!(link = %self.shared.label, packet = %id, "packet dropped as overflow queue is stopped");
            return dropped(id, DropReason::Stopped);
        }
        if self.shared.len.load(Ordering::Acquire) >= self.shared.capacity {
            drop(index);
            warn!(link = %self.shared.label, packet = %id, "packet dropped as overflow queue is full");
            return dropped(id, DropReason::CapacityExceeded);
        }

        let key = self.shared.mode.key_for(&packet, Instant::now());
        index.push(key, packet);
        self.shared
            .total_amount
            .fetch_add(amount.as_u64(), Ordering::AcqRel);
        let min = self.shared.min_amount.load(Ordering::Acquire);
        if min == UNKNOWN_AMOUNT || amount.as_u64() < min {
            self.shared.publish_min(Some(amount));
        }
        self.shared.publish_head(&index);
        self.shared.len.fetch_add(1, Ordering::AcqRel);
        drop(index);

        if self.shared.debug {
            debug!(link = %self.shared.label, packet = %id, %amount, "packet admitted");
        }
        self.shared.nonempty.notify_one();
        Admission::Queued
    }

    /// Report one freed commitment slot.
    ///
    /// Does nothing while the queue is empty, so slots never bank up ahead of work. Blocks while
    /// the token channel is full and gives up once the queue is stopped.
    pub fn signal_free_slot(&self) {
        if self.shared.len.load(Ordering::Acquire) == 0 {
            return;
        }

        select! {
            send(self.slots_tx, ()) -> _ => {
                if self.shared.debug {
                    debug!(link = %self.shared.label, "free slot indicated");
                }
            }
            recv(self.quit_rx) -> _ => {
                if self.shared.debug {
                    debug!(link = %self.shared.label, "free slot signal abandoned on shutdown");
                }
            }
        }
    }

    /// Stream of packets released by the coordinator.
    ///
    /// Sends are unbuffered: the coordinator stalls until a consumer receives. The stream
    /// disconnects once the coordinator has exited.
    pub fn outgoing(&self) -> Receiver<ForwardingPacket> {
        self.outgoing_rx.clone()
    }

    /// Number of pending packets.
    pub fn len(&self) -> usize {
        self.shared.len.load(Ordering::Acquire)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Sum of pending amounts.
    pub fn total_amount(&self) -> MilliSatoshi {
        MilliSatoshi(self.shared.total_amount.load(Ordering::Acquire))
    }

    /// Smallest pending amount, `None` while nothing is queued.
    pub fn min_amount(&self) -> Option<MilliSatoshi> {
        match self.shared.min_amount.load(Ordering::Acquire) {
            UNKNOWN_AMOUNT => None,
            raw => Some(MilliSatoshi(raw)),
        }
    }

    /// Priority key of the head entry, or now when the index is empty.
    pub fn closest_deadline(&self) -> Instant {
        match self.shared.head_offset.load(Ordering::Acquire) {
            NO_HEAD => Instant::now(),
            offset => decode_offset(self.shared.epoch, offset),
        }
    }

    pub fn capacity(&self) -> usize {
        self.shared.capacity
    }

    pub fn free_slot_capacity(&self) -> usize {
        self.free_slots
    }

    pub fn scheduling_mode(&self) -> SchedulingMode {
        self.shared.mode
    }

    /// True once [`stop`](Self::stop) has been called.
    pub fn is_stopped(&self) -> bool {
        is_closed(&self.quit_rx)
    }

    /// Current statistics in one value.
    pub fn snapshot(&self) -> QueueSnapshot {
        QueueSnapshot::capture(
            self,
            self.shared.label.clone(),
            self.shared.experiment.clone(),
        )
    }
}

impl Drop for OverflowQueue {
    fn drop(&mut self) {
        self.stop();
    }
}

fn dropped(id: PacketId, reason: DropReason) -> Admission {
    Admission::Dropped { id, reason }
}

fn is_closed(quit: &Receiver<()>) -> bool {
    matches!(quit.try_recv(), Err(TryRecvError::Disconnected))
}

fn encode_offset(epoch: Instant, at: Instant) -> i64 {
    if at >= epoch {
        i64::try_from((at - epoch).as_nanos()).unwrap_or(i64::MAX)
    } else {
        // Stay clear of the NO_HEAD sentinel.
        let nanos = i64::try_from((epoch - at).as_nanos()).unwrap_or(i64::MAX);
        -nanos
    }
}

fn decode_offset(epoch: Instant, offset: i64) -> Instant {
    let magnitude = Duration::from_nanos(offset.unsigned_abs());
    if offset >= 0 {
        epoch + magnitude
    } else {
        epoch.checked_sub(magnitude).unwrap_or(epoch)
    }
}

/// Marks the coordinator finished however its loop exits.
struct ExitGuard<'a>(&'a AtomicBool);

impl Drop for ExitGuard<'_> {
    fn drop(&mut self) {
        self.0.store(true, Ordering::Release);
    }
}

/// The draining side. Sole consumer of pops from the index.
struct Coordinator {
    shared: Arc<Shared>,
    slots: Receiver<()>,
    outgoing: Sender<ForwardingPacket>,
    quit: Receiver<()>,
}

impl Coordinator {
    fn run(self) {
        let shared = self.shared.clone();
        let _exit = ExitGuard(&shared.done);
        {
            let span = tracing::info_span!(
                "overflow_coordinator",
                link = %shared.label,
                experiment = shared.experiment.as_deref().unwrap_or("")
            );
            let _entered = span.enter();

            while self.drain_one() {}

            if shared.debug {
                debug!("coordinator exiting");
            }
        }
        // Disconnect the delivery stream before reporting completion.
        drop(self);
    }

    /// One pass through the state machine. Returns false once shutdown is observed.
    fn drain_one(&self) -> bool {
        // Idle
        {
            let mut index = self.shared.index.lock();
            loop {
                if is_closed(&self.quit) {
                    return false;
                }
                if !index.is_empty() {
                    break;
                }
                self.shared.nonempty.wait(&mut index);
            }
        }

        // Armed
        select! {
            recv(self.slots) -> _ => {}
            recv(self.quit) -> _ => return false,
        }

        // Popping. A later admission may have taken the head, so pop under the lock.
        let entry = {
            let mut index = self.shared.index.lock();
            let entry = index.pop();
            self.shared.publish_head(&index);
            entry
        };
        let Some(entry) = entry else {
            return true;
        };
        let id = entry.packet.id;
        let amount = entry.packet.amount;
        if self.shared.debug {
            debug!(packet = %id, %amount, "popped head entry");
        }

        // Delivering
        select! {
            send(self.outgoing, entry.packet) -> sent => {
                if sent.is_err() {
                    warn!(packet = %id, "delivery stream closed; packet abandoned");
                    return false;
                }
            }
            recv(self.quit) -> _ => {
                warn!(packet = %id, "packet abandoned mid-delivery on shutdown");
                return false;
            }
        }

        // Accounting
        {
            let index = self.shared.index.lock();
            self.shared
                .total_amount
                .fetch_sub(amount.as_u64(), Ordering::AcqRel);
            self.shared.publish_min(index.min_amount());
            // Length last: a reader that sees it change also sees the rest.
            self.shared.len.fetch_sub(1, Ordering::AcqRel);
        }
        if self.shared.debug {
            debug!(packet = %id, "packet delivered");
        }
        true
    }
}

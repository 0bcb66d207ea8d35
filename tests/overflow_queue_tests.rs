// Integration tests for the overflow queue: capacity, conservation, ordering, flow control and
// shutdown behaviour with a live coordinator thread.

use crossbeam_channel::{Receiver, RecvTimeoutError};
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::{Duration, Instant};

use htlc_overflow_queue::{
    Admission, DropReason, ForwardingPacket, MilliSatoshi, OverflowQueue, OverflowQueueConfig,
    SchedulingMode,
};

const POLL: Duration = Duration::from_millis(10);
const RECV_LIMIT: Duration = Duration::from_secs(2);
/// Generous ceiling for a stop call; a healthy stop takes a few polls.
const STOP_LIMIT: Duration = Duration::from_secs(1);

fn started_queue(config: OverflowQueueConfig) -> (Arc<OverflowQueue>, Receiver<ForwardingPacket>) {
    let queue = Arc::new(OverflowQueue::new(config.with_shutdown_poll(POLL)).unwrap());
    queue.start().unwrap();
    let rx = queue.outgoing();
    (queue, rx)
}

fn wait_until(mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + RECV_LIMIT;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(1));
    }
    condition()
}

fn timed_stop(queue: &OverflowQueue) -> Duration {
    let start = Instant::now();
    queue.stop();
    start.elapsed()
}

#[test]
fn scenario_delivers_in_deadline_order_with_statistics() {
    let (queue, rx) = started_queue(OverflowQueueConfig::new(1, 3));
    let t = Instant::now() + Duration::from_secs(60);

    let admitted = [
        ForwardingPacket::with_deadline(1, MilliSatoshi(10), t + Duration::from_secs(3)),
        ForwardingPacket::with_deadline(2, MilliSatoshi(20), t + Duration::from_secs(1)),
        ForwardingPacket::with_deadline(3, MilliSatoshi(30), t + Duration::from_secs(2)),
    ];
    for packet in admitted {
        assert!(queue.admit(packet).is_queued());
    }
    assert_eq!(queue.len(), 3);
    assert_eq!(queue.total_amount(), MilliSatoshi(60));
    assert_eq!(queue.min_amount(), Some(MilliSatoshi(10)));
    assert_eq!(queue.closest_deadline(), t + Duration::from_secs(1));

    let expected = [
        (20, 2, 40, Some(MilliSatoshi(10))),
        (30, 1, 10, Some(MilliSatoshi(10))),
        (10, 0, 0, None),
    ];
    for (amount, len, total, min) in expected {
        queue.signal_free_slot();
        let packet = rx.recv_timeout(RECV_LIMIT).expect("expected a delivery");
        assert_eq!(packet.amount, MilliSatoshi(amount));
        assert!(wait_until(|| queue.len() == len), "length never reached {len}");
        assert_eq!(queue.total_amount(), MilliSatoshi(total));
        assert_eq!(queue.min_amount(), min);
    }

    assert!(timed_stop(&queue) < STOP_LIMIT);
}

#[test]
fn capacity_bound_drops_excess_admissions() {
    let (queue, rx) = started_queue(OverflowQueueConfig::new(2, 3));

    let mut outcomes = Vec::new();
    for id in 0..5 {
        outcomes.push(queue.admit(ForwardingPacket::new(id, MilliSatoshi(100 + id))));
        assert!(queue.len() <= 3);
    }
    let dropped: Vec<u64> = outcomes
        .iter()
        .filter_map(|outcome| match outcome {
            Admission::Dropped { id, reason } => {
                assert_eq!(*reason, DropReason::CapacityExceeded);
                Some(id.0)
            }
            Admission::Queued => None,
        })
        .collect();
    assert_eq!(dropped, vec![3, 4]);

    let mut delivered = Vec::new();
    for _ in 0..3 {
        queue.signal_free_slot();
        delivered.push(rx.recv_timeout(RECV_LIMIT).unwrap().id.0);
    }
    delivered.sort_unstable();
    assert_eq!(delivered, vec![0, 1, 2]);

    assert!(wait_until(|| queue.is_empty()));
    assert_eq!(rx.recv_timeout(Duration::from_millis(50)), Err(RecvTimeoutError::Timeout));
    queue.stop();
}

#[test]
fn total_amount_conserves_undelivered_value() {
    let (queue, rx) = started_queue(OverflowQueueConfig::new(4, 16));
    let amounts = [120u64, 75, 310, 42, 99, 500];
    for (id, amount) in amounts.iter().enumerate() {
        assert!(queue.admit(ForwardingPacket::new(id as u64, MilliSatoshi(*amount))).is_queued());
    }
    let mut outstanding: u64 = amounts.iter().sum();
    assert_eq!(queue.total_amount(), MilliSatoshi(outstanding));

    for remaining in (3..amounts.len()).rev() {
        queue.signal_free_slot();
        let packet = rx.recv_timeout(RECV_LIMIT).unwrap();
        outstanding -= packet.amount.as_u64();
        assert!(wait_until(|| queue.len() == remaining));
        assert_eq!(queue.total_amount(), MilliSatoshi(outstanding));
    }
    queue.stop();
}

#[test]
fn later_admission_with_earlier_deadline_jumps_ahead() {
    let (queue, rx) = started_queue(OverflowQueueConfig::new(1, 8));
    let base = Instant::now() + Duration::from_secs(30);

    let _ = queue.admit(ForwardingPacket::with_deadline(1, MilliSatoshi(1), base + Duration::from_secs(5)));
    let _ = queue.admit(ForwardingPacket::with_deadline(2, MilliSatoshi(2), base + Duration::from_secs(9)));
    // Arrives last but expires first.
    let _ = queue.admit(ForwardingPacket::with_deadline(3, MilliSatoshi(3), base));

    let mut order = Vec::new();
    for _ in 0..3 {
        queue.signal_free_slot();
        order.push(rx.recv_timeout(RECV_LIMIT).unwrap().id.0);
        let _ = wait_until(|| queue.len() == 3 - order.len());
    }
    assert_eq!(order, vec![3, 1, 2]);
    queue.stop();
}

#[test]
fn fifo_mode_ignores_deadlines() {
    let (queue, rx) = started_queue(
        OverflowQueueConfig::new(1, 8).with_scheduling_mode(SchedulingMode::Fifo),
    );
    let base = Instant::now() + Duration::from_secs(30);
    for (id, offset) in [(1u64, 9u64), (2, 5), (3, 1)] {
        let deadline = base + Duration::from_secs(offset);
        let _ = queue.admit(ForwardingPacket::with_deadline(id, MilliSatoshi(id), deadline));
        // Distinct admission instants so keys never tie.
        thread::sleep(Duration::from_millis(2));
    }

    let mut order = Vec::new();
    for _ in 0..3 {
        queue.signal_free_slot();
        order.push(rx.recv_timeout(RECV_LIMIT).unwrap().id.0);
        let _ = wait_until(|| queue.len() == 3 - order.len());
    }
    assert_eq!(order, vec![1, 2, 3]);
    queue.stop();
}

#[test]
fn free_slot_signals_on_empty_queue_are_not_banked() {
    let (queue, rx) = started_queue(OverflowQueueConfig::new(4, 8));
    for _ in 0..4 {
        queue.signal_free_slot();
    }

    assert!(queue.admit(ForwardingPacket::new(1, MilliSatoshi(5))).is_queued());
    assert_eq!(
        rx.recv_timeout(Duration::from_millis(150)),
        Err(RecvTimeoutError::Timeout),
        "delivered without a slot signalled after admission"
    );

    queue.signal_free_slot();
    assert_eq!(rx.recv_timeout(RECV_LIMIT).unwrap().id.0, 1);
    queue.stop();
}

#[test]
fn stop_while_idle_is_bounded() {
    let (queue, rx) = started_queue(OverflowQueueConfig::new(1, 4));
    thread::sleep(Duration::from_millis(20));

    assert!(timed_stop(&queue) < STOP_LIMIT);
    assert!(queue.is_stopped());
    assert_eq!(rx.recv_timeout(RECV_LIMIT), Err(RecvTimeoutError::Disconnected));
}

#[test]
fn stop_while_waiting_for_slot_is_bounded() {
    let (queue, rx) = started_queue(OverflowQueueConfig::new(1, 4));
    let _ = queue.admit(ForwardingPacket::new(1, MilliSatoshi(10)));
    thread::sleep(Duration::from_millis(20));

    assert!(timed_stop(&queue) < STOP_LIMIT);
    assert_eq!(rx.recv_timeout(RECV_LIMIT), Err(RecvTimeoutError::Disconnected));
    assert_eq!(queue.len(), 1);
}

#[test]
fn stop_while_delivering_is_bounded_and_keeps_accounting() {
    let (queue, rx) = started_queue(OverflowQueueConfig::new(1, 4));
    let _ = queue.admit(ForwardingPacket::new(1, MilliSatoshi(10)));
    let _ = queue.admit(ForwardingPacket::new(2, MilliSatoshi(20)));
    queue.signal_free_slot();
    // Nobody receives, so the coordinator parks on the rendezvous send.
    thread::sleep(Duration::from_millis(50));

    assert!(timed_stop(&queue) < STOP_LIMIT);
    // The popped packet never reached a consumer, so it is still counted.
    assert_eq!(queue.len(), 2);
    assert_eq!(queue.total_amount(), MilliSatoshi(30));
    assert_eq!(rx.recv_timeout(RECV_LIMIT), Err(RecvTimeoutError::Disconnected));
}

#[test]
fn blocked_free_slot_signal_aborts_on_stop() {
    let queue = Arc::new(
        OverflowQueue::new(OverflowQueueConfig::new(1, 4).with_shutdown_poll(POLL)).unwrap(),
    );
    let _ = queue.admit(ForwardingPacket::new(1, MilliSatoshi(10)));
    // Coordinator not running: the first token fills the channel, the second blocks.
    queue.signal_free_slot();

    let signaller = {
        let queue = queue.clone();
        thread::spawn(move || queue.signal_free_slot())
    };
    thread::sleep(Duration::from_millis(20));
    assert!(!signaller.is_finished());

    assert!(timed_stop(&queue) < STOP_LIMIT);
    assert!(wait_until(|| signaller.is_finished()));
    signaller.join().unwrap();
}

#[test]
fn concurrent_admissions_fill_exact_capacity() {
    const N: usize = 16;
    let queue = Arc::new(OverflowQueue::new(OverflowQueueConfig::new(4, N)).unwrap());
    let barrier = Arc::new(Barrier::new(N));

    let handles: Vec<_> = (0..N)
        .map(|id| {
            let queue = queue.clone();
            let barrier = barrier.clone();
            thread::spawn(move || {
                barrier.wait();
                queue.admit(ForwardingPacket::new(id as u64, MilliSatoshi(1)))
            })
        })
        .collect();
    for handle in handles {
        assert!(handle.join().unwrap().is_queued());
    }
    assert_eq!(queue.len(), N);
    assert_eq!(queue.total_amount(), MilliSatoshi(N as u64));

    let extra = queue.admit(ForwardingPacket::new(N as u64, MilliSatoshi(1)));
    assert_eq!(extra.drop_reason(), Some(DropReason::CapacityExceeded));
    assert_eq!(queue.len(), N);
}

#[test]
fn concurrent_overfill_drops_exactly_one() {
    const N: usize = 12;
    let queue = Arc::new(OverflowQueue::new(OverflowQueueConfig::new(4, N)).unwrap());
    let barrier = Arc::new(Barrier::new(N + 1));

    let handles: Vec<_> = (0..=N)
        .map(|id| {
            let queue = queue.clone();
            let barrier = barrier.clone();
            thread::spawn(move || {
                barrier.wait();
                queue.admit(ForwardingPacket::new(id as u64, MilliSatoshi(1)))
            })
        })
        .collect();
    let dropped = handles
        .into_iter()
        .map(|handle| handle.join().unwrap())
        .filter(|outcome| !outcome.is_queued())
        .count();
    assert_eq!(dropped, 1);
    assert_eq!(queue.len(), N);
}

#[test]
fn dropping_the_queue_shuts_the_coordinator_down() {
    let (queue, rx) = started_queue(OverflowQueueConfig::new(1, 4));
    let queue = Arc::try_unwrap(queue).ok().expect("sole owner");
    drop(queue);
    assert_eq!(rx.recv_timeout(RECV_LIMIT), Err(RecvTimeoutError::Disconnected));
}

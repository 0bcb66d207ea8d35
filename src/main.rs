// Overflow queue simulation binary.
//
// Drives one link's overflow queue against a simulated commitment with a fixed number of HTLC
// slots. Packets arrive faster than the commitment settles them, so the queue fills, drains in
// deadline order as slots free up, and drops once it is full. Statistics snapshots are printed
// as JSON lines while the run is in progress and a summary is printed at the end.

use htlc_overflow_queue::logging::{self, LogConfig};
use htlc_overflow_queue::metrics::DEFAULT_STATS_INTERVAL;
use htlc_overflow_queue::{
    DebugLog, ForwardingPacket, MilliSatoshi, OverflowQueue, OverflowQueueConfig,
    SchedulingMode, StatsSampler,
};
use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

/// Command-line options parsed from program arguments.
struct CliOptions {
    scheduling: SchedulingMode,
    debug_log: DebugLog,
    experiment: Option<String>,
    /// Commitment slot budget of the simulated link.
    max_htlcs: usize,
    packets: u64,
    /// Gap between packet arrivals.
    arrival: Duration,
    /// Time an HTLC occupies a commitment slot.
    settle: Duration,
    stats_interval: Duration,
}

impl Default for CliOptions {
    fn default() -> Self {
        Self {
            scheduling: SchedulingMode::Deadline,
            debug_log: DebugLog::Off,
            experiment: None,
            max_htlcs: 4,
            packets: 200,
            arrival: Duration::from_millis(5),
            settle: Duration::from_millis(40),
            stats_interval: DEFAULT_STATS_INTERVAL,
        }
    }
}

fn apply_option(options: &mut CliOptions, key: &str, value: &str) {
    match key {
        "--scheduling" => {
            if let Ok(mode) = value.parse() {
                options.scheduling = mode;
            }
        }
        "--debug-log" => {
            options.debug_log = match value {
                "" | "off" => DebugLog::Off,
                path => DebugLog::Path(PathBuf::from(path)),
            };
        }
        "--exp-name" => options.experiment = Some(value.to_string()),
        "--max-htlcs" => {
            if let Ok(n) = value.parse() {
                options.max_htlcs = n;
            }
        }
        "--packets" => {
            if let Ok(n) = value.parse() {
                options.packets = n;
            }
        }
        "--arrival-ms" => {
            if let Ok(ms) = value.parse() {
                options.arrival = Duration::from_millis(ms);
            }
        }
        "--settle-ms" => {
            if let Ok(ms) = value.parse() {
                options.settle = Duration::from_millis(ms);
            }
        }
        "--stats-interval-ms" => {
            if let Ok(ms) = value.parse() {
                options.stats_interval = Duration::from_millis(ms);
            }
        }
        _ => {}
    }
}

/// Parse `--key=value` and `--key value` arguments. Unknown keys and bad values are ignored.
fn parse_cli_options() -> CliOptions {
    let mut options = CliOptions::default();
    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        if let Some((key, value)) = arg.split_once('=') {
            apply_option(&mut options, key, value);
        } else if let Some(value) = args.next() {
            apply_option(&mut options, &arg, &value);
        }
    }
    options
}

/// Spread timeouts over 0.2s..2s so deadlines interleave with arrival order.
fn timeout_for(seq: u64) -> Duration {
    Duration::from_millis(200 + (seq * 7919) % 1800)
}

/// Give one slot back: to the queue if it has work waiting, otherwise to the commitment.
fn release_slot(queue: &OverflowQueue, free: &AtomicUsize) {
    if queue.is_empty() {
        free.fetch_add(1, Ordering::AcqRel);
    } else {
        queue.signal_free_slot();
    }
}

/// Claim a free commitment slot if one is available.
fn claim_slot(free: &AtomicUsize) -> bool {
    free.fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
        .is_ok()
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let options = parse_cli_options();
    logging::init(&LogConfig::debug_to(options.debug_log.clone()))?;

    let mut config = OverflowQueueConfig::for_link(options.max_htlcs)
        .with_scheduling_mode(options.scheduling)
        .with_debug_log(options.debug_log.clone())
        .with_label("sim-link");
    if let Some(experiment) = &options.experiment {
        config = config.with_experiment(experiment.clone());
    }

    let queue = Arc::new(OverflowQueue::new(config)?);
    queue.start()?;
    let mut sampler = StatsSampler::spawn(queue.clone(), options.stats_interval)?;

    let free = Arc::new(AtomicUsize::new(0));
    let delivered = Arc::new(AtomicU64::new(0));
    let missed = Arc::new(AtomicU64::new(0));
    let mut dropped = 0u64;

    // Commitment: hold each delivered HTLC for the settle time, then release its slot.
    let commitment = {
        let queue = queue.clone();
        let free = free.clone();
        let delivered = delivered.clone();
        let missed = missed.clone();
        let outgoing = queue.outgoing();
        let settle = options.settle;
        let max_htlcs = options.max_htlcs;
        thread::Builder::new()
            .name("sim-commitment".to_string())
            .spawn(move || {
                let mut in_flight: VecDeque<(Instant, ForwardingPacket)> = VecDeque::new();
                // The commitment starts full; its slots come back as these settle.
                let start = Instant::now();
                for slot in 0..max_htlcs {
                    let filler = ForwardingPacket::new(u64::MAX - slot as u64, MilliSatoshi(0));
                    in_flight.push_back((start + settle, filler));
                }
                loop {
                    let now = Instant::now();
                    while in_flight.front().is_some_and(|(settles, _)| *settles <= now) {
                        if let Some((_, packet)) = in_flight.pop_front() {
                            if packet.deadline.is_some_and(|deadline| deadline < now) {
                                missed.fetch_add(1, Ordering::Relaxed);
                            }
                        }
                        release_slot(&queue, &free);
                    }
                    match outgoing.recv_timeout(Duration::from_millis(1)) {
                        Ok(packet) => {
                            delivered.fetch_add(1, Ordering::Relaxed);
                            in_flight.push_back((Instant::now() + settle, packet));
                        }
                        Err(crossbeam_channel::RecvTimeoutError::Timeout) => {}
                        Err(crossbeam_channel::RecvTimeoutError::Disconnected) => break,
                    }
                }
            })?
    };

    let printer = {
        let snapshots = sampler.receiver();
        thread::Builder::new()
            .name("sim-stats".to_string())
            .spawn(move || {
                for snapshot in snapshots.iter() {
                    match serde_json::to_string(&snapshot) {
                        Ok(line) => println!("{line}"),
                        Err(e) => eprintln!("failed to encode snapshot: {e}"),
                    }
                }
            })?
    };

    // Switch: every packet overflows into the queue; a free slot lets the queue drain one.
    let started = Instant::now();
    for seq in 0..options.packets {
        let amount = MilliSatoshi(1_000 + (seq % 17) * 250);
        let packet = ForwardingPacket::crafted(seq, amount, Instant::now(), timeout_for(seq));
        if !queue.admit(packet).is_queued() {
            dropped += 1;
        } else if claim_slot(&free) {
            queue.signal_free_slot();
        }
        thread::sleep(options.arrival);
    }

    // Let the backlog drain, bounded by the worst case of one settle per queued packet.
    let drain_limit = options.settle * (queue.capacity() as u32 + 1);
    let drain_start = Instant::now();
    while !queue.is_empty() && drain_start.elapsed() < drain_limit {
        thread::sleep(options.settle / 4);
    }

    queue.stop();
    sampler.stop();
    let _ = commitment.join();
    drop(sampler);
    let _ = printer.join();

    eprintln!("=== Overflow queue simulation ===");
    eprintln!("scheduling:     {}", options.scheduling);
    if let Some(experiment) = &options.experiment {
        eprintln!("experiment:     {experiment}");
    }
    eprintln!("elapsed:        {:?}", started.elapsed());
    eprintln!("admitted:       {}", options.packets - dropped);
    eprintln!("dropped (full): {dropped}");
    eprintln!("delivered:      {}", delivered.load(Ordering::Relaxed));
    eprintln!("deadline miss:  {}", missed.load(Ordering::Relaxed));
    eprintln!("abandoned:      {}", queue.len());
    Ok(())
}

//! Per-queue and global throughput counters, plus a background reporter thread.
//!
//! All counters are relaxed `u64` atomics, the same pattern the corpus's own flood benchmarks use
//! for hot-path bookkeeping they only need to read back for an end-of-run (here: periodic)
//! summary.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use log::info;

#[derive(Default)]
pub struct QueueStats {
    pub packets_received: AtomicU64,
    pub bytes_received: AtomicU64,
    pub packets_sent: AtomicU64,
    pub bytes_sent: AtomicU64,
    pub packets_dropped_invalid: AtomicU64,
    pub backpressure_events: AtomicU64,
}

impl QueueStats {
    fn snapshot(&self) -> QueueStatsSnapshot {
        QueueStatsSnapshot {
            packets_received: self.packets_received.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            packets_sent: self.packets_sent.load(Ordering::Relaxed),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            packets_dropped_invalid: self.packets_dropped_invalid.load(Ordering::Relaxed),
            backpressure_events: self.backpressure_events.load(Ordering::Relaxed),
        }
    }
}

#[derive(Default, Clone, Copy)]
struct QueueStatsSnapshot {
    packets_received: u64,
    bytes_received: u64,
    packets_sent: u64,
    bytes_sent: u64,
    packets_dropped_invalid: u64,
    backpressure_events: u64,
}

impl QueueStatsSnapshot {
    fn add(&mut self, other: &Self) {
        self.packets_received += other.packets_received;
        self.bytes_received += other.bytes_received;
        self.packets_sent += other.packets_sent;
        self.bytes_sent += other.bytes_sent;
        self.packets_dropped_invalid += other.packets_dropped_invalid;
        self.backpressure_events += other.backpressure_events;
    }
}

/// All queues' counters, owned by `main` and shared with every worker and the reporter thread.
pub struct Stats {
    per_queue: Vec<Arc<QueueStats>>,
}

impl Stats {
    pub fn new(num_queues: usize) -> Self {
        Stats {
            per_queue: (0..num_queues).map(|_| Arc::new(QueueStats::default())).collect(),
        }
    }

    pub fn queue(&self, idx: usize) -> Arc<QueueStats> {
        self.per_queue[idx].clone()
    }

    /// Spawn the reporter thread. It logs a one-line throughput summary per queue and the global
    /// sum every `interval`, until `running` is cleared.
    pub fn spawn_reporter(
        self: Arc<Self>,
        running: Arc<std::sync::atomic::AtomicBool>,
        interval: Duration,
    ) -> std::thread::JoinHandle<()> {
        std::thread::spawn(move || {
            while running.load(Ordering::Relaxed) {
                std::thread::sleep(interval);
                if !running.load(Ordering::Relaxed) {
                    break;
                }

                let mut total = QueueStatsSnapshot::default();
                for (idx, q) in self.per_queue.iter().enumerate() {
                    let snap = q.snapshot();
                    info!(
                        "queue {idx}: rx {} pkt/{} B, tx {} pkt/{} B, dropped {}, backpressure {}",
                        snap.packets_received,
                        snap.bytes_received,
                        snap.packets_sent,
                        snap.bytes_sent,
                        snap.packets_dropped_invalid,
                        snap.backpressure_events,
                    );
                    total.add(&snap);
                }
                info!(
                    "total: rx {} pkt/{} B, tx {} pkt/{} B, dropped {}, backpressure {}",
                    total.packets_received,
                    total.bytes_received,
                    total.packets_sent,
                    total.bytes_sent,
                    total.packets_dropped_invalid,
                    total.backpressure_events,
                );
            }
        })
    }
}

//! Launch metrics for the execution engine.

use hdrhistogram::Histogram;
use parking_lot::RwLock;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Counters and latency histogram shared by the batch processors of one
/// multi-device processor.
#[derive(Debug)]
pub struct LaunchMetrics {
    launches: AtomicU64,
    launch_failures: AtomicU64,
    instances_dispatched: AtomicU64,
    batches_skipped: AtomicU64,

    // Time from the start of argument binding to the launch being enqueued.
    enqueue_histogram: RwLock<Histogram<u64>>,

    start_time: Instant,
}

impl LaunchMetrics {
    /// Zeroed counters, uptime starting now.
    pub fn new() -> Self {
        // Max of one hour in nanoseconds, 3 significant figures.
        let histogram = Histogram::new_with_max(3_600_000_000_000, 3)
            .expect("valid histogram bounds");

        Self {
            launches: AtomicU64::new(0),
            launch_failures: AtomicU64::new(0),
            instances_dispatched: AtomicU64::new(0),
            batches_skipped: AtomicU64::new(0),
            enqueue_histogram: RwLock::new(histogram),
            start_time: Instant::now(),
        }
    }

    /// Count one enqueued launch of `instances` work items.
    pub fn record_launch(&self, instances: usize, enqueue_time: Duration) {
        self.launches.fetch_add(1, Ordering::Relaxed);
        self.instances_dispatched
            .fetch_add(instances as u64, Ordering::Relaxed);

        if let Some(mut hist) = self.enqueue_histogram.try_write() {
            let _ = hist.record(enqueue_time.as_nanos() as u64);
        }
    }

    /// Count one launch that failed to enqueue.
    pub fn record_launch_failure(&self) {
        self.launch_failures.fetch_add(1, Ordering::Relaxed);
    }

    /// Count one empty batch that was not launched.
    pub fn record_skipped_batch(&self) {
        self.batches_skipped.fetch_add(1, Ordering::Relaxed);
    }

    /// Copy out the current counters and latency percentiles.
    pub fn snapshot(&self) -> LaunchSnapshot {
        let histogram = self.enqueue_histogram.read();

        LaunchSnapshot {
            uptime: self.start_time.elapsed(),
            launches: self.launches.load(Ordering::Relaxed),
            launch_failures: self.launch_failures.load(Ordering::Relaxed),
            instances_dispatched: self.instances_dispatched.load(Ordering::Relaxed),
            batches_skipped: self.batches_skipped.load(Ordering::Relaxed),
            avg_enqueue_ns: if histogram.len() > 0 {
                histogram.mean() as u64
            } else {
                0
            },
            p50_enqueue_ns: histogram.value_at_quantile(0.50),
            p99_enqueue_ns: histogram.value_at_quantile(0.99),
            max_enqueue_ns: histogram.max(),
        }
    }

    /// Zero every counter and the histogram.
    pub fn reset(&self) {
        self.launches.store(0, Ordering::Relaxed);
        self.launch_failures.store(0, Ordering::Relaxed);
        self.instances_dispatched.store(0, Ordering::Relaxed);
        self.batches_skipped.store(0, Ordering::Relaxed);

        if let Some(mut hist) = self.enqueue_histogram.try_write() {
            hist.reset();
        }
    }
}

impl Default for LaunchMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Point-in-time copy of [`LaunchMetrics`].
#[derive(Debug, Clone, Default)]
pub struct LaunchSnapshot {
    /// Time since the metrics were created or reset.
    pub uptime: Duration,
    /// Launches enqueued.
    pub launches: u64,
    /// Launches that failed to enqueue.
    pub launch_failures: u64,
    /// Work items across all launches.
    pub instances_dispatched: u64,
    /// Empty batches not launched.
    pub batches_skipped: u64,
    /// Mean enqueue latency.
    pub avg_enqueue_ns: u64,
    /// Median enqueue latency.
    pub p50_enqueue_ns: u64,
    /// 99th percentile enqueue latency.
    pub p99_enqueue_ns: u64,
    /// Worst enqueue latency.
    pub max_enqueue_ns: u64,
}

impl LaunchSnapshot {
    /// Launch rate over the uptime, 0 when no time has passed.
    pub fn launches_per_second(&self) -> f64 {
        let seconds = self.uptime.as_secs_f64();
        if seconds == 0.0 {
            return 0.0;
        }
        self.launches as f64 / seconds
    }
}

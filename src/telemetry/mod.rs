//! Launch telemetry.
//!
//! Counts launches and records enqueue latency per multi-device processor.
//! Compiled to no-op stubs without the `telemetry` feature.

#[cfg(feature = "telemetry")]
pub mod metrics;

#[cfg(feature = "telemetry")]
pub use metrics::{LaunchMetrics, LaunchSnapshot};

// Stub implementations when telemetry is disabled
#[cfg(not(feature = "telemetry"))]
#[allow(missing_docs)]
pub mod metrics {
    //! No-op launch metrics.

    use std::time::Duration;

    #[derive(Debug, Clone, Default)]
    pub struct LaunchMetrics;

    impl LaunchMetrics {
        pub fn new() -> Self {
            Self
        }
        pub fn record_launch(&self, _: usize, _: Duration) {}
        pub fn record_launch_failure(&self) {}
        pub fn record_skipped_batch(&self) {}
        pub fn snapshot(&self) -> LaunchSnapshot {
            LaunchSnapshot::default()
        }
        pub fn reset(&self) {}
    }

    #[derive(Debug, Clone, Default)]
    pub struct LaunchSnapshot {
        pub uptime: Duration,
        pub launches: u64,
        pub launch_failures: u64,
        pub instances_dispatched: u64,
        pub batches_skipped: u64,
        pub avg_enqueue_ns: u64,
        pub p50_enqueue_ns: u64,
        pub p99_enqueue_ns: u64,
        pub max_enqueue_ns: u64,
    }
}

#[cfg(not(feature = "telemetry"))]
pub use metrics::{LaunchMetrics, LaunchSnapshot};

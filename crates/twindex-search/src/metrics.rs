//! Observability metrics for the update pipeline.
//!
//! Metrics are exported via the `metrics` crate facade and are designed to
//! support alerting on write failures, dashboards for pipeline throughput,
//! and debugging of per-partition backlog.
//!
//! ## Metrics Exported
//!
//! | Metric | Type | Labels | Description |
//! |--------|------|--------|-------------|
//! | `twindex_search_updates_total` | Counter | `outcome` | Write-model outcomes (ok, conflict, failed, dropped) |
//! | `twindex_search_bulk_writes_total` | Counter | `result` | Bulk round-trips by result |
//! | `twindex_search_bulk_size` | Histogram | - | Write models per bulk |
//! | `twindex_search_persist_duration_seconds` | Histogram | - | Submit-to-acknowledge latency |
//! | `twindex_search_active_updaters` | Gauge | - | Currently live updater tasks |
//! | `twindex_search_stash_overflows_total` | Counter | - | Stash overflows forcing full refresh |
//! | `twindex_search_cache_loads_total` | Counter | `cache`, `result` | Cache loader invocations |
//!
//! ## Integration
//!
//! Metrics are exposed via the `metrics` crate facade. To export to
//! Prometheus:
//!
//! ```rust,ignore
//! use metrics_exporter_prometheus::PrometheusBuilder;
//!
//! PrometheusBuilder::new()
//!     .with_http_listener(([0, 0, 0, 0], 9090))
//!     .install()
//!     .expect("failed to install Prometheus recorder");
//! ```

use std::time::{Duration, Instant};

use metrics::{counter, gauge, histogram};

/// Metric names as constants for consistency.
pub mod names {
    /// Counter: Write-model outcomes.
    pub const UPDATES_TOTAL: &str = "twindex_search_updates_total";
    /// Counter: Bulk round-trips by result.
    pub const BULK_WRITES_TOTAL: &str = "twindex_search_bulk_writes_total";
    /// Histogram: Write models per bulk.
    pub const BULK_SIZE: &str = "twindex_search_bulk_size";
    /// Histogram: Submit-to-acknowledge latency in seconds.
    pub const PERSIST_DURATION_SECONDS: &str = "twindex_search_persist_duration_seconds";
    /// Gauge: Currently live updater tasks.
    pub const ACTIVE_UPDATERS: &str = "twindex_search_active_updaters";
    /// Counter: Stash overflows forcing a full refresh.
    pub const STASH_OVERFLOWS_TOTAL: &str = "twindex_search_stash_overflows_total";
    /// Counter: Cache loader invocations.
    pub const CACHE_LOADS_TOTAL: &str = "twindex_search_cache_loads_total";
}

/// Label keys used across metrics.
pub mod labels {
    /// Outcome of a write model (ok, conflict, failed, dropped).
    pub const OUTCOME: &str = "outcome";
    /// Result of a bulk round-trip (success, retried, failed).
    pub const RESULT: &str = "result";
    /// Cache name (thing, policy).
    pub const CACHE: &str = "cache";
}

/// High-level interface for recording pipeline metrics.
///
/// Cheap to clone and share across tasks.
#[derive(Debug, Clone, Default)]
pub struct SearchMetrics;

impl SearchMetrics {
    /// Creates a new metrics recorder.
    #[must_use]
    pub fn new() -> Self {
        Self
    }

    /// Records the outcome of one write model.
    pub fn record_update(&self, outcome: &'static str) {
        counter!(names::UPDATES_TOTAL, labels::OUTCOME => outcome).increment(1);
    }

    /// Records a bulk round-trip and its size.
    #[allow(clippy::cast_precision_loss)]
    pub fn record_bulk(&self, result: &'static str, size: usize) {
        counter!(names::BULK_WRITES_TOTAL, labels::RESULT => result).increment(1);
        histogram!(names::BULK_SIZE).record(size as f64);
    }

    /// Records submit-to-acknowledge latency.
    pub fn observe_persist_duration(&self, duration: Duration) {
        histogram!(names::PERSIST_DURATION_SECONDS).record(duration.as_secs_f64());
    }

    /// Sets the number of live updater tasks.
    #[allow(clippy::cast_precision_loss)]
    pub fn set_active_updaters(&self, count: usize) {
        gauge!(names::ACTIVE_UPDATERS).set(count as f64);
    }

    /// Records a stash overflow.
    pub fn record_stash_overflow(&self) {
        counter!(names::STASH_OVERFLOWS_TOTAL).increment(1);
    }

    /// Records a cache loader invocation.
    pub fn record_cache_load(&self, cache: &'static str, result: &'static str) {
        counter!(
            names::CACHE_LOADS_TOTAL,
            labels::CACHE => cache,
            labels::RESULT => result,
        )
        .increment(1);
    }
}

/// Records elapsed time into a histogram when dropped.
///
/// # Example
///
/// ```rust
/// use twindex_search::metrics::{TimingGuard, names};
///
/// {
///     let _guard = TimingGuard::new(names::PERSIST_DURATION_SECONDS);
///     // ... timed work
/// } // duration recorded here
/// ```
#[derive(Debug)]
pub struct TimingGuard {
    name: &'static str,
    started: Instant,
}

impl TimingGuard {
    /// Starts timing for the given histogram.
    #[must_use]
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            started: Instant::now(),
        }
    }
}

impl Drop for TimingGuard {
    fn drop(&mut self) {
        histogram!(self.name).record(self.started.elapsed().as_secs_f64());
    }
}

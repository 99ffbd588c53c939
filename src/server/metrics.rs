//! Server Metrics
//!
//! A small set of counters plus two latency distributions, one per
//! workload: queued engine statements finish in milliseconds unless the
//! queue is backed up, while a full table build reads an entire symbol
//! out of the GDX and runs seconds to minutes. The lifecycle logs a
//! snapshot periodically so long sessions leave a trace.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

const fn ms(value: u64) -> Duration {
    Duration::from_millis(value)
}

const fn secs(value: u64) -> Duration {
    Duration::from_secs(value)
}

/// Upper bounds for dispatched requests. Past a few seconds the serial
/// queue is the bottleneck, not the statement.
const REQUEST_BOUNDS: [Duration; 6] = [ms(2), ms(10), ms(50), ms(250), ms(1000), ms(4000)];

/// Upper bounds for background table builds.
const BUILD_BOUNDS: [Duration; 6] = [secs(1), secs(5), secs(15), secs(60), secs(300), secs(900)];

/// Latency distribution over a fixed set of upper bounds.
///
/// Each observation bumps every bound it fits under, so the per-bound
/// counts are cumulative by construction; the maximum is tracked
/// separately since a single slow outlier is usually the interesting
/// datum.
pub struct LatencyTrack {
    bounds: &'static [Duration],
    within: Vec<AtomicU64>,
    total: AtomicU64,
    sum_micros: AtomicU64,
    max_micros: AtomicU64,
}

impl LatencyTrack {
    fn new(bounds: &'static [Duration]) -> Self {
        Self {
            bounds,
            within: bounds.iter().map(|_| AtomicU64::new(0)).collect(),
            total: AtomicU64::new(0),
            sum_micros: AtomicU64::new(0),
            max_micros: AtomicU64::new(0),
        }
    }

    pub fn observe(&self, elapsed: Duration) {
        let micros = elapsed.as_micros().min(u64::MAX as u128) as u64;
        self.total.fetch_add(1, Ordering::Relaxed);
        self.sum_micros.fetch_add(micros, Ordering::Relaxed);
        self.max_micros.fetch_max(micros, Ordering::Relaxed);
        for (bound, slot) in self.bounds.iter().zip(&self.within) {
            if elapsed <= *bound {
                slot.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    pub fn count(&self) -> u64 {
        self.total.load(Ordering::Relaxed)
    }

    pub fn mean_ms(&self) -> f64 {
        let total = self.total.load(Ordering::Relaxed);
        if total == 0 {
            return 0.0;
        }
        self.sum_micros.load(Ordering::Relaxed) as f64 / total as f64 / 1000.0
    }

    pub fn max_ms(&self) -> f64 {
        self.max_micros.load(Ordering::Relaxed) as f64 / 1000.0
    }

    /// Fraction of observations at or under `bound`, when `bound` is
    /// one of the tracked upper bounds and anything has been observed.
    pub fn share_within(&self, bound: Duration) -> Option<f64> {
        let index = self.bounds.iter().position(|b| *b == bound)?;
        let total = self.total.load(Ordering::Relaxed);
        if total == 0 {
            return None;
        }
        Some(self.within[index].load(Ordering::Relaxed) as f64 / total as f64)
    }
}

/// Counters the server actually watches, updated through the recording
/// methods below rather than exposed atomics.
pub struct ServerMetrics {
    requests: AtomicU64,
    request_errors: AtomicU64,
    recoveries: AtomicU64,
    documents_open: AtomicU64,
    remote_fetches: AtomicU64,
    builds_started: AtomicU64,
    builds_completed: AtomicU64,
    builds_cancelled: AtomicU64,
    builds_failed: AtomicU64,
    connections: AtomicU64,
    connections_open: AtomicU64,
    pub request_latency: LatencyTrack,
    pub build_latency: LatencyTrack,
}

impl ServerMetrics {
    pub fn new() -> Self {
        Self {
            requests: AtomicU64::new(0),
            request_errors: AtomicU64::new(0),
            recoveries: AtomicU64::new(0),
            documents_open: AtomicU64::new(0),
            remote_fetches: AtomicU64::new(0),
            builds_started: AtomicU64::new(0),
            builds_completed: AtomicU64::new(0),
            builds_cancelled: AtomicU64::new(0),
            builds_failed: AtomicU64::new(0),
            connections: AtomicU64::new(0),
            connections_open: AtomicU64::new(0),
            request_latency: LatencyTrack::new(&REQUEST_BOUNDS),
            build_latency: LatencyTrack::new(&BUILD_BOUNDS),
        }
    }

    pub fn shared() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// One dispatched request finished, successfully or not.
    pub fn record_request(&self, elapsed: Duration, ok: bool) {
        self.requests.fetch_add(1, Ordering::Relaxed);
        if !ok {
            self.request_errors.fetch_add(1, Ordering::Relaxed);
        }
        self.request_latency.observe(elapsed);
    }

    pub fn record_recovery(&self) {
        self.recoveries.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_document_opened(&self) {
        self.documents_open.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_document_closed(&self) {
        self.documents_open.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn record_remote_fetch(&self) {
        self.remote_fetches.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_build_started(&self) {
        self.builds_started.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_build_completed(&self, elapsed: Duration) {
        self.builds_completed.fetch_add(1, Ordering::Relaxed);
        self.build_latency.observe(elapsed);
    }

    pub fn record_build_cancelled(&self) {
        self.builds_cancelled.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_build_failed(&self) {
        self.builds_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_connection_opened(&self) {
        self.connections.fetch_add(1, Ordering::Relaxed);
        self.connections_open.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_connection_closed(&self) {
        self.connections_open.fetch_sub(1, Ordering::Relaxed);
    }

    /// Point-in-time view of everything above. Resident memory is read
    /// from the system on each call rather than kept as a gauge.
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            requests: self.requests.load(Ordering::Relaxed),
            request_errors: self.request_errors.load(Ordering::Relaxed),
            request_mean_ms: self.request_latency.mean_ms(),
            request_max_ms: self.request_latency.max_ms(),
            recoveries: self.recoveries.load(Ordering::Relaxed),
            documents_open: self.documents_open.load(Ordering::Relaxed),
            remote_fetches: self.remote_fetches.load(Ordering::Relaxed),
            builds_started: self.builds_started.load(Ordering::Relaxed),
            builds_completed: self.builds_completed.load(Ordering::Relaxed),
            builds_cancelled: self.builds_cancelled.load(Ordering::Relaxed),
            builds_failed: self.builds_failed.load(Ordering::Relaxed),
            build_mean_ms: self.build_latency.mean_ms(),
            build_max_ms: self.build_latency.max_ms(),
            connections: self.connections.load(Ordering::Relaxed),
            connections_open: self.connections_open.load(Ordering::Relaxed),
            memory_rss_bytes: rss_bytes(),
        }
    }
}

impl Default for ServerMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Point-in-time snapshot, logged by the lifecycle.
#[derive(Debug, Clone)]
pub struct MetricsSnapshot {
    pub requests: u64,
    pub request_errors: u64,
    pub request_mean_ms: f64,
    pub request_max_ms: f64,
    pub recoveries: u64,
    pub documents_open: u64,
    pub remote_fetches: u64,
    pub builds_started: u64,
    pub builds_completed: u64,
    pub builds_cancelled: u64,
    pub builds_failed: u64,
    pub build_mean_ms: f64,
    pub build_max_ms: f64,
    pub connections: u64,
    pub connections_open: u64,
    pub memory_rss_bytes: Option<u64>,
}

/// Resident set size of this process, from the VmRSS line of
/// /proc/self/status. None when the platform does not expose it.
fn rss_bytes() -> Option<u64> {
    #[cfg(target_os = "linux")]
    {
        let status = std::fs::read_to_string("/proc/self/status").ok()?;
        let line = status.lines().find(|line| line.starts_with("VmRSS:"))?;
        let kib: u64 = line.split_whitespace().nth(1)?.parse().ok()?;
        Some(kib * 1024)
    }
    #[cfg(not(target_os = "linux"))]
    None
}

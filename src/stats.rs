//! Concurrent aggregation of per-request statistics.
//!
//! Every completed request produces one [`RequestOutcome`] which is pushed
//! into the shared [`Stats`] aggregator. Counters are plain atomics,
//! latencies go into two [`SafeHistogram`]s (service time and
//! Coordinated-Omission-corrected total time), and the status-code, error
//! and response-sample maps share a single mutex. [`Stats::snapshot`]
//! assembles a self-contained [`Snapshot`] for consumers: copied maps,
//! single atomic counter reads, and percentile queries against the
//! histograms.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::histogram::SafeHistogram;

/// How many bytes of a failing response body are retained as a sample.
pub(crate) const RESPONSE_SAMPLE_BYTES: usize = 1024;

/// The timing and classification of one completed request.
///
/// Outcomes are appended to the run's result log in completion order, which
/// is not emission order.
#[derive(Debug, Clone)]
pub struct RequestOutcome {
    /// Wall-clock time the request was scheduled to begin.
    pub timestamp: DateTime<Utc>,
    /// The virtual user this request ran as.
    pub user_id: String,
    /// Unique id of this request.
    pub request_id: String,
    /// HTTP status code, shell exit code, or 0 on transport failure.
    pub status: u16,
    /// Whether the request counts as a success: HTTP status in [200, 300)
    /// or shell exit 0.
    pub success: bool,
    /// Response (or captured stdout) size in bytes.
    pub bytes: u64,
    /// End minus scheduled instant: what a real caller would have observed.
    pub total_latency: Duration,
    /// End minus actual start: the network-plus-server cost.
    pub service_time: Duration,
    /// Actual start minus scheduled instant: the scheduler's own slippage.
    pub queue_wait: Duration,
    /// Normalized error text, when the request failed.
    pub error: Option<String>,
    /// Truncated response body, retained only for status >= 400 or a
    /// non-zero shell exit.
    pub response_sample: Option<String>,
}

/// Collapse noisy transport errors into a stable key.
///
/// Error text mentioning `dial`, `connect` or `timeout` typically embeds a
/// per-host URL; keeping only the final `": "`-separated segment stops the
/// error map from growing one entry per target address.
pub(crate) fn normalize_error(error: &str) -> String {
    let lowered = error.to_lowercase();
    if lowered.contains("dial") || lowered.contains("connect") || lowered.contains("timeout") {
        if let Some(last) = error.rsplit(": ").next() {
            return last.trim().to_string();
        }
    }
    error.trim().to_string()
}

/// Aggregate statistics for one load test run.
///
/// Counter updates and histogram records are safe to call from any number
/// of request tasks; [`reset`](Self::reset) is not concurrent-safe with
/// [`add`](Self::add) and is only invoked by the run controller while no
/// requests are in flight.
pub struct Stats {
    requests: AtomicU64,
    successes: AtomicU64,
    failures: AtomicU64,
    bytes: AtomicU64,
    queue_wait_micros: AtomicU64,

    /// Network-plus-server cost of each request.
    pub service_time: SafeHistogram,
    /// Coordinated-Omission-corrected latency of each request, measured
    /// from the scheduled instant.
    pub total_time: SafeHistogram,

    maps: Mutex<StatsMaps>,
}

#[derive(Default)]
struct StatsMaps {
    status_codes: HashMap<u16, u64>,
    error_counts: HashMap<String, u64>,
    response_samples: HashMap<u16, String>,
}

impl Stats {
    pub fn new() -> Stats {
        Stats {
            requests: AtomicU64::new(0),
            successes: AtomicU64::new(0),
            failures: AtomicU64::new(0),
            bytes: AtomicU64::new(0),
            queue_wait_micros: AtomicU64::new(0),
            service_time: SafeHistogram::new(),
            total_time: SafeHistogram::new(),
            maps: Mutex::new(StatsMaps::default()),
        }
    }

    /// Fold one completed request into the aggregate.
    pub fn add(&self, outcome: &RequestOutcome) {
        self.requests.fetch_add(1, Ordering::Relaxed);
        if outcome.success {
            self.successes.fetch_add(1, Ordering::Relaxed);
        } else {
            self.failures.fetch_add(1, Ordering::Relaxed);
        }
        self.bytes.fetch_add(outcome.bytes, Ordering::Relaxed);
        self.queue_wait_micros
            .fetch_add(outcome.queue_wait.as_micros() as u64, Ordering::Relaxed);

        self.service_time
            .record(outcome.service_time.as_micros() as u64);
        self.total_time
            .record(outcome.total_latency.as_micros() as u64);

        let mut maps = self.maps.lock().expect("stats maps mutex poisoned");
        *maps.status_codes.entry(outcome.status).or_insert(0) += 1;
        if let Some(error) = &outcome.error {
            if !error.is_empty() {
                *maps.error_counts.entry(error.clone()).or_insert(0) += 1;
            }
        }
        if outcome.status >= 400 {
            if let Some(sample) = &outcome.response_sample {
                // One sample per status code is enough for a failure
                // summary; first writer wins.
                maps.response_samples
                    .entry(outcome.status)
                    .or_insert_with(|| sample.clone());
            }
        }
    }

    /// Zero all counters and histograms and clear all maps.
    ///
    /// Must not race with [`add`](Self::add); the run controller calls this
    /// once at run start, before any request is emitted.
    pub fn reset(&self) {
        self.requests.store(0, Ordering::Relaxed);
        self.successes.store(0, Ordering::Relaxed);
        self.failures.store(0, Ordering::Relaxed);
        self.bytes.store(0, Ordering::Relaxed);
        self.queue_wait_micros.store(0, Ordering::Relaxed);
        self.service_time.clear();
        self.total_time.clear();
        let mut maps = self.maps.lock().expect("stats maps mutex poisoned");
        maps.status_codes.clear();
        maps.error_counts.clear();
        maps.response_samples.clear();
    }

    pub fn requests(&self) -> u64 {
        self.requests.load(Ordering::Relaxed)
    }

    pub fn successes(&self) -> u64 {
        self.successes.load(Ordering::Relaxed)
    }

    pub fn failures(&self) -> u64 {
        self.failures.load(Ordering::Relaxed)
    }

    pub fn bytes(&self) -> u64 {
        self.bytes.load(Ordering::Relaxed)
    }

    /// Average scheduler slippage across all requests, in milliseconds.
    pub fn average_queue_wait_ms(&self) -> f64 {
        let requests = self.requests();
        if requests == 0 {
            return 0.0;
        }
        let total_micros = self.queue_wait_micros.load(Ordering::Relaxed);
        total_micros as f64 / requests as f64 / 1_000.0
    }

    /// A copy of the status-code counts.
    pub fn status_codes(&self) -> HashMap<u16, u64> {
        let maps = self.maps.lock().expect("stats maps mutex poisoned");
        maps.status_codes.clone()
    }

    /// A copy of the normalized-error counts.
    pub fn error_counts(&self) -> HashMap<String, u64> {
        let maps = self.maps.lock().expect("stats maps mutex poisoned");
        maps.error_counts.clone()
    }

    /// A copy of the per-status response samples.
    pub fn response_samples(&self) -> HashMap<u16, String> {
        let maps = self.maps.lock().expect("stats maps mutex poisoned");
        maps.response_samples.clone()
    }

    /// Assemble a self-contained [`Snapshot`].
    ///
    /// Counters are read with one atomic load each and the maps are copied,
    /// so the consumer never observes later mutation. The histogram
    /// readings may be marginally older or newer than the counters; the
    /// snapshot is an approximate view by design and consumers render it
    /// as such.
    pub fn snapshot(&self, in_flight: i64, elapsed: Duration) -> Snapshot {
        Snapshot {
            requests: self.requests(),
            successes: self.successes(),
            failures: self.failures(),
            bytes: self.bytes(),
            in_flight,
            elapsed,
            p50_service_ms: self.service_time.value_at_quantile(50.0) as f64 / 1_000.0,
            p90_service_ms: self.service_time.value_at_quantile(90.0) as f64 / 1_000.0,
            p95_service_ms: self.service_time.value_at_quantile(95.0) as f64 / 1_000.0,
            p99_service_ms: self.service_time.value_at_quantile(99.0) as f64 / 1_000.0,
            max_service_ms: self.service_time.max() as f64 / 1_000.0,
            mean_service_ms: self.service_time.mean() / 1_000.0,
            average_queue_wait_ms: self.average_queue_wait_ms(),
            status_codes: self.status_codes(),
            error_counts: self.error_counts(),
            response_samples: self.response_samples(),
        }
    }
}

impl Default for Stats {
    fn default() -> Self {
        Stats::new()
    }
}

/// A self-contained view of aggregate statistics, published on the
/// snapshot channel at a fixed cadence and included in the final
/// [`RunReport`](crate::RunReport).
#[derive(Debug, Clone, Serialize)]
pub struct Snapshot {
    pub requests: u64,
    pub successes: u64,
    pub failures: u64,
    pub bytes: u64,
    /// Requests emitted but not yet completed when the snapshot was taken.
    pub in_flight: i64,
    /// Time since the run started.
    pub elapsed: Duration,
    pub p50_service_ms: f64,
    pub p90_service_ms: f64,
    pub p95_service_ms: f64,
    pub p99_service_ms: f64,
    pub max_service_ms: f64,
    pub mean_service_ms: f64,
    /// Average scheduler slippage, in milliseconds.
    pub average_queue_wait_ms: f64,
    /// Completed requests per status code (0 = transport failure).
    pub status_codes: HashMap<u16, u64>,
    /// Failures per normalized error string.
    pub error_counts: HashMap<String, u64>,
    /// One retained response body per failing status code.
    pub response_samples: HashMap<u16, String>,
}

impl Snapshot {
    /// Overall requests per second since the run started.
    pub fn requests_per_second(&self) -> f64 {
        let seconds = self.elapsed.as_secs_f64();
        if seconds > 0.0 {
            self.requests as f64 / seconds
        } else {
            0.0
        }
    }
}

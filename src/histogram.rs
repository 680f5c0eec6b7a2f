//! Concurrency-safe latency histogram.
//!
//! Latencies are recorded in microseconds into a fixed-range
//! [`hdrhistogram`](https://docs.rs/hdrhistogram/) with 3 significant
//! figures, giving high-fidelity quantiles with bounded memory regardless
//! of how many requests a load test makes.

use std::sync::Mutex;
use std::time::Duration;

use hdrhistogram::Histogram;

/// Lowest latency the histogram can record, in microseconds.
const LOWEST_DISCERNIBLE: u64 = 1;
/// Highest latency the histogram can record: 10 minutes, in microseconds.
const HIGHEST_TRACKABLE: u64 = Duration::from_secs(600).as_micros() as u64;
/// Quantile precision, in significant figures.
const SIGFIG: u8 = 3;

/// A thread-safe wrapper around [`hdrhistogram::Histogram`].
///
/// All operations serialize on one internal mutex. [`record`](Self::record)
/// is on the request hot path, so every critical section is constant-time.
pub struct SafeHistogram {
    histogram: Mutex<Histogram<u64>>,
}

impl SafeHistogram {
    /// Create an empty histogram covering 1 µs to 10 minutes.
    pub fn new() -> SafeHistogram {
        let histogram = Histogram::new_with_bounds(LOWEST_DISCERNIBLE, HIGHEST_TRACKABLE, SIGFIG)
            .expect("failed to build latency histogram with fixed bounds");
        SafeHistogram {
            histogram: Mutex::new(histogram),
        }
    }

    /// Record a latency in microseconds.
    ///
    /// Values outside the trackable range are silently dropped; recording
    /// is infallible from the caller's perspective.
    pub fn record(&self, value: u64) {
        let mut histogram = self.histogram.lock().expect("histogram mutex poisoned");
        let _ = histogram.record(value);
    }

    /// The value at the given quantile, in microseconds. Quantiles are
    /// expressed in percent, matching how they're displayed: `50.0` is the
    /// median, `99.9` the three-nines tail.
    pub fn value_at_quantile(&self, quantile: f64) -> u64 {
        let histogram = self.histogram.lock().expect("histogram mutex poisoned");
        histogram.value_at_quantile(quantile / 100.0)
    }

    /// The largest recorded value, in microseconds.
    pub fn max(&self) -> u64 {
        let histogram = self.histogram.lock().expect("histogram mutex poisoned");
        histogram.max()
    }

    /// The mean of all recorded values, in microseconds.
    pub fn mean(&self) -> f64 {
        let histogram = self.histogram.lock().expect("histogram mutex poisoned");
        histogram.mean()
    }

    /// How many values have been recorded.
    pub fn total_count(&self) -> u64 {
        let histogram = self.histogram.lock().expect("histogram mutex poisoned");
        histogram.len()
    }

    /// Discard all recorded values.
    pub fn clear(&self) {
        let mut histogram = self.histogram.lock().expect("histogram mutex poisoned");
        histogram.reset();
    }
}

impl Default for SafeHistogram {
    fn default() -> Self {
        SafeHistogram::new()
    }
}

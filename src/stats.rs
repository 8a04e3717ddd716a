use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::time::Instant;

const BYTES_PER_MB: f64 = 1024.0 * 1024.0;

/// One entry of a per-second throughput series
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThroughputSample {
    pub timestamp: DateTime<Utc>,
    /// Messages counted since the previous sample
    pub messages_per_second: u64,
    pub total_messages: u64,
}

/// Final statistics of one producer run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProducerStats {
    pub messages_sent: u64,
    pub messages_failed: u64,
    pub bytes_sent: u64,
    pub throughput_history: Vec<ThroughputSample>,
    pub errors: Vec<String>,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub duration_seconds: f64,
    pub average_throughput: f64,
    pub average_bandwidth_mbps: f64,
}

/// Final statistics of one consumer instance
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConsumerStats {
    /// Position of the consumer in its run, `test-group-<index>`
    #[serde(default)]
    pub consumer_index: usize,
    pub messages_consumed: u64,
    pub bytes_consumed: u64,
    pub throughput_history: Vec<ThroughputSample>,
    pub errors: Vec<String>,
    /// End-to-end latency of every decodable message, in milliseconds
    pub latency_measurements: Vec<f64>,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub duration_seconds: f64,
    pub average_throughput: f64,
    pub average_bandwidth_mbps: f64,
    pub latency_avg_ms: f64,
    pub latency_min_ms: f64,
    pub latency_max_ms: f64,
    pub latency_p95_ms: f64,
    pub latency_p99_ms: f64,
}

impl ConsumerStats {
    /// Whether any latency sample was recorded.
    pub fn has_latency(&self) -> bool {
        !self.latency_measurements.is_empty()
    }
}

/// Shared counters written by producer workers while a run is in flight.
///
/// Workers only ever increment; the producer freezes them into a
/// [`ProducerStats`] after every worker has been joined.
#[derive(Debug, Default)]
pub struct ProducerCounters {
    sent: AtomicU64,
    failed: AtomicU64,
    bytes: AtomicU64,
    errors: Mutex<Vec<String>>,
}

impl ProducerCounters {
    /// Acknowledged send whose bytes were not recorded yet.
    pub fn record_acked(&self, bytes: usize) {
        self.bytes.fetch_add(bytes as u64, Ordering::Relaxed);
        self.sent.fetch_add(1, Ordering::Relaxed);
    }

    /// Bytes handed to the transport ahead of acknowledgment.
    pub fn record_handoff(&self, bytes: usize) {
        self.bytes.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    /// Acknowledgment of a send whose bytes were recorded at hand-off.
    pub fn record_delivered(&self) {
        self.sent.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_failure(&self, error: impl ToString) {
        self.failed.fetch_add(1, Ordering::Relaxed);
        self.errors.lock().push(error.to_string());
    }

    pub fn sent(&self) -> u64 {
        self.sent.load(Ordering::Relaxed)
    }

    pub fn failed(&self) -> u64 {
        self.failed.load(Ordering::Relaxed)
    }

    pub fn bytes(&self) -> u64 {
        self.bytes.load(Ordering::Relaxed)
    }

    /// Snapshot the counters into final statistics.
    pub fn freeze(&self, history: Vec<ThroughputSample>, clock: RunClock) -> ProducerStats {
        let window = clock.finish();
        let messages_sent = self.sent();
        let bytes_sent = self.bytes();
        let (average_throughput, average_bandwidth_mbps) =
            window.rates(messages_sent, bytes_sent);

        ProducerStats {
            messages_sent,
            messages_failed: self.failed(),
            bytes_sent,
            throughput_history: history,
            errors: self.errors.lock().clone(),
            start_time: window.start_time,
            end_time: window.end_time,
            duration_seconds: window.duration_seconds,
            average_throughput,
            average_bandwidth_mbps,
        }
    }
}

/// Wall-clock start of a run paired with a monotonic reference.
#[derive(Debug, Clone, Copy)]
pub struct RunClock {
    started_at: DateTime<Utc>,
    started: Instant,
}

impl RunClock {
    pub fn start() -> Self {
        Self {
            started_at: Utc::now(),
            started: Instant::now(),
        }
    }

    pub fn started(&self) -> Instant {
        self.started
    }

    pub fn finish(&self) -> RunWindow {
        let elapsed = self.started.elapsed();
        let end_time = chrono::Duration::from_std(elapsed)
            .map(|d| self.started_at + d)
            .unwrap_or_else(|_| Utc::now());
        RunWindow {
            start_time: self.started_at,
            end_time,
            duration_seconds: elapsed.as_secs_f64(),
        }
    }
}

/// Closed time range of a finished run
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RunWindow {
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub duration_seconds: f64,
}

impl RunWindow {
    /// Average message rate and bandwidth (MB/s) over the window.
    pub fn rates(&self, messages: u64, bytes: u64) -> (f64, f64) {
        if self.duration_seconds > 0.0 {
            (
                messages as f64 / self.duration_seconds,
                (bytes as f64 / BYTES_PER_MB) / self.duration_seconds,
            )
        } else {
            (0.0, 0.0)
        }
    }
}

/// Builds a throughput series by differencing a running total.
#[derive(Debug, Default)]
pub struct ThroughputHistory {
    last_total: u64,
    samples: Vec<ThroughputSample>,
}

impl ThroughputHistory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a sample for the current total; returns the instantaneous rate.
    pub fn sample(&mut self, total: u64) -> u64 {
        let rate = total.saturating_sub(self.last_total);
        self.last_total = total;
        self.samples.push(ThroughputSample {
            timestamp: Utc::now(),
            messages_per_second: rate,
            total_messages: total,
        });
        rate
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn into_samples(self) -> Vec<ThroughputSample> {
        self.samples
    }
}

/// Latency figures derived from a sample list
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct LatencySummary {
    pub avg_ms: f64,
    pub min_ms: f64,
    pub max_ms: f64,
    pub p95_ms: f64,
    pub p99_ms: f64,
}

impl LatencySummary {
    /// Summarize samples; every field is 0 when there are none.
    pub fn from_samples(samples: &[f64]) -> Self {
        if samples.is_empty() {
            return Self::default();
        }

        let mut sorted = samples.to_vec();
        sorted.sort_by(|a, b| a.total_cmp(b));

        Self {
            avg_ms: sorted.iter().sum::<f64>() / sorted.len() as f64,
            min_ms: sorted[0],
            max_ms: sorted[sorted.len() - 1],
            p95_ms: percentile(&sorted, 95.0),
            p99_ms: percentile(&sorted, 99.0),
        }
    }
}

/// Nearest-rank percentile of an ascending slice.
///
/// The index is `floor(p / 100 * n)` clamped to the last element; an empty
/// slice yields 0.
pub fn percentile(sorted: &[f64], p: f64) -> f64 {
    if sorted.is_empty() {
        return 0.0;
    }
    let index = ((p / 100.0) * sorted.len() as f64).floor().max(0.0) as usize;
    sorted[index.min(sorted.len() - 1)]
}

/// Human-readable helpers for summary output
pub mod format {
    /// Format a latency in milliseconds
    pub fn latency_ms(ms: f64) -> String {
        if ms < 1.0 {
            format!("{:.0}μs", ms * 1_000.0)
        } else if ms < 1_000.0 {
            format!("{:.2}ms", ms)
        } else {
            format!("{:.2}s", ms / 1_000.0)
        }
    }

    /// Format a message rate
    pub fn rate(msgs_per_sec: f64) -> String {
        if msgs_per_sec >= 1_000_000.0 {
            format!("{:.2}M msg/s", msgs_per_sec / 1_000_000.0)
        } else if msgs_per_sec >= 1_000.0 {
            format!("{:.2}K msg/s", msgs_per_sec / 1_000.0)
        } else {
            format!("{:.2} msg/s", msgs_per_sec)
        }
    }

    pub fn bandwidth_mbps(mbps: f64) -> String {
        format!("{:.2} MB/s", mbps)
    }
}

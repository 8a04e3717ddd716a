//! # Latency-Tracking Consumer
//!
//! Polls one topic for a bounded time and measures end-to-end latency from
//! the origination timestamp carried in each envelope.
//!
//! Every poll is bounded (one second by default, never past the run
//! deadline) so the stop flag is observed at least once per poll. Records
//! whose timestamp cannot be recovered are still counted as consumed but
//! contribute no latency sample.

use crate::defaults;
use crate::stats::{ConsumerStats, LatencySummary, RunClock, ThroughputHistory};
use crate::transport::{origination_time, BrokerConsumer, ConsumedRecord};
use crate::utils::StopHandle;
use chrono::Utc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

/// Consumer measuring throughput and end-to-end latency
pub struct LatencyTrackingConsumer {
    client: Box<dyn BrokerConsumer>,
    index: usize,
    running: StopHandle,
    connected: bool,
    poll_timeout: Duration,
    sampling_interval: Duration,
}

#[derive(Default)]
struct Tally {
    consumed: u64,
    bytes: u64,
    latencies: Vec<f64>,
    errors: Vec<String>,
}

impl Tally {
    fn record(&mut self, record: &ConsumedRecord) {
        self.consumed += 1;
        self.bytes += record.size() as u64;

        if let Some(sent_at) = origination_time(&record.payload) {
            let elapsed = Utc::now() - sent_at;
            if let Some(micros) = elapsed.num_microseconds() {
                self.latencies.push(micros as f64 / 1_000.0);
            }
        }
    }
}

impl LatencyTrackingConsumer {
    pub fn new(client: Box<dyn BrokerConsumer>) -> Self {
        Self {
            client,
            index: 0,
            running: StopHandle::new(),
            connected: false,
            poll_timeout: defaults::POLL_TIMEOUT,
            sampling_interval: defaults::SAMPLING_INTERVAL,
        }
    }

    /// Position of this consumer in its run, carried into its statistics.
    pub fn with_index(mut self, index: usize) -> Self {
        self.index = index;
        self
    }

    /// Upper bound of a single poll.
    pub fn with_poll_timeout(mut self, poll_timeout: Duration) -> Self {
        self.poll_timeout = poll_timeout;
        self
    }

    pub fn with_sampling_interval(mut self, sampling_interval: Duration) -> Self {
        self.sampling_interval = sampling_interval;
        self
    }

    pub fn group_id(&self) -> &str {
        self.client.group_id()
    }

    /// Connect and subscribe. Returns false when the broker could not be
    /// reached.
    pub async fn connect(&mut self) -> bool {
        match self.client.connect().await {
            Ok(()) => {
                debug!("Consumer {} connected", self.client.group_id());
                self.connected = true;
                self.running.rearm();
                true
            }
            Err(e) => {
                error!("Failed to connect consumer {}: {}", self.client.group_id(), e);
                false
            }
        }
    }

    pub fn is_connected(&self) -> bool {
        self.connected
    }

    pub fn stop_handle(&self) -> StopHandle {
        self.running.clone()
    }

    /// Stop consuming after the poll in progress. Holds until the next
    /// `connect`, so a stop that lands before polling starts is not lost.
    pub fn stop(&self) {
        self.running.stop();
    }

    /// Consume for up to `duration` or until stopped.
    ///
    /// Never fails: poll errors are kept in `errors` and polling continues,
    /// and a run that sees no message returns all-zero statistics.
    pub async fn consume_messages(&mut self, duration: Duration) -> ConsumerStats {
        let clock = RunClock::start();
        let deadline = clock.started() + duration;
        let mut next_sample = clock.started() + self.sampling_interval;
        let mut history = ThroughputHistory::new();
        let mut tally = Tally::default();

        if self.connected {
            if !self.running.start() {
                info!(
                    "Consumer {} was stopped before it started polling",
                    self.client.group_id()
                );
            }
        } else {
            tally.errors.push("consumer is not connected".to_string());
        }

        while self.running.is_running() {
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            let wait = self.poll_timeout.min(deadline - now);

            match self.client.poll(wait).await {
                Ok(records) => records.iter().for_each(|record| tally.record(record)),
                Err(e) => {
                    warn!("Consumer {} poll failed: {}", self.client.group_id(), e);
                    tally.errors.push(e.to_string());
                    // Treat a failed poll like one that timed out.
                    tokio::time::sleep(wait).await;
                }
            }

            while Instant::now() >= next_sample {
                let rate = history.sample(tally.consumed);
                debug!(
                    "Consumer {} throughput: {} msg/s (total {})",
                    self.client.group_id(),
                    rate,
                    tally.consumed
                );
                next_sample += self.sampling_interval;
            }
        }
        self.running.stop();

        let window = clock.finish();
        let (average_throughput, average_bandwidth_mbps) =
            window.rates(tally.consumed, tally.bytes);
        let latency = LatencySummary::from_samples(&tally.latencies);

        info!(
            "Consumer {} finished: {} consumed, avg latency {:.2}ms, p99 {:.2}ms",
            self.client.group_id(),
            tally.consumed,
            latency.avg_ms,
            latency.p99_ms
        );

        ConsumerStats {
            consumer_index: self.index,
            messages_consumed: tally.consumed,
            bytes_consumed: tally.bytes,
            throughput_history: history.into_samples(),
            errors: tally.errors,
            latency_measurements: tally.latencies,
            start_time: window.start_time,
            end_time: window.end_time,
            duration_seconds: window.duration_seconds,
            average_throughput,
            average_bandwidth_mbps,
            latency_avg_ms: latency.avg_ms,
            latency_min_ms: latency.min_ms,
            latency_max_ms: latency.max_ms,
            latency_p95_ms: latency.p95_ms,
            latency_p99_ms: latency.p99_ms,
        }
    }

    pub async fn disconnect(&mut self) {
        self.running.stop();
        if self.connected {
            self.client.disconnect().await;
            self.connected = false;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{BrokerProducer, Envelope, InMemoryBroker};

    const TOPIC: &str = "perf-test-consumer";

    async fn connected_consumer(broker: &InMemoryBroker, group: &str) -> LatencyTrackingConsumer {
        let mut consumer = LatencyTrackingConsumer::new(Box::new(broker.new_consumer(TOPIC, group)));
        assert!(consumer.connect().await);
        consumer
    }

    async fn publish(broker: &InMemoryBroker, payloads: Vec<Vec<u8>>) {
        let producer = broker.new_producer();
        producer.connect().await.unwrap();
        for payload in payloads {
            producer.send(TOPIC, None, payload).await.unwrap();
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_consumes_and_measures_latency() {
        let broker = InMemoryBroker::default();
        let mut consumer = connected_consumer(&broker, "test-group-0").await;
        let payloads = (0..10)
            .map(|i| Envelope::stamp(0, i, "x".repeat(32)).to_bytes().unwrap())
            .collect::<Vec<_>>();
        let total_bytes: usize = payloads.iter().map(Vec::len).sum();
        publish(&broker, payloads).await;

        let stats = consumer.consume_messages(Duration::from_secs(3)).await;

        assert_eq!(stats.messages_consumed, 10);
        assert_eq!(stats.bytes_consumed, total_bytes as u64);
        assert_eq!(stats.latency_measurements.len(), 10);
        assert!(stats.latency_min_ms <= stats.latency_p95_ms);
        assert!(stats.latency_p95_ms <= stats.latency_max_ms);
        assert!(stats.errors.is_empty());
        assert_eq!(stats.throughput_history.len(), 3);
        assert_eq!(stats.throughput_history[0].messages_per_second, 10);
        assert_eq!(stats.duration_seconds, 3.0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_messages_yield_zero_stats() {
        let broker = InMemoryBroker::default();
        let mut consumer = connected_consumer(&broker, "test-group-0").await;

        let stats = consumer.consume_messages(Duration::from_secs(2)).await;

        assert_eq!(stats.messages_consumed, 0);
        assert_eq!(stats.average_throughput, 0.0);
        assert_eq!(stats.latency_avg_ms, 0.0);
        assert_eq!(stats.latency_p99_ms, 0.0);
        assert!(!stats.has_latency());
    }

    #[tokio::test(start_paused = true)]
    async fn test_undecodable_payload_counted_without_latency() {
        let broker = InMemoryBroker::default();
        let mut consumer = connected_consumer(&broker, "g").await;
        publish(
            &broker,
            vec![
                b"not an envelope".to_vec(),
                br#"{"id":"1","timestamp":"garbage","data":{}}"#.to_vec(),
                Envelope::stamp(0, 0, String::new()).to_bytes().unwrap(),
            ],
        )
        .await;

        let stats = consumer.consume_messages(Duration::from_secs(1)).await;

        assert_eq!(stats.messages_consumed, 3);
        assert_eq!(stats.latency_measurements.len(), 1);
        assert!(stats.errors.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_ends_consumption_early() {
        let broker = InMemoryBroker::default();
        let mut consumer = connected_consumer(&broker, "g").await;
        let stop = consumer.stop_handle();

        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(2500)).await;
            stop.stop();
        });

        let stats = consumer.consume_messages(Duration::from_secs(60)).await;
        // At most one poll timeout past the stop request.
        assert!(stats.duration_seconds <= 3.5, "{}", stats.duration_seconds);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_before_consuming_is_honoured() {
        let broker = InMemoryBroker::default();
        let mut consumer = connected_consumer(&broker, "g").await;
        consumer.stop();

        let started = tokio::time::Instant::now();
        let stats = consumer.consume_messages(Duration::from_secs(60)).await;

        assert!(started.elapsed() < Duration::from_secs(2), "{:?}", started.elapsed());
        assert_eq!(stats.messages_consumed, 0);
        assert!(stats.errors.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnect_rearms_after_stop() {
        let broker = InMemoryBroker::default();
        let mut consumer = connected_consumer(&broker, "g").await;
        consumer.stop();
        assert!(consumer.connect().await);

        let stats = consumer.consume_messages(Duration::from_secs(2)).await;
        assert!(stats.duration_seconds >= 2.0, "{}", stats.duration_seconds);
    }

    #[tokio::test(start_paused = true)]
    async fn test_poll_errors_are_recorded_and_polling_continues() {
        let broker = InMemoryBroker::default();
        let mut consumer = connected_consumer(&broker, "g").await;
        broker.set_available(false);

        let recovering = broker.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(2500)).await;
            recovering.set_available(true);
            let producer = recovering.new_producer();
            producer.connect().await.unwrap();
            producer
                .send(TOPIC, None, Envelope::stamp(0, 0, String::new()).to_bytes().unwrap())
                .await
                .unwrap();
        });

        let stats = consumer.consume_messages(Duration::from_secs(5)).await;

        assert!(!stats.errors.is_empty());
        assert!(stats.errors[0].contains("offline"));
        assert_eq!(stats.messages_consumed, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unconnected_consumer_returns_immediately() {
        let broker = InMemoryBroker::default();
        let mut consumer = LatencyTrackingConsumer::new(Box::new(broker.new_consumer(TOPIC, "g")));

        let stats = consumer.consume_messages(Duration::from_secs(10)).await;

        assert_eq!(stats.messages_consumed, 0);
        assert_eq!(stats.errors, vec!["consumer is not connected".to_string()]);
        assert_eq!(stats.duration_seconds, 0.0);
    }
}

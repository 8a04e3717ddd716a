//! # Rate-Limited Producer
//!
//! Drives a fixed message rate against one topic, spread evenly over a
//! number of worker tasks.
//!
//! ## Rate Control
//!
//! Each worker owns a ticker firing every `1 / (rate / workers)` seconds and
//! sends one envelope per tick. When the rate is lower than the worker count
//! the per-worker rate rounds down to zero and workers send back to back.
//!
//! ## Delivery Modes
//!
//! - **sync**: every send waits for its acknowledgment (bounded by the ack
//!   timeout); sent and bytes are counted together on success.
//! - **async**: the send is handed off and its delivery future is tracked in
//!   the background. Bytes are counted at hand-off, sent/failed when the
//!   future resolves. Outstanding futures are drained (bounded by the flush
//!   timeout) before statistics are frozen.
//!
//! ## Termination
//!
//! Workers check the shared [`StopHandle`] and the run deadline before every
//! send. After the run window, workers are joined with a bounded timeout; a
//! worker that does not finish in time is abandoned with a warning, never
//! aborted.

use crate::config::{DeliveryMode, OrchestratorTimings, RunConfiguration};
use crate::defaults;
use crate::error::TransportError;
use crate::stats::{ProducerCounters, ProducerStats, RunClock, ThroughputHistory};
use crate::transport::{BrokerProducer, Envelope};
use crate::utils::StopHandle;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

/// Called once per throughput sample with `(total_sent, sent_last_interval)`.
pub type ProgressCallback = Arc<dyn Fn(u64, u64) + Send + Sync>;

/// Time bounds applied by a producer run
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ProducerTimeouts {
    /// Bound on one synchronous acknowledgment
    pub ack: Duration,
    /// Bound on joining each worker after the run window
    pub join: Duration,
    /// Bound on draining outstanding asynchronous deliveries
    pub flush: Duration,
    /// Throughput sampling period
    pub sampling_interval: Duration,
}

impl Default for ProducerTimeouts {
    fn default() -> Self {
        Self {
            ack: defaults::ACK_TIMEOUT,
            join: defaults::PRODUCER_JOIN_TIMEOUT,
            flush: defaults::FLUSH_TIMEOUT,
            sampling_interval: defaults::SAMPLING_INTERVAL,
        }
    }
}

impl From<&OrchestratorTimings> for ProducerTimeouts {
    fn from(timings: &OrchestratorTimings) -> Self {
        Self {
            ack: timings.ack_timeout,
            join: timings.producer_join_timeout,
            flush: timings.flush_timeout,
            sampling_interval: timings.sampling_interval,
        }
    }
}

/// Multi-worker producer with a fixed target rate
pub struct RateLimitedProducer {
    client: Arc<dyn BrokerProducer>,
    topic: Arc<str>,
    running: StopHandle,
    connected: bool,
    timeouts: ProducerTimeouts,
    progress: Option<ProgressCallback>,
}

impl RateLimitedProducer {
    /// Create a producer for `topic` on top of a transport client.
    pub fn new(client: Arc<dyn BrokerProducer>, topic: impl Into<String>) -> Self {
        Self {
            client,
            topic: Arc::from(topic.into()),
            running: StopHandle::new(),
            connected: false,
            timeouts: ProducerTimeouts::default(),
            progress: None,
        }
    }

    pub fn with_timeouts(mut self, timeouts: ProducerTimeouts) -> Self {
        self.timeouts = timeouts;
        self
    }

    /// Report every throughput sample to `callback`.
    pub fn with_progress(mut self, callback: ProgressCallback) -> Self {
        self.progress = Some(callback);
        self
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Connect the underlying client. Returns false when the broker could
    /// not be reached.
    pub async fn connect(&mut self) -> bool {
        match self.client.connect().await {
            Ok(()) => {
                debug!("Producer connected via {} transport", self.client.name());
                self.connected = true;
                self.running.rearm();
                true
            }
            Err(e) => {
                error!("Failed to connect producer: {}", e);
                false
            }
        }
    }

    pub fn is_connected(&self) -> bool {
        self.connected
    }

    /// Handle that stops the current run early. A stop issued before the
    /// run starts still ends it at once; only `connect` clears it.
    pub fn stop_handle(&self) -> StopHandle {
        self.running.clone()
    }

    /// Run the workload described by `config` and return its statistics.
    ///
    /// ## Execution Flow
    ///
    /// 1. Spawn `num_producer_threads` workers and one throughput sampler
    /// 2. Sample the sent counter once per interval until the run window
    ///    closes or the stop handle is flipped
    /// 3. Lower the running flag and join every worker (bounded)
    /// 4. Drain outstanding asynchronous deliveries (bounded)
    /// 5. Freeze the counters into [`ProducerStats`]
    ///
    /// Send failures never abort the run; they are counted and their error
    /// text is kept in `errors`.
    pub async fn run_load_test(&mut self, config: &RunConfiguration) -> ProducerStats {
        let clock = RunClock::start();
        let deadline = clock.started() + config.duration();
        let counters = Arc::new(ProducerCounters::default());
        let deliveries = TaskTracker::new();
        let filler: Arc<str> = Arc::from("x".repeat(config.filler_len()));
        let worker_count = config.num_producer_threads.max(1);

        info!(
            "Producing to {} for {}s at {} msg/s ({} worker(s), {} delivery, interval {:?})",
            self.topic,
            config.duration_seconds,
            config.messages_per_second,
            worker_count,
            config.delivery_mode,
            config.send_interval()
        );

        if !self.running.start() {
            info!("Producer was stopped before the run started");
        }

        let workers: Vec<JoinHandle<()>> = (0..worker_count)
            .map(|thread_id| {
                let worker = Worker {
                    thread_id,
                    client: Arc::clone(&self.client),
                    topic: Arc::clone(&self.topic),
                    counters: Arc::clone(&counters),
                    running: self.running.clone(),
                    deliveries: deliveries.clone(),
                    mode: config.delivery_mode,
                    interval: config.send_interval(),
                    ack_timeout: self.timeouts.ack,
                    deadline,
                    filler: Arc::clone(&filler),
                };
                tokio::spawn(worker.run())
            })
            .collect();

        let sampler = tokio::spawn(sample_throughput(
            Arc::clone(&counters),
            self.running.clone(),
            deadline,
            self.timeouts.sampling_interval,
            self.progress.clone(),
        ));

        let history = match sampler.await {
            Ok(history) => history.into_samples(),
            Err(e) => {
                warn!("Throughput sampler failed: {}", e);
                Vec::new()
            }
        };

        self.running.stop();

        for (thread_id, mut worker) in workers.into_iter().enumerate() {
            match tokio::time::timeout(self.timeouts.join, &mut worker).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!("Producer worker {} panicked: {}", thread_id, e),
                Err(_) => warn!(
                    "Producer worker {} did not finish within {:?}, abandoning it",
                    thread_id, self.timeouts.join
                ),
            }
        }

        if let Err(e) = self.client.flush(self.timeouts.flush).await {
            warn!("Producer flush failed: {}", e);
        }

        deliveries.close();
        if tokio::time::timeout(self.timeouts.flush, deliveries.wait())
            .await
            .is_err()
        {
            warn!(
                "{} delivery acknowledgment(s) still outstanding after {:?}",
                deliveries.len(),
                self.timeouts.flush
            );
        }

        let stats = counters.freeze(history, clock);
        info!(
            "Producer finished: {} sent, {} failed, {:.2} msg/s, {:.2} MB/s",
            stats.messages_sent,
            stats.messages_failed,
            stats.average_throughput,
            stats.average_bandwidth_mbps
        );
        stats
    }

    /// Flush and disconnect the underlying client.
    pub async fn disconnect(&mut self) {
        self.running.stop();
        if !self.connected {
            return;
        }
        if let Err(e) = self.client.flush(self.timeouts.flush).await {
            warn!("Producer flush before disconnect failed: {}", e);
        }
        self.client.disconnect().await;
        self.connected = false;
    }
}

struct Worker {
    thread_id: usize,
    client: Arc<dyn BrokerProducer>,
    topic: Arc<str>,
    counters: Arc<ProducerCounters>,
    running: StopHandle,
    deliveries: TaskTracker,
    mode: DeliveryMode,
    interval: Duration,
    ack_timeout: Duration,
    deadline: Instant,
    filler: Arc<str>,
}

impl Worker {
    fn should_continue(&self) -> bool {
        self.running.is_running() && Instant::now() < self.deadline
    }

    async fn run(self) {
        let mut ticker = (!self.interval.is_zero()).then(|| {
            let mut ticker = tokio::time::interval(self.interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker
        });
        let mut sequence = 0u64;

        while self.should_continue() {
            match ticker.as_mut() {
                Some(ticker) => {
                    ticker.tick().await;
                    if !self.should_continue() {
                        break;
                    }
                }
                None => tokio::task::yield_now().await,
            }

            self.send_one(sequence).await;
            sequence += 1;
        }

        debug!(
            "Producer worker {} exiting after {} send(s)",
            self.thread_id, sequence
        );
    }

    async fn send_one(&self, sequence: u64) {
        let envelope = Envelope::stamp(self.thread_id, sequence, self.filler.to_string());
        let payload = match envelope.to_bytes() {
            Ok(payload) => payload,
            Err(e) => {
                self.counters.record_failure(e);
                return;
            }
        };
        let size = payload.len();

        match self.mode {
            DeliveryMode::Sync => {
                let delivery = self.client.send(&self.topic, None, payload);
                match tokio::time::timeout(self.ack_timeout, delivery).await {
                    Ok(Ok(())) => self.counters.record_acked(size),
                    Ok(Err(e)) => self.counters.record_failure(e),
                    Err(_) => self
                        .counters
                        .record_failure(TransportError::Timeout(self.ack_timeout)),
                }
            }
            DeliveryMode::Async => {
                self.counters.record_handoff(size);
                let delivery = self.client.send(&self.topic, None, payload);
                let counters = Arc::clone(&self.counters);
                self.deliveries.spawn(async move {
                    match delivery.await {
                        Ok(()) => counters.record_delivered(),
                        Err(e) => counters.record_failure(e),
                    }
                });
            }
        }
    }
}

async fn sample_throughput(
    counters: Arc<ProducerCounters>,
    running: StopHandle,
    deadline: Instant,
    interval: Duration,
    progress: Option<ProgressCallback>,
) -> ThroughputHistory {
    let mut history = ThroughputHistory::new();
    let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    while running.is_running() && Instant::now() < deadline {
        ticker.tick().await;
        let total = counters.sent();
        let rate = history.sample(total);
        debug!("Producer throughput: {} msg/s (total {})", rate, total);
        if let Some(callback) = &progress {
            callback(total, rate);
        }
    }
    history
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{InMemoryBroker, MemoryBrokerOptions};
    use std::sync::atomic::{AtomicU64, Ordering};

    const TOPIC: &str = "perf-test-unit";

    fn config(duration: u64, rate: u64, threads: usize, mode: DeliveryMode) -> RunConfiguration {
        RunConfiguration {
            duration_seconds: duration,
            messages_per_second: rate,
            message_size_bytes: 256,
            num_producer_threads: threads,
            num_consumers: 1,
            delivery_mode: mode,
        }
    }

    async fn producer_for(broker: &InMemoryBroker) -> RateLimitedProducer {
        let mut producer = RateLimitedProducer::new(Arc::new(broker.new_producer()), TOPIC)
            .with_timeouts(ProducerTimeouts {
                ack: Duration::from_millis(200),
                join: Duration::from_secs(1),
                flush: Duration::from_secs(1),
                sampling_interval: Duration::from_secs(1),
            });
        assert!(producer.connect().await);
        producer
    }

    #[tokio::test(start_paused = true)]
    async fn test_sync_rate_within_one_interval() {
        let broker = InMemoryBroker::default();
        let mut producer = producer_for(&broker).await;

        let stats = producer
            .run_load_test(&config(5, 50, 1, DeliveryMode::Sync))
            .await;

        assert!(
            (240..=260).contains(&stats.messages_sent),
            "sent {}",
            stats.messages_sent
        );
        assert_eq!(stats.messages_failed, 0);
        assert_eq!(broker.record_count(TOPIC) as u64, stats.messages_sent);
        assert_eq!(stats.throughput_history.len(), 5);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rate_is_split_across_workers() {
        let broker = InMemoryBroker::default();
        let mut producer = producer_for(&broker).await;

        let stats = producer
            .run_load_test(&config(4, 100, 4, DeliveryMode::Sync))
            .await;

        // 4 workers at 25 msg/s for 4s
        assert!(
            (380..=420).contains(&stats.messages_sent),
            "sent {}",
            stats.messages_sent
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_sync_bytes_match_sent_messages() {
        let broker = InMemoryBroker::new(MemoryBrokerOptions {
            ack_latency: Duration::from_millis(5),
            ..Default::default()
        });
        let mut producer = producer_for(&broker).await;

        let stats = producer
            .run_load_test(&config(2, 20, 1, DeliveryMode::Sync))
            .await;

        let sample = Envelope::stamp(0, 0, "x".repeat(256 - 100))
            .to_bytes()
            .unwrap()
            .len() as u64;
        assert!(stats.messages_sent > 0);
        // Envelope size only varies by a few bytes of sequence digits.
        let estimated = stats.bytes_sent as f64 / sample as f64;
        assert!((estimated - stats.messages_sent as f64).abs() < 1.0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failures_are_counted_and_run_continues() {
        let broker = InMemoryBroker::new(MemoryBrokerOptions {
            fail_every: Some(5),
            ..Default::default()
        });
        let mut producer = producer_for(&broker).await;

        let stats = producer
            .run_load_test(&config(2, 50, 1, DeliveryMode::Sync))
            .await;

        assert_eq!(stats.messages_sent + stats.messages_failed, 100);
        assert_eq!(stats.messages_failed, 20);
        assert_eq!(stats.errors.len(), 20);
        assert!(stats.errors[0].contains("injected failure"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_async_bytes_recorded_without_acks() {
        let broker = InMemoryBroker::new(MemoryBrokerOptions {
            drop_acks: true,
            ..Default::default()
        });
        let mut producer = producer_for(&broker).await;

        let stats = producer
            .run_load_test(&config(2, 10, 1, DeliveryMode::Async))
            .await;

        assert_eq!(stats.messages_sent, 0);
        assert_eq!(stats.messages_failed, 0);
        assert!(stats.bytes_sent > 0);
        assert_eq!(broker.record_count(TOPIC), 20);
    }

    #[tokio::test(start_paused = true)]
    async fn test_async_deliveries_are_drained() {
        let broker = InMemoryBroker::new(MemoryBrokerOptions {
            ack_latency: Duration::from_millis(300),
            ..Default::default()
        });
        let mut producer = producer_for(&broker).await;

        let stats = producer
            .run_load_test(&config(2, 10, 1, DeliveryMode::Async))
            .await;

        // The last sends are acknowledged after the window closes.
        assert_eq!(stats.messages_sent, 20);
        assert_eq!(stats.messages_failed, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sync_ack_timeout_is_a_failure() {
        let broker = InMemoryBroker::new(MemoryBrokerOptions {
            drop_acks: true,
            ..Default::default()
        });
        let mut producer = producer_for(&broker).await;

        let stats = producer
            .run_load_test(&config(1, 2, 1, DeliveryMode::Sync))
            .await;

        assert_eq!(stats.messages_sent, 0);
        assert!(stats.messages_failed >= 1);
        assert!(stats.errors[0].contains("timed out"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_handle_ends_run_early() {
        let broker = InMemoryBroker::default();
        let mut producer = producer_for(&broker).await;
        let stop = producer.stop_handle();

        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(1500)).await;
            stop.stop();
        });

        let stats = producer
            .run_load_test(&config(30, 10, 1, DeliveryMode::Sync))
            .await;

        assert!(stats.messages_sent <= 20, "sent {}", stats.messages_sent);
        assert!(stats.duration_seconds < 5.0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_before_run_is_honoured() {
        let broker = InMemoryBroker::default();
        let mut producer = producer_for(&broker).await;
        producer.stop_handle().stop();

        let started = tokio::time::Instant::now();
        let stats = producer
            .run_load_test(&config(30, 10, 1, DeliveryMode::Sync))
            .await;

        assert!(started.elapsed() < Duration::from_secs(2), "{:?}", started.elapsed());
        assert_eq!(stats.messages_sent, 0);
        assert_eq!(broker.record_count(TOPIC), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_progress_callback_sees_every_sample() {
        let broker = InMemoryBroker::default();
        let calls = Arc::new(AtomicU64::new(0));
        let seen = Arc::clone(&calls);
        let mut producer = producer_for(&broker).await.with_progress(Arc::new(move |_, _| {
            seen.fetch_add(1, Ordering::Relaxed);
        }));

        producer
            .run_load_test(&config(3, 10, 1, DeliveryMode::Sync))
            .await;

        assert_eq!(calls.load(Ordering::Relaxed), 3);
    }

    #[tokio::test]
    async fn test_unconnected_producer_counts_failures() {
        let broker = InMemoryBroker::default();
        let mut producer = RateLimitedProducer::new(Arc::new(broker.new_producer()), TOPIC);
        let stop = producer.stop_handle();

        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(150)).await;
            stop.stop();
        });
        let stats = producer
            .run_load_test(&config(1, 20, 1, DeliveryMode::Sync))
            .await;

        assert_eq!(stats.messages_sent, 0);
        assert!(stats.messages_failed > 0);
        assert_eq!(stats.errors[0], "client is not connected");
    }
}

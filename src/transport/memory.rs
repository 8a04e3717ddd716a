//! In-process broker used for tests and for running the benchmark without a
//! deployed platform.
//!
//! Topics are append-only logs. Every consumer group keeps its own offset per
//! topic, so consumers sharing a group split the records while distinct groups
//! each see the full log. Acknowledgment latency, deterministic send failures
//! and lost acknowledgments can be injected through [`MemoryBrokerOptions`].

use super::{
    BrokerConsumer, BrokerProducer, ConsumedRecord, DeliveryFuture, TransportFactory,
};
use crate::error::TransportError;
use crate::platform::PlatformSpec;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tracing::{debug, trace};

/// Behaviour knobs for the in-memory broker
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MemoryBrokerOptions {
    /// Delay before a delivery future resolves.
    pub ack_latency: Duration,
    /// Reject every n-th send (1-based across all producers).
    pub fail_every: Option<u64>,
    /// Accept records but never resolve their delivery futures.
    pub drop_acks: bool,
    /// Upper bound on records returned by one poll.
    pub max_poll_records: usize,
}

impl Default for MemoryBrokerOptions {
    fn default() -> Self {
        Self {
            ack_latency: Duration::ZERO,
            fail_every: None,
            drop_acks: false,
            max_poll_records: 500,
        }
    }
}

struct BrokerState {
    options: MemoryBrokerOptions,
    topics: Mutex<HashMap<String, Vec<ConsumedRecord>>>,
    /// (group, topic) -> next offset
    offsets: Mutex<HashMap<(String, String), usize>>,
    available: AtomicBool,
    send_counter: AtomicU64,
    appended: Notify,
}

impl BrokerState {
    fn ensure_available(&self) -> Result<(), TransportError> {
        if self.available.load(Ordering::Acquire) {
            Ok(())
        } else {
            Err(TransportError::Unavailable(
                "in-memory broker is offline".to_string(),
            ))
        }
    }

    fn append(&self, topic: &str, key: Option<&str>, payload: Vec<u8>) {
        self.topics
            .lock()
            .entry(topic.to_string())
            .or_default()
            .push(ConsumedRecord {
                key: key.map(str::to_string),
                payload,
            });
        self.appended.notify_waiters();
    }

    fn fetch(&self, group_id: &str, topic: &str) -> Vec<ConsumedRecord> {
        let mut offsets = self.offsets.lock();
        let offset = offsets
            .entry((group_id.to_string(), topic.to_string()))
            .or_insert(0);

        let topics = self.topics.lock();
        let Some(log) = topics.get(topic) else {
            return Vec::new();
        };
        let end = log.len().min(*offset + self.options.max_poll_records);
        let batch = log[*offset..end].to_vec();
        *offset = end;
        batch
    }
}

/// Shared handle to an in-process broker. Clones share the same state.
#[derive(Clone)]
pub struct InMemoryBroker {
    state: Arc<BrokerState>,
}

impl Default for InMemoryBroker {
    fn default() -> Self {
        Self::new(MemoryBrokerOptions::default())
    }
}

impl InMemoryBroker {
    pub fn new(options: MemoryBrokerOptions) -> Self {
        Self {
            state: Arc::new(BrokerState {
                options,
                topics: Mutex::new(HashMap::new()),
                offsets: Mutex::new(HashMap::new()),
                available: AtomicBool::new(true),
                send_counter: AtomicU64::new(0),
                appended: Notify::new(),
            }),
        }
    }

    /// Take the broker on- or offline. Offline brokers refuse connects and
    /// polls.
    pub fn set_available(&self, available: bool) {
        debug!("In-memory broker available: {}", available);
        self.state.available.store(available, Ordering::Release);
    }

    pub fn is_available(&self) -> bool {
        self.state.available.load(Ordering::Acquire)
    }

    /// Number of records stored in a topic.
    pub fn record_count(&self, topic: &str) -> usize {
        self.state.topics.lock().get(topic).map_or(0, Vec::len)
    }

    /// Names of every topic that received at least one record.
    pub fn topics(&self) -> Vec<String> {
        let mut names: Vec<String> = self.state.topics.lock().keys().cloned().collect();
        names.sort();
        names
    }

    pub fn new_producer(&self) -> MemoryProducer {
        MemoryProducer {
            state: Arc::clone(&self.state),
            connected: AtomicBool::new(false),
        }
    }

    pub fn new_consumer(&self, topic: &str, group_id: &str) -> MemoryConsumer {
        MemoryConsumer {
            state: Arc::clone(&self.state),
            topic: topic.to_string(),
            group_id: group_id.to_string(),
            connected: false,
        }
    }
}

impl TransportFactory for InMemoryBroker {
    fn producer(&self, _platform: &PlatformSpec) -> Arc<dyn BrokerProducer> {
        Arc::new(self.new_producer())
    }

    fn consumer(
        &self,
        _platform: &PlatformSpec,
        topic: &str,
        group_id: &str,
    ) -> Box<dyn BrokerConsumer> {
        Box::new(self.new_consumer(topic, group_id))
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}

/// Producer client of an [`InMemoryBroker`]
pub struct MemoryProducer {
    state: Arc<BrokerState>,
    connected: AtomicBool,
}

#[async_trait]
impl BrokerProducer for MemoryProducer {
    async fn connect(&self) -> Result<(), TransportError> {
        self.state.ensure_available()?;
        self.connected.store(true, Ordering::Release);
        Ok(())
    }

    fn send(&self, topic: &str, key: Option<&str>, payload: Vec<u8>) -> DeliveryFuture {
        if !self.connected.load(Ordering::Acquire) {
            return Box::pin(std::future::ready(Err(TransportError::NotConnected)));
        }

        let sequence = self.state.send_counter.fetch_add(1, Ordering::Relaxed) + 1;
        if let Some(every) = self.state.options.fail_every.filter(|n| *n > 0) {
            if sequence % every == 0 {
                trace!("Injecting failure on send {}", sequence);
                return Box::pin(std::future::ready(Err(TransportError::Rejected(
                    format!("injected failure on send {}", sequence),
                ))));
            }
        }

        // The record is stored on hand-off; only the acknowledgment is delayed.
        self.state.append(topic, key, payload);

        if self.state.options.drop_acks {
            return Box::pin(std::future::pending());
        }

        let latency = self.state.options.ack_latency;
        Box::pin(async move {
            if !latency.is_zero() {
                tokio::time::sleep(latency).await;
            }
            Ok(())
        })
    }

    async fn flush(&self, _timeout: Duration) -> Result<(), TransportError> {
        Ok(())
    }

    async fn disconnect(&self) {
        self.connected.store(false, Ordering::Release);
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}

/// Consumer client of an [`InMemoryBroker`]
pub struct MemoryConsumer {
    state: Arc<BrokerState>,
    topic: String,
    group_id: String,
    connected: bool,
}

#[async_trait]
impl BrokerConsumer for MemoryConsumer {
    async fn connect(&mut self) -> Result<(), TransportError> {
        self.state.ensure_available()?;
        self.state
            .offsets
            .lock()
            .entry((self.group_id.clone(), self.topic.clone()))
            .or_insert(0);
        self.connected = true;
        Ok(())
    }

    async fn poll(&mut self, timeout: Duration) -> Result<Vec<ConsumedRecord>, TransportError> {
        if !self.connected {
            return Err(TransportError::NotConnected);
        }

        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            self.state.ensure_available()?;

            // Register interest before reading so an append in between is not missed.
            let appended = self.state.appended.notified();
            let batch = self.state.fetch(&self.group_id, &self.topic);
            if !batch.is_empty() {
                return Ok(batch);
            }
            if tokio::time::timeout_at(deadline, appended).await.is_err() {
                return Ok(Vec::new());
            }
        }
    }

    async fn disconnect(&mut self) {
        self.connected = false;
    }

    fn group_id(&self) -> &str {
        &self.group_id
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TOPIC: &str = "perf-test";

    async fn connected_producer(broker: &InMemoryBroker) -> MemoryProducer {
        let producer = broker.new_producer();
        producer.connect().await.unwrap();
        producer
    }

    #[tokio::test]
    async fn test_produce_and_consume() {
        let broker = InMemoryBroker::default();
        let producer = connected_producer(&broker).await;
        let mut consumer = broker.new_consumer(TOPIC, "test-group-0");
        consumer.connect().await.unwrap();

        for i in 0..3u8 {
            producer.send(TOPIC, Some("key"), vec![i]).await.unwrap();
        }

        let records = consumer.poll(Duration::from_millis(10)).await.unwrap();
        assert_eq!(records.len(), 3);
        assert_eq!(records[2].payload, vec![2]);
        assert_eq!(records[0].key.as_deref(), Some("key"));
        assert_eq!(broker.record_count(TOPIC), 3);
    }

    #[tokio::test]
    async fn test_groups_have_independent_offsets() {
        let broker = InMemoryBroker::default();
        let producer = connected_producer(&broker).await;
        let mut first = broker.new_consumer(TOPIC, "test-group-0");
        let mut second = broker.new_consumer(TOPIC, "test-group-1");
        let mut shared = broker.new_consumer(TOPIC, "test-group-0");
        first.connect().await.unwrap();
        second.connect().await.unwrap();
        shared.connect().await.unwrap();

        for i in 0..4u8 {
            producer.send(TOPIC, None, vec![i]).await.unwrap();
        }

        assert_eq!(first.poll(Duration::ZERO).await.unwrap().len(), 4);
        assert_eq!(second.poll(Duration::ZERO).await.unwrap().len(), 4);
        // Same group as `first`, nothing left.
        assert!(shared.poll(Duration::ZERO).await.unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_poll_waits_for_records() {
        let broker = InMemoryBroker::default();
        let producer = connected_producer(&broker).await;
        let mut consumer = broker.new_consumer(TOPIC, "g");
        consumer.connect().await.unwrap();

        let handle = tokio::spawn(async move { consumer.poll(Duration::from_secs(1)).await });
        tokio::time::sleep(Duration::from_millis(100)).await;
        producer.send(TOPIC, None, b"late".to_vec()).await.unwrap();

        let records = handle.await.unwrap().unwrap();
        assert_eq!(records.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_poll_times_out_empty() {
        let broker = InMemoryBroker::default();
        let mut consumer = broker.new_consumer(TOPIC, "g");
        consumer.connect().await.unwrap();

        let started = tokio::time::Instant::now();
        let records = consumer.poll(Duration::from_millis(250)).await.unwrap();
        assert!(records.is_empty());
        assert!(started.elapsed() >= Duration::from_millis(250));
    }

    #[tokio::test]
    async fn test_fail_every_rejects_deterministically() {
        let broker = InMemoryBroker::new(MemoryBrokerOptions {
            fail_every: Some(3),
            ..Default::default()
        });
        let producer = connected_producer(&broker).await;

        let mut failures = 0;
        for _ in 0..9 {
            if let Err(e) = producer.send(TOPIC, None, vec![0]).await {
                assert!(matches!(e, TransportError::Rejected(_)));
                failures += 1;
            }
        }
        assert_eq!(failures, 3);
        assert_eq!(broker.record_count(TOPIC), 6);
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropped_acks_never_resolve() {
        let broker = InMemoryBroker::new(MemoryBrokerOptions {
            drop_acks: true,
            ..Default::default()
        });
        let producer = connected_producer(&broker).await;

        let ack = producer.send(TOPIC, None, vec![1]);
        assert!(tokio::time::timeout(Duration::from_secs(30), ack)
            .await
            .is_err());
        assert_eq!(broker.record_count(TOPIC), 1);
    }

    #[tokio::test]
    async fn test_offline_broker_refuses_clients() {
        let broker = InMemoryBroker::default();
        broker.set_available(false);

        let producer = broker.new_producer();
        assert!(matches!(
            producer.connect().await,
            Err(TransportError::Unavailable(_))
        ));
        assert!(matches!(
            producer.send(TOPIC, None, vec![]).await,
            Err(TransportError::NotConnected)
        ));

        broker.set_available(true);
        let mut consumer = broker.new_consumer(TOPIC, "g");
        consumer.connect().await.unwrap();
        broker.set_available(false);
        assert!(consumer.poll(Duration::ZERO).await.is_err());
    }
}

use crate::error::{BenchError, TransportError};
use crate::platform::PlatformSpec;
use async_trait::async_trait;
use chrono::{DateTime, Local, NaiveDateTime, SecondsFormat, TimeZone, Utc};
use clap::ValueEnum;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

#[cfg(feature = "kafka")]
pub mod kafka;
pub mod memory;

#[cfg(feature = "kafka")]
pub use kafka::KafkaTransport;
pub use memory::{InMemoryBroker, MemoryBrokerOptions};

/// Completion of one send; resolves once the broker acknowledged or refused
/// the record.
pub type DeliveryFuture = Pin<Box<dyn Future<Output = Result<(), TransportError>> + Send>>;

/// Wire envelope placed around every benchmark payload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    pub id: String,
    /// ISO-8601 origination time, stamped right before the transport hand-off
    pub timestamp: String,
    pub data: EnvelopeData,
}

/// Benchmark payload carried inside an [`Envelope`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnvelopeData {
    pub thread_id: usize,
    pub sequence: u64,
    pub test_data: String,
}

impl Envelope {
    /// Build an envelope stamped with the current time.
    pub fn stamp(thread_id: usize, sequence: u64, test_data: String) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            timestamp: Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true),
            data: EnvelopeData {
                thread_id,
                sequence,
                test_data,
            },
        }
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, TransportError> {
        serde_json::to_vec(self).map_err(|e| TransportError::Codec(e.to_string()))
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, TransportError> {
        serde_json::from_slice(bytes).map_err(|e| TransportError::Codec(e.to_string()))
    }
}

/// Only the part of an envelope the consumer needs for latency.
#[derive(Debug, Deserialize)]
struct EnvelopeHeader {
    timestamp: Option<String>,
}

/// Extract the origination time from an encoded envelope.
///
/// Returns `None` when the payload is not an envelope or its timestamp does
/// not parse. RFC 3339 timestamps are preferred; timestamps without an offset
/// are read as local time.
pub fn origination_time(payload: &[u8]) -> Option<DateTime<Utc>> {
    let header: EnvelopeHeader = serde_json::from_slice(payload).ok()?;
    let raw = header.timestamp?;
    if let Ok(ts) = DateTime::parse_from_rfc3339(&raw) {
        return Some(ts.with_timezone(&Utc));
    }
    let naive = NaiveDateTime::parse_from_str(&raw, "%Y-%m-%dT%H:%M:%S%.f").ok()?;
    Local
        .from_local_datetime(&naive)
        .single()
        .map(|ts| ts.with_timezone(&Utc))
}

/// A record returned by a consumer poll
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsumedRecord {
    pub key: Option<String>,
    pub payload: Vec<u8>,
}

impl ConsumedRecord {
    pub fn size(&self) -> usize {
        self.payload.len()
    }
}

/// Producer side of a broker client.
///
/// Implementations are shared by every producer worker, so all methods take
/// `&self`.
#[async_trait]
pub trait BrokerProducer: Send + Sync {
    /// Establish the client session.
    async fn connect(&self) -> Result<(), TransportError>;

    /// Hand a record to the transport. The returned future resolves on
    /// acknowledgment; dropping it does not cancel the send.
    fn send(&self, topic: &str, key: Option<&str>, payload: Vec<u8>) -> DeliveryFuture;

    /// Wait for records still buffered inside the client.
    async fn flush(&self, timeout: Duration) -> Result<(), TransportError>;

    async fn disconnect(&self);

    /// Get transport name for identification
    fn name(&self) -> &'static str;
}

/// Consumer side of a broker client, owned by a single consumer task.
#[async_trait]
pub trait BrokerConsumer: Send {
    /// Establish the session and subscribe to the topic.
    async fn connect(&mut self) -> Result<(), TransportError>;

    /// Wait up to `timeout` for records; an empty batch is not an error.
    async fn poll(&mut self, timeout: Duration) -> Result<Vec<ConsumedRecord>, TransportError>;

    async fn disconnect(&mut self);

    fn group_id(&self) -> &str;
}

/// Builds broker clients for a platform. The concrete factory is chosen once
/// at configuration time.
pub trait TransportFactory: Send + Sync {
    fn producer(&self, platform: &PlatformSpec) -> Arc<dyn BrokerProducer>;

    fn consumer(
        &self,
        platform: &PlatformSpec,
        topic: &str,
        group_id: &str,
    ) -> Box<dyn BrokerConsumer>;

    fn name(&self) -> &'static str;
}

/// Available transport implementations
#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum, Serialize, Deserialize)]
pub enum TransportKind {
    /// In-process broker, no external platform required
    #[value(name = "memory")]
    Memory,

    /// librdkafka client against a running platform (requires the `kafka` feature)
    #[value(name = "kafka")]
    Kafka,
}

impl TransportKind {
    /// Create the factory for this transport.
    pub fn factory(&self) -> Result<Arc<dyn TransportFactory>, BenchError> {
        match self {
            TransportKind::Memory => Ok(Arc::new(InMemoryBroker::default())),
            #[cfg(feature = "kafka")]
            TransportKind::Kafka => Ok(Arc::new(KafkaTransport::default())),
            #[cfg(not(feature = "kafka"))]
            TransportKind::Kafka => Err(BenchError::Configuration(
                "this build does not include the kafka transport (enable the `kafka` feature)"
                    .to_string(),
            )),
        }
    }

    /// Whether runs on this transport need a real platform lifecycle.
    pub fn needs_platform(&self) -> bool {
        matches!(self, TransportKind::Kafka)
    }
}

impl std::fmt::Display for TransportKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransportKind::Memory => write!(f, "In-Memory Broker"),
            TransportKind::Kafka => write!(f, "Kafka Client"),
        }
    }
}

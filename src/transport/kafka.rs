//! librdkafka-backed transport for real platform runs.
//!
//! Producer settings: `acks=all`, `retries=3`, `batch.size=16384`,
//! `linger.ms=10`. Consumers start from the earliest offset and auto-commit
//! every second.

use super::{
    BrokerConsumer, BrokerProducer, ConsumedRecord, DeliveryFuture, TransportFactory,
};
use crate::error::TransportError;
use crate::platform::PlatformSpec;
use async_trait::async_trait;
use parking_lot::Mutex;
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{Consumer, StreamConsumer};
use rdkafka::error::KafkaError;
use rdkafka::message::Message;
use rdkafka::producer::{FutureProducer, FutureRecord, Producer};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

const METADATA_TIMEOUT: Duration = Duration::from_secs(5);
const MAX_POLL_RECORDS: usize = 500;

fn client_error(e: KafkaError) -> TransportError {
    TransportError::Client(e.to_string())
}

/// Factory for librdkafka clients
#[derive(Clone, Debug)]
pub struct KafkaTransport {
    producer_settings: Vec<(&'static str, &'static str)>,
    consumer_settings: Vec<(&'static str, &'static str)>,
}

impl Default for KafkaTransport {
    fn default() -> Self {
        Self {
            producer_settings: vec![
                ("acks", "all"),
                ("retries", "3"),
                ("batch.size", "16384"),
                ("linger.ms", "10"),
            ],
            consumer_settings: vec![
                ("auto.offset.reset", "earliest"),
                ("enable.auto.commit", "true"),
                ("auto.commit.interval.ms", "1000"),
                ("session.timeout.ms", "30000"),
            ],
        }
    }
}

impl KafkaTransport {
    fn config(bootstrap_servers: &str, settings: &[(&str, &str)]) -> ClientConfig {
        let mut config = ClientConfig::new();
        config.set("bootstrap.servers", bootstrap_servers);
        for (key, value) in settings {
            config.set(*key, *value);
        }
        config
    }
}

impl TransportFactory for KafkaTransport {
    fn producer(&self, platform: &PlatformSpec) -> Arc<dyn BrokerProducer> {
        Arc::new(KafkaProducer {
            config: Self::config(&platform.bootstrap_servers, &self.producer_settings),
            client: Mutex::new(None),
        })
    }

    fn consumer(
        &self,
        platform: &PlatformSpec,
        topic: &str,
        group_id: &str,
    ) -> Box<dyn BrokerConsumer> {
        let mut config = Self::config(&platform.bootstrap_servers, &self.consumer_settings);
        config.set("group.id", group_id);
        Box::new(KafkaConsumer {
            config,
            topic: topic.to_string(),
            group_id: group_id.to_string(),
            client: None,
        })
    }

    fn name(&self) -> &'static str {
        "kafka"
    }
}

/// Producer built on `FutureProducer`
pub struct KafkaProducer {
    config: ClientConfig,
    client: Mutex<Option<FutureProducer>>,
}

#[async_trait]
impl BrokerProducer for KafkaProducer {
    async fn connect(&self) -> Result<(), TransportError> {
        let producer: FutureProducer = self.config.create().map_err(client_error)?;

        // Creating the client does not touch the network; a metadata round
        // trip does.
        let metadata_client = producer.clone();
        tokio::task::spawn_blocking(move || {
            metadata_client
                .client()
                .fetch_metadata(None, METADATA_TIMEOUT)
                .map(|_| ())
        })
        .await
        .map_err(|e| TransportError::Client(e.to_string()))?
        .map_err(|e| TransportError::Unavailable(e.to_string()))?;

        *self.client.lock() = Some(producer);
        Ok(())
    }

    fn send(&self, topic: &str, key: Option<&str>, payload: Vec<u8>) -> DeliveryFuture {
        let Some(producer) = self.client.lock().clone() else {
            return Box::pin(std::future::ready(Err(TransportError::NotConnected)));
        };

        let mut record = FutureRecord::<str, [u8]>::to(topic).payload(payload.as_slice());
        if let Some(key) = key {
            record = record.key(key);
        }

        match producer.send_result(record) {
            Ok(delivery) => Box::pin(async move {
                match delivery.await {
                    Ok(Ok(_)) => Ok(()),
                    Ok(Err((e, _))) => Err(TransportError::Rejected(e.to_string())),
                    Err(_) => Err(TransportError::Client("delivery was canceled".to_string())),
                }
            }),
            Err((e, _)) => {
                let error = TransportError::Unavailable(e.to_string());
                Box::pin(std::future::ready(Err(error)))
            }
        }
    }

    async fn flush(&self, timeout: Duration) -> Result<(), TransportError> {
        let Some(producer) = self.client.lock().clone() else {
            return Ok(());
        };
        tokio::task::spawn_blocking(move || producer.flush(timeout))
            .await
            .map_err(|e| TransportError::Client(e.to_string()))?
            .map_err(|_| TransportError::Timeout(timeout))
    }

    async fn disconnect(&self) {
        let client = self.client.lock().take();
        if let Some(producer) = client {
            let flush_timeout = Duration::from_secs(10);
            let result = tokio::task::spawn_blocking(move || producer.flush(flush_timeout)).await;
            if !matches!(result, Ok(Ok(()))) {
                warn!("Producer did not flush cleanly on disconnect");
            }
        }
    }

    fn name(&self) -> &'static str {
        "kafka"
    }
}

/// Consumer built on `StreamConsumer`
pub struct KafkaConsumer {
    config: ClientConfig,
    topic: String,
    group_id: String,
    client: Option<StreamConsumer>,
}

#[async_trait]
impl BrokerConsumer for KafkaConsumer {
    async fn connect(&mut self) -> Result<(), TransportError> {
        let consumer: StreamConsumer = self.config.create().map_err(client_error)?;
        consumer
            .subscribe(&[self.topic.as_str()])
            .map_err(client_error)?;
        debug!("Consumer {} subscribed to {}", self.group_id, self.topic);
        self.client = Some(consumer);
        Ok(())
    }

    async fn poll(&mut self, timeout: Duration) -> Result<Vec<ConsumedRecord>, TransportError> {
        let Some(consumer) = self.client.as_ref() else {
            return Err(TransportError::NotConnected);
        };

        let mut records = Vec::new();
        // The first record may take up to `timeout`; the rest of the batch is
        // whatever is already buffered.
        let mut wait = timeout;
        while records.len() < MAX_POLL_RECORDS {
            match tokio::time::timeout(wait, consumer.recv()).await {
                Ok(Ok(message)) => records.push(ConsumedRecord {
                    key: message
                        .key()
                        .map(|k| String::from_utf8_lossy(k).into_owned()),
                    payload: message.payload().map(<[u8]>::to_vec).unwrap_or_default(),
                }),
                Ok(Err(e)) if records.is_empty() => {
                    return Err(TransportError::Unavailable(e.to_string()))
                }
                Ok(Err(e)) => {
                    warn!("Consumer {} receive failed: {}", self.group_id, e);
                    break;
                }
                Err(_) => break,
            }
            wait = Duration::ZERO;
        }
        Ok(records)
    }

    async fn disconnect(&mut self) {
        if let Some(consumer) = self.client.take() {
            consumer.unsubscribe();
        }
    }

    fn group_id(&self) -> &str {
        &self.group_id
    }
}

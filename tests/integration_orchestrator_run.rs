use anyhow::Result;
use async_trait::async_trait;
use broker_benchmark::{
    config::{DeliveryMode, OrchestratorTimings, RunConfiguration},
    monitor::NoopMonitor,
    orchestrator::{BenchmarkOrchestrator, RunPhase},
    platform::{LocalLifecycle, PlatformLifecycle, PlatformRegistry, PlatformSpec},
    results::ResultsManager,
    transport::{
        BrokerConsumer, BrokerProducer, InMemoryBroker, MemoryBrokerOptions, TransportFactory,
    },
    BenchError, PlatformId,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

/// Lifecycle whose readiness never succeeds, counting teardowns.
struct NeverReady {
    stops: Arc<AtomicUsize>,
}

#[async_trait]
impl PlatformLifecycle for NeverReady {
    async fn start(&self, _platform: &PlatformSpec) -> bool {
        true
    }

    async fn stop(&self, _platform: &PlatformSpec) -> bool {
        self.stops.fetch_add(1, Ordering::SeqCst);
        true
    }

    async fn is_ready(&self, _bootstrap_servers: &str) -> bool {
        false
    }
}

/// Producers on one broker, consumers on another.
struct SplitTransport {
    producers: InMemoryBroker,
    consumers: InMemoryBroker,
}

impl TransportFactory for SplitTransport {
    fn producer(&self, platform: &PlatformSpec) -> Arc<dyn BrokerProducer> {
        self.producers.producer(platform)
    }

    fn consumer(
        &self,
        platform: &PlatformSpec,
        topic: &str,
        group_id: &str,
    ) -> Box<dyn BrokerConsumer> {
        self.consumers.consumer(platform, topic, group_id)
    }

    fn name(&self) -> &'static str {
        "split"
    }
}

fn timings() -> OrchestratorTimings {
    OrchestratorTimings {
        settle: Duration::from_millis(500),
        drain: Duration::from_secs(1),
        consumer_grace: Duration::from_secs(2),
        flush_timeout: Duration::from_secs(1),
        cooldown: Duration::from_millis(100),
        ..OrchestratorTimings::default()
    }
}

fn orchestrator(
    dir: &TempDir,
    broker: InMemoryBroker,
    registry: PlatformRegistry,
    lifecycle: Box<dyn PlatformLifecycle>,
) -> Result<BenchmarkOrchestrator> {
    Ok(BenchmarkOrchestrator::new(
        registry,
        lifecycle,
        Arc::new(broker),
        Box::new(NoopMonitor),
        ResultsManager::new(dir.path())?,
        timings(),
    ))
}

/// A five second run at 50 msg/s with one synchronous worker sends one
/// interval's worth of messages either side of 250, all of them delivered
/// to every consumer.
#[tokio::test(start_paused = true)]
async fn memory_run_meets_target_rate() -> Result<()> {
    let dir = TempDir::new()?;
    let broker = InMemoryBroker::default();
    let mut orchestrator = orchestrator(
        &dir,
        broker.clone(),
        PlatformRegistry::default(),
        Box::new(LocalLifecycle),
    )?;

    let config = RunConfiguration {
        duration_seconds: 5,
        messages_per_second: 50,
        message_size_bytes: 512,
        num_producer_threads: 1,
        num_consumers: 1,
        delivery_mode: DeliveryMode::Sync,
    };
    let result = orchestrator.run_single("kafka", "rate", &config).await?;

    let producer = result.producer_stats.as_ref().expect("producer ran");
    assert!(
        (240..=260).contains(&producer.messages_sent),
        "sent {}",
        producer.messages_sent
    );
    assert_eq!(producer.messages_failed, 0);
    assert_eq!(broker.record_count(&result.topic) as u64, producer.messages_sent);

    let consumer = result.first_consumer().expect("one consumer");
    assert_eq!(consumer.messages_consumed, producer.messages_sent);
    assert_eq!(
        consumer.latency_measurements.len() as u64,
        consumer.messages_consumed
    );

    // The persisted document reloads to the same counters.
    let files = std::fs::read_dir(dir.path())?.collect::<std::io::Result<Vec<_>>>()?;
    assert_eq!(files.len(), 1);
    let reloaded = ResultsManager::load_platform_result(files[0].path())?;
    assert_eq!(reloaded.platform, PlatformId::Kafka);
    assert_eq!(
        reloaded.producer_stats.map(|p| p.messages_sent),
        Some(producer.messages_sent)
    );
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn readiness_timeout_skips_traffic_and_tears_down() -> Result<()> {
    let dir = TempDir::new()?;
    let stops = Arc::new(AtomicUsize::new(0));
    let registry = PlatformRegistry::default().with_readiness_timeout(Duration::from_secs(3));
    let mut orchestrator = orchestrator(
        &dir,
        InMemoryBroker::default(),
        registry,
        Box::new(NeverReady {
            stops: stops.clone(),
        }),
    )?;

    let err = orchestrator
        .run_single("redpanda", "unreachable", &RunConfiguration::default())
        .await
        .unwrap_err();

    assert!(
        matches!(err, BenchError::ReadinessTimeout { waited, .. } if waited >= Duration::from_secs(3))
    );
    assert!(err.is_connection_error());
    assert_eq!(
        orchestrator.phase_log(),
        &[RunPhase::PlatformStarting, RunPhase::Idle]
    );
    assert_eq!(stops.load(Ordering::SeqCst), 1);

    // The failed run is still on disk, carrying the error.
    let files = std::fs::read_dir(dir.path())?.collect::<std::io::Result<Vec<_>>>()?;
    assert_eq!(files.len(), 1);
    let saved = ResultsManager::load_platform_result(files[0].path())?;
    assert!(saved.producer_stats.is_none());
    assert!(saved.consumer_stats.is_empty());
    assert!(saved.errors.iter().any(|e| e.contains("ready")));
    Ok(())
}

/// Async delivery with acknowledgments that never arrive: the records reach
/// the broker and the consumers, but none of them count as sent.
#[tokio::test(start_paused = true)]
async fn async_run_with_lost_acks_counts_bytes_only() -> Result<()> {
    let dir = TempDir::new()?;
    let broker = InMemoryBroker::new(MemoryBrokerOptions {
        drop_acks: true,
        ..Default::default()
    });
    let mut orchestrator = orchestrator(
        &dir,
        broker.clone(),
        PlatformRegistry::default(),
        Box::new(LocalLifecycle),
    )?;

    let config = RunConfiguration {
        duration_seconds: 2,
        messages_per_second: 20,
        message_size_bytes: 256,
        num_producer_threads: 1,
        num_consumers: 2,
        delivery_mode: DeliveryMode::Async,
    };
    let result = orchestrator
        .run_single("kafka-kraft", "lost_acks", &config)
        .await?;

    let producer = result.producer_stats.as_ref().expect("producer ran");
    assert_eq!(producer.messages_sent, 0);
    assert_eq!(producer.messages_failed, 0);
    assert!(producer.bytes_sent > 0);

    let delivered = broker.record_count(&result.topic) as u64;
    assert!(delivered > 0);
    for consumer in &result.consumer_stats {
        assert_eq!(consumer.messages_consumed, delivered);
    }
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn consumer_connect_failures_are_recorded_not_raised() -> Result<()> {
    let dir = TempDir::new()?;
    let producers = InMemoryBroker::default();
    let consumers = InMemoryBroker::default();
    consumers.set_available(false);
    let mut orchestrator = BenchmarkOrchestrator::new(
        PlatformRegistry::default(),
        Box::new(LocalLifecycle),
        Arc::new(SplitTransport {
            producers: producers.clone(),
            consumers,
        }),
        Box::new(NoopMonitor),
        ResultsManager::new(dir.path())?,
        timings(),
    );

    let config = RunConfiguration {
        duration_seconds: 1,
        messages_per_second: 10,
        num_consumers: 2,
        ..RunConfiguration::default()
    };
    let result = orchestrator.run_single("redpanda", "down", &config).await?;

    let producer = result.producer_stats.as_ref().expect("producer ran");
    assert!(producer.messages_sent > 0);
    assert_eq!(producers.record_count(&result.topic) as u64, producer.messages_sent);
    assert!(result.consumer_stats.is_empty());
    assert!(result.first_consumer().is_none());
    for index in 0..2 {
        let expected = format!("Failed to connect consumer {}", index);
        assert!(result.errors.contains(&expected), "{:?}", result.errors);
    }
    assert_eq!(orchestrator.phase(), RunPhase::Idle);
    Ok(())
}

/// A broker that never accepts clients fails readiness even though the
/// deployment itself reports ready.
#[tokio::test(start_paused = true)]
async fn broker_refusing_clients_is_not_ready() -> Result<()> {
    let dir = TempDir::new()?;
    let broker = InMemoryBroker::default();
    broker.set_available(false);
    let registry = PlatformRegistry::default().with_readiness_timeout(Duration::from_secs(4));
    let mut orchestrator = orchestrator(&dir, broker.clone(), registry, Box::new(LocalLifecycle))?;

    let err = orchestrator
        .run_single("kafka", "refused", &RunConfiguration::default())
        .await
        .unwrap_err();

    assert!(
        matches!(err, BenchError::ReadinessTimeout { waited, .. } if waited >= Duration::from_secs(4))
    );
    assert!(broker.topics().is_empty());
    assert_eq!(
        orchestrator.phase_log(),
        &[RunPhase::PlatformStarting, RunPhase::Idle]
    );
    Ok(())
}

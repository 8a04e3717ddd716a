//! # Benchmark Orchestrator
//!
//! Runs the benchmark against one platform at a time and assembles the
//! results into [`PlatformResult`]s and [`ComparisonResult`]s.
//!
//! ## Run Phases
//!
//! ```text
//! Idle → PlatformStarting → PlatformReady → ConsumersStarting
//!      → ProducerRunning → Draining → Finalizing → Idle
//! ```
//!
//! - **PlatformStarting**: start the deployment and poll its readiness until
//!   the platform's readiness bound; exceeding it is a fatal
//!   [`BenchError::ReadinessTimeout`]. A platform is ready once the lifecycle
//!   reports it up and a producer client of the transport can connect.
//! - **ConsumersStarting**: one consumer task per configured consumer, group
//!   `test-group-<i>`, each consuming for the run duration plus a grace
//!   period.
//! - **ProducerRunning**: after the settle delay, the producer runs to
//!   completion while consumers keep polling in the background.
//! - **Draining**: wait for consumers to catch up, then stop them and join
//!   each with a bounded timeout.
//! - **Finalizing**: stop resource sampling, persist the result and the raw
//!   resource samples.
//!
//! Platform teardown runs after every run, whether it succeeded or not.
//! Comparisons repeat the cycle for each platform sequentially with a
//! cool-down in between.

use crate::comparison::{ComparisonEngine, Improvement};
use crate::config::{OrchestratorTimings, RunConfiguration, TestProfile};
use crate::consumer::LatencyTrackingConsumer;
use crate::error::{BenchError, Result};
use crate::monitor::ResourceMonitor;
use crate::platform::{PlatformId, PlatformLifecycle, PlatformRegistry, PlatformSpec};
use crate::producer::{ProducerTimeouts, ProgressCallback, RateLimitedProducer};
use crate::results::{ComparisonResult, PlatformOutcome, PlatformResult, ResultsManager};
use crate::stats::{ConsumerStats, ProducerStats};
use crate::transport::TransportFactory;
use crate::utils::{format_duration, topic_name, StopHandle};
use chrono::Utc;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

/// Phase of a single platform run
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RunPhase {
    Idle,
    PlatformStarting,
    PlatformReady,
    ConsumersStarting,
    ProducerRunning,
    Draining,
    Finalizing,
}

impl std::fmt::Display for RunPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            RunPhase::Idle => "idle",
            RunPhase::PlatformStarting => "platform starting",
            RunPhase::PlatformReady => "platform ready",
            RunPhase::ConsumersStarting => "consumers starting",
            RunPhase::ProducerRunning => "producer running",
            RunPhase::Draining => "draining",
            RunPhase::Finalizing => "finalizing",
        };
        write!(f, "{}", name)
    }
}

/// A consumer running in the background of a platform run
struct ConsumerTask {
    index: usize,
    stop: StopHandle,
    handle: JoinHandle<ConsumerStats>,
}

/// Drives platform runs and comparisons.
pub struct BenchmarkOrchestrator {
    registry: PlatformRegistry,
    lifecycle: Box<dyn PlatformLifecycle>,
    transport: Arc<dyn TransportFactory>,
    monitor: Box<dyn ResourceMonitor>,
    results: ResultsManager,
    timings: OrchestratorTimings,
    improvement: Improvement,
    progress: Option<ProgressCallback>,
    phase: RunPhase,
    phase_log: Vec<RunPhase>,
}

impl BenchmarkOrchestrator {
    pub fn new(
        registry: PlatformRegistry,
        lifecycle: Box<dyn PlatformLifecycle>,
        transport: Arc<dyn TransportFactory>,
        monitor: Box<dyn ResourceMonitor>,
        results: ResultsManager,
        timings: OrchestratorTimings,
    ) -> Self {
        Self {
            registry,
            lifecycle,
            transport,
            monitor,
            results,
            timings,
            improvement: Improvement::default(),
            progress: None,
            phase: RunPhase::Idle,
            phase_log: Vec::new(),
        }
    }

    /// Which relative gain three-way comparisons report.
    pub fn with_improvement(mut self, improvement: Improvement) -> Self {
        self.improvement = improvement;
        self
    }

    /// Forward producer throughput samples to `callback`.
    pub fn with_progress(mut self, callback: ProgressCallback) -> Self {
        self.progress = Some(callback);
        self
    }

    pub fn registry(&self) -> &PlatformRegistry {
        &self.registry
    }

    pub fn timings(&self) -> &OrchestratorTimings {
        &self.timings
    }

    pub fn phase(&self) -> RunPhase {
        self.phase
    }

    /// Every phase entered since the orchestrator was created, in order.
    pub fn phase_log(&self) -> &[RunPhase] {
        &self.phase_log
    }

    fn enter(&mut self, phase: RunPhase) {
        debug!("Phase {} -> {}", self.phase, phase);
        self.phase = phase;
        self.phase_log.push(phase);
    }

    /// Run one test against one platform.
    ///
    /// ## Parameters
    /// - `platform`: platform name as accepted on the command line
    /// - `test_name`: label used in the topic, the result and its file name
    /// - `config`: workload, validated before anything is started
    ///
    /// ## Returns
    /// - `Ok(PlatformResult)`: the persisted result; send, consume and
    ///   connect failures of individual clients are recorded in its stats
    ///   and `errors`
    /// - `Err(BenchError)`: configuration errors (nothing was started) or a
    ///   platform that could not be started or never became ready
    pub async fn run_single(
        &mut self,
        platform: &str,
        test_name: &str,
        config: &RunConfiguration,
    ) -> Result<PlatformResult> {
        config.validate()?;
        let spec = self.registry.resolve(platform)?.clone();
        self.run_platform(&spec, test_name, config).await
    }

    /// Run one test against two platforms and compare them.
    ///
    /// Ties in the comparison go to `second`.
    pub async fn run_comparison(
        &mut self,
        test_name: &str,
        config: &RunConfiguration,
        first: PlatformId,
        second: PlatformId,
    ) -> Result<ComparisonResult> {
        self.run_many(test_name, config, &[first, second], None)
            .await
    }

    /// Run one test against all three platforms, compare them and report
    /// the configured relative gain.
    pub async fn run_three_way(
        &mut self,
        test_name: &str,
        config: &RunConfiguration,
    ) -> Result<ComparisonResult> {
        let improvement = self.improvement;
        self.run_many(test_name, config, &PlatformId::ALL, Some(improvement))
            .await
    }

    /// Run a Kafka versus Redpanda comparison for every profile.
    ///
    /// A profile that fails does not stop the suite; its error is returned
    /// in its slot.
    pub async fn run_all(
        &mut self,
        profiles: &[TestProfile],
    ) -> Vec<(String, Result<ComparisonResult>)> {
        let mut outcomes = Vec::with_capacity(profiles.len());
        for profile in profiles {
            info!("Running test profile {}", profile.name);
            let outcome = self
                .run_comparison(
                    profile.name,
                    &profile.config,
                    PlatformId::Kafka,
                    PlatformId::Redpanda,
                )
                .await;
            if let Err(e) = &outcome {
                error!("Failed to run test {}: {}", profile.name, e);
            }
            outcomes.push((profile.name.to_string(), outcome));
        }
        outcomes
    }

    /// Start a platform and wait until it is ready, without running a test.
    pub async fn start_platform(&mut self, platform: &str) -> Result<()> {
        let spec = self.registry.resolve(platform)?.clone();
        if !self.lifecycle.start(&spec).await {
            return Err(start_failure(&spec));
        }
        self.wait_until_ready(&spec).await
    }

    /// Tear a platform down. Returns false when teardown reported failure.
    pub async fn stop_platform(&mut self, platform: &str) -> Result<bool> {
        let spec = self.registry.resolve(platform)?.clone();
        Ok(self.lifecycle.stop(&spec).await)
    }

    async fn run_many(
        &mut self,
        test_name: &str,
        config: &RunConfiguration,
        platforms: &[PlatformId],
        improvement: Option<Improvement>,
    ) -> Result<ComparisonResult> {
        config.validate()?;
        if let Some(duplicate) = platforms
            .iter()
            .enumerate()
            .find_map(|(i, id)| platforms[..i].contains(id).then_some(id))
        {
            return Err(BenchError::Configuration(format!(
                "{} is listed more than once",
                duplicate
            )));
        }
        let specs = platforms
            .iter()
            .map(|id| self.registry.get(*id).cloned())
            .collect::<Result<Vec<_>>>()?;

        let mut comparison = ComparisonResult::new(test_name);
        for (i, spec) in specs.iter().enumerate() {
            if i > 0 {
                info!("Cooling down for {:?} before the next platform", self.timings.cooldown);
                tokio::time::sleep(self.timings.cooldown).await;
            }

            let outcome = match self.run_platform(spec, test_name, config).await {
                Ok(result) => PlatformOutcome::from(result),
                Err(e) => {
                    error!("{} run failed: {}", spec.id, e);
                    PlatformOutcome::failed(e.to_string())
                }
            };
            comparison.insert(spec.id, outcome);
        }

        let report = {
            let entries = platforms
                .iter()
                .map(|id| (*id, comparison.platform_result(*id)))
                .collect::<Vec<_>>();
            ComparisonEngine::compare(&entries, improvement)
        };
        comparison.comparison = report;
        comparison.finalize();
        self.results.save_comparison(&comparison)?;
        Ok(comparison)
    }

    async fn run_platform(
        &mut self,
        spec: &PlatformSpec,
        test_name: &str,
        config: &RunConfiguration,
    ) -> Result<PlatformResult> {
        info!("Running {} against {}", test_name, spec.id);
        let topic = topic_name(spec.id.key(), test_name, Utc::now().timestamp());
        let mut result = PlatformResult::new(spec.id, test_name, config.clone(), topic);

        let outcome = self.execute(spec, config, &mut result).await;
        self.teardown(spec).await;
        self.enter(RunPhase::Idle);

        match outcome {
            Ok(()) => Ok(result),
            Err(e) => {
                result.record_error(e.to_string());
                // Failed runs are persisted too, with the error that ended them.
                result.finalize();
                if let Err(save_error) = self.results.save_platform_result(&result) {
                    warn!("Failed to save the result of the failed run: {}", save_error);
                }
                Err(e)
            }
        }
    }

    async fn execute(
        &mut self,
        spec: &PlatformSpec,
        config: &RunConfiguration,
        result: &mut PlatformResult,
    ) -> Result<()> {
        self.enter(RunPhase::PlatformStarting);
        if !self.lifecycle.start(spec).await {
            return Err(start_failure(spec));
        }
        self.wait_until_ready(spec).await?;
        self.enter(RunPhase::PlatformReady);

        self.monitor
            .start_sampling(self.timings.sampling_interval, Some(spec.container_name.as_str()))
            .await;
        self.run_traffic(spec, config, result).await;

        self.enter(RunPhase::Finalizing);
        let metrics = self.monitor.stop_sampling().await;
        result.system_metrics = metrics.as_ref().map(|m| m.summary.clone());
        result.finalize();
        self.results.save_run(result, metrics.as_ref())?;

        log_summary(result);
        Ok(())
    }

    /// Consumers, producer and drain. Client failures are recorded in
    /// `result`, and every started consumer is stopped and joined before
    /// this returns.
    async fn run_traffic(
        &mut self,
        spec: &PlatformSpec,
        config: &RunConfiguration,
        result: &mut PlatformResult,
    ) {
        self.enter(RunPhase::ConsumersStarting);
        let consumers = self.start_consumers(spec, config, result).await;

        tokio::time::sleep(self.timings.settle).await;

        self.enter(RunPhase::ProducerRunning);
        result.producer_stats = self.run_producer(spec, config, result).await;

        self.enter(RunPhase::Draining);
        tokio::time::sleep(self.timings.drain).await;
        result.consumer_stats = self.stop_consumers(consumers, result).await;

        if config.num_consumers > 0 && result.first_consumer().is_none() {
            warn!(
                "{}: consumer 0 produced no statistics, consumer metrics will not be compared",
                spec.id
            );
        }
    }

    /// Poll readiness until it succeeds or the platform's bound elapses.
    async fn wait_until_ready(&self, spec: &PlatformSpec) -> Result<()> {
        info!(
            "Waiting for {} to be ready at {} (up to {})",
            spec.id,
            spec.bootstrap_servers,
            format_duration(spec.readiness_timeout)
        );
        let started = Instant::now();
        let deadline = started + spec.readiness_timeout;

        loop {
            if self.lifecycle.is_ready(&spec.bootstrap_servers).await
                && self.client_connects(spec).await
            {
                info!("{} is ready after {}", spec.id, format_duration(started.elapsed()));
                return Ok(());
            }

            let now = Instant::now();
            if now >= deadline {
                error!("{} failed to become ready", spec.id);
                return Err(BenchError::ReadinessTimeout {
                    platform: spec.id.to_string(),
                    waited: now - started,
                });
            }
            tokio::time::sleep(self.timings.readiness_poll_interval.min(deadline - now)).await;
        }
    }

    /// Whether a producer client of the transport can reach the platform.
    async fn client_connects(&self, spec: &PlatformSpec) -> bool {
        let client = self.transport.producer(spec);
        match client.connect().await {
            Ok(()) => {
                client.disconnect().await;
                true
            }
            Err(e) => {
                debug!("{} does not accept clients yet: {}", spec.id, e);
                false
            }
        }
    }

    async fn start_consumers(
        &self,
        spec: &PlatformSpec,
        config: &RunConfiguration,
        result: &mut PlatformResult,
    ) -> Vec<ConsumerTask> {
        let run_for = config.duration() + self.timings.consumer_grace;
        let mut tasks = Vec::with_capacity(config.num_consumers);

        for index in 0..config.num_consumers {
            let group_id = format!("test-group-{}", index);
            let client = self.transport.consumer(spec, &result.topic, &group_id);
            let mut consumer = LatencyTrackingConsumer::new(client)
                .with_index(index)
                .with_poll_timeout(self.timings.poll_timeout)
                .with_sampling_interval(self.timings.sampling_interval);

            if !consumer.connect().await {
                result.record_error(format!("Failed to connect consumer {}", index));
                continue;
            }

            let stop = consumer.stop_handle();
            let handle = tokio::spawn(async move {
                let stats = consumer.consume_messages(run_for).await;
                consumer.disconnect().await;
                stats
            });
            debug!("Started consumer {} in group {}", index, group_id);
            tasks.push(ConsumerTask {
                index,
                stop,
                handle,
            });
        }
        tasks
    }

    async fn run_producer(
        &self,
        spec: &PlatformSpec,
        config: &RunConfiguration,
        result: &mut PlatformResult,
    ) -> Option<ProducerStats> {
        let client = self.transport.producer(spec);
        let mut producer = RateLimitedProducer::new(client, result.topic.clone())
            .with_timeouts(ProducerTimeouts::from(&self.timings));
        if let Some(callback) = &self.progress {
            producer = producer.with_progress(callback.clone());
        }

        if !producer.connect().await {
            result.record_error("Failed to connect producer");
            return None;
        }

        info!(
            "Producing {} msg/s of {} bytes for {}s ({} mode)",
            config.messages_per_second,
            config.message_size_bytes,
            config.duration_seconds,
            config.delivery_mode
        );
        let stats = producer.run_load_test(config).await;
        producer.disconnect().await;
        Some(stats)
    }

    /// Stop every consumer, then join each one within the join bound.
    ///
    /// A consumer that does not finish in time is abandoned: its task keeps
    /// running detached and its statistics are lost.
    async fn stop_consumers(
        &self,
        tasks: Vec<ConsumerTask>,
        result: &mut PlatformResult,
    ) -> Vec<ConsumerStats> {
        for task in &tasks {
            task.stop.stop();
        }

        let mut stats = Vec::with_capacity(tasks.len());
        for task in tasks {
            match tokio::time::timeout(self.timings.consumer_join_timeout, task.handle).await {
                Ok(Ok(consumer_stats)) => stats.push(consumer_stats),
                Ok(Err(e)) => {
                    error!("Consumer {} task failed: {}", task.index, e);
                    result.record_error(format!("Consumer {} task failed: {}", task.index, e));
                }
                Err(_) => {
                    warn!(
                        "Consumer {} did not stop within {:?}, abandoning it",
                        task.index, self.timings.consumer_join_timeout
                    );
                    result.record_error(format!(
                        "Consumer {} did not stop within {:?}",
                        task.index, self.timings.consumer_join_timeout
                    ));
                }
            }
        }
        stats
    }

    async fn teardown(&self, spec: &PlatformSpec) {
        if !self.lifecycle.stop(spec).await {
            warn!("Teardown of {} reported failure", spec.id);
        }
    }
}

fn start_failure(spec: &PlatformSpec) -> BenchError {
    BenchError::Connection {
        platform: spec.id.to_string(),
        reason: format!("failed to start {}", spec.id),
    }
}

fn log_summary(result: &PlatformResult) {
    if let Some(producer) = &result.producer_stats {
        info!(
            "{}: sent {} ({} failed), {:.2} msg/s, {:.2} MB/s",
            result.platform,
            producer.messages_sent,
            producer.messages_failed,
            producer.average_throughput,
            producer.average_bandwidth_mbps
        );
    }
    for consumer in &result.consumer_stats {
        info!(
            "{}: consumer {} received {}, avg latency {:.2}ms",
            result.platform,
            consumer.consumer_index,
            consumer.messages_consumed,
            consumer.latency_avg_ms
        );
    }
    if !result.errors.is_empty() {
        warn!("{}: {} run errors recorded", result.platform, result.errors.len());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::monitor::{MetricsRecord, NoopMonitor};
    use crate::platform::LocalLifecycle;
    use crate::transport::InMemoryBroker;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tempfile::TempDir;

    /// Monitor that only counts how often sampling is stopped.
    struct CountingMonitor {
        stops: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl ResourceMonitor for CountingMonitor {
        async fn start_sampling(&mut self, _interval: Duration, _container: Option<&str>) {}

        async fn stop_sampling(&mut self) -> Option<MetricsRecord> {
            self.stops.fetch_add(1, Ordering::SeqCst);
            None
        }
    }

    fn quick_timings() -> OrchestratorTimings {
        OrchestratorTimings {
            settle: Duration::from_millis(200),
            drain: Duration::from_millis(500),
            consumer_grace: Duration::from_secs(2),
            cooldown: Duration::from_millis(100),
            ..OrchestratorTimings::default()
        }
    }

    fn orchestrator(dir: &TempDir, broker: InMemoryBroker) -> BenchmarkOrchestrator {
        BenchmarkOrchestrator::new(
            PlatformRegistry::default(),
            Box::new(LocalLifecycle),
            Arc::new(broker),
            Box::new(NoopMonitor),
            ResultsManager::new(dir.path()).unwrap(),
            quick_timings(),
        )
    }

    fn small_config() -> RunConfiguration {
        RunConfiguration {
            duration_seconds: 2,
            messages_per_second: 20,
            message_size_bytes: 200,
            num_producer_threads: 1,
            num_consumers: 2,
            ..RunConfiguration::default()
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_single_walks_every_phase() {
        let dir = TempDir::new().unwrap();
        let mut orchestrator = orchestrator(&dir, InMemoryBroker::default());

        let result = orchestrator
            .run_single("redpanda", "unit", &small_config())
            .await
            .unwrap();

        assert_eq!(
            orchestrator.phase_log(),
            &[
                RunPhase::PlatformStarting,
                RunPhase::PlatformReady,
                RunPhase::ConsumersStarting,
                RunPhase::ProducerRunning,
                RunPhase::Draining,
                RunPhase::Finalizing,
                RunPhase::Idle,
            ]
        );
        assert_eq!(orchestrator.phase(), RunPhase::Idle);
        assert_eq!(result.platform, PlatformId::Redpanda);
        assert!(result.topic.starts_with("perf-test-redpanda-unit-"));
        assert!(result.end_time.is_some());
        assert!(result.system_metrics.is_none());

        let producer = result.producer_stats.as_ref().unwrap();
        assert_eq!(result.consumer_stats.len(), 2);
        assert_eq!(
            result
                .consumer_stats
                .iter()
                .map(|c| c.consumer_index)
                .collect::<Vec<_>>(),
            vec![0, 1]
        );
        // Distinct groups each see every record.
        for consumer in &result.consumer_stats {
            assert_eq!(consumer.messages_consumed, producer.messages_sent);
        }
        assert!(result.errors.is_empty(), "{:?}", result.errors);
    }

    #[tokio::test(start_paused = true)]
    async fn test_configuration_errors_precede_any_phase() {
        let dir = TempDir::new().unwrap();
        let mut orchestrator = orchestrator(&dir, InMemoryBroker::default());

        let err = orchestrator
            .run_single("rabbitmq", "unit", &small_config())
            .await
            .unwrap_err();
        assert!(matches!(err, BenchError::UnknownPlatform(_)));

        let invalid = RunConfiguration {
            messages_per_second: 0,
            ..small_config()
        };
        let err = orchestrator
            .run_single("kafka", "unit", &invalid)
            .await
            .unwrap_err();
        assert!(err.is_configuration_error());
        assert!(orchestrator.phase_log().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_comparison_records_both_platforms() {
        let dir = TempDir::new().unwrap();
        let mut orchestrator = orchestrator(&dir, InMemoryBroker::default());

        let comparison = orchestrator
            .run_comparison("unit", &small_config(), PlatformId::Kafka, PlatformId::Redpanda)
            .await
            .unwrap();

        assert!(comparison.platform_result(PlatformId::Kafka).is_some());
        assert!(comparison.platform_result(PlatformId::Redpanda).is_some());
        assert!(comparison.comparison.producer.is_some());
        assert!(comparison.comparison.consumer.is_some());
        assert!(comparison.comparison.resources.is_none());
        assert!(comparison.end_time.is_some());

        // Two single-run files plus the comparison document.
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_and_stop_platform() {
        let dir = TempDir::new().unwrap();
        let mut orchestrator = orchestrator(&dir, InMemoryBroker::default());

        orchestrator.start_platform("kafka-kraft").await.unwrap();
        assert!(orchestrator.stop_platform("kraft").await.unwrap());
        assert!(orchestrator.start_platform("zookeeper").await.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_readiness_waits_for_a_client_connection() {
        let dir = TempDir::new().unwrap();
        let broker = InMemoryBroker::default();
        broker.set_available(false);
        let mut orchestrator = orchestrator(&dir, broker.clone());

        // The lifecycle reports ready at once; the broker only accepts
        // clients three seconds later.
        let booting = broker.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(3)).await;
            booting.set_available(true);
        });

        let started = Instant::now();
        let result = orchestrator
            .run_single("kafka", "unit", &small_config())
            .await
            .unwrap();

        assert!(started.elapsed() >= Duration::from_secs(3));
        assert!(result.errors.is_empty(), "{:?}", result.errors);
        assert!(result.producer_stats.unwrap().messages_sent > 0);
        assert_eq!(result.consumer_stats.len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unreachable_broker_times_out_readiness() {
        let dir = TempDir::new().unwrap();
        let broker = InMemoryBroker::default();
        broker.set_available(false);
        let mut orchestrator = BenchmarkOrchestrator::new(
            PlatformRegistry::default().with_readiness_timeout(Duration::from_secs(5)),
            Box::new(LocalLifecycle),
            Arc::new(broker.clone()),
            Box::new(NoopMonitor),
            ResultsManager::new(dir.path()).unwrap(),
            quick_timings(),
        );

        let err = orchestrator
            .run_single("redpanda", "unit", &small_config())
            .await
            .unwrap_err();

        assert!(matches!(err, BenchError::ReadinessTimeout { .. }), "{}", err);
        assert_eq!(
            orchestrator.phase_log(),
            &[RunPhase::PlatformStarting, RunPhase::Idle]
        );
        assert!(broker.topics().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_duplicate_platforms_are_rejected() {
        let dir = TempDir::new().unwrap();
        let mut orchestrator = orchestrator(&dir, InMemoryBroker::default());

        let err = orchestrator
            .run_comparison("unit", &small_config(), PlatformId::Kafka, PlatformId::Kafka)
            .await
            .unwrap_err();

        assert!(err.is_configuration_error(), "{}", err);
        assert!(err.to_string().contains("more than once"));
        assert!(orchestrator.phase_log().is_empty());
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_save_stops_sampling_once() {
        let dir = TempDir::new().unwrap();
        let results_dir = dir.path().join("results");
        let stops = Arc::new(AtomicUsize::new(0));
        let mut orchestrator = BenchmarkOrchestrator::new(
            PlatformRegistry::default(),
            Box::new(LocalLifecycle),
            Arc::new(InMemoryBroker::default()),
            Box::new(CountingMonitor {
                stops: stops.clone(),
            }),
            ResultsManager::new(&results_dir).unwrap(),
            quick_timings(),
        );

        // The results directory disappears while traffic is running.
        let doomed = results_dir.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            std::fs::remove_dir_all(doomed).unwrap();
        });

        let err = orchestrator
            .run_single("kafka", "unit", &small_config())
            .await
            .unwrap_err();

        assert!(matches!(err, BenchError::Io(_)), "{}", err);
        assert_eq!(stops.load(Ordering::SeqCst), 1);
        assert_eq!(
            &orchestrator.phase_log()[orchestrator.phase_log().len() - 2..],
            &[RunPhase::Finalizing, RunPhase::Idle]
        );
    }
}

//! # Broker Benchmark Library
//!
//! A benchmark driver for message-broker platforms that speak the same wire
//! protocol (Kafka with ZooKeeper, Kafka in KRaft mode, Redpanda). It runs a
//! rate-controlled producer and latency-tracking consumers against one
//! platform at a time and derives comparable throughput, latency and
//! resource figures.
//!
//! ## Architecture Overview
//!
//! - `producer`: rate-limited, multi-worker message producer (`sync` / `async` delivery)
//! - `consumer`: polling consumer measuring end-to-end latency and throughput
//! - `orchestrator`: per-platform lifecycle state machine and comparison runs
//! - `comparison`: pure winner / improvement computation over finished results
//! - `transport`: broker client abstraction with in-memory and Kafka implementations
//! - `platform`: platform registry and lifecycle collaborator
//! - `monitor`: host and broker-container resource sampling collaborator
//! - `results`: serializable result documents and persistence
//!
//! ## Usage Example
//!
//! ```rust,no_run
//! use broker_benchmark::{
//!     config::{OrchestratorTimings, RunConfiguration},
//!     monitor::NoopMonitor,
//!     orchestrator::BenchmarkOrchestrator,
//!     platform::{LocalLifecycle, PlatformRegistry},
//!     results::ResultsManager,
//!     transport::memory::InMemoryBroker,
//! };
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let broker = InMemoryBroker::default();
//!     let mut orchestrator = BenchmarkOrchestrator::new(
//!         PlatformRegistry::default(),
//!         Box::new(LocalLifecycle),
//!         Arc::new(broker),
//!         Box::new(NoopMonitor),
//!         ResultsManager::new("results")?,
//!         OrchestratorTimings::default(),
//!     );
//!
//!     let result = orchestrator
//!         .run_single("redpanda", "smoke", &RunConfiguration::default())
//!         .await?;
//!     println!("{:?}", result.producer_stats.map(|s| s.average_throughput));
//!     Ok(())
//! }
//! ```

pub mod comparison;

/// Command-line interface
///
/// Subcommands mirror the supported run kinds (single platform, two-way and
/// three-way comparison, every profile) plus platform start/stop helpers.
pub mod cli;

pub mod config;
pub mod consumer;
pub mod error;
pub mod logging;
pub mod monitor;

/// Per-platform run lifecycle
///
/// Sequences platform start, readiness, consumer and producer execution,
/// draining and teardown, and runs comparisons across platforms.
pub mod orchestrator;

pub mod platform;
pub mod producer;
pub mod results;
pub mod stats;

/// Broker client abstraction
///
/// The `BrokerProducer` / `BrokerConsumer` traits and the concrete transports
/// selected at configuration time.
pub mod transport;

pub mod utils;

pub use comparison::ComparisonEngine;
pub use config::{DeliveryMode, RunConfiguration};
pub use consumer::LatencyTrackingConsumer;
pub use error::{BenchError, TransportError};
pub use orchestrator::BenchmarkOrchestrator;
pub use platform::PlatformId;
pub use producer::RateLimitedProducer;
pub use results::{ComparisonResult, PlatformResult, ResultsManager};
pub use stats::{ConsumerStats, ProducerStats};

/// The current version of the broker benchmark
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Default configuration values
pub mod defaults {
    use std::time::Duration;

    /// Default message size in bytes, envelope included
    pub const MESSAGE_SIZE: usize = 1024;

    /// Default target rate across all producer workers
    pub const MESSAGES_PER_SECOND: u64 = 100;

    /// Default run duration in seconds
    pub const DURATION_SECONDS: u64 = 60;

    pub const PRODUCER_THREADS: usize = 1;
    pub const CONSUMERS: usize = 1;

    /// Delay between consumers attaching and the producer starting
    pub const SETTLE_DELAY: Duration = Duration::from_secs(2);

    /// Delay between producer completion and stopping consumers
    pub const DRAIN_DELAY: Duration = Duration::from_secs(5);

    /// Extra time consumers run past the producer's duration
    pub const CONSUMER_GRACE: Duration = Duration::from_secs(10);

    pub const CONSUMER_JOIN_TIMEOUT: Duration = Duration::from_secs(10);
    pub const PRODUCER_JOIN_TIMEOUT: Duration = Duration::from_secs(5);

    /// Upper bound on one synchronous acknowledgment
    pub const ACK_TIMEOUT: Duration = Duration::from_secs(10);

    /// Upper bound on waiting for outstanding asynchronous deliveries
    pub const FLUSH_TIMEOUT: Duration = Duration::from_secs(10);

    /// Pause between platforms in a comparison run
    pub const COOLDOWN: Duration = Duration::from_secs(5);

    /// Default readiness bound for a platform
    pub const READINESS_TIMEOUT: Duration = Duration::from_secs(60);

    /// Readiness bound for ZooKeeper-based Kafka, which starts two services
    pub const SLOW_READINESS_TIMEOUT: Duration = Duration::from_secs(90);

    pub const READINESS_POLL_INTERVAL: Duration = Duration::from_secs(1);

    /// Upper bound of one consumer poll, keeps the stop flag responsive
    pub const POLL_TIMEOUT: Duration = Duration::from_secs(1);

    pub const SAMPLING_INTERVAL: Duration = Duration::from_secs(1);

    /// Directory that receives result documents
    pub const RESULTS_DIR: &str = "results";
}

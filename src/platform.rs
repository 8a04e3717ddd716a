//! # Platforms
//!
//! The registry of broker deployments under test and the lifecycle
//! collaborator that starts, stops and checks them.
//!
//! ## Lifecycles
//!
//! - [`ComposeLifecycle`]: one docker-compose file per platform; its readiness
//!   check is a TCP connect to the bootstrap address. The orchestrator also
//!   requires a client connection before it calls the platform ready.
//! - [`LocalLifecycle`]: nothing to start, always ready. Used together with
//!   the in-memory transport.

use crate::defaults;
use crate::error::{BenchError, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::process::Stdio;
use std::str::FromStr;
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, info, warn};

/// Identifier of a supported platform
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlatformId {
    /// Kafka with ZooKeeper consensus
    Kafka,
    /// Kafka in KRaft mode
    KafkaKraft,
    Redpanda,
}

impl PlatformId {
    pub const ALL: [PlatformId; 3] = [
        PlatformId::Kafka,
        PlatformId::KafkaKraft,
        PlatformId::Redpanda,
    ];

    /// Key used in result documents (`<key>_results`, `<key>_msg_per_sec`).
    pub fn key(&self) -> &'static str {
        match self {
            PlatformId::Kafka => "kafka",
            PlatformId::KafkaKraft => "kafka_kraft",
            PlatformId::Redpanda => "redpanda",
        }
    }

    /// Name accepted on the command line.
    pub fn cli_name(&self) -> &'static str {
        match self {
            PlatformId::Kafka => "kafka",
            PlatformId::KafkaKraft => "kafka-kraft",
            PlatformId::Redpanda => "redpanda",
        }
    }

    /// Short label of the consensus layer, used in improvement keys.
    pub fn consensus_label(&self) -> &'static str {
        match self {
            PlatformId::Kafka => "zookeeper",
            PlatformId::KafkaKraft => "kraft",
            PlatformId::Redpanda => "redpanda",
        }
    }
}

impl std::fmt::Display for PlatformId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PlatformId::Kafka => write!(f, "Kafka (ZooKeeper)"),
            PlatformId::KafkaKraft => write!(f, "Kafka (KRaft)"),
            PlatformId::Redpanda => write!(f, "Redpanda"),
        }
    }
}

impl FromStr for PlatformId {
    type Err = BenchError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "kafka" => Ok(PlatformId::Kafka),
            "kafka-kraft" | "kafka_kraft" | "kraft" => Ok(PlatformId::KafkaKraft),
            "redpanda" => Ok(PlatformId::Redpanda),
            _ => Err(BenchError::UnknownPlatform(s.to_string())),
        }
    }
}

/// Deployment details of one platform
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PlatformSpec {
    pub id: PlatformId,
    pub bootstrap_servers: String,
    pub compose_file: String,
    /// Broker container, sampled by the resource monitor
    pub container_name: String,
    /// Upper bound on waiting for the platform to accept connections
    pub readiness_timeout: Duration,
}

/// The set of platforms a run may target.
#[derive(Clone, Debug)]
pub struct PlatformRegistry {
    platforms: Vec<PlatformSpec>,
}

impl Default for PlatformRegistry {
    fn default() -> Self {
        Self {
            platforms: vec![
                PlatformSpec {
                    id: PlatformId::Kafka,
                    bootstrap_servers: "localhost:9092".to_string(),
                    compose_file: "docker-compose.kafka.yml".to_string(),
                    container_name: "kafka-broker".to_string(),
                    // ZooKeeper and the broker start as two services
                    readiness_timeout: defaults::SLOW_READINESS_TIMEOUT,
                },
                PlatformSpec {
                    id: PlatformId::KafkaKraft,
                    bootstrap_servers: "localhost:9094".to_string(),
                    compose_file: "docker-compose.kafka-kraft.yml".to_string(),
                    container_name: "kafka-kraft-broker".to_string(),
                    readiness_timeout: defaults::READINESS_TIMEOUT,
                },
                PlatformSpec {
                    id: PlatformId::Redpanda,
                    bootstrap_servers: "localhost:19092".to_string(),
                    compose_file: "docker-compose.redpanda.yml".to_string(),
                    container_name: "redpanda-broker".to_string(),
                    readiness_timeout: defaults::READINESS_TIMEOUT,
                },
            ],
        }
    }
}

impl PlatformRegistry {
    /// Look up a platform by its command-line or result-key name.
    pub fn resolve(&self, name: &str) -> Result<&PlatformSpec> {
        let id = PlatformId::from_str(name)?;
        self.get(id)
    }

    pub fn get(&self, id: PlatformId) -> Result<&PlatformSpec> {
        self.platforms
            .iter()
            .find(|p| p.id == id)
            .ok_or_else(|| BenchError::UnknownPlatform(id.cli_name().to_string()))
    }

    /// Replace the readiness bound of every platform.
    pub fn with_readiness_timeout(mut self, timeout: Duration) -> Self {
        for platform in &mut self.platforms {
            platform.readiness_timeout = timeout;
        }
        self
    }

    /// Point a platform at a different bootstrap address.
    pub fn with_bootstrap(mut self, id: PlatformId, bootstrap_servers: &str) -> Self {
        if let Some(platform) = self.platforms.iter_mut().find(|p| p.id == id) {
            platform.bootstrap_servers = bootstrap_servers.to_string();
        }
        self
    }

    pub fn iter(&self) -> impl Iterator<Item = &PlatformSpec> {
        self.platforms.iter()
    }
}

/// Starts, stops and checks a platform deployment.
#[async_trait]
pub trait PlatformLifecycle: Send + Sync {
    /// Bring the platform up. Returns false when it could not be started.
    async fn start(&self, platform: &PlatformSpec) -> bool;

    /// Tear the platform down. Returns false when teardown failed.
    async fn stop(&self, platform: &PlatformSpec) -> bool;

    /// Single deployment-level readiness check, polled by the orchestrator
    /// before it tries a client connection.
    async fn is_ready(&self, bootstrap_servers: &str) -> bool;
}

/// Lifecycle backed by one docker-compose file per platform
#[derive(Clone, Debug)]
pub struct ComposeLifecycle {
    project_dir: PathBuf,
    compose_command: String,
    connect_timeout: Duration,
}

impl ComposeLifecycle {
    pub fn new(project_dir: impl Into<PathBuf>) -> Self {
        Self {
            project_dir: project_dir.into(),
            compose_command: "docker-compose".to_string(),
            connect_timeout: Duration::from_secs(1),
        }
    }

    /// Use a different compose executable, e.g. a wrapper script.
    pub fn with_command(mut self, command: impl Into<String>) -> Self {
        self.compose_command = command.into();
        self
    }

    fn compose_path(&self, platform: &PlatformSpec) -> PathBuf {
        self.project_dir.join(&platform.compose_file)
    }

    async fn compose(&self, platform: &PlatformSpec, args: &[&str]) -> std::io::Result<bool> {
        let compose_file = self.compose_path(platform);
        debug!(
            "Running {} -f {} {}",
            self.compose_command,
            compose_file.display(),
            args.join(" ")
        );

        let output = Command::new(&self.compose_command)
            .arg("-f")
            .arg(&compose_file)
            .args(args)
            .current_dir(&self.project_dir)
            .stdin(Stdio::null())
            .output()
            .await?;

        if !output.status.success() {
            warn!(
                "{} {} for {} exited with {}: {}",
                self.compose_command,
                args.join(" "),
                platform.id,
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }
        Ok(output.status.success())
    }
}

#[async_trait]
impl PlatformLifecycle for ComposeLifecycle {
    async fn start(&self, platform: &PlatformSpec) -> bool {
        info!("Starting {}...", platform.id);

        // Leftovers from an earlier run would hold the ports.
        if let Err(e) = self.compose(platform, &["down"]).await {
            warn!("Failed to clean up {} before start: {}", platform.id, e);
        }

        match self.compose(platform, &["up", "-d"]).await {
            Ok(started) => started,
            Err(e) => {
                warn!("Failed to start {}: {}", platform.id, e);
                false
            }
        }
    }

    async fn stop(&self, platform: &PlatformSpec) -> bool {
        info!("Stopping {}...", platform.id);
        match self.compose(platform, &["down"]).await {
            Ok(stopped) => stopped,
            Err(e) => {
                warn!("Failed to stop {}: {}", platform.id, e);
                false
            }
        }
    }

    async fn is_ready(&self, bootstrap_servers: &str) -> bool {
        let Some(address) = bootstrap_servers.split(',').next() else {
            return false;
        };
        matches!(
            tokio::time::timeout(self.connect_timeout, tokio::net::TcpStream::connect(address))
                .await,
            Ok(Ok(_))
        )
    }
}

/// Lifecycle for brokers that need no deployment
#[derive(Clone, Copy, Debug, Default)]
pub struct LocalLifecycle;

#[async_trait]
impl PlatformLifecycle for LocalLifecycle {
    async fn start(&self, _platform: &PlatformSpec) -> bool {
        true
    }

    async fn stop(&self, _platform: &PlatformSpec) -> bool {
        true
    }

    async fn is_ready(&self, _bootstrap_servers: &str) -> bool {
        true
    }
}

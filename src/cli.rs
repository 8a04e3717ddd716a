use crate::config::{ConfigOverrides, DeliveryMode, OrchestratorTimings};
use crate::platform::{PlatformId, PlatformRegistry};
use crate::transport::TransportKind;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::time::Duration;

/// Broker Benchmark - rate-controlled load against Kafka-protocol brokers
#[derive(Parser, Debug)]
#[clap(version, about, long_about = None)]
pub struct Args {
    /// Transport used to reach the brokers
    #[clap(long, value_enum, global = true, default_value_t = default_transport(), help_heading = "Environment")]
    pub transport: TransportKind,

    /// Directory receiving the JSON result documents
    #[clap(long, global = true, default_value = crate::defaults::RESULTS_DIR, help_heading = "Environment")]
    pub results_dir: PathBuf,

    /// Directory holding the docker-compose files of the platforms
    #[clap(long, global = true, default_value = ".", help_heading = "Environment")]
    pub project_dir: PathBuf,

    /// Skip sampling host CPU, memory and disk from /proc during runs
    #[clap(long, global = true, default_value_t = false, help_heading = "Environment")]
    pub no_monitor: bool,

    /// Override every platform's readiness bound (e.g. "90s", "2m")
    #[clap(long, global = true, value_parser = parse_duration, help_heading = "Timings")]
    pub readiness_timeout: Option<Duration>,

    /// Wait between consumer start and producer start
    #[clap(long, global = true, value_parser = parse_duration, help_heading = "Timings")]
    pub settle: Option<Duration>,

    /// Wait after the producer finishes before consumers are stopped
    #[clap(long, global = true, value_parser = parse_duration, help_heading = "Timings")]
    pub drain: Option<Duration>,

    /// Pause between platforms in comparison runs
    #[clap(long, global = true, value_parser = parse_duration, help_heading = "Timings")]
    pub cooldown: Option<Duration>,

    /// More output (-v debug, -vv trace); RUST_LOG takes precedence
    #[clap(short = 'v', long, global = true, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Only warnings and errors
    #[clap(short = 'q', long, global = true, default_value_t = false)]
    pub quiet: bool,

    /// Also write logs to this file
    #[clap(long, global = true)]
    pub log_file: Option<PathBuf>,

    #[clap(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Run one test profile against one platform
    Single {
        /// kafka, kafka-kraft or redpanda
        #[clap(short, long)]
        platform: String,

        /// Test profile name (see list-tests)
        #[clap(short, long, default_value = "light_load")]
        test: String,

        #[clap(flatten)]
        overrides: OverrideArgs,
    },

    /// Run one test profile against two platforms and compare them
    Compare {
        #[clap(short, long, default_value = "light_load")]
        test: String,

        /// First platform; ties in the comparison go to the second one
        #[clap(long, default_value = "kafka")]
        first: String,

        #[clap(long, default_value = "redpanda")]
        second: String,

        #[clap(flatten)]
        overrides: OverrideArgs,
    },

    /// Compare Kafka (ZooKeeper), Kafka (KRaft) and Redpanda
    ThreeWayCompare {
        #[clap(short, long, default_value = "light_load")]
        test: String,

        #[clap(flatten)]
        overrides: OverrideArgs,
    },

    /// Run every test profile as a Kafka versus Redpanda comparison
    All {
        #[clap(flatten)]
        overrides: OverrideArgs,
    },

    /// Start a platform and wait until it is ready
    Start { platform: String },

    /// Stop a platform
    Stop { platform: String },

    /// Print the summary table of a saved comparison
    Report { comparison_file: PathBuf },

    /// List the predefined test profiles
    ListTests,
}

/// Per-field overrides of the selected test profile
#[derive(clap::Args, Debug, Clone, Default, PartialEq, Eq)]
pub struct OverrideArgs {
    /// Run duration in seconds
    #[clap(short, long, help_heading = "Workload")]
    pub duration: Option<u64>,

    /// Total target rate across producer workers
    #[clap(short = 'r', long, help_heading = "Workload")]
    pub messages_per_second: Option<u64>,

    /// Message size in bytes, envelope included
    #[clap(short = 's', long, help_heading = "Workload")]
    pub message_size: Option<usize>,

    /// Number of producer workers
    #[clap(long, help_heading = "Workload")]
    pub threads: Option<usize>,

    /// Number of consumers
    #[clap(short, long, help_heading = "Workload")]
    pub consumers: Option<usize>,

    /// sync waits for every acknowledgment, async tracks them in the background
    #[clap(long, value_enum, alias = "producer-mode", help_heading = "Workload")]
    pub delivery_mode: Option<DeliveryMode>,
}

impl From<&OverrideArgs> for ConfigOverrides {
    fn from(args: &OverrideArgs) -> Self {
        ConfigOverrides {
            duration_seconds: args.duration,
            messages_per_second: args.messages_per_second,
            message_size_bytes: args.message_size,
            num_producer_threads: args.threads,
            num_consumers: args.consumers,
            delivery_mode: args.delivery_mode,
        }
    }
}

impl Args {
    /// Orchestrator timings with the command-line overrides applied.
    pub fn timings(&self) -> OrchestratorTimings {
        let mut timings = OrchestratorTimings::default();
        if let Some(settle) = self.settle {
            timings.settle = settle;
        }
        if let Some(drain) = self.drain {
            timings.drain = drain;
        }
        if let Some(cooldown) = self.cooldown {
            timings.cooldown = cooldown;
        }
        timings
    }

    pub fn registry(&self) -> PlatformRegistry {
        let registry = PlatformRegistry::default();
        match self.readiness_timeout {
            Some(timeout) => registry.with_readiness_timeout(timeout),
            None => registry,
        }
    }
}

/// Parse a platform name, for subcommands that take two of them.
pub fn parse_platform(name: &str) -> crate::error::Result<PlatformId> {
    name.parse()
}

#[cfg(feature = "kafka")]
fn default_transport() -> TransportKind {
    TransportKind::Kafka
}

#[cfg(not(feature = "kafka"))]
fn default_transport() -> TransportKind {
    TransportKind::Memory
}

/// Parse duration from string (e.g., "10s", "5m", "1h")
fn parse_duration(s: &str) -> Result<Duration, String> {
    let s = s.trim();

    if s.is_empty() {
        return Err("Duration cannot be empty".to_string());
    }

    let (num_str, unit) = if let Some(stripped) = s.strip_suffix("ms") {
        (stripped, "ms")
    } else if let Some(stripped) = s.strip_suffix('s') {
        (stripped, "s")
    } else if let Some(stripped) = s.strip_suffix('m') {
        (stripped, "m")
    } else if let Some(stripped) = s.strip_suffix('h') {
        (stripped, "h")
    } else {
        (s, "s")
    };

    let num: f64 = num_str
        .parse()
        .map_err(|_| format!("Invalid number in duration: {}", num_str))?;

    let duration = match unit {
        "ms" => Duration::from_millis(num as u64),
        "s" => Duration::from_secs(num as u64),
        "m" => Duration::from_secs((num * 60.0) as u64),
        "h" => Duration::from_secs((num * 3600.0) as u64),
        _ => return Err(format!("Invalid duration unit: {}", unit)),
    };

    Ok(duration)
}

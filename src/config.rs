//! # Run Configuration
//!
//! Workload parameters for a single platform run, the predefined test
//! profiles, and the orchestrator's phase timings.
//!
//! A [`RunConfiguration`] is immutable once validated: the orchestrator
//! checks it before any platform is touched, so a bad rate or payload size
//! surfaces as a configuration error rather than a half-started run.

use crate::defaults;
use crate::error::{BenchError, Result};
use clap::ValueEnum;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Bytes reserved in every message for the envelope fields (id, timestamp,
/// thread id, sequence).
pub const ENVELOPE_OVERHEAD_BYTES: usize = 100;

/// How the producer waits for broker acknowledgments.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, ValueEnum, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeliveryMode {
    /// Every send blocks until the broker acknowledges it.
    #[value(name = "sync", alias = "v1")]
    Sync,

    /// Sends are handed off and acknowledged in the background.
    #[value(name = "async", alias = "v2")]
    Async,
}

impl Default for DeliveryMode {
    fn default() -> Self {
        DeliveryMode::Sync
    }
}

impl std::fmt::Display for DeliveryMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DeliveryMode::Sync => write!(f, "sync"),
            DeliveryMode::Async => write!(f, "async"),
        }
    }
}

/// Workload parameters for one platform run.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunConfiguration {
    pub duration_seconds: u64,
    pub messages_per_second: u64,
    pub message_size_bytes: usize,
    pub num_producer_threads: usize,
    pub num_consumers: usize,
    #[serde(default)]
    pub delivery_mode: DeliveryMode,
}

impl Default for RunConfiguration {
    fn default() -> Self {
        Self {
            duration_seconds: defaults::DURATION_SECONDS,
            messages_per_second: defaults::MESSAGES_PER_SECOND,
            message_size_bytes: defaults::MESSAGE_SIZE,
            num_producer_threads: defaults::PRODUCER_THREADS,
            num_consumers: defaults::CONSUMERS,
            delivery_mode: DeliveryMode::Sync,
        }
    }
}

impl RunConfiguration {
    /// Check the numeric invariants.
    pub fn validate(&self) -> Result<()> {
        if self.duration_seconds == 0 {
            return Err(BenchError::Configuration(
                "duration must be greater than 0 seconds".to_string(),
            ));
        }
        if self.messages_per_second == 0 {
            return Err(BenchError::Configuration(
                "message rate must be greater than 0 msg/s".to_string(),
            ));
        }
        if self.message_size_bytes < ENVELOPE_OVERHEAD_BYTES {
            return Err(BenchError::Configuration(format!(
                "message size {} is below the {} byte envelope overhead",
                self.message_size_bytes, ENVELOPE_OVERHEAD_BYTES
            )));
        }
        if self.num_producer_threads == 0 {
            return Err(BenchError::Configuration(
                "producer thread count cannot be zero".to_string(),
            ));
        }
        if self.num_consumers == 0 {
            return Err(BenchError::Configuration(
                "consumer count cannot be zero".to_string(),
            ));
        }
        Ok(())
    }

    pub fn duration(&self) -> Duration {
        Duration::from_secs(self.duration_seconds)
    }

    /// Rate handled by each producer worker. Zero when the total rate is
    /// smaller than the worker count.
    pub fn per_worker_rate(&self) -> u64 {
        self.messages_per_second / self.num_producer_threads.max(1) as u64
    }

    /// Fixed gap between two sends of one worker; zero means unthrottled.
    pub fn send_interval(&self) -> Duration {
        match self.per_worker_rate() {
            0 => Duration::ZERO,
            rate => Duration::from_secs_f64(1.0 / rate as f64),
        }
    }

    /// Size of the filler string placed inside each envelope.
    pub fn filler_len(&self) -> usize {
        self.message_size_bytes
            .saturating_sub(ENVELOPE_OVERHEAD_BYTES)
    }

    /// Apply command-line overrides on top of this configuration.
    pub fn with_overrides(mut self, overrides: &ConfigOverrides) -> Self {
        if let Some(duration) = overrides.duration_seconds {
            self.duration_seconds = duration;
        }
        if let Some(rate) = overrides.messages_per_second {
            self.messages_per_second = rate;
        }
        if let Some(size) = overrides.message_size_bytes {
            self.message_size_bytes = size;
        }
        if let Some(threads) = overrides.num_producer_threads {
            self.num_producer_threads = threads;
        }
        if let Some(consumers) = overrides.num_consumers {
            self.num_consumers = consumers;
        }
        if let Some(mode) = overrides.delivery_mode {
            self.delivery_mode = mode;
        }
        self
    }
}

/// Optional per-field overrides collected from the command line.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ConfigOverrides {
    pub duration_seconds: Option<u64>,
    pub messages_per_second: Option<u64>,
    pub message_size_bytes: Option<usize>,
    pub num_producer_threads: Option<usize>,
    pub num_consumers: Option<usize>,
    pub delivery_mode: Option<DeliveryMode>,
}

/// Named, predefined workload.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TestProfile {
    pub name: &'static str,
    pub config: RunConfiguration,
}

/// The three built-in load profiles, lightest first.
pub fn test_profiles() -> Vec<TestProfile> {
    vec![
        TestProfile {
            name: "light_load",
            config: RunConfiguration {
                duration_seconds: 60,
                messages_per_second: 100,
                message_size_bytes: 1024,
                num_producer_threads: 1,
                num_consumers: 1,
                delivery_mode: DeliveryMode::Sync,
            },
        },
        TestProfile {
            name: "medium_load",
            config: RunConfiguration {
                duration_seconds: 120,
                messages_per_second: 1000,
                message_size_bytes: 2048,
                num_producer_threads: 2,
                num_consumers: 2,
                delivery_mode: DeliveryMode::Sync,
            },
        },
        TestProfile {
            name: "heavy_load",
            config: RunConfiguration {
                duration_seconds: 180,
                messages_per_second: 5000,
                message_size_bytes: 4096,
                num_producer_threads: 4,
                num_consumers: 4,
                delivery_mode: DeliveryMode::Sync,
            },
        },
    ]
}

/// Look up a profile by name.
pub fn find_profile(name: &str) -> Result<TestProfile> {
    test_profiles()
        .into_iter()
        .find(|p| p.name == name)
        .ok_or_else(|| BenchError::Configuration(format!("unknown test profile: {}", name)))
}

/// Fixed delays between orchestrator phases.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OrchestratorTimings {
    /// Wait after consumers attach before traffic starts.
    pub settle: Duration,
    /// Wait after the producer finishes before consumers are stopped.
    pub drain: Duration,
    /// Extra consume time on top of the producer duration.
    pub consumer_grace: Duration,
    /// Bound on joining each consumer task.
    pub consumer_join_timeout: Duration,
    /// Bound on joining each producer worker.
    pub producer_join_timeout: Duration,
    /// Bound on one synchronous acknowledgment.
    pub ack_timeout: Duration,
    /// Bound on awaiting outstanding async deliveries.
    pub flush_timeout: Duration,
    /// Pause between platforms in a comparison run.
    pub cooldown: Duration,
    /// Gap between two readiness checks.
    pub readiness_poll_interval: Duration,
    /// Upper bound of a single consumer poll.
    pub poll_timeout: Duration,
    /// Resource monitor sampling interval.
    pub sampling_interval: Duration,
}

impl Default for OrchestratorTimings {
    fn default() -> Self {
        Self {
            settle: defaults::SETTLE_DELAY,
            drain: defaults::DRAIN_DELAY,
            consumer_grace: defaults::CONSUMER_GRACE,
            consumer_join_timeout: defaults::CONSUMER_JOIN_TIMEOUT,
            producer_join_timeout: defaults::PRODUCER_JOIN_TIMEOUT,
            ack_timeout: defaults::ACK_TIMEOUT,
            flush_timeout: defaults::FLUSH_TIMEOUT,
            cooldown: defaults::COOLDOWN,
            readiness_poll_interval: defaults::READINESS_POLL_INTERVAL,
            poll_timeout: defaults::POLL_TIMEOUT,
            sampling_interval: defaults::SAMPLING_INTERVAL,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_configuration_is_valid() {
        RunConfiguration::default().validate().unwrap();
    }

    #[test]
    fn rejects_zero_rate_and_duration() {
        let config = RunConfiguration {
            messages_per_second: 0,
            ..Default::default()
        };
        assert!(config.validate().unwrap_err().is_configuration_error());

        let config = RunConfiguration {
            duration_seconds: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_payload_below_envelope_overhead() {
        let config = RunConfiguration {
            message_size_bytes: ENVELOPE_OVERHEAD_BYTES - 1,
            ..Default::default()
        };
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("envelope overhead"));

        let config = RunConfiguration {
            message_size_bytes: ENVELOPE_OVERHEAD_BYTES,
            ..Default::default()
        };
        config.validate().unwrap();
    }

    #[test]
    fn send_interval_divides_rate_across_workers() {
        let config = RunConfiguration {
            messages_per_second: 100,
            num_producer_threads: 4,
            ..Default::default()
        };
        assert_eq!(config.per_worker_rate(), 25);
        assert_eq!(config.send_interval(), Duration::from_millis(40));
    }

    #[test]
    fn rate_below_worker_count_is_unthrottled() {
        let config = RunConfiguration {
            messages_per_second: 3,
            num_producer_threads: 4,
            ..Default::default()
        };
        assert_eq!(config.per_worker_rate(), 0);
        assert_eq!(config.send_interval(), Duration::ZERO);
        config.validate().unwrap();
    }

    #[test]
    fn overrides_replace_only_given_fields() {
        let base = find_profile("medium_load").unwrap().config;
        let overridden = base.clone().with_overrides(&ConfigOverrides {
            duration_seconds: Some(5),
            delivery_mode: Some(DeliveryMode::Async),
            ..Default::default()
        });
        assert_eq!(overridden.duration_seconds, 5);
        assert_eq!(overridden.delivery_mode, DeliveryMode::Async);
        assert_eq!(overridden.messages_per_second, base.messages_per_second);
        assert_eq!(overridden.num_consumers, 2);
    }

    #[test]
    fn unknown_profile_is_rejected() {
        assert!(find_profile("extreme_load").is_err());
        assert_eq!(test_profiles().len(), 3);
    }

    #[test]
    fn config_serializes_with_stable_keys() {
        let json = serde_json::to_value(RunConfiguration::default()).unwrap();
        assert_eq!(json["delivery_mode"], "sync");
        assert!(json.get("messages_per_second").is_some());
        assert!(json.get("num_producer_threads").is_some());
    }
}

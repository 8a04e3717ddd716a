//! # Comparison Engine
//!
//! Derives per-metric winners from the results of two or three platforms.
//!
//! ## Metrics
//!
//! | Section     | Metric       | Value key             | Better |
//! |-------------|--------------|-----------------------|--------|
//! | `producer`  | `throughput` | `<key>_msg_per_sec`   | higher |
//! | `producer`  | `bandwidth`  | `<key>_mbps`          | higher |
//! | `consumer`  | `throughput` | `<key>_msg_per_sec`   | higher |
//! | `consumer`  | `latency`    | `<key>_avg_ms`        | lower  |
//! | `resources` | `cpu_usage`  | `<key>_avg_percent`   | lower  |
//! | `resources` | `memory_usage` | `<key>_avg_percent` | lower  |
//!
//! Consumer metrics read consumer 0 of each run. Platforms whose run failed
//! drop out, and the survivors are compared as long as there are at least
//! two. A metric is only emitted when every surviving platform has a value
//! for it, and a section with no metric is left out. Equal values go to the
//! platform listed later.

use crate::platform::PlatformId;
use crate::results::PlatformResult;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// One platform's contribution to a comparison; `None` when its run failed.
pub type PlatformEntry<'a> = (PlatformId, Option<&'a PlatformResult>);

/// Whether larger or smaller values win
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Direction {
    HigherIsBetter,
    LowerIsBetter,
}

/// Values of one metric across platforms plus the winning platform key
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricComparison {
    #[serde(flatten)]
    pub values: BTreeMap<String, f64>,
    pub winner: String,
}

impl MetricComparison {
    pub fn value(&self, key: &str) -> Option<f64> {
        self.values.get(key).copied()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProducerComparison {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub throughput: Option<MetricComparison>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bandwidth: Option<MetricComparison>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConsumerComparison {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub throughput: Option<MetricComparison>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub latency: Option<MetricComparison>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResourceComparison {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpu_usage: Option<MetricComparison>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory_usage: Option<MetricComparison>,
}

/// The `comparison` section of a comparison document
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ComparisonReport {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub producer: Option<ProducerComparison>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub consumer: Option<ConsumerComparison>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resources: Option<ResourceComparison>,
}

impl ComparisonReport {
    pub fn is_empty(&self) -> bool {
        self.producer.is_none() && self.consumer.is_none() && self.resources.is_none()
    }
}

/// Relative gain of one platform over another in the three-way comparison
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Improvement {
    pub subject: PlatformId,
    pub baseline: PlatformId,
}

impl Improvement {
    /// Value key, e.g. `kraft_vs_zookeeper_improvement`.
    pub fn key(&self) -> String {
        format!(
            "{}_vs_{}_improvement",
            self.subject.consensus_label(),
            self.baseline.consensus_label()
        )
    }
}

impl Default for Improvement {
    fn default() -> Self {
        Self {
            subject: PlatformId::KafkaKraft,
            baseline: PlatformId::Kafka,
        }
    }
}

/// `(subject - baseline) / baseline * 100`, or 0 when the baseline is zero.
pub fn improvement_percent(subject: f64, baseline: f64) -> f64 {
    if baseline == 0.0 {
        0.0
    } else {
        (subject - baseline) / baseline * 100.0
    }
}

struct Metric {
    suffix: &'static str,
    direction: Direction,
    extract: fn(&PlatformResult) -> Option<f64>,
}

const PRODUCER_THROUGHPUT: Metric = Metric {
    suffix: "msg_per_sec",
    direction: Direction::HigherIsBetter,
    extract: producer_throughput,
};

const PRODUCER_BANDWIDTH: Metric = Metric {
    suffix: "mbps",
    direction: Direction::HigherIsBetter,
    extract: producer_bandwidth,
};

const CONSUMER_THROUGHPUT: Metric = Metric {
    suffix: "msg_per_sec",
    direction: Direction::HigherIsBetter,
    extract: consumer_throughput,
};

const CONSUMER_LATENCY: Metric = Metric {
    suffix: "avg_ms",
    direction: Direction::LowerIsBetter,
    extract: consumer_latency,
};

const CPU_USAGE: Metric = Metric {
    suffix: "avg_percent",
    direction: Direction::LowerIsBetter,
    extract: cpu_usage,
};

const MEMORY_USAGE: Metric = Metric {
    suffix: "avg_percent",
    direction: Direction::LowerIsBetter,
    extract: memory_usage,
};

fn producer_throughput(result: &PlatformResult) -> Option<f64> {
    result.producer_stats.as_ref().map(|s| s.average_throughput)
}

fn producer_bandwidth(result: &PlatformResult) -> Option<f64> {
    result.producer_stats.as_ref().map(|s| s.average_bandwidth_mbps)
}

fn consumer_throughput(result: &PlatformResult) -> Option<f64> {
    result.first_consumer().map(|c| c.average_throughput)
}

// A first consumer without samples has no meaningful average.
fn consumer_latency(result: &PlatformResult) -> Option<f64> {
    result
        .first_consumer()
        .filter(|c| c.has_latency())
        .map(|c| c.latency_avg_ms)
}

fn cpu_usage(result: &PlatformResult) -> Option<f64> {
    result.system_metrics.as_ref().map(|m| m.system.cpu_avg)
}

fn memory_usage(result: &PlatformResult) -> Option<f64> {
    result.system_metrics.as_ref().map(|m| m.system.memory_avg)
}

/// Stateless builder of [`ComparisonReport`]s
pub struct ComparisonEngine;

impl ComparisonEngine {
    /// Compare two platforms.
    pub fn two_way(first: PlatformEntry<'_>, second: PlatformEntry<'_>) -> ComparisonReport {
        Self::compare(&[first, second], None)
    }

    /// Compare three platforms and add the relative gain of
    /// `improvement.subject` over `improvement.baseline` to the
    /// higher-is-better metrics.
    pub fn three_way(entries: [PlatformEntry<'_>; 3], improvement: Improvement) -> ComparisonReport {
        Self::compare(&entries, Some(improvement))
    }

    /// Compare any number of platforms.
    ///
    /// ## Parameters
    /// - `entries`: platforms in listing order; ties go to the later entry.
    ///   Entries without a result are left out, and fewer than two
    ///   remaining entries give an empty report.
    /// - `improvement`: optional relative gain to attach to higher-is-better
    ///   metrics, only when both of its platforms have a result
    pub fn compare(entries: &[PlatformEntry<'_>], improvement: Option<Improvement>) -> ComparisonReport {
        let completed = entries
            .iter()
            .filter(|(_, result)| result.is_some())
            .copied()
            .collect::<Vec<_>>();
        if completed.len() < 2 {
            return ComparisonReport::default();
        }
        let metric = |m: &Metric| compare_metric(&completed, m, improvement);

        let producer = ProducerComparison {
            throughput: metric(&PRODUCER_THROUGHPUT),
            bandwidth: metric(&PRODUCER_BANDWIDTH),
        };
        let consumer = ConsumerComparison {
            throughput: metric(&CONSUMER_THROUGHPUT),
            latency: metric(&CONSUMER_LATENCY),
        };
        let resources = ResourceComparison {
            cpu_usage: metric(&CPU_USAGE),
            memory_usage: metric(&MEMORY_USAGE),
        };

        ComparisonReport {
            producer: (producer.throughput.is_some() || producer.bandwidth.is_some())
                .then_some(producer),
            consumer: (consumer.throughput.is_some() || consumer.latency.is_some())
                .then_some(consumer),
            resources: (resources.cpu_usage.is_some() || resources.memory_usage.is_some())
                .then_some(resources),
        }
    }
}

fn compare_metric(
    entries: &[PlatformEntry<'_>],
    metric: &Metric,
    improvement: Option<Improvement>,
) -> Option<MetricComparison> {
    let values = entries
        .iter()
        .map(|(id, result)| result.and_then(metric.extract).map(|v| (*id, v)))
        .collect::<Option<Vec<_>>>()?;

    let (winner, _) = values.iter().copied().reduce(|best, candidate| {
        let takes_lead = match metric.direction {
            Direction::HigherIsBetter => candidate.1 >= best.1,
            Direction::LowerIsBetter => candidate.1 <= best.1,
        };
        if takes_lead {
            candidate
        } else {
            best
        }
    })?;

    let mut map = values
        .iter()
        .map(|(id, v)| (format!("{}_{}", id.key(), metric.suffix), *v))
        .collect::<BTreeMap<_, _>>();

    if let (Some(gain), Direction::HigherIsBetter) = (improvement, metric.direction) {
        let lookup = |id: PlatformId| values.iter().find(|(p, _)| *p == id).map(|(_, v)| *v);
        if let (Some(subject), Some(baseline)) = (lookup(gain.subject), lookup(gain.baseline)) {
            map.insert(gain.key(), improvement_percent(subject, baseline));
        }
    }

    Some(MetricComparison {
        values: map,
        winner: winner.key().to_string(),
    })
}

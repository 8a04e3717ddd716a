//! # Results
//!
//! Result documents for single runs and comparisons, their JSON
//! persistence, and the console summary table.
//!
//! ## File Naming
//!
//! - single run: `<platform>_<test>_<YYYYmmdd_HHMMSS>.json`, with the raw
//!   resource samples next to it in `<platform>_<test>_<YYYYmmdd_HHMMSS>_metrics.json`
//! - two-platform comparison: `comparison_<test>_<YYYYmmdd_HHMMSS>.json`
//! - three-platform comparison: `three_way_comparison_<test>_<YYYYmmdd_HHMMSS>.json`
//!
//! All documents are pretty-printed JSON with RFC 3339 timestamps.

use crate::comparison::{ComparisonReport, MetricComparison};
use crate::config::RunConfiguration;
use crate::error::Result;
use crate::monitor::{MetricsRecord, ResourceSummary};
use crate::platform::PlatformId;
use crate::stats::{ConsumerStats, ProducerStats};
use crate::utils::{table_row, table_separator};
use chrono::{DateTime, Utc};
use colored::*;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use tracing::{debug, info};

const FILE_TIMESTAMP_FORMAT: &str = "%Y%m%d_%H%M%S";

/// Host details stored with every run for reproducibility
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SystemInfo {
    pub os: String,
    pub architecture: String,
    pub cpu_cores: usize,
    pub benchmark_version: String,
}

impl SystemInfo {
    pub fn collect() -> Self {
        Self {
            os: std::env::consts::OS.to_string(),
            architecture: std::env::consts::ARCH.to_string(),
            cpu_cores: num_cpus::get(),
            benchmark_version: crate::VERSION.to_string(),
        }
    }
}

/// Outcome of one benchmark run against one platform
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlatformResult {
    pub platform: PlatformId,
    pub test_name: String,
    pub config: RunConfiguration,
    pub topic: String,
    pub start_time: DateTime<Utc>,
    #[serde(default)]
    pub end_time: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub producer_stats: Option<ProducerStats>,
    #[serde(default)]
    pub consumer_stats: Vec<ConsumerStats>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system_metrics: Option<ResourceSummary>,
    #[serde(default)]
    pub errors: Vec<String>,
    #[serde(default)]
    pub system_info: SystemInfo,
}

impl PlatformResult {
    pub fn new(
        platform: PlatformId,
        test_name: impl Into<String>,
        config: RunConfiguration,
        topic: impl Into<String>,
    ) -> Self {
        Self {
            platform,
            test_name: test_name.into(),
            config,
            topic: topic.into(),
            start_time: Utc::now(),
            end_time: None,
            producer_stats: None,
            consumer_stats: Vec::new(),
            system_metrics: None,
            errors: Vec::new(),
            system_info: SystemInfo::collect(),
        }
    }

    pub fn record_error(&mut self, error: impl Into<String>) {
        self.errors.push(error.into());
    }

    /// Stamp the end time. Called once, after every phase has run.
    pub fn finalize(&mut self) {
        self.end_time = Some(Utc::now());
    }

    /// Consumer 0, whose statistics represent the run in comparisons.
    /// `None` when that consumer failed to connect or was abandoned.
    pub fn first_consumer(&self) -> Option<&ConsumerStats> {
        self.consumer_stats.iter().find(|c| c.consumer_index == 0)
    }
}

/// A platform's slot in a comparison: a result, or why there is none
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PlatformOutcome {
    Completed(Box<PlatformResult>),
    Failed { error: String },
}

impl PlatformOutcome {
    pub fn failed(error: impl Into<String>) -> Self {
        PlatformOutcome::Failed {
            error: error.into(),
        }
    }

    pub fn result(&self) -> Option<&PlatformResult> {
        match self {
            PlatformOutcome::Completed(result) => Some(&**result),
            PlatformOutcome::Failed { .. } => None,
        }
    }
}

impl From<PlatformResult> for PlatformOutcome {
    fn from(result: PlatformResult) -> Self {
        PlatformOutcome::Completed(Box::new(result))
    }
}

/// Results of several platforms running the same test, plus the verdicts
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComparisonResult {
    pub test_name: String,
    pub start_time: DateTime<Utc>,
    #[serde(default)]
    pub end_time: Option<DateTime<Utc>>,
    /// Keyed `<platform key>_results`
    #[serde(flatten)]
    pub results: BTreeMap<String, PlatformOutcome>,
    #[serde(default)]
    pub comparison: ComparisonReport,
}

impl ComparisonResult {
    pub fn new(test_name: impl Into<String>) -> Self {
        Self {
            test_name: test_name.into(),
            start_time: Utc::now(),
            end_time: None,
            results: BTreeMap::new(),
            comparison: ComparisonReport::default(),
        }
    }

    fn results_key(platform: PlatformId) -> String {
        format!("{}_results", platform.key())
    }

    pub fn insert(&mut self, platform: PlatformId, outcome: PlatformOutcome) {
        self.results.insert(Self::results_key(platform), outcome);
    }

    pub fn outcome(&self, platform: PlatformId) -> Option<&PlatformOutcome> {
        self.results.get(&Self::results_key(platform))
    }

    pub fn platform_result(&self, platform: PlatformId) -> Option<&PlatformResult> {
        self.outcome(platform).and_then(PlatformOutcome::result)
    }

    /// Platforms present in the document, in display order.
    pub fn platforms(&self) -> Vec<PlatformId> {
        PlatformId::ALL
            .into_iter()
            .filter(|id| self.results.contains_key(&Self::results_key(*id)))
            .collect()
    }

    pub fn finalize(&mut self) {
        self.end_time = Some(Utc::now());
    }

    /// Rows of the console summary: metric label, one value per platform,
    /// winner.
    pub fn summary_rows(&self) -> Vec<Vec<String>> {
        let platforms = self.platforms();
        let report = &self.comparison;
        let mut rows = Vec::new();

        let mut push = |label: &str, suffix: &str, metric: Option<&MetricComparison>| {
            let Some(metric) = metric else {
                return;
            };
            let mut row = vec![label.to_string()];
            for platform in &platforms {
                let value = metric
                    .value(&format!("{}_{}", platform.key(), suffix))
                    .unwrap_or(0.0);
                row.push(format!("{:.2}", value));
            }
            row.push(winner_label(&metric.winner));
            rows.push(row);
        };

        if let Some(producer) = &report.producer {
            push("Producer Throughput (msg/s)", "msg_per_sec", producer.throughput.as_ref());
            push("Producer Bandwidth (MB/s)", "mbps", producer.bandwidth.as_ref());
        }
        if let Some(consumer) = &report.consumer {
            push("Consumer Throughput (msg/s)", "msg_per_sec", consumer.throughput.as_ref());
            push("Consumer Latency (ms)", "avg_ms", consumer.latency.as_ref());
        }
        if let Some(resources) = &report.resources {
            push("CPU Usage (%)", "avg_percent", resources.cpu_usage.as_ref());
            push("Memory Usage (%)", "avg_percent", resources.memory_usage.as_ref());
        }
        rows
    }

    /// Print the summary table to stdout.
    pub fn print_summary(&self) {
        let platforms = self.platforms();
        let mut headers = vec!["Metric".to_string()];
        headers.extend(platforms.iter().map(|p| p.to_string()));
        headers.push("Winner".to_string());

        let rows = self.summary_rows();
        let widths = headers
            .iter()
            .enumerate()
            .map(|(i, header)| {
                rows.iter()
                    .filter_map(|row| row.get(i))
                    .map(String::len)
                    .chain(std::iter::once(header.len()))
                    .max()
                    .unwrap_or(10)
            })
            .collect::<Vec<_>>();

        println!();
        println!("{}", "=".repeat(80));
        println!(
            "{}",
            format!("PERFORMANCE COMPARISON SUMMARY - {}", self.test_name).bold()
        );
        println!("{}", "=".repeat(80));

        let header_refs = headers.iter().map(String::as_str).collect::<Vec<_>>();
        println!("{}", table_separator(&widths));
        println!("{}", table_row(&header_refs, &widths).bold());
        println!("{}", table_separator(&widths));
        if rows.is_empty() {
            println!("{}", "No comparable metrics were collected.".yellow());
        }
        for row in &rows {
            let refs = row.iter().map(String::as_str).collect::<Vec<_>>();
            println!("{}", table_row(&refs, &widths));
        }
        println!("{}", table_separator(&widths));

        for platform in &platforms {
            if let Some(PlatformOutcome::Failed { error }) = self.outcome(*platform) {
                println!("{}", format!("{}: {}", platform, error).red());
            }
        }
    }
}

/// Title-cased platform name for a winner key.
fn winner_label(winner: &str) -> String {
    PlatformId::from_str(winner)
        .map(|id| id.to_string())
        .unwrap_or_else(|_| winner.to_string())
}

/// Writes and reads result documents under one directory
#[derive(Clone, Debug)]
pub struct ResultsManager {
    output_dir: PathBuf,
}

impl ResultsManager {
    /// Create the manager, creating `output_dir` if needed.
    pub fn new(output_dir: impl AsRef<Path>) -> Result<Self> {
        let output_dir = output_dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&output_dir)?;
        debug!("Results directory: {:?}", output_dir);
        Ok(Self { output_dir })
    }

    pub fn output_dir(&self) -> &Path {
        &self.output_dir
    }

    fn timestamp() -> String {
        Utc::now().format(FILE_TIMESTAMP_FORMAT).to_string()
    }

    fn write_json<T: Serialize>(&self, file_name: String, value: &T) -> Result<PathBuf> {
        let path = self.output_dir.join(file_name);
        let json = serde_json::to_string_pretty(value)?;
        std::fs::write(&path, json)?;
        info!("Results saved to: {}", path.display());
        Ok(path)
    }

    /// Persist a single-platform result.
    pub fn save_platform_result(&self, result: &PlatformResult) -> Result<PathBuf> {
        self.save_run(result, None)
    }

    /// Persist a single-platform result and, when there is one, the raw
    /// resource samples of the run under the same timestamp.
    ///
    /// Returns the path of the result document.
    pub fn save_run(
        &self,
        result: &PlatformResult,
        metrics: Option<&MetricsRecord>,
    ) -> Result<PathBuf> {
        let stem = format!(
            "{}_{}_{}",
            result.platform.key(),
            result.test_name,
            Self::timestamp()
        );
        let path = self.write_json(format!("{}.json", stem), result)?;
        if let Some(metrics) = metrics {
            self.write_json(format!("{}_metrics.json", stem), metrics)?;
        }
        Ok(path)
    }

    /// Persist a comparison document.
    pub fn save_comparison(&self, comparison: &ComparisonResult) -> Result<PathBuf> {
        let prefix = if comparison.platforms().len() >= 3 {
            "three_way_comparison"
        } else {
            "comparison"
        };
        let file_name = format!("{}_{}_{}.json", prefix, comparison.test_name, Self::timestamp());
        self.write_json(file_name, comparison)
    }

    pub fn load_platform_result(path: impl AsRef<Path>) -> Result<PlatformResult> {
        let contents = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&contents)?)
    }

    pub fn load_comparison(path: impl AsRef<Path>) -> Result<ComparisonResult> {
        let contents = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&contents)?)
    }
}

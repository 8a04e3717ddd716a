//! # Resource Monitor
//!
//! Resource sampling while a platform run is in flight. The orchestrator
//! starts sampling when the platform is ready and stops it during
//! finalization. The summary lands in `PlatformResult::system_metrics` and
//! the raw samples are written next to the result as a [`MetricsRecord`].
//!
//! [`ProcResourceMonitor`] reads Linux `/proc` counters for the host and,
//! when enabled, `docker stats` for the broker container. [`NoopMonitor`]
//! produces nothing, which omits the resource section from comparisons.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::PathBuf;
use std::time::Duration;
use tokio::process::Command;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, warn};

const SECTOR_BYTES: u64 = 512;
const BYTES_PER_MB: f64 = 1024.0 * 1024.0;
const CONTAINER_STATS_TIMEOUT: Duration = Duration::from_secs(5);

/// Collaborator sampling resources during a run.
#[async_trait]
pub trait ResourceMonitor: Send {
    /// Begin sampling every `interval`, discarding earlier samples.
    /// `container` names the broker container, when the platform runs in one.
    async fn start_sampling(&mut self, interval: Duration, container: Option<&str>);

    /// Stop sampling and hand back the samples with their summary. `None`
    /// when nothing was collected.
    async fn stop_sampling(&mut self) -> Option<MetricsRecord>;
}

/// One reading of host resource usage
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ResourceSample {
    pub timestamp: DateTime<Utc>,
    pub cpu_percent: f64,
    pub memory_percent: f64,
    /// Cumulative megabytes read since boot
    pub disk_read_mb: f64,
    /// Cumulative megabytes written since boot
    pub disk_write_mb: f64,
    #[serde(default)]
    pub network_sent_mb: f64,
    #[serde(default)]
    pub network_recv_mb: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub container: Option<ContainerSample>,
}

/// One `docker stats` reading of the broker container
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ContainerSample {
    pub cpu_percent: f64,
    pub memory_percent: f64,
    pub memory_usage_mb: f64,
    /// Cumulative since the container started
    pub network_rx_mb: f64,
    pub network_tx_mb: f64,
}

/// Aggregate of a run's resource samples
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceSummary {
    /// Number of samples, one per sampling interval
    pub duration_seconds: u64,
    pub system: SystemSummary,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub container: Option<ContainerSummary>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SystemSummary {
    pub cpu_avg: f64,
    pub cpu_max: f64,
    pub cpu_min: f64,
    pub memory_avg: f64,
    pub memory_max: f64,
    pub memory_min: f64,
    pub disk_read_total_mb: f64,
    pub disk_write_total_mb: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContainerSummary {
    pub cpu_avg: f64,
    pub cpu_max: f64,
    pub cpu_min: f64,
    pub memory_avg: f64,
    pub memory_max: f64,
    pub memory_min: f64,
}

impl ResourceSummary {
    pub fn from_samples(samples: &[ResourceSample]) -> Option<Self> {
        if samples.is_empty() {
            return None;
        }

        let (cpu_avg, cpu_min, cpu_max) = spread(samples.iter().map(|s| s.cpu_percent));
        let (memory_avg, memory_min, memory_max) =
            spread(samples.iter().map(|s| s.memory_percent));
        let (_, read_min, read_max) = spread(samples.iter().map(|s| s.disk_read_mb));
        let (_, write_min, write_max) = spread(samples.iter().map(|s| s.disk_write_mb));

        // Samples where `docker stats` failed are skipped.
        let container: Vec<ContainerSample> = samples.iter().filter_map(|s| s.container).collect();
        let container = (!container.is_empty()).then(|| {
            let (cpu_avg, cpu_min, cpu_max) = spread(container.iter().map(|c| c.cpu_percent));
            let (memory_avg, memory_min, memory_max) =
                spread(container.iter().map(|c| c.memory_percent));
            ContainerSummary {
                cpu_avg,
                cpu_max,
                cpu_min,
                memory_avg,
                memory_max,
                memory_min,
            }
        });

        Some(Self {
            duration_seconds: samples.len() as u64,
            system: SystemSummary {
                cpu_avg,
                cpu_max,
                cpu_min,
                memory_avg,
                memory_max,
                memory_min,
                disk_read_total_mb: read_max - read_min,
                disk_write_total_mb: write_max - write_min,
            },
            container,
        })
    }
}

/// Raw samples of one run with their summary, persisted as
/// `<platform>_<test>_<timestamp>_metrics.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricsRecord {
    pub metrics: Vec<ResourceSample>,
    pub summary: ResourceSummary,
}

impl MetricsRecord {
    pub fn from_samples(samples: Vec<ResourceSample>) -> Option<Self> {
        let summary = ResourceSummary::from_samples(&samples)?;
        Some(Self {
            metrics: samples,
            summary,
        })
    }
}

/// (avg, min, max) of a non-empty series
fn spread(values: impl Iterator<Item = f64>) -> (f64, f64, f64) {
    let mut count = 0usize;
    let mut sum = 0.0;
    let mut min = f64::INFINITY;
    let mut max = f64::NEG_INFINITY;
    for value in values {
        count += 1;
        sum += value;
        min = min.min(value);
        max = max.max(value);
    }
    if count == 0 {
        return (0.0, 0.0, 0.0);
    }
    (sum / count as f64, min, max)
}

/// Monitor that never collects anything
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopMonitor;

#[async_trait]
impl ResourceMonitor for NoopMonitor {
    async fn start_sampling(&mut self, _interval: Duration, _container: Option<&str>) {}

    async fn stop_sampling(&mut self) -> Option<MetricsRecord> {
        None
    }
}

/// Aggregate CPU jiffies from the first line of `/proc/stat`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CpuTimes {
    pub busy: u64,
    pub total: u64,
}

impl CpuTimes {
    /// Busy share between two readings, in percent.
    pub fn percent_since(&self, earlier: &CpuTimes) -> f64 {
        let total = self.total.saturating_sub(earlier.total);
        if total == 0 {
            return 0.0;
        }
        let busy = self.busy.saturating_sub(earlier.busy);
        busy as f64 / total as f64 * 100.0
    }
}

/// Parse the aggregate `cpu` line of `/proc/stat`.
pub fn parse_cpu_times(stat: &str) -> Option<CpuTimes> {
    let line = stat.lines().find(|l| l.starts_with("cpu "))?;
    let fields: Vec<u64> = line
        .split_whitespace()
        .skip(1)
        .filter_map(|f| f.parse().ok())
        .collect();
    if fields.len() < 4 {
        return None;
    }
    // idle + iowait
    let idle = fields[3] + fields.get(4).copied().unwrap_or(0);
    // guest time is already part of user time
    let total: u64 = fields.iter().take(8).sum();
    Some(CpuTimes {
        busy: total.saturating_sub(idle),
        total,
    })
}

/// Used memory in percent from `/proc/meminfo`.
pub fn parse_memory_percent(meminfo: &str) -> Option<f64> {
    let field = |name: &str| -> Option<u64> {
        meminfo
            .lines()
            .find(|l| l.starts_with(name))?
            .split_whitespace()
            .nth(1)?
            .parse()
            .ok()
    };
    let total = field("MemTotal:")?;
    let available = field("MemAvailable:")?;
    if total == 0 {
        return None;
    }
    Some(total.saturating_sub(available) as f64 / total as f64 * 100.0)
}

/// Total bytes (read, written) over whole disks in `/proc/diskstats`.
///
/// Loop and ram devices are ignored, as are partitions of a listed disk.
pub fn parse_disk_bytes(diskstats: &str) -> (u64, u64) {
    let devices: Vec<(&str, u64, u64)> = diskstats
        .lines()
        .filter_map(|line| {
            let fields: Vec<&str> = line.split_whitespace().collect();
            if fields.len() < 10 {
                return None;
            }
            let read = fields[5].parse().ok()?;
            let written = fields[9].parse().ok()?;
            Some((fields[2], read, written))
        })
        .filter(|(name, _, _)| !name.starts_with("loop") && !name.starts_with("ram"))
        .collect();

    let names: HashSet<&str> = devices.iter().map(|(name, _, _)| *name).collect();
    devices
        .iter()
        .filter(|(name, _, _)| {
            !names
                .iter()
                .any(|other| other != name && name.starts_with(other))
        })
        .fold((0, 0), |(r, w), (_, read, written)| {
            (r + read * SECTOR_BYTES, w + written * SECTOR_BYTES)
        })
}

/// Received and transmitted bytes over every interface of `/proc/net/dev`
/// except loopback.
pub fn parse_network_bytes(netdev: &str) -> (u64, u64) {
    netdev
        .lines()
        .filter_map(|line| {
            let (name, counters) = line.split_once(':')?;
            if name.trim() == "lo" {
                return None;
            }
            let fields: Vec<u64> = counters
                .split_whitespace()
                .filter_map(|f| f.parse().ok())
                .collect();
            Some((*fields.first()?, *fields.get(8)?))
        })
        .fold((0, 0), |(recv, sent), (rx, tx)| (recv + rx, sent + tx))
}

/// Byte count of a `docker stats` size such as `1.2kB` or `95.5MiB`.
pub fn parse_size(text: &str) -> Option<f64> {
    let text = text.trim();
    let split = text
        .find(|c: char| c.is_ascii_alphabetic())
        .unwrap_or(text.len());
    let (number, unit) = text.split_at(split);
    let value: f64 = number.trim().parse().ok()?;
    let multiplier = match unit {
        "" | "B" => 1.0,
        "kB" | "KB" => 1e3,
        "MB" => 1e6,
        "GB" => 1e9,
        "TB" => 1e12,
        "KiB" => 1024.0,
        "MiB" => BYTES_PER_MB,
        "GiB" => BYTES_PER_MB * 1024.0,
        "TiB" => BYTES_PER_MB * 1024.0 * 1024.0,
        _ => return None,
    };
    Some(value * multiplier)
}

fn parse_percent(text: &str) -> Option<f64> {
    text.trim().trim_end_matches('%').parse().ok()
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct DockerStatsLine {
    #[serde(rename = "CPUPerc")]
    cpu_perc: String,
    mem_perc: String,
    mem_usage: String,
    #[serde(rename = "NetIO")]
    net_io: String,
}

/// Parse one line of `docker stats --no-stream --format "{{json .}}"`.
pub fn parse_container_stats(line: &str) -> Option<ContainerSample> {
    let stats: DockerStatsLine = serde_json::from_str(line.trim()).ok()?;
    let (used, _limit) = stats.mem_usage.split_once(" / ")?;
    let (rx, tx) = stats.net_io.split_once(" / ")?;

    Some(ContainerSample {
        cpu_percent: parse_percent(&stats.cpu_perc)?,
        memory_percent: parse_percent(&stats.mem_perc)?,
        memory_usage_mb: parse_size(used)? / BYTES_PER_MB,
        network_rx_mb: parse_size(rx)? / BYTES_PER_MB,
        network_tx_mb: parse_size(tx)? / BYTES_PER_MB,
    })
}

/// Host monitor backed by `/proc`, optionally sampling the broker container
pub struct ProcResourceMonitor {
    proc_root: PathBuf,
    docker_command: Option<String>,
    sampler: Option<(oneshot::Sender<()>, JoinHandle<Vec<ResourceSample>>)>,
}

impl Default for ProcResourceMonitor {
    fn default() -> Self {
        Self::new("/proc")
    }
}

impl ProcResourceMonitor {
    pub fn new(proc_root: impl Into<PathBuf>) -> Self {
        Self {
            proc_root: proc_root.into(),
            docker_command: None,
            sampler: None,
        }
    }

    /// Also sample the platform's container through `<command> stats`.
    pub fn with_container_stats(mut self, docker_command: impl Into<String>) -> Self {
        self.docker_command = Some(docker_command.into());
        self
    }
}

struct ContainerStats {
    command: String,
    container: String,
}

impl ContainerStats {
    async fn sample(&self) -> Option<ContainerSample> {
        let mut command = Command::new(&self.command);
        command
            .args(["stats", "--no-stream", "--format", "{{json .}}"])
            .arg(&self.container)
            .kill_on_drop(true);

        let output = match tokio::time::timeout(CONTAINER_STATS_TIMEOUT, command.output()).await {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => {
                debug!("Cannot run {} stats: {}", self.command, e);
                return None;
            }
            Err(_) => {
                debug!("{} stats {} timed out", self.command, self.container);
                return None;
            }
        };
        if !output.status.success() {
            debug!(
                "{} stats {} failed: {}",
                self.command,
                self.container,
                String::from_utf8_lossy(&output.stderr).trim()
            );
            return None;
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        let line = stdout.lines().find(|l| !l.trim().is_empty())?;
        parse_container_stats(line)
    }
}

struct ProcReader {
    root: PathBuf,
}

impl ProcReader {
    async fn read(&self, name: &str) -> Option<String> {
        match tokio::fs::read_to_string(self.root.join(name)).await {
            Ok(content) => Some(content),
            Err(e) => {
                debug!("Cannot read {}: {}", self.root.join(name).display(), e);
                None
            }
        }
    }

    async fn cpu(&self) -> Option<CpuTimes> {
        parse_cpu_times(&self.read("stat").await?)
    }

    async fn sample(&self, previous_cpu: &mut Option<CpuTimes>) -> Option<ResourceSample> {
        let cpu = self.cpu().await?;
        let cpu_percent = previous_cpu
            .replace(cpu)
            .map_or(0.0, |earlier| cpu.percent_since(&earlier));
        let memory_percent = parse_memory_percent(&self.read("meminfo").await?)?;
        let (read, written) = self
            .read("diskstats")
            .await
            .map_or((0, 0), |s| parse_disk_bytes(&s));
        let (recv, sent) = self
            .read("net/dev")
            .await
            .map_or((0, 0), |s| parse_network_bytes(&s));

        Some(ResourceSample {
            timestamp: Utc::now(),
            cpu_percent,
            memory_percent,
            disk_read_mb: read as f64 / BYTES_PER_MB,
            disk_write_mb: written as f64 / BYTES_PER_MB,
            network_sent_mb: sent as f64 / BYTES_PER_MB,
            network_recv_mb: recv as f64 / BYTES_PER_MB,
            container: None,
        })
    }
}

#[async_trait]
impl ResourceMonitor for ProcResourceMonitor {
    async fn start_sampling(&mut self, interval: Duration, container: Option<&str>) {
        if self.sampler.is_some() {
            warn!("Resource sampling already running, restarting");
            let _ = self.stop_sampling().await;
        }

        let reader = ProcReader {
            root: self.proc_root.clone(),
        };
        let container_stats = self
            .docker_command
            .clone()
            .zip(container.map(str::to_string))
            .map(|(command, container)| ContainerStats { command, container });
        if let Some(stats) = &container_stats {
            debug!("Sampling container {} alongside the host", stats.container);
        }
        let (stop_tx, mut stop_rx) = oneshot::channel();

        let handle = tokio::spawn(async move {
            let mut samples = Vec::new();
            let mut previous_cpu = reader.cpu().await;
            let mut ticker =
                tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = &mut stop_rx => break,
                    _ = ticker.tick() => {
                        if let Some(mut sample) = reader.sample(&mut previous_cpu).await {
                            if let Some(stats) = &container_stats {
                                sample.container = stats.sample().await;
                            }
                            samples.push(sample);
                        }
                    }
                }
            }
            samples
        });

        self.sampler = Some((stop_tx, handle));
    }

    async fn stop_sampling(&mut self) -> Option<MetricsRecord> {
        let (stop_tx, handle) = self.sampler.take()?;
        let _ = stop_tx.send(());
        match handle.await {
            Ok(samples) => MetricsRecord::from_samples(samples),
            Err(e) => {
                warn!("Resource sampler failed: {}", e);
                None
            }
        }
    }
}

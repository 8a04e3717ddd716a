//! # Utility Functions and Helper Module
//!
//! Small helpers shared by the producer, consumer, orchestrator and the
//! console output.
//!
//! ## Key Functionality Categories
//!
//! - **Cancellation**: [`StopHandle`], the shared running flag
//! - **Naming**: benchmark topic names
//! - **Formatting**: human-readable durations and byte counts
//! - **Display Helpers**: table formatting and progress indicators
//!
//! ## Usage Examples
//!
//! ```rust
//! use broker_benchmark::utils::*;
//! use std::time::Duration;
//!
//! assert_eq!(format_duration(Duration::from_micros(1500)), "1.50ms");
//! assert_eq!(format_bytes(1536), "1.50 KB");
//! assert_eq!(topic_name("redpanda", "light_load", 1700000000), "perf-test-redpanda-light_load-1700000000");
//! ```

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

const ARMED: u8 = 0;
const RUNNING: u8 = 1;
const STOPPED: u8 = 2;

/// Shared running flag observed by workers at the top of every loop
/// iteration.
///
/// Clones share the flag. A handle starts armed; [`StopHandle::stop`] is
/// final for the current connection, including a stop issued before the run
/// begins. Only reconnecting re-arms it.
#[derive(Clone, Debug)]
pub struct StopHandle {
    state: Arc<AtomicU8>,
}

impl Default for StopHandle {
    fn default() -> Self {
        Self {
            state: Arc::new(AtomicU8::new(ARMED)),
        }
    }
}

impl StopHandle {
    pub fn new() -> Self {
        Self::default()
    }

    /// Move from armed to running. Returns false when a stop was requested
    /// first; the flag then stays down.
    pub(crate) fn start(&self) -> bool {
        match self
            .state
            .compare_exchange(ARMED, RUNNING, Ordering::AcqRel, Ordering::Acquire)
        {
            Ok(_) => true,
            Err(current) => current == RUNNING,
        }
    }

    /// Clear an earlier stop for a fresh connection.
    pub(crate) fn rearm(&self) {
        self.state.store(ARMED, Ordering::Release);
    }

    /// Ask every worker sharing this flag to finish its current operation
    /// and exit.
    pub fn stop(&self) {
        self.state.store(STOPPED, Ordering::Release);
    }

    pub fn is_running(&self) -> bool {
        self.state.load(Ordering::Acquire) == RUNNING
    }

    pub fn is_stopped(&self) -> bool {
        self.state.load(Ordering::Acquire) == STOPPED
    }
}

/// Topic used for one benchmark run.
///
/// The unix timestamp keeps repeated runs of the same test from reading each
/// other's records.
pub fn topic_name(platform: &str, test_name: &str, unix_seconds: i64) -> String {
    format!("perf-test-{}-{}-{}", platform, test_name, unix_seconds)
}

/// Format a duration in a human-readable way
///
/// ## Examples
///
/// ```rust
/// # use broker_benchmark::utils::format_duration;
/// # use std::time::Duration;
/// assert_eq!(format_duration(Duration::from_nanos(750)), "750ns");
/// assert_eq!(format_duration(Duration::from_micros(2500)), "2.50ms");
/// assert_eq!(format_duration(Duration::from_secs(90)), "1m 30s");
/// ```
pub fn format_duration(duration: Duration) -> String {
    let total_ns = duration.as_nanos();

    if total_ns < 1_000 {
        format!("{}ns", total_ns)
    } else if total_ns < 1_000_000 {
        format!("{:.2}μs", total_ns as f64 / 1_000.0)
    } else if total_ns < 1_000_000_000 {
        format!("{:.2}ms", total_ns as f64 / 1_000_000.0)
    } else if total_ns < 60_000_000_000 {
        format!("{:.2}s", total_ns as f64 / 1_000_000_000.0)
    } else {
        let seconds = duration.as_secs();
        let minutes = seconds / 60;
        let remaining_seconds = seconds % 60;

        if minutes < 60 {
            format!("{}m {}s", minutes, remaining_seconds)
        } else {
            let hours = minutes / 60;
            let remaining_minutes = minutes % 60;
            format!("{}h {}m {}s", hours, remaining_minutes, remaining_seconds)
        }
    }
}

/// Format a byte count with binary (1024-based) units
pub fn format_bytes(bytes: u64) -> String {
    let bytes = bytes as f64;
    if bytes < 1024.0 {
        format!("{} B", bytes)
    } else if bytes < 1024.0 * 1024.0 {
        format!("{:.2} KB", bytes / 1024.0)
    } else if bytes < 1024.0 * 1024.0 * 1024.0 {
        format!("{:.2} MB", bytes / (1024.0 * 1024.0))
    } else {
        format!("{:.2} GB", bytes / (1024.0 * 1024.0 * 1024.0))
    }
}

/// Render one table row with fixed column widths
///
/// Missing widths default to 10 characters.
pub fn table_row(columns: &[&str], widths: &[usize]) -> String {
    let mut row = String::from("|");
    for (i, column) in columns.iter().enumerate() {
        let width = widths.get(i).copied().unwrap_or(10);
        row.push_str(&format!(" {:width$} |", column, width = width));
    }
    row
}

/// Render a table separator matching `widths`
///
/// ```text
/// +----------------+-----------+-------------+
/// | Metric         | Kafka     | Redpanda    |
/// +----------------+-----------+-------------+
/// ```
pub fn table_separator(widths: &[usize]) -> String {
    let mut line = String::from("+");
    for &width in widths {
        line.push_str(&"-".repeat(width + 2));
        line.push('+');
    }
    line
}

pub fn print_table_row(columns: &[&str], widths: &[usize]) {
    println!("{}", table_row(columns, widths));
}

pub fn print_table_separator(widths: &[usize]) {
    println!("{}", table_separator(widths));
}

/// Create a progress bar-like indicator
///
/// ```rust
/// # use broker_benchmark::utils::create_progress_indicator;
/// assert_eq!(create_progress_indicator(0, 100, 10), "░░░░░░░░░░");
/// assert_eq!(create_progress_indicator(50, 100, 10), "█████░░░░░");
/// assert_eq!(create_progress_indicator(100, 100, 10), "██████████");
/// ```
pub fn create_progress_indicator(current: u64, total: u64, width: usize) -> String {
    if total == 0 {
        return "█".repeat(width);
    }

    let progress = (current as f64 / total as f64).min(1.0);
    let filled = ((progress * width as f64) as usize).min(width);
    let empty = width - filled;

    format!("{}{}", "█".repeat(filled), "░".repeat(empty))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stop_handle_is_shared() {
        let handle = StopHandle::new();
        assert!(!handle.is_running());

        let clone = handle.clone();
        handle.start();
        assert!(clone.is_running());

        clone.stop();
        assert!(!handle.is_running());
        assert!(handle.is_stopped());
    }

    #[test]
    fn test_stop_before_start_is_kept() {
        let handle = StopHandle::new();
        handle.stop();

        assert!(!handle.start());
        assert!(!handle.is_running());

        handle.rearm();
        assert!(handle.start());
        assert!(handle.start(), "starting twice keeps running");
        assert!(handle.is_running());
    }

    #[test]
    fn test_topic_name() {
        assert_eq!(
            topic_name("kafka", "medium_load", 42),
            "perf-test-kafka-medium_load-42"
        );
    }

    #[test]
    fn test_format_duration() {
        assert_eq!(format_duration(Duration::from_nanos(500)), "500ns");
        assert_eq!(format_duration(Duration::from_micros(1500)), "1.50ms");
        assert_eq!(format_duration(Duration::from_millis(2500)), "2.50s");
        assert_eq!(format_duration(Duration::from_secs(3725)), "1h 2m 5s");
    }

    #[test]
    fn test_format_bytes() {
        assert_eq!(format_bytes(512), "512 B");
        assert_eq!(format_bytes(1536), "1.50 KB");
        assert_eq!(format_bytes(2_621_440), "2.50 MB");
    }

    #[test]
    fn test_table_helpers() {
        let widths = [6, 4];
        assert_eq!(table_separator(&widths), "+--------+------+");
        assert_eq!(table_row(&["a", "bb"], &widths), "| a      | bb   |");
    }

    #[test]
    fn test_progress_indicator() {
        assert_eq!(create_progress_indicator(0, 0, 3), "███");
        assert_eq!(create_progress_indicator(300, 100, 4), "████");
        assert_eq!(create_progress_indicator(25, 100, 4), "█░░░");
    }
}

//! Progress display module
//!
//! Formats session progress snapshots into one-line status reports.

use std::time::{Duration, Instant};

use tracing::info;

use crate::session::{SessionProgress, SessionState};

/// Format bytes to human readable string
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: &[&str] = &["B", "KB", "MB", "GB", "TB"];
    let mut size = bytes as f64;
    let mut unit_index = 0;

    while size >= 1024.0 && unit_index < UNITS.len() - 1 {
        size /= 1024.0;
        unit_index += 1;
    }

    format!("{:.2} {}", size, UNITS[unit_index])
}

/// Format speed to human readable string
pub fn format_speed(bytes_per_sec: f64) -> String {
    format!("{}/s", format_bytes(bytes_per_sec as u64))
}

/// Format duration to human readable string
pub fn format_duration(duration: Duration) -> String {
    let total_secs = duration.as_secs();
    let hours = total_secs / 3600;
    let minutes = (total_secs % 3600) / 60;
    let seconds = total_secs % 60;

    if hours > 0 {
        format!("{}h {}m {}s", hours, minutes, seconds)
    } else if minutes > 0 {
        format!("{}m {}s", minutes, seconds)
    } else {
        format!("{}s", seconds)
    }
}

/// Status line for a progress snapshot
pub fn status_line(progress: &SessionProgress) -> String {
    let eta = progress.eta.map(format_duration).unwrap_or_else(|| "-".to_string());
    format!(
        "{:.1}% | {} / {} | {} | peers: {} | ETA: {}",
        progress.fraction() * 100.0,
        format_bytes(progress.bytes_downloaded),
        format_bytes(progress.total_bytes),
        format_speed(progress.download_rate),
        progress.peer_count,
        eta,
    )
}

/// Rate-limited progress reporter for the CLI
#[derive(Debug)]
pub struct ProgressDisplay {
    start_time: Instant,
    last_update: Option<Instant>,
    update_interval: Duration,
    quiet: bool,
}

impl ProgressDisplay {
    pub fn new(quiet: bool) -> Self {
        Self::with_interval(quiet, Duration::from_secs(1))
    }

    /// Create a progress display with custom update interval
    pub fn with_interval(quiet: bool, interval: Duration) -> Self {
        Self {
            start_time: Instant::now(),
            last_update: None,
            update_interval: interval,
            quiet,
        }
    }

    /// Report `progress` unless the last report is too recent. Returns
    /// whether a line was emitted.
    pub fn update(&mut self, progress: &SessionProgress) -> bool {
        if self.quiet || progress.state != SessionState::Downloading {
            return false;
        }
        let now = Instant::now();
        if self.last_update.is_some_and(|last| now.duration_since(last) < self.update_interval) {
            return false;
        }
        self.last_update = Some(now);
        info!("{}", status_line(progress));
        true
    }

    /// Report completion
    pub fn complete(&self, progress: &SessionProgress) {
        if self.quiet {
            return;
        }
        info!(
            "Download complete: {} in {}",
            format_bytes(progress.total_bytes),
            format_duration(self.start_time.elapsed())
        );
    }

    /// Get the elapsed time since start
    pub fn elapsed(&self) -> Duration {
        self.start_time.elapsed()
    }

    pub fn is_quiet(&self) -> bool {
        self.quiet
    }
}

//! Trace file retention
//!
//! Deletes `smtp-*.log` files whose last write is older than the configured
//! number of days. Runs once at startup, then daily at 02:00 local time.

use crate::config::Settings;
use chrono::{DateTime, Duration as ChronoDuration, Local, NaiveTime};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Local hour at which the daily sweep runs
const SWEEP_HOUR: u32 = 2;

const SECONDS_PER_DAY: u64 = 24 * 60 * 60;

/// Outcome of one sweep
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SweepReport {
    pub deleted: Vec<PathBuf>,
    pub failed: usize,
}

pub struct LogRetentionSweeper {
    dir: PathBuf,
    enabled: bool,
    retention_days: i64,
}

impl LogRetentionSweeper {
    pub fn new<P: Into<PathBuf>>(dir: P, settings: &Settings) -> Self {
        Self {
            dir: dir.into(),
            enabled: settings.enable_logging,
            retention_days: settings.retention_days,
        }
    }

    pub fn is_active(&self) -> bool {
        self.enabled && self.retention_days > 0
    }

    pub fn sweep(&self) -> SweepReport {
        self.sweep_at(SystemTime::now())
    }

    /// Delete trace files last modified before `now - retention_days`
    ///
    /// Individual failures are logged and counted, never propagated.
    pub fn sweep_at(&self, now: SystemTime) -> SweepReport {
        let mut report = SweepReport::default();
        if !self.is_active() {
            debug!("Trace retention disabled, skipping sweep");
            return report;
        }

        // a window too large to represent keeps every file
        let Some(horizon) = retention_horizon(self.retention_days) else {
            return report;
        };
        let Some(cutoff) = now.checked_sub(horizon) else {
            return report;
        };

        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return report,
            Err(e) => {
                warn!("Cannot read log directory {}: {}", self.dir.display(), e);
                report.failed += 1;
                return report;
            }
        };

        for entry in entries.flatten() {
            let path = entry.path();
            if !is_trace_file(&path) {
                continue;
            }

            let modified = match entry.metadata().and_then(|m| m.modified()) {
                Ok(modified) => modified,
                Err(e) => {
                    warn!("Cannot stat {}: {}", path.display(), e);
                    report.failed += 1;
                    continue;
                }
            };

            if modified >= cutoff {
                continue;
            }

            match fs::remove_file(&path) {
                Ok(()) => {
                    debug!("Deleted expired trace {}", path.display());
                    report.deleted.push(path);
                }
                Err(e) => {
                    warn!("Failed to delete {}: {}", path.display(), e);
                    report.failed += 1;
                }
            }
        }

        if !report.deleted.is_empty() || report.failed > 0 {
            info!(
                "Trace retention sweep: {} deleted, {} failed",
                report.deleted.len(),
                report.failed
            );
        }
        report
    }

    /// Sweep now, then every day at 02:00 until `cancel` fires
    pub async fn run(self, cancel: CancellationToken) {
        if !self.is_active() {
            info!("Trace retention sweeper not started (logging disabled or retention <= 0)");
            return;
        }

        info!(
            "Starting trace retention sweeper ({} days, {})",
            self.retention_days,
            self.dir.display()
        );

        let sweeper = Arc::new(self);
        loop {
            let worker = Arc::clone(&sweeper);
            if let Err(e) = tokio::task::spawn_blocking(move || worker.sweep()).await {
                warn!("Trace retention sweep aborted: {}", e);
            }

            let wait = duration_until_next_run(Local::now(), SWEEP_HOUR);
            debug!("Next trace sweep in {:?}", wait);

            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("Trace retention sweeper stopped");
                    return;
                }
                _ = tokio::time::sleep(wait) => {}
            }
        }
    }
}

fn retention_horizon(days: i64) -> Option<Duration> {
    u64::try_from(days)
        .ok()
        .and_then(|d| d.checked_mul(SECONDS_PER_DAY))
        .map(Duration::from_secs)
}

fn is_trace_file(path: &Path) -> bool {
    path.is_file()
        && path
            .file_name()
            .and_then(|n| n.to_str())
            .map(|n| n.starts_with("smtp-") && n.ends_with(".log"))
            .unwrap_or(false)
}

/// Time until the next occurrence of `hour`:00 local time
pub fn duration_until_next_run(now: DateTime<Local>, hour: u32) -> Duration {
    let fallback = Duration::from_secs(SECONDS_PER_DAY);
    let Some(at) = NaiveTime::from_hms_opt(hour, 0, 0) else {
        return fallback;
    };

    let mut date = now.date_naive();
    for _ in 0..3 {
        if let Some(next) = date.and_time(at).and_local_timezone(Local).earliest() {
            if next > now {
                return (next - now).to_std().unwrap_or(fallback);
            }
        }
        date = date + ChronoDuration::days(1);
    }

    fallback
}

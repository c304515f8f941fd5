//! Retention Manager
//!
//! Periodically compresses and expires per-device journal files.
//! For each device, artifacts are `<device>-<YYYY-MM-DD>.log` and, once
//! compressed, `<device>-<YYYY-MM-DD>.log.gz`:
//! - dated before today and still plain → gzip in place
//! - older than `max_days` → delete (exactly `max_days` old is kept)
//!
//! Each artifact is handled on its own; a failure is logged and the sweep
//! moves on to the next artifact or device.

use std::collections::HashSet;
use std::fs::{self, File};
use std::io::{self, BufReader, BufWriter};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{Local, NaiveDate};
use flate2::write::GzEncoder;
use flate2::Compression;
use once_cell::sync::Lazy;
use regex::Regex;
use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::metrics::MetricsRegistry;

static ARTIFACT_SUFFIX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^(\d{4}-\d{2}-\d{2})\.log(\.gz)?$").expect("artifact pattern is valid")
});

/// A per-device, per-day journal file
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogArtifact {
    pub device: String,
    pub date: NaiveDate,
    pub compressed: bool,
    pub path: PathBuf,
}

impl LogArtifact {
    /// Parse a file name belonging to `device`, None if it is not one of its artifacts
    pub fn parse(dir: &Path, device: &str, file_name: &str) -> Option<Self> {
        let rest = file_name.strip_prefix(device)?.strip_prefix('-')?;
        let caps = ARTIFACT_SUFFIX.captures(rest)?;
        let date = NaiveDate::parse_from_str(&caps[1], "%Y-%m-%d").ok()?;
        Some(Self {
            device: device.to_string(),
            date,
            compressed: caps.get(2).is_some(),
            path: dir.join(file_name),
        })
    }

    /// Whole calendar days between the artifact date and `today`
    pub fn age_days(&self, today: NaiveDate) -> i64 {
        (today - self.date).num_days()
    }
}

/// Errors while processing one artifact
#[derive(Debug, Error)]
pub enum RetentionError {
    #[error("IO error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Compressed copy already exists: {0}")]
    AlreadyCompressed(PathBuf),
}

impl RetentionError {
    fn io(path: &Path, source: io::Error) -> Self {
        Self::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

/// Counts from one sweep
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RetentionReport {
    pub compressed: u32,
    pub deleted: u32,
    pub failed: u32,
}

/// Retention manager
#[derive(Debug, Clone)]
pub struct RetentionManager {
    log_dir: PathBuf,
    devices: Vec<String>,
    max_days: u32,
    /// Plain logs already reported as blocked by an existing `.gz`
    conflicts: Arc<Mutex<HashSet<PathBuf>>>,
}

impl RetentionManager {
    pub fn new(log_dir: impl Into<PathBuf>, devices: Vec<String>, max_days: u32) -> Self {
        Self {
            log_dir: log_dir.into(),
            devices,
            max_days,
            conflicts: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    /// Artifacts of one device, sorted by date
    pub fn artifacts(&self, device: &str) -> io::Result<Vec<LogArtifact>> {
        let mut artifacts = Vec::new();
        for entry in fs::read_dir(&self.log_dir)? {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    warn!(error = %e, "Skipping unreadable log directory entry");
                    continue;
                }
            };
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            if let Some(artifact) = LogArtifact::parse(&self.log_dir, device, name) {
                artifacts.push(artifact);
            }
        }
        artifacts.sort_by_key(|a| (a.date, a.compressed));
        Ok(artifacts)
    }

    /// Run one pass over every device's artifacts
    pub fn sweep(&self, today: NaiveDate) -> RetentionReport {
        let mut report = RetentionReport::default();

        if !self.log_dir.is_dir() {
            debug!(dir = %self.log_dir.display(), "Log directory missing, nothing to retain");
            return report;
        }

        for device in &self.devices {
            let artifacts = match self.artifacts(device) {
                Ok(artifacts) => artifacts,
                Err(e) => {
                    warn!(device = %device, error = %e, "Failed to list log artifacts");
                    report.failed += 1;
                    continue;
                }
            };

            for artifact in artifacts {
                match self.process(&artifact, today) {
                    Ok(Action::Deleted) => report.deleted += 1,
                    Ok(Action::Compressed) => report.compressed += 1,
                    Ok(Action::Kept) => {}
                    Err(RetentionError::AlreadyCompressed(gz)) if !self.first_conflict(&artifact.path) => {
                        debug!(device = %device, path = %gz.display(), "Plain log still shadowed by compressed copy");
                    }
                    Err(e) => {
                        warn!(device = %device, error = %e, "Failed to process log artifact");
                        report.failed += 1;
                    }
                }
            }
        }

        report
    }

    /// True the first time `path` is seen blocked by an existing archive
    fn first_conflict(&self, path: &Path) -> bool {
        self.conflicts
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(path.to_path_buf())
    }

    fn process(&self, artifact: &LogArtifact, today: NaiveDate) -> Result<Action, RetentionError> {
        if artifact.age_days(today) > i64::from(self.max_days) {
            fs::remove_file(&artifact.path).map_err(|e| RetentionError::io(&artifact.path, e))?;
            info!(path = %artifact.path.display(), "Deleted expired log");
            return Ok(Action::Deleted);
        }

        if !artifact.compressed && artifact.date < today {
            compress(&artifact.path)?;
            info!(path = %artifact.path.display(), "Compressed log");
            return Ok(Action::Compressed);
        }

        Ok(Action::Kept)
    }

    /// Sweep on a fixed interval until shutdown, starting immediately
    pub async fn run(self, interval: Duration, metrics: Arc<MetricsRegistry>, mut shutdown: watch::Receiver<bool>) {
        info!(
            dir = %self.log_dir.display(),
            max_days = self.max_days,
            interval = ?interval,
            "Starting retention manager"
        );
        let mut ticker = tokio::time::interval(interval);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let manager = self.clone();
                    let today = Local::now().date_naive();
                    match tokio::task::spawn_blocking(move || manager.sweep(today)).await {
                        Ok(report) => {
                            debug!(?report, "Retention sweep complete");
                            metrics.inc_retention("compressed", u64::from(report.compressed));
                            metrics.inc_retention("deleted", u64::from(report.deleted));
                            metrics.inc_retention("failed", u64::from(report.failed));
                        }
                        Err(e) => error!(error = %e, "Retention sweep panicked"),
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("Shutdown signal received, stopping retention manager");
                        break;
                    }
                }
            }
        }
    }
}

enum Action {
    Kept,
    Compressed,
    Deleted,
}

/// Gzip `path` to `path.gz` and remove the original
fn compress(path: &Path) -> Result<(), RetentionError> {
    let mut gz_name = path.as_os_str().to_owned();
    gz_name.push(".gz");
    let gz_path = PathBuf::from(gz_name);

    if gz_path.exists() {
        return Err(RetentionError::AlreadyCompressed(gz_path));
    }

    let write = || -> io::Result<()> {
        let mut input = BufReader::new(File::open(path)?);
        let output = BufWriter::new(File::create(&gz_path)?);
        let mut encoder = GzEncoder::new(output, Compression::default());
        io::copy(&mut input, &mut encoder)?;
        encoder.finish()?.into_inner().map_err(|e| e.into_error())?.sync_all()?;
        Ok(())
    };

    if let Err(e) = write() {
        // Do not leave a truncated archive next to the original
        let _ = fs::remove_file(&gz_path);
        return Err(RetentionError::io(path, e));
    }

    fs::remove_file(path).map_err(|e| RetentionError::io(path, e))
}

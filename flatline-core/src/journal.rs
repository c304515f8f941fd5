//! Per-device daily journal
//!
//! Appends one plain-text line per poll to `<log_dir>/<device>-<YYYY-MM-DD>.log`.
//! These files are the artifacts the retention manager later compresses and
//! expires. Write failures are logged and dropped.

use std::path::PathBuf;

use chrono::{DateTime, Local, NaiveDate, Utc};
use tokio::io::AsyncWriteExt;
use tracing::warn;

use crate::device::{format_temp, TelemetrySample};

/// Journal file name for a device and calendar day
pub fn artifact_name(device: &str, date: NaiveDate) -> String {
    format!("{}-{}.log", device, date.format("%Y-%m-%d"))
}

/// Status line in the journal format
pub fn status_line(sample: &TelemetrySample, device: &str, restarts: u64) -> String {
    format!(
        "Host: {} | Uptime: {} | Hash: {:.1} GH/s | ASIC: {}°C | VR: {}°C | Shares: {} | Restarts: {}",
        sample.hostname.as_deref().unwrap_or(device),
        sample.display_uptime(),
        sample.display_hashrate(),
        format_temp(sample.asic_temp),
        format_temp(sample.vr_temp),
        sample.shares,
        restarts
    )
}

/// Daily journal for one device
#[derive(Debug, Clone)]
pub struct DeviceJournal {
    dir: PathBuf,
    device: String,
}

impl DeviceJournal {
    pub fn new(dir: impl Into<PathBuf>, device: impl Into<String>) -> Self {
        Self {
            dir: dir.into(),
            device: device.into(),
        }
    }

    /// Path of the journal for the local calendar day of `now`
    pub fn path_for(&self, now: DateTime<Utc>) -> PathBuf {
        let date = now.with_timezone(&Local).date_naive();
        self.dir.join(artifact_name(&self.device, date))
    }

    /// Append a timestamped line; never fails
    pub async fn append(&self, now: DateTime<Utc>, line: &str) {
        if let Err(e) = self.try_append(now, line).await {
            warn!(device = %self.device, error = %e, "Failed to write journal line");
        }
    }

    async fn try_append(&self, now: DateTime<Utc>, line: &str) -> std::io::Result<()> {
        tokio::fs::create_dir_all(&self.dir).await?;
        let stamp = now.with_timezone(&Local).format("%d %b %Y %H:%M:%S");
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.path_for(now))
            .await?;
        file.write_all(format!("[{}] {}\n", stamp, line).as_bytes())
            .await?;
        file.flush().await
    }
}

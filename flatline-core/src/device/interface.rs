//! Device client trait and common types
//!
//! Defines the boundary between the monitor and a networked miner. Everything
//! past this trait sees classified outcomes only, never raw transport errors.

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Identity of a monitored device
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DeviceConfig {
    /// Unique name, also used as the journal file prefix
    pub name: String,
    /// Network address (host or host:port)
    pub address: String,
}

impl DeviceConfig {
    /// Create a new device identity
    pub fn new(name: impl Into<String>, address: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            address: address.into(),
        }
    }

    /// Derive a device name from a bare address (`10.0.0.5` -> `10_0_0_5`)
    pub fn from_address(address: &str) -> Self {
        Self::new(address.replace(['.', ':'], "_"), address)
    }
}

impl fmt::Display for DeviceConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name)
    }
}

/// Point-in-time telemetry read from a device
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TelemetrySample {
    /// Accepted share counter, resets on reboot
    pub shares: u64,
    /// Time since the device booted
    pub uptime: Duration,
    /// Hashrate in GH/s
    pub hashrate: f64,
    /// ASIC temperature in Celsius
    pub asic_temp: Option<f64>,
    /// Voltage regulator temperature in Celsius
    pub vr_temp: Option<f64>,
    /// Hostname the device reports for itself
    pub hostname: Option<String>,
    /// When the sample was taken
    pub timestamp: DateTime<Utc>,
}

impl TelemetrySample {
    /// Hashrate rounded up to one decimal place, the way operators read it
    pub fn display_hashrate(&self) -> f64 {
        (self.hashrate * 10.0).ceil() / 10.0
    }

    /// Uptime as `H:MM:SS`, with a day prefix past 24 hours
    pub fn display_uptime(&self) -> String {
        format_uptime(self.uptime)
    }
}

/// Format a duration like `3 days, 4:05:06`
pub fn format_uptime(uptime: Duration) -> String {
    let secs = uptime.as_secs();
    let days = secs / 86_400;
    let hours = (secs % 86_400) / 3_600;
    let minutes = (secs % 3_600) / 60;
    let seconds = secs % 60;
    match days {
        0 => format!("{}:{:02}:{:02}", hours, minutes, seconds),
        1 => format!("1 day, {}:{:02}:{:02}", hours, minutes, seconds),
        _ => format!("{} days, {}:{:02}:{:02}", days, hours, minutes, seconds),
    }
}

/// Format an optional temperature, `N/A` when the device did not report one
pub fn format_temp(temp: Option<f64>) -> String {
    match temp {
        Some(t) => format!("{:.1}", t),
        None => "N/A".to_string(),
    }
}

/// Result of a restart command
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RestartOutcome {
    /// Whether the device accepted the command
    pub success: bool,
    /// Diagnostic detail (status code, transport error, dry-run note)
    pub detail: Option<String>,
}

impl RestartOutcome {
    /// Create a successful outcome
    pub fn success() -> Self {
        Self {
            success: true,
            detail: None,
        }
    }

    /// Create a successful outcome with detail
    pub fn success_with_detail(detail: impl Into<String>) -> Self {
        Self {
            success: true,
            detail: Some(detail.into()),
        }
    }

    /// Create a failed outcome
    pub fn failed(detail: impl Into<String>) -> Self {
        Self {
            success: false,
            detail: Some(detail.into()),
        }
    }

    /// Failure reason, or a generic one if none was recorded
    pub fn reason(&self) -> &str {
        self.detail.as_deref().unwrap_or("unknown error")
    }
}

/// Classified failure of a telemetry read
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DeviceError {
    /// Device could not be reached (connection refused, DNS, TLS)
    #[error("Device unreachable: {0}")]
    Unreachable(String),

    /// Device answered with something that is not telemetry
    #[error("Invalid telemetry response: {0}")]
    InvalidResponse(String),

    /// Request did not complete in time
    #[error("Request timed out after {0:?}")]
    Timeout(Duration),
}

/// Device client trait
///
/// Implementations must bound both calls by a request timeout and must not
/// retry; retry policy belongs to the restart controller and the scheduler.
#[async_trait]
pub trait DeviceClient: Send + Sync {
    /// Read current telemetry from the device at `address`
    async fn fetch_telemetry(&self, address: &str) -> Result<TelemetrySample, DeviceError>;

    /// Command the device at `address` to restart
    async fn issue_restart(&self, address: &str) -> RestartOutcome;
}

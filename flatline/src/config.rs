//! Configuration module for Flatline
//!
//! Handles loading and validating configuration from YAML files and CLI overrides.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use flatline_core::device::DeviceConfig;
use flatline_core::restart::RestartPolicy;
use flatline_core::scheduler::MonitorSettings;

use crate::cli::Cli;

/// Restart behaviour
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RestartConfig {
    /// Minimum time between restart attempts for one device
    #[serde(with = "humantime_serde", default = "default_cooldown")]
    pub cooldown: Duration,

    /// Stop restarting after this many attempts without progress
    #[serde(default)]
    pub max_attempts: Option<u32>,

    /// Log restarts but don't send them
    #[serde(default)]
    pub dry_run: bool,
}

impl Default for RestartConfig {
    fn default() -> Self {
        Self {
            cooldown: default_cooldown(),
            max_attempts: None,
            dry_run: false,
        }
    }
}

/// Alert delivery configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlertsConfig {
    /// Minimum gap between repeated unreachable/restart-failure alerts per device
    #[serde(with = "humantime_serde", default = "default_alert_min_interval")]
    pub min_interval: Duration,

    /// Send a fleet summary on startup
    #[serde(default = "default_true")]
    pub startup_summary: bool,

    /// Delivery timeout
    #[serde(with = "humantime_serde", default = "default_request_timeout")]
    pub timeout: Duration,
}

impl Default for AlertsConfig {
    fn default() -> Self {
        Self {
            min_interval: default_alert_min_interval(),
            startup_summary: true,
            timeout: default_request_timeout(),
        }
    }
}

/// Daily log retention
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetentionConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Time between retention sweeps
    #[serde(with = "humantime_serde", default = "default_retention_interval")]
    pub interval: Duration,
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval: default_retention_interval(),
        }
    }
}

/// Metrics export configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    /// Whether metrics are enabled
    #[serde(default)]
    pub enabled: bool,

    /// Port to expose metrics on
    #[serde(default = "default_metrics_port")]
    pub port: u16,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            port: default_metrics_port(),
        }
    }
}

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Time between polls of one device
    #[serde(with = "humantime_serde", default = "default_interval")]
    pub interval: Duration,

    /// Flat time after which a device counts as stalled
    #[serde(with = "humantime_serde", default = "default_stall_threshold")]
    pub stall_threshold: Duration,

    /// Timeout for device requests
    #[serde(with = "humantime_serde", default = "default_request_timeout")]
    pub request_timeout: Duration,

    /// Directory for per-device daily logs (`~` is expanded)
    #[serde(default = "default_log_dir")]
    pub log_dir: PathBuf,

    /// Days to keep daily logs
    #[serde(default = "default_max_days")]
    pub max_days: u32,

    /// Webhook URL; no URL disables notifications
    #[serde(default)]
    pub notify_url: Option<String>,

    #[serde(default)]
    pub restart: RestartConfig,

    #[serde(default)]
    pub alerts: AlertsConfig,

    #[serde(default)]
    pub retention: RetentionConfig,

    #[serde(default)]
    pub metrics: MetricsConfig,

    /// Monitored devices
    #[serde(default)]
    pub devices: Vec<DeviceConfig>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            interval: default_interval(),
            stall_threshold: default_stall_threshold(),
            request_timeout: default_request_timeout(),
            log_dir: default_log_dir(),
            max_days: default_max_days(),
            notify_url: None,
            restart: RestartConfig::default(),
            alerts: AlertsConfig::default(),
            retention: RetentionConfig::default(),
            metrics: MetricsConfig::default(),
            devices: Vec::new(),
        }
    }
}

impl Config {
    /// Load configuration from a YAML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())
            .with_context(|| format!("Failed to read config file: {:?}", path.as_ref()))?;
        Self::from_yaml(&content)
    }

    /// Parse configuration from YAML string
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        serde_yaml::from_str(yaml).context("Failed to parse YAML configuration")
    }

    /// Apply command line overrides
    ///
    /// A positional address replaces the configured fleet with that one device.
    pub fn apply_cli(&mut self, cli: &Cli) {
        if let Some(address) = &cli.address {
            self.devices = vec![DeviceConfig::from_address(address)];
        }
        if let Some(interval) = cli.interval {
            self.interval = interval;
        }
        if let Some(log_dir) = &cli.log_dir {
            self.log_dir = log_dir.clone();
        }
        if let Some(max_days) = cli.max_days {
            self.max_days = max_days;
        }
        if cli.notify_url.is_some() {
            self.notify_url = cli.notify_url.clone();
        }
        if cli.dry_run {
            self.restart.dry_run = true;
        }
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.devices.is_empty() {
            anyhow::bail!("at least one device must be configured (or pass an address)");
        }

        let mut names = HashSet::new();
        for device in &self.devices {
            if device.name.trim().is_empty() {
                anyhow::bail!("device name must not be empty (address {})", device.address);
            }
            if device.name.contains(['/', '\\']) || device.name == "." || device.name == ".." {
                anyhow::bail!("device name {:?} is not usable as a file name", device.name);
            }
            if device.address.trim().is_empty() {
                anyhow::bail!("device {} has no address", device.name);
            }
            if !names.insert(device.name.as_str()) {
                anyhow::bail!("duplicate device name: {}", device.name);
            }
        }

        for (name, value) in [
            ("interval", self.interval),
            ("stall_threshold", self.stall_threshold),
            ("request_timeout", self.request_timeout),
            ("restart.cooldown", self.restart.cooldown),
            ("alerts.min_interval", self.alerts.min_interval),
            ("alerts.timeout", self.alerts.timeout),
            ("retention.interval", self.retention.interval),
        ] {
            if value.is_zero() {
                anyhow::bail!("{} must be > 0", name);
            }
        }

        if self.max_days == 0 {
            anyhow::bail!("max_days must be > 0");
        }
        if self.restart.max_attempts == Some(0) {
            anyhow::bail!("restart.max_attempts must be > 0 when set");
        }
        if self.metrics.enabled && self.metrics.port == 0 {
            anyhow::bail!("metrics.port must be > 0 when metrics are enabled");
        }
        Ok(())
    }

    /// Log directory with a leading `~` expanded
    pub fn log_dir(&self) -> PathBuf {
        expand_home(&self.log_dir, std::env::var_os("HOME").map(PathBuf::from))
    }

    /// Per-device monitor settings
    pub fn monitor_settings(&self) -> MonitorSettings {
        MonitorSettings {
            interval: self.interval,
            stall_threshold: self.stall_threshold,
            request_timeout: self.request_timeout,
            alert_min_interval: self.alerts.min_interval,
            restart: RestartPolicy {
                cooldown: self.restart.cooldown,
                max_attempts: self.restart.max_attempts,
                timeout: self.request_timeout,
                dry_run: self.restart.dry_run,
            },
        }
    }

    pub fn device_names(&self) -> Vec<String> {
        self.devices.iter().map(|d| d.name.clone()).collect()
    }
}

fn expand_home(path: &Path, home: Option<PathBuf>) -> PathBuf {
    let Some(home) = home else {
        return path.to_path_buf();
    };
    match path.strip_prefix("~") {
        Ok(rest) => home.join(rest),
        Err(_) => path.to_path_buf(),
    }
}

// Default value functions
fn default_interval() -> Duration {
    Duration::from_secs(60)
}

fn default_stall_threshold() -> Duration {
    Duration::from_secs(300) // 5 minutes
}

fn default_request_timeout() -> Duration {
    Duration::from_secs(5)
}

fn default_log_dir() -> PathBuf {
    PathBuf::from("./logs")
}

fn default_max_days() -> u32 {
    7
}

fn default_cooldown() -> Duration {
    Duration::from_secs(300)
}

fn default_alert_min_interval() -> Duration {
    Duration::from_secs(600)
}

fn default_retention_interval() -> Duration {
    Duration::from_secs(3600)
}

fn default_metrics_port() -> u16 {
    9108
}

fn default_true() -> bool {
    true
}

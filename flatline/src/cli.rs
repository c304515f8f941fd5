//! CLI argument parsing for Flatline

use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;

/// Flatline - restarts networked miners whose share counter stops moving
#[derive(Debug, Parser)]
#[command(name = "flatline")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Monitor a single device at this address instead of the configured fleet
    pub address: Option<String>,

    /// Path to configuration file
    #[arg(short, long, default_value = "flatline.yaml")]
    pub config: PathBuf,

    /// Poll interval (e.g. 30s, 2m), overrides config
    #[arg(short, long, value_parser = humantime::parse_duration)]
    pub interval: Option<Duration>,

    /// Directory for per-device daily logs, overrides config
    #[arg(long)]
    pub log_dir: Option<PathBuf>,

    /// Days to keep daily logs, overrides config
    #[arg(long)]
    pub max_days: Option<u32>,

    /// Webhook URL for alerts, overrides config
    #[arg(long, env = "FLATLINE_NOTIFY_URL")]
    pub notify_url: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info", env = "FLATLINE_LOG_LEVEL")]
    pub log_level: String,

    /// Output logs in JSON format
    #[arg(long, default_value = "false", env = "FLATLINE_LOG_JSON")]
    pub log_json: bool,

    /// Dry run mode - log restarts but don't send them
    #[arg(long, default_value = "false")]
    pub dry_run: bool,

    /// Poll every device once, report and exit
    #[arg(long)]
    pub once: bool,
}

impl Cli {
    /// Parse CLI arguments
    pub fn parse_args() -> Self {
        Self::parse()
    }
}

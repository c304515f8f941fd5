//! Alert Dispatcher
//!
//! Renders device events into operator messages and delivers them through a
//! `Notifier`. Delivery is a single bounded attempt; any failure is logged and
//! swallowed so a broken notification channel never disturbs monitoring.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::device::{format_temp, DeviceConfig, TelemetrySample};
use crate::metrics::MetricsRegistry;

/// Alert categories, used for per-device rate limiting
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AlertCategory {
    StartupSummary,
    NoShareRestart,
    DeviceUnreachable,
    RestartFailure,
    RestartsExhausted,
}

impl AlertCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            AlertCategory::StartupSummary => "startup_summary",
            AlertCategory::NoShareRestart => "no_share_restart",
            AlertCategory::DeviceUnreachable => "device_unreachable",
            AlertCategory::RestartFailure => "restart_failure",
            AlertCategory::RestartsExhausted => "restarts_exhausted",
        }
    }
}

impl std::fmt::Display for AlertCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One line of the startup summary
#[derive(Debug, Clone)]
pub struct DeviceSummary {
    pub device: DeviceConfig,
    /// Telemetry, or the reason it could not be read
    pub telemetry: Result<TelemetrySample, String>,
}

/// Events the monitor notifies operators about
#[derive(Debug, Clone)]
pub enum AlertEvent {
    /// Monitor started; one entry per configured device
    StartupSummary { devices: Vec<DeviceSummary> },
    /// Device made no progress and a restart was accepted
    NoShareRestart {
        device: DeviceConfig,
        shares: Option<u64>,
        stalled_for: Duration,
        attempt: u32,
        sample: Option<TelemetrySample>,
    },
    /// Telemetry read failed
    DeviceUnreachable { device: DeviceConfig, reason: String },
    /// Restart command was rejected or timed out
    RestartFailure {
        device: DeviceConfig,
        attempt: u32,
        reason: String,
    },
    /// Restart ceiling reached, monitor stops restarting this device
    RestartsExhausted {
        device: DeviceConfig,
        attempts: u32,
        stalled_for: Duration,
    },
}

impl AlertEvent {
    pub fn category(&self) -> AlertCategory {
        match self {
            AlertEvent::StartupSummary { .. } => AlertCategory::StartupSummary,
            AlertEvent::NoShareRestart { .. } => AlertCategory::NoShareRestart,
            AlertEvent::DeviceUnreachable { .. } => AlertCategory::DeviceUnreachable,
            AlertEvent::RestartFailure { .. } => AlertCategory::RestartFailure,
            AlertEvent::RestartsExhausted { .. } => AlertCategory::RestartsExhausted,
        }
    }

    /// Device the event is about (None for the fleet-wide summary)
    pub fn device(&self) -> Option<&DeviceConfig> {
        match self {
            AlertEvent::StartupSummary { .. } => None,
            AlertEvent::NoShareRestart { device, .. }
            | AlertEvent::DeviceUnreachable { device, .. }
            | AlertEvent::RestartFailure { device, .. }
            | AlertEvent::RestartsExhausted { device, .. } => Some(device),
        }
    }

    /// Render the operator-facing message
    pub fn render(&self) -> String {
        match self {
            AlertEvent::StartupSummary { devices } => {
                let lines: Vec<String> = devices.iter().map(render_summary_line).collect();
                format!(
                    "**🔌 Bitaxe Flatline Monitor Started**\n\n{}",
                    lines.join("\n")
                )
            }
            AlertEvent::NoShareRestart {
                device,
                shares,
                stalled_for,
                attempt,
                sample,
            } => {
                let shares = shares.map_or_else(|| "N/A".to_string(), |s| s.to_string());
                let mut message = format!(
                    "❗ Bitaxe **{}** (`{}`) had no new shares for {} (shares: {}). Restarted (attempt {}).",
                    device.name,
                    device.address,
                    humantime::format_duration(*stalled_for),
                    shares,
                    attempt
                );
                if let Some(sample) = sample {
                    message.push_str(&format!(
                        "\nLast seen: ⏱ {}, 💪 {:.1} GH/s, 🔥 {}°C ASIC / {}°C VR",
                        sample.display_uptime(),
                        sample.display_hashrate(),
                        format_temp(sample.asic_temp),
                        format_temp(sample.vr_temp)
                    ));
                }
                message
            }
            AlertEvent::DeviceUnreachable { device, reason } => format!(
                "🚫 Could not communicate with Bitaxe **{}** (`{}`): {}",
                device.name, device.address, reason
            ),
            AlertEvent::RestartFailure {
                device,
                attempt,
                reason,
            } => format!(
                "⚠️ Bitaxe **{}** (`{}`) failed to restart (attempt {}): {}",
                device.name, device.address, attempt, reason
            ),
            AlertEvent::RestartsExhausted {
                device,
                attempts,
                stalled_for,
            } => format!(
                "🛑 **CRITICAL** Bitaxe **{}** (`{}`) still has no new shares after {} restart attempts ({} without progress). Giving up until it recovers; manual intervention required.",
                device.name,
                device.address,
                attempts,
                humantime::format_duration(*stalled_for)
            ),
        }
    }
}

fn render_summary_line(summary: &DeviceSummary) -> String {
    let device = &summary.device;
    match &summary.telemetry {
        Ok(sample) => format!(
            "**{}** (`{}`) — ⏱ {}, 💪 {:.1} GH/s, 🔥 {}°C ASIC / {}°C VR, ✅ Shares: {}",
            sample.hostname.as_deref().unwrap_or(&device.name),
            device.address,
            sample.display_uptime(),
            sample.display_hashrate(),
            format_temp(sample.asic_temp),
            format_temp(sample.vr_temp),
            sample.shares
        ),
        Err(reason) => format!(
            "**{}** (`{}`) — ⚠️ Error fetching stats: `{}`",
            device.name, device.address, reason
        ),
    }
}

/// Errors from a notification endpoint
#[derive(Debug, Error)]
pub enum NotifyError {
    /// Network-level failure
    #[error("Notification transport error: {0}")]
    Transport(String),

    /// Endpoint answered with a non-success status
    #[error("Notification rejected with status {0}")]
    Rejected(u16),

    /// Delivery did not complete in time
    #[error("Notification timed out after {0:?}")]
    Timeout(Duration),
}

/// Delivery channel for rendered messages
#[async_trait]
pub trait Notifier: Send + Sync {
    /// Deliver one message, once
    async fn deliver(&self, message: &str) -> Result<(), NotifyError>;
}

/// Alert dispatcher
pub struct AlertDispatcher {
    notifier: Option<Arc<dyn Notifier>>,
    timeout: Duration,
    metrics: Arc<MetricsRegistry>,
}

impl AlertDispatcher {
    /// Create a dispatcher; `None` disables delivery
    pub fn new(notifier: Option<Arc<dyn Notifier>>, timeout: Duration, metrics: Arc<MetricsRegistry>) -> Self {
        Self {
            notifier,
            timeout,
            metrics,
        }
    }

    /// Dispatcher that only logs
    pub fn disabled(metrics: Arc<MetricsRegistry>) -> Self {
        Self::new(None, Duration::from_secs(5), metrics)
    }

    pub fn is_enabled(&self) -> bool {
        self.notifier.is_some()
    }

    /// Render and deliver an event; returns whether delivery succeeded.
    ///
    /// Never fails: errors and timeouts are logged here and go no further.
    pub async fn dispatch(&self, event: &AlertEvent) -> bool {
        let category = event.category();
        let Some(notifier) = &self.notifier else {
            debug!(category = %category, "Notifications disabled, alert not sent");
            return false;
        };

        let message = event.render();
        let result = match tokio::time::timeout(self.timeout, notifier.deliver(&message)).await {
            Ok(result) => result,
            Err(_) => Err(NotifyError::Timeout(self.timeout)),
        };

        let device = event.device().map(|d| d.name.as_str()).unwrap_or("-");
        match result {
            Ok(()) => {
                info!(device = device, category = %category, "Alert delivered");
                self.metrics.inc_alert(category.as_str(), "delivered");
                true
            }
            Err(e) => {
                warn!(device = device, category = %category, error = %e, "Alert delivery failed");
                self.metrics.inc_alert(category.as_str(), "failed");
                false
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::sync::Mutex;

    /// Notifier that records messages and can be told to fail or hang
    pub(crate) struct RecordingNotifier {
        pub messages: Mutex<Vec<String>>,
        pub fail: bool,
        pub hang: bool,
    }

    impl RecordingNotifier {
        pub fn new() -> Self {
            Self {
                messages: Mutex::new(Vec::new()),
                fail: false,
                hang: false,
            }
        }

        pub fn failing() -> Self {
            Self {
                fail: true,
                ..Self::new()
            }
        }

        pub fn sent(&self) -> Vec<String> {
            self.messages.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl Notifier for RecordingNotifier {
        async fn deliver(&self, message: &str) -> Result<(), NotifyError> {
            if self.hang {
                std::future::pending::<()>().await;
            }
            if self.fail {
                return Err(NotifyError::Transport("connection refused".to_string()));
            }
            self.messages.lock().unwrap().push(message.to_string());
            Ok(())
        }
    }

    fn device() -> DeviceConfig {
        DeviceConfig::new("axe-1", "10.0.0.1")
    }

    fn sample() -> TelemetrySample {
        TelemetrySample {
            shares: 1234,
            uptime: Duration::from_secs(3_725),
            hashrate: 498.76,
            asic_temp: Some(61.3),
            vr_temp: None,
            hostname: Some("bitaxe-kitchen".to_string()),
            timestamp: chrono::Utc::now(),
        }
    }

    #[test]
    fn test_render_startup_summary() {
        let event = AlertEvent::StartupSummary {
            devices: vec![
                DeviceSummary {
                    device: device(),
                    telemetry: Ok(sample()),
                },
                DeviceSummary {
                    device: DeviceConfig::new("axe-2", "10.0.0.2"),
                    telemetry: Err("timed out".to_string()),
                },
            ],
        };
        let message = event.render();
        assert!(message.starts_with("**🔌 Bitaxe Flatline Monitor Started**"));
        assert!(message.contains("**bitaxe-kitchen** (`10.0.0.1`)"));
        assert!(message.contains("1:02:05"));
        assert!(message.contains("498.8 GH/s"));
        assert!(message.contains("61.3°C ASIC / N/A°C VR"));
        assert!(message.contains("Shares: 1234"));
        assert!(message.contains("**axe-2** (`10.0.0.2`) — ⚠️ Error fetching stats: `timed out`"));
    }

    #[test]
    fn test_render_device_events() {
        let restart = AlertEvent::NoShareRestart {
            device: device(),
            shares: Some(100),
            stalled_for: Duration::from_secs(330),
            attempt: 1,
            sample: Some(TelemetrySample {
                hashrate: 400.0,
                ..sample()
            }),
        };
        let message = restart.render();
        assert!(message.contains("`10.0.0.1`"));
        assert!(message.contains("💪 400.0 GH/s"));
        assert!(message.contains("5m 30s"));
        assert!(message.contains("shares: 100"));
        assert!(message.contains("attempt 1"));
        assert_eq!(restart.category(), AlertCategory::NoShareRestart);

        let unreachable = AlertEvent::DeviceUnreachable {
            device: device(),
            reason: "connection refused".to_string(),
        };
        assert!(unreachable.render().contains("Could not communicate"));
        assert_eq!(unreachable.device().unwrap().name, "axe-1");

        let failure = AlertEvent::RestartFailure {
            device: device(),
            attempt: 2,
            reason: "HTTP 500".to_string(),
        };
        assert!(failure.render().contains("failed to restart (attempt 2): HTTP 500"));

        let exhausted = AlertEvent::RestartsExhausted {
            device: device(),
            attempts: 5,
            stalled_for: Duration::from_secs(3_600),
        };
        assert!(exhausted.render().contains("CRITICAL"));
        assert!(exhausted.render().contains("5 restart attempts"));
    }

    #[tokio::test]
    async fn test_dispatch_delivers() {
        let notifier = Arc::new(RecordingNotifier::new());
        let dispatcher = AlertDispatcher::new(
            Some(notifier.clone()),
            Duration::from_secs(5),
            Arc::new(MetricsRegistry::new()),
        );
        let event = AlertEvent::DeviceUnreachable {
            device: device(),
            reason: "timeout".to_string(),
        };

        assert!(dispatcher.dispatch(&event).await);
        assert_eq!(notifier.sent().len(), 1);
    }

    #[tokio::test]
    async fn test_dispatch_swallows_failure() {
        let dispatcher = AlertDispatcher::new(
            Some(Arc::new(RecordingNotifier::failing())),
            Duration::from_secs(5),
            Arc::new(MetricsRegistry::new()),
        );
        let event = AlertEvent::RestartFailure {
            device: device(),
            attempt: 1,
            reason: "HTTP 500".to_string(),
        };

        assert!(!dispatcher.dispatch(&event).await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_dispatch_bounded_by_timeout() {
        let notifier = Arc::new(RecordingNotifier {
            hang: true,
            ..RecordingNotifier::new()
        });
        let dispatcher = AlertDispatcher::new(
            Some(notifier),
            Duration::from_secs(5),
            Arc::new(MetricsRegistry::new()),
        );
        let event = AlertEvent::DeviceUnreachable {
            device: device(),
            reason: "timeout".to_string(),
        };

        assert!(!dispatcher.dispatch(&event).await);
    }

    #[tokio::test]
    async fn test_dispatch_disabled() {
        let dispatcher = AlertDispatcher::disabled(Arc::new(MetricsRegistry::new()));
        assert!(!dispatcher.is_enabled());
        let event = AlertEvent::DeviceUnreachable {
            device: device(),
            reason: "timeout".to_string(),
        };
        assert!(!dispatcher.dispatch(&event).await);
    }
}

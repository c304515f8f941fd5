//! Prometheus metrics for Flatline
//!
//! Per-device last-known values plus a few counters; nothing is aggregated
//! across devices.

use once_cell::sync::Lazy;
use prometheus::{
    opts, register_gauge_vec, register_int_counter_vec, register_int_gauge, register_int_gauge_vec,
    GaugeVec, IntCounterVec, IntGauge, IntGaugeVec,
};

use crate::device::{DeviceConfig, TelemetrySample};
use crate::state_machine::DeviceStatus;

/// Device status (0=active, 1=suspect, 2=stalled, 3=unreachable, 4=restarting)
static DEVICE_STATUS: Lazy<IntGaugeVec> = Lazy::new(|| {
    register_int_gauge_vec!(
        opts!("flatline_device_status", "Device stall status"),
        &["device", "address"]
    )
    .expect("Failed to create device_status metric")
});

static DEVICE_SHARES: Lazy<IntGaugeVec> = Lazy::new(|| {
    register_int_gauge_vec!(
        opts!("flatline_device_shares_accepted", "Last reported accepted share count"),
        &["device"]
    )
    .expect("Failed to create device_shares metric")
});

static DEVICE_HASHRATE: Lazy<GaugeVec> = Lazy::new(|| {
    register_gauge_vec!(
        opts!("flatline_device_hashrate_ghs", "Last reported hashrate in GH/s"),
        &["device"]
    )
    .expect("Failed to create device_hashrate metric")
});

static DEVICE_TEMPERATURE: Lazy<GaugeVec> = Lazy::new(|| {
    register_gauge_vec!(
        opts!("flatline_device_temperature_celsius", "Last reported temperature"),
        &["device", "sensor"]
    )
    .expect("Failed to create device_temperature metric")
});

static DEVICE_UPTIME: Lazy<IntGaugeVec> = Lazy::new(|| {
    register_int_gauge_vec!(
        opts!("flatline_device_uptime_seconds", "Last reported device uptime"),
        &["device"]
    )
    .expect("Failed to create device_uptime metric")
});

/// Restart attempts by outcome
static RESTARTS: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        opts!("flatline_restarts_total", "Restart commands issued"),
        &["device", "outcome"]
    )
    .expect("Failed to create restarts metric")
});

static UNREACHABLE: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        opts!("flatline_unreachable_polls_total", "Telemetry polls that failed"),
        &["device"]
    )
    .expect("Failed to create unreachable metric")
});

static ALERTS: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        opts!("flatline_alerts_total", "Alert delivery attempts"),
        &["category", "result"]
    )
    .expect("Failed to create alerts metric")
});

static RETENTION: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        opts!("flatline_log_artifacts_total", "Log artifacts processed by retention"),
        &["action"]
    )
    .expect("Failed to create retention metric")
});

static DEVICE_COUNT: Lazy<IntGauge> = Lazy::new(|| {
    register_int_gauge!(opts!("flatline_device_count", "Number of monitored devices"))
        .expect("Failed to create device_count metric")
});

/// Metrics registry wrapper
pub struct MetricsRegistry;

impl MetricsRegistry {
    /// Create a new metrics registry
    pub fn new() -> Self {
        // Force initialization of lazy statics
        let _ = &*DEVICE_STATUS;
        let _ = &*DEVICE_SHARES;
        let _ = &*DEVICE_HASHRATE;
        let _ = &*DEVICE_TEMPERATURE;
        let _ = &*DEVICE_UPTIME;
        let _ = &*RESTARTS;
        let _ = &*UNREACHABLE;
        let _ = &*ALERTS;
        let _ = &*RETENTION;
        let _ = &*DEVICE_COUNT;
        Self
    }

    pub fn set_device_count(&self, count: i64) {
        DEVICE_COUNT.set(count);
    }

    pub fn set_device_status(&self, device: &DeviceConfig, status: DeviceStatus) {
        DEVICE_STATUS
            .with_label_values(&[&device.name, &device.address])
            .set(status.code());
    }

    /// Record the last-known telemetry values of a device
    pub fn record_sample(&self, device: &DeviceConfig, sample: &TelemetrySample) {
        let name = device.name.as_str();
        DEVICE_SHARES
            .with_label_values(&[name])
            .set(i64::try_from(sample.shares).unwrap_or(i64::MAX));
        DEVICE_HASHRATE.with_label_values(&[name]).set(sample.hashrate);
        DEVICE_UPTIME
            .with_label_values(&[name])
            .set(i64::try_from(sample.uptime.as_secs()).unwrap_or(i64::MAX));
        if let Some(temp) = sample.asic_temp {
            DEVICE_TEMPERATURE.with_label_values(&[name, "asic"]).set(temp);
        }
        if let Some(temp) = sample.vr_temp {
            DEVICE_TEMPERATURE.with_label_values(&[name, "vr"]).set(temp);
        }
    }

    pub fn inc_restart(&self, device: &DeviceConfig, success: bool) {
        let outcome = if success { "accepted" } else { "failed" };
        RESTARTS.with_label_values(&[&device.name, outcome]).inc();
    }

    pub fn inc_unreachable(&self, device: &DeviceConfig) {
        UNREACHABLE.with_label_values(&[&device.name]).inc();
    }

    pub fn inc_alert(&self, category: &str, result: &str) {
        ALERTS.with_label_values(&[category, result]).inc();
    }

    pub fn inc_retention(&self, action: &str, count: u64) {
        RETENTION.with_label_values(&[action]).inc_by(count);
    }
}

impl Default for MetricsRegistry {
    fn default() -> Self {
        Self::new()
    }
}

//! HTTP device client
//!
//! Talks to the miner's web API: `GET /api/system/info` for telemetry and
//! `POST /api/system/restart` to reboot it. Transport problems never escape
//! as raw reqwest errors; they are classified into `DeviceError` or a failed
//! `RestartOutcome`.

use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use serde::Deserialize;
use tracing::{debug, info};

use flatline_core::device::{DeviceClient, DeviceError, RestartOutcome, TelemetrySample};

const INFO_PATH: &str = "/api/system/info";
const RESTART_PATH: &str = "/api/system/restart";

/// Telemetry document returned by `/api/system/info`
///
/// Only the fields the monitor uses; everything else is ignored.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SystemInfo {
    pub shares_accepted: Option<u64>,
    pub uptime_seconds: Option<u64>,
    /// GH/s
    pub hash_rate: Option<f64>,
    /// ASIC temperature
    pub temp: Option<f64>,
    pub vr_temp: Option<f64>,
    pub hostname: Option<String>,
}

impl SystemInfo {
    /// Convert into a sample; the share counter is the one mandatory field
    pub fn into_sample(self) -> Result<TelemetrySample, DeviceError> {
        let shares = self
            .shares_accepted
            .ok_or_else(|| DeviceError::InvalidResponse("missing sharesAccepted".to_string()))?;

        Ok(TelemetrySample {
            shares,
            uptime: Duration::from_secs(self.uptime_seconds.unwrap_or(0)),
            hashrate: self.hash_rate.unwrap_or(0.0),
            asic_temp: self.temp,
            vr_temp: self.vr_temp,
            hostname: self.hostname.filter(|h| !h.is_empty()),
            timestamp: Utc::now(),
        })
    }
}

/// Base URL for a configured address (`10.0.0.5`, `10.0.0.5:8080` or a full URL)
pub fn base_url(address: &str) -> String {
    let address = address.trim_end_matches('/');
    if address.starts_with("http://") || address.starts_with("https://") {
        address.to_string()
    } else {
        format!("http://{}", address)
    }
}

/// Device client over the miner's HTTP API
#[derive(Debug, Clone)]
pub struct HttpDeviceClient {
    client: reqwest::Client,
    timeout: Duration,
}

impl HttpDeviceClient {
    /// Create a client whose requests are bounded by `timeout`
    pub fn new(timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .pool_max_idle_per_host(2)
            .build()
            .context("Failed to build HTTP client")?;

        Ok(Self { client, timeout })
    }

    fn classify(&self, e: reqwest::Error) -> DeviceError {
        if e.is_timeout() {
            DeviceError::Timeout(self.timeout)
        } else if e.is_decode() {
            DeviceError::InvalidResponse(e.to_string())
        } else {
            DeviceError::Unreachable(e.to_string())
        }
    }
}

#[async_trait]
impl DeviceClient for HttpDeviceClient {
    async fn fetch_telemetry(&self, address: &str) -> Result<TelemetrySample, DeviceError> {
        let url = format!("{}{}", base_url(address), INFO_PATH);
        debug!(url = %url, "Fetching device telemetry");

        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| self.classify(e))?;

        let status = response.status();
        if !status.is_success() {
            return Err(DeviceError::InvalidResponse(format!(
                "HTTP {}",
                status.as_u16()
            )));
        }

        let info: SystemInfo = response.json().await.map_err(|e| self.classify(e))?;
        info.into_sample()
    }

    async fn issue_restart(&self, address: &str) -> RestartOutcome {
        let url = format!("{}{}", base_url(address), RESTART_PATH);
        info!(url = %url, "Sending restart command");

        match self.client.post(&url).send().await {
            Ok(response) if response.status().is_success() => RestartOutcome::success(),
            Ok(response) => RestartOutcome::failed(format!("HTTP {}", response.status().as_u16())),
            Err(e) if e.is_timeout() => {
                RestartOutcome::failed(format!("restart request timed out after {:?}", self.timeout))
            }
            Err(e) => RestartOutcome::failed(e.to_string()),
        }
    }
}

//! Mock device client for testing

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;

use super::{DeviceClient, DeviceError, RestartOutcome, TelemetrySample};

/// Scripted response for one telemetry read
#[derive(Debug, Clone)]
pub enum MockResponse {
    /// Respond with this share count
    Shares(u64),
    /// Fail as unreachable
    Unreachable,
    /// Never answer
    Hang,
    /// Panic inside the client
    Panic,
}

#[derive(Debug, Default)]
struct Script {
    responses: VecDeque<MockResponse>,
    last: Option<MockResponse>,
}

/// Mock device client
///
/// Each address gets a queue of scripted responses. Once the queue is drained
/// the last response repeats, so a device left at `Shares(100)` stays flat.
pub struct MockDevice {
    scripts: Mutex<HashMap<String, Script>>,
    restart_failures: Mutex<HashMap<String, String>>,
    hang_restart: Mutex<bool>,
    fetch_calls: AtomicU32,
    fetch_by_address: Mutex<HashMap<String, u32>>,
    restart_calls: Mutex<Vec<String>>,
    /// Simulated hashrate in GH/s
    pub hashrate: f64,
}

impl MockDevice {
    /// Create a mock with no scripted devices
    pub fn new() -> Self {
        Self {
            scripts: Mutex::new(HashMap::new()),
            restart_failures: Mutex::new(HashMap::new()),
            hang_restart: Mutex::new(false),
            fetch_calls: AtomicU32::new(0),
            fetch_by_address: Mutex::new(HashMap::new()),
            restart_calls: Mutex::new(Vec::new()),
            hashrate: 500.0,
        }
    }

    /// Queue responses for an address
    pub fn script(&self, address: &str, responses: impl IntoIterator<Item = MockResponse>) {
        let mut scripts = self.scripts.lock().unwrap_or_else(|e| e.into_inner());
        scripts
            .entry(address.to_string())
            .or_default()
            .responses
            .extend(responses);
    }

    /// Make restart commands to an address fail with `reason`
    pub fn fail_restart(&self, address: &str, reason: &str) {
        let mut failures = self
            .restart_failures
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        failures.insert(address.to_string(), reason.to_string());
    }

    /// Make restart commands never complete
    pub fn set_hang_restart(&self, hang: bool) {
        *self.hang_restart.lock().unwrap_or_else(|e| e.into_inner()) = hang;
    }

    /// Addresses that received a restart command, in order
    pub fn restarts(&self) -> Vec<String> {
        self.restart_calls
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Number of telemetry reads served
    pub fn fetch_count(&self) -> u32 {
        self.fetch_calls.load(Ordering::SeqCst)
    }

    /// Number of telemetry reads served for one address
    pub fn fetch_count_for(&self, address: &str) -> u32 {
        self.fetch_by_address
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(address)
            .copied()
            .unwrap_or(0)
    }

    fn next_response(&self, address: &str) -> Option<MockResponse> {
        let mut scripts = self.scripts.lock().unwrap_or_else(|e| e.into_inner());
        let script = scripts.get_mut(address)?;
        if let Some(next) = script.responses.pop_front() {
            script.last = Some(next);
        }
        script.last.clone()
    }
}

impl Default for MockDevice {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DeviceClient for MockDevice {
    async fn fetch_telemetry(&self, address: &str) -> Result<TelemetrySample, DeviceError> {
        self.fetch_calls.fetch_add(1, Ordering::SeqCst);
        *self
            .fetch_by_address
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .entry(address.to_string())
            .or_insert(0) += 1;

        match self.next_response(address) {
            Some(MockResponse::Shares(shares)) => Ok(TelemetrySample {
                shares,
                uptime: Duration::from_secs(3_600),
                hashrate: self.hashrate,
                asic_temp: Some(55.0),
                vr_temp: Some(48.0),
                hostname: Some(format!("mock-{}", address)),
                timestamp: Utc::now(),
            }),
            Some(MockResponse::Unreachable) => Err(DeviceError::Unreachable(format!(
                "connection refused: {}",
                address
            ))),
            Some(MockResponse::Hang) => std::future::pending().await,
            Some(MockResponse::Panic) => panic!("mock device {} panicked", address),
            None => Err(DeviceError::Unreachable(format!("unknown address {}", address))),
        }
    }

    async fn issue_restart(&self, address: &str) -> RestartOutcome {
        let hang = *self.hang_restart.lock().unwrap_or_else(|e| e.into_inner());
        if hang {
            std::future::pending::<()>().await;
        }

        self.restart_calls
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(address.to_string());

        let failure = self
            .restart_failures
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(address)
            .cloned();
        match failure {
            Some(reason) => RestartOutcome::failed(reason),
            None => RestartOutcome::success(),
        }
    }
}

//! Poll Scheduler
//!
//! Runs one independent task per device on a fixed interval. Inside a
//! device's cycle the order is strict: fetch → evaluate → restart → alert.
//! Devices never wait on each other and a failing device only affects itself.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use chrono::{DateTime, Utc};
use futures::future::join_all;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::alert::{AlertCategory, AlertDispatcher, AlertEvent, DeviceSummary};
use crate::device::{DeviceClient, DeviceConfig, DeviceError, RestartOutcome, TelemetrySample};
use crate::journal::{status_line, DeviceJournal};
use crate::metrics::MetricsRegistry;
use crate::restart::{RestartController, RestartDecision, RestartPolicy};
use crate::retention::RetentionManager;
use crate::state_machine::{DeviceState, DeviceStatus, PollEvent, StallDetector, StateTransition};

/// Settings shared by every device task
#[derive(Debug, Clone)]
pub struct MonitorSettings {
    /// Time between polls of one device
    pub interval: Duration,
    /// Flat time after which a device is STALLED
    pub stall_threshold: Duration,
    /// Upper bound on a telemetry read
    pub request_timeout: Duration,
    /// Minimum gap between repeated unreachable/restart-failure alerts
    pub alert_min_interval: Duration,
    pub restart: RestartPolicy,
}

impl Default for MonitorSettings {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(60),
            stall_threshold: Duration::from_secs(300),
            request_timeout: Duration::from_secs(5),
            alert_min_interval: Duration::from_secs(600),
            restart: RestartPolicy::default(),
        }
    }
}

/// What happened during one poll cycle
#[derive(Debug, Clone)]
pub struct CycleReport {
    pub transition: StateTransition,
    pub decision: RestartDecision,
    pub restart: Option<RestartOutcome>,
    pub alerts: Vec<AlertCategory>,
}

/// Poll/evaluate/restart loop for one device
pub struct DeviceMonitor {
    state: DeviceState,
    client: Arc<dyn DeviceClient>,
    detector: StallDetector,
    controller: RestartController,
    dispatcher: Arc<AlertDispatcher>,
    journal: Option<DeviceJournal>,
    metrics: Arc<MetricsRegistry>,
    settings: MonitorSettings,
}

impl DeviceMonitor {
    /// Create a monitor; the stall clock starts at `now`
    pub fn new(
        device: DeviceConfig,
        client: Arc<dyn DeviceClient>,
        dispatcher: Arc<AlertDispatcher>,
        metrics: Arc<MetricsRegistry>,
        settings: MonitorSettings,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            state: DeviceState::new(device, now),
            client,
            detector: StallDetector::new(settings.stall_threshold, settings.restart.cooldown),
            controller: RestartController::new(settings.restart.clone(), settings.stall_threshold),
            dispatcher,
            journal: None,
            metrics,
            settings,
        }
    }

    /// Attach a daily journal
    pub fn with_journal(mut self, journal: DeviceJournal) -> Self {
        self.journal = Some(journal);
        self
    }

    pub fn state(&self) -> &DeviceState {
        &self.state
    }

    pub fn device(&self) -> &DeviceConfig {
        &self.state.device
    }

    /// Read telemetry, bounded by the request timeout
    pub async fn fetch(&self) -> Result<TelemetrySample, DeviceError> {
        fetch_bounded(self.client.as_ref(), &self.state.device.address, self.settings.request_timeout).await
    }

    /// Run one full cycle: fetch → evaluate → (restart) → (alert)
    pub async fn run_cycle(&mut self, now: DateTime<Utc>) -> CycleReport {
        let fetched = self.fetch().await;
        self.evaluate(fetched, now).await
    }

    /// Fold a fetch result into the state and act on it
    pub async fn evaluate(&mut self, fetched: Result<TelemetrySample, DeviceError>, now: DateTime<Utc>) -> CycleReport {
        let mut alerts = Vec::new();
        let device = self.state.device.clone();

        let unreachable_reason = match &fetched {
            Ok(sample) => {
                self.metrics.record_sample(&device, sample);
                self.journal_line(now, &status_line(sample, &device.name, self.state.total_restarts))
                    .await;
                None
            }
            Err(e) => {
                self.metrics.inc_unreachable(&device);
                let reason = e.to_string();
                warn!(device = %device, error = %reason, "Failed to read device telemetry");
                self.journal_line(now, &format!("🚫 Error communicating with {}: {}", device.address, reason))
                    .await;
                Some(reason)
            }
        };

        let transition = self.detector.observe(&mut self.state, PollEvent::from(fetched), now);

        // Inside a restart cooldown a silent device is expected, not alerted on
        let unreachable_alert = match (unreachable_reason, self.state.status) {
            (Some(reason), DeviceStatus::Unreachable) => Some(AlertEvent::DeviceUnreachable {
                device: device.clone(),
                reason,
            }),
            _ => None,
        };

        let decision = self.controller.decide(&self.state, now);
        let mut restart = None;

        match &decision {
            RestartDecision::Restart { attempt } => {
                let stalled_for = self.state.stalled_for(now);
                self.journal_line(
                    now,
                    &format!("❗ No new shares for {}. Restarting (attempt {})...", humantime::format_duration(stalled_for), attempt),
                )
                .await;

                let outcome = self
                    .controller
                    .restart(self.client.as_ref(), &mut self.state, now)
                    .await;
                self.metrics.inc_restart(&device, outcome.success);

                if outcome.success {
                    self.journal_line(now, "✅ Restart command sent successfully.").await;
                    let event = AlertEvent::NoShareRestart {
                        device: device.clone(),
                        shares: self.state.last_shares,
                        stalled_for,
                        attempt: *attempt,
                        sample: self.state.last_sample.clone(),
                    };
                    if self.dispatcher.dispatch(&event).await {
                        self.state.record_alert(event.category(), now);
                        alerts.push(event.category());
                    }
                } else {
                    self.journal_line(now, &format!("⚠️ Failed to restart: {}", outcome.reason()))
                        .await;
                    let event = AlertEvent::RestartFailure {
                        device: device.clone(),
                        attempt: *attempt,
                        reason: outcome.reason().to_string(),
                    };
                    self.rate_limited_alert(event, now, &mut alerts).await;
                }
                restart = Some(outcome);
            }
            RestartDecision::CoolingDown { remaining } => {
                debug!(device = %device, remaining = ?remaining, "Restart suppressed by cooldown");
            }
            RestartDecision::Exhausted { attempts } => {
                if !self.state.exhausted_notified {
                    error!(device = %device, attempts = *attempts, "Restart attempts exhausted");
                    self.journal_line(now, &format!("🛑 Giving up after {} restart attempts.", attempts))
                        .await;
                    let event = AlertEvent::RestartsExhausted {
                        device: device.clone(),
                        attempts: *attempts,
                        stalled_for: self.state.stalled_for(now),
                    };
                    if self.dispatcher.dispatch(&event).await {
                        self.state.record_alert(event.category(), now);
                        alerts.push(event.category());
                    }
                    self.state.exhausted_notified = true;
                }
            }
            RestartDecision::NotEligible => {}
        }

        // Notifications go out only after any restart command has completed
        if let Some(event) = unreachable_alert {
            self.rate_limited_alert(event, now, &mut alerts).await;
        }

        self.metrics.set_device_status(&device, self.state.status);

        CycleReport {
            transition,
            decision,
            restart,
            alerts,
        }
    }

    /// Poll on the configured interval until shutdown
    ///
    /// A cycle in progress always runs to completion; shutdown is only
    /// observed between cycles so a restart command is never cut off.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        info!(
            device = %self.state.device,
            address = %self.state.device.address,
            interval = ?self.settings.interval,
            "Starting device monitor"
        );
        let mut ticker = tokio::time::interval(self.settings.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.run_cycle(Utc::now()).await;
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!(device = %self.state.device, "Shutdown signal received, stopping device monitor");
                        break;
                    }
                }
            }
        }
    }

    async fn rate_limited_alert(&mut self, event: AlertEvent, now: DateTime<Utc>, sent: &mut Vec<AlertCategory>) {
        let category = event.category();
        if !self
            .state
            .alert_due(category, now, self.settings.alert_min_interval)
        {
            debug!(device = %self.state.device, category = %category, "Alert rate limited");
            return;
        }
        if self.dispatcher.dispatch(&event).await {
            self.state.record_alert(category, now);
            sent.push(category);
        }
    }

    async fn journal_line(&self, now: DateTime<Utc>, line: &str) {
        if let Some(journal) = &self.journal {
            journal.append(now, line).await;
        }
    }
}

/// Read telemetry with an outer timeout, whatever the client does
pub async fn fetch_bounded(
    client: &dyn DeviceClient,
    address: &str,
    timeout: Duration,
) -> Result<TelemetrySample, DeviceError> {
    match tokio::time::timeout(timeout, client.fetch_telemetry(address)).await {
        Ok(result) => result,
        Err(_) => Err(DeviceError::Timeout(timeout)),
    }
}

/// Fetch every device concurrently and describe the fleet
pub async fn collect_summaries(
    client: &dyn DeviceClient,
    devices: &[DeviceConfig],
    timeout: Duration,
) -> Vec<DeviceSummary> {
    let fetches = devices.iter().map(|device| async move {
        DeviceSummary {
            device: device.clone(),
            telemetry: fetch_bounded(client, &device.address, timeout)
                .await
                .map_err(|e| e.to_string()),
        }
    });
    join_all(fetches).await
}

/// Fleet scheduler
pub struct Scheduler {
    monitors: Vec<DeviceMonitor>,
    retention: Option<(RetentionManager, Duration)>,
    metrics: Arc<MetricsRegistry>,
}

impl Scheduler {
    /// Create a scheduler with one monitor per device
    pub fn new(
        devices: Vec<DeviceConfig>,
        client: Arc<dyn DeviceClient>,
        dispatcher: Arc<AlertDispatcher>,
        metrics: Arc<MetricsRegistry>,
        settings: MonitorSettings,
    ) -> Self {
        let now = Utc::now();
        metrics.set_device_count(devices.len() as i64);
        let monitors = devices
            .into_iter()
            .map(|device| {
                DeviceMonitor::new(
                    device,
                    client.clone(),
                    dispatcher.clone(),
                    metrics.clone(),
                    settings.clone(),
                    now,
                )
            })
            .collect();

        Self {
            monitors,
            retention: None,
            metrics,
        }
    }

    /// Write a daily journal per device under `dir`
    pub fn with_journals(mut self, dir: impl Into<std::path::PathBuf>) -> Self {
        let dir = dir.into();
        self.monitors = self
            .monitors
            .into_iter()
            .map(|monitor| {
                let journal = DeviceJournal::new(dir.clone(), monitor.device().name.clone());
                monitor.with_journal(journal)
            })
            .collect();
        self
    }

    /// Run the retention manager alongside the device tasks
    pub fn with_retention(mut self, manager: RetentionManager, interval: Duration) -> Self {
        self.retention = Some((manager, interval));
        self
    }

    pub fn monitors(&self) -> &[DeviceMonitor] {
        &self.monitors
    }

    /// Run every device task until shutdown
    pub async fn run(self, shutdown: watch::Receiver<bool>) -> Result<()> {
        info!(devices = self.monitors.len(), "Starting scheduler");

        let mut tasks = JoinSet::new();
        for monitor in self.monitors {
            let name = monitor.device().name.clone();
            let rx = shutdown.clone();
            tasks.spawn(async move {
                monitor.run(rx).await;
                name
            });
        }

        if let Some((manager, interval)) = self.retention {
            let rx = shutdown.clone();
            let metrics = self.metrics.clone();
            tasks.spawn(async move {
                manager.run(interval, metrics, rx).await;
                "retention".to_string()
            });
        }

        // A panicking task is reported and the others keep running
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(name) => debug!(task = %name, "Task finished"),
                Err(e) => error!(error = %e, "Monitor task failed"),
            }
        }

        info!("Scheduler stopped");
        Ok(())
    }

    /// Run one cycle of every device concurrently
    pub async fn run_once(&mut self) -> Vec<CycleReport> {
        let now = Utc::now();
        join_all(self.monitors.iter_mut().map(|monitor| monitor.run_cycle(now))).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alert::tests::RecordingNotifier;
    use crate::device::{MockDevice, MockResponse};
    use chrono::TimeZone;

    fn t(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    fn settings() -> MonitorSettings {
        MonitorSettings {
            interval: Duration::from_secs(60),
            stall_threshold: Duration::from_secs(300),
            request_timeout: Duration::from_secs(5),
            alert_min_interval: Duration::from_secs(600),
            restart: RestartPolicy {
                cooldown: Duration::from_secs(120),
                ..Default::default()
            },
        }
    }

    struct Harness {
        mock: Arc<MockDevice>,
        notifier: Arc<RecordingNotifier>,
        monitor: DeviceMonitor,
    }

    fn harness(notifier: RecordingNotifier, settings: MonitorSettings) -> Harness {
        let mock = Arc::new(MockDevice::new());
        let notifier = Arc::new(notifier);
        let metrics = Arc::new(MetricsRegistry::new());
        let dispatcher = Arc::new(AlertDispatcher::new(
            Some(notifier.clone()),
            Duration::from_secs(5),
            metrics.clone(),
        ));
        let monitor = DeviceMonitor::new(
            DeviceConfig::new("axe", "10.0.0.1"),
            mock.clone(),
            dispatcher,
            metrics,
            settings,
            t(0),
        );
        Harness {
            mock,
            notifier,
            monitor,
        }
    }

    #[tokio::test]
    async fn test_stall_restart_then_progress() {
        let mut h = harness(RecordingNotifier::new(), settings());
        h.mock.script(
            "10.0.0.1",
            [
                MockResponse::Shares(100),
                MockResponse::Shares(100),
                MockResponse::Shares(100),
                MockResponse::Shares(105),
            ],
        );

        let report = h.monitor.run_cycle(t(0)).await;
        assert_eq!(report.transition.to, DeviceStatus::Active);

        let report = h.monitor.run_cycle(t(30)).await;
        assert_eq!(report.transition.to, DeviceStatus::Suspect);
        assert_eq!(report.decision, RestartDecision::NotEligible);
        assert!(h.mock.restarts().is_empty());

        let report = h.monitor.run_cycle(t(330)).await;
        assert_eq!(report.transition.to, DeviceStatus::Stalled);
        assert_eq!(report.decision, RestartDecision::Restart { attempt: 1 });
        assert!(report.restart.unwrap().success);
        assert_eq!(h.monitor.state().status, DeviceStatus::Restarting);
        assert_eq!(report.alerts, vec![AlertCategory::NoShareRestart]);
        assert_eq!(h.mock.restarts().len(), 1);

        let report = h.monitor.run_cycle(t(335)).await;
        assert!(report.transition.recovered());
        assert_eq!(h.monitor.state().status, DeviceStatus::Active);
        assert_eq!(h.monitor.state().restart_attempts, 0);
        assert_eq!(h.mock.restarts().len(), 1);
        assert_eq!(h.notifier.sent().len(), 1);
    }

    #[tokio::test]
    async fn test_no_second_restart_inside_cooldown() {
        let mut h = harness(RecordingNotifier::new(), settings());
        h.mock.script("10.0.0.1", [MockResponse::Shares(100)]);

        h.monitor.run_cycle(t(0)).await;
        h.monitor.run_cycle(t(300)).await;
        assert_eq!(h.mock.restarts().len(), 1);

        // Every 10s inside the 120s cooldown: suspended, no further restart
        for secs in (310..420).step_by(10) {
            let report = h.monitor.run_cycle(t(secs)).await;
            assert_eq!(report.transition.to, DeviceStatus::Restarting);
            assert!(report.restart.is_none());
        }
        assert_eq!(h.mock.restarts().len(), 1);

        // Cooldown over, still flat: another stall cycle, attempt 2
        let report = h.monitor.run_cycle(t(420)).await;
        assert_eq!(report.transition.to, DeviceStatus::Stalled);
        assert_eq!(report.decision, RestartDecision::Restart { attempt: 2 });
        assert_eq!(h.mock.restarts().len(), 2);
    }

    #[tokio::test]
    async fn test_outage_counts_towards_stall_clock() {
        let mut h = harness(RecordingNotifier::new(), settings());
        h.mock.script(
            "10.0.0.1",
            [
                MockResponse::Shares(100),
                MockResponse::Unreachable,
                MockResponse::Unreachable,
                MockResponse::Unreachable,
                MockResponse::Shares(100),
            ],
        );

        h.monitor.run_cycle(t(0)).await;
        for cycle in 1..=3 {
            let report = h.monitor.run_cycle(t(60 * cycle)).await;
            assert_eq!(report.transition.to, DeviceStatus::Unreachable);
            assert_eq!(report.decision, RestartDecision::NotEligible);
        }

        let report = h.monitor.run_cycle(t(240)).await;
        assert_eq!(report.transition.to, DeviceStatus::Suspect);
        assert_eq!(h.monitor.state().stalled_for(t(240)), Duration::from_secs(240));

        // One more flat poll crosses the threshold measured from t=0
        h.mock.script("10.0.0.1", [MockResponse::Shares(100)]);
        let report = h.monitor.run_cycle(t(300)).await;
        assert_eq!(report.transition.to, DeviceStatus::Stalled);
    }

    #[tokio::test]
    async fn test_unreachable_alert_rate_limited() {
        let mut h = harness(RecordingNotifier::new(), settings());
        h.mock.script("10.0.0.1", [MockResponse::Shares(1), MockResponse::Unreachable]);

        h.monitor.run_cycle(t(0)).await;
        let report = h.monitor.run_cycle(t(60)).await;
        assert_eq!(report.alerts, vec![AlertCategory::DeviceUnreachable]);

        let report = h.monitor.run_cycle(t(120)).await;
        assert!(report.alerts.is_empty());

        assert_eq!(h.notifier.sent().len(), 1);
        assert!(h.notifier.sent()[0].contains("Could not communicate"));
    }

    #[tokio::test]
    async fn test_unreachable_device_restarted_after_threshold() {
        let mut h = harness(RecordingNotifier::new(), settings());
        h.mock.script("10.0.0.1", [MockResponse::Unreachable]);
        h.mock.fail_restart("10.0.0.1", "connection refused");

        let report = h.monitor.run_cycle(t(60)).await;
        assert_eq!(report.decision, RestartDecision::NotEligible);

        let report = h.monitor.run_cycle(t(300)).await;
        assert_eq!(report.decision, RestartDecision::Restart { attempt: 1 });
        assert!(!report.restart.unwrap().success);
        assert_eq!(report.alerts, vec![AlertCategory::RestartFailure]);
        assert_eq!(h.monitor.state().status, DeviceStatus::Unreachable);

        // Failure does not block the retry once the cooldown has passed
        let report = h.monitor.run_cycle(t(360)).await;
        assert!(matches!(report.decision, RestartDecision::CoolingDown { .. }));
        let report = h.monitor.run_cycle(t(420)).await;
        assert_eq!(report.decision, RestartDecision::Restart { attempt: 2 });
    }

    #[tokio::test]
    async fn test_notification_failure_does_not_break_cycle() {
        let mut h = harness(RecordingNotifier::failing(), settings());
        h.mock.script("10.0.0.1", [MockResponse::Shares(100)]);

        h.monitor.run_cycle(t(0)).await;
        let report = h.monitor.run_cycle(t(300)).await;

        assert!(report.restart.unwrap().success);
        assert!(report.alerts.is_empty());
        assert_eq!(h.monitor.state().status, DeviceStatus::Restarting);
        assert_eq!(
            h.monitor.state().last_alert(AlertCategory::NoShareRestart),
            None
        );
    }

    #[tokio::test]
    async fn test_restart_ceiling_alerts_once() {
        let mut settings = settings();
        settings.restart.max_attempts = Some(1);
        let mut h = harness(RecordingNotifier::new(), settings);
        h.mock.script("10.0.0.1", [MockResponse::Shares(100)]);

        h.monitor.run_cycle(t(0)).await;
        h.monitor.run_cycle(t(300)).await;
        assert_eq!(h.mock.restarts().len(), 1);

        let report = h.monitor.run_cycle(t(500)).await;
        assert_eq!(report.decision, RestartDecision::Exhausted { attempts: 1 });
        assert_eq!(report.alerts, vec![AlertCategory::RestartsExhausted]);

        let report = h.monitor.run_cycle(t(600)).await;
        assert!(report.alerts.is_empty());
        assert_eq!(h.mock.restarts().len(), 1);

        // Progress re-arms the controller
        h.mock.script("10.0.0.1", [MockResponse::Shares(150)]);
        h.monitor.run_cycle(t(660)).await;
        assert_eq!(h.monitor.state().restart_attempts, 0);
        assert!(!h.monitor.state().exhausted_notified);
    }

    #[tokio::test(start_paused = true)]
    async fn test_hanging_device_times_out() {
        let mut h = harness(RecordingNotifier::new(), settings());
        h.mock.script("10.0.0.1", [MockResponse::Hang]);

        let report = h.monitor.run_cycle(t(0)).await;
        assert_eq!(report.transition.to, DeviceStatus::Unreachable);
        assert!(h
            .monitor
            .state()
            .last_error
            .as_deref()
            .unwrap()
            .contains("timed out"));
    }

    #[tokio::test]
    async fn test_journal_written_per_cycle() {
        let dir = tempfile::tempdir().unwrap();
        let h = harness(RecordingNotifier::new(), settings());
        h.mock.script("10.0.0.1", [MockResponse::Shares(7)]);
        let mut monitor = h.monitor.with_journal(DeviceJournal::new(dir.path(), "axe"));

        let now = Utc::now();
        monitor.run_cycle(now).await;

        let path = DeviceJournal::new(dir.path(), "axe").path_for(now);
        let content = std::fs::read_to_string(path).unwrap();
        assert!(content.contains("Shares: 7 | Restarts: 0"));
    }

    #[tokio::test]
    async fn test_run_once_isolates_devices() {
        let mock = Arc::new(MockDevice::new());
        mock.script("10.0.0.1", [MockResponse::Shares(10)]);
        mock.script("10.0.0.2", [MockResponse::Unreachable]);
        let metrics = Arc::new(MetricsRegistry::new());
        let dispatcher = Arc::new(AlertDispatcher::new(
            Some(Arc::new(RecordingNotifier::failing())),
            Duration::from_secs(5),
            metrics.clone(),
        ));

        let mut scheduler = Scheduler::new(
            vec![
                DeviceConfig::new("good", "10.0.0.1"),
                DeviceConfig::new("bad", "10.0.0.2"),
            ],
            mock,
            dispatcher,
            metrics,
            settings(),
        );

        let reports = scheduler.run_once().await;
        assert_eq!(reports.len(), 2);
        assert_eq!(reports[0].transition.to, DeviceStatus::Active);
        assert_eq!(reports[1].transition.to, DeviceStatus::Unreachable);
        assert_eq!(scheduler.monitors()[0].state().last_shares, Some(10));
    }

    #[tokio::test]
    async fn test_collect_summaries() {
        let mock = MockDevice::new();
        mock.script("10.0.0.1", [MockResponse::Shares(10)]);
        let devices = vec![
            DeviceConfig::new("good", "10.0.0.1"),
            DeviceConfig::new("bad", "10.0.0.2"),
        ];

        let summaries = collect_summaries(&mock, &devices, Duration::from_secs(5)).await;

        assert_eq!(summaries.len(), 2);
        assert_eq!(summaries[0].telemetry.as_ref().unwrap().shares, 10);
        assert!(summaries[1].telemetry.is_err());
    }

    /// Records how many restarts the device had seen when each message arrived
    struct RestartAwareNotifier {
        mock: Arc<MockDevice>,
        seen: std::sync::Mutex<Vec<(String, usize)>>,
    }

    #[async_trait::async_trait]
    impl crate::alert::Notifier for RestartAwareNotifier {
        async fn deliver(&self, message: &str) -> Result<(), crate::alert::NotifyError> {
            let restarts = self.mock.restarts().len();
            self.seen.lock().unwrap().push((message.to_string(), restarts));
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_restart_issued_before_notifications() {
        let mock = Arc::new(MockDevice::new());
        mock.script("10.0.0.1", [MockResponse::Shares(100), MockResponse::Unreachable]);
        let notifier = Arc::new(RestartAwareNotifier {
            mock: mock.clone(),
            seen: std::sync::Mutex::new(Vec::new()),
        });
        let metrics = Arc::new(MetricsRegistry::new());
        let dispatcher = Arc::new(AlertDispatcher::new(
            Some(notifier.clone()),
            Duration::from_secs(5),
            metrics.clone(),
        ));
        let mut monitor = DeviceMonitor::new(
            DeviceConfig::new("axe", "10.0.0.1"),
            mock.clone(),
            dispatcher,
            metrics,
            settings(),
            t(0),
        );

        monitor.run_cycle(t(0)).await;
        let report = monitor.run_cycle(t(400)).await;

        assert_eq!(report.decision, RestartDecision::Restart { attempt: 1 });
        assert_eq!(
            report.alerts,
            vec![AlertCategory::NoShareRestart, AlertCategory::DeviceUnreachable]
        );
        let seen = notifier.seen.lock().unwrap().clone();
        assert_eq!(seen.len(), 2);
        assert!(seen.iter().all(|(_, restarts)| *restarts == 1));
        assert!(seen[1].0.contains("Could not communicate"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_hanging_device_does_not_delay_others() {
        let mock = Arc::new(MockDevice::new());
        mock.script("10.0.0.1", [MockResponse::Shares(10)]);
        mock.script("10.0.0.2", [MockResponse::Hang]);
        mock.script("10.0.0.3", [MockResponse::Panic]);
        let metrics = Arc::new(MetricsRegistry::new());
        let dispatcher = Arc::new(AlertDispatcher::disabled(metrics.clone()));
        let mut settings = settings();
        settings.request_timeout = Duration::from_secs(50);
        let scheduler = Scheduler::new(
            vec![
                DeviceConfig::new("good", "10.0.0.1"),
                DeviceConfig::new("hung", "10.0.0.2"),
                DeviceConfig::new("broken", "10.0.0.3"),
            ],
            mock.clone(),
            dispatcher,
            metrics,
            settings,
        );

        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn(scheduler.run(rx));

        tokio::time::sleep(Duration::from_secs(150)).await;
        tx.send(true).unwrap();
        handle.await.unwrap().unwrap();

        // Ticks at 0s, 60s and 120s regardless of the other devices
        assert_eq!(mock.fetch_count_for("10.0.0.1"), 3);
        assert_eq!(mock.fetch_count_for("10.0.0.2"), 3);
        assert_eq!(mock.fetch_count_for("10.0.0.3"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_scheduler_stops_on_shutdown() {
        let mock = Arc::new(MockDevice::new());
        mock.script("10.0.0.1", [MockResponse::Shares(10)]);
        let metrics = Arc::new(MetricsRegistry::new());
        let dispatcher = Arc::new(AlertDispatcher::disabled(metrics.clone()));
        let scheduler = Scheduler::new(
            vec![DeviceConfig::new("good", "10.0.0.1")],
            mock.clone(),
            dispatcher,
            metrics,
            settings(),
        );

        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn(scheduler.run(rx));

        tokio::time::sleep(Duration::from_secs(150)).await;
        tx.send(true).unwrap();
        handle.await.unwrap().unwrap();

        // Immediate first tick plus two intervals
        assert_eq!(mock.fetch_count(), 3);
    }
}

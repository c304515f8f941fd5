//! Device Stall State Machine
//!
//! Turns a sequence of telemetry polls into a stalled/active judgment:
//! ACTIVE → SUSPECT → STALLED → RESTARTING → ACTIVE (progress)
//!
//! State transitions:
//! - any → ACTIVE: share count increased, or decreased (device rebooted)
//! - ACTIVE/SUSPECT → SUSPECT: share count flat, inside stall_threshold
//! - SUSPECT → STALLED: share count flat for stall_threshold or longer
//! - any → UNREACHABLE: telemetry read failed (stall clock keeps running)
//! - RESTARTING → RESTARTING: no progress, still inside the restart cooldown
//! - RESTARTING → STALLED/UNREACHABLE: cooldown elapsed without progress

use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::alert::AlertCategory;
use crate::device::{DeviceConfig, DeviceError, RestartOutcome, TelemetrySample};

/// Lifecycle status of a device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DeviceStatus {
    /// Share count is moving
    Active,
    /// Share count flat, still inside the grace period
    Suspect,
    /// Share count flat beyond stall_threshold
    Stalled,
    /// Last telemetry read failed
    Unreachable,
    /// Restart issued, stall evaluation suspended until progress or cooldown
    Restarting,
}

impl DeviceStatus {
    /// Numeric code used for the status gauge
    pub fn code(&self) -> i64 {
        match self {
            DeviceStatus::Active => 0,
            DeviceStatus::Suspect => 1,
            DeviceStatus::Stalled => 2,
            DeviceStatus::Unreachable => 3,
            DeviceStatus::Restarting => 4,
        }
    }
}

impl std::fmt::Display for DeviceStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DeviceStatus::Active => write!(f, "ACTIVE"),
            DeviceStatus::Suspect => write!(f, "SUSPECT"),
            DeviceStatus::Stalled => write!(f, "STALLED"),
            DeviceStatus::Unreachable => write!(f, "UNREACHABLE"),
            DeviceStatus::Restarting => write!(f, "RESTARTING"),
        }
    }
}

/// Per-device state, owned by that device's task
#[derive(Debug, Clone)]
pub struct DeviceState {
    /// Device identity
    pub device: DeviceConfig,
    /// Current status
    pub status: DeviceStatus,
    /// Last observed share count (None until the first successful poll)
    pub last_shares: Option<u64>,
    /// Last time the share count increased (or was re-baselined)
    pub last_increase_at: DateTime<Utc>,
    /// Restarts issued since the last share-count increase
    pub restart_attempts: u32,
    /// Time of the last restart attempt, successful or not
    pub last_restart_at: Option<DateTime<Utc>>,
    /// Outcome of the last restart attempt
    pub last_restart: Option<RestartOutcome>,
    /// Restart commands the device accepted over the process lifetime
    pub total_restarts: u64,
    /// Most recent successful sample
    pub last_sample: Option<TelemetrySample>,
    /// Most recent telemetry failure
    pub last_error: Option<String>,
    /// Set once the restart ceiling alert went out, cleared on progress
    pub exhausted_notified: bool,
    /// Last successful delivery per alert category
    alerts: HashMap<AlertCategory, DateTime<Utc>>,
}

impl DeviceState {
    /// Create the initial state; the stall clock starts at `now`
    pub fn new(device: DeviceConfig, now: DateTime<Utc>) -> Self {
        Self {
            device,
            status: DeviceStatus::Active,
            last_shares: None,
            last_increase_at: now,
            restart_attempts: 0,
            last_restart_at: None,
            last_restart: None,
            total_restarts: 0,
            last_sample: None,
            last_error: None,
            exhausted_notified: false,
            alerts: HashMap::new(),
        }
    }

    /// How long the share count has been flat
    pub fn stalled_for(&self, now: DateTime<Utc>) -> Duration {
        elapsed(self.last_increase_at, now)
    }

    /// Time since the last restart attempt
    pub fn since_restart(&self, now: DateTime<Utc>) -> Option<Duration> {
        self.last_restart_at.map(|at| elapsed(at, now))
    }

    /// Whether an alert of this category may go out now
    pub fn alert_due(&self, category: AlertCategory, now: DateTime<Utc>, min_interval: Duration) -> bool {
        match self.alerts.get(&category) {
            Some(last) => elapsed(*last, now) >= min_interval,
            None => true,
        }
    }

    /// Record a successful alert delivery
    pub fn record_alert(&mut self, category: AlertCategory, now: DateTime<Utc>) {
        self.alerts.insert(category, now);
    }

    /// Last successful delivery of an alert category
    pub fn last_alert(&self, category: AlertCategory) -> Option<DateTime<Utc>> {
        self.alerts.get(&category).copied()
    }
}

/// Result of one telemetry poll
#[derive(Debug, Clone)]
pub enum PollEvent {
    /// Telemetry read succeeded
    Sampled(TelemetrySample),
    /// Telemetry read failed
    Unreachable { reason: String },
}

impl From<Result<TelemetrySample, DeviceError>> for PollEvent {
    fn from(result: Result<TelemetrySample, DeviceError>) -> Self {
        match result {
            Ok(sample) => PollEvent::Sampled(sample),
            Err(e) => PollEvent::Unreachable {
                reason: e.to_string(),
            },
        }
    }
}

/// How the share count moved between two polls
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShareProgress {
    /// First sample seen for this device
    Baseline,
    /// Counter went up
    Increased,
    /// Counter unchanged
    Flat,
    /// Counter went down: the device rebooted
    Reset,
}

/// State transition result
#[derive(Debug, Clone)]
pub struct StateTransition {
    /// Previous status
    pub from: DeviceStatus,
    /// New status
    pub to: DeviceStatus,
    /// Share movement, None for a failed poll
    pub progress: Option<ShareProgress>,
    /// Whether status actually changed
    pub changed: bool,
}

impl StateTransition {
    fn new(from: DeviceStatus, to: DeviceStatus, progress: Option<ShareProgress>) -> Self {
        Self {
            from,
            to,
            progress,
            changed: from != to,
        }
    }

    /// Device is stalled or unreachable and may warrant corrective action
    pub fn is_actionable(&self) -> bool {
        matches!(self.to, DeviceStatus::Stalled | DeviceStatus::Unreachable)
    }

    /// Device left RESTARTING because its counter moved
    pub fn recovered(&self) -> bool {
        self.from == DeviceStatus::Restarting && self.to == DeviceStatus::Active
    }
}

/// Stall detector
///
/// Stateless apart from its thresholds; all per-device data lives in
/// `DeviceState` so each device task can own its own copy.
#[derive(Debug, Clone)]
pub struct StallDetector {
    /// Flat time after which a device is STALLED
    stall_threshold: Duration,
    /// Window after a restart during which stall evaluation is suspended
    cooldown: Duration,
}

impl StallDetector {
    /// Create a new stall detector
    pub fn new(stall_threshold: Duration, cooldown: Duration) -> Self {
        Self {
            stall_threshold,
            cooldown,
        }
    }

    /// Fold one poll result into the device state
    pub fn observe(&self, state: &mut DeviceState, event: PollEvent, now: DateTime<Utc>) -> StateTransition {
        let old = state.status;

        let (new, progress) = match event {
            PollEvent::Sampled(sample) => {
                let shares = sample.shares;
                let progress = match state.last_shares {
                    None => ShareProgress::Baseline,
                    Some(prev) if shares > prev => ShareProgress::Increased,
                    Some(prev) if shares < prev => ShareProgress::Reset,
                    Some(_) => ShareProgress::Flat,
                };
                state.last_sample = Some(sample);
                state.last_error = None;

                let new = match progress {
                    ShareProgress::Baseline | ShareProgress::Reset => {
                        if progress == ShareProgress::Reset {
                            info!(
                                device = %state.device,
                                previous = ?state.last_shares,
                                shares = shares,
                                "Share counter went backwards, treating as reboot"
                            );
                        }
                        state.last_shares = Some(shares);
                        state.last_increase_at = now;
                        DeviceStatus::Active
                    }
                    ShareProgress::Increased => {
                        state.last_shares = Some(shares);
                        state.last_increase_at = now;
                        state.restart_attempts = 0;
                        state.exhausted_notified = false;
                        DeviceStatus::Active
                    }
                    ShareProgress::Flat => {
                        if self.in_cooldown(state, now) {
                            DeviceStatus::Restarting
                        } else if state.stalled_for(now) < self.stall_threshold {
                            DeviceStatus::Suspect
                        } else {
                            DeviceStatus::Stalled
                        }
                    }
                };
                (new, Some(progress))
            }
            PollEvent::Unreachable { reason } => {
                state.last_error = Some(reason);
                if self.in_cooldown(state, now) {
                    (DeviceStatus::Restarting, None)
                } else {
                    (DeviceStatus::Unreachable, None)
                }
            }
        };

        state.status = new;
        let transition = StateTransition::new(old, new, progress);

        if transition.changed {
            match new {
                DeviceStatus::Stalled | DeviceStatus::Unreachable => warn!(
                    device = %state.device,
                    from = %old,
                    to = %new,
                    flat_for = ?state.stalled_for(now),
                    "Device state changed"
                ),
                _ => info!(
                    device = %state.device,
                    from = %old,
                    to = %new,
                    "Device state changed"
                ),
            }
        } else {
            debug!(
                device = %state.device,
                status = %new,
                shares = ?state.last_shares,
                "Device state unchanged"
            );
        }

        transition
    }

    /// A restart was issued and the cooldown has not elapsed yet
    fn in_cooldown(&self, state: &DeviceState, now: DateTime<Utc>) -> bool {
        state.status == DeviceStatus::Restarting
            && state
                .since_restart(now)
                .map_or(false, |since| since < self.cooldown)
    }
}

/// Wall time from `since` to `now`, zero if the clock went backwards
pub fn elapsed(since: DateTime<Utc>, now: DateTime<Utc>) -> Duration {
    (now - since).to_std().unwrap_or(Duration::ZERO)
}

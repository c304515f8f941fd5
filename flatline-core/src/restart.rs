//! Restart Controller
//!
//! Decides when a stalled or unreachable device gets a restart command and
//! issues it. A cooldown separates successive attempts on the same device so
//! a slow-booting miner is not restarted again before it had a chance to
//! recover. An optional ceiling stops restarting a device that never recovers.

use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{info, warn};

use crate::device::{DeviceClient, RestartOutcome};
use crate::state_machine::{DeviceState, DeviceStatus};

/// Restart policy configuration
#[derive(Debug, Clone)]
pub struct RestartPolicy {
    /// Minimum time between restart attempts for one device
    pub cooldown: Duration,
    /// Stop after this many attempts without progress (None = no ceiling)
    pub max_attempts: Option<u32>,
    /// Timeout for the restart command
    pub timeout: Duration,
    /// Log restarts instead of sending them
    pub dry_run: bool,
}

impl Default for RestartPolicy {
    fn default() -> Self {
        Self {
            cooldown: Duration::from_secs(300),
            max_attempts: None,
            timeout: Duration::from_secs(5),
            dry_run: false,
        }
    }
}

/// What the controller wants to do with a device this cycle
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RestartDecision {
    /// Issue a restart; `attempt` is the 1-based attempt number
    Restart { attempt: u32 },
    /// Device is not stalled (or not down long enough)
    NotEligible,
    /// A restart was attempted too recently
    CoolingDown { remaining: Duration },
    /// Ceiling reached, no more restarts until progress
    Exhausted { attempts: u32 },
}

/// Restart controller
#[derive(Debug, Clone)]
pub struct RestartController {
    policy: RestartPolicy,
    stall_threshold: Duration,
}

impl RestartController {
    /// Create a new restart controller
    pub fn new(policy: RestartPolicy, stall_threshold: Duration) -> Self {
        Self {
            policy,
            stall_threshold,
        }
    }

    /// Decide whether to restart the device now
    pub fn decide(&self, state: &DeviceState, now: DateTime<Utc>) -> RestartDecision {
        let eligible = match state.status {
            DeviceStatus::Stalled => true,
            // A single missed poll is not a dead device; wait for the stall clock
            DeviceStatus::Unreachable => state.stalled_for(now) >= self.stall_threshold,
            _ => false,
        };
        if !eligible {
            return RestartDecision::NotEligible;
        }

        if let Some(max) = self.policy.max_attempts {
            if state.restart_attempts >= max {
                return RestartDecision::Exhausted {
                    attempts: state.restart_attempts,
                };
            }
        }

        if let Some(since) = state.since_restart(now) {
            if since < self.policy.cooldown {
                return RestartDecision::CoolingDown {
                    remaining: self.policy.cooldown - since,
                };
            }
        }

        RestartDecision::Restart {
            attempt: state.restart_attempts + 1,
        }
    }

    /// Issue a restart command and record it in the device state
    ///
    /// On success the device enters RESTARTING. On failure the status is left
    /// alone but the attempt time is still recorded, so the cooldown applies
    /// before the next try.
    pub async fn restart(
        &self,
        client: &dyn DeviceClient,
        state: &mut DeviceState,
        now: DateTime<Utc>,
    ) -> RestartOutcome {
        let attempt = state.restart_attempts + 1;

        let outcome = if self.policy.dry_run {
            info!(device = %state.device, attempt = attempt, "[DRY-RUN] Would restart device");
            RestartOutcome::success_with_detail("Dry run - no restart sent")
        } else {
            warn!(
                device = %state.device,
                address = %state.device.address,
                attempt = attempt,
                "Restarting device"
            );
            match tokio::time::timeout(
                self.policy.timeout,
                client.issue_restart(&state.device.address),
            )
            .await
            {
                Ok(outcome) => outcome,
                Err(_) => RestartOutcome::failed(format!(
                    "restart command timed out after {:?}",
                    self.policy.timeout
                )),
            }
        };

        state.restart_attempts = attempt;
        state.last_restart_at = Some(now);
        state.last_restart = Some(outcome.clone());

        if outcome.success {
            state.status = DeviceStatus::Restarting;
            state.total_restarts += 1;
            info!(device = %state.device, attempt = attempt, "Restart command accepted");
        } else {
            warn!(
                device = %state.device,
                attempt = attempt,
                error = %outcome.reason(),
                "Restart command failed"
            );
        }

        outcome
    }
}

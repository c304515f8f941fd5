//! Flatline Core Library
//!
//! Stall detection for networked miners: device abstraction, the per-device
//! state machine, restart control, alerting, journals and log retention.

pub mod alert;
pub mod device;
pub mod journal;
pub mod metrics;
pub mod restart;
pub mod retention;
pub mod scheduler;
pub mod state_machine;

// Re-export common types
pub use alert::{AlertCategory, AlertDispatcher, AlertEvent, DeviceSummary, Notifier, NotifyError};
pub use device::{DeviceClient, DeviceConfig, DeviceError, RestartOutcome, TelemetrySample};
pub use metrics::MetricsRegistry;
pub use restart::{RestartController, RestartDecision, RestartPolicy};
pub use retention::{RetentionManager, RetentionReport};
pub use scheduler::{DeviceMonitor, MonitorSettings, Scheduler};
pub use state_machine::{DeviceState, DeviceStatus, StallDetector};

//! Flatline HTTP adapters
//!
//! Device client for the miner's web API and the webhook notifier.

pub mod client;
pub mod webhook;

#[cfg(test)]
pub(crate) mod testing;

pub use client::{HttpDeviceClient, SystemInfo};
pub use webhook::WebhookNotifier;

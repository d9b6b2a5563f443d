//! Typing, presence and store settings.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Typing indicator timings.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TypingSettings {
    /// Quiet period after the last keystroke before a stop signal.
    pub idle_timeout_ms: u64,
    /// How long a remote start signal stays valid without a refresh.
    pub remote_expiry_ms: u64,
}

impl Default for TypingSettings {
    fn default() -> Self {
        Self {
            idle_timeout_ms: 3000,
            remote_expiry_ms: 5000,
        }
    }
}

impl TypingSettings {
    /// Local idle timeout.
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms)
    }

    /// Remote expiry window.
    pub fn remote_expiry(&self) -> Duration {
        Duration::from_millis(self.remote_expiry_ms)
    }
}

/// Presence polling.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PresenceSettings {
    /// Whether the poller runs.
    pub enabled: bool,
    /// Interval between polls.
    pub poll_interval_ms: u64,
}

impl Default for PresenceSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            poll_interval_ms: 10_000,
        }
    }
}

impl PresenceSettings {
    /// Poll interval as a [`Duration`].
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

/// Message store tuning.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct StoreSettings {
    /// How old an optimistic entry may be and still be reconciled.
    pub reconcile_window_ms: u64,
}

impl Default for StoreSettings {
    fn default() -> Self {
        Self {
            reconcile_window_ms: 60_000,
        }
    }
}

impl StoreSettings {
    /// Reconcile window as a [`Duration`].
    pub fn reconcile_window(&self) -> Duration {
        Duration::from_millis(self.reconcile_window_ms)
    }
}

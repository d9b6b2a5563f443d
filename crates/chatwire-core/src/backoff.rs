//! Reconnect backoff policy and schedule.
//!
//! The bidirectional channel waits `current` before each reconnect and then
//! grows the delay multiplicatively, capped at a maximum:
//!
//! `next = min(current * multiplier, max_ms)`
//!
//! With the defaults (1000 ms, ×1.5, 30 000 ms) the schedule runs
//! 1000, 1500, 2250, 3375, 5062, 7593, … 30 000. The schedule keeps the
//! fractional value and each delay is truncated to whole milliseconds. A
//! successful open resets it to the initial value.
//!
//! - [`BackoffPolicy`]: serializable parameters (initial, cap, multiplier,
//!   optional attempt cap)
//! - [`Backoff`]: the mutable schedule one connection owns
//! - [`next_backoff_ms`]: the pure growth step

use std::time::Duration;

use serde::{Deserialize, Serialize};

// ─────────────────────────────────────────────────────────────────────────────
// Configuration
// ─────────────────────────────────────────────────────────────────────────────

/// Default initial delay in milliseconds.
pub const DEFAULT_INITIAL_BACKOFF_MS: u64 = 1000;
/// Default maximum delay in milliseconds.
pub const DEFAULT_MAX_BACKOFF_MS: u64 = 30_000;
/// Default growth factor.
pub const DEFAULT_MULTIPLIER: f64 = 1.5;

/// Backoff parameters.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackoffPolicy {
    /// First delay, and the value restored after a successful open.
    #[serde(default = "default_initial_ms")]
    pub initial_ms: u64,
    /// Upper bound for any delay.
    #[serde(default = "default_max_ms")]
    pub max_ms: u64,
    /// Growth factor applied after each scheduled reconnect (>= 1.0).
    #[serde(default = "default_multiplier")]
    pub multiplier: f64,
    /// Optional cap on consecutive reconnect attempts. `None` retries forever.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_attempts: Option<u32>,
}

fn default_initial_ms() -> u64 {
    DEFAULT_INITIAL_BACKOFF_MS
}
fn default_max_ms() -> u64 {
    DEFAULT_MAX_BACKOFF_MS
}
fn default_multiplier() -> f64 {
    DEFAULT_MULTIPLIER
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            initial_ms: DEFAULT_INITIAL_BACKOFF_MS,
            max_ms: DEFAULT_MAX_BACKOFF_MS,
            multiplier: DEFAULT_MULTIPLIER,
            max_attempts: None,
        }
    }
}

/// One growth step: `min(current * multiplier, max_ms)`, truncated.
///
/// Multipliers below 1.0 are treated as 1.0 so the schedule never shrinks.
#[must_use]
#[allow(clippy::cast_precision_loss)]
pub fn next_backoff_ms(current_ms: u64, multiplier: f64, max_ms: u64) -> u64 {
    whole_ms(grow(current_ms as f64, multiplier, max_ms))
}

#[allow(clippy::cast_precision_loss)]
fn grow(current: f64, multiplier: f64, max_ms: u64) -> f64 {
    let factor = if multiplier.is_finite() { multiplier.max(1.0) } else { 1.0 };
    (current * factor).min(max_ms as f64)
}

#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
fn whole_ms(value: f64) -> u64 {
    value.floor() as u64
}

// ─────────────────────────────────────────────────────────────────────────────
// Schedule
// ─────────────────────────────────────────────────────────────────────────────

/// Mutable backoff schedule owned by a single connection.
#[derive(Clone, Debug)]
pub struct Backoff {
    policy: BackoffPolicy,
    current: f64,
    attempts: u32,
}

impl Backoff {
    /// Start a schedule at the policy's initial delay.
    #[allow(clippy::cast_precision_loss)]
    pub fn new(policy: BackoffPolicy) -> Self {
        let current = policy.initial_ms.min(policy.max_ms) as f64;
        Self {
            policy,
            current,
            attempts: 0,
        }
    }

    /// The delay the next reconnect will wait.
    pub fn current(&self) -> Duration {
        Duration::from_millis(self.current_ms())
    }

    /// The delay the next reconnect will wait, in whole milliseconds.
    pub fn current_ms(&self) -> u64 {
        whole_ms(self.current)
    }

    /// Reconnects scheduled since the last reset.
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Whether the optional attempt cap has been reached.
    pub fn exhausted(&self) -> bool {
        self.policy
            .max_attempts
            .is_some_and(|max| self.attempts >= max)
    }

    /// Take the delay for the reconnect being scheduled now and grow the
    /// schedule for the one after it.
    pub fn advance(&mut self) -> Duration {
        let delay = self.current();
        self.current = grow(self.current, self.policy.multiplier, self.policy.max_ms);
        self.attempts = self.attempts.saturating_add(1);
        delay
    }

    /// Restore the initial delay after a successful open.
    #[allow(clippy::cast_precision_loss)]
    pub fn reset(&mut self) {
        self.current = self.policy.initial_ms.min(self.policy.max_ms) as f64;
        self.attempts = 0;
    }

    /// The policy this schedule follows.
    pub fn policy(&self) -> &BackoffPolicy {
        &self.policy
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new(BackoffPolicy::default())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

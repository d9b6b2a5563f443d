//! Server endpoints and the two realtime channels.

use std::time::Duration;

use chatwire_core::backoff::{
    BackoffPolicy, DEFAULT_INITIAL_BACKOFF_MS, DEFAULT_MAX_BACKOFF_MS, DEFAULT_MULTIPLIER,
};
use serde::{Deserialize, Serialize};

/// Server endpoints.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ServerSettings {
    /// REST base URL; the stream URL is derived from it.
    pub api_base_url: String,
    /// Bidirectional socket URL, before the token is appended.
    pub socket_url: String,
    /// Sub-protocols offered on the socket handshake.
    pub socket_protocols: Vec<String>,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            api_base_url: "http://localhost:8000/api".to_string(),
            socket_url: "ws://localhost:8000/ws/chat/".to_string(),
            socket_protocols: Vec::new(),
        }
    }
}

/// Backoff for the bidirectional channel.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ReconnectSettings {
    /// First delay and the value restored after an open.
    pub initial_backoff_ms: u64,
    /// Cap on any delay.
    pub max_backoff_ms: u64,
    /// Growth factor.
    pub multiplier: f64,
    /// Consecutive attempts before giving up. `None` retries forever.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_attempts: Option<u32>,
}

impl Default for ReconnectSettings {
    fn default() -> Self {
        Self {
            initial_backoff_ms: DEFAULT_INITIAL_BACKOFF_MS,
            max_backoff_ms: DEFAULT_MAX_BACKOFF_MS,
            multiplier: DEFAULT_MULTIPLIER,
            max_attempts: None,
        }
    }
}

impl ReconnectSettings {
    /// The backoff policy these settings describe.
    pub fn policy(&self) -> BackoffPolicy {
        BackoffPolicy {
            initial_ms: self.initial_backoff_ms,
            max_ms: self.max_backoff_ms,
            multiplier: self.multiplier,
            max_attempts: self.max_attempts,
        }
    }
}

/// Event-stream channel.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct StreamSettings {
    /// Whether the stream connects at all.
    pub enabled: bool,
    /// Fixed delay before rebuilding a failed source.
    pub retry_delay_ms: u64,
}

impl Default for StreamSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            retry_delay_ms: 5000,
        }
    }
}

impl StreamSettings {
    /// Retry delay as a [`Duration`].
    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }
}

//! Settings type definitions.
//!
//! All types use `#[serde(rename_all = "camelCase")]` and `#[serde(default)]`
//! so a settings file may name only the fields it changes. Each type
//! implements [`Default`] with the production values.

mod channels;
mod session;

pub use channels::*;
pub use session::*;

use serde::{Deserialize, Serialize};

/// Root settings type.
///
/// Loaded from `~/.chatwire/settings.json` with defaults applied for missing
/// fields. Environment variables can override specific values.
///
/// ```json
/// {
///   "server": { "socketUrl": "wss://chat.example.com/ws/chat/" },
///   "reconnect": { "maxAttempts": 20 }
/// }
/// ```
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ChatwireSettings {
    /// Server endpoints.
    pub server: ServerSettings,
    /// Bidirectional channel backoff.
    pub reconnect: ReconnectSettings,
    /// Event-stream channel.
    pub stream: StreamSettings,
    /// Typing indicator timings.
    pub typing: TypingSettings,
    /// Presence polling.
    pub presence: PresenceSettings,
    /// Message store tuning.
    pub store: StoreSettings,
    /// Logging configuration.
    pub logging: LoggingSettings,
}

/// Logging configuration.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LoggingSettings {
    /// Default filter directive (overridden by `RUST_LOG`).
    pub level: String,
    /// Emit JSON lines instead of compact text.
    pub json: bool,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

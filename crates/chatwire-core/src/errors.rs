//! Error taxonomy for the realtime engine.
//!
//! - [`ParseError`]: a single inbound frame could not be turned into an
//!   [`InboundEvent`](crate::events::InboundEvent). Always local: the frame
//!   is logged and dropped, the channel stays open.
//! - [`RealtimeError`]: everything a consumer can observe through state
//!   transitions and `error` events. Transport failures never surface as a
//!   synchronous `Err` from `open`/`send`.
//!
//! Both types are `Clone` so they can ride inside broadcast events and watch
//! channels; underlying library errors are captured as strings.

use thiserror::Error;

/// A malformed inbound frame.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum ParseError {
    /// The frame body is not valid JSON.
    #[error("frame is not valid JSON: {0}")]
    InvalidJson(String),
    /// The frame parsed but is not a JSON object.
    #[error("frame is not a JSON object")]
    NotAnObject,
    /// The discriminator field is missing or not a string.
    #[error("frame has no `{field}` discriminator")]
    MissingDiscriminator {
        /// Name of the expected discriminator field.
        field: &'static str,
    },
    /// The discriminator is known but the payload does not have its shape.
    #[error("invalid `{discriminator}` payload: {message}")]
    InvalidPayload {
        /// Discriminator of the rejected frame.
        discriminator: String,
        /// Deserializer message.
        message: String,
    },
}

impl From<serde_json::Error> for ParseError {
    fn from(err: serde_json::Error) -> Self {
        Self::InvalidJson(err.to_string())
    }
}

/// Errors observable on a realtime channel.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum RealtimeError {
    /// Socket or stream failure. Recoverable: triggers backoff or a rebuild.
    #[error("transport failure: {0}")]
    Transport(String),

    /// No credential is available. Not retried until a token is supplied.
    #[error("No auth token")]
    AuthMissing,

    /// The server rejected the credential (close code 4003, HTTP 401/403).
    #[error("authentication rejected (code {code})")]
    AuthRejected {
        /// Close code or HTTP status that signalled the rejection.
        code: u16,
    },

    /// A frame could not be parsed.
    #[error(transparent)]
    Parse(#[from] ParseError),

    /// A subscriber failed while handling an event.
    #[error("handler for `{discriminator}` failed: {message}")]
    Handler {
        /// Discriminator of the event being handled.
        discriminator: String,
        /// Failure description.
        message: String,
    },

    /// The configured reconnect attempt cap was reached.
    #[error("gave up after {attempts} reconnect attempts")]
    RetriesExhausted {
        /// Number of attempts made.
        attempts: u32,
    },
}

impl RealtimeError {
    /// Whether the engine will recover from this error on its own.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Self::Transport(_) | Self::Parse(_) | Self::Handler { .. })
    }

    /// Whether this error requires a new credential before anything retries.
    pub fn is_auth(&self) -> bool {
        matches!(self, Self::AuthMissing | Self::AuthRejected { .. })
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

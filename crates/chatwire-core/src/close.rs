//! Close-code policy shared by both transports.
//!
//! Two codes are reserved: `1000` for a clean, intentional close and `4003`
//! for a rejected credential. Neither may trigger automatic reconnection.
//! Every other code (and an abnormal close with no code at all) reconnects
//! with backoff.

/// Clean, intentional close.
pub const NORMAL_CLOSURE: u16 = 1000;

/// Server rejected the credential carried in the URL.
pub const AUTH_REJECTED: u16 = 4003;

/// What the engine does after a close with a given code.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CloseDisposition {
    /// Schedule a reconnect with backoff.
    Reconnect,
    /// Clean close: stay closed.
    Clean,
    /// Auth rejected: stay closed and notify the host application.
    AuthRejected,
}

impl CloseDisposition {
    /// Classify a close code. `None` means the transport dropped without a
    /// close frame.
    pub fn classify(code: Option<u16>) -> Self {
        match code {
            Some(NORMAL_CLOSURE) => Self::Clean,
            Some(AUTH_REJECTED) => Self::AuthRejected,
            _ => Self::Reconnect,
        }
    }

    /// Whether this disposition schedules a reconnect.
    pub fn reconnects(self) -> bool {
        self == Self::Reconnect
    }
}

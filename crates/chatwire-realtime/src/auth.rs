//! Credentials for both realtime channels.
//!
//! Neither transport can carry a custom header, so the bearer token rides in
//! the URL as a `token` query parameter. Every connect attempt asks the
//! [`TokenProvider`] again; `None` (or an empty string) means "do not
//! connect".

use std::sync::Arc;

use parking_lot::RwLock;
use percent_encoding::{AsciiSet, NON_ALPHANUMERIC, utf8_percent_encode};

/// Characters left unescaped in a token query value (RFC 3986 unreserved).
const TOKEN_VALUE: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'~');

/// Path of the event stream below the REST base URL.
pub const STREAM_PATH: &str = "communication/sse/events/";

/// Supplies the current bearer credential.
pub trait TokenProvider: Send + Sync {
    /// The current token, or `None` when the user is signed out.
    fn token(&self) -> Option<String>;
}

/// A fixed token (or the permanent absence of one).
#[derive(Clone, Debug, Default)]
pub struct StaticToken(Option<String>);

impl StaticToken {
    /// Always returns `token`.
    pub fn new(token: impl Into<String>) -> Self {
        Self(Some(token.into()))
    }

    /// Never returns a token.
    pub fn none() -> Self {
        Self(None)
    }
}

impl TokenProvider for StaticToken {
    fn token(&self) -> Option<String> {
        self.0.clone()
    }
}

/// A token the host application can replace or clear at runtime.
#[derive(Debug, Default)]
pub struct SharedToken {
    inner: RwLock<Option<String>>,
}

impl SharedToken {
    /// Start with `token`.
    pub fn new(token: Option<String>) -> Self {
        Self {
            inner: RwLock::new(token),
        }
    }

    /// Replace the token.
    pub fn set(&self, token: impl Into<String>) {
        *self.inner.write() = Some(token.into());
    }

    /// Forget the token (logout).
    pub fn clear(&self) {
        *self.inner.write() = None;
    }
}

impl TokenProvider for SharedToken {
    fn token(&self) -> Option<String> {
        self.inner.read().clone()
    }
}

/// Called once when the server rejects the credential.
pub type AuthFailureHook = Arc<dyn Fn() + Send + Sync>;

/// Read a usable token: absent and empty are the same thing.
pub fn current_token(tokens: &dyn TokenProvider) -> Option<String> {
    tokens.token().filter(|t| !t.trim().is_empty())
}

/// Append `token=<credential>` to `base`, choosing `?` or `&`.
pub fn with_token(base: &str, token: &str) -> String {
    let encoded = utf8_percent_encode(token, TOKEN_VALUE);
    let separator = if base.ends_with('?') || base.ends_with('&') {
        ""
    } else if base.contains('?') {
        "&"
    } else {
        "?"
    };
    format!("{base}{separator}token={encoded}")
}

/// URL of the bidirectional socket for `token`.
pub fn socket_url(base: &str, token: &str) -> String {
    with_token(base, token)
}

/// URL of the event stream below the REST base `api_base`.
pub fn stream_url(api_base: &str, token: &str) -> String {
    let base = format!("{}/{STREAM_PATH}", api_base.trim_end_matches('/'));
    with_token(&base, token)
}

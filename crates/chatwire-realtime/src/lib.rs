//! # chatwire-realtime
//!
//! The realtime client engine: two self-healing channels feeding one
//! dispatcher, and the short-lived state that hangs off it.
//!
//! | Module | Purpose |
//! |--------|---------|
//! | `auth` | `TokenProvider`, token-in-URL credentials |
//! | `transport` | Socket and event-source seams (tokio-tungstenite, reqwest) |
//! | `connection` | `ConnectionManager`: reconnecting socket with backoff |
//! | `stream` | `StreamChannel`: rebuild-on-error event stream |
//! | `dispatch` | `EventDispatcher`: discriminator-keyed routing |
//! | `store` | `MessageStore`: dedup and optimistic reconciliation |
//! | `typing` | `TypingCoordinator`: local debounce, remote expiry |
//! | `presence` | `PresenceTracker`: online-user polling |
//! | `api` | REST client for presence and history |
//! | `session` | `RealtimeSession`: everything bound to one token |

#![deny(unsafe_code)]

pub mod api;
pub mod auth;
pub mod connection;
pub mod dispatch;
pub mod presence;
pub mod session;
pub mod store;
pub mod stream;
pub mod transport;
pub mod typing;

#[cfg(test)]
pub(crate) mod testing;

pub use api::{ApiError, HttpChatApi, MessagePage};
pub use auth::{AuthFailureHook, SharedToken, StaticToken, TokenProvider};
pub use connection::{
    ConnectionManager, ConnectionState, ListenerId, SocketEvent, SocketEventKind,
};
pub use dispatch::{DispatchOutcome, EventDispatcher, HandlerId};
pub use presence::{PresenceSource, PresenceTracker};
pub use session::{ConnectionIndicator, RealtimeSession, SendReceipt, SessionDeps};
pub use store::{MergeOutcome, MessageStore};
pub use stream::{StreamChannel, StreamState, StreamStatus};
pub use transport::{
    EventSourceConnector, HttpEventSource, SocketConnector, TransportError, TungsteniteConnector,
};
pub use typing::{TypingCoordinator, TypingSignals, TypingState};

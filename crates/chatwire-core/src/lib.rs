//! # chatwire-core
//!
//! Foundation types and pure policies for the chatwire realtime client engine.
//!
//! This crate provides the shared vocabulary that the transport and state
//! crates depend on:
//!
//! - **Branded IDs**: `UserId`, `MessageId`, `ConversationId` as numeric
//!   newtypes, `PendingId` for optimistic messages
//! - **Model**: `Message`, `Conversation`, `PresenceSet`
//! - **Events**: `InboundEvent` tagged union, validated at the parse boundary,
//!   and `OutboundFrame` for the bidirectional channel
//! - **Close policy**: reserved close codes and whether they reconnect
//! - **Backoff**: the reconnect delay schedule
//! - **Errors**: `RealtimeError` taxonomy and `ParseError` via `thiserror`
//! - **Logging**: `tracing` subscriber initialisation

#![deny(unsafe_code)]

pub mod backoff;
pub mod close;
pub mod errors;
pub mod events;
pub mod ids;
pub mod logging;
pub mod model;

pub use backoff::{Backoff, BackoffPolicy};
pub use close::CloseDisposition;
pub use errors::{ParseError, RealtimeError};
pub use events::{Channel, EventPayload, InboundEvent, OutboundFrame};
pub use ids::{ConversationId, MessageId, PendingId, UserId};
pub use logging::init_subscriber;
pub use model::{Conversation, Message, MessageKey, MessageOrigin, PresenceSet};

//! Discriminator-keyed event routing.
//!
//! Frames are parsed once at the boundary; handlers receive a validated
//! [`InboundEvent`]. A handler that returns `Err` or panics is logged and
//! skipped, and the remaining handlers still run. Unknown discriminators are
//! logged and ignored.
//!
//! Besides keyed handlers, every parsed event is also broadcast to
//! [`subscribe`](EventDispatcher::subscribe) receivers. `dispatch` never
//! awaits: slow receivers lag instead of blocking the channel.

use std::any::Any;
use std::collections::HashMap;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use chatwire_core::{InboundEvent, ParseError};
use parking_lot::RwLock;
use tokio::sync::broadcast;
use tracing::{debug, error, warn};

/// Broadcast capacity for the event tap.
const TAP_CAPACITY: usize = 256;

/// Handle returned by [`EventDispatcher::on`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct HandlerId(u64);

type Handler = Arc<dyn Fn(&InboundEvent) -> anyhow::Result<()> + Send + Sync>;

/// What happened to one frame.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// Routed to `handlers` handlers, `failures` of which failed.
    Delivered {
        /// Handlers invoked.
        handlers: usize,
        /// Handlers that returned an error or panicked.
        failures: usize,
    },
    /// Parsed, but nothing is registered for its discriminator.
    Unhandled,
    /// The frame could not be parsed and was dropped.
    Dropped(ParseError),
}

/// Routes inbound events to handlers registered per discriminator.
pub struct EventDispatcher {
    handlers: RwLock<HashMap<String, Vec<(HandlerId, Handler)>>>,
    next_id: AtomicU64,
    tap: broadcast::Sender<InboundEvent>,
    dispatched: AtomicU64,
}

impl EventDispatcher {
    /// Create an empty registry.
    pub fn new() -> Self {
        let (tap, _) = broadcast::channel(TAP_CAPACITY);
        Self {
            handlers: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            tap,
            dispatched: AtomicU64::new(0),
        }
    }

    /// Register `handler` for `discriminator`. Handlers for the same
    /// discriminator run in registration order.
    pub fn on(
        &self,
        discriminator: impl Into<String>,
        handler: impl Fn(&InboundEvent) -> anyhow::Result<()> + Send + Sync + 'static,
    ) -> HandlerId {
        let id = HandlerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.handlers
            .write()
            .entry(discriminator.into())
            .or_default()
            .push((id, Arc::new(handler)));
        id
    }

    /// Unregister one handler. Returns whether it was registered.
    pub fn off(&self, id: HandlerId) -> bool {
        let mut handlers = self.handlers.write();
        let mut removed = false;
        for list in handlers.values_mut() {
            let before = list.len();
            list.retain(|(hid, _)| *hid != id);
            removed |= list.len() != before;
        }
        handlers.retain(|_, list| !list.is_empty());
        removed
    }

    /// Drop every handler.
    pub fn clear(&self) {
        self.handlers.write().clear();
    }

    /// Handlers registered for `discriminator`.
    pub fn handler_count(&self, discriminator: &str) -> usize {
        self.handlers
            .read()
            .get(discriminator)
            .map_or(0, Vec::len)
    }

    /// Receive every successfully parsed event, handled or not.
    pub fn subscribe(&self) -> broadcast::Receiver<InboundEvent> {
        self.tap.subscribe()
    }

    /// Events dispatched so far.
    pub fn dispatched_count(&self) -> u64 {
        self.dispatched.load(Ordering::Relaxed)
    }

    /// Parse a bidirectional text frame and route it.
    pub fn dispatch_socket_frame(&self, raw: &str) -> DispatchOutcome {
        match InboundEvent::from_socket_frame(raw) {
            Ok(event) => self.dispatch(&event),
            Err(err) => {
                warn!(error = %err, bytes = raw.len(), "dropping malformed socket frame");
                DispatchOutcome::Dropped(err)
            }
        }
    }

    /// Route an already parsed event.
    pub fn dispatch(&self, event: &InboundEvent) -> DispatchOutcome {
        let _ = self.dispatched.fetch_add(1, Ordering::Relaxed);
        let _ = self.tap.send(event.clone());

        let handlers: Vec<Handler> = self
            .handlers
            .read()
            .get(&event.discriminator)
            .map(|list| list.iter().map(|(_, h)| Arc::clone(h)).collect())
            .unwrap_or_default();
        if handlers.is_empty() {
            debug!(
                discriminator = %event.discriminator,
                channel = ?event.channel,
                "no handler for event"
            );
            return DispatchOutcome::Unhandled;
        }

        let mut failures = 0;
        for handler in &handlers {
            match catch_unwind(AssertUnwindSafe(|| handler(event))) {
                Ok(Ok(())) => {}
                Ok(Err(err)) => {
                    failures += 1;
                    warn!(
                        discriminator = %event.discriminator,
                        error = %err,
                        "event handler failed"
                    );
                }
                Err(panic) => {
                    failures += 1;
                    error!(
                        discriminator = %event.discriminator,
                        panic = %panic_message(panic.as_ref()),
                        "event handler panicked"
                    );
                }
            }
        }
        DispatchOutcome::Delivered {
            handlers: handlers.len(),
            failures,
        }
    }
}

impl Default for EventDispatcher {
    fn default() -> Self {
        Self::new()
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_owned()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_owned()
    }
}

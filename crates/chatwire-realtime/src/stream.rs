//! Unidirectional event stream.
//!
//! Unlike the socket, a failed event source is never resumed: it is dropped
//! and, after a fixed delay, the whole connect routine runs again (token
//! check included) and builds a new one.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::{Arc, Weak};
use std::time::Duration;

use chatwire_core::events::STREAM_EVENTS;
use chatwire_core::{InboundEvent, RealtimeError};
use chatwire_settings::StreamSettings;
use futures::StreamExt;
use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::auth::{AuthFailureHook, TokenProvider, current_token, stream_url};
use crate::transport::{EventSourceConnector, SseFrame, TransportError};

/// Stream lifecycle.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StreamState {
    /// Not connected yet.
    Idle,
    /// Request in flight.
    Connecting,
    /// Receiving events.
    Open,
    /// Failed, refused, or torn down.
    Closed,
}

/// State plus the error that caused the last transition, if any.
#[derive(Clone, Debug, PartialEq)]
pub struct StreamStatus {
    /// Lifecycle state.
    pub state: StreamState,
    /// Last error; cleared when the stream opens.
    pub error: Option<RealtimeError>,
}

/// Receives every routed stream event.
pub type StreamCallback = Arc<dyn Fn(InboundEvent) + Send + Sync>;

struct Shared {
    generation: u64,
    torn_down: bool,
    source_task: Option<JoinHandle<()>>,
    retry_timer: Option<JoinHandle<()>>,
}

struct Inner {
    connector: Arc<dyn EventSourceConnector>,
    tokens: Arc<dyn TokenProvider>,
    api_base: String,
    enabled: bool,
    retry_delay: Duration,
    on_event: StreamCallback,
    on_auth_failure: Option<AuthFailureHook>,
    shared: Mutex<Shared>,
    status_tx: watch::Sender<StreamStatus>,
}

/// One event stream tied to one token's lifetime.
pub struct StreamChannel {
    inner: Arc<Inner>,
}

impl StreamChannel {
    /// Create an idle channel. Nothing happens until [`connect`](Self::connect).
    pub fn new(
        connector: Arc<dyn EventSourceConnector>,
        tokens: Arc<dyn TokenProvider>,
        api_base: impl Into<String>,
        settings: &StreamSettings,
        on_event: StreamCallback,
        on_auth_failure: Option<AuthFailureHook>,
    ) -> Self {
        let (status_tx, _) = watch::channel(StreamStatus {
            state: StreamState::Idle,
            error: None,
        });
        Self {
            inner: Arc::new(Inner {
                connector,
                tokens,
                api_base: api_base.into(),
                enabled: settings.enabled,
                retry_delay: settings.retry_delay(),
                on_event,
                on_auth_failure,
                shared: Mutex::new(Shared {
                    generation: 0,
                    torn_down: false,
                    source_task: None,
                    retry_timer: None,
                }),
                status_tx,
            }),
        }
    }

    /// Build a fresh source. Any existing source and pending retry are
    /// dropped first.
    pub fn connect(&self) {
        self.inner.connect();
    }

    /// Drop the source and cancel the retry timer. Terminal.
    pub fn teardown(&self) {
        self.inner.teardown();
    }

    /// Current status.
    pub fn status(&self) -> StreamStatus {
        self.inner.status_tx.borrow().clone()
    }

    /// Observe status transitions.
    pub fn subscribe(&self) -> watch::Receiver<StreamStatus> {
        self.inner.status_tx.subscribe()
    }

    /// Whether a retry is scheduled.
    pub fn has_pending_retry(&self) -> bool {
        self.inner.shared.lock().retry_timer.is_some()
    }
}

impl Drop for StreamChannel {
    fn drop(&mut self) {
        self.inner.teardown();
    }
}

impl Inner {
    fn set_status(&self, state: StreamState, error: Option<RealtimeError>) {
        debug!(?state, error = ?error, "stream state");
        let _ = self.status_tx.send_replace(StreamStatus { state, error });
    }

    fn connect(self: &Arc<Self>) {
        if !self.enabled {
            debug!("stream disabled, not connecting");
            return;
        }
        let token = current_token(self.tokens.as_ref());
        let mut shared = self.shared.lock();
        if shared.torn_down {
            return;
        }
        if let Some(timer) = shared.retry_timer.take() {
            timer.abort();
        }
        if let Some(task) = shared.source_task.take() {
            task.abort();
        }
        shared.generation = shared.generation.wrapping_add(1);

        let Some(token) = token else {
            self.set_status(StreamState::Closed, Some(RealtimeError::AuthMissing));
            drop(shared);
            warn!("no auth token, stream not connecting");
            return;
        };

        let previous = self.status_tx.borrow().error.clone();
        self.set_status(StreamState::Connecting, previous);
        let url = stream_url(&self.api_base, &token);
        shared.source_task = Some(tokio::spawn(run_source(
            Arc::downgrade(self),
            shared.generation,
            url,
        )));
    }

    fn is_current(&self, generation: u64) -> bool {
        let shared = self.shared.lock();
        shared.generation == generation && !shared.torn_down
    }

    fn mark_open(&self, generation: u64) -> bool {
        let shared = self.shared.lock();
        if shared.generation != generation || shared.torn_down {
            return false;
        }
        self.set_status(StreamState::Open, None);
        drop(shared);
        info!(generation, "stream open");
        true
    }

    fn route(&self, generation: u64, frame: &SseFrame) {
        if !self.is_current(generation) {
            return;
        }
        let name = if frame.event.is_empty() {
            "message"
        } else {
            frame.event.as_str()
        };
        if !STREAM_EVENTS.contains(&name) {
            debug!(event = name, "ignoring unsubscribed stream event");
            return;
        }
        let event = match InboundEvent::from_stream_frame(name, &frame.data) {
            Ok(event) => event,
            Err(err) => {
                warn!(event = name, error = %err, "dropping malformed stream frame");
                return;
            }
        };
        if catch_unwind(AssertUnwindSafe(|| (self.on_event)(event))).is_err() {
            error!(event = name, "stream callback panicked");
        }
    }

    fn fail(self: &Arc<Self>, generation: u64, err: TransportError) {
        let auth = err.auth_status();
        {
            let mut shared = self.shared.lock();
            if shared.generation != generation || shared.torn_down {
                return;
            }
            drop(shared.source_task.take());
            self.set_status(StreamState::Closed, Some(err.clone().into()));

            if auth.is_none() {
                let deadline = tokio::time::Instant::now() + self.retry_delay;
                let weak = Arc::downgrade(self);
                shared.retry_timer = Some(tokio::spawn(async move {
                    tokio::time::sleep_until(deadline).await;
                    if let Some(inner) = weak.upgrade() {
                        inner.retry(generation);
                    }
                }));
            }
        }

        match auth {
            Some(status) => {
                warn!(status, "stream credential rejected, not retrying");
                if let Some(hook) = &self.on_auth_failure {
                    hook();
                }
            }
            None => warn!(
                error = %err,
                retry_ms = u64::try_from(self.retry_delay.as_millis()).unwrap_or(u64::MAX),
                "stream failed, rebuilding"
            ),
        }
    }

    fn retry(self: &Arc<Self>, generation: u64) {
        {
            let mut shared = self.shared.lock();
            if shared.generation != generation || shared.torn_down {
                return;
            }
            drop(shared.retry_timer.take());
        }
        self.connect();
    }

    fn teardown(&self) {
        let mut shared = self.shared.lock();
        if shared.torn_down {
            return;
        }
        shared.torn_down = true;
        shared.generation = shared.generation.wrapping_add(1);
        if let Some(timer) = shared.retry_timer.take() {
            timer.abort();
        }
        if let Some(task) = shared.source_task.take() {
            task.abort();
        }
        let error = self.status_tx.borrow().error.clone();
        self.set_status(StreamState::Closed, error);
        drop(shared);
        debug!("stream torn down");
    }
}

async fn run_source(weak: Weak<Inner>, generation: u64, url: String) {
    let Some(connector) = weak.upgrade().map(|inner| Arc::clone(&inner.connector)) else {
        return;
    };
    let mut source = match connector.open(&url).await {
        Ok(source) => source,
        Err(err) => {
            if let Some(inner) = weak.upgrade() {
                inner.fail(generation, err);
            }
            return;
        }
    };
    if !weak.upgrade().is_some_and(|inner| inner.mark_open(generation)) {
        return;
    }

    let err = loop {
        match source.next().await {
            Some(Ok(frame)) => {
                let Some(inner) = weak.upgrade() else { return };
                inner.route(generation, &frame);
            }
            Some(Err(err)) => break err,
            None => break TransportError::Io("event stream ended".into()),
        }
    };
    drop(source);
    if let Some(inner) = weak.upgrade() {
        inner.fail(generation, err);
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

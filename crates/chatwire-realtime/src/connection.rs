//! Reconnecting bidirectional socket.
//!
//! [`ConnectionManager`] owns at most one live socket and at most one pending
//! reconnect timer. State transitions:
//!
//! ```text
//! Idle ─open→ Connecting ─ok→ Open ─unexpected close→ Reconnecting ─timer→ Connecting …
//!   any ─close()→ Closed            (terminal)
//!   any ─1000 / 4003 / no token / attempts exhausted→ Closed
//! ```
//!
//! Every socket and timer runs as a spawned task that holds only a weak
//! reference back to the manager, and carries the generation it was started
//! under. A task that wakes up after it has been superseded (or after a
//! forced close) sees a stale generation and does nothing.
//!
//! All methods are synchronous and must be called from within a Tokio
//! runtime. Transport failures never surface as `Err`; they are reported as
//! state transitions and [`SocketEvent`]s.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use chatwire_core::close::{CloseDisposition, NORMAL_CLOSURE};
use chatwire_core::{Backoff, BackoffPolicy, OutboundFrame, RealtimeError};
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::auth::{AuthFailureHook, TokenProvider, current_token, socket_url};
use crate::transport::{CloseInfo, SocketConnector, TransportError, WireFrame};

// ─────────────────────────────────────────────────────────────────────────────
// Public types
// ─────────────────────────────────────────────────────────────────────────────

/// Connection lifecycle.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectionState {
    /// Never opened.
    Idle,
    /// Handshake in flight.
    Connecting,
    /// Socket is up; `send` delivers.
    Open,
    /// Waiting for the backoff timer.
    Reconnecting,
    /// Stopped. Terminal after a forced close.
    Closed,
}

/// Events delivered to listeners.
#[derive(Clone, Debug, PartialEq)]
pub enum SocketEvent {
    /// The socket opened.
    Open,
    /// A text frame arrived.
    Message(String),
    /// The socket closed.
    Close {
        /// Close code; `None` when the transport dropped or never connected.
        code: Option<u16>,
        /// Close reason.
        reason: String,
        /// Whether a reconnect has been scheduled.
        will_reconnect: bool,
    },
    /// Something went wrong.
    Error(RealtimeError),
}

/// Listener selector.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum SocketEventKind {
    /// [`SocketEvent::Open`].
    Open,
    /// [`SocketEvent::Message`].
    Message,
    /// [`SocketEvent::Close`].
    Close,
    /// [`SocketEvent::Error`].
    Error,
}

impl SocketEvent {
    /// The kind listeners subscribe to.
    pub fn kind(&self) -> SocketEventKind {
        match self {
            Self::Open => SocketEventKind::Open,
            Self::Message(_) => SocketEventKind::Message,
            Self::Close { .. } => SocketEventKind::Close,
            Self::Error(_) => SocketEventKind::Error,
        }
    }
}

/// Handle returned by [`ConnectionManager::add_listener`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

type ListenerFn = Arc<dyn Fn(&SocketEvent) + Send + Sync>;

struct Listener {
    id: ListenerId,
    kind: SocketEventKind,
    handler: ListenerFn,
}

// ─────────────────────────────────────────────────────────────────────────────
// Internal state
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Clone)]
struct Target {
    url: String,
    protocols: Vec<String>,
}

enum Command {
    Send(String),
    Close(CloseInfo),
}

/// How a socket task ended.
enum Ended {
    Remote(Option<CloseInfo>),
    Failed(TransportError),
    Local,
}

struct Shared {
    target: Option<Target>,
    backoff: Backoff,
    forced_closed: bool,
    generation: u64,
    reconnect_timer: Option<JoinHandle<()>>,
    socket_task: Option<JoinHandle<()>>,
    outbound: Option<mpsc::UnboundedSender<Command>>,
}

impl Shared {
    fn cancel_timer(&mut self) {
        if let Some(timer) = self.reconnect_timer.take() {
            timer.abort();
        }
    }

    fn abort_socket(&mut self) {
        self.outbound = None;
        if let Some(task) = self.socket_task.take() {
            task.abort();
        }
    }
}

struct Inner {
    connector: Arc<dyn SocketConnector>,
    tokens: Arc<dyn TokenProvider>,
    on_auth_failure: Option<AuthFailureHook>,
    shared: Mutex<Shared>,
    listeners: Mutex<Vec<Listener>>,
    next_listener: AtomicU64,
    state_tx: watch::Sender<ConnectionState>,
}

// ─────────────────────────────────────────────────────────────────────────────
// ConnectionManager
// ─────────────────────────────────────────────────────────────────────────────

/// One reconnecting bidirectional socket.
pub struct ConnectionManager {
    inner: Arc<Inner>,
}

impl ConnectionManager {
    /// Create an idle manager.
    pub fn new(
        connector: Arc<dyn SocketConnector>,
        tokens: Arc<dyn TokenProvider>,
        policy: BackoffPolicy,
    ) -> Self {
        Self::build(connector, tokens, policy, None)
    }

    /// Create an idle manager that calls `hook` when the server rejects the
    /// credential (close code 4003).
    pub fn with_auth_failure_hook(
        connector: Arc<dyn SocketConnector>,
        tokens: Arc<dyn TokenProvider>,
        policy: BackoffPolicy,
        hook: AuthFailureHook,
    ) -> Self {
        Self::build(connector, tokens, policy, Some(hook))
    }

    fn build(
        connector: Arc<dyn SocketConnector>,
        tokens: Arc<dyn TokenProvider>,
        policy: BackoffPolicy,
        on_auth_failure: Option<AuthFailureHook>,
    ) -> Self {
        let (state_tx, _) = watch::channel(ConnectionState::Idle);
        Self {
            inner: Arc::new(Inner {
                connector,
                tokens,
                on_auth_failure,
                shared: Mutex::new(Shared {
                    target: None,
                    backoff: Backoff::new(policy),
                    forced_closed: false,
                    generation: 0,
                    reconnect_timer: None,
                    socket_task: None,
                    outbound: None,
                }),
                listeners: Mutex::new(Vec::new()),
                next_listener: AtomicU64::new(1),
                state_tx,
            }),
        }
    }

    /// Connect to `url` (the token is appended per attempt).
    ///
    /// Refused with a warning after [`close`](Self::close); create a new
    /// manager instead.
    pub fn open(&self, url: impl Into<String>, protocols: Vec<String>) {
        let url = url.into();
        {
            let mut shared = self.inner.shared.lock();
            if shared.forced_closed {
                warn!(url = %url, "open() after close() ignored");
                return;
            }
            shared.cancel_timer();
            shared.abort_socket();
            shared.backoff.reset();
            shared.target = Some(Target { url, protocols });
        }
        self.inner.start_attempt();
    }

    /// Fire-and-forget send. Returns `false` (and warns) unless the socket is
    /// open. Nothing is queued.
    pub fn send(&self, text: impl Into<String>) -> bool {
        self.inner.send_text(text.into())
    }

    /// Serialize and send an outbound frame.
    pub fn send_frame(&self, frame: &OutboundFrame) -> bool {
        self.inner.send_frame(frame)
    }

    /// Close for good: cancel any pending reconnect and close the socket.
    ///
    /// `code` defaults to 1000. Idempotent.
    pub fn close(&self, code: Option<u16>, reason: Option<&str>) {
        self.inner.close(code, reason);
    }

    /// Manual reconnect: skip the remaining backoff and try now.
    ///
    /// Ignored when force-closed, open, or already connecting.
    pub fn reconnect(&self) {
        {
            let mut shared = self.inner.shared.lock();
            if shared.forced_closed {
                warn!("reconnect() after close() ignored");
                return;
            }
            let state = *self.inner.state_tx.borrow();
            if matches!(state, ConnectionState::Open | ConnectionState::Connecting) {
                debug!(?state, "reconnect() ignored, already active");
                return;
            }
            if shared.target.is_none() {
                warn!("reconnect() before open() ignored");
                return;
            }
            shared.cancel_timer();
            shared.backoff.reset();
        }
        self.inner.start_attempt();
    }

    /// Register `handler` for one event kind. Handlers run in registration
    /// order; a panicking handler is logged and skipped.
    pub fn add_listener(
        &self,
        kind: SocketEventKind,
        handler: impl Fn(&SocketEvent) + Send + Sync + 'static,
    ) -> ListenerId {
        let id = ListenerId(self.inner.next_listener.fetch_add(1, Ordering::Relaxed));
        self.inner.listeners.lock().push(Listener {
            id,
            kind,
            handler: Arc::new(handler),
        });
        id
    }

    /// Remove a listener. Returns whether it was registered.
    pub fn remove_listener(&self, id: ListenerId) -> bool {
        let mut listeners = self.inner.listeners.lock();
        let before = listeners.len();
        listeners.retain(|l| l.id != id);
        listeners.len() != before
    }

    /// Registered listeners. Zero after [`close`](Self::close).
    pub fn listener_count(&self) -> usize {
        self.inner.listeners.lock().len()
    }

    /// Current state.
    pub fn state(&self) -> ConnectionState {
        *self.inner.state_tx.borrow()
    }

    /// Observe state transitions.
    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state_tx.subscribe()
    }

    /// Whether a reconnect timer is pending.
    pub fn has_pending_reconnect(&self) -> bool {
        self.inner.shared.lock().reconnect_timer.is_some()
    }

    /// Delay the next scheduled reconnect would wait.
    pub fn current_backoff(&self) -> Duration {
        self.inner.shared.lock().backoff.current()
    }

    /// Reconnects scheduled since the last successful open.
    pub fn reconnect_attempts(&self) -> u32 {
        self.inner.shared.lock().backoff.attempts()
    }

    /// Whether [`close`](Self::close) has been called.
    pub fn is_force_closed(&self) -> bool {
        self.inner.shared.lock().forced_closed
    }

    /// A cheap handle that can send frames without owning the manager.
    pub fn sender(&self) -> SocketSender {
        SocketSender {
            inner: Arc::downgrade(&self.inner),
        }
    }
}

impl Drop for ConnectionManager {
    fn drop(&mut self) {
        self.inner.close(None, Some("dropped"));
    }
}

/// Weak send handle. Sends fail (and warn) once the manager is gone.
#[derive(Clone)]
pub struct SocketSender {
    inner: Weak<Inner>,
}

impl SocketSender {
    /// See [`ConnectionManager::send_frame`].
    pub fn send_frame(&self, frame: &OutboundFrame) -> bool {
        match self.inner.upgrade() {
            Some(inner) => inner.send_frame(frame),
            None => {
                warn!("connection dropped, outbound frame discarded");
                false
            }
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// State machine
// ─────────────────────────────────────────────────────────────────────────────

impl Inner {
    fn set_state(&self, state: ConnectionState) {
        let previous = self.state_tx.send_replace(state);
        if previous != state {
            debug!(from = ?previous, to = ?state, "connection state");
        }
    }

    /// Begin one attempt with a freshly read token.
    fn start_attempt(self: &Arc<Self>) {
        let token = current_token(self.tokens.as_ref());
        let mut shared = self.shared.lock();
        if shared.forced_closed {
            return;
        }
        let Some(target) = shared.target.clone() else {
            return;
        };
        shared.generation = shared.generation.wrapping_add(1);

        let Some(token) = token else {
            self.set_state(ConnectionState::Closed);
            drop(shared);
            warn!("no auth token, not connecting");
            self.emit(&SocketEvent::Error(RealtimeError::AuthMissing));
            return;
        };

        let generation = shared.generation;
        self.set_state(ConnectionState::Connecting);
        let (tx, rx) = mpsc::unbounded_channel();
        shared.outbound = Some(tx);
        let url = socket_url(&target.url, &token);
        let weak = Arc::downgrade(self);
        shared.socket_task = Some(tokio::spawn(run_socket(
            weak,
            generation,
            url,
            target.protocols,
            rx,
        )));
        debug!(generation, url = %target.url, "connecting");
    }

    /// Returns `false` when this attempt has been superseded.
    fn mark_open(&self, generation: u64) -> bool {
        {
            let mut shared = self.shared.lock();
            if shared.generation != generation || shared.forced_closed {
                return false;
            }
            shared.backoff.reset();
            self.set_state(ConnectionState::Open);
        }
        info!(generation, "socket open");
        self.emit(&SocketEvent::Open);
        true
    }

    fn deliver(&self, generation: u64, text: String) {
        {
            let shared = self.shared.lock();
            if shared.generation != generation || shared.forced_closed {
                return;
            }
        }
        self.emit(&SocketEvent::Message(text));
    }

    fn handle_close(self: &Arc<Self>, generation: u64, ended: Ended) {
        let (code, reason, failure) = match ended {
            Ended::Remote(info) => match info {
                Some(info) => (Some(info.code), info.reason, None),
                None => (None, String::new(), None),
            },
            Ended::Failed(err) => (None, String::new(), Some(err)),
            Ended::Local => return,
        };

        // a 401/403 on the upgrade is the handshake's 4003
        let rejected_status = failure.as_ref().and_then(TransportError::auth_status);
        let disposition = if rejected_status.is_some() {
            CloseDisposition::AuthRejected
        } else {
            CloseDisposition::classify(code)
        };
        let mut follow_up = None;
        let will_reconnect;
        {
            let mut shared = self.shared.lock();
            if shared.generation != generation || shared.forced_closed {
                return;
            }
            shared.outbound = None;
            drop(shared.socket_task.take());

            will_reconnect = match disposition {
                CloseDisposition::Reconnect => match self.schedule_reconnect(&mut shared) {
                    Ok(()) => true,
                    Err(err) => {
                        follow_up = Some(err);
                        false
                    }
                },
                CloseDisposition::Clean => {
                    self.set_state(ConnectionState::Closed);
                    false
                }
                CloseDisposition::AuthRejected => {
                    self.set_state(ConnectionState::Closed);
                    follow_up = Some(RealtimeError::AuthRejected {
                        code: rejected_status.or(code).unwrap_or_default(),
                    });
                    false
                }
            };
        }

        if let Some(err) = failure.filter(|_| rejected_status.is_none()) {
            warn!(error = %err, "socket failed");
            self.emit(&SocketEvent::Error(err.into()));
        }
        info!(?code, reason = %reason, will_reconnect, "socket closed");
        self.emit(&SocketEvent::Close {
            code,
            reason,
            will_reconnect,
        });
        if let Some(err) = follow_up {
            self.emit(&SocketEvent::Error(err));
        }
        if disposition == CloseDisposition::AuthRejected {
            warn!("credential rejected, not reconnecting");
            if let Some(hook) = &self.on_auth_failure {
                hook();
            }
        }
    }

    /// Schedule the single pending reconnect. Caller holds the lock.
    fn schedule_reconnect(self: &Arc<Self>, shared: &mut Shared) -> Result<(), RealtimeError> {
        if shared.reconnect_timer.is_some() {
            debug!("reconnect already pending");
            return Ok(());
        }
        if shared.backoff.exhausted() {
            let attempts = shared.backoff.attempts();
            self.set_state(ConnectionState::Closed);
            warn!(attempts, "reconnect attempts exhausted");
            return Err(RealtimeError::RetriesExhausted { attempts });
        }

        let delay = shared.backoff.advance();
        self.set_state(ConnectionState::Reconnecting);
        let generation = shared.generation;
        let deadline = tokio::time::Instant::now() + delay;
        let weak = Arc::downgrade(self);
        shared.reconnect_timer = Some(tokio::spawn(async move {
            tokio::time::sleep_until(deadline).await;
            if let Some(inner) = weak.upgrade() {
                inner.fire_reconnect(generation);
            }
        }));
        info!(
            delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
            attempt = shared.backoff.attempts(),
            "reconnect scheduled"
        );
        Ok(())
    }

    fn fire_reconnect(self: &Arc<Self>, generation: u64) {
        {
            let mut shared = self.shared.lock();
            if shared.forced_closed || shared.generation != generation {
                return;
            }
            drop(shared.reconnect_timer.take());
        }
        self.start_attempt();
    }

    fn send_text(&self, text: String) -> bool {
        let shared = self.shared.lock();
        let state = *self.state_tx.borrow();
        if state != ConnectionState::Open {
            warn!(?state, "socket not open, dropping outbound frame");
            return false;
        }
        match &shared.outbound {
            Some(tx) => tx.send(Command::Send(text)).is_ok(),
            None => false,
        }
    }

    fn send_frame(&self, frame: &OutboundFrame) -> bool {
        match frame.to_json() {
            Ok(text) => self.send_text(text),
            Err(err) => {
                warn!(error = %err, "failed to encode outbound frame");
                false
            }
        }
    }

    fn close(&self, code: Option<u16>, reason: Option<&str>) {
        let info = CloseInfo {
            code: code.unwrap_or(NORMAL_CLOSURE),
            reason: reason.unwrap_or_default().to_owned(),
        };
        let was_open;
        {
            let mut shared = self.shared.lock();
            if shared.forced_closed {
                return;
            }
            shared.forced_closed = true;
            shared.cancel_timer();
            was_open = *self.state_tx.borrow() == ConnectionState::Open;
            match shared.outbound.take() {
                // the socket task sends the close frame and exits
                Some(tx) if was_open => {
                    let _ = tx.send(Command::Close(info.clone()));
                    drop(shared.socket_task.take());
                }
                _ => shared.abort_socket(),
            }
            self.set_state(ConnectionState::Closed);
        }
        info!(code = info.code, "socket closed by client");
        if was_open {
            self.emit(&SocketEvent::Close {
                code: Some(info.code),
                reason: info.reason,
                will_reconnect: false,
            });
        }
        // terminal: nothing will be emitted again
        self.listeners.lock().clear();
    }

    fn emit(&self, event: &SocketEvent) {
        let kind = event.kind();
        let handlers: Vec<ListenerFn> = self
            .listeners
            .lock()
            .iter()
            .filter(|l| l.kind == kind)
            .map(|l| Arc::clone(&l.handler))
            .collect();
        for handler in handlers {
            if catch_unwind(AssertUnwindSafe(|| handler(event))).is_err() {
                error!(?kind, "socket listener panicked");
            }
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Socket task
// ─────────────────────────────────────────────────────────────────────────────

async fn run_socket(
    weak: Weak<Inner>,
    generation: u64,
    url: String,
    protocols: Vec<String>,
    mut commands: mpsc::UnboundedReceiver<Command>,
) {
    let Some(connector) = weak.upgrade().map(|inner| Arc::clone(&inner.connector)) else {
        return;
    };

    let (mut sink, mut stream) = match connector.connect(&url, &protocols).await {
        Ok(halves) => halves,
        Err(err) => {
            if let Some(inner) = weak.upgrade() {
                inner.handle_close(generation, Ended::Failed(err));
            }
            return;
        }
    };

    let opened = weak
        .upgrade()
        .is_some_and(|inner| inner.mark_open(generation));
    if !opened {
        let _ = sink.close().await;
        return;
    }

    let ended = loop {
        tokio::select! {
            command = commands.recv() => match command {
                Some(Command::Send(text)) => {
                    if let Err(err) = sink.send(WireFrame::Text(text)).await {
                        break Ended::Failed(err);
                    }
                }
                Some(Command::Close(info)) => {
                    let _ = sink.send(WireFrame::Close(Some(info))).await;
                    let _ = sink.close().await;
                    break Ended::Local;
                }
                None => {
                    let _ = sink.close().await;
                    break Ended::Local;
                }
            },
            frame = stream.next() => match frame {
                Some(Ok(WireFrame::Text(text))) => {
                    let Some(inner) = weak.upgrade() else { return };
                    inner.deliver(generation, text);
                }
                Some(Ok(WireFrame::Binary(data))) => {
                    debug!(bytes = data.len(), "ignoring binary frame");
                }
                Some(Ok(WireFrame::Close(info))) => break Ended::Remote(info),
                Some(Err(err)) => break Ended::Failed(err),
                None => break Ended::Remote(None),
            },
        }
    };

    if let Some(inner) = weak.upgrade() {
        inner.handle_close(generation, ended);
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::{SharedToken, StaticToken};
    use crate::testing::{MockConnector, settle};
    use assert_matches::assert_matches;
    use chatwire_core::UserId;
    use chatwire_core::logging::capture_logs;
    use std::sync::atomic::AtomicUsize;
    use tokio::time::advance;
    use tracing::Level;

    const URL: &str = "ws://chat.test/ws/chat/";

    fn manager(connector: &Arc<MockConnector>) -> ConnectionManager {
        ConnectionManager::new(
            connector.clone(),
            Arc::new(StaticToken::new("tok")),
            BackoffPolicy::default(),
        )
    }

    fn record(manager: &ConnectionManager) -> Arc<Mutex<Vec<SocketEvent>>> {
        let events = Arc::new(Mutex::new(Vec::new()));
        for kind in [
            SocketEventKind::Open,
            SocketEventKind::Message,
            SocketEventKind::Close,
            SocketEventKind::Error,
        ] {
            let sink = events.clone();
            let _ = manager.add_listener(kind, move |e| sink.lock().push(e.clone()));
        }
        events
    }

    fn count(events: &Mutex<Vec<SocketEvent>>, kind: SocketEventKind) -> usize {
        events.lock().iter().filter(|e| e.kind() == kind).count()
    }

    // -- open / send --

    #[tokio::test(start_paused = true)]
    async fn open_connects_with_token_in_url() {
        let connector = MockConnector::new();
        let _peer = connector.accept();
        let manager = manager(&connector);
        let events = record(&manager);

        manager.open(URL, Vec::new());
        assert_eq!(manager.state(), ConnectionState::Connecting);
        settle().await;

        assert_eq!(manager.state(), ConnectionState::Open);
        assert_eq!(connector.urls(), vec![format!("{URL}?token=tok")]);
        assert_eq!(count(&events, SocketEventKind::Open), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn inbound_text_reaches_message_listeners() {
        let connector = MockConnector::new();
        let peer = connector.accept();
        let manager = manager(&connector);
        let events = record(&manager);
        manager.open(URL, Vec::new());
        settle().await;

        peer.push_text(r#"{"type":"heartbeat"}"#);
        settle().await;

        assert_matches!(
            events.lock().last(),
            Some(SocketEvent::Message(text)) if text.contains("heartbeat")
        );
    }

    #[tokio::test(start_paused = true)]
    async fn send_when_open_writes_frame() {
        let connector = MockConnector::new();
        let mut peer = connector.accept();
        let manager = manager(&connector);
        manager.open(URL, Vec::new());
        settle().await;

        assert!(manager.send_frame(&OutboundFrame::MarkRead {
            sender_id: UserId::new(7)
        }));
        settle().await;

        let sent = peer.sent_json();
        assert_eq!(sent, vec![serde_json::json!({"type": "mark_read", "sender_id": 7})]);
    }

    #[tokio::test(start_paused = true)]
    async fn send_when_not_open_warns_and_drops() {
        let (logs, _guard) = capture_logs();
        let connector = MockConnector::new();
        let manager = manager(&connector);

        assert!(!manager.send("hello"));
        assert!(logs.contains(Level::WARN, "socket not open"));
    }

    // -- backoff --

    #[tokio::test(start_paused = true)]
    async fn backoff_grows_then_resets_after_open() {
        let connector = MockConnector::new();
        connector.refuse();
        connector.refuse();
        connector.refuse();
        let _peer = connector.accept();
        let manager = manager(&connector);

        manager.open(URL, Vec::new());
        settle().await;
        assert_eq!(manager.state(), ConnectionState::Reconnecting);
        assert_eq!(connector.attempts(), 1);
        assert_eq!(manager.current_backoff(), Duration::from_millis(1500));

        // first retry waits 1000 ms
        advance(Duration::from_millis(999)).await;
        settle().await;
        assert_eq!(connector.attempts(), 1);
        advance(Duration::from_millis(1)).await;
        settle().await;
        assert_eq!(connector.attempts(), 2);
        assert_eq!(manager.current_backoff(), Duration::from_millis(2250));

        // second retry waits 1500 ms
        advance(Duration::from_millis(1499)).await;
        settle().await;
        assert_eq!(connector.attempts(), 2);
        advance(Duration::from_millis(1)).await;
        settle().await;
        assert_eq!(connector.attempts(), 3);

        // third retry waits 2250 ms and succeeds
        advance(Duration::from_millis(2250)).await;
        settle().await;
        assert_eq!(connector.attempts(), 4);
        assert_eq!(manager.state(), ConnectionState::Open);
        assert_eq!(manager.current_backoff(), Duration::from_millis(1000));
        assert_eq!(manager.reconnect_attempts(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn unexpected_close_schedules_one_timer() {
        let connector = MockConnector::new();
        let peer = connector.accept();
        let manager = manager(&connector);
        let events = record(&manager);
        manager.open(URL, Vec::new());
        settle().await;

        peer.close_with(1006);
        settle().await;

        assert_eq!(manager.state(), ConnectionState::Reconnecting);
        assert!(manager.has_pending_reconnect());
        assert_matches!(
            events.lock().last(),
            Some(SocketEvent::Close { code: Some(1006), will_reconnect: true, .. })
        );
    }

    #[tokio::test(start_paused = true)]
    async fn never_more_than_one_pending_timer() {
        let connector = MockConnector::new();
        let manager = manager(&connector);
        manager.open(URL, Vec::new());
        settle().await;
        assert!(manager.has_pending_reconnect());

        // manual retry at t=500 fails again; its timer replaces the first one
        advance(Duration::from_millis(500)).await;
        manager.reconnect();
        settle().await;
        assert_eq!(connector.attempts(), 2);
        assert!(manager.has_pending_reconnect());

        // the superseded t=1000 timer must not fire
        advance(Duration::from_millis(500)).await;
        settle().await;
        assert_eq!(connector.attempts(), 2);

        advance(Duration::from_millis(500)).await;
        settle().await;
        assert_eq!(connector.attempts(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn backoff_caps_at_thirty_seconds() {
        let connector = MockConnector::new();
        let manager = manager(&connector);
        manager.open(URL, Vec::new());
        for _ in 0..20 {
            settle().await;
            advance(Duration::from_secs(31)).await;
        }
        settle().await;
        assert_eq!(manager.current_backoff(), Duration::from_secs(30));
    }

    // -- reserved close codes --

    #[tokio::test(start_paused = true)]
    async fn auth_rejected_close_stays_closed() {
        let connector = MockConnector::new();
        let peer = connector.accept();
        let hook_calls = Arc::new(AtomicUsize::new(0));
        let hook_counter = hook_calls.clone();
        let manager = ConnectionManager::with_auth_failure_hook(
            connector.clone(),
            Arc::new(StaticToken::new("tok")),
            BackoffPolicy::default(),
            Arc::new(move || {
                let _ = hook_counter.fetch_add(1, Ordering::SeqCst);
            }),
        );
        let events = record(&manager);
        manager.open(URL, Vec::new());
        settle().await;

        peer.close_with(4003);
        settle().await;

        assert_eq!(manager.state(), ConnectionState::Closed);
        assert!(!manager.has_pending_reconnect());
        assert_eq!(count(&events, SocketEventKind::Close), 1);
        assert!(events
            .lock()
            .iter()
            .any(|e| matches!(e, SocketEvent::Error(RealtimeError::AuthRejected { code: 4003 }))));
        assert_eq!(hook_calls.load(Ordering::SeqCst), 1);

        advance(Duration::from_secs(120)).await;
        settle().await;
        assert_eq!(connector.attempts(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn rejected_upgrade_is_final() {
        let connector = MockConnector::new();
        connector.reject_upgrade(401);
        let hook_calls = Arc::new(AtomicUsize::new(0));
        let hook_counter = hook_calls.clone();
        let manager = ConnectionManager::with_auth_failure_hook(
            connector.clone(),
            Arc::new(StaticToken::new("revoked")),
            BackoffPolicy::default(),
            Arc::new(move || {
                let _ = hook_counter.fetch_add(1, Ordering::SeqCst);
            }),
        );
        let events = record(&manager);
        manager.open(URL, Vec::new());
        settle().await;

        assert_eq!(manager.state(), ConnectionState::Closed);
        assert!(!manager.has_pending_reconnect());
        assert_eq!(hook_calls.load(Ordering::SeqCst), 1);
        let errors: Vec<_> = events
            .lock()
            .iter()
            .filter_map(|e| match e {
                SocketEvent::Error(err) => Some(err.clone()),
                _ => None,
            })
            .collect();
        assert_eq!(errors, vec![RealtimeError::AuthRejected { code: 401 }]);
        assert_matches!(
            events.lock().last(),
            Some(SocketEvent::Error(RealtimeError::AuthRejected { code: 401 }))
        );

        advance(Duration::from_secs(120)).await;
        settle().await;
        assert_eq!(connector.attempts(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn server_error_on_upgrade_still_retries() {
        let connector = MockConnector::new();
        connector.reject_upgrade(502);
        let manager = manager(&connector);
        manager.open(URL, Vec::new());
        settle().await;

        assert_eq!(manager.state(), ConnectionState::Reconnecting);
        assert!(manager.has_pending_reconnect());
    }

    #[tokio::test(start_paused = true)]
    async fn clean_server_close_does_not_reconnect() {
        let connector = MockConnector::new();
        let peer = connector.accept();
        let manager = manager(&connector);
        manager.open(URL, Vec::new());
        settle().await;

        peer.close_with(1000);
        settle().await;

        assert_eq!(manager.state(), ConnectionState::Closed);
        assert!(!manager.has_pending_reconnect());
        assert!(!manager.is_force_closed());
    }

    #[tokio::test(start_paused = true)]
    async fn transport_error_reports_error_then_close() {
        let connector = MockConnector::new();
        let peer = connector.accept();
        let manager = manager(&connector);
        let events = record(&manager);
        manager.open(URL, Vec::new());
        settle().await;

        peer.fail("reset by peer");
        settle().await;

        let kinds: Vec<_> = events.lock().iter().map(SocketEvent::kind).collect();
        assert_eq!(
            kinds,
            vec![SocketEventKind::Open, SocketEventKind::Error, SocketEventKind::Close]
        );
        assert_eq!(manager.state(), ConnectionState::Reconnecting);
    }

    // -- forced close --

    #[tokio::test(start_paused = true)]
    async fn forced_close_is_terminal() {
        let connector = MockConnector::new();
        connector.refuse();
        let manager = manager(&connector);
        manager.open(URL, Vec::new());
        settle().await;
        assert!(manager.has_pending_reconnect());

        let _ = record(&manager);
        assert_eq!(manager.listener_count(), 4);

        manager.close(None, None);
        assert_eq!(manager.state(), ConnectionState::Closed);
        assert!(!manager.has_pending_reconnect());
        assert_eq!(manager.listener_count(), 0);

        advance(Duration::from_secs(600)).await;
        settle().await;
        assert_eq!(connector.attempts(), 1);
        assert_eq!(manager.state(), ConnectionState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn forced_close_sends_close_frame_once() {
        let connector = MockConnector::new();
        let mut peer = connector.accept();
        let manager = manager(&connector);
        let events = record(&manager);
        manager.open(URL, Vec::new());
        settle().await;

        manager.close(Some(1000), Some("bye"));
        manager.close(None, None);
        settle().await;

        assert_eq!(
            peer.sent(),
            vec![WireFrame::Close(Some(CloseInfo {
                code: 1000,
                reason: "bye".into()
            }))]
        );
        assert_eq!(count(&events, SocketEventKind::Close), 1);
        assert!(peer.client_gone());
    }

    #[tokio::test(start_paused = true)]
    async fn open_after_forced_close_is_refused() {
        let connector = MockConnector::new();
        let manager = manager(&connector);
        manager.close(None, None);
        manager.open(URL, Vec::new());
        settle().await;
        assert_eq!(connector.attempts(), 0);
        assert_eq!(manager.state(), ConnectionState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn drop_cancels_pending_reconnect() {
        let connector = MockConnector::new();
        connector.refuse();
        let manager = manager(&connector);
        manager.open(URL, Vec::new());
        settle().await;
        drop(manager);

        advance(Duration::from_secs(60)).await;
        settle().await;
        assert_eq!(connector.attempts(), 1);
    }

    // -- tokens --

    #[tokio::test(start_paused = true)]
    async fn missing_token_makes_no_attempt_and_no_timer() {
        let connector = MockConnector::new();
        let manager = ConnectionManager::new(
            connector.clone(),
            Arc::new(StaticToken::none()),
            BackoffPolicy::default(),
        );
        let events = record(&manager);
        manager.open(URL, Vec::new());
        settle().await;

        assert_eq!(connector.attempts(), 0);
        assert!(!manager.has_pending_reconnect());
        assert_eq!(manager.state(), ConnectionState::Closed);
        assert_matches!(
            events.lock().as_slice(),
            [SocketEvent::Error(RealtimeError::AuthMissing)]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn token_is_reread_on_every_attempt() {
        let connector = MockConnector::new();
        connector.refuse();
        let _peer = connector.accept();
        let tokens = Arc::new(SharedToken::new(Some("first".into())));
        let manager =
            ConnectionManager::new(connector.clone(), tokens.clone(), BackoffPolicy::default());
        manager.open(URL, Vec::new());
        settle().await;

        tokens.set("second");
        advance(Duration::from_millis(1000)).await;
        settle().await;

        assert_eq!(
            connector.urls(),
            vec![format!("{URL}?token=first"), format!("{URL}?token=second")]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn token_cleared_during_backoff_stops_retrying() {
        let connector = MockConnector::new();
        connector.refuse();
        let tokens = Arc::new(SharedToken::new(Some("tok".into())));
        let manager =
            ConnectionManager::new(connector.clone(), tokens.clone(), BackoffPolicy::default());
        manager.open(URL, Vec::new());
        settle().await;

        tokens.clear();
        advance(Duration::from_millis(1000)).await;
        settle().await;

        assert_eq!(connector.attempts(), 1);
        assert_eq!(manager.state(), ConnectionState::Closed);
        assert!(!manager.has_pending_reconnect());
    }

    // -- attempt cap / manual reconnect --

    #[tokio::test(start_paused = true)]
    async fn attempt_cap_gives_up() {
        let connector = MockConnector::new();
        let manager = ConnectionManager::new(
            connector.clone(),
            Arc::new(StaticToken::new("tok")),
            BackoffPolicy {
                max_attempts: Some(2),
                ..BackoffPolicy::default()
            },
        );
        let events = record(&manager);
        manager.open(URL, Vec::new());
        for _ in 0..4 {
            settle().await;
            advance(Duration::from_secs(5)).await;
        }
        settle().await;

        assert_eq!(connector.attempts(), 3);
        assert_eq!(manager.state(), ConnectionState::Closed);
        assert!(!manager.has_pending_reconnect());
        assert!(events.lock().iter().any(|e| matches!(
            e,
            SocketEvent::Error(RealtimeError::RetriesExhausted { attempts: 2 })
        )));
    }

    #[tokio::test(start_paused = true)]
    async fn manual_reconnect_skips_backoff() {
        let connector = MockConnector::new();
        connector.refuse();
        connector.refuse();
        let _peer = connector.accept();
        let manager = manager(&connector);
        manager.open(URL, Vec::new());
        settle().await;
        advance(Duration::from_millis(1000)).await;
        settle().await;
        assert_eq!(manager.current_backoff(), Duration::from_millis(2250));

        manager.reconnect();
        settle().await;

        assert_eq!(connector.attempts(), 3);
        assert_eq!(manager.state(), ConnectionState::Open);
        assert!(!manager.has_pending_reconnect());
    }

    // -- listeners --

    #[tokio::test(start_paused = true)]
    async fn panicking_listener_does_not_starve_others() {
        let connector = MockConnector::new();
        let _peer = connector.accept();
        let manager = manager(&connector);
        let _ = manager.add_listener(SocketEventKind::Open, |_| panic!("listener bug"));
        let seen = Arc::new(AtomicUsize::new(0));
        let counter = seen.clone();
        let _ = manager.add_listener(SocketEventKind::Open, move |_| {
            let _ = counter.fetch_add(1, Ordering::SeqCst);
        });

        manager.open(URL, Vec::new());
        settle().await;
        assert_eq!(seen.load(Ordering::SeqCst), 1);
        assert_eq!(manager.state(), ConnectionState::Open);
    }

    #[tokio::test(start_paused = true)]
    async fn removed_listener_is_not_called() {
        let connector = MockConnector::new();
        let _peer = connector.accept();
        let manager = manager(&connector);
        let seen = Arc::new(AtomicUsize::new(0));
        let counter = seen.clone();
        let id = manager.add_listener(SocketEventKind::Open, move |_| {
            let _ = counter.fetch_add(1, Ordering::SeqCst);
        });
        assert!(manager.remove_listener(id));
        assert!(!manager.remove_listener(id));

        manager.open(URL, Vec::new());
        settle().await;
        assert_eq!(seen.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn sender_fails_after_manager_dropped() {
        let connector = MockConnector::new();
        let manager = manager(&connector);
        let sender = manager.sender();
        drop(manager);
        assert!(!sender.send_frame(&OutboundFrame::MarkRead {
            sender_id: UserId::new(1)
        }));
    }
}

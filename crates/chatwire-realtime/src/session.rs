//! One signed-in session: both channels, dispatch, store, typing and presence
//! wired together and torn down together.
//!
//! A session is bound to one token's lifetime. On re-login, drop it and
//! start a new one; nothing is re-pointed in place.

use std::sync::Arc;

use chatwire_core::events::EventPayload;
use chatwire_core::{
    Conversation, InboundEvent, Message, OutboundFrame, PendingId, RealtimeError, UserId,
};
use chatwire_settings::{ChatwireSettings, ServerSettings};
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::api::{ApiError, HttpChatApi};
use crate::auth::{AuthFailureHook, TokenProvider, current_token};
use crate::connection::{
    ConnectionManager, ConnectionState, SocketEvent, SocketEventKind, SocketSender,
};
use crate::dispatch::EventDispatcher;
use crate::presence::{PresenceSource, PresenceTracker};
use crate::store::MessageStore;
use crate::stream::{StreamChannel, StreamState};
use crate::transport::{
    EventSourceConnector, HttpEventSource, SocketConnector, TungsteniteConnector,
};
use crate::typing::{TypingCoordinator, TypingSignals};

/// Collaborators a session needs.
pub struct SessionDeps {
    /// Opens bidirectional sockets.
    pub socket: Arc<dyn SocketConnector>,
    /// Opens event streams.
    pub events: Arc<dyn EventSourceConnector>,
    /// Online-user source.
    pub presence: Arc<dyn PresenceSource>,
    /// Credential source.
    pub tokens: Arc<dyn TokenProvider>,
    /// Called once when the server rejects the credential.
    pub on_auth_failure: Option<AuthFailureHook>,
}

impl SessionDeps {
    /// Real transports and the REST presence endpoint.
    pub fn live(
        server: &ServerSettings,
        tokens: Arc<dyn TokenProvider>,
        on_auth_failure: Option<AuthFailureHook>,
    ) -> Result<Self, ApiError> {
        let api = HttpChatApi::new(server.api_base_url.clone(), Arc::clone(&tokens))?;
        Ok(Self {
            socket: Arc::new(TungsteniteConnector),
            events: Arc::new(HttpEventSource::default()),
            presence: Arc::new(api),
            tokens,
            on_auth_failure,
        })
    }
}

/// Tri-state connection indicator.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ConnectionIndicator {
    /// Socket open.
    Connected,
    /// Handshake in flight or waiting to reconnect.
    Connecting,
    /// Not connected.
    Disconnected {
        /// Why, for display.
        reason: String,
        /// Whether a manual reconnect can help. `false` for auth failures.
        can_retry: bool,
    },
}

/// Result of [`RealtimeSession::send_message`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SendReceipt {
    /// Id of the optimistic entry.
    pub pending: PendingId,
    /// Whether the frame was handed to an open socket.
    pub sent: bool,
}

impl TypingSignals for SocketSender {
    fn typing_started(&self, peer: UserId) {
        let _ = self.send_frame(&OutboundFrame::Typing {
            recipient_id: peer,
            is_typing: true,
        });
    }

    fn typing_stopped(&self, peer: UserId) {
        let _ = self.send_frame(&OutboundFrame::Typing {
            recipient_id: peer,
            is_typing: false,
        });
    }
}

/// A running realtime session.
pub struct RealtimeSession {
    self_id: UserId,
    active: bool,
    connection: ConnectionManager,
    stream: StreamChannel,
    dispatcher: Arc<EventDispatcher>,
    store: Arc<Mutex<MessageStore>>,
    typing: Arc<TypingCoordinator>,
    presence: PresenceTracker,
    last_error: Arc<Mutex<Option<RealtimeError>>>,
    shut_down: Mutex<bool>,
}

impl RealtimeSession {
    /// Wire everything and, if `should_connect`, open both channels and
    /// start presence polling. Must be called inside a Tokio runtime.
    ///
    /// With `should_connect == false` nothing is opened and no timer exists.
    /// With no token, both channels report `AuthMissing` and stay closed.
    pub fn start(
        settings: &ChatwireSettings,
        self_id: UserId,
        deps: SessionDeps,
        should_connect: bool,
    ) -> Self {
        let SessionDeps {
            socket,
            events,
            presence,
            tokens,
            on_auth_failure,
        } = deps;

        let dispatcher = Arc::new(EventDispatcher::new());
        let store = Arc::new(Mutex::new(MessageStore::new(
            self_id,
            settings.store.reconcile_window(),
        )));
        let last_error = Arc::new(Mutex::new(None));

        let policy = settings.reconnect.policy();
        let connection = match &on_auth_failure {
            Some(hook) => ConnectionManager::with_auth_failure_hook(
                socket,
                Arc::clone(&tokens),
                policy,
                Arc::clone(hook),
            ),
            None => ConnectionManager::new(socket, Arc::clone(&tokens), policy),
        };
        let typing = Arc::new(TypingCoordinator::new(
            Arc::new(connection.sender()),
            &settings.typing,
        ));

        let frames = Arc::clone(&dispatcher);
        let _ = connection.add_listener(SocketEventKind::Message, move |event| {
            if let SocketEvent::Message(text) = event {
                let _ = frames.dispatch_socket_frame(text);
            }
        });
        let errors = Arc::clone(&last_error);
        let _ = connection.add_listener(SocketEventKind::Error, move |event| {
            if let SocketEvent::Error(err) = event {
                *errors.lock() = Some(err.clone());
            }
        });
        let cleared = Arc::clone(&last_error);
        let _ = connection.add_listener(SocketEventKind::Open, move |_| {
            *cleared.lock() = None;
        });

        let stream_dispatcher = Arc::clone(&dispatcher);
        let stream = StreamChannel::new(
            events,
            Arc::clone(&tokens),
            settings.server.api_base_url.clone(),
            &settings.stream,
            Arc::new(move |event: InboundEvent| {
                let _ = stream_dispatcher.dispatch(&event);
            }),
            on_auth_failure,
        );

        register_handlers(&dispatcher, self_id, &store, &typing);

        let presence = PresenceTracker::new(presence, settings.presence.poll_interval());

        let session = Self {
            self_id,
            active: should_connect,
            connection,
            stream,
            dispatcher,
            store,
            typing,
            presence,
            last_error,
            shut_down: Mutex::new(false),
        };

        if !should_connect {
            debug!(user = %self_id, "session idle, not connecting");
            return session;
        }

        let has_token = current_token(tokens.as_ref()).is_some();
        session.connection.open(
            settings.server.socket_url.clone(),
            settings.server.socket_protocols.clone(),
        );
        session.stream.connect();
        if has_token && settings.presence.enabled {
            session.presence.start();
        }
        info!(user = %self_id, has_token, "session started");
        session
    }

    // ── actions ──────────────────────────────────────────────────────────

    /// Insert optimistically and send a `chat_message` frame.
    pub fn send_message(&self, peer: UserId, body: &str) -> SendReceipt {
        let pending = self.store.lock().insert_optimistic(peer, body, None);
        let sent = self.connection.send_frame(&OutboundFrame::ChatMessage {
            recipient_id: peer,
            message: body.to_owned(),
        });
        self.typing.blur();
        SendReceipt { pending, sent }
    }

    /// A keystroke in the composer for `peer`.
    pub fn keystroke(&self, peer: UserId) {
        self.typing.keystroke(peer);
    }

    /// The composer lost focus.
    pub fn blur(&self) {
        self.typing.blur();
    }

    /// Tell the server and the local store that `peer`'s messages are read.
    pub fn mark_read(&self, peer: UserId) -> usize {
        let _ = self
            .connection
            .send_frame(&OutboundFrame::MarkRead { sender_id: peer });
        self.store.lock().mark_conversation_read(peer)
    }

    /// Seed `peer`'s history from a fetched page.
    pub fn seed(&self, peer: UserId, page: Vec<Message>) {
        self.store.lock().seed(peer, page);
    }

    /// Drop an optimistic entry the user gave up on. `false` if it was
    /// already confirmed or unknown.
    pub fn discard_pending(&self, pending: &PendingId) -> bool {
        self.store.lock().discard_pending(pending)
    }

    /// Merge server-side conversation summaries into the local list.
    pub fn upsert_conversations(&self, rows: impl IntoIterator<Item = Conversation>) {
        let mut store = self.store.lock();
        for row in rows {
            store.upsert_conversation(row);
        }
    }

    /// Manual reconnect for both channels.
    pub fn reconnect(&self) {
        if !self.active {
            return;
        }
        self.connection.reconnect();
        let status = self.stream.status();
        let auth_failed = status.error.as_ref().is_some_and(RealtimeError::is_auth);
        if status.state == StreamState::Closed && !auth_failed {
            self.stream.connect();
        }
    }

    // ── reads ────────────────────────────────────────────────────────────

    /// The local user.
    pub fn self_id(&self) -> UserId {
        self.self_id
    }

    /// Messages with `peer`, oldest first.
    pub fn messages(&self, peer: UserId) -> Vec<Message> {
        self.store.lock().messages(peer).to_vec()
    }

    /// Conversation summaries, most recent first.
    pub fn conversations(&self) -> Vec<Conversation> {
        self.store
            .lock()
            .conversations()
            .into_iter()
            .cloned()
            .collect()
    }

    /// Whether `user` is online per the last poll.
    pub fn is_online(&self, user: UserId) -> bool {
        self.presence.is_online(user)
    }

    /// Whether `peer` is typing.
    pub fn is_peer_typing(&self, peer: UserId) -> bool {
        self.typing.is_peer_typing(peer)
    }

    /// What the connection indicator should show.
    ///
    /// A rejected credential on either channel wins over the socket state.
    pub fn indicator(&self) -> ConnectionIndicator {
        let socket_error = self.last_error.lock().clone();
        let auth_error = socket_error
            .filter(RealtimeError::is_auth)
            .or_else(|| self.stream.status().error.filter(RealtimeError::is_auth));
        if let Some(error) = auth_error {
            return ConnectionIndicator::Disconnected {
                reason: error.to_string(),
                can_retry: false,
            };
        }
        match self.connection.state() {
            ConnectionState::Open => ConnectionIndicator::Connected,
            ConnectionState::Connecting | ConnectionState::Reconnecting => {
                ConnectionIndicator::Connecting
            }
            ConnectionState::Idle | ConnectionState::Closed => {
                let error = self.last_error.lock().clone();
                let can_retry = self.active && !self.connection.is_force_closed();
                ConnectionIndicator::Disconnected {
                    reason: error.map_or_else(|| "Disconnected".to_owned(), |e| e.to_string()),
                    can_retry,
                }
            }
        }
    }

    /// Event registry; register extra handlers or tap every event.
    pub fn dispatcher(&self) -> &EventDispatcher {
        &self.dispatcher
    }

    /// The socket.
    pub fn connection(&self) -> &ConnectionManager {
        &self.connection
    }

    /// The event stream.
    pub fn stream(&self) -> &StreamChannel {
        &self.stream
    }

    /// Typing indicators.
    pub fn typing(&self) -> &TypingCoordinator {
        &self.typing
    }

    /// Presence poller.
    pub fn presence(&self) -> &PresenceTracker {
        &self.presence
    }

    /// Release every socket, source and timer. Idempotent.
    pub fn shutdown(&self) {
        {
            let mut done = self.shut_down.lock();
            if *done {
                return;
            }
            *done = true;
        }
        self.typing.shutdown();
        self.presence.stop();
        self.stream.teardown();
        self.connection.close(None, Some("session ended"));
        self.dispatcher.clear();
        info!(user = %self.self_id, "session shut down");
    }
}

impl Drop for RealtimeSession {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn register_handlers(
    dispatcher: &EventDispatcher,
    self_id: UserId,
    store: &Arc<Mutex<MessageStore>>,
    typing: &Arc<TypingCoordinator>,
) {
    for name in ["chat_message", "message", "message_sent"] {
        let store = Arc::clone(store);
        let typing = Arc::clone(typing);
        let _ = dispatcher.on(name, move |event| {
            let (EventPayload::Message(message) | EventPayload::MessageSent(message)) =
                &event.payload
            else {
                anyhow::bail!("expected a message payload");
            };
            if message.sender_id != self_id {
                typing.remote_typing(message.sender_id, false);
            }
            let outcome = store.lock().insert_push(message.clone(), event.received_at);
            debug!(channel = ?event.channel, ?outcome, "message merged");
            Ok(())
        });
    }

    let remote = Arc::clone(typing);
    let _ = dispatcher.on("typing", move |event| {
        let EventPayload::Typing(signal) = &event.payload else {
            anyhow::bail!("expected a typing payload");
        };
        if signal.sender_id != self_id {
            remote.remote_typing(signal.sender_id, signal.is_typing);
        }
        Ok(())
    });

    for name in ["read_receipt", "messages_read"] {
        let store = Arc::clone(store);
        let _ = dispatcher.on(name, move |event| {
            let EventPayload::ReadReceipt(receipt) = &event.payload else {
                anyhow::bail!("expected a read receipt payload");
            };
            let changed = store.lock().apply_read_receipt(receipt);
            debug!(reader = %receipt.reader_id, changed, "read receipt applied");
            Ok(())
        });
    }

    let _ = dispatcher.on("error", |event| {
        if let EventPayload::ServerError { message } = &event.payload {
            warn!(message = %message, "server reported an error");
        }
        Ok(())
    });

    for name in ["connected", "heartbeat", "disconnected", "notification"] {
        let _ = dispatcher.on(name, |event| {
            debug!(
                event = %event.discriminator,
                channel = ?event.channel,
                "stream lifecycle event"
            );
            Ok(())
        });
    }
}

//! Typing indicators, local and remote.
//!
//! Local: the first keystroke emits one start signal; every keystroke pushes
//! the idle deadline out; when it passes, one stop signal goes out. Blur
//! stops immediately.
//!
//! Remote: each start event from a peer (re)arms that peer's expiry. There
//! is at most one expiry timer per peer; a refresh replaces it.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Weak};
use std::time::Duration;

use chatwire_core::UserId;
use chatwire_settings::TypingSettings;
use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::debug;

/// Where local typing signals go (normally the socket).
pub trait TypingSignals: Send + Sync {
    /// The local user started typing to `peer`.
    fn typing_started(&self, peer: UserId);
    /// The local user stopped typing to `peer`.
    fn typing_stopped(&self, peer: UserId);
}

/// Snapshot of one peer's remote typing state.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TypingState {
    /// The peer.
    pub peer_id: UserId,
    /// Whether the peer is typing.
    pub is_typing: bool,
    /// When the state lapses without a refresh.
    pub expires_at: Instant,
}

struct Armed {
    peer: UserId,
    generation: u64,
    expires_at: Instant,
    timer: JoinHandle<()>,
}

#[derive(Default)]
struct State {
    generation: u64,
    local: Option<Armed>,
    remote: HashMap<UserId, Armed>,
    shut_down: bool,
}

impl State {
    fn next_generation(&mut self) -> u64 {
        self.generation = self.generation.wrapping_add(1);
        self.generation
    }
}

struct Inner {
    signals: Arc<dyn TypingSignals>,
    idle_timeout: Duration,
    remote_expiry: Duration,
    state: Mutex<State>,
    peers_tx: watch::Sender<HashSet<UserId>>,
}

/// Debounces local typing and expires remote typing.
pub struct TypingCoordinator {
    inner: Arc<Inner>,
}

impl TypingCoordinator {
    /// Create a coordinator that reports local typing to `signals`.
    pub fn new(signals: Arc<dyn TypingSignals>, settings: &TypingSettings) -> Self {
        let (peers_tx, _) = watch::channel(HashSet::new());
        Self {
            inner: Arc::new(Inner {
                signals,
                idle_timeout: settings.idle_timeout(),
                remote_expiry: settings.remote_expiry(),
                state: Mutex::new(State::default()),
                peers_tx,
            }),
        }
    }

    /// A keystroke in the composer addressed to `peer`.
    pub fn keystroke(&self, peer: UserId) {
        let mut stopped = None;
        let mut started = false;
        {
            let mut state = self.inner.state.lock();
            if state.shut_down {
                return;
            }
            match state.local.take() {
                Some(armed) if armed.peer == peer => armed.timer.abort(),
                Some(armed) => {
                    armed.timer.abort();
                    stopped = Some(armed.peer);
                    started = true;
                }
                None => started = true,
            }
            let generation = state.next_generation();
            let expires_at = Instant::now() + self.inner.idle_timeout;
            let weak = Arc::downgrade(&self.inner);
            state.local = Some(Armed {
                peer,
                generation,
                expires_at,
                timer: tokio::spawn(async move {
                    tokio::time::sleep_until(expires_at).await;
                    if let Some(inner) = weak.upgrade() {
                        inner.local_idle(generation);
                    }
                }),
            });
        }
        if let Some(previous) = stopped {
            self.inner.signals.typing_stopped(previous);
        }
        if started {
            debug!(peer = %peer, "local typing started");
            self.inner.signals.typing_started(peer);
        }
    }

    /// The composer lost focus: stop now.
    pub fn blur(&self) {
        let armed = self.inner.state.lock().local.take();
        if let Some(armed) = armed {
            armed.timer.abort();
            debug!(peer = %armed.peer, "local typing stopped on blur");
            self.inner.signals.typing_stopped(armed.peer);
        }
    }

    /// A typing event from `peer`.
    pub fn remote_typing(&self, peer: UserId, is_typing: bool) {
        {
            let mut state = self.inner.state.lock();
            if state.shut_down {
                return;
            }
            if let Some(previous) = state.remote.remove(&peer) {
                previous.timer.abort();
            }
            if is_typing {
                let generation = state.next_generation();
                let expires_at = Instant::now() + self.inner.remote_expiry;
                let weak: Weak<Inner> = Arc::downgrade(&self.inner);
                let _ = state.remote.insert(
                    peer,
                    Armed {
                        peer,
                        generation,
                        expires_at,
                        timer: tokio::spawn(async move {
                            tokio::time::sleep_until(expires_at).await;
                            if let Some(inner) = weak.upgrade() {
                                inner.remote_expired(peer, generation);
                            }
                        }),
                    },
                );
            }
            self.inner.publish(&state);
        }
        debug!(peer = %peer, is_typing, "remote typing");
    }

    /// Whether the local user is flagged as typing, and to whom.
    pub fn local_peer(&self) -> Option<UserId> {
        self.inner.state.lock().local.as_ref().map(|a| a.peer)
    }

    /// Whether `peer` is currently shown as typing.
    pub fn is_peer_typing(&self, peer: UserId) -> bool {
        self.inner.state.lock().remote.contains_key(&peer)
    }

    /// Remote typing state for `peer`, if any.
    pub fn typing_state(&self, peer: UserId) -> Option<TypingState> {
        self.inner.state.lock().remote.get(&peer).map(|a| TypingState {
            peer_id: peer,
            is_typing: true,
            expires_at: a.expires_at,
        })
    }

    /// Observe the set of peers currently typing.
    pub fn subscribe_peers(&self) -> watch::Receiver<HashSet<UserId>> {
        self.inner.peers_tx.subscribe()
    }

    /// Live idle and expiry timers.
    pub fn pending_timers(&self) -> usize {
        let state = self.inner.state.lock();
        usize::from(state.local.is_some()) + state.remote.len()
    }

    /// Cancel every timer. A local typing flag is stopped first. Terminal.
    pub fn shutdown(&self) {
        self.blur();
        let mut state = self.inner.state.lock();
        state.shut_down = true;
        for (_, armed) in state.remote.drain() {
            armed.timer.abort();
        }
        self.inner.publish(&state);
    }
}

impl Drop for TypingCoordinator {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl Inner {
    fn publish(&self, state: &State) {
        let peers: HashSet<UserId> = state.remote.keys().copied().collect();
        let _ = self.peers_tx.send_if_modified(|current| {
            if *current == peers {
                false
            } else {
                *current = peers;
                true
            }
        });
    }

    fn local_idle(&self, generation: u64) {
        let peer = {
            let mut state = self.state.lock();
            let current = state
                .local
                .as_ref()
                .is_some_and(|a| a.generation == generation);
            if current {
                state.local.take().map(|a| a.peer)
            } else {
                None
            }
        };
        if let Some(peer) = peer {
            debug!(peer = %peer, "local typing idle");
            self.signals.typing_stopped(peer);
        }
    }

    fn remote_expired(&self, peer: UserId, generation: u64) {
        let mut state = self.state.lock();
        if state
            .remote
            .get(&peer)
            .is_some_and(|a| a.generation == generation)
        {
            let _ = state.remote.remove(&peer);
            self.publish(&state);
            debug!(peer = %peer, "remote typing expired");
        }
    }
}

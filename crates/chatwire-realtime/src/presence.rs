//! Presence polling.
//!
//! Each tick replaces the whole [`PresenceSet`]. A failed poll keeps the
//! previous set: presence degrades to last-known, never to offline.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chatwire_core::{PresenceSet, UserId};
use chrono::Utc;
use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::api::ApiError;

/// Answers "who is online".
#[async_trait]
pub trait PresenceSource: Send + Sync {
    /// Current online user ids.
    async fn online_user_ids(&self) -> Result<Vec<UserId>, ApiError>;
}

struct Poller {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

/// Polls a [`PresenceSource`] on a fixed interval.
pub struct PresenceTracker {
    source: Arc<dyn PresenceSource>,
    interval: Duration,
    set_tx: watch::Sender<PresenceSet>,
    poller: Mutex<Option<Poller>>,
}

impl PresenceTracker {
    /// Create a stopped tracker.
    pub fn new(source: Arc<dyn PresenceSource>, interval: Duration) -> Self {
        let (set_tx, _) = watch::channel(PresenceSet::default());
        Self {
            source,
            interval,
            set_tx,
            poller: Mutex::new(None),
        }
    }

    /// Start polling (first poll immediately). Restarts if already running.
    pub fn start(&self) {
        let mut poller = self.poller.lock();
        if let Some(old) = poller.take() {
            old.cancel.cancel();
            old.task.abort();
        }
        let cancel = CancellationToken::new();
        let task = tokio::spawn(poll_loop(
            Arc::clone(&self.source),
            self.interval,
            self.set_tx.clone(),
            cancel.clone(),
        ));
        *poller = Some(Poller { cancel, task });
        let interval_ms = u64::try_from(self.interval.as_millis()).unwrap_or(u64::MAX);
        debug!(interval_ms, "presence polling started");
    }

    /// Stop polling. The last set stays readable.
    pub fn stop(&self) {
        if let Some(poller) = self.poller.lock().take() {
            poller.cancel.cancel();
            poller.task.abort();
            debug!("presence polling stopped");
        }
    }

    /// Whether the poll loop is running.
    pub fn is_running(&self) -> bool {
        self.poller.lock().is_some()
    }

    /// Whether `user` was online at the last successful poll.
    pub fn is_online(&self, user: UserId) -> bool {
        self.set_tx.borrow().contains(user)
    }

    /// Copy of the latest set.
    pub fn snapshot(&self) -> PresenceSet {
        self.set_tx.borrow().clone()
    }

    /// Observe set replacements.
    pub fn subscribe(&self) -> watch::Receiver<PresenceSet> {
        self.set_tx.subscribe()
    }
}

impl Drop for PresenceTracker {
    fn drop(&mut self) {
        self.stop();
    }
}

async fn poll_loop(
    source: Arc<dyn PresenceSource>,
    period: Duration,
    set_tx: watch::Sender<PresenceSet>,
    cancel: CancellationToken,
) {
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            () = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }
        let result = tokio::select! {
            () = cancel.cancelled() => break,
            result = source.online_user_ids() => result,
        };
        match result {
            Ok(ids) => {
                let count = ids.len();
                set_tx.send_modify(|set| set.replace(ids, Utc::now()));
                debug!(online = count, "presence refreshed");
            }
            Err(err) => warn!(error = %err, "presence poll failed, keeping last set"),
        }
    }
}

//! Per-conversation message merge.
//!
//! Three uncoordinated sources feed the same list: REST pages (`seed`),
//! push events from either transport (`insert_push`), and local optimistic
//! sends (`insert_optimistic`). Arrival order between them is arbitrary; the
//! list stays correct because of two rules:
//!
//! 1. A confirmed id is inserted at most once per conversation (hash index,
//!    not a list scan).
//! 2. A confirmed message replaces the oldest pending entry with the same
//!    sender, receiver and body that was inserted no later than the
//!    confirmed arrival and within the reconcile window.
//!
//! Lists are kept sorted by timestamp ascending; equal timestamps keep
//! arrival order.

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use chatwire_core::events::ReadReceiptPayload;
use chatwire_core::{Conversation, Message, MessageId, PendingId, UserId};
use chrono::{DateTime, TimeDelta, Utc};
use tracing::{debug, warn};

/// Result of merging one confirmed message.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum MergeOutcome {
    /// New entry.
    Inserted,
    /// Same id already present; the copy was discarded.
    Duplicate,
    /// Replaced the optimistic entry with this pending id.
    Reconciled(PendingId),
    /// Not a confirmed message; nothing changed.
    Ignored,
}

#[derive(Debug)]
struct ConversationLog {
    summary: Conversation,
    messages: Vec<Message>,
    confirmed: HashSet<MessageId>,
}

impl ConversationLog {
    fn new(peer: UserId) -> Self {
        Self {
            summary: Conversation::new(peer),
            messages: Vec::new(),
            confirmed: HashSet::new(),
        }
    }

    fn insert_sorted(&mut self, message: Message) -> usize {
        let at = self
            .messages
            .partition_point(|m| m.timestamp <= message.timestamp);
        self.messages.insert(at, message);
        at
    }

    /// Oldest pending entry `confirmed` may replace.
    fn reconcile_candidate(
        &self,
        confirmed: &Message,
        arrived_at: DateTime<Utc>,
        window: TimeDelta,
    ) -> Option<usize> {
        self.messages.iter().position(|m| {
            m.is_pending()
                && m.same_content(confirmed)
                && m.timestamp <= arrived_at
                && arrived_at - m.timestamp <= window
        })
    }

    /// Point the summary at the newest entry if `message` is it.
    fn touch_summary(&mut self, message: &Message) {
        let newest = self
            .summary
            .last_message_at
            .is_none_or(|last| message.timestamp >= last);
        if newest {
            self.summary.last_message_preview = message.preview();
            self.summary.last_message_at = Some(message.timestamp);
        }
        if self.summary.id.is_none() {
            self.summary.id = message.conversation_id;
        }
    }

    fn refresh_summary_head(&mut self) {
        match self.messages.last() {
            Some(last) => {
                self.summary.last_message_preview = last.preview();
                self.summary.last_message_at = Some(last.timestamp);
            }
            None => {
                self.summary.last_message_preview.clear();
                self.summary.last_message_at = None;
            }
        }
    }
}

/// In-memory message lists keyed by the other participant.
#[derive(Debug)]
pub struct MessageStore {
    self_id: UserId,
    window: TimeDelta,
    logs: HashMap<UserId, ConversationLog>,
}

impl MessageStore {
    /// Create an empty store for the local user `self_id`.
    pub fn new(self_id: UserId, reconcile_window: Duration) -> Self {
        Self {
            self_id,
            window: TimeDelta::from_std(reconcile_window).unwrap_or(TimeDelta::MAX),
            logs: HashMap::new(),
        }
    }

    /// The local user.
    pub fn self_id(&self) -> UserId {
        self.self_id
    }

    fn log_mut(&mut self, peer: UserId) -> &mut ConversationLog {
        self.logs
            .entry(peer)
            .or_insert_with(|| ConversationLog::new(peer))
    }

    // ── sources ──────────────────────────────────────────────────────────

    /// Replace confirmed history for `peer` with a fetched page.
    ///
    /// Pending entries survive: each is either reconciled against a fetched
    /// message or re-applied on top.
    pub fn seed(&mut self, peer: UserId, fetched: Vec<Message>) {
        self.seed_at(peer, fetched, Utc::now());
    }

    /// [`seed`](Self::seed) with an explicit fetch time.
    pub fn seed_at(&mut self, peer: UserId, fetched: Vec<Message>, fetched_at: DateTime<Utc>) {
        let self_id = self.self_id;
        let window = self.window;
        let log = self.log_mut(peer);

        let pending: Vec<Message> = log
            .messages
            .drain(..)
            .filter(Message::is_pending)
            .collect();
        log.confirmed.clear();

        let mut skipped = 0usize;
        for message in fetched {
            let Some(id) = message.confirmed_id() else {
                skipped += 1;
                continue;
            };
            if log.confirmed.insert(id) {
                let _ = log.insert_sorted(message);
            } else {
                skipped += 1;
            }
        }

        let mut matched = HashSet::new();
        for entry in pending {
            let hit = log.messages.iter().find(|m| {
                m.confirmed_id().is_some_and(|id| !matched.contains(&id))
                    && m.same_content(&entry)
                    && entry.timestamp <= fetched_at
                    && fetched_at - entry.timestamp <= window
                    && (m.timestamp - entry.timestamp).abs() <= window
            });
            match hit.and_then(Message::confirmed_id) {
                Some(id) => {
                    let _ = matched.insert(id);
                    debug!(peer = %peer, id = %id, "pending entry confirmed by fetch");
                }
                None => {
                    let _ = log.insert_sorted(entry);
                }
            }
        }

        log.refresh_summary_head();
        if log.summary.id.is_none() {
            log.summary.id = log.messages.iter().find_map(|m| m.conversation_id);
        }
        let unread = log
            .messages
            .iter()
            .filter(|m| m.sender_id != self_id && !m.is_read)
            .count();
        log.summary.unread_count = u32::try_from(unread).unwrap_or(u32::MAX);

        debug!(peer = %peer, total = log.messages.len(), skipped, "conversation seeded");
    }

    /// Merge a confirmed message from a push event that arrived at
    /// `arrived_at`.
    pub fn insert_push(&mut self, message: Message, arrived_at: DateTime<Utc>) -> MergeOutcome {
        let Some(id) = message.confirmed_id() else {
            warn!("push message without server id ignored");
            return MergeOutcome::Ignored;
        };
        let self_id = self.self_id;
        let window = self.window;
        let peer = message.peer_of(self_id);
        let log = self.log_mut(peer);

        if log.confirmed.contains(&id) {
            debug!(peer = %peer, id = %id, "duplicate message discarded");
            return MergeOutcome::Duplicate;
        }

        let reconciled = log
            .reconcile_candidate(&message, arrived_at, window)
            .and_then(|at| log.messages.remove(at).pending_id().cloned());

        let inbound_unread = message.sender_id != self_id && !message.is_read;
        let _ = log.confirmed.insert(id);
        log.touch_summary(&message);
        let _ = log.insert_sorted(message);
        if reconciled.is_some() {
            // the replaced entry's local time may have been the head
            log.refresh_summary_head();
        }
        if inbound_unread {
            log.summary.unread_count = log.summary.unread_count.saturating_add(1);
        }

        match reconciled {
            Some(pending) => {
                debug!(
                    peer = %peer,
                    id = %id,
                    pending = %pending.as_str(),
                    "optimistic entry reconciled"
                );
                MergeOutcome::Reconciled(pending)
            }
            None => MergeOutcome::Inserted,
        }
    }

    /// Insert a message the local user is sending, before confirmation.
    pub fn insert_optimistic(
        &mut self,
        peer: UserId,
        body: impl Into<String>,
        attachment: Option<String>,
    ) -> PendingId {
        self.insert_optimistic_at(peer, body, attachment, Utc::now())
    }

    /// [`insert_optimistic`](Self::insert_optimistic) with an explicit time.
    pub fn insert_optimistic_at(
        &mut self,
        peer: UserId,
        body: impl Into<String>,
        attachment: Option<String>,
        now: DateTime<Utc>,
    ) -> PendingId {
        let message = Message::optimistic(self.self_id, peer, body, attachment, now);
        let pending = message.pending_id().cloned().unwrap_or_default();
        let log = self.log_mut(peer);
        log.touch_summary(&message);
        let _ = log.insert_sorted(message);
        pending
    }

    /// Drop an optimistic entry whose send failed. Returns whether it existed.
    pub fn discard_pending(&mut self, pending: &PendingId) -> bool {
        for log in self.logs.values_mut() {
            if let Some(at) = log
                .messages
                .iter()
                .position(|m| m.pending_id() == Some(pending))
            {
                let _ = log.messages.remove(at);
                log.refresh_summary_head();
                return true;
            }
        }
        false
    }

    // ── read state ───────────────────────────────────────────────────────

    /// Flag messages the local user sent as read by `receipt.reader_id`.
    /// Entries are updated in place. Returns how many changed.
    pub fn apply_read_receipt(&mut self, receipt: &ReadReceiptPayload) -> usize {
        let self_id = self.self_id;
        let Some(log) = self.logs.get_mut(&receipt.reader_id) else {
            return 0;
        };
        let read_at = receipt.read_at.unwrap_or_else(Utc::now);
        let mut changed = 0;
        for message in &mut log.messages {
            let targeted = receipt.message_ids.is_empty()
                || message
                    .confirmed_id()
                    .is_some_and(|id| receipt.message_ids.contains(&id));
            if message.sender_id == self_id
                && message.receiver_id == receipt.reader_id
                && !message.is_pending()
                && !message.is_read
                && targeted
            {
                message.is_read = true;
                message.delivered_at = Some(read_at);
                changed += 1;
            }
        }
        changed
    }

    /// Mark everything `peer` sent as read locally and zero the unread count.
    pub fn mark_conversation_read(&mut self, peer: UserId) -> usize {
        let Some(log) = self.logs.get_mut(&peer) else {
            return 0;
        };
        let mut changed = 0;
        for message in &mut log.messages {
            if message.sender_id == peer && !message.is_read {
                message.is_read = true;
                changed += 1;
            }
        }
        log.summary.unread_count = 0;
        changed
    }

    // ── summaries ────────────────────────────────────────────────────────

    /// Merge a conversation row from a REST listing. Local activity newer
    /// than the row wins for the preview.
    pub fn upsert_conversation(&mut self, row: Conversation) {
        let log = self.log_mut(row.other_user_id);
        let local_newer = match (log.summary.last_message_at, row.last_message_at) {
            (Some(local), Some(remote)) => local > remote,
            (Some(_), None) => true,
            _ => false,
        };
        if row.id.is_some() {
            log.summary.id = row.id;
        }
        log.summary.unread_count = row.unread_count;
        if !local_newer {
            log.summary.last_message_preview = row.last_message_preview;
            log.summary.last_message_at = row.last_message_at;
        }
    }

    // ── reads ────────────────────────────────────────────────────────────

    /// Messages with `peer`, oldest first.
    pub fn messages(&self, peer: UserId) -> &[Message] {
        self.logs.get(&peer).map_or(&[], |log| log.messages.as_slice())
    }

    /// Summary for `peer`.
    pub fn conversation(&self, peer: UserId) -> Option<&Conversation> {
        self.logs.get(&peer).map(|log| &log.summary)
    }

    /// All summaries, most recent activity first.
    pub fn conversations(&self) -> Vec<&Conversation> {
        let mut rows: Vec<&Conversation> = self.logs.values().map(|log| &log.summary).collect();
        rows.sort_by(|a, b| b.last_message_at.cmp(&a.last_message_at));
        rows
    }

    /// Whether `peer`'s list holds confirmed id `id`.
    pub fn contains(&self, peer: UserId, id: MessageId) -> bool {
        self.logs
            .get(&peer)
            .is_some_and(|log| log.confirmed.contains(&id))
    }

    /// Optimistic entries awaiting confirmation across all conversations.
    pub fn pending_count(&self) -> usize {
        self.logs
            .values()
            .map(|log| log.messages.iter().filter(|m| m.is_pending()).count())
            .sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use chatwire_core::{MessageKey, MessageOrigin};
    use proptest::prelude::*;

    const ME: UserId = UserId::new(1);
    const BOB: UserId = UserId::new(2);
    const WINDOW: Duration = Duration::from_secs(60);

    fn t(secs: i64) -> DateTime<Utc> {
        DateTime::from_timestamp(1_767_225_600 + secs, 0).unwrap()
    }

    fn confirmed(id: i64, from: UserId, to: UserId, body: &str, at: DateTime<Utc>) -> Message {
        Message {
            key: MessageKey::Confirmed(MessageId::new(id)),
            conversation_id: Some(chatwire_core::ConversationId::new(9)),
            sender_id: from,
            receiver_id: to,
            body: body.to_owned(),
            attachment: None,
            timestamp: at,
            is_read: false,
            delivered_at: None,
            origin: MessageOrigin::Push,
        }
    }

    fn store() -> MessageStore {
        MessageStore::new(ME, WINDOW)
    }

    fn ids(store: &MessageStore, peer: UserId) -> Vec<MessageKey> {
        store.messages(peer).iter().map(|m| m.key.clone()).collect()
    }

    // -- dedup --

    #[test]
    fn same_id_twice_is_one_entry() {
        let mut store = store();
        let msg = confirmed(7, BOB, ME, "hey", t(0));
        assert_eq!(store.insert_push(msg.clone(), t(1)), MergeOutcome::Inserted);
        assert_eq!(store.insert_push(msg, t(2)), MergeOutcome::Duplicate);
        assert_eq!(store.messages(BOB).len(), 1);
        assert_eq!(store.conversation(BOB).unwrap().unread_count, 1);
    }

    #[test]
    fn push_after_fetch_is_deduplicated() {
        let mut store = store();
        store.seed_at(BOB, vec![confirmed(7, BOB, ME, "hey", t(0))], t(5));
        assert_eq!(
            store.insert_push(confirmed(7, BOB, ME, "hey", t(0)), t(6)),
            MergeOutcome::Duplicate
        );
        assert_eq!(store.messages(BOB).len(), 1);
    }

    #[test]
    fn pushes_are_sorted_by_timestamp() {
        let mut store = store();
        let _ = store.insert_push(confirmed(3, BOB, ME, "c", t(30)), t(31));
        let _ = store.insert_push(confirmed(1, BOB, ME, "a", t(10)), t(32));
        let _ = store.insert_push(confirmed(2, ME, BOB, "b", t(20)), t(33));
        let bodies: Vec<_> = store.messages(BOB).iter().map(|m| m.body.as_str()).collect();
        assert_eq!(bodies, ["a", "b", "c"]);
    }

    #[test]
    fn pending_push_is_ignored() {
        let mut store = store();
        let msg = Message::optimistic(BOB, ME, "x", None, t(0));
        assert_eq!(store.insert_push(msg, t(1)), MergeOutcome::Ignored);
        assert!(store.messages(BOB).is_empty());
    }

    // -- optimistic reconciliation --

    #[test]
    fn optimistic_then_confirmed_leaves_one_entry() {
        let mut store = store();
        let pending = store.insert_optimistic_at(BOB, "hi", None, t(0));

        let outcome = store.insert_push(confirmed(42, ME, BOB, "hi", t(1)), t(1));

        assert_eq!(outcome, MergeOutcome::Reconciled(pending));
        assert_eq!(ids(&store, BOB), vec![MessageKey::Confirmed(MessageId::new(42))]);
        assert_eq!(store.pending_count(), 0);
    }

    #[test]
    fn reconciles_oldest_matching_pending_first() {
        let mut store = store();
        let first = store.insert_optimistic_at(BOB, "ok", None, t(0));
        let second = store.insert_optimistic_at(BOB, "ok", None, t(1));

        assert_eq!(
            store.insert_push(confirmed(1, ME, BOB, "ok", t(2)), t(2)),
            MergeOutcome::Reconciled(first)
        );
        assert_eq!(
            store.insert_push(confirmed(2, ME, BOB, "ok", t(3)), t(3)),
            MergeOutcome::Reconciled(second)
        );
        assert_eq!(store.messages(BOB).len(), 2);
    }

    #[test]
    fn different_body_does_not_reconcile() {
        let mut store = store();
        let _ = store.insert_optimistic_at(BOB, "hi", None, t(0));
        assert_eq!(
            store.insert_push(confirmed(42, ME, BOB, "hi!", t(1)), t(1)),
            MergeOutcome::Inserted
        );
        assert_eq!(store.messages(BOB).len(), 2);
    }

    #[test]
    fn inbound_echo_of_same_text_does_not_reconcile() {
        let mut store = store();
        let _ = store.insert_optimistic_at(BOB, "hi", None, t(0));
        assert_eq!(
            store.insert_push(confirmed(42, BOB, ME, "hi", t(1)), t(1)),
            MergeOutcome::Inserted
        );
        assert_eq!(store.pending_count(), 1);
    }

    #[test]
    fn arrival_before_optimistic_insert_does_not_reconcile() {
        let mut store = store();
        let _ = store.insert_optimistic_at(BOB, "hi", None, t(10));
        assert_eq!(
            store.insert_push(confirmed(42, ME, BOB, "hi", t(5)), t(5)),
            MergeOutcome::Inserted
        );
    }

    #[test]
    fn stale_pending_outside_window_stays() {
        let mut store = store();
        let _ = store.insert_optimistic_at(BOB, "hi", None, t(0));
        assert_eq!(
            store.insert_push(confirmed(42, ME, BOB, "hi", t(61)), t(61)),
            MergeOutcome::Inserted
        );
        assert_eq!(store.pending_count(), 1);
    }

    #[test]
    fn discard_pending_removes_entry() {
        let mut store = store();
        let pending = store.insert_optimistic_at(BOB, "lost", None, t(0));
        assert!(store.discard_pending(&pending));
        assert!(!store.discard_pending(&pending));
        assert!(store.messages(BOB).is_empty());
        assert_eq!(store.conversation(BOB).unwrap().last_message_at, None);
    }

    // -- seed --

    #[test]
    fn seed_replaces_confirmed_and_keeps_pending() {
        let mut store = store();
        let _ = store.insert_push(confirmed(1, BOB, ME, "old", t(0)), t(0));
        let pending = store.insert_optimistic_at(BOB, "draft", None, t(50));

        store.seed_at(
            BOB,
            vec![
                confirmed(2, BOB, ME, "b", t(20)),
                confirmed(3, ME, BOB, "c", t(30)),
                confirmed(2, BOB, ME, "b", t(20)),
            ],
            t(55),
        );

        let keys = ids(&store, BOB);
        assert_eq!(
            keys,
            vec![
                MessageKey::Confirmed(MessageId::new(2)),
                MessageKey::Confirmed(MessageId::new(3)),
                MessageKey::Pending(pending),
            ]
        );
        assert!(!store.contains(BOB, MessageId::new(1)));
        assert_eq!(store.conversation(BOB).unwrap().unread_count, 1);
    }

    #[test]
    fn seed_confirms_pending_present_in_page() {
        let mut store = store();
        let _ = store.insert_optimistic_at(BOB, "hi", None, t(0));
        store.seed_at(BOB, vec![confirmed(42, ME, BOB, "hi", t(1))], t(2));
        assert_eq!(ids(&store, BOB), vec![MessageKey::Confirmed(MessageId::new(42))]);
    }

    #[test]
    fn seed_sets_summary_from_newest() {
        let mut store = store();
        store.seed_at(
            BOB,
            vec![confirmed(1, BOB, ME, "first", t(0)), confirmed(2, BOB, ME, "last", t(9))],
            t(10),
        );
        let summary = store.conversation(BOB).unwrap();
        assert_eq!(summary.last_message_preview, "last");
        assert_eq!(summary.last_message_at, Some(t(9)));
        assert_eq!(summary.id, Some(chatwire_core::ConversationId::new(9)));
    }

    // -- summaries --

    #[test]
    fn older_push_does_not_move_preview() {
        let mut store = store();
        let _ = store.insert_push(confirmed(2, BOB, ME, "new", t(20)), t(20));
        let _ = store.insert_push(confirmed(1, BOB, ME, "old", t(10)), t(21));
        let summary = store.conversation(BOB).unwrap();
        assert_eq!(summary.last_message_preview, "new");
        assert_eq!(summary.unread_count, 2);
    }

    #[test]
    fn outbound_messages_do_not_count_unread() {
        let mut store = store();
        let _ = store.insert_push(confirmed(1, ME, BOB, "mine", t(0)), t(0));
        assert_eq!(store.conversation(BOB).unwrap().unread_count, 0);
    }

    #[test]
    fn conversations_sorted_by_activity() {
        let carol = UserId::new(3);
        let mut store = store();
        let _ = store.insert_push(confirmed(1, BOB, ME, "a", t(0)), t(0));
        let _ = store.insert_push(confirmed(2, carol, ME, "b", t(5)), t(5));
        let order: Vec<_> = store.conversations().iter().map(|c| c.other_user_id).collect();
        assert_eq!(order, vec![carol, BOB]);
    }

    #[test]
    fn upsert_keeps_newer_local_preview() {
        let mut store = store();
        let _ = store.insert_push(confirmed(1, BOB, ME, "local", t(100)), t(100));
        let mut row = Conversation::new(BOB);
        row.last_message_preview = "remote".into();
        row.last_message_at = Some(t(50));
        row.unread_count = 4;
        store.upsert_conversation(row);

        let summary = store.conversation(BOB).unwrap();
        assert_eq!(summary.last_message_preview, "local");
        assert_eq!(summary.unread_count, 4);
    }

    #[test]
    fn reconciled_echo_with_earlier_server_time_moves_summary_back() {
        let mut store = store();
        let _ = store.insert_push(confirmed(1, BOB, ME, "before", t(10)), t(10));
        let _ = store.insert_optimistic_at(BOB, "mine", None, t(50));

        let outcome = store.insert_push(confirmed(2, ME, BOB, "mine", t(40)), t(55));

        assert_matches!(outcome, MergeOutcome::Reconciled(_));
        let summary = store.conversation(BOB).unwrap();
        assert_eq!(summary.last_message_at, Some(t(40)));
        assert_eq!(summary.last_message_preview, "mine");
    }

    // -- read state --

    #[test]
    fn read_receipt_updates_in_place() {
        let mut store = store();
        let _ = store.insert_push(confirmed(1, ME, BOB, "a", t(0)), t(0));
        let _ = store.insert_push(confirmed(2, BOB, ME, "b", t(1)), t(1));
        let _ = store.insert_push(confirmed(3, ME, BOB, "c", t(2)), t(2));
        let before = ids(&store, BOB);

        let changed = store.apply_read_receipt(&ReadReceiptPayload {
            reader_id: BOB,
            message_ids: vec![MessageId::new(3)],
            read_at: Some(t(10)),
        });

        assert_eq!(changed, 1);
        assert_eq!(ids(&store, BOB), before);
        let third = &store.messages(BOB)[2];
        assert!(third.is_read);
        assert_eq!(third.delivered_at, Some(t(10)));
        assert!(!store.messages(BOB)[0].is_read);
    }

    #[test]
    fn read_receipt_without_ids_reads_all_outbound() {
        let mut store = store();
        let _ = store.insert_push(confirmed(1, ME, BOB, "a", t(0)), t(0));
        let _ = store.insert_push(confirmed(2, ME, BOB, "b", t(1)), t(1));
        let _ = store.insert_push(confirmed(3, BOB, ME, "c", t(2)), t(2));
        let changed = store.apply_read_receipt(&ReadReceiptPayload {
            reader_id: BOB,
            message_ids: Vec::new(),
            read_at: None,
        });
        assert_eq!(changed, 2);
        assert!(!store.messages(BOB)[2].is_read);
    }

    #[test]
    fn mark_conversation_read_zeroes_unread() {
        let mut store = store();
        let _ = store.insert_push(confirmed(1, BOB, ME, "a", t(0)), t(0));
        let _ = store.insert_push(confirmed(2, BOB, ME, "b", t(1)), t(1));
        assert_eq!(store.mark_conversation_read(BOB), 2);
        assert_eq!(store.conversation(BOB).unwrap().unread_count, 0);
        assert_matches!(store.messages(BOB), [a, b] if a.is_read && b.is_read);
    }

    // -- invariants --

    #[derive(Clone, Debug)]
    enum Op {
        Push { id: i64, outbound: bool, body: u8, at: i64 },
        Optimistic { body: u8, at: i64 },
        Seed { ids: Vec<i64> },
    }

    fn op() -> impl Strategy<Value = Op> {
        prop_oneof![
            (0i64..12, any::<bool>(), 0u8..3, 0i64..120)
                .prop_map(|(id, outbound, body, at)| Op::Push { id, outbound, body, at }),
            (0u8..3, 0i64..120).prop_map(|(body, at)| Op::Optimistic { body, at }),
            proptest::collection::vec(0i64..12, 0..6).prop_map(|ids| Op::Seed { ids }),
        ]
    }

    proptest! {
        #[test]
        fn confirmed_ids_never_repeat_and_list_stays_sorted(ops in proptest::collection::vec(op(), 1..40)) {
            let mut store = store();
            for op in ops {
                match op {
                    Op::Push { id, outbound, body, at } => {
                        let (from, to) = if outbound { (ME, BOB) } else { (BOB, ME) };
                        let _ = store.insert_push(confirmed(id, from, to, &body.to_string(), t(at)), t(at));
                    }
                    Op::Optimistic { body, at } => {
                        let _ = store.insert_optimistic_at(BOB, body.to_string(), None, t(at));
                    }
                    Op::Seed { ids } => {
                        let page = ids.iter().map(|&id| confirmed(id, BOB, ME, "s", t(id))).collect();
                        store.seed_at(BOB, page, t(120));
                    }
                }
            }
            let messages = store.messages(BOB);
            let mut seen = HashSet::new();
            for m in messages {
                if let Some(id) = m.confirmed_id() {
                    prop_assert!(seen.insert(id), "duplicate id {id}");
                }
            }
            prop_assert!(messages.windows(2).all(|w| w[0].timestamp <= w[1].timestamp));
        }
    }
}

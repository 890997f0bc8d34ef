//! Conversation feed manager.
//!
//! Owns the message timeline for one DM conversation: loads history from the
//! [`DataStore`], subscribes to the conversation's push topic, and reconciles
//! optimistic sends against write acks and realtime echoes so the same
//! message never appears twice regardless of which confirmation arrives
//! first. A feed instance is bound to one conversation; switching peers
//! means closing this feed and opening a new one.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};

use thiserror::Error;
use tracing::{debug, info, warn};

use murmur_core::{
    ConversationKey, DataStore, EventStreamError, Identity, MessageRow, NewMessage, Profile,
    PushTransport, StoreError, SubscriptionSlot, TopicEvent, TopicEvents, TopicHandle,
};

mod records;

pub use records::{FeedMessage, RecordKey};
use records::Records;

#[derive(Debug, Error)]
pub enum FeedError {
    #[error("message content is empty")]
    EmptyMessage,

    #[error("feed is not open yet")]
    NotReady,

    #[error("feed is closed")]
    Closed,

    #[error("message write failed: {0}")]
    WriteFailed(StoreError),

    #[error("history load failed: {0}")]
    HistoryFailed(StoreError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeedState {
    /// Constructed but history not loaded yet.
    Loading,
    /// History served; sends accepted. The push subscription may or may not
    /// be live, see [`FeedManager::is_live`].
    Ready,
    Closed,
}

pub struct FeedManager<S: DataStore, T: PushTransport> {
    store: Arc<S>,
    transport: Arc<T>,
    me: Identity,
    peer_id: String,
    key: ConversationKey,
    state: Mutex<FeedState>,
    records: Mutex<Records>,
    /// Resolved sender display info, keyed by user id.
    profiles: Mutex<HashMap<String, Profile>>,
    slot: SubscriptionSlot<T::Topic>,
    events: Mutex<Option<TopicEvents>>,
    live: AtomicBool,
}

impl<S: DataStore, T: PushTransport> FeedManager<S, T> {
    pub fn new(store: Arc<S>, transport: Arc<T>, me: Identity, peer_id: &str) -> Self {
        let key = ConversationKey::new(&me.user_id, peer_id);
        Self {
            store,
            transport,
            me,
            peer_id: peer_id.to_string(),
            key,
            state: Mutex::new(FeedState::Loading),
            records: Mutex::new(Records::default()),
            profiles: Mutex::new(HashMap::new()),
            slot: SubscriptionSlot::new(),
            events: Mutex::new(None),
            live: AtomicBool::new(false),
        }
    }

    pub fn conversation(&self) -> &ConversationKey {
        &self.key
    }

    pub fn state(&self) -> FeedState {
        *self.state.lock().unwrap()
    }

    /// Whether the push subscription is delivering events. A feed that is
    /// `Ready` but not live serves history and accepts sends, it just will
    /// not see the peer's messages until reopened.
    pub fn is_live(&self) -> bool {
        self.live.load(Ordering::SeqCst)
    }

    /// Current timeline, in display order.
    pub fn messages(&self) -> Vec<FeedMessage> {
        self.records.lock().unwrap().snapshot()
    }

    /// Load history and subscribe to the conversation topic. Returns the
    /// initial timeline. A subscription failure does not fail the open: the
    /// feed degrades to fetch-only and says so in the log.
    pub async fn open(&self) -> Result<Vec<FeedMessage>, FeedError> {
        match self.state() {
            FeedState::Loading => {}
            FeedState::Ready => return Ok(self.messages()),
            FeedState::Closed => return Err(FeedError::Closed),
        }

        let history = self
            .store
            .fetch_history(&self.key)
            .await
            .map_err(FeedError::HistoryFailed)?;

        let peer = match self.store.fetch_profile(&self.peer_id).await {
            Ok(profile) => profile,
            Err(error) => {
                warn!(error = %error, peer = %self.peer_id, "peer profile lookup failed");
                Profile::unknown(&self.peer_id)
            }
        };

        let mut profiles = HashMap::new();
        profiles.insert(self.me.user_id.clone(), self.self_profile());
        profiles.insert(peer.user_id.clone(), peer);

        let mut records = Records::default();
        for row in &history {
            if !self.key.matches_row(row) {
                continue;
            }
            let sender = profiles
                .get(&row.sender_id)
                .cloned()
                .unwrap_or_else(|| Profile::unknown(&row.sender_id));
            records.insert_sorted(FeedMessage::confirmed(row, sender));
        }

        match self.transport.open_topic(&self.key.topic_name()).await {
            Ok(handle) => {
                // Take the event stream before install so nothing published
                // between subscribe and the first recv is missed.
                let events = handle.events();
                if let Some(displaced) = self.slot.install(handle) {
                    displaced.close().await;
                }
                *self.events.lock().unwrap() = Some(events);
                self.live.store(true, Ordering::SeqCst);
            }
            Err(error) => {
                warn!(
                    error = %error,
                    topic = %self.key.topic_name(),
                    "push subscription failed, feed is fetch-only"
                );
            }
        }

        let snapshot;
        let count;
        {
            let mut state = self.state.lock().unwrap();
            if *state == FeedState::Closed {
                return Err(FeedError::Closed);
            }
            *state = FeedState::Ready;
            let mut current = self.records.lock().unwrap();
            *current = records;
            *self.profiles.lock().unwrap() = profiles;
            count = current.len();
            snapshot = current.snapshot();
        }
        info!(
            topic = %self.key.topic_name(),
            count,
            live = self.is_live(),
            "feed opened"
        );
        Ok(snapshot)
    }

    /// Send a message to the peer. The content appears in the timeline
    /// immediately as a pending record and is reconciled once the write ack
    /// or the realtime echo arrives, whichever comes first. A rejected write
    /// removes the pending record again.
    pub async fn send(&self, text: &str) -> Result<(), FeedError> {
        let content = text.trim();
        if content.is_empty() {
            return Err(FeedError::EmptyMessage);
        }
        match self.state() {
            FeedState::Ready => {}
            FeedState::Loading => return Err(FeedError::NotReady),
            FeedState::Closed => return Err(FeedError::Closed),
        }

        let pending = FeedMessage::pending(&self.me.user_id, content, self.self_profile());
        let local_key = pending.key;
        self.records.lock().unwrap().insert_sorted(pending);

        let written = self
            .store
            .insert_message(NewMessage {
                sender_id: self.me.user_id.clone(),
                receiver_id: self.peer_id.clone(),
                content: content.to_string(),
            })
            .await;

        match written {
            Ok(row) => {
                self.reconcile_ack(local_key, &row);
                Ok(())
            }
            Err(error) => {
                self.records.lock().unwrap().remove(&local_key);
                warn!(error = %error, "message write rejected, pending record rolled back");
                Err(FeedError::WriteFailed(error))
            }
        }
    }

    /// Apply the write ack for an optimistic send. If the realtime echo got
    /// there first the pending record is already gone; the ack then only
    /// drops the leftover local key.
    fn reconcile_ack(&self, local_key: RecordKey, row: &MessageRow) {
        if self.state() == FeedState::Closed {
            return;
        }
        let sender = self.cached_profile(&row.sender_id);
        let mut records = self.records.lock().unwrap();
        if records.contains(&RecordKey::Confirmed(row.id)) {
            records.remove(&local_key);
            records.refresh_confirmed(row, sender);
            debug!(id = row.id, "echo beat the write ack");
        } else if !records.promote(local_key, row, sender) {
            debug!(id = row.id, "write ack for an untracked record");
        }
    }

    /// Apply one push event. Inserts for other conversations and presence
    /// events are not this feed's concern and are dropped.
    pub async fn handle_event(&self, event: &TopicEvent) {
        let TopicEvent::MessageInserted(row) = event else {
            return;
        };
        if self.state() == FeedState::Closed {
            return;
        }
        if !self.key.matches_row(row) {
            debug!(id = row.id, "insert is not for this conversation");
            return;
        }

        // Fast path under the lock: redelivery of a known row, or the echo
        // of an optimistic send still pending.
        {
            let sender = self.cached_profile(&row.sender_id);
            let mut records = self.records.lock().unwrap();
            if records.refresh_confirmed(row, sender.clone()) {
                return;
            }
            if row.sender_id == self.me.user_id {
                if let Some(pending) = records.find_pending_from(&row.sender_id, &row.content) {
                    records.promote(pending, row, sender);
                    debug!(id = row.id, "echo promoted pending record");
                    return;
                }
            }
        }

        // New row: resolve display info without holding the lock, then
        // re-check, since a duplicate delivery may have landed meanwhile.
        let sender = self.sender_profile(&row.sender_id).await;
        if self.state() == FeedState::Closed {
            return;
        }
        let mut records = self.records.lock().unwrap();
        if records.refresh_confirmed(row, sender.clone()) {
            return;
        }
        records.insert_sorted(FeedMessage::confirmed(row, sender));
    }

    /// Close the feed and release its subscription. Idempotent.
    pub async fn close(&self) {
        {
            let mut state = self.state.lock().unwrap();
            if *state == FeedState::Closed {
                return;
            }
            *state = FeedState::Closed;
        }
        self.events.lock().unwrap().take();
        self.live.store(false, Ordering::SeqCst);
        self.slot.close().await;
        info!(topic = %self.key.topic_name(), "feed closed");
    }

    /// Pump push events until the subscription ends. Spawn after `open`.
    pub async fn run(self: Arc<Self>) {
        let taken = self.events.lock().unwrap().take();
        let Some(mut events) = taken else {
            debug!(topic = %self.key.topic_name(), "feed has no live subscription to pump");
            return;
        };
        loop {
            match events.recv().await {
                Ok(event) => self.handle_event(&event).await,
                Err(EventStreamError::Closed) => {
                    debug!(topic = %self.key.topic_name(), "feed event stream ended");
                    self.live.store(false, Ordering::SeqCst);
                    return;
                }
                Err(EventStreamError::Lagged(count)) => {
                    warn!(count, topic = %self.key.topic_name(), "feed event stream lagged");
                }
            }
        }
    }

    fn self_profile(&self) -> Profile {
        Profile {
            user_id: self.me.user_id.clone(),
            username: self.me.username.clone(),
            avatar_ref: self.me.avatar_ref.clone(),
        }
    }

    fn cached_profile(&self, user_id: &str) -> Profile {
        self.profiles
            .lock()
            .unwrap()
            .get(user_id)
            .cloned()
            .unwrap_or_else(|| Profile::unknown(user_id))
    }

    /// Resolve a sender's display info, caching hits. Lookup failures fall
    /// back to a placeholder; the message still renders.
    async fn sender_profile(&self, user_id: &str) -> Profile {
        if let Some(profile) = self.profiles.lock().unwrap().get(user_id).cloned() {
            return profile;
        }
        match self.store.fetch_profile(user_id).await {
            Ok(profile) => {
                self.profiles
                    .lock()
                    .unwrap()
                    .insert(user_id.to_string(), profile.clone());
                profile
            }
            Err(error) => {
                debug!(error = %error, user_id, "sender profile lookup failed");
                Profile::unknown(user_id)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use assert_matches::assert_matches;
    use chrono::{TimeZone, Utc};
    use tracing_test::traced_test;

    use murmur_store::MemoryStore;
    use murmur_transport::MemoryTransport;

    fn identity(user_id: &str, username: &str) -> Identity {
        Identity {
            user_id: user_id.to_string(),
            username: username.to_string(),
            avatar_ref: None,
        }
    }

    fn profile(user_id: &str, username: &str) -> Profile {
        Profile {
            user_id: user_id.to_string(),
            username: username.to_string(),
            avatar_ref: None,
        }
    }

    fn seeded_store() -> MemoryStore {
        let store = MemoryStore::new();
        store.add_profile(profile("alice", "Alice"));
        store.add_profile(profile("bob", "Bob"));
        store
    }

    fn seed_row(store: &MemoryStore, id: i64, sender: &str, receiver: &str, secs: i64) {
        store.seed_message(MessageRow {
            id,
            sender_id: sender.to_string(),
            receiver_id: receiver.to_string(),
            channel_id: None,
            content: format!("msg-{id}"),
            created_at: Utc.timestamp_opt(secs, 0).unwrap(),
        });
    }

    fn feed_for_alice(
        store: &MemoryStore,
        transport: &MemoryTransport,
    ) -> Arc<FeedManager<MemoryStore, MemoryTransport>> {
        Arc::new(FeedManager::new(
            Arc::new(store.clone()),
            Arc::new(transport.clone()),
            identity("alice", "Alice"),
            "bob",
        ))
    }

    async fn wait_for<F: Fn() -> bool>(condition: F) {
        for _ in 0..200 {
            if condition() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("condition not reached in time");
    }

    #[tokio::test]
    async fn open_serves_ordered_history() {
        let store = seeded_store();
        seed_row(&store, 2, "bob", "alice", 200);
        seed_row(&store, 1, "alice", "bob", 100);
        let transport = MemoryTransport::new();
        let feed = feed_for_alice(&store, &transport);

        let initial = feed.open().await.unwrap();

        let ids: Vec<RecordKey> = initial.iter().map(|m| m.key).collect();
        assert_eq!(ids, vec![RecordKey::Confirmed(1), RecordKey::Confirmed(2)]);
        assert_eq!(initial[1].sender.username, "Bob");
        assert_eq!(feed.state(), FeedState::Ready);
        assert!(feed.is_live());
    }

    #[tokio::test]
    async fn send_before_open_is_not_ready() {
        let store = seeded_store();
        let transport = MemoryTransport::new();
        let feed = feed_for_alice(&store, &transport);

        assert_matches!(feed.send("hi").await, Err(FeedError::NotReady));
    }

    #[tokio::test]
    async fn blank_send_is_rejected_without_a_write() {
        let store = seeded_store();
        let transport = MemoryTransport::new();
        let feed = feed_for_alice(&store, &transport);
        feed.open().await.unwrap();

        assert_matches!(feed.send("   ").await, Err(FeedError::EmptyMessage));
        assert_eq!(store.message_count(), 0);
        assert!(feed.messages().is_empty());
    }

    #[tokio::test]
    async fn send_confirms_via_write_ack() {
        let store = seeded_store();
        let transport = MemoryTransport::new();
        let feed = feed_for_alice(&store, &transport);
        feed.open().await.unwrap();

        feed.send("  hello bob  ").await.unwrap();

        let messages = feed.messages();
        assert_eq!(messages.len(), 1);
        assert!(!messages[0].pending);
        assert_matches!(messages[0].key, RecordKey::Confirmed(_));
        // Content is persisted trimmed.
        assert_eq!(messages[0].content, "hello bob");
        assert_eq!(store.message_count(), 1);
    }

    #[tokio::test]
    async fn echo_after_ack_does_not_duplicate() {
        let store = seeded_store();
        let transport = MemoryTransport::new();
        let feed = feed_for_alice(&store, &transport);
        feed.open().await.unwrap();

        feed.send("hello").await.unwrap();
        let row = store
            .fetch_history(feed.conversation())
            .await
            .unwrap()
            .remove(0);
        feed.handle_event(&TopicEvent::MessageInserted(row)).await;

        assert_eq!(feed.messages().len(), 1);
    }

    #[tokio::test]
    async fn echo_before_ack_converges_to_one_record() {
        let store = seeded_store();
        let transport = MemoryTransport::new();
        {
            let transport = transport.clone();
            store.set_insert_hook(move |row| transport.publish_insert(row.clone()));
        }
        let feed = feed_for_alice(&store, &transport);
        feed.open().await.unwrap();
        tokio::spawn(feed.clone().run());

        // Hold the ack so the realtime echo is processed first.
        let gate = store.hold_next_insert();
        let sender = feed.clone();
        let in_flight = tokio::spawn(async move { sender.send("hello").await });

        wait_for(|| {
            let messages = feed.messages();
            messages.len() == 1 && !messages[0].pending
        })
        .await;

        gate.release();
        in_flight.await.unwrap().unwrap();

        let messages = feed.messages();
        assert_eq!(messages.len(), 1);
        assert_matches!(messages[0].key, RecordKey::Confirmed(_));
    }

    #[tokio::test]
    async fn rejected_write_rolls_back_the_pending_record() {
        let store = seeded_store();
        let transport = MemoryTransport::new();
        let feed = feed_for_alice(&store, &transport);
        feed.open().await.unwrap();
        store.fail_next_insert("constraint violation");

        let result = feed.send("doomed").await;

        assert_matches!(result, Err(FeedError::WriteFailed(StoreError::Rejected(_))));
        assert!(feed.messages().is_empty());
    }

    #[tokio::test]
    async fn inserts_for_other_conversations_are_dropped() {
        let store = seeded_store();
        let transport = MemoryTransport::new();
        let feed = feed_for_alice(&store, &transport);
        feed.open().await.unwrap();

        feed.handle_event(&TopicEvent::MessageInserted(MessageRow {
            id: 10,
            sender_id: "alice".to_string(),
            receiver_id: "carol".to_string(),
            channel_id: None,
            content: "for carol".to_string(),
            created_at: Utc::now(),
        }))
        .await;
        feed.handle_event(&TopicEvent::MessageInserted(MessageRow {
            id: 11,
            sender_id: "alice".to_string(),
            receiver_id: "bob".to_string(),
            channel_id: Some(3),
            content: "channel chatter".to_string(),
            created_at: Utc::now(),
        }))
        .await;

        assert!(feed.messages().is_empty());
    }

    #[tokio::test]
    async fn duplicate_delivery_is_idempotent() {
        let store = seeded_store();
        let transport = MemoryTransport::new();
        let feed = feed_for_alice(&store, &transport);
        feed.open().await.unwrap();

        let row = MessageRow {
            id: 42,
            sender_id: "bob".to_string(),
            receiver_id: "alice".to_string(),
            channel_id: None,
            content: "once".to_string(),
            created_at: Utc::now(),
        };
        feed.handle_event(&TopicEvent::MessageInserted(row.clone()))
            .await;
        feed.handle_event(&TopicEvent::MessageInserted(row)).await;

        assert_eq!(feed.messages().len(), 1);
    }

    #[tokio::test]
    async fn out_of_order_insert_lands_in_timestamp_order() {
        let store = seeded_store();
        seed_row(&store, 1, "alice", "bob", 100);
        seed_row(&store, 3, "bob", "alice", 300);
        let transport = MemoryTransport::new();
        let feed = feed_for_alice(&store, &transport);
        feed.open().await.unwrap();

        feed.handle_event(&TopicEvent::MessageInserted(MessageRow {
            id: 2,
            sender_id: "bob".to_string(),
            receiver_id: "alice".to_string(),
            channel_id: None,
            content: "delayed".to_string(),
            created_at: Utc.timestamp_opt(200, 0).unwrap(),
        }))
        .await;

        let ids: Vec<RecordKey> = feed.messages().iter().map(|m| m.key).collect();
        assert_eq!(
            ids,
            vec![
                RecordKey::Confirmed(1),
                RecordKey::Confirmed(2),
                RecordKey::Confirmed(3)
            ]
        );
    }

    #[tokio::test]
    async fn unknown_sender_renders_with_placeholder() {
        let store = MemoryStore::new();
        store.add_profile(profile("alice", "Alice"));
        // No profile for bob.
        let transport = MemoryTransport::new();
        let feed = feed_for_alice(&store, &transport);
        feed.open().await.unwrap();

        feed.handle_event(&TopicEvent::MessageInserted(MessageRow {
            id: 1,
            sender_id: "bob".to_string(),
            receiver_id: "alice".to_string(),
            channel_id: None,
            content: "hi".to_string(),
            created_at: Utc::now(),
        }))
        .await;

        let messages = feed.messages();
        assert_eq!(messages[0].sender.username, "Unknown");
    }

    #[tokio::test]
    #[traced_test]
    async fn subscription_failure_degrades_to_fetch_only() {
        let store = seeded_store();
        seed_row(&store, 1, "alice", "bob", 100);
        let transport = MemoryTransport::new();
        transport.fail_next_open();
        let feed = feed_for_alice(&store, &transport);

        let initial = feed.open().await.unwrap();

        assert_eq!(initial.len(), 1);
        assert_eq!(feed.state(), FeedState::Ready);
        assert!(!feed.is_live());
        assert!(logs_contain("feed is fetch-only"));

        // Sends still work without the subscription.
        feed.send("still here").await.unwrap();
        assert_eq!(feed.messages().len(), 2);
    }

    #[tokio::test]
    async fn close_releases_the_topic_and_is_idempotent() {
        let store = seeded_store();
        let transport = MemoryTransport::new();
        let feed = feed_for_alice(&store, &transport);
        feed.open().await.unwrap();
        let topic = feed.conversation().topic_name();
        assert_eq!(transport.open_handle_count(&topic), 1);

        feed.close().await;
        feed.close().await;

        assert_eq!(transport.open_handle_count(&topic), 0);
        assert_eq!(feed.state(), FeedState::Closed);
        assert_matches!(feed.send("late").await, Err(FeedError::Closed));
        assert_matches!(feed.open().await, Err(FeedError::Closed));
    }

    #[tokio::test]
    async fn run_delivers_peer_messages_end_to_end() {
        let store = seeded_store();
        let transport = MemoryTransport::new();
        {
            let transport = transport.clone();
            store.set_insert_hook(move |row| transport.publish_insert(row.clone()));
        }
        let feed = feed_for_alice(&store, &transport);
        feed.open().await.unwrap();
        tokio::spawn(feed.clone().run());

        // Bob writes through the store; the hook echoes it onto the topic.
        store
            .insert_message(NewMessage {
                sender_id: "bob".to_string(),
                receiver_id: "alice".to_string(),
                content: "hi alice".to_string(),
            })
            .await
            .unwrap();

        wait_for(|| feed.messages().len() == 1).await;
        let messages = feed.messages();
        assert_eq!(messages[0].content, "hi alice");
        assert_eq!(messages[0].sender.username, "Bob");
    }
}

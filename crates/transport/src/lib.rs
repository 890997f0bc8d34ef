//! In-memory push transport.
//!
//! Topics are fanned out over `tokio::sync::broadcast`, with a per-topic
//! presence membership map behind announce/withdraw. Every membership change
//! broadcasts the incremental Join/Leave event followed by an authoritative
//! Sync carrying the full announced set, which is what the managers reconcile
//! against. The hub also counts open handles per topic so tests can assert
//! the at-most-one-subscription invariant.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::{broadcast, watch};
use tracing::debug;

use murmur_core::{
    ConversationKey, MessageRow, PresencePayload, PushTransport, TopicEvent, TopicEvents,
    TopicHandle, TransportError,
};

const EVENT_CHANNEL_CAPACITY: usize = 256;

struct TopicState {
    name: String,
    events: broadcast::Sender<TopicEvent>,
    /// Announced identities, keyed by user id. BTreeMap keeps sync payloads
    /// deterministic.
    presence: Mutex<BTreeMap<String, PresencePayload>>,
    open_handles: AtomicUsize,
}

impl TopicState {
    fn broadcast(&self, event: TopicEvent) {
        // No receivers is fine; nobody is listening yet.
        let _ = self.events.send(event);
    }

    fn broadcast_sync(&self) {
        let user_ids = self.presence.lock().unwrap().keys().cloned().collect();
        self.broadcast(TopicEvent::PresenceSync { user_ids });
    }
}

struct Inner {
    topics: Mutex<HashMap<String, Arc<TopicState>>>,
    fail_next_open: AtomicBool,
}

/// In-memory transport hub. Clones share the same topics.
#[derive(Clone)]
pub struct MemoryTransport {
    inner: Arc<Inner>,
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                topics: Mutex::new(HashMap::new()),
                fail_next_open: AtomicBool::new(false),
            }),
        }
    }

    fn topic_state(&self, name: &str) -> Arc<TopicState> {
        let mut topics = self.inner.topics.lock().unwrap();
        topics
            .entry(name.to_string())
            .or_insert_with(|| {
                let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
                Arc::new(TopicState {
                    name: name.to_string(),
                    events,
                    presence: Mutex::new(BTreeMap::new()),
                    open_handles: AtomicUsize::new(0),
                })
            })
            .clone()
    }

    /// Number of currently open handles on the topic.
    pub fn open_handle_count(&self, name: &str) -> usize {
        self.inner
            .topics
            .lock()
            .unwrap()
            .get(name)
            .map(|state| state.open_handles.load(Ordering::SeqCst))
            .unwrap_or(0)
    }

    /// Identities currently announced on the topic.
    pub fn announced(&self, name: &str) -> Vec<String> {
        self.inner
            .topics
            .lock()
            .unwrap()
            .get(name)
            .map(|state| state.presence.lock().unwrap().keys().cloned().collect())
            .unwrap_or_default()
    }

    /// Make the next `open_topic` call fail, for degraded-path tests.
    pub fn fail_next_open(&self) {
        self.inner.fail_next_open.store(true, Ordering::SeqCst);
    }

    /// Deliver an arbitrary event on a topic.
    pub fn publish_to(&self, name: &str, event: TopicEvent) {
        self.topic_state(name).broadcast(event);
    }

    /// Server-side echo of a confirmed write: deliver the row on its
    /// conversation's topic.
    pub fn publish_insert(&self, row: MessageRow) {
        let topic = ConversationKey::new(&row.sender_id, &row.receiver_id).topic_name();
        self.publish_to(&topic, TopicEvent::MessageInserted(row));
    }
}

impl Default for MemoryTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl PushTransport for MemoryTransport {
    type Topic = MemoryTopic;

    async fn open_topic(&self, name: &str) -> Result<MemoryTopic, TransportError> {
        if self.inner.fail_next_open.swap(false, Ordering::SeqCst) {
            return Err(TransportError::OpenFailed {
                topic: name.to_string(),
                reason: "injected open failure".to_string(),
            });
        }

        let state = self.topic_state(name);
        state.open_handles.fetch_add(1, Ordering::SeqCst);
        let (closed_tx, _) = watch::channel(false);

        debug!(topic = name, "topic opened");
        Ok(MemoryTopic {
            state,
            closed_tx,
            announced: Mutex::new(None),
            released: AtomicBool::new(false),
        })
    }
}

/// One open subscription on a [`MemoryTransport`] topic.
///
/// Dropping the handle releases it the same way `close` does; this is the
/// abrupt-termination path, where orderly teardown never ran.
pub struct MemoryTopic {
    state: Arc<TopicState>,
    closed_tx: watch::Sender<bool>,
    announced: Mutex<Option<String>>,
    released: AtomicBool,
}

impl MemoryTopic {
    fn release(&self) {
        if self.released.swap(true, Ordering::SeqCst) {
            return;
        }

        self.withdraw_sync();
        let _ = self.closed_tx.send(true);
        self.state.open_handles.fetch_sub(1, Ordering::SeqCst);
        debug!(topic = %self.state.name, "topic released");
    }

    fn withdraw_sync(&self) {
        let Some(user_id) = self.announced.lock().unwrap().take() else {
            return;
        };
        let removed = self.state.presence.lock().unwrap().remove(&user_id);
        if let Some(payload) = removed {
            self.state.broadcast(TopicEvent::PresenceLeave {
                left: vec![payload],
            });
            self.state.broadcast_sync();
        }
    }
}

impl TopicHandle for MemoryTopic {
    fn topic(&self) -> &str {
        &self.state.name
    }

    fn events(&self) -> TopicEvents {
        TopicEvents::new(self.state.events.subscribe(), self.closed_tx.subscribe())
    }

    async fn announce(&self, payload: PresencePayload) -> Result<(), TransportError> {
        if self.released.load(Ordering::SeqCst) {
            return Err(TransportError::TopicClosed(self.state.name.clone()));
        }

        let user_id = payload.user_id.clone();
        self.state
            .presence
            .lock()
            .unwrap()
            .insert(user_id.clone(), payload.clone());
        *self.announced.lock().unwrap() = Some(user_id);

        self.state.broadcast(TopicEvent::PresenceJoin {
            joined: vec![payload],
        });
        self.state.broadcast_sync();
        Ok(())
    }

    async fn withdraw(&self) -> Result<(), TransportError> {
        self.withdraw_sync();
        Ok(())
    }

    async fn close(&self) {
        self.release();
    }
}

impl Drop for MemoryTopic {
    fn drop(&mut self) {
        self.release();
    }
}

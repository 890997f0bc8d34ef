//! In-memory [`DataStore`] implementation.
//!
//! Stands in for the external persistence service: assigns server-side ids
//! and timestamps on insert, serves pair-filtered DM history, and exposes a
//! user directory. An insert hook lets tests and embedders wire confirmed
//! writes into a push transport, reproducing the server's realtime echo.
//! One-shot failure injection covers the write-failure paths.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use tokio::sync::oneshot;
use tracing::debug;

use murmur_core::{ConversationKey, DataStore, MessageRow, NewMessage, Profile, StoreError};

type InsertHook = Box<dyn Fn(&MessageRow) + Send + Sync>;

struct Inner {
    profiles: Mutex<Vec<Profile>>,
    messages: Mutex<Vec<MessageRow>>,
    next_id: AtomicI64,
    fail_next_insert: Mutex<Option<String>>,
    fail_next_directory: Mutex<Option<String>>,
    insert_hook: Mutex<Option<InsertHook>>,
    insert_gate: Mutex<Option<oneshot::Receiver<()>>>,
}

/// Releases an insert held by [`MemoryStore::hold_next_insert`].
pub struct InsertRelease {
    sender: oneshot::Sender<()>,
}

impl InsertRelease {
    pub fn release(self) {
        let _ = self.sender.send(());
    }
}

/// In-memory store. Clones share the same data.
#[derive(Clone)]
pub struct MemoryStore {
    inner: Arc<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                profiles: Mutex::new(Vec::new()),
                messages: Mutex::new(Vec::new()),
                next_id: AtomicI64::new(1),
                fail_next_insert: Mutex::new(None),
                fail_next_directory: Mutex::new(None),
                insert_hook: Mutex::new(None),
                insert_gate: Mutex::new(None),
            }),
        }
    }

    pub fn add_profile(&self, profile: Profile) {
        self.inner.profiles.lock().unwrap().push(profile);
    }

    /// Seed a confirmed row directly, bypassing timestamp assignment and
    /// the insert hook. For history fixtures. The id cursor advances past
    /// the seeded id so later inserts never reuse it.
    pub fn seed_message(&self, row: MessageRow) {
        self.inner.next_id.fetch_max(row.id + 1, Ordering::SeqCst);
        self.inner.messages.lock().unwrap().push(row);
    }

    /// Reject the next `insert_message` call with the given reason.
    pub fn fail_next_insert(&self, reason: &str) {
        *self.inner.fail_next_insert.lock().unwrap() = Some(reason.to_string());
    }

    /// Reject the next `fetch_directory` call with the given reason.
    pub fn fail_next_directory(&self, reason: &str) {
        *self.inner.fail_next_directory.lock().unwrap() = Some(reason.to_string());
    }

    /// Run the given hook after every successful insert. Used to echo
    /// confirmed writes into a push transport.
    pub fn set_insert_hook(&self, hook: impl Fn(&MessageRow) + Send + Sync + 'static) {
        *self.inner.insert_hook.lock().unwrap() = Some(Box::new(hook));
    }

    /// Delay the next insert's acknowledgement until the returned gate is
    /// released. The row is persisted and echoed through the insert hook
    /// first, so tests can deliver the realtime echo before the write ack.
    pub fn hold_next_insert(&self) -> InsertRelease {
        let (sender, receiver) = oneshot::channel();
        *self.inner.insert_gate.lock().unwrap() = Some(receiver);
        InsertRelease { sender }
    }

    pub fn message_count(&self) -> usize {
        self.inner.messages.lock().unwrap().len()
    }

    fn assign_created_at(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl DataStore for MemoryStore {
    async fn fetch_history(&self, key: &ConversationKey) -> Result<Vec<MessageRow>, StoreError> {
        let mut rows: Vec<MessageRow> = self
            .inner
            .messages
            .lock()
            .unwrap()
            .iter()
            .filter(|row| key.matches_row(row))
            .cloned()
            .collect();
        rows.sort_by_key(|row| row.created_at);
        debug!(topic = %key.topic_name(), count = rows.len(), "history fetched");
        Ok(rows)
    }

    async fn insert_message(&self, message: NewMessage) -> Result<MessageRow, StoreError> {
        if let Some(reason) = self.inner.fail_next_insert.lock().unwrap().take() {
            return Err(StoreError::Rejected(reason));
        }

        let row = MessageRow {
            id: self.inner.next_id.fetch_add(1, Ordering::SeqCst),
            sender_id: message.sender_id,
            receiver_id: message.receiver_id,
            channel_id: None,
            content: message.content,
            created_at: self.assign_created_at(),
        };
        self.inner.messages.lock().unwrap().push(row.clone());

        if let Some(hook) = self.inner.insert_hook.lock().unwrap().as_ref() {
            hook(&row);
        }

        let gate = self.inner.insert_gate.lock().unwrap().take();
        if let Some(gate) = gate {
            let _ = gate.await;
        }
        Ok(row)
    }

    async fn fetch_directory(&self, exclude_user_id: &str) -> Result<Vec<Profile>, StoreError> {
        if let Some(reason) = self.inner.fail_next_directory.lock().unwrap().take() {
            return Err(StoreError::QueryFailed(reason));
        }

        let mut profiles: Vec<Profile> = self
            .inner
            .profiles
            .lock()
            .unwrap()
            .iter()
            .filter(|profile| profile.user_id != exclude_user_id)
            .cloned()
            .collect();
        profiles.sort_by(|a, b| a.username.cmp(&b.username));
        Ok(profiles)
    }

    async fn fetch_profile(&self, user_id: &str) -> Result<Profile, StoreError> {
        self.inner
            .profiles
            .lock()
            .unwrap()
            .iter()
            .find(|profile| profile.user_id == user_id)
            .cloned()
            .ok_or_else(|| StoreError::ProfileNotFound(user_id.to_string()))
    }
}

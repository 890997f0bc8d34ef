//! Keyed, ordered record storage for one conversation feed.
//!
//! Every record is addressable by a stable key: confirmed rows by their
//! server id, optimistic sends by a local uuid. The display order is kept
//! sorted by `created_at`, except that promoting a pending record keeps its
//! position so an acked message does not jump around on screen.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use uuid::Uuid;

use murmur_core::{MessageRow, Profile};

/// Stable identity of a feed record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RecordKey {
    /// Server-assigned row id.
    Confirmed(i64),
    /// Locally generated id for an optimistic send awaiting its ack.
    Pending(Uuid),
}

/// One rendered message in the feed, with resolved sender display info.
#[derive(Debug, Clone)]
pub struct FeedMessage {
    pub key: RecordKey,
    pub sender_id: String,
    pub content: String,
    pub created_at: DateTime<Utc>,
    pub pending: bool,
    pub sender: Profile,
}

impl FeedMessage {
    pub fn confirmed(row: &MessageRow, sender: Profile) -> Self {
        Self {
            key: RecordKey::Confirmed(row.id),
            sender_id: row.sender_id.clone(),
            content: row.content.clone(),
            created_at: row.created_at,
            pending: false,
            sender,
        }
    }

    pub fn pending(sender_id: &str, content: &str, sender: Profile) -> Self {
        Self {
            key: RecordKey::Pending(Uuid::new_v4()),
            sender_id: sender_id.to_string(),
            content: content.to_string(),
            created_at: Utc::now(),
            pending: true,
            sender,
        }
    }
}

#[derive(Default)]
pub(crate) struct Records {
    order: Vec<RecordKey>,
    by_key: HashMap<RecordKey, FeedMessage>,
}

impl Records {
    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn contains(&self, key: &RecordKey) -> bool {
        self.by_key.contains_key(key)
    }

    pub fn snapshot(&self) -> Vec<FeedMessage> {
        self.order
            .iter()
            .filter_map(|key| self.by_key.get(key))
            .cloned()
            .collect()
    }

    /// Insert in timestamp order. Equal timestamps keep arrival order.
    pub fn insert_sorted(&mut self, message: FeedMessage) {
        let at = self.order.partition_point(|key| {
            self.by_key
                .get(key)
                .is_some_and(|existing| existing.created_at <= message.created_at)
        });
        self.order.insert(at, message.key);
        self.by_key.insert(message.key, message);
    }

    pub fn remove(&mut self, key: &RecordKey) -> Option<FeedMessage> {
        let message = self.by_key.remove(key)?;
        self.order.retain(|existing| existing != key);
        Some(message)
    }

    /// Re-apply a confirmed row over an existing record with the same id.
    /// Returns false if the id is not tracked.
    pub fn refresh_confirmed(&mut self, row: &MessageRow, sender: Profile) -> bool {
        let key = RecordKey::Confirmed(row.id);
        match self.by_key.get_mut(&key) {
            Some(existing) => {
                *existing = FeedMessage::confirmed(row, sender);
                true
            }
            None => false,
        }
    }

    /// Promote a pending record to its confirmed row, in place: the record
    /// keeps its display position and only its key and fields change.
    /// Returns false if the pending key is not tracked.
    pub fn promote(&mut self, pending: RecordKey, row: &MessageRow, sender: Profile) -> bool {
        if self.by_key.remove(&pending).is_none() {
            return false;
        }
        let confirmed = FeedMessage::confirmed(row, sender);
        for slot in &mut self.order {
            if *slot == pending {
                *slot = confirmed.key;
                break;
            }
        }
        self.by_key.insert(confirmed.key, confirmed);
        true
    }

    /// Oldest pending record from the given sender with matching content.
    /// Used to match a realtime echo that arrives before the write ack.
    pub fn find_pending_from(&self, sender_id: &str, content: &str) -> Option<RecordKey> {
        self.order.iter().copied().find(|key| {
            self.by_key.get(key).is_some_and(|message| {
                message.pending && message.sender_id == sender_id && message.content == content
            })
        })
    }
}

use crate::message::MessageRow;

/// Identifies a DM conversation by its unordered participant pair.
///
/// The pair is stored sorted so that both participants derive the same key
/// and therefore the same topic name, regardless of who opened the chat.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ConversationKey {
    lo: String,
    hi: String,
}

impl ConversationKey {
    pub fn new(user: &str, peer: &str) -> Self {
        if user <= peer {
            Self {
                lo: user.to_string(),
                hi: peer.to_string(),
            }
        } else {
            Self {
                lo: peer.to_string(),
                hi: user.to_string(),
            }
        }
    }

    /// Deterministic push-topic name for this conversation.
    pub fn topic_name(&self) -> String {
        format!("dm_{}_{}", self.lo, self.hi)
    }

    pub fn participants(&self) -> (&str, &str) {
        (&self.lo, &self.hi)
    }

    pub fn involves(&self, user_id: &str) -> bool {
        self.lo == user_id || self.hi == user_id
    }

    /// Relevance filter: does this row belong to exactly this DM pair?
    ///
    /// Channel rows (`channel_id` set) never match, whatever their pair.
    pub fn matches_row(&self, row: &MessageRow) -> bool {
        if row.channel_id.is_some() {
            return false;
        }
        (row.sender_id == self.lo && row.receiver_id == self.hi)
            || (row.sender_id == self.hi && row.receiver_id == self.lo)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn row(sender: &str, receiver: &str, channel_id: Option<i64>) -> MessageRow {
        MessageRow {
            id: 1,
            sender_id: sender.to_string(),
            receiver_id: receiver.to_string(),
            channel_id,
            content: "hi".to_string(),
            created_at: Utc::now(),
        }
    }

    #[test]
    fn key_is_order_independent() {
        let a = ConversationKey::new("alice", "bob");
        let b = ConversationKey::new("bob", "alice");
        assert_eq!(a, b);
        assert_eq!(a.topic_name(), b.topic_name());
        assert_eq!(a.topic_name(), "dm_alice_bob");
    }

    #[test]
    fn matches_both_directions() {
        let key = ConversationKey::new("alice", "bob");
        assert!(key.matches_row(&row("alice", "bob", None)));
        assert!(key.matches_row(&row("bob", "alice", None)));
    }

    #[test]
    fn rejects_other_pairs() {
        let key = ConversationKey::new("alice", "bob");
        assert!(!key.matches_row(&row("alice", "carol", None)));
        assert!(!key.matches_row(&row("carol", "bob", None)));
    }

    #[test]
    fn rejects_channel_rows() {
        let key = ConversationKey::new("alice", "bob");
        assert!(!key.matches_row(&row("alice", "bob", Some(9))));
    }

    #[test]
    fn involves_both_participants() {
        let key = ConversationKey::new("bob", "alice");
        assert!(key.involves("alice"));
        assert!(key.involves("bob"));
        assert!(!key.involves("carol"));
    }
}

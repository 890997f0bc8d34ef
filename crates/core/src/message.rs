use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A server-confirmed message row as delivered by the store and the push
/// transport. Field names match the backing `messages` table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageRow {
    /// Server-assigned id, stable once confirmed.
    pub id: i64,

    pub sender_id: String,

    pub receiver_id: String,

    /// Discriminant: `Some` marks a channel row. DM rows always carry `None`
    /// and anything else must be filtered out of a DM feed.
    #[serde(default)]
    pub channel_id: Option<i64>,

    pub content: String,

    /// Server-assigned creation timestamp (UTC).
    pub created_at: DateTime<Utc>,
}

/// A write request for a new DM message. The server assigns id and timestamp.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewMessage {
    pub sender_id: String,
    pub receiver_id: String,
    pub content: String,
}

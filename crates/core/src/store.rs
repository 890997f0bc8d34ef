use std::future::Future;

use serde::{Deserialize, Serialize};

use crate::conversation::ConversationKey;
use crate::error::StoreError;
use crate::message::{MessageRow, NewMessage};

/// Display metadata for a known user.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Profile {
    pub user_id: String,
    pub username: String,
    pub avatar_ref: Option<String>,
}

impl Profile {
    /// Placeholder identity used when a sender lookup fails. The message
    /// still renders, just without real display info.
    pub fn unknown(user_id: &str) -> Self {
        Self {
            user_id: user_id.to_string(),
            username: "Unknown".to_string(),
            avatar_ref: None,
        }
    }
}

/// The persisted store boundary. Implementations proxy the external backend;
/// the crate ships an in-memory one for tests and embedding.
pub trait DataStore: Send + Sync + 'static {
    /// Full DM history for the given pair, ordered by `created_at`
    /// ascending, excluding channel rows.
    fn fetch_history(
        &self,
        key: &ConversationKey,
    ) -> impl Future<Output = Result<Vec<MessageRow>, StoreError>> + Send;

    /// Persist a new message; the server assigns id and timestamp.
    fn insert_message(
        &self,
        message: NewMessage,
    ) -> impl Future<Output = Result<MessageRow, StoreError>> + Send;

    /// Every known user except the given one.
    fn fetch_directory(
        &self,
        exclude_user_id: &str,
    ) -> impl Future<Output = Result<Vec<Profile>, StoreError>> + Send;

    fn fetch_profile(
        &self,
        user_id: &str,
    ) -> impl Future<Output = Result<Profile, StoreError>> + Send;
}

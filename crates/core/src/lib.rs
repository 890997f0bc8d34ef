//! Shared contracts for the murmur chat core.
//!
//! This crate defines the data model (messages, conversations, identities),
//! the trait boundaries behind which the external backend lives
//! ([`store::DataStore`], [`topic::PushTransport`]), the topic event stream,
//! and the subscription lifecycle guard both managers rely on.

pub mod config;
pub mod conversation;
pub mod error;
pub mod message;
pub mod session;
pub mod store;
pub mod subscription;
pub mod topic;

pub use config::ChatConfig;
pub use conversation::ConversationKey;
pub use error::{EventStreamError, StoreError, TransportError};
pub use message::{MessageRow, NewMessage};
pub use session::{Identity, SessionEvent, SessionEvents, SessionHub};
pub use store::{DataStore, Profile};
pub use subscription::{SubscriptionSlot, backoff_delay, open_with_retry};
pub use topic::{PresencePayload, PushTransport, TopicEvent, TopicEvents, TopicHandle};

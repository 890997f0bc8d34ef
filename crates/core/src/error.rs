/// Errors raised by a push transport.
#[derive(Debug, Clone, thiserror::Error)]
pub enum TransportError {
    #[error("failed to open topic {topic}: {reason}")]
    OpenFailed { topic: String, reason: String },

    #[error("topic {0} is closed")]
    TopicClosed(String),

    #[error("presence announce rejected: {0}")]
    AnnounceFailed(String),
}

/// Errors raised by the persisted store.
#[derive(Debug, Clone, thiserror::Error)]
pub enum StoreError {
    #[error("write rejected: {0}")]
    Rejected(String),

    #[error("store unavailable: {0}")]
    Unavailable(String),

    #[error("query failed: {0}")]
    QueryFailed(String),

    #[error("no profile for user {0}")]
    ProfileNotFound(String),
}

/// Errors yielded by an event stream receiver.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EventStreamError {
    #[error("event stream closed")]
    Closed,

    #[error("event stream lagged, {0} events dropped")]
    Lagged(u64),
}

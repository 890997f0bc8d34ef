use std::future::Future;

use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, watch};

use crate::error::{EventStreamError, TransportError};
use crate::message::MessageRow;

/// Display metadata announced on a presence topic.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PresencePayload {
    pub user_id: String,
    pub username: String,
    pub avatar_ref: Option<String>,
}

/// An event delivered on a push topic.
///
/// Message topics deliver `MessageInserted`; presence topics deliver the
/// sync/join/leave family. Within one topic, events arrive in the order the
/// server accepted the underlying writes.
#[derive(Debug, Clone)]
pub enum TopicEvent {
    MessageInserted(MessageRow),

    /// Authoritative set of currently-announced identities. Overrides any
    /// prior incremental state.
    PresenceSync { user_ids: Vec<String> },

    /// Incremental: the given identities just announced themselves.
    PresenceJoin { joined: Vec<PresencePayload> },

    /// Incremental: the given identities withdrew or disconnected.
    PresenceLeave { left: Vec<PresencePayload> },
}

/// A push/events transport. Opens named topics for server-originated events.
pub trait PushTransport: Send + Sync + 'static {
    type Topic: TopicHandle;

    fn open_topic(
        &self,
        name: &str,
    ) -> impl Future<Output = Result<Self::Topic, TransportError>> + Send;
}

/// One open push-channel subscription.
///
/// Owned by exactly one manager at a time. `close` is idempotent; dropping
/// the handle must perform the same release best-effort, since normal
/// teardown does not run on abrupt termination.
pub trait TopicHandle: Send + Sync + 'static {
    fn topic(&self) -> &str;

    /// Event stream for this subscription. Yields `Closed` once the handle
    /// is closed or dropped.
    fn events(&self) -> TopicEvents;

    /// Announce an identity as present on this topic.
    fn announce(
        &self,
        payload: PresencePayload,
    ) -> impl Future<Output = Result<(), TransportError>> + Send;

    /// Withdraw a previous announcement. A no-op when nothing is announced.
    fn withdraw(&self) -> impl Future<Output = Result<(), TransportError>> + Send;

    fn close(&self) -> impl Future<Output = ()> + Send;
}

/// Receiver half of a topic subscription.
pub struct TopicEvents {
    events: broadcast::Receiver<TopicEvent>,
    closed: watch::Receiver<bool>,
}

impl TopicEvents {
    pub fn new(events: broadcast::Receiver<TopicEvent>, closed: watch::Receiver<bool>) -> Self {
        Self { events, closed }
    }

    pub async fn recv(&mut self) -> Result<TopicEvent, EventStreamError> {
        loop {
            if *self.closed.borrow() {
                return Err(EventStreamError::Closed);
            }

            tokio::select! {
                changed = self.closed.changed() => {
                    if changed.is_err() || *self.closed.borrow() {
                        return Err(EventStreamError::Closed);
                    }
                }
                received = self.events.recv() => {
                    return match received {
                        Ok(event) => Ok(event),
                        Err(broadcast::error::RecvError::Closed) => Err(EventStreamError::Closed),
                        Err(broadcast::error::RecvError::Lagged(count)) => {
                            Err(EventStreamError::Lagged(count))
                        }
                    };
                }
            }
        }
    }
}

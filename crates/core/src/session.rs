use std::sync::RwLock;

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::debug;

use crate::error::EventStreamError;

/// The identity of the currently signed-in user.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Identity {
    pub user_id: String,
    pub username: String,
    pub avatar_ref: Option<String>,
}

#[derive(Debug, Clone)]
pub enum SessionEvent {
    SignedIn(Identity),
    SignedOut,
}

/// Session boundary for the identity provider.
///
/// Emits exactly one event per sign-in/sign-out transition so consumers can
/// run their start/stop lifecycle once per transition. Re-asserting the same
/// identity is not a transition and emits nothing.
pub struct SessionHub {
    sender: broadcast::Sender<SessionEvent>,
    current: RwLock<Option<Identity>>,
}

impl SessionHub {
    const CHANNEL_CAPACITY: usize = 16;

    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(Self::CHANNEL_CAPACITY);
        Self {
            sender,
            current: RwLock::new(None),
        }
    }

    pub fn current(&self) -> Option<Identity> {
        self.current.read().unwrap().clone()
    }

    pub fn subscribe(&self) -> SessionEvents {
        SessionEvents {
            receiver: self.sender.subscribe(),
        }
    }

    pub fn sign_in(&self, identity: Identity) {
        {
            let mut current = self.current.write().unwrap();
            if current.as_ref() == Some(&identity) {
                debug!(user_id = %identity.user_id, "sign_in with unchanged identity, no transition");
                return;
            }
            *current = Some(identity.clone());
        }
        let _ = self.sender.send(SessionEvent::SignedIn(identity));
    }

    pub fn sign_out(&self) {
        {
            let mut current = self.current.write().unwrap();
            if current.is_none() {
                return;
            }
            *current = None;
        }
        let _ = self.sender.send(SessionEvent::SignedOut);
    }
}

impl Default for SessionHub {
    fn default() -> Self {
        Self::new()
    }
}

/// Receiver for session transitions.
pub struct SessionEvents {
    receiver: broadcast::Receiver<SessionEvent>,
}

impl SessionEvents {
    pub async fn recv(&mut self) -> Result<SessionEvent, EventStreamError> {
        match self.receiver.recv().await {
            Ok(event) => Ok(event),
            Err(broadcast::error::RecvError::Closed) => Err(EventStreamError::Closed),
            Err(broadcast::error::RecvError::Lagged(count)) => Err(EventStreamError::Lagged(count)),
        }
    }
}

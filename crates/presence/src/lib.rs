//! Presence roster manager.
//!
//! Tracks which known users are currently online. On sign-in it loads the
//! user directory (everyone starts offline), subscribes to the shared
//! presence topic, and announces the local identity; sync events then
//! override any incremental join/leave state. One manager owns at most one
//! presence subscription for the whole session, however often the UI around
//! it remounts.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use thiserror::Error;
use tracing::{debug, info, warn};

use murmur_core::{
    ChatConfig, DataStore, EventStreamError, Identity, PresencePayload, Profile, PushTransport,
    SessionEvent, SessionEvents, SubscriptionSlot, TopicEvent, TopicEvents, TopicHandle,
    open_with_retry,
};

#[derive(Debug, Error)]
pub enum RosterError {
    #[error("directory load failed: {0}")]
    Directory(murmur_core::StoreError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PresenceStatus {
    Online,
    Offline,
}

/// One directory user with their current presence.
#[derive(Debug, Clone, PartialEq)]
pub struct RosterEntry {
    pub profile: Profile,
    pub status: PresenceStatus,
}

pub struct RosterManager<S: DataStore, T: PushTransport> {
    store: Arc<S>,
    transport: Arc<T>,
    config: ChatConfig,
    /// Directory order (by username) is decided by the store.
    directory: RwLock<Vec<Profile>>,
    online: RwLock<HashSet<String>>,
    identity: Mutex<Option<Identity>>,
    slot: SubscriptionSlot<T::Topic>,
    events: Mutex<Option<TopicEvents>>,
    live: AtomicBool,
}

impl<S: DataStore, T: PushTransport> RosterManager<S, T> {
    pub fn new(store: Arc<S>, transport: Arc<T>, config: ChatConfig) -> Self {
        Self {
            store,
            transport,
            config,
            directory: RwLock::new(Vec::new()),
            online: RwLock::new(HashSet::new()),
            identity: Mutex::new(None),
            slot: SubscriptionSlot::new(),
            events: Mutex::new(None),
            live: AtomicBool::new(false),
        }
    }

    /// Whether the presence subscription is delivering events. A roster that
    /// is started but not live still serves the directory, all offline.
    pub fn is_live(&self) -> bool {
        self.live.load(Ordering::SeqCst)
    }

    pub fn identity(&self) -> Option<Identity> {
        self.identity.lock().unwrap().clone()
    }

    /// Directory snapshot with presence applied. The signed-in user is not
    /// listed; announced ids outside the directory are not shown either.
    pub fn roster(&self) -> Vec<RosterEntry> {
        let online = self.online.read().unwrap();
        self.directory
            .read()
            .unwrap()
            .iter()
            .map(|profile| RosterEntry {
                status: if online.contains(&profile.user_id) {
                    PresenceStatus::Online
                } else {
                    PresenceStatus::Offline
                },
                profile: profile.clone(),
            })
            .collect()
    }

    pub fn online_user_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.online.read().unwrap().iter().cloned().collect();
        ids.sort();
        ids
    }

    /// Bring the roster up for the given identity: close any previous
    /// subscription, load the directory, then subscribe and announce.
    ///
    /// A directory failure fails the start. A subscription failure does not:
    /// the roster degrades to the directory with everyone offline.
    pub async fn start(&self, identity: Identity) -> Result<(), RosterError> {
        self.stop().await;

        let directory = self
            .store
            .fetch_directory(&identity.user_id)
            .await
            .map_err(RosterError::Directory)?;
        *self.directory.write().unwrap() = directory;
        self.online.write().unwrap().clear();

        let opened = open_with_retry(
            self.transport.as_ref(),
            &self.config.presence_topic,
            self.config.open_attempts,
            self.config.backoff_initial(),
            self.config.backoff_max(),
        )
        .await;

        match opened {
            Ok(handle) => {
                // Subscribe to events before announcing so the sync that
                // answers our own announcement is not missed.
                let events = handle.events();
                if let Err(error) = handle
                    .announce(PresencePayload {
                        user_id: identity.user_id.clone(),
                        username: identity.username.clone(),
                        avatar_ref: identity.avatar_ref.clone(),
                    })
                    .await
                {
                    warn!(error = %error, "presence announce failed");
                }
                if let Some(displaced) = self.slot.install(handle) {
                    displaced.close().await;
                }
                *self.events.lock().unwrap() = Some(events);
                self.live.store(true, Ordering::SeqCst);
            }
            Err(error) => {
                warn!(
                    error = %error,
                    topic = %self.config.presence_topic,
                    "presence degraded, roster shows everyone offline"
                );
            }
        }

        info!(
            user_id = %identity.user_id,
            directory = self.directory.read().unwrap().len(),
            live = self.is_live(),
            "roster started"
        );
        *self.identity.lock().unwrap() = Some(identity);
        Ok(())
    }

    /// Withdraw the announcement and release the subscription. Idempotent,
    /// and safe to call when never started. The last roster stays readable.
    pub async fn stop(&self) {
        let previous = self.identity.lock().unwrap().take();
        self.events.lock().unwrap().take();
        self.live.store(false, Ordering::SeqCst);
        if self.slot.close().await {
            if let Some(identity) = previous {
                info!(user_id = %identity.user_id, "roster stopped");
            }
        }
    }

    /// Replace the online set with the authoritative membership. Overrides
    /// any prior incremental state.
    pub fn apply_sync(&self, user_ids: &[String]) {
        let mut online = self.online.write().unwrap();
        online.clear();
        online.extend(user_ids.iter().cloned());
    }

    /// Mark the given identities online.
    pub fn apply_join(&self, joined: &[PresencePayload]) {
        let mut online = self.online.write().unwrap();
        for payload in joined {
            online.insert(payload.user_id.clone());
        }
    }

    /// Mark the given identities offline.
    pub fn apply_leave(&self, left: &[PresencePayload]) {
        let mut online = self.online.write().unwrap();
        for payload in left {
            online.remove(&payload.user_id);
        }
    }

    /// Apply one presence event.
    pub fn handle_event(&self, event: &TopicEvent) {
        match event {
            TopicEvent::PresenceSync { user_ids } => self.apply_sync(user_ids),
            TopicEvent::PresenceJoin { joined } => self.apply_join(joined),
            TopicEvent::PresenceLeave { left } => self.apply_leave(left),
            TopicEvent::MessageInserted(row) => {
                debug!(id = row.id, "message event on the presence topic, dropped");
            }
        }
    }

    fn take_events(&self) -> Option<TopicEvents> {
        self.events.lock().unwrap().take()
    }

    /// Pump presence events until the subscription ends. Spawn after `start`.
    pub async fn run(self: Arc<Self>) {
        let Some(mut events) = self.take_events() else {
            debug!("roster has no live subscription to pump");
            return;
        };
        loop {
            match events.recv().await {
                Ok(event) => self.handle_event(&event),
                Err(EventStreamError::Closed) => {
                    debug!("presence event stream ended");
                    self.live.store(false, Ordering::SeqCst);
                    return;
                }
                Err(EventStreamError::Lagged(count)) => {
                    warn!(count, "presence event stream lagged");
                }
            }
        }
    }

    /// Follow session transitions: start on sign-in, stop on sign-out, and
    /// pump presence events in between. Runs until the session hub goes away.
    pub async fn drive_session(self: Arc<Self>, mut sessions: SessionEvents) {
        let mut topic_events: Option<TopicEvents> = None;
        loop {
            tokio::select! {
                session = sessions.recv() => match session {
                    Ok(SessionEvent::SignedIn(identity)) => {
                        if let Err(error) = self.start(identity).await {
                            warn!(error = %error, "roster start failed");
                            topic_events = None;
                            continue;
                        }
                        topic_events = self.take_events();
                    }
                    Ok(SessionEvent::SignedOut) => {
                        self.stop().await;
                        topic_events = None;
                    }
                    Err(EventStreamError::Lagged(count)) => {
                        warn!(count, "session event stream lagged");
                    }
                    Err(EventStreamError::Closed) => {
                        self.stop().await;
                        return;
                    }
                },
                event = Self::recv_presence(&mut topic_events) => match event {
                    Ok(event) => self.handle_event(&event),
                    Err(EventStreamError::Closed) => {
                        self.live.store(false, Ordering::SeqCst);
                        topic_events = None;
                    }
                    Err(EventStreamError::Lagged(count)) => {
                        warn!(count, "presence event stream lagged");
                    }
                },
            }
        }
    }

    async fn recv_presence(
        events: &mut Option<TopicEvents>,
    ) -> Result<TopicEvent, EventStreamError> {
        match events {
            Some(stream) => stream.recv().await,
            None => std::future::pending().await,
        }
    }
}

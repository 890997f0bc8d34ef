use std::sync::Mutex;
use std::time::Duration;

use tracing::{debug, warn};

use crate::error::TransportError;
use crate::topic::{PushTransport, TopicHandle};

/// Holds the single live subscription handle a manager owns.
///
/// Enforces the subscription lifecycle discipline: the previous handle is
/// withdrawn and closed before a replacement is installed, and close is
/// idempotent. Keep the slot at session scope (inside the manager, not a
/// per-mount value) so a UI remount cannot end up with two live
/// subscriptions racing to deliver events.
pub struct SubscriptionSlot<H: TopicHandle> {
    current: Mutex<Option<H>>,
}

impl<H: TopicHandle> SubscriptionSlot<H> {
    pub fn new() -> Self {
        Self {
            current: Mutex::new(None),
        }
    }

    pub fn is_open(&self) -> bool {
        self.current.lock().unwrap().is_some()
    }

    /// Install a freshly opened handle. Returns any handle that was still
    /// installed; the caller must close it. With the close-before-open
    /// discipline followed this returns `None`.
    #[must_use]
    pub fn install(&self, handle: H) -> Option<H> {
        let displaced = self.current.lock().unwrap().replace(handle);
        if displaced.is_some() {
            warn!("subscription slot was still occupied on install");
        }
        displaced
    }

    /// Withdraw, close, and release the current handle, if any. Safe to call
    /// repeatedly and with nothing installed. Returns whether a handle was
    /// actually released.
    pub async fn close(&self) -> bool {
        let taken = self.current.lock().unwrap().take();
        match taken {
            Some(handle) => {
                if let Err(error) = handle.withdraw().await {
                    debug!(error = %error, topic = handle.topic(), "withdraw on close failed");
                }
                handle.close().await;
                true
            }
            None => false,
        }
    }
}

impl<H: TopicHandle> Default for SubscriptionSlot<H> {
    fn default() -> Self {
        Self::new()
    }
}

impl<H: TopicHandle> Drop for SubscriptionSlot<H> {
    fn drop(&mut self) {
        // Abrupt teardown: the handle's own Drop performs the transport-level
        // release, so the slot only notes that the orderly path was skipped.
        if self.is_open() {
            debug!("subscription slot dropped while open");
        }
    }
}

/// Capped exponential backoff delay for subscription open attempts.
pub fn backoff_delay(attempt: u32, initial: Duration, max: Duration) -> Duration {
    let shift = attempt.saturating_sub(1);
    let initial_ms = initial.as_millis() as u64;
    let max_ms = max.as_millis() as u64;
    // Doubling must saturate, not wrap: a shifted value can overflow long
    // before the shift amount itself is out of range.
    let multiplier = 1_u64.checked_shl(shift).unwrap_or(u64::MAX);
    let ms = initial_ms
        .saturating_mul(multiplier)
        .clamp(initial_ms.min(max_ms), max_ms);
    Duration::from_millis(ms)
}

/// Open a topic, retrying failed attempts with backoff.
///
/// Makes at most `attempts` tries (a value of 0 is treated as 1) and returns
/// the last error once they are exhausted.
pub async fn open_with_retry<T: PushTransport>(
    transport: &T,
    topic: &str,
    attempts: u32,
    initial: Duration,
    max: Duration,
) -> Result<T::Topic, TransportError> {
    let mut attempt = 0_u32;
    loop {
        attempt += 1;
        match transport.open_topic(topic).await {
            Ok(handle) => return Ok(handle),
            Err(error) if attempt < attempts => {
                warn!(error = %error, topic, attempt, "topic open failed, retrying");
                tokio::time::sleep(backoff_delay(attempt, initial, max)).await;
            }
            Err(error) => return Err(error),
        }
    }
}

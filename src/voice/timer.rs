//! Cancelable one-shot timers keyed by purpose.
//!
//! At most one timer per [`TimerKind`] is pending; scheduling a kind that is
//! already pending replaces it. Built on tokio's clock, so tests running
//! with `start_paused = true` advance through backoff without wall-clock delay.

use std::collections::HashMap;
use std::time::Duration;

use tokio_util::time::delay_queue::{DelayQueue, Key};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimerKind {
    /// Periodic keep-alive while the connection is open.
    Heartbeat,
    /// Backoff before the next reconnect attempt.
    Reconnect,
    /// Deferred `session.update` after `session.created`.
    SessionUpdate,
}

#[derive(Default)]
pub struct Timers {
    queue: DelayQueue<TimerKind>,
    keys: HashMap<TimerKind, Key>,
}

impl Timers {
    pub fn new() -> Self {
        Self::default()
    }

    /// Arm `kind` to fire once after `after`, replacing any pending instance.
    pub fn schedule(&mut self, kind: TimerKind, after: Duration) {
        self.cancel(kind);
        let key = self.queue.insert(kind, after);
        self.keys.insert(kind, key);
    }

    /// Disarm `kind`. Returns whether it was pending.
    pub fn cancel(&mut self, kind: TimerKind) -> bool {
        match self.keys.remove(&kind) {
            Some(key) => self.queue.try_remove(&key).is_some(),
            None => false,
        }
    }

    pub fn cancel_all(&mut self) {
        self.queue.clear();
        self.keys.clear();
    }

    pub fn is_scheduled(&self, kind: TimerKind) -> bool {
        self.keys.contains_key(&kind)
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    /// Wait for the next timer to fire. Pending forever while nothing is armed.
    ///
    /// Cancel-safe: an expiry is consumed only in the poll that returns it.
    pub async fn next(&mut self) -> TimerKind {
        if self.queue.is_empty() {
            return std::future::pending().await;
        }
        match std::future::poll_fn(|cx| self.queue.poll_expired(cx)).await {
            Some(expired) => {
                let kind = expired.into_inner();
                self.keys.remove(&kind);
                kind
            }
            None => std::future::pending().await,
        }
    }
}

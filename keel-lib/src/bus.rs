// SPDX-License-Identifier: GPL-2.0-only
//! In-process message bus carrying change events.
//!
//! Subjects are `<entity>.<op>` (`instance.created`, `node.updated`).
//! Payloads carry only the entity kind and id: consumers re-read the
//! store, so a dropped or duplicated event never carries stale data.

use crate::id::Id;
use crate::model::{ChangeOp, ChangeRecord, EntityKind};
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::broadcast;
use tracing::warn;

/// Default per-subscriber buffer. A subscriber that falls further behind
/// loses the oldest events and relies on the periodic resync.
pub const DEFAULT_CAPACITY: usize = 1024;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Event {
    pub subject: String,
    pub entity: EntityKind,
    pub id: Id,
    pub op: ChangeOp,
    /// Change log sequence the event was produced from.
    pub seq: i64,
}

impl Event {
    pub fn from_change(record: &ChangeRecord) -> Self {
        Event {
            subject: record.subject(),
            entity: record.entity,
            id: record.entity_id,
            op: record.op,
            seq: record.seq,
        }
    }
}

#[derive(Debug)]
pub enum BusError {
    /// The bus was shut down.
    Closed,
    /// The bus refused the message.
    Rejected(String),
}

impl std::fmt::Display for BusError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BusError::Closed => write!(f, "bus is closed"),
            BusError::Rejected(e) => write!(f, "publish rejected: {e}"),
        }
    }
}

impl std::error::Error for BusError {}

pub trait Bus: Send + Sync {
    /// Hand an event to the bus. Success means the bus accepted it, not
    /// that any subscriber saw it.
    fn publish(&self, event: Event) -> Result<(), BusError>;

    /// Receive future events whose subject matches any of `patterns`.
    fn subscribe(&self, patterns: &[&str]) -> Subscription;
}

/// NATS-style subject matching: `*` matches one token, a trailing `>`
/// matches one or more.
pub fn subject_matches(pattern: &str, subject: &str) -> bool {
    let mut pattern_tokens = pattern.split('.');
    let mut subject_tokens = subject.split('.');
    loop {
        match (pattern_tokens.next(), subject_tokens.next()) {
            (Some(">"), Some(_)) => return pattern_tokens.next().is_none(),
            (Some("*"), Some(_)) => {}
            (Some(p), Some(s)) if p == s => {}
            (None, None) => return true,
            _ => return false,
        }
    }
}

pub struct Subscription {
    rx: broadcast::Receiver<Event>,
    patterns: Vec<String>,
}

impl Subscription {
    /// Next matching event, or `None` once the bus is gone.
    pub async fn recv(&mut self) -> Option<Event> {
        loop {
            match self.rx.recv().await {
                Ok(event) => {
                    if self.patterns.iter().any(|p| subject_matches(p, &event.subject)) {
                        return Some(event);
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, patterns = ?self.patterns, "bus subscriber lagged, events dropped");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}

/// Bus backed by a tokio broadcast channel, for roles sharing a process.
pub struct LocalBus {
    tx: broadcast::Sender<Event>,
    closed: AtomicBool,
}

impl LocalBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        LocalBus {
            tx,
            closed: AtomicBool::new(false),
        }
    }

    /// Refuse further publishes.
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

impl Default for LocalBus {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

impl Bus for LocalBus {
    fn publish(&self, event: Event) -> Result<(), BusError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(BusError::Closed);
        }
        // No subscribers is not an error
        let _ = self.tx.send(event);
        Ok(())
    }

    fn subscribe(&self, patterns: &[&str]) -> Subscription {
        Subscription {
            rx: self.tx.subscribe(),
            patterns: patterns.iter().map(|p| p.to_string()).collect(),
        }
    }
}

// SPDX-License-Identifier: GPL-2.0-only
//! Change propagation: tails the store's change log and republishes each
//! record on the bus, advancing a durable cursor only after the bus
//! accepted it. Delivery is at-least-once.

use crate::bus::{Bus, BusError, Event};
use crate::config::FeedConfig;
use crate::store::traits::{ChangeStore, StoreError};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// Cursor name for the feed's own replication position.
pub const CURSOR_NAME: &str = "feed";

/// Compact the change log every this many polls.
const COMPACT_EVERY: u32 = 240;

/// Pause after a publish failure before retrying the same record.
const PUBLISH_RETRY: Duration = Duration::from_secs(1);

#[derive(Debug)]
pub enum FeedError {
    Store(StoreError),
    /// The bus refused a record. The cursor was not advanced past it.
    Publish { seq: i64, source: BusError },
    /// The durable cursor is ahead of anything the log ever contained.
    /// Needs an operator; never repaired automatically.
    CursorCorrupt { cursor: i64, max_seq: i64 },
}

impl std::fmt::Display for FeedError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FeedError::Store(e) => write!(f, "{e}"),
            FeedError::Publish { seq, source } => {
                write!(f, "cannot publish change {seq}: {source}")
            }
            FeedError::CursorCorrupt { cursor, max_seq } => write!(
                f,
                "feed cursor {cursor} is ahead of the change log (max seq {max_seq})"
            ),
        }
    }
}

impl std::error::Error for FeedError {}

impl From<StoreError> for FeedError {
    fn from(e: StoreError) -> Self {
        FeedError::Store(e)
    }
}

impl FeedError {
    /// Errors the feed loop must not retry.
    pub fn is_fatal(&self) -> bool {
        matches!(self, FeedError::CursorCorrupt { .. })
    }
}

pub struct ChangeFeed<S: ?Sized> {
    store: Arc<S>,
    bus: Arc<dyn Bus>,
    config: FeedConfig,
}

impl<S: ChangeStore + Send + Sync + ?Sized> ChangeFeed<S> {
    pub fn new(store: Arc<S>, bus: Arc<dyn Bus>, config: FeedConfig) -> Self {
        ChangeFeed { store, bus, config }
    }

    /// Publish up to one batch of records after the cursor. Returns the
    /// number published.
    pub fn poll_once(&self) -> Result<usize, FeedError> {
        let cursor = self.store.feed_cursor(CURSOR_NAME)?;
        let max_seq = self.store.max_change_seq()?;
        if cursor > max_seq {
            return Err(FeedError::CursorCorrupt { cursor, max_seq });
        }
        if cursor == max_seq {
            return Ok(0);
        }

        let records = self.store.changes_after(cursor, self.config.batch_size)?;
        let mut published = 0;
        for record in &records {
            self.bus
                .publish(Event::from_change(record))
                .map_err(|source| FeedError::Publish {
                    seq: record.seq,
                    source,
                })?;
            self.store.set_feed_cursor(CURSOR_NAME, record.seq)?;
            published += 1;
        }
        Ok(published)
    }

    /// Delete change records the feed has already published.
    pub fn compact(&self) -> Result<usize, FeedError> {
        let cursor = self.store.feed_cursor(CURSOR_NAME)?;
        Ok(self.store.compact_changes(cursor)?)
    }

    /// Poll until shutdown. Returns only on shutdown or a fatal error.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> Result<(), FeedError> {
        info!(
            poll_interval_ms = self.config.poll_interval_ms,
            batch_size = self.config.batch_size,
            "change feed started"
        );
        let mut polls: u32 = 0;
        loop {
            let delay = match self.poll_once() {
                // A full batch means more is waiting
                Ok(n) if n as u32 >= self.config.batch_size => Duration::ZERO,
                Ok(n) => {
                    if n > 0 {
                        debug!(published = n, "published changes");
                    }
                    self.config.poll_interval()
                }
                Err(e) if e.is_fatal() => {
                    error!(error = %e, "change feed cannot continue, operator intervention required");
                    return Err(e);
                }
                Err(e @ FeedError::Publish { .. }) => {
                    warn!(error = %e, "publish failed, will redeliver");
                    PUBLISH_RETRY
                }
                Err(e) => {
                    warn!(error = %e, "change feed poll failed");
                    self.config.poll_interval()
                }
            };

            polls = polls.wrapping_add(1);
            if polls % COMPACT_EVERY == 0 {
                match self.compact() {
                    Ok(0) => {}
                    Ok(n) => debug!(removed = n, "compacted change log"),
                    Err(e) => warn!(error = %e, "change log compaction failed"),
                }
            }

            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = shutdown.changed() => {
                    info!("change feed shutting down");
                    return Ok(());
                }
            }
        }
    }
}

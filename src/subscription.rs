//! # Change Subscriptions & Live Tailing
//!
//! Every applied operation becomes one row in the shared `counter_log`. This
//! module turns that log into an ordered, gap-free stream of
//! [`CounterChange`]s for the broadcaster.
//!
//! ## Two Sources, One Order
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                         ChangeFeed (per process)                        │
//! │                                                                         │
//! │   this process's writer                     other processes' writers   │
//! │          │                                              │               │
//! │          ▼                                              ▼               │
//! │  ┌───────────────────────┐                 ┌─────────────────────────┐  │
//! │  │ SubscriptionManager   │                 │ counter_log (SQLite)    │  │
//! │  │ broadcast channel     │                 │ polled / read on gaps   │  │
//! │  │ (fast path, µs)       │                 │ (every poll interval)   │  │
//! │  └───────────┬───────────┘                 └────────────┬────────────┘  │
//! │              └──────────────┬───────────────────────────┘               │
//! │                             ▼                                           │
//! │                merge by position, dedup (pos < next_pos)                │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Positions are assigned by the store inside the writing transaction, so they
//! are a total order across processes. The feed keeps `next_pos`, the next
//! position it owes its consumer:
//!
//! - a local change at `next_pos` is delivered directly
//! - a local change beyond `next_pos` means another process wrote in between;
//!   the gap is read from the log
//! - anything below `next_pos` was already delivered and is skipped
//! - when nothing arrives locally for a poll interval, the log is polled
//!
//! ## Backpressure Handling
//!
//! The local channel is bounded. A lagging receiver gets
//! `RecvError::Lagged(n)`; since every change is also in the log, the feed
//! recovers by re-reading from `next_pos` instead of failing.
//!
//! ## Rust Concepts
//!
//! - **`tokio::sync::broadcast`**: each receiver gets a copy of every message.
//!   Payloads are `Arc`-wrapped so a send clones a pointer, not a big integer.
//! - **`tokio::select!`**: waits on the channel and a poll timer at once;
//!   `broadcast::Receiver::recv` is cancel-safe, so losing the race drops
//!   nothing.
//! - **Boxed futures**: the log reader is injected as
//!   `Fn(LogPos, usize) -> BoxFuture<...>`, which keeps this module free of
//!   any storage types and makes it testable with an in-memory log.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use tokio::sync::broadcast;
use tracing::{debug, warn};

use crate::error::Result;
use crate::types::{CounterChange, LogPos};

// =============================================================================
// Configuration
// =============================================================================

/// Default capacity for the local broadcast channel.
pub const DEFAULT_BROADCAST_CAPACITY: usize = 4096;

/// Default number of log rows fetched per read.
pub const DEFAULT_FEED_BATCH_SIZE: usize = 512;

/// Default idle time before the log is polled for other processes' writes.
pub const DEFAULT_FEED_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Reads up to `limit` log rows with `pos >= from`, in position order.
pub type ReadLogFn = Box<dyn Fn(LogPos, usize) -> BoxFuture<'static, Result<Vec<CounterChange>>> + Send + Sync>;

// =============================================================================
// Subscription Manager
// =============================================================================

/// Owns the local broadcast channel the writer publishes committed changes on.
///
/// Cheap to clone; clones share the channel and the head position.
#[derive(Clone)]
pub struct SubscriptionManager {
    broadcast_tx: broadcast::Sender<Arc<CounterChange>>,

    /// Highest position published by this process.
    head_pos: Arc<AtomicU64>,
}

impl SubscriptionManager {
    /// Creates a new subscription manager.
    pub fn new(capacity: usize) -> Self {
        let (broadcast_tx, _) = broadcast::channel(capacity);

        Self {
            broadcast_tx,
            head_pos: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Returns a new receiver for changes published from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<Arc<CounterChange>> {
        self.broadcast_tx.subscribe()
    }

    /// Highest position published by this process.
    pub fn head_pos(&self) -> LogPos {
        LogPos::from_raw(self.head_pos.load(Ordering::Acquire))
    }

    /// Publishes a committed change.
    ///
    /// Called by the writer after COMMIT, in position order.
    pub fn publish(&self, change: CounterChange) {
        self.head_pos
            .fetch_max(change.pos.as_raw(), Ordering::AcqRel);

        // No receivers is fine
        let _ = self.broadcast_tx.send(Arc::new(change));
    }

    /// Returns the number of live receivers.
    pub fn subscriber_count(&self) -> usize {
        self.broadcast_tx.receiver_count()
    }
}

impl Default for SubscriptionManager {
    fn default() -> Self {
        Self::new(DEFAULT_BROADCAST_CAPACITY)
    }
}

// =============================================================================
// Change Feed
// =============================================================================

/// Ordered stream of every change after a start position, from every process.
///
/// # Example
///
/// ```rust,ignore
/// let mut feed = store.subscribe().await?;
///
/// while let Some(result) = feed.next().await {
///     let change = result?;
///     println!("{} -> {}", change.pos, change.value);
/// }
/// ```
pub struct ChangeFeed {
    /// Next position owed to the consumer.
    next_pos: LogPos,

    /// Local fast path.
    receiver: broadcast::Receiver<Arc<CounterChange>>,

    /// Log reader for gaps, lag recovery and polling.
    read_fn: ReadLogFn,

    batch_size: usize,

    poll_interval: Duration,

    /// Rows read from the log, not yet delivered.
    buffer: VecDeque<CounterChange>,

    /// The local channel closed: the store is shutting down.
    closed: bool,
}

impl ChangeFeed {
    /// Creates a feed delivering every change with `pos > after`.
    pub fn new<F, Fut>(
        after: LogPos,
        receiver: broadcast::Receiver<Arc<CounterChange>>,
        read_fn: F,
        batch_size: usize,
        poll_interval: Duration,
    ) -> Self
    where
        F: Fn(LogPos, usize) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<Vec<CounterChange>>> + Send + 'static,
    {
        Self {
            next_pos: after.next(),
            receiver,
            read_fn: Box::new(move |pos, limit| Box::pin(read_fn(pos, limit))),
            batch_size: batch_size.max(1),
            poll_interval,
            buffer: VecDeque::new(),
            closed: false,
        }
    }

    /// Waits for the next change.
    ///
    /// # Returns
    ///
    /// - `Some(Ok(change))`: next change, strictly after the previous one
    /// - `Some(Err(e))`: reading the log failed; the feed stays usable and
    ///   the next call retries from the same position
    /// - `None`: the store shut down and the remaining rows were drained
    pub async fn next(&mut self) -> Option<Result<CounterChange>> {
        loop {
            if let Some(change) = self.buffer.pop_front() {
                if change.pos < self.next_pos {
                    continue;
                }
                self.next_pos = change.pos.next();
                return Some(Ok(change));
            }

            if self.closed {
                return None;
            }

            tokio::select! {
                received = self.receiver.recv() => match received {
                    Ok(change) => {
                        if change.pos < self.next_pos {
                            continue;
                        }
                        if change.pos == self.next_pos {
                            self.next_pos = change.pos.next();
                            return Some(Ok((*change).clone()));
                        }

                        // Another process wrote between next_pos and this change.
                        debug!(expected = %self.next_pos, got = %change.pos, "gap in local feed, reading log");
                        if let Err(e) = self.fill_from_log().await {
                            return Some(Err(e));
                        }
                        if self.buffer.is_empty() {
                            // Gap rows were pruned; the change itself is current.
                            self.next_pos = change.pos.next();
                            return Some(Ok((*change).clone()));
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        warn!(missed, "change feed lagged, recovering from log");
                        if let Err(e) = self.fill_from_log().await {
                            return Some(Err(e));
                        }
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        self.closed = true;
                        // Best effort: hand out whatever is already committed.
                        let _ = self.fill_from_log().await;
                    }
                },
                _ = tokio::time::sleep(self.poll_interval) => {
                    if let Err(e) = self.fill_from_log().await {
                        return Some(Err(e));
                    }
                }
            }
        }
    }

    /// Reads the next batch of rows at or after `next_pos` into the buffer.
    async fn fill_from_log(&mut self) -> Result<()> {
        let rows = (self.read_fn)(self.next_pos, self.batch_size).await?;
        self.buffer.extend(rows);
        Ok(())
    }

    /// Next position the feed will deliver.
    pub fn next_position(&self) -> LogPos {
        self.next_pos
    }
}

// =============================================================================
// Tests
// =============================================================================

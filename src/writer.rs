//! # Counter Writer with Group Commit
//!
//! Every mutation of the shared store goes through one writer per process.
//! The writer owns the process's write connection, runs on a dedicated
//! thread, and collects apply requests over a short window so that a burst
//! of increments costs one transaction instead of hundreds.
//!
//! ## Why Group Commit?
//!
//! ```text
//! Without batching:                With batching:
//! ┌──────────────────────────┐     ┌──────────────────────────┐
//! │ inc1 → BEGIN → COMMIT    │     │ BEGIN IMMEDIATE          │
//! │ inc2 → BEGIN → COMMIT    │     │   SAVEPOINT op_0  (inc)  │
//! │ mul3 → BEGIN → COMMIT    │     │   SAVEPOINT op_1  (inc)  │
//! │ ...                      │     │   SAVEPOINT op_2  (mul)  │
//! │ 100 lock acquisitions    │     │ COMMIT                   │
//! └──────────────────────────┘     │ 1 lock acquisition       │
//!                                  └──────────────────────────┘
//! ```
//!
//! ## Cross-Process Atomicity
//!
//! `BEGIN IMMEDIATE` takes SQLite's database-wide write lock before the
//! counter is read. Another process's writer waits (bounded by the busy
//! timeout) until COMMIT, so the read-modify-write of the counter can never
//! interleave with another writer's. That is what makes concurrent
//! increments lossless and concurrent multiplies serial.
//!
//! ## SAVEPOINT Semantics
//!
//! Each operation runs in its own SAVEPOINT inside the batch transaction:
//!
//! - success: RELEASE, the change stays
//! - rejection (rate limited, duplicate payment): ROLLBACK TO, nothing of
//!   that operation is kept, the rest of the batch is unaffected
//!
//! A paid multiply is a single savepoint that does four things: checks and
//! stamps the user's rate-limit row, checks and records the payment intent,
//! appends the log row, and updates the counter. Either all four persist or
//! none do.
//!
//! ## Staged vs Committed State
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                     In-Memory State                         │
//! │                                                             │
//! │  ┌─────────────────────┐    ┌─────────────────────────────┐ │
//! │  │ consumed (LRU)      │    │ staged.consumed             │ │
//! │  │ (mirrors disk)      │    │ (intents used in this batch)│ │
//! │  └─────────────────────┘    └─────────────────────────────┘ │
//! │                                                             │
//! │  After COMMIT: staged → committed, changes published        │
//! │  After ROLLBACK: staged discarded, nothing published        │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Invariants
//!
//! - Nothing is published to subscribers before COMMIT succeeds
//! - Changes are published in position order
//! - Operations are applied in arrival order within a batch
//! - A failed COMMIT fails every operation in the batch with
//!   `StoreUnavailable`; none of them was applied

use std::num::NonZeroUsize;
use std::time::{Duration, Instant};

use lru::LruCache;
use rusqlite::{params, Connection, OptionalExtension};
use tokio::sync::{mpsc, oneshot};
use tokio::time::timeout;
use tracing::{debug, error, info};

use crate::codec::current_time_ms;
use crate::error::{unavailable, Error, Result};
use crate::payment::VerifiedPayment;
use crate::subscription::SubscriptionManager;
use crate::types::{
    ApplyResult, Attribution, BigCount, CounterChange, Delta, Granularity, HistoryPoint, LogPos,
    PaymentIntentId, UserId,
};

// =============================================================================
// Configuration
// =============================================================================

/// Default batch timeout in milliseconds.
///
/// Operations are collected for up to this duration before being executed.
/// Shorter = lower latency, longer = fewer lock acquisitions.
pub const DEFAULT_BATCH_TIMEOUT_MS: u64 = 2;

/// Maximum operations per batch.
pub const DEFAULT_BATCH_MAX_SIZE: usize = 512;

/// Size of the request channel.
const REQUEST_CHANNEL_SIZE: usize = 4096;

/// Recently consumed payment intents kept in memory.
const CONSUMED_CACHE_MAX_ENTRIES: usize = 10_000;

const HOUR_MS: u64 = 3_600_000;
const DAY_MS: u64 = 24 * HOUR_MS;
const WEEK_MS: u64 = 7 * DAY_MS;

/// Configuration for the counter writer.
#[derive(Debug, Clone)]
pub struct WriterConfig {
    /// Maximum time to wait for operations before executing a batch.
    pub batch_timeout: Duration,

    /// Maximum operations per batch.
    pub batch_max_size: usize,

    /// Identifies this process in `counter_log` and `viewer_presence`.
    pub process_id: String,
}

impl Default for WriterConfig {
    fn default() -> Self {
        Self {
            batch_timeout: Duration::from_millis(DEFAULT_BATCH_TIMEOUT_MS),
            batch_max_size: DEFAULT_BATCH_MAX_SIZE,
            process_id: uuid::Uuid::new_v4().to_string(),
        }
    }
}

// =============================================================================
// Request Types
// =============================================================================

/// A counter mutation.
#[derive(Debug, Clone)]
pub enum StoreOp {
    /// Apply a delta unconditionally.
    Apply {
        delta: Delta,
        attribution: Attribution,
    },

    /// Paid multiply: rate-limit test-and-set, payment consumption and the
    /// multiplication itself, all or nothing.
    MultiplyOnce {
        user_id: UserId,
        payment_intent_id: PaymentIntentId,
        factor: u64,
        window_ms: u64,
        attribution: Attribution,
    },
}

/// A request sent to the writer thread.
pub enum WriteRequest {
    /// Counter mutation (batched).
    Apply {
        op: StoreOp,
        response: oneshot::Sender<Result<ApplyResult>>,
    },

    /// Standalone rate-limit test-and-set.
    RecordMultiply {
        user_id: UserId,
        at_ms: u64,
        window_ms: u64,
        response: oneshot::Sender<Result<()>>,
    },

    /// Record (or update) a payment reported by the provider.
    ConfirmPayment {
        payment_intent_id: PaymentIntentId,
        payment: VerifiedPayment,
        response: oneshot::Sender<Result<()>>,
    },

    /// Upsert this process's viewer count.
    PublishPresence {
        viewers: u64,
        response: oneshot::Sender<Result<()>>,
    },

    /// Delete this process's presence row.
    RemovePresence {
        response: oneshot::Sender<Result<()>>,
    },

    /// Record a history snapshot of the current value.
    SnapshotHistory {
        at_ms: u64,
        response: oneshot::Sender<Result<HistoryPoint>>,
    },

    /// Delete all but the newest `keep` log rows.
    PruneLog {
        keep: u64,
        response: oneshot::Sender<Result<usize>>,
    },

    /// Shutdown the writer.
    Shutdown,
}

/// A pending apply waiting for its batch.
struct PendingApply {
    op: StoreOp,
    response: oneshot::Sender<Result<ApplyResult>>,
}

// =============================================================================
// Staged State
// =============================================================================

/// Batch-local state, promoted on COMMIT and discarded on ROLLBACK.
#[derive(Default)]
struct StagedState {
    /// Payment intents consumed by operations in this batch.
    consumed: Vec<String>,
}

impl StagedState {
    fn clear(&mut self) {
        self.consumed.clear();
    }
}

// =============================================================================
// Counter Writer
// =============================================================================

/// The writer that owns the write connection.
///
/// Runs on a dedicated thread; use [`WriterHandle`] from async code.
pub struct CounterWriter {
    /// SQLite connection (owned, single writer per process).
    conn: Connection,

    /// Recently consumed payment intents (mirrors disk).
    consumed: LruCache<String, ()>,

    staged: StagedState,

    /// Committed changes are published here.
    subscriptions: SubscriptionManager,

    process_id: String,
}

impl CounterWriter {
    /// Creates a new writer.
    ///
    /// # Arguments
    ///
    /// * `conn` - SQLite connection (schema must be initialized)
    /// * `subscriptions` - Where committed changes are published
    /// * `process_id` - This process's identity in shared tables
    pub fn new(conn: Connection, subscriptions: SubscriptionManager, process_id: String) -> Result<Self> {
        let capacity = NonZeroUsize::new(CONSUMED_CACHE_MAX_ENTRIES).unwrap_or(NonZeroUsize::MIN);

        let mut writer = Self {
            conn,
            consumed: LruCache::new(capacity),
            staged: StagedState::default(),
            subscriptions,
            process_id,
        };

        writer.load_consumed()?;

        Ok(writer)
    }

    /// Warms the consumed-intent cache with the most recent intents.
    fn load_consumed(&mut self) -> Result<()> {
        let mut stmt = self.conn.prepare(
            "SELECT payment_intent_id FROM consumed_payments ORDER BY consumed_ms DESC LIMIT ?",
        )?;

        let ids = stmt
            .query_map([CONSUMED_CACHE_MAX_ENTRIES as i64], |row| row.get::<_, String>(0))?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        drop(stmt);

        // Oldest first so the newest end up most recently used.
        for id in ids.into_iter().rev() {
            self.consumed.put(id, ());
        }

        Ok(())
    }

    // =========================================================================
    // Batch Execution
    // =========================================================================

    /// Executes a batch of operations.
    ///
    /// 1. Begin outer transaction (takes the cross-process write lock)
    /// 2. For each operation, create a SAVEPOINT and execute
    /// 3. On success: release SAVEPOINT
    /// 4. On rejection: rollback SAVEPOINT (others continue)
    /// 5. Commit outer transaction
    /// 6. Publish committed changes, then send responses
    fn execute_batch(&mut self, items: Vec<PendingApply>) {
        if items.is_empty() {
            return;
        }

        self.staged.clear();

        let (ops, responses): (Vec<StoreOp>, Vec<_>) =
            items.into_iter().map(|p| (p.op, p.response)).unzip();

        match self.execute_batch_inner(&ops) {
            Ok(results) => {
                self.commit_staged_state(&results);

                for (response, result) in responses.into_iter().zip(results) {
                    let _ = response.send(result);
                }
            }
            Err(e) => {
                error!(error = %e, batch_size = ops.len(), "counter batch failed");
                let msg = e.to_string();

                for response in responses {
                    let _ = response.send(Err(Error::StoreUnavailable(msg.clone())));
                }

                self.staged.clear();
            }
        }
    }

    /// Inner batch execution with transaction.
    ///
    /// Uses raw SQL for transaction management so the connection is not
    /// mutably borrowed by a `Transaction` across the per-op helpers.
    fn execute_batch_inner(&mut self, ops: &[StoreOp]) -> Result<Vec<Result<ApplyResult>>> {
        self.conn.execute_batch("BEGIN IMMEDIATE").map_err(unavailable)?;

        let mut current = match load_counter(&self.conn) {
            Ok(value) => value,
            Err(e) => {
                let _ = self.conn.execute_batch("ROLLBACK");
                return Err(e);
            }
        };

        let mut results = Vec::with_capacity(ops.len());
        for (i, op) in ops.iter().enumerate() {
            let result = self.execute_op_in_savepoint(op, &current, i);
            if let Ok(applied) = &result {
                current = applied.change.value.clone();
            }
            results.push(result);
        }

        match self.conn.execute_batch("COMMIT") {
            Ok(()) => Ok(results),
            Err(e) => {
                let _ = self.conn.execute_batch("ROLLBACK");
                Err(unavailable(e))
            }
        }
    }

    /// Executes a single operation within a SAVEPOINT.
    fn execute_op_in_savepoint(&mut self, op: &StoreOp, current: &BigCount, index: usize) -> Result<ApplyResult> {
        let sp_name = format!("op_{index}");
        self.conn.execute_batch(&format!("SAVEPOINT {sp_name}"))?;

        match self.execute_op_inner(op, current) {
            Ok(result) => {
                self.conn.execute_batch(&format!("RELEASE {sp_name}"))?;
                Ok(result)
            }
            Err(e) => {
                self.conn.execute_batch(&format!("ROLLBACK TO {sp_name}"))?;
                self.conn.execute_batch(&format!("RELEASE {sp_name}"))?;
                Err(e)
            }
        }
    }

    /// Executes an operation's database statements.
    fn execute_op_inner(&mut self, op: &StoreOp, current: &BigCount) -> Result<ApplyResult> {
        let now_ms = current_time_ms();

        match op {
            StoreOp::Apply { delta, attribution } => {
                delta.validate()?;
                self.append_change(current, *delta, attribution.user_id.as_ref(), attribution, now_ms)
            }
            StoreOp::MultiplyOnce {
                user_id,
                payment_intent_id,
                factor,
                window_ms,
                attribution,
            } => {
                let delta = Delta::Multiply(*factor);
                delta.validate()?;

                test_and_set_limit(&self.conn, user_id, now_ms, *window_ms)?;
                self.check_payment_unused(payment_intent_id)?;

                let result = self.append_change(current, delta, Some(user_id), attribution, now_ms)?;

                self.conn.execute(
                    "INSERT INTO consumed_payments (payment_intent_id, user_id, factor, pos, consumed_ms)
                     VALUES (?, ?, ?, ?, ?)",
                    params![
                        payment_intent_id.as_str(),
                        user_id.as_str(),
                        *factor as i64,
                        result.change.pos.as_raw() as i64,
                        now_ms as i64,
                    ],
                )?;
                self.staged.consumed.push(payment_intent_id.as_str().to_string());

                Ok(result)
            }
        }
    }

    /// Rejects an intent that already paid for a multiply.
    ///
    /// Lookup order: this batch → LRU → disk. Disk is authoritative because
    /// other processes consume intents too.
    fn check_payment_unused(&self, payment_intent_id: &PaymentIntentId) -> Result<()> {
        let id = payment_intent_id.as_str();
        let duplicate = || Error::DuplicatePayment {
            payment_intent_id: id.to_string(),
        };

        if self.staged.consumed.iter().any(|c| c == id) || self.consumed.contains(id) {
            return Err(duplicate());
        }

        let on_disk = self
            .conn
            .query_row(
                "SELECT 1 FROM consumed_payments WHERE payment_intent_id = ?",
                [id],
                |_| Ok(()),
            )
            .optional()?;

        match on_disk {
            Some(()) => Err(duplicate()),
            None => Ok(()),
        }
    }

    /// Appends the log row and updates the counter row.
    fn append_change(
        &self,
        current: &BigCount,
        delta: Delta,
        user_id: Option<&UserId>,
        attribution: &Attribution,
        now_ms: u64,
    ) -> Result<ApplyResult> {
        let new_value = delta.apply(current);
        let value_text = new_value.to_string();

        // u64 operands above i64::MAX round-trip through the sign bit.
        self.conn.execute(
            "INSERT INTO counter_log (value, kind, operand, user_id, country_code, process_id, ts_ms)
             VALUES (?, ?, ?, ?, ?, ?, ?)",
            params![
                value_text,
                delta.kind(),
                delta.operand() as i64,
                user_id.map(|u| u.as_str()),
                attribution.country_code.as_ref().map(|c| c.as_str()),
                self.process_id,
                now_ms as i64,
            ],
        )?;
        let pos = LogPos::from_raw(self.conn.last_insert_rowid() as u64);

        self.conn.execute(
            "UPDATE counter SET value = ?, last_pos = ?, updated_ms = ? WHERE id = 1",
            params![value_text, pos.as_raw() as i64, now_ms as i64],
        )?;

        Ok(ApplyResult {
            old_value: current.clone(),
            change: CounterChange {
                pos,
                value: new_value,
                delta,
                user_id: user_id.cloned(),
                country_code: attribution.country_code.clone(),
                timestamp_ms: now_ms,
            },
        })
    }

    /// Promotes staged state and publishes the batch's changes.
    fn commit_staged_state(&mut self, results: &[Result<ApplyResult>]) {
        for id in self.staged.consumed.drain(..) {
            self.consumed.put(id, ());
        }

        for applied in results.iter().flatten() {
            self.subscriptions.publish(applied.change.clone());
        }
    }

    // =========================================================================
    // Immediate Operations
    // =========================================================================
    //
    // Infrequent requests run in their own transaction as soon as they
    // arrive instead of waiting for a batch.

    /// Runs `f` inside `BEGIN IMMEDIATE ... COMMIT`.
    fn in_transaction<T>(&mut self, f: impl FnOnce(&Connection) -> Result<T>) -> Result<T> {
        self.conn.execute_batch("BEGIN IMMEDIATE").map_err(unavailable)?;

        let value = match f(&self.conn) {
            Ok(value) => value,
            Err(e) => {
                let _ = self.conn.execute_batch("ROLLBACK");
                return Err(e);
            }
        };

        match self.conn.execute_batch("COMMIT") {
            Ok(()) => Ok(value),
            Err(e) => {
                let _ = self.conn.execute_batch("ROLLBACK");
                Err(unavailable(e))
            }
        }
    }

    /// Rate-limit test-and-set without a multiply.
    pub fn execute_record_multiply(&mut self, user_id: &UserId, at_ms: u64, window_ms: u64) -> Result<()> {
        self.in_transaction(|conn| test_and_set_limit(conn, user_id, at_ms, window_ms))
    }

    /// Upserts a provider-confirmed payment.
    ///
    /// A later webhook for the same intent overwrites the earlier one
    /// (`processing` then `succeeded`). Consumption is tracked separately in
    /// `consumed_payments` and is never undone here.
    pub fn execute_confirm_payment(&mut self, payment_intent_id: &PaymentIntentId, payment: &VerifiedPayment) -> Result<()> {
        self.conn
            .execute(
                "INSERT INTO confirmed_payments (payment_intent_id, amount, currency, status, confirmed_ms)
                 VALUES (?, ?, ?, ?, ?)
                 ON CONFLICT(payment_intent_id) DO UPDATE SET
                    amount = excluded.amount,
                    currency = excluded.currency,
                    status = excluded.status,
                    confirmed_ms = excluded.confirmed_ms",
                params![
                    payment_intent_id.as_str(),
                    payment.amount as i64,
                    payment.currency.to_ascii_lowercase(),
                    payment.status.as_str(),
                    current_time_ms() as i64
                ],
            )
            .map_err(unavailable)?;
        Ok(())
    }

    /// Upserts this process's viewer count.
    pub fn execute_publish_presence(&mut self, viewers: u64) -> Result<()> {
        self.conn
            .execute(
                "INSERT INTO viewer_presence (process_id, viewers, updated_ms) VALUES (?, ?, ?)
                 ON CONFLICT(process_id) DO UPDATE SET viewers = excluded.viewers, updated_ms = excluded.updated_ms",
                params![self.process_id, viewers as i64, current_time_ms() as i64],
            )
            .map_err(unavailable)?;
        Ok(())
    }

    /// Deletes this process's presence row.
    pub fn execute_remove_presence(&mut self) -> Result<()> {
        self.conn
            .execute(
                "DELETE FROM viewer_presence WHERE process_id = ?",
                [&self.process_id],
            )
            .map_err(unavailable)?;
        Ok(())
    }

    /// Records a detailed snapshot, rolls up hourly/daily points when due and
    /// drops points past their retention.
    ///
    /// | Granularity | Cadence | Retention |
    /// |-------------|---------|-----------|
    /// | detailed | every call | 1 day |
    /// | hourly | >= 1h apart | 7 days |
    /// | daily | >= 1d apart | forever |
    pub fn execute_snapshot_history(&mut self, at_ms: u64) -> Result<HistoryPoint> {
        self.in_transaction(|conn| {
            let value = load_counter(conn)?;
            let value_text = value.to_string();

            insert_history(conn, at_ms, Granularity::Detailed, &value_text)?;

            for (granularity, spacing) in [(Granularity::Hourly, HOUR_MS), (Granularity::Daily, DAY_MS)] {
                let last: Option<i64> = conn.query_row(
                    "SELECT MAX(ts_ms) FROM counter_history WHERE granularity = ?",
                    [granularity.as_str()],
                    |row| row.get(0),
                )?;
                let due = match last {
                    None => true,
                    Some(last) => at_ms.saturating_sub(last as u64) >= spacing,
                };
                if due {
                    insert_history(conn, at_ms, granularity, &value_text)?;
                }
            }

            conn.execute(
                "DELETE FROM counter_history WHERE granularity = ? AND ts_ms < ?",
                params![Granularity::Detailed.as_str(), at_ms.saturating_sub(DAY_MS) as i64],
            )?;
            conn.execute(
                "DELETE FROM counter_history WHERE granularity = ? AND ts_ms < ?",
                params![Granularity::Hourly.as_str(), at_ms.saturating_sub(WEEK_MS) as i64],
            )?;

            Ok(HistoryPoint {
                count: value,
                timestamp: at_ms,
            })
        })
    }

    /// Deletes all but the newest `keep` log rows. Returns rows deleted.
    pub fn execute_prune_log(&mut self, keep: u64) -> Result<usize> {
        let deleted = self
            .conn
            .execute(
                "DELETE FROM counter_log WHERE pos <= (SELECT MAX(pos) FROM counter_log) - ?",
                [keep as i64],
            )
            .map_err(unavailable)?;
        Ok(deleted)
    }
}

// =============================================================================
// Statement Helpers
// =============================================================================

/// Reads the authoritative counter value.
fn load_counter(conn: &Connection) -> Result<BigCount> {
    let text: String = conn.query_row("SELECT value FROM counter WHERE id = 1", [], |row| row.get(0))?;
    BigCount::parse(&text)
}

/// Fails with `RateLimited` if the user multiplied within `window_ms` of
/// `now_ms`, otherwise stamps `now_ms` as their last multiply.
///
/// Must run inside a write transaction: the check and the stamp are only
/// atomic under the write lock.
fn test_and_set_limit(conn: &Connection, user_id: &UserId, now_ms: u64, window_ms: u64) -> Result<()> {
    let last: Option<i64> = conn
        .query_row(
            "SELECT last_multiply_ms FROM multiply_limits WHERE user_id = ?",
            [user_id.as_str()],
            |row| row.get(0),
        )
        .optional()?;

    if let Some(last) = last {
        // A peer clock running ahead counts as zero elapsed time.
        let elapsed = now_ms.saturating_sub(last.max(0) as u64);
        if elapsed < window_ms {
            return Err(Error::RateLimited {
                retry_after_ms: window_ms - elapsed,
            });
        }
    }

    conn.execute(
        "INSERT INTO multiply_limits (user_id, last_multiply_ms) VALUES (?, ?)
         ON CONFLICT(user_id) DO UPDATE SET last_multiply_ms = excluded.last_multiply_ms",
        params![user_id.as_str(), now_ms as i64],
    )?;

    Ok(())
}

fn insert_history(conn: &Connection, at_ms: u64, granularity: Granularity, value: &str) -> Result<()> {
    conn.execute(
        "INSERT OR REPLACE INTO counter_history (ts_ms, granularity, value) VALUES (?, ?, ?)",
        params![at_ms as i64, granularity.as_str(), value],
    )?;
    Ok(())
}

// =============================================================================
// Async Handle
// =============================================================================

/// Async handle to the writer thread.
#[derive(Clone)]
pub struct WriterHandle {
    tx: mpsc::Sender<WriteRequest>,
}

impl WriterHandle {
    /// Sends a request and awaits its response.
    async fn request<T>(&self, make: impl FnOnce(oneshot::Sender<Result<T>>) -> WriteRequest) -> Result<T> {
        let (response_tx, response_rx) = oneshot::channel();

        self.tx
            .send(make(response_tx))
            .await
            .map_err(|_| Error::StoreUnavailable("writer has shut down".to_string()))?;

        response_rx
            .await
            .map_err(|_| Error::StoreUnavailable("writer dropped response".to_string()))?
    }

    /// Applies a counter mutation.
    pub async fn apply(&self, op: StoreOp) -> Result<ApplyResult> {
        self.request(|response| WriteRequest::Apply { op, response }).await
    }

    /// Rate-limit test-and-set for `user_id` at `at_ms`.
    pub async fn record_multiply(&self, user_id: UserId, at_ms: u64, window_ms: u64) -> Result<()> {
        self.request(|response| WriteRequest::RecordMultiply {
            user_id,
            at_ms,
            window_ms,
            response,
        })
        .await
    }

    /// Records a provider-confirmed payment.
    pub async fn confirm_payment(&self, payment_intent_id: PaymentIntentId, payment: VerifiedPayment) -> Result<()> {
        self.request(|response| WriteRequest::ConfirmPayment {
            payment_intent_id,
            payment,
            response,
        })
        .await
    }

    /// Upserts this process's viewer count.
    pub async fn publish_presence(&self, viewers: u64) -> Result<()> {
        self.request(|response| WriteRequest::PublishPresence { viewers, response })
            .await
    }

    /// Deletes this process's presence row.
    pub async fn remove_presence(&self) -> Result<()> {
        self.request(|response| WriteRequest::RemovePresence { response })
            .await
    }

    /// Records a history snapshot.
    pub async fn snapshot_history(&self, at_ms: u64) -> Result<HistoryPoint> {
        self.request(|response| WriteRequest::SnapshotHistory { at_ms, response })
            .await
    }

    /// Deletes all but the newest `keep` log rows.
    pub async fn prune_log(&self, keep: u64) -> Result<usize> {
        self.request(|response| WriteRequest::PruneLog { keep, response })
            .await
    }

    /// Asks the writer to flush its batch and exit.
    pub async fn shutdown(&self) {
        let _ = self.tx.send(WriteRequest::Shutdown).await;
    }
}

// =============================================================================
// Writer Loop
// =============================================================================

/// Runs the writer loop until shutdown.
pub async fn run_writer(mut writer: CounterWriter, mut rx: mpsc::Receiver<WriteRequest>, config: WriterConfig) {
    let mut batch: Vec<PendingApply> = Vec::new();
    let mut batch_start: Option<Instant> = None;

    loop {
        let wait_timeout = match batch_start {
            // No pending operations - wait indefinitely
            None => Duration::from_secs(3600),
            Some(start) => config.batch_timeout.saturating_sub(start.elapsed()),
        };

        match timeout(wait_timeout, rx.recv()).await {
            Ok(Some(WriteRequest::Apply { op, response })) => {
                if batch.is_empty() {
                    batch_start = Some(Instant::now());
                }

                batch.push(PendingApply { op, response });

                if batch.len() >= config.batch_max_size {
                    writer.execute_batch(std::mem::take(&mut batch));
                    batch_start = None;
                }
            }
            Ok(Some(WriteRequest::RecordMultiply {
                user_id,
                at_ms,
                window_ms,
                response,
            })) => {
                let _ = response.send(writer.execute_record_multiply(&user_id, at_ms, window_ms));
            }
            Ok(Some(WriteRequest::ConfirmPayment {
                payment_intent_id,
                payment,
                response,
            })) => {
                let _ = response.send(writer.execute_confirm_payment(&payment_intent_id, &payment));
            }
            Ok(Some(WriteRequest::PublishPresence { viewers, response })) => {
                let _ = response.send(writer.execute_publish_presence(viewers));
            }
            Ok(Some(WriteRequest::RemovePresence { response })) => {
                let _ = response.send(writer.execute_remove_presence());
            }
            Ok(Some(WriteRequest::SnapshotHistory { at_ms, response })) => {
                let _ = response.send(writer.execute_snapshot_history(at_ms));
            }
            Ok(Some(WriteRequest::PruneLog { keep, response })) => {
                let result = writer.execute_prune_log(keep);
                if let Ok(deleted) = &result {
                    debug!(deleted, keep, "pruned counter log");
                }
                let _ = response.send(result);
            }
            Ok(Some(WriteRequest::Shutdown)) | Ok(None) => {
                // Flush before exiting
                writer.execute_batch(std::mem::take(&mut batch));
                break;
            }
            Err(_) => {
                writer.execute_batch(std::mem::take(&mut batch));
                batch_start = None;
            }
        }
    }

    info!(process_id = %writer.process_id, "counter writer stopped");
}

/// Spawns the writer on a dedicated thread.
pub fn spawn_writer(conn: Connection, subscriptions: SubscriptionManager, config: WriterConfig) -> Result<WriterHandle> {
    let (tx, rx) = mpsc::channel(REQUEST_CHANNEL_SIZE);

    let writer = CounterWriter::new(conn, subscriptions, config.process_id.clone())?;

    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .map_err(|e| Error::StoreUnavailable(format!("failed to create writer runtime: {e}")))?;

    std::thread::Builder::new()
        .name("counterd-writer".to_string())
        .spawn(move || rt.block_on(run_writer(writer, rx, config)))
        .map_err(|e| Error::StoreUnavailable(format!("failed to spawn writer thread: {e}")))?;

    Ok(WriterHandle { tx })
}

// =============================================================================
// Tests
// =============================================================================

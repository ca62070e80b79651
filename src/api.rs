//! # Async API for the Shared Counter Store
//!
//! [`CounterStore`] is the big counter as every other module sees it: one
//! exact integer, shared by all server processes, changed only through
//! atomic operations, and observable as an ordered change feed.
//!
//! ## The SQLite Challenge
//!
//! SQLite's `Connection` is `!Sync`, so it can't be shared across tasks.
//! The store keeps connections on dedicated threads and talks to them over
//! async channels:
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                    Tokio Runtime                            │
//! │                                                             │
//! │  sessions, processor, broadcaster, HTTP handlers            │
//! │        │                              │                     │
//! │        │ mpsc + oneshot               │ mpsc + oneshot      │
//! └────────┼──────────────────────────────┼─────────────────────┘
//!          ▼                              ▼
//!  ┌───────────────────┐        ┌─────────────────────┐
//!  │  CounterWriter    │        │     Reader pool     │
//!  │  (1 thread, R/W)  │        │  (N threads, R/O)   │
//!  └─────────┬─────────┘        └──────────┬──────────┘
//!            └─────────────┬───────────────┘
//!                          ▼
//!                 ┌─────────────────┐
//!                 │  SQLite (WAL)   │ ◄── other processes' stores
//!                 └─────────────────┘
//! ```
//!
//! ## Multi-Process
//!
//! Every process opens its own `CounterStore` on the same file. Writes are
//! serialized by SQLite's write lock; reads see whatever any process
//! committed last. Two stores opened on one file inside a single test
//! behave exactly like two processes.
//!
//! ## Background Tasks
//!
//! | Task | Cadence | Work |
//! |------|---------|------|
//! | log pruning | every 5 minutes | keep the newest `log_retention` rows |
//! | history | `history_interval` | snapshot the counter for the history chart |

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread::{self, available_parallelism, JoinHandle};
use std::time::Duration;

use rusqlite::{Connection, OpenFlags};
use tokio::sync::{mpsc, oneshot, Mutex};
use tracing::{debug, info, warn};

use crate::codec::current_time_ms;
use crate::error::{Error, Result};
use crate::payment::{PaymentStatus, VerifiedPayment};
use crate::reader::{self, ReadRequest};
use crate::schema::{Database, DEFAULT_BUSY_TIMEOUT};
use crate::subscription::{ChangeFeed, SubscriptionManager, DEFAULT_FEED_BATCH_SIZE, DEFAULT_FEED_POLL_INTERVAL};
use crate::types::{
    ApplyResult, Attribution, BigCount, CounterChange, CounterSnapshot, Delta, HistoryPoint,
    HistoryRange, LogPos, PaymentIntentId, UserId,
};
use crate::writer::{spawn_writer, StoreOp, WriterConfig, WriterHandle, DEFAULT_BATCH_TIMEOUT_MS};

// =============================================================================
// Configuration
// =============================================================================

/// Size of the read request channel.
const READ_CHANNEL_SIZE: usize = 4096;

/// Minimum number of reader threads.
const MIN_READ_THREADS: usize = 1;

/// Maximum number of reader threads.
const MAX_READ_THREADS: usize = 8;

/// Background log pruning interval (5 minutes).
const PRUNE_INTERVAL_SECS: u64 = 5 * 60;

/// Default number of log rows kept by pruning.
pub const DEFAULT_LOG_RETENTION: u64 = 100_000;

/// Default history snapshot interval.
pub const DEFAULT_HISTORY_INTERVAL: Duration = Duration::from_secs(60);

/// Store configuration.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Counter value written when the store file is created.
    pub initial_value: BigCount,

    /// Group-commit window for the writer.
    pub batch_timeout: Duration,

    /// How long to wait for another process's write lock.
    pub busy_timeout: Duration,

    /// This process's identity in shared tables.
    pub process_id: String,

    /// Idle time before the change feed polls for other processes' writes.
    pub feed_poll_interval: Duration,

    /// Log rows kept by background pruning; `None` disables pruning.
    pub log_retention: Option<u64>,

    /// History snapshot cadence; `None` disables the history task.
    pub history_interval: Option<Duration>,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            initial_value: BigCount::zero(),
            batch_timeout: Duration::from_millis(DEFAULT_BATCH_TIMEOUT_MS),
            busy_timeout: DEFAULT_BUSY_TIMEOUT,
            process_id: uuid::Uuid::new_v4().to_string(),
            feed_poll_interval: DEFAULT_FEED_POLL_INTERVAL,
            log_retention: Some(DEFAULT_LOG_RETENTION),
            history_interval: Some(DEFAULT_HISTORY_INTERVAL),
        }
    }
}

// =============================================================================
// CounterStore
// =============================================================================

/// Async handle to the shared counter store.
///
/// `CounterStore` is `Clone`, `Send` and `Sync`; all clones share the same
/// writer thread and reader pool.
///
/// # Example
///
/// ```rust,ignore
/// let store = CounterStore::open("counter.db").await?;
///
/// let result = store.apply_delta(Delta::Add(1), Attribution::anonymous()).await?;
/// println!("now {}", result.new_value());
///
/// store.shutdown().await;
/// ```
#[derive(Clone)]
pub struct CounterStore {
    /// Writer handle for all mutations.
    writer: WriterHandle,

    /// Channel to send read requests.
    read_tx: mpsc::Sender<ReadRequest>,

    /// Handles to the reader threads (for shutdown).
    reader_handles: Arc<Mutex<Vec<JoinHandle<()>>>>,

    /// Number of reader threads in the pool.
    reader_count: usize,

    /// Local fast path for committed changes.
    subscriptions: SubscriptionManager,

    /// Background tasks, aborted on shutdown.
    tasks: Arc<std::sync::Mutex<Vec<tokio::task::JoinHandle<()>>>>,

    process_id: Arc<str>,

    feed_poll_interval: Duration,
}

impl CounterStore {
    /// Opens or creates the store at `path` with default configuration.
    pub async fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        Self::open_with_config(path, StoreConfig::default()).await
    }

    /// Opens or creates the store at `path`.
    pub async fn open_with_config<P: AsRef<Path>>(path: P, config: StoreConfig) -> Result<Self> {
        Self::open_internal(path.as_ref().to_path_buf(), config).await
    }

    async fn open_internal(path: PathBuf, config: StoreConfig) -> Result<Self> {
        let (read_tx, read_rx) = mpsc::channel(READ_CHANNEL_SIZE);

        let db = Database::open_seeded(&path, &config.initial_value)
            .map_err(|e| match e {
                Error::Sqlite(e) => Error::StoreUnavailable(e.to_string()),
                other => other,
            })?;
        db.set_busy_timeout(config.busy_timeout)?;

        let subscriptions = SubscriptionManager::default();
        let writer = spawn_writer(
            db.into_connection(),
            subscriptions.clone(),
            WriterConfig {
                batch_timeout: config.batch_timeout,
                process_id: config.process_id.clone(),
                ..WriterConfig::default()
            },
        )?;

        let reader_count = available_parallelism()
            .map(|n| n.get())
            .unwrap_or(MIN_READ_THREADS)
            .clamp(MIN_READ_THREADS, MAX_READ_THREADS);

        // Threads compete to receive from the shared channel.
        let read_rx = Arc::new(std::sync::Mutex::new(read_rx));

        let mut reader_handles = Vec::with_capacity(reader_count);
        for i in 0..reader_count {
            let conn = Connection::open_with_flags(
                &path,
                OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
            )
            .map_err(|e| Error::StoreUnavailable(format!("failed to open reader connection: {e}")))?;
            conn.busy_timeout(config.busy_timeout)?;

            let rt = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
                .map_err(|e| Error::StoreUnavailable(format!("failed to create reader runtime: {e}")))?;

            let rx = Arc::clone(&read_rx);
            let handle = thread::Builder::new()
                .name(format!("counterd-reader-{i}"))
                .spawn(move || rt.block_on(reader::run_reader_pooled(conn, rx)))
                .map_err(|e| Error::StoreUnavailable(format!("failed to spawn reader thread: {e}")))?;

            reader_handles.push(handle);
        }

        let store = Self {
            writer,
            read_tx,
            reader_handles: Arc::new(Mutex::new(reader_handles)),
            reader_count,
            subscriptions,
            tasks: Arc::new(std::sync::Mutex::new(Vec::new())),
            process_id: Arc::from(config.process_id.as_str()),
            feed_poll_interval: config.feed_poll_interval,
        };

        if let Some(keep) = config.log_retention {
            store.spawn_prune_task(keep);
        }
        if let Some(every) = config.history_interval {
            store.spawn_history_task(every);
        }

        info!(
            path = %path.display(),
            process_id = %store.process_id,
            readers = reader_count,
            "counter store opened"
        );

        Ok(store)
    }

    /// Spawns the background log pruning task.
    fn spawn_prune_task(&self, keep: u64) {
        let writer = self.writer.clone();
        self.track(tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(PRUNE_INTERVAL_SECS));

            // Skip the first immediate tick
            interval.tick().await;

            loop {
                interval.tick().await;

                match writer.prune_log(keep).await {
                    Ok(0) => {}
                    Ok(deleted) => info!(deleted, keep, "pruned counter log"),
                    Err(e) => warn!(error = %e, "counter log pruning failed"),
                }
            }
        }));
    }

    /// Spawns the background history snapshot task.
    fn spawn_history_task(&self, every: Duration) {
        let writer = self.writer.clone();
        self.track(tokio::spawn(async move {
            let mut interval = tokio::time::interval(every);

            loop {
                interval.tick().await;

                match writer.snapshot_history(current_time_ms()).await {
                    Ok(point) => debug!(count = %point.count, "recorded history snapshot"),
                    Err(e) => warn!(error = %e, "history snapshot failed"),
                }
            }
        }));
    }

    fn track(&self, handle: tokio::task::JoinHandle<()>) {
        if let Ok(mut tasks) = self.tasks.lock() {
            tasks.push(handle);
        }
    }

    /// Sends a read request to the pool and awaits the answer.
    async fn read<T>(&self, make: impl FnOnce(oneshot::Sender<Result<T>>) -> ReadRequest) -> Result<T> {
        read_request(&self.read_tx, make).await
    }

    /// Returns the number of reader threads in the pool.
    pub fn reader_count(&self) -> usize {
        self.reader_count
    }

    /// This process's identity in shared tables.
    pub fn process_id(&self) -> &str {
        &self.process_id
    }

    // =========================================================================
    // Counter
    // =========================================================================

    /// Current value and the position that produced it.
    ///
    /// Reflects every operation committed by any process before the call.
    pub async fn get(&self) -> Result<CounterSnapshot> {
        self.read(|response| ReadRequest::GetCounter { response }).await
    }

    /// Position of the newest change.
    pub async fn head_pos(&self) -> Result<LogPos> {
        Ok(self.get().await?.pos)
    }

    /// Atomically applies `delta`.
    ///
    /// # Errors
    ///
    /// - `MalformedMessage` for `Add(0)` or `Multiply(n < 2)`
    /// - `StoreUnavailable` if the store could not take the write; the delta
    ///   was not applied
    pub async fn apply_delta(&self, delta: Delta, attribution: Attribution) -> Result<ApplyResult> {
        self.writer.apply(StoreOp::Apply { delta, attribution }).await
    }

    /// Atomically: checks and stamps the user's rate limit, consumes the
    /// payment intent, and multiplies. All or nothing.
    ///
    /// # Errors
    ///
    /// - `RateLimited` if the user multiplied within `window`
    /// - `DuplicatePayment` if the intent already paid for a multiply
    /// - `StoreUnavailable` if the store could not take the write
    pub async fn multiply_once(
        &self,
        user_id: UserId,
        payment_intent_id: PaymentIntentId,
        factor: u64,
        window: Duration,
        attribution: Attribution,
    ) -> Result<ApplyResult> {
        self.writer
            .apply(StoreOp::MultiplyOnce {
                user_id,
                payment_intent_id,
                factor,
                window_ms: window.as_millis() as u64,
                attribution,
            })
            .await
    }

    // =========================================================================
    // Rate Limit & Payments
    // =========================================================================

    /// Remaining wait before `user_id` may multiply again, if any.
    pub async fn multiply_retry_after(&self, user_id: &UserId, window: Duration) -> Result<Option<Duration>> {
        let user_id = user_id.clone();
        let window_ms = window.as_millis() as u64;
        let now_ms = current_time_ms();
        let wait = self
            .read(|response| ReadRequest::MultiplyRetryAfter {
                user_id,
                window_ms,
                now_ms,
                response,
            })
            .await?;
        Ok(wait.map(Duration::from_millis))
    }

    /// Rate-limit test-and-set without multiplying.
    pub async fn record_multiply(&self, user_id: &UserId, at_ms: u64, window: Duration) -> Result<()> {
        self.writer
            .record_multiply(user_id.clone(), at_ms, window.as_millis() as u64)
            .await
    }

    /// Whether a payment intent already paid for a multiply.
    pub async fn is_payment_consumed(&self, payment_intent_id: &PaymentIntentId) -> Result<bool> {
        let payment_intent_id = payment_intent_id.as_str().to_string();
        self.read(|response| ReadRequest::IsPaymentConsumed {
            payment_intent_id,
            response,
        })
        .await
    }

    /// Records a payment the provider reported as succeeded.
    ///
    /// Every process sharing the store sees it, and it survives restarts.
    pub async fn confirm_payment(
        &self,
        payment_intent_id: impl Into<PaymentIntentId>,
        amount: u64,
        currency: &str,
    ) -> Result<()> {
        self.record_payment(
            payment_intent_id,
            VerifiedPayment {
                amount,
                currency: currency.to_ascii_lowercase(),
                status: PaymentStatus::Succeeded,
                consumed: false,
            },
        )
        .await
    }

    /// Records a payment in any provider state. `payment.consumed` is
    /// ignored; consumption is decided by multiplies only.
    pub async fn record_payment(
        &self,
        payment_intent_id: impl Into<PaymentIntentId>,
        payment: VerifiedPayment,
    ) -> Result<()> {
        self.writer
            .confirm_payment(payment_intent_id.into(), payment)
            .await
    }

    /// A confirmed payment, if the webhook reported it on any process.
    pub async fn payment(&self, payment_intent_id: &PaymentIntentId) -> Result<Option<VerifiedPayment>> {
        let payment_intent_id = payment_intent_id.as_str().to_string();
        self.read(|response| ReadRequest::GetPayment {
            payment_intent_id,
            response,
        })
        .await
    }

    // =========================================================================
    // Change Feed
    // =========================================================================

    /// Reads log rows with `pos >= from`.
    pub async fn read_log(&self, from: LogPos, limit: usize) -> Result<Vec<CounterChange>> {
        self.read(|response| ReadRequest::ReadLog { from, limit, response })
            .await
    }

    /// Feed of every change committed after the current head, from every
    /// process.
    pub async fn subscribe(&self) -> Result<ChangeFeed> {
        // Receiver first: a change committed between the two steps is then
        // either below the head (skipped) or on the receiver.
        let receiver = self.subscriptions.subscribe();
        let head = self.head_pos().await?;
        Ok(self.feed_from(head, receiver))
    }

    /// Feed of every change with `pos > after`.
    pub fn subscribe_after(&self, after: LogPos) -> ChangeFeed {
        self.feed_from(after, self.subscriptions.subscribe())
    }

    fn feed_from(
        &self,
        after: LogPos,
        receiver: tokio::sync::broadcast::Receiver<Arc<CounterChange>>,
    ) -> ChangeFeed {
        let read_tx = self.read_tx.clone();
        ChangeFeed::new(
            after,
            receiver,
            move |from, limit| {
                let read_tx = read_tx.clone();
                async move {
                    read_request(&read_tx, |response| ReadRequest::ReadLog { from, limit, response }).await
                }
            },
            DEFAULT_FEED_BATCH_SIZE,
            self.feed_poll_interval,
        )
    }

    // =========================================================================
    // Presence
    // =========================================================================

    /// Publishes this process's viewer count.
    pub async fn publish_presence(&self, viewers: u64) -> Result<()> {
        self.writer.publish_presence(viewers).await
    }

    /// Removes this process's presence row.
    pub async fn remove_presence(&self) -> Result<()> {
        self.writer.remove_presence().await
    }

    /// Sum of viewer counts other processes published at or after
    /// `since_ms`.
    pub async fn viewer_total(&self, since_ms: u64) -> Result<u64> {
        let exclude_process = self.process_id.to_string();
        self.read(|response| ReadRequest::ViewerTotal {
            exclude_process,
            since_ms,
            response,
        })
        .await
    }

    // =========================================================================
    // History & Maintenance
    // =========================================================================

    /// Records a history snapshot of the current value now.
    pub async fn snapshot_history(&self) -> Result<HistoryPoint> {
        self.writer.snapshot_history(current_time_ms()).await
    }

    /// History for `range`, newest first.
    pub async fn read_history(&self, range: HistoryRange) -> Result<Vec<HistoryPoint>> {
        let now_ms = current_time_ms();
        self.read(|response| ReadRequest::ReadHistory {
            range,
            now_ms,
            response,
        })
        .await
    }

    /// Deletes all but the newest `keep` log rows.
    pub async fn prune_log(&self, keep: u64) -> Result<usize> {
        self.writer.prune_log(keep).await
    }

    /// Shuts down the store gracefully.
    ///
    /// 1. Aborts background tasks
    /// 2. Flushes and stops the writer (ends change feeds)
    /// 3. Stops and joins the reader threads
    ///
    /// After shutdown, every operation on any clone fails with
    /// `StoreUnavailable`.
    pub async fn shutdown(self) {
        if let Ok(mut tasks) = self.tasks.lock() {
            for task in tasks.drain(..) {
                task.abort();
            }
        }

        self.writer.shutdown().await;

        for _ in 0..self.reader_count {
            let _ = self.read_tx.send(ReadRequest::Shutdown).await;
        }

        let handles = std::mem::take(&mut *self.reader_handles.lock().await);
        for handle in handles {
            let _ = handle.join();
        }

        info!(process_id = %self.process_id, "counter store shut down");
    }
}

/// Sends a read request and awaits its response.
async fn read_request<T>(
    read_tx: &mpsc::Sender<ReadRequest>,
    make: impl FnOnce(oneshot::Sender<Result<T>>) -> ReadRequest,
) -> Result<T> {
    let (response_tx, response_rx) = oneshot::channel();

    read_tx
        .send(make(response_tx))
        .await
        .map_err(|_| Error::StoreUnavailable("reader thread has shut down".to_string()))?;

    response_rx
        .await
        .map_err(|_| Error::StoreUnavailable("reader dropped response channel".to_string()))?
}

// =============================================================================
// Tests
// =============================================================================

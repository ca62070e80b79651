//! # Store Reader
//!
//! Read operations against the shared store. Each query runs directly
//! against SQLite on a read-only connection, so it always sees the latest
//! state committed by any process (WAL mode).
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                       Reader Pool                               │
//! │                                                                 │
//! │  ┌─────────┐  ┌─────────┐  ┌─────────┐  ┌─────────┐             │
//! │  │Reader 1 │  │Reader 2 │  │Reader 3 │  │Reader N │             │
//! │  │(thread) │  │(thread) │  │(thread) │  │(thread) │             │
//! │  └────┬────┘  └────┬────┘  └────┬────┘  └────┬────┘             │
//! │       └────────────┴─────┬──────┴────────────┘                  │
//! │                  Read-only SQLite connections                   │
//! └──────────────────────────┬──────────────────────────────────────┘
//!                            ▼
//!                    ┌───────────────┐
//!                    │ SQLite (WAL)  │ ◄── writers of every process
//!                    └───────────────┘
//! ```
//!
//! ## Why no caches?
//!
//! Other processes write the same file. Any value cached here would be stale
//! the moment another process commits, so every read goes to SQLite.

use std::sync::Arc;

use rusqlite::{params, Connection, OptionalExtension};
use tokio::sync::{mpsc, oneshot};

use crate::error::Result;
use crate::payment::{PaymentStatus, VerifiedPayment};
use crate::types::{
    BigCount, CounterChange, CounterSnapshot, CountryCode, Delta, Granularity, HistoryPoint,
    HistoryRange, LogPos, UserId,
};

const HOUR_MS: u64 = 3_600_000;
const DAY_MS: u64 = 24 * HOUR_MS;
const WEEK_MS: u64 = 7 * DAY_MS;

// =============================================================================
// Request Types
// =============================================================================

/// Request type for read operations.
pub enum ReadRequest {
    /// Current counter value and position.
    GetCounter {
        response: oneshot::Sender<Result<CounterSnapshot>>,
    },
    /// Log rows with `pos >= from`.
    ReadLog {
        from: LogPos,
        limit: usize,
        response: oneshot::Sender<Result<Vec<CounterChange>>>,
    },
    /// Milliseconds until `user_id` may multiply again, if limited.
    MultiplyRetryAfter {
        user_id: UserId,
        window_ms: u64,
        now_ms: u64,
        response: oneshot::Sender<Result<Option<u64>>>,
    },
    /// Whether a payment intent already paid for a multiply.
    IsPaymentConsumed {
        payment_intent_id: String,
        response: oneshot::Sender<Result<bool>>,
    },
    /// A confirmed payment and whether a multiply already used it.
    GetPayment {
        payment_intent_id: String,
        response: oneshot::Sender<Result<Option<VerifiedPayment>>>,
    },
    /// Sum of fresh viewer counts published by other processes.
    ViewerTotal {
        exclude_process: String,
        since_ms: u64,
        response: oneshot::Sender<Result<u64>>,
    },
    /// History points for a range, newest first.
    ReadHistory {
        range: HistoryRange,
        now_ms: u64,
        response: oneshot::Sender<Result<Vec<HistoryPoint>>>,
    },
    /// Shutdown the reader.
    Shutdown,
}

// =============================================================================
// Direct Read Functions
// =============================================================================

/// Reads the authoritative counter value and the position that produced it.
pub fn get_counter(conn: &Connection) -> Result<CounterSnapshot> {
    let (value, pos): (String, i64) = conn.query_row(
        "SELECT value, last_pos FROM counter WHERE id = 1",
        [],
        |row| Ok((row.get(0)?, row.get(1)?)),
    )?;

    Ok(CounterSnapshot {
        value: BigCount::parse(&value)?,
        pos: LogPos::from_raw(pos as u64),
    })
}

/// Reads log rows with `pos >= from`, in position order.
///
/// Rows below the pruning horizon are gone; the first row returned may be
/// later than `from`.
pub fn read_log(conn: &Connection, from: LogPos, limit: usize) -> Result<Vec<CounterChange>> {
    let mut stmt = conn.prepare_cached(
        "SELECT pos, value, kind, operand, user_id, country_code, ts_ms
         FROM counter_log WHERE pos >= ? ORDER BY pos LIMIT ?",
    )?;

    let rows = stmt.query_map(params![from.as_raw() as i64, limit as i64], |row| {
        Ok((
            row.get::<_, i64>(0)?,
            row.get::<_, String>(1)?,
            row.get::<_, String>(2)?,
            row.get::<_, i64>(3)?,
            row.get::<_, Option<String>>(4)?,
            row.get::<_, Option<String>>(5)?,
            row.get::<_, i64>(6)?,
        ))
    })?;

    let mut changes = Vec::new();
    for row in rows {
        let (pos, value, kind, operand, user_id, country_code, ts_ms) = row?;
        changes.push(CounterChange {
            pos: LogPos::from_raw(pos as u64),
            value: BigCount::parse(&value)?,
            delta: Delta::from_parts(&kind, operand as u64)?,
            user_id: user_id.map(UserId::from),
            country_code: country_code.map(CountryCode::from),
            timestamp_ms: ts_ms as u64,
        });
    }

    Ok(changes)
}

/// Returns the remaining wait if `user_id` multiplied within `window_ms`.
pub fn multiply_retry_after(conn: &Connection, user_id: &UserId, window_ms: u64, now_ms: u64) -> Result<Option<u64>> {
    let last: Option<i64> = conn
        .query_row(
            "SELECT last_multiply_ms FROM multiply_limits WHERE user_id = ?",
            [user_id.as_str()],
            |row| row.get(0),
        )
        .optional()?;

    Ok(last.and_then(|last| {
        let elapsed = now_ms.saturating_sub(last.max(0) as u64);
        (elapsed < window_ms).then(|| window_ms - elapsed)
    }))
}

/// Whether a payment intent already paid for a multiply.
pub fn is_payment_consumed(conn: &Connection, payment_intent_id: &str) -> Result<bool> {
    let found = conn
        .query_row(
            "SELECT 1 FROM consumed_payments WHERE payment_intent_id = ?",
            [payment_intent_id],
            |_| Ok(()),
        )
        .optional()?;
    Ok(found.is_some())
}

/// Reads a payment confirmed by the webhook on any process.
///
/// `consumed` is true once a multiply paid by this intent has committed.
pub fn get_payment(conn: &Connection, payment_intent_id: &str) -> Result<Option<VerifiedPayment>> {
    let row = conn
        .query_row(
            "SELECT p.amount, p.currency, p.status, c.payment_intent_id IS NOT NULL
             FROM confirmed_payments p
             LEFT JOIN consumed_payments c ON c.payment_intent_id = p.payment_intent_id
             WHERE p.payment_intent_id = ?",
            [payment_intent_id],
            |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, bool>(3)?,
                ))
            },
        )
        .optional()?;

    row.map(|(amount, currency, status, consumed)| {
        Ok(VerifiedPayment {
            amount: amount.max(0) as u64,
            currency,
            status: status.parse::<PaymentStatus>()?,
            consumed,
        })
    })
    .transpose()
}

/// Sums viewer counts of other processes updated at or after `since_ms`.
///
/// Rows older than that belong to processes that stopped publishing
/// (crashed or partitioned) and are ignored.
pub fn viewer_total(conn: &Connection, exclude_process: &str, since_ms: u64) -> Result<u64> {
    let total: i64 = conn.query_row(
        "SELECT COALESCE(SUM(viewers), 0) FROM viewer_presence WHERE process_id != ? AND updated_ms >= ?",
        params![exclude_process, since_ms as i64],
        |row| row.get(0),
    )?;
    Ok(total.max(0) as u64)
}

/// Reads history for a range, newest first.
///
/// Each range stitches the finest granularity available for each age:
///
/// | Range | detailed | hourly | daily |
/// |-------|----------|--------|-------|
/// | hour | last 1h | - | - |
/// | day | last 1h | 1h..1d | - |
/// | week | last 1h | 1h..1d | 1d..7d |
/// | all | - | - | everything |
pub fn read_history(conn: &Connection, range: HistoryRange, now_ms: u64) -> Result<Vec<HistoryPoint>> {
    let hour_ago = now_ms.saturating_sub(HOUR_MS);
    let day_ago = now_ms.saturating_sub(DAY_MS);
    let week_ago = now_ms.saturating_sub(WEEK_MS);

    // (granularity, from inclusive, until exclusive)
    let segments: Vec<(Granularity, u64, Option<u64>)> = match range {
        HistoryRange::Hour => vec![(Granularity::Detailed, hour_ago, None)],
        HistoryRange::Day => vec![
            (Granularity::Detailed, hour_ago, None),
            (Granularity::Hourly, day_ago, Some(hour_ago)),
        ],
        HistoryRange::Week => vec![
            (Granularity::Detailed, hour_ago, None),
            (Granularity::Hourly, day_ago, Some(hour_ago)),
            (Granularity::Daily, week_ago, Some(day_ago)),
        ],
        HistoryRange::All => vec![(Granularity::Daily, 0, None)],
    };

    let mut stmt = conn.prepare_cached(
        "SELECT ts_ms, value FROM counter_history
         WHERE granularity = ? AND ts_ms >= ? AND ts_ms < ?
         ORDER BY ts_ms DESC",
    )?;

    let mut points = Vec::new();
    for (granularity, from, until) in segments {
        let until = until.map_or(i64::MAX, |u| u as i64);
        let rows = stmt.query_map(params![granularity.as_str(), from as i64, until], |row| {
            Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?))
        })?;

        for row in rows {
            let (ts_ms, value) = row?;
            points.push(HistoryPoint {
                count: BigCount::parse(&value)?,
                timestamp: ts_ms as u64,
            });
        }
    }

    points.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
    Ok(points)
}

// =============================================================================
// Reader Loop
// =============================================================================

/// Pooled reader loop.
///
/// Multiple threads share the channel via `Arc<Mutex>`. Each thread has its
/// own read-only SQLite connection, so queries run in parallel; whichever
/// thread is free picks up the next request.
pub async fn run_reader_pooled(conn: Connection, rx: Arc<std::sync::Mutex<mpsc::Receiver<ReadRequest>>>) {
    loop {
        let request = {
            let Ok(mut guard) = rx.lock() else {
                break;
            };
            guard.recv().await
        };

        match request {
            Some(ReadRequest::GetCounter { response }) => {
                let _ = response.send(get_counter(&conn));
            }
            Some(ReadRequest::ReadLog { from, limit, response }) => {
                let _ = response.send(read_log(&conn, from, limit));
            }
            Some(ReadRequest::MultiplyRetryAfter {
                user_id,
                window_ms,
                now_ms,
                response,
            }) => {
                let _ = response.send(multiply_retry_after(&conn, &user_id, window_ms, now_ms));
            }
            Some(ReadRequest::IsPaymentConsumed {
                payment_intent_id,
                response,
            }) => {
                let _ = response.send(is_payment_consumed(&conn, &payment_intent_id));
            }
            Some(ReadRequest::GetPayment {
                payment_intent_id,
                response,
            }) => {
                let _ = response.send(get_payment(&conn, &payment_intent_id));
            }
            Some(ReadRequest::ViewerTotal {
                exclude_process,
                since_ms,
                response,
            }) => {
                let _ = response.send(viewer_total(&conn, &exclude_process, since_ms));
            }
            Some(ReadRequest::ReadHistory {
                range,
                now_ms,
                response,
            }) => {
                let _ = response.send(read_history(&conn, range, now_ms));
            }
            Some(ReadRequest::Shutdown) | None => break,
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

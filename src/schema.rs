//! # SQLite Schema for counterd
//!
//! The shared store is one SQLite database in WAL mode. Every server process
//! opens the same file; SQLite's database-wide write lock (taken by
//! `BEGIN IMMEDIATE`) is what serializes counter updates across processes.
//!
//! ## Table Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                           Schema Overview                               │
//! ├─────────────────────────────────────────────────────────────────────────┤
//! │                                                                         │
//! │  counter (1 row)        counter_log                 counter_history     │
//! │  ┌──────────────┐       ┌───────────────────┐       ┌───────────────┐   │
//! │  │ value  TEXT  │       │ pos (PK, AUTOINC) │       │ ts_ms         │   │
//! │  │ last_pos ────┼──────►│ value TEXT        │       │ granularity   │   │
//! │  │ updated_ms   │       │ kind, operand     │       │ value TEXT    │   │
//! │  └──────────────┘       │ user_id, country  │       └───────────────┘   │
//! │                         └───────────────────┘                           │
//! │                                                                         │
//! │  multiply_limits        consumed_payments          viewer_presence      │
//! │  ┌──────────────────┐   ┌───────────────────────┐  ┌────────────────┐   │
//! │  │ user_id (PK)     │   │ payment_intent_id (PK)│  │ process_id (PK)│   │
//! │  │ last_multiply_ms │   │ user_id, factor, pos  │  │ viewers        │   │
//! │  └──────────────────┘   └───────────────────────┘  │ updated_ms     │   │
//! │                         confirmed_payments         └────────────────┘   │
//! │                         ┌───────────────────────┐                       │
//! │                         │ payment_intent_id (PK)│                       │
//! │                         │ amount, currency      │                       │
//! │                         │ status, confirmed_ms  │                       │
//! │                         └───────────────────────┘                       │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Design Decisions
//!
//! ### Why decimal TEXT for the value?
//!
//! The counter outgrows every SQLite numeric type. TEXT keeps it exact and
//! human-readable, and the wire format is decimal anyway.
//!
//! ### Why keep the value in every log row?
//!
//! A subscriber that missed rows (lag, pruning, reconnect) only ever needs the
//! latest row to be correct again. Rows are self-contained.

use std::path::Path;
use std::time::Duration;

use rusqlite::Connection;

use crate::types::BigCount;
use crate::{Error, Result};

// =============================================================================
// Schema Version
// =============================================================================

/// Current schema version. Increment when making breaking schema changes.
const SCHEMA_VERSION: i32 = 1;

/// How long a connection waits for another process's write lock before
/// giving up with `SQLITE_BUSY`.
pub const DEFAULT_BUSY_TIMEOUT: Duration = Duration::from_secs(5);

// =============================================================================
// DDL Statements
// =============================================================================

/// The authoritative counter value. Exactly one row (`id = 1`).
///
/// - `last_pos`: position of the log row that produced `value` (0 = none)
const CREATE_COUNTER: &str = r#"
CREATE TABLE IF NOT EXISTS counter (
    id         INTEGER PRIMARY KEY CHECK (id = 1),
    value      TEXT    NOT NULL,
    last_pos   INTEGER NOT NULL,
    updated_ms INTEGER NOT NULL
)
"#;

/// Append-only change feed, one row per applied operation.
///
/// `AUTOINCREMENT` guarantees positions are never reused, even after the
/// oldest rows are pruned.
const CREATE_COUNTER_LOG: &str = r#"
CREATE TABLE IF NOT EXISTS counter_log (
    pos          INTEGER PRIMARY KEY AUTOINCREMENT,
    value        TEXT    NOT NULL,
    kind         TEXT    NOT NULL,
    operand      INTEGER NOT NULL,
    user_id      TEXT,
    country_code TEXT,
    process_id   TEXT    NOT NULL,
    ts_ms        INTEGER NOT NULL
)
"#;

/// Rate-limit gate and historical record: one row per user who ever
/// multiplied. Rows are updated, never deleted.
const CREATE_MULTIPLY_LIMITS: &str = r#"
CREATE TABLE IF NOT EXISTS multiply_limits (
    user_id          TEXT PRIMARY KEY,
    last_multiply_ms INTEGER NOT NULL
)
"#;

/// Payment intents that already paid for a multiply.
const CREATE_CONSUMED_PAYMENTS: &str = r#"
CREATE TABLE IF NOT EXISTS consumed_payments (
    payment_intent_id TEXT PRIMARY KEY,
    user_id           TEXT    NOT NULL,
    factor            INTEGER NOT NULL,
    pos               INTEGER NOT NULL,
    consumed_ms       INTEGER NOT NULL
)
"#;

/// Payment intents the provider reported as paid, via the webhook.
///
/// Written by whichever process received the webhook; read by whichever
/// process the paying client is connected to.
const CREATE_CONFIRMED_PAYMENTS: &str = r#"
CREATE TABLE IF NOT EXISTS confirmed_payments (
    payment_intent_id TEXT PRIMARY KEY,
    amount            INTEGER NOT NULL,
    currency          TEXT    NOT NULL,
    status            TEXT    NOT NULL,
    confirmed_ms      INTEGER NOT NULL
)
"#;

/// Per-process viewer counts, summed for the global viewer count.
const CREATE_VIEWER_PRESENCE: &str = r#"
CREATE TABLE IF NOT EXISTS viewer_presence (
    process_id TEXT PRIMARY KEY,
    viewers    INTEGER NOT NULL,
    updated_ms INTEGER NOT NULL
)
"#;

/// Periodic snapshots of the counter for the history chart.
const CREATE_COUNTER_HISTORY: &str = r#"
CREATE TABLE IF NOT EXISTS counter_history (
    ts_ms       INTEGER NOT NULL,
    granularity TEXT    NOT NULL,
    value       TEXT    NOT NULL,
    PRIMARY KEY (ts_ms, granularity)
)
"#;

/// Metadata table for schema versioning.
const CREATE_METADATA: &str = r#"
CREATE TABLE IF NOT EXISTS counter_metadata (
    key   TEXT PRIMARY KEY,
    value TEXT NOT NULL
)
"#;

// =============================================================================
// Database Wrapper
// =============================================================================

/// A SQLite connection with the counterd schema initialized.
///
/// # Ownership
///
/// `Database` owns its `Connection`; hand it to the writer with
/// [`Database::into_connection`].
#[derive(Debug)]
pub struct Database {
    conn: Connection,
}

impl Database {
    /// Opens (creating if necessary) a store file with a zero counter.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        Self::open_seeded(path, &BigCount::zero())
    }

    /// Opens a store file; `initial` becomes the counter value only if the
    /// counter row does not exist yet.
    ///
    /// Safe to call concurrently from several processes: every statement is
    /// idempotent and lock waits are bounded by [`DEFAULT_BUSY_TIMEOUT`].
    pub fn open_seeded(path: impl AsRef<Path>, initial: &BigCount) -> Result<Self> {
        let conn = Connection::open(path)?;
        let mut db = Self { conn };
        db.initialize(initial)?;
        Ok(db)
    }

    /// Creates an in-memory database for unit tests.
    ///
    /// In-memory databases are private to one connection, so they cannot be
    /// shared with reader threads or other processes.
    pub fn open_in_memory() -> Result<Self> {
        Self::open_in_memory_seeded(&BigCount::zero())
    }

    /// In-memory database with a seeded counter.
    pub fn open_in_memory_seeded(initial: &BigCount) -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        let mut db = Self { conn };
        db.initialize(initial)?;
        Ok(db)
    }

    /// Sets how long this connection waits on another writer's lock.
    pub fn set_busy_timeout(&self, timeout: Duration) -> Result<()> {
        self.conn.busy_timeout(timeout)?;
        Ok(())
    }

    /// Consumes the wrapper, returning the connection.
    pub fn into_connection(self) -> Connection {
        self.conn
    }

    fn initialize(&mut self, initial: &BigCount) -> Result<()> {
        // Must precede everything else: another process may be initializing
        // the same file right now.
        self.conn.busy_timeout(DEFAULT_BUSY_TIMEOUT)?;

        // WAL: readers see the last committed state while a writer works,
        // and several processes can share the file.
        self.conn.execute_batch("PRAGMA journal_mode = WAL")?;
        self.conn.execute_batch("PRAGMA synchronous = NORMAL")?;

        self.conn.execute_batch(CREATE_METADATA)?;
        self.conn.execute_batch(CREATE_COUNTER)?;
        self.conn.execute_batch(CREATE_COUNTER_LOG)?;
        self.conn.execute_batch(CREATE_MULTIPLY_LIMITS)?;
        self.conn.execute_batch(CREATE_CONSUMED_PAYMENTS)?;
        self.conn.execute_batch(CREATE_CONFIRMED_PAYMENTS)?;
        self.conn.execute_batch(CREATE_VIEWER_PRESENCE)?;
        self.conn.execute_batch(CREATE_COUNTER_HISTORY)?;

        self.conn.execute(
            "INSERT OR IGNORE INTO counter (id, value, last_pos, updated_ms) VALUES (1, ?, 0, 0)",
            [initial.to_string()],
        )?;

        self.verify_or_set_version()?;

        Ok(())
    }

    /// Records the schema version on a new file, or checks it on an existing
    /// one. `INSERT OR IGNORE` lets two processes race on a fresh file.
    fn verify_or_set_version(&mut self) -> Result<()> {
        self.conn.execute(
            "INSERT OR IGNORE INTO counter_metadata (key, value) VALUES ('schema_version', ?)",
            [SCHEMA_VERSION.to_string()],
        )?;

        let stored: String = self.conn.query_row(
            "SELECT value FROM counter_metadata WHERE key = 'schema_version'",
            [],
            |row| row.get(0),
        )?;

        match stored.parse::<i32>() {
            Ok(v) if v == SCHEMA_VERSION => Ok(()),
            _ => Err(Error::Schema(format!(
                "schema version mismatch: store has version {stored}, but this build requires {SCHEMA_VERSION}"
            ))),
        }
    }

    /// Returns a reference to the underlying connection.
    #[cfg(test)]
    pub fn connection(&self) -> &Connection {
        &self.conn
    }
}

// =============================================================================
// Tests
// =============================================================================

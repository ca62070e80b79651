//! # Error Handling for counterd
//!
//! One error enum ([`Error`]) covers every failure mode of the engine: client
//! protocol mistakes, business-rule rejections, collaborator failures and
//! store failures. Callers match on it; sessions turn it into a wire frame.
//!
//! ## Rust Pattern: thiserror
//!
//! `thiserror` derives `Display` from the `#[error(...)]` attributes and
//! `From` impls from `#[from]`, so `?` converts `rusqlite::Error` for free.
//!
//! ## Error Categories
//!
//! | Category | Variants | Connection | Response |
//! |----------|----------|------------|----------|
//! | Client | `MalformedMessage`, `Unauthorized`, `TooManyPending` | stays open | error frame |
//! | Business rule | `RateLimited`, `DuplicatePayment` | stays open | error / rate_limited frame |
//! | Collaborator | `PaymentRejected`, `PaymentTimeout` | stays open | error frame |
//! | Systemic | `StoreUnavailable`, `Sqlite`, `Schema` | stays open | generic retry frame, logged |
//! | Transport | `SlowConsumer`, `ClientClosed` | torn down | none |
//!
//! Rejections never reach other sessions: the frame goes to the originating
//! session only.

use thiserror::Error;

use crate::codec::ServerMessage;

/// Substring clients pattern-match on to detect the daily multiply limit.
pub const RATE_LIMIT_MESSAGE: &str = "you can only multiply once per day";

/// Text sent to clients for systemic failures; details stay in the logs.
pub const STORE_UNAVAILABLE_MESSAGE: &str = "the counter is temporarily unavailable, please retry";

// =============================================================================
// Error Type
// =============================================================================

/// All errors that can occur in counterd operations.
#[derive(Error, Debug)]
pub enum Error {
    // =========================================================================
    // Client Errors (connection stays open)
    // =========================================================================

    /// The inbound frame was not valid JSON, had an unknown `type`, or lacked
    /// a required field.
    #[error("malformed message: {0}")]
    MalformedMessage(String),

    /// A multiply arrived without an authenticated user id.
    #[error("you must be signed in to multiply")]
    Unauthorized,

    /// The session already has the maximum number of operations waiting to
    /// be applied.
    #[error("too many operations in flight, slow down")]
    TooManyPending,

    // =========================================================================
    // Business Rule Rejections
    // =========================================================================

    /// The user already multiplied inside the rolling window.
    ///
    /// The display text always contains [`RATE_LIMIT_MESSAGE`].
    #[error("you can only multiply once per day")]
    RateLimited {
        /// Milliseconds until the user may multiply again.
        retry_after_ms: u64,
    },

    /// The payment intent was already used by an earlier multiply.
    ///
    /// # Systems Concept: Idempotency Keys
    ///
    /// The payment intent id is the idempotency key of a multiply. The
    /// `consumed_payments` table is written in the same transaction as the
    /// multiply itself, so an intent is consumed exactly when its
    /// multiplication is applied.
    #[error("payment '{payment_intent_id}' has already been used")]
    DuplicatePayment {
        /// The replayed payment intent.
        payment_intent_id: String,
    },

    // =========================================================================
    // Collaborator Failures
    // =========================================================================

    /// The payment verifier reported the intent as invalid or unconfirmed,
    /// or the verified amount/currency does not match the request.
    #[error("payment rejected: {0}")]
    PaymentRejected(String),

    /// The payment verifier did not answer before the deadline. Nothing was
    /// mutated.
    #[error("payment verification timed out, please try again")]
    PaymentTimeout,

    // =========================================================================
    // Systemic Errors (logged, surfaced generically)
    // =========================================================================

    /// The shared store could not be reached, was locked past the busy
    /// timeout, or the writer actor is gone. The operation was not applied.
    #[error("store unavailable: {0}")]
    StoreUnavailable(String),

    /// SQLite operation failed.
    ///
    /// # Rust Pattern: #[from]
    ///
    /// Generates `impl From<rusqlite::Error> for Error`, which lets `?`
    /// convert driver errors inside the writer and reader threads.
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// Schema version mismatch or corrupted row contents.
    #[error("schema error: {0}")]
    Schema(String),

    /// Invalid configuration value.
    #[error("config error: {0}")]
    Config(String),

    // =========================================================================
    // Transport
    // =========================================================================

    /// A session's outbound queue overflowed and the session was dropped.
    #[error("slow consumer: outbound queue full")]
    SlowConsumer,

    /// The client's connection loop has stopped; nothing more can be sent.
    #[error("client connection closed")]
    ClientClosed,
}

impl Error {
    /// Returns true for failures of the shared store rather than of the
    /// request itself.
    pub fn is_systemic(&self) -> bool {
        matches!(
            self,
            Error::StoreUnavailable(_) | Error::Sqlite(_) | Error::Schema(_)
        )
    }

    /// Converts the error into the frame sent to the originating session.
    ///
    /// Returns `None` for [`Error::SlowConsumer`] and [`Error::ClientClosed`]:
    /// that connection is already being torn down.
    pub fn to_frame(&self) -> Option<ServerMessage> {
        match self {
            Error::SlowConsumer | Error::ClientClosed => None,
            Error::RateLimited { retry_after_ms } => Some(ServerMessage::RateLimited {
                count: format!(
                    "{RATE_LIMIT_MESSAGE}, try again in {}",
                    format_wait(*retry_after_ms)
                ),
            }),
            e if e.is_systemic() => Some(ServerMessage::Error {
                count: STORE_UNAVAILABLE_MESSAGE.to_string(),
            }),
            e => Some(ServerMessage::Error {
                count: e.to_string(),
            }),
        }
    }
}

/// Formats a wait as `"3h 12m"`, or `"less than a minute"`.
fn format_wait(ms: u64) -> String {
    let minutes = ms / 60_000;
    match (minutes / 60, minutes % 60) {
        (0, 0) => "less than a minute".to_string(),
        (0, m) => format!("{m}m"),
        (h, m) => format!("{h}h {m}m"),
    }
}

/// Maps a store-level SQLite failure to `StoreUnavailable`.
///
/// Used around `BEGIN IMMEDIATE`/`COMMIT`, where any driver error (busy lock
/// past the timeout, I/O error, full disk) means the shared store could not
/// take the write.
pub(crate) fn unavailable(err: rusqlite::Error) -> Error {
    Error::StoreUnavailable(err.to_string())
}

// =============================================================================
// Result Type Alias
// =============================================================================

/// A `Result` type alias using [`Error`] as the error type.
pub type Result<T> = std::result::Result<T, Error>;

// =============================================================================
// Tests
// =============================================================================

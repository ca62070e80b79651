//! # Per-User Multiply Rate Limit
//!
//! A user may multiply once per rolling window (24 hours by default). The
//! state lives in the shared store's `multiply_limits` table, so the limit
//! holds no matter which process a user's connection lands on.
//!
//! ## Check vs Test-and-Set
//!
//! | Operation | Connection | Atomic with |
//! |-----------|------------|-------------|
//! | [`RateLimiter::can_multiply`] | reader pool | nothing (advisory) |
//! | [`RateLimiter::record_multiply`] | writer, `BEGIN IMMEDIATE` | itself |
//! | `CounterStore::multiply_once` | writer, one savepoint | payment + apply |
//!
//! `can_multiply` only lets the processor reject early, before paying for a
//! verification round trip. The decision that counts is the test-and-set
//! inside the write transaction: two racing multiplies by the same user
//! serialize on the write lock and the second one sees the first's stamp.

use std::time::Duration;

use crate::api::CounterStore;
use crate::error::Result;
use crate::types::UserId;

/// Default rolling window between multiplies.
pub const DEFAULT_RATE_LIMIT_WINDOW: Duration = Duration::from_secs(24 * 60 * 60);

/// Rate limiter backed by the shared store.
#[derive(Clone)]
pub struct RateLimiter {
    store: CounterStore,
    window: Duration,
}

impl RateLimiter {
    /// Creates a limiter with the given window.
    pub fn new(store: CounterStore, window: Duration) -> Self {
        Self { store, window }
    }

    /// The rolling window.
    pub fn window(&self) -> Duration {
        self.window
    }

    /// True if the user never multiplied or the window has elapsed.
    pub async fn can_multiply(&self, user_id: &UserId) -> Result<bool> {
        Ok(self.retry_after(user_id).await?.is_none())
    }

    /// Remaining wait before the user may multiply again, if any.
    pub async fn retry_after(&self, user_id: &UserId) -> Result<Option<Duration>> {
        self.store.multiply_retry_after(user_id, self.window).await
    }

    /// Records a multiply at `timestamp_ms`.
    ///
    /// Test-and-set: fails with `RateLimited` (and records nothing) if the
    /// user already multiplied within the window.
    pub async fn record_multiply(&self, user_id: &UserId, timestamp_ms: u64) -> Result<()> {
        self.store
            .record_multiply(user_id, timestamp_ms, self.window)
            .await
    }
}

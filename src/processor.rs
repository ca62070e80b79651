//! # Operation Processor
//!
//! Turns one validated inbound [`Operation`] into at most one counter change.
//!
//! ## State Machine
//!
//! ```text
//!                       ┌──────────┐
//!                       │ Received │  (decoded by codec)
//!                       └────┬─────┘
//!                            ▼
//!                      ┌───────────┐
//!            ┌─────────┤ Validated ├──────────┐
//!            │         └───────────┘          │
//!       increment                          multiply
//!            │                                │
//!            │            no user ──► Unauthorized
//!            │                                │
//!            │            limited ──► RateLimited        (no verifier call)
//!            │                                │
//!            │     verify (timeout) ──► PaymentTimeout / PaymentRejected
//!            │                                │          / DuplicatePayment
//!            ▼                                ▼
//!   ┌─────────────────┐        ┌─────────────────────────────────┐
//!   │  apply_delta    │        │ multiply_once: rate-limit stamp │
//!   │  (+1)           │        │ + payment consumed + multiply   │
//!   └────────┬────────┘        │ in ONE store transaction        │
//!            │                 └───────────────┬─────────────────┘
//!            └──────────────┬──────────────────┘
//!                           ▼
//!                ┌─────────────────────┐
//!                │ Applied: attribution│ ──► change feed ──► Broadcast
//!                └─────────────────────┘
//! ```
//!
//! ## Where the slow call goes
//!
//! Payment verification is a network call that may take seconds. It runs
//! strictly before any store mutation and holds no lock. A verification that
//! times out leaves the rate limit, the consumed-payment set and the counter
//! untouched.
//!
//! ## Rejections
//!
//! Every rejection is returned to the caller (the originating session), which
//! turns it into a frame for that session only. Nothing is broadcast for a
//! rejected operation.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, error, warn};

use crate::api::CounterStore;
use crate::attribution::AttributionSink;
use crate::error::{Error, Result};
use crate::payment::{PaymentStatus, PaymentVerifier};
use crate::rate_limit::{RateLimiter, DEFAULT_RATE_LIMIT_WINDOW};
use crate::types::{ApplyResult, Attribution, AttributionRecord, Delta, Operation, PaymentIntentId, UserId};

/// Default deadline for one payment verification.
pub const DEFAULT_PAYMENT_TIMEOUT: Duration = Duration::from_secs(10);

/// Default currency multiplies must be paid in.
pub const DEFAULT_CURRENCY: &str = "usd";

/// Processor configuration.
#[derive(Debug, Clone)]
pub struct ProcessorConfig {
    /// Rolling window between a user's multiplies.
    pub rate_limit_window: Duration,

    /// Deadline for one payment verification.
    pub payment_timeout: Duration,

    /// Required payment currency (lowercase).
    pub currency: String,
}

impl Default for ProcessorConfig {
    fn default() -> Self {
        Self {
            rate_limit_window: DEFAULT_RATE_LIMIT_WINDOW,
            payment_timeout: DEFAULT_PAYMENT_TIMEOUT,
            currency: DEFAULT_CURRENCY.to_string(),
        }
    }
}

/// Applies operations to the shared counter.
///
/// Cheap to clone; every session holds one.
#[derive(Clone)]
pub struct OperationProcessor {
    store: CounterStore,
    limiter: RateLimiter,
    verifier: Arc<dyn PaymentVerifier>,
    attribution: Arc<dyn AttributionSink>,
    config: Arc<ProcessorConfig>,
}

impl OperationProcessor {
    /// Creates a processor.
    pub fn new(
        store: CounterStore,
        verifier: Arc<dyn PaymentVerifier>,
        attribution: Arc<dyn AttributionSink>,
        config: ProcessorConfig,
    ) -> Self {
        Self {
            limiter: RateLimiter::new(store.clone(), config.rate_limit_window),
            store,
            verifier,
            attribution,
            config: Arc::new(config),
        }
    }

    /// The rate limiter the processor checks.
    pub fn limiter(&self) -> &RateLimiter {
        &self.limiter
    }

    /// Processes one operation.
    ///
    /// On success the change has been committed and will reach every session
    /// through the change feed; the caller sends nothing itself.
    pub async fn process(&self, operation: Operation) -> Result<ApplyResult> {
        let result = match operation {
            Operation::Increment { attribution } => self.increment(attribution).await,
            Operation::Multiply {
                attribution,
                multiply_amount,
                payment_intent_id,
            } => {
                self.multiply(attribution, multiply_amount, payment_intent_id)
                    .await
            }
        };

        if let Err(e) = &result {
            if e.is_systemic() {
                error!(error = %e, "operation failed on the shared store");
            }
        }

        result
    }

    async fn increment(&self, attribution: Attribution) -> Result<ApplyResult> {
        let result = self
            .store
            .apply_delta(Delta::Add(1), attribution.clone())
            .await?;

        debug!(pos = %result.change.pos, "increment applied");
        self.attribute(&result, attribution);
        Ok(result)
    }

    async fn multiply(
        &self,
        attribution: Attribution,
        multiply_amount: u64,
        payment_intent_id: PaymentIntentId,
    ) -> Result<ApplyResult> {
        // 1. Authenticated user
        let user_id = attribution.user_id.clone().ok_or(Error::Unauthorized)?;

        Delta::Multiply(multiply_amount).validate()?;

        // 2. Early rate-limit check, before paying for a verification
        if let Some(wait) = self.limiter.retry_after(&user_id).await? {
            warn!(user_id = %user_id, "multiply rate limited");
            return Err(Error::RateLimited {
                retry_after_ms: wait.as_millis() as u64,
            });
        }

        // 3. Payment verification, bounded, before any mutation
        self.verify_payment(&user_id, &payment_intent_id, multiply_amount)
            .await?;

        // 4 + 5. Rate-limit stamp, payment consumption and multiply, atomically
        let result = self
            .store
            .multiply_once(
                user_id.clone(),
                payment_intent_id.clone(),
                multiply_amount,
                self.limiter.window(),
                attribution.clone(),
            )
            .await
            .inspect_err(|e| {
                if !e.is_systemic() {
                    warn!(user_id = %user_id, error = %e, "multiply rejected at apply");
                }
            })?;

        self.verifier.mark_consumed(&payment_intent_id);

        debug!(
            user_id = %user_id,
            pos = %result.change.pos,
            factor = multiply_amount,
            "multiply applied"
        );

        // 6. Credit the value delta
        self.attribute(&result, attribution);
        Ok(result)
    }

    async fn verify_payment(
        &self,
        user_id: &UserId,
        payment_intent_id: &PaymentIntentId,
        multiply_amount: u64,
    ) -> Result<()> {
        let payment = match tokio::time::timeout(
            self.config.payment_timeout,
            self.verifier.verify(payment_intent_id),
        )
        .await
        {
            Ok(verified) => verified?,
            Err(_) => {
                warn!(user_id = %user_id, payment_intent_id = %payment_intent_id, "payment verification timed out");
                return Err(Error::PaymentTimeout);
            }
        };

        let duplicate = || Error::DuplicatePayment {
            payment_intent_id: payment_intent_id.as_str().to_string(),
        };

        if payment.consumed {
            return Err(duplicate());
        }
        if payment.status != PaymentStatus::Succeeded {
            return Err(Error::PaymentRejected(format!(
                "payment has not succeeded (status: {:?})",
                payment.status
            )));
        }
        if !payment.currency.eq_ignore_ascii_case(&self.config.currency) {
            return Err(Error::PaymentRejected(format!(
                "expected currency '{}', got '{}'",
                self.config.currency, payment.currency
            )));
        }
        if payment.amount != multiply_amount {
            return Err(Error::PaymentRejected(format!(
                "payment amount {} does not match multiply amount {multiply_amount}",
                payment.amount
            )));
        }

        // The multiply transaction re-checks this atomically.
        if self.store.is_payment_consumed(payment_intent_id).await? {
            return Err(duplicate());
        }

        Ok(())
    }

    fn attribute(&self, result: &ApplyResult, attribution: Attribution) {
        self.attribution.record(AttributionRecord {
            user_id: result.change.user_id.clone().or(attribution.user_id),
            country_code: attribution.country_code,
            country_name: attribution.country_name,
            value_delta: result.value_delta(),
            delta: result.change.delta,
            pos: result.change.pos,
            timestamp_ms: result.change.timestamp_ms,
        });
    }
}

// =============================================================================
// Tests
// =============================================================================

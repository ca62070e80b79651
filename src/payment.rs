//! # Payment Verification
//!
//! A multiply is paid for: the client sends the payment intent id it got from
//! the payment provider, and the processor asks a [`PaymentVerifier`] what
//! that intent actually paid before touching the counter.
//!
//! The verifier is an external collaborator. Two implementations ship:
//!
//! | Verifier | Confirmations live in | Used by |
//! |----------|-----------------------|---------|
//! | [`StorePaymentVerifier`] | `confirmed_payments` in the shared store | the server |
//! | [`InMemoryPaymentVerifier`] | a map in this process | embedders, tests |
//!
//! The provider's webhook (`POST /api/payments`) may reach any process, and
//! the paying client may be connected to any other. Only the store-backed
//! verifier sees a confirmation from every process and across restarts.

use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Mutex;
use std::time::Duration;

use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};

use crate::api::CounterStore;
use crate::error::{Error, Result};
use crate::types::PaymentIntentId;

/// Provider-side state of a payment intent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentStatus {
    Succeeded,
    Processing,
    RequiresAction,
    Canceled,
    Failed,
}

impl PaymentStatus {
    /// Name stored in `confirmed_payments.status`.
    pub fn as_str(&self) -> &'static str {
        match self {
            PaymentStatus::Succeeded => "succeeded",
            PaymentStatus::Processing => "processing",
            PaymentStatus::RequiresAction => "requires_action",
            PaymentStatus::Canceled => "canceled",
            PaymentStatus::Failed => "failed",
        }
    }
}

impl FromStr for PaymentStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "succeeded" => Ok(PaymentStatus::Succeeded),
            "processing" => Ok(PaymentStatus::Processing),
            "requires_action" => Ok(PaymentStatus::RequiresAction),
            "canceled" => Ok(PaymentStatus::Canceled),
            "failed" => Ok(PaymentStatus::Failed),
            other => Err(Error::Schema(format!("unknown payment status '{other}'"))),
        }
    }
}

/// What the verifier knows about an intent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerifiedPayment {
    /// Whole currency units; maps 1:1 to the multiplier.
    pub amount: u64,
    /// Lowercase ISO currency code.
    pub currency: String,
    pub status: PaymentStatus,
    /// The verifier has already seen this intent spent.
    pub consumed: bool,
}

/// External payment verification.
///
/// Must be callable repeatedly for the same intent. May be slow; the
/// processor bounds every call with a timeout.
pub trait PaymentVerifier: Send + Sync + 'static {
    /// Looks up an intent.
    ///
    /// Unknown intents fail with `PaymentRejected`.
    fn verify<'a>(&'a self, payment_intent_id: &'a PaymentIntentId) -> BoxFuture<'a, Result<VerifiedPayment>>;

    /// Told after a multiply paid by this intent was applied.
    fn mark_consumed(&self, _payment_intent_id: &PaymentIntentId) {}
}

fn unknown_payment(payment_intent_id: &PaymentIntentId) -> Error {
    Error::PaymentRejected(format!("unknown payment '{payment_intent_id}'"))
}

// =============================================================================
// Store Verifier
// =============================================================================

/// Verifier backed by the shared store.
///
/// Reads the confirmation the webhook wrote with
/// [`CounterStore::confirm_payment`], and reports the intent consumed once
/// any process's multiply used it. `mark_consumed` has nothing to do: the
/// multiply transaction already recorded the consumption.
#[derive(Clone)]
pub struct StorePaymentVerifier {
    store: CounterStore,

    /// Artificial latency per lookup.
    delay: Option<Duration>,
}

impl StorePaymentVerifier {
    pub fn new(store: CounterStore) -> Self {
        Self { store, delay: None }
    }

    /// Creates a verifier that answers after `delay`.
    pub fn with_delay(store: CounterStore, delay: Duration) -> Self {
        Self {
            store,
            delay: Some(delay),
        }
    }
}

impl PaymentVerifier for StorePaymentVerifier {
    fn verify<'a>(&'a self, payment_intent_id: &'a PaymentIntentId) -> BoxFuture<'a, Result<VerifiedPayment>> {
        Box::pin(async move {
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            self.store
                .payment(payment_intent_id)
                .await?
                .ok_or_else(|| unknown_payment(payment_intent_id))
        })
    }
}

// =============================================================================
// In-Memory Verifier
// =============================================================================

/// Verifier backed by a map of confirmed intents.
#[derive(Debug, Default)]
pub struct InMemoryPaymentVerifier {
    payments: Mutex<HashMap<String, VerifiedPayment>>,

    /// Artificial latency per lookup.
    delay: Option<Duration>,
}

impl InMemoryPaymentVerifier {
    /// Creates an empty verifier.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a verifier that answers after `delay`.
    pub fn with_delay(delay: Duration) -> Self {
        Self {
            payments: Mutex::new(HashMap::new()),
            delay: Some(delay),
        }
    }

    /// Registers a succeeded payment.
    pub fn confirm(&self, payment_intent_id: impl Into<PaymentIntentId>, amount: u64, currency: &str) {
        self.insert(
            payment_intent_id,
            VerifiedPayment {
                amount,
                currency: currency.to_ascii_lowercase(),
                status: PaymentStatus::Succeeded,
                consumed: false,
            },
        );
    }

    /// Registers an intent in any state.
    pub fn insert(&self, payment_intent_id: impl Into<PaymentIntentId>, payment: VerifiedPayment) {
        let id: PaymentIntentId = payment_intent_id.into();
        if let Ok(mut payments) = self.payments.lock() {
            payments.insert(id.as_str().to_string(), payment);
        }
    }

    /// Number of registered intents.
    pub fn len(&self) -> usize {
        self.payments.lock().map(|p| p.len()).unwrap_or(0)
    }

    /// True if no intent is registered.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lookup(&self, payment_intent_id: &PaymentIntentId) -> Result<VerifiedPayment> {
        let payments = self
            .payments
            .lock()
            .map_err(|_| Error::PaymentRejected("payment verifier unavailable".to_string()))?;

        payments
            .get(payment_intent_id.as_str())
            .cloned()
            .ok_or_else(|| unknown_payment(payment_intent_id))
    }
}

impl PaymentVerifier for InMemoryPaymentVerifier {
    fn verify<'a>(&'a self, payment_intent_id: &'a PaymentIntentId) -> BoxFuture<'a, Result<VerifiedPayment>> {
        Box::pin(async move {
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            self.lookup(payment_intent_id)
        })
    }

    fn mark_consumed(&self, payment_intent_id: &PaymentIntentId) {
        if let Ok(mut payments) = self.payments.lock() {
            if let Some(payment) = payments.get_mut(payment_intent_id.as_str()) {
                payment.consumed = true;
            }
        }
    }
}

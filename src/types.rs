//! # Domain Types for counterd
//!
//! This module defines the values that flow through the engine: the counter
//! itself ([`BigCount`]), positions in the shared change log ([`LogPos`]),
//! the identifiers a client supplies, and the records produced by an apply.
//!
//! ## Design Philosophy: Newtypes for Safety
//!
//! Identifiers are wrapped in single-field structs so a `UserId` can never be
//! passed where a `PaymentIntentId` is expected, even though both are strings
//! on the wire.
//!
//! ## Invariants
//!
//! - [`BigCount`]: exact, non-negative, never floating point, no width limit
//! - [`LogPos`]: strictly increasing across all processes, never reused
//! - [`Delta`]: `Add` operands are positive, `Multiply` operands are >= 2

use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

// =============================================================================
// BigCount
// =============================================================================

/// Limb base: each limb holds nine decimal digits.
const LIMB_BASE: u64 = 1_000_000_000;

/// Decimal digits per limb.
const LIMB_DIGITS: usize = 9;

/// Arbitrary-precision non-negative integer holding the counter value.
///
/// # Representation
///
/// Little-endian limbs in base 10^9:
///
/// ```text
/// 1000000000000000000000  →  [000000000, 000000000, 1000]
///                              limb 0     limb 1     limb 2
/// ```
///
/// Base 10^9 makes decimal parsing and printing (the wire format and the
/// storage format) a matter of slicing digits, while a limb times any `u64`
/// factor still fits in a `u128` during multiplication.
///
/// The limb vector is kept normalized: no high zero limbs, and zero is the
/// empty vector. That makes derived `PartialEq` structural equality correct.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct BigCount {
    limbs: Vec<u32>,
}

impl BigCount {
    /// Zero.
    pub fn zero() -> Self {
        Self { limbs: Vec::new() }
    }

    /// Returns true if the value is zero.
    pub fn is_zero(&self) -> bool {
        self.limbs.is_empty()
    }

    /// Parses a decimal string of ASCII digits.
    ///
    /// Leading zeros are accepted; signs, whitespace and separators are not.
    pub fn parse(s: &str) -> Result<Self> {
        if s.is_empty() {
            return Err(Error::Schema("empty counter value".to_string()));
        }
        if !s.bytes().all(|b| b.is_ascii_digit()) {
            return Err(Error::Schema(format!("invalid counter value '{s}'")));
        }

        let bytes = s.as_bytes();
        let mut limbs = Vec::with_capacity(bytes.len() / LIMB_DIGITS + 1);
        let mut end = bytes.len();
        while end > 0 {
            let start = end.saturating_sub(LIMB_DIGITS);
            let limb = bytes[start..end]
                .iter()
                .fold(0u32, |acc, b| acc * 10 + u32::from(b - b'0'));
            limbs.push(limb);
            end = start;
        }

        let mut value = Self { limbs };
        value.normalize();
        Ok(value)
    }

    /// Returns `self + n`.
    pub fn add_small(&self, n: u64) -> Self {
        let mut limbs = self.limbs.clone();
        let mut carry = n;
        let mut i = 0;
        while carry > 0 {
            if i == limbs.len() {
                limbs.push(0);
            }
            let sum = u64::from(limbs[i]) + carry;
            limbs[i] = (sum % LIMB_BASE) as u32;
            carry = sum / LIMB_BASE;
            i += 1;
        }
        Self { limbs }
    }

    /// Returns `self * factor`.
    pub fn mul_small(&self, factor: u64) -> Self {
        if factor == 0 || self.is_zero() {
            return Self::zero();
        }

        let base = u128::from(LIMB_BASE);
        let mut limbs = Vec::with_capacity(self.limbs.len() + 3);
        let mut carry: u128 = 0;
        for &limb in &self.limbs {
            let product = u128::from(limb) * u128::from(factor) + carry;
            limbs.push((product % base) as u32);
            carry = product / base;
        }
        while carry > 0 {
            limbs.push((carry % base) as u32);
            carry /= base;
        }
        Self { limbs }
    }

    /// Returns `self - other`, or `None` if `other > self`.
    pub fn checked_sub(&self, other: &BigCount) -> Option<Self> {
        if self < other {
            return None;
        }

        let mut limbs = Vec::with_capacity(self.limbs.len());
        let mut borrow: i64 = 0;
        for (i, &limb) in self.limbs.iter().enumerate() {
            let rhs = i64::from(other.limbs.get(i).copied().unwrap_or(0));
            let mut diff = i64::from(limb) - rhs - borrow;
            if diff < 0 {
                diff += LIMB_BASE as i64;
                borrow = 1;
            } else {
                borrow = 0;
            }
            limbs.push(diff as u32);
        }

        let mut value = Self { limbs };
        value.normalize();
        Some(value)
    }

    /// Number of decimal digits (zero has one digit).
    pub fn digit_count(&self) -> usize {
        match self.limbs.last() {
            None => 1,
            Some(top) => (self.limbs.len() - 1) * LIMB_DIGITS + top.to_string().len(),
        }
    }

    fn normalize(&mut self) {
        while self.limbs.last() == Some(&0) {
            self.limbs.pop();
        }
    }
}

impl From<u64> for BigCount {
    fn from(n: u64) -> Self {
        Self::zero().add_small(n)
    }
}

impl FromStr for BigCount {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl Ord for BigCount {
    fn cmp(&self, other: &Self) -> Ordering {
        self.limbs
            .len()
            .cmp(&other.limbs.len())
            .then_with(|| self.limbs.iter().rev().cmp(other.limbs.iter().rev()))
    }
}

impl PartialOrd for BigCount {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for BigCount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let Some((top, rest)) = self.limbs.split_last() else {
            return write!(f, "0");
        };
        write!(f, "{top}")?;
        for limb in rest.iter().rev() {
            write!(f, "{limb:09}")?;
        }
        Ok(())
    }
}

impl Serialize for BigCount {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for BigCount {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        BigCount::parse(&s).map_err(serde::de::Error::custom)
    }
}

// =============================================================================
// Log Position
// =============================================================================

/// Position of a change in the shared `counter_log`.
///
/// Assigned by SQLite (`INTEGER PRIMARY KEY AUTOINCREMENT`) inside the
/// writing transaction, so positions are totally ordered across every
/// process sharing the store. `LogPos::NONE` (0) means "before any change".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct LogPos(u64);

impl LogPos {
    /// Before the first change.
    pub const NONE: LogPos = LogPos(0);

    /// Creates a position from its raw value.
    pub fn from_raw(value: u64) -> Self {
        Self(value)
    }

    /// Returns the raw value for storage.
    pub fn as_raw(&self) -> u64 {
        self.0
    }

    /// Returns the next position.
    pub fn next(&self) -> Self {
        Self(self.0 + 1)
    }
}

impl fmt::Display for LogPos {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// =============================================================================
// Identifiers
// =============================================================================

/// Process-local session identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(u64);

impl SessionId {
    /// Creates a session id from its raw value.
    pub fn from_raw(value: u64) -> Self {
        Self(value)
    }

    /// Returns the raw value.
    pub fn as_raw(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Defines a string newtype with `new`, `as_str`, `Display` and `From`.
macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            /// Creates the identifier from a string.
            pub fn new(id: impl Into<String>) -> Self {
                Self(id.into())
            }

            /// Returns the string form.
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self::new(s)
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> Self {
                Self(s)
            }
        }
    };
}

string_id!(
    /// Authenticated user id, as issued by the external auth provider.
    UserId
);

string_id!(
    /// ISO country code supplied by the client (not verified).
    CountryCode
);

string_id!(
    /// Payment provider intent id; the idempotency key of a multiply.
    PaymentIntentId
);

// =============================================================================
// Delta
// =============================================================================

/// The arithmetic applied by one operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delta {
    /// Add a positive integer (increment adds 1).
    Add(u64),
    /// Multiply by an integer >= 2.
    Multiply(u64),
}

impl Delta {
    /// Applies the delta to a value.
    pub fn apply(&self, value: &BigCount) -> BigCount {
        match *self {
            Delta::Add(n) => value.add_small(n),
            Delta::Multiply(n) => value.mul_small(n),
        }
    }

    /// Rejects deltas that would not strictly grow a positive counter.
    pub fn validate(&self) -> Result<()> {
        match *self {
            Delta::Add(0) => Err(Error::MalformedMessage(
                "increment amount must be positive".to_string(),
            )),
            Delta::Multiply(n) if n < 2 => Err(Error::MalformedMessage(format!(
                "multiply amount must be at least 2, got {n}"
            ))),
            _ => Ok(()),
        }
    }

    /// Storage tag for the `kind` column.
    pub fn kind(&self) -> &'static str {
        match self {
            Delta::Add(_) => "add",
            Delta::Multiply(_) => "multiply",
        }
    }

    /// The operand.
    pub fn operand(&self) -> u64 {
        match *self {
            Delta::Add(n) | Delta::Multiply(n) => n,
        }
    }

    /// Rebuilds a delta from its storage columns.
    pub fn from_parts(kind: &str, operand: u64) -> Result<Self> {
        match kind {
            "add" => Ok(Delta::Add(operand)),
            "multiply" => Ok(Delta::Multiply(operand)),
            other => Err(Error::Schema(format!("unknown delta kind '{other}'"))),
        }
    }
}

// =============================================================================
// Attribution
// =============================================================================

/// Who an operation is credited to. All fields are optional for increments.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Attribution {
    pub user_id: Option<UserId>,
    pub country_code: Option<CountryCode>,
    pub country_name: Option<String>,
}

impl Attribution {
    /// Attribution for an anonymous operation.
    pub fn anonymous() -> Self {
        Self::default()
    }

    /// Attribution for a signed-in user.
    pub fn user(user_id: impl Into<UserId>) -> Self {
        Self {
            user_id: Some(user_id.into()),
            ..Self::default()
        }
    }

    /// Adds a country.
    pub fn with_country(mut self, code: impl Into<CountryCode>, name: Option<String>) -> Self {
        self.country_code = Some(code.into());
        self.country_name = name;
        self
    }
}

/// Side-channel record emitted after every applied operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttributionRecord {
    pub user_id: Option<UserId>,
    pub country_code: Option<CountryCode>,
    pub country_name: Option<String>,
    /// `new_value - old_value`.
    pub value_delta: BigCount,
    pub delta: Delta,
    pub pos: LogPos,
    pub timestamp_ms: u64,
}

// =============================================================================
// Operation
// =============================================================================

/// A validated inbound operation. Transient: built per message, processed,
/// then dropped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Operation {
    /// Add one. Free, unauthenticated, unlimited.
    Increment { attribution: Attribution },

    /// Multiply by a paid amount. Requires `attribution.user_id`.
    Multiply {
        attribution: Attribution,
        multiply_amount: u64,
        payment_intent_id: PaymentIntentId,
    },
}

impl Operation {
    /// The attribution carried by the operation.
    pub fn attribution(&self) -> &Attribution {
        match self {
            Operation::Increment { attribution } | Operation::Multiply { attribution, .. } => {
                attribution
            }
        }
    }
}

// =============================================================================
// Changes
// =============================================================================

/// One row of the shared change log: the post-apply value and what produced
/// it. This is what the change feed yields and what sessions receive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CounterChange {
    pub pos: LogPos,
    pub value: BigCount,
    pub delta: Delta,
    pub user_id: Option<UserId>,
    pub country_code: Option<CountryCode>,
    pub timestamp_ms: u64,
}

/// Result of an atomic apply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApplyResult {
    pub old_value: BigCount,
    pub change: CounterChange,
}

impl ApplyResult {
    /// The new counter value.
    pub fn new_value(&self) -> &BigCount {
        &self.change.value
    }

    /// `new_value - old_value`; never negative because the counter never
    /// decreases.
    pub fn value_delta(&self) -> BigCount {
        self.change
            .value
            .checked_sub(&self.old_value)
            .unwrap_or_default()
    }
}

/// Current value together with the log position that produced it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CounterSnapshot {
    pub value: BigCount,
    pub pos: LogPos,
}

// =============================================================================
// History
// =============================================================================

/// Resolution of a history snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Granularity {
    Detailed,
    Hourly,
    Daily,
}

impl Granularity {
    /// Storage tag.
    pub fn as_str(&self) -> &'static str {
        match self {
            Granularity::Detailed => "detailed",
            Granularity::Hourly => "hourly",
            Granularity::Daily => "daily",
        }
    }
}

/// Time window requested from the history endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HistoryRange {
    Hour,
    Day,
    Week,
    All,
}

impl FromStr for HistoryRange {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "hour" => Ok(HistoryRange::Hour),
            "day" => Ok(HistoryRange::Day),
            "week" => Ok(HistoryRange::Week),
            "all" => Ok(HistoryRange::All),
            other => Err(Error::MalformedMessage(format!("unknown history range '{other}'"))),
        }
    }
}

/// One point of counter history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HistoryPoint {
    pub count: BigCount,
    pub timestamp: u64,
}

// =============================================================================
// Tests
// =============================================================================

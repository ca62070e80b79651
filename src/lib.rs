//! # counterd - Real-Time Global Counter
//!
//! counterd serves one exact, unbounded integer to every connected client.
//! Anyone can add one; signed-in users can pay to multiply it, at most once
//! per day. Every change reaches every connected client, on every server
//! process.
//!
//! - **Exact arithmetic**: the value is a decimal big integer, never a float
//! - **Shared state**: one SQLite WAL file serves any number of processes
//! - **Atomic multiplies**: rate limit, payment consumption and the multiply
//!   commit or roll back together
//! - **Ordered fan-out**: clients see changes in the order they were applied
//!
//! ## Architecture Overview
//!
//! ```text
//!   clients ◄──ws──► server ──► OperationProcessor ──► CounterStore
//!                      ▲          (validate, limit,        │ writer actor
//!                      │           verify payment)         │ (group commit,
//!                      │                                   │  BEGIN IMMEDIATE)
//!   SessionRegistry ◄── Broadcaster ◄── ChangeFeed ◄───────┤
//!   (local sessions,     (one per       (local broadcast   ▼
//!    bounded queues)      process)       + log polling)  SQLite (WAL)
//!                                                          ▲
//!                                      other processes ────┘
//! ```
//!
//! ## Core Invariants
//!
//! 1. **No lost updates**: every apply is a read-modify-write under the
//!    database write lock
//! 2. **Durable ordering**: log `pos` strictly increases, never reused
//! 3. **One multiply per window**: the limit is a test-and-set in the same
//!    transaction as the multiply
//! 4. **One multiply per payment**: a consumed payment intent is never
//!    applied again
//! 5. **Never backwards**: a session never receives a value older than one
//!    it already has
//!
//! ## Module Organization
//!
//! - [`error`]: Error taxonomy and wire mapping
//! - [`types`]: `BigCount`, ids, deltas, changes
//! - [`codec`]: JSON wire protocol
//! - [`schema`]: SQLite DDL and database initialization
//! - [`writer`]: Writer actor with group commit
//! - [`reader`]: Pooled read connections
//! - [`api`]: [`CounterStore`], the store facade
//! - [`subscription`]: Local broadcast and the cross-process change feed
//! - [`rate_limit`], [`payment`], [`attribution`]: processor collaborators
//! - [`processor`]: The per-operation state machine
//! - [`session`], [`broadcaster`]: Local sessions and fan-out
//! - [`config`], [`server`], [`client`]: Deployment surface

// =============================================================================
// Module Declarations
// =============================================================================

/// Error types for counterd operations.
pub mod error;

/// Domain types: the big integer, ids, deltas and log rows.
pub mod types;

/// JSON frames exchanged with clients.
pub mod codec;

/// SQLite schema definitions and database initialization.
pub mod schema;

/// Single writer actor with group commit.
///
/// All mutations of the shared store on this process go through one thread
/// that owns the write connection. Concurrent requests are collected over a
/// short window and committed in one `BEGIN IMMEDIATE` transaction, one
/// SAVEPOINT per operation, so a rejected multiply never affects the
/// increments batched with it.
pub mod writer;

/// Read operations with pooled connections.
pub mod reader;

/// Async store facade.
///
/// The main entry point is [`CounterStore`](api::CounterStore).
pub mod api;

/// Local broadcast of committed changes and the merged change feed.
pub mod subscription;

/// Per-user multiply rate limit backed by the shared store.
pub mod rate_limit;

/// Payment verification.
pub mod payment;

/// Value attribution side channel.
pub mod attribution;

/// Validates and applies client operations.
pub mod processor;

/// Connected sessions on this process.
pub mod session;

/// Change fan-out and viewer presence.
pub mod broadcaster;

/// Environment configuration.
pub mod config;

/// axum router, WebSocket handler and HTTP endpoints.
pub mod server;

/// Reconnecting WebSocket client.
pub mod client;

// =============================================================================
// Re-exports
// =============================================================================

pub use api::{CounterStore, StoreConfig};
pub use broadcaster::Broadcaster;
pub use client::{ClientEvent, CounterClient};
pub use codec::{ClientMessage, Frame, ServerMessage};
pub use config::Config;
pub use error::{Error, Result};
pub use payment::{InMemoryPaymentVerifier, PaymentVerifier, StorePaymentVerifier, VerifiedPayment};
pub use processor::{OperationProcessor, ProcessorConfig};
pub use rate_limit::RateLimiter;
pub use schema::Database;
pub use session::{SessionGuard, SessionHandle, SessionIdentity, SessionRegistry};
pub use subscription::{ChangeFeed, SubscriptionManager};
pub use types::{
    ApplyResult, Attribution, AttributionRecord, BigCount, CounterChange, CounterSnapshot, Delta,
    LogPos, Operation, PaymentIntentId, SessionId, UserId,
};

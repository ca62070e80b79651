//! # Sessions and the Local Registry
//!
//! A session is one connected client on this process. The registry is the
//! process-local set of sessions the broadcaster fans frames out to. It is a
//! cache of who is connected here, never authoritative state.
//!
//! ## Outbound Path
//!
//! ```text
//!   Broadcaster ──► SessionRegistry::broadcast_local(pos, frame)
//!                        │ try_send (never awaits)
//!          ┌─────────────┼─────────────┐
//!          ▼             ▼             ▼
//!     [queue 64]    [queue 64]    [queue FULL] ──► disconnect (slow consumer)
//!          │             │
//!     sender task   sender task      (one per connection, drains to socket)
//! ```
//!
//! A slow client can never stall the fan-out: a full queue gets the session
//! disconnected instead of applying backpressure.
//!
//! ## Resync Without Going Backwards
//!
//! A new session's first frame is the current value. Registration happens
//! under the same lock as fan-out, and each session remembers the position of
//! its first frame (`floor`). Broadcasts at or below the floor are skipped
//! for that session, so a client never sees the value move backwards even
//! when the broadcaster is behind the store read used for the resync.
//!
//! ## Lifecycle
//!
//! [`SessionRegistry::register`] returns a [`SessionGuard`]; dropping it
//! unregisters. Every termination path (clean close, protocol error, idle
//! timeout, slow-consumer disconnect, panic unwinding) therefore unregisters
//! exactly once, and a second `unregister` is a no-op.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock};
use std::time::Duration;

use tokio::sync::{mpsc, Notify};
use tracing::{debug, warn};

use crate::codec::{current_time_ms, Frame};
use crate::error::{Error, Result};
use crate::types::{Attribution, CountryCode, LogPos, SessionId, UserId};

/// Default bounded outbound queue per session.
pub const DEFAULT_SESSION_QUEUE_SIZE: usize = 64;

// =============================================================================
// Session Handle
// =============================================================================

/// Outcome of queueing a frame.
enum Delivery {
    Queued,
    Full,
    Gone,
}

/// Who the client said it was on its first attributed operation.
///
/// Log context only. Every operation still carries its own attribution.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionIdentity {
    pub user_id: Option<UserId>,
    pub country_code: Option<CountryCode>,
}

/// The registry's view of one connection.
#[derive(Debug)]
pub struct SessionHandle {
    id: SessionId,
    tx: mpsc::Sender<Frame>,
    closed: AtomicBool,
    close_notify: Notify,
    connected_at_ms: u64,
    last_seen_ms: AtomicU64,
    identity: OnceLock<SessionIdentity>,
}

impl SessionHandle {
    fn new(id: SessionId, queue_size: usize) -> (Arc<Self>, mpsc::Receiver<Frame>) {
        let (tx, rx) = mpsc::channel(queue_size.max(1));
        let now = current_time_ms();
        let handle = Arc::new(Self {
            id,
            tx,
            closed: AtomicBool::new(false),
            close_notify: Notify::new(),
            connected_at_ms: now,
            last_seen_ms: AtomicU64::new(now),
            identity: OnceLock::new(),
        });
        (handle, rx)
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    /// Wall-clock time the session was created, in milliseconds.
    pub fn connected_at_ms(&self) -> u64 {
        self.connected_at_ms
    }

    /// Time since the session was created.
    pub fn connected_for(&self) -> Duration {
        Duration::from_millis(current_time_ms().saturating_sub(self.connected_at_ms))
    }

    /// Remembers the user and country of the first operation that names
    /// either. Later operations don't change it.
    pub fn note_identity(&self, attribution: &Attribution) {
        if attribution.user_id.is_none() && attribution.country_code.is_none() {
            return;
        }
        let _ = self.identity.set(SessionIdentity {
            user_id: attribution.user_id.clone(),
            country_code: attribution.country_code.clone(),
        });
    }

    pub fn identity(&self) -> Option<&SessionIdentity> {
        self.identity.get()
    }

    pub fn user_id(&self) -> Option<&UserId> {
        self.identity().and_then(|identity| identity.user_id.as_ref())
    }

    pub fn country_code(&self) -> Option<&CountryCode> {
        self.identity().and_then(|identity| identity.country_code.as_ref())
    }

    fn deliver(&self, frame: Frame) -> Delivery {
        match self.tx.try_send(frame) {
            Ok(()) => Delivery::Queued,
            Err(mpsc::error::TrySendError::Full(_)) => Delivery::Full,
            Err(mpsc::error::TrySendError::Closed(_)) => Delivery::Gone,
        }
    }

    /// Queues a frame for this session only (pong, viewer count, errors).
    ///
    /// A full queue disconnects the session and returns `SlowConsumer`.
    pub fn send(&self, frame: Frame) -> Result<()> {
        match self.deliver(frame) {
            Delivery::Queued => Ok(()),
            Delivery::Full | Delivery::Gone => {
                self.disconnect();
                Err(Error::SlowConsumer)
            }
        }
    }

    /// Records inbound activity.
    pub fn touch(&self) {
        self.last_seen_ms.store(current_time_ms(), Ordering::Relaxed);
    }

    /// Time since the last inbound frame.
    pub fn idle_for(&self) -> Duration {
        let last = self.last_seen_ms.load(Ordering::Relaxed);
        Duration::from_millis(current_time_ms().saturating_sub(last))
    }

    /// Asks the connection to close.
    pub fn disconnect(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            // Stores a permit if the connection isn't waiting yet.
            self.close_notify.notify_one();
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Resolves once [`disconnect`](Self::disconnect) has been called.
    pub async fn closed(&self) {
        if self.is_closed() {
            return;
        }
        self.close_notify.notified().await;
    }
}

// =============================================================================
// Session Registry
// =============================================================================

struct Entry {
    handle: Arc<SessionHandle>,
    /// Position of the newest frame this session already has.
    floor: LogPos,
}

#[derive(Default)]
struct FanoutState {
    sessions: HashMap<SessionId, Entry>,
    /// Newest frame broadcast on this process.
    last: Option<(LogPos, Frame)>,
}

/// Process-local set of connected sessions.
pub struct SessionRegistry {
    state: Mutex<FanoutState>,
    next_id: AtomicU64,
    queue_size: usize,
}

impl SessionRegistry {
    /// Creates a registry whose sessions get `queue_size` outbound slots.
    pub fn new(queue_size: usize) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(FanoutState::default()),
            next_id: AtomicU64::new(1),
            queue_size,
        })
    }

    fn state(&self) -> MutexGuard<'_, FanoutState> {
        // Nothing under the lock can leave the map half-updated.
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Allocates a session and its outbound queue. Not yet registered.
    pub fn create_session(&self) -> (Arc<SessionHandle>, mpsc::Receiver<Frame>) {
        let id = SessionId::from_raw(self.next_id.fetch_add(1, Ordering::Relaxed));
        SessionHandle::new(id, self.queue_size)
    }

    /// Registers a session and queues its first frame.
    ///
    /// `resync` is the value read from the store at connect time. If this
    /// process already broadcast something newer, that frame is sent instead.
    pub fn register(self: &Arc<Self>, handle: Arc<SessionHandle>, resync: (LogPos, Frame)) -> SessionGuard {
        let id = handle.id();
        let mut state = self.state();

        let (floor, first) = match &state.last {
            Some((pos, frame)) if *pos > resync.0 => (*pos, frame.clone()),
            _ => resync,
        };

        match handle.deliver(first) {
            Delivery::Queued => {
                state.sessions.insert(id, Entry { handle, floor });
                debug!(session_id = %id, floor = %floor, "session registered");
            }
            // The connection went away before registering.
            Delivery::Full | Delivery::Gone => handle.disconnect(),
        }

        SessionGuard {
            registry: Arc::clone(self),
            id,
        }
    }

    /// Removes a session. Returns false if it was not registered.
    pub fn unregister(&self, id: SessionId) -> bool {
        let removed = self.state().sessions.remove(&id).is_some();
        if removed {
            debug!(session_id = %id, "session unregistered");
        }
        removed
    }

    /// Queues `frame` on every session whose floor is below `pos`.
    ///
    /// Sessions with a full queue are disconnected and removed. Returns the
    /// number of sessions the frame was queued on.
    pub fn broadcast_local(&self, pos: LogPos, frame: Frame) -> usize {
        let mut state = self.state();

        if state.last.as_ref().map_or(true, |(last, _)| pos > *last) {
            state.last = Some((pos, frame.clone()));
        }

        let mut delivered = 0;
        let mut dropped = Vec::new();

        for (id, entry) in state.sessions.iter_mut() {
            if entry.floor >= pos {
                continue;
            }
            match entry.handle.deliver(frame.clone()) {
                Delivery::Queued => {
                    entry.floor = pos;
                    delivered += 1;
                }
                Delivery::Full => {
                    warn!(session_id = %id, "outbound queue full, disconnecting slow consumer");
                    entry.handle.disconnect();
                    dropped.push(*id);
                }
                Delivery::Gone => dropped.push(*id),
            }
        }

        for id in dropped {
            state.sessions.remove(&id);
        }

        delivered
    }

    /// Sessions registered on this process.
    pub fn viewer_count(&self) -> usize {
        self.state().sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.viewer_count() == 0
    }

    /// Asks every session to close.
    pub fn disconnect_all(&self) {
        for entry in self.state().sessions.values() {
            entry.handle.disconnect();
        }
    }
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self {
            state: Mutex::new(FanoutState::default()),
            next_id: AtomicU64::new(1),
            queue_size: DEFAULT_SESSION_QUEUE_SIZE,
        }
    }
}

// =============================================================================
// Session Guard
// =============================================================================

/// Unregisters its session when dropped.
pub struct SessionGuard {
    registry: Arc<SessionRegistry>,
    id: SessionId,
}

impl SessionGuard {
    pub fn id(&self) -> SessionId {
        self.id
    }
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        self.registry.unregister(self.id);
    }
}

// =============================================================================
// Tests
// =============================================================================

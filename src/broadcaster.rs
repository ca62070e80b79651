//! # Broadcaster
//!
//! One broadcaster per process. It tails the shared change feed and hands
//! every change to the local session registry, and it keeps this process's
//! row in the shared presence table fresh.
//!
//! ```text
//!   other processes ──► counter_log ──┐
//!                                     ├──► ChangeFeed ──► encode ──► SessionRegistry
//!   this process's writer ──► local ──┘   (ordered,        once        broadcast_local
//!                             broadcast    deduplicated)
//! ```
//!
//! Each change is encoded once and the same [`Frame`](crate::codec::Frame)
//! is queued on every session, so fan-out cost per session is one `Arc`
//! clone and a `try_send`.
//!
//! ## Ordering
//!
//! The feed yields changes in log order and the fan-out loop is a single
//! task, so every session sees frames in the order the store applied them.
//! Across a reconnect there is no replay: a new session's first frame is
//! the current value (see [`session`](crate::session)).
//!
//! ## Viewer Count
//!
//! ```text
//!   viewer_count = local sessions + Σ presence rows of other processes
//!                                   updated within 3 presence intervals
//! ```
//!
//! A crashed process stops refreshing its row and drops out of the sum
//! after three intervals.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::api::CounterStore;
use crate::codec::{current_time_ms, ServerMessage};
use crate::error::Result;
use crate::session::{SessionHandle, SessionRegistry};
use crate::subscription::ChangeFeed;

/// Default presence refresh interval.
pub const DEFAULT_PRESENCE_INTERVAL: Duration = Duration::from_secs(2);

/// Presence rows older than this many intervals are ignored.
const PRESENCE_STALE_INTERVALS: u64 = 3;

/// Pause before retrying a failed log read.
const FEED_RETRY_DELAY: Duration = Duration::from_millis(500);

/// Process-wide fan-out and presence.
pub struct Broadcaster {
    store: CounterStore,
    registry: Arc<SessionRegistry>,
    presence_interval: Duration,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Broadcaster {
    /// Subscribes to the store and starts the fan-out and presence tasks.
    ///
    /// Must be called from within a Tokio runtime.
    pub async fn spawn(
        store: CounterStore,
        registry: Arc<SessionRegistry>,
        presence_interval: Duration,
    ) -> Result<Arc<Self>> {
        let feed = store.subscribe().await?;
        let start = feed.next_position();

        let fanout = tokio::spawn(run_fanout(feed, Arc::clone(&registry)));
        let presence = tokio::spawn(run_presence(
            store.clone(),
            Arc::clone(&registry),
            presence_interval,
        ));

        info!(from = %start, presence_ms = presence_interval.as_millis() as u64, "broadcaster started");

        Ok(Arc::new(Self {
            store,
            registry,
            presence_interval,
            tasks: Mutex::new(vec![fanout, presence]),
        }))
    }

    /// The local session registry.
    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    /// Sessions connected to every process.
    ///
    /// If the presence table can't be read, only local sessions are counted.
    pub async fn viewer_count(&self) -> u64 {
        let local = self.registry.viewer_count() as u64;
        let window_ms = self.presence_interval.as_millis() as u64 * PRESENCE_STALE_INTERVALS;
        let since_ms = current_time_ms().saturating_sub(window_ms);

        match self.store.viewer_total(since_ms).await {
            Ok(remote) => local + remote,
            Err(e) => {
                warn!(error = %e, "presence read failed, reporting local viewers only");
                local
            }
        }
    }

    /// Answers a `ping` on `session` only.
    pub fn answer_ping(&self, session: &SessionHandle) -> Result<()> {
        session.send(ServerMessage::Pong.encode()?)
    }

    /// Answers a `get_viewer_count` on `session` only.
    pub async fn answer_viewer_count(&self, session: &SessionHandle) -> Result<()> {
        let count = self.viewer_count().await;
        session.send(ServerMessage::ViewerCount { count }.encode()?)
    }

    /// Stops both tasks and withdraws this process from the viewer count.
    pub async fn shutdown(&self) {
        if let Ok(mut tasks) = self.tasks.lock() {
            for task in tasks.drain(..) {
                task.abort();
            }
        }

        if let Err(e) = self.store.remove_presence().await {
            warn!(error = %e, "failed to remove presence row");
        }

        info!("broadcaster stopped");
    }
}

impl Drop for Broadcaster {
    fn drop(&mut self) {
        if let Ok(mut tasks) = self.tasks.lock() {
            for task in tasks.drain(..) {
                task.abort();
            }
        }
    }
}

// =============================================================================
// Tasks
// =============================================================================

async fn run_fanout(mut feed: ChangeFeed, registry: Arc<SessionRegistry>) {
    while let Some(next) = feed.next().await {
        let change = match next {
            Ok(change) => change,
            Err(e) => {
                warn!(error = %e, at = %feed.next_position(), "change feed read failed, retrying");
                tokio::time::sleep(FEED_RETRY_DELAY).await;
                continue;
            }
        };

        let frame = match ServerMessage::from_change(&change).encode() {
            Ok(frame) => frame,
            Err(e) => {
                error!(error = %e, pos = %change.pos, "failed to encode change");
                continue;
            }
        };

        let delivered = registry.broadcast_local(change.pos, frame);
        debug!(pos = %change.pos, delivered, "change broadcast");
    }

    debug!("change feed ended");
}

async fn run_presence(store: CounterStore, registry: Arc<SessionRegistry>, every: Duration) {
    let mut interval = tokio::time::interval(every);
    loop {
        interval.tick().await;
        let viewers = registry.viewer_count() as u64;
        if let Err(e) = store.publish_presence(viewers).await {
            warn!(error = %e, "failed to publish presence");
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::StoreConfig;
    use crate::codec::decode_server_message;
    use crate::types::{Attribution, BigCount, Delta, LogPos};

    async fn open(path: &std::path::Path) -> CounterStore {
        let config = StoreConfig {
            feed_poll_interval: Duration::from_millis(20),
            log_retention: None,
            history_interval: None,
            ..StoreConfig::default()
        };
        CounterStore::open_with_config(path, config).await.unwrap()
    }

    async fn recv_count(rx: &mut tokio::sync::mpsc::Receiver<crate::codec::Frame>) -> BigCount {
        let frame = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("frame in time")
            .expect("queue open");
        match decode_server_message(&frame).unwrap() {
            ServerMessage::Count { count, .. } => count,
            other => panic!("expected count, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_local_apply_reaches_session() {
        let dir = tempfile::TempDir::new().unwrap();
        let store = open(&dir.path().join("b.db")).await;
        let registry = SessionRegistry::new(16);
        let broadcaster = Broadcaster::spawn(store.clone(), registry.clone(), DEFAULT_PRESENCE_INTERVAL)
            .await
            .unwrap();

        let (handle, mut rx) = registry.create_session();
        let _guard = registry.register(handle, (LogPos::NONE, ServerMessage::resync(&BigCount::zero()).encode().unwrap()));
        assert_eq!(recv_count(&mut rx).await, BigCount::zero());

        store.apply_delta(Delta::Add(1), Attribution::anonymous()).await.unwrap();
        assert_eq!(recv_count(&mut rx).await, BigCount::from(1));

        broadcaster.shutdown().await;
        store.shutdown().await;
    }

    #[tokio::test]
    async fn test_remote_apply_reaches_session() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("b.db");
        let local = open(&path).await;
        let remote = open(&path).await;

        let registry = SessionRegistry::new(16);
        let broadcaster = Broadcaster::spawn(local.clone(), registry.clone(), DEFAULT_PRESENCE_INTERVAL)
            .await
            .unwrap();

        let (handle, mut rx) = registry.create_session();
        let _guard = registry.register(handle, (LogPos::NONE, ServerMessage::resync(&BigCount::zero()).encode().unwrap()));
        recv_count(&mut rx).await;

        remote.apply_delta(Delta::Add(1), Attribution::anonymous()).await.unwrap();
        remote.apply_delta(Delta::Multiply(7), Attribution::anonymous()).await.unwrap();

        assert_eq!(recv_count(&mut rx).await, BigCount::from(1));
        assert_eq!(recv_count(&mut rx).await, BigCount::from(7));

        broadcaster.shutdown().await;
        remote.shutdown().await;
        local.shutdown().await;
    }

    #[tokio::test]
    async fn test_viewer_count_sums_processes() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("b.db");
        let store_a = open(&path).await;
        let store_b = open(&path).await;

        let registry_a = SessionRegistry::new(16);
        let registry_b = SessionRegistry::new(16);
        let interval = Duration::from_millis(50);
        let a = Broadcaster::spawn(store_a.clone(), registry_a.clone(), interval).await.unwrap();
        let b = Broadcaster::spawn(store_b.clone(), registry_b.clone(), interval).await.unwrap();

        let resync = ServerMessage::resync(&BigCount::zero()).encode().unwrap();
        let (h1, _r1) = registry_a.create_session();
        let (h2, _r2) = registry_b.create_session();
        let (h3, _r3) = registry_b.create_session();
        let _g1 = registry_a.register(h1, (LogPos::NONE, resync.clone()));
        let _g2 = registry_b.register(h2, (LogPos::NONE, resync.clone()));
        let _g3 = registry_b.register(h3, (LogPos::NONE, resync));

        let mut total = 0;
        for _ in 0..100 {
            total = a.viewer_count().await;
            if total == 3 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(total, 3);

        // B withdraws its row on shutdown.
        b.shutdown().await;
        drop(_g2);
        drop(_g3);
        assert_eq!(a.viewer_count().await, 1);

        a.shutdown().await;
        store_b.shutdown().await;
        store_a.shutdown().await;
    }

    #[tokio::test]
    async fn test_answers_go_to_one_session() {
        let dir = tempfile::TempDir::new().unwrap();
        let store = open(&dir.path().join("b.db")).await;
        let registry = SessionRegistry::new(16);
        let broadcaster = Broadcaster::spawn(store.clone(), registry.clone(), DEFAULT_PRESENCE_INTERVAL)
            .await
            .unwrap();

        let resync = ServerMessage::resync(&BigCount::zero()).encode().unwrap();
        let (asker, mut asker_rx) = registry.create_session();
        let (other, mut other_rx) = registry.create_session();
        let _ga = registry.register(asker.clone(), (LogPos::NONE, resync.clone()));
        let _go = registry.register(other, (LogPos::NONE, resync));
        asker_rx.recv().await.unwrap();
        other_rx.recv().await.unwrap();

        broadcaster.answer_ping(&asker).unwrap();
        broadcaster.answer_viewer_count(&asker).await.unwrap();

        assert_eq!(decode_server_message(&asker_rx.recv().await.unwrap()).unwrap(), ServerMessage::Pong);
        assert!(matches!(
            decode_server_message(&asker_rx.recv().await.unwrap()).unwrap(),
            ServerMessage::ViewerCount { count: 2 }
        ));
        assert!(other_rx.try_recv().is_err());

        broadcaster.shutdown().await;
        store.shutdown().await;
    }
}

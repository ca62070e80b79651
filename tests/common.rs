#![allow(dead_code)]

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use counterd::attribution::{ChannelAttributionSink, TracingAttributionSink};
use counterd::types::AttributionRecord;
use counterd::{
    CounterStore, InMemoryPaymentVerifier, OperationProcessor, ProcessorConfig, StoreConfig,
    StorePaymentVerifier,
};
use rusqlite::{Connection, OpenFlags};
use tokio::sync::mpsc;

pub fn create_temp_db_path(name: &str) -> (tempfile::TempDir, PathBuf) {
    let dir = tempfile::TempDir::new().expect("create temp dir");
    let path = dir.path().join(name);
    (dir, path)
}

/// Store settings for tests: fast log polling, no background tasks.
pub fn test_store_config() -> StoreConfig {
    StoreConfig {
        feed_poll_interval: Duration::from_millis(20),
        log_retention: None,
        history_interval: None,
        ..StoreConfig::default()
    }
}

pub async fn open_store(path: &Path) -> CounterStore {
    CounterStore::open_with_config(path, test_store_config())
        .await
        .expect("open store")
}

pub async fn open_store_with(path: &Path, config: StoreConfig) -> CounterStore {
    CounterStore::open_with_config(path, config)
        .await
        .expect("open store")
}

pub fn open_read_only(path: &Path) -> Connection {
    Connection::open_with_flags(
        path,
        OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
    )
    .expect("open read-only connection")
}

/// A processor wired to an in-memory verifier and a channel attribution sink.
pub struct TestProcessor {
    pub processor: OperationProcessor,
    pub verifier: Arc<InMemoryPaymentVerifier>,
    pub attribution: mpsc::UnboundedReceiver<AttributionRecord>,
}

pub fn processor(store: &CounterStore) -> TestProcessor {
    processor_with(store, Arc::new(InMemoryPaymentVerifier::new()), ProcessorConfig::default())
}

pub fn processor_with(
    store: &CounterStore,
    verifier: Arc<InMemoryPaymentVerifier>,
    config: ProcessorConfig,
) -> TestProcessor {
    let (sink, attribution) = ChannelAttributionSink::new();
    let processor = OperationProcessor::new(store.clone(), verifier.clone(), Arc::new(sink), config);
    TestProcessor {
        processor,
        verifier,
        attribution,
    }
}

/// A processor that checks payments against confirmations in the store,
/// the way a server process does.
pub fn store_processor(store: &CounterStore) -> OperationProcessor {
    OperationProcessor::new(
        store.clone(),
        Arc::new(StorePaymentVerifier::new(store.clone())),
        Arc::new(TracingAttributionSink),
        ProcessorConfig::default(),
    )
}

pub async fn eventually<T>(
    timeout: Duration,
    interval: Duration,
    mut f: impl FnMut() -> Option<T>,
) -> T {
    let start = std::time::Instant::now();
    loop {
        if let Some(v) = f() {
            return v;
        }
        if start.elapsed() > timeout {
            panic!("condition not met within {:?}", timeout);
        }
        tokio::time::sleep(interval).await;
    }
}

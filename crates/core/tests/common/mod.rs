//! Common test utilities for integration tests.
//!
//! This module provides shared test helpers for driving a sync engine
//! against an in-memory remote collection and a temporary cache.

use chatsnap_core::chat::{
    ConnectivityMonitor, ConversationSnapshot, EngineState, InMemoryCollection, ManualSignal,
    Message, NetworkSignal, Sender, SledCache, SyncEngine, SyncHandle,
};
use std::sync::Arc;
use std::time::Duration;

/// Default timeout for test operations.
pub const TEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Initialize test logging with appropriate filters.
///
/// Call this at the start of tests that need debug output.
/// Safe to call multiple times (subsequent calls are no-ops).
#[allow(dead_code)]
pub fn init_test_logging() {
    use tracing_subscriber::EnvFilter;

    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("chatsnap_core=debug")),
        )
        .with_test_writer()
        .try_init();
}

/// Run an async operation with a timeout.
///
/// Returns the result if the operation completes within the timeout,
/// or panics with a timeout message if it doesn't.
#[allow(dead_code)]
pub async fn with_timeout<T, F>(fut: F) -> T
where
    F: std::future::Future<Output = T>,
{
    tokio::time::timeout(TEST_TIMEOUT, fut)
        .await
        .expect("Test operation timed out")
}

/// Everything an engine under test talks to.
#[allow(dead_code)]
pub struct Harness {
    pub signal: Arc<ManualSignal>,
    pub remote: Arc<InMemoryCollection>,
    pub cache: Arc<SledCache>,
}

#[allow(dead_code)]
impl Harness {
    pub fn new(connected: bool) -> Self {
        Self::with_cache(connected, SledCache::open_temporary().unwrap())
    }

    pub fn with_cache(connected: bool, cache: SledCache) -> Self {
        Self {
            signal: Arc::new(ManualSignal::new(connected)),
            remote: Arc::new(InMemoryCollection::new()),
            cache: Arc::new(cache),
        }
    }

    pub fn start(&self) -> SyncHandle {
        self.start_with_debounce(Duration::ZERO)
    }

    pub fn start_with_debounce(&self, debounce: Duration) -> SyncHandle {
        let monitor = ConnectivityMonitor::new(self.signal.clone() as Arc<dyn NetworkSignal>)
            .with_debounce(debounce);
        SyncEngine::new(
            monitor,
            self.remote.clone(),
            self.cache.clone(),
            Sender::assistant("Assistant"),
        )
        .start()
    }
}

#[allow(dead_code)]
pub fn alice() -> Sender {
    Sender::new("alice-id", "Alice")
}

#[allow(dead_code)]
pub fn text(body: &str) -> Message {
    Message::text(alice(), body)
}

/// Wait until the visible list satisfies `predicate`.
#[allow(dead_code)]
pub async fn wait_for_messages<F>(handle: &SyncHandle, predicate: F) -> ConversationSnapshot
where
    F: Fn(&ConversationSnapshot) -> bool,
{
    let mut rx = handle.watch_messages();
    with_timeout(async {
        let snapshot = rx.wait_for(|snapshot| predicate(snapshot)).await.unwrap();
        snapshot.clone()
    })
    .await
}

#[allow(dead_code)]
pub async fn wait_for_state(handle: &SyncHandle, state: EngineState) {
    let mut rx = handle.watch_state();
    with_timeout(async {
        rx.wait_for(|current| *current == state).await.unwrap();
    })
    .await
}

/// Poll until `condition` holds.
#[allow(dead_code)]
pub async fn eventually<F>(condition: F)
where
    F: Fn() -> bool,
{
    with_timeout(async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
}

//! Remote message collection and its live snapshot stream.

use crate::chat::connectivity::ConnectivityState;
use crate::chat::types::{ConversationSnapshot, MessageRecord};
use crate::error::{Error, Result};
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::debug;

/// Live view of the full record set, newest first.
pub type RecordFeed = watch::Receiver<Vec<MessageRecord>>;

/// An append-only, ordered collection hosted by an external data service.
#[async_trait]
pub trait RemoteCollection: Send + Sync {
    /// Subscribe to the collection. The feed always holds the complete set.
    async fn subscribe(&self) -> Result<RecordFeed>;

    /// Append a record. Writing an id that already exists is a no-op.
    async fn add(&self, record: MessageRecord) -> Result<()>;
}

/// Process-local collection, used by tests and the terminal client.
#[derive(Debug)]
pub struct InMemoryCollection {
    records: watch::Sender<Vec<MessageRecord>>,
    reachable: AtomicBool,
    /// Writes accepted before further writes are rejected.
    write_budget: AtomicUsize,
}

impl Default for InMemoryCollection {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryCollection {
    pub fn new() -> Self {
        let (records, _) = watch::channel(Vec::new());
        Self {
            records,
            reachable: AtomicBool::new(true),
            write_budget: AtomicUsize::new(usize::MAX),
        }
    }

    /// Simulate the service becoming (un)reachable.
    pub fn set_reachable(&self, reachable: bool) {
        self.reachable.store(reachable, Ordering::Release);
    }

    pub fn is_reachable(&self) -> bool {
        self.reachable.load(Ordering::Acquire)
    }

    /// Accept only `writes` more writes, then reject the rest.
    pub fn limit_writes(&self, writes: usize) {
        self.write_budget.store(writes, Ordering::Release);
    }

    /// Copy of the stored records, newest first.
    pub fn records(&self) -> Vec<MessageRecord> {
        self.records.borrow().clone()
    }

    pub fn len(&self) -> usize {
        self.records.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.borrow().is_empty()
    }

    fn take_write_slot(&self) -> bool {
        self.write_budget
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |budget| match budget {
                usize::MAX => Some(usize::MAX),
                0 => None,
                n => Some(n - 1),
            })
            .is_ok()
    }
}

#[async_trait]
impl RemoteCollection for InMemoryCollection {
    async fn subscribe(&self) -> Result<RecordFeed> {
        if !self.is_reachable() {
            return Err(Error::NotConnected);
        }
        Ok(self.records.subscribe())
    }

    async fn add(&self, record: MessageRecord) -> Result<()> {
        if !self.is_reachable() {
            return Err(Error::DispatchFailed("remote collection unreachable".to_string()));
        }
        if !self.take_write_slot() {
            return Err(Error::DispatchFailed("write rejected".to_string()));
        }

        self.records.send_if_modified(|records| {
            if records.iter().any(|r| r.id == record.id) {
                return false;
            }
            // Newest first, ties by ascending id, matching ConversationSnapshot.
            let position = records
                .iter()
                .position(|r| {
                    r.created_at < record.created_at
                        || (r.created_at == record.created_at && r.id > record.id)
                })
                .unwrap_or(records.len());
            records.insert(position, record);
            true
        });
        Ok(())
    }
}

/// Output of an open stream, tagged with the epoch it was opened under.
#[derive(Debug, Clone)]
pub enum StreamEvent {
    Snapshot {
        epoch: u64,
        snapshot: ConversationSnapshot,
    },
    Failed {
        epoch: u64,
        error: String,
    },
}

impl StreamEvent {
    pub fn epoch(&self) -> u64 {
        match self {
            StreamEvent::Snapshot { epoch, .. } | StreamEvent::Failed { epoch, .. } => *epoch,
        }
    }
}

/// Opens snapshot subscriptions against a [`RemoteCollection`].
#[derive(Clone)]
pub struct RemoteMessageStream {
    remote: Arc<dyn RemoteCollection>,
}

impl RemoteMessageStream {
    pub fn new(remote: Arc<dyn RemoteCollection>) -> Self {
        Self { remote }
    }

    /// Start delivering full snapshots into `sink`.
    ///
    /// Fails with [`Error::NotConnected`] when `connectivity` is offline.
    /// Every event carries `connectivity.transition` as its epoch.
    pub fn open(
        &self,
        connectivity: ConnectivityState,
        sink: mpsc::UnboundedSender<StreamEvent>,
    ) -> Result<StreamHandle> {
        if !connectivity.connected {
            return Err(Error::NotConnected);
        }

        let epoch = connectivity.transition;
        let closed = Arc::new(AtomicBool::new(false));
        let task_closed = closed.clone();
        let remote = self.remote.clone();

        let task = tokio::spawn(async move {
            let mut feed = match remote.subscribe().await {
                Ok(feed) => feed,
                Err(e) => {
                    if !task_closed.load(Ordering::Acquire) {
                        let _ = sink.send(StreamEvent::Failed {
                            epoch,
                            error: e.to_string(),
                        });
                    }
                    return;
                }
            };

            loop {
                let snapshot = ConversationSnapshot::from_records(&feed.borrow_and_update());
                if task_closed.load(Ordering::Acquire) {
                    break;
                }
                if sink.send(StreamEvent::Snapshot { epoch, snapshot }).is_err() {
                    break;
                }
                if feed.changed().await.is_err() {
                    debug!("Remote feed for epoch {} ended", epoch);
                    break;
                }
            }
        });

        debug!("Opened remote stream for epoch {}", epoch);
        Ok(StreamHandle {
            epoch,
            closed,
            task,
        })
    }
}

/// Ownership of an open stream. Closing (or dropping) stops deliveries.
#[derive(Debug)]
pub struct StreamHandle {
    epoch: u64,
    closed: Arc<AtomicBool>,
    task: JoinHandle<()>,
}

impl StreamHandle {
    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    /// Stop the stream. Idempotent.
    pub fn close(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            self.task.abort();
            debug!("Closed remote stream for epoch {}", self.epoch);
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

impl Drop for StreamHandle {
    fn drop(&mut self) {
        self.close();
    }
}

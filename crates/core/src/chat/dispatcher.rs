//! Outbound message delivery and the offline outbox.

use crate::chat::cache::{LocalCache, OutboxKey};
use crate::chat::connectivity::ConnectivityState;
use crate::chat::remote::RemoteCollection;
use crate::chat::types::{Message, MessageId, MessageRecord, Sender};
use crate::error::{Error, Result};
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// What happened to a dispatched message.
#[derive(Debug, Clone, PartialEq)]
pub enum DispatchOutcome {
    /// Written to the remote collection. `reply` is the automated reply,
    /// absent if writing it failed.
    Delivered {
        message_id: MessageId,
        reply: Option<Message>,
    },
    /// Offline; stored in the outbox until the next connected snapshot.
    Queued { message_id: MessageId },
}

impl DispatchOutcome {
    pub fn message_id(&self) -> &MessageId {
        match self {
            DispatchOutcome::Delivered { message_id, .. }
            | DispatchOutcome::Queued { message_id } => message_id,
        }
    }
}

/// Result of replaying the outbox.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FlushReport {
    /// Written to the remote collection, oldest first.
    pub sent: Vec<MessageId>,
    /// Already present remotely and dropped.
    pub skipped: Vec<MessageId>,
    /// Left in the outbox after a failed write.
    pub requeued: usize,
}

impl FlushReport {
    pub fn is_empty(&self) -> bool {
        self.sent.is_empty() && self.skipped.is_empty() && self.requeued == 0
    }
}

/// Writes outgoing messages and their automated replies.
pub struct OutboundDispatcher {
    remote: Arc<dyn RemoteCollection>,
    cache: Arc<dyn LocalCache>,
    assistant: Sender,
}

impl OutboundDispatcher {
    pub fn new(
        remote: Arc<dyn RemoteCollection>,
        cache: Arc<dyn LocalCache>,
        assistant: Sender,
    ) -> Self {
        Self {
            remote,
            cache,
            assistant,
        }
    }

    pub fn assistant(&self) -> &Sender {
        &self.assistant
    }

    /// Send `message` under the given connectivity.
    ///
    /// Connected: the message is written, then the automated reply. A failed
    /// message write queues it in the outbox and returns
    /// [`Error::DispatchFailed`]. Offline: the message is queued.
    pub async fn dispatch(
        &self,
        message: &Message,
        connectivity: ConnectivityState,
    ) -> Result<DispatchOutcome> {
        message.validate()?;
        let message_id = message.id.clone();

        if !connectivity.connected {
            self.enqueue(message);
            debug!("Queued message {} while offline", message_id);
            return Ok(DispatchOutcome::Queued { message_id });
        }

        let record = MessageRecord::from_message(message)?;
        if let Err(e) = self.remote.add(record).await {
            warn!("Failed to send message {}: {}", message_id, e);
            self.enqueue(message);
            return Err(Error::DispatchFailed(failure_reason(e)));
        }

        let reply = Message::automated_reply(message, &self.assistant);
        let reply = match self.write(&reply).await {
            Ok(()) => Some(reply),
            Err(e) => {
                warn!("Automated reply to {} failed: {}", message_id, e);
                None
            }
        };

        Ok(DispatchOutcome::Delivered { message_id, reply })
    }

    /// Replay the outbox, oldest first.
    ///
    /// Entries whose id is in `delivered` are dropped. Replayed messages keep
    /// their id and timestamp and get no automated reply. An entry leaves the
    /// outbox only after its write is acknowledged, so a flush that fails or
    /// is cancelled part way leaves the rest queued in order.
    pub async fn flush_outbox(&self, delivered: &HashSet<MessageId>) -> FlushReport {
        let entries = match self.cache.outbox_entries() {
            Ok(entries) => entries,
            Err(e) => {
                warn!("Failed to read outbox: {}", e);
                return FlushReport::default();
            }
        };

        let mut report = FlushReport::default();
        let mut remaining = entries.len();
        for (key, message) in entries {
            if delivered.contains(&message.id) {
                self.dequeue(&key, &message.id);
                report.skipped.push(message.id);
                remaining -= 1;
                continue;
            }

            if let Err(e) = self.write(&message).await {
                warn!("Outbox flush stopped at {}: {}", message.id, e);
                break;
            }
            self.dequeue(&key, &message.id);
            report.sent.push(message.id);
            remaining -= 1;
        }
        report.requeued = remaining;

        if !report.is_empty() {
            info!(
                "Outbox flushed: {} sent, {} skipped, {} requeued",
                report.sent.len(),
                report.skipped.len(),
                report.requeued
            );
        }
        report
    }

    async fn write(&self, message: &Message) -> Result<()> {
        self.remote.add(MessageRecord::from_message(message)?).await
    }

    fn enqueue(&self, message: &Message) {
        if let Err(e) = self.cache.append_outbox(message) {
            warn!("Failed to queue message {}: {}", message.id, e);
        }
    }

    // A failed remove means a resend on the next flush; the remote ignores
    // ids it already has.
    fn dequeue(&self, key: &OutboxKey, id: &MessageId) {
        if let Err(e) = self.cache.remove_outbox(key) {
            warn!("Failed to clear outbox entry {}: {}", id, e);
        }
    }
}

fn failure_reason(error: Error) -> String {
    match error {
        Error::DispatchFailed(reason) => reason,
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chat::cache::SledCache;
    use crate::chat::remote::InMemoryCollection;
    use crate::chat::types::reply_text;

    struct Fixture {
        remote: Arc<InMemoryCollection>,
        cache: Arc<SledCache>,
        dispatcher: OutboundDispatcher,
    }

    fn fixture() -> Fixture {
        let remote = Arc::new(InMemoryCollection::new());
        let cache = Arc::new(SledCache::open_temporary().unwrap());
        let dispatcher =
            OutboundDispatcher::new(remote.clone(), cache.clone(), Sender::assistant("Bot"));
        Fixture {
            remote,
            cache,
            dispatcher,
        }
    }

    fn alice(text: &str) -> Message {
        Message::text(Sender::new("u1", "Alice"), text)
    }

    const ONLINE: ConnectivityState = ConnectivityState {
        connected: true,
        transition: 1,
    };

    const OFFLINE: ConnectivityState = ConnectivityState {
        connected: false,
        transition: 2,
    };

    #[tokio::test]
    async fn test_connected_dispatch_writes_message_then_reply() {
        let f = fixture();
        let message = alice("hi");

        let outcome = f.dispatcher.dispatch(&message, ONLINE).await.unwrap();
        let reply = match outcome {
            DispatchOutcome::Delivered { message_id, reply } => {
                assert_eq!(message_id, message.id);
                reply.unwrap()
            }
            other => panic!("unexpected outcome: {:?}", other),
        };

        assert_eq!(reply.text.as_deref(), Some(reply_text("Alice").as_str()));
        assert!(reply.sender.is_assistant());
        assert!(reply.created_at > message.created_at);

        let records = f.remote.records();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].id, reply.id.0);
        assert_eq!(records[1].id, message.id.0);
        assert_eq!(f.cache.outbox_len(), 0);
    }

    #[tokio::test]
    async fn test_offline_dispatch_queues() {
        let f = fixture();
        let message = alice("later");

        let outcome = f.dispatcher.dispatch(&message, OFFLINE).await.unwrap();
        assert_eq!(
            outcome,
            DispatchOutcome::Queued {
                message_id: message.id.clone()
            }
        );
        assert!(f.remote.is_empty());
        assert_eq!(f.cache.pending_outbox().unwrap(), vec![message]);
    }

    #[tokio::test]
    async fn test_failed_write_queues_and_reports() {
        let f = fixture();
        f.remote.set_reachable(false);
        let message = alice("lost?");

        let err = f.dispatcher.dispatch(&message, ONLINE).await.unwrap_err();
        match err {
            Error::DispatchFailed(reason) => assert_eq!(reason, "remote collection unreachable"),
            other => panic!("unexpected error: {:?}", other),
        }
        assert_eq!(f.cache.pending_outbox().unwrap(), vec![message]);
    }

    #[tokio::test]
    async fn test_failed_reply_still_delivers() {
        let f = fixture();
        f.remote.limit_writes(1);
        let message = alice("hi");

        let outcome = f.dispatcher.dispatch(&message, ONLINE).await.unwrap();
        assert!(matches!(outcome, DispatchOutcome::Delivered { reply: None, .. }));
        assert_eq!(f.remote.len(), 1);
        assert_eq!(f.cache.outbox_len(), 0);
    }

    #[tokio::test]
    async fn test_invalid_message_is_rejected_without_queueing() {
        let f = fixture();
        let blank = alice("   ");

        assert!(matches!(
            f.dispatcher.dispatch(&blank, OFFLINE).await,
            Err(Error::InvalidMessage(_))
        ));
        assert_eq!(f.cache.outbox_len(), 0);
    }

    #[tokio::test]
    async fn test_flush_sends_in_order_and_skips_delivered() {
        let f = fixture();
        let first = alice("first");
        let known = alice("already there");
        let last = alice("last");
        for message in [&first, &known, &last] {
            f.dispatcher.dispatch(message, OFFLINE).await.unwrap();
        }

        let delivered: HashSet<MessageId> = [known.id.clone()].into_iter().collect();
        let report = f.dispatcher.flush_outbox(&delivered).await;

        assert_eq!(report.sent, vec![first.id.clone(), last.id.clone()]);
        assert_eq!(report.skipped, vec![known.id.clone()]);
        assert_eq!(report.requeued, 0);
        assert_eq!(f.cache.outbox_len(), 0);

        // No automated replies for replayed messages.
        let records = f.remote.records();
        assert_eq!(records.len(), 2);
        let stored = records.iter().find(|r| r.id == first.id.0).unwrap();
        assert_eq!(stored.created_at, first.created_at.timestamp_millis());
    }

    #[tokio::test]
    async fn test_flush_stops_at_first_failure() {
        let f = fixture();
        let messages: Vec<_> = ["a", "b", "c"].iter().map(|t| alice(t)).collect();
        for message in &messages {
            f.dispatcher.dispatch(message, OFFLINE).await.unwrap();
        }

        f.remote.limit_writes(1);
        let report = f.dispatcher.flush_outbox(&HashSet::new()).await;

        assert_eq!(report.sent, vec![messages[0].id.clone()]);
        assert_eq!(report.requeued, 2);
        assert_eq!(f.cache.pending_outbox().unwrap(), messages[1..].to_vec());
    }

    /// Remote whose writes never complete.
    struct StalledCollection;

    #[async_trait::async_trait]
    impl RemoteCollection for StalledCollection {
        async fn subscribe(&self) -> Result<crate::chat::RecordFeed> {
            Err(Error::NotConnected)
        }

        async fn add(&self, _record: MessageRecord) -> Result<()> {
            std::future::pending().await
        }
    }

    #[tokio::test]
    async fn test_cancelled_flush_keeps_outbox() {
        let cache = Arc::new(SledCache::open_temporary().unwrap());
        let queued = alice("written offline");
        cache.append_outbox(&queued).unwrap();

        let dispatcher = Arc::new(OutboundDispatcher::new(
            Arc::new(StalledCollection),
            cache.clone(),
            Sender::assistant("Bot"),
        ));
        let flushing = dispatcher.clone();
        let task = tokio::spawn(async move { flushing.flush_outbox(&HashSet::new()).await });

        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert_eq!(cache.outbox_len(), 1);

        task.abort();
        assert!(task.await.unwrap_err().is_cancelled());
        assert_eq!(cache.pending_outbox().unwrap(), vec![queued]);
    }

    #[tokio::test]
    async fn test_flush_of_empty_outbox() {
        let f = fixture();
        let report = f.dispatcher.flush_outbox(&HashSet::new()).await;
        assert!(report.is_empty());
    }
}

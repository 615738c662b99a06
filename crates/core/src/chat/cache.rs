//! Local message cache using Sled embedded database.

use crate::chat::types::{ConversationSnapshot, Message, MessageRecord};
use crate::error::{Error, Result};
use sled::{Db, Tree};
use std::path::Path;
use tracing::warn;

/// Key under which the last known conversation is stored.
const MESSAGES_KEY: &[u8] = b"messages";

/// Durable storage of the last known conversation and the outbox.
pub trait LocalCache: Send + Sync {
    /// Read the last saved conversation.
    fn load(&self) -> Result<ConversationSnapshot>;

    /// Overwrite the saved conversation. System messages are not stored.
    fn save(&self, snapshot: &ConversationSnapshot) -> Result<()>;

    /// Queue a message that has not reached the remote collection.
    fn append_outbox(&self, message: &Message) -> Result<()>;

    /// Queued messages with their outbox keys, oldest first.
    fn outbox_entries(&self) -> Result<Vec<(OutboxKey, Message)>>;

    /// Drop a queued message once the remote collection has it.
    /// Removing a key that is already gone is not an error.
    fn remove_outbox(&self, key: &OutboxKey) -> Result<()>;

    /// Queued messages, oldest first, without removing them.
    fn pending_outbox(&self) -> Result<Vec<Message>> {
        Ok(self
            .outbox_entries()?
            .into_iter()
            .map(|(_, message)| message)
            .collect())
    }
}

/// Position of a message in the outbox.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct OutboxKey(Vec<u8>);

/// Load the cached conversation, treating any failure as empty.
pub fn load_or_empty(cache: &dyn LocalCache) -> ConversationSnapshot {
    cache.load().unwrap_or_else(|e| {
        warn!("Failed to load cached conversation: {}", e);
        ConversationSnapshot::empty()
    })
}

/// Save the conversation, logging instead of failing.
pub fn save_or_log(cache: &dyn LocalCache, snapshot: &ConversationSnapshot) {
    if let Err(e) = cache.save(snapshot) {
        warn!("Failed to cache conversation: {}", e);
    }
}

/// Queued messages, treating any failure as none.
pub fn pending_or_empty(cache: &dyn LocalCache) -> Vec<Message> {
    cache.pending_outbox().unwrap_or_else(|e| {
        warn!("Failed to read outbox: {}", e);
        Vec::new()
    })
}

/// What the user sees while offline: the cache plus anything still queued.
pub fn offline_view(cache: &dyn LocalCache) -> ConversationSnapshot {
    load_or_empty(cache).merged(pending_or_empty(cache))
}

/// Sled-backed [`LocalCache`].
///
/// Database structure:
/// - `conversation`: `messages` -> Vec<MessageRecord> (JSON)
/// - `outbox`: monotonic id (zero padded) -> MessageRecord (JSON)
pub struct SledCache {
    db: Db,
    conversation: Tree,
    outbox: Tree,
}

impl SledCache {
    /// Open or create the cache at `path`.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let db = sled::open(path).map_err(|e| {
            Error::CacheUnavailable(format!("failed to open {}: {}", path.display(), e))
        })?;
        Self::from_db(db)
    }

    /// Open a cache that is discarded on drop.
    pub fn open_temporary() -> Result<Self> {
        let db = sled::Config::new().temporary(true).open()?;
        Self::from_db(db)
    }

    fn from_db(db: Db) -> Result<Self> {
        Ok(Self {
            conversation: db.open_tree("conversation")?,
            outbox: db.open_tree("outbox")?,
            db,
        })
    }

    /// Number of queued messages.
    pub fn outbox_len(&self) -> usize {
        self.outbox.len()
    }

    fn decode_outbox(&self, data: &[u8]) -> Option<Message> {
        let decoded = serde_json::from_slice::<MessageRecord>(data)
            .map_err(Error::from)
            .and_then(|record| record.to_message());
        match decoded {
            Ok(message) => Some(message),
            Err(e) => {
                warn!("Dropping unreadable outbox entry: {}", e);
                None
            }
        }
    }
}

impl LocalCache for SledCache {
    fn load(&self) -> Result<ConversationSnapshot> {
        match self.conversation.get(MESSAGES_KEY)? {
            Some(data) => {
                let records: Vec<MessageRecord> = serde_json::from_slice(&data)?;
                Ok(ConversationSnapshot::from_records(&records))
            }
            None => Ok(ConversationSnapshot::empty()),
        }
    }

    fn save(&self, snapshot: &ConversationSnapshot) -> Result<()> {
        let data = serde_json::to_vec(&snapshot.to_records())?;
        self.conversation.insert(MESSAGES_KEY, data)?;
        self.conversation.flush()?;
        Ok(())
    }

    fn append_outbox(&self, message: &Message) -> Result<()> {
        let record = MessageRecord::from_message(message)?;
        let data = serde_json::to_vec(&record)?;
        let key = format!("{:020}", self.db.generate_id()?);
        self.outbox.insert(key.as_bytes(), data)?;
        self.outbox.flush()?;
        Ok(())
    }

    fn outbox_entries(&self) -> Result<Vec<(OutboxKey, Message)>> {
        let mut entries = Vec::new();
        for item in self.outbox.iter() {
            let (key, data) = item?;
            if let Some(message) = self.decode_outbox(&data) {
                entries.push((OutboxKey(key.to_vec()), message));
            }
        }
        Ok(entries)
    }

    fn remove_outbox(&self, key: &OutboxKey) -> Result<()> {
        self.outbox.remove(&key.0)?;
        self.outbox.flush()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chat::types::{Attachment, GeoPoint, Sender};
    use tempfile::TempDir;

    fn alice() -> Sender {
        Sender::new("u1", "Alice")
    }

    #[test]
    fn test_empty_cache_loads_empty() {
        let cache = SledCache::open_temporary().unwrap();
        assert!(cache.load().unwrap().is_empty());
        assert!(cache.pending_outbox().unwrap().is_empty());
    }

    #[test]
    fn test_attachments_survive_save_and_load() {
        let cache = SledCache::open_temporary().unwrap();
        let image = Message::with_attachment(alice(), Attachment::image("https://x/y.jpg"));
        let location = Message::with_attachment(
            alice(),
            Attachment::Location(GeoPoint::new(52.52, 13.405).unwrap()),
        );
        let snapshot = ConversationSnapshot::new([image.clone(), location.clone()]);

        cache.save(&snapshot).unwrap();
        let loaded = cache.load().unwrap();

        assert_eq!(loaded, snapshot);
        assert_eq!(
            loaded.get(&image.id).unwrap().attachment.image_url(),
            Some("https://x/y.jpg")
        );
        assert_eq!(
            loaded.get(&location.id).unwrap().attachment.location(),
            location.attachment.location()
        );
    }

    #[test]
    fn test_system_messages_are_not_saved() {
        let cache = SledCache::open_temporary().unwrap();
        let snapshot = ConversationSnapshot::new([
            Message::text(alice(), "hi"),
            Message::system_notice("You have entered the chat"),
        ]);

        cache.save(&snapshot).unwrap();
        let loaded = cache.load().unwrap();
        assert_eq!(loaded.len(), 1);
        assert!(loaded.iter().all(|m| !m.system));
    }

    #[test]
    fn test_outbox_keeps_order_until_removed() {
        let cache = SledCache::open_temporary().unwrap();
        let first = Message::text(alice(), "first");
        let second = Message::text(alice(), "second");

        cache.append_outbox(&first).unwrap();
        cache.append_outbox(&second).unwrap();
        assert_eq!(cache.outbox_len(), 2);

        let pending = cache.pending_outbox().unwrap();
        assert_eq!(pending, vec![first.clone(), second.clone()]);

        // Reading leaves everything queued.
        let entries = cache.outbox_entries().unwrap();
        assert_eq!(entries.len(), 2);
        assert!(entries[0].0 < entries[1].0);
        assert_eq!(cache.outbox_len(), 2);

        cache.remove_outbox(&entries[0].0).unwrap();
        assert_eq!(cache.pending_outbox().unwrap(), vec![second]);

        cache.remove_outbox(&entries[0].0).unwrap();
        cache.remove_outbox(&entries[1].0).unwrap();
        assert_eq!(cache.outbox_len(), 0);
    }

    #[test]
    fn test_system_message_cannot_be_queued() {
        let cache = SledCache::open_temporary().unwrap();
        assert!(cache
            .append_outbox(&Message::system_notice("notice"))
            .is_err());
        assert_eq!(cache.outbox_len(), 0);
    }

    #[test]
    fn test_corrupt_conversation_loads_as_empty() {
        let cache = SledCache::open_temporary().unwrap();
        cache.conversation.insert(MESSAGES_KEY, &b"not json"[..]).unwrap();

        assert!(cache.load().is_err());
        assert!(load_or_empty(&cache).is_empty());
    }

    #[test]
    fn test_offline_view_merges_outbox() {
        let cache = SledCache::open_temporary().unwrap();
        let cached = Message::text(alice(), "cached");
        let queued = Message::text(alice(), "queued");

        cache.save(&ConversationSnapshot::new([cached.clone()])).unwrap();
        cache.append_outbox(&queued).unwrap();

        let view = offline_view(&cache);
        assert_eq!(view.len(), 2);
        assert!(view.contains(&cached.id));
        assert!(view.contains(&queued.id));
    }

    #[test]
    fn test_survives_reopen() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("cache.db");
        let saved = Message::text(alice(), "saved");
        let queued = Message::text(alice(), "queued");

        {
            let cache = SledCache::open(&path).unwrap();
            cache.save(&ConversationSnapshot::new([saved.clone()])).unwrap();
            cache.append_outbox(&queued).unwrap();
        }

        let cache = SledCache::open(&path).unwrap();
        assert!(cache.load().unwrap().contains(&saved.id));
        assert_eq!(cache.pending_outbox().unwrap(), vec![queued]);
    }
}

//! Core data types for the chat system.

use crate::error::{Error, Result};
use chrono::{DateTime, SubsecRound, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// Text of the informational entry shown when a session starts.
pub const ENTERED_CHAT_NOTICE: &str = "You have entered the chat";

/// Sender id reserved for the automated reply identity.
pub const ASSISTANT_ID: &str = "assistant";

/// Sender id reserved for client-local informational entries.
pub const SYSTEM_ID: &str = "system";

/// Text of the automated reply addressed to `display_name`.
pub fn reply_text(display_name: &str) -> String {
    format!("Hello {}, How can I help you?", display_name)
}

/// Current time truncated to millisecond precision, the resolution records carry.
pub fn now_millis() -> DateTime<Utc> {
    Utc::now().trunc_subsecs(3)
}

/// Unique identifier for a chat message.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MessageId(pub String);

impl MessageId {
    /// Create a new random message ID.
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    /// Get the ID as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for MessageId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for MessageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for MessageId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for MessageId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Author of a message.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Sender {
    pub id: String,
    pub display_name: String,
}

impl Sender {
    pub fn new(id: impl Into<String>, display_name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            display_name: display_name.into(),
        }
    }

    /// The fixed identity automated replies are attributed to.
    pub fn assistant(display_name: &str) -> Self {
        Self::new(ASSISTANT_ID, display_name)
    }

    /// The author of client-local informational entries.
    pub fn system() -> Self {
        Self::new(SYSTEM_ID, "")
    }

    pub fn is_assistant(&self) -> bool {
        self.id == ASSISTANT_ID
    }
}

/// A geographic coordinate pair.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoPoint {
    pub latitude: f64,
    pub longitude: f64,
}

impl GeoPoint {
    /// Create a validated coordinate.
    pub fn new(latitude: f64, longitude: f64) -> Result<Self> {
        let point = Self {
            latitude,
            longitude,
        };
        point.validate()?;
        Ok(point)
    }

    fn validate(&self) -> Result<()> {
        if !self.latitude.is_finite() || !(-90.0..=90.0).contains(&self.latitude) {
            return Err(Error::InvalidMessage(format!(
                "latitude out of range: {}",
                self.latitude
            )));
        }
        if !self.longitude.is_finite() || !(-180.0..=180.0).contains(&self.longitude) {
            return Err(Error::InvalidMessage(format!(
                "longitude out of range: {}",
                self.longitude
            )));
        }
        Ok(())
    }
}

/// Content embedded in a message besides its text. At most one per message.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Attachment {
    #[default]
    None,
    Image {
        url: String,
    },
    Location(GeoPoint),
}

impl Attachment {
    pub fn image(url: impl Into<String>) -> Self {
        Attachment::Image { url: url.into() }
    }

    pub fn is_none(&self) -> bool {
        matches!(self, Attachment::None)
    }

    pub fn image_url(&self) -> Option<&str> {
        match self {
            Attachment::Image { url } => Some(url),
            _ => None,
        }
    }

    pub fn location(&self) -> Option<GeoPoint> {
        match self {
            Attachment::Location(point) => Some(*point),
            _ => None,
        }
    }
}

/// A single chat message. Never mutated after creation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// Unique message identifier.
    pub id: MessageId,
    /// Message text; may be absent when an attachment is present.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    /// When the message was composed (UTC, millisecond precision).
    pub created_at: DateTime<Utc>,
    /// Who wrote it.
    pub sender: Sender,
    /// Image or location payload.
    #[serde(default)]
    pub attachment: Attachment,
    /// Client-local informational entry; never persisted or sent.
    #[serde(default)]
    pub system: bool,
}

impl Message {
    /// Maximum allowed text length (10KB).
    pub const MAX_TEXT_LENGTH: usize = 10 * 1024;

    /// Create a new outgoing text message.
    pub fn text(sender: Sender, text: impl Into<String>) -> Self {
        Self {
            id: MessageId::new(),
            text: Some(text.into()),
            created_at: now_millis(),
            sender,
            attachment: Attachment::None,
            system: false,
        }
    }

    /// Create a new outgoing message carrying an attachment.
    pub fn with_attachment(sender: Sender, attachment: Attachment) -> Self {
        Self {
            id: MessageId::new(),
            text: None,
            created_at: now_millis(),
            sender,
            attachment,
            system: false,
        }
    }

    /// Create a client-local informational entry.
    pub fn system_notice(text: impl Into<String>) -> Self {
        Self {
            id: MessageId::new(),
            text: Some(text.into()),
            created_at: now_millis(),
            sender: Sender::system(),
            attachment: Attachment::None,
            system: true,
        }
    }

    /// Synthesize the scripted reply to `original`.
    ///
    /// The reply is always stamped strictly after the message it answers.
    pub fn automated_reply(original: &Message, assistant: &Sender) -> Self {
        let floor = original.created_at + chrono::Duration::milliseconds(1);
        Self {
            id: MessageId::new(),
            text: Some(reply_text(&original.sender.display_name)),
            created_at: now_millis().max(floor),
            sender: assistant.clone(),
            attachment: Attachment::None,
            system: false,
        }
    }

    /// Text with surrounding whitespace removed, if any remains.
    pub fn body(&self) -> Option<&str> {
        self.text
            .as_deref()
            .map(str::trim)
            .filter(|text| !text.is_empty())
    }

    /// Check the message may be sent or stored.
    pub fn validate(&self) -> Result<()> {
        if self.system {
            return Err(Error::InvalidMessage(
                "system messages are client-local".to_string(),
            ));
        }
        if self.id.as_str().is_empty() {
            return Err(Error::InvalidMessage("message id cannot be empty".to_string()));
        }
        if let Some(text) = &self.text {
            if text.len() > Self::MAX_TEXT_LENGTH {
                return Err(Error::InvalidMessage(format!(
                    "message text exceeds maximum length of {} bytes",
                    Self::MAX_TEXT_LENGTH
                )));
            }
        }
        match &self.attachment {
            Attachment::None if self.body().is_none() => Err(Error::InvalidMessage(
                "message needs text or an attachment".to_string(),
            )),
            Attachment::Image { url } if url.trim().is_empty() => Err(Error::InvalidMessage(
                "image url cannot be empty".to_string(),
            )),
            Attachment::Location(point) => point.validate(),
            _ => Ok(()),
        }
    }
}

/// Author fields as stored in a record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordUser {
    #[serde(rename = "_id")]
    pub id: String,
    pub name: String,
}

/// Wire shape of a message in the remote collection and the local cache.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageRecord {
    #[serde(rename = "_id")]
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    /// Unix timestamp millis.
    pub created_at: i64,
    pub user: RecordUser,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<GeoPoint>,
}

impl MessageRecord {
    /// Convert from a Message. System messages have no record form.
    pub fn from_message(msg: &Message) -> Result<Self> {
        if msg.system {
            return Err(Error::InvalidMessage(
                "system messages are never persisted".to_string(),
            ));
        }
        let (image, location) = match &msg.attachment {
            Attachment::None => (None, None),
            Attachment::Image { url } => (Some(url.clone()), None),
            Attachment::Location(point) => (None, Some(*point)),
        };
        Ok(Self {
            id: msg.id.0.clone(),
            text: msg.text.clone(),
            created_at: msg.created_at.timestamp_millis(),
            user: RecordUser {
                id: msg.sender.id.clone(),
                name: msg.sender.display_name.clone(),
            },
            image,
            location,
        })
    }

    /// Convert to a Message.
    pub fn to_message(&self) -> Result<Message> {
        let created_at = Utc
            .timestamp_millis_opt(self.created_at)
            .single()
            .ok_or_else(|| {
                Error::InvalidMessage(format!("invalid createdAt: {}", self.created_at))
            })?;
        let attachment = match (&self.image, self.location) {
            (None, None) => Attachment::None,
            (Some(url), None) => Attachment::Image { url: url.clone() },
            (None, Some(point)) => Attachment::Location(point),
            (Some(_), Some(_)) => {
                return Err(Error::InvalidMessage(format!(
                    "record {} carries both image and location",
                    self.id
                )))
            }
        };
        Ok(Message {
            id: MessageId(self.id.clone()),
            text: self.text.clone(),
            created_at,
            sender: Sender::new(self.user.id.clone(), self.user.name.clone()),
            attachment,
            system: false,
        })
    }
}

/// Ordered, complete view of a conversation.
///
/// Always sorted by `created_at` descending (ties by id) with unique ids.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConversationSnapshot {
    messages: Vec<Message>,
}

impl ConversationSnapshot {
    /// Build a snapshot; the first occurrence of a duplicated id wins.
    pub fn new(messages: impl IntoIterator<Item = Message>) -> Self {
        let mut seen = HashSet::new();
        let mut messages: Vec<Message> = messages
            .into_iter()
            .filter(|m| seen.insert(m.id.clone()))
            .collect();
        messages.sort_by(|a, b| {
            b.created_at
                .cmp(&a.created_at)
                .then_with(|| a.id.cmp(&b.id))
        });
        Self { messages }
    }

    pub fn empty() -> Self {
        Self::default()
    }

    /// Build a snapshot from records, skipping ones that fail to convert.
    pub fn from_records(records: &[MessageRecord]) -> Self {
        Self::new(records.iter().filter_map(|record| match record.to_message() {
            Ok(msg) => Some(msg),
            Err(e) => {
                tracing::warn!("Skipping malformed record {}: {}", record.id, e);
                None
            }
        }))
    }

    /// Record form of every persistable message.
    pub fn to_records(&self) -> Vec<MessageRecord> {
        self.messages
            .iter()
            .filter(|m| !m.system)
            .filter_map(|m| MessageRecord::from_message(m).ok())
            .collect()
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn into_messages(self) -> Vec<Message> {
        self.messages
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Message> {
        self.messages.iter()
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn contains(&self, id: &MessageId) -> bool {
        self.messages.iter().any(|m| &m.id == id)
    }

    pub fn get(&self, id: &MessageId) -> Option<&Message> {
        self.messages.iter().find(|m| &m.id == id)
    }

    /// Newest message, if any.
    pub fn latest(&self) -> Option<&Message> {
        self.messages.first()
    }

    pub fn ids(&self) -> HashSet<MessageId> {
        self.messages.iter().map(|m| m.id.clone()).collect()
    }

    /// A new snapshot with `extra` merged in; existing entries win on id clashes.
    pub fn merged(&self, extra: impl IntoIterator<Item = Message>) -> Self {
        Self::new(self.messages.iter().cloned().chain(extra))
    }

    /// A new snapshot without client-local entries.
    pub fn without_system(&self) -> Self {
        Self {
            messages: self.messages.iter().filter(|m| !m.system).cloned().collect(),
        }
    }
}

impl<'a> IntoIterator for &'a ConversationSnapshot {
    type Item = &'a Message;
    type IntoIter = std::slice::Iter<'a, Message>;

    fn into_iter(self) -> Self::IntoIter {
        self.messages.iter()
    }
}

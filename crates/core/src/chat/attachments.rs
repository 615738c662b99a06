//! Composing outgoing messages, including image and location attachments.

use crate::chat::types::{Attachment, GeoPoint, Message, Sender};
use crate::error::{Error, Result};
use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, warn};

/// Outcome of asking the platform for an attachment.
#[derive(Debug, Clone, PartialEq)]
pub enum Capture<T> {
    Captured(T),
    /// The user dismissed the picker.
    Cancelled,
    /// The platform refused access.
    PermissionDenied,
}

impl<T> Capture<T> {
    pub fn into_result(self) -> Result<T> {
        match self {
            Capture::Captured(value) => Ok(value),
            Capture::Cancelled => Err(Error::Cancelled),
            Capture::PermissionDenied => Err(Error::PermissionDenied),
        }
    }
}

/// Where an image comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageSource {
    Library,
    Camera,
}

/// Platform capabilities for producing attachments.
#[async_trait]
pub trait AttachmentProvider: Send + Sync {
    /// Pick or take an image and return its URL.
    async fn capture_image(&self, source: ImageSource) -> Capture<String>;

    /// Read the current position.
    async fn capture_location(&self) -> Capture<GeoPoint>;
}

/// Entries of the composer's action sheet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ComposerAction {
    PickImage,
    TakePhoto,
    ShareLocation,
    Cancel,
}

impl ComposerAction {
    /// Sheet entries in display order.
    pub const ALL: [ComposerAction; 4] = [
        ComposerAction::PickImage,
        ComposerAction::TakePhoto,
        ComposerAction::ShareLocation,
        ComposerAction::Cancel,
    ];

    pub fn label(&self) -> &'static str {
        match self {
            ComposerAction::PickImage => "Select an image from library",
            ComposerAction::TakePhoto => "Take a photo",
            ComposerAction::ShareLocation => "Share location",
            ComposerAction::Cancel => "Cancel",
        }
    }

    pub fn from_index(index: usize) -> Option<Self> {
        Self::ALL.get(index).copied()
    }
}

/// Presents the action sheet and reports the user's choice.
pub trait ActionChooser: Send + Sync {
    fn choose(&self, actions: &[ComposerAction]) -> ComposerAction;
}

/// Builds outgoing messages for one author.
#[derive(Clone)]
pub struct Composer {
    author: Sender,
    provider: Arc<dyn AttachmentProvider>,
}

impl Composer {
    pub fn new(author: Sender, provider: Arc<dyn AttachmentProvider>) -> Self {
        Self { author, provider }
    }

    pub fn author(&self) -> &Sender {
        &self.author
    }

    /// A validated text message.
    pub fn text(&self, text: &str) -> Result<Message> {
        let message = Message::text(self.author.clone(), text.trim());
        message.validate()?;
        Ok(message)
    }

    /// Show the action sheet and compose whatever the user picks.
    pub async fn choose_and_attach(&self, chooser: &dyn ActionChooser) -> Option<Message> {
        let action = chooser.choose(&ComposerAction::ALL);
        self.attach(action).await
    }

    /// Run `action`. Cancellation, denial and invalid captures yield nothing.
    pub async fn attach(&self, action: ComposerAction) -> Option<Message> {
        let attachment = match action {
            ComposerAction::PickImage => self.image(ImageSource::Library).await,
            ComposerAction::TakePhoto => self.image(ImageSource::Camera).await,
            ComposerAction::ShareLocation => self
                .provider
                .capture_location()
                .await
                .into_result()
                .map(Attachment::Location),
            ComposerAction::Cancel => Err(Error::Cancelled),
        };

        let message = match attachment {
            Ok(attachment) => Message::with_attachment(self.author.clone(), attachment),
            Err(e) => {
                debug!("{} produced no attachment: {}", action.label(), e);
                return None;
            }
        };

        match message.validate() {
            Ok(()) => Some(message),
            Err(e) => {
                warn!("Discarding captured attachment: {}", e);
                None
            }
        }
    }

    async fn image(&self, source: ImageSource) -> Result<Attachment> {
        self.provider
            .capture_image(source)
            .await
            .into_result()
            .map(Attachment::image)
    }
}

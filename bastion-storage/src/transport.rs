//! Chat-platform transport seam.
//!
//! The storage engine only needs a handful of message operations from the
//! platform client. Everything else about the gateway stays outside this
//! crate.

use async_trait::async_trait;
use bastion_core::{ChannelId, MessageId, TransportError, UserId};

/// A file attached to a message already on the platform.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteAttachment {
    pub filename: String,
    /// Download location of the attachment bytes.
    pub url: String,
}

/// A file to upload with a message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutgoingAttachment {
    pub filename: String,
    pub bytes: Vec<u8>,
}

/// New content for a message. `attachment: None` removes any existing file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageDraft {
    pub content: String,
    pub attachment: Option<OutgoingAttachment>,
}

/// A message as seen on the platform.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteMessage {
    pub id: MessageId,
    pub channel_id: ChannelId,
    pub author_id: UserId,
    pub content: String,
    pub attachments: Vec<RemoteAttachment>,
}

impl RemoteMessage {
    /// First line of the message content.
    pub fn header_line(&self) -> &str {
        self.content.lines().next().unwrap_or("")
    }
}

/// Message operations consumed from the chat platform.
///
/// Implementations must report a destroyed message or thread as
/// [`TransportError::NotFound`]; the write path relies on that
/// classification to self-heal.
#[async_trait]
pub trait ChatTransport: Send + Sync {
    /// The bot's own user id, used to recognise anchors it authored.
    fn bot_user_id(&self) -> UserId;

    /// Most recent messages of a thread, newest first.
    async fn fetch_recent_messages(
        &self,
        thread: ChannelId,
        limit: usize,
    ) -> Result<Vec<RemoteMessage>, TransportError>;

    /// Post a new message.
    async fn send_message(
        &self,
        thread: ChannelId,
        draft: MessageDraft,
    ) -> Result<RemoteMessage, TransportError>;

    /// Replace the content and attachment of an existing message.
    async fn edit_message(
        &self,
        thread: ChannelId,
        message: MessageId,
        draft: MessageDraft,
    ) -> Result<RemoteMessage, TransportError>;

    /// Fetch a single message.
    async fn fetch_message(
        &self,
        thread: ChannelId,
        message: MessageId,
    ) -> Result<RemoteMessage, TransportError>;

    /// Download raw attachment bytes.
    async fn fetch_bytes(&self, url: &str) -> Result<Vec<u8>, TransportError>;
}

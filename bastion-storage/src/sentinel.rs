//! Sentinel resolver: one anchor message per table in the admin thread.
//!
//! Anchor layout:
//!
//! ```text
//! <BOT> <TABLE> DATABASE
//!
//! Extra misc info:
//! <extra text, optional>
//! ```
//!
//! plus at most one attachment `<table>.<ext>` holding the encoded rows.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use bastion_core::{ChannelId, MessageId, StorageConfig, TransportError};
use tracing::{debug, info, warn};

use crate::lock;
use crate::transport::{ChatTransport, MessageDraft, RemoteMessage};

/// Marker line preceding the free-text extra field.
pub const EXTRA_MARKER: &str = "Extra misc info:";

/// Header line identifying a table's anchor.
pub fn anchor_header(bot_name: &str, table: &str) -> String {
    format!("{} {} DATABASE", bot_name, table.to_uppercase())
}

/// Render anchor message content.
pub fn render_anchor_content(bot_name: &str, table: &str, extra: Option<&str>) -> String {
    let header = anchor_header(bot_name, table);
    match extra {
        Some(extra) => format!("{}\n\n{}\n{}", header, EXTRA_MARKER, extra),
        None => header,
    }
}

/// Extract the extra field from anchor content.
pub fn parse_extra(content: &str) -> Option<String> {
    let marker = format!("\n{}", EXTRA_MARKER);
    let (_, rest) = content.split_once(&marker)?;
    match rest.strip_prefix('\n') {
        Some(extra) => Some(extra.to_string()),
        None if rest.is_empty() => Some(String::new()),
        None => None,
    }
}

/// Location of a table's anchor message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AnchorHandle {
    pub table: String,
    pub thread_id: ChannelId,
    pub message_id: MessageId,
}

/// Finds or creates anchors and caches them for the process lifetime.
pub struct SentinelResolver {
    transport: Arc<dyn ChatTransport>,
    config: Arc<StorageConfig>,
    anchors: Mutex<HashMap<String, AnchorHandle>>,
}

impl SentinelResolver {
    /// Create a resolver over the configured admin thread.
    pub fn new(transport: Arc<dyn ChatTransport>, config: Arc<StorageConfig>) -> Self {
        Self {
            transport,
            config,
            anchors: Mutex::new(HashMap::new()),
        }
    }

    /// Cached anchor for a table, without touching the network.
    pub fn cached(&self, table: &str) -> Option<AnchorHandle> {
        lock(&self.anchors).get(table).cloned()
    }

    /// Anchor for a table; only the first call per table hits the network.
    pub async fn resolve(&self, table: &str) -> Result<AnchorHandle, TransportError> {
        if let Some(handle) = self.cached(table) {
            return Ok(handle);
        }
        let (handle, _) = self.bootstrap(table).await?;
        Ok(handle)
    }

    /// Locate the anchor in the admin thread, adopting an existing one or
    /// creating a fresh one, and cache it.
    ///
    /// Returns the adopted message so the caller can load its contents;
    /// `None` means a new, empty anchor was created.
    pub async fn bootstrap(
        &self,
        table: &str,
    ) -> Result<(AnchorHandle, Option<RemoteMessage>), TransportError> {
        let header = anchor_header(&self.config.bot_name, table);
        let bot_id = self.transport.bot_user_id();

        let recent = self
            .transport
            .fetch_recent_messages(self.config.admin_thread_id, self.config.bootstrap_scan_limit)
            .await?;

        let mut matches = recent
            .into_iter()
            .filter(|m| m.author_id == bot_id && m.header_line().trim() == header);

        if let Some(message) = matches.next() {
            let stale = matches.count();
            if stale > 0 {
                debug!(table, stale, "Ignoring older anchors for table");
            }
            let handle = AnchorHandle {
                table: table.to_string(),
                thread_id: message.channel_id,
                message_id: message.id,
            };
            info!(table, anchor_id = handle.message_id, "Adopted existing anchor");
            self.remember(handle.clone());
            return Ok((handle, Some(message)));
        }

        let handle = self.create(table).await?;
        info!(table, anchor_id = handle.message_id, "Created new anchor");
        Ok((handle, None))
    }

    /// Replace a destroyed anchor with a new empty one.
    pub async fn recreate(&self, table: &str) -> Result<AnchorHandle, TransportError> {
        let previous = lock(&self.anchors).remove(table);
        let handle = self.create(table).await?;
        warn!(
            table,
            previous_anchor = previous.map(|h| h.message_id),
            anchor_id = handle.message_id,
            "Recreated missing anchor"
        );
        Ok(handle)
    }

    async fn create(&self, table: &str) -> Result<AnchorHandle, TransportError> {
        let draft = MessageDraft {
            content: render_anchor_content(&self.config.bot_name, table, None),
            attachment: None,
        };
        let message = self
            .transport
            .send_message(self.config.admin_thread_id, draft)
            .await?;
        let handle = AnchorHandle {
            table: table.to_string(),
            thread_id: message.channel_id,
            message_id: message.id,
        };
        self.remember(handle.clone());
        Ok(handle)
    }

    fn remember(&self, handle: AnchorHandle) {
        lock(&self.anchors).insert(handle.table.clone(), handle);
    }
}

impl std::fmt::Debug for SentinelResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SentinelResolver")
            .field("admin_thread_id", &self.config.admin_thread_id)
            .field("anchors", &lock(&self.anchors).len())
            .finish()
    }
}

//! Write verifier and self-healer.
//!
//! A write edits the anchor, re-fetches what the platform actually stored and
//! compares it byte for byte with what was sent. A destroyed anchor is
//! recreated and the write retried exactly once; any other mismatch means
//! something else touched the anchor and is reported, never retried.

use std::sync::Arc;

use bastion_core::{CodecError, PersistError, StorageConfig, TransportError};
use tracing::{debug, error, info, warn};

use crate::sentinel::{render_anchor_content, AnchorHandle, SentinelResolver};
use crate::transport::{ChatTransport, MessageDraft, OutgoingAttachment};

/// Serialized form of a table snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodedTable {
    /// Attachment bytes; `None` when the table has no rows.
    pub rows: Option<Vec<u8>>,
    pub extra: Option<String>,
}

/// A table snapshot waiting to be written. Encoding is deferred until the
/// write actually happens.
pub trait TablePayload: Send + Sync {
    fn encode(&self) -> Result<EncodedTable, CodecError>;
}

enum AttemptError {
    AnchorMissing,
    Failed(PersistError),
}

/// Sends snapshots to anchors and confirms they landed intact.
pub struct WriteVerifier {
    transport: Arc<dyn ChatTransport>,
    resolver: Arc<SentinelResolver>,
    config: Arc<StorageConfig>,
}

impl WriteVerifier {
    pub fn new(
        transport: Arc<dyn ChatTransport>,
        resolver: Arc<SentinelResolver>,
        config: Arc<StorageConfig>,
    ) -> Self {
        Self {
            transport,
            resolver,
            config,
        }
    }

    /// Attachment filename for a table.
    pub fn attachment_name(&self, table: &str) -> String {
        format!("{}.{}", table, self.config.attachment_extension)
    }

    /// Encode, write and verify a snapshot, healing a destroyed anchor once.
    pub async fn persist(&self, table: &str, payload: &dyn TablePayload) -> Result<(), PersistError> {
        let encoded = payload.encode().map_err(|source| PersistError::Codec {
            table: table.to_string(),
            source,
        })?;

        let anchor = self
            .resolver
            .resolve(table)
            .await
            .map_err(|source| transport_failure(table, source))?;

        match self.write_once(&anchor, &encoded).await {
            Ok(()) => return Ok(()),
            Err(AttemptError::Failed(err)) => return Err(err),
            Err(AttemptError::AnchorMissing) => {
                warn!(
                    table,
                    anchor_id = anchor.message_id,
                    "Anchor vanished during write, recreating"
                );
            }
        }

        let anchor = self
            .resolver
            .recreate(table)
            .await
            .map_err(|source| transport_failure(table, source))?;

        match self.write_once(&anchor, &encoded).await {
            Ok(()) => {
                info!(table, anchor_id = anchor.message_id, "Write succeeded on recreated anchor");
                Ok(())
            }
            Err(AttemptError::Failed(err)) => Err(err),
            Err(AttemptError::AnchorMissing) => {
                error!(
                    table,
                    anchor_id = anchor.message_id,
                    "Recreated anchor vanished again, giving up"
                );
                Err(PersistError::AnchorMissing {
                    table: table.to_string(),
                })
            }
        }
    }

    async fn write_once(
        &self,
        anchor: &AnchorHandle,
        encoded: &EncodedTable,
    ) -> Result<(), AttemptError> {
        let table = anchor.table.as_str();
        let draft = MessageDraft {
            content: render_anchor_content(&self.config.bot_name, table, encoded.extra.as_deref()),
            attachment: encoded.rows.clone().map(|bytes| OutgoingAttachment {
                filename: self.attachment_name(table),
                bytes,
            }),
        };

        self.transport
            .edit_message(anchor.thread_id, anchor.message_id, draft)
            .await
            .map_err(|e| classify(table, e))?;

        let message = self
            .transport
            .fetch_message(anchor.thread_id, anchor.message_id)
            .await
            .map_err(|e| classify(table, e))?;

        let observed = match message.attachments.first() {
            Some(attachment) => Some(
                self.transport
                    .fetch_bytes(&attachment.url)
                    .await
                    .map_err(|e| AttemptError::Failed(transport_failure(table, e)))?,
            ),
            None => None,
        };

        if observed != encoded.rows {
            error!(
                table,
                anchor_id = anchor.message_id,
                intended = %lossy(&encoded.rows),
                observed = %lossy(&observed),
                "Persisted attachment differs from written payload"
            );
            return Err(AttemptError::Failed(PersistError::Verification {
                table: table.to_string(),
                intended: encoded.rows.clone(),
                observed,
            }));
        }

        debug!(
            table,
            anchor_id = anchor.message_id,
            bytes = encoded.rows.as_ref().map_or(0, Vec::len),
            "Persisted table snapshot"
        );
        Ok(())
    }
}

impl std::fmt::Debug for WriteVerifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WriteVerifier")
            .field("resolver", &self.resolver)
            .finish()
    }
}

fn classify(table: &str, err: TransportError) -> AttemptError {
    if err.is_not_found() {
        AttemptError::AnchorMissing
    } else {
        AttemptError::Failed(transport_failure(table, err))
    }
}

fn transport_failure(table: &str, source: TransportError) -> PersistError {
    PersistError::Transport {
        table: table.to_string(),
        source,
    }
}

fn lossy(bytes: &Option<Vec<u8>>) -> String {
    match bytes {
        Some(bytes) => String::from_utf8_lossy(bytes).into_owned(),
        None => "<no attachment>".to_string(),
    }
}

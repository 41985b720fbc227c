//! In-memory chat transport for testing.
//!
//! Keeps threads, messages and uploaded attachment blobs in memory and lets
//! tests inject the failures the write path has to survive: destroyed
//! anchors, transport errors, and out-of-band edits of persisted bytes.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use bastion_core::{ChannelId, MessageId, TransportError, UserId};
use tokio::sync::Semaphore;

use crate::lock;
use crate::transport::{
    ChatTransport, MessageDraft, OutgoingAttachment, RemoteAttachment, RemoteMessage,
};

/// Call counters for [`MockTransport`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TransportStats {
    pub recent_fetches: usize,
    pub sends: usize,
    pub edits: usize,
    pub message_fetches: usize,
    pub byte_fetches: usize,
}

impl TransportStats {
    /// Total number of remote calls.
    pub fn total(&self) -> usize {
        self.recent_fetches + self.sends + self.edits + self.message_fetches + self.byte_fetches
    }
}

#[derive(Debug, Clone)]
struct StoredMessage {
    channel_id: ChannelId,
    author_id: UserId,
    content: String,
    attachment: Option<RemoteAttachment>,
}

#[derive(Debug, Default)]
struct MockState {
    threads: HashSet<ChannelId>,
    messages: BTreeMap<MessageId, StoredMessage>,
    blobs: HashMap<String, Vec<u8>>,
    next_id: u64,
    next_upload: u64,
    send_failures: VecDeque<TransportError>,
    edit_failures: VecDeque<TransportError>,
    tamper_next_upload: bool,
    edits: Vec<(MessageId, MessageDraft)>,
    in_flight: HashMap<MessageId, usize>,
    peak_in_flight: HashMap<MessageId, usize>,
    stats: TransportStats,
}

impl MockState {
    fn allocate_id(&mut self) -> MessageId {
        self.next_id += 1;
        self.next_id
    }

    fn upload(&mut self, message: MessageId, file: OutgoingAttachment) -> RemoteAttachment {
        self.next_upload += 1;
        let url = format!("mock://attachments/{}/{}/{}", message, self.next_upload, file.filename);
        let mut bytes = file.bytes;
        if std::mem::take(&mut self.tamper_next_upload) {
            bytes.extend_from_slice(b"tampered\n");
        }
        self.blobs.insert(url.clone(), bytes);
        RemoteAttachment {
            filename: file.filename,
            url,
        }
    }

    fn snapshot(&self, id: MessageId) -> Option<RemoteMessage> {
        self.messages.get(&id).map(|m| RemoteMessage {
            id,
            channel_id: m.channel_id,
            author_id: m.author_id,
            content: m.content.clone(),
            attachments: m.attachment.iter().cloned().collect(),
        })
    }
}

/// Decrements the in-flight edit count of a message when dropped.
struct InFlightEdit<'a> {
    transport: &'a MockTransport,
    message: MessageId,
}

impl Drop for InFlightEdit<'_> {
    fn drop(&mut self) {
        let mut state = lock(&self.transport.state);
        if let Some(count) = state.in_flight.get_mut(&self.message) {
            *count = count.saturating_sub(1);
        }
    }
}

/// In-memory [`ChatTransport`].
#[derive(Debug)]
pub struct MockTransport {
    bot_id: UserId,
    state: Mutex<MockState>,
    gates: Mutex<HashMap<MessageId, Arc<Semaphore>>>,
}

impl MockTransport {
    /// Create a transport whose bot user is `bot_id`.
    pub fn new(bot_id: UserId) -> Self {
        Self {
            bot_id,
            state: Mutex::new(MockState {
                next_id: 1_000_000,
                ..MockState::default()
            }),
            gates: Mutex::new(HashMap::new()),
        }
    }

    /// Make a thread exist.
    pub fn add_thread(&self, thread: ChannelId) {
        lock(&self.state).threads.insert(thread);
    }

    /// Delete a thread and every message in it.
    pub fn remove_thread(&self, thread: ChannelId) {
        let mut state = lock(&self.state);
        state.threads.remove(&thread);
        state.messages.retain(|_, m| m.channel_id != thread);
    }

    /// Post a message directly, bypassing counters and failure injection.
    pub fn seed_message(
        &self,
        thread: ChannelId,
        author: UserId,
        content: &str,
        attachment: Option<OutgoingAttachment>,
    ) -> MessageId {
        let mut state = lock(&self.state);
        state.threads.insert(thread);
        let id = state.allocate_id();
        let attachment = attachment.map(|file| state.upload(id, file));
        state.messages.insert(
            id,
            StoredMessage {
                channel_id: thread,
                author_id: author,
                content: content.to_string(),
                attachment,
            },
        );
        id
    }

    /// Destroy a message out-of-band. Returns whether it existed.
    pub fn delete_message(&self, id: MessageId) -> bool {
        lock(&self.state).messages.remove(&id).is_some()
    }

    /// Current state of a message.
    pub fn message(&self, id: MessageId) -> Option<RemoteMessage> {
        lock(&self.state).snapshot(id)
    }

    /// Bytes currently attached to a message.
    pub fn attachment_bytes(&self, id: MessageId) -> Option<Vec<u8>> {
        let state = lock(&self.state);
        let url = &state.messages.get(&id)?.attachment.as_ref()?.url;
        state.blobs.get(url).cloned()
    }

    /// All messages of a thread, oldest first.
    pub fn thread_messages(&self, thread: ChannelId) -> Vec<RemoteMessage> {
        let state = lock(&self.state);
        state
            .messages
            .iter()
            .filter(|(_, m)| m.channel_id == thread)
            .filter_map(|(id, _)| state.snapshot(*id))
            .collect()
    }

    /// Fail the next `send_message` call with `error`.
    pub fn fail_next_send(&self, error: TransportError) {
        lock(&self.state).send_failures.push_back(error);
    }

    /// Fail the next `edit_message` call with `error`.
    pub fn fail_next_edit(&self, error: TransportError) {
        lock(&self.state).edit_failures.push_back(error);
    }

    /// Corrupt the bytes stored by the next upload.
    pub fn tamper_next_upload(&self) {
        lock(&self.state).tamper_next_upload = true;
    }

    /// Stall every edit of `message` until [`Self::release_edits`].
    pub fn hold_edits(&self, message: MessageId) {
        lock(&self.gates).insert(message, Arc::new(Semaphore::new(0)));
    }

    /// Let stalled and future edits of `message` through.
    pub fn release_edits(&self, message: MessageId) {
        if let Some(gate) = lock(&self.gates).remove(&message) {
            gate.close();
        }
    }

    /// Edits of `message` that have started and not yet returned.
    pub fn edits_in_flight(&self, message: MessageId) -> usize {
        lock(&self.state).in_flight.get(&message).copied().unwrap_or(0)
    }

    /// Highest number of concurrent edits of `message` seen so far.
    pub fn peak_edits_in_flight(&self, message: MessageId) -> usize {
        lock(&self.state)
            .peak_in_flight
            .get(&message)
            .copied()
            .unwrap_or(0)
    }

    fn begin_edit(&self, message: MessageId) -> InFlightEdit<'_> {
        let mut state = lock(&self.state);
        let count = state.in_flight.entry(message).or_insert(0);
        *count += 1;
        let current = *count;
        let peak = state.peak_in_flight.entry(message).or_insert(0);
        *peak = (*peak).max(current);
        InFlightEdit {
            transport: self,
            message,
        }
    }

    /// Every edit request received, in order.
    pub fn edits(&self) -> Vec<(MessageId, MessageDraft)> {
        lock(&self.state).edits.clone()
    }

    /// Call counters.
    pub fn stats(&self) -> TransportStats {
        lock(&self.state).stats
    }
}

fn not_found(what: impl Into<String>) -> TransportError {
    TransportError::NotFound { what: what.into() }
}

#[async_trait]
impl ChatTransport for MockTransport {
    fn bot_user_id(&self) -> UserId {
        self.bot_id
    }

    async fn fetch_recent_messages(
        &self,
        thread: ChannelId,
        limit: usize,
    ) -> Result<Vec<RemoteMessage>, TransportError> {
        let mut state = lock(&self.state);
        state.stats.recent_fetches += 1;
        if !state.threads.contains(&thread) {
            return Err(not_found(format!("thread {}", thread)));
        }
        let ids: Vec<MessageId> = state
            .messages
            .iter()
            .rev()
            .filter(|(_, m)| m.channel_id == thread)
            .map(|(id, _)| *id)
            .take(limit)
            .collect();
        Ok(ids.into_iter().filter_map(|id| state.snapshot(id)).collect())
    }

    async fn send_message(
        &self,
        thread: ChannelId,
        draft: MessageDraft,
    ) -> Result<RemoteMessage, TransportError> {
        let mut state = lock(&self.state);
        state.stats.sends += 1;
        if let Some(err) = state.send_failures.pop_front() {
            return Err(err);
        }
        if !state.threads.contains(&thread) {
            return Err(not_found(format!("thread {}", thread)));
        }
        let id = state.allocate_id();
        let attachment = draft.attachment.map(|file| state.upload(id, file));
        let author_id = self.bot_id;
        state.messages.insert(
            id,
            StoredMessage {
                channel_id: thread,
                author_id,
                content: draft.content,
                attachment,
            },
        );
        state
            .snapshot(id)
            .ok_or_else(|| not_found(format!("message {}", id)))
    }

    async fn edit_message(
        &self,
        thread: ChannelId,
        message: MessageId,
        draft: MessageDraft,
    ) -> Result<RemoteMessage, TransportError> {
        let _in_flight = self.begin_edit(message);
        let gate = lock(&self.gates).get(&message).cloned();
        if let Some(gate) = gate {
            // A closed gate lets the edit through.
            if let Ok(permit) = gate.acquire().await {
                permit.forget();
            }
        }

        let mut state = lock(&self.state);
        state.stats.edits += 1;
        state.edits.push((message, draft.clone()));
        if let Some(err) = state.edit_failures.pop_front() {
            return Err(err);
        }
        match state.messages.get(&message) {
            Some(m) if m.channel_id == thread => {}
            _ => return Err(not_found(format!("message {}", message))),
        }
        let attachment = draft.attachment.map(|file| state.upload(message, file));
        if let Some(stored) = state.messages.get_mut(&message) {
            stored.content = draft.content;
            stored.attachment = attachment;
        }
        state
            .snapshot(message)
            .ok_or_else(|| not_found(format!("message {}", message)))
    }

    async fn fetch_message(
        &self,
        thread: ChannelId,
        message: MessageId,
    ) -> Result<RemoteMessage, TransportError> {
        let mut state = lock(&self.state);
        state.stats.message_fetches += 1;
        match state.snapshot(message) {
            Some(m) if m.channel_id == thread => Ok(m),
            _ => Err(not_found(format!("message {}", message))),
        }
    }

    async fn fetch_bytes(&self, url: &str) -> Result<Vec<u8>, TransportError> {
        let mut state = lock(&self.state);
        state.stats.byte_fetches += 1;
        state
            .blobs
            .get(url)
            .cloned()
            .ok_or_else(|| not_found(format!("attachment {}", url)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_send_edit_fetch_cycle() {
        let transport = MockTransport::new(1);
        transport.add_thread(9);
        let sent = transport
            .send_message(
                9,
                MessageDraft {
                    content: "hello".to_string(),
                    attachment: None,
                },
            )
            .await
            .unwrap();
        assert_eq!(sent.author_id, 1);

        let edited = transport
            .edit_message(
                9,
                sent.id,
                MessageDraft {
                    content: "hello again".to_string(),
                    attachment: Some(OutgoingAttachment {
                        filename: "t.csv".to_string(),
                        bytes: b"a\n1\n".to_vec(),
                    }),
                },
            )
            .await
            .unwrap();
        assert_eq!(edited.attachments.len(), 1);

        let bytes = transport
            .fetch_bytes(&edited.attachments[0].url)
            .await
            .unwrap();
        assert_eq!(bytes, b"a\n1\n");
        assert_eq!(transport.attachment_bytes(sent.id), Some(bytes));
        assert_eq!(transport.stats().total(), 3);
    }

    #[tokio::test]
    async fn test_deleted_message_is_not_found() {
        let transport = MockTransport::new(1);
        let id = transport.seed_message(9, 1, "x", None);
        assert!(transport.delete_message(id));
        let err = transport.fetch_message(9, id).await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_recent_messages_newest_first_and_limited() {
        let transport = MockTransport::new(1);
        let a = transport.seed_message(9, 1, "a", None);
        let b = transport.seed_message(9, 1, "b", None);
        let c = transport.seed_message(9, 1, "c", None);
        let recent = transport.fetch_recent_messages(9, 2).await.unwrap();
        let ids: Vec<_> = recent.iter().map(|m| m.id).collect();
        assert_eq!(ids, vec![c, b]);
        assert!(!ids.contains(&a));
    }

    #[tokio::test]
    async fn test_injected_edit_failure_is_consumed_once() {
        let transport = MockTransport::new(1);
        let id = transport.seed_message(9, 1, "x", None);
        transport.fail_next_edit(TransportError::RateLimited { retry_after_ms: 5 });
        let draft = MessageDraft {
            content: "y".to_string(),
            attachment: None,
        };
        assert!(transport.edit_message(9, id, draft.clone()).await.is_err());
        assert!(transport.edit_message(9, id, draft).await.is_ok());
        assert_eq!(transport.edits().len(), 2);
    }

    #[tokio::test]
    async fn test_held_edit_waits_for_release() {
        let transport = Arc::new(MockTransport::new(1));
        let id = transport.seed_message(9, 1, "x", None);
        transport.hold_edits(id);

        let pending = {
            let transport = transport.clone();
            tokio::spawn(async move {
                let draft = MessageDraft {
                    content: "y".to_string(),
                    attachment: None,
                };
                transport.edit_message(9, id, draft).await
            })
        };
        for _ in 0..8 {
            tokio::task::yield_now().await;
        }
        assert_eq!(transport.edits_in_flight(id), 1);
        assert!(transport.edits().is_empty());

        transport.release_edits(id);
        assert!(pending.await.unwrap().is_ok());
        assert_eq!(transport.edits_in_flight(id), 0);
        assert_eq!(transport.peak_edits_in_flight(id), 1);
        assert_eq!(transport.message(id).unwrap().content, "y");
    }
}

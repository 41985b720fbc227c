//! Bastion Storage - Chat-Hosted Tables
//!
//! Persists small tables as CSV attachments on "anchor" messages in one admin
//! thread of a chat platform. The platform is reached through the
//! [`ChatTransport`] seam; [`mock::MockTransport`] is the in-memory
//! implementation used by tests.
//!
//! Write path: a [`Table`] mutation rearms the [`WriteCoalescer`] timer, the
//! latest snapshot is encoded by the [`codec`] once the table has been quiet
//! for the quiescence window, and the [`WriteVerifier`] edits the anchor,
//! reads it back and recreates it once if it was destroyed.

pub mod coalescer;
pub mod codec;
pub mod mock;
pub mod registry;
pub mod sentinel;
pub mod table;
pub mod transport;
pub mod verifier;

pub use coalescer::WriteCoalescer;
pub use codec::{decode_rows, encode_rows, Column, ColumnKind, Record, RowValues, Value};
pub use mock::{MockTransport, TransportStats};
pub use registry::{validate_table_name, TableRegistry};
pub use sentinel::{anchor_header, parse_extra, render_anchor_content, AnchorHandle, SentinelResolver};
pub use table::{Database, PendingTable, Table, TableSlot};
pub use transport::{
    ChatTransport, MessageDraft, OutgoingAttachment, RemoteAttachment, RemoteMessage,
};
pub use verifier::{EncodedTable, TablePayload, WriteVerifier};

use std::sync::{Mutex, MutexGuard, PoisonError};

/// Lock a mutex guarding plain snapshot state, recovering from poisoning.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

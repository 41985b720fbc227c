//! Tables and the database that owns them.
//!
//! A [`Database`] binds a transport to one admin thread. Tables are created
//! in two steps: [`Database::create_table`] reserves the name without any
//! network traffic and returns a [`PendingTable`]; [`PendingTable::init`]
//! finds or creates the anchor, loads the stored rows and yields a usable
//! [`Table`]. Only a `Table` exposes rows, so reading before initialization
//! is impossible by construction. [`TableSlot`] covers hosts that declare
//! tables up front and initialize them later.

use std::fmt;
use std::marker::PhantomData;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use bastion_core::{
    BastionResult, CodecError, MessageId, PersistError, StorageConfig, TableError,
    TransportError,
};
use tokio::sync::broadcast;
use tracing::{debug, info};

use crate::codec::{decode_rows, encode_rows, Record};
use crate::coalescer::WriteCoalescer;
use crate::registry::TableRegistry;
use crate::sentinel::{parse_extra, SentinelResolver};
use crate::transport::ChatTransport;
use crate::verifier::{EncodedTable, TablePayload, WriteVerifier};

// ============================================================================
// DATABASE
// ============================================================================

/// Store object for every table hosted in one admin thread.
///
/// Cheap to clone; clones share the registry, anchor cache and pending
/// writes.
#[derive(Clone)]
pub struct Database {
    transport: Arc<dyn ChatTransport>,
    config: Arc<StorageConfig>,
    resolver: Arc<SentinelResolver>,
    coalescer: WriteCoalescer,
    registry: Arc<TableRegistry>,
}

impl Database {
    /// Validate the configuration and confirm the admin thread is reachable.
    ///
    /// An unreachable admin thread is fatal:
    /// [`TableError::AdminThreadUnavailable`].
    pub async fn connect(
        transport: Arc<dyn ChatTransport>,
        config: StorageConfig,
    ) -> BastionResult<Self> {
        config.validate()?;
        let thread_id = config.admin_thread_id;
        transport
            .fetch_recent_messages(thread_id, 1)
            .await
            .map_err(|err| TableError::AdminThreadUnavailable {
                thread_id,
                reason: err.to_string(),
            })?;

        let config = Arc::new(config);
        let resolver = Arc::new(SentinelResolver::new(transport.clone(), config.clone()));
        let verifier = Arc::new(WriteVerifier::new(
            transport.clone(),
            resolver.clone(),
            config.clone(),
        ));
        let coalescer = WriteCoalescer::new(verifier, config.quiescence);

        info!(
            admin_thread_id = thread_id,
            bot_name = %config.bot_name,
            quiescence_ms = config.quiescence.as_millis() as u64,
            "Connected table storage"
        );

        Ok(Self {
            transport,
            config,
            resolver,
            coalescer,
            registry: Arc::new(TableRegistry::new()),
        })
    }

    pub fn config(&self) -> &StorageConfig {
        &self.config
    }

    /// Reserve a table name. No network traffic happens here, so a duplicate
    /// name is rejected before any remote call.
    pub fn create_table<R: Record>(&self, name: &str) -> Result<PendingTable<R>, TableError> {
        self.registry.register(name)?;
        debug!(table = name, "Reserved table name");
        Ok(PendingTable {
            name: name.to_string(),
            db: self.clone(),
            _rows: PhantomData,
        })
    }

    /// Reserve and initialize a table in one step.
    pub async fn open_table<R: Record>(&self, name: &str) -> Result<Table<R>, TableError> {
        self.create_table(name)?.init().await
    }

    /// Names of every table created through this database, sorted.
    pub fn table_names(&self) -> Vec<String> {
        self.registry.names()
    }

    /// Write the pending snapshot of one table now.
    pub async fn flush(&self, table: &str) -> Result<(), PersistError> {
        self.coalescer.flush(table).await
    }

    /// Write every pending snapshot now.
    pub async fn flush_all(&self) -> Result<(), PersistError> {
        self.coalescer.flush_all().await
    }

    /// Refuse new tables and flush every pending write.
    ///
    /// Must be awaited before the process exits; pending writes are lost
    /// otherwise.
    pub async fn shutdown(&self) -> Result<(), PersistError> {
        self.registry.close();
        info!(tables = self.registry.names().len(), "Shutting down table storage");
        self.coalescer.flush_all().await
    }

    /// Failures of timer-driven writes. Explicit flushes return their errors
    /// directly instead.
    pub fn subscribe_failures(&self) -> broadcast::Receiver<PersistError> {
        self.coalescer.subscribe_failures()
    }

    fn init_error(&self, table: &str, err: TransportError) -> TableError {
        if err.is_not_found() {
            TableError::AdminThreadUnavailable {
                thread_id: self.config.admin_thread_id,
                reason: err.to_string(),
            }
        } else {
            TableError::Initialization {
                name: table.to_string(),
                reason: err.to_string(),
            }
        }
    }
}

impl fmt::Debug for Database {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Database")
            .field("admin_thread_id", &self.config.admin_thread_id)
            .field("tables", &self.registry.names())
            .finish()
    }
}

// ============================================================================
// PENDING TABLE
// ============================================================================

/// A reserved table name that has not been loaded yet.
pub struct PendingTable<R: Record> {
    name: String,
    db: Database,
    _rows: PhantomData<fn() -> R>,
}

impl<R: Record> PendingTable<R> {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Resolve the anchor and load its rows and extra field.
    ///
    /// On failure the name stays reserved.
    pub async fn init(self) -> Result<Table<R>, TableError> {
        let db = &self.db;
        let (anchor, adopted) = db
            .resolver
            .bootstrap(&self.name)
            .await
            .map_err(|err| db.init_error(&self.name, err))?;

        let initialization = |reason: String| TableError::Initialization {
            name: self.name.clone(),
            reason,
        };

        let (rows, extra) = match adopted {
            Some(message) => {
                let extra = parse_extra(&message.content);
                let rows = match message.attachments.first() {
                    Some(attachment) => {
                        let bytes = db
                            .transport
                            .fetch_bytes(&attachment.url)
                            .await
                            .map_err(|err| initialization(err.to_string()))?;
                        decode_rows::<R>(Some(bytes.as_slice()))
                            .map_err(|err| initialization(err.to_string()))?
                    }
                    None => Vec::new(),
                };
                (rows, extra)
            }
            None => (Vec::new(), None),
        };

        info!(
            table = %self.name,
            anchor_id = anchor.message_id,
            rows = rows.len(),
            "Table initialized"
        );

        Ok(Table {
            inner: Arc::new(TableInner {
                name: self.name.clone(),
                resolver: db.resolver.clone(),
                coalescer: db.coalescer.clone(),
                state: RwLock::new(Snapshot {
                    rows: rows.into(),
                    extra,
                }),
            }),
        })
    }
}

impl<R: Record> fmt::Debug for PendingTable<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PendingTable")
            .field("name", &self.name)
            .finish()
    }
}

// ============================================================================
// TABLE
// ============================================================================

struct Snapshot<R> {
    rows: Arc<[R]>,
    extra: Option<String>,
}

struct TableInner<R: Record> {
    name: String,
    resolver: Arc<SentinelResolver>,
    coalescer: WriteCoalescer,
    state: RwLock<Snapshot<R>>,
}

/// An initialized table.
///
/// Reads return the current snapshot. Every mutation replaces the snapshot
/// wholesale, is visible immediately and rearms the table's pending write.
pub struct Table<R: Record> {
    inner: Arc<TableInner<R>>,
}

impl<R: Record> Clone for Table<R> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<R: Record> Table<R> {
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Current anchor message, if resolved.
    pub fn anchor_id(&self) -> Option<MessageId> {
        self.inner
            .resolver
            .cached(&self.inner.name)
            .map(|anchor| anchor.message_id)
    }

    /// Current rows.
    pub fn data(&self) -> Arc<[R]> {
        self.read().rows.clone()
    }

    /// Current extra field.
    pub fn extra(&self) -> Option<String> {
        self.read().extra.clone()
    }

    /// Replace all rows.
    pub fn set_data(&self, rows: Vec<R>) {
        let mut state = self.write();
        state.rows = rows.into();
        self.schedule(&state);
    }

    /// Replace the extra field.
    pub fn set_extra(&self, extra: Option<String>) {
        let mut state = self.write();
        state.extra = extra;
        self.schedule(&state);
    }

    /// Build new rows from the current ones and store them.
    ///
    /// The closure runs under the table's write lock, so it must not touch
    /// this table; calling [`Table::data`] or [`Table::extra`] from inside it
    /// deadlocks.
    pub fn update<F>(&self, f: F)
    where
        F: FnOnce(&[R]) -> Vec<R>,
    {
        let mut state = self.write();
        state.rows = f(&state.rows).into();
        self.schedule(&state);
    }

    /// Append one row.
    pub fn push(&self, row: R) {
        self.update(|rows| {
            let mut next = rows.to_vec();
            next.push(row);
            next
        });
    }

    /// Write this table's pending snapshot now.
    pub async fn flush(&self) -> Result<(), PersistError> {
        self.inner.coalescer.flush(&self.inner.name).await
    }

    fn schedule(&self, state: &Snapshot<R>) {
        let payload = RowsPayload {
            rows: state.rows.clone(),
            extra: state.extra.clone(),
        };
        self.inner
            .coalescer
            .schedule(&self.inner.name, Arc::new(payload));
    }

    fn read(&self) -> RwLockReadGuard<'_, Snapshot<R>> {
        self.inner.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, Snapshot<R>> {
        self.inner.state.write().unwrap_or_else(PoisonError::into_inner)
    }
}

impl<R: Record> fmt::Debug for Table<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.read();
        f.debug_struct("Table")
            .field("name", &self.inner.name)
            .field("rows", &state.rows.len())
            .field("extra", &state.extra.is_some())
            .finish()
    }
}

/// Snapshot handed to the coalescer; encoded only when actually written.
struct RowsPayload<R: Record> {
    rows: Arc<[R]>,
    extra: Option<String>,
}

impl<R: Record> TablePayload for RowsPayload<R> {
    fn encode(&self) -> Result<EncodedTable, CodecError> {
        Ok(EncodedTable {
            rows: encode_rows(&self.rows),
            extra: self.extra.clone(),
        })
    }
}

// ============================================================================
// TABLE SLOT
// ============================================================================

/// A table declared before startup and initialized later.
pub enum TableSlot<R: Record> {
    Uninitialized(PendingTable<R>),
    Ready(Table<R>),
    /// Initialization was attempted and failed.
    Failed { name: String },
}

impl<R: Record> TableSlot<R> {
    pub fn new(pending: PendingTable<R>) -> Self {
        Self::Uninitialized(pending)
    }

    pub fn name(&self) -> &str {
        match self {
            Self::Uninitialized(pending) => pending.name(),
            Self::Ready(table) => table.name(),
            Self::Failed { name } => name.as_str(),
        }
    }

    pub fn is_ready(&self) -> bool {
        matches!(self, Self::Ready(_))
    }

    /// Initialize the slot. Idempotent once ready.
    pub async fn init(&mut self) -> Result<(), TableError> {
        let name = self.name().to_string();
        match std::mem::replace(self, Self::Failed { name: name.clone() }) {
            Self::Uninitialized(pending) => {
                let table = pending.init().await?;
                *self = Self::Ready(table);
                Ok(())
            }
            Self::Ready(table) => {
                *self = Self::Ready(table);
                Ok(())
            }
            Self::Failed { .. } => Err(TableError::Initialization {
                name,
                reason: "previous initialization failed".to_string(),
            }),
        }
    }

    /// The table, once initialized.
    pub fn get(&self) -> Result<&Table<R>, TableError> {
        match self {
            Self::Ready(table) => Ok(table),
            Self::Uninitialized(pending) => Err(TableError::NotInitialized {
                name: pending.name().to_string(),
            }),
            Self::Failed { name } => Err(TableError::Initialization {
                name: name.clone(),
                reason: "previous initialization failed".to_string(),
            }),
        }
    }

    pub fn data(&self) -> Result<Arc<[R]>, TableError> {
        self.get().map(Table::data)
    }

    pub fn extra(&self) -> Result<Option<String>, TableError> {
        self.get().map(Table::extra)
    }
}

impl<R: Record> fmt::Debug for TableSlot<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Uninitialized(pending) => f.debug_tuple("Uninitialized").field(pending).finish(),
            Self::Ready(table) => f.debug_tuple("Ready").field(table).finish(),
            Self::Failed { name } => f.debug_struct("Failed").field("name", name).finish(),
        }
    }
}

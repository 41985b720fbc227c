//! Write coalescer.
//!
//! Every mutation rearms a per-table timer. Only when a table has been quiet
//! for the whole quiescence window is the latest snapshot handed to the
//! verifier; superseded snapshots are dropped without ever being encoded.
//!
//! A pending write carries a generation number. A timer that wakes up only
//! takes the payload if the generation still matches, so a timer that lost a
//! race with a rearm or a flush does nothing. Writes to the same table are
//! serialized through a per-table async lock; different tables never wait on
//! each other.

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bastion_core::PersistError;
use tokio::runtime::Handle;
use tokio::sync::broadcast;
use tokio::task::AbortHandle;
use tokio::time::Instant;
use tracing::{debug, error, info};

use crate::lock;
use crate::verifier::{TablePayload, WriteVerifier};

/// Capacity of the background failure channel.
const FAILURE_CHANNEL_CAPACITY: usize = 64;

// ============================================================================
// PENDING WRITES
// ============================================================================

struct PendingWrite {
    payload: Arc<dyn TablePayload>,
    due_at: Instant,
    generation: u64,
    timer: AbortHandle,
}

struct CoalescerInner {
    verifier: Arc<WriteVerifier>,
    quiescence: Duration,
    pending: Mutex<HashMap<String, PendingWrite>>,
    lanes: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
    generation: AtomicU64,
    failures: broadcast::Sender<PersistError>,
}

impl CoalescerInner {
    fn lane(&self, table: &str) -> Arc<tokio::sync::Mutex<()>> {
        lock(&self.lanes)
            .entry(table.to_string())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }

    /// Take the pending payload for `table` if it still belongs to `generation`.
    fn take_if_current(&self, table: &str, generation: u64) -> Option<Arc<dyn TablePayload>> {
        let mut pending = lock(&self.pending);
        match pending.get(table) {
            Some(write) if write.generation == generation => {
                pending.remove(table).map(|write| write.payload)
            }
            _ => None,
        }
    }

    async fn fire(&self, table: &str, generation: u64) {
        let lane = self.lane(table);
        let _write = lane.lock().await;
        let Some(payload) = self.take_if_current(table, generation) else {
            return;
        };
        debug!(table, generation, "Quiescence elapsed, writing snapshot");
        if let Err(err) = self.verifier.persist(table, payload.as_ref()).await {
            error!(table, error = %err, "Background write failed");
            // No subscribers is fine; the error has been logged.
            let _ = self.failures.send(err);
        }
    }
}

// ============================================================================
// COALESCER
// ============================================================================

/// Debounces table snapshots and writes them through a [`WriteVerifier`].
#[derive(Clone)]
pub struct WriteCoalescer {
    inner: Arc<CoalescerInner>,
}

impl WriteCoalescer {
    pub fn new(verifier: Arc<WriteVerifier>, quiescence: Duration) -> Self {
        let (failures, _) = broadcast::channel(FAILURE_CHANNEL_CAPACITY);
        Self {
            inner: Arc::new(CoalescerInner {
                verifier,
                quiescence,
                pending: Mutex::new(HashMap::new()),
                lanes: Mutex::new(HashMap::new()),
                generation: AtomicU64::new(0),
                failures,
            }),
        }
    }

    /// The quiescence window.
    pub fn quiescence(&self) -> Duration {
        self.inner.quiescence
    }

    /// Arm (or rearm) the write timer for `table` with a new snapshot.
    ///
    /// Any previously pending snapshot for the table is discarded. Must be
    /// called from within a tokio runtime; outside one the write is dropped
    /// and logged.
    pub fn schedule(&self, table: &str, payload: Arc<dyn TablePayload>) {
        let runtime = match Handle::try_current() {
            Ok(runtime) => runtime,
            Err(err) => {
                error!(table, error = %err, "No async runtime, write not scheduled");
                return;
            }
        };

        let generation = self.inner.generation.fetch_add(1, Ordering::Relaxed) + 1;
        let due_at = Instant::now() + self.inner.quiescence;

        let mut pending = lock(&self.inner.pending);
        let inner = Arc::clone(&self.inner);
        let name = table.to_string();
        let timer = runtime.spawn(async move {
            tokio::time::sleep_until(due_at).await;
            inner.fire(&name, generation).await;
        });

        let superseded = pending.insert(
            table.to_string(),
            PendingWrite {
                payload,
                due_at,
                generation,
                timer: timer.abort_handle(),
            },
        );
        if let Some(previous) = superseded {
            previous.timer.abort();
            debug!(table, generation, "Rearmed pending write");
        } else {
            debug!(table, generation, "Armed pending write");
        }
    }

    /// Whether `table` has a snapshot waiting for its timer.
    pub fn is_pending(&self, table: &str) -> bool {
        lock(&self.inner.pending).contains_key(table)
    }

    /// When the pending write for `table` is due, if any.
    pub fn due_at(&self, table: &str) -> Option<Instant> {
        lock(&self.inner.pending).get(table).map(|write| write.due_at)
    }

    /// Subscribe to failures of timer-driven writes.
    pub fn subscribe_failures(&self) -> broadcast::Receiver<PersistError> {
        self.inner.failures.subscribe()
    }

    /// Write the pending snapshot for `table` now.
    ///
    /// Waits for a write already in flight for the table. Nothing pending is
    /// a no-op.
    pub async fn flush(&self, table: &str) -> Result<(), PersistError> {
        let lane = self.inner.lane(table);
        let _write = lane.lock().await;
        let taken = lock(&self.inner.pending).remove(table);
        match taken {
            Some(write) => {
                write.timer.abort();
                self.inner
                    .verifier
                    .persist(table, write.payload.as_ref())
                    .await?;
                info!(table, "Flushed pending write");
                Ok(())
            }
            None => Ok(()),
        }
    }

    /// Flush every table. All tables are attempted; the first error is
    /// returned.
    pub async fn flush_all(&self) -> Result<(), PersistError> {
        let tables: BTreeSet<String> = {
            let pending = lock(&self.inner.pending);
            let lanes = lock(&self.inner.lanes);
            pending.keys().chain(lanes.keys()).cloned().collect()
        };

        let mut first_error = None;
        for table in tables {
            if let Err(err) = self.flush(&table).await {
                error!(table = %table, error = %err, "Flush failed");
                first_error.get_or_insert(err);
            }
        }
        match first_error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

impl std::fmt::Debug for WriteCoalescer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WriteCoalescer")
            .field("quiescence", &self.inner.quiescence)
            .field("pending", &lock(&self.inner.pending).len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockTransport;
    use crate::sentinel::SentinelResolver;
    use crate::verifier::EncodedTable;
    use bastion_core::{CodecError, StorageConfig};
    use std::sync::atomic::AtomicUsize;

    const THREAD: u64 = 77;
    const WINDOW: Duration = Duration::from_secs(15);

    struct Counted {
        body: &'static [u8],
        encodes: Arc<AtomicUsize>,
    }

    impl TablePayload for Counted {
        fn encode(&self) -> Result<EncodedTable, CodecError> {
            self.encodes.fetch_add(1, Ordering::SeqCst);
            Ok(EncodedTable {
                rows: Some(self.body.to_vec()),
                extra: None,
            })
        }
    }

    fn setup() -> (Arc<MockTransport>, WriteCoalescer) {
        let transport = Arc::new(MockTransport::new(1000));
        transport.add_thread(THREAD);
        let config = Arc::new(StorageConfig::new("BASTION", THREAD));
        let resolver = Arc::new(SentinelResolver::new(transport.clone(), config.clone()));
        let verifier = Arc::new(WriteVerifier::new(transport.clone(), resolver, config));
        (transport, WriteCoalescer::new(verifier, WINDOW))
    }

    fn payload(body: &'static [u8], encodes: &Arc<AtomicUsize>) -> Arc<dyn TablePayload> {
        Arc::new(Counted {
            body,
            encodes: encodes.clone(),
        })
    }

    async fn settle() {
        for _ in 0..16 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_nothing_written_before_window_elapses() {
        let (transport, coalescer) = setup();
        let encodes = Arc::new(AtomicUsize::new(0));
        coalescer.schedule("xp", payload(b"a\n1\n", &encodes));

        tokio::time::advance(WINDOW - Duration::from_millis(1)).await;
        settle().await;
        assert_eq!(transport.stats().edits, 0);
        assert!(coalescer.is_pending("xp"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_burst_collapses_into_one_write_of_last_snapshot() {
        let (transport, coalescer) = setup();
        let encodes = Arc::new(AtomicUsize::new(0));
        coalescer.schedule("xp", payload(b"a\n1\n", &encodes));
        tokio::time::advance(Duration::from_secs(10)).await;
        coalescer.schedule("xp", payload(b"a\n2\n", &encodes));
        tokio::time::advance(Duration::from_secs(10)).await;
        coalescer.schedule("xp", payload(b"a\n3\n", &encodes));

        tokio::time::advance(WINDOW + Duration::from_millis(1)).await;
        settle().await;

        let edits = transport.edits();
        assert_eq!(edits.len(), 1);
        let bytes = &edits[0].1.attachment.as_ref().unwrap().bytes;
        assert_eq!(bytes, b"a\n3\n");
        assert_eq!(encodes.load(Ordering::SeqCst), 1);
        assert!(!coalescer.is_pending("xp"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_rearm_moves_deadline() {
        let (_transport, coalescer) = setup();
        let encodes = Arc::new(AtomicUsize::new(0));
        coalescer.schedule("xp", payload(b"a\n1\n", &encodes));
        let first = coalescer.due_at("xp").unwrap();
        tokio::time::advance(Duration::from_secs(5)).await;
        coalescer.schedule("xp", payload(b"a\n2\n", &encodes));
        let second = coalescer.due_at("xp").unwrap();
        assert_eq!(second - first, Duration::from_secs(5));
    }

    #[tokio::test(start_paused = true)]
    async fn test_tables_are_independent() {
        let (transport, coalescer) = setup();
        let encodes = Arc::new(AtomicUsize::new(0));
        coalescer.schedule("xp", payload(b"a\n1\n", &encodes));
        coalescer.schedule("levels", payload(b"b\n1\n", &encodes));

        tokio::time::advance(WINDOW + Duration::from_millis(1)).await;
        settle().await;
        assert_eq!(transport.edits().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_flush_writes_immediately_and_cancels_timer() {
        let (transport, coalescer) = setup();
        let encodes = Arc::new(AtomicUsize::new(0));
        coalescer.schedule("xp", payload(b"a\n1\n", &encodes));
        coalescer.flush("xp").await.unwrap();
        assert_eq!(transport.edits().len(), 1);

        tokio::time::advance(WINDOW * 2).await;
        settle().await;
        assert_eq!(transport.edits().len(), 1);
        assert_eq!(encodes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_flush_without_pending_is_noop() {
        let (transport, coalescer) = setup();
        coalescer.flush("xp").await.unwrap();
        coalescer.flush_all().await.unwrap();
        assert_eq!(transport.stats().total(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_background_failure_is_published() {
        let (transport, coalescer) = setup();
        let mut failures = coalescer.subscribe_failures();
        let encodes = Arc::new(AtomicUsize::new(0));
        transport.tamper_next_upload();
        coalescer.schedule("xp", payload(b"a\n1\n", &encodes));

        tokio::time::advance(WINDOW + Duration::from_millis(1)).await;
        let err = failures.recv().await.unwrap();
        assert!(matches!(err, PersistError::Verification { .. }));
        assert_eq!(err.table(), "xp");
    }

    #[test]
    fn test_schedule_outside_runtime_is_dropped() {
        let (_transport, coalescer) = setup();
        let encodes = Arc::new(AtomicUsize::new(0));
        coalescer.schedule("xp", payload(b"a\n1\n", &encodes));
        assert!(!coalescer.is_pending("xp"));
    }
}

//! Offline write queue: durable per-kind FIFO with ordered, bounded retry.
//!
//! ## Flow
//!
//! ```text
//! enqueue(kind, payload)
//!       │  (always local, survives restart)
//!       ▼
//! DurableStore  ── pending ──┐
//!                            │ flush(kind?)  — one flush in flight per kind
//!                            ▼
//!                   for write in FIFO order:
//!                     RemoteWriter::submit ── ack ──► remove
//!                            │
//!                          reject
//!                            ▼
//!                   attempts += 1
//!                     < max  → stop this kind (later writes wait)
//!                     = max  → dead letter, continue with next write
//! ```
//!
//! Offline is an expected state: `flush` returns a report flagged `offline`
//! without touching the store. An offline→online transition triggers a
//! flush of every kind when [`OfflineWriteQueue::spawn_auto_flush`] runs.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::task::JoinHandle;

use crate::connectivity::ConnectivityWatch;
use crate::context::AppContext;
use crate::protocol::WriteOutcome;
use crate::remote::RemoteWriter;
use crate::storage::{DurableStore, EntityKind, PendingWrite, StoreError};

/// Queue configuration.
#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// Failed attempts after which a write is dead-lettered. Default: 5.
    pub max_attempts: u32,
    /// A submit with no answer after this long counts as a rejection. Default: 10s.
    pub submit_timeout_ms: u64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            submit_timeout_ms: 10_000,
        }
    }
}

impl QueueConfig {
    /// Config for testing (short submit timeout).
    pub fn for_testing() -> Self {
        Self {
            max_attempts: 5,
            submit_timeout_ms: 250,
        }
    }
}

/// What one `flush` call did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FlushReport {
    /// Connectivity was unavailable (at start or between items)
    pub offline: bool,
    /// Stopped by `cancel_flush` between items
    pub cancelled: bool,
    /// Acknowledged and removed, in send order
    pub acknowledged: Vec<u64>,
    /// Rejected this round and left at the head of their kind
    pub rejected: Vec<u64>,
    /// Moved to the dead-letter set this round
    pub dead_lettered: Vec<u64>,
    /// Kinds whose walk stopped on a rejection
    pub stalled_kinds: Vec<EntityKind>,
}

impl FlushReport {
    fn offline() -> Self {
        Self {
            offline: true,
            ..Self::default()
        }
    }

    /// Number of writes delivered.
    pub fn sent(&self) -> usize {
        self.acknowledged.len()
    }

    fn merge(&mut self, other: FlushReport) {
        self.offline |= other.offline;
        self.cancelled |= other.cancelled;
        self.acknowledged.extend(other.acknowledged);
        self.rejected.extend(other.rejected);
        self.dead_lettered.extend(other.dead_lettered);
        self.stalled_kinds.extend(other.stalled_kinds);
    }
}

/// Queue errors.
#[derive(Debug, Clone)]
pub enum QueueError {
    /// The local store refused a read or write; the caller should retry
    LocalPersistFailure(StoreError),
    /// No dead-lettered write with this id
    NotFound(u64),
}

impl std::fmt::Display for QueueError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            QueueError::LocalPersistFailure(e) => write!(f, "Local persist failure: {e}"),
            QueueError::NotFound(id) => write!(f, "Dead-lettered write #{id} not found"),
        }
    }
}

impl std::error::Error for QueueError {}

impl From<StoreError> for QueueError {
    fn from(e: StoreError) -> Self {
        QueueError::LocalPersistFailure(e)
    }
}

/// Durable buffer of mutations awaiting remote acknowledgement.
pub struct OfflineWriteQueue<R: RemoteWriter> {
    context: AppContext,
    store: Arc<dyn DurableStore>,
    remote: R,
    connectivity: ConnectivityWatch,
    config: QueueConfig,
    /// Next id; held across the store append so ids land in store order
    next_id: Mutex<u64>,
    /// One flush in flight per kind, indexed by `EntityKind::index`
    flush_locks: [tokio::sync::Mutex<()>; 3],
    /// Bumped by `cancel_flush`; flushes compare between items
    cancel_generation: AtomicU64,
}

impl<R: RemoteWriter> OfflineWriteQueue<R> {
    /// Create a queue over an opened store, resuming its id sequence.
    pub fn new(
        context: AppContext,
        store: Arc<dyn DurableStore>,
        remote: R,
        connectivity: ConnectivityWatch,
        config: QueueConfig,
    ) -> Result<Self, QueueError> {
        let next_id = store.last_sequence()?.map_or(1, |last| last + 1);
        Ok(Self {
            context,
            store,
            remote,
            connectivity,
            config,
            next_id: Mutex::new(next_id),
            flush_locks: Default::default(),
            cancel_generation: AtomicU64::new(0),
        })
    }

    /// Append a mutation to the durable queue for `kind`.
    pub fn enqueue(&self, kind: EntityKind, payload: Vec<u8>) -> Result<PendingWrite, QueueError> {
        let mut next_id = self
            .next_id
            .lock()
            .map_err(|_| StoreError::Unavailable("sequence lock poisoned".into()))?;
        let write = PendingWrite::new(*next_id, kind, self.context.participant_id(), payload);
        self.store.append(&write)?;
        *next_id += 1;
        log::debug!("Queued {kind} write #{} ({} bytes)", write.id, write.payload.len());
        Ok(write)
    }

    /// Deliver pending writes of one kind, or of every kind when `None`.
    pub async fn flush(&self, kind: Option<EntityKind>) -> Result<FlushReport, QueueError> {
        if !self.connectivity.is_online() {
            log::debug!("Flush skipped: offline");
            return Ok(FlushReport::offline());
        }

        let generation = self.cancel_generation.load(Ordering::SeqCst);
        let kinds: Vec<EntityKind> = match kind {
            Some(kind) => vec![kind],
            None => EntityKind::ALL.to_vec(),
        };

        let mut report = FlushReport::default();
        for kind in kinds {
            let kind_report = self.flush_kind(kind, generation).await?;
            report.merge(kind_report);
            if report.cancelled || report.offline {
                break;
            }
        }

        if report.sent() > 0 || !report.dead_lettered.is_empty() || !report.rejected.is_empty() {
            log::info!(
                "Flush: {} sent, {} rejected, {} dead-lettered",
                report.sent(),
                report.rejected.len(),
                report.dead_lettered.len()
            );
        }
        Ok(report)
    }

    async fn flush_kind(&self, kind: EntityKind, generation: u64) -> Result<FlushReport, QueueError> {
        let _in_flight = self.flush_locks[kind.index()].lock().await;
        let mut report = FlushReport::default();

        for mut write in self.store.pending(kind)? {
            if self.cancel_generation.load(Ordering::SeqCst) != generation {
                report.cancelled = true;
                break;
            }
            if !self.connectivity.is_online() {
                report.offline = true;
                break;
            }

            let outcome = self.submit(&write).await;
            if outcome.is_acknowledged() {
                self.store.remove(kind, write.id)?;
                report.acknowledged.push(write.id);
                continue;
            }

            write.attempts += 1;
            log::warn!(
                "{kind} write #{} not acknowledged (attempt {}/{}): {outcome:?}",
                write.id,
                write.attempts,
                self.config.max_attempts
            );

            if write.attempts >= self.config.max_attempts {
                self.store.quarantine(&write)?;
                log::error!("{kind} write #{} moved to dead letter", write.id);
                report.dead_lettered.push(write.id);
                continue;
            }

            self.store.update(&write)?;
            report.rejected.push(write.id);
            report.stalled_kinds.push(kind);
            break;
        }

        Ok(report)
    }

    async fn submit(&self, write: &PendingWrite) -> WriteOutcome {
        let limit = Duration::from_millis(self.config.submit_timeout_ms);
        match tokio::time::timeout(limit, self.remote.submit(write)).await {
            Ok(outcome) => outcome,
            Err(_) => WriteOutcome::Unreachable(format!(
                "no answer within {}ms",
                self.config.submit_timeout_ms
            )),
        }
    }

    /// Stop in-flight flushes before their next item.
    pub fn cancel_flush(&self) {
        self.cancel_generation.fetch_add(1, Ordering::SeqCst);
    }

    /// Flush every kind on each offline→online transition.
    ///
    /// `Connectivity` only notifies on a real change and the watch coalesces
    /// bursts, so any wake-up that lands on `Online` had an offline period
    /// before it, even when that period was never observed here.
    pub fn spawn_auto_flush(self: &Arc<Self>) -> JoinHandle<()> {
        let queue = Arc::clone(self);
        let mut watch = self.connectivity.clone();
        tokio::spawn(async move {
            while let Some(state) = watch.changed().await {
                if state.is_online() {
                    log::info!("Back online, flushing offline writes");
                    if let Err(e) = queue.flush(None).await {
                        log::error!("Automatic flush failed: {e}");
                    }
                }
            }
            log::debug!("Connectivity source dropped, auto flush stopped");
        })
    }

    /// Pending writes of one kind, oldest first.
    pub fn pending(&self, kind: EntityKind) -> Result<Vec<PendingWrite>, QueueError> {
        Ok(self.store.pending(kind)?)
    }

    /// Pending writes across all kinds.
    pub fn pending_count(&self) -> Result<usize, QueueError> {
        let mut total = 0;
        for kind in EntityKind::ALL {
            total += self.store.pending(kind)?.len();
        }
        Ok(total)
    }

    /// Quarantined writes, optionally filtered by kind.
    pub fn dead_letters(&self, kind: Option<EntityKind>) -> Result<Vec<PendingWrite>, QueueError> {
        let mut dead = self.store.dead_letters()?;
        if let Some(kind) = kind {
            dead.retain(|w| w.entity_kind == kind);
        }
        Ok(dead)
    }

    /// Put a dead-lettered write back at the tail of its kind with attempts reset.
    pub fn retry_dead_letter(&self, id: u64) -> Result<PendingWrite, QueueError> {
        let dead = self.find_dead_letter(id)?;
        let mut next_id = self
            .next_id
            .lock()
            .map_err(|_| StoreError::Unavailable("sequence lock poisoned".into()))?;
        let fresh = PendingWrite {
            id: *next_id,
            attempts: 0,
            ..dead.clone()
        };
        self.store.requeue(&dead, &fresh)?;
        *next_id += 1;
        log::info!("Dead-lettered write #{id} requeued as #{}", fresh.id);
        Ok(fresh)
    }

    /// Drop a dead-lettered write after manual resolution.
    pub fn discard_dead_letter(&self, id: u64) -> Result<PendingWrite, QueueError> {
        let dead = self.find_dead_letter(id)?;
        self.store
            .remove_dead_letter(dead.entity_kind, dead.id)?
            .ok_or(QueueError::NotFound(id))
    }

    fn find_dead_letter(&self, id: u64) -> Result<PendingWrite, QueueError> {
        self.store
            .dead_letters()?
            .into_iter()
            .find(|w| w.id == id)
            .ok_or(QueueError::NotFound(id))
    }

    pub fn is_online(&self) -> bool {
        self.connectivity.is_online()
    }

    pub fn context(&self) -> &AppContext {
        &self.context
    }

    pub fn remote(&self) -> &R {
        &self.remote
    }

    pub fn config(&self) -> &QueueConfig {
        &self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connectivity::{Connectivity, ConnectivityState};
    use crate::context::Identity;
    use crate::remote::RecordingRemote;
    use crate::storage::MemoryStore;

    fn make_queue(
        state: ConnectivityState,
    ) -> (OfflineWriteQueue<Arc<RecordingRemote>>, Arc<RecordingRemote>, Connectivity, Arc<MemoryStore>) {
        let connectivity = Connectivity::new(state);
        let remote = Arc::new(RecordingRemote::new());
        let store = Arc::new(MemoryStore::new());
        let queue = OfflineWriteQueue::new(
            AppContext::new(Identity::new("u-1", "Ada")),
            store.clone(),
            remote.clone(),
            connectivity.watch(),
            QueueConfig::for_testing(),
        )
        .unwrap();
        (queue, remote, connectivity, store)
    }

    #[tokio::test]
    async fn test_enqueue_tags_author_and_sequence() {
        let (queue, _, _conn, _) = make_queue(ConnectivityState::Offline);
        let a = queue.enqueue(EntityKind::Message, b"a".to_vec()).unwrap();
        let b = queue.enqueue(EntityKind::ProjectEdit, b"b".to_vec()).unwrap();
        assert_eq!(a.author, "u-1");
        assert_eq!(b.id, a.id + 1);
        assert_eq!(a.attempts, 0);
        assert_eq!(queue.pending_count().unwrap(), 2);
    }

    #[tokio::test]
    async fn test_enqueue_store_failure_is_reported() {
        let (queue, _, _conn, store) = make_queue(ConnectivityState::Online);
        store.set_fail_writes(true);
        let err = queue.enqueue(EntityKind::Message, b"x".to_vec()).unwrap_err();
        assert!(matches!(err, QueueError::LocalPersistFailure(_)));

        // The failed id is reused once the store recovers.
        store.set_fail_writes(false);
        let write = queue.enqueue(EntityKind::Message, b"x".to_vec()).unwrap();
        assert_eq!(write.id, 1);
    }

    #[tokio::test]
    async fn test_flush_offline_is_noop() {
        let (queue, remote, _conn, _) = make_queue(ConnectivityState::Offline);
        queue.enqueue(EntityKind::Message, b"hi".to_vec()).unwrap();

        let report = queue.flush(None).await.unwrap();
        assert!(report.offline);
        assert_eq!(report.sent(), 0);
        assert!(remote.deliveries().is_empty());
        assert_eq!(queue.pending_count().unwrap(), 1);
    }

    #[tokio::test]
    async fn test_rejection_stalls_only_its_kind() {
        let (queue, remote, _conn, _) = make_queue(ConnectivityState::Online);
        let first = queue.enqueue(EntityKind::Message, b"m1".to_vec()).unwrap();
        queue.enqueue(EntityKind::Message, b"m2".to_vec()).unwrap();
        queue.enqueue(EntityKind::ProjectEdit, b"p1".to_vec()).unwrap();
        remote.script(first.id, [WriteOutcome::Rejected("conflict".into())]);

        let report = queue.flush(None).await.unwrap();
        assert_eq!(report.rejected, vec![first.id]);
        assert_eq!(report.stalled_kinds, vec![EntityKind::Message]);
        assert_eq!(remote.acknowledged_payloads(), vec![b"p1".to_vec()]);

        let pending = queue.pending(EntityKind::Message).unwrap();
        assert_eq!(pending.len(), 2);
        assert_eq!(pending[0].attempts, 1);
        assert_eq!(pending[1].attempts, 0);
    }

    #[tokio::test]
    async fn test_flush_single_kind() {
        let (queue, remote, _conn, _) = make_queue(ConnectivityState::Online);
        queue.enqueue(EntityKind::Message, b"m".to_vec()).unwrap();
        queue.enqueue(EntityKind::DocumentEdit, b"d".to_vec()).unwrap();

        let report = queue.flush(Some(EntityKind::DocumentEdit)).await.unwrap();
        assert_eq!(report.sent(), 1);
        assert_eq!(remote.acknowledged_payloads(), vec![b"d".to_vec()]);
        assert_eq!(queue.pending(EntityKind::Message).unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_dead_letter_retry_and_discard() {
        let (queue, remote, _conn, _) = make_queue(ConnectivityState::Online);
        let a = queue.enqueue(EntityKind::Message, b"a".to_vec()).unwrap();
        let b = queue.enqueue(EntityKind::Message, b"b".to_vec()).unwrap();
        remote.set_reject_all(true);
        for _ in 0..5 {
            queue.flush(None).await.unwrap();
        }
        for _ in 0..5 {
            queue.flush(None).await.unwrap();
        }
        let dead = queue.dead_letters(Some(EntityKind::Message)).unwrap();
        assert_eq!(dead.iter().map(|w| w.id).collect::<Vec<_>>(), vec![a.id, b.id]);
        assert_eq!(queue.pending_count().unwrap(), 0);

        remote.set_reject_all(false);
        let retried = queue.retry_dead_letter(a.id).unwrap();
        assert!(retried.id > b.id);
        assert_eq!(retried.attempts, 0);
        assert_eq!(retried.payload, b"a".to_vec());

        let discarded = queue.discard_dead_letter(b.id).unwrap();
        assert_eq!(discarded.payload, b"b".to_vec());
        assert!(queue.dead_letters(None).unwrap().is_empty());
        assert!(matches!(queue.discard_dead_letter(b.id), Err(QueueError::NotFound(_))));

        let report = queue.flush(None).await.unwrap();
        assert_eq!(report.acknowledged, vec![retried.id]);
    }

    #[tokio::test]
    async fn test_auto_flush_after_brief_offline_blip() {
        let (queue, remote, conn, _) = make_queue(ConnectivityState::Online);
        let queue = Arc::new(queue);
        let task = queue.spawn_auto_flush();

        // No yield in between: the watch coalesces this into one Online wake-up.
        conn.set_online(false);
        queue.enqueue(EntityKind::Message, b"hi".to_vec()).unwrap();
        conn.set_online(true);

        for _ in 0..50 {
            if queue.pending_count().unwrap() == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(queue.pending_count().unwrap(), 0);
        assert_eq!(remote.acknowledged_payloads(), vec![b"hi".to_vec()]);
        task.abort();
    }

    #[tokio::test]
    async fn test_slow_remote_counts_as_rejection() {
        let connectivity = Connectivity::new(ConnectivityState::Online);
        let remote = RecordingRemote::with_delay(Duration::from_millis(200));
        let queue = OfflineWriteQueue::new(
            AppContext::new(Identity::anonymous()),
            Arc::new(MemoryStore::new()),
            remote,
            connectivity.watch(),
            QueueConfig {
                max_attempts: 5,
                submit_timeout_ms: 20,
            },
        )
        .unwrap();
        let write = queue.enqueue(EntityKind::ProjectEdit, b"slow".to_vec()).unwrap();

        let report = queue.flush(None).await.unwrap();
        assert_eq!(report.rejected, vec![write.id]);
        assert_eq!(queue.pending(EntityKind::ProjectEdit).unwrap()[0].attempts, 1);
    }

    #[test]
    fn test_queue_error_display() {
        let err = QueueError::NotFound(42);
        assert!(err.to_string().contains("42"));
        let err = QueueError::from(StoreError::Unavailable("disk full".into()));
        assert!(err.to_string().contains("disk full"));
    }
}

//! # Upload Propagator
//!
//! Pushes local state to the remote store.
//!
//! ## Write Paths
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                        Upload Propagator                                │
//! │                                                                         │
//! │  BOOTSTRAP (once per Active transition)                                │
//! │  ──────────────────────────────────────                                │
//! │  for collection in users, batches, orders, config:                     │
//! │      for chunk in records.chunks(bootstrap_chunk_size):                │
//! │          join_all(set_merge(record) for record in chunk)               │
//! │          failures: warn! per record, keep going                        │
//! │                                                                         │
//! │  MIRROR (every local save / delete)                                    │
//! │  ───────────────────────────────────                                   │
//! │  ChangeNotifier ──Saved(record)──► set_merge ─┐                        │
//! │                 ──Deleted(id)───► delete ─────┤                        │
//! │                 ──Restored──────► chunked re-upload of the collection  │
//! │                 ──Merged────────► ignored     │                        │
//! │                                               ▼                        │
//! │                         failed? retry with exponential backoff         │
//! │                                               │                        │
//! │                         still failing ──► sync_dead_letters            │
//! │                                                                         │
//! │  REPLAY (after bootstrap)                                              │
//! │  ────────────────────────                                              │
//! │  pending dead letters ──► re-issued against current local state        │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! The mirror runs on its own task. `save` and `delete` return as soon as
//! the local write is durable; mirror outcomes never reach their callers.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use backoff::backoff::Backoff;
use backoff::ExponentialBackoff;
use barsa_core::{Collection, Record};
use barsa_db::{ChangeCause, CollectionChanged, DeadLetterOperation, LocalStore};
use futures_util::future::join_all;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use crate::config::SyncSettings;
use crate::error::{SyncError, SyncResult};
use crate::remote::SharedSession;

/// Dead letters replayed per Active transition.
const REPLAY_BATCH_LIMIT: u32 = 500;

// =============================================================================
// Reports
// =============================================================================

/// Upload counts for one collection.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CollectionUpload {
    pub uploaded: usize,
    pub failed: usize,
}

/// Result of a bootstrap upload.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BootstrapReport {
    /// Per-collection counts, in upload order.
    pub collections: Vec<(Collection, CollectionUpload)>,

    /// True if the session closed before every collection was uploaded.
    pub interrupted: bool,
}

impl BootstrapReport {
    pub fn uploaded(&self) -> usize {
        self.collections.iter().map(|(_, c)| c.uploaded).sum()
    }

    pub fn failed(&self) -> usize {
        self.collections.iter().map(|(_, c)| c.failed).sum()
    }

    pub fn for_collection(&self, collection: Collection) -> CollectionUpload {
        self.collections
            .iter()
            .find(|(c, _)| *c == collection)
            .map(|(_, counts)| *counts)
            .unwrap_or_default()
    }
}

/// Result of a dead-letter replay.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReplayReport {
    /// Operations re-issued successfully.
    pub replayed: usize,

    /// Entries settled without a remote call: the local state has moved on.
    pub superseded: usize,

    /// Entries that failed again and stay pending.
    pub failed: usize,
}

/// Outcome of uploading one collection.
#[derive(Debug, Default)]
struct CollectionPass {
    counts: CollectionUpload,
    /// Records that failed for a reason other than a closed session.
    failures: Vec<(Record, SyncError)>,
    interrupted: bool,
}

// =============================================================================
// Mirror Operations
// =============================================================================

/// One local mutation to mirror.
#[derive(Debug, Clone)]
enum MirrorOp {
    Upsert { collection: Collection, record: Record },
    Delete { collection: Collection, id: String },
}

impl MirrorOp {
    fn from_event(event: CollectionChanged) -> Option<Self> {
        let collection = event.collection;
        match event.cause {
            ChangeCause::Saved(record) => Some(MirrorOp::Upsert { collection, record }),
            ChangeCause::Deleted(id) => Some(MirrorOp::Delete { collection, id }),
            ChangeCause::Merged | ChangeCause::Restored => None,
        }
    }

    fn collection(&self) -> Collection {
        match self {
            MirrorOp::Upsert { collection, .. } | MirrorOp::Delete { collection, .. } => {
                *collection
            }
        }
    }

    fn record_id(&self) -> &str {
        match self {
            MirrorOp::Upsert { record, .. } => record.id(),
            MirrorOp::Delete { id, .. } => id,
        }
    }

    fn operation(&self) -> DeadLetterOperation {
        match self {
            MirrorOp::Upsert { .. } => DeadLetterOperation::Upsert,
            MirrorOp::Delete { .. } => DeadLetterOperation::Delete,
        }
    }

    async fn execute(&self, session: &SharedSession) -> SyncResult<()> {
        match self {
            MirrorOp::Upsert { collection, record } => {
                session.set_merge(collection.as_str(), record).await
            }
            MirrorOp::Delete { collection, id } => session.delete(collection.as_str(), id).await,
        }
    }
}

// =============================================================================
// Mirror Handle
// =============================================================================

/// Counters for a running mirror.
#[derive(Debug, Default)]
pub struct MirrorStats {
    mirrored: AtomicUsize,
    dead_lettered: AtomicUsize,
}

impl MirrorStats {
    /// Mutations written to the remote.
    pub fn mirrored(&self) -> usize {
        self.mirrored.load(Ordering::Relaxed)
    }

    /// Mutations that ended in the dead-letter table.
    pub fn dead_lettered(&self) -> usize {
        self.dead_lettered.load(Ordering::Relaxed)
    }
}

/// Handle to a running mirror task. Dropping it stops the mirror.
pub struct MirrorHandle {
    stats: Arc<MirrorStats>,
    shutdown_tx: mpsc::Sender<()>,
    task: JoinHandle<()>,
}

impl MirrorHandle {
    pub fn stats(&self) -> &MirrorStats {
        &self.stats
    }

    /// Stops the mirror. An operation caught mid-retry is dead-lettered.
    pub async fn stop(self) {
        let _ = self.shutdown_tx.send(()).await;
        if let Err(e) = self.task.await {
            warn!(?e, "Mirror task failed");
        }
    }
}

// =============================================================================
// Upload Propagator
// =============================================================================

/// Uploads local state and mirrors local mutations.
#[derive(Debug, Clone)]
pub struct UploadPropagator {
    settings: SyncSettings,
}

impl UploadPropagator {
    pub fn new(settings: &SyncSettings) -> Self {
        UploadPropagator {
            settings: settings.clone(),
        }
    }

    // =========================================================================
    // Bootstrap
    // =========================================================================

    /// Uploads every local record with a merge-write.
    ///
    /// Per-record failures are logged and counted. Only a closed session
    /// stops the upload early.
    pub async fn bootstrap(
        &self,
        session: &SharedSession,
        store: &LocalStore,
    ) -> SyncResult<BootstrapReport> {
        let chunk_size = self.settings.bootstrap_chunk_size.max(1);
        let mut report = BootstrapReport::default();

        info!(session = %session.name(), chunk_size, "Starting bootstrap upload");

        for collection in Collection::ALL {
            let pass = self
                .upload_collection(session, store, collection, chunk_size)
                .await?;
            report.collections.push((collection, pass.counts));

            if pass.interrupted {
                report.interrupted = true;
                warn!(collection = %collection, "Session closed during bootstrap upload");
                break;
            }
        }

        info!(
            uploaded = report.uploaded(),
            failed = report.failed(),
            interrupted = report.interrupted,
            "Bootstrap upload finished"
        );
        Ok(report)
    }

    /// Uploads one collection in chunks of `chunk_size`, concurrently
    /// within a chunk.
    async fn upload_collection(
        &self,
        session: &SharedSession,
        store: &LocalStore,
        collection: Collection,
        chunk_size: usize,
    ) -> SyncResult<CollectionPass> {
        let records = store.get(collection).await?;
        let mut pass = CollectionPass::default();

        for chunk in records.chunks(chunk_size) {
            let results = join_all(
                chunk
                    .iter()
                    .map(|record| session.set_merge(collection.as_str(), record)),
            )
            .await;

            for (record, result) in chunk.iter().zip(results) {
                match result {
                    Ok(()) => pass.counts.uploaded += 1,
                    Err(e) => {
                        pass.counts.failed += 1;
                        if matches!(e, SyncError::SessionClosed) {
                            pass.interrupted = true;
                        } else {
                            warn!(
                                collection = %collection,
                                id = %record.id(),
                                ?e,
                                "Upload failed for record"
                            );
                            pass.failures.push((record.clone(), e));
                        }
                    }
                }
            }

            if pass.interrupted {
                break;
            }
            trace!(collection = %collection, uploaded = pass.counts.uploaded, "Chunk uploaded");
        }

        debug!(
            collection = %collection,
            uploaded = pass.counts.uploaded,
            failed = pass.counts.failed,
            "Collection uploaded"
        );
        Ok(pass)
    }

    // =========================================================================
    // Dead-Letter Replay
    // =========================================================================

    /// Re-issues pending dead letters against the current local state.
    ///
    /// An upsert pushes the record as it is now; if it has since been
    /// deleted locally there is nothing to push. A delete is re-issued only
    /// if the record is still absent locally.
    pub async fn replay_dead_letters(
        &self,
        session: &SharedSession,
        store: &LocalStore,
    ) -> SyncResult<ReplayReport> {
        let dead_letters = store.database().dead_letters();
        let pending = dead_letters.pending(REPLAY_BATCH_LIMIT).await?;
        let mut report = ReplayReport::default();

        if pending.is_empty() {
            return Ok(report);
        }
        info!(count = pending.len(), "Replaying dead letters");

        for letter in pending {
            let current = store.get_one(letter.collection, &letter.record_id).await?;

            let result = match (letter.operation, current) {
                (DeadLetterOperation::Upsert, Some(record)) => session
                    .set_merge(letter.collection.as_str(), &record)
                    .await
                    .map(|()| true),
                (DeadLetterOperation::Delete, None) => session
                    .delete(letter.collection.as_str(), &letter.record_id)
                    .await
                    .map(|()| true),
                _ => Ok(false),
            };

            match result {
                Ok(sent) => {
                    dead_letters.mark_replayed(&letter.id).await?;
                    if sent {
                        report.replayed += 1;
                    } else {
                        report.superseded += 1;
                    }
                }
                Err(e) => {
                    report.failed += 1;
                    dead_letters.mark_failed(&letter.id, &e.to_string()).await?;
                    warn!(
                        collection = %letter.collection,
                        record_id = %letter.record_id,
                        ?e,
                        "Dead letter replay failed"
                    );
                    if matches!(e, SyncError::SessionClosed) {
                        break;
                    }
                }
            }
        }

        info!(
            replayed = report.replayed,
            superseded = report.superseded,
            failed = report.failed,
            "Dead-letter replay finished"
        );
        Ok(report)
    }

    // =========================================================================
    // Per-Mutation Mirror
    // =========================================================================

    /// Starts mirroring local saves and deletes to `session`.
    ///
    /// The store subscription is taken before this returns, so no mutation
    /// made after the call is missed.
    pub fn spawn_mirror(&self, session: SharedSession, store: LocalStore) -> MirrorHandle {
        let events = store.notifier().subscribe_all();
        let (shutdown_tx, shutdown_rx) = mpsc::channel(1);
        let stats = Arc::new(MirrorStats::default());

        let mirror = Mirror {
            propagator: self.clone(),
            session,
            store,
            stats: stats.clone(),
            shutdown_rx,
        };
        let task = tokio::spawn(mirror.run(events));

        MirrorHandle {
            stats,
            shutdown_tx,
            task,
        }
    }
}

struct Mirror {
    propagator: UploadPropagator,
    session: SharedSession,
    store: LocalStore,
    stats: Arc<MirrorStats>,
    shutdown_rx: mpsc::Receiver<()>,
}

impl Mirror {
    async fn run(mut self, mut events: mpsc::UnboundedReceiver<CollectionChanged>) {
        debug!(session = %self.session.name(), "Mirror started");

        loop {
            let event = tokio::select! {
                _ = self.shutdown_rx.recv() => break,
                event = events.recv() => match event {
                    Some(event) => event,
                    None => break,
                },
            };

            if event.cause == ChangeCause::Restored {
                self.reupload(event.collection).await;
                continue;
            }

            let Some(op) = MirrorOp::from_event(event) else {
                continue;
            };

            // Operations are mirrored one at a time to keep per-record order.
            let stopped = self.mirror(op).await;
            if stopped {
                break;
            }
        }

        debug!(session = %self.session.name(), "Mirror stopped");
    }

    /// Uploads a whole collection after a restore or reset. Records that
    /// fail are dead-lettered as upserts.
    async fn reupload(&self, collection: Collection) {
        let chunk_size = self.propagator.settings.bootstrap_chunk_size.max(1);
        info!(collection = %collection, "Collection restored locally, uploading it");

        let pass = match self
            .propagator
            .upload_collection(&self.session, &self.store, collection, chunk_size)
            .await
        {
            Ok(pass) => pass,
            Err(e) => {
                warn!(collection = %collection, ?e, "Failed to read restored collection");
                return;
            }
        };

        self.stats
            .mirrored
            .fetch_add(pass.counts.uploaded, Ordering::Relaxed);
        for (record, err) in pass.failures {
            let op = MirrorOp::Upsert { collection, record };
            self.dead_letter(&op, 1, &err).await;
        }
    }

    /// Mirrors one operation. Returns true if shutdown was requested while
    /// it was waiting to retry.
    async fn mirror(&mut self, op: MirrorOp) -> bool {
        let mut backoff = self.create_backoff();
        let max_attempts = self.propagator.settings.mirror_max_retries.saturating_add(1);
        let mut attempt = 0u32;

        loop {
            attempt += 1;
            let err = match op.execute(&self.session).await {
                Ok(()) => {
                    self.stats.mirrored.fetch_add(1, Ordering::Relaxed);
                    trace!(collection = %op.collection(), id = %op.record_id(), attempt, "Mutation mirrored");
                    return false;
                }
                Err(e) => e,
            };

            if !err.is_retryable() || attempt >= max_attempts {
                self.dead_letter(&op, attempt, &err).await;
                return false;
            }

            let delay = backoff
                .next_backoff()
                .unwrap_or_else(|| self.propagator.settings.mirror_max_backoff());
            debug!(
                collection = %op.collection(),
                id = %op.record_id(),
                attempt,
                ?delay,
                ?err,
                "Mirror write failed, retrying"
            );

            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = self.shutdown_rx.recv() => {
                    self.dead_letter(&op, attempt, &SyncError::ShuttingDown).await;
                    return true;
                }
            }
        }
    }

    async fn dead_letter(&self, op: &MirrorOp, attempts: u32, err: &SyncError) {
        let payload = match op {
            MirrorOp::Upsert { record, .. } => serde_json::to_string(record).ok(),
            MirrorOp::Delete { .. } => None,
        };

        let recorded = self
            .store
            .database()
            .dead_letters()
            .record(
                op.collection(),
                op.record_id(),
                op.operation(),
                payload.as_deref(),
                attempts,
                &err.to_string(),
            )
            .await;

        match recorded {
            Ok(entry) => {
                self.stats.dead_lettered.fetch_add(1, Ordering::Relaxed);
                warn!(
                    collection = %op.collection(),
                    id = %op.record_id(),
                    operation = op.operation().as_str(),
                    attempts,
                    dead_letter = %entry.id,
                    error = %err,
                    "Mirror write abandoned"
                );
            }
            Err(e) => {
                warn!(
                    collection = %op.collection(),
                    id = %op.record_id(),
                    error = %err,
                    ?e,
                    "Mirror write abandoned and could not be dead-lettered"
                );
            }
        }
    }

    fn create_backoff(&self) -> ExponentialBackoff {
        ExponentialBackoff {
            initial_interval: self.propagator.settings.mirror_initial_backoff(),
            max_interval: self.propagator.settings.mirror_max_backoff(),
            multiplier: 2.0,
            max_elapsed_time: None,
            ..Default::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ConnectionFailureKind;
    use crate::remote::{MemoryRemote, RemoteConnector};
    use barsa_core::Credentials;
    use serde_json::json;
    use std::time::Duration;

    const PROJECT: &str = "barsa-test";

    fn settings() -> SyncSettings {
        SyncSettings {
            bootstrap_chunk_size: 2,
            mirror_max_retries: 2,
            mirror_initial_backoff_ms: 5,
            mirror_max_backoff_ms: 20,
            ..SyncSettings::default()
        }
    }

    fn rec(id: &str) -> Record {
        Record::from_value(json!({"id": id, "client": "Ana"})).unwrap()
    }

    async fn setup() -> (MemoryRemote, SharedSession, LocalStore) {
        let remote = MemoryRemote::new();
        remote.provision(PROJECT, "key-1");
        let session = remote
            .open(&Credentials::new("key-1", PROJECT), "primary")
            .await
            .unwrap();
        let store = LocalStore::in_memory().await.unwrap();
        (remote, Arc::from(session), store)
    }

    async fn wait_until(mut check: impl FnMut() -> bool) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while !check() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("condition not reached in time");
    }

    #[tokio::test]
    async fn test_bootstrap_uploads_every_collection_in_chunks() {
        let (remote, session, store) = setup().await;
        for id in ["o-1", "o-2", "o-3"] {
            store.save(Collection::Orders, rec(id)).await.unwrap();
        }
        store.save(Collection::Users, rec("u-1")).await.unwrap();

        let report = UploadPropagator::new(&settings())
            .bootstrap(&session, &store)
            .await
            .unwrap();

        assert_eq!(report.uploaded(), 4);
        assert_eq!(report.for_collection(Collection::Orders).uploaded, 3);
        assert!(!report.interrupted);
        assert_eq!(remote.documents(PROJECT, "orders").len(), 3);
    }

    #[tokio::test]
    async fn test_bootstrap_keeps_going_after_failures() {
        let (remote, session, store) = setup().await;
        for id in ["o-1", "o-2", "o-3"] {
            store.save(Collection::Orders, rec(id)).await.unwrap();
        }
        remote.fail_next_writes(1, ConnectionFailureKind::PermissionDenied);

        let report = UploadPropagator::new(&settings())
            .bootstrap(&session, &store)
            .await
            .unwrap();

        assert_eq!(report.for_collection(Collection::Orders).failed, 1);
        assert_eq!(report.for_collection(Collection::Orders).uploaded, 2);
    }

    #[tokio::test]
    async fn test_mirror_skips_merged_events() {
        let (remote, session, store) = setup().await;
        let mirror = UploadPropagator::new(&settings()).spawn_mirror(session, store.clone());

        store
            .update(Collection::Orders, |mut set| {
                set.upsert(rec("remote-1"));
                Some(set)
            })
            .await
            .unwrap();
        store.save(Collection::Orders, rec("o-1")).await.unwrap();

        wait_until(|| mirror.stats().mirrored() == 1).await;
        assert_eq!(remote.write_count(), 1);
        assert!(remote.document(PROJECT, "orders", "remote-1").is_none());
        mirror.stop().await;
    }

    #[tokio::test]
    async fn test_mirror_retries_transient_failures() {
        let (remote, session, store) = setup().await;
        let mirror = UploadPropagator::new(&settings()).spawn_mirror(session, store.clone());

        remote.fail_next_writes(2, ConnectionFailureKind::NetworkUnavailable);
        store.save(Collection::Batches, rec("b-1")).await.unwrap();

        wait_until(|| mirror.stats().mirrored() == 1).await;
        assert_eq!(remote.write_count(), 3);
        assert_eq!(mirror.stats().dead_lettered(), 0);
        mirror.stop().await;
    }

    #[tokio::test]
    async fn test_exhausted_retries_are_dead_lettered_and_replayed() {
        let (remote, session, store) = setup().await;
        let propagator = UploadPropagator::new(&settings());
        let mirror = propagator.spawn_mirror(session.clone(), store.clone());

        remote.fail_next_writes(10, ConnectionFailureKind::NetworkUnavailable);
        store.save(Collection::Orders, rec("o-1")).await.unwrap();

        wait_until(|| mirror.stats().dead_lettered() == 1).await;
        mirror.stop().await;

        let pending = store.database().dead_letters().pending(10).await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].operation, DeadLetterOperation::Upsert);
        assert_eq!(pending[0].attempts, 3);

        remote.fail_next_writes(0, ConnectionFailureKind::Unknown);
        let report = propagator.replay_dead_letters(&session, &store).await.unwrap();
        assert_eq!(report.replayed, 1);
        assert!(remote.document(PROJECT, "orders", "o-1").is_some());
        assert_eq!(store.database().dead_letters().count_pending().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_permission_denied_is_not_retried() {
        let (remote, session, store) = setup().await;
        let mirror = UploadPropagator::new(&settings()).spawn_mirror(session, store.clone());

        store.save(Collection::Orders, rec("o-9")).await.unwrap();
        wait_until(|| mirror.stats().mirrored() == 1).await;

        remote.fail_next_writes(1, ConnectionFailureKind::PermissionDenied);
        store.delete(Collection::Orders, "o-9").await.unwrap();

        wait_until(|| mirror.stats().dead_lettered() == 1).await;
        assert_eq!(remote.write_count(), 2);
        mirror.stop().await;
    }

    #[tokio::test]
    async fn test_restored_collection_is_uploaded() {
        let (remote, session, store) = setup().await;
        let mirror = UploadPropagator::new(&settings()).spawn_mirror(session, store.clone());

        remote.fail_next_writes(1, ConnectionFailureKind::PermissionDenied);
        store
            .replace_all(Collection::Orders, vec![rec("r-1"), rec("r-2"), rec("r-3")])
            .await
            .unwrap();

        wait_until(|| mirror.stats().mirrored() == 2 && mirror.stats().dead_lettered() == 1).await;
        assert_eq!(remote.documents(PROJECT, "orders").len(), 2);

        let pending = store.database().dead_letters().pending(10).await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].operation, DeadLetterOperation::Upsert);
        mirror.stop().await;
    }

    #[tokio::test]
    async fn test_replay_skips_superseded_upsert() {
        let (_remote, session, store) = setup().await;
        store
            .database()
            .dead_letters()
            .record(Collection::Orders, "gone", DeadLetterOperation::Upsert, None, 3, "offline")
            .await
            .unwrap();

        let report = UploadPropagator::new(&settings())
            .replay_dead_letters(&session, &store)
            .await
            .unwrap();
        assert_eq!(report.superseded, 1);
        assert_eq!(report.replayed, 0);
    }
}

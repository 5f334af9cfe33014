//! # Change Listener
//!
//! One task per collection: receives change batches from the remote feed
//! and merges them into the LocalStore.
//!
//! ```text
//!   Subscription(orders) ──batch──► apply_batch
//!                                      │
//!                                      ▼
//!                     LocalStore::update(orders, |snapshot| MergeEngine::merge)
//!                                      │
//!                        dirty? ───────┴────── clean?
//!                          │                     │
//!                   write + Merged event     nothing
//! ```
//!
//! Batches of one collection are applied strictly in receipt order. The
//! store's write lock keeps a local save from landing between the merge's
//! read and its write.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use barsa_core::{ChangeBatch, Collection};
use barsa_db::LocalStore;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use crate::error::SyncResult;
use crate::merge::MergeEngine;
use crate::remote::{SharedSession, Subscription};

/// Counters for one listener.
#[derive(Debug, Default)]
pub struct ListenerStats {
    received: AtomicUsize,
    applied: AtomicUsize,
}

impl ListenerStats {
    /// Batches received from the feed.
    pub fn received(&self) -> usize {
        self.received.load(Ordering::Relaxed)
    }

    /// Batches that changed the LocalStore.
    pub fn applied(&self) -> usize {
        self.applied.load(Ordering::Relaxed)
    }
}

/// Handle to a running listener. Dropping it stops the listener.
pub struct ListenerHandle {
    collection: Collection,
    stats: Arc<ListenerStats>,
    stop_tx: Option<oneshot::Sender<()>>,
    task: JoinHandle<()>,
}

impl ListenerHandle {
    pub fn collection(&self) -> Collection {
        self.collection
    }

    pub fn stats(&self) -> &ListenerStats {
        &self.stats
    }

    /// True once the feed has ended or the listener was stopped.
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Stops the listener and waits until its subscription is released.
    pub async fn stop(mut self) {
        if let Some(stop) = self.stop_tx.take() {
            let _ = stop.send(());
        }
        if let Err(e) = (&mut self.task).await {
            warn!(collection = %self.collection, ?e, "Listener task failed");
        }
    }
}

/// Starts change listeners.
pub struct ChangeListener;

impl ChangeListener {
    /// Subscribes to `collection` on `session` and starts merging.
    pub async fn start(
        session: &SharedSession,
        store: LocalStore,
        collection: Collection,
    ) -> SyncResult<ListenerHandle> {
        let subscription = session.subscribe(collection).await?;
        debug!(collection = %collection, session = %session.name(), "Listener attached");
        Ok(Self::spawn(subscription, store))
    }

    /// Starts merging batches from an existing subscription.
    pub fn spawn(subscription: Subscription, store: LocalStore) -> ListenerHandle {
        let collection = subscription.collection();
        let stats = Arc::new(ListenerStats::default());
        let (stop_tx, stop_rx) = oneshot::channel();

        let task = tokio::spawn(run(subscription, store, stop_rx, stats.clone()));

        ListenerHandle {
            collection,
            stats,
            stop_tx: Some(stop_tx),
            task,
        }
    }
}

async fn run(
    mut subscription: Subscription,
    store: LocalStore,
    mut stop_rx: oneshot::Receiver<()>,
    stats: Arc<ListenerStats>,
) {
    let collection = subscription.collection();

    loop {
        tokio::select! {
            _ = &mut stop_rx => {
                debug!(collection = %collection, "Listener stopped");
                break;
            }
            batch = subscription.next() => {
                let Some(batch) = batch else {
                    info!(collection = %collection, "Change feed ended");
                    break;
                };
                stats.received.fetch_add(1, Ordering::Relaxed);

                if batch.collection != collection {
                    warn!(
                        expected = %collection,
                        got = %batch.collection,
                        "Dropping batch for another collection"
                    );
                    continue;
                }

                match apply_batch(&store, &batch).await {
                    Ok(true) => {
                        stats.applied.fetch_add(1, Ordering::Relaxed);
                    }
                    Ok(false) => {}
                    Err(e) => {
                        warn!(collection = %collection, ?e, "Failed to merge remote changes");
                    }
                }
            }
        }
    }
}

/// Merges one batch into the LocalStore.
///
/// ## Returns
/// `true` if the collection was written (and a `Merged` event published).
pub async fn apply_batch(store: &LocalStore, batch: &ChangeBatch) -> SyncResult<bool> {
    if batch.is_cache_noop() {
        trace!(collection = %batch.collection, "Skipping empty cached batch");
        return Ok(false);
    }

    let mut summary = (0, 0, false);
    let written = store
        .update(batch.collection, |snapshot| {
            let outcome = MergeEngine::merge(snapshot, batch);
            summary = (outcome.upserts, outcome.removals, outcome.bootstrapped);
            outcome.into_update()
        })
        .await?;

    let (upserts, removals, bootstrapped) = summary;
    if written {
        debug!(
            collection = %batch.collection,
            upserts,
            removals,
            bootstrapped,
            from_cache = batch.from_cache,
            "Remote changes merged"
        );
    } else {
        trace!(collection = %batch.collection, "Remote batch changed nothing");
    }
    Ok(written)
}

#[cfg(test)]
mod tests {
    use super::*;
    use barsa_core::{Record, RemoteChange};
    use barsa_db::ChangeCause;
    use serde_json::json;
    use tokio::sync::mpsc;

    fn rec(id: &str, v: i64) -> Record {
        Record::from_value(json!({"id": id, "v": v})).unwrap()
    }

    #[tokio::test]
    async fn test_apply_batch_writes_once() {
        let store = LocalStore::in_memory().await.unwrap();
        let mut events = store.notifier().subscribe(Collection::Orders);

        let batch = ChangeBatch {
            changes: vec![RemoteChange::Added { record: rec("o-1", 1) }],
            ..ChangeBatch::new(Collection::Orders)
        };

        assert!(apply_batch(&store, &batch).await.unwrap());
        assert!(!apply_batch(&store, &batch).await.unwrap());

        assert_eq!(events.recv().await.unwrap().cause, ChangeCause::Merged);
        assert!(events.try_recv().is_err());
        assert_eq!(store.get(Collection::Orders).await.unwrap(), vec![rec("o-1", 1)]);
    }

    #[tokio::test]
    async fn test_listener_applies_in_order_and_stops() {
        let store = LocalStore::in_memory().await.unwrap();
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = ChangeListener::spawn(Subscription::new(Collection::Batches, rx, || {}), store.clone());
        let mut events = store.notifier().subscribe(Collection::Batches);

        tx.send(ChangeBatch {
            changes: vec![RemoteChange::Added { record: rec("b-1", 1) }],
            ..ChangeBatch::new(Collection::Batches)
        })
        .unwrap();
        tx.send(ChangeBatch {
            changes: vec![RemoteChange::Modified { record: rec("b-1", 2) }],
            ..ChangeBatch::new(Collection::Batches)
        })
        .unwrap();

        events.recv().await.unwrap();
        events.recv().await.unwrap();
        assert_eq!(store.get(Collection::Batches).await.unwrap(), vec![rec("b-1", 2)]);
        assert_eq!(handle.stats().applied(), 2);

        handle.stop().await;
        assert!(tx.is_closed());
    }

    #[tokio::test]
    async fn test_listener_exits_when_feed_ends() {
        let store = LocalStore::in_memory().await.unwrap();
        let (tx, rx) = mpsc::unbounded_channel::<ChangeBatch>();
        let handle = ChangeListener::spawn(Subscription::new(Collection::Users, rx, || {}), store);

        drop(tx);
        tokio::time::timeout(std::time::Duration::from_secs(1), async {
            while !handle.is_finished() {
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();
    }
}

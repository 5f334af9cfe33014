//! # Remote Document Store
//!
//! The seam between the sync core and whatever hosts the remote copy.
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                       Remote Store Abstraction                          │
//! │                                                                         │
//! │  RemoteConnector::open(credentials, name)                              │
//! │        │                                                                │
//! │        ▼                                                                │
//! │  RemoteSession ─┬─ enable_offline_cache()   best effort                │
//! │                 ├─ set_merge(coll, record)  keeps remote-only fields   │
//! │                 ├─ delete(coll, id)                                    │
//! │                 ├─ subscribe(coll) ───► Subscription                   │
//! │                 │                          │  initial snapshot batch   │
//! │                 │                          │  then one batch per change│
//! │                 │                          ▼                           │
//! │                 │                      ChangeBatch                     │
//! │                 └─ terminate()  ends every subscription                │
//! │                                                                         │
//! │  Implementations:                                                      │
//! │  • MemoryRemote  in-process, instrumented (tests, hub backing store)   │
//! │  • WsConnector   WebSocket client for a DocumentHub                    │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

pub mod memory;
pub mod ws;

use std::sync::Arc;

use async_trait::async_trait;
use barsa_core::{ChangeBatch, Collection, Credentials, Record};
use tokio::sync::mpsc;

use crate::error::SyncResult;

pub use memory::MemoryRemote;
pub use ws::WsConnector;

/// Opens sessions against a remote store.
#[async_trait]
pub trait RemoteConnector: Send + Sync {
    /// Opens a session named `session_name`.
    ///
    /// Opening may be lazy: bad credentials can surface on the first
    /// operation rather than here.
    async fn open(
        &self,
        credentials: &Credentials,
        session_name: &str,
    ) -> SyncResult<Box<dyn RemoteSession>>;
}

/// An open connection to the remote store.
#[async_trait]
pub trait RemoteSession: Send + Sync {
    /// Name the session was opened with.
    fn name(&self) -> &str;

    /// Enables the offline cache. Fails if another session holds it.
    async fn enable_offline_cache(&self) -> SyncResult<()>;

    /// Merge-writes a record into `collection`, keyed by its id.
    async fn set_merge(&self, collection: &str, record: &Record) -> SyncResult<()>;

    /// Deletes the document `id` from `collection`.
    async fn delete(&self, collection: &str, id: &str) -> SyncResult<()>;

    /// Subscribes to a collection's change feed.
    async fn subscribe(&self, collection: Collection) -> SyncResult<Subscription>;

    /// Closes the session. Every subscription ends.
    async fn terminate(&self) -> SyncResult<()>;
}

/// Shared handle to a session.
pub type SharedSession = Arc<dyn RemoteSession>;

/// A live change feed for one collection.
///
/// Dropping the subscription unsubscribes.
pub struct Subscription {
    collection: Collection,
    receiver: mpsc::UnboundedReceiver<ChangeBatch>,
    on_drop: Option<Box<dyn FnOnce() + Send>>,
}

impl Subscription {
    /// Creates a subscription. `on_drop` runs exactly once when it is
    /// dropped.
    pub fn new(
        collection: Collection,
        receiver: mpsc::UnboundedReceiver<ChangeBatch>,
        on_drop: impl FnOnce() + Send + 'static,
    ) -> Self {
        Subscription {
            collection,
            receiver,
            on_drop: Some(Box::new(on_drop)),
        }
    }

    pub fn collection(&self) -> Collection {
        self.collection
    }

    /// Waits for the next batch. `None` once the feed has ended.
    pub async fn next(&mut self) -> Option<ChangeBatch> {
        self.receiver.recv().await
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(unsubscribe) = self.on_drop.take() {
            unsubscribe();
        }
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("collection", &self.collection)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};

    #[tokio::test]
    async fn test_subscription_unsubscribes_on_drop() {
        let (tx, rx) = mpsc::unbounded_channel();
        let dropped = Arc::new(AtomicBool::new(false));
        let flag = dropped.clone();

        let mut sub = Subscription::new(Collection::Orders, rx, move || {
            flag.store(true, Ordering::SeqCst);
        });

        tx.send(ChangeBatch::new(Collection::Orders)).unwrap();
        assert!(sub.next().await.is_some());
        assert!(!dropped.load(Ordering::SeqCst));

        drop(sub);
        assert!(dropped.load(Ordering::SeqCst));
    }
}

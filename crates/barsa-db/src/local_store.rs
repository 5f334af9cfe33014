//! # LocalStore
//!
//! The authoritative, always-available store for every collection.
//!
//! ## Data Flow
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                                                                         │
//! │  Collaborators (UI, business logic)        MergeEngine (barsa-sync)    │
//! │     get / save / delete                       update(collection, f)    │
//! │           │                                          │                  │
//! │           └──────────────┬───────────────────────────┘                  │
//! │                          ▼                                              │
//! │               ┌─────────────────────┐                                   │
//! │               │  write lock (async) │  one read-modify-write at a time │
//! │               └──────────┬──────────┘                                   │
//! │                          ▼                                              │
//! │          collections table: one JSON array per name                    │
//! │                          │                                              │
//! │                          ▼                                              │
//! │          ChangeNotifier.publish(<collection>-changed)                  │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Reads and writes never depend on a remote session. A corrupted payload
//! reads as an empty collection (bad elements are dropped individually)
//! and is logged, never returned as an error.

use std::sync::Arc;

use barsa_core::{Collection, Record, RecordSet};
use serde_json::Value;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::error::DbResult;
use crate::notify::{ChangeCause, ChangeNotifier, CollectionChanged};
use crate::pool::{Database, DbConfig};
use crate::repository::collection::CollectionRepository;

/// Durable per-collection record storage with change notification.
///
/// Cheap to clone: clones share the database, the write lock and the
/// notifier.
#[derive(Debug, Clone)]
pub struct LocalStore {
    db: Database,
    write_lock: Arc<Mutex<()>>,
    notifier: ChangeNotifier,
}

impl LocalStore {
    /// Wraps an open database without seeding it.
    pub fn new(db: Database) -> Self {
        LocalStore {
            db,
            write_lock: Arc::new(Mutex::new(())),
            notifier: ChangeNotifier::new(),
        }
    }

    /// Opens the database and seeds default records into collections that
    /// have never been written.
    pub async fn open(config: DbConfig) -> DbResult<Self> {
        let store = LocalStore::new(Database::new(config).await?);
        store.seed_defaults().await?;
        Ok(store)
    }

    /// Opens an in-memory, seeded store (for testing).
    pub async fn in_memory() -> DbResult<Self> {
        LocalStore::open(DbConfig::in_memory()).await
    }

    /// Returns the underlying database handle.
    pub fn database(&self) -> &Database {
        &self.db
    }

    /// Returns the change notifier.
    pub fn notifier(&self) -> &ChangeNotifier {
        &self.notifier
    }

    fn collections(&self) -> CollectionRepository {
        self.db.collections()
    }

    // =========================================================================
    // Reads
    // =========================================================================

    /// Returns every record of a collection, in stored order.
    pub async fn get(&self, collection: Collection) -> DbResult<Vec<Record>> {
        Ok(self.snapshot(collection).await?.into_records())
    }

    /// Returns the collection as a [`RecordSet`].
    pub async fn snapshot(&self, collection: Collection) -> DbResult<RecordSet> {
        let payload = self.collections().load(collection.as_str()).await?;
        Ok(match payload {
            Some(payload) => decode_payload(collection, &payload),
            None => RecordSet::new(),
        })
    }

    /// Returns one record by id.
    pub async fn get_one(&self, collection: Collection, id: &str) -> DbResult<Option<Record>> {
        Ok(self.snapshot(collection).await?.get(id).cloned())
    }

    /// Returns the raw stored payload, exactly as persisted.
    pub async fn raw_payload(&self, collection: Collection) -> DbResult<Option<String>> {
        self.collections().load(collection.as_str()).await
    }

    // =========================================================================
    // Writes
    // =========================================================================

    /// Saves a record: replaces the entry with the same id in place, or
    /// appends it.
    pub async fn save(&self, collection: Collection, record: Record) -> DbResult<()> {
        let _guard = self.write_lock.lock().await;

        let mut set = self.snapshot(collection).await?;
        set.upsert(record.clone());
        self.write_set(collection, &set).await?;

        debug!(collection = %collection, id = %record.id(), "Record saved");
        self.notify(collection, ChangeCause::Saved(record));
        Ok(())
    }

    /// Deletes a record by id.
    ///
    /// ## Returns
    /// `true` if a record was removed. Deleting an absent id writes nothing
    /// and publishes nothing.
    pub async fn delete(&self, collection: Collection, id: &str) -> DbResult<bool> {
        let _guard = self.write_lock.lock().await;

        let mut set = self.snapshot(collection).await?;
        if set.remove(id).is_none() {
            debug!(collection = %collection, id = %id, "Delete of absent record ignored");
            return Ok(false);
        }
        self.write_set(collection, &set).await?;

        debug!(collection = %collection, id = %id, "Record deleted");
        self.notify(collection, ChangeCause::Deleted(id.to_string()));
        Ok(true)
    }

    /// Replaces a collection's entire content.
    pub async fn replace_all(&self, collection: Collection, records: Vec<Record>) -> DbResult<()> {
        let _guard = self.write_lock.lock().await;

        let set = RecordSet::from_records(records);
        self.write_set(collection, &set).await?;

        debug!(collection = %collection, count = set.len(), "Collection replaced");
        self.notify(collection, ChangeCause::Restored);
        Ok(())
    }

    /// Atomic read-modify-write of one collection.
    ///
    /// `f` receives the current content and returns `Some(new_content)` to
    /// write it, or `None` to leave the store untouched. Nothing else can
    /// write the collection between the read and the write.
    ///
    /// ## Returns
    /// `true` if a write happened. A `Merged` notification is published only
    /// in that case.
    pub async fn update<F>(&self, collection: Collection, f: F) -> DbResult<bool>
    where
        F: FnOnce(RecordSet) -> Option<RecordSet> + Send,
    {
        let _guard = self.write_lock.lock().await;

        let current = self.snapshot(collection).await?;
        let Some(next) = f(current) else {
            return Ok(false);
        };
        self.write_set(collection, &next).await?;

        debug!(collection = %collection, count = next.len(), "Collection merged");
        self.notify(collection, ChangeCause::Merged);
        Ok(true)
    }

    // =========================================================================
    // Internals shared with seed / backup
    // =========================================================================

    pub(crate) async fn lock_writes(&self) -> tokio::sync::MutexGuard<'_, ()> {
        self.write_lock.lock().await
    }

    pub(crate) async fn write_set(&self, collection: Collection, set: &RecordSet) -> DbResult<()> {
        let payload = encode_payload(set)?;
        self.collections().store(collection.as_str(), &payload).await
    }

    pub(crate) fn notify(&self, collection: Collection, cause: ChangeCause) {
        self.notifier.publish(CollectionChanged { collection, cause });
    }
}

/// Serializes a set as a JSON array, preserving order.
pub(crate) fn encode_payload(set: &RecordSet) -> DbResult<String> {
    let records: Vec<&Record> = set.iter().collect();
    Ok(serde_json::to_string(&records)?)
}

/// Parses a stored payload, degrading every kind of corruption to a
/// smaller or empty set.
pub(crate) fn decode_payload(collection: Collection, payload: &str) -> RecordSet {
    let value: Value = match serde_json::from_str(payload) {
        Ok(value) => value,
        Err(e) => {
            warn!(collection = %collection, error = %e, "Corrupted collection payload, using empty collection");
            return RecordSet::new();
        }
    };

    let Value::Array(items) = value else {
        warn!(collection = %collection, "Collection payload is not an array, using empty collection");
        return RecordSet::new();
    };

    items
        .into_iter()
        .enumerate()
        .filter_map(|(index, item)| match Record::from_value(item) {
            Ok(record) => Some(record),
            Err(e) => {
                warn!(collection = %collection, index, error = %e, "Dropping malformed record");
                None
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn rec(value: Value) -> Record {
        Record::from_value(value).unwrap()
    }

    async fn empty_store() -> LocalStore {
        LocalStore::new(Database::new(DbConfig::in_memory()).await.unwrap())
    }

    #[tokio::test]
    async fn test_save_then_get_round_trip() {
        let store = empty_store().await;
        let order = rec(json!({"id": "o-1", "client": "Juan", "weighings": [{"kg": 12.5}]}));

        store.save(Collection::Orders, order.clone()).await.unwrap();

        let orders = store.get(Collection::Orders).await.unwrap();
        assert_eq!(orders, vec![order.clone()]);
        assert_eq!(
            store.get_one(Collection::Orders, "o-1").await.unwrap(),
            Some(order)
        );
    }

    #[tokio::test]
    async fn test_save_replaces_in_place() {
        let store = empty_store().await;
        for id in ["a", "b", "c"] {
            store.save(Collection::Batches, Record::new(id).unwrap()).await.unwrap();
        }
        store
            .save(Collection::Batches, rec(json!({"id": "b", "closed": true})))
            .await
            .unwrap();

        let ids = store.snapshot(Collection::Batches).await.unwrap().ids();
        assert_eq!(ids, vec!["a", "b", "c"]);
        let b = store.get_one(Collection::Batches, "b").await.unwrap().unwrap();
        assert_eq!(b.get("closed"), Some(&json!(true)));
    }

    #[tokio::test]
    async fn test_delete() {
        let store = empty_store().await;
        store.save(Collection::Users, Record::new("u-1").unwrap()).await.unwrap();

        assert!(store.delete(Collection::Users, "u-1").await.unwrap());
        assert!(!store.delete(Collection::Users, "u-1").await.unwrap());
        assert!(store.get(Collection::Users).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_notifications() {
        let store = empty_store().await;
        let mut rx = store.notifier().subscribe(Collection::Orders);

        let order = Record::new("o-1").unwrap();
        store.save(Collection::Orders, order.clone()).await.unwrap();
        store.delete(Collection::Orders, "o-1").await.unwrap();

        let event = rx.recv().await.unwrap();
        assert_eq!(event.event_name(), "orders-changed");
        assert_eq!(event.cause, ChangeCause::Saved(order));
        assert_eq!(
            rx.recv().await.unwrap().cause,
            ChangeCause::Deleted("o-1".to_string())
        );
    }

    #[tokio::test]
    async fn test_deleting_absent_record_is_silent() {
        let store = empty_store().await;
        let mut rx = store.notifier().subscribe(Collection::Orders);

        assert!(!store.delete(Collection::Orders, "missing").await.unwrap());
        store.save(Collection::Orders, Record::new("o-1").unwrap()).await.unwrap();

        // The first event is the save; the no-op delete published nothing.
        assert!(matches!(rx.recv().await.unwrap().cause, ChangeCause::Saved(_)));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_update_without_change_writes_nothing() {
        let store = empty_store().await;
        let mut rx = store.notifier().subscribe(Collection::Orders);

        let wrote = store.update(Collection::Orders, |_| None).await.unwrap();
        assert!(!wrote);
        assert!(rx.try_recv().is_err());
        assert_eq!(store.raw_payload(Collection::Orders).await.unwrap(), None);

        let wrote = store
            .update(Collection::Orders, |mut set| {
                set.upsert(Record::new("o-9").unwrap());
                Some(set)
            })
            .await
            .unwrap();
        assert!(wrote);
        assert_eq!(rx.recv().await.unwrap().cause, ChangeCause::Merged);
    }

    #[tokio::test]
    async fn test_corrupted_payload_reads_empty() {
        let store = empty_store().await;
        let repo = store.database().collections();

        repo.store("orders", "{not json").await.unwrap();
        assert!(store.get(Collection::Orders).await.unwrap().is_empty());

        repo.store("orders", r#"{"id": "o-1"}"#).await.unwrap();
        assert!(store.get(Collection::Orders).await.unwrap().is_empty());

        // Still writable after corruption.
        store.save(Collection::Orders, Record::new("o-2").unwrap()).await.unwrap();
        assert_eq!(store.get(Collection::Orders).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_malformed_elements_are_dropped() {
        let store = empty_store().await;
        store
            .database()
            .collections()
            .store(
                "batches",
                r#"[{"id":"a"}, 42, {"name":"no id"}, {"id":"b"}, {"id":"a","v":2}]"#,
            )
            .await
            .unwrap();

        let set = store.snapshot(Collection::Batches).await.unwrap();
        assert_eq!(set.ids(), vec!["a", "b"]);
        assert_eq!(set.get("a").unwrap().get("v"), Some(&json!(2)));
    }
}

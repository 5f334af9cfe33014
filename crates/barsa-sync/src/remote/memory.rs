//! # In-Process Remote Store
//!
//! A complete remote document store living in memory. The DocumentHub
//! serves one over WebSocket, and the tests drive one directly.
//!
//! ```text
//! MemoryRemote
//!   └─ projects: { project_id → Project }
//!        ├─ access_key
//!        ├─ collections: { name → RecordSet }
//!        ├─ feeds: [ (feed_id, session_id, collection, sender) ]
//!        └─ cache_holder: Option<session_id>
//! ```
//!
//! Instrumentation: every `open` and every write that reaches the store is
//! counted, and writes can be made to fail on demand.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use barsa_core::{ChangeBatch, Collection, Credentials, Record, RecordSet, RemoteChange};
use serde_json::{Map, Value};
use tokio::sync::mpsc;
use tracing::{debug, trace};

use crate::error::{ConnectionFailureKind, RemoteError, SyncError, SyncResult};
use crate::remote::{RemoteConnector, RemoteSession, Subscription};

// =============================================================================
// Store State
// =============================================================================

struct Feed {
    id: u64,
    session: u64,
    collection: Collection,
    sender: mpsc::UnboundedSender<ChangeBatch>,
}

struct Project {
    access_key: String,
    collections: HashMap<String, RecordSet>,
    feeds: Vec<Feed>,
    cache_holder: Option<u64>,
}

impl Project {
    fn new(access_key: &str) -> Self {
        Project {
            access_key: access_key.to_string(),
            collections: HashMap::new(),
            feeds: Vec::new(),
            cache_holder: None,
        }
    }

    fn documents(&self, collection: &str) -> Vec<Record> {
        self.collections
            .get(collection)
            .map(RecordSet::to_records)
            .unwrap_or_default()
    }

    /// Merge-writes a record. Returns the change to broadcast, if any.
    fn merge_write(&mut self, collection: &str, record: &Record) -> SyncResult<Option<RemoteChange>> {
        let set = self.collections.entry(collection.to_string()).or_default();
        let existed = set.contains(record.id());

        let merged = match set.get(record.id()) {
            Some(current) => {
                let mut fields: Map<String, Value> = current.fields().clone();
                fields.extend(record.fields().clone());
                Record::try_from(fields)?
            }
            None => record.clone(),
        };

        if !set.upsert(merged.clone()) {
            return Ok(None);
        }
        Ok(Some(if existed {
            RemoteChange::Modified { record: merged }
        } else {
            RemoteChange::Added { record: merged }
        }))
    }

    fn remove(&mut self, collection: &str, id: &str) -> Option<RemoteChange> {
        self.collections
            .get_mut(collection)
            .and_then(|set| set.remove(id))
            .map(|_| RemoteChange::Removed { id: id.to_string() })
    }

    /// Sends a change to every feed on the collection, dropping closed feeds.
    fn broadcast(&mut self, collection: &str, change: RemoteChange) {
        let Ok(target) = collection.parse::<Collection>() else {
            return;
        };
        let documents = self.documents(collection);
        self.feeds.retain(|feed| {
            if feed.collection != target {
                return true;
            }
            let batch = ChangeBatch {
                collection: target,
                changes: vec![change.clone()],
                documents: documents.clone(),
                from_cache: false,
            };
            feed.sender.send(batch).is_ok()
        });
    }
}

struct Fault {
    remaining: u32,
    kind: ConnectionFailureKind,
}

#[derive(Default)]
struct RemoteState {
    projects: HashMap<String, Project>,
    offline: bool,
    fault: Option<Fault>,
}

#[derive(Default)]
struct Inner {
    state: Mutex<RemoteState>,
    next_id: AtomicU64,
    opens: AtomicUsize,
    writes: AtomicUsize,
    terminations: AtomicUsize,
}

// =============================================================================
// MemoryRemote
// =============================================================================

/// In-memory remote document store and its connector.
///
/// Cheap to clone; clones share the same store.
#[derive(Clone, Default)]
pub struct MemoryRemote {
    inner: Arc<Inner>,
}

impl MemoryRemote {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, RemoteState> {
        self.inner
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn next_id(&self) -> u64 {
        self.inner.next_id.fetch_add(1, Ordering::Relaxed) + 1
    }

    // =========================================================================
    // Administration
    // =========================================================================

    /// Creates a project reachable with `access_key`. An existing project
    /// keeps its documents and gets the new key.
    pub fn provision(&self, project_id: &str, access_key: &str) {
        let mut state = self.state();
        state
            .projects
            .entry(project_id.to_string())
            .and_modify(|p| p.access_key = access_key.to_string())
            .or_insert_with(|| Project::new(access_key));
        debug!(project = %project_id, "Project provisioned");
    }

    pub fn is_provisioned(&self, project_id: &str) -> bool {
        self.state().projects.contains_key(project_id)
    }

    /// Simulates losing (or regaining) the network.
    pub fn set_offline(&self, offline: bool) {
        self.state().offline = offline;
    }

    /// Makes the next `count` writes fail with `kind`. A count of zero
    /// clears pending failures.
    pub fn fail_next_writes(&self, count: u32, kind: ConnectionFailureKind) {
        self.state().fault = Some(Fault {
            remaining: count,
            kind,
        });
    }

    /// Writes a document as another device would, notifying every feed.
    pub fn put_document(
        &self,
        project_id: &str,
        collection: Collection,
        record: Record,
    ) -> SyncResult<()> {
        let mut state = self.state();
        let project = state
            .projects
            .get_mut(project_id)
            .ok_or_else(|| RemoteError::not_provisioned(project_id.to_string()))?;
        if let Some(change) = project.merge_write(collection.as_str(), &record)? {
            project.broadcast(collection.as_str(), change);
        }
        Ok(())
    }

    /// Deletes a document as another device would.
    pub fn remove_document(&self, project_id: &str, collection: Collection, id: &str) -> bool {
        let mut state = self.state();
        let Some(project) = state.projects.get_mut(project_id) else {
            return false;
        };
        match project.remove(collection.as_str(), id) {
            Some(change) => {
                project.broadcast(collection.as_str(), change);
                true
            }
            None => false,
        }
    }

    /// Delivers a hand-built batch to every feed on `batch.collection`.
    ///
    /// ## Returns
    /// How many feeds received it.
    pub fn deliver(&self, project_id: &str, batch: ChangeBatch) -> usize {
        let mut state = self.state();
        let Some(project) = state.projects.get_mut(project_id) else {
            return 0;
        };
        let mut delivered = 0;
        project.feeds.retain(|feed| {
            if feed.collection != batch.collection {
                return true;
            }
            let alive = feed.sender.send(batch.clone()).is_ok();
            if alive {
                delivered += 1;
            }
            alive
        });
        delivered
    }

    /// Returns the documents of a collection, in write order.
    pub fn documents(&self, project_id: &str, collection: &str) -> Vec<Record> {
        self.state()
            .projects
            .get(project_id)
            .map(|p| p.documents(collection))
            .unwrap_or_default()
    }

    pub fn document(&self, project_id: &str, collection: &str, id: &str) -> Option<Record> {
        self.state()
            .projects
            .get(project_id)
            .and_then(|p| p.collections.get(collection))
            .and_then(|set| set.get(id).cloned())
    }

    /// Number of live change feeds on a project.
    pub fn active_feeds(&self, project_id: &str) -> usize {
        self.state()
            .projects
            .get(project_id)
            .map(|p| p.feeds.iter().filter(|f| !f.sender.is_closed()).count())
            .unwrap_or(0)
    }

    pub fn offline_cache_held(&self, project_id: &str) -> bool {
        self.state()
            .projects
            .get(project_id)
            .is_some_and(|p| p.cache_holder.is_some())
    }

    // =========================================================================
    // Instrumentation
    // =========================================================================

    /// Sessions opened so far.
    pub fn open_count(&self) -> usize {
        self.inner.opens.load(Ordering::SeqCst)
    }

    /// Writes (merges and deletes) that reached the store, failed or not.
    pub fn write_count(&self) -> usize {
        self.inner.writes.load(Ordering::SeqCst)
    }

    /// Sessions terminated so far.
    pub fn terminate_count(&self) -> usize {
        self.inner.terminations.load(Ordering::SeqCst)
    }

    // =========================================================================
    // Internals
    // =========================================================================

    fn remove_feed(&self, project_id: &str, feed_id: u64) {
        if let Some(project) = self.state().projects.get_mut(project_id) {
            project.feeds.retain(|f| f.id != feed_id);
            trace!(project = %project_id, feed = feed_id, "Feed closed");
        }
    }
}

impl std::fmt::Debug for MemoryRemote {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryRemote")
            .field("opens", &self.open_count())
            .field("writes", &self.write_count())
            .finish_non_exhaustive()
    }
}

/// Checks reachability and access, returning the project.
fn authorize<'a>(
    state: &'a mut RemoteState,
    project_id: &str,
    access_key: &str,
) -> Result<&'a mut Project, RemoteError> {
    if state.offline {
        return Err(RemoteError::network("remote store unreachable"));
    }
    let project = state
        .projects
        .get_mut(project_id)
        .ok_or_else(|| RemoteError::not_provisioned(format!("project {} has no store", project_id)))?;
    if project.access_key != access_key {
        return Err(RemoteError::permission_denied("access key rejected"));
    }
    Ok(project)
}

/// Consumes one injected write failure, if any are pending.
fn take_fault(state: &mut RemoteState) -> Option<RemoteError> {
    let fault = state.fault.as_mut()?;
    if fault.remaining == 0 {
        state.fault = None;
        return None;
    }
    let kind = fault.kind;
    fault.remaining = fault.remaining.saturating_sub(1);
    if fault.remaining == 0 {
        state.fault = None;
    }
    Some(RemoteError::new(kind, "injected write failure"))
}

#[async_trait]
impl RemoteConnector for MemoryRemote {
    async fn open(
        &self,
        credentials: &Credentials,
        session_name: &str,
    ) -> SyncResult<Box<dyn RemoteSession>> {
        self.inner.opens.fetch_add(1, Ordering::SeqCst);

        let key = credentials.api_key.trim();
        if key.is_empty() || key.chars().any(char::is_whitespace) {
            return Err(RemoteError::malformed("access key is not well formed").into());
        }

        let session = MemorySession {
            remote: self.clone(),
            id: self.next_id(),
            name: session_name.to_string(),
            project_id: credentials.project_id.trim().to_string(),
            access_key: key.to_string(),
            terminated: AtomicBool::new(false),
        };
        debug!(session = %session_name, project = %session.project_id, "Memory session opened");
        Ok(Box::new(session))
    }
}

// =============================================================================
// MemorySession
// =============================================================================

/// A session on a [`MemoryRemote`].
pub struct MemorySession {
    remote: MemoryRemote,
    id: u64,
    name: String,
    project_id: String,
    access_key: String,
    terminated: AtomicBool,
}

impl MemorySession {
    fn ensure_open(&self) -> SyncResult<()> {
        if self.terminated.load(Ordering::SeqCst) {
            return Err(SyncError::SessionClosed);
        }
        Ok(())
    }
}

#[async_trait]
impl RemoteSession for MemorySession {
    fn name(&self) -> &str {
        &self.name
    }

    async fn enable_offline_cache(&self) -> SyncResult<()> {
        self.ensure_open()?;
        let mut state = self.remote.state();
        let project = authorize(&mut state, &self.project_id, &self.access_key)?;
        match project.cache_holder {
            Some(holder) if holder != self.id => Err(RemoteError::new(
                ConnectionFailureKind::Unknown,
                "offline cache already in use by another session",
            )
            .into()),
            _ => {
                project.cache_holder = Some(self.id);
                Ok(())
            }
        }
    }

    async fn set_merge(&self, collection: &str, record: &Record) -> SyncResult<()> {
        self.ensure_open()?;
        self.remote.inner.writes.fetch_add(1, Ordering::SeqCst);

        let mut state = self.remote.state();
        if let Some(err) = take_fault(&mut state) {
            return Err(err.into());
        }
        let project = authorize(&mut state, &self.project_id, &self.access_key)?;
        if let Some(change) = project.merge_write(collection, record)? {
            project.broadcast(collection, change);
        }
        Ok(())
    }

    async fn delete(&self, collection: &str, id: &str) -> SyncResult<()> {
        self.ensure_open()?;
        self.remote.inner.writes.fetch_add(1, Ordering::SeqCst);

        let mut state = self.remote.state();
        if let Some(err) = take_fault(&mut state) {
            return Err(err.into());
        }
        let project = authorize(&mut state, &self.project_id, &self.access_key)?;
        if let Some(change) = project.remove(collection, id) {
            project.broadcast(collection, change);
        }
        Ok(())
    }

    async fn subscribe(&self, collection: Collection) -> SyncResult<Subscription> {
        self.ensure_open()?;
        let (sender, receiver) = mpsc::unbounded_channel();
        let feed_id = self.remote.next_id();

        {
            let mut state = self.remote.state();
            let offline = state.offline;
            let cached = state
                .projects
                .get(&self.project_id)
                .is_some_and(|p| p.cache_holder == Some(self.id));

            // Offline with the cache enabled: the feed attaches and reports an
            // empty cached view until the network returns.
            let project = if offline && cached {
                let _ = sender.send(ChangeBatch {
                    from_cache: true,
                    ..ChangeBatch::new(collection)
                });
                state.projects.get_mut(&self.project_id)
            } else {
                let project = authorize(&mut state, &self.project_id, &self.access_key)?;
                let documents = project.documents(collection.as_str());
                let _ = sender.send(ChangeBatch {
                    collection,
                    changes: documents
                        .iter()
                        .cloned()
                        .map(|record| RemoteChange::Added { record })
                        .collect(),
                    documents,
                    from_cache: false,
                });
                Some(project)
            };

            if let Some(project) = project {
                project.feeds.push(Feed {
                    id: feed_id,
                    session: self.id,
                    collection,
                    sender,
                });
            }
        }

        let remote = self.remote.clone();
        let project_id = self.project_id.clone();
        Ok(Subscription::new(collection, receiver, move || {
            remote.remove_feed(&project_id, feed_id)
        }))
    }

    async fn terminate(&self) -> SyncResult<()> {
        if self.terminated.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.remote.inner.terminations.fetch_add(1, Ordering::SeqCst);

        let mut state = self.remote.state();
        if let Some(project) = state.projects.get_mut(&self.project_id) {
            project.feeds.retain(|f| f.session != self.id);
            if project.cache_holder == Some(self.id) {
                project.cache_holder = None;
            }
        }
        debug!(session = %self.name, "Memory session terminated");
        Ok(())
    }
}

impl Drop for MemorySession {
    fn drop(&mut self) {
        if self.terminated.load(Ordering::SeqCst) {
            return;
        }
        let mut state = self.remote.state();
        if let Some(project) = state.projects.get_mut(&self.project_id) {
            project.feeds.retain(|f| f.session != self.id);
            if project.cache_holder == Some(self.id) {
                project.cache_holder = None;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn record(value: Value) -> Record {
        Record::from_value(value).unwrap()
    }

    fn remote() -> (MemoryRemote, Credentials) {
        let remote = MemoryRemote::new();
        remote.provision("barsa-test", "key-1");
        (remote, Credentials::new("key-1", "barsa-test"))
    }

    #[tokio::test]
    async fn test_set_merge_keeps_remote_only_fields() {
        let (remote, creds) = remote();
        remote
            .put_document(
                "barsa-test",
                Collection::Orders,
                record(json!({"id": "o-1", "client": "Ana", "printed": true})),
            )
            .unwrap();

        let session = remote.open(&creds, "s").await.unwrap();
        session
            .set_merge("orders", &record(json!({"id": "o-1", "client": "Beto"})))
            .await
            .unwrap();

        let stored = remote.document("barsa-test", "orders", "o-1").unwrap();
        assert_eq!(stored.get("client"), Some(&json!("Beto")));
        assert_eq!(stored.get("printed"), Some(&json!(true)));
        assert_eq!(remote.write_count(), 1);
    }

    #[tokio::test]
    async fn test_access_is_classified() {
        let (remote, _) = remote();

        let wrong_key = remote
            .open(&Credentials::new("other", "barsa-test"), "s")
            .await
            .unwrap();
        let err = wrong_key.set_merge("orders", &Record::new("o-1").unwrap()).await.unwrap_err();
        assert_eq!(err.failure_kind(), ConnectionFailureKind::PermissionDenied);

        let missing = remote
            .open(&Credentials::new("key-1", "nowhere"), "s")
            .await
            .unwrap();
        let err = missing.subscribe(Collection::Users).await.unwrap_err();
        assert_eq!(err.failure_kind(), ConnectionFailureKind::NotProvisioned);

        let err = remote
            .open(&Credentials::new("bad key", "barsa-test"), "s")
            .await
            .err()
            .unwrap();
        assert_eq!(err.failure_kind(), ConnectionFailureKind::MalformedCredentials);
    }

    #[tokio::test]
    async fn test_subscription_gets_snapshot_then_deltas() {
        let (remote, creds) = remote();
        remote
            .put_document("barsa-test", Collection::Batches, Record::new("b-1").unwrap())
            .unwrap();

        let session = remote.open(&creds, "s").await.unwrap();
        let mut sub = session.subscribe(Collection::Batches).await.unwrap();

        let first = sub.next().await.unwrap();
        assert_eq!(first.changes.len(), 1);
        assert!(!first.from_cache);

        remote.remove_document("barsa-test", Collection::Batches, "b-1");
        let second = sub.next().await.unwrap();
        assert_eq!(second.changes, vec![RemoteChange::Removed { id: "b-1".into() }]);
        assert!(second.documents.is_empty());

        assert_eq!(remote.active_feeds("barsa-test"), 1);
        drop(sub);
        assert_eq!(remote.active_feeds("barsa-test"), 0);
    }

    #[tokio::test]
    async fn test_offline_cache_single_holder() {
        let (remote, creds) = remote();
        let first = remote.open(&creds, "a").await.unwrap();
        let second = remote.open(&creds, "b").await.unwrap();

        first.enable_offline_cache().await.unwrap();
        assert!(second.enable_offline_cache().await.is_err());

        first.terminate().await.unwrap();
        assert!(!remote.offline_cache_held("barsa-test"));
        second.enable_offline_cache().await.unwrap();
    }

    #[tokio::test]
    async fn test_terminate_ends_feeds() {
        let (remote, creds) = remote();
        let session = remote.open(&creds, "s").await.unwrap();
        let mut sub = session.subscribe(Collection::Orders).await.unwrap();
        assert!(sub.next().await.is_some());

        session.terminate().await.unwrap();
        assert!(sub.next().await.is_none());
        assert!(matches!(
            session.delete("orders", "o-1").await,
            Err(SyncError::SessionClosed)
        ));
        assert_eq!(remote.terminate_count(), 1);
    }

    #[tokio::test]
    async fn test_injected_faults_run_out() {
        let (remote, creds) = remote();
        let session = remote.open(&creds, "s").await.unwrap();
        remote.fail_next_writes(2, ConnectionFailureKind::NetworkUnavailable);

        let r = Record::new("o-1").unwrap();
        assert!(session.set_merge("orders", &r).await.is_err());
        assert!(session.set_merge("orders", &r).await.is_err());
        assert!(session.set_merge("orders", &r).await.is_ok());
        assert_eq!(remote.write_count(), 3);
    }
}

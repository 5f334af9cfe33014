//! # Sync Session Manager
//!
//! Owns the one live [`SyncSession`] and drives the connection state
//! machine.
//!
//! ## State Machine
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                      SyncSessionManager                                 │
//! │                                                                         │
//! │   ┌──────────────┐  connect(creds)   ┌──────────────┐                  │
//! │   │ Disconnected │ ────────────────► │  Connecting  │                  │
//! │   └──────────────┘                   └──────┬───────┘                  │
//! │          ▲   ▲                              │                          │
//! │          │   │ open / subscribe failed      │ session open,            │
//! │          │   └──────────────────────────────┤ cache enabled (or not),  │
//! │          │                                  │ 4 listeners attached     │
//! │          │ disconnect() / apply(None)       ▼                          │
//! │          │                           ┌──────────────┐                  │
//! │          └────────────────────────── │    Active    │                  │
//! │                                      └──────┬───────┘                  │
//! │                                             │ after bootstrap_delay    │
//! │                                             ▼                          │
//! │                               bootstrap upload ─► dead-letter replay   │
//! │                                                                         │
//! │  Every connect() first tears down the previous session: listeners      │
//! │  stopped, mirror stopped, remote terminated. Two sessions never        │
//! │  overlap on the same collection.                                       │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Status Events
//! ```text
//! SyncEventEmitter::emit_status     every state change and after bootstrap
//! SyncEventEmitter::emit_bootstrap  bootstrap upload finished
//! SyncEventEmitter::emit_error      connect failed (with its failure kind)
//! ```

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use barsa_core::validation::validate_credentials;
use barsa_core::{Collection, Credentials};
use barsa_db::LocalStore;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};
use ts_rs::TS;

use crate::config::SyncSettings;
use crate::error::{ConnectionFailureKind, SyncError, SyncResult};
use crate::listener::{ChangeListener, ListenerHandle};
use crate::remote::{RemoteConnector, SharedSession};
use crate::upload::{BootstrapReport, MirrorHandle, UploadPropagator};

/// Name of the long-lived session.
pub const PRIMARY_SESSION_NAME: &str = "primary";

// =============================================================================
// Session State & Status
// =============================================================================

/// Connection state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, TS)]
#[serde(rename_all = "lowercase")]
#[ts(export)]
pub enum SessionState {
    /// Local-only mode.
    #[default]
    Disconnected,
    Connecting,
    /// Listeners attached, mutations mirrored.
    Active,
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionState::Disconnected => write!(f, "disconnected"),
            SessionState::Connecting => write!(f, "connecting"),
            SessionState::Active => write!(f, "active"),
        }
    }
}

/// Current sync status for external queries.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, TS)]
#[serde(rename_all = "camelCase")]
#[ts(export)]
pub struct SyncStatus {
    pub state: SessionState,

    /// Whether a session is Active.
    pub is_connected: bool,

    /// Project of the current (or connecting) session.
    pub project_id: Option<String>,

    pub session_name: Option<String>,

    /// Last completed bootstrap (RFC 3339).
    pub last_sync: Option<String>,

    /// Last connect error (if any).
    pub last_error: Option<String>,

    pub failure_kind: Option<ConnectionFailureKind>,

    /// Mirror writes waiting in the dead-letter table, as of the last
    /// bootstrap.
    pub pending_dead_letters: i64,
}

// =============================================================================
// Event Emitter Trait
// =============================================================================

/// Receives sync status changes (e.g. to refresh a status indicator).
pub trait SyncEventEmitter: Send + Sync {
    fn emit_status(&self, status: &SyncStatus);

    fn emit_bootstrap(&self, report: &BootstrapReport);

    fn emit_error(&self, message: &str, kind: ConnectionFailureKind);
}

/// No-op event emitter for testing.
pub struct NoOpEmitter;

impl SyncEventEmitter for NoOpEmitter {
    fn emit_status(&self, _status: &SyncStatus) {}
    fn emit_bootstrap(&self, _report: &BootstrapReport) {}
    fn emit_error(&self, _message: &str, _kind: ConnectionFailureKind) {}
}

// =============================================================================
// Sync Session
// =============================================================================

/// A live remote connection and everything attached to it.
pub struct SyncSession {
    generation: u64,
    remote: SharedSession,
    listeners: Vec<ListenerHandle>,
    mirror: Option<MirrorHandle>,
    bootstrap: Option<JoinHandle<()>>,
}

impl SyncSession {
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn remote(&self) -> &SharedSession {
        &self.remote
    }

    pub fn listeners(&self) -> &[ListenerHandle] {
        &self.listeners
    }

    pub fn mirror(&self) -> Option<&MirrorHandle> {
        self.mirror.as_ref()
    }

    /// Stops listeners and the mirror, cancels a pending bootstrap and
    /// terminates the remote session.
    async fn teardown(mut self) {
        if let Some(bootstrap) = self.bootstrap.take() {
            bootstrap.abort();
        }
        if let Some(mirror) = self.mirror.take() {
            mirror.stop().await;
        }
        for listener in self.listeners.drain(..) {
            listener.stop().await;
        }
        if let Err(e) = self.remote.terminate().await {
            warn!(generation = self.generation, ?e, "Failed to terminate session");
        }
        debug!(generation = self.generation, "Session torn down");
    }
}

// =============================================================================
// Sync Session Manager
// =============================================================================

/// Drives connect and disconnect transitions.
pub struct SyncSessionManager {
    store: LocalStore,

    connector: Arc<dyn RemoteConnector>,

    settings: SyncSettings,

    /// Event emitter for status notifications.
    emitter: Arc<dyn SyncEventEmitter>,

    /// The live session. Held across whole transitions so they never
    /// interleave.
    session: Mutex<Option<SyncSession>>,

    status: Arc<RwLock<SyncStatus>>,

    /// Bumped on every transition; a deferred bootstrap whose generation is
    /// stale does nothing.
    generation: Arc<AtomicU64>,

    shut_down: AtomicBool,
}

impl SyncSessionManager {
    /// Creates a manager in the Disconnected state.
    pub fn new(store: LocalStore, connector: Arc<dyn RemoteConnector>, settings: SyncSettings) -> Self {
        Self::with_emitter(store, connector, settings, Arc::new(NoOpEmitter))
    }

    /// Creates a manager with a custom event emitter.
    pub fn with_emitter(
        store: LocalStore,
        connector: Arc<dyn RemoteConnector>,
        settings: SyncSettings,
        emitter: Arc<dyn SyncEventEmitter>,
    ) -> Self {
        SyncSessionManager {
            store,
            connector,
            settings,
            emitter,
            session: Mutex::new(None),
            status: Arc::new(RwLock::new(SyncStatus::default())),
            generation: Arc::new(AtomicU64::new(0)),
            shut_down: AtomicBool::new(false),
        }
    }

    pub fn store(&self) -> &LocalStore {
        &self.store
    }

    pub fn settings(&self) -> &SyncSettings {
        &self.settings
    }

    /// Returns the current sync status.
    pub async fn status(&self) -> SyncStatus {
        self.status.read().await.clone()
    }

    pub async fn state(&self) -> SessionState {
        self.status.read().await.state
    }

    pub async fn is_active(&self) -> bool {
        self.state().await == SessionState::Active
    }

    /// Generation of the live session, if any.
    pub async fn session_generation(&self) -> Option<u64> {
        self.session.lock().await.as_ref().map(SyncSession::generation)
    }

    /// Number of listeners attached to the live session.
    pub async fn listener_count(&self) -> usize {
        self.session
            .lock()
            .await
            .as_ref()
            .map_or(0, |s| s.listeners().len())
    }

    /// Mirror writes waiting in the dead-letter table.
    pub async fn pending_dead_letters(&self) -> SyncResult<i64> {
        Ok(self.store.database().dead_letters().count_pending().await?)
    }

    // =========================================================================
    // Transitions
    // =========================================================================

    /// Connects with `credentials`, replacing any live session.
    ///
    /// On failure the manager is left Disconnected and nothing retries
    /// automatically.
    pub async fn connect(&self, credentials: &Credentials) -> SyncResult<()> {
        if self.shut_down.load(Ordering::SeqCst) {
            return Err(SyncError::ShuttingDown);
        }

        let mut slot = self.session.lock().await;

        if let Some(previous) = slot.take() {
            info!(generation = previous.generation(), "Replacing sync session");
            previous.teardown().await;
        }
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;

        let credentials = credentials.normalized();
        info!(project = %credentials.project_id, generation, "Connecting sync session");
        self.update_status(|s| {
            s.state = SessionState::Connecting;
            s.is_connected = false;
            s.project_id = Some(credentials.project_id.clone());
            s.session_name = Some(PRIMARY_SESSION_NAME.to_string());
        })
        .await;

        match self.open_session(&credentials, generation).await {
            Ok(session) => {
                *slot = Some(session);
                self.update_status(|s| {
                    s.state = SessionState::Active;
                    s.is_connected = true;
                    s.last_error = None;
                    s.failure_kind = None;
                })
                .await;
                info!(project = %credentials.project_id, generation, "Sync session active");
                Ok(())
            }
            Err(e) => {
                let kind = e.failure_kind();
                warn!(project = %credentials.project_id, %kind, error = %e, "Sync session failed to connect");
                self.update_status(|s| {
                    s.state = SessionState::Disconnected;
                    s.is_connected = false;
                    s.project_id = None;
                    s.session_name = None;
                    s.last_error = Some(e.to_string());
                    s.failure_kind = Some(kind);
                })
                .await;
                self.emitter.emit_error(&e.to_string(), kind);
                Err(e)
            }
        }
    }

    /// Tears down the live session, if any. The LocalStore stays fully
    /// usable.
    pub async fn disconnect(&self) {
        let mut slot = self.session.lock().await;
        self.generation.fetch_add(1, Ordering::SeqCst);

        if let Some(session) = slot.take() {
            info!(generation = session.generation(), "Disconnecting sync session");
            session.teardown().await;
        }

        let changed = self.status.read().await.state != SessionState::Disconnected;
        if changed {
            self.update_status(|s| {
                s.state = SessionState::Disconnected;
                s.is_connected = false;
                s.project_id = None;
                s.session_name = None;
            })
            .await;
        }
    }

    /// Connects if `credentials` carries the required fields, otherwise
    /// disconnects.
    pub async fn apply(&self, credentials: Option<&Credentials>) -> SyncResult<SessionState> {
        match credentials.filter(|c| c.is_complete()) {
            Some(credentials) => self.connect(credentials).await?,
            None => {
                debug!("No usable credentials, running local-only");
                self.disconnect().await;
            }
        }
        Ok(self.state().await)
    }

    /// Disconnects and refuses further connects.
    pub async fn shutdown(&self) {
        info!("Shutting down sync session manager");
        self.shut_down.store(true, Ordering::SeqCst);
        self.disconnect().await;
    }

    // =========================================================================
    // Internals
    // =========================================================================

    async fn open_session(&self, credentials: &Credentials, generation: u64) -> SyncResult<SyncSession> {
        validate_credentials(credentials)?;

        let connect_timeout = self.settings.connect_timeout();
        let remote: SharedSession = match timeout(
            connect_timeout,
            self.connector.open(credentials, PRIMARY_SESSION_NAME),
        )
        .await
        {
            Ok(session) => Arc::from(session?),
            Err(_) => return Err(SyncError::Timeout(connect_timeout.as_secs())),
        };

        if let Err(e) = remote.enable_offline_cache().await {
            warn!(error = %e, "Offline cache unavailable, continuing without it");
        }

        let mut listeners = Vec::with_capacity(Collection::ALL.len());
        for collection in Collection::ALL {
            match ChangeListener::start(&remote, self.store.clone(), collection).await {
                Ok(listener) => listeners.push(listener),
                Err(e) => {
                    error!(collection = %collection, error = %e, "Failed to attach listener");
                    for listener in listeners {
                        listener.stop().await;
                    }
                    if let Err(e) = remote.terminate().await {
                        warn!(?e, "Failed to terminate session");
                    }
                    return Err(e);
                }
            }
        }

        let propagator = UploadPropagator::new(&self.settings);
        let mirror = propagator.spawn_mirror(remote.clone(), self.store.clone());
        let bootstrap = self.schedule_bootstrap(generation, remote.clone(), propagator);

        Ok(SyncSession {
            generation,
            remote,
            listeners,
            mirror: Some(mirror),
            bootstrap: Some(bootstrap),
        })
    }

    /// Runs the bootstrap upload and dead-letter replay after the
    /// configured delay, unless the session has been superseded.
    fn schedule_bootstrap(
        &self,
        generation: u64,
        remote: SharedSession,
        propagator: UploadPropagator,
    ) -> JoinHandle<()> {
        let delay = self.settings.bootstrap_delay();
        let current = self.generation.clone();
        let store = self.store.clone();
        let status = self.status.clone();
        let emitter = self.emitter.clone();

        tokio::spawn(async move {
            tokio::time::sleep(delay).await;

            let is_current = || current.load(Ordering::SeqCst) == generation;
            if !is_current() {
                debug!(generation, "Skipping bootstrap for superseded session");
                return;
            }

            match propagator.bootstrap(&remote, &store).await {
                Ok(report) => emitter.emit_bootstrap(&report),
                Err(e) => warn!(error = %e, "Bootstrap upload failed"),
            }

            if !is_current() {
                return;
            }
            if let Err(e) = propagator.replay_dead_letters(&remote, &store).await {
                warn!(error = %e, "Dead-letter replay failed");
            }

            let pending = match store.database().dead_letters().count_pending().await {
                Ok(pending) => pending,
                Err(e) => {
                    warn!(error = %e, "Failed to count dead letters");
                    0
                }
            };

            let snapshot = {
                let mut s = status.write().await;
                if !is_current() || s.state != SessionState::Active {
                    return;
                }
                s.last_sync = Some(Utc::now().to_rfc3339());
                s.pending_dead_letters = pending;
                s.clone()
            };
            emitter.emit_status(&snapshot);
        })
    }

    async fn update_status(&self, f: impl FnOnce(&mut SyncStatus)) {
        let snapshot = {
            let mut s = self.status.write().await;
            f(&mut s);
            s.clone()
        };
        self.emitter.emit_status(&snapshot);
    }
}

// =============================================================================
// Builder Pattern
// =============================================================================

/// Builder for creating a SyncSessionManager with options.
pub struct SyncSessionManagerBuilder {
    store: Option<LocalStore>,
    connector: Option<Arc<dyn RemoteConnector>>,
    settings: SyncSettings,
    emitter: Option<Arc<dyn SyncEventEmitter>>,
}

impl SyncSessionManagerBuilder {
    pub fn new() -> Self {
        SyncSessionManagerBuilder {
            store: None,
            connector: None,
            settings: SyncSettings::default(),
            emitter: None,
        }
    }

    pub fn with_store(mut self, store: LocalStore) -> Self {
        self.store = Some(store);
        self
    }

    pub fn with_connector(mut self, connector: Arc<dyn RemoteConnector>) -> Self {
        self.connector = Some(connector);
        self
    }

    pub fn with_settings(mut self, settings: SyncSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn with_emitter(mut self, emitter: Arc<dyn SyncEventEmitter>) -> Self {
        self.emitter = Some(emitter);
        self
    }

    /// Builds the SyncSessionManager.
    pub fn build(self) -> SyncResult<SyncSessionManager> {
        let store = self
            .store
            .ok_or_else(|| SyncError::InvalidConfig("LocalStore required".into()))?;
        let connector = self
            .connector
            .ok_or_else(|| SyncError::InvalidConfig("Remote connector required".into()))?;
        let emitter = self.emitter.unwrap_or_else(|| Arc::new(NoOpEmitter));

        Ok(SyncSessionManager::with_emitter(
            store,
            connector,
            self.settings,
            emitter,
        ))
    }
}

impl Default for SyncSessionManagerBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::MemoryRemote;
    use std::sync::Mutex as StdMutex;

    #[derive(Default)]
    struct RecordingEmitter {
        states: StdMutex<Vec<SessionState>>,
        errors: StdMutex<Vec<ConnectionFailureKind>>,
    }

    impl SyncEventEmitter for RecordingEmitter {
        fn emit_status(&self, status: &SyncStatus) {
            self.states.lock().unwrap().push(status.state);
        }
        fn emit_bootstrap(&self, _report: &BootstrapReport) {}
        fn emit_error(&self, _message: &str, kind: ConnectionFailureKind) {
            self.errors.lock().unwrap().push(kind);
        }
    }

    async fn manager(remote: &MemoryRemote, emitter: Arc<RecordingEmitter>) -> SyncSessionManager {
        SyncSessionManagerBuilder::new()
            .with_store(LocalStore::in_memory().await.unwrap())
            .with_connector(Arc::new(remote.clone()))
            .with_emitter(emitter)
            .build()
            .unwrap()
    }

    #[test]
    fn test_sync_status_default() {
        let status = SyncStatus::default();
        assert_eq!(status.state, SessionState::Disconnected);
        assert!(!status.is_connected);
        assert_eq!(status.pending_dead_letters, 0);
    }

    #[test]
    fn test_builder_requires_store() {
        assert!(matches!(
            SyncSessionManagerBuilder::new().build(),
            Err(SyncError::InvalidConfig(_))
        ));
    }

    #[tokio::test]
    async fn test_connect_reports_transitions() {
        let remote = MemoryRemote::new();
        remote.provision("barsa-test", "key-1");
        let emitter = Arc::new(RecordingEmitter::default());
        let manager = manager(&remote, emitter.clone()).await;

        manager
            .connect(&Credentials::new("key-1", "barsa-test"))
            .await
            .unwrap();

        assert_eq!(manager.state().await, SessionState::Active);
        assert_eq!(manager.listener_count().await, 4);
        assert_eq!(
            *emitter.states.lock().unwrap(),
            vec![SessionState::Connecting, SessionState::Active]
        );

        manager.disconnect().await;
        assert_eq!(manager.state().await, SessionState::Disconnected);
        assert_eq!(manager.listener_count().await, 0);
        assert_eq!(remote.active_feeds("barsa-test"), 0);
    }

    #[tokio::test]
    async fn test_failed_connect_reverts_to_disconnected() {
        let remote = MemoryRemote::new();
        remote.provision("barsa-test", "key-1");
        let emitter = Arc::new(RecordingEmitter::default());
        let manager = manager(&remote, emitter.clone()).await;

        let err = manager
            .connect(&Credentials::new("wrong", "barsa-test"))
            .await
            .unwrap_err();
        assert_eq!(err.failure_kind(), ConnectionFailureKind::PermissionDenied);

        let status = manager.status().await;
        assert_eq!(status.state, SessionState::Disconnected);
        assert_eq!(status.project_id, None);
        assert_eq!(status.session_name, None);
        assert_eq!(status.failure_kind, Some(ConnectionFailureKind::PermissionDenied));
        assert_eq!(
            *emitter.errors.lock().unwrap(),
            vec![ConnectionFailureKind::PermissionDenied]
        );
        assert_eq!(remote.terminate_count(), 1);
    }

    #[tokio::test]
    async fn test_apply_without_credentials_stays_local() {
        let remote = MemoryRemote::new();
        let manager = manager(&remote, Arc::new(RecordingEmitter::default())).await;

        let state = manager.apply(None).await.unwrap();
        assert_eq!(state, SessionState::Disconnected);

        let state = manager
            .apply(Some(&Credentials::new("", "barsa-test")))
            .await
            .unwrap();
        assert_eq!(state, SessionState::Disconnected);
        assert_eq!(remote.open_count(), 0);
    }

    #[tokio::test]
    async fn test_shutdown_refuses_connect() {
        let remote = MemoryRemote::new();
        remote.provision("barsa-test", "key-1");
        let manager = manager(&remote, Arc::new(RecordingEmitter::default())).await;

        manager.shutdown().await;
        assert!(matches!(
            manager.connect(&Credentials::new("key-1", "barsa-test")).await,
            Err(SyncError::ShuttingDown)
        ));
    }
}

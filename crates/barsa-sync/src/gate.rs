//! # Config Gate
//!
//! Holds the persisted sync configuration and turns credential changes
//! into session transitions.
//!
//! ```text
//!   sync.toml ──load──► ConfigGate ──start()──► manager.apply(credentials)
//!                           │
//!        save(config) ──────┤ validate → write sync.toml → swap in memory
//!                           │
//!                           └──────────────► manager.apply(credentials)
//!                                             complete?  connect
//!                                             otherwise  disconnect
//! ```
//!
//! No credentials is a normal steady state: the LocalStore works the same
//! way, nothing is mirrored. Sync tuning (`[sync]`) is read by the session
//! manager at construction and takes effect on the next process start.
//!
//! The gate keeps the file layer and the `BARSA_*` environment layer apart:
//! credentials are worked out from both, but only the file layer is ever
//! written back. An unreadable `sync.toml` is logged and treated as empty.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use barsa_core::Credentials;
use tokio::sync::RwLock;
use tracing::{info, warn};

use crate::config::{env_var, SyncConfig};
use crate::error::SyncResult;
use crate::session::{SessionState, SyncSessionManager};

/// Persisted configuration plus the session manager it drives.
pub struct ConfigGate {
    path: PathBuf,
    /// What `sync.toml` holds, without environment overrides.
    file: RwLock<SyncConfig>,
    env: fn(&str) -> Option<String>,
    manager: Arc<SyncSessionManager>,
}

impl ConfigGate {
    /// Loads the configuration at `path`.
    ///
    /// A missing, unparsable or invalid file yields the defaults
    /// (local-only); the next [`save`](Self::save) replaces it.
    pub fn open(path: impl Into<PathBuf>, manager: Arc<SyncSessionManager>) -> Self {
        let path = path.into();
        let config = SyncConfig::load_file(Some(path.clone())).unwrap_or_else(|e| {
            warn!(?path, error = %e, "Unreadable sync config, starting local-only");
            SyncConfig::default()
        });
        Self::with_config(path, config, manager)
    }

    /// Creates a gate around an already-loaded file configuration.
    pub fn with_config(
        path: impl Into<PathBuf>,
        config: SyncConfig,
        manager: Arc<SyncSessionManager>,
    ) -> Self {
        ConfigGate {
            path: path.into(),
            file: RwLock::new(config),
            env: env_var,
            manager,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn manager(&self) -> &Arc<SyncSessionManager> {
        &self.manager
    }

    /// Returns the effective configuration: the file layer with the
    /// environment overrides applied.
    pub async fn config(&self) -> SyncConfig {
        self.effective(&*self.file.read().await)
    }

    /// Returns the configuration as stored in `sync.toml`.
    pub async fn file_config(&self) -> SyncConfig {
        self.file.read().await.clone()
    }

    /// Returns the effective credentials, if complete.
    pub async fn credentials(&self) -> Option<Credentials> {
        self.config().await.usable_credentials()
    }

    /// True if the configuration switches the app into synchronised mode.
    pub async fn is_connected_mode(&self) -> bool {
        self.config().await.is_sync_enabled()
    }

    /// Connects if the loaded configuration carries usable credentials.
    ///
    /// Connect failures are logged; the app keeps running local-only.
    pub async fn start(&self) -> SessionState {
        let credentials = self.credentials().await;
        if credentials.is_none() {
            info!("No remote credentials configured, running local-only");
        }
        self.apply(credentials).await
    }

    /// Validates and persists `config` as the file layer, then connects or
    /// disconnects to match the effective credentials.
    ///
    /// ## Errors
    /// Only validation and write failures. A failed connect leaves the
    /// saved configuration in place and the manager Disconnected.
    pub async fn save(&self, config: SyncConfig) -> SyncResult<SessionState> {
        config.validate()?;
        config.save(Some(self.path.clone()))?;

        let credentials = self.effective(&config).usable_credentials();
        *self.file.write().await = config;

        Ok(self.apply(credentials).await)
    }

    /// Replaces only the stored credentials and saves.
    pub async fn set_credentials(&self, credentials: Option<Credentials>) -> SyncResult<SessionState> {
        let mut config = self.file_config().await;
        config.remote = credentials;
        self.save(config).await
    }

    fn effective(&self, file: &SyncConfig) -> SyncConfig {
        let effective = file.with_overrides_from(self.env);
        match effective.validate() {
            Ok(()) => effective,
            Err(e) => {
                warn!(error = %e, "Ignoring invalid environment overrides");
                file.clone()
            }
        }
    }

    async fn apply(&self, credentials: Option<Credentials>) -> SessionState {
        match self.manager.apply(credentials.as_ref()).await {
            Ok(state) => state,
            Err(e) => {
                warn!(error = %e, kind = %e.failure_kind(), "Remote sync unavailable, running local-only");
                self.manager.state().await
            }
        }
    }

    #[cfg(test)]
    fn with_env(mut self, lookup: fn(&str) -> Option<String>) -> Self {
        self.env = lookup;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SyncSettings;
    use crate::remote::MemoryRemote;
    use barsa_db::LocalStore;
    use tempfile::TempDir;

    async fn manager(remote: &MemoryRemote) -> Arc<SyncSessionManager> {
        let store = LocalStore::in_memory().await.unwrap();
        Arc::new(SyncSessionManager::new(
            store,
            Arc::new(remote.clone()),
            SyncSettings::default(),
        ))
    }

    fn no_env(_key: &str) -> Option<String> {
        None
    }

    fn env_credentials(key: &str) -> Option<String> {
        match key {
            "BARSA_API_KEY" => Some("env-secret".to_string()),
            "BARSA_PROJECT_ID" => Some("granja-norte".to_string()),
            _ => None,
        }
    }

    #[tokio::test]
    async fn test_missing_file_is_local_only() {
        let dir = TempDir::new().unwrap();
        let remote = MemoryRemote::new();
        let gate =
            ConfigGate::open(dir.path().join("sync.toml"), manager(&remote).await).with_env(no_env);

        assert!(!gate.is_connected_mode().await);
        assert_eq!(gate.start().await, SessionState::Disconnected);
        assert_eq!(remote.open_count(), 0);
    }

    #[tokio::test]
    async fn test_garbage_file_starts_local_only() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("sync.toml");
        std::fs::write(&path, "[remote\napi_key = ").unwrap();
        let remote = MemoryRemote::new();

        let gate = ConfigGate::open(&path, manager(&remote).await).with_env(no_env);
        assert_eq!(gate.file_config().await, SyncConfig::default());
        assert_eq!(gate.start().await, SessionState::Disconnected);
        assert_eq!(remote.open_count(), 0);

        // Saving replaces the unreadable file.
        gate.set_credentials(None).await.unwrap();
        assert!(SyncConfig::load_file(Some(path)).is_ok());
    }

    #[tokio::test]
    async fn test_save_connects_then_disconnects() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("sync.toml");
        let remote = MemoryRemote::new();
        remote.provision("granja-norte", "key-1");
        let gate = ConfigGate::open(&path, manager(&remote).await).with_env(no_env);

        let state = gate
            .set_credentials(Some(Credentials::new("key-1", "granja-norte")))
            .await
            .unwrap();
        assert_eq!(state, SessionState::Active);
        assert!(gate.is_connected_mode().await);

        let reloaded = SyncConfig::load_file(Some(path.clone())).unwrap();
        assert_eq!(
            reloaded.usable_credentials(),
            Some(Credentials::new("key-1", "granja-norte"))
        );

        let state = gate.set_credentials(None).await.unwrap();
        assert_eq!(state, SessionState::Disconnected);
        assert_eq!(remote.active_feeds("granja-norte"), 0);
        assert!(SyncConfig::load_file(Some(path)).unwrap().remote.is_none());
    }

    #[tokio::test]
    async fn test_environment_credentials_are_never_written() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("sync.toml");
        let remote = MemoryRemote::new();
        remote.provision("granja-norte", "env-secret");
        let gate = ConfigGate::open(&path, manager(&remote).await).with_env(env_credentials);

        assert_eq!(gate.start().await, SessionState::Active);
        assert_eq!(gate.credentials().await.unwrap().api_key, "env-secret");

        let mut config = gate.file_config().await;
        config.sync.bootstrap_chunk_size = 10;
        assert_eq!(gate.save(config).await.unwrap(), SessionState::Active);

        let text = std::fs::read_to_string(&path).unwrap();
        assert!(!text.contains("env-secret"));
        assert!(text.contains("bootstrap_chunk_size = 10"));
        assert!(gate.file_config().await.remote.is_none());
        assert_eq!(gate.config().await.sync.bootstrap_chunk_size, 10);
    }

    #[tokio::test]
    async fn test_failed_connect_still_saves() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("sync.toml");
        let remote = MemoryRemote::new();
        let gate = ConfigGate::open(&path, manager(&remote).await).with_env(no_env);

        let state = gate
            .set_credentials(Some(Credentials::new("key-1", "not-created")))
            .await
            .unwrap();
        assert_eq!(state, SessionState::Disconnected);
        assert!(path.exists());
        assert!(gate.credentials().await.is_some());
    }

    #[tokio::test]
    async fn test_invalid_config_is_not_saved() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("sync.toml");
        let remote = MemoryRemote::new();
        let gate = ConfigGate::open(&path, manager(&remote).await).with_env(no_env);

        let mut config = SyncConfig::default();
        config.sync.bootstrap_chunk_size = 0;
        assert!(gate.save(config).await.is_err());
        assert!(!path.exists());
    }
}

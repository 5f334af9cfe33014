//! # Sync Configuration
//!
//! The persisted settings behind the [`ConfigGate`](crate::gate::ConfigGate).
//!
//! ## Configuration Sources
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                    Configuration Priority                               │
//! │                                                                         │
//! │  1. Environment Variables (highest priority)                           │
//! │     BARSA_API_KEY=...  BARSA_PROJECT_ID=granja-norte                   │
//! │                                                                         │
//! │  2. TOML Config File                                                   │
//! │     ~/.config/barsa/sync.toml (Linux)                                  │
//! │     ~/Library/Application Support/com.barsa.barsa/sync.toml (macOS)    │
//! │                                                                         │
//! │  3. Default Values (lowest priority)                                   │
//! │     no [remote] section = local-only mode                              │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Configuration File Format
//! ```toml
//! # sync.toml
//! [remote]
//! api_key = "AIza..."
//! project_id = "granja-norte"
//! endpoint = "ws://192.168.1.20:8765/ws"
//!
//! [sync]
//! bootstrap_chunk_size = 100
//! bootstrap_delay_ms = 1500
//! mirror_max_retries = 3
//!
//! [store]
//! database_path = "/var/lib/barsa/barsa.db"
//! ```
//!
//! Credentials live here and only here: the business configuration record
//! in the `config` collection is synchronised and must never carry them.

use barsa_core::Credentials;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::error::{SyncError, SyncResult};

// =============================================================================
// Sync Settings
// =============================================================================

/// Sync tuning.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncSettings {
    /// Records uploaded concurrently per bootstrap chunk.
    #[serde(default = "default_bootstrap_chunk_size")]
    pub bootstrap_chunk_size: usize,

    /// Delay between entering Active and starting the bootstrap upload,
    /// so listeners attach first (milliseconds).
    #[serde(default = "default_bootstrap_delay")]
    pub bootstrap_delay_ms: u64,

    /// Retries of a failed mirror write before it is dead-lettered.
    #[serde(default = "default_mirror_max_retries")]
    pub mirror_max_retries: u32,

    /// First retry delay (milliseconds).
    #[serde(default = "default_mirror_initial_backoff")]
    pub mirror_initial_backoff_ms: u64,

    /// Retry delay cap (milliseconds).
    #[serde(default = "default_mirror_max_backoff")]
    pub mirror_max_backoff_ms: u64,

    /// Bound on opening a session and on the validator's probe (seconds).
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
}

fn default_bootstrap_chunk_size() -> usize {
    100
}
fn default_bootstrap_delay() -> u64 {
    1500
}
fn default_mirror_max_retries() -> u32 {
    3
}
fn default_mirror_initial_backoff() -> u64 {
    200
}
fn default_mirror_max_backoff() -> u64 {
    5000
}
fn default_connect_timeout() -> u64 {
    10
}

impl Default for SyncSettings {
    fn default() -> Self {
        SyncSettings {
            bootstrap_chunk_size: default_bootstrap_chunk_size(),
            bootstrap_delay_ms: default_bootstrap_delay(),
            mirror_max_retries: default_mirror_max_retries(),
            mirror_initial_backoff_ms: default_mirror_initial_backoff(),
            mirror_max_backoff_ms: default_mirror_max_backoff(),
            connect_timeout_secs: default_connect_timeout(),
        }
    }
}

impl SyncSettings {
    pub fn bootstrap_delay(&self) -> Duration {
        Duration::from_millis(self.bootstrap_delay_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn mirror_initial_backoff(&self) -> Duration {
        Duration::from_millis(self.mirror_initial_backoff_ms)
    }

    pub fn mirror_max_backoff(&self) -> Duration {
        Duration::from_millis(self.mirror_max_backoff_ms)
    }
}

// =============================================================================
// Store Settings
// =============================================================================

/// Where the LocalStore lives.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreSettings {
    /// SQLite file. Defaults to the platform data directory.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub database_path: Option<PathBuf>,
}

// =============================================================================
// Hub Server Settings
// =============================================================================

/// Configuration for the document hub server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HubSettings {
    /// Port for the WebSocket server.
    #[serde(default = "default_hub_port")]
    pub port: u16,

    /// Bind address (default: 0.0.0.0 for all interfaces).
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,
}

fn default_hub_port() -> u16 {
    8765
}

fn default_bind_addr() -> String {
    "0.0.0.0".to_string()
}

impl Default for HubSettings {
    fn default() -> Self {
        HubSettings {
            port: default_hub_port(),
            bind_addr: default_bind_addr(),
        }
    }
}

impl HubSettings {
    /// Returns the full bind address.
    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.bind_addr, self.port)
    }
}

/// Reads a process environment variable.
pub(crate) fn env_var(key: &str) -> Option<String> {
    std::env::var(key).ok()
}

// =============================================================================
// Main Sync Configuration
// =============================================================================

/// Complete sync configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncConfig {
    /// Remote credentials. Absent means local-only mode.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remote: Option<Credentials>,

    /// Sync tuning.
    #[serde(default)]
    pub sync: SyncSettings,

    /// LocalStore location.
    #[serde(default)]
    pub store: StoreSettings,

    /// Hub server settings.
    #[serde(default)]
    pub hub: HubSettings,
}

impl SyncConfig {
    /// Creates a config with defaults and no credentials.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a config with the given credentials and default tuning.
    pub fn with_credentials(credentials: Credentials) -> Self {
        SyncConfig {
            remote: Some(credentials),
            ..Default::default()
        }
    }

    /// Loads configuration from file, environment, and defaults.
    ///
    /// ## Load Order (later overrides earlier)
    /// 1. Default values
    /// 2. Config file (sync.toml)
    /// 3. Environment variables
    pub fn load(config_path: Option<PathBuf>) -> SyncResult<Self> {
        let config = Self::load_file(config_path)?.with_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Loads only the file layer: defaults plus `sync.toml`, without the
    /// environment. This is what [`save`](Self::save) should write back.
    pub fn load_file(config_path: Option<PathBuf>) -> SyncResult<Self> {
        let mut config = Self::default();

        if let Some(path) = config_path.or_else(Self::default_config_path) {
            if path.exists() {
                info!(?path, "Loading sync config from file");
                let contents = std::fs::read_to_string(&path)?;
                config = toml::from_str(&contents)?;
            } else {
                debug!(?path, "Config file not found, using defaults");
            }
        }

        config.validate()?;
        Ok(config)
    }

    /// Loads config or returns default if load fails.
    pub fn load_or_default(config_path: Option<PathBuf>) -> Self {
        Self::load(config_path).unwrap_or_else(|e| {
            warn!("Failed to load sync config: {}. Using defaults.", e);
            Self::default()
        })
    }

    /// Saves configuration to file.
    pub fn save(&self, config_path: Option<PathBuf>) -> SyncResult<()> {
        let path = config_path
            .or_else(Self::default_config_path)
            .ok_or_else(|| SyncError::ConfigSaveFailed("No config path available".into()))?;

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let contents = toml::to_string_pretty(self)?;
        std::fs::write(&path, contents)?;

        info!(?path, "Sync config saved");
        Ok(())
    }

    /// Validates the configuration.
    ///
    /// Credentials with missing fields are NOT an error here: they simply
    /// keep the app in local-only mode. A present endpoint must parse.
    pub fn validate(&self) -> SyncResult<()> {
        if let Some(endpoint) = self.remote.as_ref().and_then(|c| c.endpoint.as_deref()) {
            let endpoint = endpoint.trim();
            if !endpoint.is_empty() {
                let url = url::Url::parse(endpoint)?;
                if !matches!(url.scheme(), "ws" | "wss" | "memory") {
                    return Err(SyncError::InvalidUrl(format!(
                        "Endpoint must start with ws://, wss:// or memory://, got: {}",
                        endpoint
                    )));
                }
            }
        }

        if self.sync.bootstrap_chunk_size == 0 {
            return Err(SyncError::InvalidConfig(
                "bootstrap_chunk_size must be greater than 0".into(),
            ));
        }

        if self.sync.connect_timeout_secs == 0 {
            return Err(SyncError::InvalidConfig(
                "connect_timeout_secs must be greater than 0".into(),
            ));
        }

        Ok(())
    }

    /// Returns a copy with the `BARSA_*` environment overrides applied.
    pub fn with_env_overrides(&self) -> Self {
        self.with_overrides_from(env_var)
    }

    /// Returns a copy with overrides read through `lookup` applied.
    pub fn with_overrides_from<F>(&self, lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = self.clone();
        config.apply_overrides_from(lookup);
        config
    }

    /// Applies overrides read through `lookup`.
    fn apply_overrides_from<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(key) = lookup("BARSA_API_KEY") {
            debug!("Overriding api_key from environment");
            self.remote.get_or_insert_with(Credentials::default).api_key = key;
        }

        if let Some(project) = lookup("BARSA_PROJECT_ID") {
            debug!(project = %project, "Overriding project_id from environment");
            self.remote.get_or_insert_with(Credentials::default).project_id = project;
        }

        if let Some(endpoint) = lookup("BARSA_ENDPOINT") {
            debug!(endpoint = %endpoint, "Overriding endpoint from environment");
            self.remote.get_or_insert_with(Credentials::default).endpoint = Some(endpoint);
        }

        if let Some(path) = lookup("BARSA_DATABASE_PATH") {
            self.store.database_path = Some(PathBuf::from(path));
        }

        if let Some(size) = lookup("BARSA_BOOTSTRAP_CHUNK_SIZE") {
            match size.parse::<usize>() {
                Ok(n) => self.sync.bootstrap_chunk_size = n,
                Err(_) => warn!(value = %size, "Ignoring invalid BARSA_BOOTSTRAP_CHUNK_SIZE"),
            }
        }

        if let Some(port) = lookup("BARSA_HUB_PORT") {
            if let Ok(p) = port.parse::<u16>() {
                debug!(port = p, "Overriding hub port from environment");
                self.hub.port = p;
            }
        }
    }

    /// Returns the default config file path.
    pub fn default_config_path() -> Option<PathBuf> {
        directories::ProjectDirs::from("com", "barsa", "barsa")
            .map(|dirs| dirs.config_dir().join("sync.toml"))
    }

    /// Returns the default database path.
    pub fn default_database_path() -> Option<PathBuf> {
        directories::ProjectDirs::from("com", "barsa", "barsa")
            .map(|dirs| dirs.data_dir().join("barsa.db"))
    }

    // =========================================================================
    // Convenience Methods
    // =========================================================================

    /// Returns the credentials, normalized, if they are complete.
    pub fn usable_credentials(&self) -> Option<Credentials> {
        self.remote
            .as_ref()
            .map(Credentials::normalized)
            .filter(Credentials::is_complete)
    }

    /// Returns true if the config switches the app into synchronised mode.
    pub fn is_sync_enabled(&self) -> bool {
        self.usable_credentials().is_some()
    }

    /// Returns the database path, falling back to the platform default.
    pub fn database_path(&self) -> Option<PathBuf> {
        self.store
            .database_path
            .clone()
            .or_else(Self::default_database_path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_default_config() {
        let config = SyncConfig::default();
        assert!(config.remote.is_none());
        assert!(!config.is_sync_enabled());
        assert_eq!(config.sync.bootstrap_chunk_size, 100);
        assert_eq!(config.sync.bootstrap_delay(), Duration::from_millis(1500));
        assert_eq!(config.sync.mirror_max_retries, 3);
    }

    #[test]
    fn test_config_validation() {
        let mut config = SyncConfig::default();
        assert!(config.validate().is_ok());

        config.sync.bootstrap_chunk_size = 0;
        assert!(config.validate().is_err());
        config.sync.bootstrap_chunk_size = 10;

        config.remote = Some(Credentials::new("k", "p").with_endpoint("http://invalid"));
        assert!(config.validate().is_err());

        config.remote = Some(Credentials::new("k", "p").with_endpoint("not a url"));
        assert!(config.validate().is_err());

        config.remote = Some(Credentials::new("k", "p").with_endpoint("ws://localhost:8765/ws"));
        assert!(config.validate().is_ok());

        // Incomplete credentials are valid config, just not sync-enabled.
        config.remote = Some(Credentials::new("", "p"));
        assert!(config.validate().is_ok());
        assert!(!config.is_sync_enabled());
    }

    #[test]
    fn test_env_overrides() {
        let env: HashMap<&str, &str> = [
            ("BARSA_API_KEY", "env-key"),
            ("BARSA_PROJECT_ID", "env-project"),
            ("BARSA_BOOTSTRAP_CHUNK_SIZE", "25"),
            ("BARSA_DATABASE_PATH", "/tmp/barsa.db"),
        ]
        .into_iter()
        .collect();

        let mut config = SyncConfig::default();
        config.apply_overrides_from(|k| env.get(k).map(|v| v.to_string()));

        let creds = config.usable_credentials().unwrap();
        assert_eq!(creds.api_key, "env-key");
        assert_eq!(creds.project_id, "env-project");
        assert_eq!(config.sync.bootstrap_chunk_size, 25);
        assert_eq!(config.database_path(), Some(PathBuf::from("/tmp/barsa.db")));
    }

    #[test]
    fn test_usable_credentials_are_normalized() {
        let mut creds = Credentials::new(" key ", "proj");
        creds.app_id = Some(String::new());
        let config = SyncConfig::with_credentials(creds);

        let usable = config.usable_credentials().unwrap();
        assert_eq!(usable.api_key, "key");
        assert_eq!(usable.app_id, None);
    }

    #[test]
    fn test_save_and_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("sync.toml");

        let mut config = SyncConfig::with_credentials(
            Credentials::new("key", "granja").with_endpoint("memory://local"),
        );
        config.sync.bootstrap_chunk_size = 7;
        config.save(Some(path.clone())).unwrap();

        let text = std::fs::read_to_string(&path).unwrap();
        assert!(text.contains("[remote]"));
        assert!(text.contains("[sync]"));

        let loaded: SyncConfig = toml::from_str(&text).unwrap();
        assert_eq!(loaded, config);
    }

    #[test]
    fn test_file_layer_excludes_environment() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sync.toml");
        SyncConfig::default().save(Some(path.clone())).unwrap();

        let file = SyncConfig::load_file(Some(path)).unwrap();
        let effective = file.with_overrides_from(|k| {
            (k == "BARSA_API_KEY" || k == "BARSA_PROJECT_ID").then(|| "from-env".to_string())
        });

        assert!(file.remote.is_none());
        assert_eq!(effective.usable_credentials().unwrap().api_key, "from-env");
    }

    #[test]
    fn test_garbage_file_fails_to_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sync.toml");
        std::fs::write(&path, "[remote\napi_key = ").unwrap();

        assert!(matches!(
            SyncConfig::load_file(Some(path.clone())),
            Err(SyncError::ConfigLoadFailed(_))
        ));
        assert_eq!(SyncConfig::load_or_default(Some(path)), SyncConfig::default());
    }

    #[test]
    fn test_missing_file_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = SyncConfig::load_or_default(Some(dir.path().join("absent.toml")));
        assert_eq!(config.sync, SyncSettings::default());
    }
}

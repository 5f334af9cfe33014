//! # barsa-sync: Data Synchronization Core for Barsa
//!
//! Keeps the LocalStore and an optional remote document store consistent.
//! Without credentials the app runs local-only and nothing here touches the
//! network.
//!
//! ## Architecture Overview
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                        Sync Core Architecture                           │
//! │                                                                         │
//! │  ┌──────────────────────────────────────────────────────────────────┐  │
//! │  │  ConfigGate                                                      │  │
//! │  │  sync.toml credentials ─► connect / disconnect                  │  │
//! │  └────────────────────────────┬─────────────────────────────────────┘  │
//! │                               ▼                                         │
//! │  ┌──────────────────────────────────────────────────────────────────┐  │
//! │  │  SyncSessionManager                                              │  │
//! │  │  Disconnected ─► Connecting ─► Active, owns one SyncSession      │  │
//! │  └──────┬──────────────────────┬──────────────────────┬─────────────┘  │
//! │         ▼                      ▼                      ▼                 │
//! │  ┌────────────────┐  ┌──────────────────┐  ┌────────────────────────┐  │
//! │  │ ChangeListener │  │ UploadPropagator │  │ RemoteSession          │  │
//! │  │  x4 collections│  │                  │  │                        │  │
//! │  │                │  │ bootstrap upload │  │ MemoryRemote           │  │
//! │  │ MergeEngine ──►│  │ mirror saves and │  │ WsConnector ◄─► Hub    │  │
//! │  │ LocalStore     │  │ deletes, retry,  │  │                        │  │
//! │  │                │  │ dead letters     │  │                        │  │
//! │  └────────────────┘  └──────────────────┘  └────────────────────────┘  │
//! │                                                                         │
//! │  ConnectionValidator: one probe write on a throwaway session           │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Module Organization
//!
//! - [`gate`] - Persisted credentials, connect/disconnect trigger
//! - [`session`] - `SyncSessionManager` state machine and `SyncSession`
//! - [`listener`] - Per-collection change listeners
//! - [`merge`] - Batch merge with fingerprint change detection
//! - [`upload`] - Bootstrap upload, mirror, dead-letter replay
//! - [`validator`] - Credential probe
//! - [`remote`] - Remote store abstraction and implementations
//! - [`protocol`] - WebSocket message types
//! - [`hub`] - WebSocket server backed by a `MemoryRemote`
//! - [`config`] - Sync configuration (credentials, tuning, hub)
//! - [`error`] - Sync error types and failure classification
//!
//! ## Usage
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use barsa_db::LocalStore;
//! use barsa_sync::{ConfigGate, SyncSessionManager, SyncSettings, WsConnector};
//!
//! let store = LocalStore::open(db_config).await?;
//! let manager = Arc::new(SyncSessionManager::new(
//!     store.clone(),
//!     Arc::new(WsConnector::default()),
//!     SyncSettings::default(),
//! ));
//!
//! let gate = ConfigGate::open(config_path, manager.clone());
//! gate.start().await;
//!
//! // Reads and writes go to the LocalStore whatever the state.
//! store.save(Collection::Orders, order).await?;
//! ```

// =============================================================================
// Module Declarations
// =============================================================================

pub mod config;
pub mod error;
pub mod gate;
pub mod hub;
pub mod listener;
pub mod merge;
pub mod protocol;
pub mod remote;
pub mod session;
pub mod upload;
pub mod validator;

// =============================================================================
// Re-exports
// =============================================================================

pub use config::{HubSettings, StoreSettings, SyncConfig, SyncSettings};
pub use error::{ConnectionFailureKind, RemoteError, SyncError, SyncResult};
pub use gate::ConfigGate;
pub use hub::{DocumentHub, HubHandle};
pub use listener::{ChangeListener, ListenerHandle};
pub use merge::{MergeEngine, MergeOutcome};
pub use protocol::SyncMessage;
pub use remote::{
    MemoryRemote, RemoteConnector, RemoteSession, SharedSession, Subscription, WsConnector,
};
pub use session::{
    NoOpEmitter, SessionState, SyncEventEmitter, SyncSession, SyncSessionManager,
    SyncSessionManagerBuilder, SyncStatus,
};
pub use upload::{BootstrapReport, MirrorHandle, ReplayReport, UploadPropagator};
pub use validator::{ConnectionValidator, ValidationOutcome};

//! # barsa-core: Pure Types for the Barsa Sync Core
//!
//! Everything the sync layers agree on, with zero I/O.
//!
//! ## Architecture Position
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                       Barsa Sync Architecture                           │
//! │                                                                         │
//! │  ┌─────────────────────────────────────────────────────────────────┐   │
//! │  │                    barsa-sync (Sync Layer)                      │   │
//! │  │  ConfigGate ─► Validator ─► SessionManager ─► Listener/Upload   │   │
//! │  └─────────────────────────────┬───────────────────────────────────┘   │
//! │                                │                                        │
//! │  ┌─────────────────────────────▼───────────────────────────────────┐   │
//! │  │                    barsa-db (LocalStore)                        │   │
//! │  │          SQLite-backed collections, notifications, backup       │   │
//! │  └─────────────────────────────┬───────────────────────────────────┘   │
//! │                                │                                        │
//! │  ┌─────────────────────────────▼───────────────────────────────────┐   │
//! │  │               ★ barsa-core (THIS CRATE) ★                       │   │
//! │  │                                                                 │   │
//! │  │   ┌───────────┐  ┌───────────┐  ┌───────────┐  ┌───────────┐  │   │
//! │  │   │   types   │  │ record_set│  │credentials│  │ validation│  │   │
//! │  │   │  Record   │  │ RecordSet │  │  required │  │   rules   │  │   │
//! │  │   │ChangeBatch│  │fingerprint│  │  subset   │  │  checks   │  │   │
//! │  │   └───────────┘  └───────────┘  └───────────┘  └───────────┘  │   │
//! │  │                                                                 │   │
//! │  │   NO I/O • NO DATABASE • NO NETWORK • PURE FUNCTIONS           │   │
//! │  └─────────────────────────────────────────────────────────────────┘   │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`types`] - Collection, Record, remote change events
//! - [`record_set`] - Ordered, id-unique in-memory collection
//! - [`credentials`] - Remote-access parameters
//! - [`domain`] - The records a fresh installation is seeded with
//! - [`error`] - Domain error types
//! - [`validation`] - Input checks
//!
//! ## Example Usage
//!
//! ```rust
//! use barsa_core::{Record, RecordSet};
//! use serde_json::json;
//!
//! let mut orders = RecordSet::new();
//! let order = Record::from_value(json!({"id": "o-1", "client": "Juan"})).unwrap();
//!
//! assert!(orders.upsert(order.clone()));
//! // Same content again: nothing changes.
//! assert!(!orders.upsert(order));
//! ```

// =============================================================================
// Module Declarations
// =============================================================================

pub mod credentials;
pub mod domain;
pub mod error;
pub mod record_set;
pub mod types;
pub mod validation;

// =============================================================================
// Re-exports
// =============================================================================

pub use credentials::Credentials;
pub use domain::{AppConfig, User, UserRole, WeighingType, APP_CONFIG_ID, DEFAULT_ADMIN_ID};
pub use error::{CoreError, CoreResult, ValidationError};
pub use record_set::RecordSet;
pub use types::{
    ChangeBatch, ChangeKind, Collection, Fingerprint, Record, RemoteChange, ID_FIELD,
};

// =============================================================================
// Constants
// =============================================================================

/// Remote collection written by the connection probe. Never mirrored
/// locally.
pub const DIAGNOSTICS_COLLECTION: &str = "_diagnostics";

/// Document id the connection probe writes.
pub const DIAGNOSTICS_DOCUMENT_ID: &str = "connection-test";

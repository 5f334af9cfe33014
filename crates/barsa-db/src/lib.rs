//! # barsa-db: LocalStore for Barsa
//!
//! Durable, always-available storage for every collection. It uses SQLite
//! via sqlx, one JSON array per collection.
//!
//! ## Architecture Position
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                        Barsa Data Flow                                  │
//! │                                                                         │
//! │  Collaborators (forms, reports)        barsa-sync (merge, mirror)      │
//! │       │                                       │                         │
//! │       ▼                                       ▼                         │
//! │  ┌─────────────────────────────────────────────────────────────────┐   │
//! │  │                     barsa-db (THIS CRATE)                       │   │
//! │  │                                                                 │   │
//! │  │   ┌───────────────┐    ┌───────────────┐    ┌──────────────┐  │   │
//! │  │   │  LocalStore   │    │  Repositories │    │  Migrations  │  │   │
//! │  │   │ get/save/...  │───►│ collections   │    │  (embedded)  │  │   │
//! │  │   │ notifications │    │ dead letters  │    │              │  │   │
//! │  │   └───────────────┘    └───────────────┘    └──────────────┘  │   │
//! │  │                                                                 │   │
//! │  └─────────────────────────────────────────────────────────────────┘   │
//! │       │                                                                 │
//! │       ▼                                                                 │
//! │  ┌─────────────────────────────────────────────────────────────────┐   │
//! │  │                     SQLite Database                             │   │
//! │  └─────────────────────────────────────────────────────────────────┘   │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Module Organization
//!
//! - [`local_store`] - The LocalStore itself
//! - [`notify`] - Per-collection change notifications
//! - [`seed`] - Default records for a fresh installation
//! - [`backup`] - Export, restore and reset
//! - [`pool`] - Connection pool creation and configuration
//! - [`migrations`] - Embedded database migrations
//! - [`repository`] - Raw SQL repositories
//! - [`error`] - Database error types
//!
//! ## Usage
//!
//! ```rust,ignore
//! use barsa_core::{Collection, Record};
//! use barsa_db::{DbConfig, LocalStore};
//!
//! let store = LocalStore::open(DbConfig::new("barsa.db")).await?;
//! let mut orders_changed = store.notifier().subscribe(Collection::Orders);
//!
//! store.save(Collection::Orders, Record::new("o-1")?).await?;
//! let event = orders_changed.recv().await;
//! ```

// =============================================================================
// Module Declarations
// =============================================================================

pub mod backup;
pub mod error;
pub mod local_store;
pub mod migrations;
pub mod notify;
pub mod pool;
pub mod repository;
pub mod seed;

// =============================================================================
// Re-exports
// =============================================================================

pub use backup::Backup;
pub use error::{DbError, DbResult};
pub use local_store::LocalStore;
pub use notify::{ChangeCause, ChangeNotifier, CollectionChanged};
pub use pool::{Database, DbConfig};
pub use seed::SeedReport;

// Repository re-exports for convenience
pub use repository::collection::CollectionRepository;
pub use repository::dead_letter::{DeadLetter, DeadLetterOperation, DeadLetterRepository};

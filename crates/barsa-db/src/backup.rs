//! # Backup, Restore and Reset
//!
//! A backup is every collection's stored payload plus a timestamp, in the
//! JSON shape the app has always written to disk:
//!
//! ```json
//! {
//!   "users":   "[{\"id\":\"admin-1\", ...}]",
//!   "batches": "[...]",
//!   "orders":  "[...]",
//!   "config":  "[{\"id\":\"app-config\", ...}]",
//!   "backupDate": "2026-10-16T09:30:00Z"
//! }
//! ```

use barsa_core::{Collection, RecordSet};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::{DbError, DbResult};
use crate::local_store::{decode_payload, encode_payload, LocalStore};
use crate::notify::ChangeCause;

/// Serialized copy of every collection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Backup {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub users: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub batches: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub orders: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config: Option<String>,
    /// RFC 3339 timestamp of the export.
    pub backup_date: String,
}

impl Backup {
    /// Returns the payload stored for a collection.
    pub fn payload(&self, collection: Collection) -> Option<&str> {
        match collection {
            Collection::Users => self.users.as_deref(),
            Collection::Batches => self.batches.as_deref(),
            Collection::Orders => self.orders.as_deref(),
            Collection::Config => self.config.as_deref(),
        }
    }

    fn payload_mut(&mut self, collection: Collection) -> &mut Option<String> {
        match collection {
            Collection::Users => &mut self.users,
            Collection::Batches => &mut self.batches,
            Collection::Orders => &mut self.orders,
            Collection::Config => &mut self.config,
        }
    }

    /// Parses a backup file's content.
    pub fn from_json(json: &str) -> DbResult<Self> {
        serde_json::from_str(json).map_err(|e| DbError::InvalidBackup(e.to_string()))
    }

    /// Serializes the backup for writing to disk.
    pub fn to_json_pretty(&self) -> DbResult<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}

impl LocalStore {
    /// Exports every collection that has been written.
    pub async fn export_backup(&self) -> DbResult<Backup> {
        let mut backup = Backup {
            users: None,
            batches: None,
            orders: None,
            config: None,
            backup_date: Utc::now().to_rfc3339(),
        };

        for collection in Collection::ALL {
            *backup.payload_mut(collection) = self.raw_payload(collection).await?;
        }

        info!(date = %backup.backup_date, "Backup exported");
        Ok(backup)
    }

    /// Restores collections from a backup.
    ///
    /// The backup must carry `users` and `config`; otherwise nothing is
    /// written. Collections absent from the backup are left as they are.
    /// All present collections are written in one transaction.
    pub async fn restore_backup(&self, backup: &Backup) -> DbResult<()> {
        if backup.users.is_none() || backup.config.is_none() {
            return Err(DbError::InvalidBackup(
                "backup must contain users and config".to_string(),
            ));
        }

        let mut restored = Vec::new();
        let mut entries = Vec::new();
        for collection in Collection::ALL {
            if let Some(payload) = backup.payload(collection) {
                let set = decode_payload(collection, payload);
                entries.push((collection.as_str(), encode_payload(&set)?));
                restored.push(collection);
            }
        }

        {
            let _guard = self.lock_writes().await;
            self.database().collections().store_many(&entries).await?;
        }

        for collection in &restored {
            self.notify(*collection, ChangeCause::Restored);
        }

        info!(collections = restored.len(), date = %backup.backup_date, "Backup restored");
        Ok(())
    }

    /// Clears every collection and the dead-letter queue, then re-seeds
    /// the defaults.
    pub async fn reset(&self) -> DbResult<()> {
        {
            let _guard = self.lock_writes().await;
            let cleared = self.database().collections().clear_all().await?;
            let letters = self.database().dead_letters().clear().await?;
            if letters > 0 {
                warn!(dropped = letters, "Reset dropped unreplayed dead letters");
            }
            self.seed_unlocked().await?;
            info!(cleared, "Store reset");
        }

        for collection in Collection::ALL {
            self.notify(collection, ChangeCause::Restored);
        }
        Ok(())
    }
}

/// Returns a backup's collection parsed leniently, for previews.
pub fn preview(backup: &Backup, collection: Collection) -> RecordSet {
    backup
        .payload(collection)
        .map(|payload| decode_payload(collection, payload))
        .unwrap_or_default()
}

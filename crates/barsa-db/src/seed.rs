//! # Default Records
//!
//! A fresh installation needs a user who can log in and a business
//! configuration to render. Both are written only into collections that
//! have never been written, so a user who deletes every order is not
//! surprised by defaults reappearing.

use barsa_core::{AppConfig, Collection, Record, RecordSet, User};
use tracing::info;

use crate::error::DbResult;
use crate::local_store::LocalStore;

/// What [`LocalStore::seed_defaults`] wrote.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SeedReport {
    pub users_seeded: bool,
    pub config_seeded: bool,
}

impl LocalStore {
    /// Seeds the default administrator and business configuration into
    /// collections that have never been written.
    pub async fn seed_defaults(&self) -> DbResult<SeedReport> {
        let _guard = self.lock_writes().await;
        self.seed_unlocked().await
    }

    /// Seeding body; the caller must hold the write lock.
    pub(crate) async fn seed_unlocked(&self) -> DbResult<SeedReport> {
        let repo = self.database().collections();
        let mut report = SeedReport::default();

        if !repo.exists(Collection::Users.as_str()).await? {
            let admin = Record::from_typed(&User::default_admin())?;
            self.write_set(Collection::Users, &RecordSet::from_records([admin]))
                .await?;
            report.users_seeded = true;
        }

        if !repo.exists(Collection::Config.as_str()).await? {
            let config = Record::from_typed(&AppConfig::default())?;
            self.write_set(Collection::Config, &RecordSet::from_records([config]))
                .await?;
            report.config_seeded = true;
        }

        if report.users_seeded || report.config_seeded {
            info!(
                users = report.users_seeded,
                config = report.config_seeded,
                "Seeded default records"
            );
        }

        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use barsa_core::{APP_CONFIG_ID, DEFAULT_ADMIN_ID};

    #[tokio::test]
    async fn test_fresh_store_is_seeded() {
        let store = LocalStore::in_memory().await.unwrap();

        let users = store.get(Collection::Users).await.unwrap();
        assert_eq!(users.len(), 1);
        assert_eq!(users[0].id(), DEFAULT_ADMIN_ID);

        let config: AppConfig = store
            .get_one(Collection::Config, APP_CONFIG_ID)
            .await
            .unwrap()
            .unwrap()
            .to_typed()
            .unwrap();
        assert_eq!(config, AppConfig::default());

        assert!(store.get(Collection::Orders).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_seed_respects_emptied_collections() {
        let store = LocalStore::in_memory().await.unwrap();
        store.delete(Collection::Users, DEFAULT_ADMIN_ID).await.unwrap();

        let report = store.seed_defaults().await.unwrap();
        assert_eq!(report, SeedReport::default());
        assert!(store.get(Collection::Users).await.unwrap().is_empty());
    }
}

//! # Collection Repository
//!
//! Stores each collection as a single row holding its serialized JSON
//! array. This layer does no parsing: the payload goes in and out as text,
//! and [`LocalStore`](crate::LocalStore) decides what a bad payload means.

use chrono::Utc;
use sqlx::SqlitePool;
use tracing::debug;

use crate::error::DbResult;

/// Repository for raw collection payloads.
#[derive(Debug, Clone)]
pub struct CollectionRepository {
    pool: SqlitePool,
}

impl CollectionRepository {
    /// Creates a new CollectionRepository.
    pub fn new(pool: SqlitePool) -> Self {
        CollectionRepository { pool }
    }

    /// Returns the stored payload for a collection, or `None` if it has never
    /// been written.
    pub async fn load(&self, name: &str) -> DbResult<Option<String>> {
        let payload: Option<String> =
            sqlx::query_scalar("SELECT payload FROM collections WHERE name = ?1")
                .bind(name)
                .fetch_optional(&self.pool)
                .await?;

        Ok(payload)
    }

    /// Returns true if the collection has ever been written.
    pub async fn exists(&self, name: &str) -> DbResult<bool> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM collections WHERE name = ?1")
            .bind(name)
            .fetch_one(&self.pool)
            .await?;

        Ok(count > 0)
    }

    /// Writes (inserts or replaces) a collection payload.
    pub async fn store(&self, name: &str, payload: &str) -> DbResult<()> {
        debug!(collection = %name, bytes = payload.len(), "Storing collection");

        sqlx::query(
            r#"
            INSERT INTO collections (name, payload, updated_at)
            VALUES (?1, ?2, ?3)
            ON CONFLICT(name) DO UPDATE SET
                payload = excluded.payload,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(name)
        .bind(payload)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Writes several collection payloads in one transaction: either all
    /// land or none do.
    pub async fn store_many(&self, entries: &[(&str, String)]) -> DbResult<()> {
        let now = Utc::now();
        let mut tx = self.pool.begin().await?;

        for (name, payload) in entries {
            sqlx::query(
                r#"
                INSERT INTO collections (name, payload, updated_at)
                VALUES (?1, ?2, ?3)
                ON CONFLICT(name) DO UPDATE SET
                    payload = excluded.payload,
                    updated_at = excluded.updated_at
                "#,
            )
            .bind(*name)
            .bind(payload.as_str())
            .bind(now)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        debug!(count = entries.len(), "Stored collections in one transaction");
        Ok(())
    }

    /// Deletes every stored collection.
    pub async fn clear_all(&self) -> DbResult<u64> {
        let result = sqlx::query("DELETE FROM collections")
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected())
    }
}

#[cfg(test)]
mod tests {
    use crate::pool::{Database, DbConfig};

    #[tokio::test]
    async fn test_store_and_load() {
        let db = Database::new(DbConfig::in_memory()).await.unwrap();
        let repo = db.collections();

        assert_eq!(repo.load("orders").await.unwrap(), None);
        assert!(!repo.exists("orders").await.unwrap());

        repo.store("orders", "[]").await.unwrap();
        repo.store("orders", r#"[{"id":"o-1"}]"#).await.unwrap();

        assert!(repo.exists("orders").await.unwrap());
        assert_eq!(
            repo.load("orders").await.unwrap().as_deref(),
            Some(r#"[{"id":"o-1"}]"#)
        );
    }

    #[tokio::test]
    async fn test_store_many_and_clear() {
        let db = Database::new(DbConfig::in_memory()).await.unwrap();
        let repo = db.collections();

        repo.store_many(&[("users", "[]".to_string()), ("config", "[]".to_string())])
            .await
            .unwrap();
        assert!(repo.exists("users").await.unwrap());
        assert!(repo.exists("config").await.unwrap());

        assert_eq!(repo.clear_all().await.unwrap(), 2);
        assert!(!repo.exists("users").await.unwrap());
    }
}

//! # Dead-Letter Repository
//!
//! Holds mirrored remote writes that failed past their retry budget.
//!
//! ## Lifecycle of a Dead Letter
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                                                                         │
//! │  LocalStore.save(orders, o-7)  ──► durable locally, caller returns     │
//! │       │                                                                 │
//! │       ▼  (background mirror task)                                       │
//! │  remote.set_merge(orders, o-7)  ✗  retry  ✗  retry  ✗                   │
//! │       │                                                                 │
//! │       ▼                                                                 │
//! │  INSERT INTO sync_dead_letters (collection, record_id, operation, ...) │
//! │       │                                                                 │
//! │       ▼  (next Active transition, after bootstrap)                      │
//! │  SELECT ... WHERE replayed_at IS NULL                                  │
//! │       ├── success → UPDATE ... SET replayed_at = now                   │
//! │       └── failure → UPDATE ... SET attempts += 1, last_error = ?       │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use barsa_core::Collection;
use chrono::{DateTime, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};
use tracing::debug;
use uuid::Uuid;

use crate::error::{DbError, DbResult};

/// The remote operation that failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeadLetterOperation {
    /// A merge-write of the full record.
    Upsert,
    /// A per-id delete.
    Delete,
}

impl DeadLetterOperation {
    /// Returns the persisted name.
    pub fn as_str(&self) -> &'static str {
        match self {
            DeadLetterOperation::Upsert => "UPSERT",
            DeadLetterOperation::Delete => "DELETE",
        }
    }
}

impl std::str::FromStr for DeadLetterOperation {
    type Err = DbError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "UPSERT" => Ok(DeadLetterOperation::Upsert),
            "DELETE" => Ok(DeadLetterOperation::Delete),
            other => Err(DbError::Internal(format!(
                "unknown dead-letter operation: {}",
                other
            ))),
        }
    }
}

/// A failed mirror write awaiting replay.
#[derive(Debug, Clone, PartialEq)]
pub struct DeadLetter {
    pub id: String,
    pub collection: Collection,
    pub record_id: String,
    pub operation: DeadLetterOperation,
    /// Record JSON for upserts; `None` for deletes.
    pub payload: Option<String>,
    pub attempts: i64,
    pub last_error: String,
    pub created_at: DateTime<Utc>,
    pub replayed_at: Option<DateTime<Utc>>,
}

impl DeadLetter {
    fn from_row(row: &SqliteRow) -> DbResult<Self> {
        let collection: String = row.try_get("collection")?;
        let operation: String = row.try_get("operation")?;

        Ok(DeadLetter {
            id: row.try_get("id")?,
            collection: collection.parse()?,
            record_id: row.try_get("record_id")?,
            operation: operation.parse()?,
            payload: row.try_get("payload")?,
            attempts: row.try_get("attempts")?,
            last_error: row.try_get("last_error")?,
            created_at: row.try_get("created_at")?,
            replayed_at: row.try_get("replayed_at")?,
        })
    }
}

/// Repository for dead-letter operations.
#[derive(Debug, Clone)]
pub struct DeadLetterRepository {
    pool: SqlitePool,
}

impl DeadLetterRepository {
    /// Creates a new DeadLetterRepository.
    pub fn new(pool: SqlitePool) -> Self {
        DeadLetterRepository { pool }
    }

    /// Records a mirror write that exhausted its retries.
    ///
    /// ## Arguments
    /// * `attempts` - How many times the write was tried before giving up
    pub async fn record(
        &self,
        collection: Collection,
        record_id: &str,
        operation: DeadLetterOperation,
        payload: Option<&str>,
        attempts: u32,
        error: &str,
    ) -> DbResult<DeadLetter> {
        let entry = DeadLetter {
            id: Uuid::new_v4().to_string(),
            collection,
            record_id: record_id.to_string(),
            operation,
            payload: payload.map(String::from),
            attempts: i64::from(attempts),
            last_error: error.to_string(),
            created_at: Utc::now(),
            replayed_at: None,
        };

        debug!(
            collection = %collection,
            record_id = %record_id,
            operation = operation.as_str(),
            "Recording dead letter"
        );

        sqlx::query(
            r#"
            INSERT INTO sync_dead_letters (
                id, collection, record_id, operation, payload,
                attempts, last_error, created_at, replayed_at
            ) VALUES (
                ?1, ?2, ?3, ?4, ?5,
                ?6, ?7, ?8, ?9
            )
            "#,
        )
        .bind(&entry.id)
        .bind(entry.collection.as_str())
        .bind(&entry.record_id)
        .bind(entry.operation.as_str())
        .bind(&entry.payload)
        .bind(entry.attempts)
        .bind(&entry.last_error)
        .bind(entry.created_at)
        .bind(entry.replayed_at)
        .execute(&self.pool)
        .await?;

        Ok(entry)
    }

    /// Gets dead letters that have not been replayed, oldest first.
    pub async fn pending(&self, limit: u32) -> DbResult<Vec<DeadLetter>> {
        let rows = sqlx::query(
            r#"
            SELECT
                id, collection, record_id, operation, payload,
                attempts, last_error, created_at, replayed_at
            FROM sync_dead_letters
            WHERE replayed_at IS NULL
            ORDER BY created_at ASC, rowid ASC
            LIMIT ?1
            "#,
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(DeadLetter::from_row).collect()
    }

    /// Marks a dead letter as successfully replayed.
    pub async fn mark_replayed(&self, id: &str) -> DbResult<()> {
        sqlx::query("UPDATE sync_dead_letters SET replayed_at = ?2 WHERE id = ?1")
            .bind(id)
            .bind(Utc::now())
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    /// Records another failed replay.
    pub async fn mark_failed(&self, id: &str, error: &str) -> DbResult<()> {
        sqlx::query(
            r#"
            UPDATE sync_dead_letters SET
                attempts = attempts + 1,
                last_error = ?2
            WHERE id = ?1
            "#,
        )
        .bind(id)
        .bind(error)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Counts dead letters awaiting replay.
    pub async fn count_pending(&self) -> DbResult<i64> {
        let count: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM sync_dead_letters WHERE replayed_at IS NULL")
                .fetch_one(&self.pool)
                .await?;

        Ok(count)
    }

    /// Deletes replayed entries.
    ///
    /// ## Returns
    /// Number of deleted entries.
    pub async fn purge_replayed(&self) -> DbResult<u64> {
        let result = sqlx::query("DELETE FROM sync_dead_letters WHERE replayed_at IS NOT NULL")
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected())
    }

    /// Deletes every entry, replayed or not.
    pub async fn clear(&self) -> DbResult<u64> {
        let result = sqlx::query("DELETE FROM sync_dead_letters")
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected())
    }
}

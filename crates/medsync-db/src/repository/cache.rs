//! # Cache Repository
//!
//! Persistent tier of the tiered cache.
//!
//! ```text
//! cache_values                 cache_expiry
//! ┌──────────────┬────────┐    ┌──────────────┬──────────────────────────┐
//! │ key          │ value  │    │ key          │ expires_at (ISO-8601)    │
//! ├──────────────┼────────┤    ├──────────────┼──────────────────────────┤
//! │ medications/1│ {...}  │◄──►│ medications/1│ 2024-06-10T12:00:00Z     │
//! └──────────────┴────────┘    └──────────────┴──────────────────────────┘
//! ```
//!
//! Value and expiry are written in one transaction. Expiry stamps are
//! returned raw: parsing and deciding what is expired is the caller's job.

use chrono::{DateTime, Utc};
use sqlx::{Row, SqlitePool};
use tracing::debug;

use crate::error::{DbError, DbResult};

/// A persisted cache value with its raw expiry stamp, if any.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredCacheValue {
    pub value: String,
    pub expires_at: Option<String>,
}

/// Repository for the `cache_values` and `cache_expiry` tables.
#[derive(Debug, Clone)]
pub struct CacheRepository {
    pool: SqlitePool,
}

impl CacheRepository {
    /// Creates a new CacheRepository.
    pub fn new(pool: SqlitePool) -> Self {
        CacheRepository { pool }
    }

    /// Reads a persisted value together with its expiry stamp.
    pub async fn get_value(&self, key: &str) -> DbResult<Option<StoredCacheValue>> {
        let row = sqlx::query(
            r#"
            SELECT v.value AS value, e.expires_at AS expires_at
            FROM cache_values v
            LEFT JOIN cache_expiry e ON e.key = v.key
            WHERE v.key = ?1
            "#,
        )
        .bind(key)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => Ok(Some(StoredCacheValue {
                value: row.try_get("value")?,
                expires_at: row.try_get("expires_at")?,
            })),
            None => Ok(None),
        }
    }

    /// Writes a value and its expiry atomically.
    pub async fn put(&self, key: &str, value: &str, expires_at: DateTime<Utc>) -> DbResult<()> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| DbError::TransactionFailed(e.to_string()))?;

        sqlx::query(
            r#"
            INSERT INTO cache_values (key, value) VALUES (?1, ?2)
            ON CONFLICT(key) DO UPDATE SET value = excluded.value
            "#,
        )
        .bind(key)
        .bind(value)
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            r#"
            INSERT INTO cache_expiry (key, expires_at) VALUES (?1, ?2)
            ON CONFLICT(key) DO UPDATE SET expires_at = excluded.expires_at
            "#,
        )
        .bind(key)
        .bind(expires_at.to_rfc3339())
        .execute(&mut *tx)
        .await?;

        tx.commit()
            .await
            .map_err(|e| DbError::TransactionFailed(e.to_string()))?;

        Ok(())
    }

    /// Removes a key from both tables.
    pub async fn remove(&self, key: &str) -> DbResult<()> {
        self.remove_many(&[key.to_string()]).await.map(|_| ())
    }

    /// Removes a set of keys from both tables. Returns the number of values
    /// removed.
    pub async fn remove_many(&self, keys: &[String]) -> DbResult<u64> {
        if keys.is_empty() {
            return Ok(0);
        }

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| DbError::TransactionFailed(e.to_string()))?;

        let mut removed = 0;
        for key in keys {
            let result = sqlx::query("DELETE FROM cache_values WHERE key = ?1")
                .bind(key)
                .execute(&mut *tx)
                .await?;
            removed += result.rows_affected();

            sqlx::query("DELETE FROM cache_expiry WHERE key = ?1")
                .bind(key)
                .execute(&mut *tx)
                .await?;
        }

        tx.commit()
            .await
            .map_err(|e| DbError::TransactionFailed(e.to_string()))?;

        debug!(requested = keys.len(), removed, "cache rows removed");
        Ok(removed)
    }

    /// Empties both tables.
    pub async fn clear(&self) -> DbResult<()> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| DbError::TransactionFailed(e.to_string()))?;

        sqlx::query("DELETE FROM cache_values").execute(&mut *tx).await?;
        sqlx::query("DELETE FROM cache_expiry").execute(&mut *tx).await?;

        tx.commit()
            .await
            .map_err(|e| DbError::TransactionFailed(e.to_string()))?;

        Ok(())
    }

    /// Returns the whole expiry side index as (key, raw expiry) pairs.
    pub async fn expiry_index(&self) -> DbResult<Vec<(String, String)>> {
        let rows = sqlx::query("SELECT key, expires_at FROM cache_expiry ORDER BY key ASC")
            .fetch_all(&self.pool)
            .await?;

        rows.iter()
            .map(|row| Ok((row.try_get("key")?, row.try_get("expires_at")?)))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use chrono::{Duration, Utc};

    use crate::{Database, DbConfig};

    #[tokio::test]
    async fn test_put_and_get_value() {
        let db = Database::new(DbConfig::in_memory()).await.unwrap();
        let cache = db.cache();
        let expires = Utc::now() + Duration::hours(1);

        cache.put("medications/1", "{\"name\":\"x\"}", expires).await.unwrap();

        let stored = cache.get_value("medications/1").await.unwrap().unwrap();
        assert_eq!(stored.value, "{\"name\":\"x\"}");
        assert_eq!(stored.expires_at, Some(expires.to_rfc3339()));

        assert!(cache.get_value("missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_remove_many_and_index() {
        let db = Database::new(DbConfig::in_memory()).await.unwrap();
        let cache = db.cache();
        let expires = Utc::now();

        for key in ["a", "b", "c"] {
            cache.put(key, "1", expires).await.unwrap();
        }

        let removed = cache
            .remove_many(&["a".to_string(), "c".to_string(), "zzz".to_string()])
            .await
            .unwrap();
        assert_eq!(removed, 2);

        let index = cache.expiry_index().await.unwrap();
        assert_eq!(index.len(), 1);
        assert_eq!(index[0].0, "b");

        cache.remove("b").await.unwrap();
        assert!(cache.expiry_index().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_clear() {
        let db = Database::new(DbConfig::in_memory()).await.unwrap();
        let cache = db.cache();

        cache.put("a", "1", Utc::now()).await.unwrap();
        cache.clear().await.unwrap();

        assert!(cache.get_value("a").await.unwrap().is_none());
        assert!(cache.expiry_index().await.unwrap().is_empty());
    }
}

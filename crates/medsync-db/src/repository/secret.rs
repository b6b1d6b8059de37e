//! # Secret Repository
//!
//! Named binary key material. Stands in for platform secure storage
//! (keychain / keystore) on development hosts and in tests.

use chrono::Utc;
use sqlx::SqlitePool;

use crate::error::DbResult;

/// Repository for the `secure_keys` table.
#[derive(Debug, Clone)]
pub struct SecretRepository {
    pool: SqlitePool,
}

impl SecretRepository {
    /// Creates a new SecretRepository.
    pub fn new(pool: SqlitePool) -> Self {
        SecretRepository { pool }
    }

    /// Loads the bytes stored under `name`.
    pub async fn load(&self, name: &str) -> DbResult<Option<Vec<u8>>> {
        let value = sqlx::query_scalar::<_, Vec<u8>>("SELECT value FROM secure_keys WHERE name = ?1")
            .bind(name)
            .fetch_optional(&self.pool)
            .await?;

        Ok(value)
    }

    /// Stores `bytes` under `name`, replacing any previous value.
    pub async fn store(&self, name: &str, bytes: &[u8]) -> DbResult<()> {
        sqlx::query(
            r#"
            INSERT INTO secure_keys (name, value, created_at)
            VALUES (?1, ?2, ?3)
            ON CONFLICT(name) DO UPDATE SET value = excluded.value
            "#,
        )
        .bind(name)
        .bind(bytes)
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use crate::{Database, DbConfig};

    #[tokio::test]
    async fn test_store_and_load() {
        let db = Database::new(DbConfig::in_memory()).await.unwrap();
        let secrets = db.secrets();

        assert!(secrets.load("medsync.data_key").await.unwrap().is_none());

        secrets.store("medsync.data_key", &[1, 2, 3]).await.unwrap();
        secrets.store("medsync.data_key", &[4, 5]).await.unwrap();

        assert_eq!(
            secrets.load("medsync.data_key").await.unwrap(),
            Some(vec![4, 5])
        );
    }
}

//! SQLite key store
//!
//! All logical stores share one `key_store(store, key, value)` table.

use async_trait::async_trait;
use sqlx::sqlite::SqlitePoolOptions;
use sqlx::SqlitePool;

use super::{KeyStore, StoreName, StoreResult};

/// Key store backed by a SQLite database
#[derive(Clone)]
pub struct SqliteKeyStore {
    db: SqlitePool,
}

impl SqliteKeyStore {
    /// Open (creating if needed) the database at `db_path` and run migrations
    pub async fn open(db_path: &str) -> StoreResult<Self> {
        let db_url = format!("sqlite:{}?mode=rwc", db_path);
        let db = SqlitePool::connect(&db_url).await?;

        sqlx::query("PRAGMA journal_mode=WAL;").execute(&db).await?;
        sqlx::query("PRAGMA synchronous=NORMAL;").execute(&db).await?;

        Self::from_pool(db).await
    }

    /// Private in-memory database; a single connection keeps it alive
    pub async fn in_memory() -> StoreResult<Self> {
        let db = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await?;
        Self::from_pool(db).await
    }

    /// Wrap an existing pool and make sure the schema is present
    pub async fn from_pool(db: SqlitePool) -> StoreResult<Self> {
        sqlx::migrate!("./migrations").run(&db).await?;
        tracing::info!("Key store ready");
        Ok(Self { db })
    }
}

#[async_trait]
impl KeyStore for SqliteKeyStore {
    async fn get(&self, store: StoreName, key: &str) -> StoreResult<Option<Vec<u8>>> {
        let row = sqlx::query_as::<_, (Vec<u8>,)>(
            r#"SELECT value FROM key_store WHERE store = ? AND key = ?"#,
        )
        .bind(store.as_str())
        .bind(key)
        .fetch_optional(&self.db)
        .await?;

        Ok(row.map(|(value,)| value))
    }

    async fn put(&self, store: StoreName, key: &str, value: &[u8]) -> StoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO key_store (store, key, value, updated_at)
            VALUES (?, ?, ?, CURRENT_TIMESTAMP)
            ON CONFLICT(store, key) DO UPDATE SET
                value = excluded.value,
                updated_at = CURRENT_TIMESTAMP
            "#,
        )
        .bind(store.as_str())
        .bind(key)
        .bind(value)
        .execute(&self.db)
        .await?;

        Ok(())
    }

    async fn delete(&self, store: StoreName, key: &str) -> StoreResult<()> {
        sqlx::query(r#"DELETE FROM key_store WHERE store = ? AND key = ?"#)
            .bind(store.as_str())
            .bind(key)
            .execute(&self.db)
            .await?;

        Ok(())
    }

    async fn list_keys(&self, store: StoreName) -> StoreResult<Vec<String>> {
        let rows = sqlx::query_as::<_, (String,)>(
            r#"SELECT key FROM key_store WHERE store = ? ORDER BY key"#,
        )
        .bind(store.as_str())
        .fetch_all(&self.db)
        .await?;

        Ok(rows.into_iter().map(|(key,)| key).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_sqlite_put_get_overwrite_delete() {
        let store = SqliteKeyStore::in_memory().await.unwrap();

        store.put(StoreName::SignedPreKeys, "1", b"first").await.unwrap();
        store.put(StoreName::SignedPreKeys, "1", b"second").await.unwrap();
        store.put(StoreName::SignedPreKeys, "2", b"other").await.unwrap();
        store.put(StoreName::PreKeys, "1", b"prekey").await.unwrap();

        assert_eq!(
            store.get(StoreName::SignedPreKeys, "1").await.unwrap(),
            Some(b"second".to_vec())
        );
        assert_eq!(
            store.list_keys(StoreName::SignedPreKeys).await.unwrap(),
            vec!["1".to_string(), "2".to_string()]
        );

        store.delete(StoreName::SignedPreKeys, "1").await.unwrap();
        assert!(store.get(StoreName::SignedPreKeys, "1").await.unwrap().is_none());
        assert_eq!(store.list_keys(StoreName::PreKeys).await.unwrap().len(), 1);
    }
}

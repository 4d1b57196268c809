//! Key Store
//!
//! Durable per-kind storage for every record the engine owns. Each logical
//! store is a flat key/value namespace; the managers decide key naming and
//! record encoding. Adapters:
//!
//! - [`MemoryKeyStore`]: process-local, used by tests and ephemeral clients
//! - [`SqliteKeyStore`]: SQLite-backed via sqlx
//!
//! No lock spans more than one call. Invariants across keys (for example
//! prekey id allocation) are upheld by the single manager that owns the kind.

mod memory;
mod sqlite;

pub use memory::MemoryKeyStore;
pub use sqlite::SqliteKeyStore;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;

/// Logical store names
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum StoreName {
    Identity,
    PreKeys,
    SignedPreKeys,
    SenderKeys,
    SenderKeyMeta,
    Sessions,
    /// Engine bookkeeping (id counters, timestamps)
    Metadata,
}

impl StoreName {
    pub fn as_str(&self) -> &'static str {
        match self {
            StoreName::Identity => "identity",
            StoreName::PreKeys => "prekeys",
            StoreName::SignedPreKeys => "signed-prekeys",
            StoreName::SenderKeys => "sender-keys",
            StoreName::SenderKeyMeta => "sender-key-meta",
            StoreName::Sessions => "sessions",
            StoreName::Metadata => "metadata",
        }
    }
}

impl std::fmt::Display for StoreName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Key store failures
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    /// A stored value could not be decoded
    #[error("Corrupt record {store}/{key}: {reason}")]
    Corrupt {
        store: StoreName,
        key: String,
        reason: String,
    },

    #[error("Store unavailable: {0}")]
    Unavailable(String),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Key/value storage scoped per logical store
#[async_trait]
pub trait KeyStore: Send + Sync {
    async fn get(&self, store: StoreName, key: &str) -> StoreResult<Option<Vec<u8>>>;

    async fn put(&self, store: StoreName, key: &str, value: &[u8]) -> StoreResult<()>;

    /// Deleting a missing key is not an error
    async fn delete(&self, store: StoreName, key: &str) -> StoreResult<()>;

    async fn list_keys(&self, store: StoreName) -> StoreResult<Vec<String>>;
}

/// Load and decode a JSON record
pub async fn load_json<T: DeserializeOwned>(
    store: &dyn KeyStore,
    name: StoreName,
    key: &str,
) -> StoreResult<Option<T>> {
    match store.get(name, key).await? {
        Some(bytes) => serde_json::from_slice(&bytes)
            .map(Some)
            .map_err(|e| StoreError::Corrupt {
                store: name,
                key: key.to_string(),
                reason: e.to_string(),
            }),
        None => Ok(None),
    }
}

/// Encode and store a JSON record
pub async fn save_json<T: Serialize + ?Sized>(
    store: &dyn KeyStore,
    name: StoreName,
    key: &str,
    value: &T,
) -> StoreResult<()> {
    let bytes = serde_json::to_vec(value).map_err(|e| StoreError::Corrupt {
        store: name,
        key: key.to_string(),
        reason: e.to_string(),
    })?;
    store.put(name, key, &bytes).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_json_helpers_round_trip_and_flag_corruption() {
        let store = MemoryKeyStore::new();
        save_json(&store, StoreName::Metadata, "next_prekey_id", &42u32).await.unwrap();

        let loaded: Option<u32> = load_json(&store, StoreName::Metadata, "next_prekey_id").await.unwrap();
        assert_eq!(loaded, Some(42));

        store.put(StoreName::Metadata, "broken", b"{not json").await.unwrap();
        let err = load_json::<u32>(&store, StoreName::Metadata, "broken").await.unwrap_err();
        assert!(matches!(err, StoreError::Corrupt { store: StoreName::Metadata, .. }));
    }
}

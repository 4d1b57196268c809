//! In-memory key store

use std::collections::BTreeMap;

use async_trait::async_trait;
use tokio::sync::RwLock;

use super::{KeyStore, StoreName, StoreResult};

/// Process-local key store; contents are lost on drop
#[derive(Default)]
pub struct MemoryKeyStore {
    records: RwLock<BTreeMap<(StoreName, String), Vec<u8>>>,
}

impl MemoryKeyStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl KeyStore for MemoryKeyStore {
    async fn get(&self, store: StoreName, key: &str) -> StoreResult<Option<Vec<u8>>> {
        let records = self.records.read().await;
        Ok(records.get(&(store, key.to_string())).cloned())
    }

    async fn put(&self, store: StoreName, key: &str, value: &[u8]) -> StoreResult<()> {
        let mut records = self.records.write().await;
        records.insert((store, key.to_string()), value.to_vec());
        Ok(())
    }

    async fn delete(&self, store: StoreName, key: &str) -> StoreResult<()> {
        let mut records = self.records.write().await;
        records.remove(&(store, key.to_string()));
        Ok(())
    }

    async fn list_keys(&self, store: StoreName) -> StoreResult<Vec<String>> {
        let records = self.records.read().await;
        Ok(records
            .keys()
            .filter(|(name, _)| *name == store)
            .map(|(_, key)| key.clone())
            .collect())
    }
}

//! Sender Key Manager (group encryption)
//!
//! One sender key per (group, sender address). Key state lives in the
//! `sender-keys` store and rotation metadata in `sender-key-meta`, both under
//! the same record key.
//!
//! Rotation policy: a sender key is due when it is at least
//! `sender_key_max_age` old or has carried `sender_key_max_messages` messages,
//! whichever comes first. Only our own sender keys are ever rotated.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::api::KeyServer;
use crate::config::EngineConfig;
use crate::crypto::SenderKeyRecord;
use crate::engine::health::{HealthRegistry, HealthStatus};
use crate::error::EngineResult;
use crate::models::{ProtocolAddress, SenderKeyRotation};
use crate::store::{load_json, save_json, KeyStore, StoreName};

/// Rotation bookkeeping for one sender key
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RotationMetadata {
    pub group_id: String,
    pub sender: String,
    pub created_at: DateTime<Utc>,
    pub last_rotation: DateTime<Utc>,
    /// Messages carried since the last rotation
    pub message_count: u64,
    /// The server has not acknowledged the last rotation yet
    #[serde(default)]
    pub distribution_pending: bool,
}

impl RotationMetadata {
    fn fresh(group_id: &str, sender: &ProtocolAddress) -> Self {
        let now = Utc::now();
        Self {
            group_id: group_id.to_string(),
            sender: sender.to_string(),
            created_at: now,
            last_rotation: now,
            message_count: 0,
            distribution_pending: false,
        }
    }

    /// Whether the age or usage threshold has been reached
    pub fn is_due(&self, now: DateTime<Utc>, config: &EngineConfig) -> bool {
        now - self.last_rotation >= Duration::seconds(config.sender_key_max_age)
            || self.message_count >= config.sender_key_max_messages
    }
}

fn record_key(group_id: &str, sender: &ProtocolAddress) -> String {
    format!(
        "{}::{}",
        urlencoding::encode(group_id),
        urlencoding::encode(&sender.to_string())
    )
}

pub struct SenderKeyManager {
    store: Arc<dyn KeyStore>,
    server: Arc<dyn KeyServer>,
    health: Arc<HealthRegistry>,
    config: EngineConfig,
}

impl SenderKeyManager {
    pub fn new(
        store: Arc<dyn KeyStore>,
        server: Arc<dyn KeyServer>,
        health: Arc<HealthRegistry>,
        config: EngineConfig,
    ) -> Self {
        Self {
            store,
            server,
            health,
            config,
        }
    }

    /// Cipher handle for (group, sender); state is created on first use
    pub fn get_cipher(&self, group_id: &str, sender: &ProtocolAddress) -> GroupCipher<'_> {
        GroupCipher {
            manager: self,
            group_id: group_id.to_string(),
            sender: sender.clone(),
        }
    }

    /// Stored sender key, or an empty record if there is none
    pub async fn load(&self, group_id: &str, sender: &ProtocolAddress) -> EngineResult<SenderKeyRecord> {
        match self
            .store
            .get(StoreName::SenderKeys, &record_key(group_id, sender))
            .await?
        {
            Some(bytes) => Ok(SenderKeyRecord::from_bytes(&bytes)?),
            None => Ok(SenderKeyRecord::empty()),
        }
    }

    async fn save(&self, group_id: &str, sender: &ProtocolAddress, record: &SenderKeyRecord) -> EngineResult<()> {
        self.store
            .put(StoreName::SenderKeys, &record_key(group_id, sender), &record.to_bytes()?)
            .await?;
        Ok(())
    }

    pub async fn metadata(
        &self,
        group_id: &str,
        sender: &ProtocolAddress,
    ) -> EngineResult<Option<RotationMetadata>> {
        Ok(load_json(self.store.as_ref(), StoreName::SenderKeyMeta, &record_key(group_id, sender)).await?)
    }

    pub(crate) async fn save_metadata(&self, meta: &RotationMetadata) -> EngineResult<()> {
        let sender = ProtocolAddress::parse(&meta.sender)?;
        Ok(save_json(
            self.store.as_ref(),
            StoreName::SenderKeyMeta,
            &record_key(&meta.group_id, &sender),
            meta,
        )
        .await?)
    }

    async fn all_metadata(&self) -> EngineResult<Vec<RotationMetadata>> {
        let mut metas = Vec::new();
        for key in self.store.list_keys(StoreName::SenderKeyMeta).await? {
            match load_json::<RotationMetadata>(self.store.as_ref(), StoreName::SenderKeyMeta, &key).await {
                Ok(Some(meta)) => metas.push(meta),
                Ok(None) => {}
                Err(e) => tracing::warn!(key = %key, "Skipping unreadable sender key metadata: {}", e),
            }
        }
        Ok(metas)
    }

    /// Whether our sender key for the group is due for rotation
    pub async fn should_rotate(&self, group_id: &str, sender: &ProtocolAddress) -> EngineResult<bool> {
        Ok(self
            .metadata(group_id, sender)
            .await?
            .is_some_and(|meta| meta.is_due(Utc::now(), &self.config)))
    }

    /// Replace our sender key for the group and reset its metadata
    ///
    /// The server notification is best effort: on failure the local rotation
    /// stands and the metadata is flagged so `check_all` retries the notice.
    pub async fn rotate(&self, group_id: &str, sender: &ProtocolAddress) -> EngineResult<SenderKeyRecord> {
        let record = SenderKeyRecord::generate();
        self.save(group_id, sender, &record).await?;

        let mut meta = RotationMetadata::fresh(group_id, sender);
        meta.distribution_pending = !self.notify_rotation(group_id, sender).await;
        self.save_metadata(&meta).await?;

        tracing::info!(
            group_id,
            sender = %sender,
            pending = meta.distribution_pending,
            "Rotated sender key"
        );
        self.health.sender_keys.update(|state| state.last_rotation = Some(Utc::now()));
        self.refresh_health().await?;
        Ok(record)
    }

    async fn notify_rotation(&self, group_id: &str, sender: &ProtocolAddress) -> bool {
        let notice = SenderKeyRotation {
            group_id: group_id.to_string(),
            address: sender.to_string(),
        };
        match self.server.notify_sender_key_rotation(&notice).await {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!(group_id, "Sender key rotation notice failed: {}", e);
                false
            }
        }
    }

    /// Rotate every due sender key of ours and retry pending notices
    ///
    /// Returns, per known group, whether our key was rotated.
    pub async fn check_all(&self, self_address: &ProtocolAddress) -> EngineResult<HashMap<String, bool>> {
        let Some(_running) = self.health.sender_keys.try_begin() else {
            tracing::debug!("Sender key check already running; skipping");
            return Ok(HashMap::new());
        };

        let result = self.check_all_inner(self_address).await;
        match &result {
            Ok(_) => self.health.sender_keys.update(|state| state.rotation_needed = false),
            Err(e) => self.health.sender_keys.mark_error(e),
        }
        result
    }

    async fn check_all_inner(&self, self_address: &ProtocolAddress) -> EngineResult<HashMap<String, bool>> {
        let now = Utc::now();
        let own = self_address.to_string();
        let mut rotated = HashMap::new();

        for mut meta in self.all_metadata().await? {
            if meta.sender != own {
                rotated.entry(meta.group_id).or_insert(false);
                continue;
            }

            if meta.is_due(now, &self.config) {
                self.rotate(&meta.group_id, self_address).await?;
                rotated.insert(meta.group_id, true);
                continue;
            }

            if meta.distribution_pending && self.notify_rotation(&meta.group_id, self_address).await {
                meta.distribution_pending = false;
                self.save_metadata(&meta).await?;
                tracing::info!(group_id = %meta.group_id, "Delivered pending sender key rotation notice");
            }
            rotated.entry(meta.group_id).or_insert(false);
        }

        let count = rotated.values().filter(|r| **r).count();
        if count > 0 {
            tracing::info!(rotated = count, "Sender key rotation pass complete");
        }
        self.refresh_health().await?;
        Ok(rotated)
    }

    /// Count a message carried by this sender key; returns the new count
    pub async fn increment_usage(&self, group_id: &str, sender: &ProtocolAddress) -> EngineResult<u64> {
        let mut meta = self
            .metadata(group_id, sender)
            .await?
            .unwrap_or_else(|| RotationMetadata::fresh(group_id, sender));
        meta.message_count += 1;
        self.save_metadata(&meta).await?;
        Ok(meta.message_count)
    }

    /// Delete one sender's key for a group
    pub async fn remove(&self, group_id: &str, sender: &ProtocolAddress) -> EngineResult<()> {
        let key = record_key(group_id, sender);
        self.store.delete(StoreName::SenderKeys, &key).await?;
        self.store.delete(StoreName::SenderKeyMeta, &key).await?;
        tracing::info!(group_id, sender = %sender, "Removed sender key");
        self.refresh_health().await
    }

    /// Delete every sender key of a group
    pub async fn clear_group(&self, group_id: &str) -> EngineResult<usize> {
        let mut removed = 0;
        for meta in self.all_metadata().await? {
            if meta.group_id == group_id {
                let sender = ProtocolAddress::parse(&meta.sender)?;
                let key = record_key(group_id, &sender);
                self.store.delete(StoreName::SenderKeys, &key).await?;
                self.store.delete(StoreName::SenderKeyMeta, &key).await?;
                removed += 1;
            }
        }
        tracing::info!(group_id, removed, "Cleared group sender keys");
        self.refresh_health().await?;
        Ok(removed)
    }

    /// Delete every sender key of every group
    pub async fn clear_all(&self) -> EngineResult<()> {
        for store in [StoreName::SenderKeys, StoreName::SenderKeyMeta] {
            for key in self.store.list_keys(store).await? {
                self.store.delete(store, &key).await?;
            }
        }
        tracing::warn!("Cleared all sender keys");
        self.health.sender_keys.update(|state| {
            state.count = 0;
            state.rotation_needed = false;
            state.status = HealthStatus::Healthy;
            state.last_check = Some(Utc::now());
            state.last_error = None;
        });
        Ok(())
    }

    /// Number of groups we hold any sender key for
    pub async fn group_count(&self) -> EngineResult<usize> {
        let groups: BTreeSet<String> = self
            .all_metadata()
            .await?
            .into_iter()
            .map(|meta| meta.group_id)
            .collect();
        Ok(groups.len())
    }

    pub async fn refresh_health(&self) -> EngineResult<()> {
        let count = self.group_count().await? as u64;
        self.health.sender_keys.mark_checked(count, HealthStatus::Healthy);
        Ok(())
    }
}

/// Stateless cipher handle for one (group, sender) sender key
pub struct GroupCipher<'a> {
    manager: &'a SenderKeyManager,
    group_id: String,
    sender: ProtocolAddress,
}

impl GroupCipher<'_> {
    /// Encrypt with our sender key, creating it on first use
    pub async fn encrypt(&self, plaintext: &[u8]) -> EngineResult<Vec<u8>> {
        let manager = self.manager;
        let mut record = manager.load(&self.group_id, &self.sender).await?;
        let created = !record.can_encrypt();

        let ciphertext = record.encrypt(plaintext)?;
        manager.save(&self.group_id, &self.sender, &record).await?;
        if created {
            // A fresh key starts a fresh rotation window
            manager
                .save_metadata(&RotationMetadata::fresh(&self.group_id, &self.sender))
                .await?;
            tracing::info!(group_id = %self.group_id, "Created sender key");
            manager.refresh_health().await?;
        }

        manager.increment_usage(&self.group_id, &self.sender).await?;
        if manager.should_rotate(&self.group_id, &self.sender).await? {
            manager
                .health
                .sender_keys
                .update(|state| state.rotation_needed = true);
        }
        Ok(ciphertext)
    }

    pub async fn decrypt(&self, ciphertext: &[u8]) -> EngineResult<Vec<u8>> {
        let manager = self.manager;
        let mut record = manager.load(&self.group_id, &self.sender).await?;
        let plaintext = record.decrypt(ciphertext)?;
        manager.save(&self.group_id, &self.sender, &record).await?;
        manager.increment_usage(&self.group_id, &self.sender).await?;
        Ok(plaintext)
    }

    /// Distribution message for our sender key, to be sent pairwise to members
    pub async fn distribution_message(&self) -> EngineResult<Vec<u8>> {
        let manager = self.manager;
        let mut record = manager.load(&self.group_id, &self.sender).await?;
        if !record.can_encrypt() {
            record = SenderKeyRecord::generate();
            manager.save(&self.group_id, &self.sender, &record).await?;
            manager
                .save_metadata(&RotationMetadata::fresh(&self.group_id, &self.sender))
                .await?;
            manager.refresh_health().await?;
        }
        Ok(record.distribution_message()?)
    }

    /// Install a member's sender key from their distribution message
    pub async fn process_distribution(&self, message: &[u8]) -> EngineResult<()> {
        let manager = self.manager;
        let record = SenderKeyRecord::from_distribution(message)?;
        manager.save(&self.group_id, &self.sender, &record).await?;
        manager
            .save_metadata(&RotationMetadata::fresh(&self.group_id, &self.sender))
            .await?;
        tracing::info!(group_id = %self.group_id, sender = %self.sender, "Installed sender key");
        manager.refresh_health().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::testing::FakeKeyServer;
    use crate::store::MemoryKeyStore;

    fn manager(server: Arc<FakeKeyServer>) -> SenderKeyManager {
        SenderKeyManager::new(
            Arc::new(MemoryKeyStore::new()),
            server,
            Arc::new(HealthRegistry::new()),
            EngineConfig::default(),
        )
    }

    fn me() -> ProtocolAddress {
        ProtocolAddress::new("alice", 1)
    }

    #[tokio::test]
    async fn test_missing_sender_key_loads_empty() {
        let skm = manager(FakeKeyServer::new());
        let record = skm.load("group-1", &me()).await.unwrap();
        assert!(record.is_empty());
        assert!(!skm.should_rotate("group-1", &me()).await.unwrap());
    }

    #[tokio::test]
    async fn test_rotation_policy_thresholds() {
        let skm = manager(FakeKeyServer::new());
        skm.get_cipher("group-1", &me()).encrypt(b"hello").await.unwrap();

        let mut meta = skm.metadata("group-1", &me()).await.unwrap().unwrap();
        assert_eq!(meta.message_count, 1);

        meta.message_count = 999;
        meta.last_rotation = Utc::now() - Duration::hours(1);
        skm.save_metadata(&meta).await.unwrap();
        assert!(!skm.should_rotate("group-1", &me()).await.unwrap());

        meta.message_count = 1000;
        skm.save_metadata(&meta).await.unwrap();
        assert!(skm.should_rotate("group-1", &me()).await.unwrap());

        meta.message_count = 0;
        meta.last_rotation = Utc::now() - Duration::days(7);
        skm.save_metadata(&meta).await.unwrap();
        assert!(skm.should_rotate("group-1", &me()).await.unwrap());

        let before = Utc::now();
        skm.rotate("group-1", &me()).await.unwrap();
        let meta = skm.metadata("group-1", &me()).await.unwrap().unwrap();
        assert_eq!(meta.message_count, 0);
        assert!(meta.last_rotation >= before);
        assert!(!skm.should_rotate("group-1", &me()).await.unwrap());
    }

    #[tokio::test]
    async fn test_usage_threshold_raises_rotation_signal() {
        let skm = manager(FakeKeyServer::new());
        let cipher = skm.get_cipher("group-1", &me());
        cipher.encrypt(b"first").await.unwrap();

        let mut meta = skm.metadata("group-1", &me()).await.unwrap().unwrap();
        meta.message_count = 998;
        skm.save_metadata(&meta).await.unwrap();

        let mut rx = skm.health.sender_keys.subscribe();
        cipher.encrypt(b"999th").await.unwrap();
        assert!(!rx.borrow_and_update().rotation_needed);
        cipher.encrypt(b"1000th").await.unwrap();
        assert!(rx.borrow_and_update().rotation_needed);
    }

    #[tokio::test]
    async fn test_failed_notice_still_rotates_and_is_retried() {
        let server = FakeKeyServer::new();
        let skm = manager(server.clone());
        let cipher = skm.get_cipher("group-1", &me());
        let old_ciphertext = cipher.encrypt(b"before").await.unwrap();

        server.fail_rotation(true);
        skm.rotate("group-1", &me()).await.unwrap();
        let meta = skm.metadata("group-1", &me()).await.unwrap().unwrap();
        assert!(meta.distribution_pending);
        assert!(server.rotations().is_empty());

        // The new key cannot read messages sealed with the old one
        assert!(cipher.decrypt(&old_ciphertext).await.is_err());

        server.fail_rotation(false);
        let rotated = skm.check_all(&me()).await.unwrap();
        assert_eq!(rotated.get("group-1"), Some(&false));
        assert_eq!(server.rotations().len(), 1);
        assert_eq!(server.rotations()[0].address, "alice.1");
        assert!(!skm.metadata("group-1", &me()).await.unwrap().unwrap().distribution_pending);
    }

    #[tokio::test]
    async fn test_check_all_rotates_only_due_own_keys() {
        let server = FakeKeyServer::new();
        let skm = manager(server.clone());
        let bob = ProtocolAddress::new("bob", 1);

        skm.get_cipher("due", &me()).encrypt(b"x").await.unwrap();
        skm.get_cipher("fresh", &me()).encrypt(b"x").await.unwrap();
        let bob_key = SenderKeyRecord::generate();
        skm.get_cipher("theirs", &bob)
            .process_distribution(&bob_key.distribution_message().unwrap())
            .await
            .unwrap();

        let mut meta = skm.metadata("due", &me()).await.unwrap().unwrap();
        meta.message_count = 1000;
        skm.save_metadata(&meta).await.unwrap();
        let mut meta = skm.metadata("theirs", &bob).await.unwrap().unwrap();
        meta.message_count = 5000;
        skm.save_metadata(&meta).await.unwrap();

        let rotated = skm.check_all(&me()).await.unwrap();
        assert_eq!(rotated.len(), 3);
        assert!(rotated["due"]);
        assert!(!rotated["fresh"]);
        assert!(!rotated["theirs"]);
        assert_eq!(server.rotations().len(), 1);
        assert_eq!(server.rotations()[0].group_id, "due");
    }

    #[tokio::test]
    async fn test_distribution_round_trip_between_members() {
        let alice = manager(FakeKeyServer::new());
        let bob = manager(FakeKeyServer::new());

        let distribution = alice
            .get_cipher("group-1", &me())
            .distribution_message()
            .await
            .unwrap();
        bob.get_cipher("group-1", &me())
            .process_distribution(&distribution)
            .await
            .unwrap();

        let ciphertext = alice.get_cipher("group-1", &me()).encrypt(b"hi all").await.unwrap();
        let plaintext = bob.get_cipher("group-1", &me()).decrypt(&ciphertext).await.unwrap();
        assert_eq!(plaintext, b"hi all");
        assert_eq!(bob.metadata("group-1", &me()).await.unwrap().unwrap().message_count, 1);
    }

    #[tokio::test]
    async fn test_remove_clear_group_and_clear_all() {
        let skm = manager(FakeKeyServer::new());
        let bob = ProtocolAddress::new("bob", 1);
        let bob_key = SenderKeyRecord::generate().distribution_message().unwrap();

        for group in ["g1", "g2"] {
            skm.get_cipher(group, &me()).encrypt(b"x").await.unwrap();
            skm.get_cipher(group, &bob).process_distribution(&bob_key).await.unwrap();
        }
        assert_eq!(skm.group_count().await.unwrap(), 2);

        skm.remove("g1", &bob).await.unwrap();
        assert!(skm.load("g1", &bob).await.unwrap().is_empty());
        assert!(!skm.load("g1", &me()).await.unwrap().is_empty());

        assert_eq!(skm.clear_group("g1").await.unwrap(), 1);
        assert_eq!(skm.group_count().await.unwrap(), 1);
        assert_eq!(skm.health.sender_keys.snapshot().count, 1);

        skm.clear_all().await.unwrap();
        assert!(skm.load("g2", &me()).await.unwrap().is_empty());
        assert!(skm.load("g2", &bob).await.unwrap().is_empty());
        assert_eq!(skm.group_count().await.unwrap(), 0);
        assert_eq!(skm.health.sender_keys.snapshot().count, 0);
    }

    #[test]
    fn test_record_keys_are_unambiguous() {
        let a = record_key("a::b", &ProtocolAddress::new("c", 1));
        let b = record_key("a", &ProtocolAddress::new("b::c", 1));
        assert_ne!(a, b);
    }
}

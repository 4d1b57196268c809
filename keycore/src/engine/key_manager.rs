//! Key Manager
//!
//! Owns the identity key, the one-time prekey pool and signed prekey
//! rotation. It is the only component that allocates prekey ids or replaces
//! the identity, so the per-kind invariants hold by construction:
//!
//! - **Identity**: exactly one record under [`IDENTITY_KEY`]; only
//!   [`KeyManager::regenerate_identity`] changes its fingerprint
//! - **Prekeys**: ids come from a persisted counter and are never reused
//! - **Signed prekeys**: one current id in metadata; superseded records stay
//!   loadable until they age past the retention window

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::Utc;

use crate::config::EngineConfig;
use crate::crypto::{
    self, IdentityKeyPair, IdentityKeyRecord, PreKeyBundle, PreKeyRecord, SignedPreKeyRecord,
};
use crate::engine::health::{HealthRegistry, HealthStatus};
use crate::error::{EngineError, EngineResult};
use crate::store::{load_json, save_json, KeyStore, StoreName};

/// Key of the single identity record
pub const IDENTITY_KEY: &str = "local";

const NEXT_PREKEY_ID: &str = "next_prekey_id";
const NEXT_SIGNED_PREKEY_ID: &str = "next_signed_prekey_id";
const CURRENT_SIGNED_PREKEY_ID: &str = "current_signed_prekey_id";
/// Fingerprint of the identity the stored prekey pool was generated under
const PREKEY_POOL_IDENTITY: &str = "prekey_pool_identity";

/// How the identity returned by [`KeyManager::ensure_identity`] came to be
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IdentityOrigin {
    /// Read back from the store
    Loaded,
    /// First run; nothing was stored
    Generated,
    /// The stored record was unreadable and has been regenerated
    Replaced { reason: String },
}

#[derive(Debug, Clone)]
pub struct EnsuredIdentity {
    pub record: IdentityKeyRecord,
    pub origin: IdentityOrigin,
}

/// Result of a prekey pool check
#[derive(Debug)]
pub enum PoolOutcome {
    /// At or above the low-water mark; nothing generated
    Healthy { count: u32 },
    /// A batch was generated to bring the pool back to target
    Refilled { batch: Vec<PreKeyRecord> },
    /// The pool belonged to a superseded identity and was regenerated whole
    Replaced { batch: Vec<PreKeyRecord> },
    /// Another check was already running
    Skipped,
}

pub struct KeyManager {
    store: Arc<dyn KeyStore>,
    health: Arc<HealthRegistry>,
    config: EngineConfig,
    invalidated: AtomicBool,
}

impl KeyManager {
    pub fn new(store: Arc<dyn KeyStore>, health: Arc<HealthRegistry>, config: EngineConfig) -> Self {
        Self {
            store,
            health,
            config,
            invalidated: AtomicBool::new(false),
        }
    }

    // ========================================================================
    // Identity
    // ========================================================================

    /// Load the identity, generating it on first run
    ///
    /// A stored record that cannot be decoded is replaced through
    /// [`regenerate_identity`](Self::regenerate_identity), so dependent state
    /// is invalidated the same way as for an explicit regeneration.
    pub async fn ensure_identity(&self) -> EngineResult<EnsuredIdentity> {
        let stored = self
            .store
            .get(StoreName::Identity, IDENTITY_KEY)
            .await
            .map_err(|e| EngineError::KeyGeneration(format!("Identity store unavailable: {}", e)))?;

        match stored {
            Some(bytes) => match decode_identity(&bytes) {
                Ok(record) => {
                    self.publish_identity(&record, false);
                    Ok(EnsuredIdentity {
                        record,
                        origin: IdentityOrigin::Loaded,
                    })
                }
                Err(reason) => {
                    tracing::error!("Stored identity key is corrupted: {}", reason);
                    let record = self.regenerate_identity().await?;
                    Ok(EnsuredIdentity {
                        record,
                        origin: IdentityOrigin::Replaced { reason },
                    })
                }
            },
            None => {
                let record = crypto::generate_identity_keypair();
                self.save_identity(&record).await?;
                tracing::info!(
                    fingerprint = %record.fingerprint(),
                    registration_id = record.registration_id,
                    "Generated new identity key"
                );
                self.publish_identity(&record, false);
                Ok(EnsuredIdentity {
                    record,
                    origin: IdentityOrigin::Generated,
                })
            }
        }
    }

    /// Current identity record
    pub async fn identity(&self) -> EngineResult<IdentityKeyRecord> {
        let bytes = self
            .store
            .get(StoreName::Identity, IDENTITY_KEY)
            .await?
            .ok_or(EngineError::NotLoggedIn)?;
        decode_identity(&bytes).map_err(EngineError::IdentityCorrupted)
    }

    pub async fn identity_key_pair(&self) -> EngineResult<IdentityKeyPair> {
        Ok(self.identity().await?.key_pair()?)
    }

    /// Replace the identity key pair and registration id
    ///
    /// Destructive. Keys stay marked invalidated until the dependent-state
    /// cascade calls [`clear_invalidated`](Self::clear_invalidated).
    pub async fn regenerate_identity(&self) -> EngineResult<IdentityKeyRecord> {
        let _running = self.health.identity.try_begin().ok_or_else(|| {
            EngineError::KeysInvalidated("Identity regeneration already in progress".to_string())
        })?;

        let was_invalidated = self.invalidated.swap(true, Ordering::AcqRel);

        let record = crypto::generate_identity_keypair();
        if let Err(e) = self.save_identity(&record).await {
            // The old identity is still the stored one
            self.invalidated.store(was_invalidated, Ordering::Release);
            self.health.identity.mark_error(&e);
            return Err(e);
        }

        tracing::warn!(
            fingerprint = %record.fingerprint(),
            registration_id = record.registration_id,
            "Identity key regenerated"
        );
        self.publish_identity(&record, true);
        Ok(record)
    }

    /// Generation counter of the identity; bumped by each regeneration
    pub fn identity_generation(&self) -> u64 {
        self.health.identity.snapshot().generation
    }

    async fn save_identity(&self, record: &IdentityKeyRecord) -> EngineResult<()> {
        save_json(self.store.as_ref(), StoreName::Identity, IDENTITY_KEY, record)
            .await
            .map_err(|e| EngineError::KeyGeneration(format!("Failed to store identity key: {}", e)))
    }

    fn publish_identity(&self, record: &IdentityKeyRecord, replaced: bool) {
        let fingerprint = record.fingerprint();
        self.health.identity.update(|state| {
            state.count = 1;
            state.status = HealthStatus::Healthy;
            state.last_check = Some(Utc::now());
            state.last_error = None;
            state.fingerprint = Some(fingerprint);
            if replaced {
                state.generation += 1;
                state.last_rotation = Some(Utc::now());
            }
        });
    }

    // ========================================================================
    // Invalidation
    // ========================================================================

    pub fn is_invalidated(&self) -> bool {
        self.invalidated.load(Ordering::Acquire)
    }

    /// Refuse to hand out key material while the identity is being replaced
    pub fn ensure_usable(&self) -> EngineResult<()> {
        if self.is_invalidated() {
            return Err(EngineError::KeysInvalidated(
                "Identity key replacement in progress".to_string(),
            ));
        }
        Ok(())
    }

    pub fn clear_invalidated(&self) {
        self.invalidated.store(false, Ordering::Release);
    }

    // ========================================================================
    // One-time prekeys
    // ========================================================================

    /// Generate and store `count` prekeys with ids `start_id..start_id + count`
    ///
    /// The caller picks the range and must not overlap existing ids;
    /// [`check_prekey_pool`](Self::check_prekey_pool) uses the persisted
    /// counter for that.
    pub async fn generate_prekeys(&self, start_id: u32, count: u32) -> EngineResult<Vec<PreKeyRecord>> {
        let batch = crypto::generate_prekeys(start_id, count);
        for record in &batch {
            save_json(
                self.store.as_ref(),
                StoreName::PreKeys,
                &record.key_id.to_string(),
                record,
            )
            .await?;
        }

        let next = start_id.saturating_add(count);
        let stored_next = self.load_counter(NEXT_PREKEY_ID).await?.unwrap_or(1);
        if next > stored_next {
            self.save_counter(NEXT_PREKEY_ID, next).await?;
        }
        if self.pool_identity().await?.is_none() {
            if let Ok(identity) = self.identity().await {
                self.save_pool_identity(&identity.fingerprint()).await?;
            }
        }

        tracing::info!(start_id, count, "Generated prekeys");
        self.refresh_pool_health().await?;
        Ok(batch)
    }

    /// Refill the pool to the target size when it drops below the low-water mark
    pub async fn check_prekey_pool(&self) -> EngineResult<PoolOutcome> {
        let Some(_running) = self.health.prekeys.try_begin() else {
            tracing::debug!("Prekey pool check already running; skipping");
            return Ok(PoolOutcome::Skipped);
        };

        let result = self.refill_pool().await;
        if let Err(e) = &result {
            self.health.prekeys.mark_error(e);
        }
        result
    }

    async fn refill_pool(&self) -> EngineResult<PoolOutcome> {
        let identity = self.identity().await?.fingerprint();
        match self.pool_identity().await? {
            Some(owner) if owner != identity => {
                tracing::warn!("Prekey pool belongs to a superseded identity; replacing");
                let batch = self.replace_pool(&identity).await?;
                return Ok(PoolOutcome::Replaced { batch });
            }
            Some(_) => {}
            None => self.save_pool_identity(&identity).await?,
        }

        let ids = self.prekey_ids().await?;
        let count = ids.len() as u32;

        if count >= self.config.prekey_low_water {
            self.health
                .prekeys
                .mark_checked(count as u64, HealthStatus::Healthy);
            return Ok(PoolOutcome::Healthy { count });
        }

        let start = self.next_prekey_id(&ids).await?;
        let needed = self.config.prekey_pool_target.saturating_sub(count);
        tracing::info!(count, needed, start, "Prekey pool below low-water mark; refilling");

        let batch = self.generate_prekeys(start, needed).await?;
        Ok(PoolOutcome::Refilled { batch })
    }

    /// Drop every prekey and generate a full pool with fresh ids
    ///
    /// Waits for a pool check already in flight instead of skipping.
    pub async fn replace_prekey_pool(&self) -> EngineResult<Vec<PreKeyRecord>> {
        let _running = self.health.prekeys.begin().await;

        let result: EngineResult<Vec<PreKeyRecord>> = async {
            let identity = self.identity().await?.fingerprint();
            self.replace_pool(&identity).await
        }
        .await;

        if let Err(e) = &result {
            self.health.prekeys.mark_error(e);
        }
        result
    }

    async fn replace_pool(&self, identity: &str) -> EngineResult<Vec<PreKeyRecord>> {
        let ids = self.prekey_ids().await?;
        let start = self.next_prekey_id(&ids).await?;
        for id in &ids {
            self.store.delete(StoreName::PreKeys, &id.to_string()).await?;
        }
        tracing::info!(removed = ids.len(), start, "Replacing prekey pool");
        let batch = self.generate_prekeys(start, self.config.prekey_pool_target).await?;
        // Recorded last: a failure above leaves the pool marked stale
        self.save_pool_identity(identity).await?;
        Ok(batch)
    }

    async fn pool_identity(&self) -> EngineResult<Option<String>> {
        Ok(load_json(self.store.as_ref(), StoreName::Metadata, PREKEY_POOL_IDENTITY).await?)
    }

    async fn save_pool_identity(&self, identity: &str) -> EngineResult<()> {
        Ok(save_json(self.store.as_ref(), StoreName::Metadata, PREKEY_POOL_IDENTITY, &identity).await?)
    }

    /// Sorted ids of every stored prekey
    pub async fn prekey_ids(&self) -> EngineResult<Vec<u32>> {
        let mut ids: Vec<u32> = self
            .store
            .list_keys(StoreName::PreKeys)
            .await?
            .iter()
            .filter_map(|key| key.parse().ok())
            .collect();
        ids.sort_unstable();
        Ok(ids)
    }

    /// Every stored prekey, ordered by id
    pub async fn prekey_records(&self) -> EngineResult<Vec<PreKeyRecord>> {
        let mut records = Vec::new();
        for id in self.prekey_ids().await? {
            if let Some(record) = self.load_prekey(id).await? {
                records.push(record);
            }
        }
        Ok(records)
    }

    pub async fn load_prekey(&self, id: u32) -> EngineResult<Option<PreKeyRecord>> {
        Ok(load_json(self.store.as_ref(), StoreName::PreKeys, &id.to_string()).await?)
    }

    /// Delete a prekey that has been used to establish a session
    pub async fn consume_prekey(&self, id: u32) -> EngineResult<()> {
        self.store.delete(StoreName::PreKeys, &id.to_string()).await?;
        tracing::debug!(key_id = id, "Consumed one-time prekey");
        self.refresh_pool_health().await
    }

    /// Publish the current pool size; the pool observer reacts to it
    pub async fn refresh_pool_health(&self) -> EngineResult<()> {
        let count = self.store.list_keys(StoreName::PreKeys).await?.len() as u64;
        let status = if count >= self.config.prekey_low_water as u64 {
            HealthStatus::Healthy
        } else {
            HealthStatus::Degraded
        };
        self.health.prekeys.mark_checked(count, status);
        Ok(())
    }

    /// First id above both the counter and everything stored
    async fn next_prekey_id(&self, existing: &[u32]) -> EngineResult<u32> {
        let counter = self.load_counter(NEXT_PREKEY_ID).await?.unwrap_or(1);
        let above_existing = existing.iter().max().map_or(1, |max| max + 1);
        Ok(counter.max(above_existing).max(1))
    }

    // ========================================================================
    // Signed prekeys
    // ========================================================================

    /// Generate, sign and store a signed prekey under `key_id`; it becomes current
    ///
    /// Earlier signed prekeys are kept so in-flight handshakes still complete.
    pub async fn rotate_signed_prekey(&self, key_id: u32) -> EngineResult<SignedPreKeyRecord> {
        let result = self.rotate_signed_prekey_inner(key_id).await;
        if let Err(e) = &result {
            self.health.signed_prekey.mark_error(e);
        }
        result
    }

    async fn rotate_signed_prekey_inner(&self, key_id: u32) -> EngineResult<SignedPreKeyRecord> {
        let identity = self.identity_key_pair().await?;
        let record = crypto::generate_signed_prekey(&identity, key_id);

        save_json(
            self.store.as_ref(),
            StoreName::SignedPreKeys,
            &key_id.to_string(),
            &record,
        )
        .await?;
        self.save_counter(CURRENT_SIGNED_PREKEY_ID, key_id).await?;
        let stored_next = self.load_counter(NEXT_SIGNED_PREKEY_ID).await?.unwrap_or(1);
        if key_id >= stored_next {
            self.save_counter(NEXT_SIGNED_PREKEY_ID, key_id.saturating_add(1)).await?;
        }

        tracing::info!(key_id, "Rotated signed prekey");

        let count = self.store.list_keys(StoreName::SignedPreKeys).await?.len() as u64;
        let fingerprint = crypto::fingerprint(&record.public_key);
        self.health.signed_prekey.update(|state| {
            state.count = count;
            state.status = HealthStatus::Healthy;
            state.last_check = Some(Utc::now());
            state.last_rotation = Some(Utc::now());
            state.last_error = None;
            state.fingerprint = Some(fingerprint);
        });
        Ok(record)
    }

    /// Rotate when there is no current signed prekey, it is past its age
    /// limit or it was not signed by the current identity, then prune
    /// superseded ones past the retention window
    ///
    /// Returns the new record when a rotation happened.
    pub async fn check_signed_prekey(&self) -> EngineResult<Option<SignedPreKeyRecord>> {
        let Some(_running) = self.health.signed_prekey.try_begin() else {
            tracing::debug!("Signed prekey check already running; skipping");
            return Ok(None);
        };

        let result = self.check_signed_prekey_inner().await;
        if let Err(e) = &result {
            self.health.signed_prekey.mark_error(e);
        }
        result
    }

    async fn check_signed_prekey_inner(&self) -> EngineResult<Option<SignedPreKeyRecord>> {
        let now = Utc::now().timestamp();
        let identity = self.identity_key_pair().await?;
        let current = self.current_signed_prekey().await?;

        let rotated = match &current {
            Some(record)
                if record.age_seconds(now) < self.config.signed_prekey_max_age
                    && record.public().verify(&identity.public).is_ok() =>
            {
                None
            }
            _ => {
                let key_id = self.next_signed_prekey_id().await?;
                Some(self.rotate_signed_prekey(key_id).await?)
            }
        };

        let current_id = rotated
            .as_ref()
            .or(current.as_ref())
            .map(|record| record.key_id);
        let pruned = self.prune_signed_prekeys(current_id, now).await?;

        let count = self.store.list_keys(StoreName::SignedPreKeys).await?.len() as u64;
        self.health.signed_prekey.mark_checked(count, HealthStatus::Healthy);
        if pruned > 0 {
            tracing::info!(pruned, "Pruned expired signed prekeys");
        }
        Ok(rotated)
    }

    async fn prune_signed_prekeys(&self, current_id: Option<u32>, now: i64) -> EngineResult<usize> {
        let mut pruned = 0;
        for key in self.store.list_keys(StoreName::SignedPreKeys).await? {
            let Ok(id) = key.parse::<u32>() else { continue };
            if Some(id) == current_id {
                continue;
            }
            let Some(record) = self.load_signed_prekey(id).await? else { continue };
            if record.age_seconds(now) > self.config.signed_prekey_retention {
                self.store.delete(StoreName::SignedPreKeys, &key).await?;
                pruned += 1;
            }
        }
        Ok(pruned)
    }

    /// The signed prekey advertised to the server
    pub async fn current_signed_prekey(&self) -> EngineResult<Option<SignedPreKeyRecord>> {
        let id = match self.load_counter(CURRENT_SIGNED_PREKEY_ID).await? {
            Some(id) => Some(id),
            None => self
                .store
                .list_keys(StoreName::SignedPreKeys)
                .await?
                .iter()
                .filter_map(|key| key.parse::<u32>().ok())
                .max(),
        };
        match id {
            Some(id) => self.load_signed_prekey(id).await,
            None => Ok(None),
        }
    }

    pub async fn load_signed_prekey(&self, id: u32) -> EngineResult<Option<SignedPreKeyRecord>> {
        Ok(load_json(self.store.as_ref(), StoreName::SignedPreKeys, &id.to_string()).await?)
    }

    /// Id for the next rotation
    pub async fn next_signed_prekey_id(&self) -> EngineResult<u32> {
        let counter = self.load_counter(NEXT_SIGNED_PREKEY_ID).await?.unwrap_or(1);
        let above_existing = self
            .store
            .list_keys(StoreName::SignedPreKeys)
            .await?
            .iter()
            .filter_map(|key| key.parse::<u32>().ok())
            .max()
            .map_or(1, |max| max + 1);
        Ok(counter.max(above_existing))
    }

    // ========================================================================
    // Bundles
    // ========================================================================

    /// Our prekey bundle, offering the lowest-numbered one-time prekey
    pub async fn local_bundle(&self, device_id: u32) -> EngineResult<PreKeyBundle> {
        let identity = self.identity().await?;
        let signed_prekey = self
            .current_signed_prekey()
            .await?
            .ok_or_else(|| EngineError::KeyGeneration("No signed prekey available".to_string()))?;

        let mut one_time_prekey = None;
        for id in self.prekey_ids().await? {
            if let Some(record) = self.load_prekey(id).await? {
                one_time_prekey = Some(record.public());
                break;
            }
        }

        Ok(PreKeyBundle {
            registration_id: identity.registration_id,
            device_id,
            identity_key: identity.public_key.clone(),
            signed_prekey: signed_prekey.public(),
            one_time_prekey,
        })
    }

    // ========================================================================
    // Metadata
    // ========================================================================

    async fn load_counter(&self, key: &str) -> EngineResult<Option<u32>> {
        Ok(load_json(self.store.as_ref(), StoreName::Metadata, key).await?)
    }

    async fn save_counter(&self, key: &str, value: u32) -> EngineResult<()> {
        Ok(save_json(self.store.as_ref(), StoreName::Metadata, key, &value).await?)
    }
}

fn decode_identity(bytes: &[u8]) -> Result<IdentityKeyRecord, String> {
    let record: IdentityKeyRecord = serde_json::from_slice(bytes).map_err(|e| e.to_string())?;
    record.key_pair().map_err(|e| e.to_string())?;
    Ok(record)
}

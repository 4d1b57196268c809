//! Healing Service
//!
//! Reconciles this device's local key state with what the server reports
//! holding for it. Gaps are repaired optimistically (the server missing
//! keys usually means an earlier upload never completed). Fingerprint
//! mismatches are only flagged: overwriting could hide tampering or data
//! loss.
//!
//! The server's fingerprint map is a sample and may be partial, so a local
//! prekey missing from it is never a reason to delete the local prekey.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;

use crate::api::KeyServer;
use crate::crypto::PreKeyRecord;
use crate::engine::key_manager::KeyManager;
use crate::error::{EngineError, EngineResult};
use crate::models::{KeyUpload, PreKeySync, PreKeyUpload};

/// Why verification ended the way it did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealingReason {
    /// Server had no identity key; the full key set was uploaded
    IdentityReuploaded,
    /// Server had no signed prekey; the current one was uploaded
    SignedPreKeyReuploaded,
    /// A prekey id is known to both sides with different fingerprints
    PrekeyHashMismatch,
    Ok,
}

impl HealingReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            HealingReason::IdentityReuploaded => "identity_reuploaded",
            HealingReason::SignedPreKeyReuploaded => "signed_prekey_reuploaded",
            HealingReason::PrekeyHashMismatch => "prekey_hash_mismatch",
            HealingReason::Ok => "ok",
        }
    }
}

impl fmt::Display for HealingReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerificationResult {
    pub is_valid: bool,
    pub needs_healing: bool,
    pub reason: HealingReason,
}

impl VerificationResult {
    fn valid(reason: HealingReason) -> Self {
        Self {
            is_valid: true,
            needs_healing: false,
            reason,
        }
    }
}

pub struct HealingService {
    keys: Arc<KeyManager>,
    server: Arc<dyn KeyServer>,
}

impl HealingService {
    pub fn new(keys: Arc<KeyManager>, server: Arc<dyn KeyServer>) -> Self {
        Self { keys, server }
    }

    /// Compare our keys against the server's view and repair gaps
    pub async fn verify_own_keys_on_server(
        &self,
        user_id: &str,
        device_id: u32,
    ) -> EngineResult<VerificationResult> {
        let status = self.server.key_status(user_id, device_id).await?;

        if is_blank(&status.identity_key) {
            tracing::warn!(user_id, device_id, "Server has no identity key; re-uploading key set");
            self.publish_key_set(device_id).await?;
            return Ok(VerificationResult::valid(HealingReason::IdentityReuploaded));
        }

        if is_blank(&status.signed_pre_key) {
            let signed_prekey = self.keys.current_signed_prekey().await?.ok_or_else(|| {
                EngineError::KeyGeneration("No signed prekey to upload".to_string())
            })?;
            tracing::warn!(
                user_id,
                device_id,
                key_id = signed_prekey.key_id,
                "Server has no signed prekey; re-uploading"
            );
            self.server
                .upload_keys(&KeyUpload::signed_prekey_only(device_id, &signed_prekey))
                .await?;
            return Ok(VerificationResult::valid(HealingReason::SignedPreKeyReuploaded));
        }

        let local: BTreeMap<u32, String> = self
            .keys
            .prekey_records()
            .await?
            .iter()
            .map(|record| (record.key_id, record.fingerprint()))
            .collect();

        let mut server_ids = BTreeSet::new();
        let mut mismatched = Vec::new();
        for (id, server_fingerprint) in &status.pre_key_fingerprints {
            let Ok(id) = id.parse::<u32>() else {
                tracing::warn!(id = %id, "Ignoring malformed prekey id from server");
                continue;
            };
            server_ids.insert(id);
            if let Some(local_fingerprint) = local.get(&id) {
                if local_fingerprint != server_fingerprint {
                    mismatched.push(id);
                }
            }
        }

        if !mismatched.is_empty() {
            tracing::error!(
                user_id,
                device_id,
                ?mismatched,
                "Server prekey fingerprints disagree with local keys"
            );
            return Ok(VerificationResult {
                is_valid: false,
                needs_healing: true,
                reason: HealingReason::PrekeyHashMismatch,
            });
        }

        let local_ids: BTreeSet<u32> = local.keys().copied().collect();
        if local_ids != server_ids {
            let ids: Vec<String> = local_ids.iter().map(u32::to_string).collect();
            tracing::info!(
                local = local_ids.len(),
                server_sample = server_ids.len(),
                "Prekey id sets differ; syncing id list"
            );
            self.server
                .sync_prekeys(&PreKeySync { device_id, ids })
                .await?;
        }

        Ok(VerificationResult::valid(HealingReason::Ok))
    }

    /// Upload identity, current signed prekey and every prekey
    pub async fn publish_key_set(&self, device_id: u32) -> EngineResult<()> {
        let identity = self.keys.identity().await?;
        let signed_prekey = self
            .keys
            .current_signed_prekey()
            .await?
            .ok_or_else(|| EngineError::KeyGeneration("No signed prekey to publish".to_string()))?;
        let prekeys = self.keys.prekey_records().await?;

        self.server
            .upload_keys(&KeyUpload::full(device_id, &identity, &signed_prekey, &prekeys))
            .await?;
        tracing::info!(device_id, prekeys = prekeys.len(), "Published key set");
        Ok(())
    }

    /// Upload freshly generated prekeys
    pub async fn publish_prekeys(&self, device_id: u32, batch: &[PreKeyRecord]) -> EngineResult<()> {
        let upload = KeyUpload {
            device_id,
            pre_keys: batch.iter().map(PreKeyUpload::from).collect(),
            ..Default::default()
        };
        self.server.upload_keys(&upload).await?;
        tracing::info!(device_id, count = batch.len(), "Published prekeys");
        Ok(())
    }

    /// Upload the current signed prekey only
    pub async fn publish_signed_prekey(&self, device_id: u32) -> EngineResult<()> {
        if let Some(signed_prekey) = self.keys.current_signed_prekey().await? {
            self.server
                .upload_keys(&KeyUpload::signed_prekey_only(device_id, &signed_prekey))
                .await?;
            tracing::info!(device_id, key_id = signed_prekey.key_id, "Published signed prekey");
        }
        Ok(())
    }
}

fn is_blank(value: &Option<String>) -> bool {
    value.as_deref().map_or(true, str::is_empty)
}

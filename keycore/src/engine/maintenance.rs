//! Maintenance actions
//!
//! The units of work the observers and the facade trigger: pool refill,
//! signed prekey calendar, sender key rotation, the identity cascade and the
//! self-verification audit. Each action publishes what it changed to the
//! server when an account is signed in; signed out, only local state moves.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use tokio::sync::{Mutex, RwLock};

use crate::config::EngineConfig;
use crate::crypto::SignedPreKeyRecord;
use crate::engine::classifier::{ErrorCategory, ErrorClassifier, ErrorContext, Severity};
use crate::engine::healing::{HealingService, VerificationResult};
use crate::engine::health::{ActionGuard, HealthRegistry};
use crate::engine::key_manager::{KeyManager, PoolOutcome};
use crate::engine::sender_keys::SenderKeyManager;
use crate::error::EngineResult;
use crate::models::ProtocolAddress;
use crate::store::{load_json, save_json, KeyStore, StoreName};

const LAST_SELF_VERIFICATION: &str = "last_self_verification";

pub struct Maintenance {
    store: Arc<dyn KeyStore>,
    keys: Arc<KeyManager>,
    sender_keys: Arc<SenderKeyManager>,
    healing: Arc<HealingService>,
    classifier: Arc<ErrorClassifier>,
    health: Arc<HealthRegistry>,
    config: EngineConfig,
    /// Signed-in account; `name` is the user id
    account: RwLock<Option<ProtocolAddress>>,
    /// Highest identity generation whose cascade has completed
    cascade: Mutex<u64>,
    verification: ActionGuard,
}

impl Maintenance {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<dyn KeyStore>,
        keys: Arc<KeyManager>,
        sender_keys: Arc<SenderKeyManager>,
        healing: Arc<HealingService>,
        classifier: Arc<ErrorClassifier>,
        health: Arc<HealthRegistry>,
        config: EngineConfig,
    ) -> Self {
        Self {
            store,
            keys,
            sender_keys,
            healing,
            classifier,
            health,
            config,
            account: RwLock::new(None),
            cascade: Mutex::new(0),
            verification: ActionGuard::new(),
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn health(&self) -> &HealthRegistry {
        &self.health
    }

    pub async fn set_account(&self, account: Option<ProtocolAddress>) {
        *self.account.write().await = account;
    }

    pub async fn account(&self) -> Option<ProtocolAddress> {
        self.account.read().await.clone()
    }

    // ========================================================================
    // Prekeys
    // ========================================================================

    /// Refill the pool if it is low and upload the new batch
    ///
    /// A pool replaced because it outlived its identity is uploaded as a
    /// full key set.
    pub async fn refill_prekeys(&self) -> EngineResult<PoolOutcome> {
        let outcome = self.keys.check_prekey_pool().await?;
        let Some(account) = self.account().await else {
            return Ok(outcome);
        };
        match &outcome {
            PoolOutcome::Refilled { batch } => {
                self.healing.publish_prekeys(account.device_id, batch).await?
            }
            PoolOutcome::Replaced { .. } => self.healing.publish_key_set(account.device_id).await?,
            PoolOutcome::Healthy { .. } | PoolOutcome::Skipped => {}
        }
        Ok(outcome)
    }

    /// Rotate the signed prekey when due and upload the new one
    pub async fn refresh_signed_prekey(&self) -> EngineResult<Option<SignedPreKeyRecord>> {
        let rotated = self.keys.check_signed_prekey().await?;
        if rotated.is_some() {
            if let Some(account) = self.account().await {
                self.healing.publish_signed_prekey(account.device_id).await?;
            }
        }
        Ok(rotated)
    }

    // ========================================================================
    // Sender keys
    // ========================================================================

    /// Rotate our due sender keys; a no-op while signed out
    pub async fn rotate_sender_keys(&self) -> EngineResult<HashMap<String, bool>> {
        match self.account().await {
            Some(account) => self.sender_keys.check_all(&account).await,
            None => Ok(HashMap::new()),
        }
    }

    /// Timer pass: sender keys, signed prekey calendar, pool top-up
    ///
    /// Each step is logged and the next one still runs.
    pub async fn run_periodic(&self) {
        if let Err(e) = self.rotate_sender_keys().await {
            tracing::error!("Periodic sender key check failed: {}", e);
        }
        if let Err(e) = self.refresh_signed_prekey().await {
            tracing::error!("Periodic signed prekey check failed: {}", e);
        }
        if let Err(e) = self.refill_prekeys().await {
            tracing::error!("Periodic prekey pool check failed: {}", e);
        }
    }

    // ========================================================================
    // Identity cascade
    // ========================================================================

    /// Rebuild everything that depended on the previous identity
    ///
    /// Runs at most once per identity generation. Concurrent callers for the
    /// same generation wait for the running cascade and return `false`.
    /// Every step is attempted; a failed step leaves its health cell in
    /// error. The periodic pass finishes it: a signed prekey not signed by
    /// the current identity is rotated and a pool generated under the old
    /// identity is replaced. The invalidation gate is lifted at the end
    /// either way.
    pub async fn run_identity_cascade(&self, generation: u64) -> bool {
        let mut completed = self.cascade.lock().await;
        if *completed >= generation {
            return false;
        }

        tracing::warn!(generation, "Identity changed; invalidating dependent keys");

        match self.keys.next_signed_prekey_id().await {
            Ok(key_id) => {
                if let Err(e) = self.keys.rotate_signed_prekey(key_id).await {
                    tracing::error!("Cascade: signed prekey rotation failed: {}", e);
                }
            }
            Err(e) => self.health.signed_prekey.mark_error(&e),
        }

        if let Err(e) = self.keys.replace_prekey_pool().await {
            tracing::error!("Cascade: prekey pool replacement failed: {}", e);
        }

        if let Err(e) = self.sender_keys.clear_all().await {
            self.health.sender_keys.mark_error(&e);
        }

        if let Some(account) = self.account().await {
            if let Err(e) = self.healing.publish_key_set(account.device_id).await {
                self.classifier.record(
                    &e,
                    ErrorContext::new("publish_key_set").with_peer(&account),
                );
            }
        }

        *completed = generation;
        self.keys.clear_invalidated();
        tracing::info!(generation, "Identity cascade complete");
        true
    }

    // ========================================================================
    // Self-verification
    // ========================================================================

    /// Audit our keys against the server
    ///
    /// `None` when signed out or when an audit is already running.
    pub async fn verify_keys(&self) -> EngineResult<Option<VerificationResult>> {
        let Some(account) = self.account().await else {
            return Ok(None);
        };
        let Some(_running) = self.verification.try_begin() else {
            tracing::debug!("Self-verification already running; skipping");
            return Ok(None);
        };

        let result = self
            .healing
            .verify_own_keys_on_server(&account.name, account.device_id)
            .await?;

        save_json(
            self.store.as_ref(),
            StoreName::Metadata,
            LAST_SELF_VERIFICATION,
            &Utc::now(),
        )
        .await?;

        if result.needs_healing {
            self.classifier.record_with(
                ErrorCategory::Validation,
                Severity::Error,
                format!("Key verification flagged: {}", result.reason),
                ErrorContext::new("verify_keys").with_peer(&account),
            );
        } else {
            tracing::info!(reason = %result.reason, "Self-verification passed");
        }
        Ok(Some(result))
    }

    /// Run [`verify_keys`](Self::verify_keys) if the last audit is older than
    /// the verification period
    pub async fn verify_if_due(&self) -> EngineResult<Option<VerificationResult>> {
        let due = match self.last_verification().await? {
            Some(last) => Utc::now() - last >= Duration::seconds(self.config.verification_period),
            None => true,
        };
        if !due {
            return Ok(None);
        }
        self.verify_keys().await
    }

    pub async fn last_verification(&self) -> EngineResult<Option<DateTime<Utc>>> {
        Ok(load_json(self.store.as_ref(), StoreName::Metadata, LAST_SELF_VERIFICATION).await?)
    }
}

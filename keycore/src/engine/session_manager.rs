//! Session Manager
//!
//! Per (user, device) pairwise sessions. Records live in the `sessions`
//! store under `user.device`. Ciphers are built per call against the stored
//! record; two concurrent operations on the same peer race on that record and
//! must be serialized by the caller.
//!
//! Staleness and decrypt failures are health signals, not session states: a
//! stale or failing session is still a valid ratchet until it is deleted.

use std::sync::Arc;

use chrono::Utc;

use crate::config::EngineConfig;
use crate::crypto::ratchet::RatchetMessage;
use crate::crypto::{CryptoError, PreKeyBundle, SessionMessage, SessionState, X3dhHeader};
use crate::engine::health::{HealthRegistry, HealthStatus};
use crate::engine::key_manager::KeyManager;
use crate::error::{EngineError, EngineResult};
use crate::models::ProtocolAddress;
use crate::store::{load_json, save_json, KeyStore, StoreName};

pub struct SessionManager {
    store: Arc<dyn KeyStore>,
    keys: Arc<KeyManager>,
    health: Arc<HealthRegistry>,
    config: EngineConfig,
}

impl SessionManager {
    pub fn new(
        store: Arc<dyn KeyStore>,
        keys: Arc<KeyManager>,
        health: Arc<HealthRegistry>,
        config: EngineConfig,
    ) -> Self {
        Self {
            store,
            keys,
            health,
            config,
        }
    }

    /// Cipher handle for a peer device; no session is needed to create it
    pub fn cipher_for(&self, address: &ProtocolAddress) -> SessionCipher<'_> {
        SessionCipher {
            manager: self,
            address: address.clone(),
        }
    }

    /// Run X3DH against a fetched bundle and store the resulting session
    ///
    /// An existing session with a different peer identity is not replaced;
    /// the caller has to delete it first to accept the new identity.
    pub async fn build_from_bundle(
        &self,
        peer_user: &str,
        peer_device: u32,
        bundle: &PreKeyBundle,
    ) -> EngineResult<SessionState> {
        let address = ProtocolAddress::new(peer_user, peer_device);

        if let Some(existing) = self.load_session(&address).await? {
            if existing.peer_identity != bundle.identity_key {
                return Err(CryptoError::UntrustedIdentity(address.to_string()).into());
            }
        }

        let identity = self.keys.identity().await?;
        let session = SessionState::initiate(&identity.key_pair()?, identity.registration_id, bundle)?;
        self.store_session(&address, &session).await?;

        tracing::info!(
            peer = %address,
            session_id = %session.session_id,
            used_prekey = ?bundle.one_time_prekey.as_ref().map(|k| k.key_id),
            "Established outbound session"
        );
        self.refresh_health().await?;
        Ok(session)
    }

    pub async fn has_session(&self, address: &ProtocolAddress) -> EngineResult<bool> {
        Ok(self
            .store
            .get(StoreName::Sessions, &address.to_string())
            .await?
            .is_some())
    }

    pub async fn load_session(&self, address: &ProtocolAddress) -> EngineResult<Option<SessionState>> {
        Ok(load_json(self.store.as_ref(), StoreName::Sessions, &address.to_string()).await?)
    }

    async fn store_session(&self, address: &ProtocolAddress, session: &SessionState) -> EngineResult<()> {
        Ok(save_json(self.store.as_ref(), StoreName::Sessions, &address.to_string(), session).await?)
    }

    pub async fn delete_session(&self, address: &ProtocolAddress) -> EngineResult<()> {
        self.store
            .delete(StoreName::Sessions, &address.to_string())
            .await?;
        tracing::info!(peer = %address, "Deleted session");
        self.refresh_health().await
    }

    /// Delete the sessions of every device of `user_id`; returns how many
    pub async fn delete_all_sessions(&self, user_id: &str) -> EngineResult<usize> {
        let devices = self.list_device_ids(user_id).await?;
        for device_id in &devices {
            self.store
                .delete(
                    StoreName::Sessions,
                    &ProtocolAddress::new(user_id, *device_id).to_string(),
                )
                .await?;
        }
        tracing::info!(user_id, count = devices.len(), "Deleted all sessions for user");
        self.refresh_health().await?;
        Ok(devices.len())
    }

    /// Device ids we hold a session with for `user_id`, ascending
    pub async fn list_device_ids(&self, user_id: &str) -> EngineResult<Vec<u32>> {
        let mut devices: Vec<u32> = self
            .store
            .list_keys(StoreName::Sessions)
            .await?
            .iter()
            .filter_map(|key| ProtocolAddress::parse(key).ok())
            .filter(|address| address.name == user_id)
            .map(|address| address.device_id)
            .collect();
        devices.sort_unstable();
        Ok(devices)
    }

    /// Count a failed decrypt against the stored session
    pub async fn mark_decrypt_failure(&self, address: &ProtocolAddress) -> EngineResult<()> {
        if let Some(mut session) = self.load_session(address).await? {
            session.decrypt_failures += 1;
            self.store_session(address, &session).await?;
            tracing::warn!(
                peer = %address,
                failures = session.decrypt_failures,
                "Session decrypt failure"
            );
            self.refresh_health().await?;
        }
        Ok(())
    }

    /// Recount sessions, stale sessions and sessions with decrypt failures
    pub async fn refresh_health(&self) -> EngineResult<()> {
        let now = Utc::now().timestamp();
        let mut count = 0u64;
        let mut stale = 0u64;
        let mut corrupted = 0u64;

        for key in self.store.list_keys(StoreName::Sessions).await? {
            let session: Option<SessionState> =
                match load_json(self.store.as_ref(), StoreName::Sessions, &key).await {
                    Ok(session) => session,
                    Err(e) => {
                        tracing::warn!(peer = %key, "Unreadable session record: {}", e);
                        count += 1;
                        corrupted += 1;
                        continue;
                    }
                };
            let Some(session) = session else { continue };
            count += 1;
            if now - session.last_used > self.config.session_stale_after {
                stale += 1;
            }
            if session.decrypt_failures > 0 {
                corrupted += 1;
            }
        }

        let status = if corrupted == 0 && stale == 0 {
            HealthStatus::Healthy
        } else {
            HealthStatus::Degraded
        };
        self.health.sessions.update(|state| {
            state.count = count;
            state.stale = stale;
            state.corrupted = corrupted;
            state.status = status;
            state.last_check = Some(Utc::now());
            state.last_error = None;
        });
        Ok(())
    }

    /// Responder side: build a session from an incoming prekey message
    async fn accept_prekey_message(
        &self,
        header: &X3dhHeader,
        session_id: &str,
    ) -> EngineResult<SessionState> {
        let identity = self.keys.identity_key_pair().await?;
        let signed_prekey = self
            .keys
            .load_signed_prekey(header.signed_prekey_id)
            .await?
            .ok_or_else(|| {
                CryptoError::X3dhError(format!("Unknown signed prekey {}", header.signed_prekey_id))
            })?;
        let one_time_prekey = match header.one_time_prekey_id {
            Some(id) => Some(
                self.keys
                    .load_prekey(id)
                    .await?
                    .ok_or(CryptoError::NoPrekeyAvailable(id))?
                    .key_pair()?,
            ),
            None => None,
        };

        Ok(SessionState::respond(
            &identity,
            &signed_prekey.key_pair()?,
            one_time_prekey.as_ref(),
            header,
            session_id,
        )?)
    }
}

/// Stateless cipher handle for one peer device
pub struct SessionCipher<'a> {
    manager: &'a SessionManager,
    address: ProtocolAddress,
}

impl SessionCipher<'_> {
    pub fn address(&self) -> &ProtocolAddress {
        &self.address
    }

    pub async fn encrypt(&self, plaintext: &[u8]) -> EngineResult<Vec<u8>> {
        let mut session = self
            .manager
            .load_session(&self.address)
            .await?
            .ok_or_else(|| EngineError::NoSession(self.address.to_string()))?;

        let ciphertext = session.encrypt(plaintext)?;
        self.manager.store_session(&self.address, &session).await?;
        Ok(ciphertext)
    }

    /// Decrypt; a prekey message for an unknown session builds it first
    pub async fn decrypt(&self, ciphertext: &[u8]) -> EngineResult<Vec<u8>> {
        let message = SessionMessage::from_bytes(ciphertext)?;
        let existing = self.manager.load_session(&self.address).await?;

        match &message {
            SessionMessage::PreKey {
                header,
                session_id,
                message: ratchet,
            } => match existing {
                Some(session) if session.session_id == *session_id => {
                    self.decrypt_with(session, ratchet).await
                }
                existing => {
                    if let Some(current) = &existing {
                        if current.peer_identity != header.identity_key {
                            return Err(CryptoError::UntrustedIdentity(self.address.to_string()).into());
                        }
                    }

                    let mut session = self.manager.accept_prekey_message(header, session_id).await?;
                    let plaintext = session.decrypt(ratchet)?;
                    self.manager.store_session(&self.address, &session).await?;
                    tracing::info!(
                        peer = %self.address,
                        session_id = %session.session_id,
                        "Established inbound session"
                    );

                    // The session is committed; from here on the plaintext is returned
                    if let Some(id) = header.one_time_prekey_id {
                        if let Err(e) = self.manager.keys.consume_prekey(id).await {
                            tracing::warn!(peer = %self.address, key_id = id, "Used prekey not removed: {}", e);
                            self.manager.health.prekeys.mark_error(&e);
                        }
                    }
                    if let Err(e) = self.manager.refresh_health().await {
                        tracing::warn!("Session health refresh failed: {}", e);
                    }
                    Ok(plaintext)
                }
            },
            SessionMessage::Normal {
                session_id,
                message: ratchet,
            } => {
                let session = existing.ok_or_else(|| EngineError::NoSession(self.address.to_string()))?;
                if session.session_id != *session_id {
                    self.manager.mark_decrypt_failure(&self.address).await?;
                    return Err(CryptoError::DecryptionError(format!(
                        "Message for unknown session {}",
                        session_id
                    ))
                    .into());
                }
                self.decrypt_with(session, ratchet).await
            }
        }
    }

    async fn decrypt_with(
        &self,
        mut session: SessionState,
        ratchet: &RatchetMessage,
    ) -> EngineResult<Vec<u8>> {
        let had_failures = session.decrypt_failures > 0;
        match session.decrypt(ratchet) {
            Ok(plaintext) => {
                self.manager.store_session(&self.address, &session).await?;
                if had_failures {
                    self.manager.refresh_health().await?;
                }
                Ok(plaintext)
            }
            Err(e) => {
                self.manager.mark_decrypt_failure(&self.address).await?;
                Err(e.into())
            }
        }
    }
}

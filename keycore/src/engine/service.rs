//! CryptoService - the engine facade
//!
//! One instance per server connection. It wires the managers together,
//! owns the login lifecycle and records every failure it hands back through
//! the error classifier.
//!
//! ## Example
//!
//! ```rust,ignore
//! use nochat_keycore::{ApiClient, CryptoService, EngineConfig, ProtocolAddress, SqliteKeyStore};
//!
//! let config = EngineConfig::from_env()?;
//! let store = Arc::new(SqliteKeyStore::open(&config.db_path).await?);
//! let server = Arc::new(ApiClient::new(&config, token)?);
//! let service = CryptoService::new(config, store, server)?;
//!
//! service.on_login("alice", 1).await?;
//! service.establish_session("bob", 1).await?;
//! let ciphertext = service.encrypt(&ProtocolAddress::new("bob", 1), b"Hello!").await?;
//! service.on_logout().await;
//! ```

use std::sync::Arc;

use tokio::sync::Mutex;

use crate::api::KeyServer;
use crate::config::EngineConfig;
use crate::crypto::{IdentityKeyRecord, SessionState};
use crate::engine::classifier::{ErrorClassifier, ErrorContext};
use crate::engine::healing::{HealingService, VerificationResult};
use crate::engine::health::HealthRegistry;
use crate::engine::key_manager::{IdentityOrigin, KeyManager};
use crate::engine::maintenance::Maintenance;
use crate::engine::observers::MaintenanceObservers;
use crate::engine::sender_keys::SenderKeyManager;
use crate::engine::session_manager::SessionManager;
use crate::error::{EngineError, EngineResult};
use crate::models::ProtocolAddress;
use crate::store::KeyStore;

/// What happened during [`CryptoService::on_login`]
#[derive(Debug, Clone)]
pub struct LoginReport {
    pub identity_origin: IdentityOrigin,
    /// `None` if the audit could not reach the server
    pub verification: Option<VerificationResult>,
}

pub struct CryptoService {
    server: Arc<dyn KeyServer>,
    health: Arc<HealthRegistry>,
    classifier: Arc<ErrorClassifier>,
    keys: Arc<KeyManager>,
    sessions: Arc<SessionManager>,
    sender_keys: Arc<SenderKeyManager>,
    healing: Arc<HealingService>,
    maintenance: Arc<Maintenance>,
    observers: Mutex<Option<MaintenanceObservers>>,
}

impl CryptoService {
    /// Wire the engine together; fails on an inconsistent configuration
    pub fn new(
        config: EngineConfig,
        store: Arc<dyn KeyStore>,
        server: Arc<dyn KeyServer>,
    ) -> EngineResult<Self> {
        config.validate()?;

        let health = Arc::new(HealthRegistry::new());
        let classifier = Arc::new(ErrorClassifier::new());
        let keys = Arc::new(KeyManager::new(store.clone(), health.clone(), config.clone()));
        let sessions = Arc::new(SessionManager::new(
            store.clone(),
            keys.clone(),
            health.clone(),
            config.clone(),
        ));
        let sender_keys = Arc::new(SenderKeyManager::new(
            store.clone(),
            server.clone(),
            health.clone(),
            config.clone(),
        ));
        let healing = Arc::new(HealingService::new(keys.clone(), server.clone()));
        let maintenance = Arc::new(Maintenance::new(
            store,
            keys.clone(),
            sender_keys.clone(),
            healing.clone(),
            classifier.clone(),
            health.clone(),
            config,
        ));

        Ok(Self {
            server,
            health,
            classifier,
            keys,
            sessions,
            sender_keys,
            healing,
            maintenance,
            observers: Mutex::new(None),
        })
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    /// Bring keys up to date for `user_id` on `device_id` and start maintenance
    ///
    /// Only a failure to obtain an identity fails the login. Publication and
    /// audit failures are recorded and left to the observers.
    pub async fn on_login(&self, user_id: &str, device_id: u32) -> EngineResult<LoginReport> {
        self.on_logout().await;
        let account = ProtocolAddress::new(user_id, device_id);

        let ensured = self
            .keys
            .ensure_identity()
            .await
            .map_err(|e| self.observe(e, "ensure_identity", None))?;
        self.maintenance.set_account(Some(account.clone())).await;

        match &ensured.origin {
            IdentityOrigin::Loaded => {
                if let Err(e) = self.maintenance.refresh_signed_prekey().await {
                    self.observe(e, "refresh_signed_prekey", Some(&account));
                }
                if let Err(e) = self.maintenance.refill_prekeys().await {
                    self.observe(e, "refill_prekeys", Some(&account));
                }
            }
            IdentityOrigin::Generated => {
                if let Err(e) = self.initial_key_set(device_id).await {
                    self.observe(e, "publish_key_set", Some(&account));
                }
            }
            IdentityOrigin::Replaced { reason } => {
                self.observe(
                    EngineError::IdentityCorrupted(reason.clone()),
                    "ensure_identity",
                    Some(&account),
                );
                self.maintenance
                    .run_identity_cascade(self.keys.identity_generation())
                    .await;
            }
        }

        let verification = match self.maintenance.verify_keys().await {
            Ok(result) => result,
            Err(e) => {
                self.observe(e, "verify_keys", Some(&account));
                None
            }
        };

        if let Err(e) = self.sessions.refresh_health().await {
            tracing::warn!("Session health refresh failed: {}", e);
        }
        if let Err(e) = self.sender_keys.refresh_health().await {
            tracing::warn!("Sender key health refresh failed: {}", e);
        }

        *self.observers.lock().await = Some(MaintenanceObservers::start(self.maintenance.clone()));

        tracing::info!(
            user_id,
            device_id,
            origin = ?ensured.origin,
            fingerprint = %ensured.record.fingerprint(),
            "Key engine ready"
        );
        Ok(LoginReport {
            identity_origin: ensured.origin,
            verification,
        })
    }

    /// First run: signed prekey, full pool, one upload
    async fn initial_key_set(&self, device_id: u32) -> EngineResult<()> {
        self.keys.check_signed_prekey().await?;
        self.keys.check_prekey_pool().await?;
        self.healing.publish_key_set(device_id).await
    }

    /// Stop maintenance and forget the account; safe to call repeatedly
    pub async fn on_logout(&self) {
        if let Some(observers) = self.observers.lock().await.take() {
            observers.stop();
        }
        if self.maintenance.account().await.is_some() {
            self.maintenance.set_account(None).await;
            tracing::info!("Key engine signed out");
        }
    }

    pub async fn is_logged_in(&self) -> bool {
        self.maintenance.account().await.is_some()
    }

    async fn me(&self) -> EngineResult<ProtocolAddress> {
        self.maintenance.account().await.ok_or(EngineError::NotLoggedIn)
    }

    fn observe(&self, error: EngineError, operation: &str, peer: Option<&ProtocolAddress>) -> EngineError {
        let mut context = ErrorContext::new(operation);
        if let Some(peer) = peer {
            context = context.with_peer(peer);
        }
        self.classifier.record(&error, context);
        error
    }

    // ========================================================================
    // Pairwise messages
    // ========================================================================

    /// Fetch a peer device's bundle and start a session with it
    pub async fn establish_session(&self, user_id: &str, device_id: u32) -> EngineResult<SessionState> {
        let peer = ProtocolAddress::new(user_id, device_id);
        let result: EngineResult<SessionState> = async {
            self.keys.ensure_usable()?;
            let bundle = self.server.fetch_prekey_bundle(user_id, device_id).await?;
            self.sessions.build_from_bundle(user_id, device_id, &bundle).await
        }
        .await;
        result.map_err(|e| self.observe(e, "establish_session", Some(&peer)))
    }

    pub async fn encrypt(&self, peer: &ProtocolAddress, plaintext: &[u8]) -> EngineResult<Vec<u8>> {
        let result: EngineResult<Vec<u8>> = async {
            self.keys.ensure_usable()?;
            self.sessions.cipher_for(peer).encrypt(plaintext).await
        }
        .await;
        result.map_err(|e| self.observe(e, "encrypt", Some(peer)))
    }

    pub async fn decrypt(&self, peer: &ProtocolAddress, ciphertext: &[u8]) -> EngineResult<Vec<u8>> {
        self.sessions
            .cipher_for(peer)
            .decrypt(ciphertext)
            .await
            .map_err(|e| self.observe(e, "decrypt", Some(peer)))
    }

    /// Drop the session with a peer device; the next message needs a handshake
    pub async fn reset_session(&self, peer: &ProtocolAddress) -> EngineResult<()> {
        self.sessions
            .delete_session(peer)
            .await
            .map_err(|e| self.observe(e, "reset_session", Some(peer)))
    }

    pub async fn has_session(&self, peer: &ProtocolAddress) -> EngineResult<bool> {
        self.sessions
            .has_session(peer)
            .await
            .map_err(|e| self.observe(e, "has_session", Some(peer)))
    }

    // ========================================================================
    // Group messages
    // ========================================================================

    pub async fn encrypt_group(&self, group_id: &str, plaintext: &[u8]) -> EngineResult<Vec<u8>> {
        let result: EngineResult<Vec<u8>> = async {
            self.keys.ensure_usable()?;
            let me = self.me().await?;
            self.sender_keys.get_cipher(group_id, &me).encrypt(plaintext).await
        }
        .await;
        result.map_err(|e| self.observe(e, "encrypt_group", None))
    }

    pub async fn decrypt_group(
        &self,
        group_id: &str,
        sender: &ProtocolAddress,
        ciphertext: &[u8],
    ) -> EngineResult<Vec<u8>> {
        self.sender_keys
            .get_cipher(group_id, sender)
            .decrypt(ciphertext)
            .await
            .map_err(|e| self.observe(e, "decrypt_group", Some(sender)))
    }

    /// Our sender key for the group, to send pairwise to each member
    pub async fn group_distribution_message(&self, group_id: &str) -> EngineResult<Vec<u8>> {
        let result: EngineResult<Vec<u8>> = async {
            self.keys.ensure_usable()?;
            let me = self.me().await?;
            self.sender_keys.get_cipher(group_id, &me).distribution_message().await
        }
        .await;
        result.map_err(|e| self.observe(e, "group_distribution_message", None))
    }

    pub async fn process_group_distribution(
        &self,
        group_id: &str,
        sender: &ProtocolAddress,
        message: &[u8],
    ) -> EngineResult<()> {
        self.sender_keys
            .get_cipher(group_id, sender)
            .process_distribution(message)
            .await
            .map_err(|e| self.observe(e, "process_group_distribution", Some(sender)))
    }

    /// Forget a removed member's key and rotate ours so they cannot read on
    ///
    /// Returns the distribution message for the remaining members.
    pub async fn member_removed(&self, group_id: &str, member: &ProtocolAddress) -> EngineResult<Vec<u8>> {
        let result: EngineResult<Vec<u8>> = async {
            self.keys.ensure_usable()?;
            let me = self.me().await?;
            self.sender_keys.remove(group_id, member).await?;
            self.sender_keys.rotate(group_id, &me).await?;
            self.sender_keys.get_cipher(group_id, &me).distribution_message().await
        }
        .await;
        result.map_err(|e| self.observe(e, "member_removed", Some(member)))
    }

    /// Delete every sender key held for the group
    pub async fn leave_group(&self, group_id: &str) -> EngineResult<usize> {
        self.sender_keys
            .clear_group(group_id)
            .await
            .map_err(|e| self.observe(e, "leave_group", None))
    }

    // ========================================================================
    // Keys and health
    // ========================================================================

    /// Replace our identity and rebuild everything that depended on it
    ///
    /// Encryption is refused until the rebuild completes.
    pub async fn regenerate_identity(&self) -> EngineResult<IdentityKeyRecord> {
        let record = self
            .keys
            .regenerate_identity()
            .await
            .map_err(|e| self.observe(e, "regenerate_identity", None))?;
        self.maintenance
            .run_identity_cascade(self.keys.identity_generation())
            .await;
        Ok(record)
    }

    /// Audit our keys against the server now, regardless of the last audit
    pub async fn verify_keys(&self) -> EngineResult<Option<VerificationResult>> {
        self.maintenance
            .verify_keys()
            .await
            .map_err(|e| self.observe(e, "verify_keys", None))
    }

    pub async fn identity(&self) -> EngineResult<IdentityKeyRecord> {
        self.keys
            .identity()
            .await
            .map_err(|e| self.observe(e, "identity", None))
    }

    pub fn health(&self) -> &HealthRegistry {
        &self.health
    }

    pub fn classifier(&self) -> &ErrorClassifier {
        &self.classifier
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::classifier::{ErrorCategory, Severity};
    use crate::engine::healing::HealingReason;
    use crate::engine::health::HealthStatus;
    use crate::engine::testing::FakeKeyServer;
    use crate::store::{MemoryKeyStore, StoreName};

    struct Client {
        server: Arc<FakeKeyServer>,
        store: Arc<MemoryKeyStore>,
        service: CryptoService,
    }

    fn client_with(server: Arc<FakeKeyServer>) -> Client {
        let store = Arc::new(MemoryKeyStore::new());
        let service = CryptoService::new(EngineConfig::default(), store.clone(), server.clone()).unwrap();
        Client {
            server,
            store,
            service,
        }
    }

    fn client() -> Client {
        client_with(FakeKeyServer::new())
    }

    #[tokio::test]
    async fn test_first_login_publishes_full_key_set() {
        let c = client();
        let report = c.service.on_login("alice", 1).await.unwrap();
        assert_eq!(report.identity_origin, IdentityOrigin::Generated);
        assert_eq!(report.verification.unwrap().reason, HealingReason::Ok);

        let uploads = c.server.uploads();
        assert_eq!(uploads.len(), 1);
        assert!(uploads[0].is_full());
        assert_eq!(uploads[0].pre_keys.len(), 110);
        assert_eq!(c.server.status().pre_keys_count, 110);

        assert_eq!(c.service.health().prekeys.snapshot().count, 110);
        assert_eq!(c.service.health().identity.snapshot().status, HealthStatus::Healthy);
        c.service.on_logout().await;
    }

    #[tokio::test]
    async fn test_second_login_loads_identity_without_reupload() {
        let c = client();
        c.service.on_login("alice", 1).await.unwrap();
        let fingerprint = c.service.identity().await.unwrap().fingerprint();
        c.service.on_logout().await;

        let report = c.service.on_login("alice", 1).await.unwrap();
        assert_eq!(report.identity_origin, IdentityOrigin::Loaded);
        assert_eq!(c.service.identity().await.unwrap().fingerprint(), fingerprint);
        assert_eq!(c.server.uploads().len(), 1);
        c.service.on_logout().await;
    }

    #[tokio::test]
    async fn test_offline_login_still_succeeds() {
        let server = FakeKeyServer::new();
        server.set_offline(true);
        let c = client_with(server);

        let report = c.service.on_login("alice", 1).await.unwrap();
        assert_eq!(report.identity_origin, IdentityOrigin::Generated);
        assert!(report.verification.is_none());
        assert!(c.service.classifier().count(ErrorCategory::Network) >= 1);
        c.service.on_logout().await;
    }

    #[tokio::test]
    async fn test_corrupted_identity_is_replaced_and_flagged_critical() {
        let c = client();
        c.store
            .put(StoreName::Identity, "local", b"not json")
            .await
            .unwrap();

        let report = c.service.on_login("alice", 1).await.unwrap();
        assert!(matches!(report.identity_origin, IdentityOrigin::Replaced { .. }));
        assert!(c.service.classifier().has_critical());
        let critical: Vec<_> = c
            .service
            .classifier()
            .recent()
            .into_iter()
            .filter(|o| o.severity == Severity::Critical)
            .collect();
        assert_eq!(critical[0].context.operation, "ensure_identity");

        // The cascade ran and lifted the gate
        assert!(c.service.encrypt_group("g1", b"hi").await.is_ok());
        assert!(c.server.uploads().iter().any(|u| u.is_full()));
        c.service.on_logout().await;
    }

    #[tokio::test]
    async fn test_pairwise_round_trip_through_facade() {
        let server = FakeKeyServer::new();
        let alice = client_with(server.clone());
        let bob = client_with(server.clone());
        bob.service.on_login("bob", 1).await.unwrap();
        alice.service.on_login("alice", 1).await.unwrap();

        let bob_keys = bob.service.keys.local_bundle(1).await.unwrap();
        server.add_bundle("bob", 1, bob_keys);

        let bob_addr = ProtocolAddress::new("bob", 1);
        let alice_addr = ProtocolAddress::new("alice", 1);

        let err = alice.service.encrypt(&bob_addr, b"too early").await.unwrap_err();
        assert!(matches!(err, EngineError::NoSession(_)));
        assert_eq!(alice.service.classifier().count(ErrorCategory::Healing), 1);

        alice.service.establish_session("bob", 1).await.unwrap();
        let ciphertext = alice.service.encrypt(&bob_addr, b"hello bob").await.unwrap();
        assert_eq!(
            bob.service.decrypt(&alice_addr, &ciphertext).await.unwrap(),
            b"hello bob"
        );

        alice.service.on_logout().await;
        bob.service.on_logout().await;
    }

    #[tokio::test]
    async fn test_group_round_trip_and_member_removal() {
        let alice = client();
        let bob = client();
        alice.service.on_login("alice", 1).await.unwrap();
        bob.service.on_login("bob", 1).await.unwrap();
        let alice_addr = ProtocolAddress::new("alice", 1);
        let bob_addr = ProtocolAddress::new("bob", 1);

        let distribution = alice.service.group_distribution_message("team").await.unwrap();
        bob.service
            .process_group_distribution("team", &alice_addr, &distribution)
            .await
            .unwrap();

        let ciphertext = alice.service.encrypt_group("team", b"standup").await.unwrap();
        assert_eq!(
            bob.service
                .decrypt_group("team", &alice_addr, &ciphertext)
                .await
                .unwrap(),
            b"standup"
        );

        // Bob's key goes, ours rotates; Bob cannot read what follows
        let bob_distribution = bob.service.group_distribution_message("team").await.unwrap();
        alice.service
            .process_group_distribution("team", &bob_addr, &bob_distribution)
            .await
            .unwrap();
        let fresh = alice.service.member_removed("team", &bob_addr).await.unwrap();
        assert_ne!(fresh, distribution);
        assert!(alice
            .service
            .sender_keys
            .load("team", &bob_addr)
            .await
            .unwrap()
            .is_empty());

        let after = alice.service.encrypt_group("team", b"private").await.unwrap();
        assert!(bob.service.decrypt_group("team", &alice_addr, &after).await.is_err());
        assert_eq!(alice.server.rotations().len(), 1);

        assert_eq!(alice.service.leave_group("team").await.unwrap(), 1);
        alice.service.on_logout().await;
        bob.service.on_logout().await;
    }

    #[tokio::test]
    async fn test_regenerate_identity_invalidates_sender_keys() {
        let c = client();
        c.service.on_login("alice", 1).await.unwrap();
        let me = ProtocolAddress::new("alice", 1);
        c.service.encrypt_group("g1", b"one").await.unwrap();
        c.service.encrypt_group("g2", b"two").await.unwrap();
        assert_eq!(c.service.health().sender_keys.snapshot().count, 2);

        let before = c.service.identity().await.unwrap().fingerprint();
        let record = c.service.regenerate_identity().await.unwrap();
        assert_ne!(record.fingerprint(), before);

        for group in ["g1", "g2"] {
            assert!(c.service.sender_keys.load(group, &me).await.unwrap().is_empty());
        }
        assert_eq!(c.service.sender_keys.group_count().await.unwrap(), 0);
        assert_eq!(c.service.health().sender_keys.snapshot().count, 0);
        assert!(c.service.encrypt_group("g1", b"after").await.is_ok());
        c.service.on_logout().await;
    }

    #[tokio::test]
    async fn test_encryption_refused_while_keys_invalidated() {
        let c = client();
        c.service.on_login("alice", 1).await.unwrap();
        c.service.on_logout().await;

        // Regenerate without the cascade: the gate stays closed
        c.service.keys.regenerate_identity().await.unwrap();
        let err = c
            .service
            .encrypt(&ProtocolAddress::new("bob", 1), b"hi")
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::KeysInvalidated(_)));

        let generation = c.service.keys.identity_generation();
        assert!(c.service.maintenance.run_identity_cascade(generation).await);
        let err = c
            .service
            .encrypt(&ProtocolAddress::new("bob", 1), b"hi")
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::NoSession(_)));
    }

    #[test]
    fn test_inconsistent_config_is_rejected() {
        let config = EngineConfig {
            prekey_low_water: 110,
            prekey_pool_target: 100,
            ..EngineConfig::default()
        };
        let result = CryptoService::new(config, Arc::new(MemoryKeyStore::new()), FakeKeyServer::new());
        assert!(matches!(result, Err(EngineError::Config(_))));
    }

    #[tokio::test]
    async fn test_group_failures_are_classified() {
        let c = client();
        let bob = ProtocolAddress::new("bob", 1);

        assert!(c.service.group_distribution_message("team").await.is_err());
        assert!(c.service.member_removed("team", &bob).await.is_err());

        let operations: Vec<String> = c
            .service
            .classifier()
            .recent()
            .into_iter()
            .map(|o| o.context.operation)
            .collect();
        assert_eq!(operations, ["group_distribution_message", "member_removed"]);
        let removal = &c.service.classifier().recent()[1];
        assert_eq!(removal.context.peer.as_deref(), Some("bob.1"));
    }

    #[tokio::test]
    async fn test_logout_is_idempotent() {
        let c = client();
        c.service.on_logout().await;
        c.service.on_login("alice", 1).await.unwrap();
        assert!(c.service.is_logged_in().await);
        c.service.on_logout().await;
        c.service.on_logout().await;
        assert!(!c.service.is_logged_in().await);
        assert!(matches!(
            c.service.encrypt_group("g1", b"x").await.unwrap_err(),
            EngineError::NotLoggedIn
        ));
    }
}

//! Key types and generation for the Signal Protocol
//!
//! This module defines the key material the engine manages:
//! - Identity keys (Ed25519) for long-term identity and signing
//! - Curve25519 keys for Diffie-Hellman key exchange
//! - Signed prekeys for medium-term key exchange
//! - One-time prekeys for forward secrecy
//!
//! The `*Record` types are the durable forms written to the key store. The
//! free functions at the bottom are the generation primitives the managers
//! call; nothing else in the crate creates key material.

use rand::Rng;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use vodozemac::{Curve25519PublicKey, Curve25519SecretKey, Ed25519PublicKey, Ed25519SecretKey};

use crate::crypto::errors::{CryptoError, CryptoResult};

/// Highest registration id handed out, matching libsignal's 14-bit range.
pub const MAX_REGISTRATION_ID: u32 = 16380;

/// Long-term identity key pair (Ed25519)
///
/// Used for:
/// - Signing prekeys to prove ownership
/// - Long-term identity verification
/// - Key fingerprint generation for verification
pub struct IdentityKeyPair {
    /// Public key (safe to share)
    pub public: Ed25519PublicKey,
    /// Secret key (never leaves device)
    secret: Ed25519SecretKey,
}

impl IdentityKeyPair {
    /// Generate a new random identity key pair
    pub fn generate() -> Self {
        let secret = Ed25519SecretKey::new();
        let public = secret.public_key();
        Self { public, secret }
    }

    /// Restore from existing key bytes
    pub fn from_bytes(public_bytes: &[u8], secret_bytes: &[u8]) -> CryptoResult<Self> {
        let public_arr: [u8; 32] = public_bytes
            .try_into()
            .map_err(|_| CryptoError::InvalidKey("Public key must be 32 bytes".to_string()))?;
        let secret_arr: [u8; 32] = secret_bytes
            .try_into()
            .map_err(|_| CryptoError::InvalidKey("Secret key must be 32 bytes".to_string()))?;

        let public = Ed25519PublicKey::from_slice(&public_arr)?;
        let secret = Ed25519SecretKey::from_slice(&secret_arr);
        if secret.public_key() != public {
            return Err(CryptoError::InvalidKey(
                "Identity secret does not match public key".to_string(),
            ));
        }
        Ok(Self { public, secret })
    }

    /// Sign a message with this identity key
    pub fn sign(&self, message: &[u8]) -> Vec<u8> {
        self.secret.sign(message).to_bytes().to_vec()
    }

    /// Get the public key bytes
    pub fn public_key_bytes(&self) -> Vec<u8> {
        self.public.as_bytes().to_vec()
    }

    /// Get the secret key bytes (for secure storage)
    pub fn secret_key_bytes(&self) -> Vec<u8> {
        self.secret.to_bytes().to_vec()
    }

    /// Compute a fingerprint for key verification
    pub fn fingerprint(&self) -> String {
        fingerprint(self.public.as_bytes())
    }
}

/// Curve25519 key pair for Diffie-Hellman key exchange
pub struct Curve25519KeyPair {
    /// Public key (safe to share)
    pub public: Curve25519PublicKey,
    /// Secret key (never leaves device)
    secret: Curve25519SecretKey,
}

impl Curve25519KeyPair {
    /// Generate a new random Curve25519 key pair
    pub fn generate() -> Self {
        let secret = Curve25519SecretKey::new();
        let public = Curve25519PublicKey::from(&secret);
        Self { public, secret }
    }

    /// Restore from existing key bytes
    pub fn from_bytes(public_bytes: &[u8], secret_bytes: &[u8]) -> CryptoResult<Self> {
        let public_arr: [u8; 32] = public_bytes
            .try_into()
            .map_err(|_| CryptoError::InvalidKey("Public key must be 32 bytes".to_string()))?;
        let secret_arr: [u8; 32] = secret_bytes
            .try_into()
            .map_err(|_| CryptoError::InvalidKey("Secret key must be 32 bytes".to_string()))?;

        let public = Curve25519PublicKey::from_slice(&public_arr)?;
        let secret = Curve25519SecretKey::from_slice(&secret_arr);
        Ok(Self { public, secret })
    }

    /// Perform Diffie-Hellman key exchange
    pub fn diffie_hellman(&self, their_public: &Curve25519PublicKey) -> [u8; 32] {
        self.secret.diffie_hellman(their_public).to_bytes()
    }

    /// Get the public key bytes
    pub fn public_key_bytes(&self) -> Vec<u8> {
        self.public.to_bytes().to_vec()
    }

    /// Get the secret key bytes (for secure storage)
    pub fn secret_key_bytes(&self) -> Vec<u8> {
        self.secret.to_bytes().to_vec()
    }
}

/// Durable identity record. One per device.
#[derive(Clone, Serialize, Deserialize)]
pub struct IdentityKeyRecord {
    pub public_key: Vec<u8>,
    pub secret_key: Vec<u8>,
    pub registration_id: u32,
    /// Unix timestamp of creation
    pub created_at: i64,
}

impl IdentityKeyRecord {
    /// Rebuild the signing key pair
    pub fn key_pair(&self) -> CryptoResult<IdentityKeyPair> {
        IdentityKeyPair::from_bytes(&self.public_key, &self.secret_key)
    }

    pub fn fingerprint(&self) -> String {
        fingerprint(&self.public_key)
    }
}

impl std::fmt::Debug for IdentityKeyRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IdentityKeyRecord")
            .field("fingerprint", &self.fingerprint())
            .field("registration_id", &self.registration_id)
            .field("created_at", &self.created_at)
            .finish()
    }
}

/// Durable one-time prekey record
#[derive(Clone, Serialize, Deserialize)]
pub struct PreKeyRecord {
    pub key_id: u32,
    pub public_key: Vec<u8>,
    pub secret_key: Vec<u8>,
    pub created_at: i64,
}

impl PreKeyRecord {
    pub fn key_pair(&self) -> CryptoResult<Curve25519KeyPair> {
        Curve25519KeyPair::from_bytes(&self.public_key, &self.secret_key)
    }

    /// Public half, as published in bundles
    pub fn public(&self) -> OneTimePreKey {
        OneTimePreKey {
            key_id: self.key_id,
            public_key: self.public_key.clone(),
        }
    }

    /// Fingerprint the server is expected to report for this prekey
    pub fn fingerprint(&self) -> String {
        fingerprint(&self.public_key)
    }
}

impl std::fmt::Debug for PreKeyRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PreKeyRecord")
            .field("key_id", &self.key_id)
            .field("fingerprint", &self.fingerprint())
            .finish()
    }
}

/// Durable signed prekey record
#[derive(Clone, Serialize, Deserialize)]
pub struct SignedPreKeyRecord {
    pub key_id: u32,
    pub public_key: Vec<u8>,
    pub secret_key: Vec<u8>,
    /// Ed25519 signature of `public_key` by the identity key
    pub signature: Vec<u8>,
    pub created_at: i64,
}

impl SignedPreKeyRecord {
    pub fn key_pair(&self) -> CryptoResult<Curve25519KeyPair> {
        Curve25519KeyPair::from_bytes(&self.public_key, &self.secret_key)
    }

    /// Public half, as published in bundles
    pub fn public(&self) -> SignedPreKey {
        SignedPreKey {
            key_id: self.key_id,
            public_key: self.public_key.clone(),
            signature: self.signature.clone(),
            created_at: self.created_at,
        }
    }

    /// Age in seconds relative to `now`
    pub fn age_seconds(&self, now: i64) -> i64 {
        now - self.created_at
    }
}

impl std::fmt::Debug for SignedPreKeyRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SignedPreKeyRecord")
            .field("key_id", &self.key_id)
            .field("created_at", &self.created_at)
            .finish()
    }
}

/// Signed prekey (public part)
///
/// A Curve25519 public key with a signature from the identity key,
/// proving that the prekey belongs to the identity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignedPreKey {
    /// Unique identifier for this prekey
    pub key_id: u32,
    /// The Curve25519 public key
    pub public_key: Vec<u8>,
    /// Ed25519 signature of the public key
    pub signature: Vec<u8>,
    /// Unix timestamp when this prekey was created
    pub created_at: i64,
}

impl SignedPreKey {
    /// Verify the signature with the identity public key
    pub fn verify(&self, identity_public: &Ed25519PublicKey) -> CryptoResult<()> {
        let signature = vodozemac::Ed25519Signature::from_slice(&self.signature).map_err(|e| {
            CryptoError::SignatureError(format!("Invalid signature format: {:?}", e))
        })?;

        identity_public
            .verify(&self.public_key, &signature)
            .map_err(|e| CryptoError::SignatureError(format!("Signature verification failed: {}", e)))
    }

    /// Get the Curve25519 public key
    pub fn get_public_key(&self) -> CryptoResult<Curve25519PublicKey> {
        let arr: [u8; 32] = self
            .public_key
            .as_slice()
            .try_into()
            .map_err(|_| CryptoError::InvalidKey("Key must be 32 bytes".to_string()))?;
        Curve25519PublicKey::from_slice(&arr).map_err(Into::into)
    }
}

/// One-time prekey (public part)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OneTimePreKey {
    /// Unique identifier for this prekey
    pub key_id: u32,
    /// The Curve25519 public key
    pub public_key: Vec<u8>,
}

impl OneTimePreKey {
    /// Get the Curve25519 public key
    pub fn get_public_key(&self) -> CryptoResult<Curve25519PublicKey> {
        let arr: [u8; 32] = self
            .public_key
            .as_slice()
            .try_into()
            .map_err(|_| CryptoError::InvalidKey("Key must be 32 bytes".to_string()))?;
        Curve25519PublicKey::from_slice(&arr).map_err(Into::into)
    }
}

/// Short deterministic hash of a public key: first 8 bytes of SHA-256, hex.
pub fn fingerprint(public_key: &[u8]) -> String {
    let hash = Sha256::digest(public_key);
    hex::encode(&hash[..8])
}

/// Generate a fresh identity record with a random registration id
pub fn generate_identity_keypair() -> IdentityKeyRecord {
    let pair = IdentityKeyPair::generate();
    IdentityKeyRecord {
        public_key: pair.public_key_bytes(),
        secret_key: pair.secret_key_bytes(),
        registration_id: generate_registration_id(),
        created_at: chrono::Utc::now().timestamp(),
    }
}

/// Random registration id in `1..=MAX_REGISTRATION_ID`
pub fn generate_registration_id() -> u32 {
    rand::thread_rng().gen_range(1..=MAX_REGISTRATION_ID)
}

/// Generate `count` sequential prekeys starting at `start_id`
pub fn generate_prekeys(start_id: u32, count: u32) -> Vec<PreKeyRecord> {
    let now = chrono::Utc::now().timestamp();
    (0..count)
        .map(|i| {
            let pair = Curve25519KeyPair::generate();
            PreKeyRecord {
                key_id: start_id + i,
                public_key: pair.public_key_bytes(),
                secret_key: pair.secret_key_bytes(),
                created_at: now,
            }
        })
        .collect()
}

/// Generate a signed prekey with the given id, signed by `identity`
pub fn generate_signed_prekey(identity: &IdentityKeyPair, key_id: u32) -> SignedPreKeyRecord {
    let pair = Curve25519KeyPair::generate();
    let public_key = pair.public_key_bytes();
    let signature = identity.sign(&public_key);

    SignedPreKeyRecord {
        key_id,
        public_key,
        secret_key: pair.secret_key_bytes(),
        signature,
        created_at: chrono::Utc::now().timestamp(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identity_key_generation() {
        let key = IdentityKeyPair::generate();
        assert_eq!(key.public_key_bytes().len(), 32);
        assert_eq!(key.secret_key_bytes().len(), 32);
    }

    #[test]
    fn test_identity_record_restores_key_pair() {
        let record = generate_identity_keypair();
        let pair = record.key_pair().unwrap();
        assert_eq!(pair.fingerprint(), record.fingerprint());
        assert!((1..=MAX_REGISTRATION_ID).contains(&record.registration_id));
    }

    #[test]
    fn test_identity_record_rejects_mismatched_halves() {
        let a = generate_identity_keypair();
        let b = generate_identity_keypair();
        assert!(IdentityKeyPair::from_bytes(&a.public_key, &b.secret_key).is_err());
    }

    #[test]
    fn test_diffie_hellman() {
        let alice = Curve25519KeyPair::generate();
        let bob = Curve25519KeyPair::generate();

        let shared_alice = alice.diffie_hellman(&bob.public);
        let shared_bob = bob.diffie_hellman(&alice.public);

        assert_eq!(shared_alice, shared_bob);
    }

    #[test]
    fn test_generate_prekeys_sequential_ids() {
        let batch = generate_prekeys(40, 5);
        let ids: Vec<u32> = batch.iter().map(|k| k.key_id).collect();
        assert_eq!(ids, vec![40, 41, 42, 43, 44]);
        assert!(batch[0].key_pair().is_ok());
    }

    #[test]
    fn test_signed_prekey_verifies_against_identity() {
        let identity = IdentityKeyPair::generate();
        let record = generate_signed_prekey(&identity, 7);

        assert_eq!(record.key_id, 7);
        assert!(record.public().verify(&identity.public).is_ok());

        let other = IdentityKeyPair::generate();
        assert!(record.public().verify(&other.public).is_err());
    }

    #[test]
    fn test_fingerprint() {
        let key = IdentityKeyPair::generate();
        let fp = key.fingerprint();
        assert_eq!(fp.len(), 16);
        assert_eq!(fp, fingerprint(&key.public_key_bytes()));
    }
}

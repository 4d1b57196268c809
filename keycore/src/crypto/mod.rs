//! Signal-style cryptographic primitives
//!
//! The opaque operations the key lifecycle engine is built on. Nothing in
//! here touches storage or the network.
//!
//! ## Components
//!
//! - **keys**: Identity, signed prekey and one-time prekey generation and records
//! - **x3dh**: Extended Triple Diffie-Hellman for asynchronous key agreement
//! - **ratchet**: Pairwise double-ratchet sessions and their wire envelope
//! - **group**: Megolm sender-key state for group encryption

pub mod errors;
pub mod group;
pub mod keys;
pub mod ratchet;
pub mod x3dh;

// Re-export commonly used types
pub use errors::{CryptoError, CryptoResult};
pub use group::SenderKeyRecord;
pub use keys::{
    fingerprint, generate_identity_keypair, generate_prekeys, generate_registration_id,
    generate_signed_prekey, IdentityKeyPair, IdentityKeyRecord, OneTimePreKey, PreKeyRecord,
    SignedPreKey, SignedPreKeyRecord,
};
pub use ratchet::{SessionMessage, SessionState};
pub use x3dh::{PreKeyBundle, X3dhHeader};

//! Cryptographic error types
//!
//! Failures raised by the primitive layer (key material, X3DH, ratchet and
//! group sessions). Engine-level failures live in [`crate::error::EngineError`].

use thiserror::Error;

/// Errors that can occur during cryptographic operations
#[derive(Debug, Error)]
pub enum CryptoError {
    /// Failed to generate a key
    #[error("Key generation failed: {0}")]
    KeyGenerationFailed(String),

    /// Failed to parse or decode a key
    #[error("Invalid key format: {0}")]
    InvalidKey(String),

    /// Failed to derive a shared secret
    #[error("Key exchange failed: {0}")]
    KeyExchangeFailed(String),

    /// X3DH protocol error
    #[error("X3DH error: {0}")]
    X3dhError(String),

    /// Ratchet protocol error
    #[error("Ratchet error: {0}")]
    RatchetError(String),

    /// Signature verification failed
    #[error("Signature verification failed: {0}")]
    SignatureError(String),

    /// Encryption failed
    #[error("Encryption failed: {0}")]
    EncryptionError(String),

    /// Decryption failed
    #[error("Decryption failed: {0}")]
    DecryptionError(String),

    /// Message authentication failed
    #[error("Bad MAC: {0}")]
    BadMac(String),

    /// A peer presented an identity we have not accepted
    #[error("Untrusted identity for peer: {0}")]
    UntrustedIdentity(String),

    /// Prekey referenced by a handshake is not available locally
    #[error("No prekey available with id {0}")]
    NoPrekeyAvailable(u32),

    /// Group session state missing for a sender
    #[error("No sender key state for {0}")]
    NoSenderKeyState(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    SerializationError(String),

    /// vodozemac library error
    #[error("vodozemac error: {0}")]
    VodozemacError(String),
}

impl From<vodozemac::KeyError> for CryptoError {
    fn from(e: vodozemac::KeyError) -> Self {
        CryptoError::InvalidKey(e.to_string())
    }
}

impl From<serde_json::Error> for CryptoError {
    fn from(e: serde_json::Error) -> Self {
        CryptoError::SerializationError(e.to_string())
    }
}

impl From<aes_gcm::Error> for CryptoError {
    fn from(_: aes_gcm::Error) -> Self {
        CryptoError::BadMac("AES-GCM authentication failed".to_string())
    }
}

/// Result type for cryptographic operations
pub type CryptoResult<T> = Result<T, CryptoError>;

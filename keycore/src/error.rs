//! Error types for the key lifecycle engine

use thiserror::Error;

use crate::crypto::CryptoError;
use crate::store::StoreError;

/// Engine-wide error type
#[derive(Error, Debug)]
pub enum EngineError {
    #[error("Storage error: {0}")]
    Store(#[from] StoreError),

    #[error("{0}")]
    Crypto(#[from] CryptoError),

    #[error("HTTP request error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Server answered with a non-success status
    #[error("Server error ({status}): {body}")]
    Server { status: u16, body: String },

    /// Server unreachable or request timed out
    #[error("Network error: {0}")]
    Network(String),

    #[error("Key generation failed: {0}")]
    KeyGeneration(String),

    #[error("No session for peer: {0}")]
    NoSession(String),

    /// Stored identity record could not be read back
    #[error("Identity key corrupted: {0}")]
    IdentityCorrupted(String),

    /// Keys are being replaced; no ciphertext may be produced
    #[error("Keys invalidated: {0}")]
    KeysInvalidated(String),

    #[error("Not logged in")]
    NotLoggedIn,

    #[error("Invalid address: {0}")]
    InvalidAddress(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl EngineError {
    /// Whether the failure came from the transport rather than from key state
    pub fn is_network(&self) -> bool {
        match self {
            EngineError::Network(_) => true,
            EngineError::Http(e) => e.is_timeout() || e.is_connect() || e.is_request(),
            _ => false,
        }
    }
}

/// Result type alias for engine operations
pub type EngineResult<T> = Result<T, EngineError>;

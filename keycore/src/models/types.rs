//! Shared data types for the server API and the engine's public surface

use std::collections::HashMap;
use std::fmt;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde::{Deserialize, Serialize};

use crate::crypto::{IdentityKeyRecord, PreKeyRecord, SignedPreKeyRecord};
use crate::error::{EngineError, EngineResult};

// ============================================================================
// Addressing
// ============================================================================

/// A (user, device) pair; sessions and sender keys are scoped by it
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProtocolAddress {
    pub name: String,
    pub device_id: u32,
}

impl ProtocolAddress {
    pub fn new(name: impl Into<String>, device_id: u32) -> Self {
        Self {
            name: name.into(),
            device_id,
        }
    }

    /// Parse the `user.device` form produced by `Display`
    pub fn parse(value: &str) -> EngineResult<Self> {
        let (name, device) = value
            .rsplit_once('.')
            .ok_or_else(|| EngineError::InvalidAddress(value.to_string()))?;
        if name.is_empty() {
            return Err(EngineError::InvalidAddress(value.to_string()));
        }
        let device_id = device
            .parse()
            .map_err(|_| EngineError::InvalidAddress(value.to_string()))?;
        Ok(Self::new(name, device_id))
    }
}

impl fmt::Display for ProtocolAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.name, self.device_id)
    }
}

// ============================================================================
// Key Status / Upload
// ============================================================================

/// What the server reports holding for this device (`GET /keys/status`)
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerKeyStatus {
    #[serde(default)]
    pub identity_key: Option<String>,
    #[serde(default)]
    pub signed_pre_key: Option<String>,
    #[serde(default)]
    pub signed_pre_key_signature: Option<String>,
    #[serde(default)]
    pub pre_keys_count: u32,
    /// Sample of `prekey id -> fingerprint`; may be partial
    #[serde(default)]
    pub pre_key_fingerprints: HashMap<String, String>,
}

/// Signed prekey as uploaded
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignedPreKeyUpload {
    pub key_id: u32,
    pub public_key: String,
    pub signature: String,
}

impl From<&SignedPreKeyRecord> for SignedPreKeyUpload {
    fn from(record: &SignedPreKeyRecord) -> Self {
        Self {
            key_id: record.key_id,
            public_key: BASE64.encode(&record.public_key),
            signature: BASE64.encode(&record.signature),
        }
    }
}

/// One-time prekey as uploaded
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PreKeyUpload {
    pub key_id: u32,
    pub public_key: String,
}

impl From<&PreKeyRecord> for PreKeyUpload {
    fn from(record: &PreKeyRecord) -> Self {
        Self {
            key_id: record.key_id,
            public_key: BASE64.encode(&record.public_key),
        }
    }
}

/// Key set upload (`POST /keys/upload`)
///
/// Partial uploads leave the omitted parts untouched on the server.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KeyUpload {
    pub device_id: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub registration_id: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub identity_key: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub signed_pre_key: Option<SignedPreKeyUpload>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub pre_keys: Vec<PreKeyUpload>,
}

impl KeyUpload {
    /// Identity, signed prekey and every prekey
    pub fn full(
        device_id: u32,
        identity: &IdentityKeyRecord,
        signed_prekey: &SignedPreKeyRecord,
        prekeys: &[PreKeyRecord],
    ) -> Self {
        Self {
            device_id,
            registration_id: Some(identity.registration_id),
            identity_key: Some(BASE64.encode(&identity.public_key)),
            signed_pre_key: Some(signed_prekey.into()),
            pre_keys: prekeys.iter().map(PreKeyUpload::from).collect(),
        }
    }

    /// Signed prekey only
    pub fn signed_prekey_only(device_id: u32, signed_prekey: &SignedPreKeyRecord) -> Self {
        Self {
            device_id,
            signed_pre_key: Some(signed_prekey.into()),
            ..Default::default()
        }
    }

    /// Whether this upload replaces the identity key
    pub fn is_full(&self) -> bool {
        self.identity_key.is_some()
    }
}

// ============================================================================
// Sender Keys / Prekey Sync
// ============================================================================

/// Sender-key rotation notice (`POST /senderkey/rotate`)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SenderKeyRotation {
    pub group_id: String,
    pub address: String,
}

/// Full local prekey id list (`POST /prekeys/sync`)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PreKeySync {
    pub device_id: u32,
    pub ids: Vec<String>,
}

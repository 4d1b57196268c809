//! Sender-key state for group encryption
//!
//! Each (group, sender) pair owns a Megolm ratchet from vodozemac. The sender
//! keeps the outbound [`GroupSession`]; every member keeps an
//! [`InboundGroupSession`] built from the sender's distribution message.
//! The sender also keeps an inbound copy so it can read its own messages.
//!
//! A record that has never been initialized is *empty* rather than missing:
//! the first encrypt creates the outbound state lazily.

use serde::{Deserialize, Serialize};
use vodozemac::megolm::{
    GroupSession, GroupSessionPickle, InboundGroupSession, InboundGroupSessionPickle,
    MegolmMessage, SessionConfig, SessionKey,
};

use crate::crypto::errors::{CryptoError, CryptoResult};

/// Sender-key state for one (group, sender)
pub struct SenderKeyRecord {
    outbound: Option<GroupSession>,
    inbound: Option<InboundGroupSession>,
}

/// Serializable record state
#[derive(Serialize, Deserialize)]
struct PickledSenderKey {
    outbound: Option<GroupSessionPickle>,
    inbound: Option<InboundGroupSessionPickle>,
}

impl SenderKeyRecord {
    /// A record with no state; what a missing record loads as
    pub fn empty() -> Self {
        Self {
            outbound: None,
            inbound: None,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.outbound.is_none() && self.inbound.is_none()
    }

    /// Whether we hold the sending half (our own sender key)
    pub fn can_encrypt(&self) -> bool {
        self.outbound.is_some()
    }

    pub fn can_decrypt(&self) -> bool {
        self.inbound.is_some()
    }

    /// Fresh sending state, replacing anything held before
    pub fn generate() -> Self {
        let outbound = GroupSession::new(SessionConfig::version_1());
        let inbound = InboundGroupSession::new(&outbound.session_key(), SessionConfig::version_1());
        Self {
            outbound: Some(outbound),
            inbound: Some(inbound),
        }
    }

    /// Receiving state from a sender's distribution message
    pub fn from_distribution(message: &[u8]) -> CryptoResult<Self> {
        let encoded = std::str::from_utf8(message)
            .map_err(|e| CryptoError::InvalidKey(format!("Distribution message is not UTF-8: {}", e)))?;
        let key = SessionKey::from_base64(encoded)
            .map_err(|e| CryptoError::InvalidKey(format!("Invalid sender key distribution: {}", e)))?;
        Ok(Self {
            outbound: None,
            inbound: Some(InboundGroupSession::new(&key, SessionConfig::version_1())),
        })
    }

    /// Distribution message for our sending state, to be sent pairwise to members
    pub fn distribution_message(&self) -> CryptoResult<Vec<u8>> {
        let outbound = self
            .outbound
            .as_ref()
            .ok_or_else(|| CryptoError::NoSenderKeyState("distribution".to_string()))?;
        Ok(outbound.session_key().to_base64().into_bytes())
    }

    /// Encrypt with the outbound state; initializes it on first use
    pub fn encrypt(&mut self, plaintext: &[u8]) -> CryptoResult<Vec<u8>> {
        if self.outbound.is_none() {
            *self = Self::generate();
        }
        let outbound = self
            .outbound
            .as_mut()
            .ok_or_else(|| CryptoError::NoSenderKeyState("encrypt".to_string()))?;
        Ok(outbound.encrypt(plaintext).to_bytes())
    }

    /// Decrypt with the inbound state
    pub fn decrypt(&mut self, ciphertext: &[u8]) -> CryptoResult<Vec<u8>> {
        let inbound = self
            .inbound
            .as_mut()
            .ok_or_else(|| CryptoError::NoSenderKeyState("decrypt".to_string()))?;
        let message = MegolmMessage::from_bytes(ciphertext)
            .map_err(|e| CryptoError::DecryptionError(format!("Invalid group message: {}", e)))?;
        let decrypted = inbound
            .decrypt(&message)
            .map_err(|e| CryptoError::DecryptionError(format!("Group decrypt failed: {}", e)))?;
        Ok(decrypted.plaintext)
    }

    pub fn to_bytes(&self) -> CryptoResult<Vec<u8>> {
        let pickled = PickledSenderKey {
            outbound: self.outbound.as_ref().map(GroupSession::pickle),
            inbound: self.inbound.as_ref().map(InboundGroupSession::pickle),
        };
        Ok(serde_json::to_vec(&pickled)?)
    }

    pub fn from_bytes(bytes: &[u8]) -> CryptoResult<Self> {
        let pickled: PickledSenderKey = serde_json::from_slice(bytes)?;
        Ok(Self {
            outbound: pickled.outbound.map(GroupSession::from_pickle),
            inbound: pickled.inbound.map(InboundGroupSession::from_pickle),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_record_lazily_initializes_on_encrypt() {
        let mut record = SenderKeyRecord::empty();
        assert!(record.is_empty());

        let ciphertext = record.encrypt(b"hello group").unwrap();
        assert!(record.can_encrypt());
        assert_eq!(record.decrypt(&ciphertext).unwrap(), b"hello group");
    }

    #[test]
    fn test_distribution_lets_members_decrypt() {
        let mut sender = SenderKeyRecord::generate();
        let distribution = sender.distribution_message().unwrap();
        let member = SenderKeyRecord::from_distribution(&distribution).unwrap();
        assert!(!member.can_encrypt());

        let c1 = sender.encrypt(b"first").unwrap();
        let c2 = sender.encrypt(b"second").unwrap();

        // Survives a persistence round-trip between messages
        let mut member = SenderKeyRecord::from_bytes(&member.to_bytes().unwrap()).unwrap();
        assert_eq!(member.decrypt(&c1).unwrap(), b"first");
        assert_eq!(member.decrypt(&c2).unwrap(), b"second");
    }

    #[test]
    fn test_rotated_key_cannot_be_read_with_old_distribution() {
        let sender = SenderKeyRecord::generate();
        let mut member = SenderKeyRecord::from_distribution(&sender.distribution_message().unwrap()).unwrap();

        let mut rotated = SenderKeyRecord::generate();
        let ciphertext = rotated.encrypt(b"after rotation").unwrap();
        assert!(member.decrypt(&ciphertext).is_err());
    }

    #[test]
    fn test_empty_record_cannot_decrypt() {
        let mut record = SenderKeyRecord::empty();
        let err = record.decrypt(b"anything").unwrap_err();
        assert!(matches!(err, CryptoError::NoSenderKeyState(_)));
    }
}

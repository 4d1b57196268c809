//! Pairwise double ratchet
//!
//! A session is seeded from the X3DH shared secret. Two ratchets run on top
//! of it:
//!
//! 1. **DH ratchet**: every message carries the sender's current ratchet
//!    public key. When a new one arrives, a fresh Diffie-Hellman output is
//!    mixed into the root key and both chains are replaced, so each reply
//!    turn heals a compromised chain.
//! 2. **Symmetric chains**: one per direction, advanced per message. Each
//!    message key is used exactly once and dropped.
//!
//! The initiator's first ratchet key is paired with the responder's signed
//! prekey; the responder starts its own DH ratchet on the first message it
//! receives. Messages are sealed with AES-256-GCM over a header binding the
//! session id, ratchet key and counters.
//!
//! The initiator keeps attaching its [`X3dhHeader`] (a "prekey message") until
//! the responder's first reply arrives, so the responder can always rebuild
//! the session from whichever message reaches it first.

use std::fmt;

use aes_gcm::aead::{Aead, Payload};
use aes_gcm::{Aes256Gcm, KeyInit, Nonce};
use hkdf::Hkdf;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use vodozemac::Curve25519PublicKey;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::crypto::errors::{CryptoError, CryptoResult};
use crate::crypto::keys::{Curve25519KeyPair, IdentityKeyPair};
use crate::crypto::x3dh::{parse_identity_key, x3dh_initiate, x3dh_respond, PreKeyBundle, X3dhHeader};

/// Largest gap between the expected and received counter we will bridge,
/// and the most skipped message keys a session keeps
pub const MAX_SKIP: u32 = 1000;

const ROOT_INFO: &[u8] = b"NoChat Ratchet v2 root";
const MESSAGE_KEY_INFO: &[u8] = b"NoChat Ratchet v2 message";
const NEXT_CHAIN_INFO: &[u8] = b"NoChat Ratchet v2 chain";

/// Message type tag: 0 = PreKey, 1 = Normal
const PREKEY_MESSAGE: u8 = 0;
const NORMAL_MESSAGE: u8 = 1;

#[derive(Clone, Serialize, Deserialize, Zeroize, ZeroizeOnDrop)]
struct RootKey([u8; 32]);

#[derive(Clone, Serialize, Deserialize, Zeroize, ZeroizeOnDrop)]
struct ChainKey {
    key: [u8; 32],
    index: u32,
}

impl ChainKey {
    fn new(key: [u8; 32]) -> Self {
        Self { key, index: 0 }
    }

    /// Derive the key for the current index and move the chain forward
    fn step(&mut self) -> CryptoResult<(u32, [u8; 32])> {
        let hkdf = Hkdf::<Sha256>::new(None, &self.key);
        let mut message_key = [0u8; 32];
        let mut next = [0u8; 32];
        hkdf.expand(MESSAGE_KEY_INFO, &mut message_key)
            .and_then(|_| hkdf.expand(NEXT_CHAIN_INFO, &mut next))
            .map_err(|e| CryptoError::RatchetError(format!("Chain step failed: {}", e)))?;

        let index = self.index;
        self.key = next;
        self.index += 1;
        Ok((index, message_key))
    }
}

/// Our current ratchet key pair, kept as raw bytes for storage
#[derive(Clone, Serialize, Deserialize, Zeroize, ZeroizeOnDrop)]
struct RatchetKeyPair {
    public: [u8; 32],
    secret: [u8; 32],
}

impl RatchetKeyPair {
    fn generate() -> CryptoResult<Self> {
        Self::from_pair(&Curve25519KeyPair::generate())
    }

    fn from_pair(pair: &Curve25519KeyPair) -> CryptoResult<Self> {
        let secret: [u8; 32] = pair
            .secret_key_bytes()
            .as_slice()
            .try_into()
            .map_err(|_| CryptoError::InvalidKey("Ratchet secret must be 32 bytes".to_string()))?;
        Ok(Self {
            public: pair.public.to_bytes(),
            secret,
        })
    }

    fn diffie_hellman(&self, their_public: &[u8; 32]) -> CryptoResult<[u8; 32]> {
        let pair = Curve25519KeyPair::from_bytes(&self.public, &self.secret)?;
        let their_public = Curve25519PublicKey::from_slice(their_public)?;
        Ok(pair.diffie_hellman(&their_public))
    }
}

#[derive(Clone, Serialize, Deserialize, Zeroize, ZeroizeOnDrop)]
struct SkippedKey {
    ratchet_key: [u8; 32],
    counter: u32,
    key: [u8; 32],
}

/// Durable state of one pairwise session
#[derive(Clone, Serialize, Deserialize)]
pub struct SessionState {
    /// Random id chosen by the initiator; changes on every handshake
    pub session_id: String,
    /// Peer identity public key (Ed25519)
    pub peer_identity: Vec<u8>,
    pub peer_registration_id: u32,
    root: RootKey,
    ratchet: RatchetKeyPair,
    /// Peer's latest ratchet public key; unset on the responder until the first message
    remote_ratchet: Option<[u8; 32]>,
    sending: Option<ChainKey>,
    receiving: Option<ChainKey>,
    /// Length of our previous sending chain, sent so the peer can skip its tail
    previous_sending: u32,
    skipped: Vec<SkippedKey>,
    /// Set on the initiator until the responder has answered
    pending_prekey: Option<X3dhHeader>,
    pub created_at: i64,
    pub last_used: i64,
    pub messages_sent: u64,
    pub messages_received: u64,
    /// Decrypt failures since the last successful decrypt
    pub decrypt_failures: u32,
}

impl fmt::Debug for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionState")
            .field("session_id", &self.session_id)
            .field("peer_registration_id", &self.peer_registration_id)
            .field("acknowledged", &self.is_acknowledged())
            .field("messages_sent", &self.messages_sent)
            .field("messages_received", &self.messages_received)
            .field("decrypt_failures", &self.decrypt_failures)
            .finish_non_exhaustive()
    }
}

impl SessionState {
    /// Run the initiator side of X3DH against `bundle` and build the session
    pub fn initiate(
        our_identity: &IdentityKeyPair,
        our_registration_id: u32,
        bundle: &PreKeyBundle,
    ) -> CryptoResult<Self> {
        let result = x3dh_initiate(our_identity, bundle)?;
        let header = X3dhHeader {
            identity_key: our_identity.public_key_bytes(),
            registration_id: our_registration_id,
            ephemeral_key: result.ephemeral_public,
            signed_prekey_id: bundle.signed_prekey.key_id,
            one_time_prekey_id: result.used_one_time_prekey,
        };

        // The responder's signed prekey doubles as its first ratchet key
        let their_ratchet = bundle.signed_prekey.get_public_key()?.to_bytes();
        let ratchet = RatchetKeyPair::generate()?;
        let (root, sending) = kdf_root(&result.shared_secret, &ratchet.diffie_hellman(&their_ratchet)?)?;

        let mut state = Self::new(
            uuid::Uuid::new_v4().to_string(),
            bundle.identity_key.clone(),
            bundle.registration_id,
            root,
            ratchet,
            Some(header),
        );
        state.remote_ratchet = Some(their_ratchet);
        state.sending = Some(ChainKey::new(sending));
        Ok(state)
    }

    /// Run the responder side of X3DH for an incoming prekey message
    ///
    /// The session has no chains yet; decrypting the prekey message runs the
    /// first DH ratchet step.
    pub fn respond(
        our_identity: &IdentityKeyPair,
        our_signed_prekey: &Curve25519KeyPair,
        our_one_time_prekey: Option<&Curve25519KeyPair>,
        header: &X3dhHeader,
        session_id: &str,
    ) -> CryptoResult<Self> {
        let their_identity = parse_identity_key(&header.identity_key)?;
        let ephemeral: [u8; 32] = header
            .ephemeral_key
            .as_slice()
            .try_into()
            .map_err(|_| CryptoError::InvalidKey("Ephemeral key must be 32 bytes".to_string()))?;
        let their_ephemeral = Curve25519PublicKey::from_slice(&ephemeral)?;
        let secret = x3dh_respond(
            our_identity,
            our_signed_prekey,
            our_one_time_prekey,
            &their_identity,
            &their_ephemeral,
        )?;

        Ok(Self::new(
            session_id.to_string(),
            header.identity_key.clone(),
            header.registration_id,
            secret,
            RatchetKeyPair::from_pair(our_signed_prekey)?,
            None,
        ))
    }

    fn new(
        session_id: String,
        peer_identity: Vec<u8>,
        peer_registration_id: u32,
        root: [u8; 32],
        ratchet: RatchetKeyPair,
        pending_prekey: Option<X3dhHeader>,
    ) -> Self {
        let now = chrono::Utc::now().timestamp();
        Self {
            session_id,
            peer_identity,
            peer_registration_id,
            root: RootKey(root),
            ratchet,
            remote_ratchet: None,
            sending: None,
            receiving: None,
            previous_sending: 0,
            skipped: Vec::new(),
            pending_prekey,
            created_at: now,
            last_used: now,
            messages_sent: 0,
            messages_received: 0,
            decrypt_failures: 0,
        }
    }

    /// Whether the responder has answered yet (initiator side)
    pub fn is_acknowledged(&self) -> bool {
        self.pending_prekey.is_none()
    }

    /// Encrypt `plaintext`, advancing the sending chain
    pub fn encrypt(&mut self, plaintext: &[u8]) -> CryptoResult<Vec<u8>> {
        let sending = self
            .sending
            .as_mut()
            .ok_or_else(|| CryptoError::RatchetError("Session has no sending chain yet".to_string()))?;
        let (counter, key) = sending.step()?;

        let header = MessageHeader {
            ratchet_key: self.ratchet.public,
            previous_counter: self.previous_sending,
            counter,
        };
        let message = seal(&key, &self.session_id, header, plaintext)?;

        let envelope = match &self.pending_prekey {
            Some(header) => SessionMessage::PreKey {
                header: header.clone(),
                session_id: self.session_id.clone(),
                message,
            },
            None => SessionMessage::Normal {
                session_id: self.session_id.clone(),
                message,
            },
        };

        self.messages_sent += 1;
        self.last_used = chrono::Utc::now().timestamp();
        envelope.to_bytes()
    }

    /// Decrypt a message addressed to this session
    ///
    /// State is only committed on success, so a forged or corrupted message
    /// never advances either ratchet.
    pub fn decrypt(&mut self, message: &RatchetMessage) -> CryptoResult<Vec<u8>> {
        let mut next = self.clone();
        let key = next.message_key_for(message)?;
        let plaintext = open(&key, &next.session_id, message)?;

        next.pending_prekey = None;
        next.messages_received += 1;
        next.decrypt_failures = 0;
        next.last_used = chrono::Utc::now().timestamp();
        *self = next;
        Ok(plaintext)
    }

    fn message_key_for(&mut self, message: &RatchetMessage) -> CryptoResult<[u8; 32]> {
        if let Some(pos) = self
            .skipped
            .iter()
            .position(|s| s.ratchet_key == message.ratchet_key && s.counter == message.counter)
        {
            return Ok(self.skipped.remove(pos).key);
        }

        if self.remote_ratchet != Some(message.ratchet_key) {
            // Keep the tail of the old receiving chain for late arrivals
            self.skip_until(message.previous_counter)?;
            self.dh_ratchet(&message.ratchet_key)?;
        }

        self.skip_until(message.counter)?;
        let receiving = self
            .receiving
            .as_mut()
            .ok_or_else(|| CryptoError::RatchetError("Session has no receiving chain".to_string()))?;
        if receiving.index != message.counter {
            return Err(CryptoError::DecryptionError(format!(
                "Message key {} already used",
                message.counter
            )));
        }
        let (_, key) = receiving.step()?;
        Ok(key)
    }

    /// Advance the receiving chain to `until`, keeping the skipped keys
    fn skip_until(&mut self, until: u32) -> CryptoResult<()> {
        let (Some(remote), Some(receiving)) = (self.remote_ratchet, self.receiving.as_mut()) else {
            return Ok(());
        };
        if until <= receiving.index {
            return Ok(());
        }
        if until - receiving.index > MAX_SKIP {
            return Err(CryptoError::RatchetError(format!(
                "Too many skipped messages: {} (max {})",
                until - receiving.index,
                MAX_SKIP
            )));
        }

        while receiving.index < until {
            let (counter, key) = receiving.step()?;
            self.skipped.push(SkippedKey {
                ratchet_key: remote,
                counter,
                key,
            });
            if self.skipped.len() > MAX_SKIP as usize {
                self.skipped.remove(0);
            }
        }
        Ok(())
    }

    /// Take the peer's new ratchet key: new receiving chain, new ratchet key, new sending chain
    fn dh_ratchet(&mut self, their_ratchet: &[u8; 32]) -> CryptoResult<()> {
        self.previous_sending = self.sending.as_ref().map_or(0, |chain| chain.index);
        self.remote_ratchet = Some(*their_ratchet);

        let (root, receiving) = kdf_root(&self.root.0, &self.ratchet.diffie_hellman(their_ratchet)?)?;
        self.ratchet = RatchetKeyPair::generate()?;
        let (root, sending) = kdf_root(&root, &self.ratchet.diffie_hellman(their_ratchet)?)?;

        self.root = RootKey(root);
        self.receiving = Some(ChainKey::new(receiving));
        self.sending = Some(ChainKey::new(sending));
        Ok(())
    }
}

/// Mix a DH output into the root key: (new root key, new chain key)
fn kdf_root(root: &[u8; 32], dh_output: &[u8; 32]) -> CryptoResult<([u8; 32], [u8; 32])> {
    let hkdf = Hkdf::<Sha256>::new(Some(root), dh_output);
    let mut okm = [0u8; 64];
    hkdf.expand(ROOT_INFO, &mut okm)
        .map_err(|e| CryptoError::KeyExchangeFailed(format!("HKDF expansion failed: {}", e)))?;

    let mut next_root = [0u8; 32];
    let mut chain = [0u8; 32];
    next_root.copy_from_slice(&okm[..32]);
    chain.copy_from_slice(&okm[32..]);
    okm.zeroize();
    Ok((next_root, chain))
}

#[derive(Clone, Copy)]
struct MessageHeader {
    ratchet_key: [u8; 32],
    previous_counter: u32,
    counter: u32,
}

fn associated_data(session_id: &str, header: &MessageHeader) -> Vec<u8> {
    let mut aad = Vec::with_capacity(session_id.len() + 40);
    aad.extend_from_slice(session_id.as_bytes());
    aad.extend_from_slice(&header.ratchet_key);
    aad.extend_from_slice(&header.previous_counter.to_be_bytes());
    aad.extend_from_slice(&header.counter.to_be_bytes());
    aad
}

fn seal(
    key: &[u8; 32],
    session_id: &str,
    header: MessageHeader,
    plaintext: &[u8],
) -> CryptoResult<RatchetMessage> {
    let cipher = Aes256Gcm::new_from_slice(key)
        .map_err(|e| CryptoError::EncryptionError(e.to_string()))?;
    let mut nonce = [0u8; 12];
    rand::thread_rng().fill_bytes(&mut nonce);

    let aad = associated_data(session_id, &header);
    let ciphertext = cipher
        .encrypt(Nonce::from_slice(&nonce), Payload { msg: plaintext, aad: &aad })
        .map_err(|_| CryptoError::EncryptionError("AES-GCM encryption failed".to_string()))?;

    Ok(RatchetMessage {
        ratchet_key: header.ratchet_key,
        previous_counter: header.previous_counter,
        counter: header.counter,
        nonce,
        ciphertext,
    })
}

fn open(key: &[u8; 32], session_id: &str, message: &RatchetMessage) -> CryptoResult<Vec<u8>> {
    let cipher = Aes256Gcm::new_from_slice(key)
        .map_err(|e| CryptoError::DecryptionError(e.to_string()))?;
    let aad = associated_data(session_id, &message.header());
    let plaintext = cipher.decrypt(
        Nonce::from_slice(&message.nonce),
        Payload { msg: &message.ciphertext, aad: &aad },
    )?;
    Ok(plaintext)
}

/// One sealed message on a session chain
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RatchetMessage {
    /// Sender's current ratchet public key
    pub ratchet_key: [u8; 32],
    /// Length of the sender's previous sending chain
    pub previous_counter: u32,
    pub counter: u32,
    pub nonce: [u8; 12],
    pub ciphertext: Vec<u8>,
}

impl RatchetMessage {
    fn header(&self) -> MessageHeader {
        MessageHeader {
            ratchet_key: self.ratchet_key,
            previous_counter: self.previous_counter,
            counter: self.counter,
        }
    }
}

/// Wire envelope for pairwise messages
#[derive(Debug, Clone)]
pub enum SessionMessage {
    /// Carries the initiator's handshake so the responder can build the session
    PreKey {
        header: X3dhHeader,
        session_id: String,
        message: RatchetMessage,
    },
    Normal {
        session_id: String,
        message: RatchetMessage,
    },
}

#[derive(Serialize, Deserialize)]
struct PreKeyBody {
    header: X3dhHeader,
    session_id: String,
    message: RatchetMessage,
}

#[derive(Serialize, Deserialize)]
struct NormalBody {
    session_id: String,
    message: RatchetMessage,
}

impl SessionMessage {
    pub fn session_id(&self) -> &str {
        match self {
            SessionMessage::PreKey { session_id, .. } | SessionMessage::Normal { session_id, .. } => session_id,
        }
    }

    pub fn ratchet_message(&self) -> &RatchetMessage {
        match self {
            SessionMessage::PreKey { message, .. } | SessionMessage::Normal { message, .. } => message,
        }
    }

    /// Serialize to bytes for transmission: type byte followed by the body
    pub fn to_bytes(&self) -> CryptoResult<Vec<u8>> {
        let (message_type, body) = match self {
            SessionMessage::PreKey { header, session_id, message } => (
                PREKEY_MESSAGE,
                serde_json::to_vec(&PreKeyBody {
                    header: header.clone(),
                    session_id: session_id.clone(),
                    message: message.clone(),
                })?,
            ),
            SessionMessage::Normal { session_id, message } => (
                NORMAL_MESSAGE,
                serde_json::to_vec(&NormalBody {
                    session_id: session_id.clone(),
                    message: message.clone(),
                })?,
            ),
        };

        let mut bytes = Vec::with_capacity(1 + body.len());
        bytes.push(message_type);
        bytes.extend_from_slice(&body);
        Ok(bytes)
    }

    /// Deserialize from bytes
    pub fn from_bytes(bytes: &[u8]) -> CryptoResult<Self> {
        let (message_type, body) = bytes
            .split_first()
            .ok_or_else(|| CryptoError::DecryptionError("Empty message bytes".to_string()))?;

        match *message_type {
            PREKEY_MESSAGE => {
                let body: PreKeyBody = serde_json::from_slice(body)
                    .map_err(|e| CryptoError::DecryptionError(format!("Invalid PreKey message: {}", e)))?;
                Ok(SessionMessage::PreKey {
                    header: body.header,
                    session_id: body.session_id,
                    message: body.message,
                })
            }
            NORMAL_MESSAGE => {
                let body: NormalBody = serde_json::from_slice(body)
                    .map_err(|e| CryptoError::DecryptionError(format!("Invalid message: {}", e)))?;
                Ok(SessionMessage::Normal {
                    session_id: body.session_id,
                    message: body.message,
                })
            }
            other => Err(CryptoError::DecryptionError(format!(
                "Unknown message type: {}",
                other
            ))),
        }
    }
}

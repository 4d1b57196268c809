//! X3DH (Extended Triple Diffie-Hellman) Key Agreement
//!
//! Asynchronous handshake used to bootstrap a pairwise session from a prekey
//! bundle published by the peer:
//!
//! - DH1 = DH(IK_A, SPK_B)
//! - DH2 = DH(EK_A, IK_B)
//! - DH3 = DH(EK_A, SPK_B)
//! - DH4 = DH(EK_A, OPK_B) when a one-time prekey was handed out
//!
//! SK = HKDF(0xFF*32 || DH1 || DH2 || DH3 [|| DH4])

use hkdf::Hkdf;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use vodozemac::{Curve25519PublicKey, Ed25519PublicKey};

use crate::crypto::errors::{CryptoError, CryptoResult};
use crate::crypto::keys::{Curve25519KeyPair, IdentityKeyPair, OneTimePreKey, SignedPreKey};

const X3DH_INFO: &[u8] = b"NoChat X3DH v1";

/// Result of X3DH key agreement (initiator side)
pub struct X3dhResult {
    /// The derived shared secret (32 bytes)
    pub shared_secret: [u8; 32],
    /// The ephemeral public key to send to the responder
    pub ephemeral_public: Vec<u8>,
    /// The ID of the one-time prekey that was used (if any)
    pub used_one_time_prekey: Option<u32>,
}

/// Prekey bundle fetched from the server for one (user, device)
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PreKeyBundle {
    pub registration_id: u32,
    pub device_id: u32,
    /// The responder's identity public key (Ed25519)
    pub identity_key: Vec<u8>,
    /// The responder's signed prekey
    pub signed_prekey: SignedPreKey,
    /// Optional one-time prekey (consumed after use)
    pub one_time_prekey: Option<OneTimePreKey>,
}

impl PreKeyBundle {
    /// Get the identity key as Ed25519PublicKey
    pub fn get_identity_key(&self) -> CryptoResult<Ed25519PublicKey> {
        parse_identity_key(&self.identity_key)
    }

    /// Verify that the signed prekey has a valid signature from the identity key
    pub fn verify(&self) -> CryptoResult<()> {
        let identity_key = self.get_identity_key()?;
        self.signed_prekey.verify(&identity_key)
    }
}

/// Information sent from initiator to responder with every message until
/// the responder has answered.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct X3dhHeader {
    /// Initiator's identity public key
    pub identity_key: Vec<u8>,
    /// Initiator's registration id
    pub registration_id: u32,
    /// Initiator's ephemeral public key
    pub ephemeral_key: Vec<u8>,
    /// ID of the signed prekey that was used
    pub signed_prekey_id: u32,
    /// ID of the one-time prekey that was used (if any)
    pub one_time_prekey_id: Option<u32>,
}

pub(crate) fn parse_identity_key(bytes: &[u8]) -> CryptoResult<Ed25519PublicKey> {
    let arr: [u8; 32] = bytes
        .try_into()
        .map_err(|_| CryptoError::InvalidKey("Identity key must be 32 bytes".to_string()))?;
    Ed25519PublicKey::from_slice(&arr)
        .map_err(|e| CryptoError::InvalidKey(format!("Invalid identity key: {:?}", e)))
}

/// Perform X3DH key agreement (initiator side)
///
/// Verifies the bundle signature, generates an ephemeral key and derives the
/// shared secret.
pub fn x3dh_initiate(
    our_identity: &IdentityKeyPair,
    their_bundle: &PreKeyBundle,
) -> CryptoResult<X3dhResult> {
    their_bundle.verify()?;

    let ephemeral = Curve25519KeyPair::generate();

    let their_identity = their_bundle.get_identity_key()?;
    let their_signed_prekey = their_bundle.signed_prekey.get_public_key()?;

    let our_identity_curve = convert_ed25519_to_curve25519_secret(&our_identity.secret_key_bytes())?;
    let dh1 = our_identity_curve.diffie_hellman(&their_signed_prekey);

    let their_identity_curve = convert_ed25519_to_curve25519_public(&their_identity)?;
    let dh2 = ephemeral.diffie_hellman(&their_identity_curve);

    let dh3 = ephemeral.diffie_hellman(&their_signed_prekey);

    let (dh4, used_otk_id) = match their_bundle.one_time_prekey {
        Some(ref otk) => {
            let their_otk = otk.get_public_key()?;
            (Some(ephemeral.diffie_hellman(&their_otk)), Some(otk.key_id))
        }
        None => (None, None),
    };

    let shared_secret = kdf_x3dh(&dh1, &dh2, &dh3, dh4.as_ref())?;

    Ok(X3dhResult {
        shared_secret,
        ephemeral_public: ephemeral.public_key_bytes(),
        used_one_time_prekey: used_otk_id,
    })
}

/// Perform X3DH key agreement (responder side)
///
/// Uses our signed prekey and the consumed one-time prekey to derive the
/// same secret the initiator computed.
pub fn x3dh_respond(
    our_identity: &IdentityKeyPair,
    our_signed_prekey: &Curve25519KeyPair,
    our_one_time_prekey: Option<&Curve25519KeyPair>,
    their_identity: &Ed25519PublicKey,
    their_ephemeral: &Curve25519PublicKey,
) -> CryptoResult<[u8; 32]> {
    let their_identity_curve = convert_ed25519_to_curve25519_public(their_identity)?;

    let dh1 = our_signed_prekey.diffie_hellman(&their_identity_curve);

    let our_identity_curve = convert_ed25519_to_curve25519_secret(&our_identity.secret_key_bytes())?;
    let dh2 = our_identity_curve.diffie_hellman(their_ephemeral);

    let dh3 = our_signed_prekey.diffie_hellman(their_ephemeral);

    let dh4 = our_one_time_prekey.map(|otk| otk.diffie_hellman(their_ephemeral));

    kdf_x3dh(&dh1, &dh2, &dh3, dh4.as_ref())
}

fn kdf_x3dh(
    dh1: &[u8; 32],
    dh2: &[u8; 32],
    dh3: &[u8; 32],
    dh4: Option<&[u8; 32]>,
) -> CryptoResult<[u8; 32]> {
    let mut input = Vec::with_capacity(if dh4.is_some() { 160 } else { 128 });

    input.extend_from_slice(&[0xFF; 32]);
    input.extend_from_slice(dh1);
    input.extend_from_slice(dh2);
    input.extend_from_slice(dh3);
    if let Some(dh4_bytes) = dh4 {
        input.extend_from_slice(dh4_bytes);
    }

    let hkdf = Hkdf::<Sha256>::new(None, &input);
    let mut output = [0u8; 32];
    hkdf.expand(X3DH_INFO, &mut output)
        .map_err(|e| CryptoError::KeyExchangeFailed(format!("HKDF expansion failed: {}", e)))?;

    Ok(output)
}

/// Convert an Ed25519 secret seed to its Curve25519 equivalent
fn convert_ed25519_to_curve25519_secret(ed_secret: &[u8]) -> CryptoResult<Curve25519KeyPair> {
    use sha2::{Digest, Sha512};

    if ed_secret.len() < 32 {
        return Err(CryptoError::InvalidKey(
            "Ed25519 secret key too short".to_string(),
        ));
    }

    let hash = Sha512::digest(&ed_secret[..32]);

    let mut curve_secret = [0u8; 32];
    curve_secret.copy_from_slice(&hash[..32]);

    // Curve25519 clamping
    curve_secret[0] &= 248;
    curve_secret[31] &= 127;
    curve_secret[31] |= 64;

    let secret = x25519_dalek::StaticSecret::from(curve_secret);
    let public = x25519_dalek::PublicKey::from(&secret);

    Curve25519KeyPair::from_bytes(public.as_bytes(), curve_secret.as_ref())
}

/// Convert an Ed25519 public key to its Curve25519 (Montgomery) form
fn convert_ed25519_to_curve25519_public(
    ed_public: &Ed25519PublicKey,
) -> CryptoResult<Curve25519PublicKey> {
    use curve25519_dalek::edwards::CompressedEdwardsY;

    let compressed = CompressedEdwardsY::from_slice(ed_public.as_bytes())
        .map_err(|e| CryptoError::InvalidKey(format!("Invalid Ed25519 public key: {:?}", e)))?;

    let point = compressed.decompress().ok_or_else(|| {
        CryptoError::InvalidKey("Failed to decompress Ed25519 public key".to_string())
    })?;

    let curve_bytes = point.to_montgomery().to_bytes();
    Curve25519PublicKey::from_slice(&curve_bytes).map_err(Into::into)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::keys::{generate_prekeys, generate_signed_prekey};

    fn bundle_for(identity: &IdentityKeyPair, with_otk: bool) -> (PreKeyBundle, Curve25519KeyPair, Option<Curve25519KeyPair>) {
        let signed = generate_signed_prekey(identity, 1);
        let otk = generate_prekeys(1, 1).pop();
        let bundle = PreKeyBundle {
            registration_id: 42,
            device_id: 1,
            identity_key: identity.public_key_bytes(),
            signed_prekey: signed.public(),
            one_time_prekey: otk.as_ref().filter(|_| with_otk).map(|k| k.public()),
        };
        let otk_pair = otk.filter(|_| with_otk).map(|k| k.key_pair().unwrap());
        (bundle, signed.key_pair().unwrap(), otk_pair)
    }

    #[test]
    fn test_x3dh_key_agreement() {
        let alice_identity = IdentityKeyPair::generate();
        let bob_identity = IdentityKeyPair::generate();
        let (bob_bundle, bob_spk, bob_otk) = bundle_for(&bob_identity, true);

        let alice_result = x3dh_initiate(&alice_identity, &bob_bundle).unwrap();
        let alice_ephemeral =
            Curve25519PublicKey::from_slice(&alice_result.ephemeral_public).unwrap();

        let bob_secret = x3dh_respond(
            &bob_identity,
            &bob_spk,
            bob_otk.as_ref(),
            &alice_identity.public,
            &alice_ephemeral,
        )
        .unwrap();

        assert_eq!(alice_result.shared_secret, bob_secret);
        assert_eq!(alice_result.used_one_time_prekey, Some(1));
    }

    #[test]
    fn test_x3dh_without_one_time_prekey() {
        let alice_identity = IdentityKeyPair::generate();
        let bob_identity = IdentityKeyPair::generate();
        let (bob_bundle, bob_spk, _) = bundle_for(&bob_identity, false);

        let alice_result = x3dh_initiate(&alice_identity, &bob_bundle).unwrap();
        let alice_ephemeral =
            Curve25519PublicKey::from_slice(&alice_result.ephemeral_public).unwrap();

        let bob_secret = x3dh_respond(
            &bob_identity,
            &bob_spk,
            None,
            &alice_identity.public,
            &alice_ephemeral,
        )
        .unwrap();

        assert_eq!(alice_result.shared_secret, bob_secret);
        assert_eq!(alice_result.used_one_time_prekey, None);
    }

    #[test]
    fn test_tampered_bundle_is_rejected() {
        let identity = IdentityKeyPair::generate();
        let (mut bundle, _, _) = bundle_for(&identity, false);
        assert!(bundle.verify().is_ok());

        bundle.signed_prekey.signature[0] ^= 0xFF;
        assert!(bundle.verify().is_err());
        assert!(x3dh_initiate(&IdentityKeyPair::generate(), &bundle).is_err());
    }
}

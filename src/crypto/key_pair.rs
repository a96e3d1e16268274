use rand::TryRngCore;
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use serde_big_array::BigArray;
use x25519_dalek::{PublicKey, StaticSecret};

use crate::crypto::xed25519;

/// The DJB key-type constant prepended to serialized public keys.
pub const DJB_TYPE: u8 = 5;

/// Signed prekey ids roll over in a 24-bit space.
const SIGNED_KEY_ID_MASK: u32 = 0x00FF_FFFF;

/// An X25519 key pair.
///
/// Invariant: `public_key` is the basepoint multiple of the clamped
/// `private_key` scalar.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeyPair {
    pub public_key: [u8; 32],
    pub private_key: [u8; 32],
}

impl KeyPair {
    /// Generates a new random X25519 key pair.
    pub fn new() -> Self {
        let mut p_bytes = [0u8; 32];
        OsRng.try_fill_bytes(&mut p_bytes).expect("RNG failure");
        let private = StaticSecret::from(p_bytes);
        let public = PublicKey::from(&private);
        Self {
            public_key: *public.as_bytes(),
            private_key: private.to_bytes(),
        }
    }

    /// Creates a key pair from an existing 32-byte private key.
    pub fn from_private_key(private_key: [u8; 32]) -> Self {
        let private = StaticSecret::from(private_key);
        let public = PublicKey::from(&private);
        Self {
            public_key: *public.as_bytes(),
            private_key: private.to_bytes(),
        }
    }

    /// X25519 key agreement with a peer public key.
    pub fn agree(&self, their_public: &[u8; 32]) -> [u8; 32] {
        let private = StaticSecret::from(self.private_key);
        *private
            .diffie_hellman(&PublicKey::from(*their_public))
            .as_bytes()
    }

    /// Serializes the public half with the DJB type byte prepended.
    pub fn serialized_public(&self) -> [u8; 33] {
        serialize_public(&self.public_key)
    }

    /// Signs another key pair's public key via XEd25519. The signed
    /// message is the DJB-prefixed public key, as the protocol requires.
    pub fn sign_key(&self, key_to_sign: &KeyPair) -> [u8; 64] {
        self.sign_message(&serialize_public(&key_to_sign.public_key))
    }

    /// Signs an arbitrary byte slice via XEd25519.
    pub fn sign_message(&self, message: &[u8]) -> [u8; 64] {
        xed25519::sign(&self.private_key, message)
    }
}

impl Default for KeyPair {
    fn default() -> Self {
        Self::new()
    }
}

pub fn serialize_public(public_key: &[u8; 32]) -> [u8; 33] {
    let mut out = [0u8; 33];
    out[0] = DJB_TYPE;
    out[1..].copy_from_slice(public_key);
    out
}

/// Parses a wire public key: 33 bytes with the DJB type byte.
pub fn deserialize_public(value: &[u8]) -> Option<[u8; 32]> {
    match value.len() {
        33 if value[0] == DJB_TYPE => value[1..].try_into().ok(),
        32 => value.try_into().ok(),
        _ => None,
    }
}

/// A signed prekey: a key pair whose public half carries an XEd25519
/// signature by the identity key.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignedKeyPair {
    pub id: u32,
    pub key_pair: KeyPair,
    #[serde(with = "BigArray")]
    pub signature: [u8; 64],
}

impl SignedKeyPair {
    pub fn new(id: u32, identity: &KeyPair) -> Self {
        let key_pair = KeyPair::new();
        let signature = identity.sign_key(&key_pair);
        Self {
            id: id & SIGNED_KEY_ID_MASK,
            key_pair,
            signature,
        }
    }

    pub fn verify(&self, identity_public: &[u8; 32]) -> bool {
        xed25519::verify(
            identity_public,
            &serialize_public(&self.key_pair.public_key),
            &self.signature,
        )
    }
}

/// A one-time prekey. Consumed at most once by an incoming prekey message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PreKey {
    pub id: u32,
    pub key_pair: KeyPair,
}

impl PreKey {
    pub fn new(id: u32) -> Self {
        Self {
            id,
            key_pair: KeyPair::new(),
        }
    }
}

//! Key derivation for the Double Ratchet: root keys, chain keys and
//! per-message key material.

use arrayref::array_ref;

use crate::crypto::hmac_sha256;
use crate::crypto::key_pair::KeyPair;

const MESSAGE_KEY_SEED: [u8; 1] = [0x01];
const CHAIN_KEY_SEED: [u8; 1] = [0x02];

/// Derives the initial (root, chain) pair from the X3DH master secret.
/// The master input must already carry the 0xFF discontinuity prefix.
pub fn derive_initial_keys(master: &[u8]) -> (RootKey, ChainKey) {
    let mut okm = [0u8; 64];
    hkdf::Hkdf::<sha2::Sha256>::new(None, master)
        .expand(b"WhisperText", &mut okm)
        .expect("valid output length");
    (
        RootKey::new(*array_ref![okm, 0, 32]),
        ChainKey::new(*array_ref![okm, 32, 32], 0),
    )
}

#[derive(Clone, Debug)]
pub struct RootKey {
    key: [u8; 32],
}

impl RootKey {
    pub fn new(key: [u8; 32]) -> Self {
        Self { key }
    }

    pub fn key(&self) -> &[u8; 32] {
        &self.key
    }

    /// One DH-ratchet step: mixes a fresh agreement into the root and
    /// yields the successor root plus a fresh chain.
    pub fn create_chain(&self, their_ratchet_key: &[u8; 32], our_ratchet: &KeyPair) -> (RootKey, ChainKey) {
        let shared_secret = our_ratchet.agree(their_ratchet_key);
        let mut okm = [0u8; 64];
        hkdf::Hkdf::<sha2::Sha256>::new(Some(&self.key), &shared_secret)
            .expand(b"WhisperRatchet", &mut okm)
            .expect("valid output length");
        (
            RootKey::new(*array_ref![okm, 0, 32]),
            ChainKey::new(*array_ref![okm, 32, 32], 0),
        )
    }
}

#[derive(Clone, Copy, Debug)]
pub struct ChainKey {
    key: [u8; 32],
    index: u32,
}

impl ChainKey {
    pub fn new(key: [u8; 32], index: u32) -> Self {
        Self { key, index }
    }

    #[inline]
    pub fn key(&self) -> &[u8; 32] {
        &self.key
    }

    #[inline]
    pub fn index(&self) -> u32 {
        self.index
    }

    pub fn next_chain_key(&self) -> Self {
        Self {
            key: hmac_sha256(&self.key, &[&CHAIN_KEY_SEED]),
            index: self.index + 1,
        }
    }

    /// The 32-byte seed stashed for out-of-order messages; expanded to
    /// full message keys only when the message actually arrives.
    pub fn message_key_seed(&self) -> [u8; 32] {
        hmac_sha256(&self.key, &[&MESSAGE_KEY_SEED])
    }

    pub fn message_keys(&self) -> MessageKeys {
        MessageKeys::derive(&self.message_key_seed(), self.index)
    }
}

#[derive(Clone)]
pub struct MessageKeys {
    cipher_key: [u8; 32],
    mac_key: [u8; 32],
    iv: [u8; 16],
    counter: u32,
}

impl MessageKeys {
    pub fn derive(seed: &[u8; 32], counter: u32) -> Self {
        let mut okm = [0u8; 80];
        hkdf::Hkdf::<sha2::Sha256>::new(None, seed)
            .expand(b"WhisperMessageKeys", &mut okm)
            .expect("valid output length");
        Self {
            cipher_key: *array_ref![okm, 0, 32],
            mac_key: *array_ref![okm, 32, 32],
            iv: *array_ref![okm, 64, 16],
            counter,
        }
    }

    #[inline]
    pub fn cipher_key(&self) -> &[u8; 32] {
        &self.cipher_key
    }

    #[inline]
    pub fn mac_key(&self) -> &[u8; 32] {
        &self.mac_key
    }

    #[inline]
    pub fn iv(&self) -> &[u8; 16] {
        &self.iv
    }

    #[inline]
    pub fn counter(&self) -> u32 {
        self.counter
    }
}

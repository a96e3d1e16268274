//! Per-(group, sender) ratchet state.

use std::collections::BTreeMap;

use arrayref::array_ref;
use serde::{Deserialize, Serialize};

use crate::crypto::hmac_sha256;
use crate::crypto::key_pair::KeyPair;
use crate::signal::consts;

const MESSAGE_KEY_SEED: [u8; 1] = [0x01];
const CHAIN_KEY_SEED: [u8; 1] = [0x02];

/// The symmetric group chain: seed plus iteration counter.
#[derive(Debug, Clone, Copy)]
pub struct SenderChainKey {
    seed: [u8; 32],
    iteration: u32,
}

impl SenderChainKey {
    pub fn new(seed: [u8; 32], iteration: u32) -> Self {
        Self { seed, iteration }
    }

    pub fn seed(&self) -> &[u8; 32] {
        &self.seed
    }

    pub fn iteration(&self) -> u32 {
        self.iteration
    }

    pub fn next(&self) -> Self {
        Self {
            seed: hmac_sha256(&self.seed, &[&CHAIN_KEY_SEED]),
            iteration: self.iteration + 1,
        }
    }

    pub fn message_key_seed(&self) -> [u8; 32] {
        hmac_sha256(&self.seed, &[&MESSAGE_KEY_SEED])
    }

    pub fn message_key(&self) -> SenderMessageKey {
        SenderMessageKey::derive(&self.message_key_seed(), self.iteration)
    }
}

/// Expanded key material for one group message.
#[derive(Debug, Clone)]
pub struct SenderMessageKey {
    iv: [u8; 16],
    cipher_key: [u8; 32],
    iteration: u32,
}

impl SenderMessageKey {
    pub fn derive(seed: &[u8; 32], iteration: u32) -> Self {
        let mut okm = [0u8; 48];
        hkdf::Hkdf::<sha2::Sha256>::new(None, seed)
            .expand(b"WhisperGroup", &mut okm)
            .expect("valid output length");
        Self {
            iv: *array_ref![okm, 0, 16],
            cipher_key: *array_ref![okm, 16, 32],
            iteration,
        }
    }

    pub fn iv(&self) -> &[u8; 16] {
        &self.iv
    }

    pub fn cipher_key(&self) -> &[u8; 32] {
        &self.cipher_key
    }

    pub fn iteration(&self) -> u32 {
        self.iteration
    }
}

/// One ratchet epoch for a sender in a group. The signing private key
/// is present only for our own states.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SenderKeyState {
    pub key_id: u32,
    pub chain_key: [u8; 32],
    pub iteration: u32,
    pub signature_public: [u8; 32],
    #[serde(default)]
    pub signature_private: Option<[u8; 32]>,
    /// Stashed message-key seeds for out-of-order group delivery.
    #[serde(default)]
    pub message_keys: BTreeMap<u32, [u8; 32]>,
}

impl SenderKeyState {
    pub fn new(
        key_id: u32,
        iteration: u32,
        chain_seed: [u8; 32],
        signature_public: [u8; 32],
        signature_private: Option<[u8; 32]>,
    ) -> Self {
        Self {
            key_id,
            chain_key: chain_seed,
            iteration,
            signature_public,
            signature_private,
            message_keys: BTreeMap::new(),
        }
    }

    pub fn sender_chain_key(&self) -> SenderChainKey {
        SenderChainKey::new(self.chain_key, self.iteration)
    }

    pub fn set_sender_chain_key(&mut self, chain: &SenderChainKey) {
        self.chain_key = *chain.seed();
        self.iteration = chain.iteration();
    }

    /// Our own signing pair, when this state was created locally.
    pub fn signing_key_pair(&self) -> Option<KeyPair> {
        self.signature_private.map(KeyPair::from_private_key)
    }

    pub fn stash_message_key(&mut self, iteration: u32, seed: [u8; 32]) {
        self.message_keys.insert(iteration, seed);
        while self.message_keys.len() > consts::MAX_MESSAGE_KEYS {
            let oldest = *self.message_keys.keys().next().expect("non-empty map");
            self.message_keys.remove(&oldest);
        }
    }

    pub fn take_message_key(&mut self, iteration: u32) -> Option<[u8; 32]> {
        self.message_keys.remove(&iteration)
    }
}

/// All known states for one (group, sender), newest first, bounded.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SenderKeyRecord {
    pub states: Vec<SenderKeyState>,
}

impl SenderKeyRecord {
    pub fn new_empty() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }

    /// The most recent state, used for sending.
    pub fn state(&self) -> Option<&SenderKeyState> {
        self.states.first()
    }

    pub fn state_mut(&mut self) -> Option<&mut SenderKeyState> {
        self.states.first_mut()
    }

    pub fn state_for_key_id(&self, key_id: u32) -> Option<&SenderKeyState> {
        self.states.iter().find(|s| s.key_id == key_id)
    }

    pub fn state_for_key_id_mut(&mut self, key_id: u32) -> Option<&mut SenderKeyState> {
        self.states.iter_mut().find(|s| s.key_id == key_id)
    }

    /// Prepends a state, dropping the oldest beyond the cap.
    pub fn add_state(&mut self, state: SenderKeyState) {
        self.states.insert(0, state);
        if self.states.len() > consts::MAX_SENDER_KEY_STATES {
            self.states.truncate(consts::MAX_SENDER_KEY_STATES);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chain_steps_diverge() {
        let chain = SenderChainKey::new([1; 32], 0);
        let next = chain.next();
        assert_eq!(next.iteration(), 1);
        assert_ne!(chain.seed(), next.seed());
        assert_ne!(&chain.message_key_seed(), next.seed());
    }

    #[test]
    fn message_key_split_is_stable() {
        let key = SenderMessageKey::derive(&[2; 32], 5);
        let again = SenderMessageKey::derive(&[2; 32], 5);
        assert_eq!(key.iv(), again.iv());
        assert_eq!(key.cipher_key(), again.cipher_key());
        assert_eq!(key.iteration(), 5);
    }

    #[test]
    fn record_keeps_newest_states() {
        let mut record = SenderKeyRecord::new_empty();
        for id in 0..7u32 {
            record.add_state(SenderKeyState::new(id, 0, [id as u8; 32], [0; 32], None));
        }
        assert_eq!(record.states.len(), consts::MAX_SENDER_KEY_STATES);
        assert_eq!(record.state().unwrap().key_id, 6);
        assert!(record.state_for_key_id(0).is_none());
        assert!(record.state_for_key_id(2).is_some());
    }

    #[test]
    fn stash_is_bounded_and_one_shot() {
        let mut state = SenderKeyState::new(1, 0, [0; 32], [0; 32], None);
        for i in 0..(consts::MAX_MESSAGE_KEYS as u32 + 10) {
            state.stash_message_key(i, [0; 32]);
        }
        assert_eq!(state.message_keys.len(), consts::MAX_MESSAGE_KEYS);
        assert!(state.take_message_key(0).is_none());
        assert!(state.take_message_key(10).is_some());
        assert!(state.take_message_key(10).is_none());
    }
}

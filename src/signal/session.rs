//! The persistent state of one pairwise session.
//!
//! A session owns at most one sending chain and a bounded list of
//! receiving chains ordered most-recently-created first. Skipped
//! message-key seeds are stashed per receiving chain to tolerate
//! out-of-order delivery inside a bounded window.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::crypto::key_pair::KeyPair;
use crate::signal::consts;
use crate::signal::ratchet::ChainKey;

/// The sending half of the ratchet.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SendingChain {
    pub chain_key: [u8; 32],
    pub counter: u32,
    /// Sending counter of the chain this one replaced.
    pub previous_counter: u32,
    pub ratchet_key_pair: KeyPair,
    pub their_ratchet_key: [u8; 32],
}

impl SendingChain {
    pub fn chain_key(&self) -> ChainKey {
        ChainKey::new(self.chain_key, self.counter)
    }

    pub fn advance(&mut self, next: &ChainKey) {
        self.chain_key = *next.key();
        self.counter = next.index();
    }
}

/// One receiving chain plus its stash of skipped message-key seeds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReceivingChain {
    pub their_ratchet_key: [u8; 32],
    pub chain_key: [u8; 32],
    pub counter: u32,
    #[serde(default)]
    pub skipped_keys: BTreeMap<u32, [u8; 32]>,
}

impl ReceivingChain {
    pub fn new(their_ratchet_key: [u8; 32], chain: &ChainKey) -> Self {
        Self {
            their_ratchet_key,
            chain_key: *chain.key(),
            counter: chain.index(),
            skipped_keys: BTreeMap::new(),
        }
    }

    pub fn chain_key(&self) -> ChainKey {
        ChainKey::new(self.chain_key, self.counter)
    }

    pub fn advance(&mut self, next: &ChainKey) {
        self.chain_key = *next.key();
        self.counter = next.index();
    }

    /// Stashes a seed, evicting the oldest entries beyond the per-chain cap.
    pub fn stash_skipped(&mut self, counter: u32, seed: [u8; 32]) {
        self.skipped_keys.insert(counter, seed);
        while self.skipped_keys.len() > consts::MAX_MESSAGE_KEYS {
            let oldest = *self.skipped_keys.keys().next().expect("non-empty map");
            self.skipped_keys.remove(&oldest);
        }
    }

    /// Removes and returns the stashed seed for `counter`, if any.
    /// A seed is released after exactly one successful use.
    pub fn take_skipped(&mut self, counter: u32) -> Option<[u8; 32]> {
        self.skipped_keys.remove(&counter)
    }
}

/// Recorded by the initiator until the responder acknowledges the
/// session with a regular message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PendingPreKey {
    pub pre_key_id: Option<u32>,
    pub signed_pre_key_id: u32,
    pub base_key: [u8; 32],
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub root_key: [u8; 32],
    #[serde(default)]
    pub sending_chain: Option<SendingChain>,
    /// Most-recently-created first.
    #[serde(default)]
    pub receiving_chains: Vec<ReceivingChain>,
    #[serde(default)]
    pub pending_pre_key: Option<PendingPreKey>,
    /// The peer's registration id, from the bundle or the prekey message.
    #[serde(default)]
    pub registration_id: u32,
    pub their_identity: [u8; 32],
    /// The initiator's base key; lets a responder recognize a
    /// retransmitted prekey message for an already-built session.
    pub base_key: [u8; 32],
}

impl Session {
    pub fn new(root_key: [u8; 32], their_identity: [u8; 32], base_key: [u8; 32]) -> Self {
        Self {
            root_key,
            sending_chain: None,
            receiving_chains: Vec::new(),
            pending_pre_key: None,
            registration_id: 0,
            their_identity,
            base_key,
        }
    }

    pub fn find_receiving_chain(&self, their_ratchet_key: &[u8; 32]) -> Option<usize> {
        self.receiving_chains
            .iter()
            .position(|c| &c.their_ratchet_key == their_ratchet_key)
    }

    /// Prepends a chain, dropping the oldest beyond the cap.
    pub fn push_receiving_chain(&mut self, chain: ReceivingChain) {
        self.receiving_chains.insert(0, chain);
        if self.receiving_chains.len() > consts::MAX_RECEIVER_CHAINS {
            log::info!(
                "trimming receiving chains to {} for session",
                consts::MAX_RECEIVER_CHAINS
            );
            self.receiving_chains.truncate(consts::MAX_RECEIVER_CHAINS);
        }
    }

    pub fn total_skipped(&self) -> usize {
        self.receiving_chains
            .iter()
            .map(|c| c.skipped_keys.len())
            .sum()
    }

    /// Enforces the session-wide skipped-key cap by dropping the oldest
    /// chain (the back of the list) until the total fits. A single chain
    /// never exceeds the total on its own: the per-chain cap equals it.
    pub fn enforce_skipped_cap(&mut self) {
        while self.total_skipped() > consts::MAX_TOTAL_MESSAGE_KEYS
            && self.receiving_chains.len() > 1
        {
            let dropped = self.receiving_chains.pop().expect("len > 1");
            log::warn!(
                "dropping oldest receiving chain with {} stashed keys to honor session cap",
                dropped.skipped_keys.len()
            );
        }
    }
}

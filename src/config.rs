use serde::{Deserialize, Serialize};

use crate::signal::consts;

/// Recognized configuration. The ratchet caps and header version are
/// protocol constants; values other than the defaults are accepted but
/// flagged, since peers compiled against the protocol will not honor
/// them.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Registration id; selects the `keys/{id}.json` document.
    pub id: u32,
    /// How many one-time prekeys to generate per upload batch.
    pub pre_key_batch: u32,
    pub max_skipped_per_chain: usize,
    pub max_receive_chains: usize,
    pub ratchet_header_version: u8,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            id: 0,
            pre_key_batch: 30,
            max_skipped_per_chain: consts::MAX_MESSAGE_KEYS,
            max_receive_chains: consts::MAX_RECEIVER_CHAINS,
            ratchet_header_version: consts::VERSION_BYTE,
        }
    }
}

impl Config {
    pub fn new(id: u32) -> Self {
        Self {
            id,
            ..Default::default()
        }
    }

    /// True when every protocol-pinned field carries its default.
    pub fn is_protocol_compatible(&self) -> bool {
        self.max_skipped_per_chain == consts::MAX_MESSAGE_KEYS
            && self.max_receive_chains == consts::MAX_RECEIVER_CHAINS
            && self.ratchet_header_version == consts::VERSION_BYTE
    }
}

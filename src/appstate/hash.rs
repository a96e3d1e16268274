//! Mutable LTHash state per app-state collection.

use std::collections::HashMap;

use base64::Engine as _;
use base64::prelude::BASE64_STANDARD;
use serde::{Deserialize, Serialize};
use serde_big_array::BigArray;

use crate::appstate::lthash::WAPATCH_INTEGRITY;
use crate::appstate::patch::SyncdOperation;
use crate::crypto::hmac_sha256;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LTHashState {
    pub version: u64,
    #[serde(with = "BigArray")]
    pub hash: [u8; 128],
    /// Live entries: base64(index_mac) -> value_mac. The hash equals
    /// the subset-sum over exactly these value MACs.
    pub index_value_map: HashMap<String, Vec<u8>>,
    /// Value MACs applied by the most recent patch, kept for
    /// diagnostics and resumption.
    #[serde(default)]
    pub mutation_macs: HashMap<String, Vec<u8>>,
}

impl Default for LTHashState {
    fn default() -> Self {
        Self {
            version: 0,
            hash: [0; 128],
            index_value_map: HashMap::new(),
            mutation_macs: HashMap::new(),
        }
    }
}

impl LTHashState {
    /// Applies one verified mutation: swaps the old value MAC out of
    /// the hash and the new one in, and updates the live map.
    pub fn apply_mutation(
        &mut self,
        operation: SyncdOperation,
        index_mac: &[u8],
        value_mac: &[u8],
    ) {
        let map_key = BASE64_STANDARD.encode(index_mac);
        let previous = self.index_value_map.get(&map_key).cloned();

        let subtract: Vec<&[u8]> = previous.iter().map(|v| v.as_slice()).collect();
        match operation {
            SyncdOperation::Set => {
                WAPATCH_INTEGRITY.subtract_then_add_in_place(
                    &mut self.hash,
                    &subtract,
                    &[value_mac],
                );
                self.index_value_map.insert(map_key.clone(), value_mac.to_vec());
                self.mutation_macs.insert(map_key, value_mac.to_vec());
            }
            SyncdOperation::Remove => {
                WAPATCH_INTEGRITY.subtract_then_add_in_place(&mut self.hash, &subtract, &[]);
                self.index_value_map.remove(&map_key);
                self.mutation_macs.remove(&map_key);
            }
        }
    }

    /// `HMAC(snapshotMacKey, hash || version_le64 || collection_name)`.
    pub fn snapshot_mac(&self, name: &str, key: &[u8; 32]) -> [u8; 32] {
        hmac_sha256(
            key,
            &[&self.hash, &self.version.to_le_bytes(), name.as_bytes()],
        )
    }
}

/// `HMAC(patchMacKey, value_macs_concat || version_le64 || name)` over
/// the ordered value MACs of every mutation in the patch.
pub fn generate_patch_mac(
    value_macs: &[Vec<u8>],
    version: u64,
    name: &str,
    key: &[u8; 32],
) -> [u8; 32] {
    let mut parts: Vec<&[u8]> = value_macs.iter().map(|m| m.as_slice()).collect();
    let version_le = version.to_le_bytes();
    parts.push(&version_le);
    parts.push(name.as_bytes());
    hmac_sha256(key, &parts)
}

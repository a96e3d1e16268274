//! Application-state synchronization: encrypted mutation patches
//! verified by per-patch and snapshot MACs over a homomorphic LTHash.

pub mod hash;
pub mod keys;
pub mod lthash;
pub mod patch;
pub mod processor;

pub use hash::LTHashState;
pub use keys::{ExpandedAppStateKeys, expand_mutation_keys};
pub use processor::{Mutation, Processor};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// A master sync key delivered by the primary device. Immutable once
/// inserted into the key store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppStateSyncKey {
    pub key_id: Vec<u8>,
    pub key_data: [u8; 32],
    #[serde(default)]
    pub fingerprint: Vec<u8>,
    #[serde(default)]
    pub timestamp: i64,
}

#[derive(Debug, Error)]
pub enum AppStateError {
    /// A mutation's index or value MAC did not verify.
    #[error("mismatching MAC for {0}")]
    MacMismatch(&'static str),

    #[error("patch MAC did not verify")]
    InvalidPatchMac,

    #[error("snapshot MAC did not verify")]
    InvalidSnapshotMac,

    /// Recoverable: the patch is parked until the key arrives.
    #[error("missing app state key {key_id:?}")]
    MissingAppStateKey { key_id: Vec<u8> },

    /// Recoverable: the caller should request a snapshot.
    #[error("version gap: have {have}, want {want}")]
    VersionGap { have: u64, want: u64 },

    #[error("mutation decryption failed")]
    BadPadding,

    #[error("malformed record: {0}")]
    MissingField(&'static str),

    #[error("action decode failed")]
    DecodeFailed,

    #[error("external blob fetch failed: {0}")]
    ExternalFetch(String),
}

//! The long-lived key material store.
//!
//! One `Keys` value owns every piece of persistent cryptographic state
//! of a device: identity and companion key pairs, signed prekey, the
//! one-time prekey pool, all pairwise sessions, sender-key records,
//! pinned peer identities, app-state hash states and sync keys, plus
//! the transport AEAD counters. Sessions and sender-key records are
//! owned exclusively here; every other component looks them up by
//! address or name.

pub mod prefs;
pub mod schema;

use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::appstate::{AppStateSyncKey, LTHashState};
use crate::crypto::key_pair::{KeyPair, PreKey, SignedKeyPair};
use crate::crypto::rand_bytes;
use crate::keys::prefs::{Preferences, PersistenceError};
use crate::keys::schema::entry_map;
use crate::signal::address::{SenderKeyName, SessionAddress};
use crate::signal::groups::record::SenderKeyRecord;
use crate::signal::session::Session;

const SCHEMA_VERSION: u32 = 1;

fn keys_path(id: u32) -> String {
    format!("keys/{id}.json")
}

#[derive(Debug, Error)]
pub enum KeysError {
    #[error("prekey <{0}> not found")]
    PreKeyNotFound(u32),
    #[error("signed prekey id mismatch: {requested} != {current}")]
    IdMismatch { requested: u32, current: u32 },
    #[error("transport AEAD counter overflow")]
    CounterOverflow,
    #[error("persistence failed: {0}")]
    Persistence(#[from] PersistenceError),
}

pub type Result<T> = std::result::Result<T, KeysError>;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Keys {
    #[serde(default = "schema_version")]
    pub schema_version: u32,

    /// The registration id of this device.
    pub id: u32,

    /// Secret key pair for companion message buffers.
    pub companion_key_pair: KeyPair,
    /// The noise/ephemeral key pair used during transport handshakes.
    pub ephemeral_key_pair: KeyPair,
    /// The long-lived identity, one per device lifetime.
    pub identity_key_pair: KeyPair,
    /// Current signed prekey; its id always equals `self.id` masked to
    /// the rolling 24-bit space.
    pub signed_pre_key: SignedKeyPair,
    /// The advertisement secret shared with the primary device.
    pub companion_adv_key: [u8; 32],

    /// The paired companion jid, set by the pairing flow.
    #[serde(default)]
    pub companion: Option<String>,
    /// The signed device identity received while pairing.
    #[serde(default)]
    pub companion_identity: Option<Vec<u8>>,

    #[serde(default)]
    pub pre_keys: Vec<PreKey>,

    #[serde(default, with = "entry_map")]
    sessions: HashMap<SessionAddress, Session>,
    #[serde(default, with = "entry_map")]
    sender_keys: HashMap<SenderKeyName, SenderKeyRecord>,
    /// Sender-key names a distribution message was already sent for.
    #[serde(default)]
    receiver_keys: HashSet<SenderKeyName>,
    #[serde(default, with = "entry_map")]
    trusted_identities: HashMap<SessionAddress, [u8; 32]>,

    #[serde(default)]
    hash_states: HashMap<String, LTHashState>,
    #[serde(default)]
    app_state_keys: Vec<AppStateSyncKey>,

    // Transport session state: never persisted, reset by `clear_transport`.
    #[serde(skip)]
    write_counter: u64,
    #[serde(skip)]
    read_counter: u64,
    #[serde(skip)]
    pub write_key: Option<[u8; 32]>,
    #[serde(skip)]
    pub read_key: Option<[u8; 32]>,
}

fn schema_version() -> u32 {
    SCHEMA_VERSION
}

impl Keys {
    /// Allocates a fresh set of random key material for `id`.
    pub fn new_random(id: u32) -> Self {
        let identity_key_pair = KeyPair::new();
        let signed_pre_key = SignedKeyPair::new(id, &identity_key_pair);
        Self {
            schema_version: SCHEMA_VERSION,
            id,
            companion_key_pair: KeyPair::new(),
            ephemeral_key_pair: KeyPair::new(),
            identity_key_pair,
            signed_pre_key,
            companion_adv_key: rand_bytes(),
            companion: None,
            companion_identity: None,
            pre_keys: Vec::new(),
            sessions: HashMap::new(),
            sender_keys: HashMap::new(),
            receiver_keys: HashSet::new(),
            trusted_identities: HashMap::new(),
            hash_states: HashMap::new(),
            app_state_keys: Vec::new(),
            write_counter: 0,
            read_counter: 0,
            write_key: None,
            read_key: None,
        }
    }

    /// Loads the keys saved for `id`, or allocates and registers a new
    /// random set when none exist.
    pub fn load(prefs: &Preferences, id: u32) -> Result<Self> {
        match prefs.read_json::<Keys>(&keys_path(id))? {
            Some(keys) => Ok(keys),
            None => {
                let keys = Self::new_random(id);
                prefs.register_id(id)?;
                Ok(keys)
            }
        }
    }

    /// Atomically serializes the full state under `keys/{id}.json`.
    pub fn save(&self, prefs: &Preferences) -> Result<()> {
        prefs.write_json(&keys_path(self.id), self)?;
        prefs.register_id(self.id)?;
        Ok(())
    }

    /// Removes this id's document and index entry.
    pub fn delete(prefs: &Preferences, id: u32) -> Result<()> {
        prefs.delete(&keys_path(id))?;
        prefs.unregister_id(id)?;
        Ok(())
    }

    pub fn has_companion(&self) -> bool {
        self.companion.is_some()
    }

    pub fn has_pre_keys(&self) -> bool {
        !self.pre_keys.is_empty()
    }

    // --- prekeys ---------------------------------------------------------

    /// Appends `count` fresh prekeys with unique, strictly increasing ids.
    pub fn generate_pre_keys(&mut self, count: u32) -> &[PreKey] {
        let next_id = self.pre_keys.iter().map(|p| p.id).max().map_or(1, |m| m + 1);
        let start = self.pre_keys.len();
        for offset in 0..count {
            self.pre_keys.push(PreKey::new(next_id + offset));
        }
        &self.pre_keys[start..]
    }

    pub fn find_pre_key(&self, id: u32) -> Option<&PreKey> {
        self.pre_keys.iter().find(|pre_key| pre_key.id == id)
    }

    /// Removes and returns the prekey. One-time semantics: a second
    /// consume of the same id fails.
    pub fn consume_pre_key(&mut self, id: u32) -> Result<PreKey> {
        let pos = self
            .pre_keys
            .iter()
            .position(|pre_key| pre_key.id == id)
            .ok_or(KeysError::PreKeyNotFound(id))?;
        Ok(self.pre_keys.remove(pos))
    }

    pub fn signed_pre_key_by_id(&self, id: u32) -> Result<&SignedKeyPair> {
        if id != self.signed_pre_key.id {
            return Err(KeysError::IdMismatch {
                requested: id,
                current: self.signed_pre_key.id,
            });
        }
        Ok(&self.signed_pre_key)
    }

    // --- sessions --------------------------------------------------------

    pub fn find_session(&self, address: &SessionAddress) -> Option<&Session> {
        self.sessions.get(address)
    }

    pub fn has_session(&self, address: &SessionAddress) -> bool {
        self.sessions.contains_key(address)
    }

    pub fn put_session(&mut self, address: SessionAddress, session: Session) {
        self.sessions.insert(address, session);
    }

    pub fn remove_session(&mut self, address: &SessionAddress) -> Option<Session> {
        self.sessions.remove(address)
    }

    // --- sender keys -----------------------------------------------------

    pub fn find_sender_key(&self, name: &SenderKeyName) -> Option<&SenderKeyRecord> {
        self.sender_keys.get(name)
    }

    pub fn put_sender_key(&mut self, name: SenderKeyName, record: SenderKeyRecord) {
        self.sender_keys.insert(name, record);
    }

    pub fn remove_sender_key(&mut self, name: &SenderKeyName) -> Option<SenderKeyRecord> {
        self.sender_keys.remove(name)
    }

    /// Marks that our distribution message for `name` went out.
    pub fn mark_receiver_key(&mut self, name: SenderKeyName) {
        self.receiver_keys.insert(name);
    }

    pub fn has_receiver_key(&self, name: &SenderKeyName) -> bool {
        self.receiver_keys.contains(name)
    }

    // --- trusted identities ----------------------------------------------

    pub fn trusted_identity(&self, address: &SessionAddress) -> Option<&[u8; 32]> {
        self.trusted_identities.get(address)
    }

    /// Trust-on-first-use: an unknown address trusts any identity; a
    /// known one must match the pinned key exactly.
    pub fn is_trusted(&self, address: &SessionAddress, identity: &[u8; 32]) -> bool {
        match self.trusted_identities.get(address) {
            None => true,
            Some(pinned) => pinned == identity,
        }
    }

    pub fn pin_identity(&mut self, address: SessionAddress, identity: [u8; 32]) {
        self.trusted_identities.entry(address).or_insert(identity);
    }

    // --- app state -------------------------------------------------------

    pub fn find_app_state_key(&self, key_id: &[u8]) -> Option<&AppStateSyncKey> {
        self.app_state_keys
            .iter()
            .find(|key| key.key_id == key_id)
    }

    /// Inserts new sync keys; keys are immutable once inserted, so a
    /// duplicate id is ignored.
    pub fn add_app_state_keys(&mut self, new_keys: impl IntoIterator<Item = AppStateSyncKey>) {
        for key in new_keys {
            if self.find_app_state_key(&key.key_id).is_none() {
                self.app_state_keys.push(key);
            }
        }
    }

    pub fn find_hash_state(&self, name: &str) -> Option<&LTHashState> {
        self.hash_states.get(name)
    }

    pub fn put_hash_state(&mut self, name: String, state: LTHashState) {
        self.hash_states.insert(name, state);
    }

    // --- transport counters ----------------------------------------------

    pub fn set_transport_keys(&mut self, write_key: [u8; 32], read_key: [u8; 32]) {
        self.write_key = Some(write_key);
        self.read_key = Some(read_key);
        self.write_counter = 0;
        self.read_counter = 0;
    }

    /// Drops the transport session material, e.g. on reconnect.
    pub fn clear_transport(&mut self) {
        self.write_key = None;
        self.read_key = None;
        self.write_counter = 0;
        self.read_counter = 0;
    }

    /// Returns the current write counter and advances it. Overflow is
    /// fatal: a reused counter would reuse an AEAD nonce.
    pub fn bump_write_counter(&mut self) -> Result<u64> {
        let current = self.write_counter;
        self.write_counter = current.checked_add(1).ok_or(KeysError::CounterOverflow)?;
        Ok(current)
    }

    pub fn bump_read_counter(&mut self) -> Result<u64> {
        let current = self.read_counter;
        self.read_counter = current.checked_add(1).ok_or(KeysError::CounterOverflow)?;
        Ok(current)
    }
}

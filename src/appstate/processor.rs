//! Patch and snapshot processing.
//!
//! Verification is strict and transactional: every mutation MAC, the
//! patch MAC and the snapshot MAC must verify against a working copy
//! of the hash state before anything becomes visible in the key store.
//! Patches whose sync key has not arrived yet are parked in a
//! dead-letter queue and drained in version order when the key shows up.

use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use prost::Message as _;

use crate::appstate::hash::{LTHashState, generate_patch_mac};
use crate::appstate::keys::{ExpandedAppStateKeys, expand_mutation_keys};
use crate::appstate::patch::{
    ActionDataSync, ExternalBlobReference, KeyId, SyncdIndex, SyncdOperation, SyncdPatch,
    SyncdRecord, SyncdSnapshot, SyncdValue,
};
use crate::appstate::{AppStateError, AppStateSyncKey};
use crate::crypto::{cbc, hmac_sha256, hmac_sha512, rand_bytes};
use crate::keys::Keys;

type Result<T> = std::result::Result<T, AppStateError>;

/// One decoded, verified mutation.
#[derive(Debug, Clone)]
pub struct Mutation {
    pub operation: SyncdOperation,
    /// Parsed index components (JSON array of strings).
    pub index: Vec<String>,
    pub index_mac: Vec<u8>,
    pub value_mac: Vec<u8>,
    /// The decrypted action payload; opaque to this layer.
    pub action: Vec<u8>,
}

fn record_key_id<'a>(key_id: &'a Option<KeyId>) -> Result<&'a [u8]> {
    key_id
        .as_ref()
        .and_then(|k| k.id.as_deref())
        .ok_or(AppStateError::MissingField("key id"))
}

/// Decrypts and verifies one record.
pub fn decode_mutation(
    operation: SyncdOperation,
    record: &SyncdRecord,
    keys: &ExpandedAppStateKeys,
) -> Result<Mutation> {
    let index_mac = record
        .index
        .as_ref()
        .and_then(|i| i.blob.as_deref())
        .ok_or(AppStateError::MissingField("index MAC"))?;
    let value_blob = record
        .value
        .as_ref()
        .and_then(|v| v.blob.as_deref())
        .ok_or(AppStateError::MissingField("value blob"))?;
    if value_blob.len() < 16 + 32 {
        return Err(AppStateError::MissingField("value blob too short"));
    }

    let (iv, rest) = value_blob.split_at(16);
    let (ciphertext, value_mac) = rest.split_at(rest.len() - 32);

    let expected = &hmac_sha512(
        &keys.value_mac,
        &[&[operation.mac_byte()], index_mac, iv, ciphertext],
    )[..32];
    if expected != value_mac {
        return Err(AppStateError::MacMismatch("value"));
    }

    let plaintext = cbc::decrypt(&keys.value_encryption, iv, ciphertext)
        .map_err(|_| AppStateError::BadPadding)?;
    let action =
        ActionDataSync::decode(plaintext.as_slice()).map_err(|_| AppStateError::DecodeFailed)?;

    let index_json = action
        .index
        .as_deref()
        .ok_or(AppStateError::MissingField("action index"))?;
    let expected_index_mac = hmac_sha256(&keys.index, &[index_json]);
    if expected_index_mac != index_mac {
        return Err(AppStateError::MacMismatch("index"));
    }
    let index: Vec<String> =
        serde_json::from_slice(index_json).map_err(|_| AppStateError::DecodeFailed)?;

    Ok(Mutation {
        operation,
        index,
        index_mac: index_mac.to_vec(),
        value_mac: value_mac.to_vec(),
        action: action.value.unwrap_or_default(),
    })
}

/// Builds one encrypted record; the write path of the sync protocol
/// and the fixture generator for tests.
pub fn encode_mutation(
    operation: SyncdOperation,
    index: &[&str],
    action: &[u8],
    keys: &ExpandedAppStateKeys,
    key_id: &[u8],
) -> SyncdRecord {
    let index_json = serde_json::to_vec(index).expect("string arrays always serialize");
    let index_mac = hmac_sha256(&keys.index, &[&index_json]);

    let payload = ActionDataSync {
        index: Some(index_json),
        value: Some(action.to_vec()),
        padding: None,
        version: None,
    };
    let iv: [u8; 16] = rand_bytes();
    let ciphertext = cbc::encrypt(&keys.value_encryption, &iv, &payload.encode_to_vec())
        .expect("CBC encryption with derived keys cannot fail");

    let value_mac = &hmac_sha512(
        &keys.value_mac,
        &[&[operation.mac_byte()], &index_mac, &iv, &ciphertext],
    )[..32];

    let mut blob = iv.to_vec();
    blob.extend_from_slice(&ciphertext);
    blob.extend_from_slice(value_mac);

    SyncdRecord {
        index: Some(SyncdIndex {
            blob: Some(index_mac.to_vec()),
        }),
        value: Some(SyncdValue { blob: Some(blob) }),
        key_id: Some(KeyId {
            id: Some(key_id.to_vec()),
        }),
    }
}

/// Drives patch and snapshot application over the key store.
#[derive(Default)]
pub struct Processor {
    /// Parked patches: key id -> (version -> (collection, patch)).
    pending: HashMap<Vec<u8>, BTreeMap<u64, (String, SyncdPatch)>>,
}

impl Processor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn pending_patches(&self) -> usize {
        self.pending.values().map(|m| m.len()).sum()
    }

    /// Applies one patch to the named collection. Verify-then-commit:
    /// on any error the stored hash state is untouched.
    pub fn process_patch(
        &mut self,
        keys: &mut Keys,
        name: &str,
        patch: &SyncdPatch,
    ) -> Result<Vec<Mutation>> {
        let key_id = record_key_id(&patch.key_id)?;
        let sync_key = match keys.find_app_state_key(key_id) {
            Some(sync_key) => sync_key,
            None => {
                let key_id = key_id.to_vec();
                log::info!(
                    "parking patch v{} for {name}: sync key {} not yet available",
                    patch.version_number(),
                    hex::encode(&key_id)
                );
                self.pending
                    .entry(key_id.clone())
                    .or_default()
                    .insert(patch.version_number(), (name.to_string(), patch.clone()));
                return Err(AppStateError::MissingAppStateKey { key_id });
            }
        };
        let expanded = expand_mutation_keys(&sync_key.key_data);

        let current = keys.find_hash_state(name).cloned().unwrap_or_default();
        let version = patch.version_number();
        if version <= current.version {
            log::debug!("skipping already-applied patch v{version} for {name}");
            return Ok(Vec::new());
        }
        if version > current.version + 1 {
            return Err(AppStateError::VersionGap {
                have: current.version,
                want: version,
            });
        }

        let mut work = current;
        work.version = version;
        work.mutation_macs.clear();

        let mut mutations = Vec::with_capacity(patch.mutations.len());
        let mut value_macs = Vec::with_capacity(patch.mutations.len());
        for raw in &patch.mutations {
            let operation = SyncdOperation::try_from(raw.operation.unwrap_or(0))
                .map_err(|_| AppStateError::MissingField("operation"))?;
            let record = raw
                .record
                .as_ref()
                .ok_or(AppStateError::MissingField("record"))?;
            let mutation = decode_mutation(operation, record, &expanded)?;
            work.apply_mutation(operation, &mutation.index_mac, &mutation.value_mac);
            value_macs.push(mutation.value_mac.clone());
            mutations.push(mutation);
        }

        if let Some(expected) = patch.patch_mac.as_deref() {
            let computed = generate_patch_mac(&value_macs, version, name, &expanded.patch_mac);
            if computed != expected {
                return Err(AppStateError::InvalidPatchMac);
            }
        }
        if let Some(expected) = patch.snapshot_mac.as_deref() {
            let computed = work.snapshot_mac(name, &expanded.snapshot_mac);
            if computed != expected {
                return Err(AppStateError::InvalidSnapshotMac);
            }
        }

        keys.put_hash_state(name.to_string(), work);
        Ok(mutations)
    }

    /// Rebuilds the named collection from a compacted snapshot, then
    /// expects patches to resume from `version + 1`.
    pub fn process_snapshot(
        &mut self,
        keys: &mut Keys,
        name: &str,
        snapshot: &SyncdSnapshot,
    ) -> Result<Vec<Mutation>> {
        let key_id = record_key_id(&snapshot.key_id)?;
        let sync_key =
            keys.find_app_state_key(key_id)
                .ok_or_else(|| AppStateError::MissingAppStateKey {
                    key_id: key_id.to_vec(),
                })?;
        let expanded = expand_mutation_keys(&sync_key.key_data);

        let mut work = LTHashState {
            version: snapshot.version.as_ref().and_then(|v| v.version).unwrap_or(0),
            ..Default::default()
        };

        let mut mutations = Vec::with_capacity(snapshot.records.len());
        for record in &snapshot.records {
            let mutation = decode_mutation(SyncdOperation::Set, record, &expanded)?;
            work.apply_mutation(SyncdOperation::Set, &mutation.index_mac, &mutation.value_mac);
            mutations.push(mutation);
        }

        if let Some(expected) = snapshot.mac.as_deref() {
            let computed = work.snapshot_mac(name, &expanded.snapshot_mac);
            if computed != expected {
                return Err(AppStateError::InvalidSnapshotMac);
            }
        }

        keys.put_hash_state(name.to_string(), work);
        Ok(mutations)
    }

    /// Registers a freshly arrived sync key and drains every patch that
    /// was parked waiting for it, in version order.
    pub fn provide_key(&mut self, keys: &mut Keys, key: AppStateSyncKey) -> Result<Vec<Mutation>> {
        let key_id = key.key_id.clone();
        keys.add_app_state_keys([key]);

        let mut drained = Vec::new();
        if let Some(parked) = self.pending.remove(&key_id) {
            log::info!(
                "draining {} parked patch(es) for key {}",
                parked.len(),
                hex::encode(&key_id)
            );
            for (_, (name, patch)) in parked {
                drained.extend(self.process_patch(keys, &name, &patch)?);
            }
        }
        Ok(drained)
    }
}

/// Fetches the bytes behind an external blob reference. The transport
/// implements this; tests stub it.
#[async_trait]
pub trait ExternalBlobFetcher: Send + Sync {
    async fn fetch(
        &self,
        reference: &ExternalBlobReference,
    ) -> std::result::Result<Vec<u8>, Box<dyn std::error::Error + Send + Sync>>;
}

/// Downloads and decrypts a compacted snapshot. The blob is encrypted
/// media: keys derived from the reference's media key, a 10-byte
/// truncated HMAC trailer over `iv || ciphertext`, AES-CBC content.
pub async fn fetch_external_snapshot(
    fetcher: &dyn ExternalBlobFetcher,
    reference: &ExternalBlobReference,
) -> Result<SyncdSnapshot> {
    let blob = fetcher
        .fetch(reference)
        .await
        .map_err(|e| AppStateError::ExternalFetch(e.to_string()))?;
    let media_key = reference
        .media_key
        .as_deref()
        .ok_or(AppStateError::MissingField("media key"))?;

    let okm = crate::crypto::hkdf::sha256(media_key, None, b"WhatsApp App State Keys", 80)
        .expect("fixed-size HKDF expand");
    let iv = &okm[0..16];
    let cipher_key = &okm[16..48];
    let mac_key = &okm[48..80];

    if blob.len() < 10 {
        return Err(AppStateError::MissingField("blob too short"));
    }
    let (ciphertext, trailer) = blob.split_at(blob.len() - 10);
    let expected = &hmac_sha256(mac_key, &[iv, ciphertext])[..10];
    if expected != trailer {
        return Err(AppStateError::MacMismatch("external blob"));
    }

    let plaintext =
        cbc::decrypt(cipher_key, iv, ciphertext).map_err(|_| AppStateError::BadPadding)?;
    SyncdSnapshot::decode(plaintext.as_slice()).map_err(|_| AppStateError::DecodeFailed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::appstate::patch::SyncdVersion;

    fn sync_key() -> AppStateSyncKey {
        AppStateSyncKey {
            key_id: vec![0xAB, 0xCD],
            key_data: [7u8; 32],
            fingerprint: vec![],
            timestamp: 0,
        }
    }

    /// Builds a patch whose MACs match the state it will be applied to.
    fn build_patch(
        before: &LTHashState,
        name: &str,
        version: u64,
        ops: &[(SyncdOperation, &[&str], &[u8])],
    ) -> SyncdPatch {
        let expanded = expand_mutation_keys(&sync_key().key_data);
        let mut work = before.clone();
        work.version = version;

        let mut mutations = Vec::new();
        let mut value_macs = Vec::new();
        for (operation, index, action) in ops {
            let record = encode_mutation(*operation, index, action, &expanded, &sync_key().key_id);
            let decoded = decode_mutation(*operation, &record, &expanded).unwrap();
            work.apply_mutation(*operation, &decoded.index_mac, &decoded.value_mac);
            value_macs.push(decoded.value_mac);
            mutations.push(crate::appstate::patch::SyncdMutation {
                operation: Some(*operation as i32),
                record: Some(record),
            });
        }

        SyncdPatch {
            version: Some(SyncdVersion {
                version: Some(version),
            }),
            mutations,
            external_mutations: None,
            snapshot_mac: Some(work.snapshot_mac(name, &expanded.snapshot_mac).to_vec()),
            patch_mac: Some(
                generate_patch_mac(&value_macs, version, name, &expanded.patch_mac).to_vec(),
            ),
            key_id: Some(KeyId {
                id: Some(sync_key().key_id),
            }),
            device_index: None,
        }
    }

    #[test]
    fn patch_applies_and_commits() {
        let mut keys = Keys::new_random(1);
        keys.add_app_state_keys([sync_key()]);
        let mut processor = Processor::new();

        let patch = build_patch(
            &LTHashState::default(),
            "regular_high",
            1,
            &[(SyncdOperation::Set, &["mute", "chat@s"], b"muted")],
        );
        let mutations = processor
            .process_patch(&mut keys, "regular_high", &patch)
            .unwrap();
        assert_eq!(mutations.len(), 1);
        assert_eq!(mutations[0].index, vec!["mute", "chat@s"]);
        assert_eq!(mutations[0].action, b"muted");

        let state = keys.find_hash_state("regular_high").unwrap();
        assert_eq!(state.version, 1);
        assert_eq!(state.index_value_map.len(), 1);
    }

    #[test]
    fn tampered_mutation_leaves_state_untouched() {
        let mut keys = Keys::new_random(1);
        keys.add_app_state_keys([sync_key()]);
        let mut processor = Processor::new();

        let good = build_patch(
            &LTHashState::default(),
            "regular_high",
            1,
            &[(SyncdOperation::Set, &["a"], b"one")],
        );
        processor
            .process_patch(&mut keys, "regular_high", &good)
            .unwrap();
        let hash_before = keys.find_hash_state("regular_high").unwrap().hash;

        let mut bad = build_patch(
            keys.find_hash_state("regular_high").unwrap(),
            "regular_high",
            2,
            &[
                (SyncdOperation::Set, &["b"], b"two"),
                (SyncdOperation::Set, &["c"], b"three"),
            ],
        );
        // Corrupt the second mutation's value MAC.
        let blob = bad.mutations[1]
            .record
            .as_mut()
            .unwrap()
            .value
            .as_mut()
            .unwrap()
            .blob
            .as_mut()
            .unwrap();
        let last = blob.len() - 1;
        blob[last] ^= 0xFF;

        assert!(matches!(
            processor.process_patch(&mut keys, "regular_high", &bad),
            Err(AppStateError::MacMismatch("value"))
        ));
        let state = keys.find_hash_state("regular_high").unwrap();
        assert_eq!(state.hash, hash_before, "partial application is forbidden");
        assert_eq!(state.version, 1);
    }

    #[test]
    fn wrong_patch_mac_is_rejected() {
        let mut keys = Keys::new_random(1);
        keys.add_app_state_keys([sync_key()]);
        let mut processor = Processor::new();

        let mut patch = build_patch(
            &LTHashState::default(),
            "regular_high",
            1,
            &[(SyncdOperation::Set, &["a"], b"one")],
        );
        patch.patch_mac.as_mut().unwrap()[0] ^= 0x01;
        assert!(matches!(
            processor.process_patch(&mut keys, "regular_high", &patch),
            Err(AppStateError::InvalidPatchMac)
        ));
        assert!(keys.find_hash_state("regular_high").is_none());
    }

    #[test]
    fn version_gap_requests_snapshot() {
        let mut keys = Keys::new_random(1);
        keys.add_app_state_keys([sync_key()]);
        let mut processor = Processor::new();

        let patch = build_patch(
            &LTHashState::default(),
            "regular_high",
            5,
            &[(SyncdOperation::Set, &["a"], b"one")],
        );
        assert!(matches!(
            processor.process_patch(&mut keys, "regular_high", &patch),
            Err(AppStateError::VersionGap { have: 0, want: 5 })
        ));
    }

    #[test]
    fn missing_key_parks_patch_until_key_arrives() {
        let mut keys = Keys::new_random(1);
        let mut processor = Processor::new();

        let first = build_patch(
            &LTHashState::default(),
            "regular_high",
            1,
            &[(SyncdOperation::Set, &["a"], b"one")],
        );
        let err = processor
            .process_patch(&mut keys, "regular_high", &first)
            .unwrap_err();
        assert!(matches!(err, AppStateError::MissingAppStateKey { .. }));
        assert_eq!(processor.pending_patches(), 1);

        let drained = processor.provide_key(&mut keys, sync_key()).unwrap();
        assert_eq!(drained.len(), 1);
        assert_eq!(processor.pending_patches(), 0);
        assert_eq!(keys.find_hash_state("regular_high").unwrap().version, 1);
    }

    #[test]
    fn snapshot_rebuilds_state() {
        let mut keys = Keys::new_random(1);
        keys.add_app_state_keys([sync_key()]);
        let mut processor = Processor::new();
        let expanded = expand_mutation_keys(&sync_key().key_data);

        let records: Vec<SyncdRecord> = [("a", "one"), ("b", "two")]
            .iter()
            .map(|(idx, val)| {
                encode_mutation(
                    SyncdOperation::Set,
                    &[idx],
                    val.as_bytes(),
                    &expanded,
                    &sync_key().key_id,
                )
            })
            .collect();

        // Compute the expected MAC over the rebuilt state.
        let mut expected = LTHashState {
            version: 9,
            ..Default::default()
        };
        for record in &records {
            let m = decode_mutation(SyncdOperation::Set, record, &expanded).unwrap();
            expected.apply_mutation(SyncdOperation::Set, &m.index_mac, &m.value_mac);
        }

        let snapshot = SyncdSnapshot {
            version: Some(SyncdVersion { version: Some(9) }),
            records,
            mac: Some(
                expected
                    .snapshot_mac("critical_unblock_low", &expanded.snapshot_mac)
                    .to_vec(),
            ),
            key_id: Some(KeyId {
                id: Some(sync_key().key_id),
            }),
        };

        let mutations = processor
            .process_snapshot(&mut keys, "critical_unblock_low", &snapshot)
            .unwrap();
        assert_eq!(mutations.len(), 2);
        let state = keys.find_hash_state("critical_unblock_low").unwrap();
        assert_eq!(state.version, 9);
        assert_eq!(state.hash, expected.hash);
    }

    #[tokio::test]
    async fn external_snapshot_fetch_verifies_and_decodes() {
        struct Stub(Vec<u8>);
        #[async_trait]
        impl ExternalBlobFetcher for Stub {
            async fn fetch(
                &self,
                _reference: &ExternalBlobReference,
            ) -> std::result::Result<Vec<u8>, Box<dyn std::error::Error + Send + Sync>>
            {
                Ok(self.0.clone())
            }
        }

        let snapshot = SyncdSnapshot {
            version: Some(SyncdVersion { version: Some(3) }),
            records: vec![],
            mac: None,
            key_id: Some(KeyId {
                id: Some(vec![1, 2]),
            }),
        };
        let plaintext = snapshot.encode_to_vec();

        let media_key = [9u8; 32];
        let okm =
            crate::crypto::hkdf::sha256(&media_key, None, b"WhatsApp App State Keys", 80).unwrap();
        let ciphertext = cbc::encrypt(&okm[16..48], &okm[0..16], &plaintext).unwrap();
        let mut blob = ciphertext.clone();
        blob.extend_from_slice(&hmac_sha256(&okm[48..80], &[&okm[0..16], &ciphertext])[..10]);

        let reference = ExternalBlobReference {
            media_key: Some(media_key.to_vec()),
            ..Default::default()
        };

        let fetched = fetch_external_snapshot(&Stub(blob.clone()), &reference)
            .await
            .unwrap();
        assert_eq!(fetched, snapshot);

        // A corrupted trailer is refused.
        let mut bad = blob;
        let last = bad.len() - 1;
        bad[last] ^= 0x01;
        assert!(matches!(
            fetch_external_snapshot(&Stub(bad), &reference).await,
            Err(AppStateError::MacMismatch("external blob"))
        ));
    }
}

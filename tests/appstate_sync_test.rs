//! Scenario tests for app-state synchronization: sequential patches,
//! verify-then-commit atomicity, and the dead-letter queue.

use wamd::appstate::hash::generate_patch_mac;
use wamd::appstate::patch::{KeyId, SyncdMutation, SyncdOperation, SyncdPatch, SyncdVersion};
use wamd::appstate::processor::{decode_mutation, encode_mutation};
use wamd::appstate::{
    AppStateError, AppStateSyncKey, LTHashState, Processor, expand_mutation_keys,
};
use wamd::Keys;

const COLLECTION: &str = "regular_high";

fn sync_key(id: u8) -> AppStateSyncKey {
    AppStateSyncKey {
        key_id: vec![id],
        key_data: [id; 32],
        fingerprint: vec![],
        timestamp: 0,
    }
}

/// Builds a patch with MACs valid against `before`, returning the
/// patch and the state it produces.
fn build_patch(
    key: &AppStateSyncKey,
    before: &LTHashState,
    version: u64,
    ops: &[(SyncdOperation, &[&str], &[u8])],
) -> (SyncdPatch, LTHashState) {
    let expanded = expand_mutation_keys(&key.key_data);
    let mut after = before.clone();
    after.version = version;

    let mut mutations = Vec::new();
    let mut value_macs = Vec::new();
    for (operation, index, action) in ops {
        let record = encode_mutation(*operation, index, action, &expanded, &key.key_id);
        let decoded = decode_mutation(*operation, &record, &expanded).unwrap();
        after.apply_mutation(*operation, &decoded.index_mac, &decoded.value_mac);
        value_macs.push(decoded.value_mac);
        mutations.push(SyncdMutation {
            operation: Some(*operation as i32),
            record: Some(record),
        });
    }

    let patch = SyncdPatch {
        version: Some(SyncdVersion {
            version: Some(version),
        }),
        mutations,
        external_mutations: None,
        snapshot_mac: Some(after.snapshot_mac(COLLECTION, &expanded.snapshot_mac).to_vec()),
        patch_mac: Some(
            generate_patch_mac(&value_macs, version, COLLECTION, &expanded.patch_mac).to_vec(),
        ),
        key_id: Some(KeyId {
            id: Some(key.key_id.clone()),
        }),
        device_index: None,
    };
    (patch, after)
}

#[test]
fn sequential_patches_accumulate() {
    let mut keys = Keys::new_random(1);
    keys.add_app_state_keys([sync_key(7)]);
    let mut processor = Processor::new();

    let (p1, s1) = build_patch(
        &sync_key(7),
        &LTHashState::default(),
        1,
        &[
            (SyncdOperation::Set, &["mute", "a@s"], b"on"),
            (SyncdOperation::Set, &["pin", "b@s"], b"yes"),
        ],
    );
    processor.process_patch(&mut keys, COLLECTION, &p1).unwrap();

    let (p2, s2) = build_patch(
        &sync_key(7),
        &s1,
        2,
        &[(SyncdOperation::Remove, &["mute", "a@s"], b"off")],
    );
    let mutations = processor.process_patch(&mut keys, COLLECTION, &p2).unwrap();
    assert_eq!(mutations.len(), 1);
    assert_eq!(mutations[0].operation, SyncdOperation::Remove);

    let state = keys.find_hash_state(COLLECTION).unwrap();
    assert_eq!(state.version, 2);
    assert_eq!(state.index_value_map.len(), 1);
    assert_eq!(state.hash, s2.hash);
}

#[test]
fn tampered_second_mutation_preserves_prior_hash() {
    let mut keys = Keys::new_random(1);
    keys.add_app_state_keys([sync_key(7)]);
    let mut processor = Processor::new();

    let (p1, s1) = build_patch(
        &sync_key(7),
        &LTHashState::default(),
        1,
        &[(SyncdOperation::Set, &["base"], b"v")],
    );
    processor.process_patch(&mut keys, COLLECTION, &p1).unwrap();

    let (mut p2, _) = build_patch(
        &sync_key(7),
        &s1,
        2,
        &[
            (SyncdOperation::Set, &["x"], b"1"),
            (SyncdOperation::Set, &["y"], b"2"),
        ],
    );
    let blob = p2.mutations[1]
        .record
        .as_mut()
        .unwrap()
        .value
        .as_mut()
        .unwrap()
        .blob
        .as_mut()
        .unwrap();
    blob[20] ^= 0xFF;

    assert!(processor.process_patch(&mut keys, COLLECTION, &p2).is_err());
    let state = keys.find_hash_state(COLLECTION).unwrap();
    assert_eq!(state.hash, s1.hash, "no partial application");
    assert_eq!(state.version, 1);
}

#[test]
fn parked_patches_drain_in_version_order() {
    let mut keys = Keys::new_random(1);
    let mut processor = Processor::new();

    let (p1, s1) = build_patch(
        &sync_key(9),
        &LTHashState::default(),
        1,
        &[(SyncdOperation::Set, &["first"], b"1")],
    );
    let (p2, s2) = build_patch(
        &sync_key(9),
        &s1,
        2,
        &[(SyncdOperation::Set, &["second"], b"2")],
    );

    // Arrive out of order, both before the key.
    assert!(matches!(
        processor.process_patch(&mut keys, COLLECTION, &p2),
        Err(AppStateError::MissingAppStateKey { .. })
    ));
    assert!(matches!(
        processor.process_patch(&mut keys, COLLECTION, &p1),
        Err(AppStateError::MissingAppStateKey { .. })
    ));
    assert_eq!(processor.pending_patches(), 2);
    assert!(keys.find_hash_state(COLLECTION).is_none());

    let drained = processor.provide_key(&mut keys, sync_key(9)).unwrap();
    assert_eq!(drained.len(), 2);
    assert_eq!(drained[0].index, vec!["first"]);
    assert_eq!(drained[1].index, vec!["second"]);
    assert_eq!(processor.pending_patches(), 0);

    let state = keys.find_hash_state(COLLECTION).unwrap();
    assert_eq!(state.version, 2);
    assert_eq!(state.hash, s2.hash);
}

#[test]
fn patches_resume_after_a_snapshot() {
    use prost::Message as _;
    use wamd::appstate::patch::{SyncdSnapshot, SyncdVersion as V};

    let mut keys = Keys::new_random(1);
    keys.add_app_state_keys([sync_key(5)]);
    let mut processor = Processor::new();
    let expanded = expand_mutation_keys(&sync_key(5).key_data);

    // Build a snapshot at version 9.
    let record = encode_mutation(
        SyncdOperation::Set,
        &["archived", "c@s"],
        b"yes",
        &expanded,
        &sync_key(5).key_id,
    );
    let decoded = decode_mutation(SyncdOperation::Set, &record, &expanded).unwrap();
    let mut rebuilt = LTHashState {
        version: 9,
        ..Default::default()
    };
    rebuilt.apply_mutation(SyncdOperation::Set, &decoded.index_mac, &decoded.value_mac);

    let snapshot = SyncdSnapshot {
        version: Some(V { version: Some(9) }),
        records: vec![record],
        mac: Some(rebuilt.snapshot_mac(COLLECTION, &expanded.snapshot_mac).to_vec()),
        key_id: Some(KeyId {
            id: Some(sync_key(5).key_id),
        }),
    };
    // Exercise the wire shape too.
    let snapshot = SyncdSnapshot::decode(snapshot.encode_to_vec().as_slice()).unwrap();
    processor
        .process_snapshot(&mut keys, COLLECTION, &snapshot)
        .unwrap();

    // A patch below or at the snapshot version is a no-op...
    let (stale, _) = build_patch(
        &sync_key(5),
        &LTHashState::default(),
        9,
        &[(SyncdOperation::Set, &["noop"], b"x")],
    );
    assert!(processor
        .process_patch(&mut keys, COLLECTION, &stale)
        .unwrap()
        .is_empty());

    // ...and version 10 applies on top of the rebuilt state.
    let before = keys.find_hash_state(COLLECTION).unwrap().clone();
    let (next, after) = build_patch(
        &sync_key(5),
        &before,
        10,
        &[(SyncdOperation::Set, &["fresh"], b"1")],
    );
    processor.process_patch(&mut keys, COLLECTION, &next).unwrap();
    let state = keys.find_hash_state(COLLECTION).unwrap();
    assert_eq!(state.version, 10);
    assert_eq!(state.hash, after.hash);
}

#[test]
fn keys_are_looked_up_per_patch() {
    let mut keys = Keys::new_random(1);
    keys.add_app_state_keys([sync_key(1)]);
    let mut processor = Processor::new();

    // Patch keyed by a different, unknown sync key is parked even
    // though another key is present.
    let (patch, _) = build_patch(
        &sync_key(2),
        &LTHashState::default(),
        1,
        &[(SyncdOperation::Set, &["z"], b"1")],
    );
    let err = processor
        .process_patch(&mut keys, COLLECTION, &patch)
        .unwrap_err();
    match err {
        AppStateError::MissingAppStateKey { key_id } => assert_eq!(key_id, vec![2]),
        other => panic!("unexpected error: {other}"),
    }
}

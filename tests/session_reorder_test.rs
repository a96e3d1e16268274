//! Scenario tests for pairwise sessions: reordered delivery, duplicate
//! rejection and one-shot key consumption.

use rand::seq::SliceRandom;

use wamd::signal::{MessageKind, PreKeyBundle, SessionAddress, SessionCipher, SignalProtocolError};
use wamd::Keys;

fn bob_address() -> SessionAddress {
    SessionAddress::new("bob", 0)
}

fn alice_address() -> SessionAddress {
    SessionAddress::new("alice", 0)
}

fn establish() -> (Keys, Keys) {
    let mut alice = Keys::new_random(1);
    let mut bob = Keys::new_random(2);
    bob.generate_pre_keys(4);
    let bundle = PreKeyBundle::for_local_device(&bob, Some(1));
    SessionCipher::new(&mut alice, bob_address())
        .process_bundle(&bundle)
        .unwrap();
    (alice, bob)
}

#[test]
fn shuffled_delivery_recovers_every_payload() {
    let (mut alice, mut bob) = establish();

    let payloads: Vec<Vec<u8>> = (0..40u32)
        .map(|i| format!("payload number {i}").into_bytes())
        .collect();
    let mut frames: Vec<(usize, MessageKind, Vec<u8>)> = payloads
        .iter()
        .enumerate()
        .map(|(i, payload)| {
            let (kind, frame) = SessionCipher::new(&mut alice, bob_address())
                .encrypt(payload)
                .unwrap();
            (i, kind, frame)
        })
        .collect();

    frames.shuffle(&mut rand::rng());

    let mut recovered = vec![None; payloads.len()];
    for (i, kind, frame) in frames {
        let mut cipher = SessionCipher::new(&mut bob, alice_address());
        let plaintext = match kind {
            MessageKind::PreKey => cipher.decrypt_prekey_message(&frame).unwrap(),
            _ => cipher.decrypt_message(&frame).unwrap(),
        };
        recovered[i] = Some(plaintext);
    }

    for (i, payload) in payloads.iter().enumerate() {
        assert_eq!(recovered[i].as_deref(), Some(payload.as_slice()));
    }
    // Every stashed key was consumed exactly once.
    assert_eq!(bob.find_session(&alice_address()).unwrap().total_skipped(), 0);
}

#[test]
fn every_frame_is_one_shot() {
    let (mut alice, mut bob) = establish();

    let frames: Vec<(MessageKind, Vec<u8>)> = (0..10u32)
        .map(|i| {
            SessionCipher::new(&mut alice, bob_address())
                .encrypt(format!("m{i}").as_bytes())
                .unwrap()
        })
        .collect();

    // Deliver even-indexed frames first, then odd, then replay all.
    let order: Vec<usize> = (0..10).step_by(2).chain((1..10).step_by(2)).collect();
    for &i in &order {
        let (kind, frame) = &frames[i];
        let mut cipher = SessionCipher::new(&mut bob, alice_address());
        let plaintext = match kind {
            MessageKind::PreKey => cipher.decrypt_prekey_message(frame).unwrap(),
            _ => cipher.decrypt_message(frame).unwrap(),
        };
        assert_eq!(plaintext, format!("m{i}").as_bytes());
    }
    for (kind, frame) in &frames {
        let mut cipher = SessionCipher::new(&mut bob, alice_address());
        let result = match kind {
            MessageKind::PreKey => cipher.decrypt_prekey_message(frame),
            _ => cipher.decrypt_message(frame),
        };
        assert!(matches!(
            result,
            Err(SignalProtocolError::DuplicateMessage(_, _))
        ));
    }
}

#[test]
fn reorder_across_ratchet_rotation_still_decrypts() {
    let (mut alice, mut bob) = establish();

    // Establish both directions.
    let (_, frame) = SessionCipher::new(&mut alice, bob_address())
        .encrypt(b"first")
        .unwrap();
    SessionCipher::new(&mut bob, alice_address())
        .decrypt_prekey_message(&frame)
        .unwrap();
    let (_, frame) = SessionCipher::new(&mut bob, alice_address())
        .encrypt(b"ack")
        .unwrap();
    SessionCipher::new(&mut alice, bob_address())
        .decrypt_message(&frame)
        .unwrap();

    // A frame from alice's current chain, held back...
    let (_, held_back) = SessionCipher::new(&mut alice, bob_address())
        .encrypt(b"late")
        .unwrap();

    // ...while a full round trip rotates the ratchet underneath it.
    let (_, frame) = SessionCipher::new(&mut bob, alice_address())
        .encrypt(b"rotate")
        .unwrap();
    SessionCipher::new(&mut alice, bob_address())
        .decrypt_message(&frame)
        .unwrap();
    let (_, frame) = SessionCipher::new(&mut alice, bob_address())
        .encrypt(b"fresh chain")
        .unwrap();
    SessionCipher::new(&mut bob, alice_address())
        .decrypt_message(&frame)
        .unwrap();

    // The held-back frame still decrypts from the stashed key, even
    // though the ratchet rotated past its chain position.
    assert_eq!(
        SessionCipher::new(&mut bob, alice_address())
            .decrypt_message(&held_back)
            .unwrap(),
        b"late"
    );
}

//! Pairwise session establishment and the Double Ratchet.
//!
//! All mutation is clone-then-commit: the session is copied out of the
//! key store, advanced, and written back only after MAC verification
//! and decryption succeed. A failed or cancelled receive therefore
//! leaves the store exactly as it was before the message arrived.

use crate::crypto::cbc;
use crate::crypto::key_pair::{KeyPair, serialize_public};
use crate::crypto::xed25519;
use crate::keys::Keys;
use crate::signal::address::SessionAddress;
use crate::signal::bundle::PreKeyBundle;
use crate::signal::consts;
use crate::signal::error::{Result, SignalProtocolError};
use crate::signal::message::{MessageKind, PreKeySignalMessage, SignalMessage};
use crate::signal::ratchet::{MessageKeys, RootKey, derive_initial_keys};
use crate::signal::session::{PendingPreKey, ReceivingChain, SendingChain, Session};

pub struct SessionCipher<'a> {
    keys: &'a mut Keys,
    address: SessionAddress,
}

impl<'a> SessionCipher<'a> {
    pub fn new(keys: &'a mut Keys, address: SessionAddress) -> Self {
        Self { keys, address }
    }

    /// X3DH, initiator side. Builds a session from the peer's published
    /// bundle and records the pending-prekey material replayed in every
    /// outgoing message until the peer acknowledges.
    pub fn process_bundle(&mut self, bundle: &PreKeyBundle) -> Result<()> {
        if !self.keys.is_trusted(&self.address, &bundle.identity_key) {
            self.keys.remove_session(&self.address);
            return Err(SignalProtocolError::UntrustedIdentity(self.address.clone()));
        }
        if !xed25519::verify(
            &bundle.identity_key,
            &serialize_public(&bundle.signed_pre_key),
            &bundle.signed_pre_key_signature,
        ) {
            return Err(SignalProtocolError::InvalidSignature);
        }

        let base_key = KeyPair::new();
        let identity = self.keys.identity_key_pair.clone();

        let mut master = Vec::with_capacity(32 * 5);
        master.extend_from_slice(&[0xFF; 32]);
        master.extend_from_slice(&identity.agree(&bundle.signed_pre_key));
        master.extend_from_slice(&base_key.agree(&bundle.identity_key));
        master.extend_from_slice(&base_key.agree(&bundle.signed_pre_key));
        if let Some(one_time) = &bundle.pre_key {
            master.extend_from_slice(&base_key.agree(one_time));
        }
        let (root, chain) = derive_initial_keys(&master);

        // First DH-ratchet step against the peer's signed prekey.
        let sending_ratchet = KeyPair::new();
        let (next_root, sending_chain) = root.create_chain(&bundle.signed_pre_key, &sending_ratchet);

        let mut session = Session::new(
            *next_root.key(),
            bundle.identity_key,
            base_key.public_key,
        );
        session.push_receiving_chain(ReceivingChain::new(bundle.signed_pre_key, &chain));
        session.sending_chain = Some(SendingChain {
            chain_key: *sending_chain.key(),
            counter: sending_chain.index(),
            previous_counter: 0,
            ratchet_key_pair: sending_ratchet,
            their_ratchet_key: bundle.signed_pre_key,
        });
        session.pending_pre_key = Some(PendingPreKey {
            pre_key_id: bundle.pre_key_id,
            signed_pre_key_id: bundle.signed_pre_key_id,
            base_key: base_key.public_key,
        });
        session.registration_id = bundle.registration_id;

        self.keys.pin_identity(self.address.clone(), bundle.identity_key);
        self.keys.put_session(self.address.clone(), session);
        Ok(())
    }

    /// Encrypts one payload, advancing the sending chain. Returns the
    /// frame kind: `pkmsg` while the session awaits acknowledgement,
    /// `msg` afterwards.
    pub fn encrypt(&mut self, plaintext: &[u8]) -> Result<(MessageKind, Vec<u8>)> {
        let mut session = self
            .keys
            .find_session(&self.address)
            .cloned()
            .ok_or_else(|| SignalProtocolError::NoValidSessions(self.address.clone()))?;
        let our_identity = self.keys.identity_key_pair.public_key;
        let their_identity = session.their_identity;

        let sending = session
            .sending_chain
            .as_mut()
            .ok_or_else(|| SignalProtocolError::NoValidSessions(self.address.clone()))?;
        let chain_key = sending.chain_key();
        let message_keys = chain_key.message_keys();

        let ciphertext = cbc::encrypt(message_keys.cipher_key(), message_keys.iv(), plaintext)
            .map_err(|_| SignalProtocolError::InvalidMessage("encryption failed"))?;
        let message = SignalMessage::new(
            message_keys.mac_key(),
            sending.ratchet_key_pair.public_key,
            chain_key.index(),
            sending.previous_counter,
            ciphertext,
            &our_identity,
            &their_identity,
        );
        sending.advance(&chain_key.next_chain_key());

        let result = match &session.pending_pre_key {
            Some(pending) => {
                let wrapped = PreKeySignalMessage::new(
                    self.keys.id,
                    pending.pre_key_id,
                    pending.signed_pre_key_id,
                    pending.base_key,
                    our_identity,
                    message,
                );
                (MessageKind::PreKey, wrapped.serialized().to_vec())
            }
            None => (MessageKind::Whisper, message.serialized().to_vec()),
        };

        self.keys.put_session(self.address.clone(), session);
        Ok(result)
    }

    /// Decrypts a `pkmsg`, running X3DH as responder when the frame
    /// opens a session we do not have yet.
    pub fn decrypt_prekey_message(&mut self, serialized: &[u8]) -> Result<Vec<u8>> {
        let message = PreKeySignalMessage::try_from(serialized)?;

        if !self.keys.is_trusted(&self.address, message.identity_key()) {
            // Fatal: drop the poisoned session; further use reports
            // NoValidSessions until it is rebuilt.
            log::warn!("identity mismatch in prekey message from {}", self.address);
            self.keys.remove_session(&self.address);
            return Err(SignalProtocolError::UntrustedIdentity(self.address.clone()));
        }

        let reuse = self
            .keys
            .find_session(&self.address)
            .is_some_and(|session| &session.base_key == message.base_key());

        let mut session = if reuse {
            // Retransmission of the prekey frame for a session we
            // already built; decrypt with the existing chains.
            self.keys
                .find_session(&self.address)
                .cloned()
                .expect("session presence just checked")
        } else {
            self.initialize_as_responder(&message)?
        };

        let our_identity = self.keys.identity_key_pair.clone();
        let plaintext = Self::decrypt_in_session(&our_identity, &mut session, message.message())?;

        session.pending_pre_key = None;
        self.keys
            .pin_identity(self.address.clone(), *message.identity_key());
        self.keys.put_session(self.address.clone(), session);
        Ok(plaintext)
    }

    /// Decrypts a regular whisper message.
    pub fn decrypt_message(&mut self, serialized: &[u8]) -> Result<Vec<u8>> {
        let message = SignalMessage::try_from(serialized)?;
        let mut session = self
            .keys
            .find_session(&self.address)
            .cloned()
            .ok_or_else(|| SignalProtocolError::NoValidSessions(self.address.clone()))?;

        let our_identity = self.keys.identity_key_pair.clone();
        let plaintext = Self::decrypt_in_session(&our_identity, &mut session, &message)?;

        // First successful receive acknowledges the session.
        session.pending_pre_key = None;
        self.keys.put_session(self.address.clone(), session);
        Ok(plaintext)
    }

    /// X3DH, responder side: mirror the initiator's agreements with our
    /// private halves, consuming the one-time prekey if one was used.
    fn initialize_as_responder(&mut self, message: &PreKeySignalMessage) -> Result<Session> {
        let signed_pre_key = self
            .keys
            .signed_pre_key_by_id(message.signed_pre_key_id())
            .map_err(|_| SignalProtocolError::InvalidKeyId(message.signed_pre_key_id()))?
            .key_pair
            .clone();
        let one_time = match message.pre_key_id() {
            Some(id) => {
                log::info!("consuming one-time prekey {id} for {}", self.address);
                Some(
                    self.keys
                        .consume_pre_key(id)
                        .map_err(|_| SignalProtocolError::InvalidKeyId(id))?
                        .key_pair,
                )
            }
            None => None,
        };
        let identity = self.keys.identity_key_pair.clone();

        let mut master = Vec::with_capacity(32 * 5);
        master.extend_from_slice(&[0xFF; 32]);
        master.extend_from_slice(&signed_pre_key.agree(message.identity_key()));
        master.extend_from_slice(&identity.agree(message.base_key()));
        master.extend_from_slice(&signed_pre_key.agree(message.base_key()));
        if let Some(one_time) = &one_time {
            master.extend_from_slice(&one_time.agree(message.base_key()));
        }
        let (root, chain) = derive_initial_keys(&master);

        let mut session = Session::new(
            *root.key(),
            *message.identity_key(),
            *message.base_key(),
        );
        // Our first sending chain rides the signed prekey as ratchet
        // key; the initiator's first message triggers the DH step that
        // replaces it.
        session.sending_chain = Some(SendingChain {
            chain_key: *chain.key(),
            counter: chain.index(),
            previous_counter: 0,
            ratchet_key_pair: signed_pre_key,
            their_ratchet_key: *message.base_key(),
        });
        session.registration_id = message.registration_id();
        Ok(session)
    }

    /// Core receive path over an already-loaded session copy.
    fn decrypt_in_session(
        our_identity: &KeyPair,
        session: &mut Session,
        message: &SignalMessage,
    ) -> Result<Vec<u8>> {
        let their_ratchet = *message.ratchet_key();

        if session.find_receiving_chain(&their_ratchet).is_none() {
            Self::ratchet_step(session, &their_ratchet)?;
        }
        let chain_index = session
            .find_receiving_chain(&their_ratchet)
            .expect("chain created above");

        let counter = message.counter();
        let chain = &mut session.receiving_chains[chain_index];
        let message_keys = if counter < chain.counter {
            match chain.take_skipped(counter) {
                Some(seed) => MessageKeys::derive(&seed, counter),
                None => {
                    return Err(SignalProtocolError::DuplicateMessage(chain.counter, counter));
                }
            }
        } else {
            let jump = counter - chain.counter;
            if jump as usize > consts::MAX_MESSAGE_KEYS {
                return Err(SignalProtocolError::TooManySkipped(jump));
            }
            let mut chain_key = chain.chain_key();
            while chain_key.index() < counter {
                chain.stash_skipped(chain_key.index(), chain_key.message_key_seed());
                chain_key = chain_key.next_chain_key();
            }
            let message_keys = chain_key.message_keys();
            chain.advance(&chain_key.next_chain_key());
            message_keys
        };
        session.enforce_skipped_cap();

        if !message.verify_mac(
            &session.their_identity,
            &our_identity.public_key,
            message_keys.mac_key(),
        ) {
            return Err(SignalProtocolError::InvalidMessage("MAC verification failed"));
        }

        cbc::decrypt(message_keys.cipher_key(), message_keys.iv(), message.body())
            .map_err(|_| SignalProtocolError::InvalidMessage("bad padding"))
    }

    /// One DH-ratchet rotation: derive the receiving chain for the
    /// unseen ratchet key, then a fresh sending chain under a new
    /// ratchet pair.
    fn ratchet_step(session: &mut Session, their_ratchet: &[u8; 32]) -> Result<()> {
        let sending = session
            .sending_chain
            .as_ref()
            .ok_or(SignalProtocolError::InvalidMessage("session has no sender chain"))?;
        let previous_counter = sending.counter;

        let root = RootKey::new(session.root_key);
        let (receiving_root, receiving_chain) =
            root.create_chain(their_ratchet, &sending.ratchet_key_pair);

        let next_ratchet = KeyPair::new();
        let (next_root, sending_chain) = receiving_root.create_chain(their_ratchet, &next_ratchet);

        session.root_key = *next_root.key();
        session.push_receiving_chain(ReceivingChain::new(*their_ratchet, &receiving_chain));
        session.sending_chain = Some(SendingChain {
            chain_key: *sending_chain.key(),
            counter: sending_chain.index(),
            previous_counter,
            ratchet_key_pair: next_ratchet,
            their_ratchet_key: *their_ratchet,
        });
        Ok(())
    }
}

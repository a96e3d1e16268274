//! Group messaging: the Sender Key protocol.
//!
//! A sender ratchets one symmetric chain per group; recipients learn
//! the chain head from a distribution message delivered over pairwise
//! sessions and then advance it locally, stashing skipped iterations
//! within the same bounded window as pairwise chains.

pub mod record;

use rand::TryRngCore;
use rand::rngs::OsRng;

use crate::crypto::cbc;
use crate::crypto::key_pair::KeyPair;
use crate::crypto::rand_bytes;
use crate::keys::Keys;
use crate::signal::address::SenderKeyName;
use crate::signal::consts;
use crate::signal::error::{Result, SignalProtocolError};
use crate::signal::message::{SenderKeyDistributionMessage, SenderKeyMessage};
use record::{SenderKeyRecord, SenderKeyState, SenderMessageKey};

/// Creates and ingests distribution messages.
pub struct GroupSessionBuilder<'a> {
    keys: &'a mut Keys,
}

impl<'a> GroupSessionBuilder<'a> {
    pub fn new(keys: &'a mut Keys) -> Self {
        Self { keys }
    }

    /// Builds the distribution message announcing our chain for `name`,
    /// creating the local sender state on first use.
    pub fn create_distribution_message(
        &mut self,
        name: &SenderKeyName,
    ) -> Result<SenderKeyDistributionMessage> {
        let record = match self.keys.find_sender_key(name) {
            Some(record) if record.state().is_some_and(|s| s.signature_private.is_some()) => {
                record.clone()
            }
            _ => {
                // Key ids stay in the positive 31-bit range.
                let mut raw = [0u8; 4];
                OsRng.try_fill_bytes(&mut raw).expect("RNG failure");
                let key_id = u32::from_be_bytes(raw) >> 1;
                log::info!("creating sender key {key_id} for {name}");
                let signing = KeyPair::new();
                let mut record = SenderKeyRecord::new_empty();
                record.add_state(SenderKeyState::new(
                    key_id,
                    0,
                    rand_bytes(),
                    signing.public_key,
                    Some(signing.private_key),
                ));
                self.keys.put_sender_key(name.clone(), record.clone());
                record
            }
        };

        let state = record
            .state()
            .ok_or_else(|| SignalProtocolError::NoSenderKeyState(name.clone()))?;
        Ok(SenderKeyDistributionMessage::new(
            state.key_id,
            state.iteration,
            state.chain_key,
            state.signature_public,
        ))
    }

    /// Stores a peer's announced chain as the newest state for `name`.
    pub fn process_distribution_message(
        &mut self,
        name: &SenderKeyName,
        message: &SenderKeyDistributionMessage,
    ) {
        log::info!(
            "processing sender key distribution for {name} with key id {}",
            message.key_id()
        );
        let mut record = self
            .keys
            .find_sender_key(name)
            .cloned()
            .unwrap_or_else(SenderKeyRecord::new_empty);
        record.add_state(SenderKeyState::new(
            message.key_id(),
            message.iteration(),
            *message.chain_key(),
            *message.signing_key(),
            None,
        ));
        self.keys.put_sender_key(name.clone(), record);
    }
}

/// Encrypts and decrypts group payloads for one (group, sender).
pub struct GroupCipher<'a> {
    keys: &'a mut Keys,
    name: SenderKeyName,
}

impl<'a> GroupCipher<'a> {
    pub fn new(keys: &'a mut Keys, name: SenderKeyName) -> Self {
        Self { keys, name }
    }

    pub fn encrypt(&mut self, plaintext: &[u8]) -> Result<SenderKeyMessage> {
        let mut record = self
            .keys
            .find_sender_key(&self.name)
            .cloned()
            .ok_or_else(|| SignalProtocolError::NoSenderKeyState(self.name.clone()))?;

        let state = record
            .state_mut()
            .ok_or_else(|| SignalProtocolError::NoSenderKeyState(self.name.clone()))?;
        let signing = state
            .signing_key_pair()
            .ok_or_else(|| SignalProtocolError::NoSenderKeyState(self.name.clone()))?;

        let chain = state.sender_chain_key();
        let message_key = chain.message_key();
        let ciphertext = cbc::encrypt(message_key.cipher_key(), message_key.iv(), plaintext)
            .map_err(|_| SignalProtocolError::InvalidMessage("group encryption failed"))?;
        let message = SenderKeyMessage::new(
            state.key_id,
            message_key.iteration(),
            ciphertext,
            &signing,
        );

        state.set_sender_chain_key(&chain.next());
        self.keys.put_sender_key(self.name.clone(), record);
        Ok(message)
    }

    pub fn decrypt(&mut self, serialized: &[u8]) -> Result<Vec<u8>> {
        let message = SenderKeyMessage::try_from(serialized)?;

        let mut record = self
            .keys
            .find_sender_key(&self.name)
            .cloned()
            .ok_or_else(|| SignalProtocolError::NoSenderKeyState(self.name.clone()))?;

        let state = record
            .state_for_key_id_mut(message.key_id())
            .ok_or(SignalProtocolError::InvalidKeyId(message.key_id()))?;

        if !message.verify_signature(&state.signature_public) {
            return Err(SignalProtocolError::InvalidSignature);
        }

        let message_key = Self::message_key_for(state, message.iteration())?;
        let plaintext = cbc::decrypt(message_key.cipher_key(), message_key.iv(), message.body())
            .map_err(|_| SignalProtocolError::InvalidMessage("group decryption failed"))?;

        // Commit the advanced state only after the payload decrypted.
        self.keys.put_sender_key(self.name.clone(), record);
        Ok(plaintext)
    }

    /// Advances the chain to `iteration`, stashing seeds for the gap and
    /// consuming a stashed seed when the chain already moved past it.
    fn message_key_for(state: &mut SenderKeyState, iteration: u32) -> Result<SenderMessageKey> {
        let mut chain = state.sender_chain_key();

        if chain.iteration() > iteration {
            return match state.take_message_key(iteration) {
                Some(seed) => Ok(SenderMessageKey::derive(&seed, iteration)),
                None => Err(SignalProtocolError::DuplicateMessage(
                    chain.iteration(),
                    iteration,
                )),
            };
        }

        let jump = iteration - chain.iteration();
        if jump as usize > consts::MAX_MESSAGE_KEYS {
            return Err(SignalProtocolError::TooManySkipped(jump));
        }

        while chain.iteration() < iteration {
            state.stash_message_key(chain.iteration(), chain.message_key_seed());
            chain = chain.next();
        }

        let message_key = chain.message_key();
        state.set_sender_chain_key(&chain.next());
        Ok(message_key)
    }
}

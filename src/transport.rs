//! The AEAD interface handed to the websocket transport.
//!
//! Frames are sealed with AES-256-GCM under the session's write/read
//! keys; the nonce is the 12-byte little-endian encoding of the
//! direction's counter, bumped atomically after each use so a nonce is
//! never reused within `AEAD_NONCE_SPACE`.

use thiserror::Error;

use crate::crypto::gcm;
use crate::keys::{Keys, KeysError};

/// Distinct nonces available per direction before the session must end.
pub const AEAD_NONCE_SPACE: u64 = u64::MAX;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("transport keys are not established")]
    NoTransportKeys,
    /// Counter exhaustion; fatal for the transport session.
    #[error(transparent)]
    Counter(#[from] KeysError),
    #[error("transport AEAD operation failed")]
    Crypto,
}

type Result<T> = std::result::Result<T, TransportError>;

/// The u64 counter, little-endian, in the low 8 of 12 nonce bytes.
pub fn transport_iv(counter: u64) -> [u8; 12] {
    let mut iv = [0u8; 12];
    iv[..8].copy_from_slice(&counter.to_le_bytes());
    iv
}

pub fn encrypt_transport(keys: &mut Keys, plaintext: &[u8], additional_data: &[u8]) -> Result<Vec<u8>> {
    let key = keys.write_key.ok_or(TransportError::NoTransportKeys)?;
    let counter = keys.bump_write_counter()?;
    gcm::encrypt(&key, &transport_iv(counter), plaintext, additional_data)
        .map_err(|_| TransportError::Crypto)
}

pub fn decrypt_transport(keys: &mut Keys, ciphertext: &[u8], additional_data: &[u8]) -> Result<Vec<u8>> {
    let key = keys.read_key.ok_or(TransportError::NoTransportKeys)?;
    let counter = keys.bump_read_counter()?;
    gcm::decrypt(&key, &transport_iv(counter), ciphertext, additional_data)
        .map_err(|_| TransportError::Crypto)
}

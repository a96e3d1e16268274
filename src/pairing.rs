//! Companion-device pairing.
//!
//! The companion advertises its keys (QR payload), the primary device
//! answers with a signed device identity wrapped in an HMAC container
//! keyed by the shared advertisement secret. The companion verifies the
//! container and the account signature, countersigns, and persists the
//! identity alongside the companion jid.

use base64::Engine as _;
use base64::prelude::BASE64_STANDARD;
use prost::Message as _;
use subtle::ConstantTimeEq;
use thiserror::Error;

use crate::crypto::{hmac_sha256, xed25519};
use crate::keys::Keys;

// Signature domain prefixes for the advertisement exchange.
const ADV_PREFIX_ACCOUNT_SIGNATURE: &[u8] = &[6, 0];
const ADV_PREFIX_DEVICE_SIGNATURE: &[u8] = &[6, 1];

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct SignedDeviceIdentityHmac {
    #[prost(bytes = "vec", optional, tag = "1")]
    pub details: Option<Vec<u8>>,
    #[prost(bytes = "vec", optional, tag = "2")]
    pub hmac: Option<Vec<u8>>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct SignedDeviceIdentity {
    #[prost(bytes = "vec", optional, tag = "1")]
    pub details: Option<Vec<u8>>,
    #[prost(bytes = "vec", optional, tag = "2")]
    pub account_signature_key: Option<Vec<u8>>,
    #[prost(bytes = "vec", optional, tag = "3")]
    pub account_signature: Option<Vec<u8>>,
    #[prost(bytes = "vec", optional, tag = "4")]
    pub device_signature: Option<Vec<u8>>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct DeviceIdentity {
    #[prost(uint32, optional, tag = "1")]
    pub raw_id: Option<u32>,
    #[prost(uint64, optional, tag = "2")]
    pub timestamp: Option<u64>,
    #[prost(uint32, optional, tag = "3")]
    pub key_index: Option<u32>,
}

#[derive(Debug, Error)]
pub enum PairingError {
    /// HMAC or signature mismatch; the handshake is aborted.
    #[error("pairing rejected: {0}")]
    PairingRejected(&'static str),
    #[error("unexpected pairing frame in state {0}")]
    InvalidTransition(&'static str),
    #[error("malformed pairing frame")]
    Malformed,
}

type Result<T> = std::result::Result<T, PairingError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PairingState {
    Unpaired,
    AdvertisementSent,
    IdentityProvided,
    Paired,
}

impl PairingState {
    fn name(&self) -> &'static str {
        match self {
            PairingState::Unpaired => "Unpaired",
            PairingState::AdvertisementSent => "AdvertisementSent",
            PairingState::IdentityProvided => "IdentityProvided",
            PairingState::Paired => "Paired",
        }
    }
}

/// The countersigned identity produced in `IdentityProvided`, carried
/// into `Paired` where it is persisted.
struct VerifiedIdentity {
    reply: Vec<u8>,
    key_index: u32,
}

pub struct PairingFsm {
    state: PairingState,
    verified: Option<VerifiedIdentity>,
}

impl Default for PairingFsm {
    fn default() -> Self {
        Self::new()
    }
}

impl PairingFsm {
    pub fn new() -> Self {
        Self {
            state: PairingState::Unpaired,
            verified: None,
        }
    }

    pub fn state(&self) -> PairingState {
        self.state
    }

    /// `Unpaired -> AdvertisementSent`. Returns the advertisement
    /// payload shown to the primary device: the pairing reference plus
    /// the noise, identity and advertisement keys, base64, comma-joined.
    pub fn start(&mut self, keys: &Keys, reference: &str) -> Result<String> {
        if self.state != PairingState::Unpaired {
            return Err(PairingError::InvalidTransition(self.state.name()));
        }
        let noise_b64 = BASE64_STANDARD.encode(keys.ephemeral_key_pair.public_key);
        let identity_b64 = BASE64_STANDARD.encode(keys.identity_key_pair.public_key);
        let adv_b64 = BASE64_STANDARD.encode(keys.companion_adv_key);
        self.state = PairingState::AdvertisementSent;
        Ok([reference, &noise_b64, &identity_b64, &adv_b64].join(","))
    }

    /// `AdvertisementSent -> IdentityProvided`. Verifies the HMAC
    /// container and the primary device's account signature, then
    /// countersigns. Returns the signed identity to send back.
    pub fn provide_identity(&mut self, keys: &Keys, payload: &[u8]) -> Result<Vec<u8>> {
        if self.state != PairingState::AdvertisementSent {
            return Err(PairingError::InvalidTransition(self.state.name()));
        }

        let container =
            SignedDeviceIdentityHmac::decode(payload).map_err(|_| PairingError::Malformed)?;
        let details = container.details.as_deref().ok_or(PairingError::Malformed)?;
        let claimed_hmac = container.hmac.as_deref().ok_or(PairingError::Malformed)?;

        let expected = hmac_sha256(&keys.companion_adv_key, &[details]);
        if !bool::from(expected.ct_eq(claimed_hmac)) {
            log::warn!("pairing identity container failed HMAC verification");
            return Err(PairingError::PairingRejected("hmac mismatch"));
        }

        let mut identity =
            SignedDeviceIdentity::decode(details).map_err(|_| PairingError::Malformed)?;
        let account_key: [u8; 32] = identity
            .account_signature_key
            .as_deref()
            .and_then(|k| k.try_into().ok())
            .ok_or(PairingError::Malformed)?;
        let account_signature: [u8; 64] = identity
            .account_signature
            .as_deref()
            .and_then(|s| s.try_into().ok())
            .ok_or(PairingError::Malformed)?;
        let inner_details = identity.details.clone().ok_or(PairingError::Malformed)?;

        let mut signed_message = ADV_PREFIX_ACCOUNT_SIGNATURE.to_vec();
        signed_message.extend_from_slice(&inner_details);
        signed_message.extend_from_slice(&keys.identity_key_pair.public_key);
        if !xed25519::verify(&account_key, &signed_message, &account_signature) {
            log::warn!("pairing identity failed account signature verification");
            return Err(PairingError::PairingRejected("signature mismatch"));
        }

        let mut to_sign = ADV_PREFIX_DEVICE_SIGNATURE.to_vec();
        to_sign.extend_from_slice(&inner_details);
        to_sign.extend_from_slice(&keys.identity_key_pair.public_key);
        to_sign.extend_from_slice(&account_key);
        identity.device_signature =
            Some(keys.identity_key_pair.sign_message(&to_sign).to_vec());

        let device = DeviceIdentity::decode(inner_details.as_slice())
            .map_err(|_| PairingError::Malformed)?;
        let reply = identity.encode_to_vec();
        self.verified = Some(VerifiedIdentity {
            reply: reply.clone(),
            key_index: device.key_index.unwrap_or(0),
        });
        self.state = PairingState::IdentityProvided;
        Ok(reply)
    }

    /// `IdentityProvided -> Paired`. Persists the countersigned
    /// identity and assigns the companion jid.
    pub fn finalize(&mut self, keys: &mut Keys, companion_jid: &str) -> Result<u32> {
        if self.state != PairingState::IdentityProvided {
            return Err(PairingError::InvalidTransition(self.state.name()));
        }
        let verified = self.verified.take().ok_or(PairingError::Malformed)?;
        keys.companion = Some(companion_jid.to_string());
        keys.companion_identity = Some(verified.reply);
        self.state = PairingState::Paired;
        log::info!("paired as {companion_jid} with key index {}", verified.key_index);
        Ok(verified.key_index)
    }
}

/// Builds the primary-device side of the exchange; used by tests and
/// by pairing simulations.
pub fn build_signed_identity(
    adv_key: &[u8; 32],
    account: &crate::crypto::key_pair::KeyPair,
    companion_identity_public: &[u8; 32],
    key_index: u32,
) -> Vec<u8> {
    let details = DeviceIdentity {
        raw_id: Some(1),
        timestamp: Some(0),
        key_index: Some(key_index),
    }
    .encode_to_vec();

    let mut to_sign = ADV_PREFIX_ACCOUNT_SIGNATURE.to_vec();
    to_sign.extend_from_slice(&details);
    to_sign.extend_from_slice(companion_identity_public);
    let account_signature = account.sign_message(&to_sign);

    let identity = SignedDeviceIdentity {
        details: Some(details),
        account_signature_key: Some(account.public_key.to_vec()),
        account_signature: Some(account_signature.to_vec()),
        device_signature: None,
    }
    .encode_to_vec();

    SignedDeviceIdentityHmac {
        hmac: Some(hmac_sha256(adv_key, &[&identity]).to_vec()),
        details: Some(identity),
    }
    .encode_to_vec()
}

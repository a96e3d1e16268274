//! Wire frames consumed and produced by the session layer.
//!
//! Every frame leads with a version byte (protocol version 3 in both
//! nibbles, 0x33) followed by a protobuf body; whisper messages append
//! an 8-byte truncated HMAC, sender-key messages a 64-byte signature.

use prost::Message as _;
use subtle::ConstantTimeEq;

use crate::crypto::key_pair::{KeyPair, deserialize_public, serialize_public};
use crate::crypto::{hmac_sha256, xed25519};
use crate::signal::consts::{CIPHERTEXT_VERSION, VERSION_BYTE};
use crate::signal::error::{Result, SignalProtocolError};

/// The transport tag of a ciphertext frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    /// `pkmsg`: prekey whisper message carrying X3DH material.
    PreKey,
    /// `msg`: regular whisper message.
    Whisper,
    /// `skmsg`: group sender-key message.
    SenderKey,
}

impl MessageKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageKind::PreKey => "pkmsg",
            MessageKind::Whisper => "msg",
            MessageKind::SenderKey => "skmsg",
        }
    }
}

impl std::str::FromStr for MessageKind {
    type Err = SignalProtocolError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "pkmsg" => Ok(MessageKind::PreKey),
            "msg" => Ok(MessageKind::Whisper),
            "skmsg" => Ok(MessageKind::SenderKey),
            _ => Err(SignalProtocolError::InvalidMessage("unknown message kind")),
        }
    }
}

impl std::fmt::Display for MessageKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

fn check_version(value: &[u8]) -> Result<()> {
    let version = value[0] >> 4;
    if version < CIPHERTEXT_VERSION {
        return Err(SignalProtocolError::LegacyMessage(version));
    }
    if version > CIPHERTEXT_VERSION {
        return Err(SignalProtocolError::InvalidVersion(version));
    }
    Ok(())
}

#[derive(Clone, PartialEq, ::prost::Message)]
struct SignalMessageProto {
    #[prost(bytes = "vec", optional, tag = "1")]
    ratchet_key: Option<Vec<u8>>,
    #[prost(uint32, optional, tag = "2")]
    counter: Option<u32>,
    #[prost(uint32, optional, tag = "3")]
    previous_counter: Option<u32>,
    #[prost(bytes = "vec", optional, tag = "4")]
    ciphertext: Option<Vec<u8>>,
}

/// A regular whisper message: ratchet header plus AES-CBC payload,
/// authenticated by an 8-byte truncated HMAC over both identities and
/// the whole frame.
#[derive(Debug, Clone)]
pub struct SignalMessage {
    ratchet_key: [u8; 32],
    counter: u32,
    previous_counter: u32,
    ciphertext: Vec<u8>,
    serialized: Vec<u8>,
}

impl SignalMessage {
    pub const MAC_LENGTH: usize = 8;

    #[allow(clippy::too_many_arguments)]
    pub fn new(
        mac_key: &[u8; 32],
        ratchet_key: [u8; 32],
        counter: u32,
        previous_counter: u32,
        ciphertext: Vec<u8>,
        sender_identity: &[u8; 32],
        receiver_identity: &[u8; 32],
    ) -> Self {
        let proto = SignalMessageProto {
            ratchet_key: Some(serialize_public(&ratchet_key).to_vec()),
            counter: Some(counter),
            previous_counter: Some(previous_counter),
            ciphertext: Some(ciphertext.clone()),
        };
        let mut serialized = Vec::with_capacity(1 + proto.encoded_len() + Self::MAC_LENGTH);
        serialized.push(VERSION_BYTE);
        proto
            .encode(&mut serialized)
            .expect("can always append to a Vec");
        let mac = Self::compute_mac(sender_identity, receiver_identity, mac_key, &serialized);
        serialized.extend_from_slice(&mac);
        Self {
            ratchet_key,
            counter,
            previous_counter,
            ciphertext,
            serialized,
        }
    }

    pub fn ratchet_key(&self) -> &[u8; 32] {
        &self.ratchet_key
    }

    pub fn counter(&self) -> u32 {
        self.counter
    }

    pub fn previous_counter(&self) -> u32 {
        self.previous_counter
    }

    pub fn body(&self) -> &[u8] {
        &self.ciphertext
    }

    pub fn serialized(&self) -> &[u8] {
        &self.serialized
    }

    pub fn verify_mac(
        &self,
        sender_identity: &[u8; 32],
        receiver_identity: &[u8; 32],
        mac_key: &[u8; 32],
    ) -> bool {
        let frame = &self.serialized[..self.serialized.len() - Self::MAC_LENGTH];
        let our_mac = Self::compute_mac(sender_identity, receiver_identity, mac_key, frame);
        let their_mac = &self.serialized[self.serialized.len() - Self::MAC_LENGTH..];
        let matches: bool = our_mac.ct_eq(their_mac).into();
        if !matches {
            log::warn!(
                "whisper MAC mismatch: theirs {} ours {}",
                hex::encode(their_mac),
                hex::encode(our_mac)
            );
        }
        matches
    }

    fn compute_mac(
        sender_identity: &[u8; 32],
        receiver_identity: &[u8; 32],
        mac_key: &[u8; 32],
        frame: &[u8],
    ) -> [u8; Self::MAC_LENGTH] {
        let full = hmac_sha256(
            mac_key,
            &[
                &serialize_public(sender_identity),
                &serialize_public(receiver_identity),
                frame,
            ],
        );
        let mut out = [0u8; Self::MAC_LENGTH];
        out.copy_from_slice(&full[..Self::MAC_LENGTH]);
        out
    }
}

impl TryFrom<&[u8]> for SignalMessage {
    type Error = SignalProtocolError;

    fn try_from(value: &[u8]) -> Result<Self> {
        if value.len() < 1 + Self::MAC_LENGTH {
            return Err(SignalProtocolError::CiphertextTooShort(value.len()));
        }
        check_version(value)?;
        let proto = SignalMessageProto::decode(&value[1..value.len() - Self::MAC_LENGTH])
            .map_err(|_| SignalProtocolError::InvalidProtobufEncoding)?;
        let ratchet_key = proto
            .ratchet_key
            .as_deref()
            .and_then(deserialize_public)
            .ok_or(SignalProtocolError::InvalidMessage("bad ratchet key"))?;
        Ok(Self {
            ratchet_key,
            counter: proto
                .counter
                .ok_or(SignalProtocolError::InvalidProtobufEncoding)?,
            previous_counter: proto.previous_counter.unwrap_or(0),
            ciphertext: proto
                .ciphertext
                .ok_or(SignalProtocolError::InvalidProtobufEncoding)?,
            serialized: value.to_vec(),
        })
    }
}

#[derive(Clone, PartialEq, ::prost::Message)]
struct PreKeySignalMessageProto {
    #[prost(uint32, optional, tag = "1")]
    pre_key_id: Option<u32>,
    #[prost(bytes = "vec", optional, tag = "2")]
    base_key: Option<Vec<u8>>,
    #[prost(bytes = "vec", optional, tag = "3")]
    identity_key: Option<Vec<u8>>,
    #[prost(bytes = "vec", optional, tag = "4")]
    message: Option<Vec<u8>>,
    #[prost(uint32, optional, tag = "5")]
    registration_id: Option<u32>,
    #[prost(uint32, optional, tag = "6")]
    signed_pre_key_id: Option<u32>,
}

/// A prekey whisper message: X3DH material wrapped around the first
/// whisper message of a fresh session.
#[derive(Debug, Clone)]
pub struct PreKeySignalMessage {
    registration_id: u32,
    pre_key_id: Option<u32>,
    signed_pre_key_id: u32,
    base_key: [u8; 32],
    identity_key: [u8; 32],
    message: SignalMessage,
    serialized: Vec<u8>,
}

impl PreKeySignalMessage {
    pub fn new(
        registration_id: u32,
        pre_key_id: Option<u32>,
        signed_pre_key_id: u32,
        base_key: [u8; 32],
        identity_key: [u8; 32],
        message: SignalMessage,
    ) -> Self {
        let proto = PreKeySignalMessageProto {
            pre_key_id,
            base_key: Some(serialize_public(&base_key).to_vec()),
            identity_key: Some(serialize_public(&identity_key).to_vec()),
            message: Some(message.serialized().to_vec()),
            registration_id: Some(registration_id),
            signed_pre_key_id: Some(signed_pre_key_id),
        };
        let mut serialized = Vec::with_capacity(1 + proto.encoded_len());
        serialized.push(VERSION_BYTE);
        proto
            .encode(&mut serialized)
            .expect("can always append to a Vec");
        Self {
            registration_id,
            pre_key_id,
            signed_pre_key_id,
            base_key,
            identity_key,
            message,
            serialized,
        }
    }

    pub fn registration_id(&self) -> u32 {
        self.registration_id
    }

    pub fn pre_key_id(&self) -> Option<u32> {
        self.pre_key_id
    }

    pub fn signed_pre_key_id(&self) -> u32 {
        self.signed_pre_key_id
    }

    pub fn base_key(&self) -> &[u8; 32] {
        &self.base_key
    }

    pub fn identity_key(&self) -> &[u8; 32] {
        &self.identity_key
    }

    pub fn message(&self) -> &SignalMessage {
        &self.message
    }

    pub fn serialized(&self) -> &[u8] {
        &self.serialized
    }
}

impl TryFrom<&[u8]> for PreKeySignalMessage {
    type Error = SignalProtocolError;

    fn try_from(value: &[u8]) -> Result<Self> {
        if value.is_empty() {
            return Err(SignalProtocolError::CiphertextTooShort(0));
        }
        check_version(value)?;
        let proto = PreKeySignalMessageProto::decode(&value[1..])
            .map_err(|_| SignalProtocolError::InvalidProtobufEncoding)?;
        let base_key = proto
            .base_key
            .as_deref()
            .and_then(deserialize_public)
            .ok_or(SignalProtocolError::InvalidMessage("bad base key"))?;
        let identity_key = proto
            .identity_key
            .as_deref()
            .and_then(deserialize_public)
            .ok_or(SignalProtocolError::InvalidMessage("bad identity key"))?;
        let message = proto
            .message
            .ok_or(SignalProtocolError::InvalidProtobufEncoding)?;
        Ok(Self {
            registration_id: proto.registration_id.unwrap_or(0),
            pre_key_id: proto.pre_key_id,
            signed_pre_key_id: proto
                .signed_pre_key_id
                .ok_or(SignalProtocolError::InvalidProtobufEncoding)?,
            base_key,
            identity_key,
            message: SignalMessage::try_from(message.as_slice())?,
            serialized: value.to_vec(),
        })
    }
}

#[derive(Clone, PartialEq, ::prost::Message)]
struct SenderKeyMessageProto {
    #[prost(uint32, optional, tag = "1")]
    id: Option<u32>,
    #[prost(uint32, optional, tag = "2")]
    iteration: Option<u32>,
    #[prost(bytes = "vec", optional, tag = "3")]
    ciphertext: Option<Vec<u8>>,
}

/// A group message: sender-key header plus AES-CBC payload, signed by
/// the sender's per-key signing key.
#[derive(Debug, Clone)]
pub struct SenderKeyMessage {
    key_id: u32,
    iteration: u32,
    ciphertext: Vec<u8>,
    serialized: Vec<u8>,
}

impl SenderKeyMessage {
    pub const SIGNATURE_LENGTH: usize = 64;

    pub fn new(key_id: u32, iteration: u32, ciphertext: Vec<u8>, signing_key: &KeyPair) -> Self {
        let proto = SenderKeyMessageProto {
            id: Some(key_id),
            iteration: Some(iteration),
            ciphertext: Some(ciphertext.clone()),
        };
        let mut serialized =
            Vec::with_capacity(1 + proto.encoded_len() + Self::SIGNATURE_LENGTH);
        serialized.push(VERSION_BYTE);
        proto
            .encode(&mut serialized)
            .expect("can always append to a Vec");
        let signature = signing_key.sign_message(&serialized);
        serialized.extend_from_slice(&signature);
        Self {
            key_id,
            iteration,
            ciphertext,
            serialized,
        }
    }

    pub fn key_id(&self) -> u32 {
        self.key_id
    }

    pub fn iteration(&self) -> u32 {
        self.iteration
    }

    pub fn body(&self) -> &[u8] {
        &self.ciphertext
    }

    pub fn serialized(&self) -> &[u8] {
        &self.serialized
    }

    pub fn verify_signature(&self, signing_key: &[u8; 32]) -> bool {
        let split = self.serialized.len() - Self::SIGNATURE_LENGTH;
        let signature: &[u8; 64] = self.serialized[split..]
            .try_into()
            .expect("signature length fixed by construction");
        xed25519::verify(signing_key, &self.serialized[..split], signature)
    }
}

impl TryFrom<&[u8]> for SenderKeyMessage {
    type Error = SignalProtocolError;

    fn try_from(value: &[u8]) -> Result<Self> {
        if value.len() < 1 + Self::SIGNATURE_LENGTH {
            return Err(SignalProtocolError::CiphertextTooShort(value.len()));
        }
        check_version(value)?;
        let proto =
            SenderKeyMessageProto::decode(&value[1..value.len() - Self::SIGNATURE_LENGTH])
                .map_err(|_| SignalProtocolError::InvalidProtobufEncoding)?;
        Ok(Self {
            key_id: proto
                .id
                .ok_or(SignalProtocolError::InvalidProtobufEncoding)?,
            iteration: proto
                .iteration
                .ok_or(SignalProtocolError::InvalidProtobufEncoding)?,
            ciphertext: proto
                .ciphertext
                .ok_or(SignalProtocolError::InvalidProtobufEncoding)?,
            serialized: value.to_vec(),
        })
    }
}

#[derive(Clone, PartialEq, ::prost::Message)]
struct SenderKeyDistributionMessageProto {
    #[prost(uint32, optional, tag = "1")]
    id: Option<u32>,
    #[prost(uint32, optional, tag = "2")]
    iteration: Option<u32>,
    #[prost(bytes = "vec", optional, tag = "3")]
    chain_key: Option<Vec<u8>>,
    #[prost(bytes = "vec", optional, tag = "4")]
    signing_key: Option<Vec<u8>>,
}

/// Bootstraps a recipient's copy of a sender's group ratchet. Sent over
/// pairwise sessions to each group member.
#[derive(Debug, Clone)]
pub struct SenderKeyDistributionMessage {
    key_id: u32,
    iteration: u32,
    chain_key: [u8; 32],
    signing_key: [u8; 32],
    serialized: Vec<u8>,
}

impl SenderKeyDistributionMessage {
    pub fn new(key_id: u32, iteration: u32, chain_key: [u8; 32], signing_key: [u8; 32]) -> Self {
        let proto = SenderKeyDistributionMessageProto {
            id: Some(key_id),
            iteration: Some(iteration),
            chain_key: Some(chain_key.to_vec()),
            signing_key: Some(serialize_public(&signing_key).to_vec()),
        };
        let mut serialized = Vec::with_capacity(1 + proto.encoded_len());
        serialized.push(VERSION_BYTE);
        proto
            .encode(&mut serialized)
            .expect("can always append to a Vec");
        Self {
            key_id,
            iteration,
            chain_key,
            signing_key,
            serialized,
        }
    }

    pub fn key_id(&self) -> u32 {
        self.key_id
    }

    pub fn iteration(&self) -> u32 {
        self.iteration
    }

    pub fn chain_key(&self) -> &[u8; 32] {
        &self.chain_key
    }

    pub fn signing_key(&self) -> &[u8; 32] {
        &self.signing_key
    }

    pub fn serialized(&self) -> &[u8] {
        &self.serialized
    }
}

impl TryFrom<&[u8]> for SenderKeyDistributionMessage {
    type Error = SignalProtocolError;

    fn try_from(value: &[u8]) -> Result<Self> {
        // At minimum a chain key and a signing key.
        if value.len() < 1 + 32 + 32 {
            return Err(SignalProtocolError::CiphertextTooShort(value.len()));
        }
        check_version(value)?;
        let proto = SenderKeyDistributionMessageProto::decode(&value[1..])
            .map_err(|_| SignalProtocolError::InvalidProtobufEncoding)?;
        let chain_key: [u8; 32] = proto
            .chain_key
            .as_deref()
            .and_then(|b| b.try_into().ok())
            .ok_or(SignalProtocolError::InvalidMessage("bad chain key"))?;
        let signing_key = proto
            .signing_key
            .as_deref()
            .and_then(deserialize_public)
            .ok_or(SignalProtocolError::InvalidMessage("bad signing key"))?;
        Ok(Self {
            key_id: proto
                .id
                .ok_or(SignalProtocolError::InvalidProtobufEncoding)?,
            iteration: proto
                .iteration
                .ok_or(SignalProtocolError::InvalidProtobufEncoding)?,
            chain_key,
            signing_key,
            serialized: value.to_vec(),
        })
    }
}

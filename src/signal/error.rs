use thiserror::Error;

use crate::signal::address::{SenderKeyName, SessionAddress};

pub type Result<T> = std::result::Result<T, SignalProtocolError>;

#[derive(Debug, Error)]
pub enum SignalProtocolError {
    /// A prekey or sender-key signature failed verification.
    #[error("invalid signature")]
    InvalidSignature,

    /// The sender's identity key differs from the pinned one.
    #[error("untrusted identity for address {0}")]
    UntrustedIdentity(SessionAddress),

    /// Counter already consumed and no stashed key for it.
    #[error("message with old counter {0} / {1}")]
    DuplicateMessage(u32, u32),

    /// Frame MAC mismatch or malformed frame content.
    #[error("invalid message: {0}")]
    InvalidMessage(&'static str),

    /// Version byte below the supported protocol version.
    #[error("unsupported legacy message version <{0}>")]
    LegacyMessage(u8),

    /// Version byte above the supported protocol version.
    #[error("unrecognized message version <{0}>")]
    InvalidVersion(u8),

    /// Referenced prekey / signed prekey / sender-key id is unknown
    /// or already consumed.
    #[error("invalid key id <{0}>")]
    InvalidKeyId(u32),

    #[error("no valid session with {0}")]
    NoValidSessions(SessionAddress),

    #[error("no sender key state for {0}")]
    NoSenderKeyState(SenderKeyName),

    /// The counter jump exceeds what the skipped-key stash may hold.
    #[error("too many skipped message keys ({0})")]
    TooManySkipped(u32),

    #[error("ciphertext serialized bytes were too short <{0}>")]
    CiphertextTooShort(usize),

    #[error("protobuf encoding was invalid")]
    InvalidProtobufEncoding,
}

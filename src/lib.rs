//! Unofficial client library for a mobile messenger's multi-device web
//! protocol: the end-to-end cryptographic session layer.
//!
//! The crate covers the full lifetime of a companion device's key
//! material: pairing with the primary device ([`pairing`]), the
//! persistent key store ([`keys`]), pairwise X3DH + Double Ratchet
//! sessions and group sender keys ([`signal`]), app-state
//! synchronization over an LTHash ([`appstate`]), the transport AEAD
//! ([`transport`]) and the inbound/outbound routing glue
//! ([`dispatch`]).
//!
//! The websocket transport, binary-node framing, media handling and
//! the chat domain model live outside this crate; payloads cross the
//! boundary as opaque byte blobs.

pub mod appstate;
pub mod config;
pub mod crypto;
pub mod dispatch;
pub mod error;
pub mod keys;
pub mod pairing;
pub mod signal;
pub mod transport;

pub use config::Config;
pub use dispatch::{BundleFetcher, Dispatcher};
pub use error::ClientError;
pub use keys::prefs::Preferences;
pub use keys::Keys;
pub use pairing::{PairingFsm, PairingState};
pub use signal::{
    MessageKind, PreKeyBundle, SenderKeyName, SessionAddress, SessionCipher, SignalProtocolError,
};

use thiserror::Error;

use crate::appstate::AppStateError;
use crate::keys::KeysError;
use crate::pairing::PairingError;
use crate::signal::SignalProtocolError;
use crate::transport::TransportError;

/// Aggregate error surfaced by the dispatcher-level API.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error(transparent)]
    Signal(#[from] SignalProtocolError),
    #[error(transparent)]
    Keys(#[from] KeysError),
    #[error(transparent)]
    AppState(#[from] AppStateError),
    #[error(transparent)]
    Pairing(#[from] PairingError),
    #[error(transparent)]
    Transport(#[from] TransportError),
}

pub mod address;
pub mod bundle;
pub mod cipher;
pub mod consts;
pub mod error;
pub mod groups;
pub mod message;
pub mod ratchet;
pub mod session;

pub use address::{SenderKeyName, SessionAddress};
pub use bundle::PreKeyBundle;
pub use cipher::SessionCipher;
pub use error::{Result, SignalProtocolError};
pub use message::{
    MessageKind, PreKeySignalMessage, SenderKeyDistributionMessage, SenderKeyMessage,
    SignalMessage,
};

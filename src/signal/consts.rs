/// Message-key seeds retained per chain for out-of-order delivery.
pub const MAX_MESSAGE_KEYS: usize = 2000;
/// Skipped seeds retained across all receiving chains of one session.
pub const MAX_TOTAL_MESSAGE_KEYS: usize = 2000;
pub const MAX_RECEIVER_CHAINS: usize = 5;
pub const MAX_SENDER_KEY_STATES: usize = 5;

/// Protocol version carried in the high nibble of the leading frame byte.
pub const CIPHERTEXT_VERSION: u8 = 3;
/// The full leading byte: version 3 in both nibbles.
pub const VERSION_BYTE: u8 = (CIPHERTEXT_VERSION << 4) | CIPHERTEXT_VERSION;

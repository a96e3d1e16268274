pub mod cbc;
pub mod gcm;
pub mod hkdf;
pub mod key_pair;
pub mod xed25519;

use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256, Sha512};

pub fn sha256(data: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hasher.finalize().into()
}

pub fn hmac_sha256(key: &[u8], data_parts: &[&[u8]]) -> [u8; 32] {
    let mut mac = Hmac::<Sha256>::new_from_slice(key).expect("HMAC-SHA256 can accept any key size");
    for part in data_parts {
        mac.update(part);
    }
    mac.finalize().into_bytes().into()
}

pub fn hmac_sha512(key: &[u8], data_parts: &[&[u8]]) -> [u8; 64] {
    let mut mac = Hmac::<Sha512>::new_from_slice(key).expect("HMAC-SHA512 can accept any key size");
    for part in data_parts {
        mac.update(part);
    }
    mac.finalize().into_bytes().into()
}

pub fn rand_bytes<const N: usize>() -> [u8; N] {
    use rand::TryRngCore;
    let mut out = [0u8; N];
    rand::rngs::OsRng
        .try_fill_bytes(&mut out)
        .expect("RNG failure");
    out
}

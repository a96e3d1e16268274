//! XEdDSA signatures over X25519 (Montgomery) keys.
//!
//! The signer derives the Edwards public key from the Montgomery private
//! scalar and carries the sign bit in the most significant bit of `s`,
//! matching libsignal-protocol-java rather than the letter of the XEdDSA
//! paper (which fixes the sign bit to 0).

use curve25519_dalek::constants::ED25519_BASEPOINT_TABLE;
use curve25519_dalek::edwards::EdwardsPoint;
use curve25519_dalek::montgomery::MontgomeryPoint;
use curve25519_dalek::scalar::{self, Scalar};
use rand::TryRngCore;
use rand::rngs::OsRng;
use sha2::{Digest, Sha512};
use subtle::ConstantTimeEq;

pub const SIGNATURE_LENGTH: usize = 64;

/// 0xFE followed by 31 bytes of 0xFF, per the XEdDSA nonce derivation.
static HASH_PREFIX: [u8; 32] = [
    0xFE, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF,
    0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF,
];

pub fn sign(private_key: &[u8; 32], message: &[u8]) -> [u8; SIGNATURE_LENGTH] {
    let key_data = scalar::clamp_integer(*private_key);
    let a = Scalar::from_bytes_mod_order(key_data);
    let ed_public = (&a * ED25519_BASEPOINT_TABLE).compress();
    let sign_bit = ed_public.as_bytes()[31] & 0b1000_0000_u8;

    let mut random_bytes = [0u8; 64];
    OsRng
        .try_fill_bytes(&mut random_bytes)
        .expect("RNG failure");

    // r = SHA512(prefix || priv || message || Z)
    let mut hash1 = Sha512::new();
    hash1.update(HASH_PREFIX);
    hash1.update(key_data);
    hash1.update(message);
    hash1.update(random_bytes);
    let r = Scalar::from_hash(hash1);
    let cap_r = (&r * ED25519_BASEPOINT_TABLE).compress();

    // h = SHA512(R || edPub || message)
    let mut hash = Sha512::new();
    hash.update(cap_r.as_bytes());
    hash.update(ed_public.as_bytes());
    hash.update(message);
    let h = Scalar::from_hash(hash);

    let s = (h * a) + r;

    let mut result = [0u8; SIGNATURE_LENGTH];
    result[..32].copy_from_slice(cap_r.as_bytes());
    result[32..].copy_from_slice(s.as_bytes());
    result[SIGNATURE_LENGTH - 1] &= 0b0111_1111_u8;
    result[SIGNATURE_LENGTH - 1] |= sign_bit;
    result
}

pub fn verify(public_key: &[u8; 32], message: &[u8], signature: &[u8; SIGNATURE_LENGTH]) -> bool {
    let mont_point = MontgomeryPoint(*public_key);
    let ed_pub_key_point =
        match mont_point.to_edwards((signature[SIGNATURE_LENGTH - 1] & 0b1000_0000_u8) >> 7) {
            Some(x) => x,
            None => return false,
        };
    let cap_a = ed_pub_key_point.compress();
    let mut cap_r = [0u8; 32];
    cap_r.copy_from_slice(&signature[..32]);
    let mut s = [0u8; 32];
    s.copy_from_slice(&signature[32..]);
    s[31] &= 0b0111_1111_u8;
    if (s[31] & 0b1110_0000_u8) != 0 {
        return false;
    }
    let minus_cap_a = -ed_pub_key_point;

    let mut hash = Sha512::new();
    hash.update(&cap_r[..]);
    hash.update(cap_a.as_bytes());
    hash.update(message);
    let h = Scalar::from_hash(hash);

    let cap_r_check_point = EdwardsPoint::vartime_double_scalar_mul_basepoint(
        &h,
        &minus_cap_a,
        &Scalar::from_bytes_mod_order(s),
    );
    let cap_r_check = cap_r_check_point.compress();

    bool::from(cap_r_check.as_bytes().ct_eq(&cap_r))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::key_pair::KeyPair;

    #[test]
    fn sign_and_verify() {
        let pair = KeyPair::new();
        let message = b"companion advertisement";
        let signature = sign(&pair.private_key, message);
        assert!(verify(&pair.public_key, message, &signature));
    }

    #[test]
    fn verify_rejects_wrong_message() {
        let pair = KeyPair::new();
        let signature = sign(&pair.private_key, b"original");
        assert!(!verify(&pair.public_key, b"forged", &signature));
    }

    #[test]
    fn verify_rejects_wrong_key() {
        let pair = KeyPair::new();
        let other = KeyPair::new();
        let signature = sign(&pair.private_key, b"message");
        assert!(!verify(&other.public_key, b"message", &signature));
    }

    #[test]
    fn verify_rejects_flipped_signature_bits() {
        let pair = KeyPair::new();
        let mut signature = sign(&pair.private_key, b"message");
        signature[0] ^= 0x01;
        assert!(!verify(&pair.public_key, b"message", &signature));
    }
}

//! The homomorphic set hash attesting app-state contents.
//!
//! Each element is expanded through HKDF into a 128-byte point; the
//! group operation is componentwise addition of little-endian u16
//! limbs modulo 2^16, so removal is exact subtraction and the final
//! digest is independent of operation order.

use hkdf::Hkdf;
use sha2::Sha256;

#[derive(Clone, Debug)]
pub struct LtHash {
    pub hkdf_info: &'static [u8],
    pub hkdf_size: usize,
}

pub const WAPATCH_INTEGRITY: LtHash = LtHash {
    hkdf_info: b"WhatsApp Patch Integrity",
    hkdf_size: 128,
};

impl LtHash {
    pub fn subtract_then_add(&self, base: &[u8], subtract: &[&[u8]], add: &[&[u8]]) -> Vec<u8> {
        let mut output = base.to_vec();
        self.subtract_then_add_in_place(&mut output, subtract, add);
        output
    }

    pub fn subtract_then_add_in_place(&self, base: &mut [u8], subtract: &[&[u8]], add: &[&[u8]]) {
        self.multiple_op(base, subtract, true);
        self.multiple_op(base, add, false);
    }

    fn multiple_op(&self, base: &mut [u8], input: &[&[u8]], subtract: bool) {
        for item in input {
            let derived = self.expand(item);
            pointwise_with_overflow(base, &derived, subtract);
        }
    }

    fn expand(&self, item: &[u8]) -> Vec<u8> {
        let hk = Hkdf::<Sha256>::new(None, item);
        let mut okm = vec![0u8; self.hkdf_size];
        hk.expand(self.hkdf_info, &mut okm).expect("hkdf expand");
        okm
    }
}

fn pointwise_with_overflow(base: &mut [u8], input: &[u8], subtract: bool) {
    assert_eq!(base.len(), input.len(), "length mismatch");
    assert_eq!(base.len() % 2, 0, "slice lengths must be even");

    for (base_pair, input_pair) in base.chunks_exact_mut(2).zip(input.chunks_exact(2)) {
        let x = u16::from_le_bytes([base_pair[0], base_pair[1]]);
        let y = u16::from_le_bytes([input_pair[0], input_pair[1]]);
        let result = if subtract {
            x.wrapping_sub(y)
        } else {
            x.wrapping_add(y)
        };
        base_pair.copy_from_slice(&result.to_le_bytes());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn add_then_subtract_restores_base() {
        let mut base = vec![0u8; 128];
        let item = b"value mac".to_vec();
        WAPATCH_INTEGRITY.subtract_then_add_in_place(&mut base, &[], &[&item]);
        assert_ne!(base, vec![0u8; 128]);
        WAPATCH_INTEGRITY.subtract_then_add_in_place(&mut base, &[&item], &[]);
        assert_eq!(base, vec![0u8; 128]);
    }

    #[test]
    fn limb_overflow_wraps() {
        let mut base = vec![255u8, 255, 0, 0];
        let input = vec![1u8, 0, 1, 0];
        pointwise_with_overflow(&mut base, &input, false);
        assert_eq!(base, vec![0, 0, 1, 0]);
        pointwise_with_overflow(&mut base, &input, true);
        assert_eq!(base, vec![255, 255, 0, 0]);
    }

    #[test]
    fn final_hash_is_order_independent() {
        let items: Vec<Vec<u8>> = (0u8..6).map(|i| vec![i; 32]).collect();
        let refs: Vec<&[u8]> = items.iter().map(|v| v.as_slice()).collect();

        let forward = WAPATCH_INTEGRITY.subtract_then_add(&[0u8; 128], &[], &refs);

        let mut reversed_refs = refs.clone();
        reversed_refs.reverse();
        let mut one_by_one = vec![0u8; 128];
        for item in &reversed_refs {
            WAPATCH_INTEGRITY.subtract_then_add_in_place(&mut one_by_one, &[], &[item]);
        }
        assert_eq!(forward, one_by_one);
    }

    #[test]
    fn interleaved_set_remove_matches_direct_set() {
        // SET a, SET b, REMOVE a, SET c == SET b, SET c
        let a = vec![1u8; 32];
        let b = vec![2u8; 32];
        let c = vec![3u8; 32];

        let mut interleaved = vec![0u8; 128];
        WAPATCH_INTEGRITY.subtract_then_add_in_place(&mut interleaved, &[], &[&a]);
        WAPATCH_INTEGRITY.subtract_then_add_in_place(&mut interleaved, &[], &[&b]);
        WAPATCH_INTEGRITY.subtract_then_add_in_place(&mut interleaved, &[&a], &[]);
        WAPATCH_INTEGRITY.subtract_then_add_in_place(&mut interleaved, &[], &[&c]);

        let direct = WAPATCH_INTEGRITY.subtract_then_add(&[0u8; 128], &[], &[&b, &c]);
        assert_eq!(interleaved, direct);
    }
}

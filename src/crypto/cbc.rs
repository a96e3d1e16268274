use aes::Aes256;
use cbc::{Decryptor, Encryptor};
use cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit, block_padding::Pkcs7};
use thiserror::Error;

type Aes256CbcEnc = Encryptor<Aes256>;
type Aes256CbcDec = Decryptor<Aes256>;

#[derive(Debug, Error)]
pub enum CbcError {
    #[error("Invalid key or IV length for CBC mode: {0}")]
    InvalidLength(#[from] cipher::InvalidLength),
    #[error("Ciphertext length must be a non-zero multiple of 16")]
    InvalidCiphertextLength,
    #[error("Invalid padding")]
    InvalidPadding,
}

type Result<T> = std::result::Result<T, CbcError>;

pub fn encrypt(key: &[u8], iv: &[u8], plaintext: &[u8]) -> Result<Vec<u8>> {
    let enc = Aes256CbcEnc::new_from_slices(key, iv)?;
    Ok(enc.encrypt_padded_vec_mut::<Pkcs7>(plaintext))
}

pub fn decrypt(key: &[u8], iv: &[u8], ciphertext: &[u8]) -> Result<Vec<u8>> {
    if ciphertext.is_empty() || ciphertext.len() % 16 != 0 {
        return Err(CbcError::InvalidCiphertextLength);
    }
    let dec = Aes256CbcDec::new_from_slices(key, iv)?;
    dec.decrypt_padded_vec_mut::<Pkcs7>(ciphertext)
        .map_err(|_| CbcError::InvalidPadding)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrip() {
        let key = [1u8; 32];
        let iv = [2u8; 16];
        let pt = b"attack at dawn";
        let ct = encrypt(&key, &iv, pt).unwrap();
        assert_ne!(&ct[..pt.len()], pt.as_slice());
        assert_eq!(decrypt(&key, &iv, &ct).unwrap(), pt);
    }

    #[test]
    fn tampered_ciphertext_fails_unpad_or_differs() {
        let key = [1u8; 32];
        let iv = [2u8; 16];
        let mut ct = encrypt(&key, &iv, b"attack at dawn").unwrap();
        let last = ct.len() - 1;
        ct[last] ^= 0xFF;
        match decrypt(&key, &iv, &ct) {
            Err(CbcError::InvalidPadding) => {}
            Ok(pt) => assert_ne!(pt, b"attack at dawn"),
            Err(e) => panic!("unexpected error: {e}"),
        }
    }

    #[test]
    fn rejects_partial_block() {
        let key = [1u8; 32];
        let iv = [2u8; 16];
        assert!(matches!(
            decrypt(&key, &iv, &[0u8; 15]),
            Err(CbcError::InvalidCiphertextLength)
        ));
    }
}

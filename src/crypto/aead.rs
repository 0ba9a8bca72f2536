//! AEAD encryption for tunnel frames
//!
//! Implements ChaCha20-Poly1305 with a 64-bit counter nonce.

use chacha20poly1305::{
    aead::{Aead, KeyInit, Payload},
    ChaCha20Poly1305, Key, Nonce,
};

use crate::error::CryptoError;

/// Authentication tag length
pub const TAG_LEN: usize = 16;

/// ChaCha20-Poly1305 key length
pub const KEY_LEN: usize = 32;

/// ChaCha20-Poly1305 nonce length
pub const NONCE_LEN: usize = 12;

/// Build nonce: 4 zero bytes + 8 bytes counter (little-endian)
fn counter_nonce(counter: u64) -> [u8; NONCE_LEN] {
    let mut nonce_bytes = [0u8; NONCE_LEN];
    nonce_bytes[4..12].copy_from_slice(&counter.to_le_bytes());
    nonce_bytes
}

/// Encrypt plaintext using ChaCha20-Poly1305
pub fn encrypt(
    key: &[u8; KEY_LEN],
    counter: u64,
    plaintext: &[u8],
    aad: &[u8],
) -> Result<Vec<u8>, CryptoError> {
    let cipher = ChaCha20Poly1305::new(Key::from_slice(key));
    let nonce_bytes = counter_nonce(counter);

    cipher
        .encrypt(
            Nonce::from_slice(&nonce_bytes),
            Payload {
                msg: plaintext,
                aad,
            },
        )
        .map_err(|_| CryptoError::Encryption)
}

/// Decrypt ciphertext using ChaCha20-Poly1305
///
/// Fails with `CryptoError::Decryption` if the tag does not verify.
pub fn decrypt(
    key: &[u8; KEY_LEN],
    counter: u64,
    ciphertext: &[u8],
    aad: &[u8],
) -> Result<Vec<u8>, CryptoError> {
    if ciphertext.len() < TAG_LEN {
        return Err(CryptoError::Decryption);
    }

    let cipher = ChaCha20Poly1305::new(Key::from_slice(key));
    let nonce_bytes = counter_nonce(counter);

    cipher
        .decrypt(
            Nonce::from_slice(&nonce_bytes),
            Payload {
                msg: ciphertext,
                aad,
            },
        )
        .map_err(|_| CryptoError::Decryption)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encrypt_decrypt_roundtrip() {
        let key = [0u8; 32];
        let plaintext = b"ip packet bytes";
        let aad = b"frame header";

        let ciphertext = encrypt(&key, 42, plaintext, aad).unwrap();
        assert_eq!(ciphertext.len(), plaintext.len() + TAG_LEN);

        let decrypted = decrypt(&key, 42, &ciphertext, aad).unwrap();
        assert_eq!(decrypted, plaintext);
    }

    #[test]
    fn test_decrypt_wrong_key() {
        let ciphertext = encrypt(&[0u8; 32], 42, b"payload", &[]).unwrap();
        assert!(decrypt(&[1u8; 32], 42, &ciphertext, &[]).is_err());
    }

    #[test]
    fn test_decrypt_wrong_counter() {
        let key = [0u8; 32];
        let ciphertext = encrypt(&key, 42, b"payload", &[]).unwrap();
        assert!(decrypt(&key, 43, &ciphertext, &[]).is_err());
    }

    #[test]
    fn test_tampered_ciphertext() {
        let key = [7u8; 32];
        let mut ciphertext = encrypt(&key, 0, b"payload", &[]).unwrap();
        ciphertext[0] ^= 0x01;
        assert!(matches!(
            decrypt(&key, 0, &ciphertext, &[]),
            Err(CryptoError::Decryption)
        ));
    }

    #[test]
    fn test_short_ciphertext() {
        assert!(decrypt(&[0u8; 32], 0, &[0u8; TAG_LEN - 1], &[]).is_err());
    }
}

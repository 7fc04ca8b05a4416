//! Passphrase-encrypted backup of an ephemeral scalar.
//!
//! Lenders may opt to keep an encrypted copy of their ephemeral key so a
//! forgotten passphrase variant can be recovered through support. The wrap is
//! AES-256-GCM under a PBKDF2 stretched key; the platform stores the blob as
//! opaque bytes and can never open it.
//!
//! Blob layout: `version ‖ salt(16) ‖ nonce(12) ‖ ciphertext+tag`.

use aes_gcm::{Aes256Gcm, Key, Nonce};
use aes_gcm::aead::{Aead, KeyInit};
use rand::RngCore;
use zeroize::{Zeroize, Zeroizing};

const VERSION: u8 = 1;
const SALT_LEN: usize = 16;
const NONCE_LEN: usize = 12;

/// Encrypts a 32-byte scalar under the passphrase.
pub fn wrap(passphrase: &[u8], scalar: &[u8; 32], iterations: u32) -> Vec<u8> {
    let mut salt = [0u8; SALT_LEN];
    let mut nonce = [0u8; NONCE_LEN];
    rand::thread_rng().fill_bytes(&mut salt);
    rand::thread_rng().fill_bytes(&mut nonce);

    let mut wrapping_key = derive_wrapping_key(passphrase, &salt, iterations);
    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&*wrapping_key));
    let ciphertext = cipher
        .encrypt(Nonce::from_slice(&nonce), &scalar[..])
        .expect("in-memory encryption does not fail");
    wrapping_key.zeroize();

    let mut blob = Vec::with_capacity(1 + SALT_LEN + NONCE_LEN + ciphertext.len());
    blob.push(VERSION);
    blob.extend_from_slice(&salt);
    blob.extend_from_slice(&nonce);
    blob.extend_from_slice(&ciphertext);
    blob
}

/// Decrypts a blob produced by [`wrap`]. Fails on any tampering, wrong
/// passphrase included.
pub fn unwrap(passphrase: &[u8], blob: &[u8], iterations: u32) -> Result<Zeroizing<[u8; 32]>, UnwrapError> {
    if blob.len() < 1 + SALT_LEN + NONCE_LEN + 16 {
        return Err(UnwrapError::Truncated);
    }
    if blob[0] != VERSION {
        return Err(UnwrapError::UnsupportedVersion(blob[0]));
    }
    let salt = &blob[1..1 + SALT_LEN];
    let nonce = &blob[1 + SALT_LEN..1 + SALT_LEN + NONCE_LEN];
    let ciphertext = &blob[1 + SALT_LEN + NONCE_LEN..];

    let mut wrapping_key = derive_wrapping_key(passphrase, salt, iterations);
    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&*wrapping_key));
    let result = cipher.decrypt(Nonce::from_slice(nonce), ciphertext);
    wrapping_key.zeroize();

    let mut plaintext = result.map_err(|_| UnwrapError::BadPassphraseOrTampered)?;
    if plaintext.len() != 32 {
        plaintext.zeroize();
        return Err(UnwrapError::Truncated);
    }
    let mut scalar = Zeroizing::new([0u8; 32]);
    scalar.copy_from_slice(&plaintext);
    plaintext.zeroize();
    Ok(scalar)
}

fn derive_wrapping_key(passphrase: &[u8], salt: &[u8], iterations: u32) -> Zeroizing<[u8; 32]> {
    let mut key = Zeroizing::new([0u8; 32]);
    pbkdf2::pbkdf2_hmac::<sha2::Sha256>(passphrase, salt, iterations, &mut *key);
    key
}

#[derive(Debug, Eq, PartialEq)]
pub enum UnwrapError {
    Truncated,
    UnsupportedVersion(u8),
    BadPassphraseOrTampered,
}

#[cfg(test)]
mod tests {
    use super::*;

    // Keep tests fast, the work factor is covered in `keys`.
    const TEST_ITERATIONS: u32 = 16;

    #[test]
    fn wrap_unwrap_roundtrip() {
        let scalar = [0xab; 32];
        let blob = wrap(b"correct horse", &scalar, TEST_ITERATIONS);
        let recovered = unwrap(b"correct horse", &blob, TEST_ITERATIONS).unwrap();
        assert_eq!(*recovered, scalar);
    }

    #[test]
    fn wrong_passphrase_fails() {
        let blob = wrap(b"correct horse", &[0xab; 32], TEST_ITERATIONS);
        assert_eq!(
            unwrap(b"battery staple", &blob, TEST_ITERATIONS).unwrap_err(),
            UnwrapError::BadPassphraseOrTampered,
        );
    }

    #[test]
    fn tampered_blob_fails() {
        let mut blob = wrap(b"correct horse", &[0xab; 32], TEST_ITERATIONS);
        let last = blob.len() - 1;
        blob[last] ^= 0x01;
        assert_eq!(
            unwrap(b"correct horse", &blob, TEST_ITERATIONS).unwrap_err(),
            UnwrapError::BadPassphraseOrTampered,
        );
    }

    #[test]
    fn version_checked() {
        let mut blob = wrap(b"correct horse", &[0xab; 32], TEST_ITERATIONS);
        blob[0] = 9;
        assert_eq!(
            unwrap(b"correct horse", &blob, TEST_ITERATIONS).unwrap_err(),
            UnwrapError::UnsupportedVersion(9),
        );
    }
}

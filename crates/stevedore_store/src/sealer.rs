//! Credential sealing.
//!
//! Profiles carry provider credentials; those are sealed before they
//! touch the database and unsealed only on the
//! `get_profile_secrets` path. The sealer is a seam: the store does not
//! care how sealing works, only that it round-trips.

use aes_gcm::aead::{Aead, KeyInit, OsRng};
use aes_gcm::aead::rand_core::RngCore;
use aes_gcm::{Aes256Gcm, Key, Nonce};

use crate::StoreError;

/// Size of the AES-GCM nonce prepended to each sealed blob.
const NONCE_SIZE: usize = 12;

pub trait Sealer: Send + Sync {
    fn seal(&self, plaintext: &[u8]) -> Result<Vec<u8>, StoreError>;
    fn unseal(&self, sealed: &[u8]) -> Result<Vec<u8>, StoreError>;
}

/// AES-256-GCM sealer with a caller-provided 32-byte key.
///
/// Sealed format: `nonce || ciphertext`. A fresh random nonce per seal.
pub struct AesGcmSealer {
    cipher: Aes256Gcm,
}

impl AesGcmSealer {
    pub fn new(key: &[u8; 32]) -> Self {
        let key = Key::<Aes256Gcm>::from_slice(key);
        Self {
            cipher: Aes256Gcm::new(key),
        }
    }
}

impl Sealer for AesGcmSealer {
    fn seal(&self, plaintext: &[u8]) -> Result<Vec<u8>, StoreError> {
        let mut nonce_bytes = [0u8; NONCE_SIZE];
        OsRng.fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);
        let ciphertext = self
            .cipher
            .encrypt(nonce, plaintext)
            .map_err(|e| StoreError::Seal(format!("encrypt failed: {e}")))?;
        let mut out = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
        out.extend_from_slice(&nonce_bytes);
        out.extend_from_slice(&ciphertext);
        Ok(out)
    }

    fn unseal(&self, sealed: &[u8]) -> Result<Vec<u8>, StoreError> {
        if sealed.len() < NONCE_SIZE {
            return Err(StoreError::Seal("sealed blob too short".to_string()));
        }
        let (nonce_bytes, ciphertext) = sealed.split_at(NONCE_SIZE);
        let nonce = Nonce::from_slice(nonce_bytes);
        self.cipher
            .decrypt(nonce, ciphertext)
            .map_err(|e| StoreError::Seal(format!("decrypt failed: {e}")))
    }
}

/// Pass-through sealer for deployments without an encryption key and
/// for tests. The launcher warns loudly when this is in effect.
#[derive(Default)]
pub struct PlainSealer;

impl Sealer for PlainSealer {
    fn seal(&self, plaintext: &[u8]) -> Result<Vec<u8>, StoreError> {
        Ok(plaintext.to_vec())
    }

    fn unseal(&self, sealed: &[u8]) -> Result<Vec<u8>, StoreError> {
        Ok(sealed.to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn aes_round_trip() {
        let sealer = AesGcmSealer::new(&[7u8; 32]);
        let sealed = sealer.seal(b"accessKey=minioadmin").unwrap();
        assert_ne!(sealed.as_slice(), b"accessKey=minioadmin".as_slice());
        let opened = sealer.unseal(&sealed).unwrap();
        assert_eq!(opened, b"accessKey=minioadmin");
    }

    #[test]
    fn seals_are_nondeterministic() {
        let sealer = AesGcmSealer::new(&[7u8; 32]);
        let a = sealer.seal(b"same input").unwrap();
        let b = sealer.seal(b"same input").unwrap();
        assert_ne!(a, b, "fresh nonce per seal");
    }

    #[test]
    fn tampered_blob_is_rejected() {
        let sealer = AesGcmSealer::new(&[7u8; 32]);
        let mut sealed = sealer.seal(b"payload").unwrap();
        let last = sealed.len() - 1;
        sealed[last] ^= 0x01;
        assert!(sealer.unseal(&sealed).is_err());
    }

    #[test]
    fn wrong_key_fails() {
        let sealed = AesGcmSealer::new(&[1u8; 32]).seal(b"payload").unwrap();
        assert!(AesGcmSealer::new(&[2u8; 32]).unseal(&sealed).is_err());
    }
}

//! Record payload encryption.
//!
//! When a database is opened with an encryption key, every record's meta
//! and body payloads are sealed with AES-256-GCM before they reach the
//! storage backend. Keys, flags, and sequences stay in the clear so the
//! backend can keep its ordering and sequencing guarantees without the
//! key.
//!
//! Sealed form: a random 96-bit nonce followed by ciphertext + GCM tag.
//! Empty plaintext is stored as empty ciphertext, so tombstones and
//! empty-body marker records look the same encrypted or not.

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use rand::rngs::OsRng;
use rand::RngCore;

use crate::config::{EncryptionAlgorithm, EncryptionKey};
use crate::error::{Error, Result};

/// AES-GCM nonce size in bytes (96 bits).
const NONCE_SIZE: usize = 12;

/// Seals and opens record payloads under one AES-256 key.
pub(crate) struct RecordCryptor {
    cipher: Aes256Gcm,
}

impl RecordCryptor {
    /// Builds a cryptor from an encryption configuration, or `None` when
    /// the configuration disables encryption.
    pub(crate) fn from_key(key: &EncryptionKey) -> Result<Option<RecordCryptor>> {
        match key.algorithm {
            EncryptionAlgorithm::None => Ok(None),
            EncryptionAlgorithm::Aes256 => {
                let cipher = Aes256Gcm::new_from_slice(&key.bytes)
                    .map_err(|e| Error::Crypto { reason: format!("bad key material: {e}") })?;
                Ok(Some(RecordCryptor { cipher }))
            }
        }
    }

    /// Encrypts a payload. Empty stays empty.
    pub(crate) fn seal(&self, plaintext: &[u8]) -> Result<Vec<u8>> {
        if plaintext.is_empty() {
            return Ok(Vec::new());
        }
        let mut nonce = [0u8; NONCE_SIZE];
        OsRng.fill_bytes(&mut nonce);

        let ciphertext = self
            .cipher
            .encrypt(Nonce::from_slice(&nonce), plaintext)
            .map_err(|_| Error::Crypto { reason: "encryption failed".to_string() })?;

        let mut sealed = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
        sealed.extend_from_slice(&nonce);
        sealed.extend_from_slice(&ciphertext);
        Ok(sealed)
    }

    /// Decrypts a payload sealed by [`seal`](Self::seal). Empty stays empty.
    pub(crate) fn open(&self, sealed: &[u8]) -> Result<Vec<u8>> {
        if sealed.is_empty() {
            return Ok(Vec::new());
        }
        if sealed.len() < NONCE_SIZE {
            return Err(Error::Crypto { reason: "sealed payload too short".to_string() });
        }
        let (nonce, ciphertext) = sealed.split_at(NONCE_SIZE);
        self.cipher
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|_| Error::Crypto { reason: "decryption failed (wrong key?)".to_string() })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_key() -> EncryptionKey {
        let mut bytes = [0u8; 32];
        for (i, b) in bytes.iter_mut().enumerate() {
            *b = i as u8;
        }
        EncryptionKey::aes256(bytes)
    }

    #[test]
    fn test_seal_open_roundtrip() {
        let cryptor = RecordCryptor::from_key(&test_key()).unwrap().unwrap();
        let plaintext = b"a document body with some content";

        let sealed = cryptor.seal(plaintext).unwrap();
        assert_ne!(sealed, plaintext);
        assert_eq!(cryptor.open(&sealed).unwrap(), plaintext);
    }

    #[test]
    fn test_empty_maps_to_empty() {
        let cryptor = RecordCryptor::from_key(&test_key()).unwrap().unwrap();
        assert!(cryptor.seal(b"").unwrap().is_empty());
        assert!(cryptor.open(b"").unwrap().is_empty());
    }

    #[test]
    fn test_wrong_key_fails() {
        let cryptor = RecordCryptor::from_key(&test_key()).unwrap().unwrap();
        let sealed = cryptor.seal(b"secret").unwrap();

        let other = RecordCryptor::from_key(&EncryptionKey::aes256([0xAA; 32]))
            .unwrap()
            .unwrap();
        assert!(matches!(other.open(&sealed), Err(Error::Crypto { .. })));
    }

    #[test]
    fn test_tampered_payload_fails() {
        let cryptor = RecordCryptor::from_key(&test_key()).unwrap().unwrap();
        let mut sealed = cryptor.seal(b"secret").unwrap();
        let last = sealed.len() - 1;
        sealed[last] ^= 0xFF;
        assert!(matches!(cryptor.open(&sealed), Err(Error::Crypto { .. })));
    }

    #[test]
    fn test_none_algorithm_yields_no_cryptor() {
        assert!(RecordCryptor::from_key(&EncryptionKey::NONE).unwrap().is_none());
    }
}

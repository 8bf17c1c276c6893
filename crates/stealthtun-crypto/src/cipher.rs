//! Packet Cipher (AES-256-GCM)
//!
//! The tunnel key is derived as SHA-256 of the configured passphrase.
//! Sealed packets are laid out as `nonce(12) || ciphertext || tag(16)`,
//! so every packet grows by exactly [`crate::OVERHEAD`] bytes.

use aes_gcm::{
    aead::{Aead, KeyInit},
    Aes256Gcm, Nonce,
};
use rand::RngCore;
use sha2::{Digest, Sha256};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::error::{CryptoError, CryptoResult};
use crate::{KEY_SIZE, NONCE_SIZE, OVERHEAD, TAG_SIZE};

/// A 256-bit key derived from the tunnel passphrase
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
struct PacketKey {
    bytes: [u8; KEY_SIZE],
}

impl PacketKey {
    fn from_passphrase(passphrase: &str) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(passphrase.as_bytes());
        let digest = hasher.finalize();

        let mut bytes = [0u8; KEY_SIZE];
        bytes.copy_from_slice(&digest);
        Self { bytes }
    }
}

/// Authenticated packet cipher
pub struct Cipher {
    aead: Aes256Gcm,
}

impl Cipher {
    /// Create a cipher from a passphrase.
    ///
    /// The passphrase is hashed with SHA-256 to produce the AES-256 key.
    /// An empty passphrase is rejected; "no encryption" is expressed by
    /// not constructing a cipher at all.
    pub fn new(passphrase: &str) -> CryptoResult<Self> {
        if passphrase.is_empty() {
            return Err(CryptoError::EmptyPassphrase);
        }

        let key = PacketKey::from_passphrase(passphrase);
        let aead = Aes256Gcm::new_from_slice(&key.bytes)
            .map_err(|e| CryptoError::EncryptFailed(e.to_string()))?;

        Ok(Self { aead })
    }

    /// Encrypt a packet, prepending a fresh random nonce.
    pub fn encrypt(&self, plaintext: &[u8]) -> CryptoResult<Vec<u8>> {
        let mut nonce_bytes = [0u8; NONCE_SIZE];
        rand::rngs::OsRng.fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);

        let ciphertext = self
            .aead
            .encrypt(nonce, plaintext)
            .map_err(|_| CryptoError::EncryptFailed("AES-GCM seal failed".into()))?;

        let mut out = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
        out.extend_from_slice(&nonce_bytes);
        out.extend_from_slice(&ciphertext);
        Ok(out)
    }

    /// Decrypt a packet produced by [`encrypt`](Self::encrypt).
    pub fn decrypt(&self, data: &[u8]) -> CryptoResult<Vec<u8>> {
        if data.len() < NONCE_SIZE + TAG_SIZE {
            return Err(CryptoError::CiphertextTooShort(data.len()));
        }

        let (nonce_bytes, ciphertext) = data.split_at(NONCE_SIZE);
        let nonce = Nonce::from_slice(nonce_bytes);

        self.aead
            .decrypt(nonce, ciphertext)
            .map_err(|_| CryptoError::DecryptFailed)
    }

    /// Total overhead added by encryption (nonce + tag).
    pub fn overhead(&self) -> usize {
        OVERHEAD
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_roundtrip() {
        let cipher = Cipher::new("test-passphrase").unwrap();
        let plaintext = b"hello stealthtun";

        let sealed = cipher.encrypt(plaintext).unwrap();
        assert_eq!(sealed.len(), plaintext.len() + OVERHEAD);
        assert_ne!(&sealed[NONCE_SIZE..], plaintext.as_slice());

        let opened = cipher.decrypt(&sealed).unwrap();
        assert_eq!(opened, plaintext);
    }

    #[test]
    fn test_empty_passphrase_rejected() {
        assert!(matches!(Cipher::new(""), Err(CryptoError::EmptyPassphrase)));
    }

    #[test]
    fn test_overhead_is_28() {
        let cipher = Cipher::new("any-key").unwrap();
        assert_eq!(cipher.overhead(), 28);
    }

    #[test]
    fn test_cross_key_decrypt_fails() {
        let c1 = Cipher::new("key-1").unwrap();
        let c2 = Cipher::new("key-2").unwrap();

        let sealed = c1.encrypt(b"secret").unwrap();
        assert!(c2.decrypt(&sealed).is_err());
    }

    #[test]
    fn test_ciphertext_divergence() {
        let cipher = Cipher::new("same-key").unwrap();

        let a = cipher.encrypt(b"same message").unwrap();
        let b = cipher.encrypt(b"same message").unwrap();
        assert_ne!(a, b);

        assert_eq!(cipher.decrypt(&a).unwrap(), b"same message");
        assert_eq!(cipher.decrypt(&b).unwrap(), b"same message");
    }

    #[test]
    fn test_tampered_packet_fails() {
        let cipher = Cipher::new("tamper-key").unwrap();
        let mut sealed = cipher.encrypt(b"payload").unwrap();
        sealed[NONCE_SIZE] ^= 0xFF;
        assert!(cipher.decrypt(&sealed).is_err());
    }

    #[test]
    fn test_short_ciphertext_rejected() {
        let cipher = Cipher::new("short-key").unwrap();
        let result = cipher.decrypt(&[0u8; 10]);
        assert!(matches!(result, Err(CryptoError::CiphertextTooShort(10))));
    }
}

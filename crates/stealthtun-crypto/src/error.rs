//! Crypto error types

use thiserror::Error;

/// Crypto layer errors
#[derive(Debug, Error)]
pub enum CryptoError {
    /// Passphrase was empty
    #[error("passphrase cannot be empty")]
    EmptyPassphrase,

    /// Rotated key is too short
    #[error("rotation key too short: need at least {expected} characters, got {actual}")]
    KeyTooShort { expected: usize, actual: usize },

    /// Encryption failed
    #[error("encryption failed: {0}")]
    EncryptFailed(String),

    /// Decryption/authentication failed
    #[error("decryption failed")]
    DecryptFailed,

    /// Ciphertext shorter than nonce + tag
    #[error("ciphertext too short: {0} bytes")]
    CiphertextTooShort(usize),
}

/// Result type for crypto operations
pub type CryptoResult<T> = Result<T, CryptoError>;

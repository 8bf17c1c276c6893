//! StealthTun Cryptography
//!
//! Provides the tunnel's packet encryption:
//! - AES-256-GCM authenticated encryption with passphrase-derived keys
//! - Zero-downtime key rotation with a decrypt grace window

pub mod cipher;
pub mod error;
pub mod rotation;

pub use cipher::Cipher;
pub use error::{CryptoError, CryptoResult};
pub use rotation::{generate_rotation_key, CipherSet};

/// AES-GCM nonce size in bytes
pub const NONCE_SIZE: usize = 12;

/// AES-GCM authentication tag size in bytes
pub const TAG_SIZE: usize = 16;

/// Symmetric key size in bytes (AES-256)
pub const KEY_SIZE: usize = 32;

/// Total per-packet encryption overhead (nonce + tag)
pub const OVERHEAD: usize = NONCE_SIZE + TAG_SIZE;

/// Grace window during which the previous cipher may still decrypt
pub const ROTATION_GRACE: std::time::Duration = std::time::Duration::from_secs(15);

/// Minimum accepted length for a rotated key string
pub const MIN_KEY_LEN: usize = 16;

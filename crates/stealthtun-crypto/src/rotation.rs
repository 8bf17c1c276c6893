//! Key Rotation
//!
//! Holds the active packet cipher plus the previous generation for the
//! rotation grace window. Encryption always uses the newest cipher; decryption
//! falls back to the previous one until the window closes or the new key is
//! confirmed in use by a successful decrypt.

use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use rand::RngCore;
use tracing::{debug, info};

use crate::cipher::Cipher;
use crate::error::{CryptoError, CryptoResult};
use crate::{MIN_KEY_LEN, ROTATION_GRACE};

struct PrevCipher {
    cipher: Arc<Cipher>,
    generation: u64,
    expires: Instant,
}

struct State {
    active: Option<Arc<Cipher>>,
    generation: u64,
    prev: Option<PrevCipher>,
}

/// Rotating cipher state shared by a tunnel.
///
/// All mutation happens under one lock; no lock is held across packet I/O.
pub struct CipherSet {
    state: RwLock<State>,
}

impl CipherSet {
    /// Create the cipher state. `passphrase = None` disables encryption and
    /// every seal/open becomes a pass-through.
    pub fn new(passphrase: Option<&str>) -> CryptoResult<Self> {
        let (active, generation) = match passphrase {
            Some(p) => (Some(Arc::new(Cipher::new(p)?)), 1),
            None => (None, 0),
        };

        Ok(Self {
            state: RwLock::new(State {
                active,
                generation,
                prev: None,
            }),
        })
    }

    /// Whether encryption is configured at all.
    pub fn has_cipher(&self) -> bool {
        self.state.read().unwrap().active.is_some()
    }

    /// Current active generation (0 when encryption is disabled).
    pub fn generation(&self) -> u64 {
        self.state.read().unwrap().generation
    }

    /// The active cipher and its generation, if encryption is configured.
    pub fn active(&self) -> Option<(Arc<Cipher>, u64)> {
        let state = self.state.read().unwrap();
        state.active.as_ref().map(|c| (c.clone(), state.generation))
    }

    /// Swap in a freshly keyed cipher. The old cipher remains valid for
    /// decryption during the grace window. Returns the new generation.
    pub fn rotate(&self, new_key: &str) -> CryptoResult<u64> {
        self.rotate_with_grace(new_key, ROTATION_GRACE)
    }

    fn rotate_with_grace(&self, new_key: &str, grace: Duration) -> CryptoResult<u64> {
        if new_key.len() < MIN_KEY_LEN {
            return Err(CryptoError::KeyTooShort {
                expected: MIN_KEY_LEN,
                actual: new_key.len(),
            });
        }

        let new_cipher = Arc::new(Cipher::new(new_key)?);

        let mut state = self.state.write().unwrap();
        let old = state.active.take();
        let old_gen = state.generation;

        state.active = Some(new_cipher);
        state.generation += 1;
        state.prev = old.map(|cipher| PrevCipher {
            cipher,
            generation: old_gen,
            expires: Instant::now() + grace,
        });

        info!(generation = state.generation, "rotated tunnel cipher");
        Ok(state.generation)
    }

    /// Encrypt with the active cipher, or pass the packet through unchanged
    /// when encryption is disabled.
    pub fn seal(&self, data: &[u8]) -> CryptoResult<Vec<u8>> {
        let cipher = {
            let state = self.state.read().unwrap();
            state.active.clone()
        };

        match cipher {
            Some(c) => c.encrypt(data),
            None => Ok(data.to_vec()),
        }
    }

    /// Decrypt with the active cipher, falling back to the previous one
    /// while the grace window is open.
    ///
    /// Returns the plaintext and the cipher (with generation) that produced
    /// it, so callers can track which key a peer is currently using. A
    /// `None` cipher means encryption is disabled and the input was passed
    /// through.
    pub fn open(&self, data: &[u8]) -> CryptoResult<(Vec<u8>, Option<(Arc<Cipher>, u64)>)> {
        let (active, active_gen, prev) = {
            let state = self.state.read().unwrap();
            (
                state.active.clone(),
                state.generation,
                state
                    .prev
                    .as_ref()
                    .map(|p| (p.cipher.clone(), p.generation, p.expires)),
            )
        };

        let Some(active) = active else {
            return Ok((data.to_vec(), None));
        };

        if let Ok(plain) = active.decrypt(data) {
            // A successful decrypt with the new key confirms the peer has
            // switched; the previous cipher is no longer needed.
            if prev.is_some() {
                self.retire_prev("new key confirmed in use");
            }
            return Ok((plain, Some((active, active_gen))));
        }

        if let Some((prev_cipher, prev_gen, expires)) = prev {
            if Instant::now() > expires {
                self.retire_prev("grace window expired");
            } else if let Ok(plain) = prev_cipher.decrypt(data) {
                return Ok((plain, Some((prev_cipher, prev_gen))));
            }
        }

        Err(CryptoError::DecryptFailed)
    }

    fn retire_prev(&self, reason: &str) {
        let mut state = self.state.write().unwrap();
        if state.prev.take().is_some() {
            debug!("retired previous cipher ({})", reason);
        }
    }
}

/// Generate a fresh 32-byte rotation key, hex encoded.
pub fn generate_rotation_key() -> String {
    let mut buf = [0u8; 32];
    rand::rngs::OsRng.fill_bytes(&mut buf);
    hex::encode(buf)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_passthrough_without_cipher() {
        let set = CipherSet::new(None).unwrap();
        assert!(!set.has_cipher());

        let sealed = set.seal(b"plain").unwrap();
        assert_eq!(sealed, b"plain");

        let (opened, used) = set.open(b"plain").unwrap();
        assert_eq!(opened, b"plain");
        assert!(used.is_none());
    }

    #[test]
    fn test_generation_starts_at_one() {
        let set = CipherSet::new(Some("initial-passphrase")).unwrap();
        assert_eq!(set.generation(), 1);
    }

    #[test]
    fn test_rotation_rejects_short_keys() {
        let set = CipherSet::new(Some("initial-passphrase")).unwrap();
        assert!(matches!(
            set.rotate("short"),
            Err(CryptoError::KeyTooShort { .. })
        ));
    }

    #[test]
    fn test_rotation_grace_window() {
        let set = CipherSet::new(Some("original-passphrase")).unwrap();
        let old_sealed = set.seal(b"old-key packet").unwrap();

        let generation = set.rotate(&generate_rotation_key()).unwrap();
        assert_eq!(generation, 2);

        // Old-key traffic still decrypts inside the grace window.
        let (plain, used) = set.open(&old_sealed).unwrap();
        assert_eq!(plain, b"old-key packet");
        assert_eq!(used.unwrap().1, 1);

        // New-key traffic decrypts too, and confirms the rotation.
        let new_sealed = set.seal(b"new-key packet").unwrap();
        let (plain, used) = set.open(&new_sealed).unwrap();
        assert_eq!(plain, b"new-key packet");
        assert_eq!(used.unwrap().1, 2);

        // The previous cipher was retired by the confirmed decrypt.
        assert!(set.open(&old_sealed).is_err());
    }

    #[test]
    fn test_rotation_grace_expiry() {
        let set = CipherSet::new(Some("original-passphrase")).unwrap();
        let old_sealed = set.seal(b"stale packet").unwrap();

        set.rotate_with_grace(&generate_rotation_key(), Duration::from_millis(10))
            .unwrap();
        std::thread::sleep(Duration::from_millis(20));

        // Outside the window only the new key works.
        assert!(set.open(&old_sealed).is_err());
        let sealed = set.seal(b"fresh packet").unwrap();
        assert_eq!(set.open(&sealed).unwrap().0, b"fresh packet");
    }

    #[test]
    fn test_generated_keys_are_valid_rotation_input() {
        let key = generate_rotation_key();
        assert_eq!(key.len(), 64);

        let set = CipherSet::new(Some("initial-passphrase")).unwrap();
        set.rotate(&key).unwrap();
        assert_eq!(set.generation(), 2);
    }
}

//! Authenticated encryption for secret columns.
//!
//! Git passwords and remote-host credentials are stored encrypted. The key
//! is supplied by the embedding application; this crate never invents one.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chacha20poly1305::aead::{Aead, AeadCore, KeyInit, OsRng};
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce};

const NONCE_LEN: usize = 12;

/// AEAD cipher over the registry's secret columns.
#[derive(Clone)]
pub struct SecretCipher {
    cipher: ChaCha20Poly1305,
}

impl SecretCipher {
    /// Build a cipher from a 32-byte key.
    pub fn new(key: &[u8; 32]) -> Self {
        Self {
            cipher: ChaCha20Poly1305::new(Key::from_slice(key)),
        }
    }

    /// Encrypt a secret for storage. Output is base64(nonce || ciphertext);
    /// a fresh nonce is drawn per call, so the same plaintext never produces
    /// the same column value twice.
    pub fn seal(&self, plaintext: &str) -> crate::Result<String> {
        let nonce = ChaCha20Poly1305::generate_nonce(&mut OsRng);
        let ciphertext = self
            .cipher
            .encrypt(&nonce, plaintext.as_bytes())
            .map_err(|e| crate::Error::Crypto(e.to_string()))?;

        let mut blob = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        blob.extend_from_slice(nonce.as_slice());
        blob.extend_from_slice(&ciphertext);
        Ok(BASE64.encode(blob))
    }

    /// Decrypt a stored secret column value.
    pub fn open(&self, stored: &str) -> crate::Result<String> {
        let blob = BASE64
            .decode(stored)
            .map_err(|e| crate::Error::Crypto(format!("bad secret encoding: {}", e)))?;
        if blob.len() < NONCE_LEN {
            return Err(crate::Error::Crypto("secret blob too short".into()));
        }
        let (nonce, ciphertext) = blob.split_at(NONCE_LEN);
        let plaintext = self
            .cipher
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|e| crate::Error::Crypto(e.to_string()))?;
        String::from_utf8(plaintext).map_err(|e| crate::Error::Crypto(e.to_string()))
    }

    /// Seal an optional secret; `None` stays `None`.
    pub fn seal_opt(&self, plaintext: Option<&str>) -> crate::Result<Option<String>> {
        plaintext.map(|p| self.seal(p)).transpose()
    }

    /// Open an optional secret column; `None` stays `None`.
    pub fn open_opt(&self, stored: Option<&str>) -> crate::Result<Option<String>> {
        stored.map(|s| self.open(s)).transpose()
    }
}

impl std::fmt::Debug for SecretCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecretCipher").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cipher() -> SecretCipher {
        SecretCipher::new(&[7u8; 32])
    }

    #[test]
    fn seal_then_open_round_trips() {
        let c = cipher();
        let sealed = c.seal("hunter2").unwrap();
        assert_ne!(sealed, "hunter2");
        assert_eq!(c.open(&sealed).unwrap(), "hunter2");
    }

    #[test]
    fn nonce_is_fresh_per_seal() {
        let c = cipher();
        let a = c.seal("same").unwrap();
        let b = c.seal("same").unwrap();
        assert_ne!(a, b);
        assert_eq!(c.open(&a).unwrap(), c.open(&b).unwrap());
    }

    #[test]
    fn tampered_blob_is_rejected() {
        let c = cipher();
        let sealed = c.seal("secret").unwrap();
        let mut blob = BASE64.decode(&sealed).unwrap();
        let last = blob.len() - 1;
        blob[last] ^= 0xff;
        let tampered = BASE64.encode(blob);
        assert!(matches!(c.open(&tampered), Err(crate::Error::Crypto(_))));
    }

    #[test]
    fn wrong_key_fails_to_open() {
        let sealed = cipher().seal("secret").unwrap();
        let other = SecretCipher::new(&[8u8; 32]);
        assert!(other.open(&sealed).is_err());
    }
}

//! Encryption of agent secrets at rest.

use aes_gcm::{
    Aes256Gcm, Key, Nonce,
    aead::{Aead, KeyInit},
};
use base64::{Engine as _, engine::general_purpose::STANDARD};
use gantry_core::{Error, Result};
use rand::Rng;
use rand::distributions::Alphanumeric;
use sha2::{Digest, Sha256};

const NONCE_LEN: usize = 12;

/// AES-256-GCM cipher for agent secret keys.
///
/// Ciphertexts are `base64(nonce || ciphertext)` so each value carries its
/// own nonce.
#[derive(Clone)]
pub struct SecretCipher {
    cipher: Aes256Gcm,
}

impl SecretCipher {
    pub fn new(key: &[u8; 32]) -> Self {
        Self {
            cipher: Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key)),
        }
    }

    /// Create from a master key string (hashed to 32 bytes).
    pub fn from_master_key(master_key: &str) -> Self {
        let key: [u8; 32] = Sha256::digest(master_key.as_bytes()).into();
        Self::new(&key)
    }

    pub fn encrypt(&self, plaintext: &str) -> Result<String> {
        let nonce_bytes: [u8; NONCE_LEN] = rand::random();
        let ciphertext = self
            .cipher
            .encrypt(Nonce::from_slice(&nonce_bytes), plaintext.as_bytes())
            .map_err(|e| Error::Crypto(format!("Encryption failed: {e}")))?;

        let mut out = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        out.extend_from_slice(&nonce_bytes);
        out.extend_from_slice(&ciphertext);
        Ok(STANDARD.encode(out))
    }

    pub fn decrypt(&self, encoded: &str) -> Result<String> {
        let bytes = STANDARD
            .decode(encoded)
            .map_err(|e| Error::Crypto(format!("Invalid ciphertext encoding: {e}")))?;
        if bytes.len() <= NONCE_LEN {
            return Err(Error::Crypto("Ciphertext too short".to_string()));
        }
        let (nonce, ciphertext) = bytes.split_at(NONCE_LEN);
        let plaintext = self
            .cipher
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|e| Error::Crypto(format!("Decryption failed: {e}")))?;
        String::from_utf8(plaintext).map_err(|e| Error::Crypto(format!("Secret is not UTF-8: {e}")))
    }

    /// Whether `presented` is the secret stored as `encoded`.
    pub fn matches(&self, encoded: &str, presented: &str) -> Result<bool> {
        let stored = self.decrypt(encoded)?;
        Ok(constant_time_eq(stored.as_bytes(), presented.as_bytes()))
    }
}

/// A fresh random agent secret.
pub fn generate_secret() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(32)
        .map(char::from)
        .collect()
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

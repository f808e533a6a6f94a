//! API-key at-rest encryption
//!
//! AES-256-GCM with a process-wide key. Ciphertext blobs are
//! `nonce (12 bytes) || ciphertext`; the key is read-only after
//! initialization. Plaintext keys exist only in the call frame that
//! asked for them.

use aes_gcm::aead::{Aead, AeadCore, KeyInit, OsRng};
use aes_gcm::{Aes256Gcm, Nonce};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use parley_core::ConfigError;
use sha2::{Digest, Sha256};

const NONCE_LEN: usize = 12;

/// Process-wide cipher for API-key encryption.
pub struct KeyCipher {
    cipher: Aes256Gcm,
}

impl KeyCipher {
    /// Build from a raw 32-byte key.
    pub fn new(key: &[u8; 32]) -> Self {
        Self {
            cipher: Aes256Gcm::new_from_slice(key).expect("key length is 32"),
        }
    }

    /// Build from the `PARLEY_ENCRYPTION_KEY` value: either base64 of
    /// exactly 32 bytes, or an arbitrary passphrase that is stretched
    /// through SHA-256.
    pub fn from_secret(secret: &str) -> Result<Self, ConfigError> {
        let secret = secret.trim();
        if secret.is_empty() {
            return Err(ConfigError::MissingRequired {
                field: "encryption_key".to_string(),
            });
        }

        if let Ok(decoded) = BASE64.decode(secret) {
            if decoded.len() == 32 {
                let mut key = [0u8; 32];
                key.copy_from_slice(&decoded);
                return Ok(Self::new(&key));
            }
        }

        let digest = Sha256::digest(secret.as_bytes());
        let mut key = [0u8; 32];
        key.copy_from_slice(&digest);
        Ok(Self::new(&key))
    }

    /// Encrypt a plaintext API key into a nonce-prefixed blob.
    pub fn encrypt(&self, plaintext: &str) -> Result<Vec<u8>, ConfigError> {
        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
        let ciphertext = self
            .cipher
            .encrypt(&nonce, plaintext.as_bytes())
            .map_err(|_| ConfigError::KeyDecryptionFailed)?;
        let mut blob = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        blob.extend_from_slice(&nonce);
        blob.extend_from_slice(&ciphertext);
        Ok(blob)
    }

    /// Decrypt a nonce-prefixed blob back to the plaintext key.
    pub fn decrypt(&self, blob: &[u8]) -> Result<String, ConfigError> {
        if blob.len() <= NONCE_LEN {
            return Err(ConfigError::KeyDecryptionFailed);
        }
        let nonce = Nonce::from_slice(&blob[..NONCE_LEN]);
        let plaintext = self
            .cipher
            .decrypt(nonce, &blob[NONCE_LEN..])
            .map_err(|_| ConfigError::KeyDecryptionFailed)?;
        String::from_utf8(plaintext).map_err(|_| ConfigError::KeyDecryptionFailed)
    }
}

impl std::fmt::Debug for KeyCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyCipher").finish()
    }
}

/// The preview clients see instead of the key: `"****" + last 4`.
pub fn key_preview(plaintext: &str) -> String {
    let tail: String = plaintext
        .chars()
        .rev()
        .take(4)
        .collect::<String>()
        .chars()
        .rev()
        .collect();
    format!("****{}", tail)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cipher() -> KeyCipher {
        KeyCipher::from_secret("test-passphrase").unwrap()
    }

    #[test]
    fn test_encrypt_decrypt_round_trip() {
        let cipher = cipher();
        let blob = cipher.encrypt("sk-abc123def456").unwrap();
        assert_ne!(blob, b"sk-abc123def456");
        assert_eq!(cipher.decrypt(&blob).unwrap(), "sk-abc123def456");
    }

    #[test]
    fn test_nonces_differ_per_encryption() {
        let cipher = cipher();
        let a = cipher.encrypt("same").unwrap();
        let b = cipher.encrypt("same").unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn test_wrong_key_fails_closed() {
        let blob = cipher().encrypt("sk-secret").unwrap();
        let other = KeyCipher::from_secret("different-passphrase").unwrap();
        assert_eq!(
            other.decrypt(&blob).unwrap_err(),
            ConfigError::KeyDecryptionFailed
        );
    }

    #[test]
    fn test_truncated_blob_fails() {
        let cipher = cipher();
        assert!(cipher.decrypt(&[0u8; 5]).is_err());
        assert!(cipher.decrypt(&[]).is_err());
    }

    #[test]
    fn test_base64_key_accepted() {
        let raw = [7u8; 32];
        let encoded = BASE64.encode(raw);
        let a = KeyCipher::from_secret(&encoded).unwrap();
        let b = KeyCipher::new(&raw);
        let blob = a.encrypt("sk-x").unwrap();
        assert_eq!(b.decrypt(&blob).unwrap(), "sk-x");
    }

    #[test]
    fn test_empty_secret_rejected() {
        assert!(KeyCipher::from_secret("  ").is_err());
    }

    #[test]
    fn test_key_preview() {
        assert_eq!(key_preview("sk-abcdef123456"), "****3456");
        assert_eq!(key_preview("abc"), "****abc");
    }
}

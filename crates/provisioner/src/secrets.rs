use std::fmt;

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use anyhow::{anyhow, Context, Result};
use base64::Engine;
use rand::RngCore;

use crate::config::ProvisionerConfig;

const NONCE_LENGTH: usize = 12;

/// AES-256-GCM cipher for credentials stored at rest. Output is base64 of nonce || ciphertext.
#[derive(Clone)]
pub struct SecretCipher {
    cipher: Aes256Gcm,
}

impl fmt::Debug for SecretCipher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SecretCipher").finish_non_exhaustive()
    }
}

impl SecretCipher {
    /// Builds a cipher from a base64-encoded 32 byte key.
    ///
    /// # Errors
    /// Returns an error if the key is not base64 or has the wrong length.
    pub fn from_base64_key(raw_key: &str) -> Result<Self> {
        let key_bytes = base64::engine::general_purpose::STANDARD
            .decode(raw_key.trim())
            .context("PROVISIONER_ENCRYPTION_KEY must be base64")?;
        if key_bytes.len() != 32 {
            anyhow::bail!("PROVISIONER_ENCRYPTION_KEY must decode to 32 bytes")
        }

        Ok(Self {
            cipher: Aes256Gcm::new_from_slice(&key_bytes)
                .map_err(|_| anyhow!("invalid encryption key"))?,
        })
    }

    /// # Errors
    /// Returns an error if a configured key is invalid.
    pub fn from_config(config: &ProvisionerConfig) -> Result<Option<Self>> {
        config
            .encryption_key()
            .map(|raw_key| Self::from_base64_key(&raw_key))
            .transpose()
    }

    /// # Errors
    /// Returns an error if encryption fails.
    pub fn encrypt(&self, value: &str) -> Result<String> {
        let mut nonce_bytes = [0_u8; NONCE_LENGTH];
        rand::thread_rng().fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);
        let ciphertext = self
            .cipher
            .encrypt(nonce, value.as_bytes())
            .map_err(|_| anyhow!("encryption failed"))?;
        let mut combined = nonce_bytes.to_vec();
        combined.extend_from_slice(&ciphertext);
        Ok(base64::engine::general_purpose::STANDARD.encode(combined))
    }

    /// # Errors
    /// Returns an error if the value is malformed or was encrypted with another key.
    pub fn decrypt(&self, encrypted_value: &str) -> Result<String> {
        let bytes = base64::engine::general_purpose::STANDARD.decode(encrypted_value)?;
        if bytes.len() <= NONCE_LENGTH {
            anyhow::bail!("encrypted value malformed")
        }
        let nonce = Nonce::from_slice(&bytes[..NONCE_LENGTH]);
        let plaintext = self
            .cipher
            .decrypt(nonce, &bytes[NONCE_LENGTH..])
            .map_err(|_| anyhow!("decryption failed"))?;
        String::from_utf8(plaintext).context("decrypted value is not utf8")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(byte: u8) -> String {
        base64::engine::general_purpose::STANDARD.encode([byte; 32])
    }

    #[test]
    fn decrypt_recovers_encrypted_value() {
        let cipher = SecretCipher::from_base64_key(&key(7)).expect("cipher");

        let first = cipher.encrypt("api-key").expect("encrypt");
        let second = cipher.encrypt("api-key").expect("encrypt");
        assert_ne!(first, second);
        assert_eq!(cipher.decrypt(&first).expect("decrypt"), "api-key");
    }

    #[test]
    fn decrypt_with_other_key_fails() {
        let encrypted = SecretCipher::from_base64_key(&key(1))
            .expect("cipher")
            .encrypt("api-key")
            .expect("encrypt");

        let other = SecretCipher::from_base64_key(&key(2)).expect("cipher");
        assert!(other.decrypt(&encrypted).is_err());
        assert!(other.decrypt("c2hvcnQ=").is_err());
    }

    #[test]
    fn short_keys_are_rejected() {
        let short = base64::engine::general_purpose::STANDARD.encode([0_u8; 16]);
        assert!(SecretCipher::from_base64_key(&short).is_err());
        assert!(SecretCipher::from_base64_key("not base64!").is_err());
    }
}

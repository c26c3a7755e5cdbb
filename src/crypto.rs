// Export encryption
//
// A per-instance AES-256-GCM key, generated on first run and held in the
// meta store. Every ciphertext carries its random 12-byte nonce as a prefix.

use aes_gcm::aead::{Aead, KeyInit, OsRng};
use aes_gcm::{AeadCore, Aes256Gcm, Key, Nonce};

use crate::error::{MemoryError, Result};

/// Length of the symmetric key in bytes.
pub const KEY_LEN: usize = 32;

/// Length of the GCM nonce in bytes.
pub const NONCE_LEN: usize = 12;

/// AES-256-GCM cipher over the instance export key.
#[derive(Clone)]
pub struct ExportCipher {
    key: [u8; KEY_LEN],
}

impl ExportCipher {
    /// Generate fresh key material.
    pub fn generate() -> Self {
        let key = Aes256Gcm::generate_key(OsRng);
        let mut bytes = [0u8; KEY_LEN];
        bytes.copy_from_slice(key.as_slice());
        Self { key: bytes }
    }

    /// Rebuild a cipher from stored key material.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let key: [u8; KEY_LEN] = bytes
            .try_into()
            .map_err(|_| MemoryError::Crypto("invalid key length".to_string()))?;
        Ok(Self { key })
    }

    /// The exportable key material.
    pub fn key_bytes(&self) -> &[u8; KEY_LEN] {
        &self.key
    }

    /// Encrypt; the returned buffer is `nonce ‖ ciphertext`.
    pub fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>> {
        let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&self.key));
        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
        let ciphertext = cipher
            .encrypt(&nonce, plaintext)
            .map_err(|_| MemoryError::Crypto("encryption failed".to_string()))?;
        let mut out = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        out.extend_from_slice(nonce.as_slice());
        out.extend_from_slice(&ciphertext);
        Ok(out)
    }

    /// Decrypt a `nonce ‖ ciphertext` buffer.
    pub fn decrypt(&self, data: &[u8]) -> Result<Vec<u8>> {
        if data.len() < NONCE_LEN {
            return Err(MemoryError::Crypto("ciphertext too short".to_string()));
        }
        let (nonce, ciphertext) = data.split_at(NONCE_LEN);
        let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&self.key));
        cipher
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|_| MemoryError::Crypto("decryption failed".to_string()))
    }
}

//! Per-envelope symmetric encryption.
//!
//! AES-256-GCM with a 128-bit IV, used identically for text and file
//! payloads. Output layout is `ciphertext || tag` (16-byte GCM tag).

use crate::entropy::{EntropySource, OsEntropy};
use crate::error::{CryptoError, CryptoResult};
use aes_gcm::aead::consts::U16;
use aes_gcm::aead::{Aead, KeyInit, Payload};
use aes_gcm::aes::Aes256;
use aes_gcm::{AesGcm, Nonce};
use std::fmt;
use std::sync::Arc;
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

/// Symmetric key size (AES-256).
pub const KEY_SIZE: usize = 32;
/// IV size.
pub const IV_SIZE: usize = 16;
/// GCM authentication tag size.
pub const TAG_SIZE: usize = 16;

type Aes256Gcm16 = AesGcm<Aes256, U16>;

/// A fresh key and IV for exactly one envelope.
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct SymmetricKeyMaterial {
    key: [u8; KEY_SIZE],
    iv: [u8; IV_SIZE],
}

impl SymmetricKeyMaterial {
    /// Rebuilds material from an unwrapped key and the envelope's IV.
    pub fn from_parts(key: [u8; KEY_SIZE], iv: [u8; IV_SIZE]) -> Self {
        Self { key, iv }
    }

    pub fn key(&self) -> &[u8; KEY_SIZE] {
        &self.key
    }

    pub fn iv(&self) -> &[u8; IV_SIZE] {
        &self.iv
    }
}

impl fmt::Debug for SymmetricKeyMaterial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SymmetricKeyMaterial")
            .field("key", &"<redacted>")
            .field("iv", &self.iv)
            .finish()
    }
}

/// Generates key material and performs AES-256-GCM encryption.
#[derive(Clone)]
pub struct SymmetricCipher {
    entropy: Arc<dyn EntropySource>,
}

impl SymmetricCipher {
    pub fn new(entropy: Arc<dyn EntropySource>) -> Self {
        Self { entropy }
    }

    /// Draws a fresh 256-bit key and 128-bit IV from the entropy source.
    pub fn new_key(&self) -> CryptoResult<SymmetricKeyMaterial> {
        let mut material = SymmetricKeyMaterial {
            key: [0u8; KEY_SIZE],
            iv: [0u8; IV_SIZE],
        };
        self.entropy.fill(&mut material.key)?;
        self.entropy.fill(&mut material.iv)?;
        Ok(material)
    }

    /// Encrypts `plaintext`, authenticating `aad` alongside it.
    pub fn encrypt(
        plaintext: &[u8],
        material: &SymmetricKeyMaterial,
        aad: &[u8],
    ) -> CryptoResult<Vec<u8>> {
        let cipher = Aes256Gcm16::new_from_slice(&material.key)
            .map_err(|e| CryptoError::Encryption(format!("bad key length: {e}")))?;

        cipher
            .encrypt(
                Nonce::<U16>::from_slice(&material.iv),
                Payload {
                    msg: plaintext,
                    aad,
                },
            )
            .map_err(|e| CryptoError::Encryption(format!("AES-GCM encryption failed: {e}")))
    }

    /// Decrypts and verifies `ciphertext || tag`.
    pub fn decrypt(
        ciphertext: &[u8],
        material: &SymmetricKeyMaterial,
        aad: &[u8],
    ) -> CryptoResult<Zeroizing<Vec<u8>>> {
        if ciphertext.len() < TAG_SIZE {
            return Err(CryptoError::Decryption(format!(
                "ciphertext too short: {} bytes, tag alone is {TAG_SIZE}",
                ciphertext.len()
            )));
        }

        let cipher = Aes256Gcm16::new_from_slice(&material.key)
            .map_err(|e| CryptoError::Decryption(format!("bad key length: {e}")))?;

        cipher
            .decrypt(
                Nonce::<U16>::from_slice(&material.iv),
                Payload {
                    msg: ciphertext,
                    aad,
                },
            )
            .map(Zeroizing::new)
            .map_err(|_| {
                CryptoError::Decryption("authentication failed (wrong key or tampered data)".to_string())
            })
    }
}

impl Default for SymmetricCipher {
    fn default() -> Self {
        Self::new(Arc::new(OsEntropy))
    }
}

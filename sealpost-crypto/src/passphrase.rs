//! Passphrase protection for the private key at rest.
//!
//! Argon2id derives a 256-bit key from the passphrase; ChaCha20-Poly1305
//! seals the private key PEM. The salt and KDF parameters travel with the
//! ciphertext, so the passphrase is the only input needed to open it.

use crate::entropy::{EntropySource, OsEntropy};
use crate::error::{CryptoError, CryptoResult};
use crate::keypair::PrivateKeyPem;
use argon2::{Algorithm, Argon2, Params, Version};
use chacha20poly1305::aead::{Aead, KeyInit, Payload};
use chacha20poly1305::{ChaCha20Poly1305, Nonce};
use serde::{Deserialize, Serialize};
use zeroize::Zeroizing;

pub const SALT_SIZE: usize = 16;
pub const NONCE_SIZE: usize = 12;

const PROTECTED_KEY_AAD: &[u8] = b"sealpost-private-key-v1";

/// Argon2id cost parameters.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct KdfParams {
    pub memory_kib: u32,
    pub iterations: u32,
    pub parallelism: u32,
}

impl KdfParams {
    pub fn new(memory_kib: u32, iterations: u32, parallelism: u32) -> Self {
        Self {
            memory_kib,
            iterations,
            parallelism,
        }
    }
}

impl Default for KdfParams {
    fn default() -> Self {
        // OWASP minimum for Argon2id
        Self::new(19 * 1024, 2, 1)
    }
}

/// Derives a 256-bit key from a passphrase.
pub fn derive_key(
    passphrase: &str,
    salt: &[u8; SALT_SIZE],
    params: &KdfParams,
) -> CryptoResult<Zeroizing<[u8; 32]>> {
    let argon_params = Params::new(params.memory_kib, params.iterations, params.parallelism, Some(32))
        .map_err(|e| CryptoError::KeyDerivation(format!("invalid Argon2 parameters: {e}")))?;
    let argon = Argon2::new(Algorithm::Argon2id, Version::V0x13, argon_params);

    let mut out = Zeroizing::new([0u8; 32]);
    argon
        .hash_password_into(passphrase.as_bytes(), salt, &mut out[..])
        .map_err(|e| CryptoError::KeyDerivation(format!("Argon2id failed: {e}")))?;
    Ok(out)
}

/// A private key PEM sealed under a passphrase-derived key.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ProtectedPrivateKey {
    pub salt: [u8; SALT_SIZE],
    pub kdf: KdfParams,
    pub nonce: [u8; NONCE_SIZE],
    pub ciphertext: Vec<u8>,
    /// Unix timestamp when the key was sealed.
    pub created_at: i64,
}

/// Seals a private key PEM with a passphrase.
pub fn protect_private_key(
    private_key: &PrivateKeyPem,
    passphrase: &str,
    params: &KdfParams,
) -> CryptoResult<ProtectedPrivateKey> {
    let mut salt = [0u8; SALT_SIZE];
    let mut nonce = [0u8; NONCE_SIZE];
    OsEntropy.fill(&mut salt)?;
    OsEntropy.fill(&mut nonce)?;

    let key = derive_key(passphrase, &salt, params)?;
    let cipher = ChaCha20Poly1305::new_from_slice(&key[..])
        .map_err(|e| CryptoError::Encryption(format!("bad key length: {e}")))?;

    let ciphertext = cipher
        .encrypt(
            Nonce::from_slice(&nonce),
            Payload {
                msg: private_key.expose().as_bytes(),
                aad: PROTECTED_KEY_AAD,
            },
        )
        .map_err(|e| CryptoError::Encryption(format!("private key sealing failed: {e}")))?;

    Ok(ProtectedPrivateKey {
        salt,
        kdf: *params,
        nonce,
        ciphertext,
        created_at: chrono::Utc::now().timestamp(),
    })
}

/// Opens a passphrase-protected private key.
pub fn unprotect_private_key(
    protected: &ProtectedPrivateKey,
    passphrase: &str,
) -> CryptoResult<PrivateKeyPem> {
    let key = derive_key(passphrase, &protected.salt, &protected.kdf)?;
    let cipher = ChaCha20Poly1305::new_from_slice(&key[..])
        .map_err(|e| CryptoError::Decryption(format!("bad key length: {e}")))?;

    let plaintext = cipher
        .decrypt(
            Nonce::from_slice(&protected.nonce),
            Payload {
                msg: &protected.ciphertext,
                aad: PROTECTED_KEY_AAD,
            },
        )
        .map(Zeroizing::new)
        .map_err(|_| {
            CryptoError::Decryption("private key open failed (wrong passphrase or tampered data)".to_string())
        })?;

    let pem = std::str::from_utf8(&plaintext)
        .map_err(|_| CryptoError::Decryption("private key is not valid UTF-8".to_string()))?;
    Ok(PrivateKeyPem::new(pem))
}

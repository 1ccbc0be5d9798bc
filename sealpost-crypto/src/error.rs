//! Error types for the envelope engine.

use thiserror::Error;

/// Result type for cryptographic operations.
pub type CryptoResult<T> = Result<T, CryptoError>;

/// Errors that can occur during key generation, wrapping, or payload encryption.
#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("key generation failed: {0}")]
    KeyGeneration(String),

    #[error("encryption failed: {0}")]
    Encryption(String),

    #[error("decryption failed: {0}")]
    Decryption(String),

    #[error("key wrap failed: {0}")]
    KeyWrap(String),

    #[error("key unwrap failed: {0}")]
    KeyUnwrap(String),

    #[error("envelope decryption failed: {0}")]
    EnvelopeDecryption(#[source] Box<CryptoError>),

    #[error("invalid key: {0}")]
    InvalidKey(String),

    #[error("invalid key length: expected {expected}, got {actual}")]
    InvalidKeyLength { expected: usize, actual: usize },

    #[error("invalid envelope: {0}")]
    InvalidEnvelope(String),

    #[error("key derivation failed: {0}")]
    KeyDerivation(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("base64 decode error: {0}")]
    Base64(#[from] base64::DecodeError),
}

impl CryptoError {
    /// Returns the innermost cause of an envelope decryption failure.
    pub fn root_cause(&self) -> &CryptoError {
        match self {
            CryptoError::EnvelopeDecryption(inner) => inner.root_cause(),
            other => other,
        }
    }

    /// True if the failure came from a private key that does not match the
    /// wrapping public key.
    pub fn is_key_mismatch(&self) -> bool {
        matches!(self.root_cause(), CryptoError::KeyUnwrap(_))
    }
}

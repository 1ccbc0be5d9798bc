//! Cryptographic envelope engine for SealPost.
//!
//! Provides hybrid end-to-end encryption using:
//! - RSA-2048 account keypairs (PEM-serialized)
//! - AES-256-GCM with a fresh key and 128-bit IV per payload
//! - RSA-OAEP(SHA-256) to wrap each payload key for its recipient
//! - Argon2id + ChaCha20-Poly1305 to protect the private key at rest
//!
//! # Architecture
//!
//! Sending builds an [`Envelope`]: the payload is encrypted with a one-off
//! [`SymmetricKeyMaterial`], and that key is wrapped under the recipient's
//! [`PublicKey`]. Only the matching [`PrivateKey`] can unwrap it, which means
//! the sender cannot read back its own envelopes.
//!
//! All randomness comes from an injected [`EntropySource`]. [`OsEntropy`] is
//! the default; there is no global fallback.

pub mod asymmetric;
pub mod entropy;
pub mod envelope;
mod error;
pub mod keypair;
pub mod passphrase;
pub mod symmetric;

pub use asymmetric::AsymmetricCipher;
pub use entropy::{EntropySource, OsEntropy};
pub use envelope::{Envelope, EnvelopeEncoder, EnvelopeHeader, PayloadType, ENVELOPE_VERSION};
pub use error::{CryptoError, CryptoResult};
pub use keypair::{
    generate_keypair, KeyPair, KeyPairGenerator, PrivateKey, PrivateKeyPem, PublicKey,
    PublicKeyPem, RSA_KEY_BITS,
};
pub use passphrase::{
    derive_key, protect_private_key, unprotect_private_key, KdfParams, ProtectedPrivateKey,
};
pub use symmetric::{SymmetricCipher, SymmetricKeyMaterial, IV_SIZE, KEY_SIZE, TAG_SIZE};

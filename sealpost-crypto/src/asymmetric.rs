//! Key wrapping: RSA-OAEP with SHA-256.
//!
//! Only symmetric keys pass through here, never message content.

use crate::entropy::{seeded_rng, EntropySource, OsEntropy};
use crate::error::{CryptoError, CryptoResult};
use crate::keypair::{PrivateKey, PublicKey};
use rsa::Oaep;
use sha2::Sha256;
use std::sync::Arc;
use zeroize::Zeroizing;

/// SHA-256 output length; OAEP overhead is `2 * HASH_LEN + 2`.
const HASH_LEN: usize = 32;

/// Largest payload OAEP-SHA256 can wrap under a modulus of `modulus_len` bytes.
pub fn max_wrap_len(modulus_len: usize) -> usize {
    modulus_len.saturating_sub(2 * HASH_LEN + 2)
}

/// Wraps and unwraps symmetric keys under account keypairs.
#[derive(Clone)]
pub struct AsymmetricCipher {
    entropy: Arc<dyn EntropySource>,
}

impl AsymmetricCipher {
    pub fn new(entropy: Arc<dyn EntropySource>) -> Self {
        Self { entropy }
    }

    /// Encrypts `symmetric_key` under the recipient's public key.
    pub fn wrap(&self, symmetric_key: &[u8], recipient: &PublicKey) -> CryptoResult<Vec<u8>> {
        let limit = max_wrap_len(recipient.size());
        if symmetric_key.len() > limit {
            return Err(CryptoError::KeyWrap(format!(
                "payload of {} bytes exceeds OAEP limit of {limit}",
                symmetric_key.len()
            )));
        }

        let mut rng = seeded_rng(self.entropy.as_ref())?;
        recipient
            .as_rsa()
            .encrypt(&mut rng, Oaep::new::<Sha256>(), symmetric_key)
            .map_err(|e| CryptoError::KeyWrap(format!("RSA-OAEP encryption failed: {e}")))
    }

    /// Recovers a wrapped key.
    ///
    /// A private key that does not match the wrapping public key fails the
    /// OAEP padding check and yields [`CryptoError::KeyUnwrap`].
    pub fn unwrap(&self, wrapped_key: &[u8], private_key: &PrivateKey) -> CryptoResult<Zeroizing<Vec<u8>>> {
        let expected = private_key.public_key().size();
        if wrapped_key.len() != expected {
            return Err(CryptoError::KeyUnwrap(format!(
                "wrapped key is {} bytes, expected {expected}",
                wrapped_key.len()
            )));
        }

        let mut rng = seeded_rng(self.entropy.as_ref())?;
        private_key
            .as_rsa()
            .decrypt_blinded(&mut rng, Oaep::new::<Sha256>(), wrapped_key)
            .map(Zeroizing::new)
            .map_err(|_| {
                CryptoError::KeyUnwrap(
                    "private key does not match the wrapping key, or data is corrupted".to_string(),
                )
            })
    }
}

impl Default for AsymmetricCipher {
    fn default() -> Self {
        Self::new(Arc::new(OsEntropy))
    }
}

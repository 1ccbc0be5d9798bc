//! Injectable source of cryptographically secure random bytes.
//!
//! Every key, IV, and RNG seed in this crate is drawn from an
//! [`EntropySource`]. Production code uses [`OsEntropy`]; embedders on
//! platforms without a default OS generator must supply their own source
//! before generating any key material.

use crate::error::{CryptoError, CryptoResult};
use rand::rngs::{OsRng, StdRng};
use rand::{RngCore, SeedableRng};
use zeroize::Zeroizing;

/// A cryptographically secure random byte source.
pub trait EntropySource: Send + Sync {
    /// Fills `dest` entirely with random bytes, or fails without partial output
    /// being used.
    fn fill(&self, dest: &mut [u8]) -> CryptoResult<()>;
}

/// The operating system CSPRNG.
#[derive(Clone, Copy, Debug, Default)]
pub struct OsEntropy;

impl EntropySource for OsEntropy {
    fn fill(&self, dest: &mut [u8]) -> CryptoResult<()> {
        OsRng
            .try_fill_bytes(dest)
            .map_err(|e| CryptoError::KeyGeneration(format!("OS random source unavailable: {e}")))
    }
}

/// Seeds a ChaCha-based CSPRNG from the given source.
///
/// Used where a primitive wants an `RngCore` (RSA prime search, OAEP padding)
/// but the seed itself must come from the injected source.
///
/// Only the seed buffer is wiped. `from_seed` takes the seed by value and
/// `StdRng` does not zeroize its expanded state, so the generator is kept
/// local to the single operation that needs it.
pub(crate) fn seeded_rng(source: &dyn EntropySource) -> CryptoResult<StdRng> {
    let mut seed = Zeroizing::new([0u8; 32]);
    source.fill(&mut seed[..])?;
    Ok(StdRng::from_seed(std::mem::take(&mut *seed)))
}

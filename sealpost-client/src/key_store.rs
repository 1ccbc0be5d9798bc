//! Secure storage for the account private key.
//!
//! The private key never leaves the device. Stores hand back PEM text; the
//! conversation engine parses it once per decrypt batch.

use crate::error::{ClientError, ClientResult};
use sealpost_crypto::{
    protect_private_key, unprotect_private_key, KdfParams, PrivateKey, PrivateKeyPem,
    ProtectedPrivateKey,
};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::debug;
use zeroize::Zeroizing;

/// Platform secure storage for the private key.
///
/// Calls may block (disk, keychain, KDF); async callers go through
/// `spawn_blocking`.
pub trait SecureKeyStore: Send + Sync {
    fn save(&self, private_key: &PrivateKeyPem) -> ClientResult<()>;

    /// `Ok(None)` when no key has been saved.
    fn load(&self) -> ClientResult<Option<PrivateKeyPem>>;

    fn clear(&self) -> ClientResult<()>;
}

/// Loads and parses the private key, failing if none is stored.
pub fn load_private_key(store: &dyn SecureKeyStore) -> ClientResult<PrivateKey> {
    let pem = store.load()?.ok_or(ClientError::MissingPrivateKey)?;
    Ok(pem.parse()?)
}

/// Process-lifetime key store.
#[derive(Default)]
pub struct MemoryKeyStore {
    key: Mutex<Option<PrivateKeyPem>>,
}

impl MemoryKeyStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_key(private_key: PrivateKeyPem) -> Self {
        Self {
            key: Mutex::new(Some(private_key)),
        }
    }

    fn slot(&self) -> ClientResult<std::sync::MutexGuard<'_, Option<PrivateKeyPem>>> {
        self.key
            .lock()
            .map_err(|_| ClientError::KeyStore("key store lock poisoned".to_string()))
    }
}

impl SecureKeyStore for MemoryKeyStore {
    fn save(&self, private_key: &PrivateKeyPem) -> ClientResult<()> {
        *self.slot()? = Some(private_key.clone());
        Ok(())
    }

    fn load(&self) -> ClientResult<Option<PrivateKeyPem>> {
        Ok(self.slot()?.clone())
    }

    fn clear(&self) -> ClientResult<()> {
        *self.slot()? = None;
        Ok(())
    }
}

/// Passphrase-protected key file.
///
/// The PEM is sealed with Argon2id + ChaCha20-Poly1305 and written as JSON.
/// Writes go to a sibling temp file first and are renamed into place.
pub struct FileKeyStore {
    path: PathBuf,
    passphrase: Zeroizing<String>,
    kdf: KdfParams,
}

impl FileKeyStore {
    pub fn new(path: impl AsRef<Path>, passphrase: impl Into<String>) -> Self {
        Self::with_params(path, passphrase, KdfParams::default())
    }

    pub fn with_params(path: impl AsRef<Path>, passphrase: impl Into<String>, kdf: KdfParams) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            passphrase: Zeroizing::new(passphrase.into()),
            kdf,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn exists(&self) -> bool {
        self.path.exists()
    }

    fn write_atomic(&self, contents: &[u8]) -> ClientResult<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let tmp = self.path.with_extension("tmp");
        std::fs::write(&tmp, contents)?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&tmp, std::fs::Permissions::from_mode(0o600))?;
        }
        std::fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

impl SecureKeyStore for FileKeyStore {
    fn save(&self, private_key: &PrivateKeyPem) -> ClientResult<()> {
        let protected = protect_private_key(private_key, &self.passphrase, &self.kdf)?;
        let json = serde_json::to_vec_pretty(&protected)?;
        self.write_atomic(&json)?;
        debug!("Saved protected private key to {}", self.path.display());
        Ok(())
    }

    fn load(&self) -> ClientResult<Option<PrivateKeyPem>> {
        if !self.path.exists() {
            return Ok(None);
        }

        let json = std::fs::read(&self.path)?;
        let protected: ProtectedPrivateKey = serde_json::from_slice(&json)
            .map_err(|e| ClientError::KeyStore(format!("corrupt key file: {e}")))?;
        let pem = unprotect_private_key(&protected, &self.passphrase)
            .map_err(|e| ClientError::KeyStore(e.to_string()))?;
        Ok(Some(pem))
    }

    fn clear(&self) -> ClientResult<()> {
        if self.path.exists() {
            std::fs::remove_file(&self.path)?;
        }
        Ok(())
    }
}

//! Account creation.

use crate::backend::ChatBackend;
use crate::error::ClientResult;
use crate::key_store::SecureKeyStore;
use crate::types::{RegisterRequest, UserId};
use sealpost_crypto::KeyPairGenerator;
use std::sync::Arc;
use tracing::{info, warn};

/// Creates an account with a fresh keypair.
///
/// The private key is saved to `store` before the public key is published,
/// so a successful registration always leaves a usable key on the device.
/// If the server rejects the registration the stored key is cleared again.
pub async fn register_account<B: ChatBackend>(
    backend: &B,
    store: Arc<dyn SecureKeyStore>,
    generator: KeyPairGenerator,
    email: &str,
    password: &str,
) -> ClientResult<UserId> {
    let keypair = tokio::task::spawn_blocking(move || generator.generate()).await??;

    let private_key = keypair.private_key;
    let save_store = Arc::clone(&store);
    tokio::task::spawn_blocking(move || save_store.save(&private_key)).await??;

    let request = RegisterRequest {
        email: email.to_string(),
        password: password.to_string(),
        public_key: keypair.public_key,
    };

    match backend.register(request).await {
        Ok(user_id) => {
            info!("Registered user {user_id}");
            Ok(user_id)
        }
        Err(e) => {
            warn!("Registration rejected, discarding generated key: {e}");
            let clear_store = Arc::clone(&store);
            if let Err(clear_err) = tokio::task::spawn_blocking(move || clear_store.clear()).await? {
                warn!("Failed to clear key store: {clear_err}");
            }
            Err(e)
        }
    }
}

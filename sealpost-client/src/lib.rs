//! SealPost messaging client core.
//!
//! Talks to the message server, keeps the account private key in secure
//! storage, and decrypts conversations lazily on user request.
//!
//! # Architecture
//!
//! [`ChatApiClient`] implements [`ChatBackend`] over HTTP. An open
//! conversation is driven by a [`ConversationEngine`], which polls the
//! backend and feeds a [`LazyDecryptionCoordinator`]; decryption only
//! happens when a [`ConversationHandle`] asks for it.

pub mod api_client;
pub mod backend;
pub mod config;
pub mod coordinator;
pub mod engine;
pub mod error;
pub mod key_store;
pub mod registration;
pub mod types;

pub use api_client::ChatApiClient;
pub use backend::ChatBackend;
pub use config::ClientConfig;
pub use coordinator::{
    CoordinatorStats, DecryptJob, DecryptOutcome, DecryptState, DecryptionCache, DisplayLine,
    LazyDecryptionCoordinator,
};
pub use engine::{
    create_conversation_engine, ConversationCommand, ConversationEngine, ConversationEvent,
    ConversationHandle,
};
pub use error::{ClientError, ClientResult};
pub use key_store::{load_private_key, FileKeyStore, MemoryKeyStore, SecureKeyStore};
pub use registration::register_account;
pub use types::*;

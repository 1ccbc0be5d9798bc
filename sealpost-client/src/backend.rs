//! The server operations the client depends on.

use crate::error::ClientResult;
use crate::types::{
    Contact, FileUpload, IncomingMessage, MessageId, OutgoingMessage, RegisterRequest, SendReceipt, Session,
    UserId,
};
use sealpost_crypto::PublicKeyPem;
use std::future::Future;

/// Message server operations.
///
/// [`crate::api_client::ChatApiClient`] implements this over HTTP; the
/// conversation engine and registration only see the trait.
pub trait ChatBackend: Send + Sync + 'static {
    /// Creates an account and returns its id.
    fn register(&self, request: RegisterRequest) -> impl Future<Output = ClientResult<UserId>> + Send;

    fn login(&self, email: &str, password: &str) -> impl Future<Output = ClientResult<Session>> + Send;

    /// Accounts the user can start a conversation with.
    fn list_contacts(&self) -> impl Future<Output = ClientResult<Vec<Contact>>> + Send;

    fn fetch_public_key(&self, user_id: UserId) -> impl Future<Output = ClientResult<PublicKeyPem>> + Send;

    fn send_message(&self, message: OutgoingMessage) -> impl Future<Output = ClientResult<SendReceipt>> + Send;

    /// Every message exchanged between `user_id` and `contact_id`.
    fn fetch_messages(
        &self,
        user_id: UserId,
        contact_id: UserId,
    ) -> impl Future<Output = ClientResult<Vec<IncomingMessage>>> + Send;

    fn upload_file(&self, upload: FileUpload) -> impl Future<Output = ClientResult<SendReceipt>> + Send;

    /// Raw envelope JSON for an attachment.
    fn download_file(&self, message_id: &MessageId) -> impl Future<Output = ClientResult<Vec<u8>>> + Send;
}

//! HTTP client for the message server.
//!
//! Thin reqwest adapter: JSON in, JSON out, optional bearer token after
//! login. No crypto happens here; envelopes pass through opaque.

use crate::backend::ChatBackend;
use crate::config::ClientConfig;
use crate::error::{ClientError, ClientResult};
use crate::types::*;
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use sealpost_crypto::PublicKeyPem;
use serde::Deserialize;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, warn};

#[derive(Default)]
struct AuthState {
    token: Option<String>,
    user_id: Option<UserId>,
}

/// HTTP client for the SealPost message server. Cheap to clone.
#[derive(Clone)]
pub struct ChatApiClient {
    client: Client,
    config: Arc<ClientConfig>,
    auth: Arc<RwLock<AuthState>>,
}

#[derive(Deserialize)]
struct RegisterResponse {
    #[serde(alias = "id")]
    user_id: UserId,
}

#[derive(Deserialize)]
struct PublicKeyResponse {
    public_key: PublicKeyPem,
}

impl ChatApiClient {
    pub fn new(config: ClientConfig) -> ClientResult<Self> {
        config.validate()?;
        let client = Client::builder().timeout(config.request_timeout()).build()?;

        Ok(Self {
            client,
            config: Arc::new(config),
            auth: Arc::new(RwLock::new(AuthState::default())),
        })
    }

    /// Restores a saved session.
    pub async fn set_session(&self, session: Session) {
        let mut auth = self.auth.write().await;
        auth.token = session.token;
        auth.user_id = Some(session.user_id);
    }

    pub async fn user_id(&self) -> Option<UserId> {
        self.auth.read().await.user_id
    }

    pub async fn is_authenticated(&self) -> bool {
        self.auth.read().await.user_id.is_some()
    }

    pub async fn logout(&self) {
        *self.auth.write().await = AuthState::default();
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.config.base_url(), path)
    }

    /// Attaches the bearer token, if the server issued one.
    async fn authed(&self, req: RequestBuilder) -> RequestBuilder {
        match &self.auth.read().await.token {
            Some(token) => req.bearer_auth(token),
            None => req,
        }
    }

    /// Maps error statuses onto [`ClientError`], reading the body for context.
    async fn check(resp: Response, what: &str) -> ClientResult<Response> {
        let status = resp.status();
        if status.is_success() {
            return Ok(resp);
        }
        let body = resp.text().await.unwrap_or_default();
        Err(match status {
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => ClientError::AuthRequired,
            StatusCode::NOT_FOUND => ClientError::NotFound(what.to_string()),
            _ => ClientError::Api(format!("{what}: {status} {body}")),
        })
    }
}

impl ChatBackend for ChatApiClient {
    async fn register(&self, request: RegisterRequest) -> ClientResult<UserId> {
        let resp = self.client.post(self.url("/register")).json(&request).send().await?;
        let data: RegisterResponse = Self::check(resp, "register").await?.json().await?;
        debug!("Registered account {}", data.user_id);
        Ok(data.user_id)
    }

    async fn login(&self, email: &str, password: &str) -> ClientResult<Session> {
        let resp = self
            .client
            .post(self.url("/login"))
            .json(&serde_json::json!({ "email": email, "password": password }))
            .send()
            .await?;
        let session: Session = Self::check(resp, "login").await?.json().await?;
        self.set_session(session.clone()).await;
        Ok(session)
    }

    async fn list_contacts(&self) -> ClientResult<Vec<Contact>> {
        let req = self.client.get(self.url("/users"));
        let resp = self.authed(req).await.send().await?;
        Ok(Self::check(resp, "list contacts").await?.json().await?)
    }

    async fn fetch_public_key(&self, user_id: UserId) -> ClientResult<PublicKeyPem> {
        let req = self.client.get(self.url(&format!("/public-key/{user_id}")));
        let resp = self.authed(req).await.send().await?;
        let data: PublicKeyResponse = Self::check(resp, &format!("public key for user {user_id}"))
            .await?
            .json()
            .await?;
        Ok(data.public_key)
    }

    async fn send_message(&self, message: OutgoingMessage) -> ClientResult<SendReceipt> {
        let req = self.client.post(self.url("/messages")).json(&message);
        let resp = self.authed(req).await.send().await?;
        Ok(Self::check(resp, "send message").await?.json().await?)
    }

    async fn fetch_messages(&self, user_id: UserId, contact_id: UserId) -> ClientResult<Vec<IncomingMessage>> {
        let req = self
            .client
            .get(self.url("/messages"))
            .query(&[("user_id", user_id), ("contact_id", contact_id)]);
        let resp = self.authed(req).await.send().await?;
        let items: Vec<serde_json::Value> = Self::check(resp, "fetch messages").await?.json().await?;

        // Items are decoded one by one so a malformed entry cannot hide the rest.
        let total = items.len();
        let messages: Vec<IncomingMessage> = items
            .into_iter()
            .filter_map(|item| match serde_json::from_value(item) {
                Ok(message) => Some(message),
                Err(e) => {
                    warn!("dropping malformed message listing item: {e}");
                    None
                }
            })
            .collect();
        debug!("fetched {} of {total} messages", messages.len());
        Ok(messages)
    }

    async fn upload_file(&self, upload: FileUpload) -> ClientResult<SendReceipt> {
        let req = self.client.post(self.url("/upload")).json(&upload);
        let resp = self.authed(req).await.send().await?;
        Ok(Self::check(resp, "upload file").await?.json().await?)
    }

    async fn download_file(&self, message_id: &MessageId) -> ClientResult<Vec<u8>> {
        let req = self.client.get(self.url(&format!("/files/{message_id}")));
        let resp = self.authed(req).await.send().await?;
        let bytes = Self::check(resp, &format!("file {message_id}")).await?.bytes().await?;
        Ok(bytes.to_vec())
    }
}

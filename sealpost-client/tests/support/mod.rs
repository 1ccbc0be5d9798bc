//! Shared test helpers: an in-memory message server and cached keypairs.
#![allow(dead_code)]

use chrono::{Duration, TimeZone, Utc};
use sealpost_client::{
    ChatBackend, ClientError, ClientResult, Contact, FileUpload, IncomingMessage, MessageBody,
    MessageId, OutgoingMessage, RegisterRequest, SendReceipt, Session, UserId,
};
use sealpost_crypto::{generate_keypair, Envelope, KeyPair, PayloadType, PublicKeyPem};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{LazyLock, Mutex};

/// RSA keygen is slow; generate each test identity once per binary.
pub static ALICE: LazyLock<KeyPair> = LazyLock::new(|| generate_keypair().unwrap());
pub static BOB: LazyLock<KeyPair> = LazyLock::new(|| generate_keypair().unwrap());

pub const ALICE_ID: UserId = 1;
pub const BOB_ID: UserId = 2;

/// Routes client logs to the test harness. Set `RUST_LOG` to see them.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("sealpost_client=warn")),
        )
        .with_test_writer()
        .try_init();
}

#[derive(Default)]
struct State {
    users: HashMap<UserId, (String, PublicKeyPem)>,
    messages: Vec<IncomingMessage>,
    files: HashMap<MessageId, Vec<u8>>,
    next_id: u64,
}

/// In-memory stand-in for the message server.
///
/// Ids are sequential and each stored message is one second later than the
/// previous one.
#[derive(Default)]
pub struct FakeServer {
    state: Mutex<State>,
    pub fetch_calls: AtomicUsize,
    pub fail_fetch: AtomicBool,
    /// Makes `fetch_messages` hang forever, like a server that never answers.
    pub stall_fetch: AtomicBool,
    pub reject_register: AtomicBool,
}

impl FakeServer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Server with Alice (1) and Bob (2) registered.
    pub fn alice_and_bob() -> Self {
        let server = Self::new();
        server.add_user(ALICE_ID, "alice@example.com", ALICE.public_key.clone());
        server.add_user(BOB_ID, "bob@example.com", BOB.public_key.clone());
        server
    }

    pub fn add_user(&self, id: UserId, email: &str, public_key: PublicKeyPem) {
        let mut state = self.state.lock().unwrap();
        state.users.insert(id, (email.to_string(), public_key));
        state.next_id = state.next_id.max(id as u64);
    }

    pub fn public_key_of(&self, id: UserId) -> Option<PublicKeyPem> {
        self.state.lock().unwrap().users.get(&id).map(|(_, pk)| pk.clone())
    }

    /// Stores a message as if `sender` had posted it.
    pub fn deliver(&self, sender: UserId, receiver: UserId, envelope: Envelope) -> MessageId {
        let message_type = envelope.payload_type();
        self.store(sender, receiver, message_type, MessageBody::Sealed(envelope), None)
    }

    /// Stores an attachment: the listing carries only the header, the blob
    /// is served from `/files`.
    pub fn deliver_attachment(
        &self,
        sender: UserId,
        receiver: UserId,
        envelope: Envelope,
        file_name: &str,
    ) -> MessageId {
        let blob = envelope.to_json_bytes().unwrap();
        let id = self.store(
            sender,
            receiver,
            envelope.payload_type(),
            MessageBody::Attachment(envelope.header()),
            Some(file_name.to_string()),
        );
        self.state.lock().unwrap().files.insert(id.clone(), blob);
        id
    }

    /// Stores a text message whose envelope could not be decoded.
    pub fn deliver_corrupt(&self, sender: UserId, receiver: UserId) -> MessageId {
        let body = MessageBody::Corrupt {
            listed: PayloadType::Text,
            reason: "unsupported envelope version 9".to_string(),
        };
        self.store(sender, receiver, PayloadType::Text, body, None)
    }

    /// Replaces a stored attachment blob.
    pub fn replace_file(&self, id: &MessageId, blob: Vec<u8>) {
        self.state.lock().unwrap().files.insert(id.clone(), blob);
    }

    pub fn message_count(&self) -> usize {
        self.state.lock().unwrap().messages.len()
    }

    pub fn messages(&self) -> Vec<IncomingMessage> {
        self.state.lock().unwrap().messages.clone()
    }

    fn store(
        &self,
        sender: UserId,
        receiver: UserId,
        message_type: PayloadType,
        envelope: MessageBody,
        file_name: Option<String>,
    ) -> MessageId {
        let mut state = self.state.lock().unwrap();
        state.next_id += 1;
        let id = MessageId::new(state.next_id.to_string());
        let base = Utc.with_ymd_and_hms(2024, 3, 1, 10, 0, 0).unwrap();
        let timestamp = base + Duration::seconds(state.next_id as i64);
        state.messages.push(IncomingMessage {
            id: id.clone(),
            sender_id: sender,
            receiver_id: receiver,
            timestamp,
            message_type,
            envelope,
            file_name,
        });
        id
    }

    fn receipt(&self, id: MessageId) -> SendReceipt {
        let state = self.state.lock().unwrap();
        let timestamp = state
            .messages
            .iter()
            .find(|m| m.id == id)
            .map(|m| m.timestamp)
            .unwrap();
        SendReceipt { id, timestamp }
    }
}

impl ChatBackend for FakeServer {
    async fn register(&self, request: RegisterRequest) -> ClientResult<UserId> {
        if self.reject_register.load(Ordering::SeqCst) {
            return Err(ClientError::Api("register: 400 email already taken".into()));
        }
        let id = {
            let mut state = self.state.lock().unwrap();
            state.next_id += 1;
            state.next_id as UserId
        };
        self.add_user(id, &request.email, request.public_key);
        Ok(id)
    }

    async fn login(&self, email: &str, _password: &str) -> ClientResult<Session> {
        let state = self.state.lock().unwrap();
        state
            .users
            .iter()
            .find(|(_, (e, _))| e == email)
            .map(|(id, _)| Session {
                user_id: *id,
                token: None,
            })
            .ok_or(ClientError::AuthRequired)
    }

    async fn list_contacts(&self) -> ClientResult<Vec<Contact>> {
        let state = self.state.lock().unwrap();
        Ok(state
            .users
            .iter()
            .map(|(id, (email, _))| Contact {
                id: *id,
                email: email.clone(),
            })
            .collect())
    }

    async fn fetch_public_key(&self, user_id: UserId) -> ClientResult<PublicKeyPem> {
        self.public_key_of(user_id)
            .ok_or_else(|| ClientError::NotFound(format!("public key for user {user_id}")))
    }

    async fn send_message(&self, message: OutgoingMessage) -> ClientResult<SendReceipt> {
        let id = self.deliver(message.sender_id, message.receiver_id, message.envelope);
        Ok(self.receipt(id))
    }

    async fn fetch_messages(&self, user_id: UserId, contact_id: UserId) -> ClientResult<Vec<IncomingMessage>> {
        self.fetch_calls.fetch_add(1, Ordering::SeqCst);
        if self.stall_fetch.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
        if self.fail_fetch.load(Ordering::SeqCst) {
            return Err(ClientError::Api("fetch messages: 503 Service Unavailable".into()));
        }
        let state = self.state.lock().unwrap();
        Ok(state
            .messages
            .iter()
            .filter(|m| {
                (m.sender_id == user_id && m.receiver_id == contact_id)
                    || (m.sender_id == contact_id && m.receiver_id == user_id)
            })
            .cloned()
            .collect())
    }

    async fn upload_file(&self, upload: FileUpload) -> ClientResult<SendReceipt> {
        let id = self.deliver_attachment(
            upload.sender_id,
            upload.receiver_id,
            upload.envelope,
            &upload.file_name,
        );
        Ok(self.receipt(id))
    }

    async fn download_file(&self, message_id: &MessageId) -> ClientResult<Vec<u8>> {
        self.state
            .lock()
            .unwrap()
            .files
            .get(message_id)
            .cloned()
            .ok_or_else(|| ClientError::NotFound(format!("file {message_id}")))
    }
}

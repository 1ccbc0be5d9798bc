//! Conversation engine.
//!
//! One event loop per open conversation that coordinates:
//! - Polling the server for new messages
//! - Decrypt batches on blocking workers, bounded by a semaphore
//! - Sending text and attachments
//! - Teardown when the conversation is closed
//!
//! The loop is the only writer of the conversation's
//! [`LazyDecryptionCoordinator`]. Handles read it for rendering.

use crate::backend::ChatBackend;
use crate::config::ClientConfig;
use crate::coordinator::{
    open_attachment, CoordinatorStats, DecryptJob, DecryptOutcome, DecryptState, DisplayLine,
    LazyDecryptionCoordinator,
};
use crate::error::{ClientError, ClientResult};
use crate::key_store::{load_private_key, SecureKeyStore};
use crate::types::{FileUpload, MessageBody, MessageId, OutgoingMessage, SendReceipt, UserId};
use sealpost_crypto::{CryptoError, EnvelopeEncoder, PayloadType, PrivateKey, PublicKey};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, watch, RwLock, Semaphore};
use tokio::task::JoinSet;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};
use zeroize::Zeroizing;

/// Commands accepted by the engine loop.
pub enum ConversationCommand {
    /// Poll now instead of waiting for the next tick.
    Refresh(oneshot::Sender<ClientResult<usize>>),
    DecryptAll,
    Decrypt(MessageId),
    OpenAttachment {
        id: MessageId,
        reply: oneshot::Sender<ClientResult<Zeroizing<Vec<u8>>>>,
    },
    SendText {
        text: Zeroizing<String>,
        reply: oneshot::Sender<ClientResult<SendReceipt>>,
    },
    SendFile {
        bytes: Zeroizing<Vec<u8>>,
        payload_type: PayloadType,
        file_name: String,
        reply: oneshot::Sender<ClientResult<SendReceipt>>,
    },
    Stop,
}

/// Notifications for the UI layer.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ConversationEvent {
    /// A poll brought in `count` new messages.
    MessagesArrived { count: usize },
    /// A decrypt job finished for a message.
    Resolved { id: MessageId, state: DecryptState },
    PollFailed { error: String },
    Stopped,
}

/// Handle for driving a running conversation. Cheap to clone; the engine
/// stops once every handle is dropped.
#[derive(Clone)]
pub struct ConversationHandle {
    command_tx: mpsc::Sender<ConversationCommand>,
    /// Set on stop so an in-flight poll is abandoned instead of awaited.
    stop_tx: Arc<watch::Sender<bool>>,
    coordinator: Arc<RwLock<LazyDecryptionCoordinator>>,
}

impl ConversationHandle {
    async fn send(&self, cmd: ConversationCommand) -> ClientResult<()> {
        self.command_tx
            .send(cmd)
            .await
            .map_err(|_| ClientError::EngineStopped)
    }

    async fn request<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<ClientResult<T>>) -> ConversationCommand,
    ) -> ClientResult<T> {
        let (tx, rx) = oneshot::channel();
        self.send(make(tx)).await?;
        rx.await.map_err(|_| ClientError::EngineStopped)?
    }

    pub async fn stop(&self) -> ClientResult<()> {
        self.stop_tx.send_replace(true);
        self.send(ConversationCommand::Stop).await
    }

    /// Polls immediately. Returns how many messages were new.
    pub async fn refresh(&self) -> ClientResult<usize> {
        self.request(ConversationCommand::Refresh).await
    }

    /// Starts decrypting every message still showing as ciphertext.
    pub async fn decrypt_all(&self) -> ClientResult<()> {
        self.send(ConversationCommand::DecryptAll).await
    }

    pub async fn decrypt(&self, id: MessageId) -> ClientResult<()> {
        self.send(ConversationCommand::Decrypt(id)).await
    }

    /// Downloads and decrypts an attachment whose key has been verified.
    pub async fn open_attachment(&self, id: MessageId) -> ClientResult<Zeroizing<Vec<u8>>> {
        self.request(|reply| ConversationCommand::OpenAttachment { id, reply })
            .await
    }

    pub async fn send_text(&self, text: impl Into<String>) -> ClientResult<SendReceipt> {
        let text = Zeroizing::new(text.into());
        self.request(|reply| ConversationCommand::SendText { text, reply })
            .await
    }

    pub async fn send_file(
        &self,
        bytes: Vec<u8>,
        payload_type: PayloadType,
        file_name: impl Into<String>,
    ) -> ClientResult<SendReceipt> {
        let bytes = Zeroizing::new(bytes);
        let file_name = file_name.into();
        self.request(|reply| ConversationCommand::SendFile {
            bytes,
            payload_type,
            file_name,
            reply,
        })
        .await
    }

    /// The conversation as it should be rendered right now.
    pub async fn snapshot(&self) -> Vec<DisplayLine> {
        self.coordinator.read().await.lines()
    }

    pub async fn state(&self, id: &MessageId) -> Option<DecryptState> {
        self.coordinator.read().await.state(id)
    }

    pub async fn stats(&self) -> CoordinatorStats {
        self.coordinator.read().await.stats()
    }
}

/// Per-conversation event loop.
pub struct ConversationEngine<B: ChatBackend> {
    backend: Arc<B>,
    key_store: Arc<dyn SecureKeyStore>,
    encoder: EnvelopeEncoder,
    config: ClientConfig,
    local_user: UserId,
    contact: UserId,
    coordinator: Arc<RwLock<LazyDecryptionCoordinator>>,
    workers: Arc<Semaphore>,
    command_rx: mpsc::Receiver<ConversationCommand>,
    stop_rx: watch::Receiver<bool>,
    event_tx: mpsc::Sender<ConversationEvent>,
    /// The contact's public key, fetched on first send.
    peer_key: Option<PublicKey>,
}

/// Creates a conversation engine between `local_user` and `contact`, and
/// its command handle.
pub fn create_conversation_engine<B: ChatBackend>(
    backend: Arc<B>,
    key_store: Arc<dyn SecureKeyStore>,
    encoder: EnvelopeEncoder,
    config: ClientConfig,
    local_user: UserId,
    contact: UserId,
    event_tx: mpsc::Sender<ConversationEvent>,
) -> ClientResult<(ConversationHandle, ConversationEngine<B>)> {
    config.validate()?;
    let (command_tx, command_rx) = mpsc::channel(64);
    let (stop_tx, stop_rx) = watch::channel(false);
    let coordinator = Arc::new(RwLock::new(LazyDecryptionCoordinator::new(local_user)));

    let handle = ConversationHandle {
        command_tx,
        stop_tx: Arc::new(stop_tx),
        coordinator: Arc::clone(&coordinator),
    };

    let engine = ConversationEngine {
        backend,
        key_store,
        encoder,
        workers: Arc::new(Semaphore::new(config.max_decrypt_workers)),
        config,
        local_user,
        contact,
        coordinator,
        command_rx,
        stop_rx,
        event_tx,
        peer_key: None,
    };

    Ok((handle, engine))
}

impl<B: ChatBackend> ConversationEngine<B> {
    /// Runs until stopped or until every handle is dropped.
    pub async fn run(&mut self) {
        info!(
            "conversation engine started: user {} with {}",
            self.local_user, self.contact
        );

        let mut poll_interval = tokio::time::interval(self.config.poll_interval());
        poll_interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut jobs: JoinSet<DecryptOutcome> = JoinSet::new();
        let mut stop_rx = self.stop_rx.clone();

        loop {
            tokio::select! {
                _ = poll_interval.tick() => {
                    tokio::select! {
                        _ = self.poll_once() => {}
                        _ = stop_rx.changed() => {
                            info!("conversation engine stopping, poll abandoned");
                            break;
                        }
                    }
                }
                Some(joined) = jobs.join_next(), if !jobs.is_empty() => {
                    match joined {
                        Ok(outcome) => self.apply(outcome).await,
                        Err(e) if e.is_cancelled() => {}
                        Err(e) => warn!("decrypt task failed: {e}"),
                    }
                }
                cmd = self.command_rx.recv() => {
                    match cmd {
                        Some(ConversationCommand::Stop) => {
                            info!("conversation engine stopping");
                            break;
                        }
                        Some(ConversationCommand::Refresh(reply)) => {
                            tokio::select! {
                                result = self.poll_once() => {
                                    let _ = reply.send(result);
                                }
                                _ = stop_rx.changed() => {
                                    let _ = reply.send(Err(ClientError::EngineStopped));
                                    info!("conversation engine stopping, poll abandoned");
                                    break;
                                }
                            }
                        }
                        Some(ConversationCommand::DecryptAll) => {
                            let batch = self.coordinator.write().await.begin_decrypt_all();
                            self.dispatch(batch, &mut jobs).await;
                        }
                        Some(ConversationCommand::Decrypt(id)) => {
                            let batch: Vec<DecryptJob> =
                                self.coordinator.write().await.begin_decrypt(&id).into_iter().collect();
                            self.dispatch(batch, &mut jobs).await;
                        }
                        Some(ConversationCommand::OpenAttachment { id, reply }) => {
                            let _ = reply.send(self.open_attachment(&id).await);
                        }
                        Some(ConversationCommand::SendText { text, reply }) => {
                            let _ = reply.send(self.send_text(text).await);
                        }
                        Some(ConversationCommand::SendFile { bytes, payload_type, file_name, reply }) => {
                            let _ = reply.send(self.send_file(bytes, payload_type, file_name).await);
                        }
                        None => {
                            info!("all conversation handles dropped, stopping engine");
                            break;
                        }
                    }
                }
            }
        }

        jobs.abort_all();
        self.coordinator.write().await.teardown();
        self.peer_key = None;
        self.emit(ConversationEvent::Stopped);
        info!("conversation engine stopped");
    }

    fn emit(&self, event: ConversationEvent) {
        if let Err(e) = self.event_tx.try_send(event) {
            debug!("conversation event dropped: {e}");
        }
    }

    /// Fetches and ingests the conversation. Failures are logged and
    /// reported as [`ConversationEvent::PollFailed`].
    async fn poll_once(&self) -> ClientResult<usize> {
        let result = self.fetch_and_ingest().await;
        if let Err(e) = &result {
            warn!("poll failed: {e}");
            self.emit(ConversationEvent::PollFailed { error: e.to_string() });
        }
        result
    }

    async fn fetch_and_ingest(&self) -> ClientResult<usize> {
        let batch = self
            .backend
            .fetch_messages(self.local_user, self.contact)
            .await?;
        let added = self.coordinator.write().await.ingest(batch);
        if added > 0 {
            debug!("ingested {added} new messages");
            self.emit(ConversationEvent::MessagesArrived { count: added });
        }
        Ok(added)
    }

    async fn load_key(&self) -> ClientResult<Arc<PrivateKey>> {
        let store = Arc::clone(&self.key_store);
        let key = tokio::task::spawn_blocking(move || load_private_key(store.as_ref())).await??;
        Ok(Arc::new(key))
    }

    /// Spawns a decrypt batch. The private key is loaded once and shared by
    /// this batch's jobs only.
    async fn dispatch(&mut self, batch: Vec<DecryptJob>, jobs: &mut JoinSet<DecryptOutcome>) {
        if batch.is_empty() {
            return;
        }

        let key = match self.load_key().await {
            Ok(key) => key,
            Err(e) => {
                warn!("cannot decrypt {} messages: {e}", batch.len());
                for job in batch {
                    let outcome = job.fail(CryptoError::InvalidKey(e.to_string()));
                    self.apply(outcome).await;
                }
                return;
            }
        };

        debug!("dispatching {} decrypt jobs", batch.len());
        for job in batch {
            let key = Arc::clone(&key);
            let encoder = self.encoder.clone();
            let workers = Arc::clone(&self.workers);
            let generation = job.generation();
            let message_id = job.message_id().clone();

            jobs.spawn(async move {
                let permit = match workers.acquire_owned().await {
                    Ok(permit) => permit,
                    Err(e) => return job.fail(CryptoError::Decryption(e.to_string())),
                };
                let run = tokio::task::spawn_blocking(move || {
                    let _permit = permit;
                    job.run(&encoder, &key)
                });
                match run.await {
                    Ok(outcome) => outcome,
                    Err(e) => DecryptOutcome::failed(
                        generation,
                        message_id,
                        CryptoError::Decryption(format!("decrypt worker failed: {e}")),
                    ),
                }
            });
        }
    }

    async fn apply(&self, outcome: DecryptOutcome) {
        let id = outcome.message_id().clone();
        let mut coordinator = self.coordinator.write().await;
        if coordinator.complete(outcome) {
            if let Some(state) = coordinator.state(&id) {
                drop(coordinator);
                self.emit(ConversationEvent::Resolved { id, state });
            }
        }
    }

    async fn open_attachment(&self, id: &MessageId) -> ClientResult<Zeroizing<Vec<u8>>> {
        let (header, inline) = {
            let coordinator = self.coordinator.read().await;
            let message = coordinator
                .message(id)
                .ok_or_else(|| ClientError::NotFound(format!("message {id}")))?;
            if !coordinator.is_attachment_ready(id) {
                return Err(ClientError::NotReady(format!(
                    "attachment {id} has not been decrypted"
                )));
            }
            match &message.envelope {
                MessageBody::Sealed(env) => (env.header(), Some(env.to_json_bytes()?)),
                MessageBody::Attachment(header) => (header.clone(), None),
                MessageBody::Corrupt { reason, .. } => {
                    return Err(CryptoError::InvalidEnvelope(reason.clone()).into());
                }
            }
        };

        let blob = match inline {
            Some(blob) => blob,
            None => self.backend.download_file(id).await?,
        };
        let key = self.load_key().await?;
        let encoder = self.encoder.clone();
        tokio::task::spawn_blocking(move || open_attachment(&header, &blob, &encoder, &key)).await?
    }

    async fn peer_key(&mut self) -> ClientResult<PublicKey> {
        if let Some(key) = &self.peer_key {
            return Ok(key.clone());
        }
        let pem = self.backend.fetch_public_key(self.contact).await?;
        let key = pem.parse()?;
        self.peer_key = Some(key.clone());
        Ok(key)
    }

    async fn send_text(&mut self, text: Zeroizing<String>) -> ClientResult<SendReceipt> {
        let recipient = self.peer_key().await?;
        let encoder = self.encoder.clone();
        let (envelope, text) = tokio::task::spawn_blocking(move || {
            encoder.seal_text(&text, &recipient).map(|env| (env, text))
        })
        .await??;

        let receipt = self
            .backend
            .send_message(OutgoingMessage {
                sender_id: self.local_user,
                receiver_id: self.contact,
                message_type: PayloadType::Text,
                envelope,
            })
            .await?;
        debug!("sent message {}", receipt.id);

        if self.config.retain_sent_plaintext {
            self.coordinator
                .write()
                .await
                .record_sent(receipt.id.clone(), text);
        }
        self.refresh_after_send().await;
        Ok(receipt)
    }

    async fn send_file(
        &mut self,
        bytes: Zeroizing<Vec<u8>>,
        payload_type: PayloadType,
        file_name: String,
    ) -> ClientResult<SendReceipt> {
        let recipient = self.peer_key().await?;
        let encoder = self.encoder.clone();
        let envelope =
            tokio::task::spawn_blocking(move || encoder.seal_file(&bytes, payload_type, &recipient))
                .await??;

        let receipt = self
            .backend
            .upload_file(FileUpload {
                sender_id: self.local_user,
                receiver_id: self.contact,
                message_type: payload_type,
                file_name: file_name.clone(),
                envelope,
            })
            .await?;
        debug!("uploaded attachment {}", receipt.id);

        if self.config.retain_sent_plaintext {
            let label = match payload_type {
                PayloadType::Image => format!("[Image: {file_name}]"),
                _ => format!("[File: {file_name}]"),
            };
            self.coordinator
                .write()
                .await
                .record_sent(receipt.id.clone(), Zeroizing::new(label));
        }
        self.refresh_after_send().await;
        Ok(receipt)
    }

    async fn refresh_after_send(&mut self) {
        let _ = self.poll_once().await;
    }
}

//! Lazy, user-triggered decryption of a conversation.
//!
//! Messages arrive as ciphertext and stay that way until the user asks for
//! them to be decrypted. Each peer message moves through
//! `Ciphertext -> Decrypting -> {Decrypted | Failed}`; both end states are
//! terminal and cached, so a resolved message never runs crypto again.
//! Messages the local user sent are `Own` and never enter the machine,
//! since their envelopes are wrapped for the recipient only.
//!
//! The coordinator itself does no I/O and no crypto. It hands out
//! [`DecryptJob`]s, which the caller runs wherever it likes (inline through
//! [`LazyDecryptionCoordinator::decrypt_all_with`], or on blocking workers in
//! the conversation engine), and takes back [`DecryptOutcome`]s through
//! [`LazyDecryptionCoordinator::complete`].

use crate::error::{ClientError, ClientResult};
use crate::types::{IncomingMessage, MessageBody, MessageId, UserId};
use chrono::{DateTime, Utc};
use sealpost_crypto::{
    CryptoError, CryptoResult, Envelope, EnvelopeEncoder, EnvelopeHeader, PayloadType, PrivateKey,
};
use std::borrow::Cow;
use std::collections::HashMap;
use tracing::{debug, warn};
use zeroize::Zeroizing;

pub const PLACEHOLDER_FAILED: &str = "[Decryption Failed]";
pub const PLACEHOLDER_ENCRYPTED: &str = "[Encrypted message]";
pub const PLACEHOLDER_DECRYPTING: &str = "[Decrypting...]";
pub const PLACEHOLDER_IMAGE: &str = "[Image]";
pub const PLACEHOLDER_SENT: &str = "[Sent, encrypted]";

/// Where a message is in the decryption lifecycle.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum DecryptState {
    /// Authored by the local user; not decryptable here.
    Own,
    Ciphertext,
    Decrypting,
    Decrypted,
    Failed,
}

impl DecryptState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, DecryptState::Decrypted | DecryptState::Failed)
    }
}

enum CacheEntry {
    Text(Zeroizing<String>),
    /// Attachment whose key unwraps under the local private key.
    Ready,
    Failed,
}

/// Resolved results per message. Memory only; dropped on teardown.
#[derive(Default)]
pub struct DecryptionCache {
    entries: HashMap<MessageId, CacheEntry>,
}

impl DecryptionCache {
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, id: &MessageId) -> bool {
        self.entries.contains_key(id)
    }

    fn get(&self, id: &MessageId) -> Option<&CacheEntry> {
        self.entries.get(id)
    }

    fn insert(&mut self, id: MessageId, entry: CacheEntry) {
        self.entries.insert(id, entry);
    }

    fn clear(&mut self) {
        self.entries.clear();
    }
}

/// What a job has to do for one message.
#[derive(Clone, Debug)]
enum DecryptWork {
    OpenText(Envelope),
    VerifyKey(EnvelopeHeader),
    /// Nothing to decrypt: the listing's envelope was unusable.
    Unreadable(String),
}

impl DecryptWork {
    fn for_body(body: &MessageBody) -> Self {
        match body {
            MessageBody::Sealed(env) if env.payload_type() == PayloadType::Text => {
                DecryptWork::OpenText(env.clone())
            }
            MessageBody::Sealed(env) => DecryptWork::VerifyKey(env.header()),
            MessageBody::Attachment(header) if header.payload_type().is_attachment() => {
                DecryptWork::VerifyKey(header.clone())
            }
            MessageBody::Attachment(_) => {
                DecryptWork::Unreadable("text message listed without ciphertext".to_string())
            }
            MessageBody::Corrupt { reason, .. } => DecryptWork::Unreadable(reason.clone()),
        }
    }
}

/// A unit of decryption work, detached from the coordinator so it can run
/// on another thread.
#[derive(Clone, Debug)]
pub struct DecryptJob {
    generation: u64,
    message_id: MessageId,
    work: DecryptWork,
}

impl DecryptJob {
    pub fn message_id(&self) -> &MessageId {
        &self.message_id
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Runs the crypto. CPU-bound; may take milliseconds per message.
    pub fn run(self, encoder: &EnvelopeEncoder, private_key: &PrivateKey) -> DecryptOutcome {
        let result = match &self.work {
            DecryptWork::OpenText(env) => encoder.open_text(env, private_key).map(Decrypted::Text),
            DecryptWork::VerifyKey(header) => encoder.verify_key(header, private_key).map(|()| Decrypted::Ready),
            DecryptWork::Unreadable(reason) => Err(CryptoError::InvalidEnvelope(reason.clone())),
        };
        DecryptOutcome {
            generation: self.generation,
            message_id: self.message_id,
            result,
        }
    }

    /// Resolves the job as failed without running it.
    pub fn fail(self, error: CryptoError) -> DecryptOutcome {
        DecryptOutcome::failed(self.generation, self.message_id, error)
    }
}

/// Successful decryption result.
pub enum Decrypted {
    Text(Zeroizing<String>),
    Ready,
}

/// The result of a [`DecryptJob`], fed back through
/// [`LazyDecryptionCoordinator::complete`].
pub struct DecryptOutcome {
    generation: u64,
    message_id: MessageId,
    result: CryptoResult<Decrypted>,
}

impl DecryptOutcome {
    /// An outcome for a job that never produced one (worker panicked or was
    /// refused a slot).
    pub(crate) fn failed(generation: u64, message_id: MessageId, error: CryptoError) -> Self {
        Self {
            generation,
            message_id,
            result: Err(error),
        }
    }

    pub fn message_id(&self) -> &MessageId {
        &self.message_id
    }

    pub fn is_success(&self) -> bool {
        self.result.is_ok()
    }
}

/// Counters for crypto work, cumulative across teardowns.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CoordinatorStats {
    pub jobs_issued: u64,
    pub decrypted: u64,
    pub failed: u64,
}

/// One rendered row of a conversation.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DisplayLine {
    pub id: MessageId,
    pub sender_id: UserId,
    pub timestamp: DateTime<Utc>,
    pub payload_type: PayloadType,
    pub state: DecryptState,
    pub text: String,
}

struct Tracked {
    message: IncomingMessage,
    state: DecryptState,
}

/// Per-conversation decryption state machine and cache.
pub struct LazyDecryptionCoordinator {
    local_user: UserId,
    messages: HashMap<MessageId, Tracked>,
    /// Ids sorted by `(timestamp, id)`.
    order: Vec<MessageId>,
    cache: DecryptionCache,
    sent_plaintext: HashMap<MessageId, Zeroizing<String>>,
    generation: u64,
    stats: CoordinatorStats,
}

impl LazyDecryptionCoordinator {
    pub fn new(local_user: UserId) -> Self {
        Self {
            local_user,
            messages: HashMap::new(),
            order: Vec::new(),
            cache: DecryptionCache::default(),
            sent_plaintext: HashMap::new(),
            generation: 0,
            stats: CoordinatorStats::default(),
        }
    }

    pub fn local_user(&self) -> UserId {
        self.local_user
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn stats(&self) -> CoordinatorStats {
        self.stats
    }

    pub fn cache(&self) -> &DecryptionCache {
        &self.cache
    }

    /// Current job generation. Bumped by [`Self::teardown`].
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Merges a poll batch. Known ids are left untouched. Returns how many
    /// messages were new.
    pub fn ingest(&mut self, batch: impl IntoIterator<Item = IncomingMessage>) -> usize {
        let mut added = 0;
        for message in batch {
            if self.messages.contains_key(&message.id) {
                continue;
            }
            let state = if message.sender_id == self.local_user {
                DecryptState::Own
            } else {
                DecryptState::Ciphertext
            };
            self.order.push(message.id.clone());
            self.messages.insert(message.id.clone(), Tracked { message, state });
            added += 1;
        }

        if added > 0 {
            let messages = &self.messages;
            self.order.sort_by(|a, b| {
                let ta = messages[a].message.timestamp;
                let tb = messages[b].message.timestamp;
                ta.cmp(&tb).then_with(|| a.cmp(b))
            });
        }
        added
    }

    /// Remembers what the local user sent so it can be shown in place of
    /// the undecryptable envelope.
    pub fn record_sent(&mut self, id: MessageId, plaintext: Zeroizing<String>) {
        self.sent_plaintext.insert(id, plaintext);
    }

    /// Issues jobs for every peer message still in `Ciphertext`.
    pub fn begin_decrypt_all(&mut self) -> Vec<DecryptJob> {
        let pending: Vec<MessageId> = self
            .order
            .iter()
            .filter(|id| self.state(id) == Some(DecryptState::Ciphertext))
            .cloned()
            .collect();

        pending.iter().filter_map(|id| self.issue(id)).collect()
    }

    /// Issues a job for one message, if it is still in `Ciphertext`.
    pub fn begin_decrypt(&mut self, id: &MessageId) -> Option<DecryptJob> {
        self.issue(id)
    }

    fn issue(&mut self, id: &MessageId) -> Option<DecryptJob> {
        let tracked = self.messages.get_mut(id)?;
        if tracked.state != DecryptState::Ciphertext {
            return None;
        }
        tracked.state = DecryptState::Decrypting;
        self.stats.jobs_issued += 1;
        Some(DecryptJob {
            generation: self.generation,
            message_id: id.clone(),
            work: DecryptWork::for_body(&tracked.message.envelope),
        })
    }

    /// Applies a job result. Returns `false` when the outcome was discarded:
    /// issued before the last teardown, or for a message no longer in
    /// `Decrypting`.
    pub fn complete(&mut self, outcome: DecryptOutcome) -> bool {
        if outcome.generation != self.generation {
            debug!("Discarding stale outcome for message {}", outcome.message_id);
            return false;
        }
        let Some(tracked) = self.messages.get_mut(&outcome.message_id) else {
            return false;
        };
        if tracked.state != DecryptState::Decrypting {
            return false;
        }

        match outcome.result {
            Ok(decrypted) => {
                tracked.state = DecryptState::Decrypted;
                let entry = match decrypted {
                    Decrypted::Text(text) => CacheEntry::Text(text),
                    Decrypted::Ready => CacheEntry::Ready,
                };
                self.cache.insert(outcome.message_id, entry);
                self.stats.decrypted += 1;
            }
            Err(e) => {
                warn!("Decryption failed for message {}: {e}", outcome.message_id);
                tracked.state = DecryptState::Failed;
                self.cache.insert(outcome.message_id, CacheEntry::Failed);
                self.stats.failed += 1;
            }
        }
        true
    }

    /// Decrypts every pending message inline. Returns how many were resolved.
    pub fn decrypt_all_with(&mut self, encoder: &EnvelopeEncoder, private_key: &PrivateKey) -> usize {
        let mut resolved = 0;
        for job in self.begin_decrypt_all() {
            if self.complete(job.run(encoder, private_key)) {
                resolved += 1;
            }
        }
        resolved
    }

    /// Drops all messages, cached plaintext, and pending work. Outcomes of
    /// jobs issued before this call are ignored afterwards.
    pub fn teardown(&mut self) {
        self.generation += 1;
        self.messages.clear();
        self.order.clear();
        self.cache.clear();
        self.sent_plaintext.clear();
    }

    pub fn state(&self, id: &MessageId) -> Option<DecryptState> {
        self.messages.get(id).map(|t| t.state)
    }

    pub fn message(&self, id: &MessageId) -> Option<&IncomingMessage> {
        self.messages.get(id).map(|t| &t.message)
    }

    /// True once an attachment's key has been confirmed to unwrap.
    pub fn is_attachment_ready(&self, id: &MessageId) -> bool {
        matches!(self.cache.get(id), Some(CacheEntry::Ready))
    }

    /// What to render for a message.
    pub fn display_text(&self, id: &MessageId) -> Option<Cow<'_, str>> {
        let tracked = self.messages.get(id)?;
        let text = match tracked.state {
            DecryptState::Own => match self.sent_plaintext.get(id) {
                Some(plain) => Cow::Borrowed(plain.as_str()),
                None => Cow::Borrowed(PLACEHOLDER_SENT),
            },
            DecryptState::Ciphertext => Cow::Borrowed(PLACEHOLDER_ENCRYPTED),
            DecryptState::Decrypting => Cow::Borrowed(PLACEHOLDER_DECRYPTING),
            DecryptState::Failed => Cow::Borrowed(PLACEHOLDER_FAILED),
            DecryptState::Decrypted => match self.cache.get(id) {
                Some(CacheEntry::Text(plain)) => Cow::Borrowed(plain.as_str()),
                Some(CacheEntry::Ready) => attachment_label(&tracked.message),
                Some(CacheEntry::Failed) | None => Cow::Borrowed(PLACEHOLDER_FAILED),
            },
        };
        Some(text)
    }

    /// The whole conversation in display order.
    pub fn lines(&self) -> Vec<DisplayLine> {
        self.order
            .iter()
            .filter_map(|id| {
                let tracked = self.messages.get(id)?;
                Some(DisplayLine {
                    id: id.clone(),
                    sender_id: tracked.message.sender_id,
                    timestamp: tracked.message.timestamp,
                    payload_type: tracked.message.message_type,
                    state: tracked.state,
                    text: self.display_text(id)?.into_owned(),
                })
            })
            .collect()
    }
}

fn attachment_label(message: &IncomingMessage) -> Cow<'static, str> {
    match message.message_type {
        PayloadType::Image => Cow::Borrowed(PLACEHOLDER_IMAGE),
        _ => Cow::Owned(format!(
            "[File: {}]",
            message.file_name.as_deref().unwrap_or("unnamed")
        )),
    }
}

/// Opens a downloaded attachment blob.
///
/// The blob must carry the same key material as the header the message was
/// listed with; a server swapping blobs between messages is rejected.
pub fn open_attachment(
    listed: &EnvelopeHeader,
    blob: &[u8],
    encoder: &EnvelopeEncoder,
    private_key: &PrivateKey,
) -> ClientResult<Zeroizing<Vec<u8>>> {
    let envelope = Envelope::from_json_bytes(blob)?;
    if envelope.header() != *listed {
        return Err(ClientError::Crypto(CryptoError::InvalidEnvelope(
            "attachment does not match its listing".to_string(),
        )));
    }
    Ok(encoder.open_file(&envelope, private_key)?)
}

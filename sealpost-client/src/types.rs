//! Wire types for the message server API.

use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use sealpost_crypto::{Envelope, EnvelopeHeader, PayloadType, PublicKeyPem};
use serde::{de, Deserialize, Deserializer, Serialize};
use std::fmt;

/// Server-assigned account identifier.
pub type UserId = i64;

/// Server-assigned message identifier. Opaque to the client.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(transparent)]
pub struct MessageId(String);

impl MessageId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for MessageId {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

/// The server may hand ids out as integers or strings.
impl<'de> Deserialize<'de> for MessageId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct IdVisitor;
        impl<'de> de::Visitor<'de> for IdVisitor {
            type Value = MessageId;
            fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
                f.write_str("a string or integer message id")
            }
            fn visit_u64<E: de::Error>(self, v: u64) -> Result<MessageId, E> { Ok(MessageId(v.to_string())) }
            fn visit_i64<E: de::Error>(self, v: i64) -> Result<MessageId, E> { Ok(MessageId(v.to_string())) }
            fn visit_str<E: de::Error>(self, v: &str) -> Result<MessageId, E> { Ok(MessageId(v.to_string())) }
        }
        deserializer.deserialize_any(IdVisitor)
    }
}

/// Accepts RFC 3339, a naive `YYYY-MM-DD[T ]HH:MM:SS[.f]` (taken as UTC),
/// or unix seconds.
fn deserialize_timestamp<'de, D>(deserializer: D) -> Result<DateTime<Utc>, D::Error>
where
    D: Deserializer<'de>,
{
    struct TimestampVisitor;
    impl<'de> de::Visitor<'de> for TimestampVisitor {
        type Value = DateTime<Utc>;
        fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
            f.write_str("an ISO-8601 timestamp or unix seconds")
        }
        fn visit_i64<E: de::Error>(self, v: i64) -> Result<Self::Value, E> {
            Utc.timestamp_opt(v, 0)
                .single()
                .ok_or_else(|| E::custom(format!("timestamp out of range: {v}")))
        }
        fn visit_u64<E: de::Error>(self, v: u64) -> Result<Self::Value, E> {
            let secs = i64::try_from(v).map_err(E::custom)?;
            self.visit_i64(secs)
        }
        fn visit_str<E: de::Error>(self, v: &str) -> Result<Self::Value, E> {
            if let Ok(dt) = DateTime::parse_from_rfc3339(v) {
                return Ok(dt.with_timezone(&Utc));
            }
            ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"]
                .iter()
                .find_map(|fmt| NaiveDateTime::parse_from_str(v, fmt).ok())
                .map(|naive| naive.and_utc())
                .ok_or_else(|| E::custom(format!("unrecognized timestamp: {v}")))
        }
    }
    deserializer.deserialize_any(TimestampVisitor)
}

/// What a message listing carries in its `envelope` field.
///
/// The variant follows the listed `message_type`: text messages arrive as
/// full envelopes, attachments as a header only (their ciphertext is
/// fetched separately). An envelope that does not decode, or whose own type
/// tag disagrees with the listing, is kept as `Corrupt` so the rest of the
/// conversation still renders.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum MessageBody {
    Sealed(Envelope),
    Attachment(EnvelopeHeader),
    Corrupt { listed: PayloadType, reason: String },
}

impl MessageBody {
    /// Decodes the raw `envelope` field of a listing item.
    pub fn from_listing(message_type: PayloadType, raw: serde_json::Value) -> Self {
        let decoded = if message_type.is_attachment() {
            serde_json::from_value::<EnvelopeHeader>(raw).map(MessageBody::Attachment)
        } else {
            serde_json::from_value::<Envelope>(raw).map(MessageBody::Sealed)
        };
        match decoded {
            Ok(body) if body.payload_type() == message_type => body,
            Ok(body) => MessageBody::Corrupt {
                listed: message_type,
                reason: format!(
                    "{} envelope listed as {message_type}",
                    body.payload_type()
                ),
            },
            Err(e) => MessageBody::Corrupt {
                listed: message_type,
                reason: e.to_string(),
            },
        }
    }

    pub fn payload_type(&self) -> PayloadType {
        match self {
            MessageBody::Sealed(env) => env.payload_type(),
            MessageBody::Attachment(header) => header.payload_type(),
            MessageBody::Corrupt { listed, .. } => *listed,
        }
    }
}

/// One item of a message listing, as the server sends it.
#[derive(Deserialize)]
struct WireIncomingMessage {
    id: MessageId,
    sender_id: UserId,
    receiver_id: UserId,
    #[serde(deserialize_with = "deserialize_timestamp")]
    timestamp: DateTime<Utc>,
    message_type: PayloadType,
    envelope: serde_json::Value,
    #[serde(default)]
    file_name: Option<String>,
}

impl From<WireIncomingMessage> for IncomingMessage {
    fn from(wire: WireIncomingMessage) -> Self {
        Self {
            envelope: MessageBody::from_listing(wire.message_type, wire.envelope),
            id: wire.id,
            sender_id: wire.sender_id,
            receiver_id: wire.receiver_id,
            timestamp: wire.timestamp,
            message_type: wire.message_type,
            file_name: wire.file_name,
        }
    }
}

/// One item of a message listing.
///
/// Deserialization fails only on malformed metadata; a bad envelope becomes
/// [`MessageBody::Corrupt`].
#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(from = "WireIncomingMessage")]
pub struct IncomingMessage {
    pub id: MessageId,
    pub sender_id: UserId,
    pub receiver_id: UserId,
    pub timestamp: DateTime<Utc>,
    pub message_type: PayloadType,
    pub envelope: MessageBody,
    pub file_name: Option<String>,
}

/// Body of `POST /messages`.
#[derive(Clone, Debug, Serialize)]
pub struct OutgoingMessage {
    pub sender_id: UserId,
    pub receiver_id: UserId,
    pub message_type: PayloadType,
    pub envelope: Envelope,
}

/// Body of `POST /upload`.
#[derive(Clone, Debug, Serialize)]
pub struct FileUpload {
    pub sender_id: UserId,
    pub receiver_id: UserId,
    pub message_type: PayloadType,
    pub file_name: String,
    pub envelope: Envelope,
}

/// What the server returns for an accepted message or upload.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SendReceipt {
    pub id: MessageId,
    #[serde(deserialize_with = "deserialize_timestamp")]
    pub timestamp: DateTime<Utc>,
}

/// Body of `POST /register`.
#[derive(Clone, Debug, Serialize)]
pub struct RegisterRequest {
    pub email: String,
    pub password: String,
    pub public_key: PublicKeyPem,
}

/// Another account that can be messaged.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Contact {
    pub id: UserId,
    pub email: String,
}

/// An authenticated session.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    pub user_id: UserId,
    #[serde(default)]
    pub token: Option<String>,
}

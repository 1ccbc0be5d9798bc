//! Hybrid envelopes: one fresh AES-256-GCM key per payload, wrapped under the
//! recipient's RSA public key.
//!
//! Wire form (JSON, standard padded base64):
//!
//! ```text
//! {"v":1,"type":"text","ciphertext":"...","wrapped_key":"...","iv":"..."}
//! ```
//!
//! The version and payload type are bound into the GCM tag as associated
//! data, so relabelling a text envelope as a file is detected on open.
//!
//! Envelopes are wrapped for the recipient only. The sender cannot open its
//! own sent envelopes; a client that wants to show sent history must keep
//! the plaintext locally at send time.

use crate::asymmetric::AsymmetricCipher;
use crate::entropy::{EntropySource, OsEntropy};
use crate::error::{CryptoError, CryptoResult};
use crate::keypair::{PrivateKey, PublicKey};
use crate::symmetric::{SymmetricCipher, SymmetricKeyMaterial, IV_SIZE, KEY_SIZE};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use zeroize::Zeroizing;

/// Current envelope format version.
pub const ENVELOPE_VERSION: u8 = 1;

/// What an envelope carries. Fixed at construction, never inferred.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PayloadType {
    Text,
    Image,
    File,
}

impl PayloadType {
    pub fn as_str(&self) -> &'static str {
        match self {
            PayloadType::Text => "text",
            PayloadType::Image => "image",
            PayloadType::File => "file",
        }
    }

    /// Image and file payloads are binary and base64-encoded before encryption.
    pub fn is_attachment(&self) -> bool {
        !matches!(self, PayloadType::Text)
    }
}

impl fmt::Display for PayloadType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A self-contained encrypted unit: ciphertext, wrapped key, IV, type tag.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "WireEnvelope", into = "WireEnvelope")]
pub struct Envelope {
    version: u8,
    payload_type: PayloadType,
    ciphertext: Vec<u8>,
    wrapped_key: Vec<u8>,
    iv: [u8; IV_SIZE],
}

impl Envelope {
    /// Assembles an envelope from already-encrypted parts.
    pub fn from_parts(
        payload_type: PayloadType,
        ciphertext: Vec<u8>,
        wrapped_key: Vec<u8>,
        iv: [u8; IV_SIZE],
    ) -> Self {
        Self {
            version: ENVELOPE_VERSION,
            payload_type,
            ciphertext,
            wrapped_key,
            iv,
        }
    }

    pub fn version(&self) -> u8 {
        self.version
    }

    pub fn payload_type(&self) -> PayloadType {
        self.payload_type
    }

    pub fn ciphertext(&self) -> &[u8] {
        &self.ciphertext
    }

    pub fn wrapped_key(&self) -> &[u8] {
        &self.wrapped_key
    }

    pub fn iv(&self) -> &[u8; IV_SIZE] {
        &self.iv
    }

    /// Strips the ciphertext, keeping what is needed to check key ownership.
    pub fn header(&self) -> EnvelopeHeader {
        EnvelopeHeader {
            version: self.version,
            payload_type: self.payload_type,
            wrapped_key: self.wrapped_key.clone(),
            iv: self.iv,
        }
    }

    pub fn to_json(&self) -> CryptoResult<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(json: &str) -> CryptoResult<Self> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn to_json_bytes(&self) -> CryptoResult<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn from_json_bytes(bytes: &[u8]) -> CryptoResult<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }

    fn aad(&self) -> Vec<u8> {
        aad_for(self.version, self.payload_type)
    }
}

fn aad_for(version: u8, payload_type: PayloadType) -> Vec<u8> {
    format!("sealpost-envelope:v{version}:{payload_type}").into_bytes()
}

#[derive(Serialize, Deserialize)]
struct WireEnvelope {
    v: u8,
    #[serde(rename = "type")]
    payload_type: PayloadType,
    ciphertext: String,
    wrapped_key: String,
    iv: String,
}

impl From<Envelope> for WireEnvelope {
    fn from(env: Envelope) -> Self {
        Self {
            v: env.version,
            payload_type: env.payload_type,
            ciphertext: STANDARD.encode(&env.ciphertext),
            wrapped_key: STANDARD.encode(&env.wrapped_key),
            iv: STANDARD.encode(env.iv),
        }
    }
}

impl TryFrom<WireEnvelope> for Envelope {
    type Error = CryptoError;

    fn try_from(wire: WireEnvelope) -> Result<Self, Self::Error> {
        check_version(wire.v)?;
        Ok(Self {
            version: wire.v,
            payload_type: wire.payload_type,
            ciphertext: STANDARD.decode(&wire.ciphertext)?,
            wrapped_key: STANDARD.decode(&wire.wrapped_key)?,
            iv: decode_iv(&wire.iv)?,
        })
    }
}

/// The key-bearing part of an envelope, without its ciphertext.
///
/// Message listings carry this for image/file payloads so a client can
/// confirm it holds the right private key before downloading the blob.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "WireHeader", into = "WireHeader")]
pub struct EnvelopeHeader {
    version: u8,
    payload_type: PayloadType,
    wrapped_key: Vec<u8>,
    iv: [u8; IV_SIZE],
}

impl EnvelopeHeader {
    pub fn payload_type(&self) -> PayloadType {
        self.payload_type
    }

    pub fn wrapped_key(&self) -> &[u8] {
        &self.wrapped_key
    }

    pub fn iv(&self) -> &[u8; IV_SIZE] {
        &self.iv
    }
}

#[derive(Serialize, Deserialize)]
struct WireHeader {
    v: u8,
    #[serde(rename = "type")]
    payload_type: PayloadType,
    wrapped_key: String,
    iv: String,
}

impl From<EnvelopeHeader> for WireHeader {
    fn from(h: EnvelopeHeader) -> Self {
        Self {
            v: h.version,
            payload_type: h.payload_type,
            wrapped_key: STANDARD.encode(&h.wrapped_key),
            iv: STANDARD.encode(h.iv),
        }
    }
}

impl TryFrom<WireHeader> for EnvelopeHeader {
    type Error = CryptoError;

    fn try_from(wire: WireHeader) -> Result<Self, Self::Error> {
        check_version(wire.v)?;
        Ok(Self {
            version: wire.v,
            payload_type: wire.payload_type,
            wrapped_key: STANDARD.decode(&wire.wrapped_key)?,
            iv: decode_iv(&wire.iv)?,
        })
    }
}

fn check_version(v: u8) -> CryptoResult<()> {
    if v != ENVELOPE_VERSION {
        return Err(CryptoError::InvalidEnvelope(format!(
            "unsupported envelope version {v}"
        )));
    }
    Ok(())
}

fn decode_iv(encoded: &str) -> CryptoResult<[u8; IV_SIZE]> {
    let bytes = STANDARD.decode(encoded)?;
    bytes.as_slice().try_into().map_err(|_| {
        CryptoError::InvalidEnvelope(format!(
            "IV must be {IV_SIZE} bytes, got {}",
            bytes.len()
        ))
    })
}

/// Composes [`SymmetricCipher`] and [`AsymmetricCipher`] into envelope
/// encryption for a recipient.
#[derive(Clone)]
pub struct EnvelopeEncoder {
    symmetric: SymmetricCipher,
    asymmetric: AsymmetricCipher,
}

impl EnvelopeEncoder {
    pub fn new(entropy: Arc<dyn EntropySource>) -> Self {
        Self {
            symmetric: SymmetricCipher::new(entropy.clone()),
            asymmetric: AsymmetricCipher::new(entropy),
        }
    }

    /// Encrypts `payload` under a fresh symmetric key and wraps that key for
    /// `recipient`. The symmetric key never leaves this call unwrapped.
    pub fn encrypt_for_recipient(
        &self,
        payload: &[u8],
        payload_type: PayloadType,
        recipient: &PublicKey,
    ) -> CryptoResult<Envelope> {
        let material = self.symmetric.new_key()?;
        let aad = aad_for(ENVELOPE_VERSION, payload_type);

        let ciphertext = SymmetricCipher::encrypt(payload, &material, &aad)?;
        let wrapped_key = self.asymmetric.wrap(material.key(), recipient)?;

        Ok(Envelope::from_parts(
            payload_type,
            ciphertext,
            wrapped_key,
            *material.iv(),
        ))
    }

    /// Unwraps the envelope key and decrypts the payload.
    ///
    /// Every failure is reported as [`CryptoError::EnvelopeDecryption`]
    /// wrapping the underlying unwrap or decryption error.
    pub fn decrypt_with_private_key(
        &self,
        envelope: &Envelope,
        private_key: &PrivateKey,
    ) -> CryptoResult<Zeroizing<Vec<u8>>> {
        self.open_raw(envelope, private_key)
            .map_err(|e| CryptoError::EnvelopeDecryption(Box::new(e)))
    }

    fn open_raw(
        &self,
        envelope: &Envelope,
        private_key: &PrivateKey,
    ) -> CryptoResult<Zeroizing<Vec<u8>>> {
        let key = self.asymmetric.unwrap(envelope.wrapped_key(), private_key)?;
        let key: [u8; KEY_SIZE] = key.as_slice().try_into().map_err(|_| {
            CryptoError::InvalidKeyLength {
                expected: KEY_SIZE,
                actual: key.len(),
            }
        })?;
        let material = SymmetricKeyMaterial::from_parts(key, *envelope.iv());

        SymmetricCipher::decrypt(envelope.ciphertext(), &material, &envelope.aad())
    }

    /// Confirms that `private_key` unwraps the header's key, without touching
    /// any ciphertext. Failures are reported like [`Self::decrypt_with_private_key`].
    pub fn verify_key(&self, header: &EnvelopeHeader, private_key: &PrivateKey) -> CryptoResult<()> {
        let key = self
            .asymmetric
            .unwrap(header.wrapped_key(), private_key)
            .map_err(|e| CryptoError::EnvelopeDecryption(Box::new(e)))?;
        if key.len() != KEY_SIZE {
            return Err(CryptoError::EnvelopeDecryption(Box::new(
                CryptoError::InvalidKeyLength {
                    expected: KEY_SIZE,
                    actual: key.len(),
                },
            )));
        }
        Ok(())
    }

    /// Seals a UTF-8 text message.
    pub fn seal_text(&self, text: &str, recipient: &PublicKey) -> CryptoResult<Envelope> {
        self.encrypt_for_recipient(text.as_bytes(), PayloadType::Text, recipient)
    }

    /// Opens a text envelope.
    pub fn open_text(
        &self,
        envelope: &Envelope,
        private_key: &PrivateKey,
    ) -> CryptoResult<Zeroizing<String>> {
        if envelope.payload_type() != PayloadType::Text {
            return Err(CryptoError::InvalidEnvelope(format!(
                "expected text envelope, got {}",
                envelope.payload_type()
            )));
        }

        let plaintext = self.decrypt_with_private_key(envelope, private_key)?;
        String::from_utf8(plaintext.to_vec())
            .map(Zeroizing::new)
            .map_err(|_| {
                CryptoError::EnvelopeDecryption(Box::new(CryptoError::Decryption(
                    "plaintext is not valid UTF-8".to_string(),
                )))
            })
    }

    /// Seals a binary attachment. The bytes are base64-encoded before
    /// encryption.
    pub fn seal_file(
        &self,
        bytes: &[u8],
        payload_type: PayloadType,
        recipient: &PublicKey,
    ) -> CryptoResult<Envelope> {
        if !payload_type.is_attachment() {
            return Err(CryptoError::InvalidEnvelope(
                "attachments must be sealed as image or file".to_string(),
            ));
        }

        let encoded = Zeroizing::new(STANDARD.encode(bytes));
        self.encrypt_for_recipient(encoded.as_bytes(), payload_type, recipient)
    }

    /// Opens an attachment envelope, returning the decoded bytes.
    pub fn open_file(
        &self,
        envelope: &Envelope,
        private_key: &PrivateKey,
    ) -> CryptoResult<Zeroizing<Vec<u8>>> {
        if !envelope.payload_type().is_attachment() {
            return Err(CryptoError::InvalidEnvelope(
                "expected image or file envelope, got text".to_string(),
            ));
        }

        let encoded = self.decrypt_with_private_key(envelope, private_key)?;
        STANDARD
            .decode(encoded.as_slice())
            .map(Zeroizing::new)
            .map_err(|e| CryptoError::EnvelopeDecryption(Box::new(CryptoError::Base64(e))))
    }
}

impl Default for EnvelopeEncoder {
    fn default() -> Self {
        Self::new(Arc::new(OsEntropy))
    }
}

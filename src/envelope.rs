//! JSON message envelopes.
//!
//! The envelope is the transport-facing unit: a versioned JSON document
//! carrying sender/recipient identities, their public keys, and either an
//! encrypted payload or a plaintext JSON body. Parties exchange envelopes
//! over whatever transport they like; this module only defines the shape
//! and the seal/open paths on top of the session manager.
//!
//! The recipient re-derives the session from the sender's embedded public
//! key, so an inbound envelope is decryptable without prior coordination:
//! the first envelope from a new peer implicitly establishes the session.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use serde::{Deserialize, Serialize};
use uuid::Uuid;
use x25519_dalek::PublicKey;

use crate::cipher::EncryptedPayload;
use crate::keys::{session_id_for, KeyPair};
use crate::manager::{E2eeError, E2eeManager};
use crate::session::now_millis;

/// Wire format version carried in every envelope.
pub const ENVELOPE_VERSION: &str = "1.0";

/// One side of an exchange as it appears on the wire.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EnvelopeParty {
    /// Opaque identity string (a DID in practice).
    pub id: String,
    /// Base64-encoded X25519 public key, when the sender chose to embed it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub public_key: Option<String>,
}

/// Envelope body: sealed ciphertext or plaintext JSON.
///
/// `Encrypted` must stay first so deserialization prefers it whenever the
/// body has the encrypted-payload shape.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(untagged)]
pub enum EnvelopePayload {
    Encrypted(EncryptedPayload),
    Plain(serde_json::Value),
}

/// Versioned transport envelope.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Envelope {
    pub version: String,
    /// Unique envelope id (UUID v4).
    pub id: String,
    /// Unix milliseconds at creation.
    pub ts: u64,
    /// Application-level message type.
    #[serde(rename = "type")]
    pub kind: String,
    pub sender: EnvelopeParty,
    pub recipient: EnvelopeParty,
    pub payload: EnvelopePayload,
}

impl Envelope {
    /// Whether the payload is sealed.
    #[must_use]
    pub fn is_encrypted(&self) -> bool {
        matches!(self.payload, EnvelopePayload::Encrypted(_))
    }
}

fn encode_public_key(key: &PublicKey) -> String {
    BASE64.encode(key.as_bytes())
}

fn decode_public_key(encoded: &str) -> Result<PublicKey, E2eeError> {
    let bytes = BASE64
        .decode(encoded)
        .map_err(|e| E2eeError::InvalidEnvelope(format!("sender public key is not base64: {e}")))?;
    let bytes: [u8; 32] = bytes.try_into().map_err(|v: Vec<u8>| {
        E2eeError::InvalidEnvelope(format!(
            "sender public key is {} bytes, expected 32",
            v.len()
        ))
    })?;
    Ok(PublicKey::from(bytes))
}

impl E2eeManager {
    /// Seal a JSON body into an envelope for `recipient_did`.
    ///
    /// One-shot: establishes (or reuses) the session for this key pair,
    /// then encrypts on it. Both parties' public keys are embedded so the
    /// recipient can re-derive the session without coordination.
    pub fn create_encrypted_envelope(
        &self,
        local: &KeyPair,
        sender_did: &str,
        recipient_did: &str,
        remote_public_key: &PublicKey,
        kind: &str,
        body: &serde_json::Value,
    ) -> Result<Envelope, E2eeError> {
        let session = self.create_session(local, recipient_did, remote_public_key);

        let plaintext = serde_json::to_vec(body)
            .map_err(|e| E2eeError::InvalidEnvelope(format!("body is not serializable: {e}")))?;
        let payload = self.encrypt(&session.id, &plaintext)?;

        Ok(Envelope {
            version: ENVELOPE_VERSION.to_string(),
            id: Uuid::new_v4().to_string(),
            ts: now_millis(),
            kind: kind.to_string(),
            sender: EnvelopeParty {
                id: sender_did.to_string(),
                public_key: Some(encode_public_key(&local.public())),
            },
            recipient: EnvelopeParty {
                id: recipient_did.to_string(),
                public_key: Some(encode_public_key(remote_public_key)),
            },
            payload: EnvelopePayload::Encrypted(payload),
        })
    }

    /// Open an inbound envelope with `local` as the receiving identity.
    ///
    /// Plaintext envelopes pass through unchanged. For sealed envelopes the
    /// session is re-derived from the sender's embedded public key and
    /// created on the spot if this is the first contact.
    pub fn decrypt_envelope(
        &self,
        local: &KeyPair,
        envelope: &Envelope,
    ) -> Result<serde_json::Value, E2eeError> {
        let payload = match &envelope.payload {
            EnvelopePayload::Plain(value) => return Ok(value.clone()),
            EnvelopePayload::Encrypted(payload) => payload,
        };

        let sender_key = envelope.sender.public_key.as_deref().ok_or_else(|| {
            E2eeError::InvalidEnvelope("encrypted envelope is missing the sender public key".into())
        })?;
        let sender_public = decode_public_key(sender_key)?;

        let session_id = session_id_for(&local.public(), &sender_public);
        if !self.has_session(&session_id) {
            self.create_session(local, &envelope.sender.id, &sender_public);
        }

        let plaintext = self.decrypt(&session_id, payload)?;
        serde_json::from_slice(&plaintext)
            .map_err(|e| E2eeError::InvalidEnvelope(format!("decrypted body is not JSON: {e}")))
    }
}

// ============================================================
// TESTS
// ============================================================

//! Authenticated encryption engine.
//!
//! Seals and opens message payloads under a session's shared secret using
//! ChaCha20-Poly1305 with a fresh random 96-bit nonce per message. The
//! engine is payload-agnostic: empty, very large, and multi-byte content
//! are all handled identically.
//!
//! Wire fields (`ciphertext`, `nonce`) are base64 so the payload embeds
//! directly into JSON envelopes.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use chacha20poly1305::{
    aead::{Aead, KeyInit},
    ChaCha20Poly1305, Key, Nonce,
};
use rand::RngCore;
use serde::{Deserialize, Serialize};

use crate::keys::SharedKey;
use crate::session::now_millis;

/// Nonce size for ChaCha20-Poly1305 (96 bits).
pub const NONCE_SIZE: usize = 12;

/// Error types for AEAD operations
#[derive(Debug, thiserror::Error)]
pub enum CipherError {
    /// Authentication failed: wrong key, cross-session confusion, or
    /// corrupted ciphertext bytes.
    #[error("authentication tag mismatch")]
    TagMismatch,
    /// The payload encoding is structurally malformed; authentication was
    /// never attempted.
    #[error("invalid ciphertext format: {0}")]
    InvalidFormat(String),
}

/// The wire unit produced by one encryption call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EncryptedPayload {
    /// Base64-encoded ciphertext (includes the 16-byte Poly1305 tag).
    pub ciphertext: String,
    /// Base64-encoded 12-byte nonce, unique per message.
    pub nonce: String,
    /// Session counter value at encryption time.
    pub sequence: u64,
    /// Unix timestamp in milliseconds when the payload was sealed.
    pub timestamp: u64,
}

/// Encrypt `plaintext` under `key`, tagging the output with `sequence`.
///
/// The nonce is drawn fresh from the system RNG for every call; sequence
/// uniqueness is the session's responsibility, not the cipher's.
#[must_use]
pub(crate) fn seal(key: &SharedKey, sequence: u64, plaintext: &[u8]) -> EncryptedPayload {
    let mut nonce_bytes = [0u8; NONCE_SIZE];
    rand::thread_rng().fill_bytes(&mut nonce_bytes);
    let nonce = Nonce::from_slice(&nonce_bytes);

    let cipher = ChaCha20Poly1305::new(Key::from_slice(key.as_bytes()));
    let ciphertext = cipher
        .encrypt(nonce, plaintext)
        .expect("ChaCha20-Poly1305 encryption of an in-memory buffer cannot fail");

    EncryptedPayload {
        ciphertext: BASE64.encode(ciphertext),
        nonce: BASE64.encode(nonce_bytes),
        sequence,
        timestamp: now_millis(),
    }
}

/// Decrypt `payload` under `key`.
///
/// Returns `InvalidFormat` when the base64/nonce shape is malformed before
/// authentication is even attempted, `TagMismatch` when authentication
/// fails.
pub(crate) fn open(key: &SharedKey, payload: &EncryptedPayload) -> Result<Vec<u8>, CipherError> {
    let ciphertext = BASE64
        .decode(&payload.ciphertext)
        .map_err(|e| CipherError::InvalidFormat(format!("ciphertext is not base64: {e}")))?;
    let nonce_bytes = BASE64
        .decode(&payload.nonce)
        .map_err(|e| CipherError::InvalidFormat(format!("nonce is not base64: {e}")))?;
    if nonce_bytes.len() != NONCE_SIZE {
        return Err(CipherError::InvalidFormat(format!(
            "nonce is {} bytes, expected {}",
            nonce_bytes.len(),
            NONCE_SIZE
        )));
    }

    let cipher = ChaCha20Poly1305::new(Key::from_slice(key.as_bytes()));
    cipher
        .decrypt(Nonce::from_slice(&nonce_bytes), ciphertext.as_slice())
        .map_err(|_| CipherError::TagMismatch)
}

// ============================================================
// TESTS
// ============================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::KeyPair;

    fn test_key() -> SharedKey {
        let a = KeyPair::generate();
        let b = KeyPair::generate();
        a.agree(&b.public())
    }

    #[test]
    fn test_seal_open_roundtrip() {
        let key = test_key();
        let payload = seal(&key, 0, b"Hello, secure world!");
        let plaintext = open(&key, &payload).unwrap();
        assert_eq!(plaintext, b"Hello, secure world!");
    }

    #[test]
    fn test_seal_open_empty_payload() {
        let key = test_key();
        let payload = seal(&key, 0, b"");
        let plaintext = open(&key, &payload).unwrap();
        assert!(plaintext.is_empty());
    }

    #[test]
    fn test_seal_open_large_payload() {
        let key = test_key();
        let data = vec![0xA5u8; 1_000_000];
        let payload = seal(&key, 3, &data);
        let plaintext = open(&key, &payload).unwrap();
        assert_eq!(plaintext, data);
    }

    #[test]
    fn test_seal_open_multibyte_text() {
        let key = test_key();
        let text = "héllo wörld 你好 🌍";
        let payload = seal(&key, 0, text.as_bytes());
        let plaintext = open(&key, &payload).unwrap();
        assert_eq!(String::from_utf8(plaintext).unwrap(), text);
    }

    #[test]
    fn test_sequence_carried_through() {
        let key = test_key();
        let payload = seal(&key, 42, b"x");
        assert_eq!(payload.sequence, 42);
    }

    #[test]
    fn test_nonces_are_unique() {
        let key = test_key();
        let a = seal(&key, 0, b"same plaintext");
        let b = seal(&key, 1, b"same plaintext");
        assert_ne!(a.nonce, b.nonce);
        assert_ne!(a.ciphertext, b.ciphertext);
    }

    #[test]
    fn test_open_wrong_key_fails() {
        let key = test_key();
        let other = test_key();
        let payload = seal(&key, 0, b"secret");
        assert!(matches!(
            open(&other, &payload),
            Err(CipherError::TagMismatch)
        ));
    }

    #[test]
    fn test_open_corrupted_ciphertext_fails() {
        let key = test_key();
        let mut payload = seal(&key, 0, b"some message contents");
        // Flip the trailing characters of the encoded ciphertext
        let len = payload.ciphertext.len();
        payload.ciphertext.replace_range(len - 4..len, "AAAA");
        assert!(matches!(
            open(&key, &payload),
            Err(CipherError::TagMismatch)
        ));
    }

    #[test]
    fn test_open_garbage_base64_is_format_error() {
        let key = test_key();
        let mut payload = seal(&key, 0, b"hello");
        payload.ciphertext = "!!!not base64!!!".to_string();
        assert!(matches!(
            open(&key, &payload),
            Err(CipherError::InvalidFormat(_))
        ));
    }

    #[test]
    fn test_open_bad_nonce_length_is_format_error() {
        let key = test_key();
        let mut payload = seal(&key, 0, b"hello");
        payload.nonce = BASE64.encode([0u8; 8]);
        assert!(matches!(
            open(&key, &payload),
            Err(CipherError::InvalidFormat(_))
        ));
    }
}

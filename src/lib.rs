//! E2EE Sessions - Pairwise end-to-end encrypted sessions for agent messaging
//!
//! This crate provides the session layer for encrypted agent-to-agent
//! messaging. It uses:
//! - X25519 ECDH key agreement, normalized through HKDF-SHA256
//! - ChaCha20-Poly1305 authenticated encryption with per-message nonces
//! - Deterministic session ids over the unordered public-key pair
//! - Time-based key rotation with a one-epoch decryption grace window
//! - A bounded session store with oldest-first eviction and expiry sweeps
//!
//! ## Architecture
//!
//! ```text
//! Application
//!     ↓ create_session / encrypt / decrypt / envelopes
//! E2eeManager
//!     ├── SessionStore (capacity + expiry policies)
//!     ├── EventBus (lifecycle observability)
//!     └── maintenance thread (periodic expiry sweep)
//!     ↓ seal/open under the session secret
//! cipher (ChaCha20-Poly1305)
//!     ↓ shared secret, ratchet
//! keys (X25519 + HKDF-SHA256)
//! ```

#![deny(unsafe_code)]
#![warn(clippy::all)]

pub mod cipher;
pub mod config;
pub mod envelope;
pub mod events;
pub mod keys;
pub mod manager;
mod session;

pub use cipher::{CipherError, EncryptedPayload, NONCE_SIZE};
pub use config::E2eeConfig;
pub use envelope::{Envelope, EnvelopeParty, EnvelopePayload, ENVELOPE_VERSION};
pub use events::{Event, EventBus, EventKind, Subscription};
pub use keys::{session_id_for, KeyPair, SharedKey};
pub use manager::{E2eeError, E2eeManager, SessionInfo, SessionStats};

pub use x25519_dalek::PublicKey;

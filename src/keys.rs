//! Key agreement and session addressing.
//!
//! This module owns the asymmetric half of the subsystem:
//! - X25519 key pairs for agent identities (generated here as a convenience;
//!   the session manager itself never generates or persists identity keys)
//! - ECDH shared-secret derivation, normalized through HKDF-SHA256 so both
//!   parties arrive at the same 32-byte session secret
//! - Deterministic session ids computed from the *unordered* pair of public
//!   keys, so either party derives the identical id regardless of who
//!   initiates
//!
//! # Security Properties
//!
//! - **DH symmetry**: `secret(A.priv, B.pub) == secret(B.priv, A.pub)` is a
//!   hard correctness requirement; the HKDF labels are role-independent
//! - **Zeroize on drop**: `SharedKey` clears its bytes when dropped
//! - **Domain separation**: distinct HKDF info labels for session secrets,
//!   seed-derived keys, and rotation ratchet steps

use hkdf::Hkdf;
use sha2::{Digest, Sha256};
use x25519_dalek::{PublicKey, StaticSecret};
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

/// Salt for every HKDF invocation in this crate (protocol version pinned).
const KDF_SALT: &[u8] = b"e2ee-sessions-v1";
/// Info label for the session shared secret.
const SESSION_SECRET_INFO: &[u8] = b"e2ee.session.secret";
/// Info label for deriving an identity key pair from a seed.
const SEED_KEY_INFO: &[u8] = b"e2ee.identity.key";
/// Info label for one forward-secrecy ratchet step.
const ROTATION_INFO: &[u8] = b"e2ee.session.rotation";

/// 32-byte symmetric session key, zeroized on drop.
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct SharedKey([u8; 32]);

impl SharedKey {
    /// Get the key bytes
    #[must_use]
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// One ratchet step: derive the next rotation epoch's key from this one.
    /// The step is deterministic, so both peers advance to identical keys.
    #[must_use]
    pub(crate) fn ratchet(&self) -> SharedKey {
        let hkdf = Hkdf::<Sha256>::new(Some(KDF_SALT), &self.0);
        let mut next = [0u8; 32];
        hkdf.expand(ROTATION_INFO, &mut next)
            .expect("32 bytes is a valid length for HKDF-SHA256");
        SharedKey(next)
    }
}

impl Clone for SharedKey {
    fn clone(&self) -> Self {
        Self(self.0)
    }
}

/// X25519 identity key pair.
///
/// Owned exclusively by its holder; sessions copy it in at creation and do
/// not share key material with other sessions.
#[derive(Clone)]
pub struct KeyPair {
    secret: StaticSecret,
    public: PublicKey,
}

impl KeyPair {
    /// Generate a random key pair.
    #[must_use]
    pub fn generate() -> Self {
        let secret = StaticSecret::random_from_rng(rand::thread_rng());
        let public = PublicKey::from(&secret);
        Self { secret, public }
    }

    /// Derive a key pair from a 32-byte seed using HKDF-SHA256.
    /// Deterministic: the same seed always yields the same key pair.
    #[must_use]
    pub fn from_seed(seed: &[u8; 32]) -> Self {
        let hkdf = Hkdf::<Sha256>::new(Some(KDF_SALT), seed);
        let mut derived = Zeroizing::new([0u8; 32]);
        hkdf.expand(SEED_KEY_INFO, derived.as_mut())
            .expect("32 bytes is a valid length for HKDF-SHA256");
        let secret = StaticSecret::from(*derived);
        let public = PublicKey::from(&secret);
        Self { secret, public }
    }

    /// The public half of this key pair.
    #[must_use]
    pub fn public(&self) -> PublicKey {
        self.public
    }

    /// Derive the 32-byte session secret shared with `peer`.
    ///
    /// X25519 ECDH followed by HKDF-SHA256 under a role-independent label,
    /// so `a.agree(&b.public()) == b.agree(&a.public())`.
    #[must_use]
    pub fn agree(&self, peer: &PublicKey) -> SharedKey {
        let dh = Zeroizing::new(self.secret.diffie_hellman(peer).to_bytes());
        let hkdf = Hkdf::<Sha256>::new(Some(KDF_SALT), dh.as_slice());
        let mut key = [0u8; 32];
        hkdf.expand(SESSION_SECRET_INFO, &mut key)
            .expect("32 bytes is a valid length for HKDF-SHA256");
        SharedKey(key)
    }
}

/// Compute the deterministic session id for a pair of public keys.
///
/// The two keys are sorted bytewise before hashing, so the id is a pure
/// function of the unordered pair: both peers compute the same id without
/// coordination, and two sessions over the same key pair collapse to one.
#[must_use]
pub fn session_id_for(a: &PublicKey, b: &PublicKey) -> String {
    let (lo, hi) = if a.as_bytes() <= b.as_bytes() {
        (a, b)
    } else {
        (b, a)
    };
    let mut hasher = Sha256::new();
    hasher.update(lo.as_bytes());
    hasher.update(hi.as_bytes());
    hex::encode(hasher.finalize())
}

// ============================================================
// TESTS
// ============================================================

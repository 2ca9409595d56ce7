//! Session records and the bounded session store.
//!
//! A `Session` is an established secure channel with one remote peer:
//! the derived shared secret, the strictly increasing nonce counter, the
//! forward-secrecy ratchet state, and the timestamps that govern expiry.
//!
//! The `SessionStore` enforces the two lifecycle policies:
//! - **Capacity**: at most `max_sessions` records; inserting past capacity
//!   evicts the single oldest record by creation time
//! - **Expiration**: records past `expires_at` are logically absent from
//!   `get` even before the active sweep physically removes them

use std::collections::HashMap;
use std::time::{SystemTime, UNIX_EPOCH};

use x25519_dalek::PublicKey;

use crate::keys::{KeyPair, SharedKey};

/// Current unix time in milliseconds.
pub(crate) fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Receive-side anti-replay window.
///
/// Sliding 64-entry bitmap keyed off the highest sequence seen. Duplicates
/// and sequences older than the window are rejected; out-of-order delivery
/// within the window is accepted.
#[derive(Debug, Default)]
pub(crate) struct ReplayWindow {
    highest: u64,
    mask: u64,
    primed: bool,
}

/// Window width in sequence numbers.
const REPLAY_WINDOW_SIZE: u64 = 64;

impl ReplayWindow {
    /// Check `sequence` and record it as seen. Returns `false` when the
    /// sequence was already seen or has fallen out of the window.
    pub(crate) fn check_and_record(&mut self, sequence: u64) -> bool {
        if !self.primed {
            self.primed = true;
            self.highest = sequence;
            self.mask = 1;
            return true;
        }
        if sequence > self.highest {
            let delta = sequence - self.highest;
            self.mask = if delta >= REPLAY_WINDOW_SIZE {
                1
            } else {
                (self.mask << delta) | 1
            };
            self.highest = sequence;
            return true;
        }
        let offset = self.highest - sequence;
        if offset >= REPLAY_WINDOW_SIZE {
            return false;
        }
        let bit = 1u64 << offset;
        if self.mask & bit != 0 {
            return false;
        }
        self.mask |= bit;
        true
    }
}

/// An established secure channel with one remote peer.
pub(crate) struct Session {
    /// Deterministic id over the unordered public-key pair
    pub(crate) id: String,
    /// Opaque identity string of the counterparty
    pub(crate) remote_did: String,
    /// Counterparty public key, copied in at creation
    pub(crate) remote_public_key: PublicKey,
    /// Local identity key material, exclusively owned by this record
    #[allow(dead_code)]
    pub(crate) local_key_pair: KeyPair,
    /// Current-epoch symmetric key (zeroized on drop)
    pub(crate) shared_secret: SharedKey,
    /// Previous-epoch key, retained for one epoch so late-arriving
    /// messages still decrypt after a rotation
    pub(crate) previous_secret: Option<SharedKey>,
    /// Rotation epochs applied so far
    pub(crate) ratchet_epoch: u64,
    /// Strictly increasing, incremented once per successful encryption
    pub(crate) nonce_counter: u64,
    /// Receive-side duplicate rejection
    pub(crate) replay: ReplayWindow,
    pub(crate) created_at: u64,
    pub(crate) last_used_at: u64,
    pub(crate) expires_at: u64,
}

impl Session {
    pub(crate) fn new(
        id: String,
        remote_did: String,
        remote_public_key: PublicKey,
        local_key_pair: KeyPair,
        timeout_ms: u64,
        now: u64,
    ) -> Self {
        let shared_secret = local_key_pair.agree(&remote_public_key);
        Self {
            id,
            remote_did,
            remote_public_key,
            local_key_pair,
            shared_secret,
            previous_secret: None,
            ratchet_epoch: 0,
            nonce_counter: 0,
            replay: ReplayWindow::default(),
            created_at: now,
            last_used_at: now,
            expires_at: now.saturating_add(timeout_ms),
        }
    }

    pub(crate) fn is_expired(&self, now: u64) -> bool {
        now >= self.expires_at
    }

    /// Read the current counter value and advance it. Each call issues a
    /// distinct sequence number for the session's lifetime.
    pub(crate) fn next_sequence(&mut self) -> u64 {
        let seq = self.nonce_counter;
        self.nonce_counter += 1;
        seq
    }

    /// Advance the forward-secrecy ratchet to the epoch implied by `now`.
    ///
    /// The epoch is elapsed-time / rotation-interval, computed from this
    /// record's own creation time, so both peers converge on the same key
    /// schedule. The previous-epoch key bridges up to one interval of skew
    /// between the two sides' creation times; peers whose records were
    /// created more than one `interval_ms` apart sit on epochs the grace
    /// window cannot bridge and their traffic stops decrypting. Returns
    /// the number of epochs advanced.
    pub(crate) fn sync_ratchet(&mut self, now: u64, interval_ms: u64) -> u64 {
        if interval_ms == 0 {
            return 0;
        }
        let target = now.saturating_sub(self.created_at) / interval_ms;
        let mut advanced = 0;
        while self.ratchet_epoch < target {
            let next = self.shared_secret.ratchet();
            self.previous_secret = Some(std::mem::replace(&mut self.shared_secret, next));
            self.ratchet_epoch += 1;
            advanced += 1;
        }
        advanced
    }
}

/// Keyed collection of session records with capacity and expiry policies.
pub(crate) struct SessionStore {
    sessions: HashMap<String, Session>,
    max_sessions: usize,
}

impl SessionStore {
    pub(crate) fn new(max_sessions: usize) -> Self {
        Self {
            sessions: HashMap::new(),
            max_sessions,
        }
    }

    /// Live-record lookup: expired records are treated as absent.
    pub(crate) fn get(&self, id: &str, now: u64) -> Option<&Session> {
        self.sessions.get(id).filter(|s| !s.is_expired(now))
    }

    /// Mutable live-record lookup with the same lazy-expiry backstop.
    pub(crate) fn get_mut(&mut self, id: &str, now: u64) -> Option<&mut Session> {
        self.sessions.get_mut(id).filter(|s| !s.is_expired(now))
    }

    pub(crate) fn has(&self, id: &str, now: u64) -> bool {
        self.get(id, now).is_some()
    }

    pub(crate) fn delete(&mut self, id: &str) -> bool {
        self.sessions.remove(id).is_some()
    }

    /// Insert a record, evicting the oldest by creation time if the store
    /// is at capacity. Returns the evicted session id, if any.
    pub(crate) fn insert(&mut self, session: Session) -> Option<String> {
        let evicted = if !self.sessions.contains_key(&session.id) {
            self.evict_if_needed()
        } else {
            None
        };
        self.sessions.insert(session.id.clone(), session);
        evicted
    }

    /// Remove the single oldest record when the store is full.
    /// A `max_sessions` of 0 means unbounded, so nothing is ever evicted.
    pub(crate) fn evict_if_needed(&mut self) -> Option<String> {
        if self.max_sessions == 0 || self.sessions.len() < self.max_sessions {
            return None;
        }
        let oldest = self
            .sessions
            .values()
            .min_by_key(|s| s.created_at)
            .map(|s| s.id.clone())?;
        self.sessions.remove(&oldest);
        Some(oldest)
    }

    /// Remove every record past its expiry. Returns the removed ids.
    pub(crate) fn sweep_expired(&mut self, now: u64) -> Vec<String> {
        let expired: Vec<String> = self
            .sessions
            .values()
            .filter(|s| s.is_expired(now))
            .map(|s| s.id.clone())
            .collect();
        for id in &expired {
            self.sessions.remove(id);
        }
        expired
    }

    /// Physical record count, including expired-but-unswept records.
    pub(crate) fn len(&self) -> usize {
        self.sessions.len()
    }

    pub(crate) fn iter(&self) -> impl Iterator<Item = &Session> {
        self.sessions.values()
    }
}

// ============================================================
// TESTS
// ============================================================

//! Session manager: the crate's operational surface.
//!
//! Owns the session store, the event bus, and a background maintenance
//! thread that sweeps expired records. All operations are safe to call
//! from multiple threads; the store sits behind one mutex and lifecycle
//! events are emitted after the lock is released.
//!
//! # Security Properties
//!
//! - **Nonce discipline**: each encryption consumes one counter value
//!   under the store lock, so a sequence number is never issued twice
//! - **Replay rejection**: a received sequence is only accepted once;
//!   duplicates and sequences older than the receive window fail with
//!   `ReplayDetected` even when the ciphertext authenticates
//! - **Forward secrecy**: with rotation enabled, both peers advance the
//!   session key on a shared epoch schedule; one previous-epoch key is
//!   retained so in-flight messages survive a rotation boundary

use std::sync::mpsc;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{debug, info};
use x25519_dalek::PublicKey;

use crate::cipher::{self, CipherError, EncryptedPayload};
use crate::config::E2eeConfig;
use crate::events::{Event, EventBus, EventKind, Subscription};
use crate::keys::{session_id_for, KeyPair, SharedKey};
use crate::session::{now_millis, Session, SessionStore};

/// How often the background sweep runs.
const MAINTENANCE_INTERVAL: Duration = Duration::from_secs(60);

/// Error types for session manager operations
#[derive(Debug, thiserror::Error)]
pub enum E2eeError {
    /// No live session under this id. Also raised for sessions that have
    /// expired but not yet been swept.
    #[error("session not found: {0}")]
    SessionNotFound(String),
    /// The ciphertext failed to authenticate or was malformed.
    #[error("decryption failed")]
    DecryptionFailed {
        #[source]
        source: CipherError,
    },
    /// The sequence number was already accepted or fell out of the
    /// receive window.
    #[error("replay detected on session {session_id}: sequence {sequence}")]
    ReplayDetected { session_id: String, sequence: u64 },
    /// The envelope is structurally unusable.
    #[error("invalid envelope: {0}")]
    InvalidEnvelope(String),
}

/// Point-in-time snapshot of one session record.
#[derive(Clone, Debug)]
pub struct SessionInfo {
    pub id: String,
    pub remote_did: String,
    pub created_at: u64,
    pub last_used_at: u64,
    pub expires_at: u64,
    /// Next sequence number this session will issue.
    pub sequence: u64,
}

/// Aggregate view over the live sessions.
#[derive(Clone, Copy, Debug, Default)]
pub struct SessionStats {
    pub total_sessions: usize,
    pub oldest_created_at: Option<u64>,
    pub newest_created_at: Option<u64>,
}

struct Shared {
    config: E2eeConfig,
    store: Mutex<SessionStore>,
    bus: EventBus,
}

struct Sweeper {
    stop_tx: mpsc::Sender<()>,
    handle: JoinHandle<()>,
}

/// Manager for pairwise end-to-end encrypted sessions.
///
/// `new` spawns the maintenance thread immediately; `stop` (or drop)
/// halts it. Stopping does NOT clear the store: records remain and the
/// lazy-expiry check still hides stale ones.
pub struct E2eeManager {
    shared: Arc<Shared>,
    sweeper: Mutex<Option<Sweeper>>,
}

impl E2eeManager {
    /// Create a manager and start its maintenance timer.
    #[must_use]
    pub fn new(config: E2eeConfig) -> Self {
        Self::with_maintenance_interval(config, MAINTENANCE_INTERVAL)
    }

    /// As `new`, with an explicit sweep interval.
    #[must_use]
    pub fn with_maintenance_interval(config: E2eeConfig, interval: Duration) -> Self {
        let shared = Arc::new(Shared {
            config,
            store: Mutex::new(SessionStore::new(config.max_sessions)),
            bus: EventBus::new(),
        });

        let (stop_tx, stop_rx) = mpsc::channel();
        let worker = Arc::clone(&shared);
        let handle = std::thread::spawn(move || loop {
            match stop_rx.recv_timeout(interval) {
                Err(mpsc::RecvTimeoutError::Timeout) => sweep(&worker),
                Ok(()) | Err(mpsc::RecvTimeoutError::Disconnected) => break,
            }
        });

        info!(
            max_sessions = config.max_sessions,
            session_timeout_ms = config.session_timeout_ms,
            forward_secrecy = config.enable_forward_secrecy,
            "session manager started"
        );

        Self {
            shared,
            sweeper: Mutex::new(Some(Sweeper { stop_tx, handle })),
        }
    }

    /// Establish (or return the existing) session with a remote peer.
    ///
    /// The session id is derived from the unordered public-key pair, so
    /// repeated calls for the same pair land on the same record and a
    /// second call is a no-op returning the live session's snapshot.
    pub fn create_session(
        &self,
        local: &KeyPair,
        remote_did: &str,
        remote_public_key: &PublicKey,
    ) -> SessionInfo {
        let id = session_id_for(&local.public(), remote_public_key);
        let now = now_millis();

        let (info, created, evicted) = {
            let mut store = self.shared.store.lock();
            if let Some(existing) = store.get(&id, now) {
                (snapshot(existing), false, None)
            } else {
                let session = Session::new(
                    id.clone(),
                    remote_did.to_string(),
                    *remote_public_key,
                    local.clone(),
                    self.shared.config.session_timeout_ms,
                    now,
                );
                let info = snapshot(&session);
                let evicted = store.insert(session);
                (info, true, evicted)
            }
        };

        if let Some(evicted_id) = evicted {
            debug!(session_id = %evicted_id, "session evicted at capacity");
            self.shared.bus.emit(&Event {
                kind: EventKind::SessionTerminated,
                session_id: evicted_id,
                remote_did: None,
                sequence: None,
                at: now,
            });
        }
        if created {
            debug!(session_id = %info.id, remote_did, "session created");
            self.shared.bus.emit(&Event {
                kind: EventKind::SessionCreated,
                session_id: info.id.clone(),
                remote_did: Some(remote_did.to_string()),
                sequence: None,
                at: now,
            });
        }
        info
    }

    /// Snapshot of a live session, `None` if absent or expired.
    #[must_use]
    pub fn get_session(&self, session_id: &str) -> Option<SessionInfo> {
        let store = self.shared.store.lock();
        store.get(session_id, now_millis()).map(snapshot)
    }

    /// Whether a live session exists under this id.
    #[must_use]
    pub fn has_session(&self, session_id: &str) -> bool {
        self.shared.store.lock().has(session_id, now_millis())
    }

    /// Remove a session immediately. Returns whether a record was removed.
    pub fn terminate_session(&self, session_id: &str) -> bool {
        let removed = self.shared.store.lock().delete(session_id);
        if removed {
            debug!(session_id, "session terminated");
            self.shared.bus.emit(&Event {
                kind: EventKind::SessionTerminated,
                session_id: session_id.to_string(),
                remote_did: None,
                sequence: None,
                at: now_millis(),
            });
        }
        removed
    }

    /// Encrypt `plaintext` for the session's peer.
    ///
    /// Consumes one sequence number and refreshes `last_used_at`. With
    /// forward secrecy enabled the rotation schedule is applied first.
    pub fn encrypt(
        &self,
        session_id: &str,
        plaintext: &[u8],
    ) -> Result<EncryptedPayload, E2eeError> {
        let now = now_millis();
        let (payload, rotated) = {
            let mut store = self.shared.store.lock();
            let session = store
                .get_mut(session_id, now)
                .ok_or_else(|| E2eeError::SessionNotFound(session_id.to_string()))?;

            let rotated = self.apply_rotation(session, now);
            let sequence = session.next_sequence();
            let payload = cipher::seal(&session.shared_secret, sequence, plaintext);
            session.last_used_at = now;
            (payload, rotated)
        };

        self.emit_rotation(session_id, rotated, now);
        self.shared.bus.emit(&Event {
            kind: EventKind::MessageEncrypted,
            session_id: session_id.to_string(),
            remote_did: None,
            sequence: Some(payload.sequence),
            at: now,
        });
        Ok(payload)
    }

    /// Decrypt a payload received on the session.
    ///
    /// Tries the current-epoch key first, then the previous-epoch key if
    /// one is retained. The replay window is only updated after the
    /// ciphertext authenticates, so forged sequence numbers cannot poison
    /// it. A key rotation applied by this call is announced even when the
    /// payload is then rejected.
    pub fn decrypt(
        &self,
        session_id: &str,
        payload: &EncryptedPayload,
    ) -> Result<Vec<u8>, E2eeError> {
        let now = now_millis();
        let mut rotated = 0;
        let outcome = {
            let mut store = self.shared.store.lock();
            store
                .get_mut(session_id, now)
                .ok_or_else(|| E2eeError::SessionNotFound(session_id.to_string()))
                .and_then(|session| {
                    rotated = self.apply_rotation(session, now);
                    let plaintext = open_with_grace(session, payload)
                        .map_err(|source| E2eeError::DecryptionFailed { source })?;

                    if !session.replay.check_and_record(payload.sequence) {
                        return Err(E2eeError::ReplayDetected {
                            session_id: session_id.to_string(),
                            sequence: payload.sequence,
                        });
                    }
                    session.last_used_at = now;
                    Ok(plaintext)
                })
        };

        self.emit_rotation(session_id, rotated, now);
        let plaintext = outcome?;
        self.shared.bus.emit(&Event {
            kind: EventKind::MessageDecrypted,
            session_id: session_id.to_string(),
            remote_did: None,
            sequence: Some(payload.sequence),
            at: now,
        });
        Ok(plaintext)
    }

    /// Aggregate statistics over the live sessions.
    #[must_use]
    pub fn stats(&self) -> SessionStats {
        let now = now_millis();
        let store = self.shared.store.lock();
        let mut stats = SessionStats::default();
        for session in store.iter().filter(|s| !s.is_expired(now)) {
            stats.total_sessions += 1;
            stats.oldest_created_at = Some(match stats.oldest_created_at {
                Some(t) => t.min(session.created_at),
                None => session.created_at,
            });
            stats.newest_created_at = Some(match stats.newest_created_at {
                Some(t) => t.max(session.created_at),
                None => session.created_at,
            });
        }
        stats
    }

    /// Subscribe to one lifecycle event kind.
    pub fn on<F>(&self, kind: EventKind, handler: F) -> Subscription
    where
        F: Fn(&Event) + Send + Sync + 'static,
    {
        self.shared.bus.on(kind, handler)
    }

    /// Subscribe to every lifecycle event.
    pub fn on_any<F>(&self, handler: F) -> Subscription
    where
        F: Fn(&Event) + Send + Sync + 'static,
    {
        self.shared.bus.on_any(handler)
    }

    /// Run one maintenance pass synchronously: sweep expired records and
    /// emit `session:expired` for each.
    pub fn run_maintenance(&self) {
        sweep(&self.shared);
    }

    /// Halt the maintenance timer. Session records are retained; expired
    /// ones stay hidden by the lazy-expiry check until terminated.
    /// Idempotent.
    pub fn stop(&self) {
        let sweeper = self.sweeper.lock().take();
        if let Some(Sweeper { stop_tx, handle }) = sweeper {
            let _ = stop_tx.send(());
            let _ = handle.join();
            info!("session manager stopped");
        }
    }

    fn apply_rotation(&self, session: &mut Session, now: u64) -> u64 {
        if !self.shared.config.enable_forward_secrecy {
            return 0;
        }
        session.sync_ratchet(now, self.shared.config.key_rotation_interval_ms)
    }

    fn emit_rotation(&self, session_id: &str, epochs_advanced: u64, now: u64) {
        if epochs_advanced == 0 {
            return;
        }
        debug!(session_id, epochs_advanced, "session key rotated");
        self.shared.bus.emit(&Event {
            kind: EventKind::KeyRotated,
            session_id: session_id.to_string(),
            remote_did: None,
            sequence: None,
            at: now,
        });
    }
}

impl Drop for E2eeManager {
    fn drop(&mut self) {
        self.stop();
    }
}

fn snapshot(session: &Session) -> SessionInfo {
    SessionInfo {
        id: session.id.clone(),
        remote_did: session.remote_did.clone(),
        created_at: session.created_at,
        last_used_at: session.last_used_at,
        expires_at: session.expires_at,
        sequence: session.nonce_counter,
    }
}

/// Open under the current key, falling back to the retained previous-epoch
/// key so messages sealed just before a rotation still decrypt.
fn open_with_grace(session: &Session, payload: &EncryptedPayload) -> Result<Vec<u8>, CipherError> {
    match cipher::open(&session.shared_secret, payload) {
        Err(CipherError::TagMismatch) => {
            let previous: &SharedKey = session
                .previous_secret
                .as_ref()
                .ok_or(CipherError::TagMismatch)?;
            cipher::open(previous, payload)
        }
        other => other,
    }
}

fn sweep(shared: &Shared) {
    let now = now_millis();
    let (expired, remaining) = {
        let mut store = shared.store.lock();
        let expired = store.sweep_expired(now);
        (expired, store.len())
    };
    if expired.is_empty() {
        return;
    }
    debug!(count = expired.len(), remaining, "swept expired sessions");
    for session_id in expired {
        shared.bus.emit(&Event {
            kind: EventKind::SessionExpired,
            session_id,
            remote_did: None,
            sequence: None,
            at: now,
        });
    }
}

// ============================================================
// TESTS
// ============================================================

//! Session manager configuration
//!
//! All knobs have documented defaults; constructing `E2eeConfig::default()`
//! gives the production values.

/// Configuration for the E2EE session subsystem
#[derive(Clone, Copy, Debug)]
pub struct E2eeConfig {
    /// Lifetime of a session since creation, in milliseconds.
    /// Expired sessions are absent from every lookup path, even before the
    /// maintenance sweep physically removes them.
    pub session_timeout_ms: u64,
    /// Capacity bound of the session store. Inserting past capacity evicts
    /// the single oldest record by creation time. 0 disables the bound:
    /// the store grows without eviction.
    pub max_sessions: usize,
    /// Whether periodic key rotation (forward secrecy ratchet) is active.
    pub enable_forward_secrecy: bool,
    /// Period between rotation epochs when forward secrecy is enabled,
    /// in milliseconds.
    pub key_rotation_interval_ms: u64,
}

impl E2eeConfig {
    /// Production defaults: 30 minute sessions, 100 records, rotation
    /// every 15 minutes.
    pub const DEFAULT: Self = Self {
        session_timeout_ms: 30 * 60 * 1000,
        max_sessions: 100,
        enable_forward_secrecy: true,
        key_rotation_interval_ms: 15 * 60 * 1000,
    };

    /// Create config with default values
    pub fn new() -> Self {
        Self::default()
    }
}

impl Default for E2eeConfig {
    fn default() -> Self {
        Self::DEFAULT
    }
}

//! SessionKey: the 256-bit symmetric key produced by a
//! completed handshake, its in-memory installation, and its 60-minute
//! expiry. A newer handshake may overwrite an older key for the same
//! peer; the new key applies to all subsequent sends.

use crate::clock::{Clock, SystemClock};
use std::collections::HashMap;
use std::sync::Mutex;

const SESSION_KEY_TTL_MS: i64 = 60 * 60 * 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionKey {
    pub key: [u8; 32],
    pub established_at_ms: i64,
}

impl SessionKey {
    pub fn is_expired(&self, now_ms: i64) -> bool {
        now_ms - self.established_at_ms > SESSION_KEY_TTL_MS
    }
}

/// Per-peer map of installed session keys: an explicit handle
/// rather than a global. Multiple independent handles may coexist in one
/// process (e.g. one per test, or one per simulated peer in an
/// in-process two-peer test).
pub struct SessionKeyTable<C: Clock = SystemClock> {
    keys: Mutex<HashMap<String, SessionKey>>,
    clock: C,
}

impl SessionKeyTable<SystemClock> {
    pub fn new() -> Self {
        Self {
            keys: Mutex::new(HashMap::new()),
            clock: SystemClock,
        }
    }
}

impl Default for SessionKeyTable<SystemClock> {
    fn default() -> Self {
        Self::new()
    }
}

impl<C: Clock> SessionKeyTable<C> {
    pub fn with_clock(clock: C) -> Self {
        Self {
            keys: Mutex::new(HashMap::new()),
            clock,
        }
    }

    /// Installs or overwrites the session key for `peer_id`.
    pub fn install(&self, peer_id: &str, key: [u8; 32]) {
        let established_at_ms = self.clock.now_ms();
        self.keys.lock().unwrap().insert(
            peer_id.to_string(),
            SessionKey {
                key,
                established_at_ms,
            },
        );
    }

    /// Returns the live key for `peer_id`, evicting it first if expired.
    pub fn get(&self, peer_id: &str) -> Option<SessionKey> {
        let now_ms = self.clock.now_ms();
        let mut guard = self.keys.lock().unwrap();
        match guard.get(peer_id) {
            Some(sk) if sk.is_expired(now_ms) => {
                guard.remove(peer_id);
                None
            }
            Some(sk) => Some(*sk),
            None => None,
        }
    }

    pub fn clear(&self, peer_id: &str) {
        self.keys.lock().unwrap().remove(peer_id);
    }
}

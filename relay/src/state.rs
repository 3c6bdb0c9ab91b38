//! Shared, `Mutex`-guarded relay state: the single serialization
//! point for accept decisions lives here, behind the nonce cache and
//! sequence tracker maps. A production deployment would swap these stores
//! for a real database without touching the ReplayGate or handshake
//! routes; everything here is reached only through narrow accessor
//! methods for exactly that reason.

use crate::audit::AuditLog;
use cipherlink_core::aead::CipherRecord;
use cipherlink_core::identity::SigningAlgorithm;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};

pub fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock before unix epoch")
        .as_millis() as i64
}

/// Unordered conversation identifier: two user ids, sorted, joined by `:`.
pub fn conversation_id(a: &str, b: &str) -> String {
    let mut ids = [a, b];
    ids.sort_unstable();
    format!("{}:{}", ids[0], ids[1])
}

pub struct User {
    pub user_id: String,
    pub username: String,
    pub password_salt: [u8; 16],
    pub password_hash: [u8; 32],
    pub public_key_algorithm: SigningAlgorithm,
    pub public_key_der: Vec<u8>,
}

/// `PendingExchange`: single-writer per field except the response
/// trio, which is last-writer-wins, and `confirmed_by`, which is a union.
pub struct PendingExchange {
    pub exchange_id: String,
    pub initiator_id: String,
    pub responder_id: String,
    pub initiator_public_key_b64: String,
    pub initiator_signature_b64: String,
    pub initiator_timestamp: i64,
    pub responder_public_key_b64: Option<String>,
    pub responder_signature_b64: Option<String>,
    pub responder_timestamp: Option<i64>,
    pub responded_by: Option<String>,
    pub confirmed_by: HashSet<String>,
    pub created_at_ms: i64,
}

pub const PENDING_EXCHANGE_TTL_MS: i64 = 5 * 60 * 1000;

impl PendingExchange {
    pub fn is_expired(&self, now: i64) -> bool {
        now - self.created_at_ms > PENDING_EXCHANGE_TTL_MS
    }
}

pub struct StoredMessage {
    pub message_id: String,
    pub sender_id: String,
    pub recipient_id: String,
    pub record: CipherRecord,
    pub received_at_ms: i64,
}

pub struct StoredFile {
    pub file_id: String,
    pub sender_id: String,
    pub recipient_id: String,
    pub file_name: String,
    pub file_size: u64,
    pub mime_type: String,
    pub total_chunks: u32,
    pub chunks_json: String,
    pub uploaded_at_ms: i64,
}

/// One entry of the in-memory nonce cache.
#[derive(Clone)]
pub struct NonceCacheEntry {
    pub timestamp: i64,
    pub sender_id: String,
    pub recipient_id: String,
    pub sequence_number: u64,
    pub accepted_at_ms: i64,
}

pub const NONCE_CACHE_HORIZON_MS: i64 = 5 * 60 * 1000;

pub struct AppState {
    pub users_by_id: Mutex<HashMap<String, User>>,
    pub user_id_by_username: Mutex<HashMap<String, String>>,
    pub tokens: Mutex<HashMap<String, String>>,
    pub pending_exchanges: Mutex<HashMap<String, PendingExchange>>,
    pub messages: Mutex<Vec<StoredMessage>>,
    pub files: Mutex<HashMap<String, StoredFile>>,
    pub nonce_cache: Mutex<HashMap<String, NonceCacheEntry>>,
    pub sequence_tracker: Mutex<HashMap<String, u64>>,
}

impl AppState {
    pub fn new() -> Self {
        Self {
            users_by_id: Mutex::new(HashMap::new()),
            user_id_by_username: Mutex::new(HashMap::new()),
            tokens: Mutex::new(HashMap::new()),
            pending_exchanges: Mutex::new(HashMap::new()),
            messages: Mutex::new(Vec::new()),
            files: Mutex::new(HashMap::new()),
            nonce_cache: Mutex::new(HashMap::new()),
            sequence_tracker: Mutex::new(HashMap::new()),
        }
    }

    pub fn authenticate(&self, token: &str) -> Option<String> {
        self.tokens.lock().unwrap().get(token).cloned()
    }

    /// The durable uniqueness backstop: the
    /// message store itself declares `nonce` globally unique and checks
    /// sequence monotonicity again on insert, catching the narrow race
    /// where two ingest handlers both see a novel nonce before either has
    /// written it to the cache.
    pub fn insert_message(&self, message: StoredMessage) -> Result<(), cipherlink_core::error::CoreError> {
        let conv = conversation_id(&message.sender_id, &message.recipient_id);
        let mut messages = self.messages.lock().unwrap();
        if messages.iter().any(|m| m.record.nonce == message.record.nonce) {
            return Err(cipherlink_core::error::CoreError::from_storage_conflict());
        }
        let last_seen = messages
            .iter()
            .filter(|m| conversation_id(&m.sender_id, &m.recipient_id) == conv)
            .map(|m| m.record.sequence)
            .max()
            .unwrap_or(0);
        if message.record.sequence <= last_seen {
            return Err(cipherlink_core::error::CoreError::InvalidSequence);
        }
        messages.push(message);
        Ok(())
    }

    /// Evicts nonce-cache entries older than the freshness window and
    /// pending exchanges older than their 5-minute TTL. Run by the 60s
    /// sweep task in `main.rs` and opportunistically by lazy lookups.
    pub fn sweep(&self) {
        let now = now_ms();
        self.nonce_cache
            .lock()
            .unwrap()
            .retain(|_, entry| now - entry.accepted_at_ms <= NONCE_CACHE_HORIZON_MS);
        self.pending_exchanges.lock().unwrap().retain(|_, ex| !ex.is_expired(now));
    }
}

impl Default for AppState {
    fn default() -> Self {
        Self::new()
    }
}

/// Axum router state: both halves are handed out as plain `Arc` clones so
/// handlers and the `ReplayGate` middleware can share them without a
/// `FromRef` indirection.
#[derive(Clone)]
pub struct AppContext {
    pub state: Arc<AppState>,
    pub audit: Arc<AuditLog>,
}

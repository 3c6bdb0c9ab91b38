//! AuditLog: a dedicated JSON-lines sink, not a `tracing`
//! subscriber, because the record shape must stay stable regardless of
//! how operational log formatting evolves. One file per UTC day; rotation
//! is checked on every write rather than by a background timer, since
//! writes are the only mutation point.

use serde_json::{json, Value};
use std::fs::OpenOptions;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

pub struct AuditLog {
    dir: PathBuf,
    current: Mutex<Option<(String, std::fs::File)>>,
}

fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock before unix epoch")
        .as_millis() as i64
}

/// Days-since-epoch UTC date key, formatted `YYYY-MM-DD`, without pulling
/// in a date/time crate for one computation.
fn utc_date_key(ts_ms: i64) -> String {
    let days = ts_ms.div_euclid(86_400_000);
    let (y, m, d) = civil_from_days(days);
    format!("{y:04}-{m:02}-{d:02}")
}

/// Howard Hinnant's `civil_from_days` algorithm (proleptic Gregorian).
fn civil_from_days(z: i64) -> (i64, u32, u32) {
    let z = z + 719_468;
    let era = if z >= 0 { z } else { z - 146_096 } / 146_097;
    let doe = (z - era * 146_097) as u64;
    let yoe = (doe - doe / 1460 + doe / 36524 - doe / 146096) / 365;
    let y = yoe as i64 + era * 400;
    let doy = doe - (365 * yoe + yoe / 4 - yoe / 100);
    let mp = (5 * doy + 2) / 153;
    let d = (doy - (153 * mp + 2) / 5 + 1) as u32;
    let m = if mp < 10 { mp + 3 } else { mp - 9 } as u32;
    (if m <= 2 { y + 1 } else { y }, m, d)
}

impl AuditLog {
    pub fn new(dir: impl Into<PathBuf>) -> std::io::Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;
        Ok(Self {
            dir,
            current: Mutex::new(None),
        })
    }

    fn append(&self, mut record: Value) {
        let ts_ms = now_ms();
        record["ts_ms"] = json!(ts_ms);
        let line = match serde_json::to_string(&record) {
            Ok(line) => line,
            Err(e) => {
                tracing::error!("failed to serialize audit record: {e}");
                return;
            }
        };

        let date_key = utc_date_key(ts_ms);
        let mut guard = self.current.lock().unwrap();
        let needs_new_file = match &*guard {
            Some((open_date, _)) => *open_date != date_key,
            None => true,
        };
        if needs_new_file {
            let path = self.dir.join(format!("audit-{date_key}.jsonl"));
            match OpenOptions::new().create(true).append(true).open(&path) {
                Ok(file) => *guard = Some((date_key, file)),
                Err(e) => {
                    tracing::error!("failed to open audit log file {}: {e}", path.display());
                    return;
                }
            }
        }
        if let Some((_, file)) = guard.as_mut() {
            if let Err(e) = writeln!(file, "{line}") {
                tracing::error!("failed to write audit record: {e}");
            }
        }
    }

    pub fn auth_attempt(&self, username: &str, success: bool) {
        self.append(json!({"event": "auth_attempt", "username": username, "success": success}));
    }

    pub fn key_exchange_initiated(&self, exchange_id: &str, initiator_id: &str, responder_id: &str) {
        self.append(json!({
            "event": "key_exchange_initiated",
            "exchange_id": exchange_id,
            "initiator_id": initiator_id,
            "responder_id": responder_id,
        }));
    }

    pub fn key_exchange_response(&self, exchange_id: &str, responder_id: &str) {
        self.append(json!({"event": "key_exchange_response", "exchange_id": exchange_id, "responder_id": responder_id}));
    }

    pub fn key_exchange_confirmed(&self, exchange_id: &str, confirmed_by: &str, both_confirmed: bool) {
        self.append(json!({
            "event": "key_exchange_confirmed",
            "exchange_id": exchange_id,
            "confirmed_by": confirmed_by,
            "both_confirmed": both_confirmed,
        }));
    }

    pub fn key_exchange_unauthorized(&self, exchange_id: &str, user_id: &str) {
        self.append(json!({"event": "key_exchange_unauthorized", "exchange_id": exchange_id, "user_id": user_id}));
    }

    pub fn invalid_signature(&self, context: &str) {
        self.append(json!({"event": "invalid_signature", "context": context}));
    }

    pub fn replay_protection_passed(&self, sender_id: &str, recipient_id: &str, sequence_number: u64) {
        self.append(json!({
            "event": "replay_protection_passed",
            "sender_id": sender_id,
            "recipient_id": recipient_id,
            "sequence_number": sequence_number,
        }));
    }

    pub fn replay_protection_missing_fields(&self, sender_id: &str) {
        self.append(json!({"event": "replay_protection_missing_fields", "sender_id": sender_id}));
    }

    pub fn replay_attack_future_timestamp(&self, sender_id: &str, delta_ms: i64) {
        self.append(json!({"event": "replay_attack_future_timestamp", "sender_id": sender_id, "delta_ms": delta_ms}));
    }

    pub fn replay_attack_old_timestamp(&self, sender_id: &str, delta_ms: i64) {
        self.append(json!({"event": "replay_attack_old_timestamp", "sender_id": sender_id, "delta_ms": delta_ms}));
    }

    pub fn replay_attack_duplicate_nonce(&self, sender_id: &str, previous: &super::state::NonceCacheEntry) {
        self.append(json!({
            "event": "replay_attack_duplicate_nonce",
            "sender_id": sender_id,
            "previous_sequence_number": previous.sequence_number,
            "previous_accepted_at_ms": previous.accepted_at_ms,
        }));
    }

    pub fn replay_attack_invalid_sequence(&self, sender_id: &str, recipient_id: &str, sequence_number: u64, last_seen: u64) {
        self.append(json!({
            "event": "replay_attack_invalid_sequence",
            "sender_id": sender_id,
            "recipient_id": recipient_id,
            "sequence_number": sequence_number,
            "last_seen": last_seen,
        }));
    }

    pub fn replay_protection_sequence_gap(&self, sender_id: &str, gap: u64) {
        self.append(json!({"event": "replay_protection_sequence_gap", "sender_id": sender_id, "gap": gap}));
    }

    pub fn message_sent(&self, sender_id: &str, recipient_id: &str, message_id: &str) {
        self.append(json!({
            "event": "message_sent",
            "sender_id": sender_id,
            "recipient_id": recipient_id,
            "message_id": message_id,
        }));
    }

    pub fn message_access(&self, user_id: &str, peer_id: &str, count: usize) {
        self.append(json!({"event": "message_access", "user_id": user_id, "peer_id": peer_id, "count": count}));
    }

    pub fn file_uploaded(&self, sender_id: &str, recipient_id: &str, file_id: &str) {
        self.append(json!({
            "event": "file_uploaded",
            "sender_id": sender_id,
            "recipient_id": recipient_id,
            "file_id": file_id,
        }));
    }

    pub fn file_accessed(&self, user_id: &str, file_id: &str) {
        self.append(json!({"event": "file_accessed", "user_id": user_id, "file_id": file_id}));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn events_round_trip_as_single_line_json_objects() {
        let dir = std::env::temp_dir().join(format!("cipherlink-audit-test-{}", std::process::id()));
        let log = AuditLog::new(&dir).unwrap();
        log.auth_attempt("alice", true);
        log.message_sent("alice", "bob", "msg-1");

        let date_key = utc_date_key(now_ms());
        let contents = std::fs::read_to_string(dir.join(format!("audit-{date_key}.jsonl"))).unwrap();
        let lines: Vec<&str> = contents.lines().collect();
        assert_eq!(lines.len(), 2);
        let first: Value = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(first["event"], "auth_attempt");
        assert_eq!(first["username"], "alice");
        assert!(first["ts_ms"].is_i64());

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn date_key_matches_known_calendar_date() {
        // 2024-01-15T00:00:00Z
        assert_eq!(utc_date_key(1_705_276_800_000), "2024-01-15");
    }
}

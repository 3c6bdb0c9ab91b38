//! ReplayGate: Axum middleware ahead of `/messages/send`. The
//! nonce cache and sequence tracker are locked together for the whole
//! check-then-insert sequence so an accept decision has one serialization
//! point, not a check-then-insert race between two handlers.

use crate::error::RelayError;
use crate::routes::messages::SendMessageBody;
use crate::state::{conversation_id, now_ms, AppContext, NonceCacheEntry};
use axum::body::{to_bytes, Body};
use axum::extract::{Request, State};
use axum::middleware::Next;
use axum::response::Response;
use axum::Extension;

const FRESHNESS_WINDOW_MS: i64 = 5 * 60 * 1000;
const FUTURE_SKEW_MS: i64 = 60 * 1000;
const SEQUENCE_GAP_WARNING: u64 = 10;

pub async fn replay_gate(
    State(ctx): State<AppContext>,
    Extension(sender_id): Extension<String>,
    request: Request,
    next: Next,
) -> Result<Response, RelayError> {
    let state = &ctx.state;
    let audit = &ctx.audit;
    let (parts, body) = request.into_parts();
    let bytes = to_bytes(body, 64 * 1024 * 1024)
        .await
        .map_err(|e| RelayError::BadRequest(e.to_string()))?;
    let payload: SendMessageBody =
        serde_json::from_slice(&bytes).map_err(|e| RelayError::BadRequest(e.to_string()))?;

    let (timestamp, sequence_number, nonce) =
        match (payload.timestamp, payload.sequence_number, payload.nonce.clone()) {
            (Some(t), Some(s), Some(n)) => (t, s, n),
            _ => {
                audit.replay_protection_missing_fields(&sender_id);
                return Err(RelayError::MissingReplayFields);
            }
        };

    let now = now_ms();
    let delta = now - timestamp;
    if delta < -FUTURE_SKEW_MS {
        audit.replay_attack_future_timestamp(&sender_id, delta);
        return Err(RelayError::MessageFromFuture);
    }
    if delta > FRESHNESS_WINDOW_MS {
        audit.replay_attack_old_timestamp(&sender_id, delta);
        return Err(RelayError::MessageTooOld);
    }

    let conv = conversation_id(&sender_id, &payload.recipient_id);
    {
        let mut nonce_cache = state.nonce_cache.lock().unwrap();
        let mut sequence_tracker = state.sequence_tracker.lock().unwrap();

        if let Some(previous) = nonce_cache.get(&nonce) {
            audit.replay_attack_duplicate_nonce(&sender_id, previous);
            return Err(RelayError::DuplicateNonce);
        }

        let last_seen = match sequence_tracker.get(&conv) {
            Some(seq) => *seq,
            None => state
                .messages
                .lock()
                .unwrap()
                .iter()
                .filter(|m| conversation_id(&m.sender_id, &m.recipient_id) == conv)
                .map(|m| m.record.sequence)
                .max()
                .unwrap_or(0),
        };
        if sequence_number <= last_seen {
            audit.replay_attack_invalid_sequence(&sender_id, &payload.recipient_id, sequence_number, last_seen);
            return Err(RelayError::InvalidSequence);
        }
        if sequence_number - last_seen > SEQUENCE_GAP_WARNING {
            audit.replay_protection_sequence_gap(&sender_id, sequence_number - last_seen);
        }

        nonce_cache.insert(
            nonce,
            NonceCacheEntry {
                timestamp,
                sender_id: sender_id.clone(),
                recipient_id: payload.recipient_id.clone(),
                sequence_number,
                accepted_at_ms: now,
            },
        );
        sequence_tracker.insert(conv, sequence_number);
    }
    audit.replay_protection_passed(&sender_id, &payload.recipient_id, sequence_number);

    let request = Request::from_parts(parts, Body::from(bytes));
    Ok(next.run(request).await)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn send_message_body_deserializes_camel_case_fields() {
        let json = r#"{"recipientId":"bob","ciphertext":"AA==","iv":"AA==","tag":"AA==","timestamp":1,"sequenceNumber":1,"nonce":"0123456789abcdef"}"#;
        let body: SendMessageBody = serde_json::from_str(json).unwrap();
        assert_eq!(body.recipient_id, "bob");
        assert_eq!(body.sequence_number, Some(1));
    }
}

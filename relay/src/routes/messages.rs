//! `POST /messages/send`, `GET /messages/conversation/{peerId}`.
//! `send` is only ever reached behind the `ReplayGate` middleware, which has
//! already validated the replay triple by the time this handler runs.

use crate::error::RelayError;
use crate::state::{now_ms, AppContext, StoredMessage};
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::{Extension, Json};
use cipherlink_core::aead::CipherRecordWire;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendMessageBody {
    pub recipient_id: String,
    pub ciphertext: String,
    pub iv: String,
    pub tag: String,
    pub timestamp: Option<i64>,
    pub sequence_number: Option<u64>,
    pub nonce: Option<String>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SendMessageResponse {
    pub message_id: String,
    pub received_at_ms: i64,
}

pub async fn send_message(
    State(ctx): State<AppContext>,
    Extension(sender_id): Extension<String>,
    Json(body): Json<SendMessageBody>,
) -> Result<(StatusCode, Json<SendMessageResponse>), RelayError> {
    let record = CipherRecordWire {
        ciphertext: body.ciphertext,
        iv: body.iv,
        tag: body.tag,
        timestamp: body.timestamp,
        sequence_number: body.sequence_number,
        nonce: body.nonce,
    }
    .into_record()?;

    let message_id = Uuid::new_v4().to_string();
    let received_at_ms = now_ms();
    ctx.state.insert_message(StoredMessage {
        message_id: message_id.clone(),
        sender_id: sender_id.clone(),
        recipient_id: body.recipient_id.clone(),
        record,
        received_at_ms,
    })?;
    ctx.audit.message_sent(&sender_id, &body.recipient_id, &message_id);

    Ok((
        StatusCode::CREATED,
        Json(SendMessageResponse {
            message_id,
            received_at_ms,
        }),
    ))
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationMessage {
    pub message_id: String,
    pub sender_id: String,
    pub recipient_id: String,
    #[serde(flatten)]
    pub record: CipherRecordWire,
    pub received_at_ms: i64,
}

pub async fn get_conversation(
    State(ctx): State<AppContext>,
    Extension(self_id): Extension<String>,
    Path(peer_id): Path<String>,
) -> Result<Json<Vec<ConversationMessage>>, RelayError> {
    let messages = ctx.state.messages.lock().unwrap();
    let mut out: Vec<ConversationMessage> = messages
        .iter()
        .filter(|m| {
            (m.sender_id == self_id && m.recipient_id == peer_id)
                || (m.sender_id == peer_id && m.recipient_id == self_id)
        })
        .map(|m| ConversationMessage {
            message_id: m.message_id.clone(),
            sender_id: m.sender_id.clone(),
            recipient_id: m.recipient_id.clone(),
            record: CipherRecordWire::from(&m.record),
            received_at_ms: m.received_at_ms,
        })
        .collect();
    out.sort_by_key(|m| m.received_at_ms);

    ctx.audit.message_access(&self_id, &peer_id, out.len());
    Ok(Json(out))
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

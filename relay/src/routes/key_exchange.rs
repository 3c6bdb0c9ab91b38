//! `/key-exchange/*`: store-and-forward for signed handshake
//! messages. The relay never verifies a signature or inspects key material
//! here: it only shuffles opaque, already-signed blobs between the two
//! parties named in them. All cryptographic verification happens in
//! `cipherlink_core::handshake` on the client side.

use crate::error::RelayError;
use crate::state::{now_ms, AppContext, PendingExchange};
use axum::extract::{Path, State};
use axum::{Extension, Json};
use cipherlink_core::handshake::{ConfirmMessage, DhHandshakeMessage, HandshakeResponse};
use serde::Serialize;
use std::collections::HashSet;

fn exchange_key(initiator_id: &str, responder_id: &str) -> String {
    format!("{initiator_id}:{responder_id}")
}

#[derive(Serialize)]
pub struct Ack {
    pub ok: bool,
}

pub async fn initiate(
    State(ctx): State<AppContext>,
    Extension(sender_id): Extension<String>,
    Json(msg): Json<DhHandshakeMessage>,
) -> Result<Json<Ack>, RelayError> {
    if msg.from != sender_id {
        return Err(RelayError::BadRequest("from must match the authenticated user".into()));
    }
    let now = now_ms();
    let exchange_id = exchange_key(&msg.from, &msg.to);
    let exchange = PendingExchange {
        exchange_id: exchange_id.clone(),
        initiator_id: msg.from.clone(),
        responder_id: msg.to.clone(),
        initiator_public_key_b64: msg.public_key_b64.clone(),
        initiator_signature_b64: msg.signature.clone(),
        initiator_timestamp: msg.timestamp,
        responder_public_key_b64: None,
        responder_signature_b64: None,
        responder_timestamp: None,
        responded_by: None,
        confirmed_by: HashSet::new(),
        created_at_ms: now,
    };
    ctx.state.pending_exchanges.lock().unwrap().insert(exchange_id.clone(), exchange);
    ctx.audit.key_exchange_initiated(&exchange_id, &msg.from, &msg.to);
    Ok(Json(Ack { ok: true }))
}

pub async fn response(
    State(ctx): State<AppContext>,
    Extension(sender_id): Extension<String>,
    Json(msg): Json<DhHandshakeMessage>,
) -> Result<Json<Ack>, RelayError> {
    if msg.from != sender_id {
        return Err(RelayError::BadRequest("from must match the authenticated user".into()));
    }
    // initiator == responder would mean you're answering your own INITIATE.
    let exchange_id = exchange_key(&msg.to, &msg.from);
    let mut exchanges = ctx.state.pending_exchanges.lock().unwrap();
    let exchange = exchanges.get_mut(&exchange_id).ok_or(RelayError::NotFound)?;
    if exchange.is_expired(now_ms()) {
        return Err(RelayError::NotFound);
    }
    if exchange.initiator_id == sender_id {
        ctx.audit.key_exchange_unauthorized(&exchange_id, &sender_id);
        return Err(RelayError::InvalidSelfResponse);
    }

    exchange.responder_public_key_b64 = Some(msg.public_key_b64.clone());
    exchange.responder_signature_b64 = Some(msg.signature.clone());
    exchange.responder_timestamp = Some(msg.timestamp);
    exchange.responded_by = Some(msg.from.clone());
    ctx.audit.key_exchange_response(&exchange_id, &msg.from);
    Ok(Json(Ack { ok: true }))
}

pub async fn confirm(
    State(ctx): State<AppContext>,
    Extension(sender_id): Extension<String>,
    Json(msg): Json<ConfirmMessage>,
) -> Result<Json<Ack>, RelayError> {
    if msg.from != sender_id {
        return Err(RelayError::BadRequest("from must match the authenticated user".into()));
    }
    let mut exchanges = ctx.state.pending_exchanges.lock().unwrap();
    let key_forward = exchange_key(&msg.from, &msg.to);
    let key_backward = exchange_key(&msg.to, &msg.from);
    let key = if exchanges.contains_key(&key_forward) {
        key_forward
    } else if exchanges.contains_key(&key_backward) {
        key_backward
    } else {
        return Err(RelayError::NotFound);
    };
    let exchange = exchanges.get_mut(&key).ok_or(RelayError::NotFound)?;

    exchange.confirmed_by.insert(msg.from.clone());
    let both_confirmed = exchange.confirmed_by.len() >= 2;
    let exchange_id = exchange.exchange_id.clone();
    ctx.audit.key_exchange_confirmed(&exchange_id, &msg.from, both_confirmed);
    if both_confirmed {
        exchanges.remove(&key);
    }
    Ok(Json(Ack { ok: true }))
}

pub async fn pending_initiate(
    State(ctx): State<AppContext>,
    Extension(self_id): Extension<String>,
    Path(peer_id): Path<String>,
) -> Result<Json<Option<DhHandshakeMessage>>, RelayError> {
    let exchanges = ctx.state.pending_exchanges.lock().unwrap();
    let key = exchange_key(&peer_id, &self_id);
    let Some(exchange) = exchanges.get(&key) else {
        return Ok(Json(None));
    };
    if exchange.is_expired(now_ms()) || exchange.responded_by.is_some() {
        return Ok(Json(None));
    }
    Ok(Json(Some(DhHandshakeMessage {
        message_type: "INITIATE".to_string(),
        from: exchange.initiator_id.clone(),
        to: exchange.responder_id.clone(),
        public_key_b64: exchange.initiator_public_key_b64.clone(),
        timestamp: exchange.initiator_timestamp,
        signature: exchange.initiator_signature_b64.clone(),
    })))
}

pub async fn pending_response(
    State(ctx): State<AppContext>,
    Extension(self_id): Extension<String>,
    Path(peer_id): Path<String>,
) -> Result<Json<Option<HandshakeResponse>>, RelayError> {
    let exchanges = ctx.state.pending_exchanges.lock().unwrap();
    let key = exchange_key(&self_id, &peer_id);
    let Some(exchange) = exchanges.get(&key) else {
        return Ok(Json(None));
    };
    if exchange.is_expired(now_ms()) {
        return Ok(Json(None));
    }
    let (Some(public_key_b64), Some(signature), Some(timestamp)) = (
        exchange.responder_public_key_b64.clone(),
        exchange.responder_signature_b64.clone(),
        exchange.responder_timestamp,
    ) else {
        return Ok(Json(None));
    };
    let initiate = DhHandshakeMessage {
        message_type: "INITIATE".to_string(),
        from: exchange.initiator_id.clone(),
        to: exchange.responder_id.clone(),
        public_key_b64: exchange.initiator_public_key_b64.clone(),
        timestamp: exchange.initiator_timestamp,
        signature: exchange.initiator_signature_b64.clone(),
    };
    let respond = DhHandshakeMessage {
        message_type: "RESPOND".to_string(),
        from: exchange.responder_id.clone(),
        to: exchange.initiator_id.clone(),
        public_key_b64,
        timestamp,
        signature,
    };
    Ok(Json(Some(HandshakeResponse { initiate, respond })))
}

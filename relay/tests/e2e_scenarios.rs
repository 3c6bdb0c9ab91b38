//! End-to-end scenarios against the in-process router: register two
//! users, exchange messages, and drive every ReplayGate rejection path
//! through real HTTP requests.

use axum::body::Body;
use axum::http::{Request, StatusCode};
use cipherlink_relay::audit::AuditLog;
use cipherlink_relay::state::{AppContext, AppState};
use http_body_util::BodyExt;
use serde_json::{json, Value};
use std::sync::Arc;
use tower::ServiceExt;

fn test_ctx() -> AppContext {
    let dir = std::env::temp_dir().join(format!("cipherlink-relay-test-{}", uuid::Uuid::new_v4()));
    AppContext {
        state: Arc::new(AppState::new()),
        audit: Arc::new(AuditLog::new(dir).unwrap()),
    }
}

async fn send(
    app: &axum::Router,
    method: &str,
    uri: &str,
    token: Option<&str>,
    body: Option<Value>,
) -> (StatusCode, Value) {
    let mut builder = Request::builder().method(method).uri(uri);
    if let Some(token) = token {
        builder = builder.header("Authorization", format!("Bearer {token}"));
    }
    let body_bytes = match body {
        Some(v) => {
            builder = builder.header("content-type", "application/json");
            serde_json::to_vec(&v).unwrap()
        }
        None => Vec::new(),
    };
    let request = builder.body(Body::from(body_bytes)).unwrap();
    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let json = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap_or(Value::Null)
    };
    (status, json)
}

async fn register(app: &axum::Router, username: &str) -> (String, String) {
    let (status, body) = send(
        app,
        "POST",
        "/auth/register",
        None,
        Some(json!({
            "username": username,
            "password": "correct horse battery staple",
            "publicKey": "QUJD",
        })),
    )
    .await;
    assert_eq!(status, StatusCode::OK, "register failed: {body:?}");
    (
        body["token"].as_str().unwrap().to_string(),
        body["user"]["userId"].as_str().unwrap().to_string(),
    )
}

#[tokio::test]
async fn happy_path_register_send_and_fetch_conversation() {
    let ctx = test_ctx();
    let app = cipherlink_relay::app(ctx);

    let (alice_token, _alice_id) = register(&app, "alice").await;
    let (_bob_token, bob_id) = register(&app, "bob").await;

    let (status, body) = send(
        &app,
        "POST",
        "/messages/send",
        Some(&alice_token),
        Some(json!({
            "recipientId": bob_id,
            "ciphertext": "AAAA",
            "iv": "AAAAAAAAAAAAAAAA",
            "tag": "AAAAAAAAAAAAAAAAAAAAAA==",
            "timestamp": chrono_now(),
            "sequenceNumber": 1,
            "nonce": "0123456789abcdef",
        })),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED, "{body:?}");

    let (status, body) = send(&app, "GET", &format!("/messages/conversation/{bob_id}"), Some(&alice_token), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body.as_array().unwrap().len(), 1);
}

#[tokio::test]
async fn missing_replay_fields_are_rejected() {
    let ctx = test_ctx();
    let app = cipherlink_relay::app(ctx);
    let (alice_token, _) = register(&app, "alice").await;
    let (_, bob_id) = register(&app, "bob").await;

    let (status, body) = send(
        &app,
        "POST",
        "/messages/send",
        Some(&alice_token),
        Some(json!({
            "recipientId": bob_id,
            "ciphertext": "AAAA",
            "iv": "AAAAAAAAAAAAAAAA",
            "tag": "AAAAAAAAAAAAAAAAAAAAAA==",
        })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "missing-replay-fields");
}

#[tokio::test]
async fn duplicate_nonce_is_rejected_and_stays_rejected() {
    let ctx = test_ctx();
    let app = cipherlink_relay::app(ctx);
    let (alice_token, _) = register(&app, "alice").await;
    let (_, bob_id) = register(&app, "bob").await;

    let msg = json!({
        "recipientId": bob_id,
        "ciphertext": "AAAA",
        "iv": "AAAAAAAAAAAAAAAA",
        "tag": "AAAAAAAAAAAAAAAAAAAAAA==",
        "timestamp": chrono_now(),
        "sequenceNumber": 1,
        "nonce": "fedcba9876543210",
    });
    let (status, _) = send(&app, "POST", "/messages/send", Some(&alice_token), Some(msg.clone())).await;
    assert_eq!(status, StatusCode::CREATED);

    // Same nonce, bumped sequence number: still rejected as a replay.
    let mut replayed = msg.clone();
    replayed["sequenceNumber"] = json!(2);
    let (status, body) = send(&app, "POST", "/messages/send", Some(&alice_token), Some(replayed.clone())).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "duplicate-nonce");

    // Idempotence: replaying again gives the identical rejection, not a crash.
    let (status, body) = send(&app, "POST", "/messages/send", Some(&alice_token), Some(replayed)).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "duplicate-nonce");
}

#[tokio::test]
async fn stale_timestamp_is_rejected() {
    let ctx = test_ctx();
    let app = cipherlink_relay::app(ctx);
    let (alice_token, _) = register(&app, "alice").await;
    let (_, bob_id) = register(&app, "bob").await;

    let (status, body) = send(
        &app,
        "POST",
        "/messages/send",
        Some(&alice_token),
        Some(json!({
            "recipientId": bob_id,
            "ciphertext": "AAAA",
            "iv": "AAAAAAAAAAAAAAAA",
            "tag": "AAAAAAAAAAAAAAAAAAAAAA==",
            "timestamp": chrono_now() - 10 * 60 * 1000,
            "sequenceNumber": 1,
            "nonce": "aaaaaaaaaaaaaaaa",
        })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "message-too-old");
}

#[tokio::test]
async fn future_timestamp_is_rejected() {
    let ctx = test_ctx();
    let app = cipherlink_relay::app(ctx);
    let (alice_token, _) = register(&app, "alice").await;
    let (_, bob_id) = register(&app, "bob").await;

    let (status, body) = send(
        &app,
        "POST",
        "/messages/send",
        Some(&alice_token),
        Some(json!({
            "recipientId": bob_id,
            "ciphertext": "AAAA",
            "iv": "AAAAAAAAAAAAAAAA",
            "tag": "AAAAAAAAAAAAAAAAAAAAAA==",
            "timestamp": chrono_now() + 5 * 60 * 1000,
            "sequenceNumber": 1,
            "nonce": "bbbbbbbbbbbbbbbb",
        })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "message-from-future");
}

#[tokio::test]
async fn sequence_rewind_is_rejected() {
    let ctx = test_ctx();
    let app = cipherlink_relay::app(ctx);
    let (alice_token, _) = register(&app, "alice").await;
    let (_, bob_id) = register(&app, "bob").await;

    let base = json!({
        "recipientId": bob_id,
        "ciphertext": "AAAA",
        "iv": "AAAAAAAAAAAAAAAA",
        "tag": "AAAAAAAAAAAAAAAAAAAAAA==",
        "timestamp": chrono_now(),
        "sequenceNumber": 5,
        "nonce": "cccccccccccccccc",
    });
    let (status, _) = send(&app, "POST", "/messages/send", Some(&alice_token), Some(base)).await;
    assert_eq!(status, StatusCode::CREATED);

    let rewound = json!({
        "recipientId": bob_id,
        "ciphertext": "AAAA",
        "iv": "AAAAAAAAAAAAAAAA",
        "tag": "AAAAAAAAAAAAAAAAAAAAAA==",
        "timestamp": chrono_now(),
        "sequenceNumber": 3,
        "nonce": "dddddddddddddddd",
    });
    let (status, body) = send(&app, "POST", "/messages/send", Some(&alice_token), Some(rewound)).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "invalid-sequence-number");
}

#[tokio::test]
async fn unauthenticated_requests_are_rejected() {
    let ctx = test_ctx();
    let app = cipherlink_relay::app(ctx);
    let (status, _) = send(&app, "GET", "/users/whoever/public-key", None, None).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn key_exchange_initiate_respond_and_confirm_round_trip() {
    let ctx = test_ctx();
    let app = cipherlink_relay::app(ctx);
    let (alice_token, alice_id) = register(&app, "alice").await;
    let (bob_token, bob_id) = register(&app, "bob").await;

    let (status, _) = send(
        &app,
        "POST",
        "/key-exchange/initiate",
        Some(&alice_token),
        Some(json!({
            "type": "INITIATE",
            "from": alice_id,
            "to": bob_id,
            "publicKey": "QUJD",
            "timestamp": chrono_now(),
            "signature": "c2ln",
        })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    let (status, pending) = send(
        &app,
        "GET",
        &format!("/key-exchange/pending/{alice_id}"),
        Some(&bob_token),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(pending["from"], alice_id);

    let (status, _) = send(
        &app,
        "POST",
        "/key-exchange/response",
        Some(&bob_token),
        Some(json!({
            "type": "RESPOND",
            "from": bob_id,
            "to": alice_id,
            "publicKey": "WFla",
            "timestamp": chrono_now(),
            "signature": "c2ln",
        })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    let (status, respond) = send(
        &app,
        "GET",
        &format!("/key-exchange/responses/{bob_id}"),
        Some(&alice_token),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(respond["respond"]["from"], bob_id);
    assert_eq!(respond["initiate"]["from"], alice_id);
    assert_eq!(respond["initiate"]["to"], bob_id);

    let (status, _) = send(
        &app,
        "POST",
        "/key-exchange/confirm",
        Some(&alice_token),
        Some(json!({"type": "CONFIRM", "from": alice_id, "to": bob_id, "hash": "aGFzaA=="})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    let (status, _) = send(
        &app,
        "POST",
        "/key-exchange/confirm",
        Some(&bob_token),
        Some(json!({"type": "CONFIRM", "from": bob_id, "to": alice_id, "hash": "aGFzaA=="})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    // Both parties confirmed: the relay has dropped the PendingExchange,
    // so the response that used to be there is gone too.
    let (status, respond) = send(
        &app,
        "GET",
        &format!("/key-exchange/responses/{bob_id}"),
        Some(&alice_token),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert!(respond.is_null());
}

#[tokio::test]
async fn responding_to_your_own_initiate_is_rejected() {
    let ctx = test_ctx();
    let app = cipherlink_relay::app(ctx);
    let (alice_token, alice_id) = register(&app, "alice").await;
    let (_, bob_id) = register(&app, "bob").await;

    send(
        &app,
        "POST",
        "/key-exchange/initiate",
        Some(&alice_token),
        Some(json!({
            "type": "INITIATE",
            "from": alice_id,
            "to": bob_id,
            "publicKey": "QUJD",
            "timestamp": chrono_now(),
            "signature": "c2ln",
        })),
    )
    .await;

    let (status, body) = send(
        &app,
        "POST",
        "/key-exchange/response",
        Some(&alice_token),
        Some(json!({
            "type": "RESPOND",
            "from": alice_id,
            "to": bob_id,
            "publicKey": "WFla",
            "timestamp": chrono_now(),
            "signature": "c2ln",
        })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "invalid-self-response");
}

#[tokio::test]
async fn file_upload_is_visible_to_sender_and_recipient_only() {
    let ctx = test_ctx();
    let app = cipherlink_relay::app(ctx);
    let (alice_token, _) = register(&app, "alice").await;
    let (bob_token, bob_id) = register(&app, "bob").await;
    let (mallory_token, _) = register(&app, "mallory").await;

    let (status, body) = send(
        &app,
        "POST",
        "/files/upload",
        Some(&alice_token),
        Some(json!({
            "recipientId": bob_id,
            "fileName": "photo.png",
            "fileSize": 3,
            "mimeType": "image/png",
            "totalChunks": 1,
            "chunks": [{"chunk_index": 0, "ciphertext": "AAAA", "iv": "AAAAAAAAAAAAAAAA", "tag": "AAAAAAAAAAAAAAAAAAAAAA=="}],
        })),
    )
    .await;
    assert_eq!(status, StatusCode::OK, "{body:?}");
    let file_id = body["fileId"].as_str().unwrap();

    let (status, _) = send(&app, "GET", &format!("/files/{file_id}"), Some(&bob_token), None).await;
    assert_eq!(status, StatusCode::OK);

    let (status, _) = send(&app, "GET", &format!("/files/{file_id}"), Some(&mallory_token), None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

fn chrono_now() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap()
        .as_millis() as i64
}

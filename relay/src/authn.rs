//! Bearer-token authentication. Tokens are opaque random 256-bit values;
//! sender identity for every authenticated route (including the
//! `ReplayGate`) comes from here, never from the request body.

use crate::error::RelayError;
use crate::state::AppContext;
use axum::extract::{Request, State};
use axum::http::header::AUTHORIZATION;
use axum::middleware::Next;
use axum::response::Response;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use cipherlink_core::identity::SigningAlgorithm;
use pbkdf2::pbkdf2_hmac;
use rand::RngCore;
use sha2::Sha256;

const PASSWORD_PBKDF2_ITERATIONS: u32 = 100_000;

/// Wire tag for a `SigningAlgorithm`, independent of its Rust variant names.
pub fn algorithm_tag(algorithm: SigningAlgorithm) -> &'static str {
    match algorithm {
        SigningAlgorithm::Rsa2048Pss => "rsa2048Pss",
        SigningAlgorithm::P256Ecdsa => "p256Ecdsa",
    }
}

pub fn parse_algorithm(tag: Option<&str>) -> SigningAlgorithm {
    match tag {
        Some("p256Ecdsa") => SigningAlgorithm::P256Ecdsa,
        _ => SigningAlgorithm::Rsa2048Pss,
    }
}

pub fn new_token() -> String {
    let mut bytes = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

pub fn hash_password(password: &str, salt: &[u8; 16]) -> [u8; 32] {
    let mut out = [0u8; 32];
    pbkdf2_hmac::<Sha256>(password.as_bytes(), salt, PASSWORD_PBKDF2_ITERATIONS, &mut out);
    out
}

pub fn new_salt() -> [u8; 16] {
    let mut salt = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut salt);
    salt
}

pub async fn auth_required(
    State(ctx): State<AppContext>,
    mut request: Request,
    next: Next,
) -> Result<Response, RelayError> {
    let token = request
        .headers()
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .ok_or(RelayError::Unauthorized)?;

    let user_id = ctx.state.authenticate(token).ok_or(RelayError::Unauthorized)?;
    request.extensions_mut().insert(user_id);
    Ok(next.run(request).await)
}

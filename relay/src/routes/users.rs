//! `GET /users/{id}/public-key`: the only directory lookup a
//! peer needs before it can verify a handshake message.

use crate::authn::algorithm_tag;
use crate::error::RelayError;
use crate::state::AppContext;
use axum::extract::{Path, State};
use axum::Json;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde::Serialize;

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PublicKeyResponse {
    pub user_id: String,
    pub username: String,
    pub public_key: String,
    pub algorithm: String,
}

pub async fn get_public_key(
    State(ctx): State<AppContext>,
    Path(user_id): Path<String>,
) -> Result<Json<PublicKeyResponse>, RelayError> {
    let users = ctx.state.users_by_id.lock().unwrap();
    let user = users.get(&user_id).ok_or(RelayError::NotFound)?;
    Ok(Json(PublicKeyResponse {
        user_id: user.user_id.clone(),
        username: user.username.clone(),
        public_key: BASE64.encode(&user.public_key_der),
        algorithm: algorithm_tag(user.public_key_algorithm).to_string(),
    }))
}

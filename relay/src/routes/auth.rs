//! `POST /auth/register`, `POST /auth/login`.

use crate::authn::{hash_password, new_salt, new_token, parse_algorithm};
use crate::error::RelayError;
use crate::state::{now_ms, AppContext, User};
use axum::extract::State;
use axum::Json;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterRequest {
    pub username: String,
    pub password: String,
    pub public_key: String,
    #[serde(default)]
    pub algorithm: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoginRequest {
    pub username: String,
    pub password: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UserView {
    pub user_id: String,
    pub username: String,
}

#[derive(Serialize)]
pub struct AuthResponse {
    pub token: String,
    pub user: UserView,
}

pub async fn register(
    State(ctx): State<AppContext>,
    Json(req): Json<RegisterRequest>,
) -> Result<Json<AuthResponse>, RelayError> {
    {
        let mut by_username = ctx.state.user_id_by_username.lock().unwrap();
        if by_username.contains_key(&req.username) {
            ctx.audit.auth_attempt(&req.username, false);
            return Err(RelayError::UsernameTaken);
        }
        let user_id = Uuid::new_v4().to_string();
        let salt = new_salt();
        let hash = hash_password(&req.password, &salt);
        let public_key_der = BASE64
            .decode(&req.public_key)
            .map_err(|_| RelayError::BadRequest("publicKey is not valid base64".into()))?;

        let user = User {
            user_id: user_id.clone(),
            username: req.username.clone(),
            password_salt: salt,
            password_hash: hash,
            public_key_algorithm: parse_algorithm(req.algorithm.as_deref()),
            public_key_der,
        };
        by_username.insert(req.username.clone(), user_id.clone());
        ctx.state.users_by_id.lock().unwrap().insert(user_id.clone(), user);

        let token = new_token();
        ctx.state.tokens.lock().unwrap().insert(token.clone(), user_id.clone());
        ctx.audit.auth_attempt(&req.username, true);
        Ok(Json(AuthResponse {
            token,
            user: UserView {
                user_id,
                username: req.username,
            },
        }))
    }
}

pub async fn login(
    State(ctx): State<AppContext>,
    Json(req): Json<LoginRequest>,
) -> Result<Json<AuthResponse>, RelayError> {
    let user_id = {
        let by_username = ctx.state.user_id_by_username.lock().unwrap();
        by_username.get(&req.username).cloned()
    };
    let Some(user_id) = user_id else {
        ctx.audit.auth_attempt(&req.username, false);
        return Err(RelayError::InvalidCredentials);
    };

    let valid = {
        let users = ctx.state.users_by_id.lock().unwrap();
        let user = users.get(&user_id).ok_or(RelayError::InvalidCredentials)?;
        hash_password(&req.password, &user.password_salt) == user.password_hash
    };
    if !valid {
        ctx.audit.auth_attempt(&req.username, false);
        return Err(RelayError::InvalidCredentials);
    }

    let token = new_token();
    ctx.state.tokens.lock().unwrap().insert(token.clone(), user_id.clone());
    ctx.audit.auth_attempt(&req.username, true);
    let _ = now_ms();
    Ok(Json(AuthResponse {
        token,
        user: UserView {
            user_id,
            username: req.username,
        },
    }))
}

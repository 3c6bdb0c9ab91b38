pub mod audit;
pub mod authn;
pub mod error;
pub mod replay_gate;
pub mod routes;
pub mod state;

use authn::auth_required;
use axum::middleware;
use axum::routing::{get, post};
use axum::Router;
use replay_gate::replay_gate;
use state::AppContext;

/// Builds the full Axum router against an already-constructed [`AppContext`].
/// Kept separate from `main` so integration tests can drive the same route
/// tree in-process via `tower::ServiceExt::oneshot`.
pub fn app(ctx: AppContext) -> Router {
    let messages_routes = Router::new()
        .route(
            "/messages/send",
            post(routes::messages::send_message).layer(middleware::from_fn_with_state(ctx.clone(), replay_gate)),
        )
        .route("/messages/conversation/{peerId}", get(routes::messages::get_conversation));

    let protected = Router::new()
        .route("/users/{id}/public-key", get(routes::users::get_public_key))
        .route("/key-exchange/initiate", post(routes::key_exchange::initiate))
        .route("/key-exchange/response", post(routes::key_exchange::response))
        .route("/key-exchange/confirm", post(routes::key_exchange::confirm))
        .route("/key-exchange/pending/{peerId}", get(routes::key_exchange::pending_initiate))
        .route("/key-exchange/responses/{peerId}", get(routes::key_exchange::pending_response))
        .route("/files/upload", post(routes::files::upload_file))
        .route("/files/{id}", get(routes::files::download_file))
        .route("/files/conversation/{peerId}", get(routes::files::conversation_files))
        .merge(messages_routes)
        .layer(middleware::from_fn_with_state(ctx.clone(), auth_required));

    Router::new()
        .route("/auth/register", post(routes::auth::register))
        .route("/auth/login", post(routes::auth::login))
        .merge(protected)
        .with_state(ctx)
}

use axum::http::{HeaderValue, Method};
use cipherlink_relay::audit::AuditLog;
use cipherlink_relay::state::AppState;
use cipherlink_relay::{app, state::AppContext};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tower_http::cors::CorsLayer;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt::init();

    let allowed_origin =
        std::env::var("CIPHERLINK_WEB_ORIGIN").unwrap_or_else(|_| "http://localhost:3000".to_string());
    let cors = CorsLayer::new()
        .allow_origin(allowed_origin.parse::<HeaderValue>().expect("valid CORS origin"))
        .allow_methods([Method::GET, Method::POST])
        .allow_headers([axum::http::header::CONTENT_TYPE, axum::http::header::AUTHORIZATION]);

    let audit_dir = std::env::var("CIPHERLINK_AUDIT_DIR").unwrap_or_else(|_| "./audit-log".to_string());
    let audit = AuditLog::new(&audit_dir).expect("failed to open audit log directory");
    let ctx = AppContext {
        state: Arc::new(AppState::new()),
        audit: Arc::new(audit),
    };

    let sweep_state = ctx.state.clone();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(60));
        loop {
            interval.tick().await;
            sweep_state.sweep();
        }
    });

    let router = app(ctx).layer(cors);

    let bind_host = std::env::var("CIPHERLINK_BIND_HOST").unwrap_or_else(|_| "127.0.0.1".to_string());
    let bind_port: u16 = std::env::var("CIPHERLINK_BIND_PORT")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(8080);
    let addr: SocketAddr = format!("{bind_host}:{bind_port}").parse().expect("valid bind address");
    tracing::info!("cipherlink-relay listening on {addr}");
    let listener = tokio::net::TcpListener::bind(addr).await.expect("failed to bind listener");
    axum::serve(listener, router).await.expect("server error");
}

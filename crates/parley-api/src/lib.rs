pub mod auth;
pub mod chats;
pub mod messages;
pub mod middleware;
pub mod notifications;
pub mod status;

use axum::{
    Router,
    http::StatusCode,
    middleware::from_fn_with_state,
    routing::{get, post},
};
use tracing::error;

use parley_db::Database;

use crate::auth::AppState;
use crate::middleware::require_auth;

/// Every REST route. Everything except auth and `/health` requires a bearer token.
pub fn router(state: AppState) -> Router {
    let public_routes = Router::new()
        .route("/auth/register", post(auth::register))
        .route("/auth/login", post(auth::login))
        .route("/health", get(health));

    let protected_routes = Router::new()
        .route("/chats", get(chats::list_chats).post(chats::create_chat))
        .route(
            "/chats/{chat_id}/messages",
            get(messages::get_messages).post(messages::send_message),
        )
        .route("/notifications", get(notifications::list_notifications))
        .route("/notifications/unread-count", get(notifications::unread_count))
        .route("/notifications/mark-all-read", post(notifications::mark_all_read))
        .route("/user/status", post(status::heartbeat))
        .layer(from_fn_with_state(state.clone(), require_auth));

    Router::new()
        .merge(public_routes)
        .merge(protected_routes)
        .with_state(state)
}

/// GET /health: liveness check (no auth).
async fn health() -> &'static str {
    "ok"
}

/// Run a DB closure off the async runtime, mapping any failure to 500.
pub(crate) async fn blocking<F, T>(state: &AppState, f: F) -> Result<T, StatusCode>
where
    F: FnOnce(&Database) -> anyhow::Result<T> + Send + 'static,
    T: Send + 'static,
{
    let db = state.db.clone();
    tokio::task::spawn_blocking(move || f(&db))
        .await
        .map_err(|e| {
            error!("spawn_blocking join error: {}", e);
            StatusCode::INTERNAL_SERVER_ERROR
        })?
        .map_err(|e| {
            error!("DB error: {:#}", e);
            StatusCode::INTERNAL_SERVER_ERROR
        })
}

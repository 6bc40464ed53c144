use axum::{Extension, Json, extract::State, http::StatusCode};
use serde_json::{Value, json};

use parley_types::models::User;

use crate::auth::AppState;
use crate::messages::relay_status;

/// Liveness ping from clients without an open gateway connection.
pub async fn heartbeat(
    State(state): State<AppState>,
    Extension(user): Extension<User>,
) -> Result<Json<Value>, StatusCode> {
    state
        .relay
        .heartbeat(user.id)
        .await
        .map_err(|e| relay_status(&e))?;

    Ok(Json(json!({ "success": true })))
}

use axum::{Extension, Json, extract::State, http::StatusCode};

use parley_types::api::{MarkAllReadResponse, UnreadCountResponse};
use parley_types::models::{Notification, User};

use crate::auth::AppState;
use crate::blocking;

const PAGE: u32 = 50;

/// Newest first.
pub async fn list_notifications(
    State(state): State<AppState>,
    Extension(user): Extension<User>,
) -> Result<Json<Vec<Notification>>, StatusCode> {
    let uid = user.id.to_string();
    let rows = blocking(&state, move |db| db.get_notifications(&uid, PAGE)).await?;
    Ok(Json(rows.into_iter().map(|r| r.into_notification()).collect()))
}

pub async fn unread_count(
    State(state): State<AppState>,
    Extension(user): Extension<User>,
) -> Result<Json<UnreadCountResponse>, StatusCode> {
    let uid = user.id.to_string();
    let count = blocking(&state, move |db| db.unread_notification_count(&uid)).await?;
    Ok(Json(UnreadCountResponse { count }))
}

pub async fn mark_all_read(
    State(state): State<AppState>,
    Extension(user): Extension<User>,
) -> Result<Json<MarkAllReadResponse>, StatusCode> {
    let uid = user.id.to_string();
    let updated = blocking(&state, move |db| db.mark_all_notifications_read(&uid)).await?;
    Ok(Json(MarkAllReadResponse { updated }))
}

use axum::{
    Extension, Json,
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
};
use serde::Deserialize;
use tracing::{debug, error};
use uuid::Uuid;

use parley_gateway::error::RelayError;
use parley_types::api::SendMessageRequest;
use parley_types::models::{MessageRecord, User};

use crate::auth::AppState;
use crate::blocking;

const MAX_PAGE: u32 = 200;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageQuery {
    #[serde(default = "default_limit")]
    pub limit: u32,
    /// `createdAt` of the oldest message already held; returns older ones.
    pub before: Option<String>,
    /// `id` of that same message. Together with `before` it pages exactly
    /// through messages that share a timestamp.
    pub before_id: Option<Uuid>,
}

fn default_limit() -> u32 {
    50
}

pub async fn get_messages(
    State(state): State<AppState>,
    Path(chat_id): Path<Uuid>,
    Extension(user): Extension<User>,
    Query(query): Query<MessageQuery>,
) -> Result<Json<Vec<MessageRecord>>, StatusCode> {
    let limit = query.limit.clamp(1, MAX_PAGE);
    let cid = chat_id.to_string();
    let uid = user.id.to_string();

    let page = blocking(&state, move |db| {
        if !db.is_participant(&uid, &cid)? {
            return Ok(None);
        }
        let rows = match (query.before.as_deref(), query.before_id) {
            (Some(before), Some(id)) => db.get_messages_before(&cid, limit, before, &id.to_string())?,
            (before, _) => db.get_messages(&cid, limit, before)?,
        };
        Ok(Some(rows.into_iter().map(|r| r.into_record()).collect::<Vec<MessageRecord>>()))
    })
    .await?;

    page.map(Json).ok_or(StatusCode::FORBIDDEN)
}

/// Same path as a gateway `send_message`: persisted, then relayed to the room.
pub async fn send_message(
    State(state): State<AppState>,
    Path(chat_id): Path<Uuid>,
    Extension(user): Extension<User>,
    Json(req): Json<SendMessageRequest>,
) -> Result<impl IntoResponse, StatusCode> {
    let record = state
        .relay
        .post_message(&user, chat_id, req.content, req.media_url)
        .await
        .map_err(|e| relay_status(&e))?;

    Ok((StatusCode::CREATED, Json(record)))
}

pub(crate) fn relay_status(err: &RelayError) -> StatusCode {
    match err {
        RelayError::Authorization(_) => StatusCode::FORBIDDEN,
        RelayError::Protocol(reason) => {
            debug!("Rejected message: {}", reason);
            StatusCode::BAD_REQUEST
        }
        RelayError::Persistence { context, source } => {
            error!("{}: {:#}", context, source);
            StatusCode::INTERNAL_SERVER_ERROR
        }
    }
}

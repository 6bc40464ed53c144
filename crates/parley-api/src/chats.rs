use std::collections::BTreeSet;

use axum::{Extension, Json, extract::State, http::StatusCode, response::IntoResponse};
use chrono::Utc;
use tracing::{info, warn};
use uuid::Uuid;

use parley_db::Database;
use parley_db::models::ChatRow;
use parley_types::api::{ChatResponse, CreateChatRequest};
use parley_types::models::User;

use crate::auth::AppState;
use crate::blocking;

pub async fn list_chats(
    State(state): State<AppState>,
    Extension(user): Extension<User>,
) -> Result<Json<Vec<ChatResponse>>, StatusCode> {
    let uid = user.id.to_string();
    let chats = blocking(&state, move |db| {
        db.get_chats_for_user(&uid)?
            .into_iter()
            .map(|row| chat_response(db, row))
            .collect::<anyhow::Result<Vec<_>>>()
    })
    .await?;

    Ok(Json(chats))
}

/// Direct chats are unique per pair: asking for one that exists returns it
/// with 200 instead of creating a duplicate.
pub async fn create_chat(
    State(state): State<AppState>,
    Extension(user): Extension<User>,
    Json(req): Json<CreateChatRequest>,
) -> Result<impl IntoResponse, StatusCode> {
    let mut members: BTreeSet<Uuid> = req.participant_ids.into_iter().collect();
    members.insert(user.id);

    if members.len() < 2 {
        return Err(StatusCode::BAD_REQUEST);
    }
    if !req.is_group && members.len() != 2 {
        return Err(StatusCode::BAD_REQUEST);
    }

    let name = req
        .name
        .map(|n| n.trim().to_string())
        .filter(|n| !n.is_empty());
    if name.as_ref().is_some_and(|n| n.chars().count() > 100) {
        return Err(StatusCode::BAD_REQUEST);
    }

    let ids: Vec<String> = members.iter().map(Uuid::to_string).collect();
    let is_group = req.is_group;
    let creator = user.id;

    let lookup_ids = ids.clone();
    let missing = blocking(&state, move |db| {
        for id in &lookup_ids {
            if db.get_user_by_id(id)?.is_none() {
                return Ok(Some(id.clone()));
            }
        }
        Ok(None)
    })
    .await?;
    if let Some(id) = missing {
        warn!("Chat create by {} names unknown user {}", creator, id);
        return Err(StatusCode::BAD_REQUEST);
    }

    let (status, chat) = blocking(&state, move |db| {
        if !is_group {
            if let Some(existing) = db.find_direct_chat(&ids[0], &ids[1])? {
                return Ok((StatusCode::OK, chat_response(db, existing)?));
            }
        }

        let chat_id = Uuid::new_v4().to_string();
        db.create_chat(&chat_id, name.as_deref(), is_group, &ids, Utc::now())?;
        let row = db
            .get_chat(&chat_id)?
            .ok_or_else(|| anyhow::anyhow!("chat {} vanished after insert", chat_id))?;
        Ok((StatusCode::CREATED, chat_response(db, row)?))
    })
    .await?;

    if status == StatusCode::CREATED {
        info!("Chat {} created by {}", chat.id, creator);
    }

    Ok((status, Json(chat)))
}

fn chat_response(db: &Database, row: ChatRow) -> anyhow::Result<ChatResponse> {
    let participant_ids = db
        .get_participant_ids(&row.id)?
        .iter()
        .filter_map(|id| id.parse().ok())
        .collect();
    let last_message = match row.last_message_id.as_deref() {
        Some(id) => db.get_message(id)?.map(|m| m.into_record()),
        None => None,
    };
    let chat = row.into_chat();

    Ok(ChatResponse {
        id: chat.id,
        name: chat.name,
        is_group: chat.is_group,
        participant_ids,
        last_message,
        updated_at: chat.updated_at,
    })
}

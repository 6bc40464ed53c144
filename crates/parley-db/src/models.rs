//! Database row types. These map directly to SQLite rows and are kept
//! distinct from the parley-types models so the DB layer stays independent.
//! The `into_*` conversions tolerate corrupt columns: they log and fall back
//! rather than failing a whole listing over one bad row.

use chrono::{DateTime, Utc};
use tracing::warn;
use uuid::Uuid;

use parley_types::models::{
    Chat, MessageRecord, MessageStatus, Notification, SenderSummary, User, UserStatus,
};

use crate::parse_ts;

pub struct UserRow {
    pub id: String,
    pub name: String,
    pub email: String,
    pub password: String,
    pub profile_image: Option<String>,
    pub status: String,
    pub last_seen: Option<String>,
    pub created_at: String,
}

pub struct ChatRow {
    pub id: String,
    pub name: Option<String>,
    pub is_group: bool,
    pub last_message_id: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

pub struct MessageRow {
    pub id: String,
    pub chat_id: String,
    pub sender_id: String,
    pub sender_name: String,
    pub sender_image: Option<String>,
    pub content: String,
    pub media_url: Option<String>,
    pub status: String,
    pub is_read: bool,
    pub created_at: String,
}

pub struct NotificationRow {
    pub id: String,
    pub user_id: String,
    pub kind: String,
    pub content: String,
    pub from_user_id: Option<String>,
    pub is_read: bool,
    pub created_at: String,
}

fn uuid_or_default(raw: &str, what: &str, owner: &str) -> Uuid {
    raw.parse().unwrap_or_else(|e| {
        warn!("Corrupt {} '{}' on '{}': {}", what, raw, owner, e);
        Uuid::default()
    })
}

fn ts_or_default(raw: &str, what: &str, owner: &str) -> DateTime<Utc> {
    parse_ts(raw).unwrap_or_else(|| {
        warn!("Corrupt {} '{}' on '{}'", what, raw, owner);
        DateTime::default()
    })
}

impl UserRow {
    pub fn into_user(self) -> User {
        User {
            id: uuid_or_default(&self.id, "user id", &self.id),
            status: self.status.parse().unwrap_or_else(|e| {
                warn!("{} on user '{}'", e, self.id);
                UserStatus::Offline
            }),
            last_seen: self.last_seen.as_deref().and_then(parse_ts),
            name: self.name,
            email: self.email,
            profile_image: self.profile_image,
        }
    }
}

impl ChatRow {
    pub fn into_chat(self) -> Chat {
        Chat {
            id: uuid_or_default(&self.id, "chat id", &self.id),
            last_message_id: self
                .last_message_id
                .as_deref()
                .and_then(|raw| raw.parse().ok()),
            created_at: ts_or_default(&self.created_at, "created_at", &self.id),
            updated_at: ts_or_default(&self.updated_at, "updated_at", &self.id),
            name: self.name,
            is_group: self.is_group,
        }
    }
}

impl MessageRow {
    pub fn into_record(self) -> MessageRecord {
        let sender_id = uuid_or_default(&self.sender_id, "sender_id", &self.id);
        MessageRecord {
            id: uuid_or_default(&self.id, "message id", &self.id),
            chat_id: uuid_or_default(&self.chat_id, "chat_id", &self.id),
            sender_id,
            created_at: ts_or_default(&self.created_at, "created_at", &self.id),
            status: self.status.parse().unwrap_or_else(|e| {
                warn!("{} on message '{}'", e, self.id);
                MessageStatus::Sent
            }),
            is_read: self.is_read,
            content: self.content,
            media_url: self.media_url,
            sender: SenderSummary {
                id: sender_id,
                name: self.sender_name,
                profile_image: self.sender_image,
            },
        }
    }
}

impl NotificationRow {
    pub fn into_notification(self) -> Notification {
        Notification {
            id: uuid_or_default(&self.id, "notification id", &self.id),
            user_id: uuid_or_default(&self.user_id, "user_id", &self.id),
            from_user_id: self.from_user_id.as_deref().and_then(|raw| raw.parse().ok()),
            created_at: ts_or_default(&self.created_at, "created_at", &self.id),
            kind: self.kind,
            content: self.content,
            is_read: self.is_read,
        }
    }
}

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::{MessageRecord, UserStatus};

/// Events sent over the WebSocket gateway.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(
    tag = "type",
    content = "data",
    rename_all = "snake_case",
    rename_all_fields = "camelCase"
)]
pub enum GatewayEvent {
    /// Server confirms successful authentication
    Ready { user_id: Uuid, name: String },

    /// A new message was persisted in a chat
    Message(MessageEnvelope),

    /// A user started or stopped typing
    Typing {
        user_id: Uuid,
        chat_id: Uuid,
        is_typing: bool,
    },

    /// A participant read every message addressed to them in a chat
    MessagesRead { chat_id: Uuid, read_by: Uuid },

    /// A user came online, went away or went offline
    UserStatus { user_id: Uuid, status: UserStatus },

    /// The connection is now bound to a chat room
    Joined { chat_id: Uuid },

    /// The connection left a chat room
    Left { chat_id: Uuid },

    /// Something the client asked for failed. Only sent to the originating connection.
    Error {
        message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        client_ref: Option<String>,
    },
}

impl GatewayEvent {
    pub fn error(message: impl Into<String>, client_ref: Option<String>) -> Self {
        Self::Error {
            message: message.into(),
            client_ref,
        }
    }
}

/// Payload of the `message` event: the stored record plus the sender's
/// optional correlation reference.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageEnvelope {
    #[serde(flatten)]
    pub message: MessageRecord,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_ref: Option<String>,
}

/// Commands sent FROM client TO server over WebSocket.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(
    tag = "type",
    content = "data",
    rename_all = "snake_case",
    rename_all_fields = "camelCase"
)]
pub enum GatewayCommand {
    /// Post a message to a chat
    SendMessage {
        chat_id: Uuid,
        content: String,
        #[serde(default)]
        media_url: Option<String>,
        #[serde(default)]
        client_ref: Option<String>,
    },

    /// Indicate typing state in a chat
    Typing { chat_id: Uuid, is_typing: bool },

    /// Mark every message from other participants in a chat as read
    MarkRead { chat_id: Uuid },

    /// Bind this connection to another chat room
    Join { chat_id: Uuid },

    /// Unbind this connection from a chat room
    Leave { chat_id: Uuid },

    /// Keep-alive from an active client; refreshes last seen
    Heartbeat,

    /// Switch between online and away
    SetStatus { status: UserStatus },
}

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Result, anyhow};
use chrono::{DateTime, Utc};
use uuid::Uuid;

use parley_db::Database;
use parley_types::models::{MessageRecord, NewMessage, NewNotification, User, UserStatus};

pub const DEFAULT_STORE_TIMEOUT: Duration = Duration::from_secs(5);

/// Everything the relay needs from durable storage. The store is the source
/// of truth; the relay only ever announces what a call here has confirmed.
///
/// Calls are synchronous and may block; [`Store`] moves them off the runtime.
pub trait ChatStore: Send + Sync + 'static {
    /// Resolve a credential subject.
    fn find_user(&self, user_id: Uuid) -> Result<Option<User>>;

    fn is_participant(&self, user_id: Uuid, chat_id: Uuid) -> Result<bool>;

    fn chat_participants(&self, chat_id: Uuid) -> Result<Vec<Uuid>>;

    /// Persist with status `sent` and return the stored record.
    fn create_message(&self, msg: &NewMessage) -> Result<MessageRecord>;

    fn update_chat_last_message(&self, chat_id: Uuid, message_id: Uuid, now: DateTime<Utc>) -> Result<()>;

    /// Returns how many messages changed.
    fn mark_messages_read(&self, chat_id: Uuid, reader_id: Uuid, now: DateTime<Utc>) -> Result<usize>;

    fn update_user_last_seen(&self, user_id: Uuid, now: DateTime<Utc>) -> Result<()>;

    fn set_user_status(&self, user_id: Uuid, status: UserStatus) -> Result<()>;

    fn create_notifications(&self, entries: &[NewNotification]) -> Result<()>;
}

impl ChatStore for Database {
    fn find_user(&self, user_id: Uuid) -> Result<Option<User>> {
        Ok(self.get_user_by_id(&user_id.to_string())?.map(|row| row.into_user()))
    }

    fn is_participant(&self, user_id: Uuid, chat_id: Uuid) -> Result<bool> {
        Database::is_participant(self, &user_id.to_string(), &chat_id.to_string())
    }

    fn chat_participants(&self, chat_id: Uuid) -> Result<Vec<Uuid>> {
        self.get_participant_ids(&chat_id.to_string())?
            .iter()
            .map(|id| id.parse().map_err(|e| anyhow!("Corrupt participant id '{}': {}", id, e)))
            .collect()
    }

    fn create_message(&self, msg: &NewMessage) -> Result<MessageRecord> {
        Ok(self.insert_message(msg)?.into_record())
    }

    fn update_chat_last_message(&self, chat_id: Uuid, message_id: Uuid, now: DateTime<Utc>) -> Result<()> {
        Database::update_chat_last_message(self, &chat_id.to_string(), &message_id.to_string(), now)
    }

    fn mark_messages_read(&self, chat_id: Uuid, reader_id: Uuid, now: DateTime<Utc>) -> Result<usize> {
        Database::mark_messages_read(self, &chat_id.to_string(), &reader_id.to_string(), now)
    }

    fn update_user_last_seen(&self, user_id: Uuid, now: DateTime<Utc>) -> Result<()> {
        Database::update_user_last_seen(self, &user_id.to_string(), now)
    }

    fn set_user_status(&self, user_id: Uuid, status: UserStatus) -> Result<()> {
        Database::set_user_status(self, &user_id.to_string(), status)
    }

    fn create_notifications(&self, entries: &[NewNotification]) -> Result<()> {
        self.insert_notifications(entries, Utc::now())
    }
}

/// Async handle over a [`ChatStore`]: runs each call on the blocking pool
/// under a deadline.
#[derive(Clone)]
pub struct Store {
    backend: Arc<dyn ChatStore>,
    timeout: Duration,
}

impl Store {
    pub fn new(backend: Arc<dyn ChatStore>, timeout: Duration) -> Self {
        Self { backend, timeout }
    }

    /// A timed-out call keeps running on the blocking pool; only the caller
    /// stops waiting for it.
    pub async fn call<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&dyn ChatStore) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let backend = self.backend.clone();
        let task = tokio::task::spawn_blocking(move || f(backend.as_ref()));

        match tokio::time::timeout(self.timeout, task).await {
            Ok(Ok(result)) => result,
            Ok(Err(e)) => Err(anyhow!("store task failed: {}", e)),
            Err(_) => Err(anyhow!("store call timed out after {:?}", self.timeout)),
        }
    }
}

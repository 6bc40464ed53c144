//! The relay proper: handshake resolution, room binding, message ingress,
//! typing, read receipts and teardown. Transport-agnostic; the WebSocket
//! loop in [`crate::connection`] and the REST handlers both drive it.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use chrono::Utc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use parley_types::events::{GatewayCommand, GatewayEvent, MessageEnvelope};
use parley_types::models::{MessageRecord, NewMessage, NewNotification, User, UserStatus};

use crate::auth::{AuthError, Authenticator};
use crate::dispatcher::{ConnId, Dispatcher};
use crate::error::RelayError;
use crate::store::{ChatStore, DEFAULT_STORE_TIMEOUT, Store};

const NOTIFICATION_KIND_MESSAGE: &str = "MESSAGE";

/// One authenticated connection as seen by the relay.
pub struct Session {
    pub conn_id: ConnId,
    pub user: User,
    closed: AtomicBool,
}

impl Session {
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

#[derive(Clone)]
pub struct Relay {
    inner: Arc<RelayInner>,
}

struct RelayInner {
    dispatcher: Dispatcher,
    store: Store,
    authenticator: Authenticator,
}

impl Relay {
    pub fn new(store: Arc<dyn ChatStore>, dispatcher: Dispatcher, jwt_secret: &str) -> Self {
        Self::with_timeout(store, dispatcher, jwt_secret, DEFAULT_STORE_TIMEOUT)
    }

    pub fn with_timeout(
        store: Arc<dyn ChatStore>,
        dispatcher: Dispatcher,
        jwt_secret: &str,
        store_timeout: Duration,
    ) -> Self {
        Self {
            inner: Arc::new(RelayInner {
                dispatcher,
                store: Store::new(store, store_timeout),
                authenticator: Authenticator::new(jwt_secret),
            }),
        }
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.inner.dispatcher
    }

    pub fn authenticator(&self) -> &Authenticator {
        &self.inner.authenticator
    }

    // -- Handshake --

    /// Verify a credential and resolve its subject. Nothing is registered or
    /// written on failure.
    pub async fn authenticate(&self, token: Option<&str>) -> Result<User, AuthError> {
        let claims = self.inner.authenticator.verify(token)?;
        let user_id = claims.sub;

        match self.inner.store.call(move |s| s.find_user(user_id)).await {
            Ok(Some(user)) => Ok(user),
            Ok(None) => Err(AuthError::UnknownIdentity),
            Err(e) => {
                warn!("Identity lookup for {} failed: {:#}", user_id, e);
                Err(AuthError::LookupFailed)
            }
        }
    }

    /// Admit an authenticated user: open the outbound queue, send `ready` and
    /// the current presence snapshot, touch `last_seen`, mark the user online
    /// and bind the optional initial room.
    ///
    /// An unauthorized initial room does not fail the connection; the client
    /// gets an `error` and stays connected without that room.
    pub async fn connect(
        &self,
        user: User,
        chat_id: Option<Uuid>,
    ) -> (Arc<Session>, mpsc::Receiver<GatewayEvent>) {
        let dispatcher = self.dispatcher();
        let (conn_id, rx) = dispatcher.register_connection(user.id);

        dispatcher.send_to_connection(
            conn_id,
            GatewayEvent::Ready {
                user_id: user.id,
                name: user.name.clone(),
            },
        );

        // Let the client see who is already here before we announce ourselves
        for (user_id, status) in dispatcher.presence().snapshot() {
            dispatcher.send_to_connection(conn_id, GatewayEvent::UserStatus { user_id, status });
        }

        let session = Arc::new(Session {
            conn_id,
            user,
            closed: AtomicBool::new(false),
        });

        let user_id = session.user.id;
        let now = Utc::now();
        if let Err(e) = self
            .inner
            .store
            .call(move |s| s.update_user_last_seen(user_id, now))
            .await
        {
            warn!("Failed to persist last seen for {}: {:#}", user_id, e);
        }

        if dispatcher.presence().register(user_id, conn_id) {
            if let Err(e) = self
                .inner
                .store
                .call(move |s| s.set_user_status(user_id, UserStatus::Online))
                .await
            {
                warn!("Failed to persist online status for {}: {:#}", user_id, e);
            }
        }

        info!(
            "{} ({}) connected as {}",
            session.user.name, session.user.id, conn_id
        );

        if let Some(chat_id) = chat_id {
            if let Err(e) = self.join(&session, chat_id).await {
                self.report(&session, &e, None);
            }
        }

        (session, rx)
    }

    // -- Rooms --

    pub async fn join(&self, session: &Session, chat_id: Uuid) -> Result<(), RelayError> {
        let rooms = self.dispatcher().rooms();
        if !rooms.is_member(chat_id, session.conn_id) {
            self.ensure_participant(session.user.id, chat_id).await?;
            rooms.join(chat_id, session.conn_id);
            // Teardown may have cleared the bindings while we awaited the store
            if session.is_closed() {
                rooms.leave(chat_id, session.conn_id);
                return Ok(());
            }
            debug!("{} joined room {}", session.conn_id, chat_id);
        }

        self.dispatcher()
            .send_to_connection(session.conn_id, GatewayEvent::Joined { chat_id });
        Ok(())
    }

    pub fn leave(&self, session: &Session, chat_id: Uuid) {
        if self.dispatcher().rooms().leave(chat_id, session.conn_id) {
            debug!("{} left room {}", session.conn_id, chat_id);
        }
        self.dispatcher()
            .send_to_connection(session.conn_id, GatewayEvent::Left { chat_id });
    }

    // -- Messages --

    /// Message ingress from a connection. The connection must be bound to
    /// the room or be a participant according to the store.
    pub async fn send_message(
        &self,
        session: &Session,
        chat_id: Uuid,
        content: String,
        media_url: Option<String>,
        client_ref: Option<String>,
    ) -> Result<MessageRecord, RelayError> {
        validate_message(&content, media_url.as_deref())?;
        self.ensure_member(session, chat_id).await?;
        self.deliver(&session.user, chat_id, content, media_url, client_ref)
            .await
    }

    /// Message ingress from a caller without a connection (REST).
    pub async fn post_message(
        &self,
        sender: &User,
        chat_id: Uuid,
        content: String,
        media_url: Option<String>,
    ) -> Result<MessageRecord, RelayError> {
        validate_message(&content, media_url.as_deref())?;
        self.ensure_participant(sender.id, chat_id).await?;
        self.deliver(sender, chat_id, content, media_url, None).await
    }

    /// Persist, then broadcast, then update the chat summary, then notify.
    /// Only persistence can fail the operation.
    async fn deliver(
        &self,
        sender: &User,
        chat_id: Uuid,
        content: String,
        media_url: Option<String>,
        client_ref: Option<String>,
    ) -> Result<MessageRecord, RelayError> {
        let draft = NewMessage {
            id: Uuid::new_v4(),
            chat_id,
            sender_id: sender.id,
            content,
            media_url,
            created_at: Utc::now(),
        };

        let message = self
            .inner
            .store
            .call(move |s| s.create_message(&draft))
            .await
            .map_err(|e| {
                warn!("{} ({}) message to {} not saved: {:#}", sender.name, sender.id, chat_id, e);
                RelayError::persistence("message not saved")(e)
            })?;

        let delivered = self.dispatcher().send_to_room(
            chat_id,
            GatewayEvent::Message(MessageEnvelope {
                message: message.clone(),
                client_ref,
            }),
            None,
        );
        debug!(
            "Message {} in {} delivered to {} connections",
            message.id, chat_id, delivered
        );

        let message_id = message.id;
        let now = Utc::now();
        if let Err(e) = self
            .inner
            .store
            .call(move |s| s.update_chat_last_message(chat_id, message_id, now))
            .await
        {
            warn!("Chat {} summary not updated for {}: {:#}", chat_id, message_id, e);
        }

        self.spawn_notifications(sender, chat_id);

        Ok(message)
    }

    /// Best-effort notification rows for every other participant. Detached:
    /// nothing waits on it and failures are only logged.
    fn spawn_notifications(&self, sender: &User, chat_id: Uuid) {
        let store = self.inner.store.clone();
        let sender_id = sender.id;
        let name = if sender.name.trim().is_empty() {
            "Someone".to_string()
        } else {
            sender.name.clone()
        };

        tokio::spawn(async move {
            let result = store
                .call(move |s| {
                    let entries: Vec<NewNotification> = s
                        .chat_participants(chat_id)?
                        .into_iter()
                        .filter(|user_id| *user_id != sender_id)
                        .map(|user_id| NewNotification {
                            user_id,
                            kind: NOTIFICATION_KIND_MESSAGE,
                            content: format!("New message from {}", name),
                            from_user_id: sender_id,
                        })
                        .collect();
                    s.create_notifications(&entries)?;
                    Ok(entries.len())
                })
                .await;

            match result {
                Ok(count) => debug!("Created {} notifications for chat {}", count, chat_id),
                Err(e) => warn!("Notifications for chat {} not created: {:#}", chat_id, e),
            }
        });
    }

    // -- Typing --

    /// Relay typing state to the rest of the room. Not persisted.
    pub async fn set_typing(
        &self,
        session: &Session,
        chat_id: Uuid,
        is_typing: bool,
    ) -> Result<(), RelayError> {
        self.ensure_member(session, chat_id).await?;
        self.dispatcher().send_to_room(
            chat_id,
            GatewayEvent::Typing {
                user_id: session.user.id,
                chat_id,
                is_typing,
            },
            Some(session.conn_id),
        );
        Ok(())
    }

    // -- Read receipts --

    /// Mark everything the other participants sent as read and announce the
    /// receipt to the room. Repeating it changes no rows.
    pub async fn mark_read(&self, session: &Session, chat_id: Uuid) -> Result<usize, RelayError> {
        self.ensure_member(session, chat_id).await?;

        let reader_id = session.user.id;
        let now = Utc::now();
        let count = self
            .inner
            .store
            .call(move |s| s.mark_messages_read(chat_id, reader_id, now))
            .await
            .map_err(|e| {
                warn!("Read receipt for {} in {} failed: {:#}", reader_id, chat_id, e);
                RelayError::persistence("could not mark messages read")(e)
            })?;

        self.dispatcher().send_to_room(
            chat_id,
            GatewayEvent::MessagesRead {
                chat_id,
                read_by: reader_id,
            },
            Some(session.conn_id),
        );
        Ok(count)
    }

    // -- Presence --

    pub async fn heartbeat(&self, user_id: Uuid) -> Result<(), RelayError> {
        let now = Utc::now();
        self.inner
            .store
            .call(move |s| s.update_user_last_seen(user_id, now))
            .await
            .map_err(|e| {
                warn!("Heartbeat for {} not recorded: {:#}", user_id, e);
                RelayError::persistence("could not record heartbeat")(e)
            })
    }

    pub async fn set_status(&self, session: &Session, status: UserStatus) -> Result<(), RelayError> {
        if status == UserStatus::Offline {
            return Err(RelayError::Protocol("status must be online or away".into()));
        }

        let user_id = session.user.id;
        if self.dispatcher().presence().set_status(user_id, status) {
            if let Err(e) = self
                .inner
                .store
                .call(move |s| s.set_user_status(user_id, status))
                .await
            {
                warn!("Failed to persist status {} for {}: {:#}", status, user_id, e);
            }
        }
        Ok(())
    }

    // -- Teardown --

    /// Tear a connection down. Safe to call from both the close path and an
    /// error path: only the first call has any effect.
    pub async fn disconnect(&self, session: &Session) {
        if session.closed.swap(true, Ordering::AcqRel) {
            return;
        }

        let dispatcher = self.dispatcher();
        dispatcher.unregister_connection(session.conn_id);

        let user_id = session.user.id;
        if dispatcher.presence().unregister(user_id, session.conn_id) {
            let now = Utc::now();
            if let Err(e) = self
                .inner
                .store
                .call(move |s| s.update_user_last_seen(user_id, now))
                .await
            {
                warn!("Failed to persist last seen for {}: {:#}", user_id, e);
            }

            // A reconnect may have raced us; the registry has the final say
            if !dispatcher.presence().is_online(user_id) {
                if let Err(e) = self
                    .inner
                    .store
                    .call(move |s| s.set_user_status(user_id, UserStatus::Offline))
                    .await
                {
                    warn!("Failed to persist offline status for {}: {:#}", user_id, e);
                }
            }
        }

        info!(
            "{} ({}) disconnected ({})",
            session.user.name, user_id, session.conn_id
        );
    }

    // -- Command dispatch --

    /// Parse and run one text frame. Malformed frames are answered with an
    /// `error` and otherwise ignored.
    pub async fn handle_text(&self, session: &Session, text: &str) {
        match serde_json::from_str::<GatewayCommand>(text) {
            Ok(cmd) => self.handle_command(session, cmd).await,
            Err(e) => {
                warn!(
                    "{} ({}) bad command: {} -- raw: {}",
                    session.user.name,
                    session.user.id,
                    e,
                    truncate(text, 200)
                );
                self.report(session, &RelayError::Protocol(e.to_string()), None);
            }
        }
    }

    pub async fn handle_command(&self, session: &Session, cmd: GatewayCommand) {
        let (result, client_ref) = match cmd {
            GatewayCommand::SendMessage {
                chat_id,
                content,
                media_url,
                client_ref,
            } => {
                let result = self
                    .send_message(session, chat_id, content, media_url, client_ref.clone())
                    .await
                    .map(|_| ());
                (result, client_ref)
            }

            GatewayCommand::Typing { chat_id, is_typing } => {
                (self.set_typing(session, chat_id, is_typing).await, None)
            }

            GatewayCommand::MarkRead { chat_id } => {
                (self.mark_read(session, chat_id).await.map(|_| ()), None)
            }

            GatewayCommand::Join { chat_id } => (self.join(session, chat_id).await, None),

            GatewayCommand::Leave { chat_id } => {
                self.leave(session, chat_id);
                (Ok(()), None)
            }

            GatewayCommand::Heartbeat => (self.heartbeat(session.user.id).await, None),

            GatewayCommand::SetStatus { status } => (self.set_status(session, status).await, None),
        };

        if let Err(e) = result {
            self.report(session, &e, client_ref);
        }
    }

    /// Deliver an error to the originating connection only.
    fn report(&self, session: &Session, err: &RelayError, client_ref: Option<String>) {
        debug!("{} ({}) error: {}", session.user.name, session.conn_id, err);
        self.dispatcher()
            .send_to_connection(session.conn_id, GatewayEvent::error(err.to_string(), client_ref));
    }

    // -- Membership checks --

    async fn ensure_member(&self, session: &Session, chat_id: Uuid) -> Result<(), RelayError> {
        if self.dispatcher().rooms().is_member(chat_id, session.conn_id) {
            return Ok(());
        }
        self.ensure_participant(session.user.id, chat_id).await
    }

    async fn ensure_participant(&self, user_id: Uuid, chat_id: Uuid) -> Result<(), RelayError> {
        let allowed = self
            .inner
            .store
            .call(move |s| s.is_participant(user_id, chat_id))
            .await
            .map_err(RelayError::persistence("could not verify chat membership"))?;

        if allowed {
            Ok(())
        } else {
            Err(RelayError::Authorization(chat_id))
        }
    }
}

fn validate_message(content: &str, media_url: Option<&str>) -> Result<(), RelayError> {
    let has_media = media_url.is_some_and(|url| !url.trim().is_empty());
    if content.trim().is_empty() && !has_media {
        return Err(RelayError::Protocol("message has no content".into()));
    }
    Ok(())
}

fn truncate(text: &str, max: usize) -> &str {
    match text.char_indices().nth(max) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_message_needs_media() {
        assert!(validate_message("  ", None).is_err());
        assert!(validate_message("", Some(" ")).is_err());
        assert!(validate_message("", Some("https://cdn.example/a.png")).is_ok());
        assert!(validate_message("hi", None).is_ok());
    }

    #[test]
    fn truncate_respects_char_boundaries() {
        assert_eq!(truncate("héllo", 2), "hé");
        assert_eq!(truncate("hi", 200), "hi");
    }
}

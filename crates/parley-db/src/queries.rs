use crate::models::{ChatRow, MessageRow, NotificationRow, UserRow};
use crate::{Database, format_ts, parse_ts};
use anyhow::{Result, anyhow};
use chrono::{DateTime, Utc};
use rusqlite::{Connection, Row};
use uuid::Uuid;

use parley_types::models::{NewMessage, NewNotification, UserStatus};

const USER_COLUMNS: &str =
    "id, name, email, password, profile_image, status, last_seen, created_at";

const MESSAGE_SELECT: &str =
    "SELECT m.id, m.chat_id, m.sender_id, u.name, u.profile_image, m.content, m.media_url,
            m.status, m.is_read, m.created_at
     FROM messages m
     LEFT JOIN users u ON m.sender_id = u.id";

impl Database {
    // -- Users --

    /// Returns false if the email is already registered.
    pub fn create_user(&self, id: &str, name: &str, email: &str, password_hash: &str) -> Result<bool> {
        self.with_conn(|conn| {
            let inserted = conn.execute(
                "INSERT INTO users (id, name, email, password) VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(email) DO NOTHING",
                (id, name, email, password_hash),
            )?;
            Ok(inserted == 1)
        })
    }

    pub fn get_user_by_email(&self, email: &str) -> Result<Option<UserRow>> {
        self.with_conn(|conn| {
            let sql = format!("SELECT {} FROM users WHERE email = ?1", USER_COLUMNS);
            conn.query_row(&sql, [email], user_from_row).optional()
        })
    }

    pub fn get_user_by_id(&self, id: &str) -> Result<Option<UserRow>> {
        self.with_conn(|conn| {
            let sql = format!("SELECT {} FROM users WHERE id = ?1", USER_COLUMNS);
            conn.query_row(&sql, [id], user_from_row).optional()
        })
    }

    /// Moves `last_seen` forward only; an older timestamp is ignored.
    pub fn update_user_last_seen(&self, id: &str, now: DateTime<Utc>) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "UPDATE users SET last_seen = ?2
                 WHERE id = ?1 AND (last_seen IS NULL OR last_seen < ?2)",
                (id, format_ts(now)),
            )?;
            Ok(())
        })
    }

    pub fn set_user_status(&self, id: &str, status: UserStatus) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "UPDATE users SET status = ?2 WHERE id = ?1",
                (id, status.as_str()),
            )?;
            Ok(())
        })
    }

    // -- Chats --

    /// Creates a chat and its participant rows in one transaction.
    pub fn create_chat(
        &self,
        id: &str,
        name: Option<&str>,
        is_group: bool,
        participant_ids: &[String],
        now: DateTime<Utc>,
    ) -> Result<()> {
        self.with_conn(|conn| {
            let tx = conn.unchecked_transaction()?;
            let ts = format_ts(now);
            tx.execute(
                "INSERT INTO chats (id, name, is_group, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?4)",
                rusqlite::params![id, name, is_group, ts],
            )?;
            for user_id in participant_ids {
                tx.execute(
                    "INSERT OR IGNORE INTO participants (chat_id, user_id, joined_at)
                     VALUES (?1, ?2, ?3)",
                    (id, user_id, &ts),
                )?;
            }
            tx.commit()?;
            Ok(())
        })
    }

    pub fn get_chat(&self, id: &str) -> Result<Option<ChatRow>> {
        self.with_conn(|conn| {
            conn.query_row(
                "SELECT id, name, is_group, last_message_id, created_at, updated_at
                 FROM chats WHERE id = ?1",
                [id],
                chat_from_row,
            )
            .optional()
        })
    }

    /// The existing one-to-one chat between two users, if any.
    pub fn find_direct_chat(&self, a: &str, b: &str) -> Result<Option<ChatRow>> {
        self.with_conn(|conn| {
            conn.query_row(
                "SELECT c.id, c.name, c.is_group, c.last_message_id, c.created_at, c.updated_at
                 FROM chats c
                 JOIN participants pa ON pa.chat_id = c.id AND pa.user_id = ?1
                 JOIN participants pb ON pb.chat_id = c.id AND pb.user_id = ?2
                 WHERE c.is_group = 0
                 LIMIT 1",
                (a, b),
                chat_from_row,
            )
            .optional()
        })
    }

    /// Chats the user takes part in, most recently active first.
    pub fn get_chats_for_user(&self, user_id: &str) -> Result<Vec<ChatRow>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT c.id, c.name, c.is_group, c.last_message_id, c.created_at, c.updated_at
                 FROM chats c
                 JOIN participants p ON p.chat_id = c.id
                 WHERE p.user_id = ?1
                 ORDER BY c.updated_at DESC",
            )?;
            let rows = stmt
                .query_map([user_id], chat_from_row)?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }

    pub fn get_participant_ids(&self, chat_id: &str) -> Result<Vec<String>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT user_id FROM participants WHERE chat_id = ?1 ORDER BY joined_at, user_id",
            )?;
            let ids = stmt
                .query_map([chat_id], |row| row.get::<_, String>(0))?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(ids)
        })
    }

    pub fn is_participant(&self, user_id: &str, chat_id: &str) -> Result<bool> {
        self.with_conn(|conn| {
            let found: Option<i64> = conn
                .query_row(
                    "SELECT 1 FROM participants WHERE chat_id = ?1 AND user_id = ?2",
                    (chat_id, user_id),
                    |row| row.get(0),
                )
                .optional()?;
            Ok(found.is_some())
        })
    }

    pub fn update_chat_last_message(
        &self,
        chat_id: &str,
        message_id: &str,
        now: DateTime<Utc>,
    ) -> Result<()> {
        self.with_conn(|conn| {
            let changed = conn.execute(
                "UPDATE chats SET last_message_id = ?2, updated_at = ?3 WHERE id = ?1",
                (chat_id, message_id, format_ts(now)),
            )?;
            if changed == 0 {
                return Err(anyhow!("Chat not found: {}", chat_id));
            }
            Ok(())
        })
    }

    // -- Messages --

    /// Inserts a message and reads it back with the sender's display fields,
    /// so callers only ever see what the store actually holds.
    pub fn insert_message(&self, msg: &NewMessage) -> Result<MessageRow> {
        self.with_conn(|conn| {
            let id = msg.id.to_string();
            conn.execute(
                "INSERT INTO messages (id, chat_id, sender_id, content, media_url, status, is_read, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, 'sent', 0, ?6)",
                rusqlite::params![
                    id,
                    msg.chat_id.to_string(),
                    msg.sender_id.to_string(),
                    msg.content,
                    msg.media_url,
                    format_ts(msg.created_at),
                ],
            )?;
            query_message(conn, &id)?.ok_or_else(|| anyhow!("Message vanished after insert: {}", id))
        })
    }

    pub fn get_message(&self, id: &str) -> Result<Option<MessageRow>> {
        self.with_conn(|conn| query_message(conn, id))
    }

    /// A page of messages in ascending order. `before` is an exclusive
    /// `created_at` cursor for fetching older pages.
    pub fn get_messages(
        &self,
        chat_id: &str,
        limit: u32,
        before: Option<&str>,
    ) -> Result<Vec<MessageRow>> {
        let before = before.map(normalize_cursor);
        self.with_conn(|conn| query_messages(conn, chat_id, limit, before.as_deref(), None))
    }

    /// Like [`Self::get_messages`] with a `(created_at, id)` cursor, so rows
    /// sharing the boundary timestamp are not skipped.
    pub fn get_messages_before(
        &self,
        chat_id: &str,
        limit: u32,
        before_created_at: &str,
        before_id: &str,
    ) -> Result<Vec<MessageRow>> {
        let before = normalize_cursor(before_created_at);
        self.with_conn(|conn| query_messages(conn, chat_id, limit, Some(&before), Some(before_id)))
    }

    /// Bulk read-receipt: every unread message in the chat not sent by the
    /// reader. Returns the number of rows changed.
    pub fn mark_messages_read(&self, chat_id: &str, reader_id: &str, now: DateTime<Utc>) -> Result<usize> {
        self.with_conn(|conn| {
            let changed = conn.execute(
                "UPDATE messages SET is_read = 1, status = 'read', read_at = ?3
                 WHERE chat_id = ?1 AND sender_id != ?2 AND is_read = 0",
                (chat_id, reader_id, format_ts(now)),
            )?;
            Ok(changed)
        })
    }

    // -- Notifications --

    pub fn insert_notifications(&self, entries: &[NewNotification], now: DateTime<Utc>) -> Result<()> {
        if entries.is_empty() {
            return Ok(());
        }

        self.with_conn(|conn| {
            let tx = conn.unchecked_transaction()?;
            let ts = format_ts(now);
            {
                let mut stmt = tx.prepare(
                    "INSERT INTO notifications (id, user_id, kind, content, from_user_id, created_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                )?;
                for entry in entries {
                    stmt.execute(rusqlite::params![
                        Uuid::new_v4().to_string(),
                        entry.user_id.to_string(),
                        entry.kind,
                        entry.content,
                        entry.from_user_id.to_string(),
                        ts,
                    ])?;
                }
            }
            tx.commit()?;
            Ok(())
        })
    }

    pub fn get_notifications(&self, user_id: &str, limit: u32) -> Result<Vec<NotificationRow>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, user_id, kind, content, from_user_id, is_read, created_at
                 FROM notifications
                 WHERE user_id = ?1
                 ORDER BY created_at DESC
                 LIMIT ?2",
            )?;
            let rows = stmt
                .query_map(rusqlite::params![user_id, limit], |row| {
                    Ok(NotificationRow {
                        id: row.get(0)?,
                        user_id: row.get(1)?,
                        kind: row.get(2)?,
                        content: row.get(3)?,
                        from_user_id: row.get(4)?,
                        is_read: row.get(5)?,
                        created_at: row.get(6)?,
                    })
                })?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }

    pub fn unread_notification_count(&self, user_id: &str) -> Result<usize> {
        self.with_conn(|conn| {
            let count: i64 = conn.query_row(
                "SELECT COUNT(*) FROM notifications WHERE user_id = ?1 AND is_read = 0",
                [user_id],
                |row| row.get(0),
            )?;
            Ok(count as usize)
        })
    }

    pub fn mark_all_notifications_read(&self, user_id: &str) -> Result<usize> {
        self.with_conn(|conn| {
            let changed = conn.execute(
                "UPDATE notifications SET is_read = 1 WHERE user_id = ?1 AND is_read = 0",
                [user_id],
            )?;
            Ok(changed)
        })
    }
}

fn user_from_row(row: &Row<'_>) -> rusqlite::Result<UserRow> {
    Ok(UserRow {
        id: row.get(0)?,
        name: row.get(1)?,
        email: row.get(2)?,
        password: row.get(3)?,
        profile_image: row.get(4)?,
        status: row.get(5)?,
        last_seen: row.get(6)?,
        created_at: row.get(7)?,
    })
}

fn chat_from_row(row: &Row<'_>) -> rusqlite::Result<ChatRow> {
    Ok(ChatRow {
        id: row.get(0)?,
        name: row.get(1)?,
        is_group: row.get(2)?,
        last_message_id: row.get(3)?,
        created_at: row.get(4)?,
        updated_at: row.get(5)?,
    })
}

fn message_from_row(row: &Row<'_>) -> rusqlite::Result<MessageRow> {
    Ok(MessageRow {
        id: row.get(0)?,
        chat_id: row.get(1)?,
        sender_id: row.get(2)?,
        sender_name: row
            .get::<_, Option<String>>(3)?
            .unwrap_or_else(|| "unknown".to_string()),
        sender_image: row.get(4)?,
        content: row.get(5)?,
        media_url: row.get(6)?,
        status: row.get(7)?,
        is_read: row.get(8)?,
        created_at: row.get(9)?,
    })
}

fn query_message(conn: &Connection, id: &str) -> Result<Option<MessageRow>> {
    let sql = format!("{} WHERE m.id = ?1", MESSAGE_SELECT);
    conn.query_row(&sql, [id], message_from_row).optional()
}

/// Serialized timestamps may omit a zero fraction; compare in stored layout.
fn normalize_cursor(raw: &str) -> String {
    parse_ts(raw).map(format_ts).unwrap_or_else(|| raw.to_string())
}

fn query_messages(
    conn: &Connection,
    chat_id: &str,
    limit: u32,
    before: Option<&str>,
    before_id: Option<&str>,
) -> Result<Vec<MessageRow>> {
    // Newest page first, then flipped so callers get chronological order
    let sql = format!(
        "{} WHERE m.chat_id = ?1
           AND (?3 IS NULL
                OR m.created_at < ?3
                OR (?4 IS NOT NULL AND m.created_at = ?3 AND m.id < ?4))
         ORDER BY m.created_at DESC, m.id DESC
         LIMIT ?2",
        MESSAGE_SELECT
    );
    let mut stmt = conn.prepare(&sql)?;

    let mut rows = stmt
        .query_map(rusqlite::params![chat_id, limit, before, before_id], message_from_row)?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    rows.reverse();

    Ok(rows)
}

/// Extension trait for optional query results
trait OptionalExt<T> {
    fn optional(self) -> Result<Option<T>>;
}

impl<T> OptionalExt<T> for std::result::Result<T, rusqlite::Error> {
    fn optional(self) -> Result<Option<T>> {
        match self {
            Ok(val) => Ok(Some(val)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

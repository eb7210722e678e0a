use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sqlx::{
    sqlite::{SqliteConnectOptions, SqlitePoolOptions},
    Pool, Row, Sqlite,
};
use std::{fs, path::Path, str::FromStr};
use uuid::Uuid;

use shared::domain::{Contact, ContactKind, Group, GroupId, UserId};
use shared::protocol::{Message, MessageKind};

/// SQLite-backed persistence shared by the relay (users, groups, message
/// archive) and the client cache (whole-value slots).
#[derive(Clone)]
pub struct Storage {
    pool: Pool<Sqlite>,
}

/// Outcome of an identity claim at introduction time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IdentityClaim {
    Accepted,
    /// The id is already owned by a different secret.
    Taken,
}

impl Storage {
    pub async fn new(database_url: &str) -> Result<Self> {
        ensure_sqlite_parent_dir_exists(database_url)?;

        let connect_options = SqliteConnectOptions::from_str(database_url)?.create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(connect_options)
            .await?;
        sqlx::migrate!("./migrations").run(&pool).await?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &Pool<Sqlite> {
        &self.pool
    }

    pub async fn health_check(&self) -> Result<()> {
        let _: i64 = sqlx::query_scalar("SELECT 1")
            .fetch_one(&self.pool)
            .await
            .context("sqlite ping failed")?;
        Ok(())
    }

    // --- users -----------------------------------------------------------

    /// Register or re-verify an identity. A fresh id is inserted; a known id
    /// is accepted only when the presented secret matches the stored one.
    pub async fn claim_identity(
        &self,
        user_id: &UserId,
        name: &str,
        secret: &str,
    ) -> Result<IdentityClaim> {
        let existing = sqlx::query("SELECT secret FROM users WHERE id = ?")
            .bind(user_id.as_str())
            .fetch_optional(&self.pool)
            .await?;

        match existing {
            Some(row) => {
                let stored: String = row.get(0);
                if stored != secret {
                    return Ok(IdentityClaim::Taken);
                }
                sqlx::query("UPDATE users SET name = ?, last_seen = ? WHERE id = ?")
                    .bind(name)
                    .bind(Utc::now().to_rfc3339())
                    .bind(user_id.as_str())
                    .execute(&self.pool)
                    .await?;
                Ok(IdentityClaim::Accepted)
            }
            None => {
                sqlx::query("INSERT INTO users (id, name, secret, last_seen) VALUES (?, ?, ?, ?)")
                    .bind(user_id.as_str())
                    .bind(name)
                    .bind(secret)
                    .bind(Utc::now().to_rfc3339())
                    .execute(&self.pool)
                    .await?;
                Ok(IdentityClaim::Accepted)
            }
        }
    }

    pub async fn user_exists(&self, user_id: &UserId) -> Result<bool> {
        let row = sqlx::query("SELECT 1 FROM users WHERE id = ?")
            .bind(user_id.as_str())
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.is_some())
    }

    pub async fn touch_last_seen(&self, user_id: &UserId, at: DateTime<Utc>) -> Result<()> {
        sqlx::query("UPDATE users SET last_seen = ? WHERE id = ?")
            .bind(at.to_rfc3339())
            .bind(user_id.as_str())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    // --- reciprocal contacts --------------------------------------------

    /// Queue a contact push for an offline user; duplicate contact ids for
    /// the same target are collapsed.
    pub async fn queue_pending_contact(&self, target: &UserId, contact: &Contact) -> Result<()> {
        sqlx::query(
            "INSERT INTO pending_contacts (user_id, contact_id, contact_name) VALUES (?, ?, ?)
             ON CONFLICT(user_id, contact_id) DO NOTHING",
        )
        .bind(target.as_str())
        .bind(&contact.id)
        .bind(&contact.name)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Remove and return all contacts queued for `target`.
    pub async fn drain_pending_contacts(&self, target: &UserId) -> Result<Vec<Contact>> {
        let rows = sqlx::query(
            "DELETE FROM pending_contacts WHERE user_id = ? RETURNING contact_id, contact_name",
        )
        .bind(target.as_str())
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| Contact {
                id: row.get::<String, _>(0),
                name: row.get::<String, _>(1),
                kind: ContactKind::Person,
            })
            .collect())
    }

    // --- groups ----------------------------------------------------------

    pub async fn upsert_group(&self, group: &Group) -> Result<()> {
        let members = serde_json::to_string(&group.members)?;
        sqlx::query(
            "INSERT INTO groups (group_id, name, creator_id, members) VALUES (?, ?, ?, ?)
             ON CONFLICT(group_id) DO UPDATE SET name = excluded.name, members = excluded.members",
        )
        .bind(group.group_id.as_str())
        .bind(&group.name)
        .bind(group.creator_id.as_str())
        .bind(members)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn load_group(&self, group_id: &GroupId) -> Result<Option<Group>> {
        let row = sqlx::query("SELECT group_id, name, creator_id, members FROM groups WHERE group_id = ?")
            .bind(group_id.as_str())
            .fetch_optional(&self.pool)
            .await?;

        row.map(row_to_group).transpose()
    }

    /// Drop a member from a group. Returns false when the group is unknown
    /// or the user was not a member.
    pub async fn remove_group_member(&self, group_id: &GroupId, user_id: &UserId) -> Result<bool> {
        let Some(mut group) = self.load_group(group_id).await? else {
            return Ok(false);
        };
        let before = group.members.len();
        group.members.retain(|m| m != user_id);
        if group.members.len() == before {
            return Ok(false);
        }
        self.upsert_group(&group).await?;
        Ok(true)
    }

    // --- message archive -------------------------------------------------

    pub async fn append_message(&self, message: &Message) -> Result<()> {
        let kind = match message.kind {
            MessageKind::Direct => "direct",
            MessageKind::Group => "group",
        };
        sqlx::query(
            "INSERT INTO messages
               (message_id, chat_key, from_id, from_name, to_id, kind, text, attachment, ts, deleted)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(message_id) DO NOTHING",
        )
        .bind(message.message_id.to_string())
        .bind(message.chat_key().as_str())
        .bind(message.from_id.as_str())
        .bind(&message.from_name)
        .bind(&message.to_id)
        .bind(kind)
        .bind(&message.text)
        .bind(message.attachment.as_deref())
        .bind(message.ts)
        .bind(message.deleted as i64)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Arbitrate an edit. Returns whether a message was actually updated.
    pub async fn edit_message(&self, message_id: Uuid, new_text: &str) -> Result<bool> {
        let affected = sqlx::query(
            "UPDATE messages SET text = ? WHERE message_id = ? AND deleted = 0",
        )
        .bind(format!("{new_text} (edited)"))
        .bind(message_id.to_string())
        .execute(&self.pool)
        .await?
        .rows_affected();
        Ok(affected > 0)
    }

    /// Arbitrate a delete: soft-mark, replace text, drop the attachment.
    pub async fn delete_message(&self, message_id: Uuid) -> Result<bool> {
        let affected = sqlx::query(
            "UPDATE messages SET text = 'message deleted', deleted = 1, attachment = NULL
             WHERE message_id = ?",
        )
        .bind(message_id.to_string())
        .execute(&self.pool)
        .await?
        .rows_affected();
        Ok(affected > 0)
    }

    pub async fn load_message(&self, message_id: Uuid) -> Result<Option<Message>> {
        let row = sqlx::query(
            "SELECT message_id, from_id, from_name, to_id, kind, text, attachment, ts, deleted
             FROM messages WHERE message_id = ?",
        )
        .bind(message_id.to_string())
        .fetch_optional(&self.pool)
        .await?;
        row.map(row_to_message).transpose()
    }

    pub async fn messages_for_key(&self, chat_key: &str) -> Result<Vec<Message>> {
        let rows = sqlx::query(
            "SELECT message_id, from_id, from_name, to_id, kind, text, attachment, ts, deleted
             FROM messages WHERE chat_key = ? ORDER BY rowid",
        )
        .bind(chat_key)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(row_to_message).collect()
    }

    // --- client cache slots ----------------------------------------------

    /// Whole-value read of a cache slot. Absent slots are `None`.
    pub async fn load_slot(&self, slot: &str) -> Result<Option<String>> {
        let row = sqlx::query("SELECT value FROM cache_slots WHERE slot = ?")
            .bind(slot)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|r| r.get::<String, _>(0)))
    }

    /// Whole-value overwrite of a cache slot. No cross-slot atomicity.
    pub async fn save_slot(&self, slot: &str, value: &str) -> Result<()> {
        sqlx::query(
            "INSERT INTO cache_slots (slot, value) VALUES (?, ?)
             ON CONFLICT(slot) DO UPDATE SET value = excluded.value",
        )
        .bind(slot)
        .bind(value)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

fn row_to_group(row: sqlx::sqlite::SqliteRow) -> Result<Group> {
    let members: Vec<UserId> = serde_json::from_str(&row.get::<String, _>(3))
        .context("corrupt members column in groups table")?;
    Ok(Group {
        group_id: GroupId::new(row.get::<String, _>(0)),
        name: row.get::<String, _>(1),
        creator_id: UserId::new(row.get::<String, _>(2)),
        members,
    })
}

fn row_to_message(row: sqlx::sqlite::SqliteRow) -> Result<Message> {
    let id_text: String = row.get(0);
    let kind = match row.get::<String, _>(4).as_str() {
        "group" => MessageKind::Group,
        _ => MessageKind::Direct,
    };
    Ok(Message {
        message_id: Uuid::parse_str(&id_text).context("corrupt message_id column")?,
        from_id: UserId::new(row.get::<String, _>(1)),
        from_name: row.get::<String, _>(2),
        to_id: row.get::<String, _>(3),
        kind,
        text: row.get::<String, _>(5),
        attachment: row.get::<Option<String>, _>(6),
        ts: row.get::<i64, _>(7),
        deleted: row.get::<i64, _>(8) != 0,
    })
}

fn ensure_sqlite_parent_dir_exists(database_url: &str) -> Result<()> {
    if database_url == "sqlite::memory:" || !database_url.starts_with("sqlite:") {
        return Ok(());
    }
    let path = database_url
        .trim_start_matches("sqlite://")
        .trim_start_matches("sqlite:")
        .split('?')
        .next()
        .unwrap_or_default();
    if path.is_empty() {
        return Ok(());
    }
    if let Some(parent) = Path::new(path).parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)
                .with_context(|| format!("failed to create database directory for '{database_url}'"))?;
        }
    }
    Ok(())
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;

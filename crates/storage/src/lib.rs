use std::{
    collections::HashSet,
    fs,
    path::{Path, PathBuf},
    str::FromStr,
};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sqlx::{
    sqlite::{SqliteConnectOptions, SqlitePoolOptions},
    Pool, Row, Sqlite,
};

use shared::domain::{ConversationId, Message, MessageId, UserId};

#[derive(Clone)]
pub struct Storage {
    pool: Pool<Sqlite>,
}

/// Last-known content for a conversation, shown on cold start before the
/// first resync completes.
#[derive(Debug, Clone)]
pub struct ConversationSnapshot {
    pub conversation_id: ConversationId,
    pub messages: Vec<Message>,
    pub last_known_at: Option<DateTime<Utc>>,
    pub last_sync_at: Option<DateTime<Utc>>,
}

impl Storage {
    pub async fn new(database_url: &str) -> Result<Self> {
        let database_url = normalize_database_url(database_url);
        ensure_sqlite_parent_dir_exists(&database_url)?;

        let connect_options =
            SqliteConnectOptions::from_str(&database_url)?.create_if_missing(true);
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

    pub async fn save_snapshot(
        &self,
        device_user_id: &UserId,
        snapshot: &ConversationSnapshot,
    ) -> Result<()> {
        let messages_json =
            serde_json::to_string(&snapshot.messages).context("serialize snapshot messages")?;
        sqlx::query(
            "INSERT INTO conversation_snapshots
                 (device_user_id, conversation_id, messages_json, last_known_at, last_sync_at, updated_at)
             VALUES (?, ?, ?, ?, ?, CURRENT_TIMESTAMP)
             ON CONFLICT(device_user_id, conversation_id) DO UPDATE SET
                 messages_json = excluded.messages_json,
                 last_known_at = excluded.last_known_at,
                 last_sync_at = excluded.last_sync_at,
                 updated_at = CURRENT_TIMESTAMP",
        )
        .bind(&device_user_id.0)
        .bind(&snapshot.conversation_id.0)
        .bind(messages_json)
        .bind(snapshot.last_known_at)
        .bind(snapshot.last_sync_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn load_snapshot(
        &self,
        device_user_id: &UserId,
        conversation_id: &ConversationId,
    ) -> Result<Option<ConversationSnapshot>> {
        let row = sqlx::query(
            "SELECT messages_json, last_known_at, last_sync_at
             FROM conversation_snapshots
             WHERE device_user_id = ? AND conversation_id = ?",
        )
        .bind(&device_user_id.0)
        .bind(&conversation_id.0)
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };

        let messages_json: String = row.try_get("messages_json")?;
        let messages: Vec<Message> =
            serde_json::from_str(&messages_json).context("deserialize snapshot messages")?;
        Ok(Some(ConversationSnapshot {
            conversation_id: conversation_id.clone(),
            messages,
            last_known_at: row.try_get("last_known_at")?,
            last_sync_at: row.try_get("last_sync_at")?,
        }))
    }

    pub async fn delete_snapshot(
        &self,
        device_user_id: &UserId,
        conversation_id: &ConversationId,
    ) -> Result<()> {
        sqlx::query(
            "DELETE FROM conversation_snapshots
             WHERE device_user_id = ? AND conversation_id = ?",
        )
        .bind(&device_user_id.0)
        .bind(&conversation_id.0)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn hide_message(
        &self,
        device_user_id: &UserId,
        conversation_id: &ConversationId,
        message_id: &MessageId,
    ) -> Result<()> {
        sqlx::query(
            "INSERT INTO hidden_messages (device_user_id, conversation_id, message_id)
             VALUES (?, ?, ?)
             ON CONFLICT(device_user_id, conversation_id, message_id) DO NOTHING",
        )
        .bind(&device_user_id.0)
        .bind(&conversation_id.0)
        .bind(&message_id.0)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn unhide_message(
        &self,
        device_user_id: &UserId,
        conversation_id: &ConversationId,
        message_id: &MessageId,
    ) -> Result<bool> {
        let result = sqlx::query(
            "DELETE FROM hidden_messages
             WHERE device_user_id = ? AND conversation_id = ? AND message_id = ?",
        )
        .bind(&device_user_id.0)
        .bind(&conversation_id.0)
        .bind(&message_id.0)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn hidden_messages(
        &self,
        device_user_id: &UserId,
        conversation_id: &ConversationId,
    ) -> Result<HashSet<MessageId>> {
        let rows = sqlx::query(
            "SELECT message_id FROM hidden_messages
             WHERE device_user_id = ? AND conversation_id = ?",
        )
        .bind(&device_user_id.0)
        .bind(&conversation_id.0)
        .fetch_all(&self.pool)
        .await?;

        let mut hidden = HashSet::new();
        for row in rows {
            hidden.insert(MessageId(row.try_get::<String, _>("message_id")?));
        }
        Ok(hidden)
    }
}

fn normalize_database_url(raw_database_url: &str) -> String {
    let raw_database_url = raw_database_url.trim();

    if raw_database_url.is_empty() {
        return "sqlite://./data/client.db".to_string();
    }

    if raw_database_url.starts_with("sqlite::memory:")
        || raw_database_url.starts_with("sqlite://")
        || raw_database_url.contains("://")
    {
        return raw_database_url.to_string();
    }

    if let Some(path) = raw_database_url.strip_prefix("sqlite:") {
        let path = path.replace('\\', "/");
        return format!("sqlite://{path}");
    }

    format!("sqlite://{}", raw_database_url.replace('\\', "/"))
}

fn ensure_sqlite_parent_dir_exists(database_url: &str) -> Result<()> {
    let Some(path) = sqlite_path(database_url) else {
        return Ok(());
    };

    let Some(parent) = path.parent() else {
        return Ok(());
    };

    fs::create_dir_all(parent).with_context(|| {
        format!(
            "failed to create parent directory '{}' for database url '{database_url}'",
            parent.display()
        )
    })?;

    Ok(())
}

fn sqlite_path(database_url: &str) -> Option<PathBuf> {
    if database_url == "sqlite::memory:" || !database_url.starts_with("sqlite:") {
        return None;
    }

    let path = database_url
        .trim_start_matches("sqlite://")
        .trim_start_matches("sqlite:")
        .split('?')
        .next()
        .unwrap_or_default();

    if path.is_empty() {
        return None;
    }

    Some(Path::new(path).to_path_buf())
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;

use std::{fs, path::Path, str::FromStr};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sqlx::{
    sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow},
    Pool, Row, Sqlite,
};

use shared::domain::{AttachmentKind, CallId, FileId, GroupId, MessageId, UserId};

/// Directory store backing the chat core: users, groups, messages, and
/// uploaded file blobs, all on a single SQLite pool.
#[derive(Clone)]
pub struct Storage {
    pool: Pool<Sqlite>,
}

#[derive(Debug, Clone)]
pub struct StoredUser {
    pub id: UserId,
    pub username: String,
    pub password_hash: String,
    pub description: String,
    pub avatar: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct StoredGroup {
    pub id: GroupId,
    pub name: String,
    pub description: String,
    pub creator_id: UserId,
    pub members: Vec<UserId>,
    pub avatar: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct StoredAttachment {
    pub kind: AttachmentKind,
    pub storage_key: FileId,
    pub display_name: String,
    pub url: String,
}

#[derive(Debug, Clone)]
pub struct StoredMessage {
    pub id: MessageId,
    pub from_user_id: UserId,
    pub to_user_id: Option<UserId>,
    pub to_group_id: Option<GroupId>,
    pub content: String,
    pub attachment: Option<StoredAttachment>,
    pub call_id: Option<CallId>,
    pub created_at: DateTime<Utc>,
    pub edited: bool,
    pub call_ended: bool,
}

/// Message fields supplied by the router at send time. Id and timestamp are
/// assigned here.
#[derive(Debug, Clone)]
pub struct NewMessage {
    pub from_user_id: UserId,
    pub to_user_id: Option<UserId>,
    pub to_group_id: Option<GroupId>,
    pub content: String,
    pub attachment: Option<StoredAttachment>,
    pub call_id: Option<CallId>,
}

#[derive(Debug, Clone)]
pub struct StoredFile {
    pub id: FileId,
    pub owner_id: UserId,
    pub display_name: String,
    pub mime_type: Option<String>,
    pub size_bytes: i64,
    pub data: Vec<u8>,
}

const MESSAGE_COLUMNS: &str = "id, from_user_id, to_user_id, to_group_id, content, \
     attachment_kind, attachment_storage_key, attachment_display_name, attachment_url, \
     call_id, created_at, edited, call_ended";

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

    // --- users ---

    pub async fn create_user(&self, username: &str, password_hash: &str) -> Result<StoredUser> {
        let user = StoredUser {
            id: UserId::generate(),
            username: username.to_string(),
            password_hash: password_hash.to_string(),
            description: String::new(),
            avatar: None,
            created_at: Utc::now(),
        };
        sqlx::query(
            "INSERT INTO users (id, username, password_hash, description, avatar, created_at)
             VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(&user.id.0)
        .bind(&user.username)
        .bind(&user.password_hash)
        .bind(&user.description)
        .bind(&user.avatar)
        .bind(user.created_at)
        .execute(&self.pool)
        .await
        .context("failed to insert user")?;
        Ok(user)
    }

    pub async fn find_user(&self, user_id: &UserId) -> Result<Option<StoredUser>> {
        let row = sqlx::query(
            "SELECT id, username, password_hash, description, avatar, created_at
             FROM users WHERE id = ?",
        )
        .bind(&user_id.0)
        .fetch_optional(&self.pool)
        .await?;
        row.map(|r| user_from_row(&r)).transpose()
    }

    pub async fn find_user_by_username(&self, username: &str) -> Result<Option<StoredUser>> {
        let row = sqlx::query(
            "SELECT id, username, password_hash, description, avatar, created_at
             FROM users WHERE username = ?",
        )
        .bind(username)
        .fetch_optional(&self.pool)
        .await?;
        row.map(|r| user_from_row(&r)).transpose()
    }

    pub async fn list_users(&self) -> Result<Vec<StoredUser>> {
        let rows = sqlx::query(
            "SELECT id, username, password_hash, description, avatar, created_at
             FROM users ORDER BY username",
        )
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(user_from_row).collect()
    }

    pub async fn update_user_description(
        &self,
        user_id: &UserId,
        description: &str,
    ) -> Result<bool> {
        let result = sqlx::query("UPDATE users SET description = ? WHERE id = ?")
            .bind(description)
            .bind(&user_id.0)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn update_user_avatar(&self, user_id: &UserId, avatar_url: &str) -> Result<bool> {
        let result = sqlx::query("UPDATE users SET avatar = ? WHERE id = ?")
            .bind(avatar_url)
            .bind(&user_id.0)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    // --- groups ---

    /// Creates a group; the creator becomes the first member.
    pub async fn create_group(
        &self,
        name: &str,
        description: &str,
        creator_id: &UserId,
    ) -> Result<StoredGroup> {
        let group_id = GroupId::generate();
        let created_at = Utc::now();
        let mut tx = self.pool.begin().await?;
        sqlx::query(
            "INSERT INTO groups (id, name, description, creator_id, avatar, created_at)
             VALUES (?, ?, ?, ?, NULL, ?)",
        )
        .bind(&group_id.0)
        .bind(name)
        .bind(description)
        .bind(&creator_id.0)
        .bind(created_at)
        .execute(&mut *tx)
        .await?;
        sqlx::query("INSERT INTO group_members (group_id, user_id) VALUES (?, ?)")
            .bind(&group_id.0)
            .bind(&creator_id.0)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;

        Ok(StoredGroup {
            id: group_id,
            name: name.to_string(),
            description: description.to_string(),
            creator_id: creator_id.clone(),
            members: vec![creator_id.clone()],
            avatar: None,
            created_at,
        })
    }

    pub async fn find_group(&self, group_id: &GroupId) -> Result<Option<StoredGroup>> {
        let row = sqlx::query(
            "SELECT id, name, description, creator_id, avatar, created_at
             FROM groups WHERE id = ?",
        )
        .bind(&group_id.0)
        .fetch_optional(&self.pool)
        .await?;
        let Some(row) = row else {
            return Ok(None);
        };
        let members = self.group_members(group_id).await?;
        Ok(Some(group_from_row(&row, members)?))
    }

    pub async fn list_groups(&self) -> Result<Vec<StoredGroup>> {
        let rows = sqlx::query(
            "SELECT id, name, description, creator_id, avatar, created_at
             FROM groups ORDER BY created_at",
        )
        .fetch_all(&self.pool)
        .await?;
        let mut groups = Vec::with_capacity(rows.len());
        for row in &rows {
            let group_id = GroupId(row.try_get::<String, _>("id")?);
            let members = self.group_members(&group_id).await?;
            groups.push(group_from_row(row, members)?);
        }
        Ok(groups)
    }

    /// Idempotent; returns false when the user was already a member.
    pub async fn add_group_member(&self, group_id: &GroupId, user_id: &UserId) -> Result<bool> {
        let result =
            sqlx::query("INSERT OR IGNORE INTO group_members (group_id, user_id) VALUES (?, ?)")
                .bind(&group_id.0)
                .bind(&user_id.0)
                .execute(&self.pool)
                .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn remove_group_member(&self, group_id: &GroupId, user_id: &UserId) -> Result<bool> {
        let result = sqlx::query("DELETE FROM group_members WHERE group_id = ? AND user_id = ?")
            .bind(&group_id.0)
            .bind(&user_id.0)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn group_members(&self, group_id: &GroupId) -> Result<Vec<UserId>> {
        let rows = sqlx::query("SELECT user_id FROM group_members WHERE group_id = ?")
            .bind(&group_id.0)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows
            .iter()
            .filter_map(|r| r.try_get::<String, _>("user_id").ok())
            .map(UserId)
            .collect())
    }

    pub async fn is_group_member(&self, group_id: &GroupId, user_id: &UserId) -> Result<bool> {
        let row =
            sqlx::query("SELECT 1 FROM group_members WHERE group_id = ? AND user_id = ? LIMIT 1")
                .bind(&group_id.0)
                .bind(&user_id.0)
                .fetch_optional(&self.pool)
                .await?;
        Ok(row.is_some())
    }

    // --- messages ---

    pub async fn insert_message(&self, new: NewMessage) -> Result<StoredMessage> {
        let message = StoredMessage {
            id: MessageId::generate(),
            from_user_id: new.from_user_id,
            to_user_id: new.to_user_id,
            to_group_id: new.to_group_id,
            content: new.content,
            attachment: new.attachment,
            call_id: new.call_id,
            created_at: Utc::now(),
            edited: false,
            call_ended: false,
        };
        sqlx::query(
            "INSERT INTO messages (id, from_user_id, to_user_id, to_group_id, content,
                 attachment_kind, attachment_storage_key, attachment_display_name, attachment_url,
                 call_id, created_at, edited, call_ended)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, 0, 0)",
        )
        .bind(&message.id.0)
        .bind(&message.from_user_id.0)
        .bind(message.to_user_id.as_ref().map(|id| id.0.clone()))
        .bind(message.to_group_id.as_ref().map(|id| id.0.clone()))
        .bind(&message.content)
        .bind(message.attachment.as_ref().map(|a| a.kind.as_str()))
        .bind(message.attachment.as_ref().map(|a| a.storage_key.0.clone()))
        .bind(message.attachment.as_ref().map(|a| a.display_name.clone()))
        .bind(message.attachment.as_ref().map(|a| a.url.clone()))
        .bind(message.call_id.as_ref().map(|id| id.0.clone()))
        .bind(message.created_at)
        .execute(&self.pool)
        .await
        .context("failed to insert message")?;
        Ok(message)
    }

    pub async fn find_message(&self, message_id: &MessageId) -> Result<Option<StoredMessage>> {
        let row = sqlx::query(&format!(
            "SELECT {MESSAGE_COLUMNS} FROM messages WHERE id = ?"
        ))
        .bind(&message_id.0)
        .fetch_optional(&self.pool)
        .await?;
        row.map(|r| message_from_row(&r)).transpose()
    }

    /// Author-checked edit as a single conditional statement, so a concurrent
    /// edit cannot interleave between the authorship check and the write.
    /// Returns the updated row, or None when the message is missing or the
    /// caller is not the author.
    pub async fn update_message_content(
        &self,
        message_id: &MessageId,
        author_id: &UserId,
        content: &str,
    ) -> Result<Option<StoredMessage>> {
        let row = sqlx::query(&format!(
            "UPDATE messages SET content = ?, edited = 1
             WHERE id = ? AND from_user_id = ?
             RETURNING {MESSAGE_COLUMNS}"
        ))
        .bind(content)
        .bind(&message_id.0)
        .bind(&author_id.0)
        .fetch_optional(&self.pool)
        .await?;
        row.map(|r| message_from_row(&r)).transpose()
    }

    /// Author-checked removal; returns the deleted row so the router can
    /// compute its original destination set.
    pub async fn delete_message(
        &self,
        message_id: &MessageId,
        author_id: &UserId,
    ) -> Result<Option<StoredMessage>> {
        let row = sqlx::query(&format!(
            "DELETE FROM messages WHERE id = ? AND from_user_id = ?
             RETURNING {MESSAGE_COLUMNS}"
        ))
        .bind(&message_id.0)
        .bind(&author_id.0)
        .fetch_optional(&self.pool)
        .await?;
        row.map(|r| message_from_row(&r)).transpose()
    }

    /// History feed for one identity: direct/self traffic plus messages sent
    /// to any group the identity currently belongs to, in send order.
    pub async fn messages_for_user(&self, user_id: &UserId) -> Result<Vec<StoredMessage>> {
        let rows = sqlx::query(&format!(
            "SELECT {MESSAGE_COLUMNS} FROM messages
             WHERE from_user_id = ?1
                OR to_user_id = ?1
                OR to_group_id IN (SELECT group_id FROM group_members WHERE user_id = ?1)
             ORDER BY seq"
        ))
        .bind(&user_id.0)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(message_from_row).collect()
    }

    /// Marks the most recent message carrying `call_id` as a terminated call.
    /// Single statement; two racing leaves cannot both observe a pre-mutation
    /// row and diverge.
    pub async fn mark_call_ended(
        &self,
        call_id: &CallId,
        content: &str,
    ) -> Result<Option<StoredMessage>> {
        let row = sqlx::query(&format!(
            "UPDATE messages SET content = ?, call_ended = 1
             WHERE seq = (SELECT MAX(seq) FROM messages WHERE call_id = ?)
             RETURNING {MESSAGE_COLUMNS}"
        ))
        .bind(content)
        .bind(&call_id.0)
        .fetch_optional(&self.pool)
        .await?;
        row.map(|r| message_from_row(&r)).transpose()
    }

    // --- files ---

    pub async fn store_file(
        &self,
        owner_id: &UserId,
        display_name: &str,
        mime_type: Option<&str>,
        data: &[u8],
    ) -> Result<StoredFile> {
        let file = StoredFile {
            id: FileId::generate(),
            owner_id: owner_id.clone(),
            display_name: display_name.to_string(),
            mime_type: mime_type.map(str::to_string),
            size_bytes: data.len() as i64,
            data: data.to_vec(),
        };
        sqlx::query(
            "INSERT INTO files (id, owner_id, display_name, mime_type, size_bytes, data, created_at)
             VALUES (?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&file.id.0)
        .bind(&file.owner_id.0)
        .bind(&file.display_name)
        .bind(&file.mime_type)
        .bind(file.size_bytes)
        .bind(&file.data)
        .bind(Utc::now())
        .execute(&self.pool)
        .await
        .context("failed to store file")?;
        Ok(file)
    }

    pub async fn load_file(&self, file_id: &FileId) -> Result<Option<StoredFile>> {
        let row = sqlx::query(
            "SELECT id, owner_id, display_name, mime_type, size_bytes, data
             FROM files WHERE id = ?",
        )
        .bind(&file_id.0)
        .fetch_optional(&self.pool)
        .await?;
        let Some(row) = row else {
            return Ok(None);
        };
        Ok(Some(StoredFile {
            id: FileId(row.try_get("id")?),
            owner_id: UserId(row.try_get("owner_id")?),
            display_name: row.try_get("display_name")?,
            mime_type: row.try_get("mime_type")?,
            size_bytes: row.try_get("size_bytes")?,
            data: row.try_get("data")?,
        }))
    }
}

fn user_from_row(row: &SqliteRow) -> Result<StoredUser> {
    Ok(StoredUser {
        id: UserId(row.try_get("id")?),
        username: row.try_get("username")?,
        password_hash: row.try_get("password_hash")?,
        description: row.try_get("description")?,
        avatar: row.try_get("avatar")?,
        created_at: row.try_get("created_at")?,
    })
}

fn group_from_row(row: &SqliteRow, members: Vec<UserId>) -> Result<StoredGroup> {
    Ok(StoredGroup {
        id: GroupId(row.try_get("id")?),
        name: row.try_get("name")?,
        description: row.try_get("description")?,
        creator_id: UserId(row.try_get("creator_id")?),
        members,
        avatar: row.try_get("avatar")?,
        created_at: row.try_get("created_at")?,
    })
}

fn message_from_row(row: &SqliteRow) -> Result<StoredMessage> {
    let attachment = match row.try_get::<Option<String>, _>("attachment_kind")? {
        Some(kind) => Some(StoredAttachment {
            kind: kind
                .parse::<AttachmentKind>()
                .map_err(anyhow::Error::msg)?,
            storage_key: FileId(row.try_get("attachment_storage_key")?),
            display_name: row.try_get("attachment_display_name")?,
            url: row.try_get("attachment_url")?,
        }),
        None => None,
    };
    Ok(StoredMessage {
        id: MessageId(row.try_get("id")?),
        from_user_id: UserId(row.try_get("from_user_id")?),
        to_user_id: row.try_get::<Option<String>, _>("to_user_id")?.map(UserId),
        to_group_id: row
            .try_get::<Option<String>, _>("to_group_id")?
            .map(GroupId),
        content: row.try_get("content")?,
        attachment,
        call_id: row.try_get::<Option<String>, _>("call_id")?.map(CallId),
        created_at: row.try_get("created_at")?,
        edited: row.try_get("edited")?,
        call_ended: row.try_get("call_ended")?,
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
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create parent directory for '{database_url}'"))?;
    }
    Ok(())
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;

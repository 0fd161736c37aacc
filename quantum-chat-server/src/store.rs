use std::str::FromStr;

use anyhow::anyhow;
use quantum_chat_proto::MessageRecord;
use sqlx::{SqlitePool, sqlite::SqliteConnectOptions, types::time::OffsetDateTime};

#[derive(Clone, Debug, sqlx::FromRow)]
pub struct User {
    pub id: i64,
    pub username: String,
    pub password_hash: String,
    pub public_key: Vec<u8>,
}

#[derive(Clone, Debug, sqlx::FromRow)]
pub struct UserListing {
    pub id: i64,
    pub username: String,
    pub created_at: OffsetDateTime,
}

#[derive(Clone, Debug, sqlx::FromRow)]
pub struct StoredMessage {
    pub id: i64,
    pub sender_id: i64,
    pub receiver_id: i64,
    pub content: String,
    pub timestamp: i64,
    pub read: bool,
}

impl From<StoredMessage> for MessageRecord {
    fn from(msg: StoredMessage) -> Self {
        // content was written as JSON text; fall back to the raw string otherwise
        let content = serde_json::from_str(&msg.content)
            .unwrap_or(serde_json::Value::String(msg.content));

        MessageRecord {
            id: msg.id,
            sender_id: msg.sender_id,
            receiver_id: msg.receiver_id,
            content,
            timestamp: msg.timestamp,
            read: msg.read,
        }
    }
}

#[derive(Debug)]
pub struct NewMessage<'a> {
    pub sender_id: i64,
    pub receiver_id: i64,
    pub content: &'a str,
    pub timestamp: i64,
}

pub async fn connect(database_url: &str) -> anyhow::Result<SqlitePool> {
    let db_opts = SqliteConnectOptions::from_str(database_url)?.create_if_missing(true);
    let pool = SqlitePool::connect_with(db_opts).await?;
    sqlx::migrate!()
        .run(&pool)
        .await
        .map_err(|e| anyhow!("failed to initialize SQLx database: {e}"))?;

    Ok(pool)
}

pub async fn create_user(
    pool: &SqlitePool,
    username: &str,
    password_hash: &str,
    public_key: &[u8],
) -> Result<User, sqlx::Error> {
    sqlx::query_as::<_, User>(
        "INSERT INTO users (username, password_hash, public_key) \
            VALUES (?, ?, ?) \
            RETURNING id, username, password_hash, public_key",
    )
    .bind(username)
    .bind(password_hash)
    .bind(public_key)
    .fetch_one(pool)
    .await
}

pub async fn user_by_name(pool: &SqlitePool, username: &str) -> Result<Option<User>, sqlx::Error> {
    sqlx::query_as::<_, User>(
        "SELECT id, username, password_hash, public_key FROM users WHERE username = ?",
    )
    .bind(username)
    .fetch_optional(pool)
    .await
}

pub async fn user_by_id(pool: &SqlitePool, id: i64) -> Result<Option<User>, sqlx::Error> {
    sqlx::query_as::<_, User>(
        "SELECT id, username, password_hash, public_key FROM users WHERE id = ?",
    )
    .bind(id)
    .fetch_optional(pool)
    .await
}

pub async fn user_exists(pool: &SqlitePool, id: i64) -> Result<bool, sqlx::Error> {
    let found: Option<i64> = sqlx::query_scalar("SELECT id FROM users WHERE id = ?")
        .bind(id)
        .fetch_optional(pool)
        .await?;

    Ok(found.is_some())
}

pub async fn list_users(pool: &SqlitePool) -> Result<Vec<UserListing>, sqlx::Error> {
    sqlx::query_as::<_, UserListing>("SELECT id, username, created_at FROM users ORDER BY id")
        .fetch_all(pool)
        .await
}

pub async fn remove_user(pool: &SqlitePool, id: i64) -> Result<u64, sqlx::Error> {
    Ok(sqlx::query("DELETE FROM users WHERE id = ?")
        .bind(id)
        .execute(pool)
        .await?
        .rows_affected())
}

pub async fn rename_user(pool: &SqlitePool, id: i64, username: &str) -> Result<u64, sqlx::Error> {
    Ok(sqlx::query("UPDATE users SET username = ? WHERE id = ?")
        .bind(username)
        .bind(id)
        .execute(pool)
        .await?
        .rows_affected())
}

/// Persist a chat message and return its id.
pub async fn save_message(pool: &SqlitePool, msg: NewMessage<'_>) -> Result<i64, sqlx::Error> {
    sqlx::query_scalar(
        "INSERT INTO messages (sender_id, receiver_id, content, timestamp, read) \
            VALUES (?, ?, ?, ?, FALSE) \
            RETURNING id",
    )
    .bind(msg.sender_id)
    .bind(msg.receiver_id)
    .bind(msg.content)
    .bind(msg.timestamp)
    .fetch_one(pool)
    .await
}

/// Messages a user sent or received, newest first.
pub async fn recent_messages(
    pool: &SqlitePool,
    user_id: i64,
    limit: i64,
) -> Result<Vec<StoredMessage>, sqlx::Error> {
    sqlx::query_as::<_, StoredMessage>(
        "SELECT id, sender_id, receiver_id, content, timestamp, read \
            FROM messages \
            WHERE sender_id = ?1 OR receiver_id = ?1 \
            ORDER BY timestamp DESC, id DESC \
            LIMIT ?2",
    )
    .bind(user_id)
    .bind(limit)
    .fetch_all(pool)
    .await
}

pub fn is_unique_violation(err: &sqlx::Error) -> bool {
    err.as_database_error()
        .is_some_and(|e| e.is_unique_violation())
}

#[cfg(test)]
pub(crate) async fn memory_pool() -> SqlitePool {
    use sqlx::sqlite::SqlitePoolOptions;

    // a single long-lived connection keeps the in-memory database alive
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .idle_timeout(None)
        .max_lifetime(None)
        .connect_with(SqliteConnectOptions::from_str("sqlite::memory:").unwrap())
        .await
        .unwrap();
    sqlx::migrate!().run(&pool).await.unwrap();
    pool
}

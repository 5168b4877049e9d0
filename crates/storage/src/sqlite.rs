//! SQLite durable store.
//!
//! Uses a single SQLite database file with two tables:
//! - `sessions` — one row per conversation
//! - `messages` — append-only message rows
//!
//! A unique index on `(session_id, role, origin_at, content)` makes a replay
//! of an already persisted message surface as a conflict even when it
//! carries no id. `origin_at` is the creation time the producer gave the
//! message, or 0 when it gave none and the row was stamped on receipt.

use async_trait::async_trait;
use chatline_core::error::StoreError;
use chatline_core::message::{Message, Role, Session};
use chatline_core::store::{MessageStore, SessionStore};
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use sqlx::{Row, SqliteConnection, SqlitePool};
use std::str::FromStr;
use tracing::{debug, info};

/// Open a pool for `url`, creating the database file (and its directory)
/// if missing. In-memory databases get a single connection so every query
/// sees the same data.
pub async fn connect(url: &str, max_connections: u32) -> Result<SqlitePool, StoreError> {
    let options = SqliteConnectOptions::from_str(url)
        .map_err(|e| StoreError::Storage(format!("Invalid SQLite URL: {e}")))?
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .synchronous(SqliteSynchronous::Normal)
        .busy_timeout(std::time::Duration::from_secs(5));

    let in_memory = url.contains(":memory:");
    if !in_memory {
        if let Some(dir) = options.get_filename().parent() {
            if !dir.as_os_str().is_empty() {
                std::fs::create_dir_all(dir).map_err(|e| {
                    StoreError::Storage(format!("Failed to create {}: {e}", dir.display()))
                })?;
            }
        }
    }

    let pool = SqlitePoolOptions::new()
        .max_connections(if in_memory { 1 } else { max_connections.max(1) })
        .connect_with(options)
        .await
        .map_err(|e| StoreError::Storage(format!("Failed to open SQLite: {e}")))?;

    info!("SQLite pool opened at {url}");
    Ok(pool)
}

/// Map a write error, classifying unique-key violations as conflicts.
fn write_error(what: &str, e: sqlx::Error) -> StoreError {
    let unique = e
        .as_database_error()
        .is_some_and(|db| db.is_unique_violation());
    if unique {
        StoreError::Conflict(format!("{what}: {e}"))
    } else {
        StoreError::Storage(format!("{what}: {e}"))
    }
}

fn millis_to_datetime(ms: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(ms).unwrap_or_default()
}

/// A production SQLite store for sessions and messages.
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// Open (or create) the database at `url`.
    ///
    /// Pass `"sqlite::memory:"` for an in-process ephemeral database (useful for tests).
    pub async fn new(url: &str) -> Result<Self, StoreError> {
        let pool = connect(url, 4).await?;
        Self::from_pool(pool).await
    }

    /// Create from an existing pool (shared with the cache and queue tables).
    pub async fn from_pool(pool: SqlitePool) -> Result<Self, StoreError> {
        let store = Self { pool };
        store.run_migrations().await?;
        Ok(store)
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Run schema migrations — creates tables and indexes.
    async fn run_migrations(&self) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS sessions (
                id          INTEGER PRIMARY KEY AUTOINCREMENT,
                user_id     INTEGER NOT NULL,
                title       TEXT NOT NULL,
                created_at  INTEGER NOT NULL,
                updated_at  INTEGER NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::MigrationFailed(format!("sessions table: {e}")))?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS messages (
                id          INTEGER PRIMARY KEY AUTOINCREMENT,
                session_id  INTEGER NOT NULL,
                role        TEXT NOT NULL,
                content     TEXT NOT NULL,
                created_at  INTEGER NOT NULL,
                origin_at   INTEGER NOT NULL DEFAULT 0
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::MigrationFailed(format!("messages table: {e}")))?;

        // Databases created before `origin_at` existed.
        let has_origin: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM pragma_table_info('messages') WHERE name = 'origin_at'",
        )
        .fetch_one(&self.pool)
        .await
        .map_err(|e| StoreError::MigrationFailed(format!("messages columns: {e}")))?;
        if has_origin == 0 {
            sqlx::query("ALTER TABLE messages ADD COLUMN origin_at INTEGER NOT NULL DEFAULT 0")
                .execute(&self.pool)
                .await
                .map_err(|e| StoreError::MigrationFailed(format!("origin_at column: {e}")))?;
            sqlx::query("UPDATE messages SET origin_at = created_at")
                .execute(&self.pool)
                .await
                .map_err(|e| StoreError::MigrationFailed(format!("origin_at backfill: {e}")))?;
            info!("Added origin_at to messages");
        }
        sqlx::query("DROP INDEX IF EXISTS idx_messages_natural")
            .execute(&self.pool)
            .await
            .map_err(|e| StoreError::MigrationFailed(format!("old natural key index: {e}")))?;

        sqlx::query(
            "CREATE UNIQUE INDEX IF NOT EXISTS idx_messages_origin ON messages(session_id, role, origin_at, content)",
        )
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::MigrationFailed(format!("natural key index: {e}")))?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_messages_session ON messages(session_id, created_at, id)",
        )
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::MigrationFailed(format!("session index: {e}")))?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_sessions_user ON sessions(user_id, updated_at DESC)",
        )
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::MigrationFailed(format!("user index: {e}")))?;

        debug!("SQLite store migrations complete");
        Ok(())
    }

    fn row_to_message(row: &sqlx::sqlite::SqliteRow) -> Result<Message, StoreError> {
        let role: String = row
            .try_get("role")
            .map_err(|e| StoreError::QueryFailed(format!("role column: {e}")))?;
        let created_at: i64 = row
            .try_get("created_at")
            .map_err(|e| StoreError::QueryFailed(format!("created_at column: {e}")))?;

        Ok(Message {
            id: row
                .try_get("id")
                .map_err(|e| StoreError::QueryFailed(format!("id column: {e}")))?,
            session_id: row
                .try_get("session_id")
                .map_err(|e| StoreError::QueryFailed(format!("session_id column: {e}")))?,
            role: Role::from_str(&role).map_err(StoreError::QueryFailed)?,
            content: row
                .try_get("content")
                .map_err(|e| StoreError::QueryFailed(format!("content column: {e}")))?,
            created_at: millis_to_datetime(created_at),
        })
    }

    fn row_to_session(row: &sqlx::sqlite::SqliteRow) -> Result<Session, StoreError> {
        let created_at: i64 = row
            .try_get("created_at")
            .map_err(|e| StoreError::QueryFailed(format!("created_at column: {e}")))?;
        let updated_at: i64 = row
            .try_get("updated_at")
            .map_err(|e| StoreError::QueryFailed(format!("updated_at column: {e}")))?;

        Ok(Session {
            id: row
                .try_get("id")
                .map_err(|e| StoreError::QueryFailed(format!("id column: {e}")))?,
            user_id: row
                .try_get("user_id")
                .map_err(|e| StoreError::QueryFailed(format!("user_id column: {e}")))?,
            title: row
                .try_get("title")
                .map_err(|e| StoreError::QueryFailed(format!("title column: {e}")))?,
            created_at: millis_to_datetime(created_at),
            updated_at: millis_to_datetime(updated_at),
        })
    }

    async fn insert_on(conn: &mut SqliteConnection, message: &Message, origin_at: i64) -> Result<i64, StoreError> {
        let created_at = message.created_at.timestamp_millis();
        let id = (message.id != 0).then_some(message.id);
        let result = sqlx::query(
            "INSERT INTO messages (id, session_id, role, content, created_at, origin_at) VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        )
        .bind(id)
        .bind(message.session_id)
        .bind(message.role.as_str())
        .bind(&message.content)
        .bind(created_at)
        .bind(origin_at)
        .execute(&mut *conn)
        .await
        .map_err(|e| write_error("INSERT message", e))?;
        Ok(result.last_insert_rowid())
    }

    async fn insert_one(&self, message: &Message, origin_at: i64) -> Result<i64, StoreError> {
        let mut conn = self
            .pool
            .acquire()
            .await
            .map_err(|e| StoreError::Storage(format!("acquire: {e}")))?;
        let id = Self::insert_on(&mut conn, message, origin_at).await?;
        debug!(session_id = message.session_id, id, "Stored message");
        Ok(id)
    }
}

#[async_trait]
impl MessageStore for SqliteStore {
    fn name(&self) -> &str {
        "sqlite"
    }

    async fn insert(&self, message: &Message) -> Result<i64, StoreError> {
        self.insert_one(message, message.created_at.timestamp_millis()).await
    }

    async fn insert_unstamped(&self, message: &Message) -> Result<i64, StoreError> {
        self.insert_one(message, 0).await
    }

    async fn insert_batch(&self, messages: &[Message]) -> Result<Vec<i64>, StoreError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| StoreError::Storage(format!("begin: {e}")))?;
        let mut ids = Vec::with_capacity(messages.len());
        for message in messages {
            ids.push(Self::insert_on(&mut tx, message, message.created_at.timestamp_millis()).await?);
        }
        tx.commit()
            .await
            .map_err(|e| StoreError::Storage(format!("commit: {e}")))?;
        Ok(ids)
    }

    async fn find_by_session(&self, session_id: i64) -> Result<Vec<Message>, StoreError> {
        let rows = sqlx::query(
            "SELECT * FROM messages WHERE session_id = ?1 ORDER BY created_at ASC, id ASC",
        )
        .bind(session_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| StoreError::QueryFailed(format!("find_by_session: {e}")))?;

        rows.iter().map(Self::row_to_message).collect()
    }

    async fn find_recent(&self, session_id: i64, limit: usize) -> Result<Vec<Message>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT * FROM (
                SELECT * FROM messages WHERE session_id = ?1
                ORDER BY created_at DESC, id DESC LIMIT ?2
            ) ORDER BY created_at ASC, id ASC
            "#,
        )
        .bind(session_id)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| StoreError::QueryFailed(format!("find_recent: {e}")))?;

        rows.iter().map(Self::row_to_message).collect()
    }

    async fn count_by_session(&self, session_id: i64) -> Result<usize, StoreError> {
        let row = sqlx::query("SELECT COUNT(*) AS cnt FROM messages WHERE session_id = ?1")
            .bind(session_id)
            .fetch_one(&self.pool)
            .await
            .map_err(|e| StoreError::QueryFailed(format!("COUNT: {e}")))?;

        let cnt: i64 = row
            .try_get("cnt")
            .map_err(|e| StoreError::QueryFailed(format!("cnt column: {e}")))?;
        Ok(cnt as usize)
    }

    async fn delete_by_session(&self, session_id: i64) -> Result<usize, StoreError> {
        let result = sqlx::query("DELETE FROM messages WHERE session_id = ?1")
            .bind(session_id)
            .execute(&self.pool)
            .await
            .map_err(|e| StoreError::Storage(format!("DELETE messages: {e}")))?;
        Ok(result.rows_affected() as usize)
    }
}

#[async_trait]
impl SessionStore for SqliteStore {
    fn name(&self) -> &str {
        "sqlite"
    }

    async fn create(&self, session: &Session) -> Result<Session, StoreError> {
        let result = sqlx::query(
            "INSERT INTO sessions (user_id, title, created_at, updated_at) VALUES (?1, ?2, ?3, ?4)",
        )
        .bind(session.user_id)
        .bind(&session.title)
        .bind(session.created_at.timestamp_millis())
        .bind(session.updated_at.timestamp_millis())
        .execute(&self.pool)
        .await
        .map_err(|e| write_error("INSERT session", e))?;

        Ok(Session {
            id: result.last_insert_rowid(),
            ..session.clone()
        })
    }

    async fn find_by_id(&self, id: i64) -> Result<Option<Session>, StoreError> {
        let row = sqlx::query("SELECT * FROM sessions WHERE id = ?1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| StoreError::QueryFailed(format!("GET session: {e}")))?;

        row.as_ref().map(Self::row_to_session).transpose()
    }

    async fn find_by_user(&self, user_id: i64) -> Result<Vec<Session>, StoreError> {
        let rows = sqlx::query(
            "SELECT * FROM sessions WHERE user_id = ?1 ORDER BY updated_at DESC, id DESC",
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| StoreError::QueryFailed(format!("find_by_user: {e}")))?;

        rows.iter().map(Self::row_to_session).collect()
    }

    async fn update_title(&self, id: i64, title: &str) -> Result<(), StoreError> {
        let result = sqlx::query("UPDATE sessions SET title = ?2 WHERE id = ?1")
            .bind(id)
            .bind(title)
            .execute(&self.pool)
            .await
            .map_err(|e| StoreError::Storage(format!("UPDATE title: {e}")))?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(format!("session {id}")));
        }
        Ok(())
    }

    async fn touch_updated_at(&self, id: i64) -> Result<(), StoreError> {
        let result = sqlx::query("UPDATE sessions SET updated_at = ?2 WHERE id = ?1")
            .bind(id)
            .bind(Utc::now().timestamp_millis())
            .execute(&self.pool)
            .await
            .map_err(|e| StoreError::Storage(format!("UPDATE updated_at: {e}")))?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(format!("session {id}")));
        }
        Ok(())
    }

    async fn delete(&self, id: i64) -> Result<bool, StoreError> {
        let result = sqlx::query("DELETE FROM sessions WHERE id = ?1")
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(|e| StoreError::Storage(format!("DELETE session: {e}")))?;
        Ok(result.rows_affected() > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    async fn test_store() -> SqliteStore {
        SqliteStore::new("sqlite::memory:").await.unwrap()
    }

    fn at(session_id: i64, role: Role, content: &str, offset_ms: i64) -> Message {
        let mut msg = Message::new(session_id, role, content);
        msg.created_at = millis_to_datetime(1_700_000_000_000 + offset_ms);
        msg
    }

    #[tokio::test]
    async fn insert_assigns_ids_and_reads_back_in_order() {
        let db = test_store().await;
        let a = db.insert(&at(1, Role::User, "first", 0)).await.unwrap();
        let b = db.insert(&at(1, Role::Assistant, "second", 5)).await.unwrap();
        assert!(b > a);

        let msgs = db.find_by_session(1).await.unwrap();
        assert_eq!(msgs.len(), 2);
        assert_eq!(msgs[0].content, "first");
        assert_eq!(msgs[0].id, a);
        assert_eq!(msgs[1].role, Role::Assistant);
        assert_eq!(msgs[1].created_at, at(1, Role::User, "", 5).created_at);
    }

    #[tokio::test]
    async fn explicit_id_duplicate_is_conflict() {
        let db = test_store().await;
        let mut msg = at(1, Role::User, "hello", 0);
        msg.id = 77;
        assert_eq!(db.insert(&msg).await.unwrap(), 77);

        let mut other = at(1, Role::User, "different", 10);
        other.id = 77;
        let err = db.insert(&other).await.unwrap_err();
        assert!(err.is_conflict(), "got {err:?}");
    }

    #[tokio::test]
    async fn natural_key_duplicate_is_conflict() {
        let db = test_store().await;
        let msg = at(2, Role::User, "same", 0);
        db.insert(&msg).await.unwrap();
        let err = db.insert(&msg).await.unwrap_err();
        assert!(err.is_conflict());
        assert_eq!(db.count_by_session(2).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn unstamped_duplicate_is_conflict_despite_new_stamp() {
        let db = test_store().await;
        db.insert_unstamped(&at(1, Role::User, "late", 0)).await.unwrap();
        let err = db.insert_unstamped(&at(1, Role::User, "late", 40)).await.unwrap_err();
        assert!(err.is_conflict());

        // Producer-stamped rows keep their own key.
        db.insert(&at(1, Role::User, "late", 40)).await.unwrap();
        let msgs = db.find_by_session(1).await.unwrap();
        assert_eq!(msgs.len(), 2);
        assert_eq!(msgs[0].created_at, millis_to_datetime(1_700_000_000_000));
    }

    #[tokio::test]
    async fn batch_is_all_or_nothing() {
        let db = test_store().await;
        let dup = at(3, Role::User, "dup", 0);
        let err = db
            .insert_batch(&[at(3, Role::User, "ok", 1), dup.clone(), dup])
            .await;
        assert!(err.is_err());
        assert_eq!(db.count_by_session(3).await.unwrap(), 0);

        let ids = db
            .insert_batch(&[at(3, Role::User, "a", 1), at(3, Role::Assistant, "b", 2)])
            .await
            .unwrap();
        assert_eq!(ids.len(), 2);
        assert_eq!(db.count_by_session(3).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn find_recent_returns_tail_ascending() {
        let db = test_store().await;
        for i in 0..10 {
            db.insert(&at(4, Role::User, &format!("m{i}"), i)).await.unwrap();
        }
        let recent = db.find_recent(4, 3).await.unwrap();
        let contents: Vec<&str> = recent.iter().map(|m| m.content.as_str()).collect();
        assert_eq!(contents, vec!["m7", "m8", "m9"]);
        assert!(db.find_recent(4, 0).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn delete_by_session_is_scoped() {
        let db = test_store().await;
        db.insert(&at(5, Role::User, "x", 0)).await.unwrap();
        db.insert(&at(6, Role::User, "y", 0)).await.unwrap();
        assert_eq!(db.delete_by_session(5).await.unwrap(), 1);
        assert_eq!(db.count_by_session(5).await.unwrap(), 0);
        assert_eq!(db.count_by_session(6).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn session_lifecycle() {
        let db = test_store().await;
        let mut older = Session::new(9);
        older.updated_at = older.updated_at - Duration::minutes(5);
        let older = db.create(&older).await.unwrap();
        let newer = db.create(&Session::new(9)).await.unwrap();
        db.create(&Session::new(10)).await.unwrap();

        let listed = db.find_by_user(9).await.unwrap();
        assert_eq!(listed.iter().map(|s| s.id).collect::<Vec<_>>(), vec![newer.id, older.id]);

        db.update_title(older.id, "Rust questions").await.unwrap();
        db.touch_updated_at(older.id).await.unwrap();
        let listed = db.find_by_user(9).await.unwrap();
        assert_eq!(listed[0].id, older.id);
        assert_eq!(listed[0].title, "Rust questions");

        assert!(db.delete(older.id).await.unwrap());
        assert!(!db.delete(older.id).await.unwrap());
        assert!(db.find_by_id(older.id).await.unwrap().is_none());
        assert!(matches!(
            db.update_title(older.id, "gone").await,
            Err(StoreError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn file_database_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let url = format!("sqlite://{}", dir.path().join("nested/chat.sqlite").display());
        {
            let db = SqliteStore::new(&url).await.unwrap();
            db.insert(&at(1, Role::User, "durable", 0)).await.unwrap();
            db.pool().close().await;
        }
        let db = SqliteStore::new(&url).await.unwrap();
        assert_eq!(db.find_by_session(1).await.unwrap()[0].content, "durable");
    }
}

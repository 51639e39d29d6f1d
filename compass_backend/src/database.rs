use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// A persisted conversation header.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Conversation {
    pub id: String,
    pub user_id: i64,
    pub title: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// One persisted chat message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredMessage {
    pub id: String,
    pub conversation_id: String,
    pub content: String,
    pub is_user_message: bool,
    pub is_rich_text: bool,
    pub timestamp: DateTime<Utc>,
}

/// Fixed-size pool of SQLite connections to one database file.
///
/// Connections are checked out asynchronously and returned when the
/// [`PooledConnection`] guard drops. Blocking SQLite work runs on tokio's
/// blocking pool through [`Database::with_connection`].
pub struct Database {
    path: PathBuf,
    idle_tx: flume::Sender<Connection>,
    idle_rx: flume::Receiver<Connection>,
}

pub struct PooledConnection {
    conn: Option<Connection>,
    home: flume::Sender<Connection>,
}

impl std::ops::Deref for PooledConnection {
    type Target = Connection;

    fn deref(&self) -> &Connection {
        self.conn.as_ref().expect("connection present until drop")
    }
}

impl std::ops::DerefMut for PooledConnection {
    fn deref_mut(&mut self) -> &mut Connection {
        self.conn.as_mut().expect("connection present until drop")
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            let _ = self.home.send(conn);
        }
    }
}

impl Database {
    /// Create or open the database with `pool_size` connections.
    pub fn open<P: AsRef<Path>>(path: P, pool_size: usize) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let size = pool_size.max(1);
        let (idle_tx, idle_rx) = flume::bounded(size);

        for _ in 0..size {
            let conn = Self::open_connection(&path)?;
            idle_tx
                .send(conn)
                .map_err(|_| anyhow!("connection pool closed during startup"))?;
        }

        let db = Self {
            path,
            idle_tx,
            idle_rx,
        };
        {
            let conn = db.try_checkout()?;
            ensure_schema(&conn)?;
        }
        tracing::info!("Opened database {:?} with {} pooled connections", db.path, size);
        Ok(db)
    }

    fn open_connection(path: &Path) -> Result<Connection> {
        let conn = Connection::open(path)
            .with_context(|| format!("Failed to open database {:?}", path))?;
        conn.busy_timeout(Duration::from_secs(5))?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        // journal_mode returns a row, so it cannot go through execute()
        let _: String = conn.query_row("PRAGMA journal_mode=WAL", [], |row| row.get(0))?;
        Ok(conn)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn try_checkout(&self) -> Result<PooledConnection> {
        let conn = self
            .idle_rx
            .try_recv()
            .map_err(|_| anyhow!("no idle database connection"))?;
        Ok(PooledConnection {
            conn: Some(conn),
            home: self.idle_tx.clone(),
        })
    }

    /// Wait for an idle connection. The caller owns it until the guard drops.
    pub async fn acquire(&self) -> Result<PooledConnection> {
        let conn = self
            .idle_rx
            .recv_async()
            .await
            .map_err(|_| anyhow!("database connection pool closed"))?;
        Ok(PooledConnection {
            conn: Some(conn),
            home: self.idle_tx.clone(),
        })
    }

    /// Run blocking work against one dedicated connection.
    pub async fn with_connection<F, T>(&self, work: F) -> Result<T>
    where
        F: FnOnce(&mut Connection) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let mut conn = self.acquire().await?;
        tokio::task::spawn_blocking(move || work(&mut conn))
            .await
            .context("database task panicked")?
    }
}

/// Create the database schema.
///
/// The platform tables (users, profiles, jobs, events, news, meetings,
/// applications) belong to the wider application; only the columns read by
/// the context aggregator are declared here.
fn ensure_schema(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS users (
            id INTEGER PRIMARY KEY,
            name TEXT NOT NULL,
            email TEXT,
            role TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS student_profiles (
            user_id INTEGER PRIMARY KEY REFERENCES users(id),
            school TEXT,
            grade_level TEXT,
            career_interests TEXT,
            career_pathways TEXT
        );

        CREATE TABLE IF NOT EXISTS counselor_profiles (
            user_id INTEGER PRIMARY KEY REFERENCES users(id),
            school TEXT,
            specializations TEXT
        );

        CREATE TABLE IF NOT EXISTS company_profiles (
            user_id INTEGER PRIMARY KEY REFERENCES users(id),
            company_name TEXT NOT NULL,
            industry TEXT,
            description TEXT
        );

        CREATE TABLE IF NOT EXISTS jobs (
            id INTEGER PRIMARY KEY,
            company_id INTEGER REFERENCES users(id),
            title TEXT NOT NULL,
            description TEXT,
            tags TEXT,
            location TEXT,
            job_type TEXT,
            is_active INTEGER NOT NULL DEFAULT 1,
            deadline TEXT,
            created_at TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS events (
            id INTEGER PRIMARY KEY,
            title TEXT NOT NULL,
            description TEXT,
            location TEXT,
            event_date TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS news (
            id INTEGER PRIMARY KEY,
            title TEXT NOT NULL,
            summary TEXT,
            published_at TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS meetings (
            id INTEGER PRIMARY KEY,
            student_id INTEGER NOT NULL REFERENCES users(id),
            counselor_id INTEGER NOT NULL REFERENCES users(id),
            title TEXT NOT NULL,
            scheduled_at TEXT NOT NULL,
            status TEXT NOT NULL DEFAULT 'scheduled'
        );

        CREATE TABLE IF NOT EXISTS job_applications (
            id INTEGER PRIMARY KEY,
            student_id INTEGER NOT NULL REFERENCES users(id),
            job_id INTEGER NOT NULL REFERENCES jobs(id),
            status TEXT NOT NULL,
            applied_at TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS conversations (
            id TEXT PRIMARY KEY,
            user_id INTEGER NOT NULL,
            title TEXT NOT NULL,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS messages (
            id TEXT PRIMARY KEY,
            conversation_id TEXT NOT NULL REFERENCES conversations(id) ON DELETE CASCADE,
            content TEXT NOT NULL,
            is_user_message INTEGER NOT NULL,
            is_rich_text INTEGER NOT NULL DEFAULT 0,
            timestamp TEXT NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_conversations_user_updated
            ON conversations(user_id, updated_at DESC);
        CREATE INDEX IF NOT EXISTS idx_messages_conversation
            ON messages(conversation_id, timestamp);
        CREATE INDEX IF NOT EXISTS idx_jobs_active_created
            ON jobs(is_active, created_at DESC);
        "#,
    )
    .context("Failed to create schema")?;
    Ok(())
}

fn parse_timestamp(raw: String, column: usize) -> rusqlite::Result<DateTime<Utc>> {
    raw.parse().map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(column, rusqlite::types::Type::Text, Box::new(e))
    })
}

/// Fetch one conversation, but only if `user_id` owns it.
pub fn find_owned_conversation(
    conn: &Connection,
    conversation_id: &str,
    user_id: i64,
) -> rusqlite::Result<Option<Conversation>> {
    conn.query_row(
        "SELECT id, user_id, title, created_at, updated_at
         FROM conversations
         WHERE id = ?1 AND user_id = ?2",
        params![conversation_id, user_id],
        |row| {
            Ok(Conversation {
                id: row.get(0)?,
                user_id: row.get(1)?,
                title: row.get(2)?,
                created_at: parse_timestamp(row.get(3)?, 3)?,
                updated_at: parse_timestamp(row.get(4)?, 4)?,
            })
        },
    )
    .optional()
}

/// Fetch one conversation by ID.
pub fn get_conversation(
    conn: &Connection,
    conversation_id: &str,
) -> rusqlite::Result<Option<Conversation>> {
    conn.query_row(
        "SELECT id, user_id, title, created_at, updated_at
         FROM conversations
         WHERE id = ?1",
        [conversation_id],
        |row| {
            Ok(Conversation {
                id: row.get(0)?,
                user_id: row.get(1)?,
                title: row.get(2)?,
                created_at: parse_timestamp(row.get(3)?, 3)?,
                updated_at: parse_timestamp(row.get(4)?, 4)?,
            })
        },
    )
    .optional()
}

pub fn insert_conversation(
    conn: &Connection,
    user_id: i64,
    title: &str,
    now: DateTime<Utc>,
) -> rusqlite::Result<String> {
    let id = uuid::Uuid::new_v4().to_string();
    let now = now.to_rfc3339();
    conn.execute(
        "INSERT INTO conversations (id, user_id, title, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5)",
        params![id, user_id, title, now.clone(), now],
    )?;
    Ok(id)
}

pub fn insert_message(
    conn: &Connection,
    conversation_id: &str,
    content: &str,
    is_user_message: bool,
    is_rich_text: bool,
) -> rusqlite::Result<String> {
    let id = uuid::Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO messages (id, conversation_id, content, is_user_message, is_rich_text, timestamp)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        params![
            id,
            conversation_id,
            content,
            is_user_message,
            is_rich_text,
            Utc::now().to_rfc3339(),
        ],
    )?;
    Ok(id)
}

pub fn touch_conversation(conn: &Connection, conversation_id: &str) -> rusqlite::Result<()> {
    conn.execute(
        "UPDATE conversations SET updated_at = ?2 WHERE id = ?1",
        params![conversation_id, Utc::now().to_rfc3339()],
    )?;
    Ok(())
}

/// Count messages in one conversation.
pub fn count_messages(conn: &Connection, conversation_id: &str) -> rusqlite::Result<usize> {
    let count = conn.query_row(
        "SELECT COUNT(1) FROM messages WHERE conversation_id = ?1",
        [conversation_id],
        |row| row.get::<_, i64>(0),
    )?;
    Ok(count.max(0) as usize)
}

/// Messages of one conversation in insertion order.
pub fn list_messages(
    conn: &Connection,
    conversation_id: &str,
) -> rusqlite::Result<Vec<StoredMessage>> {
    let mut stmt = conn.prepare(
        "SELECT id, conversation_id, content, is_user_message, is_rich_text, timestamp
         FROM messages
         WHERE conversation_id = ?1
         ORDER BY timestamp ASC, rowid ASC",
    )?;
    let messages = stmt
        .query_map([conversation_id], |row| {
            Ok(StoredMessage {
                id: row.get(0)?,
                conversation_id: row.get(1)?,
                content: row.get(2)?,
                is_user_message: row.get(3)?,
                is_rich_text: row.get(4)?,
                timestamp: parse_timestamp(row.get(5)?, 5)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(messages)
}

pub fn count_conversations_for_user(conn: &Connection, user_id: i64) -> rusqlite::Result<usize> {
    let count = conn.query_row(
        "SELECT COUNT(1) FROM conversations WHERE user_id = ?1",
        [user_id],
        |row| row.get::<_, i64>(0),
    )?;
    Ok(count.max(0) as usize)
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use tempfile::TempDir;

    /// Keeps the temp directory alive for as long as the database is in use.
    pub struct TestDb {
        pub db: std::sync::Arc<Database>,
        _dir: TempDir,
    }

    pub fn temp_db(pool_size: usize) -> TestDb {
        let dir = tempfile::tempdir().expect("temp dir");
        let db = Database::open(dir.path().join("compass.db"), pool_size).expect("db init");
        TestDb {
            db: std::sync::Arc::new(db),
            _dir: dir,
        }
    }

    pub async fn exec(db: &Database, sql: &'static str) {
        db.with_connection(move |conn| {
            conn.execute_batch(sql)?;
            Ok(())
        })
        .await
        .expect("exec sql");
    }
}

//! aion-storage: SQLite-based persistence for conversations.
//!
//! Stores conversation metadata and the messages delivered into them.
//! Scheduled jobs live in their own table owned by `aion-cron`.

use std::path::Path;
use std::sync::Arc;

use rusqlite::{Connection, OptionalExtension};
use tokio::sync::Mutex;

use aion_types::{Conversation, ConversationMessage, MessageKind};

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("Blocking task join error: {0}")]
    Join(#[from] tokio::task::JoinError),
    #[error("Conversation not found: {0}")]
    ConversationNotFound(String),
}

pub type Result<T> = std::result::Result<T, StorageError>;

const SCHEMA: &str = "CREATE TABLE IF NOT EXISTS conversations (
        id TEXT PRIMARY KEY,
        title TEXT NOT NULL,
        agent_type TEXT NOT NULL,
        created_at INTEGER NOT NULL,
        modify_time INTEGER NOT NULL
    );

    CREATE TABLE IF NOT EXISTS messages (
        id TEXT PRIMARY KEY,
        conversation_id TEXT NOT NULL,
        kind TEXT NOT NULL,
        content TEXT NOT NULL,
        source TEXT,
        created_at INTEGER NOT NULL,
        FOREIGN KEY (conversation_id) REFERENCES conversations(id)
    );

    CREATE INDEX IF NOT EXISTS idx_messages_conversation
        ON messages(conversation_id, created_at);";

/// SQLite-based storage for conversations and their messages.
pub struct ConversationStorage {
    conn: Arc<Mutex<Connection>>,
}

impl ConversationStorage {
    /// Open (or create) the SQLite database at the given path.
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)?;

        // Enable WAL mode for better concurrent read performance
        conn.execute_batch("PRAGMA journal_mode=WAL;")?;
        conn.execute_batch(SCHEMA)?;

        tracing::info!("Storage opened: {}", path.display());

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Open an in-memory database (for testing).
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    // ─── Conversations ──────────────────────────────────────

    /// Save or update a conversation.
    pub async fn save_conversation(&self, conversation: &Conversation) -> Result<()> {
        let conn = self.conn.clone();
        let conversation = conversation.clone();
        tokio::task::spawn_blocking(move || {
            let conn = conn.blocking_lock();
            conn.execute(
                "INSERT INTO conversations (id, title, agent_type, created_at, modify_time)
                 VALUES (?1, ?2, ?3, ?4, ?5)
                 ON CONFLICT(id) DO UPDATE SET
                    title = excluded.title,
                    agent_type = excluded.agent_type,
                    modify_time = excluded.modify_time",
                rusqlite::params![
                    conversation.id,
                    conversation.title,
                    conversation.agent_type,
                    conversation.created_at,
                    conversation.modify_time,
                ],
            )?;
            Ok(())
        })
        .await?
    }

    /// Get a conversation by id.
    pub async fn get_conversation(&self, id: &str) -> Result<Option<Conversation>> {
        let conn = self.conn.clone();
        let id = id.to_string();
        tokio::task::spawn_blocking(move || {
            let conn = conn.blocking_lock();
            let result = conn
                .query_row(
                    "SELECT id, title, agent_type, created_at, modify_time
                     FROM conversations WHERE id = ?1",
                    rusqlite::params![id],
                    row_to_conversation,
                )
                .optional()?;
            Ok(result)
        })
        .await?
    }

    /// List conversations, most recently active first.
    pub async fn list_conversations(&self) -> Result<Vec<Conversation>> {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let conn = conn.blocking_lock();
            let mut stmt = conn.prepare(
                "SELECT id, title, agent_type, created_at, modify_time
                 FROM conversations ORDER BY modify_time DESC, id ASC",
            )?;
            let rows = stmt
                .query_map([], row_to_conversation)?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(rows)
        })
        .await?
    }

    /// Bump a conversation's modify_time so it sorts to the top.
    pub async fn touch_conversation(&self, id: &str) -> Result<()> {
        let conn = self.conn.clone();
        let id = id.to_string();
        let now = chrono::Utc::now().timestamp_millis();
        tokio::task::spawn_blocking(move || {
            let conn = conn.blocking_lock();
            let count = conn.execute(
                "UPDATE conversations SET modify_time = ?1 WHERE id = ?2",
                rusqlite::params![now, id],
            )?;
            if count == 0 {
                return Err(StorageError::ConversationNotFound(id));
            }
            Ok(())
        })
        .await?
    }

    /// Delete a conversation and its messages.
    pub async fn delete_conversation(&self, id: &str) -> Result<bool> {
        let conn = self.conn.clone();
        let id = id.to_string();
        tokio::task::spawn_blocking(move || {
            let mut conn = conn.blocking_lock();
            let tx = conn.transaction()?;
            tx.execute(
                "DELETE FROM messages WHERE conversation_id = ?1",
                rusqlite::params![id],
            )?;
            let count = tx.execute(
                "DELETE FROM conversations WHERE id = ?1",
                rusqlite::params![id],
            )?;
            tx.commit()?;
            Ok(count > 0)
        })
        .await?
    }

    // ─── Messages ───────────────────────────────────────────

    /// Append a message and bump the conversation's modify_time.
    pub async fn add_message(&self, message: &ConversationMessage) -> Result<()> {
        let conn = self.conn.clone();
        let message = message.clone();
        tokio::task::spawn_blocking(move || {
            let mut conn = conn.blocking_lock();
            let tx = conn.transaction()?;
            let touched = tx.execute(
                "UPDATE conversations SET modify_time = ?1 WHERE id = ?2",
                rusqlite::params![message.created_at, message.conversation_id],
            )?;
            if touched == 0 {
                return Err(StorageError::ConversationNotFound(message.conversation_id));
            }
            tx.execute(
                "INSERT INTO messages (id, conversation_id, kind, content, source, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                rusqlite::params![
                    message.id,
                    message.conversation_id,
                    message.kind.as_str(),
                    message.content,
                    message.source,
                    message.created_at,
                ],
            )?;
            tx.commit()?;
            Ok(())
        })
        .await?
    }

    /// List the messages of a conversation in insertion order.
    pub async fn list_messages(&self, conversation_id: &str) -> Result<Vec<ConversationMessage>> {
        let conn = self.conn.clone();
        let conversation_id = conversation_id.to_string();
        tokio::task::spawn_blocking(move || {
            let conn = conn.blocking_lock();
            let mut stmt = conn.prepare(
                "SELECT id, conversation_id, kind, content, source, created_at
                 FROM messages WHERE conversation_id = ?1
                 ORDER BY created_at ASC, rowid ASC",
            )?;
            let rows = stmt
                .query_map(rusqlite::params![conversation_id], |row| {
                    Ok(ConversationMessage {
                        id: row.get(0)?,
                        conversation_id: row.get(1)?,
                        kind: row
                            .get::<_, String>(2)?
                            .parse()
                            .unwrap_or(MessageKind::Tips),
                        content: row.get(3)?,
                        source: row.get(4)?,
                        created_at: row.get(5)?,
                    })
                })?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(rows)
        })
        .await?
    }
}

fn row_to_conversation(row: &rusqlite::Row<'_>) -> rusqlite::Result<Conversation> {
    Ok(Conversation {
        id: row.get(0)?,
        title: row.get(1)?,
        agent_type: row.get(2)?,
        created_at: row.get(3)?,
        modify_time: row.get(4)?,
    })
}

//! Durable job records.
//!
//! [`JobStore`] is the only owner of the persisted representation; the
//! service reads and writes jobs exclusively through it.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use rusqlite::{Connection, OptionalExtension};
use serde::de::DeserializeOwned;
use tokio::sync::Mutex;

use aion_types::{CronJob, CronJobState, CronPayload, CronSchedule, JobCreator};

use crate::{CronError, Result, schedule::now_ms};

/// Fields of a job before the store assigns its id and timestamps.
#[derive(Debug, Clone)]
pub struct NewJob {
    pub name: String,
    pub conversation_id: String,
    pub conversation_title: Option<String>,
    pub agent_type: String,
    pub created_by: JobCreator,
    pub schedule: CronSchedule,
    pub payload: CronPayload,
    pub enabled: bool,
    pub state: CronJobState,
}

/// Partial update of a stored job. `None` leaves a field untouched.
#[derive(Debug, Clone, Default)]
pub struct JobPatch {
    pub name: Option<String>,
    pub schedule: Option<CronSchedule>,
    pub payload: Option<CronPayload>,
    pub enabled: Option<bool>,
    pub state: Option<CronJobState>,
}

impl JobPatch {
    /// Patch that only replaces the derived state.
    pub fn state(state: CronJobState) -> Self {
        Self {
            state: Some(state),
            ..Self::default()
        }
    }

    /// Apply the patch and bump `updated_at`.
    pub fn apply(self, job: &mut CronJob, now: i64) {
        if let Some(name) = self.name {
            job.name = name;
        }
        if let Some(schedule) = self.schedule {
            job.schedule = schedule;
        }
        if let Some(payload) = self.payload {
            job.payload = payload;
        }
        if let Some(enabled) = self.enabled {
            job.enabled = enabled;
        }
        if let Some(state) = self.state {
            job.state = state;
        }
        job.updated_at = now.max(job.updated_at);
    }
}

impl NewJob {
    /// Materialize the record with a fresh id.
    pub fn into_job(self, now: i64) -> CronJob {
        CronJob {
            id: new_job_id(),
            name: self.name,
            conversation_id: self.conversation_id,
            conversation_title: self.conversation_title,
            agent_type: self.agent_type,
            created_by: self.created_by,
            schedule: self.schedule,
            payload: self.payload,
            enabled: self.enabled,
            state: self.state,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Generate a unique job id.
pub fn new_job_id() -> String {
    format!("cron_{}", uuid::Uuid::new_v4())
}

/// Persistence contract for jobs. Every mutating call is durable before it returns.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// All jobs, oldest first.
    async fn list(&self) -> Result<Vec<CronJob>>;
    /// Jobs owned by one conversation, oldest first.
    async fn list_by_conversation(&self, conversation_id: &str) -> Result<Vec<CronJob>>;
    /// Enabled jobs, oldest first.
    async fn list_enabled(&self) -> Result<Vec<CronJob>>;
    async fn get(&self, id: &str) -> Result<Option<CronJob>>;
    /// Insert a new job, assigning its id and timestamps.
    async fn create(&self, job: NewJob) -> Result<CronJob>;
    /// Apply a patch. Fails with [`CronError::NotFound`] for unknown ids.
    async fn update(&self, id: &str, patch: JobPatch) -> Result<CronJob>;
    /// Delete a job. Fails with [`CronError::NotFound`] for unknown ids.
    async fn delete(&self, id: &str) -> Result<()>;
}

const SCHEMA: &str = "CREATE TABLE IF NOT EXISTS cron_jobs (
        id TEXT PRIMARY KEY,
        name TEXT NOT NULL,
        conversation_id TEXT NOT NULL,
        conversation_title TEXT,
        agent_type TEXT NOT NULL,
        created_by TEXT NOT NULL,
        schedule TEXT NOT NULL,
        payload TEXT NOT NULL,
        enabled INTEGER NOT NULL DEFAULT 1,
        state TEXT NOT NULL,
        created_at INTEGER NOT NULL,
        updated_at INTEGER NOT NULL
    );

    CREATE INDEX IF NOT EXISTS idx_cron_jobs_conversation
        ON cron_jobs(conversation_id);";

const SELECT_COLUMNS: &str = "SELECT id, name, conversation_id, conversation_title, agent_type, created_by,
        schedule, payload, enabled, state, created_at, updated_at FROM cron_jobs";

/// SQLite-backed job storage.
pub struct SqliteJobStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteJobStore {
    /// Open or create a job store.
    pub fn open(db_path: &Path) -> Result<Self> {
        let conn = Connection::open(db_path)?;
        conn.execute_batch("PRAGMA journal_mode = WAL;")?;
        conn.execute_batch(SCHEMA)?;

        tracing::info!("Cron store opened: {}", db_path.display());

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

    async fn query(&self, filter: &'static str, arg: Option<String>) -> Result<Vec<CronJob>> {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let conn = conn.blocking_lock();
            let sql = format!("{SELECT_COLUMNS} {filter} ORDER BY created_at ASC, id ASC");
            let mut stmt = conn.prepare(&sql)?;
            let jobs = match arg {
                Some(arg) => stmt
                    .query_map(rusqlite::params![arg], row_to_job)?
                    .collect::<std::result::Result<Vec<_>, _>>()?,
                None => stmt
                    .query_map([], row_to_job)?
                    .collect::<std::result::Result<Vec<_>, _>>()?,
            };
            Ok(jobs)
        })
        .await?
    }
}

#[async_trait]
impl JobStore for SqliteJobStore {
    async fn list(&self) -> Result<Vec<CronJob>> {
        self.query("", None).await
    }

    async fn list_by_conversation(&self, conversation_id: &str) -> Result<Vec<CronJob>> {
        self.query("WHERE conversation_id = ?1", Some(conversation_id.to_string()))
            .await
    }

    async fn list_enabled(&self) -> Result<Vec<CronJob>> {
        self.query("WHERE enabled = 1", None).await
    }

    async fn get(&self, id: &str) -> Result<Option<CronJob>> {
        let conn = self.conn.clone();
        let id = id.to_string();
        tokio::task::spawn_blocking(move || {
            let conn = conn.blocking_lock();
            select_job(&conn, &id)
        })
        .await?
    }

    async fn create(&self, job: NewJob) -> Result<CronJob> {
        let conn = self.conn.clone();
        let job = job.into_job(now_ms());
        tokio::task::spawn_blocking(move || {
            let conn = conn.blocking_lock();
            conn.execute(
                "INSERT INTO cron_jobs (id, name, conversation_id, conversation_title, agent_type,
                    created_by, schedule, payload, enabled, state, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
                rusqlite::params![
                    job.id,
                    job.name,
                    job.conversation_id,
                    job.conversation_title,
                    job.agent_type,
                    creator_str(job.created_by),
                    serde_json::to_string(&job.schedule)?,
                    serde_json::to_string(&job.payload)?,
                    job.enabled as i64,
                    serde_json::to_string(&job.state)?,
                    job.created_at,
                    job.updated_at,
                ],
            )?;
            Ok(job)
        })
        .await?
    }

    async fn update(&self, id: &str, patch: JobPatch) -> Result<CronJob> {
        let conn = self.conn.clone();
        let id = id.to_string();
        tokio::task::spawn_blocking(move || {
            let mut conn = conn.blocking_lock();
            let tx = conn.transaction()?;
            let mut job = select_job(&tx, &id)?.ok_or_else(|| CronError::NotFound(id.clone()))?;
            patch.apply(&mut job, now_ms());
            tx.execute(
                "UPDATE cron_jobs SET name = ?1, schedule = ?2, payload = ?3, enabled = ?4,
                    state = ?5, updated_at = ?6 WHERE id = ?7",
                rusqlite::params![
                    job.name,
                    serde_json::to_string(&job.schedule)?,
                    serde_json::to_string(&job.payload)?,
                    job.enabled as i64,
                    serde_json::to_string(&job.state)?,
                    job.updated_at,
                    job.id,
                ],
            )?;
            tx.commit()?;
            Ok(job)
        })
        .await?
    }

    async fn delete(&self, id: &str) -> Result<()> {
        let conn = self.conn.clone();
        let id = id.to_string();
        tokio::task::spawn_blocking(move || {
            let conn = conn.blocking_lock();
            let count = conn.execute("DELETE FROM cron_jobs WHERE id = ?1", rusqlite::params![id])?;
            if count == 0 {
                return Err(CronError::NotFound(id));
            }
            Ok(())
        })
        .await?
    }
}

fn select_job(conn: &Connection, id: &str) -> Result<Option<CronJob>> {
    let sql = format!("{SELECT_COLUMNS} WHERE id = ?1");
    let job = conn
        .query_row(&sql, rusqlite::params![id], row_to_job)
        .optional()?;
    Ok(job)
}

fn row_to_job(row: &rusqlite::Row<'_>) -> rusqlite::Result<CronJob> {
    Ok(CronJob {
        id: row.get(0)?,
        name: row.get(1)?,
        conversation_id: row.get(2)?,
        conversation_title: row.get(3)?,
        agent_type: row.get(4)?,
        created_by: match row.get::<_, String>(5)?.as_str() {
            "agent" => JobCreator::Agent,
            _ => JobCreator::User,
        },
        schedule: json_column(row, 6)?,
        payload: json_column(row, 7)?,
        enabled: row.get::<_, i64>(8)? != 0,
        state: json_column(row, 9)?,
        created_at: row.get(10)?,
        updated_at: row.get(11)?,
    })
}

fn json_column<T: DeserializeOwned>(row: &rusqlite::Row<'_>, idx: usize) -> rusqlite::Result<T> {
    let text: String = row.get(idx)?;
    serde_json::from_str(&text).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
    })
}

fn creator_str(creator: JobCreator) -> &'static str {
    match creator {
        JobCreator::User => "user",
        JobCreator::Agent => "agent",
    }
}

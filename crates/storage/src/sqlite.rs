//! SQLite store.
//!
//! One database file with four tables: `jobs`, `sessions`, `session_steps`
//! and `documents`. JSON columns are stored as TEXT, timestamps as RFC 3339.
//! `session_steps` carries a unique `(session_id, order_index)` index so a
//! colliding append fails loudly instead of silently duplicating.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use inkwell_core::document::{Document, DocumentUpdate, NewDocument};
use inkwell_core::error::StorageError;
use inkwell_core::job::{Job, JobStatus, NewJob};
use inkwell_core::session::{NewSession, NewStep, Session, SessionStep};
use inkwell_core::store::{DocumentStore, JobStore, SessionStore};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteRow, SqliteSynchronous};
use sqlx::{Row, SqlitePool};
use std::str::FromStr;
use tracing::{debug, info};

/// A SQLite-backed implementation of every store trait.
#[derive(Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// Open (or create) a database at `path` and run migrations.
    ///
    /// Pass `"sqlite::memory:"` for an ephemeral database; it is served by a
    /// single connection so every query sees the same data.
    pub async fn new(path: &str) -> Result<Self, StorageError> {
        let options = SqliteConnectOptions::from_str(path)
            .map_err(|e| StorageError::Storage(format!("Invalid SQLite path: {e}")))?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .pragma("foreign_keys", "ON");

        let max_connections = if path.contains(":memory:") { 1 } else { 4 };
        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect_with(options)
            .await
            .map_err(|e| StorageError::Storage(format!("Failed to open SQLite: {e}")))?;

        let store = Self { pool };
        store.run_migrations().await?;
        info!("SQLite store initialized at {path}");
        Ok(store)
    }

    /// Create from an existing pool (useful for testing).
    pub async fn from_pool(pool: SqlitePool) -> Result<Self, StorageError> {
        let store = Self { pool };
        store.run_migrations().await?;
        Ok(store)
    }

    async fn run_migrations(&self) -> Result<(), StorageError> {
        let statements = [
            (
                "jobs table",
                r#"
                CREATE TABLE IF NOT EXISTS jobs (
                    id            INTEGER PRIMARY KEY AUTOINCREMENT,
                    job_uuid      TEXT UNIQUE NOT NULL,
                    job_type      TEXT NOT NULL,
                    status        TEXT NOT NULL,
                    progress      INTEGER NOT NULL DEFAULT 0,
                    user_id       INTEGER NOT NULL,
                    session_id    INTEGER NOT NULL,
                    project_id    INTEGER,
                    plugin_id     INTEGER NOT NULL,
                    method        TEXT NOT NULL,
                    payload       TEXT NOT NULL,
                    result        TEXT,
                    error_message TEXT,
                    created_at    TEXT NOT NULL,
                    updated_at    TEXT NOT NULL,
                    started_at    TEXT,
                    finished_at   TEXT
                )
                "#,
            ),
            (
                "jobs status index",
                "CREATE INDEX IF NOT EXISTS idx_jobs_status ON jobs(status, id)",
            ),
            (
                "jobs session index",
                "CREATE INDEX IF NOT EXISTS idx_jobs_session ON jobs(session_id, id)",
            ),
            (
                "sessions table",
                r#"
                CREATE TABLE IF NOT EXISTS sessions (
                    id              INTEGER PRIMARY KEY AUTOINCREMENT,
                    title           TEXT NOT NULL,
                    mode            TEXT NOT NULL,
                    project_id      INTEGER NOT NULL,
                    user_id         INTEGER NOT NULL,
                    workflow_type   TEXT,
                    workflow_status TEXT,
                    workflow_config TEXT,
                    created_at      TEXT NOT NULL,
                    updated_at      TEXT NOT NULL
                )
                "#,
            ),
            (
                "session_steps table",
                r#"
                CREATE TABLE IF NOT EXISTS session_steps (
                    id            INTEGER PRIMARY KEY AUTOINCREMENT,
                    session_id    INTEGER NOT NULL REFERENCES sessions(id),
                    order_index   INTEGER NOT NULL,
                    title         TEXT NOT NULL,
                    content       TEXT NOT NULL,
                    format_type   TEXT NOT NULL,
                    step_type     TEXT,
                    tool_call_id  TEXT,
                    metadata      TEXT,
                    is_streaming  INTEGER NOT NULL DEFAULT 0,
                    stream_status TEXT,
                    created_at    TEXT NOT NULL,
                    updated_at    TEXT NOT NULL
                )
                "#,
            ),
            (
                "session_steps order index",
                "CREATE UNIQUE INDEX IF NOT EXISTS idx_steps_order ON session_steps(session_id, order_index)",
            ),
            (
                "documents table",
                r#"
                CREATE TABLE IF NOT EXISTS documents (
                    id          INTEGER PRIMARY KEY AUTOINCREMENT,
                    project_id  INTEGER NOT NULL,
                    volume_id   INTEGER,
                    title       TEXT NOT NULL,
                    content     TEXT NOT NULL,
                    summary     TEXT NOT NULL DEFAULT '',
                    status      TEXT NOT NULL DEFAULT '',
                    order_index INTEGER NOT NULL,
                    created_at  TEXT NOT NULL,
                    updated_at  TEXT NOT NULL
                )
                "#,
            ),
        ];

        for (name, sql) in statements {
            sqlx::query(sql)
                .execute(&self.pool)
                .await
                .map_err(|e| StorageError::MigrationFailed(format!("{name}: {e}")))?;
        }

        debug!("SQLite migrations complete");
        Ok(())
    }
}

// ── Row mapping ───────────────────────────────────────────────────────────

fn col<'r, T>(row: &'r SqliteRow, name: &str) -> Result<T, StorageError>
where
    T: sqlx::Decode<'r, sqlx::Sqlite> + sqlx::Type<sqlx::Sqlite>,
{
    row.try_get(name)
        .map_err(|e| StorageError::QueryFailed(format!("{name} column: {e}")))
}

fn parse_ts(raw: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

fn parse_opt_ts(raw: Option<String>) -> Option<DateTime<Utc>> {
    raw.as_deref().map(parse_ts)
}

fn parse_json(raw: Option<String>) -> Option<serde_json::Value> {
    raw.and_then(|s| serde_json::from_str(&s).ok())
}

fn parse_enum<T: FromStr<Err = String>>(raw: &str) -> Result<T, StorageError> {
    raw.parse().map_err(StorageError::QueryFailed)
}

fn to_json(value: &serde_json::Value) -> String {
    value.to_string()
}

fn query_err(context: &str) -> impl Fn(sqlx::Error) -> StorageError + '_ {
    move |e| match &e {
        sqlx::Error::Database(db) if db.is_unique_violation() => {
            StorageError::Conflict(format!("{context}: {db}"))
        }
        _ => StorageError::QueryFailed(format!("{context}: {e}")),
    }
}

fn row_to_job(row: &SqliteRow) -> Result<Job, StorageError> {
    let job_type: String = col(row, "job_type")?;
    let status: String = col(row, "status")?;
    let payload: String = col(row, "payload")?;
    let progress: i64 = col(row, "progress")?;
    Ok(Job {
        id: col(row, "id")?,
        job_uuid: col(row, "job_uuid")?,
        job_type: parse_enum(&job_type)?,
        status: parse_enum(&status)?,
        progress: progress.clamp(0, 100) as u8,
        user_id: col(row, "user_id")?,
        session_id: col(row, "session_id")?,
        project_id: col(row, "project_id")?,
        plugin_id: col(row, "plugin_id")?,
        method: col(row, "method")?,
        payload: serde_json::from_str(&payload).unwrap_or(serde_json::Value::Null),
        result: parse_json(col(row, "result")?),
        error_message: col(row, "error_message")?,
        created_at: parse_ts(&col::<String>(row, "created_at")?),
        updated_at: parse_ts(&col::<String>(row, "updated_at")?),
        started_at: parse_opt_ts(col(row, "started_at")?),
        finished_at: parse_opt_ts(col(row, "finished_at")?),
    })
}

fn row_to_session(row: &SqliteRow) -> Result<Session, StorageError> {
    let workflow_status: Option<String> = col(row, "workflow_status")?;
    Ok(Session {
        id: col(row, "id")?,
        title: col(row, "title")?,
        mode: col(row, "mode")?,
        project_id: col(row, "project_id")?,
        user_id: col(row, "user_id")?,
        workflow_type: col(row, "workflow_type")?,
        workflow_status: workflow_status.as_deref().map(parse_enum).transpose()?,
        workflow_config: parse_json(col(row, "workflow_config")?),
        created_at: parse_ts(&col::<String>(row, "created_at")?),
        updated_at: parse_ts(&col::<String>(row, "updated_at")?),
    })
}

fn row_to_step(row: &SqliteRow) -> Result<SessionStep, StorageError> {
    let step_type: Option<String> = col(row, "step_type")?;
    let stream_status: Option<String> = col(row, "stream_status")?;
    let is_streaming: i64 = col(row, "is_streaming")?;
    Ok(SessionStep {
        id: col(row, "id")?,
        session_id: col(row, "session_id")?,
        order_index: col(row, "order_index")?,
        title: col(row, "title")?,
        content: col(row, "content")?,
        format_type: col(row, "format_type")?,
        step_type: step_type.as_deref().map(parse_enum).transpose()?,
        tool_call_id: col(row, "tool_call_id")?,
        metadata: parse_json(col(row, "metadata")?),
        is_streaming: is_streaming != 0,
        stream_status: stream_status.as_deref().map(parse_enum).transpose()?,
        created_at: parse_ts(&col::<String>(row, "created_at")?),
        updated_at: parse_ts(&col::<String>(row, "updated_at")?),
    })
}

fn row_to_document(row: &SqliteRow) -> Result<Document, StorageError> {
    Ok(Document {
        id: col(row, "id")?,
        project_id: col(row, "project_id")?,
        volume_id: col(row, "volume_id")?,
        title: col(row, "title")?,
        content: col(row, "content")?,
        summary: col(row, "summary")?,
        status: col(row, "status")?,
        order_index: col(row, "order_index")?,
        created_at: parse_ts(&col::<String>(row, "created_at")?),
        updated_at: parse_ts(&col::<String>(row, "updated_at")?),
    })
}

// ── JobStore ──────────────────────────────────────────────────────────────

#[async_trait]
impl JobStore for SqliteStore {
    async fn create_job(&self, job: NewJob) -> Result<Job, StorageError> {
        let job = job.into_job(0);
        let id = sqlx::query(
            r#"
            INSERT INTO jobs (job_uuid, job_type, status, progress, user_id, session_id, project_id,
                              plugin_id, method, payload, created_at, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
            "#,
        )
        .bind(&job.job_uuid)
        .bind(job.job_type.as_str())
        .bind(job.status.as_str())
        .bind(job.progress as i64)
        .bind(job.user_id)
        .bind(job.session_id)
        .bind(job.project_id)
        .bind(job.plugin_id)
        .bind(&job.method)
        .bind(to_json(&job.payload))
        .bind(job.created_at.to_rfc3339())
        .bind(job.updated_at.to_rfc3339())
        .execute(&self.pool)
        .await
        .map_err(query_err("insert job"))?
        .last_insert_rowid();

        Ok(Job { id, ..job })
    }

    async fn get_job(&self, id: i64) -> Result<Option<Job>, StorageError> {
        sqlx::query("SELECT * FROM jobs WHERE id = ?1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(query_err("get job"))?
            .as_ref()
            .map(row_to_job)
            .transpose()
    }

    async fn get_job_by_uuid(&self, uuid: &str) -> Result<Option<Job>, StorageError> {
        sqlx::query("SELECT * FROM jobs WHERE job_uuid = ?1")
            .bind(uuid)
            .fetch_optional(&self.pool)
            .await
            .map_err(query_err("get job by uuid"))?
            .as_ref()
            .map(row_to_job)
            .transpose()
    }

    async fn update_job(&self, job: &Job) -> Result<(), StorageError> {
        let result = sqlx::query(
            r#"
            UPDATE jobs SET status = ?1, progress = ?2, result = ?3, error_message = ?4,
                            updated_at = ?5, started_at = ?6, finished_at = ?7
            WHERE id = ?8
            "#,
        )
        .bind(job.status.as_str())
        .bind(job.progress as i64)
        .bind(job.result.as_ref().map(to_json))
        .bind(&job.error_message)
        .bind(Utc::now().to_rfc3339())
        .bind(job.started_at.map(|t| t.to_rfc3339()))
        .bind(job.finished_at.map(|t| t.to_rfc3339()))
        .bind(job.id)
        .execute(&self.pool)
        .await
        .map_err(query_err("update job"))?;

        if result.rows_affected() == 0 {
            return Err(StorageError::NotFound(format!("job {}", job.job_uuid)));
        }
        Ok(())
    }

    async fn list_jobs_by_session(&self, session_id: i64) -> Result<Vec<Job>, StorageError> {
        sqlx::query("SELECT * FROM jobs WHERE session_id = ?1 ORDER BY id")
            .bind(session_id)
            .fetch_all(&self.pool)
            .await
            .map_err(query_err("list jobs by session"))?
            .iter()
            .map(row_to_job)
            .collect()
    }

    async fn list_jobs_by_status(&self, status: JobStatus, limit: usize) -> Result<Vec<Job>, StorageError> {
        sqlx::query("SELECT * FROM jobs WHERE status = ?1 ORDER BY id LIMIT ?2")
            .bind(status.as_str())
            .bind(limit as i64)
            .fetch_all(&self.pool)
            .await
            .map_err(query_err("list jobs by status"))?
            .iter()
            .map(row_to_job)
            .collect()
    }
}

// ── SessionStore ──────────────────────────────────────────────────────────

#[async_trait]
impl SessionStore for SqliteStore {
    async fn create_session(&self, session: NewSession) -> Result<Session, StorageError> {
        let session = session.into_session(0);
        let id = sqlx::query(
            r#"
            INSERT INTO sessions (title, mode, project_id, user_id, workflow_type, workflow_status,
                                  workflow_config, created_at, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
            "#,
        )
        .bind(&session.title)
        .bind(&session.mode)
        .bind(session.project_id)
        .bind(session.user_id)
        .bind(&session.workflow_type)
        .bind(session.workflow_status.map(|s| s.as_str()))
        .bind(session.workflow_config.as_ref().map(to_json))
        .bind(session.created_at.to_rfc3339())
        .bind(session.updated_at.to_rfc3339())
        .execute(&self.pool)
        .await
        .map_err(query_err("insert session"))?
        .last_insert_rowid();

        Ok(Session { id, ..session })
    }

    async fn get_session(&self, id: i64) -> Result<Option<Session>, StorageError> {
        sqlx::query("SELECT * FROM sessions WHERE id = ?1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(query_err("get session"))?
            .as_ref()
            .map(row_to_session)
            .transpose()
    }

    async fn update_session(&self, session: &Session) -> Result<(), StorageError> {
        let result = sqlx::query(
            r#"
            UPDATE sessions SET title = ?1, mode = ?2, workflow_type = ?3, workflow_status = ?4,
                                workflow_config = ?5, updated_at = ?6
            WHERE id = ?7
            "#,
        )
        .bind(&session.title)
        .bind(&session.mode)
        .bind(&session.workflow_type)
        .bind(session.workflow_status.map(|s| s.as_str()))
        .bind(session.workflow_config.as_ref().map(to_json))
        .bind(Utc::now().to_rfc3339())
        .bind(session.id)
        .execute(&self.pool)
        .await
        .map_err(query_err("update session"))?;

        if result.rows_affected() == 0 {
            return Err(StorageError::NotFound(format!("session {}", session.id)));
        }
        Ok(())
    }

    async fn list_sessions(
        &self,
        user_id: i64,
        page: usize,
        page_size: usize,
    ) -> Result<(Vec<Session>, usize), StorageError> {
        let total: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM sessions WHERE user_id = ?1")
            .bind(user_id)
            .fetch_one(&self.pool)
            .await
            .map_err(query_err("count sessions"))?;

        let page_size = page_size.max(1);
        let offset = page.saturating_sub(1) * page_size;
        let sessions = sqlx::query(
            "SELECT * FROM sessions WHERE user_id = ?1 ORDER BY created_at DESC, id DESC LIMIT ?2 OFFSET ?3",
        )
        .bind(user_id)
        .bind(page_size as i64)
        .bind(offset as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(query_err("list sessions"))?
        .iter()
        .map(row_to_session)
        .collect::<Result<Vec<_>, _>>()?;

        Ok((sessions, total as usize))
    }

    async fn create_step(&self, step: NewStep) -> Result<SessionStep, StorageError> {
        let step = step.into_step(0);
        let id = sqlx::query(
            r#"
            INSERT INTO session_steps (session_id, order_index, title, content, format_type, step_type,
                                       tool_call_id, metadata, is_streaming, stream_status,
                                       created_at, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
            "#,
        )
        .bind(step.session_id)
        .bind(step.order_index)
        .bind(&step.title)
        .bind(&step.content)
        .bind(&step.format_type)
        .bind(step.step_type.map(|t| t.as_str()))
        .bind(&step.tool_call_id)
        .bind(step.metadata.as_ref().map(to_json))
        .bind(step.is_streaming as i64)
        .bind(step.stream_status.map(|s| s.as_str()))
        .bind(step.created_at.to_rfc3339())
        .bind(step.updated_at.to_rfc3339())
        .execute(&self.pool)
        .await
        .map_err(query_err("insert step"))?
        .last_insert_rowid();

        Ok(SessionStep { id, ..step })
    }

    async fn get_step(&self, id: i64) -> Result<Option<SessionStep>, StorageError> {
        sqlx::query("SELECT * FROM session_steps WHERE id = ?1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(query_err("get step"))?
            .as_ref()
            .map(row_to_step)
            .transpose()
    }

    async fn update_step(&self, step: &SessionStep) -> Result<(), StorageError> {
        let result = sqlx::query(
            r#"
            UPDATE session_steps SET title = ?1, content = ?2, metadata = ?3, is_streaming = ?4,
                                     stream_status = ?5, updated_at = ?6
            WHERE id = ?7 AND (stream_status IS NULL OR stream_status = 'streaming')
            "#,
        )
        .bind(&step.title)
        .bind(&step.content)
        .bind(step.metadata.as_ref().map(to_json))
        .bind(step.is_streaming as i64)
        .bind(step.stream_status.map(|s| s.as_str()))
        .bind(Utc::now().to_rfc3339())
        .bind(step.id)
        .execute(&self.pool)
        .await
        .map_err(query_err("update step"))?;

        if result.rows_affected() == 0 {
            let exists = sqlx::query("SELECT id FROM session_steps WHERE id = ?1")
                .bind(step.id)
                .fetch_optional(&self.pool)
                .await
                .map_err(query_err("check step"))?;
            return Err(match exists {
                Some(_) => StorageError::Conflict(format!("step {} is already final", step.id)),
                None => StorageError::NotFound(format!("step {}", step.id)),
            });
        }
        Ok(())
    }

    async fn list_steps(&self, session_id: i64) -> Result<Vec<SessionStep>, StorageError> {
        sqlx::query("SELECT * FROM session_steps WHERE session_id = ?1 ORDER BY order_index")
            .bind(session_id)
            .fetch_all(&self.pool)
            .await
            .map_err(query_err("list steps"))?
            .iter()
            .map(row_to_step)
            .collect()
    }

    async fn max_step_order(&self, session_id: i64) -> Result<Option<i64>, StorageError> {
        sqlx::query_scalar("SELECT MAX(order_index) FROM session_steps WHERE session_id = ?1")
            .bind(session_id)
            .fetch_one(&self.pool)
            .await
            .map_err(query_err("max step order"))
    }
}

// ── DocumentStore ─────────────────────────────────────────────────────────

#[async_trait]
impl DocumentStore for SqliteStore {
    async fn create_document(&self, doc: NewDocument) -> Result<Document, StorageError> {
        let doc = doc.into_document(0);
        let id = sqlx::query(
            r#"
            INSERT INTO documents (project_id, volume_id, title, content, summary, status, order_index,
                                   created_at, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
            "#,
        )
        .bind(doc.project_id)
        .bind(doc.volume_id)
        .bind(&doc.title)
        .bind(&doc.content)
        .bind(&doc.summary)
        .bind(&doc.status)
        .bind(doc.order_index)
        .bind(doc.created_at.to_rfc3339())
        .bind(doc.updated_at.to_rfc3339())
        .execute(&self.pool)
        .await
        .map_err(query_err("insert document"))?
        .last_insert_rowid();

        Ok(Document { id, ..doc })
    }

    async fn get_document(&self, id: i64) -> Result<Option<Document>, StorageError> {
        sqlx::query("SELECT * FROM documents WHERE id = ?1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(query_err("get document"))?
            .as_ref()
            .map(row_to_document)
            .transpose()
    }

    async fn update_document(&self, id: i64, update: &DocumentUpdate) -> Result<Document, StorageError> {
        let mut doc = self
            .get_document(id)
            .await?
            .ok_or_else(|| StorageError::NotFound(format!("document {id}")))?;
        if update.is_empty() {
            return Ok(doc);
        }
        update.apply(&mut doc);

        sqlx::query(
            "UPDATE documents SET title = ?1, content = ?2, summary = ?3, status = ?4, updated_at = ?5 WHERE id = ?6",
        )
        .bind(&doc.title)
        .bind(&doc.content)
        .bind(&doc.summary)
        .bind(&doc.status)
        .bind(doc.updated_at.to_rfc3339())
        .bind(id)
        .execute(&self.pool)
        .await
        .map_err(query_err("update document"))?;

        Ok(doc)
    }

    async fn next_order_index(&self, project_id: i64, volume_id: Option<i64>) -> Result<i64, StorageError> {
        let max: Option<i64> = sqlx::query_scalar(
            "SELECT MAX(order_index) FROM documents WHERE project_id = ?1 AND volume_id IS ?2",
        )
        .bind(project_id)
        .bind(volume_id)
        .fetch_one(&self.pool)
        .await
        .map_err(query_err("next order index"))?;

        Ok(max.map_or(1, |m| m + 1))
    }
}

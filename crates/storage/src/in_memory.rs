//! In-memory store: useful for testing and ephemeral runs.

use async_trait::async_trait;
use chrono::Utc;
use inkwell_core::document::{Document, DocumentUpdate, NewDocument};
use inkwell_core::error::StorageError;
use inkwell_core::job::{Job, JobStatus, NewJob};
use inkwell_core::session::{NewSession, NewStep, Session, SessionStep};
use inkwell_core::store::{DocumentStore, JobStore, SessionStore};
use std::sync::Arc;
use tokio::sync::RwLock;

#[derive(Default)]
struct Tables {
    jobs: Vec<Job>,
    sessions: Vec<Session>,
    steps: Vec<SessionStep>,
    documents: Vec<Document>,
    last_id: i64,
}

impl Tables {
    fn next_id(&mut self) -> i64 {
        self.last_id += 1;
        self.last_id
    }
}

/// Implements every store trait over plain vectors behind one lock.
#[derive(Clone, Default)]
pub struct InMemoryStore {
    tables: Arc<RwLock<Tables>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl JobStore for InMemoryStore {
    async fn create_job(&self, job: NewJob) -> Result<Job, StorageError> {
        let mut tables = self.tables.write().await;
        if tables.jobs.iter().any(|j| j.job_uuid == job.job_uuid) {
            return Err(StorageError::Conflict(format!("job {} already exists", job.job_uuid)));
        }
        let id = tables.next_id();
        let job = job.into_job(id);
        tables.jobs.push(job.clone());
        Ok(job)
    }

    async fn get_job(&self, id: i64) -> Result<Option<Job>, StorageError> {
        Ok(self.tables.read().await.jobs.iter().find(|j| j.id == id).cloned())
    }

    async fn get_job_by_uuid(&self, uuid: &str) -> Result<Option<Job>, StorageError> {
        Ok(self
            .tables
            .read()
            .await
            .jobs
            .iter()
            .find(|j| j.job_uuid == uuid)
            .cloned())
    }

    async fn update_job(&self, job: &Job) -> Result<(), StorageError> {
        let mut tables = self.tables.write().await;
        let slot = tables
            .jobs
            .iter_mut()
            .find(|j| j.id == job.id)
            .ok_or_else(|| StorageError::NotFound(format!("job {}", job.job_uuid)))?;
        *slot = job.clone();
        slot.updated_at = Utc::now();
        Ok(())
    }

    async fn list_jobs_by_session(&self, session_id: i64) -> Result<Vec<Job>, StorageError> {
        Ok(self
            .tables
            .read()
            .await
            .jobs
            .iter()
            .filter(|j| j.session_id == session_id)
            .cloned()
            .collect())
    }

    async fn list_jobs_by_status(&self, status: JobStatus, limit: usize) -> Result<Vec<Job>, StorageError> {
        Ok(self
            .tables
            .read()
            .await
            .jobs
            .iter()
            .filter(|j| j.status == status)
            .take(limit)
            .cloned()
            .collect())
    }
}

#[async_trait]
impl SessionStore for InMemoryStore {
    async fn create_session(&self, session: NewSession) -> Result<Session, StorageError> {
        let mut tables = self.tables.write().await;
        let id = tables.next_id();
        let session = session.into_session(id);
        tables.sessions.push(session.clone());
        Ok(session)
    }

    async fn get_session(&self, id: i64) -> Result<Option<Session>, StorageError> {
        Ok(self.tables.read().await.sessions.iter().find(|s| s.id == id).cloned())
    }

    async fn update_session(&self, session: &Session) -> Result<(), StorageError> {
        let mut tables = self.tables.write().await;
        let slot = tables
            .sessions
            .iter_mut()
            .find(|s| s.id == session.id)
            .ok_or_else(|| StorageError::NotFound(format!("session {}", session.id)))?;
        *slot = session.clone();
        slot.updated_at = Utc::now();
        Ok(())
    }

    async fn list_sessions(
        &self,
        user_id: i64,
        page: usize,
        page_size: usize,
    ) -> Result<(Vec<Session>, usize), StorageError> {
        let tables = self.tables.read().await;
        let mut owned: Vec<&Session> = tables.sessions.iter().filter(|s| s.user_id == user_id).collect();
        owned.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
        let total = owned.len();
        let page_size = page_size.max(1);
        let offset = page.saturating_sub(1) * page_size;
        let items = owned.into_iter().skip(offset).take(page_size).cloned().collect();
        Ok((items, total))
    }

    async fn create_step(&self, step: NewStep) -> Result<SessionStep, StorageError> {
        let mut tables = self.tables.write().await;
        if tables
            .steps
            .iter()
            .any(|s| s.session_id == step.session_id && s.order_index == step.order_index)
        {
            return Err(StorageError::Conflict(format!(
                "order index {} already used in session {}",
                step.order_index, step.session_id
            )));
        }
        let id = tables.next_id();
        let step = step.into_step(id);
        tables.steps.push(step.clone());
        Ok(step)
    }

    async fn get_step(&self, id: i64) -> Result<Option<SessionStep>, StorageError> {
        Ok(self.tables.read().await.steps.iter().find(|s| s.id == id).cloned())
    }

    async fn update_step(&self, step: &SessionStep) -> Result<(), StorageError> {
        let mut tables = self.tables.write().await;
        let slot = tables
            .steps
            .iter_mut()
            .find(|s| s.id == step.id)
            .ok_or_else(|| StorageError::NotFound(format!("step {}", step.id)))?;
        if slot.stream_status.is_some_and(|s| s.is_final()) {
            return Err(StorageError::Conflict(format!("step {} is already final", step.id)));
        }
        let order_index = slot.order_index;
        *slot = step.clone();
        slot.order_index = order_index;
        slot.updated_at = Utc::now();
        Ok(())
    }

    async fn list_steps(&self, session_id: i64) -> Result<Vec<SessionStep>, StorageError> {
        let tables = self.tables.read().await;
        let mut steps: Vec<SessionStep> = tables
            .steps
            .iter()
            .filter(|s| s.session_id == session_id)
            .cloned()
            .collect();
        steps.sort_by_key(|s| s.order_index);
        Ok(steps)
    }

    async fn max_step_order(&self, session_id: i64) -> Result<Option<i64>, StorageError> {
        Ok(self
            .tables
            .read()
            .await
            .steps
            .iter()
            .filter(|s| s.session_id == session_id)
            .map(|s| s.order_index)
            .max())
    }
}

#[async_trait]
impl DocumentStore for InMemoryStore {
    async fn create_document(&self, doc: NewDocument) -> Result<Document, StorageError> {
        let mut tables = self.tables.write().await;
        let id = tables.next_id();
        let doc = doc.into_document(id);
        tables.documents.push(doc.clone());
        Ok(doc)
    }

    async fn get_document(&self, id: i64) -> Result<Option<Document>, StorageError> {
        Ok(self.tables.read().await.documents.iter().find(|d| d.id == id).cloned())
    }

    async fn update_document(&self, id: i64, update: &DocumentUpdate) -> Result<Document, StorageError> {
        let mut tables = self.tables.write().await;
        let doc = tables
            .documents
            .iter_mut()
            .find(|d| d.id == id)
            .ok_or_else(|| StorageError::NotFound(format!("document {id}")))?;
        update.apply(doc);
        Ok(doc.clone())
    }

    async fn next_order_index(&self, project_id: i64, volume_id: Option<i64>) -> Result<i64, StorageError> {
        let tables = self.tables.read().await;
        let max = tables
            .documents
            .iter()
            .filter(|d| d.project_id == project_id && d.volume_id == volume_id)
            .map(|d| d.order_index)
            .max();
        Ok(max.map_or(1, |m| m + 1))
    }
}

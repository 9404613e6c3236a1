//! Storage traits: the persistence collaborators the engines run against.
//!
//! Implementations live in `inkwell-storage`. Lookups return `Ok(None)` for
//! missing records; callers decide whether that is a `NotFound`.

use crate::document::{Document, DocumentUpdate, NewDocument};
use crate::error::StorageError;
use crate::job::{Job, JobStatus, NewJob};
use crate::session::{NewSession, NewStep, Session, SessionStep};
use async_trait::async_trait;

/// Persistence for [`Job`] records.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Persist a new job in `queued` state and return it with its storage id.
    async fn create_job(&self, job: NewJob) -> std::result::Result<Job, StorageError>;

    async fn get_job(&self, id: i64) -> std::result::Result<Option<Job>, StorageError>;

    async fn get_job_by_uuid(&self, uuid: &str) -> std::result::Result<Option<Job>, StorageError>;

    /// Overwrite the mutable fields of an existing job.
    async fn update_job(&self, job: &Job) -> std::result::Result<(), StorageError>;

    /// Jobs of one session in creation order.
    async fn list_jobs_by_session(&self, session_id: i64) -> std::result::Result<Vec<Job>, StorageError>;

    /// Jobs currently in `status`, oldest first.
    async fn list_jobs_by_status(
        &self,
        status: JobStatus,
        limit: usize,
    ) -> std::result::Result<Vec<Job>, StorageError>;
}

/// Persistence for sessions and their steps.
#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn create_session(&self, session: NewSession) -> std::result::Result<Session, StorageError>;

    async fn get_session(&self, id: i64) -> std::result::Result<Option<Session>, StorageError>;

    async fn update_session(&self, session: &Session) -> std::result::Result<(), StorageError>;

    /// A page of a user's sessions, newest first, plus the total count.
    async fn list_sessions(
        &self,
        user_id: i64,
        page: usize,
        page_size: usize,
    ) -> std::result::Result<(Vec<Session>, usize), StorageError>;

    /// Persist a step. Fails with `Conflict` if the order index is taken.
    async fn create_step(&self, step: NewStep) -> std::result::Result<SessionStep, StorageError>;

    async fn get_step(&self, id: i64) -> std::result::Result<Option<SessionStep>, StorageError>;

    /// Overwrite content, metadata and streaming fields of an existing step.
    ///
    /// A step whose stored stream status is final is left untouched and the
    /// call fails with `Conflict`.
    async fn update_step(&self, step: &SessionStep) -> std::result::Result<(), StorageError>;

    /// Steps of one session ordered by `order_index`.
    async fn list_steps(&self, session_id: i64) -> std::result::Result<Vec<SessionStep>, StorageError>;

    /// Highest order index in use for a session, if any step exists.
    async fn max_step_order(&self, session_id: i64) -> std::result::Result<Option<i64>, StorageError>;
}

/// Persistence for documents written by workflows.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    async fn create_document(&self, doc: NewDocument) -> std::result::Result<Document, StorageError>;

    async fn get_document(&self, id: i64) -> std::result::Result<Option<Document>, StorageError>;

    /// Apply a partial update and return the stored document.
    async fn update_document(
        &self,
        id: i64,
        update: &DocumentUpdate,
    ) -> std::result::Result<Document, StorageError>;

    /// The order index a new document in this project/volume should take.
    async fn next_order_index(
        &self,
        project_id: i64,
        volume_id: Option<i64>,
    ) -> std::result::Result<i64, StorageError>;
}

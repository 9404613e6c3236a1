//! Job entity: one tracked asynchronous plugin invocation.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Lifecycle state of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Queued,
    Running,
    Succeeded,
    Failed,
    Canceled,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Queued => "queued",
            JobStatus::Running => "running",
            JobStatus::Succeeded => "succeeded",
            JobStatus::Failed => "failed",
            JobStatus::Canceled => "canceled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Succeeded | JobStatus::Failed | JobStatus::Canceled
        )
    }

    /// Whether `self -> next` is a legal transition.
    pub fn can_transition_to(&self, next: JobStatus) -> bool {
        match (self, next) {
            (JobStatus::Queued, JobStatus::Running) => true,
            (JobStatus::Running, JobStatus::Succeeded | JobStatus::Failed) => true,
            (JobStatus::Queued | JobStatus::Running, JobStatus::Canceled) => true,
            _ => false,
        }
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" => Ok(JobStatus::Queued),
            "running" => Ok(JobStatus::Running),
            "succeeded" => Ok(JobStatus::Succeeded),
            "failed" => Ok(JobStatus::Failed),
            "canceled" => Ok(JobStatus::Canceled),
            other => Err(format!("unknown job status: {other}")),
        }
    }
}

/// Kind of work a job performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobType {
    PluginInvoke,
}

impl JobType {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobType::PluginInvoke => "plugin_invoke",
        }
    }
}

impl std::str::FromStr for JobType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "plugin_invoke" => Ok(JobType::PluginInvoke),
            other => Err(format!("unknown job type: {other}")),
        }
    }
}

/// A persisted job record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    /// Storage key. Never exposed to callers; see [`JobPublic`].
    pub id: i64,
    pub job_uuid: String,
    pub job_type: JobType,
    pub status: JobStatus,
    pub progress: u8,
    pub user_id: i64,
    pub session_id: i64,
    pub project_id: Option<i64>,
    pub plugin_id: i64,
    pub method: String,
    pub payload: serde_json::Value,
    pub result: Option<serde_json::Value>,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl Job {
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    pub fn to_public(&self) -> JobPublic {
        JobPublic {
            job_uuid: self.job_uuid.clone(),
            job_type: self.job_type,
            status: self.status,
            progress: self.progress,
            user_id: self.user_id,
            session_id: self.session_id,
            project_id: self.project_id,
            plugin_id: self.plugin_id,
            method: self.method.clone(),
            payload: self.payload.clone(),
            result: self.result.clone(),
            error_message: self.error_message.clone(),
            created_at: self.created_at,
            started_at: self.started_at,
            finished_at: self.finished_at,
        }
    }
}

/// Caller-facing view of a job, identified by UUID only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobPublic {
    pub job_uuid: String,
    #[serde(rename = "type")]
    pub job_type: JobType,
    pub status: JobStatus,
    pub progress: u8,
    pub user_id: i64,
    pub session_id: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub project_id: Option<i64>,
    pub plugin_id: i64,
    pub method: String,
    pub payload: serde_json::Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
}

/// Fields needed to persist a new queued job.
#[derive(Debug, Clone)]
pub struct NewJob {
    pub job_uuid: String,
    pub job_type: JobType,
    pub user_id: i64,
    pub session_id: i64,
    pub project_id: Option<i64>,
    pub plugin_id: i64,
    pub method: String,
    pub payload: serde_json::Value,
}

impl NewJob {
    /// A plugin invocation with a freshly generated UUID.
    pub fn plugin_invoke(
        user_id: i64,
        session_id: i64,
        plugin_id: i64,
        method: impl Into<String>,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            job_uuid: uuid::Uuid::new_v4().to_string(),
            job_type: JobType::PluginInvoke,
            user_id,
            session_id,
            project_id: None,
            plugin_id,
            method: method.into(),
            payload,
        }
    }

    pub fn with_project(mut self, project_id: Option<i64>) -> Self {
        self.project_id = project_id;
        self
    }

    /// Materialize the record a store persists, in `queued` state.
    pub fn into_job(self, id: i64) -> Job {
        let now = Utc::now();
        Job {
            id,
            job_uuid: self.job_uuid,
            job_type: self.job_type,
            status: JobStatus::Queued,
            progress: 0,
            user_id: self.user_id,
            session_id: self.session_id,
            project_id: self.project_id,
            plugin_id: self.plugin_id,
            method: self.method,
            payload: self.payload,
            result: None,
            error_message: None,
            created_at: now,
            updated_at: now,
            started_at: None,
            finished_at: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transitions_are_one_directional() {
        use JobStatus::*;
        assert!(Queued.can_transition_to(Running));
        assert!(Running.can_transition_to(Succeeded));
        assert!(Running.can_transition_to(Failed));
        assert!(Queued.can_transition_to(Canceled));
        assert!(Running.can_transition_to(Canceled));

        assert!(!Running.can_transition_to(Queued));
        assert!(!Queued.can_transition_to(Succeeded));
        for terminal in [Succeeded, Failed, Canceled] {
            assert!(terminal.is_terminal());
            for next in [Queued, Running, Succeeded, Failed, Canceled] {
                assert!(!terminal.can_transition_to(next));
            }
        }
    }

    #[test]
    fn public_view_hides_storage_id() {
        let job = NewJob::plugin_invoke(1, 2, 3, "echo", serde_json::json!({"x": 1})).into_job(99);
        let value = serde_json::to_value(job.to_public()).unwrap();
        assert!(value.get("id").is_none());
        assert_eq!(value["type"], "plugin_invoke");
        assert_eq!(value["status"], "queued");
        assert_eq!(value["job_uuid"], job.job_uuid.as_str());
    }

    #[test]
    fn status_parses_from_wire_names() {
        assert_eq!("canceled".parse::<JobStatus>().unwrap(), JobStatus::Canceled);
        assert!("cancelled".parse::<JobStatus>().is_err());
    }
}

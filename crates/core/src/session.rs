//! Sessions and their append-only step transcript.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Progress of the workflow attached to a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowStatus {
    Pending,
    Running,
    Completed,
    Error,
    Cancelled,
}

impl WorkflowStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkflowStatus::Pending => "pending",
            WorkflowStatus::Running => "running",
            WorkflowStatus::Completed => "completed",
            WorkflowStatus::Error => "error",
            WorkflowStatus::Cancelled => "cancelled",
        }
    }
}

impl std::str::FromStr for WorkflowStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(WorkflowStatus::Pending),
            "running" => Ok(WorkflowStatus::Running),
            "completed" => Ok(WorkflowStatus::Completed),
            "error" => Ok(WorkflowStatus::Error),
            "cancelled" => Ok(WorkflowStatus::Cancelled),
            other => Err(format!("unknown workflow status: {other}")),
        }
    }
}

/// A conversation or workflow container.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub id: i64,
    pub title: String,
    pub mode: String,
    pub project_id: i64,
    pub user_id: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub workflow_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub workflow_status: Option<WorkflowStatus>,
    /// Opaque resumable state (e.g. the current chapter index).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub workflow_config: Option<serde_json::Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default)]
pub struct NewSession {
    pub title: String,
    pub mode: String,
    pub project_id: i64,
    pub user_id: i64,
    pub workflow_type: Option<String>,
    pub workflow_status: Option<WorkflowStatus>,
    pub workflow_config: Option<serde_json::Value>,
}

impl NewSession {
    pub fn new(user_id: i64, project_id: i64, title: impl Into<String>, mode: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            mode: mode.into(),
            project_id,
            user_id,
            ..Self::default()
        }
    }

    pub fn with_workflow(mut self, workflow_type: impl Into<String>, config: serde_json::Value) -> Self {
        self.workflow_type = Some(workflow_type.into());
        self.workflow_status = Some(WorkflowStatus::Pending);
        self.workflow_config = Some(config);
        self
    }

    pub fn into_session(self, id: i64) -> Session {
        let now = Utc::now();
        Session {
            id,
            title: self.title,
            mode: self.mode,
            project_id: self.project_id,
            user_id: self.user_id,
            workflow_type: self.workflow_type,
            workflow_status: self.workflow_status,
            workflow_config: self.workflow_config,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Role of a transcript entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepType {
    User,
    Assistant,
    ToolCall,
    ToolResult,
    PluginResult,
}

impl StepType {
    pub fn as_str(&self) -> &'static str {
        match self {
            StepType::User => "user",
            StepType::Assistant => "assistant",
            StepType::ToolCall => "tool_call",
            StepType::ToolResult => "tool_result",
            StepType::PluginResult => "plugin_result",
        }
    }

    pub fn is_tool(&self) -> bool {
        matches!(self, StepType::ToolCall | StepType::ToolResult)
    }
}

impl std::str::FromStr for StepType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "user" => Ok(StepType::User),
            "assistant" => Ok(StepType::Assistant),
            "tool_call" => Ok(StepType::ToolCall),
            "tool_result" => Ok(StepType::ToolResult),
            "plugin_result" => Ok(StepType::PluginResult),
            other => Err(format!("unknown step type: {other}")),
        }
    }
}

/// Streaming state of a step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamStatus {
    Streaming,
    Completed,
    Error,
    Cancelled,
}

impl StreamStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            StreamStatus::Streaming => "streaming",
            StreamStatus::Completed => "completed",
            StreamStatus::Error => "error",
            StreamStatus::Cancelled => "cancelled",
        }
    }

    /// Completed, error and cancelled are final.
    pub fn is_final(&self) -> bool {
        !matches!(self, StreamStatus::Streaming)
    }
}

impl std::str::FromStr for StreamStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "streaming" => Ok(StreamStatus::Streaming),
            "completed" => Ok(StreamStatus::Completed),
            "error" => Ok(StreamStatus::Error),
            "cancelled" => Ok(StreamStatus::Cancelled),
            other => Err(format!("unknown stream status: {other}")),
        }
    }
}

/// One entry in a session transcript.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionStep {
    pub id: i64,
    pub session_id: i64,
    pub order_index: i64,
    pub title: String,
    pub content: String,
    pub format_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub step_type: Option<StepType>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
    pub is_streaming: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stream_status: Option<StreamStatus>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A step ready to be persisted at a known order index.
#[derive(Debug, Clone)]
pub struct NewStep {
    pub session_id: i64,
    pub order_index: i64,
    pub title: String,
    pub content: String,
    pub format_type: String,
    pub step_type: Option<StepType>,
    pub tool_call_id: Option<String>,
    pub metadata: Option<serde_json::Value>,
    pub stream_status: Option<StreamStatus>,
}

impl NewStep {
    pub fn into_step(self, id: i64) -> SessionStep {
        let now = Utc::now();
        SessionStep {
            id,
            session_id: self.session_id,
            order_index: self.order_index,
            title: self.title,
            content: self.content,
            format_type: self.format_type,
            step_type: self.step_type,
            tool_call_id: self.tool_call_id,
            metadata: self.metadata,
            is_streaming: self.stream_status == Some(StreamStatus::Streaming),
            stream_status: self.stream_status,
            created_at: now,
            updated_at: now,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn streaming_step_is_flagged() {
        let step = NewStep {
            session_id: 1,
            order_index: 0,
            title: "Chapter 1".into(),
            content: String::new(),
            format_type: "stream".into(),
            step_type: Some(StepType::Assistant),
            tool_call_id: None,
            metadata: None,
            stream_status: Some(StreamStatus::Streaming),
        }
        .into_step(5);
        assert!(step.is_streaming);
        assert!(!StreamStatus::Streaming.is_final());
        assert!(StreamStatus::Cancelled.is_final());
    }

    #[test]
    fn new_workflow_session_starts_pending() {
        let session = NewSession::new(1, 2, "AgentWriter: a heist", "AgentWriter")
            .with_workflow("agent_writer", serde_json::json!({ "current_chapter": 0 }))
            .into_session(10);
        assert_eq!(session.workflow_status, Some(WorkflowStatus::Pending));
        assert_eq!(session.workflow_type.as_deref(), Some("agent_writer"));
    }
}

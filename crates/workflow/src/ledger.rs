//! Session step ledger: the append-only transcript of a session.
//!
//! Every append takes the session's lock, reads the current max order index
//! and inserts at max + 1, so concurrent appenders to one session never
//! collide. Each append publishes `step.appended` to the session.

use inkwell_core::ai::ToolCall;
use inkwell_core::error::{Error, Result, StorageError};
use inkwell_core::event::{EventHub, EventType};
use inkwell_core::session::{NewStep, SessionStep, StepType, StreamStatus};
use inkwell_core::store::SessionStore;
use serde_json::{Map, Value, json};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tracing::{debug, warn};

const MAX_INSERT_ATTEMPTS: usize = 3;

/// Content of a step about to be appended.
#[derive(Debug, Clone)]
pub struct StepDraft {
    pub session_id: i64,
    pub title: String,
    pub content: String,
    pub format_type: String,
    pub step_type: Option<StepType>,
    pub tool_call_id: Option<String>,
    pub metadata: Option<Value>,
}

impl StepDraft {
    pub fn new(
        session_id: i64,
        title: impl Into<String>,
        content: impl Into<String>,
        format_type: impl Into<String>,
    ) -> Self {
        Self {
            session_id,
            title: title.into(),
            content: content.into(),
            format_type: format_type.into(),
            step_type: None,
            tool_call_id: None,
            metadata: None,
        }
    }

    pub fn with_step_type(mut self, step_type: StepType) -> Self {
        self.step_type = Some(step_type);
        self
    }

    pub fn with_metadata(mut self, metadata: Value) -> Self {
        self.metadata = Some(metadata);
        self
    }

    pub fn with_tool_call_id(mut self, id: impl Into<String>) -> Self {
        self.tool_call_id = Some(id.into());
        self
    }
}

pub struct SessionStepLedger {
    sessions: Arc<dyn SessionStore>,
    hub: Arc<EventHub>,
    locks: Mutex<HashMap<i64, Arc<tokio::sync::Mutex<()>>>>,
}

impl SessionStepLedger {
    pub fn new(sessions: Arc<dyn SessionStore>, hub: Arc<EventHub>) -> Self {
        Self {
            sessions,
            hub,
            locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn sessions(&self) -> &Arc<dyn SessionStore> {
        &self.sessions
    }

    pub fn hub(&self) -> &Arc<EventHub> {
        &self.hub
    }

    /// Append a step and publish `step.appended`.
    pub async fn append(&self, draft: StepDraft) -> Result<SessionStep> {
        self.append_with_event(draft, Map::new()).await
    }

    /// Append a step; `extra` fields are merged into the `step.appended` payload.
    pub async fn append_with_event(&self, draft: StepDraft, extra: Map<String, Value>) -> Result<SessionStep> {
        let step = self.insert(draft, None).await?;
        self.publish_appended(&step, extra);
        Ok(step)
    }

    /// Append an empty step in `streaming` state.
    pub async fn begin_streaming(&self, draft: StepDraft) -> Result<SessionStep> {
        let step = self.insert(draft, Some(StreamStatus::Streaming)).await?;
        self.publish_appended(&step, Map::new());
        Ok(step)
    }

    /// Update a streaming step's content and status in place.
    ///
    /// Fails with `Validation` once the step has reached a final status, as
    /// seen by either this copy or the stored row.
    pub async fn update_streaming(&self, step: &mut SessionStep, content: &str, status: StreamStatus) -> Result<()> {
        if let Some(current) = step.stream_status.filter(|s| s.is_final()) {
            return Err(Error::validation(format!(
                "step {} is already {}",
                step.id,
                current.as_str()
            )));
        }
        let mut next = step.clone();
        next.content = content.to_string();
        next.stream_status = Some(status);
        next.is_streaming = status == StreamStatus::Streaming;
        match self.sessions.update_step(&next).await {
            Ok(()) => *step = next,
            Err(StorageError::Conflict(reason)) => {
                debug!(step_id = step.id, %reason, "Stale streaming update rejected");
                return Err(Error::validation(format!("step {} is already final", step.id)));
            }
            Err(e) => return Err(e.into()),
        }
        debug!(step_id = step.id, status = status.as_str(), bytes = content.len(), "Streaming step checkpointed");
        Ok(())
    }

    pub async fn append_user(&self, session_id: i64, content: &str) -> Result<SessionStep> {
        self.append(StepDraft::new(session_id, "User", content, "text").with_step_type(StepType::User))
            .await
    }

    pub async fn append_assistant(&self, session_id: i64, content: &str) -> Result<SessionStep> {
        self.append(StepDraft::new(session_id, "Assistant", content, "text").with_step_type(StepType::Assistant))
            .await
    }

    pub async fn append_tool_call(&self, session_id: i64, call: &ToolCall) -> Result<SessionStep> {
        let metadata = json!({
            "tool_call": {
                "id": call.id,
                "name": call.name,
                "arguments": call.arguments,
            }
        });
        self.append(
            StepDraft::new(
                session_id,
                format!("tool_call:{}", call.name),
                format!("Calling tool: {}", call.name),
                "tool_call",
            )
            .with_step_type(StepType::ToolCall)
            .with_tool_call_id(call.id.clone())
            .with_metadata(metadata),
        )
        .await
    }

    /// Append a tool result; `extra` fields join `tool_result` in the metadata.
    pub async fn append_tool_result(
        &self,
        session_id: i64,
        tool_call_id: &str,
        result: &Value,
        extra: Map<String, Value>,
    ) -> Result<SessionStep> {
        let mut metadata = extra;
        metadata.insert("tool_result".into(), result.clone());
        self.append(
            StepDraft::new(session_id, "tool_result", serde_json::to_string(result)?, "tool_result")
                .with_step_type(StepType::ToolResult)
                .with_tool_call_id(tool_call_id)
                .with_metadata(Value::Object(metadata)),
        )
        .await
    }

    /// The session transcript in order, optionally without tool traffic.
    pub async fn history(&self, session_id: i64, include_tool_calls: bool) -> Result<Vec<SessionStep>> {
        let steps = self.sessions.list_steps(session_id).await?;
        if include_tool_calls {
            return Ok(steps);
        }
        Ok(steps
            .into_iter()
            .filter(|s| !s.step_type.is_some_and(|t| t.is_tool()))
            .collect())
    }

    async fn insert(&self, draft: StepDraft, stream_status: Option<StreamStatus>) -> Result<SessionStep> {
        let session_id = draft.session_id;
        let lock = self.session_lock(session_id);
        let result = {
            let _guard = lock.lock().await;
            self.insert_locked(draft, stream_status).await
        };
        self.release_lock(session_id, lock);
        result
    }

    async fn insert_locked(&self, draft: StepDraft, stream_status: Option<StreamStatus>) -> Result<SessionStep> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            let order_index = self
                .sessions
                .max_step_order(draft.session_id)
                .await?
                .map_or(0, |max| max + 1);

            let new_step = NewStep {
                session_id: draft.session_id,
                order_index,
                title: draft.title.clone(),
                content: draft.content.clone(),
                format_type: draft.format_type.clone(),
                step_type: draft.step_type,
                tool_call_id: draft.tool_call_id.clone(),
                metadata: draft.metadata.clone(),
                stream_status,
            };

            match self.sessions.create_step(new_step).await {
                Ok(step) => return Ok(step),
                // Another process appended to the same session between our read and insert.
                Err(StorageError::Conflict(reason)) if attempt < MAX_INSERT_ATTEMPTS => {
                    warn!(session_id = draft.session_id, order_index, %reason, "Step order collision, retrying");
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    fn session_lock(&self, session_id: i64) -> Arc<tokio::sync::Mutex<()>> {
        self.locks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .entry(session_id)
            .or_default()
            .clone()
    }

    fn release_lock(&self, session_id: i64, lock: Arc<tokio::sync::Mutex<()>>) {
        let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
        drop(lock);
        if locks.get(&session_id).is_some_and(|l| Arc::strong_count(l) == 1) {
            locks.remove(&session_id);
        }
    }

    fn publish_appended(&self, step: &SessionStep, extra: Map<String, Value>) {
        let mut data = json!({
            "session_id": step.session_id,
            "step_id": step.id,
            "order_index": step.order_index,
            "title": step.title,
            "content": step.content,
            "format_type": step.format_type,
            "step_type": step.step_type,
            "is_streaming": step.is_streaming,
            "timestamp": step.created_at,
        });
        if let Value::Object(map) = &mut data {
            map.extend(extra);
        }
        self.hub.publish(step.session_id, EventType::StepAppended, data);
    }
}

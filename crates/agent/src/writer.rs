//! AgentWriter: multi-chapter generation from an outline.
//!
//! One session per run (`workflow_type = agent_writer`). Chapters are
//! streamed one after another into their own steps and appended to the
//! target document. A failed chapter is reported with `chapter.error` and the
//! run moves on to the next one; cancellation is checked before every chapter
//! and between chunks.
//!
//! The run's progress lives in the session's `workflow_config`, so a
//! cancelled or failed run can be resumed from `current_chapter`.

use crate::checkpoint::CheckpointPolicy;
use crate::streaming::{StreamEnd, open_stream, pump};
use chrono::Utc;
use inkwell_core::ai::{AiClient, AiTarget};
use inkwell_core::document::DocumentUpdate;
use inkwell_core::error::{Error, Result};
use inkwell_core::event::{EventType, session_key};
use inkwell_core::session::{NewSession, Session, StepType, StreamStatus, WorkflowStatus};
use inkwell_core::store::DocumentStore;
use inkwell_core::{CancelGuard, CancellationRegistry, CancellationToken};
use inkwell_workflow::{SessionStepLedger, StepDraft};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

pub const WORKFLOW_TYPE: &str = "agent_writer";

const DEFAULT_SYSTEM_PROMPT: &str = "You are a novelist. Write the requested chapter in full prose, \
     staying consistent with the premise and the chapters before it. Return only the chapter text.";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChapterPlan {
    pub title: String,
    #[serde(default)]
    pub outline: String,
}

/// Resumable run state, stored as the session's `workflow_config`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WriterConfig {
    pub prompt: String,
    pub outline: Vec<ChapterPlan>,
    pub provider: String,
    pub path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system_prompt: Option<String>,
    pub document_id: i64,
    pub current_chapter: usize,
    pub total_chapters: usize,
}

impl WriterConfig {
    fn target(&self) -> AiTarget {
        AiTarget::new(self.provider.clone(), self.path.clone())
    }

    /// Chat-completion request body for one chapter.
    pub fn chapter_body(&self, index: usize) -> String {
        let chapter = &self.outline[index];
        let mut user = format!(
            "Story premise: {}\n\nWrite chapter {} of {}: {}",
            self.prompt,
            index + 1,
            self.total_chapters,
            chapter.title
        );
        if !chapter.outline.trim().is_empty() {
            user.push_str("\nOutline: ");
            user.push_str(chapter.outline.trim());
        }

        let mut body = json!({
            "messages": [
                { "role": "system", "content": self.system_prompt.as_deref().unwrap_or(DEFAULT_SYSTEM_PROMPT) },
                { "role": "user", "content": user },
            ],
            "stream": true,
        });
        if let Some(model) = &self.model {
            body["model"] = json!(model);
        }
        body.to_string()
    }
}

#[derive(Debug, Clone)]
pub struct WriterRequest {
    pub user_id: i64,
    pub project_id: i64,
    pub document_id: i64,
    pub prompt: String,
    pub outline: Vec<ChapterPlan>,
    pub target: AiTarget,
    pub model: Option<String>,
    pub system_prompt: Option<String>,
}

/// A run whose session exists but whose task has not been spawned.
#[derive(Debug)]
pub struct PreparedRun {
    session: Session,
    config: WriterConfig,
    step_id: Option<i64>,
    guard: CancelGuard,
}

impl PreparedRun {
    pub fn session_id(&self) -> i64 {
        self.session.id
    }
}

#[derive(Debug)]
pub struct WriterHandle {
    pub session_id: i64,
    /// The initial user step; `None` for resumed runs.
    pub step_id: Option<i64>,
    pub task: JoinHandle<()>,
}

enum ChapterOutcome {
    Written(i64),
    Cancelled,
}

#[derive(Clone)]
pub struct AgentWriter {
    ai: Arc<dyn AiClient>,
    documents: Arc<dyn DocumentStore>,
    ledger: Arc<SessionStepLedger>,
    cancels: CancellationRegistry,
    policy: CheckpointPolicy,
}

impl AgentWriter {
    pub fn new(
        ai: Arc<dyn AiClient>,
        documents: Arc<dyn DocumentStore>,
        ledger: Arc<SessionStepLedger>,
        cancels: CancellationRegistry,
        policy: CheckpointPolicy,
    ) -> Self {
        Self {
            ai,
            documents,
            ledger,
            cancels,
            policy,
        }
    }

    pub async fn start(&self, req: WriterRequest) -> Result<WriterHandle> {
        let run = self.prepare(req).await?;
        Ok(self.launch(run))
    }

    /// Validate the request and create the session and its first step.
    pub async fn prepare(&self, req: WriterRequest) -> Result<PreparedRun> {
        if req.prompt.trim().is_empty() {
            return Err(Error::validation("prompt is required"));
        }
        if req.outline.is_empty() {
            return Err(Error::validation("outline must contain at least one chapter"));
        }
        if req.outline.iter().any(|c| c.title.trim().is_empty()) {
            return Err(Error::validation("every chapter needs a title"));
        }
        req.target.validate().map_err(|e| Error::validation(e.to_string()))?;

        let document = self
            .documents
            .get_document(req.document_id)
            .await?
            .ok_or_else(|| Error::not_found(format!("document {} not found", req.document_id)))?;
        if document.project_id != req.project_id {
            return Err(Error::validation(format!(
                "document {} is not in project {}",
                req.document_id, req.project_id
            )));
        }

        let config = WriterConfig {
            total_chapters: req.outline.len(),
            prompt: req.prompt.clone(),
            outline: req.outline,
            provider: req.target.provider,
            path: req.target.path,
            model: req.model,
            system_prompt: req.system_prompt,
            document_id: req.document_id,
            current_chapter: 0,
        };

        let session = self
            .ledger
            .sessions()
            .create_session(
                NewSession::new(req.user_id, req.project_id, format!("AgentWriter: {}", req.prompt), "AgentWriter")
                    .with_workflow(WORKFLOW_TYPE, serde_json::to_value(&config)?),
            )
            .await?;
        let step = self.ledger.append_user(session.id, &req.prompt).await?;
        let guard = self.cancels.register(session_key(session.id));

        Ok(PreparedRun {
            session,
            config,
            step_id: Some(step.id),
            guard,
        })
    }

    pub fn launch(&self, run: PreparedRun) -> WriterHandle {
        let session_id = run.session.id;
        let step_id = run.step_id;
        let writer = self.clone();
        let task = tokio::spawn(async move { writer.run(run).await });
        WriterHandle {
            session_id,
            step_id,
            task,
        }
    }

    /// Restart a cancelled or failed run from its recorded chapter.
    pub async fn resume(&self, user_id: i64, session_id: i64) -> Result<WriterHandle> {
        let session = self
            .ledger
            .sessions()
            .get_session(session_id)
            .await?
            .ok_or_else(|| Error::not_found("session not found"))?;
        if session.user_id != user_id {
            return Err(Error::access_denied("session belongs to another user"));
        }
        if session.workflow_type.as_deref() != Some(WORKFLOW_TYPE) {
            return Err(Error::validation("session is not an AgentWriter run"));
        }
        let key = session_key(session_id);
        if self.cancels.contains(&key) {
            return Err(Error::validation("AgentWriter run is already in progress"));
        }
        match session.workflow_status {
            Some(WorkflowStatus::Cancelled | WorkflowStatus::Error | WorkflowStatus::Pending) => {}
            other => {
                return Err(Error::validation(format!(
                    "cannot resume a run in state {}",
                    other.map_or("unknown", |s| s.as_str())
                )));
            }
        }
        let config: WriterConfig = serde_json::from_value(session.workflow_config.clone().unwrap_or_default())?;
        if config.outline.is_empty()
            || config.total_chapters != config.outline.len()
            || config.current_chapter > config.total_chapters
        {
            return Err(Error::validation(format!(
                "stored run is inconsistent: {} outline entries, total_chapters {}, current_chapter {}",
                config.outline.len(),
                config.total_chapters,
                config.current_chapter
            )));
        }

        info!(session_id, from_chapter = config.current_chapter, "Resuming AgentWriter");
        let guard = self.cancels.register(key);
        Ok(self.launch(PreparedRun {
            session,
            config,
            step_id: None,
            guard,
        }))
    }

    /// Cancel a running session. The run stops at its next check.
    pub async fn cancel(&self, session_id: i64) -> Result<()> {
        if !self.cancels.cancel(&session_key(session_id)) {
            return Err(Error::not_found("session not found or already completed"));
        }
        let sessions = self.ledger.sessions();
        if let Some(mut session) = sessions.get_session(session_id).await? {
            session.workflow_status = Some(WorkflowStatus::Cancelled);
            session.updated_at = Utc::now();
            sessions.update_session(&session).await?;
        }
        info!(session_id, "AgentWriter cancellation requested");
        Ok(())
    }

    async fn run(&self, run: PreparedRun) {
        let PreparedRun {
            mut session,
            mut config,
            guard,
            ..
        } = run;
        let session_id = session.id;
        let hub = self.ledger.hub().clone();
        let total = config.total_chapters;

        self.save_state(&mut session, &config, WorkflowStatus::Running).await;
        info!(session_id, total, "AgentWriter started");

        let mut failed: Vec<usize> = Vec::new();
        for index in config.current_chapter..total {
            if guard.is_cancelled() {
                self.stop_cancelled(&mut session, &config, index).await;
                return;
            }
            config.current_chapter = index;
            self.save_state(&mut session, &config, WorkflowStatus::Running).await;

            let title = config.outline[index].title.clone();
            hub.publish(
                session_id,
                EventType::ChapterStart,
                json!({
                    "session_id": session_id,
                    "chapter_index": index,
                    "chapter_title": title,
                    "total_chapters": total,
                }),
            );

            match self.write_chapter(session_id, &config, index, guard.token()).await {
                Ok(ChapterOutcome::Written(step_id)) => {
                    hub.publish(
                        session_id,
                        EventType::ChapterCompleted,
                        json!({
                            "session_id": session_id,
                            "chapter_index": index,
                            "chapter_title": title,
                            "step_id": step_id,
                        }),
                    );
                }
                Ok(ChapterOutcome::Cancelled) => {
                    self.stop_cancelled(&mut session, &config, index).await;
                    return;
                }
                Err(e) => {
                    warn!(session_id, chapter = index, error = %e, "Chapter failed, continuing with the next one");
                    failed.push(index);
                    hub.publish(
                        session_id,
                        EventType::ChapterError,
                        json!({ "session_id": session_id, "chapter_index": index, "error": e.to_string() }),
                    );
                }
            }
        }

        config.current_chapter = total;
        self.save_state(&mut session, &config, WorkflowStatus::Completed).await;
        hub.publish(
            session_id,
            EventType::WorkflowDone,
            json!({
                "session_id": session_id,
                "total_chapters": total,
                "document_id": config.document_id,
                "failed_chapters": failed,
                "timestamp": Utc::now(),
            }),
        );
        info!(session_id, total, failed = failed.len(), "AgentWriter finished");
        drop(guard);
    }

    async fn write_chapter(
        &self,
        session_id: i64,
        config: &WriterConfig,
        index: usize,
        token: &CancellationToken,
    ) -> Result<ChapterOutcome> {
        let chapter = &config.outline[index];
        let mut step = self
            .ledger
            .begin_streaming(
                StepDraft::new(session_id, format!("Chapter {}: {}", index + 1, chapter.title), "", "chapter")
                    .with_step_type(StepType::Assistant)
                    .with_metadata(json!({ "chapter_index": index, "document_id": config.document_id })),
            )
            .await?;
        let step_id = step.id;
        let hub = self.ledger.hub().clone();

        let (end, content) = match open_stream(self.ai.as_ref(), &config.target(), &config.chapter_body(index), token).await {
            Ok(chunks) => {
                pump(&self.ledger, &mut step, chunks, token, &self.policy, None, |chunk| {
                    hub.publish(
                        session_id,
                        EventType::ChapterProgress,
                        json!({ "session_id": session_id, "step_id": step_id, "chapter_index": index, "chunk": chunk }),
                    );
                })
                .await
            }
            Err(end) => (end, String::new()),
        };

        match end {
            StreamEnd::Completed => {
                self.ledger
                    .update_streaming(&mut step, &content, StreamStatus::Completed)
                    .await?;
                hub.publish(
                    session_id,
                    EventType::StepCompleted,
                    json!({ "session_id": session_id, "step_id": step_id, "content": content }),
                );
                self.append_to_document(config.document_id, &content).await?;
                debug!(session_id, chapter = index, bytes = content.len(), "Chapter written");
                Ok(ChapterOutcome::Written(step_id))
            }
            StreamEnd::Cancelled => {
                self.ledger
                    .update_streaming(&mut step, &content, StreamStatus::Cancelled)
                    .await?;
                hub.publish(
                    session_id,
                    EventType::StepCancelled,
                    json!({ "session_id": session_id, "step_id": step_id }),
                );
                Ok(ChapterOutcome::Cancelled)
            }
            StreamEnd::Failed(e) => {
                if let Err(update) = self.ledger.update_streaming(&mut step, &content, StreamStatus::Error).await {
                    warn!(step_id, error = %update, "Failed to mark chapter step as errored");
                }
                hub.publish(
                    session_id,
                    EventType::StepError,
                    json!({ "session_id": session_id, "step_id": step_id, "error": e.to_string() }),
                );
                Err(e.into())
            }
        }
    }

    async fn append_to_document(&self, document_id: i64, text: &str) -> Result<()> {
        let doc = self
            .documents
            .get_document(document_id)
            .await?
            .ok_or_else(|| Error::not_found(format!("document {document_id} not found")))?;
        let content = if doc.content.is_empty() {
            text.to_string()
        } else {
            format!("{}\n\n{text}", doc.content)
        };
        self.documents
            .update_document(document_id, &DocumentUpdate::content(content))
            .await?;
        Ok(())
    }

    async fn stop_cancelled(&self, session: &mut Session, config: &WriterConfig, index: usize) {
        self.save_state(session, config, WorkflowStatus::Cancelled).await;
        self.ledger.hub().publish(
            session.id,
            EventType::WorkflowCancelled,
            json!({ "session_id": session.id, "chapter_index": index }),
        );
        info!(session_id = session.id, chapter = index, "AgentWriter cancelled");
    }

    async fn save_state(&self, session: &mut Session, config: &WriterConfig, status: WorkflowStatus) {
        let result: Result<()> = async {
            session.workflow_status = Some(status);
            session.workflow_config = Some(serde_json::to_value(config)?);
            session.updated_at = Utc::now();
            self.ledger.sessions().update_session(session).await?;
            Ok(())
        }
        .await;
        if let Err(e) = result {
            warn!(session_id = session.id, error = %e, "Failed to save AgentWriter state");
        }
    }
}

//! Synchronous AI workflows that write into documents.
//!
//! Every flow has the same shape: validate the request, ensure or create the
//! session, call the AI collaborator with the caller's body, append the
//! prompt/result steps, optionally write the result into a document, and
//! publish `workflow.progress` (0 → 100) followed by `workflow.done`.
//!
//! Failures abort the flow and are returned to the caller. Batch items that
//! were already written stay written.

use crate::ledger::{SessionStepLedger, StepDraft};
use crate::template::{TemplateVars, expand};
use chrono::Utc;
use inkwell_core::ai::{AiClient, AiTarget};
use inkwell_core::document::{Document, DocumentUpdate, NewDocument};
use inkwell_core::error::{Error, Result};
use inkwell_core::event::EventType;
use inkwell_core::session::{NewSession, Session, SessionStep, StepType};
use inkwell_core::store::DocumentStore;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::sync::Arc;
use tracing::{debug, info, warn};

const SUMMARY_EXCERPT_CHARS: usize = 200;

/// Who is running a workflow, and in which session.
#[derive(Debug, Clone)]
pub struct WorkflowScope {
    pub user_id: i64,
    pub project_id: i64,
    /// Existing session to continue; a new one is created when `None`.
    pub session_id: Option<i64>,
    /// Title for a newly created session.
    pub session_title: Option<String>,
}

impl WorkflowScope {
    pub fn new(user_id: i64, project_id: i64) -> Self {
        Self {
            user_id,
            project_id,
            session_id: None,
            session_title: None,
        }
    }

    pub fn in_session(mut self, session_id: Option<i64>) -> Self {
        self.session_id = session_id;
        self
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WriteMode {
    #[default]
    Replace,
    Append,
}

/// How generated text lands in a document.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WriteBack {
    #[serde(default)]
    pub mode: WriteMode,
    #[serde(default)]
    pub set_status: Option<String>,
    #[serde(default)]
    pub set_summary: bool,
}

impl WriteBack {
    fn update(&self, existing: &str, text: &str) -> DocumentUpdate {
        let content = match self.mode {
            WriteMode::Append if !existing.is_empty() => format!("{existing}\n\n{text}"),
            _ => text.to_string(),
        };
        let mut update = DocumentUpdate::content(content);
        if self.set_summary {
            update = update.with_summary(summary_excerpt(text));
        }
        update.with_status(self.set_status.clone())
    }
}

/// A free-form single-step flow (world building, polishing).
#[derive(Debug, Clone)]
pub struct StepRequest {
    pub scope: WorkflowScope,
    pub target: AiTarget,
    pub body: String,
    /// Mode of a new session and format of the appended step.
    pub mode: String,
    pub step_title: Option<String>,
}

#[derive(Debug, Clone)]
pub struct GenerateRequest {
    pub scope: WorkflowScope,
    pub target: AiTarget,
    pub body: String,
    /// Document to write into; a new one is created when `None`.
    pub document_id: Option<i64>,
    pub volume_id: Option<i64>,
    pub title: Option<String>,
    pub order_index: Option<i64>,
    pub write_back: WriteBack,
}

#[derive(Debug, Clone)]
pub struct AnalyzeRequest {
    pub scope: WorkflowScope,
    pub target: AiTarget,
    pub body: String,
    pub document_id: i64,
    pub set_status: Option<String>,
}

#[derive(Debug, Clone)]
pub struct RewriteRequest {
    pub scope: WorkflowScope,
    pub target: AiTarget,
    pub body: String,
    pub document_id: i64,
    /// Free-form label recorded with the step (e.g. `tighten`, `expand`).
    pub rewrite_mode: Option<String>,
    pub write_back: WriteBack,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BatchItem {
    pub title: String,
    #[serde(default)]
    pub outline: String,
    #[serde(default)]
    pub order_index: Option<i64>,
}

#[derive(Debug, Clone)]
pub struct BatchRequest {
    pub scope: WorkflowScope,
    pub target: AiTarget,
    /// Request body with `{{placeholders}}`, expanded per item.
    pub body_template: String,
    pub volume_id: Option<i64>,
    pub items: Vec<BatchItem>,
    pub write_back: WriteBack,
}

#[derive(Debug, Clone, Serialize)]
pub struct StepResult {
    pub session: Session,
    pub step: SessionStep,
    pub content: String,
    pub raw: Value,
}

#[derive(Debug, Clone, Serialize)]
pub struct GenerateResult {
    pub session: Session,
    pub document: Document,
    pub steps: Vec<SessionStep>,
    pub content: String,
    pub raw: Value,
}

#[derive(Debug, Clone, Serialize)]
pub struct BatchResult {
    pub session: Session,
    pub documents: Vec<Document>,
}

pub struct WorkflowOrchestrator {
    ai: Arc<dyn AiClient>,
    documents: Arc<dyn DocumentStore>,
    ledger: Arc<SessionStepLedger>,
}

impl WorkflowOrchestrator {
    pub fn new(ai: Arc<dyn AiClient>, documents: Arc<dyn DocumentStore>, ledger: Arc<SessionStepLedger>) -> Self {
        Self { ai, documents, ledger }
    }

    pub async fn run_step(&self, req: StepRequest) -> Result<StepResult> {
        validate(&req.target, &req.body)?;
        if req.mode.trim().is_empty() {
            return Err(Error::validation("mode is required"));
        }
        let session = self.open_session(&req.scope, &req.mode, &req.mode).await?;
        let mode = req.mode.as_str();

        self.progress(session.id, mode, 0, "started", None);
        self.progress(session.id, mode, 30, "calling AI", None);
        let (text, raw) = self.call_ai(&req.target, &req.body).await?;

        self.progress(session.id, mode, 70, "recording result", None);
        let step = self
            .ledger
            .append(
                StepDraft::new(session.id, req.step_title.unwrap_or_else(|| mode.to_string()), &text, mode)
                    .with_step_type(StepType::Assistant)
                    .with_metadata(json!({ "provider": req.target.provider, "path": req.target.path })),
            )
            .await?;

        self.finish(session.id, mode, None);
        Ok(StepResult {
            session,
            step,
            content: text,
            raw,
        })
    }

    /// Generate a chapter into an existing document or a new one.
    pub async fn run_chapter_generate(&self, req: GenerateRequest) -> Result<GenerateResult> {
        const MODE: &str = "chapter_generate";
        validate(&req.target, &req.body)?;
        let existing = match req.document_id {
            Some(id) => Some(self.project_document(id, req.scope.project_id).await?),
            None => None,
        };
        let session = self.open_session(&req.scope, MODE, "Chapter generation").await?;

        self.progress(session.id, MODE, 0, "started", None);
        let prompt = self.append_prompt(session.id, &req.body).await?;

        self.progress(session.id, MODE, 30, "calling AI", None);
        let (text, raw) = self.call_ai(&req.target, &req.body).await?;

        self.progress(session.id, MODE, 70, "writing document", None);
        let document = match existing {
            Some(doc) => {
                self.documents
                    .update_document(doc.id, &req.write_back.update(&doc.content, &text))
                    .await?
            }
            None => {
                let title = req.title.clone().unwrap_or_else(|| default_title("Chapter"));
                self.create_chapter(&req.scope, req.volume_id, title, req.order_index, &text, &req.write_back)
                    .await?
            }
        };

        let result = self
            .append_result(
                session.id,
                MODE,
                &document.title,
                &text,
                json!({ "document_id": document.id, "write_mode": req.write_back.mode }),
            )
            .await?;

        info!(session_id = session.id, document_id = document.id, "Chapter generated");
        self.finish(session.id, MODE, Some(document.id));
        Ok(GenerateResult {
            session,
            document,
            steps: vec![prompt, result],
            content: text,
            raw,
        })
    }

    /// Analyze a chapter; the result becomes its summary. Content is untouched.
    pub async fn run_chapter_analyze(&self, req: AnalyzeRequest) -> Result<GenerateResult> {
        const MODE: &str = "chapter_analyze";
        validate(&req.target, &req.body)?;
        let doc = self.project_document(req.document_id, req.scope.project_id).await?;
        let session = self.open_session(&req.scope, MODE, "Chapter analysis").await?;

        self.progress(session.id, MODE, 0, "started", None);
        let prompt = self.append_prompt(session.id, &req.body).await?;

        self.progress(session.id, MODE, 30, "calling AI", None);
        let (text, raw) = self.call_ai(&req.target, &req.body).await?;

        self.progress(session.id, MODE, 70, "writing summary", None);
        let update = DocumentUpdate {
            summary: Some(text.clone()),
            ..DocumentUpdate::default()
        }
        .with_status(req.set_status.clone());
        let document = self.documents.update_document(doc.id, &update).await?;

        let result = self
            .append_result(session.id, MODE, &document.title, &text, json!({ "document_id": document.id }))
            .await?;

        self.finish(session.id, MODE, Some(document.id));
        Ok(GenerateResult {
            session,
            document,
            steps: vec![prompt, result],
            content: text,
            raw,
        })
    }

    /// Rewrite a chapter, keeping the previous content in the step metadata.
    pub async fn run_chapter_rewrite(&self, req: RewriteRequest) -> Result<GenerateResult> {
        const MODE: &str = "chapter_rewrite";
        validate(&req.target, &req.body)?;
        let doc = self.project_document(req.document_id, req.scope.project_id).await?;
        let session = self.open_session(&req.scope, MODE, "Chapter rewrite").await?;

        self.progress(session.id, MODE, 0, "started", None);
        let prompt = self.append_prompt(session.id, &req.body).await?;

        self.progress(session.id, MODE, 30, "calling AI", None);
        let (text, raw) = self.call_ai(&req.target, &req.body).await?;

        self.progress(session.id, MODE, 70, "writing document", None);
        let document = self
            .documents
            .update_document(doc.id, &req.write_back.update(&doc.content, &text))
            .await?;

        let result = self
            .append_result(
                session.id,
                MODE,
                &document.title,
                &text,
                json!({
                    "document_id": document.id,
                    "rewrite_mode": req.rewrite_mode,
                    "previous_content": doc.content,
                }),
            )
            .await?;

        self.finish(session.id, MODE, Some(document.id));
        Ok(GenerateResult {
            session,
            document,
            steps: vec![prompt, result],
            content: text,
            raw,
        })
    }

    /// Generate one new document per item.
    pub async fn run_chapter_batch(&self, req: BatchRequest) -> Result<BatchResult> {
        const MODE: &str = "chapter_batch";
        if req.items.is_empty() {
            return Err(Error::validation("items are required"));
        }
        validate(&req.target, &req.body_template)?;
        let session = self.open_session(&req.scope, MODE, "Chapter batch").await?;

        let total = req.items.len();
        self.progress(session.id, MODE, 0, "started", Some((0, total)));

        let mut documents = Vec::with_capacity(total);
        for (i, item) in req.items.iter().enumerate() {
            let index = i + 1;
            let vars = TemplateVars::new()
                .set("title", item.title.clone())
                .set("outline", item.outline.clone())
                .set("order_index", item.order_index.map(|o| o.to_string()).unwrap_or_default())
                .set("index", index.to_string())
                .set("total", total.to_string());
            let body = expand(&req.body_template, &vars);

            let percent = (i * 100 / total) as u8;
            self.progress(session.id, MODE, percent, &format!("generating {}", item.title), Some((index, total)));
            self.append_prompt(session.id, &body).await?;

            let (text, _raw) = self.call_ai(&req.target, &body).await.inspect_err(|e| {
                warn!(session_id = session.id, index, total, error = %e, "Batch item failed; earlier items are kept");
            })?;

            let document = self
                .create_chapter(&req.scope, req.volume_id, item.title.clone(), item.order_index, &text, &req.write_back)
                .await?;
            self.append_result(
                session.id,
                MODE,
                &document.title,
                &text,
                json!({ "document_id": document.id, "index": index, "total": total }),
            )
            .await?;
            debug!(session_id = session.id, index, total, document_id = document.id, "Batch item written");
            documents.push(document);
        }

        info!(session_id = session.id, count = documents.len(), "Chapter batch finished");
        self.finish(session.id, MODE, None);
        Ok(BatchResult { session, documents })
    }

    async fn open_session(&self, scope: &WorkflowScope, mode: &str, label: &str) -> Result<Session> {
        let sessions = self.ledger.sessions();
        if let Some(id) = scope.session_id {
            let session = sessions
                .get_session(id)
                .await?
                .ok_or_else(|| Error::not_found("session not found"))?;
            if session.user_id != scope.user_id {
                return Err(Error::access_denied("session belongs to another user"));
            }
            return Ok(session);
        }

        let title = scope.session_title.clone().unwrap_or_else(|| default_title(label));
        let session = sessions
            .create_session(NewSession::new(scope.user_id, scope.project_id, title, mode))
            .await?;
        debug!(session_id = session.id, mode, "Workflow session created");
        Ok(session)
    }

    async fn project_document(&self, id: i64, project_id: i64) -> Result<Document> {
        let doc = self
            .documents
            .get_document(id)
            .await?
            .ok_or_else(|| Error::not_found(format!("document {id} not found")))?;
        if doc.project_id != project_id {
            return Err(Error::validation(format!("document {id} is not in project {project_id}")));
        }
        Ok(doc)
    }

    async fn create_chapter(
        &self,
        scope: &WorkflowScope,
        volume_id: Option<i64>,
        title: String,
        order_index: Option<i64>,
        text: &str,
        write_back: &WriteBack,
    ) -> Result<Document> {
        let order_index = match order_index {
            Some(order) => order,
            None => self.documents.next_order_index(scope.project_id, volume_id).await?,
        };
        let doc = NewDocument {
            project_id: scope.project_id,
            volume_id,
            title,
            content: text.to_string(),
            summary: if write_back.set_summary {
                summary_excerpt(text)
            } else {
                String::new()
            },
            status: write_back.set_status.clone().unwrap_or_else(|| "draft".into()),
            order_index,
        };
        Ok(self.documents.create_document(doc).await?)
    }

    async fn call_ai(&self, target: &AiTarget, body: &str) -> Result<(String, Value)> {
        let response = self.ai.call(target, body).await?;
        Ok((response.content(), response.raw))
    }

    async fn append_prompt(&self, session_id: i64, body: &str) -> Result<SessionStep> {
        self.ledger
            .append(StepDraft::new(session_id, "Prompt", body, "prompt").with_step_type(StepType::User))
            .await
    }

    async fn append_result(
        &self,
        session_id: i64,
        mode: &str,
        title: &str,
        text: &str,
        metadata: Value,
    ) -> Result<SessionStep> {
        self.ledger
            .append(
                StepDraft::new(session_id, title, text, mode)
                    .with_step_type(StepType::Assistant)
                    .with_metadata(metadata),
            )
            .await
    }

    fn progress(&self, session_id: i64, mode: &str, progress: u8, message: &str, position: Option<(usize, usize)>) {
        let mut data = json!({
            "session_id": session_id,
            "mode": mode,
            "progress": progress,
            "message": message,
        });
        if let Some((index, total)) = position {
            data["index"] = json!(index);
            data["total"] = json!(total);
        }
        self.ledger.hub().publish(session_id, EventType::WorkflowProgress, data);
    }

    fn finish(&self, session_id: i64, mode: &str, document_id: Option<i64>) {
        self.progress(session_id, mode, 100, "done", None);
        let mut data = json!({
            "session_id": session_id,
            "mode": mode,
            "timestamp": Utc::now(),
        });
        if let Some(id) = document_id {
            data["document_id"] = json!(id);
        }
        self.ledger.hub().publish(session_id, EventType::WorkflowDone, data);
    }
}

fn validate(target: &AiTarget, body: &str) -> Result<()> {
    target.validate().map_err(|e| Error::validation(e.to_string()))?;
    if body.trim().is_empty() {
        return Err(Error::validation("body is required"));
    }
    Ok(())
}

fn default_title(label: &str) -> String {
    format!("{label} {}", Utc::now().format("%Y-%m-%d %H:%M"))
}

/// The first few sentences' worth of `text`, for a document summary.
pub fn summary_excerpt(text: &str) -> String {
    let trimmed = text.trim();
    if trimmed.chars().count() <= SUMMARY_EXCERPT_CHARS {
        return trimmed.to_string();
    }
    let cut: String = trimmed.chars().take(SUMMARY_EXCERPT_CHARS).collect();
    format!("{}…", cut.trim_end())
}

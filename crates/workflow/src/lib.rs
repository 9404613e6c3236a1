//! Workflow layer: the job engine, the session step ledger, and the
//! synchronous chapter workflows.
//!
//! - [`JobEngine`] runs plugin invocations on a background worker and tracks
//!   each one through its lifecycle.
//! - [`SessionStepLedger`] appends to a session's transcript with strictly
//!   increasing order indices.
//! - [`WorkflowOrchestrator`] runs generate/analyze/rewrite/batch flows that
//!   call the AI collaborator and write the result into documents.

pub mod jobs;
pub mod ledger;
pub mod orchestrator;
pub mod template;

pub use jobs::{EngineSettings, JobEngine, SubmitJob};
pub use ledger::{SessionStepLedger, StepDraft};
pub use orchestrator::{
    AnalyzeRequest, BatchItem, BatchRequest, BatchResult, GenerateRequest, GenerateResult, RewriteRequest,
    StepRequest, StepResult, WorkflowOrchestrator, WorkflowScope, WriteBack, WriteMode,
};
pub use template::{TemplateVars, expand};

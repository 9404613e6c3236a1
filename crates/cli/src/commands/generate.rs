//! `inkwell generate`: one-shot chapter generation into a document.

use crate::runtime::{CliResult, Runtime, load_config, read_body};
use inkwell_core::AiTarget;
use inkwell_workflow::{GenerateRequest, WorkflowScope, WriteBack};
use std::path::Path;

pub struct GenerateArgs {
    pub user: i64,
    pub project: i64,
    pub title: Option<String>,
    pub document: Option<i64>,
    pub session: Option<i64>,
    pub provider: String,
    pub path: String,
    pub body: String,
}

pub async fn run(config_path: Option<&Path>, args: GenerateArgs) -> CliResult<()> {
    let body = read_body(&args.body)?;
    let runtime = Runtime::bootstrap(load_config(config_path)?).await?;

    let result = runtime
        .orchestrator()
        .run_chapter_generate(GenerateRequest {
            scope: WorkflowScope::new(args.user, args.project).in_session(args.session),
            target: AiTarget::new(args.provider, args.path),
            body,
            document_id: args.document,
            volume_id: None,
            title: args.title,
            order_index: None,
            write_back: WriteBack::default(),
        })
        .await?;

    tracing::info!(
        session_id = result.session.id,
        document_id = result.document.id,
        chars = result.content.len(),
        "Chapter generated"
    );
    println!(
        "{}",
        serde_json::to_string_pretty(&serde_json::json!({
            "session_id": result.session.id,
            "document": result.document,
            "content": result.content,
        }))?
    );
    Ok(())
}

//! `inkwell write`: run (or resume) the multi-chapter AgentWriter.
//!
//! Events are printed as JSON lines until the run finishes. Ctrl-C cancels
//! the run; it can be picked up again later with `--resume <session>`.

use crate::runtime::{CliResult, Runtime, load_config, print_events};
use inkwell_agent::{ChapterPlan, WriterRequest};
use inkwell_core::{AiTarget, EventType, session_key};
use std::path::{Path, PathBuf};

pub struct WriteArgs {
    pub user: i64,
    pub project: i64,
    pub document: i64,
    pub prompt: String,
    pub outline: PathBuf,
    pub provider: String,
    pub path: String,
    pub model: Option<String>,
    pub resume: Option<i64>,
}

pub async fn run(config_path: Option<&Path>, args: WriteArgs) -> CliResult<()> {
    let runtime = Runtime::bootstrap(load_config(config_path)?).await?;
    let writer = runtime.writer();

    let (subscription, handle) = match args.resume {
        Some(session_id) => {
            let subscription = runtime.hub.subscribe(session_key(session_id));
            (subscription, writer.resume(args.user, session_id).await?)
        }
        None => {
            let outline = read_outline(&args.outline)?;
            let prepared = writer
                .prepare(WriterRequest {
                    user_id: args.user,
                    project_id: args.project,
                    document_id: args.document,
                    prompt: args.prompt,
                    outline,
                    target: AiTarget::new(args.provider, args.path),
                    model: args.model,
                    system_prompt: None,
                })
                .await?;
            let subscription = runtime.hub.subscribe(session_key(prepared.session_id()));
            (subscription, writer.launch(prepared))
        }
    };
    let session_id = handle.session_id;
    eprintln!("AgentWriter session {session_id}");

    let finished = |event: &inkwell_core::Event| {
        matches!(event.event_type, EventType::WorkflowDone | EventType::WorkflowCancelled)
    };
    tokio::select! {
        _ = print_events(subscription, finished) => {}
        _ = tokio::signal::ctrl_c() => {
            writer.cancel(session_id).await?;
            eprintln!("Cancelling; resume with --resume {session_id}");
        }
    }

    handle.task.await?;
    Ok(())
}

fn read_outline(path: &Path) -> CliResult<Vec<ChapterPlan>> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| format!("Failed to read outline {}: {e}", path.display()))?;
    let outline: Vec<ChapterPlan> =
        serde_json::from_str(&raw).map_err(|e| format!("Invalid outline {}: {e}", path.display()))?;
    Ok(outline)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn outline_entries_default_missing_text() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("outline.json");
        std::fs::write(&path, r#"[{"title": "Arrival", "outline": "She lands."}, {"title": "Storm"}]"#).unwrap();

        let outline = read_outline(&path).unwrap();
        assert_eq!(outline.len(), 2);
        assert_eq!(outline[1].title, "Storm");
        assert!(outline[1].outline.is_empty());
    }

    #[test]
    fn malformed_outline_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("outline.json");
        std::fs::write(&path, "not json").unwrap();
        assert!(read_outline(&path).is_err());
    }
}

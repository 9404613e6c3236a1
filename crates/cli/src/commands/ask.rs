//! `inkwell ask`: run the function-calling loop over the configured tools.

use crate::runtime::{CliResult, Runtime, load_config};
use inkwell_agent::LoopRequest;
use inkwell_core::{CancellationToken, session_key};
use serde_json::json;
use std::path::Path;

pub struct AskArgs {
    pub user: i64,
    pub prompt: String,
    pub session: Option<i64>,
    pub project: i64,
    pub provider: String,
    pub max_turns: Option<usize>,
    pub auth: Option<String>,
}

pub async fn run(config_path: Option<&Path>, args: AskArgs) -> CliResult<()> {
    let runtime = Runtime::bootstrap(load_config(config_path)?).await?;
    if runtime.config.tools.is_empty() {
        tracing::warn!("No tools configured; the model can only answer directly");
    }
    let fc_loop = runtime.function_calling(&args.provider)?;
    let session_id = runtime
        .ensure_session(args.session, args.user, args.project, "Ask", "function_calling")
        .await?;

    // Tool jobs are reported on the session; echo them while the loop runs.
    let mut subscription = runtime.hub.subscribe(session_key(session_id));
    let printer = tokio::spawn(async move {
        while let Some(event) = subscription.recv().await {
            if let Ok(line) = serde_json::to_string(&event) {
                eprintln!("{line}");
            }
        }
    });

    let cancel = CancellationToken::new();
    let on_interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            on_interrupt.cancel();
        }
    });

    let outcome = fc_loop
        .run(
            LoopRequest {
                user_id: args.user,
                session_id,
                prompt: args.prompt,
                max_turns: args.max_turns,
                auth_token: args.auth,
            },
            &cancel,
        )
        .await;
    printer.abort();

    let outcome = outcome?;
    println!(
        "{}",
        serde_json::to_string_pretty(&json!({
            "session_id": outcome.session_id,
            "turns": outcome.turns,
            "finish_reason": outcome.finish_reason,
            "answer": outcome.final_answer,
        }))?
    );
    Ok(())
}

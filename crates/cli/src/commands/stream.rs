//! `inkwell stream`: stream one completion into a session step.

use crate::runtime::{CliResult, Runtime, load_config, print_events, read_body};
use inkwell_agent::StreamRequest;
use inkwell_core::{AiTarget, Event, EventType, session_key};
use std::path::Path;
use std::time::Duration;

pub struct StreamArgs {
    pub user: i64,
    pub session: Option<i64>,
    pub project: i64,
    pub provider: String,
    pub path: String,
    pub body: String,
    pub timeout: Option<u64>,
}

pub async fn run(config_path: Option<&Path>, args: StreamArgs) -> CliResult<()> {
    let body = read_body(&args.body)?;
    let runtime = Runtime::bootstrap(load_config(config_path)?).await?;
    let executor = runtime.streaming();

    let prepared = executor
        .prepare(StreamRequest {
            user_id: args.user,
            project_id: args.project,
            session_id: args.session,
            title: None,
            target: AiTarget::new(args.provider, args.path),
            body,
            timeout: args.timeout.map(Duration::from_secs),
        })
        .await?;
    let subscription = runtime.hub.subscribe(session_key(prepared.session_id()));
    let handle = executor.launch(prepared);
    let step_id = handle.step_id;

    let finished = move |event: &Event| {
        matches!(
            event.event_type,
            EventType::StepCompleted | EventType::StepCancelled | EventType::StepError
        ) && event.data["step_id"] == step_id
    };
    tokio::select! {
        _ = print_events(subscription, finished) => {}
        _ = tokio::signal::ctrl_c() => {
            executor.cancel(step_id)?;
        }
    }
    handle.task.await?;

    let step = executor.status(step_id).await?;
    eprintln!(
        "session {} step {} finished as {}",
        handle.session_id,
        step.id,
        step.stream_status.map_or("unknown", |s| s.as_str())
    );
    Ok(())
}

//! `inkwell job`: submit a plugin job and follow its events.

use crate::runtime::{CliResult, Runtime, is_job_terminal, load_config, print_events};
use inkwell_core::session_key;
use inkwell_workflow::SubmitJob;
use std::path::Path;

pub struct JobArgs {
    pub user: i64,
    pub session: Option<i64>,
    pub project: i64,
    pub plugin: i64,
    pub method: String,
    pub payload: String,
    pub auth: Option<String>,
}

pub async fn run(config_path: Option<&Path>, args: JobArgs) -> CliResult<()> {
    let payload: serde_json::Value =
        serde_json::from_str(&args.payload).map_err(|e| format!("--payload is not valid JSON: {e}"))?;

    let runtime = Runtime::bootstrap(load_config(config_path)?).await?;
    let session_id = runtime
        .ensure_session(args.session, args.user, args.project, "Plugin job", "job")
        .await?;

    let subscription = runtime.hub.subscribe(session_key(session_id));
    let job = runtime
        .engine
        .submit(SubmitJob {
            user_id: args.user,
            session_id,
            project_id: None,
            plugin_id: args.plugin,
            method: args.method,
            payload,
            auth_token: args.auth,
        })
        .await?;

    print_events(subscription, |event| {
        is_job_terminal(event) && event.data["job_uuid"] == job.job_uuid.as_str()
    })
    .await;

    let finished = runtime.engine.get_for_user(args.user, &job.job_uuid).await?;
    println!("{}", serde_json::to_string_pretty(&finished.to_public())?);
    Ok(())
}

//! Function-calling loop: model turns interleaved with tool calls run as jobs.
//!
//! Each turn asks the model for a reply given the running prompt and the
//! bound tools. A reply without tool calls ends the loop. Otherwise every
//! tool call is submitted to the [`JobEngine`] in parallel, the results are
//! recorded in the session, and a prompt summarizing them drives the next
//! turn. A turn in which every tool call fails ends the loop with an error.

use inkwell_config::ToolConfig;
use inkwell_core::ai::{ToolCall, ToolCallingModel, ToolDefinition};
use inkwell_core::error::{Error, Result, UpstreamError};
use inkwell_core::job::JobStatus;
use inkwell_core::CancellationToken;
use inkwell_workflow::{JobEngine, SessionStepLedger, SubmitJob};
use serde::Serialize;
use serde_json::{Map, Value, json};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

pub const DEFAULT_MAX_TURNS: usize = 5;

/// A tool the model may call, and the plugin method that serves it.
#[derive(Debug, Clone)]
pub struct ToolBinding {
    pub definition: ToolDefinition,
    pub plugin_id: i64,
    pub method: String,
}

impl ToolBinding {
    pub fn from_config(config: &ToolConfig) -> Self {
        Self {
            definition: ToolDefinition {
                name: config.name.clone(),
                description: config.description.clone(),
                parameters: config.parameters.clone(),
            },
            plugin_id: config.plugin_id,
            method: config.method.clone().unwrap_or_else(|| config.name.clone()),
        }
    }
}

#[derive(Debug, Clone)]
pub struct LoopRequest {
    pub user_id: i64,
    pub session_id: i64,
    pub prompt: String,
    /// Overrides the loop's default turn limit.
    pub max_turns: Option<usize>,
    /// Forwarded to every plugin invocation.
    pub auth_token: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FinishReason {
    NoToolCalls,
    MaxTurns,
}

#[derive(Debug, Clone, Serialize)]
pub struct LoopOutcome {
    pub session_id: i64,
    pub turns: usize,
    pub finish_reason: FinishReason,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub final_answer: Option<String>,
}

type ToolOutcome = std::result::Result<Value, String>;

pub struct FunctionCallingLoop {
    model: Arc<dyn ToolCallingModel>,
    engine: JobEngine,
    ledger: Arc<SessionStepLedger>,
    tools: Vec<ToolBinding>,
    max_turns: usize,
    job_timeout: Duration,
}

impl FunctionCallingLoop {
    pub fn new(
        model: Arc<dyn ToolCallingModel>,
        engine: JobEngine,
        ledger: Arc<SessionStepLedger>,
        tools: Vec<ToolBinding>,
    ) -> Self {
        Self {
            model,
            engine,
            ledger,
            tools,
            max_turns: DEFAULT_MAX_TURNS,
            job_timeout: Duration::from_secs(300),
        }
    }

    pub fn with_max_turns(mut self, max_turns: usize) -> Self {
        self.max_turns = max_turns.max(1);
        self
    }

    pub fn with_job_timeout(mut self, timeout: Duration) -> Self {
        self.job_timeout = timeout;
        self
    }

    pub async fn run(&self, req: LoopRequest, cancel: &CancellationToken) -> Result<LoopOutcome> {
        if req.prompt.trim().is_empty() {
            return Err(Error::validation("prompt is required"));
        }
        let session = self
            .ledger
            .sessions()
            .get_session(req.session_id)
            .await?
            .ok_or_else(|| Error::not_found("session not found"))?;
        if session.user_id != req.user_id {
            return Err(Error::access_denied("session belongs to another user"));
        }

        self.ledger.append_user(req.session_id, &req.prompt).await?;

        let definitions: Vec<ToolDefinition> = self.tools.iter().map(|t| t.definition.clone()).collect();
        let max_turns = req.max_turns.unwrap_or(self.max_turns).max(1);
        let mut prompt = req.prompt.clone();
        let mut last_answer: Option<String> = None;

        for turn in 1..=max_turns {
            if cancel.is_cancelled() {
                return Err(Error::Cancelled(format!("function calling cancelled before turn {turn}")));
            }
            debug!(session_id = req.session_id, turn, "Function calling turn");

            let reply = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    return Err(Error::Cancelled(format!("function calling cancelled during turn {turn}")));
                }
                reply = self.model.next_turn(&prompt, &definitions) => reply?,
            };

            if !reply.content.trim().is_empty() {
                self.ledger.append_assistant(req.session_id, &reply.content).await?;
                last_answer = Some(reply.content.clone());
            }

            if reply.tool_calls.is_empty() {
                info!(session_id = req.session_id, turns = turn, "Function calling finished");
                return Ok(LoopOutcome {
                    session_id: req.session_id,
                    turns: turn,
                    finish_reason: FinishReason::NoToolCalls,
                    final_answer: last_answer,
                });
            }

            let results = self.execute_tool_calls(&req, &reply.tool_calls).await;
            let failed = results.iter().filter(|r| r.is_err()).count();
            if failed == results.len() {
                warn!(session_id = req.session_id, turn, failed, "Every tool call failed");
                return Err(UpstreamError::AllToolCallsFailed(failed).into());
            }
            prompt = tool_results_prompt(&reply.tool_calls, &results);
        }

        info!(session_id = req.session_id, max_turns, "Function calling hit the turn limit");
        Ok(LoopOutcome {
            session_id: req.session_id,
            turns: max_turns,
            finish_reason: FinishReason::MaxTurns,
            final_answer: last_answer,
        })
    }

    /// Run every call on its own task. Results keep the order of `calls`.
    async fn execute_tool_calls(&self, req: &LoopRequest, calls: &[ToolCall]) -> Vec<ToolOutcome> {
        let mut results: Vec<ToolOutcome> = vec![Err("tool call did not run".into()); calls.len()];
        let mut tasks = JoinSet::new();

        for (index, call) in calls.iter().cloned().enumerate() {
            let binding = self.tools.iter().find(|t| t.definition.name == call.name).cloned();
            let runner = ToolRunner {
                engine: self.engine.clone(),
                ledger: self.ledger.clone(),
                user_id: req.user_id,
                session_id: req.session_id,
                auth_token: req.auth_token.clone(),
                timeout: self.job_timeout,
            };
            tasks.spawn(async move { (index, runner.run(call, binding).await) });
        }

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((index, outcome)) => results[index] = outcome,
                Err(e) => warn!(error = %e, "Tool call task failed"),
            }
        }
        results
    }
}

struct ToolRunner {
    engine: JobEngine,
    ledger: Arc<SessionStepLedger>,
    user_id: i64,
    session_id: i64,
    auth_token: Option<String>,
    timeout: Duration,
}

impl ToolRunner {
    async fn run(self, call: ToolCall, binding: Option<ToolBinding>) -> ToolOutcome {
        if let Err(e) = self.ledger.append_tool_call(self.session_id, &call).await {
            warn!(tool = %call.name, error = %e, "Failed to record tool call");
        }

        let mut extra = Map::new();
        let outcome = match binding {
            None => Err(format!("unknown tool: {}", call.name)),
            Some(binding) => {
                match self.invoke(&call, &binding).await {
                    Ok((job_uuid, outcome)) => {
                        extra.insert("job_uuid".into(), json!(job_uuid));
                        outcome
                    }
                    Err(message) => Err(message),
                }
            }
        };

        extra.insert("success".into(), json!(outcome.is_ok()));
        let recorded = match &outcome {
            Ok(value) => value.clone(),
            Err(message) => json!({ "error": message }),
        };
        if let Err(e) = self
            .ledger
            .append_tool_result(self.session_id, &call.id, &recorded, extra)
            .await
        {
            warn!(tool = %call.name, error = %e, "Failed to record tool result");
        }

        match &outcome {
            Ok(_) => debug!(tool = %call.name, call_id = %call.id, "Tool call succeeded"),
            Err(message) => warn!(tool = %call.name, call_id = %call.id, error = %message, "Tool call failed"),
        }
        outcome
    }

    /// Submit the job and wait for it. Returns the job UUID with the outcome.
    async fn invoke(&self, call: &ToolCall, binding: &ToolBinding) -> std::result::Result<(String, ToolOutcome), String> {
        let job = self
            .engine
            .submit(SubmitJob {
                user_id: self.user_id,
                session_id: self.session_id,
                project_id: None,
                plugin_id: binding.plugin_id,
                method: binding.method.clone(),
                payload: call.arguments.clone(),
                auth_token: self.auth_token.clone(),
            })
            .await
            .map_err(|e| e.to_string())?;

        let finished = match self.engine.wait_for_terminal(&job.job_uuid, self.timeout).await {
            Ok(finished) => finished,
            Err(e) => {
                // Free the worker for the jobs queued behind this one.
                if let Err(cancel) = self.engine.cancel(self.user_id, &job.job_uuid).await {
                    warn!(job_uuid = %job.job_uuid, error = %cancel, "Failed to cancel unfinished tool job");
                }
                return Ok((job.job_uuid, Err(e.to_string())));
            }
        };

        let outcome = match finished.status {
            JobStatus::Succeeded => Ok(finished.result.unwrap_or(Value::Null)),
            JobStatus::Failed => Err(finished
                .error_message
                .unwrap_or_else(|| "tool job failed".into())),
            JobStatus::Canceled => Err("tool job was canceled".into()),
            other => Err(format!("tool job ended in unexpected state {other}")),
        };
        Ok((job.job_uuid, outcome))
    }
}

/// The prompt for the next turn, one line per tool call in request order.
fn tool_results_prompt(calls: &[ToolCall], results: &[ToolOutcome]) -> String {
    let mut prompt = String::from("Tool results:");
    for (call, result) in calls.iter().zip(results) {
        match result {
            Ok(value) => prompt.push_str(&format!("\n- tool call {} succeeded: {value}", call.id)),
            Err(message) => prompt.push_str(&format!("\n- tool call {} failed: {message}", call.id)),
        }
    }
    prompt
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use inkwell_core::ai::AssistantTurn;
    use inkwell_core::event::EventHub;
    use inkwell_core::plugin::PluginInvoker;
    use inkwell_core::session::{NewSession, StepType};
    use inkwell_core::store::SessionStore;
    use inkwell_storage::InMemoryStore;
    use inkwell_workflow::EngineSettings;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    /// Replies with scripted turns and records every prompt it sees.
    struct ScriptedModel {
        turns: Mutex<VecDeque<AssistantTurn>>,
        prompts: Mutex<Vec<String>>,
    }

    impl ScriptedModel {
        fn new(turns: Vec<AssistantTurn>) -> Self {
            Self {
                turns: Mutex::new(turns.into()),
                prompts: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl ToolCallingModel for ScriptedModel {
        async fn next_turn(
            &self,
            prompt: &str,
            _tools: &[ToolDefinition],
        ) -> std::result::Result<AssistantTurn, UpstreamError> {
            self.prompts.lock().unwrap().push(prompt.to_string());
            Ok(self.turns.lock().unwrap().pop_front().unwrap_or_default())
        }
    }

    /// `lookup` echoes its arguments, `stall` waits until cancelled, and
    /// anything else fails.
    struct ToolPlugin;

    #[async_trait]
    impl PluginInvoker for ToolPlugin {
        async fn invoke(
            &self,
            cancel: CancellationToken,
            _plugin_id: i64,
            method: &str,
            payload: Value,
            _auth: Option<&str>,
        ) -> std::result::Result<Value, UpstreamError> {
            match method {
                "lookup" => Ok(json!({ "found": payload })),
                "stall" => {
                    cancel.cancelled().await;
                    Err(UpstreamError::Other("stall cancelled".into()))
                }
                _ => Err(UpstreamError::Other(format!("{method} is broken"))),
            }
        }
    }

    fn call(id: &str, name: &str) -> ToolCall {
        ToolCall {
            id: id.into(),
            name: name.into(),
            arguments: json!({ "name": "Ada" }),
        }
    }

    fn binding(name: &str) -> ToolBinding {
        ToolBinding::from_config(&ToolConfig {
            name: name.into(),
            description: format!("{name} tool"),
            plugin_id: 1,
            method: None,
            parameters: json!({ "type": "object" }),
        })
    }

    struct Fixture {
        store: Arc<InMemoryStore>,
        ledger: Arc<SessionStepLedger>,
        engine: JobEngine,
        session_id: i64,
    }

    async fn fixture() -> Fixture {
        let store = Arc::new(InMemoryStore::new());
        let hub = Arc::new(EventHub::new(256));
        let session = store
            .create_session(NewSession::new(1, 1, "ask", "function_calling"))
            .await
            .unwrap();
        let ledger = Arc::new(SessionStepLedger::new(store.clone(), hub));
        let (engine, _worker) = JobEngine::start(
            store.clone(),
            Arc::new(ToolPlugin),
            ledger.clone(),
            EngineSettings {
                queue_capacity: 16,
                sweep_interval: None,
            },
        );
        Fixture {
            store,
            ledger,
            engine,
            session_id: session.id,
        }
    }

    fn request(session_id: i64) -> LoopRequest {
        LoopRequest {
            user_id: 1,
            session_id,
            prompt: "How old is Ada?".into(),
            max_turns: None,
            auth_token: None,
        }
    }

    fn fc_loop(f: &Fixture, model: Arc<ScriptedModel>) -> FunctionCallingLoop {
        FunctionCallingLoop::new(
            model,
            f.engine.clone(),
            f.ledger.clone(),
            vec![binding("lookup"), binding("explode")],
        )
        .with_job_timeout(Duration::from_secs(5))
    }

    #[tokio::test]
    async fn partial_failure_feeds_both_outcomes_into_next_turn() {
        let f = fixture().await;
        let model = Arc::new(ScriptedModel::new(vec![
            AssistantTurn {
                content: String::new(),
                tool_calls: vec![call("c1", "lookup"), call("c2", "explode")],
            },
            AssistantTurn {
                content: "Ada is 36.".into(),
                tool_calls: vec![],
            },
        ]));

        let outcome = fc_loop(&f, model.clone())
            .run(request(f.session_id), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(outcome.turns, 2);
        assert_eq!(outcome.finish_reason, FinishReason::NoToolCalls);
        assert_eq!(outcome.final_answer.as_deref(), Some("Ada is 36."));

        let prompts = model.prompts.lock().unwrap().clone();
        assert_eq!(prompts[0], "How old is Ada?");
        let lines: Vec<&str> = prompts[1].lines().collect();
        assert_eq!(lines[0], "Tool results:");
        assert!(lines[1].starts_with("- tool call c1 succeeded: "));
        assert!(lines[1].contains("Ada"));
        assert!(lines[2].starts_with("- tool call c2 failed: "));
        assert!(lines[2].contains("explode is broken"));

        let steps = f.store.list_steps(f.session_id).await.unwrap();
        let kinds: Vec<Option<StepType>> = steps.iter().map(|s| s.step_type).collect();
        assert_eq!(kinds.first(), Some(&Some(StepType::User)));
        assert_eq!(kinds.last(), Some(&Some(StepType::Assistant)));
        assert_eq!(kinds.iter().filter(|k| **k == Some(StepType::ToolCall)).count(), 2);
        assert_eq!(kinds.iter().filter(|k| **k == Some(StepType::ToolResult)).count(), 2);
        assert_eq!(f.engine.list_for_session(f.session_id).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn all_failed_tool_calls_end_the_loop() {
        let f = fixture().await;
        let model = Arc::new(ScriptedModel::new(vec![AssistantTurn {
            content: String::new(),
            tool_calls: vec![call("c1", "explode"), call("c2", "no_such_tool")],
        }]));

        let err = fc_loop(&f, model.clone())
            .run(request(f.session_id), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Upstream(UpstreamError::AllToolCallsFailed(2))));
        assert_eq!(model.prompts.lock().unwrap().len(), 1);
        // The unknown tool never became a job.
        assert_eq!(f.engine.list_for_session(f.session_id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn timed_out_tool_job_is_cancelled_and_frees_the_worker() {
        let f = fixture().await;
        let model = Arc::new(ScriptedModel::new(vec![AssistantTurn {
            content: String::new(),
            tool_calls: vec![call("c1", "stall")],
        }]));
        let fc = FunctionCallingLoop::new(model, f.engine.clone(), f.ledger.clone(), vec![binding("stall")])
            .with_job_timeout(Duration::from_millis(50));

        let err = fc.run(request(f.session_id), &CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err, Error::Upstream(UpstreamError::AllToolCallsFailed(1))));

        let jobs = f.engine.list_for_session(f.session_id).await.unwrap();
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].status, JobStatus::Canceled);

        let next = f
            .engine
            .submit(SubmitJob {
                user_id: 1,
                session_id: f.session_id,
                project_id: None,
                plugin_id: 1,
                method: "lookup".into(),
                payload: json!({}),
                auth_token: None,
            })
            .await
            .unwrap();
        let done = f
            .engine
            .wait_for_terminal(&next.job_uuid, Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(done.status, JobStatus::Succeeded);
    }

    #[tokio::test]
    async fn turn_limit_ends_without_error() {
        let f = fixture().await;
        let looping = AssistantTurn {
            content: "Checking again.".into(),
            tool_calls: vec![call("c1", "lookup")],
        };
        let model = Arc::new(ScriptedModel::new(vec![looping.clone(), looping.clone(), looping]));

        let mut req = request(f.session_id);
        req.max_turns = Some(2);
        let outcome = fc_loop(&f, model.clone())
            .run(req, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(outcome.turns, 2);
        assert_eq!(outcome.finish_reason, FinishReason::MaxTurns);
        assert_eq!(model.prompts.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn cancelled_token_stops_before_the_model_is_called() {
        let f = fixture().await;
        let model = Arc::new(ScriptedModel::new(vec![]));
        let token = CancellationToken::new();
        token.cancel();

        let err = fc_loop(&f, model.clone()).run(request(f.session_id), &token).await.unwrap_err();
        assert_eq!(err.kind(), inkwell_core::ErrorKind::Cancelled);
        assert!(model.prompts.lock().unwrap().is_empty());
    }

    #[test]
    fn result_prompt_lists_calls_in_request_order() {
        let calls = vec![call("a", "lookup"), call("b", "lookup")];
        let results = vec![Err("timeout".to_string()), Ok(json!({ "age": 36 }))];
        assert_eq!(
            tool_results_prompt(&calls, &results),
            "Tool results:\n- tool call a failed: timeout\n- tool call b succeeded: {\"age\":36}"
        );
    }
}

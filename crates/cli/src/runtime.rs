//! Process wiring: one hub, one store, one job engine per invocation.

use inkwell_agent::{AgentWriter, CheckpointPolicy, FunctionCallingLoop, StreamingExecutor, ToolBinding};
use inkwell_config::AppConfig;
use inkwell_core::event::{Event, EventHub, EventType, Subscription};
use inkwell_core::store::{DocumentStore, JobStore, SessionStore};
use inkwell_core::{CancellationRegistry, NewSession};
use inkwell_providers::{HttpAiClient, HttpPluginInvoker, OpenAiToolModel};
use inkwell_storage::{InMemoryStore, SqliteStore};
use inkwell_workflow::{EngineSettings, JobEngine, SessionStepLedger, WorkflowOrchestrator};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info};

pub type CliResult<T> = Result<T, Box<dyn std::error::Error>>;

pub fn load_config(path: Option<&Path>) -> CliResult<AppConfig> {
    let config = match path {
        Some(path) => AppConfig::load_with_env(path),
        None => AppConfig::load(),
    }
    .map_err(|e| format!("Failed to load config: {e}"))?;
    Ok(config)
}

pub struct Runtime {
    pub config: AppConfig,
    pub hub: Arc<EventHub>,
    pub sessions: Arc<dyn SessionStore>,
    pub documents: Arc<dyn DocumentStore>,
    pub ledger: Arc<SessionStepLedger>,
    pub cancels: CancellationRegistry,
    pub ai: Arc<HttpAiClient>,
    pub engine: JobEngine,
    _worker: JoinHandle<()>,
}

impl Runtime {
    pub async fn bootstrap(config: AppConfig) -> CliResult<Self> {
        let (jobs, sessions, documents) = open_stores(&config).await?;

        let hub = Arc::new(EventHub::new(config.hub.client_buffer));
        let ledger = Arc::new(SessionStepLedger::new(sessions.clone(), hub.clone()));
        let plugins = Arc::new(HttpPluginInvoker::new(config.plugins.clone()));
        let (engine, worker) = JobEngine::start(
            jobs,
            plugins,
            ledger.clone(),
            EngineSettings::from_config(&config.engine),
        );
        let ai = Arc::new(HttpAiClient::from_config(&config.providers));

        info!(
            storage = %config.storage.backend,
            providers = config.providers.len(),
            plugins = config.plugins.len(),
            tools = config.tools.len(),
            "Runtime ready"
        );

        Ok(Self {
            config,
            hub,
            sessions,
            documents,
            ledger,
            cancels: CancellationRegistry::new(),
            ai,
            engine,
            _worker: worker,
        })
    }

    pub fn orchestrator(&self) -> WorkflowOrchestrator {
        WorkflowOrchestrator::new(self.ai.clone(), self.documents.clone(), self.ledger.clone())
    }

    pub fn streaming(&self) -> StreamingExecutor {
        StreamingExecutor::new(
            self.ai.clone(),
            self.ledger.clone(),
            self.cancels.clone(),
            CheckpointPolicy::from_config(&self.config.streaming),
        )
        .with_default_timeout(self.config.streaming.timeout_secs.map(Duration::from_secs))
    }

    pub fn writer(&self) -> AgentWriter {
        AgentWriter::new(
            self.ai.clone(),
            self.documents.clone(),
            self.ledger.clone(),
            self.cancels.clone(),
            CheckpointPolicy::from_config(&self.config.streaming),
        )
    }

    pub fn function_calling(&self, provider: &str) -> CliResult<FunctionCallingLoop> {
        let provider_config = self
            .config
            .providers
            .get(provider)
            .ok_or_else(|| format!("provider '{provider}' is not configured"))?;
        let model = Arc::new(OpenAiToolModel::from_config(provider_config));
        let tools = self.config.tools.iter().map(ToolBinding::from_config).collect();
        Ok(FunctionCallingLoop::new(model, self.engine.clone(), self.ledger.clone(), tools)
            .with_max_turns(self.config.function_calling.max_turns)
            .with_job_timeout(Duration::from_secs(self.config.engine.tool_job_timeout_secs)))
    }

    /// Use `session` if given, otherwise create one for this command.
    pub async fn ensure_session(
        &self,
        session: Option<i64>,
        user_id: i64,
        project_id: i64,
        title: &str,
        mode: &str,
    ) -> CliResult<i64> {
        if let Some(id) = session {
            return Ok(id);
        }
        let new_session = NewSession::new(user_id, project_id, title, mode).with_workflow(mode, serde_json::json!({}));
        let created = self.sessions.create_session(new_session).await?;
        debug!(session_id = created.id, mode, "Session created");
        Ok(created.id)
    }
}

type Stores = (Arc<dyn JobStore>, Arc<dyn SessionStore>, Arc<dyn DocumentStore>);

async fn open_stores(config: &AppConfig) -> CliResult<Stores> {
    match config.storage.backend.as_str() {
        "memory" => Ok(split(Arc::new(InMemoryStore::new()))),
        _ => {
            if let Some(parent) = Path::new(&config.storage.path).parent() {
                std::fs::create_dir_all(parent)?;
            }
            let store = SqliteStore::new(&config.storage.path).await?;
            Ok(split(Arc::new(store)))
        }
    }
}

fn split<S>(store: Arc<S>) -> Stores
where
    S: JobStore + SessionStore + DocumentStore + 'static,
{
    let jobs: Arc<dyn JobStore> = store.clone();
    let sessions: Arc<dyn SessionStore> = store.clone();
    let documents: Arc<dyn DocumentStore> = store;
    (jobs, sessions, documents)
}

/// Read `@file` bodies from disk; anything else is the body itself.
pub fn read_body(body: &str) -> CliResult<String> {
    match body.strip_prefix('@') {
        Some(path) => Ok(std::fs::read_to_string(path)
            .map_err(|e| format!("Failed to read body from {path}: {e}"))?),
        None => Ok(body.to_string()),
    }
}

/// Print each event as one JSON line until `done` returns true or the hub
/// closes the subscription.
pub async fn print_events(mut subscription: Subscription, done: impl Fn(&Event) -> bool) -> Option<Event> {
    while let Some(event) = subscription.recv().await {
        match serde_json::to_string(&event) {
            Ok(line) => println!("{line}"),
            Err(e) => tracing::warn!(error = %e, "Failed to encode event"),
        }
        if done(&event) {
            return Some(event);
        }
    }
    None
}

pub fn is_job_terminal(event: &Event) -> bool {
    matches!(
        event.event_type,
        EventType::JobSucceeded | EventType::JobFailed | EventType::JobCanceled
    )
}

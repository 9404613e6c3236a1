//! Job engine: runs plugin invocations asynchronously.
//!
//! Callers submit a job and get back a queued record immediately. A single
//! worker task consumes job UUIDs from a bounded queue and drives each job
//! through `queued → running → succeeded | failed`; `cancel` can move a job to
//! `canceled` from either non-terminal state. Every transition is persisted
//! first and then published on the job's session.
//!
//! A UUID that does not fit in the queue is not lost: the job stays `queued`
//! in storage and the periodic sweep re-enqueues it.

use crate::ledger::{SessionStepLedger, StepDraft};
use chrono::Utc;
use inkwell_config::EngineConfig;
use inkwell_core::error::{Error, Result, UpstreamError};
use inkwell_core::event::{EventHub, EventType};
use inkwell_core::job::{Job, JobStatus, NewJob};
use inkwell_core::plugin::PluginInvoker;
use inkwell_core::session::StepType;
use inkwell_core::store::{JobStore, SessionStore};
use inkwell_core::CancellationRegistry;
use serde_json::{Map, Value, json};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// A request to run one plugin method on behalf of a user.
#[derive(Debug, Clone)]
pub struct SubmitJob {
    pub user_id: i64,
    pub session_id: i64,
    /// Defaults to the session's project.
    pub project_id: Option<i64>,
    pub plugin_id: i64,
    pub method: String,
    pub payload: Value,
    /// Caller credential forwarded to the plugin. Held in memory only.
    pub auth_token: Option<String>,
}

#[derive(Debug, Clone)]
pub struct EngineSettings {
    pub queue_capacity: usize,
    /// `None` disables the re-enqueue sweep.
    pub sweep_interval: Option<Duration>,
}

impl EngineSettings {
    pub fn from_config(config: &EngineConfig) -> Self {
        Self {
            queue_capacity: config.queue_capacity.max(1),
            sweep_interval: (config.sweep_interval_secs > 0)
                .then(|| Duration::from_secs(config.sweep_interval_secs)),
        }
    }
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            queue_capacity: 1000,
            sweep_interval: Some(Duration::from_secs(30)),
        }
    }
}

/// Handle to the job engine. Cheap to clone; all clones share one worker.
#[derive(Clone)]
pub struct JobEngine {
    inner: Arc<EngineInner>,
}

struct EngineInner {
    jobs: Arc<dyn JobStore>,
    plugins: Arc<dyn PluginInvoker>,
    ledger: Arc<SessionStepLedger>,
    queue: mpsc::Sender<String>,
    /// UUIDs currently sitting in the queue.
    enqueued: Mutex<HashSet<String>>,
    cancels: CancellationRegistry,
    credentials: Mutex<HashMap<String, String>>,
    /// Serializes read-check-write of job status between `cancel` and the worker.
    transitions: tokio::sync::Mutex<()>,
    finished: watch::Sender<u64>,
}

impl JobEngine {
    /// Create the engine and spawn its worker.
    ///
    /// The worker exits once every `JobEngine` clone has been dropped.
    pub fn start(
        jobs: Arc<dyn JobStore>,
        plugins: Arc<dyn PluginInvoker>,
        ledger: Arc<SessionStepLedger>,
        settings: EngineSettings,
    ) -> (Self, JoinHandle<()>) {
        let (queue, mut rx) = mpsc::channel::<String>(settings.queue_capacity.max(1));
        let (finished, _) = watch::channel(0u64);
        let inner = Arc::new(EngineInner {
            jobs,
            plugins,
            ledger,
            queue,
            enqueued: Mutex::new(HashSet::new()),
            cancels: CancellationRegistry::new(),
            credentials: Mutex::new(HashMap::new()),
            transitions: tokio::sync::Mutex::new(()),
            finished,
        });

        let weak: Weak<EngineInner> = Arc::downgrade(&inner);
        let sweep_interval = settings.sweep_interval;
        let handle = tokio::spawn(async move {
            info!(
                capacity = settings.queue_capacity,
                sweep_secs = sweep_interval.map(|d| d.as_secs()),
                "Job worker started"
            );
            let mut sweep = sweep_interval.map(tokio::time::interval);

            loop {
                tokio::select! {
                    next = rx.recv() => {
                        let Some(job_uuid) = next else { break };
                        let Some(inner) = weak.upgrade() else { break };
                        let engine = JobEngine { inner };
                        engine.dequeued(&job_uuid);
                        engine.run_job(&job_uuid).await;
                    }
                    _ = tick(&mut sweep) => {
                        let Some(inner) = weak.upgrade() else { break };
                        let engine = JobEngine { inner };
                        if let Err(e) = engine.sweep_queued().await {
                            warn!(error = %e, "Queued job sweep failed");
                        }
                    }
                }
            }
            info!("Job worker stopped");
        });

        (Self { inner }, handle)
    }

    /// Validate, persist and enqueue a job. Returns the `queued` record.
    pub async fn submit(&self, request: SubmitJob) -> Result<Job> {
        if request.method.trim().is_empty() {
            return Err(Error::validation("method is required"));
        }

        let session = self
            .sessions()
            .get_session(request.session_id)
            .await?
            .ok_or_else(|| Error::not_found("session not found"))?;
        if session.user_id != request.user_id {
            return Err(Error::access_denied("session belongs to another user"));
        }

        let new_job = NewJob::plugin_invoke(
            request.user_id,
            request.session_id,
            request.plugin_id,
            request.method,
            request.payload,
        )
        .with_project(request.project_id.or(Some(session.project_id)));
        let job = self.inner.jobs.create_job(new_job).await?;

        if let Some(token) = request.auth_token.filter(|t| !t.is_empty()) {
            self.inner
                .credentials
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .insert(job.job_uuid.clone(), token);
        }

        self.publish(&job, EventType::JobCreated, None);
        info!(job_uuid = %job.job_uuid, plugin_id = job.plugin_id, method = %job.method, "Job submitted");
        self.enqueue(&job.job_uuid);
        Ok(job)
    }

    pub async fn get_by_uuid(&self, job_uuid: &str) -> Result<Job> {
        self.inner
            .jobs
            .get_job_by_uuid(job_uuid)
            .await?
            .ok_or_else(|| Error::not_found(format!("job {job_uuid} not found")))
    }

    /// Fetch a job, checking that `user_id` owns it.
    pub async fn get_for_user(&self, user_id: i64, job_uuid: &str) -> Result<Job> {
        let job = self.get_by_uuid(job_uuid).await?;
        if job.user_id != user_id {
            return Err(Error::access_denied("job belongs to another user"));
        }
        Ok(job)
    }

    pub async fn list_for_session(&self, session_id: i64) -> Result<Vec<Job>> {
        Ok(self.inner.jobs.list_jobs_by_session(session_id).await?)
    }

    /// Cancel a job owned by `user_id`.
    ///
    /// Canceling a terminal job is a no-op that returns it unchanged.
    pub async fn cancel(&self, user_id: i64, job_uuid: &str) -> Result<Job> {
        let job = {
            let _transition = self.inner.transitions.lock().await;
            let mut job = self.get_by_uuid(job_uuid).await?;
            if job.user_id != user_id {
                return Err(Error::access_denied("job belongs to another user"));
            }
            if job.is_terminal() {
                debug!(job_uuid, status = job.status.as_str(), "Cancel ignored for terminal job");
                return Ok(job);
            }

            self.inner.cancels.cancel(job_uuid);
            let now = Utc::now();
            job.status = JobStatus::Canceled;
            job.progress = 0;
            job.finished_at = Some(now);
            job.updated_at = now;
            self.inner.jobs.update_job(&job).await?;
            job
        };

        self.forget_credential(job_uuid);
        self.publish(&job, EventType::JobCanceled, None);
        self.notify_finished();
        info!(job_uuid, "Job canceled");
        Ok(job)
    }

    /// Wait until the job reaches a terminal state.
    ///
    /// Times out with `Upstream(Timeout)`.
    pub async fn wait_for_terminal(&self, job_uuid: &str, timeout: Duration) -> Result<Job> {
        let mut finished = self.inner.finished.subscribe();
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let job = self.get_by_uuid(job_uuid).await?;
            if job.is_terminal() {
                return Ok(job);
            }
            match tokio::time::timeout_at(deadline, finished.changed()).await {
                Ok(Ok(())) => continue,
                Ok(Err(_)) => return Err(Error::Internal("job engine stopped".into())),
                Err(_) => {
                    return Err(UpstreamError::Timeout(format!(
                        "job {job_uuid} did not finish within {}s",
                        timeout.as_secs()
                    ))
                    .into());
                }
            }
        }
    }

    /// Re-enqueue every `queued` job that is not already in the queue.
    pub async fn sweep_queued(&self) -> Result<usize> {
        let queued = self
            .inner
            .jobs
            .list_jobs_by_status(JobStatus::Queued, self.inner.queue.max_capacity())
            .await?;
        let mut count = 0;
        for job in queued {
            if self.is_enqueued(&job.job_uuid) {
                continue;
            }
            if !self.enqueue(&job.job_uuid) {
                break;
            }
            count += 1;
        }
        if count > 0 {
            info!(count, "Re-enqueued queued jobs");
        }
        Ok(count)
    }

    fn sessions(&self) -> &Arc<dyn SessionStore> {
        self.inner.ledger.sessions()
    }

    fn hub(&self) -> &Arc<EventHub> {
        self.inner.ledger.hub()
    }

    fn enqueue(&self, job_uuid: &str) -> bool {
        let mut enqueued = self.inner.enqueued.lock().unwrap_or_else(|e| e.into_inner());
        if enqueued.contains(job_uuid) {
            return true;
        }
        match self.inner.queue.try_send(job_uuid.to_string()) {
            Ok(()) => {
                enqueued.insert(job_uuid.to_string());
                true
            }
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!(job_uuid, "Job queue full; job stays queued until the next sweep");
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                error!(job_uuid, "Job worker is not running");
                false
            }
        }
    }

    fn is_enqueued(&self, job_uuid: &str) -> bool {
        self.inner
            .enqueued
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains(job_uuid)
    }

    fn dequeued(&self, job_uuid: &str) {
        self.inner
            .enqueued
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(job_uuid);
    }

    fn forget_credential(&self, job_uuid: &str) {
        self.inner
            .credentials
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(job_uuid);
    }

    fn notify_finished(&self) {
        self.inner.finished.send_modify(|n| *n = n.wrapping_add(1));
    }

    async fn run_job(&self, job_uuid: &str) {
        if let Err(e) = self.execute(job_uuid).await {
            error!(job_uuid, error = %e, "Job execution failed");
        }
        self.forget_credential(job_uuid);
        self.notify_finished();
    }

    async fn execute(&self, job_uuid: &str) -> Result<()> {
        let (job, guard) = {
            let _transition = self.inner.transitions.lock().await;
            let Some(mut job) = self.inner.jobs.get_job_by_uuid(job_uuid).await? else {
                warn!(job_uuid, "Dequeued job no longer exists");
                return Ok(());
            };
            if job.status != JobStatus::Queued {
                debug!(job_uuid, status = job.status.as_str(), "Skipping job that is no longer queued");
                return Ok(());
            }

            let guard = self.inner.cancels.register(job_uuid);
            let now = Utc::now();
            job.status = JobStatus::Running;
            job.progress = 10;
            job.started_at = Some(now);
            job.updated_at = now;
            self.inner.jobs.update_job(&job).await?;
            (job, guard)
        };
        self.publish(&job, EventType::JobStarted, None);
        debug!(job_uuid, plugin_id = job.plugin_id, method = %job.method, "Job running");

        let auth = self
            .inner
            .credentials
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(job_uuid)
            .cloned();
        let mut invocation = {
            let plugins = self.inner.plugins.clone();
            let token = guard.token().clone();
            let plugin_id = job.plugin_id;
            let method = job.method.clone();
            let payload = job.payload.clone();
            tokio::spawn(async move { plugins.invoke(token, plugin_id, &method, payload, auth.as_deref()).await })
        };

        let outcome = tokio::select! {
            joined = &mut invocation => Some(match joined {
                Ok(result) => result,
                Err(e) if e.is_panic() => Err(UpstreamError::Other("plugin invocation panicked".into())),
                Err(e) => Err(UpstreamError::Other(format!("plugin invocation aborted: {e}"))),
            }),
            _ = guard.token().cancelled() => None,
        };
        drop(guard);

        match outcome {
            None => {
                invocation.abort();
                info!(job_uuid, "Job canceled while running");
                Ok(())
            }
            Some(Err(e)) => self.fail(job, e).await,
            Some(Ok(value)) => self.succeed(job, value).await,
        }
    }

    /// Reload the job under the transition lock and apply `change` unless it
    /// has reached a terminal state in the meantime.
    async fn transition(&self, job: &Job, change: impl FnOnce(&mut Job)) -> Result<Option<Job>> {
        let _transition = self.inner.transitions.lock().await;
        let Some(mut current) = self.active(job).await? else {
            return Ok(None);
        };
        change(&mut current);
        current.updated_at = Utc::now();
        self.inner.jobs.update_job(&current).await?;
        Ok(Some(current))
    }

    /// The stored job, or `None` once it is terminal. Call with `transitions` held.
    async fn active(&self, job: &Job) -> Result<Option<Job>> {
        let current = self
            .inner
            .jobs
            .get_job_by_uuid(&job.job_uuid)
            .await?
            .unwrap_or_else(|| job.clone());
        if current.is_terminal() {
            debug!(job_uuid = %job.job_uuid, status = current.status.as_str(), "Job already finished");
            return Ok(None);
        }
        Ok(Some(current))
    }

    async fn fail(&self, job: Job, err: UpstreamError) -> Result<()> {
        self.fail_with(job, err.to_string()).await
    }

    async fn fail_with(&self, job: Job, message: String) -> Result<()> {
        let Some(job) = self
            .transition(&job, |j| {
                j.status = JobStatus::Failed;
                j.progress = 0;
                j.error_message = Some(message.clone());
                j.finished_at = Some(Utc::now());
            })
            .await?
        else {
            return Ok(());
        };

        warn!(job_uuid = %job.job_uuid, error = %message, "Job failed");
        self.publish(&job, EventType::JobFailed, Some(("error", json!(message))));
        Ok(())
    }

    async fn succeed(&self, job: Job, value: Value) -> Result<()> {
        let Some(job) = self.transition(&job, |j| j.progress = 80).await? else {
            return Ok(());
        };
        self.publish(&job, EventType::JobProgress, None);

        // Record the result step before the job turns terminal.
        let recorded = {
            let _transition = self.inner.transitions.lock().await;
            let Some(mut current) = self.active(&job).await? else {
                return Ok(());
            };
            match self.record_result(&current, &value).await {
                Ok(()) => {
                    current.status = JobStatus::Succeeded;
                    current.progress = 100;
                    current.result = Some(value.clone());
                    current.finished_at = Some(Utc::now());
                    current.updated_at = Utc::now();
                    self.inner.jobs.update_job(&current).await?;
                    Ok(current)
                }
                Err(e) => Err((current, e)),
            }
        };

        match recorded {
            Ok(job) => {
                info!(job_uuid = %job.job_uuid, "Job succeeded");
                self.publish(&job, EventType::JobSucceeded, Some(("result", value)));
                Ok(())
            }
            Err((job, e)) => {
                error!(job_uuid = %job.job_uuid, error = %e, "Failed to record plugin result step");
                self.fail_with(job, format!("plugin result could not be recorded: {e}")).await
            }
        }
    }

    async fn record_result(&self, job: &Job, value: &Value) -> Result<()> {
        let mut extra = Map::new();
        extra.insert("job_uuid".into(), json!(job.job_uuid));
        extra.insert("plugin_id".into(), json!(job.plugin_id));
        let draft = StepDraft::new(
            job.session_id,
            format!("plugin:{} {}", job.plugin_id, job.method),
            serde_json::to_string(value)?,
            "plugin_result",
        )
        .with_step_type(StepType::PluginResult)
        .with_metadata(json!({ "job_uuid": job.job_uuid, "plugin_id": job.plugin_id }));
        self.inner.ledger.append_with_event(draft, extra).await?;
        Ok(())
    }

    fn publish(&self, job: &Job, event_type: EventType, extra: Option<(&str, Value)>) {
        let mut data = json!({
            "job_uuid": job.job_uuid,
            "status": job.status,
            "progress": job.progress,
            "plugin_id": job.plugin_id,
            "session_id": job.session_id,
        });
        if let (Some((key, value)), Value::Object(map)) = (extra, &mut data) {
            map.insert(key.to_string(), value);
        }
        self.hub().publish(job.session_id, event_type, data);
    }
}

async fn tick(interval: &mut Option<tokio::time::Interval>) {
    match interval {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending::<()>().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use inkwell_core::event::{Event, Subscription};
    use inkwell_core::error::StorageError;
    use inkwell_core::session::{NewSession, NewStep, Session, SessionStep};
    use inkwell_core::CancellationToken;
    use inkwell_storage::InMemoryStore;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::Notify;

    const WAIT: Duration = Duration::from_secs(5);

    #[derive(Default)]
    struct EchoPlugin {
        calls: AtomicUsize,
        auth: Mutex<Vec<Option<String>>>,
    }

    #[async_trait]
    impl PluginInvoker for EchoPlugin {
        async fn invoke(
            &self,
            _cancel: CancellationToken,
            _plugin_id: i64,
            method: &str,
            payload: Value,
            auth: Option<&str>,
        ) -> std::result::Result<Value, UpstreamError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.auth.lock().unwrap().push(auth.map(str::to_string));
            match method {
                "fail" => Err(UpstreamError::Other("plugin exploded".into())),
                "panic" => panic!("plugin bug"),
                _ => Ok(json!({ "echo": payload })),
            }
        }
    }

    /// Blocks every invocation until released or cancelled.
    #[derive(Default)]
    struct GatedPlugin {
        started: Notify,
        release: Notify,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl PluginInvoker for GatedPlugin {
        async fn invoke(
            &self,
            cancel: CancellationToken,
            _plugin_id: i64,
            _method: &str,
            payload: Value,
            _auth: Option<&str>,
        ) -> std::result::Result<Value, UpstreamError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.started.notify_one();
            tokio::select! {
                _ = self.release.notified() => Ok(payload),
                _ = cancel.cancelled() => Err(UpstreamError::Other("cancelled".into())),
            }
        }
    }

    struct Fixture {
        engine: JobEngine,
        store: Arc<InMemoryStore>,
        hub: Arc<EventHub>,
        session_id: i64,
    }

    async fn fixture(plugins: Arc<dyn PluginInvoker>, settings: EngineSettings) -> Fixture {
        let store = Arc::new(InMemoryStore::new());
        let hub = Arc::new(EventHub::new(256));
        let session = store
            .create_session(NewSession::new(1, 7, "chat", "chat"))
            .await
            .unwrap();
        let ledger = Arc::new(SessionStepLedger::new(store.clone(), hub.clone()));
        let (engine, _worker) = JobEngine::start(store.clone(), plugins, ledger, settings);
        Fixture {
            engine,
            store,
            hub,
            session_id: session.id,
        }
    }

    fn no_sweep() -> EngineSettings {
        EngineSettings {
            queue_capacity: 16,
            sweep_interval: None,
        }
    }

    fn request(session_id: i64, method: &str) -> SubmitJob {
        SubmitJob {
            user_id: 1,
            session_id,
            project_id: None,
            plugin_id: 3,
            method: method.into(),
            payload: json!({ "x": 1 }),
            auth_token: None,
        }
    }

    fn drain(sub: &mut Subscription) -> Vec<Event> {
        let mut events = Vec::new();
        while let Some(event) = sub.try_recv() {
            events.push(event);
        }
        events
    }

    #[tokio::test]
    async fn successful_job_records_result_and_step() {
        let plugin = Arc::new(EchoPlugin::default());
        let f = fixture(plugin.clone(), no_sweep()).await;
        let mut sub = f.hub.subscribe(f.session_id.to_string());

        let mut req = request(f.session_id, "echo");
        req.auth_token = Some("Bearer user-token".into());
        let job = f.engine.submit(req).await.unwrap();
        assert_eq!(job.status, JobStatus::Queued);
        assert_eq!(job.project_id, Some(7));

        let done = f.engine.wait_for_terminal(&job.job_uuid, WAIT).await.unwrap();
        assert_eq!(done.status, JobStatus::Succeeded);
        assert_eq!(done.progress, 100);
        assert_eq!(done.result, Some(json!({ "echo": { "x": 1 } })));
        assert!(done.started_at.is_some() && done.finished_at.is_some());
        assert_eq!(
            plugin.auth.lock().unwrap().as_slice(),
            &[Some("Bearer user-token".to_string())]
        );

        let steps = f.store.list_steps(f.session_id).await.unwrap();
        assert_eq!(steps.len(), 1);
        assert_eq!(steps[0].format_type, "plugin_result");
        assert_eq!(steps[0].title, "plugin:3 echo");

        let types: Vec<EventType> = drain(&mut sub).into_iter().map(|e| e.event_type).collect();
        assert_eq!(
            types,
            vec![
                EventType::JobCreated,
                EventType::JobStarted,
                EventType::JobProgress,
                EventType::StepAppended,
                EventType::JobSucceeded,
            ]
        );
        assert!(f.engine.inner.credentials.lock().unwrap().is_empty());
    }

    /// Delegates to the in-memory store but cannot write steps.
    struct ReadOnlySteps(Arc<InMemoryStore>);

    #[async_trait]
    impl SessionStore for ReadOnlySteps {
        async fn create_session(&self, session: NewSession) -> std::result::Result<Session, StorageError> {
            self.0.create_session(session).await
        }

        async fn get_session(&self, id: i64) -> std::result::Result<Option<Session>, StorageError> {
            self.0.get_session(id).await
        }

        async fn update_session(&self, session: &Session) -> std::result::Result<(), StorageError> {
            self.0.update_session(session).await
        }

        async fn list_sessions(
            &self,
            user_id: i64,
            page: usize,
            page_size: usize,
        ) -> std::result::Result<(Vec<Session>, usize), StorageError> {
            self.0.list_sessions(user_id, page, page_size).await
        }

        async fn create_step(&self, _step: NewStep) -> std::result::Result<SessionStep, StorageError> {
            Err(StorageError::QueryFailed("disk full".into()))
        }

        async fn get_step(&self, id: i64) -> std::result::Result<Option<SessionStep>, StorageError> {
            self.0.get_step(id).await
        }

        async fn update_step(&self, step: &SessionStep) -> std::result::Result<(), StorageError> {
            self.0.update_step(step).await
        }

        async fn list_steps(&self, session_id: i64) -> std::result::Result<Vec<SessionStep>, StorageError> {
            self.0.list_steps(session_id).await
        }

        async fn max_step_order(&self, session_id: i64) -> std::result::Result<Option<i64>, StorageError> {
            self.0.max_step_order(session_id).await
        }
    }

    #[tokio::test]
    async fn unrecorded_result_fails_the_job() {
        let store = Arc::new(InMemoryStore::new());
        let hub = Arc::new(EventHub::new(256));
        let session = store
            .create_session(NewSession::new(1, 7, "chat", "chat"))
            .await
            .unwrap();
        let ledger = Arc::new(SessionStepLedger::new(Arc::new(ReadOnlySteps(store.clone())), hub.clone()));
        let (engine, _worker) = JobEngine::start(store.clone(), Arc::new(EchoPlugin::default()), ledger, no_sweep());
        let mut sub = hub.subscribe(session.id.to_string());

        let job = engine.submit(request(session.id, "echo")).await.unwrap();
        let done = engine.wait_for_terminal(&job.job_uuid, WAIT).await.unwrap();
        assert_eq!(done.status, JobStatus::Failed);
        assert!(done.result.is_none());
        assert!(done.error_message.unwrap().contains("could not be recorded"));

        let types: Vec<EventType> = drain(&mut sub).into_iter().map(|e| e.event_type).collect();
        assert!(!types.contains(&EventType::JobSucceeded));
        assert_eq!(types.last(), Some(&EventType::JobFailed));
    }

    #[tokio::test]
    async fn failing_plugin_fails_job() {
        let f = fixture(Arc::new(EchoPlugin::default()), no_sweep()).await;
        let mut sub = f.hub.subscribe(f.session_id.to_string());

        let job = f.engine.submit(request(f.session_id, "fail")).await.unwrap();
        let done = f.engine.wait_for_terminal(&job.job_uuid, WAIT).await.unwrap();
        assert_eq!(done.status, JobStatus::Failed);
        assert_eq!(done.progress, 0);
        assert!(done.error_message.unwrap().contains("plugin exploded"));

        let events = drain(&mut sub);
        let failed = events.last().unwrap();
        assert_eq!(failed.event_type, EventType::JobFailed);
        assert!(failed.data["error"].as_str().unwrap().contains("plugin exploded"));
        assert!(f.store.list_steps(f.session_id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn panicking_plugin_fails_job_and_worker_survives() {
        let f = fixture(Arc::new(EchoPlugin::default()), no_sweep()).await;

        let bad = f.engine.submit(request(f.session_id, "panic")).await.unwrap();
        let done = f.engine.wait_for_terminal(&bad.job_uuid, WAIT).await.unwrap();
        assert_eq!(done.status, JobStatus::Failed);
        assert_eq!(done.error_message.as_deref(), Some("plugin invocation panicked"));

        let good = f.engine.submit(request(f.session_id, "echo")).await.unwrap();
        let done = f.engine.wait_for_terminal(&good.job_uuid, WAIT).await.unwrap();
        assert_eq!(done.status, JobStatus::Succeeded);
    }

    #[tokio::test]
    async fn submit_validates_session_and_method() {
        let f = fixture(Arc::new(EchoPlugin::default()), no_sweep()).await;

        let err = f.engine.submit(request(f.session_id, "  ")).await.unwrap_err();
        assert_eq!(err.kind(), inkwell_core::ErrorKind::Validation);

        let err = f.engine.submit(request(9999, "echo")).await.unwrap_err();
        assert_eq!(err.kind(), inkwell_core::ErrorKind::NotFound);

        let mut other = request(f.session_id, "echo");
        other.user_id = 2;
        let err = f.engine.submit(other).await.unwrap_err();
        assert_eq!(err.kind(), inkwell_core::ErrorKind::AccessDenied);
    }

    #[tokio::test]
    async fn cancel_running_job_sticks() {
        let plugin = Arc::new(GatedPlugin::default());
        let f = fixture(plugin.clone(), no_sweep()).await;

        let job = f.engine.submit(request(f.session_id, "slow")).await.unwrap();
        tokio::time::timeout(WAIT, plugin.started.notified()).await.unwrap();

        let err = f.engine.cancel(2, &job.job_uuid).await.unwrap_err();
        assert_eq!(err.kind(), inkwell_core::ErrorKind::AccessDenied);

        let canceled = f.engine.cancel(1, &job.job_uuid).await.unwrap();
        assert_eq!(canceled.status, JobStatus::Canceled);
        assert_eq!(canceled.progress, 0);

        // Cancel is idempotent on terminal jobs.
        let again = f.engine.cancel(1, &job.job_uuid).await.unwrap();
        assert_eq!(again.status, JobStatus::Canceled);
        assert_eq!(again.finished_at, canceled.finished_at);

        // The worker moves on, and the canceled job is not overwritten.
        let next = f.engine.submit(request(f.session_id, "slow")).await.unwrap();
        tokio::time::timeout(WAIT, plugin.started.notified()).await.unwrap();
        plugin.release.notify_one();
        let done = f.engine.wait_for_terminal(&next.job_uuid, WAIT).await.unwrap();
        assert_eq!(done.status, JobStatus::Succeeded);

        let stored = f.engine.get_by_uuid(&job.job_uuid).await.unwrap();
        assert_eq!(stored.status, JobStatus::Canceled);
        assert!(stored.result.is_none());
    }

    #[tokio::test]
    async fn canceled_queued_job_is_never_invoked() {
        let plugin = Arc::new(GatedPlugin::default());
        let f = fixture(plugin.clone(), no_sweep()).await;

        let first = f.engine.submit(request(f.session_id, "slow")).await.unwrap();
        tokio::time::timeout(WAIT, plugin.started.notified()).await.unwrap();
        let second = f.engine.submit(request(f.session_id, "slow")).await.unwrap();
        f.engine.cancel(1, &second.job_uuid).await.unwrap();

        plugin.release.notify_one();
        f.engine.wait_for_terminal(&first.job_uuid, WAIT).await.unwrap();

        // A third job proves the worker has already passed the canceled one.
        let third = f.engine.submit(request(f.session_id, "slow")).await.unwrap();
        tokio::time::timeout(WAIT, plugin.started.notified()).await.unwrap();
        plugin.release.notify_one();
        f.engine.wait_for_terminal(&third.job_uuid, WAIT).await.unwrap();

        assert_eq!(plugin.calls.load(Ordering::SeqCst), 2);
        assert_eq!(
            f.engine.get_by_uuid(&second.job_uuid).await.unwrap().status,
            JobStatus::Canceled
        );
    }

    #[tokio::test]
    async fn overflowing_job_is_picked_up_by_sweep() {
        let plugin = Arc::new(GatedPlugin::default());
        let f = fixture(
            plugin.clone(),
            EngineSettings {
                queue_capacity: 1,
                sweep_interval: None,
            },
        )
        .await;

        let first = f.engine.submit(request(f.session_id, "slow")).await.unwrap();
        tokio::time::timeout(WAIT, plugin.started.notified()).await.unwrap();
        let second = f.engine.submit(request(f.session_id, "slow")).await.unwrap();
        let third = f.engine.submit(request(f.session_id, "slow")).await.unwrap();
        assert_eq!(third.status, JobStatus::Queued);

        for job in [&first, &second] {
            plugin.release.notify_one();
            f.engine.wait_for_terminal(&job.job_uuid, WAIT).await.unwrap();
            if job.job_uuid == first.job_uuid {
                tokio::time::timeout(WAIT, plugin.started.notified()).await.unwrap();
            }
        }
        assert_eq!(
            f.engine.get_by_uuid(&third.job_uuid).await.unwrap().status,
            JobStatus::Queued
        );

        assert_eq!(f.engine.sweep_queued().await.unwrap(), 1);
        tokio::time::timeout(WAIT, plugin.started.notified()).await.unwrap();
        plugin.release.notify_one();
        let done = f.engine.wait_for_terminal(&third.job_uuid, WAIT).await.unwrap();
        assert_eq!(done.status, JobStatus::Succeeded);
    }

    #[tokio::test]
    async fn wait_times_out_on_stuck_job() {
        let plugin = Arc::new(GatedPlugin::default());
        let f = fixture(plugin.clone(), no_sweep()).await;
        let job = f.engine.submit(request(f.session_id, "slow")).await.unwrap();

        let err = f
            .engine
            .wait_for_terminal(&job.job_uuid, Duration::from_millis(50))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Upstream(UpstreamError::Timeout(_))));
        assert!(f.engine.get_for_user(2, &job.job_uuid).await.is_err());
        assert_eq!(f.engine.list_for_session(f.session_id).await.unwrap().len(), 1);
    }
}

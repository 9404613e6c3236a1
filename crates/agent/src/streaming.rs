//! Streaming executor: runs one AI stream into one session step.
//!
//! `start` creates the step in `streaming` state and returns its identity
//! straight away; a background task consumes the chunks, publishes
//! `step.chunk` for each, checkpoints the accumulated text, and finishes the
//! step as `completed`, `error` or `cancelled`.

use crate::checkpoint::{CheckpointPolicy, StreamAccumulator};
use inkwell_core::ai::{AiClient, AiTarget, ChunkReceiver};
use inkwell_core::error::{Error, Result, UpstreamError};
use inkwell_core::event::EventType;
use inkwell_core::session::{NewSession, Session, SessionStep, StepType, StreamStatus};
use inkwell_core::{CancelGuard, CancellationRegistry, CancellationToken, ErrorKind};
use inkwell_workflow::{SessionStepLedger, StepDraft};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// How a consumed stream ended.
#[derive(Debug)]
pub(crate) enum StreamEnd {
    Completed,
    Cancelled,
    Failed(UpstreamError),
}

/// Open a stream, giving up early if `token` is cancelled first.
pub(crate) async fn open_stream(
    ai: &dyn AiClient,
    target: &AiTarget,
    body: &str,
    token: &CancellationToken,
) -> std::result::Result<ChunkReceiver, StreamEnd> {
    tokio::select! {
        biased;
        _ = token.cancelled() => Err(StreamEnd::Cancelled),
        opened = ai.call_stream(target, body) => opened.map_err(StreamEnd::Failed),
    }
}

/// Drain `chunks` into `step`, checkpointing per `policy`.
///
/// Cancellation is checked between chunks. Dropping the receiver on return
/// stops the producer.
pub(crate) async fn pump(
    ledger: &SessionStepLedger,
    step: &mut SessionStep,
    mut chunks: ChunkReceiver,
    token: &CancellationToken,
    policy: &CheckpointPolicy,
    deadline: Option<tokio::time::Instant>,
    mut on_chunk: impl FnMut(&str),
) -> (StreamEnd, String) {
    let mut acc = StreamAccumulator::new(policy.clone());
    let end = loop {
        tokio::select! {
            biased;
            _ = token.cancelled() => break StreamEnd::Cancelled,
            _ = sleep_until(deadline) => {
                break StreamEnd::Failed(UpstreamError::Timeout("stream deadline exceeded".into()));
            }
            next = chunks.recv() => match next {
                None => break StreamEnd::Completed,
                Some(Err(e)) => break StreamEnd::Failed(e),
                Some(Ok(chunk)) => {
                    on_chunk(&chunk);
                    if acc.push(&chunk) {
                        if let Err(e) = ledger.update_streaming(step, acc.content(), StreamStatus::Streaming).await {
                            warn!(step_id = step.id, error = %e, "Checkpoint failed");
                        }
                        acc.mark_checkpointed();
                    }
                }
            }
        }
    };
    debug!(step_id = step.id, chunks = acc.chunk_count(), "Stream consumed");
    (end, acc.into_content())
}

async fn sleep_until(deadline: Option<tokio::time::Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

pub(crate) fn step_key(step_id: i64) -> String {
    format!("step:{step_id}")
}

/// A request to stream one AI response into a session.
#[derive(Debug, Clone)]
pub struct StreamRequest {
    pub user_id: i64,
    pub project_id: i64,
    /// Existing session; a `stream` session is created when `None`.
    pub session_id: Option<i64>,
    pub title: Option<String>,
    pub target: AiTarget,
    pub body: String,
    /// Overrides the executor's default deadline.
    pub timeout: Option<Duration>,
}

/// A stream whose step exists but whose background task has not started.
#[derive(Debug)]
pub struct PreparedStream {
    session: Session,
    step: SessionStep,
    target: AiTarget,
    body: String,
    timeout: Option<Duration>,
    guard: CancelGuard,
}

impl PreparedStream {
    pub fn session_id(&self) -> i64 {
        self.session.id
    }

    pub fn step_id(&self) -> i64 {
        self.step.id
    }
}

#[derive(Debug)]
pub struct StreamHandle {
    pub session_id: i64,
    pub step_id: i64,
    pub task: JoinHandle<()>,
}

#[derive(Clone)]
pub struct StreamingExecutor {
    ai: Arc<dyn AiClient>,
    ledger: Arc<SessionStepLedger>,
    cancels: CancellationRegistry,
    policy: CheckpointPolicy,
    default_timeout: Option<Duration>,
}

impl StreamingExecutor {
    pub fn new(
        ai: Arc<dyn AiClient>,
        ledger: Arc<SessionStepLedger>,
        cancels: CancellationRegistry,
        policy: CheckpointPolicy,
    ) -> Self {
        Self {
            ai,
            ledger,
            cancels,
            policy,
            default_timeout: None,
        }
    }

    pub fn with_default_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.default_timeout = timeout;
        self
    }

    /// Create the streaming step and spawn the stream.
    pub async fn start(&self, req: StreamRequest) -> Result<StreamHandle> {
        let prepared = self.prepare(req).await?;
        Ok(self.launch(prepared))
    }

    /// Validate, resolve the session and create the `streaming` step.
    pub async fn prepare(&self, req: StreamRequest) -> Result<PreparedStream> {
        req.target.validate().map_err(|e| Error::validation(e.to_string()))?;
        if req.body.trim().is_empty() {
            return Err(Error::validation("body is required"));
        }

        let sessions = self.ledger.sessions();
        let session = match req.session_id {
            Some(id) => {
                let session = sessions
                    .get_session(id)
                    .await?
                    .ok_or_else(|| Error::not_found("session not found"))?;
                if session.user_id != req.user_id {
                    return Err(Error::access_denied("session belongs to another user"));
                }
                session
            }
            None => {
                let title = req.title.clone().unwrap_or_else(|| "AI stream".into());
                sessions
                    .create_session(NewSession::new(req.user_id, req.project_id, title, "stream").with_workflow(
                        "stream",
                        json!({ "provider": req.target.provider, "path": req.target.path }),
                    ))
                    .await?
            }
        };

        let step = self
            .ledger
            .begin_streaming(
                StepDraft::new(session.id, req.title.as_deref().unwrap_or("AI stream"), "", "stream")
                    .with_step_type(StepType::Assistant),
            )
            .await?;
        let guard = self.cancels.register(step_key(step.id));

        Ok(PreparedStream {
            session,
            step,
            target: req.target,
            body: req.body,
            timeout: req.timeout.or(self.default_timeout),
            guard,
        })
    }

    pub fn launch(&self, prepared: PreparedStream) -> StreamHandle {
        let session_id = prepared.session.id;
        let step_id = prepared.step.id;
        let executor = self.clone();
        let task = tokio::spawn(async move { executor.run(prepared).await });
        info!(session_id, step_id, "Stream started");
        StreamHandle {
            session_id,
            step_id,
            task,
        }
    }

    /// Request cancellation of a running stream.
    pub fn cancel(&self, step_id: i64) -> Result<()> {
        if !self.cancels.cancel(&step_key(step_id)) {
            return Err(Error::not_found("stream not found or already completed"));
        }
        Ok(())
    }

    pub async fn status(&self, step_id: i64) -> Result<SessionStep> {
        self.ledger
            .sessions()
            .get_step(step_id)
            .await?
            .ok_or_else(|| Error::not_found(format!("step {step_id} not found")))
    }

    /// Finish a step from chunks the client collected itself.
    ///
    /// A background stream still running for the step is cancelled and can
    /// no longer change it.
    pub async fn aggregate(&self, session_id: i64, step_id: i64, chunks: &[String]) -> Result<SessionStep> {
        let mut step = self.status(step_id).await?;
        if step.session_id != session_id {
            return Err(Error::validation(format!(
                "step {step_id} does not belong to session {session_id}"
            )));
        }
        let content = chunks.concat();
        self.ledger
            .update_streaming(&mut step, &content, StreamStatus::Completed)
            .await?;
        if self.cancels.cancel(&step_key(step_id)) {
            debug!(session_id, step_id, "Background stream cancelled after aggregate");
        }
        self.ledger.hub().publish(
            session_id,
            EventType::StepCompleted,
            json!({ "session_id": session_id, "step_id": step_id, "content": content }),
        );
        Ok(step)
    }

    async fn run(&self, prepared: PreparedStream) {
        let PreparedStream {
            session,
            mut step,
            target,
            body,
            timeout,
            guard,
        } = prepared;
        let hub = self.ledger.hub().clone();
        let session_id = session.id;
        let step_id = step.id;
        let deadline = timeout.map(|t| tokio::time::Instant::now() + t);

        let (end, content) = match open_stream(self.ai.as_ref(), &target, &body, guard.token()).await {
            Ok(chunks) => {
                pump(&self.ledger, &mut step, chunks, guard.token(), &self.policy, deadline, |chunk| {
                    hub.publish(
                        session_id,
                        EventType::StepChunk,
                        json!({ "session_id": session_id, "step_id": step_id, "chunk": chunk, "is_final": false }),
                    );
                })
                .await
            }
            Err(end) => (end, String::new()),
        };

        let (status, event, data) = match end {
            StreamEnd::Completed => (
                StreamStatus::Completed,
                EventType::StepCompleted,
                json!({ "session_id": session_id, "step_id": step_id, "content": content }),
            ),
            StreamEnd::Cancelled => (
                StreamStatus::Cancelled,
                EventType::StepCancelled,
                json!({ "session_id": session_id, "step_id": step_id }),
            ),
            StreamEnd::Failed(e) => {
                warn!(session_id, step_id, error = %e, "Stream failed");
                (
                    StreamStatus::Error,
                    EventType::StepError,
                    json!({ "session_id": session_id, "step_id": step_id, "error": e.to_string() }),
                )
            }
        };

        match self.ledger.update_streaming(&mut step, &content, status).await {
            Ok(()) => {
                hub.publish(session_id, event, data);
                info!(session_id, step_id, status = status.as_str(), bytes = content.len(), "Stream finished");
            }
            Err(e) if e.kind() == ErrorKind::Validation => {
                debug!(step_id, error = %e, "Step was finished elsewhere");
            }
            Err(e) => {
                warn!(step_id, error = %e, "Failed to finish streaming step");
                hub.publish(session_id, event, data);
            }
        }
        drop(guard);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use inkwell_core::ai::AiResponse;
    use inkwell_core::event::{Event, EventHub};
    use inkwell_core::store::SessionStore;
    use inkwell_storage::InMemoryStore;
    use std::sync::Mutex;
    use tokio::sync::mpsc;

    /// Streams the words of the body. A body of `hang` streams one word and
    /// then stalls; `broken` fails after one word.
    struct WordStream {
        senders: Mutex<Vec<mpsc::Sender<std::result::Result<String, UpstreamError>>>>,
    }

    #[async_trait]
    impl AiClient for WordStream {
        async fn call(&self, _target: &AiTarget, body: &str) -> std::result::Result<AiResponse, UpstreamError> {
            Ok(AiResponse {
                raw: json!(body),
                text: body.to_string(),
            })
        }

        async fn call_stream(&self, _target: &AiTarget, body: &str) -> std::result::Result<ChunkReceiver, UpstreamError> {
            let (tx, rx) = mpsc::channel(64);
            match body {
                "hang" => {
                    tx.send(Ok("waiting ".into())).await.ok();
                    self.senders.lock().unwrap().push(tx);
                }
                "broken" => {
                    tx.send(Ok("half ".into())).await.ok();
                    tx.send(Err(UpstreamError::StreamInterrupted("connection reset".into())))
                        .await
                        .ok();
                }
                _ => {
                    for word in body.split_inclusive(' ') {
                        tx.send(Ok(word.to_string())).await.ok();
                    }
                }
            }
            Ok(rx)
        }
    }

    struct Fixture {
        executor: StreamingExecutor,
        store: Arc<InMemoryStore>,
        hub: Arc<EventHub>,
        session_id: i64,
    }

    async fn fixture() -> Fixture {
        let store = Arc::new(InMemoryStore::new());
        let hub = Arc::new(EventHub::new(256));
        let session = store
            .create_session(NewSession::new(1, 1, "stream", "stream"))
            .await
            .unwrap();
        let ledger = Arc::new(SessionStepLedger::new(store.clone(), hub.clone()));
        let ai = Arc::new(WordStream {
            senders: Mutex::new(Vec::new()),
        });
        let executor = StreamingExecutor::new(
            ai,
            ledger,
            CancellationRegistry::new(),
            CheckpointPolicy {
                every_chunks: 2,
                interval: Duration::from_secs(60),
            },
        );
        Fixture {
            executor,
            store,
            hub,
            session_id: session.id,
        }
    }

    fn request(session_id: i64, body: &str) -> StreamRequest {
        StreamRequest {
            user_id: 1,
            project_id: 1,
            session_id: Some(session_id),
            title: None,
            target: AiTarget::new("openai", "chat/completions"),
            body: body.into(),
            timeout: None,
        }
    }

    fn drain(sub: &mut inkwell_core::event::Subscription) -> Vec<Event> {
        let mut events = Vec::new();
        while let Some(event) = sub.try_recv() {
            events.push(event);
        }
        events
    }

    #[tokio::test]
    async fn completed_stream_persists_all_chunks() {
        let f = fixture().await;
        let mut sub = f.hub.subscribe(f.session_id.to_string());

        let handle = f.executor.start(request(f.session_id, "the rain kept falling")).await.unwrap();
        assert_eq!(handle.session_id, f.session_id);
        handle.task.await.unwrap();

        let step = f.executor.status(handle.step_id).await.unwrap();
        assert_eq!(step.content, "the rain kept falling");
        assert_eq!(step.stream_status, Some(StreamStatus::Completed));
        assert!(!step.is_streaming);

        let events = drain(&mut sub);
        assert_eq!(events[0].event_type, EventType::StepAppended);
        let chunks: Vec<&str> = events
            .iter()
            .filter(|e| e.event_type == EventType::StepChunk)
            .map(|e| e.data["chunk"].as_str().unwrap())
            .collect();
        assert_eq!(chunks, vec!["the ", "rain ", "kept ", "falling"]);
        let last = events.last().unwrap();
        assert_eq!(last.event_type, EventType::StepCompleted);
        assert_eq!(last.data["content"], "the rain kept falling");
    }

    #[tokio::test]
    async fn failed_stream_keeps_partial_content() {
        let f = fixture().await;
        let mut sub = f.hub.subscribe(f.session_id.to_string());

        let handle = f.executor.start(request(f.session_id, "broken")).await.unwrap();
        handle.task.await.unwrap();

        let step = f.executor.status(handle.step_id).await.unwrap();
        assert_eq!(step.stream_status, Some(StreamStatus::Error));
        assert_eq!(step.content, "half ");
        let last = drain(&mut sub).pop().unwrap();
        assert_eq!(last.event_type, EventType::StepError);
        assert!(last.data["error"].as_str().unwrap().contains("connection reset"));
    }

    #[tokio::test]
    async fn cancel_stops_stream_and_second_cancel_is_not_found() {
        let f = fixture().await;
        let handle = f.executor.start(request(f.session_id, "hang")).await.unwrap();

        f.executor.cancel(handle.step_id).unwrap();
        handle.task.await.unwrap();

        let step = f.executor.status(handle.step_id).await.unwrap();
        assert_eq!(step.stream_status, Some(StreamStatus::Cancelled));
        let err = f.executor.cancel(handle.step_id).unwrap_err();
        assert_eq!(err.kind(), inkwell_core::ErrorKind::NotFound);
    }

    #[tokio::test(start_paused = true)]
    async fn deadline_marks_step_as_error() {
        let f = fixture().await;
        let mut req = request(f.session_id, "hang");
        req.timeout = Some(Duration::from_secs(5));
        let handle = f.executor.start(req).await.unwrap();
        handle.task.await.unwrap();

        let step = f.executor.status(handle.step_id).await.unwrap();
        assert_eq!(step.stream_status, Some(StreamStatus::Error));
        assert_eq!(step.content, "waiting ");
    }

    #[tokio::test]
    async fn aggregate_requires_matching_session() {
        let f = fixture().await;
        let other = f
            .store
            .create_session(NewSession::new(1, 1, "other", "stream"))
            .await
            .unwrap();
        let prepared = f.executor.prepare(request(f.session_id, "unused")).await.unwrap();
        let step_id = prepared.step_id();

        let chunks = vec!["Once ".to_string(), "upon".to_string()];
        let err = f.executor.aggregate(other.id, step_id, &chunks).await.unwrap_err();
        assert_eq!(err.kind(), inkwell_core::ErrorKind::Validation);

        let step = f.executor.aggregate(f.session_id, step_id, &chunks).await.unwrap();
        assert_eq!(step.content, "Once upon");
        assert_eq!(step.stream_status, Some(StreamStatus::Completed));
    }

    #[tokio::test]
    async fn aggregate_wins_over_a_running_stream() {
        let f = fixture().await;
        let mut sub = f.hub.subscribe(f.session_id.to_string());
        let handle = f.executor.start(request(f.session_id, "hang")).await.unwrap();

        let chunks = vec!["final text".to_string()];
        f.executor.aggregate(f.session_id, handle.step_id, &chunks).await.unwrap();
        handle.task.await.unwrap();

        let step = f.executor.status(handle.step_id).await.unwrap();
        assert_eq!(step.stream_status, Some(StreamStatus::Completed));
        assert_eq!(step.content, "final text");
        assert!(!drain(&mut sub).iter().any(|e| e.event_type == EventType::StepCancelled));
        let err = f.executor.cancel(handle.step_id).unwrap_err();
        assert_eq!(err.kind(), inkwell_core::ErrorKind::NotFound);
    }

    #[tokio::test]
    async fn new_session_is_created_when_none_given() {
        let f = fixture().await;
        let mut req = request(f.session_id, "hello there");
        req.session_id = None;
        req.title = Some("Scratch".into());
        let handle = f.executor.start(req).await.unwrap();
        assert_ne!(handle.session_id, f.session_id);
        handle.task.await.unwrap();

        let session = f.store.get_session(handle.session_id).await.unwrap().unwrap();
        assert_eq!(session.title, "Scratch");
        assert_eq!(session.workflow_type.as_deref(), Some("stream"));
    }
}

//! Session-scoped events and the hub that fans them out to live subscribers.
//!
//! Events are ephemeral: a subscriber only observes events broadcast after it
//! registered. Each subscriber owns a bounded queue; a full queue drops the
//! message for that subscriber instead of stalling the publisher.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, RwLock, Weak};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::{debug, warn};

/// Every event type a subscriber can observe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventType {
    #[serde(rename = "job.created")]
    JobCreated,
    #[serde(rename = "job.started")]
    JobStarted,
    #[serde(rename = "job.progress")]
    JobProgress,
    #[serde(rename = "job.succeeded")]
    JobSucceeded,
    #[serde(rename = "job.failed")]
    JobFailed,
    #[serde(rename = "job.canceled")]
    JobCanceled,
    #[serde(rename = "step.appended")]
    StepAppended,
    #[serde(rename = "step.chunk")]
    StepChunk,
    #[serde(rename = "step.completed")]
    StepCompleted,
    #[serde(rename = "step.error")]
    StepError,
    #[serde(rename = "step.cancelled")]
    StepCancelled,
    #[serde(rename = "chapter.start")]
    ChapterStart,
    #[serde(rename = "chapter.progress")]
    ChapterProgress,
    #[serde(rename = "chapter.completed")]
    ChapterCompleted,
    #[serde(rename = "chapter.error")]
    ChapterError,
    #[serde(rename = "workflow.progress")]
    WorkflowProgress,
    #[serde(rename = "workflow.done")]
    WorkflowDone,
    #[serde(rename = "workflow.cancelled")]
    WorkflowCancelled,
}

impl EventType {
    /// The wire name of this event type (e.g. `"job.created"`).
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::JobCreated => "job.created",
            EventType::JobStarted => "job.started",
            EventType::JobProgress => "job.progress",
            EventType::JobSucceeded => "job.succeeded",
            EventType::JobFailed => "job.failed",
            EventType::JobCanceled => "job.canceled",
            EventType::StepAppended => "step.appended",
            EventType::StepChunk => "step.chunk",
            EventType::StepCompleted => "step.completed",
            EventType::StepError => "step.error",
            EventType::StepCancelled => "step.cancelled",
            EventType::ChapterStart => "chapter.start",
            EventType::ChapterProgress => "chapter.progress",
            EventType::ChapterCompleted => "chapter.completed",
            EventType::ChapterError => "chapter.error",
            EventType::WorkflowProgress => "workflow.progress",
            EventType::WorkflowDone => "workflow.done",
            EventType::WorkflowCancelled => "workflow.cancelled",
        }
    }

    /// Whether this event ends the unit of work it reports on.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            EventType::JobSucceeded
                | EventType::JobFailed
                | EventType::JobCanceled
                | EventType::WorkflowDone
                | EventType::WorkflowCancelled
        )
    }
}

impl std::fmt::Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One pub/sub message: a type tag, a JSON payload and a timestamp.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    #[serde(rename = "type")]
    pub event_type: EventType,
    pub data: serde_json::Value,
    pub timestamp: DateTime<Utc>,
}

impl Event {
    pub fn new(event_type: EventType, data: serde_json::Value) -> Self {
        Self {
            event_type,
            data,
            timestamp: Utc::now(),
        }
    }
}

/// The key events are scoped by. Sessions are keyed by their numeric id.
pub fn session_key(session_id: i64) -> String {
    session_id.to_string()
}

struct Subscriber {
    session_key: String,
    tx: mpsc::Sender<Event>,
}

#[derive(Default)]
struct Registry {
    clients: HashMap<String, Subscriber>,
    sessions: HashMap<String, HashSet<String>>,
}

impl Registry {
    fn remove(&mut self, client_id: &str) -> bool {
        let Some(sub) = self.clients.remove(client_id) else {
            return false;
        };
        if let Some(members) = self.sessions.get_mut(&sub.session_key) {
            members.remove(client_id);
            if members.is_empty() {
                self.sessions.remove(&sub.session_key);
            }
        }
        true
    }
}

/// Per-session publish/subscribe broadcaster.
///
/// Construct one per process and share it behind an `Arc`; tests build an
/// isolated hub each.
pub struct EventHub {
    registry: RwLock<Registry>,
    client_buffer: usize,
}

impl EventHub {
    /// Create a hub whose subscriber queues hold `client_buffer` events.
    pub fn new(client_buffer: usize) -> Self {
        Self {
            registry: RwLock::new(Registry::default()),
            client_buffer: client_buffer.max(1),
        }
    }

    /// Register `client_id` under `session_key` and return its queue.
    ///
    /// Re-registering an existing id replaces (and closes) the old queue.
    pub fn add_client(
        &self,
        client_id: impl Into<String>,
        session_key: impl Into<String>,
    ) -> mpsc::Receiver<Event> {
        let client_id = client_id.into();
        let session_key = session_key.into();
        let (tx, rx) = mpsc::channel(self.client_buffer);

        let mut reg = self.registry.write().unwrap_or_else(|e| e.into_inner());
        reg.remove(&client_id);
        reg.sessions
            .entry(session_key.clone())
            .or_default()
            .insert(client_id.clone());
        debug!(client_id = %client_id, session = %session_key, "Subscriber added");
        reg.clients.insert(client_id, Subscriber { session_key, tx });
        rx
    }

    /// Deregister a client. Its queue closes once buffered events are drained.
    pub fn remove_client(&self, client_id: &str) -> bool {
        let mut reg = self.registry.write().unwrap_or_else(|e| e.into_inner());
        let removed = reg.remove(client_id);
        if removed {
            debug!(client_id = %client_id, "Subscriber removed");
        }
        removed
    }

    /// Deliver `event` to every client currently registered under
    /// `session_key`. Never blocks; returns how many clients accepted it.
    pub fn broadcast_to_session(&self, session_key: &str, event: Event) -> usize {
        let reg = self.registry.read().unwrap_or_else(|e| e.into_inner());
        let Some(members) = reg.sessions.get(session_key) else {
            return 0;
        };

        let mut delivered = 0;
        for client_id in members {
            let Some(sub) = reg.clients.get(client_id) else {
                continue;
            };
            match sub.tx.try_send(event.clone()) {
                Ok(()) => delivered += 1,
                Err(TrySendError::Full(_)) => {
                    warn!(
                        client_id = %client_id,
                        session = %session_key,
                        event = %event.event_type,
                        "Subscriber queue full, dropping event"
                    );
                }
                Err(TrySendError::Closed(_)) => {
                    debug!(client_id = %client_id, "Subscriber queue closed, skipping");
                }
            }
        }
        delivered
    }

    /// Convenience: build an [`Event`] and broadcast it to a session id.
    pub fn publish(&self, session_id: i64, event_type: EventType, data: serde_json::Value) -> usize {
        self.broadcast_to_session(&session_key(session_id), Event::new(event_type, data))
    }

    /// Register an anonymous subscriber that deregisters itself when dropped.
    pub fn subscribe(self: &Arc<Self>, session_key: impl Into<String>) -> Subscription {
        let id = uuid::Uuid::new_v4().to_string();
        let rx = self.add_client(id.clone(), session_key);
        Subscription {
            id,
            rx,
            hub: Arc::downgrade(self),
        }
    }

    /// Number of registered clients across all sessions.
    pub fn client_count(&self) -> usize {
        self.registry
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clients
            .len()
    }

    /// Number of clients registered under one session key.
    pub fn session_client_count(&self, session_key: &str) -> usize {
        self.registry
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .sessions
            .get(session_key)
            .map_or(0, HashSet::len)
    }
}

impl Default for EventHub {
    fn default() -> Self {
        Self::new(100)
    }
}

/// A hub registration tied to a value's lifetime.
pub struct Subscription {
    id: String,
    rx: mpsc::Receiver<Event>,
    hub: Weak<EventHub>,
}

impl Subscription {
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Wait for the next event; `None` once the hub dropped this client.
    pub async fn recv(&mut self) -> Option<Event> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<Event> {
        self.rx.try_recv().ok()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(hub) = self.hub.upgrade() {
            hub.remove_client(&self.id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn subscriber_receives_events_in_publish_order() {
        let hub = EventHub::new(16);
        let mut rx = hub.add_client("c1", "42");

        for i in 0..5 {
            hub.broadcast_to_session("42", Event::new(EventType::StepChunk, json!({ "i": i })));
        }

        for i in 0..5 {
            let event = rx.recv().await.unwrap();
            assert_eq!(event.event_type, EventType::StepChunk);
            assert_eq!(event.data["i"], i);
        }
    }

    #[tokio::test]
    async fn events_stay_within_their_session() {
        let hub = EventHub::new(16);
        let mut a = hub.add_client("a", "1");
        let mut b = hub.add_client("b", "2");

        let delivered = hub.publish(1, EventType::JobCreated, json!({ "job_uuid": "x" }));
        assert_eq!(delivered, 1);

        assert_eq!(a.recv().await.unwrap().event_type, EventType::JobCreated);
        assert!(b.try_recv().is_err());
    }

    #[test]
    fn full_queue_drops_instead_of_blocking() {
        let hub = EventHub::new(2);
        let mut rx = hub.add_client("slow", "7");

        let delivered: usize = (0..5)
            .map(|i| hub.publish(7, EventType::StepChunk, json!({ "i": i })))
            .sum();
        assert_eq!(delivered, 2);

        assert_eq!(rx.try_recv().unwrap().data["i"], 0);
        assert_eq!(rx.try_recv().unwrap().data["i"], 1);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn removed_client_is_skipped_and_closed() {
        let hub = EventHub::new(4);
        let mut rx = hub.add_client("c1", "9");
        assert!(hub.remove_client("c1"));
        assert!(!hub.remove_client("c1"));

        assert_eq!(hub.publish(9, EventType::StepAppended, json!({})), 0);
        assert!(rx.recv().await.is_none());
        assert_eq!(hub.session_client_count("9"), 0);
    }

    #[tokio::test]
    async fn late_subscriber_misses_earlier_events() {
        let hub = Arc::new(EventHub::new(4));
        hub.publish(3, EventType::JobCreated, json!({}));

        let mut sub = hub.subscribe("3");
        hub.publish(3, EventType::JobStarted, json!({}));
        assert_eq!(sub.recv().await.unwrap().event_type, EventType::JobStarted);
        assert!(sub.try_recv().is_none());
    }

    #[test]
    fn dropping_subscription_deregisters() {
        let hub = Arc::new(EventHub::default());
        let sub = hub.subscribe("5");
        assert_eq!(hub.client_count(), 1);
        drop(sub);
        assert_eq!(hub.client_count(), 0);
    }

    #[tokio::test]
    async fn concurrent_add_remove_and_broadcast() {
        let hub = Arc::new(EventHub::new(8));
        let mut handles = Vec::new();
        for n in 0..16 {
            let hub = hub.clone();
            handles.push(tokio::spawn(async move {
                let id = format!("client-{n}");
                let _rx = hub.add_client(id.clone(), "shared");
                for _ in 0..20 {
                    hub.publish(0, EventType::StepChunk, json!({}));
                    hub.broadcast_to_session("shared", Event::new(EventType::StepChunk, json!({})));
                    tokio::task::yield_now().await;
                }
                hub.remove_client(&id);
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }
        assert_eq!(hub.client_count(), 0);
    }

    #[test]
    fn event_serializes_type_tag_data_and_timestamp() {
        let event = Event::new(EventType::WorkflowDone, json!({ "mode": "chapter_generate" }));
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["type"], "workflow.done");
        assert_eq!(value["data"]["mode"], "chapter_generate");
        assert!(value["timestamp"].is_string());
        assert_eq!(EventType::WorkflowDone.to_string(), "workflow.done");
    }
}

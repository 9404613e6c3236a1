//! # inkwell core
//!
//! Domain types, traits, and error definitions for the inkwell writing
//! assistant backend. This crate does no I/O: it defines the job/session
//! model, the session-scoped [`EventHub`], the [`CancellationRegistry`], and
//! the collaborator traits every other crate implements against.
//!
//! Process-wide components (the hub, the registries) are explicitly
//! constructed once and passed by reference; nothing here is a global.

pub mod ai;
pub mod cancel;
pub mod document;
pub mod error;
pub mod event;
pub mod job;
pub mod plugin;
pub mod session;
pub mod store;

// Re-export key types at crate root for ergonomics
pub use ai::{AiClient, AiResponse, AiTarget, AssistantTurn, ChunkReceiver, ToolCall, ToolCallingModel, ToolDefinition};
pub use cancel::{CancelGuard, CancellationRegistry};
pub use document::{Document, DocumentUpdate, NewDocument};
pub use error::{Error, ErrorKind, Result, StorageError, UpstreamError};
pub use event::{Event, EventHub, EventType, Subscription, session_key};
pub use job::{Job, JobPublic, JobStatus, JobType, NewJob};
pub use plugin::PluginInvoker;
pub use session::{NewSession, NewStep, Session, SessionStep, StepType, StreamStatus, WorkflowStatus};
pub use store::{DocumentStore, JobStore, SessionStore};
pub use tokio_util::sync::CancellationToken;

//! Streaming execution and agent workflows.
//!
//! - [`StreamingExecutor`] streams one AI completion into a session step,
//!   checkpointing partial content and honoring cancellation.
//! - [`AgentWriter`] drives multi-chapter generation on top of the same
//!   streaming pump, with persisted state for resume.
//! - [`FunctionCallingLoop`] alternates model turns with tool calls that run
//!   as jobs on the [`inkwell_workflow::JobEngine`].

pub mod checkpoint;
pub mod function_calling;
pub mod streaming;
pub mod writer;

pub use checkpoint::{CheckpointPolicy, StreamAccumulator};
pub use function_calling::{
    DEFAULT_MAX_TURNS, FinishReason, FunctionCallingLoop, LoopOutcome, LoopRequest, ToolBinding,
};
pub use streaming::{PreparedStream, StreamHandle, StreamRequest, StreamingExecutor};
pub use writer::{AgentWriter, ChapterPlan, PreparedRun, WORKFLOW_TYPE, WriterConfig, WriterHandle, WriterRequest};

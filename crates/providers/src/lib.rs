//! HTTP collaborators for inkwell.
//!
//! - [`HttpAiClient`] implements `AiClient` (blocking and SSE streaming)
//! - [`HttpPluginInvoker`] implements `PluginInvoker`
//! - [`OpenAiToolModel`] implements `ToolCallingModel` over chat completions

pub mod extract;
pub mod http_ai;
pub mod plugin;
pub mod tool_model;

pub use extract::{LineBuffer, SseLine, extract_ai_text, parse_sse_line};
pub use http_ai::HttpAiClient;
pub use plugin::HttpPluginInvoker;
pub use tool_model::OpenAiToolModel;

//! Plugin invocation: the collaborator the job worker executes.

use crate::error::UpstreamError;
use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

/// Invokes a method on a user-installed plugin.
///
/// Synchronous from the worker's perspective. Implementations doing long
/// I/O should stop when `cancel` fires.
#[async_trait]
pub trait PluginInvoker: Send + Sync {
    async fn invoke(
        &self,
        cancel: CancellationToken,
        plugin_id: i64,
        method: &str,
        payload: serde_json::Value,
        auth: Option<&str>,
    ) -> std::result::Result<serde_json::Value, UpstreamError>;
}

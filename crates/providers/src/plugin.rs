//! HTTP plugin invoker.
//!
//! Plugins are external HTTP services. An invocation POSTs
//! `{"method": ..., "payload": ...}` to the plugin's invoke URL and returns
//! the JSON response body.

use async_trait::async_trait;
use inkwell_config::PluginConfig;
use inkwell_core::error::UpstreamError;
use inkwell_core::plugin::PluginInvoker;
use inkwell_core::CancellationToken;
use std::collections::HashMap;
use std::time::Duration;
use tracing::{debug, info, warn};

/// A [`PluginInvoker`] for plugins registered in configuration.
pub struct HttpPluginInvoker {
    plugins: HashMap<i64, PluginConfig>,
    client: reqwest::Client,
}

impl HttpPluginInvoker {
    pub fn new(plugins: impl IntoIterator<Item = PluginConfig>) -> Self {
        Self {
            plugins: plugins.into_iter().map(|p| (p.id, p)).collect(),
            client: reqwest::Client::new(),
        }
    }

    fn plugin(&self, plugin_id: i64) -> Result<&PluginConfig, UpstreamError> {
        let plugin = self
            .plugins
            .get(&plugin_id)
            .ok_or_else(|| UpstreamError::PluginNotConfigured(format!("plugin {plugin_id} not found")))?;
        if !plugin.enabled {
            return Err(UpstreamError::PluginDisabled(plugin_id));
        }
        if plugin.endpoint.trim().is_empty() {
            return Err(UpstreamError::PluginNotConfigured(format!(
                "plugin {plugin_id} has no endpoint"
            )));
        }
        Ok(plugin)
    }
}

/// Resolve a plugin endpoint to its invoke URL.
///
/// The endpoint must be a full URL; a bare host (empty path or `/`) is
/// invoked at `/invoke`.
pub fn invoke_url(endpoint: &str) -> Result<reqwest::Url, UpstreamError> {
    let mut url = reqwest::Url::parse(endpoint.trim())
        .map_err(|e| UpstreamError::PluginNotConfigured(format!("invalid plugin endpoint: {e}")))?;
    if url.host_str().is_none_or(str::is_empty) {
        return Err(UpstreamError::PluginNotConfigured(
            "plugin endpoint must be a full URL (e.g. http://127.0.0.1:9000)".into(),
        ));
    }
    if url.path().is_empty() || url.path() == "/" {
        url.set_path("/invoke");
    }
    Ok(url)
}

#[async_trait]
impl PluginInvoker for HttpPluginInvoker {
    async fn invoke(
        &self,
        cancel: CancellationToken,
        plugin_id: i64,
        method: &str,
        payload: serde_json::Value,
        auth: Option<&str>,
    ) -> Result<serde_json::Value, UpstreamError> {
        let plugin = self.plugin(plugin_id)?;
        let url = invoke_url(&plugin.endpoint)?;

        let mut request = self
            .client
            .post(url.clone())
            .timeout(Duration::from_secs(plugin.timeout_secs))
            .json(&serde_json::json!({ "method": method, "payload": payload }));
        if let Some(auth) = auth.filter(|a| !a.is_empty()) {
            request = request.header("Authorization", auth);
        }

        debug!(plugin_id, plugin = %plugin.name, method, url = %url, "Invoking plugin");

        let response = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                info!(plugin_id, method, "Plugin invocation cancelled");
                return Err(UpstreamError::Other("plugin invocation cancelled".into()));
            }
            sent = request.send() => sent.map_err(|e| {
                if e.is_timeout() {
                    UpstreamError::Timeout(format!("plugin {plugin_id}: {e}"))
                } else {
                    UpstreamError::Network(format!("plugin {plugin_id}: {e}"))
                }
            })?,
        };

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| UpstreamError::Network(e.to_string()))?;
        if !status.is_success() {
            warn!(plugin_id, status = status.as_u16(), "Plugin returned an error");
            return Err(UpstreamError::Status {
                status_code: status.as_u16(),
                body,
            });
        }

        Ok(serde_json::from_str(&body).unwrap_or(serde_json::Value::String(body)))
    }
}

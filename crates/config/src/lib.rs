//! Configuration loading, validation, and management for inkwell.
//!
//! Loads configuration from `~/.inkwell/config.toml` with environment
//! variable overrides. Validates all settings at startup.

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};

/// The root configuration structure.
///
/// Maps directly to `~/.inkwell/config.toml`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    /// Where jobs, sessions and documents are persisted
    #[serde(default)]
    pub storage: StorageConfig,

    /// Job engine settings
    #[serde(default)]
    pub engine: EngineConfig,

    /// Streaming checkpoint settings
    #[serde(default)]
    pub streaming: StreamingConfig,

    /// Event hub settings
    #[serde(default)]
    pub hub: HubConfig,

    /// Function-calling loop settings
    #[serde(default)]
    pub function_calling: FunctionCallingConfig,

    /// AI provider endpoints, keyed by provider name
    #[serde(default)]
    pub providers: HashMap<String, ProviderConfig>,

    /// Installed plugins
    #[serde(default)]
    pub plugins: Vec<PluginConfig>,

    /// Tools exposed to the function-calling loop
    #[serde(default)]
    pub tools: Vec<ToolConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// "sqlite" or "memory"
    #[serde(default = "default_storage_backend")]
    pub backend: String,

    /// SQLite database file
    #[serde(default = "default_storage_path")]
    pub path: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: default_storage_backend(),
            path: default_storage_path(),
        }
    }
}

fn default_storage_backend() -> String {
    "sqlite".into()
}
fn default_storage_path() -> String {
    AppConfig::config_dir()
        .join("inkwell.db")
        .to_string_lossy()
        .into_owned()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Capacity of the job submission queue
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,

    /// How often persisted queued jobs are re-enqueued (0 disables)
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,

    /// How long a tool call waits for its job
    #[serde(default = "default_tool_job_timeout")]
    pub tool_job_timeout_secs: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            queue_capacity: default_queue_capacity(),
            sweep_interval_secs: default_sweep_interval(),
            tool_job_timeout_secs: default_tool_job_timeout(),
        }
    }
}

fn default_queue_capacity() -> usize {
    1000
}
fn default_sweep_interval() -> u64 {
    30
}
fn default_tool_job_timeout() -> u64 {
    300
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamingConfig {
    /// Checkpoint after this many chunks
    #[serde(default = "default_checkpoint_chunks")]
    pub checkpoint_every_chunks: usize,

    /// ...or after this much time, whichever comes first
    #[serde(default = "default_checkpoint_interval")]
    pub checkpoint_interval_ms: u64,

    /// Default deadline for generic streams
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,
}

impl Default for StreamingConfig {
    fn default() -> Self {
        Self {
            checkpoint_every_chunks: default_checkpoint_chunks(),
            checkpoint_interval_ms: default_checkpoint_interval(),
            timeout_secs: None,
        }
    }
}

fn default_checkpoint_chunks() -> usize {
    10
}
fn default_checkpoint_interval() -> u64 {
    2000
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HubConfig {
    /// Events buffered per subscriber before drops start
    #[serde(default = "default_client_buffer")]
    pub client_buffer: usize,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            client_buffer: default_client_buffer(),
        }
    }
}

fn default_client_buffer() -> usize {
    100
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FunctionCallingConfig {
    #[serde(default = "default_max_turns")]
    pub max_turns: usize,
}

impl Default for FunctionCallingConfig {
    fn default() -> Self {
        Self {
            max_turns: default_max_turns(),
        }
    }
}

fn default_max_turns() -> usize {
    5
}

#[derive(Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    pub base_url: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_model: Option<String>,
}

impl std::fmt::Debug for ProviderConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderConfig")
            .field("base_url", &self.base_url)
            .field("api_key", &redact(&self.api_key))
            .field("default_model", &self.default_model)
            .finish()
    }
}

/// Redact a secret for Debug output.
fn redact(s: &Option<String>) -> &'static str {
    match s {
        Some(_) => "[REDACTED]",
        None => "None",
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PluginConfig {
    pub id: i64,
    pub name: String,

    /// Full URL; a bare host is invoked at `/invoke`
    #[serde(default)]
    pub endpoint: String,

    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default = "default_plugin_timeout")]
    pub timeout_secs: u64,
}

fn default_true() -> bool {
    true
}
fn default_plugin_timeout() -> u64 {
    30
}

/// Binds a tool name the model can call to a plugin method.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolConfig {
    pub name: String,

    #[serde(default)]
    pub description: String,

    pub plugin_id: i64,

    /// Plugin method; defaults to the tool name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,

    /// JSON Schema of the arguments
    #[serde(default = "default_tool_parameters")]
    pub parameters: serde_json::Value,
}

fn default_tool_parameters() -> serde_json::Value {
    serde_json::json!({ "type": "object" })
}

impl AppConfig {
    /// Load configuration from the default path (~/.inkwell/config.toml).
    ///
    /// Environment overrides:
    /// - `INKWELL_STORAGE` / `INKWELL_DB_PATH`
    /// - `INKWELL_QUEUE_CAPACITY`
    /// - `INKWELL_<PROVIDER>_API_KEY` for providers without a key
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_with_env(&Self::config_path())
    }

    /// Load `path`, then apply the same environment overrides as [`load`](Self::load).
    pub fn load_with_env(path: &Path) -> Result<Self, ConfigError> {
        let mut config = Self::load_from(path)?;
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a specific file path.
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            tracing::info!("No config file found at {}, using defaults", path.display());
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadError {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;

        let config: Self = toml::from_str(&content).map_err(|e| ConfigError::ParseError {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;

        config.validate()?;
        Ok(config)
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(backend) = std::env::var("INKWELL_STORAGE") {
            self.storage.backend = backend;
        }
        if let Ok(path) = std::env::var("INKWELL_DB_PATH") {
            self.storage.path = path;
        }
        if let Some(capacity) = std::env::var("INKWELL_QUEUE_CAPACITY")
            .ok()
            .and_then(|v| v.parse().ok())
        {
            self.engine.queue_capacity = capacity;
        }
        for (name, provider) in self.providers.iter_mut() {
            if provider.api_key.is_none() {
                let var = format!("INKWELL_{}_API_KEY", name.to_uppercase().replace('-', "_"));
                provider.api_key = std::env::var(var).ok();
            }
        }
    }

    /// Get the configuration directory path.
    pub fn config_dir() -> PathBuf {
        dirs_home().join(".inkwell")
    }

    /// The default config file, `~/.inkwell/config.toml`.
    pub fn config_path() -> PathBuf {
        Self::config_dir().join("config.toml")
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !matches!(self.storage.backend.as_str(), "sqlite" | "memory") {
            return Err(ConfigError::ValidationError(format!(
                "unknown storage backend '{}' (expected sqlite or memory)",
                self.storage.backend
            )));
        }
        if self.engine.queue_capacity == 0 {
            return Err(ConfigError::ValidationError(
                "engine.queue_capacity must be > 0".into(),
            ));
        }
        if self.hub.client_buffer == 0 {
            return Err(ConfigError::ValidationError(
                "hub.client_buffer must be > 0".into(),
            ));
        }
        if self.function_calling.max_turns == 0 {
            return Err(ConfigError::ValidationError(
                "function_calling.max_turns must be > 0".into(),
            ));
        }
        if self.streaming.checkpoint_every_chunks == 0 {
            return Err(ConfigError::ValidationError(
                "streaming.checkpoint_every_chunks must be > 0".into(),
            ));
        }

        let mut plugin_ids = HashSet::new();
        for plugin in &self.plugins {
            if !plugin_ids.insert(plugin.id) {
                return Err(ConfigError::ValidationError(format!(
                    "duplicate plugin id {}",
                    plugin.id
                )));
            }
        }
        if let Some(tool) = self.tools.iter().find(|t| !plugin_ids.contains(&t.plugin_id)) {
            return Err(ConfigError::ValidationError(format!(
                "tool '{}' is bound to unknown plugin {}",
                tool.name, tool.plugin_id
            )));
        }

        Ok(())
    }

    /// Generate a default config TOML string (for `config init`).
    pub fn default_toml() -> String {
        let config = Self::default();
        toml::to_string_pretty(&config).unwrap_or_default()
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            storage: StorageConfig::default(),
            engine: EngineConfig::default(),
            streaming: StreamingConfig::default(),
            hub: HubConfig::default(),
            function_calling: FunctionCallingConfig::default(),
            providers: HashMap::new(),
            plugins: Vec::new(),
            tools: Vec::new(),
        }
    }
}

/// Get the user's home directory.
fn dirs_home() -> PathBuf {
    #[cfg(target_os = "windows")]
    {
        std::env::var("USERPROFILE")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("C:\\Users\\Default"))
    }
    #[cfg(not(target_os = "windows"))]
    {
        std::env::var("HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("/tmp"))
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file at {path}: {reason}")]
    ReadError { path: PathBuf, reason: String },

    #[error("Failed to parse config file at {path}: {reason}")]
    ParseError { path: PathBuf, reason: String },

    #[error("Configuration validation failed: {0}")]
    ValidationError(String),
}

//! Error types for the inkwell domain.
//!
//! Uses `thiserror` for ergonomic error definitions.
//! Upstream collaborators and storage each have their own error enum,
//! folded into the top-level [`Error`] via `#[from]`.

use thiserror::Error;

/// The top-level error type for all inkwell operations.
#[derive(Debug, Error)]
pub enum Error {
    // --- Request shape ---
    #[error("Validation error: {0}")]
    Validation(String),

    // --- Lookup / ownership ---
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Access denied: {0}")]
    AccessDenied(String),

    // --- AI provider / plugin errors ---
    #[error("Upstream error: {0}")]
    Upstream(#[from] UpstreamError),

    // --- Cooperative cancellation ---
    #[error("Cancelled: {0}")]
    Cancelled(String),

    // --- Storage errors ---
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    // --- Serialization ---
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    // --- Generic ---
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Result type alias using our Error.
pub type Result<T> = std::result::Result<T, Error>;

/// Coarse classification of an [`Error`], stable across variants.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Validation,
    NotFound,
    AccessDenied,
    Upstream,
    Cancelled,
    Internal,
}

impl Error {
    /// Classify this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Validation(_) => ErrorKind::Validation,
            Error::NotFound(_) => ErrorKind::NotFound,
            Error::AccessDenied(_) => ErrorKind::AccessDenied,
            Error::Upstream(_) => ErrorKind::Upstream,
            Error::Cancelled(_) => ErrorKind::Cancelled,
            Error::Storage(StorageError::NotFound(_)) => ErrorKind::NotFound,
            Error::Storage(_) | Error::Serialization(_) | Error::Internal(_) => {
                ErrorKind::Internal
            }
        }
    }

    pub fn validation(msg: impl Into<String>) -> Self {
        Error::Validation(msg.into())
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Error::NotFound(msg.into())
    }

    pub fn access_denied(msg: impl Into<String>) -> Self {
        Error::AccessDenied(msg.into())
    }
}

// --- Bounded context errors ---

#[derive(Debug, Clone, Error)]
pub enum UpstreamError {
    #[error("request failed with status {status_code}: {body}")]
    Status { status_code: u16, body: String },

    #[error("network error: {0}")]
    Network(String),

    #[error("request timed out: {0}")]
    Timeout(String),

    #[error("invalid request path: {0}")]
    InvalidPath(String),

    #[error("provider not configured: {0}")]
    ProviderNotConfigured(String),

    #[error("plugin not configured: {0}")]
    PluginNotConfigured(String),

    #[error("plugin {0} is disabled")]
    PluginDisabled(i64),

    #[error("stream interrupted: {0}")]
    StreamInterrupted(String),

    #[error("invalid response: {0}")]
    InvalidResponse(String),

    #[error("all {0} tool calls failed")]
    AllToolCallsFailed(usize),

    #[error("{0}")]
    Other(String),
}

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Query failed: {0}")]
    QueryFailed(String),

    #[error("Migration failed: {0}")]
    MigrationFailed(String),

    #[error("Record not found: {0}")]
    NotFound(String),

    #[error("Conflict: {0}")]
    Conflict(String),
}

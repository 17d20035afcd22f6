//! Error types for opsflow.
//!
//! Every variant carries a stable machine code and an HTTP status so the
//! administrative surface can report failures without leaking internals.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result type alias for opsflow operations.
pub type Result<T> = std::result::Result<T, Error>;

/// opsflow error types.
#[derive(Error, Debug)]
pub enum Error {
    /// Bad workflow definition or trigger parameters. Raised before any
    /// execution is persisted.
    #[error("Validation error: {0}")]
    Validation(String),

    /// Tenant or role mismatch at a trigger boundary.
    #[error("Permission denied: {0}")]
    Permission(String),

    /// An action executor failed.
    #[error("Action error: {0}")]
    Action(String),

    /// A step or the whole run exceeded its wall-clock limit.
    #[error("Timeout: {0}")]
    Timeout(String),

    /// Sub-workflow recursion exceeded the depth limit or formed a cycle.
    #[error("Cycle detected: {0}")]
    Cycle(String),

    #[error("Not found: {0}")]
    NotFound(String),

    /// Operation not valid for the current execution state.
    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Machine-readable error code.
    pub fn code(&self) -> &'static str {
        match self {
            Error::Validation(_) => "VALIDATION_ERROR",
            Error::Permission(_) => "PERMISSION_ERROR",
            Error::Action(_) => "ACTION_ERROR",
            Error::Timeout(_) => "TIMEOUT_ERROR",
            Error::Cycle(_) => "CYCLE_ERROR",
            Error::NotFound(_) => "NOT_FOUND",
            Error::InvalidState(_) => "INVALID_STATE",
            Error::Storage(_) => "STORAGE_ERROR",
            Error::Config(_) => "CONFIG_ERROR",
            Error::Internal(_) => "INTERNAL_ERROR",
            Error::Http(_) => "HTTP_ERROR",
            Error::Database(_) => "DATABASE_ERROR",
            Error::Yaml(_) => "YAML_ERROR",
            Error::Json(_) => "JSON_ERROR",
            Error::Io(_) => "IO_ERROR",
        }
    }

    /// HTTP status code mapping for the administrative API.
    pub fn http_status(&self) -> u16 {
        match self {
            Error::Validation(_) | Error::Yaml(_) | Error::Json(_) => 400,
            Error::Permission(_) => 403,
            Error::NotFound(_) => 404,
            Error::InvalidState(_) => 409,
            Error::Cycle(_) => 422,
            Error::Timeout(_) => 504,
            Error::Action(_) | Error::Http(_) => 502,
            Error::Storage(_)
            | Error::Config(_)
            | Error::Internal(_)
            | Error::Database(_)
            | Error::Io(_) => 500,
        }
    }

    /// Whether the engine may retry the failing operation.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::Action(_) | Error::Timeout(_) | Error::Http(_))
    }

    /// Get a sanitized error message safe for external consumers.
    ///
    /// Hides file paths, SQL statements and connection details.
    pub fn external_message(&self) -> String {
        match self {
            Error::Validation(msg) => format!("Validation error: {}", msg),
            Error::Permission(msg) => format!("Permission denied: {}", msg),
            Error::Action(msg) => format!("Action error: {}", msg),
            Error::Timeout(msg) => format!("Timeout: {}", msg),
            Error::Cycle(msg) => format!("Cycle detected: {}", msg),
            Error::NotFound(msg) => format!("Not found: {}", msg),
            Error::InvalidState(msg) => format!("Invalid state: {}", msg),
            Error::Config(msg) => format!("Configuration error: {}", msg),

            Error::Storage(_) => "A storage error occurred".to_string(),
            Error::Internal(_) => "An internal error occurred".to_string(),
            Error::Database(_) => "A database error occurred".to_string(),
            Error::Io(_) => "An I/O error occurred".to_string(),

            Error::Http(e) => {
                if let Some(status) = e.status() {
                    format!("HTTP request failed with status {}", status.as_u16())
                } else if e.is_timeout() {
                    "HTTP request timed out".to_string()
                } else if e.is_connect() {
                    "Failed to connect to remote server".to_string()
                } else {
                    "HTTP request failed".to_string()
                }
            }

            Error::Yaml(_) => "Invalid YAML format".to_string(),
            Error::Json(_) => "Invalid JSON format".to_string(),
        }
    }

    /// Convert to a JSON body with the sanitized message.
    pub fn to_external_json(&self) -> serde_json::Value {
        serde_json::to_value(ErrorResponse::new(self.code(), &self.external_message()))
            .unwrap_or_else(|_| serde_json::json!({ "code": self.code() }))
    }
}

/// Error body returned by the administrative API.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub code: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub node_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub execution_id: Option<String>,
}

impl ErrorResponse {
    pub fn new(code: &str, message: &str) -> Self {
        Self {
            code: code.to_string(),
            message: message.to_string(),
            node_id: None,
            execution_id: None,
        }
    }

    pub fn with_node(mut self, node_id: &str) -> Self {
        self.node_id = Some(node_id.to_string());
        self
    }

    pub fn with_execution(mut self, execution_id: &str) -> Self {
        self.execution_id = Some(execution_id.to_string());
        self
    }
}

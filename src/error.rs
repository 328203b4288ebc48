//! Error types for the FCP operator
//!
//! Provides structured error types for the range codec, the hardware
//! device parser, the FCP pool manager, the volume orchestrator and the
//! remote gateway adapter.

use thiserror::Error;

/// Unified error type for the operator
#[derive(Error, Debug)]
pub enum Error {
    // =========================================================================
    // Input Errors
    // =========================================================================
    #[error("Invalid format for '{input}': {reason}")]
    InvalidFormat { input: String, reason: String },

    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),

    #[error("Conflict: {reason}")]
    Conflict { reason: String },

    // =========================================================================
    // Template Errors
    // =========================================================================
    #[error("No default FCP template found{}", storage_provider.as_ref().map(|sp| format!(" for storage provider {}", sp)).unwrap_or_default())]
    NoDefaultTemplate { storage_provider: Option<String> },

    #[error("FCP template not found: {template_id}")]
    TemplateNotFound { template_id: String },

    // =========================================================================
    // Device / Guest Errors
    // =========================================================================
    #[error("FCP device not found: {fcp_id}")]
    DeviceNotFound { fcp_id: String },

    #[error("Guest not found: {userid}")]
    GuestNotFound { userid: String },

    // =========================================================================
    // Orchestration Errors
    // =========================================================================
    #[error("{operation} failed: {reason} (devices: {fcp_ids:?}, rolled back: {rolled_back:?})")]
    Operation {
        operation: String,
        reason: String,
        fcp_ids: Vec<String>,
        rolled_back: Vec<String>,
    },

    #[error("{operation} failed and rollback was incomplete: {reason}; rollback errors: {rollback_errors:?}")]
    RollbackFailed {
        operation: String,
        reason: String,
        rollback_errors: Vec<String>,
    },

    // =========================================================================
    // Internal Errors
    // =========================================================================
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    // =========================================================================
    // Remote Gateway Errors
    // =========================================================================
    #[error("Gateway connection error: {0}")]
    RemoteConnection(#[from] reqwest::Error),

    #[error("Gateway returned {status} for {endpoint}: {body}")]
    RemoteStatus {
        endpoint: String,
        status: u16,
        body: String,
    },

    // =========================================================================
    // Parse / IO Errors
    // =========================================================================
    #[error("JSON parse error: {0}")]
    JsonParse(#[from] serde_json::Error),

    #[error("YAML parse error: {0}")]
    YamlParse(#[from] serde_yaml::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Build an `Operation` error for a step that had nothing to roll back
    pub fn operation(operation: impl Into<String>, reason: impl ToString) -> Self {
        Error::Operation {
            operation: operation.into(),
            reason: reason.to_string(),
            fcp_ids: Vec::new(),
            rolled_back: Vec::new(),
        }
    }

    /// Build a `Conflict` error
    pub fn conflict(reason: impl Into<String>) -> Self {
        Error::Conflict {
            reason: reason.into(),
        }
    }

    /// Check if this error is transient
    pub fn is_transient(&self) -> bool {
        match self {
            Error::RemoteConnection(e) => e.is_connect() || e.is_timeout(),
            Error::RemoteStatus { status, .. } => *status >= 500,
            _ => false,
        }
    }

    /// Check if this error is retryable by the caller
    ///
    /// A failed rollback always needs manual intervention.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::RollbackFailed { .. } => false,
            Error::RemoteConnection(_) => true,
            _ => self.is_transient(),
        }
    }

    /// Stable tag used in API error payloads
    pub fn code(&self) -> &'static str {
        match self {
            Error::InvalidFormat { .. } => "invalid_format",
            Error::InvalidParameter(_) => "invalid_parameter",
            Error::Conflict { .. } => "conflict",
            Error::NoDefaultTemplate { .. } => "no_default_template",
            Error::TemplateNotFound { .. } => "template_not_found",
            Error::DeviceNotFound { .. } => "device_not_found",
            Error::GuestNotFound { .. } => "guest_not_found",
            Error::Operation { .. } => "operation_error",
            Error::RollbackFailed { .. } => "rollback_failed",
            Error::Internal(_) => "internal_error",
            Error::Configuration(_) => "configuration_error",
            Error::RemoteConnection(_) | Error::RemoteStatus { .. } => "gateway_error",
            Error::JsonParse(_) | Error::YamlParse(_) | Error::Io(_) => "internal_error",
        }
    }

    /// HTTP status code for this error
    pub fn status_code(&self) -> u16 {
        match self {
            Error::InvalidFormat { .. } | Error::InvalidParameter(_) => 400,
            Error::Conflict { .. } => 409,
            Error::NoDefaultTemplate { .. }
            | Error::TemplateNotFound { .. }
            | Error::DeviceNotFound { .. }
            | Error::GuestNotFound { .. } => 404,
            Error::RemoteConnection(_) | Error::RemoteStatus { .. } => 502,
            _ => 500,
        }
    }
}

/// Result type alias for the operator
pub type Result<T> = std::result::Result<T, Error>;

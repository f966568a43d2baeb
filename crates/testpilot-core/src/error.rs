//! Error taxonomy shared by the worker and the front-end.

use thiserror::Error;

/// Missing or unreadable configuration. Never retried.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Missing required configuration: {0}")]
    Missing(&'static str),

    #[error("Invalid configuration for {field}: {reason}")]
    Invalid { field: &'static str, reason: String },

    #[error("Failed to read configuration file {path}: {reason}")]
    Unreadable { path: String, reason: String },
}

/// An external collaborator (embedding service, similarity store, generative
/// backend) could not be reached or answered with an error.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ServiceError {
    #[error("{service} request failed: {reason}")]
    Request { service: &'static str, reason: String },

    #[error("{service} returned status {status}: {body}")]
    Status {
        service: &'static str,
        status: u16,
        body: String,
    },

    #[error("{service} returned an unexpected payload: {reason}")]
    Decode { service: &'static str, reason: String },

    #[error("{service} timed out after {secs}s")]
    Timeout { service: &'static str, secs: u64 },

    #[error("Similarity store error: {0}")]
    Store(String),
}

impl ServiceError {
    pub(crate) fn from_reqwest(service: &'static str, secs: u64, err: reqwest::Error) -> Self {
        if err.is_timeout() {
            ServiceError::Timeout { service, secs }
        } else if err.is_decode() {
            ServiceError::Decode {
                service,
                reason: err.to_string(),
            }
        } else {
            ServiceError::Request {
                service,
                reason: err.to_string(),
            }
        }
    }
}

impl From<rusqlite::Error> for ServiceError {
    fn from(err: rusqlite::Error) -> Self {
        ServiceError::Store(err.to_string())
    }
}

/// Failure of a single tool invocation.
#[derive(Error, Debug)]
pub enum ToolError {
    #[error("Unknown tool: {0}")]
    UnknownTool(String),

    #[error("Invalid arguments for {tool}: {reason}")]
    InvalidArguments { tool: String, reason: String },

    #[error("{0}")]
    Validation(String),

    #[error(transparent)]
    Configuration(#[from] ConfigError),

    #[error(transparent)]
    Service(#[from] ServiceError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl ToolError {
    /// Short label used as the `details` field of error envelopes.
    pub fn kind(&self) -> &'static str {
        match self {
            ToolError::UnknownTool(_) | ToolError::InvalidArguments { .. } => "invalid_request",
            ToolError::Validation(_) => "validation",
            ToolError::Configuration(_) => "configuration",
            ToolError::Service(_) => "service",
            ToolError::Io(_) => "io",
            ToolError::Internal(_) => "internal",
        }
    }
}

/// The worker's output stream ended or failed. Fatal to the session.
#[derive(Error, Debug)]
pub enum StreamError {
    #[error("agent stream closed unexpectedly")]
    Closed,

    #[error("agent stream error: {0}")]
    Io(#[from] std::io::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tool_error_kinds() {
        assert_eq!(ToolError::Validation("x".into()).kind(), "validation");
        assert_eq!(
            ToolError::from(ConfigError::Missing("embedding_url")).kind(),
            "configuration"
        );
        assert_eq!(
            ToolError::from(ServiceError::Store("locked".into())).kind(),
            "service"
        );
        assert_eq!(ToolError::Internal("join".into()).kind(), "internal");
    }

    #[test]
    fn test_messages_are_human_readable() {
        let err = ConfigError::Missing("TESTPILOT_EMBEDDING_URL");
        assert_eq!(
            err.to_string(),
            "Missing required configuration: TESTPILOT_EMBEDDING_URL"
        );
        assert_eq!(StreamError::Closed.to_string(), "agent stream closed unexpectedly");
    }
}

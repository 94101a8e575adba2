//! Error types for eduflow.
//!
//! Every variant carries a stable code so execution logs and API clients
//! can classify failures without parsing messages.

use thiserror::Error;

/// Result type alias for eduflow operations.
pub type Result<T> = std::result::Result<T, Error>;

/// eduflow error types.
#[derive(Error, Debug)]
pub enum Error {
    /// Malformed expression or unresolvable reference.
    #[error("Expression error: {0}")]
    Expression(String),

    /// An idempotency context field was absent and `fail_on_missing_context` is set.
    #[error("Missing context field: {0}")]
    MissingContext(String),

    /// Routing resolved to a node id that does not exist.
    #[error("Routing error: {0}")]
    Routing(String),

    /// Failure raised inside an action handler.
    #[error("Handler error: {0}")]
    Handler(String),

    /// Unrecoverable failure while executing a non-action node.
    #[error("Execution failed: {0}")]
    ExecutionFatal(String),

    #[error("Workflow error: {0}")]
    Workflow(String),

    #[error("Node error: {0}")]
    Node(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Validation error: {0}")]
    Validation(String),

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
    /// Stable machine-readable code, also stored as a log row's `error_type`.
    pub fn code(&self) -> &'static str {
        match self {
            Error::Expression(_) => "EXPRESSION_ERROR",
            Error::MissingContext(_) => "MISSING_CONTEXT",
            Error::Routing(_) => "ROUTING_ERROR",
            Error::Handler(_) => "HANDLER_ERROR",
            Error::ExecutionFatal(_) => "EXECUTION_FATAL",
            Error::Workflow(_) => "WORKFLOW_ERROR",
            Error::Node(_) => "NODE_ERROR",
            Error::Storage(_) => "STORAGE_ERROR",
            Error::Config(_) => "CONFIG_ERROR",
            Error::Parse(_) => "PARSE_ERROR",
            Error::Validation(_) => "VALIDATION_ERROR",
            Error::Internal(_) => "INTERNAL_ERROR",
            Error::Http(_) => "HTTP_ERROR",
            Error::Database(_) => "DATABASE_ERROR",
            Error::Yaml(_) => "YAML_ERROR",
            Error::Json(_) => "JSON_ERROR",
            Error::Io(_) => "IO_ERROR",
        }
    }

    /// Whether this error terminates the whole execution when raised by a node.
    ///
    /// Handler errors are reported as data by action-style nodes; everything
    /// else that escapes a node ends the walk.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, Error::Handler(_))
    }

    /// Get a sanitized error message safe for external consumers.
    ///
    /// Storage, IO and database details (paths, SQL) are hidden.
    pub fn external_message(&self) -> String {
        match self {
            Error::Expression(msg) => format!("Expression error: {}", msg),
            Error::MissingContext(msg) => format!("Missing context field: {}", msg),
            Error::Routing(msg) => format!("Routing error: {}", msg),
            Error::Handler(msg) => format!("Handler error: {}", msg),
            Error::ExecutionFatal(msg) => format!("Execution failed: {}", msg),
            Error::Workflow(msg) => format!("Workflow error: {}", msg),
            Error::Node(msg) => format!("Node error: {}", msg),
            Error::Config(msg) => format!("Configuration error: {}", msg),
            Error::Parse(msg) => format!("Parse error: {}", msg),
            Error::Validation(msg) => format!("Validation error: {}", msg),

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

    /// Sanitized JSON body for external consumers.
    pub fn to_external_json(&self) -> serde_json::Value {
        serde_json::json!({
            "success": false,
            "error": {
                "code": self.code(),
                "message": self.external_message(),
            }
        })
    }

    /// JSON body including the full error message. Internal use only.
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::json!({
            "success": false,
            "error": {
                "code": self.code(),
                "message": self.to_string(),
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_taxonomy_codes() {
        assert_eq!(Error::Expression("x".into()).code(), "EXPRESSION_ERROR");
        assert_eq!(Error::MissingContext("x".into()).code(), "MISSING_CONTEXT");
        assert_eq!(Error::Routing("x".into()).code(), "ROUTING_ERROR");
        assert_eq!(Error::Handler("x".into()).code(), "HANDLER_ERROR");
        assert_eq!(Error::ExecutionFatal("x".into()).code(), "EXECUTION_FATAL");
    }

    #[test]
    fn test_only_handler_errors_are_recoverable() {
        assert!(!Error::Handler("smtp down".into()).is_fatal());
        assert!(Error::Routing("missing".into()).is_fatal());
        assert!(Error::Expression("bad".into()).is_fatal());
    }

    #[test]
    fn test_external_message_hides_storage_details() {
        let err = Error::Storage("/var/lib/eduflow/eduflow.db is locked".into());
        assert!(!err.external_message().contains("/var/lib"));

        let json = err.to_external_json();
        assert_eq!(json["success"], false);
        assert_eq!(json["error"]["code"], "STORAGE_ERROR");
    }
}

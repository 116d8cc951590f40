//! Flat error payload for the UI layer.

use serde::{Deserialize, Serialize};

use crate::error::RampartError;

/// Error category for frontend handling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub enum ErrorKind {
    MissingParameter,
    InvalidIdentifier,
    InvalidRequest,
    ConnectionRefused,
    TunnelFailure,
    SchemaQueryFailed,
    QueryExecutionFailed,
    NotFound,
    Internal,
}

/// Structured error response for frontend display.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorResponse {
    /// Error category
    pub kind: ErrorKind,
    /// Human-readable error message; the engine's own text for SQL failures
    pub message: String,
    /// Additional technical detail
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    /// Actionable suggestion for resolution
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hint: Option<String>,
    /// Character position in SQL (for syntax errors)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub position: Option<u32>,
    /// PostgreSQL error code (e.g., "42P01")
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
}

impl ErrorResponse {
    /// Create a simple error response with just a message
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self { kind, message: message.into(), detail: None, hint: None, position: None, code: None }
    }

    fn with_hint(mut self, hint: Option<String>) -> Self {
        self.hint = hint;
        self
    }
}

impl From<RampartError> for ErrorResponse {
    fn from(err: RampartError) -> Self {
        let hint = err.hint().map(String::from);
        let message = err.to_string();
        match err {
            RampartError::QueryExecutionFailed { message, code, position, hint, detail } => {
                ErrorResponse { kind: ErrorKind::QueryExecutionFailed, message, detail, hint, position, code }
            }
            RampartError::SchemaQueryFailed { message, code } => ErrorResponse {
                code,
                ..ErrorResponse::new(ErrorKind::SchemaQueryFailed, message).with_hint(hint)
            },
            RampartError::MissingParameter { .. } => {
                ErrorResponse::new(ErrorKind::MissingParameter, message).with_hint(hint)
            }
            RampartError::InvalidIdentifier { .. } => {
                ErrorResponse::new(ErrorKind::InvalidIdentifier, message).with_hint(hint)
            }
            RampartError::InvalidRequest { .. } => {
                ErrorResponse::new(ErrorKind::InvalidRequest, message).with_hint(hint)
            }
            RampartError::ConnectionRefused { .. } => {
                ErrorResponse::new(ErrorKind::ConnectionRefused, message).with_hint(hint)
            }
            RampartError::TunnelFailure { source } => ErrorResponse {
                detail: Some(source.kind().to_string()),
                ..ErrorResponse::new(ErrorKind::TunnelFailure, message).with_hint(hint)
            },
            RampartError::NotFound { .. } => {
                ErrorResponse::new(ErrorKind::NotFound, message).with_hint(hint)
            }
            RampartError::Internal(_) => {
                ErrorResponse::new(ErrorKind::Internal, message).with_hint(hint)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::TunnelError;

    #[test]
    fn test_engine_message_is_preserved() {
        let err = RampartError::QueryExecutionFailed {
            message: "insert or update on table \"orders\" violates foreign key constraint".into(),
            code: Some("23503".into()),
            position: None,
            hint: None,
            detail: Some("Key (user_id)=(9) is not present in table \"users\".".into()),
        };
        let resp = ErrorResponse::from(err);
        assert_eq!(resp.kind, ErrorKind::QueryExecutionFailed);
        assert!(resp.message.starts_with("insert or update"));
        assert_eq!(resp.code.as_deref(), Some("23503"));
        assert!(resp.detail.is_some());
    }

    #[test]
    fn test_camel_case_and_skips() {
        let resp = ErrorResponse::from(RampartError::not_found("No rows matched the condition"));
        let json = serde_json::to_value(&resp).unwrap();
        assert_eq!(json["kind"], "NotFound");
        assert!(json.get("hint").is_none());
        assert!(json.get("code").is_none());
    }

    #[test]
    fn test_tunnel_failure_names_the_cause() {
        let resp = ErrorResponse::from(RampartError::from(TunnelError::network("connection reset")));
        assert_eq!(resp.kind, ErrorKind::TunnelFailure);
        assert_eq!(resp.detail.as_deref(), Some("TunnelNetworkError"));
        assert!(resp.message.contains("connection reset"));
    }

    #[test]
    fn test_schema_failure_keeps_code() {
        let resp = ErrorResponse::from(RampartError::SchemaQueryFailed {
            message: "permission denied for table pg_authid".into(),
            code: Some("42501".into()),
        });
        assert_eq!(resp.kind, ErrorKind::SchemaQueryFailed);
        assert_eq!(resp.code.as_deref(), Some("42501"));
        assert!(resp.hint.is_some());
    }
}

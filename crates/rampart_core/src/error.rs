//! Error types for the Rampart core.
//!
//! Every operation surfaces failures as a `RampartError`. The enum is
//! serializable so the UI layer can receive it over IPC unchanged, and it
//! never carries credential material.

use serde::Serialize;

use crate::services::tunnel::TunnelError;

/// Unified error type for all core operations.
#[derive(Debug, thiserror::Error, Serialize)]
#[serde(tag = "kind", content = "data")]
pub enum RampartError {
    /// A required request field was absent or empty.
    #[error("Missing parameter: {parameter}")]
    MissingParameter { parameter: String },

    /// A table, column, role or policy name cannot be used as an identifier.
    #[error("Invalid identifier {identifier:?}: {reason}")]
    InvalidIdentifier { identifier: String, reason: String },

    /// The request is well-formed JSON but semantically unusable.
    #[error("Invalid request: {message}")]
    InvalidRequest {
        message: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        hint: Option<String>,
    },

    /// Network or authentication failure reaching the database.
    #[error("Connection refused: {message}")]
    ConnectionRefused {
        message: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        hint: Option<String>,
    },

    /// Tunnel setup failed (`TunnelAuthError` or `TunnelNetworkError`);
    /// the database connection was not attempted.
    #[error("Tunnel failure: {source}")]
    TunnelFailure {
        #[from]
        source: TunnelError,
    },

    /// A catalog query failed while introspecting the schema.
    #[error("Schema query failed: {message}")]
    SchemaQueryFailed {
        message: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        code: Option<String>,
    },

    /// The engine rejected a statement. `message` is the engine's own text.
    #[error("{message}")]
    QueryExecutionFailed {
        message: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        code: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        position: Option<u32>,
        #[serde(skip_serializing_if = "Option::is_none")]
        hint: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        detail: Option<String>,
    },

    /// A targeted update/delete matched no rows, or a named object is absent.
    #[error("Not found: {message}")]
    NotFound { message: String },

    /// Unexpected internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl RampartError {
    // ========== Constructors ==========

    /// Create a missing parameter error.
    pub fn missing(parameter: impl Into<String>) -> Self {
        Self::MissingParameter { parameter: parameter.into() }
    }

    /// Create an invalid identifier error.
    pub fn invalid_identifier(identifier: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidIdentifier { identifier: identifier.into(), reason: reason.into() }
    }

    /// Create an invalid request error.
    pub fn invalid_request(message: impl Into<String>) -> Self {
        Self::InvalidRequest { message: message.into(), hint: None }
    }

    /// Create an invalid request error with hint.
    pub fn invalid_request_with_hint(message: impl Into<String>, hint: impl Into<String>) -> Self {
        Self::InvalidRequest { message: message.into(), hint: Some(hint.into()) }
    }

    /// Create a connection refused error.
    pub fn connection_refused(message: impl Into<String>) -> Self {
        let message = message.into();
        let hint = Some(generate_connection_hint(&message));
        Self::ConnectionRefused { message, hint }
    }

    /// Create a connection refused error with hint.
    pub fn connection_refused_with_hint(
        message: impl Into<String>,
        hint: impl Into<String>,
    ) -> Self {
        Self::ConnectionRefused { message: message.into(), hint: Some(hint.into()) }
    }

    /// Create a schema query error.
    pub fn schema_query(message: impl Into<String>) -> Self {
        Self::SchemaQueryFailed { message: message.into(), code: None }
    }

    /// Create a query execution error from a bare message.
    pub fn query_failed(message: impl Into<String>) -> Self {
        Self::QueryExecutionFailed {
            message: message.into(),
            code: None,
            position: None,
            hint: None,
            detail: None,
        }
    }

    /// Create a not found error.
    pub fn not_found(message: impl Into<String>) -> Self {
        Self::NotFound { message: message.into() }
    }

    /// Create an internal error.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal(message.into())
    }

    // ========== Conversions ==========

    /// Re-label an error raised while reading system catalogs.
    ///
    /// Engine failures become `SchemaQueryFailed`; connection-level
    /// failures keep their kind.
    pub fn into_schema_error(self) -> Self {
        match self {
            Self::QueryExecutionFailed { message, code, .. } => {
                Self::SchemaQueryFailed { message, code }
            }
            other => other,
        }
    }

    // ========== Accessors ==========

    /// Get the error category name.
    pub fn category(&self) -> &'static str {
        match self {
            Self::MissingParameter { .. } => "MissingParameter",
            Self::InvalidIdentifier { .. } => "InvalidIdentifier",
            Self::InvalidRequest { .. } => "InvalidRequest",
            Self::ConnectionRefused { .. } => "ConnectionRefused",
            Self::TunnelFailure { .. } => "TunnelFailure",
            Self::SchemaQueryFailed { .. } => "SchemaQueryFailed",
            Self::QueryExecutionFailed { .. } => "QueryExecutionFailed",
            Self::NotFound { .. } => "NotFound",
            Self::Internal(_) => "Internal",
        }
    }

    /// Get an actionable hint for the user.
    pub fn hint(&self) -> Option<&str> {
        match self {
            Self::MissingParameter { .. } => Some("Fill in every required field and retry"),
            Self::InvalidIdentifier { .. } => {
                Some("Names must be 1-63 bytes and may not contain NUL characters")
            }
            Self::InvalidRequest { hint, .. } => hint.as_deref(),
            Self::ConnectionRefused { hint, .. } => hint.as_deref(),
            Self::TunnelFailure { source } => Some(source.hint()),
            Self::SchemaQueryFailed { .. } => Some("The catalog query failed; check permissions"),
            Self::QueryExecutionFailed { hint, .. } => hint.as_deref(),
            Self::NotFound { .. } => None,
            Self::Internal(_) => Some("This is an unexpected error. Please report it."),
        }
    }

    /// Get the PostgreSQL SQLSTATE code, if the engine reported one.
    pub fn pg_code(&self) -> Option<&str> {
        match self {
            Self::QueryExecutionFailed { code, .. } | Self::SchemaQueryFailed { code, .. } => {
                code.as_deref()
            }
            _ => None,
        }
    }
}

/// Convert a tokio_postgres error, preserving PostgreSQL error metadata.
impl From<tokio_postgres::Error> for RampartError {
    fn from(err: tokio_postgres::Error) -> Self {
        if let Some(db_err) = err.as_db_error() {
            let code = db_err.code().code();

            // Class 08 (connection exception) and 28 (invalid authorization)
            if code.starts_with("08") || code.starts_with("28") {
                return RampartError::ConnectionRefused {
                    message: db_err.message().to_string(),
                    hint: generate_postgres_hint(code, db_err.hint()),
                };
            }

            return RampartError::QueryExecutionFailed {
                message: db_err.message().to_string(),
                code: Some(code.to_string()),
                position: db_err.position().map(|p| match p {
                    tokio_postgres::error::ErrorPosition::Original(pos) => *pos,
                    tokio_postgres::error::ErrorPosition::Internal { position, .. } => *position,
                }),
                hint: generate_postgres_hint(code, db_err.hint()),
                detail: db_err.detail().map(String::from),
            };
        }

        let message = err.to_string();
        if err.is_closed() || looks_like_connection_failure(&message) {
            RampartError::connection_refused(message)
        } else {
            RampartError::query_failed(message)
        }
    }
}

/// Convert deadpool pool errors (connection creation, timeouts).
impl From<deadpool_postgres::PoolError> for RampartError {
    fn from(err: deadpool_postgres::PoolError) -> Self {
        match err {
            deadpool_postgres::PoolError::Backend(e) => match RampartError::from(e) {
                RampartError::QueryExecutionFailed { message, .. } => {
                    RampartError::connection_refused(message)
                }
                other => other,
            },
            deadpool_postgres::PoolError::Timeout(kind) => RampartError::connection_refused_with_hint(
                format!("Timed out acquiring a connection ({kind:?})"),
                "The server did not answer in time. Check host, port and firewall settings.",
            ),
            other => RampartError::connection_refused(other.to_string()),
        }
    }
}

fn looks_like_connection_failure(message: &str) -> bool {
    let lower = message.to_lowercase();
    lower.contains("connection refused")
        || lower.contains("timeout")
        || lower.contains("timed out")
        || lower.contains("could not connect")
        || lower.contains("error connecting")
}

/// Generate an actionable hint for PostgreSQL error codes.
pub(crate) fn generate_postgres_hint(code: &str, db_hint: Option<&str>) -> Option<String> {
    if let Some(hint) = db_hint {
        return Some(hint.to_string());
    }

    // See: https://www.postgresql.org/docs/current/errcodes-appendix.html
    let hint = match code {
        "08000" | "08003" | "08006" => {
            "Check that the database server is running and accepting connections."
        }
        "08001" => "Unable to connect. Verify host, port, and network connectivity.",
        "08004" => "Connection rejected. Check authentication settings.",
        "28000" => "Invalid authorization. Check username and password.",
        "28P01" => "Password authentication failed. Verify your password is correct.",
        "3D000" => "Database does not exist. Check the database name.",
        "23502" => "A NOT NULL column was left empty.",
        "23503" => "The referenced row or column does not exist.",
        "23505" => "A row with the same unique key already exists.",
        "42601" => "SQL syntax error. Check your query syntax.",
        "42501" => "Permission denied. You may not have access to this object.",
        "42P01" => "Table does not exist. Check the table name and schema.",
        "42P07" => "A table with this name already exists.",
        "42703" => "Column does not exist. Check column names in your query.",
        "42704" => "The named object does not exist.",
        "42710" => "An object with this name already exists.",
        "42830" => "The foreign key must reference a primary key or unique column.",
        "42883" => "Function does not exist. Check the function name and argument types.",
        "53300" => "Too many connections. Try again later or increase max_connections.",
        "57014" => "The statement was cancelled, possibly by statement_timeout.",
        _ => return None,
    };
    Some(hint.to_string())
}

/// Generate an actionable hint for connection errors based on the message.
fn generate_connection_hint(message: &str) -> String {
    let lower = message.to_lowercase();

    if lower.contains("connection refused") {
        "Check that the PostgreSQL server is running and accepting connections on the specified host and port.".to_string()
    } else if lower.contains("timeout") || lower.contains("timed out") {
        "The connection timed out. Check network connectivity and firewall settings.".to_string()
    } else if lower.contains("host not found") || lower.contains("name resolution") {
        "Could not resolve hostname. Check the server address.".to_string()
    } else if lower.contains("ssl") || lower.contains("tls") {
        "SSL/TLS error. Check SSL settings and certificate configuration.".to_string()
    } else if lower.contains("authentication") || lower.contains("password") {
        "Authentication failed. Verify your username and password.".to_string()
    } else {
        "Check server address, port, and network connectivity.".to_string()
    }
}

/// Type alias for Result with RampartError.
pub type RampartResult<T> = Result<T, RampartError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_schema_relabel_keeps_engine_message() {
        let err = RampartError::QueryExecutionFailed {
            message: "relation \"nope\" does not exist".to_string(),
            code: Some("42P01".to_string()),
            position: None,
            hint: None,
            detail: None,
        };
        match err.into_schema_error() {
            RampartError::SchemaQueryFailed { message, code } => {
                assert!(message.contains("nope"));
                assert_eq!(code.as_deref(), Some("42P01"));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_schema_relabel_leaves_connection_errors() {
        let err = RampartError::connection_refused("connection refused").into_schema_error();
        assert_eq!(err.category(), "ConnectionRefused");
    }

    #[test]
    fn test_serialized_shape_is_tagged() {
        let err = RampartError::not_found("no rows matched");
        let json = serde_json::to_value(&err).unwrap();
        assert_eq!(json["kind"], "NotFound");
        assert_eq!(json["data"]["message"], "no rows matched");
    }

    #[test]
    fn test_tunnel_failure_wraps_tunnel_error() {
        let err: RampartError = TunnelError::Auth { message: "denied".into() }.into();
        assert_eq!(err.category(), "TunnelFailure");
        assert!(err.to_string().contains("denied"));
        let json = serde_json::to_value(&err).unwrap();
        assert_eq!(json["kind"], "TunnelFailure");
        assert_eq!(json["data"]["source"]["kind"], "TunnelAuthError");
    }

    #[test]
    fn test_postgres_hints() {
        assert!(generate_postgres_hint("28P01", None).unwrap().contains("Password"));
        assert_eq!(generate_postgres_hint("42P01", Some("custom")).as_deref(), Some("custom"));
        assert!(generate_postgres_hint("XX999", None).is_none());
    }

    #[test]
    fn test_connection_hint_by_message() {
        let err = RampartError::connection_refused("connect timed out");
        assert!(err.hint().unwrap().contains("timed out"));
    }
}

//! Error Handling Infrastructure
//!
//! This module defines all error types used throughout Colloquy.
//! All errors are structured and map to specific error codes for JSON output.
//!
//! # Error Categories
//! - `Validation`: Bad tool arguments or malformed input, recovered per call
//! - `SecurityRejection`: Non-SELECT or unsafe SQL, never executed
//! - `ConnectionFailed`: Database connection errors (credential-free messages)
//! - `QueryFailed`: Query execution errors, classified into friendly kinds
//! - `UnsupportedEngine`: Unknown engine name at the adapter registry
//! - `UpstreamModel`: LLM provider errors (rate limit, auth, transport)
//! - `Config`: Configuration errors

use thiserror::Error;

use crate::security::QueryType;

/// Friendly classification of a failed query, derived from driver error text.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryErrorKind {
    TableNotFound,
    ColumnNotFound,
    PermissionDenied,
    Other,
}

impl QueryErrorKind {
    /// Classify raw driver error text into a friendly kind.
    ///
    /// Matches the substrings the supported engines actually emit; anything
    /// unrecognized falls through to `Other` and keeps the raw message.
    #[must_use]
    pub fn classify(driver_message: &str) -> Self {
        let lower = driver_message.to_lowercase();

        if lower.contains("no such table")
            || lower.contains("invalid object name")
            || ((lower.contains("table") || lower.contains("relation"))
                && (lower.contains("not found")
                    || lower.contains("doesn't exist")
                    || lower.contains("does not exist")))
        {
            Self::TableNotFound
        } else if lower.contains("no such column")
            || lower.contains("unknown column")
            || lower.contains("invalid column")
            || (lower.contains("column") && lower.contains("does not exist"))
            || lower.contains("invalid identifier")
        {
            Self::ColumnNotFound
        } else if lower.contains("permission denied")
            || lower.contains("access denied")
            || lower.contains("insufficient privileges")
        {
            Self::PermissionDenied
        } else {
            Self::Other
        }
    }
}

/// Classification of an upstream LLM provider error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpstreamErrorKind {
    RateLimited,
    Auth,
    Other,
}

impl UpstreamErrorKind {
    /// Classify a provider error by substring, following the categories the
    /// provider APIs actually surface in message text.
    #[must_use]
    pub fn classify(provider_message: &str) -> Self {
        let lower = provider_message.to_lowercase();
        if lower.contains("quota") || lower.contains("rate_limit") || lower.contains("rate limit") || lower.contains("429") {
            Self::RateLimited
        } else if lower.contains("authentication") || lower.contains("unauthorized") || lower.contains("401") {
            Self::Auth
        } else {
            Self::Other
        }
    }

    /// Single user-visible message for this kind. Never echoes provider
    /// internals for rate-limit/auth failures.
    #[must_use]
    pub const fn user_message(&self) -> &'static str {
        match self {
            Self::RateLimited => {
                "The AI service is temporarily unavailable due to high usage. Please wait a moment and try again."
            }
            Self::Auth => {
                "There was a problem with the AI service authentication. Please check API keys."
            }
            Self::Other => {
                "There was a problem connecting to the AI service. Please try again."
            }
        }
    }
}

/// Main error type for Colloquy operations
#[derive(Error, Debug)]
pub enum GatewayError {
    /// Bad tool arguments or malformed input
    #[error("Validation error: {0}")]
    Validation(String),

    /// SQL blocked by the read-only analyzer
    #[error("READ-ONLY: only SELECT statements are allowed, {query_type} blocked")]
    SecurityRejection { query_type: QueryType },

    /// Database connection failed
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// Query execution failed, classified into a friendly kind
    #[error("Query execution failed: {message}")]
    QueryFailed { kind: QueryErrorKind, message: String },

    /// Unknown engine name at the adapter registry
    #[error("Unsupported engine: {0}")]
    UnsupportedEngine(String),

    /// Upstream LLM provider error
    #[error("Upstream model error: {message}")]
    UpstreamModel { kind: UpstreamErrorKind, message: String },

    /// Configuration error (invalid limits, bad descriptor, etc.)
    #[error("Configuration error: {0}")]
    Config(String),
}

impl GatewayError {
    /// Convert error to error code string for JSON output
    ///
    /// Error codes are stable and suitable for programmatic handling.
    #[must_use]
    pub const fn error_code(&self) -> &'static str {
        match self {
            Self::Validation(_) => "VALIDATION_ERROR",
            Self::SecurityRejection { .. } => "SECURITY_REJECTION",
            Self::ConnectionFailed(_) => "CONNECTION_FAILED",
            Self::QueryFailed { .. } => "QUERY_FAILED",
            Self::UnsupportedEngine(_) => "UNSUPPORTED_ENGINE",
            Self::UpstreamModel { .. } => "UPSTREAM_MODEL",
            Self::Config(_) => "CONFIG_ERROR",
        }
    }

    /// Get human-readable error message (safe for clients, no sensitive data)
    ///
    /// Query failures surface the friendly category text rather than the raw
    /// driver message; the raw message belongs in logs only.
    #[must_use]
    pub fn message(&self) -> String {
        match self {
            Self::QueryFailed { kind, message } => match kind {
                QueryErrorKind::TableNotFound => "Table not found. Check the table name and try again.".to_string(),
                QueryErrorKind::ColumnNotFound => "Column not found. Check the column names and try again.".to_string(),
                QueryErrorKind::PermissionDenied => "Permission denied for this operation.".to_string(),
                QueryErrorKind::Other => format!("Database error: {message}"),
            },
            other => other.to_string(),
        }
    }

    /// Create a validation error
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    /// Create a security rejection for a blocked query type
    #[must_use]
    pub const fn security_rejection(query_type: QueryType) -> Self {
        Self::SecurityRejection { query_type }
    }

    /// Create a connection failed error
    pub fn connection_failed(message: impl Into<String>) -> Self {
        Self::ConnectionFailed(message.into())
    }

    /// Create a query failed error, classifying the driver message
    pub fn query_failed(driver_message: impl Into<String>) -> Self {
        let message = driver_message.into();
        Self::QueryFailed { kind: QueryErrorKind::classify(&message), message }
    }

    /// Create an unsupported engine error
    pub fn unsupported_engine(name: impl Into<String>) -> Self {
        Self::UnsupportedEngine(name.into())
    }

    /// Create an upstream model error, classifying the provider message
    pub fn upstream_model(provider_message: impl Into<String>) -> Self {
        let message = provider_message.into();
        Self::UpstreamModel { kind: UpstreamErrorKind::classify(&message), message }
    }

    /// Create a configuration error
    pub fn config_error(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }
}

/// Result type alias for Colloquy operations
pub type Result<T> = std::result::Result<T, GatewayError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes() {
        assert_eq!(GatewayError::validation("test").error_code(), "VALIDATION_ERROR");
        assert_eq!(GatewayError::security_rejection(QueryType::Drop).error_code(), "SECURITY_REJECTION");
        assert_eq!(GatewayError::connection_failed("test").error_code(), "CONNECTION_FAILED");
        assert_eq!(GatewayError::query_failed("test").error_code(), "QUERY_FAILED");
        assert_eq!(GatewayError::unsupported_engine("mongodb").error_code(), "UNSUPPORTED_ENGINE");
        assert_eq!(GatewayError::upstream_model("test").error_code(), "UPSTREAM_MODEL");
        assert_eq!(GatewayError::config_error("test").error_code(), "CONFIG_ERROR");
    }

    #[test]
    fn test_security_rejection_names_blocked_type() {
        let err = GatewayError::security_rejection(QueryType::Drop);
        assert!(err.message().contains("DROP"));
        assert!(err.message().contains("READ-ONLY"));
    }

    #[test]
    fn test_query_error_classification() {
        assert_eq!(QueryErrorKind::classify("ERROR: relation \"users\" does not exist"), QueryErrorKind::TableNotFound);
        assert_eq!(QueryErrorKind::classify("no such table: users"), QueryErrorKind::TableNotFound);
        assert_eq!(QueryErrorKind::classify("Table 'shop.users' doesn't exist"), QueryErrorKind::TableNotFound);
        assert_eq!(QueryErrorKind::classify("Invalid object name 'users'"), QueryErrorKind::TableNotFound);
        assert_eq!(QueryErrorKind::classify("Unknown column 'email' in 'field list'"), QueryErrorKind::ColumnNotFound);
        assert_eq!(QueryErrorKind::classify("no such column: email"), QueryErrorKind::ColumnNotFound);
        assert_eq!(QueryErrorKind::classify("ORA-00904: \"EMAIL\": invalid identifier"), QueryErrorKind::ColumnNotFound);
        assert_eq!(QueryErrorKind::classify("ERROR: permission denied for table users"), QueryErrorKind::PermissionDenied);
        assert_eq!(QueryErrorKind::classify("Access denied for user 'app'@'%'"), QueryErrorKind::PermissionDenied);
        assert_eq!(QueryErrorKind::classify("syntax error at or near \"FRM\""), QueryErrorKind::Other);
    }

    #[test]
    fn test_query_failed_friendly_messages_hide_driver_text() {
        let err = GatewayError::query_failed("ERROR: relation \"users\" does not exist at character 15");
        assert_eq!(err.message(), "Table not found. Check the table name and try again.");

        let err = GatewayError::query_failed("something unusual happened");
        assert!(err.message().contains("something unusual happened"));
    }

    #[test]
    fn test_upstream_classification() {
        assert_eq!(UpstreamErrorKind::classify("429 Too Many Requests"), UpstreamErrorKind::RateLimited);
        assert_eq!(UpstreamErrorKind::classify("quota exceeded for project"), UpstreamErrorKind::RateLimited);
        assert_eq!(UpstreamErrorKind::classify("401 Unauthorized"), UpstreamErrorKind::Auth);
        assert_eq!(UpstreamErrorKind::classify("authentication failed"), UpstreamErrorKind::Auth);
        assert_eq!(UpstreamErrorKind::classify("connection reset by peer"), UpstreamErrorKind::Other);
    }
}

//! Error taxonomy for the ingestion pipeline.
//!
//! The pipeline collapses failures into exactly two first-class variants —
//! [`IngestError::Retryable`] and [`IngestError::Permanent`] — so that the
//! Router's retry middleware can dispatch on the variant alone rather than
//! inspecting error internals. Each variant carries an [`ErrorCategory`] tag
//! shared with the metrics and DLQ subsystems.

use thiserror::Error;

/// Coarse category used for metrics, DLQ bookkeeping, and log fields.
///
/// Classification defaults to substring matching over the error message
/// (see [`classify_message`]); constructors that already know the category
/// (e.g. from a typed source error) should set it directly instead.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    Unknown,
    Connection,
    Timeout,
    Validation,
    Database,
    Capacity,
}

impl std::fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ErrorCategory::Unknown => "unknown",
            ErrorCategory::Connection => "connection",
            ErrorCategory::Timeout => "timeout",
            ErrorCategory::Validation => "validation",
            ErrorCategory::Database => "database",
            ErrorCategory::Capacity => "capacity",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for ErrorCategory {
    type Err = ();

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(match s {
            "connection" => ErrorCategory::Connection,
            "timeout" => ErrorCategory::Timeout,
            "validation" => ErrorCategory::Validation,
            "database" => ErrorCategory::Database,
            "capacity" => ErrorCategory::Capacity,
            _ => ErrorCategory::Unknown,
        })
    }
}

/// Classify an error message by case-insensitive substring scan. Tokens here
/// are the authoritative defaults; callers with a typed source error should
/// prefer a direct category over this heuristic.
pub fn classify_message(message: &str) -> ErrorCategory {
    let lower = message.to_lowercase();

    if lower.contains("timeout") || lower.contains("timed out") || lower.contains("deadline") {
        ErrorCategory::Timeout
    } else if lower.contains("connection")
        || lower.contains("connect")
        || lower.contains("network")
        || lower.contains("unreachable")
    {
        ErrorCategory::Connection
    } else if lower.contains("validation")
        || lower.contains("invalid")
        || lower.contains("malformed")
        || lower.contains("required field")
    {
        ErrorCategory::Validation
    } else if lower.contains("database")
        || lower.contains("sql")
        || lower.contains("postgres")
        || lower.contains("constraint")
    {
        ErrorCategory::Database
    } else if lower.contains("capacity")
        || lower.contains("exhausted")
        || lower.contains("full")
        || lower.contains("rate limit")
    {
        ErrorCategory::Capacity
    } else {
        ErrorCategory::Unknown
    }
}

/// Error taxonomy for the ingestion pipeline: transient failures that should
/// be retried with backoff, and permanent failures that should route
/// directly to the poison queue / dead-letter store.
#[derive(Error, Debug, Clone)]
pub enum IngestError {
    /// Transient failure (connection, timeout, capacity); retry with backoff.
    #[error("retryable error: {message}")]
    Retryable {
        message: String,
        category: ErrorCategory,
    },

    /// Malformed or invalid input; never retried.
    #[error("permanent error: {message}")]
    Permanent {
        message: String,
        category: ErrorCategory,
    },
}

impl IngestError {
    pub fn retryable<S: Into<String>>(message: S) -> Self {
        let message = message.into();
        let category = classify_message(&message);
        Self::Retryable { message, category }
    }

    pub fn retryable_with_category<S: Into<String>>(message: S, category: ErrorCategory) -> Self {
        Self::Retryable {
            message: message.into(),
            category,
        }
    }

    pub fn permanent<S: Into<String>>(message: S) -> Self {
        let message = message.into();
        let category = classify_message(&message);
        Self::Permanent { message, category }
    }

    pub fn permanent_with_category<S: Into<String>>(message: S, category: ErrorCategory) -> Self {
        Self::Permanent {
            message: message.into(),
            category,
        }
    }

    pub fn message(&self) -> &str {
        match self {
            IngestError::Retryable { message, .. } => message,
            IngestError::Permanent { message, .. } => message,
        }
    }

    pub fn category(&self) -> ErrorCategory {
        match self {
            IngestError::Retryable { category, .. } => *category,
            IngestError::Permanent { category, .. } => *category,
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, IngestError::Retryable { .. })
    }

    pub fn is_permanent(&self) -> bool {
        matches!(self, IngestError::Permanent { .. })
    }
}

impl From<serde_json::Error> for IngestError {
    fn from(err: serde_json::Error) -> Self {
        IngestError::permanent_with_category(err.to_string(), ErrorCategory::Validation)
    }
}

impl From<sqlx::Error> for IngestError {
    fn from(err: sqlx::Error) -> Self {
        IngestError::retryable_with_category(err.to_string(), ErrorCategory::Database)
    }
}

impl From<redis::RedisError> for IngestError {
    fn from(err: redis::RedisError) -> Self {
        IngestError::retryable_with_category(err.to_string(), ErrorCategory::Connection)
    }
}

pub type Result<T> = std::result::Result<T, IngestError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_known_tokens() {
        assert_eq!(classify_message("Connection refused"), ErrorCategory::Connection);
        assert_eq!(classify_message("operation timed out"), ErrorCategory::Timeout);
        assert_eq!(classify_message("invalid title field"), ErrorCategory::Validation);
        assert_eq!(classify_message("postgres constraint violated"), ErrorCategory::Database);
        assert_eq!(classify_message("queue capacity exhausted"), ErrorCategory::Capacity);
        assert_eq!(classify_message("something else entirely"), ErrorCategory::Unknown);
    }

    #[test]
    fn retryable_and_permanent_helpers() {
        let retryable = IngestError::retryable("connection reset by peer");
        assert!(retryable.is_retryable());
        assert!(!retryable.is_permanent());
        assert_eq!(retryable.category(), ErrorCategory::Connection);

        let permanent = IngestError::permanent("missing required field: title");
        assert!(permanent.is_permanent());
        assert_eq!(permanent.category(), ErrorCategory::Validation);
    }

    #[test]
    fn json_errors_are_permanent_validation() {
        let json_err = serde_json::from_str::<serde_json::Value>("{not json").unwrap_err();
        let ingest_err: IngestError = json_err.into();
        assert!(ingest_err.is_permanent());
        assert_eq!(ingest_err.category(), ErrorCategory::Validation);
    }
}

//! Error types for the change pipeline
//!
//! Signals (`IgnoreRow`, `IgnoreBatch`) travel on the error channel so that `?`
//! unwinds to the scope that handles them. They are never reported as failures.

use crate::data::DataEventType;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Boxed cause carried by transform and script failures
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Error categories for metrics and alerting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    /// Intentional skip flow, not a failure
    Signal,
    /// Malformed or incomplete batch data
    Protocol,
    /// Failure inside a column transform
    Transform,
    /// Unresolved write conflict
    Conflict,
    /// Error surfaced by the database collaborator
    Database,
    /// External cancellation
    Cancelled,
    /// Invalid settings
    Configuration,
}

/// Pipeline errors
#[derive(Error, Debug)]
pub enum Error {
    /// Discard the current row
    #[error("row ignored")]
    IgnoreRow,

    /// Discard the current batch
    #[error("batch ignored")]
    IgnoreBatch,

    /// Malformed or incomplete batch
    #[error("protocol error: {0}")]
    Protocol(String),

    /// A column transform failed
    #[error("transform '{transform}' failed on column {column}: {source}")]
    Transform {
        /// Target column
        column: String,
        /// Transform type identifier
        transform: String,
        /// Underlying cause
        #[source]
        source: BoxError,
    },

    /// A write conflict could not be resolved
    #[error("conflict on {table} during {event_type}: {message}")]
    Conflict {
        /// Fully qualified target table
        table: String,
        /// Operation that conflicted
        event_type: DataEventType,
        /// Details
        message: String,
    },

    /// Processing was cancelled
    #[error("processing cancelled")]
    Cancelled,

    /// Invalid configuration
    #[error("configuration error: {0}")]
    Config(String),

    /// YAML rule set could not be parsed
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// Error reported by the database collaborator
    #[error(transparent)]
    Database(#[from] weir_rdbc::Error),
}

impl Error {
    /// Create a protocol error
    pub fn protocol(msg: impl Into<String>) -> Self {
        Self::Protocol(msg.into())
    }

    /// Create a config error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Wrap a transform failure with the column and transform it came from
    pub fn transform(
        column: impl Into<String>,
        transform: impl Into<String>,
        source: impl Into<BoxError>,
    ) -> Self {
        Self::Transform {
            column: column.into(),
            transform: transform.into(),
            source: source.into(),
        }
    }

    /// Create a conflict error
    pub fn conflict(
        table: impl Into<String>,
        event_type: DataEventType,
        message: impl Into<String>,
    ) -> Self {
        Self::Conflict {
            table: table.into(),
            event_type,
            message: message.into(),
        }
    }

    /// True for skip signals that must not fail a batch
    pub fn is_signal(&self) -> bool {
        matches!(self, Self::IgnoreRow | Self::IgnoreBatch)
    }

    /// Whether a later `process()` run may succeed. Delegates to the database error.
    pub fn is_retriable(&self) -> bool {
        match self {
            Self::Database(e) => e.is_retriable(),
            _ => false,
        }
    }

    /// Get the error category for metrics and alerting.
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::IgnoreRow | Self::IgnoreBatch => ErrorCategory::Signal,
            Self::Protocol(_) => ErrorCategory::Protocol,
            Self::Transform { .. } => ErrorCategory::Transform,
            Self::Conflict { .. } => ErrorCategory::Conflict,
            Self::Cancelled => ErrorCategory::Cancelled,
            Self::Config(_) | Self::Yaml(_) => ErrorCategory::Configuration,
            Self::Database(e) => match e.category() {
                weir_rdbc::error::ErrorCategory::Protocol => ErrorCategory::Protocol,
                weir_rdbc::error::ErrorCategory::Configuration => ErrorCategory::Configuration,
                _ => ErrorCategory::Database,
            },
        }
    }
}

impl From<validator::ValidationErrors> for Error {
    fn from(e: validator::ValidationErrors) -> Self {
        Self::Config(e.to_string())
    }
}

/// Result type for pipeline operations
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_signals() {
        assert!(Error::IgnoreRow.is_signal());
        assert!(Error::IgnoreBatch.is_signal());
        assert!(!Error::Cancelled.is_signal());
        assert_eq!(Error::IgnoreRow.category(), ErrorCategory::Signal);
    }

    #[test]
    fn test_retriable_delegates_to_database() {
        let err: Error = weir_rdbc::Error::connection("reset").into();
        assert!(err.is_retriable());
        assert_eq!(err.category(), ErrorCategory::Database);

        let err: Error = weir_rdbc::Error::missing_parameter("id").into();
        assert!(!err.is_retriable());
        assert_eq!(err.category(), ErrorCategory::Protocol);

        assert!(!Error::Cancelled.is_retriable());
    }

    #[test]
    fn test_transform_error_display() {
        let err = Error::transform("NAME", "lookup", "no rows");
        assert_eq!(
            err.to_string(),
            "transform 'lookup' failed on column NAME: no rows"
        );
        assert!(std::error::Error::source(&err).is_some());
    }

    #[test]
    fn test_conflict_display() {
        let err = Error::conflict("sales.ORDERS", DataEventType::Insert, "row exists");
        assert!(err.to_string().contains("sales.ORDERS"));
        assert!(err.to_string().contains("INSERT"));
    }
}

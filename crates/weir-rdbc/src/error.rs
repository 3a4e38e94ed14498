//! Errors raised while compiling SQL or reported by a platform.
//!
//! Compilation problems (missing or mixed parameters, unsupported upserts)
//! come from this crate. Everything else is reported by the
//! [`DatabasePlatform`](crate::connection::DatabasePlatform) implementation
//! and classified here so writers can tell a key collision from a lost
//! connection.

use std::fmt;
use thiserror::Error;

/// Result alias for SQL-side operations
pub type Result<T> = std::result::Result<T, Error>;

/// Boxed driver error kept as the source of a platform failure
pub type DriverError = Box<dyn std::error::Error + Send + Sync>;

/// Coarse classification of an [`Error`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCategory {
    /// The platform lost or could not open its connection
    Connection,
    /// A statement failed to execute
    Query,
    /// Begin, commit or rollback failed
    Transaction,
    /// A row broke a key, reference or size rule
    Constraint,
    /// Captured text could not become a typed value
    TypeConversion,
    /// The platform gave up waiting
    Timeout,
    /// The platform chose this transaction as a deadlock victim
    Deadlock,
    /// Invalid dialect or platform settings
    Configuration,
    /// A table the row refers to does not exist
    Schema,
    /// A SQL template or its parameters are malformed
    Protocol,
    /// Anything else
    Other,
}

impl ErrorCategory {
    /// Transient categories that may succeed on a later attempt
    #[inline]
    pub const fn is_retriable(self) -> bool {
        matches!(self, Self::Connection | Self::Timeout | Self::Deadlock)
    }

    /// Lower-case label used in logs
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Connection => "connection",
            Self::Query => "query",
            Self::Transaction => "transaction",
            Self::Constraint => "constraint",
            Self::TypeConversion => "type_conversion",
            Self::Timeout => "timeout",
            Self::Deadlock => "deadlock",
            Self::Configuration => "configuration",
            Self::Schema => "schema",
            Self::Protocol => "protocol",
            Self::Other => "other",
        }
    }
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which rule a rejected row broke
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConstraintKind {
    /// Primary key or unique index
    UniqueKey,
    /// Foreign key reference
    ForeignKey,
    /// NOT NULL column
    NotNull,
    /// CHECK constraint
    Check,
}

/// SQL-side and platform errors
#[derive(Error, Debug)]
pub enum Error {
    /// The platform has no usable connection
    #[error("connection failed: {message}")]
    Connection {
        /// What the platform reported
        message: String,
        /// Driver error, when there is one
        #[source]
        source: Option<DriverError>,
    },

    /// A statement failed
    #[error("statement failed: {message}")]
    Query {
        /// What the platform reported
        message: String,
        /// Statement text, when known
        sql: Option<String>,
    },

    /// Begin, commit or rollback failed
    #[error("transaction failed: {message}")]
    Transaction {
        /// What the platform reported
        message: String,
    },

    /// A row broke a constraint
    #[error("{kind:?} constraint {constraint_name} violated: {message}")]
    Constraint {
        /// Kind of rule
        kind: ConstraintKind,
        /// Constraint or index name
        constraint_name: String,
        /// What the platform reported
        message: String,
    },

    /// A value does not fit its column
    #[error("value for column {column} truncated: {message}")]
    Truncation {
        /// Target column
        column: String,
        /// What the platform reported
        message: String,
    },

    /// Text could not be converted to the column type
    #[error("cannot convert value: {message}")]
    TypeConversion {
        /// Offending value and target type
        message: String,
    },

    /// The platform timed out
    #[error("timed out: {message}")]
    Timeout {
        /// What timed out
        message: String,
    },

    /// The transaction was chosen as a deadlock victim
    #[error("deadlock victim")]
    Deadlock,

    /// Invalid settings
    #[error("invalid configuration: {message}")]
    Configuration {
        /// What is wrong
        message: String,
    },

    /// The target table does not exist
    #[error("table {table} does not exist")]
    TableNotFound {
        /// Fully qualified name
        table: String,
    },

    /// A named parameter in a SQL template has no bound value
    #[error("missing parameter: no value supplied for '{name}'")]
    MissingParameter {
        /// Parameter name
        name: String,
    },

    /// A SQL template uses both named and `?` placeholders
    #[error(
        "mixed placeholder styles: {named} named and {unnamed} unnamed parameters in one statement"
    )]
    MixedPlaceholders {
        /// Named parameter count
        named: usize,
        /// `?` placeholder count
        unnamed: usize,
    },

    /// The dialect cannot render the requested statement
    #[error("not supported: {message}")]
    Unsupported {
        /// What was requested
        message: String,
    },

    /// A statement could not be assembled
    #[error("cannot build statement: {message}")]
    Internal {
        /// What went wrong
        message: String,
    },
}

impl Error {
    /// Classification of this error
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::Connection { .. } => ErrorCategory::Connection,
            Self::Query { .. } => ErrorCategory::Query,
            Self::Transaction { .. } => ErrorCategory::Transaction,
            Self::Constraint { .. } | Self::Truncation { .. } => ErrorCategory::Constraint,
            Self::TypeConversion { .. } => ErrorCategory::TypeConversion,
            Self::Timeout { .. } => ErrorCategory::Timeout,
            Self::Deadlock => ErrorCategory::Deadlock,
            Self::Configuration { .. } => ErrorCategory::Configuration,
            Self::TableNotFound { .. } => ErrorCategory::Schema,
            Self::MissingParameter { .. } | Self::MixedPlaceholders { .. } => {
                ErrorCategory::Protocol
            }
            Self::Unsupported { .. } | Self::Internal { .. } => ErrorCategory::Other,
        }
    }

    /// Whether a later attempt may succeed
    #[inline]
    pub fn is_retriable(&self) -> bool {
        self.category().is_retriable()
    }

    fn is_constraint(&self, wanted: ConstraintKind) -> bool {
        matches!(self, Self::Constraint { kind, .. } if *kind == wanted)
    }

    /// The row's key already exists
    pub fn is_unique_key_violation(&self) -> bool {
        self.is_constraint(ConstraintKind::UniqueKey)
    }

    /// The row references a missing parent
    pub fn is_foreign_key_violation(&self) -> bool {
        self.is_constraint(ConstraintKind::ForeignKey)
    }

    /// A value was too large for its column
    pub fn is_truncation(&self) -> bool {
        matches!(self, Self::Truncation { .. })
    }

    // ========================================================================
    // Constructors
    // ========================================================================

    /// Connection failure without a driver error
    pub fn connection(message: impl Into<String>) -> Self {
        Self::Connection {
            message: message.into(),
            source: None,
        }
    }

    /// Statement failure carrying its SQL
    pub fn query_with_sql(message: impl Into<String>, sql: impl Into<String>) -> Self {
        Self::Query {
            message: message.into(),
            sql: Some(sql.into()),
        }
    }

    /// Duplicate key
    pub fn unique_key(constraint_name: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Constraint {
            kind: ConstraintKind::UniqueKey,
            constraint_name: constraint_name.into(),
            message: message.into(),
        }
    }

    /// Missing parent row
    pub fn foreign_key(constraint_name: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Constraint {
            kind: ConstraintKind::ForeignKey,
            constraint_name: constraint_name.into(),
            message: message.into(),
        }
    }

    /// Oversized value
    pub fn truncation(column: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Truncation {
            column: column.into(),
            message: message.into(),
        }
    }

    /// Platform timeout
    pub fn timeout(message: impl Into<String>) -> Self {
        Self::Timeout {
            message: message.into(),
        }
    }

    /// Invalid settings
    pub fn config(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    /// Text that does not parse as its column type
    pub fn type_conversion(message: impl Into<String>) -> Self {
        Self::TypeConversion {
            message: message.into(),
        }
    }

    /// Named parameter without a value
    pub fn missing_parameter(name: impl Into<String>) -> Self {
        Self::MissingParameter { name: name.into() }
    }

    /// Statement the dialect cannot render
    pub fn unsupported(message: impl Into<String>) -> Self {
        Self::Unsupported {
            message: message.into(),
        }
    }

    /// Statement that could not be assembled
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }
}

//! # weir-rdbc
//!
//! SQL-side building blocks for the weir change-data pipeline.
//!
//! This crate turns logical row operations into dialect-correct, parameterized SQL.
//! It never talks to a database itself: drivers plug in through the
//! [`connection::DatabasePlatform`] and [`connection::Transaction`] traits.
//!
//! ## Features
//!
//! - **DML Compilation**: INSERT/UPDATE/DELETE/COUNT/SELECT with null-key aware WHERE clauses
//! - **Bind Alignment**: one bind layout drives SQL placeholders, type vectors and value arrays
//! - **SQL Dialect Abstraction**: quoting, type normalization and upserts (sea-query where possible)
//! - **Named Parameters**: `:name` templates with sequence expansion for `IN` lists
//! - **Typed Values**: conversion of captured text into typed bind values
//!
//! ## Quick Start
//!
//! ```rust
//! use weir_rdbc::prelude::*;
//! use std::collections::HashMap;
//!
//! let stmt = DmlStatement::new(
//!     DmlStatementOptions::new(DmlType::Delete, "ORDERS")
//!         .with_keys(vec![Column::key("ID", TypeCode::Integer)]),
//! )?;
//! assert_eq!(stmt.sql(), "delete from ORDERS where ID = ?");
//!
//! let parsed = ParsedSql::parse("select * from ORDERS where ID in (:ids)");
//! let mut params = HashMap::new();
//! params.insert("ids".to_string(), Value::from(vec![1, 2]));
//! let (sql, values) = parsed.prepare(&params)?;
//! assert_eq!(sql, "select * from ORDERS where ID in (?, ?)");
//! assert_eq!(values.len(), 2);
//! # Ok::<(), weir_rdbc::Error>(())
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_code)]

pub mod connection;
pub mod dialect;
pub mod dml;
pub mod error;
pub mod named;
pub mod types;

/// Prelude module for convenient imports
pub mod prelude {
    // Error types
    pub use crate::error::{ConstraintKind, Error, ErrorCategory, Result};

    // Value and table model
    pub use crate::types::{Column, Row, Table, TypeCode, Value};

    // Platform traits
    pub use crate::connection::{DatabasePlatform, Transaction};

    // Dialect types
    pub use crate::dialect::{
        dialect_for, DatabaseInfo, GenericDialect, MariaDbDialect, MySqlDialect, PostgresDialect,
        SqlDialect, SqlServerDialect, UpsertStyle,
    };

    // DML and named parameters
    pub use crate::dml::{BindSlot, DmlStatement, DmlStatementOptions, DmlType};
    pub use crate::named::{ParameterOccurrence, ParsedSql};
}

// Re-export commonly used items at crate root
pub use error::{Error, Result};
pub use types::Value;

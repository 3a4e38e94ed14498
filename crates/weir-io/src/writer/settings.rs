//! Database writer settings

use super::conflict::Conflict;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use validator::{Validate, ValidationError};

fn validate_conflicts(conflicts: &BTreeMap<String, Conflict>) -> Result<(), ValidationError> {
    for (table, conflict) in conflicts {
        if table.trim().is_empty() {
            return Err(ValidationError::new("empty_conflict_table")
                .with_message("conflict entries need a target table name".into()));
        }
        if let Err(e) = conflict.validate() {
            return Err(ValidationError::new("invalid_conflict")
                .with_message(format!("conflict for {}: {}", table, e).into()));
        }
    }
    Ok(())
}

/// Behaviour of [`DatabaseWriter`](super::DatabaseWriter)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct DatabaseWriterSettings {
    /// Commit after this many rows inside a batch; 0 keeps one transaction per batch
    #[validate(range(max = 10_000_000, message = "max_rows_before_commit must be at most 10000000"))]
    pub max_rows_before_commit: u64,

    /// Skip rows of tables that do not exist at the target instead of failing
    pub ignore_missing_tables: bool,

    /// Update only the columns whose value changed
    pub apply_changes_only: bool,

    /// Detect and resolve conflicts; when off every write is applied as is
    pub use_conflict_detection: bool,

    /// Expression wrapped around character placeholders, `$(columnName)` marks the placeholder
    pub text_column_expression: Option<String>,

    /// Conflict policy for tables without an entry in `conflicts`
    #[validate(nested)]
    pub default_conflict: Conflict,

    /// Conflict policies by fully qualified target table name
    #[validate(custom(function = "validate_conflicts"))]
    pub conflicts: BTreeMap<String, Conflict>,

    /// Log each resolved conflict at info level
    pub log_conflict_resolution: bool,
}

impl Default for DatabaseWriterSettings {
    fn default() -> Self {
        Self {
            max_rows_before_commit: 0,
            ignore_missing_tables: false,
            apply_changes_only: true,
            use_conflict_detection: true,
            text_column_expression: None,
            default_conflict: Conflict::default(),
            conflicts: BTreeMap::new(),
            log_conflict_resolution: false,
        }
    }
}

impl DatabaseWriterSettings {
    /// Conflict policy for a target table, matched case-insensitively
    pub fn conflict_for(&self, table: &str) -> &Conflict {
        self.conflicts
            .iter()
            .find(|(name, _)| name.eq_ignore_ascii_case(table))
            .map(|(_, conflict)| conflict)
            .unwrap_or(&self.default_conflict)
    }

    /// Set a per-table conflict policy
    pub fn with_conflict(mut self, table: impl Into<String>, conflict: Conflict) -> Self {
        self.conflicts.insert(table.into(), conflict);
        self
    }

    /// Set the early commit threshold
    pub fn with_max_rows_before_commit(mut self, rows: u64) -> Self {
        self.max_rows_before_commit = rows;
        self
    }

    /// Skip tables missing at the target
    pub fn with_ignore_missing_tables(mut self, ignore: bool) -> Self {
        self.ignore_missing_tables = ignore;
        self
    }

    /// Update only changed columns
    pub fn with_apply_changes_only(mut self, changes_only: bool) -> Self {
        self.apply_changes_only = changes_only;
        self
    }

    /// Parse settings from YAML and validate them
    pub fn from_yaml(yaml: &str) -> crate::error::Result<Self> {
        let settings: Self = serde_yaml::from_str(yaml)?;
        settings.validate()?;
        Ok(settings)
    }
}

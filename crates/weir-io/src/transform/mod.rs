//! # Row transformation
//!
//! Declarative rules that map rows of one source table onto one or more
//! target tables, column by column.
//!
//! ```text
//! source row ──► TransformTable (per matching rule)
//!                  │ enhance_with_implied_columns (once per table)
//!                  ▼
//!                key columns ──► TransformedData (fan out on Multi)
//!                  │
//!                  ▼
//!                other columns ──► target DML resolution ──► target Table + CsvData
//! ```
//!
//! Column logic is pluggable through [`ColumnTransform`]; the built-ins are
//! registered by name in [`ColumnTransformRegistry::with_defaults`].

mod builtins;
mod column;
mod engine;
mod script;
mod table;
mod transformed;

pub use builtins::*;
pub use column::{
    ColumnTransform, ColumnTransformRegistry, NewAndOldValue, TransformOutput, TransformSignal,
};
pub use engine::{SourceRow, TransformEngine};
pub use script::{ScriptEvaluator, ScriptValue, SharedStateStore};
pub use table::{TransformColumn, TransformTable, UpdateAction};
pub use transformed::TransformedData;

use crate::data::DataEventType;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

// ============================================================================
// Rule enums
// ============================================================================

/// Side of the pipeline a rule runs on
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TransformPoint {
    /// While rows are extracted at the source
    Extract,
    /// While rows are loaded at the target
    #[default]
    Load,
}

/// Operations a column rule applies to
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum IncludeOn {
    /// Inserts only
    #[serde(alias = "I")]
    Insert,
    /// Updates only
    #[serde(alias = "U")]
    Update,
    /// Deletes only
    #[serde(alias = "D")]
    Delete,
    /// Every operation
    #[default]
    #[serde(alias = "*")]
    All,
}

impl IncludeOn {
    /// Whether a rule with this scope runs for `event_type`
    pub fn matches(self, event_type: DataEventType) -> bool {
        match self {
            Self::All => true,
            Self::Insert => event_type == DataEventType::Insert,
            Self::Update => event_type == DataEventType::Update,
            Self::Delete => event_type == DataEventType::Delete,
        }
    }
}

/// Whether unlisted columns pass through
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ColumnPolicy {
    /// Unlisted columns are copied unchanged
    #[default]
    Implied,
    /// Only listed columns reach the target
    Explicit,
}

/// Operation applied at the target for a source update
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TargetDmlAction {
    /// Delete the target row
    #[serde(rename = "DEL_ROW")]
    DelRow,
    /// Update the mapped columns
    #[serde(rename = "UPD_COL")]
    UpdCol,
    /// Insert a new target row
    #[serde(rename = "INS_ROW")]
    InsRow,
    /// Update the target row as is
    #[serde(rename = "UPD_ROW")]
    UpdRow,
    /// Do nothing
    #[serde(rename = "NONE")]
    NoneAction,
}

impl TargetDmlAction {
    /// Policy token
    pub const fn token(self) -> &'static str {
        match self {
            Self::DelRow => "DEL_ROW",
            Self::UpdCol => "UPD_COL",
            Self::InsRow => "INS_ROW",
            Self::UpdRow => "UPD_ROW",
            Self::NoneAction => "NONE",
        }
    }

    /// Target DML type, `None` when the row is dropped
    pub const fn event_type(self) -> Option<DataEventType> {
        match self {
            Self::DelRow => Some(DataEventType::Delete),
            Self::UpdCol | Self::UpdRow => Some(DataEventType::Update),
            Self::InsRow => Some(DataEventType::Insert),
            Self::NoneAction => None,
        }
    }
}

impl fmt::Display for TargetDmlAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.token())
    }
}

impl FromStr for TargetDmlAction {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "DEL_ROW" => Ok(Self::DelRow),
            "UPD_COL" => Ok(Self::UpdCol),
            "INS_ROW" => Ok(Self::InsRow),
            "UPD_ROW" => Ok(Self::UpdRow),
            "NONE" => Ok(Self::NoneAction),
            other => Err(format!("'{}' is not a target DML action", other)),
        }
    }
}

/// Operation applied at the target for a source delete
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DeleteAction {
    /// Delete the target row
    #[default]
    DelRow,
    /// Update the mapped columns instead
    #[serde(alias = "UPD_COL")]
    UpdateCol,
    /// Drop the delete
    None,
}

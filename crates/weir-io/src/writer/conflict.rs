//! Conflict detection and resolution for the database writer

use crate::data::DataEventType;
use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use validator::{Validate, ValidationError};

/// How a conflicting row is detected
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DetectConflict {
    /// Rows are matched by primary key only
    #[default]
    UsePkData,
    /// Rows are matched by every old column value
    UseOldData,
    /// Rows are matched by primary key and the old values of changed columns
    UseChangedData,
    /// Rows are matched by primary key and the old value of a timestamp column
    UseTimestamp,
    /// Rows are matched by primary key and the old value of a version column
    UseVersion,
}

impl DetectConflict {
    /// Whether detection needs the column named by the detect expression
    pub fn needs_expression(self) -> bool {
        matches!(self, Self::UseTimestamp | Self::UseVersion)
    }
}

/// What to do once a conflict is detected
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ResolveConflict {
    /// Apply the change with the other operation
    #[default]
    Fallback,
    /// Skip the row, or the batch
    Ignore,
    /// Stop and wait for an operator
    Manual,
    /// Keep whichever side carries the newer detect value
    NewerWins,
}

fn default_true() -> bool {
    true
}

/// Conflict policy for a target table
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Validate)]
#[validate(schema(function = "validate_conflict"))]
pub struct Conflict {
    /// Detection strategy
    #[serde(default)]
    pub detect_type: DetectConflict,
    /// Column compared by timestamp and version detection
    #[serde(default)]
    pub detect_expression: Option<String>,
    /// Resolution strategy
    #[serde(default)]
    pub resolve_type: ResolveConflict,
    /// `Ignore` skips only the row instead of the whole batch
    #[serde(default = "default_true")]
    pub resolve_row_only: bool,
}

impl Default for Conflict {
    fn default() -> Self {
        Self {
            detect_type: DetectConflict::default(),
            detect_expression: None,
            resolve_type: ResolveConflict::default(),
            resolve_row_only: true,
        }
    }
}

fn validate_conflict(conflict: &Conflict) -> std::result::Result<(), ValidationError> {
    let has_expression = conflict
        .detect_expression
        .as_deref()
        .is_some_and(|e| !e.trim().is_empty());
    if conflict.detect_type.needs_expression() && !has_expression {
        return Err(ValidationError::new("missing_detect_expression")
            .with_message("timestamp and version detection need a detect_expression column".into()));
    }
    if conflict.resolve_type == ResolveConflict::NewerWins && !has_expression {
        return Err(ValidationError::new("missing_detect_expression")
            .with_message("NEWER_WINS needs a detect_expression column".into()));
    }
    Ok(())
}

impl Conflict {
    /// Policy with the given strategies
    pub fn new(detect_type: DetectConflict, resolve_type: ResolveConflict) -> Self {
        Self {
            detect_type,
            resolve_type,
            ..Self::default()
        }
    }

    /// Set the compared column
    pub fn with_detect_expression(mut self, column: impl Into<String>) -> Self {
        self.detect_expression = Some(column.into());
        self
    }

    /// Ignore the whole batch rather than the row
    pub fn with_resolve_row_only(mut self, row_only: bool) -> Self {
        self.resolve_row_only = row_only;
        self
    }
}

/// Outcome of resolving one conflict
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    /// Apply the row again as this operation, matched by primary key only
    Apply(DataEventType),
    /// Skip the row
    IgnoreRow,
    /// Skip the batch
    IgnoreBatch,
    /// The row to delete is already gone
    MissingDelete,
}

/// A conflict as seen by a [`ConflictResolver`]
#[derive(Debug, Clone, Copy)]
pub struct ConflictContext<'a> {
    /// Target table
    pub table: &'a str,
    /// Operation that conflicted
    pub event_type: DataEventType,
    /// Policy in force
    pub conflict: &'a Conflict,
    /// Whether the target row exists
    pub row_exists: bool,
    /// Whether the incoming row is newer, when `NEWER_WINS` compared them
    pub incoming_is_newer: Option<bool>,
}

/// Decides how a conflicting row is handled
pub trait ConflictResolver: Send + Sync {
    /// Resolve one conflict
    fn resolve(&self, conflict: &ConflictContext<'_>) -> Result<Resolution>;
}

/// Standard resolution rules.
///
/// | operation | FALLBACK | IGNORE | NEWER_WINS | MANUAL |
/// |-----------|----------|--------|------------|--------|
/// | INSERT    | update   | skip   | update if newer | fail |
/// | UPDATE    | insert (update if the row exists) | skip | apply if newer | fail |
/// | DELETE    | missing  | missing | missing or apply if newer | fail |
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultConflictResolver;

impl DefaultConflictResolver {
    fn ignore(conflict: &Conflict) -> Resolution {
        if conflict.resolve_row_only {
            Resolution::IgnoreRow
        } else {
            Resolution::IgnoreBatch
        }
    }
}

impl ConflictResolver for DefaultConflictResolver {
    fn resolve(&self, ctx: &ConflictContext<'_>) -> Result<Resolution> {
        use DataEventType::{Delete, Insert, Update};

        let unresolved = || {
            Error::conflict(
                ctx.table,
                ctx.event_type,
                format!("{:?} conflict detected", ctx.conflict.detect_type),
            )
        };
        let resolution = match (ctx.event_type, ctx.conflict.resolve_type) {
            (_, ResolveConflict::Manual) => return Err(unresolved()),

            (Insert, ResolveConflict::Fallback) => Resolution::Apply(Update),
            (Insert, ResolveConflict::Ignore) => Self::ignore(ctx.conflict),
            (Insert, ResolveConflict::NewerWins) => match ctx.incoming_is_newer {
                Some(true) | None => Resolution::Apply(Update),
                Some(false) => Resolution::IgnoreRow,
            },

            (Update, ResolveConflict::Fallback) if ctx.row_exists => Resolution::Apply(Update),
            (Update, ResolveConflict::Fallback) => Resolution::Apply(Insert),
            (Update, ResolveConflict::Ignore) => Self::ignore(ctx.conflict),
            (Update, ResolveConflict::NewerWins) => match (ctx.row_exists, ctx.incoming_is_newer) {
                (false, _) => Resolution::Apply(Insert),
                (true, Some(false)) => Resolution::IgnoreRow,
                (true, _) => Resolution::Apply(Update),
            },

            (Delete, ResolveConflict::NewerWins) if ctx.row_exists => match ctx.incoming_is_newer {
                Some(false) => Resolution::IgnoreRow,
                _ => Resolution::Apply(Delete),
            },
            (Delete, _) => Resolution::MissingDelete,

            _ => return Err(unresolved()),
        };
        Ok(resolution)
    }
}

/// Compare two detect-column values, numerically when both parse
pub fn is_newer(incoming: Option<&str>, existing: Option<&str>) -> bool {
    match (incoming, existing) {
        (_, None) => true,
        (None, Some(_)) => false,
        (Some(a), Some(b)) => match (a.trim().parse::<f64>(), b.trim().parse::<f64>()) {
            (Ok(a), Ok(b)) => a > b,
            _ => a > b,
        },
    }
}

//! Column transform contract and registry

use super::{TransformColumn, TransformedData};
use crate::context::DataContext;
use crate::error::BoxError;
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use thiserror::Error;
use weir_rdbc::connection::DatabasePlatform;

/// Value pair produced by a transform
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NewAndOldValue {
    /// Value after the change
    pub new_value: Option<String>,
    /// Value before the change
    pub old_value: Option<String>,
}

impl NewAndOldValue {
    /// New value only
    pub fn new(new_value: Option<String>) -> Self {
        Self {
            new_value,
            old_value: None,
        }
    }

    /// Both values
    pub fn with_old(new_value: Option<String>, old_value: Option<String>) -> Self {
        Self {
            new_value,
            old_value,
        }
    }
}

/// Result of a column transform
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransformOutput {
    /// One value for the current row
    Single(NewAndOldValue),
    /// One target row per value
    Multi(Vec<Option<String>>),
}

impl TransformOutput {
    /// Single new value, old value cleared
    pub fn value(new_value: Option<String>) -> Self {
        Self::Single(NewAndOldValue::new(new_value))
    }

    /// Single new value, old value kept
    pub fn values(new_value: Option<String>, old_value: Option<String>) -> Self {
        Self::Single(NewAndOldValue::with_old(new_value, old_value))
    }
}

/// Non-value outcome of a column transform
#[derive(Debug, Error)]
pub enum TransformSignal {
    /// Leave the column out of the target row
    #[error("ignore column")]
    IgnoreColumn,
    /// Drop the whole row
    #[error("ignore row")]
    IgnoreRow,
    /// Unexpected failure
    #[error(transparent)]
    Failed(BoxError),
}

impl TransformSignal {
    /// Wrap a failure
    pub fn failed(error: impl Into<BoxError>) -> Self {
        Self::Failed(error.into())
    }
}

impl From<weir_rdbc::Error> for TransformSignal {
    fn from(e: weir_rdbc::Error) -> Self {
        Self::Failed(Box::new(e))
    }
}

/// Pluggable column logic
#[async_trait]
pub trait ColumnTransform: Send + Sync {
    /// Name used in [`TransformColumn::transform_type`]
    fn name(&self) -> &str;

    /// Usable while extracting
    fn is_extract_column_transform(&self) -> bool {
        true
    }

    /// Usable while loading
    fn is_load_column_transform(&self) -> bool {
        true
    }

    /// Produce the target value for `column`.
    ///
    /// `new_value` and `old_value` are the source column's values, `None`
    /// when the column is computed or absent.
    #[allow(clippy::too_many_arguments)]
    async fn transform(
        &self,
        platform: Option<&dyn DatabasePlatform>,
        ctx: &mut DataContext,
        column: &TransformColumn,
        data: &TransformedData,
        source_values: &HashMap<String, Option<String>>,
        new_value: Option<&str>,
        old_value: Option<&str>,
    ) -> Result<TransformOutput, TransformSignal>;
}

/// Column transforms by name
#[derive(Clone, Default)]
pub struct ColumnTransformRegistry {
    transforms: BTreeMap<String, Arc<dyn ColumnTransform>>,
}

impl ColumnTransformRegistry {
    /// Empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace a transform under its own name
    pub fn register(&mut self, transform: Arc<dyn ColumnTransform>) {
        self.transforms.insert(transform.name().to_string(), transform);
    }

    /// Builder form of [`ColumnTransformRegistry::register`]
    pub fn with(mut self, transform: Arc<dyn ColumnTransform>) -> Self {
        self.register(transform);
        self
    }

    /// Look a transform up by name
    pub fn get(&self, name: &str) -> Option<&Arc<dyn ColumnTransform>> {
        self.transforms.get(name)
    }

    /// Registered names, sorted
    pub fn names(&self) -> Vec<&str> {
        self.transforms.keys().map(String::as_str).collect()
    }
}

impl std::fmt::Debug for ColumnTransformRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ColumnTransformRegistry")
            .field("transforms", &self.names())
            .finish()
    }
}

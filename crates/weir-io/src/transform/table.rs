//! Table and column rules

use super::script::{ScriptEvaluator, ScriptValue, SharedStateStore};
use super::transformed::TransformedData;
use super::{ColumnPolicy, DeleteAction, IncludeOn, TargetDmlAction, TransformPoint};
use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use tracing::debug;
use validator::{Validate, ValidationError};
use weir_rdbc::types::Table;

/// Name of the pass-through transform
pub const COPY_TRANSFORM: &str = "copy";

fn default_transform_type() -> String {
    COPY_TRANSFORM.to_string()
}

// ============================================================================
// Column rule
// ============================================================================

/// How one target column is produced
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Validate)]
pub struct TransformColumn {
    /// Owning rule
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transform_id: Option<String>,
    /// Source column, absent for computed columns
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_column_name: Option<String>,
    /// Target column
    #[validate(length(min = 1))]
    pub target_column_name: String,
    /// Part of the target key
    #[serde(default)]
    pub pk: bool,
    /// Registered transform name
    #[serde(default = "default_transform_type")]
    #[validate(length(min = 1))]
    pub transform_type: String,
    /// Argument interpreted by the transform
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transform_expression: Option<String>,
    /// Position among the rule's columns
    #[serde(default)]
    pub transform_order: i32,
    /// Operations the rule applies to
    #[serde(default)]
    pub include_on: IncludeOn,
}

impl TransformColumn {
    /// Copy `source` into `target`
    pub fn new(source: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            transform_id: None,
            source_column_name: Some(source.into()),
            target_column_name: target.into(),
            pk: false,
            transform_type: default_transform_type(),
            transform_expression: None,
            transform_order: 0,
            include_on: IncludeOn::All,
        }
    }

    /// Computed target column with no source
    pub fn computed(target: impl Into<String>) -> Self {
        Self {
            source_column_name: None,
            ..Self::new("", target)
        }
    }

    /// Mark as key
    pub fn with_pk(mut self, pk: bool) -> Self {
        self.pk = pk;
        self
    }

    /// Set the transform and its expression
    pub fn with_transform(mut self, transform_type: &str, expression: Option<&str>) -> Self {
        self.transform_type = transform_type.to_string();
        self.transform_expression = expression.map(str::to_string);
        self
    }

    /// Restrict to an operation
    pub fn with_include_on(mut self, include_on: IncludeOn) -> Self {
        self.include_on = include_on;
        self
    }

    /// Set the position among the rule's columns
    pub fn with_order(mut self, order: i32) -> Self {
        self.transform_order = order;
        self
    }

    /// Whether this rule names `column` as source or target, ignoring case
    pub fn refers_to(&self, column: &str) -> bool {
        let matches =
            |name: &str| !name.trim().is_empty() && name.eq_ignore_ascii_case(column);
        self.source_column_name.as_deref().is_some_and(matches)
            || matches(&self.target_column_name)
    }

    fn implied(transform_id: Option<&str>, column: &str, include_on: IncludeOn, pk: bool) -> Self {
        Self {
            transform_id: transform_id.map(str::to_string),
            pk,
            include_on,
            ..Self::new(column, column)
        }
    }
}

// ============================================================================
// Update action
// ============================================================================

/// Policy for source updates: a fixed token or a script returning one
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpdateAction {
    /// Fixed policy
    Fixed(TargetDmlAction),
    /// Script evaluated per row
    Script(String),
}

impl Default for UpdateAction {
    fn default() -> Self {
        Self::Fixed(TargetDmlAction::UpdRow)
    }
}

impl From<String> for UpdateAction {
    fn from(s: String) -> Self {
        match s.parse::<TargetDmlAction>() {
            Ok(action) => Self::Fixed(action),
            Err(_) => Self::Script(s),
        }
    }
}

impl From<UpdateAction> for String {
    fn from(action: UpdateAction) -> Self {
        action.to_string()
    }
}

impl fmt::Display for UpdateAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Fixed(action) => f.write_str(action.token()),
            Self::Script(script) => f.write_str(script),
        }
    }
}

impl Serialize for UpdateAction {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for UpdateAction {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        String::deserialize(deserializer).map(Self::from)
    }
}

// ============================================================================
// Table rule
// ============================================================================

fn validate_columns(columns: &[TransformColumn]) -> std::result::Result<(), ValidationError> {
    for (i, column) in columns.iter().enumerate() {
        for other in &columns[i + 1..] {
            if column.target_column_name.eq_ignore_ascii_case(&other.target_column_name)
                && column.include_on == other.include_on
            {
                return Err(ValidationError::new("duplicate_column").with_message(
                    format!(
                        "target column '{}' is mapped twice for {:?}",
                        column.target_column_name, column.include_on
                    )
                    .into(),
                ));
            }
        }
    }
    Ok(())
}

/// Mapping from one source table to one target table
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
pub struct TransformTable {
    /// Rule identifier
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transform_id: Option<String>,
    /// Source catalog
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_catalog_name: Option<String>,
    /// Source schema
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_schema_name: Option<String>,
    /// Source table
    #[validate(length(min = 1))]
    pub source_table_name: String,
    /// Target catalog
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_catalog_name: Option<String>,
    /// Target schema
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_schema_name: Option<String>,
    /// Target table
    #[validate(length(min = 1))]
    pub target_table_name: String,
    /// Side of the pipeline the rule runs on
    #[serde(default)]
    pub transform_point: TransformPoint,
    /// Column rules
    #[serde(default)]
    #[validate(nested)]
    #[validate(custom(function = "validate_columns"))]
    pub transform_columns: Vec<TransformColumn>,
    /// Policy for source updates
    #[serde(default)]
    pub update_action: UpdateAction,
    /// Policy for source deletes
    #[serde(default)]
    pub delete_action: DeleteAction,
    /// Whether unlisted columns pass through
    #[serde(default)]
    pub column_policy: ColumnPolicy,
    /// Try an update before an insert
    #[serde(default)]
    pub update_first: bool,
    /// Position among rules for the same source table
    #[serde(default)]
    pub transform_order: i32,
}

impl TransformTable {
    /// Rule with defaults and no columns
    pub fn new(source_table: impl Into<String>, target_table: impl Into<String>) -> Self {
        Self {
            transform_id: None,
            source_catalog_name: None,
            source_schema_name: None,
            source_table_name: source_table.into(),
            target_catalog_name: None,
            target_schema_name: None,
            target_table_name: target_table.into(),
            transform_point: TransformPoint::Load,
            transform_columns: Vec::new(),
            update_action: UpdateAction::default(),
            delete_action: DeleteAction::default(),
            column_policy: ColumnPolicy::Implied,
            update_first: false,
            transform_order: 0,
        }
    }

    /// Set the identifier
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.transform_id = Some(id.into());
        self
    }

    /// Add a column rule
    pub fn with_column(mut self, column: TransformColumn) -> Self {
        self.add_transform_column(column);
        self
    }

    /// Set the column policy
    pub fn with_column_policy(mut self, policy: ColumnPolicy) -> Self {
        self.column_policy = policy;
        self
    }

    /// Set the update policy
    pub fn with_update_action(mut self, action: UpdateAction) -> Self {
        self.update_action = action;
        self
    }

    /// Set the delete policy
    pub fn with_delete_action(mut self, action: DeleteAction) -> Self {
        self.delete_action = action;
        self
    }

    /// Set the transform point
    pub fn with_transform_point(mut self, point: TransformPoint) -> Self {
        self.transform_point = point;
        self
    }

    /// Set update-before-insert
    pub fn with_update_first(mut self, update_first: bool) -> Self {
        self.update_first = update_first;
        self
    }

    /// Add a column rule
    pub fn add_transform_column(&mut self, mut column: TransformColumn) {
        if column.transform_id.is_none() {
            column.transform_id = self.transform_id.clone();
        }
        self.transform_columns.push(column);
    }

    /// `catalog.schema.table` of the source
    pub fn fully_qualified_source_table_name(&self) -> String {
        Table::qualify(
            self.source_catalog_name.as_deref(),
            self.source_schema_name.as_deref(),
            &self.source_table_name,
        )
    }

    /// `catalog.schema.table` of the target
    pub fn fully_qualified_target_table_name(&self) -> String {
        Table::qualify(
            self.target_catalog_name.as_deref(),
            self.target_schema_name.as_deref(),
            &self.target_table_name,
        )
    }

    /// Key column rules
    pub fn primary_key_columns(&self) -> impl Iterator<Item = &TransformColumn> {
        self.transform_columns.iter().filter(|c| c.pk)
    }

    /// Rules reading `column` as their source
    pub fn transform_columns_for(&self, column: &str) -> Vec<&TransformColumn> {
        self.transform_columns
            .iter()
            .filter(|c| {
                c.source_column_name
                    .as_deref()
                    .is_some_and(|s| s.eq_ignore_ascii_case(column))
            })
            .collect()
    }

    /// Rule producing `target_column` for `include_on`
    pub fn transform_column(&self, target_column: &str, include_on: IncludeOn) -> Option<&TransformColumn> {
        self.transform_columns.iter().find(|c| {
            c.target_column_name.eq_ignore_ascii_case(target_column) && c.include_on == include_on
        })
    }

    /// Copy of this rule with pass-through rules for unlisted columns.
    ///
    /// Under [`ColumnPolicy::Implied`], each key and column name that is not
    /// covered for every operation gets a `copy` rule for each scope it
    /// lacks (or one `All` rule when it has none). Key names become key
    /// rules. The original is never modified and a second application adds
    /// nothing.
    pub fn enhance_with_implied_columns<S: AsRef<str>>(
        &self,
        key_names: &[S],
        column_names: &[S],
    ) -> TransformTable {
        let mut copy = self.clone();
        if self.column_policy != ColumnPolicy::Implied {
            return copy;
        }

        let id = self.transform_id.as_deref();
        for (names, pk) in [(key_names, true), (column_names, false)] {
            for name in names {
                let name = name.as_ref();
                let coverage = Coverage::of(&copy.transform_columns, name);
                for scope in coverage.missing() {
                    copy.transform_columns
                        .push(TransformColumn::implied(id, name, scope, pk));
                }
            }
        }
        copy
    }

    /// Resolve the target operation for a source update.
    ///
    /// Scripts see `sourceDmlType`, `sourceDmlTypeString`, each source column
    /// under its own and upper-cased name, `OLD_<column>` for old values and
    /// `externalData`.
    pub fn evaluate_target_dml_action(
        &self,
        evaluator: Option<&dyn ScriptEvaluator>,
        state: &SharedStateStore,
        data: &TransformedData,
        external_data: Option<&str>,
    ) -> Result<TargetDmlAction> {
        let script = match &self.update_action {
            UpdateAction::Fixed(action) => return Ok(*action),
            UpdateAction::Script(script) => script,
        };
        let evaluator = evaluator.ok_or_else(|| {
            Error::config(format!(
                "update action of {} is a script but no script evaluator is configured",
                self.fully_qualified_source_table_name()
            ))
        })?;

        let mut bindings = BTreeMap::new();
        let source_type = data.source_dml_type().to_string();
        bindings.insert("sourceDmlType".to_string(), ScriptValue::from(source_type.clone()));
        bindings.insert("sourceDmlTypeString".to_string(), ScriptValue::from(source_type));
        bindings.insert("externalData".to_string(), ScriptValue::from(external_data));
        for (name, value) in data.source_values() {
            bindings.insert(name.to_uppercase(), ScriptValue::from(value.clone()));
            bindings.insert(name.clone(), ScriptValue::from(value.clone()));
        }
        for (name, value) in data.old_source_values() {
            bindings.insert(format!("OLD_{}", name), ScriptValue::from(value.clone()));
            bindings.insert(
                format!("OLD_{}", name.to_uppercase()),
                ScriptValue::from(value.clone()),
            );
        }

        let result = evaluator
            .eval(script, &bindings, state)
            .map_err(|e| Error::transform("*", "update_action", e))?;
        let token = result.to_text().unwrap_or_default();
        debug!(
            transform = self.transform_id.as_deref().unwrap_or_default(),
            action = %token,
            "Evaluated update action"
        );
        token
            .parse::<TargetDmlAction>()
            .map_err(|msg| Error::transform("*", "update_action", msg))
    }

    /// Load a list of rules from YAML and validate each
    pub fn from_yaml(yaml: &str) -> Result<Vec<TransformTable>> {
        let tables: Vec<TransformTable> = serde_yaml::from_str(yaml)?;
        for table in &tables {
            table.validate()?;
        }
        Ok(tables)
    }
}

#[derive(Default)]
struct Coverage {
    insert: bool,
    update: bool,
    delete: bool,
}

impl Coverage {
    fn of(columns: &[TransformColumn], name: &str) -> Self {
        let mut coverage = Self::default();
        for column in columns.iter().filter(|c| c.refers_to(name)) {
            match column.include_on {
                IncludeOn::All => {
                    return Self {
                        insert: true,
                        update: true,
                        delete: true,
                    }
                }
                IncludeOn::Insert => coverage.insert = true,
                IncludeOn::Update => coverage.update = true,
                IncludeOn::Delete => coverage.delete = true,
            }
        }
        coverage
    }

    fn missing(&self) -> Vec<IncludeOn> {
        if !self.insert && !self.update && !self.delete {
            return vec![IncludeOn::All];
        }
        [
            (self.insert, IncludeOn::Insert),
            (self.update, IncludeOn::Update),
            (self.delete, IncludeOn::Delete),
        ]
        .into_iter()
        .filter(|(covered, _)| !covered)
        .map(|(_, scope)| scope)
        .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::DataEventType;
    use crate::error::BoxError;
    use pretty_assertions::assert_eq;
    use std::sync::Arc;

    #[test]
    fn test_fully_qualified_names_skip_empty_parts() {
        let mut table = TransformTable::new("CUSTOMER", "CLIENT");
        table.source_schema_name = Some("sales".into());
        table.target_catalog_name = Some(String::new());
        assert_eq!(table.fully_qualified_source_table_name(), "sales.CUSTOMER");
        assert_eq!(table.fully_qualified_target_table_name(), "CLIENT");
    }

    #[test]
    fn test_enhance_adds_missing_scopes() {
        let table = TransformTable::new("CUSTOMER", "CUSTOMER").with_column(
            TransformColumn::new("NAME", "NAME").with_include_on(IncludeOn::Update),
        );
        let enhanced = table.enhance_with_implied_columns(&["ID"], &["ID", "NAME", "EMAIL"]);

        assert_eq!(table.transform_columns.len(), 1);
        let summary: Vec<(String, IncludeOn, bool)> = enhanced
            .transform_columns
            .iter()
            .map(|c| (c.target_column_name.clone(), c.include_on, c.pk))
            .collect();
        assert_eq!(
            summary,
            vec![
                ("NAME".to_string(), IncludeOn::Update, false),
                ("ID".to_string(), IncludeOn::All, true),
                ("NAME".to_string(), IncludeOn::Insert, false),
                ("NAME".to_string(), IncludeOn::Delete, false),
                ("EMAIL".to_string(), IncludeOn::All, false),
            ]
        );
        assert_eq!(
            enhanced.transform_column("NAME", IncludeOn::Insert).map(|c| c.transform_type.as_str()),
            Some(COPY_TRANSFORM)
        );
    }

    #[test]
    fn test_enhance_respects_explicit_policy() {
        let table = TransformTable::new("A", "B").with_column_policy(ColumnPolicy::Explicit);
        let enhanced = table.enhance_with_implied_columns(&["ID"], &["ID", "NAME"]);
        assert!(enhanced.transform_columns.is_empty());
    }

    #[test]
    fn test_enhance_matches_target_names_case_insensitively() {
        let table = TransformTable::new("A", "B")
            .with_column(TransformColumn::new("CUST_ID", "id").with_pk(true));
        let enhanced = table.enhance_with_implied_columns(&["ID"], &["ID"]);
        assert_eq!(enhanced.transform_columns.len(), 1);
    }

    #[test]
    fn test_update_action_parsing() {
        assert_eq!(
            UpdateAction::from("NONE".to_string()),
            UpdateAction::Fixed(TargetDmlAction::NoneAction)
        );
        assert!(matches!(
            UpdateAction::from("return 'DEL_ROW';".to_string()),
            UpdateAction::Script(_)
        ));
    }

    #[test]
    fn test_evaluate_scripted_update_action() {
        let table = TransformTable::new("A", "B")
            .with_update_action(UpdateAction::Script("status".into()));
        let mut values = std::collections::HashMap::new();
        values.insert("status".to_string(), Some("closed".to_string()));
        let data = TransformedData::new(
            &table,
            DataEventType::Update,
            Arc::default(),
            Arc::default(),
            Arc::new(values),
        );
        let evaluator = |_: &str,
                         bindings: &BTreeMap<String, ScriptValue>,
                         _: &SharedStateStore|
         -> std::result::Result<ScriptValue, BoxError> {
            assert_eq!(bindings.get("sourceDmlType"), Some(&ScriptValue::from("UPDATE")));
            match bindings.get("STATUS") {
                Some(ScriptValue::String(s)) if s == "closed" => Ok(ScriptValue::from("DEL_ROW")),
                _ => Ok(ScriptValue::from("UPD_ROW")),
            }
        };
        let action = table
            .evaluate_target_dml_action(Some(&evaluator), &SharedStateStore::new(), &data, None)
            .unwrap();
        assert_eq!(action, TargetDmlAction::DelRow);

        let bad = |_: &str,
                   _: &BTreeMap<String, ScriptValue>,
                   _: &SharedStateStore|
         -> std::result::Result<ScriptValue, BoxError> { Ok(ScriptValue::from("MAYBE")) };
        let err = table
            .evaluate_target_dml_action(Some(&bad), &SharedStateStore::new(), &data, None)
            .unwrap_err();
        assert!(matches!(err, Error::Transform { .. }));

        let err = table
            .evaluate_target_dml_action(None, &SharedStateStore::new(), &data, None)
            .unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn test_from_yaml() {
        let yaml = r#"
- transform_id: customer_to_client
  source_table_name: CUSTOMER
  target_table_name: CLIENT
  update_action: UPD_COL
  delete_action: NONE
  transform_columns:
    - source_column_name: ID
      target_column_name: CLIENT_ID
      pk: true
    - source_column_name: NAME
      target_column_name: FULL_NAME
      transform_type: left
      transform_expression: "10"
      include_on: "*"
"#;
        let tables = TransformTable::from_yaml(yaml).unwrap();
        assert_eq!(tables.len(), 1);
        let table = &tables[0];
        assert_eq!(table.update_action, UpdateAction::Fixed(TargetDmlAction::UpdCol));
        assert_eq!(table.delete_action, DeleteAction::None);
        assert_eq!(table.transform_point, TransformPoint::Load);
        assert_eq!(table.primary_key_columns().count(), 1);
        assert_eq!(table.transform_columns[0].transform_type, COPY_TRANSFORM);
    }

    #[test]
    fn test_from_yaml_rejects_duplicate_targets() {
        let yaml = r#"
- source_table_name: A
  target_table_name: B
  transform_columns:
    - { source_column_name: X, target_column_name: Y }
    - { source_column_name: Z, target_column_name: y }
"#;
        assert!(matches!(TransformTable::from_yaml(yaml), Err(Error::Config(_))));
    }
}

//! Built-in column transforms

use super::{
    ColumnTransform, ColumnTransformRegistry, ScriptEvaluator, ScriptValue, SharedStateStore,
    TransformColumn, TransformOutput, TransformSignal, TransformedData,
};
use crate::context::DataContext;
use crate::data::DataEventType;
use async_trait::async_trait;
use rust_decimal::Decimal;
use std::collections::{BTreeMap, HashMap};
use std::str::FromStr;
use std::sync::Arc;
use tracing::debug;
use weir_rdbc::connection::DatabasePlatform;
use weir_rdbc::dml::qualified_table_name;
use weir_rdbc::types::Value;

type SourceValues = HashMap<String, Option<String>>;
type Outcome = Result<TransformOutput, TransformSignal>;

fn expression(column: &TransformColumn) -> &str {
    column.transform_expression.as_deref().unwrap_or_default()
}

fn owned(value: Option<&str>) -> Option<String> {
    value.map(str::to_string)
}

fn require_platform<'a>(
    platform: Option<&'a dyn DatabasePlatform>,
    name: &str,
) -> Result<&'a dyn DatabasePlatform, TransformSignal> {
    platform.ok_or_else(|| {
        TransformSignal::failed(format!("the {} transform requires a target platform", name))
    })
}

// ============================================================================
// Pass-through and constants
// ============================================================================

/// Copies the source value unchanged
#[derive(Debug, Default, Clone, Copy)]
pub struct CopyColumnTransform;

impl CopyColumnTransform {
    /// Registered name
    pub const NAME: &'static str = "copy";
}

#[async_trait]
impl ColumnTransform for CopyColumnTransform {
    fn name(&self) -> &str {
        Self::NAME
    }

    async fn transform(
        &self,
        _platform: Option<&dyn DatabasePlatform>,
        _ctx: &mut DataContext,
        _column: &TransformColumn,
        _data: &TransformedData,
        _source_values: &SourceValues,
        new_value: Option<&str>,
        old_value: Option<&str>,
    ) -> Outcome {
        Ok(TransformOutput::values(owned(new_value), owned(old_value)))
    }
}

/// Emits the expression text
#[derive(Debug, Default, Clone, Copy)]
pub struct ConstColumnTransform;

impl ConstColumnTransform {
    /// Registered name
    pub const NAME: &'static str = "const";
}

#[async_trait]
impl ColumnTransform for ConstColumnTransform {
    fn name(&self) -> &str {
        Self::NAME
    }

    async fn transform(
        &self,
        _platform: Option<&dyn DatabasePlatform>,
        _ctx: &mut DataContext,
        column: &TransformColumn,
        _data: &TransformedData,
        _source_values: &SourceValues,
        _new_value: Option<&str>,
        _old_value: Option<&str>,
    ) -> Outcome {
        Ok(TransformOutput::value(column.transform_expression.clone()))
    }
}

/// Emits a value known to the pipeline, named by the expression.
///
/// Supported names: `system_date`, `system_timestamp`, `source_node_id`,
/// `target_node_id`, `null`, `old_column_value`, `source_catalog_name`,
/// `source_schema_name`, `source_table_name` and `batch_id`.
#[derive(Debug, Default, Clone, Copy)]
pub struct VariableColumnTransform;

impl VariableColumnTransform {
    /// Registered name
    pub const NAME: &'static str = "variable";

    /// Variable names understood by this transform
    pub const VARIABLES: [&'static str; 10] = [
        "system_date",
        "system_timestamp",
        "source_node_id",
        "target_node_id",
        "null",
        "old_column_value",
        "source_catalog_name",
        "source_schema_name",
        "source_table_name",
        "batch_id",
    ];
}

#[async_trait]
impl ColumnTransform for VariableColumnTransform {
    fn name(&self) -> &str {
        Self::NAME
    }

    async fn transform(
        &self,
        _platform: Option<&dyn DatabasePlatform>,
        ctx: &mut DataContext,
        column: &TransformColumn,
        _data: &TransformedData,
        _source_values: &SourceValues,
        _new_value: Option<&str>,
        old_value: Option<&str>,
    ) -> Outcome {
        let variable = expression(column).trim().to_lowercase();
        let value = match variable.as_str() {
            "system_date" => Some(chrono::Local::now().format("%Y-%m-%d").to_string()),
            "system_timestamp" => Some(
                chrono::Local::now()
                    .format("%Y-%m-%d %H:%M:%S%.3f")
                    .to_string(),
            ),
            "source_node_id" => ctx.batch().and_then(|b| b.source_node_id.clone()),
            "target_node_id" => ctx.batch().and_then(|b| b.target_node_id.clone()),
            "null" => None,
            "old_column_value" => owned(old_value),
            "source_catalog_name" => ctx.table().and_then(|t| t.catalog.clone()),
            "source_schema_name" => ctx.table().and_then(|t| t.schema.clone()),
            "source_table_name" => ctx.table().map(|t| t.name.clone()),
            "batch_id" => ctx.batch().map(|b| b.batch_id.to_string()),
            other => {
                return Err(TransformSignal::failed(format!(
                    "unknown variable '{}'",
                    other
                )))
            }
        };
        Ok(TransformOutput::value(value))
    }
}

// ============================================================================
// String shaping
// ============================================================================

/// Character range `start,end` of the source value
#[derive(Debug, Default, Clone, Copy)]
pub struct SubstrColumnTransform;

impl SubstrColumnTransform {
    /// Registered name
    pub const NAME: &'static str = "substr";

    fn bounds(expression: &str) -> Result<(usize, Option<usize>), TransformSignal> {
        let parse = |s: &str| {
            s.trim().parse::<usize>().map_err(|_| {
                TransformSignal::failed(format!("'{}' is not a substring bound", s.trim()))
            })
        };
        match expression.split_once(',') {
            Some((start, end)) => Ok((parse(start)?, Some(parse(end)?))),
            None if expression.trim().is_empty() => Ok((0, None)),
            None => Ok((parse(expression)?, None)),
        }
    }
}

#[async_trait]
impl ColumnTransform for SubstrColumnTransform {
    fn name(&self) -> &str {
        Self::NAME
    }

    async fn transform(
        &self,
        _platform: Option<&dyn DatabasePlatform>,
        _ctx: &mut DataContext,
        column: &TransformColumn,
        _data: &TransformedData,
        _source_values: &SourceValues,
        new_value: Option<&str>,
        _old_value: Option<&str>,
    ) -> Outcome {
        let Some(value) = new_value else {
            return Ok(TransformOutput::value(None));
        };
        let (start, end) = Self::bounds(expression(column))?;
        let len = value.chars().count();
        let start = start.min(len);
        let end = end.unwrap_or(len).clamp(start, len);
        let substring: String = value.chars().skip(start).take(end - start).collect();
        Ok(TransformOutput::value(Some(substring)))
    }
}

fn leading_count(column: &TransformColumn) -> Result<usize, TransformSignal> {
    let expr = expression(column).trim();
    expr.parse::<usize>()
        .map_err(|_| TransformSignal::failed(format!("'{}' is not a length", expr)))
}

/// First `n` characters of the source value
#[derive(Debug, Default, Clone, Copy)]
pub struct LeftColumnTransform;

impl LeftColumnTransform {
    /// Registered name
    pub const NAME: &'static str = "left";
}

#[async_trait]
impl ColumnTransform for LeftColumnTransform {
    fn name(&self) -> &str {
        Self::NAME
    }

    async fn transform(
        &self,
        _platform: Option<&dyn DatabasePlatform>,
        _ctx: &mut DataContext,
        column: &TransformColumn,
        _data: &TransformedData,
        _source_values: &SourceValues,
        new_value: Option<&str>,
        _old_value: Option<&str>,
    ) -> Outcome {
        let Some(value) = new_value else {
            return Ok(TransformOutput::value(None));
        };
        let n = leading_count(column)?;
        Ok(TransformOutput::value(Some(value.chars().take(n).collect())))
    }
}

/// At most `n` bytes of the source value, cut on a character boundary
#[derive(Debug, Default, Clone, Copy)]
pub struct BinaryLeftColumnTransform;

impl BinaryLeftColumnTransform {
    /// Registered name
    pub const NAME: &'static str = "bleft";
}

#[async_trait]
impl ColumnTransform for BinaryLeftColumnTransform {
    fn name(&self) -> &str {
        Self::NAME
    }

    async fn transform(
        &self,
        _platform: Option<&dyn DatabasePlatform>,
        _ctx: &mut DataContext,
        column: &TransformColumn,
        _data: &TransformedData,
        _source_values: &SourceValues,
        new_value: Option<&str>,
        _old_value: Option<&str>,
    ) -> Outcome {
        let Some(value) = new_value else {
            return Ok(TransformOutput::value(None));
        };
        let mut end = leading_count(column)?.min(value.len());
        while !value.is_char_boundary(end) {
            end -= 1;
        }
        Ok(TransformOutput::value(Some(value[..end].to_string())))
    }
}

/// Which source values count as missing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Missing {
    /// `null` only
    Null,
    /// `null` or the empty string
    Empty,
    /// `null` or whitespace only
    Blank,
}

/// Substitutes the expression when the source value is missing
#[derive(Debug, Clone, Copy)]
pub struct DefaultValueColumnTransform {
    missing: Missing,
}

impl DefaultValueColumnTransform {
    /// `isnull`
    pub const IS_NULL: &'static str = "isnull";
    /// `isempty`
    pub const IS_EMPTY: &'static str = "isempty";
    /// `isblank`
    pub const IS_BLANK: &'static str = "isblank";

    /// Transform treating `missing` values as absent
    pub fn new(missing: Missing) -> Self {
        Self { missing }
    }

    fn is_missing(&self, value: Option<&str>) -> bool {
        match (self.missing, value) {
            (_, None) => true,
            (Missing::Null, Some(_)) => false,
            (Missing::Empty, Some(v)) => v.is_empty(),
            (Missing::Blank, Some(v)) => v.trim().is_empty(),
        }
    }
}

#[async_trait]
impl ColumnTransform for DefaultValueColumnTransform {
    fn name(&self) -> &str {
        match self.missing {
            Missing::Null => Self::IS_NULL,
            Missing::Empty => Self::IS_EMPTY,
            Missing::Blank => Self::IS_BLANK,
        }
    }

    async fn transform(
        &self,
        _platform: Option<&dyn DatabasePlatform>,
        _ctx: &mut DataContext,
        column: &TransformColumn,
        _data: &TransformedData,
        _source_values: &SourceValues,
        new_value: Option<&str>,
        _old_value: Option<&str>,
    ) -> Outcome {
        if self.is_missing(new_value) {
            Ok(TransformOutput::value(column.transform_expression.clone()))
        } else {
            Ok(TransformOutput::value(owned(new_value)))
        }
    }
}

/// Maps source values through `from=to` pairs separated by spaces.
///
/// `*=value` supplies the default; without one, unmatched values become null.
#[derive(Debug, Default, Clone, Copy)]
pub struct ValueMapColumnTransform;

impl ValueMapColumnTransform {
    /// Registered name
    pub const NAME: &'static str = "valuemap";

    fn lookup(expression: &str, value: Option<&str>) -> Option<String> {
        let mut default = None;
        for (from, to) in expression
            .split_whitespace()
            .filter_map(|pair| pair.split_once('='))
        {
            if from == "*" {
                default = Some(to);
            } else if Some(from) == value {
                return Some(to.to_string());
            }
        }
        default.map(str::to_string)
    }
}

#[async_trait]
impl ColumnTransform for ValueMapColumnTransform {
    fn name(&self) -> &str {
        Self::NAME
    }

    async fn transform(
        &self,
        _platform: Option<&dyn DatabasePlatform>,
        _ctx: &mut DataContext,
        column: &TransformColumn,
        _data: &TransformedData,
        _source_values: &SourceValues,
        new_value: Option<&str>,
        _old_value: Option<&str>,
    ) -> Outcome {
        Ok(TransformOutput::value(Self::lookup(
            expression(column),
            new_value,
        )))
    }
}

// ============================================================================
// Column and row control
// ============================================================================

/// Leaves the column out of the target row
#[derive(Debug, Default, Clone, Copy)]
pub struct RemoveColumnTransform;

impl RemoveColumnTransform {
    /// Registered name
    pub const NAME: &'static str = "remove";
}

#[async_trait]
impl ColumnTransform for RemoveColumnTransform {
    fn name(&self) -> &str {
        Self::NAME
    }

    async fn transform(
        &self,
        _platform: Option<&dyn DatabasePlatform>,
        _ctx: &mut DataContext,
        _column: &TransformColumn,
        _data: &TransformedData,
        _source_values: &SourceValues,
        _new_value: Option<&str>,
        _old_value: Option<&str>,
    ) -> Outcome {
        Err(TransformSignal::IgnoreColumn)
    }
}

/// Keeps the value except on inserts, where the target generates it
#[derive(Debug, Default, Clone, Copy)]
pub struct IdentityColumnTransform;

impl IdentityColumnTransform {
    /// Registered name
    pub const NAME: &'static str = "identity";
}

#[async_trait]
impl ColumnTransform for IdentityColumnTransform {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn is_extract_column_transform(&self) -> bool {
        false
    }

    async fn transform(
        &self,
        _platform: Option<&dyn DatabasePlatform>,
        _ctx: &mut DataContext,
        _column: &TransformColumn,
        data: &TransformedData,
        _source_values: &SourceValues,
        new_value: Option<&str>,
        old_value: Option<&str>,
    ) -> Outcome {
        if data.target_dml_type() == DataEventType::Insert {
            Err(TransformSignal::IgnoreColumn)
        } else {
            Ok(TransformOutput::values(owned(new_value), owned(old_value)))
        }
    }
}

// ============================================================================
// Database-backed transforms
// ============================================================================

fn parse_decimal(value: Option<&str>, what: &str) -> Result<Decimal, TransformSignal> {
    match value.map(str::trim).filter(|v| !v.is_empty()) {
        None => Ok(Decimal::ZERO),
        Some(v) => Decimal::from_str(v)
            .map_err(|_| TransformSignal::failed(format!("{} '{}' is not numeric", what, v))),
    }
}

/// Applies the numeric change of the source column as an increment.
///
/// The expression is an optional multiplier. Inserts carry the delta as the
/// value. Updates and deletes first try `column = column + delta` at the
/// target and drop the column when a row was hit.
#[derive(Debug, Default, Clone, Copy)]
pub struct AdditiveColumnTransform;

impl AdditiveColumnTransform {
    /// Registered name
    pub const NAME: &'static str = "additive";
}

#[async_trait]
impl ColumnTransform for AdditiveColumnTransform {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn is_extract_column_transform(&self) -> bool {
        false
    }

    async fn transform(
        &self,
        platform: Option<&dyn DatabasePlatform>,
        _ctx: &mut DataContext,
        column: &TransformColumn,
        data: &TransformedData,
        _source_values: &SourceValues,
        new_value: Option<&str>,
        old_value: Option<&str>,
    ) -> Outcome {
        let multiplier = match column.transform_expression.as_deref() {
            Some(expr) if !expr.trim().is_empty() => parse_decimal(Some(expr), "multiplier")?,
            _ => Decimal::ONE,
        };
        let new = match data.source_dml_type() {
            DataEventType::Delete => Decimal::ZERO,
            _ => parse_decimal(new_value, "value")?,
        };
        let old = parse_decimal(old_value, "old value")?;
        let delta = (new - old) * multiplier;

        if data.target_dml_type() == DataEventType::Insert {
            return Ok(TransformOutput::value(Some(delta.normalize().to_string())));
        }

        let platform = require_platform(platform, Self::NAME)?;
        let dialect = platform.dialect();
        let target = data.build_target_table();
        let quoted = dialect.quote_identifier(&column.target_column_name);
        let mut sql = format!(
            "update {} set {} = {} + ? where ",
            qualified_table_name(
                target.catalog.as_deref(),
                target.schema.as_deref(),
                &target.name,
                &platform.database_info(),
            ),
            quoted,
            quoted
        );
        let mut params = vec![Value::Decimal(delta)];
        let key_names = data.key_names();
        if key_names.is_empty() {
            return Err(TransformSignal::failed(
                "the additive transform requires target key columns",
            ));
        }
        for (i, (name, value)) in key_names.iter().zip(data.key_values()).enumerate() {
            if i > 0 {
                sql.push_str(" and ");
            }
            let name = dialect.quote_identifier(name);
            match value {
                Some(value) => {
                    sql.push_str(&format!("{} = ?", name));
                    params.push(Value::String(value));
                }
                None => sql.push_str(&format!("{} is null", name)),
            }
        }

        let tx = platform.begin().await?;
        let updated = match tx.execute(&sql, &params).await {
            Ok(count) => count,
            Err(e) => {
                let _ = tx.rollback().await;
                return Err(e.into());
            }
        };
        tx.commit().await?;
        debug!(column = %column.target_column_name, %delta, updated, "Applied additive delta");

        if updated > 0 {
            Err(TransformSignal::IgnoreColumn)
        } else {
            Ok(TransformOutput::value(Some(delta.normalize().to_string())))
        }
    }
}

fn sql_bindings(source_values: &SourceValues, data: &TransformedData) -> HashMap<String, Value> {
    let text = |v: &Option<String>| v.clone().map_or(Value::Null, Value::String);
    let mut params = HashMap::new();
    for (name, value) in source_values {
        params.insert(name.to_uppercase(), text(value));
        params.insert(name.clone(), text(value));
    }
    for (name, value) in data.old_source_values() {
        params.insert(format!("OLD_{}", name.to_uppercase()), text(value));
        params.insert(format!("OLD_{}", name), text(value));
    }
    params
}

async fn first_column(
    platform: &dyn DatabasePlatform,
    sql: &str,
    params: &HashMap<String, Value>,
) -> Result<Vec<Option<String>>, TransformSignal> {
    let tx = platform.begin().await?;
    let rows = tx.query_named(sql, params).await;
    tx.rollback().await?;
    Ok(rows?
        .iter()
        .map(|row| row.get(0).and_then(Value::to_text))
        .collect())
}

/// Reads the value from the target with the named-parameter SQL in the
/// expression. Source columns bind under their names, old values as `OLD_`.
#[derive(Debug, Default, Clone, Copy)]
pub struct LookupColumnTransform;

impl LookupColumnTransform {
    /// Registered name
    pub const NAME: &'static str = "lookup";
}

#[async_trait]
impl ColumnTransform for LookupColumnTransform {
    fn name(&self) -> &str {
        Self::NAME
    }

    async fn transform(
        &self,
        platform: Option<&dyn DatabasePlatform>,
        _ctx: &mut DataContext,
        column: &TransformColumn,
        data: &TransformedData,
        source_values: &SourceValues,
        _new_value: Option<&str>,
        _old_value: Option<&str>,
    ) -> Outcome {
        let platform = require_platform(platform, Self::NAME)?;
        let sql = expression(column);
        if sql.trim().is_empty() {
            return Err(TransformSignal::failed("lookup requires a SQL expression"));
        }
        let values = first_column(platform, sql, &sql_bindings(source_values, data)).await?;
        Ok(TransformOutput::value(values.into_iter().next().flatten()))
    }
}

/// Fans the row out, one target row per row returned by the expression SQL
#[derive(Debug, Default, Clone, Copy)]
pub struct MultiplierColumnTransform;

impl MultiplierColumnTransform {
    /// Registered name
    pub const NAME: &'static str = "multiply";
}

#[async_trait]
impl ColumnTransform for MultiplierColumnTransform {
    fn name(&self) -> &str {
        Self::NAME
    }

    async fn transform(
        &self,
        platform: Option<&dyn DatabasePlatform>,
        _ctx: &mut DataContext,
        column: &TransformColumn,
        data: &TransformedData,
        source_values: &SourceValues,
        _new_value: Option<&str>,
        _old_value: Option<&str>,
    ) -> Outcome {
        let platform = require_platform(platform, Self::NAME)?;
        let values =
            first_column(platform, expression(column), &sql_bindings(source_values, data)).await?;
        Ok(TransformOutput::Multi(values))
    }
}

// ============================================================================
// Script
// ============================================================================

/// Evaluates the expression with the configured script runtime.
///
/// Bindings: `currentValue`, `oldValue`, `channelId`, `sourceNodeId`,
/// `targetNodeId`, `batchId`, `sourceDmlType`, every source column under its
/// own and upper-cased name, `OLD_<column>` and the context values.
pub struct ScriptColumnTransform {
    evaluator: Arc<dyn ScriptEvaluator>,
    state: SharedStateStore,
}

impl ScriptColumnTransform {
    /// Registered name
    pub const NAME: &'static str = "script";

    /// Transform backed by `evaluator`
    pub fn new(evaluator: Arc<dyn ScriptEvaluator>, state: SharedStateStore) -> Self {
        Self { evaluator, state }
    }

    fn bindings(
        ctx: &DataContext,
        data: &TransformedData,
        source_values: &SourceValues,
        new_value: Option<&str>,
        old_value: Option<&str>,
    ) -> BTreeMap<String, ScriptValue> {
        let mut bindings: BTreeMap<String, ScriptValue> = ctx
            .values()
            .iter()
            .map(|(k, v)| (k.clone(), ScriptValue::from(v)))
            .collect();
        for (name, value) in source_values {
            bindings.insert(name.to_uppercase(), ScriptValue::from(value.clone()));
            bindings.insert(name.clone(), ScriptValue::from(value.clone()));
        }
        for (name, value) in data.old_source_values() {
            bindings.insert(format!("OLD_{}", name.to_uppercase()), ScriptValue::from(value.clone()));
        }
        bindings.insert("currentValue".into(), ScriptValue::from(new_value));
        bindings.insert("oldValue".into(), ScriptValue::from(old_value));
        bindings.insert("sourceDmlType".into(), data.source_dml_type().to_string().into());
        if let Some(batch) = ctx.batch() {
            bindings.insert("channelId".into(), batch.channel_id.clone().into());
            bindings.insert("batchId".into(), batch.batch_id.into());
            bindings.insert("sourceNodeId".into(), batch.source_node_id.clone().into());
            bindings.insert("targetNodeId".into(), batch.target_node_id.clone().into());
        }
        bindings
    }
}

impl std::fmt::Debug for ScriptColumnTransform {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScriptColumnTransform").finish_non_exhaustive()
    }
}

#[async_trait]
impl ColumnTransform for ScriptColumnTransform {
    fn name(&self) -> &str {
        Self::NAME
    }

    async fn transform(
        &self,
        _platform: Option<&dyn DatabasePlatform>,
        ctx: &mut DataContext,
        column: &TransformColumn,
        data: &TransformedData,
        source_values: &SourceValues,
        new_value: Option<&str>,
        old_value: Option<&str>,
    ) -> Outcome {
        let bindings = Self::bindings(ctx, data, source_values, new_value, old_value);
        match self
            .evaluator
            .eval(expression(column), &bindings, &self.state)
            .map_err(TransformSignal::Failed)?
        {
            ScriptValue::IgnoreColumn => Err(TransformSignal::IgnoreColumn),
            ScriptValue::IgnoreRow => Err(TransformSignal::IgnoreRow),
            ScriptValue::List(values) => Ok(TransformOutput::Multi(values)),
            other => Ok(TransformOutput::value(other.to_text())),
        }
    }
}

// ============================================================================
// Registry
// ============================================================================

impl ColumnTransformRegistry {
    /// Registry holding every built-in except `script`
    pub fn with_defaults() -> Self {
        Self::new()
            .with(Arc::new(CopyColumnTransform))
            .with(Arc::new(ConstColumnTransform))
            .with(Arc::new(VariableColumnTransform))
            .with(Arc::new(SubstrColumnTransform))
            .with(Arc::new(LeftColumnTransform))
            .with(Arc::new(BinaryLeftColumnTransform))
            .with(Arc::new(DefaultValueColumnTransform::new(Missing::Null)))
            .with(Arc::new(DefaultValueColumnTransform::new(Missing::Empty)))
            .with(Arc::new(DefaultValueColumnTransform::new(Missing::Blank)))
            .with(Arc::new(ValueMapColumnTransform))
            .with(Arc::new(RemoveColumnTransform))
            .with(Arc::new(IdentityColumnTransform))
            .with(Arc::new(AdditiveColumnTransform))
            .with(Arc::new(LookupColumnTransform))
            .with(Arc::new(MultiplierColumnTransform))
    }

    /// Add the `script` transform backed by `evaluator`
    pub fn with_script_evaluator(
        self,
        evaluator: Arc<dyn ScriptEvaluator>,
        state: SharedStateStore,
    ) -> Self {
        self.with(Arc::new(ScriptColumnTransform::new(evaluator, state)))
    }
}

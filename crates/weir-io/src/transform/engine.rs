//! Applies transformation rules to one source row

use super::{
    ColumnTransformRegistry, DeleteAction, ScriptEvaluator, SharedStateStore, TransformColumn,
    TransformOutput, TransformPoint, TransformSignal, TransformTable, TransformedData,
};
use crate::context::DataContext;
use crate::data::DataEventType;
use crate::error::{Error, Result};
use std::sync::Arc;
use tracing::{debug, error, warn};
use weir_rdbc::connection::DatabasePlatform;

type SourceValues = std::collections::HashMap<String, Option<String>>;

/// Source row handed to [`TransformEngine::transform`]
#[derive(Debug, Clone)]
pub struct SourceRow {
    /// Operation captured at the source
    pub dml_type: DataEventType,
    /// Key values of the source row
    pub key_values: Arc<SourceValues>,
    /// Values before the change
    pub old_values: Arc<SourceValues>,
    /// Values after the change (old values for deletes)
    pub values: Arc<SourceValues>,
    /// Opaque data carried with the change
    pub external_data: Option<String>,
}

/// Runs [`TransformTable`] rules through the registered column transforms
pub struct TransformEngine {
    registry: ColumnTransformRegistry,
    point: TransformPoint,
    evaluator: Option<Arc<dyn ScriptEvaluator>>,
    state: SharedStateStore,
}

impl TransformEngine {
    /// Engine with the built-in transforms for `point`
    pub fn new(point: TransformPoint) -> Self {
        Self {
            registry: ColumnTransformRegistry::with_defaults(),
            point,
            evaluator: None,
            state: SharedStateStore::global().clone(),
        }
    }

    /// Replace the column transform registry
    pub fn with_registry(mut self, registry: ColumnTransformRegistry) -> Self {
        self.registry = registry;
        self
    }

    /// Use a private script state store instead of the process-wide one
    pub fn with_state(mut self, state: SharedStateStore) -> Self {
        self.state = state;
        self
    }

    /// Enable scripted update actions and the `script` column transform
    pub fn with_script_evaluator(mut self, evaluator: Arc<dyn ScriptEvaluator>) -> Self {
        self.registry = self
            .registry
            .with_script_evaluator(evaluator.clone(), self.state.clone());
        self.evaluator = Some(evaluator);
        self
    }

    /// Side of the pipeline this engine serves
    pub fn point(&self) -> TransformPoint {
        self.point
    }

    /// Registered column transforms
    pub fn registry(&self) -> &ColumnTransformRegistry {
        &self.registry
    }

    /// Script state shared by every evaluation
    pub fn state(&self) -> &SharedStateStore {
        &self.state
    }

    /// Transform one source row into zero or more target rows.
    ///
    /// Returns [`Error::IgnoreRow`] when a column transform drops the row.
    pub async fn transform(
        &self,
        platform: Option<&dyn DatabasePlatform>,
        ctx: &mut DataContext,
        transformation: &TransformTable,
        source: &SourceRow,
    ) -> Result<Vec<TransformedData>> {
        let rows = self.create(platform, ctx, transformation, source).await?;
        let mut results = Vec::with_capacity(rows.len());
        for row in rows {
            if let Some(row) = self.perform(platform, ctx, transformation, source, row).await? {
                results.push(row);
            }
        }
        Ok(results)
    }

    fn columns<'a>(
        transformation: &'a TransformTable,
        dml_type: DataEventType,
        pk: bool,
    ) -> Vec<&'a TransformColumn> {
        let mut columns: Vec<_> = transformation
            .transform_columns
            .iter()
            .filter(|c| c.pk == pk && c.include_on.matches(dml_type))
            .collect();
        columns.sort_by_key(|c| c.transform_order);
        columns
    }

    /// Build the key part of every target row, fanning out on multi-valued keys
    async fn create(
        &self,
        platform: Option<&dyn DatabasePlatform>,
        ctx: &mut DataContext,
        transformation: &TransformTable,
        source: &SourceRow,
    ) -> Result<Vec<TransformedData>> {
        let key_columns = Self::columns(transformation, source.dml_type, true);
        if key_columns.is_empty() {
            error!(
                transform = transformation.transform_id.as_deref().unwrap_or_default(),
                table = %transformation.fully_qualified_source_table_name(),
                "No primary key transform columns are defined; the row is skipped"
            );
            return Ok(Vec::new());
        }

        let mut rows = vec![TransformedData::new(
            transformation,
            source.dml_type,
            source.key_values.clone(),
            source.old_values.clone(),
            source.values.clone(),
        )];
        for column in key_columns {
            let mut next = Vec::with_capacity(rows.len());
            for mut row in rows {
                match self.apply(platform, ctx, column, &row, source).await? {
                    None => next.push(row),
                    Some(TransformOutput::Single(value)) => {
                        row.put(column, value.new_value, value.old_value, true);
                        next.push(row);
                    }
                    Some(TransformOutput::Multi(values)) => {
                        if values.is_empty() {
                            return Err(Error::IgnoreRow);
                        }
                        for value in values {
                            let mut copy = row.clone();
                            copy.put(column, value, None, true);
                            next.push(copy);
                        }
                    }
                }
            }
            rows = next;
        }
        Ok(rows)
    }

    /// Resolve the target operation and fill in the remaining columns
    async fn perform(
        &self,
        platform: Option<&dyn DatabasePlatform>,
        ctx: &mut DataContext,
        transformation: &TransformTable,
        source: &SourceRow,
        mut row: TransformedData,
    ) -> Result<Option<TransformedData>> {
        match source.dml_type {
            DataEventType::Update => {
                let action = transformation.evaluate_target_dml_action(
                    self.evaluator.as_deref(),
                    &self.state,
                    &row,
                    source.external_data.as_deref(),
                )?;
                match action.event_type() {
                    Some(target) => row.set_target_dml_type(target),
                    None => {
                        debug!(transform = row.transform_id().unwrap_or_default(), "Update action is NONE");
                        return Ok(None);
                    }
                }
            }
            DataEventType::Delete => match transformation.delete_action {
                DeleteAction::DelRow => {}
                DeleteAction::UpdateCol => row.set_target_dml_type(DataEventType::Update),
                DeleteAction::None => return Ok(None),
            },
            DataEventType::Insert if transformation.update_first => {
                row.set_target_dml_type(DataEventType::Update);
            }
            _ => {}
        }

        if row.target_dml_type() != DataEventType::Delete {
            for column in Self::columns(transformation, source.dml_type, false) {
                if let Some(name) = column.source_column_name.as_deref() {
                    if !source.values.contains_key(name) {
                        warn!(
                            column = name,
                            table = %transformation.fully_qualified_source_table_name(),
                            "Source column is not present in the row; skipping its transform"
                        );
                        continue;
                    }
                }
                match self.apply(platform, ctx, column, &row, source).await? {
                    None => {}
                    Some(TransformOutput::Single(value)) => {
                        row.put(column, value.new_value, value.old_value, false)
                    }
                    Some(TransformOutput::Multi(values)) => {
                        warn!(
                            column = %column.target_column_name,
                            "Multiple values returned for a non-key column; using the first"
                        );
                        row.put(column, values.into_iter().next().flatten(), None, false);
                    }
                }
            }
        }

        Ok(row.has_columns().then_some(row))
    }

    /// Run one column transform. `None` means the column is left out.
    async fn apply(
        &self,
        platform: Option<&dyn DatabasePlatform>,
        ctx: &mut DataContext,
        column: &TransformColumn,
        row: &TransformedData,
        source: &SourceRow,
    ) -> Result<Option<TransformOutput>> {
        let (new_value, old_value) = match column.source_column_name.as_deref() {
            Some(name) => (
                source.values.get(name).cloned().flatten(),
                source.old_values.get(name).cloned().flatten(),
            ),
            None => (None, None),
        };
        let passthrough = || -> Result<Option<TransformOutput>> {
            Ok(Some(TransformOutput::values(new_value.clone(), old_value.clone())))
        };

        let Some(transform) = self.registry.get(&column.transform_type) else {
            warn!(
                transform = %column.transform_type,
                column = %column.target_column_name,
                "Unknown column transform; copying the value"
            );
            return passthrough();
        };
        let applicable = match self.point {
            TransformPoint::Extract => transform.is_extract_column_transform(),
            TransformPoint::Load => transform.is_load_column_transform(),
        };
        if !applicable {
            return passthrough();
        }

        match transform
            .transform(
                platform,
                ctx,
                column,
                row,
                &source.values,
                new_value.as_deref(),
                old_value.as_deref(),
            )
            .await
        {
            Ok(output) => Ok(Some(output)),
            Err(TransformSignal::IgnoreColumn) => Ok(None),
            Err(TransformSignal::IgnoreRow) => Err(Error::IgnoreRow),
            Err(TransformSignal::Failed(e)) => Err(Error::transform(
                column.target_column_name.clone(),
                column.transform_type.clone(),
                e,
            )),
        }
    }
}

impl std::fmt::Debug for TransformEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransformEngine")
            .field("registry", &self.registry)
            .field("point", &self.point)
            .field("scripting", &self.evaluator.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::BoxError;
    use crate::transform::{IncludeOn, ScriptValue, TargetDmlAction, UpdateAction};
    use pretty_assertions::assert_eq;
    use std::collections::{BTreeMap, HashMap};

    fn values(pairs: &[(&str, &str)]) -> Arc<SourceValues> {
        Arc::new(
            pairs
                .iter()
                .map(|(k, v)| (k.to_string(), Some(v.to_string())))
                .collect::<HashMap<_, _>>(),
        )
    }

    fn source(dml_type: DataEventType, pairs: &[(&str, &str)]) -> SourceRow {
        SourceRow {
            dml_type,
            key_values: values(&pairs[..1]),
            old_values: Arc::default(),
            values: values(pairs),
            external_data: None,
        }
    }

    fn rule() -> TransformTable {
        TransformTable::new("SRC", "TGT")
            .with_column(TransformColumn::new("ID", "ID").with_pk(true))
            .with_column(TransformColumn::new("NAME", "FULL_NAME"))
    }

    #[tokio::test]
    async fn test_copy_rule() {
        let engine = TransformEngine::new(TransformPoint::Load).with_state(SharedStateStore::new());
        let mut ctx = DataContext::new();
        let rows = engine
            .transform(None, &mut ctx, &rule(), &source(DataEventType::Insert, &[("ID", "1"), ("NAME", "a")]))
            .await
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].column_names(), vec!["ID", "FULL_NAME"]);
        assert_eq!(rows[0].key_values(), vec![Some("1".to_string())]);
        assert_eq!(rows[0].target_dml_type(), DataEventType::Insert);
    }

    #[tokio::test]
    async fn test_no_key_columns_yields_nothing() {
        let engine = TransformEngine::new(TransformPoint::Load);
        let mut ctx = DataContext::new();
        let table = TransformTable::new("SRC", "TGT").with_column(TransformColumn::new("NAME", "NAME"));
        let rows = engine
            .transform(None, &mut ctx, &table, &source(DataEventType::Insert, &[("ID", "1"), ("NAME", "a")]))
            .await
            .unwrap();
        assert!(rows.is_empty());
    }

    #[tokio::test]
    async fn test_multi_key_fans_out() {
        let evaluator = |_: &str, _: &BTreeMap<String, ScriptValue>, _: &SharedStateStore| {
            Ok::<_, BoxError>(ScriptValue::List(vec![Some("x".into()), Some("y".into())]))
        };
        let engine = TransformEngine::new(TransformPoint::Load)
            .with_state(SharedStateStore::new())
            .with_script_evaluator(Arc::new(evaluator));
        let table = TransformTable::new("SRC", "TGT")
            .with_column(TransformColumn::computed("CODE").with_pk(true).with_transform("script", Some("codes")))
            .with_column(TransformColumn::new("NAME", "NAME"));
        let mut ctx = DataContext::new();
        let rows = engine
            .transform(None, &mut ctx, &table, &source(DataEventType::Insert, &[("ID", "1"), ("NAME", "a")]))
            .await
            .unwrap();
        let keys: Vec<_> = rows.iter().map(|r| r.key_values()).collect();
        assert_eq!(keys, vec![vec![Some("x".to_string())], vec![Some("y".to_string())]]);
        assert!(rows.iter().all(|r| r.column_names() == vec!["CODE", "NAME"]));
    }

    #[tokio::test]
    async fn test_ignore_row_and_failures() {
        let evaluator = |script: &str, _: &BTreeMap<String, ScriptValue>, _: &SharedStateStore| {
            match script {
                "skip" => Ok(ScriptValue::IgnoreRow),
                _ => Err::<ScriptValue, BoxError>("boom".into()),
            }
        };
        let engine = TransformEngine::new(TransformPoint::Load)
            .with_state(SharedStateStore::new())
            .with_script_evaluator(Arc::new(evaluator));
        let mut ctx = DataContext::new();
        let row = source(DataEventType::Insert, &[("ID", "1"), ("NAME", "a")]);

        let skip = rule().with_column(TransformColumn::computed("X").with_transform("script", Some("skip")));
        assert!(matches!(
            engine.transform(None, &mut ctx, &skip, &row).await,
            Err(Error::IgnoreRow)
        ));

        let fail = rule().with_column(TransformColumn::computed("X").with_transform("script", Some("fail")));
        match engine.transform(None, &mut ctx, &fail, &row).await {
            Err(Error::Transform { column, transform, .. }) => {
                assert_eq!(column, "X");
                assert_eq!(transform, "script");
            }
            other => panic!("unexpected {:?}", other.map(|r| r.len())),
        }
    }

    #[tokio::test]
    async fn test_target_resolution() {
        let engine = TransformEngine::new(TransformPoint::Load).with_state(SharedStateStore::new());
        let mut ctx = DataContext::new();
        let update = source(DataEventType::Update, &[("ID", "1"), ("NAME", "a")]);

        let none = rule().with_update_action(UpdateAction::Fixed(TargetDmlAction::NoneAction));
        assert!(engine.transform(None, &mut ctx, &none, &update).await.unwrap().is_empty());

        let insert = rule().with_update_action(UpdateAction::Fixed(TargetDmlAction::InsRow));
        let rows = engine.transform(None, &mut ctx, &insert, &update).await.unwrap();
        assert_eq!(rows[0].target_dml_type(), DataEventType::Insert);

        let delete = source(DataEventType::Delete, &[("ID", "1"), ("NAME", "a")]);
        let rows = engine.transform(None, &mut ctx, &rule(), &delete).await.unwrap();
        assert_eq!(rows[0].target_dml_type(), DataEventType::Delete);
        assert_eq!(rows[0].column_names(), vec!["ID"]);

        let soft = rule().with_delete_action(DeleteAction::UpdateCol);
        let rows = engine.transform(None, &mut ctx, &soft, &delete).await.unwrap();
        assert_eq!(rows[0].target_dml_type(), DataEventType::Update);

        let first = rule().with_update_first(true);
        let insert_row = source(DataEventType::Insert, &[("ID", "1"), ("NAME", "a")]);
        let rows = engine.transform(None, &mut ctx, &first, &insert_row).await.unwrap();
        assert_eq!(rows[0].target_dml_type(), DataEventType::Update);
    }

    #[tokio::test]
    async fn test_include_on_scopes_columns() {
        let engine = TransformEngine::new(TransformPoint::Load).with_state(SharedStateStore::new());
        let mut ctx = DataContext::new();
        let table = rule().with_column(
            TransformColumn::computed("CREATED")
                .with_transform("const", Some("yes"))
                .with_include_on(IncludeOn::Insert),
        );
        let update = source(DataEventType::Update, &[("ID", "1"), ("NAME", "a")]);
        let rows = engine.transform(None, &mut ctx, &table, &update).await.unwrap();
        assert_eq!(rows[0].column_names(), vec!["ID", "FULL_NAME"]);
    }

    #[tokio::test]
    async fn test_unknown_and_inapplicable_transforms_copy() {
        let engine = TransformEngine::new(TransformPoint::Extract).with_state(SharedStateStore::new());
        let mut ctx = DataContext::new();
        let table = rule()
            .with_column(TransformColumn::new("NAME", "A").with_transform("nope", None))
            .with_column(TransformColumn::new("NAME", "B").with_transform("identity", None));
        let insert = source(DataEventType::Insert, &[("ID", "1"), ("NAME", "a")]);
        let rows = engine.transform(None, &mut ctx, &table, &insert).await.unwrap();
        let target = rows[0].target_values();
        assert_eq!(target["A"], Some("a".to_string()));
        assert_eq!(target["B"], Some("a".to_string()));
    }
}

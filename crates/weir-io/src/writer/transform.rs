//! Writer decorator that applies transformation rules

use super::DataWriter;
use crate::context::DataContext;
use crate::data::{CsvData, DataSlot};
use crate::error::{Error, Result};
use crate::stats::{Statistic, Statistics, StatisticsSnapshot};
use crate::transform::{SourceRow, TransformEngine, TransformTable};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, trace};
use weir_rdbc::connection::DatabasePlatform;
use weir_rdbc::types::Table;

/// Rewrites rows of transformed tables before handing them on.
///
/// Rules are matched by the fully qualified source table name, case
/// insensitively. Rows of other tables, and rows that are not DML, reach the
/// wrapped writer unchanged.
pub struct TransformWriter {
    inner: Box<dyn DataWriter>,
    engine: Arc<TransformEngine>,
    platform: Option<Arc<dyn DatabasePlatform>>,
    transforms: HashMap<String, Vec<TransformTable>>,
    active: Option<ActiveTable>,
    stats: Statistics,
}

struct ActiveTable {
    source: Table,
    transforms: Vec<TransformTable>,
}

impl TransformWriter {
    /// Wrap `inner`, keeping the rules that run at the engine's point
    pub fn new(
        inner: Box<dyn DataWriter>,
        engine: Arc<TransformEngine>,
        transforms: Vec<TransformTable>,
    ) -> Self {
        let mut by_table: HashMap<String, Vec<TransformTable>> = HashMap::new();
        for transform in transforms
            .into_iter()
            .filter(|t| t.transform_point == engine.point())
        {
            by_table
                .entry(transform.fully_qualified_source_table_name().to_uppercase())
                .or_default()
                .push(transform);
        }
        for list in by_table.values_mut() {
            list.sort_by_key(|t| t.transform_order);
        }
        Self {
            inner,
            engine,
            platform: None,
            transforms: by_table,
            active: None,
            stats: Statistics::new(),
        }
    }

    /// Platform handed to database-backed column transforms
    pub fn with_platform(mut self, platform: Arc<dyn DatabasePlatform>) -> Self {
        self.platform = Some(platform);
        self
    }

    /// Whether any rule applies to `table`
    pub fn is_transformed(&self, table: &Table) -> bool {
        self.transforms
            .contains_key(&table.fully_qualified_name().to_uppercase())
    }

    fn source_row(table: &Table, data: &CsvData) -> Result<SourceRow> {
        let names = table.column_names();
        let key_names = table.primary_key_names();
        let values = data.to_column_values(&names, DataSlot::RowData)?;
        let old_values = data.to_column_values(&names, DataSlot::OldData)?;
        let key_values = if data.contains(DataSlot::PkData) {
            data.to_column_values(&key_names, DataSlot::PkData)?
        } else {
            let from = if old_values.is_empty() { &values } else { &old_values };
            key_names
                .iter()
                .map(|k| (k.to_string(), from.get(*k).cloned().flatten()))
                .collect()
        };
        let dml_type = data.event_type();
        let values = match dml_type {
            crate::data::DataEventType::Delete if old_values.is_empty() => key_values.clone(),
            crate::data::DataEventType::Delete => old_values.clone(),
            _ => values,
        };
        Ok(SourceRow {
            dml_type,
            key_values: Arc::new(key_values),
            old_values: Arc::new(old_values),
            values: Arc::new(values),
            external_data: data.attributes.external_data.clone(),
        })
    }

    async fn transform_and_write(&mut self, ctx: &mut DataContext, data: &CsvData) -> Result<()> {
        let Some(active) = &self.active else {
            return Ok(());
        };
        let source = Self::source_row(&active.source, data)?;

        let started = Instant::now();
        let mut results = Vec::new();
        for transformation in &active.transforms {
            match self
                .engine
                .transform(self.platform.as_deref(), ctx, transformation, &source)
                .await
            {
                Ok(rows) => results.extend(rows),
                Err(Error::IgnoreRow) => {
                    self.stats.incr(Statistic::IgnoreRowCount);
                    self.stats.stop_timer(Statistic::TransformMillis, started);
                    return Err(Error::IgnoreRow);
                }
                Err(e) => return Err(e),
            }
        }
        self.stats.stop_timer(Statistic::TransformMillis, started);
        trace!(
            table = %active.source.fully_qualified_name(),
            rows = results.len(),
            "Transformed row"
        );

        for row in results {
            self.stats.incr(Statistic::TransformCount);
            let target = row.build_target_table();
            let mut target_data = row.build_target_csv_data();
            target_data.attributes = data.attributes.clone();
            if self.inner.start_table(ctx, &target).await? {
                self.inner.write(ctx, target_data).await?;
                self.inner.end_table(ctx, &target).await?;
            } else {
                debug!(table = %target.fully_qualified_name(), "Target table declined");
            }
        }
        Ok(())
    }
}

#[async_trait]
impl DataWriter for TransformWriter {
    async fn open(&mut self, ctx: &mut DataContext) -> Result<()> {
        self.inner.open(ctx).await
    }

    async fn start_batch(&mut self, ctx: &mut DataContext) -> Result<()> {
        self.stats.reset();
        self.inner.start_batch(ctx).await
    }

    async fn start_table(&mut self, ctx: &mut DataContext, table: &Table) -> Result<bool> {
        let key = table.fully_qualified_name().to_uppercase();
        match self.transforms.get(&key) {
            Some(transforms) => {
                let key_names = table.primary_key_names();
                let column_names = table.column_names();
                let transforms = transforms
                    .iter()
                    .map(|t| t.enhance_with_implied_columns(&key_names, &column_names))
                    .collect();
                self.active = Some(ActiveTable {
                    source: table.clone(),
                    transforms,
                });
                Ok(true)
            }
            None => {
                self.active = None;
                self.inner.start_table(ctx, table).await
            }
        }
    }

    async fn write(&mut self, ctx: &mut DataContext, data: CsvData) -> Result<()> {
        let source = match &self.active {
            None => return self.inner.write(ctx, data).await,
            Some(active) => active.source.clone(),
        };
        if !data.event_type().is_dml() {
            if !data.requires_table() {
                return self.inner.write(ctx, data).await;
            }
            if self.inner.start_table(ctx, &source).await? {
                self.inner.write(ctx, data).await?;
                self.inner.end_table(ctx, &source).await?;
            }
            return Ok(());
        }
        self.transform_and_write(ctx, &data).await
    }

    async fn end_table(&mut self, ctx: &mut DataContext, table: &Table) -> Result<()> {
        match self.active.take() {
            Some(_) => Ok(()),
            None => self.inner.end_table(ctx, table).await,
        }
    }

    async fn end_batch(&mut self, ctx: &mut DataContext, in_error: bool) -> Result<()> {
        self.active = None;
        self.inner.end_batch(ctx, in_error).await
    }

    async fn close(&mut self) -> Result<()> {
        self.inner.close().await
    }

    fn statistics(&self) -> StatisticsSnapshot {
        let mut stats = self.inner.statistics();
        stats.merge(&self.stats.snapshot());
        stats
    }
}

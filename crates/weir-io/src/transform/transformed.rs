//! Working accumulator for one transformed row

use super::{IncludeOn, TransformColumn, TransformTable};
use crate::data::{CsvData, DataEventType, DataSlot};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use weir_rdbc::types::{Column, Table, TypeCode};

/// Source column values keyed by column name
pub type SourceValues = HashMap<String, Option<String>>;

#[derive(Debug, Clone, Default)]
struct Bucket {
    columns: Vec<(String, Option<String>)>,
    keys: Vec<(String, Option<String>)>,
    old: Vec<(String, Option<String>)>,
}

fn put_ordered(entries: &mut Vec<(String, Option<String>)>, name: &str, value: Option<String>) {
    match entries.iter_mut().find(|(n, _)| n == name) {
        Some(entry) => entry.1 = value,
        None => entries.push((name.to_string(), value)),
    }
}

fn merge_into(
    target: &mut Vec<(String, Option<String>)>,
    entries: &[(String, Option<String>)],
) {
    for (name, value) in entries {
        put_ordered(target, name, value.clone());
    }
}

/// One target row being built from a source row.
///
/// Values are kept per [`IncludeOn`] scope. Reads merge the `All` scope with
/// the scope of the resolved target operation (see
/// [`TransformedData::read_scope`]).
#[derive(Debug, Clone)]
pub struct TransformedData {
    transform_id: Option<String>,
    target_catalog: Option<String>,
    target_schema: Option<String>,
    target_table: String,
    source_dml_type: DataEventType,
    target_dml_type: DataEventType,
    source_key_values: Arc<SourceValues>,
    old_source_values: Arc<SourceValues>,
    source_values: Arc<SourceValues>,
    buckets: BTreeMap<u8, Bucket>,
}

fn bucket_id(scope: IncludeOn) -> u8 {
    match scope {
        IncludeOn::All => 0,
        IncludeOn::Insert => 1,
        IncludeOn::Update => 2,
        IncludeOn::Delete => 3,
    }
}

impl TransformedData {
    /// Start a row for `transformation`
    pub fn new(
        transformation: &TransformTable,
        source_dml_type: DataEventType,
        source_key_values: Arc<SourceValues>,
        old_source_values: Arc<SourceValues>,
        source_values: Arc<SourceValues>,
    ) -> Self {
        Self {
            transform_id: transformation.transform_id.clone(),
            target_catalog: transformation.target_catalog_name.clone(),
            target_schema: transformation.target_schema_name.clone(),
            target_table: transformation.target_table_name.clone(),
            source_dml_type,
            target_dml_type: source_dml_type,
            source_key_values,
            old_source_values,
            source_values,
            buckets: BTreeMap::new(),
        }
    }

    /// Record a column value. Key columns are also recorded as target keys.
    pub fn put(
        &mut self,
        column: &TransformColumn,
        value: Option<String>,
        old_value: Option<String>,
        record_as_key: bool,
    ) {
        let name = column.target_column_name.as_str();
        let bucket = self.buckets.entry(bucket_id(column.include_on)).or_default();
        if record_as_key {
            put_ordered(&mut bucket.keys, name, value.clone());
        }
        put_ordered(&mut bucket.columns, name, value);
        put_ordered(&mut bucket.old, name, old_value);
    }

    fn retrieve(&self, select: impl Fn(&Bucket) -> &Vec<(String, Option<String>)>) -> Vec<(String, Option<String>)> {
        let mut merged = Vec::new();
        if let Some(all) = self.buckets.get(&bucket_id(IncludeOn::All)) {
            merge_into(&mut merged, select(all));
        }
        if let Some(bucket) = self.buckets.get(&bucket_id(self.read_scope())) {
            merge_into(&mut merged, select(bucket));
        }
        merged
    }

    /// Scope merged over `All` when the row is read.
    ///
    /// Follows the target operation, except that a source delete turned into
    /// a target update keeps the delete scope.
    pub fn read_scope(&self) -> IncludeOn {
        match self.target_dml_type {
            DataEventType::Insert => IncludeOn::Insert,
            DataEventType::Update if self.source_dml_type != DataEventType::Delete => {
                IncludeOn::Update
            }
            _ => IncludeOn::Delete,
        }
    }

    /// Target column names in put order
    pub fn column_names(&self) -> Vec<String> {
        self.retrieve(|b| &b.columns).into_iter().map(|(n, _)| n).collect()
    }

    /// Target column values, aligned with [`TransformedData::column_names`]
    pub fn column_values(&self) -> Vec<Option<String>> {
        self.retrieve(|b| &b.columns).into_iter().map(|(_, v)| v).collect()
    }

    /// Target key names
    pub fn key_names(&self) -> Vec<String> {
        self.retrieve(|b| &b.keys).into_iter().map(|(n, _)| n).collect()
    }

    /// Target key values, aligned with [`TransformedData::key_names`]
    pub fn key_values(&self) -> Vec<Option<String>> {
        self.retrieve(|b| &b.keys).into_iter().map(|(_, v)| v).collect()
    }

    /// Old target values, aligned with [`TransformedData::column_names`]
    pub fn old_column_values(&self) -> Vec<Option<String>> {
        self.retrieve(|b| &b.old).into_iter().map(|(_, v)| v).collect()
    }

    /// Current target values keyed by column name
    pub fn target_values(&self) -> HashMap<String, Option<String>> {
        self.retrieve(|b| &b.columns).into_iter().collect()
    }

    /// Whether any column has been recorded
    pub fn has_columns(&self) -> bool {
        !self.column_names().is_empty()
    }

    /// Operation captured at the source
    pub fn source_dml_type(&self) -> DataEventType {
        self.source_dml_type
    }

    /// Operation to apply at the target
    pub fn target_dml_type(&self) -> DataEventType {
        self.target_dml_type
    }

    /// Change the operation to apply at the target
    pub fn set_target_dml_type(&mut self, event_type: DataEventType) {
        self.target_dml_type = event_type;
    }

    /// Rule that produced this row
    pub fn transform_id(&self) -> Option<&str> {
        self.transform_id.as_deref()
    }

    /// `catalog.schema.table` of the target
    pub fn fully_qualified_target_table_name(&self) -> String {
        Table::qualify(
            self.target_catalog.as_deref(),
            self.target_schema.as_deref(),
            &self.target_table,
        )
    }

    /// Source key values
    pub fn source_key_values(&self) -> &SourceValues {
        &self.source_key_values
    }

    /// Source values before the change
    pub fn old_source_values(&self) -> &SourceValues {
        &self.old_source_values
    }

    /// Source values after the change
    pub fn source_values(&self) -> &SourceValues {
        &self.source_values
    }

    /// Describe the target table from the recorded columns
    pub fn build_target_table(&self) -> Table {
        let keys = self.key_names();
        let columns = self
            .column_names()
            .into_iter()
            .map(|name| {
                if keys.contains(&name) {
                    Column::key(name, TypeCode::Varchar)
                } else {
                    Column::new(name, TypeCode::Varchar)
                }
            })
            .collect();
        Table::with_columns(
            self.target_catalog.as_deref(),
            self.target_schema.as_deref(),
            self.target_table.clone(),
            columns,
        )
    }

    /// Build the change to apply at the target
    pub fn build_target_csv_data(&self) -> CsvData {
        let mut data = CsvData::new(self.target_dml_type)
            .with_parsed(DataSlot::RowData, self.column_values())
            .with_parsed(DataSlot::PkData, self.key_values());
        if !self.old_source_values.is_empty() {
            data.put_parsed(DataSlot::OldData, self.old_column_values());
        }
        data
    }
}

//! Per-run pipeline state
//!
//! One [`DataContext`] is created for each `process()` call and handed by
//! `&mut` to the reader, the writer chain and the column transforms. It is
//! never shared between concurrent runs; state that must outlive a run
//! belongs in [`crate::transform::SharedStateStore`].

use crate::batch::Batch;
use crate::data::CsvData;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use weir_rdbc::types::Table;

/// Value stored in the context scratch map
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ContextValue {
    /// Flag
    Bool(bool),
    /// Integer
    Integer(i64),
    /// Text
    String(String),
    /// Ordered text values
    List(Vec<String>),
}

impl ContextValue {
    /// Text value, if this is a string
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(s) => Some(s),
            _ => None,
        }
    }

    /// Integer value, if this is an integer
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Self::Integer(i) => Some(*i),
            _ => None,
        }
    }

    /// Flag value, if this is a flag
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(b) => Some(*b),
            _ => None,
        }
    }
}

impl From<bool> for ContextValue {
    fn from(v: bool) -> Self {
        Self::Bool(v)
    }
}

impl From<i64> for ContextValue {
    fn from(v: i64) -> Self {
        Self::Integer(v)
    }
}

impl From<String> for ContextValue {
    fn from(v: String) -> Self {
        Self::String(v)
    }
}

impl From<&str> for ContextValue {
    fn from(v: &str) -> Self {
        Self::String(v.to_string())
    }
}

impl From<Vec<String>> for ContextValue {
    fn from(v: Vec<String>) -> Self {
        Self::List(v)
    }
}

/// State threaded through one processing run
#[derive(Debug, Default)]
pub struct DataContext {
    batch: Option<Batch>,
    table: Option<Table>,
    data: Option<CsvData>,
    last_error: Option<String>,
    tables: HashMap<String, Table>,
    values: HashMap<String, ContextValue>,
}

impl DataContext {
    /// Create an empty context
    pub fn new() -> Self {
        Self::default()
    }

    /// Batch being processed
    pub fn batch(&self) -> Option<&Batch> {
        self.batch.as_ref()
    }

    /// Mutable access to the batch being processed
    pub fn batch_mut(&mut self) -> Option<&mut Batch> {
        self.batch.as_mut()
    }

    /// Replace the current batch, returning the previous one
    pub fn set_batch(&mut self, batch: Option<Batch>) -> Option<Batch> {
        std::mem::replace(&mut self.batch, batch)
    }

    /// Current batch id, `-1` outside a batch
    pub fn batch_id(&self) -> i64 {
        self.batch.as_ref().map_or(-1, |b| b.batch_id)
    }

    /// Table being processed
    pub fn table(&self) -> Option<&Table> {
        self.table.as_ref()
    }

    /// Replace the current table
    pub fn set_table(&mut self, table: Option<Table>) {
        self.table = table;
    }

    /// Row being processed
    pub fn data(&self) -> Option<&CsvData> {
        self.data.as_ref()
    }

    /// Replace the current row
    pub fn set_data(&mut self, data: Option<CsvData>) {
        self.data = data;
    }

    /// Message of the last error seen by the writer
    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    /// Record the last error
    pub fn set_last_error(&mut self, error: Option<String>) {
        self.last_error = error;
    }

    /// Table resolved earlier in this run
    pub fn cached_table(&self, fully_qualified_name: &str) -> Option<&Table> {
        self.tables.get(fully_qualified_name)
    }

    /// Remember a resolved table under its fully qualified name
    pub fn cache_table(&mut self, fully_qualified_name: impl Into<String>, table: Table) {
        self.tables.insert(fully_qualified_name.into(), table);
    }

    /// Scratch value
    pub fn get(&self, key: &str) -> Option<&ContextValue> {
        self.values.get(key)
    }

    /// Store a scratch value
    pub fn put(&mut self, key: impl Into<String>, value: impl Into<ContextValue>) {
        self.values.insert(key.into(), value.into());
    }

    /// Remove a scratch value
    pub fn remove(&mut self, key: &str) -> Option<ContextValue> {
        self.values.remove(key)
    }

    /// Whether a scratch value exists
    pub fn contains(&self, key: &str) -> bool {
        self.values.contains_key(key)
    }

    /// All scratch values
    pub fn values(&self) -> &HashMap<String, ContextValue> {
        &self.values
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use weir_rdbc::types::{Column, TypeCode};

    #[test]
    fn test_scratch_values() {
        let mut ctx = DataContext::new();
        ctx.put("seen", true);
        ctx.put("count", 3i64);
        ctx.put("name", "orders");

        assert_eq!(ctx.get("seen").and_then(ContextValue::as_bool), Some(true));
        assert_eq!(ctx.get("count").and_then(ContextValue::as_i64), Some(3));
        assert_eq!(ctx.get("name").and_then(ContextValue::as_str), Some("orders"));
        assert!(ctx.remove("seen").is_some());
        assert!(!ctx.contains("seen"));
    }

    #[test]
    fn test_table_cache() {
        let mut ctx = DataContext::new();
        let table = Table::with_columns(
            None,
            Some("sales"),
            "ORDERS",
            vec![Column::key("ID", TypeCode::Integer)],
        );
        ctx.cache_table(table.fully_qualified_name(), table.clone());
        assert_eq!(ctx.cached_table("sales.ORDERS"), Some(&table));
        assert!(ctx.cached_table("ORDERS").is_none());
    }

    #[test]
    fn test_batch_id_outside_batch() {
        let mut ctx = DataContext::new();
        assert_eq!(ctx.batch_id(), -1);
        ctx.set_batch(Some(Batch::new(9, "default")));
        assert_eq!(ctx.batch_id(), 9);
    }
}

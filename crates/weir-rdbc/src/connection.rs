//! Transaction and platform traits for weir-rdbc
//!
//! The physical drivers live outside this crate. They plug in through:
//! - `Transaction`: statement execution inside one unit of work
//! - `DatabasePlatform`: dialect, table metadata and transaction factory

use async_trait::async_trait;

use crate::dialect::{DatabaseInfo, SqlDialect};
use crate::dml::{DmlStatement, DmlStatementOptions, DmlType};
use crate::error::Result;
use crate::named::ParsedSql;
use crate::types::{Column, Row, Table, Value};
use std::collections::HashMap;

/// A database transaction
#[async_trait]
pub trait Transaction: Send + Sync {
    /// Execute a query that returns rows
    async fn query(&self, sql: &str, params: &[Value]) -> Result<Vec<Row>>;

    /// Execute a statement that modifies data, returns affected row count
    async fn execute(&self, sql: &str, params: &[Value]) -> Result<u64>;

    /// Execute a named-parameter template
    async fn query_named(&self, sql: &str, params: &HashMap<String, Value>) -> Result<Vec<Row>> {
        let (sql, values) = ParsedSql::parse(sql).prepare(params)?;
        self.query(&sql, &values).await
    }

    /// Commit the transaction
    async fn commit(self: Box<Self>) -> Result<()>;

    /// Rollback the transaction
    async fn rollback(self: Box<Self>) -> Result<()>;
}

/// Target database as seen by the load pipeline
#[async_trait]
pub trait DatabasePlatform: Send + Sync {
    /// SQL dialect of the target
    fn dialect(&self) -> &dyn SqlDialect;

    /// Identifier and type rules; defaults to the dialect's
    fn database_info(&self) -> DatabaseInfo {
        self.dialect().database_info()
    }

    /// Platform name
    fn name(&self) -> &str {
        self.dialect().name()
    }

    /// Read table metadata, `None` when the table does not exist
    async fn lookup_table(
        &self,
        catalog: Option<&str>,
        schema: Option<&str>,
        table: &str,
    ) -> Result<Option<Table>>;

    /// Begin a transaction
    async fn begin(&self) -> Result<Box<dyn Transaction>>;

    /// Compile a DML statement against this platform's rules
    fn create_dml_statement(
        &self,
        dml_type: DmlType,
        table: &Table,
        keys: Vec<Column>,
        columns: Vec<Column>,
        null_key_values: Vec<bool>,
        text_column_expression: Option<String>,
    ) -> Result<DmlStatement> {
        DmlStatement::new(
            DmlStatementOptions::new(dml_type, table.name.clone())
                .with_catalog(table.catalog.as_deref())
                .with_schema(table.schema.as_deref())
                .with_keys(keys)
                .with_columns(columns)
                .with_null_key_values(null_key_values)
                .with_database_info(self.database_info())
                .with_text_column_expression(text_column_expression),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dialect::PostgresDialect;
    use crate::types::TypeCode;
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingTransaction {
        queries: Mutex<Vec<(String, Vec<Value>)>>,
    }

    #[async_trait]
    impl Transaction for RecordingTransaction {
        async fn query(&self, sql: &str, params: &[Value]) -> Result<Vec<Row>> {
            self.queries
                .lock()
                .unwrap()
                .push((sql.to_string(), params.to_vec()));
            Ok(vec![Row::new(vec!["N".into()], vec![Value::Int64(1)])])
        }

        async fn execute(&self, _sql: &str, _params: &[Value]) -> Result<u64> {
            Ok(1)
        }

        async fn commit(self: Box<Self>) -> Result<()> {
            Ok(())
        }

        async fn rollback(self: Box<Self>) -> Result<()> {
            Ok(())
        }
    }

    struct StaticPlatform;

    #[async_trait]
    impl DatabasePlatform for StaticPlatform {
        fn dialect(&self) -> &dyn SqlDialect {
            &PostgresDialect
        }

        async fn lookup_table(
            &self,
            _catalog: Option<&str>,
            _schema: Option<&str>,
            _table: &str,
        ) -> Result<Option<Table>> {
            Ok(None)
        }

        async fn begin(&self) -> Result<Box<dyn Transaction>> {
            Ok(Box::new(RecordingTransaction::default()))
        }
    }

    #[tokio::test]
    async fn test_query_named_expands_parameters() {
        let tx = RecordingTransaction::default();
        let mut params = HashMap::new();
        params.insert("ids".to_string(), Value::from(vec![1, 2]));
        let rows = tx
            .query_named("select n from t where id in (:ids)", &params)
            .await
            .unwrap();

        assert_eq!(rows.len(), 1);
        let queries = tx.queries.lock().unwrap();
        assert_eq!(queries[0].0, "select n from t where id in (?, ?)");
        assert_eq!(queries[0].1.len(), 2);
    }

    #[test]
    fn test_platform_uses_dialect_quoting() {
        let table = Table::with_columns(
            None,
            Some("public"),
            "users",
            vec![Column::key("id", TypeCode::Integer)],
        );
        let stmt = StaticPlatform
            .create_dml_statement(
                DmlType::Delete,
                &table,
                vec![Column::key("id", TypeCode::Integer)],
                vec![],
                vec![false],
                None,
            )
            .unwrap();
        assert_eq!(stmt.sql(), "delete from \"public\".\"users\" where \"id\" = ?");
        assert_eq!(StaticPlatform.name(), "PostgreSQL");
    }
}

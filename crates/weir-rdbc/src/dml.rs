//! Dialect-aware DML compilation
//!
//! A [`DmlStatement`] turns a table name, an ordered key set, an ordered value
//! column set and a null-key mask into parameterized SQL plus the JDBC type
//! vector of its placeholders.
//!
//! Placeholder order is defined once, by the statement's bind layout. SQL
//! rendering, [`DmlStatement::types`], [`DmlStatement::value_array`] and
//! [`DmlStatement::value_array_from_parts`] all walk that same layout, so a
//! value array can never drift out of line with the placeholders it fills.
//!
//! # Example
//!
//! ```
//! use weir_rdbc::dml::{DmlStatement, DmlStatementOptions, DmlType};
//! use weir_rdbc::types::{Column, TypeCode};
//!
//! let stmt = DmlStatement::new(
//!     DmlStatementOptions::new(DmlType::Update, "ORDERS")
//!         .with_keys(vec![Column::key("ID", TypeCode::Integer)])
//!         .with_columns(vec![Column::new("STATUS", TypeCode::Varchar)])
//!         .with_null_key_values(vec![false]),
//! )
//! .unwrap();
//!
//! assert_eq!(stmt.sql(), "update ORDERS set STATUS = ? where ID = ?");
//! assert_eq!(stmt.types().len(), 2);
//! ```

use crate::dialect::{
    DatabaseInfo, MySqlDialect, PostgresDialect, SqlDialect, SqlServerDialect, UpsertStyle,
};
use crate::error::{Error, Result};
use crate::types::{Column, TypeCode, Value};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use tracing::{trace, warn};

/// Kind of statement to compile
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DmlType {
    /// `insert into T (..) values (..)`
    Insert,
    /// `update T set .. where ..`
    Update,
    /// `delete from T where ..`
    Delete,
    /// Dialect-specific insert-or-update
    Upsert,
    /// `select count(*) from T where ..`
    Count,
    /// ` from T where ..` fragment
    From,
    /// `select .. from T where ..`
    Select,
    /// `select .. from T`
    SelectAll,
}

impl fmt::Display for DmlType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Insert => "INSERT",
            Self::Update => "UPDATE",
            Self::Delete => "DELETE",
            Self::Upsert => "UPSERT",
            Self::Count => "COUNT",
            Self::From => "FROM",
            Self::Select => "SELECT",
            Self::SelectAll => "SELECT_ALL",
        };
        f.write_str(name)
    }
}

/// Position of one bound parameter
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BindSlot {
    /// Index into the value columns
    Column(usize),
    /// Index into the key columns as originally supplied (before null keys are dropped)
    Key(usize),
}

/// Inputs to [`DmlStatement::new`]
#[derive(Debug, Clone)]
pub struct DmlStatementOptions {
    /// Statement kind
    pub dml_type: DmlType,
    /// Catalog name
    pub catalog: Option<String>,
    /// Schema name
    pub schema: Option<String>,
    /// Table name
    pub table_name: String,
    /// Key columns, in WHERE order
    pub keys: Vec<Column>,
    /// Value columns, in SET / VALUES order
    pub columns: Vec<Column>,
    /// One entry per key; `true` renders `is NULL` and binds nothing
    pub null_key_values: Vec<bool>,
    /// Target identifier and type rules
    pub database_info: DatabaseInfo,
    /// Render `:COLUMN` instead of `?`
    pub named_parameters: bool,
    /// Wraps placeholders of character columns; `$(columnName)` is replaced by the placeholder
    pub text_column_expression: Option<String>,
}

impl DmlStatementOptions {
    /// Create options for a table with no keys or columns
    pub fn new(dml_type: DmlType, table_name: impl Into<String>) -> Self {
        Self {
            dml_type,
            catalog: None,
            schema: None,
            table_name: table_name.into(),
            keys: Vec::new(),
            columns: Vec::new(),
            null_key_values: Vec::new(),
            database_info: DatabaseInfo::default(),
            named_parameters: false,
            text_column_expression: None,
        }
    }

    /// Set catalog
    pub fn with_catalog(mut self, catalog: Option<&str>) -> Self {
        self.catalog = catalog.filter(|c| !c.is_empty()).map(str::to_string);
        self
    }

    /// Set schema
    pub fn with_schema(mut self, schema: Option<&str>) -> Self {
        self.schema = schema.filter(|s| !s.is_empty()).map(str::to_string);
        self
    }

    /// Set key columns
    pub fn with_keys(mut self, keys: Vec<Column>) -> Self {
        self.keys = keys;
        self
    }

    /// Set value columns
    pub fn with_columns(mut self, columns: Vec<Column>) -> Self {
        self.columns = columns;
        self
    }

    /// Set the null-key mask
    pub fn with_null_key_values(mut self, null_key_values: Vec<bool>) -> Self {
        self.null_key_values = null_key_values;
        self
    }

    /// Set identifier and type rules
    pub fn with_database_info(mut self, database_info: DatabaseInfo) -> Self {
        self.database_info = database_info;
        self
    }

    /// Render named placeholders
    pub fn with_named_parameters(mut self, named: bool) -> Self {
        self.named_parameters = named;
        self
    }

    /// Set the text column expression
    pub fn with_text_column_expression(mut self, expression: Option<String>) -> Self {
        self.text_column_expression = expression.filter(|e| !e.trim().is_empty());
        self
    }
}

/// A compiled, reusable DML statement
#[derive(Debug, Clone)]
pub struct DmlStatement {
    options: DmlStatementOptions,
    sql: String,
    keys: Vec<Column>,
    layout: Vec<BindSlot>,
    types: Vec<TypeCode>,
}

impl DmlStatement {
    /// Compile a statement.
    ///
    /// A null-key mask whose length differs from the key count is ignored
    /// and every key binds a placeholder.
    pub fn new(mut options: DmlStatementOptions) -> Result<Self> {
        if options.null_key_values.len() != options.keys.len() {
            if !options.null_key_values.is_empty() {
                warn!(
                    table = %options.table_name,
                    keys = options.keys.len(),
                    mask = options.null_key_values.len(),
                    "Null key mask does not match the key count; binding every key"
                );
            }
            options.null_key_values = vec![false; options.keys.len()];
        }
        let keys: Vec<Column> = options
            .keys
            .iter()
            .zip(&options.null_key_values)
            .filter(|(_, is_null)| !**is_null)
            .map(|(k, _)| k.clone())
            .collect();

        let layout = bind_layout(
            options.dml_type,
            options.columns.len(),
            &options.null_key_values,
        );
        let types = layout
            .iter()
            .map(|slot| {
                let column = match *slot {
                    BindSlot::Column(i) => &options.columns[i],
                    BindSlot::Key(i) => &options.keys[i],
                };
                normalize_type(column.type_code, &options.database_info)
            })
            .collect();

        let sql = match options.dml_type {
            DmlType::Upsert => render_upsert(&options)?,
            _ => SqlRenderer::new(&options, Placeholders).render(),
        };
        trace!(dml_type = ?options.dml_type, sql = %sql, "Built DML statement");

        Ok(Self {
            options,
            sql,
            keys,
            layout,
            types,
        })
    }

    /// Statement kind
    pub fn dml_type(&self) -> DmlType {
        self.options.dml_type
    }

    /// Parameterized SQL text
    pub fn sql(&self) -> &str {
        &self.sql
    }

    /// Type of each placeholder, in bind order
    pub fn types(&self) -> &[TypeCode] {
        &self.types
    }

    /// Bind layout shared by SQL, types and value arrays
    pub fn layout(&self) -> &[BindSlot] {
        &self.layout
    }

    /// Key columns that bind a placeholder (null keys removed)
    pub fn keys(&self) -> &[Column] {
        &self.keys
    }

    /// Value columns
    pub fn columns(&self) -> &[Column] {
        &self.options.columns
    }

    /// Null-key mask aligned with the originally supplied keys
    pub fn null_key_values(&self) -> &[bool] {
        &self.options.null_key_values
    }

    /// Options the statement was compiled from
    pub fn options(&self) -> &DmlStatementOptions {
        &self.options
    }

    /// Column bound at each placeholder
    pub fn bound_columns(&self) -> Vec<&Column> {
        self.layout.iter().map(|slot| self.slot_column(*slot)).collect()
    }

    fn slot_column(&self, slot: BindSlot) -> &Column {
        match slot {
            BindSlot::Column(i) => &self.options.columns[i],
            BindSlot::Key(i) => &self.options.keys[i],
        }
    }

    /// Build the positional value array from values keyed by column name.
    ///
    /// Absent names bind NULL.
    pub fn value_array<V: Clone + Default>(&self, params: &HashMap<String, V>) -> Vec<V> {
        self.layout
            .iter()
            .map(|slot| {
                params
                    .get(&self.slot_column(*slot).name)
                    .cloned()
                    .unwrap_or_default()
            })
            .collect()
    }

    /// Build the positional value array from separate column and key arrays.
    ///
    /// `key_values` is aligned with the keys as originally supplied, so entries
    /// masked as null are skipped here.
    pub fn value_array_from_parts<V: Clone + Default>(
        &self,
        column_values: &[V],
        key_values: &[V],
    ) -> Vec<V> {
        self.layout
            .iter()
            .map(|slot| {
                let value = match *slot {
                    BindSlot::Column(i) => column_values.get(i),
                    BindSlot::Key(i) => key_values.get(i),
                };
                value.cloned().unwrap_or_default()
            })
            .collect()
    }

    /// Key values used to look a row up, in bound key order
    pub fn lookup_key_data(&self, lookup: &HashMap<String, Option<String>>) -> Vec<Option<String>> {
        self.keys
            .iter()
            .map(|k| lookup.get(&k.name).cloned().flatten())
            .collect()
    }

    /// Render the statement with literal values in place of placeholders.
    ///
    /// `values` must follow the bind layout. Used for SQL scripts and diagnostics,
    /// never for execution.
    pub fn build_dynamic_sql(&self, dialect: &dyn SqlDialect, values: &[Value]) -> Result<String> {
        if values.len() != self.layout.len() {
            return Err(Error::internal(format!(
                "{} values supplied for {} placeholders",
                values.len(),
                self.layout.len()
            )));
        }
        if self.options.dml_type == DmlType::Upsert {
            return Err(Error::unsupported("dynamic SQL for upsert statements"));
        }
        let literals = Literals {
            dialect,
            values: values.iter(),
        };
        Ok(SqlRenderer::new(&self.options, literals).render())
    }
}

fn bind_layout(dml_type: DmlType, column_count: usize, null_key_values: &[bool]) -> Vec<BindSlot> {
    let columns = (0..column_count).map(BindSlot::Column);
    let keys = null_key_values
        .iter()
        .enumerate()
        .filter(|(_, is_null)| !**is_null)
        .map(|(i, _)| BindSlot::Key(i));

    match dml_type {
        DmlType::Insert | DmlType::Upsert => columns.collect(),
        DmlType::Update => columns.chain(keys).collect(),
        DmlType::Delete | DmlType::Count | DmlType::From | DmlType::Select => keys.collect(),
        DmlType::SelectAll => Vec::new(),
    }
}

/// Bind type of a column on the target.
///
/// DATE binds as TIMESTAMP when the target asks for it. Approximate numerics
/// bind as DECIMAL.
pub fn normalize_type(type_code: TypeCode, info: &DatabaseInfo) -> TypeCode {
    match type_code {
        TypeCode::Date if info.date_overrides_to_timestamp => TypeCode::Timestamp,
        TypeCode::Float | TypeCode::Double | TypeCode::Real => TypeCode::Decimal,
        other => other,
    }
}

/// `catalog<sep>schema<sep>table`, each part quoted with `quote`
pub fn qualified_table_name(
    catalog: Option<&str>,
    schema: Option<&str>,
    table: &str,
    info: &DatabaseInfo,
) -> String {
    let quote = info.quote();
    let mut name = String::new();
    if let Some(catalog) = catalog.filter(|c| !c.is_empty()) {
        name.push_str(&format!("{quote}{catalog}{quote}{}", info.catalog_separator));
    }
    if let Some(schema) = schema.filter(|s| !s.is_empty()) {
        name.push_str(&format!("{quote}{schema}{quote}{}", info.schema_separator));
    }
    name.push_str(&format!("{quote}{table}{quote}"));
    name
}

fn render_upsert(options: &DmlStatementOptions) -> Result<String> {
    let dialect: &dyn SqlDialect = match options.database_info.upsert {
        UpsertStyle::OnConflict => &PostgresDialect,
        UpsertStyle::OnDuplicateKey => &MySqlDialect,
        UpsertStyle::Merge => &SqlServerDialect,
        UpsertStyle::Unsupported => {
            return Err(Error::unsupported(format!(
                "upsert into {} on a target without upsert support",
                options.table_name
            )))
        }
    };
    let keys: Vec<&str> = options.keys.iter().map(|k| k.name.as_str()).collect();
    let columns: Vec<&str> = options.columns.iter().map(|c| c.name.as_str()).collect();
    dialect.upsert_sql(options.schema.as_deref(), &options.table_name, &keys, &columns)
}

/// Supplies the text rendered at each bind position, in SQL order
trait Binder {
    fn bind(&mut self, column: &Column, named: bool) -> String;
}

struct Placeholders;

impl Binder for Placeholders {
    fn bind(&mut self, column: &Column, named: bool) -> String {
        if named {
            format!(":{}", column.name)
        } else {
            "?".to_string()
        }
    }
}

struct Literals<'a, I> {
    dialect: &'a dyn SqlDialect,
    values: I,
}

impl<'a, I: Iterator<Item = &'a Value>> Binder for Literals<'a, I> {
    fn bind(&mut self, _column: &Column, _named: bool) -> String {
        match self.values.next() {
            None | Some(Value::Null) => "null".to_string(),
            Some(v @ (Value::Int64(_) | Value::Float64(_) | Value::Decimal(_) | Value::Bool(_))) => {
                v.to_text().unwrap_or_default()
            }
            Some(v) => self.dialect.escape_string(&v.to_text().unwrap_or_default()),
        }
    }
}

struct SqlRenderer<'a, B> {
    options: &'a DmlStatementOptions,
    quote: &'a str,
    binder: B,
}

impl<'a, B: Binder> SqlRenderer<'a, B> {
    fn new(options: &'a DmlStatementOptions, binder: B) -> Self {
        Self {
            options,
            quote: options.database_info.quote(),
            binder,
        }
    }

    fn render(mut self) -> String {
        let o = self.options;
        let table = qualified_table_name(
            o.catalog.as_deref(),
            o.schema.as_deref(),
            &o.table_name,
            &o.database_info,
        );
        match o.dml_type {
            DmlType::Insert => format!(
                "insert into {} ({}) values ({})",
                table,
                self.column_list(&o.columns),
                self.parameters(&o.columns)
            ),
            DmlType::Update => format!(
                "update {} set {}{}",
                table,
                self.assignments(&o.columns),
                self.where_clause()
            ),
            DmlType::Delete => format!("delete from {}{}", table, self.where_clause()),
            DmlType::From => format!(" from {}{}", table, self.where_clause()),
            DmlType::Count => format!("select count(*) from {}{}", table, self.where_clause()),
            DmlType::Select => format!(
                "select {} from {}{}",
                self.column_list(&o.columns),
                table,
                self.where_clause()
            ),
            DmlType::SelectAll => {
                let columns = if o.columns.is_empty() {
                    "*".to_string()
                } else {
                    self.column_list(&o.columns)
                };
                format!("select {} from {}", columns, table)
            }
            // Rendered by the dialect before a renderer is built
            DmlType::Upsert => String::new(),
        }
    }

    /// ` where <predicates>`, or nothing without keys
    fn where_clause(&mut self) -> String {
        if self.options.keys.is_empty() {
            String::new()
        } else {
            format!(" where {}", self.key_predicates())
        }
    }

    fn name(&self, column: &Column) -> String {
        format!("{q}{}{q}", column.name, q = self.quote)
    }

    fn column_list(&self, columns: &[Column]) -> String {
        columns
            .iter()
            .map(|c| self.name(c))
            .collect::<Vec<_>>()
            .join(", ")
    }

    fn parameter(&mut self, column: &Column) -> String {
        let parameter = self.binder.bind(column, self.options.named_parameters);
        match &self.options.text_column_expression {
            Some(expr) if column.type_code.is_text() => expr.replace("$(columnName)", &parameter),
            _ => parameter,
        }
    }

    fn parameters(&mut self, columns: &[Column]) -> String {
        columns
            .iter()
            .map(|c| self.parameter(c))
            .collect::<Vec<_>>()
            .join(",")
    }

    fn assignments(&mut self, columns: &[Column]) -> String {
        columns
            .iter()
            .map(|c| format!("{} = {}", self.name(c), self.parameter(c)))
            .collect::<Vec<_>>()
            .join(", ")
    }

    fn key_predicates(&mut self) -> String {
        let options = self.options;
        let mut predicates = Vec::with_capacity(options.keys.len());
        for (key, is_null) in options.keys.iter().zip(&options.null_key_values) {
            if *is_null {
                predicates.push(format!("{} is NULL", self.name(key)));
            } else {
                predicates.push(format!("{} = {}", self.name(key), self.parameter(key)));
            }
        }
        predicates.join(" and ")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn orders(dml_type: DmlType) -> DmlStatementOptions {
        DmlStatementOptions::new(dml_type, "ORDERS")
            .with_keys(vec![Column::key("ID", TypeCode::Integer)])
            .with_columns(vec![
                Column::new("STATUS", TypeCode::Varchar),
                Column::new("PLACED", TypeCode::Date),
            ])
            .with_null_key_values(vec![false])
    }

    #[test]
    fn test_insert_sql() {
        let stmt = DmlStatement::new(orders(DmlType::Insert)).unwrap();
        assert_eq!(
            stmt.sql(),
            "insert into ORDERS (STATUS, PLACED) values (?,?)"
        );
        assert_eq!(stmt.types(), &[TypeCode::Varchar, TypeCode::Date]);
    }

    #[test]
    fn test_update_binds_columns_then_keys() {
        let stmt = DmlStatement::new(orders(DmlType::Update)).unwrap();
        assert_eq!(
            stmt.sql(),
            "update ORDERS set STATUS = ?, PLACED = ? where ID = ?"
        );
        assert_eq!(
            stmt.layout(),
            &[BindSlot::Column(0), BindSlot::Column(1), BindSlot::Key(0)]
        );
    }

    #[test]
    fn test_null_keys_render_is_null() {
        let options = DmlStatementOptions::new(DmlType::Delete, "T")
            .with_keys(vec![
                Column::key("A", TypeCode::Integer),
                Column::key("B", TypeCode::Varchar),
            ])
            .with_null_key_values(vec![false, true]);
        let stmt = DmlStatement::new(options).unwrap();
        assert_eq!(stmt.sql(), "delete from T where A = ? and B is NULL");
        assert_eq!(stmt.keys().len(), 1);
        assert_eq!(stmt.types(), &[TypeCode::Integer]);
    }

    #[test]
    fn test_count_without_keys() {
        let stmt = DmlStatement::new(DmlStatementOptions::new(DmlType::Count, "T")).unwrap();
        assert_eq!(stmt.sql(), "select count(*) from T");
        assert!(stmt.types().is_empty());
    }

    #[test]
    fn test_select_all_star() {
        let stmt = DmlStatement::new(DmlStatementOptions::new(DmlType::SelectAll, "T")).unwrap();
        assert_eq!(stmt.sql(), "select * from T");
    }

    #[test]
    fn test_quoted_and_qualified() {
        let options = orders(DmlType::Delete)
            .with_catalog(Some("shop"))
            .with_schema(Some("sales"))
            .with_database_info(DatabaseInfo::default().with_delimited_identifiers(true));
        let stmt = DmlStatement::new(options).unwrap();
        assert_eq!(
            stmt.sql(),
            "delete from \"shop\".\"sales\".\"ORDERS\" where \"ID\" = ?"
        );
    }

    #[test]
    fn test_type_normalization() {
        let info = DatabaseInfo::default().with_date_overrides_to_timestamp(true);
        assert_eq!(normalize_type(TypeCode::Date, &info), TypeCode::Timestamp);
        assert_eq!(
            normalize_type(TypeCode::Date, &DatabaseInfo::default()),
            TypeCode::Date
        );
        assert_eq!(normalize_type(TypeCode::Double, &info), TypeCode::Decimal);
        assert_eq!(normalize_type(TypeCode::Real, &info), TypeCode::Decimal);
    }

    #[test]
    fn test_text_column_expression_and_named() {
        let options = orders(DmlType::Update)
            .with_named_parameters(true)
            .with_text_column_expression(Some("trim($(columnName))".into()));
        let stmt = DmlStatement::new(options).unwrap();
        assert_eq!(
            stmt.sql(),
            "update ORDERS set STATUS = trim(:STATUS), PLACED = :PLACED where ID = :ID"
        );
    }

    #[test]
    fn test_value_array_follows_layout() {
        let stmt = DmlStatement::new(orders(DmlType::Update)).unwrap();
        let mut params = HashMap::new();
        params.insert("ID".to_string(), Value::Int64(7));
        params.insert("STATUS".to_string(), Value::from("SHIPPED"));
        assert_eq!(
            stmt.value_array(&params),
            vec![Value::from("SHIPPED"), Value::Null, Value::Int64(7)]
        );

        let parts = stmt.value_array_from_parts(&["a", "b"], &["k"]);
        assert_eq!(parts, vec!["a", "b", "k"]);
    }

    #[test]
    fn test_dynamic_sql() {
        let stmt = DmlStatement::new(orders(DmlType::Update)).unwrap();
        let sql = stmt
            .build_dynamic_sql(
                &crate::dialect::GenericDialect,
                &[Value::from("it's"), Value::Null, Value::Int64(3)],
            )
            .unwrap();
        assert_eq!(
            sql,
            "update ORDERS set STATUS = 'it''s', PLACED = null where ID = 3"
        );
    }

    #[test]
    fn test_upsert_requires_support() {
        let err = DmlStatement::new(orders(DmlType::Upsert)).unwrap_err();
        assert!(matches!(err, Error::Unsupported { .. }));

        let options = DmlStatementOptions::new(DmlType::Upsert, "ORDERS")
            .with_keys(vec![Column::key("ID", TypeCode::Integer)])
            .with_columns(vec![
                Column::key("ID", TypeCode::Integer),
                Column::new("STATUS", TypeCode::Varchar),
            ])
            .with_database_info(PostgresDialect.database_info());
        let stmt = DmlStatement::new(options).unwrap();
        assert_eq!(stmt.sql().matches('?').count(), stmt.types().len());
    }
}

//! SQL dialect abstraction for weir-rdbc
//!
//! A dialect describes how a target database wants its SQL written:
//! - `DatabaseInfo`: identifier delimiters, name separators, type normalization switches
//! - `SqlDialect`: identifier quoting, string escaping and upsert rendering
//!
//! Upserts use sea-query on PostgreSQL and MySQL, with manual MERGE for SQL Server
//! (no sea-query backend).

use crate::error::{Error, Result};
use sea_query::{
    Alias, Expr, IntoIden, MysqlQueryBuilder, OnConflict, PostgresQueryBuilder, Query, TableRef,
};
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Helper: build a sea-query TableRef from optional schema + table name
// ---------------------------------------------------------------------------

fn sea_table_ref(schema: Option<&str>, table: &str) -> TableRef {
    match schema {
        Some(s) => TableRef::SchemaTable(Alias::new(s).into_iden(), Alias::new(table).into_iden()),
        None => TableRef::Table(Alias::new(table).into_iden()),
    }
}

/// How a dialect renders an insert-or-update statement
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UpsertStyle {
    /// No single-statement upsert
    #[default]
    Unsupported,
    /// `INSERT ... ON CONFLICT (..) DO UPDATE`
    OnConflict,
    /// `INSERT ... ON DUPLICATE KEY UPDATE`
    OnDuplicateKey,
    /// `MERGE INTO ... USING (VALUES ..)`
    Merge,
}

/// Identifier and type rules of a target database
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatabaseInfo {
    /// Token placed around delimited identifiers
    pub delimiter_token: String,
    /// Whether identifiers are delimited at all
    pub delimited_identifiers: bool,
    /// Separator placed after the catalog name
    pub catalog_separator: String,
    /// Separator placed after the schema name
    pub schema_separator: String,
    /// Bind DATE columns as TIMESTAMP
    pub date_overrides_to_timestamp: bool,
    /// Single-statement upsert support
    pub upsert: UpsertStyle,
}

impl Default for DatabaseInfo {
    fn default() -> Self {
        Self {
            delimiter_token: "\"".into(),
            delimited_identifiers: false,
            catalog_separator: ".".into(),
            schema_separator: ".".into(),
            date_overrides_to_timestamp: false,
            upsert: UpsertStyle::Unsupported,
        }
    }
}

impl DatabaseInfo {
    /// Effective quote string: the delimiter token, or empty when not delimiting
    pub fn quote(&self) -> &str {
        if self.delimited_identifiers {
            &self.delimiter_token
        } else {
            ""
        }
    }

    /// Enable or disable delimited identifiers
    pub fn with_delimited_identifiers(mut self, enabled: bool) -> Self {
        self.delimited_identifiers = enabled;
        self
    }

    /// Bind DATE columns as TIMESTAMP
    pub fn with_date_overrides_to_timestamp(mut self, enabled: bool) -> Self {
        self.date_overrides_to_timestamp = enabled;
        self
    }
}

/// SQL dialect for vendor-specific SQL generation
pub trait SqlDialect: Send + Sync {
    /// Get the dialect name
    fn name(&self) -> &'static str;

    /// Identifier and type rules used when compiling DML
    fn database_info(&self) -> DatabaseInfo;

    /// Quote an identifier (table, column name)
    fn quote_identifier(&self, name: &str) -> String;

    /// Escape a string literal
    fn escape_string(&self, value: &str) -> String {
        format!("'{}'", value.replace('\'', "''"))
    }

    /// Render an insert-or-update with one `?` per entry of `columns`.
    ///
    /// `columns` must include the key columns.
    fn upsert_sql(
        &self,
        _schema: Option<&str>,
        table: &str,
        _keys: &[&str],
        _columns: &[&str],
    ) -> Result<String> {
        Err(Error::unsupported(format!(
            "{} has no single-statement upsert (table {})",
            self.name(),
            table
        )))
    }
}

fn bind_markers(count: usize) -> Vec<sea_query::SimpleExpr> {
    (0..count).map(|_| Expr::cust("?")).collect()
}

fn on_conflict(targeted: bool, keys: &[&str], columns: &[&str]) -> OnConflict {
    let update_cols: Vec<_> = columns
        .iter()
        .filter(|c| !keys.contains(c))
        .map(|c| Alias::new(*c).into_iden())
        .collect();

    let mut on_conflict = if targeted {
        OnConflict::columns(keys.iter().map(|c| Alias::new(*c).into_iden()))
    } else {
        OnConflict::new()
    };
    match (update_cols.is_empty(), targeted) {
        (false, _) => {
            on_conflict.update_columns(update_cols);
        }
        (true, true) => {
            on_conflict.do_nothing();
        }
        // ON DUPLICATE KEY has no DO NOTHING form; re-assigning the key is a no-op
        (true, false) => {
            on_conflict.update_columns(keys.iter().map(|c| Alias::new(*c).into_iden()));
        }
    }
    on_conflict.to_owned()
}

fn insert_with_conflict(
    schema: Option<&str>,
    table: &str,
    conflict: OnConflict,
    columns: &[&str],
) -> Result<sea_query::InsertStatement> {
    let col_idens: Vec<_> = columns.iter().map(|c| Alias::new(*c).into_iden()).collect();

    let mut stmt = Query::insert();
    stmt.into_table(sea_table_ref(schema, table))
        .columns(col_idens)
        .values(bind_markers(columns.len()))
        .map_err(|e| Error::internal(format!("cannot build upsert for {}: {}", table, e)))?;
    stmt.on_conflict(conflict);
    Ok(stmt)
}

// ===========================================================================
// Generic ANSI dialect
// ===========================================================================

/// ANSI SQL dialect used when the target is not one of the known vendors
#[derive(Debug, Clone, Default)]
pub struct GenericDialect;

impl SqlDialect for GenericDialect {
    fn name(&self) -> &'static str {
        "Generic"
    }

    fn database_info(&self) -> DatabaseInfo {
        DatabaseInfo::default()
    }

    fn quote_identifier(&self, name: &str) -> String {
        format!("\"{}\"", name.replace('"', "\"\""))
    }
}

// ===========================================================================
// PostgreSQL: ON CONFLICT upserts via sea-query
// ===========================================================================

/// PostgreSQL dialect
#[derive(Debug, Clone, Default)]
pub struct PostgresDialect;

impl SqlDialect for PostgresDialect {
    fn name(&self) -> &'static str {
        "PostgreSQL"
    }

    fn database_info(&self) -> DatabaseInfo {
        DatabaseInfo {
            delimited_identifiers: true,
            upsert: UpsertStyle::OnConflict,
            ..DatabaseInfo::default()
        }
    }

    fn quote_identifier(&self, name: &str) -> String {
        format!("\"{}\"", name.replace('"', "\"\""))
    }

    fn upsert_sql(
        &self,
        schema: Option<&str>,
        table: &str,
        keys: &[&str],
        columns: &[&str],
    ) -> Result<String> {
        let conflict = on_conflict(true, keys, columns);
        Ok(insert_with_conflict(schema, table, conflict, columns)?.to_string(PostgresQueryBuilder))
    }
}

// ===========================================================================
// MySQL: ON DUPLICATE KEY upserts via sea-query
// ===========================================================================

/// MySQL dialect
#[derive(Debug, Clone, Default)]
pub struct MySqlDialect;

impl SqlDialect for MySqlDialect {
    fn name(&self) -> &'static str {
        "MySQL"
    }

    fn database_info(&self) -> DatabaseInfo {
        DatabaseInfo {
            delimiter_token: "`".into(),
            delimited_identifiers: true,
            upsert: UpsertStyle::OnDuplicateKey,
            ..DatabaseInfo::default()
        }
    }

    fn quote_identifier(&self, name: &str) -> String {
        format!("`{}`", name.replace('`', "``"))
    }

    fn escape_string(&self, value: &str) -> String {
        format!("'{}'", value.replace('\\', "\\\\").replace('\'', "''"))
    }

    fn upsert_sql(
        &self,
        schema: Option<&str>,
        table: &str,
        keys: &[&str],
        columns: &[&str],
    ) -> Result<String> {
        let conflict = on_conflict(false, keys, columns);
        Ok(insert_with_conflict(schema, table, conflict, columns)?.to_string(MysqlQueryBuilder))
    }
}

// ===========================================================================
// SQL Server: MERGE upserts, written by hand
// ===========================================================================

/// SQL Server dialect
#[derive(Debug, Clone, Default)]
pub struct SqlServerDialect;

impl SqlDialect for SqlServerDialect {
    fn name(&self) -> &'static str {
        "SQL Server"
    }

    fn database_info(&self) -> DatabaseInfo {
        DatabaseInfo {
            delimiter_token: "\"".into(),
            delimited_identifiers: true,
            date_overrides_to_timestamp: true,
            upsert: UpsertStyle::Merge,
            ..DatabaseInfo::default()
        }
    }

    fn quote_identifier(&self, name: &str) -> String {
        format!("[{}]", name.replace(']', "]]"))
    }

    fn upsert_sql(
        &self,
        schema: Option<&str>,
        table: &str,
        keys: &[&str],
        columns: &[&str],
    ) -> Result<String> {
        let target = match schema {
            Some(s) => format!(
                "{}.{}",
                self.quote_identifier(s),
                self.quote_identifier(table)
            ),
            None => self.quote_identifier(table),
        };
        let quoted: Vec<String> = columns.iter().map(|c| self.quote_identifier(c)).collect();
        let on = keys
            .iter()
            .map(|k| {
                let k = self.quote_identifier(k);
                format!("t.{} = s.{}", k, k)
            })
            .collect::<Vec<_>>()
            .join(" AND ");
        let set = columns
            .iter()
            .filter(|c| !keys.contains(c))
            .map(|c| {
                let c = self.quote_identifier(c);
                format!("t.{} = s.{}", c, c)
            })
            .collect::<Vec<_>>()
            .join(", ");
        let source_values = quoted
            .iter()
            .map(|c| format!("s.{}", c))
            .collect::<Vec<_>>()
            .join(", ");

        let mut sql = format!(
            "MERGE INTO {} AS t USING (VALUES ({})) AS s ({}) ON {}",
            target,
            vec!["?"; columns.len()].join(", "),
            quoted.join(", "),
            on
        );
        if !set.is_empty() {
            sql.push_str(&format!(" WHEN MATCHED THEN UPDATE SET {}", set));
        }
        sql.push_str(&format!(
            " WHEN NOT MATCHED THEN INSERT ({}) VALUES ({});",
            quoted.join(", "),
            source_values
        ));
        Ok(sql)
    }
}

// ===========================================================================
// MariaDB: MySQL wire and SQL compatible
// ===========================================================================

/// MariaDB dialect
#[derive(Debug, Clone, Default)]
pub struct MariaDbDialect;

impl SqlDialect for MariaDbDialect {
    fn name(&self) -> &'static str {
        "MariaDB"
    }

    fn database_info(&self) -> DatabaseInfo {
        MySqlDialect.database_info()
    }

    fn quote_identifier(&self, name: &str) -> String {
        MySqlDialect.quote_identifier(name)
    }

    fn escape_string(&self, value: &str) -> String {
        MySqlDialect.escape_string(value)
    }

    fn upsert_sql(
        &self,
        schema: Option<&str>,
        table: &str,
        keys: &[&str],
        columns: &[&str],
    ) -> Result<String> {
        MySqlDialect.upsert_sql(schema, table, keys, columns)
    }
}

/// Get a dialect by name, falling back to the generic ANSI dialect
pub fn dialect_for(name: &str) -> Box<dyn SqlDialect> {
    match name.to_lowercase().as_str() {
        "postgres" | "postgresql" | "pg" => Box::new(PostgresDialect),
        "mysql" => Box::new(MySqlDialect),
        "mariadb" => Box::new(MariaDbDialect),
        "sqlserver" | "mssql" | "sql server" => Box::new(SqlServerDialect),
        _ => Box::new(GenericDialect),
    }
}

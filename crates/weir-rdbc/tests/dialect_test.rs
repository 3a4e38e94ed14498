//! Unit tests for weir-rdbc dialect module

use weir_rdbc::dialect::{
    dialect_for, DatabaseInfo, GenericDialect, MariaDbDialect, MySqlDialect, PostgresDialect,
    SqlDialect, SqlServerDialect, UpsertStyle,
};

#[test]
fn test_postgres_quote_identifier() {
    let dialect = PostgresDialect;

    assert_eq!(dialect.quote_identifier("users"), "\"users\"");
    // Test escaping double quotes
    assert_eq!(dialect.quote_identifier("my\"table"), "\"my\"\"table\"");
}

#[test]
fn test_mysql_quote_identifier() {
    let dialect = MySqlDialect;

    assert_eq!(dialect.quote_identifier("users"), "`users`");
    // Test escaping backticks
    assert_eq!(dialect.quote_identifier("my`table"), "`my``table`");
}

#[test]
fn test_sqlserver_quote_identifier() {
    let dialect = SqlServerDialect;

    assert_eq!(dialect.quote_identifier("users"), "[users]");
    assert_eq!(dialect.quote_identifier("a]b"), "[a]]b]");
}

#[test]
fn test_escape_string() {
    assert_eq!(GenericDialect.escape_string("it's"), "'it''s'");
    assert_eq!(MySqlDialect.escape_string("a\\b"), "'a\\\\b'");
}

#[test]
fn test_database_info_per_dialect() {
    let pg = PostgresDialect.database_info();
    assert_eq!(pg.quote(), "\"");
    assert_eq!(pg.upsert, UpsertStyle::OnConflict);
    assert!(!pg.date_overrides_to_timestamp);

    let mssql = SqlServerDialect.database_info();
    assert!(mssql.date_overrides_to_timestamp);
    assert_eq!(mssql.upsert, UpsertStyle::Merge);

    assert_eq!(MariaDbDialect.database_info(), MySqlDialect.database_info());
    assert_eq!(GenericDialect.database_info(), DatabaseInfo::default());
}

#[test]
fn test_postgres_upsert_updates_non_key_columns() {
    let sql = PostgresDialect
        .upsert_sql(None, "orders", &["id"], &["id", "status", "total"])
        .unwrap();

    assert!(sql.contains("ON CONFLICT (\"id\")"));
    assert!(sql.contains("\"status\" = \"excluded\".\"status\""));
    assert!(!sql.contains("\"id\" = \"excluded\".\"id\""));
    assert_eq!(sql.matches('?').count(), 3);
}

#[test]
fn test_postgres_upsert_key_only_does_nothing() {
    let sql = PostgresDialect
        .upsert_sql(None, "tags", &["id"], &["id"])
        .unwrap();
    assert!(sql.contains("DO NOTHING"));
}

#[test]
fn test_mariadb_upsert_matches_mysql() {
    let mysql = MySqlDialect
        .upsert_sql(Some("shop"), "orders", &["id"], &["id", "status"])
        .unwrap();
    let mariadb = MariaDbDialect
        .upsert_sql(Some("shop"), "orders", &["id"], &["id", "status"])
        .unwrap();
    assert_eq!(mysql, mariadb);
    assert!(mysql.starts_with("INSERT INTO `shop`.`orders`"));
}

#[test]
fn test_sqlserver_merge_key_only() {
    let sql = SqlServerDialect
        .upsert_sql(None, "tags", &["id"], &["id"])
        .unwrap();
    assert!(!sql.contains("WHEN MATCHED"));
    assert!(sql.contains("WHEN NOT MATCHED THEN INSERT ([id]) VALUES (s.[id]);"));
}

#[test]
fn test_dialect_for_aliases() {
    assert_eq!(dialect_for("PostgreSQL").name(), "PostgreSQL");
    assert_eq!(dialect_for("pg").name(), "PostgreSQL");
    assert_eq!(dialect_for("sql server").name(), "SQL Server");
    assert_eq!(dialect_for("oracle").name(), "Generic");
}

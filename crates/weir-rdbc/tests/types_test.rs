//! Unit tests for weir-rdbc types module

use chrono::{NaiveDate, NaiveTime};
use weir_rdbc::types::{Column, Row, Table, TypeCode, Value};

#[test]
fn test_value_is_null() {
    assert!(Value::Null.is_null());
    assert!(!Value::Bool(false).is_null());
    assert!(!Value::Int64(0).is_null());
    assert!(!Value::String(String::new()).is_null());
}

#[test]
fn test_value_from_primitives() {
    assert_eq!(Value::from(true), Value::Bool(true));
    assert_eq!(Value::from(42i32), Value::Int64(42));
    assert_eq!(Value::from("hello"), Value::String("hello".into()));
    assert_eq!(Value::from(None::<i64>), Value::Null);
    assert_eq!(
        Value::from(vec![1, 2]),
        Value::Array(vec![Value::Int64(1), Value::Int64(2)])
    );
}

#[test]
fn test_from_text_none_is_null() {
    for code in [TypeCode::Integer, TypeCode::Varchar, TypeCode::Date] {
        assert_eq!(Value::from_text(None, code).unwrap(), Value::Null);
    }
}

#[test]
fn test_from_text_empty_string_stays_text() {
    assert_eq!(
        Value::from_text(Some(""), TypeCode::Varchar).unwrap(),
        Value::String(String::new())
    );
}

#[test]
fn test_from_text_temporal() {
    assert_eq!(
        Value::from_text(Some("2024-03-01 10:11:12"), TypeCode::Date).unwrap(),
        Value::Date(NaiveDate::from_ymd_opt(2024, 3, 1).unwrap())
    );
    assert_eq!(
        Value::from_text(Some("10:11:12"), TypeCode::Time).unwrap(),
        Value::Time(NaiveTime::from_hms_opt(10, 11, 12).unwrap())
    );
    let ts = Value::from_text(Some("2024-03-01T10:11:12.250"), TypeCode::Timestamp).unwrap();
    assert_eq!(ts.to_text().as_deref(), Some("2024-03-01 10:11:12.250"));
}

#[test]
fn test_from_text_rejects_garbage() {
    let err = Value::from_text(Some("abc"), TypeCode::Integer).unwrap_err();
    assert!(err.to_string().contains("abc"));
    assert!(Value::from_text(Some("maybe"), TypeCode::Boolean).is_err());
}

#[test]
fn test_binary_is_base64() {
    let value = Value::from_text(Some("AQID"), TypeCode::Blob).unwrap();
    assert_eq!(value, Value::Bytes(vec![1, 2, 3]));
    assert_eq!(value.to_text().as_deref(), Some("AQID"));
}

#[test]
fn test_placeholder_count() {
    assert_eq!(Value::Int64(1).placeholder_count(), 1);
    assert_eq!(Value::from(vec![1, 2, 3]).placeholder_count(), 3);
    let pairs = Value::Array(vec![Value::from(vec![1, 2]), Value::from(vec![3, 4])]);
    assert_eq!(pairs.placeholder_count(), 4);
}

#[test]
fn test_row_access() {
    let row = Row::new(
        vec!["id".into(), "name".into()],
        vec![Value::Int64(1), Value::from("Alice")],
    );
    assert_eq!(row.len(), 2);
    assert_eq!(row.get(0), Some(&Value::Int64(1)));
    assert_eq!(row.get_by_name("NAME"), Some(&Value::from("Alice")));
    assert_eq!(row.into_map().len(), 2);
}

#[test]
fn test_table_qualify_skips_empty_parts() {
    assert_eq!(Table::qualify(None, None, "T"), "T");
    assert_eq!(Table::qualify(Some(""), Some("s"), "T"), "s.T");
    assert_eq!(Table::qualify(Some("c"), Some("s"), "T"), "c.s.T");
}

#[test]
fn test_table_order_columns() {
    let table = Table::with_columns(
        None,
        Some("sales"),
        "ORDERS",
        vec![
            Column::key("ID", TypeCode::Integer),
            Column::new("STATUS", TypeCode::Varchar),
            Column::new("TOTAL", TypeCode::Decimal),
        ],
    );
    assert_eq!(table.primary_key_names(), vec!["ID"]);

    let ordered = table.order_columns(&["total".into(), "ID".into(), "EXTRA".into()]);
    assert_eq!(ordered.column_names(), vec!["TOTAL", "ID", "EXTRA"]);
    assert_eq!(ordered.columns[2].type_code, TypeCode::Varchar);
    assert_eq!(ordered.fully_qualified_name(), "sales.ORDERS");
}

//! Value and table model for weir-rdbc
//!
//! - `TypeCode`: JDBC-compatible column type codes used in bind type vectors
//! - `Value`: typed bind parameter
//! - `Column` / `Table`: target table descriptors handed to the DML builder

use crate::error::{Error, Result};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chrono::{NaiveDate, NaiveDateTime, NaiveTime};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::str::FromStr;

/// Column type codes, numerically identical to `java.sql.Types`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[allow(missing_docs)]
pub enum TypeCode {
    Bit,
    TinyInt,
    SmallInt,
    Integer,
    BigInt,
    Float,
    Real,
    Double,
    Numeric,
    Decimal,
    Char,
    Varchar,
    LongVarchar,
    NChar,
    NVarchar,
    Clob,
    Date,
    Time,
    Timestamp,
    Binary,
    VarBinary,
    LongVarBinary,
    Blob,
    Boolean,
    Null,
    Other,
}

impl TypeCode {
    /// Numeric JDBC type code
    pub const fn code(self) -> i32 {
        match self {
            Self::Bit => -7,
            Self::TinyInt => -6,
            Self::SmallInt => 5,
            Self::Integer => 4,
            Self::BigInt => -5,
            Self::Float => 6,
            Self::Real => 7,
            Self::Double => 8,
            Self::Numeric => 2,
            Self::Decimal => 3,
            Self::Char => 1,
            Self::Varchar => 12,
            Self::LongVarchar => -1,
            Self::NChar => -15,
            Self::NVarchar => -9,
            Self::Clob => 2005,
            Self::Date => 91,
            Self::Time => 92,
            Self::Timestamp => 93,
            Self::Binary => -2,
            Self::VarBinary => -3,
            Self::LongVarBinary => -4,
            Self::Blob => 2004,
            Self::Boolean => 16,
            Self::Null => 0,
            Self::Other => 1111,
        }
    }

    /// Resolve a numeric JDBC type code, mapping unknown codes to `Other`
    pub fn from_code(code: i32) -> Self {
        match code {
            -7 => Self::Bit,
            -6 => Self::TinyInt,
            5 => Self::SmallInt,
            4 => Self::Integer,
            -5 => Self::BigInt,
            6 => Self::Float,
            7 => Self::Real,
            8 => Self::Double,
            2 => Self::Numeric,
            3 => Self::Decimal,
            1 => Self::Char,
            12 => Self::Varchar,
            -1 => Self::LongVarchar,
            -15 => Self::NChar,
            -9 => Self::NVarchar,
            2005 => Self::Clob,
            91 => Self::Date,
            92 => Self::Time,
            93 => Self::Timestamp,
            -2 => Self::Binary,
            -3 => Self::VarBinary,
            -4 => Self::LongVarBinary,
            2004 => Self::Blob,
            16 => Self::Boolean,
            0 => Self::Null,
            _ => Self::Other,
        }
    }

    /// Character data
    pub const fn is_text(self) -> bool {
        matches!(
            self,
            Self::Char | Self::Varchar | Self::LongVarchar | Self::NChar | Self::NVarchar | Self::Clob
        )
    }

    /// Exact or approximate numeric data
    pub const fn is_numeric(self) -> bool {
        matches!(
            self,
            Self::TinyInt
                | Self::SmallInt
                | Self::Integer
                | Self::BigInt
                | Self::Float
                | Self::Real
                | Self::Double
                | Self::Numeric
                | Self::Decimal
        )
    }

    /// Binary data
    pub const fn is_binary(self) -> bool {
        matches!(
            self,
            Self::Binary | Self::VarBinary | Self::LongVarBinary | Self::Blob
        )
    }

    /// Date, time or timestamp
    pub const fn is_temporal(self) -> bool {
        matches!(self, Self::Date | Self::Time | Self::Timestamp)
    }
}

/// SQL value bound to a statement parameter
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[allow(missing_docs)]
pub enum Value {
    /// SQL NULL
    #[default]
    Null,
    /// Boolean value
    Bool(bool),
    /// Any integer width
    Int64(i64),
    /// Approximate numeric
    Float64(f64),
    /// Arbitrary precision decimal (NUMERIC, DECIMAL)
    Decimal(Decimal),
    /// Text string (VARCHAR, TEXT, CHAR)
    String(String),
    /// Binary data (BYTEA, BLOB, VARBINARY)
    Bytes(Vec<u8>),
    /// Date without time (DATE)
    Date(NaiveDate),
    /// Time without date (TIME)
    Time(NaiveTime),
    /// Timestamp without timezone (TIMESTAMP)
    DateTime(NaiveDateTime),
    /// Sequence of values, expanded into multiple placeholders
    Array(Vec<Value>),
}

const TIMESTAMP_FORMATS: &[&str] = &[
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y-%m-%d %H:%M:%S",
    "%Y-%m-%dT%H:%M:%S",
];

impl Value {
    /// Check if value is NULL
    #[inline]
    pub const fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    /// Convert the captured text form of a column into a typed value.
    ///
    /// Binary columns are expected base64 encoded. Temporal values accept
    /// ISO-8601 with either a space or `T` separator. A DATE column given a
    /// full timestamp keeps only the date part.
    pub fn from_text(text: Option<&str>, type_code: TypeCode) -> Result<Self> {
        let Some(text) = text else {
            return Ok(Self::Null);
        };
        let conversion =
            |kind: &str| Error::type_conversion(format!("cannot convert '{}' to {}", text, kind));

        let value = match type_code {
            TypeCode::TinyInt | TypeCode::SmallInt | TypeCode::Integer | TypeCode::BigInt => {
                Self::Int64(text.trim().parse().map_err(|_| conversion("integer"))?)
            }
            TypeCode::Float | TypeCode::Real | TypeCode::Double => {
                Self::Float64(text.trim().parse().map_err(|_| conversion("float"))?)
            }
            TypeCode::Numeric | TypeCode::Decimal => Self::Decimal(
                Decimal::from_str(text.trim())
                    .or_else(|_| Decimal::from_scientific(text.trim()))
                    .map_err(|_| conversion("decimal"))?,
            ),
            TypeCode::Bit | TypeCode::Boolean => match text.trim() {
                "1" | "true" | "TRUE" | "t" | "y" | "Y" => Self::Bool(true),
                "0" | "false" | "FALSE" | "f" | "n" | "N" => Self::Bool(false),
                _ => return Err(conversion("boolean")),
            },
            TypeCode::Date => {
                let date_part = text.trim().get(..10).unwrap_or(text.trim());
                Self::Date(
                    NaiveDate::parse_from_str(date_part, "%Y-%m-%d")
                        .map_err(|_| conversion("date"))?,
                )
            }
            TypeCode::Time => Self::Time(
                NaiveTime::parse_from_str(text.trim(), "%H:%M:%S%.f")
                    .or_else(|_| NaiveTime::parse_from_str(text.trim(), "%H:%M:%S"))
                    .map_err(|_| conversion("time"))?,
            ),
            TypeCode::Timestamp => Self::DateTime(parse_timestamp(text.trim()).ok_or_else(|| {
                conversion("timestamp")
            })?),
            TypeCode::Binary | TypeCode::VarBinary | TypeCode::LongVarBinary | TypeCode::Blob => {
                Self::Bytes(BASE64.decode(text).map_err(|_| conversion("binary"))?)
            }
            TypeCode::Null => Self::Null,
            _ => Self::String(text.to_string()),
        };
        Ok(value)
    }

    /// Render the value back to its captured text form
    pub fn to_text(&self) -> Option<String> {
        match self {
            Self::Null => None,
            Self::Bool(b) => Some(if *b { "1" } else { "0" }.to_string()),
            Self::Int64(i) => Some(i.to_string()),
            Self::Float64(f) => Some(f.to_string()),
            Self::Decimal(d) => Some(d.to_string()),
            Self::String(s) => Some(s.clone()),
            Self::Bytes(b) => Some(BASE64.encode(b)),
            Self::Date(d) => Some(d.format("%Y-%m-%d").to_string()),
            Self::Time(t) => Some(t.format("%H:%M:%S%.f").to_string()),
            Self::DateTime(ts) => Some(ts.format("%Y-%m-%d %H:%M:%S%.f").to_string()),
            Self::Array(items) => Some(
                items
                    .iter()
                    .map(|v| v.to_text().unwrap_or_default())
                    .collect::<Vec<_>>()
                    .join(","),
            ),
        }
    }

    /// Try to convert to i64
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Self::Int64(i) => Some(*i),
            Self::Bool(b) => Some(i64::from(*b)),
            Self::String(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    /// Get as string reference
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(s) => Some(s),
            _ => None,
        }
    }

    /// Number of placeholders this value occupies once expanded
    pub fn placeholder_count(&self) -> usize {
        match self {
            Self::Array(items) => items
                .iter()
                .map(|item| match item {
                    Self::Array(inner) => inner.len(),
                    _ => 1,
                })
                .sum(),
            _ => 1,
        }
    }
}

fn parse_timestamp(text: &str) -> Option<NaiveDateTime> {
    TIMESTAMP_FORMATS
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(text, fmt).ok())
        .or_else(|| {
            NaiveDate::parse_from_str(text, "%Y-%m-%d")
                .ok()
                .and_then(|d| d.and_hms_opt(0, 0, 0))
        })
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Self::Bool(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Self::Int64(i64::from(v))
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Self::Int64(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Self::Float64(v)
    }
}

impl From<Decimal> for Value {
    fn from(v: Decimal) -> Self {
        Self::Decimal(v)
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Self::String(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Self::String(v.to_string())
    }
}

impl From<NaiveDateTime> for Value {
    fn from(v: NaiveDateTime) -> Self {
        Self::DateTime(v)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        match v {
            Some(v) => v.into(),
            None => Self::Null,
        }
    }
}

impl<T: Into<Value>> From<Vec<T>> for Value {
    fn from(v: Vec<T>) -> Self {
        Self::Array(v.into_iter().map(Into::into).collect())
    }
}

/// Database row as ordered column values
#[derive(Debug, Clone)]
pub struct Row {
    columns: Vec<String>,
    values: Vec<Value>,
}

impl Row {
    /// Create a new row
    pub fn new(columns: Vec<String>, values: Vec<Value>) -> Self {
        debug_assert_eq!(columns.len(), values.len());
        Self { columns, values }
    }

    /// Get column count
    #[inline]
    pub fn len(&self) -> usize {
        self.columns.len()
    }

    /// Check if row is empty
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }

    /// Get all values
    #[inline]
    pub fn values(&self) -> &[Value] {
        &self.values
    }

    /// Get value by column index
    #[inline]
    pub fn get(&self, idx: usize) -> Option<&Value> {
        self.values.get(idx)
    }

    /// Get value by column name
    pub fn get_by_name(&self, name: &str) -> Option<&Value> {
        self.columns
            .iter()
            .position(|c| c.eq_ignore_ascii_case(name))
            .and_then(|idx| self.values.get(idx))
    }

    /// Convert row to HashMap
    pub fn into_map(self) -> HashMap<String, Value> {
        self.columns.into_iter().zip(self.values).collect()
    }
}

/// Column descriptor
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Column {
    /// Column name
    pub name: String,
    /// JDBC type code
    pub type_code: TypeCode,
    /// Vendor type name, when known
    #[serde(default)]
    pub type_name: Option<String>,
    /// Part of the primary key
    #[serde(default)]
    pub primary_key: bool,
    /// NOT NULL
    #[serde(default)]
    pub required: bool,
    /// Generated by the database on insert
    #[serde(default)]
    pub auto_increment: bool,
    /// Maximum length for string/binary types
    #[serde(default)]
    pub size: Option<u32>,
}

impl Column {
    /// Create a nullable, non-key column
    pub fn new(name: impl Into<String>, type_code: TypeCode) -> Self {
        Self {
            name: name.into(),
            type_code,
            type_name: None,
            primary_key: false,
            required: false,
            auto_increment: false,
            size: None,
        }
    }

    /// Create a required primary key column
    pub fn key(name: impl Into<String>, type_code: TypeCode) -> Self {
        Self {
            primary_key: true,
            required: true,
            ..Self::new(name, type_code)
        }
    }

    /// Mark the column NOT NULL
    pub fn with_required(mut self, required: bool) -> Self {
        self.required = required;
        self
    }

    /// Mark the column as generated by the database
    pub fn with_auto_increment(mut self, auto_increment: bool) -> Self {
        self.auto_increment = auto_increment;
        self
    }
}

/// Table descriptor
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Table {
    /// Catalog (database for SQL Server)
    #[serde(default)]
    pub catalog: Option<String>,
    /// Schema (or database for MySQL)
    #[serde(default)]
    pub schema: Option<String>,
    /// Table name
    pub name: String,
    /// Columns in ordinal order
    #[serde(default)]
    pub columns: Vec<Column>,
}

impl Table {
    /// Create a table without columns
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            catalog: None,
            schema: None,
            name: name.into(),
            columns: Vec::new(),
        }
    }

    /// Create a qualified table with columns
    pub fn with_columns(
        catalog: Option<&str>,
        schema: Option<&str>,
        name: impl Into<String>,
        columns: Vec<Column>,
    ) -> Self {
        Self {
            catalog: catalog.filter(|c| !c.is_empty()).map(str::to_string),
            schema: schema.filter(|s| !s.is_empty()).map(str::to_string),
            name: name.into(),
            columns,
        }
    }

    /// `catalog.schema.name`, skipping absent parts
    pub fn fully_qualified_name(&self) -> String {
        Self::qualify(self.catalog.as_deref(), self.schema.as_deref(), &self.name)
    }

    /// Join name parts with `.`, skipping absent or empty parts
    pub fn qualify(catalog: Option<&str>, schema: Option<&str>, name: &str) -> String {
        [catalog, schema, Some(name)]
            .into_iter()
            .flatten()
            .filter(|part| !part.is_empty())
            .collect::<Vec<_>>()
            .join(".")
    }

    /// Get column by name (case-insensitive)
    pub fn column(&self, name: &str) -> Option<&Column> {
        self.columns
            .iter()
            .find(|c| c.name.eq_ignore_ascii_case(name))
    }

    /// Position of a column by name (case-insensitive)
    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns
            .iter()
            .position(|c| c.name.eq_ignore_ascii_case(name))
    }

    /// Get primary key columns
    pub fn primary_key_columns(&self) -> Vec<&Column> {
        self.columns.iter().filter(|c| c.primary_key).collect()
    }

    /// Get primary key column names
    pub fn primary_key_names(&self) -> Vec<&str> {
        self.columns
            .iter()
            .filter(|c| c.primary_key)
            .map(|c| c.name.as_str())
            .collect()
    }

    /// Get column names
    pub fn column_names(&self) -> Vec<&str> {
        self.columns.iter().map(|c| c.name.as_str()).collect()
    }

    /// Copy of this table restricted to the named columns, in the given order.
    ///
    /// Names with no matching column become VARCHAR columns so that rows
    /// carrying extra data can still be described.
    pub fn order_columns(&self, names: &[String]) -> Table {
        let columns = names
            .iter()
            .map(|name| {
                self.column(name)
                    .cloned()
                    .unwrap_or_else(|| Column::new(name.clone(), TypeCode::Varchar))
            })
            .collect();
        Table {
            catalog: self.catalog.clone(),
            schema: self.schema.clone(),
            name: self.name.clone(),
            columns,
        }
    }
}

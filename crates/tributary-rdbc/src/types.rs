//! Value types for tributary-rdbc
//!
//! A driver-neutral value model for result columns and bound parameters:
//! - Primitive types (bool, integers, floats, decimal)
//! - Date/time types with timezone support
//! - Binary data, UUIDs, JSON and arrays

use base64::Engine;
use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use uuid::Uuid;

use crate::error::{Error, Result};

/// SQL value type that can hold any database value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Value {
    /// SQL NULL
    Null,
    /// Boolean value
    Bool(bool),
    /// 8-bit signed integer (TINYINT)
    Int8(i8),
    /// 16-bit signed integer (SMALLINT)
    Int16(i16),
    /// 32-bit signed integer (INTEGER)
    Int32(i32),
    /// 64-bit signed integer (BIGINT)
    Int64(i64),
    /// 32-bit floating point (REAL)
    Float32(f32),
    /// 64-bit floating point (DOUBLE PRECISION)
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
    /// Timestamp with timezone (TIMESTAMPTZ)
    DateTimeTz(DateTime<Utc>),
    /// UUID
    Uuid(Uuid),
    /// JSON value
    Json(serde_json::Value),
    /// Array of values
    Array(Vec<Value>),
}

impl Value {
    /// Check if value is NULL
    #[inline]
    pub const fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    /// Short name of the variant, for error messages
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Null => "null",
            Self::Bool(_) => "bool",
            Self::Int8(_) | Self::Int16(_) | Self::Int32(_) | Self::Int64(_) => "integer",
            Self::Float32(_) | Self::Float64(_) => "float",
            Self::Decimal(_) => "decimal",
            Self::String(_) => "string",
            Self::Bytes(_) => "bytes",
            Self::Date(_) => "date",
            Self::Time(_) => "time",
            Self::DateTime(_) => "timestamp",
            Self::DateTimeTz(_) => "timestamptz",
            Self::Uuid(_) => "uuid",
            Self::Json(_) => "json",
            Self::Array(_) => "array",
        }
    }

    /// Integer view; decimals and strings must hold a whole number
    pub fn as_i64(&self) -> Option<i64> {
        use rust_decimal::prelude::ToPrimitive;
        match *self {
            Self::Int8(n) => Some(n.into()),
            Self::Int16(n) => Some(n.into()),
            Self::Int32(n) => Some(n.into()),
            Self::Int64(n) => Some(n),
            Self::Decimal(d) if d.fract().is_zero() => d.to_i64(),
            Self::String(ref s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    /// Text view
    pub fn as_str(&self) -> Option<&str> {
        if let Self::String(s) = self {
            Some(s)
        } else {
            None
        }
    }

    /// Try to read as a UTC timestamp
    ///
    /// Naive timestamps are interpreted as UTC.
    pub fn as_timestamp(&self) -> Option<DateTime<Utc>> {
        match self {
            Self::DateTimeTz(dt) => Some(*dt),
            Self::DateTime(dt) => Some(dt.and_utc()),
            Self::String(s) => DateTime::parse_from_rfc3339(s)
                .ok()
                .map(|dt| dt.with_timezone(&Utc)),
            _ => None,
        }
    }

    /// Render the value as a scalar string key (used for document ids and routing)
    pub fn to_key_string(&self) -> Option<String> {
        match self {
            Self::Null | Self::Json(_) | Self::Array(_) | Self::Bytes(_) => None,
            Self::String(s) => Some(s.clone()),
            Self::Bool(b) => Some(b.to_string()),
            Self::Int8(n) => Some(n.to_string()),
            Self::Int16(n) => Some(n.to_string()),
            Self::Int32(n) => Some(n.to_string()),
            Self::Int64(n) => Some(n.to_string()),
            Self::Float32(n) => Some(n.to_string()),
            Self::Float64(n) => Some(n.to_string()),
            Self::Decimal(d) => Some(d.to_string()),
            Self::Date(d) => Some(d.to_string()),
            Self::Time(t) => Some(t.to_string()),
            Self::DateTime(dt) => Some(dt.to_string()),
            Self::DateTimeTz(dt) => Some(dt.to_rfc3339()),
            Self::Uuid(u) => Some(u.to_string()),
        }
    }

    /// Convert to a JSON document value
    ///
    /// Non-finite floats have no JSON representation and fail with
    /// [`Error::Conversion`].
    pub fn to_json(&self) -> Result<serde_json::Value> {
        use serde_json::Value as Json;

        Ok(match self {
            Self::Null => Json::Null,
            Self::Bool(b) => Json::Bool(*b),
            Self::Int8(n) => Json::from(*n),
            Self::Int16(n) => Json::from(*n),
            Self::Int32(n) => Json::from(*n),
            Self::Int64(n) => Json::from(*n),
            Self::Float32(n) => finite_number(f64::from(*n))?,
            Self::Float64(n) => finite_number(*n)?,
            Self::Decimal(d) => Json::String(d.to_string()),
            Self::String(s) => Json::String(s.clone()),
            Self::Bytes(b) => Json::String(base64::engine::general_purpose::STANDARD.encode(b)),
            Self::Date(d) => Json::String(d.format("%Y-%m-%d").to_string()),
            Self::Time(t) => Json::String(t.format("%H:%M:%S%.f").to_string()),
            Self::DateTime(dt) => Json::String(dt.format("%Y-%m-%dT%H:%M:%S%.f").to_string()),
            Self::DateTimeTz(dt) => Json::String(dt.to_rfc3339()),
            Self::Uuid(u) => Json::String(u.to_string()),
            Self::Json(j) => j.clone(),
            Self::Array(arr) => Json::Array(
                arr.iter()
                    .map(Value::to_json)
                    .collect::<Result<Vec<_>>>()?,
            ),
        })
    }
}

fn finite_number(n: f64) -> Result<serde_json::Value> {
    serde_json::Number::from_f64(n)
        .map(serde_json::Value::Number)
        .ok_or_else(|| Error::type_conversion(format!("{} has no JSON representation", n)))
}

macro_rules! value_from {
    ($($ty:ty => $variant:ident),* $(,)?) => {
        $(
            impl From<$ty> for Value {
                fn from(v: $ty) -> Self {
                    Self::$variant(v)
                }
            }
        )*
    };
}

value_from! {
    bool => Bool,
    i16 => Int16,
    i32 => Int32,
    i64 => Int64,
    f64 => Float64,
    Decimal => Decimal,
    String => String,
    NaiveDateTime => DateTime,
    DateTime<Utc> => DateTimeTz,
    Uuid => Uuid,
    serde_json::Value => Json,
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Self::String(v.to_owned())
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        match v {
            Some(val) => val.into(),
            None => Self::Null,
        }
    }
}

/// One result row
///
/// Rows of a result set share their column labels.
#[derive(Debug, Clone, PartialEq)]
pub struct Row {
    columns: Arc<[String]>,
    values: Vec<Value>,
}

impl Row {
    /// Build a row; `columns` and `values` line up by position
    pub fn new(columns: impl Into<Arc<[String]>>, values: Vec<Value>) -> Self {
        let columns = columns.into();
        debug_assert_eq!(columns.len(), values.len());
        Self { columns, values }
    }

    /// Number of columns
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// Whether the row has no columns
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Column labels in select-list order
    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    /// Shared handle on the labels, for building sibling rows
    pub fn column_set(&self) -> Arc<[String]> {
        Arc::clone(&self.columns)
    }

    /// Values in select-list order
    pub fn values(&self) -> &[Value] {
        &self.values
    }

    /// Value at a position
    pub fn get(&self, idx: usize) -> Option<&Value> {
        self.values.get(idx)
    }

    /// First value whose label matches, ignoring ASCII case
    pub fn get_by_name(&self, name: &str) -> Option<&Value> {
        let idx = self.columns.iter().position(|c| c.eq_ignore_ascii_case(name))?;
        self.values.get(idx)
    }

    /// `(label, value)` pairs in select-list order
    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.columns.iter().map(String::as_str).zip(&self.values)
    }

    /// Take the values, dropping the labels
    pub fn into_values(self) -> Vec<Value> {
        self.values
    }
}

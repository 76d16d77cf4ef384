//! Unit tests for tributary-rdbc types module

use chrono::{NaiveDate, TimeZone, Utc};
use rust_decimal::Decimal;
use serde_json::json;
use std::str::FromStr;
use tributary_rdbc::types::{Row, Value};

#[test]
fn test_value_null() {
    let v = Value::Null;
    assert!(v.is_null());
    assert_eq!(v.as_str(), None);
    assert_eq!(v.as_i64(), None);
    assert_eq!(v.to_json().unwrap(), serde_json::Value::Null);
}

#[test]
fn test_value_integer_types() {
    assert_eq!(Value::Int8(42).as_i64(), Some(42));
    assert_eq!(Value::Int16(-100).as_i64(), Some(-100));
    assert_eq!(Value::Int64(i64::MAX).as_i64(), Some(i64::MAX));
    assert_eq!(Value::String("17".into()).as_i64(), Some(17));
}

#[test]
fn test_decimal_renders_as_string() {
    let d = Decimal::from_str("12.50").unwrap();
    assert_eq!(Value::Decimal(d).to_json().unwrap(), json!("12.50"));
}

#[test]
fn test_date_renders_iso() {
    let d = NaiveDate::from_ymd_opt(2024, 2, 29).unwrap();
    assert_eq!(Value::Date(d).to_json().unwrap(), json!("2024-02-29"));

    let ts = NaiveDate::from_ymd_opt(2024, 2, 29)
        .unwrap()
        .and_hms_opt(10, 30, 0)
        .unwrap();
    assert_eq!(Value::DateTime(ts).to_json().unwrap(), json!("2024-02-29T10:30:00"));
}

#[test]
fn test_nested_json_passthrough() {
    let doc = json!({"tags": ["a", "b"], "n": 1});
    assert_eq!(Value::Json(doc.clone()).to_json().unwrap(), doc);
}

#[test]
fn test_array_to_json() {
    let v = Value::Array(vec![Value::Int32(1), Value::Null, Value::String("x".into())]);
    assert_eq!(v.to_json().unwrap(), json!([1, null, "x"]));
}

#[test]
fn test_infinite_float_is_conversion_error() {
    let err = Value::Float64(f64::NEG_INFINITY).to_json().unwrap_err();
    assert!(!err.is_retriable());
    assert!(err.to_string().starts_with("cannot convert value"));
}

#[test]
fn test_timestamp_from_value() {
    let ts = Utc.with_ymd_and_hms(2023, 12, 31, 23, 59, 59).unwrap();
    assert_eq!(Value::from(ts).as_timestamp(), Some(ts));
}

#[test]
fn test_row_lookup_is_case_insensitive() {
    let row = Row::new(
        vec!["_id".to_string(), "Name".to_string()],
        vec![Value::Int64(1), Value::String("widget".into())],
    );
    assert_eq!(row.get_by_name("name"), Some(&Value::from("widget")));
    assert_eq!(row.get_by_name("missing"), None);
    assert_eq!(row.values().len(), 2);
}

#[test]
fn test_whole_decimal_as_integer() {
    assert_eq!(Value::Decimal(Decimal::from_str("42.00").unwrap()).as_i64(), Some(42));
    assert_eq!(Value::Decimal(Decimal::from_str("4.5").unwrap()).as_i64(), None);
    assert_eq!(Value::String(" 9 ".into()).as_i64(), Some(9));
}

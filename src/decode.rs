//! Facilities for decoding text protocol values from query results
use chrono::{NaiveDate, NaiveDateTime};

use crate::{
    constants::{column_flag, type_},
    row::Field,
};

/// A single decoded column value
///
/// The text protocol sends every value as a byte string; the variant is
/// picked from the column type in the preceding field package.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    /// SQL NULL, distinct from an empty string
    Null,
    /// A signed integer column
    Int(i64),
    /// An unsigned integer column
    UInt(u64),
    /// A float or double column
    Double(f64),
    /// A BIT column, a single zero byte is false
    Bool(bool),
    /// A string-like column, or any value whose text failed to parse as its
    /// declared type
    Text(String),
    /// A value whose bytes were not valid utf-8
    Bytes(Vec<u8>),
    /// A DATE column
    Date(NaiveDate),
    /// A DATETIME or TIMESTAMP column
    DateTime(NaiveDateTime),
    /// A JSON column
    Json(serde_json::Value),
}

impl Value {
    /// Return true if the value is SQL NULL
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Return the value as a signed integer if it is one
    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(v) => Some(*v),
            Value::UInt(v) => i64::try_from(*v).ok(),
            _ => None,
        }
    }

    /// Return the value as a string slice if it is text
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Text(v) => Some(v),
            _ => None,
        }
    }
}

/// Decode the utf-8 text of a value by its declared column type
///
/// The value bytes of `raw` are owned by the row package; decoding performs
/// exactly one utf-8 validation per column. Values whose text does not parse
/// as the declared type fall back to [Value::Text], the server is the
/// authority on what it sent.
pub(crate) fn decode_value(field: &Field, raw: Option<&[u8]>) -> Value {
    let Some(raw) = raw else {
        return Value::Null;
    };
    match field.r#type {
        type_::DATE => match text(raw).and_then(|s| parse_date(s).map(Value::Date)) {
            Some(v) => v,
            None => fallback(raw),
        },
        type_::DATETIME | type_::TIMESTAMP => {
            match text(raw).and_then(|s| parse_datetime(s).map(Value::DateTime)) {
                Some(v) => v,
                None => fallback(raw),
            }
        }
        type_::TINY | type_::SHORT | type_::INT24 | type_::LONG | type_::LONG_LONG
        | type_::YEAR => {
            let unsigned = field.flags & column_flag::UNSIGNED != 0;
            let parsed = if unsigned {
                text(raw).and_then(|s| s.parse().ok().map(Value::UInt))
            } else {
                text(raw).and_then(|s| s.parse().ok().map(Value::Int))
            };
            match parsed {
                Some(v) => v,
                None => fallback(raw),
            }
        }
        type_::FLOAT | type_::DOUBLE => {
            match text(raw).and_then(|s| s.parse().ok().map(Value::Double)) {
                Some(v) => v,
                None => fallback(raw),
            }
        }
        type_::BIT => Value::Bool(raw.iter().any(|&b| b != 0)),
        type_::JSON => match serde_json::from_slice(raw) {
            Ok(v) => Value::Json(v),
            Err(_) => fallback(raw),
        },
        _ => fallback(raw),
    }
}

/// View the raw bytes as utf-8 text
fn text(raw: &[u8]) -> Option<&str> {
    str::from_utf8(raw).ok()
}

/// Decode raw bytes as text, keeping them as bytes when they are not utf-8
fn fallback(raw: &[u8]) -> Value {
    match str::from_utf8(raw) {
        Ok(s) => Value::Text(s.to_string()),
        Err(_) => Value::Bytes(raw.to_vec()),
    }
}

/// Parse a DATE column value
fn parse_date(s: &str) -> Option<NaiveDate> {
    NaiveDate::parse_from_str(s, "%Y-%m-%d").ok()
}

/// Parse a DATETIME or TIMESTAMP column value, with or without fractional
/// seconds
fn parse_datetime(s: &str) -> Option<NaiveDateTime> {
    NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f").ok()
}

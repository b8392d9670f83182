//! Dynamically-typed instrument values.
//!
//! Instruments report strings, integers, floats, booleans or nothing at all.
//! `Value` carries whichever of those an instrument produced; numeric views
//! are available for recording and for segment logic that compares readings.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Last-known value of an instrument or a commanded setpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(untagged)]
pub enum Value {
    /// No value (never read, failed read, or unavailable composite)
    #[default]
    None,
    /// Boolean state (outputs, enables)
    Bool(bool),
    /// Integer reading
    Int(i64),
    /// Floating point reading
    Float(f64),
    /// Free-form text
    Str(String),
}

impl Value {
    /// Numeric view of the value. Booleans map to 0/1, numeric strings are parsed.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::None => None,
            Value::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
            Value::Int(i) => Some(*i as f64),
            Value::Float(f) => Some(*f),
            Value::Str(s) => s.trim().parse().ok(),
        }
    }

    /// Boolean view of the value.
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            Value::Int(i) => Some(*i != 0),
            Value::Float(f) => Some(*f != 0.0),
            Value::Str(s) => match s.trim().to_ascii_lowercase().as_str() {
                "true" | "on" | "1" => Some(true),
                "false" | "off" | "0" => Some(false),
                _ => None,
            },
            Value::None => None,
        }
    }

    /// Whether this is the `None` value.
    pub fn is_none(&self) -> bool {
        matches!(self, Value::None)
    }

    /// Convert a TOML value into an instrument value. Arrays and tables have no scalar form.
    pub fn from_toml(value: &toml::Value) -> Option<Self> {
        match value {
            toml::Value::String(s) => Some(Value::Str(s.clone())),
            toml::Value::Integer(i) => Some(Value::Int(*i)),
            toml::Value::Float(f) => Some(Value::Float(*f)),
            toml::Value::Boolean(b) => Some(Value::Bool(*b)),
            toml::Value::Datetime(d) => Some(Value::Str(d.to_string())),
            toml::Value::Array(_) | toml::Value::Table(_) => None,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::None => write!(f, "None"),
            Value::Bool(b) => write!(f, "{}", b),
            Value::Int(i) => write!(f, "{}", i),
            Value::Float(v) => write!(f, "{}", v),
            Value::Str(s) => write!(f, "{}", s),
        }
    }
}

impl From<f64> for Value {
    fn from(value: f64) -> Self {
        Value::Float(value)
    }
}

impl From<i64> for Value {
    fn from(value: i64) -> Self {
        Value::Int(value)
    }
}

impl From<bool> for Value {
    fn from(value: bool) -> Self {
        Value::Bool(value)
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Value::Str(value.to_string())
    }
}

impl From<String> for Value {
    fn from(value: String) -> Self {
        Value::Str(value)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(value: Option<T>) -> Self {
        value.map_or(Value::None, Into::into)
    }
}

//! Typed values decoded from result payloads.

use std::fmt;

use serde::de::DeserializeOwned;
use serde::{Serialize, Serializer};
use serde_json::{Map, Number};

use crate::error::BridgeError;
use crate::key::ValueShape;

/// A decoded key value.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Bool(bool),
    Uint(u64),
    Float(f64),
    String(String),
    Record(Map<String, serde_json::Value>),
}

impl Value {
    /// Decode a JSON value into the shape a key expects.
    ///
    /// `null` decodes to [`Value::Null`] for every shape. Integral floats are
    /// accepted for [`ValueShape::Uint`] since the device reports every number
    /// as a double.
    ///
    /// # Errors
    ///
    /// Returns [`BridgeError::Decode`] when the JSON does not fit `shape`.
    pub fn decode(shape: ValueShape, json: serde_json::Value) -> Result<Value, BridgeError> {
        use serde_json::Value as J;

        match (shape, json) {
            (_, J::Null) => Ok(Value::Null),
            (ValueShape::Bool, J::Bool(b)) => Ok(Value::Bool(b)),
            (ValueShape::Uint, J::Number(n)) => number_to_u64(&n)
                .map(Value::Uint)
                .ok_or_else(|| BridgeError::Decode(format!("{n} is not an unsigned integer"))),
            (ValueShape::Float, J::Number(n)) => n
                .as_f64()
                .map(Value::Float)
                .ok_or_else(|| BridgeError::Decode(format!("{n} is not a float"))),
            (ValueShape::String, J::String(s)) => Ok(Value::String(s)),
            (ValueShape::Record, J::Object(map)) => Ok(Value::Record(map)),
            (ValueShape::Void, other) => Err(BridgeError::Decode(format!(
                "unexpected value {other} for a key without a value"
            ))),
            (shape, other) => Err(BridgeError::Decode(format!(
                "expected {shape:?}, got {other}"
            ))),
        }
    }

    /// Re-encode as plain JSON.
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Value::Null => serde_json::Value::Null,
            Value::Bool(b) => serde_json::Value::Bool(*b),
            Value::Uint(n) => serde_json::Value::Number(Number::from(*n)),
            Value::Float(f) => Number::from_f64(*f)
                .map(serde_json::Value::Number)
                .unwrap_or(serde_json::Value::Null),
            Value::String(s) => serde_json::Value::String(s.clone()),
            Value::Record(map) => serde_json::Value::Object(map.clone()),
        }
    }

    /// Build a [`Value::Record`] from any serialisable struct.
    pub fn from_record<T: Serialize>(record: &T) -> Result<Value, BridgeError> {
        match serde_json::to_value(record) {
            Ok(serde_json::Value::Object(map)) => Ok(Value::Record(map)),
            Ok(other) => Err(BridgeError::Decode(format!("{other} is not a record"))),
            Err(e) => Err(BridgeError::Decode(e.to_string())),
        }
    }

    /// Deserialise a [`Value::Record`] into a typed struct.
    pub fn record<T: DeserializeOwned>(&self) -> Result<T, BridgeError> {
        match self {
            Value::Record(map) => serde_json::from_value(serde_json::Value::Object(map.clone()))
                .map_err(|e| BridgeError::Decode(e.to_string())),
            other => Err(BridgeError::Decode(format!("{other} is not a record"))),
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_u64(&self) -> Option<u64> {
        match self {
            Value::Uint(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Float(f) => Some(*f),
            Value::Uint(n) => Some(*n as f64),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }
}

fn number_to_u64(n: &Number) -> Option<u64> {
    if let Some(v) = n.as_u64() {
        return Some(v);
    }
    let f = n.as_f64()?;
    (f >= 0.0 && f.fract() == 0.0 && f <= u64::MAX as f64).then_some(f as u64)
}

impl Serialize for Value {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.to_json().serialize(serializer)
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_json())
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<u64> for Value {
    fn from(n: u64) -> Self {
        Value::Uint(n)
    }
}

impl From<f64> for Value {
    fn from(f: f64) -> Self {
        Value::Float(f)
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::String(s)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::String(s.to_string())
    }
}

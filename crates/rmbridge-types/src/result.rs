//! [`KeyResult`] – the outcome of an operation on a key.
//!
//! Results cross the native boundary as a JSON envelope:
//!
//! ```json
//! {"Key": 117440513, "Tag": 42, "Error": 0, "Value": {"value": true}}
//! ```
//!
//! `Value` may be wrapped once in a `{"value": …}` object. Decoding never
//! fails outright: problems are recorded in the result itself with error
//! code [`DECODE_ERROR_CODE`] so a malformed reply cannot take down the
//! thread delivering it.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::error::BridgeError;
use crate::key::{Key, ValueShape};
use crate::value::Value;

/// Error code recorded when a result envelope could not be decoded locally.
pub const DECODE_ERROR_CODE: i32 = -1;

#[derive(Deserialize)]
struct Envelope {
    #[serde(rename = "Key")]
    key: u32,
    #[serde(rename = "Tag", default)]
    tag: u64,
    #[serde(rename = "Error", default)]
    error: i32,
    #[serde(rename = "Value", default)]
    value: serde_json::Value,
}

#[derive(Serialize)]
struct OutEnvelope {
    #[serde(rename = "Key")]
    key: u32,
    #[serde(rename = "Tag")]
    tag: u64,
    #[serde(rename = "Error")]
    error: i32,
    #[serde(rename = "Value")]
    value: serde_json::Value,
}

/// Result of an operation on a key. `key` is `None` when the envelope could
/// not be attributed to a catalog key.
#[derive(Debug, Clone, PartialEq)]
pub struct KeyResult {
    key: Option<Key>,
    tag: u64,
    error_code: i32,
    error_desc: String,
    value: Value,
}

impl KeyResult {
    pub fn new(
        key: Option<Key>,
        tag: u64,
        error_code: i32,
        error_desc: impl Into<String>,
        value: Value,
    ) -> Self {
        Self {
            key,
            tag,
            error_code,
            error_desc: error_desc.into(),
            value,
        }
    }

    /// A successful result carrying `value`.
    pub fn success(key: Key, tag: u64, value: Value) -> Self {
        Self::new(Some(key), tag, 0, String::new(), value)
    }

    /// A locally produced failure (timeouts, decode problems, …).
    pub fn from_error(key: Option<Key>, tag: u64, error: &BridgeError) -> Self {
        let code = match error {
            BridgeError::RemoteError { code, .. } => *code,
            _ => DECODE_ERROR_CODE,
        };
        Self::new(key, tag, code, error.to_string(), Value::Null)
    }

    /// Decode a result envelope. See the module docs for the format.
    pub fn from_json(data: &[u8]) -> Self {
        if data.is_empty() {
            return Self::new(None, 0, DECODE_ERROR_CODE, "empty or nil json data", Value::Null);
        }

        let envelope: Envelope = match serde_json::from_slice(data) {
            Ok(e) => e,
            Err(e) => {
                return Self::new(
                    None,
                    0,
                    DECODE_ERROR_CODE,
                    format!("error unmarshalling json data: {e}"),
                    Value::Null,
                );
            }
        };

        let key = match Key::from_sub_type(envelope.key) {
            Ok(k) => k,
            Err(e) => {
                return Self::new(
                    None,
                    envelope.tag,
                    DECODE_ERROR_CODE,
                    format!("error creating key from sub type {}: {e}", envelope.key),
                    Value::Null,
                );
            }
        };

        let decoded = unwrap_value(key.shape(), envelope.value)
            .and_then(|raw| Value::decode(key.shape(), raw));

        match (envelope.error, decoded) {
            (0, Ok(value)) => Self::success(key, envelope.tag, value),
            (0, Err(e)) => Self::new(Some(key), envelope.tag, DECODE_ERROR_CODE, e.to_string(), Value::Null),
            (code, decoded) => Self::new(
                Some(key),
                envelope.tag,
                code,
                format!("error {code}"),
                decoded.unwrap_or(Value::Null),
            ),
        }
    }

    /// Re-encode as an envelope, wrapping the value once.
    pub fn to_json(&self) -> String {
        let envelope = OutEnvelope {
            key: self.key.map(|k| k.sub_type()).unwrap_or_default(),
            tag: self.tag,
            error: self.error_code,
            value: json!({ "value": self.value.to_json() }),
        };
        serde_json::to_string(&envelope).unwrap_or_default()
    }

    pub fn key(&self) -> Option<Key> {
        self.key
    }

    pub fn tag(&self) -> u64 {
        self.tag
    }

    pub fn error_code(&self) -> i32 {
        self.error_code
    }

    pub fn error_desc(&self) -> &str {
        &self.error_desc
    }

    pub fn value(&self) -> &Value {
        &self.value
    }

    pub fn succeeded(&self) -> bool {
        self.error_code == 0
    }

    /// Convert into the carried value, turning a failure into
    /// [`BridgeError::RemoteError`].
    pub fn into_value(self) -> Result<Value, BridgeError> {
        if self.succeeded() {
            Ok(self.value)
        } else {
            Err(BridgeError::RemoteError {
                code: self.error_code,
                description: self.error_desc,
            })
        }
    }
}

impl fmt::Display for KeyResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let key = self
            .key
            .map(|k| k.to_string())
            .unwrap_or_else(|| "<none>".to_string());
        write!(
            f,
            "KeyResult{{key: {key}, tag: {}, error_code: {}, error_desc: {:?}, value: {}}}",
            self.tag, self.error_code, self.error_desc, self.value
        )
    }
}

/// Strip exactly one `{"value": …}` wrapper.
fn unwrap_value(
    shape: ValueShape,
    raw: serde_json::Value,
) -> Result<serde_json::Value, BridgeError> {
    match raw {
        serde_json::Value::Object(mut map) => match map.remove("value") {
            Some(inner) => Ok(inner),
            None if shape == ValueShape::Record => Ok(serde_json::Value::Object(map)),
            None => Err(BridgeError::Decode(format!(
                "value field not found: {}",
                serde_json::Value::Object(map)
            ))),
        },
        other => Ok(other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::key::keys;

    #[test]
    fn decodes_wrapped_success() {
        let r = KeyResult::from_json(br#"{"Key":5,"Tag":42,"Error":0,"Value":{"value":true}}"#);
        assert!(r.succeeded());
        assert_eq!(r.tag(), 42);
        assert_eq!(r.key(), Some(keys::PRODUCT_CONNECTION));
        assert_eq!(r.value().as_bool(), Some(true));
    }

    #[test]
    fn decodes_remote_failure() {
        let r = KeyResult::from_json(br#"{"Key":5,"Tag":42,"Error":7,"Value":null}"#);
        assert!(!r.succeeded());
        assert_eq!(r.error_code(), 7);
        assert!(!r.error_desc().is_empty());
        assert!(r.value().is_null());
    }

    #[test]
    fn unwraps_only_one_level() {
        let r = KeyResult::from_json(
            br#"{"Key":117440513,"Tag":1,"Error":0,"Value":{"value":{"value":true}}}"#,
        );
        assert!(!r.succeeded());
        assert_eq!(r.error_code(), DECODE_ERROR_CODE);
    }

    #[test]
    fn bare_values_are_accepted() {
        let r = KeyResult::from_json(br#"{"Key":16777220,"Tag":9,"Error":0,"Value":2}"#);
        assert!(r.succeeded());
        assert_eq!(r.key(), Some(keys::CAMERA_MODE));
        assert_eq!(r.value().as_u64(), Some(2));
    }

    #[test]
    fn unwrapped_records_are_accepted() {
        let r = KeyResult::from_json(
            br#"{"Key":67108867,"Tag":3,"Error":0,"Value":{"pitch":1.0,"yaw":2.0}}"#,
        );
        assert!(r.succeeded(), "{r}");
        assert!(matches!(r.value(), Value::Record(_)));
    }

    #[test]
    fn unknown_key_is_captured_not_raised() {
        let r = KeyResult::from_json(br#"{"Key":16777215,"Tag":77,"Error":0,"Value":1}"#);
        assert!(!r.succeeded());
        assert!(r.key().is_none());
        assert_eq!(r.tag(), 77);
        assert!(r.error_desc().contains("sub type"));
    }

    #[test]
    fn malformed_payloads() {
        assert!(!KeyResult::from_json(b"").succeeded());
        assert!(!KeyResult::from_json(b"{not json").succeeded());
        assert!(!KeyResult::from_json(br#"{"Key":5,"Tag":1,"Error":0,"Value":{"nope":1}}"#).succeeded());
    }

    #[test]
    fn to_json_wraps_value_once() {
        let r = KeyResult::success(keys::CAMERA_MODE, 11, Value::Uint(1));
        let back = KeyResult::from_json(r.to_json().as_bytes());
        assert_eq!(back, r);
        assert!(r.to_json().contains(r#""Value":{"value":1}"#));
    }

    #[test]
    fn into_value_maps_failures() {
        let r = KeyResult::new(Some(keys::CAMERA_MODE), 1, 3, "error 3", Value::Null);
        assert!(matches!(
            r.into_value(),
            Err(BridgeError::RemoteError { code: 3, .. })
        ));
    }
}

use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, SubsecRound, Utc};
use serde::{Deserialize, Serialize};

use crate::error::TypeError;

/// Attribute name to value mapping for one record.
///
/// Absent attributes are simply missing from the map; they are never stored
/// in the backend.
pub type Attributes = BTreeMap<String, Value>;

/// Semantic type of a record attribute.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttrType {
    String,
    Boolean,
    Integer,
    Timestamp,
    /// Opaque structured value, stored as serialized JSON.
    Json,
}

impl AttrType {
    /// Decode a backend string into a value of this type.
    pub fn decode(self, raw: &str) -> Result<Value, TypeError> {
        let fail = |reason: String| TypeError::Decode {
            expected: self,
            raw: raw.to_string(),
            reason,
        };
        match self {
            AttrType::String => Ok(Value::String(raw.to_string())),
            AttrType::Boolean => match raw.to_ascii_lowercase().as_str() {
                "true" => Ok(Value::Boolean(true)),
                "false" => Ok(Value::Boolean(false)),
                _ => Err(fail("expected \"true\" or \"false\"".into())),
            },
            AttrType::Integer => raw
                .parse::<i64>()
                .map(Value::Integer)
                .map_err(|e| fail(e.to_string())),
            AttrType::Timestamp => {
                let secs = raw.parse::<i64>().map_err(|e| fail(e.to_string()))?;
                DateTime::from_timestamp(secs, 0)
                    .map(Value::Timestamp)
                    .ok_or_else(|| fail("timestamp out of range".into()))
            }
            AttrType::Json => serde_json::from_str(raw)
                .map(Value::Json)
                .map_err(|e| fail(e.to_string())),
        }
    }

    /// Convert a submitted JSON value into a value of this type.
    ///
    /// Timestamps accept Unix seconds or an RFC 3339 string.
    pub fn from_json(self, json: &serde_json::Value) -> Result<Value, TypeError> {
        use serde_json::Value as J;

        let value = match (self, json) {
            (AttrType::Json, j) => Some(Value::Json(j.clone())),
            (AttrType::String, J::String(s)) => Some(Value::String(s.clone())),
            (AttrType::Boolean, J::Bool(b)) => Some(Value::Boolean(*b)),
            (AttrType::Integer, J::Number(n)) => n.as_i64().map(Value::Integer),
            (AttrType::Timestamp, J::Number(n)) => n
                .as_i64()
                .and_then(|secs| DateTime::from_timestamp(secs, 0))
                .map(Value::Timestamp),
            (AttrType::Timestamp, J::String(s)) => DateTime::parse_from_rfc3339(s)
                .ok()
                .map(|t| Value::timestamp(t.with_timezone(&Utc))),
            _ => None,
        };
        value.ok_or_else(|| TypeError::Decode {
            expected: self,
            raw: json.to_string(),
            reason: "incompatible JSON value".into(),
        })
    }
}

impl fmt::Display for AttrType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            AttrType::String => "string",
            AttrType::Boolean => "boolean",
            AttrType::Integer => "integer",
            AttrType::Timestamp => "timestamp",
            AttrType::Json => "json",
        };
        f.write_str(name)
    }
}

/// A typed attribute value.
///
/// Timestamps are stored at whole-second precision. Build them with
/// [`Value::timestamp`] or `From<DateTime<Utc>>`, which drop the sub-second
/// part, so a value compares equal to what the backend gives back.
#[derive(Clone, Debug, PartialEq)]
pub enum Value {
    String(String),
    Boolean(bool),
    Integer(i64),
    Timestamp(DateTime<Utc>),
    Json(serde_json::Value),
}

impl Value {
    /// A timestamp truncated to whole seconds.
    pub fn timestamp(t: DateTime<Utc>) -> Value {
        Value::Timestamp(t.trunc_subsecs(0))
    }

    /// This value at stored precision. Only timestamps change.
    pub fn canonical(self) -> Value {
        match self {
            Value::Timestamp(t) => Value::timestamp(t),
            other => other,
        }
    }

    /// The semantic type of this value.
    pub fn attr_type(&self) -> AttrType {
        match self {
            Value::String(_) => AttrType::String,
            Value::Boolean(_) => AttrType::Boolean,
            Value::Integer(_) => AttrType::Integer,
            Value::Timestamp(_) => AttrType::Timestamp,
            Value::Json(_) => AttrType::Json,
        }
    }

    /// Canonical backend encoding.
    ///
    /// Booleans become `"true"`/`"false"`, integers and timestamps decimal
    /// text (timestamps as Unix seconds), JSON values their serialized form.
    pub fn encode(&self) -> String {
        match self {
            Value::String(s) => s.clone(),
            Value::Boolean(b) => b.to_string(),
            Value::Integer(i) => i.to_string(),
            Value::Timestamp(t) => t.timestamp().to_string(),
            Value::Json(j) => j.to_string(),
        }
    }

    /// Returns `true` for values that fail a presence check: blank strings,
    /// and JSON null, empty strings, arrays, or objects.
    pub fn is_blank(&self) -> bool {
        match self {
            Value::String(s) => s.trim().is_empty(),
            Value::Json(serde_json::Value::Null) => true,
            Value::Json(serde_json::Value::String(s)) => s.trim().is_empty(),
            Value::Json(serde_json::Value::Array(a)) => a.is_empty(),
            Value::Json(serde_json::Value::Object(o)) => o.is_empty(),
            _ => false,
        }
    }

    /// Check this value against an expected type.
    pub fn expect_type(&self, expected: AttrType) -> Result<(), TypeError> {
        let actual = self.attr_type();
        if actual == expected {
            Ok(())
        } else {
            Err(TypeError::Mismatch { expected, actual })
        }
    }

    /// Ordering used by sorted queries.
    ///
    /// Values of the same type compare naturally; JSON values compare by
    /// their encoded form. Values of different types order by type.
    pub fn sort_cmp(&self, other: &Value) -> Ordering {
        match (self, other) {
            (Value::String(a), Value::String(b)) => a.cmp(b),
            (Value::Boolean(a), Value::Boolean(b)) => a.cmp(b),
            (Value::Integer(a), Value::Integer(b)) => a.cmp(b),
            (Value::Timestamp(a), Value::Timestamp(b)) => a.cmp(b),
            (Value::Json(a), Value::Json(b)) => a.to_string().cmp(&b.to_string()),
            (a, b) => type_rank(a.attr_type()).cmp(&type_rank(b.attr_type())),
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Boolean(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Integer(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_timestamp(&self) -> Option<DateTime<Utc>> {
        match self {
            Value::Timestamp(t) => Some(*t),
            _ => None,
        }
    }

    pub fn as_json(&self) -> Option<&serde_json::Value> {
        match self {
            Value::Json(j) => Some(j),
            _ => None,
        }
    }

    /// Render as a plain JSON value (used by presenters).
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Value::String(s) => serde_json::Value::String(s.clone()),
            Value::Boolean(b) => serde_json::Value::Bool(*b),
            Value::Integer(i) => serde_json::Value::from(*i),
            Value::Timestamp(t) => serde_json::Value::String(t.to_rfc3339()),
            Value::Json(j) => j.clone(),
        }
    }
}

fn type_rank(t: AttrType) -> u8 {
    match t {
        AttrType::Boolean => 0,
        AttrType::Integer => 1,
        AttrType::Timestamp => 2,
        AttrType::String => 3,
        AttrType::Json => 4,
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.encode())
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::String(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::String(s)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Boolean(b)
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Value::Integer(i)
    }
}

impl From<DateTime<Utc>> for Value {
    fn from(t: DateTime<Utc>) -> Self {
        Value::timestamp(t)
    }
}

impl From<serde_json::Value> for Value {
    fn from(j: serde_json::Value) -> Self {
        Value::Json(j)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn booleans_encode_as_words() {
        assert_eq!(Value::Boolean(true).encode(), "true");
        assert_eq!(Value::Boolean(false).encode(), "false");
        assert_eq!(AttrType::Boolean.decode("TRUE").unwrap(), Value::Boolean(true));
    }

    #[test]
    fn boolean_decode_rejects_other_text() {
        let err = AttrType::Boolean.decode("yes").unwrap_err();
        assert!(matches!(err, TypeError::Decode { expected: AttrType::Boolean, .. }));
    }

    #[test]
    fn timestamps_encode_as_unix_seconds() {
        let t = DateTime::from_timestamp(1_400_000_000, 0).unwrap();
        let v = Value::Timestamp(t);
        assert_eq!(v.encode(), "1400000000");
        assert_eq!(AttrType::Timestamp.decode("1400000000").unwrap(), v);
    }

    #[test]
    fn timestamps_drop_sub_second_precision() {
        let precise = DateTime::from_timestamp(1_700_000_000, 500_000_000).unwrap();
        let whole = DateTime::from_timestamp(1_700_000_000, 0).unwrap();

        assert_eq!(Value::from(precise), Value::Timestamp(whole));
        assert_eq!(Value::Timestamp(precise).canonical(), Value::Timestamp(whole));
        assert_eq!(Value::from("x").canonical(), Value::from("x"));

        let stored = AttrType::Timestamp.decode(&Value::from(precise).encode()).unwrap();
        assert_eq!(stored, Value::from(precise));
        assert_eq!(
            AttrType::Timestamp.from_json(&json!("2023-11-14T22:13:20.500Z")).unwrap(),
            Value::Timestamp(whole)
        );
    }

    #[test]
    fn integer_decode_error_names_type() {
        let err = AttrType::Integer.decode("12a").unwrap_err();
        assert!(err.to_string().contains("integer"));
    }

    #[test]
    fn json_values_are_self_describing() {
        let v = Value::Json(json!(["web-01", "db-02"]));
        let encoded = v.encode();
        assert_eq!(encoded, r#"["web-01","db-02"]"#);
        assert_eq!(AttrType::Json.decode(&encoded).unwrap(), v);
        assert!(AttrType::Json.decode("[unterminated").is_err());
    }

    #[test]
    fn from_json_follows_attribute_type() {
        assert_eq!(
            AttrType::Timestamp.from_json(&json!("2014-05-13T10:00:00Z")).unwrap(),
            AttrType::Timestamp.decode("1399975200").unwrap()
        );
        assert_eq!(AttrType::Boolean.from_json(&json!(true)).unwrap(), Value::Boolean(true));
        assert!(AttrType::Boolean.from_json(&json!("true")).is_err());
        assert!(AttrType::Integer.from_json(&json!(1.5)).is_err());
    }

    #[test]
    fn blank_values() {
        assert!(Value::from("  ").is_blank());
        assert!(Value::Json(json!([])).is_blank());
        assert!(Value::Json(json!(null)).is_blank());
        assert!(!Value::from("x").is_blank());
        assert!(!Value::Boolean(false).is_blank());
        assert!(!Value::Json(json!({"a": 1})).is_blank());
    }

    #[test]
    fn expect_type_reports_mismatch() {
        let err = Value::from("x").expect_type(AttrType::Boolean).unwrap_err();
        assert_eq!(
            err,
            TypeError::Mismatch {
                expected: AttrType::Boolean,
                actual: AttrType::String
            }
        );
    }

    #[test]
    fn sort_cmp_is_typed() {
        // Integers compare numerically, not lexically.
        assert_eq!(Value::Integer(9).sort_cmp(&Value::Integer(10)), Ordering::Less);
        assert_eq!(Value::from("b").sort_cmp(&Value::from("a")), Ordering::Greater);
        assert_eq!(
            Value::Boolean(false).sort_cmp(&Value::Boolean(true)),
            Ordering::Less
        );
    }
}

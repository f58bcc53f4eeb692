//! Stored value model
//!
//! Every field of a node holds exactly one [`Value`]: a primitive or a link to
//! another node. Nested objects never exist at rest; the flattener in
//! [`crate::graph`] splits them into linked nodes before storage. Arrays and
//! non-finite numbers are rejected as malformed, matching the validation rules of
//! the wire ecosystem.

use crate::error::{MeshError, MeshResult};
use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::cmp::Ordering;
use std::fmt;

/// The wire key identifying a link object: `{"#": soul}`.
pub const LINK_KEY: &str = "#";

/// A single stored value.
#[derive(Clone, Debug, PartialEq)]
pub enum Value {
    Null,
    Bool(bool),
    Number(f64),
    String(String),
    /// Reference to another node by soul. The target need not exist yet.
    Link(String),
}

impl Value {
    pub fn link(soul: impl Into<String>) -> Value {
        Value::Link(soul.into())
    }

    pub fn is_link(&self) -> bool {
        matches!(self, Value::Link(_))
    }

    pub fn as_link(&self) -> Option<&str> {
        match self {
            Value::Link(soul) => Some(soul),
            _ => None,
        }
    }

    /// Convert from JSON. Rejects arrays, non-link objects and non-finite numbers.
    pub fn from_json(v: &serde_json::Value) -> MeshResult<Value> {
        match v {
            serde_json::Value::Null => Ok(Value::Null),
            serde_json::Value::Bool(b) => Ok(Value::Bool(*b)),
            serde_json::Value::Number(n) => {
                let f = n
                    .as_f64()
                    .ok_or_else(|| MeshError::Malformed(format!("unrepresentable number {n}")))?;
                if f.is_finite() {
                    Ok(Value::Number(f))
                } else {
                    Err(MeshError::Malformed(format!("non-finite number {f}")))
                }
            }
            serde_json::Value::String(s) => Ok(Value::String(s.clone())),
            serde_json::Value::Object(obj) => match link_target(obj) {
                Some(soul) => Ok(Value::Link(soul.to_string())),
                None => Err(MeshError::Malformed(
                    "nested objects cannot be stored as values".to_string(),
                )),
            },
            serde_json::Value::Array(_) => Err(MeshError::Malformed(
                "arrays are not supported as values".to_string(),
            )),
        }
    }

    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Value::Null => serde_json::Value::Null,
            Value::Bool(b) => serde_json::Value::Bool(*b),
            Value::Number(f) => number_to_json(*f),
            Value::String(s) => serde_json::Value::String(s.clone()),
            Value::Link(soul) => serde_json::json!({ LINK_KEY: soul }),
        }
    }

    /// Rank used by the deterministic merge tie-break. The full ordering is
    /// Null < Bool < Number < String < List < Map < Other; only five of those
    /// occur at rest, with links ranked as maps.
    pub(crate) fn type_rank(&self) -> u8 {
        match self {
            Value::Null => 0,
            Value::Bool(_) => 1,
            Value::Number(_) => 2,
            Value::String(_) => 3,
            Value::Link(_) => 5,
        }
    }

    /// Total deterministic ordering: type rank first, then natural order for
    /// same-typed primitives, then the string form.
    pub fn ham_cmp(&self, other: &Value) -> Ordering {
        match self.type_rank().cmp(&other.type_rank()) {
            Ordering::Equal => {}
            ord => return ord,
        }
        match (self, other) {
            (Value::Null, Value::Null) => Ordering::Equal,
            (Value::Bool(a), Value::Bool(b)) => a.cmp(b),
            (Value::Number(a), Value::Number(b)) => {
                a.partial_cmp(b).unwrap_or(Ordering::Equal)
            }
            (Value::String(a), Value::String(b)) => a.cmp(b),
            (Value::Link(a), Value::Link(b)) => a.cmp(b),
            _ => self.to_string().cmp(&other.to_string()),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => f.write_str("null"),
            Value::Bool(b) => write!(f, "{b}"),
            Value::Number(n) => write!(f, "{n}"),
            Value::String(s) => f.write_str(s),
            Value::Link(soul) => write!(f, "{{#:{soul}}}"),
        }
    }
}

impl Serialize for Value {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.to_json().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Value {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Value, D::Error> {
        let raw = serde_json::Value::deserialize(deserializer)?;
        Value::from_json(&raw).map_err(|e| D::Error::custom(e.to_string()))
    }
}

/// Detect a link object: a map with exactly one key `"#"` holding a string.
pub fn link_target(obj: &serde_json::Map<String, serde_json::Value>) -> Option<&str> {
    if obj.len() == 1 {
        obj.get(LINK_KEY).and_then(|v| v.as_str())
    } else {
        None
    }
}

/// Whether a JSON value is valid as a stored field value (primitive or link).
pub fn is_valid_data(v: &serde_json::Value) -> bool {
    Value::from_json(v).is_ok()
}

/// Serialize whole-ms numbers as exact integers; timestamps in particular must
/// stay integral within 2^53 on the wire.
fn number_to_json(f: f64) -> serde_json::Value {
    if f.fract() == 0.0 && f.abs() < 9.0e15 {
        serde_json::Value::Number((f as i64).into())
    } else {
        serde_json::Number::from_f64(f)
            .map(serde_json::Value::Number)
            .unwrap_or(serde_json::Value::Null)
    }
}

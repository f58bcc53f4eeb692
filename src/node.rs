//! Node and metadata model
//!
//! A node is a flat mapping of field to [`Value`] plus metadata: the soul it is
//! addressed by, one HAM timestamp per present field, and the machine identity of
//! the replica that produced the latest write. On the wire the metadata travels
//! under the `_` key:
//!
//! ```json
//! { "_": { "#": "users/alice", ">": { "name": 1700000000000 }, ":": 4, "&": "aB3dE9xK" },
//!   "name": "Alice" }
//! ```

use crate::error::{MeshError, MeshResult};
use crate::types::Value;
use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::BTreeMap;

/// Wire key carrying node metadata.
pub const META_KEY: &str = "_";
/// Metadata key for the soul.
pub const SOUL_KEY: &str = "#";
/// Metadata key for the per-field state map.
pub const STATE_KEY: &str = ">";
/// Metadata key for the machine state counter.
pub const MACHINE_STATE_KEY: &str = ":";
/// Metadata key for the machine id.
pub const MACHINE_ID_KEY: &str = "&";

/// Node metadata: soul, per-field HAM timestamps, producing machine.
#[derive(Clone, Debug, PartialEq)]
pub struct Meta {
    pub soul: String,
    pub state: BTreeMap<String, u64>,
    pub machine_state: u64,
    pub machine_id: String,
}

impl Meta {
    pub fn new(soul: impl Into<String>) -> Self {
        Self {
            soul: soul.into(),
            state: BTreeMap::new(),
            machine_state: 0,
            machine_id: String::new(),
        }
    }

    /// HAM timestamp for a field; absent fields read as 0.
    pub fn state_of(&self, field: &str) -> u64 {
        self.state.get(field).copied().unwrap_or(0)
    }

    /// Newest timestamp across all fields, 0 for an empty node.
    pub fn newest_state(&self) -> u64 {
        self.state.values().copied().max().unwrap_or(0)
    }

    pub fn to_json(&self) -> serde_json::Value {
        let states: serde_json::Map<String, serde_json::Value> = self
            .state
            .iter()
            .map(|(k, v)| (k.clone(), serde_json::Value::from(*v)))
            .collect();
        serde_json::json!({
            SOUL_KEY: self.soul,
            STATE_KEY: states,
            MACHINE_STATE_KEY: self.machine_state,
            MACHINE_ID_KEY: self.machine_id,
        })
    }

    pub fn from_json(v: &serde_json::Value) -> MeshResult<Meta> {
        let obj = v
            .as_object()
            .ok_or_else(|| MeshError::Malformed("metadata must be an object".to_string()))?;
        let soul = obj
            .get(SOUL_KEY)
            .and_then(|s| s.as_str())
            .ok_or_else(|| MeshError::Malformed("metadata missing soul".to_string()))?;
        if soul.is_empty() {
            return Err(MeshError::Malformed("empty soul".to_string()));
        }
        let mut state = BTreeMap::new();
        if let Some(states) = obj.get(STATE_KEY) {
            let states = states.as_object().ok_or_else(|| {
                MeshError::Malformed("state map must be an object".to_string())
            })?;
            for (field, ts) in states {
                let ts = ts.as_u64().ok_or_else(|| {
                    MeshError::Malformed(format!("non-integer timestamp for field {field}"))
                })?;
                state.insert(field.clone(), ts);
            }
        }
        let machine_state = obj
            .get(MACHINE_STATE_KEY)
            .and_then(|v| v.as_u64())
            .unwrap_or(0);
        let machine_id = obj
            .get(MACHINE_ID_KEY)
            .and_then(|v| v.as_str())
            .unwrap_or("")
            .to_string();
        Ok(Meta {
            soul: soul.to_string(),
            state,
            machine_state,
            machine_id,
        })
    }
}

/// A stored node: flat fields plus metadata.
#[derive(Clone, Debug, PartialEq)]
pub struct Node {
    pub fields: BTreeMap<String, Value>,
    pub meta: Meta,
}

impl Node {
    pub fn new(soul: impl Into<String>) -> Self {
        Self {
            fields: BTreeMap::new(),
            meta: Meta::new(soul),
        }
    }

    pub fn soul(&self) -> &str {
        &self.meta.soul
    }

    pub fn get(&self, field: &str) -> Option<&Value> {
        self.fields.get(field)
    }

    /// Set a field and its timestamp together, keeping the state map aligned.
    pub fn insert(&mut self, field: impl Into<String>, value: Value, ts: u64) {
        let field = field.into();
        if field == META_KEY {
            return;
        }
        self.meta.state.insert(field.clone(), ts);
        self.fields.insert(field, value);
    }

    /// The link target stored at a field, if any.
    pub fn link_of(&self, field: &str) -> Option<&str> {
        self.fields.get(field).and_then(|v| v.as_link())
    }

    /// Whether the node carries any user fields (a node holding only metadata
    /// exists but reads as empty).
    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Wire form: `{ "_": meta, field: value, ... }`.
    pub fn to_wire(&self) -> serde_json::Value {
        let mut obj = serde_json::Map::new();
        obj.insert(META_KEY.to_string(), self.meta.to_json());
        for (field, value) in &self.fields {
            obj.insert(field.clone(), value.to_json());
        }
        serde_json::Value::Object(obj)
    }

    /// Parse a node from its wire form. `soul_hint` is the key the payload was
    /// filed under; it must agree with the metadata soul when both are present.
    pub fn from_wire(soul_hint: &str, v: &serde_json::Value) -> MeshResult<Node> {
        let obj = v
            .as_object()
            .ok_or_else(|| MeshError::Malformed("node payload must be an object".to_string()))?;
        let meta = match obj.get(META_KEY) {
            Some(m) => Meta::from_json(m)?,
            None => Meta::new(soul_hint),
        };
        if !soul_hint.is_empty() && meta.soul != soul_hint {
            return Err(MeshError::Malformed(format!(
                "soul mismatch: payload under {soul_hint} carries metadata for {}",
                meta.soul
            )));
        }
        let mut node = Node {
            fields: BTreeMap::new(),
            meta,
        };
        for (field, value) in obj {
            if field == META_KEY {
                continue;
            }
            let value = Value::from_json(value)?;
            node.fields.insert(field.clone(), value);
        }
        Ok(node)
    }

    /// Structural validation for committed nodes: non-empty soul, and exactly one
    /// state entry per present field.
    pub fn validate(&self) -> MeshResult<()> {
        if self.meta.soul.is_empty() {
            return Err(MeshError::Malformed("node without a soul".to_string()));
        }
        for field in self.fields.keys() {
            if !self.meta.state.contains_key(field) {
                return Err(MeshError::Malformed(format!(
                    "field {field} on {} has no state entry",
                    self.meta.soul
                )));
            }
        }
        for field in self.meta.state.keys() {
            if !self.fields.contains_key(field) {
                return Err(MeshError::Malformed(format!(
                    "state entry {field} on {} has no field",
                    self.meta.soul
                )));
            }
        }
        Ok(())
    }
}

impl Serialize for Node {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.to_wire().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Node {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Node, D::Error> {
        let raw = serde_json::Value::deserialize(deserializer)?;
        Node::from_wire("", &raw).map_err(|e| D::Error::custom(e.to_string()))
    }
}

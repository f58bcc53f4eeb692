//! Wire codec
//!
//! Frames are flat JSON maps. Exactly one of the keys `hi`, `bye`, `get`, `put`,
//! `dam` identifies the kind; a frame with none of them decodes as `Unknown` and
//! is preserved verbatim so newer peers can speak past us. Correlation uses two
//! common fields: `@` is the frame's own fresh id, `#` names the earlier frame
//! this one acknowledges.
//!
//! Decoding never has side effects; a malformed frame is rejected before any
//! state is touched.

use crate::error::{DamError, ErrorKind, MeshError, MeshResult};
use crate::node::Node;
use crate::state::random_token;
use serde_json::Value as Json;
use std::collections::BTreeMap;

/// Frame key: fresh message id.
pub const ID_KEY: &str = "@";
/// Frame key: id of the frame being acknowledged.
pub const ACK_KEY: &str = "#";

/// Length of generated message ids.
pub const MSG_ID_LEN: usize = 12;

const KIND_KEYS: [&str; 5] = ["hi", "bye", "get", "put", "dam"];

/// A path query: the root soul, then one nested shape per traversal segment.
///
/// `{"#": "users"}` asks for one node; `{"#": "users", ".": {"#": "alice"}}`
/// walks `users` then follows its `alice` link.
#[derive(Clone, Debug, PartialEq)]
pub struct Query {
    pub soul: String,
    pub next: Option<Box<Query>>,
}

impl Query {
    pub fn soul(soul: impl Into<String>) -> Query {
        Query {
            soul: soul.into(),
            next: None,
        }
    }

    pub fn path(root: impl Into<String>, segments: &[String]) -> Query {
        let mut q = None;
        for seg in segments.iter().rev() {
            q = Some(Box::new(Query {
                soul: seg.clone(),
                next: q,
            }));
        }
        Query {
            soul: root.into(),
            next: q,
        }
    }

    /// Flatten back into `(root, segments)`.
    pub fn segments(&self) -> (String, Vec<String>) {
        let mut segs = Vec::new();
        let mut cursor = &self.next;
        while let Some(q) = cursor {
            segs.push(q.soul.clone());
            cursor = &q.next;
        }
        (self.soul.clone(), segs)
    }

    pub fn to_json(&self) -> Json {
        let mut obj = serde_json::Map::new();
        obj.insert(ACK_KEY.to_string(), Json::String(self.soul.clone()));
        if let Some(next) = &self.next {
            obj.insert(".".to_string(), next.to_json());
        }
        Json::Object(obj)
    }

    pub fn from_json(v: &Json) -> MeshResult<Query> {
        let obj = v
            .as_object()
            .ok_or_else(|| MeshError::Malformed("query must be an object".to_string()))?;
        let soul = obj
            .get(ACK_KEY)
            .and_then(|s| s.as_str())
            .ok_or_else(|| MeshError::Malformed("query missing soul".to_string()))?;
        let next = match obj.get(".") {
            Some(nested) => Some(Box::new(Query::from_json(nested)?)),
            None => None,
        };
        Ok(Query {
            soul: soul.to_string(),
            next,
        })
    }
}

/// Frame payload, one variant per wire kind.
#[derive(Clone, Debug, PartialEq)]
pub enum Body {
    Hi { version: String, peer_id: String },
    Bye { peer_id: String },
    Get { query: Query },
    Put { souls: BTreeMap<String, Node> },
    Dam { error: DamError },
    /// Frame from a newer protocol; carried but not interpreted.
    Unknown,
}

/// One wire frame: id, optional ack, payload, and any unrecognized top-level
/// keys (preserved for forward compatibility).
#[derive(Clone, Debug, PartialEq)]
pub struct Frame {
    pub id: String,
    pub ack: Option<String>,
    pub body: Body,
    pub extra: serde_json::Map<String, Json>,
}

impl Frame {
    /// New frame with a fresh random id.
    pub fn new(body: Body) -> Frame {
        Frame {
            id: random_token(MSG_ID_LEN),
            ack: None,
            body,
            extra: serde_json::Map::new(),
        }
    }

    pub fn with_id(body: Body, id: impl Into<String>) -> Frame {
        Frame {
            id: id.into(),
            ack: None,
            body,
            extra: serde_json::Map::new(),
        }
    }

    pub fn acking(mut self, ack: impl Into<String>) -> Frame {
        self.ack = Some(ack.into());
        self
    }

    pub fn kind(&self) -> &'static str {
        match self.body {
            Body::Hi { .. } => "hi",
            Body::Bye { .. } => "bye",
            Body::Get { .. } => "get",
            Body::Put { .. } => "put",
            Body::Dam { .. } => "dam",
            Body::Unknown => "unknown",
        }
    }

    pub fn is_ack(&self) -> bool {
        self.ack.is_some()
    }

    pub fn encode(&self) -> Json {
        let mut obj = serde_json::Map::new();
        match &self.body {
            Body::Hi { version, peer_id } => {
                obj.insert(
                    "hi".to_string(),
                    serde_json::json!({ "version": version, "peer_id": peer_id }),
                );
            }
            Body::Bye { peer_id } => {
                obj.insert("bye".to_string(), serde_json::json!({ "peer_id": peer_id }));
            }
            Body::Get { query } => {
                obj.insert("get".to_string(), query.to_json());
            }
            Body::Put { souls } => {
                let payload: serde_json::Map<String, Json> = souls
                    .iter()
                    .map(|(soul, node)| (soul.clone(), node.to_wire()))
                    .collect();
                obj.insert("put".to_string(), Json::Object(payload));
            }
            Body::Dam { error } => {
                obj.insert("dam".to_string(), Json::String(error.message.clone()));
                obj.insert("kind".to_string(), Json::String(error.kind.as_str().to_string()));
                if let Some(code) = &error.code {
                    obj.insert("code".to_string(), Json::String(code.clone()));
                }
                if let Some(soul) = &error.soul {
                    obj.insert("node".to_string(), Json::String(soul.clone()));
                }
                if let Some(field) = &error.field {
                    obj.insert("field".to_string(), Json::String(field.clone()));
                }
            }
            Body::Unknown => {}
        }
        for (k, v) in &self.extra {
            obj.entry(k.clone()).or_insert_with(|| v.clone());
        }
        obj.insert(ID_KEY.to_string(), Json::String(self.id.clone()));
        if let Some(ack) = &self.ack {
            obj.insert(ACK_KEY.to_string(), Json::String(ack.clone()));
        }
        Json::Object(obj)
    }

    pub fn decode(v: &Json) -> MeshResult<Frame> {
        let obj = v
            .as_object()
            .ok_or_else(|| MeshError::Malformed("frame must be an object".to_string()))?;

        let id = obj
            .get(ID_KEY)
            .and_then(|s| s.as_str())
            .ok_or_else(|| MeshError::Malformed("frame missing @ id".to_string()))?
            .to_string();
        let ack = obj.get(ACK_KEY).and_then(|s| s.as_str()).map(String::from);

        let mut consumed: Vec<&str> = vec![ID_KEY, ACK_KEY];
        let body = if let Some(hi) = obj.get("hi") {
            consumed.push("hi");
            let hi = hi
                .as_object()
                .ok_or_else(|| MeshError::Malformed("hi payload must be an object".to_string()))?;
            Body::Hi {
                version: hi
                    .get("version")
                    .and_then(|s| s.as_str())
                    .ok_or_else(|| MeshError::Malformed("hi missing version".to_string()))?
                    .to_string(),
                peer_id: hi
                    .get("peer_id")
                    .and_then(|s| s.as_str())
                    .ok_or_else(|| MeshError::Malformed("hi missing peer_id".to_string()))?
                    .to_string(),
            }
        } else if let Some(bye) = obj.get("bye") {
            consumed.push("bye");
            let bye = bye
                .as_object()
                .ok_or_else(|| MeshError::Malformed("bye payload must be an object".to_string()))?;
            Body::Bye {
                peer_id: bye
                    .get("peer_id")
                    .and_then(|s| s.as_str())
                    .ok_or_else(|| MeshError::Malformed("bye missing peer_id".to_string()))?
                    .to_string(),
            }
        } else if let Some(get) = obj.get("get") {
            consumed.push("get");
            Body::Get {
                query: Query::from_json(get)?,
            }
        } else if let Some(put) = obj.get("put") {
            consumed.push("put");
            let put = put
                .as_object()
                .ok_or_else(|| MeshError::Malformed("put payload must be an object".to_string()))?;
            let mut souls = BTreeMap::new();
            for (soul, payload) in put {
                souls.insert(soul.clone(), Node::from_wire(soul, payload)?);
            }
            Body::Put { souls }
        } else if let Some(dam) = obj.get("dam") {
            consumed.extend_from_slice(&["dam", "kind", "code", "node", "field"]);
            let message = dam
                .as_str()
                .ok_or_else(|| MeshError::Malformed("dam payload must be a string".to_string()))?
                .to_string();
            let kind = obj
                .get("kind")
                .and_then(|s| s.as_str())
                .and_then(ErrorKind::parse)
                .unwrap_or_else(|| ErrorKind::classify(&message));
            let mut error = DamError::new(kind, message).with_error_id(id.clone());
            if let Some(code) = obj.get("code").and_then(|s| s.as_str()) {
                error = error.with_code(code);
            }
            if let Some(soul) = obj.get("node").and_then(|s| s.as_str()) {
                error = error.with_soul(soul);
            }
            if let Some(field) = obj.get("field").and_then(|s| s.as_str()) {
                error = error.with_field(field);
            }
            if let Some(ack) = &ack {
                error = error.with_context("ackId", Json::String(ack.clone()));
            }
            Body::Dam { error }
        } else {
            Body::Unknown
        };

        let extra: serde_json::Map<String, Json> = obj
            .iter()
            .filter(|(k, _)| !consumed.contains(&k.as_str()))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();

        Ok(Frame {
            id,
            ack,
            body,
            extra,
        })
    }

    pub fn encode_string(&self) -> String {
        self.encode().to_string()
    }

    pub fn decode_string(raw: &str) -> MeshResult<Frame> {
        let v: Json = serde_json::from_str(raw)?;
        Frame::decode(&v)
    }
}

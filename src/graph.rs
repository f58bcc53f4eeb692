//! Graph structure: flattening nested writes, resolving linked reads
//!
//! Nothing nested is ever stored. A caller writing
//! `{"messages": {"latest": {"text": "hi"}}}` under `chat/r1` produces three flat
//! nodes chained by links:
//!
//! ```text
//! chat/r1                  {messages: Link("chat/r1/messages")}
//! chat/r1/messages         {latest: Link("chat/r1/messages/latest")}
//! chat/r1/messages/latest  {text: "hi"}
//! ```
//!
//! Reads do the reverse: links are followed up to a depth cap, with a visited
//! set so cycles terminate. Both bounds are needed; a visited set alone does not
//! bound cost on dense cyclic graphs.

use crate::error::{MeshError, MeshResult};
use crate::node::{Node, META_KEY};
use crate::state::random_token;
use crate::store::NodeStore;
use crate::types::{link_target, Value};
use futures::future::BoxFuture;
use futures::FutureExt;
use serde_json::Value as Json;
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

/// Default link-following depth on reads.
pub const DEFAULT_RESOLVE_DEPTH: usize = 5;

/// Length of the random token naming a set member.
pub const SET_TOKEN_LEN: usize = 12;

/// Soul of the node a field links into: `parent/field`.
pub fn child_soul(parent: &str, field: &str) -> String {
    format!("{parent}/{field}")
}

/// What a path traversal landed on.
#[derive(Clone, Debug)]
pub enum Target {
    /// The path ends on a whole node.
    Node(Node),
    /// The path ends on a primitive field value.
    Value(Value),
}

/// Result of walking a path: the target (if any) plus every node loaded on the
/// way, so query answers can ship the whole chain.
#[derive(Clone, Debug, Default)]
pub struct Traversal {
    pub target: Option<Target>,
    pub touched: Vec<Node>,
}

/// Flatten a nested JSON mapping into per-soul partial writes, parent first.
///
/// Leaf primitives stay on their node; each non-leaf subtree becomes a link to a
/// child node named `parent/field`. Arrays and non-mapping roots are malformed.
pub fn flatten(
    root_soul: &str,
    value: &Json,
) -> MeshResult<Vec<(String, BTreeMap<String, Value>)>> {
    let obj = match value {
        Json::Object(obj) if link_target(obj).is_none() => obj,
        _ => {
            return Err(MeshError::Validation(
                "top-level writes must be mappings".to_string(),
            ))
        }
    };
    let mut writes = Vec::new();
    flatten_into(root_soul, obj, &mut writes)?;
    Ok(writes)
}

fn flatten_into(
    soul: &str,
    obj: &serde_json::Map<String, Json>,
    writes: &mut Vec<(String, BTreeMap<String, Value>)>,
) -> MeshResult<()> {
    let mut partial = BTreeMap::new();
    let mut children: Vec<(String, &serde_json::Map<String, Json>)> = Vec::new();
    for (field, value) in obj {
        if field == META_KEY {
            continue;
        }
        match value {
            Json::Object(child) if link_target(child).is_none() => {
                let child_id = child_soul(soul, field);
                partial.insert(field.clone(), Value::link(&child_id));
                children.push((child_id, child));
            }
            other => {
                partial.insert(field.clone(), Value::from_json(other)?);
            }
        }
    }
    writes.push((soul.to_string(), partial));
    for (child_id, child) in children {
        flatten_into(&child_id, child, writes)?;
    }
    Ok(())
}

/// Read/write surface over the store that understands links.
pub struct Graph {
    store: Arc<NodeStore>,
}

impl Graph {
    pub fn new(store: Arc<NodeStore>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &Arc<NodeStore> {
        &self.store
    }

    /// Flatten a nested mapping and commit every produced node. Returns the
    /// committed nodes, root first.
    pub async fn put_nested(&self, root_soul: &str, value: &Json) -> MeshResult<Vec<Node>> {
        let writes = flatten(root_soul, value)?;
        let mut committed = Vec::with_capacity(writes.len());
        for (soul, partial) in writes {
            committed.push(self.store.put(&soul, partial).await?);
        }
        Ok(committed)
    }

    /// Write a single field on a node.
    pub async fn put_field(&self, soul: &str, field: &str, value: Value) -> MeshResult<Node> {
        let mut partial = BTreeMap::new();
        partial.insert(field.to_string(), value);
        self.store.put(soul, partial).await
    }

    /// Grow-only set insert: writes `value` under a fresh random child and links
    /// it from `parent_soul`. Returns the soul (for mappings) or field token
    /// (for primitives) the value landed on.
    pub async fn set_item(&self, parent_soul: &str, value: &Json) -> MeshResult<String> {
        let token = random_token(SET_TOKEN_LEN);
        match value {
            Json::Object(obj) if link_target(obj).is_none() => {
                let child_id = child_soul(parent_soul, &token);
                self.put_nested(&child_id, value).await?;
                self.put_field(parent_soul, &token, Value::link(&child_id))
                    .await?;
                Ok(child_id)
            }
            other => {
                self.put_field(parent_soul, &token, Value::from_json(other)?)
                    .await?;
                Ok(token)
            }
        }
    }

    /// Resolve a node into a nested JSON mapping, following links.
    ///
    /// A link that cannot be followed (depth exhausted, already visited, target
    /// absent or unloadable) is substituted verbatim as `{"#": soul}`; partial
    /// reads are acceptable.
    pub async fn resolve(&self, soul: &str, max_depth: usize) -> MeshResult<Option<Json>> {
        let mut visited = HashSet::new();
        self.resolve_inner(soul.to_string(), max_depth, &mut visited)
            .await
    }

    fn resolve_inner<'a>(
        &'a self,
        soul: String,
        depth: usize,
        visited: &'a mut HashSet<String>,
    ) -> BoxFuture<'a, MeshResult<Option<Json>>> {
        async move {
            let node = match self.store.read(&soul).await? {
                Some(node) => node,
                None => return Ok(None),
            };
            visited.insert(soul.clone());
            let mut obj = serde_json::Map::new();
            for (field, value) in &node.fields {
                let rendered = match value {
                    Value::Link(target) => {
                        if depth == 0 || visited.contains(target) {
                            value.to_json()
                        } else {
                            match self
                                .resolve_inner(target.clone(), depth - 1, visited)
                                .await
                            {
                                Ok(Some(child)) => child,
                                // Absent target or failed load: keep the link.
                                Ok(None) | Err(_) => value.to_json(),
                            }
                        }
                    }
                    other => other.to_json(),
                };
                obj.insert(field.clone(), rendered);
            }
            Ok(Some(Json::Object(obj)))
        }
        .boxed()
    }

    /// Walk a path one segment at a time, consulting local state at each hop.
    ///
    /// Equivalent to resolving the joined soul `root/seg1/…`, but loads every
    /// intermediate node individually: an explicit link redirects the walk,
    /// otherwise the next hop is the path-convention child, so cached nodes
    /// short-circuit network fanout without requiring parent links to exist.
    pub async fn traverse(&self, root: &str, segments: &[String]) -> MeshResult<Traversal> {
        let mut out = Traversal::default();
        let mut soul = root.to_string();
        let mut node = self.store.read(&soul).await?;
        if let Some(n) = &node {
            out.touched.push(n.clone());
        }

        for (i, seg) in segments.iter().enumerate() {
            match node.as_ref().and_then(|n| n.get(seg)).cloned() {
                Some(Value::Link(target)) => {
                    soul = target;
                }
                Some(primitive) => {
                    if i + 1 == segments.len() {
                        out.target = Some(Target::Value(primitive));
                    }
                    // A primitive mid-path means the rest of the path is absent.
                    return Ok(out);
                }
                // No link recorded: fall back to the path-convention child.
                None => {
                    soul = child_soul(&soul, seg);
                }
            }
            node = self.store.read(&soul).await?;
            if let Some(n) = &node {
                out.touched.push(n.clone());
            }
        }
        out.target = node.map(Target::Node);
        Ok(out)
    }
}

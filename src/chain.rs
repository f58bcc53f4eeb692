//! Chain - the fluent path API
//!
//! `mesh.get("users").get("alice")` composes the path `users/alice`; `put`
//! writes through the flattener, `once` reads through the query engine, `on`
//! subscribes to commits, `set` inserts into a grow-only set. A chain may also
//! carry read-side projections (`map`, `filter`) applied to mapping entries on
//! `once`.

use crate::bus::Subscription;
use crate::engine::EngineInner;
use crate::error::{MeshError, MeshResult};
use crate::graph::Target;
use crate::node::META_KEY;
use crate::query::QueryOptions;
use crate::types::{link_target, Value};
use serde_json::Value as Json;
use std::sync::Arc;

pub type FilterFn = Arc<dyn Fn(&Json, &str) -> bool + Send + Sync>;
pub type MapFn = Arc<dyn Fn(&Json, &str) -> Json + Send + Sync>;

/// A read-side projection, applied in order on `once`.
#[derive(Clone)]
pub enum Projection {
    Filter(FilterFn),
    Map(MapFn),
}

/// A location in the graph plus any pending projections.
#[derive(Clone)]
pub struct Chain {
    inner: Arc<EngineInner>,
    path: Vec<String>,
    ops: Vec<Projection>,
}

impl Chain {
    pub(crate) fn root(inner: Arc<EngineInner>, key: &str) -> Chain {
        Chain {
            inner,
            path: vec![key.to_string()],
            ops: Vec::new(),
        }
    }

    /// Descend one key.
    pub fn get(&self, key: &str) -> Chain {
        let mut path = self.path.clone();
        path.push(key.to_string());
        Chain {
            inner: self.inner.clone(),
            path,
            ops: self.ops.clone(),
        }
    }

    /// Soul this chain addresses.
    pub fn soul(&self) -> String {
        self.path.join("/")
    }

    fn root_and_path(&self) -> (String, Vec<String>) {
        (self.path[0].clone(), self.path[1..].to_vec())
    }

    /// Write at this location.
    ///
    /// Mappings are flattened into linked nodes; primitives write one field on
    /// the parent node, so `get("users").get("alice").get("age").put(30)` sets
    /// `age` on `users/alice`. A primitive at the root has no node to land on
    /// and is invalid.
    pub async fn put(&self, value: Json) -> MeshResult<()> {
        match &value {
            Json::Object(obj) if link_target(obj).is_none() => {
                let committed = self.inner.graph.put_nested(&self.soul(), &value).await?;
                self.inner.sync_out(committed).await;
                Ok(())
            }
            other => {
                if self.path.len() < 2 {
                    return Err(MeshError::Validation(
                        "top-level writes must be mappings".to_string(),
                    ));
                }
                let parent = self.path[..self.path.len() - 1].join("/");
                let field = self.path.last().expect("non-empty path");
                let committed = self
                    .inner
                    .graph
                    .put_field(&parent, field, Value::from_json(other)?)
                    .await?;
                self.inner.sync_out(vec![committed]).await;
                Ok(())
            }
        }
    }

    /// Read once. `None` is a normal miss. Projections apply to mapping
    /// results; metadata rides along under `_` unless everything is filtered
    /// away.
    pub async fn once(&self) -> MeshResult<Option<Json>> {
        let options = QueryOptions {
            timeout: std::time::Duration::from_millis(self.inner.options.timeout_ms),
            network: self.inner.options.realtime,
        };
        self.once_with(&options).await
    }

    /// Read once from local storage only, never touching the network.
    pub async fn once_local(&self) -> MeshResult<Option<Json>> {
        let options = QueryOptions {
            network: false,
            ..QueryOptions::default()
        };
        self.once_with(&options).await
    }

    /// Read once with explicit options (`network: false` stays local).
    pub async fn once_with(&self, options: &QueryOptions) -> MeshResult<Option<Json>> {
        let (root, path) = self.root_and_path();
        let fetched = self.inner.query.fetch(&root, &path, options).await?;
        let mut result = match fetched {
            Some(result) => result,
            None => return Ok(None),
        };
        if let Json::Object(ref mut obj) = result {
            // Attach the target node's metadata before projecting.
            if let Ok(traversal) = self.inner.graph.traverse(&root, &path).await {
                if let Some(Target::Node(node)) = traversal.target {
                    obj.insert(META_KEY.to_string(), node.meta.to_json());
                }
            }
            return Ok(Some(apply_projections(obj, &self.ops)));
        }
        Ok(Some(result))
    }

    /// Subscribe to commits on this chain's node. Events arrive in commit
    /// order; drop the subscription to detach.
    pub fn on(&self) -> Subscription {
        self.inner.bus.subscribe(&self.soul())
    }

    /// Subscribe to this node and everything beneath it.
    pub fn on_tree(&self) -> Subscription {
        self.inner.bus.subscribe_prefix(&self.soul())
    }

    /// Insert into a grow-only set under this soul. Returns the chain of the
    /// inserted member.
    pub async fn set(&self, value: Json) -> MeshResult<Chain> {
        let child = self.inner.graph.set_item(&self.soul(), &value).await?;
        // Push both the member and the link to peers.
        let mut committed = Vec::new();
        if let Some(node) = self.inner.store.read(&self.soul()).await? {
            committed.push(node);
        }
        if let Some(node) = self.inner.store.read(&child).await? {
            committed.push(node);
        }
        self.inner.sync_out(committed).await;
        Ok(Chain {
            inner: self.inner.clone(),
            path: vec![child],
            ops: Vec::new(),
        })
    }

    /// Keep only entries the predicate accepts.
    pub fn filter<F>(&self, f: F) -> Chain
    where
        F: Fn(&Json, &str) -> bool + Send + Sync + 'static,
    {
        let mut ops = self.ops.clone();
        ops.push(Projection::Filter(Arc::new(f)));
        Chain {
            inner: self.inner.clone(),
            path: self.path.clone(),
            ops,
        }
    }

    /// Transform each entry on read.
    pub fn map<F>(&self, f: F) -> Chain
    where
        F: Fn(&Json, &str) -> Json + Send + Sync + 'static,
    {
        let mut ops = self.ops.clone();
        ops.push(Projection::Map(Arc::new(f)));
        Chain {
            inner: self.inner.clone(),
            path: self.path.clone(),
            ops,
        }
    }
}

/// Apply projections in order to each non-metadata entry. Metadata is carried
/// verbatim unless every entry is filtered out, in which case it is dropped
/// too.
fn apply_projections(obj: &serde_json::Map<String, Json>, ops: &[Projection]) -> Json {
    if ops.is_empty() {
        return Json::Object(obj.clone());
    }
    let mut out = serde_json::Map::new();
    for (key, value) in obj {
        if key == META_KEY {
            continue;
        }
        let mut current = value.clone();
        let mut dropped = false;
        for op in ops {
            match op {
                Projection::Filter(f) => {
                    if !f(&current, key) {
                        dropped = true;
                        break;
                    }
                }
                Projection::Map(f) => {
                    current = f(&current, key);
                }
            }
        }
        if !dropped {
            out.insert(key.clone(), current);
        }
    }
    if !out.is_empty() {
        if let Some(meta) = obj.get(META_KEY) {
            out.insert(META_KEY.to_string(), meta.clone());
        }
    }
    Json::Object(out)
}

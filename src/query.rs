//! Query engine
//!
//! Reads resolve locally first. When the local view is absent, or recent enough
//! that a conflict may still be in flight, the query fans out to every healthy
//! relay session as a tracked `get`; responses are committed through the store
//! (HAM-merging them into local state) and the local view is re-read. A single
//! staleness retry re-fetches once after a short pause when the data carries a
//! very fresh timestamp.
//!
//! Inbound peer `get`s are answered from local state only, never forwarded;
//! fanning a query back out would amplify it across the mesh.

use crate::dam;
use crate::error::{DamError, ErrorKind, MeshError, MeshResult};
use crate::graph::{Graph, Target, DEFAULT_RESOLVE_DEPTH};
use crate::pool::RelayPool;
use crate::store::NodeStore;
use crate::track::{Outcome, Tracker};
use crate::wire::{Body, Frame, Query};
use serde_json::Value as Json;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Window in which a local result counts as possibly stale: a field written
/// within it may still be racing a concurrent writer.
pub const STALENESS_WINDOW_MS: u64 = 30_000;

/// Pause before the single staleness re-fetch.
pub const STALENESS_RETRY_DELAY: Duration = Duration::from_millis(800);

#[derive(Clone, Debug)]
pub struct QueryOptions {
    pub timeout: Duration,
    /// When false, the query never leaves local storage.
    pub network: bool,
}

impl Default for QueryOptions {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(5),
            network: true,
        }
    }
}

pub struct QueryEngine {
    store: Arc<NodeStore>,
    graph: Arc<Graph>,
    tracker: Arc<Tracker>,
    pool: Arc<RelayPool>,
}

impl QueryEngine {
    pub fn new(
        store: Arc<NodeStore>,
        graph: Arc<Graph>,
        tracker: Arc<Tracker>,
        pool: Arc<RelayPool>,
    ) -> Self {
        Self {
            store,
            graph,
            tracker,
            pool,
        }
    }

    /// Fetch the value at `root`/`path`, resolved into nested JSON.
    ///
    /// `None` without an error is a normal miss.
    pub async fn fetch(
        &self,
        root: &str,
        path: &[String],
        options: &QueryOptions,
    ) -> MeshResult<Option<Json>> {
        let view = self.fetch_round(root, path, options).await?;

        // One retry while inside the conflict-resolution window: a concurrent
        // writer's frame may still be in flight.
        if options.network
            && self.pool.ready_count() > 0
            && self.view_is_fresh(root, path).await?
        {
            tokio::time::sleep(STALENESS_RETRY_DELAY).await;
            return self.fetch_round(root, path, options).await;
        }
        Ok(view)
    }

    async fn fetch_round(
        &self,
        root: &str,
        path: &[String],
        options: &QueryOptions,
    ) -> MeshResult<Option<Json>> {
        let local = self.read_local(root, path).await?;
        let go_network = options.network
            && self.pool.ready_count() > 0
            && (local.is_none() || self.view_is_fresh(root, path).await?);
        if !go_network {
            return Ok(local);
        }

        let frame = Frame::new(Body::Get {
            query: Query::path(root, path),
        });
        let rx = self.tracker.track(&frame)?;
        let fanout = self.pool.broadcast(&frame);
        debug!(root, ?path, fanout, id = %frame.id, "query fanned out");
        if fanout == 0 {
            self.tracker.cancel(&frame.id);
            return Ok(local);
        }

        match tokio::time::timeout(options.timeout, rx).await {
            Ok(Ok(Outcome::Ack(reply))) => {
                self.commit_reply(&reply).await?;
            }
            Ok(Ok(Outcome::Dam(err))) => {
                self.tracker.cancel(&frame.id);
                match err.kind {
                    // A miss on the far side is not an error.
                    ErrorKind::NotFound => {}
                    ErrorKind::Unauthorized => {
                        return Err(MeshError::Unauthorized(err.message))
                    }
                    ErrorKind::Permission => return Err(MeshError::Permission(err.message)),
                    ErrorKind::Validation => return Err(MeshError::Validation(err.message)),
                    ErrorKind::Limit => return Err(MeshError::Limit(err.message)),
                    _ => debug!(error = %err, "query answered with dam"),
                }
            }
            Ok(Ok(Outcome::Cancelled)) => return Err(MeshError::Cancelled),
            Ok(Ok(Outcome::Timeout)) | Err(_) => {
                self.tracker.cancel(&frame.id);
            }
            Ok(Err(_)) => {
                self.tracker.cancel(&frame.id);
            }
        }

        // Whatever arrived has been merged; answer from the local view.
        self.read_local(root, path).await
    }

    async fn read_local(&self, root: &str, path: &[String]) -> MeshResult<Option<Json>> {
        let traversal = self.graph.traverse(root, path).await?;
        match traversal.target {
            Some(Target::Node(node)) => {
                // A node holding only metadata has no user content yet.
                if node.is_empty() {
                    return Ok(None);
                }
                self.graph.resolve(node.soul(), DEFAULT_RESOLVE_DEPTH).await
            }
            Some(Target::Value(value)) => Ok(Some(value.to_json())),
            None => Ok(None),
        }
    }

    /// Whether the node the path lands on carries a timestamp inside the
    /// staleness window.
    async fn view_is_fresh(&self, root: &str, path: &[String]) -> MeshResult<bool> {
        let traversal = self.graph.traverse(root, path).await?;
        let node = match traversal.target {
            Some(Target::Node(node)) => node,
            Some(Target::Value(_)) => match traversal.touched.last() {
                Some(node) => node.clone(),
                None => return Ok(false),
            },
            None => return Ok(false),
        };
        let newest = node.meta.newest_state();
        let now = self.store.clock().wall();
        Ok(newest > 0 && now.saturating_sub(newest) < STALENESS_WINDOW_MS)
    }

    async fn commit_reply(&self, reply: &Frame) -> MeshResult<()> {
        if let Body::Put { souls } = &reply.body {
            for node in souls.values() {
                self.store.merge_in(node.clone()).await?;
            }
        }
        Ok(())
    }

    /// Answer a peer's `get` from local state.
    ///
    /// Ships every node touched along the path plus the resolved target; a miss
    /// answers with a correlated not-found `dam`, and resolution failures with
    /// a `dam` of the matching kind.
    pub async fn answer(&self, query: &Query, request_id: &str) -> Frame {
        let (root, path) = query.segments();
        match self.graph.traverse(&root, &path).await {
            Ok(traversal) => {
                if traversal.target.is_none() {
                    let err = DamError::new(
                        ErrorKind::NotFound,
                        format!("Node \"{root}\" not found"),
                    )
                    .with_soul(root);
                    return dam::to_dam(&err, Some(request_id));
                }
                let mut souls = BTreeMap::new();
                for node in traversal.touched {
                    souls.insert(node.soul().to_string(), node);
                }
                Frame::new(Body::Put { souls }).acking(request_id)
            }
            Err(e) => {
                let err = DamError::from(&e).with_soul(root);
                dam::to_dam(&err, Some(request_id))
            }
        }
    }
}

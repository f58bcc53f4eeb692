//! Top-level engine
//!
//! `Mesh` composes the whole stack: store, graph, subscription bus, tracker,
//! relay pool and query engine, behind the fluent chain API. One engine is one
//! replica: it owns its machine identity, its clock, and its connections; two
//! engines in one process share nothing.

use crate::bus::{OverflowPolicy, SubscriptionBus, DEFAULT_QUEUE_CAPACITY};
use crate::chain::Chain;
use crate::dam::ErrorStats;
use crate::error::{DamError, MeshError, MeshResult};
use crate::graph::Graph;
use crate::pool::{Connector, PoolConfig, RelayPool, Strategy};
use crate::query::{QueryEngine, QueryOptions};
use crate::relay::RelayEvent;
use crate::state::{random_token, HamClock, MachineIdentity};
use crate::storage::{MemoryStorage, Storage};
use crate::store::NodeStore;
use crate::track::{Classified, Tracker, TrackerConfig};
use crate::transport::Transport;
use crate::websocket::WebSocketTransport;
use crate::wire::{Body, Frame};
use parking_lot::Mutex;
use serde_json::Value as Json;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Engine configuration.
#[derive(Clone)]
pub struct MeshOptions {
    /// Storage adapter; in-memory when unset.
    pub storage: Option<Arc<dyn Storage>>,
    /// Peer URLs to connect to on startup.
    pub peers: Vec<String>,
    /// Relay URLs to connect to on startup.
    pub relays: Vec<String>,
    pub max_peers: usize,
    pub max_relay_connections: usize,
    pub min_relay_connections: usize,
    pub relay_load_balancing: Strategy,
    pub relay_discovery: bool,
    /// Deadline for network reads, ms.
    pub timeout_ms: u64,
    /// Push local writes to peers as they happen.
    pub realtime: bool,
    /// Per-subscriber event queue bound.
    pub subscriber_queue: usize,
    pub overflow: OverflowPolicy,
}

impl Default for MeshOptions {
    fn default() -> Self {
        Self {
            storage: None,
            peers: vec![],
            relays: vec![],
            max_peers: 10,
            max_relay_connections: 5,
            min_relay_connections: 1,
            relay_load_balancing: Strategy::HealthWeighted,
            relay_discovery: true,
            timeout_ms: 5000,
            realtime: true,
            subscriber_queue: DEFAULT_QUEUE_CAPACITY,
            overflow: OverflowPolicy::DropOldest,
        }
    }
}

impl MeshOptions {
    pub fn with_peers(peers: Vec<String>) -> Self {
        Self {
            peers,
            ..Default::default()
        }
    }

    pub fn with_storage(storage: Arc<dyn Storage>) -> Self {
        Self {
            storage: Some(storage),
            ..Default::default()
        }
    }
}

pub(crate) struct EngineInner {
    pub options: MeshOptions,
    pub store: Arc<NodeStore>,
    pub graph: Arc<Graph>,
    pub bus: Arc<SubscriptionBus>,
    pub tracker: Arc<Tracker>,
    pub pool: Arc<RelayPool>,
    pub query: Arc<QueryEngine>,
    pub errors: Arc<ErrorStats>,
    pub peer_id: String,
    events_rx: Mutex<Option<mpsc::Receiver<RelayEvent>>>,
    started: AtomicBool,
    closed: AtomicBool,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

/// The engine: entry point of the library.
///
/// ```rust,no_run
/// use meshdb::Mesh;
/// use serde_json::json;
///
/// # async fn example() -> Result<(), meshdb::MeshError> {
/// let mesh = Mesh::new();
/// mesh.get("users").get("alice").put(json!({"name": "Alice", "age": 30})).await?;
/// let alice = mesh.get("users").get("alice").once().await?;
/// println!("{alice:?}");
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct Mesh {
    inner: Arc<EngineInner>,
}

impl Mesh {
    /// Local-only engine with in-memory storage.
    pub fn new() -> Self {
        Self::build(MeshOptions::default())
    }

    /// Engine configured by options; connects to any listed peers and relays.
    pub async fn with_options(options: MeshOptions) -> MeshResult<Self> {
        let seeds: Vec<String> = options
            .peers
            .iter()
            .chain(options.relays.iter())
            .cloned()
            .collect();
        let mesh = Self::build(options);
        mesh.ensure_started();
        for url in seeds {
            mesh.inner.pool.add_url(&url)?;
        }
        mesh.inner.pool.start().await;
        Ok(mesh)
    }

    fn build(options: MeshOptions) -> Self {
        let storage: Arc<dyn Storage> = options
            .storage
            .clone()
            .unwrap_or_else(|| Arc::new(MemoryStorage::new()));
        let clock = Arc::new(HamClock::new());
        let machine = Arc::new(MachineIdentity::new());
        let bus = Arc::new(SubscriptionBus::with_config(
            options.subscriber_queue,
            options.overflow,
        ));
        let store = Arc::new(NodeStore::new(storage, clock, machine, bus.clone()));
        let graph = Arc::new(Graph::new(store.clone()));
        let tracker = Arc::new(Tracker::new(TrackerConfig {
            default_deadline: Duration::from_millis(options.timeout_ms),
            ..TrackerConfig::default()
        }));
        let peer_id = random_token(9);
        let (events_tx, events_rx) = mpsc::channel(1024);
        let connector: Connector = Arc::new(|url: &str| -> MeshResult<Arc<dyn Transport>> {
            Ok(Arc::new(WebSocketTransport::new(url)))
        });
        let pool = RelayPool::new(
            PoolConfig {
                // The relay cap never exceeds the overall peer budget.
                max_connections: options.max_relay_connections.min(options.max_peers),
                min_connections: options.min_relay_connections,
                strategy: options.relay_load_balancing,
                discovery: options.relay_discovery,
                ..PoolConfig::default()
            },
            connector,
            peer_id.clone(),
            events_tx,
            tracker.clone(),
        );
        let query = Arc::new(QueryEngine::new(
            store.clone(),
            graph.clone(),
            tracker.clone(),
            pool.clone(),
        ));
        Self {
            inner: Arc::new(EngineInner {
                options,
                store,
                graph,
                bus,
                tracker,
                pool,
                query,
                errors: Arc::new(ErrorStats::new()),
                peer_id,
                events_rx: Mutex::new(Some(events_rx)),
                started: AtomicBool::new(false),
                closed: AtomicBool::new(false),
                tasks: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Spawn the inbound dispatcher and the retry sweeper once. Requires a
    /// tokio runtime; purely local engines never need it.
    fn ensure_started(&self) {
        if self.inner.started.swap(true, Ordering::SeqCst) {
            return;
        }
        let mut tasks = self.inner.tasks.lock();

        if let Some(mut events_rx) = self.inner.events_rx.lock().take() {
            let inner = self.inner.clone();
            tasks.push(tokio::spawn(async move {
                while let Some(event) = events_rx.recv().await {
                    dispatch_frame(&inner, event).await;
                }
            }));
        }

        let inner = self.inner.clone();
        tasks.push(tokio::spawn(async move {
            let mut tick = tokio::time::interval(Duration::from_millis(100));
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tick.tick().await;
                if inner.closed.load(Ordering::SeqCst) {
                    break;
                }
                for directive in inner.tracker.expire_due() {
                    let inner = inner.clone();
                    tokio::spawn(async move {
                        tokio::time::sleep(directive.delay).await;
                        debug!(id = %directive.frame.id, attempt = directive.attempt, "retransmitting");
                        let _ = inner.pool.send(&directive.frame).await;
                    });
                }
            }
        }));
    }

    /// Start a chain at a root key.
    pub fn get(&self, key: &str) -> Chain {
        Chain::root(self.inner.clone(), key)
    }

    /// Write a mapping of root souls in one call.
    pub async fn put_root(&self, mapping: Json) -> MeshResult<()> {
        let obj = mapping
            .as_object()
            .ok_or_else(|| MeshError::Validation("put_root takes a mapping".to_string()))?;
        for (soul, value) in obj {
            let committed = self.inner.graph.put_nested(soul, value).await?;
            self.inner.sync_out(committed).await;
        }
        Ok(())
    }

    /// Connect to a peer URL. The pool caps concurrent connections.
    pub async fn add_peer(&self, url: &str) -> MeshResult<()> {
        self.ensure_started();
        let relay = self.inner.pool.add_url(url)?;
        self.inner.pool.start().await;
        relay.connect().await
    }

    /// Attach a peer over an explicit transport (tests, accepted connections).
    pub async fn add_peer_transport(
        &self,
        url: &str,
        transport: Arc<dyn Transport>,
    ) -> MeshResult<()> {
        self.ensure_started();
        let relay = self.inner.pool.add_transport(url, transport)?;
        self.inner.pool.start().await;
        relay.connect().await
    }

    /// Disconnect and forget a peer.
    pub async fn remove_peer(&self, url: &str) -> MeshResult<()> {
        match self.inner.pool.remove_url(url) {
            Some(relay) => {
                relay.close().await;
                Ok(())
            }
            None => Err(MeshError::NotFound(format!("no peer {url}"))),
        }
    }

    /// Number of Ready peer sessions.
    pub fn connected_peers(&self) -> usize {
        self.inner.pool.ready_count()
    }

    pub fn peer_id(&self) -> &str {
        &self.inner.peer_id
    }

    /// Stream of errors recorded by the engine (telemetry).
    pub fn errors(&self) -> tokio::sync::broadcast::Receiver<DamError> {
        self.inner.errors.subscribe()
    }

    pub fn error_stats(&self) -> &Arc<ErrorStats> {
        &self.inner.errors
    }

    /// Default read options derived from the engine configuration.
    pub fn query_options(&self) -> QueryOptions {
        QueryOptions {
            timeout: Duration::from_millis(self.inner.options.timeout_ms),
            network: self.inner.options.realtime,
        }
    }

    /// Shut the engine down: close every session, stop background tasks, flush
    /// storage. Idempotent.
    pub async fn close(&self) -> MeshResult<()> {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.inner.pool.close().await;
        for task in self.inner.tasks.lock().drain(..) {
            task.abort();
        }
        self.inner.store.close().await
    }
}

impl Default for Mesh {
    fn default() -> Self {
        Self::new()
    }
}

impl EngineInner {
    /// Push committed nodes to peers as a tracked put. Fire and forget: the
    /// sweeper retries, and acks resolve silently.
    pub(crate) async fn sync_out(&self, committed: Vec<crate::node::Node>) {
        if !self.options.realtime || committed.is_empty() || self.pool.ready_count() == 0 {
            return;
        }
        let mut souls = BTreeMap::new();
        for node in committed {
            souls.insert(node.soul().to_string(), node);
        }
        let frame = Frame::new(Body::Put { souls });
        if let Err(e) = self.tracker.track(&frame) {
            warn!(error = %e, "put fan-out not tracked");
        }
        let sent = self.pool.broadcast(&frame);
        debug!(id = %frame.id, sent, "put fanned out");
    }
}

/// Inbound frame dispatch: classification first, then per-kind handling.
async fn dispatch_frame(inner: &Arc<EngineInner>, event: RelayEvent) {
    let RelayEvent { relay_id, frame } = event;
    match inner.tracker.on_inbound(&frame) {
        Classified::Duplicate => return,
        Classified::Reply => {
            // Query responses double as data: commit before the waiter re-reads.
            if let Body::Put { souls } = &frame.body {
                for node in souls.values() {
                    if let Err(e) = inner.store.merge_in(node.clone()).await {
                        inner.errors.record(&DamError::from(&e));
                    }
                }
            }
            return;
        }
        Classified::New => {}
    }
    match &frame.body {
        Body::Put { souls } => {
            let mut failure: Option<MeshError> = None;
            for node in souls.values() {
                if let Err(e) = inner.store.merge_in(node.clone()).await {
                    warn!(soul = %node.soul(), error = %e, "rejecting peer node");
                    inner.errors.record(&DamError::from(&e));
                    failure = Some(e);
                }
            }
            // Never ack an ack; only originals get answered.
            if frame.ack.is_none() {
                let reply = match failure {
                    Some(e) => crate::dam::to_dam(&DamError::from(&e), Some(&frame.id)),
                    None => Frame::new(Body::Put {
                        souls: BTreeMap::new(),
                    })
                    .acking(frame.id.clone()),
                };
                let _ = inner.pool.send_to(&relay_id, &reply);
            }
        }
        Body::Get { query } => {
            let reply = inner.query.answer(query, &frame.id).await;
            if let Err(e) = inner.pool.send_to(&relay_id, &reply) {
                debug!(relay = %relay_id, error = %e, "query answer undeliverable");
            }
        }
        Body::Dam { error } => {
            inner.errors.record(error);
        }
        // Handshake traffic is consumed at the relay.
        Body::Hi { .. } | Body::Bye { .. } => {}
        Body::Unknown => {
            debug!(id = %frame.id, "ignoring unknown frame kind");
        }
    }
}

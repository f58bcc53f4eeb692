//! Relay pool: connection lifecycle, health, load balancing, failover
//!
//! Maintains sessions to a set of relay URLs, keeps them healthy with periodic
//! probes, and picks one per outbound frame according to the configured
//! strategy. A failing send immediately falls over to the next candidate; the
//! failed session is reconnected in the background with exponential backoff
//! plus jitter.

use crate::error::{MeshError, MeshResult};
use crate::relay::{RelayClient, RelayEvent};
use crate::session;
use crate::track::{Outcome, Tracker};
use crate::transport::Transport;
use crate::wire::Frame;
use parking_lot::{Mutex, RwLock};
use rand::Rng;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Load-balancing strategies for outbound frames.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Strategy {
    RoundRobin,
    LeastInFlight,
    Random,
    HealthWeighted,
}

impl Strategy {
    pub fn parse(s: &str) -> Option<Strategy> {
        match s {
            "round_robin" => Some(Strategy::RoundRobin),
            "least_in_flight" => Some(Strategy::LeastInFlight),
            "random" => Some(Strategy::Random),
            "health_weighted" => Some(Strategy::HealthWeighted),
            _ => None,
        }
    }
}

/// Builds a transport for a relay URL. The engine installs the websocket
/// connector; tests install memory transports.
pub type Connector =
    Arc<dyn Fn(&str) -> MeshResult<Arc<dyn Transport>> + Send + Sync>;

#[derive(Clone)]
pub struct PoolConfig {
    pub max_connections: usize,
    pub min_connections: usize,
    pub strategy: Strategy,
    pub discovery: bool,
    pub keepalive_interval: Duration,
    pub reconnect_base: Duration,
    pub reconnect_cap: Duration,
    /// A session scoring below this is drained and reconnected.
    pub health_threshold: f64,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_connections: 5,
            min_connections: 1,
            strategy: Strategy::HealthWeighted,
            discovery: true,
            keepalive_interval: Duration::from_secs(10),
            reconnect_base: Duration::from_millis(500),
            reconnect_cap: Duration::from_secs(30),
            health_threshold: 0.05,
        }
    }
}

struct Member {
    relay: Arc<RelayClient>,
    reconnect_attempts: u32,
    next_reconnect: Instant,
    /// Seeded members reconnect forever; discovered ones are dropped on failure.
    seeded: bool,
}

pub struct RelayPool {
    members: RwLock<Vec<Member>>,
    config: PoolConfig,
    connector: Connector,
    local_peer_id: String,
    events: mpsc::Sender<RelayEvent>,
    tracker: Arc<Tracker>,
    rr_cursor: AtomicUsize,
    started: AtomicBool,
    closed: AtomicBool,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl RelayPool {
    pub fn new(
        config: PoolConfig,
        connector: Connector,
        local_peer_id: impl Into<String>,
        events: mpsc::Sender<RelayEvent>,
        tracker: Arc<Tracker>,
    ) -> Arc<Self> {
        Arc::new(Self {
            members: RwLock::new(Vec::new()),
            config,
            connector,
            local_peer_id: local_peer_id.into(),
            events,
            tracker,
            rr_cursor: AtomicUsize::new(0),
            started: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            tasks: Mutex::new(Vec::new()),
        })
    }

    /// Register a relay URL without connecting yet.
    pub fn add_url(&self, url: &str) -> MeshResult<Arc<RelayClient>> {
        self.add_inner(url, true)
    }

    /// Register a relay learned through handshake discovery.
    pub fn add_discovered(&self, url: &str) -> MeshResult<Arc<RelayClient>> {
        self.add_inner(url, false)
    }

    fn add_inner(&self, url: &str, seeded: bool) -> MeshResult<Arc<RelayClient>> {
        {
            let members = self.members.read();
            if members.len() >= self.config.max_connections {
                return Err(MeshError::Limit(format!(
                    "relay pool full ({} connections)",
                    members.len()
                )));
            }
            if let Some(existing) = members.iter().find(|m| m.relay.url() == url) {
                return Ok(existing.relay.clone());
            }
        }
        let transport = (self.connector)(url)?;
        self.add_transport_inner(url, transport, seeded)
    }

    /// Register a relay over an explicit transport (tests, inbound accepts).
    pub fn add_transport(
        &self,
        url: &str,
        transport: Arc<dyn Transport>,
    ) -> MeshResult<Arc<RelayClient>> {
        self.add_transport_inner(url, transport, true)
    }

    fn add_transport_inner(
        &self,
        url: &str,
        transport: Arc<dyn Transport>,
        seeded: bool,
    ) -> MeshResult<Arc<RelayClient>> {
        let relay = RelayClient::new(url, transport, self.local_peer_id.clone(), self.events.clone());
        let mut members = self.members.write();
        if members.len() >= self.config.max_connections {
            return Err(MeshError::Limit(format!(
                "relay pool full ({} connections)",
                members.len()
            )));
        }
        members.push(Member {
            relay: relay.clone(),
            reconnect_attempts: 0,
            next_reconnect: Instant::now(),
            seeded,
        });
        Ok(relay)
    }

    pub fn remove_url(&self, url: &str) -> Option<Arc<RelayClient>> {
        let mut members = self.members.write();
        let pos = members.iter().position(|m| m.relay.url() == url)?;
        Some(members.remove(pos).relay)
    }

    /// Open sessions up to `min_connections` and spawn the background
    /// keep-alive and reconnect loops. Idempotent.
    pub async fn start(self: &Arc<Self>) {
        if self.started.swap(true, Ordering::SeqCst) {
            return;
        }
        let candidates: Vec<Arc<RelayClient>> = {
            let members = self.members.read();
            members
                .iter()
                .take(self.config.min_connections.max(1))
                .map(|m| m.relay.clone())
                .collect()
        };
        for relay in candidates {
            if let Err(e) = relay.connect().await {
                warn!(url = %relay.url(), error = %e, "initial relay connect failed");
            } else if self.config.discovery {
                self.adopt_discovered(&relay);
            }
        }

        let pool = self.clone();
        let keepalive = tokio::spawn(async move {
            let mut tick = tokio::time::interval(pool.config.keepalive_interval);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tick.tick().await;
                if pool.closed.load(Ordering::SeqCst) {
                    break;
                }
                pool.probe_all().await;
            }
        });
        let pool = self.clone();
        let reconnect = tokio::spawn(async move {
            let mut tick = tokio::time::interval(Duration::from_millis(250));
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tick.tick().await;
                if pool.closed.load(Ordering::SeqCst) {
                    break;
                }
                pool.reconnect_failed().await;
            }
        });
        self.tasks.lock().extend([keepalive, reconnect]);
    }

    /// Drain and close every session. Idempotent.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
        let relays: Vec<Arc<RelayClient>> = {
            let members = self.members.read();
            members.iter().map(|m| m.relay.clone()).collect()
        };
        for relay in relays {
            relay.close().await;
        }
        info!("relay pool closed");
    }

    fn ready_members(&self) -> Vec<Arc<RelayClient>> {
        self.members
            .read()
            .iter()
            .filter(|m| m.relay.state().is_ready())
            .map(|m| m.relay.clone())
            .collect()
    }

    pub fn ready_count(&self) -> usize {
        self.ready_members().len()
    }

    pub fn relay_by_id(&self, relay_id: &str) -> Option<Arc<RelayClient>> {
        self.members
            .read()
            .iter()
            .find(|m| m.relay.id() == relay_id)
            .map(|m| m.relay.clone())
    }

    /// Pick one Ready session per the configured strategy.
    pub fn select(&self) -> Option<Arc<RelayClient>> {
        let ready = self.ready_members();
        if ready.is_empty() {
            return None;
        }
        let chosen = match self.config.strategy {
            Strategy::RoundRobin => {
                let i = self.rr_cursor.fetch_add(1, Ordering::Relaxed) % ready.len();
                ready[i].clone()
            }
            Strategy::Random => {
                let i = rand::thread_rng().gen_range(0..ready.len());
                ready[i].clone()
            }
            Strategy::LeastInFlight => ready
                .iter()
                .min_by_key(|r| r.stats.in_flight())
                .cloned()
                .expect("nonempty"),
            Strategy::HealthWeighted => ready
                .iter()
                .max_by(|a, b| {
                    a.stats
                        .score(true)
                        .partial_cmp(&b.stats.score(true))
                        .unwrap_or(std::cmp::Ordering::Equal)
                })
                .cloned()
                .expect("nonempty"),
        };
        Some(chosen)
    }

    /// Send through one selected session, falling over on failure.
    ///
    /// Backpressure and dead links mark the session and try the next; when
    /// every candidate refuses, the send fails as a network error.
    pub async fn send(&self, frame: &Frame) -> MeshResult<()> {
        let mut tried: Vec<String> = Vec::new();
        loop {
            // Strategy applies to the first pick; failover walks the rest.
            let relay = if tried.is_empty() {
                match self.select() {
                    Some(relay) => relay,
                    None => return Err(MeshError::Network("no ready relay session".into())),
                }
            } else {
                let next = self
                    .ready_members()
                    .into_iter()
                    .find(|r| !tried.iter().any(|t| t == r.id()));
                match next {
                    Some(relay) => relay,
                    None => {
                        return Err(MeshError::Network(format!(
                            "send failed on all {} ready sessions",
                            tried.len()
                        )))
                    }
                }
            };
            match relay.send(frame) {
                Ok(()) => {
                    relay.stats.record_outcome(true);
                    return Ok(());
                }
                Err(e) => {
                    warn!(relay = %relay.id(), error = %e, "send failed, failing over");
                    relay.stats.record_outcome(false);
                    tried.push(relay.id().to_string());
                }
            }
        }
    }

    /// Send to a specific session (query answers go back where they came from).
    pub fn send_to(&self, relay_id: &str, frame: &Frame) -> MeshResult<()> {
        let relay = self
            .relay_by_id(relay_id)
            .ok_or_else(|| MeshError::Network(format!("no session {relay_id}")))?;
        relay.send(frame)
    }

    /// Send to every Ready session; returns how many accepted the frame.
    pub fn broadcast(&self, frame: &Frame) -> usize {
        let mut sent = 0;
        for relay in self.ready_members() {
            match relay.send(frame) {
                Ok(()) => sent += 1,
                Err(e) => {
                    debug!(relay = %relay.id(), error = %e, "broadcast skip");
                    relay.stats.record_outcome(false);
                }
            }
        }
        sent
    }

    /// Probe every Ready session with a tracked hi; update RTT and success
    /// EWMAs; drain sessions that score below the health threshold.
    async fn probe_all(self: &Arc<Self>) {
        for relay in self.ready_members() {
            let probe = session::hi_frame(&self.local_peer_id);
            let rx = match self.tracker.track(&probe) {
                Ok(rx) => rx,
                Err(_) => continue,
            };
            if relay.send(&probe).is_err() {
                self.tracker.cancel(&probe.id);
                relay.stats.record_outcome(false);
                continue;
            }
            relay.stats.begin_send();
            let started = Instant::now();
            let deadline = self.tracker.deadline_for(&probe);
            let outcome = tokio::time::timeout(deadline, rx).await;
            relay.stats.end_send();
            match outcome {
                Ok(Ok(Outcome::Ack(_))) => {
                    relay.stats.record_rtt(started.elapsed().as_secs_f64() * 1000.0);
                    relay.stats.record_outcome(true);
                }
                _ => {
                    self.tracker.cancel(&probe.id);
                    relay.stats.record_outcome(false);
                }
            }
            if relay.state().is_ready()
                && relay.stats.score(true) < self.config.health_threshold
            {
                warn!(relay = %relay.id(), score = relay.stats.score(true), "unhealthy session, draining");
                relay.close().await;
            }
        }
    }

    /// Reconnect sessions that failed or were drained, with capped exponential
    /// backoff plus jitter.
    async fn reconnect_failed(self: &Arc<Self>) {
        let now = Instant::now();
        let due: Vec<Arc<RelayClient>> = {
            let mut members = self.members.write();
            // Discovered relays that failed are dropped rather than retried.
            members.retain(|m| m.seeded || !m.relay.state().is_terminal());
            members
                .iter_mut()
                .filter(|m| m.relay.state().is_terminal() && m.next_reconnect <= now)
                .map(|m| {
                    m.reconnect_attempts += 1;
                    let exp = m.reconnect_attempts.saturating_sub(1).min(16);
                    let backoff = self
                        .config
                        .reconnect_base
                        .saturating_mul(1u32 << exp)
                        .min(self.config.reconnect_cap);
                    let jitter = Duration::from_millis(rand::thread_rng().gen_range(0..500));
                    m.next_reconnect = now + backoff + jitter;
                    m.relay.clone()
                })
                .collect()
        };
        for old in due {
            let url = old.url().to_string();
            debug!(url = %url, "reconnecting relay");
            let transport = match (self.connector)(&url) {
                Ok(t) => t,
                Err(e) => {
                    warn!(url = %url, error = %e, "connector failed");
                    continue;
                }
            };
            let fresh = RelayClient::new(
                url.clone(),
                transport,
                self.local_peer_id.clone(),
                self.events.clone(),
            );
            match fresh.connect().await {
                Ok(()) => {
                    let mut members = self.members.write();
                    if let Some(member) =
                        members.iter_mut().find(|m| m.relay.id() == old.id())
                    {
                        member.relay = fresh.clone();
                        member.reconnect_attempts = 0;
                    }
                    if self.config.discovery {
                        drop(members);
                        self.adopt_discovered(&fresh);
                    }
                }
                Err(e) => {
                    debug!(url = %url, error = %e, "reconnect attempt failed");
                }
            }
        }
    }

    /// Adopt peers advertised during a handshake, up to `max_connections`.
    fn adopt_discovered(self: &Arc<Self>, relay: &Arc<RelayClient>) {
        for url in relay.discovered_peers() {
            match self.add_discovered(&url) {
                Ok(added) => {
                    debug!(url = %url, "discovered relay added");
                    if !added.state().is_ready() {
                        let added = added.clone();
                        tokio::spawn(async move {
                            let _ = added.connect().await;
                        });
                    }
                }
                Err(MeshError::Limit(_)) => break,
                Err(_) => {}
            }
        }
    }
}

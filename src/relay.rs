//! Relay client: one session over one transport
//!
//! Owns the handshake, a bounded outbound queue, and the inbound pump that
//! decodes raw frames and hands them to the engine once the session is `Ready`.
//! A relay client never reconnects itself; the pool owns retry policy.

use crate::error::{DamError, ErrorKind, MeshError, MeshResult};
use crate::session::{
    self, version_accepted, SessionState, HANDSHAKE_DEADLINE,
};
use crate::state::random_token;
use crate::transport::Transport;
use crate::wire::{Body, Frame};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, warn};

/// A decoded frame arriving from a relay, tagged with its session.
#[derive(Debug)]
pub struct RelayEvent {
    pub relay_id: String,
    pub frame: Frame,
}

/// Health bookkeeping for one session, updated by the pool.
pub struct LinkStats {
    rtt_ms: Mutex<f64>,
    success: Mutex<f64>,
    in_flight: AtomicUsize,
}

const RTT_ALPHA: f64 = 0.3;
const SUCCESS_ALPHA: f64 = 0.2;

impl LinkStats {
    pub fn new() -> Self {
        Self {
            rtt_ms: Mutex::new(100.0),
            success: Mutex::new(1.0),
            in_flight: AtomicUsize::new(0),
        }
    }

    pub fn record_rtt(&self, ms: f64) {
        let mut rtt = self.rtt_ms.lock();
        *rtt = (1.0 - RTT_ALPHA) * *rtt + RTT_ALPHA * ms;
    }

    pub fn record_outcome(&self, ok: bool) {
        let mut success = self.success.lock();
        let sample = if ok { 1.0 } else { 0.0 };
        *success = (1.0 - SUCCESS_ALPHA) * *success + SUCCESS_ALPHA * sample;
    }

    pub fn rtt_ms(&self) -> f64 {
        *self.rtt_ms.lock()
    }

    pub fn success_rate(&self) -> f64 {
        *self.success.lock()
    }

    pub fn begin_send(&self) {
        self.in_flight.fetch_add(1, Ordering::Relaxed);
    }

    pub fn end_send(&self) {
        let _ = self
            .in_flight
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| n.checked_sub(1));
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::Relaxed)
    }

    /// Health score: success rate, discounted by latency, zero when down.
    pub fn score(&self, connected: bool) -> f64 {
        if !connected {
            return 0.0;
        }
        self.success_rate() * (1.0 / (1.0 + self.rtt_ms() / 100.0))
    }
}

impl Default for LinkStats {
    fn default() -> Self {
        Self::new()
    }
}

pub struct RelayClient {
    id: String,
    url: String,
    transport: Arc<dyn Transport>,
    local_peer_id: String,
    state_tx: watch::Sender<SessionState>,
    state_rx: watch::Receiver<SessionState>,
    outbound: Mutex<Option<mpsc::Sender<String>>>,
    handshake: Mutex<Option<oneshot::Sender<Result<Frame, DamError>>>>,
    remote_peer_id: Mutex<Option<String>>,
    discovered: Mutex<Vec<String>>,
    fail_cause: Mutex<Option<DamError>>,
    events: mpsc::Sender<RelayEvent>,
    pub stats: Arc<LinkStats>,
}

impl RelayClient {
    pub fn new(
        url: impl Into<String>,
        transport: Arc<dyn Transport>,
        local_peer_id: impl Into<String>,
        events: mpsc::Sender<RelayEvent>,
    ) -> Arc<Self> {
        let (state_tx, state_rx) = watch::channel(SessionState::Connecting);
        Arc::new(Self {
            id: format!("relay_{}", random_token(8)),
            url: url.into(),
            transport,
            local_peer_id: local_peer_id.into(),
            state_tx,
            state_rx,
            outbound: Mutex::new(None),
            handshake: Mutex::new(None),
            remote_peer_id: Mutex::new(None),
            discovered: Mutex::new(Vec::new()),
            fail_cause: Mutex::new(None),
            events,
            stats: Arc::new(LinkStats::new()),
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn state(&self) -> SessionState {
        *self.state_rx.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<SessionState> {
        self.state_rx.clone()
    }

    pub fn remote_peer_id(&self) -> Option<String> {
        self.remote_peer_id.lock().clone()
    }

    /// Peer URLs the far side advertised during the handshake.
    pub fn discovered_peers(&self) -> Vec<String> {
        self.discovered.lock().clone()
    }

    pub fn fail_cause(&self) -> Option<DamError> {
        self.fail_cause.lock().clone()
    }

    fn set_state(&self, state: SessionState) {
        let _ = self.state_tx.send(state);
    }

    fn fail(&self, cause: DamError) {
        *self.fail_cause.lock() = Some(cause);
        self.set_state(SessionState::Failed);
    }

    /// Open the transport, run the handshake, and pump inbound frames.
    ///
    /// Resolves once the session is `Ready` or has failed. Idempotent when
    /// already `Ready`.
    pub async fn connect(self: &Arc<Self>) -> MeshResult<()> {
        if self.state().is_ready() {
            return Ok(());
        }
        self.set_state(SessionState::Connecting);

        let conn = match self.transport.connect().await {
            Ok(conn) => conn,
            Err(e) => {
                self.fail(DamError::from(&e));
                return Err(e);
            }
        };
        *self.outbound.lock() = Some(conn.outbound.clone());

        let (hs_tx, hs_rx) = oneshot::channel();
        *self.handshake.lock() = Some(hs_tx);

        let hi = session::hi_frame(&self.local_peer_id);
        let hi_id = hi.id.clone();
        if conn.outbound.send(hi.encode_string()).await.is_err() {
            let cause = DamError::new(ErrorKind::Network, "connection closed during handshake");
            self.fail(cause);
            return Err(MeshError::Network("connection closed during handshake".into()));
        }
        self.set_state(SessionState::HandshakeSent);

        let client = self.clone();
        let outbound = conn.outbound.clone();
        let mut inbound = conn.inbound;
        tokio::spawn(async move {
            client.pump(&mut inbound, outbound, hi_id).await;
        });

        match tokio::time::timeout(HANDSHAKE_DEADLINE, hs_rx).await {
            Ok(Ok(Ok(_ack))) => {
                self.set_state(SessionState::Ready);
                debug!(relay = %self.id, url = %self.url, "session ready");
                Ok(())
            }
            Ok(Ok(Err(cause))) => {
                let msg = cause.message.clone();
                self.fail(cause);
                Err(MeshError::Unauthorized(msg))
            }
            Ok(Err(_)) => {
                let cause = DamError::new(ErrorKind::Network, "connection closed during handshake");
                self.fail(cause);
                Err(MeshError::Network("connection closed during handshake".into()))
            }
            Err(_) => {
                let cause = DamError::new(ErrorKind::Timeout, "handshake timed out");
                self.fail(cause);
                Err(MeshError::Timeout("handshake timed out".into()))
            }
        }
    }

    async fn pump(
        self: &Arc<Self>,
        inbound: &mut mpsc::Receiver<String>,
        outbound: mpsc::Sender<String>,
        our_hi_id: String,
    ) {
        while let Some(raw) = inbound.recv().await {
            let frame = match Frame::decode_string(&raw) {
                Ok(frame) => frame,
                Err(e) => {
                    warn!(relay = %self.id, error = %e, "dropping malformed frame");
                    continue;
                }
            };
            match &frame.body {
                Body::Hi { version, peer_id } => {
                    if frame.ack.is_none() {
                        // Their opening hi, or a keep-alive probe: ack it.
                        *self.remote_peer_id.lock() = Some(peer_id.clone());
                        self.collect_discovered(&frame);
                        let ack = session::hi_ack(&self.local_peer_id, &frame);
                        let _ = outbound.try_send(ack.encode_string());
                    } else if frame.ack.as_deref() == Some(our_hi_id.as_str()) {
                        // The far side answered our hi.
                        if version_accepted(session::PROTOCOL_VERSION, version) {
                            *self.remote_peer_id.lock() = Some(peer_id.clone());
                            self.collect_discovered(&frame);
                            if let Some(hs) = self.handshake.lock().take() {
                                let _ = hs.send(Ok(frame.clone()));
                            }
                        } else {
                            let cause = DamError::new(
                                ErrorKind::Unauthorized,
                                format!("incompatible protocol version {version}"),
                            );
                            if let Some(hs) = self.handshake.lock().take() {
                                let _ = hs.send(Err(cause));
                            }
                        }
                    } else if self.state().is_ready() {
                        // Ack of a keep-alive probe: the tracker resolves it.
                        let event = RelayEvent {
                            relay_id: self.id.clone(),
                            frame: frame.clone(),
                        };
                        if self.events.send(event).await.is_err() {
                            break;
                        }
                    }
                }
                Body::Bye { peer_id } => {
                    debug!(relay = %self.id, peer = %peer_id, "peer said bye");
                    self.set_state(SessionState::Closed);
                    break;
                }
                _ => {
                    // Handshake atomicity: user frames flow only in Ready.
                    if self.state().is_ready() {
                        let event = RelayEvent {
                            relay_id: self.id.clone(),
                            frame,
                        };
                        if self.events.send(event).await.is_err() {
                            break;
                        }
                    }
                }
            }
        }
        // Inbound ended: either we closed deliberately or the peer vanished.
        if !self.state().is_terminal() {
            if self.state() == SessionState::Closing {
                self.set_state(SessionState::Closed);
            } else {
                self.fail(DamError::new(ErrorKind::Network, "connection lost"));
            }
        }
    }

    fn collect_discovered(&self, frame: &Frame) {
        if let Some(serde_json::Value::Array(urls)) = frame.extra.get("peers") {
            let mut discovered = self.discovered.lock();
            for url in urls {
                if let Some(url) = url.as_str() {
                    if !discovered.iter().any(|u| u == url) {
                        discovered.push(url.to_string());
                    }
                }
            }
        }
    }

    /// Enqueue a user frame. Errors when the session is not `Ready`; a full
    /// outbound queue surfaces as backpressure.
    pub fn send(&self, frame: &Frame) -> MeshResult<()> {
        if !self.state().is_ready() {
            return Err(MeshError::Network(format!(
                "session {} not ready ({:?})",
                self.id,
                self.state()
            )));
        }
        let outbound = self.outbound.lock();
        let tx = outbound
            .as_ref()
            .ok_or_else(|| MeshError::Network(format!("session {} has no link", self.id)))?;
        tx.try_send(frame.encode_string()).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => {
                MeshError::Backpressure(format!("outbound queue full for {}", self.id))
            }
            mpsc::error::TrySendError::Closed(_) => {
                MeshError::Network(format!("session {} link closed", self.id))
            }
        })
    }

    /// Graceful close: best-effort bye, then tear the link down. Idempotent.
    pub async fn close(&self) {
        if self.state().is_terminal() {
            return;
        }
        self.set_state(SessionState::Closing);
        let outbound = self.outbound.lock().take();
        if let Some(tx) = outbound {
            let bye = session::bye_frame(&self.local_peer_id);
            let _ = tx.try_send(bye.encode_string());
        }
        let _ = self.transport.disconnect().await;
        self.set_state(SessionState::Closed);
    }
}

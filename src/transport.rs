//! Transport contract
//!
//! Transports move raw frames and know nothing about graph semantics. A
//! [`Transport`] produces a [`TransportConn`]: a bounded outbound channel, a
//! bounded inbound channel, and a watch of the link state. Dropping the
//! outbound sender closes the link.
//!
//! [`memory_pair`] wires two in-process endpoints back to back and is the
//! canonical transport for tests, the way `MemoryStorage` is for storage.

use crate::error::{MeshError, MeshResult};
use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};

/// Default per-session queue bound, both directions.
pub const DEFAULT_QUEUE_CAPACITY: usize = 1024;

/// Transport-level link state.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LinkState {
    Connecting,
    Ready,
    Closed,
    Failed,
}

/// A live connection: send by pushing raw strings, receive by draining the
/// inbound channel, observe the link through the state watch.
pub struct TransportConn {
    pub outbound: mpsc::Sender<String>,
    pub inbound: mpsc::Receiver<String>,
    pub state: watch::Receiver<LinkState>,
}

#[async_trait]
pub trait Transport: Send + Sync {
    /// Open the link. Returns a connection once frames can flow.
    async fn connect(&self) -> MeshResult<TransportConn>;

    /// Tear the link down. Idempotent; a never-connected transport is fine.
    async fn disconnect(&self) -> MeshResult<()>;

    /// Address of the far side, for logs and pool bookkeeping.
    fn url(&self) -> &str;
}

struct MemoryWiring {
    to_peer: mpsc::Sender<String>,
    from_peer: mpsc::Receiver<String>,
}

/// One endpoint of an in-process transport pair.
pub struct MemoryTransport {
    label: String,
    wiring: Mutex<Option<MemoryWiring>>,
    state_tx: watch::Sender<LinkState>,
    state_rx: watch::Receiver<LinkState>,
}

impl MemoryTransport {
    fn new(label: String, wiring: MemoryWiring) -> Self {
        let (state_tx, state_rx) = watch::channel(LinkState::Connecting);
        Self {
            label,
            wiring: Mutex::new(Some(wiring)),
            state_tx,
            state_rx,
        }
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn connect(&self) -> MeshResult<TransportConn> {
        let wiring = self
            .wiring
            .lock()
            .take()
            .ok_or_else(|| MeshError::Network(format!("{} already connected", self.label)))?;
        let _ = self.state_tx.send(LinkState::Ready);

        // Forward caller frames into the peer's inbound queue; stop on close.
        let (out_tx, mut out_rx) = mpsc::channel::<String>(DEFAULT_QUEUE_CAPACITY);
        let to_peer = wiring.to_peer;
        let state_tx = self.state_tx.clone();
        tokio::spawn(async move {
            while let Some(raw) = out_rx.recv().await {
                if to_peer.send(raw).await.is_err() {
                    break;
                }
            }
            let _ = state_tx.send(LinkState::Closed);
        });

        Ok(TransportConn {
            outbound: out_tx,
            inbound: wiring.from_peer,
            state: self.state_rx.clone(),
        })
    }

    async fn disconnect(&self) -> MeshResult<()> {
        self.wiring.lock().take();
        let _ = self.state_tx.send(LinkState::Closed);
        Ok(())
    }

    fn url(&self) -> &str {
        &self.label
    }
}

/// Two in-process endpoints wired back to back.
pub fn memory_pair() -> (MemoryTransport, MemoryTransport) {
    memory_pair_named("memory://a", "memory://b")
}

pub fn memory_pair_named(a: &str, b: &str) -> (MemoryTransport, MemoryTransport) {
    let (a_tx, a_rx) = mpsc::channel(DEFAULT_QUEUE_CAPACITY);
    let (b_tx, b_rx) = mpsc::channel(DEFAULT_QUEUE_CAPACITY);
    let side_a = MemoryTransport::new(
        a.to_string(),
        MemoryWiring {
            to_peer: b_tx,
            from_peer: a_rx,
        },
    );
    let side_b = MemoryTransport::new(
        b.to_string(),
        MemoryWiring {
            to_peer: a_tx,
            from_peer: b_rx,
        },
    );
    (side_a, side_b)
}

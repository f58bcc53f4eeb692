//! WebSocket transport
//!
//! Implements the transport contract over tokio-tungstenite: one text message
//! per frame, bounded queues both directions, link state reported through the
//! watch channel. The listener side accepts inbound connections and hands each
//! one back as a ready-wired transport, so a serving engine can register it
//! with its relay pool like any other session.

use crate::error::{MeshError, MeshResult};
use crate::transport::{LinkState, Transport, TransportConn, DEFAULT_QUEUE_CAPACITY};
use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch, Notify};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{accept_async, connect_async, WebSocketStream};
use tracing::{debug, warn};
use url::Url;

/// Client-side websocket transport for a relay URL.
pub struct WebSocketTransport {
    url: String,
    shutdown: Arc<Notify>,
}

impl WebSocketTransport {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            shutdown: Arc::new(Notify::new()),
        }
    }
}

#[async_trait]
impl Transport for WebSocketTransport {
    async fn connect(&self) -> MeshResult<TransportConn> {
        // Accept http(s) URLs for convenience.
        let ws_url = self
            .url
            .replace("http://", "ws://")
            .replace("https://", "wss://");
        let parsed = Url::parse(&ws_url)?;
        let (stream, _response) = connect_async(parsed).await.map_err(|e| {
            MeshError::Network(format!("websocket connect to {ws_url} failed: {e}"))
        })?;
        Ok(wire_stream(stream, self.shutdown.clone()))
    }

    async fn disconnect(&self) -> MeshResult<()> {
        self.shutdown.notify_waiters();
        Ok(())
    }

    fn url(&self) -> &str {
        &self.url
    }
}

/// Split a websocket stream into the bounded channel pair of the transport
/// contract and spawn its pump tasks.
fn wire_stream<S>(stream: WebSocketStream<S>, shutdown: Arc<Notify>) -> TransportConn
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (mut write, mut read) = stream.split();
    let (out_tx, mut out_rx) = mpsc::channel::<String>(DEFAULT_QUEUE_CAPACITY);
    let (in_tx, in_rx) = mpsc::channel::<String>(DEFAULT_QUEUE_CAPACITY);
    let (state_tx, state_rx) = watch::channel(LinkState::Ready);

    let writer_state = state_tx.clone();
    let writer_shutdown = shutdown.clone();
    tokio::spawn(async move {
        loop {
            tokio::select! {
                msg = out_rx.recv() => match msg {
                    Some(raw) => {
                        if let Err(e) = write.send(Message::Text(raw)).await {
                            warn!(error = %e, "websocket send failed");
                            let _ = writer_state.send(LinkState::Failed);
                            break;
                        }
                    }
                    None => {
                        let _ = write.send(Message::Close(None)).await;
                        let _ = writer_state.send(LinkState::Closed);
                        break;
                    }
                },
                _ = writer_shutdown.notified() => {
                    let _ = write.send(Message::Close(None)).await;
                    let _ = writer_state.send(LinkState::Closed);
                    break;
                }
            }
        }
    });

    tokio::spawn(async move {
        while let Some(msg) = read.next().await {
            match msg {
                Ok(Message::Text(text)) => {
                    if in_tx.send(text).await.is_err() {
                        break;
                    }
                }
                Ok(Message::Close(_)) => {
                    debug!("websocket peer closed");
                    break;
                }
                Err(e) => {
                    warn!(error = %e, "websocket read failed");
                    let _ = state_tx.send(LinkState::Failed);
                    break;
                }
                _ => {}
            }
        }
        if *state_tx.borrow() == LinkState::Ready {
            let _ = state_tx.send(LinkState::Closed);
        }
    });

    TransportConn {
        outbound: out_tx,
        inbound: in_rx,
        state: state_rx,
    }
}

/// An accepted inbound connection, already wired; `connect` hands it over once.
pub struct AcceptedWebSocket {
    url: String,
    conn: Mutex<Option<TransportConn>>,
    shutdown: Arc<Notify>,
}

#[async_trait]
impl Transport for AcceptedWebSocket {
    async fn connect(&self) -> MeshResult<TransportConn> {
        self.conn
            .lock()
            .take()
            .ok_or_else(|| MeshError::Network(format!("{} already connected", self.url)))
    }

    async fn disconnect(&self) -> MeshResult<()> {
        self.shutdown.notify_waiters();
        Ok(())
    }

    fn url(&self) -> &str {
        &self.url
    }
}

/// Listening side for engines that serve as relays.
pub struct WebSocketListener {
    listener: TcpListener,
    local_addr: SocketAddr,
}

impl WebSocketListener {
    pub async fn bind(addr: &str) -> MeshResult<Self> {
        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;
        debug!(%local_addr, "websocket listener bound");
        Ok(Self {
            listener,
            local_addr,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Accept one connection and return it as a transport.
    pub async fn accept(&self) -> MeshResult<Arc<AcceptedWebSocket>> {
        let (stream, addr) = self.listener.accept().await?;
        let ws = accept_async(stream)
            .await
            .map_err(|e| MeshError::Network(format!("websocket accept failed: {e}")))?;
        let shutdown = Arc::new(Notify::new());
        let conn = wire_stream(ws, shutdown.clone());
        Ok(Arc::new(AcceptedWebSocket {
            url: format!("ws://{addr}"),
            conn: Mutex::new(Some(conn)),
            shutdown,
        }))
    }
}

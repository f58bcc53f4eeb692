//! Handshake and session states
//!
//! A connection becomes a session through one `hi`/`hi-ack` exchange: each side
//! announces its protocol version and peer id, and the reply carries `#` set to
//! the original `@`. User frames flow only in `Ready`. A session that does not
//! reach `Ready` within the handshake deadline is closed with a timeout.

use crate::wire::{Body, Frame};
use std::time::Duration;

/// Protocol version announced in `hi` frames.
pub const PROTOCOL_VERSION: &str = "1.0.0";

/// Versions with a different major that are nevertheless accepted.
pub const COMPATIBLE_VERSIONS: &[&str] = &["0.9.0", "0.9.1"];

/// Handshake must complete within this window.
pub const HANDSHAKE_DEADLINE: Duration = Duration::from_secs(3);

/// Session lifecycle. `Failed` is terminal and carries its cause at the relay.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionState {
    Connecting,
    HandshakeSent,
    Ready,
    Closing,
    Closed,
    Failed,
}

impl SessionState {
    /// Whether user-level frames may flow.
    pub fn is_ready(&self) -> bool {
        matches!(self, SessionState::Ready)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionState::Closed | SessionState::Failed)
    }
}

/// Accept a remote version if its major matches ours, or if the static
/// compatibility table declares it compatible.
pub fn version_accepted(local: &str, remote: &str) -> bool {
    if COMPATIBLE_VERSIONS.contains(&remote) {
        return true;
    }
    match (major_of(local), major_of(remote)) {
        (Some(l), Some(r)) => l == r,
        _ => false,
    }
}

fn major_of(version: &str) -> Option<u64> {
    version.split('.').next()?.parse().ok()
}

/// Opening `hi` for a fresh connection.
pub fn hi_frame(peer_id: &str) -> Frame {
    Frame::new(Body::Hi {
        version: PROTOCOL_VERSION.to_string(),
        peer_id: peer_id.to_string(),
    })
}

/// Reply to a peer's `hi`, correlated on its id.
pub fn hi_ack(peer_id: &str, their_hi: &Frame) -> Frame {
    hi_frame(peer_id).acking(their_hi.id.clone())
}

/// Best-effort goodbye.
pub fn bye_frame(peer_id: &str) -> Frame {
    Frame::new(Body::Bye {
        peer_id: peer_id.to_string(),
    })
}

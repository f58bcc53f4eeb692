//! DAM error handling: wire round trip, retry policy, telemetry
//!
//! `dam` frames carry typed errors between peers. This module owns the mapping in
//! both directions, the per-kind retry schedules, and the telemetry surface
//! (per-kind counters, a bounded ring of recent errors, and a broadcast stream).

use crate::error::{DamError, ErrorKind, MeshError, MeshResult};
use crate::wire::{Body, Frame};
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::time::Duration;
use tokio::sync::broadcast;

/// Build a `dam` frame for an error, optionally acknowledging the frame that
/// provoked it. The frame id is the error id, so the pair round-trips.
pub fn to_dam(error: &DamError, original_id: Option<&str>) -> Frame {
    let mut frame = Frame::with_id(
        Body::Dam {
            error: error.clone(),
        },
        error.error_id.clone(),
    );
    let ack = original_id
        .map(String::from)
        .or_else(|| match error.context.get("ackId") {
            Some(serde_json::Value::String(s)) => Some(s.clone()),
            _ => None,
        });
    if let Some(ack) = ack {
        frame = frame.acking(ack);
    }
    frame
}

/// Extract the error from a `dam` frame.
pub fn from_dam(frame: &Frame) -> MeshResult<DamError> {
    match &frame.body {
        Body::Dam { error } => Ok(error.clone()),
        _ => Err(MeshError::Malformed(format!(
            "expected dam frame, got {}",
            frame.kind()
        ))),
    }
}

/// Per-kind retry schedules.
///
/// | kind     | schedule                              |
/// |----------|---------------------------------------|
/// | Timeout  | 1000 * 2^(attempt-1) ms, capped 32 s  |
/// | Network  | 500 * attempt ms, capped 5 s          |
/// | Conflict | 250 ms constant, max 3 attempts       |
/// | Storage  | 500 ms constant, max 2 attempts       |
/// | others   | not retried                           |
pub struct RetryPolicy;

impl RetryPolicy {
    pub fn retryable(kind: ErrorKind) -> bool {
        matches!(
            kind,
            ErrorKind::Timeout | ErrorKind::Network | ErrorKind::Conflict | ErrorKind::Storage
        )
    }

    /// Delay before retry number `attempt` (1-based), or `None` when the kind is
    /// not retryable or its attempt budget is spent.
    pub fn delay_for(kind: ErrorKind, attempt: u32) -> Option<Duration> {
        if attempt == 0 {
            return None;
        }
        match kind {
            ErrorKind::Timeout => {
                let exp = attempt.saturating_sub(1).min(16);
                let ms = 1000u64.saturating_mul(1 << exp).min(32_000);
                Some(Duration::from_millis(ms))
            }
            ErrorKind::Network => {
                let ms = 500u64.saturating_mul(attempt as u64).min(5_000);
                Some(Duration::from_millis(ms))
            }
            ErrorKind::Conflict if attempt <= 3 => Some(Duration::from_millis(250)),
            ErrorKind::Storage if attempt <= 2 => Some(Duration::from_millis(500)),
            _ => None,
        }
    }
}

/// How many recent errors the telemetry ring keeps.
const RING_CAPACITY: usize = 64;

/// Error telemetry: counters, recent ring, event stream.
pub struct ErrorStats {
    counts: Mutex<HashMap<ErrorKind, u64>>,
    ring: Mutex<VecDeque<DamError>>,
    stream: broadcast::Sender<DamError>,
}

impl ErrorStats {
    pub fn new() -> Self {
        let (stream, _) = broadcast::channel(RING_CAPACITY);
        Self {
            counts: Mutex::new(HashMap::new()),
            ring: Mutex::new(VecDeque::new()),
            stream,
        }
    }

    pub fn record(&self, error: &DamError) {
        *self.counts.lock().entry(error.kind).or_insert(0) += 1;
        {
            let mut ring = self.ring.lock();
            if ring.len() >= RING_CAPACITY {
                ring.pop_front();
            }
            ring.push_back(error.clone());
        }
        // Nobody listening is fine.
        let _ = self.stream.send(error.clone());
    }

    pub fn count(&self, kind: ErrorKind) -> u64 {
        self.counts.lock().get(&kind).copied().unwrap_or(0)
    }

    pub fn total(&self) -> u64 {
        self.counts.lock().values().sum()
    }

    /// Recent errors, oldest first.
    pub fn recent(&self) -> Vec<DamError> {
        self.ring.lock().iter().cloned().collect()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<DamError> {
        self.stream.subscribe()
    }
}

impl Default for ErrorStats {
    fn default() -> Self {
        Self::new()
    }
}

//! In-flight message tracking
//!
//! Every tracked outbound frame gets a pending entry holding its deadline and a
//! promise sink. Inbound frames are classified in one step: a frame whose `#`
//! names a pending id resolves that promise (ack or dam); anything else is either
//! new or a duplicate, judged by the bounded id LRU.
//!
//! The pending map is bounded; tracking beyond capacity is backpressure, not
//! silent growth. Cancellation removes the entry immediately, so no timer can
//! fire for a cancelled request.

use crate::dam::RetryPolicy;
use crate::dup::Dup;
use crate::error::{DamError, ErrorKind, MeshError, MeshResult};
use crate::wire::{Body, Frame};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::oneshot;
use tracing::debug;

/// Final outcome of a tracked frame.
#[derive(Debug)]
pub enum Outcome {
    /// A peer acknowledged with this frame.
    Ack(Frame),
    /// A peer answered with an error.
    Dam(DamError),
    /// No answer within the deadline (after any retries).
    Timeout,
    /// The caller cancelled the request.
    Cancelled,
}

/// Classification of an inbound frame.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Classified {
    /// First sighting; process it.
    New,
    /// Recently seen id; drop it.
    Duplicate,
    /// Acknowledged a pending frame; the promise has been resolved.
    Reply,
}

/// A frame due for retransmission after its backoff delay.
#[derive(Debug)]
pub struct RetryDirective {
    pub frame: Frame,
    pub attempt: u32,
    pub delay: Duration,
}

#[derive(Clone, Debug)]
pub struct TrackerConfig {
    /// Max concurrently pending frames.
    pub capacity: usize,
    /// Deadline for get/put frames.
    pub default_deadline: Duration,
    /// Deadline for handshake frames.
    pub handshake_deadline: Duration,
    /// Transparent retry budget per frame.
    pub max_attempts: u32,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            capacity: 512,
            default_deadline: Duration::from_secs(5),
            handshake_deadline: Duration::from_secs(3),
            max_attempts: 5,
        }
    }
}

/// Counters, readable at any time.
#[derive(Default)]
pub struct TrackerStats {
    pub sent: AtomicU64,
    pub acked: AtomicU64,
    pub damned: AtomicU64,
    pub timed_out: AtomicU64,
    pub retried: AtomicU64,
    pub cancelled: AtomicU64,
    pub duplicates: AtomicU64,
}

struct Pending {
    frame: Frame,
    sent_at: Instant,
    deadline: Instant,
    attempts: u32,
    sink: oneshot::Sender<Outcome>,
}

pub struct Tracker {
    pending: Mutex<HashMap<String, Pending>>,
    seen: Dup,
    config: TrackerConfig,
    pub stats: TrackerStats,
}

impl Tracker {
    pub fn new(config: TrackerConfig) -> Self {
        Self {
            pending: Mutex::new(HashMap::new()),
            seen: Dup::new_default(),
            config,
            stats: TrackerStats::default(),
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(TrackerConfig::default())
    }

    pub fn deadline_for(&self, frame: &Frame) -> Duration {
        match frame.body {
            Body::Hi { .. } | Body::Bye { .. } => self.config.handshake_deadline,
            _ => self.config.default_deadline,
        }
    }

    /// Register an outbound frame and get a promise for its outcome.
    ///
    /// The caller still sends the frame itself; tracking and transport are
    /// deliberately decoupled so one frame can fan out to many peers while being
    /// tracked once.
    pub fn track(&self, frame: &Frame) -> MeshResult<oneshot::Receiver<Outcome>> {
        let mut pending = self.pending.lock();
        if pending.len() >= self.config.capacity {
            return Err(MeshError::Backpressure(format!(
                "{} frames already in flight",
                pending.len()
            )));
        }
        let (tx, rx) = oneshot::channel();
        let now = Instant::now();
        pending.insert(
            frame.id.clone(),
            Pending {
                frame: frame.clone(),
                sent_at: now,
                deadline: now + self.deadline_for(frame),
                attempts: 1,
                sink: tx,
            },
        );
        self.stats.sent.fetch_add(1, Ordering::Relaxed);
        Ok(rx)
    }

    /// Classify an inbound frame, resolving any pending promise it answers.
    pub fn on_inbound(&self, frame: &Frame) -> Classified {
        if let Some(ack) = &frame.ack {
            let entry = self.pending.lock().remove(ack);
            if let Some(entry) = entry {
                // Remember the reply id too, so re-deliveries are duplicates.
                self.seen.track(&frame.id);
                let rtt = entry.sent_at.elapsed();
                debug!(id = %ack, kind = frame.kind(), ?rtt, "reply for pending frame");
                let outcome = match &frame.body {
                    Body::Dam { error } => {
                        self.stats.damned.fetch_add(1, Ordering::Relaxed);
                        Outcome::Dam(error.clone())
                    }
                    _ => {
                        self.stats.acked.fetch_add(1, Ordering::Relaxed);
                        Outcome::Ack(frame.clone())
                    }
                };
                let _ = entry.sink.send(outcome);
                return Classified::Reply;
            }
        }
        if self.seen.seen_before(&frame.id) {
            self.stats.duplicates.fetch_add(1, Ordering::Relaxed);
            Classified::Duplicate
        } else {
            Classified::New
        }
    }

    /// Round-trip time of a pending frame, if still pending.
    pub fn age_of(&self, id: &str) -> Option<Duration> {
        self.pending.lock().get(id).map(|p| p.sent_at.elapsed())
    }

    /// Cancel a pending frame. Frees the entry; the promise resolves
    /// `Cancelled`. Returns whether anything was pending under the id.
    pub fn cancel(&self, id: &str) -> bool {
        match self.pending.lock().remove(id) {
            Some(entry) => {
                self.stats.cancelled.fetch_add(1, Ordering::Relaxed);
                let _ = entry.sink.send(Outcome::Cancelled);
                true
            }
            None => false,
        }
    }

    /// Sweep expired entries.
    ///
    /// Retry-eligible frames (timeouts are, per the retry table) are rescheduled
    /// with exponential backoff and returned for retransmission; exhausted ones
    /// resolve `Timeout`.
    pub fn expire_due(&self) -> Vec<RetryDirective> {
        let now = Instant::now();
        let mut directives = Vec::new();
        let mut expired = Vec::new();
        {
            let mut pending = self.pending.lock();
            let due: Vec<String> = pending
                .iter()
                .filter(|(_, p)| p.deadline <= now)
                .map(|(id, _)| id.clone())
                .collect();
            for id in due {
                let entry = pending.get_mut(&id).expect("due id still present");
                let next_attempt = entry.attempts + 1;
                let delay = if next_attempt <= self.config.max_attempts {
                    RetryPolicy::delay_for(ErrorKind::Timeout, entry.attempts)
                } else {
                    None
                };
                match delay {
                    Some(delay) => {
                        entry.attempts = next_attempt;
                        entry.deadline = now + delay + self.deadline_for(&entry.frame);
                        self.stats.retried.fetch_add(1, Ordering::Relaxed);
                        directives.push(RetryDirective {
                            frame: entry.frame.clone(),
                            attempt: next_attempt,
                            delay,
                        });
                    }
                    None => {
                        expired.push(pending.remove(&id).expect("due id still present"));
                    }
                }
            }
        }
        for entry in expired {
            self.stats.timed_out.fetch_add(1, Ordering::Relaxed);
            let _ = entry.sink.send(Outcome::Timeout);
        }
        directives
    }

    pub fn pending_len(&self) -> usize {
        self.pending.lock().len()
    }

    pub fn is_pending(&self, id: &str) -> bool {
        self.pending.lock().contains_key(id)
    }
}

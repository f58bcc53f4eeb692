//! Subscription bus
//!
//! Keyed multicast of committed changes. Subscribers register on a soul (or a
//! soul prefix) and receive every later commit to it, in commit order for any
//! single soul. Each subscriber owns a bounded queue; a slow consumer either
//! loses its oldest events or is disconnected, per the configured policy.
//! Unsubscription is a flag flip and never blocks commits.

use crate::node::Node;
use parking_lot::{Mutex, RwLock};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;

/// Default per-subscriber queue capacity.
pub const DEFAULT_QUEUE_CAPACITY: usize = 256;

/// What to do with a subscriber whose queue is full.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OverflowPolicy {
    /// Drop the oldest queued event to make room.
    DropOldest,
    /// Disconnect the subscriber.
    Disconnect,
}

/// A committed change, as delivered to subscribers.
#[derive(Clone, Debug)]
pub struct ChangeEvent {
    pub soul: String,
    pub node: Node,
    pub changed: Vec<String>,
}

struct SubscriberInner {
    id: u64,
    queue: Mutex<VecDeque<ChangeEvent>>,
    notify: Notify,
    capacity: usize,
    policy: OverflowPolicy,
    closed: AtomicBool,
}

impl SubscriberInner {
    fn push(&self, event: ChangeEvent) {
        if self.closed.load(Ordering::Acquire) {
            return;
        }
        {
            let mut queue = self.queue.lock();
            if queue.len() >= self.capacity {
                match self.policy {
                    OverflowPolicy::DropOldest => {
                        queue.pop_front();
                    }
                    OverflowPolicy::Disconnect => {
                        queue.clear();
                        drop(queue);
                        self.closed.store(true, Ordering::Release);
                        self.notify.notify_waiters();
                        return;
                    }
                }
            }
            queue.push_back(event);
        }
        self.notify.notify_one();
    }
}

/// Handle for one subscription. Dropping it unsubscribes.
pub struct Subscription {
    inner: Arc<SubscriberInner>,
}

impl Subscription {
    /// Next event, in commit order for any single soul. `None` once the
    /// subscription is closed and its queue drained.
    pub async fn recv(&mut self) -> Option<ChangeEvent> {
        loop {
            if let Some(event) = self.inner.queue.lock().pop_front() {
                return Some(event);
            }
            if self.inner.closed.load(Ordering::Acquire) {
                return None;
            }
            self.inner.notify.notified().await;
        }
    }

    /// Non-blocking variant of [`recv`](Self::recv).
    pub fn try_recv(&mut self) -> Option<ChangeEvent> {
        self.inner.queue.lock().pop_front()
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    /// Stop receiving. O(1); pending events are discarded.
    pub fn close(&self) {
        self.inner.closed.store(true, Ordering::Release);
        self.inner.queue.lock().clear();
        self.inner.notify.notify_waiters();
    }

    pub fn queued(&self) -> usize {
        self.inner.queue.lock().len()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.close();
    }
}

struct Registry {
    exact: HashMap<String, Vec<Arc<SubscriberInner>>>,
    prefix: Vec<(String, Arc<SubscriberInner>)>,
}

/// The bus itself. Shared between the store (publisher) and any number of
/// subscribers.
pub struct SubscriptionBus {
    registry: RwLock<Registry>,
    next_id: AtomicU64,
    capacity: usize,
    policy: OverflowPolicy,
}

impl SubscriptionBus {
    pub fn new() -> Self {
        Self::with_config(DEFAULT_QUEUE_CAPACITY, OverflowPolicy::DropOldest)
    }

    pub fn with_config(capacity: usize, policy: OverflowPolicy) -> Self {
        Self {
            registry: RwLock::new(Registry {
                exact: HashMap::new(),
                prefix: Vec::new(),
            }),
            next_id: AtomicU64::new(0),
            capacity: capacity.max(1),
            policy,
        }
    }

    fn new_subscriber(&self) -> Arc<SubscriberInner> {
        Arc::new(SubscriberInner {
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            queue: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
            capacity: self.capacity,
            policy: self.policy,
            closed: AtomicBool::new(false),
        })
    }

    /// Subscribe to commits on one soul.
    pub fn subscribe(&self, soul: &str) -> Subscription {
        let inner = self.new_subscriber();
        let mut registry = self.registry.write();
        Self::sweep(&mut registry);
        registry
            .exact
            .entry(soul.to_string())
            .or_default()
            .push(inner.clone());
        Subscription { inner }
    }

    /// Subscribe to commits on every soul starting with a prefix.
    pub fn subscribe_prefix(&self, prefix: &str) -> Subscription {
        let inner = self.new_subscriber();
        let mut registry = self.registry.write();
        Self::sweep(&mut registry);
        registry.prefix.push((prefix.to_string(), inner.clone()));
        Subscription { inner }
    }

    /// Deliver a commit to every matching subscriber. Called by the store under
    /// its per-soul lock, which is what makes per-soul delivery ordered.
    pub fn publish(&self, event: &ChangeEvent) {
        let targets: Vec<Arc<SubscriberInner>> = {
            let registry = self.registry.read();
            let mut targets = Vec::new();
            if let Some(subs) = registry.exact.get(&event.soul) {
                targets.extend(subs.iter().cloned());
            }
            for (prefix, sub) in &registry.prefix {
                if event.soul.starts_with(prefix.as_str()) {
                    targets.push(sub.clone());
                }
            }
            targets
        };
        let mut delivered = std::collections::HashSet::new();
        for sub in targets {
            if delivered.insert(sub.id) {
                sub.push(event.clone());
            }
        }
    }

    /// Live subscriber count for a soul (closed ones are swept lazily).
    pub fn subscriber_count(&self, soul: &str) -> usize {
        let registry = self.registry.read();
        let exact = registry
            .exact
            .get(soul)
            .map(|subs| {
                subs.iter()
                    .filter(|s| !s.closed.load(Ordering::Acquire))
                    .count()
            })
            .unwrap_or(0);
        let prefix = registry
            .prefix
            .iter()
            .filter(|(p, s)| soul.starts_with(p.as_str()) && !s.closed.load(Ordering::Acquire))
            .count();
        exact + prefix
    }

    fn sweep(registry: &mut Registry) {
        registry.exact.retain(|_, subs| {
            subs.retain(|s| !s.closed.load(Ordering::Acquire));
            !subs.is_empty()
        });
        registry
            .prefix
            .retain(|(_, s)| !s.closed.load(Ordering::Acquire));
    }
}

impl Default for SubscriptionBus {
    fn default() -> Self {
        Self::new()
    }
}

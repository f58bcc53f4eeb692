//! Message deduplication
//!
//! Tracks recently seen message ids so the same frame is processed at most once
//! as it echoes around the mesh. Entries expire by age, and the tracker holds a
//! bounded number of ids, evicting the oldest when full.

use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

/// Bounded LRU of recently seen message ids.
///
/// Defaults: 999 ids, 9 second horizon.
pub struct Dup {
    inner: Mutex<DupInner>,
    max_age: Duration,
    max_size: usize,
}

struct DupInner {
    seen: HashMap<String, Instant>,
    order: VecDeque<String>,
}

impl Dup {
    pub fn new(max_size: usize, max_age_ms: u64) -> Self {
        Self {
            inner: Mutex::new(DupInner {
                seen: HashMap::new(),
                order: VecDeque::new(),
            }),
            max_age: Duration::from_millis(max_age_ms),
            max_size,
        }
    }

    pub fn new_default() -> Self {
        Self::new(999, 9000)
    }

    /// Whether the id was seen within the age horizon.
    pub fn check(&self, id: &str) -> bool {
        let inner = self.inner.lock();
        match inner.seen.get(id) {
            Some(was) => was.elapsed() < self.max_age,
            None => false,
        }
    }

    /// Mark an id as seen, evicting expired and oldest entries as needed.
    pub fn track(&self, id: &str) {
        let mut inner = self.inner.lock();
        let now = Instant::now();
        if inner.seen.len() >= self.max_size {
            Self::evict(&mut inner, self.max_age, self.max_size);
        }
        if inner.seen.insert(id.to_string(), now).is_none() {
            inner.order.push_back(id.to_string());
        }
    }

    /// Check and track in one step; returns true when the id was a duplicate.
    pub fn seen_before(&self, id: &str) -> bool {
        let dup = self.check(id);
        self.track(id);
        dup
    }

    pub fn len(&self) -> usize {
        self.inner.lock().seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop all entries older than the age horizon.
    pub fn purge_expired(&self) {
        let mut inner = self.inner.lock();
        let max_age = self.max_age;
        inner.seen.retain(|_, was| was.elapsed() < max_age);
        let seen = std::mem::take(&mut inner.seen);
        inner.order.retain(|id| seen.contains_key(id));
        inner.seen = seen;
    }

    fn evict(inner: &mut DupInner, max_age: Duration, max_size: usize) {
        let seen = &mut inner.seen;
        seen.retain(|_, was| was.elapsed() < max_age);
        inner.order.retain(|id| seen.contains_key(id));
        // Still full after expiry: drop the oldest ids.
        while seen.len() >= max_size {
            match inner.order.pop_front() {
                Some(oldest) => {
                    seen.remove(&oldest);
                }
                None => break,
            }
        }
    }
}

impl Default for Dup {
    fn default() -> Self {
        Self::new_default()
    }
}

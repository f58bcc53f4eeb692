//! State module - timestamps and machine identity for conflict resolution
//!
//! HAM timestamps are integer milliseconds since the Unix epoch. Two writes inside
//! the same millisecond must still advance, so the clock bumps past its last issued
//! value instead of repeating it. The machine identity (a stable random id plus a
//! strictly increasing counter) breaks ties between replicas that produced the same
//! timestamp.

use parking_lot::Mutex;
use rand::Rng;

const ALPHANUMERIC: &[u8] = b"0123456789ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz";

/// Length of a machine id.
pub const MACHINE_ID_LEN: usize = 8;

/// Generate a random alphanumeric token (message ids, set tokens, machine ids).
pub fn random_token(length: usize) -> String {
    let mut rng = rand::thread_rng();
    (0..length)
        .map(|_| {
            let idx = rng.gen_range(0..ALPHANUMERIC.len());
            ALPHANUMERIC[idx] as char
        })
        .collect()
}

/// Monotone HAM clock.
///
/// Returns wall-clock milliseconds, bumped by one whenever the wall clock has not
/// advanced since the previous call. Always strictly increasing per instance.
#[derive(Debug)]
pub struct HamClock {
    last: Mutex<u64>,
}

impl HamClock {
    pub fn new() -> Self {
        Self { last: Mutex::new(0) }
    }

    /// Next timestamp, strictly greater than any previously issued by this clock.
    pub fn next(&self) -> u64 {
        let wall = chrono::Utc::now().timestamp_millis().max(0) as u64;
        let mut last = self.last.lock();
        *last = if wall > *last { wall } else { *last + 1 };
        *last
    }

    /// Current wall-clock ms without advancing the clock.
    pub fn wall(&self) -> u64 {
        chrono::Utc::now().timestamp_millis().max(0) as u64
    }
}

impl Default for HamClock {
    fn default() -> Self {
        Self::new()
    }
}

/// Per-replica identity: stable random id plus a strictly increasing write counter.
///
/// Instance-scoped: two engines in one process carry independent identities.
#[derive(Debug)]
pub struct MachineIdentity {
    id: String,
    counter: Mutex<u64>,
}

impl MachineIdentity {
    pub fn new() -> Self {
        Self {
            id: random_token(MACHINE_ID_LEN),
            counter: Mutex::new(0),
        }
    }

    /// Fixed id for deterministic tests.
    pub fn with_id(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            counter: Mutex::new(0),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Mint the next machine state, strictly greater than everything seen so far.
    pub fn mint(&self) -> u64 {
        let mut counter = self.counter.lock();
        *counter += 1;
        *counter
    }

    /// Advance the counter past a machine state observed on a remote node, so the
    /// next local mint is greater than anything already merged.
    pub fn observe(&self, seen: u64) {
        let mut counter = self.counter.lock();
        if seen > *counter {
            *counter = seen;
        }
    }

    pub fn current(&self) -> u64 {
        *self.counter.lock()
    }
}

impl Default for MachineIdentity {
    fn default() -> Self {
        Self::new()
    }
}

//! Node store façade
//!
//! Every node read or written goes through [`NodeStore`]. It validates metadata
//! on the way in, runs the HAM merge against whatever is already stored, stamps
//! locally authored writes with the replica's clock and machine identity, and
//! publishes committed changes to the subscription bus.
//!
//! Load-merge-commit for any single soul is serialized through a per-soul async
//! mutex; distinct souls proceed in parallel.

use crate::bus::{ChangeEvent, SubscriptionBus};
use crate::dam::RetryPolicy;
use crate::error::{ErrorKind, MeshError, MeshResult};
use crate::ham;
use crate::node::Node;
use crate::state::{HamClock, MachineIdentity};
use crate::storage::Storage;
use crate::types::Value;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tracing::{debug, warn};

pub struct NodeStore {
    storage: Arc<dyn Storage>,
    clock: Arc<HamClock>,
    machine: Arc<MachineIdentity>,
    bus: Arc<SubscriptionBus>,
    locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl NodeStore {
    pub fn new(
        storage: Arc<dyn Storage>,
        clock: Arc<HamClock>,
        machine: Arc<MachineIdentity>,
        bus: Arc<SubscriptionBus>,
    ) -> Self {
        Self {
            storage,
            clock,
            machine,
            bus,
            locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn clock(&self) -> &Arc<HamClock> {
        &self.clock
    }

    pub fn machine(&self) -> &Arc<MachineIdentity> {
        &self.machine
    }

    pub fn bus(&self) -> &Arc<SubscriptionBus> {
        &self.bus
    }

    fn lock_for(&self, soul: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.locks.lock();
        locks
            .entry(soul.to_string())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }

    /// Fetch and validate a node. Absent nodes are `None`, not an error.
    pub async fn read(&self, soul: &str) -> MeshResult<Option<Node>> {
        match self.storage.get(soul).await? {
            Some(node) => {
                node.validate()?;
                Ok(Some(node))
            }
            None => Ok(None),
        }
    }

    /// Write a locally authored partial update.
    ///
    /// Every field in `partial` gets the same fresh HAM timestamp, and the node
    /// is stamped with this replica's machine identity. This is the single place
    /// new machine states are minted. Returns the committed node.
    pub async fn put(
        &self,
        soul: &str,
        partial: BTreeMap<String, Value>,
    ) -> MeshResult<Node> {
        if soul.is_empty() {
            return Err(MeshError::Validation("empty soul".to_string()));
        }
        let now = self.clock.next();
        let mut incoming = Node::new(soul);
        for (field, value) in partial {
            incoming.insert(field, value, now);
        }
        incoming.meta.machine_state = self.machine.mint();
        incoming.meta.machine_id = self.machine.id().to_string();
        self.commit(incoming).await
    }

    /// Merge a full node received from a peer (metadata already attached).
    pub async fn merge_in(&self, incoming: Node) -> MeshResult<Node> {
        incoming.validate()?;
        // Keep local mints ahead of anything observed remotely.
        self.machine.observe(incoming.meta.machine_state);
        self.commit(incoming).await
    }

    /// Serialized load-merge-commit. Identical re-puts with non-increasing
    /// timestamps change nothing and publish nothing.
    async fn commit(&self, incoming: Node) -> MeshResult<Node> {
        let soul = incoming.soul().to_string();
        let lock = self.lock_for(&soul);
        let _guard = lock.lock().await;

        let existing = self.storage.get(&soul).await?;
        let (merged, changed) = match &existing {
            Some(current) => {
                let merge = ham::merge_nodes(current, &incoming);
                (merge.node, merge.changed)
            }
            None => {
                let changed: Vec<String> = incoming.fields.keys().cloned().collect();
                (incoming, changed)
            }
        };
        merged.validate()?;

        if let Some(current) = &existing {
            if *current == merged {
                debug!(soul = %soul, "idempotent put, nothing to commit");
                return Ok(merged);
            }
        }

        self.write_back(&soul, &merged).await?;
        if !changed.is_empty() {
            self.bus.publish(&ChangeEvent {
                soul: soul.clone(),
                node: merged.clone(),
                changed,
            });
        }
        Ok(merged)
    }

    /// Write with the bounded storage retry schedule before giving up.
    async fn write_back(&self, soul: &str, node: &Node) -> MeshResult<()> {
        let mut attempt = 0u32;
        loop {
            match self.storage.put(soul, node).await {
                Ok(()) => return Ok(()),
                Err(e) if e.kind() == ErrorKind::Storage => {
                    attempt += 1;
                    match RetryPolicy::delay_for(ErrorKind::Storage, attempt) {
                        Some(delay) => {
                            warn!(soul = %soul, error = %e, attempt, "storage write failed, retrying");
                            tokio::time::sleep(delay).await;
                        }
                        None => return Err(e),
                    }
                }
                Err(e) => return Err(e),
            }
        }
    }

    pub async fn exists(&self, soul: &str) -> MeshResult<bool> {
        self.storage.exists(soul).await
    }

    pub async fn keys(&self, prefix: Option<&str>) -> MeshResult<Vec<String>> {
        self.storage.keys(prefix).await
    }

    pub async fn clear(&self) -> MeshResult<()> {
        self.storage.clear().await
    }

    /// Flush and release the storage adapter.
    pub async fn close(&self) -> MeshResult<()> {
        self.storage.close().await
    }
}

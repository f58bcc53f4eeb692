//! Pluggable storage backends
//!
//! The engine persists nodes through the [`Storage`] trait; two reference
//! adapters are provided:
//!
//! - **MemoryStorage**: in-memory only, canonical for tests
//! - **SledStorage**: embedded sled database; each key maps to a record envelope
//!   `{value, created_at, updated_at}` so a table-style scan by recency stays
//!   possible
//!
//! Keys are opaque strings. Adapters never interpret node contents; validation
//! and merging happen above, in [`crate::store`].

use crate::error::{MeshError, MeshResult};
use crate::node::Node;
use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Storage adapter contract.
#[async_trait]
pub trait Storage: Send + Sync {
    /// Prepare the backend for use. Idempotent.
    async fn initialize(&self) -> MeshResult<()> {
        Ok(())
    }

    /// Fetch a node by key; `None` when absent.
    async fn get(&self, key: &str) -> MeshResult<Option<Node>>;

    /// Store a node under a key, replacing any prior value.
    async fn put(&self, key: &str, node: &Node) -> MeshResult<()>;

    /// Remove a key. Removing an absent key is not an error.
    async fn delete(&self, key: &str) -> MeshResult<()>;

    async fn exists(&self, key: &str) -> MeshResult<bool> {
        Ok(self.get(key).await?.is_some())
    }

    /// All keys, optionally restricted to a prefix.
    async fn keys(&self, prefix: Option<&str>) -> MeshResult<Vec<String>>;

    /// Drop everything.
    async fn clear(&self) -> MeshResult<()>;

    /// Release resources. Idempotent.
    async fn close(&self) -> MeshResult<()> {
        Ok(())
    }
}

/// In-memory storage backend (no persistence)
///
/// Canonical adapter for tests and for engines that only need a live cache.
pub struct MemoryStorage {
    data: RwLock<HashMap<String, Node>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self {
            data: RwLock::new(HashMap::new()),
        }
    }

    pub fn len(&self) -> usize {
        self.data.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.read().is_empty()
    }
}

#[async_trait]
impl Storage for MemoryStorage {
    async fn get(&self, key: &str) -> MeshResult<Option<Node>> {
        Ok(self.data.read().get(key).cloned())
    }

    async fn put(&self, key: &str, node: &Node) -> MeshResult<()> {
        self.data.write().insert(key.to_string(), node.clone());
        Ok(())
    }

    async fn delete(&self, key: &str) -> MeshResult<()> {
        self.data.write().remove(key);
        Ok(())
    }

    async fn exists(&self, key: &str) -> MeshResult<bool> {
        Ok(self.data.read().contains_key(key))
    }

    async fn keys(&self, prefix: Option<&str>) -> MeshResult<Vec<String>> {
        let data = self.data.read();
        let mut keys: Vec<String> = match prefix {
            Some(p) => data.keys().filter(|k| k.starts_with(p)).cloned().collect(),
            None => data.keys().cloned().collect(),
        };
        keys.sort();
        Ok(keys)
    }

    async fn clear(&self) -> MeshResult<()> {
        self.data.write().clear();
        Ok(())
    }
}

impl Default for MemoryStorage {
    fn default() -> Self {
        Self::new()
    }
}

/// Record envelope stored per key in the sled adapter.
#[derive(Serialize, Deserialize)]
struct Record {
    value: serde_json::Value,
    created_at: i64,
    updated_at: i64,
}

/// Sled-based persistent storage backend
///
/// Stores one JSON record envelope per key with creation and update stamps.
pub struct SledStorage {
    db: sled::Db,
}

impl SledStorage {
    pub fn new(path: &str) -> MeshResult<Self> {
        let db = sled::open(path)?;
        Ok(Self { db })
    }

    /// Reclaim space and force outstanding writes to disk.
    pub async fn compact(&self) -> MeshResult<()> {
        self.db.flush_async().await?;
        Ok(())
    }

    /// Update stamp of a key, for recency scans; `None` when absent.
    pub fn updated_at(&self, key: &str) -> MeshResult<Option<i64>> {
        match self.db.get(key)? {
            Some(ivec) => {
                let record: Record = serde_json::from_slice(&ivec)?;
                Ok(Some(record.updated_at))
            }
            None => Ok(None),
        }
    }

    fn read_record(ivec: &sled::IVec) -> MeshResult<Record> {
        Ok(serde_json::from_slice(ivec)?)
    }
}

#[async_trait]
impl Storage for SledStorage {
    async fn get(&self, key: &str) -> MeshResult<Option<Node>> {
        match self.db.get(key)? {
            Some(ivec) => {
                let record = Self::read_record(&ivec)?;
                let node = Node::from_wire(key, &record.value)?;
                Ok(Some(node))
            }
            None => Ok(None),
        }
    }

    async fn put(&self, key: &str, node: &Node) -> MeshResult<()> {
        let now = chrono::Utc::now().timestamp_millis();
        let created_at = match self.db.get(key)? {
            Some(ivec) => Self::read_record(&ivec).map(|r| r.created_at).unwrap_or(now),
            None => now,
        };
        let record = Record {
            value: node.to_wire(),
            created_at,
            updated_at: now,
        };
        let bytes = serde_json::to_vec(&record)?;
        self.db.insert(key, bytes)?;
        self.db.flush_async().await?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> MeshResult<()> {
        self.db.remove(key)?;
        Ok(())
    }

    async fn exists(&self, key: &str) -> MeshResult<bool> {
        Ok(self.db.contains_key(key)?)
    }

    async fn keys(&self, prefix: Option<&str>) -> MeshResult<Vec<String>> {
        let iter = match prefix {
            Some(p) => self.db.scan_prefix(p),
            None => self.db.iter(),
        };
        let mut keys = Vec::new();
        for entry in iter {
            let (k, _) = entry?;
            let key = String::from_utf8(k.to_vec())
                .map_err(|e| MeshError::Storage(format!("non-utf8 key: {e}")))?;
            keys.push(key);
        }
        keys.sort();
        Ok(keys)
    }

    async fn clear(&self) -> MeshResult<()> {
        self.db.clear()?;
        Ok(())
    }

    async fn close(&self) -> MeshResult<()> {
        self.db.flush_async().await?;
        Ok(())
    }
}

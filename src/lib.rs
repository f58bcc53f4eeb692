//! # meshdb - A Realtime, Decentralized, Offline-First Graph Database
//!
//! meshdb keeps a distributed mutable graph of key-addressed nodes eventually
//! consistent across unreliable peers. Writes work locally first and stream to
//! whoever is connected; conflicts resolve deterministically per field with the
//! HAM (Hypothetical Amnesia Machine) algebra, so every replica converges on
//! the same state regardless of message order.
//!
//! ## Quick start
//!
//! ```rust,no_run
//! use meshdb::{Mesh, MeshOptions};
//! use serde_json::json;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), meshdb::MeshError> {
//!     // A local engine with in-memory storage
//!     let mesh = Mesh::new();
//!
//!     // Store data (nested mappings are flattened into linked nodes)
//!     mesh.get("users").get("alice")
//!         .put(json!({"name": "Alice", "age": 30}))
//!         .await?;
//!
//!     // Read it back
//!     if let Some(alice) = mesh.get("users").get("alice").once().await? {
//!         println!("alice: {alice}");
//!     }
//!
//!     // Subscribe to changes
//!     let mut sub = mesh.get("users").get("alice").on();
//!     tokio::spawn(async move {
//!         while let Some(event) = sub.recv().await {
//!             println!("changed: {:?}", event.changed);
//!         }
//!     });
//!
//!     // Or sync with peers over websockets
//!     let synced = Mesh::with_options(MeshOptions {
//!         peers: vec!["ws://relay.example.com".to_string()],
//!         ..Default::default()
//!     })
//!     .await?;
//!     synced.close().await?;
//!     Ok(())
//! }
//! ```
//!
//! ## Architecture
//!
//! - [`Mesh`](engine::Mesh): the engine; composes everything below
//! - [`Chain`](chain::Chain): fluent path API (get, put, once, on, set, map, filter)
//! - [`ham`]: per-field conflict resolution
//! - [`store`](store::NodeStore): validated, serialized load-merge-commit over storage
//! - [`graph`](graph::Graph): flattens nested writes, resolves linked reads
//! - [`wire`](wire::Frame): the frame codec (hi/bye/get/put/dam)
//! - [`track`](track::Tracker): in-flight correlation, deadlines, retries
//! - [`bus`](bus::SubscriptionBus): ordered per-node change fan-out
//! - [`pool`](pool::RelayPool): session health, load balancing, failover
//! - [`storage`](storage::Storage): pluggable persistence (memory, sled)
//! - [`transport`](transport::Transport): pluggable framing (websocket, in-memory)
//!
//! ## Data model
//!
//! Nodes are flat `field -> value` mappings addressed by a string soul. Values
//! are primitives or links (`{"#": soul}`); graph structure lives entirely in
//! links. Each field carries a HAM timestamp in the node metadata, and each
//! node remembers the machine identity of its latest writer for tie-breaking.

pub mod bus;
pub mod chain;
pub mod dam;
pub mod dup;
pub mod engine;
pub mod error;
pub mod graph;
pub mod ham;
pub mod node;
pub mod pool;
pub mod query;
pub mod relay;
pub mod session;
pub mod state;
pub mod storage;
pub mod store;
pub mod track;
pub mod transport;
pub mod types;
pub mod websocket;
pub mod wire;

pub use bus::{ChangeEvent, OverflowPolicy, Subscription};
pub use chain::Chain;
pub use engine::{Mesh, MeshOptions};
pub use error::{DamError, ErrorKind, MeshError, MeshResult};
pub use node::{Meta, Node};
pub use pool::Strategy;
pub use query::QueryOptions;
pub use storage::{MemoryStorage, SledStorage, Storage};
pub use types::Value;
pub use wire::{Body, Frame, Query};

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_basic_put_once() {
        let mesh = Mesh::new();
        mesh.get("smoke")
            .put(json!({"name": "test"}))
            .await
            .expect("put should succeed");

        let data = mesh
            .get("smoke")
            .once()
            .await
            .expect("once should succeed")
            .expect("data should exist");
        assert_eq!(data.get("name"), Some(&json!("test")));
    }
}

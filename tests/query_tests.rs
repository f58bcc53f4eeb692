//! Comprehensive tests for the query engine
//! Tests local-first resolution, miss semantics, and answering peer queries

use meshdb::bus::SubscriptionBus;
use meshdb::error::ErrorKind;
use meshdb::graph::Graph;
use meshdb::pool::{Connector, PoolConfig, RelayPool};
use meshdb::query::{QueryEngine, QueryOptions, STALENESS_WINDOW_MS};
use meshdb::relay::RelayEvent;
use meshdb::state::{HamClock, MachineIdentity};
use meshdb::storage::MemoryStorage;
use meshdb::store::NodeStore;
use meshdb::track::Tracker;
use meshdb::transport::Transport;
use meshdb::wire::{Body, Query};
use serde_json::json;
use std::sync::Arc;
use tokio::sync::mpsc;

struct Fixture {
    graph: Arc<Graph>,
    query: QueryEngine,
    _events_rx: mpsc::Receiver<RelayEvent>,
}

fn fixture() -> Fixture {
    let store = Arc::new(NodeStore::new(
        Arc::new(MemoryStorage::new()),
        Arc::new(HamClock::new()),
        Arc::new(MachineIdentity::new()),
        Arc::new(SubscriptionBus::new()),
    ));
    let graph = Arc::new(Graph::new(store.clone()));
    let tracker = Arc::new(Tracker::with_defaults());
    let (events_tx, events_rx) = mpsc::channel(64);
    let connector: Connector = Arc::new(|url: &str| -> meshdb::MeshResult<Arc<dyn Transport>> {
        Err(meshdb::MeshError::Network(format!("no transport for {url}")))
    });
    let pool = RelayPool::new(
        PoolConfig::default(),
        connector,
        "me",
        events_tx,
        tracker.clone(),
    );
    Fixture {
        graph: graph.clone(),
        query: QueryEngine::new(store, graph, tracker, pool),
        _events_rx: events_rx,
    }
}

fn local() -> QueryOptions {
    QueryOptions {
        network: false,
        ..QueryOptions::default()
    }
}

#[tokio::test]
async fn test_fetch_local_hit() {
    let fx = fixture();
    fx.graph
        .put_nested("users", &json!({"alice": {"name": "Alice", "age": 30}}))
        .await
        .unwrap();

    let got = fx
        .query
        .fetch("users", &["alice".to_string()], &local())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(got, json!({"name": "Alice", "age": 30}));
}

#[tokio::test]
async fn test_fetch_primitive_target() {
    let fx = fixture();
    fx.graph
        .put_nested("users", &json!({"alice": {"age": 30}}))
        .await
        .unwrap();
    let got = fx
        .query
        .fetch("users", &["alice".to_string(), "age".to_string()], &local())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(got, json!(30));
}

#[tokio::test]
async fn test_fetch_miss_is_none_not_error() {
    let fx = fixture();
    let got = fx.query.fetch("nowhere", &[], &local()).await.unwrap();
    assert!(got.is_none());
}

#[tokio::test]
async fn test_fetch_network_without_peers_falls_back_to_local() {
    let fx = fixture();
    fx.graph
        .put_nested("users", &json!({"alice": {"age": 30}}))
        .await
        .unwrap();
    // network requested, no sessions: resolves from local state, promptly.
    let options = QueryOptions::default();
    let got = fx
        .query
        .fetch("users", &["alice".to_string()], &options)
        .await
        .unwrap();
    assert!(got.is_some());
}

#[tokio::test]
async fn test_answer_ships_path_nodes() {
    let fx = fixture();
    fx.graph
        .put_nested("users", &json!({"alice": {"pet": {"kind": "cat"}}}))
        .await
        .unwrap();

    let query = Query::path("users", &["alice".to_string(), "pet".to_string()]);
    let reply = fx.query.answer(&query, "req-1").await;
    assert_eq!(reply.ack.as_deref(), Some("req-1"));
    match &reply.body {
        Body::Put { souls } => {
            assert!(souls.contains_key("users"));
            assert!(souls.contains_key("users/alice"));
            assert!(souls.contains_key("users/alice/pet"));
        }
        other => panic!("expected put, got {other:?}"),
    }
}

#[tokio::test]
async fn test_answer_miss_is_not_found_dam() {
    let fx = fixture();
    let query = Query::soul("ghost");
    let reply = fx.query.answer(&query, "req-9").await;
    assert_eq!(reply.ack.as_deref(), Some("req-9"));
    match &reply.body {
        Body::Dam { error } => {
            assert_eq!(error.kind, ErrorKind::NotFound);
            assert_eq!(error.soul.as_deref(), Some("ghost"));
            assert!(error.message.contains("not found"));
        }
        other => panic!("expected dam, got {other:?}"),
    }
}

#[tokio::test]
async fn test_empty_node_reads_as_none_but_exists() {
    let fx = fixture();
    let mut hollow = meshdb::Node::new("hollow");
    hollow.meta.machine_state = 1;
    hollow.meta.machine_id = "REMOTE00".into();
    fx.graph.store().merge_in(hollow).await.unwrap();

    assert!(fx.graph.store().exists("hollow").await.unwrap());
    assert!(fx.query.fetch("hollow", &[], &local()).await.unwrap().is_none());
}

#[test]
fn test_staleness_window_constant() {
    assert_eq!(STALENESS_WINDOW_MS, 30_000);
}

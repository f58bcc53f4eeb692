//! Comprehensive tests for the node store façade
//! Tests metadata injection, merge-on-write, idempotence, tombstones, and
//! commit event publication

use meshdb::bus::SubscriptionBus;
use meshdb::node::Node;
use meshdb::state::{HamClock, MachineIdentity};
use meshdb::storage::MemoryStorage;
use meshdb::store::NodeStore;
use meshdb::types::Value;
use std::collections::BTreeMap;
use std::sync::Arc;

fn store() -> (NodeStore, Arc<SubscriptionBus>) {
    let bus = Arc::new(SubscriptionBus::new());
    let store = NodeStore::new(
        Arc::new(MemoryStorage::new()),
        Arc::new(HamClock::new()),
        Arc::new(MachineIdentity::new()),
        bus.clone(),
    );
    (store, bus)
}

fn fields(pairs: &[(&str, Value)]) -> BTreeMap<String, Value> {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.clone()))
        .collect()
}

#[tokio::test]
async fn test_put_then_read() {
    let (store, _bus) = store();
    let committed = store
        .put("users/alice", fields(&[("name", Value::String("Alice".into()))]))
        .await
        .unwrap();
    assert_eq!(committed.get("name"), Some(&Value::String("Alice".into())));

    let read = store.read("users/alice").await.unwrap().unwrap();
    assert_eq!(read, committed);
    assert!(store.read("users/bob").await.unwrap().is_none());
}

#[tokio::test]
async fn test_committed_nodes_satisfy_invariants() {
    let (store, _bus) = store();
    let committed = store
        .put(
            "n",
            fields(&[("a", Value::Number(1.0)), ("b", Value::Bool(true))]),
        )
        .await
        .unwrap();
    committed.validate().unwrap();
    assert!(committed.meta.state_of("a") > 0);
    assert!(committed.meta.state_of("b") > 0);
    assert!(committed.meta.machine_state > 0);
    assert!(!committed.meta.machine_id.is_empty());
}

#[tokio::test]
async fn test_later_local_write_wins() {
    let (store, _bus) = store();
    store
        .put("n", fields(&[("v", Value::Number(1.0))]))
        .await
        .unwrap();
    store
        .put("n", fields(&[("v", Value::Number(2.0))]))
        .await
        .unwrap();
    let read = store.read("n").await.unwrap().unwrap();
    assert_eq!(read.get("v"), Some(&Value::Number(2.0)));
}

#[tokio::test]
async fn test_remote_newer_timestamp_wins() {
    let (store, _bus) = store();
    let local = store
        .put("users/alice", fields(&[("age", Value::Number(30.0))]))
        .await
        .unwrap();

    let mut remote = Node::new("users/alice");
    remote.insert("age", Value::Number(31.0), local.meta.state_of("age") + 10);
    remote.meta.machine_state = 1;
    remote.meta.machine_id = "REMOTE00".into();
    store.merge_in(remote).await.unwrap();

    let read = store.read("users/alice").await.unwrap().unwrap();
    assert_eq!(read.get("age"), Some(&Value::Number(31.0)));
}

#[tokio::test]
async fn test_remote_older_timestamp_loses() {
    let (store, _bus) = store();
    let local = store
        .put("users/alice", fields(&[("age", Value::Number(30.0))]))
        .await
        .unwrap();

    let mut remote = Node::new("users/alice");
    remote.insert("age", Value::Number(99.0), local.meta.state_of("age") - 1000);
    remote.meta.machine_state = 1;
    remote.meta.machine_id = "REMOTE00".into();
    store.merge_in(remote).await.unwrap();

    let read = store.read("users/alice").await.unwrap().unwrap();
    assert_eq!(read.get("age"), Some(&Value::Number(30.0)));
}

#[tokio::test]
async fn test_repeated_identical_merge_is_noop() {
    let (store, bus) = store();
    let mut sub = bus.subscribe("n");

    let mut remote = Node::new("n");
    remote.insert("v", Value::String("x".into()), 12345);
    remote.meta.machine_state = 2;
    remote.meta.machine_id = "REMOTE00".into();

    let first = store.merge_in(remote.clone()).await.unwrap();
    let second = store.merge_in(remote.clone()).await.unwrap();
    assert_eq!(first, second);

    // Exactly one commit event.
    assert!(sub.try_recv().is_some());
    assert!(sub.try_recv().is_none());
}

#[tokio::test]
async fn test_malformed_remote_rejected_before_merge() {
    let (store, _bus) = store();
    // Field without a state entry.
    let mut bad = Node::new("n");
    bad.fields.insert("orphan".into(), Value::Bool(true));
    assert!(store.merge_in(bad).await.is_err());
    // Nothing was committed.
    assert!(store.read("n").await.unwrap().is_none());
}

#[tokio::test]
async fn test_null_tombstone_is_a_present_field() {
    let (store, _bus) = store();
    store
        .put("n", fields(&[("gone", Value::String("was here".into()))]))
        .await
        .unwrap();
    store.put("n", fields(&[("gone", Value::Null)])).await.unwrap();

    let read = store.read("n").await.unwrap().unwrap();
    assert_eq!(read.get("gone"), Some(&Value::Null));
    assert!(store.exists("n").await.unwrap());
}

#[tokio::test]
async fn test_partial_writes_merge_fields() {
    let (store, _bus) = store();
    store
        .put("u", fields(&[("name", Value::String("Alice".into()))]))
        .await
        .unwrap();
    store
        .put("u", fields(&[("email", Value::String("a@x".into()))]))
        .await
        .unwrap();
    let read = store.read("u").await.unwrap().unwrap();
    assert_eq!(read.get("name"), Some(&Value::String("Alice".into())));
    assert_eq!(read.get("email"), Some(&Value::String("a@x".into())));
}

#[tokio::test]
async fn test_machine_state_advances_past_remote() {
    let (store, _bus) = store();
    let mut remote = Node::new("n");
    remote.insert("v", Value::Number(1.0), 500);
    remote.meta.machine_state = 100;
    remote.meta.machine_id = "REMOTE00".into();
    store.merge_in(remote).await.unwrap();

    // The next local write mints past the observed remote counter.
    let committed = store
        .put("m", fields(&[("w", Value::Number(2.0))]))
        .await
        .unwrap();
    assert!(committed.meta.machine_state > 100);
}

#[tokio::test]
async fn test_keys_and_clear() {
    let (store, _bus) = store();
    store.put("users/a", fields(&[("x", Value::Null)])).await.unwrap();
    store.put("users/b", fields(&[("x", Value::Null)])).await.unwrap();
    store.put("chat/r1", fields(&[("x", Value::Null)])).await.unwrap();

    let all = store.keys(None).await.unwrap();
    assert_eq!(all.len(), 3);
    let users = store.keys(Some("users/")).await.unwrap();
    assert_eq!(users, vec!["users/a".to_string(), "users/b".to_string()]);

    store.clear().await.unwrap();
    assert!(store.keys(None).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_empty_soul_rejected() {
    let (store, _bus) = store();
    assert!(store.put("", fields(&[("x", Value::Null)])).await.is_err());
}

#[tokio::test]
async fn test_commit_event_carries_changed_fields() {
    let (store, bus) = store();
    let mut sub = bus.subscribe("n");
    store
        .put(
            "n",
            fields(&[("a", Value::Number(1.0)), ("b", Value::Number(2.0))]),
        )
        .await
        .unwrap();
    let event = sub.recv().await.unwrap();
    assert_eq!(event.soul, "n");
    assert_eq!(event.changed, vec!["a".to_string(), "b".to_string()]);
}

#[tokio::test]
async fn test_concurrent_writes_to_distinct_souls() {
    let (store, _bus) = store();
    let store = Arc::new(store);
    let mut handles = Vec::new();
    for i in 0..20 {
        let store = store.clone();
        handles.push(tokio::spawn(async move {
            store
                .put(
                    &format!("soul/{i}"),
                    [("v".to_string(), Value::Number(i as f64))].into_iter().collect(),
                )
                .await
                .unwrap();
        }));
    }
    for h in handles {
        h.await.unwrap();
    }
    assert_eq!(store.keys(Some("soul/")).await.unwrap().len(), 20);
}

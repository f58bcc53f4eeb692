//! Comprehensive tests for HAM conflict resolution
//! Tests last-writer-wins, field-level merging, and the deterministic tie-break
//! chain (machine state, machine id, value ordering)

use meshdb::ham::{ham, merge_nodes, Side};
use meshdb::node::Node;
use meshdb::types::Value;

fn node_with(soul: &str, fields: &[(&str, Value, u64)], machine_state: u64, machine_id: &str) -> Node {
    let mut node = Node::new(soul);
    for (field, value, ts) in fields {
        node.insert(*field, value.clone(), *ts);
    }
    node.meta.machine_state = machine_state;
    node.meta.machine_id = machine_id.into();
    node
}

#[test]
fn test_newer_timestamp_wins() {
    // Replica 1 wrote age=30 at 1000, replica 2 wrote age=31 at 1001.
    let r1 = node_with("users/alice", &[("age", Value::Number(30.0), 1000)], 1, "R1aaaaaa");
    let r2 = node_with("users/alice", &[("age", Value::Number(31.0), 1001)], 5, "R2bbbbbb");

    let merged = merge_nodes(&r1, &r2);
    assert_eq!(merged.node.get("age"), Some(&Value::Number(31.0)));
    assert_eq!(merged.node.meta.state_of("age"), 1001);
    // The winner's machine markers are preserved.
    assert_eq!(merged.node.meta.machine_state, 5);
    assert_eq!(merged.node.meta.machine_id, "R2bbbbbb");
    assert_eq!(merged.changed, vec!["age".to_string()]);

    // Same result when applied in the other direction.
    let merged_rev = merge_nodes(&r2, &r1);
    assert_eq!(merged_rev.node.get("age"), Some(&Value::Number(31.0)));
    assert_eq!(merged_rev.node.meta.state_of("age"), 1001);
    assert!(merged_rev.changed.is_empty());
}

#[test]
fn test_older_timestamp_loses() {
    let cur = node_with("n", &[("color", Value::String("red".into()), 2000)], 1, "AAA");
    let inc = node_with("n", &[("color", Value::String("blue".into()), 1500)], 9, "ZZZ");
    let merged = merge_nodes(&cur, &inc);
    assert_eq!(merged.node.get("color"), Some(&Value::String("red".into())));
    assert_eq!(merged.node.meta.state_of("color"), 2000);
    assert!(merged.changed.is_empty());
}

#[test]
fn test_field_level_merge_preserves_both_sides() {
    // Replica 1 wrote name, replica 2 wrote email; both survive with their stamps.
    let r1 = node_with("users/a", &[("name", Value::String("Alice".into()), 1000)], 1, "R1aaaaaa");
    let r2 = node_with("users/a", &[("email", Value::String("a@x".into()), 1001)], 1, "R2bbbbbb");

    let merged = merge_nodes(&r1, &r2).node;
    assert_eq!(merged.get("name"), Some(&Value::String("Alice".into())));
    assert_eq!(merged.get("email"), Some(&Value::String("a@x".into())));
    assert_eq!(merged.meta.state_of("name"), 1000);
    assert_eq!(merged.meta.state_of("email"), 1001);
}

#[test]
fn test_tied_timestamp_machine_state_breaks() {
    let cur = node_with("n", &[("v", Value::Number(1.0), 500)], 3, "SAME0000");
    let inc = node_with("n", &[("v", Value::Number(2.0), 500)], 8, "SAME0000");
    assert_eq!(
        ham("v", cur.get("v"), inc.get("v").unwrap(), &cur.meta, &inc.meta),
        Side::Incoming
    );
    let merged = merge_nodes(&cur, &inc).node;
    assert_eq!(merged.get("v"), Some(&Value::Number(2.0)));
}

#[test]
fn test_tied_timestamp_machine_id_breaks() {
    // Equal timestamps and machine states; greater machine id wins.
    let cur = node_with("n", &[("color", Value::String("red".into()), 2000)], 4, "AAA00000");
    let inc = node_with("n", &[("color", Value::String("blue".into()), 2000)], 4, "BBB00000");
    let merged = merge_nodes(&cur, &inc).node;
    assert_eq!(merged.get("color"), Some(&Value::String("blue".into())));

    // And from the other side the same value survives.
    let merged_rev = merge_nodes(&inc, &cur).node;
    assert_eq!(merged_rev.get("color"), Some(&Value::String("blue".into())));
}

#[test]
fn test_full_tie_falls_back_to_value_order() {
    let cur = node_with("n", &[("v", Value::String("apple".into()), 100)], 1, "SAME0000");
    let inc = node_with("n", &[("v", Value::String("zebra".into()), 100)], 1, "SAME0000");
    // "zebra" > "apple", incoming wins.
    let merged = merge_nodes(&cur, &inc).node;
    assert_eq!(merged.get("v"), Some(&Value::String("zebra".into())));
    // Reversed, current already holds the greater value and keeps it.
    let merged_rev = merge_nodes(&inc, &cur).node;
    assert_eq!(merged_rev.get("v"), Some(&Value::String("zebra".into())));
}

#[test]
fn test_total_tie_keeps_current() {
    let cur = node_with("n", &[("v", Value::Number(7.0), 100)], 1, "SAME0000");
    let inc = node_with("n", &[("v", Value::Number(7.0), 100)], 1, "SAME0000");
    let merged = merge_nodes(&cur, &inc);
    assert_eq!(merged.node.get("v"), Some(&Value::Number(7.0)));
    assert!(merged.changed.is_empty());
}

#[test]
fn test_absent_field_takes_incoming() {
    let cur = Node::new("n");
    let inc = node_with("n", &[("fresh", Value::Bool(true), 50)], 1, "R1aaaaaa");
    assert_eq!(
        ham("fresh", None, inc.get("fresh").unwrap(), &cur.meta, &inc.meta),
        Side::Incoming
    );
}

#[test]
fn test_merge_order_independent_for_commuting_fields() {
    // merge(merge(a,b),c) == merge(merge(a,c),b) when fields commute.
    let a = node_with("n", &[("x", Value::Number(1.0), 100)], 1, "AAAA0000");
    let b = node_with("n", &[("y", Value::Number(2.0), 200)], 2, "BBBB0000");
    let c = node_with("n", &[("z", Value::Number(3.0), 300)], 3, "CCCC0000");

    let ab_c = merge_nodes(&merge_nodes(&a, &b).node, &c).node;
    let ac_b = merge_nodes(&merge_nodes(&a, &c).node, &b).node;
    assert_eq!(ab_c, ac_b);
}

#[test]
fn test_merge_idempotent() {
    let a = node_with("n", &[("x", Value::Number(1.0), 100)], 1, "AAAA0000");
    let b = node_with("n", &[("x", Value::Number(2.0), 200), ("y", Value::Bool(true), 150)], 2, "BBBB0000");
    let once = merge_nodes(&a, &b).node;
    let twice = merge_nodes(&once, &b);
    assert_eq!(twice.node, once);
    assert!(twice.changed.is_empty());
}

#[test]
fn test_null_tombstone_overwrites() {
    let cur = node_with("n", &[("gone", Value::String("here".into()), 100)], 1, "AAAA0000");
    let inc = node_with("n", &[("gone", Value::Null, 200)], 2, "BBBB0000");
    let merged = merge_nodes(&cur, &inc).node;
    assert_eq!(merged.get("gone"), Some(&Value::Null));
    assert_eq!(merged.meta.state_of("gone"), 200);
}

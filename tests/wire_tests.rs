//! Comprehensive tests for the wire codec
//! Tests frame round trips for every kind, query shapes, unknown-key
//! preservation, and malformed-frame rejection

use meshdb::error::{DamError, ErrorKind};
use meshdb::node::Node;
use meshdb::types::Value;
use meshdb::wire::{Body, Frame, Query};
use serde_json::json;
use std::collections::BTreeMap;

fn round_trip(frame: &Frame) -> Frame {
    Frame::decode(&frame.encode()).expect("valid frame must decode")
}

#[test]
fn test_hi_round_trip() {
    let frame = Frame::new(Body::Hi {
        version: "1.0.0".into(),
        peer_id: "peerAAAA1".into(),
    });
    assert_eq!(round_trip(&frame), frame);
    assert_eq!(frame.kind(), "hi");
}

#[test]
fn test_bye_round_trip() {
    let frame = Frame::new(Body::Bye {
        peer_id: "peerAAAA1".into(),
    })
    .acking("earlier-id");
    let back = round_trip(&frame);
    assert_eq!(back, frame);
    assert_eq!(back.ack.as_deref(), Some("earlier-id"));
}

#[test]
fn test_get_round_trip_single_node() {
    let frame = Frame::new(Body::Get {
        query: Query::soul("users/alice"),
    });
    let back = round_trip(&frame);
    assert_eq!(back, frame);
    let encoded = frame.encode();
    assert_eq!(encoded["get"]["#"], json!("users/alice"));
}

#[test]
fn test_get_round_trip_nested_path() {
    let query = Query::path("users", &["alice".to_string(), "pet".to_string()]);
    let frame = Frame::new(Body::Get { query: query.clone() });
    assert_eq!(round_trip(&frame), frame);

    let encoded = frame.encode();
    assert_eq!(encoded["get"]["#"], json!("users"));
    assert_eq!(encoded["get"]["."]["#"], json!("alice"));
    assert_eq!(encoded["get"]["."]["."]["#"], json!("pet"));

    let (root, segments) = query.segments();
    assert_eq!(root, "users");
    assert_eq!(segments, vec!["alice".to_string(), "pet".to_string()]);
}

#[test]
fn test_put_round_trip() {
    let mut node = Node::new("users/alice");
    node.insert("name", Value::String("Alice".into()), 1000);
    node.insert("pet", Value::link("users/alice/pet"), 1001);
    node.meta.machine_state = 3;
    node.meta.machine_id = "aB3dE9xK".into();

    let mut souls = BTreeMap::new();
    souls.insert("users/alice".to_string(), node);
    let frame = Frame::new(Body::Put { souls }).acking("query-1");
    assert_eq!(round_trip(&frame), frame);

    let encoded = frame.encode();
    assert_eq!(encoded["put"]["users/alice"]["name"], json!("Alice"));
    assert_eq!(encoded["put"]["users/alice"]["_"]["#"], json!("users/alice"));
}

#[test]
fn test_dam_round_trip() {
    let error = DamError::new(ErrorKind::Storage, "disk on fire")
        .with_code("E_DISK")
        .with_soul("users/alice")
        .with_field("age");
    let frame = meshdb::dam::to_dam(&error, Some("original-id"));
    let back = round_trip(&frame);
    assert_eq!(back, frame);
    let back_err = meshdb::dam::from_dam(&back).unwrap();
    assert_eq!(back_err, error);
}

#[test]
fn test_foreign_dam_frame_classified_from_text() {
    // A dam frame from another implementation: no explicit kind key.
    let raw = json!({
        "dam": "Node \"x\" not found",
        "@": "A",
        "#": "B",
        "node": "x"
    });
    let frame = Frame::decode(&raw).unwrap();
    let error = meshdb::dam::from_dam(&frame).unwrap();
    assert_eq!(error.kind, ErrorKind::NotFound);
    assert_eq!(error.message, "Node \"x\" not found");
    assert_eq!(error.soul.as_deref(), Some("x"));
    assert_eq!(error.error_id, "A");
    assert_eq!(error.context.get("ackId"), Some(&json!("B")));

    // Round trip holds on the core fields.
    let re = meshdb::dam::to_dam(&error, None).encode();
    assert_eq!(re["dam"], raw["dam"]);
    assert_eq!(re["@"], raw["@"]);
    assert_eq!(re["#"], raw["#"]);
    assert_eq!(re["node"], raw["node"]);
}

#[test]
fn test_unknown_keys_preserved() {
    let raw = json!({
        "hi": {"version": "1.0.0", "peer_id": "p1"},
        "@": "id-1",
        "peers": ["ws://a", "ws://b"],
        "futureFeature": {"x": 1}
    });
    let frame = Frame::decode(&raw).unwrap();
    assert_eq!(frame.extra.get("peers"), Some(&json!(["ws://a", "ws://b"])));
    assert_eq!(frame.extra.get("futureFeature"), Some(&json!({"x": 1})));
    let encoded = frame.encode();
    assert_eq!(encoded["peers"], raw["peers"]);
    assert_eq!(encoded["futureFeature"], raw["futureFeature"]);
}

#[test]
fn test_unknown_kind_ignored_but_carried() {
    let raw = json!({"@": "id-9", "warble": true});
    let frame = Frame::decode(&raw).unwrap();
    assert_eq!(frame.kind(), "unknown");
    assert_eq!(frame.encode(), raw);
}

#[test]
fn test_malformed_frames_rejected() {
    // Not an object.
    assert!(Frame::decode(&json!("nope")).is_err());
    // Missing id.
    assert!(Frame::decode(&json!({"get": {"#": "x"}})).is_err());
    // Bad payload shapes.
    assert!(Frame::decode(&json!({"hi": "not-an-object", "@": "a"})).is_err());
    assert!(Frame::decode(&json!({"get": {"no-soul": 1}, "@": "a"})).is_err());
    assert!(Frame::decode(&json!({"put": {"x": {"f": [1]}}, "@": "a"})).is_err());
    assert!(Frame::decode(&json!({"dam": 42, "@": "a"})).is_err());
    // Invalid JSON text.
    assert!(Frame::decode_string("{{{").is_err());
}

#[test]
fn test_string_round_trip() {
    let frame = Frame::new(Body::Get {
        query: Query::soul("a/b"),
    });
    let back = Frame::decode_string(&frame.encode_string()).unwrap();
    assert_eq!(back, frame);
}

#[test]
fn test_fresh_ids_differ() {
    let a = Frame::new(Body::Bye { peer_id: "p".into() });
    let b = Frame::new(Body::Bye { peer_id: "p".into() });
    assert_ne!(a.id, b.id);
}

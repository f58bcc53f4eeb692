//! Comprehensive tests for handshake policy and session states
//! Tests version acceptance, hi/hi-ack correlation, and state predicates

use meshdb::session::{
    bye_frame, hi_ack, hi_frame, version_accepted, SessionState, COMPATIBLE_VERSIONS,
    PROTOCOL_VERSION,
};
use meshdb::wire::Body;

#[test]
fn test_same_major_accepted() {
    assert!(version_accepted("1.0.0", "1.0.0"));
    assert!(version_accepted("1.0.0", "1.4.7"));
}

#[test]
fn test_different_major_rejected() {
    assert!(!version_accepted("1.0.0", "2.0.0"));
    assert!(!version_accepted("2.1.0", "1.9.9"));
}

#[test]
fn test_static_table_overrides_major_check() {
    for v in COMPATIBLE_VERSIONS {
        assert!(version_accepted(PROTOCOL_VERSION, v));
    }
}

#[test]
fn test_garbage_versions_rejected() {
    assert!(!version_accepted("1.0.0", "banana"));
    assert!(!version_accepted("1.0.0", ""));
}

#[test]
fn test_hi_frame_shape() {
    let hi = hi_frame("peerAAAA1");
    match &hi.body {
        Body::Hi { version, peer_id } => {
            assert_eq!(version, PROTOCOL_VERSION);
            assert_eq!(peer_id, "peerAAAA1");
        }
        other => panic!("expected hi, got {other:?}"),
    }
    assert!(hi.ack.is_none());
}

#[test]
fn test_hi_ack_correlates() {
    let hi = hi_frame("peerA");
    let ack = hi_ack("peerB", &hi);
    assert_eq!(ack.ack.as_deref(), Some(hi.id.as_str()));
    match &ack.body {
        Body::Hi { peer_id, .. } => assert_eq!(peer_id, "peerB"),
        other => panic!("expected hi, got {other:?}"),
    }
}

#[test]
fn test_bye_frame_shape() {
    let bye = bye_frame("peerA");
    match &bye.body {
        Body::Bye { peer_id } => assert_eq!(peer_id, "peerA"),
        other => panic!("expected bye, got {other:?}"),
    }
}

#[test]
fn test_state_predicates() {
    assert!(SessionState::Ready.is_ready());
    for s in [
        SessionState::Connecting,
        SessionState::HandshakeSent,
        SessionState::Closing,
        SessionState::Closed,
        SessionState::Failed,
    ] {
        assert!(!s.is_ready());
    }
    assert!(SessionState::Closed.is_terminal());
    assert!(SessionState::Failed.is_terminal());
    assert!(!SessionState::Ready.is_terminal());
    assert!(!SessionState::Closing.is_terminal());
}

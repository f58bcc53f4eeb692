//! Comprehensive tests for the DAM error model
//! Tests retry schedules, retry eligibility, and error telemetry

use meshdb::dam::{ErrorStats, RetryPolicy};
use meshdb::error::{DamError, ErrorKind};
use std::time::Duration;

#[test]
fn test_timeout_schedule_doubles_and_caps() {
    // Five consecutive timeouts: 1s, 2s, 4s, 8s, 16s; the sixth would be 32s.
    let expect = [1000u64, 2000, 4000, 8000, 16000, 32000];
    for (i, ms) in expect.iter().enumerate() {
        let delay = RetryPolicy::delay_for(ErrorKind::Timeout, (i + 1) as u32).unwrap();
        assert_eq!(delay, Duration::from_millis(*ms), "attempt {}", i + 1);
    }
    // Cap holds far out.
    assert_eq!(
        RetryPolicy::delay_for(ErrorKind::Timeout, 40).unwrap(),
        Duration::from_millis(32_000)
    );
}

#[test]
fn test_timeout_schedule_monotone() {
    let mut last = Duration::ZERO;
    for attempt in 1..20 {
        let delay = RetryPolicy::delay_for(ErrorKind::Timeout, attempt).unwrap();
        assert!(delay >= last);
        last = delay;
    }
}

#[test]
fn test_network_schedule_linear_and_capped() {
    assert_eq!(
        RetryPolicy::delay_for(ErrorKind::Network, 1).unwrap(),
        Duration::from_millis(500)
    );
    assert_eq!(
        RetryPolicy::delay_for(ErrorKind::Network, 4).unwrap(),
        Duration::from_millis(2000)
    );
    assert_eq!(
        RetryPolicy::delay_for(ErrorKind::Network, 100).unwrap(),
        Duration::from_millis(5000)
    );
}

#[test]
fn test_conflict_schedule_constant_bounded() {
    for attempt in 1..=3 {
        assert_eq!(
            RetryPolicy::delay_for(ErrorKind::Conflict, attempt).unwrap(),
            Duration::from_millis(250)
        );
    }
    assert!(RetryPolicy::delay_for(ErrorKind::Conflict, 4).is_none());
}

#[test]
fn test_storage_schedule_constant_bounded() {
    for attempt in 1..=2 {
        assert_eq!(
            RetryPolicy::delay_for(ErrorKind::Storage, attempt).unwrap(),
            Duration::from_millis(500)
        );
    }
    assert!(RetryPolicy::delay_for(ErrorKind::Storage, 3).is_none());
}

#[test]
fn test_non_retryable_kinds() {
    for kind in [
        ErrorKind::NotFound,
        ErrorKind::Unauthorized,
        ErrorKind::Validation,
        ErrorKind::Malformed,
        ErrorKind::Permission,
        ErrorKind::Limit,
        ErrorKind::Unknown,
    ] {
        assert!(!RetryPolicy::retryable(kind));
        assert!(RetryPolicy::delay_for(kind, 1).is_none());
    }
    for kind in [
        ErrorKind::Timeout,
        ErrorKind::Network,
        ErrorKind::Conflict,
        ErrorKind::Storage,
    ] {
        assert!(RetryPolicy::retryable(kind));
    }
}

#[test]
fn test_attempt_zero_never_retries() {
    assert!(RetryPolicy::delay_for(ErrorKind::Timeout, 0).is_none());
}

#[test]
fn test_stats_counts_per_kind() {
    let stats = ErrorStats::new();
    stats.record(&DamError::new(ErrorKind::Timeout, "t1"));
    stats.record(&DamError::new(ErrorKind::Timeout, "t2"));
    stats.record(&DamError::new(ErrorKind::Storage, "s1"));
    assert_eq!(stats.count(ErrorKind::Timeout), 2);
    assert_eq!(stats.count(ErrorKind::Storage), 1);
    assert_eq!(stats.count(ErrorKind::Network), 0);
    assert_eq!(stats.total(), 3);
}

#[test]
fn test_stats_ring_is_bounded_and_ordered() {
    let stats = ErrorStats::new();
    for i in 0..100 {
        stats.record(&DamError::new(ErrorKind::Unknown, format!("e{i}")));
    }
    let recent = stats.recent();
    assert!(recent.len() < 100, "ring must be bounded");
    // Oldest first, newest last.
    assert_eq!(recent.last().unwrap().message, "e99");
}

#[tokio::test]
async fn test_stats_stream_delivers() {
    let stats = ErrorStats::new();
    let mut rx = stats.subscribe();
    stats.record(&DamError::new(ErrorKind::Network, "boom"));
    let got = rx.recv().await.unwrap();
    assert_eq!(got.kind, ErrorKind::Network);
    assert_eq!(got.message, "boom");
}

#[test]
fn test_kind_string_round_trip() {
    for kind in ErrorKind::ALL {
        assert_eq!(ErrorKind::parse(kind.as_str()), Some(kind));
    }
    assert_eq!(ErrorKind::parse("nonsense"), None);
}

#[test]
fn test_kind_classification_from_message() {
    assert_eq!(ErrorKind::classify("Node \"x\" not found"), ErrorKind::NotFound);
    assert_eq!(ErrorKind::classify("request timed out"), ErrorKind::Timeout);
    assert_eq!(ErrorKind::classify("connection reset"), ErrorKind::Network);
    assert_eq!(ErrorKind::classify("message too big!"), ErrorKind::Limit);
    assert_eq!(ErrorKind::classify("chaos"), ErrorKind::Unknown);
}

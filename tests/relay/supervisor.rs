use std::time::{Duration, Instant};

use pubsub_relay::{
    Payload, StopReason, StreamState, SupervisorConfig, TransportError,
};

use crate::support::{collector, fast_supervisor, wait_until, Harness};

const TOPIC: &str = "to_users";
const SUB: &str = "to_users_subscription";

#[test]
fn recovers_from_fewer_failures_than_the_budget() {
    let harness = Harness::new();
    harness.context.ensure_subscription(TOPIC, SUB).unwrap();
    harness.transport.fail_streams(SUB, 4);

    let (handler, rx) = collector();
    let handle = harness.supervisor.start(TOPIC, SUB, handler).unwrap();
    assert!(wait_until(Duration::from_secs(2), || {
        harness.transport.streaming_pull_calls() == 5
    }));

    harness
        .transport
        .publish_raw(TOPIC, pubsub_relay::bus::OutboundMessage::new(b"after".to_vec()))
        .unwrap();
    assert_eq!(
        rx.recv_timeout(Duration::from_secs(2)).unwrap(),
        Payload::Text("after".into())
    );

    let stats = harness.supervisor.stop(handle.key()).unwrap();
    assert_eq!(stats.failures, 4);
    assert_eq!(stats.resubscribes, 4);
    assert_eq!(stats.stop_reason, Some(StopReason::Requested));
}

#[test]
fn stops_and_deregisters_after_exhausting_the_budget() {
    let harness = Harness::new();
    harness.context.ensure_subscription(TOPIC, SUB).unwrap();
    harness.transport.fail_streams(SUB, 5);

    let (handler, _rx) = collector();
    let handle = harness.supervisor.start(TOPIC, SUB, handler).unwrap();

    let stats = handle.wait_stopped(Duration::from_secs(2)).unwrap();
    assert_eq!(stats.stop_reason, Some(StopReason::RetriesExhausted));
    assert_eq!(stats.failures, 5);
    assert_eq!(handle.state(), StreamState::Stopped);
    assert!(!harness.supervisor.is_active(handle.key()));
    assert_eq!(harness.transport.streaming_pull_calls(), 5);
}

#[test]
fn failure_count_resets_once_the_stream_is_healthy() {
    let harness = Harness::new();
    harness.context.ensure_subscription(TOPIC, SUB).unwrap();
    harness.transport.fail_streams(SUB, 4);

    let (handler, _rx) = collector();
    let handle = harness.supervisor.start(TOPIC, SUB, handler).unwrap();
    assert!(wait_until(Duration::from_secs(2), || {
        harness.transport.streaming_pull_calls() == 5
    }));
    // Several quiet wait windows.
    std::thread::sleep(Duration::from_millis(100));

    harness.transport.fail_streams(SUB, 4);
    assert!(wait_until(Duration::from_secs(2), || {
        harness.transport.streaming_pull_calls() == 9
    }));
    std::thread::sleep(Duration::from_millis(50));

    assert!(harness.supervisor.is_active(handle.key()));
    let stats = harness.supervisor.stop(handle.key()).unwrap();
    assert_eq!(stats.failures, 8);
    assert!(stats.timeouts > 0);
}

#[test]
fn failed_resubscribe_counts_as_a_failure() {
    let harness = Harness::new();
    let supervisor = harness.supervisor.clone().with_config(SupervisorConfig {
        initial_backoff: Duration::from_millis(100),
        max_backoff: Duration::from_millis(100),
        ..fast_supervisor()
    });
    harness.context.ensure_subscription(TOPIC, SUB).unwrap();
    harness.transport.fail_streams(SUB, 1);

    let (handler, _rx) = collector();
    let handle = supervisor.start(TOPIC, SUB, handler).unwrap();
    harness
        .transport
        .fail_next_stream_open(TransportError::Unavailable("refused".into()));

    assert!(wait_until(Duration::from_secs(2), || {
        harness.transport.streaming_pull_calls() == 3
    }));
    std::thread::sleep(Duration::from_millis(30));

    let stats = supervisor.stop(handle.key()).unwrap();
    assert_eq!(stats.failures, 2);
    assert_eq!(stats.resubscribes, 1);
}

#[test]
fn stop_interrupts_backoff() {
    let harness = Harness::new();
    let supervisor = harness.supervisor.clone().with_config(SupervisorConfig {
        initial_backoff: Duration::from_secs(30),
        max_backoff: Duration::from_secs(30),
        ..fast_supervisor()
    });
    harness.context.ensure_subscription(TOPIC, SUB).unwrap();
    harness.transport.fail_streams(SUB, 1);

    let (handler, _rx) = collector();
    let handle = supervisor.start(TOPIC, SUB, handler).unwrap();
    assert!(wait_until(Duration::from_secs(2), || {
        handle.state() == StreamState::Resubscribing
    }));

    let started = Instant::now();
    let stats = supervisor.stop(handle.key()).unwrap();
    assert!(started.elapsed() < Duration::from_secs(1));
    assert_eq!(stats.stop_reason, Some(StopReason::Requested));
    assert_eq!(stats.resubscribes, 0);
}

#[test]
fn stopped_key_can_be_started_again() {
    let harness = Harness::new();
    let (first, _rx1) = collector();
    let handle = harness.supervisor.start(TOPIC, SUB, first).unwrap();
    harness.supervisor.stop(handle.key()).unwrap();

    let (second, rx2) = collector();
    let restarted = harness.supervisor.start(TOPIC, SUB, second).unwrap();
    assert!(!restarted.is_stopped());

    harness
        .transport
        .publish_raw(TOPIC, pubsub_relay::bus::OutboundMessage::new(b"again".to_vec()))
        .unwrap();
    assert_eq!(
        rx2.recv_timeout(Duration::from_secs(2)).unwrap(),
        Payload::Text("again".into())
    );
    assert!(handle.is_stopped());
}

#[test]
fn closing_the_context_stops_every_stream() {
    let harness = Harness::new();
    let (a, _ra) = collector();
    let (b, _rb) = collector();
    let first = harness.supervisor.start("a", "a_subscription", a).unwrap();
    let second = harness.supervisor.start("b", "b_subscription", b).unwrap();

    harness.context.close();

    for handle in [first, second] {
        let stats = handle.wait_stopped(Duration::from_secs(1)).unwrap();
        assert_eq!(stats.stop_reason, Some(StopReason::Requested));
    }
    assert!(harness.supervisor.active_streams().is_empty());
    let (c, _rc) = collector();
    assert!(harness.supervisor.start("c", "c_subscription", c).is_err());
}

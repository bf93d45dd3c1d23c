use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use pubsub_relay::bus::{OutboundMessage, RETRY_COUNT_ATTRIBUTE};
use pubsub_relay::{HandlerError, Payload};
use serde_json::json;

use crate::support::{collector, wait_until, Harness};

const TOPIC: &str = "from_users";
const SUB: &str = "from_users_subscription";

fn counting_handler() -> (Arc<AtomicUsize>, impl Fn(Payload) -> Result<bool, HandlerError>) {
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&calls);
    (calls, move |_: Payload| {
        counter.fetch_add(1, Ordering::SeqCst);
        Ok(true)
    })
}

#[test]
fn poison_message_is_acked_without_handler() {
    let harness = Harness::new();
    let (calls, handler) = counting_handler();
    harness.supervisor.start(TOPIC, SUB, handler).unwrap();

    harness
        .transport
        .publish_raw(
            TOPIC,
            OutboundMessage::new(br#"{"text":"again"}"#.to_vec())
                .with_attribute(RETRY_COUNT_ATTRIBUTE, "2"),
        )
        .unwrap();

    assert!(wait_until(Duration::from_secs(2), || harness.transport.acked(SUB).len() == 1));
    assert_eq!(calls.load(Ordering::SeqCst), 0);
}

#[test]
fn malformed_record_is_dropped_and_stream_continues() {
    let harness = Harness::new();
    let (handler, rx) = collector();
    let handle = harness.supervisor.start(TOPIC, SUB, handler).unwrap();

    harness
        .transport
        .publish_raw(TOPIC, OutboundMessage::new(b"{\"text\": ".to_vec()))
        .unwrap();
    harness
        .transport
        .publish_raw(TOPIC, OutboundMessage::new(br#"{"text":"ok"}"#.to_vec()))
        .unwrap();

    let received = rx.recv_timeout(Duration::from_secs(2)).unwrap();
    assert_eq!(received, Payload::Structured(json!({ "text": "ok" })));
    assert!(wait_until(Duration::from_secs(2), || harness.transport.acked(SUB).len() == 2));
    assert!(harness.supervisor.is_active(handle.key()));
    assert!(rx.recv_timeout(Duration::from_millis(50)).is_err());
}

#[test]
fn invalid_utf8_is_replaced_not_rejected() {
    let harness = Harness::new();
    let (handler, rx) = collector();
    harness.supervisor.start(TOPIC, SUB, handler).unwrap();

    harness
        .transport
        .publish_raw(TOPIC, OutboundMessage::new(b"caf\xc3\xa9 \xff\xfe ok".to_vec()))
        .unwrap();

    let received = rx.recv_timeout(Duration::from_secs(2)).unwrap();
    assert_eq!(received, Payload::Text("café \u{FFFD}\u{FFFD} ok".into()));
}

#[test]
fn failing_handler_is_not_redelivered() {
    let harness = Harness::new();
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&calls);
    let handle = harness
        .supervisor
        .start(TOPIC, SUB, move |_: Payload| -> Result<bool, HandlerError> {
            counter.fetch_add(1, Ordering::SeqCst);
            Err(HandlerError::Rejected("cannot handle".into()))
        })
        .unwrap();

    harness
        .transport
        .publish_raw(TOPIC, OutboundMessage::new(b"hello".to_vec()))
        .unwrap();

    assert!(wait_until(Duration::from_secs(2), || harness.transport.acked(SUB).len() == 1));
    // Well past the 200ms ack deadline: an un-acked message would be back by now.
    thread::sleep(Duration::from_millis(400));
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(harness.transport.outstanding(SUB), 0);

    let stats = harness.supervisor.stop(handle.key()).unwrap();
    assert_eq!(stats.deliveries.handler_errors, 1);
}

#[test]
fn unacked_delivery_returns_with_retry_count_until_poisoned() {
    let harness = Harness::new();
    let (calls, handler) = counting_handler();
    harness.supervisor.start(TOPIC, SUB, handler).unwrap();

    // Simulates a consumer that died twice before acknowledging.
    harness
        .transport
        .publish_raw(
            TOPIC,
            OutboundMessage::new(b"x".to_vec()).with_attribute(RETRY_COUNT_ATTRIBUTE, "1"),
        )
        .unwrap();
    assert!(wait_until(Duration::from_secs(2), || calls.load(Ordering::SeqCst) == 1));

    harness
        .transport
        .publish_raw(
            TOPIC,
            OutboundMessage::new(b"y".to_vec()).with_attribute(RETRY_COUNT_ATTRIBUTE, "5"),
        )
        .unwrap();
    assert!(wait_until(Duration::from_secs(2), || harness.transport.acked(SUB).len() == 2));
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[test]
fn retry_count_beyond_u32_is_still_poison() {
    let harness = Harness::new();
    let (calls, handler) = counting_handler();
    let handle = harness.supervisor.start(TOPIC, SUB, handler).unwrap();

    harness
        .transport
        .publish_raw(
            TOPIC,
            OutboundMessage::new(b"z".to_vec())
                .with_attribute(RETRY_COUNT_ATTRIBUTE, "4294967296"),
        )
        .unwrap();
    assert!(wait_until(Duration::from_secs(2), || harness.transport.acked(SUB).len() == 1));
    assert_eq!(calls.load(Ordering::SeqCst), 0);

    let stats = harness.supervisor.stop(handle.key()).unwrap();
    assert_eq!(stats.deliveries.poison, 1);
}

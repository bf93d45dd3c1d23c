use std::sync::Arc;
use std::time::Duration;

use pubsub_relay::bus::OutboundMessage;
use pubsub_relay::{OutboundEnvelope, Payload, Publisher};
use serde::Serialize;
use serde_json::json;

use crate::support::{collector, Harness};

const TOPIC: &str = "events";
const SUB: &str = "events_subscription";

#[derive(Debug, Serialize)]
struct Greeting {
    text: &'static str,
    count: u32,
}

#[test]
fn records_and_text_survive_publish_and_subscribe() {
    let harness = Harness::new();
    let (handler, rx) = collector();
    harness.supervisor.start(TOPIC, SUB, handler).unwrap();
    let publisher = Publisher::new(Arc::clone(&harness.context));

    let sent = [
        Payload::Structured(json!({ "text": "héllo wörld", "nested": { "n": [1, 2, 3] } })),
        Payload::Text("plain text with ünïcode ✓".into()),
        Payload::Text("   leading spaces, no brace".into()),
    ];
    for payload in &sent {
        publisher.publish(TOPIC, payload.clone()).unwrap();
    }

    for expected in &sent {
        assert_eq!(&rx.recv_timeout(Duration::from_secs(2)).unwrap(), expected);
    }
}

#[test]
fn json_values_and_brace_leading_text_keep_their_variant() {
    let harness = Harness::new();
    let (handler, rx) = collector();
    harness.supervisor.start(TOPIC, SUB, handler).unwrap();
    let publisher = Publisher::new(Arc::clone(&harness.context));

    let sent = [
        Payload::Structured(json!([1, 2])),
        Payload::Structured(json!("s")),
        Payload::Structured(json!(5)),
        Payload::Structured(json!(true)),
        Payload::Text("{not json".into()),
        Payload::Text(r#"{"a":1}"#.into()),
        Payload::Text("[1,2]".into()),
        Payload::Bytes(vec![0xff, 0x00, b'{']),
    ];
    for payload in &sent {
        publisher.publish(TOPIC, payload.clone()).unwrap();
    }

    for expected in &sent {
        assert_eq!(&rx.recv_timeout(Duration::from_secs(2)).unwrap(), expected);
    }
}

#[test]
fn non_ascii_is_sent_as_raw_utf8() {
    let harness = Harness::new();
    harness.context.ensure_topic(TOPIC).unwrap();
    let publisher = Publisher::new(Arc::clone(&harness.context));

    publisher
        .publish(TOPIC, json!({ "text": "café" }))
        .unwrap();

    let wire = &harness.transport.published(TOPIC)[0].data;
    assert!(std::str::from_utf8(wire).unwrap().contains("café"));
}

#[test]
fn serializable_values_and_envelopes_are_published() {
    let harness = Harness::new();
    let (handler, rx) = collector();
    harness.supervisor.start(TOPIC, SUB, handler).unwrap();
    let publisher = Publisher::new(Arc::clone(&harness.context));

    publisher
        .publish_value(TOPIC, &Greeting { text: "hi", count: 2 })
        .unwrap();
    let future = publisher
        .publish_envelope(TOPIC, OutboundEnvelope::with_message_id("m-7", "wrapped"))
        .unwrap();

    assert_eq!(
        rx.recv_timeout(Duration::from_secs(2)).unwrap(),
        Payload::Structured(json!({ "text": "hi", "count": 2 }))
    );
    assert_eq!(
        rx.recv_timeout(Duration::from_secs(2)).unwrap(),
        Payload::Structured(json!({ "message": "wrapped", "message_id": "m-7" }))
    );
    assert!(future.result(Duration::from_secs(1)).is_some());
}

#[test]
fn injected_invalid_bytes_decode_with_replacement() {
    let harness = Harness::new();
    let (handler, rx) = collector();
    harness.supervisor.start(TOPIC, SUB, handler).unwrap();

    harness
        .transport
        .publish_raw(TOPIC, OutboundMessage::new(b"{\"text\":\"bad \xff byte\"}".to_vec()))
        .unwrap();

    assert_eq!(
        rx.recv_timeout(Duration::from_secs(2)).unwrap(),
        Payload::Structured(json!({ "text": "bad \u{FFFD} byte" }))
    );
}

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use pubsub_relay::{
    Connector, CorrelatorConfig, CorrelatorError, HandlerError, LatencyBreakdown, Payload,
    Publisher, ReplyMatching, Request, MESSAGE_ID_FIELD,
};
use serde_json::{json, Value};

use crate::support::{test_config, wait_until, Harness};

const REQUESTS: &str = "from_users";
const REQUESTS_SUB: &str = "from_users_subscription";
const REPLIES: &str = "to_users";
const REPLIES_SUB: &str = "to_users_subscription";

/// A bot on the request topic that answers every record after `delay`.
fn start_responder<F>(harness: &Harness, delay: Duration, answer: F)
where
    F: Fn(Option<&str>) -> Payload + Send + Sync + 'static,
{
    let publisher = Publisher::new(Arc::clone(&harness.context));
    harness
        .supervisor
        .start(REQUESTS, REQUESTS_SUB, move |request: Payload| -> Result<bool, HandlerError> {
            thread::sleep(delay);
            let reply = answer(request.correlation_id());
            publisher
                .publish(REPLIES, reply)
                .map_err(|err| HandlerError::Other(Box::new(err)))?;
            Ok(true)
        })
        .unwrap();
}

fn echo_hi(id: Option<&str>) -> Payload {
    Payload::Structured(json!({ "message": "hi", "message_id": id }))
}

fn connector(harness: &Harness) -> Connector {
    let connector = Connector::new(Arc::clone(&harness.context));
    connector
        .listen(&harness.supervisor, REPLIES, REPLIES_SUB)
        .unwrap();
    connector
}

#[test]
fn delayed_reply_resolves_with_latency() {
    let harness = Harness::new();
    start_responder(&harness, Duration::from_millis(500), echo_hi);
    let connector = connector(&harness);

    let exchange = connector
        .send_request(
            Request::new(REQUESTS, json!({ "text": "hello" }))
                .with_correlation_id("abc-123")
                .with_timeout(Duration::from_secs(5)),
        )
        .unwrap();

    assert_eq!(exchange.response_text(), Some("hi"));
    assert_eq!(exchange.correlation_id, "abc-123");
    assert_eq!(exchange.received_correlation_id.as_deref(), Some("abc-123"));
    let latency = exchange.latency_ms.unwrap();
    assert!((480.0..1500.0).contains(&latency), "latency was {latency}");
    match exchange.latency_breakdown {
        LatencyBreakdown::Stages(stages) => {
            assert!(stages.remote_processing >= 450.0);
            assert!(stages.total >= latency);
        }
        other => panic!("unexpected breakdown {other:?}"),
    }

    let sent: Value = serde_json::from_slice(&harness.transport.published(REQUESTS)[0].data).unwrap();
    assert_eq!(sent, json!({ "text": "hello", "message_id": "abc-123" }));
    connector.shutdown();
}

#[test]
fn unanswered_request_times_out_on_schedule() {
    let harness = Harness::new();
    let connector = connector(&harness);
    harness.context.ensure_topic(REQUESTS).unwrap();

    let started = Instant::now();
    let exchange = connector
        .send_and_await(REQUESTS, "anyone?", Duration::from_millis(300))
        .unwrap();
    let elapsed = started.elapsed();

    assert!(exchange.is_timeout());
    assert!(exchange.latency_ms.is_none());
    assert!(elapsed >= Duration::from_millis(300));
    assert!(elapsed < Duration::from_millis(500), "took {elapsed:?}");
    assert_eq!(
        exchange.latency_breakdown,
        LatencyBreakdown::TimedOut {
            error: "Timeout waiting for response after 300ms".into()
        }
    );
    assert_eq!(connector.pending_requests(), 0);
    connector.shutdown();
}

#[test]
fn concurrent_requests_get_their_own_replies() {
    let harness = Harness::new();

    // Holds requests until four arrived, then answers them newest first.
    let publisher = Publisher::new(Arc::clone(&harness.context));
    let held: Arc<Mutex<Vec<String>>> = Arc::default();
    let queue = Arc::clone(&held);
    harness
        .supervisor
        .start(REQUESTS, REQUESTS_SUB, move |request: Payload| -> Result<bool, HandlerError> {
            let mut queue = queue.lock();
            if let Some(id) = request.correlation_id() {
                queue.push(id.to_string());
            }
            if queue.len() == 4 {
                for id in queue.drain(..).rev() {
                    let answer = json!({ "message": format!("answer for {id}"), "message_id": id });
                    publisher
                        .publish(REPLIES, answer)
                        .map_err(|err| HandlerError::Other(Box::new(err)))?;
                }
            }
            Ok(true)
        })
        .unwrap();
    let connector = Arc::new(connector(&harness));

    let callers: Vec<_> = (0..4)
        .map(|i| {
            let connector = Arc::clone(&connector);
            thread::spawn(move || {
                let id = format!("req-{i}");
                let exchange = connector
                    .send_request(
                        Request::new(REQUESTS, json!({ "n": i }))
                            .with_correlation_id(id.clone())
                            .with_timeout(Duration::from_secs(5)),
                    )
                    .unwrap();
                (id, exchange)
            })
        })
        .collect();

    for caller in callers {
        let (id, exchange) = caller.join().unwrap();
        assert_eq!(exchange.response_text(), Some(format!("answer for {id}").as_str()));
        assert_eq!(exchange.received_correlation_id.as_deref(), Some(id.as_str()));
    }
    assert!(connector.unmatched_replies().is_empty());
    connector.shutdown();
}

#[test]
fn next_available_hands_uncorrelated_reply_to_oldest() {
    let mut config = test_config();
    config.correlator = CorrelatorConfig {
        matching: ReplyMatching::NextAvailable,
        ..CorrelatorConfig::default()
    };
    let harness = Harness::with_config(config);
    start_responder(&harness, Duration::from_millis(20), |_| Payload::Text("plain answer".into()));
    let connector = connector(&harness);

    let exchange = connector
        .send_and_await(REQUESTS, "question", Duration::from_secs(2))
        .unwrap();

    assert_eq!(exchange.response_text(), Some("plain answer"));
    assert!(exchange.received_correlation_id.is_none());
    connector.shutdown();
}

#[test]
fn correlation_mode_keeps_uncorrelated_reply_in_inbox() {
    let harness = Harness::new();
    start_responder(&harness, Duration::ZERO, |_| Payload::Text("who am I for?".into()));
    let connector = connector(&harness);

    let exchange = connector
        .send_and_await(REQUESTS, "question", Duration::from_millis(200))
        .unwrap();

    assert!(exchange.is_timeout());
    assert_eq!(connector.unmatched_replies(), vec![Payload::Text("who am I for?".into())]);
    connector.shutdown();
}

#[test]
fn late_reply_lands_in_inbox_and_is_purged_by_next_send() {
    let harness = Harness::new();
    start_responder(&harness, Duration::from_millis(300), echo_hi);
    let connector = connector(&harness);

    let exchange = connector
        .send_request(
            Request::new(REQUESTS, json!({ "text": "slow" }))
                .with_correlation_id("late-1")
                .with_timeout(Duration::from_millis(100)),
        )
        .unwrap();
    assert!(exchange.is_timeout());

    assert!(wait_until(Duration::from_secs(2), || {
        connector.unmatched_replies().len() == 1
    }));
    let stale = &connector.unmatched_replies()[0];
    assert_eq!(stale.field(MESSAGE_ID_FIELD), Some(&json!("late-1")));

    // Purged on send; the responder then answers this one properly.
    let exchange = connector
        .send_and_await(REQUESTS, json!({ "text": "again" }), Duration::from_secs(2))
        .unwrap();
    assert_eq!(exchange.response_text(), Some("hi"));
    connector.shutdown();
}

#[test]
fn duplicate_in_flight_correlation_id_is_rejected() {
    let harness = Harness::new();
    harness.context.ensure_topic(REQUESTS).unwrap();
    let connector = Arc::new(connector(&harness));

    let first = {
        let connector = Arc::clone(&connector);
        thread::spawn(move || {
            connector.send_request(
                Request::new(REQUESTS, "one")
                    .with_correlation_id("dup")
                    .with_timeout(Duration::from_millis(400)),
            )
        })
    };
    assert!(wait_until(Duration::from_secs(1), || connector.pending_requests() == 1));

    let err = connector
        .send_request(
            Request::new(REQUESTS, "two")
                .with_correlation_id("dup")
                .with_timeout(Duration::from_millis(400)),
        )
        .unwrap_err();
    assert!(matches!(err, CorrelatorError::DuplicateCorrelationId(id) if id == "dup"));

    assert!(first.join().unwrap().unwrap().is_timeout());
    assert_eq!(harness.transport.published(REQUESTS).len(), 1);
    connector.shutdown();
}

#[test]
fn publish_failure_surfaces_as_error() {
    let harness = Harness::new();
    harness.context.ensure_topic(REQUESTS).unwrap();
    let connector = connector(&harness);
    harness
        .transport
        .fail_next_publish(pubsub_relay::TransportError::Unavailable("down".into()));

    let err = connector
        .send_and_await(REQUESTS, "x", Duration::from_secs(1))
        .unwrap_err();
    assert!(matches!(err, CorrelatorError::Publish(_)));
    assert_eq!(connector.pending_requests(), 0);
    connector.shutdown();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn async_request_resolves() {
    let harness = Harness::new();
    start_responder(&harness, Duration::from_millis(50), echo_hi);
    let connector = connector(&harness);

    let exchange = connector
        .send_request_async(
            Request::new(REQUESTS, json!({ "text": "hello" }))
                .with_correlation_id("async-1")
                .with_timeout(Duration::from_secs(2)),
        )
        .await
        .unwrap();

    assert_eq!(exchange.response_text(), Some("hi"));
    assert!(exchange.latency_ms.unwrap() >= 50.0);
    let round_trip = exchange.receive_time.unwrap() - exchange.send_time.unwrap();
    assert!(round_trip >= 0.049, "round trip was {round_trip}s");
    connector.shutdown();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn async_request_times_out() {
    let harness = Harness::new();
    harness.context.ensure_topic(REQUESTS).unwrap();
    let connector = connector(&harness);

    let started = Instant::now();
    let exchange = connector
        .send_and_await_async(REQUESTS, "anyone?", Duration::from_millis(150))
        .await
        .unwrap();

    assert!(exchange.is_timeout());
    assert!(started.elapsed() < Duration::from_millis(400));
    assert_eq!(connector.pending_requests(), 0);
    connector.shutdown();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn abandoned_async_request_releases_its_id() {
    let harness = Harness::new();
    harness.context.ensure_topic(REQUESTS).unwrap();
    let connector = connector(&harness);

    let request = Request::new(REQUESTS, "anyone?")
        .with_correlation_id("id-1")
        .with_timeout(Duration::from_secs(5));
    let abandoned =
        tokio::time::timeout(Duration::from_millis(50), connector.send_request_async(request)).await;
    assert!(abandoned.is_err());
    assert_eq!(connector.pending_requests(), 0);

    let exchange = connector
        .send_request_async(
            Request::new(REQUESTS, "again")
                .with_correlation_id("id-1")
                .with_timeout(Duration::from_millis(50)),
        )
        .await
        .unwrap();
    assert!(exchange.is_timeout());
    assert_eq!(harness.transport.published(REQUESTS).len(), 2);
    connector.shutdown();
}

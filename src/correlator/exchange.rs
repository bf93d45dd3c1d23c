//! Result records returned by the connector.

use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use serde::Serialize;
use serde_json::Value;

use super::pending::{Reply, Timings};
use crate::payload::{Payload, MESSAGE_FIELD};

/// Milliseconds spent in each stage of a request.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct StageTimings {
    /// Before the send started (includes waiting for a worker).
    pub preparation: f64,
    /// Submitting the request to the transport.
    pub outbound: f64,
    /// From the send completing until the reply was routed.
    pub remote_processing: f64,
    /// From the reply being routed until the result was built.
    pub finalize: f64,
    pub total: f64,
}

/// Either per-stage timings or why there are none.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum LatencyBreakdown {
    Stages(StageTimings),
    TimedOut { error: String },
}

/// Outcome of one request/reply round trip.
///
/// A timeout is a normal value: `response`, `latency_ms` and both timestamps
/// are `None` and the breakdown carries the reason.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Exchange {
    pub response: Option<Payload>,
    #[serde(rename = "latency")]
    pub latency_ms: Option<f64>,
    /// Seconds since the UNIX epoch when the request started.
    pub send_time: Option<f64>,
    /// Seconds since the UNIX epoch when the reply was received.
    pub receive_time: Option<f64>,
    pub correlation_id: String,
    pub received_correlation_id: Option<String>,
    pub latency_breakdown: LatencyBreakdown,
}

impl Exchange {
    pub fn is_timeout(&self) -> bool {
        self.response.is_none()
    }

    /// The response as text, when it is text.
    pub fn response_text(&self) -> Option<&str> {
        self.response.as_ref().and_then(Payload::as_text)
    }

    pub(crate) fn timed_out(correlation_id: impl Into<String>, timeout: Duration) -> Self {
        Self {
            response: None,
            latency_ms: None,
            send_time: None,
            receive_time: None,
            correlation_id: correlation_id.into(),
            received_correlation_id: None,
            latency_breakdown: LatencyBreakdown::TimedOut {
                error: format!("Timeout waiting for response after {timeout:?}"),
            },
        }
    }

    pub(crate) fn completed(correlation_id: impl Into<String>, reply: Reply, timings: Timings) -> Self {
        let finished = Instant::now();
        let received = reply.received_at;
        let send_started = timings.send_started.unwrap_or(timings.started);
        let send_completed = timings.send_completed.unwrap_or(send_started);

        let stages = StageTimings {
            preparation: millis(timings.started, send_started),
            outbound: millis(send_started, send_completed),
            remote_processing: millis(send_completed, received),
            finalize: millis(received, finished),
            total: millis(timings.started, finished),
        };
        let received_correlation_id = reply.payload.correlation_id().map(str::to_owned);
        let received_at = timings.started_at + received.saturating_duration_since(timings.started);

        Self {
            response: Some(extract_response(reply.payload)),
            latency_ms: Some(millis(timings.started, received)),
            send_time: Some(epoch_secs(timings.started_at)),
            receive_time: Some(epoch_secs(received_at)),
            correlation_id: correlation_id.into(),
            received_correlation_id,
            latency_breakdown: LatencyBreakdown::Stages(stages),
        }
    }
}

/// A structured reply's `message` field is the response; otherwise the whole payload.
fn extract_response(payload: Payload) -> Payload {
    match payload {
        Payload::Structured(Value::Object(mut record)) => match record.remove(MESSAGE_FIELD) {
            Some(Value::String(text)) => Payload::Text(text),
            Some(value) => Payload::Structured(value),
            None => Payload::Structured(Value::Object(record)),
        },
        other => other,
    }
}

fn millis(from: Instant, to: Instant) -> f64 {
    to.saturating_duration_since(from).as_secs_f64() * 1000.0
}

fn epoch_secs(at: SystemTime) -> f64 {
    at.duration_since(UNIX_EPOCH)
        .map_or(0.0, |since| since.as_secs_f64())
}

//! Span helpers for remote calls and producer runs.

use tracing::Span;
use uuid::Uuid;

/// Start a span for one remote call attempt.
///
/// `call.attempt` and `http.status` are declared empty and filled by
/// [`record_attempt`].
pub fn start_call_span(method: &str, path: &str) -> Span {
    tracing::debug_span!(
        "remote.call",
        "http.method" = method,
        "http.path" = path,
        "call.attempt" = tracing::field::Empty,
        "http.status" = tracing::field::Empty,
    )
}

/// Record the attempt index and status (absent on transport failure).
pub fn record_attempt(span: &Span, attempt: u32, status: Option<u16>) {
    span.record("call.attempt", attempt);
    if let Some(status) = status {
        span.record("http.status", status);
    }
}

/// Start a span covering a whole producer run (download or provision).
pub fn start_producer_span(kind: &str, run_id: &Uuid) -> Span {
    tracing::info_span!(
        "producer.run",
        "producer.kind" = kind,
        "producer.run_id" = %run_id,
    )
}

/// Record a producer state transition on the given span.
pub fn record_state_transition(span: &Span, from: &str, to: &str) {
    span.in_scope(|| {
        tracing::info!(from = from, to = to, "state_transition");
    });
}

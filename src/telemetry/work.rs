//! Message processing span helpers.
//!
//! Provides span creation and transition recording for messages flowing
//! from grant to confirm.

use tracing::Span;

use crate::model::{Message, WorkerId};

/// Start a span covering one granted message.
///
/// The `message.outcome` field is declared empty and can be filled via
/// [`record_outcome`].
pub fn start_message_span(worker: &WorkerId, message: &Message) -> Span {
    tracing::info_span!(
        "keyq.process",
        "worker.id" = %worker,
        "message.id" = %message.id,
        "message.key" = %message.key,
        "message.operation" = %message.operation,
        "message.outcome" = tracing::field::Empty,
    )
}

/// Record a transition event on the given span.
///
/// Emits a tracing `info` event scoped to the given span.
pub fn record_transition(span: &Span, from: &str, to: &str) {
    span.in_scope(|| {
        tracing::info!(from = from, to = to, "transition");
    });
}

/// Fill the span's outcome field ("confirmed", "released", ...).
pub fn record_outcome(span: &Span, outcome: &str) {
    span.record("message.outcome", outcome);
}

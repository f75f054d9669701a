//! Span helpers for work items moving through the relay.

use opentelemetry::KeyValue;
use tracing::Span;

use crate::lease::WorkerId;
use crate::model::work::{Status, WorkId};

/// Start a span for one delivery attempt.
///
/// `work.state` is declared empty and filled in by
/// [`record_state_transition`].
pub fn start_delivery_span(worker: &WorkerId, work_id: WorkId, business_key: &str) -> Span {
    tracing::info_span!(
        "work.deliver",
        "work.id" = %work_id,
        "work.business_key" = business_key,
        "work.worker" = %worker,
        "work.state" = tracing::field::Empty,
    )
}

/// Start a span for one reconciliation sweep.
pub fn start_sweep_span(run_id: &uuid::Uuid) -> Span {
    tracing::info_span!(
        "reconcile.sweep",
        "reconcile.run_id" = %run_id,
        "reconcile.health" = tracing::field::Empty,
    )
}

/// Record a state transition on `span` and in the transition counter.
pub fn record_state_transition(span: &Span, from: Status, to: Status) {
    span.record("work.state", to.as_str());
    span.in_scope(|| {
        tracing::info!(from = %from, to = %to, "state_transition");
    });
    super::metrics::work_state_transitions().add(
        1,
        &[
            KeyValue::new("from", from.as_str()),
            KeyValue::new("to", to.as_str()),
        ],
    );
}

//! Metric instruments.
//!
//! Instruments come from the `"ledgersync"` meter on the globally-registered
//! `MeterProvider`. Without an OTLP endpoint the global provider is a no-op
//! and recording is free.

use opentelemetry::metrics::{Counter, Gauge, Histogram, Meter};

fn meter() -> Meter {
    opentelemetry::global::meter("ledgersync")
}

/// Counter: work items ingested.
/// Labels: `result` ("created" | "duplicate").
pub fn work_ingested() -> Counter<u64> {
    meter()
        .u64_counter("ledgersync.work.ingested")
        .with_description("Number of work items ingested")
        .build()
}

/// Counter: work item state transitions.
/// Labels: `from`, `to`.
pub fn work_state_transitions() -> Counter<u64> {
    meter()
        .u64_counter("ledgersync.work.state_transitions")
        .with_description("Number of work item state transitions")
        .build()
}

/// Counter: ledger mutations committed.
/// Labels: `outbox` ("written" | "none").
pub fn outbox_committed() -> Counter<u64> {
    meter()
        .u64_counter("ledgersync.outbox.committed")
        .with_description("Ledger mutations committed, with or without an outbox record")
        .build()
}

/// Counter: delivery attempts.
/// Labels: `result` ("completed" | "cached" | "retry" | "failed" | "lease_lost").
pub fn delivery_attempts() -> Counter<u64> {
    meter()
        .u64_counter("ledgersync.relay.delivery_attempts")
        .with_description("Outbox delivery attempts by result")
        .build()
}

/// Counter: lease compare-and-set attempts.
/// Labels: `result` ("acquired" | "contended").
pub fn lease_acquisitions() -> Counter<u64> {
    meter()
        .u64_counter("ledgersync.relay.lease_acquisitions")
        .with_description("Lease acquisition attempts by result")
        .build()
}

/// Counter: reconciliation findings.
/// Labels: `class`.
pub fn reconciliation_findings() -> Counter<u64> {
    meter()
        .u64_counter("ledgersync.reconcile.findings")
        .with_description("Reconciliation findings by divergence class")
        .build()
}

/// Gauge: health score of the last sweep, 0.0 to 1.0.
pub fn reconciliation_health() -> Gauge<f64> {
    meter()
        .f64_gauge("ledgersync.reconcile.health_score")
        .with_description("Health score of the most recent reconciliation sweep")
        .build()
}

/// Gauge: undelivered outbox records.
pub fn backlog_depth() -> Gauge<u64> {
    meter()
        .u64_gauge("ledgersync.outbox.backlog_depth")
        .with_description("Undelivered outbox records")
        .build()
}

/// Gauge: age of the oldest undelivered outbox record, in seconds.
pub fn backlog_age_secs() -> Gauge<f64> {
    meter()
        .f64_gauge("ledgersync.outbox.backlog_age")
        .with_description("Age of the oldest undelivered outbox record")
        .with_unit("s")
        .build()
}

/// Histogram: operation duration in milliseconds.
/// Labels: `operation`.
pub fn operation_duration_ms() -> Histogram<f64> {
    meter()
        .f64_histogram("ledgersync.operation.duration_ms")
        .with_description("Operation duration in milliseconds")
        .with_unit("ms")
        .build()
}

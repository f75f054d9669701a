//! Integration tests for telemetry initialization and span helpers.

use std::collections::HashMap;
use std::time::Duration;

use ledgersync::lease::WorkerId;
use ledgersync::model::work::{Status, WorkId};
use uuid::Uuid;

fn test_config() -> ledgersync::telemetry::TelemetryConfig {
    ledgersync::telemetry::TelemetryConfig {
        endpoint: None,
        service_name: "ledgersync-test".to_string(),
        log_level: "debug".to_string(),
        instance_id: "ledgersync-test-1".to_string(),
        owner: "ledgersync".to_string(),
        collection: "replies".to_string(),
        metrics_interval: Duration::from_secs(5),
    }
}

#[test]
fn telemetry_initializes_without_endpoint() {
    // Note: tracing subscriber can only be set once per process.
    // This may return Err if a global subscriber was already set by
    // another test in this process; that is acceptable.
    if let Ok(guard) = ledgersync::telemetry::init_telemetry(test_config()) {
        assert!(!guard.is_exporting());
    }
}

#[test]
fn resource_identifies_owner_collection_and_instance() {
    let attributes: HashMap<String, String> = test_config()
        .resource_attributes()
        .into_iter()
        .map(|kv| (kv.key.to_string(), kv.value.to_string()))
        .collect();

    assert_eq!(attributes["service.instance.id"], "ledgersync-test-1");
    assert_eq!(attributes["ledgersync.owner"], "ledgersync");
    assert_eq!(attributes["ledgersync.collection"], "replies");
    assert_eq!(attributes["service.version"], env!("CARGO_PKG_VERSION"));
}

#[test]
fn config_derives_telemetry_identity() {
    let env: HashMap<&str, &str> = HashMap::from([
        ("DATABASE_URL", "postgres://localhost/ledger"),
        ("LEDGERSYNC_COLLECTION", "remittances"),
        ("LEDGERSYNC_OWNER", "payments"),
    ]);
    let config = ledgersync::config::Config::from_lookup(|k| env.get(k).map(|v| v.to_string())).unwrap();

    let telemetry = ledgersync::telemetry::TelemetryConfig::from_config(&config);
    assert_eq!(telemetry.owner, "payments");
    assert_eq!(telemetry.collection, "remittances");
    assert!(telemetry.instance_id.starts_with("ledgersync"));
    assert_eq!(telemetry.endpoint, None);
}

#[test]
fn delivery_span_records_transitions() {
    let span = ledgersync::telemetry::work::start_delivery_span(
        &WorkerId::new("relay-0"),
        WorkId::new(),
        "reply-1",
    );
    ledgersync::telemetry::work::record_state_transition(&span, Status::Queued, Status::Processing);
    ledgersync::telemetry::work::record_state_transition(
        &span,
        Status::Processing,
        Status::Completed,
    );
}

#[test]
fn sweep_span_accepts_health() {
    let span = ledgersync::telemetry::work::start_sweep_span(&Uuid::new_v4());
    span.record("reconcile.health", 0.7);
}

#[test]
fn metric_instruments_record_without_a_provider() {
    use opentelemetry::KeyValue;
    use ledgersync::telemetry::metrics;

    metrics::delivery_attempts().add(1, &[KeyValue::new("result", "completed")]);
    metrics::reconciliation_health().record(1.0, &[]);
    metrics::backlog_depth().record(0, &[]);
    metrics::operation_duration_ms().record(1.5, &[KeyValue::new("operation", "deliver")]);
}

//! Logging, traces and metrics.
//!
//! Events always go to stderr through `tracing-subscriber`. With an OTLP
//! endpoint the same events, the delivery and sweep spans and the
//! `ledgersync` meter are exported as well. Every signal carries the
//! replica owner, collection and process instance as resource attributes,
//! so several relays writing into one collection can be told apart.

pub mod metrics;
pub mod work;

use std::time::Duration;

use opentelemetry::KeyValue;
use opentelemetry::trace::TracerProvider as _;
use opentelemetry_appender_tracing::layer::OpenTelemetryTracingBridge;
use opentelemetry_otlp::{ExporterBuildError, WithExportConfig as _};
use opentelemetry_sdk::Resource;
use opentelemetry_sdk::logs::SdkLoggerProvider;
use opentelemetry_sdk::metrics::{Instrument, PeriodicReader, SdkMeterProvider, Stream};
use opentelemetry_sdk::trace::SdkTracerProvider;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt as _;
use tracing_subscriber::util::SubscriberInitExt as _;

use crate::config::Config;
use crate::error::{Error, Result};
use crate::lease::WorkerId;

/// Scope name for the tracer; the meter uses the same one.
const SCOPE: &str = "ledgersync";

/// Every instrument is labelled with small enums (status, result, class).
/// More attribute sets than this on one instrument means a labelling bug.
const CARDINALITY_LIMIT: usize = 200;

const DEFAULT_METRICS_INTERVAL: Duration = Duration::from_secs(30);

pub struct TelemetryConfig {
    /// OTLP gRPC endpoint (e.g. "http://localhost:4317"). `None` logs to
    /// stderr only and leaves the metric instruments as no-ops.
    pub endpoint: Option<String>,
    pub service_name: String,
    /// Filter directive used when `RUST_LOG` is not set.
    pub log_level: String,
    /// Reported as `service.instance.id`.
    pub instance_id: String,
    /// Replica field owner this process writes as.
    pub owner: String,
    pub collection: String,
    pub metrics_interval: Duration,
}

impl TelemetryConfig {
    pub fn from_config(config: &Config) -> Self {
        Self {
            endpoint: config.otel_endpoint.clone(),
            service_name: SCOPE.to_string(),
            log_level: config.log_level.clone(),
            instance_id: WorkerId::unique(SCOPE).to_string(),
            owner: config.owner.clone(),
            collection: config.collection.clone(),
            metrics_interval: DEFAULT_METRICS_INTERVAL,
        }
    }

    /// Resource attributes besides `service.name`.
    pub fn resource_attributes(&self) -> Vec<KeyValue> {
        vec![
            KeyValue::new(
                opentelemetry_semantic_conventions::resource::SERVICE_VERSION,
                env!("CARGO_PKG_VERSION"),
            ),
            KeyValue::new("service.instance.id", self.instance_id.clone()),
            KeyValue::new("ledgersync.owner", self.owner.clone()),
            KeyValue::new("ledgersync.collection", self.collection.clone()),
        ]
    }

    fn resource(&self) -> Resource {
        Resource::builder()
            .with_service_name(self.service_name.clone())
            .with_attributes(self.resource_attributes())
            .build()
    }
}

/// OTLP providers for the three signals.
struct Pipelines {
    tracer: SdkTracerProvider,
    meter: SdkMeterProvider,
    logger: SdkLoggerProvider,
}

impl Pipelines {
    fn otlp(endpoint: &str, config: &TelemetryConfig) -> Result<Self> {
        let resource = config.resource();

        let spans = opentelemetry_otlp::SpanExporter::builder()
            .with_tonic()
            .with_endpoint(endpoint)
            .build()
            .map_err(exporter_error("span"))?;
        let tracer = SdkTracerProvider::builder()
            .with_batch_exporter(spans)
            .with_resource(resource.clone())
            .build();

        let metrics = opentelemetry_otlp::MetricExporter::builder()
            .with_tonic()
            .with_endpoint(endpoint)
            .build()
            .map_err(exporter_error("metric"))?;
        let meter = SdkMeterProvider::builder()
            .with_reader(
                PeriodicReader::builder(metrics)
                    .with_interval(config.metrics_interval)
                    .build(),
            )
            .with_view(bounded_streams)
            .with_resource(resource.clone())
            .build();

        let logs = opentelemetry_otlp::LogExporter::builder()
            .with_tonic()
            .with_endpoint(endpoint)
            .build()
            .map_err(exporter_error("log"))?;
        let logger = SdkLoggerProvider::builder()
            .with_batch_exporter(logs)
            .with_resource(resource)
            .build();

        Ok(Self {
            tracer,
            meter,
            logger,
        })
    }

    /// Flush and stop each provider.
    fn shutdown(self) {
        if let Err(e) = self.logger.shutdown() {
            tracing::warn!(error = %e, "log pipeline shutdown failed");
        }
        if let Err(e) = self.meter.shutdown() {
            tracing::warn!(error = %e, "metric pipeline shutdown failed");
        }
        if let Err(e) = self.tracer.shutdown() {
            tracing::warn!(error = %e, "trace pipeline shutdown failed");
        }
    }
}

fn exporter_error(signal: &'static str) -> impl Fn(ExporterBuildError) -> Error {
    move |e| Error::Other(format!("failed to create OTLP {signal} exporter: {e}"))
}

fn bounded_streams(instrument: &Instrument) -> Option<Stream> {
    if !instrument.name().starts_with("ledgersync.") {
        return None;
    }
    Stream::builder()
        .with_cardinality_limit(CARDINALITY_LIMIT)
        .build()
        .ok()
}

/// Holds the exporting providers; dropping it flushes and shuts them down.
pub struct TelemetryGuard {
    pipelines: Option<Pipelines>,
}

impl TelemetryGuard {
    pub fn is_exporting(&self) -> bool {
        self.pipelines.is_some()
    }
}

impl Drop for TelemetryGuard {
    fn drop(&mut self) {
        if let Some(pipelines) = self.pipelines.take() {
            pipelines.shutdown();
        }
    }
}

/// Install the global subscriber, and the global meter provider when
/// exporting. Fails if exporters cannot be built or a subscriber is
/// already set.
pub fn init_telemetry(config: TelemetryConfig) -> Result<TelemetryGuard> {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    let pipelines = config
        .endpoint
        .as_deref()
        .map(|endpoint| Pipelines::otlp(endpoint, &config))
        .transpose()?;

    let trace_layer = pipelines
        .as_ref()
        .map(|p| tracing_opentelemetry::layer().with_tracer(p.tracer.tracer(SCOPE)));
    let log_layer = pipelines
        .as_ref()
        .map(|p| OpenTelemetryTracingBridge::new(&p.logger));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().compact())
        .with(trace_layer)
        .with(log_layer)
        .try_init()
        .map_err(|e| Error::Other(format!("failed to init tracing subscriber: {e}")))?;

    if let Some(p) = &pipelines {
        opentelemetry::global::set_meter_provider(p.meter.clone());
    }

    tracing::info!(
        instance = %config.instance_id,
        owner = %config.owner,
        collection = %config.collection,
        exporting = pipelines.is_some(),
        "telemetry initialized"
    );
    Ok(TelemetryGuard { pipelines })
}

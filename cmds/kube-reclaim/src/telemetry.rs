//! Tracing subscriber and OpenTelemetry export setup.

use std::io::IsTerminal;

use anyhow::{Context, Result};
use opentelemetry::trace::TracerProvider as _;
use opentelemetry_sdk::{trace::SdkTracerProvider, Resource};
use tracing::Level;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

/// Environment variable for service name (not exported by opentelemetry_sdk).
const OTEL_SERVICE_NAME: &str = "OTEL_SERVICE_NAME";

const SERVICE_NAME: &str = "kube-reclaim";

/// Keeps the OpenTelemetry pipeline alive; spans are flushed on drop.
pub struct TelemetryGuard {
	_otel: Option<OtelGuard>,
}

struct OtelGuard {
	tracer_provider: SdkTracerProvider,
}

impl Drop for OtelGuard {
	fn drop(&mut self) {
		if let Err(e) = self.tracer_provider.shutdown() {
			eprintln!("failed to flush traces: {e}");
		}
	}
}

/// Log line format on stderr.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LogFormat {
	Pretty,
	Json,
}

impl LogFormat {
	fn detect() -> Self {
		if std::io::stderr().is_terminal() {
			Self::Pretty
		} else {
			Self::Json
		}
	}
}

/// Install the global subscriber.
///
/// The level comes from `--log-level`, else `RUST_LOG`, else `info`.
/// Output is pretty on a terminal and JSON otherwise, always on stderr so
/// that reports on stdout stay machine-readable.
///
/// Spans are exported over OTLP when `OTEL_EXPORTER_OTLP_ENDPOINT` or
/// `OTEL_EXPORTER_OTLP_TRACES_ENDPOINT` is set; the standard `OTEL_*`
/// variables apply and `service.name` defaults to "kube-reclaim".
pub fn init(log_level: Option<Level>) -> Result<TelemetryGuard> {
	let fmt_layer = match LogFormat::detect() {
		LogFormat::Pretty => tracing_subscriber::fmt::layer()
			.with_writer(std::io::stderr)
			.pretty()
			.boxed(),
		LogFormat::Json => tracing_subscriber::fmt::layer()
			.with_writer(std::io::stderr)
			.json()
			.boxed(),
	};
	let registry = tracing_subscriber::registry()
		.with(filter(log_level))
		.with(fmt_layer);

	if !otel_export_enabled() {
		registry.init();
		return Ok(TelemetryGuard { _otel: None });
	}

	let tracer_provider = tracer_provider()?;
	let otel_layer = tracing_opentelemetry::layer()
		.with_error_records_to_exceptions(true)
		.with_tracer(tracer_provider.tracer(SERVICE_NAME));
	opentelemetry::global::set_tracer_provider(tracer_provider.clone());
	registry.with(otel_layer).init();

	Ok(TelemetryGuard {
		_otel: Some(OtelGuard { tracer_provider }),
	})
}

fn filter(log_level: Option<Level>) -> EnvFilter {
	match log_level {
		Some(level) => EnvFilter::new(level.as_str()),
		None => EnvFilter::builder()
			.with_default_directive(Level::INFO.into())
			.from_env_lossy(),
	}
}

fn otel_export_enabled() -> bool {
	std::env::var(opentelemetry_otlp::OTEL_EXPORTER_OTLP_ENDPOINT).is_ok()
		|| std::env::var(opentelemetry_otlp::OTEL_EXPORTER_OTLP_TRACES_ENDPOINT).is_ok()
}

fn tracer_provider() -> Result<SdkTracerProvider> {
	let mut resource = Resource::builder();
	if std::env::var(OTEL_SERVICE_NAME).is_err() {
		resource = resource.with_service_name(SERVICE_NAME);
	}

	let protocol = std::env::var(opentelemetry_otlp::OTEL_EXPORTER_OTLP_PROTOCOL);
	let exporter = match protocol
		.as_deref()
		.unwrap_or(opentelemetry_otlp::OTEL_EXPORTER_OTLP_PROTOCOL_DEFAULT)
	{
		"grpc" => opentelemetry_otlp::SpanExporter::builder()
			.with_tonic()
			.build(),
		_ => opentelemetry_otlp::SpanExporter::builder()
			.with_http()
			.build(),
	}
	.context("building OTLP span exporter")?;

	Ok(SdkTracerProvider::builder()
		.with_resource(resource.build())
		.with_batch_exporter(exporter)
		.build())
}

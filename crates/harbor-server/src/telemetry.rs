//! JSON logs on stderr, plus OTLP export of the collector's gauges when an endpoint is set.

use opentelemetry::KeyValue;
use opentelemetry::metrics::{Meter, MeterProvider as _};
use opentelemetry_otlp::MetricExporter;
use opentelemetry_sdk::Resource;
use opentelemetry_sdk::metrics::{PeriodicReader, SdkMeterProvider};
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

const SERVICE_NAME: &str = "harbord";
const ENV_OTLP_ENDPOINT: &str = "OTEL_EXPORTER_OTLP_ENDPOINT";
const EXPORT_INTERVAL: Duration = Duration::from_secs(30);

type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Owns the meter provider for the lifetime of the process.
#[derive(Default)]
pub struct Telemetry {
    meters: Option<SdkMeterProvider>,
}

impl Telemetry {
    /// Installs the global subscriber; call once.
    pub fn init(server_name: &str) -> Self {
        let env_filter =
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
        let stderr_layer = tracing_subscriber::fmt::layer()
            .with_writer(std::io::stderr)
            .with_thread_ids(true)
            .with_span_events(FmtSpan::CLOSE)
            .json();
        tracing_subscriber::registry()
            .with(env_filter)
            .with(stderr_layer)
            .init();

        if std::env::var_os(ENV_OTLP_ENDPOINT).is_none() {
            info!("metric export disabled, {ENV_OTLP_ENDPOINT} is not set");
            return Self::default();
        }
        match otlp_meters(server_name) {
            Ok(meters) => {
                info!("exporting nats.server metrics over OTLP");
                Self {
                    meters: Some(meters),
                }
            }
            Err(e) => {
                warn!(error = %e, "metric export disabled, OTLP exporter failed to build");
                Self::default()
            }
        }
    }

    /// Meter for the varz collector; instruments are no-ops when export is disabled.
    pub fn meter(&self) -> Meter {
        match &self.meters {
            Some(meters) => meters.meter(SERVICE_NAME),
            None => opentelemetry::global::meter(SERVICE_NAME),
        }
    }

    pub fn is_exporting(&self) -> bool {
        self.meters.is_some()
    }

    /// Flushes pending data points, then stops the exporter.
    pub fn shutdown(self) {
        let Some(meters) = self.meters else {
            return;
        };
        if let Err(e) = meters.force_flush() {
            warn!(error = %e, "failed to flush metrics");
        }
        if let Err(e) = meters.shutdown() {
            warn!(error = %e, "failed to stop the metric exporter");
        }
    }
}

fn otlp_meters(server_name: &str) -> Result<SdkMeterProvider, BoxError> {
    let exporter = MetricExporter::builder().with_http().build()?;
    let resource = Resource::builder()
        .with_service_name(SERVICE_NAME)
        .with_attributes([KeyValue::new("nats.server.name", server_name.to_owned())])
        .build();
    Ok(SdkMeterProvider::builder()
        .with_reader(
            PeriodicReader::builder(exporter)
                .with_interval(EXPORT_INTERVAL)
                .build(),
        )
        .with_resource(resource)
        .build())
}

//! Bootstrap utilities for the ingress binary.
//!
//! Logging, OpenTelemetry export, and shutdown signal handling.

use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::config::LOG_ENV_VAR;

/// Service name reported to OpenTelemetry.
pub const SERVICE_NAME: &str = "rabbitmq-ingress";
/// Exporters are only installed when this is set.
pub const OTLP_ENDPOINT_ENV_VAR: &str = "OTEL_EXPORTER_OTLP_ENDPOINT";

/// Handles to installed telemetry providers, flushed by [`shutdown_telemetry`].
#[derive(Default)]
pub struct Telemetry {
    #[cfg(feature = "otel")]
    providers: Option<otel::Providers>,
}

fn env_filter() -> EnvFilter {
    EnvFilter::try_from_env(LOG_ENV_VAR).unwrap_or_else(|_| EnvFilter::new("info"))
}

/// Initialize tracing with the INGRESS_LOG environment variable.
///
/// Defaults to "info" level if INGRESS_LOG is not set. With the `otel`
/// feature, the W3C trace-context propagator is always installed; span and
/// metric exporters are added when `OTEL_EXPORTER_OTLP_ENDPOINT` is set.
pub fn init_tracing() -> Telemetry {
    #[cfg(feature = "otel")]
    {
        opentelemetry::global::set_text_map_propagator(
            opentelemetry_sdk::propagation::TraceContextPropagator::new(),
        );

        if let Ok(endpoint) = std::env::var(OTLP_ENDPOINT_ENV_VAR) {
            match otel::Providers::install(&endpoint) {
                Ok(providers) => {
                    use opentelemetry::trace::TracerProvider as _;

                    let tracer = providers.tracer.tracer(SERVICE_NAME);
                    tracing_subscriber::registry()
                        .with(env_filter())
                        .with(tracing_subscriber::fmt::layer())
                        .with(tracing_opentelemetry::layer().with_tracer(tracer))
                        .init();
                    info!(%endpoint, service = SERVICE_NAME, "OpenTelemetry export enabled");
                    return Telemetry {
                        providers: Some(providers),
                    };
                }
                Err(e) => {
                    init_fmt_only();
                    tracing::warn!(error = %e, %endpoint, "Failed to initialize OpenTelemetry export");
                    return Telemetry::default();
                }
            }
        }
    }

    init_fmt_only();
    Telemetry::default()
}

fn init_fmt_only() {
    tracing_subscriber::registry()
        .with(env_filter())
        .with(tracing_subscriber::fmt::layer())
        .init();
}

/// Flush and shut down exporters installed by [`init_tracing`].
pub fn shutdown_telemetry(telemetry: Telemetry) {
    #[cfg(feature = "otel")]
    {
        if let Some(providers) = telemetry.providers {
            providers.shutdown();
        }
    }
    #[cfg(not(feature = "otel"))]
    let _ = telemetry;
}

/// Resolves on SIGINT or SIGTERM.
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};

        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received SIGINT, shutting down"),
        _ = terminate => info!("Received SIGTERM, shutting down"),
    }
}

#[cfg(feature = "otel")]
mod otel {
    use opentelemetry::KeyValue;
    use opentelemetry_otlp::WithExportConfig;
    use opentelemetry_sdk::metrics::{PeriodicReader, SdkMeterProvider};
    use opentelemetry_sdk::trace::TracerProvider;
    use opentelemetry_sdk::{runtime, Resource};

    use super::SERVICE_NAME;

    pub(super) struct Providers {
        pub(super) tracer: TracerProvider,
        meter: SdkMeterProvider,
    }

    impl Providers {
        /// Build OTLP span and metric pipelines and register them globally.
        pub(super) fn install(
            endpoint: &str,
        ) -> Result<Self, Box<dyn std::error::Error + Send + Sync>> {
            let resource = Resource::new(vec![KeyValue::new("service.name", SERVICE_NAME)]);

            let span_exporter = opentelemetry_otlp::SpanExporter::builder()
                .with_tonic()
                .with_endpoint(endpoint)
                .build()?;
            let tracer = TracerProvider::builder()
                .with_batch_exporter(span_exporter, runtime::Tokio)
                .with_resource(resource.clone())
                .build();

            let metric_exporter = opentelemetry_otlp::MetricExporter::builder()
                .with_tonic()
                .with_endpoint(endpoint)
                .build()?;
            let reader = PeriodicReader::builder(metric_exporter, runtime::Tokio).build();
            let meter = SdkMeterProvider::builder()
                .with_reader(reader)
                .with_resource(resource)
                .build();

            opentelemetry::global::set_tracer_provider(tracer.clone());
            opentelemetry::global::set_meter_provider(meter.clone());

            Ok(Self { tracer, meter })
        }

        pub(super) fn shutdown(self) {
            if let Err(e) = self.tracer.shutdown() {
                tracing::error!(error = %e, "Failed to shut down tracer provider");
            }
            if let Err(e) = self.meter.shutdown() {
                tracing::error!(error = %e, "Failed to shut down meter provider");
            }
        }
    }
}

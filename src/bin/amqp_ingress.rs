//! amqp-ingress: HTTP ingress for a RabbitMQ-backed event broker
//!
//! Accepts CloudEvents on `POST /` and publishes each one to a single
//! exchange with publisher confirms.
//!
//! ## Architecture
//! ```text
//! [HTTP :PORT] -> [Ingress handler] -> [Publisher] -> [Exchange]
//!                                           ^
//!                                           |
//!                                     [Supervisor] <- reconnect requests
//! ```
//!
//! ## Configuration
//! - PORT: HTTP listen port (default: 8080)
//! - BROKER_URL: AMQP URL of the broker (required)
//! - EXCHANGE_NAME: destination exchange (required)
//! - BROKER_NAME / BROKER_NAMESPACE: stats dimensions
//! - CONTAINER_NAME / POD_NAME: process identity for metrics
//! - INGRESS_LOG: log filter (default: info)

use std::sync::Arc;

use tracing::{error, info};

use amqp_ingress::broker::AmqpConnector;
use amqp_ingress::config::Config;
use amqp_ingress::ingress::{self, IngressState};
use amqp_ingress::publish::Publisher;
use amqp_ingress::stats::StatsReporter;
use amqp_ingress::supervisor::Supervisor;
use amqp_ingress::utils::bootstrap::{init_tracing, shutdown_signal, shutdown_telemetry};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let telemetry = init_tracing();

    let config = match Config::load(None) {
        Ok(config) => config,
        Err(e) => {
            error!(error = %e, "Failed to load configuration");
            return Err(e.into());
        }
    };
    let endpoint = config.broker_endpoint()?;

    info!(
        port = config.port,
        broker = %endpoint.redacted_url(),
        exchange = %endpoint.exchange,
        "Starting amqp-ingress"
    );

    let supervisor = Arc::new(
        Supervisor::start(endpoint, AmqpConnector::new(), config.reconnect()).await,
    );

    let state = IngressState {
        publisher: Publisher::new(Arc::clone(&supervisor)),
        reporter: stats_reporter(&config),
        namespace: config.broker_namespace.clone(),
        broker_name: config.broker_name.clone(),
    };

    let listener = tokio::net::TcpListener::bind(("0.0.0.0", config.port)).await?;
    let served = ingress::serve(listener, ingress::router(state), shutdown_signal()).await;

    supervisor.shutdown().await;
    info!("amqp-ingress stopped");
    shutdown_telemetry(telemetry);

    served?;
    Ok(())
}

#[cfg(feature = "otel")]
fn stats_reporter(config: &Config) -> Arc<dyn StatsReporter> {
    Arc::new(amqp_ingress::stats::OtelStatsReporter::new(
        config.container_name.clone(),
        &config.pod_name,
    ))
}

#[cfg(not(feature = "otel"))]
fn stats_reporter(_config: &Config) -> Arc<dyn StatsReporter> {
    Arc::new(amqp_ingress::stats::LogStatsReporter)
}

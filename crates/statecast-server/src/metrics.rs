//! Prometheus export of the transport metrics.

use metrics_exporter_prometheus::PrometheusBuilder;
use statecast_transport::metrics::names;
use std::net::SocketAddr;
use tracing::info;

/// Describe the metrics recorded by the transport.
pub fn init_metrics() {
    metrics::describe_counter!(
        names::CONNECTIONS_TOTAL,
        "Total number of connections since server start"
    );
    metrics::describe_gauge!(
        names::CONNECTIONS_ACTIVE,
        "Current number of open connections"
    );
    metrics::describe_counter!(names::MESSAGES_TOTAL, "Total number of messages by direction");
    metrics::describe_counter!(names::MESSAGES_BYTES, "Total bytes of messages by direction");
    metrics::describe_counter!(names::BROADCASTS_TOTAL, "Total number of fan-outs");
    metrics::describe_counter!(names::ERRORS_TOTAL, "Total number of errors by type");

    info!("Metrics initialized");
}

/// Start the Prometheus exporter on `port`.
///
/// # Errors
///
/// Returns an error if the exporter cannot be installed.
pub fn start_metrics_server(port: u16) -> anyhow::Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));

    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()?;

    info!("Metrics server listening on {}", addr);
    Ok(())
}

use anyhow::{Context, Result};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Process-wide logging and metrics. Built once in `main`.
pub struct Telemetry {
    metrics_handle: PrometheusHandle,
}

impl Telemetry {
    pub fn init() -> Result<Self> {
        tracing_subscriber::registry()
            .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
            .with(
                tracing_subscriber::fmt::layer()
                    .with_target(false)
                    .with_writer(std::io::stderr),
            )
            .try_init()
            .context("failed to initialise tracing subscriber")?;

        let metrics_handle = PrometheusBuilder::new()
            .install_recorder()
            .context("failed to install Prometheus metrics recorder")?;
        describe_metrics();

        Ok(Self { metrics_handle })
    }

    pub fn metrics_handle(&self) -> PrometheusHandle {
        self.metrics_handle.clone()
    }
}

/// A handle that renders an empty exposition, for routers built without a
/// global recorder.
pub fn detached_metrics_handle() -> PrometheusHandle {
    PrometheusBuilder::new().build_recorder().handle()
}

fn describe_metrics() {
    metrics::describe_gauge!("beach_party_connections_open", "Sockets currently tracked");
    metrics::describe_gauge!("beach_party_sessions_active", "Sessions with a connected console");
    metrics::describe_counter!(
        "beach_party_connections_total",
        "Sockets accepted since start-up"
    );
    metrics::describe_counter!(
        "beach_party_handshakes_total",
        "Handshake attempts by role and outcome"
    );
    metrics::describe_counter!(
        "beach_party_handshake_timeouts_total",
        "Sockets closed for not completing a handshake in time"
    );
    metrics::describe_counter!(
        "beach_party_app_launches_total",
        "Applications launched by name"
    );
    metrics::describe_counter!(
        "beach_party_sessions_terminated_total",
        "Sessions ended by their console disconnecting"
    );
}

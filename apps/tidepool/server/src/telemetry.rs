use anyhow::{Context, Result};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

pub struct Telemetry {
    metrics_handle: PrometheusHandle,
}

impl Telemetry {
    /// Installs the Prometheus recorder and the tracing subscriber. Log
    /// lines are JSON when `TIDEPOOL_LOG_FORMAT=json`.
    pub fn init() -> Result<Self> {
        let metrics_handle = PrometheusBuilder::new()
            .install_recorder()
            .context("failed to install Prometheus metrics recorder")?;

        let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
        let registry = tracing_subscriber::registry().with(filter);
        if json_logs() {
            registry
                .with(fmt::layer().json().with_target(false))
                .try_init()
        } else {
            registry.with(fmt::layer().with_target(false)).try_init()
        }
        .context("failed to initialise tracing subscriber")?;

        Ok(Self { metrics_handle })
    }

    pub fn metrics_handle(&self) -> PrometheusHandle {
        self.metrics_handle.clone()
    }
}

fn json_logs() -> bool {
    match std::env::var("TIDEPOOL_LOG_FORMAT") {
        Ok(val) => val.eq_ignore_ascii_case("json"),
        Err(_) => false,
    }
}

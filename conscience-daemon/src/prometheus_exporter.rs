#![forbid(unsafe_code)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::http::header::CONTENT_TYPE;
use axum::response::IntoResponse;
use axum::{routing::get, Router};
use tokio::task::JoinHandle;
use tracing::warn;

use crate::metrics::MetricsCollector;
use crate::registry::Registry;

#[derive(thiserror::Error, Debug)]
pub enum PrometheusError {
    #[error("initialization failed: {0}")]
    InitializationFailed(String),
}

#[derive(Clone)]
pub struct PrometheusExporter {
    collector: Arc<MetricsCollector>,
    addr: SocketAddr,
}

impl PrometheusExporter {
    pub fn render_metrics(&self) -> String {
        self.collector.render_prometheus()
    }

    pub async fn start_server(&self) -> Result<(JoinHandle<()>, SocketAddr), PrometheusError> {
        let coll = Arc::clone(&self.collector);
        let app = Router::new().route(
            "/metrics",
            get(move || {
                let txt = coll.render_prometheus();
                async move {
                    let mut resp = txt.into_response();
                    if let Ok(v) = "text/plain; version=0.0.4; charset=utf-8".parse() {
                        resp.headers_mut().insert(CONTENT_TYPE, v);
                    }
                    resp
                }
            }),
        );
        let listener = tokio::net::TcpListener::bind(self.addr)
            .await
            .map_err(|e| PrometheusError::InitializationFailed(e.to_string()))?;
        let local = listener
            .local_addr()
            .map_err(|e| PrometheusError::InitializationFailed(e.to_string()))?;
        let server = tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, app).await {
                warn!("prometheus exporter stopped: {e}");
            }
        });
        Ok((server, local))
    }
}

pub struct PrometheusExporterBuilder {
    addr: SocketAddr,
    interval: Duration,
}

impl Default for PrometheusExporterBuilder {
    fn default() -> Self {
        Self { addr: ([127, 0, 0, 1], 9090).into(), interval: Duration::from_secs(15) }
    }
}

impl PrometheusExporterBuilder {
    pub fn new() -> Self {
        Self::default()
    }
    pub fn with_server_addr(mut self, addr: SocketAddr) -> Self {
        self.addr = addr;
        self
    }
    pub fn with_interval_secs(mut self, secs: u64) -> Self {
        self.interval = Duration::from_secs(secs);
        self
    }

    pub fn build(
        self,
        collector: Arc<MetricsCollector>,
        registry: Arc<Registry>,
    ) -> (PrometheusExporter, JoinHandle<()>) {
        let exporter = PrometheusExporter { collector: Arc::clone(&collector), addr: self.addr };
        let handle = collector.start_collection(registry, self.interval);
        (exporter, handle)
    }
}

/// Start the exporter when `CONSCIENCE_PROMETHEUS_ADDR` is set.
/// Returns (server_handle, bound_addr, collector_handle) on success.
pub async fn maybe_start_from_env(
    collector: Arc<MetricsCollector>,
    registry: Arc<Registry>,
) -> Option<(JoinHandle<()>, SocketAddr, JoinHandle<()>)> {
    let addr_env = std::env::var("CONSCIENCE_PROMETHEUS_ADDR").ok()?;
    let addr: SocketAddr = match addr_env.parse() {
        Ok(a) => a,
        Err(e) => {
            warn!("invalid CONSCIENCE_PROMETHEUS_ADDR {addr_env:?}: {e}");
            return None;
        }
    };
    let interval = std::env::var("CONSCIENCE_PROMETHEUS_INTERVAL")
        .ok()
        .and_then(|s| s.parse::<u64>().ok())
        .unwrap_or(15);
    let builder = PrometheusExporterBuilder::new()
        .with_server_addr(addr)
        .with_interval_secs(interval);
    let (exporter, coll_handle) = builder.build(collector, registry);
    match exporter.start_server().await {
        Ok((srv, bound)) => Some((srv, bound, coll_handle)),
        Err(e) => {
            warn!("failed to start prometheus exporter: {e}");
            None
        }
    }
}

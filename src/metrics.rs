//! Prometheus metrics for the server.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::extract::State;
use axum::http::header::CONTENT_TYPE;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use prometheus_client::encoding::text::encode;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::registry::Registry;
use tokio::net::TcpListener;
use tracing::info;

const OPENMETRICS_CONTENT_TYPE: &str = "application/openmetrics-text; version=1.0.0; charset=utf-8";

/// Counter group for the whole service.
#[derive(Debug, Default, Clone)]
pub struct Metrics {
    pub rpc_requests: Counter,
    pub rpc_errors: Counter,
    pub uploads: Counter,
    pub upload_errors: Counter,
    pub upload_bytes: Counter,
    pub gateway_requests: Counter,
    pub gateway_not_found: Counter,
    pub gateway_errors: Counter,
    pub cache_hits: Counter,
    pub cache_misses: Counter,
    pub cache_invalidations: Counter,
    pub renders: Counter,
    pub render_errors: Counter,
    pub gc_runs: Counter,
    pub gc_deleted_publishes: Counter,
    pub gc_deleted_objects: Counter,
}

impl Metrics {
    pub fn new(registry: &mut Registry) -> Self {
        let metrics = Metrics::default();
        let sub = registry.sub_registry_with_prefix("webpub");
        sub.register("rpc_requests", "RPC requests", metrics.rpc_requests.clone());
        sub.register(
            "rpc_errors",
            "RPC requests that failed",
            metrics.rpc_errors.clone(),
        );
        sub.register("uploads", "Snapshot uploads accepted", metrics.uploads.clone());
        sub.register(
            "upload_errors",
            "Snapshot uploads that failed",
            metrics.upload_errors.clone(),
        );
        sub.register(
            "upload_bytes",
            "Uncompressed bytes ingested by uploads",
            metrics.upload_bytes.clone(),
        );
        sub.register(
            "gateway_requests",
            "Public page requests",
            metrics.gateway_requests.clone(),
        );
        sub.register(
            "gateway_not_found",
            "Public page requests answered 404",
            metrics.gateway_not_found.clone(),
        );
        sub.register(
            "gateway_errors",
            "Public page requests answered 500",
            metrics.gateway_errors.clone(),
        );
        sub.register("cache_hits", "Page cache hits", metrics.cache_hits.clone());
        sub.register("cache_misses", "Page cache misses", metrics.cache_misses.clone());
        sub.register(
            "cache_invalidations",
            "Page cache invalidations",
            metrics.cache_invalidations.clone(),
        );
        sub.register("renders", "Pages rendered", metrics.renders.clone());
        sub.register(
            "render_errors",
            "Page renders that failed",
            metrics.render_errors.clone(),
        );
        sub.register("gc_runs", "Garbage collection ticks", metrics.gc_runs.clone());
        sub.register(
            "gc_deleted_publishes",
            "Publishes removed by garbage collection",
            metrics.gc_deleted_publishes.clone(),
        );
        sub.register(
            "gc_deleted_objects",
            "Objects removed by garbage collection",
            metrics.gc_deleted_objects.clone(),
        );
        metrics
    }
}

/// Serves the OpenMetrics text endpoint until the task is aborted.
pub async fn start_metrics_server(addr: SocketAddr, registry: Arc<Registry>) -> Result<()> {
    let app = Router::new()
        .route("/metrics", get(metrics_handler))
        .with_state(registry);
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind metrics on {addr}"))?;
    info!("metrics server listening on {addr}");
    axum::serve(listener, app).await?;
    Ok(())
}

async fn metrics_handler(State(registry): State<Arc<Registry>>) -> impl IntoResponse {
    let mut body = String::new();
    match encode(&mut body, &registry) {
        Ok(()) => ([(CONTENT_TYPE, OPENMETRICS_CONTENT_TYPE)], body).into_response(),
        Err(err) => (
            axum::http::StatusCode::INTERNAL_SERVER_ERROR,
            err.to_string(),
        )
            .into_response(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_show_up_in_encoding() {
        let mut registry = Registry::default();
        let metrics = Metrics::new(&mut registry);
        metrics.rpc_requests.inc();
        metrics.upload_bytes.inc_by(42);

        let mut out = String::new();
        encode(&mut out, &registry).unwrap();
        assert!(out.contains("webpub_rpc_requests_total 1"));
        assert!(out.contains("webpub_upload_bytes_total 42"));
    }
}

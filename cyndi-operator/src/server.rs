use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::extract::Extension;
use axum::http::{header::HeaderName, HeaderMap, HeaderValue, StatusCode};
use axum::routing::get;
use axum::Router;
use metrics_exporter_prometheus::PrometheusHandle;
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use crate::config::Config;

/// Application server, serving healthchecks and Prometheus metrics.
pub struct AppServer {
    /// The application's runtime config.
    config: Arc<Config>,
    /// A handle to the installed metrics recorder.
    metrics: PrometheusHandle,

    /// A channel used for triggering graceful shutdown.
    shutdown: broadcast::Sender<()>,
}

impl AppServer {
    /// Create a new instance.
    pub fn new(config: Arc<Config>, metrics: PrometheusHandle, shutdown: broadcast::Sender<()>) -> Self {
        Self { config, metrics, shutdown }
    }

    /// Bind the HTTP listener and spawn the server.
    ///
    /// Any server error triggers a graceful shutdown of the application.
    pub async fn spawn(self) -> Result<JoinHandle<()>> {
        let addr = SocketAddr::from(([0, 0, 0, 0], self.config.http_port));
        let listener = TcpListener::bind(addr)
            .await
            .with_context(|| format!("error binding http listener to port {}", self.config.http_port))?;
        let app = Router::new()
            .route("/health", get(|| async { StatusCode::OK }))
            .route("/metrics", get(prom_metrics))
            .layer(Extension(self.metrics));

        let (shutdown, mut shutdown_rx) = (self.shutdown.clone(), self.shutdown.subscribe());
        let server = axum::serve(listener, app).with_graceful_shutdown(async move {
            let _res = shutdown_rx.recv().await;
        });
        tracing::info!("http server is listening at 0.0.0.0:{}", self.config.http_port);
        Ok(tokio::spawn(async move {
            if let Err(err) = server.await {
                tracing::error!(error = ?err, "error from http server, shutting down");
                let _res = shutdown.send(());
            }
        }))
    }
}

/// Handler for serving Prometheus metrics.
async fn prom_metrics(Extension(state): Extension<PrometheusHandle>) -> (StatusCode, HeaderMap, String) {
    let mut headers = HeaderMap::new();
    headers.insert(HeaderName::from_static("content-type"), HeaderValue::from_static("text/plain; version=0.0.4"));
    (StatusCode::OK, headers, state.render())
}

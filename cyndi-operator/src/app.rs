use std::sync::Arc;

use anyhow::{Context, Result};
use futures::stream::StreamExt;
use k8s_openapi::api::core::v1::ConfigMap;
use kube::api::Api;
use metrics_exporter_prometheus::PrometheusHandle;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_stream::wrappers::{BroadcastStream, SignalStream};
use tokio_stream::StreamMap;

use crate::config::Config;
use crate::connect::KafkaConnectManager;
use crate::controllers::{PipelineController, ValidationController};
use crate::k8s::Controller;
use crate::postgres::PgProvider;
use crate::server::AppServer;
use crate::store::KubeStore;
use cyndi_core::config::PipelineConfig;

/// The application object for when the operator is running.
pub struct App {
    /// The application's runtime config.
    _config: Arc<Config>,

    /// A channel used for triggering graceful shutdown.
    shutdown_tx: broadcast::Sender<()>,
    /// A channel used for triggering graceful shutdown.
    shutdown_rx: BroadcastStream<()>,

    /// The join handle of the HTTP server.
    server: JoinHandle<()>,
    /// The join handle of the K8s controller.
    controller: JoinHandle<Result<()>>,
}

impl App {
    /// Create a new instance.
    pub async fn new(config: Arc<Config>, metrics: PrometheusHandle) -> Result<Self> {
        // App shutdown channel.
        let (shutdown_tx, shutdown_rx) = broadcast::channel(10);

        // Initialize K8s client.
        let client = kube::Client::try_default().await.context("error initializing K8s client")?;
        let pipeline_config = load_pipeline_config(&client, &config).await?;
        tracing::info!(?pipeline_config, "pipeline configuration loaded");

        // Wire up the controllers.
        let store = Arc::new(KubeStore::new(client.clone(), config.api_timeout()));
        let connectors = Arc::new(KafkaConnectManager::new(client.clone(), pipeline_config.connect.clone(), config.api_timeout()));
        let databases = Arc::new(PgProvider::new(client.clone(), config.clone()));
        let lifecycle = Arc::new(PipelineController::new(store.clone(), connectors, databases.clone()));
        let validation = Arc::new(ValidationController::new(store, databases, pipeline_config.validation.clone()));

        // Spawn various core tasks.
        let server = AppServer::new(config.clone(), metrics, shutdown_tx.clone())
            .spawn()
            .await
            .context("error setting up http server")?;
        let controller = Controller::new(client, config.clone(), pipeline_config.validation, lifecycle, validation, shutdown_tx.clone()).spawn();

        Ok(Self {
            _config: config,
            shutdown_rx: BroadcastStream::new(shutdown_rx),
            shutdown_tx,
            server,
            controller,
        })
    }

    pub fn spawn(self) -> JoinHandle<Result<()>> {
        tokio::spawn(self.run())
    }

    async fn run(mut self) -> Result<()> {
        let mut signals = StreamMap::new();
        signals.insert("sigterm", SignalStream::new(signal(SignalKind::terminate()).context("error building signal stream")?));
        signals.insert("sigint", SignalStream::new(signal(SignalKind::interrupt()).context("error building signal stream")?));

        loop {
            tokio::select! {
                Some((_, sig)) = signals.next() => {
                    tracing::debug!(signal = ?sig, "signal received, beginning graceful shutdown");
                    let _ = self.shutdown_tx.send(());
                    break;
                }
                _ = self.shutdown_rx.next() => break,
            }
        }

        // Begin shutdown routine.
        tracing::debug!("Cyndi operator is shutting down");
        if let Err(err) = self.server.await {
            tracing::error!(error = ?err, "error joining http server task");
        }
        if let Err(err) = self.controller.await.context("error joining k8s controller handle").and_then(|res| res) {
            tracing::error!(error = ?err, "error shutting down k8s controller");
        }

        tracing::debug!("Cyndi operator shutdown complete");
        Ok(())
    }
}

/// Load pipeline configuration from the configured ConfigMap, falling back to defaults when it
/// does not exist.
async fn load_pipeline_config(client: &kube::Client, config: &Config) -> Result<PipelineConfig> {
    let api: Api<ConfigMap> = Api::namespaced(client.clone(), &config.namespace);
    let config_map = timeout(config.api_timeout(), api.get_opt(&config.config_map_name))
        .await
        .context("timeout while fetching pipeline configmap")?
        .with_context(|| format!("error fetching configmap {}/{}", config.namespace, config.config_map_name))?;
    match config_map.and_then(|config_map| config_map.data) {
        Some(data) => PipelineConfig::from_properties(&data).with_context(|| format!("invalid configmap {}/{}", config.namespace, config.config_map_name)),
        None => {
            tracing::info!(name = %config.config_map_name, "pipeline configmap not found, using defaults");
            Ok(PipelineConfig::default())
        }
    }
}

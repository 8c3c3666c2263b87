//! Runtime configuration.

use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;
use tracing_subscriber::EnvFilter;

/// Runtime configuration data.
#[derive(Clone, Debug, Deserialize)]
pub struct Config {
    /// The server's logging config, which uses Rust's `env_logger` directives.
    pub rust_log: String,
    /// The port used for HTTP healthchecks and metrics.
    #[serde(default = "Config::default_http_port")]
    pub http_port: u16,

    /// The Kubernetes namespace watched by this operator.
    pub namespace: String,
    /// The name of the ConfigMap holding pipeline configuration.
    #[serde(default = "Config::default_config_map_name")]
    pub config_map_name: String,
    /// The Secret holding inventory database credentials, unless a pipeline overrides it.
    #[serde(default = "Config::default_inventory_db_secret")]
    pub inventory_db_secret: String,

    /// The timeout applied to every K8s API call.
    #[serde(default = "Config::default_api_timeout_seconds")]
    pub api_timeout_seconds: u64,
    /// The timeout applied to database connections and statements.
    #[serde(default = "Config::default_db_timeout_seconds")]
    pub db_timeout_seconds: u64,
    /// How often the validation scheduler checks for due pipelines.
    #[serde(default = "Config::default_validation_tick_seconds")]
    pub validation_tick_seconds: u64,
}

impl Config {
    /// Create a new config instance.
    ///
    /// Currently this routine just parses the runtime environment and builds the application
    /// config from that.
    #[allow(clippy::new_without_default)]
    pub fn new() -> Result<Self> {
        envy::from_env().context("error building config from env")
    }

    /// The tracing filter built from `rust_log`.
    pub fn log_filter(&self) -> Result<EnvFilter> {
        EnvFilter::try_new(&self.rust_log).with_context(|| format!("error parsing RUST_LOG directives {:?}", self.rust_log))
    }

    pub fn api_timeout(&self) -> Duration {
        Duration::from_secs(self.api_timeout_seconds)
    }

    pub fn db_timeout(&self) -> Duration {
        Duration::from_secs(self.db_timeout_seconds)
    }

    pub fn validation_tick(&self) -> Duration {
        Duration::from_secs(self.validation_tick_seconds.max(1))
    }

    fn default_http_port() -> u16 {
        8080
    }

    fn default_config_map_name() -> String {
        "cyndi".into()
    }

    fn default_inventory_db_secret() -> String {
        "host-inventory-db".into()
    }

    fn default_api_timeout_seconds() -> u64 {
        5
    }

    fn default_db_timeout_seconds() -> u64 {
        10
    }

    fn default_validation_tick_seconds() -> u64 {
        5
    }
}

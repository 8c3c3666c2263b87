//! Pipeline resource storage.

use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use kube::api::{Api, Patch, PatchParams};
use kube::client::Client;
use kube::Resource;
use serde_json::json;
use tokio::time::timeout;

use cyndi_core::crd::{CyndiPipeline, PipelineKey, RequiredMetadata};

/// The outcome of an optimistic concurrency write.
#[derive(Debug)]
#[allow(clippy::large_enum_variant)]
pub enum UpdateOutcome {
    /// The write was applied, yielding the stored object.
    Updated(CyndiPipeline),
    /// The object changed since it was read.
    Conflict,
    /// The object no longer exists.
    NotFound,
}

/// Storage of pipeline resources.
///
/// Writes are guarded by the resource version of the given object.
#[async_trait]
pub trait PipelineStore: Send + Sync {
    /// Fetch the pipeline with the given key, if it exists.
    async fn get(&self, key: &PipelineKey) -> Result<Option<CyndiPipeline>>;

    /// Persist the finalizers of the given pipeline.
    async fn update(&self, pipeline: &CyndiPipeline) -> Result<UpdateOutcome>;

    /// Persist the status of the given pipeline.
    async fn update_status(&self, pipeline: &CyndiPipeline) -> Result<UpdateOutcome>;
}

/// A pipeline store backed by the K8s API.
pub struct KubeStore {
    client: Client,
    timeout: Duration,
}

impl KubeStore {
    pub fn new(client: Client, timeout: Duration) -> Self {
        Self { client, timeout }
    }

    fn api(&self, namespace: &str) -> Api<CyndiPipeline> {
        Api::namespaced(self.client.clone(), namespace)
    }
}

#[async_trait]
impl PipelineStore for KubeStore {
    #[tracing::instrument(level = "debug", skip(self))]
    async fn get(&self, key: &PipelineKey) -> Result<Option<CyndiPipeline>> {
        timeout(self.timeout, self.api(&key.namespace).get_opt(&key.name))
            .await
            .context("timeout while fetching pipeline")?
            .with_context(|| format!("error fetching pipeline {}", key))
    }

    #[tracing::instrument(level = "debug", skip(self, pipeline), fields(pipeline = %PipelineKey::of(pipeline)))]
    async fn update(&self, pipeline: &CyndiPipeline) -> Result<UpdateOutcome> {
        let patch = json!({
            "metadata": {
                "resourceVersion": pipeline.meta().resource_version,
                "finalizers": pipeline.meta().finalizers.clone().unwrap_or_default(),
            }
        });
        let res = timeout(
            self.timeout,
            self.api(pipeline.namespace()).patch(pipeline.name(), &PatchParams::default(), &Patch::Merge(&patch)),
        )
        .await
        .context("timeout while updating pipeline")?;
        outcome(res).context("error updating pipeline finalizers")
    }

    #[tracing::instrument(level = "debug", skip(self, pipeline), fields(pipeline = %PipelineKey::of(pipeline)))]
    async fn update_status(&self, pipeline: &CyndiPipeline) -> Result<UpdateOutcome> {
        let patch = json!({
            "metadata": {"resourceVersion": pipeline.meta().resource_version},
            "status": pipeline.status,
        });
        let res = timeout(
            self.timeout,
            self.api(pipeline.namespace()).patch_status(pipeline.name(), &PatchParams::default(), &Patch::Merge(&patch)),
        )
        .await
        .context("timeout while updating pipeline status")?;
        outcome(res).context("error updating pipeline status")
    }
}

/// Classify the response of a guarded write.
fn outcome(res: std::result::Result<CyndiPipeline, kube::Error>) -> Result<UpdateOutcome> {
    match res {
        Ok(pipeline) => Ok(UpdateOutcome::Updated(pipeline)),
        Err(kube::Error::Api(err)) if err.code == 409 => Ok(UpdateOutcome::Conflict),
        Err(kube::Error::Api(err)) if err.code == 404 => Ok(UpdateOutcome::NotFound),
        Err(err) => Err(err.into()),
    }
}

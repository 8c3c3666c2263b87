//! The validation controller.
//!
//! Each pass validates the candidate table of a pipeline against the thresholds of its current
//! phase and records the verdict in the pipeline's status. A run of failures long enough to
//! exhaust the phase's attempts sends the pipeline back to `NEW`, which the lifecycle controller
//! answers with a fresh candidate. The active table is never touched here.

use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;

use crate::controllers::{with_conflict_retries, Pass, ReconcileOutcome, Reconciler};
use crate::error::ReconcileError;
use crate::store::{PipelineStore, UpdateOutcome};
use cyndi_core::config::ValidationConfig;
use cyndi_core::crd::{PipelineKey, PipelineState};
use cyndi_core::database::{DatabaseProvider, HostFilter};
use cyndi_core::{metrics, validation};

const CONTROLLER_NAME: &str = "validation";

/// The controller measuring replication fidelity of pipelines.
pub struct ValidationController {
    store: Arc<dyn PipelineStore>,
    databases: Arc<dyn DatabaseProvider>,
    config: ValidationConfig,
}

#[async_trait]
impl Reconciler for ValidationController {
    fn name(&self) -> &'static str {
        CONTROLLER_NAME
    }

    #[tracing::instrument(level = "debug", skip(self), fields(pipeline = %key))]
    async fn reconcile(&self, key: &PipelineKey) -> Result<ReconcileOutcome, ReconcileError> {
        let res = with_conflict_retries(self.name(), key, move || self.pass(key)).await;
        metrics::record_reconcile(self.name(), res.is_ok());
        if let Err(ReconcileError::Invariant { message, .. }) = &res {
            tracing::error!(%key, message = %message, "pipeline status violates its invariants");
        }
        res
    }
}

impl ValidationController {
    /// Create a new instance.
    pub fn new(store: Arc<dyn PipelineStore>, databases: Arc<dyn DatabaseProvider>, config: ValidationConfig) -> Self {
        Self { store, databases, config }
    }

    async fn pass(&self, key: &PipelineKey) -> Result<Pass, ReconcileError> {
        let mut pipeline = match self.store.get(key).await? {
            Some(pipeline) => pipeline,
            None => {
                tracing::debug!(%key, "pipeline no longer exists");
                return Ok(Pass::Done(ReconcileOutcome::done()));
            }
        };
        // Teardown belongs to the lifecycle controller.
        if pipeline.is_deleting() {
            return Ok(Pass::Done(ReconcileOutcome::done()));
        }

        let mut status = pipeline.status_or_default();
        if status.state == PipelineState::New {
            return Ok(Pass::Done(ReconcileOutcome::done()));
        }
        let table = match status.table_name.clone() {
            Some(table) => table,
            None => return Err(ReconcileError::invariant(key, format!("tableName is not set while in state {}", status.state))),
        };

        let thresholds = self.config.thresholds_for(status.state, &pipeline.spec);
        let inventory = self
            .databases
            .inventory_database(&pipeline)
            .await
            .context("error opening inventory database")?;
        let app = self.databases.app_database(&pipeline).await.context("error opening app database")?;
        let report = validation::validate(inventory.as_ref(), app.as_ref(), &HostFilter::of(&pipeline), &table).await?;

        let previous = status.state;
        let refreshed = status.record_validation(&report, &thresholds);
        pipeline.status = Some(status.clone());
        match self.store.update_status(&pipeline).await? {
            UpdateOutcome::Updated(_) => (),
            UpdateOutcome::Conflict => return Ok(Pass::Conflict),
            UpdateOutcome::NotFound => {
                tracing::debug!(%key, "pipeline deleted during validation");
                return Ok(Pass::Done(ReconcileOutcome::done()));
            }
        }

        metrics::record_validation(key, &report, status.validation_failed_count);
        if status.state != previous {
            metrics::record_state(key, status.state);
        }
        if refreshed {
            metrics::record_refresh(key, "validation");
            tracing::warn!(
                %key,
                failed = status.validation_failed_count,
                attempts = thresholds.attempts,
                active_table = ?status.active_table_name,
                "validation failed too many times, forcing a refresh"
            );
        } else {
            tracing::info!(
                %key,
                table = %table,
                state = %status.state,
                valid = ?status.valid(),
                matched = report.matched,
                total = report.total,
                failed = status.validation_failed_count,
                "validation complete"
            );
        }
        Ok(Pass::Done(ReconcileOutcome::after(self.config.interval_for(status.state))))
    }
}

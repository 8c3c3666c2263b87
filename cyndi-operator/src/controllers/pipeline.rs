//! The pipeline lifecycle controller.
//!
//! ## State Machine
//! - `NEW`: allocate a fresh candidate table, create it along with its connector, and move to
//! `INITIAL_SYNC`. Any previously active table keeps serving reads.
//! - `INITIAL_SYNC` with `Valid=True`: cut over. The candidate becomes the active table and the
//! serving view is pointed at it.
//! - Anything else is a no-op, unless the candidate table or its connector has gone missing, in
//! which case a refresh is forced.
//!
//! After each pass the serving view is repaired if needed, and owned objects no longer referenced
//! by the status are removed. Removal is best-effort; whatever fails is retried by a later pass.

use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result};
use async_trait::async_trait;

use crate::connect::ConnectorManager;
use crate::controllers::{with_conflict_retries, Pass, ReconcileOutcome, Reconciler};
use crate::error::ReconcileError;
use crate::store::{PipelineStore, UpdateOutcome};
use cyndi_core::crd::{CyndiPipeline, CyndiPipelineStatus, PipelineKey, PipelineState, RequiredMetadata};
use cyndi_core::database::{AppDatabase, DatabaseProvider};
use cyndi_core::{metrics, naming, AppError};

const CONTROLLER_NAME: &str = "pipeline";

/// The controller driving the lifecycle of pipelines.
pub struct PipelineController {
    store: Arc<dyn PipelineStore>,
    connectors: Arc<dyn ConnectorManager>,
    databases: Arc<dyn DatabaseProvider>,
}

#[async_trait]
impl Reconciler for PipelineController {
    fn name(&self) -> &'static str {
        CONTROLLER_NAME
    }

    #[tracing::instrument(level = "debug", skip(self), fields(pipeline = %key))]
    async fn reconcile(&self, key: &PipelineKey) -> Result<ReconcileOutcome, ReconcileError> {
        let res = with_conflict_retries(self.name(), key, move || self.pass(key)).await;
        metrics::record_reconcile(self.name(), res.is_ok());
        res
    }
}

impl PipelineController {
    /// Create a new instance.
    pub fn new(store: Arc<dyn PipelineStore>, connectors: Arc<dyn ConnectorManager>, databases: Arc<dyn DatabaseProvider>) -> Self {
        Self { store, connectors, databases }
    }

    /// Run a single pass from a fresh read.
    async fn pass(&self, key: &PipelineKey) -> Result<Pass, ReconcileError> {
        let mut pipeline = match self.store.get(key).await? {
            Some(pipeline) => pipeline,
            None => {
                tracing::debug!(%key, "pipeline no longer exists");
                return Ok(Pass::Done(ReconcileOutcome::done()));
            }
        };

        if pipeline.is_deleting() {
            return self.finalize(key, pipeline).await;
        }

        // Guard every owned object with the finalizer before creating any of them.
        if pipeline.add_finalizer() {
            match self.store.update(&pipeline).await? {
                UpdateOutcome::Updated(updated) => pipeline = updated,
                UpdateOutcome::Conflict => return Ok(Pass::Conflict),
                UpdateOutcome::NotFound => return Ok(Pass::Done(ReconcileOutcome::done())),
            }
        }

        let db = self.databases.app_database(&pipeline).await.context("error opening app database")?;
        let current = pipeline.status_or_default();
        let mut next = current.clone();
        let created = self.transition(key, &pipeline, &mut next, db.as_ref()).await?;

        if next != current {
            pipeline.status = Some(next.clone());
            let outcome = match self.store.update_status(&pipeline).await {
                Ok(outcome) => outcome,
                Err(err) => {
                    if let Some(table) = &created {
                        self.discard_candidate(&pipeline, table, db.as_ref()).await;
                    }
                    return Err(err.into());
                }
            };
            match outcome {
                UpdateOutcome::Updated(updated) => pipeline = updated,
                UpdateOutcome::Conflict => {
                    if let Some(table) = &created {
                        self.discard_candidate(&pipeline, table, db.as_ref()).await;
                    }
                    return Ok(Pass::Conflict);
                }
                UpdateOutcome::NotFound => {
                    tracing::debug!(%key, "pipeline deleted during reconciliation");
                    if let Some(table) = &created {
                        self.discard_candidate(&pipeline, table, db.as_ref()).await;
                    }
                    return Ok(Pass::Done(ReconcileOutcome::done()));
                }
            }
            tracing::info!(%key, from = %current.state, to = %next.state, table = ?next.table_name, active_table = ?next.active_table_name, "pipeline status updated");
            metrics::record_state(key, next.state);
        }

        let status = pipeline.status_or_default();
        self.ensure_view(&status, db.as_ref()).await?;
        self.collect_garbage(&pipeline, &status, db.as_ref()).await;
        Ok(Pass::Done(ReconcileOutcome::done()))
    }

    /// Compute the next status, applying the side effects it depends on.
    ///
    /// Returns the name of the candidate table if one was created during this pass.
    async fn transition(
        &self, key: &PipelineKey, pipeline: &CyndiPipeline, status: &mut CyndiPipelineStatus, db: &dyn AppDatabase,
    ) -> Result<Option<String>, ReconcileError> {
        if status.state == PipelineState::New {
            return Ok(Some(self.start_sync(pipeline, status, db).await?));
        }

        if let Some(reason) = self.detect_deviation(pipeline, status, db).await? {
            tracing::warn!(%key, reason, state = %status.state, "pipeline deviates from its status, forcing a refresh");
            metrics::record_refresh(key, "deviation");
            status.force_refresh();
            return Ok(Some(self.start_sync(pipeline, status, db).await?));
        }

        if status.is_cutover_ready() {
            status.cutover().map_err(|err| match err {
                AppError::Invariant(message) => ReconcileError::invariant(key, message),
                other => ReconcileError::Transient(other.into()),
            })?;
            tracing::info!(%key, table = ?status.active_table_name, "candidate table validated, cutting over");
        }
        Ok(None)
    }

    /// Create a fresh candidate table and its connector, and begin the initial sync.
    async fn start_sync(&self, pipeline: &CyndiPipeline, status: &mut CyndiPipelineStatus, db: &dyn AppDatabase) -> Result<String> {
        let table = naming::allocate_candidate(status, now_millis());
        db.create_table(&table).await.with_context(|| format!("error creating table {}", table))?;
        self.connectors
            .create_connector(pipeline, &table)
            .await
            .with_context(|| format!("error creating connector for table {}", table))?;
        tracing::info!(pipeline = %PipelineKey::of(pipeline), table = %table, active_table = ?status.active_table_name, "starting initial sync");
        status.start_initial_sync(table.clone());
        Ok(table)
    }

    /// Check that the objects the status refers to still exist.
    async fn detect_deviation(&self, pipeline: &CyndiPipeline, status: &CyndiPipelineStatus, db: &dyn AppDatabase) -> Result<Option<&'static str>> {
        let table = match status.table_name.as_deref() {
            Some(table) => table,
            None => return Ok(Some("missing table name")),
        };
        if !db.table_exists(table).await.context("error checking replica table")? {
            return Ok(Some("replica table missing"));
        }
        let connector = naming::connector_for_table(pipeline.app_name(), table);
        let connectors = self
            .connectors
            .list_connectors(pipeline.namespace(), pipeline.app_name())
            .await
            .context("error listing connectors")?;
        if !connectors.iter().any(|existing| Some(&existing.name) == connector.as_ref()) {
            return Ok(Some("connector missing"));
        }
        Ok(None)
    }

    /// Point the serving view at the active table, if it does not already.
    async fn ensure_view(&self, status: &CyndiPipelineStatus, db: &dyn AppDatabase) -> Result<()> {
        let active = match status.active_table_name.as_deref() {
            Some(active) => active,
            None => return Ok(()),
        };
        let target = db.view_target().await.context("error fetching view target")?;
        if target.as_deref() != Some(active) {
            db.update_view(active).await.with_context(|| format!("error pointing view at {}", active))?;
            tracing::info!(table = %active, previous = ?target, "serving view updated");
        }
        Ok(())
    }

    /// Remove tables and connectors no longer referenced by the given status.
    async fn collect_garbage(&self, pipeline: &CyndiPipeline, status: &CyndiPipelineStatus, db: &dyn AppDatabase) {
        if let Err(err) = self.try_collect_garbage(pipeline, status, db).await {
            tracing::warn!(error = ?err, pipeline = %PipelineKey::of(pipeline), "error removing stale objects, will retry on next pass");
        }
    }

    async fn try_collect_garbage(&self, pipeline: &CyndiPipeline, status: &CyndiPipelineStatus, db: &dyn AppDatabase) -> Result<()> {
        let view_target = db.view_target().await.context("error fetching view target")?;
        let tables = db.list_tables().await.context("error listing tables")?;
        for table in naming::stale_tables(&tables, status, view_target.as_deref()) {
            db.drop_table(&table).await.with_context(|| format!("error dropping stale table {}", table))?;
            tracing::info!(table = %table, "stale table dropped");
        }

        let connectors: Vec<String> = self
            .connectors
            .list_connectors(pipeline.namespace(), pipeline.app_name())
            .await
            .context("error listing connectors")?
            .into_iter()
            .map(|connector| connector.name)
            .collect();
        for name in naming::stale_connectors(&connectors, pipeline.app_name(), status) {
            self.connectors
                .delete_connector(pipeline.namespace(), &name)
                .await
                .with_context(|| format!("error deleting stale connector {}", name))?;
        }
        Ok(())
    }

    /// Remove a candidate whose status could not be recorded.
    async fn discard_candidate(&self, pipeline: &CyndiPipeline, table: &str, db: &dyn AppDatabase) {
        if let Some(name) = naming::connector_for_table(pipeline.app_name(), table) {
            if let Err(err) = self.connectors.delete_connector(pipeline.namespace(), &name).await {
                tracing::warn!(error = ?err, connector = %name, "error removing unrecorded connector");
            }
        }
        if let Err(err) = db.drop_table(table).await {
            tracing::warn!(error = ?err, table, "error removing unrecorded table");
        }
    }

    /// Tear down every object owned by a deleted pipeline and release its finalizer.
    async fn finalize(&self, key: &PipelineKey, mut pipeline: CyndiPipeline) -> Result<Pass, ReconcileError> {
        if !pipeline.has_finalizer() {
            return Ok(Pass::Done(ReconcileOutcome::done()));
        }
        self.teardown(&pipeline).await?;
        pipeline.remove_finalizer();
        match self.store.update(&pipeline).await? {
            UpdateOutcome::Updated(_) | UpdateOutcome::NotFound => {
                tracing::info!(%key, "pipeline finalized");
                Ok(Pass::Done(ReconcileOutcome::done()))
            }
            UpdateOutcome::Conflict => Ok(Pass::Conflict),
        }
    }

    async fn teardown(&self, pipeline: &CyndiPipeline) -> Result<()> {
        let connectors = self
            .connectors
            .list_connectors(pipeline.namespace(), pipeline.app_name())
            .await
            .context("error listing connectors")?;
        for connector in connectors {
            self.connectors
                .delete_connector(pipeline.namespace(), &connector.name)
                .await
                .with_context(|| format!("error deleting connector {}", connector.name))?;
        }

        let db = self.databases.app_database(pipeline).await.context("error opening app database")?;
        db.drop_view().await.context("error dropping view")?;
        for table in db.list_tables().await.context("error listing tables")? {
            db.drop_table(&table).await.with_context(|| format!("error dropping table {}", table))?;
        }
        Ok(())
    }
}

fn now_millis() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).map(|dur| dur.as_millis() as u64).unwrap_or_default()
}

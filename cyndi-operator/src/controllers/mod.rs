//! Pipeline controllers.
//!
//! Two controllers reconcile every pipeline independently of each other. The lifecycle
//! controller owns replica tables, connectors and cutover, while the validation controller
//! measures replication fidelity. They never call each other; the pipeline status is the only
//! state they share, and every status write is guarded by the resource version read at the start
//! of the pass. A pass which loses such a race starts over from a fresh read.

mod pipeline;
mod validation;

use std::time::Duration;

use async_trait::async_trait;

use crate::error::ReconcileError;
use cyndi_core::crd::PipelineKey;

pub use pipeline::PipelineController;
pub use validation::ValidationController;

/// The number of passes attempted before a status write conflict is surfaced.
pub const MAX_CONFLICT_RETRIES: usize = 5;

/// The outcome of a successful reconciliation.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ReconcileOutcome {
    /// Reconcile again as soon as possible.
    pub requeue: bool,
    /// Reconcile again after the given delay.
    pub requeue_after: Option<Duration>,
}

impl ReconcileOutcome {
    /// Nothing more to do until the pipeline changes.
    pub fn done() -> Self {
        Self::default()
    }

    /// Reconcile again after the given delay.
    pub fn after(delay: Duration) -> Self {
        Self {
            requeue: false,
            requeue_after: Some(delay),
        }
    }
}

/// A controller reconciling pipelines by key.
#[async_trait]
pub trait Reconciler: Send + Sync + 'static {
    /// The name of this controller, used in logs and metrics.
    fn name(&self) -> &'static str;

    /// Drive the given pipeline towards its desired state.
    async fn reconcile(&self, key: &PipelineKey) -> Result<ReconcileOutcome, ReconcileError>;
}

/// The result of a single pass.
enum Pass {
    /// The pass ran to completion.
    Done(ReconcileOutcome),
    /// A status write lost an optimistic concurrency race.
    Conflict,
}

/// Run passes until one completes, retrying write conflicts up to `MAX_CONFLICT_RETRIES` times.
async fn with_conflict_retries<F, Fut>(controller: &'static str, key: &PipelineKey, mut pass: F) -> Result<ReconcileOutcome, ReconcileError>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<Pass, ReconcileError>>,
{
    for attempt in 1..=MAX_CONFLICT_RETRIES {
        match pass().await {
            Ok(Pass::Done(outcome)) => return Ok(outcome),
            Ok(Pass::Conflict) => tracing::debug!(controller, %key, attempt, "status write conflict, retrying from a fresh read"),
            Err(err) => return Err(err),
        }
    }
    Err(ReconcileError::Conflict(MAX_CONFLICT_RETRIES))
}

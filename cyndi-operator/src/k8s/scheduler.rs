//! Scheduling of reconciliation passes.
//!
//! ## Overview
//! Every pass runs on its own task, and reports back to the controller through the scheduler
//! task channel once it completes. At most one pass per controller and pipeline is in flight at
//! any time. A pass requested while another is running is recorded and started as soon as the
//! running pass completes, so that no change observed in the meantime is missed.
//!
//! Lifecycle passes are driven by watcher events. Validation passes are driven by a per-pipeline
//! due time, which is checked on every tick of the validation timer. A completed validation pass
//! always schedules a lifecycle pass, so that missing tables or connectors are detected even when
//! a pipeline does not change for a long time.

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use tokio::time::Instant;

use crate::controllers::ReconcileOutcome;
use crate::error::ReconcileError;
use crate::k8s::Controller;
use cyndi_core::crd::PipelineKey;

/// The controllers scheduled by this operator.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ControllerKind {
    Lifecycle,
    Validation,
}

/// A scheduling task to be performed.
#[derive(Debug)]
pub enum SchedulerTask {
    /// Run a pass of the given controller for the given pipeline.
    Reconcile(ControllerKind, PipelineKey),
    /// A pass has completed.
    Completed(ControllerKind, PipelineKey, Result<ReconcileOutcome, ReconcileError>),
}

/// Bookkeeping of running passes, requested passes and due validations.
#[derive(Debug, Default)]
pub struct WorkQueue {
    /// Passes currently running.
    in_flight: HashSet<(ControllerKind, PipelineKey)>,
    /// Passes requested while a pass of the same controller and pipeline was running.
    pending: HashSet<(ControllerKind, PipelineKey)>,
    /// The instant at which each pipeline is next due for validation.
    validation_due: HashMap<PipelineKey, Instant>,
}

impl WorkQueue {
    /// Claim a pass of the given controller, returning false if one is already running.
    ///
    /// A pass which could not be claimed is remembered and handed out by `release`.
    pub fn claim(&mut self, kind: ControllerKind, key: &PipelineKey) -> bool {
        let entry = (kind, key.clone());
        if self.in_flight.contains(&entry) {
            self.pending.insert(entry);
            return false;
        }
        self.in_flight.insert(entry);
        true
    }

    /// Release a completed pass, returning true if another pass was requested meanwhile.
    pub fn release(&mut self, kind: ControllerKind, key: &PipelineKey) -> bool {
        let entry = (kind, key.clone());
        self.in_flight.remove(&entry);
        self.pending.remove(&entry)
    }

    /// Schedule the next validation of the given pipeline.
    pub fn schedule_validation(&mut self, key: PipelineKey, at: Instant) {
        self.validation_due.insert(key, at);
    }

    /// Take all pipelines due for validation at the given instant.
    pub fn take_due_validations(&mut self, now: Instant) -> Vec<PipelineKey> {
        let mut due: Vec<PipelineKey> = self.validation_due.iter().filter(|(_, at)| **at <= now).map(|(key, _)| key.clone()).collect();
        due.sort();
        for key in due.iter() {
            self.validation_due.remove(key);
        }
        due
    }

    /// Drop everything scheduled for the given pipeline. Running passes are left to complete.
    pub fn forget(&mut self, key: &PipelineKey) {
        self.validation_due.remove(key);
        self.pending.remove(&(ControllerKind::Lifecycle, key.clone()));
        self.pending.remove(&(ControllerKind::Validation, key.clone()));
    }
}

impl Controller {
    /// Handle a scheduler task.
    #[tracing::instrument(level = "debug", skip(self, task))]
    pub(super) async fn handle_scheduler_task(&mut self, task: SchedulerTask) {
        match task {
            SchedulerTask::Reconcile(kind, key) => self.dispatch(kind, key),
            SchedulerTask::Completed(kind, key, res) => self.pass_completed(kind, key, res),
        }
    }

    /// Start every validation which has come due.
    pub(super) fn dispatch_due_validations(&mut self) {
        for key in self.queue.take_due_validations(Instant::now()) {
            self.dispatch(ControllerKind::Validation, key);
        }
    }

    /// Start a pass of the given controller, unless one is already running.
    pub(super) fn dispatch(&mut self, kind: ControllerKind, key: PipelineKey) {
        if !self.pipelines.contains_key(&key) {
            tracing::debug!(%key, ?kind, "pipeline no longer cached, dropping pass");
            return;
        }
        if !self.queue.claim(kind, &key) {
            tracing::debug!(%key, ?kind, "pass already running, will run again once complete");
            return;
        }
        let reconciler = self.reconciler(kind);
        tracing::debug!(%key, controller = reconciler.name(), "starting pass");
        let tx = self.scheduler_tasks_tx.clone();
        tokio::spawn(async move {
            let res = reconciler.reconcile(&key).await;
            let _res = tx.send(SchedulerTask::Completed(kind, key, res)).await;
        });
    }

    fn pass_completed(&mut self, kind: ControllerKind, key: PipelineKey, res: Result<ReconcileOutcome, ReconcileError>) {
        if self.queue.release(kind, &key) {
            self.dispatch(kind, key.clone());
        }
        let outcome = match res {
            Ok(outcome) => outcome,
            Err(err) => {
                let (delay, controller) = (err.retry_delay(), self.reconciler(kind).name());
                if err.is_retryable() {
                    tracing::warn!(error = %err, %key, controller, retry_in = ?delay, "reconciliation failed");
                } else {
                    tracing::error!(error = %err, %key, controller, retry_in = ?delay, "reconciliation failed, manual intervention may be required");
                }
                self.spawn_scheduler_task(SchedulerTask::Reconcile(kind, key), Some(delay));
                return;
            }
        };

        match kind {
            ControllerKind::Lifecycle => {
                if outcome.requeue {
                    self.dispatch(kind, key);
                } else if let Some(delay) = outcome.requeue_after {
                    self.spawn_scheduler_task(SchedulerTask::Reconcile(kind, key), Some(delay));
                }
            }
            ControllerKind::Validation => {
                if outcome.requeue {
                    self.queue.schedule_validation(key.clone(), Instant::now());
                } else if let Some(delay) = outcome.requeue_after {
                    self.queue.schedule_validation(key.clone(), Instant::now() + delay);
                }
                self.dispatch(ControllerKind::Lifecycle, key);
            }
        }
    }

    /// Schedule a validation after a pipeline was first observed or changed state.
    pub(super) fn schedule_validation_after(&mut self, key: PipelineKey, delay: Duration) {
        self.queue.schedule_validation(key, Instant::now() + delay);
    }
}

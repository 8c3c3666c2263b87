//! Kubernetes controller.
//!
//! This controller observes the CyndiPipeline objects of its namespace, caches them, and
//! schedules passes of the lifecycle and validation controllers for them. Lifecycle passes follow
//! changes observed by the watcher, while validation passes follow a per-pipeline cadence driven
//! by a timer.

mod data;
mod scheduler;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use futures::prelude::*;
use kube::api::Api;
use kube::client::Client;
use kube::runtime::watcher::{self, watcher, Event};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_stream::wrappers::{BroadcastStream, IntervalStream, ReceiverStream};

use crate::config::Config;
use crate::controllers::Reconciler;
use crate::k8s::scheduler::{ControllerKind, SchedulerTask, WorkQueue};
use cyndi_core::config::ValidationConfig;
use cyndi_core::crd::{CyndiPipeline, PipelineKey};

type EventResult<T> = std::result::Result<Event<T>, watcher::Error>;

/// Kubernetes controller for watching CyndiPipeline CRs.
pub struct Controller {
    /// K8s client.
    client: Client,
    /// Runtime config.
    config: Arc<Config>,
    /// Validation cadence.
    validation_config: ValidationConfig,
    /// A channel used for triggering graceful shutdown.
    shutdown_rx: BroadcastStream<()>,

    /// The controller driving the pipeline lifecycle.
    lifecycle: Arc<dyn Reconciler>,
    /// The controller validating replica tables.
    validation: Arc<dyn Reconciler>,

    /// A channel of scheduler tasks.
    scheduler_tasks_tx: mpsc::Sender<SchedulerTask>,
    /// A channel of scheduler tasks.
    scheduler_tasks_rx: ReceiverStream<SchedulerTask>,
    /// Running, deferred and due passes.
    queue: WorkQueue,

    /// All known pipeline objects.
    pipelines: HashMap<PipelineKey, CyndiPipeline>,
}

impl Controller {
    /// Create a new instance.
    pub fn new(
        client: Client, config: Arc<Config>, validation_config: ValidationConfig, lifecycle: Arc<dyn Reconciler>, validation: Arc<dyn Reconciler>,
        shutdown_tx: broadcast::Sender<()>,
    ) -> Self {
        let (scheduler_tasks_tx, scheduler_tasks_rx) = mpsc::channel(1000);
        Self {
            client,
            config,
            validation_config,
            shutdown_rx: BroadcastStream::new(shutdown_tx.subscribe()),
            lifecycle,
            validation,
            scheduler_tasks_tx,
            scheduler_tasks_rx: ReceiverStream::new(scheduler_tasks_rx),
            queue: WorkQueue::default(),
            pipelines: Default::default(),
        }
    }

    pub fn spawn(self) -> JoinHandle<Result<()>> {
        tokio::spawn(self.run())
    }

    async fn run(mut self) -> Result<()> {
        let pipelines: Api<CyndiPipeline> = Api::namespaced(self.client.clone(), &self.config.namespace);
        let pipelines_watcher = watcher(pipelines, watcher::Config::default());
        tokio::pin!(pipelines_watcher);

        let mut interval = tokio::time::interval(self.config.validation_tick());
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut validation_ticks = IntervalStream::new(interval);

        tracing::info!(namespace = %self.config.namespace, "k8s controller initialized");
        loop {
            tokio::select! {
                Some(k8s_event_res) = pipelines_watcher.next() => self.handle_pipeline_event(k8s_event_res).await,
                Some(scheduler_task) = self.scheduler_tasks_rx.next() => self.handle_scheduler_task(scheduler_task).await,
                Some(_) = validation_ticks.next() => self.dispatch_due_validations(),
                _ = self.shutdown_rx.next() => break,
            }
        }

        tracing::debug!("k8s controller shutdown");
        Ok(())
    }

    fn reconciler(&self, kind: ControllerKind) -> Arc<dyn Reconciler> {
        match kind {
            ControllerKind::Lifecycle => self.lifecycle.clone(),
            ControllerKind::Validation => self.validation.clone(),
        }
    }

    /// Spawn a task which emits a new scheduler task, optionally after a delay.
    ///
    /// This indirection keeps the controller from blocking on its own bounded queue.
    fn spawn_scheduler_task(&self, task: SchedulerTask, delay: Option<Duration>) {
        let tx = self.scheduler_tasks_tx.clone();
        tokio::spawn(async move {
            if let Some(delay) = delay {
                tokio::time::sleep(delay).await;
            }
            let _res = tx.send(task).await;
        });
    }
}

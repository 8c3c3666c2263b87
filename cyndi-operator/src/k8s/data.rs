use std::time::Duration;

use kube::runtime::watcher::Event;

use crate::k8s::scheduler::ControllerKind;
use crate::k8s::{Controller, EventResult};
use cyndi_core::crd::{CyndiPipeline, PipelineKey};

//////////////////////////////////////////////////////////////////////////////
// Pipeline Events ///////////////////////////////////////////////////////////
impl Controller {
    /// Handle `CyndiPipeline` watcher event.
    #[tracing::instrument(level = "debug", skip(self, res))]
    pub(super) async fn handle_pipeline_event(&mut self, res: EventResult<CyndiPipeline>) {
        let event = match res {
            Ok(event) => event,
            Err(err) => {
                tracing::error!(error = ?err, "error from CyndiPipeline k8s watcher");
                let _ = tokio::time::sleep(Duration::from_secs(10)).await;
                return;
            }
        };
        match event {
            Event::Applied(obj) => self.pipeline_applied(obj),
            Event::Deleted(obj) => self.pipeline_deleted(obj),
            Event::Restarted(objs) => self.pipeline_restarted(objs),
        }
    }

    fn pipeline_applied(&mut self, pipeline: CyndiPipeline) {
        let key = PipelineKey::of(&pipeline);
        if key.name.is_empty() {
            return; // Not actually possible as K8s requires name.
        }
        let state = pipeline.status_or_default().state;
        let previous = match self.pipelines.get(&key) {
            Some(old) if old == &pipeline => return,
            Some(old) => Some(old.status_or_default().state),
            None => None,
        };
        self.pipelines.insert(key.clone(), pipeline);

        match previous {
            None => self.schedule_validation_after(key.clone(), Duration::ZERO),
            Some(previous) if previous != state => {
                tracing::debug!(%key, from = %previous, to = %state, "pipeline changed state");
                self.schedule_validation_after(key.clone(), self.validation_config.interval_for(state));
            }
            Some(_) => (),
        }
        self.dispatch(ControllerKind::Lifecycle, key);
    }

    fn pipeline_deleted(&mut self, pipeline: CyndiPipeline) {
        let key = PipelineKey::of(&pipeline);
        if self.pipelines.remove(&key).is_none() {
            return;
        }
        self.queue.forget(&key);
        tracing::debug!(%key, "pipeline removed from cache");
    }

    fn pipeline_restarted(&mut self, pipelines: Vec<CyndiPipeline>) {
        let live: Vec<PipelineKey> = pipelines.iter().map(PipelineKey::of).collect();
        let gone: Vec<PipelineKey> = self.pipelines.keys().filter(|key| !live.contains(key)).cloned().collect();
        for key in gone {
            self.pipelines.remove(&key);
            self.queue.forget(&key);
        }
        for pipeline in pipelines {
            self.pipeline_applied(pipeline);
        }
    }
}

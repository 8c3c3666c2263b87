//! Metric names and recording helpers shared by the controllers.

use crate::crd::{PipelineKey, PipelineState};
use crate::validation::ValidationReport;

pub const METRIC_RECONCILE_TOTAL: &str = "cyndi_reconcile_total";
pub const METRIC_RECONCILE_ERRORS: &str = "cyndi_reconcile_errors_total";
pub const METRIC_REFRESH_TOTAL: &str = "cyndi_refresh_total";
pub const METRIC_HOST_COUNT: &str = "cyndi_host_count";
pub const METRIC_VALIDATION_FAILED_COUNT: &str = "cyndi_validation_failed_count";
pub const METRIC_MISMATCH_RATIO: &str = "cyndi_mismatch_ratio";
pub const METRIC_PIPELINE_STATE: &str = "cyndi_pipeline_state";

/// Describe all pipeline metrics.
///
/// This function should be called only once, early in the lifetime of the process.
pub fn register_metrics() {
    metrics::describe_counter!(METRIC_RECONCILE_TOTAL, metrics::Unit::Count, "Total reconciliation passes per controller.");
    metrics::describe_counter!(METRIC_RECONCILE_ERRORS, metrics::Unit::Count, "Total failed reconciliation passes per controller.");
    metrics::describe_counter!(METRIC_REFRESH_TOTAL, metrics::Unit::Count, "Total pipeline refreshes per reason.");
    metrics::describe_gauge!(METRIC_HOST_COUNT, metrics::Unit::Count, "Hosts matched by the last validation.");
    metrics::describe_gauge!(METRIC_VALIDATION_FAILED_COUNT, metrics::Unit::Count, "Consecutive failed validations.");
    metrics::describe_gauge!(METRIC_MISMATCH_RATIO, "Mismatch ratio observed by the last validation.");
    metrics::describe_gauge!(METRIC_PIPELINE_STATE, "Lifecycle state of a pipeline, 1 for the current state.");
}

/// Record a reconciliation pass of the given controller.
pub fn record_reconcile(controller: &'static str, ok: bool) {
    metrics::counter!(METRIC_RECONCILE_TOTAL, "controller" => controller).increment(1);
    if !ok {
        metrics::counter!(METRIC_RECONCILE_ERRORS, "controller" => controller).increment(1);
    }
}

/// Record a forced refresh of a pipeline.
pub fn record_refresh(key: &PipelineKey, reason: &'static str) {
    metrics::counter!(METRIC_REFRESH_TOTAL, "namespace" => key.namespace.clone(), "pipeline" => key.name.clone(), "reason" => reason).increment(1);
}

/// Record the outcome of a validation pass.
pub fn record_validation(key: &PipelineKey, report: &ValidationReport, failed_count: i64) {
    let labels = [("namespace", key.namespace.clone()), ("pipeline", key.name.clone())];
    metrics::gauge!(METRIC_HOST_COUNT, &labels).set(report.matched as f64);
    metrics::gauge!(METRIC_VALIDATION_FAILED_COUNT, &labels).set(failed_count as f64);
    metrics::gauge!(METRIC_MISMATCH_RATIO, &labels).set(report.mismatch_ratio());
}

/// Record the lifecycle state of a pipeline.
pub fn record_state(key: &PipelineKey, state: PipelineState) {
    for candidate in [PipelineState::New, PipelineState::InitialSync, PipelineState::Valid, PipelineState::Invalid] {
        let val = if candidate == state { 1.0 } else { 0.0 };
        metrics::gauge!(
            METRIC_PIPELINE_STATE,
            "namespace" => key.namespace.clone(),
            "pipeline" => key.name.clone(),
            "state" => candidate.to_string()
        )
        .set(val);
    }
}

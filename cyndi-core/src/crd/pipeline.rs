//! CyndiPipeline CRD.
//!
//! The code here is used to generate the actual CRD used in K8s. See examples/crd.rs.

use std::fmt;

use kube::{CustomResource, Resource};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::error::AppError;
use crate::validation::{Thresholds, ValidationReport};

/// The finalizer guarding teardown of a pipeline's connectors and tables.
pub const FINALIZER: &str = "finalizer.cyndi.cloud.redhat.com";
/// The condition type reflecting the most recent validation outcome.
pub const CONDITION_VALID: &str = "Valid";

/// CRD spec for the CyndiPipeline resource.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, CustomResource, JsonSchema)]
#[kube(
    group = "cyndi.cloud.redhat.com",
    version = "v1alpha1",
    kind = "CyndiPipeline",
    namespaced,
    status = "CyndiPipelineStatus",
    derive = "PartialEq",
    shortname = "cyndi",
    printcolumn = r#"{"name":"State","type":"string","jsonPath":".status.state"}"#,
    printcolumn = r#"{"name":"Active Table","type":"string","jsonPath":".status.activeTableName"}"#,
    printcolumn = r#"{"name":"Host Count","type":"integer","jsonPath":".status.hostCount"}"#
)]
pub struct CyndiPipelineSpec {
    /// The name of the application consuming the replicated data.
    ///
    /// Defaults to the name of the CyndiPipeline object.
    #[serde(rename = "appName", default, skip_serializing_if = "Option::is_none")]
    pub app_name: Option<String>,
    /// Only replicate hosts which carry an `insights_id` canonical fact.
    #[serde(rename = "insightsOnly", default)]
    pub insights_only: bool,
    /// The Kafka Connect cluster to run this pipeline's connectors in.
    #[serde(rename = "connectCluster", default, skip_serializing_if = "Option::is_none")]
    pub connect_cluster: Option<String>,
    /// The Secret holding credentials of the application database.
    #[serde(rename = "dbSecret", default, skip_serializing_if = "Option::is_none")]
    pub db_secret: Option<String>,
    /// The Secret holding credentials of the inventory database.
    #[serde(rename = "inventoryDbSecret", default, skip_serializing_if = "Option::is_none")]
    pub inventory_db_secret: Option<String>,
    /// A steady-state percentage threshold overriding the configured one for this pipeline.
    #[serde(rename = "validationThreshold", default, skip_serializing_if = "Option::is_none")]
    #[schemars(range(min = 0, max = 100))]
    pub validation_threshold: Option<i64>,
}

/// The lifecycle state of a pipeline.
#[derive(Clone, Copy, Debug, Deserialize, Serialize, PartialEq, Eq, Hash, JsonSchema)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PipelineState {
    /// No candidate table is being built.
    New,
    /// A candidate table is being populated by its connector.
    InitialSync,
    /// The candidate table passed validation and is serving reads.
    Valid,
    /// The serving table failed its most recent validation.
    Invalid,
}

impl Default for PipelineState {
    fn default() -> Self {
        PipelineState::New
    }
}

impl fmt::Display for PipelineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PipelineState::New => write!(f, "NEW"),
            PipelineState::InitialSync => write!(f, "INITIAL_SYNC"),
            PipelineState::Valid => write!(f, "VALID"),
            PipelineState::Invalid => write!(f, "INVALID"),
        }
    }
}

/// The tri-state status of a condition.
#[derive(Clone, Copy, Debug, Deserialize, Serialize, PartialEq, Eq, JsonSchema)]
pub enum ConditionStatus {
    True,
    False,
    Unknown,
}

impl Default for ConditionStatus {
    fn default() -> Self {
        ConditionStatus::Unknown
    }
}

/// A status condition of a pipeline.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, JsonSchema)]
pub struct PipelineCondition {
    /// The type of this condition.
    #[serde(rename = "type")]
    pub type_: String,
    /// The status of this condition.
    pub status: ConditionStatus,
    /// A machine readable reason for the last transition.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    /// A human readable description of the last transition.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    /// RFC 3339 timestamp of the last change of `status`.
    #[serde(rename = "lastTransitionTime", default, skip_serializing_if = "Option::is_none")]
    pub last_transition_time: Option<String>,
}

/// CRD status object.
///
/// This record is the only medium through which the lifecycle and validation controllers
/// coordinate. Every mutation happens through the transitions below.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, JsonSchema)]
pub struct CyndiPipelineStatus {
    /// The lifecycle state.
    #[serde(default)]
    pub state: PipelineState,
    /// The candidate table currently being built or validated.
    #[serde(rename = "tableName", default, skip_serializing_if = "Option::is_none")]
    pub table_name: Option<String>,
    /// The table currently serving reads through the `inventory.hosts` view.
    #[serde(rename = "activeTableName", default, skip_serializing_if = "Option::is_none")]
    pub active_table_name: Option<String>,
    /// Consecutive validation failures since the last success.
    #[serde(rename = "validationFailedCount", default)]
    pub validation_failed_count: i64,
    /// The number of hosts which matched during the last validation.
    #[serde(rename = "hostCount", default)]
    pub host_count: i64,
    /// Status conditions, currently only `Valid`.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<PipelineCondition>,
}

impl CyndiPipelineStatus {
    /// The status of the `Valid` condition.
    pub fn valid(&self) -> ConditionStatus {
        self.conditions
            .iter()
            .find(|cond| cond.type_ == CONDITION_VALID)
            .map(|cond| cond.status)
            .unwrap_or_default()
    }

    /// Set the `Valid` condition.
    ///
    /// The transition time only moves when the condition status itself changes.
    pub fn set_valid(&mut self, status: ConditionStatus, reason: &str, message: impl Into<String>) {
        let (reason, message) = (Some(reason.to_string()), Some(message.into()));
        match self.conditions.iter_mut().find(|cond| cond.type_ == CONDITION_VALID) {
            Some(cond) => {
                if cond.status != status {
                    cond.last_transition_time = now_rfc3339();
                }
                cond.status = status;
                cond.reason = reason;
                cond.message = message;
            }
            None => self.conditions.push(PipelineCondition {
                type_: CONDITION_VALID.into(),
                status,
                reason,
                message,
                last_transition_time: now_rfc3339(),
            }),
        }
    }

    /// Begin building a new candidate table.
    pub fn start_initial_sync(&mut self, table_name: String) {
        self.state = PipelineState::InitialSync;
        self.table_name = Some(table_name);
        self.validation_failed_count = 0;
        self.set_valid(ConditionStatus::Unknown, "InitialSyncStarted", "initial sync of a new table has started");
    }

    /// Whether the candidate table has been validated and may become the serving table.
    pub fn is_cutover_ready(&self) -> bool {
        self.state == PipelineState::InitialSync && self.valid() == ConditionStatus::True && self.table_name.is_some()
    }

    /// Promote the validated candidate table to the serving table.
    pub fn cutover(&mut self) -> Result<(), AppError> {
        if !self.is_cutover_ready() {
            return Err(AppError::Invariant(format!(
                "cutover requires a validated candidate table, state is {} and Valid is {:?}",
                self.state,
                self.valid()
            )));
        }
        self.state = PipelineState::Valid;
        self.active_table_name = self.table_name.clone();
        self.validation_failed_count = 0;
        Ok(())
    }

    /// Abandon the current candidate table, forcing a new one on the next lifecycle pass.
    ///
    /// The active table keeps serving reads until a new candidate is validated.
    pub fn force_refresh(&mut self) {
        self.state = PipelineState::New;
    }

    /// Record the outcome of a validation pass against the given phase thresholds.
    ///
    /// Returns true if the pipeline was forced back to NEW.
    pub fn record_validation(&mut self, report: &ValidationReport, thresholds: &Thresholds) -> bool {
        self.host_count = report.matched;
        if report.passes(thresholds.percentage) {
            self.validation_failed_count = 0;
            self.set_valid(ConditionStatus::True, "ValidationSucceeded", report.describe());
            if self.state == PipelineState::Invalid {
                self.state = PipelineState::Valid;
            }
            return false;
        }

        self.validation_failed_count = self.validation_failed_count.saturating_add(1);
        self.set_valid(ConditionStatus::False, "ValidationFailed", report.describe());
        if self.state == PipelineState::Valid {
            self.state = PipelineState::Invalid;
        }
        if self.validation_failed_count >= thresholds.attempts {
            self.force_refresh();
            return true;
        }
        false
    }
}

impl CyndiPipeline {
    /// The name of the application consuming this pipeline's data.
    pub fn app_name(&self) -> &str {
        match self.spec.app_name.as_deref() {
            Some(app_name) if !app_name.is_empty() => app_name,
            _ => self.meta().name.as_deref().unwrap_or_default(),
        }
    }

    /// Whether deletion of this object has been requested.
    pub fn is_deleting(&self) -> bool {
        self.meta().deletion_timestamp.is_some()
    }

    /// Whether this object carries the Cyndi finalizer.
    pub fn has_finalizer(&self) -> bool {
        self.meta()
            .finalizers
            .as_ref()
            .map(|finalizers| finalizers.iter().any(|val| val == FINALIZER))
            .unwrap_or(false)
    }

    /// Add the Cyndi finalizer, returning false if it was already present.
    pub fn add_finalizer(&mut self) -> bool {
        if self.has_finalizer() {
            return false;
        }
        self.meta_mut().finalizers.get_or_insert_with(Vec::new).push(FINALIZER.into());
        true
    }

    /// Remove the Cyndi finalizer.
    pub fn remove_finalizer(&mut self) {
        if let Some(finalizers) = self.meta_mut().finalizers.as_mut() {
            finalizers.retain(|val| val != FINALIZER);
        }
    }

    /// A copy of this object's status, defaulted when not yet populated.
    pub fn status_or_default(&self) -> CyndiPipelineStatus {
        self.status.clone().unwrap_or_default()
    }
}

fn now_rfc3339() -> Option<String> {
    time::OffsetDateTime::now_utc()
        .format(&time::format_description::well_known::Rfc3339)
        .ok()
}

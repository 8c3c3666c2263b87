//! Reconciliation errors.

use std::time::Duration;

use thiserror::Error;

use cyndi_core::crd::PipelineKey;

/// The delay before a retryable failure is reconciled again.
pub const RETRY_DELAY: Duration = Duration::from_secs(30);
/// The delay before a non-retryable failure is reconciled again.
pub const FATAL_RETRY_DELAY: Duration = Duration::from_secs(300);

/// The ways in which a reconciliation pass can fail.
#[derive(Debug, Error)]
pub enum ReconcileError {
    /// A database, connector or K8s call failed or timed out. No status was written.
    #[error("transient error: {0:#}")]
    Transient(#[from] anyhow::Error),
    /// Every attempt to write status lost an optimistic concurrency race.
    #[error("status update conflicted on each of {0} attempts")]
    Conflict(usize),
    /// The stored status of a pipeline does not hold its invariants.
    #[error("invariant violation on pipeline {key}: {message}")]
    Invariant { key: PipelineKey, message: String },
}

impl ReconcileError {
    pub fn invariant(key: &PipelineKey, message: impl Into<String>) -> Self {
        ReconcileError::Invariant {
            key: key.clone(),
            message: message.into(),
        }
    }

    /// Whether retrying the same pass may succeed without outside intervention.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, ReconcileError::Invariant { .. })
    }

    /// The delay before the failed pass should be retried.
    pub fn retry_delay(&self) -> Duration {
        if self.is_retryable() {
            RETRY_DELAY
        } else {
            FATAL_RETRY_DELAY
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_invariant_violations_are_fatal() {
        let key = PipelineKey::new("default", "advisor");
        let transient = ReconcileError::from(anyhow::anyhow!("connection refused"));
        assert!(transient.is_retryable());
        assert_eq!(transient.retry_delay(), RETRY_DELAY);
        assert!(ReconcileError::Conflict(5).is_retryable());

        let fatal = ReconcileError::invariant(&key, "missing tableName");
        assert!(!fatal.is_retryable());
        assert_eq!(fatal.retry_delay(), FATAL_RETRY_DELAY);
        assert!(fatal.to_string().contains("default/advisor"), "unexpected error message {}", fatal);
    }
}

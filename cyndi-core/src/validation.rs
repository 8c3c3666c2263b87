//! The validation engine.
//!
//! Validation compares the filtered source hosts with the hosts of a replica table and produces
//! a report which is classified against a percentage threshold.

use std::collections::{HashMap, HashSet};

use anyhow::{Context, Result};
use uuid::Uuid;

use crate::database::{AppDatabase, HostFilter, HostRecord, InventoryDatabase};
use crate::error::AppError;

/// A pair of validation thresholds for a single phase.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Thresholds {
    /// The number of consecutive failed validations tolerated before a refresh is forced.
    pub attempts: i64,
    /// The percentage of mismatching hosts tolerated by a passing validation.
    pub percentage: i64,
}

/// The outcome of a validation pass.
#[derive(Clone, Debug, PartialEq)]
pub struct ValidationReport {
    /// The number of replica hosts which match a filtered source host.
    pub matched: i64,
    /// The number of filtered source hosts.
    pub total: i64,
    /// Set when the data read during validation was malformed.
    pub inconclusive: Option<String>,
}

impl ValidationReport {
    pub fn new(matched: i64, total: i64) -> Self {
        Self {
            matched,
            total,
            inconclusive: None,
        }
    }

    /// A report for a pass which could not read well-formed data. It never passes.
    pub fn inconclusive(reason: impl Into<String>) -> Self {
        Self {
            matched: 0,
            total: 0,
            inconclusive: Some(reason.into()),
        }
    }

    /// The fraction of source hosts which are missing or differ in the replica.
    pub fn mismatch_ratio(&self) -> f64 {
        if self.total <= 0 {
            return 0.0;
        }
        (self.total - self.matched) as f64 / self.total as f64
    }

    /// Classify this report against the given percentage threshold.
    ///
    /// The boundary is inclusive: a mismatch ratio equal to the threshold passes. Integer
    /// arithmetic keeps the boundary exact.
    pub fn passes(&self, percentage: i64) -> bool {
        if self.inconclusive.is_some() {
            return false;
        }
        if self.total <= 0 {
            return true;
        }
        let mismatched = self.total.saturating_sub(self.matched).max(0);
        mismatched.saturating_mul(100) <= percentage.saturating_mul(self.total)
    }

    /// A human readable summary used as the condition message.
    pub fn describe(&self) -> String {
        match &self.inconclusive {
            Some(reason) => format!("validation inconclusive: {}", reason),
            None => format!(
                "{} of {} hosts match (mismatch ratio {:.4})",
                self.matched,
                self.total,
                self.mismatch_ratio()
            ),
        }
    }
}

/// Compare the given source hosts with the given replica hosts.
///
/// A replica host matches when its ID belongs to the source set and its content equals the
/// source's. Replica IDs are only counted once.
pub fn compare(source: &[HostRecord], replica: &[HostRecord]) -> ValidationReport {
    let expected: HashMap<Uuid, &Option<String>> = source.iter().map(|host| (host.id, &host.account)).collect();
    let mut seen = HashSet::with_capacity(replica.len());
    let matched = replica
        .iter()
        .filter(|host| expected.get(&host.id).map(|account| **account == host.account).unwrap_or(false))
        .filter(|host| seen.insert(host.id))
        .count();
    ValidationReport::new(matched as i64, expected.len() as i64)
}

/// Run a validation pass of the given replica table.
///
/// Malformed data yields an inconclusive report. Every other error is returned.
#[tracing::instrument(level = "debug", skip(inventory, app))]
pub async fn validate(inventory: &dyn InventoryDatabase, app: &dyn AppDatabase, filter: &HostFilter, table: &str) -> Result<ValidationReport> {
    let source = match inventory.host_records(filter).await {
        Ok(source) => source,
        Err(err) if AppError::is_validation_data(&err) => return Ok(inconclusive(err)),
        Err(err) => return Err(err).context("error fetching source hosts"),
    };
    let replica = match app.host_records(table).await {
        Ok(replica) => replica,
        Err(err) if AppError::is_validation_data(&err) => return Ok(inconclusive(err)),
        Err(err) => return Err(err).context("error fetching replica hosts"),
    };
    let report = compare(&source, &replica);
    tracing::debug!(table, matched = report.matched, total = report.total, "validation pass complete");
    Ok(report)
}

fn inconclusive(err: anyhow::Error) -> ValidationReport {
    tracing::warn!(error = ?err, "malformed data observed during validation");
    ValidationReport::inconclusive(format!("{:#}", err))
}

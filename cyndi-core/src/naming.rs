//! Table naming & swap logic.
//!
//! Every function here is pure. Candidate tables are named after a refresh generation which is
//! strictly greater than any generation the pipeline has used before, so a dying candidate and
//! its replacement can never collide.

use std::fmt;

use lazy_static::lazy_static;
use regex::Regex;

use crate::crd::CyndiPipelineStatus;

/// The schema holding all replica tables and the serving view.
pub const TABLE_SCHEMA: &str = "inventory";
/// The name of the externally visible view.
pub const VIEW_NAME: &str = "hosts";
/// The version of the replica table layout.
pub const DB_SCHEMA_VERSION: u32 = 1;
/// The prefix shared by all replica tables, regardless of layout version.
pub const TABLE_PREFIX: &str = "hosts_v";
/// The prefix of all connector names.
const CONNECTOR_PREFIX: &str = "cyndi";
/// Postgres truncates identifiers beyond this length.
const MAX_IDENTIFIER_LEN: usize = 63;

lazy_static! {
    static ref IDENTIFIER: Regex = Regex::new(r"^[a-z_][a-z0-9_]*$").expect("identifier regex is valid");
}

/// A refresh generation of a pipeline.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PipelineVersion(pub u64);

impl fmt::Display for PipelineVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The name of the replica table of the given generation.
pub fn table_name(version: PipelineVersion) -> String {
    format!("{}{}_{}", TABLE_PREFIX, DB_SCHEMA_VERSION, version)
}

/// The schema-qualified name of the given table.
pub fn qualified(table: &str) -> String {
    format!("{}.{}", TABLE_SCHEMA, table)
}

/// Recover the generation a replica table was created for.
pub fn version_of(table: &str) -> Option<PipelineVersion> {
    let rest = table.strip_prefix(TABLE_PREFIX)?;
    let (_schema_version, version) = rest.split_once('_')?;
    version.parse().ok().map(PipelineVersion)
}

/// The name of the connector which populates the given generation for the given app.
pub fn connector_name(app_name: &str, version: PipelineVersion) -> String {
    format!("{}-{}-{}", CONNECTOR_PREFIX, app_name, version)
}

/// The name of the connector populating the given table, if it is a replica table.
pub fn connector_for_table(app_name: &str, table: &str) -> Option<String> {
    version_of(table).map(|version| connector_name(app_name, version))
}

/// Whether the given name is safe to interpolate into SQL as an identifier.
pub fn is_valid_identifier(name: &str) -> bool {
    name.len() <= MAX_IDENTIFIER_LEN && IDENTIFIER.is_match(name)
}

/// Whether the given name belongs to a replica table owned by a pipeline.
pub fn is_replica_table(name: &str) -> bool {
    is_valid_identifier(name) && version_of(name).is_some()
}

/// Compute the next refresh generation.
///
/// `now_millis` seeds the generation so names stay roughly chronological, but the result is
/// always strictly greater than every generation recorded in the given status.
pub fn next_version(status: &CyndiPipelineStatus, now_millis: u64) -> PipelineVersion {
    let highest = [status.table_name.as_deref(), status.active_table_name.as_deref()]
        .iter()
        .flatten()
        .filter_map(|table| version_of(table))
        .max();
    match highest {
        Some(PipelineVersion(highest)) if highest >= now_millis => PipelineVersion(highest.saturating_add(1)),
        _ => PipelineVersion(now_millis),
    }
}

/// Allocate the name of a fresh candidate table for the given status.
pub fn allocate_candidate(status: &CyndiPipelineStatus, now_millis: u64) -> String {
    table_name(next_version(status, now_millis))
}

/// The tables which must be kept alive for the given status.
pub fn retained_tables<'a>(status: &'a CyndiPipelineStatus, view_target: Option<&'a str>) -> Vec<&'a str> {
    let mut keep: Vec<&str> = [status.table_name.as_deref(), status.active_table_name.as_deref(), view_target]
        .into_iter()
        .flatten()
        .collect();
    keep.sort_unstable();
    keep.dedup();
    keep
}

/// The owned tables which are no longer referenced by the given status or the serving view.
pub fn stale_tables(existing: &[String], status: &CyndiPipelineStatus, view_target: Option<&str>) -> Vec<String> {
    let keep = retained_tables(status, view_target);
    existing
        .iter()
        .filter(|table| is_replica_table(table) && !keep.contains(&table.as_str()))
        .cloned()
        .collect()
}

/// The connectors which are no longer referenced by the given status.
pub fn stale_connectors(existing: &[String], app_name: &str, status: &CyndiPipelineStatus) -> Vec<String> {
    let keep: Vec<String> = [status.table_name.as_deref(), status.active_table_name.as_deref()]
        .iter()
        .flatten()
        .filter_map(|table| connector_for_table(app_name, table))
        .collect();
    existing.iter().filter(|name| !keep.contains(name)).cloned().collect()
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::crd::{ConditionStatus, PipelineState};

    fn status(table: Option<&str>, active: Option<&str>) -> CyndiPipelineStatus {
        CyndiPipelineStatus {
            table_name: table.map(String::from),
            active_table_name: active.map(String::from),
            ..Default::default()
        }
    }

    macro_rules! version_test {
        ($name:ident, $table:literal, $expect:expr) => {
            #[test]
            fn $name() {
                let output = version_of($table);
                let expect: Option<PipelineVersion> = $expect;
                assert!(output == expect, "expected version {:?} for table `{}`, got {:?}", expect, $table, output);
            }
        };
    }

    version_test!(version_of_current_layout, "hosts_v1_1700000000000", Some(PipelineVersion(1700000000000)));
    version_test!(version_of_older_layout, "hosts_v0_42", Some(PipelineVersion(42)));
    version_test!(version_of_view_name, "hosts", None);
    version_test!(version_of_foreign_table, "schema_migrations", None);
    version_test!(version_of_non_numeric, "hosts_v1_abc", None);

    #[test]
    fn table_name_round_trips_its_version() {
        let name = table_name(PipelineVersion(17));
        assert_eq!(name, "hosts_v1_17");
        assert_eq!(version_of(&name), Some(PipelineVersion(17)));
        assert!(is_replica_table(&name));
    }

    #[test]
    fn next_version_uses_clock_for_first_sync() {
        assert_eq!(next_version(&status(None, None), 1_000), PipelineVersion(1_000));
    }

    #[test]
    fn next_version_is_strictly_greater_than_known_versions() {
        // The clock has not moved since the previous candidate was allocated.
        let output = next_version(&status(Some("hosts_v1_1000"), Some("hosts_v1_900")), 1_000);
        assert_eq!(output, PipelineVersion(1_001));
        // The clock went backwards.
        let output = next_version(&status(Some("hosts_v1_900"), Some("hosts_v1_5000")), 1_000);
        assert_eq!(output, PipelineVersion(5_001));
    }

    #[test]
    fn allocated_candidate_differs_from_active_table() {
        let current = status(Some("hosts_v1_1000"), Some("hosts_v1_1000"));
        let candidate = allocate_candidate(&current, 1_000);
        assert_ne!(Some(candidate.as_str()), current.active_table_name.as_deref());
    }

    #[test]
    fn identifiers_reject_sql_metacharacters() {
        assert!(is_valid_identifier("hosts_v1_1"));
        assert!(!is_valid_identifier("hosts; DROP TABLE hosts"));
        assert!(!is_valid_identifier("Hosts"));
        assert!(!is_valid_identifier(""));
        assert!(!is_valid_identifier(&"a".repeat(64)));
    }

    #[test]
    fn stale_tables_keep_candidate_active_and_view_target() {
        let existing: Vec<String> = ["hosts_v1_1", "hosts_v1_2", "hosts_v1_3", "hosts_v1_4", "unrelated"]
            .iter()
            .map(|val| val.to_string())
            .collect();
        let current = status(Some("hosts_v1_4"), Some("hosts_v1_2"));
        let output = stale_tables(&existing, &current, Some("hosts_v1_3"));
        assert_eq!(output, vec!["hosts_v1_1".to_string()]);
    }

    #[test]
    fn stale_connectors_keep_both_generations() {
        let existing = vec!["cyndi-advisor-1".to_string(), "cyndi-advisor-2".to_string(), "cyndi-advisor-3".to_string()];
        let current = status(Some("hosts_v1_3"), Some("hosts_v1_2"));
        assert_eq!(stale_connectors(&existing, "advisor", &current), vec!["cyndi-advisor-1".to_string()]);
    }

    #[test]
    fn cutover_readiness_needs_initial_sync_and_valid_verdict() {
        let mut current = status(Some("hosts_v1_1"), None);
        current.state = PipelineState::InitialSync;
        assert!(!current.is_cutover_ready());
        current.set_valid(ConditionStatus::True, "ValidationSucceeded", "");
        assert!(current.is_cutover_ready());
        current.state = PipelineState::Invalid;
        assert!(!current.is_cutover_ready());
    }
}

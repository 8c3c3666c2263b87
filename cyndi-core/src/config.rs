//! Pipeline configuration.
//!
//! These settings are read from a key/value source (a ConfigMap in practice) once, when the
//! controllers are constructed. Absent keys take their defaults; malformed values are errors.

use std::collections::BTreeMap;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{bail, Context, Result};

use crate::crd::{CyndiPipelineSpec, PipelineState};
use crate::validation::Thresholds;

pub const KEY_INIT_ATTEMPTS: &str = "init.validation.attempts.threshold";
pub const KEY_INIT_PERCENTAGE: &str = "init.validation.percentage.threshold";
pub const KEY_ATTEMPTS: &str = "validation.attempts.threshold";
pub const KEY_PERCENTAGE: &str = "validation.percentage.threshold";
pub const KEY_INIT_INTERVAL: &str = "init.validation.interval";
pub const KEY_INTERVAL: &str = "validation.interval";
pub const KEY_CONNECT_CLUSTER: &str = "connect.cluster";
pub const KEY_CONNECT_TOPIC: &str = "connect.topic";
pub const KEY_CONNECT_BATCH_SIZE: &str = "connect.batch.size";
pub const KEY_CONNECT_MAX_AGE: &str = "connect.max.age";
pub const KEY_CONNECT_TASKS_MAX: &str = "connect.tasks.max";

/// Validation thresholds and cadence for both phases.
#[derive(Clone, Debug, PartialEq)]
pub struct ValidationConfig {
    /// Thresholds applied while a candidate table is in its initial sync.
    pub initial: Thresholds,
    /// Thresholds applied once a table has been validated.
    pub steady: Thresholds,
    /// The delay between validations during initial sync.
    pub initial_interval: Duration,
    /// The delay between steady-state validations.
    pub interval: Duration,
}

impl Default for ValidationConfig {
    fn default() -> Self {
        Self {
            initial: Thresholds { attempts: 5, percentage: 20 },
            steady: Thresholds { attempts: 3, percentage: 20 },
            initial_interval: Duration::from_secs(60),
            interval: Duration::from_secs(1800),
        }
    }
}

impl ValidationConfig {
    /// The thresholds of the phase the given state belongs to.
    ///
    /// A pipeline level threshold only overrides the steady-state percentage. Overrides outside
    /// of 0..=100 are ignored.
    pub fn thresholds_for(&self, state: PipelineState, spec: &CyndiPipelineSpec) -> Thresholds {
        match state {
            PipelineState::InitialSync => self.initial,
            _ => {
                let percentage = match spec.validation_threshold {
                    Some(pct) if (0..=100).contains(&pct) => pct,
                    Some(pct) => {
                        tracing::warn!(threshold = pct, "pipeline validation threshold out of range, using configured threshold");
                        self.steady.percentage
                    }
                    None => self.steady.percentage,
                };
                Thresholds { attempts: self.steady.attempts, percentage }
            }
        }
    }

    /// The delay until the next validation of a pipeline in the given state.
    ///
    /// A NEW pipeline is about to start its initial sync, so it follows the initial interval.
    pub fn interval_for(&self, state: PipelineState) -> Duration {
        match state {
            PipelineState::New | PipelineState::InitialSync => self.initial_interval,
            _ => self.interval,
        }
    }
}

/// Settings of the connectors created for pipelines.
#[derive(Clone, Debug, PartialEq)]
pub struct ConnectConfig {
    /// The default Kafka Connect cluster.
    pub cluster: String,
    /// The topic carrying inventory events.
    pub topic: String,
    /// The sink's batch size.
    pub batch_size: u32,
    /// Hosts not updated within this many days are not replicated.
    pub max_age: u32,
    /// The maximum number of tasks per connector.
    pub tasks_max: u32,
}

impl Default for ConnectConfig {
    fn default() -> Self {
        Self {
            cluster: "cyndi".into(),
            topic: "platform.inventory.events".into(),
            batch_size: 100,
            max_age: 45,
            tasks_max: 1,
        }
    }
}

/// All pipeline configuration.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct PipelineConfig {
    pub validation: ValidationConfig,
    pub connect: ConnectConfig,
}

impl PipelineConfig {
    /// Build a config from the given properties.
    pub fn from_properties(props: &BTreeMap<String, String>) -> Result<Self> {
        let defaults = Self::default();
        let validation = ValidationConfig {
            initial: Thresholds {
                attempts: attempts(props, KEY_INIT_ATTEMPTS, defaults.validation.initial.attempts)?,
                percentage: percentage(props, KEY_INIT_PERCENTAGE, defaults.validation.initial.percentage)?,
            },
            steady: Thresholds {
                attempts: attempts(props, KEY_ATTEMPTS, defaults.validation.steady.attempts)?,
                percentage: percentage(props, KEY_PERCENTAGE, defaults.validation.steady.percentage)?,
            },
            initial_interval: seconds(props, KEY_INIT_INTERVAL, defaults.validation.initial_interval)?,
            interval: seconds(props, KEY_INTERVAL, defaults.validation.interval)?,
        };
        let connect = ConnectConfig {
            cluster: props.get(KEY_CONNECT_CLUSTER).cloned().unwrap_or(defaults.connect.cluster),
            topic: props.get(KEY_CONNECT_TOPIC).cloned().unwrap_or(defaults.connect.topic),
            batch_size: parse(props, KEY_CONNECT_BATCH_SIZE, defaults.connect.batch_size)?,
            max_age: parse(props, KEY_CONNECT_MAX_AGE, defaults.connect.max_age)?,
            tasks_max: parse(props, KEY_CONNECT_TASKS_MAX, defaults.connect.tasks_max)?,
        };
        Ok(Self { validation, connect })
    }
}

fn parse<T>(props: &BTreeMap<String, String>, key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match props.get(key) {
        Some(val) => val.trim().parse().with_context(|| format!("error parsing config key {}, got {:?}", key, val)),
        None => Ok(default),
    }
}

fn attempts(props: &BTreeMap<String, String>, key: &str, default: i64) -> Result<i64> {
    let val = parse(props, key, default)?;
    if val < 1 {
        bail!("config key {} must be at least 1, got {}", key, val);
    }
    Ok(val)
}

fn percentage(props: &BTreeMap<String, String>, key: &str, default: i64) -> Result<i64> {
    let val = parse(props, key, default)?;
    if !(0..=100).contains(&val) {
        bail!("config key {} must be a percentage between 0 and 100, got {}", key, val);
    }
    Ok(val)
}

fn seconds(props: &BTreeMap<String, String>, key: &str, default: Duration) -> Result<Duration> {
    parse(props, key, default.as_secs()).map(Duration::from_secs)
}

pub mod config;
pub mod crd;
pub mod database;
pub mod error;
pub mod metrics;
pub mod naming;
pub mod validation;

pub use error::AppError;

/// The label carrying the app name on every object owned by a pipeline.
pub const LABEL_APP_NAME: &str = "cyndi/appName";

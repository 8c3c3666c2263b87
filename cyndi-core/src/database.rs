//! Database collaborator interfaces.
//!
//! The operator talks to two databases per pipeline: the inventory database holding the source
//! `hosts` table, and the application database receiving the replica tables and the serving view.
//! Handles are scoped; implementations release their connection when the handle is dropped.

use anyhow::Result;
use async_trait::async_trait;
use uuid::Uuid;

use crate::crd::CyndiPipeline;

/// The identity and content of a single host as seen by validation.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct HostRecord {
    /// The unique ID of the host.
    pub id: Uuid,
    /// The account which owns the host.
    pub account: Option<String>,
}

impl HostRecord {
    pub fn new(id: Uuid, account: Option<&str>) -> Self {
        Self {
            id,
            account: account.map(String::from),
        }
    }
}

/// The filter selecting which source hosts a pipeline replicates.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct HostFilter {
    /// Only hosts carrying an `insights_id` canonical fact.
    pub insights_only: bool,
}

impl HostFilter {
    /// The filter declared by the given pipeline.
    pub fn of(pipeline: &CyndiPipeline) -> Self {
        Self {
            insights_only: pipeline.spec.insights_only,
        }
    }
}

/// A scoped handle to the inventory database.
#[async_trait]
pub trait InventoryDatabase: Send + Sync {
    /// Fetch all source hosts matching the given filter.
    ///
    /// Malformed rows are reported as `AppError::ValidationData`.
    async fn host_records(&self, filter: &HostFilter) -> Result<Vec<HostRecord>>;
}

/// A scoped handle to an application database.
///
/// All DDL is idempotent: creating an object which already exists and dropping an object which
/// does not exist both succeed.
#[async_trait]
pub trait AppDatabase: Send + Sync {
    /// Create the given replica table along with its indexes.
    async fn create_table(&self, table: &str) -> Result<()>;

    /// Drop the given replica table.
    async fn drop_table(&self, table: &str) -> Result<()>;

    /// Check whether the given replica table exists.
    async fn table_exists(&self, table: &str) -> Result<bool>;

    /// List all replica tables in the inventory schema.
    async fn list_tables(&self) -> Result<Vec<String>>;

    /// Point the serving view at the given table.
    async fn update_view(&self, table: &str) -> Result<()>;

    /// Drop the serving view.
    async fn drop_view(&self) -> Result<()>;

    /// The table currently referenced by the serving view, if the view exists.
    async fn view_target(&self) -> Result<Option<String>>;

    /// Fetch all hosts of the given replica table.
    ///
    /// A missing table or malformed rows are reported as `AppError::ValidationData`.
    async fn host_records(&self, table: &str) -> Result<Vec<HostRecord>>;
}

/// A source of scoped database handles for pipelines.
#[async_trait]
pub trait DatabaseProvider: Send + Sync {
    /// Open a handle to the application database of the given pipeline.
    async fn app_database(&self, pipeline: &CyndiPipeline) -> Result<Box<dyn AppDatabase>>;

    /// Open a handle to the inventory database the given pipeline replicates from.
    async fn inventory_database(&self, pipeline: &CyndiPipeline) -> Result<Box<dyn InventoryDatabase>>;
}

//! In-memory collaborators used to exercise the controllers.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use kube::Resource;
use uuid::Uuid;

use crate::connect::{Connector, ConnectorManager, CreateOutcome, DeleteOutcome};
use crate::controllers::{PipelineController, ValidationController};
use crate::store::{PipelineStore, UpdateOutcome};
use cyndi_core::config::ValidationConfig;
use cyndi_core::crd::{CyndiPipeline, CyndiPipelineSpec, CyndiPipelineStatus, PipelineKey, RequiredMetadata};
use cyndi_core::database::{AppDatabase, DatabaseProvider, HostFilter, HostRecord, InventoryDatabase};
use cyndi_core::{naming, AppError};

pub const NAMESPACE: &str = "cyndi-test";
pub const ACCOUNT: &str = "000001";

/// Parse the given host IDs.
pub fn ids(raw: &[&str]) -> Vec<Uuid> {
    raw.iter().map(|id| Uuid::parse_str(id).expect("invalid fixture uuid")).collect()
}

//////////////////////////////////////////////////////////////////////////////
// Pipeline Store ////////////////////////////////////////////////////////////

/// A pipeline store honoring resource versions, finalizers and deletion timestamps.
#[derive(Default)]
pub struct MemoryStore {
    objects: Mutex<HashMap<PipelineKey, CyndiPipeline>>,
    version: AtomicU64,
    /// The number of upcoming guarded writes which will be rejected as conflicts.
    conflicts: AtomicUsize,
    /// The number of guarded writes which were applied.
    pub writes: AtomicUsize,
}

impl MemoryStore {
    fn next_version(&self) -> Option<String> {
        Some((self.version.fetch_add(1, Ordering::SeqCst) + 1).to_string())
    }

    /// Create a new pipeline.
    pub fn create(&self, name: &str, spec: CyndiPipelineSpec) -> PipelineKey {
        let mut pipeline = CyndiPipeline::new(name, spec);
        pipeline.meta_mut().namespace = Some(NAMESPACE.into());
        pipeline.meta_mut().resource_version = self.next_version();
        let key = PipelineKey::of(&pipeline);
        self.objects.lock().expect("store lock poisoned").insert(key.clone(), pipeline);
        key
    }

    pub fn fetch(&self, key: &PipelineKey) -> Option<CyndiPipeline> {
        self.objects.lock().expect("store lock poisoned").get(key).cloned()
    }

    /// The status of the given pipeline, which must exist.
    pub fn status(&self, key: &PipelineKey) -> CyndiPipelineStatus {
        self.fetch(key).expect("pipeline does not exist").status_or_default()
    }

    /// Overwrite the status of the given pipeline, as a concurrent writer would.
    pub fn set_status(&self, key: &PipelineKey, status: CyndiPipelineStatus) {
        let version = self.next_version();
        let mut objects = self.objects.lock().expect("store lock poisoned");
        if let Some(pipeline) = objects.get_mut(key) {
            pipeline.status = Some(status);
            pipeline.meta_mut().resource_version = version;
        }
    }

    /// Request deletion of the given pipeline.
    ///
    /// Objects carrying finalizers are only marked for deletion.
    pub fn delete(&self, key: &PipelineKey) {
        let version = self.next_version();
        let mut objects = self.objects.lock().expect("store lock poisoned");
        let finalized = match objects.get_mut(key) {
            Some(pipeline) if pipeline.meta().finalizers.as_ref().map(Vec::is_empty).unwrap_or(true) => true,
            Some(pipeline) => {
                pipeline.meta_mut().deletion_timestamp = Some(Time(chrono::Utc::now()));
                pipeline.meta_mut().resource_version = version;
                false
            }
            None => false,
        };
        if finalized {
            objects.remove(key);
        }
    }

    /// Reject the next `count` guarded writes as conflicts.
    pub fn inject_conflicts(&self, count: usize) {
        self.conflicts.store(count, Ordering::SeqCst);
    }

    fn guarded_write(&self, pipeline: &CyndiPipeline, apply: impl FnOnce(&mut CyndiPipeline)) -> Result<UpdateOutcome> {
        let key = PipelineKey::of(pipeline);
        let mut objects = self.objects.lock().expect("store lock poisoned");
        let stored = match objects.get_mut(&key) {
            Some(stored) => stored,
            None => return Ok(UpdateOutcome::NotFound),
        };
        if stored.meta().resource_version != pipeline.meta().resource_version {
            return Ok(UpdateOutcome::Conflict);
        }
        if self.conflicts.load(Ordering::SeqCst) > 0 {
            self.conflicts.fetch_sub(1, Ordering::SeqCst);
            return Ok(UpdateOutcome::Conflict);
        }
        apply(stored);
        stored.meta_mut().resource_version = self.next_version();
        self.writes.fetch_add(1, Ordering::SeqCst);
        let updated = stored.clone();
        if updated.is_deleting() && !updated.has_finalizer() {
            objects.remove(&key);
        }
        Ok(UpdateOutcome::Updated(updated))
    }
}

#[async_trait]
impl PipelineStore for MemoryStore {
    async fn get(&self, key: &PipelineKey) -> Result<Option<CyndiPipeline>> {
        Ok(self.fetch(key))
    }

    async fn update(&self, pipeline: &CyndiPipeline) -> Result<UpdateOutcome> {
        let finalizers = pipeline.meta().finalizers.clone();
        self.guarded_write(pipeline, move |stored| stored.meta_mut().finalizers = finalizers)
    }

    async fn update_status(&self, pipeline: &CyndiPipeline) -> Result<UpdateOutcome> {
        let status = pipeline.status.clone();
        self.guarded_write(pipeline, move |stored| stored.status = status)
    }
}

//////////////////////////////////////////////////////////////////////////////
// Connectors ////////////////////////////////////////////////////////////////

/// A connector manager keeping connectors in memory.
#[derive(Default)]
pub struct MemoryConnectors {
    /// Connectors by namespace and name, holding their app and table.
    connectors: Mutex<BTreeMap<(String, String), (String, String)>>,
    /// The number of connectors created.
    pub creates: AtomicUsize,
    /// The number of connectors deleted.
    pub deletes: AtomicUsize,
    /// Fail every call as an unreachable service would.
    pub unavailable: AtomicBool,
}

impl MemoryConnectors {
    /// The names of all connectors in the given namespace.
    pub fn names(&self, namespace: &str) -> Vec<String> {
        let connectors = self.connectors.lock().expect("connectors lock poisoned");
        connectors.keys().filter(|(ns, _)| ns == namespace).map(|(_, name)| name.clone()).collect()
    }

    /// Remove a connector behind the operator's back.
    pub fn remove(&self, namespace: &str, name: &str) {
        let mut connectors = self.connectors.lock().expect("connectors lock poisoned");
        connectors.remove(&(namespace.to_string(), name.to_string()));
    }

    fn check_available(&self) -> Result<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            bail!("connect cluster unavailable");
        }
        Ok(())
    }
}

#[async_trait]
impl ConnectorManager for MemoryConnectors {
    async fn create_connector(&self, pipeline: &CyndiPipeline, table: &str) -> Result<CreateOutcome> {
        self.check_available()?;
        let name = naming::connector_for_table(pipeline.app_name(), table)
            .ok_or_else(|| AppError::InvalidInput(format!("{} is not a replica table", table)))?;
        let mut connectors = self.connectors.lock().expect("connectors lock poisoned");
        let key = (pipeline.namespace().to_string(), name);
        if connectors.contains_key(&key) {
            return Ok(CreateOutcome::AlreadyExists);
        }
        connectors.insert(key, (pipeline.app_name().to_string(), table.to_string()));
        self.creates.fetch_add(1, Ordering::SeqCst);
        Ok(CreateOutcome::Created)
    }

    async fn delete_connector(&self, namespace: &str, name: &str) -> Result<DeleteOutcome> {
        self.check_available()?;
        let mut connectors = self.connectors.lock().expect("connectors lock poisoned");
        match connectors.remove(&(namespace.to_string(), name.to_string())) {
            Some(_) => {
                self.deletes.fetch_add(1, Ordering::SeqCst);
                Ok(DeleteOutcome::Deleted)
            }
            None => Ok(DeleteOutcome::NotFound),
        }
    }

    async fn list_connectors(&self, namespace: &str, app_name: &str) -> Result<Vec<Connector>> {
        self.check_available()?;
        let connectors = self.connectors.lock().expect("connectors lock poisoned");
        Ok(connectors
            .iter()
            .filter(|((ns, _), (app, _))| ns == namespace && app == app_name)
            .map(|((_, name), (_, table))| Connector {
                name: name.clone(),
                table: Some(table.clone()),
            })
            .collect())
    }
}

//////////////////////////////////////////////////////////////////////////////
// Databases /////////////////////////////////////////////////////////////////

#[derive(Default)]
struct DbState {
    /// Source hosts along with whether they carry an insights ID.
    source: Vec<(HostRecord, bool)>,
    /// Replica tables and their rows.
    tables: BTreeMap<String, Vec<HostRecord>>,
    /// The table referenced by the serving view.
    view: Option<String>,
    /// The number of DDL statements executed.
    ddl: usize,
    /// Fail every call as an unreachable database would.
    unavailable: bool,
}

/// An inventory database and a single app database kept in memory.
#[derive(Clone, Default)]
pub struct MemoryDatabases {
    state: Arc<Mutex<DbState>>,
}

impl MemoryDatabases {
    fn with<T>(&self, f: impl FnOnce(&mut DbState) -> T) -> T {
        let mut state = self.state.lock().expect("database lock poisoned");
        f(&mut state)
    }

    /// Insert the given hosts into the source table.
    pub fn seed_source(&self, ids: &[Uuid], insights: bool) {
        self.with(|state| {
            state
                .source
                .extend(ids.iter().map(|id| (HostRecord::new(*id, Some(ACCOUNT)), insights)))
        });
    }

    /// Insert the given hosts into the given replica table, which must exist.
    pub fn seed_table(&self, table: &str, ids: &[Uuid]) -> Result<()> {
        self.with(|state| {
            let rows = state.tables.get_mut(table).with_context(|| format!("relation inventory.{} does not exist", table))?;
            rows.extend(ids.iter().map(|id| HostRecord::new(*id, Some(ACCOUNT))));
            Ok(())
        })
    }

    /// The names of all replica tables.
    pub fn tables(&self) -> Vec<String> {
        self.with(|state| state.tables.keys().cloned().collect())
    }

    /// Drop a table behind the operator's back.
    pub fn remove_table(&self, table: &str) {
        self.with(|state| state.tables.remove(table));
    }

    /// Drop the serving view behind the operator's back.
    pub fn clear_view(&self) {
        self.with(|state| state.view = None);
    }

    pub fn view(&self) -> Option<String> {
        self.with(|state| state.view.clone())
    }

    pub fn ddl_count(&self) -> usize {
        self.with(|state| state.ddl)
    }

    pub fn set_unavailable(&self, unavailable: bool) {
        self.with(|state| state.unavailable = unavailable);
    }

    fn call<T>(&self, f: impl FnOnce(&mut DbState) -> Result<T>) -> Result<T> {
        self.with(|state| {
            if state.unavailable {
                bail!("connection refused");
            }
            f(state)
        })
    }
}

#[async_trait]
impl DatabaseProvider for MemoryDatabases {
    async fn app_database(&self, _: &CyndiPipeline) -> Result<Box<dyn AppDatabase>> {
        self.call(|_| Ok(()))?;
        Ok(Box::new(self.clone()))
    }

    async fn inventory_database(&self, _: &CyndiPipeline) -> Result<Box<dyn InventoryDatabase>> {
        self.call(|_| Ok(()))?;
        Ok(Box::new(self.clone()))
    }
}

#[async_trait]
impl InventoryDatabase for MemoryDatabases {
    async fn host_records(&self, filter: &HostFilter) -> Result<Vec<HostRecord>> {
        self.call(|state| {
            Ok(state
                .source
                .iter()
                .filter(|(_, insights)| *insights || !filter.insights_only)
                .map(|(host, _)| host.clone())
                .collect())
        })
    }
}

#[async_trait]
impl AppDatabase for MemoryDatabases {
    async fn create_table(&self, table: &str) -> Result<()> {
        self.call(|state| {
            state.ddl += 1;
            state.tables.entry(table.to_string()).or_default();
            Ok(())
        })
    }

    async fn drop_table(&self, table: &str) -> Result<()> {
        self.call(|state| {
            if state.view.as_deref() == Some(table) {
                bail!("cannot drop table {} because view hosts depends on it", table);
            }
            state.ddl += 1;
            state.tables.remove(table);
            Ok(())
        })
    }

    async fn table_exists(&self, table: &str) -> Result<bool> {
        self.call(|state| Ok(state.tables.contains_key(table)))
    }

    async fn list_tables(&self) -> Result<Vec<String>> {
        self.call(|state| Ok(state.tables.keys().filter(|table| naming::is_replica_table(table)).cloned().collect()))
    }

    async fn update_view(&self, table: &str) -> Result<()> {
        self.call(|state| {
            if !state.tables.contains_key(table) {
                bail!("relation inventory.{} does not exist", table);
            }
            state.ddl += 1;
            state.view = Some(table.to_string());
            Ok(())
        })
    }

    async fn drop_view(&self) -> Result<()> {
        self.call(|state| {
            state.ddl += 1;
            state.view = None;
            Ok(())
        })
    }

    async fn view_target(&self) -> Result<Option<String>> {
        self.call(|state| Ok(state.view.clone()))
    }

    async fn host_records(&self, table: &str) -> Result<Vec<HostRecord>> {
        self.call(|state| match state.tables.get(table) {
            Some(rows) => Ok(rows.clone()),
            None => Err(AppError::ValidationData(format!("replica table {} does not exist", table)).into()),
        })
    }
}

//////////////////////////////////////////////////////////////////////////////
// Harness ///////////////////////////////////////////////////////////////////

/// Both controllers wired to a shared set of in-memory collaborators.
pub struct Harness {
    pub store: Arc<MemoryStore>,
    pub connectors: Arc<MemoryConnectors>,
    pub databases: MemoryDatabases,
    pub pipelines: PipelineController,
    pub validation: ValidationController,
}

impl Harness {
    /// Build a harness using the default validation thresholds: 5/20 during initial sync and
    /// 3/20 in steady state.
    pub fn new() -> Self {
        let store = Arc::new(MemoryStore::default());
        let connectors = Arc::new(MemoryConnectors::default());
        let databases = MemoryDatabases::default();
        let pipelines = PipelineController::new(store.clone(), connectors.clone(), Arc::new(databases.clone()));
        let validation = ValidationController::new(store.clone(), Arc::new(databases.clone()), ValidationConfig::default());
        Self {
            store,
            connectors,
            databases,
            pipelines,
            validation,
        }
    }

    /// Create an insights-only pipeline.
    pub fn create_pipeline(&self, name: &str) -> PipelineKey {
        self.store.create(
            name,
            CyndiPipelineSpec {
                insights_only: true,
                ..Default::default()
            },
        )
    }
}

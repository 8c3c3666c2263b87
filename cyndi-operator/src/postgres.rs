//! Postgres database adapters.
//!
//! Credentials are read from K8s Secrets in the pipeline's namespace. Every statement runs under
//! the configured timeout, and the connection is closed when the handle is dropped.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use k8s_openapi::api::core::v1::Secret;
use kube::api::Api;
use kube::client::Client;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_postgres::error::SqlState;
use tokio_postgres::{NoTls, Row};
use uuid::Uuid;

use crate::config::Config;
use cyndi_core::crd::{CyndiPipeline, RequiredMetadata};
use cyndi_core::database::{AppDatabase, DatabaseProvider, HostFilter, HostRecord, InventoryDatabase};
use cyndi_core::naming::{self, TABLE_SCHEMA, VIEW_NAME};
use cyndi_core::AppError;

const SECRET_KEY_HOST: &str = "db.host";
const SECRET_KEY_PORT: &str = "db.port";
const SECRET_KEY_NAME: &str = "db.name";
const SECRET_KEY_USER: &str = "db.user";
const SECRET_KEY_PASSWORD: &str = "db.password";

/// Connection parameters of a database.
#[derive(Clone, Debug, PartialEq)]
pub struct DbParams {
    pub host: String,
    pub port: u16,
    pub name: String,
    pub user: String,
    pub password: String,
}

impl DbParams {
    /// Extract connection parameters from the given Secret.
    pub fn from_secret(secret: &Secret) -> Result<Self> {
        let name = secret.metadata.name.as_deref().unwrap_or_default();
        let get = |key: &str| -> Result<String> {
            let val = secret
                .data
                .as_ref()
                .and_then(|data| data.get(key))
                .with_context(|| format!("secret {} is missing key {}", name, key))?;
            String::from_utf8(val.0.clone()).with_context(|| format!("secret {} key {} is not valid utf-8", name, key))
        };
        let port = get(SECRET_KEY_PORT)?;
        Ok(Self {
            host: get(SECRET_KEY_HOST)?,
            port: port.trim().parse().with_context(|| format!("secret {} has invalid port {:?}", name, port))?,
            name: get(SECRET_KEY_NAME)?,
            user: get(SECRET_KEY_USER)?,
            password: get(SECRET_KEY_PASSWORD)?,
        })
    }
}

/// A database provider which resolves credentials from K8s Secrets.
pub struct PgProvider {
    client: Client,
    config: Arc<Config>,
}

impl PgProvider {
    pub fn new(client: Client, config: Arc<Config>) -> Self {
        Self { client, config }
    }

    async fn params(&self, namespace: &str, secret_name: &str) -> Result<DbParams> {
        let api: Api<Secret> = Api::namespaced(self.client.clone(), namespace);
        let secret = timeout(self.config.api_timeout(), api.get(secret_name))
            .await
            .context("timeout while fetching database secret")?
            .with_context(|| format!("error fetching database secret {}/{}", namespace, secret_name))?;
        DbParams::from_secret(&secret)
    }
}

#[async_trait]
impl DatabaseProvider for PgProvider {
    async fn app_database(&self, pipeline: &CyndiPipeline) -> Result<Box<dyn AppDatabase>> {
        let secret = pipeline.spec.db_secret.clone().unwrap_or_else(|| format!("{}-db", pipeline.name()));
        let params = self.params(pipeline.namespace(), &secret).await?;
        let db = PgDatabase::connect(&params, self.config.db_timeout()).await?;
        Ok(Box::new(db))
    }

    async fn inventory_database(&self, pipeline: &CyndiPipeline) -> Result<Box<dyn InventoryDatabase>> {
        let secret = pipeline
            .spec
            .inventory_db_secret
            .clone()
            .unwrap_or_else(|| self.config.inventory_db_secret.clone());
        let params = self.params(pipeline.namespace(), &secret).await?;
        let db = PgDatabase::connect(&params, self.config.db_timeout()).await?;
        Ok(Box::new(db))
    }
}

/// A scoped connection to a Postgres database.
pub struct PgDatabase {
    client: tokio_postgres::Client,
    connection: JoinHandle<()>,
    timeout: Duration,
}

impl PgDatabase {
    /// Open a new connection.
    #[tracing::instrument(level = "debug", skip(params), fields(host = %params.host, db = %params.name))]
    pub async fn connect(params: &DbParams, timeout_after: Duration) -> Result<Self> {
        let mut config = tokio_postgres::Config::new();
        config
            .host(&params.host)
            .port(params.port)
            .dbname(&params.name)
            .user(&params.user)
            .password(&params.password)
            .connect_timeout(timeout_after);
        let (client, connection) = timeout(timeout_after, config.connect(NoTls))
            .await
            .context("timeout while connecting to database")?
            .with_context(|| format!("error connecting to database {} at {}", params.name, params.host))?;
        let connection = tokio::spawn(async move {
            if let Err(err) = connection.await {
                tracing::error!(error = ?err, "database connection error");
            }
        });
        Ok(Self {
            client,
            connection,
            timeout: timeout_after,
        })
    }

    /// Run the given statement future under this handle's timeout.
    async fn timed<T>(&self, what: &str, fut: impl Future<Output = std::result::Result<T, tokio_postgres::Error>>) -> Result<T> {
        timeout(self.timeout, fut)
            .await
            .with_context(|| format!("timeout while {}", what))?
            .with_context(|| format!("error {}", what))
    }

    fn checked(table: &str) -> Result<&str> {
        if !naming::is_valid_identifier(table) {
            bail!(AppError::InvalidInput(format!("invalid table name {:?}", table)));
        }
        Ok(table)
    }
}

impl Drop for PgDatabase {
    fn drop(&mut self) {
        self.connection.abort();
    }
}

/// The query selecting source hosts.
///
/// The account is read through the row's JSON form, so it is NULL on inventory schemas without
/// an `account` column and hosts are then matched by ID alone.
fn source_hosts_query(insights_only: bool) -> &'static str {
    if insights_only {
        "SELECT h.id, to_jsonb(h) ->> 'account' FROM public.hosts h WHERE h.canonical_facts ? 'insights_id'"
    } else {
        "SELECT h.id, to_jsonb(h) ->> 'account' FROM public.hosts h"
    }
}

/// Convert the given rows into host records.
fn host_records(rows: Vec<Row>) -> Result<Vec<HostRecord>> {
    rows.into_iter()
        .map(|row| -> Result<HostRecord> {
            let id: Option<Uuid> = row.try_get(0).context("error decoding host id")?;
            let account: Option<String> = row.try_get(1).context("error decoding host account")?;
            let id = id.ok_or_else(|| AppError::ValidationData("host with a null id".into()))?;
            Ok(HostRecord { id, account })
        })
        .collect()
}

#[async_trait]
impl InventoryDatabase for PgDatabase {
    #[tracing::instrument(level = "debug", skip(self))]
    async fn host_records(&self, filter: &HostFilter) -> Result<Vec<HostRecord>> {
        let query = source_hosts_query(filter.insights_only);
        let rows = self.timed("fetching source hosts", self.client.query(query, &[])).await?;
        host_records(rows)
    }
}

#[async_trait]
impl AppDatabase for PgDatabase {
    #[tracing::instrument(level = "debug", skip(self))]
    async fn create_table(&self, table: &str) -> Result<()> {
        let table = Self::checked(table)?;
        let ddl = format!(
            r#"CREATE SCHEMA IF NOT EXISTS {schema};
CREATE TABLE IF NOT EXISTS {schema}.{table} (
    id uuid PRIMARY KEY,
    account character varying(10),
    org_id character varying(36),
    display_name character varying(200) NOT NULL DEFAULT '',
    tags jsonb NOT NULL DEFAULT '{{}}',
    updated timestamp with time zone NOT NULL,
    created timestamp with time zone NOT NULL,
    stale_timestamp timestamp with time zone NOT NULL,
    system_profile jsonb NOT NULL DEFAULT '{{}}',
    insights_id uuid,
    reporter character varying(255)
);
CREATE INDEX IF NOT EXISTS {table}_account_index ON {schema}.{table} (account);
CREATE INDEX IF NOT EXISTS {table}_tags_index ON {schema}.{table} USING GIN (tags JSONB_PATH_OPS);
CREATE INDEX IF NOT EXISTS {table}_stale_timestamp_index ON {schema}.{table} (stale_timestamp);"#,
            schema = TABLE_SCHEMA,
            table = table,
        );
        self.timed("creating replica table", self.client.batch_execute(&ddl)).await
    }

    #[tracing::instrument(level = "debug", skip(self))]
    async fn drop_table(&self, table: &str) -> Result<()> {
        let table = Self::checked(table)?;
        let ddl = format!("DROP TABLE IF EXISTS {}", naming::qualified(table));
        self.timed("dropping replica table", self.client.batch_execute(&ddl)).await
    }

    #[tracing::instrument(level = "debug", skip(self))]
    async fn table_exists(&self, table: &str) -> Result<bool> {
        let query = "SELECT EXISTS (SELECT 1 FROM information_schema.tables WHERE table_schema = $1::text AND table_name = $2::text)";
        let row = self.timed("checking replica table", self.client.query_one(query, &[&TABLE_SCHEMA, &table])).await?;
        row.try_get(0).context("error decoding table existence")
    }

    #[tracing::instrument(level = "debug", skip(self))]
    async fn list_tables(&self) -> Result<Vec<String>> {
        let query = "SELECT table_name::text FROM information_schema.tables WHERE table_schema = $1::text AND table_type = 'BASE TABLE'";
        let rows = self.timed("listing replica tables", self.client.query(query, &[&TABLE_SCHEMA])).await?;
        let mut tables = Vec::with_capacity(rows.len());
        for row in rows {
            let table: String = row.try_get(0).context("error decoding table name")?;
            if naming::is_replica_table(&table) {
                tables.push(table);
            }
        }
        Ok(tables)
    }

    #[tracing::instrument(level = "debug", skip(self))]
    async fn update_view(&self, table: &str) -> Result<()> {
        let table = Self::checked(table)?;
        let view = naming::qualified(VIEW_NAME);
        let ddl = format!(
            "BEGIN; DROP VIEW IF EXISTS {view}; CREATE VIEW {view} AS SELECT * FROM {table}; COMMIT;",
            view = view,
            table = naming::qualified(table),
        );
        self.timed("updating view", self.client.batch_execute(&ddl)).await
    }

    #[tracing::instrument(level = "debug", skip(self))]
    async fn drop_view(&self) -> Result<()> {
        let ddl = format!("DROP VIEW IF EXISTS {}", naming::qualified(VIEW_NAME));
        self.timed("dropping view", self.client.batch_execute(&ddl)).await
    }

    #[tracing::instrument(level = "debug", skip(self))]
    async fn view_target(&self) -> Result<Option<String>> {
        let query = "SELECT table_name::text FROM information_schema.view_table_usage WHERE view_schema = $1::text AND view_name = $2::text";
        let rows = self.timed("fetching view target", self.client.query(query, &[&TABLE_SCHEMA, &VIEW_NAME])).await?;
        match rows.first() {
            Some(row) => Ok(Some(row.try_get(0).context("error decoding view target")?)),
            None => Ok(None),
        }
    }

    #[tracing::instrument(level = "debug", skip(self))]
    async fn host_records(&self, table: &str) -> Result<Vec<HostRecord>> {
        let table = Self::checked(table)?;
        let query = format!("SELECT id, account FROM {}", naming::qualified(table));
        let rows = match timeout(self.timeout, self.client.query(query.as_str(), &[])).await {
            Ok(Ok(rows)) => rows,
            Ok(Err(err)) if err.code() == Some(&SqlState::UNDEFINED_TABLE) => {
                return Err(AppError::ValidationData(format!("replica table {} does not exist", table)).into());
            }
            Ok(Err(err)) => return Err(err).context("error fetching replica hosts"),
            Err(err) => return Err(err).context("timeout while fetching replica hosts"),
        };
        host_records(rows)
    }
}

//! Connector management.
//!
//! Each refresh generation of a pipeline is populated by its own Kafka Connect JDBC sink,
//! declared as a Strimzi `KafkaConnector` object next to the pipeline.

use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use kube::api::{Api, ApiResource, DeleteParams, DynamicObject, GroupVersionKind, ListParams, PostParams};
use kube::client::Client;
use maplit::btreemap;
use serde_json::json;
use tokio::time::timeout;

use cyndi_core::config::ConnectConfig;
use cyndi_core::crd::{CyndiPipeline, RequiredMetadata};
use cyndi_core::{naming, AppError, LABEL_APP_NAME};

const CONNECTOR_GROUP: &str = "kafka.strimzi.io";
const CONNECTOR_VERSION: &str = "v1beta2";
const CONNECTOR_KIND: &str = "KafkaConnector";
/// The Strimzi label selecting the Kafka Connect cluster a connector runs in.
const LABEL_STRIMZI_CLUSTER: &str = "strimzi.io/cluster";
const CONNECTOR_CLASS: &str = "io.confluent.connect.jdbc.JdbcSinkConnector";

/// A connector owned by a pipeline.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Connector {
    /// The name of the connector.
    pub name: String,
    /// The replica table the connector writes to.
    pub table: Option<String>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CreateOutcome {
    Created,
    AlreadyExists,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DeleteOutcome {
    Deleted,
    NotFound,
}

/// Management of the connectors which populate replica tables.
#[async_trait]
pub trait ConnectorManager: Send + Sync {
    /// Create the connector populating the given table of the given pipeline.
    async fn create_connector(&self, pipeline: &CyndiPipeline, table: &str) -> Result<CreateOutcome>;

    /// Delete the given connector.
    async fn delete_connector(&self, namespace: &str, name: &str) -> Result<DeleteOutcome>;

    /// List all connectors labelled with the given app.
    async fn list_connectors(&self, namespace: &str, app_name: &str) -> Result<Vec<Connector>>;
}

/// A connector manager backed by Strimzi `KafkaConnector` objects.
pub struct KafkaConnectManager {
    client: Client,
    resource: ApiResource,
    config: ConnectConfig,
    timeout: Duration,
}

impl KafkaConnectManager {
    pub fn new(client: Client, config: ConnectConfig, timeout: Duration) -> Self {
        let gvk = GroupVersionKind::gvk(CONNECTOR_GROUP, CONNECTOR_VERSION, CONNECTOR_KIND);
        Self {
            client,
            resource: ApiResource::from_gvk(&gvk),
            config,
            timeout,
        }
    }

    fn api(&self, namespace: &str) -> Api<DynamicObject> {
        Api::namespaced_with(self.client.clone(), namespace, &self.resource)
    }

    /// Build the connector object populating the given table.
    fn build_connector(&self, pipeline: &CyndiPipeline, name: &str, table: &str) -> DynamicObject {
        let cluster = pipeline.spec.connect_cluster.clone().unwrap_or_else(|| self.config.cluster.clone());
        let db_secret = pipeline.spec.db_secret.clone().unwrap_or_else(|| format!("{}-db", pipeline.name()));
        let secret_file = |key: &str| format!("${{file:/opt/kafka/external-configuration/{}/{}}}", db_secret, key);

        let mut config = json!({
            "topics": self.config.topic,
            "connection.url": format!("jdbc:postgresql://{}:{}/{}", secret_file("db.host"), secret_file("db.port"), secret_file("db.name")),
            "connection.user": secret_file("db.user"),
            "connection.password": secret_file("db.password"),
            "table.name.format": naming::qualified(table),
            "batch.size": self.config.batch_size,
            "insert.mode": "upsert",
            "pk.mode": "record_key",
            "pk.fields": "id",
            "delete.enabled": true,
            "auto.create": false,
            "key.converter": "org.apache.kafka.connect.storage.StringConverter",
            "value.converter": "org.apache.kafka.connect.json.JsonConverter",
            "value.converter.schemas.enable": false,
            "transforms": "deleteToTombstone,extractHost,maxAge",
            "transforms.deleteToTombstone.type": "com.redhat.insights.kafka.connect.transforms.DropIf$Value",
            "transforms.deleteToTombstone.if": "'delete'.equals(record.headers().lastWithName('event_type').value())",
            "transforms.extractHost.type": "org.apache.kafka.connect.transforms.ExtractField$Value",
            "transforms.extractHost.field": "host",
            "transforms.maxAge.type": "com.redhat.insights.kafka.connect.transforms.FilterStaleHosts",
            "transforms.maxAge.max.age.days": self.config.max_age,
        });
        if pipeline.spec.insights_only {
            config["transforms"] = json!("deleteToTombstone,extractHost,maxAge,insightsFilter");
            config["transforms.insightsFilter.type"] = json!("com.redhat.insights.kafka.connect.transforms.Filter");
            config["transforms.insightsFilter.if"] = json!("!!record.headers().lastWithName('insights_id').value()");
            config["transforms.insightsFilter.where"] = json!("canonical_facts ? 'insights_id'");
        }

        let mut obj = DynamicObject::new(name, &self.resource).within(pipeline.namespace());
        obj.metadata.labels = Some(btreemap! {
            LABEL_APP_NAME.into() => pipeline.app_name().into(),
            LABEL_STRIMZI_CLUSTER.into() => cluster,
        });
        obj.data = json!({
            "spec": {
                "class": CONNECTOR_CLASS,
                "tasksMax": self.config.tasks_max,
                "config": config,
            }
        });
        obj
    }
}

#[async_trait]
impl ConnectorManager for KafkaConnectManager {
    #[tracing::instrument(level = "debug", skip(self, pipeline))]
    async fn create_connector(&self, pipeline: &CyndiPipeline, table: &str) -> Result<CreateOutcome> {
        let name = naming::connector_for_table(pipeline.app_name(), table)
            .ok_or_else(|| AppError::InvalidInput(format!("{} is not a replica table", table)))?;
        let obj = self.build_connector(pipeline, &name, table);
        let res = timeout(self.timeout, self.api(pipeline.namespace()).create(&PostParams::default(), &obj))
            .await
            .context("timeout while creating connector")?;
        match res {
            Ok(_) => {
                tracing::info!(connector = %name, table, "connector created");
                Ok(CreateOutcome::Created)
            }
            Err(kube::Error::Api(err)) if err.code == 409 => Ok(CreateOutcome::AlreadyExists),
            Err(err) => Err(err).with_context(|| format!("error creating connector {}", name)),
        }
    }

    #[tracing::instrument(level = "debug", skip(self))]
    async fn delete_connector(&self, namespace: &str, name: &str) -> Result<DeleteOutcome> {
        let res = timeout(self.timeout, self.api(namespace).delete(name, &DeleteParams::default()))
            .await
            .context("timeout while deleting connector")?;
        match res {
            Ok(_) => {
                tracing::info!(connector = %name, "connector deleted");
                Ok(DeleteOutcome::Deleted)
            }
            Err(kube::Error::Api(err)) if err.code == 404 => Ok(DeleteOutcome::NotFound),
            Err(err) => Err(err).with_context(|| format!("error deleting connector {}", name)),
        }
    }

    #[tracing::instrument(level = "debug", skip(self))]
    async fn list_connectors(&self, namespace: &str, app_name: &str) -> Result<Vec<Connector>> {
        let params = ListParams::default().labels(&format!("{}={}", LABEL_APP_NAME, app_name));
        let list = timeout(self.timeout, self.api(namespace).list(&params))
            .await
            .context("timeout while listing connectors")?
            .context("error listing connectors")?;
        Ok(list
            .items
            .into_iter()
            .filter_map(|obj| {
                let table = obj.data["spec"]["config"]["table.name.format"]
                    .as_str()
                    .and_then(|val| val.rsplit('.').next())
                    .map(String::from);
                obj.metadata.name.map(|name| Connector { name, table })
            })
            .collect())
    }
}

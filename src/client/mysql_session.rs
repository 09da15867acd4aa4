//! MySQL backend using the `mysql_async` crate.
//!
//! Implements [`InstanceSession`] with plain SQL over the classic protocol.
//! Metadata lives in the `mysql_innodb_cluster_metadata` schema of the
//! member the session is connected to and is written in one transaction.

use std::collections::BTreeMap;
use std::sync::LazyLock;
use std::time::Duration;

use mysql_async::prelude::Queryable;
use mysql_async::{Conn, OptsBuilder, TxOpts};
use tracing::{debug, instrument};

use super::instance_def::InstanceDef;
use super::session::{ClientError, ClientResult, Connector, InstanceSession};
use super::types::{
    GroupMember, GtidSet, MemberRole, MemberState, ReplicationChannel, ServerInfo,
    ServerVersion, VarScope,
};
use crate::metadata::records::{
    ClusterRecord, InstanceRecord, METADATA_SCHEMA, MetadataSnapshot, ReplicaSetRecord,
};

/// `ER_UNKNOWN_SYSTEM_VARIABLE`
const ER_UNKNOWN_SYSTEM_VARIABLE: u16 = 1193;

static SYSVAR_NAME: LazyLock<Option<regex::Regex>> =
    LazyLock::new(|| regex::Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$").ok());

const METADATA_DDL: &[&str] = &[
    "CREATE SCHEMA IF NOT EXISTS mysql_innodb_cluster_metadata",
    "CREATE TABLE IF NOT EXISTS mysql_innodb_cluster_metadata.clusters (
        cluster_id INT UNSIGNED NOT NULL PRIMARY KEY,
        cluster_name VARCHAR(40) NOT NULL UNIQUE,
        description TEXT,
        group_name VARCHAR(36) NOT NULL,
        ssl_mode VARCHAR(16) NOT NULL,
        disable_clone TINYINT(1) NOT NULL DEFAULT 0
    ) ENGINE=InnoDB",
    "CREATE TABLE IF NOT EXISTS mysql_innodb_cluster_metadata.replicasets (
        replicaset_id INT UNSIGNED NOT NULL PRIMARY KEY,
        cluster_id INT UNSIGNED NOT NULL,
        replicaset_name VARCHAR(40) NOT NULL,
        topology_type ENUM('pm', 'mm') NOT NULL DEFAULT 'pm',
        FOREIGN KEY (cluster_id) REFERENCES mysql_innodb_cluster_metadata.clusters (cluster_id)
    ) ENGINE=InnoDB",
    "CREATE TABLE IF NOT EXISTS mysql_innodb_cluster_metadata.instances (
        instance_id INT UNSIGNED NOT NULL PRIMARY KEY,
        replicaset_id INT UNSIGNED NOT NULL,
        mysql_server_uuid VARCHAR(40) NOT NULL UNIQUE,
        instance_name VARCHAR(256) NOT NULL,
        label VARCHAR(256) NOT NULL,
        role ENUM('HA', 'readScaleOut') NOT NULL,
        local_address VARCHAR(256) NOT NULL,
        FOREIGN KEY (replicaset_id) REFERENCES mysql_innodb_cluster_metadata.replicasets (replicaset_id)
    ) ENGINE=InnoDB",
];

/// Settings for [`MySqlConnector`].
#[derive(Clone, Debug)]
pub struct MySqlConnectorConfig {
    pub connect_timeout: Duration,
}

impl Default for MySqlConnectorConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
        }
    }
}

/// Opens [`MySqlSession`]s.
#[derive(Clone, Debug, Default)]
pub struct MySqlConnector {
    config: MySqlConnectorConfig,
}

impl MySqlConnector {
    pub fn new(config: MySqlConnectorConfig) -> Self {
        Self { config }
    }
}

impl Connector for MySqlConnector {
    type Session = MySqlSession;

    #[instrument(skip_all, fields(endpoint = %instance.endpoint()))]
    async fn connect(&self, instance: &InstanceDef) -> ClientResult<MySqlSession> {
        let mut opts = OptsBuilder::default()
            .ip_or_hostname(instance.host.clone())
            .tcp_port(instance.port)
            .user(instance.user.clone())
            .pass(instance.password.clone());
        if let Some(socket) = &instance.socket {
            opts = opts.socket(Some(socket.clone()));
        }

        let endpoint = instance.endpoint();
        let conn = tokio::time::timeout(self.config.connect_timeout, Conn::new(opts))
            .await
            .map_err(|_| ClientError::Connection {
                endpoint: endpoint.clone(),
                message: format!("connect timed out after {:?}", self.config.connect_timeout),
            })?
            .map_err(|e| map_error(&endpoint, e))?;
        debug!("Connected");

        Ok(MySqlSession {
            conn,
            instance: instance.clone(),
        })
    }
}

/// A classic protocol session to one server.
pub struct MySqlSession {
    conn: Conn,
    instance: InstanceDef,
}

impl MySqlSession {
    fn err(&self) -> impl Fn(mysql_async::Error) -> ClientError + '_ {
        move |e| map_error(&self.instance.endpoint(), e)
    }

    fn check_name(&self, name: &str) -> ClientResult<()> {
        match SYSVAR_NAME.as_ref() {
            Some(re) if re.is_match(name) => Ok(()),
            _ => Err(ClientError::Server {
                endpoint: self.instance.endpoint(),
                code: ER_UNKNOWN_SYSTEM_VARIABLE,
                message: format!("Unknown system variable '{name}'"),
            }),
        }
    }

    /// Primary uuid on servers that lack the `MEMBER_ROLE` column.
    async fn legacy_primary_member(&mut self) -> ClientResult<Option<String>> {
        let endpoint = self.instance.endpoint();
        let primary: Option<String> = self
            .conn
            .query_first(
                "SELECT VARIABLE_VALUE FROM performance_schema.global_status \
                 WHERE VARIABLE_NAME = 'group_replication_primary_member'",
            )
            .await
            .map_err(|e| map_error(&endpoint, e))?;
        Ok(primary.filter(|p| !p.is_empty()))
    }
}

fn map_error(endpoint: &str, e: mysql_async::Error) -> ClientError {
    match e {
        mysql_async::Error::Server(server) => ClientError::Server {
            endpoint: endpoint.to_string(),
            code: server.code,
            message: server.message,
        },
        other => ClientError::Connection {
            endpoint: endpoint.to_string(),
            message: other.to_string(),
        },
    }
}

/// Render a value for `SET`, quoting anything that is not an integer.
fn quote_value(value: &str) -> String {
    if value.parse::<i64>().is_ok() {
        value.to_string()
    } else {
        format!("'{}'", value.replace('\\', "\\\\").replace('\'', "\\'"))
    }
}

fn parse_bool(value: &str) -> bool {
    matches!(value.trim().to_uppercase().as_str(), "1" | "ON" | "TRUE")
}

impl InstanceSession for MySqlSession {
    fn instance(&self) -> &InstanceDef {
        &self.instance
    }

    #[instrument(skip(self), fields(endpoint = %self.instance.endpoint()))]
    async fn server_info(&mut self) -> ClientResult<ServerInfo> {
        let row: Option<(String, u32, String, String)> = self
            .conn
            .query_first("SELECT @@server_uuid, @@server_id, @@version, @@super_read_only")
            .await
            .map_err(self.err())?;
        let (uuid, server_id, version, super_read_only) =
            row.ok_or_else(|| ClientError::Server {
                endpoint: self.instance.endpoint(),
                code: 0,
                message: "empty result for server identity query".to_string(),
            })?;

        let group_name = self
            .get_sysvar("group_replication_group_name")
            .await?
            .unwrap_or_default();
        let single_primary_mode = self
            .get_sysvar("group_replication_single_primary_mode")
            .await?
            .map(|v| parse_bool(&v))
            .unwrap_or(true);

        Ok(ServerInfo {
            uuid,
            server_id,
            version: version.parse::<ServerVersion>()?,
            super_read_only: parse_bool(&super_read_only),
            group_name,
            single_primary_mode,
        })
    }

    #[instrument(skip(self), fields(endpoint = %self.instance.endpoint()))]
    async fn get_sysvar(&mut self, name: &str) -> ClientResult<Option<String>> {
        self.check_name(name)?;
        let endpoint = self.instance.endpoint();
        match self
            .conn
            .query_first::<Option<String>, _>(format!("SELECT @@GLOBAL.{name}"))
            .await
        {
            Ok(value) => Ok(value.flatten()),
            Err(mysql_async::Error::Server(e)) if e.code == ER_UNKNOWN_SYSTEM_VARIABLE => Ok(None),
            Err(e) => Err(map_error(&endpoint, e)),
        }
    }

    #[instrument(skip(self), fields(endpoint = %self.instance.endpoint()))]
    async fn get_sysvars_with_prefix(
        &mut self,
        prefix: &str,
    ) -> ClientResult<BTreeMap<String, String>> {
        let rows: Vec<(String, Option<String>)> = self
            .conn
            .exec(
                "SELECT VARIABLE_NAME, VARIABLE_VALUE FROM performance_schema.global_variables \
                 WHERE VARIABLE_NAME LIKE ? ORDER BY VARIABLE_NAME",
                (format!("{prefix}%"),),
            )
            .await
            .map_err(self.err())?;
        Ok(rows
            .into_iter()
            .map(|(name, value)| (name.to_lowercase(), value.unwrap_or_default()))
            .collect())
    }

    #[instrument(skip(self), fields(endpoint = %self.instance.endpoint()))]
    async fn set_sysvar(&mut self, name: &str, value: &str, scope: VarScope) -> ClientResult<()> {
        self.check_name(name)?;
        let endpoint = self.instance.endpoint();
        self.conn
            .query_drop(format!("SET {scope} {name} = {}", quote_value(value)))
            .await
            .map_err(|e| map_error(&endpoint, e))
    }

    #[instrument(skip(self), fields(endpoint = %self.instance.endpoint()))]
    async fn group_members(&mut self) -> ClientResult<Vec<GroupMember>> {
        let endpoint = self.instance.endpoint();
        let rows: Vec<(String, String, Option<u16>, String, Option<String>)> = match self
            .conn
            .query(
                "SELECT MEMBER_ID, MEMBER_HOST, MEMBER_PORT, MEMBER_STATE, MEMBER_ROLE \
                 FROM performance_schema.replication_group_members",
            )
            .await
        {
            Ok(rows) => rows,
            // 5.7 lacks MEMBER_ROLE
            Err(mysql_async::Error::Server(_)) => {
                let rows: Vec<(String, String, Option<u16>, String)> = self
                    .conn
                    .query(
                        "SELECT MEMBER_ID, MEMBER_HOST, MEMBER_PORT, MEMBER_STATE \
                         FROM performance_schema.replication_group_members",
                    )
                    .await
                    .map_err(|e| map_error(&endpoint, e))?;
                let primary = self.legacy_primary_member().await?;
                rows.into_iter()
                    .map(|(id, host, port, state)| {
                        let role = match &primary {
                            Some(p) if *p != id => "SECONDARY",
                            _ => "PRIMARY",
                        };
                        (id, host, port, state, Some(role.to_string()))
                    })
                    .collect()
            }
            Err(e) => return Err(map_error(&endpoint, e)),
        };

        let mut members = Vec::with_capacity(rows.len());
        for (uuid, host, port, state, role) in rows {
            if uuid.is_empty() {
                continue;
            }
            let state: MemberState = state.parse()?;
            members.push(GroupMember {
                uuid,
                host,
                port: port.unwrap_or(self.instance.port),
                state,
                role: role
                    .as_deref()
                    .unwrap_or("SECONDARY")
                    .parse()
                    .unwrap_or(MemberRole::Secondary),
            });
        }

        // A stopped member reports only itself as OFFLINE.
        if members.iter().all(|m| m.state == MemberState::Offline) {
            return Ok(Vec::new());
        }
        Ok(members)
    }

    #[instrument(skip(self), fields(endpoint = %self.instance.endpoint()))]
    async fn start_group_replication(&mut self, bootstrap: bool) -> ClientResult<()> {
        let endpoint = self.instance.endpoint();
        if bootstrap {
            self.conn
                .query_drop("SET GLOBAL group_replication_bootstrap_group = ON")
                .await
                .map_err(|e| map_error(&endpoint, e))?;
        }
        let started = self.conn.query_drop("START GROUP_REPLICATION").await;
        if bootstrap {
            self.conn
                .query_drop("SET GLOBAL group_replication_bootstrap_group = OFF")
                .await
                .map_err(|e| map_error(&endpoint, e))?;
        }
        started.map_err(|e| map_error(&endpoint, e))
    }

    #[instrument(skip(self), fields(endpoint = %self.instance.endpoint()))]
    async fn stop_group_replication(&mut self) -> ClientResult<()> {
        let endpoint = self.instance.endpoint();
        self.conn
            .query_drop("STOP GROUP_REPLICATION")
            .await
            .map_err(|e| map_error(&endpoint, e))
    }

    async fn restart_server(&mut self) -> ClientResult<()> {
        let endpoint = self.instance.endpoint();
        self.conn
            .query_drop("RESTART")
            .await
            .map_err(|e| map_error(&endpoint, e))
    }

    #[instrument(skip(self), fields(endpoint = %self.instance.endpoint()))]
    async fn force_members(&mut self, local_addresses: &[String]) -> ClientResult<()> {
        let endpoint = self.instance.endpoint();
        let list = local_addresses.join(",");
        self.conn
            .query_drop(format!(
                "SET GLOBAL group_replication_force_members = {}",
                quote_value(&list)
            ))
            .await
            .map_err(|e| map_error(&endpoint, e))?;
        self.conn
            .query_drop("SET GLOBAL group_replication_force_members = ''")
            .await
            .map_err(|e| map_error(&endpoint, e))
    }

    #[instrument(skip(self), fields(endpoint = %self.instance.endpoint()))]
    async fn switch_to_multi_primary(&mut self) -> ClientResult<()> {
        let endpoint = self.instance.endpoint();
        self.conn
            .query_drop("SELECT group_replication_switch_to_multi_primary_mode()")
            .await
            .map_err(|e| map_error(&endpoint, e))
    }

    #[instrument(skip(self), fields(endpoint = %self.instance.endpoint()))]
    async fn switch_to_single_primary(&mut self, primary_uuid: Option<&str>) -> ClientResult<()> {
        let endpoint = self.instance.endpoint();
        let result = match primary_uuid {
            Some(uuid) => {
                self.conn
                    .exec_drop(
                        "SELECT group_replication_switch_to_single_primary_mode(?)",
                        (uuid,),
                    )
                    .await
            }
            None => {
                self.conn
                    .query_drop("SELECT group_replication_switch_to_single_primary_mode()")
                    .await
            }
        };
        result.map_err(|e| map_error(&endpoint, e))
    }

    #[instrument(skip(self), fields(endpoint = %self.instance.endpoint()))]
    async fn set_as_primary(&mut self, uuid: &str) -> ClientResult<()> {
        let endpoint = self.instance.endpoint();
        self.conn
            .exec_drop("SELECT group_replication_set_as_primary(?)", (uuid,))
            .await
            .map_err(|e| map_error(&endpoint, e))
    }

    async fn gtid_executed(&mut self) -> ClientResult<GtidSet> {
        let value: Option<String> = self
            .conn
            .query_first("SELECT @@GLOBAL.gtid_executed")
            .await
            .map_err(self.err())?;
        Ok(value.unwrap_or_default().replace('\n', "").parse()?)
    }

    #[instrument(skip(self, gtid_set), fields(endpoint = %self.instance.endpoint()))]
    async fn wait_for_gtid_set(
        &mut self,
        gtid_set: &GtidSet,
        timeout: Duration,
    ) -> ClientResult<bool> {
        let timed_out: Option<i64> = self
            .conn
            .exec_first(
                "SELECT WAIT_FOR_EXECUTED_GTID_SET(?, ?)",
                (gtid_set.to_string(), timeout.as_secs()),
            )
            .await
            .map_err(self.err())?;
        Ok(timed_out == Some(0))
    }

    async fn replication_channels(&mut self) -> ClientResult<Vec<ReplicationChannel>> {
        let rows: Vec<(String, String)> = self
            .conn
            .query(
                "SELECT CHANNEL_NAME, SERVICE_STATE \
                 FROM performance_schema.replication_connection_status \
                 WHERE CHANNEL_NAME NOT IN ('group_replication_applier', 'group_replication_recovery')",
            )
            .await
            .map_err(self.err())?;
        Ok(rows
            .into_iter()
            .map(|(name, state)| ReplicationChannel {
                name,
                running: state == "ON",
            })
            .collect())
    }

    async fn metadata_schema_exists(&mut self) -> ClientResult<bool> {
        let count: Option<i64> = self
            .conn
            .exec_first(
                "SELECT COUNT(*) FROM information_schema.schemata WHERE schema_name = ?",
                (METADATA_SCHEMA,),
            )
            .await
            .map_err(self.err())?;
        Ok(count.unwrap_or(0) > 0)
    }

    #[instrument(skip(self), fields(endpoint = %self.instance.endpoint()))]
    async fn load_metadata(&mut self) -> ClientResult<Option<MetadataSnapshot>> {
        if !self.metadata_schema_exists().await? {
            return Ok(None);
        }
        let endpoint = self.instance.endpoint();
        let metadata_err = |message: String| ClientError::Metadata {
            endpoint: endpoint.clone(),
            message,
        };

        let clusters: Vec<(u32, String, Option<String>, String, String, i64)> = self
            .conn
            .query(
                "SELECT cluster_id, cluster_name, description, group_name, ssl_mode, disable_clone \
                 FROM mysql_innodb_cluster_metadata.clusters ORDER BY cluster_id",
            )
            .await
            .map_err(|e| metadata_err(e.to_string()))?;
        let replicasets: Vec<(u32, u32, String, String)> = self
            .conn
            .query(
                "SELECT replicaset_id, cluster_id, replicaset_name, topology_type \
                 FROM mysql_innodb_cluster_metadata.replicasets",
            )
            .await
            .map_err(|e| metadata_err(e.to_string()))?;
        let instances: Vec<(u32, u32, String, String, String, String, String)> = self
            .conn
            .query(
                "SELECT instance_id, replicaset_id, mysql_server_uuid, instance_name, label, role, local_address \
                 FROM mysql_innodb_cluster_metadata.instances ORDER BY instance_id",
            )
            .await
            .map_err(|e| metadata_err(e.to_string()))?;

        let mut snapshot = MetadataSnapshot::default();
        for (cluster_id, name, description, group_name, ssl_mode, disable_clone) in clusters {
            let Some((rs_id, _, rs_name, topology)) =
                replicasets.iter().find(|(_, c, _, _)| *c == cluster_id)
            else {
                return Err(metadata_err(format!(
                    "cluster '{name}' has no default replica set"
                )));
            };
            let members = instances
                .iter()
                .filter(|row| row.1 == *rs_id)
                .map(|(id, _, uuid, endpoint, label, role, local)| InstanceRecord {
                    id: *id,
                    uuid: uuid.clone(),
                    endpoint: endpoint.clone(),
                    label: label.clone(),
                    role: role.clone(),
                    local_address: local.clone(),
                })
                .collect();
            snapshot.clusters.push(ClusterRecord {
                id: cluster_id,
                name,
                description: description.unwrap_or_default(),
                group_name,
                ssl_mode,
                disable_clone: disable_clone != 0,
                default_replica_set: ReplicaSetRecord {
                    id: *rs_id,
                    name: rs_name.clone(),
                    topology_type: topology.parse().map_err(metadata_err)?,
                    instances: members,
                },
            });
        }
        Ok(Some(snapshot))
    }

    #[instrument(skip(self, snapshot), fields(endpoint = %self.instance.endpoint()))]
    async fn store_metadata(&mut self, snapshot: &MetadataSnapshot) -> ClientResult<()> {
        let endpoint = self.instance.endpoint();
        let metadata_err = |e: mysql_async::Error| ClientError::Metadata {
            endpoint: endpoint.clone(),
            message: e.to_string(),
        };

        // DDL commits implicitly, so it runs ahead of the transaction.
        for ddl in METADATA_DDL {
            self.conn.query_drop(*ddl).await.map_err(metadata_err)?;
        }

        let mut tx = self
            .conn
            .start_transaction(TxOpts::default())
            .await
            .map_err(metadata_err)?;
        tx.query_drop("DELETE FROM mysql_innodb_cluster_metadata.instances")
            .await
            .map_err(metadata_err)?;
        tx.query_drop("DELETE FROM mysql_innodb_cluster_metadata.replicasets")
            .await
            .map_err(metadata_err)?;
        tx.query_drop("DELETE FROM mysql_innodb_cluster_metadata.clusters")
            .await
            .map_err(metadata_err)?;

        for cluster in &snapshot.clusters {
            tx.exec_drop(
                "INSERT INTO mysql_innodb_cluster_metadata.clusters \
                 (cluster_id, cluster_name, description, group_name, ssl_mode, disable_clone) \
                 VALUES (?, ?, ?, ?, ?, ?)",
                (
                    cluster.id,
                    cluster.name.as_str(),
                    cluster.description.as_str(),
                    cluster.group_name.as_str(),
                    cluster.ssl_mode.as_str(),
                    cluster.disable_clone,
                ),
            )
            .await
            .map_err(metadata_err)?;

            let rs = &cluster.default_replica_set;
            tx.exec_drop(
                "INSERT INTO mysql_innodb_cluster_metadata.replicasets \
                 (replicaset_id, cluster_id, replicaset_name, topology_type) VALUES (?, ?, ?, ?)",
                (rs.id, cluster.id, rs.name.as_str(), rs.topology_type.as_str()),
            )
            .await
            .map_err(metadata_err)?;

            for instance in &rs.instances {
                tx.exec_drop(
                    "INSERT INTO mysql_innodb_cluster_metadata.instances \
                     (instance_id, replicaset_id, mysql_server_uuid, instance_name, label, role, local_address) \
                     VALUES (?, ?, ?, ?, ?, ?, ?)",
                    (
                        instance.id,
                        rs.id,
                        instance.uuid.as_str(),
                        instance.endpoint.as_str(),
                        instance.label.as_str(),
                        instance.role.as_str(),
                        instance.local_address.as_str(),
                    ),
                )
                .await
                .map_err(metadata_err)?;
            }
        }
        tx.commit().await.map_err(metadata_err)
    }

    #[instrument(skip(self), fields(endpoint = %self.instance.endpoint()))]
    async fn drop_metadata_schema(&mut self) -> ClientResult<()> {
        let endpoint = self.instance.endpoint();
        self.conn
            .query_drop(format!("DROP SCHEMA IF EXISTS {METADATA_SCHEMA}"))
            .await
            .map_err(|e| map_error(&endpoint, e))
    }
}

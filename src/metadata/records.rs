//! Typed records of the metadata schema.
//!
//! The schema holds normalized `clusters`, `replicasets` and `instances`
//! tables. A [`MetadataSnapshot`] is the full content of those tables; the
//! store always reads and writes whole snapshots inside one transaction.

use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Fixed name of the metadata schema.
pub const METADATA_SCHEMA: &str = "mysql_innodb_cluster_metadata";

/// Name of the one replica set every cluster owns.
pub const DEFAULT_REPLICA_SET: &str = "default";

/// Role recorded for every group member.
pub const ROLE_HA: &str = "HA";

/// Topology of the default replica set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TopologyType {
    /// Stored as `pm`.
    #[serde(rename = "pm")]
    SinglePrimary,
    /// Stored as `mm`.
    #[serde(rename = "mm")]
    MultiPrimary,
}

impl TopologyType {
    pub fn as_str(&self) -> &'static str {
        match self {
            TopologyType::SinglePrimary => "pm",
            TopologyType::MultiPrimary => "mm",
        }
    }

    pub fn from_single_primary(single_primary: bool) -> Self {
        if single_primary {
            TopologyType::SinglePrimary
        } else {
            TopologyType::MultiPrimary
        }
    }

    pub fn is_single_primary(&self) -> bool {
        matches!(self, TopologyType::SinglePrimary)
    }
}

impl FromStr for TopologyType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pm" => Ok(TopologyType::SinglePrimary),
            "mm" => Ok(TopologyType::MultiPrimary),
            other => Err(format!("Unknown topology type: {other}")),
        }
    }
}

impl std::fmt::Display for TopologyType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TopologyType::SinglePrimary => write!(f, "Single-Primary"),
            TopologyType::MultiPrimary => write!(f, "Multi-Primary"),
        }
    }
}

/// A recorded group member.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceRecord {
    pub id: u32,
    /// Stable identity, the server's `server_uuid`.
    pub uuid: String,
    /// `host:port` of the classic protocol endpoint.
    pub endpoint: String,
    pub label: String,
    pub role: String,
    /// `group_replication_local_address` of the member.
    pub local_address: String,
}

/// The default replica set of a cluster.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicaSetRecord {
    pub id: u32,
    pub name: String,
    pub topology_type: TopologyType,
    /// Members in insertion order.
    pub instances: Vec<InstanceRecord>,
}

/// A recorded cluster.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterRecord {
    pub id: u32,
    pub name: String,
    pub description: String,
    /// `group_replication_group_name` of the group backing the cluster.
    pub group_name: String,
    /// `group_replication_ssl_mode` used by every member.
    pub ssl_mode: String,
    pub disable_clone: bool,
    pub default_replica_set: ReplicaSetRecord,
}

impl ClusterRecord {
    pub fn instances(&self) -> &[InstanceRecord] {
        &self.default_replica_set.instances
    }

    pub fn find_by_endpoint(&self, endpoint: &str) -> Option<&InstanceRecord> {
        self.instances().iter().find(|i| i.endpoint == endpoint)
    }

    pub fn find_by_uuid(&self, uuid: &str) -> Option<&InstanceRecord> {
        self.instances().iter().find(|i| i.uuid == uuid)
    }

    pub fn find_by_label(&self, label: &str) -> Option<&InstanceRecord> {
        self.instances().iter().find(|i| i.label == label)
    }

    pub fn topology_type(&self) -> TopologyType {
        self.default_replica_set.topology_type
    }
}

/// Full content of the metadata schema.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetadataSnapshot {
    pub clusters: Vec<ClusterRecord>,
}

impl MetadataSnapshot {
    pub fn cluster(&self, name: &str) -> Option<&ClusterRecord> {
        self.clusters.iter().find(|c| c.name == name)
    }

    pub fn cluster_mut(&mut self, name: &str) -> Option<&mut ClusterRecord> {
        self.clusters.iter_mut().find(|c| c.name == name)
    }

    /// The cluster that records `uuid` as a member.
    pub fn cluster_of_instance(&self, uuid: &str) -> Option<&ClusterRecord> {
        self.clusters.iter().find(|c| c.find_by_uuid(uuid).is_some())
    }

    /// The cluster backed by the replication group `group_name`.
    pub fn cluster_of_group(&self, group_name: &str) -> Option<&ClusterRecord> {
        self.clusters
            .iter()
            .find(|c| c.group_name.eq_ignore_ascii_case(group_name))
    }

    /// Next free instance id across all clusters.
    pub fn next_instance_id(&self) -> u32 {
        self.clusters
            .iter()
            .flat_map(|c| c.instances())
            .map(|i| i.id)
            .max()
            .unwrap_or(0)
            + 1
    }

    pub fn next_cluster_id(&self) -> u32 {
        self.clusters.iter().map(|c| c.id).max().unwrap_or(0) + 1
    }
}

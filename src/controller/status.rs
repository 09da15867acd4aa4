//! Status reporter.
//!
//! Projects the reconciled group snapshot and the metadata into the
//! documents returned by `describe()`, `status()` and `options()`.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::client::InstanceDef;
use crate::controller::options::{REPORTED_MEMBER_OPTIONS, lookup};
use crate::group::{GroupSnapshot, MemberView, QuorumVerdict};
use crate::metadata::{ClusterRecord, ROLE_HA};

/// Document returned by `describe()`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DescribeDoc {
    pub cluster_name: String,
    pub default_replica_set: DescribeReplicaSet,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DescribeReplicaSet {
    pub name: String,
    pub topology: Vec<DescribeMember>,
    pub topology_mode: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DescribeMember {
    pub label: String,
    pub address: String,
    pub role: String,
}

/// Document returned by `status()`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusDoc {
    pub cluster_name: String,
    pub default_replica_set: StatusReplicaSet,
    pub group_information_source_member: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusReplicaSet {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub primary: Option<String>,
    pub ssl: String,
    pub status: QuorumVerdict,
    pub status_text: String,
    /// Keyed by label.
    pub topology: BTreeMap<String, StatusMember>,
    pub topology_mode: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusMember {
    pub address: String,
    pub mode: String,
    pub read_replicas: BTreeMap<String, serde_json::Value>,
    pub role: String,
    pub status: String,
}

/// Document returned by `options()`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OptionsDoc {
    pub cluster_name: String,
    pub default_replica_set: OptionsReplicaSet,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OptionsReplicaSet {
    pub name: String,
    pub global_options: Vec<OptionEntry>,
    /// Keyed by label.
    pub topology: BTreeMap<String, MemberOptions>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OptionEntry {
    pub option: String,
    pub value: String,
    pub variable: String,
}

/// Options of one member, or why they could not be read.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MemberOptions {
    Unreachable {
        #[serde(rename = "shellConnectError")]
        shell_connect_error: String,
    },
    Options(Vec<OptionEntry>),
}

/// `R/W`, `R/O` or `n/a` for a member.
pub fn member_mode(member: &MemberView, single_primary: bool) -> &'static str {
    if !member.is_online() {
        "n/a"
    } else if !single_primary || member.is_primary() {
        "R/W"
    } else {
        "R/O"
    }
}

fn topology_mode(cluster: &ClusterRecord) -> String {
    cluster.topology_type().to_string()
}

pub fn describe(cluster: &ClusterRecord) -> DescribeDoc {
    DescribeDoc {
        cluster_name: cluster.name.clone(),
        default_replica_set: DescribeReplicaSet {
            name: cluster.default_replica_set.name.clone(),
            topology: cluster
                .instances()
                .iter()
                .map(|i| DescribeMember {
                    label: i.label.clone(),
                    address: i.endpoint.clone(),
                    role: i.role.clone(),
                })
                .collect(),
            topology_mode: topology_mode(cluster),
        },
    }
}

pub fn status(cluster: &ClusterRecord, snapshot: &GroupSnapshot, anchor: &InstanceDef) -> StatusDoc {
    let topology = snapshot
        .recorded()
        .map(|m| {
            (
                m.display_label().to_string(),
                StatusMember {
                    address: m.endpoint.clone(),
                    mode: member_mode(m, snapshot.single_primary).to_string(),
                    read_replicas: BTreeMap::new(),
                    role: ROLE_HA.to_string(),
                    status: m.display_status(),
                },
            )
        })
        .collect();

    StatusDoc {
        cluster_name: cluster.name.clone(),
        default_replica_set: StatusReplicaSet {
            name: cluster.default_replica_set.name.clone(),
            primary: snapshot.primary().map(|p| p.endpoint.clone()),
            ssl: cluster.ssl_mode.clone(),
            status: snapshot.verdict,
            status_text: snapshot.status_text(),
            topology,
            topology_mode: topology_mode(cluster),
        },
        group_information_source_member: anchor.display_uri(),
    }
}

/// Option entries of one member from its `group_replication_*` variables.
///
/// With `all` every variable is listed under its own name.
pub fn member_options(variables: &BTreeMap<String, String>, all: bool) -> Vec<OptionEntry> {
    if all {
        return variables
            .iter()
            .map(|(variable, value)| OptionEntry {
                option: variable.clone(),
                value: value.clone(),
                variable: variable.clone(),
            })
            .collect();
    }
    REPORTED_MEMBER_OPTIONS
        .iter()
        .filter_map(|name| {
            let variable = lookup(name)?.variable?;
            Some(OptionEntry {
                option: (*name).to_string(),
                value: variables.get(variable).cloned().unwrap_or_default(),
                variable: variable.to_string(),
            })
        })
        .collect()
}

pub fn options(
    cluster: &ClusterRecord,
    members: Vec<(String, MemberOptions)>,
) -> OptionsDoc {
    let global_options = vec![
        OptionEntry {
            option: "groupName".to_string(),
            value: cluster.group_name.clone(),
            variable: "group_replication_group_name".to_string(),
        },
        OptionEntry {
            option: "memberSslMode".to_string(),
            value: cluster.ssl_mode.clone(),
            variable: "group_replication_ssl_mode".to_string(),
        },
        OptionEntry {
            option: "disableClone".to_string(),
            value: cluster.disable_clone.to_string(),
            variable: String::new(),
        },
    ];
    OptionsDoc {
        cluster_name: cluster.name.clone(),
        default_replica_set: OptionsReplicaSet {
            name: cluster.default_replica_set.name.clone(),
            global_options,
            topology: members.into_iter().collect(),
        },
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::indexing_slicing)]
mod tests {
    use super::*;
    use crate::client::{MemberRole, MemberState};
    use crate::metadata::{DEFAULT_REPLICA_SET, InstanceRecord, ReplicaSetRecord, TopologyType};

    fn cluster() -> ClusterRecord {
        let record = |port: u16| InstanceRecord {
            id: u32::from(port),
            uuid: format!("u{port}"),
            endpoint: format!("localhost:{port}"),
            label: format!("localhost:{port}"),
            role: ROLE_HA.to_string(),
            local_address: format!("localhost:{port}1"),
        };
        ClusterRecord {
            id: 1,
            name: "dev".to_string(),
            description: String::new(),
            group_name: "g".to_string(),
            ssl_mode: "REQUIRED".to_string(),
            disable_clone: false,
            default_replica_set: ReplicaSetRecord {
                id: 1,
                name: DEFAULT_REPLICA_SET.to_string(),
                topology_type: TopologyType::SinglePrimary,
                instances: vec![record(3310), record(3320)],
            },
        }
    }

    fn snapshot() -> GroupSnapshot {
        let view = |port: u16, live: Option<MemberState>, role| MemberView {
            endpoint: format!("localhost:{port}"),
            uuid: format!("u{port}"),
            label: Some(format!("localhost:{port}")),
            recorded: true,
            live_state: live,
            role: live.map(|_| role),
        };
        GroupSnapshot {
            anchor: "localhost:3310".to_string(),
            anchor_uuid: "u3310".to_string(),
            members: vec![
                view(3310, Some(MemberState::Online), MemberRole::Primary),
                view(3320, None, MemberRole::Secondary),
            ],
            single_primary: true,
            verdict: QuorumVerdict::OkNoTolerance,
        }
    }

    #[test]
    fn test_status_document() {
        let anchor: InstanceDef = "root@localhost:3310".parse().unwrap();
        let doc = status(&cluster(), &snapshot(), &anchor);
        let json = serde_json::to_value(&doc).unwrap();

        assert_eq!(json["clusterName"], "dev");
        let rs = &json["defaultReplicaSet"];
        assert_eq!(rs["primary"], "localhost:3310");
        assert_eq!(rs["status"], "OK_NO_TOLERANCE");
        assert_eq!(
            rs["statusText"],
            "Cluster is NOT tolerant to any failures. 1 member is not active"
        );
        assert_eq!(rs["topology"]["localhost:3310"]["mode"], "R/W");
        assert_eq!(rs["topology"]["localhost:3320"]["mode"], "n/a");
        assert_eq!(rs["topology"]["localhost:3320"]["status"], "(MISSING)");
        assert_eq!(json["groupInformationSourceMember"], "mysql://root@localhost:3310");
    }

    #[test]
    fn test_multi_primary_has_no_primary_key() {
        let mut snap = snapshot();
        snap.single_primary = false;
        let anchor: InstanceDef = "root@localhost:3310".parse().unwrap();
        let json = serde_json::to_value(status(&cluster(), &snap, &anchor)).unwrap();
        assert!(json["defaultReplicaSet"].get("primary").is_none());
    }

    #[test]
    fn test_describe_lists_metadata_members() {
        let doc = describe(&cluster());
        assert_eq!(doc.default_replica_set.topology.len(), 2);
        assert_eq!(doc.default_replica_set.topology[1].address, "localhost:3320");
        assert_eq!(doc.default_replica_set.topology_mode, "Single-Primary");
    }

    #[test]
    fn test_options_unreachable_member() {
        let mut vars = BTreeMap::new();
        vars.insert("group_replication_member_weight".to_string(), "50".to_string());
        let doc = options(
            &cluster(),
            vec![
                ("localhost:3310".to_string(), MemberOptions::Options(member_options(&vars, false))),
                (
                    "localhost:3320".to_string(),
                    MemberOptions::Unreachable {
                        shell_connect_error: "Can't connect".to_string(),
                    },
                ),
            ],
        );
        let json = serde_json::to_value(&doc).unwrap();
        let topo = &json["defaultReplicaSet"]["topology"];
        assert_eq!(topo["localhost:3320"]["shellConnectError"], "Can't connect");
        let weight = topo["localhost:3310"]
            .as_array()
            .unwrap()
            .iter()
            .find(|e| e["option"] == "memberWeight")
            .unwrap();
        assert_eq!(weight["value"], "50");
        assert_eq!(json["defaultReplicaSet"]["globalOptions"][0]["option"], "groupName");
    }
}

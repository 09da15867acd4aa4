//! Precondition gate.
//!
//! Decides, before any mutation starts, whether an operation may run through
//! a session in a given mode and with a given quorum verdict.

use std::fmt;

use crate::controller::error::Error;
use crate::controller::session_mode::{SessionContext, SessionMode};
use crate::group::QuorumVerdict;
use crate::metadata::METADATA_SCHEMA;

/// Operations subject to the gate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    CreateCluster,
    GetCluster,
    DropMetadataSchema,
    RebootClusterFromCompleteOutage,
    CheckInstanceConfiguration,
    ConfigureInstance,
    AddInstance,
    RemoveInstance,
    RejoinInstance,
    ForceQuorumUsingPartitionOf,
    Dissolve,
    Rescan,
    CheckInstanceState,
    Describe,
    Status,
    Options,
    SetOption,
    SetInstanceOption,
    SwitchToSinglePrimaryMode,
    SwitchToMultiPrimaryMode,
    SetPrimaryInstance,
}

impl Operation {
    /// Read-only introspection keeps working without quorum.
    pub fn is_read_only(&self) -> bool {
        matches!(
            self,
            Operation::GetCluster
                | Operation::Describe
                | Operation::Status
                | Operation::Options
                | Operation::CheckInstanceConfiguration
        )
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Operation::CreateCluster => "Dba.createCluster",
            Operation::GetCluster => "Dba.getCluster",
            Operation::DropMetadataSchema => "Dba.dropMetadataSchema",
            Operation::RebootClusterFromCompleteOutage => "Dba.rebootClusterFromCompleteOutage",
            Operation::CheckInstanceConfiguration => "Dba.checkInstanceConfiguration",
            Operation::ConfigureInstance => "Dba.configureInstance",
            Operation::AddInstance => "Cluster.addInstance",
            Operation::RemoveInstance => "Cluster.removeInstance",
            Operation::RejoinInstance => "Cluster.rejoinInstance",
            Operation::ForceQuorumUsingPartitionOf => "Cluster.forceQuorumUsingPartitionOf",
            Operation::Dissolve => "Cluster.dissolve",
            Operation::Rescan => "Cluster.rescan",
            Operation::CheckInstanceState => "Cluster.checkInstanceState",
            Operation::Describe => "Cluster.describe",
            Operation::Status => "Cluster.status",
            Operation::Options => "Cluster.options",
            Operation::SetOption => "Cluster.setOption",
            Operation::SetInstanceOption => "Cluster.setInstanceOption",
            Operation::SwitchToSinglePrimaryMode => "Cluster.switchToSinglePrimaryMode",
            Operation::SwitchToMultiPrimaryMode => "Cluster.switchToMultiPrimaryMode",
            Operation::SetPrimaryInstance => "Cluster.setPrimaryInstance",
        };
        write!(f, "{name}")
    }
}

/// Caller flags the gate takes into account.
#[derive(Debug, Clone, Copy, Default)]
pub struct GateOptions {
    pub adopt_from_gr: bool,
    pub force: bool,
}

/// Outcome of a gate check.
#[derive(Debug)]
pub enum Decision {
    Allowed,
    /// Allowed, but the caller must surface the warning.
    AllowedWithWarning(String),
    Denied(Error),
}

impl Decision {
    pub fn is_allowed(&self) -> bool {
        !matches!(self, Decision::Denied(_))
    }

    /// The warning to surface, or the denial as an error.
    pub fn into_result(self) -> Result<Option<String>, Error> {
        match self {
            Decision::Allowed => Ok(None),
            Decision::AllowedWithWarning(warning) => Ok(Some(warning)),
            Decision::Denied(error) => Err(error),
        }
    }
}

pub const NO_QUORUM: &str = "There is no quorum to perform the operation";
const STANDALONE: &str = "This function is not available through a session to a standalone instance";
const UNMANAGED: &str = "This function is not available through a session to an instance belonging to an unmanaged replication group";
const STANDALONE_WITH_METADATA: &str = "This function is not available through a session to a standalone instance (metadata exists, instance belongs to that metadata, but GR is not active)";

/// Check `operation` against the classified session.
pub fn check(operation: Operation, ctx: &SessionContext, options: &GateOptions) -> Decision {
    use Operation as Op;
    use SessionMode as M;

    let endpoint = ctx.endpoint.as_str();
    match (operation, ctx.mode) {
        // === Instance configuration works everywhere ===
        (Op::CheckInstanceConfiguration | Op::ConfigureInstance, _) => Decision::Allowed,

        // === createCluster ===
        (Op::CreateCluster, M::Standalone) if options.adopt_from_gr => Decision::Denied(
            Error::Argument(
                "The adoptFromGR option is set to true, but there is no replication group to adopt"
                    .to_string(),
            ),
        ),
        (Op::CreateCluster, M::Standalone) => Decision::Allowed,
        (Op::CreateCluster, M::UnmanagedGroup) if options.adopt_from_gr => Decision::Allowed,
        (Op::CreateCluster, M::UnmanagedGroup) => Decision::Denied(Error::Argument(
            "Creating a cluster on an unmanaged replication group requires adoptFromGR option to be true"
                .to_string(),
        )),
        (Op::CreateCluster, M::ManagedCompleteOutage) => Decision::Denied(Error::Runtime(format!(
            "Unable to create cluster. The instance '{endpoint}' has a populated Metadata schema \
             and belongs to that Metadata. Use either dba.dropMetadataSchema() to drop the schema, \
             or dba.rebootClusterFromCompleteOutage() to reboot the cluster from complete outage."
        ))),
        (Op::CreateCluster, M::ManagedHealthy | M::ManagedQuorumLost) => {
            Decision::Denied(Error::Runtime(format!(
                "Unable to create cluster. The instance '{endpoint}' already belongs to an InnoDB \
                 cluster. Use <Dba>.getCluster() to access it."
            )))
        }

        // === rebootClusterFromCompleteOutage ===
        (Op::RebootClusterFromCompleteOutage, M::ManagedCompleteOutage) => Decision::Allowed,
        (Op::RebootClusterFromCompleteOutage, M::ManagedHealthy | M::ManagedQuorumLost) => {
            Decision::Denied(Error::Runtime(format!(
                "The MySQL instance '{endpoint}' belongs to an InnoDB Cluster and is reachable. \
                 Please use <Cluster>.forceQuorumUsingPartitionOf() to restore from the quorum loss."
            )))
        }
        (Op::RebootClusterFromCompleteOutage, M::Standalone | M::UnmanagedGroup) => {
            Decision::Denied(Error::Metadata(format!("Unknown database '{METADATA_SCHEMA}'")))
        }

        // === forceQuorumUsingPartitionOf ===
        (Op::ForceQuorumUsingPartitionOf, M::ManagedHealthy | M::ManagedQuorumLost) => {
            Decision::Allowed
        }
        (Op::ForceQuorumUsingPartitionOf, _) => Decision::Denied(Error::Runtime(format!(
            "The instance '{endpoint}' cannot be used to restore the cluster as it is not an \
             active member of replication group."
        ))),

        // === dropMetadataSchema ===
        (Op::DropMetadataSchema, M::Standalone) => {
            Decision::Denied(Error::Runtime(STANDALONE.to_string()))
        }
        (Op::DropMetadataSchema, M::UnmanagedGroup) => {
            Decision::Denied(Error::Runtime(UNMANAGED.to_string()))
        }
        (Op::DropMetadataSchema, _) if !options.force => Decision::Denied(Error::Argument(
            "No operation executed, use the 'force' option".to_string(),
        )),
        (Op::DropMetadataSchema, M::ManagedQuorumLost) => {
            Decision::Denied(Error::Runtime(NO_QUORUM.to_string()))
        }
        (Op::DropMetadataSchema, _) => Decision::Allowed,

        // === Cluster handle operations ===
        (_, M::Standalone) => Decision::Denied(Error::Runtime(STANDALONE.to_string())),
        (_, M::UnmanagedGroup) => Decision::Denied(Error::Runtime(UNMANAGED.to_string())),
        (_, M::ManagedCompleteOutage) => {
            Decision::Denied(Error::Runtime(STANDALONE_WITH_METADATA.to_string()))
        }
        (op, M::ManagedQuorumLost) if op.is_read_only() => {
            match ctx.snapshot.no_quorum_warning() {
                Some(warning) => Decision::AllowedWithWarning(warning),
                None => Decision::Allowed,
            }
        }
        (_, M::ManagedQuorumLost) => Decision::Denied(Error::Runtime(NO_QUORUM.to_string())),
        (_, M::ManagedHealthy) if ctx.verdict() == QuorumVerdict::Unknown => {
            Decision::Denied(Error::Runtime(NO_QUORUM.to_string()))
        }
        (_, M::ManagedHealthy) => Decision::Allowed,
    }
}

#[cfg(test)]
#[allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::indexing_slicing,
    clippy::panic
)]
mod tests {
    use super::*;
    use crate::client::{MemberRole, MemberState, ServerInfo, ServerVersion};
    use crate::controller::error::ErrorKind;
    use crate::group::{GroupSnapshot, MemberView};

    fn member(endpoint: &str, state: Option<MemberState>) -> MemberView {
        MemberView {
            endpoint: endpoint.to_string(),
            uuid: endpoint.to_string(),
            label: Some(endpoint.to_string()),
            recorded: true,
            live_state: state,
            role: state.map(|_| MemberRole::Secondary),
        }
    }

    fn ctx(mode: SessionMode, verdict: QuorumVerdict) -> SessionContext {
        SessionContext {
            mode,
            endpoint: "localhost:3310".to_string(),
            server: ServerInfo {
                uuid: "a".to_string(),
                server_id: 1,
                version: ServerVersion::new(8, 0, 18),
                super_read_only: false,
                group_name: String::new(),
                single_primary_mode: true,
            },
            metadata: None,
            cluster: None,
            snapshot: GroupSnapshot {
                anchor: "localhost:3310".to_string(),
                anchor_uuid: "a".to_string(),
                members: vec![
                    member("localhost:3310", Some(MemberState::Online)),
                    member("localhost:3320", Some(MemberState::Unreachable)),
                    member("localhost:3330", Some(MemberState::Unreachable)),
                ],
                single_primary: true,
                verdict,
            },
        }
    }

    fn denied(decision: Decision) -> Error {
        match decision {
            Decision::Denied(e) => e,
            other => panic!("Expected denial, got {other:?}"),
        }
    }

    #[test]
    fn test_no_quorum_blocks_mutations() {
        let ctx = ctx(SessionMode::ManagedQuorumLost, QuorumVerdict::NoQuorum);
        for op in [
            Operation::AddInstance,
            Operation::RejoinInstance,
            Operation::RemoveInstance,
            Operation::SetOption,
            Operation::SetInstanceOption,
            Operation::Dissolve,
            Operation::Rescan,
            Operation::SwitchToMultiPrimaryMode,
        ] {
            let err = denied(check(op, &ctx, &GateOptions::default()));
            assert_eq!(err.to_string(), NO_QUORUM, "{op}");
        }
    }

    #[test]
    fn test_no_quorum_allows_force_quorum_and_reads() {
        let ctx = ctx(SessionMode::ManagedQuorumLost, QuorumVerdict::NoQuorum);
        assert!(matches!(
            check(Operation::ForceQuorumUsingPartitionOf, &ctx, &GateOptions::default()),
            Decision::Allowed
        ));
        match check(Operation::Status, &ctx, &GateOptions::default()) {
            Decision::AllowedWithWarning(w) => assert!(w.contains("2 out of 3 members")),
            other => panic!("Expected warning, got {other:?}"),
        }
    }

    #[test]
    fn test_create_cluster_matrix() {
        let gate = GateOptions::default();
        let adopt = GateOptions {
            adopt_from_gr: true,
            ..Default::default()
        };
        let standalone = ctx(SessionMode::Standalone, QuorumVerdict::Unknown);
        assert!(check(Operation::CreateCluster, &standalone, &gate).is_allowed());
        assert_eq!(
            denied(check(Operation::CreateCluster, &standalone, &adopt)).kind(),
            ErrorKind::ArgumentError
        );

        let unmanaged = ctx(SessionMode::UnmanagedGroup, QuorumVerdict::Ok);
        let err = denied(check(Operation::CreateCluster, &unmanaged, &gate));
        assert_eq!(err.kind(), ErrorKind::ArgumentError);
        assert!(err.to_string().contains("requires adoptFromGR"));
        assert!(check(Operation::CreateCluster, &unmanaged, &adopt).is_allowed());

        let managed = ctx(SessionMode::ManagedHealthy, QuorumVerdict::Ok);
        let err = denied(check(Operation::CreateCluster, &managed, &gate));
        assert!(err.to_string().contains("Use <Dba>.getCluster() to access it."));
    }

    #[test]
    fn test_get_cluster_mode_messages() {
        let gate = GateOptions::default();
        let err = denied(check(
            Operation::GetCluster,
            &ctx(SessionMode::Standalone, QuorumVerdict::Unknown),
            &gate,
        ));
        assert_eq!(err.to_string(), STANDALONE);
        let err = denied(check(
            Operation::GetCluster,
            &ctx(SessionMode::UnmanagedGroup, QuorumVerdict::Ok),
            &gate,
        ));
        assert_eq!(err.to_string(), UNMANAGED);
    }

    #[test]
    fn test_drop_metadata_requires_force() {
        let managed = ctx(SessionMode::ManagedHealthy, QuorumVerdict::Ok);
        let err = denied(check(Operation::DropMetadataSchema, &managed, &GateOptions::default()));
        assert_eq!(err.to_string(), "No operation executed, use the 'force' option");
        let force = GateOptions {
            force: true,
            ..Default::default()
        };
        assert!(check(Operation::DropMetadataSchema, &managed, &force).is_allowed());
        let err = denied(check(
            Operation::DropMetadataSchema,
            &ctx(SessionMode::Standalone, QuorumVerdict::Unknown),
            &force,
        ));
        assert_eq!(err.to_string(), STANDALONE);
    }

    #[test]
    fn test_reboot_only_on_outage() {
        let gate = GateOptions::default();
        assert!(check(
            Operation::RebootClusterFromCompleteOutage,
            &ctx(SessionMode::ManagedCompleteOutage, QuorumVerdict::Unknown),
            &gate
        )
        .is_allowed());
        let err = denied(check(
            Operation::RebootClusterFromCompleteOutage,
            &ctx(SessionMode::ManagedQuorumLost, QuorumVerdict::NoQuorum),
            &gate,
        ));
        assert!(err.to_string().contains("forceQuorumUsingPartitionOf"));
        let err = denied(check(
            Operation::RebootClusterFromCompleteOutage,
            &ctx(SessionMode::Standalone, QuorumVerdict::Unknown),
            &gate,
        ));
        assert_eq!(err.kind(), ErrorKind::MetadataError);
    }
}

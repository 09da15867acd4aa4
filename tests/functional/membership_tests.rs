//! Membership changes: add, remove, rejoin, dissolve and rescan.

use innodb_cluster_admin::client::{Sandbox, SandboxOptions};
use innodb_cluster_admin::controller::cluster::DISCONNECTED;
use innodb_cluster_admin::controller::{
    AddInstanceOptions, CreateClusterOptions, DissolveOptions, DropMetadataOptions, ErrorKind,
    InstanceSelection, OptionValue, RemoveInstanceOptions, RescanOptions, TransactionState,
    TransactionStateReason,
};
use innodb_cluster_admin::group::QuorumVerdict;

use crate::common::fixtures::{ClusterBuilder, dba, endpoint, instance};

// ============================================================================
// Add / Remove
// ============================================================================

#[tokio::test]
async fn test_add_remove_round_trip() {
    let (sandbox, mut cluster) = ClusterBuilder::new("dev", &[3310, 3320, 3330]).build().await;

    let status = cluster.status().await.unwrap().into_inner();
    assert_eq!(status.default_replica_set.status, QuorumVerdict::Ok);
    assert_eq!(status.default_replica_set.topology.len(), 3);
    assert_eq!(
        sandbox.var(3310, "group_replication_group_seeds").as_deref(),
        Some("localhost:33201,localhost:33301")
    );

    let report = cluster
        .remove_instance(&instance(3330), RemoveInstanceOptions::default())
        .await
        .unwrap();
    assert_eq!(
        report.notes.last().unwrap(),
        "The instance 'localhost:3330' was successfully removed from the cluster."
    );
    assert_eq!(sandbox.group_view(3310).len(), 2);
    assert_eq!(
        sandbox.var(3330, "group_replication_start_on_boot").as_deref(),
        Some("OFF")
    );
    // The leaving member received its own removal before it left.
    let left = sandbox.metadata(3330).unwrap();
    assert!(left.cluster("dev").unwrap().find_by_endpoint(&endpoint(3330)).is_none());

    let status = cluster.status().await.unwrap().into_inner();
    assert_eq!(status.default_replica_set.status, QuorumVerdict::OkNoTolerance);

    cluster
        .add_instance(&instance(3330), AddInstanceOptions::default())
        .await
        .unwrap();
    let status = cluster.status().await.unwrap().into_inner();
    assert_eq!(status.default_replica_set.status, QuorumVerdict::Ok);
}

#[tokio::test]
async fn test_add_rejects_invalid_options_before_connecting() {
    let (_sandbox, cluster) = ClusterBuilder::new("dev", &[3410]).build().await;

    let err = cluster
        .add_instance(
            &instance(3420),
            AddInstanceOptions {
                exit_state_action: Some("ABORT".into()),
                ..Default::default()
            },
        )
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ArgumentError);

    let err = cluster
        .add_instance(
            &instance(3420),
            AddInstanceOptions {
                member_weight: Some(OptionValue::Int(101)),
                ..Default::default()
            },
        )
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ArgumentError);
}

#[tokio::test]
async fn test_add_instance_with_errant_transactions() {
    let (sandbox, cluster) = ClusterBuilder::new("dev", &[3510]).build().await;
    sandbox.deploy(3520);
    sandbox.execute_local_transaction(3520);

    let err = cluster
        .add_instance(&instance(3520), AddInstanceOptions::default())
        .await
        .unwrap_err();
    assert!(err.to_string().contains("errant GTIDs"));
    assert_eq!(sandbox.group_view(3510).len(), 1);
}

#[tokio::test]
async fn test_remove_last_member_is_logic_error() {
    let (_sandbox, mut cluster) = ClusterBuilder::new("dev", &[3610]).build().await;
    let err = cluster
        .remove_instance(&instance(3610), RemoveInstanceOptions::default())
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::LogicError);
    assert!(err.to_string().contains("<Cluster>.dissolve()"));
}

#[tokio::test]
async fn test_remove_undoes_metadata_when_member_lags() {
    let (sandbox, mut cluster) = ClusterBuilder::new("dev", &[3710, 3720, 3730]).build().await;
    sandbox.set_apply_lag(3730, true);

    let err = cluster
        .remove_instance(&instance(3730), RemoveInstanceOptions::default())
        .await
        .unwrap_err();
    assert!(err.is_retryable());
    let metadata = sandbox.metadata(3710).unwrap();
    assert!(metadata.cluster("dev").unwrap().find_by_endpoint(&endpoint(3730)).is_some());
    assert_eq!(sandbox.group_view(3710).len(), 3);

    let report = cluster
        .remove_instance(
            &instance(3730),
            RemoveInstanceOptions {
                force: Some(true),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert!(!report.warnings.is_empty());
    assert_eq!(sandbox.group_view(3710).len(), 2);
}

#[tokio::test]
async fn test_force_remove_unreachable_member() {
    let (sandbox, mut cluster) = ClusterBuilder::new("dev", &[3810, 3820, 3830]).build().await;
    sandbox.kill(3830);

    let err = cluster
        .remove_instance(&instance(3830), RemoveInstanceOptions::default())
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::RuntimeError);
    assert!(err.to_string().contains("(MISSING)"));

    let report = cluster
        .remove_instance(
            &instance(3830),
            RemoveInstanceOptions {
                force: Some(true),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert!(report.has_warning("only be removed from the metadata"));
    let described = cluster.describe().await.unwrap().into_inner();
    assert_eq!(described.default_replica_set.topology.len(), 2);
}

// ============================================================================
// Rejoin
// ============================================================================

#[tokio::test]
async fn test_rejoin_after_restart() {
    let (sandbox, cluster) = ClusterBuilder::new("dev", &[3910, 3920, 3930]).build().await;
    sandbox.restart(3930);

    let status = cluster.status().await.unwrap().into_inner();
    assert_eq!(status.default_replica_set.status, QuorumVerdict::OkNoTolerance);
    assert_eq!(
        status.default_replica_set.topology[&endpoint(3930)].status,
        "(MISSING)"
    );

    cluster
        .rejoin_instance(&instance(3930), Default::default())
        .await
        .unwrap();
    let status = cluster.status().await.unwrap().into_inner();
    assert_eq!(status.default_replica_set.status, QuorumVerdict::Ok);

    let err = cluster
        .rejoin_instance(&instance(3930), Default::default())
        .await
        .unwrap_err();
    assert!(err.to_string().contains("active (ONLINE) member"));
}

#[tokio::test]
async fn test_rejoin_refuses_running_async_channel() {
    let (sandbox, cluster) = ClusterBuilder::new("dev", &[4010, 4020, 4030]).build().await;
    sandbox.restart(4030);
    sandbox.add_replication_channel(4030, "legacy", true);

    let err = cluster
        .rejoin_instance(&instance(4030), Default::default())
        .await
        .unwrap_err();
    assert!(err.to_string().contains("legacy"));
}

// ============================================================================
// Dissolve / Rescan
// ============================================================================

#[tokio::test]
async fn test_dissolve_disconnects_handle() {
    let (sandbox, mut cluster) = ClusterBuilder::new("dev", &[4110, 4120, 4130]).build().await;
    sandbox.kill(4130);

    let err = cluster.dissolve(DissolveOptions::default()).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::RuntimeError);

    cluster
        .dissolve(DissolveOptions { force: Some(true) })
        .await
        .unwrap();
    assert!(sandbox.metadata(4110).is_none());
    assert!(sandbox.group_view(4110).is_empty());
    assert!(!cluster.is_connected());

    let err = cluster.status().await.unwrap_err();
    assert_eq!(err.to_string(), DISCONNECTED);
}

#[tokio::test]
async fn test_rescan_repairs_failed_metadata_write() {
    let (sandbox, cluster) = ClusterBuilder::new("dev", &[4210]).build().await;
    sandbox.deploy(4220);
    sandbox.fail_next_metadata_write(4210);

    let err = cluster
        .add_instance(&instance(4220), AddInstanceOptions::default())
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::MetadataError);
    assert!(err.to_string().contains("rescan()"));
    assert_eq!(sandbox.group_view(4210).len(), 2);

    let scanned = cluster.rescan(RescanOptions::default()).await.unwrap();
    assert_eq!(scanned.value.newly_discovered_instances.len(), 1);
    assert!(scanned.report.has_warning("'addInstances'"));

    let repaired = cluster
        .rescan(RescanOptions {
            add_instances: Some(InstanceSelection::auto()),
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(
        repaired.report.notes,
        vec!["Adding instance to metadata: 'localhost:4220'"]
    );
    let described = cluster.describe().await.unwrap().into_inner();
    assert_eq!(described.default_replica_set.topology.len(), 2);
}

// ============================================================================
// Create
// ============================================================================

#[tokio::test]
async fn test_create_on_super_read_only_instance() {
    let sandbox = Sandbox::new();
    sandbox.deploy_with(4310, SandboxOptions::default().super_read_only(true));
    let dba = dba(&sandbox);

    let err = dba
        .create_cluster(&instance(4310), "dev", CreateClusterOptions::default())
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::RuntimeError);
    assert!(err.to_string().contains("clearReadOnly"));

    let created = dba
        .create_cluster(
            &instance(4310),
            "dev",
            CreateClusterOptions {
                clear_read_only: Some(true),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert!(created.report.notes[0].contains("super_read_only"));
    assert!(sandbox.metadata(4310).is_some());
}

#[tokio::test]
async fn test_create_rejects_invalid_name() {
    let sandbox = Sandbox::new();
    sandbox.deploy(4410);
    let err = dba(&sandbox)
        .create_cluster(&instance(4410), "1bad-name", CreateClusterOptions::default())
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ArgumentError);
}

#[tokio::test]
async fn test_adopt_unmanaged_group() {
    let (sandbox, _old) = ClusterBuilder::new("old", &[4510, 4520]).build().await;
    let dba = dba(&sandbox);
    dba.drop_metadata_schema(
        &instance(4510),
        DropMetadataOptions {
            force: Some(true),
            ..Default::default()
        },
    )
    .await
    .unwrap();
    assert!(sandbox.metadata(4520).is_none());

    let err = dba
        .create_cluster(&instance(4510), "adopted", CreateClusterOptions::default())
        .await
        .unwrap_err();
    assert!(err.to_string().contains("adoptFromGR"));

    let adopted = dba
        .create_cluster(
            &instance(4510),
            "adopted",
            CreateClusterOptions {
                adopt_from_gr: Some(true),
                ..Default::default()
            },
        )
        .await
        .unwrap()
        .into_inner();
    let described = adopted.describe().await.unwrap().into_inner();
    assert_eq!(described.cluster_name, "adopted");
    assert_eq!(described.default_replica_set.topology.len(), 2);
    assert_eq!(described.default_replica_set.topology_mode, "Single-Primary");
}

// ============================================================================
// Instance transaction state
// ============================================================================

#[tokio::test]
async fn test_check_instance_state() {
    let (sandbox, mut cluster) = ClusterBuilder::new("dev", &[2610, 2620, 2630]).build().await;
    sandbox.deploy(2640);

    let state = cluster
        .check_instance_state(&instance(2640))
        .await
        .unwrap()
        .into_inner();
    assert_eq!(state.state, TransactionState::Ok);
    assert_eq!(state.reason, TransactionStateReason::New);

    // 2630 misses the transaction written by the rename.
    sandbox.kill(2630);
    cluster.set_option("clusterName", "prod").await.unwrap();
    sandbox.start(2630);
    let state = cluster
        .check_instance_state(&instance(2630))
        .await
        .unwrap()
        .into_inner();
    assert_eq!(state.reason, TransactionStateReason::Recoverable);

    let executed = sandbox.gtid_executed(2610).unwrap().to_string();
    sandbox.set_var(2610, "gtid_purged", &executed);
    let state = cluster
        .check_instance_state(&instance(2630))
        .await
        .unwrap()
        .into_inner();
    assert_eq!(state.state, TransactionState::Error);
    assert_eq!(state.reason, TransactionStateReason::LostTransactions);

    sandbox.execute_local_transaction(2640);
    let state = cluster
        .check_instance_state(&instance(2640))
        .await
        .unwrap()
        .into_inner();
    assert_eq!(
        serde_json::to_value(state).unwrap(),
        serde_json::json!({"state": "error", "reason": "diverged"})
    );
}

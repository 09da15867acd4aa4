//! Recovery from quorum loss and from complete outage.

use innodb_cluster_admin::controller::{
    ErrorKind, GetClusterOptions, RebootOptions, RemoveInstanceOptions,
};
use innodb_cluster_admin::group::QuorumVerdict;

use crate::common::fixtures::{ClusterBuilder, dba, endpoint, instance};

// ============================================================================
// Quorum loss
// ============================================================================

/// Two of three members die one after the other. The first is expelled by
/// the remaining majority, the second stays UNREACHABLE until the group is
/// forced onto the survivor's partition, after which both rejoin.
#[tokio::test]
async fn test_force_quorum_then_rejoin() {
    let (sandbox, mut cluster) = ClusterBuilder::new("dev", &[5110, 5120, 5130]).build().await;
    sandbox.kill(5120);

    let status = cluster.status().await.unwrap().into_inner();
    assert_eq!(status.default_replica_set.status, QuorumVerdict::OkNoTolerance);
    assert_eq!(
        status.default_replica_set.topology[&endpoint(5120)].status,
        "(MISSING)"
    );

    sandbox.kill(5130);

    let status = cluster.status().await.unwrap().into_inner();
    assert_eq!(status.default_replica_set.status, QuorumVerdict::NoQuorum);
    assert_eq!(
        status.default_replica_set.topology[&endpoint(5120)].status,
        "(MISSING)"
    );
    assert_eq!(
        status.default_replica_set.topology[&endpoint(5130)].status,
        "UNREACHABLE"
    );

    // Writes need quorum.
    let err = cluster
        .remove_instance(&instance(5130), RemoveInstanceOptions::default())
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::RuntimeError);

    let handle = dba(&sandbox)
        .get_cluster(&instance(5110), Some("dev"), GetClusterOptions::default())
        .await
        .unwrap();
    assert!(handle.report.has_warning(
        "Cluster has no quorum and cannot process write transactions: 1 out of 2 members"
    ));

    let report = cluster
        .force_quorum_using_partition_of(&instance(5110), None)
        .await
        .unwrap();
    assert!(report.notes[0].contains("[localhost:51101] succeeded"));
    assert_eq!(sandbox.group_view(5110), vec![endpoint(5110)]);

    let status = cluster.status().await.unwrap().into_inner();
    assert_eq!(status.default_replica_set.status, QuorumVerdict::OkNoTolerance);
    assert_eq!(
        status.default_replica_set.topology[&endpoint(5130)].status,
        "(MISSING)"
    );

    sandbox.start(5120);
    sandbox.start(5130);
    for port in [5120, 5130] {
        cluster
            .rejoin_instance(&instance(port), Default::default())
            .await
            .unwrap();
    }
    let status = cluster.status().await.unwrap().into_inner();
    assert_eq!(status.default_replica_set.status, QuorumVerdict::Ok);
}

#[tokio::test]
async fn test_force_quorum_refused_on_healthy_cluster() {
    let (sandbox, mut cluster) = ClusterBuilder::new("dev", &[5210, 5220, 5230]).build().await;
    let err = cluster
        .force_quorum_using_partition_of(&instance(5210), None)
        .await
        .unwrap_err();
    assert!(err.to_string().contains("has quorum"));
    assert_eq!(sandbox.group_view(5210).len(), 3);
}

#[tokio::test]
async fn test_get_cluster_redirects_to_primary() {
    let (sandbox, _cluster) = ClusterBuilder::new("dev", &[5310, 5320, 5330]).build().await;
    let dba = dba(&sandbox);

    let redirected = dba
        .get_cluster(&instance(5320), None, GetClusterOptions::default())
        .await
        .unwrap()
        .into_inner();
    assert_eq!(redirected.anchor().endpoint(), endpoint(5310));

    let pinned = dba
        .get_cluster(
            &instance(5320),
            None,
            GetClusterOptions {
                connect_to_primary: Some(false),
            },
        )
        .await
        .unwrap()
        .into_inner();
    assert_eq!(pinned.anchor().endpoint(), endpoint(5320));

    let err = dba
        .get_cluster(&instance(5320), Some("prod"), GetClusterOptions::default())
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::MetadataError);
}

// ============================================================================
// Complete outage
// ============================================================================

#[tokio::test]
async fn test_reboot_from_complete_outage() {
    let (sandbox, _cluster) = ClusterBuilder::new("dev", &[5410, 5420, 5430]).build().await;
    for port in [5410, 5420, 5430] {
        sandbox.kill(port);
    }
    for port in [5410, 5420, 5430] {
        sandbox.start(port);
    }
    let dba = dba(&sandbox);

    let err = dba
        .get_cluster(&instance(5410), None, GetClusterOptions::default())
        .await
        .unwrap_err();
    assert!(err.to_string().contains("GR is not active"));

    let rebooted = dba
        .reboot_cluster_from_complete_outage(&instance(5410), Some("dev"), RebootOptions::default())
        .await
        .unwrap();
    assert_eq!(
        rebooted.report.notes.last().unwrap(),
        "The cluster 'dev' was successfully rebooted."
    );
    let status = rebooted.value.status().await.unwrap().into_inner();
    assert_eq!(status.default_replica_set.status, QuorumVerdict::Ok);
    assert_eq!(
        status.default_replica_set.primary.as_deref(),
        Some("localhost:5410")
    );
}

#[tokio::test]
async fn test_reboot_requires_most_up_to_date_anchor() {
    let (sandbox, _cluster) = ClusterBuilder::new("dev", &[5510, 5520, 5530]).build().await;
    sandbox.kill(5510);
    sandbox.kill(5530);
    // The last survivor saw transactions the others did not.
    sandbox.execute_local_transaction(5520);
    sandbox.kill(5520);
    for port in [5510, 5520, 5530] {
        sandbox.start(port);
    }
    let dba = dba(&sandbox);

    let err = dba
        .reboot_cluster_from_complete_outage(&instance(5510), None, RebootOptions::default())
        .await
        .unwrap_err();
    assert_eq!(
        err.to_string(),
        "The active session instance (localhost:5510) isn't the most updated in comparison \
         with the ONLINE instances of the Cluster's metadata. Please use the most up to date \
         instance: 'localhost:5520'."
    );

    dba.reboot_cluster_from_complete_outage(&instance(5520), None, RebootOptions::default())
        .await
        .unwrap();
    assert_eq!(sandbox.group_view(5520).len(), 3);
}

#[tokio::test]
async fn test_reboot_with_lists() {
    let (sandbox, _cluster) = ClusterBuilder::new("dev", &[5610, 5620, 5630]).build().await;
    for port in [5610, 5620, 5630] {
        sandbox.kill(port);
    }
    let dba = dba(&sandbox);
    sandbox.start(5610);
    sandbox.start(5620);

    let err = dba
        .reboot_cluster_from_complete_outage(
            &instance(5610),
            None,
            RebootOptions {
                rejoin_instances: Some(vec![endpoint(5620)]),
                remove_instances: Some(vec![endpoint(5620)]),
                ..Default::default()
            },
        )
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ArgumentError);
    assert!(err.to_string().contains("belong to both"));

    let err = dba
        .reboot_cluster_from_complete_outage(
            &instance(5610),
            Some("prod"),
            RebootOptions::default(),
        )
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::MetadataError);

    let rebooted = dba
        .reboot_cluster_from_complete_outage(
            &instance(5610),
            None,
            RebootOptions {
                rejoin_instances: Some(vec![endpoint(5620)]),
                remove_instances: Some(vec![endpoint(5630)]),
                ..Default::default()
            },
        )
        .await
        .unwrap()
        .into_inner();
    let described = rebooted.describe().await.unwrap().into_inner();
    assert_eq!(described.default_replica_set.topology.len(), 2);
    assert_eq!(sandbox.group_view(5610).len(), 2);
}

#[tokio::test]
async fn test_reboot_removes_only_after_rejoin() {
    let (sandbox, _cluster) = ClusterBuilder::new("dev", &[5810, 5820, 5830]).build().await;
    for port in [5810, 5820, 5830] {
        sandbox.kill(port);
    }
    sandbox.start(5810);
    sandbox.start(5820);
    sandbox.set_var(
        5820,
        "group_replication_group_name",
        "aaaaaaaa-bbbb-cccc-dddd-eeeeeeeeeeee",
    );

    let err = dba(&sandbox)
        .reboot_cluster_from_complete_outage(
            &instance(5810),
            None,
            RebootOptions {
                rejoin_instances: Some(vec![endpoint(5820)]),
                remove_instances: Some(vec![endpoint(5830)]),
                ..Default::default()
            },
        )
        .await
        .unwrap_err();
    assert!(err.to_string().contains("possible split-brain scenario"));

    // The failed rejoin left the removal undone.
    let metadata = sandbox.metadata(5810).unwrap();
    let recorded = metadata.cluster("dev").unwrap().instances();
    assert_eq!(recorded.len(), 3);
    assert!(recorded.iter().any(|i| i.endpoint == endpoint(5830)));
}

#[tokio::test]
async fn test_reboot_refused_while_group_is_running() {
    let (sandbox, _cluster) = ClusterBuilder::new("dev", &[5710, 5720, 5730]).build().await;
    sandbox.restart(5710);
    let err = dba(&sandbox)
        .reboot_cluster_from_complete_outage(&instance(5710), None, RebootOptions::default())
        .await
        .unwrap_err();
    assert!(err.to_string().contains("forceQuorumUsingPartitionOf"));
}

//! Topology mode, primary election and option changes.

use innodb_cluster_admin::controller::status::MemberOptions;
use innodb_cluster_admin::controller::{ErrorKind, GetClusterOptions, OptionValue, RescanOptions};

use crate::common::fixtures::{ClusterBuilder, dba, endpoint, instance};

#[tokio::test]
async fn test_multi_primary_cluster() {
    let (sandbox, cluster) = ClusterBuilder::new("mm", &[6110, 6120, 6130])
        .multi_primary()
        .build()
        .await;

    let status = cluster.status().await.unwrap().into_inner();
    assert_eq!(status.default_replica_set.topology_mode, "Multi-Primary");
    assert!(status.default_replica_set.primary.is_none());
    assert!(
        status
            .default_replica_set
            .topology
            .values()
            .all(|m| m.mode == "R/W")
    );

    let offsets: Vec<String> = [6110, 6120, 6130]
        .iter()
        .map(|port| sandbox.var(*port, "auto_increment_offset").unwrap())
        .collect();
    assert_eq!(offsets.len(), 3);
    assert!(offsets[0] != offsets[1] && offsets[1] != offsets[2]);

    let err = cluster
        .set_primary_instance(&instance(6120))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::RuntimeError);

    let report = cluster.switch_to_single_primary_mode(None).await.unwrap();
    assert_eq!(
        report.notes.last().unwrap(),
        "The cluster successfully switched to Single-Primary mode."
    );
    let status = cluster.status().await.unwrap().into_inner();
    assert!(status.default_replica_set.primary.is_some());
    for port in [6110, 6120, 6130] {
        assert_eq!(sandbox.var(port, "auto_increment_increment").as_deref(), Some("1"));
        assert_eq!(sandbox.var(port, "auto_increment_offset").as_deref(), Some("2"));
    }
}

#[tokio::test]
async fn test_set_primary_instance() {
    let (_sandbox, cluster) = ClusterBuilder::new("dev", &[6210, 6220, 6230]).build().await;

    cluster.set_primary_instance(&instance(6230)).await.unwrap();
    let status = cluster.status().await.unwrap().into_inner();
    assert_eq!(status.default_replica_set.primary.as_deref(), Some("localhost:6230"));
    assert_eq!(status.default_replica_set.topology[&endpoint(6210)].mode, "R/O");

    let again = cluster.set_primary_instance(&instance(6230)).await.unwrap();
    assert!(again.notes[0].contains("already the primary"));

    let err = cluster
        .set_primary_instance(&instance(6299))
        .await
        .unwrap_err();
    assert!(err.to_string().contains("does not belong"));
}

#[tokio::test]
async fn test_set_option_on_every_member() {
    let (sandbox, mut cluster) = ClusterBuilder::new("dev", &[6310, 6320, 6330]).build().await;

    cluster.set_option("memberWeight", 40_i64).await.unwrap();
    for port in [6310, 6320, 6330] {
        assert_eq!(
            sandbox.persisted_var(port, "group_replication_member_weight").as_deref(),
            Some("40")
        );
    }

    let err = cluster.set_option("exitStateAction", "ABORT").await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ArgumentError);
    let err = cluster.set_option("memberWeight", 101_i64).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ArgumentError);

    cluster.set_option("exitStateAction", "1").await.unwrap();
    assert_eq!(
        sandbox.var(6320, "group_replication_exit_state_action").as_deref(),
        Some("ABORT_SERVER")
    );

    sandbox.kill(6330);
    let err = cluster.set_option("memberWeight", 60_i64).await.unwrap_err();
    assert!(err.to_string().contains("not ONLINE"));
    assert_eq!(
        sandbox.var(6310, "group_replication_member_weight").as_deref(),
        Some("40")
    );
}

#[tokio::test]
async fn test_rename_and_relabel() {
    let (sandbox, mut cluster) = ClusterBuilder::new("dev", &[6410, 6420]).build().await;

    cluster.set_option("clusterName", "prod").await.unwrap();
    assert_eq!(cluster.name(), "prod");
    dba(&sandbox)
        .get_cluster(&instance(6420), Some("prod"), GetClusterOptions::default())
        .await
        .unwrap();

    cluster
        .set_instance_option(&instance(6420), "label", "replica-1")
        .await
        .unwrap();
    let status = cluster.status().await.unwrap().into_inner();
    assert_eq!(
        status.default_replica_set.topology["replica-1"].address,
        endpoint(6420)
    );

    let err = cluster
        .set_instance_option(&instance(6410), "label", "replica-1")
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ArgumentError);

    cluster
        .set_instance_option(&instance(6420), "memberWeight", OptionValue::Int(10))
        .await
        .unwrap();
    assert_eq!(
        sandbox.var(6420, "group_replication_member_weight").as_deref(),
        Some("10")
    );
}

#[tokio::test]
async fn test_options_report_unreachable_member() {
    let (sandbox, cluster) = ClusterBuilder::new("dev", &[6510, 6520, 6530]).build().await;
    sandbox.kill(6530);

    let options = cluster.options(false).await.unwrap().into_inner();
    let topology = &options.default_replica_set.topology;
    assert!(matches!(
        topology[&endpoint(6530)],
        MemberOptions::Unreachable { .. }
    ));
    let MemberOptions::Options(entries) = &topology[&endpoint(6510)] else {
        panic!("reachable member without options");
    };
    let weight = entries.iter().find(|e| e.option == "memberWeight").unwrap();
    assert_eq!(weight.variable, "group_replication_member_weight");
    assert_eq!(weight.value, "50");

    let names: Vec<&str> = options
        .default_replica_set
        .global_options
        .iter()
        .map(|o| o.option.as_str())
        .collect();
    assert_eq!(names, vec!["groupName", "memberSslMode", "disableClone"]);
}

#[tokio::test]
async fn test_topology_type_mismatch_warning() {
    let (sandbox, cluster) = ClusterBuilder::new("dev", &[2710, 2720]).build().await;
    // The group mode changed outside of the cluster's control.
    sandbox.set_var(2710, "group_replication_single_primary_mode", "OFF");

    let status = cluster.status().await.unwrap();
    assert!(status.report.has_warning(
        "The InnoDB Cluster topology type (Single-Primary) does not match the current Group \
         Replication configuration (Multi-Primary). Please use <cluster>.rescan()"
    ));

    let handle = dba(&sandbox)
        .get_cluster(&instance(2710), None, GetClusterOptions::default())
        .await
        .unwrap();
    assert!(handle.report.has_warning("does not match the current Group Replication"));

    let scanned = cluster.rescan(RescanOptions::default()).await.unwrap();
    assert!(!scanned.report.has_warning("does not match"));
    assert_eq!(
        scanned.value.updated_topology_mode.as_deref(),
        Some("Multi-Primary")
    );

    let status = cluster.status().await.unwrap();
    assert!(!status.report.has_warning("does not match"));
}

//! Cluster lifecycle against live servers.

use innodb_cluster_admin::controller::{
    AddInstanceOptions, CreateClusterOptions, DissolveOptions, GetClusterOptions,
    RemoveInstanceOptions,
};
use innodb_cluster_admin::group::QuorumVerdict;

use crate::{dba, init_test, reset};

#[tokio::test(flavor = "multi_thread")]
#[ignore = "requires three MySQL servers listed in ICADMIN_TEST_INSTANCES"]
async fn test_check_instance_configuration() {
    let instances = init_test();
    reset(&instances).await;

    let report = dba()
        .check_instance_configuration(&instances[0])
        .await
        .expect("check configuration")
        .into_inner();
    // Test servers are provisioned ready for group replication.
    assert!(report.is_ok(), "{}", report.render());
}

#[tokio::test(flavor = "multi_thread")]
#[ignore = "requires three MySQL servers listed in ICADMIN_TEST_INSTANCES"]
async fn test_cluster_lifecycle() {
    let instances = init_test();
    reset(&instances).await;
    let dba = dba();

    let mut cluster = dba
        .create_cluster(&instances[0], "itest", CreateClusterOptions::default())
        .await
        .expect("create cluster")
        .into_inner();
    for instance in &instances[1..3] {
        cluster
            .add_instance(instance, AddInstanceOptions::default())
            .await
            .expect("add instance");
    }

    let status = cluster.status().await.expect("status").into_inner();
    assert_eq!(status.default_replica_set.status, QuorumVerdict::Ok);
    assert_eq!(status.default_replica_set.topology.len(), 3);
    assert_eq!(
        status.default_replica_set.primary.as_deref(),
        Some(instances[0].endpoint().as_str())
    );

    // Any member leads back to the cluster.
    let reopened = dba
        .get_cluster(&instances[2], Some("itest"), GetClusterOptions::default())
        .await
        .expect("get cluster")
        .into_inner();
    assert_eq!(reopened.anchor().endpoint(), instances[0].endpoint());

    cluster
        .remove_instance(&instances[2], RemoveInstanceOptions::default())
        .await
        .expect("remove instance");
    let described = cluster.describe().await.expect("describe").into_inner();
    assert_eq!(described.default_replica_set.topology.len(), 2);

    cluster
        .dissolve(DissolveOptions::default())
        .await
        .expect("dissolve");
    assert!(!cluster.is_connected());
}

#[tokio::test(flavor = "multi_thread")]
#[ignore = "requires three MySQL servers listed in ICADMIN_TEST_INSTANCES"]
async fn test_topology_switch_round_trip() {
    let instances = init_test();
    reset(&instances).await;

    let mut cluster = dba()
        .create_cluster(&instances[0], "itest", CreateClusterOptions::default())
        .await
        .expect("create cluster")
        .into_inner();
    cluster
        .add_instance(&instances[1], AddInstanceOptions::default())
        .await
        .expect("add instance");

    cluster
        .switch_to_multi_primary_mode()
        .await
        .expect("switch to multi-primary");
    let status = cluster.status().await.expect("status").into_inner();
    assert_eq!(status.default_replica_set.topology_mode, "Multi-Primary");

    cluster
        .switch_to_single_primary_mode(Some(&instances[1]))
        .await
        .expect("switch to single-primary");
    let status = cluster.status().await.expect("status").into_inner();
    assert_eq!(
        status.default_replica_set.primary.as_deref(),
        Some(instances[1].endpoint().as_str())
    );

    cluster
        .dissolve(DissolveOptions::default())
        .await
        .expect("dissolve");
}

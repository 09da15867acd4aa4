//! Member failure and recovery against live servers.

use innodb_cluster_admin::controller::{
    AddInstanceOptions, CreateClusterOptions, DissolveOptions, RebootOptions,
};
use innodb_cluster_admin::group::QuorumVerdict;

use crate::{dba, init_test, reset, stop_member};

#[tokio::test(flavor = "multi_thread")]
#[ignore = "requires three MySQL servers listed in ICADMIN_TEST_INSTANCES"]
async fn test_rejoin_stopped_member() {
    let instances = init_test();
    reset(&instances).await;

    let mut cluster = dba()
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

    stop_member(&instances[2]).await;
    let status = cluster.status().await.expect("status").into_inner();
    assert_eq!(status.default_replica_set.status, QuorumVerdict::OkNoTolerance);

    cluster
        .rejoin_instance(&instances[2], Default::default())
        .await
        .expect("rejoin instance");
    let status = cluster.status().await.expect("status").into_inner();
    assert_eq!(status.default_replica_set.status, QuorumVerdict::Ok);

    cluster
        .dissolve(DissolveOptions::default())
        .await
        .expect("dissolve");
}

#[tokio::test(flavor = "multi_thread")]
#[ignore = "requires three MySQL servers listed in ICADMIN_TEST_INSTANCES"]
async fn test_reboot_after_complete_outage() {
    let instances = init_test();
    reset(&instances).await;
    let dba = dba();

    let cluster = dba
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

    // Secondaries first so the primary holds every transaction.
    for instance in instances[..3].iter().rev() {
        stop_member(instance).await;
    }

    let mut rebooted = dba
        .reboot_cluster_from_complete_outage(&instances[0], Some("itest"), RebootOptions::default())
        .await
        .expect("reboot")
        .into_inner();
    let status = rebooted.status().await.expect("status").into_inner();
    assert_eq!(status.default_replica_set.status, QuorumVerdict::Ok);

    rebooted
        .dissolve(DissolveOptions::default())
        .await
        .expect("dissolve");
}

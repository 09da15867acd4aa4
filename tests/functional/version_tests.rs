//! Server version gates, applied the same way by every entry point.

use innodb_cluster_admin::client::{Sandbox, SandboxOptions, ServerVersion};
use innodb_cluster_admin::controller::{
    AddInstanceOptions, Cluster, CreateClusterOptions, ErrorKind, OptionValue,
};

use crate::common::fixtures::{ClusterBuilder, dba, endpoint, instance};

fn old_server() -> SandboxOptions {
    SandboxOptions::default().version(ServerVersion::new(5, 7, 24))
}

fn unsupported(option: &str) -> String {
    format!("Option '{option}' not supported on target server version: '5.7.24'")
}

/// An 8.0 primary with a 5.7 secondary.
async fn mixed_cluster(primary: u16, secondary: u16) -> (Sandbox, Cluster<Sandbox>) {
    let sandbox = Sandbox::new();
    sandbox.deploy(primary);
    sandbox.deploy_with(secondary, old_server());
    let cluster = ClusterBuilder::new("dev", &[primary, secondary])
        .build_on(&sandbox)
        .await;
    (sandbox, cluster)
}

#[tokio::test]
async fn test_create_cluster_on_old_server() {
    let sandbox = Sandbox::new();
    let seed = sandbox.deploy_with(2810, old_server());

    let err = dba(&sandbox)
        .create_cluster(
            &seed,
            "old",
            CreateClusterOptions {
                expel_timeout: Some(OptionValue::Int(5)),
                ..Default::default()
            },
        )
        .await
        .unwrap_err();
    assert_eq!(err.to_string(), unsupported("expelTimeout"));
    assert!(sandbox.group_view(2810).is_empty());

    let created = dba(&sandbox)
        .create_cluster(&seed, "old", CreateClusterOptions::default())
        .await
        .unwrap();
    assert!(created.report.has_warning(
        "On instance 'localhost:2810' the persisted cluster configuration will not be updated"
    ));
    assert_eq!(sandbox.group_view(2810), vec![endpoint(2810)]);
}

#[tokio::test]
async fn test_add_instance_option_on_old_server() {
    let (sandbox, mut cluster) = ClusterBuilder::new("dev", &[2910]).build().await;
    sandbox.deploy_with(2920, old_server());

    let err = cluster
        .add_instance(
            &instance(2920),
            AddInstanceOptions {
                auto_rejoin_tries: Some(OptionValue::Int(3)),
                ..Default::default()
            },
        )
        .await
        .unwrap_err();
    assert_eq!(err.to_string(), unsupported("autoRejoinTries"));
    assert_eq!(sandbox.group_view(2910), vec![endpoint(2910)]);
}

#[tokio::test]
async fn test_set_option_checks_every_member_first() {
    let (sandbox, mut cluster) = mixed_cluster(3010, 3020).await;

    let err = cluster.set_option("expelTimeout", 5_i64).await.unwrap_err();
    assert_eq!(err.to_string(), unsupported("expelTimeout"));
    // The 8.0 member comes first and was left alone.
    assert_eq!(
        sandbox.var(3010, "group_replication_member_expel_timeout").as_deref(),
        Some("0")
    );
    assert_eq!(
        sandbox.persisted_var(3010, "group_replication_member_expel_timeout"),
        None
    );

    let err = cluster
        .set_instance_option(&instance(3020), "autoRejoinTries", 2_i64)
        .await
        .unwrap_err();
    assert_eq!(err.to_string(), unsupported("autoRejoinTries"));
}

#[tokio::test]
async fn test_set_option_warns_when_not_persisted() {
    let (sandbox, mut cluster) = mixed_cluster(3110, 3120).await;

    let report = cluster.set_option("memberWeight", 70_i64).await.unwrap();
    assert!(report.has_warning(
        "On instance 'localhost:3120' the persisted cluster configuration will not be updated"
    ));
    assert!(!report.has_warning("'localhost:3110'"));
    assert_eq!(
        sandbox.persisted_var(3110, "group_replication_member_weight").as_deref(),
        Some("70")
    );
    assert_eq!(
        sandbox.var(3120, "group_replication_member_weight").as_deref(),
        Some("70")
    );
    assert_eq!(sandbox.persisted_var(3120, "group_replication_member_weight"), None);
}

#[tokio::test]
async fn test_topology_changes_need_8_0_13_everywhere() {
    let (_sandbox, cluster) = mixed_cluster(3210, 3220).await;

    let err = cluster.switch_to_multi_primary_mode().await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::RuntimeError);
    assert!(err.to_string().contains(
        "The instance 'localhost:3220' has the version 5.7.24 and does not support the operation"
    ));
    assert!(
        err.to_string()
            .contains("At least version 8.0.13 is required on every member")
    );

    let err = cluster
        .set_primary_instance(&instance(3220))
        .await
        .unwrap_err();
    assert!(err.to_string().contains("At least version 8.0.13"));

    let status = cluster.status().await.unwrap().into_inner();
    assert_eq!(status.default_replica_set.topology_mode, "Single-Primary");
    assert_eq!(
        status.default_replica_set.primary.as_deref(),
        Some("localhost:3210")
    );
}

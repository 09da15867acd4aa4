//! Live server fixtures.

use std::time::Duration;

use innodb_cluster_admin::client::{
    Connector, InstanceDef, InstanceSession, MySqlConnector, MySqlConnectorConfig, VarScope,
};
use innodb_cluster_admin::config::AdminConfig;
use innodb_cluster_admin::controller::{Context, Dba};

/// Comma separated instance URIs of the test servers.
pub const INSTANCES_ENV: &str = "ICADMIN_TEST_INSTANCES";

/// Timeout for a member to finish distributed recovery.
pub const JOIN_TIMEOUT: Duration = Duration::from_secs(120);

/// Initialize tracing and read the test servers.
pub fn init_test() -> Vec<InstanceDef> {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("info,innodb_cluster_admin=debug")
        .with_test_writer()
        .try_init();

    let raw = std::env::var(INSTANCES_ENV)
        .unwrap_or_else(|_| panic!("{INSTANCES_ENV} must list three test servers"));
    let instances: Vec<InstanceDef> = raw
        .split(',')
        .map(|uri| uri.parse().expect("valid instance URI"))
        .collect();
    assert!(instances.len() >= 3, "{INSTANCES_ENV} must list three test servers");
    instances
}

pub fn dba() -> Dba<MySqlConnector> {
    let config = AdminConfig::default()
        .with_join_timeout(JOIN_TIMEOUT)
        .with_poll_interval(Duration::from_millis(250));
    let connector = MySqlConnector::new(MySqlConnectorConfig::default());
    Dba::new(Context::new(connector, config))
}

/// Stop group replication and drop the metadata on every server.
pub async fn reset(instances: &[InstanceDef]) {
    let connector = MySqlConnector::new(MySqlConnectorConfig::default());
    for instance in instances {
        let mut session = connector.connect(instance).await.expect("connect");
        let _ = session.stop_group_replication().await;
        let _ = session
            .set_sysvar("super_read_only", "OFF", VarScope::Global)
            .await;
        let _ = session.drop_metadata_schema().await;
    }
}

/// Stop group replication on one member, simulating a member failure.
pub async fn stop_member(instance: &InstanceDef) {
    let connector = MySqlConnector::new(MySqlConnectorConfig::default());
    let mut session = connector.connect(instance).await.expect("connect");
    session
        .stop_group_replication()
        .await
        .expect("stop group replication");
}

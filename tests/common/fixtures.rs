//! Test fixtures for sandbox deployments.

#![allow(dead_code)]

use std::time::Duration;

use innodb_cluster_admin::client::{InstanceDef, Sandbox};
use innodb_cluster_admin::config::AdminConfig;
use innodb_cluster_admin::controller::{Cluster, Context, CreateClusterOptions, Dba};

/// Timeouts small enough that a failing wait ends the test quickly.
pub fn test_config() -> AdminConfig {
    AdminConfig::default()
        .with_poll_interval(Duration::from_millis(1))
        .with_join_timeout(Duration::from_millis(200))
        .with_gtid_wait_timeout(Duration::from_millis(50))
}

pub fn dba(sandbox: &Sandbox) -> Dba<Sandbox> {
    Dba::new(Context::new(sandbox.clone(), test_config()))
}

/// `root:root@localhost:<port>`, the credentials every sandbox server uses.
pub fn instance(port: u16) -> InstanceDef {
    InstanceDef {
        user: Some("root".to_string()),
        password: Some("root".to_string()),
        ..InstanceDef::new("localhost", port)
    }
}

pub fn endpoint(port: u16) -> String {
    format!("localhost:{port}")
}

/// Builder for sandbox clusters.
///
/// # Example
/// ```ignore
/// let (sandbox, cluster) = ClusterBuilder::new("dev", &[3310, 3320, 3330])
///     .multi_primary()
///     .build()
///     .await;
/// ```
#[derive(Clone, Debug)]
pub struct ClusterBuilder {
    name: String,
    ports: Vec<u16>,
    options: CreateClusterOptions,
}

impl ClusterBuilder {
    pub fn new(name: impl Into<String>, ports: &[u16]) -> Self {
        Self {
            name: name.into(),
            ports: ports.to_vec(),
            options: CreateClusterOptions::default(),
        }
    }

    pub fn multi_primary(mut self) -> Self {
        self.options.multi_primary = Some(true);
        self.options.force = Some(true);
        self
    }

    pub fn options(mut self, options: CreateClusterOptions) -> Self {
        self.options = options;
        self
    }

    /// Deploy every port, create the cluster on the first and add the rest.
    pub async fn build(self) -> (Sandbox, Cluster<Sandbox>) {
        let sandbox = Sandbox::new();
        for port in &self.ports {
            sandbox.deploy(*port);
        }
        let cluster = self.build_on(&sandbox).await;
        (sandbox, cluster)
    }

    /// Same as [`ClusterBuilder::build`] on servers already deployed.
    pub async fn build_on(self, sandbox: &Sandbox) -> Cluster<Sandbox> {
        let (seed, rest) = self.ports.split_first().expect("at least one port");
        let cluster = dba(sandbox)
            .create_cluster(&instance(*seed), &self.name, self.options)
            .await
            .expect("create cluster")
            .into_inner();
        for port in rest {
            cluster
                .add_instance(&instance(*port), Default::default())
                .await
                .expect("add instance");
        }
        cluster
    }
}

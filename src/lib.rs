//! innodb-cluster-admin library crate
//!
//! Administers MySQL Group Replication clusters: creating them, changing
//! their membership and topology, and recovering them from quorum loss or
//! complete outage. Cluster state lives in a metadata schema replicated
//! through the group itself.
//!
//! ## Example
//!
//! ```rust,ignore
//! use innodb_cluster_admin::client::MySqlConnector;
//! use innodb_cluster_admin::config::AdminConfig;
//! use innodb_cluster_admin::controller::{Context, CreateClusterOptions, Dba};
//!
//! let dba = Dba::new(Context::new(MySqlConnector::default(), AdminConfig::from_env()?));
//! let seed = "root@db1:3306".parse()?;
//! let cluster = dba.create_cluster(&seed, "prod", CreateClusterOptions::default()).await?;
//! cluster.value.add_instance(&"root@db2:3306".parse()?, Default::default()).await?;
//! ```

pub mod client;
pub mod config;
pub mod controller;
pub mod group;
pub mod metadata;

pub use client::{Connector, InstanceDef, InstanceSession, MySqlConnector, Sandbox};
pub use config::AdminConfig;
pub use controller::{Cluster, Dba, Error, ErrorKind, OperationReport, Reported, Result};

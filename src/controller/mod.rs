//! Controller module for innodb-cluster-admin.
//!
//! Contains the administration operations, the precondition gate, the member
//! lifecycle state machine, option handling and configuration plans.
//!
//! Operations are split between two entry points:
//! - [`Dba`] works through a single instance (create, get, reboot, configure)
//! - [`Cluster`] works on a cluster through its anchor (cluster_* modules)

// Shared modules
pub mod config_plan;
pub mod context;
pub mod error;
pub mod options;
pub mod preconditions;
pub mod session_mode;
pub mod status;
pub mod validation;

// Entry points
pub mod dba;

// Cluster handle
pub mod cluster;
pub mod cluster_membership;
pub mod cluster_topology;
pub mod instance_lifecycle;

pub use cluster::{Cluster, InstanceState, TransactionState, TransactionStateReason};
pub use cluster_membership::{
    AddInstanceOptions, DissolveOptions, InstanceSelection, RejoinInstanceOptions,
    RemoveInstanceOptions, RescanOptions, RescanReport,
};
pub use context::{Context, OperationReport, Reported};
pub use dba::{
    ConfigureInstanceOptions, CreateClusterOptions, Dba, DropMetadataOptions, GetClusterOptions,
    RebootOptions,
};
pub use error::{Error, ErrorKind, Result};
pub use options::{OptionValue, parse_operation_options};
pub use validation::ComplianceReport;

//! Client module for talking to MySQL servers.
//!
//! The controller treats every server as a black-box RPC endpoint. This module
//! defines that RPC surface and its two implementations.
//!
//! ## Architecture
//!
//! - `session`: the [`InstanceSession`] and [`Connector`] traits and [`ClientError`]
//! - `types`: parsed server data (member states and roles, versions, GTID sets)
//! - `instance_def`: instance definitions from URIs or dictionaries
//! - `mysql_session`: production backend over `mysql_async`
//! - `sandbox`: in-process simulated deployment with group replication semantics
//!
//! ## Example
//!
//! ```rust,ignore
//! use innodb_cluster_admin::client::{Connector, InstanceSession, MySqlConnector};
//!
//! let connector = MySqlConnector::default();
//! let mut session = connector.connect(&"root@localhost:3310".parse()?).await?;
//! for member in session.group_members().await? {
//!     println!("{} {}", member.endpoint(), member.state);
//! }
//! ```

pub mod instance_def;
pub mod mysql_session;
pub mod sandbox;
pub mod session;
pub mod types;

pub use instance_def::{DEFAULT_PORT, InstanceDef};
pub use mysql_session::{MySqlConnector, MySqlConnectorConfig, MySqlSession};
pub use sandbox::{Sandbox, SandboxOptions, SandboxSession};
pub use session::{ClientError, ClientResult, Connector, InstanceSession};
pub use types::{
    GroupMember, GtidSet, MemberRole, MemberState, ParseError, ReplicationChannel, ServerInfo,
    ServerVersion, VarScope,
};

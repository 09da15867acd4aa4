//! Session abstraction over a single server.
//!
//! The controller never issues SQL itself. Everything it needs from a server
//! goes through [`InstanceSession`], which is implemented by the `mysql_async`
//! backend and by the in-process sandbox used in tests.

use std::collections::BTreeMap;
use std::time::Duration;

use thiserror::Error;

use super::instance_def::InstanceDef;
use super::types::{
    GroupMember, GtidSet, ParseError, ReplicationChannel, ServerInfo, VarScope,
};
use crate::metadata::records::MetadataSnapshot;

/// Errors that can occur while talking to a server.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ClientError {
    #[error("Can't connect to MySQL server on '{endpoint}': {message}")]
    Connection { endpoint: String, message: String },

    #[error("MySQL Error {code} ({endpoint}): {message}")]
    Server {
        endpoint: String,
        code: u16,
        message: String,
    },

    #[error("Timeout after {duration:?}: {operation}")]
    Timeout {
        operation: String,
        duration: Duration,
    },

    #[error("Parse error: {0}")]
    Parse(#[from] ParseError),

    #[error("Metadata schema error ({endpoint}): {message}")]
    Metadata { endpoint: String, message: String },
}

impl ClientError {
    /// Whether retrying the same call may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ClientError::Connection { .. } | ClientError::Timeout { .. }
        )
    }

    pub fn is_connection(&self) -> bool {
        matches!(self, ClientError::Connection { .. })
    }
}

pub type ClientResult<T> = std::result::Result<T, ClientError>;

/// Operations the controller issues against one server.
///
/// Calls on one session are sequential; the controller never shares a
/// session between tasks.
#[allow(async_fn_in_trait)]
pub trait InstanceSession {
    /// The definition this session was opened with.
    fn instance(&self) -> &InstanceDef;

    /// Server identity, version and group replication basics.
    async fn server_info(&mut self) -> ClientResult<ServerInfo>;

    /// Value of a global system variable, `None` if the server does not know it.
    async fn get_sysvar(&mut self, name: &str) -> ClientResult<Option<String>>;

    /// Every global system variable whose name starts with `prefix`.
    async fn get_sysvars_with_prefix(&mut self, prefix: &str)
    -> ClientResult<BTreeMap<String, String>>;

    async fn set_sysvar(&mut self, name: &str, value: &str, scope: VarScope) -> ClientResult<()>;

    /// The group membership view as seen by this server.
    ///
    /// Empty when group replication is not running on it.
    async fn group_members(&mut self) -> ClientResult<Vec<GroupMember>>;

    /// Start group replication, bootstrapping a new group when `bootstrap` is set.
    async fn start_group_replication(&mut self, bootstrap: bool) -> ClientResult<()>;

    async fn stop_group_replication(&mut self) -> ClientResult<()>;

    /// Restart the server so `PERSIST_ONLY` settings take effect.
    ///
    /// The session is unusable afterwards.
    async fn restart_server(&mut self) -> ClientResult<()>;

    /// Force the group membership to the given local addresses.
    async fn force_members(&mut self, local_addresses: &[String]) -> ClientResult<()>;

    async fn switch_to_multi_primary(&mut self) -> ClientResult<()>;

    /// Switch to single-primary mode, electing `primary_uuid` when given.
    async fn switch_to_single_primary(&mut self, primary_uuid: Option<&str>) -> ClientResult<()>;

    async fn set_as_primary(&mut self, uuid: &str) -> ClientResult<()>;

    async fn gtid_executed(&mut self) -> ClientResult<GtidSet>;

    /// Wait until `gtid_set` is applied. Returns `false` on timeout.
    async fn wait_for_gtid_set(&mut self, gtid_set: &GtidSet, timeout: Duration)
    -> ClientResult<bool>;

    /// Replication channels other than the group replication ones.
    async fn replication_channels(&mut self) -> ClientResult<Vec<ReplicationChannel>>;

    async fn metadata_schema_exists(&mut self) -> ClientResult<bool>;

    /// Full metadata content, `None` when the schema does not exist.
    async fn load_metadata(&mut self) -> ClientResult<Option<MetadataSnapshot>>;

    /// Replace the metadata content in one transaction, creating the schema if needed.
    async fn store_metadata(&mut self, snapshot: &MetadataSnapshot) -> ClientResult<()>;

    async fn drop_metadata_schema(&mut self) -> ClientResult<()>;
}

/// Opens sessions to servers.
#[allow(async_fn_in_trait)]
pub trait Connector: Clone {
    type Session: InstanceSession;

    async fn connect(&self, instance: &InstanceDef) -> ClientResult<Self::Session>;
}

//! In-process sandbox deployment.
//!
//! Simulates a set of MySQL servers running group replication: servers can be
//! deployed, killed and restarted; groups are bootstrapped and joined through
//! the same [`InstanceSession`] calls the controller issues against real
//! servers. Membership follows the consensus rules the controller relies on:
//!
//! - a group with a majority of its view reachable expels unreachable members
//! - a group without a majority keeps them as `UNREACHABLE` and refuses writes
//! - metadata writes replicate to every `ONLINE` member of the writer's group
//!
//! Group replication is never started automatically when a server restarts;
//! members come back standalone and are rejoined explicitly.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tracing::debug;

use super::instance_def::InstanceDef;
use super::session::{ClientError, ClientResult, Connector, InstanceSession};
use super::types::{
    GroupMember, GtidSet, MemberRole, MemberState, ReplicationChannel, ServerInfo,
    ServerVersion, VarScope,
};
use crate::metadata::records::MetadataSnapshot;

const SANDBOX_HOST: &str = "localhost";

/// Server error codes reported by the sandbox.
mod codes {
    pub const ACCESS_DENIED: u16 = 1045;
    pub const PARSE_ERROR: u16 = 1064;
    pub const WRONG_VALUE_FOR_VAR: u16 = 1231;
    pub const UNKNOWN_SYSTEM_VARIABLE: u16 = 1193;
    pub const READ_ONLY: u16 = 1290;
    pub const GROUP_REPLICATION_CONFIGURATION: u16 = 3092;
    pub const GROUP_REPLICATION_RUNNING: u16 = 3093;
    pub const GROUP_REPLICATION_NOT_ACTIVE: u16 = 3905;
}

/// Variables that only exist from a given version: (name, 5.7 minimum, 8.0 minimum).
const VERSIONED_SYSVARS: &[(&str, Option<ServerVersion>, ServerVersion)] = &[
    (
        "group_replication_exit_state_action",
        Some(ServerVersion::new(5, 7, 24)),
        ServerVersion::new(8, 0, 12),
    ),
    (
        "group_replication_member_weight",
        Some(ServerVersion::new(5, 7, 20)),
        ServerVersion::new(8, 0, 11),
    ),
    (
        "group_replication_member_expel_timeout",
        None,
        ServerVersion::new(8, 0, 13),
    ),
    ("group_replication_consistency", None, ServerVersion::new(8, 0, 14)),
    (
        "group_replication_autorejoin_tries",
        None,
        ServerVersion::new(8, 0, 16),
    ),
    ("group_replication_clone_threshold", None, ServerVersion::new(8, 0, 17)),
];

fn sysvar_supported(name: &str, version: &ServerVersion) -> bool {
    match VERSIONED_SYSVARS.iter().find(|(n, _, _)| *n == name) {
        None => true,
        Some((_, min57, min80)) => {
            if version.major() == 5 {
                min57.as_ref().is_some_and(|m| version >= m)
            } else {
                version >= min80
            }
        }
    }
}

/// Deployment options for one sandbox server.
#[derive(Debug, Clone)]
pub struct SandboxOptions {
    pub version: ServerVersion,
    pub password: Option<String>,
    pub super_read_only: bool,
    /// Option-file overrides applied on top of a compliant configuration.
    pub config: BTreeMap<String, String>,
}

impl Default for SandboxOptions {
    fn default() -> Self {
        Self {
            version: ServerVersion::new(8, 0, 18),
            password: Some("root".to_string()),
            super_read_only: false,
            config: BTreeMap::new(),
        }
    }
}

impl SandboxOptions {
    pub fn version(mut self, version: ServerVersion) -> Self {
        self.version = version;
        self
    }

    pub fn super_read_only(mut self, on: bool) -> Self {
        self.super_read_only = on;
        self
    }

    pub fn config(mut self, name: &str, value: &str) -> Self {
        self.config.insert(name.to_string(), value.to_string());
        self
    }
}

#[derive(Debug, Clone)]
struct SandboxServer {
    port: u16,
    uuid: String,
    version: ServerVersion,
    password: Option<String>,
    running: bool,
    /// Group this server is actively part of.
    group: Option<String>,
    option_file: BTreeMap<String, String>,
    persisted: BTreeMap<String, String>,
    sysvars: BTreeMap<String, String>,
    gtid_executed: GtidSet,
    metadata: Option<MetadataSnapshot>,
    channels: Vec<ReplicationChannel>,
    /// Observations left in `RECOVERING` after the next join.
    recovery_polls: u32,
    recovering: u32,
    apply_lag: bool,
    fail_next_metadata_write: bool,
    local_trx: u64,
}

impl SandboxServer {
    fn endpoint(&self) -> String {
        format!("{SANDBOX_HOST}:{}", self.port)
    }

    fn var(&self, name: &str) -> String {
        self.sysvars.get(name).cloned().unwrap_or_default()
    }

    fn var_on(&self, name: &str) -> bool {
        matches!(self.var(name).to_uppercase().as_str(), "ON" | "1")
    }

    fn member_weight(&self) -> i64 {
        self.var("group_replication_member_weight")
            .parse()
            .unwrap_or(50)
    }

    /// Runtime variables after a (re)start.
    fn boot(&mut self) {
        let mut vars = compliant_config(self.port, &self.version);
        vars.extend(self.option_file.clone());
        vars.extend(self.persisted.clone());
        self.sysvars = vars;
        self.group = None;
        self.recovering = 0;
    }
}

fn compliant_config(port: u16, version: &ServerVersion) -> BTreeMap<String, String> {
    let mut vars: BTreeMap<String, String> = [
        ("binlog_format", "ROW"),
        ("binlog_checksum", "NONE"),
        ("gtid_mode", "ON"),
        ("enforce_gtid_consistency", "ON"),
        ("log_bin", "ON"),
        ("log_slave_updates", "ON"),
        ("master_info_repository", "TABLE"),
        ("relay_log_info_repository", "TABLE"),
        ("transaction_write_set_extraction", "XXHASH64"),
        ("super_read_only", "OFF"),
        ("auto_increment_increment", "1"),
        ("auto_increment_offset", "1"),
        ("group_replication_group_name", ""),
        ("group_replication_local_address", ""),
        ("group_replication_group_seeds", ""),
        ("group_replication_ip_whitelist", "AUTOMATIC"),
        ("group_replication_ssl_mode", "DISABLED"),
        ("group_replication_single_primary_mode", "ON"),
        ("group_replication_enforce_update_everywhere_checks", "OFF"),
        ("group_replication_start_on_boot", "OFF"),
        ("group_replication_bootstrap_group", "OFF"),
        ("group_replication_member_weight", "50"),
        ("group_replication_exit_state_action", "READ_ONLY"),
        ("group_replication_member_expel_timeout", "0"),
        ("group_replication_consistency", "EVENTUAL"),
        ("group_replication_autorejoin_tries", "0"),
        ("group_replication_clone_threshold", "9223372036854775807"),
    ]
    .into_iter()
    .map(|(k, v)| (k.to_string(), v.to_string()))
    .collect();
    vars.insert("server_id".to_string(), port.to_string());
    vars.insert("report_port".to_string(), port.to_string());
    vars.insert("port".to_string(), port.to_string());
    vars.retain(|name, _| sysvar_supported(name, version));
    vars
}

#[derive(Debug, Clone)]
struct SandboxGroup {
    name: String,
    /// Endpoints in the group's view, in join order.
    members: Vec<String>,
    single_primary: bool,
    primary: Option<String>,
}

#[derive(Debug, Default)]
struct SandboxState {
    servers: BTreeMap<String, SandboxServer>,
    groups: BTreeMap<String, SandboxGroup>,
}

impl SandboxState {
    fn server(&self, endpoint: &str) -> ClientResult<&SandboxServer> {
        match self.servers.get(endpoint) {
            Some(s) if s.running => Ok(s),
            _ => Err(unreachable_error(endpoint)),
        }
    }

    fn server_mut(&mut self, endpoint: &str) -> ClientResult<&mut SandboxServer> {
        match self.servers.get_mut(endpoint) {
            Some(s) if s.running => Ok(s),
            _ => Err(unreachable_error(endpoint)),
        }
    }

    fn group_key(name: &str) -> String {
        name.to_lowercase()
    }

    /// Whether `endpoint` is an active participant of `group`.
    fn is_online_in(&self, endpoint: &str, group: &str) -> bool {
        self.servers
            .get(endpoint)
            .is_some_and(|s| s.running && s.group.as_deref() == Some(group))
    }

    fn online_members(&self, group: &SandboxGroup) -> Vec<String> {
        group
            .members
            .iter()
            .filter(|m| self.is_online_in(m, &group.name))
            .cloned()
            .collect()
    }

    fn has_quorum(&self, group: &SandboxGroup) -> bool {
        self.online_members(group).len() * 2 > group.members.len()
    }

    fn elect_primary(&self, group: &SandboxGroup) -> Option<String> {
        let mut candidates: Vec<&SandboxServer> = self
            .online_members(group)
            .iter()
            .filter_map(|m| self.servers.get(m))
            .collect();
        candidates.sort_by(|a, b| {
            b.member_weight()
                .cmp(&a.member_weight())
                .then_with(|| a.uuid.cmp(&b.uuid))
        });
        candidates.first().map(|s| s.endpoint())
    }

    /// Apply the consensus layer's reaction to members going away.
    fn reconcile_group(&mut self, key: &str) {
        let Some(mut group) = self.groups.get(key).cloned() else {
            return;
        };
        let online = self.online_members(&group);
        if online.is_empty() {
            debug!(group = %group.name, "Group dissolved, no members left");
            self.groups.remove(key);
            return;
        }
        if self.has_quorum(&group) {
            group.members.retain(|m| online.contains(m));
        }
        if group.single_primary
            && group
                .primary
                .as_ref()
                .is_none_or(|p| !online.contains(p))
            && self.has_quorum(&group)
        {
            group.primary = self.elect_primary(&group);
        }
        self.groups.insert(key.to_string(), group);
    }

    fn group_of(&self, endpoint: &str) -> Option<&SandboxGroup> {
        let server = self.servers.get(endpoint)?;
        let name = server.group.as_ref()?;
        self.groups.get(&Self::group_key(name))
    }

    fn is_writable(&self, endpoint: &str) -> bool {
        let Some(server) = self.servers.get(endpoint) else {
            return false;
        };
        match self.group_of(endpoint) {
            Some(group) => {
                self.has_quorum(group)
                    && (!group.single_primary || group.primary.as_deref() == Some(endpoint))
            }
            None => !server.var_on("super_read_only"),
        }
    }

    /// Apply a write through `endpoint` and replicate it to its group.
    fn replicate_write(&mut self, endpoint: &str, metadata: Option<MetadataSnapshot>) {
        let (targets, source) = match self.group_of(endpoint) {
            Some(group) => (self.online_members(group), group.name.clone()),
            None => {
                let uuid = self
                    .servers
                    .get(endpoint)
                    .map(|s| s.uuid.clone())
                    .unwrap_or_default();
                (vec![endpoint.to_string()], uuid)
            }
        };
        let next = self
            .servers
            .get(endpoint)
            .and_then(|s| s.gtid_executed.last_transaction(&source))
            .unwrap_or(0)
            + 1;
        for target in targets {
            if let Some(server) = self.servers.get_mut(&target) {
                server.metadata = metadata.clone();
                server.gtid_executed.add(&source, next, next);
            }
        }
    }
}

fn unreachable_error(endpoint: &str) -> ClientError {
    ClientError::Connection {
        endpoint: endpoint.to_string(),
        message: "Can't connect to MySQL server (111)".to_string(),
    }
}

fn server_error(endpoint: &str, code: u16, message: impl Into<String>) -> ClientError {
    ClientError::Server {
        endpoint: endpoint.to_string(),
        code,
        message: message.into(),
    }
}

/// Validate a value the way the server does on `SET`.
fn check_value(endpoint: &str, name: &str, value: &str, version: &ServerVersion) -> ClientResult<()> {
    let upper = value.to_uppercase();
    let ok = match name {
        "group_replication_exit_state_action" => {
            matches!(upper.as_str(), "ABORT_SERVER" | "READ_ONLY")
                || (upper == "OFFLINE_MODE" && *version >= ServerVersion::new(8, 0, 18))
        }
        "group_replication_ssl_mode" => {
            matches!(upper.as_str(), "DISABLED" | "REQUIRED" | "VERIFY_CA" | "VERIFY_IDENTITY")
        }
        "group_replication_consistency" => matches!(
            upper.as_str(),
            "EVENTUAL" | "BEFORE_ON_PRIMARY_FAILOVER" | "BEFORE" | "AFTER" | "BEFORE_AND_AFTER"
        ),
        "group_replication_member_weight"
        | "group_replication_member_expel_timeout"
        | "group_replication_autorejoin_tries"
        | "auto_increment_increment"
        | "auto_increment_offset" => value.parse::<i64>().is_ok(),
        _ => true,
    };
    if ok {
        Ok(())
    } else {
        Err(server_error(
            endpoint,
            codes::WRONG_VALUE_FOR_VAR,
            format!("Variable '{name}' can't be set to the value of '{value}'"),
        ))
    }
}

/// A simulated deployment of MySQL servers.
///
/// Cloning shares the deployment.
#[derive(Clone, Debug, Default)]
pub struct Sandbox {
    state: Arc<Mutex<SandboxState>>,
}

impl Sandbox {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, SandboxState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Deploy a compliant 8.0 server on `port` with user `root`/`root`.
    pub fn deploy(&self, port: u16) -> InstanceDef {
        self.deploy_with(port, SandboxOptions::default())
    }

    pub fn deploy_with(&self, port: u16, options: SandboxOptions) -> InstanceDef {
        let mut server = SandboxServer {
            port,
            uuid: uuid::Uuid::new_v4().to_string(),
            version: options.version,
            password: options.password.clone(),
            running: true,
            group: None,
            option_file: options.config,
            persisted: BTreeMap::new(),
            sysvars: BTreeMap::new(),
            gtid_executed: GtidSet::new(),
            metadata: None,
            channels: Vec::new(),
            recovery_polls: 0,
            recovering: 0,
            apply_lag: false,
            fail_next_metadata_write: false,
            local_trx: 0,
        };
        if options.super_read_only {
            server
                .option_file
                .insert("super_read_only".to_string(), "ON".to_string());
        }
        server.boot();
        let endpoint = server.endpoint();
        self.lock().servers.insert(endpoint, server);

        InstanceDef {
            user: Some("root".to_string()),
            password: options.password,
            ..InstanceDef::new(SANDBOX_HOST, port)
        }
    }

    /// Stop the server abruptly.
    pub fn kill(&self, port: u16) {
        let endpoint = format!("{SANDBOX_HOST}:{port}");
        let mut state = self.lock();
        let group = state.servers.get_mut(&endpoint).and_then(|s| {
            s.running = false;
            s.group.take()
        });
        if let Some(group) = group {
            state.reconcile_group(&SandboxState::group_key(&group));
        }
    }

    /// Start a stopped server. Group replication stays stopped.
    pub fn start(&self, port: u16) {
        let endpoint = format!("{SANDBOX_HOST}:{port}");
        if let Some(server) = self.lock().servers.get_mut(&endpoint) {
            if !server.running {
                server.running = true;
                server.boot();
            }
        }
    }

    pub fn restart(&self, port: u16) {
        self.kill(port);
        self.start(port);
    }

    /// Current runtime value of a variable.
    pub fn var(&self, port: u16, name: &str) -> Option<String> {
        let endpoint = format!("{SANDBOX_HOST}:{port}");
        self.lock()
            .servers
            .get(&endpoint)
            .and_then(|s| s.sysvars.get(name).cloned())
    }

    /// Value persisted with `SET PERSIST`.
    pub fn persisted_var(&self, port: u16, name: &str) -> Option<String> {
        let endpoint = format!("{SANDBOX_HOST}:{port}");
        self.lock()
            .servers
            .get(&endpoint)
            .and_then(|s| s.persisted.get(name).cloned())
    }

    /// Change a runtime variable behind the controller's back.
    pub fn set_var(&self, port: u16, name: &str, value: &str) {
        let endpoint = format!("{SANDBOX_HOST}:{port}");
        if let Some(server) = self.lock().servers.get_mut(&endpoint) {
            server.sysvars.insert(name.to_string(), value.to_string());
        }
    }

    pub fn server_uuid(&self, port: u16) -> Option<String> {
        let endpoint = format!("{SANDBOX_HOST}:{port}");
        self.lock().servers.get(&endpoint).map(|s| s.uuid.clone())
    }

    pub fn add_replication_channel(&self, port: u16, name: &str, running: bool) {
        let endpoint = format!("{SANDBOX_HOST}:{port}");
        if let Some(server) = self.lock().servers.get_mut(&endpoint) {
            server.channels.push(ReplicationChannel {
                name: name.to_string(),
                running,
            });
        }
    }

    /// Keep the server `RECOVERING` for `polls` observations after its next join.
    pub fn set_recovery_polls(&self, port: u16, polls: u32) {
        let endpoint = format!("{SANDBOX_HOST}:{port}");
        if let Some(server) = self.lock().servers.get_mut(&endpoint) {
            server.recovery_polls = polls;
        }
    }

    /// Make GTID waits on the server time out.
    pub fn set_apply_lag(&self, port: u16, lagging: bool) {
        let endpoint = format!("{SANDBOX_HOST}:{port}");
        if let Some(server) = self.lock().servers.get_mut(&endpoint) {
            server.apply_lag = lagging;
        }
    }

    /// Fail the next metadata write issued through the server.
    pub fn fail_next_metadata_write(&self, port: u16) {
        let endpoint = format!("{SANDBOX_HOST}:{port}");
        if let Some(server) = self.lock().servers.get_mut(&endpoint) {
            server.fail_next_metadata_write = true;
        }
    }

    /// Commit a local transaction that bypasses the group.
    pub fn execute_local_transaction(&self, port: u16) {
        let endpoint = format!("{SANDBOX_HOST}:{port}");
        if let Some(server) = self.lock().servers.get_mut(&endpoint) {
            server.local_trx += 1;
            let (uuid, n) = (server.uuid.clone(), server.local_trx);
            server.gtid_executed.add(&uuid, n, n);
        }
    }

    pub fn metadata(&self, port: u16) -> Option<MetadataSnapshot> {
        let endpoint = format!("{SANDBOX_HOST}:{port}");
        self.lock()
            .servers
            .get(&endpoint)
            .and_then(|s| s.metadata.clone())
    }

    pub fn gtid_executed(&self, port: u16) -> Option<GtidSet> {
        let endpoint = format!("{SANDBOX_HOST}:{port}");
        self.lock()
            .servers
            .get(&endpoint)
            .map(|s| s.gtid_executed.clone())
    }

    /// Endpoints of the group view the server belongs to.
    pub fn group_view(&self, port: u16) -> Vec<String> {
        let endpoint = format!("{SANDBOX_HOST}:{port}");
        let state = self.lock();
        state
            .group_of(&endpoint)
            .map(|g| g.members.clone())
            .unwrap_or_default()
    }
}

impl Connector for Sandbox {
    type Session = SandboxSession;

    async fn connect(&self, instance: &InstanceDef) -> ClientResult<SandboxSession> {
        let endpoint = instance.endpoint();
        {
            let state = self.lock();
            let server = state.server(&endpoint)?;
            if server.password.is_some() && server.password != instance.password {
                return Err(server_error(
                    &endpoint,
                    codes::ACCESS_DENIED,
                    format!(
                        "Access denied for user '{}'@'localhost' (using password: {})",
                        instance.user.as_deref().unwrap_or("root"),
                        if instance.password.is_some() { "YES" } else { "NO" }
                    ),
                ));
            }
        }
        Ok(SandboxSession {
            sandbox: self.clone(),
            instance: instance.clone(),
            endpoint,
        })
    }
}

/// A session to one sandbox server.
pub struct SandboxSession {
    sandbox: Sandbox,
    instance: InstanceDef,
    endpoint: String,
}

impl SandboxSession {
    fn join_group(&self, state: &mut SandboxState) -> ClientResult<()> {
        let ep = self.endpoint.as_str();
        let server = state.server(ep)?;
        if server.group.is_some() {
            return Err(server_error(
                ep,
                codes::GROUP_REPLICATION_RUNNING,
                "The START GROUP_REPLICATION command failed since the group is already running.",
            ));
        }
        let group_name = server.var("group_replication_group_name");
        let local_address = server.var("group_replication_local_address");
        if group_name.is_empty() || local_address.is_empty() {
            return Err(server_error(
                ep,
                codes::GROUP_REPLICATION_CONFIGURATION,
                "The server is not configured properly to be an active member of the group.",
            ));
        }
        let seeds: Vec<String> = server
            .var("group_replication_group_seeds")
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();
        let single_primary = server.var_on("group_replication_single_primary_mode");
        let joiner_gtid = server.gtid_executed.clone();
        let recovery_polls = server.recovery_polls;

        let key = SandboxState::group_key(&group_name);
        let Some(group) = state.groups.get(&key).cloned() else {
            return Err(server_error(
                ep,
                codes::GROUP_REPLICATION_CONFIGURATION,
                format!("No reachable seed for group '{group_name}'"),
            ));
        };
        let online = state.online_members(&group);
        let donor = online.iter().find(|m| {
            state
                .servers
                .get(*m)
                .is_some_and(|s| seeds.contains(&s.var("group_replication_local_address")))
        });
        let Some(donor) = donor.cloned() else {
            return Err(server_error(
                ep,
                codes::GROUP_REPLICATION_CONFIGURATION,
                format!("No reachable seed for group '{group_name}'"),
            ));
        };
        if !state.has_quorum(&group) {
            return Err(server_error(
                ep,
                codes::GROUP_REPLICATION_CONFIGURATION,
                "The group has no quorum and cannot accept new members.",
            ));
        }
        if group.single_primary != single_primary {
            return Err(server_error(
                ep,
                codes::GROUP_REPLICATION_CONFIGURATION,
                "The member configuration is not compatible with the group configuration.",
            ));
        }
        let donor_server = state.server(&donor)?.clone();
        if !joiner_gtid.is_subset_of(&donor_server.gtid_executed) {
            return Err(server_error(
                ep,
                codes::GROUP_REPLICATION_CONFIGURATION,
                "This member has more executed transactions than those present in the group.",
            ));
        }

        let mut group = group;
        group.members.retain(|m| m != ep);
        group.members.push(ep.to_string());
        state.groups.insert(key, group);

        let server = state.server_mut(ep)?;
        server.group = Some(group_name);
        server.gtid_executed = donor_server.gtid_executed;
        server.metadata = donor_server.metadata;
        server.recovering = recovery_polls;
        debug!(endpoint = ep, donor = %donor, "Joined group");
        Ok(())
    }

    fn bootstrap_group(&self, state: &mut SandboxState) -> ClientResult<()> {
        let ep = self.endpoint.as_str();
        let server = state.server(ep)?;
        if server.group.is_some() {
            return Err(server_error(
                ep,
                codes::GROUP_REPLICATION_RUNNING,
                "The START GROUP_REPLICATION command failed since the group is already running.",
            ));
        }
        let group_name = server.var("group_replication_group_name");
        if group_name.is_empty() || server.var("group_replication_local_address").is_empty() {
            return Err(server_error(
                ep,
                codes::GROUP_REPLICATION_CONFIGURATION,
                "The server is not configured properly to be an active member of the group.",
            ));
        }
        let single_primary = server.var_on("group_replication_single_primary_mode");
        let key = SandboxState::group_key(&group_name);
        if let Some(existing) = state.groups.get(&key)
            && !state.online_members(existing).is_empty()
        {
            return Err(server_error(
                ep,
                codes::GROUP_REPLICATION_CONFIGURATION,
                format!("Group '{group_name}' is already running"),
            ));
        }
        state.groups.insert(
            key,
            SandboxGroup {
                name: group_name.clone(),
                members: vec![ep.to_string()],
                single_primary,
                primary: single_primary.then(|| ep.to_string()),
            },
        );
        let server = state.server_mut(ep)?;
        server.group = Some(group_name);
        server.recovering = 0;
        debug!(endpoint = ep, "Bootstrapped group");
        Ok(())
    }

    fn group_key_of(&self, state: &SandboxState) -> ClientResult<String> {
        state
            .server(&self.endpoint)?
            .group
            .as_deref()
            .map(SandboxState::group_key)
            .ok_or_else(|| {
                server_error(
                    &self.endpoint,
                    codes::GROUP_REPLICATION_NOT_ACTIVE,
                    "Group replication is not running on this member.",
                )
            })
    }

    fn uuid_to_endpoint(state: &SandboxState, uuid: &str) -> Option<String> {
        state
            .servers
            .values()
            .find(|s| s.uuid.eq_ignore_ascii_case(uuid))
            .map(SandboxServer::endpoint)
    }
}

impl InstanceSession for SandboxSession {
    fn instance(&self) -> &InstanceDef {
        &self.instance
    }

    async fn server_info(&mut self) -> ClientResult<ServerInfo> {
        let state = self.sandbox.lock();
        let server = state.server(&self.endpoint)?;
        let super_read_only = match state.group_of(&self.endpoint) {
            Some(_) => !state.is_writable(&self.endpoint),
            None => server.var_on("super_read_only"),
        };
        Ok(ServerInfo {
            uuid: server.uuid.clone(),
            server_id: server.var("server_id").parse().unwrap_or(0),
            version: server.version.clone(),
            super_read_only,
            group_name: server.var("group_replication_group_name"),
            single_primary_mode: server.var_on("group_replication_single_primary_mode"),
        })
    }

    async fn get_sysvar(&mut self, name: &str) -> ClientResult<Option<String>> {
        let state = self.sandbox.lock();
        Ok(state.server(&self.endpoint)?.sysvars.get(name).cloned())
    }

    async fn get_sysvars_with_prefix(
        &mut self,
        prefix: &str,
    ) -> ClientResult<BTreeMap<String, String>> {
        let state = self.sandbox.lock();
        Ok(state
            .server(&self.endpoint)?
            .sysvars
            .iter()
            .filter(|(k, _)| k.starts_with(prefix))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }

    async fn set_sysvar(&mut self, name: &str, value: &str, scope: VarScope) -> ClientResult<()> {
        let mut state = self.sandbox.lock();
        let ep = self.endpoint.clone();
        let server = state.server_mut(&ep)?;
        if !sysvar_supported(name, &server.version) || !server.sysvars.contains_key(name) {
            return Err(server_error(
                &ep,
                codes::UNKNOWN_SYSTEM_VARIABLE,
                format!("Unknown system variable '{name}'"),
            ));
        }
        if scope != VarScope::Global && !server.version.supports_persist() {
            return Err(server_error(
                &ep,
                codes::PARSE_ERROR,
                "You have an error in your SQL syntax; check the manual that corresponds to your MySQL server version",
            ));
        }
        check_value(&ep, name, value, &server.version)?;

        let value = if name == "group_replication_member_weight" {
            value.parse::<i64>().unwrap_or(50).clamp(0, 100).to_string()
        } else {
            value.to_string()
        };
        if scope != VarScope::PersistOnly {
            server.sysvars.insert(name.to_string(), value.clone());
        }
        if scope != VarScope::Global {
            server.persisted.insert(name.to_string(), value);
        }
        Ok(())
    }

    async fn group_members(&mut self) -> ClientResult<Vec<GroupMember>> {
        let mut state = self.sandbox.lock();
        state.server(&self.endpoint)?;
        let Some(group) = state.group_of(&self.endpoint).cloned() else {
            return Ok(Vec::new());
        };

        let mut members = Vec::with_capacity(group.members.len());
        for endpoint in &group.members {
            let online = state.is_online_in(endpoint, &group.name);
            let Some(server) = state.servers.get_mut(endpoint) else {
                continue;
            };
            let member_state = if !online {
                MemberState::Unreachable
            } else if server.recovering > 0 {
                server.recovering -= 1;
                MemberState::Recovering
            } else {
                MemberState::Online
            };
            let role = if !group.single_primary || group.primary.as_deref() == Some(endpoint) {
                MemberRole::Primary
            } else {
                MemberRole::Secondary
            };
            members.push(GroupMember {
                uuid: server.uuid.clone(),
                host: SANDBOX_HOST.to_string(),
                port: server.port,
                state: member_state,
                role,
            });
        }
        Ok(members)
    }

    async fn start_group_replication(&mut self, bootstrap: bool) -> ClientResult<()> {
        let mut state = self.sandbox.lock();
        if bootstrap {
            self.bootstrap_group(&mut state)
        } else {
            self.join_group(&mut state)
        }
    }

    async fn stop_group_replication(&mut self) -> ClientResult<()> {
        let mut state = self.sandbox.lock();
        let ep = self.endpoint.clone();
        let key = self.group_key_of(&state)?;
        if let Some(group) = state.groups.get_mut(&key) {
            group.members.retain(|m| *m != ep);
        }
        state.server_mut(&ep)?.group = None;
        state.reconcile_group(&key);
        debug!(endpoint = %ep, "Left group");
        Ok(())
    }

    async fn restart_server(&mut self) -> ClientResult<()> {
        let port = {
            let state = self.sandbox.lock();
            state.server(&self.endpoint)?.port
        };
        self.sandbox.restart(port);
        Ok(())
    }

    async fn force_members(&mut self, local_addresses: &[String]) -> ClientResult<()> {
        let mut state = self.sandbox.lock();
        let ep = self.endpoint.clone();
        let key = self.group_key_of(&state)?;
        let Some(mut group) = state.groups.get(&key).cloned() else {
            return Err(unreachable_error(&ep));
        };

        let mut forced = Vec::new();
        for address in local_addresses {
            let member = group.members.iter().find(|m| {
                state.servers.get(*m).is_some_and(|s| {
                    s.var("group_replication_local_address") == *address
                        && state.is_online_in(m, &group.name)
                })
            });
            match member {
                Some(m) => forced.push(m.clone()),
                None => {
                    return Err(server_error(
                        &ep,
                        codes::WRONG_VALUE_FOR_VAR,
                        format!(
                            "The group_replication_force_members value '{}' contains an unreachable address",
                            local_addresses.join(",")
                        ),
                    ));
                }
            }
        }
        if !forced.contains(&ep) {
            return Err(server_error(
                &ep,
                codes::WRONG_VALUE_FOR_VAR,
                "The group_replication_force_members value must include the local member",
            ));
        }
        group.members = forced;
        state.groups.insert(key.clone(), group);
        state.reconcile_group(&key);
        Ok(())
    }

    async fn switch_to_multi_primary(&mut self) -> ClientResult<()> {
        let mut state = self.sandbox.lock();
        let key = self.group_key_of(&state)?;
        let Some(mut group) = state.groups.get(&key).cloned() else {
            return Err(unreachable_error(&self.endpoint));
        };
        group.single_primary = false;
        group.primary = None;
        for member in state.online_members(&group) {
            if let Some(server) = state.servers.get_mut(&member) {
                server.sysvars.insert(
                    "group_replication_single_primary_mode".to_string(),
                    "OFF".to_string(),
                );
                server.sysvars.insert(
                    "group_replication_enforce_update_everywhere_checks".to_string(),
                    "ON".to_string(),
                );
            }
        }
        state.groups.insert(key, group);
        Ok(())
    }

    async fn switch_to_single_primary(&mut self, primary_uuid: Option<&str>) -> ClientResult<()> {
        let mut state = self.sandbox.lock();
        let key = self.group_key_of(&state)?;
        let Some(mut group) = state.groups.get(&key).cloned() else {
            return Err(unreachable_error(&self.endpoint));
        };
        group.single_primary = true;
        group.primary = match primary_uuid {
            Some(uuid) => Some(Self::uuid_to_endpoint(&state, uuid).ok_or_else(|| {
                server_error(
                    &self.endpoint,
                    codes::WRONG_VALUE_FOR_VAR,
                    format!("The requested uuid '{uuid}' is not a group member"),
                )
            })?),
            None => state.elect_primary(&group),
        };
        for member in state.online_members(&group) {
            if let Some(server) = state.servers.get_mut(&member) {
                server.sysvars.insert(
                    "group_replication_single_primary_mode".to_string(),
                    "ON".to_string(),
                );
                server.sysvars.insert(
                    "group_replication_enforce_update_everywhere_checks".to_string(),
                    "OFF".to_string(),
                );
            }
        }
        state.groups.insert(key, group);
        Ok(())
    }

    async fn set_as_primary(&mut self, uuid: &str) -> ClientResult<()> {
        let mut state = self.sandbox.lock();
        let key = self.group_key_of(&state)?;
        let target = Self::uuid_to_endpoint(&state, uuid);
        let Some(group) = state.groups.get(&key).cloned() else {
            return Err(unreachable_error(&self.endpoint));
        };
        match target {
            Some(t) if group.single_primary && state.online_members(&group).contains(&t) => {
                if let Some(g) = state.groups.get_mut(&key) {
                    g.primary = Some(t);
                }
                Ok(())
            }
            _ => Err(server_error(
                &self.endpoint,
                codes::WRONG_VALUE_FOR_VAR,
                format!("The requested member '{uuid}' cannot be elected primary"),
            )),
        }
    }

    async fn gtid_executed(&mut self) -> ClientResult<GtidSet> {
        let state = self.sandbox.lock();
        Ok(state.server(&self.endpoint)?.gtid_executed.clone())
    }

    async fn wait_for_gtid_set(
        &mut self,
        gtid_set: &GtidSet,
        _timeout: Duration,
    ) -> ClientResult<bool> {
        let state = self.sandbox.lock();
        let server = state.server(&self.endpoint)?;
        Ok(!server.apply_lag && gtid_set.is_subset_of(&server.gtid_executed))
    }

    async fn replication_channels(&mut self) -> ClientResult<Vec<ReplicationChannel>> {
        let state = self.sandbox.lock();
        Ok(state.server(&self.endpoint)?.channels.clone())
    }

    async fn metadata_schema_exists(&mut self) -> ClientResult<bool> {
        let state = self.sandbox.lock();
        Ok(state.server(&self.endpoint)?.metadata.is_some())
    }

    async fn load_metadata(&mut self) -> ClientResult<Option<MetadataSnapshot>> {
        let state = self.sandbox.lock();
        Ok(state.server(&self.endpoint)?.metadata.clone())
    }

    async fn store_metadata(&mut self, snapshot: &MetadataSnapshot) -> ClientResult<()> {
        let mut state = self.sandbox.lock();
        let ep = self.endpoint.clone();
        let server = state.server_mut(&ep)?;
        if server.fail_next_metadata_write {
            server.fail_next_metadata_write = false;
            return Err(ClientError::Metadata {
                endpoint: ep,
                message: "Lost connection to MySQL server during query".to_string(),
            });
        }
        if !state.is_writable(&ep) {
            return Err(server_error(
                &ep,
                codes::READ_ONLY,
                "The MySQL server is running with the --super-read-only option so it cannot execute this statement",
            ));
        }
        state.replicate_write(&ep, Some(snapshot.clone()));
        Ok(())
    }

    async fn drop_metadata_schema(&mut self) -> ClientResult<()> {
        let mut state = self.sandbox.lock();
        let ep = self.endpoint.clone();
        state.server(&ep)?;
        if !state.is_writable(&ep) {
            return Err(server_error(
                &ep,
                codes::READ_ONLY,
                "The MySQL server is running with the --super-read-only option so it cannot execute this statement",
            ));
        }
        state.replicate_write(&ep, None);
        Ok(())
    }
}

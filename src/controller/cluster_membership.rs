//! Membership changes of a cluster.
//!
//! Add, remove and rejoin share one shape: open the anchor through the gate,
//! ask the lifecycle state machine whether the target may take the requested
//! step, push the group replication settings, drive the live change and only
//! then write the metadata. The one exception is removal, which drops the
//! record first so the change replicates to the leaving member.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{debug, info, instrument, warn};

use crate::client::{
    Connector, InstanceDef, InstanceSession, MemberState, ServerVersion, VarScope,
};
use crate::controller::cluster::{Cluster, Opened};
use crate::controller::config_plan::{ConfigPlan, PlanFailure, durable_scope, warn_unpersisted};
use crate::controller::context::{OperationReport, Reported, endpoint_def};
use crate::controller::error::{Error, Result};
use crate::controller::instance_lifecycle::{
    InstanceStateMachine, LifecycleEvent, LifecycleState, TransitionContext, TransitionResult,
    join_progress,
};
use crate::controller::options::{
    GrSettings, OptionTarget, OptionValue, SINGLE_PRIMARY_AUTO_INCREMENT,
    multi_primary_auto_increment,
};
use crate::controller::preconditions::{GateOptions, Operation, check};
use crate::controller::session_mode::{SessionMode, classify_session};
use crate::controller::validation::{check_compliance, validate_label};
use crate::metadata::{
    ClusterRecord, InstanceRecord, MetadataSnapshot, MetadataStore, ROLE_HA, TopologyType,
};

/// Options of `addInstance`.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AddInstanceOptions {
    pub label: Option<String>,
    pub password: Option<String>,
    pub member_ssl_mode: Option<OptionValue>,
    pub ip_whitelist: Option<OptionValue>,
    pub local_address: Option<OptionValue>,
    pub group_seeds: Option<OptionValue>,
    pub member_weight: Option<OptionValue>,
    pub exit_state_action: Option<OptionValue>,
    pub auto_rejoin_tries: Option<OptionValue>,
}

impl AddInstanceOptions {
    pub const KEYS: &'static [&'static str] = &[
        "label",
        "password",
        "memberSslMode",
        "ipWhitelist",
        "localAddress",
        "groupSeeds",
        "memberWeight",
        "exitStateAction",
        "autoRejoinTries",
    ];

    fn settings(&self) -> Result<GrSettings> {
        GrSettings::collect(
            &[
                ("memberSslMode", self.member_ssl_mode.as_ref()),
                ("ipWhitelist", self.ip_whitelist.as_ref()),
                ("localAddress", self.local_address.as_ref()),
                ("groupSeeds", self.group_seeds.as_ref()),
                ("memberWeight", self.member_weight.as_ref()),
                ("exitStateAction", self.exit_state_action.as_ref()),
                ("autoRejoinTries", self.auto_rejoin_tries.as_ref()),
            ],
            OptionTarget::Add,
        )
    }
}

/// Options of `removeInstance`.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoveInstanceOptions {
    pub password: Option<String>,
    pub force: Option<bool>,
}

impl RemoveInstanceOptions {
    pub const KEYS: &'static [&'static str] = &["password", "force"];
}

/// Options of `rejoinInstance`.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RejoinInstanceOptions {
    pub password: Option<String>,
    pub member_ssl_mode: Option<OptionValue>,
    pub ip_whitelist: Option<OptionValue>,
}

impl RejoinInstanceOptions {
    pub const KEYS: &'static [&'static str] = &["password", "memberSslMode", "ipWhitelist"];

    fn settings(&self) -> Result<GrSettings> {
        GrSettings::collect(
            &[
                ("memberSslMode", self.member_ssl_mode.as_ref()),
                ("ipWhitelist", self.ip_whitelist.as_ref()),
            ],
            OptionTarget::Rejoin,
        )
    }
}

/// Options of `dissolve`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct DissolveOptions {
    pub force: Option<bool>,
}

impl DissolveOptions {
    pub const KEYS: &'static [&'static str] = &["force"];
}

/// `"auto"` or an explicit list of endpoints.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(untagged)]
pub enum InstanceSelection {
    Keyword(String),
    List(Vec<String>),
}

impl InstanceSelection {
    pub fn auto() -> Self {
        InstanceSelection::Keyword("auto".to_string())
    }

    /// The candidates this selection picks.
    fn select(&self, option: &str, candidates: &[String], not_candidate: &str) -> Result<Vec<String>> {
        match self {
            InstanceSelection::Keyword(k) if k.eq_ignore_ascii_case("auto") => {
                Ok(candidates.to_vec())
            }
            InstanceSelection::Keyword(_) => Err(Error::Argument(format!(
                "Option '{option}' only accepts 'auto' as a valid string value, otherwise a list \
                 of instances is expected."
            ))),
            InstanceSelection::List(items) => items
                .iter()
                .map(|item| {
                    let endpoint = item
                        .parse::<InstanceDef>()
                        .map(|d| d.endpoint())
                        .unwrap_or_else(|_| item.clone());
                    if candidates.contains(&endpoint) {
                        Ok(endpoint)
                    } else {
                        Err(Error::Argument(format!(
                            "Invalid value '{item}' for '{option}' option: {not_candidate}"
                        )))
                    }
                })
                .collect(),
        }
    }
}

/// Options of `rescan`.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RescanOptions {
    pub add_instances: Option<InstanceSelection>,
    pub remove_instances: Option<InstanceSelection>,
}

impl RescanOptions {
    pub const KEYS: &'static [&'static str] = &["addInstances", "removeInstances"];
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DiscoveredInstance {
    pub member_id: String,
    pub host: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UnavailableInstance {
    pub member_id: String,
    pub label: String,
    pub host: String,
}

/// Differences `rescan` found between the live group and the metadata.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RescanReport {
    pub name: String,
    pub newly_discovered_instances: Vec<DiscoveredInstance>,
    pub unavailable_instances: Vec<UnavailableInstance>,
    /// Mode the metadata was corrected to.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub updated_topology_mode: Option<String>,
}

const CATCH_UP_FAILED_FORCED: &str = "An error occured when trying to catch up with cluster \
                                      transactions and the instance might have been left in an \
                                      inconsistent state that will lead to errors if it is reused.";

fn catch_up_failed(endpoint: &str) -> String {
    format!(
        "The instance '{endpoint}' was unable to catch up with cluster transactions. There might \
         be too many transactions to apply or some replication error. In the former case, you can \
         retry the operation (using a higher timeout value by setting the global shell option \
         'dba.gtidWaitTimeout'). In the later case, analyze and fix any replication error. You \
         can also choose to skip this error using the 'force: true' option, but it might leave \
         the instance in an inconsistent state and lead to errors if you want to reuse it."
    )
}

pub(crate) fn not_a_member(endpoint: &str, replica_set: &str) -> Error {
    Error::Runtime(format!(
        "The instance '{endpoint}' does not belong to the ReplicaSet: '{replica_set}'."
    ))
}

/// Warning for members whose membership settings only changed at runtime.
pub(crate) fn persist_warning(endpoint: &str, version: &ServerVersion) -> String {
    format!(
        "On instance '{endpoint}' membership change cannot be persisted since MySQL version \
         {version} does not support the SET PERSIST command (MySQL version >= 8.0.11 required). \
         Please use the <Dba>.configureLocalInstance() command locally to persist the changes."
    )
}

/// `group_replication_local_address` derived from the classic port.
pub(crate) fn default_local_address(def: &InstanceDef) -> Result<String> {
    let port = u32::from(def.port) * 10 + 1;
    if port > u32::from(u16::MAX) {
        return Err(Error::Argument(
            "Automatically generated port for localAddress falls out of valid range. The port \
             must be an integer between 1 and 65535. Please use the localAddress option to \
             manually set a valid value."
                .to_string(),
        ));
    }
    Ok(format!("{}:{port}", def.host))
}

/// Member SSL mode a joining instance must use.
pub(crate) fn resolve_member_ssl_mode(
    requested: Option<&str>,
    cluster_mode: &str,
    endpoint: &str,
) -> Result<String> {
    match requested {
        None | Some("AUTO") => Ok(cluster_mode.to_string()),
        Some(mode) if mode == cluster_mode => Ok(mode.to_string()),
        Some(_) if cluster_mode == "REQUIRED" => Err(Error::Runtime(format!(
            "The cluster has SSL (encryption) enabled. To add the instance '{endpoint}' to the \
             cluster either disable SSL on the cluster, remove the memberSslMode option or use it \
             with any of 'AUTO' or 'REQUIRED'."
        ))),
        Some(_) => Err(Error::Runtime(format!(
            "The cluster has SSL (encryption) disabled. To add the instance '{endpoint}' to the \
             cluster either enable SSL on the cluster, remove the memberSslMode option or use it \
             with any of 'AUTO' or 'DISABLED'."
        ))),
    }
}

/// Settings that make an instance join `cluster`'s group.
pub(crate) struct JoinPlan<'a> {
    pub endpoint: &'a str,
    pub cluster: &'a ClusterRecord,
    pub local_address: &'a str,
    pub seeds: &'a str,
    pub ssl_mode: &'a str,
    pub auto_increment: (u64, u64),
    pub extra: &'a GrSettings,
    pub scope: VarScope,
}

impl JoinPlan<'_> {
    pub fn build(&self) -> ConfigPlan {
        let single_primary = self.cluster.topology_type().is_single_primary();
        let (increment, offset) = self.auto_increment;
        let (increment, offset) = (increment.to_string(), offset.to_string());
        let base = [
            ("group_replication_group_name", self.cluster.group_name.as_str()),
            ("group_replication_local_address", self.local_address),
            ("group_replication_group_seeds", self.seeds),
            ("group_replication_ssl_mode", self.ssl_mode),
            (
                "group_replication_single_primary_mode",
                if single_primary { "ON" } else { "OFF" },
            ),
            (
                "group_replication_enforce_update_everywhere_checks",
                if single_primary { "OFF" } else { "ON" },
            ),
            ("auto_increment_increment", increment.as_str()),
            ("auto_increment_offset", offset.as_str()),
        ];

        let mut plan = ConfigPlan::new();
        let mut seen = BTreeSet::new();
        for (variable, value) in base.into_iter().chain(self.extra.variables()) {
            if seen.insert(variable) {
                plan.push(self.endpoint, variable, value, self.scope);
            }
        }
        plan.push(self.endpoint, "group_replication_start_on_boot", "ON", self.scope);
        plan
    }
}

impl<C: Connector> Cluster<C> {
    /// Poll the anchor's view until the joining member completes or fails.
    async fn wait_for_join(
        &self,
        uuid: &str,
        endpoint: &str,
        clone: bool,
    ) -> Result<(LifecycleEvent, Option<MemberState>)> {
        let timeout = self.ctx.config.join_timeout;
        let deadline = Instant::now() + timeout;
        let mut anchor = self.ctx.connect(&self.anchor).await?;
        loop {
            let live = anchor
                .group_members()
                .await?
                .into_iter()
                .find(|m| m.uuid == uuid)
                .map(|m| m.state);
            if let Some(event) = join_progress(live, clone) {
                debug!(endpoint, ?live, %event, "Join progressed");
                return Ok((event, live));
            }
            if Instant::now() >= deadline {
                return Err(Error::Timeout {
                    operation: format!(
                        "Waiting for instance '{endpoint}' to finish distributed recovery"
                    ),
                    duration: timeout,
                });
            }
            self.ctx.pause().await;
        }
    }

    /// Check the outcome of a join against the lifecycle machine.
    fn confirm_join(
        &self,
        endpoint: &str,
        recorded_members: usize,
        outcome: (LifecycleEvent, Option<MemberState>),
        clone: bool,
    ) -> Result<()> {
        let (event, live) = outcome;
        let ctx = TransitionContext::new(recorded_members, live).with_clone(clone);
        match InstanceStateMachine::new().transition(LifecycleState::Joining, event, &ctx) {
            TransitionResult::Success {
                event: LifecycleEvent::JoinCompleted,
                ..
            } => Ok(()),
            _ => Err(Error::Runtime(format!(
                "The instance '{endpoint}' failed to join the group: distributed recovery ended \
                 in state {}.",
                live.map_or_else(|| "(MISSING)".to_string(), |s| s.to_string())
            ))),
        }
    }

    /// Point every reachable member's seeds at the other members.
    pub(crate) async fn refresh_seeds(&self, members: &[InstanceRecord], report: &mut OperationReport) {
        for member in members {
            let seeds: Vec<&str> = members
                .iter()
                .filter(|m| m.uuid != member.uuid && !m.local_address.is_empty())
                .map(|m| m.local_address.as_str())
                .collect();
            let mut session = match self
                .ctx
                .connect_endpoint(&member.endpoint, &self.anchor)
                .await
            {
                Ok(session) => session,
                Err(e) => {
                    debug!(endpoint = %member.endpoint, error = %e, "Seeds not refreshed");
                    continue;
                }
            };
            let version = match session.server_info().await {
                Ok(info) => info.version,
                Err(e) => {
                    debug!(endpoint = %member.endpoint, error = %e, "Seeds not refreshed");
                    continue;
                }
            };
            let persist = version.supports_persist();
            if let Err(e) = session
                .set_sysvar(
                    "group_replication_group_seeds",
                    &seeds.join(","),
                    durable_scope(persist),
                )
                .await
            {
                report.warn(format!(
                    "Unable to update the group seeds of instance '{}': {e}",
                    member.endpoint
                ));
            } else if !persist {
                report.warn(persist_warning(&member.endpoint, &version));
            }
        }
    }

    /// Write `snapshot` back through the writer after a failed change.
    async fn restore_metadata(
        &self,
        opened: &Opened<C::Session>,
        snapshot: &MetadataSnapshot,
    ) -> Result<()> {
        let mut writer = self.writer(opened.snapshot()).await?;
        MetadataStore::new(&mut writer).commit(snapshot).await?;
        warn!(cluster = %self.name, "Metadata change undone");
        Ok(())
    }

    /// Add an instance to the cluster.
    #[instrument(skip(self, options), fields(cluster = %self.name, instance = %instance.endpoint()))]
    pub async fn add_instance(
        &self,
        instance: &InstanceDef,
        options: AddInstanceOptions,
    ) -> Result<OperationReport> {
        self.ensure_connected()?;
        let settings = options.settings()?;
        if let Some(label) = &options.label {
            validate_label(label)?;
        }
        let mut report = OperationReport::new();
        let mut opened = self
            .open(Operation::AddInstance, &GateOptions::default(), &mut report)
            .await?;

        let endpoint = instance.endpoint();
        let label = options.label.clone().unwrap_or_else(|| endpoint.clone());
        if opened.record.find_by_label(&label).is_some() {
            return Err(Error::Argument(format!(
                "An instance with label '{label}' is already part of this InnoDB cluster"
            )));
        }

        let target_def = self
            .credentials_for(instance)
            .with_password(options.password.as_deref());
        let mut target = self.ctx.connect(&target_def).await?;
        let target_info = classify_session(&mut target).await?;
        let uuid = target_info.server.uuid.clone();

        let recorded = opened.record.find_by_uuid(&uuid).is_some()
            || opened.record.find_by_endpoint(&endpoint).is_some();
        let live = opened.snapshot().member_by_uuid(&uuid).and_then(|m| m.live_state);
        let state = LifecycleState::derive(recorded, live);
        let machine = InstanceStateMachine::new();
        let recorded_members = opened.record.instances().len();
        if !machine
            .transition(
                state,
                LifecycleEvent::AddRequested,
                &TransitionContext::new(recorded_members, live),
            )
            .is_success()
        {
            return Err(Error::Runtime(format!(
                "The instance '{endpoint}' is already part of this InnoDB cluster"
            )));
        }
        match (&target_info.cluster, target_info.mode) {
            (_, SessionMode::UnmanagedGroup) => {
                return Err(Error::Runtime(format!(
                    "The instance '{endpoint}' is already part of another Replication Group"
                )));
            }
            (Some(other), _) if other.name != self.name => {
                return Err(Error::Runtime(format!(
                    "The instance '{endpoint}' is already part of another InnoDB cluster"
                )));
            }
            (Some(_), _) if target_info.group_active() => {
                return Err(Error::Runtime(format!(
                    "The instance '{endpoint}' is already part of this InnoDB cluster but is not \
                     recorded in the metadata. Use <Cluster>.rescan() to repair the metadata."
                )));
            }
            _ => {}
        }

        // Server identity must be unique among active members.
        if let Some(twin) = opened
            .snapshot()
            .member_by_uuid(&uuid)
            .filter(|m| m.is_active())
        {
            return Err(Error::Runtime(format!(
                "Cannot add an instance with the same server UUID ({uuid}) of an active member \
                 of the cluster '{}'. Please change the server UUID of the instance to add, all \
                 members must have a unique server UUID.",
                twin.endpoint
            )));
        }
        let server_id = target_info.server.server_id;
        let online: Vec<String> = opened.snapshot().online().map(|m| m.endpoint.clone()).collect();
        for member in online {
            let mut session = self.ctx.connect_endpoint(&member, &self.anchor).await?;
            if session.server_info().await?.server_id == server_id {
                return Err(Error::Runtime(format!(
                    "Cannot add an instance with the same server id ({server_id}) of an active \
                     member of the cluster: '{member}'."
                )));
            }
        }

        let version = target_info.server.version.clone();
        settings.check_version(&version)?;

        let compliance = check_compliance(&mut target).await?;
        if !compliance.is_ok() {
            report.warn(compliance.render());
            return Err(Error::Runtime("Instance check failed".to_string()));
        }

        let group_gtids = opened.session.gtid_executed().await?;
        let target_gtids = target.gtid_executed().await?;
        let errant = target_gtids.difference(&group_gtids);
        if !errant.is_empty() {
            return Err(Error::Runtime(format!(
                "The instance '{endpoint}' has the following errant GTIDs that do not exist in \
                 the cluster: {errant}"
            )));
        }

        let local_address = match settings.get("localAddress") {
            Some(address) => address.to_string(),
            None => default_local_address(&target_def)?,
        };
        let seeds = match settings.get("groupSeeds") {
            Some(seeds) => seeds.to_string(),
            None => opened
                .record
                .instances()
                .iter()
                .map(|i| i.local_address.as_str())
                .filter(|a| !a.is_empty())
                .collect::<Vec<_>>()
                .join(","),
        };
        let ssl_mode = resolve_member_ssl_mode(
            settings.get("memberSslMode"),
            &opened.record.ssl_mode,
            &endpoint,
        )?;
        let auto_increment = if opened.record.topology_type().is_single_primary() {
            SINGLE_PRIMARY_AUTO_INCREMENT
        } else {
            multi_primary_auto_increment(recorded_members + 1, server_id)
        };
        let plan = JoinPlan {
            endpoint: &endpoint,
            cluster: &opened.record,
            local_address: &local_address,
            seeds: &seeds,
            ssl_mode: &ssl_mode,
            auto_increment,
            extra: &settings,
            scope: durable_scope(version.supports_persist()),
        }
        .build();
        plan.apply_local(&mut target)
            .await
            .map_err(PlanFailure::into_error)?;
        warn_unpersisted(&plan, &mut report);

        let clone = !opened.record.disable_clone
            && version.supports_clone()
            && target_gtids.is_empty()
            && !group_gtids.is_empty();
        info!(%endpoint, clone, "Joining instance to the group");
        target.start_group_replication(false).await?;
        let outcome = self.wait_for_join(&uuid, &endpoint, clone).await?;
        self.confirm_join(&endpoint, recorded_members, outcome, clone)?;
        if outcome.1 == Some(MemberState::Recovering) {
            report.note(format!(
                "The instance '{endpoint}' is being provisioned through clone and will show as \
                 RECOVERING until the state transfer completes."
            ));
        }

        let new_record = InstanceRecord {
            id: opened
                .info
                .metadata
                .as_ref()
                .map_or(1, MetadataSnapshot::next_instance_id),
            uuid,
            endpoint: endpoint.clone(),
            label,
            role: ROLE_HA.to_string(),
            local_address,
        };
        let mut members = opened.record.instances().to_vec();
        members.push(new_record.clone());
        self.update_metadata(opened.snapshot(), move |cluster| {
            cluster.default_replica_set.instances.push(new_record);
            Ok(())
        })
        .await
        .map_err(|e| {
            Error::Metadata(format!(
                "The instance '{endpoint}' joined the group but its metadata record could not be \
                 written: {e}. Use <Cluster>.rescan() to repair the metadata."
            ))
        })?;

        self.refresh_seeds(&members, &mut report).await;
        report.note(format!(
            "The instance '{endpoint}' was successfully added to the cluster."
        ));
        Ok(report)
    }

    /// Remove an instance from the cluster.
    ///
    /// With `force`, an unreachable instance is dropped from the metadata only
    /// and a failed catch-up is downgraded to a warning.
    #[instrument(skip(self, options), fields(cluster = %self.name, instance = %instance.endpoint()))]
    pub async fn remove_instance(
        &mut self,
        instance: &InstanceDef,
        options: RemoveInstanceOptions,
    ) -> Result<OperationReport> {
        self.ensure_connected()?;
        let force = options.force.unwrap_or(false);
        let mut report = OperationReport::new();
        let mut opened = self
            .open(Operation::RemoveInstance, &GateOptions::default(), &mut report)
            .await?;

        let endpoint = instance.endpoint();
        let Some(record) = opened.record.find_by_endpoint(&endpoint).cloned() else {
            return Err(not_a_member(&endpoint, opened.replica_set_name()));
        };
        let member = opened.snapshot().member_by_uuid(&record.uuid);
        let live = member.and_then(|m| m.live_state);
        let status = member.map_or_else(|| "(MISSING)".to_string(), |m| m.display_status());
        let state = LifecycleState::derive(true, live);

        let target_def = self
            .credentials_for(instance)
            .with_password(options.password.as_deref());
        let target = match self.ctx.connect(&target_def).await {
            Ok(session) => Some(session),
            Err(e) => {
                debug!(%endpoint, error = %e, "Instance to remove is not reachable");
                None
            }
        };
        let leavable = matches!(state, LifecycleState::Online | LifecycleState::RecoveryFailed);
        let event = match (&target, leavable, force) {
            (Some(_), true, _) => LifecycleEvent::GracefulRemove,
            (_, _, true) => LifecycleEvent::ForceRemoved,
            (None, true, false) => {
                return Err(Error::Runtime(format!(
                    "Unable to connect to instance '{endpoint}'. Please, verify connection \
                     credentials and make sure the instance is available."
                )));
            }
            _ => LifecycleEvent::GracefulRemove,
        };

        let ctx = TransitionContext::new(opened.record.instances().len(), live);
        match InstanceStateMachine::new().transition(state, event, &ctx) {
            TransitionResult::Success { description, .. } => debug!(%event, description),
            TransitionResult::GuardFailed { .. } => {
                return Err(Error::Logic(format!(
                    "The instance '{endpoint}' cannot be removed because it is the only member of \
                     the Cluster. Please use <Cluster>.dissolve() instead to remove the last \
                     instance and dissolve the Cluster."
                )));
            }
            TransitionResult::InvalidTransition { .. } => {
                return Err(Error::Runtime(format!(
                    "The instance '{endpoint}' cannot be removed because it is on a '{status}' \
                     state. Please bring the instance back ONLINE and try to remove it again. If \
                     the instance is permanently not reachable, then please use \
                     <Cluster>.removeInstance() with the force option set to true to proceed with \
                     the operation and only remove the instance from the Cluster Metadata."
                )));
            }
        }

        let uuid = record.uuid.clone();
        let remaining: Vec<InstanceRecord> = opened
            .record
            .instances()
            .iter()
            .filter(|i| i.uuid != uuid)
            .cloned()
            .collect();
        let drop_record = |cluster: &mut ClusterRecord| {
            cluster
                .default_replica_set
                .instances
                .retain(|i| i.uuid != uuid);
            Ok(())
        };

        match (event, target) {
            (LifecycleEvent::GracefulRemove, Some(mut target)) => {
                let version = target.server_info().await?.version;
                let before = {
                    let mut writer = self.writer(opened.snapshot()).await?;
                    MetadataStore::new(&mut writer)
                        .update_cluster(&self.name, drop_record)
                        .await?
                };

                let group_gtids = opened.session.gtid_executed().await?;
                let timeout = self.ctx.config.gtid_wait_timeout;
                match target.wait_for_gtid_set(&group_gtids, timeout).await {
                    Ok(true) => {}
                    Ok(false) | Err(_) if force => report.warn(CATCH_UP_FAILED_FORCED),
                    Ok(false) => {
                        self.restore_metadata(&opened, &before).await?;
                        return Err(Error::Timeout {
                            operation: catch_up_failed(&endpoint),
                            duration: timeout,
                        });
                    }
                    Err(e) => {
                        self.restore_metadata(&opened, &before).await?;
                        return Err(e.into());
                    }
                }

                let persist = version.supports_persist();
                let left = async {
                    target
                        .set_sysvar("group_replication_start_on_boot", "OFF", durable_scope(persist))
                        .await?;
                    target.stop_group_replication().await
                }
                .await;
                match left {
                    Ok(()) if !persist => report.warn(persist_warning(&endpoint, &version)),
                    Ok(()) => {}
                    Err(e) if force => report.warn(format!(
                        "The instance '{endpoint}' could not leave the group: {e}"
                    )),
                    Err(e) => {
                        self.restore_metadata(&opened, &before).await?;
                        return Err(e.into());
                    }
                }
            }
            _ => {
                report.warn(format!(
                    "The instance '{endpoint}' is not reachable and it will only be removed from \
                     the metadata. Please take any necessary actions to make sure that the \
                     instance will not rejoin the cluster if brought back online."
                ));
                self.update_metadata(opened.snapshot(), drop_record).await?;
            }
        }
        info!(%endpoint, %event, "Instance removed");

        if endpoint == self.anchor.endpoint()
            && let Some(next) = opened
                .snapshot()
                .recorded()
                .find(|m| m.is_online() && m.uuid != record.uuid)
        {
            self.anchor = endpoint_def(&next.endpoint, &self.anchor)?;
            debug!(anchor = %self.anchor.endpoint(), "Anchor moved");
        }
        self.refresh_seeds(&remaining, &mut report).await;
        report.note(format!(
            "The instance '{endpoint}' was successfully removed from the cluster."
        ));
        Ok(report)
    }

    /// Bring a recorded member that left the group back into it.
    #[instrument(skip(self, options), fields(cluster = %self.name, instance = %instance.endpoint()))]
    pub async fn rejoin_instance(
        &self,
        instance: &InstanceDef,
        options: RejoinInstanceOptions,
    ) -> Result<OperationReport> {
        self.ensure_connected()?;
        let settings = options.settings()?;
        let mut report = OperationReport::new();
        let mut opened = self
            .open(Operation::RejoinInstance, &GateOptions::default(), &mut report)
            .await?;

        let endpoint = instance.endpoint();
        let replica_set = opened.replica_set_name().to_string();
        let Some(record) = opened.record.find_by_endpoint(&endpoint).cloned() else {
            return Err(not_a_member(&endpoint, &replica_set));
        };
        let member = opened.snapshot().member_by_uuid(&record.uuid);
        let live = member.and_then(|m| m.live_state);
        let recorded_members = opened.record.instances().len();
        let ctx = TransitionContext::new(recorded_members, live);
        let state = LifecycleState::derive(true, live);
        if !InstanceStateMachine::new()
            .transition(state, LifecycleEvent::RejoinRequested, &ctx)
            .is_success()
        {
            let status = member.map_or_else(|| "(MISSING)".to_string(), |m| m.display_status());
            return Err(Error::Runtime(format!(
                "Cannot rejoin instance '{endpoint}' to the ReplicaSet '{replica_set}' since it is \
                 an active ({status}) member of the ReplicaSet."
            )));
        }

        let target_def = self
            .credentials_for(instance)
            .with_password(options.password.as_deref());
        let mut target = self.ctx.connect(&target_def).await?;
        let info = target.server_info().await?;
        if info.uuid != record.uuid {
            return Err(Error::Runtime(format!(
                "The instance '{endpoint}' has server UUID '{}' but the metadata records '{}' for \
                 it. Remove it from the cluster and add it again.",
                info.uuid, record.uuid
            )));
        }
        settings.check_version(&info.version)?;
        if !info.group_name.is_empty()
            && !info.group_name.eq_ignore_ascii_case(&opened.record.group_name)
        {
            return Err(Error::Runtime(format!(
                "The instance '{endpoint}' may belong to a different ReplicaSet as the one \
                 registered in the Metadata since the value of 'group_replication_group_name' \
                 does not match the one registered in the ReplicaSet's Metadata: possible \
                 split-brain scenario. Please remove the instance from the cluster."
            )));
        }

        if !target.group_members().await?.is_empty() {
            debug!(%endpoint, "Stopping group replication before rejoining");
            target.stop_group_replication().await?;
        }

        let running: Vec<String> = target
            .replication_channels()
            .await?
            .into_iter()
            .filter(|c| c.running)
            .map(|c| c.name)
            .collect();
        if !running.is_empty() {
            return Err(Error::Runtime(format!(
                "The instance '{endpoint}' is running asynchronous (master-slave) replication on \
                 channel(s) {}. Stop and reset them before rejoining the instance.",
                running.join(", ")
            )));
        }

        let group_gtids = opened.session.gtid_executed().await?;
        let target_gtids = target.gtid_executed().await?;
        let errant = target_gtids.difference(&group_gtids);
        if !errant.is_empty() {
            return Err(Error::Runtime(format!(
                "The instance '{endpoint}' has the following errant GTIDs that do not exist in \
                 the cluster: {errant}"
            )));
        }

        let others: Vec<&str> = opened
            .record
            .instances()
            .iter()
            .filter(|i| i.uuid != record.uuid && !i.local_address.is_empty())
            .map(|i| i.local_address.as_str())
            .collect();
        let seeds = others.join(",");
        let local_address = if record.local_address.is_empty() {
            default_local_address(&target_def)?
        } else {
            record.local_address.clone()
        };
        let ssl_mode = resolve_member_ssl_mode(
            settings.get("memberSslMode"),
            &opened.record.ssl_mode,
            &endpoint,
        )?;
        let auto_increment = if opened.record.topology_type().is_single_primary() {
            SINGLE_PRIMARY_AUTO_INCREMENT
        } else {
            multi_primary_auto_increment(recorded_members, info.server_id)
        };
        let plan = JoinPlan {
            endpoint: &endpoint,
            cluster: &opened.record,
            local_address: &local_address,
            seeds: &seeds,
            ssl_mode: &ssl_mode,
            auto_increment,
            extra: &settings,
            scope: durable_scope(info.version.supports_persist()),
        }
        .build();
        plan.apply_local(&mut target)
            .await
            .map_err(PlanFailure::into_error)?;
        warn_unpersisted(&plan, &mut report);

        let clone = !opened.record.disable_clone
            && info.version.supports_clone()
            && target_gtids.is_empty()
            && !group_gtids.is_empty();
        info!(%endpoint, "Rejoining instance to the group");
        target.start_group_replication(false).await?;
        let outcome = self.wait_for_join(&record.uuid, &endpoint, clone).await?;
        self.confirm_join(&endpoint, recorded_members, outcome, clone)?;

        self.refresh_seeds(opened.record.instances(), &mut report).await;
        report.note(format!(
            "The instance '{endpoint}' was successfully rejoined on the cluster."
        ));
        Ok(report)
    }

    /// Restore quorum from the partition `instance` belongs to.
    ///
    /// Members outside the partition are not contacted and show as missing
    /// afterwards. The handle is re-anchored on `instance`.
    #[instrument(skip(self, password), fields(cluster = %self.name, instance = %instance.endpoint()))]
    pub async fn force_quorum_using_partition_of(
        &mut self,
        instance: &InstanceDef,
        password: Option<&str>,
    ) -> Result<OperationReport> {
        self.ensure_connected()?;
        let mut report = OperationReport::new();
        let def = self.credentials_for(instance).with_password(password);
        let endpoint = def.endpoint();
        let mut session = self.ctx.connect(&def).await?;
        let info = classify_session(&mut session).await?;
        if let Some(warning) =
            check(Operation::ForceQuorumUsingPartitionOf, &info, &GateOptions::default())
                .into_result()?
        {
            report.warn(warning);
        }
        let record = match &info.cluster {
            Some(cluster) if cluster.name == self.name => cluster.clone(),
            _ => {
                return Err(Error::Metadata(format!(
                    "The cluster with the name '{}' does not exist.",
                    self.name
                )));
            }
        };
        if !info.server.group_name.eq_ignore_ascii_case(&record.group_name) {
            return Err(Error::Runtime(format!(
                "The instance '{endpoint}' cannot be used to restore the cluster as it may belong \
                 to a different ReplicaSet as the one registered in the Metadata since the value \
                 of 'group_replication_group_name' does not match the one registered in the \
                 ReplicaSet's Metadata: possible split-brain scenario."
            )));
        }

        let own = info
            .snapshot
            .member_by_uuid(&info.server.uuid)
            .and_then(|m| m.live_state);
        if own != Some(MemberState::Online) {
            return Err(Error::Runtime(format!(
                "The instance '{endpoint}' cannot be used to restore the cluster as it is on a {} \
                 state, and should be ONLINE",
                own.map_or_else(|| "(MISSING)".to_string(), |s| s.to_string())
            )));
        }
        if info.snapshot.has_quorum() {
            report.warn(
                "Cannot perform operation on an healthy cluster because it can only be used to \
                 restore a cluster from quorum loss.",
            );
            return Err(Error::Runtime(format!(
                "The cluster has quorum according to instance '{endpoint}'"
            )));
        }

        let mut addresses = Vec::new();
        for member in info.snapshot.online() {
            let recorded = record
                .find_by_uuid(&member.uuid)
                .map(|r| r.local_address.clone())
                .filter(|a| !a.is_empty());
            let address = match recorded {
                Some(address) => address,
                None => {
                    let mut peer = self.ctx.connect_endpoint(&member.endpoint, &def).await?;
                    peer.get_sysvar("group_replication_local_address")
                        .await?
                        .unwrap_or_default()
                }
            };
            addresses.push(address);
        }
        if addresses.is_empty() {
            return Err(Error::Logic(
                "No online instances are visible from the given one.".to_string(),
            ));
        }

        report.warn(format!(
            "Restoring the InnoDB cluster to the partition of '{endpoint}'. Members outside \
             [{}] must not be brought back without rejoining them, otherwise a split-brain can \
             occur.",
            addresses.join(", ")
        ));
        session.force_members(&addresses).await?;
        info!(%endpoint, members = addresses.len(), "Group membership forced");

        self.anchor = def;
        report.note(format!(
            "Restoring replicaset '{}' from loss of quorum, by using the partition composed of \
             [{}] succeeded.",
            record.default_replica_set.name,
            addresses.join(", ")
        ));
        Ok(report)
    }

    /// Tear down the cluster: drop its metadata and stop group replication
    /// on every member.
    ///
    /// The handle is disconnected afterwards.
    #[instrument(skip(self, options), fields(cluster = %self.name))]
    pub async fn dissolve(&mut self, options: DissolveOptions) -> Result<OperationReport> {
        self.ensure_connected()?;
        let force = options.force.unwrap_or(false);
        let mut report = OperationReport::new();
        let opened = self
            .open(
                Operation::Dissolve,
                &GateOptions {
                    force,
                    ..Default::default()
                },
                &mut report,
            )
            .await?;

        for member in opened.snapshot().recorded().filter(|m| !m.is_online()) {
            let status = member.display_status();
            if !force {
                return Err(Error::Runtime(format!(
                    "The instance '{}' cannot be removed because it is on a '{status}' state. \
                     Please bring the instance back ONLINE and try to dissolve the cluster again. \
                     If the instance is permanently not reachable, then please use \
                     <Cluster>.dissolve() with the force option set to true to proceed with the \
                     operation and only remove the instance from the Cluster Metadata.",
                    member.endpoint
                )));
            }
            report.warn(format!(
                "The instance '{}' is on a '{status}' state and will only be removed from the \
                 metadata. Make sure it does not rejoin the group if brought back online.",
                member.endpoint
            ));
        }

        let mut writer = self.writer(opened.snapshot()).await?;
        let primary = writer.instance().endpoint();
        {
            let mut store = MetadataStore::new(&mut writer);
            let mut metadata = store.load().await?.unwrap_or_default();
            if metadata.clusters.iter().all(|c| c.name == self.name) {
                store.drop_schema().await?;
            } else {
                metadata.clusters.retain(|c| c.name != self.name);
                store.commit(&metadata).await?;
            }
        }
        let group_gtids = writer.gtid_executed().await?;
        drop(writer);

        // Secondaries leave first so the group keeps quorum until the end.
        let mut order: Vec<String> = opened
            .snapshot()
            .recorded()
            .filter(|m| m.is_online() && m.endpoint != primary)
            .map(|m| m.endpoint.clone())
            .collect();
        if opened.snapshot().member(&primary).is_some_and(|m| m.is_online()) {
            order.push(primary);
        }

        let timeout = self.ctx.config.gtid_wait_timeout;
        for endpoint in order {
            let mut session = self.ctx.connect_endpoint(&endpoint, &self.anchor).await?;
            let synced = session.wait_for_gtid_set(&group_gtids, timeout).await?;
            if !synced {
                if !force {
                    return Err(Error::Timeout {
                        operation: catch_up_failed(&endpoint),
                        duration: timeout,
                    });
                }
                report.warn(CATCH_UP_FAILED_FORCED);
            }
            let version = session.server_info().await?.version;
            session
                .set_sysvar(
                    "group_replication_start_on_boot",
                    "OFF",
                    durable_scope(version.supports_persist()),
                )
                .await?;
            session.stop_group_replication().await?;
            debug!(%endpoint, "Left the group");
        }

        self.connected = false;
        info!(cluster = %self.name, "Cluster dissolved");
        report.note("The cluster was successfully dissolved.");
        Ok(report)
    }

    /// Compare the live group with the metadata and repair the metadata.
    #[instrument(skip(self, options), fields(cluster = %self.name))]
    pub async fn rescan(&self, options: RescanOptions) -> Result<Reported<RescanReport>> {
        self.ensure_connected()?;
        let mut report = OperationReport::new();
        let opened = self
            .open(Operation::Rescan, &GateOptions::default(), &mut report)
            .await?;
        let snapshot = opened.snapshot();

        let discovered: Vec<DiscoveredInstance> = snapshot
            .unrecorded()
            .map(|m| DiscoveredInstance {
                member_id: m.uuid.clone(),
                host: m.endpoint.clone(),
            })
            .collect();
        let unavailable: Vec<UnavailableInstance> = snapshot
            .recorded()
            .filter(|m| m.is_missing())
            .map(|m| UnavailableInstance {
                member_id: m.uuid.clone(),
                label: m.display_label().to_string(),
                host: m.endpoint.clone(),
            })
            .collect();

        let candidates: Vec<String> = discovered.iter().map(|d| d.host.clone()).collect();
        let to_add = options
            .add_instances
            .as_ref()
            .map(|s| {
                s.select(
                    "addInstances",
                    &candidates,
                    "the instance is not a newly discovered member of the group.",
                )
            })
            .transpose()?
            .unwrap_or_default();
        let candidates: Vec<String> = unavailable.iter().map(|u| u.host.clone()).collect();
        let to_remove = options
            .remove_instances
            .as_ref()
            .map(|s| {
                s.select(
                    "removeInstances",
                    &candidates,
                    "the instance is not an unavailable member of the cluster.",
                )
            })
            .transpose()?
            .unwrap_or_default();

        for d in discovered.iter().filter(|d| !to_add.contains(&d.host)) {
            report.warn(format!(
                "A new instance '{}' was discovered in the cluster. Use the 'addInstances' option \
                 to add it to the metadata.",
                d.host
            ));
        }
        for u in unavailable.iter().filter(|u| !to_remove.contains(&u.host)) {
            report.warn(format!(
                "The instance '{}' is no longer part of the group. Use the 'removeInstances' \
                 option to remove it from the metadata.",
                u.host
            ));
        }

        let mut next_id = opened
            .info
            .metadata
            .as_ref()
            .map_or(1, MetadataSnapshot::next_instance_id);
        let mut additions = Vec::with_capacity(to_add.len());
        for endpoint in &to_add {
            let Some(member) = discovered.iter().find(|d| d.host == *endpoint) else {
                continue;
            };
            let mut session = self.ctx.connect_endpoint(endpoint, &self.anchor).await?;
            let local_address = session
                .get_sysvar("group_replication_local_address")
                .await?
                .unwrap_or_default();
            additions.push(InstanceRecord {
                id: next_id,
                uuid: member.member_id.clone(),
                endpoint: endpoint.clone(),
                label: endpoint.clone(),
                role: ROLE_HA.to_string(),
                local_address,
            });
            next_id += 1;
            report.note(format!("Adding instance to metadata: '{endpoint}'"));
        }
        for endpoint in &to_remove {
            report.note(format!("Removing instance from metadata: '{endpoint}'"));
        }

        let live_topology = TopologyType::from_single_primary(snapshot.single_primary);
        let topology_changed = live_topology != opened.record.topology_type();
        if topology_changed {
            report.note(format!(
                "The topology mode of the cluster changed to {live_topology}. Updating the \
                 metadata."
            ));
        }

        if !additions.is_empty() || !to_remove.is_empty() || topology_changed {
            let removed = to_remove.clone();
            self.update_metadata(snapshot, move |cluster| {
                let instances = &mut cluster.default_replica_set.instances;
                instances.retain(|i| !removed.contains(&i.endpoint));
                instances.extend(additions);
                cluster.default_replica_set.topology_type = live_topology;
                Ok(())
            })
            .await?;
            info!(
                added = to_add.len(),
                removed = to_remove.len(),
                topology_changed,
                "Metadata repaired"
            );
        }

        let doc = RescanReport {
            name: self.name.clone(),
            newly_discovered_instances: discovered,
            unavailable_instances: unavailable,
            updated_topology_mode: topology_changed.then(|| live_topology.to_string()),
        };
        Ok(Reported::new(doc, report))
    }
}

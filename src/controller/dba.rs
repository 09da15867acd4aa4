//! Top-level entry points.
//!
//! [`Dba`] creates, finds and reboots clusters and checks or fixes the
//! configuration of single instances. Every call names the instance it works
//! through; there is no default session.

use serde::Deserialize;
use tracing::{debug, info, instrument};

use crate::client::{Connector, InstanceDef, InstanceSession, VarScope};
use crate::controller::cluster::{Cluster, topology_mismatch};
use crate::controller::cluster_membership::{
    JoinPlan, RejoinInstanceOptions, default_local_address, persist_warning,
};
use crate::controller::config_plan::{ConfigPlan, PlanFailure, durable_scope, warn_unpersisted};
use crate::controller::context::{Context, OperationReport, Reported, endpoint_def};
use crate::controller::error::{Error, Result};
use crate::controller::options::{
    GrSettings, OptionTarget, OptionValue, SINGLE_PRIMARY_AUTO_INCREMENT,
    multi_primary_auto_increment,
};
use crate::controller::preconditions::{GateOptions, Operation, check};
use crate::controller::session_mode::{SessionContext, SessionMode, classify_session};
use crate::controller::validation::{ComplianceReport, check_compliance, validate_cluster_name};
use crate::metadata::{
    ClusterRecord, DEFAULT_REPLICA_SET, InstanceRecord, MetadataSnapshot, MetadataStore, ROLE_HA,
    ReplicaSetRecord, TopologyType,
};

fn super_read_only_error(endpoint: &str) -> Error {
    Error::Runtime(format!(
        "The MySQL instance at '{endpoint}' currently has the super_read_only system variable set \
         to protect it from inadvertent updates from applications. You must first unset it to be \
         able to perform any changes to this instance. Use the 'clearReadOnly' option to unset it \
         as part of the operation."
    ))
}

/// Options of `createCluster`.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateClusterOptions {
    pub member_ssl_mode: Option<OptionValue>,
    pub ip_whitelist: Option<OptionValue>,
    pub local_address: Option<OptionValue>,
    pub group_seeds: Option<OptionValue>,
    pub group_name: Option<OptionValue>,
    pub exit_state_action: Option<OptionValue>,
    pub member_weight: Option<OptionValue>,
    pub failover_consistency: Option<OptionValue>,
    pub consistency: Option<OptionValue>,
    pub expel_timeout: Option<OptionValue>,
    pub auto_rejoin_tries: Option<OptionValue>,
    pub disable_clone: Option<OptionValue>,
    pub multi_master: Option<bool>,
    pub multi_primary: Option<bool>,
    pub force: Option<bool>,
    #[serde(rename = "adoptFromGR")]
    pub adopt_from_gr: Option<bool>,
    pub clear_read_only: Option<bool>,
}

impl CreateClusterOptions {
    pub const KEYS: &'static [&'static str] = &[
        "memberSslMode",
        "ipWhitelist",
        "localAddress",
        "groupSeeds",
        "groupName",
        "exitStateAction",
        "memberWeight",
        "failoverConsistency",
        "consistency",
        "expelTimeout",
        "autoRejoinTries",
        "disableClone",
        "multiMaster",
        "multiPrimary",
        "force",
        "adoptFromGR",
        "clearReadOnly",
    ];

    fn multi_primary(&self) -> bool {
        self.multi_primary.or(self.multi_master).unwrap_or(false)
    }

    fn settings(&self) -> Result<GrSettings> {
        if self.failover_consistency.is_some() && self.consistency.is_some() {
            return Err(Error::Argument(
                "Cannot use the failoverConsistency and consistency options simultaneously. The \
                 failoverConsistency option is deprecated, please use the consistency option \
                 instead."
                    .to_string(),
            ));
        }
        let pairs = [
            ("memberSslMode", self.member_ssl_mode.as_ref()),
            ("ipWhitelist", self.ip_whitelist.as_ref()),
            ("localAddress", self.local_address.as_ref()),
            ("groupSeeds", self.group_seeds.as_ref()),
            ("groupName", self.group_name.as_ref()),
            ("exitStateAction", self.exit_state_action.as_ref()),
            ("memberWeight", self.member_weight.as_ref()),
            ("failoverConsistency", self.failover_consistency.as_ref()),
            ("consistency", self.consistency.as_ref()),
            ("expelTimeout", self.expel_timeout.as_ref()),
            ("autoRejoinTries", self.auto_rejoin_tries.as_ref()),
            ("disableClone", self.disable_clone.as_ref()),
        ];
        let settings = GrSettings::collect(&pairs, OptionTarget::Create)?;

        if self.adopt_from_gr.unwrap_or(false) {
            if self.multi_primary() {
                return Err(Error::Argument(
                    "Cannot use multiPrimary option if adoptFromGR is set to true. Using \
                     adoptFromGR mode will adopt the primary mode in use by the Cluster."
                        .to_string(),
                ));
            }
            let group_options: Vec<&str> = settings
                .entries
                .iter()
                .filter(|(spec, _)| spec.variable.is_some())
                .map(|(spec, _)| spec.name)
                .collect();
            if !group_options.is_empty() {
                return Err(Error::Argument(format!(
                    "Cannot use the {} option(s) if adoptFromGR is set to true.",
                    group_options.join(", ")
                )));
            }
        }
        if self.multi_primary() && !self.force.unwrap_or(false) {
            return Err(Error::Argument(
                "Use of multiPrimary mode is not recommended unless you understand the \
                 limitations. Please use the 'force' option if you understand and accept them."
                    .to_string(),
            ));
        }
        Ok(settings)
    }
}

/// Options of `getCluster`.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GetClusterOptions {
    /// Re-anchor on the primary. Defaults to true.
    pub connect_to_primary: Option<bool>,
}

impl GetClusterOptions {
    pub const KEYS: &'static [&'static str] = &["connectToPrimary"];
}

/// Options of `rebootClusterFromCompleteOutage`.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RebootOptions {
    pub rejoin_instances: Option<Vec<String>>,
    pub remove_instances: Option<Vec<String>>,
    pub password: Option<String>,
}

impl RebootOptions {
    pub const KEYS: &'static [&'static str] = &["rejoinInstances", "removeInstances", "password"];
}

/// Options of `dropMetadataSchema`.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DropMetadataOptions {
    pub force: Option<bool>,
    pub clear_read_only: Option<bool>,
}

impl DropMetadataOptions {
    pub const KEYS: &'static [&'static str] = &["force", "clearReadOnly"];
}

/// Options of `configureInstance`.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfigureInstanceOptions {
    pub password: Option<String>,
    /// Restart the server when a setting needs it.
    pub restart: Option<bool>,
    pub clear_read_only: Option<bool>,
}

impl ConfigureInstanceOptions {
    pub const KEYS: &'static [&'static str] = &["password", "restart", "clearReadOnly"];
}

/// Normalize a list of `host:port` strings given by the caller.
fn normalize_endpoints(items: &[String]) -> Result<Vec<String>> {
    items
        .iter()
        .map(|item| {
            item.parse::<InstanceDef>()
                .map(|d| d.endpoint())
                .map_err(|e| Error::Argument(format!("Invalid instance '{item}': {e}")))
        })
        .collect()
}

/// Entry point of the administration API.
#[derive(Debug, Clone)]
pub struct Dba<C: Connector> {
    ctx: Context<C>,
}

impl<C: Connector> Dba<C> {
    pub fn new(ctx: Context<C>) -> Self {
        Self { ctx }
    }

    pub fn context(&self) -> &Context<C> {
        &self.ctx
    }

    async fn open(
        &self,
        instance: &InstanceDef,
        operation: Operation,
        gate: &GateOptions,
        report: &mut OperationReport,
    ) -> Result<(C::Session, SessionContext)> {
        let mut session = self.ctx.connect(instance).await?;
        let info = classify_session(&mut session).await?;
        if let Some(warning) = check(operation, &info, gate).into_result()? {
            report.warn(warning);
        }
        debug!(%operation, mode = %info.mode, "Opened instance");
        Ok((session, info))
    }

    /// Create a cluster on `instance`, or adopt the replication group it runs.
    #[instrument(skip(self, options), fields(instance = %instance.endpoint()))]
    pub async fn create_cluster(
        &self,
        instance: &InstanceDef,
        name: &str,
        options: CreateClusterOptions,
    ) -> Result<Reported<Cluster<C>>> {
        validate_cluster_name(name)?;
        let settings = options.settings()?;
        let adopt = options.adopt_from_gr.unwrap_or(false);
        let mut report = OperationReport::new();
        let gate = GateOptions {
            adopt_from_gr: adopt,
            force: options.force.unwrap_or(false),
        };
        let (mut session, info) = self
            .open(instance, Operation::CreateCluster, &gate, &mut report)
            .await?;
        let endpoint = info.endpoint.clone();

        if info.mode == SessionMode::UnmanagedGroup {
            self.adopt_group(instance, name, &info, &mut report).await?;
            report.note(format!(
                "Cluster '{name}' successfully created based on the existing replication group."
            ));
            return Ok(Reported::new(
                Cluster::new(self.ctx.clone(), name, instance.clone()),
                report,
            ));
        }

        if info.server.super_read_only {
            if !options.clear_read_only.unwrap_or(false) {
                return Err(super_read_only_error(&endpoint));
            }
            session
                .set_sysvar("super_read_only", "OFF", VarScope::Global)
                .await?;
            report.note(format!("Disabled super_read_only on the instance '{endpoint}'"));
        }

        let compliance = check_compliance(&mut session).await?;
        if !compliance.is_ok() {
            report.warn(compliance.render());
            return Err(Error::Runtime(format!(
                "The instance '{endpoint}' is not valid for InnoDB cluster usage. Use \
                 <Dba>.configureInstance() to fix the configuration."
            )));
        }
        let version = info.server.version.clone();
        settings.check_version(&version)?;

        let ssl_mode = match settings.get("memberSslMode") {
            Some("DISABLED") => "DISABLED".to_string(),
            requested => {
                let have_ssl = session
                    .get_sysvar("have_ssl")
                    .await?
                    .is_some_and(|v| v.eq_ignore_ascii_case("YES"));
                match (requested, have_ssl) {
                    (_, true) => "REQUIRED".to_string(),
                    (Some("REQUIRED"), false) => {
                        return Err(Error::Runtime(format!(
                            "The instance '{endpoint}' does not have SSL enabled. To create the \
                             cluster either enable SSL support on the instance or disable SSL on \
                             the cluster using memberSslMode: 'DISABLED'."
                        )));
                    }
                    _ => "DISABLED".to_string(),
                }
            }
        };
        let group_name = settings
            .get("groupName")
            .map_or_else(|| uuid::Uuid::new_v4().to_string(), str::to_string);
        let local_address = match settings.get("localAddress") {
            Some(address) => address.to_string(),
            None => default_local_address(instance)?,
        };
        let seeds = settings.get("groupSeeds").unwrap_or_default().to_string();
        let topology_type = TopologyType::from_single_primary(!options.multi_primary());

        let metadata = MetadataSnapshot::default();
        let record = ClusterRecord {
            id: metadata.next_cluster_id(),
            name: name.to_string(),
            description: "Default Cluster".to_string(),
            group_name,
            ssl_mode: ssl_mode.clone(),
            disable_clone: settings.get("disableClone") == Some("true"),
            default_replica_set: ReplicaSetRecord {
                id: 1,
                name: DEFAULT_REPLICA_SET.to_string(),
                topology_type,
                instances: vec![InstanceRecord {
                    id: metadata.next_instance_id(),
                    uuid: info.server.uuid.clone(),
                    endpoint: endpoint.clone(),
                    label: endpoint.clone(),
                    role: ROLE_HA.to_string(),
                    local_address: local_address.clone(),
                }],
            },
        };
        if info.metadata.is_some() {
            debug!(%endpoint, "Replacing stale metadata");
        }

        let auto_increment = if topology_type.is_single_primary() {
            SINGLE_PRIMARY_AUTO_INCREMENT
        } else {
            multi_primary_auto_increment(1, info.server.server_id)
        };
        let plan = JoinPlan {
            endpoint: &endpoint,
            cluster: &record,
            local_address: &local_address,
            seeds: &seeds,
            ssl_mode: &ssl_mode,
            auto_increment,
            extra: &settings,
            scope: durable_scope(version.supports_persist()),
        }
        .build();
        plan.apply_local(&mut session)
            .await
            .map_err(PlanFailure::into_error)?;
        warn_unpersisted(&plan, &mut report);

        info!(%endpoint, cluster = name, "Bootstrapping group");
        session.start_group_replication(true).await?;

        MetadataStore::new(&mut session)
            .commit(&MetadataSnapshot {
                clusters: vec![record],
            })
            .await?;

        report.note(format!(
            "Cluster successfully created. Use Cluster.addInstance() to add MySQL instances. At \
             least 3 instances are needed for the cluster '{name}' to be able to withstand up to \
             one server failure."
        ));
        Ok(Reported::new(
            Cluster::new(self.ctx.clone(), name, instance.clone()),
            report,
        ))
    }

    /// Record the running group `info` belongs to as cluster `name`.
    async fn adopt_group(
        &self,
        instance: &InstanceDef,
        name: &str,
        info: &SessionContext,
        report: &mut OperationReport,
    ) -> Result<()> {
        let mut metadata = info.metadata.clone().unwrap_or_default();
        if metadata.cluster(name).is_some() {
            return Err(Error::Argument(format!(
                "A Cluster with the name '{name}' already exists."
            )));
        }

        let mut instances = Vec::new();
        let mut ssl_mode = String::new();
        let mut next_id = metadata.next_instance_id();
        for member in info.snapshot.online() {
            let mut session = self.ctx.connect_endpoint(&member.endpoint, instance).await?;
            let local_address = session
                .get_sysvar("group_replication_local_address")
                .await?
                .unwrap_or_default();
            if ssl_mode.is_empty() {
                ssl_mode = session
                    .get_sysvar("group_replication_ssl_mode")
                    .await?
                    .unwrap_or_else(|| "DISABLED".to_string());
            }
            instances.push(InstanceRecord {
                id: next_id,
                uuid: member.uuid.clone(),
                endpoint: member.endpoint.clone(),
                label: member.endpoint.clone(),
                role: ROLE_HA.to_string(),
                local_address,
            });
            next_id += 1;
        }
        for member in info.snapshot.unrecorded().filter(|m| !m.is_online()) {
            report.warn(format!(
                "The instance '{}' is not ONLINE and was not added to the metadata. Use \
                 <Cluster>.rescan() once it is back.",
                member.endpoint
            ));
        }

        metadata.clusters.push(ClusterRecord {
            id: metadata.next_cluster_id(),
            name: name.to_string(),
            description: "Default Cluster".to_string(),
            group_name: info.server.group_name.clone(),
            ssl_mode,
            disable_clone: false,
            default_replica_set: ReplicaSetRecord {
                id: 1,
                name: DEFAULT_REPLICA_SET.to_string(),
                topology_type: TopologyType::from_single_primary(info.snapshot.single_primary),
                instances,
            },
        });

        let writer = match info.snapshot.primary() {
            Some(primary) => endpoint_def(&primary.endpoint, instance)?,
            None => instance.clone(),
        };
        let mut session = self.ctx.connect(&writer).await?;
        MetadataStore::new(&mut session).commit(&metadata).await?;
        info!(cluster = name, group = %info.server.group_name, "Replication group adopted");
        Ok(())
    }

    /// Handle to the cluster `instance` belongs to.
    ///
    /// Without quorum the handle is still returned, with a warning.
    #[instrument(skip(self, options), fields(instance = %instance.endpoint()))]
    pub async fn get_cluster(
        &self,
        instance: &InstanceDef,
        name: Option<&str>,
        options: GetClusterOptions,
    ) -> Result<Reported<Cluster<C>>> {
        let mut report = OperationReport::new();
        let (_, info) = self
            .open(instance, Operation::GetCluster, &GateOptions::default(), &mut report)
            .await?;

        let record = match (name, &info.cluster, &info.metadata) {
            (Some(name), _, Some(metadata)) => metadata.cluster(name),
            (None, Some(cluster), _) => Some(cluster),
            _ => None,
        };
        let Some(record) = record else {
            return Err(Error::Metadata(format!(
                "The cluster with the name '{}' does not exist.",
                name.unwrap_or_default()
            )));
        };

        if info.cluster.as_ref().is_some_and(|c| c.name == record.name)
            && let Some(warning) = topology_mismatch(record, &info.snapshot)
        {
            report.warn(warning);
        }

        let mut anchor = instance.clone();
        if options.connect_to_primary.unwrap_or(true)
            && info.snapshot.has_quorum()
            && let Some(primary) = info.snapshot.primary()
            && primary.endpoint != info.endpoint
        {
            anchor = endpoint_def(&primary.endpoint, instance)?;
            debug!(primary = %primary.endpoint, "Connected to the primary");
        }
        Ok(Reported::new(
            Cluster::new(self.ctx.clone(), record.name.clone(), anchor),
            report,
        ))
    }

    /// Bring a cluster back after every member stopped.
    ///
    /// The group is bootstrapped on `instance`, which becomes the primary.
    /// Without lists every reachable member is rejoined.
    #[instrument(skip(self, options), fields(instance = %instance.endpoint()))]
    pub async fn reboot_cluster_from_complete_outage(
        &self,
        instance: &InstanceDef,
        name: Option<&str>,
        options: RebootOptions,
    ) -> Result<Reported<Cluster<C>>> {
        let rejoin = normalize_endpoints(options.rejoin_instances.as_deref().unwrap_or_default())?;
        let remove = normalize_endpoints(options.remove_instances.as_deref().unwrap_or_default())?;
        let both: Vec<&str> = rejoin
            .iter()
            .filter(|e| remove.contains(e))
            .map(String::as_str)
            .collect();
        if !both.is_empty() {
            return Err(Error::Argument(format!(
                "The following instances: '{}' belong to both 'rejoinInstances' and \
                 'removeInstances' lists.",
                both.join(", ")
            )));
        }

        let mut report = OperationReport::new();
        let anchor = instance
            .clone()
            .with_password(options.password.as_deref());
        let (mut session, info) = self
            .open(
                &anchor,
                Operation::RebootClusterFromCompleteOutage,
                &GateOptions::default(),
                &mut report,
            )
            .await?;
        let endpoint = info.endpoint.clone();
        let Some(record) = info.cluster.clone() else {
            return Err(Error::Metadata(format!(
                "The instance '{endpoint}' does not belong to any cluster."
            )));
        };
        if let Some(name) = name
            && name != record.name
        {
            return Err(Error::Metadata(format!(
                "The cluster with the name '{name}' does not exist."
            )));
        }
        let cluster_name = record.name.clone();

        for entry in rejoin.iter().chain(&remove) {
            if record.find_by_endpoint(entry).is_none() || *entry == endpoint {
                return Err(Error::Argument(format!(
                    "The instance '{entry}' does not belong to the cluster: '{cluster_name}'."
                )));
            }
        }

        // Every other member must be down or out of the group, and none may be ahead.
        let anchor_gtids = session.gtid_executed().await?;
        let mut reachable = Vec::new();
        for member in record.instances().iter().filter(|i| i.endpoint != endpoint) {
            let mut peer = match self.ctx.connect_endpoint(&member.endpoint, &anchor).await {
                Ok(peer) => peer,
                Err(e) => {
                    debug!(endpoint = %member.endpoint, error = %e, "Member not reachable");
                    continue;
                }
            };
            if !peer.group_members().await?.is_empty() {
                return Err(Error::Runtime(format!(
                    "The MySQL instance '{}' belongs to an InnoDB Cluster and is reachable. \
                     Please use <Cluster>.forceQuorumUsingPartitionOf() to restore from the \
                     quorum loss.",
                    member.endpoint
                )));
            }
            if !remove.contains(&member.endpoint)
                && !peer.gtid_executed().await?.is_subset_of(&anchor_gtids)
            {
                return Err(Error::Runtime(format!(
                    "The active session instance ({endpoint}) isn't the most updated in \
                     comparison with the ONLINE instances of the Cluster's metadata. Please use \
                     the most up to date instance: '{}'.",
                    member.endpoint
                )));
            }
            reachable.push(member.endpoint.clone());
        }
        let unreachable: Vec<&str> = rejoin
            .iter()
            .filter(|e| !reachable.contains(e))
            .map(String::as_str)
            .collect();
        if !unreachable.is_empty() {
            return Err(Error::Runtime(format!(
                "The following instances in 'rejoinInstances' are not reachable: '{}'. Make sure \
                 they are running or remove them from the list.",
                unreachable.join(", ")
            )));
        }
        let rejoin = if options.rejoin_instances.is_none() && options.remove_instances.is_none() {
            reachable
        } else {
            rejoin
        };

        let own = record.find_by_endpoint(&endpoint);
        let local_address = match own.map(|i| i.local_address.as_str()) {
            Some(address) if !address.is_empty() => address.to_string(),
            _ => default_local_address(&anchor)?,
        };
        let seeds: Vec<&str> = record
            .instances()
            .iter()
            .filter(|i| i.endpoint != endpoint && !i.local_address.is_empty())
            .map(|i| i.local_address.as_str())
            .collect();
        let auto_increment = if record.topology_type().is_single_primary() {
            SINGLE_PRIMARY_AUTO_INCREMENT
        } else {
            multi_primary_auto_increment(record.instances().len(), info.server.server_id)
        };
        let version = info.server.version.clone();
        let plan = JoinPlan {
            endpoint: &endpoint,
            cluster: &record,
            local_address: &local_address,
            seeds: &seeds.join(","),
            ssl_mode: &record.ssl_mode,
            auto_increment,
            extra: &GrSettings::default(),
            scope: durable_scope(version.supports_persist()),
        }
        .build();
        plan.apply_local(&mut session)
            .await
            .map_err(PlanFailure::into_error)?;
        if !version.supports_persist() {
            report.warn(persist_warning(&endpoint, &version));
        }

        report.note(format!(
            "Rebooting cluster '{cluster_name}' from complete outage through '{endpoint}'."
        ));
        session.start_group_replication(true).await?;
        info!(%endpoint, cluster = %cluster_name, "Group bootstrapped");

        drop(session);

        let cluster = Cluster::new(self.ctx.clone(), cluster_name.clone(), anchor.clone());
        for entry in &rejoin {
            let def = endpoint_def(entry, &anchor)?;
            let rejoined = cluster
                .rejoin_instance(
                    &def,
                    RejoinInstanceOptions {
                        password: options.password.clone(),
                        ..Default::default()
                    },
                )
                .await?;
            report.extend(rejoined);
        }

        if !remove.is_empty() {
            let mut session = self.ctx.connect(&anchor).await?;
            let removed = remove.clone();
            MetadataStore::new(&mut session)
                .update_cluster(&cluster_name, move |cluster| {
                    cluster
                        .default_replica_set
                        .instances
                        .retain(|i| !removed.contains(&i.endpoint));
                    Ok(())
                })
                .await?;
            for entry in &remove {
                report.note(format!("The instance '{entry}' was removed from the metadata."));
            }
            let remaining: Vec<InstanceRecord> = record
                .instances()
                .iter()
                .filter(|i| !remove.contains(&i.endpoint))
                .cloned()
                .collect();
            cluster.refresh_seeds(&remaining, &mut report).await;
        }

        report.note(format!(
            "The cluster '{cluster_name}' was successfully rebooted."
        ));
        Ok(Reported::new(cluster, report))
    }

    /// Drop the metadata schema. Requires `force`.
    #[instrument(skip(self, options), fields(instance = %instance.endpoint()))]
    pub async fn drop_metadata_schema(
        &self,
        instance: &InstanceDef,
        options: DropMetadataOptions,
    ) -> Result<OperationReport> {
        let mut report = OperationReport::new();
        let gate = GateOptions {
            force: options.force.unwrap_or(false),
            ..Default::default()
        };
        let (session, info) = self
            .open(instance, Operation::DropMetadataSchema, &gate, &mut report)
            .await?;

        let mut writer = match info.snapshot.primary() {
            Some(primary) if primary.endpoint != info.endpoint => {
                self.ctx.connect_endpoint(&primary.endpoint, instance).await?
            }
            _ => session,
        };
        let group_active = info.group_active();
        if !group_active && info.server.super_read_only {
            if !options.clear_read_only.unwrap_or(false) {
                return Err(super_read_only_error(&info.endpoint));
            }
            writer
                .set_sysvar("super_read_only", "OFF", VarScope::Global)
                .await?;
            report.note(format!(
                "Disabled super_read_only on the instance '{}'",
                info.endpoint
            ));
        }

        MetadataStore::new(&mut writer).drop_schema().await?;
        info!(endpoint = %writer.instance().endpoint(), "Metadata schema dropped");
        report.note("Metadata Schema successfully removed.");
        Ok(report)
    }

    /// Compare the configuration of `instance` with what a member needs.
    #[instrument(skip(self), fields(instance = %instance.endpoint()))]
    pub async fn check_instance_configuration(
        &self,
        instance: &InstanceDef,
    ) -> Result<Reported<ComplianceReport>> {
        let mut report = OperationReport::new();
        let (mut session, info) = self
            .open(
                instance,
                Operation::CheckInstanceConfiguration,
                &GateOptions::default(),
                &mut report,
            )
            .await?;
        let compliance = check_compliance(&mut session).await?;
        if compliance.is_ok() {
            report.note(format!(
                "The instance '{}' is valid for InnoDB cluster usage.",
                info.endpoint
            ));
        } else {
            report.warn(compliance.render());
            report.note("Please use the dba.configureInstance() command to repair these issues.");
        }
        Ok(Reported::new(compliance, report))
    }

    /// Fix what [`Dba::check_instance_configuration`] reports.
    ///
    /// Dynamic settings are changed at once; settings that need a restart
    /// are persisted and the server restarted when `restart` is set.
    #[instrument(skip(self, options), fields(instance = %instance.endpoint()))]
    pub async fn configure_instance(
        &self,
        instance: &InstanceDef,
        options: ConfigureInstanceOptions,
    ) -> Result<Reported<ComplianceReport>> {
        let mut report = OperationReport::new();
        let def = instance.clone().with_password(options.password.as_deref());
        let (mut session, info) = self
            .open(
                &def,
                Operation::ConfigureInstance,
                &GateOptions::default(),
                &mut report,
            )
            .await?;
        let endpoint = info.endpoint.clone();

        let compliance = check_compliance(&mut session).await?;
        if compliance.is_ok() {
            report.note(format!(
                "The instance '{endpoint}' is valid for InnoDB cluster usage."
            ));
            return Ok(Reported::new(compliance, report));
        }
        if info.server.super_read_only && !info.group_active() {
            if !options.clear_read_only.unwrap_or(false) {
                return Err(super_read_only_error(&endpoint));
            }
            session
                .set_sysvar("super_read_only", "OFF", VarScope::Global)
                .await?;
        }

        let persist = info.server.version.supports_persist();
        let mut plan = ConfigPlan::new();
        let mut manual = Vec::new();
        for issue in &compliance.config_errors {
            match (issue.requires_restart(), persist) {
                (false, _) => {
                    plan.push(&endpoint, &issue.variable, &issue.required, durable_scope(persist))
                }
                (true, true) => {
                    plan.push(&endpoint, &issue.variable, &issue.required, VarScope::PersistOnly)
                }
                (true, false) => manual.push(issue.variable.as_str()),
            }
        }
        if !manual.is_empty() {
            report.warn(format!(
                "The following variables of instance '{endpoint}' must be changed in its option \
                 file followed by a restart: {}",
                manual.join(", ")
            ));
        }
        plan.apply_local(&mut session)
            .await
            .map_err(PlanFailure::into_error)?;
        warn_unpersisted(&plan, &mut report);

        let restart_pending = plan.steps().iter().any(|s| s.scope == VarScope::PersistOnly);
        if restart_pending {
            if options.restart.unwrap_or(false) {
                info!(%endpoint, "Restarting server");
                session.restart_server().await?;
                report.note(format!("Restarting MySQL instance '{endpoint}'..."));
                session = self.ctx.connect(&def).await?;
            } else {
                report.note(format!(
                    "The instance '{endpoint}' was configured for InnoDB cluster usage but you \
                     must restart it for the changes to take effect."
                ));
            }
        }

        let after = check_compliance(&mut session).await?;
        if after.is_ok() {
            report.note(format!(
                "The instance '{endpoint}' was configured for InnoDB cluster usage."
            ));
        }
        Ok(Reported::new(after, report))
    }
}

//! Cluster handle.
//!
//! A [`Cluster`] names a recorded cluster and the anchor instance every
//! operation connects through. It keeps no live session: each operation
//! classifies the anchor afresh and passes the precondition gate before any
//! mutation starts. Membership changes are in `cluster_membership`, mode
//! switches and primary election in `cluster_topology`.

use std::fmt;

use serde::Serialize;
use tracing::{debug, info, instrument};

use crate::client::{Connector, GtidSet, InstanceDef, InstanceSession};
use crate::controller::config_plan::{ConfigPlan, PlanFailure, durable_scope, warn_unpersisted};
use crate::controller::context::{Context, OperationReport, Reported};
use crate::controller::error::{Error, Result};
use crate::controller::options::{OptionSpec, OptionTarget, OptionValue, resolve};
use crate::controller::preconditions::{GateOptions, Operation, check};
use crate::controller::session_mode::{SessionContext, classify_session};
use crate::controller::status::{self, DescribeDoc, MemberOptions, OptionsDoc, StatusDoc};
use crate::controller::validation::{validate_cluster_name, validate_label};
use crate::group::GroupSnapshot;
use crate::metadata::{ClusterRecord, MetadataStore, TopologyType};

/// Returned by every operation on a handle after `disconnect()` or `dissolve()`.
pub const DISCONNECTED: &str = "The cluster object is disconnected. Please call <Dba>.getCluster() \
                                to obtain a fresh cluster handle.";

/// Whether an instance's transactions allow it to join the cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TransactionState {
    Ok,
    Error,
}

/// Why an instance has its [`TransactionState`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionStateReason {
    /// No executed transactions.
    New,
    /// Every executed transaction is known to the cluster.
    Recoverable,
    /// Executed transactions the cluster never saw.
    Diverged,
    /// The cluster purged transactions the instance is missing.
    LostTransactions,
}

impl TransactionStateReason {
    /// Compare the executed set of an instance with the cluster's.
    pub fn classify(instance: &GtidSet, executed: &GtidSet, purged: &GtidSet) -> Self {
        if instance.is_empty() {
            Self::New
        } else if !instance.is_subset_of(executed) {
            Self::Diverged
        } else if !purged.difference(instance).is_empty() {
            Self::LostTransactions
        } else {
            Self::Recoverable
        }
    }

    pub fn state(self) -> TransactionState {
        match self {
            Self::New | Self::Recoverable => TransactionState::Ok,
            Self::Diverged | Self::LostTransactions => TransactionState::Error,
        }
    }
}

impl fmt::Display for TransactionStateReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::New => "new",
            Self::Recoverable => "recoverable",
            Self::Diverged => "diverged",
            Self::LostTransactions => "lost_transactions",
        };
        f.write_str(name)
    }
}

/// Result of `checkInstanceState`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct InstanceState {
    pub state: TransactionState,
    pub reason: TransactionStateReason,
}

impl From<TransactionStateReason> for InstanceState {
    fn from(reason: TransactionStateReason) -> Self {
        Self {
            state: reason.state(),
            reason,
        }
    }
}

/// Warning for a recorded topology type the live group no longer has.
pub(crate) fn topology_mismatch(record: &ClusterRecord, snapshot: &GroupSnapshot) -> Option<String> {
    let recorded = record.topology_type();
    let live = TopologyType::from_single_primary(snapshot.single_primary);
    (recorded != live).then(|| {
        format!(
            "The InnoDB Cluster topology type ({recorded}) does not match the current Group \
             Replication configuration ({live}). Please use <cluster>.rescan() or change the \
             Group Replication configuration accordingly."
        )
    })
}

/// Handle to a managed cluster.
#[derive(Debug, Clone)]
pub struct Cluster<C: Connector> {
    pub(crate) ctx: Context<C>,
    pub(crate) name: String,
    pub(crate) anchor: InstanceDef,
    pub(crate) connected: bool,
}

/// What an operation learned when it opened the anchor.
pub(crate) struct Opened<S> {
    pub session: S,
    pub info: SessionContext,
    pub record: ClusterRecord,
}

impl<S> Opened<S> {
    pub fn snapshot(&self) -> &GroupSnapshot {
        &self.info.snapshot
    }

    pub fn replica_set_name(&self) -> &str {
        &self.record.default_replica_set.name
    }

    /// First recorded member that is not ONLINE in the live view.
    pub fn first_not_online(&self) -> Option<&str> {
        self.record
            .instances()
            .iter()
            .find(|record| {
                self.snapshot()
                    .member_by_uuid(&record.uuid)
                    .is_none_or(|m| !m.is_online())
            })
            .map(|record| record.endpoint.as_str())
    }
}

impl<C: Connector> Cluster<C> {
    pub(crate) fn new(ctx: Context<C>, name: impl Into<String>, anchor: InstanceDef) -> Self {
        Self {
            ctx,
            name: name.into(),
            anchor,
            connected: true,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// The instance operations connect through.
    pub fn anchor(&self) -> &InstanceDef {
        &self.anchor
    }

    pub fn is_connected(&self) -> bool {
        self.connected
    }

    /// Release the handle.
    pub fn disconnect(&mut self) {
        if self.connected {
            info!(cluster = %self.name, "Cluster handle disconnected");
        }
        self.connected = false;
    }

    pub(crate) fn ensure_connected(&self) -> Result<()> {
        if self.connected {
            Ok(())
        } else {
            Err(Error::Logic(DISCONNECTED.to_string()))
        }
    }

    /// `instance` carrying the anchor's credentials where it has none.
    pub(crate) fn credentials_for(&self, instance: &InstanceDef) -> InstanceDef {
        instance.clone().with_credentials_from(&self.anchor)
    }

    /// Connect to the anchor, classify it and run the gate for `operation`.
    pub(crate) async fn open(
        &self,
        operation: Operation,
        gate: &GateOptions,
        report: &mut OperationReport,
    ) -> Result<Opened<C::Session>> {
        self.ensure_connected()?;
        let mut session = self.ctx.connect(&self.anchor).await?;
        let info = classify_session(&mut session).await?;
        if let Some(warning) = check(operation, &info, gate).into_result()? {
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
        if operation != Operation::Rescan
            && let Some(warning) = topology_mismatch(&record, &info.snapshot)
        {
            report.warn(warning);
        }
        debug!(%operation, mode = %info.mode, "Opened cluster");
        Ok(Opened {
            session,
            info,
            record,
        })
    }

    /// Session to the member that accepts metadata writes.
    ///
    /// The primary in single-primary mode, the anchor otherwise.
    pub(crate) async fn writer(&self, snapshot: &GroupSnapshot) -> Result<C::Session> {
        match snapshot.primary() {
            Some(primary) if primary.endpoint != self.anchor.endpoint() => {
                self.ctx.connect_endpoint(&primary.endpoint, &self.anchor).await
            }
            _ => self.ctx.connect(&self.anchor).await,
        }
    }

    /// Apply `mutate` to the cluster record through the writer.
    pub(crate) async fn update_metadata<F>(&self, snapshot: &GroupSnapshot, mutate: F) -> Result<()>
    where
        F: FnOnce(&mut ClusterRecord) -> Result<()>,
    {
        let mut writer = self.writer(snapshot).await?;
        MetadataStore::new(&mut writer)
            .update_cluster(&self.name, mutate)
            .await?;
        Ok(())
    }

    #[instrument(skip(self), fields(cluster = %self.name))]
    pub async fn describe(&self) -> Result<Reported<DescribeDoc>> {
        let mut report = OperationReport::new();
        let opened = self
            .open(Operation::Describe, &GateOptions::default(), &mut report)
            .await?;
        Ok(Reported::new(status::describe(&opened.record), report))
    }

    #[instrument(skip(self), fields(cluster = %self.name))]
    pub async fn status(&self) -> Result<Reported<StatusDoc>> {
        let mut report = OperationReport::new();
        let opened = self
            .open(Operation::Status, &GateOptions::default(), &mut report)
            .await?;
        let doc = status::status(&opened.record, opened.snapshot(), &self.anchor);
        Ok(Reported::new(doc, report))
    }

    /// Classify the executed transactions of `instance` against the cluster.
    #[instrument(skip(self), fields(cluster = %self.name, instance = %instance.endpoint()))]
    pub async fn check_instance_state(
        &self,
        instance: &InstanceDef,
    ) -> Result<Reported<InstanceState>> {
        let mut report = OperationReport::new();
        let opened = self
            .open(Operation::CheckInstanceState, &GateOptions::default(), &mut report)
            .await?;

        let mut writer = self.writer(opened.snapshot()).await?;
        let executed = writer.gtid_executed().await?;
        let purged = writer.get_sysvar("gtid_purged").await?.unwrap_or_default();
        let purged: GtidSet = purged.parse().map_err(|e| {
            Error::Runtime(format!(
                "Invalid gtid_purged on '{}': {e}",
                writer.instance().endpoint()
            ))
        })?;

        let mut target = self.ctx.connect(&self.credentials_for(instance)).await?;
        let instance_executed = target.gtid_executed().await?;
        let reason = TransactionStateReason::classify(&instance_executed, &executed, &purged);
        info!(%reason, "Instance transaction state checked");
        Ok(Reported::new(InstanceState::from(reason), report))
    }

    /// Cluster-wide and per-member options. With `all` every
    /// `group_replication_*` variable is listed.
    #[instrument(skip(self), fields(cluster = %self.name))]
    pub async fn options(&self, all: bool) -> Result<Reported<OptionsDoc>> {
        let mut report = OperationReport::new();
        let opened = self
            .open(Operation::Options, &GateOptions::default(), &mut report)
            .await?;

        let mut members = Vec::with_capacity(opened.record.instances().len());
        for record in opened.record.instances() {
            let entry = match self.read_member_options(&record.endpoint, all).await {
                Ok(options) => MemberOptions::Options(options),
                Err(e) => {
                    debug!(endpoint = %record.endpoint, error = %e, "Member options unavailable");
                    MemberOptions::Unreachable {
                        shell_connect_error: e.to_string(),
                    }
                }
            };
            members.push((record.label.clone(), entry));
        }
        Ok(Reported::new(status::options(&opened.record, members), report))
    }

    async fn read_member_options(
        &self,
        endpoint: &str,
        all: bool,
    ) -> Result<Vec<status::OptionEntry>> {
        let mut session = self.ctx.connect_endpoint(endpoint, &self.anchor).await?;
        let variables = session.get_sysvars_with_prefix("group_replication_").await?;
        Ok(status::member_options(&variables, all))
    }

    /// Change a cluster-wide option on every member.
    #[instrument(skip(self, value), fields(cluster = %self.name))]
    pub async fn set_option(
        &mut self,
        option: &str,
        value: impl Into<OptionValue>,
    ) -> Result<OperationReport> {
        self.ensure_connected()?;
        let (spec, value) = resolve(option, &value.into(), OptionTarget::Cluster)?;
        let mut report = OperationReport::new();
        let opened = self
            .open(Operation::SetOption, &GateOptions::default(), &mut report)
            .await?;

        match spec.name {
            "clusterName" => self.rename(&opened, &value, &mut report).await?,
            _ => {
                if opened.first_not_online().is_some() {
                    return Err(Error::Runtime(
                        "One or more instances of the cluster are not ONLINE.".to_string(),
                    ));
                }
                match spec.variable {
                    Some(variable) => {
                        self.set_group_option(&opened, spec, variable, &value, &mut report)
                            .await?
                    }
                    None => self.set_clone_option(&opened, spec, &value, &mut report).await?,
                }
            }
        }
        Ok(report)
    }

    async fn rename(
        &mut self,
        opened: &Opened<C::Session>,
        new_name: &str,
        report: &mut OperationReport,
    ) -> Result<()> {
        validate_cluster_name(new_name)?;
        if new_name == self.name {
            report.note(format!("The cluster is already named '{new_name}'."));
            return Ok(());
        }
        let taken = opened
            .info
            .metadata
            .as_ref()
            .is_some_and(|md| md.cluster(new_name).is_some());
        if taken {
            return Err(Error::Argument(format!(
                "A Cluster with the name '{new_name}' already exists."
            )));
        }
        let new = new_name.to_string();
        self.update_metadata(opened.snapshot(), |cluster| {
            cluster.name = new;
            Ok(())
        })
        .await?;
        info!(from = %self.name, to = new_name, "Cluster renamed");
        self.name = new_name.to_string();
        report.note(format!(
            "Successfully set the value of 'clusterName' to '{new_name}' in the Cluster: '{new_name}'."
        ));
        Ok(())
    }

    async fn set_clone_option(
        &self,
        opened: &Opened<C::Session>,
        spec: &OptionSpec,
        value: &str,
        report: &mut OperationReport,
    ) -> Result<()> {
        for record in opened.record.instances() {
            let mut session = self
                .ctx
                .connect_endpoint(&record.endpoint, &self.anchor)
                .await?;
            spec.check_version(&session.server_info().await?.version)?;
        }
        let disable = value == "true";
        self.update_metadata(opened.snapshot(), |cluster| {
            cluster.disable_clone = disable;
            Ok(())
        })
        .await?;
        report.note(format!(
            "Successfully set the value of '{}' to '{value}' in the Cluster: '{}'.",
            spec.name, self.name
        ));
        Ok(())
    }

    async fn set_group_option(
        &self,
        opened: &Opened<C::Session>,
        spec: &OptionSpec,
        variable: &str,
        value: &str,
        report: &mut OperationReport,
    ) -> Result<()> {
        // Every member is checked before the first one is changed.
        let mut plan = ConfigPlan::new();
        for record in opened.record.instances() {
            let mut session = self
                .ctx
                .connect_endpoint(&record.endpoint, &self.anchor)
                .await?;
            let version = session.server_info().await?.version;
            spec.check_version(&version)?;
            spec.check_value_version(value, &version)?;
            plan.push(
                &record.endpoint,
                variable,
                value,
                durable_scope(version.supports_persist()),
            );
        }

        report.note(format!(
            "Setting the value of '{}' to '{value}' in all ReplicaSet members ...",
            spec.name
        ));
        plan.execute(&self.ctx, &self.anchor)
            .await
            .map_err(PlanFailure::into_error)?;
        warn_unpersisted(&plan, report);
        report.note(format!(
            "Successfully set the value of '{}' to '{value}' in the '{}' ReplicaSet.",
            spec.name,
            opened.replica_set_name()
        ));
        Ok(())
    }

    /// Change an option of one member.
    #[instrument(skip(self, value), fields(cluster = %self.name, instance = %instance.endpoint()))]
    pub async fn set_instance_option(
        &self,
        instance: &InstanceDef,
        option: &str,
        value: impl Into<OptionValue>,
    ) -> Result<OperationReport> {
        self.ensure_connected()?;
        let (spec, value) = resolve(option, &value.into(), OptionTarget::Instance)?;
        let mut report = OperationReport::new();
        let opened = self
            .open(Operation::SetInstanceOption, &GateOptions::default(), &mut report)
            .await?;

        let endpoint = instance.endpoint();
        let Some(record) = opened.record.find_by_endpoint(&endpoint) else {
            return Err(Error::Runtime(format!(
                "The instance '{endpoint}' does not belong to the ReplicaSet: '{}'.",
                opened.replica_set_name()
            )));
        };

        let Some(variable) = spec.variable else {
            // label
            validate_label(&value)?;
            if opened
                .record
                .find_by_label(&value)
                .is_some_and(|other| other.uuid != record.uuid)
            {
                return Err(Error::Argument(format!(
                    "An instance with label '{value}' is already part of this InnoDB cluster"
                )));
            }
            let uuid = record.uuid.clone();
            let label = value.clone();
            self.update_metadata(opened.snapshot(), move |cluster| {
                if let Some(member) = cluster
                    .default_replica_set
                    .instances
                    .iter_mut()
                    .find(|i| i.uuid == uuid)
                {
                    member.label = label;
                }
                Ok(())
            })
            .await?;
            report.note(format!(
                "Successfully set the value of 'label' to '{value}' in the '{}' ReplicaSet \
                 member: '{endpoint}'.",
                opened.replica_set_name()
            ));
            return Ok(report);
        };

        let online = opened
            .snapshot()
            .member_by_uuid(&record.uuid)
            .is_some_and(|m| m.is_online());
        if !online {
            return Err(Error::Runtime(format!("The instance '{endpoint}' is not ONLINE.")));
        }

        let mut session = self.ctx.connect(&self.credentials_for(instance)).await?;
        let version = session.server_info().await?.version;
        spec.check_version(&version)?;
        spec.check_value_version(&value, &version)?;

        let mut plan = ConfigPlan::new();
        plan.push(&endpoint, variable, &value, durable_scope(version.supports_persist()));
        report.note(format!(
            "Setting the value of '{}' to '{value}' in the instance: '{endpoint}' ...",
            spec.name
        ));
        plan.apply_local(&mut session)
            .await
            .map_err(PlanFailure::into_error)?;
        warn_unpersisted(&plan, &mut report);
        report.note(format!(
            "Successfully set the value of '{}' to '{value}' in the '{}' ReplicaSet member: \
             '{endpoint}'.",
            spec.name,
            opened.replica_set_name()
        ));
        Ok(report)
    }
}

//! Topology mode switches and primary election.

use tracing::{info, instrument};

use crate::client::{Connector, InstanceDef, InstanceSession};
use crate::controller::cluster::{Cluster, Opened};
use crate::controller::config_plan::{ConfigPlan, PlanFailure, durable_scope, warn_unpersisted};
use crate::controller::context::OperationReport;
use crate::controller::error::{Error, Result};
use crate::controller::options::{SINGLE_PRIMARY_AUTO_INCREMENT, multi_primary_auto_increment};
use crate::controller::preconditions::{GateOptions, Operation};
use crate::controller::session_mode::classify_session;
use crate::metadata::TopologyType;

pub const MULTI_PRIMARY_NOT_ALLOWED: &str =
    "Operation not allowed: The cluster is in Multi-Primary mode.";

impl<C: Connector> Cluster<C> {
    /// Every member ONLINE and able to change the group configuration online.
    ///
    /// Returns the server id of each member in metadata order.
    async fn check_topology_change(
        &self,
        opened: &Opened<C::Session>,
    ) -> Result<Vec<(String, u32, bool)>> {
        if let Some(endpoint) = opened.first_not_online() {
            return Err(Error::Runtime(format!(
                "The instance '{endpoint}' is not ONLINE. All members of the cluster must be \
                 ONLINE to change the topology."
            )));
        }
        let mut members = Vec::with_capacity(opened.record.instances().len());
        for record in opened.record.instances() {
            let mut session = self
                .ctx
                .connect_endpoint(&record.endpoint, &self.anchor)
                .await?;
            let info = session.server_info().await?;
            if !info.version.supports_group_config_change() {
                return Err(Error::Runtime(format!(
                    "The instance '{}' has the version {} and does not support the operation. At \
                     least version 8.0.13 is required on every member of the cluster.",
                    record.endpoint, info.version
                )));
            }
            members.push((
                record.endpoint.clone(),
                info.server_id,
                info.version.supports_persist(),
            ));
        }
        Ok(members)
    }

    async fn record_topology(
        &self,
        opened: &Opened<C::Session>,
        topology_type: TopologyType,
    ) -> Result<()> {
        if opened.record.topology_type() == topology_type {
            return Ok(());
        }
        // Re-observe: the switch may have moved the primary.
        let mut anchor = self.ctx.connect(&self.anchor).await?;
        let info = classify_session(&mut anchor).await?;
        self.update_metadata(&info.snapshot, move |cluster| {
            cluster.default_replica_set.topology_type = topology_type;
            Ok(())
        })
        .await
    }

    /// Switch the group to multi-primary mode.
    #[instrument(skip(self), fields(cluster = %self.name))]
    pub async fn switch_to_multi_primary_mode(&self) -> Result<OperationReport> {
        self.ensure_connected()?;
        let mut report = OperationReport::new();
        let mut opened = self
            .open(
                Operation::SwitchToMultiPrimaryMode,
                &GateOptions::default(),
                &mut report,
            )
            .await?;

        if !opened.snapshot().single_primary {
            self.record_topology(&opened, TopologyType::MultiPrimary).await?;
            report.note("The cluster is already in Multi-Primary mode.");
            return Ok(report);
        }
        let members = self.check_topology_change(&opened).await?;

        opened.session.switch_to_multi_primary().await?;
        info!("Group switched to multi-primary");

        let mut plan = ConfigPlan::new();
        for (endpoint, server_id, persist) in &members {
            let scope = durable_scope(*persist);
            let (increment, offset) = multi_primary_auto_increment(members.len(), *server_id);
            plan.push(endpoint, "auto_increment_increment", &increment.to_string(), scope);
            plan.push(endpoint, "auto_increment_offset", &offset.to_string(), scope);
            plan.push(endpoint, "group_replication_single_primary_mode", "OFF", scope);
            plan.push(
                endpoint,
                "group_replication_enforce_update_everywhere_checks",
                "ON",
                scope,
            );
        }
        plan.execute(&self.ctx, &self.anchor)
            .await
            .map_err(PlanFailure::into_error)?;
        warn_unpersisted(&plan, &mut report);

        self.record_topology(&opened, TopologyType::MultiPrimary).await?;
        report.note("The cluster successfully switched to Multi-Primary mode.");
        Ok(report)
    }

    /// Switch the group to single-primary mode, electing `primary` if given.
    #[instrument(skip(self, primary), fields(cluster = %self.name))]
    pub async fn switch_to_single_primary_mode(
        &self,
        primary: Option<&InstanceDef>,
    ) -> Result<OperationReport> {
        self.ensure_connected()?;
        let mut report = OperationReport::new();
        let mut opened = self
            .open(
                Operation::SwitchToSinglePrimaryMode,
                &GateOptions::default(),
                &mut report,
            )
            .await?;

        if opened.snapshot().single_primary {
            self.record_topology(&opened, TopologyType::SinglePrimary).await?;
            report.note("The cluster is already in Single-Primary mode.");
            return Ok(report);
        }
        let members = self.check_topology_change(&opened).await?;

        let uuid = match primary {
            Some(instance) => {
                let endpoint = instance.endpoint();
                let Some(record) = opened.record.find_by_endpoint(&endpoint) else {
                    return Err(super::cluster_membership::not_a_member(
                        &endpoint,
                        opened.replica_set_name(),
                    ));
                };
                Some(record.uuid.clone())
            }
            None => None,
        };
        opened
            .session
            .switch_to_single_primary(uuid.as_deref())
            .await?;
        info!(primary = ?uuid, "Group switched to single-primary");

        let mut plan = ConfigPlan::new();
        let (increment, offset) = SINGLE_PRIMARY_AUTO_INCREMENT;
        let (increment, offset) = (increment.to_string(), offset.to_string());
        for (endpoint, _, persist) in &members {
            let scope = durable_scope(*persist);
            plan.push(endpoint, "auto_increment_increment", &increment, scope);
            plan.push(endpoint, "auto_increment_offset", &offset, scope);
            plan.push(endpoint, "group_replication_enforce_update_everywhere_checks", "OFF", scope);
            plan.push(endpoint, "group_replication_single_primary_mode", "ON", scope);
        }
        plan.execute(&self.ctx, &self.anchor)
            .await
            .map_err(PlanFailure::into_error)?;
        warn_unpersisted(&plan, &mut report);

        self.record_topology(&opened, TopologyType::SinglePrimary).await?;
        report.note("The cluster successfully switched to Single-Primary mode.");
        Ok(report)
    }

    /// Elect `instance` as the primary of a single-primary cluster.
    #[instrument(skip(self), fields(cluster = %self.name, instance = %instance.endpoint()))]
    pub async fn set_primary_instance(&self, instance: &InstanceDef) -> Result<OperationReport> {
        self.ensure_connected()?;
        let mut report = OperationReport::new();
        let mut opened = self
            .open(Operation::SetPrimaryInstance, &GateOptions::default(), &mut report)
            .await?;

        if !opened.snapshot().single_primary {
            return Err(Error::Runtime(MULTI_PRIMARY_NOT_ALLOWED.to_string()));
        }
        self.check_topology_change(&opened).await?;

        let endpoint = instance.endpoint();
        let Some(record) = opened.record.find_by_endpoint(&endpoint).cloned() else {
            return Err(super::cluster_membership::not_a_member(
                &endpoint,
                opened.replica_set_name(),
            ));
        };
        if opened
            .snapshot()
            .primary()
            .is_some_and(|p| p.uuid == record.uuid)
        {
            report.note(format!("The instance '{endpoint}' is already the primary."));
            return Ok(report);
        }

        opened.session.set_as_primary(&record.uuid).await?;
        info!(%endpoint, "Primary elected");
        report.note(format!(
            "The instance '{endpoint}' was successfully elected as primary."
        ));
        Ok(report)
    }
}

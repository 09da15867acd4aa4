//! Ordered per-member configuration plans.
//!
//! Cluster-wide changes are built as a list of steps, validated in full
//! against every member before the first step runs, and then executed
//! sequentially in metadata order. A failure reports exactly which step
//! failed and which ones were applied before it.

use std::fmt;

use tracing::{debug, info, instrument};

use crate::client::{Connector, InstanceDef, InstanceSession, VarScope};
use crate::controller::context::{Context, OperationReport};
use crate::controller::error::Error;

/// Set one variable on one member.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlanStep {
    pub endpoint: String,
    pub variable: String,
    pub value: String,
    pub scope: VarScope,
}

impl fmt::Display for PlanStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "SET {} {} = '{}' on '{}'",
            self.scope, self.variable, self.value, self.endpoint
        )
    }
}

/// Scope used to apply a setting that should survive restarts.
pub fn durable_scope(persist_supported: bool) -> VarScope {
    if persist_supported {
        VarScope::Persist
    } else {
        VarScope::Global
    }
}

/// A plan that failed part way.
#[derive(Debug)]
pub struct PlanFailure {
    pub applied: Vec<PlanStep>,
    pub failed: PlanStep,
    pub error: Error,
}

impl PlanFailure {
    /// Collapse into a controller error naming the failed step.
    pub fn into_error(self) -> Error {
        let applied = if self.applied.is_empty() {
            "no step was applied".to_string()
        } else {
            let endpoints: Vec<String> = self.applied.iter().map(|s| s.to_string()).collect();
            format!("already applied: {}", endpoints.join("; "))
        };
        let message = format!(
            "Error while setting '{}' on '{}': {} ({applied})",
            self.failed.variable, self.failed.endpoint, self.error
        );
        match self.error {
            Error::Metadata(_) => Error::Metadata(message),
            _ => Error::Runtime(message),
        }
    }
}

/// An ordered list of steps.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConfigPlan {
    steps: Vec<PlanStep>,
}

impl ConfigPlan {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, endpoint: &str, variable: &str, value: &str, scope: VarScope) {
        self.steps.push(PlanStep {
            endpoint: endpoint.to_string(),
            variable: variable.to_string(),
            value: value.to_string(),
            scope,
        });
    }

    pub fn steps(&self) -> &[PlanStep] {
        &self.steps
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Distinct endpoints in step order.
    pub fn endpoints(&self) -> Vec<&str> {
        let mut seen: Vec<&str> = Vec::new();
        for step in &self.steps {
            if !seen.contains(&step.endpoint.as_str()) {
                seen.push(&step.endpoint);
            }
        }
        seen
    }

    /// Apply every step through `session`, which must target each step's endpoint.
    pub async fn apply_local<S: InstanceSession>(
        &self,
        session: &mut S,
    ) -> std::result::Result<Vec<PlanStep>, PlanFailure> {
        let mut applied = Vec::with_capacity(self.steps.len());
        for step in &self.steps {
            if let Err(e) = session.set_sysvar(&step.variable, &step.value, step.scope).await {
                return Err(PlanFailure {
                    applied,
                    failed: step.clone(),
                    error: e.into(),
                });
            }
            debug!(%step, "Applied");
            applied.push(step.clone());
        }
        Ok(applied)
    }

    /// Execute the plan, connecting to each endpoint once with `credentials`.
    #[instrument(skip_all, fields(steps = self.steps.len()))]
    pub async fn execute<C: Connector>(
        &self,
        ctx: &Context<C>,
        credentials: &InstanceDef,
    ) -> std::result::Result<Vec<PlanStep>, PlanFailure> {
        let mut applied: Vec<PlanStep> = Vec::with_capacity(self.steps.len());
        let mut current: Option<(String, C::Session)> = None;

        for step in &self.steps {
            if current.as_ref().is_none_or(|(ep, _)| *ep != step.endpoint) {
                match ctx.connect_endpoint(&step.endpoint, credentials).await {
                    Ok(session) => current = Some((step.endpoint.clone(), session)),
                    Err(error) => {
                        return Err(PlanFailure {
                            applied,
                            failed: step.clone(),
                            error,
                        });
                    }
                }
            }
            let Some((_, session)) = current.as_mut() else {
                continue;
            };
            if let Err(e) = session.set_sysvar(&step.variable, &step.value, step.scope).await {
                return Err(PlanFailure {
                    applied,
                    failed: step.clone(),
                    error: e.into(),
                });
            }
            debug!(%step, "Applied");
            applied.push(step.clone());
        }
        info!(applied = applied.len(), "Configuration plan executed");
        Ok(applied)
    }
}

/// Record the warning for members that only got a runtime change.
pub fn warn_unpersisted(plan: &ConfigPlan, report: &mut OperationReport) {
    for endpoint in plan.endpoints() {
        let runtime_only = plan
            .steps
            .iter()
            .any(|s| s.endpoint == endpoint && s.scope == VarScope::Global);
        if runtime_only {
            report.warn(format!(
                "On instance '{endpoint}' the persisted cluster configuration will not be updated \
                 as it is not supported by the server version. Please edit the option file of the \
                 instance manually to persist the change."
            ));
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::indexing_slicing)]
mod tests {
    use super::*;
    use crate::client::Sandbox;
    use crate::config::AdminConfig;
    use crate::controller::error::ErrorKind;

    #[tokio::test]
    async fn test_execute_in_order() {
        let sandbox = Sandbox::new();
        let def = sandbox.deploy(4710);
        sandbox.deploy(4720);
        let ctx = Context::new(sandbox.clone(), AdminConfig::default());

        let mut plan = ConfigPlan::new();
        plan.push("localhost:4710", "group_replication_member_weight", "70", VarScope::Persist);
        plan.push("localhost:4720", "group_replication_member_weight", "70", VarScope::Persist);
        assert_eq!(plan.endpoints(), vec!["localhost:4710", "localhost:4720"]);

        let applied = plan.execute(&ctx, &def).await.unwrap();
        assert_eq!(applied.len(), 2);
        assert_eq!(
            sandbox.persisted_var(4720, "group_replication_member_weight").as_deref(),
            Some("70")
        );
    }

    #[tokio::test]
    async fn test_failure_names_step() {
        let sandbox = Sandbox::new();
        let def = sandbox.deploy(4730);
        sandbox.deploy(4740);
        sandbox.kill(4740);
        let ctx = Context::new(sandbox.clone(), AdminConfig::default());

        let mut plan = ConfigPlan::new();
        plan.push("localhost:4730", "group_replication_member_weight", "10", VarScope::Global);
        plan.push("localhost:4740", "group_replication_member_weight", "10", VarScope::Global);
        let failure = plan.execute(&ctx, &def).await.unwrap_err();
        assert_eq!(failure.applied.len(), 1);
        assert_eq!(failure.failed.endpoint, "localhost:4740");

        let err = failure.into_error();
        assert_eq!(err.kind(), ErrorKind::RuntimeError);
        assert!(err.to_string().contains("'localhost:4740'"));
        assert!(err.to_string().contains("already applied"));
    }

    #[test]
    fn test_unpersisted_warning() {
        let mut plan = ConfigPlan::new();
        plan.push("localhost:1", "x", "1", durable_scope(false));
        plan.push("localhost:2", "x", "1", durable_scope(true));
        let mut report = OperationReport::new();
        warn_unpersisted(&plan, &mut report);
        assert_eq!(report.warnings.len(), 1);
        assert!(report.warnings[0].contains("'localhost:1'"));
    }
}

//! Shared context for controller operations.
//!
//! The context holds the connector used to reach servers and the timeouts
//! bounding every wait. It is passed explicitly to each operation; there is no
//! ambient default session.

use std::str::FromStr;

use serde::Serialize;
use tracing::{info, warn};

use crate::client::{ClientError, Connector, InstanceDef};
use crate::config::AdminConfig;
use crate::controller::error::Result;

/// Shared context for the controller
#[derive(Clone, Debug)]
pub struct Context<C: Connector> {
    pub connector: C,
    pub config: AdminConfig,
}

impl<C: Connector> Context<C> {
    pub fn new(connector: C, config: AdminConfig) -> Self {
        Self { connector, config }
    }

    /// Open a session to `instance`.
    pub async fn connect(&self, instance: &InstanceDef) -> Result<C::Session> {
        Ok(self.connector.connect(instance).await?)
    }

    /// Open a session to a `host:port` endpoint with the anchor's credentials.
    pub async fn connect_endpoint(
        &self,
        endpoint: &str,
        credentials: &InstanceDef,
    ) -> Result<C::Session> {
        let def = endpoint_def(endpoint, credentials)?;
        self.connect(&def).await
    }

    /// Sleep one poll interval.
    pub async fn pause(&self) {
        tokio::time::sleep(self.config.poll_interval).await;
    }
}

/// Definition for `endpoint` carrying the credentials of `credentials`.
pub fn endpoint_def(endpoint: &str, credentials: &InstanceDef) -> Result<InstanceDef> {
    let def = InstanceDef::from_str(endpoint).map_err(ClientError::from)?;
    Ok(def.with_credentials_from(credentials))
}

/// Warnings and notes produced while an operation ran.
///
/// Everything recorded here is also emitted as a `tracing` event.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct OperationReport {
    pub warnings: Vec<String>,
    pub notes: Vec<String>,
}

impl OperationReport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn warn(&mut self, message: impl Into<String>) {
        let message = message.into();
        warn!("{message}");
        self.warnings.push(message);
    }

    pub fn note(&mut self, message: impl Into<String>) {
        let message = message.into();
        info!("{message}");
        self.notes.push(message);
    }

    pub fn extend(&mut self, other: OperationReport) {
        self.warnings.extend(other.warnings);
        self.notes.extend(other.notes);
    }

    pub fn has_warning(&self, needle: &str) -> bool {
        self.warnings.iter().any(|w| w.contains(needle))
    }
}

/// A value returned together with the report of the operation that produced it.
#[derive(Debug)]
pub struct Reported<T> {
    pub value: T,
    pub report: OperationReport,
}

impl<T> Reported<T> {
    pub fn new(value: T, report: OperationReport) -> Self {
        Self { value, report }
    }

    pub fn into_inner(self) -> T {
        self.value
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_endpoint_def_inherits_credentials() {
        let anchor: InstanceDef = "admin:secret@localhost:3310".parse().unwrap();
        let def = endpoint_def("localhost:3320", &anchor).unwrap();
        assert_eq!(def.port, 3320);
        assert_eq!(def.user.as_deref(), Some("admin"));
        assert_eq!(def.password.as_deref(), Some("secret"));
    }

    #[test]
    fn test_report_collects() {
        let mut report = OperationReport::new();
        report.warn("first");
        report.note("done");
        let mut other = OperationReport::new();
        other.warn("second");
        report.extend(other);
        assert_eq!(report.warnings, vec!["first", "second"]);
        assert!(report.has_warning("sec"));
    }
}

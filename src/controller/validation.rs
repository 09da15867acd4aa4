//! Validation of names, labels and instance configuration.
//!
//! Names and labels are checked before any server is contacted. The
//! configuration compliance check compares a fixed table of required system
//! variable values with what the server reports.

use std::sync::LazyLock;

use regex::Regex;
use serde::Serialize;
use tracing::{debug, instrument};

use crate::client::InstanceSession;
use crate::controller::error::{Error, Result};

/// Maximum cluster name length
pub const MAX_CLUSTER_NAME_LENGTH: usize = 40;

/// Maximum instance label length
pub const MAX_LABEL_LENGTH: usize = 256;

static CLUSTER_NAME_START: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z_]").ok());
static CLUSTER_NAME_BODY: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$").ok());
static LABEL_START: LazyLock<Option<Regex>> = LazyLock::new(|| Regex::new(r"^[A-Za-z0-9_]").ok());
static LABEL_BODY: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9_][A-Za-z0-9_.:\-]*$").ok());

fn matches(re: &LazyLock<Option<Regex>>, value: &str) -> bool {
    re.as_ref().is_some_and(|re| re.is_match(value))
}

/// Validate a cluster name
pub fn validate_cluster_name(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(Error::Argument("The Cluster name cannot be empty.".to_string()));
    }
    if !matches(&CLUSTER_NAME_START, name) {
        return Err(Error::Argument(
            "The Cluster name can only start with an alphabetic or the '_' character.".to_string(),
        ));
    }
    if name.chars().count() > MAX_CLUSTER_NAME_LENGTH {
        return Err(Error::Argument(format!(
            "The Cluster name can not be greater than {MAX_CLUSTER_NAME_LENGTH} characters."
        )));
    }
    if !matches(&CLUSTER_NAME_BODY, name) {
        return Err(Error::Argument(
            "The Cluster name can only contain alphanumerics or the '_' character.".to_string(),
        ));
    }
    Ok(())
}

/// Validate an instance label
pub fn validate_label(label: &str) -> Result<()> {
    if label.is_empty() {
        return Err(Error::Argument("The label can not be empty.".to_string()));
    }
    if label.chars().count() > MAX_LABEL_LENGTH {
        return Err(Error::Argument(format!(
            "The label can not be greater than {MAX_LABEL_LENGTH} characters."
        )));
    }
    if !matches(&LABEL_START, label) {
        return Err(Error::Argument(
            "The label can only start with an alphanumeric or the '_' character.".to_string(),
        ));
    }
    if !matches(&LABEL_BODY, label) {
        return Err(Error::Argument(
            "The label can only contain alphanumerics or the '_', '.', '-', ':' characters."
                .to_string(),
        ));
    }
    Ok(())
}

/// A system variable every group member must have.
#[derive(Debug, Clone, Copy)]
pub struct RequiredSetting {
    pub variable: &'static str,
    pub required: &'static str,
    /// Can be changed without a restart.
    pub dynamic: bool,
}

pub static REQUIRED_SETTINGS: &[RequiredSetting] = &[
    RequiredSetting {
        variable: "binlog_format",
        required: "ROW",
        dynamic: true,
    },
    RequiredSetting {
        variable: "binlog_checksum",
        required: "NONE",
        dynamic: true,
    },
    RequiredSetting {
        variable: "gtid_mode",
        required: "ON",
        dynamic: false,
    },
    RequiredSetting {
        variable: "enforce_gtid_consistency",
        required: "ON",
        dynamic: false,
    },
    RequiredSetting {
        variable: "log_bin",
        required: "ON",
        dynamic: false,
    },
    RequiredSetting {
        variable: "log_slave_updates",
        required: "ON",
        dynamic: false,
    },
    RequiredSetting {
        variable: "master_info_repository",
        required: "TABLE",
        dynamic: true,
    },
    RequiredSetting {
        variable: "relay_log_info_repository",
        required: "TABLE",
        dynamic: true,
    },
    RequiredSetting {
        variable: "transaction_write_set_extraction",
        required: "XXHASH64",
        dynamic: true,
    },
];

const NOTE_DYNAMIC: &str = "Update the server variable";
const NOTE_RESTART: &str = "Update read-only variable and restart the server";

/// One row of the compliance report.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ComplianceIssue {
    pub variable: String,
    pub current: String,
    pub required: String,
    pub note: String,
}

impl ComplianceIssue {
    pub fn requires_restart(&self) -> bool {
        self.note == NOTE_RESTART
    }
}

/// Result of `checkInstanceConfiguration`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ComplianceReport {
    pub status: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub config_errors: Vec<ComplianceIssue>,
    pub restart_required: bool,
}

impl ComplianceReport {
    fn from_issues(issues: Vec<ComplianceIssue>) -> Self {
        Self {
            status: if issues.is_empty() { "ok" } else { "error" }.to_string(),
            restart_required: issues.iter().any(ComplianceIssue::requires_restart),
            config_errors: issues,
        }
    }

    pub fn is_ok(&self) -> bool {
        self.config_errors.is_empty()
    }

    /// Operator-facing table of the issues.
    pub fn render(&self) -> String {
        let mut out = String::from("Variable | Current Value | Required Value | Note\n");
        for issue in &self.config_errors {
            out.push_str(&format!(
                "{} | {} | {} | {}\n",
                issue.variable, issue.current, issue.required, issue.note
            ));
        }
        out
    }
}

/// Whether a reported value satisfies a required one; `1` and `ON` are equal.
pub fn values_match(current: &str, required: &str) -> bool {
    let canon = |v: &str| match v.trim().to_uppercase().as_str() {
        "1" | "ON" | "TRUE" => "ON".to_string(),
        "0" | "OFF" | "FALSE" => "OFF".to_string(),
        other => other.to_string(),
    };
    canon(current) == canon(required)
}

/// Compare the server's configuration with the required settings.
#[instrument(skip_all, fields(endpoint = %session.instance().endpoint()))]
pub async fn check_compliance<S: InstanceSession>(session: &mut S) -> Result<ComplianceReport> {
    let mut issues = Vec::new();
    for setting in REQUIRED_SETTINGS {
        let current = session.get_sysvar(setting.variable).await?;
        let current = current.unwrap_or_else(|| "<not set>".to_string());
        if !values_match(&current, setting.required) {
            issues.push(ComplianceIssue {
                variable: setting.variable.to_string(),
                current,
                required: setting.required.to_string(),
                note: if setting.dynamic { NOTE_DYNAMIC } else { NOTE_RESTART }.to_string(),
            });
        }
    }

    let server_id = session.get_sysvar("server_id").await?.unwrap_or_default();
    if server_id.trim().parse::<u32>().unwrap_or(0) == 0 {
        issues.push(ComplianceIssue {
            variable: "server_id".to_string(),
            current: server_id,
            required: "<unique ID>".to_string(),
            note: NOTE_RESTART.to_string(),
        });
    }

    debug!(issues = issues.len(), "Configuration checked");
    Ok(ComplianceReport::from_issues(issues))
}

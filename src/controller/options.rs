//! Option and validation rules.
//!
//! A static table maps every configuration knob accepted by the controller
//! to its value type, legal range, minimum server version, persistence and
//! the group replication variable behind it. Every entry point consults the
//! table before a server is touched.

use std::collections::BTreeSet;
use std::fmt;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::client::ServerVersion;
use crate::controller::error::{Error, Result};

/// Where an option may be set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OptionUse {
    pub create: bool,
    pub add: bool,
    pub rejoin: bool,
    /// `<Cluster>.setOption()`
    pub cluster: bool,
    /// `<Cluster>.setInstanceOption()`
    pub instance: bool,
}

impl OptionUse {
    const fn new(create: bool, add: bool, rejoin: bool, cluster: bool, instance: bool) -> Self {
        Self {
            create,
            add,
            rejoin,
            cluster,
            instance,
        }
    }
}

/// Type and legal values of an option.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OptionKind {
    Integer { min: i64, max: i64 },
    /// Case-insensitive choice with numeric aliases.
    Choice {
        values: &'static [&'static str],
        aliases: &'static [(&'static str, &'static str)],
    },
    SslMode,
    /// Non-empty string.
    Text,
    Uuid,
    Bool,
}

/// One row of the option table.
#[derive(Debug, Clone)]
pub struct OptionSpec {
    pub name: &'static str,
    /// Group replication variable, `None` for metadata-only options.
    pub variable: Option<&'static str>,
    pub kind: OptionKind,
    /// Minimum 5.7 version, `None` when 5.7 does not support it at all.
    pub min_57: Option<ServerVersion>,
    pub min_80: ServerVersion,
    /// Persisted with `SET PERSIST` on servers that support it.
    pub persisted: bool,
    pub usage: OptionUse,
}

const ANY_57: Option<ServerVersion> = Some(ServerVersion::new(5, 7, 17));
const ANY_80: ServerVersion = ServerVersion::new(8, 0, 0);

pub const EXIT_STATE_ACTIONS: &[&str] = &["ABORT_SERVER", "READ_ONLY", "OFFLINE_MODE"];
pub const CONSISTENCY_LEVELS: &[&str] = &[
    "EVENTUAL",
    "BEFORE_ON_PRIMARY_FAILOVER",
    "BEFORE",
    "AFTER",
    "BEFORE_AND_AFTER",
];
pub const MEMBER_SSL_MODES: &[&str] = &["AUTO", "DISABLED", "REQUIRED"];

/// `OFFLINE_MODE` exists from this version.
const OFFLINE_MODE_MIN: ServerVersion = ServerVersion::new(8, 0, 18);
/// Clone based provisioning exists from this version.
const CLONE_MIN: ServerVersion = ServerVersion::new(8, 0, 17);

pub static OPTIONS: &[OptionSpec] = &[
    OptionSpec {
        name: "memberSslMode",
        variable: Some("group_replication_ssl_mode"),
        kind: OptionKind::SslMode,
        min_57: ANY_57,
        min_80: ANY_80,
        persisted: true,
        usage: OptionUse::new(true, true, true, false, false),
    },
    OptionSpec {
        name: "ipWhitelist",
        variable: Some("group_replication_ip_whitelist"),
        kind: OptionKind::Text,
        min_57: ANY_57,
        min_80: ANY_80,
        persisted: true,
        usage: OptionUse::new(true, true, true, false, false),
    },
    OptionSpec {
        name: "localAddress",
        variable: Some("group_replication_local_address"),
        kind: OptionKind::Text,
        min_57: ANY_57,
        min_80: ANY_80,
        persisted: true,
        usage: OptionUse::new(true, true, false, false, false),
    },
    OptionSpec {
        name: "groupSeeds",
        variable: Some("group_replication_group_seeds"),
        kind: OptionKind::Text,
        min_57: ANY_57,
        min_80: ANY_80,
        persisted: true,
        usage: OptionUse::new(true, true, false, false, false),
    },
    OptionSpec {
        name: "groupName",
        variable: Some("group_replication_group_name"),
        kind: OptionKind::Uuid,
        min_57: ANY_57,
        min_80: ANY_80,
        persisted: true,
        usage: OptionUse::new(true, false, false, false, false),
    },
    OptionSpec {
        name: "exitStateAction",
        variable: Some("group_replication_exit_state_action"),
        kind: OptionKind::Choice {
            values: EXIT_STATE_ACTIONS,
            aliases: &[("0", "READ_ONLY"), ("1", "ABORT_SERVER"), ("2", "OFFLINE_MODE")],
        },
        min_57: Some(ServerVersion::new(5, 7, 24)),
        min_80: ServerVersion::new(8, 0, 12),
        persisted: true,
        usage: OptionUse::new(true, true, false, true, true),
    },
    OptionSpec {
        name: "memberWeight",
        variable: Some("group_replication_member_weight"),
        kind: OptionKind::Integer { min: 0, max: 100 },
        min_57: Some(ServerVersion::new(5, 7, 20)),
        min_80: ServerVersion::new(8, 0, 11),
        persisted: true,
        usage: OptionUse::new(true, true, false, true, true),
    },
    OptionSpec {
        name: "failoverConsistency",
        variable: Some("group_replication_consistency"),
        kind: OptionKind::Choice {
            values: &["EVENTUAL", "BEFORE_ON_PRIMARY_FAILOVER"],
            aliases: &[("0", "EVENTUAL"), ("1", "BEFORE_ON_PRIMARY_FAILOVER")],
        },
        min_57: None,
        min_80: ServerVersion::new(8, 0, 14),
        persisted: true,
        usage: OptionUse::new(true, false, false, true, false),
    },
    OptionSpec {
        name: "consistency",
        variable: Some("group_replication_consistency"),
        kind: OptionKind::Choice {
            values: CONSISTENCY_LEVELS,
            aliases: &[
                ("0", "EVENTUAL"),
                ("1", "BEFORE_ON_PRIMARY_FAILOVER"),
                ("2", "BEFORE"),
                ("3", "AFTER"),
                ("4", "BEFORE_AND_AFTER"),
            ],
        },
        min_57: None,
        min_80: ServerVersion::new(8, 0, 14),
        persisted: true,
        usage: OptionUse::new(true, false, false, true, false),
    },
    OptionSpec {
        name: "expelTimeout",
        variable: Some("group_replication_member_expel_timeout"),
        kind: OptionKind::Integer { min: 0, max: 3600 },
        min_57: None,
        min_80: ServerVersion::new(8, 0, 13),
        persisted: true,
        usage: OptionUse::new(true, false, false, true, false),
    },
    OptionSpec {
        name: "autoRejoinTries",
        variable: Some("group_replication_autorejoin_tries"),
        kind: OptionKind::Integer { min: 0, max: 2016 },
        min_57: None,
        min_80: ServerVersion::new(8, 0, 16),
        persisted: true,
        usage: OptionUse::new(true, true, false, true, true),
    },
    OptionSpec {
        name: "disableClone",
        variable: None,
        kind: OptionKind::Bool,
        min_57: None,
        min_80: CLONE_MIN,
        persisted: false,
        usage: OptionUse::new(true, false, false, true, false),
    },
    OptionSpec {
        name: "clusterName",
        variable: None,
        kind: OptionKind::Text,
        min_57: ANY_57,
        min_80: ANY_80,
        persisted: false,
        usage: OptionUse::new(false, false, false, true, false),
    },
    OptionSpec {
        name: "label",
        variable: None,
        kind: OptionKind::Text,
        min_57: ANY_57,
        min_80: ANY_80,
        persisted: false,
        usage: OptionUse::new(false, true, false, false, true),
    },
];

/// Options reported per member by `<Cluster>.options()`, in report order.
pub const REPORTED_MEMBER_OPTIONS: &[&str] = &[
    "consistency",
    "exitStateAction",
    "expelTimeout",
    "groupSeeds",
    "ipWhitelist",
    "localAddress",
    "memberWeight",
    "autoRejoinTries",
];

pub fn lookup(name: &str) -> Option<&'static OptionSpec> {
    OPTIONS.iter().find(|o| o.name == name)
}

/// A caller-supplied option value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum OptionValue {
    Bool(bool),
    Int(i64),
    Str(String),
}

impl From<&str> for OptionValue {
    fn from(value: &str) -> Self {
        OptionValue::Str(value.to_string())
    }
}

impl From<String> for OptionValue {
    fn from(value: String) -> Self {
        OptionValue::Str(value)
    }
}

impl From<i64> for OptionValue {
    fn from(value: i64) -> Self {
        OptionValue::Int(value)
    }
}

impl From<bool> for OptionValue {
    fn from(value: bool) -> Self {
        OptionValue::Bool(value)
    }
}

impl fmt::Display for OptionValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OptionValue::Bool(b) => write!(f, "{b}"),
            OptionValue::Int(i) => write!(f, "{i}"),
            OptionValue::Str(s) => write!(f, "{s}"),
        }
    }
}

impl OptionValue {
    fn type_name(&self) -> &'static str {
        match self {
            OptionValue::Bool(_) => "Bool",
            OptionValue::Int(_) => "Integer",
            OptionValue::Str(_) => "String",
        }
    }
}

impl OptionSpec {
    /// Whether `version` knows this option.
    pub fn supported_on(&self, version: &ServerVersion) -> bool {
        if version.major() == 5 {
            self.min_57.as_ref().is_some_and(|min| version >= min)
        } else {
            version >= &self.min_80
        }
    }

    pub fn check_version(&self, version: &ServerVersion) -> Result<()> {
        if self.supported_on(version) {
            Ok(())
        } else {
            Err(Error::Runtime(format!(
                "Option '{}' not supported on target server version: '{version}'",
                self.name
            )))
        }
    }

    /// Validate `value` and return its canonical server form.
    ///
    /// Runs without any server contact.
    pub fn normalize(&self, value: &OptionValue) -> Result<String> {
        let name = self.name;
        match self.kind {
            OptionKind::Integer { min, max } => {
                let n = match value {
                    OptionValue::Int(n) => *n,
                    OptionValue::Str(s) => s.trim().parse::<i64>().map_err(|_| {
                        Error::Argument(format!(
                            "Invalid value for {name}, integer value must be in the range: [{min}, {max}]"
                        ))
                    })?,
                    OptionValue::Bool(_) => return Err(type_error(name, "Integer", value)),
                };
                if !(min..=max).contains(&n) {
                    return Err(Error::Argument(format!(
                        "Invalid value for {name}, integer value must be in the range: [{min}, {max}]"
                    )));
                }
                Ok(n.to_string())
            }
            OptionKind::Choice { values, aliases } => {
                let raw = match value {
                    OptionValue::Str(s) => s.trim().to_string(),
                    OptionValue::Int(n) => n.to_string(),
                    OptionValue::Bool(_) => return Err(type_error(name, "String", value)),
                };
                if raw.is_empty() {
                    return Err(Error::Argument(format!(
                        "Invalid value for {name}, string value cannot be empty."
                    )));
                }
                let upper = raw.to_uppercase();
                let resolved = aliases
                    .iter()
                    .find(|(alias, _)| *alias == upper)
                    .map(|(_, v)| (*v).to_string())
                    .unwrap_or(upper);
                if values.contains(&resolved.as_str()) {
                    Ok(resolved)
                } else {
                    Err(Error::Argument(format!(
                        "Variable '{}' can't be set to the value of '{raw}'",
                        self.variable.unwrap_or(name)
                    )))
                }
            }
            OptionKind::SslMode => {
                let OptionValue::Str(s) = value else {
                    return Err(type_error(name, "String", value));
                };
                let upper = s.trim().to_uppercase();
                if MEMBER_SSL_MODES.contains(&upper.as_str()) {
                    Ok(upper)
                } else {
                    Err(Error::Argument(format!(
                        "Invalid value for memberSslMode option. Supported values: {}.",
                        MEMBER_SSL_MODES.join(",")
                    )))
                }
            }
            OptionKind::Text => {
                let OptionValue::Str(s) = value else {
                    return Err(type_error(name, "String", value));
                };
                if s.trim().is_empty() {
                    Err(Error::Argument(format!(
                        "Invalid value for {name}: string value cannot be empty."
                    )))
                } else {
                    Ok(s.trim().to_string())
                }
            }
            OptionKind::Uuid => {
                let OptionValue::Str(s) = value else {
                    return Err(type_error(name, "String", value));
                };
                uuid::Uuid::parse_str(s.trim())
                    .map(|u| u.hyphenated().to_string())
                    .map_err(|_| {
                        Error::Argument(format!(
                            "Invalid value for {name}: '{s}' is not a valid UUID."
                        ))
                    })
            }
            OptionKind::Bool => match value {
                OptionValue::Bool(b) => Ok(b.to_string()),
                OptionValue::Int(0) => Ok("false".to_string()),
                OptionValue::Int(1) => Ok("true".to_string()),
                OptionValue::Str(s) if s.eq_ignore_ascii_case("true") => Ok("true".to_string()),
                OptionValue::Str(s) if s.eq_ignore_ascii_case("false") => Ok("false".to_string()),
                other => Err(type_error(name, "Bool", other)),
            },
        }
    }

    /// Version checks that depend on the value itself.
    pub fn check_value_version(&self, normalized: &str, version: &ServerVersion) -> Result<()> {
        if self.name == "exitStateAction" && normalized == "OFFLINE_MODE" && *version < OFFLINE_MODE_MIN
        {
            return Err(Error::Runtime(format!(
                "Variable 'group_replication_exit_state_action' can't be set to the value of \
                 'OFFLINE_MODE' on target server version: '{version}'"
            )));
        }
        Ok(())
    }
}

fn type_error(name: &str, expected: &str, value: &OptionValue) -> Error {
    Error::Argument(format!(
        "Option '{name}' is expected to be of type {expected}, but is {}",
        value.type_name()
    ))
}

/// Which entry point an option is validated for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OptionTarget {
    Create,
    Add,
    Rejoin,
    Cluster,
    Instance,
}

/// Find and validate option `name` for `target`.
pub fn resolve(
    name: &str,
    value: &OptionValue,
    target: OptionTarget,
) -> Result<(&'static OptionSpec, String)> {
    let spec = lookup(name)
        .filter(|spec| match target {
            OptionTarget::Create => spec.usage.create,
            OptionTarget::Add => spec.usage.add,
            OptionTarget::Rejoin => spec.usage.rejoin,
            OptionTarget::Cluster => spec.usage.cluster,
            OptionTarget::Instance => spec.usage.instance,
        })
        .ok_or_else(|| Error::Argument(format!("Option '{name}' not supported.")))?;
    let normalized = spec.normalize(value)?;
    Ok((spec, normalized))
}

/// Validated group replication settings requested by the caller.
#[derive(Debug, Clone, Default)]
pub struct GrSettings {
    /// (option spec, canonical value), in table order.
    pub entries: Vec<(&'static OptionSpec, String)>,
}

impl GrSettings {
    /// Validate every `Some` value of `pairs` for `target`.
    pub fn collect(
        pairs: &[(&str, Option<&OptionValue>)],
        target: OptionTarget,
    ) -> Result<Self> {
        let mut entries = Vec::new();
        for (name, value) in pairs {
            if let Some(value) = value {
                entries.push(resolve(name, value, target)?);
            }
        }
        Ok(Self { entries })
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(spec, _)| spec.name == name)
            .map(|(_, v)| v.as_str())
    }

    /// Fail on the first option `version` does not support.
    pub fn check_version(&self, version: &ServerVersion) -> Result<()> {
        for (spec, value) in &self.entries {
            spec.check_version(version)?;
            spec.check_value_version(value, version)?;
        }
        Ok(())
    }

    /// (variable, value) pairs for the options backed by a server variable.
    pub fn variables(&self) -> impl Iterator<Item = (&'static str, &str)> {
        self.entries
            .iter()
            .filter_map(|(spec, value)| spec.variable.map(|var| (var, value.as_str())))
    }
}

/// Deserialize an operation's option dictionary, rejecting unknown keys.
///
/// `known` lists the accepted keys in camelCase.
pub fn parse_operation_options<T: DeserializeOwned>(
    options: &serde_json::Value,
    known: &[&str],
) -> Result<T> {
    let map = match options {
        serde_json::Value::Null => serde_json::Map::new(),
        serde_json::Value::Object(map) => map.clone(),
        _ => {
            return Err(Error::Argument(
                "Argument #2 is expected to be a map".to_string(),
            ));
        }
    };
    let unknown: BTreeSet<&str> = map
        .keys()
        .map(String::as_str)
        .filter(|k| !known.contains(k))
        .collect();
    if !unknown.is_empty() {
        return Err(Error::Argument(format!(
            "Invalid values in the options: {}",
            unknown.into_iter().collect::<Vec<_>>().join(", ")
        )));
    }
    serde_json::from_value(serde_json::Value::Object(map))
        .map_err(|e| Error::Argument(format!("Invalid options: {e}")))
}

/// `auto_increment_increment` and `auto_increment_offset` for a multi-primary member.
pub fn multi_primary_auto_increment(member_count: usize, server_id: u32) -> (u64, u64) {
    let increment = (member_count as u64).max(7);
    (increment, 1 + u64::from(server_id) % increment)
}

/// `auto_increment_increment` and `auto_increment_offset` for single-primary mode.
pub const SINGLE_PRIMARY_AUTO_INCREMENT: (u64, u64) = (1, 2);

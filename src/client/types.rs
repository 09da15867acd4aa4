//! Types for parsed server and group replication information.
//!
//! These types represent the rows returned by `performance_schema.replication_group_members`,
//! server identity variables and GTID sets.

use std::collections::BTreeMap;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors that can occur when parsing server data.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ParseError {
    #[error("Invalid member state: {0}")]
    InvalidMemberState(String),
    #[error("Invalid member role: {0}")]
    InvalidMemberRole(String),
    #[error("Invalid server version: {0}")]
    InvalidVersion(String),
    #[error("Invalid GTID set: {0}")]
    InvalidGtidSet(String),
    #[error("Invalid instance definition: {0}")]
    InvalidInstanceDef(String),
}

/// Live state of a member as reported by the group communication layer.
///
/// `(MISSING)` is deliberately absent: it is derived from metadata presence,
/// see [`crate::group::MemberView::display_status`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MemberState {
    Online,
    Recovering,
    Offline,
    Error,
    Unreachable,
}

impl MemberState {
    /// Whether the member takes part in the group (counts towards a majority).
    pub fn is_active(&self) -> bool {
        matches!(self, MemberState::Online | MemberState::Recovering)
    }
}

impl FromStr for MemberState {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_uppercase().as_str() {
            "ONLINE" => Ok(MemberState::Online),
            "RECOVERING" => Ok(MemberState::Recovering),
            "OFFLINE" => Ok(MemberState::Offline),
            "ERROR" => Ok(MemberState::Error),
            "UNREACHABLE" => Ok(MemberState::Unreachable),
            _ => Err(ParseError::InvalidMemberState(s.to_string())),
        }
    }
}

impl std::fmt::Display for MemberState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MemberState::Online => write!(f, "ONLINE"),
            MemberState::Recovering => write!(f, "RECOVERING"),
            MemberState::Offline => write!(f, "OFFLINE"),
            MemberState::Error => write!(f, "ERROR"),
            MemberState::Unreachable => write!(f, "UNREACHABLE"),
        }
    }
}

/// Role of a member in the group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MemberRole {
    Primary,
    Secondary,
}

impl FromStr for MemberRole {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_uppercase().as_str() {
            "PRIMARY" => Ok(MemberRole::Primary),
            "SECONDARY" => Ok(MemberRole::Secondary),
            _ => Err(ParseError::InvalidMemberRole(s.to_string())),
        }
    }
}

impl std::fmt::Display for MemberRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MemberRole::Primary => write!(f, "PRIMARY"),
            MemberRole::Secondary => write!(f, "SECONDARY"),
        }
    }
}

/// One row of the group membership view as seen by a member.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupMember {
    /// `server_uuid` of the member.
    pub uuid: String,
    pub host: String,
    pub port: u16,
    pub state: MemberState,
    pub role: MemberRole,
}

impl GroupMember {
    /// `host:port` endpoint of the member.
    pub fn endpoint(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Identity and version information of a server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerInfo {
    pub uuid: String,
    pub server_id: u32,
    pub version: ServerVersion,
    pub super_read_only: bool,
    /// `group_replication_group_name`, empty when never configured.
    pub group_name: String,
    /// Whether the group was configured in single-primary mode.
    pub single_primary_mode: bool,
}

/// Scope used when changing a system variable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VarScope {
    /// Runtime only.
    Global,
    /// Runtime and persisted to the server's durable configuration.
    Persist,
    /// Persisted only, applied on next restart.
    PersistOnly,
}

impl std::fmt::Display for VarScope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            VarScope::Global => write!(f, "GLOBAL"),
            VarScope::Persist => write!(f, "PERSIST"),
            VarScope::PersistOnly => write!(f, "PERSIST_ONLY"),
        }
    }
}

/// A replication channel other than the group replication ones.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplicationChannel {
    pub name: String,
    pub running: bool,
}

/// Server version with helpers for feature gating.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ServerVersion(semver::Version);

impl ServerVersion {
    pub const fn new(major: u64, minor: u64, patch: u64) -> Self {
        Self(semver::Version::new(major, minor, patch))
    }

    pub fn major(&self) -> u64 {
        self.0.major
    }

    pub fn minor(&self) -> u64 {
        self.0.minor
    }

    /// `SET PERSIST` is available.
    pub fn supports_persist(&self) -> bool {
        *self >= ServerVersion::new(8, 0, 11)
    }

    /// Group-wide configuration changes (mode switch, primary election).
    pub fn supports_group_config_change(&self) -> bool {
        *self >= ServerVersion::new(8, 0, 13)
    }

    pub fn supports_clone(&self) -> bool {
        *self >= ServerVersion::new(8, 0, 17)
    }

    /// `MEMBER_ROLE` column in `replication_group_members`.
    pub fn reports_member_role(&self) -> bool {
        *self >= ServerVersion::new(8, 0, 2)
    }
}

impl FromStr for ServerVersion {
    type Err = ParseError;

    /// Accepts `8.0.14`, `8.0.14-log`, `5.7.24-debug` and similar.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let numeric = s
            .trim()
            .split(['-', ' '])
            .next()
            .unwrap_or_default();
        let mut parts = numeric.split('.').map(|p| p.parse::<u64>());
        match (parts.next(), parts.next(), parts.next()) {
            (Some(Ok(major)), Some(Ok(minor)), Some(Ok(patch))) => {
                Ok(Self::new(major, minor, patch))
            }
            (Some(Ok(major)), Some(Ok(minor)), None) => Ok(Self::new(major, minor, 0)),
            _ => Err(ParseError::InvalidVersion(s.to_string())),
        }
    }
}

impl std::fmt::Display for ServerVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// An executed GTID set, e.g. `3e11fa47-71ca-11e1-9e33-c80aa9429562:1-5:7,4f...:1-3`.
///
/// Intervals per source are kept sorted and merged.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GtidSet {
    sources: BTreeMap<String, Vec<(u64, u64)>>,
}

impl GtidSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.sources.is_empty()
    }

    /// Add the interval `start..=end` for `source`.
    pub fn add(&mut self, source: &str, start: u64, end: u64) {
        let intervals = self.sources.entry(source.to_lowercase()).or_default();
        intervals.push((start.min(end), start.max(end)));
        intervals.sort_unstable();

        let mut merged: Vec<(u64, u64)> = Vec::with_capacity(intervals.len());
        for &(s, e) in intervals.iter() {
            match merged.last_mut() {
                Some(last) if s <= last.1.saturating_add(1) => last.1 = last.1.max(e),
                _ => merged.push((s, e)),
            }
        }
        *intervals = merged;
    }

    /// Highest transaction number recorded for `source`.
    pub fn last_transaction(&self, source: &str) -> Option<u64> {
        self.sources
            .get(&source.to_lowercase())
            .and_then(|i| i.last())
            .map(|&(_, e)| e)
    }

    /// Whether every transaction in `self` is also in `other`.
    pub fn is_subset_of(&self, other: &GtidSet) -> bool {
        self.sources.iter().all(|(source, intervals)| {
            let Some(theirs) = other.sources.get(source) else {
                return false;
            };
            intervals
                .iter()
                .all(|&(s, e)| theirs.iter().any(|&(ts, te)| ts <= s && e <= te))
        })
    }

    /// Transactions present in `self` but not in `other`.
    pub fn difference(&self, other: &GtidSet) -> GtidSet {
        let mut out = GtidSet::new();
        for (source, intervals) in &self.sources {
            let theirs = other.sources.get(source).cloned().unwrap_or_default();
            for &(s, e) in intervals {
                let mut cursor = s;
                for &(ts, te) in &theirs {
                    if te < cursor || ts > e {
                        continue;
                    }
                    if ts > cursor {
                        out.add(source, cursor, ts - 1);
                    }
                    cursor = te.saturating_add(1);
                }
                if cursor <= e {
                    out.add(source, cursor, e);
                }
            }
        }
        out
    }
}

impl FromStr for GtidSet {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut set = GtidSet::new();
        for entry in s.split(',').map(str::trim).filter(|e| !e.is_empty()) {
            let mut parts = entry.split(':');
            let source = parts
                .next()
                .filter(|p| uuid::Uuid::parse_str(p).is_ok())
                .ok_or_else(|| ParseError::InvalidGtidSet(entry.to_string()))?;
            for interval in parts {
                let (start, end) = match interval.split_once('-') {
                    Some((a, b)) => (a.parse::<u64>(), b.parse::<u64>()),
                    None => (interval.parse::<u64>(), interval.parse::<u64>()),
                };
                match (start, end) {
                    (Ok(start), Ok(end)) => set.add(source, start, end),
                    _ => return Err(ParseError::InvalidGtidSet(entry.to_string())),
                }
            }
        }
        Ok(set)
    }
}

impl std::fmt::Display for GtidSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let entries: Vec<String> = self
            .sources
            .iter()
            .map(|(source, intervals)| {
                let ranges: Vec<String> = intervals
                    .iter()
                    .map(|&(s, e)| {
                        if s == e {
                            s.to_string()
                        } else {
                            format!("{s}-{e}")
                        }
                    })
                    .collect();
                format!("{}:{}", source, ranges.join(":"))
            })
            .collect();
        write!(f, "{}", entries.join(","))
    }
}

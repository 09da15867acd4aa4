//! Reconciled view of a group and its quorum verdict.

use serde::{Deserialize, Serialize};

use crate::client::{MemberRole, MemberState};

/// Health verdict of a group as seen from one anchor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum QuorumVerdict {
    /// Quorum, every recorded member active, at least one failure tolerated.
    #[serde(rename = "OK")]
    Ok,
    /// Quorum and at least one failure tolerated, but some recorded members are not active.
    #[serde(rename = "OK_PARTIAL")]
    OkPartial,
    /// Quorum, but losing one more member loses it.
    #[serde(rename = "OK_NO_TOLERANCE")]
    OkNoTolerance,
    /// The anchor cannot see a majority of the group; writes are blocked.
    #[serde(rename = "NO_QUORUM")]
    NoQuorum,
    /// No group view available from the anchor.
    #[serde(rename = "UNKNOWN")]
    Unknown,
}

impl QuorumVerdict {
    pub fn has_quorum(&self) -> bool {
        matches!(
            self,
            QuorumVerdict::Ok | QuorumVerdict::OkPartial | QuorumVerdict::OkNoTolerance
        )
    }
}

impl std::fmt::Display for QuorumVerdict {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            QuorumVerdict::Ok => write!(f, "OK"),
            QuorumVerdict::OkPartial => write!(f, "OK_PARTIAL"),
            QuorumVerdict::OkNoTolerance => write!(f, "OK_NO_TOLERANCE"),
            QuorumVerdict::NoQuorum => write!(f, "NO_QUORUM"),
            QuorumVerdict::Unknown => write!(f, "UNKNOWN"),
        }
    }
}

/// Number of member failures a group with `online` members survives.
pub fn failure_tolerance(online: usize) -> usize {
    online.saturating_sub(1) / 2
}

/// Verdict from the anchor's group view and the recorded membership.
///
/// `view` holds the state of every entry of the group's own membership view
/// (expelled members are not part of it). `recorded_online` counts recorded
/// members that are `ONLINE`; `recorded_total` counts all recorded members.
pub fn compute_verdict(
    view: &[MemberState],
    recorded_online: usize,
    recorded_total: usize,
) -> QuorumVerdict {
    if view.is_empty() {
        return QuorumVerdict::Unknown;
    }
    let active = view.iter().filter(|s| s.is_active()).count();
    if active * 2 <= view.len() {
        return QuorumVerdict::NoQuorum;
    }
    if failure_tolerance(recorded_online) == 0 {
        QuorumVerdict::OkNoTolerance
    } else if recorded_total > recorded_online {
        QuorumVerdict::OkPartial
    } else {
        QuorumVerdict::Ok
    }
}

/// One member as seen through both the live view and the metadata.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemberView {
    pub endpoint: String,
    pub uuid: String,
    /// Label from metadata, `None` for members the metadata does not record.
    pub label: Option<String>,
    /// Present in the metadata.
    pub recorded: bool,
    /// State in the live group view, `None` when absent from it.
    pub live_state: Option<MemberState>,
    pub role: Option<MemberRole>,
}

impl MemberView {
    /// Status label shown to operators.
    pub fn display_status(&self) -> String {
        match self.live_state {
            Some(state) => state.to_string(),
            None => "(MISSING)".to_string(),
        }
    }

    /// Recorded but absent from the live view.
    pub fn is_missing(&self) -> bool {
        self.recorded && self.live_state.is_none()
    }

    pub fn is_online(&self) -> bool {
        self.live_state == Some(MemberState::Online)
    }

    /// `ONLINE` or `RECOVERING`.
    pub fn is_active(&self) -> bool {
        self.live_state.is_some_and(|s| s.is_active())
    }

    pub fn is_primary(&self) -> bool {
        self.is_active() && self.role == Some(MemberRole::Primary)
    }

    pub fn display_label(&self) -> &str {
        self.label.as_deref().unwrap_or(&self.endpoint)
    }
}

/// Authoritative snapshot of a group as seen from an anchor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupSnapshot {
    /// Endpoint of the anchor the view was taken from.
    pub anchor: String,
    pub anchor_uuid: String,
    /// Recorded members in metadata order, followed by unrecorded live members.
    pub members: Vec<MemberView>,
    pub single_primary: bool,
    pub verdict: QuorumVerdict,
}

impl GroupSnapshot {
    pub fn member(&self, endpoint: &str) -> Option<&MemberView> {
        self.members.iter().find(|m| m.endpoint == endpoint)
    }

    pub fn member_by_uuid(&self, uuid: &str) -> Option<&MemberView> {
        self.members.iter().find(|m| m.uuid == uuid)
    }

    pub fn recorded(&self) -> impl Iterator<Item = &MemberView> {
        self.members.iter().filter(|m| m.recorded)
    }

    /// Live members the metadata does not know about.
    pub fn unrecorded(&self) -> impl Iterator<Item = &MemberView> {
        self.members
            .iter()
            .filter(|m| !m.recorded && m.live_state.is_some())
    }

    pub fn online(&self) -> impl Iterator<Item = &MemberView> {
        self.members.iter().filter(|m| m.is_online())
    }

    pub fn primary(&self) -> Option<&MemberView> {
        if self.single_primary {
            self.members.iter().find(|m| m.is_primary())
        } else {
            None
        }
    }

    /// Entries of the live view.
    pub fn view_size(&self) -> usize {
        self.members.iter().filter(|m| m.live_state.is_some()).count()
    }

    /// View entries that are neither `ONLINE` nor `RECOVERING`.
    pub fn unreachable_in_view(&self) -> usize {
        self.members
            .iter()
            .filter(|m| m.live_state.is_some() && !m.is_active())
            .count()
    }

    pub fn has_quorum(&self) -> bool {
        self.verdict.has_quorum()
    }

    /// `statusText` of the status report.
    pub fn status_text(&self) -> String {
        let online = self.recorded().filter(|m| m.is_online()).count();
        let total = self.recorded().count();
        let non_active = total.saturating_sub(online);

        let mut text = match self.verdict {
            QuorumVerdict::NoQuorum => format!(
                "Cluster has no quorum as visible from '{}' and cannot process write transactions.",
                self.anchor
            ),
            QuorumVerdict::Unknown => {
                format!("Cluster status is unknown as visible from '{}'.", self.anchor)
            }
            QuorumVerdict::OkNoTolerance => "Cluster is NOT tolerant to any failures.".to_string(),
            QuorumVerdict::Ok | QuorumVerdict::OkPartial => match failure_tolerance(online) {
                1 => "Cluster is ONLINE and can tolerate up to ONE failure.".to_string(),
                n => format!("Cluster is ONLINE and can tolerate up to {n} failures."),
            },
        };
        match non_active {
            0 => {}
            1 => text.push_str(" 1 member is not active"),
            n => text.push_str(&format!(" {n} members are not active")),
        }
        text
    }

    /// Warning surfaced by read-only operations under `NO_QUORUM`.
    pub fn no_quorum_warning(&self) -> Option<String> {
        (self.verdict == QuorumVerdict::NoQuorum).then(|| {
            format!(
                "Cluster has no quorum and cannot process write transactions: {} out of {} members \
                 of the InnoDB cluster are unreachable from the member we're connected to, which \
                 is not sufficient for a quorum to be reached.",
                self.unreachable_in_view(),
                self.view_size()
            )
        })
    }
}

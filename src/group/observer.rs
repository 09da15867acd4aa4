//! Group State Observer.
//!
//! Asks the anchor for its live group view and cross-references it with the
//! recorded member list. Recorded members absent from the view become
//! `(MISSING)`; recorded members present in it keep their reported state.

use tracing::{debug, instrument};

use super::snapshot::{GroupSnapshot, MemberView, compute_verdict};
use crate::client::{GroupMember, InstanceSession, MemberState};
use crate::controller::error::Result;
use crate::metadata::ClusterRecord;

/// Observe the group through `session`.
///
/// Fails fast with a connectivity error when the anchor is unreachable.
#[instrument(skip_all, fields(anchor = %session.instance().endpoint()))]
pub async fn observe<S: InstanceSession>(
    session: &mut S,
    cluster: Option<&ClusterRecord>,
) -> Result<GroupSnapshot> {
    let info = session.server_info().await?;
    let live = session.group_members().await?;
    let snapshot = reconcile(
        session.instance().endpoint(),
        info.uuid,
        info.single_primary_mode,
        &live,
        cluster,
    );
    debug!(
        verdict = %snapshot.verdict,
        view_size = snapshot.view_size(),
        "Observed group"
    );
    Ok(snapshot)
}

/// Merge a live view with the recorded membership.
pub fn reconcile(
    anchor: String,
    anchor_uuid: String,
    single_primary: bool,
    live: &[GroupMember],
    cluster: Option<&ClusterRecord>,
) -> GroupSnapshot {
    let mut members = Vec::with_capacity(live.len());
    let mut matched = vec![false; live.len()];

    if let Some(cluster) = cluster {
        for record in cluster.instances() {
            let found = live
                .iter()
                .position(|m| m.uuid == record.uuid || m.endpoint() == record.endpoint);
            let live_member = found.and_then(|i| {
                if let Some(flag) = matched.get_mut(i) {
                    *flag = true;
                }
                live.get(i)
            });
            members.push(MemberView {
                endpoint: record.endpoint.clone(),
                uuid: record.uuid.clone(),
                label: Some(record.label.clone()),
                recorded: true,
                live_state: live_member.map(|m| m.state),
                role: live_member.map(|m| m.role),
            });
        }
    }

    for (member, _) in live.iter().zip(&matched).filter(|(_, m)| !**m) {
        members.push(MemberView {
            endpoint: member.endpoint(),
            uuid: member.uuid.clone(),
            label: None,
            recorded: false,
            live_state: Some(member.state),
            role: Some(member.role),
        });
    }

    let view: Vec<MemberState> = live.iter().map(|m| m.state).collect();
    let (recorded_online, recorded_total) = if cluster.is_some() {
        (
            members.iter().filter(|m| m.recorded && m.is_online()).count(),
            members.iter().filter(|m| m.recorded).count(),
        )
    } else {
        (
            view.iter().filter(|s| **s == MemberState::Online).count(),
            view.len(),
        )
    };

    GroupSnapshot {
        anchor,
        anchor_uuid,
        members,
        single_primary,
        verdict: compute_verdict(&view, recorded_online, recorded_total),
    }
}

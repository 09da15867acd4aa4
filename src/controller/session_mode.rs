//! Classification of the session an operation runs through.
//!
//! Every operation starts with one call to [`classify_session`]; the
//! precondition gate is keyed on the resulting [`SessionMode`].

use std::fmt;

use tracing::{debug, instrument};

use crate::client::{InstanceSession, ServerInfo};
use crate::controller::error::Result;
use crate::group::{GroupSnapshot, QuorumVerdict, reconcile};
use crate::metadata::{ClusterRecord, MetadataSnapshot};

/// Mode of the target session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionMode {
    /// No group replication and not recorded in any metadata.
    Standalone,
    /// Group replication running without matching metadata.
    UnmanagedGroup,
    ManagedHealthy,
    /// Managed, but the anchor cannot see a majority of its group.
    ManagedQuorumLost,
    /// Recorded in the metadata but group replication is not running on it.
    ManagedCompleteOutage,
}

impl SessionMode {
    pub fn is_managed(&self) -> bool {
        matches!(
            self,
            SessionMode::ManagedHealthy
                | SessionMode::ManagedQuorumLost
                | SessionMode::ManagedCompleteOutage
        )
    }
}

impl fmt::Display for SessionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionMode::Standalone => write!(f, "Standalone"),
            SessionMode::UnmanagedGroup => write!(f, "Unmanaged Replication Group"),
            SessionMode::ManagedHealthy => write!(f, "Managed, healthy"),
            SessionMode::ManagedQuorumLost => write!(f, "Managed, quorum-lost"),
            SessionMode::ManagedCompleteOutage => write!(f, "Managed, complete outage"),
        }
    }
}

/// Everything learned about the target while classifying it.
#[derive(Debug, Clone)]
pub struct SessionContext {
    pub mode: SessionMode,
    /// Endpoint of the session target.
    pub endpoint: String,
    pub server: ServerInfo,
    pub metadata: Option<MetadataSnapshot>,
    /// The cluster the target belongs to, if any.
    pub cluster: Option<ClusterRecord>,
    pub snapshot: GroupSnapshot,
}

impl SessionContext {
    pub fn verdict(&self) -> QuorumVerdict {
        self.snapshot.verdict
    }

    /// Whether group replication is running on the target.
    pub fn group_active(&self) -> bool {
        self.snapshot.view_size() > 0
    }
}

/// Decide the mode from what the target reports.
pub fn classify(group_active: bool, verdict: QuorumVerdict, managed: bool) -> SessionMode {
    match (group_active, managed) {
        (false, false) => SessionMode::Standalone,
        (false, true) => SessionMode::ManagedCompleteOutage,
        (true, false) => SessionMode::UnmanagedGroup,
        (true, true) if verdict == QuorumVerdict::NoQuorum => SessionMode::ManagedQuorumLost,
        (true, true) => SessionMode::ManagedHealthy,
    }
}

/// Classify the target of `session`.
///
/// A running group is managed when the metadata records its group name or
/// the target's uuid. A stopped target is managed when the metadata records
/// its uuid.
#[instrument(skip_all, fields(endpoint = %session.instance().endpoint()))]
pub async fn classify_session<S: InstanceSession>(session: &mut S) -> Result<SessionContext> {
    let endpoint = session.instance().endpoint();
    let server = session.server_info().await?;
    let live = session.group_members().await?;
    let metadata = session.load_metadata().await?;

    let cluster = metadata.as_ref().and_then(|md| {
        md.cluster_of_instance(&server.uuid)
            .or_else(|| {
                if live.is_empty() || server.group_name.is_empty() {
                    None
                } else {
                    md.cluster_of_group(&server.group_name)
                }
            })
            .cloned()
    });
    let snapshot = reconcile(
        endpoint.clone(),
        server.uuid.clone(),
        server.single_primary_mode,
        &live,
        cluster.as_ref(),
    );
    let mode = classify(!live.is_empty(), snapshot.verdict, cluster.is_some());
    debug!(%mode, verdict = %snapshot.verdict, "Classified session");

    Ok(SessionContext {
        mode,
        endpoint,
        server,
        metadata,
        cluster,
        snapshot,
    })
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::client::{Connector, Sandbox};

    #[test]
    fn test_classify_matrix() {
        assert_eq!(classify(false, QuorumVerdict::Unknown, false), SessionMode::Standalone);
        assert_eq!(
            classify(false, QuorumVerdict::Unknown, true),
            SessionMode::ManagedCompleteOutage
        );
        assert_eq!(classify(true, QuorumVerdict::Ok, false), SessionMode::UnmanagedGroup);
        assert_eq!(
            classify(true, QuorumVerdict::NoQuorum, true),
            SessionMode::ManagedQuorumLost
        );
        assert_eq!(
            classify(true, QuorumVerdict::OkNoTolerance, true),
            SessionMode::ManagedHealthy
        );
        assert!(!SessionMode::UnmanagedGroup.is_managed());
    }

    #[tokio::test]
    async fn test_fresh_server_is_standalone() {
        let sandbox = Sandbox::new();
        let def = sandbox.deploy(4510);
        let mut session = sandbox.connect(&def).await.unwrap();
        let ctx = classify_session(&mut session).await.unwrap();
        assert_eq!(ctx.mode, SessionMode::Standalone);
        assert_eq!(ctx.verdict(), QuorumVerdict::Unknown);
        assert!(!ctx.group_active());
        assert!(ctx.cluster.is_none());
    }
}

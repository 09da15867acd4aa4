//! Metadata store client.
//!
//! The metadata schema is the durable source of truth for what a cluster is
//! supposed to look like. Reads are best effort from whichever member the
//! session targets; writes go through the write-capable member and always
//! replace the whole snapshot inside one transaction.

pub mod records;

use tracing::{debug, instrument};

use crate::client::InstanceSession;
use crate::controller::error::{Error, Result};
pub use records::{
    ClusterRecord, DEFAULT_REPLICA_SET, InstanceRecord, METADATA_SCHEMA, MetadataSnapshot,
    ROLE_HA, ReplicaSetRecord, TopologyType,
};

/// Reads and writes metadata through one session.
pub struct MetadataStore<'a, S: InstanceSession> {
    session: &'a mut S,
}

impl<'a, S: InstanceSession> MetadataStore<'a, S> {
    pub fn new(session: &'a mut S) -> Self {
        Self { session }
    }

    /// Current snapshot, `None` when the schema does not exist.
    pub async fn load(&mut self) -> Result<Option<MetadataSnapshot>> {
        self.session.load_metadata().await.map_err(|e| {
            Error::Metadata(format!(
                "Unable to read the metadata from '{}': {e}",
                self.session.instance().endpoint()
            ))
        })
    }

    /// Snapshot and the record of cluster `name`.
    pub async fn load_cluster(&mut self, name: &str) -> Result<(MetadataSnapshot, ClusterRecord)> {
        let snapshot = self.load().await?.ok_or_else(|| {
            Error::Metadata(format!("Metadata schema '{METADATA_SCHEMA}' not found"))
        })?;
        let cluster = snapshot
            .cluster(name)
            .cloned()
            .ok_or_else(|| Error::Metadata(format!("The cluster with the name '{name}' does not exist.")))?;
        Ok((snapshot, cluster))
    }

    /// Replace the stored snapshot.
    #[instrument(skip_all, fields(endpoint = %self.session.instance().endpoint()))]
    pub async fn commit(&mut self, snapshot: &MetadataSnapshot) -> Result<()> {
        self.session.store_metadata(snapshot).await.map_err(|e| {
            Error::Metadata(format!(
                "Failed to update the metadata on '{}': {e}",
                self.session.instance().endpoint()
            ))
        })?;
        debug!(clusters = snapshot.clusters.len(), "Metadata committed");
        Ok(())
    }

    /// Load, apply `mutate` to cluster `name`, and commit.
    ///
    /// Returns the snapshot as it was before the change.
    pub async fn update_cluster<F>(&mut self, name: &str, mutate: F) -> Result<MetadataSnapshot>
    where
        F: FnOnce(&mut ClusterRecord) -> Result<()>,
    {
        let (before, _) = self.load_cluster(name).await?;
        let mut after = before.clone();
        let cluster = after
            .cluster_mut(name)
            .ok_or_else(|| Error::Metadata(format!("The cluster with the name '{name}' does not exist.")))?;
        mutate(cluster)?;
        self.commit(&after).await?;
        Ok(before)
    }

    pub async fn drop_schema(&mut self) -> Result<()> {
        self.session.drop_metadata_schema().await.map_err(|e| {
            Error::Metadata(format!(
                "Unable to drop the metadata schema on '{}': {e}",
                self.session.instance().endpoint()
            ))
        })
    }
}

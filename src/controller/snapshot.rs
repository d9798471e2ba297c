//! Snapshot creation and deletion, idempotent by snapshot name.

use tracing::{debug, info, instrument, warn};

use super::params::GIB;
use super::{ControllerError, Snapshot, VolumeController, require};
use crate::metadata::MetadataStore;
use crate::remote::{RemoteClient, RemoteSnapshot};
use crate::snapshot_cache::SnapshotRecord;

impl From<SnapshotRecord> for Snapshot {
    fn from(record: SnapshotRecord) -> Self {
        Self {
            snapshot_id: record.id,
            source_volume_id: record.source_volume_id,
            size_bytes: record.size_bytes,
            created_at: record.created_at,
            ready_to_use: record.ready_to_use,
        }
    }
}

impl<C: RemoteClient, S: MetadataStore> VolumeController<C, S> {
    /// Replays persisted snapshot records so name lookups work after a
    /// restart. Returns the number of records restored.
    ///
    /// # Errors
    ///
    /// Returns [`ControllerError::Metadata`] when the store cannot be read.
    pub fn load_snapshots(&self) -> Result<usize, ControllerError> {
        Ok(self.snapshots.load()?)
    }

    /// Creates a snapshot named `name`, or reports the progress of the one
    /// an earlier call with the same name created.
    ///
    /// The call never waits for the snapshot to become ready; callers repeat
    /// it until `ready_to_use` is set.
    ///
    /// # Errors
    ///
    /// Returns [`ControllerError::InvalidArgument`] when `name` is already
    /// used for another volume, [`ControllerError::VolumeNotFound`] for a
    /// missing source, and [`ControllerError::Remote`] or
    /// [`ControllerError::Metadata`] on provider or persistence failures.
    #[instrument(skip(self))]
    pub async fn create_snapshot(
        &self,
        name: &str,
        source_volume_id: &str,
    ) -> Result<Snapshot, ControllerError> {
        require(name, "snapshot name")?;
        require(source_volume_id, "source volume id")?;

        let lock = self.snapshot_lock(name);
        let result = {
            let _serialised = lock.lock().await;
            self.create_snapshot_locked(name, source_volume_id).await
        };
        self.release_snapshot_lock(name, &lock);
        result
    }

    async fn create_snapshot_locked(
        &self,
        name: &str,
        source_volume_id: &str,
    ) -> Result<Snapshot, ControllerError> {
        if let Some(record) = self.snapshots.find_by_name(name) {
            if record.source_volume_id != source_volume_id {
                return Err(ControllerError::InvalidArgument(format!(
                    "snapshot name {name} is already used for volume {}",
                    record.source_volume_id
                )));
            }
            match self.describe_snapshot(&record.id).await? {
                Some(remote) => return self.refresh(record, &remote),
                None => {
                    warn!(snapshot_id = %record.id, name, "cached snapshot vanished, recreating");
                    self.snapshots.remove(&record.id)?;
                }
            }
        }

        let disk = self
            .describe_disk(source_volume_id)
            .await
            .map_err(ControllerError::remote("describe source volume"))?
            .ok_or_else(|| ControllerError::VolumeNotFound {
                id: source_volume_id.to_owned(),
            })?;

        let snapshot_id = self
            .remote
            .create_snapshot(source_volume_id, name)
            .await
            .map_err(ControllerError::remote("create snapshot"))?;
        info!(snapshot_id, name, source_volume_id, "snapshot submitted");

        let described = match self.describe_snapshot(&snapshot_id).await {
            Ok(found) => found,
            Err(err) => {
                debug!(snapshot_id, error = %err, "snapshot size not reported yet");
                None
            }
        };
        let record = SnapshotRecord {
            size_bytes: described
                .as_ref()
                .map(|remote| remote.size_bytes)
                .filter(|size| *size > 0)
                .unwrap_or_else(|| disk.size_gib.saturating_mul(GIB)),
            created_at: described.and_then(|remote| remote.created_at),
            id: snapshot_id,
            name: name.to_owned(),
            source_volume_id: source_volume_id.to_owned(),
            ready_to_use: false,
        };
        self.snapshots.put(&record)?;
        Ok(record.into())
    }

    fn refresh(
        &self,
        mut record: SnapshotRecord,
        remote: &RemoteSnapshot,
    ) -> Result<Snapshot, ControllerError> {
        record.ready_to_use = remote.is_ready();
        if remote.size_bytes > 0 {
            record.size_bytes = remote.size_bytes;
        }
        if remote.created_at.is_some() {
            record.created_at.clone_from(&remote.created_at);
        }
        self.snapshots.put(&record)?;
        debug!(
            snapshot_id = %record.id,
            percent = remote.percent,
            ready = record.ready_to_use,
            "snapshot refreshed"
        );
        Ok(record.into())
    }

    /// Deletes a snapshot. A snapshot without a record counts as deleted.
    ///
    /// # Errors
    ///
    /// Returns [`ControllerError::Remote`] when the provider rejects the
    /// deletion and [`ControllerError::Metadata`] when the record cannot be
    /// read or removed.
    #[instrument(skip(self))]
    pub async fn delete_snapshot(&self, snapshot_id: &str) -> Result<(), ControllerError> {
        require(snapshot_id, "snapshot id")?;
        if self.snapshots.get(snapshot_id)?.is_none() {
            info!(snapshot_id, "snapshot already deleted");
            return Ok(());
        }
        self.remote
            .delete_snapshot(snapshot_id)
            .await
            .map_err(ControllerError::remote("delete snapshot"))?;
        self.snapshots.remove(snapshot_id)?;
        info!(snapshot_id, "snapshot deleted");
        Ok(())
    }

    async fn describe_snapshot(&self, id: &str) -> Result<Option<RemoteSnapshot>, ControllerError> {
        let ids = [id.to_owned()];
        let found = self
            .remote
            .describe_snapshots(&ids)
            .await
            .map_err(ControllerError::remote("describe snapshot"))?;
        Ok(found.into_iter().find(|snapshot| snapshot.id == id))
    }
}

//! Volume creation, deletion, and expansion.

use tracing::{info, instrument, warn};

use super::params::{DiskParameters, GIB, capacity_gib, resolve_zone, validate_capabilities};
use super::{
    ControllerError, CreateVolumeRequest, ExpandedVolume, Volume, VolumeController, require,
};
use crate::metadata::MetadataStore;
use crate::poll::poll_until;
use crate::remote::{DiskRequest, RemoteClient, RemoteDisk, RemoteError, RemoteSnapshot};
use crate::types::{CapacityRange, ContentSource, zone_topology};

impl<C: RemoteClient, S: MetadataStore> VolumeController<C, S> {
    /// Creates a volume, or returns the one an earlier attempt with the same
    /// name created, once it has settled.
    ///
    /// # Errors
    ///
    /// Returns [`ControllerError::InvalidArgument`] for malformed requests,
    /// [`ControllerError::SnapshotNotFound`] for a missing source,
    /// [`ControllerError::Timeout`] when the volume does not settle, and
    /// [`ControllerError::Remote`] when the provider rejects the creation.
    #[instrument(skip(self, request), fields(name = %request.name))]
    pub async fn create_volume(
        &self,
        request: &CreateVolumeRequest,
    ) -> Result<Volume, ControllerError> {
        require(&request.name, "volume name")?;
        validate_capabilities(&request.capabilities)?;
        let size_gib = capacity_gib(&request.capacity)?;
        let parameters =
            DiskParameters::parse(&request.parameters, &self.settings.default_disk_type)?;
        let zone = resolve_zone(
            parameters.zone.as_deref(),
            request.topology.as_ref(),
            &self.settings.zone,
        );

        let snapshot_id = match &request.content_source {
            Some(ContentSource::Snapshot { id }) => {
                self.wait_for_source_snapshot(id).await?;
                Some(id.clone())
            }
            None => None,
        };

        let disk_request = DiskRequest {
            name: request.name.clone(),
            client_token: request.name.clone(),
            size_gib,
            zone: zone.clone(),
            disk_type: parameters.disk_type.clone(),
            charge: parameters.charge,
            snapshot_id: snapshot_id.clone(),
        };
        let volume_id = self
            .remote
            .create_disk(&disk_request)
            .await
            .map_err(ControllerError::remote("create volume"))?;
        info!(volume_id, size_gib, zone, disk_type = %parameters.disk_type, "volume submitted");

        let disk = poll_until(
            self.settings.create_policy,
            "create volume",
            &volume_id,
            || self.describe_present(&volume_id),
            |disk| disk.status.is_settled(),
        )
        .await?;

        if let Some(policy_id) = parameters.snapshot_policy_id.as_deref()
            && let Err(err) = self.remote.bind_snapshot_policy(policy_id, &volume_id).await
        {
            warn!(volume_id, policy_id, error = %err, "auto snapshot policy not bound");
        }

        Ok(Volume {
            volume_id,
            capacity_bytes: disk.size_gib.saturating_mul(GIB),
            accessible_topology: vec![zone_topology(&disk.zone)],
            zone: disk.zone,
            source_snapshot_id: snapshot_id,
        })
    }

    /// Deletes a volume. An absent volume counts as deleted.
    ///
    /// # Errors
    ///
    /// Returns [`ControllerError::VolumeInUse`] while the volume is attached
    /// and [`ControllerError::Remote`] when a provider call fails.
    #[instrument(skip(self))]
    pub async fn delete_volume(&self, volume_id: &str) -> Result<(), ControllerError> {
        require(volume_id, "volume id")?;
        let Some(disk) = self
            .describe_disk(volume_id)
            .await
            .map_err(ControllerError::remote("describe volume"))?
        else {
            info!(volume_id, "volume already deleted");
            return Ok(());
        };
        if let Some(node_id) = disk.attached_to {
            return Err(ControllerError::VolumeInUse {
                volume_id: volume_id.to_owned(),
                node_id,
            });
        }
        self.remote
            .delete_disk(volume_id)
            .await
            .map_err(ControllerError::remote("delete volume"))?;
        info!(volume_id, "volume deletion submitted");
        Ok(())
    }

    /// Grows a volume to at least the requested capacity.
    ///
    /// # Errors
    ///
    /// Returns [`ControllerError::VolumeNotFound`] for an unknown volume,
    /// [`ControllerError::Timeout`] when the new size is not reported in
    /// time, and [`ControllerError::Remote`] when the resize is rejected.
    #[instrument(skip(self, capacity))]
    pub async fn expand_volume(
        &self,
        volume_id: &str,
        capacity: CapacityRange,
    ) -> Result<ExpandedVolume, ControllerError> {
        require(volume_id, "volume id")?;
        let target_gib = capacity_gib(&capacity)?;
        let disk = self
            .describe_disk(volume_id)
            .await
            .map_err(ControllerError::remote("describe volume"))?
            .ok_or_else(|| ControllerError::VolumeNotFound {
                id: volume_id.to_owned(),
            })?;

        if disk.size_gib >= target_gib {
            info!(volume_id, size_gib = disk.size_gib, "volume already large enough");
            return Ok(ExpandedVolume {
                capacity_bytes: disk.size_gib.saturating_mul(GIB),
                node_expansion_required: true,
            });
        }

        self.remote
            .resize_disk(volume_id, target_gib)
            .await
            .map_err(ControllerError::remote("resize volume"))?;
        let resized = poll_until(
            self.settings.resize_policy,
            "resize volume",
            volume_id,
            || self.describe_present(volume_id),
            |disk| disk.size_gib >= target_gib,
        )
        .await?;
        info!(volume_id, size_gib = resized.size_gib, "volume resized");
        Ok(ExpandedVolume {
            capacity_bytes: resized.size_gib.saturating_mul(GIB),
            node_expansion_required: true,
        })
    }

    pub(super) async fn describe_present(&self, volume_id: &str) -> Result<RemoteDisk, String> {
        match self.describe_disk(volume_id).await {
            Ok(Some(disk)) => Ok(disk),
            Ok(None) => Err(format!("volume {volume_id} not visible yet")),
            Err(err) => Err(err.to_string()),
        }
    }

    async fn wait_for_source_snapshot(&self, snapshot_id: &str) -> Result<(), ControllerError> {
        let ids = [snapshot_id.to_owned()];
        let found = self
            .remote
            .describe_snapshots(&ids)
            .await
            .map_err(ControllerError::remote("describe source snapshot"))?;
        let Some(snapshot) = found.into_iter().find(|snapshot| snapshot.id == snapshot_id) else {
            return Err(ControllerError::SnapshotNotFound {
                id: snapshot_id.to_owned(),
            });
        };
        if snapshot.is_ready() {
            return Ok(());
        }

        let remote = &self.remote;
        let lookup = &ids;
        poll_until(
            self.settings.snapshot_policy,
            "snapshot ready",
            snapshot_id,
            || async move {
                let snapshots = remote.describe_snapshots(lookup).await?;
                Ok::<_, RemoteError>(
                    snapshots.into_iter().find(|snapshot| snapshot.id == snapshot_id),
                )
            },
            |snapshot| snapshot.as_ref().is_some_and(RemoteSnapshot::is_ready),
        )
        .await?;
        Ok(())
    }
}

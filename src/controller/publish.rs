//! Attaching volumes to nodes and detaching them again.

use tracing::{debug, info, instrument};

use super::{ControllerError, VolumeController, require};
use crate::metadata::MetadataStore;
use crate::poll::poll_until;
use crate::remote::{DiskStatus, RemoteClient};

impl<C: RemoteClient, S: MetadataStore> VolumeController<C, S> {
    /// Attaches a volume to `node_id` and waits for the attachment.
    ///
    /// A volume already attached to the node is left untouched.
    ///
    /// # Errors
    ///
    /// Returns [`ControllerError::AttachedElsewhere`] when another node holds
    /// the volume, [`ControllerError::TransitionInProgress`] while it is
    /// detaching, and [`ControllerError::Timeout`] when the attach does not
    /// converge.
    #[instrument(skip(self))]
    pub async fn publish_volume(
        &self,
        volume_id: &str,
        node_id: &str,
    ) -> Result<(), ControllerError> {
        require(volume_id, "volume id")?;
        require(node_id, "node id")?;
        let disk = self
            .describe_disk(volume_id)
            .await
            .map_err(ControllerError::remote("describe volume"))?
            .ok_or_else(|| ControllerError::VolumeNotFound {
                id: volume_id.to_owned(),
            })?;

        match (disk.attached_to.as_deref(), &disk.status) {
            (Some(owner), _) if owner != node_id => {
                return Err(ControllerError::AttachedElsewhere {
                    volume_id: volume_id.to_owned(),
                    node_id: owner.to_owned(),
                });
            }
            (Some(_), DiskStatus::Attached) => {
                debug!(volume_id, node_id, "volume already attached");
                return Ok(());
            }
            (_, DiskStatus::Detaching) => {
                return Err(ControllerError::TransitionInProgress {
                    volume_id: volume_id.to_owned(),
                    status: String::from("detaching"),
                });
            }
            (Some(_), DiskStatus::Attaching) => {
                debug!(volume_id, node_id, "attach already in flight");
            }
            _ => {
                self.remote
                    .attach_disk(volume_id, node_id)
                    .await
                    .map_err(ControllerError::remote("attach volume"))?;
            }
        }

        poll_until(
            self.settings.attach_policy,
            "attach volume",
            volume_id,
            || self.describe_present(volume_id),
            |disk| {
                disk.status == DiskStatus::Attached && disk.attached_to.as_deref() == Some(node_id)
            },
        )
        .await?;
        info!(volume_id, node_id, "volume attached");
        Ok(())
    }

    /// Detaches a volume from `node_id` and waits for the detachment.
    ///
    /// A volume that is absent or already detached is left untouched.
    ///
    /// # Errors
    ///
    /// Returns [`ControllerError::AttachedElsewhere`] when another node holds
    /// the volume, [`ControllerError::TransitionInProgress`] while it is
    /// still attaching, and [`ControllerError::Timeout`] when the detach does
    /// not converge.
    #[instrument(skip(self))]
    pub async fn unpublish_volume(
        &self,
        volume_id: &str,
        node_id: &str,
    ) -> Result<(), ControllerError> {
        require(volume_id, "volume id")?;
        require(node_id, "node id")?;
        let Some(disk) = self
            .describe_disk(volume_id)
            .await
            .map_err(ControllerError::remote("describe volume"))?
        else {
            debug!(volume_id, "volume gone, nothing to detach");
            return Ok(());
        };

        match (disk.attached_to.as_deref(), &disk.status) {
            (None, _) => {
                debug!(volume_id, node_id, "volume already detached");
                return Ok(());
            }
            (Some(owner), _) if owner != node_id => {
                return Err(ControllerError::AttachedElsewhere {
                    volume_id: volume_id.to_owned(),
                    node_id: owner.to_owned(),
                });
            }
            (Some(_), DiskStatus::Attaching) => {
                return Err(ControllerError::TransitionInProgress {
                    volume_id: volume_id.to_owned(),
                    status: String::from("attaching"),
                });
            }
            (Some(_), DiskStatus::Detaching) => {
                debug!(volume_id, node_id, "detach already in flight");
            }
            (Some(_), _) => {
                self.remote
                    .detach_disk(volume_id, node_id)
                    .await
                    .map_err(ControllerError::remote("detach volume"))?;
            }
        }

        poll_until(
            self.settings.detach_policy,
            "detach volume",
            volume_id,
            || async move {
                self.describe_disk(volume_id)
                    .await
                    .map(|found| found.map(|disk| disk.status))
            },
            |observed| {
                observed
                    .as_ref()
                    .is_none_or(|status| *status == DiskStatus::Unattached)
            },
        )
        .await?;
        info!(volume_id, node_id, "volume detached");
        Ok(())
    }
}

//! Control-plane orchestration of remote volumes and snapshots.
//!
//! Every operation checks the current remote state before acting, so a
//! caller may retry any request after a timeout or crash: a retry finds the
//! converged resource on its first observation instead of mutating again.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, PoisonError};

use serde::Serialize;
use thiserror::Error;

use crate::error::Code;
use crate::metadata::{MetadataError, MetadataStore};
use crate::poll::{PollPolicy, PollTimeout};
use crate::remote::{RemoteClient, RemoteDisk, RemoteError};
use crate::snapshot_cache::SnapshotCache;
use crate::types::{CapacityRange, ContentSource, Topology, TopologyRequirement, VolumeCapability};

mod params;
mod publish;
mod snapshot;
mod volume;

pub use params::{
    ASP_ID_KEY, CHARGE_TYPE_KEY, DISK_TYPE_KEY, PREPAID_PERIOD_KEY, PREPAID_RENEW_KEY, ZONE_KEY,
};

/// Errors raised by [`VolumeController`] operations.
#[derive(Debug, Error)]
pub enum ControllerError {
    /// The request is malformed or asks for an unsupported capability.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    /// The referenced volume does not exist.
    #[error("volume {id} not found")]
    VolumeNotFound {
        /// Volume identifier.
        id: String,
    },
    /// The referenced snapshot does not exist.
    #[error("snapshot {id} not found")]
    SnapshotNotFound {
        /// Snapshot identifier.
        id: String,
    },
    /// The volume is attached to another node.
    #[error("volume {volume_id} is attached to node {node_id}")]
    AttachedElsewhere {
        /// Volume identifier.
        volume_id: String,
        /// Node currently holding the volume.
        node_id: String,
    },
    /// The volume cannot be deleted while attached.
    #[error("volume {volume_id} is still attached to node {node_id}")]
    VolumeInUse {
        /// Volume identifier.
        volume_id: String,
        /// Node holding the volume.
        node_id: String,
    },
    /// An attach or detach is already in flight.
    #[error("volume {volume_id} is {status}; retry once it settles")]
    TransitionInProgress {
        /// Volume identifier.
        volume_id: String,
        /// Observed transitional status.
        status: String,
    },
    /// The remote resource did not converge in time.
    #[error(transparent)]
    Timeout(#[from] PollTimeout),
    /// A remote call failed.
    #[error("{context}: {source}")]
    Remote {
        /// What the controller was doing.
        context: String,
        /// Underlying client error.
        source: RemoteError,
    },
    /// Snapshot metadata could not be read or persisted.
    #[error(transparent)]
    Metadata(#[from] MetadataError),
}

impl ControllerError {
    /// Status code reported to callers.
    #[must_use]
    pub const fn code(&self) -> Code {
        match self {
            Self::InvalidArgument(_) => Code::InvalidArgument,
            Self::VolumeNotFound { .. } | Self::SnapshotNotFound { .. } => Code::NotFound,
            Self::AttachedElsewhere { .. } | Self::VolumeInUse { .. } => Code::FailedPrecondition,
            Self::TransitionInProgress { .. } => Code::Aborted,
            Self::Timeout(_) => Code::DeadlineExceeded,
            Self::Remote {
                source: RemoteError::Unsupported { .. },
                ..
            } => Code::Unimplemented,
            Self::Remote { .. } | Self::Metadata(_) => Code::Internal,
        }
    }

    pub(crate) fn remote(context: impl Into<String>) -> impl FnOnce(RemoteError) -> Self {
        let text = context.into();
        move |source| Self::Remote {
            context: text,
            source,
        }
    }
}

/// Controller defaults and polling budgets.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ControllerSettings {
    /// Zone used when neither parameters nor topology name one.
    pub zone: String,
    /// Disk type used when parameters name none.
    pub default_disk_type: String,
    /// Budget for a new volume to settle.
    pub create_policy: PollPolicy,
    /// Budget for an attach to converge.
    pub attach_policy: PollPolicy,
    /// Budget for a detach to converge.
    pub detach_policy: PollPolicy,
    /// Budget for a source snapshot to become usable.
    pub snapshot_policy: PollPolicy,
    /// Budget for a resize to be reported.
    pub resize_policy: PollPolicy,
}

impl ControllerSettings {
    /// Settings with the standard polling budgets.
    #[must_use]
    pub fn new(zone: impl Into<String>, default_disk_type: impl Into<String>) -> Self {
        Self {
            zone: zone.into(),
            default_disk_type: default_disk_type.into(),
            create_policy: PollPolicy::CREATE_VOLUME,
            attach_policy: PollPolicy::ATTACH,
            detach_policy: PollPolicy::DETACH,
            snapshot_policy: PollPolicy::SNAPSHOT,
            resize_policy: PollPolicy::RESIZE,
        }
    }
}

/// Parameters of a volume creation.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct CreateVolumeRequest {
    /// Idempotency name; also the provider client token.
    pub name: String,
    /// Requested capacity.
    pub capacity: CapacityRange,
    /// Requested capabilities; at least one.
    pub capabilities: Vec<VolumeCapability>,
    /// Provider parameters (`diskType`, `zone`, ...).
    pub parameters: BTreeMap<String, String>,
    /// Optional source to restore from.
    pub content_source: Option<ContentSource>,
    /// Placement constraints.
    pub topology: Option<TopologyRequirement>,
}

/// A provisioned volume.
#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Volume {
    /// Remote identifier.
    pub volume_id: String,
    /// Allocated size in bytes.
    pub capacity_bytes: u64,
    /// Placement zone.
    pub zone: String,
    /// Snapshot the volume was restored from.
    pub source_snapshot_id: Option<String>,
    /// Segments the volume is reachable from.
    pub accessible_topology: Vec<Topology>,
}

/// Result of a controller-side expansion.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExpandedVolume {
    /// Size after expansion in bytes.
    pub capacity_bytes: u64,
    /// Whether the node must grow the file system.
    pub node_expansion_required: bool,
}

/// Snapshot state returned to callers.
#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Snapshot {
    /// Remote identifier.
    pub snapshot_id: String,
    /// Volume the snapshot was taken from.
    pub source_volume_id: String,
    /// Size in bytes.
    pub size_bytes: u64,
    /// Creation timestamp reported by the provider.
    pub created_at: Option<String>,
    /// Whether the snapshot can be restored from.
    pub ready_to_use: bool,
}

/// Orchestrates volume and snapshot lifecycles against a [`RemoteClient`].
pub struct VolumeController<C, S> {
    remote: C,
    snapshots: SnapshotCache<S>,
    settings: ControllerSettings,
    snapshot_locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl<C: RemoteClient, S: MetadataStore> VolumeController<C, S> {
    /// Creates a controller. Call [`Self::load_snapshots`] before serving.
    #[must_use]
    pub fn new(remote: C, store: S, settings: ControllerSettings) -> Self {
        Self {
            remote,
            snapshots: SnapshotCache::new(store),
            settings,
            snapshot_locks: Mutex::new(HashMap::new()),
        }
    }

    async fn describe_disk(&self, id: &str) -> Result<Option<RemoteDisk>, RemoteError> {
        let ids = [id.to_owned()];
        let disks = self.remote.describe_disks(&ids).await?;
        Ok(disks.into_iter().find(|disk| disk.id == id))
    }

    fn snapshot_lock(&self, name: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self
            .snapshot_locks
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        Arc::clone(locks.entry(name.to_owned()).or_default())
    }

    fn release_snapshot_lock(&self, name: &str, lock: &Arc<tokio::sync::Mutex<()>>) {
        let mut locks = self
            .snapshot_locks
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        // The map and `lock` are the only holders once no request waits.
        if Arc::strong_count(lock) <= 2 {
            locks.remove(name);
        }
    }
}

fn require(value: &str, field: &str) -> Result<(), ControllerError> {
    if value.trim().is_empty() {
        return Err(ControllerError::InvalidArgument(format!("{field} is required")));
    }
    Ok(())
}

#[cfg(test)]
mod tests;

//! Boundary to the remote block storage service.
//!
//! The service is asynchronous and eventually consistent: mutating calls
//! return before the resource has converged, and callers observe progress
//! through the describe operations.

use std::future::Future;
use std::pin::Pin;

use thiserror::Error;

mod scaleway;

pub use scaleway::ScalewayClient;

/// Future returned by remote client operations.
pub type RemoteFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, RemoteError>> + Send + 'a>>;

/// Errors raised by remote client implementations.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum RemoteError {
    /// The provider rejected the request.
    #[error("{operation} rejected by provider: {message}")]
    Rejected {
        /// Operation that was attempted.
        operation: String,
        /// Message returned by the provider.
        message: String,
    },
    /// The request never produced a usable response.
    #[error("{operation} failed in transport: {message}")]
    Transport {
        /// Operation that was attempted.
        operation: String,
        /// Transport level error message.
        message: String,
    },
    /// The provider does not offer the requested feature.
    #[error("{feature} is not supported by this provider")]
    Unsupported {
        /// Name of the unsupported feature.
        feature: String,
    },
}

/// Billing model for a new disk.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum ChargeModel {
    /// Pay as you go.
    #[default]
    PostPaid,
    /// Paid up front for a fixed period.
    PrePaid {
        /// Subscription length in months.
        period_months: u32,
        /// Renewal behaviour at the end of the period.
        renew: RenewFlag,
    },
}

/// Renewal behaviour of a prepaid disk.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum RenewFlag {
    /// Notify and renew automatically.
    #[default]
    NotifyAndAutoRenew,
    /// Notify but require a manual renewal.
    NotifyAndManualRenew,
    /// Require a manual renewal without notification.
    DisableNotifyAndManualRenew,
}

/// Parameters of a disk creation request.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct DiskRequest {
    /// Human readable disk name.
    pub name: String,
    /// Token used by the provider to deduplicate retried creations.
    pub client_token: String,
    /// Capacity in GiB.
    pub size_gib: u64,
    /// Placement zone.
    pub zone: String,
    /// Provider disk type.
    pub disk_type: String,
    /// Billing model.
    pub charge: ChargeModel,
    /// Snapshot to restore from.
    pub snapshot_id: Option<String>,
}

/// Attachment lifecycle of a disk as reported by the provider.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum DiskStatus {
    /// Still being provisioned.
    Creating,
    /// Ready and not attached to any node.
    Unattached,
    /// Attachment in progress.
    Attaching,
    /// Attached to a node.
    Attached,
    /// Detachment in progress.
    Detaching,
    /// Any other provider state, kept verbatim.
    Other(String),
}

impl DiskStatus {
    /// Returns `true` for states with no further spontaneous transition.
    #[must_use]
    pub const fn is_settled(&self) -> bool {
        matches!(self, Self::Unattached | Self::Attached)
    }

    /// Returns `true` while an attach or detach is in progress.
    #[must_use]
    pub const fn is_transitioning(&self) -> bool {
        matches!(self, Self::Attaching | Self::Detaching)
    }
}

/// Observed state of a remote disk.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct RemoteDisk {
    /// Provider identifier.
    pub id: String,
    /// Disk name.
    pub name: String,
    /// Attachment lifecycle state.
    pub status: DiskStatus,
    /// Node the disk is attached to, if any.
    pub attached_to: Option<String>,
    /// Capacity in GiB.
    pub size_gib: u64,
    /// Placement zone.
    pub zone: String,
}

/// Snapshot lifecycle as reported by the provider.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum SnapshotStatus {
    /// Data is still being copied.
    Creating,
    /// Snapshot is usable once progress reaches 100%.
    Normal,
    /// Creation failed.
    Failed,
    /// Any other provider state, kept verbatim.
    Other(String),
}

/// Observed state of a remote snapshot.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct RemoteSnapshot {
    /// Provider identifier.
    pub id: String,
    /// Snapshot name.
    pub name: String,
    /// Disk the snapshot was taken from.
    pub source_disk_id: String,
    /// Lifecycle state.
    pub status: SnapshotStatus,
    /// Copy progress in percent.
    pub percent: u8,
    /// Size in bytes.
    pub size_bytes: u64,
    /// Creation timestamp in RFC 3339 form, when reported.
    pub created_at: Option<String>,
}

impl RemoteSnapshot {
    /// Returns `true` once the snapshot can be used as a content source.
    #[must_use]
    pub const fn is_ready(&self) -> bool {
        matches!(self.status, SnapshotStatus::Normal) && self.percent == 100
    }
}

/// Operations offered by the remote block storage service.
///
/// Describe operations return only the resources that exist; an absent
/// identifier is simply missing from the result.
pub trait RemoteClient: Send + Sync {
    /// Submits a disk creation and returns the new disk identifier.
    fn create_disk<'a>(&'a self, request: &'a DiskRequest) -> RemoteFuture<'a, String>;

    /// Describes the given disks.
    fn describe_disks<'a>(&'a self, ids: &'a [String]) -> RemoteFuture<'a, Vec<RemoteDisk>>;

    /// Submits deletion of a disk.
    fn delete_disk<'a>(&'a self, id: &'a str) -> RemoteFuture<'a, ()>;

    /// Submits attachment of a disk to a node.
    fn attach_disk<'a>(&'a self, id: &'a str, node_id: &'a str) -> RemoteFuture<'a, ()>;

    /// Submits detachment of a disk from a node.
    fn detach_disk<'a>(&'a self, id: &'a str, node_id: &'a str) -> RemoteFuture<'a, ()>;

    /// Submits a capacity increase.
    fn resize_disk<'a>(&'a self, id: &'a str, size_gib: u64) -> RemoteFuture<'a, ()>;

    /// Submits a snapshot of `source_id` and returns the snapshot identifier.
    fn create_snapshot<'a>(&'a self, source_id: &'a str, name: &'a str)
    -> RemoteFuture<'a, String>;

    /// Describes the given snapshots.
    fn describe_snapshots<'a>(
        &'a self,
        ids: &'a [String],
    ) -> RemoteFuture<'a, Vec<RemoteSnapshot>>;

    /// Submits deletion of a snapshot.
    fn delete_snapshot<'a>(&'a self, id: &'a str) -> RemoteFuture<'a, ()>;

    /// Binds an automatic snapshot policy to a disk.
    fn bind_snapshot_policy<'a>(
        &'a self,
        policy_id: &'a str,
        disk_id: &'a str,
    ) -> RemoteFuture<'a, ()>;
}

//! Request and response payloads for the Scaleway Block Storage API.

use serde::{Deserialize, Serialize};

use crate::remote::{DiskStatus, RemoteDisk, RemoteSnapshot, SnapshotStatus};

const BYTES_PER_GIB: u64 = 1 << 30;
const BYTES_PER_GB: u64 = 1_000_000_000;
const SERVER_RESOURCE_TYPE: &str = "instance_server";

#[derive(Debug, Serialize)]
pub(super) struct CreateVolumeBody {
    pub(super) name: String,
    pub(super) project_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub(super) perf_iops: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub(super) from_empty: Option<FromEmpty>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub(super) from_snapshot: Option<FromSnapshot>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub(super) tags: Vec<String>,
}

#[derive(Debug, Serialize)]
pub(super) struct FromEmpty {
    pub(super) size: u64,
}

#[derive(Debug, Serialize)]
pub(super) struct FromSnapshot {
    pub(super) snapshot_id: String,
    pub(super) size: u64,
}

#[derive(Debug, Serialize)]
pub(super) struct UpdateVolumeBody {
    pub(super) size: u64,
}

#[derive(Debug, Serialize)]
pub(super) struct CreateSnapshotBody {
    pub(super) volume_id: String,
    pub(super) name: String,
    pub(super) project_id: String,
}

#[derive(Debug, Deserialize)]
pub(super) struct Volume {
    pub(super) id: String,
    pub(super) name: String,
    pub(super) size: u64,
    pub(super) status: String,
    pub(super) zone: String,
    #[serde(default)]
    pub(super) references: Vec<Reference>,
}

#[derive(Debug, Deserialize)]
pub(super) struct Reference {
    pub(super) product_resource_type: String,
    pub(super) product_resource_id: String,
}

#[derive(Debug, Deserialize)]
pub(super) struct ListVolumesResponse {
    pub(super) volumes: Vec<Volume>,
}

#[derive(Debug, Deserialize)]
pub(super) struct Snapshot {
    pub(super) id: String,
    pub(super) name: String,
    #[serde(default)]
    pub(super) parent_volume: Option<ParentVolume>,
    pub(super) size: u64,
    pub(super) status: String,
    #[serde(default)]
    pub(super) created_at: Option<String>,
}

#[derive(Debug, Deserialize)]
pub(super) struct ParentVolume {
    pub(super) id: String,
}

/// Request body for the `attach-volume` server action.
#[derive(Clone, Debug, Serialize)]
pub(super) struct AttachVolumeBody {
    pub(super) volume_id: String,
    pub(super) volume_type: String,
}

/// Request body for the `detach-volume` server action.
#[derive(Clone, Debug, Serialize)]
pub(super) struct DetachVolumeBody {
    pub(super) volume_id: String,
}

/// Rounds a GiB capacity up to the whole-GB granularity the API accepts.
pub(super) fn gib_to_api_bytes(size_gib: u64) -> u64 {
    size_gib
        .saturating_mul(BYTES_PER_GIB)
        .div_ceil(BYTES_PER_GB)
        .saturating_mul(BYTES_PER_GB)
}

/// Whole GiB contained in a byte count reported by the API, rounded down.
pub(super) const fn api_bytes_to_gib(bytes: u64) -> u64 {
    bytes.div_euclid(BYTES_PER_GIB)
}

/// Maps the IOPS tier encoded in a disk type such as `sbs_15k`.
pub(super) fn perf_iops(disk_type: &str) -> Option<u32> {
    match disk_type {
        "sbs_5k" => Some(5_000),
        "sbs_15k" => Some(15_000),
        _ => None,
    }
}

fn attached_server(volume: &Volume) -> Option<String> {
    volume
        .references
        .iter()
        .find(|reference| reference.product_resource_type == SERVER_RESOURCE_TYPE)
        .map(|reference| reference.product_resource_id.clone())
}

/// The block API only reports `available`/`in_use`; the server reference is
/// written separately, so a mismatch between the two means a transition is
/// still propagating.
fn disk_status(status: &str, attached: bool) -> DiskStatus {
    match (status, attached) {
        ("creating", _) => DiskStatus::Creating,
        ("available", false) => DiskStatus::Unattached,
        ("available", true) => DiskStatus::Attaching,
        ("in_use", true) => DiskStatus::Attached,
        ("in_use", false) => DiskStatus::Detaching,
        (other, _) => DiskStatus::Other(other.to_owned()),
    }
}

fn snapshot_status(status: &str) -> (SnapshotStatus, u8) {
    match status {
        "available" => (SnapshotStatus::Normal, 100),
        "creating" => (SnapshotStatus::Creating, 0),
        "error" => (SnapshotStatus::Failed, 0),
        other => (SnapshotStatus::Other(other.to_owned()), 0),
    }
}

impl Volume {
    /// Converts to the boundary type, zoning the identifier with `zone`.
    pub(super) fn into_remote(self, zone: &str) -> RemoteDisk {
        let attached_to = attached_server(&self);
        RemoteDisk {
            status: disk_status(&self.status, attached_to.is_some()),
            attached_to,
            size_gib: api_bytes_to_gib(self.size),
            id: format!("{zone}/{}", self.id),
            name: self.name,
            zone: self.zone,
        }
    }
}

impl Snapshot {
    /// Converts to the boundary type, zoning both identifiers with `zone`.
    pub(super) fn into_remote(self, zone: &str) -> RemoteSnapshot {
        let (status, percent) = snapshot_status(&self.status);
        RemoteSnapshot {
            id: format!("{zone}/{}", self.id),
            name: self.name,
            source_disk_id: self
                .parent_volume
                .map(|parent| format!("{zone}/{}", parent.id))
                .unwrap_or_default(),
            status,
            percent,
            size_bytes: self.size,
            created_at: self.created_at,
        }
    }
}

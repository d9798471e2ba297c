//! Command-line interface definitions for the `volplane` binary.
//!
//! This module centralises the clap parser structures so both the main binary
//! and the build script can reuse them when generating the manual page.

use clap::{Args, Parser};

/// Top-level CLI for the `volplane` binary.
#[derive(Debug, Parser)]
#[command(
    name = "volplane",
    about = "Provision, attach, and mount remote block volumes",
    arg_required_else_help = true
)]
pub(crate) enum Cli {
    /// Create a volume, or return the one created earlier under the same name.
    #[command(name = "create-volume")]
    CreateVolume(CreateVolumeCommand),
    /// Delete a volume; an absent volume counts as deleted.
    #[command(name = "delete-volume")]
    DeleteVolume(VolumeIdArgs),
    /// Grow a volume to at least the requested size.
    #[command(name = "expand-volume")]
    ExpandVolume(ExpandVolumeCommand),
    /// Attach a volume to a node and wait for the attachment.
    #[command(name = "publish")]
    Publish(AttachmentArgs),
    /// Detach a volume from a node and wait for the detachment.
    #[command(name = "unpublish")]
    Unpublish(AttachmentArgs),
    /// Create a snapshot, or report the progress of an earlier one.
    #[command(name = "create-snapshot")]
    CreateSnapshot(CreateSnapshotCommand),
    /// Delete a snapshot; an unknown snapshot counts as deleted.
    #[command(name = "delete-snapshot")]
    DeleteSnapshot(DeleteSnapshotCommand),
    /// Format and mount a volume at its staging path on this node.
    #[command(name = "stage")]
    Stage(StageCommand),
    /// Unmount a volume from its staging path on this node.
    #[command(name = "unstage")]
    Unstage(UnstageCommand),
    /// Bind-mount a staged volume into a workload directory.
    #[command(name = "node-publish")]
    NodePublish(NodePublishCommand),
    /// Unmount a workload directory and remove it.
    #[command(name = "node-unpublish")]
    NodeUnpublish(NodeUnpublishCommand),
    /// Grow the aggregate and file system of a mounted volume.
    #[command(name = "node-expand")]
    NodeExpand(NodeExpandCommand),
    /// Print this node's identity and topology.
    #[command(name = "node-info")]
    NodeInfo,
}

/// Parses a `KEY=VALUE` pair.
pub(crate) fn parse_key_value(raw: &str) -> Result<(String, String), String> {
    match raw.split_once('=') {
        Some((key, value)) if !key.trim().is_empty() => {
            Ok((key.trim().to_owned(), value.trim().to_owned()))
        }
        _ => Err(format!("expected KEY=VALUE, got {raw:?}")),
    }
}

/// Arguments naming a single volume.
#[derive(Debug, Args)]
pub(crate) struct VolumeIdArgs {
    /// Remote volume identifier.
    #[arg(long, value_name = "ID")]
    pub(crate) volume_id: String,
}

/// Arguments for `volplane create-volume`.
#[derive(Debug, Args)]
pub(crate) struct CreateVolumeCommand {
    /// Idempotency name of the volume.
    #[arg(long)]
    pub(crate) name: String,
    /// Minimum capacity in bytes; 0 selects the default size.
    #[arg(long, value_name = "BYTES", default_value_t = 0)]
    pub(crate) required_bytes: u64,
    /// Maximum capacity in bytes; 0 means unbounded.
    #[arg(long, value_name = "BYTES", default_value_t = 0)]
    pub(crate) limit_bytes: u64,
    /// File system the volume will carry.
    #[arg(long, value_name = "FS", default_value = "ext4")]
    pub(crate) fs_type: String,
    /// Provider parameter such as `diskType=sbs_15k`; repeatable.
    #[arg(long = "parameter", value_name = "KEY=VALUE", value_parser = parse_key_value)]
    pub(crate) parameters: Vec<(String, String)>,
    /// Snapshot to restore the volume from.
    #[arg(long, value_name = "SNAPSHOT_ID")]
    pub(crate) from_snapshot: Option<String>,
    /// Preferred placement zone.
    #[arg(long, value_name = "ZONE")]
    pub(crate) preferred_zone: Option<String>,
}

/// Arguments for `volplane expand-volume`.
#[derive(Debug, Args)]
pub(crate) struct ExpandVolumeCommand {
    /// Remote volume identifier.
    #[arg(long, value_name = "ID")]
    pub(crate) volume_id: String,
    /// New minimum capacity in bytes.
    #[arg(long, value_name = "BYTES")]
    pub(crate) required_bytes: u64,
}

/// Arguments naming a volume and a node.
#[derive(Debug, Args)]
pub(crate) struct AttachmentArgs {
    /// Remote volume identifier.
    #[arg(long, value_name = "ID")]
    pub(crate) volume_id: String,
    /// Server the volume is attached to.
    #[arg(long, value_name = "ID")]
    pub(crate) node_id: String,
}

/// Arguments for `volplane create-snapshot`.
#[derive(Debug, Args)]
pub(crate) struct CreateSnapshotCommand {
    /// Idempotency name of the snapshot.
    #[arg(long)]
    pub(crate) name: String,
    /// Volume to snapshot.
    #[arg(long, value_name = "ID")]
    pub(crate) source_volume_id: String,
}

/// Arguments for `volplane delete-snapshot`.
#[derive(Debug, Args)]
pub(crate) struct DeleteSnapshotCommand {
    /// Remote snapshot identifier.
    #[arg(long, value_name = "ID")]
    pub(crate) snapshot_id: String,
}

/// Arguments for `volplane stage`.
#[derive(Debug, Args)]
pub(crate) struct StageCommand {
    /// Remote volume identifier.
    #[arg(long, value_name = "ID")]
    pub(crate) volume_id: String,
    /// Host-global staging directory.
    #[arg(long, value_name = "PATH")]
    pub(crate) staging_path: String,
    /// File system to create when the device is blank.
    #[arg(long, value_name = "FS", default_value = "")]
    pub(crate) fs_type: String,
    /// Extra mount option; repeatable.
    #[arg(long = "mount-flag", value_name = "FLAG")]
    pub(crate) mount_flags: Vec<String>,
    /// Stage context such as `disks=vol-1,vol-2` or `level=striped`.
    #[arg(long = "context", value_name = "KEY=VALUE", value_parser = parse_key_value)]
    pub(crate) context: Vec<(String, String)>,
}

/// Arguments for `volplane unstage`.
#[derive(Debug, Args)]
pub(crate) struct UnstageCommand {
    /// Remote volume identifier.
    #[arg(long, value_name = "ID")]
    pub(crate) volume_id: String,
    /// Host-global staging directory.
    #[arg(long, value_name = "PATH")]
    pub(crate) staging_path: String,
}

/// Arguments for `volplane node-publish`.
#[derive(Debug, Args)]
pub(crate) struct NodePublishCommand {
    /// Remote volume identifier.
    #[arg(long, value_name = "ID")]
    pub(crate) volume_id: String,
    /// Staging directory the volume is mounted at.
    #[arg(long, value_name = "PATH")]
    pub(crate) staging_path: String,
    /// Workload directory to bind-mount into.
    #[arg(long, value_name = "PATH")]
    pub(crate) target_path: String,
    /// Extra mount option; repeatable.
    #[arg(long = "mount-flag", value_name = "FLAG")]
    pub(crate) mount_flags: Vec<String>,
    /// Mount the target read-only.
    #[arg(long)]
    pub(crate) read_only: bool,
}

/// Arguments for `volplane node-unpublish`.
#[derive(Debug, Args)]
pub(crate) struct NodeUnpublishCommand {
    /// Remote volume identifier.
    #[arg(long, value_name = "ID")]
    pub(crate) volume_id: String,
    /// Workload directory to unmount.
    #[arg(long, value_name = "PATH")]
    pub(crate) target_path: String,
}

/// Arguments for `volplane node-expand`.
#[derive(Debug, Args)]
pub(crate) struct NodeExpandCommand {
    /// Remote volume identifier.
    #[arg(long, value_name = "ID")]
    pub(crate) volume_id: String,
    /// Path the volume is mounted at.
    #[arg(long, value_name = "PATH")]
    pub(crate) volume_path: String,
    /// Staging path used to name an aggregate.
    #[arg(long, value_name = "PATH")]
    pub(crate) staging_path: Option<String>,
    /// Expand context such as `disks=vol-1,vol-2` or `level=striped`.
    #[arg(long = "context", value_name = "KEY=VALUE", value_parser = parse_key_value)]
    pub(crate) context: Vec<(String, String)>,
}

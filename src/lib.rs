//! Core library for the `volplane` block volume driver.
//!
//! The controller side creates, attaches, snapshots, and deletes volumes on an
//! asynchronous remote storage service, turning each request into a bounded,
//! retry-safe wait for the remote resource to converge. The node side finds
//! the attached block devices, optionally aggregates several of them with
//! software RAID or LVM, and formats and mounts the result.

pub mod command;
pub mod config;
pub mod controller;
pub mod device;
pub mod error;
pub mod idempotency;
pub mod metadata;
pub mod mount;
pub mod node;
pub mod poll;
pub mod remote;
pub mod snapshot_cache;
pub mod test_support;
pub mod types;

pub use command::{CommandError, CommandOutput, CommandRunner, ProcessCommandRunner};
pub use config::{ConfigError, ControllerCredentials, DriverConfig};
pub use controller::{
    ControllerError, ControllerSettings, CreateVolumeRequest, ExpandedVolume, Snapshot, Volume,
    VolumeController,
};
pub use device::{
    AssemblyError, DeviceAssembler, DeviceLocator, DiskSet, Layout, LocateError, LvmMode,
    RaidLevel,
};
pub use error::Code;
pub use idempotency::{Fingerprint, InFlight, InFlightGuard};
pub use metadata::{FileStore, MemoryStore, MetadataError, MetadataStore};
pub use mount::{MountEntry, MountError, Mounter, SystemMounter};
pub use node::{
    NodeController, NodeError, NodeExpandRequest, NodeInfo, NodePublishRequest, StageRequest,
};
pub use poll::{PollPolicy, PollTimeout, poll_until};
pub use remote::{RemoteClient, RemoteError, ScalewayClient};
pub use snapshot_cache::{SnapshotCache, SnapshotRecord};
pub use types::{
    AccessMode, AccessType, CapacityRange, ContentSource, Topology, TopologyRequirement,
    VolumeCapability,
};

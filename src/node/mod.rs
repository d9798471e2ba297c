//! Host-side staging and publishing of attached volumes.
//!
//! Staging resolves the block device behind a volume (one located disk, or
//! an aggregate of several), formats it when blank, and mounts it at a
//! host-global staging path. Publishing bind-mounts the staging path into a
//! workload directory. Every operation inspects the mount table first, so a
//! repeated call for an already satisfied request performs no mounts.

use std::collections::BTreeMap;
use std::io;

use camino::{Utf8Path, Utf8PathBuf};
use cap_std::{ambient_authority, fs_utf8::Dir};
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info, instrument, warn};

use crate::command::CommandRunner;
use crate::device::{AssemblyError, DeviceAssembler, DeviceLocator, DiskSet, LocateError};
use crate::error::Code;
use crate::idempotency::{Fingerprint, InFlight, InFlightGuard};
use crate::mount::{DEFAULT_FS_TYPE, MountError, Mounter};
use crate::types::{AccessType, Topology, VolumeCapability, zone_topology};

/// Errors raised by [`NodeController`] operations.
#[derive(Debug, Error)]
pub enum NodeError {
    /// The request is malformed.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    /// The request asks for an access type this node does not serve.
    #[error("{0} is not supported")]
    Unsupported(String),
    /// An identical request is already being processed.
    #[error("{operation} of volume {volume_id} is already in progress")]
    InProgress {
        /// Operation being repeated.
        operation: &'static str,
        /// Volume the request targets.
        volume_id: String,
    },
    /// The staging path is mounted from another device.
    #[error("{path} is already mounted from {device}")]
    MountedElsewhere {
        /// Staging path.
        path: Utf8PathBuf,
        /// Device currently mounted there.
        device: String,
    },
    /// Nothing is mounted where a mounted volume was expected.
    #[error("no volume is mounted at {path}")]
    NotMounted {
        /// Volume path named by the request.
        path: Utf8PathBuf,
    },
    /// A staging or target directory could not be prepared.
    #[error("failed to prepare {path}: {message}")]
    Io {
        /// Directory being prepared.
        path: Utf8PathBuf,
        /// Operating system error message.
        message: String,
    },
    /// A backing disk could not be located.
    #[error(transparent)]
    Locate(#[from] LocateError),
    /// The aggregate device could not be built or grown.
    #[error(transparent)]
    Assembly(#[from] AssemblyError),
    /// A mount primitive failed.
    #[error(transparent)]
    Mount(#[from] MountError),
}

impl NodeError {
    /// Status code reported to callers.
    #[must_use]
    pub const fn code(&self) -> Code {
        match self {
            Self::InvalidArgument(_)
            | Self::Assembly(
                AssemblyError::UnknownLevel { .. }
                | AssemblyError::NoDisks { .. }
                | AssemblyError::TooFewMembers { .. }
                | AssemblyError::UnnamedPath { .. },
            )
            | Self::Mount(MountError::UnsupportedFilesystem { .. }) => Code::InvalidArgument,
            Self::Unsupported(_) | Self::Assembly(AssemblyError::RaidExpansionUnsupported { .. }) => {
                Code::Unimplemented
            }
            Self::MountedElsewhere { .. } => Code::FailedPrecondition,
            Self::NotMounted { .. } => Code::NotFound,
            Self::InProgress { .. }
            | Self::Io { .. }
            | Self::Locate(_)
            | Self::Assembly(_)
            | Self::Mount(_) => Code::Internal,
        }
    }
}

/// Mounts a volume's device at a host-global staging path.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct StageRequest {
    /// Volume being staged.
    pub volume_id: String,
    /// Host-global staging directory.
    pub staging_path: Utf8PathBuf,
    /// Requested access.
    pub capability: VolumeCapability,
    /// Stage context; carries `disks` and `level` for aggregated volumes.
    pub context: BTreeMap<String, String>,
}

impl Fingerprint for StageRequest {
    fn fingerprint(&self) -> String {
        let context: Vec<String> = self
            .context
            .iter()
            .map(|(key, value)| format!("{key}={value}"))
            .collect();
        format!(
            "stage/{}/{}/{:?}/{}",
            self.volume_id,
            self.staging_path,
            self.capability,
            context.join(",")
        )
    }
}

/// Bind-mounts a staged volume into a workload directory.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct NodePublishRequest {
    /// Volume being published.
    pub volume_id: String,
    /// Staging directory the volume is mounted at.
    pub staging_path: Utf8PathBuf,
    /// Workload directory.
    pub target_path: Utf8PathBuf,
    /// Requested access.
    pub capability: VolumeCapability,
    /// Mount the target read-only.
    pub read_only: bool,
}

impl Fingerprint for NodePublishRequest {
    fn fingerprint(&self) -> String {
        format!(
            "publish/{}/{}/{}/{}",
            self.volume_id, self.staging_path, self.target_path, self.read_only
        )
    }
}

/// Grows a mounted volume after its backing disks were resized.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct NodeExpandRequest {
    /// Volume being expanded.
    pub volume_id: String,
    /// Path the volume is mounted at.
    pub volume_path: Utf8PathBuf,
    /// Staging path, used to name the aggregate when given.
    pub staging_path: Option<Utf8PathBuf>,
    /// Context carrying `disks` and `level` for aggregated volumes.
    pub context: BTreeMap<String, String>,
}

/// Identity and placement reported by a node.
#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeInfo {
    /// Identifier used for attachments.
    pub node_id: String,
    /// Zone the node runs in.
    pub zone: String,
    /// Segments volumes must be reachable from to be usable here.
    pub accessible_topology: Topology,
}

/// Orchestrates staging and publishing on one host.
pub struct NodeController<M, R> {
    node_id: String,
    zone: String,
    locator: DeviceLocator,
    assembler: DeviceAssembler<R>,
    mounter: M,
    in_flight: InFlight,
}

impl<M: Mounter, R: CommandRunner> NodeController<M, R> {
    /// Creates a node controller.
    #[must_use]
    pub fn new(
        node_id: impl Into<String>,
        zone: impl Into<String>,
        locator: DeviceLocator,
        assembler: DeviceAssembler<R>,
        mounter: M,
    ) -> Self {
        Self {
            node_id: node_id.into(),
            zone: zone.into(),
            locator,
            assembler,
            mounter,
            in_flight: InFlight::new(),
        }
    }

    /// Reports the node identity and its zone as accessible topology.
    #[must_use]
    pub fn get_info(&self) -> NodeInfo {
        NodeInfo {
            node_id: self.node_id.clone(),
            zone: self.zone.clone(),
            accessible_topology: zone_topology(&self.zone),
        }
    }

    /// Formats (when blank) and mounts the volume's device at the staging
    /// path. A staging path already mounted from that device is left as is.
    ///
    /// # Errors
    ///
    /// Returns [`NodeError::InProgress`] while an identical request runs,
    /// [`NodeError::MountedElsewhere`] when another device occupies the
    /// staging path, and the underlying error when locating, assembling, or
    /// mounting fails.
    #[instrument(
        skip(self, request),
        fields(volume_id = %request.volume_id, staging_path = %request.staging_path)
    )]
    pub fn stage(&self, request: &StageRequest) -> Result<(), NodeError> {
        require(&request.volume_id, "volume id")?;
        require(request.staging_path.as_str(), "staging path")?;
        let (fs_type, mount_flags) = mount_access(&request.capability)?;
        let _guard = self.acquire("stage", &request.volume_id, request.fingerprint())?;

        create_dir(&request.staging_path)?;
        let set = DiskSet::from_context(&request.volume_id, &request.context)?;
        let device = self.resolve_device(&set, &request.staging_path)?;

        if !self.mounter.is_likely_not_mount_point(&request.staging_path)?
            && let Some(entry) = self.mounter.mount_info(&request.staging_path)?
        {
            if self.mounter.is_same_device(&entry.source, &device) {
                debug!(device = %device, "volume already staged");
                return Ok(());
            }
            return Err(NodeError::MountedElsewhere {
                path: request.staging_path.clone(),
                device: entry.source,
            });
        }

        let fs = if fs_type.is_empty() {
            DEFAULT_FS_TYPE
        } else {
            fs_type
        };
        self.mounter
            .format_and_mount(&device, &request.staging_path, fs, mount_flags)?;
        info!(device = %device, fs_type = fs, "volume staged");
        Ok(())
    }

    /// Unmounts the staging path. Nothing mounted there counts as success.
    ///
    /// # Errors
    ///
    /// Returns [`NodeError::InProgress`] while an identical request runs and
    /// [`NodeError::Mount`] when unmounting fails.
    #[instrument(skip(self))]
    pub fn unstage(&self, volume_id: &str, staging_path: &Utf8Path) -> Result<(), NodeError> {
        require(volume_id, "volume id")?;
        require(staging_path.as_str(), "staging path")?;
        let _guard = self.acquire(
            "unstage",
            volume_id,
            format!("unstage/{volume_id}/{staging_path}"),
        )?;
        self.unmount_if_mounted(staging_path)?;
        info!("volume unstaged");
        Ok(())
    }

    /// Bind-mounts the staging path at the target path.
    ///
    /// # Errors
    ///
    /// Returns [`NodeError::Unsupported`] for block access and the
    /// underlying error when preparing or mounting the target fails.
    #[instrument(
        skip(self, request),
        fields(volume_id = %request.volume_id, target_path = %request.target_path)
    )]
    pub fn publish(&self, request: &NodePublishRequest) -> Result<(), NodeError> {
        require(&request.volume_id, "volume id")?;
        require(request.staging_path.as_str(), "staging path")?;
        require(request.target_path.as_str(), "target path")?;
        let (_, mount_flags) = mount_access(&request.capability)?;
        let _guard = self.acquire("publish", &request.volume_id, request.fingerprint())?;

        create_dir(&request.target_path)?;
        if !self.mounter.is_likely_not_mount_point(&request.target_path)? {
            debug!("volume already published");
            return Ok(());
        }

        let mut options = vec![String::from("bind")];
        options.extend(mount_flags.iter().cloned());
        if request.read_only {
            options.push(String::from("ro"));
        }
        self.mounter.mount(
            request.staging_path.as_str(),
            &request.target_path,
            "",
            &options,
        )?;
        info!(read_only = request.read_only, "volume published");
        Ok(())
    }

    /// Unmounts the target path and removes the emptied directory.
    ///
    /// A target that is not mounted, or whose mount has lost its backing
    /// connection, counts as already unpublished.
    ///
    /// # Errors
    ///
    /// Returns [`NodeError::Mount`] when unmounting fails and
    /// [`NodeError::Io`] when the directory cannot be removed.
    #[instrument(skip(self))]
    pub fn unpublish(&self, volume_id: &str, target_path: &Utf8Path) -> Result<(), NodeError> {
        require(volume_id, "volume id")?;
        require(target_path.as_str(), "target path")?;
        let _guard = self.acquire(
            "unpublish",
            volume_id,
            format!("unpublish/{volume_id}/{target_path}"),
        )?;
        self.unmount_if_mounted(target_path)?;
        remove_dir(target_path)?;
        info!("volume unpublished");
        Ok(())
    }

    /// Grows the aggregate (if any) and the mounted file system.
    ///
    /// # Errors
    ///
    /// Returns [`NodeError::NotMounted`] when nothing is mounted at the
    /// volume path, [`NodeError::Assembly`] when the aggregate cannot grow,
    /// and [`NodeError::Mount`] when the file system resize fails.
    #[instrument(
        skip(self, request),
        fields(volume_id = %request.volume_id, volume_path = %request.volume_path)
    )]
    pub fn expand(&self, request: &NodeExpandRequest) -> Result<(), NodeError> {
        require(&request.volume_id, "volume id")?;
        require(request.volume_path.as_str(), "volume path")?;
        let _guard = self.acquire(
            "expand",
            &request.volume_id,
            format!("expand/{}/{}", request.volume_id, request.volume_path),
        )?;

        let entry = self
            .mounter
            .mount_info(&request.volume_path)?
            .ok_or_else(|| NodeError::NotMounted {
                path: request.volume_path.clone(),
            })?;

        let set = DiskSet::from_context(&request.volume_id, &request.context)?;
        if set.is_aggregated() {
            let devices = self.locate_all(&set)?;
            let name_path = request
                .staging_path
                .as_deref()
                .unwrap_or(&request.volume_path);
            self.assembler.expand(&devices, &set, name_path)?;
        }

        self.mounter
            .resize_filesystem(&entry, &request.volume_path)?;
        info!(device = %entry.source, fs_type = %entry.fs_type, "volume expanded");
        Ok(())
    }

    fn acquire(
        &self,
        operation: &'static str,
        volume_id: &str,
        fingerprint: String,
    ) -> Result<InFlightGuard<'_>, NodeError> {
        self.in_flight
            .try_acquire(fingerprint)
            .ok_or_else(|| NodeError::InProgress {
                operation,
                volume_id: volume_id.to_owned(),
            })
    }

    fn resolve_device(&self, set: &DiskSet, path: &Utf8Path) -> Result<Utf8PathBuf, NodeError> {
        let mut devices = self.locate_all(set)?;
        if set.is_aggregated() {
            return Ok(self.assembler.assemble(&devices, set, path)?);
        }
        devices.pop().ok_or_else(|| {
            NodeError::InvalidArgument(String::from("no disks listed for the volume"))
        })
    }

    fn locate_all(&self, set: &DiskSet) -> Result<Vec<Utf8PathBuf>, NodeError> {
        set.disks
            .iter()
            .map(|disk| self.locator.locate(disk).map_err(NodeError::from))
            .collect()
    }

    fn unmount_if_mounted(&self, path: &Utf8Path) -> Result<(), NodeError> {
        match self.mounter.is_likely_not_mount_point(path) {
            Ok(true) => {
                debug!(path = %path, "nothing mounted");
                Ok(())
            }
            Ok(false) => Ok(self.mounter.unmount(path)?),
            Err(MountError::Disconnected { .. }) => {
                warn!(path = %path, "mount endpoint is not connected, unmounting stale mount");
                Ok(self.mounter.unmount(path)?)
            }
            Err(err) => Err(err.into()),
        }
    }
}

fn require(value: &str, field: &str) -> Result<(), NodeError> {
    if value.trim().is_empty() {
        return Err(NodeError::InvalidArgument(format!("{field} is required")));
    }
    Ok(())
}

fn mount_access(capability: &VolumeCapability) -> Result<(&str, &[String]), NodeError> {
    match &capability.access_type {
        AccessType::Mount {
            fs_type,
            mount_flags,
        } => Ok((fs_type.as_str(), mount_flags.as_slice())),
        AccessType::Block => Err(NodeError::Unsupported(String::from("block access"))),
    }
}

fn create_dir(path: &Utf8Path) -> Result<(), NodeError> {
    Dir::create_ambient_dir_all(path, ambient_authority()).map_err(|err| NodeError::Io {
        path: path.to_path_buf(),
        message: err.to_string(),
    })
}

fn remove_dir(path: &Utf8Path) -> Result<(), NodeError> {
    let (Some(parent), Some(name)) = (path.parent(), path.file_name()) else {
        return Ok(());
    };
    let removed =
        Dir::open_ambient_dir(parent, ambient_authority()).and_then(|dir| dir.remove_dir(name));
    match removed {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(NodeError::Io {
            path: path.to_path_buf(),
            message: err.to_string(),
        }),
    }
}

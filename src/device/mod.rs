//! Local block devices: locating attached disks and aggregating several of
//! them into one mountable device.
//!
//! Aggregated devices are named from the staging (or publish) path so that a
//! repeated stage call finds the array or logical volume it created earlier
//! instead of building a second one.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use camino::{Utf8Component, Utf8Path, Utf8PathBuf};
use thiserror::Error;
use tracing::{info, instrument};

use crate::command::{CommandError, CommandRunner};

mod locator;
mod lvm;
mod raid;

pub use locator::{DeviceLocator, LocateError};

/// Context key listing the backing disks, comma separated.
pub const DISKS_KEY: &str = "disks";
/// Context key selecting the aggregation level.
pub const LEVEL_KEY: &str = "level";

/// Per-volume leaf directories kubelet appends to staging and publish paths.
const KUBELET_LEAVES: [&str; 2] = ["globalmount", "mount"];

/// Errors raised while assembling or expanding an aggregated device.
#[derive(Debug, Error, Eq, PartialEq)]
pub enum AssemblyError {
    /// The `level` parameter names no known layout.
    #[error("unknown aggregation level {level:?}")]
    UnknownLevel {
        /// Value supplied by the caller.
        level: String,
    },
    /// The `disks` parameter is empty.
    #[error("no disks listed for volume {volume_id}")]
    NoDisks {
        /// Volume being staged.
        volume_id: String,
    },
    /// Fewer devices were located than disks were requested.
    #[error("expected {expected} devices, located {located}")]
    DeviceCountMismatch {
        /// Requested disk count.
        expected: usize,
        /// Located device count.
        located: usize,
    },
    /// The RAID level needs more members.
    #[error("{level} needs at least {minimum} devices, got {count}")]
    TooFewMembers {
        /// Requested level.
        level: Layout,
        /// Minimum member count.
        minimum: usize,
        /// Supplied member count.
        count: usize,
    },
    /// No usable name could be derived from the path.
    #[error("cannot derive an aggregate name from {path}")]
    UnnamedPath {
        /// Staging or publish path.
        path: Utf8PathBuf,
    },
    /// Growing a software RAID array in place is not offered.
    #[error("expanding {level} arrays is not supported")]
    RaidExpansionUnsupported {
        /// Level of the array.
        level: Layout,
    },
    /// A RAID or LVM tool failed.
    #[error(transparent)]
    Command(#[from] CommandError),
}

/// Software RAID level handled by `mdadm`.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum RaidLevel {
    /// Striping without redundancy.
    Raid0,
    /// Mirroring.
    Raid1,
    /// Striping with distributed parity.
    Raid5,
    /// Striped mirrors.
    Raid10,
}

impl RaidLevel {
    const fn mdadm_level(self) -> &'static str {
        match self {
            Self::Raid0 => "0",
            Self::Raid1 => "1",
            Self::Raid5 => "5",
            Self::Raid10 => "10",
        }
    }

    const fn min_members(self) -> usize {
        match self {
            Self::Raid0 | Self::Raid1 => 2,
            Self::Raid5 => 3,
            Self::Raid10 => 4,
        }
    }
}

/// Allocation of a volume group's logical volume across its devices.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum LvmMode {
    /// Concatenated extents.
    Linear,
    /// Extents striped across every device.
    Striped,
}

/// Aggregation strategy selected by the `level` context key.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Layout {
    /// Software RAID array.
    Raid(RaidLevel),
    /// LVM volume group with one logical volume.
    VolumeGroup(LvmMode),
}

impl Default for Layout {
    fn default() -> Self {
        Self::Raid(RaidLevel::Raid0)
    }
}

impl fmt::Display for Layout {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Raid(RaidLevel::Raid0) => "raid0",
            Self::Raid(RaidLevel::Raid1) => "raid1",
            Self::Raid(RaidLevel::Raid5) => "raid5",
            Self::Raid(RaidLevel::Raid10) => "raid10",
            Self::VolumeGroup(LvmMode::Linear) => "linear",
            Self::VolumeGroup(LvmMode::Striped) => "striped",
        };
        f.write_str(name)
    }
}

impl FromStr for Layout {
    type Err = AssemblyError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "" | "raid0" => Ok(Self::Raid(RaidLevel::Raid0)),
            "raid1" => Ok(Self::Raid(RaidLevel::Raid1)),
            "raid5" => Ok(Self::Raid(RaidLevel::Raid5)),
            "raid10" => Ok(Self::Raid(RaidLevel::Raid10)),
            "linear" => Ok(Self::VolumeGroup(LvmMode::Linear)),
            "striped" => Ok(Self::VolumeGroup(LvmMode::Striped)),
            _ => Err(AssemblyError::UnknownLevel {
                level: value.to_owned(),
            }),
        }
    }
}

/// Disks backing one volume and how to combine them.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct DiskSet {
    /// Remote disk identifiers in assembly order.
    pub disks: Vec<String>,
    /// Aggregation strategy, used when more than one disk is listed.
    pub layout: Layout,
}

impl DiskSet {
    /// Reads the disk list and level from a stage or expand context.
    ///
    /// Without a `disks` entry the volume id itself is the only disk.
    ///
    /// # Errors
    ///
    /// Returns [`AssemblyError`] for an unknown level or an empty disk list.
    pub fn from_context(
        volume_id: &str,
        context: &BTreeMap<String, String>,
    ) -> Result<Self, AssemblyError> {
        let layout = context
            .get(LEVEL_KEY)
            .map_or_else(|| Ok(Layout::default()), |level| level.parse())?;
        let disks: Vec<String> = match context.get(DISKS_KEY) {
            Some(list) => list
                .split(',')
                .map(str::trim)
                .filter(|disk| !disk.is_empty())
                .map(str::to_owned)
                .collect(),
            None => vec![volume_id.to_owned()],
        };
        if disks.is_empty() {
            return Err(AssemblyError::NoDisks {
                volume_id: volume_id.to_owned(),
            });
        }
        Ok(Self { disks, layout })
    }

    /// Returns `true` when several disks must be combined.
    #[must_use]
    pub const fn is_aggregated(&self) -> bool {
        self.disks.len() > 1
    }
}

/// Derives a stable aggregate name from a staging or publish path.
///
/// The `pvc-*` component is preferred. Otherwise the last component that is
/// not a kubelet leaf directory (`globalmount`, `mount`) names the volume, so
/// `.../pv/static-a/globalmount` and `.../static-a/mount` agree. Characters
/// outside `[A-Za-z0-9_.+-]` become `_`.
///
/// # Errors
///
/// Returns [`AssemblyError::UnnamedPath`] when no component is usable.
pub fn aggregate_name(path: &Utf8Path) -> Result<String, AssemblyError> {
    let parts: Vec<&str> = path
        .components()
        .filter_map(|part| match part {
            Utf8Component::Normal(name) => Some(name),
            _ => None,
        })
        .collect();
    let component = parts
        .iter()
        .find(|part| part.starts_with("pvc-"))
        .or_else(|| parts.iter().rev().find(|part| !KUBELET_LEAVES.contains(*part)))
        .ok_or_else(|| AssemblyError::UnnamedPath {
            path: path.to_path_buf(),
        })?;
    let sanitized: String = component
        .chars()
        .map(|ch| {
            if ch.is_ascii_alphanumeric() || matches!(ch, '_' | '.' | '+' | '-') {
                ch
            } else {
                '_'
            }
        })
        .collect();
    let trimmed = sanitized.trim_start_matches('-');
    if trimmed.is_empty() {
        return Err(AssemblyError::UnnamedPath {
            path: path.to_path_buf(),
        });
    }
    Ok(trimmed.to_owned())
}

/// Builds one logical device out of several located devices.
#[derive(Clone, Debug)]
pub struct DeviceAssembler<R> {
    runner: R,
}

impl<R: CommandRunner> DeviceAssembler<R> {
    /// Creates an assembler running RAID and LVM tools through `runner`.
    #[must_use]
    pub const fn new(runner: R) -> Self {
        Self { runner }
    }

    /// Assembles `devices` according to `set` and returns the device path.
    ///
    /// Calling this again for the same path reuses the existing aggregate.
    ///
    /// # Errors
    ///
    /// Returns [`AssemblyError`] when the device count is wrong or a tool
    /// fails.
    #[instrument(skip(self, devices), fields(layout = %set.layout))]
    pub fn assemble(
        &self,
        devices: &[Utf8PathBuf],
        set: &DiskSet,
        path: &Utf8Path,
    ) -> Result<Utf8PathBuf, AssemblyError> {
        if devices.len() != set.disks.len() {
            return Err(AssemblyError::DeviceCountMismatch {
                expected: set.disks.len(),
                located: devices.len(),
            });
        }
        let name = aggregate_name(path)?;
        let device = match set.layout {
            Layout::Raid(level) => raid::assemble(&self.runner, &name, level, devices)?,
            Layout::VolumeGroup(mode) => lvm::assemble(&self.runner, &name, mode, devices)?,
        };
        info!(device = %device, "aggregate ready");
        Ok(device)
    }

    /// Grows the aggregate after its backing disks were resized.
    ///
    /// # Errors
    ///
    /// Returns [`AssemblyError::RaidExpansionUnsupported`] for RAID layouts
    /// and [`AssemblyError::Command`] when an LVM tool fails.
    #[instrument(skip(self, devices), fields(layout = %set.layout))]
    pub fn expand(
        &self,
        devices: &[Utf8PathBuf],
        set: &DiskSet,
        path: &Utf8Path,
    ) -> Result<(), AssemblyError> {
        match set.layout {
            Layout::VolumeGroup(_) => {
                let name = aggregate_name(path)?;
                lvm::expand(&self.runner, &name, devices)
            }
            level => Err(AssemblyError::RaidExpansionUnsupported { level }),
        }
    }
}

fn device_args(devices: &[Utf8PathBuf]) -> impl Iterator<Item = String> + '_ {
    devices.iter().map(ToString::to_string)
}

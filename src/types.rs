//! Request vocabulary shared by the controller and node components.

use std::collections::BTreeMap;

/// Topology segment key carrying the placement zone.
pub const ZONE_TOPOLOGY_KEY: &str = "topology.volplane.io/zone";

/// How a workload consumes the volume.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum AccessType {
    /// Mounted file system.
    Mount {
        /// File system type; empty selects the node default.
        fs_type: String,
        /// Extra mount options.
        mount_flags: Vec<String>,
    },
    /// Raw block device.
    Block,
}

/// Who may access the volume at once.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum AccessMode {
    /// One node, read-write.
    SingleNodeWriter,
    /// One node, read-only.
    SingleNodeReaderOnly,
    /// Many nodes, read-only.
    MultiNodeReaderOnly,
    /// Many nodes, one writer.
    MultiNodeSingleWriter,
    /// Many nodes, many writers.
    MultiNodeMultiWriter,
}

impl AccessMode {
    /// Returns `true` when more than one node may write.
    #[must_use]
    pub const fn is_multi_writer(self) -> bool {
        matches!(self, Self::MultiNodeSingleWriter | Self::MultiNodeMultiWriter)
    }
}

/// Requested access for a volume.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct VolumeCapability {
    /// Block or mount access.
    pub access_type: AccessType,
    /// Sharing mode.
    pub access_mode: AccessMode,
}

impl VolumeCapability {
    /// Single-writer mount capability with the given file system.
    #[must_use]
    pub fn mount(fs_type: impl Into<String>) -> Self {
        Self {
            access_type: AccessType::Mount {
                fs_type: fs_type.into(),
                mount_flags: Vec::new(),
            },
            access_mode: AccessMode::SingleNodeWriter,
        }
    }
}

/// Requested capacity bounds in bytes. Zero means "unspecified".
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct CapacityRange {
    /// Minimum size.
    pub required_bytes: u64,
    /// Maximum size.
    pub limit_bytes: u64,
}

/// Placement segments keyed by topology key.
pub type Topology = BTreeMap<String, String>;

/// Placement constraints attached to a create request.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct TopologyRequirement {
    /// Segments the volume must be reachable from.
    pub requisite: Vec<Topology>,
    /// Segments to try first.
    pub preferred: Vec<Topology>,
}

/// Source to populate a new volume from.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum ContentSource {
    /// Restore from an existing snapshot.
    Snapshot {
        /// Snapshot identifier.
        id: String,
    },
}

/// Returns the zone segment of `topology`, if any.
#[must_use]
pub fn topology_zone(topology: &Topology) -> Option<&str> {
    topology
        .get(ZONE_TOPOLOGY_KEY)
        .map(String::as_str)
        .filter(|zone| !zone.is_empty())
}

/// Builds a topology with a single zone segment.
#[must_use]
pub fn zone_topology(zone: &str) -> Topology {
    BTreeMap::from([(ZONE_TOPOLOGY_KEY.to_owned(), zone.to_owned())])
}

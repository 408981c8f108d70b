//! Core CSI types: volumes, snapshots, capabilities, requests, and topology.
//!
//! These types form the data model shared by the CSI traits, transport layer,
//! and backend implementations.  They are all [`Serialize`]/[`Deserialize`] so
//! they can be transmitted over QUIC as JSON.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

// ---------------------------------------------------------------------------
// Identity
// ---------------------------------------------------------------------------

/// Opaque, unique identifier for a volume.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct VolumeId(pub String);

impl fmt::Display for VolumeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for VolumeId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for VolumeId {
    fn from(s: &str) -> Self {
        Self(s.to_owned())
    }
}

/// Opaque, unique identifier for a snapshot.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct SnapshotId(pub String);

impl fmt::Display for SnapshotId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for SnapshotId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for SnapshotId {
    fn from(s: &str) -> Self {
        Self(s.to_owned())
    }
}

// ---------------------------------------------------------------------------
// Access mode & capabilities
// ---------------------------------------------------------------------------

/// Describes how a volume may be accessed.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum AccessMode {
    /// Single-node read-write.
    ReadWriteOnce,
    /// Multi-node read-only.
    ReadOnlyMany,
    /// Multi-node read-write.
    ReadWriteMany,
}

/// How the workload consumes the volume.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum AccessType {
    /// A formatted filesystem mounted into the container.
    Mount {
        /// Filesystem type; empty selects the plugin default (`xfs`).
        #[serde(default)]
        fs_type: String,
        /// Additional mount flags (e.g. `"noatime"`).
        #[serde(default)]
        mount_flags: Vec<String>,
    },
    /// A raw block device exposed to the container.
    Block,
}

/// Describes the capabilities required from a volume.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VolumeCapability {
    /// Requested access mode.
    pub access_mode: AccessMode,
    /// Requested access type; `None` is rejected by validation.
    #[serde(default)]
    pub access_type: Option<AccessType>,
}

impl VolumeCapability {
    /// A filesystem capability with the given type.
    pub fn mount(fs_type: &str) -> Self {
        Self {
            access_mode: AccessMode::ReadWriteOnce,
            access_type: Some(AccessType::Mount {
                fs_type: fs_type.to_owned(),
                mount_flags: Vec::new(),
            }),
        }
    }

    /// A raw block capability.
    pub fn block() -> Self {
        Self {
            access_mode: AccessMode::ReadWriteOnce,
            access_type: Some(AccessType::Block),
        }
    }

    /// Returns `true` for a raw block capability.
    pub fn is_block(&self) -> bool {
        matches!(self.access_type, Some(AccessType::Block))
    }
}

impl Default for VolumeCapability {
    fn default() -> Self {
        Self::mount("")
    }
}

// ---------------------------------------------------------------------------
// Volume & snapshot metadata
// ---------------------------------------------------------------------------

/// Where a new volume's initial content comes from.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum VolumeContentSource {
    /// Restore from an existing snapshot.
    Snapshot(SnapshotId),
    /// Clone an existing volume.
    Volume(VolumeId),
}

/// Full metadata for a provisioned volume, as reported to callers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Volume {
    /// Unique volume identifier.
    pub volume_id: VolumeId,
    /// Provisioned capacity in bytes.
    pub capacity_bytes: u64,
    /// Opaque context passed from Controller to Node operations.
    #[serde(default)]
    pub volume_context: HashMap<String, String>,
    /// Content source the volume was populated from, if any.
    #[serde(default)]
    pub content_source: Option<VolumeContentSource>,
    /// Topology constraints (e.g. node affinity).
    #[serde(default)]
    pub accessible_topology: Vec<Topology>,
}

/// Metadata for a point-in-time snapshot, as reported to callers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Snapshot {
    /// Unique snapshot identifier.
    pub snapshot_id: SnapshotId,
    /// Volume the snapshot was taken from.
    pub source_volume_id: VolumeId,
    /// When the snapshot was cut.
    pub creation_time: DateTime<Utc>,
    /// Size of the snapshot file in bytes.
    pub size_bytes: u64,
    /// `true` once the backing file has been observed on disk.
    pub ready_to_use: bool,
}

/// Topology constraint expressed as key-value segments.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Topology {
    /// Topology segments, e.g. `{"topology.arstor.csi/node": "node-01"}`.
    #[serde(default)]
    pub segments: HashMap<String, String>,
}

// ---------------------------------------------------------------------------
// Requests & responses
// ---------------------------------------------------------------------------

/// Request to create a new volume.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CreateVolumeRequest {
    /// Human-readable name for the volume.
    pub name: String,
    /// Desired capacity in bytes.
    pub capacity_bytes: u64,
    /// Required capabilities.
    #[serde(default)]
    pub volume_capabilities: Vec<VolumeCapability>,
    /// Storage-class parameters (`pageSize`, `compression`, ...).
    #[serde(default)]
    pub parameters: HashMap<String, String>,
    /// Optional snapshot or volume to populate from.
    #[serde(default)]
    pub content_source: Option<VolumeContentSource>,
}

/// Request to cut a snapshot of a volume.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CreateSnapshotRequest {
    /// Human-readable snapshot name.
    pub name: String,
    /// Volume to snapshot.
    pub source_volume_id: String,
    /// Snapshot-class parameters.
    #[serde(default)]
    pub parameters: HashMap<String, String>,
}

/// Filters for `ListSnapshots`; both unset lists everything.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ListSnapshotsRequest {
    #[serde(default)]
    pub snapshot_id: Option<SnapshotId>,
    #[serde(default)]
    pub source_volume_id: Option<VolumeId>,
}

/// Request to make a volume available to a node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControllerPublishVolumeRequest {
    pub volume_id: VolumeId,
    pub node_id: String,
    pub volume_capability: Option<VolumeCapability>,
    #[serde(default)]
    pub read_only: bool,
}

/// Request to grow a volume.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExpandVolumeRequest {
    /// Volume to grow.
    pub volume_id: VolumeId,
    /// New capacity in bytes; `None` is rejected.
    pub capacity_bytes: Option<u64>,
}

/// Result of a controller-side expansion.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ExpandVolumeResponse {
    /// Capacity after the expansion.
    pub capacity_bytes: u64,
    /// Whether the node must grow the filesystem afterwards.
    pub node_expansion_required: bool,
}

/// Request to stage (globally mount) a volume on a node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeStageVolumeRequest {
    /// Volume to stage.
    pub volume_id: VolumeId,
    /// Global staging mount point.
    pub staging_target_path: String,
    /// Requested capability.
    pub volume_capability: Option<VolumeCapability>,
    /// Opaque context carried from `CreateVolume`.
    #[serde(default)]
    pub volume_context: HashMap<String, String>,
}

/// Request to publish a staged volume into a Pod container.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodePublishVolumeRequest {
    /// Volume to publish.
    pub volume_id: VolumeId,
    /// The global staging mount point (source of the bind mount).
    #[serde(default)]
    pub staging_target_path: String,
    /// Target path inside the container.
    pub target_path: String,
    /// Requested capability.
    pub volume_capability: Option<VolumeCapability>,
    /// Whether the mount should be read-only.
    #[serde(default)]
    pub read_only: bool,
    /// Opaque context; carries the ephemeral marker for inline volumes.
    #[serde(default)]
    pub volume_context: HashMap<String, String>,
}

/// Request to grow the filesystem of a published volume.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeExpandVolumeRequest {
    /// Volume to grow.
    pub volume_id: VolumeId,
    /// Path the volume is mounted at.
    pub volume_path: String,
}

// ---------------------------------------------------------------------------
// Plugin & node info
// ---------------------------------------------------------------------------

/// Information about the CSI plugin.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PluginInfo {
    /// Plugin name, e.g. `"rk8s.arstor.csi"`.
    pub name: String,
    /// Vendor-provided version string.
    pub vendor_version: String,
}

/// Capabilities advertised by the CSI plugin.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum PluginCapability {
    /// Plugin provides a Controller service.
    ControllerService,
    /// Plugin supports volume topology constraints.
    VolumeAccessibilityConstraints,
}

/// RPCs offered by the Controller service.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum ControllerCapability {
    CreateDeleteVolume,
    CreateDeleteSnapshot,
    ListSnapshots,
    ListVolumes,
    CloneVolume,
    ExpandVolume,
}

/// RPCs offered by the Node service.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum NodeCapability {
    StageUnstageVolume,
    ExpandVolume,
}

/// Information about the node on which the CSI Node service runs.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct NodeInfo {
    /// Unique node identifier.
    pub node_id: String,
    /// Maximum number of volumes the node can host (0 = unlimited).
    pub max_volumes: u64,
    /// Optional topology of this node.
    #[serde(default)]
    pub accessible_topology: Option<Topology>,
}

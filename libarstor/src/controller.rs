//! CSI Controller service trait.
//!
//! The Controller service owns the volume and snapshot lifecycle on the
//! array: provisioning, cloning, restoring, expanding and deleting files,
//! plus the capacity and capability queries the orchestrator schedules on.

use std::collections::HashMap;

use async_trait::async_trait;

use crate::error::CsiError;
use crate::types::{
    ControllerCapability, ControllerPublishVolumeRequest, CreateSnapshotRequest,
    CreateVolumeRequest, ExpandVolumeRequest, ExpandVolumeResponse, ListSnapshotsRequest,
    Snapshot, SnapshotId, Volume, VolumeCapability, VolumeId,
};

/// Controller service: centralized volume and snapshot management.
#[async_trait]
pub trait CsiController: Send + Sync {
    /// Provision a new volume, optionally populated from a snapshot or
    /// another volume.
    ///
    /// A request naming an existing volume returns it when it is at least
    /// as large as requested and fails with [`CsiError::AlreadyExists`]
    /// otherwise.
    async fn create_volume(&self, req: CreateVolumeRequest) -> Result<Volume, CsiError>;

    /// Delete a volume.  Unknown volumes succeed.
    async fn delete_volume(&self, volume_id: &VolumeId) -> Result<(), CsiError>;

    /// Make a volume available to a node; returns the publish context.
    async fn controller_publish_volume(
        &self,
        req: ControllerPublishVolumeRequest,
    ) -> Result<HashMap<String, String>, CsiError>;

    async fn controller_unpublish_volume(
        &self,
        volume_id: &VolumeId,
        node_id: &str,
    ) -> Result<(), CsiError>;

    /// Check whether the given capabilities are compatible with the volume.
    async fn validate_volume_capabilities(
        &self,
        volume_id: &VolumeId,
        capabilities: &[VolumeCapability],
    ) -> Result<bool, CsiError>;

    async fn list_volumes(&self) -> Result<Vec<Volume>, CsiError>;

    /// Free bytes on the array mount.
    async fn get_capacity(&self) -> Result<u64, CsiError>;

    async fn get_capabilities(&self) -> Result<Vec<ControllerCapability>, CsiError>;

    /// Cut a snapshot.  A snapshot with the same name is returned as is.
    async fn create_snapshot(&self, req: CreateSnapshotRequest) -> Result<Snapshot, CsiError>;

    /// Delete a snapshot.  Unknown snapshots succeed.
    async fn delete_snapshot(&self, snapshot_id: &SnapshotId) -> Result<(), CsiError>;

    async fn list_snapshots(&self, req: ListSnapshotsRequest) -> Result<Vec<Snapshot>, CsiError>;

    /// Grow a volume file.  The node grows the filesystem afterwards.
    async fn expand_volume(&self, req: ExpandVolumeRequest)
    -> Result<ExpandVolumeResponse, CsiError>;
}

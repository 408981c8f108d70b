//! CSI Node service trait.
//!
//! The Node service runs on each worker and turns an array file into
//! something a Pod can use:
//!
//! 1. **Stage**: attach a loop device and mount its filesystem at a global
//!    staging path (filesystem volumes only).
//! 2. **Publish**: bind-mount the staging path, or the loop device itself
//!    for block volumes, into the Pod's target path.
//! 3. **Unpublish**: remove the bind mount.
//! 4. **Unstage**: unmount the staging path and detach the loop device.

use async_trait::async_trait;

use crate::error::CsiError;
use crate::types::{
    NodeCapability, NodeExpandVolumeRequest, NodeInfo, NodePublishVolumeRequest,
    NodeStageVolumeRequest, VolumeId,
};

/// Node service: loop devices and local mounts.
#[async_trait]
pub trait CsiNode: Send + Sync {
    /// Stage a volume at its global staging path.
    ///
    /// This is idempotent: staging an already-staged volume succeeds.
    async fn stage_volume(&self, req: NodeStageVolumeRequest) -> Result<(), CsiError>;

    /// Unstage a volume and release its loop device.
    ///
    /// This is idempotent: unstaging an already-unstaged volume succeeds.
    async fn unstage_volume(
        &self,
        volume_id: &VolumeId,
        staging_target_path: &str,
    ) -> Result<(), CsiError>;

    /// Publish a volume into the container path.  Inline ephemeral volumes
    /// are created here.
    ///
    /// This is idempotent for the same `target_path`.
    async fn publish_volume(&self, req: NodePublishVolumeRequest) -> Result<(), CsiError>;

    /// Unpublish a volume; inline ephemeral volumes are deleted here.
    ///
    /// This is idempotent.
    async fn unpublish_volume(
        &self,
        volume_id: &VolumeId,
        target_path: &str,
    ) -> Result<(), CsiError>;

    /// Grow the filesystem of a mounted volume after a controller expand.
    async fn node_expand_volume(&self, req: NodeExpandVolumeRequest) -> Result<(), CsiError>;

    /// Return information about the node on which this service is running.
    async fn get_info(&self) -> Result<NodeInfo, CsiError>;

    async fn node_get_capabilities(&self) -> Result<Vec<NodeCapability>, CsiError>;
}

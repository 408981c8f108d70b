//! ArStor storage backend for CSI.
//!
//! [`ArStorBackend`] implements [`CsiIdentity`], [`CsiController`], and
//! [`CsiNode`] on top of three collaborators:
//!
//! * [`VolumeEngine`]: volume and snapshot files on the array share,
//! * [`LoopDeviceManager`]: loop device bindings of those files,
//! * [`Mounter`]: formatting and mounting on this node.
//!
//! # Node flow
//!
//! ```text
//! filesystem:  file -> /dev/loopN -> mkfs + mount at staging -> bind to target
//! block:       file -> /dev/loopN ----------------------------> bind to target file
//! ephemeral:   create 1 GiB file -> /dev/loopN -> mkfs + mount at target
//! ```

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::config::ArStorConfig;
use crate::controller::CsiController;
use crate::engine::{VolumeEngine, VolumeSpec};
use crate::error::CsiError;
use crate::identity::CsiIdentity;
use crate::loopdev::{LoopDeviceManager, loop_device_of};
use crate::mounter::{DEFAULT_FS_TYPE, Mounter, PARTITIONED, is_mountpoint, remove_target};
use crate::node::CsiNode;
use crate::tool::CreateOptions;
use crate::types::*;

pub const TOPOLOGY_KEY_NODE: &str = "topology.arstor.csi/node";
pub const TOPOLOGY_KEY_ENABLED: &str = "topology.arstor.csi/arstorenabled";

/// Ordinary volumes must be smaller than this.
pub const MAX_VOLUME_BYTES: u64 = 1 << 40;
/// Size of inline ephemeral volumes.
pub const EPHEMERAL_SIZE: u64 = 1 << 30;
/// Size of a new empty volume whose request names no capacity.
pub const DEFAULT_VOLUME_BYTES: u64 = 1 << 30;
pub const EPHEMERAL_PREFIX: &str = "ephemeral-";
/// Volume context key the orchestrator sets on inline volumes.
pub const EPHEMERAL_CONTEXT_KEY: &str = "csi.storage.k8s.io/ephemeral";
/// Publish context key carrying the backing file.
pub const DEVICE_PATH_KEY: &str = "DevicePath";

pub struct ArStorBackend {
    engine: Arc<VolumeEngine>,
    loops: Arc<LoopDeviceManager>,
    mounter: Mounter,
    driver_name: String,
    node_id: String,
    /// Treat publishes without the ephemeral context key as inline volumes.
    ephemeral: bool,
    max_volumes: u64,
}

impl ArStorBackend {
    pub fn new(
        engine: Arc<VolumeEngine>,
        loops: Arc<LoopDeviceManager>,
        mounter: Mounter,
        config: &ArStorConfig,
    ) -> Self {
        Self {
            engine,
            loops,
            mounter,
            driver_name: config.driver_name.clone(),
            node_id: config.node_id.clone(),
            ephemeral: config.ephemeral,
            max_volumes: config.max_volumes_per_node,
        }
    }

    pub fn engine(&self) -> &Arc<VolumeEngine> {
        &self.engine
    }

    fn topology(&self) -> Topology {
        Topology {
            segments: HashMap::from([
                (TOPOLOGY_KEY_NODE.to_owned(), self.node_id.clone()),
                (TOPOLOGY_KEY_ENABLED.to_owned(), "true".to_owned()),
            ]),
        }
    }

    fn is_ephemeral(&self, context: &HashMap<String, String>) -> bool {
        match context.get(EPHEMERAL_CONTEXT_KEY).map(String::as_str) {
            Some("true") => true,
            Some("") | None => self.ephemeral,
            Some(_) => false,
        }
    }

    /// Backing file of a volume that is ready to be attached.
    async fn ready_volume_file(&self, volume_id: &VolumeId) -> Result<PathBuf, CsiError> {
        self.engine.find_volume(volume_id).await?;
        self.engine.wait_volume_ready(volume_id).await?;
        self.engine
            .volume_file(volume_id)
            .await
            .ok_or_else(|| CsiError::VolumeNotFound(volume_id.to_string()))
    }

    /// Create, attach and mount an inline volume at `target`.  Every step
    /// done so far is undone when a later one fails.
    async fn publish_ephemeral(&self, req: &NodePublishVolumeRequest) -> Result<(), CsiError> {
        let access_type = req
            .volume_capability
            .as_ref()
            .and_then(|c| c.access_type.as_ref());
        let mount_flags = match access_type {
            Some(AccessType::Mount { mount_flags, .. }) => mount_flags.clone(),
            Some(AccessType::Block) => {
                return Err(CsiError::InvalidArgument(
                    "ephemeral volumes must use a mount capability".into(),
                ));
            }
            None => Vec::new(),
        };
        let fs_type = capability_fs_type(req.volume_capability.as_ref());
        let options = CreateOptions::from_parameters(&req.volume_context)?;

        let spec = VolumeSpec {
            id: req.volume_id.clone(),
            name: format!("{EPHEMERAL_PREFIX}{}", req.volume_id),
            size_bytes: EPHEMERAL_SIZE,
            access_type: Some(AccessType::Mount {
                fs_type: fs_type.clone(),
                mount_flags: mount_flags.clone(),
            }),
            options,
        };
        let entry = self.engine.create_volume(spec).await?;
        let file = self.engine.local_path(&entry.path);

        let device = match self.loops.attach(&file).await {
            Ok(device) => device,
            Err(e) => {
                self.discard_ephemeral(&req.volume_id, None).await;
                return Err(e);
            }
        };
        if let Err(e) = self
            .mounter
            .format_and_mount(&device, &req.target_path, &fs_type, &mount_flags)
            .await
        {
            if let Err(err) = remove_target(Path::new(&req.target_path)).await {
                warn!(target = %req.target_path, error = %err, "failed to remove ephemeral target");
            }
            self.discard_ephemeral(&req.volume_id, Some(&device)).await;
            return Err(e);
        }
        info!(%device, target = %req.target_path, "ephemeral volume published");
        Ok(())
    }

    async fn discard_ephemeral(&self, volume_id: &VolumeId, device: Option<&str>) {
        if let Some(device) = device
            && let Err(e) = self.loops.detach(device).await
        {
            warn!(%device, error = %e, "failed to detach ephemeral loop device");
        }
        if let Err(e) = self.engine.delete_volume(volume_id).await {
            warn!(%volume_id, error = %e, "failed to delete ephemeral volume");
        }
    }

    async fn publish_block(&self, req: &NodePublishVolumeRequest) -> Result<(), CsiError> {
        let file = self.ready_volume_file(&req.volume_id).await?;
        let device = self.loops.attach(&file).await?;

        let target = Path::new(&req.target_path);
        let mount_failed = |reason: String| CsiError::MountFailed {
            path: req.target_path.clone(),
            reason,
        };
        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| mount_failed(e.to_string()))?;
        }
        tokio::fs::OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(false)
            .open(target)
            .await
            .map_err(|e| mount_failed(e.to_string()))?;

        self.mounter
            .bind_mount(&device, &req.target_path, req.read_only)?;
        info!(%device, target = %req.target_path, "block volume published");
        Ok(())
    }

    async fn publish_mount(&self, req: &NodePublishVolumeRequest) -> Result<(), CsiError> {
        if req.staging_target_path.is_empty() {
            return Err(CsiError::InvalidArgument("staging target path missing".into()));
        }
        tokio::fs::create_dir_all(&req.target_path)
            .await
            .map_err(|e| CsiError::MountFailed {
                path: req.target_path.clone(),
                reason: e.to_string(),
            })?;
        self.mounter
            .bind_mount(&req.staging_target_path, &req.target_path, req.read_only)?;
        info!(
            target = %req.target_path,
            read_only = req.read_only,
            "volume published (bind-mount)",
        );
        Ok(())
    }

    /// Release the loop device of a volume that is being unstaged.
    /// Device that carries the filesystem of `device`: the device itself,
    /// or the mapper of its first partition when it holds a partition table.
    async fn filesystem_device(&self, device: &str) -> Result<String, CsiError> {
        if self.mounter.disk_format(device).await? == PARTITIONED {
            return self.loops.partitioned_mapper(device).await;
        }
        Ok(device.to_owned())
    }

    async fn release_device(&self, volume_id: &VolumeId) -> Result<(), CsiError> {
        match self.engine.find_volume(volume_id).await {
            Ok(_) => {
                let Some(file) = self.engine.volume_file(volume_id).await else {
                    return Ok(());
                };
                let devices = self.loops.devices_for_file(&file).await?;
                if devices.len() > 1 {
                    return Err(CsiError::Internal(format!(
                        "{} is bound to multiple loop devices: {}",
                        file.display(),
                        devices.join(", ")
                    )));
                }
                for device in devices {
                    self.loops.release_mappings(&device).await?;
                    self.loops.detach(&device).await?;
                }
                Ok(())
            }
            Err(e) if e.is_not_found() => {
                self.loops.detach_by_volume_id(&volume_id.0).await
            }
            Err(e) => Err(e),
        }
    }
}

/// Filesystem requested by a capability, falling back to the default.
fn capability_fs_type(capability: Option<&VolumeCapability>) -> String {
    match capability.and_then(|c| c.access_type.as_ref()) {
        Some(AccessType::Mount { fs_type, .. }) if !fs_type.is_empty() => fs_type.clone(),
        _ => DEFAULT_FS_TYPE.to_owned(),
    }
}

fn validate_create(req: &CreateVolumeRequest) -> Result<(), CsiError> {
    if req.name.is_empty() {
        return Err(CsiError::InvalidArgument("volume name missing".into()));
    }
    if req.volume_capabilities.is_empty() {
        return Err(CsiError::InvalidArgument("volume capabilities missing".into()));
    }
    let mut block = false;
    let mut mount = false;
    for cap in &req.volume_capabilities {
        match cap.access_type {
            Some(AccessType::Block) => block = true,
            Some(AccessType::Mount { .. }) => mount = true,
            None => {
                return Err(CsiError::InvalidArgument(
                    "volume capability needs a mount or block access type".into(),
                ));
            }
        }
    }
    if block && mount {
        return Err(CsiError::InvalidArgument(
            "cannot have both block and mount access type".into(),
        ));
    }
    if req.capacity_bytes >= MAX_VOLUME_BYTES {
        return Err(CsiError::ResourceExhausted(format!(
            "requested {} bytes, volumes must be smaller than {MAX_VOLUME_BYTES}",
            req.capacity_bytes
        )));
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// CsiIdentity
// ---------------------------------------------------------------------------

#[async_trait]
impl CsiIdentity for ArStorBackend {
    async fn get_plugin_info(&self) -> Result<PluginInfo, CsiError> {
        Ok(PluginInfo {
            name: self.driver_name.clone(),
            vendor_version: env!("CARGO_PKG_VERSION").to_owned(),
        })
    }

    async fn probe(&self) -> Result<bool, CsiError> {
        let exists = tokio::fs::metadata(self.engine.mount_path())
            .await
            .map(|m| m.is_dir())
            .unwrap_or(false);
        Ok(exists)
    }

    async fn get_plugin_capabilities(&self) -> Result<Vec<PluginCapability>, CsiError> {
        Ok(vec![
            PluginCapability::ControllerService,
            PluginCapability::VolumeAccessibilityConstraints,
        ])
    }
}

// ---------------------------------------------------------------------------
// CsiController
// ---------------------------------------------------------------------------

#[async_trait]
impl CsiController for ArStorBackend {
    #[instrument(skip(self, req), fields(name = %req.name))]
    async fn create_volume(&self, req: CreateVolumeRequest) -> Result<Volume, CsiError> {
        validate_create(&req)?;
        let options = CreateOptions::from_parameters(&req.parameters)?;
        // Restores and clones without a capacity keep the size of their source.
        let size_bytes = match (&req.content_source, req.capacity_bytes) {
            (None, 0) => DEFAULT_VOLUME_BYTES,
            (_, size) => size,
        };
        let spec = VolumeSpec {
            id: VolumeId(Uuid::new_v4().to_string()),
            name: req.name.clone(),
            size_bytes,
            access_type: req
                .volume_capabilities
                .iter()
                .find_map(|c| c.access_type.clone()),
            options,
        };

        let entry = match &req.content_source {
            None => self.engine.create_volume(spec).await?,
            Some(VolumeContentSource::Snapshot(snapshot_id)) => {
                self.engine.restore_snapshot(snapshot_id, spec).await?
            }
            Some(VolumeContentSource::Volume(source)) => {
                self.engine.clone_volume(source, spec).await?
            }
        };

        let mut volume = entry.to_volume();
        volume.volume_context = req.parameters;
        volume.content_source = req.content_source;
        volume.accessible_topology = vec![self.topology()];
        info!(volume_id = %volume.volume_id, "volume created");
        Ok(volume)
    }

    #[instrument(skip(self))]
    async fn delete_volume(&self, volume_id: &VolumeId) -> Result<(), CsiError> {
        if let Some(file) = self.engine.volume_file(volume_id).await {
            let devices = self.loops.devices_for_file(&file).await?;
            if !devices.is_empty() {
                return Err(CsiError::Conflict(format!(
                    "volume {volume_id} is still attached to {}",
                    devices.join(", ")
                )));
            }
        }
        self.engine.delete_volume(volume_id).await
    }

    #[instrument(skip(self, req), fields(volume_id = %req.volume_id, node_id = %req.node_id))]
    async fn controller_publish_volume(
        &self,
        req: ControllerPublishVolumeRequest,
    ) -> Result<HashMap<String, String>, CsiError> {
        let file = self.ready_volume_file(&req.volume_id).await?;
        Ok(HashMap::from([(
            DEVICE_PATH_KEY.to_owned(),
            file.to_string_lossy().into_owned(),
        )]))
    }

    async fn controller_unpublish_volume(
        &self,
        volume_id: &VolumeId,
        node_id: &str,
    ) -> Result<(), CsiError> {
        debug!(%volume_id, %node_id, "controller unpublish is a no-op");
        Ok(())
    }

    async fn validate_volume_capabilities(
        &self,
        volume_id: &VolumeId,
        capabilities: &[VolumeCapability],
    ) -> Result<bool, CsiError> {
        self.engine.find_volume(volume_id).await?;
        if capabilities.iter().any(|c| c.access_type.is_none()) {
            return Err(CsiError::InvalidArgument(
                "volume capability needs a mount or block access type".into(),
            ));
        }
        Ok(true)
    }

    async fn list_volumes(&self) -> Result<Vec<Volume>, CsiError> {
        Ok(self
            .engine
            .list_volumes()
            .await
            .iter()
            .map(|v| v.to_volume())
            .collect())
    }

    async fn get_capacity(&self) -> Result<u64, CsiError> {
        let stat = nix::sys::statvfs::statvfs(self.engine.mount_path())
            .map_err(|e| CsiError::Internal(format!("statvfs: {e}")))?;
        Ok(stat.fragment_size() * stat.blocks_available())
    }

    async fn get_capabilities(&self) -> Result<Vec<ControllerCapability>, CsiError> {
        Ok(vec![
            ControllerCapability::CreateDeleteVolume,
            ControllerCapability::CreateDeleteSnapshot,
            ControllerCapability::ListSnapshots,
            ControllerCapability::ListVolumes,
            ControllerCapability::CloneVolume,
            ControllerCapability::ExpandVolume,
        ])
    }

    #[instrument(skip(self, req), fields(name = %req.name, source = %req.source_volume_id))]
    async fn create_snapshot(&self, req: CreateSnapshotRequest) -> Result<Snapshot, CsiError> {
        if req.name.is_empty() {
            return Err(CsiError::InvalidArgument("snapshot name missing".into()));
        }
        if req.source_volume_id.is_empty() {
            return Err(CsiError::InvalidArgument("source volume id missing".into()));
        }
        let source = VolumeId(req.source_volume_id);
        self.engine.find_volume(&source).await?;
        let entry = self
            .engine
            .create_snapshot(&source, SnapshotId(Uuid::new_v4().to_string()), &req.name)
            .await?;
        Ok(entry.to_snapshot())
    }

    #[instrument(skip(self))]
    async fn delete_snapshot(&self, snapshot_id: &SnapshotId) -> Result<(), CsiError> {
        self.engine.delete_snapshot(snapshot_id).await
    }

    async fn list_snapshots(&self, req: ListSnapshotsRequest) -> Result<Vec<Snapshot>, CsiError> {
        let snapshots = self.engine.list_snapshots().await;
        Ok(snapshots
            .iter()
            .filter(|s| req.snapshot_id.as_ref().is_none_or(|id| s.id == *id))
            .filter(|s| {
                req.source_volume_id
                    .as_ref()
                    .is_none_or(|id| s.volume_id == *id)
            })
            .map(|s| s.to_snapshot())
            .collect())
    }

    #[instrument(skip(self, req), fields(volume_id = %req.volume_id))]
    async fn expand_volume(
        &self,
        req: ExpandVolumeRequest,
    ) -> Result<ExpandVolumeResponse, CsiError> {
        let Some(capacity) = req.capacity_bytes else {
            return Err(CsiError::InvalidArgument("capacity range missing".into()));
        };
        if capacity >= MAX_VOLUME_BYTES {
            return Err(CsiError::ResourceExhausted(format!(
                "requested {capacity} bytes, volumes must be smaller than {MAX_VOLUME_BYTES}"
            )));
        }
        self.engine.find_volume(&req.volume_id).await?;
        let entry = self.engine.expand_volume(&req.volume_id, capacity).await?;
        Ok(ExpandVolumeResponse {
            capacity_bytes: entry.size_bytes,
            node_expansion_required: true,
        })
    }
}

// ---------------------------------------------------------------------------
// CsiNode
// ---------------------------------------------------------------------------

#[async_trait]
impl CsiNode for ArStorBackend {
    #[instrument(skip(self, req), fields(volume_id = %req.volume_id))]
    async fn stage_volume(&self, req: NodeStageVolumeRequest) -> Result<(), CsiError> {
        if req.staging_target_path.is_empty() {
            return Err(CsiError::InvalidArgument("staging target path missing".into()));
        }
        let capability = req
            .volume_capability
            .as_ref()
            .ok_or_else(|| CsiError::InvalidArgument("volume capability missing".into()))?;
        let file = self.ready_volume_file(&req.volume_id).await?;

        let mount_flags = match &capability.access_type {
            Some(AccessType::Block) => {
                debug!("block volume, nothing to stage");
                return Ok(());
            }
            Some(AccessType::Mount { mount_flags, .. }) => mount_flags.clone(),
            None => {
                return Err(CsiError::InvalidArgument(
                    "volume capability needs a mount or block access type".into(),
                ));
            }
        };

        if is_mountpoint(&req.staging_target_path).await {
            debug!(path = %req.staging_target_path, "staging path already mounted");
            return Ok(());
        }

        let fs_type = capability_fs_type(Some(capability));
        let device = self.loops.attach(&file).await?;
        let staged = match self.filesystem_device(&device).await {
            Ok(fs_device) => {
                self.mounter
                    .format_and_mount(&fs_device, &req.staging_target_path, &fs_type, &mount_flags)
                    .await
            }
            Err(e) => Err(e),
        };
        if let Err(e) = staged {
            if let Err(err) = remove_target(Path::new(&req.staging_target_path)).await {
                warn!(path = %req.staging_target_path, error = %err, "failed to remove staging path");
            }
            return Err(e);
        }
        info!(%device, path = %req.staging_target_path, "volume staged");
        Ok(())
    }

    #[instrument(skip(self))]
    async fn unstage_volume(
        &self,
        volume_id: &VolumeId,
        staging_target_path: &str,
    ) -> Result<(), CsiError> {
        if staging_target_path.is_empty() {
            return Err(CsiError::InvalidArgument("staging target path missing".into()));
        }
        self.mounter.unmount_and_remove(staging_target_path).await?;
        self.release_device(volume_id).await?;
        info!(path = staging_target_path, "volume unstaged");
        Ok(())
    }

    #[instrument(skip(self, req), fields(volume_id = %req.volume_id))]
    async fn publish_volume(&self, req: NodePublishVolumeRequest) -> Result<(), CsiError> {
        if req.target_path.is_empty() {
            return Err(CsiError::InvalidArgument("target path missing".into()));
        }
        if is_mountpoint(&req.target_path).await {
            debug!(target_path = %req.target_path, "target already mounted, assuming idempotent retry");
            return Ok(());
        }

        if self.is_ephemeral(&req.volume_context) {
            return self.publish_ephemeral(&req).await;
        }
        let capability = req
            .volume_capability
            .as_ref()
            .ok_or_else(|| CsiError::InvalidArgument("volume capability missing".into()))?;
        match capability.access_type {
            Some(AccessType::Block) => self.publish_block(&req).await,
            Some(AccessType::Mount { .. }) => self.publish_mount(&req).await,
            None => Err(CsiError::InvalidArgument(
                "volume capability needs a mount or block access type".into(),
            )),
        }
    }

    #[instrument(skip(self))]
    async fn unpublish_volume(
        &self,
        volume_id: &VolumeId,
        target_path: &str,
    ) -> Result<(), CsiError> {
        if target_path.is_empty() {
            return Err(CsiError::InvalidArgument("target path missing".into()));
        }
        self.mounter.unmount_and_remove(target_path).await?;

        let ephemeral = self
            .engine
            .volume(volume_id)
            .await
            .is_some_and(|v| v.name.starts_with(EPHEMERAL_PREFIX));
        if ephemeral {
            if let Some(file) = self.engine.volume_file(volume_id).await {
                self.loops.detach_by_backing_file(&file).await?;
            }
            self.engine.delete_volume(volume_id).await?;
            info!("ephemeral volume deleted");
        }
        info!(%target_path, "volume unpublished");
        Ok(())
    }

    #[instrument(skip(self, req), fields(volume_id = %req.volume_id))]
    async fn node_expand_volume(&self, req: NodeExpandVolumeRequest) -> Result<(), CsiError> {
        if req.volume_path.is_empty() {
            return Err(CsiError::InvalidArgument("volume path missing".into()));
        }
        let device = self
            .loops
            .device_for_mount_point(&req.volume_path)
            .await?
            .ok_or_else(|| {
                CsiError::Internal(format!("no device mounted at {}", req.volume_path))
            })?;
        self.loops.refresh_capacity(&loop_device_of(&device)).await?;
        if !self.mounter.resize(&device, &req.volume_path).await? {
            debug!(%device, "device carries no filesystem, nothing to grow");
        }
        Ok(())
    }

    async fn get_info(&self) -> Result<NodeInfo, CsiError> {
        Ok(NodeInfo {
            node_id: self.node_id.clone(),
            max_volumes: self.max_volumes,
            accessible_topology: Some(self.topology()),
        })
    }

    async fn node_get_capabilities(&self) -> Result<Vec<NodeCapability>, CsiError> {
        Ok(vec![
            NodeCapability::StageUnstageVolume,
            NodeCapability::ExpandVolume,
        ])
    }
}

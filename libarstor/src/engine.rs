//! Volume and snapshot lifecycle on the array.
//!
//! [`VolumeEngine`] owns the [`Catalog`] and the [`DirectoryAllocator`] and
//! drives the [`StorageTool`] through every multi-step operation:
//!
//! ```text
//! allocate shard -> insert placeholder -> invoke tool -> record path
//!                        |                    |
//!                        |          "no space" (code 7)
//!                        |                    v
//!                        |       discard partial file, mark shard full,
//!                        |       reallocate, invoke once more
//!                        |       (full again: ResourceExhausted)
//!                        v
//!               any failure: discard partial file, drop placeholder
//! ```
//!
//! Both structures sit behind one `RwLock`; the write guard is held from the
//! first catalog check until the entry is final, so concurrent requests never
//! observe a half-built entity.

use chrono::Utc;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::allocator::{DirectoryAllocator, ShardDir, ShardKind, join_relative, path_inode};
use crate::backoff::Backoff;
use crate::catalog::{
    CLONE_SNAPSHOT_PREFIX, Catalog, ScanReport, SnapshotEntry, VolumeEntry, check_file_name,
};
use crate::error::CsiError;
use crate::tool::{CreateOptions, StorageTool};
use crate::types::{AccessType, SnapshotId, VolumeId};

/// Everything needed to materialize a new volume file.
#[derive(Debug, Clone)]
pub struct VolumeSpec {
    pub id: VolumeId,
    pub name: String,
    pub size_bytes: u64,
    /// Must be set for a fresh volume; restores and clones inherit content.
    pub access_type: Option<AccessType>,
    pub options: CreateOptions,
}

struct State {
    catalog: Catalog,
    allocator: DirectoryAllocator,
}

pub struct VolumeEngine {
    mount_path: PathBuf,
    tool: Arc<dyn StorageTool>,
    backoff: Backoff,
    state: RwLock<State>,
}

impl VolumeEngine {
    /// `mount_path` is the local mount of the array share; all catalog paths
    /// are relative to it.
    pub fn new(mount_path: impl Into<PathBuf>, tool: Arc<dyn StorageTool>, backoff: Backoff) -> Self {
        Self {
            mount_path: mount_path.into(),
            tool,
            backoff,
            state: RwLock::new(State {
                catalog: Catalog::new(),
                allocator: DirectoryAllocator::new(),
            }),
        }
    }

    pub fn mount_path(&self) -> &Path {
        &self.mount_path
    }

    pub fn tool(&self) -> &Arc<dyn StorageTool> {
        &self.tool
    }

    /// Absolute path of a mount-relative catalog path.
    pub fn local_path(&self, relative: &str) -> PathBuf {
        join_relative(&self.mount_path, relative)
    }

    /// Scan the namespace and add every entity not yet in the catalog.
    /// Used at startup and when a node request names an unknown volume.
    #[instrument(skip(self), fields(mount = %self.mount_path.display()))]
    pub async fn scan(&self) -> Result<ScanReport, CsiError> {
        let mut state = self.state.write().await;
        state.catalog.scan(&self.mount_path, self.tool.as_ref()).await
    }

    // -- lookups ------------------------------------------------------------

    pub async fn volume(&self, id: &VolumeId) -> Option<VolumeEntry> {
        self.state.read().await.catalog.volume(id).cloned()
    }

    pub async fn volume_by_name(&self, name: &str) -> Option<VolumeEntry> {
        self.state.read().await.catalog.volume_by_name(name).cloned()
    }

    pub async fn snapshot(&self, id: &SnapshotId) -> Option<SnapshotEntry> {
        self.state.read().await.catalog.snapshot(id).cloned()
    }

    pub async fn list_volumes(&self) -> Vec<VolumeEntry> {
        let state = self.state.read().await;
        state.catalog.volumes().into_iter().cloned().collect()
    }

    pub async fn list_snapshots(&self) -> Vec<SnapshotEntry> {
        let state = self.state.read().await;
        state.catalog.snapshots().into_iter().cloned().collect()
    }

    /// Local backing file of a materialized volume.
    pub async fn volume_file(&self, id: &VolumeId) -> Option<PathBuf> {
        let state = self.state.read().await;
        state
            .catalog
            .volume(id)
            .filter(|v| v.is_materialized())
            .map(|v| self.local_path(&v.path))
    }

    /// Look a volume up, rescanning the namespace once on a miss.
    pub async fn find_volume(&self, id: &VolumeId) -> Result<VolumeEntry, CsiError> {
        if let Some(v) = self.volume(id).await {
            return Ok(v);
        }
        debug!(volume_id = %id, "volume not in catalog, rescanning");
        self.scan().await?;
        self.volume(id)
            .await
            .ok_or_else(|| CsiError::VolumeNotFound(id.to_string()))
    }

    // -- volumes ------------------------------------------------------------

    /// Create an empty volume file of `spec.size_bytes`.
    #[instrument(skip(self, spec), fields(volume_id = %spec.id, name = %spec.name))]
    pub async fn create_volume(&self, spec: VolumeSpec) -> Result<VolumeEntry, CsiError> {
        if spec.access_type.is_none() {
            return Err(CsiError::InvalidArgument(
                "volume needs a mount or block access type".into(),
            ));
        }
        // A zero-length file reads as a failed creation on the next scan.
        if spec.size_bytes == 0 {
            return Err(CsiError::InvalidArgument(format!(
                "volume {} needs a non-zero size",
                spec.name
            )));
        }
        let file = check_file_name(&spec.id.0, &spec.name)?;

        let mut state = self.state.write().await;
        if let Some(existing) = reuse_by_name(&state.catalog, &spec)? {
            return Ok(existing);
        }

        state.catalog.insert_volume(placeholder(&spec));
        let placed = self
            .place(&mut state, ShardKind::Volume, &spec.id.0, &file, |dir| {
                self.materialize_volume(dir, &file, spec.size_bytes, &spec.options)
            })
            .await;
        let entry = finish_volume(&mut state.catalog, &spec.id, placed)?;
        info!(path = %entry.path, size = entry.size_bytes, "volume created");
        Ok(entry)
    }

    /// Create a volume as a writable clone of a snapshot.
    #[instrument(skip(self, spec), fields(volume_id = %spec.id, name = %spec.name))]
    pub async fn restore_snapshot(
        &self,
        snapshot_id: &SnapshotId,
        spec: VolumeSpec,
    ) -> Result<VolumeEntry, CsiError> {
        check_file_name(&spec.id.0, &spec.name)?;
        let mut state = self.state.write().await;
        if let Some(existing) = reuse_by_name(&state.catalog, &spec)? {
            return Ok(existing);
        }
        self.restore_locked(&mut state, snapshot_id, &spec).await
    }

    /// Create a volume with the content of another volume.
    ///
    /// A transient snapshot of the source is cut first and restored into the
    /// target.  It stays on the array for as long as the clone exists and is
    /// removed together with the clone.
    #[instrument(skip(self, spec), fields(volume_id = %spec.id, name = %spec.name))]
    pub async fn clone_volume(
        &self,
        source: &VolumeId,
        spec: VolumeSpec,
    ) -> Result<VolumeEntry, CsiError> {
        check_file_name(&spec.id.0, &spec.name)?;
        let mut state = self.state.write().await;
        if let Some(existing) = reuse_by_name(&state.catalog, &spec)? {
            return Ok(existing);
        }

        let transient_id = SnapshotId(Uuid::new_v4().to_string());
        let transient_name = format!("{CLONE_SNAPSHOT_PREFIX}{}", spec.id);
        let cut = self
            .snapshot_locked(
                &mut state,
                source,
                transient_id.clone(),
                &transient_name,
                Some(spec.id.clone()),
            )
            .await;
        let restored = match cut {
            Ok(snapshot) => self.restore_locked(&mut state, &snapshot.id, &spec).await,
            Err(e) => Err(e),
        };
        if restored.is_err() {
            self.discard_transient(&mut state, &transient_id).await;
        }
        restored
    }

    /// Delete a volume.  Unknown and never-materialized volumes succeed.
    ///
    /// Clone snapshots kept for the volume are removed last; a retry after
    /// a failed removal finds the volume gone and only finishes that part.
    #[instrument(skip(self))]
    pub async fn delete_volume(&self, id: &VolumeId) -> Result<(), CsiError> {
        let mut state = self.state.write().await;
        let Some(entry) = state.catalog.volume(id).cloned() else {
            debug!("volume already gone");
            return self.delete_transients_for(&mut state, id).await;
        };
        if !entry.is_materialized() {
            state.catalog.remove_volume(id);
            return self.delete_transients_for(&mut state, id).await;
        }

        let dependents = state.catalog.snapshots_of(id);
        if !dependents.is_empty() {
            let ids: Vec<_> = dependents.iter().map(|s| s.0.as_str()).collect();
            return Err(CsiError::Conflict(format!(
                "volume {id} still has snapshots {ids:?}"
            )));
        }

        self.tool.delete(&self.local_path(&entry.path)).await?;
        state.catalog.remove_volume(id);
        state
            .allocator
            .release(&self.mount_path, parent_dir(&entry.path), self.tool.as_ref())
            .await;
        info!(path = %entry.path, "volume deleted");
        self.delete_transients_for(&mut state, id).await
    }

    /// Grow a volume file to `new_size` bytes.
    #[instrument(skip(self))]
    pub async fn expand_volume(&self, id: &VolumeId, new_size: u64) -> Result<VolumeEntry, CsiError> {
        let mut state = self.state.write().await;
        let entry = state
            .catalog
            .volume(id)
            .filter(|v| v.is_materialized())
            .cloned()
            .ok_or_else(|| CsiError::VolumeNotFound(id.to_string()))?;
        if new_size < entry.size_bytes {
            return Err(CsiError::InvalidArgument(format!(
                "cannot shrink volume {id} from {} to {new_size} bytes",
                entry.size_bytes
            )));
        }

        self.tool
            .truncate(&self.local_path(&entry.path), new_size)
            .await?;
        let stored = state
            .catalog
            .volume_mut(id)
            .ok_or_else(|| CsiError::VolumeNotFound(id.to_string()))?;
        stored.size_bytes = new_size;
        info!(from = entry.size_bytes, to = new_size, "volume expanded");
        Ok(stored.clone())
    }

    /// Wait until the volume's backing file is recorded.
    pub async fn wait_volume_ready(&self, id: &VolumeId) -> Result<(), CsiError> {
        let ready = self
            .backoff
            .poll(move || async move {
                let state = self.state.read().await;
                Ok(state.catalog.volume(id).is_some_and(|v| v.is_materialized()))
            })
            .await?;
        if ready {
            Ok(())
        } else {
            Err(CsiError::Timeout(format!("volume {id} is still not ready")))
        }
    }

    // -- snapshots ----------------------------------------------------------

    /// Cut a snapshot of `source`.  A snapshot with the same name is returned
    /// as is.  Names starting with [`CLONE_SNAPSHOT_PREFIX`] are reserved.
    #[instrument(skip(self), fields(snapshot_id = %id))]
    pub async fn create_snapshot(
        &self,
        source: &VolumeId,
        id: SnapshotId,
        name: &str,
    ) -> Result<SnapshotEntry, CsiError> {
        if name.starts_with(CLONE_SNAPSHOT_PREFIX) {
            return Err(CsiError::InvalidArgument(format!(
                "snapshot names starting with {CLONE_SNAPSHOT_PREFIX:?} are reserved"
            )));
        }
        let mut state = self.state.write().await;
        if let Some(existing) = state.catalog.snapshot_by_name(name) {
            debug!(existing = %existing.id, "snapshot name already in use, returning it");
            return Ok(existing.clone());
        }
        self.snapshot_locked(&mut state, source, id, name, None).await
    }

    /// Delete a snapshot.  Unknown snapshots succeed.
    #[instrument(skip(self))]
    pub async fn delete_snapshot(&self, id: &SnapshotId) -> Result<(), CsiError> {
        let mut state = self.state.write().await;
        self.delete_snapshot_locked(&mut state, id).await
    }

    // -- internals ----------------------------------------------------------

    async fn snapshot_locked(
        &self,
        state: &mut State,
        source: &VolumeId,
        id: SnapshotId,
        name: &str,
        transient_for: Option<VolumeId>,
    ) -> Result<SnapshotEntry, CsiError> {
        let source_entry = state
            .catalog
            .volume(source)
            .filter(|v| v.is_materialized())
            .cloned()
            .ok_or_else(|| CsiError::VolumeNotFound(source.to_string()))?;
        let file = check_file_name(&id.0, name)?;

        state.catalog.insert_snapshot(SnapshotEntry {
            id: id.clone(),
            name: name.to_owned(),
            volume_id: source.clone(),
            path: String::new(),
            created_at: Utc::now(),
            size_bytes: 0,
            ready_to_use: false,
            transient_for,
        });

        let src = source_entry.path.as_str();
        let placed = self
            .place(state, ShardKind::Snapshot, &id.0, &file, |dir: ShardDir| {
                let dst = dir.entry(&file);
                async move { self.tool.snapshot(src, &dst).await.map(|_| ()) }
            })
            .await;
        let path = match placed {
            Ok(path) => path,
            Err(e) => {
                state.catalog.remove_snapshot(&id);
                return Err(e);
            }
        };

        let local = self.local_path(&path);
        let exists = self.wait_file(&local).await;
        let size_bytes = match tokio::fs::metadata(&local).await {
            Ok(meta) => meta.len(),
            Err(e) => {
                debug!(path = %local.display(), error = %e, "snapshot size unavailable");
                0
            }
        };
        let entry = {
            let Some(entry) = state.catalog.snapshot_mut(&id) else {
                return Err(CsiError::SnapshotNotFound(id.to_string()));
            };
            entry.path = path;
            entry.size_bytes = size_bytes;
            entry.ready_to_use = exists.is_ok();
            entry.clone()
        };
        exists?;
        info!(path = %entry.path, source = %source, "snapshot created");
        Ok(entry)
    }

    async fn restore_locked(
        &self,
        state: &mut State,
        snapshot_id: &SnapshotId,
        spec: &VolumeSpec,
    ) -> Result<VolumeEntry, CsiError> {
        let file = check_file_name(&spec.id.0, &spec.name)?;
        let snapshot = state
            .catalog
            .snapshot(snapshot_id)
            .filter(|s| s.is_materialized())
            .cloned()
            .ok_or_else(|| CsiError::SnapshotNotFound(snapshot_id.to_string()))?;

        state.catalog.insert_volume(placeholder(spec));
        let src = snapshot.path.as_str();
        let placed = self
            .place(state, ShardKind::Volume, &spec.id.0, &file, |dir: ShardDir| {
                self.clone_into(src, dir, &file, spec.size_bytes)
            })
            .await;
        let mut entry = finish_volume(&mut state.catalog, &spec.id, placed)?;
        let actual = tokio::fs::metadata(self.local_path(&entry.path)).await?.len();
        if actual > entry.size_bytes {
            entry.size_bytes = actual;
            if let Some(stored) = state.catalog.volume_mut(&spec.id) {
                stored.size_bytes = actual;
            }
        }
        info!(path = %entry.path, snapshot_id = %snapshot_id, "volume restored");
        Ok(entry)
    }

    async fn delete_snapshot_locked(
        &self,
        state: &mut State,
        id: &SnapshotId,
    ) -> Result<(), CsiError> {
        let Some(entry) = state.catalog.snapshot(id).cloned() else {
            debug!(snapshot_id = %id, "snapshot already gone");
            return Ok(());
        };
        if !entry.is_materialized() {
            state.catalog.remove_snapshot(id);
            return Ok(());
        }

        self.tool
            .delete_snapshot(&self.local_path(&entry.path))
            .await?;
        state.catalog.remove_snapshot(id);
        state
            .allocator
            .release(&self.mount_path, parent_dir(&entry.path), self.tool.as_ref())
            .await;
        info!(snapshot_id = %id, path = %entry.path, "snapshot deleted");
        Ok(())
    }

    async fn delete_transients_for(&self, state: &mut State, id: &VolumeId) -> Result<(), CsiError> {
        for snapshot_id in state.catalog.transient_snapshots_for(id) {
            self.delete_snapshot_locked(state, &snapshot_id).await?;
        }
        Ok(())
    }

    async fn discard_transient(&self, state: &mut State, id: &SnapshotId) {
        if let Err(e) = self.delete_snapshot_locked(state, id).await {
            warn!(snapshot_id = %id, error = %e, "failed to remove clone snapshot");
        }
    }

    /// Run `invoke` in the shard allocated for `id`, moving to another shard
    /// once if the array reports the first one full.  Returns the
    /// mount-relative path of `file`.
    async fn place<F, Fut>(
        &self,
        state: &mut State,
        kind: ShardKind,
        id: &str,
        file: &str,
        mut invoke: F,
    ) -> Result<String, CsiError>
    where
        F: FnMut(ShardDir) -> Fut,
        Fut: Future<Output = Result<(), CsiError>>,
    {
        let first = state.allocator.allocate(&self.mount_path, kind, id).await?;
        let err = match invoke(first.clone()).await {
            Ok(()) => return Ok(first.entry(file)),
            Err(e) => e,
        };
        discard_partial(&first.local.join(file)).await;
        if !err.is_no_space() {
            return Err(err);
        }

        warn!(%id, dir = %first.relative, error = %err, "shard is full, retrying in another one");
        state.allocator.mark_full(&first.relative);
        let second = state
            .allocator
            .reallocate(&self.mount_path, kind, id, self.tool.as_ref())
            .await?;
        match invoke(second.clone()).await {
            Ok(()) => Ok(second.entry(file)),
            Err(e) => {
                discard_partial(&second.local.join(file)).await;
                if !e.is_no_space() {
                    return Err(e);
                }
                state.allocator.mark_full(&second.relative);
                Err(CsiError::ResourceExhausted(format!(
                    "no room for {id} in {} or {}: {e}",
                    first.relative, second.relative
                )))
            }
        }
    }

    async fn materialize_volume(
        &self,
        dir: ShardDir,
        file: &str,
        size: u64,
        options: &CreateOptions,
    ) -> Result<(), CsiError> {
        let inode = path_inode(&dir.local).await?;
        let output = self.tool.create(file, size, inode, options).await?;
        debug!(%output, "array created file");

        let local = dir.local.join(file);
        if !tokio::fs::try_exists(&local).await? {
            return Err(CsiError::BackendError(format!(
                "array reported success but {} does not exist",
                local.display()
            )));
        }
        self.tool.truncate(&local, size).await
    }

    async fn clone_into(
        &self,
        src: &str,
        dir: ShardDir,
        file: &str,
        size: u64,
    ) -> Result<(), CsiError> {
        self.tool.clone_file(src, &dir.entry(file)).await?;
        let local = dir.local.join(file);
        let current = tokio::fs::metadata(&local).await?.len();
        if current < size {
            self.tool.truncate(&local, size).await?;
        }
        Ok(())
    }

    async fn wait_file(&self, local: &Path) -> Result<(), CsiError> {
        let found = self
            .backoff
            .poll(move || async move { tokio::fs::try_exists(local).await.map_err(CsiError::from) })
            .await?;
        if found {
            Ok(())
        } else {
            Err(CsiError::Timeout(format!(
                "{} did not appear on the array mount",
                local.display()
            )))
        }
    }
}

fn placeholder(spec: &VolumeSpec) -> VolumeEntry {
    VolumeEntry {
        id: spec.id.clone(),
        name: spec.name.clone(),
        size_bytes: spec.size_bytes,
        path: String::new(),
    }
}

/// Reuse rule for a create request whose name is taken.
fn reuse_by_name(catalog: &Catalog, spec: &VolumeSpec) -> Result<Option<VolumeEntry>, CsiError> {
    let Some(existing) = catalog.volume_by_name(&spec.name) else {
        return Ok(None);
    };
    // Zero asks for the content size of a restore or clone.
    if spec.size_bytes == 0 || spec.size_bytes >= existing.size_bytes {
        debug!(existing = %existing.id, "volume name already in use, reusing it");
        return Ok(Some(existing.clone()));
    }
    Err(CsiError::AlreadyExists(format!(
        "volume {:?} exists with {} bytes, {} requested",
        spec.name, existing.size_bytes, spec.size_bytes
    )))
}

/// Record the outcome of a placement on the volume placeholder.
fn finish_volume(
    catalog: &mut Catalog,
    id: &VolumeId,
    placed: Result<String, CsiError>,
) -> Result<VolumeEntry, CsiError> {
    let path = match placed {
        Ok(path) => path,
        Err(e) => {
            catalog.remove_volume(id);
            return Err(e);
        }
    };
    let entry = catalog
        .volume_mut(id)
        .ok_or_else(|| CsiError::VolumeNotFound(id.to_string()))?;
    entry.path = path;
    Ok(entry.clone())
}

fn parent_dir(relative: &str) -> &str {
    relative.rsplit_once('/').map_or("", |(dir, _)| dir)
}

async fn discard_partial(file: &Path) {
    match tokio::fs::remove_file(file).await {
        Ok(()) => debug!(path = %file.display(), "removed partial file"),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!(path = %file.display(), error = %e, "failed to remove partial file"),
    }
}

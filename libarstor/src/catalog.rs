//! In-memory index of volumes and snapshots.
//!
//! The array namespace is the source of truth: every file is named
//! `<id>_<name>`, so the catalog can be rebuilt on startup by walking the
//! shard directories.

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use crate::allocator::{ShardKind, join_relative};
use crate::error::CsiError;
use crate::tool::StorageTool;
use crate::types::{Snapshot, SnapshotId, Volume, VolumeId};

/// Entity file names must be shorter than this many bytes.
pub const FILE_NAME_MAX: usize = 255;

/// Name prefix of the transient snapshot cut for a clone.
pub const CLONE_SNAPSHOT_PREFIX: &str = "clone-";

/// On-disk file name of an entity.
pub fn file_name(id: &str, name: &str) -> String {
    format!("{id}_{name}")
}

/// Reject names the array cannot store.
pub fn check_file_name(id: &str, name: &str) -> Result<String, CsiError> {
    let file = file_name(id, name);
    if file.len() >= FILE_NAME_MAX {
        return Err(CsiError::InvalidArgument(format!(
            "name {name:?} is too long: file name would be {} bytes",
            file.len()
        )));
    }
    Ok(file)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VolumeEntry {
    pub id: VolumeId,
    pub name: String,
    pub size_bytes: u64,
    /// Path relative to the array mount; empty until the file exists.
    pub path: String,
}

impl VolumeEntry {
    pub fn is_materialized(&self) -> bool {
        !self.path.is_empty()
    }

    pub fn to_volume(&self) -> Volume {
        Volume {
            volume_id: self.id.clone(),
            capacity_bytes: self.size_bytes,
            volume_context: HashMap::new(),
            content_source: None,
            accessible_topology: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotEntry {
    pub id: SnapshotId,
    pub name: String,
    /// Volume the snapshot was cut from.
    pub volume_id: VolumeId,
    pub path: String,
    pub created_at: DateTime<Utc>,
    pub size_bytes: u64,
    pub ready_to_use: bool,
    /// Clone target this snapshot was cut for, if it is a clone intermediate.
    pub transient_for: Option<VolumeId>,
}

impl SnapshotEntry {
    pub fn is_materialized(&self) -> bool {
        !self.path.is_empty()
    }

    pub fn to_snapshot(&self) -> Snapshot {
        Snapshot {
            snapshot_id: self.id.clone(),
            source_volume_id: self.volume_id.clone(),
            creation_time: self.created_at,
            size_bytes: self.size_bytes,
            ready_to_use: self.ready_to_use && self.is_materialized(),
        }
    }
}

/// Counts from a namespace scan.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ScanReport {
    pub volumes: usize,
    pub snapshots: usize,
    pub removed_empty: usize,
    pub skipped: usize,
}

#[derive(Debug, Default)]
pub struct Catalog {
    volumes: HashMap<VolumeId, VolumeEntry>,
    snapshots: HashMap<SnapshotId, SnapshotEntry>,
}

impl Catalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn volume(&self, id: &VolumeId) -> Option<&VolumeEntry> {
        self.volumes.get(id)
    }

    pub fn volume_mut(&mut self, id: &VolumeId) -> Option<&mut VolumeEntry> {
        self.volumes.get_mut(id)
    }

    pub fn volume_by_name(&self, name: &str) -> Option<&VolumeEntry> {
        self.volumes.values().find(|v| v.name == name)
    }

    pub fn insert_volume(&mut self, entry: VolumeEntry) {
        self.volumes.insert(entry.id.clone(), entry);
    }

    pub fn remove_volume(&mut self, id: &VolumeId) -> Option<VolumeEntry> {
        self.volumes.remove(id)
    }

    pub fn snapshot(&self, id: &SnapshotId) -> Option<&SnapshotEntry> {
        self.snapshots.get(id)
    }

    pub fn snapshot_mut(&mut self, id: &SnapshotId) -> Option<&mut SnapshotEntry> {
        self.snapshots.get_mut(id)
    }

    /// Snapshot with the given name.  Clone intermediates are not visible.
    pub fn snapshot_by_name(&self, name: &str) -> Option<&SnapshotEntry> {
        self.snapshots
            .values()
            .find(|s| s.transient_for.is_none() && s.name == name)
    }

    pub fn insert_snapshot(&mut self, entry: SnapshotEntry) {
        self.snapshots.insert(entry.id.clone(), entry);
    }

    pub fn remove_snapshot(&mut self, id: &SnapshotId) -> Option<SnapshotEntry> {
        self.snapshots.remove(id)
    }

    /// Snapshots cut from `volume_id`.
    pub fn snapshots_of(&self, volume_id: &VolumeId) -> Vec<SnapshotId> {
        let mut ids: Vec<_> = self
            .snapshots
            .values()
            .filter(|s| &s.volume_id == volume_id)
            .map(|s| s.id.clone())
            .collect();
        ids.sort_by(|a, b| a.0.cmp(&b.0));
        ids
    }

    /// Clone intermediates kept alive for `volume_id`.
    pub fn transient_snapshots_for(&self, volume_id: &VolumeId) -> Vec<SnapshotId> {
        self.snapshots
            .values()
            .filter(|s| s.transient_for.as_ref() == Some(volume_id))
            .map(|s| s.id.clone())
            .collect()
    }

    /// Materialized volumes, ordered by ID.
    pub fn volumes(&self) -> Vec<&VolumeEntry> {
        let mut out: Vec<_> = self
            .volumes
            .values()
            .filter(|v| v.is_materialized())
            .collect();
        out.sort_by(|a, b| a.id.0.cmp(&b.id.0));
        out
    }

    /// User-visible snapshots, ordered by ID.
    pub fn snapshots(&self) -> Vec<&SnapshotEntry> {
        let mut out: Vec<_> = self
            .snapshots
            .values()
            .filter(|s| s.transient_for.is_none() && s.is_materialized())
            .collect();
        out.sort_by(|a, b| a.id.0.cmp(&b.id.0));
        out
    }

    /// Walk the namespace under `mount_root` and add every entity not yet
    /// known.  Zero-length files are leftovers of failed creations and are
    /// deleted.
    pub async fn scan(
        &mut self,
        mount_root: &Path,
        tool: &dyn StorageTool,
    ) -> Result<ScanReport, CsiError> {
        let mut report = ScanReport::default();

        for file in list_files(mount_root, ShardKind::Volume).await? {
            let Some((id, name, relative)) = parse_entry(mount_root, &file) else {
                report.skipped += 1;
                continue;
            };
            let id = VolumeId(id);
            if self.volumes.contains_key(&id) {
                continue;
            }
            let meta = tokio::fs::metadata(&file).await?;
            if meta.len() == 0 {
                remove_empty(&file).await;
                report.removed_empty += 1;
                continue;
            }
            self.insert_volume(VolumeEntry {
                id,
                name,
                size_bytes: meta.len(),
                path: relative,
            });
            report.volumes += 1;
        }

        for file in list_files(mount_root, ShardKind::Snapshot).await? {
            let Some((id, name, relative)) = parse_entry(mount_root, &file) else {
                report.skipped += 1;
                continue;
            };
            let id = SnapshotId(id);
            if self.snapshots.contains_key(&id) {
                continue;
            }
            let meta = tokio::fs::metadata(&file).await?;
            if meta.len() == 0 {
                remove_empty(&file).await;
                report.removed_empty += 1;
                continue;
            }
            let created_at = meta
                .created()
                .or_else(|_| meta.modified())
                .map(DateTime::<Utc>::from)
                .unwrap_or_else(|_| Utc::now());
            let source = tool.snapshot_source_volume_id(meta.ino()).await?;
            let transient_for = name
                .strip_prefix(CLONE_SNAPSHOT_PREFIX)
                .map(|target| VolumeId(target.to_owned()));
            self.insert_snapshot(SnapshotEntry {
                id,
                name,
                volume_id: VolumeId(source),
                path: relative,
                created_at,
                size_bytes: meta.len(),
                ready_to_use: true,
                transient_for,
            });
            report.snapshots += 1;
        }

        info!(
            volumes = report.volumes,
            snapshots = report.snapshots,
            removed_empty = report.removed_empty,
            skipped = report.skipped,
            "namespace scan finished"
        );
        Ok(report)
    }
}

/// All regular files below the base directory of `kind`, recursively.
async fn list_files(mount_root: &Path, kind: ShardKind) -> Result<Vec<PathBuf>, CsiError> {
    let base = join_relative(mount_root, kind.base());
    tokio::fs::create_dir_all(&base)
        .await
        .map_err(|e| CsiError::Internal(format!("create {}: {e}", base.display())))?;

    let mut files = Vec::new();
    let mut pending = vec![base];
    while let Some(dir) = pending.pop() {
        let mut entries = tokio::fs::read_dir(&dir)
            .await
            .map_err(|e| CsiError::Internal(format!("read {}: {e}", dir.display())))?;
        while let Some(entry) = entries.next_entry().await? {
            let ty = entry.file_type().await?;
            if ty.is_dir() {
                pending.push(entry.path());
            } else if ty.is_file() {
                files.push(entry.path());
            }
        }
    }
    files.sort();
    Ok(files)
}

/// Split `<id>_<name>` and compute the mount-relative path.
fn parse_entry(mount_root: &Path, file: &Path) -> Option<(String, String, String)> {
    let file_name = file.file_name()?.to_str()?;
    let Some((id, name)) = file_name.split_once('_') else {
        debug!(file = %file.display(), "not an entity file, skipping");
        return None;
    };
    if id.is_empty() || name.is_empty() {
        debug!(file = %file.display(), "not an entity file, skipping");
        return None;
    }
    let relative = file.strip_prefix(mount_root).ok()?.to_str()?;
    Some((id.to_owned(), name.to_owned(), format!("/{relative}")))
}

async fn remove_empty(file: &Path) {
    info!(file = %file.display(), "removing zero-length leftover");
    if let Err(e) = tokio::fs::remove_file(file).await
        && e.kind() != std::io::ErrorKind::NotFound
    {
        warn!(file = %file.display(), error = %e, "failed to remove leftover");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tool::fake::FakeTool;

    fn write(root: &Path, rel: &str, len: usize) -> PathBuf {
        let path = join_relative(root, rel);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, vec![1u8; len]).unwrap();
        path
    }

    #[test]
    fn file_name_boundary() {
        let id = "0123456789abcdef0123456789abcdef01234";
        let max_name = "n".repeat(FILE_NAME_MAX - 1 - id.len() - 1);
        assert_eq!(check_file_name(id, &max_name).unwrap().len(), FILE_NAME_MAX - 1);

        let too_long = "n".repeat(FILE_NAME_MAX - id.len() - 1);
        let err = check_file_name(id, &too_long).unwrap_err();
        assert!(matches!(err, CsiError::InvalidArgument(_)));
    }

    #[tokio::test]
    async fn scan_rebuilds_entries() {
        let root = tempfile::tempdir().unwrap();
        let tool = FakeTool::new(root.path());
        write(root.path(), "/kubernetes/volumes/volume_3/v1_data", 4096);
        write(root.path(), "/kubernetes/volumes/volume_3/noseparator", 10);
        let snap = write(root.path(), "/kubernetes/snapshots/snapshot_8/s1_daily", 4096);
        tool.set_snapshot_source(&snap, "v1");
        let transient = write(root.path(), "/kubernetes/snapshots/snapshot_9/s2_clone-v2", 4096);
        tool.set_snapshot_source(&transient, "v1");

        let mut catalog = Catalog::new();
        let report = catalog.scan(root.path(), &tool).await.unwrap();
        assert_eq!(report.volumes, 1);
        assert_eq!(report.snapshots, 2);
        assert_eq!(report.skipped, 1);

        let vol = catalog.volume(&VolumeId::from("v1")).unwrap();
        assert_eq!(vol.name, "data");
        assert_eq!(vol.size_bytes, 4096);
        assert_eq!(vol.path, "/kubernetes/volumes/volume_3/v1_data");

        let s1 = catalog.snapshot(&SnapshotId::from("s1")).unwrap();
        assert_eq!(s1.volume_id, VolumeId::from("v1"));
        assert!(s1.ready_to_use);
        let s2 = catalog.snapshot(&SnapshotId::from("s2")).unwrap();
        assert_eq!(s2.transient_for, Some(VolumeId::from("v2")));

        // Transient snapshots are hidden from listing and name lookup but
        // still block deletion of their source.
        assert_eq!(catalog.snapshots().len(), 1);
        assert!(catalog.snapshot_by_name("clone-v2").is_none());
        assert_eq!(catalog.snapshots_of(&VolumeId::from("v1")).len(), 2);
        assert_eq!(
            catalog.transient_snapshots_for(&VolumeId::from("v2")),
            vec![SnapshotId::from("s2")]
        );
    }

    #[tokio::test]
    async fn scan_deletes_zero_length_files() {
        let root = tempfile::tempdir().unwrap();
        let tool = FakeTool::new(root.path());
        let empty = write(root.path(), "/kubernetes/volumes/volume_1/v9_broken", 0);

        let mut catalog = Catalog::new();
        let report = catalog.scan(root.path(), &tool).await.unwrap();
        assert_eq!(report.removed_empty, 1);
        assert!(!empty.exists());
        assert!(catalog.volume(&VolumeId::from("v9")).is_none());
    }

    #[tokio::test]
    async fn rescan_keeps_existing_entries() {
        let root = tempfile::tempdir().unwrap();
        let tool = FakeTool::new(root.path());
        write(root.path(), "/kubernetes/volumes/volume_1/v1_a", 100);

        let mut catalog = Catalog::new();
        catalog.insert_volume(VolumeEntry {
            id: VolumeId::from("v1"),
            name: "a".into(),
            size_bytes: 1 << 20,
            path: "/kubernetes/volumes/volume_1/v1_a".into(),
        });
        let report = catalog.scan(root.path(), &tool).await.unwrap();
        assert_eq!(report.volumes, 0);
        assert_eq!(catalog.volume(&VolumeId::from("v1")).unwrap().size_bytes, 1 << 20);
    }
}

//! Directory sharding for volume and snapshot files.
//!
//! The array degrades when a directory holds too many entries, so every
//! volume and snapshot file lives in one of [`SHARD_COUNT`] subdirectories
//! chosen by hashing the entity ID.  A shard the array reports as full is
//! remembered in a process-local set and skipped by later allocations until
//! a live count shows it has room again.

use std::collections::HashSet;
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use crate::error::CsiError;
use crate::tool::{StorageTool, parse_dir_entry_count};

/// Number of shard directories per entity kind.
pub const SHARD_COUNT: u32 = 1000;

/// Entries a shard may hold before it counts as full.
pub const DIR_ENTRY_LIMIT: usize = 1000;

/// Which namespace a shard belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShardKind {
    Volume,
    Snapshot,
}

impl ShardKind {
    /// Directory holding every shard of this kind, relative to the mount.
    pub fn base(self) -> &'static str {
        match self {
            Self::Volume => "/kubernetes/volumes",
            Self::Snapshot => "/kubernetes/snapshots",
        }
    }

    /// Relative path prefix; the shard index is appended to it.
    pub fn prefix(self) -> &'static str {
        match self {
            Self::Volume => "/kubernetes/volumes/volume_",
            Self::Snapshot => "/kubernetes/snapshots/snapshot_",
        }
    }
}

/// A chosen shard directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShardDir {
    pub index: u32,
    /// Absolute path on this node.
    pub local: PathBuf,
    /// Path relative to the array mount root.
    pub relative: String,
}

impl ShardDir {
    fn new(mount_root: &Path, kind: ShardKind, index: u32) -> Self {
        let relative = format!("{}{index}", kind.prefix());
        Self {
            index,
            local: join_relative(mount_root, &relative),
            relative,
        }
    }

    /// Relative path of `file_name` inside this shard.
    pub fn entry(&self, file_name: &str) -> String {
        format!("{}/{file_name}", self.relative)
    }
}

/// Join a mount-relative path (`/kubernetes/...`) onto the mount root.
pub fn join_relative(mount_root: &Path, relative: &str) -> PathBuf {
    mount_root.join(relative.trim_start_matches('/'))
}

/// CRC-32 (IEEE) of `id`, reduced to a shard index.
pub fn shard_hash(id: &str) -> u32 {
    crc32fast::hash(id.as_bytes()) % SHARD_COUNT
}

/// Inode of a local path.
pub async fn path_inode(path: &Path) -> Result<u64, CsiError> {
    let meta = tokio::fs::metadata(path)
        .await
        .map_err(|e| CsiError::Internal(format!("stat {}: {e}", path.display())))?;
    Ok(meta.ino())
}

/// Picks shard directories and tracks the ones known to be full.
#[derive(Debug, Default)]
pub struct DirectoryAllocator {
    full: HashSet<String>,
}

impl DirectoryAllocator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_full(&self, relative_dir: &str) -> bool {
        self.full.contains(relative_dir)
    }

    pub fn mark_full(&mut self, relative_dir: &str) {
        if self.full.insert(relative_dir.to_owned()) {
            info!(dir = %relative_dir, "shard marked full");
        }
    }

    /// Forget the full mark of a shard.  Returns whether it was marked.
    pub fn clear_full(&mut self, relative_dir: &str) -> bool {
        let was = self.full.remove(relative_dir);
        if was {
            info!(dir = %relative_dir, "shard no longer full");
        }
        was
    }

    /// Shard for `id`: its hash shard, or the next one not marked full.
    /// The directory is created if needed.
    pub async fn allocate(
        &self,
        mount_root: &Path,
        kind: ShardKind,
        id: &str,
    ) -> Result<ShardDir, CsiError> {
        let hash = shard_hash(id);
        let index = (0..SHARD_COUNT)
            .map(|i| (hash + i) % SHARD_COUNT)
            .find(|&idx| !self.is_full(&format!("{}{idx}", kind.prefix())))
            .ok_or_else(|| {
                CsiError::ResourceExhausted(format!("every {kind:?} shard is full, cannot place {id}"))
            })?;

        let dir = ShardDir::new(mount_root, kind, index);
        ensure_dir(&dir.local).await?;
        debug!(%id, dir = %dir.relative, "allocated shard");
        Ok(dir)
    }

    /// Shard for a retry after the first choice reported "no space".
    ///
    /// Candidates start after the hash shard and move by growing strides; a
    /// candidate is taken only when it is not marked full and the array
    /// reports fewer than [`DIR_ENTRY_LIMIT`] entries in it.
    pub async fn reallocate(
        &self,
        mount_root: &Path,
        kind: ShardKind,
        id: &str,
        tool: &dyn StorageTool,
    ) -> Result<ShardDir, CsiError> {
        let mut index = (shard_hash(id) + 1) % SHARD_COUNT;
        let mut stride = 1;
        while stride < SHARD_COUNT {
            let dir = ShardDir::new(mount_root, kind, index);
            if !self.is_full(&dir.relative) && has_room(&dir.local, tool).await {
                info!(%id, dir = %dir.relative, "reallocated shard");
                return Ok(dir);
            }
            stride += 1;
            index = (index + stride) % SHARD_COUNT;
        }
        Err(CsiError::ResourceExhausted(format!(
            "no {kind:?} shard with free entries for {id}"
        )))
    }

    /// After a delete in `relative_dir`, clear its full mark when the array
    /// shows room again.
    pub async fn release(&mut self, mount_root: &Path, relative_dir: &str, tool: &dyn StorageTool) {
        if !self.is_full(relative_dir) {
            return;
        }
        let local = join_relative(mount_root, relative_dir);
        if has_room(&local, tool).await {
            self.clear_full(relative_dir);
        }
    }
}

/// Live check of a shard's entry count.  Any failure counts as "no room".
async fn has_room(local_dir: &Path, tool: &dyn StorageTool) -> bool {
    match live_entry_count(local_dir, tool).await {
        Ok(Some(count)) => count < DIR_ENTRY_LIMIT,
        Ok(None) => false,
        Err(e) => {
            warn!(dir = %local_dir.display(), error = %e, "shard entry count unavailable");
            false
        }
    }
}

/// `Ok(Some(0))` for a shard the array has no attributes for yet.
async fn live_entry_count(
    local_dir: &Path,
    tool: &dyn StorageTool,
) -> Result<Option<usize>, CsiError> {
    ensure_dir(local_dir).await?;
    let inode = path_inode(local_dir).await?;
    let attributes = tool.directory_attributes(inode).await?;
    if attributes.trim().is_empty() {
        return Ok(Some(0));
    }
    Ok(parse_dir_entry_count(&attributes))
}

async fn ensure_dir(dir: &Path) -> Result<(), CsiError> {
    tokio::fs::create_dir_all(dir)
        .await
        .map_err(|e| CsiError::Internal(format!("create {}: {e}", dir.display())))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tool::fake::FakeTool;

    #[test]
    fn hash_is_deterministic_and_bounded() {
        for id in ["", "a", "0b4c5f3e-0000-4000-8000-000000000000", "ünïcødé"] {
            let h = shard_hash(id);
            assert!(h < SHARD_COUNT);
            assert_eq!(h, shard_hash(id));
        }
        assert_eq!(shard_hash(""), 0);
    }

    #[tokio::test]
    async fn allocate_uses_hash_shard_and_creates_it() {
        let root = tempfile::tempdir().unwrap();
        let alloc = DirectoryAllocator::new();
        let dir = alloc
            .allocate(root.path(), ShardKind::Volume, "vol-1")
            .await
            .unwrap();
        assert_eq!(dir.index, shard_hash("vol-1"));
        assert_eq!(dir.relative, format!("/kubernetes/volumes/volume_{}", dir.index));
        assert!(dir.local.is_dir());
        assert_eq!(dir.entry("vol-1_data"), format!("{}/vol-1_data", dir.relative));
    }

    #[tokio::test]
    async fn allocate_skips_full_shards() {
        let root = tempfile::tempdir().unwrap();
        let mut alloc = DirectoryAllocator::new();
        let h = shard_hash("snap-9");
        alloc.mark_full(&format!("/kubernetes/snapshots/snapshot_{h}"));
        alloc.mark_full(&format!("/kubernetes/snapshots/snapshot_{}", (h + 1) % SHARD_COUNT));

        let dir = alloc
            .allocate(root.path(), ShardKind::Snapshot, "snap-9")
            .await
            .unwrap();
        assert_eq!(dir.index, (h + 2) % SHARD_COUNT);
    }

    #[tokio::test]
    async fn allocate_exhausted_when_all_full() {
        let root = tempfile::tempdir().unwrap();
        let mut alloc = DirectoryAllocator::new();
        for i in 0..SHARD_COUNT {
            alloc.mark_full(&format!("/kubernetes/volumes/volume_{i}"));
        }
        let err = alloc
            .allocate(root.path(), ShardKind::Volume, "v")
            .await
            .unwrap_err();
        assert!(matches!(err, CsiError::ResourceExhausted(_)));
    }

    #[tokio::test]
    async fn reallocate_checks_live_count() {
        let root = tempfile::tempdir().unwrap();
        let tool = FakeTool::new(root.path());
        let mut alloc = DirectoryAllocator::new();
        let h = shard_hash("vol-x");
        alloc.mark_full(&format!("/kubernetes/volumes/volume_{h}"));

        // h+1 is crowded on the array, h+3 is marked full, h+6 has room.
        let crowded = ShardDir::new(root.path(), ShardKind::Volume, (h + 1) % SHARD_COUNT);
        std::fs::create_dir_all(&crowded.local).unwrap();
        tool.set_dir_entries(&crowded.local, DIR_ENTRY_LIMIT);
        alloc.mark_full(&format!("/kubernetes/volumes/volume_{}", (h + 3) % SHARD_COUNT));

        let dir = alloc
            .reallocate(root.path(), ShardKind::Volume, "vol-x", &tool)
            .await
            .unwrap();
        assert_eq!(dir.index, (h + 6) % SHARD_COUNT);
        assert!(dir.local.is_dir());
        assert_ne!(dir.index, h);
    }

    #[tokio::test]
    async fn release_clears_flag_only_with_room() {
        let root = tempfile::tempdir().unwrap();
        let tool = FakeTool::new(root.path());
        let mut alloc = DirectoryAllocator::new();
        let dir = ShardDir::new(root.path(), ShardKind::Volume, 5);
        std::fs::create_dir_all(&dir.local).unwrap();

        alloc.mark_full(&dir.relative);
        tool.set_dir_entries(&dir.local, DIR_ENTRY_LIMIT + 3);
        alloc.release(root.path(), &dir.relative, &tool).await;
        assert!(alloc.is_full(&dir.relative));

        tool.set_dir_entries(&dir.local, DIR_ENTRY_LIMIT - 1);
        alloc.release(root.path(), &dir.relative, &tool).await;
        assert!(!alloc.is_full(&dir.relative));

        // Not marked: no query at all.
        let before = tool.count("directory_attributes");
        alloc.release(root.path(), &dir.relative, &tool).await;
        assert_eq!(tool.count("directory_attributes"), before);
    }
}

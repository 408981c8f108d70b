//! In-memory stand-in for the array tool, backed by a plain directory.

use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use super::{CreateOptions, StorageTool};
use crate::error::CsiError;

/// Emulates the array on top of a local directory tree: `create` makes a
/// file in the directory with the given inode, snapshots and clones are
/// plain copies.  Failures can be queued per operation.
pub(crate) struct FakeTool {
    root: PathBuf,
    failures: Mutex<HashMap<&'static str, VecDeque<CsiError>>>,
    dir_attributes: Mutex<HashMap<u64, String>>,
    snapshot_sources: Mutex<HashMap<u64, String>>,
    calls: Mutex<Vec<String>>,
}

impl FakeTool {
    pub(crate) fn new(root: &Path) -> Self {
        Self {
            root: root.to_path_buf(),
            failures: Mutex::new(HashMap::new()),
            dir_attributes: Mutex::new(HashMap::new()),
            snapshot_sources: Mutex::new(HashMap::new()),
            calls: Mutex::new(Vec::new()),
        }
    }

    /// Make the next call of `op` fail with `err`.
    pub(crate) fn fail_next(&self, op: &'static str, err: CsiError) {
        self.failures
            .lock()
            .unwrap()
            .entry(op)
            .or_default()
            .push_back(err);
    }

    /// Report `count` live entries for `local_dir`.
    pub(crate) fn set_dir_entries(&self, local_dir: &Path, count: usize) {
        let inode = std::fs::metadata(local_dir).unwrap().ino();
        let mut dump = String::from("dirList: [ dEntries: . ");
        for i in 0..count {
            dump.push_str(&format!("dEntries: f{i} "));
        }
        dump.push(']');
        self.dir_attributes.lock().unwrap().insert(inode, dump);
    }

    /// Record that the snapshot file at `local` was cut from `volume_id`.
    pub(crate) fn set_snapshot_source(&self, local: &Path, volume_id: &str) {
        let inode = std::fs::metadata(local).unwrap().ino();
        self.snapshot_sources
            .lock()
            .unwrap()
            .insert(inode, volume_id.to_owned());
    }

    pub(crate) fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    /// Number of calls of the given operation.
    pub(crate) fn count(&self, op: &str) -> usize {
        self.calls()
            .iter()
            .filter(|c| c.split(' ').next() == Some(op))
            .count()
    }

    fn enter(&self, op: &'static str, detail: impl AsRef<str>) -> Result<(), CsiError> {
        self.calls
            .lock()
            .unwrap()
            .push(format!("{op} {}", detail.as_ref()));
        match self.failures.lock().unwrap().get_mut(op).and_then(VecDeque::pop_front) {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Like [`Self::enter`], but a failure leaves an empty destination file
    /// the way the array does.
    fn enter_leaving_partial(
        &self,
        op: &'static str,
        src_rel: &str,
        dst_rel: &str,
    ) -> Result<(), CsiError> {
        let outcome = self.enter(op, format!("{src_rel}:{dst_rel}"));
        if outcome.is_err() {
            std::fs::File::create(self.local(dst_rel))?;
        }
        outcome
    }

    fn local(&self, rel: &str) -> PathBuf {
        self.root.join(rel.trim_start_matches('/'))
    }

    fn find_dir(dir: &Path, inode: u64) -> Option<PathBuf> {
        if std::fs::metadata(dir).ok()?.ino() == inode {
            return Some(dir.to_path_buf());
        }
        for entry in std::fs::read_dir(dir).ok()?.flatten() {
            let path = entry.path();
            if path.is_dir()
                && let Some(found) = Self::find_dir(&path, inode)
            {
                return Some(found);
            }
        }
        None
    }

    fn copy(&self, src_rel: &str, dst_rel: &str) -> Result<(), CsiError> {
        let src = self.local(src_rel);
        let dst = self.local(dst_rel);
        std::fs::copy(&src, &dst)
            .map_err(|e| CsiError::BackendError(format!("copy {}: {e}", src.display())))?;
        Ok(())
    }
}

#[async_trait]
impl StorageTool for FakeTool {
    async fn check_ready(&self) -> Result<(), CsiError> {
        self.enter("check_ready", "")
    }

    async fn create(
        &self,
        name: &str,
        _size: u64,
        dir_inode: u64,
        _options: &CreateOptions,
    ) -> Result<String, CsiError> {
        let dir = Self::find_dir(&self.root, dir_inode)
            .ok_or_else(|| CsiError::BackendError(format!("no directory with inode {dir_inode}")))?;
        let outcome = self.enter("create", dir.join(name).display().to_string());
        // The array leaves an empty file behind even when creation fails.
        std::fs::File::create(dir.join(name))?;
        outcome.map(|_| "created".to_owned())
    }

    async fn truncate(&self, local_path: &Path, size: u64) -> Result<(), CsiError> {
        self.enter("truncate", format!("{} {size}", local_path.display()))?;
        let file = std::fs::OpenOptions::new().write(true).open(local_path)?;
        file.set_len(size)?;
        Ok(())
    }

    async fn snapshot(&self, src_rel: &str, dst_rel: &str) -> Result<String, CsiError> {
        self.enter_leaving_partial("snapshot", src_rel, dst_rel)?;
        self.copy(src_rel, dst_rel)?;
        let source_id = Path::new(src_rel)
            .file_name()
            .and_then(|n| n.to_str())
            .and_then(|n| n.split_once('_'))
            .map(|(id, _)| id.to_owned())
            .unwrap_or_default();
        self.set_snapshot_source(&self.local(dst_rel), &source_id);
        Ok(String::new())
    }

    async fn clone_file(&self, src_rel: &str, dst_rel: &str) -> Result<String, CsiError> {
        self.enter_leaving_partial("clone", src_rel, dst_rel)?;
        self.copy(src_rel, dst_rel)?;
        Ok(String::new())
    }

    async fn delete(&self, local_path: &Path) -> Result<(), CsiError> {
        self.enter("delete", local_path.display().to_string())?;
        std::fs::remove_file(local_path)?;
        Ok(())
    }

    async fn delete_snapshot(&self, local_path: &Path) -> Result<(), CsiError> {
        self.enter("delete_snapshot", local_path.display().to_string())?;
        std::fs::remove_file(local_path)?;
        Ok(())
    }

    async fn directory_attributes(&self, inode: u64) -> Result<String, CsiError> {
        self.enter("directory_attributes", inode.to_string())?;
        Ok(self
            .dir_attributes
            .lock()
            .unwrap()
            .get(&inode)
            .cloned()
            .unwrap_or_default())
    }

    async fn snapshot_source_volume_id(&self, inode: u64) -> Result<String, CsiError> {
        self.enter("snapshot_source_volume_id", inode.to_string())?;
        self.snapshot_sources
            .lock()
            .unwrap()
            .get(&inode)
            .cloned()
            .ok_or_else(|| CsiError::BackendError(format!("inode {inode} is not a snapshot")))
    }
}

use async_trait::async_trait;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info};

use super::{CreateOptions, StorageTool};
use crate::error::CsiError;
use crate::exec::CommandRunner;

/// [`StorageTool`] that shells out to `docker exec <container> mxTool ...`.
///
/// Truncation and volume deletion act on the locally mounted file and need
/// no round trip through the container.
pub struct ToolCommand {
    container: String,
    runner: Arc<dyn CommandRunner>,
}

impl ToolCommand {
    pub fn new(container: impl Into<String>, runner: Arc<dyn CommandRunner>) -> Self {
        Self {
            container: container.into(),
            runner,
        }
    }

    /// Run `program args...` inside the array container.
    ///
    /// On failure the error text is the tool's own output only, so the
    /// array's numeric error code is the first number in it.
    async fn exec_in_container(&self, program: &str, args: &[&str]) -> Result<String, CsiError> {
        let mut argv = vec!["exec", self.container.as_str(), program];
        argv.extend_from_slice(args);
        debug!(container = %self.container, %program, ?args, "tool exec");

        let out = self.runner.run("docker", &argv, None).await?;
        if !out.success() {
            return Err(CsiError::BackendError(format!(
                "{program} failed: {}",
                out.combined().trim()
            )));
        }
        Ok(out.combined())
    }

    async fn mx_tool(&self, command: &str, args: &[&str]) -> Result<String, CsiError> {
        let mut argv = vec!["-c", command];
        argv.extend_from_slice(args);
        self.exec_in_container("mxTool", &argv).await
    }
}

#[async_trait]
impl StorageTool for ToolCommand {
    async fn check_ready(&self) -> Result<(), CsiError> {
        let out = self
            .runner
            .run(
                "docker",
                &[
                    "inspect",
                    "--format",
                    "{{.State.Running}}",
                    self.container.as_str(),
                ],
                None,
            )
            .await?;
        if !out.success() {
            return Err(CsiError::BackendError(format!(
                "inspect array container: {}",
                out.combined().trim()
            )));
        }
        if !out.stdout.trim().eq_ignore_ascii_case("true") {
            return Err(CsiError::BackendError(format!(
                "array container {} is not running",
                self.container
            )));
        }
        info!(container = %self.container, "array container is running");
        Ok(())
    }

    async fn create(
        &self,
        name: &str,
        size: u64,
        dir_inode: u64,
        options: &CreateOptions,
    ) -> Result<String, CsiError> {
        let size = size.to_string();
        let inode = dir_inode.to_string();
        let policy = options.policy();
        self.mx_tool("createfile", &[name, size.as_str(), inode.as_str(), policy.as_str()])
            .await
    }

    async fn truncate(&self, local_path: &Path, size: u64) -> Result<(), CsiError> {
        let path = local_path.to_string_lossy().into_owned();
        let size = size.to_string();
        let out = self
            .runner
            .run("truncate", &[path.as_str(), "-s", size.as_str()], None)
            .await?;
        if !out.success() {
            return Err(CsiError::BackendError(format!(
                "truncate failed: {}",
                out.combined().trim()
            )));
        }
        Ok(())
    }

    async fn snapshot(&self, src_rel: &str, dst_rel: &str) -> Result<String, CsiError> {
        if src_rel.is_empty() || dst_rel.is_empty() {
            return Err(CsiError::InvalidArgument(
                "snapshot needs both source and destination".into(),
            ));
        }
        let spec = format!("{src_rel}:{dst_rel}");
        self.mx_tool("createsnapshot", &[spec.as_str()]).await
    }

    async fn clone_file(&self, src_rel: &str, dst_rel: &str) -> Result<String, CsiError> {
        if src_rel.is_empty() || dst_rel.is_empty() {
            return Err(CsiError::InvalidArgument(
                "clone needs both source and destination".into(),
            ));
        }
        let spec = format!("{src_rel}:{dst_rel}");
        self.mx_tool("createclone", &[spec.as_str()]).await
    }

    async fn delete(&self, local_path: &Path) -> Result<(), CsiError> {
        match tokio::fs::remove_file(local_path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %local_path.display(), "volume file already gone");
                Ok(())
            }
            Err(e) => Err(CsiError::BackendError(format!(
                "remove {}: {e}",
                local_path.display()
            ))),
        }
    }

    async fn delete_snapshot(&self, local_path: &Path) -> Result<(), CsiError> {
        let path = local_path.to_string_lossy().into_owned();
        self.mx_tool("deletesnapshot", &[path.as_str()]).await?;
        Ok(())
    }

    async fn directory_attributes(&self, inode: u64) -> Result<String, CsiError> {
        let inode = inode.to_string();
        self.exec_in_container("zklist", &["-i", inode.as_str(), "-r"]).await
    }

    async fn snapshot_source_volume_id(&self, inode: u64) -> Result<String, CsiError> {
        let inode_arg = inode.to_string();
        let strand = self
            .exec_in_container("zklist", &["-i", inode_arg.as_str(), "--strand"])
            .await?;
        parse_strand_source(&strand).ok_or_else(|| {
            CsiError::BackendError(format!("no source volume in strand of inode {inode}"))
        })
    }
}

/// Extract the source volume ID from a `zklist --strand` dump.
///
/// The first line names the root of the strand, e.g.
/// `<volumeId>_<volumeName> : 113766 (0x1bc66) : UPTODATE`.
fn parse_strand_source(strand: &str) -> Option<String> {
    let root = strand.lines().map(str::trim).find(|l| !l.is_empty())?;
    let file = root.split(':').next()?.trim();
    let file = file.split('.').next().unwrap_or(file);
    let id = file.split_once('_').map_or(file, |(id, _)| id);
    (!id.is_empty()).then(|| id.to_owned())
}

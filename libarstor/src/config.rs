//! Plugin configuration.
//!
//! Loaded by the binary from flags and an optional YAML file; every field
//! has a default so a partial file is enough.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::allocator::ShardKind;
use crate::backoff::Backoff;
use crate::error::CsiError;

/// Driver name reported by `GetPluginInfo`.
pub const DEFAULT_DRIVER_NAME: &str = "rk8s.arstor.csi";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ArStorConfig {
    /// Where the array share is mounted on this node.
    pub mount_point: PathBuf,
    /// Share name; with `mount_hash_dir` the share is mounted one level
    /// deeper, at `<mount_point>/<shares>`.
    pub shares: String,
    pub mount_hash_dir: bool,
    /// Docker container running the array tooling.
    pub container: String,
    pub driver_name: String,
    pub node_id: String,
    /// Publish volumes inline when the volume context does not say.
    pub ephemeral: bool,
    /// Reported in `NodeGetInfo`; 0 means unlimited.
    pub max_volumes_per_node: u64,
    /// QUIC listen address.
    pub listen: SocketAddr,
    /// Workers running the lost loop device sweep; 0 disables it.
    pub sweep_workers: usize,
    pub sweep_period_secs: u64,
    /// Readiness polling schedule.
    pub backoff: Backoff,
}

impl Default for ArStorConfig {
    fn default() -> Self {
        Self {
            mount_point: PathBuf::from("/arstor"),
            shares: String::new(),
            mount_hash_dir: false,
            container: "mxsp".to_owned(),
            driver_name: DEFAULT_DRIVER_NAME.to_owned(),
            node_id: String::new(),
            ephemeral: false,
            max_volumes_per_node: 0,
            listen: SocketAddr::from(([0, 0, 0, 0], 7443)),
            sweep_workers: 1,
            sweep_period_secs: 60,
            backoff: Backoff::default(),
        }
    }
}

impl ArStorConfig {
    /// Local root of the array namespace.
    pub fn mount_path(&self) -> Result<PathBuf, CsiError> {
        if !self.mount_hash_dir {
            return Ok(self.mount_point.clone());
        }
        if self.shares.is_empty() {
            return Err(CsiError::InvalidArgument(
                "mount_hash_dir needs a shares name".into(),
            ));
        }
        Ok(self.mount_point.join(&self.shares))
    }

    pub fn sweep_period(&self) -> Duration {
        Duration::from_secs(self.sweep_period_secs.max(1))
    }

    pub fn validate(&self) -> Result<(), CsiError> {
        if self.node_id.is_empty() {
            return Err(CsiError::InvalidArgument("node_id must be set".into()));
        }
        if self.container.is_empty() {
            return Err(CsiError::InvalidArgument("container must be set".into()));
        }
        self.mount_path().map(|_| ())
    }

    /// Check the mount exists and create the volume and snapshot bases.
    pub async fn prepare_namespace(&self) -> Result<PathBuf, CsiError> {
        let root = self.mount_path()?;
        match tokio::fs::metadata(&root).await {
            Ok(meta) if meta.is_dir() => {}
            _ => {
                return Err(CsiError::Internal(format!(
                    "array mount point {} does not exist",
                    root.display()
                )));
            }
        }
        for kind in [ShardKind::Volume, ShardKind::Snapshot] {
            let base = root.join(kind.base().trim_start_matches('/'));
            tokio::fs::create_dir_all(&base)
                .await
                .map_err(|e| CsiError::Internal(format!("create {}: {e}", base.display())))?;
        }
        info!(root = %root.display(), "array namespace ready");
        Ok(root)
    }
}

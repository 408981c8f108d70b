//! The ArStor array tool.
//!
//! The array itself is opaque to the plugin: files are created, snapshotted
//! and cloned by the array's `mxTool`, and directory metadata is read back
//! through `zklist`.  [`StorageTool`] is the narrow seam the engine talks to;
//! [`ToolCommand`] drives the tool inside the array client container.

mod command;
#[cfg(test)]
pub(crate) mod fake;

pub use command::ToolCommand;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::path::Path;
use std::str::FromStr;

use crate::error::CsiError;

/// Storage-class parameter keys understood by [`CreateOptions`].
pub const PARAM_PAGE_SIZE: &str = "pageSize";
pub const PARAM_COMPRESSION: &str = "compression";
pub const PARAM_READ_CACHE: &str = "readCache";
pub const PARAM_MIRRORING: &str = "mirroring";

const PAGE_SIZES: [u32; 4] = [4096, 8192, 16384, 32768];
const MIRROR_COUNTS: [u8; 2] = [2, 3];

/// Operations the plugin needs from the array.
///
/// Paths named `*_rel` are relative to the array mount root (they start with
/// `/kubernetes/...`); `local_path` arguments are absolute paths on this
/// node.  Failures are reported as [`CsiError::BackendError`] carrying the
/// tool's raw output, which is how "directory full" is detected.
#[async_trait]
pub trait StorageTool: Send + Sync {
    /// Verify that the array client is up.
    async fn check_ready(&self) -> Result<(), CsiError>;

    /// Create `name` with `size` bytes inside the directory whose inode is
    /// `dir_inode`.
    async fn create(
        &self,
        name: &str,
        size: u64,
        dir_inode: u64,
        options: &CreateOptions,
    ) -> Result<String, CsiError>;

    /// Set the length of a local file.
    async fn truncate(&self, local_path: &Path, size: u64) -> Result<(), CsiError>;

    /// Copy-on-write snapshot of `src_rel` at `dst_rel`.
    async fn snapshot(&self, src_rel: &str, dst_rel: &str) -> Result<String, CsiError>;

    /// Writable clone of the snapshot `src_rel` at `dst_rel`.
    async fn clone_file(&self, src_rel: &str, dst_rel: &str) -> Result<String, CsiError>;

    /// Remove a volume file.
    async fn delete(&self, local_path: &Path) -> Result<(), CsiError>;

    /// Remove a snapshot file.
    async fn delete_snapshot(&self, local_path: &Path) -> Result<(), CsiError>;

    /// Raw attribute dump of the directory with the given inode.
    async fn directory_attributes(&self, inode: u64) -> Result<String, CsiError>;

    /// ID of the volume a snapshot file was cut from.
    async fn snapshot_source_volume_id(&self, inode: u64) -> Result<String, CsiError>;
}

/// Compression algorithm applied by the array.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Compression {
    #[default]
    Lz4,
    GzipOpt,
    GzipHigh,
    Disabled,
}

impl Compression {
    /// Name of the algorithm in the array's policy language.
    pub fn algorithm(self) -> &'static str {
        match self {
            Self::Lz4 => "COMPRESSION_ALGORITHM_LZ4",
            Self::GzipOpt => "COMPRESSION_ALGORITHM_GZIP_OPT",
            Self::GzipHigh => "COMPRESSION_ALGORITHM_GZIP_HIGH",
            Self::Disabled => "COMPRESSION_ALGORITHM_OFF",
        }
    }
}

impl FromStr for Compression {
    type Err = CsiError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "lz4" => Ok(Self::Lz4),
            "gzip_opt" => Ok(Self::GzipOpt),
            "gzip_high" => Ok(Self::GzipHigh),
            "disabled" => Ok(Self::Disabled),
            other => Err(CsiError::InvalidArgument(format!(
                "unsupported compression {other:?}"
            ))),
        }
    }
}

impl fmt::Display for Compression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Lz4 => "lz4",
            Self::GzipOpt => "gzip_opt",
            Self::GzipHigh => "gzip_high",
            Self::Disabled => "disabled",
        })
    }
}

/// Per-file placement policy passed to [`StorageTool::create`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateOptions {
    pub page_size: u32,
    pub compression: Compression,
    pub read_cache: bool,
    pub mirroring: u8,
}

impl Default for CreateOptions {
    fn default() -> Self {
        Self {
            page_size: 8192,
            compression: Compression::Lz4,
            read_cache: false,
            mirroring: 2,
        }
    }
}

impl CreateOptions {
    /// Parse and validate storage-class parameters.  Unknown keys are
    /// ignored; missing keys take the defaults.
    pub fn from_parameters(params: &HashMap<String, String>) -> Result<Self, CsiError> {
        let mut opts = Self::default();

        if let Some(raw) = params.get(PARAM_PAGE_SIZE) {
            let size: u32 = raw
                .parse()
                .map_err(|_| CsiError::InvalidArgument(format!("invalid pageSize {raw:?}")))?;
            if !PAGE_SIZES.contains(&size) {
                return Err(CsiError::InvalidArgument(format!(
                    "unsupported pageSize {size}, expected one of {PAGE_SIZES:?}"
                )));
            }
            opts.page_size = size;
        }

        if let Some(raw) = params.get(PARAM_COMPRESSION) {
            opts.compression = raw.parse()?;
        }

        if let Some(raw) = params.get(PARAM_READ_CACHE) {
            opts.read_cache = raw.to_ascii_lowercase().parse().map_err(|_| {
                CsiError::InvalidArgument(format!("invalid readCache {raw:?}"))
            })?;
        }

        if let Some(raw) = params.get(PARAM_MIRRORING) {
            let mirrors: u8 = raw
                .parse()
                .map_err(|_| CsiError::InvalidArgument(format!("invalid mirroring {raw:?}")))?;
            if !MIRROR_COUNTS.contains(&mirrors) {
                return Err(CsiError::InvalidArgument(format!(
                    "unsupported mirroring {mirrors}, expected one of {MIRROR_COUNTS:?}"
                )));
            }
            opts.mirroring = mirrors;
        }

        Ok(opts)
    }

    /// Render the policy string `mxTool -c createfile` expects.
    pub fn policy(&self) -> String {
        format!(
            "localFS: {{pageSize: {}, compression: true, readCache: {}, compressionAlgorithm: {}}}, \
             mirroring: {{numberOfMirrors: {}}}",
            self.page_size,
            self.read_cache,
            self.compression.algorithm(),
            self.mirroring
        )
    }
}

/// Number of directory entries in a `zklist -r` attribute dump.
///
/// The dump lists the directory under a `dirList` key and introduces every
/// child with a `dEntries` marker, plus one for the directory itself.
/// Returns `None` when the dump has no `dirList` section.
pub fn parse_dir_entry_count(attributes: &str) -> Option<usize> {
    let (_, listing) = attributes.split_once("dirList")?;
    Some(listing.matches("dEntries").count().saturating_sub(1))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn defaults_when_no_parameters() {
        let opts = CreateOptions::from_parameters(&HashMap::new()).unwrap();
        assert_eq!(opts, CreateOptions::default());
        assert_eq!(
            opts.policy(),
            "localFS: {pageSize: 8192, compression: true, readCache: false, \
             compressionAlgorithm: COMPRESSION_ALGORITHM_LZ4}, mirroring: {numberOfMirrors: 2}"
        );
    }

    #[test]
    fn parses_all_parameters() {
        let opts = CreateOptions::from_parameters(&params(&[
            ("pageSize", "16384"),
            ("compression", "gzip_high"),
            ("readCache", "True"),
            ("mirroring", "3"),
            ("csi.storage.k8s.io/pvc/name", "ignored"),
        ]))
        .unwrap();
        assert_eq!(opts.page_size, 16384);
        assert_eq!(opts.compression, Compression::GzipHigh);
        assert!(opts.read_cache);
        assert_eq!(opts.mirroring, 3);
        assert!(opts.policy().contains("COMPRESSION_ALGORITHM_GZIP_HIGH"));
    }

    #[test]
    fn rejects_out_of_range_values() {
        for bad in [
            ("pageSize", "1000"),
            ("pageSize", "big"),
            ("compression", "zstd"),
            ("readCache", "maybe"),
            ("mirroring", "4"),
        ] {
            let err = CreateOptions::from_parameters(&params(&[bad])).unwrap_err();
            assert!(matches!(err, CsiError::InvalidArgument(_)), "{bad:?}");
        }
    }

    #[test]
    fn dir_entry_count() {
        let dump = "inode: 42\ndirList: [ dEntries: self, dEntries: a, dEntries: b ]";
        assert_eq!(parse_dir_entry_count(dump), Some(2));
        assert_eq!(parse_dir_entry_count("dirList: [ dEntries: self ]"), Some(0));
        assert_eq!(parse_dir_entry_count("dirList: []"), Some(0));
        assert_eq!(parse_dir_entry_count("no listing here"), None);
    }
}

//! Filesystem mounting, formatting and resizing on the node.

use std::path::Path;
use std::sync::Arc;

use nix::mount::MsFlags;
use tracing::{debug, info, warn};

use crate::error::CsiError;
use crate::exec::CommandRunner;

/// Filesystem used when a capability does not name one.
pub const DEFAULT_FS_TYPE: &str = "xfs";

/// Reported for a device carrying a partition table, so it is never
/// formatted over.
pub const PARTITIONED: &str = "unknown data, probably partitions";

/// Return `true` if `path` is currently listed as a mount point in
/// `/proc/self/mounts`.
///
/// `/proc/self/mounts` escapes whitespace in octal; kubelet paths contain
/// none, so a plain comparison is enough.
pub async fn is_mountpoint(path: &str) -> bool {
    let contents = match tokio::fs::read_to_string("/proc/self/mounts").await {
        Ok(c) => c,
        Err(_) => return false,
    };
    // <device> <mountpoint> <fstype> <options> <dump> <pass>
    contents
        .lines()
        .any(|line| line.split_whitespace().nth(1) == Some(path))
}

/// `mkfs` program and leading arguments for `fs_type`.
fn mkfs_command(fs_type: &str) -> Result<(&'static str, &'static [&'static str]), CsiError> {
    match fs_type {
        "ext3" => Ok(("mkfs.ext3", &["-F", "-m0"][..])),
        "ext4" => Ok(("mkfs.ext4", &["-F", "-m0"][..])),
        "xfs" => Ok(("mkfs.xfs", &["-f"][..])),
        other => Err(CsiError::InvalidArgument(format!(
            "unsupported filesystem {other}"
        ))),
    }
}

/// Split mount options into kernel flags and the filesystem data string.
fn mount_flags(options: &[String]) -> (MsFlags, String) {
    let mut flags = MsFlags::empty();
    let mut data = Vec::new();
    for opt in options {
        match opt.as_str() {
            "ro" => flags |= MsFlags::MS_RDONLY,
            "rw" | "defaults" => {}
            "noatime" => flags |= MsFlags::MS_NOATIME,
            "nodiratime" => flags |= MsFlags::MS_NODIRATIME,
            "nosuid" => flags |= MsFlags::MS_NOSUID,
            "nodev" => flags |= MsFlags::MS_NODEV,
            "noexec" => flags |= MsFlags::MS_NOEXEC,
            "sync" => flags |= MsFlags::MS_SYNCHRONOUS,
            other => data.push(other),
        }
    }
    (flags, data.join(","))
}

/// Pull the filesystem type out of `blkid -o export` output.
fn parse_blkid(output: &str) -> Option<String> {
    let by_sep = |sep: char| {
        let mut fs_type = None;
        let mut pt_type = None;
        for field in output.split(sep).map(str::trim).filter(|f| !f.is_empty()) {
            match field.split_once('=') {
                Some(("TYPE", v)) => fs_type = Some(v.trim_matches('"').to_owned()),
                Some(("PTTYPE", v)) => pt_type = Some(v.trim_matches('"').to_owned()),
                _ => {}
            }
        }
        if pt_type.is_some_and(|p| !p.is_empty()) {
            return Some(PARTITIONED.to_owned());
        }
        fs_type.filter(|t| !t.is_empty())
    };
    by_sep('\n').or_else(|| by_sep(' '))
}

pub struct Mounter {
    runner: Arc<dyn CommandRunner>,
}

impl Mounter {
    pub fn new(runner: Arc<dyn CommandRunner>) -> Self {
        Self { runner }
    }

    /// Filesystem on `device`; empty when it is unformatted.
    pub async fn disk_format(&self, device: &str) -> Result<String, CsiError> {
        let out = self
            .runner
            .run(
                "blkid",
                &["-p", "-s", "TYPE", "-s", "PTTYPE", "-o", "export", device],
                None,
            )
            .await?;
        if out.status == Some(2) {
            // No TYPE/PTTYPE token: nothing on the device.
            return Ok(String::new());
        }
        if !out.success() {
            return Err(CsiError::BackendError(format!(
                "blkid {device}: {}",
                out.combined().trim()
            )));
        }
        let format = parse_blkid(&out.stdout).ok_or_else(|| {
            CsiError::BackendError(format!("blkid returned invalid output: {}", out.stdout.trim()))
        })?;
        debug!(%device, %format, "detected disk format");
        Ok(format)
    }

    /// Create `fs_type` on `device`.
    pub async fn format(&self, device: &str, fs_type: &str) -> Result<(), CsiError> {
        let (program, args) = mkfs_command(fs_type)?;
        let mut argv: Vec<&str> = args.to_vec();
        argv.push(device);
        self.runner.run_checked(program, &argv).await?;
        info!(%device, %fs_type, "filesystem created");
        Ok(())
    }

    /// Format `device` with `fs_type` unless it already carries it.  A
    /// device holding another filesystem or a partition table is refused,
    /// never reformatted.
    pub async fn ensure_format(&self, device: &str, fs_type: &str) -> Result<(), CsiError> {
        let existing = self.disk_format(device).await?;
        if existing.is_empty() {
            return self.format(device, fs_type).await;
        }
        if existing != fs_type {
            return Err(CsiError::MountFailed {
                path: device.to_owned(),
                reason: format!("{device} holds {existing}, requested {fs_type}"),
            });
        }
        Ok(())
    }

    /// Mount `device` at `target`, formatting it first when it is blank.
    pub async fn format_and_mount(
        &self,
        device: &str,
        target: &str,
        fs_type: &str,
        options: &[String],
    ) -> Result<(), CsiError> {
        let mount_failed = |reason: String| CsiError::MountFailed {
            path: target.to_owned(),
            reason,
        };

        tokio::fs::create_dir_all(target)
            .await
            .map_err(|e| mount_failed(e.to_string()))?;

        self.ensure_format(device, fs_type).await?;

        let (flags, data) = mount_flags(options);
        nix::mount::mount(
            Some(device),
            target,
            Some(fs_type),
            flags,
            (!data.is_empty()).then_some(data.as_str()),
        )
        .map_err(|e| mount_failed(e.to_string()))?;

        info!(%device, %target, %fs_type, "filesystem mounted");
        Ok(())
    }

    /// Bind-mount `source` onto `target`, read-only when asked.
    pub fn bind_mount(&self, source: &str, target: &str, read_only: bool) -> Result<(), CsiError> {
        let mount_failed = |reason: String| CsiError::MountFailed {
            path: target.to_owned(),
            reason,
        };

        let mut flags = MsFlags::MS_BIND;
        if read_only {
            flags |= MsFlags::MS_RDONLY;
        }
        nix::mount::mount(Some(source), target, None::<&str>, flags, None::<&str>)
            .map_err(|e| mount_failed(e.to_string()))?;

        // MS_RDONLY is ignored on the initial bind; it takes a remount.
        if read_only {
            nix::mount::mount(
                None::<&str>,
                target,
                None::<&str>,
                MsFlags::MS_BIND | MsFlags::MS_REMOUNT | MsFlags::MS_RDONLY,
                None::<&str>,
            )
            .map_err(|e| mount_failed(format!("remount read-only: {e}")))?;
        }

        debug!(%source, %target, read_only, "bind mounted");
        Ok(())
    }

    pub fn unmount(&self, target: &str) -> Result<(), CsiError> {
        nix::mount::umount(target).map_err(|e| CsiError::UnmountFailed {
            path: target.to_owned(),
            reason: e.to_string(),
        })?;
        debug!(%target, "unmounted");
        Ok(())
    }

    /// Unmount `target` if mounted, then remove it (directory or file).
    pub async fn unmount_and_remove(&self, target: &str) -> Result<(), CsiError> {
        if is_mountpoint(target).await {
            self.unmount(target)?;
        } else {
            warn!(%target, "target not mounted");
        }
        remove_target(Path::new(target)).await
    }

    /// Grow the filesystem on `device` to fill it.  Returns `false` when the
    /// device is unformatted and there is nothing to grow.
    pub async fn resize(&self, device: &str, mount_path: &str) -> Result<bool, CsiError> {
        let format = self.disk_format(device).await?;
        match format.as_str() {
            "" => Ok(false),
            "ext3" | "ext4" => {
                self.runner.run_checked("resize2fs", &[device]).await?;
                info!(%device, "filesystem resized");
                Ok(true)
            }
            "xfs" => {
                self.runner.run_checked("xfs_growfs", &["-d", mount_path]).await?;
                info!(%device, %mount_path, "filesystem resized");
                Ok(true)
            }
            other => Err(CsiError::Internal(format!(
                "resize of {other} is not supported for {device} mounted at {mount_path}"
            ))),
        }
    }
}

/// Remove a mount target, whether directory or file; already gone is fine.
pub async fn remove_target(path: &Path) -> Result<(), CsiError> {
    let result = match tokio::fs::symlink_metadata(path).await {
        Ok(meta) if meta.is_dir() => tokio::fs::remove_dir(path).await,
        Ok(_) => tokio::fs::remove_file(path).await,
        Err(e) => Err(e),
    };
    match result {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(CsiError::UnmountFailed {
            path: path.display().to_string(),
            reason: e.to_string(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exec::CommandOutput;
    use crate::exec::fake::ScriptedRunner;

    #[test]
    fn blkid_output_parsing() {
        assert_eq!(
            parse_blkid("DEVNAME=/dev/loop0\nTYPE=xfs\n").as_deref(),
            Some("xfs")
        );
        assert_eq!(
            parse_blkid("DEVNAME=/dev/loop0 TYPE=\"ext4\"").as_deref(),
            Some("ext4")
        );
        assert_eq!(
            parse_blkid("DEVNAME=/dev/loop0\nPTTYPE=dos\n").as_deref(),
            Some(PARTITIONED)
        );
        assert_eq!(parse_blkid("garbage"), None);
    }

    #[test]
    fn mount_options_split_into_flags_and_data() {
        let (flags, data) = mount_flags(&[
            "ro".to_owned(),
            "noatime".to_owned(),
            "nouuid".to_owned(),
            "discard".to_owned(),
        ]);
        assert!(flags.contains(MsFlags::MS_RDONLY | MsFlags::MS_NOATIME));
        assert_eq!(data, "nouuid,discard");
    }

    #[tokio::test]
    async fn disk_format_treats_exit_two_as_blank() {
        let runner = Arc::new(ScriptedRunner::new(|_, _, _| CommandOutput::failed(2, "")));
        assert_eq!(Mounter::new(runner).disk_format("/dev/loop0").await.unwrap(), "");

        let runner = Arc::new(ScriptedRunner::new(|_, _, _| CommandOutput::failed(4, "bad")));
        assert!(Mounter::new(runner).disk_format("/dev/loop0").await.is_err());
    }

    #[tokio::test]
    async fn format_and_mount_refuses_other_filesystem() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("staging");
        let runner = Arc::new(ScriptedRunner::new(|_, _, _| CommandOutput::ok("TYPE=ext4\n")));
        let mounter = Mounter::new(runner.clone());

        let err = mounter
            .format_and_mount("/dev/loop0", target.to_str().unwrap(), "xfs", &[])
            .await
            .unwrap_err();
        assert!(matches!(err, CsiError::MountFailed { .. }));
        assert_eq!(runner.count("mkfs"), 0);
    }

    #[tokio::test]
    async fn ensure_format_formats_blank_only() {
        let runner = Arc::new(ScriptedRunner::new(|program, args, _| {
            match (program, args.last().map(String::as_str)) {
                ("blkid", Some("/dev/loop0")) => CommandOutput::failed(2, ""),
                ("blkid", Some("/dev/loop1")) => CommandOutput::ok("TYPE=ext4\n"),
                ("blkid", _) => CommandOutput::ok("PTTYPE=dos\n"),
                _ => CommandOutput::ok(""),
            }
        }));
        let mounter = Mounter::new(runner.clone());

        mounter.ensure_format("/dev/loop0", "xfs").await.unwrap();
        assert_eq!(runner.count("mkfs.xfs -f /dev/loop0"), 1);
        mounter.ensure_format("/dev/loop1", "ext4").await.unwrap();
        assert!(matches!(
            mounter.ensure_format("/dev/loop1", "xfs").await,
            Err(CsiError::MountFailed { .. })
        ));
        assert!(mounter.ensure_format("/dev/loop2", "xfs").await.is_err());
        assert_eq!(runner.count("mkfs"), 1);
    }

    #[tokio::test]
    async fn resize_picks_tool_by_format() {
        let runner = Arc::new(ScriptedRunner::new(|program, args, _| match program {
            "blkid" if args.last().map(String::as_str) == Some("/dev/loop1") => {
                CommandOutput::ok("TYPE=ext4\n")
            }
            "blkid" if args.last().map(String::as_str) == Some("/dev/loop2") => {
                CommandOutput::ok("TYPE=xfs\n")
            }
            "blkid" if args.last().map(String::as_str) == Some("/dev/loop3") => {
                CommandOutput::ok("TYPE=btrfs\n")
            }
            "blkid" => CommandOutput::failed(2, ""),
            _ => CommandOutput::ok(""),
        }));
        let mounter = Mounter::new(runner.clone());

        assert!(mounter.resize("/dev/loop1", "/mnt/a").await.unwrap());
        assert!(mounter.resize("/dev/loop2", "/mnt/b").await.unwrap());
        assert!(!mounter.resize("/dev/loop0", "/mnt/c").await.unwrap());
        assert!(mounter.resize("/dev/loop3", "/mnt/d").await.is_err());
        assert_eq!(runner.count("resize2fs /dev/loop1"), 1);
        assert_eq!(runner.count("xfs_growfs -d /mnt/b"), 1);
    }

    #[tokio::test]
    async fn format_uses_mkfs_for_type() {
        let runner = Arc::new(ScriptedRunner::new(|_, _, _| CommandOutput::ok("")));
        let mounter = Mounter::new(runner.clone());
        mounter.format("/dev/loop0", "ext4").await.unwrap();
        assert_eq!(runner.count("mkfs.ext4 -F -m0 /dev/loop0"), 1);
        assert!(matches!(
            mounter.format("/dev/loop0", "ntfs").await,
            Err(CsiError::InvalidArgument(_))
        ));
    }

    #[tokio::test]
    async fn remove_target_handles_files_dirs_and_absence() {
        let dir = tempfile::tempdir().unwrap();
        let sub = dir.path().join("d");
        let file = dir.path().join("f");
        std::fs::create_dir(&sub).unwrap();
        std::fs::write(&file, b"").unwrap();

        remove_target(&sub).await.unwrap();
        remove_target(&file).await.unwrap();
        remove_target(&dir.path().join("missing")).await.unwrap();
        assert!(!sub.exists() && !file.exists());
    }

    #[tokio::test]
    async fn not_a_mountpoint() {
        let dir = tempfile::tempdir().unwrap();
        assert!(!is_mountpoint(dir.path().to_str().unwrap()).await);
    }
}

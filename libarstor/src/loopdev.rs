//! Loop devices over array files.
//!
//! Block access to a volume goes through a loop device bound to its backing
//! file.  [`LoopDeviceManager`] wraps `losetup`, `fdisk` and `kpartx`, and
//! runs the background sweep that releases devices whose backing file was
//! unlinked while still attached.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::{Mutex, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};

use crate::allocator::ShardKind;
use crate::error::CsiError;
use crate::exec::CommandRunner;

/// Marker the array leaves in the path of a file deleted while open.
pub const LOST_FILE_MARKER: &str = "/.nfs";

/// Answer sequence for `fdisk`: one primary partition spanning the device.
const FDISK_SCRIPT: &str = "n\np\n1\n\n\nw\n";

const MAPPER_DIR: &str = "/dev/mapper/";

/// Loop device behind `device`: `/dev/mapper/loop3p1` maps back to
/// `/dev/loop3`, anything else is returned unchanged.
pub fn loop_device_of(device: &str) -> String {
    device
        .strip_prefix(MAPPER_DIR)
        .and_then(|name| name.rsplit_once('p'))
        .filter(|(lo, part)| {
            lo.starts_with("loop") && !part.is_empty() && part.bytes().all(|b| b.is_ascii_digit())
        })
        .map_or_else(|| device.to_owned(), |(lo, _)| format!("/dev/{lo}"))
}

/// One `losetup` binding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoopBinding {
    pub device: String,
    pub backing_file: String,
}

impl LoopBinding {
    /// A binding whose backing volume file is gone.
    pub fn is_lost(&self) -> bool {
        self.backing_file.contains(ShardKind::Volume.prefix())
            && self.backing_file.contains(LOST_FILE_MARKER)
    }
}

/// Outcome of one sweep pass, keyed by backing file.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SweepReport {
    pub detached: Vec<String>,
    pub failed: HashMap<String, String>,
}

impl SweepReport {
    pub fn is_empty(&self) -> bool {
        self.detached.is_empty() && self.failed.is_empty()
    }
}

pub struct LoopDeviceManager {
    runner: Arc<dyn CommandRunner>,
    /// Per-file locks held across detach and delete of a lost binding.
    deleting: DashMap<PathBuf, Arc<Mutex<()>>>,
}

impl LoopDeviceManager {
    pub fn new(runner: Arc<dyn CommandRunner>) -> Self {
        Self {
            runner,
            deleting: DashMap::new(),
        }
    }

    /// Every current binding.
    pub async fn list_bindings(&self) -> Result<Vec<LoopBinding>, CsiError> {
        let out = self
            .runner
            .run_checked(
                "losetup",
                &["--list", "--noheadings", "--output", "NAME,BACK-FILE"],
            )
            .await?;
        Ok(parse_bindings(&out))
    }

    /// Loop devices bound to `file`.
    pub async fn devices_for_file(&self, file: &Path) -> Result<Vec<String>, CsiError> {
        let file = file.to_string_lossy().into_owned();
        let out = self
            .runner
            .run_checked("losetup", &["-j", file.as_str()])
            .await?;
        Ok(out
            .lines()
            .filter_map(|line| line.split(':').next())
            .map(str::trim)
            .filter(|dev| dev.contains("loop"))
            .map(str::to_owned)
            .collect())
    }

    pub async fn free_device(&self) -> Result<String, CsiError> {
        let out = self.runner.run_checked("losetup", &["-f"]).await?;
        let device = out.trim();
        if device.is_empty() {
            return Err(CsiError::BackendError("no free loop device".into()));
        }
        Ok(device.to_owned())
    }

    /// Device bound to `file`, binding a free one when there is none.
    #[instrument(skip(self), fields(file = %file.display()))]
    pub async fn attach(&self, file: &Path) -> Result<String, CsiError> {
        let devices = self.devices_for_file(file).await?;
        match devices.as_slice() {
            [] => {
                let device = self.free_device().await?;
                let path = file.to_string_lossy().into_owned();
                self.runner
                    .run_checked("losetup", &[device.as_str(), path.as_str()])
                    .await?;
                info!(%device, "loop device attached");
                Ok(device)
            }
            [device] => {
                debug!(%device, "file already attached");
                Ok(device.clone())
            }
            many => Err(CsiError::Internal(format!(
                "{} is bound to multiple loop devices: {}",
                file.display(),
                many.join(", ")
            ))),
        }
    }

    /// Release `device`.  A device that is already gone counts as released.
    pub async fn detach(&self, device: &str) -> Result<(), CsiError> {
        let out = self.runner.run("losetup", &["-d", device], None).await?;
        if out.success() {
            info!(%device, "loop device detached");
            return Ok(());
        }
        let text = out.combined().to_lowercase();
        if text.contains("no such device") || text.contains("not found") {
            debug!(%device, "loop device already detached");
            return Ok(());
        }
        Err(CsiError::BackendError(format!(
            "losetup -d {device}: {}",
            out.combined().trim()
        )))
    }

    pub async fn detach_by_backing_file(&self, file: &Path) -> Result<(), CsiError> {
        for device in self.devices_for_file(file).await? {
            self.detach(&device).await?;
        }
        Ok(())
    }

    /// Detach every volume binding whose backing file mentions `volume_id`.
    /// Used when the volume itself is no longer known.
    pub async fn detach_by_volume_id(&self, volume_id: &str) -> Result<(), CsiError> {
        let bindings = self.list_bindings().await?;
        for binding in bindings.iter().filter(|b| {
            b.backing_file.contains(ShardKind::Volume.prefix()) && b.backing_file.contains(volume_id)
        }) {
            warn!(device = %binding.device, file = %binding.backing_file, %volume_id, "detaching binding of unknown volume");
            self.detach(&binding.device).await?;
        }
        Ok(())
    }

    /// Re-read the size of the backing file after it grew.
    pub async fn refresh_capacity(&self, device: &str) -> Result<(), CsiError> {
        self.runner.run_checked("losetup", &["-c", device]).await?;
        Ok(())
    }

    /// Source device of the filesystem mounted at `mount_point`.
    pub async fn device_for_mount_point(&self, mount_point: &str) -> Result<Option<String>, CsiError> {
        let out = self
            .runner
            .run_checked(
                "findmnt",
                &["-o", "source", "--noheadings", "--target", mount_point],
            )
            .await?;
        let device = out.trim();
        Ok((!device.is_empty()).then(|| device.to_owned()))
    }

    /// First partition of `device`, if it has one.
    pub async fn partition(&self, device: &str) -> Result<Option<String>, CsiError> {
        let out = self.runner.run_checked("fdisk", &["-l", device]).await?;
        Ok(out
            .lines()
            .filter(|l| l.starts_with("/dev/loop"))
            .find_map(|l| l.split_whitespace().next())
            .map(str::to_owned))
    }

    /// Write a single primary partition covering `device`.
    pub async fn create_partition(&self, device: &str) -> Result<(), CsiError> {
        let out = self.runner.run("fdisk", &[device], Some(FDISK_SCRIPT)).await?;
        // fdisk exits non-zero when the kernel keeps the old table, even
        // though the partition was written.
        if out.success() || out.combined().contains("Created a new partition") {
            info!(%device, "partition created");
            return Ok(());
        }
        Err(CsiError::BackendError(format!(
            "fdisk {device}: {}",
            out.combined().trim()
        )))
    }

    /// Map the partitions of `device`; returns the first mapper name.
    pub async fn add_mapping(&self, device: &str) -> Result<String, CsiError> {
        let out = self.runner.run_checked("kpartx", &["-av", device]).await?;
        // add map loop0p1 (253:0): 0 2095104 linear 7:0 2048
        out.lines()
            .find_map(|l| l.split_whitespace().nth(2))
            .map(str::to_owned)
            .ok_or_else(|| CsiError::BackendError(format!("kpartx mapped nothing for {device}")))
    }

    pub async fn delete_mapping(&self, device: &str) -> Result<(), CsiError> {
        self.runner.run_checked("kpartx", &["-d", device]).await?;
        Ok(())
    }

    pub async fn list_mappings(&self, device: &str) -> Result<Vec<String>, CsiError> {
        let out = self.runner.run_checked("kpartx", &["-lv", device]).await?;
        Ok(out
            .lines()
            .filter_map(|l| l.split_whitespace().next())
            .map(str::to_owned)
            .collect())
    }

    /// `/dev/mapper/<name>`, which must be a block device.
    pub async fn mapper_device(&self, name: &str) -> Result<String, CsiError> {
        let path = format!("{MAPPER_DIR}{name}");
        let out = self
            .runner
            .run_checked("stat", &["-L", "-c", "%F", path.as_str()])
            .await?;
        if out.trim() != "block special file" {
            return Err(CsiError::BackendError(format!(
                "{path} is not a block device: {}",
                out.trim()
            )));
        }
        Ok(path)
    }

    /// Mapper device of the first partition of `device`, writing a single
    /// partition first when the table is empty.
    #[instrument(skip(self))]
    pub async fn partitioned_mapper(&self, device: &str) -> Result<String, CsiError> {
        let partition = match self.partition(device).await? {
            Some(p) => p,
            None => {
                self.create_partition(device).await?;
                self.partition(device).await?.ok_or_else(|| {
                    CsiError::BackendError(format!("no partition on {device} after fdisk"))
                })?
            }
        };
        let name = self.add_mapping(device).await?;
        if !partition.ends_with(&name) {
            return Err(CsiError::Internal(format!(
                "mapper {name} does not match partition {partition} of {device}"
            )));
        }
        let mapper = self.mapper_device(&name).await?;
        info!(%device, %mapper, "partition mapped");
        Ok(mapper)
    }

    /// Drop the partition mappings of `device` before it is detached.
    pub async fn release_mappings(&self, device: &str) -> Result<(), CsiError> {
        if self.list_mappings(device).await?.is_empty() {
            return Ok(());
        }
        self.delete_mapping(device).await?;
        debug!(%device, "partition mappings removed");
        Ok(())
    }

    /// One sweep pass: detach every lost binding, then delete its file.
    #[instrument(skip(self))]
    pub async fn detach_lost_loop_devices(&self) -> Result<SweepReport, CsiError> {
        let mut report = SweepReport::default();
        for binding in self.list_bindings().await?.into_iter().filter(LoopBinding::is_lost) {
            match self.release_lost(&binding).await {
                Ok(true) => report.detached.push(binding.backing_file),
                Ok(false) => {}
                Err(e) => {
                    warn!(device = %binding.device, file = %binding.backing_file, error = %e, "lost loop device not released");
                    report.failed.insert(binding.backing_file, e.to_string());
                }
            }
        }
        Ok(report)
    }

    /// Detach and delete one lost binding under its file lock.  Returns
    /// `false` when the listing was stale and there was nothing to do.
    async fn release_lost(&self, binding: &LoopBinding) -> Result<bool, CsiError> {
        let file = Path::new(&binding.backing_file);
        let lock = self
            .deleting
            .entry(file.to_path_buf())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        let result = {
            let _guard = lock.lock().await;
            self.release_lost_locked(&binding.device, file).await
        };
        drop(lock);
        self.deleting
            .remove_if(file, |_, lock| Arc::strong_count(lock) == 1);
        result
    }

    async fn release_lost_locked(&self, device: &str, file: &Path) -> Result<bool, CsiError> {
        if !tokio::fs::try_exists(file).await? {
            debug!(file = %file.display(), "lost file already removed");
            return Ok(false);
        }
        // The device may have been freed and bound to a live file since
        // the listing.
        if !self.devices_for_file(file).await?.iter().any(|d| d == device) {
            debug!(%device, file = %file.display(), "device no longer bound to lost file");
            return Ok(false);
        }
        self.detach(device).await?;
        match tokio::fs::remove_file(file).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(true),
            Err(e) => Err(CsiError::BackendError(format!(
                "remove {}: {e}",
                file.display()
            ))),
        }
    }

    /// Spawn `workers` sweep loops that run every `period` until `stop`
    /// turns true or its sender is dropped.
    pub fn run_detach_lost_loop_devices(
        self: &Arc<Self>,
        workers: usize,
        period: Duration,
        stop: watch::Receiver<bool>,
    ) -> Vec<JoinHandle<()>> {
        (0..workers)
            .map(|worker| {
                let manager = Arc::clone(self);
                let mut stop = stop.clone();
                tokio::spawn(async move {
                    let mut ticker = tokio::time::interval(period);
                    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
                    while !*stop.borrow() {
                        tokio::select! {
                            _ = ticker.tick() => match manager.detach_lost_loop_devices().await {
                                Ok(report) if !report.is_empty() => info!(
                                    worker,
                                    detached = report.detached.len(),
                                    failed = report.failed.len(),
                                    "lost loop device sweep",
                                ),
                                Ok(_) => {}
                                Err(e) => warn!(worker, error = %e, "lost loop device sweep failed"),
                            },
                            changed = stop.changed() => {
                                if changed.is_err() {
                                    break;
                                }
                            }
                        }
                    }
                    debug!(worker, "sweep worker stopped");
                })
            })
            .collect()
    }
}

/// Parse `losetup --list --noheadings --output NAME,BACK-FILE`.
fn parse_bindings(out: &str) -> Vec<LoopBinding> {
    out.lines()
        .filter_map(|line| {
            let (device, file) = line.trim().split_once(char::is_whitespace)?;
            let file = file.trim();
            (!file.is_empty()).then(|| LoopBinding {
                device: device.to_owned(),
                backing_file: file.to_owned(),
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exec::CommandOutput;
    use crate::exec::fake::ScriptedRunner;
    use std::sync::Mutex as StdMutex;

    /// A scripted `losetup` that keeps its bindings in memory.
    fn losetup_world(initial: Vec<(&str, String)>) -> Arc<ScriptedRunner> {
        losetup_world_with(initial, &[])
    }

    /// Like [`losetup_world`], but detaching any of `busy` fails.
    fn losetup_world_with(initial: Vec<(&str, String)>, busy: &[&str]) -> Arc<ScriptedRunner> {
        let busy: Vec<String> = busy.iter().map(|d| (*d).to_owned()).collect();
        let bindings: Arc<StdMutex<Vec<(String, String)>>> = Arc::new(StdMutex::new(
            initial
                .into_iter()
                .map(|(d, f)| (d.to_owned(), f))
                .collect(),
        ));
        Arc::new(ScriptedRunner::new(move |program, args, _| {
            assert_eq!(program, "losetup");
            let mut b = bindings.lock().unwrap();
            match args[0].as_str() {
                "--list" => CommandOutput::ok(
                    b.iter()
                        .map(|(d, f)| format!("{d} {f}\n"))
                        .collect::<String>(),
                ),
                "-j" => CommandOutput::ok(
                    b.iter()
                        .filter(|(_, f)| *f == args[1])
                        .map(|(d, f)| format!("{d}: [2049]:1234 ({f})\n"))
                        .collect::<String>(),
                ),
                "-f" => CommandOutput::ok(format!("/dev/loop{}\n", b.len() + 7)),
                "-d" if busy.contains(&args[1]) => CommandOutput::failed(
                    1,
                    format!("losetup: {}: detach failed: Device or resource busy", args[1]),
                ),
                "-d" => {
                    let before = b.len();
                    b.retain(|(d, _)| *d != args[1]);
                    if b.len() == before {
                        CommandOutput::failed(1, format!("losetup: {}: detach failed: No such device or address", args[1]))
                    } else {
                        CommandOutput::ok("")
                    }
                }
                _ => {
                    b.push((args[0].clone(), args[1].clone()));
                    CommandOutput::ok("")
                }
            }
        }))
    }

    #[tokio::test]
    async fn attach_is_idempotent() {
        let runner = losetup_world(vec![]);
        let mgr = LoopDeviceManager::new(runner.clone());
        let file = Path::new("/mnt/arstor/kubernetes/volumes/volume_3/v1_data");

        let first = mgr.attach(file).await.unwrap();
        let second = mgr.attach(file).await.unwrap();
        assert_eq!(first, "/dev/loop7");
        assert_eq!(first, second);
        assert_eq!(runner.count("losetup -f"), 1);
        assert_eq!(runner.count("losetup /dev/loop7"), 1);
        assert_eq!(mgr.devices_for_file(file).await.unwrap(), vec!["/dev/loop7"]);
    }

    #[tokio::test]
    async fn attach_rejects_multiple_bindings() {
        let file = "/a/kubernetes/volumes/volume_1/v_x".to_owned();
        let runner = losetup_world(vec![("/dev/loop0", file.clone()), ("/dev/loop1", file.clone())]);
        let err = LoopDeviceManager::new(runner)
            .attach(Path::new(&file))
            .await
            .unwrap_err();
        assert!(matches!(err, CsiError::Internal(_)));
    }

    #[tokio::test]
    async fn detach_tolerates_missing_device() {
        let runner = losetup_world(vec![]);
        let mgr = LoopDeviceManager::new(runner);
        mgr.detach("/dev/loop42").await.unwrap();

        let other = Arc::new(ScriptedRunner::new(|_, _, _| {
            CommandOutput::failed(1, "losetup: /dev/loop1: detach failed: Device or resource busy")
        }));
        assert!(LoopDeviceManager::new(other).detach("/dev/loop1").await.is_err());
    }

    #[tokio::test]
    async fn detach_by_volume_id_matches_backing_file() {
        let runner = losetup_world(vec![
            ("/dev/loop0", "/m/kubernetes/volumes/volume_1/aaa_x".to_owned()),
            ("/dev/loop1", "/m/kubernetes/volumes/volume_2/bbb_y".to_owned()),
        ]);
        let mgr = LoopDeviceManager::new(runner.clone());
        mgr.detach_by_volume_id("bbb").await.unwrap();
        assert_eq!(runner.count("losetup -d /dev/loop1"), 1);
        assert_eq!(runner.count("losetup -d /dev/loop0"), 0);
    }

    #[tokio::test]
    async fn sweep_releases_only_lost_volume_files() {
        let root = tempfile::tempdir().unwrap();
        let shard = root.path().join("kubernetes/volumes/volume_12");
        std::fs::create_dir_all(&shard).unwrap();
        let lost = shard.join(".nfs000000001234");
        std::fs::write(&lost, b"stale").unwrap();
        let live = shard.join("v2_data");
        std::fs::write(&live, b"live").unwrap();
        let outside = root.path().join("tmp/.nfs0000abcd");

        let runner = losetup_world(vec![
            ("/dev/loop0", lost.display().to_string()),
            ("/dev/loop1", live.display().to_string()),
            ("/dev/loop2", outside.display().to_string()),
        ]);
        let mgr = LoopDeviceManager::new(runner.clone());
        let report = mgr.detach_lost_loop_devices().await.unwrap();

        assert_eq!(report.detached, vec![lost.display().to_string()]);
        assert!(report.failed.is_empty());
        assert!(!lost.exists());
        assert!(live.exists());
        assert_eq!(runner.count("losetup -d"), 1);
        assert_eq!(runner.count("losetup -d /dev/loop0"), 1);

        // Nothing left to do on the next pass.
        assert!(mgr.detach_lost_loop_devices().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn sweep_reports_failures_without_stopping() {
        let root = tempfile::tempdir().unwrap();
        let shard = root.path().join("kubernetes/volumes/volume_1");
        std::fs::create_dir_all(&shard).unwrap();
        let busy = shard.join(".nfs01");
        let free = shard.join(".nfs02");
        std::fs::write(&busy, b"x").unwrap();
        std::fs::write(&free, b"x").unwrap();

        let runner = losetup_world_with(
            vec![
                ("/dev/loop0", busy.display().to_string()),
                ("/dev/loop1", free.display().to_string()),
            ],
            &["/dev/loop0"],
        );
        let report = LoopDeviceManager::new(runner)
            .detach_lost_loop_devices()
            .await
            .unwrap();
        assert_eq!(report.detached, vec![free.display().to_string()]);
        assert!(report.failed.contains_key(&busy.display().to_string()));
        assert!(busy.exists());
        assert!(!free.exists());
    }

    #[tokio::test]
    async fn sweep_workers_stop_on_signal() {
        let runner = losetup_world(vec![]);
        let mgr = Arc::new(LoopDeviceManager::new(runner.clone()));
        let (tx, rx) = watch::channel(false);
        let handles = mgr.run_detach_lost_loop_devices(2, Duration::from_millis(10), rx);

        tokio::time::sleep(Duration::from_millis(50)).await;
        tx.send(true).unwrap();
        for h in handles {
            tokio::time::timeout(Duration::from_secs(2), h)
                .await
                .unwrap()
                .unwrap();
        }
        assert!(runner.count("losetup --list") >= 2);
    }

    #[tokio::test]
    async fn concurrent_sweeps_leave_a_reused_device_alone() {
        let root = tempfile::tempdir().unwrap();
        let shard = root.path().join("kubernetes/volumes/volume_5");
        std::fs::create_dir_all(&shard).unwrap();
        let lost = shard.join(".nfs0000000000ab");
        let live = shard.join("v9_data");
        std::fs::write(&lost, b"stale").unwrap();
        std::fs::write(&live, b"live").unwrap();
        let lost_path = lost.display().to_string();
        let live_path = live.display().to_string();

        // Both workers see the listing taken before anything was detached.
        let stale = format!("/dev/loop0 {lost_path}\n");
        let bound = StdMutex::new(vec![("/dev/loop0".to_owned(), lost_path.clone())]);
        let runner = Arc::new(ScriptedRunner::new(move |_, args, _| {
            let mut b = bound.lock().unwrap();
            match args[0].as_str() {
                "--list" => CommandOutput::ok(stale.clone()),
                "-j" => CommandOutput::ok(
                    b.iter()
                        .filter(|(_, f)| *f == args[1])
                        .map(|(d, f)| format!("{d}: [2049]:9 ({f})\n"))
                        .collect::<String>(),
                ),
                "-d" => {
                    b.retain(|(d, _)| *d != args[1]);
                    // An attach on the node grabs the freed device at once.
                    b.push((args[1].clone(), live_path.clone()));
                    CommandOutput::ok("")
                }
                _ => CommandOutput::ok(""),
            }
        }));
        let mgr = Arc::new(LoopDeviceManager::new(runner.clone()));

        let (a, b) = tokio::join!(mgr.detach_lost_loop_devices(), mgr.detach_lost_loop_devices());
        let detached = a.unwrap().detached.len() + b.unwrap().detached.len();
        assert_eq!(detached, 1);
        assert_eq!(runner.count("losetup -d /dev/loop0"), 1);
        assert!(!lost.exists());
        assert!(live.exists());
        assert_eq!(mgr.devices_for_file(&live).await.unwrap(), vec!["/dev/loop0"]);
        assert!(mgr.deleting.is_empty());
    }

    #[tokio::test]
    async fn sweep_skips_device_rebound_since_listing() {
        let root = tempfile::tempdir().unwrap();
        let shard = root.path().join("kubernetes/volumes/volume_6");
        std::fs::create_dir_all(&shard).unwrap();
        let lost = shard.join(".nfs00000000cd");
        std::fs::write(&lost, b"stale").unwrap();
        let listing = format!("/dev/loop2 {}\n", lost.display());

        let runner = Arc::new(ScriptedRunner::new(move |_, args, _| match args[0].as_str() {
            "--list" => CommandOutput::ok(listing.clone()),
            // Nothing is bound to the lost file any more.
            _ => CommandOutput::ok(""),
        }));
        let report = LoopDeviceManager::new(runner.clone())
            .detach_lost_loop_devices()
            .await
            .unwrap();
        assert!(report.is_empty());
        assert_eq!(runner.count("losetup -d"), 0);
        assert!(lost.exists());
    }

    #[tokio::test]
    async fn partitioned_mapper_partitions_and_maps() {
        let partitioned = Arc::new(StdMutex::new(false));
        let state = partitioned.clone();
        let runner = Arc::new(ScriptedRunner::new(move |program, args, stdin| {
            let mut done = state.lock().unwrap();
            match program {
                "fdisk" if args[0] == "-l" && *done => CommandOutput::ok(
                    "Disk /dev/loop3: 1 GiB\nDevice       Boot Start     End Sectors Size Id Type\n/dev/loop3p1       2048 2097151 2095104 1023M 83 Linux\n",
                ),
                "fdisk" if args[0] == "-l" => CommandOutput::ok("Disk /dev/loop3: 1 GiB\n"),
                "fdisk" => {
                    assert_eq!(stdin, Some(FDISK_SCRIPT));
                    *done = true;
                    CommandOutput::failed(1, "Created a new partition 1 of type 'Linux'\nRe-reading the partition table failed.")
                }
                "kpartx" => CommandOutput::ok("add map loop3p1 (253:0): 0 2095104 linear 7:3 2048\n"),
                "stat" => CommandOutput::ok("block special file\n"),
                _ => CommandOutput::failed(1, "unexpected"),
            }
        }));
        let mgr = LoopDeviceManager::new(runner.clone());

        let mapper = mgr.partitioned_mapper("/dev/loop3").await.unwrap();
        assert_eq!(mapper, "/dev/mapper/loop3p1");
        assert_eq!(runner.count("fdisk /dev/loop3"), 1);
        assert_eq!(runner.count("stat -L -c %F /dev/mapper/loop3p1"), 1);
        assert_eq!(loop_device_of(&mapper), "/dev/loop3");

        // Already partitioned: no second fdisk run.
        mgr.partitioned_mapper("/dev/loop3").await.unwrap();
        assert_eq!(runner.count("fdisk /dev/loop3"), 1);
    }

    #[tokio::test]
    async fn partitioned_mapper_rejects_foreign_mapping_and_non_block() {
        let runner = Arc::new(ScriptedRunner::new(|program, args, _| match program {
            "fdisk" => CommandOutput::ok("/dev/loop4p1       2048 2097151 2095104 1023M 83 Linux\n"),
            "kpartx" if args[1] == "/dev/loop4" => {
                CommandOutput::ok("add map loop9p1 (253:1): 0 2095104 linear 7:9 2048\n")
            }
            "kpartx" => CommandOutput::ok("add map loop5p1 (253:2): 0 2095104 linear 7:5 2048\n"),
            "stat" => CommandOutput::ok("regular file\n"),
            _ => CommandOutput::ok(""),
        }));
        let mgr = LoopDeviceManager::new(runner);
        assert!(matches!(
            mgr.partitioned_mapper("/dev/loop4").await,
            Err(CsiError::Internal(_))
        ));
        assert!(matches!(
            mgr.mapper_device("loop5p1").await,
            Err(CsiError::BackendError(_))
        ));
    }

    #[tokio::test]
    async fn release_mappings_only_when_present() {
        let runner = Arc::new(ScriptedRunner::new(|_, args, _| match args[1].as_str() {
            "/dev/loop3" if args[0] == "-lv" => {
                CommandOutput::ok("loop3p1 : 0 2095104 /dev/loop3 2048\n")
            }
            _ => CommandOutput::ok(""),
        }));
        let mgr = LoopDeviceManager::new(runner.clone());
        mgr.release_mappings("/dev/loop3").await.unwrap();
        mgr.release_mappings("/dev/loop1").await.unwrap();
        assert_eq!(runner.count("kpartx -d /dev/loop3"), 1);
        assert_eq!(runner.count("kpartx -d"), 1);
    }

    #[test]
    fn mapper_names_map_back_to_loop_devices() {
        assert_eq!(loop_device_of("/dev/mapper/loop12p1"), "/dev/loop12");
        assert_eq!(loop_device_of("/dev/loop4"), "/dev/loop4");
        assert_eq!(loop_device_of("/dev/mapper/vg0-data"), "/dev/mapper/vg0-data");
        assert_eq!(loop_device_of("/dev/mapper/loop2p"), "/dev/mapper/loop2p");
    }

    #[tokio::test]
    async fn mount_point_lookup_and_capacity_refresh() {
        let runner = Arc::new(ScriptedRunner::new(|program, args, _| match program {
            "findmnt" if args.last().map(String::as_str) == Some("/var/lib/kubelet/x") => {
                CommandOutput::ok("/dev/loop5\n")
            }
            "findmnt" => CommandOutput::ok(""),
            _ => CommandOutput::ok(""),
        }));
        let mgr = LoopDeviceManager::new(runner.clone());
        assert_eq!(
            mgr.device_for_mount_point("/var/lib/kubelet/x").await.unwrap().as_deref(),
            Some("/dev/loop5")
        );
        assert_eq!(mgr.device_for_mount_point("/elsewhere").await.unwrap(), None);
        mgr.refresh_capacity("/dev/loop5").await.unwrap();
        assert_eq!(runner.count("losetup -c /dev/loop5"), 1);
    }

    #[test]
    fn binding_parsing_and_lost_filter() {
        let parsed = parse_bindings(
            "/dev/loop0 /m/kubernetes/volumes/volume_1/.nfs0001\n/dev/loop1   /m/kubernetes/volumes/volume_1/v_a\n/dev/loop2\n",
        );
        assert_eq!(parsed.len(), 2);
        assert!(parsed[0].is_lost());
        assert!(!parsed[1].is_lost());
        assert_eq!(parsed[1].backing_file, "/m/kubernetes/volumes/volume_1/v_a");
    }
}

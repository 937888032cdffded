//! In-memory hardware for `--simulation` mode and tests.
//!
//! Mount points are real directories under a root chosen at construction, so
//! markers and repositories written to a simulated drive survive unplugging
//! and re-inserting it.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use tracing::info;

use crate::core::hardware::{HardwareAdapter, SupportedFilesystem, ToolFailure, ToolFailureKind};
use crate::core::models::{Device, Partition};
use crate::core::probe::HostTools;

/// Failure injected into privileged operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fault {
    /// Polkit refuses
    AuthDenied,
    /// The helper never returns, like an unanswered password prompt
    Hang,
    Io,
}

#[derive(Debug, Clone)]
struct SimPartition {
    suffix: String,
    size: u64,
    fstype: Option<String>,
    uuid: Option<String>,
    label: Option<String>,
    mounted: Option<PathBuf>,
}

#[derive(Debug, Clone)]
struct SimDevice {
    name: String,
    size: u64,
    removable: bool,
    partitions: Vec<SimPartition>,
}

impl SimDevice {
    fn devnode(&self) -> PathBuf {
        PathBuf::from(format!("/dev/sim-{}", self.name))
    }

    fn partition_devnode(&self, part: &SimPartition) -> PathBuf {
        PathBuf::from(format!("/dev/sim-{}{}", self.name, part.suffix))
    }
}

struct SimState {
    mount_root: PathBuf,
    plugged: Vec<SimDevice>,
    unplugged: Vec<SimDevice>,
    tools: HostTools,
    fault: Option<Fault>,
    fail_listing: bool,
    uuid_counter: u64,
}

impl SimState {
    fn next_uuid(&mut self) -> String {
        self.uuid_counter += 1;
        format!("SIM-{:04X}", self.uuid_counter)
    }

    fn find_partition(&mut self, devnode: &Path) -> Option<(&mut SimDevice, usize)> {
        for dev in self.plugged.iter_mut() {
            let hit = dev
                .partitions
                .iter()
                .position(|p| dev.partition_devnode(p) == devnode);
            if let Some(idx) = hit {
                return Some((dev, idx));
            }
        }
        None
    }
}

struct Shared {
    state: Mutex<SimState>,
    format_calls: AtomicUsize,
    mount_calls: AtomicUsize,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, SimState> {
        match self.state.lock() {
            Ok(s) => s,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    async fn apply_fault(&self, tool: &str) -> Result<(), ToolFailure> {
        let fault = self.lock().fault;
        match fault {
            None => Ok(()),
            Some(Fault::AuthDenied) => Err(ToolFailure::new(
                tool,
                ToolFailureKind::NotAuthorized,
                "Not authorized to perform operation",
            )),
            Some(Fault::Io) => Err(ToolFailure::io(tool, "Input/output error")),
            Some(Fault::Hang) => {
                std::future::pending::<()>().await;
                Ok(())
            }
        }
    }
}

pub struct SimulatedAdapter {
    shared: Arc<Shared>,
}

/// Controller for the simulated hardware.
#[derive(Clone)]
pub struct Simulator {
    shared: Arc<Shared>,
}

impl SimulatedAdapter {
    pub fn new(mount_root: impl Into<PathBuf>) -> (Self, Simulator) {
        let shared = Arc::new(Shared {
            state: Mutex::new(SimState {
                mount_root: mount_root.into(),
                plugged: Vec::new(),
                unplugged: Vec::new(),
                tools: HostTools {
                    lsblk: true,
                    udisksctl: true,
                    udisksctl_format: false,
                    mkfs_exfat: true,
                    mkfs_vfat: true,
                    mkfs_ext4: true,
                    pkexec: true,
                    parted: true,
                },
                fault: None,
                fail_listing: false,
                uuid_counter: 0,
            }),
            format_calls: AtomicUsize::new(0),
            mount_calls: AtomicUsize::new(0),
        });

        (
            Self {
                shared: shared.clone(),
            },
            Simulator { shared },
        )
    }
}

impl Simulator {
    fn insert(&self, name: &str, size_gb: u64, removable: bool, fstype: Option<&str>) -> PathBuf {
        let mut state = self.shared.lock();
        let size = size_gb * 1024 * 1024 * 1024;
        let partitions = match fstype {
            Some(fs) => {
                let uuid = state.next_uuid();
                vec![SimPartition {
                    suffix: "1".into(),
                    size: size.saturating_sub(1024 * 1024),
                    fstype: Some(fs.to_string()),
                    uuid: Some(uuid),
                    label: Some(name.to_uppercase()),
                    mounted: None,
                }]
            }
            None => Vec::new(),
        };
        let device = SimDevice {
            name: name.to_string(),
            size,
            removable,
            partitions,
        };
        let devnode = match device.partitions.first() {
            Some(p) => device.partition_devnode(p),
            None => device.devnode(),
        };
        state.plugged.retain(|d| d.name != name);
        state.unplugged.retain(|d| d.name != name);
        state.plugged.push(device);
        info!(device = %devnode.display(), "(Simulator) Device added");
        devnode
    }

    /// Plug in a removable drive with one exFAT partition. Returns the partition devnode.
    pub fn add_device(&self, name: &str, size_gb: u64) -> PathBuf {
        self.insert(name, size_gb, true, Some("exfat"))
    }

    /// Plug in a removable drive with no partition table. Returns the disk devnode.
    pub fn add_blank_device(&self, name: &str, size_gb: u64) -> PathBuf {
        self.insert(name, size_gb, true, None)
    }

    /// Attach an internal, non-removable disk. Returns the partition devnode.
    pub fn add_fixed_device(&self, name: &str, size_gb: u64) -> PathBuf {
        self.insert(name, size_gb, false, Some("ext4"))
    }

    /// Yank a device. Its mounts vanish; its contents are kept for re-insertion.
    pub fn remove_device(&self, name: &str) {
        let mut state = self.shared.lock();
        if let Some(pos) = state.plugged.iter().position(|d| d.name == name) {
            let mut device = state.plugged.remove(pos);
            for p in device.partitions.iter_mut() {
                p.mounted = None;
            }
            state.unplugged.push(device);
            info!(device = name, "(Simulator) Device removed");
        }
    }

    pub fn reinsert_device(&self, name: &str) {
        let mut state = self.shared.lock();
        if let Some(pos) = state.unplugged.iter().position(|d| d.name == name) {
            let device = state.unplugged.remove(pos);
            state.plugged.push(device);
            info!(device = name, "(Simulator) Device re-inserted");
        }
    }

    pub fn set_tools(&self, tools: HostTools) {
        self.shared.lock().tools = tools;
    }

    pub fn inject_fault(&self, fault: Option<Fault>) {
        self.shared.lock().fault = fault;
    }

    pub fn fail_listing(&self, fail: bool) {
        self.shared.lock().fail_listing = fail;
    }

    pub fn format_calls(&self) -> usize {
        self.shared.format_calls.load(Ordering::SeqCst)
    }

    pub fn mount_calls(&self) -> usize {
        self.shared.mount_calls.load(Ordering::SeqCst)
    }

    /// Split a disk into extra partitions, for ambiguity tests.
    pub fn add_partition(&self, name: &str, fstype: Option<&str>) -> Option<PathBuf> {
        let mut state = self.shared.lock();
        let uuid = state.next_uuid();
        let device = state.plugged.iter_mut().find(|d| d.name == name)?;
        let part = SimPartition {
            suffix: (device.partitions.len() + 1).to_string(),
            size: device.size / 2,
            fstype: fstype.map(String::from),
            uuid: fstype.map(|_| uuid),
            label: None,
            mounted: None,
        };
        let devnode = device.partition_devnode(&part);
        device.partitions.push(part);
        Some(devnode)
    }
}

#[async_trait]
impl HardwareAdapter for SimulatedAdapter {
    async fn list_devices(&self) -> anyhow::Result<Vec<Device>> {
        let state = self.shared.lock();
        if state.fail_listing {
            anyhow::bail!("simulated enumeration failure");
        }
        Ok(state
            .plugged
            .iter()
            .map(|d| Device {
                path: d.devnode(),
                name: format!("sim-{}", d.name),
                model: Some("Simulated Disk".into()),
                size: d.size,
                removable: d.removable,
                partitions: d
                    .partitions
                    .iter()
                    .map(|p| Partition {
                        path: d.partition_devnode(p),
                        name: format!("sim-{}{}", d.name, p.suffix),
                        size: p.size,
                        fstype: p.fstype.clone(),
                        uuid: p.uuid.clone(),
                        label: p.label.clone(),
                        mountpoints: p.mounted.iter().cloned().collect(),
                        whole_disk: false,
                        drive_id: None,
                    })
                    .collect(),
            })
            .collect())
    }

    async fn host_tools(&self) -> HostTools {
        self.shared.lock().tools
    }

    async fn mount(&self, devnode: &Path) -> Result<PathBuf, ToolFailure> {
        self.shared.mount_calls.fetch_add(1, Ordering::SeqCst);
        self.shared.apply_fault("udisksctl").await?;

        let mut state = self.shared.lock();
        let root = state.mount_root.clone();
        let (device, idx) = state
            .find_partition(devnode)
            .ok_or_else(|| ToolFailure::io("udisksctl", format!("Object {} not found", devnode.display())))?;
        let part_name = format!("sim-{}{}", device.name, device.partitions[idx].suffix);
        let part = &mut device.partitions[idx];

        if let Some(existing) = &part.mounted {
            return Err(ToolFailure::new(
                "udisksctl",
                ToolFailureKind::AlreadyMounted(Some(existing.clone())),
                format!("Device is already mounted at `{}'.", existing.display()),
            ));
        }
        if part.fstype.is_none() {
            return Err(ToolFailure::new(
                "udisksctl",
                ToolFailureKind::NotMountable,
                format!("Object {} is not a mountable filesystem.", devnode.display()),
            ));
        }

        let target = root.join(part_name);
        std::fs::create_dir_all(&target).map_err(|e| ToolFailure::io("udisksctl", e.to_string()))?;
        part.mounted = Some(target.clone());
        Ok(target)
    }

    async fn unmount(&self, devnode: &Path) -> Result<(), ToolFailure> {
        self.shared.apply_fault("udisksctl").await?;
        let mut state = self.shared.lock();
        let (device, idx) = state
            .find_partition(devnode)
            .ok_or_else(|| ToolFailure::io("udisksctl", format!("Object {} not found", devnode.display())))?;
        device.partitions[idx].mounted = None;
        Ok(())
    }

    async fn power_off(&self, disk: &Path) -> Result<(), ToolFailure> {
        self.shared.apply_fault("udisksctl").await?;
        let name = {
            let state = self.shared.lock();
            state
                .plugged
                .iter()
                .find(|d| d.devnode() == disk)
                .map(|d| d.name.clone())
        };
        match name {
            Some(name) => {
                Simulator {
                    shared: self.shared.clone(),
                }
                .remove_device(&name);
                Ok(())
            }
            None => Err(ToolFailure::io("udisksctl", format!("Object {} not found", disk.display()))),
        }
    }

    async fn create_partition_table(&self, disk: &Path) -> Result<(), ToolFailure> {
        self.shared.apply_fault("pkexec").await?;
        let mut state = self.shared.lock();
        let device = state
            .plugged
            .iter_mut()
            .find(|d| d.devnode() == disk)
            .ok_or_else(|| ToolFailure::io("parted", format!("Could not stat device {}", disk.display())))?;
        device.partitions = vec![SimPartition {
            suffix: "1".into(),
            size: device.size.saturating_sub(1024 * 1024),
            fstype: None,
            uuid: None,
            label: None,
            mounted: None,
        }];
        Ok(())
    }

    async fn make_filesystem(
        &self,
        devnode: &Path,
        filesystem: SupportedFilesystem,
        label: &str,
    ) -> Result<(), ToolFailure> {
        self.shared.format_calls.fetch_add(1, Ordering::SeqCst);
        self.shared.apply_fault("pkexec").await?;

        let mut state = self.shared.lock();
        let uuid = state.next_uuid();
        let root = state.mount_root.clone();
        let (device, idx) = state
            .find_partition(devnode)
            .ok_or_else(|| ToolFailure::io("mkfs", format!("{}: No such device", devnode.display())))?;
        let part_name = format!("sim-{}{}", device.name, device.partitions[idx].suffix);
        let part = &mut device.partitions[idx];
        if part.mounted.is_some() {
            return Err(ToolFailure::io("mkfs", format!("{} contains a mounted filesystem", devnode.display())));
        }
        part.fstype = Some(filesystem.as_str().to_string());
        part.uuid = Some(uuid);
        part.label = Some(label.to_string());

        // Fresh filesystem, so whatever was on the media is gone
        let contents = root.join(part_name);
        if contents.exists() {
            std::fs::remove_dir_all(&contents).map_err(|e| ToolFailure::io("mkfs", e.to_string()))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn lists_added_devices() {
        let dir = tempfile::tempdir().unwrap();
        let (adapter, sim) = SimulatedAdapter::new(dir.path());
        let part = sim.add_device("usb", 64);
        let disk = sim.add_blank_device("blank", 8);

        let devices = adapter.list_devices().await.unwrap();
        assert_eq!(devices.len(), 2);
        assert_eq!(devices[0].partitions[0].path, part);
        assert_eq!(devices[0].size, 64 * 1024 * 1024 * 1024);
        assert_eq!(devices[1].path, disk);
        assert!(devices[1].partitions.is_empty());
    }

    #[tokio::test]
    async fn mount_creates_directory_and_reports_already_mounted() {
        let dir = tempfile::tempdir().unwrap();
        let (adapter, sim) = SimulatedAdapter::new(dir.path());
        let part = sim.add_device("usb", 1);

        let path = adapter.mount(&part).await.unwrap();
        assert!(path.is_dir());

        let err = adapter.mount(&part).await.unwrap_err();
        assert_eq!(err.kind, ToolFailureKind::AlreadyMounted(Some(path)));
    }

    #[tokio::test]
    async fn contents_survive_reinsertion() {
        let dir = tempfile::tempdir().unwrap();
        let (adapter, sim) = SimulatedAdapter::new(dir.path());
        let part = sim.add_device("usb", 1);
        let path = adapter.mount(&part).await.unwrap();
        std::fs::write(path.join("file"), b"data").unwrap();

        sim.remove_device("usb");
        assert!(adapter.list_devices().await.unwrap().is_empty());

        sim.reinsert_device("usb");
        let devices = adapter.list_devices().await.unwrap();
        assert!(devices[0].partitions[0].mountpoints.is_empty());
        let path = adapter.mount(&part).await.unwrap();
        assert_eq!(std::fs::read(path.join("file")).unwrap(), b"data");
    }

    #[tokio::test]
    async fn faults_apply_to_privileged_calls() {
        let dir = tempfile::tempdir().unwrap();
        let (adapter, sim) = SimulatedAdapter::new(dir.path());
        let part = sim.add_device("usb", 1);

        sim.inject_fault(Some(Fault::AuthDenied));
        let err = adapter.mount(&part).await.unwrap_err();
        assert_eq!(err.kind, ToolFailureKind::NotAuthorized);
        let err = adapter
            .make_filesystem(&part, SupportedFilesystem::Exfat, "X")
            .await
            .unwrap_err();
        assert_eq!(err.kind, ToolFailureKind::NotAuthorized);
        assert_eq!(sim.format_calls(), 1);
    }

    #[tokio::test]
    async fn partitioning_blank_disk_yields_unformatted_partition() {
        let dir = tempfile::tempdir().unwrap();
        let (adapter, sim) = SimulatedAdapter::new(dir.path());
        let disk = sim.add_blank_device("blank", 1);

        adapter.create_partition_table(&disk).await.unwrap();
        let devices = adapter.list_devices().await.unwrap();
        let part = &devices[0].partitions[0];
        assert_eq!(part.path, PathBuf::from("/dev/sim-blank1"));
        assert!(part.fstype.is_none());

        adapter
            .make_filesystem(&part.path, SupportedFilesystem::Exfat, "KEEP")
            .await
            .unwrap();
        let devices = adapter.list_devices().await.unwrap();
        assert_eq!(devices[0].partitions[0].fstype.as_deref(), Some("exfat"));
    }
}

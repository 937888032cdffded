//! Polls the host's block devices and publishes them as versioned snapshots.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, watch};
use tokio::task::JoinError;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::hardware::HardwareAdapter;
use super::marker::DriveMarker;
use super::models::{Device, DeviceSnapshot, Partition};

pub struct DeviceEnumerator {
    adapter: Arc<dyn HardwareAdapter>,
    tx: watch::Sender<Arc<DeviceSnapshot>>,
    /// Serializes refreshes so versions stay monotonic
    refresh_lock: Mutex<()>,
}

impl DeviceEnumerator {
    pub fn new(adapter: Arc<dyn HardwareAdapter>) -> Self {
        let (tx, _) = watch::channel(Arc::new(DeviceSnapshot::default()));
        Self {
            adapter,
            tx,
            refresh_lock: Mutex::new(()),
        }
    }

    /// Latest published snapshot. Never touches the host.
    pub fn current(&self) -> Arc<DeviceSnapshot> {
        self.tx.borrow().clone()
    }

    pub fn list_devices(&self) -> Vec<Device> {
        self.current().devices.clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<Arc<DeviceSnapshot>> {
        self.tx.subscribe()
    }

    /// Poll the adapter once. On failure the previous snapshot stays published.
    pub async fn refresh(&self) -> Arc<DeviceSnapshot> {
        let _guard = self.refresh_lock.lock().await;

        let devices = match self.adapter.list_devices().await {
            Ok(devices) => devices,
            Err(e) => {
                warn!(error = %e, "Device enumeration failed, keeping previous snapshot");
                return self.current();
            }
        };

        let normalized = tokio::task::spawn_blocking(move || normalize(devices)).await;
        self.publish(normalized)
    }

    fn publish(&self, normalized: Result<Vec<Device>, JoinError>) -> Arc<DeviceSnapshot> {
        let devices = match normalized {
            Ok(devices) => devices,
            Err(e) => {
                warn!(error = %e, "Device normalization failed, keeping previous snapshot");
                return self.current();
            }
        };

        let previous = self.current();
        if previous.devices == devices {
            return previous;
        }

        let snapshot = Arc::new(DeviceSnapshot {
            version: previous.version + 1,
            devices,
        });
        log_changes(&previous, &snapshot);
        self.tx.send_replace(snapshot.clone());
        snapshot
    }

    pub async fn run(self: Arc<Self>, interval: Duration, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.refresh().await;
                }
                _ = cancel.cancelled() => {
                    debug!("Device enumerator stopping");
                    break;
                }
            }
        }
    }
}

/// Fill in marker identities and give unpartitioned removable disks a
/// whole-disk target. Reads the filesystem, so run it off the async workers.
fn normalize(mut devices: Vec<Device>) -> Vec<Device> {
    for device in devices.iter_mut() {
        if device.removable && device.partitions.is_empty() {
            device.partitions.push(Partition {
                path: device.path.clone(),
                name: device.name.clone(),
                size: device.size,
                fstype: None,
                uuid: None,
                label: None,
                mountpoints: Vec::new(),
                whole_disk: true,
                drive_id: None,
            });
        }

        if !device.removable {
            continue;
        }
        for partition in device.partitions.iter_mut() {
            let Some(mount) = partition.primary_mount() else {
                continue;
            };
            match DriveMarker::read(mount) {
                Ok(Some(marker)) => match marker.validate() {
                    Ok(()) => partition.drive_id = Some(marker.drive_id),
                    Err(e) => warn!(mount = %mount.display(), error = %e, "Ignoring invalid drive marker"),
                },
                Ok(None) => partition.drive_id = None,
                Err(e) => debug!(mount = %mount.display(), error = %e, "Unreadable drive marker"),
            }
        }
    }
    devices
}

fn log_changes(previous: &DeviceSnapshot, next: &DeviceSnapshot) {
    let paths = |s: &DeviceSnapshot| -> Vec<PathBuf> { s.devices.iter().map(|d| d.path.clone()).collect() };
    let before = paths(previous);
    let after = paths(next);

    for added in after.iter().filter(|p| !before.contains(p)) {
        info!(device = %added.display(), "Device connected");
    }
    for removed in before.iter().filter(|p| !after.contains(p)) {
        info!(device = %removed.display(), "Device disconnected");
    }
    debug!(version = next.version, devices = next.devices.len(), "Device topology changed");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::SimulatedAdapter;

    #[tokio::test]
    async fn starts_empty_and_versions_on_change() {
        let dir = tempfile::tempdir().unwrap();
        let (adapter, sim) = SimulatedAdapter::new(dir.path());
        let enumerator = DeviceEnumerator::new(Arc::new(adapter));
        assert_eq!(enumerator.current().version, 0);

        sim.add_device("usb", 8);
        let snap = enumerator.refresh().await;
        assert_eq!(snap.version, 1);
        assert_eq!(snap.devices.len(), 1);

        let same = enumerator.refresh().await;
        assert_eq!(same.version, 1, "unchanged topology keeps the version");

        sim.remove_device("usb");
        assert_eq!(enumerator.refresh().await.version, 2);
        assert!(enumerator.list_devices().is_empty());
    }

    #[tokio::test]
    async fn failure_keeps_previous_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let (adapter, sim) = SimulatedAdapter::new(dir.path());
        let enumerator = DeviceEnumerator::new(Arc::new(adapter));
        sim.add_device("usb", 8);
        enumerator.refresh().await;

        sim.fail_listing(true);
        sim.remove_device("usb");
        let snap = enumerator.refresh().await;
        assert_eq!(snap.devices.len(), 1);
        assert_eq!(snap.version, 1);
    }

    #[tokio::test]
    async fn panicked_normalization_keeps_previous_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let (adapter, sim) = SimulatedAdapter::new(dir.path());
        let enumerator = DeviceEnumerator::new(Arc::new(adapter));
        sim.add_device("usb", 8);
        enumerator.refresh().await;

        let panicked = tokio::task::spawn_blocking(|| -> Vec<Device> { panic!("marker read blew up") }).await;
        let snap = enumerator.publish(panicked);
        assert_eq!(snap.version, 1);
        assert_eq!(snap.devices.len(), 1);
        assert_eq!(enumerator.current().devices.len(), 1);
    }

    #[tokio::test]
    async fn blank_removable_disk_gets_whole_disk_partition() {
        let dir = tempfile::tempdir().unwrap();
        let (adapter, sim) = SimulatedAdapter::new(dir.path());
        let enumerator = DeviceEnumerator::new(Arc::new(adapter));
        let disk = sim.add_blank_device("blank", 8);

        let snap = enumerator.refresh().await;
        let part = &snap.devices[0].partitions[0];
        assert!(part.whole_disk);
        assert_eq!(part.path, disk);
        assert!(part.fstype.is_none());
    }

    #[tokio::test]
    async fn reads_marker_of_mounted_partition() {
        let dir = tempfile::tempdir().unwrap();
        let (adapter, sim) = SimulatedAdapter::new(dir.path());
        let adapter = Arc::new(adapter);
        let part = sim.add_device("usb", 8);
        let mount = adapter.mount(&part).await.unwrap();
        DriveMarker {
            drive_id: "0123456789abcdef0123456789abcdef".into(),
            label: "x".into(),
            repository_id: None,
            repository_path: DriveMarker::default_repository_path(),
            created_epoch: 0,
        }
        .write(&mount)
        .unwrap();

        let enumerator = DeviceEnumerator::new(adapter);
        let snap = enumerator.refresh().await;
        assert_eq!(
            snap.devices[0].partitions[0].drive_id.as_deref(),
            Some("0123456789abcdef0123456789abcdef")
        );
    }

    #[tokio::test]
    async fn invalid_marker_gives_no_identity() {
        let dir = tempfile::tempdir().unwrap();
        let (adapter, sim) = SimulatedAdapter::new(dir.path());
        let adapter = Arc::new(adapter);
        let part = sim.add_device("usb", 8);
        let mount = adapter.mount(&part).await.unwrap();
        DriveMarker {
            drive_id: "../../evil".into(),
            label: "x".into(),
            repository_id: None,
            repository_path: PathBuf::from("/var/lib/repo"),
            created_epoch: 0,
        }
        .write(&mount)
        .unwrap();

        let enumerator = DeviceEnumerator::new(adapter);
        let snap = enumerator.refresh().await;
        assert!(snap.devices[0].partitions[0].drive_id.is_none());
    }

    #[tokio::test]
    async fn subscribers_see_new_snapshots() {
        let dir = tempfile::tempdir().unwrap();
        let (adapter, sim) = SimulatedAdapter::new(dir.path());
        let enumerator = DeviceEnumerator::new(Arc::new(adapter));
        let mut rx = enumerator.subscribe();

        sim.add_device("usb", 8);
        enumerator.refresh().await;
        rx.changed().await.unwrap();
        assert_eq!(rx.borrow().version, 1);
    }
}

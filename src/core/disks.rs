//! Privileged mount, unmount, eject and format operations.
//!
//! Every helper call is bounded by the configured authorization timeout; a
//! prompt nobody answers surfaces as `AuthorizationRequired` and the helper
//! is killed.

use std::future::Future;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Serialize;
use tracing::{info, warn};
use uuid::Uuid;

use super::hardware::{SupportedFilesystem, ToolFailure, ToolFailureKind};
use super::locks::DriveGuard;
use super::models::{Device, Partition};
use super::trust_store::sanitize_label;
use crate::context::AppContext;
use crate::error::{DriveError, DriveResult};

const REPARTITION_ATTEMPTS: u32 = 5;
const REPARTITION_DELAY: Duration = Duration::from_millis(500);

#[derive(Debug, Clone, Serialize)]
pub struct FormatOutcome {
    /// The partition that now carries the filesystem
    pub devnode: PathBuf,
    pub label: String,
    pub filesystem: SupportedFilesystem,
}

pub struct DiskOrchestrator {
    ctx: AppContext,
}

/// Default volume label, `keep` plus six hex characters.
fn default_volume_label() -> String {
    let id = Uuid::now_v7().simple().to_string();
    format!("keep{}", &id[id.len() - 6..])
}

fn volume_label(requested: Option<&str>, filesystem: SupportedFilesystem) -> String {
    let label: String = requested
        .map(sanitize_label)
        .unwrap_or_default()
        .chars()
        .take(filesystem.label_limit())
        .collect();
    let label = label.trim().to_string();
    if label.is_empty() {
        default_volume_label()
    } else {
        label
    }
}

impl DiskOrchestrator {
    pub fn new(ctx: AppContext) -> Self {
        Self { ctx }
    }

    /// Run a helper under the authorization timeout.
    async fn bounded<T>(
        &self,
        fut: impl Future<Output = Result<T, ToolFailure>>,
    ) -> DriveResult<Result<T, ToolFailure>> {
        tokio::time::timeout(self.ctx.config.auth_timeout(), fut)
            .await
            .map_err(|_| {
                warn!("Privileged helper did not return in time");
                DriveError::AuthorizationRequired("timed out waiting for authorization".into())
            })
    }

    async fn privileged<T>(&self, fut: impl Future<Output = Result<T, ToolFailure>>) -> DriveResult<T> {
        Ok(self.bounded(fut).await??)
    }

    /// Find a partition, re-enumerating once if the cached view lacks it.
    async fn locate(&self, devnode: &Path) -> DriveResult<(Device, Partition)> {
        let snapshot = self.ctx.devices.current();
        if let Some((d, p)) = snapshot.find_partition(devnode) {
            return Ok((d.clone(), p.clone()));
        }
        let snapshot = self.ctx.devices.refresh().await;
        snapshot
            .find_partition(devnode)
            .map(|(d, p)| (d.clone(), p.clone()))
            .ok_or_else(|| DriveError::NotFound(devnode.display().to_string()))
    }

    /// Trusted drives lock by identity, anything else by disk.
    fn lock_key(&self, device: &Device, partition: &Partition) -> String {
        partition
            .drive_id
            .as_deref()
            .filter(|id| self.ctx.store.get(id).is_some())
            .map(String::from)
            .unwrap_or_else(|| device.path.display().to_string())
    }

    fn acquire(&self, key: &str) -> DriveResult<DriveGuard> {
        self.ctx
            .locks
            .try_acquire(key)
            .ok_or_else(|| DriveError::AlreadyRunning(key.to_string()))
    }

    /// Mount a partition. Mounting an already-mounted partition returns its
    /// primary mount point.
    pub async fn mount(&self, devnode: &Path) -> DriveResult<PathBuf> {
        let caps = self.ctx.probe.get().await;
        if !caps.tools.lsblk {
            return Err(DriveError::ToolMissing("lsblk".into()));
        }
        if !caps.tools.udisksctl {
            return Err(DriveError::ToolMissing("udisksctl".into()));
        }

        let (device, partition) = self.locate(devnode).await?;
        if partition.fstype.is_none() {
            return Err(DriveError::NoFilesystem(devnode.display().to_string()));
        }
        if let Some(existing) = partition.primary_mount() {
            return Ok(existing.clone());
        }

        let _guard = self.acquire(&self.lock_key(&device, &partition))?;
        info!(device = %devnode.display(), "Mounting");

        let mounted = match self.bounded(self.ctx.adapter.mount(devnode)).await? {
            Ok(path) => path,
            Err(ToolFailure {
                kind: ToolFailureKind::AlreadyMounted(Some(path)),
                ..
            }) => path,
            Err(ToolFailure {
                kind: ToolFailureKind::AlreadyMounted(None),
                message,
                ..
            }) => {
                let snapshot = self.ctx.devices.refresh().await;
                return snapshot
                    .find_partition(devnode)
                    .and_then(|(_, p)| p.primary_mount().cloned())
                    .ok_or(DriveError::AlreadyMounted(message));
            }
            Err(e) => return Err(e.into()),
        };

        let snapshot = self.ctx.devices.refresh().await;
        if let Some(drive_id) = snapshot
            .find_partition(devnode)
            .and_then(|(_, p)| p.drive_id.clone())
            .filter(|id| self.ctx.store.get(id).is_some())
        {
            if let Err(e) = self
                .ctx
                .store
                .record_seen(&drive_id, chrono::Utc::now().timestamp())
                .await
            {
                warn!(drive_id = %drive_id, error = %e, "Could not record drive as seen");
            }
        }

        info!(device = %devnode.display(), mount = %mounted.display(), "Mounted");
        Ok(mounted)
    }

    pub async fn unmount(&self, devnode: &Path) -> DriveResult<()> {
        let (device, partition) = self.locate(devnode).await?;
        if !partition.is_mounted() {
            return Ok(());
        }
        let _guard = self.acquire(&self.lock_key(&device, &partition))?;
        self.privileged(self.ctx.adapter.unmount(devnode)).await?;
        self.ctx.devices.refresh().await;
        info!(device = %devnode.display(), "Unmounted");
        Ok(())
    }

    /// Unmount every partition of the disk holding `mount_path` and power it off.
    pub async fn eject(&self, mount_path: &Path) -> DriveResult<()> {
        let snapshot = self.ctx.devices.refresh().await;
        let (device, partition) = snapshot
            .find_by_mount(mount_path)
            .map(|(d, p)| (d.clone(), p.clone()))
            .ok_or_else(|| DriveError::InvalidMount(mount_path.display().to_string()))?;
        if !device.removable {
            return Err(DriveError::NotRemovable(device.path.display().to_string()));
        }

        let _guard = self.acquire(&self.lock_key(&device, &partition))?;
        for p in device.partitions.iter().filter(|p| p.is_mounted()) {
            self.privileged(self.ctx.adapter.unmount(&p.path)).await?;
        }
        self.privileged(self.ctx.adapter.power_off(&device.path)).await?;
        self.ctx.devices.refresh().await;
        info!(device = %device.path.display(), "Ejected");
        Ok(())
    }

    /// Erase a removable device and create a fresh filesystem.
    ///
    /// A whole-disk target first gets a GPT table with a single partition.
    /// Non-removable devices are refused before anything else is checked.
    pub async fn format(
        &self,
        devnode: &Path,
        label: Option<&str>,
        filesystem: SupportedFilesystem,
    ) -> DriveResult<FormatOutcome> {
        let snapshot = self.ctx.devices.refresh().await;
        let (device, partition) = match snapshot.find_partition(devnode) {
            Some((d, p)) => (d.clone(), p.clone()),
            None => {
                return Err(match snapshot.find_device(devnode) {
                    Some(d) if !d.removable => DriveError::NotRemovable(devnode.display().to_string()),
                    Some(_) => DriveError::InvalidInput(format!(
                        "{} has partitions; choose one of them",
                        devnode.display()
                    )),
                    None => DriveError::NotFound(devnode.display().to_string()),
                });
            }
        };

        if !device.removable {
            return Err(DriveError::NotRemovable(devnode.display().to_string()));
        }

        let caps = self.ctx.probe.get().await;
        if let Some(tool) = caps.tools.missing_for_format(filesystem, partition.whole_disk) {
            return Err(DriveError::ToolMissing(tool.into()));
        }

        let _guard = self.acquire(&self.lock_key(&device, &partition))?;
        let label = volume_label(label, filesystem);
        if let Some(id) = partition.drive_id.as_deref() {
            warn!(drive_id = %id, "Formatting a partition that carries a drive marker");
        }

        for p in device.partitions.iter().filter(|p| p.is_mounted()) {
            info!(device = %p.path.display(), "Unmounting before format");
            self.privileged(self.ctx.adapter.unmount(&p.path)).await?;
        }

        let target = if partition.whole_disk {
            info!(device = %device.path.display(), "Creating partition table");
            self.privileged(self.ctx.adapter.create_partition_table(&device.path))
                .await?;
            self.first_partition(&device.path).await?
        } else {
            partition.path.clone()
        };

        info!(
            device = %target.display(),
            filesystem = filesystem.as_str(),
            label = %label,
            "Creating filesystem"
        );
        self.privileged(self.ctx.adapter.make_filesystem(&target, filesystem, &label))
            .await?;
        self.ctx.devices.refresh().await;

        Ok(FormatOutcome {
            devnode: target,
            label,
            filesystem,
        })
    }

    /// Re-enumerate until the freshly partitioned disk shows a partition.
    async fn first_partition(&self, disk: &Path) -> DriveResult<PathBuf> {
        for attempt in 1..=REPARTITION_ATTEMPTS {
            let snapshot = self.ctx.devices.refresh().await;
            let partitions: Vec<&Partition> = snapshot
                .find_device(disk)
                .map(|d| d.partitions.iter().filter(|p| !p.whole_disk).collect())
                .unwrap_or_default();

            if let Some(first) = partitions.first() {
                if partitions.len() > 1 {
                    warn!(
                        device = %disk.display(),
                        count = partitions.len(),
                        chosen = %first.path.display(),
                        "Ambiguous partition layout after partitioning, using the first"
                    );
                }
                return Ok(first.path.clone());
            }
            if attempt < REPARTITION_ATTEMPTS {
                tokio::time::sleep(REPARTITION_DELAY).await;
            }
        }
        Err(DriveError::IoFailure(format!(
            "no partition appeared on {} after partitioning",
            disk.display()
        )))
    }
}

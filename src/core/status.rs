//! Point-in-time view of the whole daemon, assembled from cached state only.

use std::collections::HashMap;

use super::models::{ConnectedDrive, DeviceSnapshot, StatusSnapshot, TrustedDrive, TrustedDriveView};
use crate::context::AppContext;

pub struct StatusAggregator {
    ctx: AppContext,
}

fn view(snapshot: &DeviceSnapshot, drive: TrustedDrive) -> TrustedDriveView {
    let found = snapshot.find_drive(&drive);
    TrustedDriveView {
        is_connected: found.is_some(),
        mount_path: found.and_then(|(_, p)| p.primary_mount().cloned()),
        devnode: found.map(|(_, p)| p.path.clone()),
        drive,
    }
}

/// The removable drive a client should focus on: a mounted trusted drive,
/// else any mounted removable partition, else any removable partition.
fn connected_drive(snapshot: &DeviceSnapshot, trusted: &[TrustedDriveView]) -> Option<ConnectedDrive> {
    let removable = || {
        snapshot
            .devices
            .iter()
            .filter(|d| d.removable)
            .flat_map(|d| d.partitions.iter())
    };
    let trusted_id = |devnode: &std::path::Path| {
        trusted
            .iter()
            .find(|v| v.devnode.as_deref() == Some(devnode))
            .map(|v| v.drive.drive_id.clone())
    };

    let chosen = removable()
        .find(|p| p.is_mounted() && trusted_id(&p.path).is_some())
        .or_else(|| removable().find(|p| p.is_mounted()))
        .or_else(|| removable().next())?;

    Some(ConnectedDrive {
        devnode: chosen.path.clone(),
        mount_path: chosen.primary_mount().cloned(),
        label: chosen.label.clone(),
        trusted_drive_id: trusted_id(&chosen.path),
    })
}

impl StatusAggregator {
    pub fn new(ctx: AppContext) -> Self {
        Self { ctx }
    }

    /// Never enumerates, probes or mounts.
    pub async fn snapshot(&self) -> StatusSnapshot {
        let devices = self.ctx.devices.current();
        let trusted_drives: Vec<TrustedDriveView> = self
            .ctx
            .store
            .list()
            .into_iter()
            .map(|d| view(&devices, d))
            .collect();

        let runs = self.ctx.runs.get_all().await;
        let mut running_drive_ids: Vec<String> = runs
            .iter()
            .filter(|(_, r)| r.running)
            .map(|(id, _)| id.clone())
            .collect();
        running_drive_ids.sort();
        let progress: HashMap<_, _> = runs
            .iter()
            .filter_map(|(id, r)| r.progress.clone().map(|p| (id.clone(), p)))
            .collect();

        StatusSnapshot {
            version: env!("CARGO_PKG_VERSION"),
            device_version: devices.version,
            first_run: self.ctx.store.is_first_run(),
            connected_drive: connected_drive(&devices, &trusted_drives),
            trusted_drives,
            running_drive_ids,
            progress,
            runs,
            capabilities: self.ctx.probe.latest(),
            policy: self.ctx.store.policy(),
        }
    }
}

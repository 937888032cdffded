use std::collections::HashMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use super::probe::PreflightCapabilities;
use super::retention::RetentionPolicy;

/// A physical block device as reported by the host.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Device {
    pub path: PathBuf,
    pub name: String,
    pub model: Option<String>,
    pub size: u64,
    pub removable: bool,
    pub partitions: Vec<Partition>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Partition {
    pub path: PathBuf,
    pub name: String,
    pub size: u64,
    /// None means unformatted
    pub fstype: Option<String>,
    pub uuid: Option<String>,
    pub label: Option<String>,
    /// First entry is the primary mount point
    pub mountpoints: Vec<PathBuf>,
    /// Synthetic entry standing in for a device with no partition table
    #[serde(default)]
    pub whole_disk: bool,
    /// Identity read from the on-media marker, when mounted and present
    #[serde(default)]
    pub drive_id: Option<String>,
}

impl Partition {
    pub fn primary_mount(&self) -> Option<&PathBuf> {
        self.mountpoints.first()
    }

    pub fn is_mounted(&self) -> bool {
        !self.mountpoints.is_empty()
    }
}

/// Immutable, versioned view of the host's block devices.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DeviceSnapshot {
    pub version: u64,
    pub devices: Vec<Device>,
}

impl DeviceSnapshot {
    pub fn find_partition(&self, devnode: &std::path::Path) -> Option<(&Device, &Partition)> {
        self.devices.iter().find_map(|d| {
            d.partitions
                .iter()
                .find(|p| p.path == devnode)
                .map(|p| (d, p))
        })
    }

    pub fn find_device(&self, devnode: &std::path::Path) -> Option<&Device> {
        self.devices.iter().find(|d| d.path == devnode)
    }

    /// Locate the partition currently mounted at `mount_path`.
    pub fn find_by_mount(&self, mount_path: &std::path::Path) -> Option<(&Device, &Partition)> {
        self.devices.iter().find_map(|d| {
            d.partitions
                .iter()
                .find(|p| p.mountpoints.iter().any(|m| m == mount_path))
                .map(|p| (d, p))
        })
    }

    /// Locate the partition holding a trusted drive, by marker identity first
    /// and by filesystem UUID second.
    pub fn find_drive(&self, drive: &TrustedDrive) -> Option<(&Device, &Partition)> {
        let by_marker = self.devices.iter().find_map(|d| {
            d.partitions
                .iter()
                .find(|p| p.drive_id.as_deref() == Some(drive.drive_id.as_str()))
                .map(|p| (d, p))
        });
        by_marker.or_else(|| {
            let uuid = drive.media_uuid.as_deref()?;
            self.devices.iter().find_map(|d| {
                d.partitions
                    .iter()
                    .find(|p| p.uuid.as_deref() == Some(uuid))
                    .map(|p| (d, p))
            })
        })
    }

    pub fn is_mounted_path(&self, mount_path: &std::path::Path) -> bool {
        self.find_by_mount(mount_path).is_some()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupSource {
    pub label: String,
    pub path: String,
}

/// A drive the user has set up as a backup target.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrustedDrive {
    pub drive_id: String,
    pub label: String,
    pub repository_id: String,
    /// Relative to the mount root
    pub repository_path: PathBuf,
    #[serde(default)]
    pub media_uuid: Option<String>,
    #[serde(default)]
    pub backup_sources: Vec<BackupSource>,
    #[serde(default)]
    pub remember_passphrase: bool,
    #[serde(default)]
    pub paranoid_mode: bool,
    #[serde(default)]
    pub created_epoch: i64,
    #[serde(default)]
    pub last_seen_epoch: Option<i64>,
    #[serde(default)]
    pub last_backup_epoch: Option<i64>,
    #[serde(default)]
    pub last_snapshot_id: Option<String>,
}

/// Trusted drive as reported to clients, with connection state derived from
/// the current device snapshot.
#[derive(Debug, Clone, Serialize)]
pub struct TrustedDriveView {
    #[serde(flatten)]
    pub drive: TrustedDrive,
    pub is_connected: bool,
    pub mount_path: Option<PathBuf>,
    pub devnode: Option<PathBuf>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BackupProgress {
    /// Fraction in [0, 1]
    pub percent_done: f64,
    pub files_done: u64,
    pub total_files: u64,
    pub bytes_done: u64,
    pub total_bytes: u64,
    pub message: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Success,
    Interrupted,
    Failed,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunPhase {
    #[default]
    Idle,
    BackingUp,
    Verifying,
    Pruning,
    Restoring,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunOutcome {
    pub status: RunStatus,
    pub message: Option<String>,
    pub started_epoch: i64,
    pub finished_epoch: i64,
    pub snapshot_id: Option<String>,
    pub data_added: Option<u64>,
    pub files_processed: Option<u64>,
}

/// Per-drive run state. Not persisted.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BackupRun {
    pub running: bool,
    pub phase: RunPhase,
    pub started_epoch: Option<i64>,
    pub mount_path: Option<PathBuf>,
    pub progress: Option<BackupProgress>,
    pub last_run: Option<RunOutcome>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ConnectedDrive {
    pub devnode: PathBuf,
    pub mount_path: Option<PathBuf>,
    pub label: Option<String>,
    pub trusted_drive_id: Option<String>,
}

/// Global backup policy, persisted with the trust store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupPolicy {
    pub default_sources: Vec<BackupSource>,
    #[serde(default)]
    pub include_patterns: Vec<String>,
    #[serde(default)]
    pub exclude_patterns: Vec<String>,
    #[serde(default)]
    pub retention: RetentionPolicy,
    #[serde(default = "default_true")]
    pub verify_quick: bool,
    #[serde(default)]
    pub verify_deep: bool,
}

fn default_true() -> bool {
    true
}

impl Default for BackupPolicy {
    fn default() -> Self {
        let default_sources = ["Documents", "Pictures", "Desktop"]
            .into_iter()
            .map(|name| BackupSource {
                label: name.to_string(),
                path: format!("~/{}", name),
            })
            .collect();

        Self {
            default_sources,
            include_patterns: Vec::new(),
            exclude_patterns: Vec::new(),
            retention: RetentionPolicy::default(),
            verify_quick: true,
            verify_deep: false,
        }
    }
}

/// Consistent point-in-time view of the whole daemon.
#[derive(Debug, Clone, Serialize)]
pub struct StatusSnapshot {
    pub version: &'static str,
    pub device_version: u64,
    pub first_run: bool,
    pub connected_drive: Option<ConnectedDrive>,
    pub trusted_drives: Vec<TrustedDriveView>,
    pub running_drive_ids: Vec<String>,
    pub progress: HashMap<String, BackupProgress>,
    pub runs: HashMap<String, BackupRun>,
    pub capabilities: PreflightCapabilities,
    pub policy: BackupPolicy,
}

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::models::Device;
use super::probe::HostTools;
use crate::error::DriveError;

/// Filesystems keepd can create on a backup drive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SupportedFilesystem {
    Ext4,
    #[default]
    Exfat,
    Vfat,
}

impl SupportedFilesystem {
    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "ext4" => Some(Self::Ext4),
            "exfat" => Some(Self::Exfat),
            "vfat" | "fat32" | "fat16" => Some(Self::Vfat),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ext4 => "ext4",
            Self::Exfat => "exfat",
            Self::Vfat => "vfat",
        }
    }

    /// Longest volume label the filesystem accepts.
    pub fn label_limit(&self) -> usize {
        match self {
            Self::Ext4 => 16,
            Self::Exfat | Self::Vfat => 11,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ToolFailureKind {
    /// The program is not installed
    Missing,
    /// Polkit denied the request or no agent could ask
    NotAuthorized,
    /// The helper reports the device mounted, at this path if it said where
    AlreadyMounted(Option<PathBuf>),
    /// The kernel or udisks does not (yet) see a filesystem
    NotMountable,
    Io,
}

/// Failure of an external host tool, already classified.
#[derive(Debug, Clone, Error)]
#[error("{tool}: {message}")]
pub struct ToolFailure {
    pub tool: String,
    pub kind: ToolFailureKind,
    pub message: String,
}

impl ToolFailure {
    pub fn new(tool: &str, kind: ToolFailureKind, message: impl Into<String>) -> Self {
        Self {
            tool: tool.to_string(),
            kind,
            message: message.into(),
        }
    }

    pub fn missing(tool: &str) -> Self {
        Self::new(tool, ToolFailureKind::Missing, "not installed")
    }

    pub fn io(tool: &str, message: impl Into<String>) -> Self {
        Self::new(tool, ToolFailureKind::Io, message)
    }
}

impl From<ToolFailure> for DriveError {
    fn from(f: ToolFailure) -> Self {
        match f.kind {
            ToolFailureKind::Missing => DriveError::ToolMissing(f.tool),
            ToolFailureKind::NotAuthorized => DriveError::AuthorizationRequired(f.to_string()),
            ToolFailureKind::AlreadyMounted(_) => DriveError::AlreadyMounted(f.message),
            ToolFailureKind::NotMountable => DriveError::NoFilesystem(f.message),
            ToolFailureKind::Io => DriveError::IoFailure(f.to_string()),
        }
    }
}

/// Host block-device access. Every method may shell out and is expected to be
/// bounded by the caller.
#[async_trait]
pub trait HardwareAdapter: Send + Sync {
    /// Current block-device topology. Partitions come back without marker
    /// identity and without synthetic whole-disk entries.
    async fn list_devices(&self) -> anyhow::Result<Vec<Device>>;

    /// Which host tools are available.
    async fn host_tools(&self) -> HostTools;

    /// Mount a partition for the invoking user, returning the mount point.
    async fn mount(&self, devnode: &Path) -> Result<PathBuf, ToolFailure>;

    async fn unmount(&self, devnode: &Path) -> Result<(), ToolFailure>;

    /// Spin down and detach a whole disk.
    async fn power_off(&self, disk: &Path) -> Result<(), ToolFailure>;

    /// Write a fresh GPT label with one partition spanning the disk.
    async fn create_partition_table(&self, disk: &Path) -> Result<(), ToolFailure>;

    async fn make_filesystem(
        &self,
        devnode: &Path,
        filesystem: SupportedFilesystem,
        label: &str,
    ) -> Result<(), ToolFailure>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn filesystem_names_round_trip() {
        assert_eq!(SupportedFilesystem::from_str("FAT32"), Some(SupportedFilesystem::Vfat));
        assert_eq!(SupportedFilesystem::from_str("exfat").unwrap().as_str(), "exfat");
        assert_eq!(SupportedFilesystem::from_str("ntfs"), None);
        assert_eq!(SupportedFilesystem::Exfat.label_limit(), 11);
    }

    #[test]
    fn failure_kinds_map_to_taxonomy() {
        let e: DriveError = ToolFailure::new("pkexec", ToolFailureKind::NotAuthorized, "denied").into();
        assert!(matches!(e, DriveError::AuthorizationRequired(_)));
        let e: DriveError = ToolFailure::missing("parted").into();
        assert!(matches!(e, DriveError::ToolMissing(t) if t == "parted"));
        let e: DriveError = ToolFailure::io("udisksctl", "boom").into();
        assert!(matches!(e, DriveError::IoFailure(_)));
    }
}

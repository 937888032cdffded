//! On-media identity marker, `.keepd/drive.json` at the root of a trusted drive.

use std::path::{Component, Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use super::persist::write_json_atomic;

pub const MARKER_DIR: &str = ".keepd";
pub const MARKER_FILE: &str = "drive.json";
pub const REPOSITORY_DIR: &str = "repo";
/// Hex characters in a drive id
pub const DRIVE_ID_LEN: usize = 32;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DriveMarker {
    pub drive_id: String,
    pub label: String,
    #[serde(default)]
    pub repository_id: Option<String>,
    pub repository_path: PathBuf,
    pub created_epoch: i64,
}

impl DriveMarker {
    pub fn path(mount: &Path) -> PathBuf {
        mount.join(MARKER_DIR).join(MARKER_FILE)
    }

    pub fn default_repository_path() -> PathBuf {
        Path::new(MARKER_DIR).join(REPOSITORY_DIR)
    }

    /// Read the marker of a mounted drive. Ok(None) when there is none.
    pub fn read(mount: &Path) -> Result<Option<Self>> {
        let path = Self::path(mount);
        let data = match std::fs::read(&path) {
            Ok(d) => d,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(e).with_context(|| format!("Failed to read {}", path.display()));
            }
        };
        let marker = serde_json::from_slice(&data)
            .with_context(|| format!("Malformed drive marker at {}", path.display()))?;
        Ok(Some(marker))
    }

    /// Markers live on removable media and are edited outside the daemon.
    /// The drive id must be the hex form this daemon generates, and the
    /// repository must be a plain relative path below the mount point.
    pub fn validate(&self) -> std::result::Result<(), String> {
        let id_ok = self.drive_id.len() == DRIVE_ID_LEN
            && self
                .drive_id
                .chars()
                .all(|c| c.is_ascii_digit() || ('a'..='f').contains(&c));
        if !id_ok {
            return Err(format!("drive marker has a malformed drive id {:?}", self.drive_id));
        }

        let mut components = self.repository_path.components().peekable();
        let relative = components.peek().is_some()
            && components.all(|c| matches!(c, Component::Normal(_)));
        if !relative {
            return Err(format!(
                "drive marker points the repository outside the drive ({})",
                self.repository_path.display()
            ));
        }
        Ok(())
    }

    pub fn write(&self, mount: &Path) -> Result<()> {
        write_json_atomic(&Self::path(mount), self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_marker_is_none() {
        let dir = tempfile::tempdir().unwrap();
        assert!(DriveMarker::read(dir.path()).unwrap().is_none());
    }

    #[test]
    fn written_marker_reads_back() {
        let dir = tempfile::tempdir().unwrap();
        let marker = DriveMarker {
            drive_id: "0123456789abcdef0123456789abcdef".into(),
            label: "Travel".into(),
            repository_id: None,
            repository_path: DriveMarker::default_repository_path(),
            created_epoch: 42,
        };
        marker.write(dir.path()).unwrap();

        assert!(dir.path().join(".keepd/drive.json").exists());
        assert_eq!(DriveMarker::read(dir.path()).unwrap(), Some(marker));
    }

    fn marker(drive_id: &str, repository_path: &str) -> DriveMarker {
        DriveMarker {
            drive_id: drive_id.into(),
            label: "x".into(),
            repository_id: None,
            repository_path: PathBuf::from(repository_path),
            created_epoch: 0,
        }
    }

    #[test]
    fn validation_rejects_foreign_identity_and_paths() {
        let id = "0123456789abcdef0123456789abcdef";
        assert!(marker(id, ".keepd/repo").validate().is_ok());

        assert!(marker("../../evil", ".keepd/repo").validate().is_err());
        assert!(marker("0123456789ABCDEF0123456789ABCDEF", ".keepd/repo").validate().is_err());
        assert!(marker("abc", ".keepd/repo").validate().is_err());

        assert!(marker(id, "/var/lib/repo").validate().is_err());
        assert!(marker(id, ".keepd/../../repo").validate().is_err());
        assert!(marker(id, "./repo").validate().is_err());
        assert!(marker(id, "").validate().is_err());
    }

    #[test]
    fn garbage_marker_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join(MARKER_DIR)).unwrap();
        std::fs::write(DriveMarker::path(dir.path()), b"not json").unwrap();
        assert!(DriveMarker::read(dir.path()).is_err());
    }
}

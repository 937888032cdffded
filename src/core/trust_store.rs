//! Persisted set of trusted drives and the global backup policy.
//!
//! The store is one JSON file, replaced atomically on every change. Writers
//! are serialized; each mutation is applied to a copy, written to disk, and
//! only then published to readers. A failed write leaves memory unchanged.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::marker::DriveMarker;
use super::models::{BackupPolicy, TrustedDrive};
use super::persist::write_json_atomic;
use crate::error::{DriveError, DriveResult};

pub const LABEL_MAX_LEN: usize = 512;
const STORE_VERSION: u32 = 1;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct StoreFile {
    version: u32,
    #[serde(default)]
    policy: BackupPolicy,
    #[serde(default)]
    drives: BTreeMap<String, TrustedDrive>,
}

impl Default for StoreFile {
    fn default() -> Self {
        Self {
            version: STORE_VERSION,
            policy: BackupPolicy::default(),
            drives: BTreeMap::new(),
        }
    }
}

impl StoreFile {
    fn normalize(&mut self) {
        for drive in self.drives.values_mut() {
            drive.label = sanitize_label(&drive.label);
            if drive.paranoid_mode && drive.remember_passphrase {
                warn!(drive_id = %drive.drive_id, "Paranoid drive had remember set, clearing");
                drive.remember_passphrase = false;
            }
        }
    }
}

/// Trim, drop control characters and cap the length of a user-supplied label.
pub fn sanitize_label(label: &str) -> String {
    label
        .trim()
        .chars()
        .filter(|c| !c.is_control())
        .take(LABEL_MAX_LEN)
        .collect::<String>()
        .trim()
        .to_string()
}

pub struct TrustStore {
    path: PathBuf,
    current: RwLock<Arc<StoreFile>>,
    writer: Mutex<()>,
}

impl TrustStore {
    /// Load the store from `path`, starting empty when the file does not exist.
    pub fn load(path: &Path) -> Result<Self> {
        let mut file = match std::fs::read(path) {
            Ok(data) => serde_json::from_slice::<StoreFile>(&data)
                .with_context(|| format!("Malformed trust store at {}", path.display()))?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %path.display(), "No trust store yet, starting empty");
                StoreFile::default()
            }
            Err(e) => {
                return Err(e).with_context(|| format!("Failed to read {}", path.display()));
            }
        };
        file.normalize();

        info!(
            path = %path.display(),
            drives = file.drives.len(),
            "Loaded trust store"
        );

        Ok(Self {
            path: path.to_path_buf(),
            current: RwLock::new(Arc::new(file)),
            writer: Mutex::new(()),
        })
    }

    fn snapshot(&self) -> Arc<StoreFile> {
        match self.current.read() {
            Ok(c) => c.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    fn publish(&self, file: StoreFile) {
        let mut current = match self.current.write() {
            Ok(c) => c,
            Err(poisoned) => poisoned.into_inner(),
        };
        *current = Arc::new(file);
    }

    async fn mutate<R>(
        &self,
        f: impl FnOnce(&mut StoreFile) -> DriveResult<R>,
    ) -> DriveResult<R> {
        let _writer = self.writer.lock().await;
        let mut next = (*self.snapshot()).clone();
        let result = f(&mut next)?;
        next.normalize();

        let path = self.path.clone();
        let to_write = next.clone();
        tokio::task::spawn_blocking(move || write_json_atomic(&path, &to_write))
            .await
            .map_err(|e| DriveError::IoFailure(e.to_string()))?
            .map_err(|e| DriveError::IoFailure(format!("{:#}", e)))?;

        self.publish(next);
        Ok(result)
    }

    pub fn is_first_run(&self) -> bool {
        self.snapshot().drives.is_empty()
    }

    pub fn list(&self) -> Vec<TrustedDrive> {
        self.snapshot().drives.values().cloned().collect()
    }

    pub fn get(&self, drive_id: &str) -> Option<TrustedDrive> {
        self.snapshot().drives.get(drive_id).cloned()
    }

    pub fn policy(&self) -> BackupPolicy {
        self.snapshot().policy.clone()
    }

    /// Whether another drive already uses `label`, ignoring case.
    pub fn label_taken(&self, label: &str, except: Option<&str>) -> bool {
        let wanted = label.to_lowercase();
        self.snapshot()
            .drives
            .values()
            .any(|d| Some(d.drive_id.as_str()) != except && d.label.to_lowercase() == wanted)
    }

    pub fn find_by_media_identity(&self, marker: &DriveMarker) -> Option<TrustedDrive> {
        self.get(&marker.drive_id)
    }

    pub async fn insert(&self, drive: TrustedDrive) -> DriveResult<TrustedDrive> {
        self.mutate(|file| {
            if file.drives.contains_key(&drive.drive_id) {
                return Err(DriveError::AlreadyTrusted(drive.drive_id.clone()));
            }
            file.drives.insert(drive.drive_id.clone(), drive.clone());
            Ok(drive)
        })
        .await
    }

    /// Apply `f` to one drive record and persist the result.
    pub async fn update(
        &self,
        drive_id: &str,
        f: impl FnOnce(&mut TrustedDrive) -> DriveResult<()>,
    ) -> DriveResult<TrustedDrive> {
        self.mutate(|file| {
            let drive = file
                .drives
                .get_mut(drive_id)
                .ok_or_else(|| DriveError::NotFound(drive_id.to_string()))?;
            f(drive)?;
            Ok(drive.clone())
        })
        .await
    }

    pub async fn remove(&self, drive_id: &str) -> DriveResult<TrustedDrive> {
        self.mutate(|file| {
            file.drives
                .remove(drive_id)
                .ok_or_else(|| DriveError::NotFound(drive_id.to_string()))
        })
        .await
    }

    pub async fn set_policy(&self, policy: BackupPolicy) -> DriveResult<BackupPolicy> {
        self.mutate(|file| {
            file.policy = policy.clone();
            Ok(policy)
        })
        .await
    }

    pub async fn record_backup(
        &self,
        drive_id: &str,
        epoch: i64,
        snapshot_id: Option<String>,
    ) -> DriveResult<TrustedDrive> {
        self.update(drive_id, |d| {
            d.last_backup_epoch = Some(epoch);
            d.last_seen_epoch = Some(epoch);
            if snapshot_id.is_some() {
                d.last_snapshot_id = snapshot_id;
            }
            Ok(())
        })
        .await
    }

    pub async fn record_seen(&self, drive_id: &str, epoch: i64) -> DriveResult<TrustedDrive> {
        self.update(drive_id, |d| {
            d.last_seen_epoch = Some(epoch);
            Ok(())
        })
        .await
    }
}

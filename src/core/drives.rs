//! Trust lifecycle: setting up, editing and discontinuing backup drives.

use std::path::{Path, PathBuf};

use serde::Serialize;
use tracing::{info, warn};
use uuid::Uuid;

use super::engine::{Engine, EngineError};
use super::marker::{DriveMarker, MARKER_DIR};
use super::models::{BackupPolicy, BackupSource, TrustedDrive};
use super::recovery::RecoveryKit;
use super::secrets::{Passphrase, SecretMode};
use super::trust_store::sanitize_label;
use crate::context::AppContext;
use crate::error::{DriveError, DriveResult};

/// Everything needed to turn a mounted removable drive into a backup target.
#[derive(Debug)]
pub struct SetupRequest {
    pub mount_path: PathBuf,
    pub label: Option<String>,
    pub backup_sources: Vec<BackupSource>,
    pub passphrase: Passphrase,
    pub remember_passphrase: bool,
    pub paranoid_mode: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct DiscontinueOutcome {
    pub drive_id: String,
    pub wiped: bool,
}

pub struct DriveManager {
    ctx: AppContext,
}

fn now() -> i64 {
    chrono::Utc::now().timestamp()
}

fn generated_label() -> String {
    let id = Uuid::now_v7().simple().to_string();
    format!("backup-{}", &id[id.len() - 6..])
}

/// Stable identity for a new drive: filesystem UUID mixed with fresh entropy.
fn new_drive_id(media_uuid: Option<&str>) -> String {
    let mut hasher = blake3::Hasher::new();
    hasher.update(media_uuid.unwrap_or_default().as_bytes());
    hasher.update(Uuid::now_v7().as_bytes());
    hasher.finalize().to_hex()[..32].to_string()
}

fn validate_sources(sources: &[BackupSource]) -> DriveResult<()> {
    for source in sources {
        if source.path.trim().is_empty() {
            return Err(DriveError::InvalidInput("backup source path is empty".into()));
        }
        if source.label.trim().is_empty() {
            return Err(DriveError::InvalidInput(format!(
                "backup source {} has no label",
                source.path
            )));
        }
    }
    Ok(())
}

fn repository_initialized(repo: &Path) -> bool {
    repo.join("config").is_file()
}

impl DriveManager {
    pub fn new(ctx: AppContext) -> Self {
        Self { ctx }
    }

    fn unique_label(&self, requested: Option<&str>, except: Option<&str>) -> DriveResult<String> {
        let label = requested.map(sanitize_label).unwrap_or_default();
        let label = if label.is_empty() {
            match requested {
                Some(raw) if !raw.trim().is_empty() => {
                    return Err(DriveError::InvalidInput("label has no printable characters".into()));
                }
                _ => generated_label(),
            }
        } else {
            label
        };
        if self.ctx.store.label_taken(&label, except) {
            return Err(DriveError::InvalidInput(format!(
                "another drive is already labelled \"{}\"",
                label
            )));
        }
        Ok(label)
    }

    /// Trust the removable drive mounted at `mount_path`.
    ///
    /// Writes the identity marker, initializes (or reopens) the repository
    /// and persists the record. A drive that was trusted before and then
    /// discontinued keeps its identity and repository.
    pub async fn setup(&self, request: SetupRequest) -> DriveResult<TrustedDrive> {
        if request.passphrase.is_empty() {
            return Err(DriveError::InvalidInput("passphrase must not be empty".into()));
        }
        validate_sources(&request.backup_sources)?;

        let snapshot = self.ctx.devices.refresh().await;
        let (device, partition) = snapshot
            .find_by_mount(&request.mount_path)
            .map(|(d, p)| (d.clone(), p.clone()))
            .ok_or_else(|| DriveError::InvalidMount(request.mount_path.display().to_string()))?;
        if !device.removable {
            return Err(DriveError::InvalidMount(format!(
                "{} is not on a removable device",
                request.mount_path.display()
            )));
        }
        let mount = request.mount_path.clone();

        let existing = DriveMarker::read(&mount).map_err(|e| DriveError::IoFailure(format!("{:#}", e)))?;
        if let Some(marker) = &existing {
            marker
                .validate()
                .map_err(|e| DriveError::InvalidMount(format!("{}: {}", mount.display(), e)))?;
            if self.ctx.store.find_by_media_identity(marker).is_some() {
                return Err(DriveError::AlreadyTrusted(marker.drive_id.clone()));
            }
        }

        let label = self.unique_label(request.label.as_deref(), None)?;
        let engine = Engine::resolve(self.ctx.config.engine_path.as_deref())?;

        let lock_key = existing
            .as_ref()
            .map(|m| m.drive_id.clone())
            .unwrap_or_else(|| device.path.display().to_string());
        let _guard = self
            .ctx
            .locks
            .try_acquire(&lock_key)
            .ok_or_else(|| DriveError::AlreadyRunning(lock_key.clone()))?;

        let created_epoch = now();
        let mut marker = match existing {
            Some(mut marker) => {
                info!(drive_id = %marker.drive_id, "Re-trusting previously used drive");
                marker.label = label.clone();
                marker
            }
            None => DriveMarker {
                drive_id: new_drive_id(partition.uuid.as_deref()),
                label: label.clone(),
                repository_id: None,
                repository_path: DriveMarker::default_repository_path(),
                created_epoch,
            },
        };
        marker
            .write(&mount)
            .map_err(|e| DriveError::IoFailure(format!("{:#}", e)))?;

        let repo = mount.join(&marker.repository_path);
        if repository_initialized(&repo) {
            info!(drive_id = %marker.drive_id, "Opening existing repository");
        } else {
            if let Err(e) = engine.init(&repo, &request.passphrase).await {
                return Err(match e {
                    EngineError::Spawn(_) => DriveError::EngineUnavailable,
                    other => DriveError::EngineInitFailed(other.to_string()),
                });
            }
        }

        let repository_id = engine
            .repository_id(&repo, &request.passphrase)
            .await
            .map_err(DriveError::from)?;
        if let Some(known) = marker.repository_id.as_deref() {
            if known != repository_id {
                return Err(DriveError::Failed(format!(
                    "repository on drive changed (expected {}, found {})",
                    known, repository_id
                )));
            }
        }
        marker.repository_id = Some(repository_id.clone());
        marker
            .write(&mount)
            .map_err(|e| DriveError::IoFailure(format!("{:#}", e)))?;

        let paranoid = request.paranoid_mode;
        let drive = TrustedDrive {
            drive_id: marker.drive_id.clone(),
            label,
            repository_id,
            repository_path: marker.repository_path.clone(),
            media_uuid: partition.uuid.clone(),
            backup_sources: request.backup_sources,
            remember_passphrase: request.remember_passphrase && !paranoid,
            paranoid_mode: paranoid,
            created_epoch: marker.created_epoch,
            last_seen_epoch: Some(created_epoch),
            last_backup_epoch: None,
            last_snapshot_id: None,
        };
        let drive = self.ctx.store.insert(drive).await?;

        self.ctx.secrets.set_mode(
            &drive.drive_id,
            SecretMode::from_flags(drive.remember_passphrase, drive.paranoid_mode),
        );
        self.ctx.secrets.put(&drive.drive_id, &request.passphrase);

        // Marker identity shows up on the next enumeration
        self.ctx.devices.refresh().await;
        info!(drive_id = %drive.drive_id, label = %drive.label, "Drive trusted");
        Ok(drive)
    }

    /// Change a drive's label and/or sources. Only allowed while idle.
    pub async fn update(
        &self,
        drive_id: &str,
        label: Option<String>,
        backup_sources: Option<Vec<BackupSource>>,
    ) -> DriveResult<TrustedDrive> {
        let current = self
            .ctx
            .store
            .get(drive_id)
            .ok_or_else(|| DriveError::NotFound(drive_id.to_string()))?;
        let _guard = self
            .ctx
            .locks
            .try_acquire(drive_id)
            .ok_or_else(|| DriveError::AlreadyRunning(drive_id.to_string()))?;

        let label = match label {
            Some(l) => {
                let clean = sanitize_label(&l);
                if clean.is_empty() {
                    return Err(DriveError::InvalidInput("label must not be empty".into()));
                }
                Some(self.unique_label(Some(&clean), Some(drive_id))?)
            }
            None => None,
        };
        if let Some(sources) = &backup_sources {
            validate_sources(sources)?;
        }

        let updated = self
            .ctx
            .store
            .update(drive_id, |d| {
                if let Some(l) = label.clone() {
                    d.label = l;
                }
                if let Some(s) = backup_sources {
                    d.backup_sources = s;
                }
                Ok(())
            })
            .await?;

        if updated.label != current.label {
            self.sync_marker_label(&updated);
        }
        Ok(updated)
    }

    fn sync_marker_label(&self, drive: &TrustedDrive) {
        let snapshot = self.ctx.devices.current();
        let Some(mount) = snapshot
            .find_drive(drive)
            .and_then(|(_, p)| p.primary_mount().cloned())
        else {
            return;
        };
        match DriveMarker::read(&mount) {
            Ok(Some(mut marker)) if marker.drive_id == drive.drive_id => {
                marker.label = drive.label.clone();
                if let Err(e) = marker.write(&mount) {
                    warn!(drive_id = %drive.drive_id, error = %e, "Could not update label on drive");
                }
            }
            Ok(_) => {}
            Err(e) => warn!(drive_id = %drive.drive_id, error = %e, "Could not read drive marker"),
        }
    }

    /// Change whether the passphrase may be remembered. Paranoid wins.
    pub async fn set_security(
        &self,
        drive_id: &str,
        remember_passphrase: bool,
        paranoid_mode: bool,
    ) -> DriveResult<TrustedDrive> {
        let updated = self
            .ctx
            .store
            .update(drive_id, |d| {
                d.paranoid_mode = paranoid_mode;
                d.remember_passphrase = remember_passphrase && !paranoid_mode;
                Ok(())
            })
            .await?;
        self.ctx.secrets.set_mode(
            drive_id,
            SecretMode::from_flags(updated.remember_passphrase, updated.paranoid_mode),
        );
        info!(
            drive_id,
            remember = updated.remember_passphrase,
            paranoid = updated.paranoid_mode,
            "Security settings changed"
        );
        Ok(updated)
    }

    /// Stop trusting a drive. `confirm_label` must match the label exactly.
    ///
    /// Trust is removed before any wipe is attempted, so a failed wipe still
    /// leaves the drive untrusted.
    pub async fn discontinue(
        &self,
        drive_id: &str,
        confirm_label: &str,
        wipe: bool,
    ) -> DriveResult<DiscontinueOutcome> {
        let drive = self
            .ctx
            .store
            .get(drive_id)
            .ok_or_else(|| DriveError::NotFound(drive_id.to_string()))?;
        if confirm_label != drive.label {
            return Err(DriveError::LabelMismatch);
        }
        let _guard = self
            .ctx
            .locks
            .try_acquire(drive_id)
            .ok_or_else(|| DriveError::AlreadyRunning(drive_id.to_string()))?;

        // Resolve the mount before the record disappears
        let mount = self
            .ctx
            .devices
            .current()
            .find_drive(&drive)
            .and_then(|(_, p)| p.primary_mount().cloned());

        self.ctx.store.remove(drive_id).await?;
        self.ctx.secrets.forget(drive_id);
        self.ctx.runs.remove(drive_id).await;
        info!(drive_id, "Drive discontinued");

        if !wipe {
            return Ok(DiscontinueOutcome {
                drive_id: drive_id.to_string(),
                wiped: false,
            });
        }

        let mount = mount.ok_or_else(|| DriveError::WipeFailed("drive is not connected".into()))?;
        let target = mount.join(MARKER_DIR);
        tokio::task::spawn_blocking(move || match std::fs::remove_dir_all(&target) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e),
        })
        .await
        .map_err(|e| DriveError::WipeFailed(e.to_string()))?
        .map_err(|e| DriveError::WipeFailed(e.to_string()))?;

        info!(drive_id, mount = %mount.display(), "Backup data wiped from drive");
        Ok(DiscontinueOutcome {
            drive_id: drive_id.to_string(),
            wiped: true,
        })
    }

    pub async fn export_recovery_kit(&self, drive_id: &str, destination: &Path) -> DriveResult<Vec<PathBuf>> {
        let drive = self
            .ctx
            .store
            .get(drive_id)
            .ok_or_else(|| DriveError::NotFound(drive_id.to_string()))?;
        if !destination.is_absolute() {
            return Err(DriveError::InvalidInput("destination must be an absolute path".into()));
        }
        let destination = destination.to_path_buf();
        let files = tokio::task::spawn_blocking(move || RecoveryKit::for_drive(&drive).write(&destination))
            .await
            .map_err(|e| DriveError::IoFailure(e.to_string()))?
            .map_err(|e| DriveError::IoFailure(format!("{:#}", e)))?;
        info!(drive_id, "Recovery kit exported");
        Ok(files)
    }

    pub async fn set_policy(&self, policy: BackupPolicy) -> DriveResult<BackupPolicy> {
        validate_sources(&policy.default_sources)?;
        if policy.exclude_patterns.iter().chain(&policy.include_patterns).any(|p| p.trim().is_empty()) {
            return Err(DriveError::InvalidInput("patterns must not be empty".into()));
        }
        self.ctx.store.set_policy(policy).await
    }
}

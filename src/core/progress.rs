//! In-memory run state for every drive.
//!
//! Progress changes many times a second and is never persisted; only the
//! outcome of a finished backup reaches the trust store.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

use super::models::{BackupProgress, BackupRun, RunOutcome, RunPhase};

struct RunEntry {
    run: BackupRun,
    cancel: Option<CancellationToken>,
}

/// Thread-safe table of per-drive runs, shared through `AppContext`.
#[derive(Clone, Default)]
pub struct RunTable {
    inner: Arc<RwLock<HashMap<String, RunEntry>>>,
}

/// A running operation whose drive may disappear underneath it.
#[derive(Debug, Clone)]
pub struct ActiveRun {
    pub drive_id: String,
    pub mount_path: PathBuf,
    pub cancel: CancellationToken,
}

impl RunTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark a drive as running. Callers hold the drive lock, so there is
    /// never an existing running entry here.
    pub async fn begin(
        &self,
        drive_id: &str,
        phase: RunPhase,
        started_epoch: i64,
        mount_path: PathBuf,
        cancel: CancellationToken,
    ) {
        let mut map = self.inner.write().await;
        let entry = map.entry(drive_id.to_string()).or_insert_with(|| RunEntry {
            run: BackupRun::default(),
            cancel: None,
        });
        entry.run.running = true;
        entry.run.phase = phase;
        entry.run.started_epoch = Some(started_epoch);
        entry.run.mount_path = Some(mount_path);
        entry.run.progress = (phase == RunPhase::BackingUp).then(BackupProgress::default);
        entry.cancel = Some(cancel);
    }

    /// Update progress. Called on every progress line from the engine.
    pub async fn update_progress(&self, drive_id: &str, progress: BackupProgress) {
        let mut map = self.inner.write().await;
        if let Some(entry) = map.get_mut(drive_id) {
            if entry.run.running {
                entry.run.progress = Some(progress);
            }
        }
    }

    pub async fn set_phase(&self, drive_id: &str, phase: RunPhase) {
        let mut map = self.inner.write().await;
        if let Some(entry) = map.get_mut(drive_id) {
            entry.run.phase = phase;
        }
    }

    /// Clear the running state. A backup also records its outcome.
    pub async fn finish(&self, drive_id: &str, outcome: Option<RunOutcome>) {
        let mut map = self.inner.write().await;
        if let Some(entry) = map.get_mut(drive_id) {
            entry.run.running = false;
            entry.run.phase = RunPhase::Idle;
            entry.run.progress = None;
            entry.run.mount_path = None;
            entry.run.started_epoch = None;
            entry.cancel = None;
            if outcome.is_some() {
                entry.run.last_run = outcome;
            }
        }
    }

    pub async fn get(&self, drive_id: &str) -> Option<BackupRun> {
        let map = self.inner.read().await;
        map.get(drive_id).map(|e| e.run.clone())
    }

    pub async fn get_all(&self) -> HashMap<String, BackupRun> {
        let map = self.inner.read().await;
        map.iter().map(|(k, v)| (k.clone(), v.run.clone())).collect()
    }

    pub async fn running(&self) -> Vec<ActiveRun> {
        let map = self.inner.read().await;
        map.iter()
            .filter(|(_, e)| e.run.running)
            .filter_map(|(id, e)| {
                Some(ActiveRun {
                    drive_id: id.clone(),
                    mount_path: e.run.mount_path.clone()?,
                    cancel: e.cancel.clone()?,
                })
            })
            .collect()
    }

    /// Number of drives with a running operation.
    pub async fn active_count(&self) -> usize {
        let map = self.inner.read().await;
        map.values().filter(|e| e.run.running).count()
    }

    /// Drop all state for a drive that is no longer trusted.
    pub async fn remove(&self, drive_id: &str) {
        let mut map = self.inner.write().await;
        map.remove(drive_id);
    }
}

//! Backup runs and everything else that talks to a drive's repository.
//!
//! A run holds its drive lock from `start` until the last follow-up finishes.
//! The only way a run is cancelled is the drive disappearing, which the
//! reconciler notices on the next device snapshot.

use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::engine::{BackupRequest, BackupSummary, Engine, EngineError, RepoStats, Snapshot};
use super::home::{expand_home, invoking_user_home};
use super::locks::DriveGuard;
use super::models::{BackupPolicy, BackupProgress, RunOutcome, RunPhase, RunStatus, TrustedDrive};
use super::secrets::Passphrase;
use crate::context::AppContext;
use crate::error::{DriveError, DriveResult};
use crate::logging::{LogThrottle, bounded_message};

const BACKUP_TAG: &str = "keepd";
const PROGRESS_LOG_INTERVAL: Duration = Duration::from_secs(5);
const PROGRESS_BUFFER: usize = 64;

#[derive(Debug, Clone, Serialize)]
pub struct Started {
    pub drive_id: String,
    pub started_epoch: i64,
    pub mount_path: PathBuf,
}

/// Everything a spawned run needs, moved into the task.
struct BackupJob {
    drive: TrustedDrive,
    engine: Engine,
    mount: PathBuf,
    repo: PathBuf,
    passphrase: Passphrase,
    policy: BackupPolicy,
    started_epoch: i64,
    cancel: CancellationToken,
}

pub struct BackupOrchestrator {
    ctx: AppContext,
}

fn now() -> i64 {
    chrono::Utc::now().timestamp()
}

/// Snapshot ids are passed as positional arguments; refuse anything that
/// could be read as a flag.
fn validate_snapshot_id(id: &str) -> DriveResult<()> {
    if id.is_empty() || id.starts_with('-') || !id.chars().all(|c| c.is_ascii_alphanumeric() || c == ':') {
        return Err(DriveError::InvalidInput(format!("invalid snapshot id {:?}", id)));
    }
    Ok(())
}

async fn cancellable<T>(cancel: &CancellationToken, fut: impl Future<Output = T>) -> Option<T> {
    tokio::select! {
        value = fut => Some(value),
        _ = cancel.cancelled() => None,
    }
}

impl BackupOrchestrator {
    pub fn new(ctx: AppContext) -> Self {
        Self { ctx }
    }

    /// Mount point of a trusted drive, re-enumerating once if the cached
    /// snapshot does not show it.
    async fn mount_for(&self, drive: &TrustedDrive) -> DriveResult<PathBuf> {
        let cached = self.ctx.devices.current();
        if let Some(mount) = cached.find_drive(drive).and_then(|(_, p)| p.primary_mount().cloned()) {
            return Ok(mount);
        }
        let snapshot = self.ctx.devices.refresh().await;
        snapshot
            .find_drive(drive)
            .and_then(|(_, p)| p.primary_mount().cloned())
            .ok_or_else(|| DriveError::NotConnected(drive.drive_id.clone()))
    }

    fn passphrase_for(&self, drive_id: &str, provided: Option<Passphrase>) -> DriveResult<Passphrase> {
        match provided {
            Some(p) if !p.is_empty() => Ok(p),
            _ => self
                .ctx
                .secrets
                .get(drive_id)
                .ok_or_else(|| DriveError::AuthFailed("passphrase required".into())),
        }
    }

    /// Classify an engine error for a caller, dropping a cached passphrase
    /// the repository just rejected.
    fn engine_error(&self, drive_id: &str, e: EngineError) -> DriveError {
        if matches!(e, EngineError::AuthFailed) {
            self.ctx.secrets.clear(drive_id);
        }
        e.into()
    }

    /// Check the passphrase opens the repository the drive was set up with.
    async fn verify_repository(
        &self,
        drive: &TrustedDrive,
        engine: &Engine,
        repo: &Path,
        passphrase: &Passphrase,
    ) -> DriveResult<()> {
        let id = engine
            .repository_id(repo, passphrase)
            .await
            .map_err(|e| self.engine_error(&drive.drive_id, e))?;
        if id != drive.repository_id {
            return Err(DriveError::Failed(format!(
                "repository on drive does not match (expected {}, found {})",
                drive.repository_id, id
            )));
        }
        self.ctx.secrets.put(&drive.drive_id, passphrase);
        Ok(())
    }

    /// Everything read-only operations need: the record, mount, engine and a
    /// usable passphrase.
    async fn open(
        &self,
        drive_id: &str,
        passphrase: Option<Passphrase>,
    ) -> DriveResult<(TrustedDrive, PathBuf, Engine, Passphrase)> {
        let drive = self
            .ctx
            .store
            .get(drive_id)
            .ok_or_else(|| DriveError::NotTrusted(drive_id.to_string()))?;
        let mount = self.mount_for(&drive).await?;
        let engine = Engine::resolve(self.ctx.config.engine_path.as_deref())?;
        let passphrase = self.passphrase_for(drive_id, passphrase)?;
        Ok((drive, mount, engine, passphrase))
    }

    /// Start a backup of a trusted, connected drive. Returns once the run
    /// is registered; the backup itself continues in the background.
    pub async fn start(&self, drive_id: &str, passphrase: Option<Passphrase>) -> DriveResult<Started> {
        let (drive, mount, engine, passphrase) = self.open(drive_id, passphrase).await?;

        let guard = self
            .ctx
            .locks
            .try_acquire(drive_id)
            .ok_or_else(|| DriveError::AlreadyRunning(drive_id.to_string()))?;

        let repo = mount.join(&drive.repository_path);
        self.verify_repository(&drive, &engine, &repo, &passphrase).await?;

        let started_epoch = now();
        let cancel = CancellationToken::new();
        self.ctx
            .runs
            .begin(drive_id, RunPhase::BackingUp, started_epoch, mount.clone(), cancel.clone())
            .await;

        info!(drive_id, mount = %mount.display(), "Backup started");
        let job = BackupJob {
            policy: self.ctx.store.policy(),
            drive,
            engine,
            mount: mount.clone(),
            repo,
            passphrase,
            started_epoch,
            cancel,
        };
        let ctx = self.ctx.clone();
        tokio::spawn(run_backup(ctx, job, guard));

        Ok(Started {
            drive_id: drive_id.to_string(),
            started_epoch,
            mount_path: mount,
        })
    }

    /// Cancel every run whose drive is no longer mounted.
    pub async fn reconcile(&self) -> usize {
        let snapshot = self.ctx.devices.current();
        let mut cancelled = 0;
        for run in self.ctx.runs.running().await {
            if snapshot.is_mounted_path(&run.mount_path) || run.cancel.is_cancelled() {
                continue;
            }
            warn!(
                drive_id = %run.drive_id,
                mount = %run.mount_path.display(),
                "Drive disappeared during a run, cancelling"
            );
            run.cancel.cancel();
            cancelled += 1;
        }
        cancelled
    }

    /// Reconcile on every published device snapshot until `cancel` fires.
    pub async fn run_reconciler(self: Arc<Self>, cancel: CancellationToken) {
        let mut rx = self.ctx.devices.subscribe();
        loop {
            tokio::select! {
                changed = rx.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    self.reconcile().await;
                }
                _ = cancel.cancelled() => break,
            }
        }
        debug!("Reconciler stopped");
    }

    pub async fn snapshots(&self, drive_id: &str, passphrase: Option<Passphrase>) -> DriveResult<Vec<Snapshot>> {
        let (drive, mount, engine, passphrase) = self.open(drive_id, passphrase).await?;
        let repo = mount.join(&drive.repository_path);
        let snapshots = engine
            .snapshots(&repo, &passphrase)
            .await
            .map_err(|e| self.engine_error(drive_id, e))?;
        self.ctx.secrets.put(drive_id, &passphrase);
        Ok(snapshots)
    }

    pub async fn stats(
        &self,
        drive_id: &str,
        snapshot_id: Option<&str>,
        passphrase: Option<Passphrase>,
    ) -> DriveResult<RepoStats> {
        if let Some(id) = snapshot_id {
            validate_snapshot_id(id)?;
        }
        let (drive, mount, engine, passphrase) = self.open(drive_id, passphrase).await?;
        let repo = mount.join(&drive.repository_path);
        let stats = engine
            .stats(&repo, &passphrase, snapshot_id)
            .await
            .map_err(|e| self.engine_error(drive_id, e))?;
        self.ctx.secrets.put(drive_id, &passphrase);
        Ok(stats)
    }

    /// Restore a snapshot into `target`. Holds the drive lock and is
    /// cancelled if the drive is removed.
    pub async fn restore(
        &self,
        drive_id: &str,
        snapshot_id: &str,
        target: &Path,
        include_paths: &[String],
        passphrase: Option<Passphrase>,
    ) -> DriveResult<()> {
        validate_snapshot_id(snapshot_id)?;
        if !target.is_absolute() {
            return Err(DriveError::InvalidInput("restore target must be an absolute path".into()));
        }
        let (drive, mount, engine, passphrase) = self.open(drive_id, passphrase).await?;
        let _guard = self
            .ctx
            .locks
            .try_acquire(drive_id)
            .ok_or_else(|| DriveError::AlreadyRunning(drive_id.to_string()))?;

        tokio::fs::create_dir_all(target).await?;
        let repo = mount.join(&drive.repository_path);
        let cancel = CancellationToken::new();
        self.ctx
            .runs
            .begin(drive_id, RunPhase::Restoring, now(), mount, cancel.clone())
            .await;
        info!(drive_id, snapshot_id, target = %target.display(), "Restore started");

        let result = engine
            .restore(&repo, &passphrase, snapshot_id, target, include_paths, cancel)
            .await;
        self.ctx.runs.finish(drive_id, None).await;

        match result {
            Ok(()) => {
                self.ctx.secrets.put(drive_id, &passphrase);
                info!(drive_id, snapshot_id, "Restore finished");
                Ok(())
            }
            Err(EngineError::Cancelled) => Err(DriveError::Failed(
                "restore interrupted because the drive was removed".into(),
            )),
            Err(e) => Err(self.engine_error(drive_id, e)),
        }
    }
}

/// Body of a spawned backup. The guard is dropped only after the outcome
/// is recorded.
async fn run_backup(ctx: AppContext, job: BackupJob, guard: DriveGuard) {
    let drive_id = job.drive.drive_id.clone();
    let outcome = execute(&ctx, &job).await;

    match outcome.status {
        RunStatus::Success => info!(drive_id = %drive_id, snapshot = ?outcome.snapshot_id, "Backup completed"),
        RunStatus::Interrupted => warn!(drive_id = %drive_id, message = ?outcome.message, "Backup interrupted"),
        RunStatus::Failed => error!(drive_id = %drive_id, message = ?outcome.message, "Backup failed"),
    }
    ctx.runs.finish(&drive_id, Some(outcome)).await;
    drop(guard);
}

fn backup_paths(drive: &TrustedDrive, policy: &BackupPolicy, home: Option<&Path>) -> Vec<PathBuf> {
    let sources = if drive.backup_sources.is_empty() {
        &policy.default_sources
    } else {
        &drive.backup_sources
    };
    let mut paths: Vec<PathBuf> = sources
        .iter()
        .map(|s| s.path.as_str())
        .chain(policy.include_patterns.iter().map(String::as_str))
        .map(|p| expand_home(p, home))
        .collect();
    paths.sort();
    paths.dedup();
    paths
}

async fn execute(ctx: &AppContext, job: &BackupJob) -> RunOutcome {
    let drive_id = job.drive.drive_id.as_str();
    let mut outcome = RunOutcome {
        status: RunStatus::Failed,
        message: None,
        started_epoch: job.started_epoch,
        finished_epoch: job.started_epoch,
        snapshot_id: None,
        data_added: None,
        files_processed: None,
    };
    let secret = Some(job.passphrase.expose());

    let home = invoking_user_home();
    let mut paths = Vec::new();
    for path in backup_paths(&job.drive, &job.policy, home.as_deref()) {
        if tokio::fs::try_exists(&path).await.unwrap_or(false) {
            paths.push(path);
        } else {
            warn!(drive_id, path = %path.display(), "Backup source does not exist, skipping");
        }
    }
    if paths.is_empty() {
        outcome.message = Some("none of the backup sources exist".into());
        outcome.finished_epoch = now();
        return outcome;
    }

    let request = BackupRequest {
        paths,
        excludes: job.policy.exclude_patterns.clone(),
        tags: vec![BACKUP_TAG.to_string()],
    };

    let (tx, mut rx) = mpsc::channel::<BackupProgress>(PROGRESS_BUFFER);
    let runs = ctx.runs.clone();
    let id = drive_id.to_string();
    let forwarder = tokio::spawn(async move {
        let throttle = LogThrottle::new(PROGRESS_LOG_INTERVAL);
        while let Some(progress) = rx.recv().await {
            if throttle.should_log() {
                info!(
                    drive_id = %id,
                    percent = format!("{:.1}", progress.percent_done * 100.0),
                    files_done = progress.files_done,
                    total_files = progress.total_files,
                    "Backup progress"
                );
            }
            runs.update_progress(&id, progress).await;
        }
    });

    let result = job
        .engine
        .backup(&job.repo, &job.passphrase, &request, tx, job.cancel.clone())
        .await;
    let _ = forwarder.await;

    match result {
        Ok(summary) => {
            outcome.finished_epoch = now();
            let notes = completed(ctx, job, &summary, outcome.finished_epoch).await;
            outcome.status = RunStatus::Success;
            outcome.snapshot_id = summary.snapshot_id;
            outcome.data_added = Some(summary.data_added);
            outcome.files_processed = Some(summary.files_processed);
            if !notes.is_empty() {
                outcome.message = Some(bounded_message(&notes.join("; "), secret));
            }
        }
        Err(EngineError::Cancelled) => {
            outcome.status = RunStatus::Interrupted;
            outcome.message = Some("drive was removed during the backup".into());
        }
        Err(EngineError::Killed(signal)) => {
            outcome.status = RunStatus::Interrupted;
            outcome.message = Some(format!("backup engine was terminated by {}", signal));
        }
        Err(EngineError::AuthFailed) => {
            ctx.secrets.clear(drive_id);
            outcome.message = Some("authentication failed".into());
        }
        Err(e) => {
            let still_mounted = ctx.devices.refresh().await.is_mounted_path(&job.mount);
            outcome.status = if still_mounted {
                RunStatus::Failed
            } else {
                RunStatus::Interrupted
            };
            outcome.message = Some(bounded_message(&e.to_string(), secret));
        }
    }
    if outcome.finished_epoch == job.started_epoch {
        outcome.finished_epoch = now();
    }
    outcome
}

/// Persist a completed backup and run its follow-ups. Returns notes for
/// anything that went wrong along the way; none of them fail the run.
async fn completed(ctx: &AppContext, job: &BackupJob, summary: &BackupSummary, finished: i64) -> Vec<String> {
    let drive_id = job.drive.drive_id.as_str();
    let mut notes = Vec::new();
    if summary.partial {
        notes.push("some files could not be read".to_string());
    }

    if let Err(e) = ctx
        .store
        .record_backup(drive_id, finished, summary.snapshot_id.clone())
        .await
    {
        warn!(drive_id, error = %e, "Could not record backup");
        notes.push(format!("could not record backup: {}", e));
    }

    let policy = &job.policy;
    if policy.verify_quick || policy.verify_deep {
        ctx.runs.set_phase(drive_id, RunPhase::Verifying).await;
        let check = job.engine.check(&job.repo, &job.passphrase, policy.verify_deep);
        match cancellable(&job.cancel, check).await {
            Some(Ok(())) => info!(drive_id, deep = policy.verify_deep, "Repository verified"),
            Some(Err(e)) => {
                warn!(drive_id, error = %e, "Repository verification failed");
                notes.push(format!("verification failed: {}", e));
            }
            None => {
                notes.push("verification interrupted".to_string());
                return notes;
            }
        }
    }

    if policy.retention.enabled {
        ctx.runs.set_phase(drive_id, RunPhase::Pruning).await;
        let args = policy.retention.to_forget_args();
        let forget = job.engine.forget(&job.repo, &job.passphrase, &args);
        match cancellable(&job.cancel, forget).await {
            Some(Ok(())) => info!(drive_id, "Retention applied"),
            Some(Err(e)) => {
                warn!(drive_id, error = %e, "Retention failed");
                notes.push(format!("retention failed: {}", e));
            }
            None => notes.push("retention interrupted".to_string()),
        }
    }
    notes
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::models::BackupSource;

    fn drive(sources: Vec<BackupSource>) -> TrustedDrive {
        TrustedDrive {
            drive_id: "d1".into(),
            label: "x".into(),
            repository_id: "r".into(),
            repository_path: PathBuf::from(".keepd/repo"),
            media_uuid: None,
            backup_sources: sources,
            remember_passphrase: false,
            paranoid_mode: false,
            created_epoch: 0,
            last_seen_epoch: None,
            last_backup_epoch: None,
            last_snapshot_id: None,
        }
    }

    #[test]
    fn drive_sources_override_policy_defaults() {
        let home = Path::new("/home/alex");
        let policy = BackupPolicy::default();

        let paths = backup_paths(&drive(Vec::new()), &policy, Some(home));
        assert_eq!(paths.len(), 3);
        assert!(paths.contains(&PathBuf::from("/home/alex/Documents")));

        let own = drive(vec![BackupSource {
            label: "Music".into(),
            path: "~/Music".into(),
        }]);
        let mut policy = policy;
        policy.include_patterns = vec!["/srv/shared".into(), "~/Music".into()];
        let paths = backup_paths(&own, &policy, Some(home));
        assert_eq!(paths, vec![PathBuf::from("/home/alex/Music"), PathBuf::from("/srv/shared")]);
    }

    #[test]
    fn snapshot_ids_cannot_be_flags() {
        assert!(validate_snapshot_id("4f2a9c1e").is_ok());
        assert!(validate_snapshot_id("latest").is_ok());
        assert!(validate_snapshot_id("--target=/").is_err());
        assert!(validate_snapshot_id("").is_err());
        assert!(validate_snapshot_id("a b").is_err());
    }
}

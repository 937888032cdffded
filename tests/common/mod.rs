//! Shared fixtures: a simulated host with a fake `restic` on disk.

#![allow(dead_code)]

use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use keepd::adapters::{SimulatedAdapter, Simulator};
use keepd::config::AppConfig;
use keepd::context::AppContext;
use keepd::core::{
    BackupOrchestrator, BackupSource, DiskOrchestrator, DriveManager, Passphrase, RunOutcome,
    SetupRequest, TrustedDrive,
};
use tempfile::TempDir;

pub const PASSPHRASE: &str = "correct horse battery staple";

/// A restic stand-in that keeps its state in plain files inside the
/// repository directory. `backup` prints `steps` status lines, `delay`
/// seconds apart, and records a snapshot only when it runs to completion.
/// It writes its arguments to `.backup-args`; `forget` fails after a second
/// when `.forget-fails` exists.
pub fn fake_engine(dir: &Path, steps: u32, delay: &str) -> PathBuf {
    let script = format!(
        r#"#!/bin/sh
REPO="$2"
shift 2
CMD="$1"
pass_ok() {{ [ -f "$REPO/.pass" ] && [ "$(cat "$REPO/.pass")" = "$RESTIC_PASSWORD" ]; }}
deny() {{ echo "Fatal: wrong password or no key found" >&2; exit 12; }}
case "$CMD" in
  init)
    mkdir -p "$REPO" || exit 1
    printf '%s' "$RESTIC_PASSWORD" > "$REPO/.pass"
    printf '{{"version":2,"id":"repo%s"}}\n' "$$" > "$REPO/config"
    echo "created restic repository"
    ;;
  cat)
    [ -f "$REPO/config" ] || {{ echo "Fatal: unable to open config file" >&2; exit 1; }}
    pass_ok || deny
    cat "$REPO/config"
    ;;
  backup)
    pass_ok || deny
    echo $$ > "$REPO/.pid"
    printf '%s\n' "$@" > "$REPO/.backup-args"
    i=1
    while [ $i -le {steps} ]; do
      echo "{{\"message_type\":\"status\",\"percent_done\":0.$i,\"files_done\":$i,\"total_files\":{steps}}}"
      sleep {delay}
      i=$((i+1))
    done
    n=1
    [ -f "$REPO/snapshots" ] && n=$(( $(wc -l < "$REPO/snapshots") + 1 ))
    id="snap${{n}}p$$"
    echo "$id" >> "$REPO/snapshots"
    echo "{{\"message_type\":\"summary\",\"snapshot_id\":\"$id\",\"total_files_processed\":{steps},\"data_added\":4096}}"
    ;;
  snapshots)
    pass_ok || deny
    printf '['
    sep=''
    if [ -f "$REPO/snapshots" ]; then
      while read -r id; do
        printf '%s{{"id":"%s","short_id":"%s","time":"2024-01-01T00:00:00Z","paths":[]}}' "$sep" "$id" "$id"
        sep=','
      done < "$REPO/snapshots"
    fi
    echo ']'
    ;;
  stats)
    pass_ok || deny
    count=0
    [ -f "$REPO/snapshots" ] && count=$(wc -l < "$REPO/snapshots")
    echo "{{\"total_size\":4096,\"total_file_count\":3,\"snapshots_count\":$count}}"
    ;;
  restore)
    pass_ok || deny
    mkdir -p "$4" && touch "$4/restored-$2"
    ;;
  check)
    pass_ok || deny
    ;;
  forget)
    pass_ok || deny
    if [ -f "$REPO/.forget-fails" ]; then
      sleep 1
      echo "boom" >&2
      exit 1
    fi
    ;;
  *)
    echo "unknown command $CMD" >&2
    exit 1
    ;;
esac
"#
    );
    let path = dir.join("fake-restic");
    std::fs::write(&path, script).expect("write fake engine");
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755))
        .expect("make fake engine executable");
    path
}

pub struct Harness {
    pub dir: TempDir,
    pub ctx: AppContext,
    pub sim: Simulator,
    pub drives: DriveManager,
    pub disks: DiskOrchestrator,
    pub backups: Arc<BackupOrchestrator>,
    pub sources: PathBuf,
}

impl Harness {
    pub fn new() -> Self {
        Self::with(5, "0.1", |_| {})
    }

    /// Build a harness whose fake engine runs `steps` progress steps.
    pub fn with(steps: u32, delay: &str, tweak: impl FnOnce(&mut AppConfig)) -> Self {
        let dir = tempfile::tempdir().expect("tempdir");
        let engine = fake_engine(dir.path(), steps, delay);
        let sources = dir.path().join("home").join("Documents");
        std::fs::create_dir_all(&sources).expect("create sources");
        std::fs::write(sources.join("notes.txt"), b"hello").expect("write source file");

        let mut config = AppConfig {
            state_dir: dir.path().join("state"),
            engine_path: Some(engine),
            auth_timeout_secs: 5,
            ..AppConfig::default()
        };
        tweak(&mut config);

        let (adapter, sim) = SimulatedAdapter::new(dir.path().join("media"));
        let ctx = AppContext::new(config, Arc::new(adapter)).expect("context");

        Self {
            drives: DriveManager::new(ctx.clone()),
            disks: DiskOrchestrator::new(ctx.clone()),
            backups: Arc::new(BackupOrchestrator::new(ctx.clone())),
            dir,
            ctx,
            sim,
            sources,
        }
    }

    pub fn sources(&self) -> Vec<BackupSource> {
        vec![BackupSource {
            label: "Documents".into(),
            path: self.sources.display().to_string(),
        }]
    }

    /// Plug in, mount and trust a drive. Returns the record and mount path.
    pub async fn trusted_drive(&self, name: &str, label: &str) -> (TrustedDrive, PathBuf) {
        let devnode = self.sim.add_device(name, 64);
        let mount = self.disks.mount(&devnode).await.expect("mount");
        let drive = self
            .drives
            .setup(SetupRequest {
                mount_path: mount.clone(),
                label: Some(label.into()),
                backup_sources: self.sources(),
                passphrase: Passphrase::new(PASSPHRASE),
                remember_passphrase: true,
                paranoid_mode: false,
            })
            .await
            .expect("setup");
        (drive, mount)
    }

    /// Wait until the drive's run has finished and its lock is released.
    pub async fn wait_finished(&self, drive_id: &str) -> RunOutcome {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(30);
        loop {
            if let Some(run) = self.ctx.runs.get(drive_id).await {
                if !run.running && !self.ctx.locks.is_held(drive_id) {
                    if let Some(last) = run.last_run {
                        return last;
                    }
                }
            }
            assert!(tokio::time::Instant::now() < deadline, "run did not finish");
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }

    /// Wait until the running backup has reported some progress.
    pub async fn wait_progress(&self, drive_id: &str) {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(30);
        loop {
            let progressed = self
                .ctx
                .runs
                .get(drive_id)
                .await
                .and_then(|r| r.progress)
                .is_some_and(|p| p.percent_done > 0.0);
            if progressed {
                return;
            }
            assert!(tokio::time::Instant::now() < deadline, "no progress reported");
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }

    pub fn repo(&self, mount: &Path, drive: &TrustedDrive) -> PathBuf {
        mount.join(&drive.repository_path)
    }
}

//! Supervision of the `restic` backup engine.
//!
//! The passphrase is handed over in the child's environment only. Every child
//! is killed when its future is dropped, and long-running commands can be
//! cancelled through a [`CancellationToken`].

mod parse;

use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::sync::LazyLock;
use std::time::Duration;

use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub use parse::{BackupSummary, EngineLine, parse_line};

use super::models::BackupProgress;
use super::secrets::Passphrase;
use crate::error::DriveError;
use crate::logging::bounded_message;

const ENGINE_PROGRAM: &str = "restic";
/// Exit code for "snapshot created, but some files could not be read"
const EXIT_PARTIAL: i32 = 3;
/// Exit code for a wrong password on recent engine versions
const EXIT_WRONG_PASSWORD: i32 = 12;
const STDERR_KEEP_LINES: usize = 20;
const PIPE_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

static AUTH_FAILURE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)wrong password|no key found|unable to open repository.*password")
        .expect("valid regex")
});

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("failed to start backup engine: {0}")]
    Spawn(String),
    #[error("wrong passphrase for repository")]
    AuthFailed,
    #[error("cancelled")]
    Cancelled,
    #[error("backup engine was terminated: {0}")]
    Killed(String),
    #[error("backup engine exited with code {code}: {message}")]
    Failed { code: i32, message: String },
    #[error("unexpected backup engine output: {0}")]
    Parse(String),
}

impl From<EngineError> for DriveError {
    fn from(e: EngineError) -> Self {
        match e {
            EngineError::Spawn(_) => DriveError::EngineUnavailable,
            EngineError::AuthFailed => DriveError::AuthFailed("wrong passphrase".into()),
            other => DriveError::Failed(other.to_string()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot {
    pub id: String,
    #[serde(default)]
    pub short_id: String,
    pub time: String,
    #[serde(default)]
    pub paths: Vec<String>,
    #[serde(default)]
    pub hostname: Option<String>,
    #[serde(default)]
    pub tags: Option<Vec<String>>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepoStats {
    #[serde(default)]
    pub total_size: u64,
    #[serde(default)]
    pub total_file_count: u64,
    #[serde(default)]
    pub snapshots_count: u64,
}

#[derive(Debug, Deserialize)]
struct RepoConfig {
    id: String,
}

/// What to back up.
#[derive(Debug, Clone, Default)]
pub struct BackupRequest {
    pub paths: Vec<PathBuf>,
    pub excludes: Vec<String>,
    pub tags: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct Engine {
    program: PathBuf,
}

struct Finished {
    status: ExitStatus,
    stderr: String,
}

impl Engine {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
        }
    }

    /// Find the engine binary: an explicit path when configured, else PATH.
    pub fn locate(override_path: Option<&Path>) -> Option<PathBuf> {
        match override_path {
            Some(p) if p.is_file() => Some(p.to_path_buf()),
            Some(p) => {
                debug!(path = %p.display(), "Configured engine path does not exist");
                None
            }
            None => which::which(ENGINE_PROGRAM).ok(),
        }
    }

    pub fn resolve(override_path: Option<&Path>) -> Result<Self, DriveError> {
        Self::locate(override_path)
            .map(Self::new)
            .ok_or(DriveError::EngineUnavailable)
    }

    pub fn program(&self) -> &Path {
        &self.program
    }

    fn command(&self, repo: &Path, passphrase: &Passphrase, args: &[&str]) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.arg("--repo")
            .arg(repo)
            .args(args)
            .env("RESTIC_PASSWORD", passphrase.expose())
            .env_remove("RESTIC_PASSWORD_FILE")
            .env_remove("RESTIC_PASSWORD_COMMAND")
            .env_remove("RESTIC_REPOSITORY")
            .env_remove("RESTIC_PROGRESS_FPS")
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        cmd
    }

    fn spawn(&self, repo: &Path, passphrase: &Passphrase, args: &[&str]) -> Result<Child, EngineError> {
        debug!(program = %self.program.display(), ?args, "Spawning backup engine");
        self.command(repo, passphrase, args)
            .spawn()
            .map_err(|e| EngineError::Spawn(e.to_string()))
    }

    /// Run a short command and return its stdout.
    async fn run_capture(
        &self,
        repo: &Path,
        passphrase: &Passphrase,
        args: &[&str],
    ) -> Result<String, EngineError> {
        let output = self
            .command(repo, passphrase, args)
            .output()
            .await
            .map_err(|e| EngineError::Spawn(e.to_string()))?;
        let stderr = String::from_utf8_lossy(&output.stderr);
        check_status(output.status, &stderr, passphrase)?;
        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }

    /// Run a command that may take long, collecting stdout lines into `on_line`
    /// until it exits or `cancel` fires.
    async fn supervise(
        &self,
        mut child: Child,
        cancel: &CancellationToken,
        on_line: mpsc::UnboundedSender<String>,
    ) -> Result<Finished, EngineError> {
        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let stdout_task = stdout.map(|s| tokio::spawn(forward_lines(s, on_line)));
        let stderr_task = stderr.map(|s| tokio::spawn(collect_tail(s)));

        let status = tokio::select! {
            status = child.wait() => status.map_err(|e| EngineError::Spawn(e.to_string()))?,
            _ = cancel.cancelled() => {
                info!(pid = ?child.id(), "Cancelling backup engine");
                let _ = child.start_kill();
                let _ = child.wait().await;
                abort_task(stdout_task);
                abort_task(stderr_task);
                return Err(EngineError::Cancelled);
            }
        };

        // Grandchildren may still hold the pipes open after a kill
        if let Some(task) = stdout_task {
            drain(task).await;
        }
        let stderr = match stderr_task {
            Some(task) => drain(task).await.unwrap_or_default(),
            None => String::new(),
        };
        Ok(Finished { status, stderr })
    }

    pub async fn init(&self, repo: &Path, passphrase: &Passphrase) -> Result<(), EngineError> {
        info!(repo = %repo.display(), "Initializing repository");
        self.run_capture(repo, passphrase, &["init"]).await?;
        Ok(())
    }

    /// Repository id from `cat config`. Doubles as a passphrase check.
    pub async fn repository_id(&self, repo: &Path, passphrase: &Passphrase) -> Result<String, EngineError> {
        let out = self.run_capture(repo, passphrase, &["cat", "config"]).await?;
        let config: RepoConfig =
            serde_json::from_str(out.trim()).map_err(|e| EngineError::Parse(e.to_string()))?;
        Ok(config.id)
    }

    /// Run a backup, streaming progress until it completes or `cancel` fires.
    pub async fn backup(
        &self,
        repo: &Path,
        passphrase: &Passphrase,
        request: &BackupRequest,
        progress: mpsc::Sender<BackupProgress>,
        cancel: CancellationToken,
    ) -> Result<BackupSummary, EngineError> {
        let mut args: Vec<String> = vec!["backup".into(), "--json".into()];
        for pattern in &request.excludes {
            args.push("--exclude".into());
            args.push(pattern.clone());
        }
        for tag in &request.tags {
            args.push("--tag".into());
            args.push(tag.clone());
        }
        args.extend(request.paths.iter().map(|p| p.to_string_lossy().to_string()));
        let arg_refs: Vec<&str> = args.iter().map(String::as_str).collect();

        let child = self.spawn(repo, passphrase, &arg_refs)?;
        let (line_tx, mut line_rx) = mpsc::unbounded_channel::<String>();

        let collector = tokio::spawn(async move {
            let mut summary = None;
            let mut last_error = None;
            while let Some(line) = line_rx.recv().await {
                match parse_line(&line) {
                    EngineLine::Progress(p) => {
                        // Receiver gone means nobody is watching; keep going
                        let _ = progress.send(p).await;
                    }
                    EngineLine::Summary(s) => summary = Some(s),
                    EngineLine::Error(e) => {
                        debug!(error = %e, "Backup engine reported an error");
                        last_error = Some(e);
                    }
                    EngineLine::Ignored => {}
                }
            }
            (summary, last_error)
        });

        let finished = self.supervise(child, &cancel, line_tx).await;
        let (summary, last_error) = collector.await.unwrap_or((None, None));
        let finished = finished?;

        match finished.status.code() {
            Some(0) => Ok(summary.unwrap_or_default()),
            Some(EXIT_PARTIAL) => {
                warn!("Backup completed but some files could not be read");
                let mut summary = summary.unwrap_or_default();
                summary.partial = true;
                Ok(summary)
            }
            _ => {
                let detail = if finished.stderr.trim().is_empty() {
                    last_error.unwrap_or_default()
                } else {
                    finished.stderr
                };
                Err(failure(finished.status, &detail, passphrase))
            }
        }
    }

    pub async fn snapshots(&self, repo: &Path, passphrase: &Passphrase) -> Result<Vec<Snapshot>, EngineError> {
        let out = self.run_capture(repo, passphrase, &["snapshots", "--json"]).await?;
        let trimmed = out.trim();
        if trimmed.is_empty() || trimmed == "null" {
            return Ok(Vec::new());
        }
        serde_json::from_str(trimmed).map_err(|e| EngineError::Parse(e.to_string()))
    }

    pub async fn stats(
        &self,
        repo: &Path,
        passphrase: &Passphrase,
        snapshot_id: Option<&str>,
    ) -> Result<RepoStats, EngineError> {
        let mut args = vec!["stats", "--json", "--mode", "restore-size"];
        if let Some(id) = snapshot_id {
            args.push(id);
        }
        let out = self.run_capture(repo, passphrase, &args).await?;
        serde_json::from_str(out.trim()).map_err(|e| EngineError::Parse(e.to_string()))
    }

    pub async fn restore(
        &self,
        repo: &Path,
        passphrase: &Passphrase,
        snapshot_id: &str,
        target: &Path,
        include_paths: &[String],
        cancel: CancellationToken,
    ) -> Result<(), EngineError> {
        let target = target.to_string_lossy().to_string();
        let mut args = vec!["restore", snapshot_id, "--target", target.as_str()];
        for path in include_paths {
            args.push("--include");
            args.push(path);
        }
        let child = self.spawn(repo, passphrase, &args)?;
        let (line_tx, mut line_rx) = mpsc::unbounded_channel::<String>();
        let sink = tokio::spawn(async move { while line_rx.recv().await.is_some() {} });
        let finished = self.supervise(child, &cancel, line_tx).await;
        let _ = sink.await;
        let finished = finished?;
        check_status(finished.status, &finished.stderr, passphrase)
    }

    pub async fn forget(&self, repo: &Path, passphrase: &Passphrase, policy_args: &[String]) -> Result<(), EngineError> {
        let mut args = vec!["forget", "--prune"];
        args.extend(policy_args.iter().map(String::as_str));
        self.run_capture(repo, passphrase, &args).await?;
        Ok(())
    }

    /// Verify repository integrity. A quick check reads a sample of the data.
    pub async fn check(&self, repo: &Path, passphrase: &Passphrase, deep: bool) -> Result<(), EngineError> {
        let args: &[&str] = if deep {
            &["check", "--read-data"]
        } else {
            &["check", "--read-data-subset=1/20"]
        };
        self.run_capture(repo, passphrase, args).await?;
        Ok(())
    }
}

fn check_status(status: ExitStatus, stderr: &str, passphrase: &Passphrase) -> Result<(), EngineError> {
    if status.success() {
        return Ok(());
    }
    Err(failure(status, stderr, passphrase))
}

fn failure(status: ExitStatus, detail: &str, passphrase: &Passphrase) -> EngineError {
    let message = bounded_message(detail, Some(passphrase.expose()));
    match status.code() {
        None => EngineError::Killed(describe_signal(status)),
        Some(EXIT_WRONG_PASSWORD) => EngineError::AuthFailed,
        Some(_) if AUTH_FAILURE_RE.is_match(detail) => EngineError::AuthFailed,
        Some(code) => EngineError::Failed { code, message },
    }
}

fn describe_signal(status: ExitStatus) -> String {
    use std::os::unix::process::ExitStatusExt;
    match status.signal() {
        Some(sig) => match nix::sys::signal::Signal::try_from(sig) {
            Ok(signal) => signal.as_str().to_string(),
            Err(_) => format!("signal {}", sig),
        },
        None => "unknown signal".to_string(),
    }
}

async fn forward_lines<R: AsyncRead + Unpin>(reader: R, tx: mpsc::UnboundedSender<String>) {
    let mut lines = BufReader::new(reader).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        if tx.send(line).is_err() {
            break;
        }
    }
}

async fn collect_tail<R: AsyncRead + Unpin>(reader: R) -> String {
    let mut lines = BufReader::new(reader).lines();
    let mut tail: std::collections::VecDeque<String> = std::collections::VecDeque::new();
    while let Ok(Some(line)) = lines.next_line().await {
        if tail.len() == STDERR_KEEP_LINES {
            tail.pop_front();
        }
        tail.push_back(line);
    }
    tail.into_iter().collect::<Vec<_>>().join("\n")
}

async fn drain<T>(task: JoinHandle<T>) -> Option<T> {
    let abort = task.abort_handle();
    match tokio::time::timeout(PIPE_DRAIN_TIMEOUT, task).await {
        Ok(Ok(value)) => Some(value),
        Ok(Err(_)) => None,
        Err(_) => {
            abort.abort();
            None
        }
    }
}

fn abort_task<T>(task: Option<JoinHandle<T>>) {
    if let Some(task) = task {
        task.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::PermissionsExt;

    fn script(dir: &Path, body: &str) -> Engine {
        let path = dir.join("fake-restic");
        std::fs::write(&path, format!("#!/bin/sh\n{}\n", body)).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        Engine::new(path)
    }

    #[test]
    fn locate_respects_override() {
        let dir = tempfile::tempdir().unwrap();
        let engine = script(dir.path(), "exit 0");
        assert_eq!(Engine::locate(Some(engine.program())), Some(engine.program().to_path_buf()));
        assert_eq!(Engine::locate(Some(&dir.path().join("missing"))), None);
        assert!(matches!(
            Engine::resolve(Some(&dir.path().join("missing"))),
            Err(DriveError::EngineUnavailable)
        ));
    }

    #[tokio::test]
    async fn passphrase_travels_by_environment() {
        let dir = tempfile::tempdir().unwrap();
        let engine = script(
            dir.path(),
            r#"case "$*" in *hunter2*) echo leaked >&2; exit 1;; esac
[ "$RESTIC_PASSWORD" = "hunter2" ] || { echo "Fatal: wrong password or no key found" >&2; exit 1; }
echo '{"version":2,"id":"abc123","chunker_polynomial":"1"}'"#,
        );
        let pass = Passphrase::new("hunter2");
        let id = engine.repository_id(dir.path(), &pass).await.unwrap();
        assert_eq!(id, "abc123");

        let err = engine
            .repository_id(dir.path(), &Passphrase::new("nope"))
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::AuthFailed));
    }

    #[tokio::test]
    async fn backup_streams_progress_and_summary() {
        let dir = tempfile::tempdir().unwrap();
        let engine = script(
            dir.path(),
            r#"echo '{"message_type":"status","percent_done":0.5,"total_files":2,"files_done":1}'
echo 'not json'
echo '{"message_type":"summary","snapshot_id":"s1","total_files_processed":2,"data_added":10}'"#,
        );
        let (tx, mut rx) = mpsc::channel(16);
        let summary = engine
            .backup(
                dir.path(),
                &Passphrase::new("pw"),
                &BackupRequest::default(),
                tx,
                CancellationToken::new(),
            )
            .await
            .unwrap();
        assert_eq!(summary.snapshot_id.as_deref(), Some("s1"));
        assert!(!summary.partial);
        let progress = rx.recv().await.unwrap();
        assert_eq!(progress.percent_done, 0.5);
    }

    #[tokio::test]
    async fn partial_exit_is_success() {
        let dir = tempfile::tempdir().unwrap();
        let engine = script(
            dir.path(),
            r#"echo '{"message_type":"summary","snapshot_id":"s2"}'
exit 3"#,
        );
        let (tx, _rx) = mpsc::channel(16);
        let summary = engine
            .backup(dir.path(), &Passphrase::new("pw"), &BackupRequest::default(), tx, CancellationToken::new())
            .await
            .unwrap();
        assert!(summary.partial);
    }

    #[tokio::test]
    async fn failure_message_is_redacted() {
        let dir = tempfile::tempdir().unwrap();
        let engine = script(dir.path(), r#"echo "Fatal: disk full while using $RESTIC_PASSWORD" >&2; exit 1"#);
        let (tx, _rx) = mpsc::channel(16);
        let err = engine
            .backup(dir.path(), &Passphrase::new("s3cret"), &BackupRequest::default(), tx, CancellationToken::new())
            .await
            .unwrap_err();
        match err {
            EngineError::Failed { code, message } => {
                assert_eq!(code, 1);
                assert!(message.contains("disk full"));
                assert!(!message.contains("s3cret"));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn cancellation_kills_engine() {
        let dir = tempfile::tempdir().unwrap();
        let engine = script(dir.path(), "exec sleep 30");
        let cancel = CancellationToken::new();
        let (tx, _rx) = mpsc::channel(16);
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            trigger.cancel();
        });
        let started = std::time::Instant::now();
        let err = engine
            .backup(dir.path(), &Passphrase::new("pw"), &BackupRequest::default(), tx, cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Cancelled));
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    #[tokio::test]
    async fn signal_death_is_killed() {
        let dir = tempfile::tempdir().unwrap();
        let engine = script(dir.path(), "kill -9 $$");
        let (tx, _rx) = mpsc::channel(16);
        let err = engine
            .backup(dir.path(), &Passphrase::new("pw"), &BackupRequest::default(), tx, CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Killed(s) if s == "SIGKILL"));
    }

    #[tokio::test]
    async fn empty_snapshot_list() {
        let dir = tempfile::tempdir().unwrap();
        let engine = script(dir.path(), "echo null");
        assert!(engine.snapshots(dir.path(), &Passphrase::new("pw")).await.unwrap().is_empty());
    }
}

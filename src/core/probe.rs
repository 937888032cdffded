//! Detection of the external tools keepd depends on.
//!
//! Probing is read-only and runs on its own interval; callers read the cached
//! result and never probe inline.

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::engine::Engine;
use super::hardware::{HardwareAdapter, SupportedFilesystem};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostTools {
    pub lsblk: bool,
    pub udisksctl: bool,
    /// udisksctl build that offers a `format` sub-command
    pub udisksctl_format: bool,
    pub mkfs_exfat: bool,
    pub mkfs_vfat: bool,
    pub mkfs_ext4: bool,
    pub pkexec: bool,
    pub parted: bool,
}

impl HostTools {
    pub fn has_mkfs(&self, filesystem: SupportedFilesystem) -> bool {
        match filesystem {
            SupportedFilesystem::Exfat => self.mkfs_exfat,
            SupportedFilesystem::Vfat => self.mkfs_vfat,
            SupportedFilesystem::Ext4 => self.mkfs_ext4,
        }
    }

    pub fn can_mount(&self) -> bool {
        self.lsblk && self.udisksctl
    }

    pub fn can_format(&self, filesystem: SupportedFilesystem) -> bool {
        (self.udisksctl_format && filesystem == SupportedFilesystem::Exfat)
            || (self.has_mkfs(filesystem) && self.pkexec)
    }

    pub fn can_partition(&self) -> bool {
        self.parted && self.pkexec
    }

    /// First missing tool needed to format, for error reporting.
    pub fn missing_for_format(&self, filesystem: SupportedFilesystem, whole_disk: bool) -> Option<&'static str> {
        if whole_disk && !self.parted {
            return Some("parted");
        }
        if whole_disk && !self.pkexec {
            return Some("pkexec");
        }
        if self.can_format(filesystem) {
            return None;
        }
        if !self.has_mkfs(filesystem) {
            return Some(match filesystem {
                SupportedFilesystem::Exfat => "mkfs.exfat",
                SupportedFilesystem::Vfat => "mkfs.vfat",
                SupportedFilesystem::Ext4 => "mkfs.ext4",
            });
        }
        Some("pkexec")
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PreflightCapabilities {
    pub engine: bool,
    pub engine_path: Option<PathBuf>,
    #[serde(flatten)]
    pub tools: HostTools,
    pub can_mount: bool,
    pub can_format: bool,
    pub can_partition: bool,
}

impl PreflightCapabilities {
    pub fn new(engine_path: Option<PathBuf>, tools: HostTools) -> Self {
        Self {
            engine: engine_path.is_some(),
            engine_path,
            can_mount: tools.can_mount(),
            can_format: tools.can_format(SupportedFilesystem::Exfat),
            can_partition: tools.can_partition(),
            tools,
        }
    }
}

pub struct CapabilityProbe {
    adapter: Arc<dyn HardwareAdapter>,
    engine_override: Option<PathBuf>,
    tx: watch::Sender<PreflightCapabilities>,
    probed: AtomicBool,
}

impl CapabilityProbe {
    pub fn new(adapter: Arc<dyn HardwareAdapter>, engine_override: Option<PathBuf>) -> Self {
        let (tx, _) = watch::channel(PreflightCapabilities::default());
        Self {
            adapter,
            engine_override,
            tx,
            probed: AtomicBool::new(false),
        }
    }

    /// Probe now and publish the result.
    pub async fn refresh(&self) -> PreflightCapabilities {
        let tools = self.adapter.host_tools().await;
        let engine = Engine::locate(self.engine_override.as_deref());
        let caps = PreflightCapabilities::new(engine, tools);

        self.tx.send_if_modified(|current| {
            if *current == caps {
                return false;
            }
            info!(
                engine = caps.engine,
                can_mount = caps.can_mount,
                can_format = caps.can_format,
                can_partition = caps.can_partition,
                "Host capabilities changed"
            );
            *current = caps.clone();
            true
        });
        self.probed.store(true, Ordering::Release);
        caps
    }

    /// Cached result, probing once if nothing has been probed yet.
    pub async fn get(&self) -> PreflightCapabilities {
        if self.probed.load(Ordering::Acquire) {
            return self.latest();
        }
        self.refresh().await
    }

    pub fn latest(&self) -> PreflightCapabilities {
        self.tx.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<PreflightCapabilities> {
        self.tx.subscribe()
    }

    pub async fn run(self: Arc<Self>, interval: Duration, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.refresh().await;
                    debug!("Capability probe tick");
                }
                _ = cancel.cancelled() => break,
            }
        }
    }
}

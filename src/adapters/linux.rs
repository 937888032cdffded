//! Linux hardware adapter built on util-linux and udisks2 command-line tools.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::LazyLock;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use regex::Regex;
use serde::{Deserialize, Deserializer};
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::core::hardware::{HardwareAdapter, SupportedFilesystem, ToolFailure, ToolFailureKind};
use crate::core::models::{Device, Partition};
use crate::core::probe::HostTools;
use crate::logging::bounded_message;

const LSBLK_COLUMNS: &str = "NAME,PATH,SIZE,MODEL,RM,TRAN,HOTPLUG,TYPE,FSTYPE,UUID,LABEL,MOUNTPOINTS";
const MOUNT_ATTEMPTS: u32 = 3;
const MOUNT_RETRY_DELAY: Duration = Duration::from_millis(1200);
const QUICK_TOOL_TIMEOUT: Duration = Duration::from_secs(10);

static ALREADY_MOUNTED_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?im)already mounted at [`'\x22]?([^`'\x22\n]+?)[`'\x22]?\.?\s*$")
        .expect("valid regex")
});

static MOUNTED_AT_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"Mounted \S+ at (.+)").expect("valid regex"));

pub struct LinuxAdapter;

#[derive(Debug, Deserialize)]
struct LsblkOutput {
    blockdevices: Vec<LsblkDevice>,
}

#[derive(Debug, Deserialize)]
struct LsblkDevice {
    name: String,
    #[serde(default)]
    path: Option<String>,
    #[serde(default, deserialize_with = "flexible_u64")]
    size: u64,
    #[serde(default)]
    model: Option<String>,
    #[serde(default, deserialize_with = "flexible_bool")]
    rm: bool,
    #[serde(default)]
    tran: Option<String>,
    #[serde(default, deserialize_with = "flexible_bool")]
    hotplug: bool,
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    fstype: Option<String>,
    #[serde(default)]
    uuid: Option<String>,
    #[serde(default)]
    label: Option<String>,
    #[serde(default)]
    mountpoints: Option<Vec<Option<String>>>,
    /// util-linux before 2.37 only reports one mount point
    #[serde(default)]
    mountpoint: Option<String>,
    #[serde(default)]
    children: Vec<LsblkDevice>,
}

impl LsblkDevice {
    fn devnode(&self) -> PathBuf {
        self.path
            .clone()
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("/dev").join(&self.name))
    }

    fn mounts(&self) -> Vec<PathBuf> {
        let mut mounts: Vec<PathBuf> = self
            .mountpoints
            .iter()
            .flatten()
            .flatten()
            .filter(|m| !m.is_empty())
            .map(PathBuf::from)
            .collect();
        if mounts.is_empty() {
            if let Some(m) = self.mountpoint.as_deref().filter(|m| !m.is_empty()) {
                mounts.push(PathBuf::from(m));
            }
        }
        mounts
    }
}

fn flexible_u64<'de, D: Deserializer<'de>>(d: D) -> std::result::Result<u64, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Num(u64),
        Str(String),
    }
    Ok(match Option::<Raw>::deserialize(d)? {
        Some(Raw::Num(n)) => n,
        Some(Raw::Str(s)) => s.trim().parse().unwrap_or(0),
        None => 0,
    })
}

fn flexible_bool<'de, D: Deserializer<'de>>(d: D) -> std::result::Result<bool, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Bool(bool),
        Num(u64),
        Str(String),
    }
    Ok(match Option::<Raw>::deserialize(d)? {
        Some(Raw::Bool(b)) => b,
        Some(Raw::Num(n)) => n != 0,
        Some(Raw::Str(s)) => matches!(s.trim(), "1" | "true"),
        None => false,
    })
}

/// Parse `lsblk -J -b` output into disks with their partitions.
pub fn parse_lsblk(json: &str) -> Result<Vec<Device>> {
    let output: LsblkOutput = serde_json::from_str(json).context("Failed to parse lsblk output")?;

    let devices = output
        .blockdevices
        .into_iter()
        .filter(|d| d.kind == "disk")
        .map(|d| {
            let removable = d.rm || d.hotplug || d.tran.as_deref() == Some("usb");
            let mut partitions: Vec<Partition> = d
                .children
                .iter()
                .filter(|c| c.kind == "part")
                .map(|c| Partition {
                    path: c.devnode(),
                    name: c.name.clone(),
                    size: c.size,
                    fstype: c.fstype.clone().filter(|s| !s.is_empty()),
                    uuid: c.uuid.clone().filter(|s| !s.is_empty()),
                    label: c.label.clone().filter(|s| !s.is_empty()),
                    mountpoints: c.mounts(),
                    whole_disk: false,
                    drive_id: None,
                })
                .collect();

            // A filesystem written straight onto the disk shows up on the disk itself
            if partitions.is_empty() && d.fstype.as_deref().is_some_and(|f| !f.is_empty()) {
                partitions.push(Partition {
                    path: d.devnode(),
                    name: d.name.clone(),
                    size: d.size,
                    fstype: d.fstype.clone(),
                    uuid: d.uuid.clone().filter(|s| !s.is_empty()),
                    label: d.label.clone().filter(|s| !s.is_empty()),
                    mountpoints: d.mounts(),
                    whole_disk: true,
                    drive_id: None,
                });
            }

            Device {
                path: d.devnode(),
                name: d.name.clone(),
                model: d.model.as_ref().map(|m| m.trim().to_string()).filter(|m| !m.is_empty()),
                size: d.size,
                removable,
                partitions,
            }
        })
        .collect();

    Ok(devices)
}

/// Classify a failed helper invocation from its exit code and output.
pub fn classify(tool: &str, code: Option<i32>, output: &str) -> ToolFailureKind {
    let lower = output.to_lowercase();

    if tool == "pkexec" && matches!(code, Some(126) | Some(127)) {
        return ToolFailureKind::NotAuthorized;
    }
    if lower.contains("notauthorized")
        || lower.contains("not authorized")
        || lower.contains("no authentication agent")
        || lower.contains("authentication is required")
        || lower.contains("authentication failed")
    {
        return ToolFailureKind::NotAuthorized;
    }
    if lower.contains("already mounted") {
        let path = ALREADY_MOUNTED_RE
            .captures(output)
            .and_then(|c| c.get(1))
            .map(|m| PathBuf::from(m.as_str().trim()));
        return ToolFailureKind::AlreadyMounted(path);
    }
    if lower.contains("not a mountable filesystem") {
        return ToolFailureKind::NotMountable;
    }
    ToolFailureKind::Io
}

/// Pull the mount point out of `udisksctl mount` output.
pub fn parse_mounted_at(stdout: &str) -> Option<PathBuf> {
    let captured = MOUNTED_AT_RE.captures(stdout)?.get(1)?.as_str().trim();
    let path = PathBuf::from(captured);
    if path.exists() {
        return Some(path);
    }
    Some(PathBuf::from(captured.strip_suffix('.').unwrap_or(captured)))
}

/// Run a host tool to completion. Non-zero exit is classified into a
/// [`ToolFailure`]; the child is killed if the future is dropped.
async fn run_tool(tool: &str, program: &str, args: &[&str]) -> Result<String, ToolFailure> {
    debug!(tool, ?args, "Running host tool");
    let output = Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .output()
        .await
        .map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                ToolFailure::missing(program)
            } else {
                ToolFailure::io(tool, e.to_string())
            }
        })?;

    let stdout = String::from_utf8_lossy(&output.stdout).to_string();
    if output.status.success() {
        return Ok(stdout);
    }

    let stderr = String::from_utf8_lossy(&output.stderr);
    let combined = format!("{}\n{}", stderr.trim(), stdout.trim());
    let kind = classify(tool, output.status.code(), &combined);
    let message = match output.status.code() {
        Some(code) => format!("exit {}: {}", code, bounded_message(&combined, None)),
        None => format!("terminated by signal: {}", bounded_message(&combined, None)),
    };
    Err(ToolFailure::new(tool, kind, message))
}

/// Give udev a moment to publish new partitions. Best effort.
async fn settle() {
    let result = tokio::time::timeout(
        QUICK_TOOL_TIMEOUT,
        run_tool("udevadm", "udevadm", &["settle", "--timeout=5"]),
    )
    .await;
    if let Ok(Err(e)) = result {
        debug!(error = %e, "udevadm settle failed");
    }
}

fn has_program(name: &str) -> bool {
    which::which(name).is_ok()
}

fn mkfs_program(filesystem: SupportedFilesystem) -> Option<PathBuf> {
    let candidates: &[&str] = match filesystem {
        SupportedFilesystem::Exfat => &["mkfs.exfat", "mkexfatfs"],
        SupportedFilesystem::Vfat => &["mkfs.vfat", "mkfs.fat"],
        SupportedFilesystem::Ext4 => &["mkfs.ext4"],
    };
    candidates.iter().find_map(|c| which::which(c).ok())
}

#[async_trait]
impl HardwareAdapter for LinuxAdapter {
    async fn list_devices(&self) -> Result<Vec<Device>> {
        let output = tokio::time::timeout(
            QUICK_TOOL_TIMEOUT,
            run_tool("lsblk", "lsblk", &["-J", "-b", "-o", LSBLK_COLUMNS]),
        )
        .await;
        match output {
            Ok(Ok(json)) => parse_lsblk(&json),
            Ok(Err(e)) => bail!("lsblk failed: {}", e),
            Err(_) => bail!("lsblk timed out"),
        }
    }

    async fn host_tools(&self) -> HostTools {
        let udisksctl = has_program("udisksctl");
        let udisksctl_format = if udisksctl {
            matches!(
                tokio::time::timeout(QUICK_TOOL_TIMEOUT, run_tool("udisksctl", "udisksctl", &["help"])).await,
                Ok(Ok(help)) if help.lines().any(|l| l.trim_start().starts_with("format"))
            )
        } else {
            false
        };

        HostTools {
            lsblk: has_program("lsblk"),
            udisksctl,
            udisksctl_format,
            mkfs_exfat: mkfs_program(SupportedFilesystem::Exfat).is_some(),
            mkfs_vfat: mkfs_program(SupportedFilesystem::Vfat).is_some(),
            mkfs_ext4: mkfs_program(SupportedFilesystem::Ext4).is_some(),
            pkexec: has_program("pkexec"),
            parted: has_program("parted"),
        }
    }

    async fn mount(&self, devnode: &Path) -> Result<PathBuf, ToolFailure> {
        let dev = devnode.to_string_lossy().to_string();
        let mut attempt = 0;
        loop {
            attempt += 1;
            match run_tool("udisksctl", "udisksctl", &["mount", "-b", &dev]).await {
                Ok(stdout) => {
                    return parse_mounted_at(&stdout).ok_or_else(|| {
                        ToolFailure::io("udisksctl", format!("unexpected output: {}", stdout.trim()))
                    });
                }
                Err(e) if e.kind == ToolFailureKind::NotMountable && attempt < MOUNT_ATTEMPTS => {
                    debug!(device = %dev, attempt, "Filesystem not visible yet, retrying mount");
                    settle().await;
                    tokio::time::sleep(MOUNT_RETRY_DELAY).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn unmount(&self, devnode: &Path) -> Result<(), ToolFailure> {
        let dev = devnode.to_string_lossy();
        run_tool("udisksctl", "udisksctl", &["unmount", "-b", &dev]).await?;
        Ok(())
    }

    async fn power_off(&self, disk: &Path) -> Result<(), ToolFailure> {
        let dev = disk.to_string_lossy();
        run_tool("udisksctl", "udisksctl", &["power-off", "-b", &dev]).await?;
        Ok(())
    }

    async fn create_partition_table(&self, disk: &Path) -> Result<(), ToolFailure> {
        let parted = which::which("parted").map_err(|_| ToolFailure::missing("parted"))?;
        let parted = parted.to_string_lossy();
        let dev = disk.to_string_lossy();
        info!(device = %dev, "Writing GPT partition table");
        run_tool(
            "pkexec",
            "pkexec",
            &[&parted, "-s", &dev, "mklabel", "gpt", "mkpart", "primary", "1MiB", "100%"],
        )
        .await?;
        settle().await;
        Ok(())
    }

    async fn make_filesystem(
        &self,
        devnode: &Path,
        filesystem: SupportedFilesystem,
        label: &str,
    ) -> Result<(), ToolFailure> {
        let dev = devnode.to_string_lossy();

        if filesystem == SupportedFilesystem::Exfat && self.host_tools().await.udisksctl_format {
            run_tool(
                "udisksctl",
                "udisksctl",
                &["format", "-b", &dev, "--type", "exfat", "--label", label],
            )
            .await?;
            settle().await;
            return Ok(());
        }

        let mkfs = mkfs_program(filesystem)
            .ok_or_else(|| ToolFailure::missing(&format!("mkfs.{}", filesystem.as_str())))?;
        let mkfs = mkfs.to_string_lossy().to_string();

        let attempts: Vec<Vec<&str>> = match filesystem {
            // exfatprogs takes -L, the older exfat-utils takes -n
            SupportedFilesystem::Exfat => vec![vec!["-L", label], vec!["-n", label]],
            SupportedFilesystem::Vfat => vec![vec!["-n", label]],
            SupportedFilesystem::Ext4 => vec![vec!["-F", "-L", label]],
        };

        let mut last_err = None;
        for label_args in attempts {
            let mut args = vec![mkfs.as_str()];
            args.extend(label_args);
            args.push(&dev);
            match run_tool("pkexec", "pkexec", &args).await {
                Ok(_) => {
                    settle().await;
                    return Ok(());
                }
                Err(e) if e.kind == ToolFailureKind::NotAuthorized => return Err(e),
                Err(e) => {
                    warn!(device = %dev, error = %e, "mkfs attempt failed");
                    last_err = Some(e);
                }
            }
        }
        Err(last_err.unwrap_or_else(|| ToolFailure::io("mkfs", "no attempt made")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"{
      "blockdevices": [
        {"name":"nvme0n1","path":"/dev/nvme0n1","size":512110190592,"model":"Samsung SSD","rm":false,"tran":"nvme","hotplug":false,"type":"disk","fstype":null,"uuid":null,"label":null,"mountpoints":[null],
         "children":[
           {"name":"nvme0n1p1","path":"/dev/nvme0n1p1","size":536870912,"model":null,"rm":false,"tran":null,"hotplug":false,"type":"part","fstype":"vfat","uuid":"AB12-CD34","label":null,"mountpoints":["/boot/efi"]}
         ]},
        {"name":"sdb","path":"/dev/sdb","size":"62008590336","model":"Cruzer Blade   ","rm":"1","tran":"usb","hotplug":"1","type":"disk","fstype":null,"uuid":null,"label":null,"mountpoints":[null],
         "children":[
           {"name":"sdb1","path":"/dev/sdb1","size":"62007541760","rm":"1","hotplug":"1","type":"part","fstype":"exfat","uuid":"1234-ABCD","label":"BACKUP","mountpoints":["/media/user/BACKUP"]}
         ]},
        {"name":"sdc","size":8004304896,"rm":false,"tran":"usb","hotplug":false,"type":"disk","mountpoints":[null]},
        {"name":"loop0","path":"/dev/loop0","size":4096,"rm":false,"type":"loop","mountpoints":["/snap/core"]}
      ]
    }"#;

    #[test]
    fn parses_disks_and_partitions() {
        let devices = parse_lsblk(SAMPLE).unwrap();
        assert_eq!(devices.len(), 3);

        let internal = &devices[0];
        assert!(!internal.removable);
        assert_eq!(internal.partitions[0].mountpoints, vec![PathBuf::from("/boot/efi")]);

        let usb = &devices[1];
        assert!(usb.removable);
        assert_eq!(usb.size, 62008590336);
        assert_eq!(usb.model.as_deref(), Some("Cruzer Blade"));
        let part = &usb.partitions[0];
        assert_eq!(part.fstype.as_deref(), Some("exfat"));
        assert_eq!(part.uuid.as_deref(), Some("1234-ABCD"));
        assert_eq!(part.primary_mount(), Some(&PathBuf::from("/media/user/BACKUP")));

        let blank = &devices[2];
        assert_eq!(blank.path, PathBuf::from("/dev/sdc"));
        assert!(blank.removable, "usb transport counts as removable");
        assert!(blank.partitions.is_empty());
    }

    #[test]
    fn legacy_single_mountpoint_column() {
        let json = r#"{"blockdevices":[{"name":"sdb","size":100,"rm":"1","type":"disk",
            "children":[{"name":"sdb1","size":90,"type":"part","fstype":"vfat","mountpoint":"/mnt/x"}]}]}"#;
        let devices = parse_lsblk(json).unwrap();
        assert_eq!(devices[0].partitions[0].mountpoints, vec![PathBuf::from("/mnt/x")]);
    }

    #[test]
    fn unpartitioned_filesystem_becomes_whole_disk_entry() {
        let json = r#"{"blockdevices":[{"name":"sdd","size":100,"rm":true,"type":"disk","fstype":"exfat","uuid":"X","mountpoints":[null]}]}"#;
        let devices = parse_lsblk(json).unwrap();
        let p = &devices[0].partitions[0];
        assert!(p.whole_disk);
        assert_eq!(p.path, PathBuf::from("/dev/sdd"));
    }

    #[test]
    fn classifies_authorization_failures() {
        assert_eq!(classify("pkexec", Some(126), ""), ToolFailureKind::NotAuthorized);
        assert_eq!(classify("pkexec", Some(127), ""), ToolFailureKind::NotAuthorized);
        assert_eq!(
            classify(
                "udisksctl",
                Some(1),
                "Error mounting /dev/sdb1: GDBus.Error:org.freedesktop.UDisks2.Error.NotAuthorizedCanObtain: Not authorized to perform operation"
            ),
            ToolFailureKind::NotAuthorized
        );
        assert_eq!(
            classify("pkexec", Some(1), "Error executing command as another user: No authentication agent found."),
            ToolFailureKind::NotAuthorized
        );
    }

    #[test]
    fn classifies_mount_states() {
        let kind = classify(
            "udisksctl",
            Some(1),
            "Error mounting /dev/sdb1: GDBus.Error:org.freedesktop.UDisks2.Error.AlreadyMounted: Device /dev/sdb1 is already mounted at `/media/user/BACKUP'.",
        );
        assert_eq!(
            kind,
            ToolFailureKind::AlreadyMounted(Some(PathBuf::from("/media/user/BACKUP")))
        );
        assert_eq!(
            classify("udisksctl", Some(1), "Object /dev/sdb1 is not a mountable filesystem."),
            ToolFailureKind::NotMountable
        );
        assert_eq!(classify("udisksctl", Some(1), "Input/output error"), ToolFailureKind::Io);
    }

    #[test]
    fn parses_mount_output() {
        assert_eq!(
            parse_mounted_at("Mounted /dev/sdb1 at /nonexistent/media/BACKUP.\n"),
            Some(PathBuf::from("/nonexistent/media/BACKUP"))
        );
        assert_eq!(parse_mounted_at("garbage"), None);
    }

    #[tokio::test]
    async fn missing_program_is_reported() {
        let err = run_tool("nope", "keepd-definitely-not-installed", &[]).await.unwrap_err();
        assert_eq!(err.kind, ToolFailureKind::Missing);
    }
}

//! Linux adapter integration tests against the real host tools.
//!
//! The loopback test requires root privileges and losetup/mkfs.ext4.
//!
//! Run all tests: `cargo test --test linux_adapter`
//! Run ignored tests: `sudo cargo test --test linux_adapter -- --ignored`

#![cfg(target_os = "linux")]

use std::path::PathBuf;
use std::process::Command;

use keepd::adapters::LinuxAdapter;
use keepd::adapters::linux::parse_lsblk;
use keepd::core::HardwareAdapter;
use nix::unistd::Uid;
use tempfile::NamedTempFile;

fn is_root() -> bool {
    Uid::effective().is_root()
}

fn has_lsblk() -> bool {
    which::which("lsblk").is_ok()
}

fn has_losetup() -> bool {
    which::which("losetup").is_ok()
}

fn has_mkfs_ext4() -> bool {
    which::which("mkfs.ext4").is_ok()
}

/// Create an ext4-formatted loopback device from a temp file.
/// Returns the loop device path (e.g., /dev/loop0) on success.
fn setup_loopback(file_path: &str, size_mb: u64) -> Option<String> {
    let result = Command::new("dd")
        .args([
            "if=/dev/zero",
            &format!("of={}", file_path),
            "bs=1M",
            &format!("count={}", size_mb),
        ])
        .output()
        .ok()?;
    if !result.status.success() {
        eprintln!("dd failed: {}", String::from_utf8_lossy(&result.stderr));
        return None;
    }

    let result = Command::new("mkfs.ext4")
        .args(["-F", "-q", "-L", "keepd-loop", file_path])
        .output()
        .ok()?;
    if !result.status.success() {
        eprintln!("mkfs.ext4 failed: {}", String::from_utf8_lossy(&result.stderr));
        return None;
    }

    let output = Command::new("losetup")
        .args(["--find", "--show", file_path])
        .output()
        .ok()?;
    if output.status.success() {
        Some(String::from_utf8_lossy(&output.stdout).trim().to_string())
    } else {
        eprintln!("losetup failed: {}", String::from_utf8_lossy(&output.stderr));
        None
    }
}

fn teardown_loopback(loop_device: &str) {
    let _ = Command::new("losetup").args(["-d", loop_device]).output();
}

#[tokio::test]
async fn test_list_devices() {
    if !has_lsblk() {
        eprintln!("Skipping: lsblk not available");
        return;
    }

    let devices = LinuxAdapter.list_devices().await;
    assert!(devices.is_ok(), "list_devices should not error: {:?}", devices.err());

    for device in devices.unwrap() {
        assert!(device.path.starts_with("/dev"), "unexpected path {:?}", device.path);
        for part in &device.partitions {
            assert!(part.path.starts_with("/dev"));
        }
    }
}

#[tokio::test]
async fn test_host_tools_match_path() {
    let tools = LinuxAdapter.host_tools().await;
    assert_eq!(tools.lsblk, has_lsblk());
    assert_eq!(tools.mkfs_ext4, has_mkfs_ext4());
    assert_eq!(tools.parted, which::which("parted").is_ok());
}

#[test]
fn test_parses_host_lsblk_output() {
    if !has_lsblk() {
        eprintln!("Skipping: lsblk not available");
        return;
    }

    let output = Command::new("lsblk")
        .args([
            "-J",
            "-b",
            "-o",
            "NAME,PATH,SIZE,MODEL,RM,TRAN,HOTPLUG,TYPE,FSTYPE,UUID,LABEL,MOUNTPOINTS",
        ])
        .output()
        .expect("run lsblk");
    if !output.status.success() {
        eprintln!("Skipping: lsblk failed in this environment");
        return;
    }

    let json = String::from_utf8_lossy(&output.stdout);
    parse_lsblk(&json).expect("host lsblk output parses");
}

#[tokio::test]
async fn test_unmount_unknown_device_fails() {
    if which::which("udisksctl").is_err() {
        eprintln!("Skipping: udisksctl not available");
        return;
    }

    let err = LinuxAdapter
        .unmount(&PathBuf::from("/dev/keepd-does-not-exist"))
        .await
        .unwrap_err();
    assert_eq!(err.tool, "udisksctl");
}

#[tokio::test]
#[ignore = "requires root privileges and losetup/mkfs.ext4"]
async fn test_loop_devices_are_not_offered() {
    if !is_root() {
        eprintln!("Skipping: requires root");
        return;
    }
    if !has_lsblk() || !has_losetup() || !has_mkfs_ext4() {
        eprintln!("Skipping: lsblk, losetup or mkfs.ext4 not available");
        return;
    }

    let temp_file = NamedTempFile::new().expect("create temp file");
    let file_path = temp_file.path().to_string_lossy().to_string();

    let loop_device = match setup_loopback(&file_path, 32) {
        Some(dev) => dev,
        None => {
            eprintln!("Skipping: failed to set up loopback device");
            return;
        }
    };

    let result = LinuxAdapter.list_devices().await;
    teardown_loopback(&loop_device);

    let devices = result.expect("list devices");
    let loop_path = PathBuf::from(&loop_device);
    assert!(
        devices
            .iter()
            .all(|d| d.path != loop_path && d.partitions.iter().all(|p| p.path != loop_path)),
        "loop device {} should not be listed as a drive",
        loop_device
    );
}

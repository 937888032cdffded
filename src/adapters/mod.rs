use std::path::PathBuf;
use std::sync::Arc;

use crate::core::hardware::HardwareAdapter;

#[cfg(target_os = "linux")]
pub mod linux;
pub mod simulated;

#[cfg(target_os = "linux")]
pub use linux::LinuxAdapter;
pub use simulated::{Fault, SimulatedAdapter, Simulator};

/// Build the hardware adapter for this run. In simulation mode, devices are
/// driven by commands on stdin.
pub fn get_adapter(simulation: bool, state_dir: &std::path::Path) -> anyhow::Result<Arc<dyn HardwareAdapter>> {
    if simulation {
        let mount_root: PathBuf = state_dir.join("sim-media");
        std::fs::create_dir_all(&mount_root)?;
        let (adapter, controller) = SimulatedAdapter::new(mount_root);

        std::thread::spawn(move || {
            let stdin = std::io::stdin();
            for line in stdin.lines().map_while(Result::ok) {
                let parts: Vec<&str> = line.split_whitespace().collect();
                let name = parts.get(1).copied().unwrap_or("usb0");
                let size = parts.get(2).and_then(|s| s.parse().ok()).unwrap_or(64);
                match parts.first().copied() {
                    Some("add") => {
                        controller.add_device(name, size);
                    }
                    Some("blank") => {
                        controller.add_blank_device(name, size);
                    }
                    Some("fixed") => {
                        controller.add_fixed_device(name, size);
                    }
                    Some("rm") => controller.remove_device(name),
                    Some("plug") => controller.reinsert_device(name),
                    _ => println!(
                        "(Simulator) Use: 'add <name> [gb]', 'blank <name> [gb]', 'fixed <name> [gb]', 'rm <name>' or 'plug <name>'"
                    ),
                }
            }
        });

        return Ok(Arc::new(adapter));
    }

    #[cfg(target_os = "linux")]
    {
        Ok(Arc::new(linux::LinuxAdapter))
    }

    #[cfg(not(target_os = "linux"))]
    {
        anyhow::bail!("only simulation mode is supported on this platform")
    }
}

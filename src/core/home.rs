use nix::unistd::{Uid, User};
use std::path::{Path, PathBuf};
use tracing::debug;

/// Home directory of the user the backup is for.
///
/// Detection order:
/// 1. `SUDO_USER` - the user who invoked sudo
/// 2. `PKEXEC_UID` - the user who invoked pkexec
/// 3. The user the daemon runs as
pub fn invoking_user_home() -> Option<PathBuf> {
    if let Some(home) = home_from_sudo_user() {
        debug!(home = %home.display(), "Resolved home from SUDO_USER");
        return Some(home);
    }

    if let Some(home) = home_from_pkexec_uid() {
        debug!(home = %home.display(), "Resolved home from PKEXEC_UID");
        return Some(home);
    }

    User::from_uid(Uid::current())
        .ok()
        .flatten()
        .map(|u| u.dir)
        .or_else(dirs::home_dir)
}

fn home_from_sudo_user() -> Option<PathBuf> {
    let sudo_user = std::env::var("SUDO_USER").ok()?;
    if sudo_user.is_empty() {
        return None;
    }
    User::from_name(&sudo_user).ok()?.map(|u| u.dir)
}

fn home_from_pkexec_uid() -> Option<PathBuf> {
    let uid: u32 = std::env::var("PKEXEC_UID").ok()?.parse().ok()?;
    User::from_uid(Uid::from_raw(uid)).ok()?.map(|u| u.dir)
}

/// Expand a leading `~` against `home`. Other paths pass through unchanged.
pub fn expand_home(path: &str, home: Option<&Path>) -> PathBuf {
    match (path, home) {
        ("~", Some(home)) => home.to_path_buf(),
        (p, Some(home)) if p.starts_with("~/") => home.join(&p[2..]),
        (p, _) => PathBuf::from(p),
    }
}

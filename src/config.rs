use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use serde::{Deserialize, Serialize};

const SYSTEM_CONFIG_PATH: &str = "/etc/keepd/config.toml";
const SYSTEM_STATE_DIR: &str = "/var/lib/keepd";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    /// Where the trust store lives
    pub state_dir: PathBuf,
    /// Explicit path to the restic binary; looked up on PATH when unset
    pub engine_path: Option<PathBuf>,
    pub rpc_bind: SocketAddr,
    pub poll_interval_ms: u64,
    pub probe_interval_secs: u64,
    /// Upper bound on a privileged helper call, including the polkit prompt
    pub auth_timeout_secs: u64,
    pub simulation: bool,
    pub verbose: bool,
    pub json_logs: bool,
}

impl Default for AppConfig {
    fn default() -> Self {
        let state_dir = if nix::unistd::Uid::effective().is_root() {
            PathBuf::from(SYSTEM_STATE_DIR)
        } else {
            dirs::data_local_dir()
                .map(|d| d.join("keepd"))
                .unwrap_or_else(|| PathBuf::from(SYSTEM_STATE_DIR))
        };

        Self {
            state_dir,
            engine_path: None,
            rpc_bind: SocketAddr::from(([127, 0, 0, 1], 7878)),
            poll_interval_ms: 2000,
            probe_interval_secs: 30,
            auth_timeout_secs: 120,
            simulation: false,
            verbose: false,
            json_logs: false,
        }
    }
}

impl AppConfig {
    /// Load configuration: defaults, then config files, then `KEEPD_*`
    /// environment variables, then command-line overrides.
    pub fn new<T: Serialize>(overrides: Option<&T>) -> Result<Self> {
        Self::figment(&config_files(), overrides)
            .extract()
            .context("Failed to load configuration")
    }

    pub fn figment<T: Serialize>(files: &[PathBuf], overrides: Option<&T>) -> Figment {
        let mut figment = Figment::from(Serialized::defaults(AppConfig::default()));
        for file in files {
            figment = figment.merge(Toml::file(file));
        }
        figment = figment.merge(Env::prefixed("KEEPD_"));
        if let Some(overrides) = overrides {
            figment = figment.merge(Serialized::defaults(overrides));
        }
        figment
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(100))
    }

    pub fn probe_interval(&self) -> Duration {
        Duration::from_secs(self.probe_interval_secs.max(1))
    }

    pub fn auth_timeout(&self) -> Duration {
        Duration::from_secs(self.auth_timeout_secs.max(1))
    }

    pub fn trust_store_path(&self) -> PathBuf {
        self.state_dir.join("trust-store.json")
    }

    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).context("Failed to serialize config")
    }
}

fn config_files() -> Vec<PathBuf> {
    let mut files = vec![PathBuf::from(SYSTEM_CONFIG_PATH)];
    if let Some(dir) = dirs::config_dir() {
        let user = dir.join("keepd").join("config.toml");
        if user != Path::new(SYSTEM_CONFIG_PATH) {
            files.push(user);
        }
    }
    files
}

use std::sync::Arc;

use anyhow::Result;

use crate::config::AppConfig;
use crate::core::hardware::HardwareAdapter;
use crate::core::{
    CapabilityProbe, DeviceEnumerator, DriveLocks, RunTable, SecretCache, SecretMode, TrustStore,
};

/// Shared daemon state. Cheap to clone; every orchestrator holds one.
#[derive(Clone)]
pub struct AppContext {
    pub config: Arc<AppConfig>,
    pub adapter: Arc<dyn HardwareAdapter>,
    pub devices: Arc<DeviceEnumerator>,
    pub probe: Arc<CapabilityProbe>,
    pub store: Arc<TrustStore>,
    pub secrets: SecretCache,
    pub locks: DriveLocks,
    pub runs: RunTable,
}

impl AppContext {
    pub fn new(config: AppConfig, adapter: Arc<dyn HardwareAdapter>) -> Result<Self> {
        let store = TrustStore::load(&config.trust_store_path())?;

        let secrets = SecretCache::new();
        for drive in store.list() {
            secrets.set_mode(
                &drive.drive_id,
                SecretMode::from_flags(drive.remember_passphrase, drive.paranoid_mode),
            );
        }

        Ok(Self {
            devices: Arc::new(DeviceEnumerator::new(adapter.clone())),
            probe: Arc::new(CapabilityProbe::new(adapter.clone(), config.engine_path.clone())),
            config: Arc::new(config),
            adapter,
            store: Arc::new(store),
            secrets,
            locks: DriveLocks::new(),
            runs: RunTable::new(),
        })
    }
}

//! RPC method handlers.
//!
//! Dispatches JSON-RPC method calls to the core services. Params may carry
//! passphrases, so they are never logged.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use crate::context::AppContext;
use crate::core::{
    BackupOrchestrator, BackupPolicy, BackupSource, DiskOrchestrator, DriveManager, Passphrase,
    RetentionPolicy, SetupRequest, StatusAggregator, StatusSnapshot, SupportedFilesystem,
};
use crate::error::DriveError;

use super::protocol::{Request, Response};

/// Phrase a client must send to erase a device.
pub const FORMAT_CONFIRMATION: &str = "ERASE";

/// Handles RPC method dispatch and execution.
pub struct MethodHandler {
    ctx: AppContext,
    drives: DriveManager,
    disks: DiskOrchestrator,
    backups: Arc<BackupOrchestrator>,
    status: StatusAggregator,
    start_time: Instant,
}

fn parse<T: DeserializeOwned>(params: Value) -> Result<T, String> {
    // Methods without required params accept a missing params member
    let params = if params.is_null() {
        Value::Object(Default::default())
    } else {
        params
    };
    serde_json::from_value(params).map_err(|e| e.to_string())
}

macro_rules! params {
    ($id:expr, $params:expr) => {
        match parse($params) {
            Ok(p) => p,
            Err(e) => return Response::invalid_params($id, e),
        }
    };
}

#[derive(Deserialize)]
struct DriveParams {
    drive_id: String,
    #[serde(default)]
    passphrase: Option<String>,
}

#[derive(Deserialize)]
struct DevnodeParams {
    devnode: PathBuf,
}

impl MethodHandler {
    pub fn new(ctx: AppContext, backups: Arc<BackupOrchestrator>) -> Self {
        Self {
            drives: DriveManager::new(ctx.clone()),
            disks: DiskOrchestrator::new(ctx.clone()),
            status: StatusAggregator::new(ctx.clone()),
            backups,
            ctx,
            start_time: Instant::now(),
        }
    }

    /// Handle an RPC request and return a response.
    pub async fn handle(&self, request: Request) -> Response {
        let id = request.id.clone().unwrap_or(Value::Null);
        let params = request.params.unwrap_or(Value::Null);
        debug!(method = %request.method, "RPC call");

        match request.method.as_str() {
            "daemon.status" => self.daemon_status(id).await,
            "devices.list" => self.devices_list(id, params).await,
            "preflight" => Response::success(id, self.ctx.probe.refresh().await),
            "config.update" => self.config_update(id, params).await,
            "drives.setup" => self.drives_setup(id, params).await,
            "drives.update" => self.drives_update(id, params).await,
            "drives.security" => self.drives_security(id, params).await,
            "drives.discontinue" => self.drives_discontinue(id, params).await,
            "drives.mount" => self.drives_mount(id, params).await,
            "drives.unmount" => self.drives_unmount(id, params).await,
            "drives.eject" => self.drives_eject(id, params).await,
            "drives.format" => self.drives_format(id, params).await,
            "drives.recovery_kit" => self.drives_recovery_kit(id, params).await,
            "backup.start" => self.backup_start(id, params).await,
            "snapshots.list" => self.snapshots_list(id, params).await,
            "snapshots.stats" => self.snapshots_stats(id, params).await,
            "snapshots.restore" => self.snapshots_restore(id, params).await,
            _ => Response::method_not_found(id, &request.method),
        }
    }

    /// Full status plus daemon health information.
    async fn daemon_status(&self, id: Value) -> Response {
        #[derive(Serialize)]
        struct DaemonStatus {
            uptime_secs: u64,
            rpc_bind: String,
            simulation: bool,
            #[serde(flatten)]
            status: StatusSnapshot,
        }

        Response::success(
            id,
            DaemonStatus {
                uptime_secs: self.start_time.elapsed().as_secs(),
                rpc_bind: self.ctx.config.rpc_bind.to_string(),
                simulation: self.ctx.config.simulation,
                status: self.status.snapshot().await,
            },
        )
    }

    async fn devices_list(&self, id: Value, params: Value) -> Response {
        #[derive(Deserialize)]
        struct Params {
            #[serde(default)]
            refresh: bool,
        }
        let params: Params = params!(id, params);

        let snapshot = if params.refresh {
            self.ctx.devices.refresh().await
        } else {
            self.ctx.devices.current()
        };
        Response::success(id, &*snapshot)
    }

    /// Merge the given fields into the global backup policy.
    async fn config_update(&self, id: Value, params: Value) -> Response {
        #[derive(Deserialize)]
        struct Params {
            default_sources: Option<Vec<BackupSource>>,
            include_patterns: Option<Vec<String>>,
            exclude_patterns: Option<Vec<String>>,
            retention: Option<RetentionPolicy>,
            verify_quick: Option<bool>,
            verify_deep: Option<bool>,
        }
        let params: Params = params!(id, params);

        let current = self.ctx.store.policy();
        let policy = BackupPolicy {
            default_sources: params.default_sources.unwrap_or(current.default_sources),
            include_patterns: params.include_patterns.unwrap_or(current.include_patterns),
            exclude_patterns: params.exclude_patterns.unwrap_or(current.exclude_patterns),
            retention: params.retention.unwrap_or(current.retention),
            verify_quick: params.verify_quick.unwrap_or(current.verify_quick),
            verify_deep: params.verify_deep.unwrap_or(current.verify_deep),
        };
        Response::from_result(id, self.drives.set_policy(policy).await)
    }

    async fn drives_setup(&self, id: Value, params: Value) -> Response {
        #[derive(Deserialize)]
        struct Params {
            mount_path: PathBuf,
            #[serde(default)]
            label: Option<String>,
            #[serde(default)]
            backup_sources: Vec<BackupSource>,
            passphrase: String,
            #[serde(default)]
            remember_passphrase: bool,
            #[serde(default)]
            paranoid_mode: bool,
        }
        let params: Params = params!(id, params);

        let request = SetupRequest {
            mount_path: params.mount_path,
            label: params.label,
            backup_sources: params.backup_sources,
            passphrase: Passphrase::from(params.passphrase),
            remember_passphrase: params.remember_passphrase,
            paranoid_mode: params.paranoid_mode,
        };
        Response::from_result(id, self.drives.setup(request).await)
    }

    async fn drives_update(&self, id: Value, params: Value) -> Response {
        #[derive(Deserialize)]
        struct Params {
            drive_id: String,
            #[serde(default)]
            label: Option<String>,
            #[serde(default)]
            backup_sources: Option<Vec<BackupSource>>,
        }
        let params: Params = params!(id, params);

        Response::from_result(
            id,
            self.drives
                .update(&params.drive_id, params.label, params.backup_sources)
                .await,
        )
    }

    async fn drives_security(&self, id: Value, params: Value) -> Response {
        #[derive(Deserialize)]
        struct Params {
            drive_id: String,
            remember_passphrase: bool,
            #[serde(default)]
            paranoid_mode: bool,
        }
        let params: Params = params!(id, params);

        Response::from_result(
            id,
            self.drives
                .set_security(&params.drive_id, params.remember_passphrase, params.paranoid_mode)
                .await,
        )
    }

    async fn drives_discontinue(&self, id: Value, params: Value) -> Response {
        #[derive(Deserialize)]
        struct Params {
            drive_id: String,
            confirm_label: String,
            #[serde(default)]
            wipe: bool,
        }
        let params: Params = params!(id, params);

        Response::from_result(
            id,
            self.drives
                .discontinue(&params.drive_id, &params.confirm_label, params.wipe)
                .await,
        )
    }

    async fn drives_mount(&self, id: Value, params: Value) -> Response {
        #[derive(Serialize)]
        struct Mounted {
            mount_path: PathBuf,
        }
        let params: DevnodeParams = params!(id, params);

        let result = self
            .disks
            .mount(&params.devnode)
            .await
            .map(|mount_path| Mounted { mount_path });
        Response::from_result(id, result)
    }

    async fn drives_unmount(&self, id: Value, params: Value) -> Response {
        let params: DevnodeParams = params!(id, params);
        Response::from_result(id, self.disks.unmount(&params.devnode).await)
    }

    async fn drives_eject(&self, id: Value, params: Value) -> Response {
        #[derive(Deserialize)]
        struct Params {
            mount_path: PathBuf,
        }
        let params: Params = params!(id, params);
        Response::from_result(id, self.disks.eject(&params.mount_path).await)
    }

    async fn drives_format(&self, id: Value, params: Value) -> Response {
        #[derive(Deserialize)]
        struct Params {
            devnode: PathBuf,
            #[serde(default)]
            label: Option<String>,
            #[serde(default)]
            filesystem: SupportedFilesystem,
            #[serde(default)]
            confirm: String,
        }
        let params: Params = params!(id, params);

        if params.confirm != FORMAT_CONFIRMATION {
            let err = DriveError::InvalidInput(format!(
                "formatting erases the device; send confirm \"{}\"",
                FORMAT_CONFIRMATION
            ));
            return Response::domain_error(id, &err);
        }
        Response::from_result(
            id,
            self.disks
                .format(&params.devnode, params.label.as_deref(), params.filesystem)
                .await,
        )
    }

    async fn drives_recovery_kit(&self, id: Value, params: Value) -> Response {
        #[derive(Deserialize)]
        struct Params {
            drive_id: String,
            destination: PathBuf,
        }
        #[derive(Serialize)]
        struct Exported {
            files: Vec<PathBuf>,
        }
        let params: Params = params!(id, params);

        let result = self
            .drives
            .export_recovery_kit(&params.drive_id, &params.destination)
            .await
            .map(|files| Exported { files });
        Response::from_result(id, result)
    }

    async fn backup_start(&self, id: Value, params: Value) -> Response {
        let params: DriveParams = params!(id, params);
        let passphrase = params.passphrase.map(Passphrase::from);
        Response::from_result(id, self.backups.start(&params.drive_id, passphrase).await)
    }

    async fn snapshots_list(&self, id: Value, params: Value) -> Response {
        let params: DriveParams = params!(id, params);
        let passphrase = params.passphrase.map(Passphrase::from);
        Response::from_result(id, self.backups.snapshots(&params.drive_id, passphrase).await)
    }

    async fn snapshots_stats(&self, id: Value, params: Value) -> Response {
        #[derive(Deserialize)]
        struct Params {
            drive_id: String,
            #[serde(default)]
            snapshot_id: Option<String>,
            #[serde(default)]
            passphrase: Option<String>,
        }
        let params: Params = params!(id, params);

        let passphrase = params.passphrase.map(Passphrase::from);
        Response::from_result(
            id,
            self.backups
                .stats(&params.drive_id, params.snapshot_id.as_deref(), passphrase)
                .await,
        )
    }

    async fn snapshots_restore(&self, id: Value, params: Value) -> Response {
        #[derive(Deserialize)]
        struct Params {
            drive_id: String,
            snapshot_id: String,
            target: PathBuf,
            #[serde(default)]
            include_paths: Vec<String>,
            #[serde(default)]
            passphrase: Option<String>,
        }
        let params: Params = params!(id, params);

        let passphrase = params.passphrase.map(Passphrase::from);
        Response::from_result(
            id,
            self.backups
                .restore(
                    &params.drive_id,
                    &params.snapshot_id,
                    &params.target,
                    &params.include_paths,
                    passphrase,
                )
                .await,
        )
    }
}

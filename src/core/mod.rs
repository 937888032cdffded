pub mod devices;
pub mod disks;
pub mod drives;
pub mod engine;
pub mod hardware;
pub mod home;
pub mod locks;
pub mod marker;
pub mod models;
pub mod orchestrator;
pub mod persist;
pub mod probe;
pub mod progress;
pub mod recovery;
pub mod retention;
pub mod secrets;
pub mod status;
pub mod trust_store;

pub use devices::DeviceEnumerator;
pub use disks::{DiskOrchestrator, FormatOutcome};
pub use drives::{DiscontinueOutcome, DriveManager, SetupRequest};
pub use engine::{Engine, EngineError, RepoStats, Snapshot};
pub use hardware::{HardwareAdapter, SupportedFilesystem, ToolFailure, ToolFailureKind};
pub use locks::{DriveGuard, DriveLocks};
pub use marker::DriveMarker;
pub use models::{
    BackupPolicy, BackupProgress, BackupRun, BackupSource, Device, DeviceSnapshot, Partition,
    RunOutcome, RunPhase, RunStatus, StatusSnapshot, TrustedDrive, TrustedDriveView,
};
pub use orchestrator::{BackupOrchestrator, Started};
pub use probe::{CapabilityProbe, HostTools, PreflightCapabilities};
pub use progress::RunTable;
pub use recovery::RecoveryKit;
pub use retention::RetentionPolicy;
pub use secrets::{Passphrase, SecretCache, SecretMode};
pub use status::StatusAggregator;
pub use trust_store::TrustStore;

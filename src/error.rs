//! Domain error taxonomy shared by the orchestrators and the RPC layer.

use serde::Serialize;
use thiserror::Error;

/// Errors surfaced by drive, disk and backup operations.
///
/// Each variant maps to a stable [`ErrorKind`] so clients can branch on the
/// failure without parsing the message.
#[derive(Debug, Error)]
pub enum DriveError {
    #[error("authorization required: {0}")]
    AuthorizationRequired(String),

    #[error("required tool missing: {0}")]
    ToolMissing(String),

    #[error("drive is not trusted: {0}")]
    NotTrusted(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("confirmation label does not match")]
    LabelMismatch,

    #[error("drive is already trusted: {0}")]
    AlreadyTrusted(String),

    #[error("an operation is already running for drive {0}")]
    AlreadyRunning(String),

    #[error("drive is not connected: {0}")]
    NotConnected(String),

    #[error("authentication failed: {0}")]
    AuthFailed(String),

    #[error("backup engine is unavailable")]
    EngineUnavailable,

    #[error("failed to initialize repository: {0}")]
    EngineInitFailed(String),

    #[error("invalid mount path: {0}")]
    InvalidMount(String),

    #[error("partition is already mounted but its mount point is unknown: {0}")]
    AlreadyMounted(String),

    #[error("partition has no filesystem: {0}")]
    NoFilesystem(String),

    #[error("device is not removable: {0}")]
    NotRemovable(String),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("trust removed, but wiping the drive failed: {0}")]
    WipeFailed(String),

    #[error("I/O failure: {0}")]
    IoFailure(String),

    #[error("{0}")]
    Failed(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    AuthorizationRequired,
    ToolMissing,
    NotTrusted,
    NotFound,
    LabelMismatch,
    AlreadyTrusted,
    AlreadyRunning,
    NotConnected,
    AuthFailed,
    EngineUnavailable,
    EngineInitFailed,
    InvalidMount,
    AlreadyMounted,
    NoFilesystem,
    NotRemovable,
    InvalidInput,
    WipeFailed,
    IoFailure,
    Failed,
}

impl DriveError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::AuthorizationRequired(_) => ErrorKind::AuthorizationRequired,
            Self::ToolMissing(_) => ErrorKind::ToolMissing,
            Self::NotTrusted(_) => ErrorKind::NotTrusted,
            Self::NotFound(_) => ErrorKind::NotFound,
            Self::LabelMismatch => ErrorKind::LabelMismatch,
            Self::AlreadyTrusted(_) => ErrorKind::AlreadyTrusted,
            Self::AlreadyRunning(_) => ErrorKind::AlreadyRunning,
            Self::NotConnected(_) => ErrorKind::NotConnected,
            Self::AuthFailed(_) => ErrorKind::AuthFailed,
            Self::EngineUnavailable => ErrorKind::EngineUnavailable,
            Self::EngineInitFailed(_) => ErrorKind::EngineInitFailed,
            Self::InvalidMount(_) => ErrorKind::InvalidMount,
            Self::AlreadyMounted(_) => ErrorKind::AlreadyMounted,
            Self::NoFilesystem(_) => ErrorKind::NoFilesystem,
            Self::NotRemovable(_) => ErrorKind::NotRemovable,
            Self::InvalidInput(_) => ErrorKind::InvalidInput,
            Self::WipeFailed(_) => ErrorKind::WipeFailed,
            Self::IoFailure(_) => ErrorKind::IoFailure,
            Self::Failed(_) => ErrorKind::Failed,
        }
    }

    /// JSON-RPC application error code for this error.
    pub fn code(&self) -> i32 {
        -32001 - self.kind() as i32
    }
}

impl From<std::io::Error> for DriveError {
    fn from(e: std::io::Error) -> Self {
        Self::IoFailure(e.to_string())
    }
}

pub type DriveResult<T> = Result<T, DriveError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_serializes_snake_case() {
        let json = serde_json::to_string(&DriveError::AlreadyRunning("d1".into()).kind()).unwrap();
        assert_eq!(json, r#""already_running""#);
    }

    #[test]
    fn codes_are_distinct_application_codes() {
        let a = DriveError::AuthorizationRequired(String::new()).code();
        let b = DriveError::ToolMissing(String::new()).code();
        assert_eq!(a, -32001);
        assert_eq!(b, -32002);
        assert!(DriveError::Failed(String::new()).code() > -32100);
    }

    #[test]
    fn wipe_failure_mentions_removed_trust() {
        let msg = DriveError::WipeFailed("device gone".into()).to_string();
        assert!(msg.contains("trust removed"));
    }
}

use std::path::PathBuf;

use super::status;

/// Failures that stop a sandboxed run before (or instead of) the target
/// program producing its own exit status.
#[derive(Debug, thiserror::Error)]
pub enum SandboxError {
    /// A path that must be exposed does not exist on the host.
    #[error("path {} does not exist on the host", .0.display())]
    InvalidPath(PathBuf),

    /// Two mutually exclusive modes were requested at once.
    #[error("conflicting options: {0}")]
    ConflictingMode(String),

    /// A nested display server or audio endpoint never became ready.
    #[error("auxiliary service failed to start: {0}")]
    AuxiliaryServiceStart(String),

    /// The restricted-execution binary cannot be located or executed.
    #[error("sandbox backend {0:?} is not available")]
    BackendUnavailable(String),

    /// A command-line value did not match the expected syntax.
    #[error("{0}")]
    InvalidArgument(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl SandboxError {
    /// Exit code reported to the caller for this failure class.
    pub fn exit_code(&self) -> i32 {
        match self {
            SandboxError::ConflictingMode(_) | SandboxError::InvalidArgument(_) => {
                status::USAGE_ERROR
            }
            SandboxError::InvalidPath(_) => status::MISSING_PATH,
            SandboxError::AuxiliaryServiceStart(_) => status::SERVICE_UNAVAILABLE,
            SandboxError::BackendUnavailable(_) => status::BACKEND_UNAVAILABLE,
            SandboxError::Io(_) => status::GENERAL_FAILURE,
        }
    }
}

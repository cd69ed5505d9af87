use crate::types::EXIT_FAILURE;
use crate::workspace::WorkspaceError;

#[derive(Debug, thiserror::Error)]
pub enum RunnerError {
    #[error("config error: {0}")]
    Config(String),

    #[error("sandbox error: {0}")]
    Sandbox(#[from] sandbox::SandboxError),

    #[error("workspace error: {0}")]
    Workspace(#[from] WorkspaceError),

    #[error("cancelled")]
    Cancelled,

    #[error("internal error: {0}")]
    Internal(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl RunnerError {
    /// Result code reported to the caller when a job ends with this error.
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Sandbox(e) => e.exit_code(),
            _ => EXIT_FAILURE,
        }
    }
}

pub type RunnerResult<T> = Result<T, RunnerError>;

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use sandbox::SandboxError;

    use super::*;
    use crate::types::EXIT_REJECTED;

    #[test]
    fn sandbox_errors_keep_their_code() {
        assert_eq!(RunnerError::from(SandboxError::Busy).exit_code(), EXIT_REJECTED);
        assert_eq!(
            RunnerError::from(SandboxError::SpawnFailed("enoent".into())).exit_code(),
            EXIT_REJECTED
        );
    }

    #[test]
    fn other_errors_are_failures() {
        assert_eq!(RunnerError::Cancelled.exit_code(), EXIT_FAILURE);
        assert_eq!(
            RunnerError::from(WorkspaceError::SourceMissing(PathBuf::from("/p"))).exit_code(),
            EXIT_FAILURE
        );
    }
}

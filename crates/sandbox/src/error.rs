/// Exit code reserved for "rejected": busy, invalid request, or sandbox not ready.
pub const BUSY_EXIT_CODE: i32 = 255;

#[derive(Debug, thiserror::Error)]
pub enum SandboxError {
    #[error("a sandboxed process is already running")]
    Busy,

    #[error("backend not available: {0}")]
    BackendNotAvailable(String),

    #[error("spawn failed: {0}")]
    SpawnFailed(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl SandboxError {
    /// Synthetic exit code reported to callers in place of a real process status.
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Busy | Self::BackendNotAvailable(_) | Self::SpawnFailed(_) => BUSY_EXIT_CODE,
            Self::Io(_) => 1,
        }
    }
}

pub type Result<T> = std::result::Result<T, SandboxError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejection_errors_use_reserved_code() {
        assert_eq!(SandboxError::Busy.exit_code(), BUSY_EXIT_CODE);
        assert_eq!(
            SandboxError::SpawnFailed("missing".into()).exit_code(),
            BUSY_EXIT_CODE
        );
        assert_eq!(
            SandboxError::BackendNotAvailable("no rootfs".into()).exit_code(),
            BUSY_EXIT_CODE
        );
    }

    #[test]
    fn io_error_is_plain_failure() {
        let err = SandboxError::from(std::io::Error::other("pipe"));
        assert_eq!(err.exit_code(), 1);
        assert!(err.to_string().contains("pipe"));
    }
}

use std::os::unix::fs::PermissionsExt;
use std::path::Path;

use sandbox::SandboxError;

use crate::config::ProotConfig;

/// Verify that the sandbox executable is present before building the sandbox.
///
/// The rootfs itself is not checked here: it may be installed later, and a
/// missing rootfs is reported per command via [`sandbox::Sandbox::is_ready`].
/// Collects all failures and returns them in a single `BackendNotAvailable` error.
pub fn check_prerequisites(config: &ProotConfig) -> Result<(), SandboxError> {
    let mut errors = Vec::new();

    check_file_exists(&config.binary_path, "sandbox executable", &mut errors);
    check_executable(&config.binary_path, "sandbox executable", &mut errors);

    if errors.is_empty() {
        Ok(())
    } else {
        Err(SandboxError::BackendNotAvailable(errors.join("; ")))
    }
}

fn check_file_exists(path: &Path, label: &str, errors: &mut Vec<String>) {
    if !path.is_file() {
        errors.push(format!("{label} not found: {}", path.display()));
    }
}

fn check_executable(path: &Path, label: &str, errors: &mut Vec<String>) {
    if let Ok(meta) = path.metadata()
        && meta.permissions().mode() & 0o111 == 0
    {
        errors.push(format!("{label} is not executable: {}", path.display()));
    }
}

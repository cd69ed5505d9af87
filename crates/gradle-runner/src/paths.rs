use std::path::PathBuf;

/// Paths inside the sandbox root (must match rootfs layout).
pub mod guest {
    pub const BASH: &str = "/bin/bash";
    /// Mount point of the workspace inside the sandbox.
    pub const PROJECT_DIR: &str = "/project";
    /// `java.io.tmpdir` for Gradle; the default `/tmp` is not usable under the sandbox.
    pub const GRADLE_TMP_DIR: &str = "/alt-tmp";
}

/// Runner-level paths derived from the base directory.
pub struct RunnerPaths {
    base_dir: PathBuf,
}

impl RunnerPaths {
    pub fn new(base_dir: PathBuf) -> Self {
        Self { base_dir }
    }

    pub fn workspaces(&self) -> PathBuf {
        self.base_dir.join("workspaces")
    }

    pub fn status(&self) -> PathBuf {
        self.base_dir.join("status.json")
    }

    pub fn lock(&self) -> PathBuf {
        self.base_dir.join("runner.lock")
    }
}

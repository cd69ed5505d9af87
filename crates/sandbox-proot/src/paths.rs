use std::path::{Path, PathBuf};

/// Name of the newline-delimited default environment file inside the rootfs.
pub const DEFAULT_ENV_FILE: &str = "env";

/// Marker written by the rootfs installer once extraction has finished.
pub const READY_MARKER: &str = ".ready";

/// Helper binaries shipped in the host's native-library directory.
pub struct LoaderPaths {
    dir: PathBuf,
}

impl LoaderPaths {
    pub fn new(dir: PathBuf) -> Self {
        Self { dir }
    }

    pub fn proot(&self) -> PathBuf {
        self.dir.join("libproot.so")
    }

    pub fn loader(&self) -> PathBuf {
        self.dir.join("libproot-loader.so")
    }

    pub fn loader_32(&self) -> PathBuf {
        self.dir.join("libproot-loader32.so")
    }
}

/// Well-known files inside the sandbox root.
pub struct RootfsPaths {
    root: PathBuf,
}

impl RootfsPaths {
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn env_file(&self) -> PathBuf {
        self.root.join(DEFAULT_ENV_FILE)
    }

    pub fn ready_marker(&self) -> PathBuf {
        self.root.join(READY_MARKER)
    }
}

/// Host-side runtime paths derived from the base directory.
pub struct HostPaths {
    base_dir: PathBuf,
}

impl HostPaths {
    pub fn new(base_dir: PathBuf) -> Self {
        Self { base_dir }
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    /// Scratch directory handed to the sandbox executable.
    pub fn tmp_dir(&self) -> PathBuf {
        self.base_dir.join("proot-tmp")
    }
}

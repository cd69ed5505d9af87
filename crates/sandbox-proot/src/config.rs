use std::path::PathBuf;

#[derive(Debug, Clone)]
pub struct ProotConfig {
    /// The sandbox executable. Usually `<loader_dir>/libproot.so`.
    pub binary_path: PathBuf,
    /// Host directory holding the loader helper binaries.
    pub loader_dir: PathBuf,
    /// Root filesystem remapped as `/` for the child process.
    pub rootfs_path: PathBuf,
    /// Base directory for runtime data (scratch dir). Also the host working
    /// directory of the sandbox executable.
    pub base_dir: PathBuf,
}

impl ProotConfig {
    /// Config using the sandbox executable shipped in `loader_dir`.
    pub fn with_bundled_binary(loader_dir: PathBuf, rootfs_path: PathBuf, base_dir: PathBuf) -> Self {
        let binary_path = crate::paths::LoaderPaths::new(loader_dir.clone()).proot();
        Self {
            binary_path,
            loader_dir,
            rootfs_path,
            base_dir,
        }
    }
}

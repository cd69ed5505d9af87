//! Detection and repair of the AAPT2 daemon startup failure.
//!
//! The Android Gradle plugin ships its own `aapt2` binary inside
//! `aapt2-<version>-linux.jar`. That binary cannot start its daemon inside the
//! sandbox. The repair swaps it for the `aapt2` installed in the sandbox root,
//! using `jar -u` to update each archive in place.

use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use regex::Regex;
use walkdir::WalkDir;

use crate::paths::guest;
use crate::shell;

#[allow(clippy::expect_used)]
static DAEMON_STARTUP_FAILURE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"AAPT2 aapt2.*Daemon startup failed").expect("valid daemon failure regex")
});

#[allow(clippy::expect_used)]
static AAPT2_JAR: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^aapt2-.*-linux\.jar$").expect("valid aapt2 jar regex"));

/// Whether `stderr` shows the bundled AAPT2 failing to start its daemon.
pub fn is_daemon_startup_failure(stderr: &str) -> bool {
    DAEMON_STARTUP_FAILURE.is_match(stderr)
}

/// AAPT2 archives under `root`, as paths relative to `root`, in sorted order.
pub fn find_aapt2_jars(root: &Path) -> Vec<PathBuf> {
    let mut jars: Vec<PathBuf> = WalkDir::new(root)
        .follow_links(false)
        .into_iter()
        .filter_map(Result::ok)
        .filter(|entry| entry.file_type().is_file())
        .filter(|entry| AAPT2_JAR.is_match(&entry.file_name().to_string_lossy()))
        .filter_map(|entry| entry.path().strip_prefix(root).ok().map(Path::to_path_buf))
        .collect();
    jars.sort();
    jars
}

/// Shell command that replaces `aapt2` inside the archive at `relative`
/// (relative to the workspace) with the sandbox's own `aapt2`.
pub fn patch_command(relative: &Path) -> String {
    let jar = Path::new(guest::PROJECT_DIR).join(relative);
    format!(
        "jar -u -f {} -C \"$(dirname \"$(which aapt2)\")\" aapt2",
        shell::quote(&jar.to_string_lossy())
    )
}

//! Hash-keyed private copies of external build directories.
//!
//! Each workspace lives at `<root>/<key>` where `key` is derived from the
//! absolute path of `<project>/<build_dir>`. A copy is populated once and
//! reused as-is by later builds; it is never refreshed from the source.
//!
//! Population happens in a staging directory and the metadata file is written
//! last, right before the staging directory is renamed into place. A workspace
//! is therefore only visible once it is complete, and a failed copy never
//! leaves behind something that a later `resolve` would mistake for a finished
//! one.

use std::ffi::OsString;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};
use walkdir::WalkDir;

/// Metadata file written inside every complete workspace.
pub const METADATA_FILE: &str = ".workspace-info.json";

/// Prefix of in-progress copies under the cache root.
const STAGING_PREFIX: &str = ".staging-";

/// Hex characters kept from the SHA-256 digest.
const KEY_LEN: usize = 16;

#[derive(Debug, thiserror::Error)]
pub enum WorkspaceError {
    #[error("source directory not found: {}", .0.display())]
    SourceMissing(PathBuf),

    #[error("copy {}: {source}", path.display())]
    Copy { path: PathBuf, source: io::Error },

    #[error("metadata {}: {reason}", path.display())]
    Metadata { path: PathBuf, reason: String },

    #[error("workspace task failed: {0}")]
    Task(String),

    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

/// Identifies which external build directory a workspace mirrors.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkspaceInfo {
    pub project_path: PathBuf,
    pub build_dir: String,
}

impl WorkspaceInfo {
    /// Display name: the last component of the project path.
    pub fn project_name(&self) -> String {
        self.project_path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| self.project_path.display().to_string())
    }
}

/// An entry found by [`WorkspaceCache::list_all`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachedWorkspace {
    pub dir: PathBuf,
    pub info: WorkspaceInfo,
}

/// Result of [`WorkspaceCache::resolve`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedWorkspace {
    pub dir: PathBuf,
    /// `true` if this call populated the workspace, `false` if it was reused.
    pub copied: bool,
}

/// Deterministic workspace key for `<project_path>/<build_dir>`.
pub fn workspace_key(project_path: &Path, build_dir: &str) -> String {
    let full = project_path.join(build_dir);
    let full = std::path::absolute(&full).unwrap_or(full);

    let mut hasher = Sha256::new();
    hasher.update(full.as_os_str().as_encoded_bytes());
    let mut key = format!("{:x}", hasher.finalize());
    key.truncate(KEY_LEN);
    key
}

pub struct WorkspaceCache {
    root: PathBuf,
}

impl WorkspaceCache {
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn workspace_dir(&self, project_path: &Path, build_dir: &str) -> PathBuf {
        self.root.join(workspace_key(project_path, build_dir))
    }

    /// Return the workspace for `<project_path>/<build_dir>`, copying it on first use.
    ///
    /// A copy failure aborts immediately and removes the partial copy.
    pub async fn resolve(
        &self,
        project_path: &Path,
        build_dir: &str,
    ) -> Result<ResolvedWorkspace, WorkspaceError> {
        let dir = self.workspace_dir(project_path, build_dir);
        let info = WorkspaceInfo {
            project_path: project_path.to_path_buf(),
            build_dir: build_dir.to_string(),
        };
        tokio::task::spawn_blocking(move || resolve_blocking(dir, &info))
            .await
            .map_err(|e| WorkspaceError::Task(e.to_string()))?
    }

    /// Delete the workspace for `<project_path>/<build_dir>` if present.
    ///
    /// Returns `true` if anything was removed.
    pub async fn clean(&self, project_path: &Path, build_dir: &str) -> Result<bool, WorkspaceError> {
        let dir = self.workspace_dir(project_path, build_dir);
        tokio::task::spawn_blocking(move || clean_blocking(&dir))
            .await
            .map_err(|e| WorkspaceError::Task(e.to_string()))?
    }

    /// All complete workspaces, sorted by project name.
    ///
    /// Entries without readable metadata are skipped.
    pub fn list_all(&self) -> Result<Vec<CachedWorkspace>, WorkspaceError> {
        let entries = match fs::read_dir(&self.root) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut workspaces: Vec<CachedWorkspace> = entries
            .filter_map(Result::ok)
            .filter(|entry| entry.file_type().is_ok_and(|t| t.is_dir()))
            .filter(|entry| !entry.file_name().to_string_lossy().starts_with('.'))
            .filter_map(|entry| {
                let dir = entry.path();
                read_info(&dir).map(|info| CachedWorkspace { dir, info })
            })
            .collect();
        workspaces.sort_by_key(|w| w.info.project_name());
        Ok(workspaces)
    }
}

/// Total size in bytes of regular files under `dir`. Symlinks are not followed
/// or counted.
pub fn size_of(dir: &Path) -> u64 {
    WalkDir::new(dir)
        .follow_links(false)
        .into_iter()
        .filter_map(Result::ok)
        .filter(|entry| entry.file_type().is_file())
        .filter_map(|entry| entry.metadata().ok())
        .map(|meta| meta.len())
        .sum()
}

/// Human-readable size, e.g. `512 B`, `1.5 KB`, `2.0 GB`.
pub fn format_size(bytes: u64) -> String {
    let mut size = bytes as f64;
    let mut unit = "B";
    for next in ["KB", "MB", "GB", "TB"] {
        if size < 1024.0 {
            break;
        }
        size /= 1024.0;
        unit = next;
    }
    if unit == "B" {
        format!("{bytes} B")
    } else {
        format!("{size:.1} {unit}")
    }
}

/// In-progress copy for `workspace`, a sibling under the cache root.
fn staging_dir(workspace: &Path) -> PathBuf {
    let mut name = OsString::from(STAGING_PREFIX);
    name.push(workspace.file_name().unwrap_or_default());
    workspace.with_file_name(name)
}

fn resolve_blocking(dir: PathBuf, info: &WorkspaceInfo) -> Result<ResolvedWorkspace, WorkspaceError> {
    if read_info(&dir).is_some() {
        debug!(workspace = %dir.display(), "reusing workspace");
        return Ok(ResolvedWorkspace { dir, copied: false });
    }
    if dir.exists() {
        warn!(workspace = %dir.display(), "workspace has no metadata, copying again");
        fs::remove_dir_all(&dir)?;
    }

    let source = info.project_path.join(&info.build_dir);
    if !source.is_dir() {
        return Err(WorkspaceError::SourceMissing(source));
    }

    if let Some(root) = dir.parent() {
        fs::create_dir_all(root)?;
    }
    let staging = staging_dir(&dir);
    if staging.exists() {
        fs::remove_dir_all(&staging)?;
    }

    info!(source = %source.display(), workspace = %dir.display(), "copying build directory");
    let populated = copy_tree(&source, &staging)
        .and_then(|()| write_info(&staging, info))
        .and_then(|()| fs::rename(&staging, &dir).map_err(WorkspaceError::from));
    if let Err(e) = populated {
        if let Err(cleanup) = fs::remove_dir_all(&staging) {
            warn!(staging = %staging.display(), error = %cleanup, "failed to remove partial copy");
        }
        return Err(e);
    }

    Ok(ResolvedWorkspace { dir, copied: true })
}

fn clean_blocking(workspace: &Path) -> Result<bool, WorkspaceError> {
    let mut removed = false;
    for dir in [workspace.to_path_buf(), staging_dir(workspace)] {
        match fs::remove_dir_all(&dir) {
            Ok(()) => {
                info!(workspace = %dir.display(), "removed workspace");
                removed = true;
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
    }
    Ok(removed)
}

/// Recursively copy `source` into `dest`, stopping at the first failure.
///
/// Symlinks are recreated rather than followed.
fn copy_tree(source: &Path, dest: &Path) -> Result<(), WorkspaceError> {
    for entry in WalkDir::new(source).follow_links(false) {
        let entry = entry.map_err(|e| WorkspaceError::Copy {
            path: e.path().unwrap_or(source).to_path_buf(),
            source: e.into(),
        })?;
        let path = entry.path();
        let relative = path.strip_prefix(source).map_err(|e| WorkspaceError::Copy {
            path: path.to_path_buf(),
            source: io::Error::other(e),
        })?;
        let target = dest.join(relative);

        let file_type = entry.file_type();
        let copied = if file_type.is_dir() {
            fs::create_dir_all(&target)
        } else if file_type.is_symlink() {
            fs::read_link(path).and_then(|link| std::os::unix::fs::symlink(link, &target))
        } else {
            fs::copy(path, &target).map(|_| ())
        };
        copied.map_err(|e| WorkspaceError::Copy {
            path: path.to_path_buf(),
            source: e,
        })?;
    }
    Ok(())
}

fn write_info(dir: &Path, info: &WorkspaceInfo) -> Result<(), WorkspaceError> {
    let path = dir.join(METADATA_FILE);
    let json = serde_json::to_string_pretty(info).map_err(|e| WorkspaceError::Metadata {
        path: path.clone(),
        reason: e.to_string(),
    })?;
    fs::write(&path, json).map_err(|e| WorkspaceError::Metadata {
        path,
        reason: e.to_string(),
    })
}

fn read_info(dir: &Path) -> Option<WorkspaceInfo> {
    let content = fs::read_to_string(dir.join(METADATA_FILE)).ok()?;
    serde_json::from_str(&content).ok()
}

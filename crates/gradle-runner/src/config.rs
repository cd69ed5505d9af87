use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{RunnerError, RunnerResult};
use crate::executor::OrchestratorConfig;

/// File name used by [`generate`].
pub const CONFIG_FILE: &str = "runner.yaml";

#[derive(Debug, PartialEq, Serialize, Deserialize)]
pub struct RunnerConfig {
    /// Holds `workspaces/`, `proot-tmp/`, `status.json` and `runner.lock`.
    pub base_dir: PathBuf,
    pub proot: ProotConfig,
    /// Public documents directory bound into every build.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub documents_dir: Option<PathBuf>,
    #[serde(default)]
    pub workspace: WorkspaceConfig,
}

#[derive(Debug, PartialEq, Serialize, Deserialize)]
pub struct ProotConfig {
    /// Native-library directory holding the sandbox executable and its loaders.
    pub loader_dir: PathBuf,
    /// Overrides `<loader_dir>/libproot.so`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub binary: Option<PathBuf>,
    pub rootfs: PathBuf,
}

#[derive(Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkspaceConfig {
    /// Delete a project's workspace when the caller asks for cleanup after a build.
    pub clear_after_build: bool,
}

/// Load a runner config from a YAML file.
///
/// Relative paths in the config are resolved against the config file's parent
/// directory. The rootfs is not required to exist yet: a missing rootfs is
/// reported per job.
pub async fn load(path: &Path) -> RunnerResult<RunnerConfig> {
    let content = tokio::fs::read_to_string(path)
        .await
        .map_err(|e| RunnerError::Config(format!("read {}: {e}", path.display())))?;
    let mut config: RunnerConfig = serde_yaml_ng::from_str(&content)
        .map_err(|e| RunnerError::Config(format!("parse {}: {e}", path.display())))?;
    if let Some(config_dir) = path.parent() {
        config.resolve_relative_paths(config_dir);
    }
    check_dir_exists(&config.proot.loader_dir, "proot.loader_dir").await?;
    Ok(config)
}

/// Write `config` to `<base_dir>/runner.yaml` and return the file path.
pub async fn generate(config: &RunnerConfig) -> RunnerResult<PathBuf> {
    let base_dir = &config.base_dir;
    tokio::fs::create_dir_all(base_dir)
        .await
        .map_err(|e| RunnerError::Config(format!("create {}: {e}", base_dir.display())))?;

    let content = serde_yaml_ng::to_string(config)
        .map_err(|e| RunnerError::Config(format!("serialize config: {e}")))?;

    let config_path = base_dir.join(CONFIG_FILE);
    tokio::fs::write(&config_path, content)
        .await
        .map_err(|e| RunnerError::Config(format!("write {}: {e}", config_path.display())))?;
    Ok(config_path)
}

async fn check_dir_exists(path: &Path, label: &str) -> RunnerResult<()> {
    let exists = tokio::fs::try_exists(path)
        .await
        .map_err(|e| RunnerError::Config(format!("check {label}: {e}")))?;
    if !exists {
        return Err(RunnerError::Config(format!(
            "{label} not found: {}",
            path.display()
        )));
    }
    Ok(())
}

impl RunnerConfig {
    /// Resolve relative paths against `config_dir` (the directory containing the YAML file).
    fn resolve_relative_paths(&mut self, config_dir: &Path) {
        let resolve = |p: &mut PathBuf| {
            if p.is_relative() {
                *p = config_dir.join(&*p);
            }
        };
        resolve(&mut self.base_dir);
        resolve(&mut self.proot.loader_dir);
        resolve(&mut self.proot.rootfs);
        if let Some(binary) = &mut self.proot.binary {
            resolve(binary);
        }
        if let Some(documents) = &mut self.documents_dir {
            resolve(documents);
        }
    }

    /// Build a `sandbox_proot::ProotConfig` from this runner config.
    pub fn proot_config(&self) -> sandbox_proot::ProotConfig {
        let mut config = sandbox_proot::ProotConfig::with_bundled_binary(
            self.proot.loader_dir.clone(),
            self.proot.rootfs.clone(),
            self.base_dir.clone(),
        );
        if let Some(binary) = &self.proot.binary {
            config.binary_path = binary.clone();
        }
        config
    }

    pub fn orchestrator_config(&self) -> OrchestratorConfig {
        OrchestratorConfig {
            documents_dir: self.documents_dir.clone(),
            clear_after_build: self.workspace.clear_after_build,
        }
    }
}

use std::path::PathBuf;
use std::process::ExitCode;

use clap::Args;
use tracing::info;

use crate::config::{self, ProotConfig, RunnerConfig, WorkspaceConfig};
use crate::error::RunnerResult;

#[derive(Args)]
pub struct InitArgs {
    /// Directory for workspaces, scratch files, status and the lock file.
    #[arg(long)]
    base_dir: PathBuf,
    /// Directory holding libproot.so and its loader helpers.
    #[arg(long)]
    loader_dir: PathBuf,
    /// Sandbox root filesystem.
    #[arg(long)]
    rootfs: PathBuf,
    /// Sandbox executable, if not `<loader-dir>/libproot.so`.
    #[arg(long)]
    binary: Option<PathBuf>,
    /// Public documents directory bound into builds.
    #[arg(long)]
    documents_dir: Option<PathBuf>,
    /// Let CleanWorkspace delete workspaces without `--force`.
    #[arg(long)]
    clear_after_build: bool,
}

/// Write `<base-dir>/runner.yaml` from the given flags.
pub async fn run_init(args: InitArgs) -> RunnerResult<ExitCode> {
    let config = RunnerConfig {
        base_dir: args.base_dir,
        proot: ProotConfig {
            loader_dir: args.loader_dir,
            binary: args.binary,
            rootfs: args.rootfs,
        },
        documents_dir: args.documents_dir,
        workspace: WorkspaceConfig {
            clear_after_build: args.clear_after_build,
        },
    };
    let path = config::generate(&config).await?;
    info!(path = %path.display(), "config written");
    println!("{}", path.display());
    Ok(ExitCode::SUCCESS)
}

mod build;
mod init;
mod list;
mod serve;

use std::fs::File;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use clap::Args;
use nix::fcntl::Flock;
use sandbox_proot::ProotSandbox;
use tokio::task::JoinHandle;
use tracing::info;

use crate::config;
use crate::error::{RunnerError, RunnerResult};
use crate::executor::BuildOrchestrator;
use crate::lock;
use crate::paths::RunnerPaths;
use crate::queue::JobQueue;
use crate::status::StatusTracker;
use crate::workspace::WorkspaceCache;

pub use build::{BuildArgs, CleanArgs, run_build, run_clean};
pub use init::{InitArgs, run_init};
pub use list::{ListArgs, run_list};
pub use serve::{ServeArgs, run_serve};

/// Location of the runner config, shared by every command that needs one.
#[derive(Args)]
pub struct ConfigArgs {
    /// Path to the runner YAML config.
    #[arg(long, env = "GRADLE_RUNNER_CONFIG")]
    pub config: PathBuf,
}

/// A started runner: host lock held, sandbox probed, worker running.
pub(crate) struct Runtime {
    pub queue: Arc<JobQueue>,
    worker: JoinHandle<()>,
    _lock: Flock<File>,
}

impl Runtime {
    pub async fn start(config_path: &Path) -> RunnerResult<Self> {
        let config = config::load(config_path).await?;
        tokio::fs::create_dir_all(&config.base_dir).await?;
        let paths = RunnerPaths::new(config.base_dir.clone());

        let lock = lock::try_acquire(paths.lock()).await?;

        let sandbox = ProotSandbox::new(config.proot_config()).await?;
        let orchestrator = BuildOrchestrator::new(
            Arc::new(sandbox),
            WorkspaceCache::new(paths.workspaces()),
            config.orchestrator_config(),
        );

        let status = Arc::new(StatusTracker::new(paths.status()));
        status.write_initial().await;

        let queue = JobQueue::new(Arc::new(orchestrator), Some(status));
        let worker = queue.spawn_worker();
        info!(base_dir = %config.base_dir.display(), "runner started");

        Ok(Self {
            queue,
            worker,
            _lock: lock,
        })
    }

    /// Stop accepting jobs and wait for the queue to drain.
    pub async fn shutdown(self) -> RunnerResult<()> {
        self.queue.close().await;
        self.worker
            .await
            .map_err(|e| RunnerError::Internal(format!("worker task: {e}")))?;
        info!("runner stopped");
        Ok(())
    }
}

/// Process exit status for a job result code.
pub(crate) fn exit_code(code: i32) -> ExitCode {
    match u8::try_from(code) {
        Ok(code) => ExitCode::from(code),
        Err(_) => ExitCode::FAILURE,
    }
}

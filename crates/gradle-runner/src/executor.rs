use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use sandbox::{ExecRequest, OutputSink, OutputTag, Sandbox};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::{RunnerError, RunnerResult};
use crate::paths::guest;
use crate::queue::JobRunner;
use crate::recovery;
use crate::shell;
use crate::types::{BuildSpec, CleanSpec, EXIT_FAILURE, EXIT_REJECTED, EXIT_SUCCESS, JobKind};
use crate::workspace::WorkspaceCache;

/// Gradle may exit 0 after a failed build; this stderr marker overrides the code.
const BUILD_FAILED_MARKER: &str = "BUILD FAILED";
const NO_DAEMON_FLAG: &str = "--no-daemon";

const ROOTFS_NOT_READY: &str =
    "Rootfs isn't installed. Install it in the Gradle Build Environment before building.";
const RECOVERY_NOTICE: &str = "> Detected AAPT2 issue - attempting to patch the JAR files...";
const RETRY_NOTICE: &str = "> Retrying Gradle build...";
const CANCELLED_NOTICE: &str = "> Build cancelled";

pub struct OrchestratorConfig {
    /// Bound at its own path so builds can reach user projects.
    pub documents_dir: Option<PathBuf>,
    /// Whether CleanWorkspace deletes without `force_clean`.
    pub clear_after_build: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuildPhase {
    WorkspaceResolving,
    Running,
    RecoveryPatching,
    Retrying,
}

impl fmt::Display for BuildPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::WorkspaceResolving => f.write_str("workspace-resolving"),
            Self::Running => f.write_str("running"),
            Self::RecoveryPatching => f.write_str("recovery-patching"),
            Self::Retrying => f.write_str("retrying"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Classification {
    Success,
    Failure,
    /// Failed with the AAPT2 daemon signature; a patch-and-retry may fix it.
    SandboxRecoverableFailure,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BuildOutcome {
    pub exit_code: i32,
    pub classification: Classification,
}

/// Classify one Gradle run from its exit code and captured stderr.
pub fn classify(exit_code: i32, stderr: &str) -> BuildOutcome {
    let exit_code = if exit_code == EXIT_SUCCESS && stderr.contains(BUILD_FAILED_MARKER) {
        EXIT_FAILURE
    } else {
        exit_code
    };
    let classification = if exit_code == EXIT_SUCCESS {
        Classification::Success
    } else if recovery::is_daemon_startup_failure(stderr) {
        Classification::SandboxRecoverableFailure
    } else {
        Classification::Failure
    };
    BuildOutcome {
        exit_code,
        classification,
    }
}

/// Shell command running the Gradle wrapper with `args`, always non-daemon.
pub fn gradle_command(args: &[String]) -> String {
    let mut command = String::from("bash gradlew");
    if !args.is_empty() {
        command.push(' ');
        command.push_str(&shell::join(args));
    }
    if !args.iter().any(|a| a == NO_DAEMON_FLAG) {
        command.push(' ');
        command.push_str(NO_DAEMON_FLAG);
    }
    command
}

/// Forwards every line and keeps a private copy of stderr for classification.
struct StderrCapture {
    inner: Arc<dyn OutputSink>,
    stderr: Mutex<String>,
}

impl StderrCapture {
    fn new(inner: Arc<dyn OutputSink>) -> Self {
        Self {
            inner,
            stderr: Mutex::new(String::new()),
        }
    }

    fn take(&self) -> String {
        std::mem::take(&mut *self.stderr.lock().unwrap_or_else(PoisonError::into_inner))
    }
}

impl OutputSink for StderrCapture {
    fn line(&self, tag: OutputTag, text: &str) {
        if tag == OutputTag::Stderr {
            let mut stderr = self.stderr.lock().unwrap_or_else(PoisonError::into_inner);
            stderr.push_str(text);
            stderr.push('\n');
        }
        self.inner.line(tag, text);
    }
}

/// Drives builds and workspace cleanup against one sandbox.
pub struct BuildOrchestrator {
    sandbox: Arc<dyn Sandbox>,
    cache: WorkspaceCache,
    config: OrchestratorConfig,
}

impl BuildOrchestrator {
    pub fn new(sandbox: Arc<dyn Sandbox>, cache: WorkspaceCache, config: OrchestratorConfig) -> Self {
        Self {
            sandbox,
            cache,
            config,
        }
    }

    /// Run one Gradle build and return its result code.
    ///
    /// At most one recovery cycle is attempted: patch every AAPT2 archive in
    /// the workspace, then re-run the build once.
    pub async fn run_build(
        &self,
        spec: &BuildSpec,
        sink: Arc<dyn OutputSink>,
        cancel: &CancellationToken,
    ) -> i32 {
        if !self.sandbox.is_ready() {
            warn!("sandbox root is not installed");
            sink.line(OutputTag::Stderr, ROOTFS_NOT_READY);
            return EXIT_REJECTED;
        }

        match self.build_with_recovery(spec, &sink, cancel).await {
            Ok(code) => code,
            Err(RunnerError::Cancelled) => {
                info!("build cancelled between steps");
                sink.line(OutputTag::Info, CANCELLED_NOTICE);
                EXIT_FAILURE
            }
            Err(e) => {
                error!(error = %e, "build failed to run");
                sink.line(OutputTag::Stderr, &e.to_string());
                e.exit_code()
            }
        }
    }

    async fn build_with_recovery(
        &self,
        spec: &BuildSpec,
        sink: &Arc<dyn OutputSink>,
        cancel: &CancellationToken,
    ) -> RunnerResult<i32> {
        check_cancelled(cancel)?;
        debug!(
            phase = %BuildPhase::WorkspaceResolving,
            project = %spec.project_path.display(),
            "resolving workspace"
        );
        let workspace = self
            .cache
            .resolve(&spec.project_path, &spec.build_dir)
            .await?;
        if workspace.copied {
            info!(workspace = %workspace.dir.display(), "workspace created");
        }

        let command = gradle_command(&spec.args);
        let first = self
            .run_gradle(BuildPhase::Running, &command, &workspace.dir, sink, cancel)
            .await?;
        if first.classification != Classification::SandboxRecoverableFailure || cancel.is_cancelled()
        {
            return Ok(first.exit_code);
        }

        info!(phase = %BuildPhase::RecoveryPatching, "AAPT2 daemon startup failure detected");
        sink.line(OutputTag::Info, RECOVERY_NOTICE);
        let root = workspace.dir.clone();
        let jars = tokio::task::spawn_blocking(move || recovery::find_aapt2_jars(&root))
            .await
            .map_err(|e| RunnerError::Internal(format!("jar scan: {e}")))?;
        for jar in &jars {
            let code = self.patch_jar(jar, &workspace.dir, sink, cancel).await?;
            if code != EXIT_SUCCESS {
                warn!(jar = %jar.display(), exit_code = code, "jar patch failed, not retrying");
                return Ok(code);
            }
        }

        sink.line(OutputTag::Info, RETRY_NOTICE);
        let retry = self
            .run_gradle(BuildPhase::Retrying, &command, &workspace.dir, sink, cancel)
            .await?;
        Ok(retry.exit_code)
    }

    async fn run_gradle(
        &self,
        phase: BuildPhase,
        command: &str,
        workspace: &Path,
        sink: &Arc<dyn OutputSink>,
        cancel: &CancellationToken,
    ) -> RunnerResult<BuildOutcome> {
        check_cancelled(cancel)?;

        let mut binds = Vec::with_capacity(2);
        if let Some(documents) = &self.config.documents_dir {
            binds.push(documents.display().to_string());
        }
        binds.push(project_bind(workspace));
        let args = ["-c".to_string(), command.to_string()];
        let gradle_opts = format!("-Djava.io.tmpdir={}", guest::GRADLE_TMP_DIR);
        let env = [("GRADLE_OPTS", gradle_opts.as_str())];

        let capture = Arc::new(StderrCapture::new(Arc::clone(sink)));
        let exit_code = self
            .sandbox
            .execute(
                &ExecRequest {
                    program: guest::BASH,
                    args: &args,
                    binds: &binds,
                    work_dir: guest::PROJECT_DIR,
                    env: &env,
                },
                capture.clone(),
            )
            .await?;

        let outcome = classify(exit_code, &capture.take());
        info!(
            %phase,
            exit_code = outcome.exit_code,
            classification = ?outcome.classification,
            "gradle finished"
        );
        Ok(outcome)
    }

    async fn patch_jar(
        &self,
        jar: &Path,
        workspace: &Path,
        sink: &Arc<dyn OutputSink>,
        cancel: &CancellationToken,
    ) -> RunnerResult<i32> {
        check_cancelled(cancel)?;
        debug!(jar = %jar.display(), "patching aapt2 archive");

        let args = ["-c".to_string(), recovery::patch_command(jar)];
        let binds = [project_bind(workspace)];
        let code = self
            .sandbox
            .execute(
                &ExecRequest {
                    program: guest::BASH,
                    args: &args,
                    binds: &binds,
                    work_dir: guest::PROJECT_DIR,
                    env: &[],
                },
                Arc::clone(sink),
            )
            .await?;
        Ok(code)
    }

    /// Delete the project's workspace if the policy allows it.
    ///
    /// Without `force_clean` the workspace is kept unless
    /// `clear_after_build` is set; that case still reports success.
    pub async fn clean(&self, spec: &CleanSpec, sink: &dyn OutputSink) -> i32 {
        if !(spec.force_clean || self.config.clear_after_build) {
            debug!(project = %spec.project_path.display(), "keeping workspace");
            return EXIT_SUCCESS;
        }
        match self.cache.clean(&spec.project_path, &spec.build_dir).await {
            Ok(removed) => {
                info!(project = %spec.project_path.display(), removed, "workspace cleaned");
                EXIT_SUCCESS
            }
            Err(e) => {
                error!(error = %e, "workspace cleanup failed");
                sink.line(OutputTag::Stderr, &e.to_string());
                EXIT_FAILURE
            }
        }
    }
}

#[async_trait]
impl JobRunner for BuildOrchestrator {
    async fn run(&self, kind: &JobKind, sink: Arc<dyn OutputSink>, cancel: CancellationToken) -> i32 {
        match kind {
            JobKind::RunBuild(spec) => self.run_build(spec, sink, &cancel).await,
            JobKind::CleanWorkspace(spec) => self.clean(spec, sink.as_ref()).await,
        }
    }

    fn kill(&self) {
        if !self.sandbox.is_running() {
            debug!("no sandboxed process to kill");
            return;
        }
        self.sandbox.kill();
    }
}

fn project_bind(workspace: &Path) -> String {
    format!("{}:{}", workspace.display(), guest::PROJECT_DIR)
}

fn check_cancelled(cancel: &CancellationToken) -> RunnerResult<()> {
    if cancel.is_cancelled() {
        return Err(RunnerError::Cancelled);
    }
    Ok(())
}

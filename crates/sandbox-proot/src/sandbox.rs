use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use sandbox::{ExecRequest, OutputSink, OutputTag, Sandbox, SandboxError};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::command::CommandSpec;
use crate::config::ProotConfig;
use crate::paths::{HostPaths, LoaderPaths, RootfsPaths};
use crate::process;

/// Grace period between SIGTERM and SIGKILL when a run is killed.
const KILL_GRACE: Duration = Duration::from_millis(500);

const ENV_TMP_DIR: &str = "PROOT_TMP_DIR";
const ENV_LOADER: &str = "PROOT_LOADER";
const ENV_LOADER_32: &str = "PROOT_LOADER_32";

/// Supervises at most one sandboxed process at a time.
pub struct ProotSandbox {
    config: ProotConfig,
    rootfs: RootfsPaths,
    loaders: LoaderPaths,
    host: HostPaths,
    /// Contents of `<rootfs>/env`, read once at construction.
    default_env: Vec<String>,
    running: AtomicBool,
    /// Kill switch for the current run. Cleared by `kill()` or when the run ends.
    kill_tx: Mutex<Option<oneshot::Sender<()>>>,
}

/// Releases the run slot when `execute` returns, however it returns.
struct RunGuard<'a> {
    sandbox: &'a ProotSandbox,
}

impl Drop for RunGuard<'_> {
    fn drop(&mut self) {
        self.sandbox.kill_slot().take();
        self.sandbox.running.store(false, Ordering::Release);
    }
}

impl ProotSandbox {
    /// Check prerequisites and load the default environment.
    ///
    /// A missing `<rootfs>/env` is not fatal: the default environment is empty.
    pub async fn new(config: ProotConfig) -> sandbox::Result<Self> {
        crate::prerequisites::check_prerequisites(&config)?;

        let rootfs = RootfsPaths::new(config.rootfs_path.clone());
        let default_env = match tokio::fs::read_to_string(rootfs.env_file()).await {
            Ok(content) => parse_env_file(&content),
            Err(e) => {
                info!(
                    path = %rootfs.env_file().display(),
                    error = %e,
                    "unable to read default environment"
                );
                Vec::new()
            }
        };

        Ok(Self {
            loaders: LoaderPaths::new(config.loader_dir.clone()),
            host: HostPaths::new(config.base_dir.clone()),
            rootfs,
            default_env,
            config,
            running: AtomicBool::new(false),
            kill_tx: Mutex::new(None),
        })
    }

    pub fn default_env(&self) -> &[String] {
        &self.default_env
    }

    fn kill_slot(&self) -> MutexGuard<'_, Option<oneshot::Sender<()>>> {
        self.kill_tx.lock().unwrap_or_else(PoisonError::into_inner)
    }

    async fn run(
        &self,
        request: &ExecRequest<'_>,
        sink: Arc<dyn OutputSink>,
        mut kill_rx: oneshot::Receiver<()>,
    ) -> sandbox::Result<i32> {
        let tmp_dir = self.host.tmp_dir();
        tokio::fs::create_dir_all(&tmp_dir).await?;

        let spec = CommandSpec::build(
            &self.config.binary_path,
            self.rootfs.root(),
            &self.default_env,
            request,
        );
        info!(command = %spec.display(), "exec");

        let mut child = tokio::process::Command::new(&spec.program)
            .args(&spec.args)
            .current_dir(self.host.base_dir())
            .env(ENV_TMP_DIR, &tmp_dir)
            .env(ENV_LOADER, self.loaders.loader())
            .env(ENV_LOADER_32, self.loaders.loader_32())
            .stdin(std::process::Stdio::null())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .process_group(0)
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                SandboxError::SpawnFailed(format!("{}: {e}", spec.program.display()))
            })?;

        let stdout = spawn_reader(child.stdout.take(), OutputTag::Stdout, Arc::clone(&sink));
        let stderr = spawn_reader(child.stderr.take(), OutputTag::Stderr, sink);

        // Both streams must reach end-of-stream before the exit code is collected.
        let drained = async {
            let _ = tokio::join!(stdout, stderr);
        };
        tokio::pin!(drained);

        let mut killed = false;
        tokio::select! {
            () = &mut drained => {}
            Ok(()) = &mut kill_rx => {
                info!("terminating sandboxed process");
                process::terminate(&mut child, KILL_GRACE).await;
                killed = true;
                drained.await;
            }
        }

        // The child may close both pipes and keep running; a kill must still reach it.
        if !killed {
            let kill_requested = tokio::select! {
                status = child.wait() => {
                    status?;
                    false
                }
                Ok(()) = &mut kill_rx => true,
            };
            if kill_requested {
                info!("terminating sandboxed process");
                process::terminate(&mut child, KILL_GRACE).await;
            }
        }

        let status = child.wait().await?;
        self.kill_slot().take();

        let code = process::exit_code(status);
        info!(exit_code = code, "sandboxed process exited");
        Ok(code)
    }
}

#[async_trait]
impl Sandbox for ProotSandbox {
    fn is_ready(&self) -> bool {
        self.rootfs.ready_marker().exists()
    }

    async fn execute(
        &self,
        request: &ExecRequest<'_>,
        sink: Arc<dyn OutputSink>,
    ) -> sandbox::Result<i32> {
        if self
            .running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            error!("cannot run a new process while one is already running");
            return Err(SandboxError::Busy);
        }

        let (kill_tx, kill_rx) = oneshot::channel();
        *self.kill_slot() = Some(kill_tx);
        let _guard = RunGuard { sandbox: self };

        self.run(request, sink, kill_rx).await
    }

    fn kill(&self) {
        match self.kill_slot().take() {
            Some(tx) => {
                info!("kill requested");
                let _ = tx.send(());
            }
            None => debug!("kill requested with no running process"),
        }
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }
}

/// Parse the newline-delimited default environment, dropping blank lines.
fn parse_env_file(content: &str) -> Vec<String> {
    content
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(str::to_string)
        .collect()
}

/// Forward each line of `stream` to `sink` until end-of-stream.
///
/// Lines are decoded lossily so that a stray invalid byte never stops the
/// pipe from being drained.
fn spawn_reader<R>(stream: Option<R>, tag: OutputTag, sink: Arc<dyn OutputSink>) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let Some(stream) = stream else {
            return;
        };
        let mut reader = BufReader::new(stream);
        let mut buf = Vec::new();
        loop {
            buf.clear();
            match reader.read_until(b'\n', &mut buf).await {
                Ok(0) => break,
                Ok(_) => {
                    let line = String::from_utf8_lossy(&buf);
                    let line = line.trim_end_matches(['\n', '\r']);
                    debug!(stream = %tag, "{line}");
                    sink.line(tag, line);
                }
                Err(e) => {
                    warn!(stream = %tag, error = %e, "error reading stream");
                    break;
                }
            }
        }
    })
}

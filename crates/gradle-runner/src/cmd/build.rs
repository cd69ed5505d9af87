use std::path::PathBuf;
use std::process::ExitCode;

use clap::Args;
use tokio::sync::mpsc;
use tracing::{info, warn};

use super::{ConfigArgs, Runtime, exit_code};
use crate::error::{RunnerError, RunnerResult};
use crate::types::{BuildSpec, CleanSpec, JobId, JobKind, LineTag, Response};

/// Job id used for one-shot CLI jobs.
const CLI_JOB_ID: JobId = 1;

#[derive(Args)]
pub struct BuildArgs {
    #[command(flatten)]
    config: ConfigArgs,
    /// Project directory on the host.
    #[arg(long)]
    project: PathBuf,
    /// Gradle build directory, relative to the project.
    #[arg(long, default_value = "android/build")]
    build_dir: String,
    /// Arguments for the Gradle wrapper.
    #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
    gradle_args: Vec<String>,
}

#[derive(Args)]
pub struct CleanArgs {
    #[command(flatten)]
    config: ConfigArgs,
    #[arg(long)]
    project: PathBuf,
    #[arg(long, default_value = "android/build")]
    build_dir: String,
    /// Delete even when `workspace.clear_after_build` is off.
    #[arg(long)]
    force: bool,
}

pub async fn run_build(args: BuildArgs) -> RunnerResult<ExitCode> {
    let kind = JobKind::RunBuild(BuildSpec {
        args: args.gradle_args,
        project_path: args.project,
        build_dir: args.build_dir,
    });
    run_one(&args.config.config, kind).await
}

pub async fn run_clean(args: CleanArgs) -> RunnerResult<ExitCode> {
    let kind = JobKind::CleanWorkspace(CleanSpec {
        project_path: args.project,
        build_dir: args.build_dir,
        force_clean: args.force,
    });
    run_one(&args.config.config, kind).await
}

/// Run a single job, printing its output, and exit with its result code.
///
/// Ctrl-C cancels the job; the job still reports its own result.
async fn run_one(config_path: &std::path::Path, kind: JobKind) -> RunnerResult<ExitCode> {
    let runtime = Runtime::start(config_path).await?;
    let (reply, mut responses) = mpsc::unbounded_channel();
    runtime.queue.enqueue(CLI_JOB_ID, kind, reply).await;

    let mut interrupted = false;
    let code = loop {
        tokio::select! {
            response = responses.recv() => match response {
                Some(Response::OutputLine { tag, text, .. }) => print_line(tag, &text),
                Some(Response::Result { exit_code, .. }) => break exit_code,
                None => {
                    return Err(RunnerError::Internal("job ended without a result".into()));
                }
            },
            signal = tokio::signal::ctrl_c(), if !interrupted => {
                interrupted = true;
                if let Err(e) = signal {
                    warn!(error = %e, "failed to listen for ctrl-c");
                    continue;
                }
                info!("interrupted, cancelling build");
                runtime.queue.cancel(CLI_JOB_ID).await;
            }
        }
    };

    runtime.shutdown().await?;
    Ok(exit_code(code))
}

fn print_line(tag: LineTag, text: &str) {
    match tag {
        LineTag::Stdout => println!("{text}"),
        LineTag::Info | LineTag::Stderr => eprintln!("{text}"),
    }
}

mod cmd;
mod config;
mod error;
mod executor;
mod lock;
mod paths;
mod queue;
mod recovery;
mod router;
mod shell;
mod status;
mod types;
mod workspace;

use std::fmt;
use std::process::ExitCode;
use std::time::Instant;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt::time::FormatTime;

struct Elapsed(Instant);

impl FormatTime for Elapsed {
    fn format_time(&self, w: &mut tracing_subscriber::fmt::format::Writer<'_>) -> fmt::Result {
        let d = self.0.elapsed();
        let total_secs = d.as_secs();
        let mins = total_secs / 60;
        let secs = total_secs % 60;
        let millis = d.subsec_millis();
        write!(w, "[{mins:02}:{secs:02}:{millis:03}]")
    }
}

#[derive(Parser)]
#[command(name = "gradle-runner", version)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Write a runner config file
    Init(cmd::InitArgs),
    /// Run one Gradle build in the sandbox and exit with its result code
    Build(cmd::BuildArgs),
    /// Delete a project's cached workspace (subject to clear_after_build)
    Clean(cmd::CleanArgs),
    /// List cached workspaces with their sizes
    List(cmd::ListArgs),
    /// Accept JSON-lines requests on stdin, answer on stdout
    Serve(cmd::ServeArgs),
}

#[tokio::main]
async fn main() -> ExitCode {
    // stdout carries build output and protocol messages; logs go to stderr.
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .with_timer(Elapsed(Instant::now()))
        .init();

    let cli = Cli::parse();

    let result = match cli.command {
        Command::Init(args) => cmd::run_init(args).await,
        Command::Build(args) => cmd::run_build(args).await,
        Command::Clean(args) => cmd::run_clean(args).await,
        Command::List(args) => cmd::run_list(args).await,
        Command::Serve(args) => cmd::run_serve(args).await,
    };

    match result {
        Ok(code) => code,
        Err(e) => {
            eprintln!("error: {e}");
            ExitCode::FAILURE
        }
    }
}

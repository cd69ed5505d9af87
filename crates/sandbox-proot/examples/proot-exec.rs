//! Run one command inside a proot sandbox and stream its output.
//!
//! ```text
//! cargo run -p sandbox-proot --example proot-exec -- \
//!     --loader-dir /data/app/lib --rootfs /data/rootfs --base-dir /tmp/proot \
//!     --bind /sdcard/Documents -- /bin/uname -a
//! ```

use std::fmt;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Instant;

use clap::Parser;
use sandbox::{ExecRequest, OutputSink, OutputTag, Sandbox};
use sandbox_proot::{ProotConfig, ProotSandbox};
use tracing_subscriber::fmt::time::FormatTime;

struct Elapsed(Instant);

impl FormatTime for Elapsed {
    fn format_time(&self, w: &mut tracing_subscriber::fmt::format::Writer<'_>) -> fmt::Result {
        let d = self.0.elapsed();
        write!(w, "[{:02}:{:02}:{:03}]", d.as_secs() / 60, d.as_secs() % 60, d.subsec_millis())
    }
}

#[derive(Parser)]
#[command(name = "proot-exec")]
struct Cli {
    /// Directory holding libproot.so and the loader helpers
    #[arg(long)]
    loader_dir: PathBuf,
    /// Sandbox root filesystem
    #[arg(long)]
    rootfs: PathBuf,
    /// Scratch directory for the sandbox
    #[arg(long)]
    base_dir: PathBuf,
    /// Host paths to bind, `host` or `host:guest`
    #[arg(long = "bind")]
    binds: Vec<String>,
    /// Working directory inside the sandbox
    #[arg(long, default_value = "/")]
    work_dir: String,
    /// Program and arguments to run
    #[arg(required = true, trailing_var_arg = true)]
    command: Vec<String>,
}

struct PrintSink;

impl OutputSink for PrintSink {
    fn line(&self, tag: OutputTag, text: &str) {
        match tag {
            OutputTag::Stdout => println!("{text}"),
            OutputTag::Info | OutputTag::Stderr => eprintln!("{text}"),
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_timer(Elapsed(Instant::now()))
        .init();

    let cli = Cli::parse();
    let Some((program, args)) = cli.command.split_first() else {
        eprintln!("error: no command given");
        return ExitCode::FAILURE;
    };

    let config = ProotConfig::with_bundled_binary(cli.loader_dir, cli.rootfs, cli.base_dir);
    let sandbox = match ProotSandbox::new(config).await {
        Ok(sandbox) => sandbox,
        Err(e) => {
            eprintln!("error: {e}");
            return ExitCode::FAILURE;
        }
    };
    if !sandbox.is_ready() {
        eprintln!("warning: rootfs has no ready marker");
    }

    let request = ExecRequest {
        program,
        args,
        binds: &cli.binds,
        work_dir: &cli.work_dir,
        env: &[],
    };
    match sandbox.execute(&request, Arc::new(PrintSink)).await {
        Ok(code) => ExitCode::from(u8::try_from(code).unwrap_or(1)),
        Err(e) => {
            eprintln!("error: {e}");
            ExitCode::from(u8::try_from(e.exit_code()).unwrap_or(1))
        }
    }
}

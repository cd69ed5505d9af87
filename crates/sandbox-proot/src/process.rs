use std::os::unix::process::ExitStatusExt;
use std::process::ExitStatus;
use std::time::Duration;

use nix::sys::signal::{Signal, killpg};
use nix::unistd::Pid;
use tracing::{info, warn};

/// Process group of `child`.
///
/// Requires the child to have been spawned with `process_group(0)` so that its
/// PGID equals its PID. `None` if the child has already been reaped or the PID
/// cannot be represented as `i32`.
pub(crate) fn process_group(child: &tokio::process::Child) -> Option<Pid> {
    child
        .id()
        .and_then(|pid| i32::try_from(pid).ok())
        .map(Pid::from_raw)
}

fn signal_group(pgid: Option<Pid>, signal: Signal) {
    if let Some(pgid) = pgid {
        let _ = killpg(pgid, signal);
    }
}

/// Gracefully stop the child's process group (SIGTERM → `grace` → SIGKILL).
///
/// The group is always sent a final SIGKILL so that descendants still holding
/// the output pipes do not outlive the leader.
pub(crate) async fn terminate(child: &mut tokio::process::Child, grace: Duration) {
    let pgid = process_group(child);
    signal_group(pgid, Signal::SIGTERM);

    match tokio::time::timeout(grace, child.wait()).await {
        Ok(Ok(status)) => {
            info!(code = exit_code(status), "sandboxed process stopped");
        }
        Ok(Err(e)) => {
            warn!(error = %e, "wait for sandboxed process failed");
        }
        Err(_) => {
            warn!("sandboxed process did not exit in time, sending SIGKILL");
        }
    }
    signal_group(pgid, Signal::SIGKILL);
}

/// Map a process status to a shell-style exit code (`128 + signal` when killed).
pub(crate) fn exit_code(status: ExitStatus) -> i32 {
    match status.code() {
        Some(code) => code,
        None => 128 + status.signal().unwrap_or(0),
    }
}

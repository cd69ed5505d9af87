use std::path::PathBuf;

use nix::errno::Errno;
use nix::fcntl::{Flock, FlockArg};

use crate::error::{RunnerError, RunnerResult};

/// Take the exclusive runner lock on `path` without waiting.
///
/// Only one runner may drive a sandbox root at a time; a second instance
/// fails immediately instead of queueing behind the first. The returned guard
/// holds the lock until dropped.
pub async fn try_acquire(path: PathBuf) -> RunnerResult<Flock<std::fs::File>> {
    tokio::task::spawn_blocking(move || {
        let file = std::fs::File::options()
            .create(true)
            .truncate(false)
            .read(true)
            .write(true)
            .open(&path)
            .map_err(|e| RunnerError::Internal(format!("open lock {}: {e}", path.display())))?;
        Flock::lock(file, FlockArg::LockExclusiveNonblock).map_err(|(_file, e)| {
            if e == Errno::EWOULDBLOCK {
                RunnerError::Internal(format!(
                    "another runner holds {}",
                    path.display()
                ))
            } else {
                RunnerError::Internal(format!("flock {}: {e}", path.display()))
            }
        })
    })
    .await
    .map_err(|e| RunnerError::Internal(format!("lock task: {e}")))?
}

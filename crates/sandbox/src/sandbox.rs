use std::sync::Arc;

use async_trait::async_trait;

use crate::error::Result;
use crate::types::{ExecRequest, OutputSink};

/// Runs commands inside an isolated root filesystem, one at a time.
#[async_trait]
pub trait Sandbox: Send + Sync {
    /// Whether the sandbox root is installed and usable.
    fn is_ready(&self) -> bool;

    /// Run a command to completion and return its exit code.
    ///
    /// Output lines are delivered to `sink` as they arrive. Fails with
    /// [`SandboxError::Busy`](crate::SandboxError::Busy) if another command
    /// is still in flight.
    async fn execute(&self, request: &ExecRequest<'_>, sink: Arc<dyn OutputSink>) -> Result<i32>;

    /// Terminate the in-flight command, if any. No-op otherwise.
    fn kill(&self);

    /// Whether a command is currently in flight.
    fn is_running(&self) -> bool;
}

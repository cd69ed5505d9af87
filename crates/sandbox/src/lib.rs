mod error;
mod sandbox;
mod types;

pub use error::{BUSY_EXIT_CODE, Result, SandboxError};
pub use sandbox::Sandbox;
pub use types::{ExecRequest, OutputSink, OutputTag};

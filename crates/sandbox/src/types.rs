use std::fmt;

/// Which channel an output line came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OutputTag {
    /// Messages produced by the orchestrator itself, not the child process.
    Info,
    Stdout,
    Stderr,
}

impl fmt::Display for OutputTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Info => f.write_str("info"),
            Self::Stdout => f.write_str("stdout"),
            Self::Stderr => f.write_str("stderr"),
        }
    }
}

/// Receives output lines as they are produced.
///
/// Called from background reader tasks, possibly from two streams at once,
/// so implementations must be thread-safe.
pub trait OutputSink: Send + Sync {
    fn line(&self, tag: OutputTag, text: &str);
}

/// A single command to run inside the sandbox.
pub struct ExecRequest<'a> {
    /// Executable path inside the sandbox root.
    pub program: &'a str,
    pub args: &'a [String],
    /// Bind mounts in `host` or `host:guest` form, applied in order.
    pub binds: &'a [String],
    /// Working directory, relative to the sandbox root.
    pub work_dir: &'a str,
    /// Layered on top of the sandbox's default environment.
    pub env: &'a [(&'a str, &'a str)],
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn output_tag_display() {
        assert_eq!(OutputTag::Info.to_string(), "info");
        assert_eq!(OutputTag::Stdout.to_string(), "stdout");
        assert_eq!(OutputTag::Stderr.to_string(), "stderr");
    }
}
